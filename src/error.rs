use std::fmt;

use thiserror::Error;

use crate::ObjectId;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a failure, used for warning records and for
/// mapping errors to process exit codes by command-line callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operating system or I/O failure.
    System,
    /// Recognized but unsupported PDF feature.
    Unsupported,
    /// Password authentication failed.
    Password,
    /// Recoverable syntactic or structural damage in the file.
    DamagedPdf,
    /// Page-tree specific problem.
    Pages,
    /// Type error at the object-model API.
    Object,
    /// Internal invariant broken.
    Internal,
    /// Caller API misuse.
    Usage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::System => "system",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Password => "password",
            ErrorKind::DamagedPdf => "damaged-pdf",
            ErrorKind::Pages => "pages",
            ErrorKind::Object => "object",
            ErrorKind::Internal => "internal",
            ErrorKind::Usage => "usage",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("xref error: {0}")]
    Xref(#[from] XrefError),
    #[error("invalid password")]
    InvalidPassword,
    #[error("decryption error: {0}")]
    Decryption(#[from] DecryptionError),
    #[error("pipeline error: {0}")]
    Pipeline(String),
    #[error("object ({}, {}) not found", .0 .0, .0 .1)]
    ObjectNotFound(ObjectId),
    #[error("missing xref entry")]
    MissingXrefEntry,
    #[error("reference cycle detected resolving object ({}, {})", .0 .0, .0 .1)]
    ReferenceCycle(ObjectId),
    #[error("byte offset {0} is outside the document")]
    InvalidOffset(usize),
    #[error("invalid stream: {0}")]
    InvalidStream(String),
    #[error("dictionary has no entry for {}", String::from_utf8_lossy(.0))]
    DictKey(Vec<u8>),
    #[error("expected {expected}, found {found}")]
    ObjectType {
        expected: &'static str,
        found: &'static str,
    },
    #[error("page tree error: {0}")]
    Pages(String),
    #[error("numeric cast failed: {0}")]
    NumericCast(String),
    #[error("too many warnings ({0}), treating the file as unrecoverable")]
    TooManyWarnings(usize),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid argument: {0}")]
    Usage(&'static str),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::System,
            Error::InvalidPassword | Error::Decryption(_) => ErrorKind::Password,
            Error::Parse(_)
            | Error::Xref(_)
            | Error::Pipeline(_)
            | Error::ObjectNotFound(_)
            | Error::MissingXrefEntry
            | Error::ReferenceCycle(_)
            | Error::InvalidOffset(_)
            | Error::InvalidStream(_)
            | Error::NumericCast(_)
            | Error::TooManyWarnings(_) => ErrorKind::DamagedPdf,
            Error::DictKey(_) | Error::ObjectType { .. } => ErrorKind::Object,
            Error::Pages(_) => ErrorKind::Pages,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Usage(_) => ErrorKind::Usage,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("file header is damaged or missing")]
    InvalidFileHeader,
    #[error("invalid object while parsing at offset {0}")]
    InvalidObject(usize),
    #[error("unexpected token \"{0}\" at offset {1}")]
    UnexpectedToken(String, usize),
    #[error("indirect object label mismatch")]
    ObjectIdMismatch,
    #[error("invalid trailer dictionary")]
    InvalidTrailer,
    #[error("invalid cross-reference section")]
    InvalidXref,
    #[error("bracket nesting exceeds the supported depth")]
    NestingLimit,
    #[error("trailing bytes after object")]
    TrailingGarbage,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XrefError {
    #[error("missing startxref or %%EOF")]
    Start,
    #[error("Prev entry points outside the file")]
    PrevStart,
    #[error("XRefStm entry points outside the file")]
    StreamStart,
    #[error("invalid xref stream")]
    Stream,
    #[error("cross-reference table could not be reconstructed")]
    Reconstruction,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("the /Encrypt dictionary is missing or malformed")]
    InvalidEncryptDictionary,
    #[error("unsupported encryption filter")]
    UnsupportedFilter,
    #[error("unsupported security handler revision")]
    UnsupportedRevision,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("missing required encryption entry {0}")]
    MissingEntry(&'static str),
    #[error("the document has no first /ID entry")]
    MissingFileId,
    #[error("invalid ciphertext: {0}")]
    InvalidCipherText(&'static str),
    #[error("invalid crypt filter")]
    InvalidCryptFilter,
}

/// A recorded, recoverable problem. Warnings accumulate on the document
/// while reading or writing and can be drained by the caller.
#[derive(Debug, Clone)]
pub struct Warning {
    pub kind: ErrorKind,
    /// Description of the object being processed, e.g. "object 12 0".
    pub object: String,
    /// Byte offset in the input, where known.
    pub offset: Option<usize>,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.object.is_empty() {
            write!(f, "{}: ", self.object)?;
        }
        if let Some(offset) = self.offset {
            write!(f, "offset {offset}: ")?;
        }
        f.write_str(&self.message)
    }
}

/// Warnings past this count abort processing with `Error::TooManyWarnings`.
pub const MAX_WARNINGS: usize = 1000;
