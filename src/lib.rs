//! A Rust library for reading, transforming, and writing PDF files at the
//! level of the file's object structure. It does not interpret page
//! content or render anything; it manipulates the bytes and object graph
//! of a PDF while preserving document semantics.
//!
//! Reading tolerates damage: a broken cross-reference table is rebuilt by
//! scanning, wrong stream lengths are repaired, and recoverable problems
//! accumulate as drainable warnings instead of failing the load. Writing
//! renumbers objects, re-applies or removes stream filters, encrypts with
//! any of the standard security handler revisions, and can produce
//! object streams and linearized output.
//!
//! ```no_run
//! use opdf::Document;
//!
//! # fn main() -> opdf::Result<()> {
//! let mut doc = Document::load("example.pdf")?;
//! let pages = doc.get_pages()?;
//! println!("{} pages", pages.len());
//! doc.save("out.pdf")?;
//! # Ok(())
//! # }
//! ```

pub mod content;
mod copier;
mod document;
pub mod encryption;
pub mod filters;
mod object;
mod object_stream;
mod pages;
mod parser;
pub mod pipeline;
mod reader;
mod tokenizer;
mod writer;
pub mod xref;

pub use copier::ForeignCopier;
pub use document::Document;
pub use encryption::{CryptMethod, EncryptionState, EncryptionVersion, Permissions};
pub use error::{DecryptionError, Error, ErrorKind, ParseError, Result, Warning, XrefError};
pub use filters::{DecodeLevel, FilterClass, StreamFilter};
pub use object::{
    decode_text_string, encode_text_string, Dictionary, Object, ObjectId, Real, Stream, StreamData, StreamProvider,
    StringFormat,
};
pub use object_stream::ObjectStream;
pub use tokenizer::{ByteCursor, Token, TokenKind, Tokenizer};
pub use writer::{EncryptionIntent, ObjectStreamMode, SaveOptions, StreamDataMode};

pub mod error;

/// Build a [`Dictionary`] from literal key/value pairs.
///
/// ```
/// use opdf::{dictionary, Object};
/// let dict = dictionary! {
///     "Type" => "Catalog",
///     "Pages" => Object::Reference((2, 0)),
/// };
/// assert!(dict.has_type(b"Catalog"));
/// ```
#[macro_export]
macro_rules! dictionary {
    () => {
        $crate::Dictionary::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut dict = $crate::Dictionary::new();
        $(
            dict.set($key, $value);
        )+
        dict
    }};
}
