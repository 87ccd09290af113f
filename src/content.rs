//! Content streams as operation lists, plus the concatenation,
//! normalization, and token-filter plumbing built on the tokenizer.

use log::warn;

use crate::error::ParseError;
use crate::parser::ObjectSource;
use crate::tokenizer::{ByteCursor, Token, TokenKind, Tokenizer};
use crate::writer::serialize;
use crate::{Dictionary, Document, Error, Object, ObjectId, Result, Stream, StringFormat};

/// One content-stream operation: operands in source order, then the
/// operator. Inline images are the operation `BI` with the image
/// dictionary and the raw data as operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub operator: String,
    pub operands: Vec<Object>,
}

impl Operation {
    pub fn new(operator: impl Into<String>, operands: Vec<Object>) -> Operation {
        Operation {
            operator: operator.into(),
            operands,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    pub operations: Vec<Operation>,
}

impl Content {
    /// Parse a decoded content stream into operations. Malformed operands
    /// end the parse with an error; unknown operators are kept as is.
    pub fn decode(data: &[u8]) -> Result<Content> {
        let mut operations = Vec::new();
        let mut operands: Vec<Object> = Vec::new();
        let mut source = ObjectSource::new(data, 0);
        loop {
            let token = source.next_token();
            match token.kind {
                TokenKind::Eof => break,
                TokenKind::Word => {
                    if token.value == b"BI" {
                        operations.push(parse_inline_image(&mut source)?);
                        operands.clear();
                        continue;
                    }
                    operations.push(Operation {
                        operator: String::from_utf8_lossy(&token.value).into_owned(),
                        operands: std::mem::take(&mut operands),
                    });
                }
                TokenKind::Bad => {
                    return Err(ParseError::UnexpectedToken(
                        token.error.unwrap_or_else(|| "bad token".to_string()),
                        0,
                    )
                    .into());
                }
                _ => operands.push(source_object(&mut source, token)?),
            }
        }
        if !operands.is_empty() {
            warn!("content stream ends with {} dangling operands", operands.len());
        }
        Ok(Content { operations })
    }

    /// Serialize operations back to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for operation in &self.operations {
            if operation.operator == "BI" {
                encode_inline_image(&mut out, operation)?;
                continue;
            }
            for operand in &operation.operands {
                serialize::write_object(&mut out, operand);
                out.push(b' ');
            }
            out.extend_from_slice(operation.operator.as_bytes());
            out.push(b'\n');
        }
        Ok(out)
    }
}

fn source_object(source: &mut ObjectSource<'_>, token: Token) -> Result<Object> {
    source.parse_token_as_object(token, 0)
}

fn parse_inline_image(source: &mut ObjectSource<'_>) -> Result<Operation> {
    // Key/value pairs up to the ID keyword.
    let mut dict = Dictionary::new();
    loop {
        let token = source.next_token();
        match token.kind {
            TokenKind::Word if token.value == b"ID" => break,
            TokenKind::Name => {
                let key = token.value;
                let value = source.read_object(0)?;
                dict.set(key, value);
            }
            TokenKind::Eof => {
                return Err(Error::Parse(ParseError::UnexpectedToken("EOF".to_string(), 0)));
            }
            other => {
                return Err(Error::Parse(ParseError::UnexpectedToken(format!("{other:?}"), 0)));
            }
        }
    }
    // One whitespace byte separates ID from the data.
    let data = source.read_inline_image_data();
    let ei = source.next_token();
    if !ei.is_word(b"EI") {
        warn!("inline image data is not followed by EI");
    }
    Ok(Operation {
        operator: "BI".to_string(),
        operands: vec![
            Object::Dictionary(dict),
            Object::String(data, StringFormat::Hexadecimal),
        ],
    })
}

fn encode_inline_image(out: &mut Vec<u8>, operation: &Operation) -> Result<()> {
    let [Object::Dictionary(dict), Object::String(data, _)] = operation.operands.as_slice() else {
        return Err(Error::Usage("a BI operation carries a dictionary and the image bytes"));
    };
    out.extend_from_slice(b"BI ");
    for (key, value) in dict.iter() {
        serialize::write_name(out, key);
        out.push(b' ');
        serialize::write_object(out, value);
        out.push(b' ');
    }
    out.extend_from_slice(b"ID ");
    out.extend_from_slice(data);
    if !data.last().copied().is_some_and(crate::tokenizer::is_space) {
        out.push(b' ');
    }
    out.extend_from_slice(b"EI\n");
    Ok(())
}

/// A caller-supplied rewriter for tokenized content streams.
pub trait TokenFilter {
    /// Transform one token into zero or more replacement tokens. The
    /// default is the identity.
    fn filter_token(&mut self, token: Token) -> Vec<Token> {
        vec![token]
    }
}

/// Bytes a token writes back out: the raw source form when available,
/// otherwise a rendering of the value.
pub(crate) fn token_bytes(token: &Token) -> Vec<u8> {
    if !token.raw.is_empty() {
        return token.raw.clone();
    }
    match token.kind {
        TokenKind::Name => {
            let mut out = Vec::new();
            serialize::write_name(&mut out, &token.value);
            out
        }
        TokenKind::String => {
            let mut out = Vec::new();
            serialize::write_literal_string(&mut out, &token.value);
            out
        }
        TokenKind::ArrayOpen => b"[".to_vec(),
        TokenKind::ArrayClose => b"]".to_vec(),
        TokenKind::DictOpen => b"<<".to_vec(),
        TokenKind::DictClose => b">>".to_vec(),
        TokenKind::Space => b" ".to_vec(),
        _ => token.value.clone(),
    }
}

/// Run a token filter over a decoded content stream.
pub fn filter_content(data: &[u8], filter: &mut dyn TokenFilter) -> Result<Vec<u8>> {
    let mut cursor = ByteCursor::new(data);
    let mut tokenizer = Tokenizer::new();
    tokenizer.allow_eof().include_ignorable();
    let mut out = Vec::new();
    let mut last_was_id = false;
    loop {
        if last_was_id {
            tokenizer.expect_inline_image(&mut cursor);
            last_was_id = false;
        }
        let token = tokenizer.next_token(&mut cursor);
        match token.kind {
            TokenKind::Eof => break,
            TokenKind::Bad => {
                // Pass damaged content through untouched from here on.
                out.extend_from_slice(&token.raw);
                out.extend_from_slice(&data[cursor.tell()..]);
                break;
            }
            _ => {
                last_was_id = token.is_word(b"ID");
                if token.kind == TokenKind::InlineImage {
                    // Image data is opaque to token filters.
                    out.extend_from_slice(&token.raw);
                    continue;
                }
                for replacement in filter.filter_token(token) {
                    out.extend_from_slice(&token_bytes(&replacement));
                }
            }
        }
    }
    Ok(out)
}

/// Normalize end-of-line conventions in a content stream: CR and CRLF in
/// whitespace and after comments become LF. Strings and inline image data
/// keep their bytes.
pub fn normalize_content(data: &[u8]) -> Result<Vec<u8>> {
    struct Normalizer;
    impl TokenFilter for Normalizer {
        fn filter_token(&mut self, mut token: Token) -> Vec<Token> {
            if matches!(token.kind, TokenKind::Space | TokenKind::Comment) {
                let mut fixed = Vec::with_capacity(token.raw.len());
                let mut bytes = token.raw.iter().peekable();
                while let Some(&byte) = bytes.next() {
                    if byte == b'\r' {
                        if bytes.peek() != Some(&&b'\n') {
                            fixed.push(b'\n');
                        }
                    } else {
                        fixed.push(byte);
                    }
                }
                token.raw = fixed;
            }
            vec![token]
        }
    }
    filter_content(data, &mut Normalizer)
}

impl Document {
    /// The page's decoded content: /Contents may be one stream or an array
    /// of streams, piped in order with a newline inserted between parts
    /// when the prior part does not end with one.
    pub fn page_content(&self, page: ObjectId) -> Result<Vec<u8>> {
        let page_dict = self.get_dictionary(page)?;
        let contents = self.dereference(page_dict.get_or_null(b"Contents"))?.1;
        let mut parts: Vec<&Object> = Vec::new();
        match contents {
            Object::Array(items) => parts.extend(items.iter()),
            Object::Stream(_) => parts.push(contents),
            Object::Null => return Ok(Vec::new()),
            other => {
                return Err(Error::ObjectType {
                    expected: "Stream",
                    found: other.type_name(),
                });
            }
        }
        let mut out = Vec::new();
        for part in parts {
            let stream = self.dereference(part)?.1.as_stream()?;
            let decoded = self.get_stream_decoded(stream)?;
            if !out.is_empty() && !out.ends_with(b"\n") {
                out.push(b'\n');
            }
            out.extend_from_slice(&decoded);
        }
        Ok(out)
    }

    /// Replace the page's /Contents with a single stream holding `data`.
    pub fn set_page_content(&mut self, page: ObjectId, data: Vec<u8>) -> Result<()> {
        let content_id = self.add_object(Object::Stream(Stream::new(Dictionary::new(), data)));
        self.get_dictionary_mut(page)?
            .set("Contents", Object::Reference(content_id));
        Ok(())
    }

    /// Tokenize the page's content, run `filter` over it, and store the
    /// result back as a single content stream.
    pub fn filter_page_contents(&mut self, page: ObjectId, filter: &mut dyn TokenFilter) -> Result<()> {
        let content = self.page_content(page)?;
        let rewritten = filter_content(&content, filter)?;
        self.set_page_content(page, rewritten)
    }
}
