//! Object parsing: a token-driven reader for PDF values, plus small nom
//! scanners for the file-level landmarks (header, binary comment,
//! startxref, classic cross-reference sections).

use std::collections::HashSet;

use nom::IResult;
use nom::Parser;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::combinator::map_res;
use nom::sequence::preceded;

use crate::error::{ErrorKind, ParseError, Warning, XrefError};
use crate::object::{Real, StreamData};
use crate::reader::Reader;
use crate::tokenizer::{is_space, ByteCursor, Token, TokenKind, Tokenizer};
use crate::xref::{Xref, XrefEntry};
use crate::{Dictionary, Error, Object, ObjectId, Result, Stream};

pub type ParserInput<'a> = nom_locate::LocatedSpan<&'a [u8], &'static str>;

/// Deepest allowed array/dictionary nesting while parsing.
pub const MAX_NESTING: usize = 100;

/// Parse the `%PDF-M.N` header, returning the version string.
pub fn header(input: ParserInput<'_>) -> Option<String> {
    fn inner(input: ParserInput<'_>) -> IResult<ParserInput<'_>, ParserInput<'_>> {
        preceded(
            tag(&b"%PDF-"[..]),
            take_while1(|c: u8| c.is_ascii_digit() || c == b'.'),
        )
        .parse(input)
    }
    inner(input)
        .ok()
        .map(|(_, span)| String::from_utf8_lossy(span.fragment()).into_owned())
}

/// Parse the binary comment line that conventionally follows the header.
pub fn binary_mark(input: ParserInput<'_>) -> Option<Vec<u8>> {
    fn inner(input: ParserInput<'_>) -> IResult<ParserInput<'_>, ParserInput<'_>> {
        preceded(tag(&b"%"[..]), take_while(|c: u8| c != b'\r' && c != b'\n')).parse(input)
    }
    inner(input).ok().map(|(_, span)| span.fragment().to_vec())
}

/// Parse `startxref` followed by the byte offset.
pub fn xref_start(input: ParserInput<'_>) -> Option<i64> {
    fn inner(input: ParserInput<'_>) -> IResult<ParserInput<'_>, i64> {
        preceded(
            (tag(&b"startxref"[..]), take_while(is_space)),
            map_res(take_while1(|c: u8| c.is_ascii_digit()), |span: ParserInput<'_>| {
                std::str::from_utf8(span.fragment()).unwrap_or("").parse::<i64>()
            }),
        )
        .parse(input)
    }
    inner(input).ok().map(|(_, value)| value)
}

/// Token-driven reader over a byte buffer. Collects warnings instead of
/// failing on recoverable damage.
pub(crate) struct ObjectSource<'a> {
    pub(crate) cursor: ByteCursor<'a>,
    tokenizer: Tokenizer,
    pub(crate) warnings: Vec<Warning>,
}

impl<'a> ObjectSource<'a> {
    pub fn new(buffer: &'a [u8], offset: usize) -> ObjectSource<'a> {
        let mut tokenizer = Tokenizer::new();
        tokenizer.allow_eof();
        ObjectSource {
            cursor: ByteCursor::at(buffer, offset),
            tokenizer,
            warnings: Vec::new(),
        }
    }

    pub fn next_token(&mut self) -> Token {
        self.tokenizer.next_token(&mut self.cursor)
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(Warning {
            kind: ErrorKind::DamagedPdf,
            object: String::new(),
            offset: Some(self.cursor.tell()),
            message: message.into(),
        });
    }

    /// Read one object. Indirect references are recognized by the
    /// two-integer look-ahead for `N M R`.
    pub fn read_object(&mut self, depth: usize) -> Result<Object> {
        let token = self.next_token();
        self.parse_from_token(token, depth)
    }

    /// Continue parsing an object whose first token has been read already.
    pub(crate) fn parse_token_as_object(&mut self, token: Token, depth: usize) -> Result<Object> {
        self.parse_from_token(token, depth)
    }

    /// Read the data between `ID` and the matching `EI` of an inline
    /// image, leaving the `EI` word in the input. A single whitespace byte
    /// after `ID` is a separator, not data.
    pub(crate) fn read_inline_image_data(&mut self) -> Vec<u8> {
        let mark = self.cursor.tell();
        match self.cursor.next_byte() {
            Some(byte) if is_space(byte) => {}
            _ => self.cursor.seek(mark),
        }
        self.tokenizer.expect_inline_image(&mut self.cursor);
        self.tokenizer.next_token(&mut self.cursor).value
    }

    fn parse_integer(&mut self, token: &Token) -> i64 {
        match std::str::from_utf8(&token.value).ok().and_then(|s| s.parse().ok()) {
            Some(value) => value,
            None => {
                self.warn(format!(
                    "numeric value {} is out of range, treating as 0",
                    String::from_utf8_lossy(&token.value)
                ));
                0
            }
        }
    }

    fn parse_from_token(&mut self, token: Token, depth: usize) -> Result<Object> {
        if depth > MAX_NESTING {
            return Err(ParseError::NestingLimit.into());
        }
        match token.kind {
            TokenKind::Null => Ok(Object::Null),
            TokenKind::Bool => Ok(Object::Boolean(token.value == b"true")),
            TokenKind::Integer => {
                let first = self.parse_integer(&token);
                let rewind = self.cursor.tell();
                let second = self.next_token();
                if second.kind == TokenKind::Integer {
                    let third = self.next_token();
                    if third.is_word(b"R") {
                        let generation = self.parse_integer(&second);
                        if (0..=u32::MAX as i64).contains(&first) && (0..=u16::MAX as i64).contains(&generation) {
                            return Ok(Object::Reference((first as u32, generation as u16)));
                        }
                        self.warn("indirect reference with out-of-range numbers, treating as null");
                        return Ok(Object::Null);
                    }
                }
                self.cursor.seek(rewind);
                Ok(Object::Integer(first))
            }
            TokenKind::Real => {
                let lexeme = String::from_utf8_lossy(&token.value).into_owned();
                Real::from_lexeme(&lexeme)
                    .map(Object::Real)
                    .ok_or_else(|| ParseError::UnexpectedToken(lexeme, self.cursor.tell()).into())
            }
            TokenKind::String => {
                let format = if token.raw.first() == Some(&b'(') {
                    crate::StringFormat::Literal
                } else {
                    crate::StringFormat::Hexadecimal
                };
                Ok(Object::String(token.value, format))
            }
            TokenKind::Name => {
                if let Some(error) = token.error {
                    self.warn(error);
                }
                Ok(Object::Name(token.value))
            }
            TokenKind::ArrayOpen => {
                let mut items = Vec::new();
                loop {
                    let next = self.next_token();
                    match next.kind {
                        TokenKind::ArrayClose => break,
                        TokenKind::Eof => {
                            return Err(ParseError::UnexpectedToken("EOF".to_string(), self.cursor.tell()).into());
                        }
                        _ => items.push(self.parse_from_token(next, depth + 1)?),
                    }
                }
                Ok(Object::Array(items))
            }
            TokenKind::DictOpen => {
                let mut dict = Dictionary::new();
                loop {
                    let next = self.next_token();
                    match next.kind {
                        TokenKind::DictClose => break,
                        TokenKind::Eof => {
                            return Err(ParseError::UnexpectedToken("EOF".to_string(), self.cursor.tell()).into());
                        }
                        TokenKind::Name => {
                            let key = next.value;
                            let value = self.read_object(depth + 1)?;
                            dict.set(key, value);
                        }
                        other => {
                            // A key that is not a name: warn and skip the
                            // whole pair.
                            self.warn(format!("dictionary key is not a name ({other:?}), skipping the pair"));
                            let _ = self.parse_from_token(next, depth + 1)?;
                            let rewind = self.cursor.tell();
                            let value = self.next_token();
                            if value.kind == TokenKind::DictClose {
                                break;
                            }
                            self.cursor.seek(rewind);
                            let _ = self.read_object(depth + 1)?;
                        }
                    }
                }
                Ok(Object::Dictionary(dict))
            }
            TokenKind::Bad if token.raw.first() == Some(&b'/') => {
                // A name with a bad escape survives with its sentinel; it is
                // re-escaped when written back out.
                if let Some(error) = token.error {
                    self.warn(error);
                }
                Ok(Object::Name(token.value))
            }
            other => Err(ParseError::UnexpectedToken(format!("{other:?}"), self.cursor.tell()).into()),
        }
    }
}

/// Parse a single object from a byte buffer, rejecting trailing bytes that
/// are not whitespace or comments.
impl Object {
    pub fn parse(data: &[u8]) -> Result<Object> {
        let mut source = ObjectSource::new(data, 0);
        let object = source.read_object(0)?;
        let token = source.next_token();
        if token.kind != TokenKind::Eof {
            return Err(ParseError::TrailingGarbage.into());
        }
        Ok(object)
    }
}

/// True when `endstream` follows at `pos`, allowing leading whitespace.
fn endstream_at(buffer: &[u8], mut pos: usize) -> bool {
    while pos < buffer.len() && is_space(buffer[pos]) {
        pos += 1;
    }
    buffer[pos..].starts_with(b"endstream")
}

/// Parse the `N G obj ... endobj` at `offset`. Streams take their payload
/// as a byte range; a missing or wrong /Length is repaired by scanning for
/// `endstream`.
pub(crate) fn indirect_object(
    buffer: &[u8],
    offset: usize,
    expected_id: Option<ObjectId>,
    reader: &Reader<'_>,
    already_seen: &mut HashSet<ObjectId>,
) -> Result<(ObjectId, Object)> {
    let mut source = ObjectSource::new(buffer, offset);

    let id_token = source.next_token();
    let gen_token = source.next_token();
    let obj_token = source.next_token();
    if id_token.kind != TokenKind::Integer || gen_token.kind != TokenKind::Integer || !obj_token.is_word(b"obj") {
        return Err(ParseError::InvalidObject(offset).into());
    }
    let id = source.parse_integer(&id_token);
    let generation = source.parse_integer(&gen_token);
    if !(0..=u32::MAX as i64).contains(&id) || !(0..=u16::MAX as i64).contains(&generation) {
        return Err(ParseError::InvalidObject(offset).into());
    }
    let object_id: ObjectId = (id as u32, generation as u16);
    if let Some(expected) = expected_id {
        if expected != object_id {
            return Err(ParseError::ObjectIdMismatch.into());
        }
    }

    let mut object = source.read_object(0)?;

    let after_value = source.cursor.tell();
    let keyword = source.next_token();
    if keyword.is_word(b"stream") {
        object = parse_stream_payload(buffer, &mut source, object, object_id, reader, already_seen)?;
    } else if !keyword.is_word(b"endobj") {
        source.warn(format!("object {} {} is missing endobj", object_id.0, object_id.1));
        source.cursor.seek(after_value);
    }

    let warnings = std::mem::take(&mut source.warnings);
    reader.push_warnings(object_id, warnings);

    Ok((object_id, object))
}

fn parse_stream_payload(
    buffer: &[u8],
    source: &mut ObjectSource<'_>,
    object: Object,
    object_id: ObjectId,
    reader: &Reader<'_>,
    already_seen: &mut HashSet<ObjectId>,
) -> Result<Object> {
    let dict = match object {
        Object::Dictionary(dict) => dict,
        other => {
            return Err(Error::InvalidStream(format!(
                "stream keyword after a {} in object {} {}",
                other.type_name(),
                object_id.0,
                object_id.1
            )));
        }
    };

    // The payload begins after the line terminator that follows the stream
    // keyword; the tokenizer never consumed it.
    match source.cursor.next_byte() {
        Some(b'\r') => {
            let mark = source.cursor.tell();
            if source.cursor.next_byte() != Some(b'\n') {
                source.warn("carriage return alone after the stream keyword");
                source.cursor.seek(mark);
            }
        }
        Some(b'\n') => {}
        _ => source.warn("stream keyword is not followed by a line terminator"),
    }
    let start = source.cursor.tell();

    let declared_length = match dict.get_or_null(b"Length") {
        Object::Integer(value) => Some(*value),
        Object::Reference(length_id) => reader
            .get_object(*length_id, already_seen)
            .ok()
            .and_then(|obj| obj.as_i64().ok()),
        Object::Null => None,
        _ => None,
    };

    let length = match declared_length {
        Some(length)
            if length >= 0
                && start + length as usize <= buffer.len()
                && endstream_at(buffer, start + length as usize) =>
        {
            length as usize
        }
        declared => {
            if declared.is_some() {
                source.warn(format!(
                    "stream length for object {} {} does not land on endstream, recovering",
                    object_id.0, object_id.1
                ));
            } else {
                source.warn(format!(
                    "stream dictionary of object {} {} has no usable /Length",
                    object_id.0, object_id.1
                ));
            }
            match Reader::search_substring_forward(buffer, b"endstream", start) {
                Some(end) => {
                    // Back off the end-of-line marker in front of endstream.
                    let mut data_end = end;
                    if data_end > start && buffer[data_end - 1] == b'\n' {
                        data_end -= 1;
                    }
                    if data_end > start && buffer[data_end - 1] == b'\r' {
                        data_end -= 1;
                    }
                    data_end - start
                }
                None => {
                    return Err(Error::InvalidStream(format!(
                        "object {} {} has no endstream",
                        object_id.0, object_id.1
                    )));
                }
            }
        }
    };

    let mut stream = Stream::with_range(dict, start, length);
    stream.dict.set("Length", length as i64);

    source.cursor.seek(start + length);
    let end_token = source.next_token();
    if !end_token.is_word(b"endstream") {
        source.warn(format!(
            "object {} {} stream data is not followed by endstream",
            object_id.0, object_id.1
        ));
    }
    let endobj = source.next_token();
    if !endobj.is_word(b"endobj") {
        source.warn(format!("object {} {} is missing endobj", object_id.0, object_id.1));
    }

    Ok(Object::Stream(stream))
}

/// Parse the cross-reference section at `start`: either a classic table
/// followed by a trailer dictionary, or a cross-reference stream.
pub(crate) fn xref_and_trailer(buffer: &[u8], start: usize, reader: &Reader<'_>) -> Result<(Xref, Dictionary)> {
    let mut pos = start;
    while pos < buffer.len() && is_space(buffer[pos]) {
        pos += 1;
    }
    if buffer[pos..].starts_with(b"xref") {
        return classic_xref_and_trailer(buffer, pos + 4, reader);
    }

    // A cross-reference stream.
    let mut already_seen = HashSet::new();
    let (_, object) = indirect_object(buffer, pos, None, reader, &mut already_seen)?;
    let stream = object.as_stream().map_err(|_| Error::Xref(XrefError::Stream))?;
    if !stream.dict.has_type(b"XRef") {
        return Err(Error::Xref(XrefError::Stream));
    }
    let raw = match stream.data() {
        StreamData::Range { offset, length } => buffer
            .get(*offset..*offset + *length)
            .ok_or(Error::Xref(XrefError::Stream))?,
        StreamData::Buffer(bytes) => bytes.as_slice(),
        StreamData::Provider(_) => return Err(Error::Xref(XrefError::Stream)),
    };
    let filters = stream.filters();
    let decoded;
    let data = if filters.is_empty() {
        raw
    } else {
        decoded = crate::filters::decode_data(reader.filter_registry(), &filters, &stream.decode_parms(), raw)?;
        decoded.as_slice()
    };
    let xref = crate::xref::decode_xref_stream(&stream.dict, data)?;
    Ok((xref, stream.dict.clone()))
}

fn classic_xref_and_trailer(buffer: &[u8], mut pos: usize, reader: &Reader<'_>) -> Result<(Xref, Dictionary)> {
    let mut xref = Xref::new();
    loop {
        while pos < buffer.len() && is_space(buffer[pos]) {
            pos += 1;
        }
        if buffer[pos..].starts_with(b"trailer") {
            pos += b"trailer".len();
            break;
        }
        if pos >= buffer.len() {
            return Err(ParseError::InvalidXref.into());
        }
        // Subsection header: `first count`.
        let (first, after_first) = read_decimal(buffer, pos).ok_or(ParseError::InvalidXref)?;
        let (count, after_count) = read_decimal(buffer, skip_spaces(buffer, after_first)).ok_or(ParseError::InvalidXref)?;
        pos = skip_spaces(buffer, after_count);
        for index in 0..count {
            let (offset, after_offset) = read_decimal(buffer, pos).ok_or(ParseError::InvalidXref)?;
            let (generation, after_generation) =
                read_decimal(buffer, skip_spaces(buffer, after_offset)).ok_or(ParseError::InvalidXref)?;
            let type_pos = skip_spaces(buffer, after_generation);
            let entry_type = *buffer.get(type_pos).ok_or(ParseError::InvalidXref)?;
            pos = skip_spaces(buffer, type_pos + 1);
            let id = (first + index) as u32;
            match entry_type {
                b'n' => xref.insert(
                    id,
                    XrefEntry::Normal {
                        offset: offset as u32,
                        generation: generation as u16,
                    },
                ),
                b'f' => xref.insert(
                    id,
                    XrefEntry::Free {
                        next_generation: generation as u16,
                    },
                ),
                _ => return Err(ParseError::InvalidXref.into()),
            }
        }
    }

    let mut source = ObjectSource::new(buffer, pos);
    let trailer = source
        .read_object(0)
        .and_then(|obj| match obj {
            Object::Dictionary(dict) => Ok(dict),
            _ => Err(ParseError::InvalidTrailer.into()),
        })?;
    reader.push_warnings((0, 0), std::mem::take(&mut source.warnings));

    xref.size = trailer
        .get(b"Size")
        .and_then(Object::as_i64)
        .unwrap_or_else(|_| xref.max_id() as i64 + 1)
        .max(0) as u32;
    Ok((xref, trailer))
}

fn skip_spaces(buffer: &[u8], mut pos: usize) -> usize {
    while pos < buffer.len() && is_space(buffer[pos]) {
        pos += 1;
    }
    pos
}

fn read_decimal(buffer: &[u8], pos: usize) -> Option<(u64, usize)> {
    let mut end = pos;
    while end < buffer.len() && buffer[end].is_ascii_digit() {
        end += 1;
    }
    if end == pos || end - pos > 19 {
        return None;
    }
    let mut value = 0u64;
    for &byte in &buffer[pos..end] {
        value = value * 10 + (byte - b'0') as u64;
    }
    Some((value, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanners_find_landmarks() {
        assert_eq!(
            header(ParserInput::new_extra(b"%PDF-1.7\n", "header")),
            Some("1.7".to_string())
        );
        assert_eq!(header(ParserInput::new_extra(b"no header", "header")), None);
        assert_eq!(
            binary_mark(ParserInput::new_extra(b"%\xE2\xE3\xCF\xD3\n", "binary_mark")),
            Some(vec![0xE2, 0xE3, 0xCF, 0xD3])
        );
        assert_eq!(
            xref_start(ParserInput::new_extra(b"startxref\n1234\n%%EOF", "xref")),
            Some(1234)
        );
    }

    #[test]
    fn parse_scalars() {
        assert_eq!(Object::parse(b"null").unwrap(), Object::Null);
        assert_eq!(Object::parse(b"true").unwrap(), Object::Boolean(true));
        assert_eq!(Object::parse(b"42").unwrap(), Object::Integer(42));
        assert_eq!(Object::parse(b"-17").unwrap(), Object::Integer(-17));
        let real = Object::parse(b"1.50").unwrap();
        match real {
            Object::Real(r) => assert_eq!(r.lexeme(), "1.50"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            Object::parse(b"(hi)").unwrap(),
            Object::String(b"hi".to_vec(), crate::StringFormat::Literal)
        );
        assert_eq!(
            Object::parse(b"<6869>").unwrap(),
            Object::String(b"hi".to_vec(), crate::StringFormat::Hexadecimal)
        );
        assert_eq!(Object::parse(b"/Name").unwrap(), Object::Name(b"Name".to_vec()));
    }

    #[test]
    fn parse_rejects_trailing_garbage() {
        assert!(Object::parse(b"42 extra").is_err());
        assert!(Object::parse(b"42  \n").is_ok());
        // Comments are ignorable, the same as whitespace.
        assert!(Object::parse(b"42  % trailing comment").is_ok());
    }

    #[test]
    fn parse_reference_lookahead() {
        assert_eq!(Object::parse(b"12 0 R").unwrap(), Object::Reference((12, 0)));
        // Two integers without R stay two integers.
        let array = Object::parse(b"[1 2]").unwrap();
        assert_eq!(
            array,
            Object::Array(vec![Object::Integer(1), Object::Integer(2)])
        );
        let array = Object::parse(b"[1 2 R 3]").unwrap();
        assert_eq!(
            array,
            Object::Array(vec![Object::Reference((1, 2)), Object::Integer(3)])
        );
    }

    #[test]
    fn parse_nested_containers() {
        let object = Object::parse(b"<< /A [1 2 [3]] /B << /C (x) >> >>").unwrap();
        let dict = object.as_dict().unwrap();
        let a = dict.get(b"A").unwrap().as_array().unwrap();
        assert_eq!(a.len(), 3);
        let b = dict.get(b"B").unwrap().as_dict().unwrap();
        assert_eq!(b.get(b"C").unwrap().as_string_bytes().unwrap(), b"x");
    }

    #[test]
    fn dictionary_skips_non_name_keys() {
        let mut source = ObjectSource::new(b"<< 42 (value) /Good 1 >>", 0);
        let object = source.read_object(0).unwrap();
        let dict = object.as_dict().unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get(b"Good").unwrap().as_i64().unwrap(), 1);
        assert!(!source.warnings.is_empty());
    }

    #[test]
    fn nesting_limit_is_enforced() {
        let mut input = Vec::new();
        input.extend(std::iter::repeat_n(b'[', MAX_NESTING + 2));
        input.extend(std::iter::repeat_n(b']', MAX_NESTING + 2));
        assert!(matches!(
            Object::parse(&input),
            Err(Error::Parse(ParseError::NestingLimit))
        ));
    }

    #[test]
    fn duplicate_dictionary_keys_last_wins() {
        let object = Object::parse(b"<< /K 1 /K 2 >>").unwrap();
        assert_eq!(object.as_dict().unwrap().get(b"K").unwrap().as_i64().unwrap(), 2);
    }

    #[test]
    fn classic_xref_parsing() {
        let data = b"xref\n0 3\n0000000000 65535 f \n0000000017 00000 n \n0000000081 00000 n \ntrailer\n<< /Size 3 /Root 1 0 R >>\nstartxref\n0\n%%EOF";
        let reader = Reader::for_tests(data);
        let (xref, trailer) = xref_and_trailer(data, 0, &reader).unwrap();
        assert_eq!(xref.size, 3);
        assert_eq!(
            xref.get(1),
            Some(&XrefEntry::Normal { offset: 17, generation: 0 })
        );
        assert_eq!(
            xref.get(0),
            Some(&XrefEntry::Free { next_generation: 65535 })
        );
        assert_eq!(trailer.get(b"Root").unwrap().as_reference().unwrap(), (1, 0));
    }
}
