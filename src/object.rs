use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use log::warn;

use crate::{Error, Result};

/// (object number, generation number) pair identifying an indirect object
/// within one document.
pub type ObjectId = (u32, u16);

/// How a string token was written in the source file. Round-tripping keeps
/// the original form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    Literal,
    Hexadecimal,
}

impl Default for StringFormat {
    fn default() -> StringFormat {
        StringFormat::Literal
    }
}

/// A real number, kept as its source lexeme so round-tripping is byte-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Real(String);

impl Real {
    /// Accept a lexeme of the form `[+-]? digits? '.'? digits?` with at
    /// least one digit. Anything else is not a PDF real.
    pub fn from_lexeme(lexeme: &str) -> Option<Real> {
        let rest = lexeme.strip_prefix(['+', '-']).unwrap_or(lexeme);
        let mut digits = 0;
        let mut dots = 0;
        for b in rest.bytes() {
            match b {
                b'0'..=b'9' => digits += 1,
                b'.' => dots += 1,
                _ => return None,
            }
        }
        if digits == 0 || dots > 1 {
            return None;
        }
        Some(Real(lexeme.to_string()))
    }

    /// Format a new real with a fixed number of decimal places. The decimal
    /// separator is always `.`; this must never go through a locale-aware
    /// formatter.
    pub fn from_value(value: f64, decimal_places: u8, trim_trailing_zeros: bool) -> Real {
        let mut s = format!("{:.*}", decimal_places as usize, value);
        if trim_trailing_zeros && s.contains('.') {
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
        }
        if s == "-0" {
            s = "0".to_string();
        }
        Real(s)
    }

    pub fn lexeme(&self) -> &str {
        &self.0
    }

    pub fn value(&self) -> f64 {
        // The lexeme was validated on construction.
        self.0.parse().unwrap_or(0.0)
    }
}

impl fmt::Display for Real {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A PDF value.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(Real),
    String(Vec<u8>, StringFormat),
    Name(Vec<u8>),
    Array(Vec<Object>),
    Dictionary(Dictionary),
    Stream(Stream),
    Reference(ObjectId),
    /// Placeholder allocated to break cycles while copying between
    /// documents; never written to a file.
    Reserved,
    /// Set for every cached object at document teardown so stale ids
    /// cannot observe freed values.
    Destroyed,
}

impl Object {
    pub fn string_literal(s: impl Into<Vec<u8>>) -> Object {
        Object::String(s.into(), StringFormat::Literal)
    }

    pub fn name(s: impl Into<Vec<u8>>) -> Object {
        Object::Name(s.into())
    }

    pub fn real_from(value: f64) -> Object {
        Object::Real(Real::from_value(value, 6, true))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Null => "Null",
            Object::Boolean(_) => "Boolean",
            Object::Integer(_) => "Integer",
            Object::Real(_) => "Real",
            Object::String(..) => "String",
            Object::Name(_) => "Name",
            Object::Array(_) => "Array",
            Object::Dictionary(_) => "Dictionary",
            Object::Stream(_) => "Stream",
            Object::Reference(_) => "Reference",
            Object::Reserved => "Reserved",
            Object::Destroyed => "Destroyed",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Object::Null)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Object::Stream(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Object::Reference(_))
    }

    fn type_error(&self, expected: &'static str) -> Error {
        Error::ObjectType {
            expected,
            found: self.type_name(),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Object::Boolean(value) => Ok(*value),
            _ => Err(self.type_error("Boolean")),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Object::Integer(value) => Ok(*value),
            _ => Err(self.type_error("Integer")),
        }
    }

    /// Numeric accessor accepting both integers and reals.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Object::Integer(value) => Ok(*value as f64),
            Object::Real(value) => Ok(value.value()),
            _ => Err(self.type_error("Real")),
        }
    }

    pub fn as_string_bytes(&self) -> Result<&[u8]> {
        match self {
            Object::String(bytes, _) => Ok(bytes),
            _ => Err(self.type_error("String")),
        }
    }

    /// Decode a text string: UTF-16BE/LE and UTF-8 are recognized by their
    /// byte-order marks, anything else is PDFDocEncoding.
    pub fn as_text_string(&self) -> Result<String> {
        Ok(decode_text_string(self.as_string_bytes()?))
    }

    pub fn as_name(&self) -> Result<&[u8]> {
        match self {
            Object::Name(name) => Ok(name),
            _ => Err(self.type_error("Name")),
        }
    }

    pub fn as_array(&self) -> Result<&Vec<Object>> {
        match self {
            Object::Array(array) => Ok(array),
            _ => Err(self.type_error("Array")),
        }
    }

    pub fn as_array_mut(&mut self) -> Result<&mut Vec<Object>> {
        match self {
            Object::Array(array) => Ok(array),
            _ => Err(Error::ObjectType {
                expected: "Array",
                found: self.type_name(),
            }),
        }
    }

    pub fn as_dict(&self) -> Result<&Dictionary> {
        match self {
            Object::Dictionary(dict) => Ok(dict),
            Object::Stream(stream) => Ok(&stream.dict),
            _ => Err(self.type_error("Dictionary")),
        }
    }

    pub fn as_dict_mut(&mut self) -> Result<&mut Dictionary> {
        match self {
            Object::Dictionary(dict) => Ok(dict),
            Object::Stream(stream) => Ok(&mut stream.dict),
            _ => Err(Error::ObjectType {
                expected: "Dictionary",
                found: self.type_name(),
            }),
        }
    }

    pub fn as_stream(&self) -> Result<&Stream> {
        match self {
            Object::Stream(stream) => Ok(stream),
            _ => Err(self.type_error("Stream")),
        }
    }

    pub fn as_stream_mut(&mut self) -> Result<&mut Stream> {
        match self {
            Object::Stream(stream) => Ok(stream),
            _ => Err(Error::ObjectType {
                expected: "Stream",
                found: self.type_name(),
            }),
        }
    }

    pub fn as_reference(&self) -> Result<ObjectId> {
        match self {
            Object::Reference(id) => Ok(*id),
            _ => Err(self.type_error("Reference")),
        }
    }
}

impl From<bool> for Object {
    fn from(value: bool) -> Object {
        Object::Boolean(value)
    }
}

impl From<i64> for Object {
    fn from(value: i64) -> Object {
        Object::Integer(value)
    }
}

impl From<i32> for Object {
    fn from(value: i32) -> Object {
        Object::Integer(value as i64)
    }
}

impl From<u32> for Object {
    fn from(value: u32) -> Object {
        Object::Integer(value as i64)
    }
}

impl From<f64> for Object {
    fn from(value: f64) -> Object {
        Object::real_from(value)
    }
}

impl From<&str> for Object {
    fn from(value: &str) -> Object {
        Object::Name(value.as_bytes().to_vec())
    }
}

impl From<String> for Object {
    fn from(value: String) -> Object {
        Object::String(value.into_bytes(), StringFormat::Literal)
    }
}

impl From<Vec<Object>> for Object {
    fn from(value: Vec<Object>) -> Object {
        Object::Array(value)
    }
}

impl From<Dictionary> for Object {
    fn from(value: Dictionary) -> Object {
        Object::Dictionary(value)
    }
}

impl From<Stream> for Object {
    fn from(value: Stream) -> Object {
        Object::Stream(value)
    }
}

impl From<ObjectId> for Object {
    fn from(value: ObjectId) -> Object {
        Object::Reference(value)
    }
}

/// An insertion-order-preserving mapping from names (without the leading
/// slash) to objects.
#[derive(Clone, Default, PartialEq)]
pub struct Dictionary(IndexMap<Vec<u8>, Object>);

impl Dictionary {
    pub fn new() -> Dictionary {
        Dictionary(IndexMap::new())
    }

    pub fn get(&self, key: &[u8]) -> Result<&Object> {
        self.0.get(key).ok_or_else(|| Error::DictKey(key.to_vec()))
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Result<&mut Object> {
        self.0.get_mut(key).ok_or_else(|| Error::DictKey(key.to_vec()))
    }

    /// Absent keys read as Null, matching how consumers treat missing
    /// dictionary entries.
    pub fn get_or_null(&self, key: &[u8]) -> &Object {
        static NULL: Object = Object::Null;
        self.0.get(key).unwrap_or(&NULL)
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Object>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Object> {
        self.0.shift_remove(key)
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.0.contains_key(key)
    }

    /// True when the /Type entry is the given name.
    pub fn has_type(&self, type_name: &[u8]) -> bool {
        self.0
            .get(b"Type".as_slice())
            .and_then(|obj| obj.as_name().ok())
            .is_some_and(|name| name == type_name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, Vec<u8>, Object> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> indexmap::map::IterMut<'_, Vec<u8>, Object> {
        self.0.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.0.keys()
    }

    pub fn extend(&mut self, other: Dictionary) {
        self.0.extend(other.0);
    }

    /// Merge `other`'s resource maps into this dictionary. For each
    /// resource-type key present on both sides as a dictionary, children are
    /// merged; a colliding child that references a different object gets a
    /// numeric suffix on the incoming key. Returns the renames as
    /// (old key, new key) pairs so callers can rewrite content streams.
    pub fn merge_resources(&mut self, other: &Dictionary) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut renames = Vec::new();
        for (key, incoming) in other.iter() {
            match (self.0.get_mut(key), incoming) {
                (None, _) => {
                    self.0.insert(key.clone(), incoming.clone());
                }
                (Some(Object::Dictionary(mine)), Object::Dictionary(theirs)) => {
                    for (child_key, child) in theirs.iter() {
                        match mine.0.get(child_key) {
                            None => {
                                mine.0.insert(child_key.clone(), child.clone());
                            }
                            Some(existing) if existing == child => {
                                // Same target; one reference suffices.
                            }
                            Some(_) => {
                                let mut n = 1usize;
                                let renamed = loop {
                                    let mut candidate = child_key.clone();
                                    candidate.extend_from_slice(n.to_string().as_bytes());
                                    if !mine.0.contains_key(&candidate) {
                                        break candidate;
                                    }
                                    n += 1;
                                };
                                mine.0.insert(renamed.clone(), child.clone());
                                renames.push((child_key.clone(), renamed));
                            }
                        }
                    }
                }
                (Some(_), _) => {
                    // Mismatched shapes; the existing entry wins.
                    warn!(
                        "resource key /{} is not a dictionary on both sides, keeping ours",
                        String::from_utf8_lossy(key)
                    );
                }
            }
        }
        renames
    }
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in self.iter() {
            map.entry(&String::from_utf8_lossy(key), value);
        }
        map.finish()
    }
}

impl<K: Into<Vec<u8>>, V: Into<Object>> FromIterator<(K, V)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Dictionary {
        let mut dict = Dictionary::new();
        for (key, value) in iter {
            dict.set(key, value);
        }
        dict
    }
}

/// Callback producing a stream's payload at write time. The bytes are pushed
/// into the supplied sink; large payloads never need to be materialized in
/// one buffer.
#[derive(Clone)]
pub struct StreamProvider(pub(crate) Arc<dyn Fn(&mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> + Send + Sync>);

impl StreamProvider {
    pub fn new<F>(provider: F) -> StreamProvider
    where
        F: Fn(&mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> + Send + Sync + 'static,
    {
        StreamProvider(Arc::new(provider))
    }

    pub fn provide(&self, sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        (self.0)(sink)
    }

    pub fn collect(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.provide(&mut |chunk| {
            out.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(out)
    }
}

impl fmt::Debug for StreamProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamProvider")
    }
}

/// Where a stream's raw (still filtered) payload lives.
#[derive(Debug, Clone)]
pub enum StreamData {
    /// Owned bytes.
    Buffer(Vec<u8>),
    /// A byte range inside the document's original input.
    Range { offset: usize, length: usize },
    /// Caller-supplied callable invoked at write time.
    Provider(StreamProvider),
}

impl PartialEq for StreamData {
    fn eq(&self, other: &StreamData) -> bool {
        match (self, other) {
            (StreamData::Buffer(a), StreamData::Buffer(b)) => a == b,
            (
                StreamData::Range {
                    offset: ao,
                    length: al,
                },
                StreamData::Range {
                    offset: bo,
                    length: bl,
                },
            ) => ao == bo && al == bl,
            (StreamData::Provider(a), StreamData::Provider(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

/// A stream object: a dictionary plus a deferred byte source.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub dict: Dictionary,
    pub(crate) data: StreamData,
    /// Cleared for payloads that must not be Flate-wrapped on write.
    pub allows_compression: bool,
    /// Byte position of the payload in the input, recorded while parsing so
    /// a wrong /Length can be repaired afterwards.
    pub start_position: Option<usize>,
}

impl Stream {
    pub fn new(mut dict: Dictionary, content: Vec<u8>) -> Stream {
        dict.set("Length", content.len() as i64);
        Stream {
            dict,
            data: StreamData::Buffer(content),
            allows_compression: true,
            start_position: None,
        }
    }

    pub(crate) fn with_range(dict: Dictionary, offset: usize, length: usize) -> Stream {
        Stream {
            dict,
            data: StreamData::Range { offset, length },
            allows_compression: true,
            start_position: Some(offset),
        }
    }

    pub fn with_provider(mut dict: Dictionary, provider: StreamProvider) -> Stream {
        dict.remove(b"Length");
        Stream {
            dict,
            data: StreamData::Provider(provider),
            allows_compression: true,
            start_position: None,
        }
    }

    pub fn data(&self) -> &StreamData {
        &self.data
    }

    /// Replace the payload with owned bytes and fix up /Length.
    pub fn set_content(&mut self, content: Vec<u8>) {
        self.dict.set("Length", content.len() as i64);
        self.data = StreamData::Buffer(content);
    }

    /// The owned payload, if the stream holds one.
    pub fn content(&self) -> Option<&[u8]> {
        match &self.data {
            StreamData::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Names in the /Filter entry, outermost first. A single name reads as a
    /// one-element chain.
    pub fn filters(&self) -> Vec<Vec<u8>> {
        match self.dict.get_or_null(b"Filter") {
            Object::Name(name) => vec![name.clone()],
            Object::Array(array) => array.iter().filter_map(|f| f.as_name().ok().map(<[u8]>::to_vec)).collect(),
            _ => Vec::new(),
        }
    }

    /// /DecodeParms aligned with `filters()`: always one entry per filter.
    pub fn decode_parms(&self) -> Vec<Option<Dictionary>> {
        let count = self.filters().len();
        let parms = self.dict.get_or_null(b"DecodeParms");
        let mut out: Vec<Option<Dictionary>> = match parms {
            Object::Dictionary(dict) => vec![Some(dict.clone())],
            Object::Array(array) => array
                .iter()
                .map(|p| match p {
                    Object::Dictionary(dict) => Some(dict.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        out.resize(count, None);
        out
    }
}

/// Decode a PDF text string to UTF-8.
pub fn decode_text_string(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = encoding_rs::UTF_16BE.decode(&bytes[2..]);
        return text.into_owned();
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(&bytes[2..]);
        return text.into_owned();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    bytes.iter().map(|&b| pdf_doc_char(b)).collect()
}

/// Encode UTF-8 text for storage in a PDF string: ASCII stays as is,
/// anything else becomes UTF-16BE with a byte-order mark.
pub fn encode_text_string(text: &str) -> Vec<u8> {
    if text.is_ascii() {
        return text.as_bytes().to_vec();
    }
    let mut out = vec![0xFE, 0xFF];
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// PDFDocEncoding, which differs from Latin-1 in 0x18..0x20 and 0x80..0xA0.
fn pdf_doc_char(byte: u8) -> char {
    const HIGH: [char; 32] = [
        '\u{2022}', '\u{2020}', '\u{2021}', '\u{2026}', '\u{2014}', '\u{2013}', '\u{0192}', '\u{2044}', '\u{2039}',
        '\u{203A}', '\u{2212}', '\u{2030}', '\u{201E}', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{201A}',
        '\u{2122}', '\u{FB01}', '\u{FB02}', '\u{0141}', '\u{0152}', '\u{0160}', '\u{0178}', '\u{017D}', '\u{0131}',
        '\u{0142}', '\u{0153}', '\u{0161}', '\u{017E}', '\u{FFFD}',
    ];
    const LOW: [char; 8] = [
        '\u{02D8}', '\u{02C7}', '\u{02C6}', '\u{02D9}', '\u{02DD}', '\u{02DB}', '\u{02DA}', '\u{02DC}',
    ];
    match byte {
        0x18..=0x1F => LOW[(byte - 0x18) as usize],
        0x80..=0x9F => HIGH[(byte - 0x80) as usize],
        0xA0 => '\u{20AC}',
        _ => byte as char,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_preserves_lexeme() {
        let real = Real::from_lexeme("1.50").unwrap();
        assert_eq!(real.lexeme(), "1.50");
        assert_eq!(real.value(), 1.5);
        assert!(Real::from_lexeme("1.5.0").is_none());
        assert!(Real::from_lexeme("+.5").is_some());
        assert!(Real::from_lexeme(".").is_none());
    }

    #[test]
    fn real_formatting_is_locale_independent() {
        assert_eq!(Real::from_value(1.5, 4, false).lexeme(), "1.5000");
        assert_eq!(Real::from_value(1.5, 4, true).lexeme(), "1.5");
        assert_eq!(Real::from_value(2.0, 2, true).lexeme(), "2");
        assert_eq!(Real::from_value(-0.0001, 2, true).lexeme(), "0");
    }

    #[test]
    fn dictionary_preserves_insertion_order() {
        let mut dict = Dictionary::new();
        dict.set("Zebra", 1);
        dict.set("Apple", 2);
        dict.set("Mango", 3);
        let keys: Vec<_> = dict.keys().map(|k| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"Zebra"[..], b"Apple", b"Mango"]);
        assert!(dict.get_or_null(b"Missing").is_null());
    }

    #[test]
    fn merge_resources_renames_conflicts_deterministically() {
        let mut ours = crate::dictionary! {
            "Font" => crate::dictionary! { "F1" => Object::Reference((1, 0)) },
        };
        let theirs = crate::dictionary! {
            "Font" => crate::dictionary! {
                "F1" => Object::Reference((2, 0)),
                "F2" => Object::Reference((3, 0)),
            },
        };
        let renames = ours.merge_resources(&theirs);
        assert_eq!(renames, vec![(b"F1".to_vec(), b"F11".to_vec())]);
        let fonts = ours.get(b"Font").unwrap().as_dict().unwrap();
        assert_eq!(fonts.get(b"F11").unwrap().as_reference().unwrap(), (2, 0));
        assert_eq!(fonts.get(b"F2").unwrap().as_reference().unwrap(), (3, 0));

        // Re-merging the identical input is a no-op beyond a fresh suffix.
        let mut again = crate::dictionary! {
            "Font" => crate::dictionary! { "F1" => Object::Reference((1, 0)) },
        };
        let renames_again = again.merge_resources(&theirs);
        assert_eq!(renames, renames_again);
    }

    #[test]
    fn text_string_decoding_recognizes_boms() {
        assert_eq!(decode_text_string(b"\xFE\xFF\x00H\x00i"), "Hi");
        assert_eq!(decode_text_string(b"\xFF\xFEH\x00i\x00"), "Hi");
        assert_eq!(decode_text_string(b"\xEF\xBB\xBFHi"), "Hi");
        // PDFDocEncoding: 0x92 is a right single quote.
        assert_eq!(decode_text_string(b"it\x92s"), "it\u{2019}s");
    }

    #[test]
    fn text_string_encoding_round_trips() {
        assert_eq!(encode_text_string("plain"), b"plain");
        let encoded = encode_text_string("Grün");
        assert!(encoded.starts_with(&[0xFE, 0xFF]));
        assert_eq!(decode_text_string(&encoded), "Grün");
    }

    #[test]
    fn accessors_report_type_mismatches() {
        let obj = Object::Name(b"Catalog".to_vec());
        match obj.as_i64() {
            Err(Error::ObjectType { expected, found }) => {
                assert_eq!(expected, "Integer");
                assert_eq!(found, "Name");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn stream_filter_chain_normalizes_to_arrays() {
        let stream = Stream::new(
            crate::dictionary! {
                "Filter" => Object::Name(b"FlateDecode".to_vec()),
            },
            vec![1, 2, 3],
        );
        assert_eq!(stream.filters(), vec![b"FlateDecode".to_vec()]);
        assert_eq!(stream.decode_parms(), vec![None]);
        assert_eq!(stream.dict.get(b"Length").unwrap().as_i64().unwrap(), 3);
    }
}
