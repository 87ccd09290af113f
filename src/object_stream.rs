//! Object streams (/Type /ObjStm): several non-stream objects stored
//! inside one compressed stream.

use std::collections::BTreeMap;

use log::warn;

use crate::error::Warning;
use crate::parser::ObjectSource;
use crate::{Dictionary, Error, Object, ObjectId, Result, Stream};

/// A decoded object stream: the contained objects, parsed.
pub struct ObjectStream {
    pub objects: BTreeMap<ObjectId, Object>,
    pub warnings: Vec<Warning>,
}

impl ObjectStream {
    /// Parse the decoded payload of an object stream. The prefix holds /N
    /// pairs of (object number, offset relative to /First); each offset is
    /// recorded and the objects are parsed from their ranges.
    pub fn parse(dict: &Dictionary, data: &[u8]) -> Result<ObjectStream> {
        let count = dict
            .get(b"N")
            .and_then(Object::as_i64)
            .map_err(|_| Error::InvalidStream("object stream has no /N".to_string()))?;
        let first = dict
            .get(b"First")
            .and_then(Object::as_i64)
            .map_err(|_| Error::InvalidStream("object stream has no /First".to_string()))?;
        if count < 0 || first < 0 || first as usize > data.len() {
            return Err(Error::InvalidStream("object stream header is out of range".to_string()));
        }
        let first = first as usize;

        // The pair prefix is plain tokens: id offset id offset ...
        let mut source = ObjectSource::new(&data[..first], 0);
        let mut ranges: Vec<(u32, usize)> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id_token = source.next_token();
            let offset_token = source.next_token();
            let (Some(id), Some(offset)) = (token_u64(&id_token), token_u64(&offset_token)) else {
                warn!("object stream prefix is damaged, keeping {} objects", ranges.len());
                break;
            };
            ranges.push((id as u32, offset as usize));
        }

        let mut objects = BTreeMap::new();
        let mut warnings = source.warnings;
        for (id, relative) in ranges {
            let offset = first + relative;
            if offset >= data.len() {
                warn!("object {id} 0 starts beyond the object stream payload");
                continue;
            }
            let mut object_source = ObjectSource::new(data, offset);
            match object_source.read_object(0) {
                Ok(object) => {
                    // Compressed objects always have generation zero.
                    objects.insert((id, 0), object);
                }
                Err(err) => {
                    warn!("object {id} 0 in object stream failed to parse: {err}");
                }
            }
            warnings.append(&mut object_source.warnings);
        }

        Ok(ObjectStream { objects, warnings })
    }
}

fn token_u64(token: &crate::tokenizer::Token) -> Option<u64> {
    if token.kind != crate::tokenizer::TokenKind::Integer {
        return None;
    }
    std::str::from_utf8(&token.value).ok()?.parse().ok()
}

/// Caps applied when packing objects into a stream on write.
pub const MAX_OBJECTS_PER_STREAM: usize = 100;

/// Write-side packer. Objects arrive already serialized; the builder lays
/// out the pair prefix and the payload.
#[derive(Default)]
pub struct ObjectStreamBuilder {
    entries: Vec<(u32, Vec<u8>)>,
}

impl ObjectStreamBuilder {
    pub fn new() -> ObjectStreamBuilder {
        ObjectStreamBuilder { entries: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_OBJECTS_PER_STREAM
    }

    /// Queue one serialized object. Ids must already be renumbered; only
    /// generation-zero objects can live in an object stream.
    pub fn push(&mut self, id: u32, serialized: Vec<u8>) {
        self.entries.push((id, serialized));
    }

    /// Index of `id` within this stream, for the type-2 xref entry.
    pub fn index_of(&self, id: u32) -> Option<u16> {
        self.entries.iter().position(|(entry, _)| *entry == id).map(|i| i as u16)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    /// Assemble the /ObjStm stream object, Flate-compressed.
    pub fn build(&self) -> Stream {
        let mut prefix = Vec::new();
        let mut payload = Vec::new();
        let mut scratch = itoa::Buffer::new();
        for (id, serialized) in &self.entries {
            prefix.extend_from_slice(scratch.format(*id).as_bytes());
            prefix.push(b' ');
            prefix.extend_from_slice(scratch.format(payload.len()).as_bytes());
            prefix.push(b' ');
            payload.extend_from_slice(serialized);
            payload.push(b'\n');
        }

        let mut body = prefix;
        let first = body.len();
        body.extend_from_slice(&payload);
        let compressed = crate::filters::flate_encode(&body);

        let mut dict = Dictionary::new();
        dict.set("Type", Object::Name(b"ObjStm".to_vec()));
        dict.set("N", self.entries.len() as i64);
        dict.set("First", first as i64);
        dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
        Stream::new(dict, compressed)
    }
}
