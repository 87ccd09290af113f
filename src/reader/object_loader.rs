use std::collections::HashSet;

use super::Reader;
use crate::object_stream::ObjectStream;
use crate::parser;
use crate::xref::XrefEntry;
use crate::{Error, Object, ObjectId, Result};

impl Reader<'_> {
    /// Resolve one object through the cross-reference table. Used while
    /// parsing (indirect /Length entries) before the document table is
    /// complete.
    pub(crate) fn get_object(&self, id: ObjectId, already_seen: &mut HashSet<ObjectId>) -> Result<Object> {
        if let Some(cached) = self.document.objects.get(&id) {
            return Ok(cached.clone());
        }
        if already_seen.contains(&id) {
            return Err(Error::ReferenceCycle(id));
        }
        already_seen.insert(id);

        if let Some(entry) = self.document.reference_table.get(id.0) {
            if entry.is_compressed() {
                return self.get_compressed_object(id);
            }
        }

        let offset = self.get_offset(id)?;
        let (_, object) = self.read_object(offset as usize, Some(id), already_seen)?;
        Ok(object)
    }

    /// Object offset from the cross-reference table.
    pub(super) fn get_offset(&self, id: ObjectId) -> Result<u32> {
        let entry = self.document.reference_table.get(id.0).ok_or(Error::MissingXrefEntry)?;
        match *entry {
            XrefEntry::Normal { offset, generation } if generation == id.1 => Ok(offset),
            _ => Err(Error::MissingXrefEntry),
        }
    }

    /// Decode the containing object stream and pick one object out of it.
    pub(super) fn get_compressed_object(&self, id: ObjectId) -> Result<Object> {
        let entry = self.document.reference_table.get(id.0).ok_or(Error::MissingXrefEntry)?;
        let container = match entry {
            XrefEntry::Compressed { container, .. } => *container,
            _ => return Err(Error::MissingXrefEntry),
        };

        let mut already_seen = HashSet::new();
        let container_object = self.get_object((container, 0), &mut already_seen)?;
        let stream = container_object.as_stream()?;
        let raw = self.raw_range_bytes(stream)?;
        let decoded = if stream.dict.has(b"Filter") {
            crate::filters::decode_data(
                self.filter_registry(),
                &stream.filters(),
                &stream.decode_parms(),
                &raw,
            )?
        } else {
            raw
        };
        let parsed = ObjectStream::parse(&stream.dict, &decoded)?;
        parsed.objects.get(&id).cloned().ok_or(Error::MissingXrefEntry)
    }

    pub(crate) fn read_object(
        &self,
        offset: usize,
        expected_id: Option<ObjectId>,
        already_seen: &mut HashSet<ObjectId>,
    ) -> Result<(ObjectId, Object)> {
        if offset > self.buffer.len() {
            return Err(Error::InvalidOffset(offset));
        }
        parser::indirect_object(self.buffer, offset, expected_id, self, already_seen)
    }
}
