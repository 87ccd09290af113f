//! Copying objects between documents while preserving reference identity:
//! the same foreign id always maps to the same local id within one copier.

use std::collections::{HashMap, HashSet};

use log::warn;

use crate::object::{StreamData, StreamProvider};
use crate::{Dictionary, Document, Error, Object, ObjectId, Result, Stream};

/// Copies objects from one foreign document into a target, remembering the
/// id mapping across calls. Keep one copier per (source, target) pair for
/// the lifetime of the operation; reusing it makes repeated copies share
/// their common subobjects.
#[derive(Default)]
pub struct ForeignCopier {
    /// foreign id -> local id
    map: HashMap<ObjectId, ObjectId>,
    /// Foreign page objects reached by reference; they read as null in the
    /// copy rather than dragging the page tree along.
    null_mapped: HashSet<ObjectId>,
    immediate: bool,
}

impl ForeignCopier {
    pub fn new() -> ForeignCopier {
        ForeignCopier::default()
    }

    /// Materialize foreign stream payloads into local buffers at copy time
    /// instead of piping them lazily at write time.
    pub fn with_immediate_copy() -> ForeignCopier {
        ForeignCopier {
            immediate: true,
            ..ForeignCopier::default()
        }
    }

    /// The local id a foreign id was copied to, if it has been.
    pub fn mapped(&self, foreign: ObjectId) -> Option<ObjectId> {
        self.map.get(&foreign).copied()
    }

    /// Copy the object graph rooted at `root` from `source` into `target`
    /// and return the local id of the root.
    ///
    /// Reachable foreign page objects other than the root itself are not
    /// copied; references to them become null. /Parent entries of page
    /// dictionaries are dropped so a page copy does not drag in the whole
    /// tree; the page manager re-parents inserted pages.
    pub fn copy_object(&mut self, target: &mut Document, source: &Document, root: ObjectId) -> Result<ObjectId> {
        if let Some(local) = self.map.get(&root) {
            return Ok(*local);
        }

        // Phase 1: discover every reachable foreign id and reserve a local
        // slot for it. Reserved placeholders keep cycles finite.
        let mut discovered: Vec<ObjectId> = Vec::new();
        let mut queue: Vec<ObjectId> = vec![root];
        while let Some(id) = queue.pop() {
            if self.map.contains_key(&id) || self.null_mapped.contains(&id) {
                continue;
            }
            let object = source.get_object(id)?;
            if id != root && is_page(object) {
                self.null_mapped.insert(id);
                continue;
            }
            let local = target.add_object(Object::Reserved);
            self.map.insert(id, local);
            discovered.push(id);
            collect_copy_references(object, &mut |child| {
                if !self.map.contains_key(&child) && !self.null_mapped.contains(&child) && !queue.contains(&child) {
                    queue.push(child);
                }
            });
        }

        // Phase 2: clone each discovered object, substituting references
        // through the mapping, and replace its placeholder.
        for id in discovered {
            let object = source.get_object(id)?;
            let copy = self.clone_with_map(source, object)?;
            let local = self.map[&id];
            target.objects.insert(local, copy);
        }

        Ok(self.map[&root])
    }

    fn clone_with_map(&self, source: &Document, object: &Object) -> Result<Object> {
        Ok(match object {
            Object::Reference(id) => {
                if self.null_mapped.contains(id) {
                    Object::Null
                } else {
                    match self.map.get(id) {
                        Some(local) => Object::Reference(*local),
                        None => {
                            warn!(
                                "reference to unmapped foreign object {} {}, treating as null",
                                id.0, id.1
                            );
                            Object::Null
                        }
                    }
                }
            }
            Object::Array(items) => Object::Array(
                items
                    .iter()
                    .map(|item| self.clone_with_map(source, item))
                    .collect::<Result<_>>()?,
            ),
            Object::Dictionary(dict) => Object::Dictionary(self.clone_dict_with_map(source, dict)?),
            Object::Stream(stream) => {
                let dict = self.clone_dict_with_map(source, &stream.dict)?;
                let data = self.clone_stream_data(source, stream)?;
                let mut copy = Stream {
                    dict,
                    data,
                    allows_compression: stream.allows_compression,
                    start_position: None,
                };
                let buffer_length = match copy.data() {
                    StreamData::Buffer(bytes) => Some(bytes.len() as i64),
                    _ => None,
                };
                if let Some(length) = buffer_length {
                    copy.dict.set("Length", length);
                }
                Object::Stream(copy)
            }
            other => other.clone(),
        })
    }

    fn clone_dict_with_map(&self, source: &Document, dict: &Dictionary) -> Result<Dictionary> {
        let skip_parent = dict.has_type(b"Page");
        let mut out = Dictionary::new();
        for (key, value) in dict.iter() {
            if skip_parent && key.as_slice() == b"Parent" {
                continue;
            }
            out.set(key.clone(), self.clone_with_map(source, value)?);
        }
        Ok(out)
    }

    /// A copied stream keeps its payload lazy by default: the provider
    /// captures the foreign source range, not the bytes. Foreign files are
    /// commonly much larger than the objects taken from them.
    fn clone_stream_data(&self, source: &Document, stream: &Stream) -> Result<StreamData> {
        match stream.data() {
            StreamData::Buffer(bytes) => Ok(StreamData::Buffer(bytes.clone())),
            StreamData::Provider(provider) => Ok(StreamData::Provider(provider.clone())),
            StreamData::Range { offset, length } => {
                if self.immediate {
                    return Ok(StreamData::Buffer(source.raw_stream_bytes(stream)?));
                }
                let foreign_source = source
                    .source
                    .clone()
                    .ok_or_else(|| Error::InvalidStream("foreign stream range without a source buffer".to_string()))?;
                let (offset, length) = (*offset, *length);
                if offset + length > foreign_source.len() {
                    return Err(Error::InvalidStream("foreign stream range outside its source".to_string()));
                }
                Ok(StreamData::Provider(StreamProvider::new(move |sink| {
                    sink(&foreign_source[offset..offset + length])
                })))
            }
        }
    }
}

fn is_page(object: &Object) -> bool {
    object
        .as_dict()
        .map(|dict| dict.has_type(b"Page") && !object.is_stream())
        .unwrap_or(false)
}

/// References reachable from `object` for copying purposes: /Parent edges
/// of page dictionaries are not followed.
fn collect_copy_references(object: &Object, found: &mut impl FnMut(ObjectId)) {
    match object {
        Object::Reference(id) => found(*id),
        Object::Array(items) => {
            for item in items {
                collect_copy_references(item, found);
            }
        }
        Object::Dictionary(dict) => {
            let skip_parent = dict.has_type(b"Page");
            for (key, value) in dict.iter() {
                if skip_parent && key.as_slice() == b"Parent" {
                    continue;
                }
                collect_copy_references(value, found);
            }
        }
        Object::Stream(stream) => {
            for (_, value) in stream.dict.iter() {
                collect_copy_references(value, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary;

    #[test]
    fn identity_is_preserved_across_copies() {
        let mut source = Document::new();
        let shared = source.add_object(Object::Integer(42));
        let a = source.add_object(dictionary! { "Shared" => Object::Reference(shared) });
        let b = source.add_object(dictionary! { "Shared" => Object::Reference(shared) });

        let mut target = Document::new();
        let mut copier = ForeignCopier::new();
        let local_a = copier.copy_object(&mut target, &source, a).unwrap();
        let local_b = copier.copy_object(&mut target, &source, b).unwrap();

        let shared_a = target
            .get_dictionary(local_a)
            .unwrap()
            .get(b"Shared")
            .unwrap()
            .as_reference()
            .unwrap();
        let shared_b = target
            .get_dictionary(local_b)
            .unwrap()
            .get(b"Shared")
            .unwrap()
            .as_reference()
            .unwrap();
        // The same foreign object maps to the same local object.
        assert_eq!(shared_a, shared_b);
        assert_eq!(target.get_object(shared_a).unwrap().as_i64().unwrap(), 42);
    }

    #[test]
    fn cycles_are_broken_by_placeholders() {
        let mut source = Document::new();
        let first = source.add_object(Object::Null);
        let second = source.add_object(dictionary! { "Back" => Object::Reference(first) });
        source
            .objects
            .insert(first, Object::Dictionary(dictionary! { "Next" => Object::Reference(second) }));

        let mut target = Document::new();
        let mut copier = ForeignCopier::new();
        let local_first = copier.copy_object(&mut target, &source, first).unwrap();
        let local_second = target
            .get_dictionary(local_first)
            .unwrap()
            .get(b"Next")
            .unwrap()
            .as_reference()
            .unwrap();
        let back = target
            .get_dictionary(local_second)
            .unwrap()
            .get(b"Back")
            .unwrap()
            .as_reference()
            .unwrap();
        assert_eq!(back, local_first);
        // No placeholder survives the copy.
        assert!(
            !target
                .objects
                .values()
                .any(|object| matches!(object, Object::Reserved))
        );
    }

    #[test]
    fn mutating_the_source_after_copy_does_not_affect_the_target() {
        let mut source = Document::new();
        let font = source.add_object(dictionary! { "Type" => "Font", "BaseFont" => "Helvetica" });
        let mut target = Document::new();
        let mut copier = ForeignCopier::new();
        let local_font = copier.copy_object(&mut target, &source, font).unwrap();

        source
            .get_dictionary_mut(font)
            .unwrap()
            .set("BaseFont", Object::Name(b"Courier".to_vec()));
        let copied = target.get_dictionary(local_font).unwrap();
        assert_eq!(copied.get(b"BaseFont").unwrap().as_name().unwrap(), b"Helvetica");
    }

    #[test]
    fn foreign_pages_read_as_null_and_parent_is_dropped() {
        let mut source = Document::new();
        let other_page = source.add_object(dictionary! { "Type" => "Page" });
        let parent = source.add_object(dictionary! { "Type" => "Pages" });
        let page = source.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(parent),
            "Other" => Object::Reference(other_page),
        });

        let mut target = Document::new();
        let mut copier = ForeignCopier::new();
        let local_page = copier.copy_object(&mut target, &source, page).unwrap();
        let copied = target.get_dictionary(local_page).unwrap();
        assert!(!copied.has(b"Parent"));
        assert!(copied.get(b"Other").unwrap().is_null());
        // The foreign pages tree was not copied.
        assert_eq!(target.objects.len(), 1);
    }

    #[test]
    fn stream_copies_are_lazy_by_default_and_materialized_on_request() {
        let mut source = Document::new();
        let payload = b"stream bytes living in the source file".to_vec();
        source.source = Some(std::sync::Arc::from(payload.as_slice()));
        let stream = Stream::with_range(dictionary! { "Length" => 38 }, 0, payload.len());
        let stream_id = source.add_object(Object::Stream(stream));

        let mut target = Document::new();
        let mut copier = ForeignCopier::new();
        let local = copier.copy_object(&mut target, &source, stream_id).unwrap();
        let copied = target.get_object(local).unwrap().as_stream().unwrap();
        assert!(matches!(copied.data(), StreamData::Provider(_)));
        assert_eq!(target.raw_stream_bytes(copied).unwrap(), payload);

        let mut target2 = Document::new();
        let mut copier = ForeignCopier::with_immediate_copy();
        let local = copier.copy_object(&mut target2, &source, stream_id).unwrap();
        let copied = target2.get_object(local).unwrap().as_stream().unwrap();
        assert!(matches!(copied.data(), StreamData::Buffer(_)));
        assert_eq!(copied.content().unwrap(), payload.as_slice());
    }
}
