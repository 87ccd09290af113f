use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::warn;

use crate::encryption::EncryptionState;
use crate::error::{ErrorKind, Warning, MAX_WARNINGS};
use crate::filters::FilterRegistry;
use crate::object::StreamData;
use crate::xref::Xref;
use crate::{Dictionary, Error, Object, ObjectId, Result, Stream};

/// An in-memory PDF document: the object table, the trailer, and the
/// cross-reference information it was loaded with.
pub struct Document {
    /// PDF version from the header, e.g. "1.7".
    pub version: String,
    /// The high-bit comment bytes on line 2, kept for round-tripping.
    pub binary_mark: Vec<u8>,
    pub trailer: Dictionary,
    pub reference_table: Xref,
    /// Indirect objects, keyed by (object number, generation).
    pub objects: BTreeMap<ObjectId, Object>,
    /// Largest object number in use.
    pub max_id: u32,
    /// Offset of the last cross-reference section in the input.
    pub xref_start: usize,
    /// Present when the document was loaded from an encrypted file or has
    /// been prepared for encrypted output.
    pub encryption_state: Option<EncryptionState>,
    /// The original input, kept so stream payloads can stay as ranges
    /// instead of copies.
    pub(crate) source: Option<Arc<[u8]>>,
    /// Recoverable problems encountered so far.
    warnings: Vec<Warning>,
    /// Set when the cross-reference table had to be rebuilt by scanning.
    pub(crate) xref_reconstructed: bool,
    /// Warnings past this count become a hard error.
    pub max_warnings: usize,
    /// Caller-registered stream filters.
    pub(crate) filter_registry: FilterRegistry,
    /// Cached ordered page list; invalidated by page-tree mutation.
    pub(crate) page_cache: Option<Vec<ObjectId>>,
    /// Set once inherited page attributes have been pushed to the leaves.
    pub(crate) pages_flattened: bool,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("version", &self.version)
            .field("objects", &self.objects.len())
            .field("max_id", &self.max_id)
            .field("encrypted", &self.encryption_state.is_some())
            .finish()
    }
}

impl Default for Document {
    fn default() -> Document {
        Document::new()
    }
}

impl Document {
    pub fn new() -> Document {
        Document {
            version: "1.4".to_string(),
            binary_mark: Vec::new(),
            trailer: Dictionary::new(),
            reference_table: Xref::new(),
            objects: BTreeMap::new(),
            max_id: 0,
            xref_start: 0,
            encryption_state: None,
            source: None,
            warnings: Vec::new(),
            xref_reconstructed: false,
            max_warnings: MAX_WARNINGS,
            filter_registry: FilterRegistry::new(),
            page_cache: None,
            pages_flattened: false,
        }
    }

    pub fn with_version(version: impl Into<String>) -> Document {
        let mut document = Document::new();
        document.version = version.into();
        document
    }

    /// The header version as (major, minor), tolerating junk.
    pub fn version_number(&self) -> (u8, u8) {
        let mut parts = self.version.splitn(2, '.');
        let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(4);
        (major, minor)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_state.is_some() || self.trailer.has(b"Encrypt")
    }

    /// Whether the cross-reference table had to be rebuilt by scanning the
    /// whole file.
    pub fn xref_was_reconstructed(&self) -> bool {
        self.xref_reconstructed
    }

    pub fn get_object(&self, id: ObjectId) -> Result<&Object> {
        self.objects.get(&id).ok_or(Error::ObjectNotFound(id))
    }

    pub fn get_object_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        self.objects.get_mut(&id).ok_or(Error::ObjectNotFound(id))
    }

    pub fn has_object(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Follow reference chains to the underlying object. Returns the id of
    /// the final reference followed, if any.
    pub fn dereference<'a>(&'a self, mut object: &'a Object) -> Result<(Option<ObjectId>, &'a Object)> {
        let mut id = None;
        let mut seen = HashSet::new();
        while let Object::Reference(reference) = object {
            if !seen.insert(*reference) {
                return Err(Error::ReferenceCycle(*reference));
            }
            id = Some(*reference);
            object = self.get_object(*reference)?;
        }
        Ok((id, object))
    }

    /// `get_object` plus reference following.
    pub fn get_dereferenced(&self, id: ObjectId) -> Result<&Object> {
        let object = self.get_object(id)?;
        Ok(self.dereference(object)?.1)
    }

    pub fn get_dictionary(&self, id: ObjectId) -> Result<&Dictionary> {
        self.get_dereferenced(id).and_then(Object::as_dict)
    }

    pub fn get_dictionary_mut(&mut self, id: ObjectId) -> Result<&mut Dictionary> {
        self.get_object_mut(id).and_then(Object::as_dict_mut)
    }

    /// Dictionary lookup that follows an indirect value.
    pub fn get_dict_entry<'a>(&'a self, dict: &'a Dictionary, key: &[u8]) -> Result<&'a Object> {
        let value = dict.get(key)?;
        Ok(self.dereference(value)?.1)
    }

    /// Allocate the next free object id.
    pub fn new_object_id(&mut self) -> ObjectId {
        self.max_id += 1;
        (self.max_id, 0)
    }

    /// Store an object under a fresh id and return the id.
    pub fn add_object<T: Into<Object>>(&mut self, object: T) -> ObjectId {
        self.max_id += 1;
        let id = (self.max_id, 0);
        self.objects.insert(id, object.into());
        id
    }

    /// The catalog dictionary referenced by the trailer /Root.
    pub fn catalog(&self) -> Result<&Dictionary> {
        self.trailer
            .get(b"Root")
            .and_then(Object::as_reference)
            .and_then(|id| self.get_dictionary(id))
    }

    pub fn catalog_mut(&mut self) -> Result<&mut Dictionary> {
        let id = self.trailer.get(b"Root").and_then(Object::as_reference)?;
        self.get_dictionary_mut(id)
    }

    /// Recursively replace indirect references below `object` with copies
    /// of their targets. Streams cannot be embedded; with `allow_streams`
    /// references to streams are preserved as references, otherwise they
    /// are an error. Cycles through arrays and dictionaries are an error.
    pub fn make_object_direct(&self, object: &Object, allow_streams: bool) -> Result<Object> {
        let mut visiting = HashSet::new();
        self.make_direct_inner(object, allow_streams, &mut visiting)
    }

    fn make_direct_inner(
        &self,
        object: &Object,
        allow_streams: bool,
        visiting: &mut HashSet<ObjectId>,
    ) -> Result<Object> {
        match object {
            Object::Reference(id) => {
                if visiting.contains(id) {
                    return Err(Error::ReferenceCycle(*id));
                }
                let target = self.get_object(*id)?;
                if target.is_stream() {
                    return if allow_streams {
                        Ok(Object::Reference(*id))
                    } else {
                        Err(Error::ObjectType {
                            expected: "non-stream",
                            found: "Stream",
                        })
                    };
                }
                visiting.insert(*id);
                let result = self.make_direct_inner(target, allow_streams, visiting);
                visiting.remove(id);
                result
            }
            Object::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.make_direct_inner(item, allow_streams, visiting)?);
                }
                Ok(Object::Array(out))
            }
            Object::Dictionary(dict) => {
                let mut out = Dictionary::new();
                for (key, value) in dict.iter() {
                    out.set(key.clone(), self.make_direct_inner(value, allow_streams, visiting)?);
                }
                Ok(Object::Dictionary(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// The raw, still-filtered payload of a stream.
    pub fn raw_stream_bytes(&self, stream: &Stream) -> Result<Vec<u8>> {
        match stream.data() {
            StreamData::Buffer(bytes) => Ok(bytes.clone()),
            StreamData::Range { offset, length } => {
                let source = self
                    .source
                    .as_ref()
                    .ok_or_else(|| Error::InvalidStream("stream range without a source buffer".to_string()))?;
                source
                    .get(*offset..*offset + *length)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| Error::InvalidStream("stream range outside the source buffer".to_string()))
            }
            StreamData::Provider(provider) => provider.collect(),
        }
    }

    /// Record a recoverable problem. Errors out when the warning cap is
    /// exceeded.
    pub(crate) fn warn(
        &mut self,
        kind: ErrorKind,
        object: impl Into<String>,
        offset: Option<usize>,
        message: impl Into<String>,
    ) -> Result<()> {
        let warning = Warning {
            kind,
            object: object.into(),
            offset,
            message: message.into(),
        };
        warn!("{warning}");
        self.warnings.push(warning);
        if self.warnings.len() > self.max_warnings {
            return Err(Error::TooManyWarnings(self.warnings.len()));
        }
        Ok(())
    }

    /// Drain accumulated warnings.
    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Tear the document down: every cached object is replaced with the
    /// `Destroyed` sentinel so stale ids resolve to a defined value, then
    /// the structural tables are cleared.
    pub fn destroy(&mut self) {
        for object in self.objects.values_mut() {
            *object = Object::Destroyed;
        }
        self.trailer = Dictionary::new();
        self.reference_table.clear();
        self.page_cache = None;
        self.source = None;
        self.encryption_state = None;
    }

    /// Remove objects not reachable from the trailer.
    pub fn prune_unreferenced(&mut self) -> usize {
        let mut reachable = HashSet::new();
        let mut queue: Vec<ObjectId> = Vec::new();
        collect_references(&Object::Dictionary(self.trailer.clone()), &mut |id| {
            if reachable.insert(id) {
                queue.push(id);
            }
        });
        while let Some(id) = queue.pop() {
            if let Ok(object) = self.get_object(id) {
                collect_references(object, &mut |child| {
                    if reachable.insert(child) {
                        queue.push(child);
                    }
                });
            }
        }
        let before = self.objects.len();
        self.objects.retain(|id, _| reachable.contains(id));
        before - self.objects.len()
    }
}

/// Invoke `found` for every reference directly inside `object`.
pub(crate) fn collect_references(object: &Object, found: &mut impl FnMut(ObjectId)) {
    match object {
        Object::Reference(id) => found(*id),
        Object::Array(items) => {
            for item in items {
                collect_references(item, found);
            }
        }
        Object::Dictionary(dict) => {
            for (_, value) in dict.iter() {
                collect_references(value, found);
            }
        }
        Object::Stream(stream) => {
            for (_, value) in stream.dict.iter() {
                collect_references(value, found);
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
    fn add_object_assigns_sequential_ids() {
        let mut doc = Document::new();
        let a = doc.add_object(Object::Integer(1));
        let b = doc.add_object(Object::Integer(2));
        assert_eq!(a, (1, 0));
        assert_eq!(b, (2, 0));
        assert_eq!(doc.get_object(a).unwrap().as_i64().unwrap(), 1);
    }

    #[test]
    fn dereference_follows_chains_and_detects_cycles() {
        let mut doc = Document::new();
        let target = doc.add_object(Object::Integer(7));
        let hop = doc.add_object(Object::Reference(target));
        let hop_ref = Object::Reference(hop);
        let (id, object) = doc.dereference(&hop_ref).unwrap();
        assert_eq!(id, Some(target));
        assert_eq!(object.as_i64().unwrap(), 7);

        doc.objects.insert(target, Object::Reference(hop));
        assert!(matches!(
            doc.dereference(&Object::Reference(hop)),
            Err(Error::ReferenceCycle(_))
        ));
    }

    #[test]
    fn make_direct_embeds_targets_and_is_idempotent() {
        let mut doc = Document::new();
        let inner = doc.add_object(Object::Integer(5));
        let value = Object::Array(vec![
            Object::Reference(inner),
            Object::Dictionary(dictionary! { "K" => Object::Reference(inner) }),
        ]);
        let direct = doc.make_object_direct(&value, false).unwrap();
        let again = doc.make_object_direct(&direct, false).unwrap();
        assert_eq!(direct, again);
        assert_eq!(direct.as_array().unwrap()[0].as_i64().unwrap(), 5);
    }

    #[test]
    fn make_direct_rejects_cycles() {
        let mut doc = Document::new();
        let id = doc.add_object(Object::Null);
        doc.objects
            .insert(id, Object::Array(vec![Object::Reference(id)]));
        assert!(doc.make_object_direct(&Object::Reference(id), false).is_err());
    }

    #[test]
    fn make_direct_streams_require_opt_in() {
        let mut doc = Document::new();
        let stream = doc.add_object(Stream::new(Dictionary::new(), vec![1, 2, 3]));
        let value = Object::Reference(stream);
        assert!(doc.make_object_direct(&value, false).is_err());
        let kept = doc.make_object_direct(&value, true).unwrap();
        assert_eq!(kept, Object::Reference(stream));
    }

    #[test]
    fn destroy_marks_objects() {
        let mut doc = Document::new();
        let id = doc.add_object(Object::Integer(1));
        doc.destroy();
        assert_eq!(doc.get_object(id).unwrap(), &Object::Destroyed);
    }

    #[test]
    fn prune_unreferenced_drops_orphans() {
        let mut doc = Document::new();
        let kept = doc.add_object(Object::Integer(1));
        let _orphan = doc.add_object(Object::Integer(2));
        doc.trailer.set("Root", Object::Reference(kept));
        assert_eq!(doc.prune_unreferenced(), 1);
        assert!(doc.has_object(kept));
        assert_eq!(doc.objects.len(), 1);
    }

    #[test]
    fn warning_cap_errors_out() {
        let mut doc = Document::new();
        doc.max_warnings = 2;
        doc.warn(ErrorKind::DamagedPdf, "", None, "one").unwrap();
        doc.warn(ErrorKind::DamagedPdf, "", None, "two").unwrap();
        assert!(doc.warn(ErrorKind::DamagedPdf, "", None, "three").is_err());
        assert_eq!(doc.take_warnings().len(), 3);
    }
}
