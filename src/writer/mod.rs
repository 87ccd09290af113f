//! The writer: serializes the object graph with fresh sequential ids,
//! applies the stream and encryption decisions, and finishes with either a
//! classic cross-reference table or a cross-reference stream.

mod linearize;
pub(crate) mod serialize;

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};

use crate::document::collect_references;
use crate::encryption::{CryptMethod, EncryptionState};
use crate::error::ErrorKind;
use crate::filters::{can_strip_filters, DecodeLevel};
use crate::object_stream::{ObjectStreamBuilder, MAX_OBJECTS_PER_STREAM};
use crate::{Dictionary, Document, Error, Object, ObjectId, Result, Stream, StringFormat};

/// The bytes used for /ID in static-id mode.
const STATIC_FILE_ID: [u8; 16] = [
    0x31, 0x41, 0x59, 0x26, 0x53, 0x58, 0x97, 0x93, 0x23, 0x84, 0x62, 0x64, 0x33, 0x83, 0x27, 0x95,
];

/// Fallback high-bit comment for the second line of the header.
const DEFAULT_BINARY_MARK: [u8; 4] = [0xE2, 0xE3, 0xCF, 0xD3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectStreamMode {
    /// Never write object streams.
    Disable,
    /// Keep the input's grouping of compressed objects.
    #[default]
    Preserve,
    /// Pack every eligible object into object streams.
    Generate,
}

/// Legacy composite switch covering decode level and compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDataMode {
    Uncompress,
    Preserve,
    Compress,
}

#[derive(Clone, Default)]
pub enum EncryptionIntent {
    /// Re-encrypt with the parameters the document was loaded with.
    #[default]
    Preserve,
    /// Write decrypted output.
    Remove,
    /// Encrypt with freshly derived parameters.
    Encrypt(EncryptionState),
}

#[derive(Clone, Default)]
pub struct SaveOptions {
    pub object_stream_mode: ObjectStreamMode,
    /// Overrides `compress_streams` and `decode_level` when set.
    pub stream_data_mode: Option<StreamDataMode>,
    pub compress_streams: bool,
    pub decode_level: DecodeLevel,
    /// Round-trip already-Flate-compressed streams through decode and
    /// encode.
    pub recompress_flate: bool,
    /// Normalize line endings in page content streams.
    pub content_normalization: bool,
    /// Pretty-print objects and insert origin comments.
    pub qdf_mode: bool,
    /// Keep indirect objects not reachable from the trailer.
    pub preserve_unreferenced: bool,
    pub newline_before_endstream: bool,
    pub linearize: bool,
    /// Emit the PCLm header and disable object streams.
    pub pclm: bool,
    pub min_pdf_version: Option<String>,
    pub force_pdf_version: Option<String>,
    /// Derive /ID from the document content instead of the clock.
    pub deterministic_id: bool,
    /// Fixed /ID bytes for reproducible test output.
    pub static_id: bool,
    /// Zero AES initialization vectors for reproducible test output.
    pub static_aes_iv: bool,
    pub encryption: EncryptionIntent,
    /// In qdf mode, omit the origin comments.
    pub suppress_original_object_ids: bool,
    /// Called with 0..=100 while objects are emitted; monotonic and
    /// de-duplicated.
    pub progress: Option<Arc<dyn Fn(u8) + Send + Sync>>,
}

impl SaveOptions {
    pub fn new() -> SaveOptions {
        SaveOptions {
            compress_streams: true,
            ..SaveOptions::default()
        }
    }

    fn normalized(&self) -> SaveOptions {
        let mut options = self.clone();
        match options.stream_data_mode {
            Some(StreamDataMode::Uncompress) => {
                options.compress_streams = false;
                options.decode_level = options.decode_level.max(DecodeLevel::Generalized);
            }
            Some(StreamDataMode::Preserve) => {
                options.compress_streams = false;
                options.decode_level = DecodeLevel::None;
            }
            Some(StreamDataMode::Compress) => {
                options.compress_streams = true;
                options.decode_level = options.decode_level.max(DecodeLevel::Generalized);
            }
            None => {}
        }
        if options.pclm {
            options.object_stream_mode = ObjectStreamMode::Disable;
            options.linearize = false;
        }
        options
    }
}

impl Document {
    /// Write the document to a file with default options.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        self.save_to(&mut file)
    }

    /// Write the document to any sink with default options.
    pub fn save_to<W: Write>(&mut self, target: &mut W) -> Result<()> {
        self.save_with(target, &SaveOptions::new())
    }

    /// Write the document with explicit options.
    pub fn save_with<W: Write>(&mut self, target: &mut W, options: &SaveOptions) -> Result<()> {
        let options = options.normalized();
        let rendered = if options.linearize {
            linearize::render_linearized(self, &options)?
        } else {
            let mut writer = Writer::new(self, &options)?;
            writer.render()?
        };
        target.write_all(&rendered)?;
        target.flush()?;
        Ok(())
    }

    /// Prepare the document for encrypted output.
    pub fn encrypt(&mut self, state: &EncryptionState) -> Result<()> {
        if !state.user_password_matched && !state.owner_password_matched {
            return Err(Error::Usage("the encryption state has no authenticated password"));
        }
        self.encryption_state = Some(state.clone());
        Ok(())
    }

    /// Drop encryption so output is written in the clear.
    pub fn decrypt(&mut self) {
        self.encryption_state = None;
    }
}

/// One unit in the emission plan.
enum EmitUnit {
    /// A regular top-level object.
    Object { old: ObjectId, new: u32 },
    /// A generated object stream container.
    Container { index: usize, new: u32 },
}

pub(crate) struct Writer<'a> {
    document: &'a mut Document,
    options: &'a SaveOptions,
    version: (u8, u8),
    /// Old id to new id, for reference rewriting.
    renumber: HashMap<ObjectId, u32>,
    /// Old ids in breadth-first discovery order.
    order: Vec<ObjectId>,
    /// Members packed into object streams: old id -> (container index,
    /// position).
    compressed: HashMap<ObjectId, (usize, u16)>,
    containers: Vec<Vec<ObjectId>>,
    container_ids: Vec<u32>,
    encryption: Option<EncryptionState>,
    encrypt_dict_id: Option<u32>,
    xref_stream_id: Option<u32>,
    max_new_id: u32,
    file_id: Vec<u8>,
    content_streams: HashSet<ObjectId>,
    progress_last: i16,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(document: &'a mut Document, options: &'a SaveOptions) -> Result<Writer<'a>> {
        let encryption = match &options.encryption {
            EncryptionIntent::Preserve => document.encryption_state.clone(),
            EncryptionIntent::Remove => None,
            EncryptionIntent::Encrypt(state) => Some(state.clone()),
        };

        let content_streams = if options.content_normalization {
            collect_content_stream_ids(document)
        } else {
            HashSet::new()
        };

        let mut writer = Writer {
            document,
            options,
            version: (1, 4),
            renumber: HashMap::new(),
            order: Vec::new(),
            compressed: HashMap::new(),
            containers: Vec::new(),
            container_ids: Vec::new(),
            encryption,
            encrypt_dict_id: None,
            xref_stream_id: None,
            max_new_id: 0,
            file_id: Vec::new(),
            content_streams,
            progress_last: -1,
        };
        writer.prepare()?;
        Ok(writer)
    }

    fn prepare(&mut self) -> Result<()> {
        self.version = self.resolve_version();
        self.enqueue_objects();
        self.plan_object_streams();

        let mut next = self.order.len() as u32;
        for _ in 0..self.containers.len() {
            next += 1;
            self.container_ids.push(next);
        }
        if self.encryption.is_some() {
            next += 1;
            self.encrypt_dict_id = Some(next);
        }
        if !self.containers.is_empty() {
            next += 1;
            self.xref_stream_id = Some(next);
        }
        self.max_new_id = next;

        self.file_id = self.compute_file_id();
        Ok(())
    }

    fn resolve_version(&self) -> (u8, u8) {
        if let Some(forced) = &self.options.force_pdf_version {
            return parse_version(forced);
        }
        let mut version = self.document.version_number();
        if let Some(minimum) = &self.options.min_pdf_version {
            version = version.max(parse_version(minimum));
        }
        if self.options.object_stream_mode == ObjectStreamMode::Generate {
            version = version.max((1, 5));
        }
        if let Some(state) = &self.encryption {
            let floor = match (state.v, state.r) {
                (5, 6) => (2, 0),
                (5, _) => (1, 7),
                (4, _) => {
                    if state.crypt_filters.stream_method == CryptMethod::Aes128 {
                        (1, 6)
                    } else {
                        (1, 5)
                    }
                }
                _ => (1, 4),
            };
            version = version.max(floor);
        }
        if self.options.pclm {
            version = (1, 3);
        }
        version
    }

    /// Breadth-first walk from the trailer; every reachable object gets a
    /// new sequential id in first-seen order.
    fn enqueue_objects(&mut self) {
        let mut queue: Vec<ObjectId> = Vec::new();
        let mut seen: HashSet<ObjectId> = HashSet::new();
        collect_references(&Object::Dictionary(self.document.trailer.clone()), &mut |id| {
            if seen.insert(id) {
                queue.push(id);
            }
        });
        let mut head = 0;
        while head < queue.len() {
            let id = queue[head];
            head += 1;
            if let Ok(object) = self.document.get_object(id) {
                collect_references(object, &mut |child| {
                    if seen.insert(child) {
                        queue.push(child);
                    }
                });
            }
        }
        // Drop dangling references; unreachable objects come along only on
        // request.
        queue.retain(|id| self.document.has_object(*id));
        if self.options.preserve_unreferenced {
            for id in self.document.objects.keys() {
                if !seen.contains(id) {
                    queue.push(*id);
                }
            }
        }
        for (index, id) in queue.iter().enumerate() {
            self.renumber.insert(*id, index as u32 + 1);
        }
        self.order = queue;
    }

    /// Decide which objects live in object streams. Only non-streams are
    /// eligible; in preserve mode the input's grouping (from type-2 xref
    /// entries) is kept, in generate mode eligible objects are packed in
    /// emission order.
    fn plan_object_streams(&mut self) {
        match self.options.object_stream_mode {
            ObjectStreamMode::Disable => {}
            ObjectStreamMode::Generate => {
                let mut current: Vec<ObjectId> = Vec::new();
                for id in &self.order {
                    if !self.object_is_compressible(*id) {
                        continue;
                    }
                    current.push(*id);
                    if current.len() >= MAX_OBJECTS_PER_STREAM {
                        self.containers.push(std::mem::take(&mut current));
                    }
                }
                if !current.is_empty() {
                    self.containers.push(current);
                }
            }
            ObjectStreamMode::Preserve => {
                let mut groups: HashMap<u32, Vec<ObjectId>> = HashMap::new();
                let mut group_order: Vec<u32> = Vec::new();
                for id in &self.order {
                    if !self.object_is_compressible(*id) {
                        continue;
                    }
                    if let Some(crate::xref::XrefEntry::Compressed { container, .. }) =
                        self.document.reference_table.get(id.0)
                    {
                        let container = *container;
                        if !groups.contains_key(&container) {
                            group_order.push(container);
                        }
                        groups.entry(container).or_default().push(*id);
                    }
                }
                for container in group_order {
                    self.containers.push(groups.remove(&container).unwrap_or_default());
                }
            }
        }
        for (index, members) in self.containers.iter().enumerate() {
            for (position, id) in members.iter().enumerate() {
                self.compressed.insert(*id, (index, position as u16));
            }
        }
    }

    fn object_is_compressible(&self, id: ObjectId) -> bool {
        if id.1 != 0 {
            return false;
        }
        match self.document.get_object(id) {
            Ok(object) => !object.is_stream(),
            Err(_) => false,
        }
    }

    fn compute_file_id(&mut self) -> Vec<u8> {
        if let Some(state) = &self.encryption {
            if !state.id1.is_empty() {
                // The keys were derived over this /ID; it is frozen, even
                // under the test switches.
                return state.id1.clone();
            }
        }
        if self.options.static_id {
            return STATIC_FILE_ID.to_vec();
        }
        if self.options.deterministic_id {
            let mut md5 = Md5::new();
            md5.update(self.document.version.as_bytes());
            for id in &self.order {
                if let Ok(object) = self.document.get_object(*id) {
                    md5.update(serialize::serialized(&self.remap_plain(object)));
                    if let Object::Stream(stream) = object {
                        if let Ok(bytes) = self.document.raw_stream_bytes(stream) {
                            md5.update(&bytes);
                        }
                    }
                }
            }
            return md5.finalize().to_vec();
        }
        let mut md5 = Md5::new();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        md5.update(now.as_nanos().to_le_bytes());
        md5.update((self.document.objects.len() as u64).to_le_bytes());
        if let Ok(info) = self.document.trailer.get(b"Info") {
            if let Ok((_, info)) = self.document.dereference(info) {
                md5.update(serialize::serialized(info));
            }
        }
        md5.finalize().to_vec()
    }

    /// Clone with references rewritten to the new numbering; no
    /// encryption. Dangling references become null.
    fn remap_plain(&self, object: &Object) -> Object {
        match object {
            Object::Reference(id) => match self.renumber.get(id) {
                Some(new) => Object::Reference((*new, 0)),
                None => Object::Null,
            },
            Object::Array(items) => Object::Array(items.iter().map(|item| self.remap_plain(item)).collect()),
            Object::Dictionary(dict) => {
                let mut out = Dictionary::new();
                for (key, value) in dict.iter() {
                    out.set(key.clone(), self.remap_plain(value));
                }
                Object::Dictionary(out)
            }
            Object::Stream(stream) => {
                let mut out = stream.clone();
                let mut dict = Dictionary::new();
                for (key, value) in stream.dict.iter() {
                    dict.set(key.clone(), self.remap_plain(value));
                }
                out.dict = dict;
                Object::Stream(out)
            }
            other => other.clone(),
        }
    }

    fn encrypt_strings_in_place(&self, object: &mut Object, new_id: u32) -> Result<()> {
        let Some(state) = &self.encryption else {
            return Ok(());
        };
        let static_iv = self.options.static_aes_iv.then_some([0u8; 16]);
        encrypt_strings(state, (new_id, 0), object, static_iv)
    }

    /// The serialized body of an object-stream member: remapped, plain
    /// (members are covered by the container's encryption).
    fn render_member(&self, old: ObjectId) -> Result<Vec<u8>> {
        let object = self.document.get_object(old)?;
        Ok(serialize::serialized(&self.remap_plain(object)))
    }

    /// Decide and produce one stream's payload plus the final dictionary.
    fn render_stream(&mut self, old: ObjectId, new_id: u32, stream: &Stream) -> Result<(Dictionary, Vec<u8>)> {
        let mut dict = match self.remap_plain(&Object::Stream(stream.clone())) {
            Object::Stream(remapped) => remapped.dict,
            _ => unreachable!("remapping a stream yields a stream"),
        };
        let mut payload = self.document.raw_stream_bytes(stream)?;
        let mut filters = stream.filters();

        let is_metadata = stream.dict.has_type(b"Metadata");
        let unencrypted_metadata = is_metadata
            && self
                .encryption
                .as_ref()
                .map(|state| !state.encrypt_metadata)
                .unwrap_or(true);

        // Strip filters when the decode level allows the whole chain.
        let flate_only = !filters.is_empty()
            && filters.iter().all(|f| f.as_slice() == b"FlateDecode" || f.as_slice() == b"Fl");
        let recompress = self.options.recompress_flate && flate_only;
        let wants_decode = !filters.is_empty()
            && (can_strip_filters(&self.document.filter_registry, stream, self.options.decode_level) || recompress);
        if wants_decode {
            match self.document.get_stream_decoded(stream) {
                Ok(decoded) => {
                    payload = decoded;
                    filters.clear();
                    dict.remove(b"Filter");
                    dict.remove(b"DecodeParms");
                }
                Err(err) => {
                    // Fall through: keep the raw payload and its filters.
                    self.document.warn(
                        ErrorKind::DamagedPdf,
                        format!("object {} {}", old.0, old.1),
                        None,
                        format!("stream could not be decoded, writing it as is: {err}"),
                    )?;
                }
            }
        }

        if self.options.content_normalization && filters.is_empty() && self.content_streams.contains(&old) {
            match crate::content::normalize_content(&payload) {
                Ok(normalized) => payload = normalized,
                Err(err) => {
                    self.document.warn(
                        ErrorKind::DamagedPdf,
                        format!("object {} {}", old.0, old.1),
                        None,
                        format!("content stream could not be normalized: {err}"),
                    )?;
                }
            }
        }

        if (self.options.compress_streams || recompress)
            && filters.is_empty()
            && stream.allows_compression
            && !(is_metadata && unencrypted_metadata)
            && !payload.is_empty()
        {
            payload = crate::filters::flate_encode(&payload);
            dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
        }

        if let Some(state) = &self.encryption {
            let exempt = is_metadata && !state.encrypt_metadata;
            if !exempt {
                let method = state
                    .crypt_filters
                    .method_for_stream(&stream.dict, state.crypt_filters.stream_method);
                let static_iv = self.options.static_aes_iv.then_some([0u8; 16]);
                payload = state
                    .encrypt_stream_data(method, (new_id, 0), &payload, static_iv)
                    .map_err(Error::Decryption)?;
            }
        }

        dict.set("Length", payload.len() as i64);
        Ok((dict, payload))
    }

    /// Emit one complete `N 0 obj ... endobj` block.
    fn write_object_at(&mut self, out: &mut Vec<u8>, old: ObjectId, new_id: u32) -> Result<()> {
        if self.options.qdf_mode && !self.options.suppress_original_object_ids {
            out.extend_from_slice(format!("%% Original object id: {} {}\n", old.0, old.1).as_bytes());
        }
        serialize::write_integer(out, new_id as i64);
        out.extend_from_slice(b" 0 obj\n");

        let object = self.document.get_object(old)?.clone();
        match object {
            Object::Stream(stream) => {
                let (dict, payload) = self.render_stream(old, new_id, &stream)?;
                let mut dict_object = Object::Dictionary(dict);
                self.encrypt_strings_in_place(&mut dict_object, new_id)?;
                let dict = match dict_object {
                    Object::Dictionary(dict) => dict,
                    _ => unreachable!(),
                };
                if self.options.qdf_mode {
                    serialize::write_dictionary_qdf(out, &dict, 0);
                } else {
                    serialize::write_dictionary(out, &dict);
                }
                out.extend_from_slice(b"\nstream\n");
                out.extend_from_slice(&payload);
                if self.options.newline_before_endstream || self.options.qdf_mode {
                    out.push(b'\n');
                }
                out.extend_from_slice(b"endstream");
            }
            other => {
                let mut remapped = self.remap_plain(&other);
                self.encrypt_strings_in_place(&mut remapped, new_id)?;
                if self.options.qdf_mode {
                    serialize::write_object_qdf(out, &remapped, 0);
                } else {
                    serialize::write_object(out, &remapped);
                }
            }
        }
        out.extend_from_slice(b"\nendobj\n");
        Ok(())
    }

    fn write_container(&mut self, out: &mut Vec<u8>, index: usize, new_id: u32) -> Result<()> {
        serialize::write_integer(out, new_id as i64);
        out.extend_from_slice(b" 0 obj\n");
        let members = self.containers[index].clone();
        let mut builder = ObjectStreamBuilder::new();
        for member in members {
            let new_member_id = self.renumber[&member];
            builder.push(new_member_id, self.render_member(member)?);
        }
        let stream = builder.build();
        let mut payload = stream.content().expect("builder output is buffered").to_vec();
        let mut dict = stream.dict.clone();
        if let Some(state) = &self.encryption {
            let static_iv = self.options.static_aes_iv.then_some([0u8; 16]);
            payload = state
                .encrypt_stream_data(state.crypt_filters.stream_method, (new_id, 0), &payload, static_iv)
                .map_err(Error::Decryption)?;
            dict.set("Length", payload.len() as i64);
        }
        serialize::write_dictionary(out, &dict);
        out.extend_from_slice(b"\nstream\n");
        out.extend_from_slice(&payload);
        if self.options.newline_before_endstream {
            out.push(b'\n');
        }
        out.extend_from_slice(b"endstream\nendobj\n");
        Ok(())
    }

    fn report_progress(&mut self, done: usize, total: usize) {
        let Some(progress) = &self.options.progress else { return };
        let percent = if total == 0 { 100 } else { (done * 100 / total) as i16 };
        if percent > self.progress_last {
            self.progress_last = percent;
            progress(percent as u8);
        }
    }

    fn emission_plan(&self) -> Vec<EmitUnit> {
        let mut plan = Vec::new();
        for id in &self.order {
            if self.compressed.contains_key(id) {
                continue;
            }
            plan.push(EmitUnit::Object {
                old: *id,
                new: self.renumber[id],
            });
        }
        for index in 0..self.containers.len() {
            plan.push(EmitUnit::Container {
                index,
                new: self.container_ids[index],
            });
        }
        plan
    }

    fn write_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(format!("%PDF-{}.{}\n", self.version.0, self.version.1).as_bytes());
        if self.options.pclm {
            out.extend_from_slice(b"%PCLm 1.0\n");
            return;
        }
        out.push(b'%');
        if self.document.binary_mark.is_empty() {
            out.extend_from_slice(&DEFAULT_BINARY_MARK);
        } else {
            out.extend_from_slice(&self.document.binary_mark);
        }
        out.push(b'\n');
        if self.options.qdf_mode {
            out.extend_from_slice(b"%QDF-1.0\n");
        }
    }

    fn trailer_entries(&self) -> Dictionary {
        let mut trailer = Dictionary::new();
        trailer.set("Size", (self.max_new_id + 1) as i64);
        if let Ok(root) = self.document.trailer.get(b"Root") {
            trailer.set("Root", self.remap_plain(root));
        }
        if let Ok(info) = self.document.trailer.get(b"Info") {
            let info = self.remap_plain(info);
            if !info.is_null() {
                trailer.set("Info", info);
            }
        }
        if let Some(encrypt_id) = self.encrypt_dict_id {
            trailer.set("Encrypt", Object::Reference((encrypt_id, 0)));
        }
        let id_object = Object::Array(vec![
            Object::String(self.file_id.clone(), StringFormat::Hexadecimal),
            Object::String(self.file_id.clone(), StringFormat::Hexadecimal),
        ]);
        trailer.set("ID", id_object);
        trailer
    }

    /// Produce the whole file.
    pub(crate) fn render(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_header(&mut out);

        let plan = self.emission_plan();
        let total = plan.len() + 1;
        let mut offsets: Vec<(u32, u64)> = Vec::new();

        for (done, unit) in plan.into_iter().enumerate() {
            match unit {
                EmitUnit::Object { old, new } => {
                    offsets.push((new, out.len() as u64));
                    self.write_object_at(&mut out, old, new)?;
                }
                EmitUnit::Container { index, new } => {
                    offsets.push((new, out.len() as u64));
                    self.write_container(&mut out, index, new)?;
                }
            }
            self.report_progress(done + 1, total);
        }

        if let (Some(encrypt_id), Some(state)) = (self.encrypt_dict_id, self.encryption.clone()) {
            offsets.push((encrypt_id, out.len() as u64));
            serialize::write_integer(&mut out, encrypt_id as i64);
            out.extend_from_slice(b" 0 obj\n");
            serialize::write_dictionary(&mut out, &state.to_dictionary());
            out.extend_from_slice(b"\nendobj\n");
        }

        if let Some(xref_id) = self.xref_stream_id {
            self.write_xref_stream(&mut out, xref_id, offsets)?;
        } else {
            self.write_xref_table(&mut out, offsets)?;
        }
        self.report_progress(total, total);
        Ok(out)
    }

    fn write_xref_table(&mut self, out: &mut Vec<u8>, offsets: Vec<(u32, u64)>) -> Result<()> {
        let xref_offset = out.len();
        let table: HashMap<u32, u64> = offsets.into_iter().collect();
        out.extend_from_slice(format!("xref\n0 {}\n", self.max_new_id + 1).as_bytes());
        out.extend_from_slice(b"0000000000 65535 f \n");
        for id in 1..=self.max_new_id {
            match table.get(&id) {
                Some(offset) => out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes()),
                None => out.extend_from_slice(b"0000000000 00000 f \n"),
            }
        }
        out.extend_from_slice(b"trailer\n");
        serialize::write_dictionary(out, &self.trailer_entries());
        out.extend_from_slice(format!("\nstartxref\n{xref_offset}\n%%EOF\n").as_bytes());
        Ok(())
    }

    fn write_xref_stream(&mut self, out: &mut Vec<u8>, xref_id: u32, offsets: Vec<(u32, u64)>) -> Result<()> {
        let xref_offset = out.len() as u64;
        let mut table: HashMap<u32, (u8, u64, u64)> = HashMap::new();
        table.insert(0, (0, 0, 65535));
        for (id, offset) in offsets {
            table.insert(id, (1, offset, 0));
        }
        for (old, (container_index, position)) in &self.compressed {
            let new = self.renumber[old];
            table.insert(new, (2, self.container_ids[*container_index] as u64, *position as u64));
        }
        table.insert(xref_id, (1, xref_offset, 0));

        let max_field2 = table.values().map(|(_, f2, _)| *f2).max().unwrap_or(0);
        let max_field3 = table.values().map(|(_, _, f3)| *f3).max().unwrap_or(0);
        let w2 = byte_width(max_field2);
        let w3 = byte_width(max_field3);

        let mut data = Vec::with_capacity((self.max_new_id as usize + 1) * (1 + w2 + w3));
        for id in 0..=self.max_new_id {
            let (entry_type, f2, f3) = table.get(&id).copied().unwrap_or((0, 0, 0));
            data.push(entry_type);
            data.extend_from_slice(&f2.to_be_bytes()[8 - w2..]);
            data.extend_from_slice(&f3.to_be_bytes()[8 - w3..]);
        }
        let payload = crate::filters::flate_encode(&data);

        let mut dict = self.trailer_entries();
        dict.set("Type", Object::Name(b"XRef".to_vec()));
        dict.set(
            "W",
            Object::Array(vec![
                Object::Integer(1),
                Object::Integer(w2 as i64),
                Object::Integer(w3 as i64),
            ]),
        );
        dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
        dict.set("Length", payload.len() as i64);

        serialize::write_integer(out, xref_id as i64);
        out.extend_from_slice(b" 0 obj\n");
        serialize::write_dictionary(out, &dict);
        out.extend_from_slice(b"\nstream\n");
        out.extend_from_slice(&payload);
        out.extend_from_slice(b"\nendstream\nendobj\n");
        out.extend_from_slice(format!("startxref\n{xref_offset}\n%%EOF\n").as_bytes());
        Ok(())
    }
}

fn byte_width(value: u64) -> usize {
    let mut width = 1;
    while width < 8 && value >= 1u64 << (8 * width) {
        width += 1;
    }
    width
}

fn parse_version(version: &str) -> (u8, u8) {
    let mut parts = version.splitn(2, '.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

/// Ids of streams referenced from page /Contents entries.
fn collect_content_stream_ids(document: &mut Document) -> HashSet<ObjectId> {
    let mut ids = HashSet::new();
    let Ok(pages) = document.get_pages() else {
        return ids;
    };
    for page in pages {
        let Ok(dict) = document.get_dictionary(page) else {
            continue;
        };
        match dict.get_or_null(b"Contents") {
            Object::Reference(id) => {
                ids.insert(*id);
            }
            Object::Array(items) => {
                for item in items {
                    if let Ok(id) = item.as_reference() {
                        ids.insert(id);
                    }
                }
            }
            _ => {}
        }
    }
    ids
}

/// Encrypt every string below `object` with the object's key. Streams are
/// handled separately by the stream decisions.
fn encrypt_strings(
    state: &EncryptionState,
    id: ObjectId,
    object: &mut Object,
    static_iv: Option<[u8; 16]>,
) -> Result<()> {
    match object {
        Object::String(bytes, _) => {
            *bytes = state.encrypt_string(id, bytes, static_iv).map_err(Error::Decryption)?;
        }
        Object::Array(items) => {
            for item in items {
                encrypt_strings(state, id, item, static_iv)?;
            }
        }
        Object::Dictionary(dict) => {
            for (_, value) in dict.iter_mut() {
                encrypt_strings(state, id, value, static_iv)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary;

    fn minimal_document() -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let content = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            b"BT /F1 12 Tf (hello) Tj ET".to_vec(),
        )));
        let page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => dictionary! {},
            "Contents" => Object::Reference(content),
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page)],
                "Count" => 1,
            }),
        );
        let catalog = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog));
        doc
    }

    #[test]
    fn save_and_reload_round_trips() {
        let mut doc = minimal_document();
        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                static_id: true,
                ..SaveOptions::new()
            },
        )
        .unwrap();
        assert!(out.starts_with(b"%PDF-1.5\n"));
        assert!(out.ends_with(b"%%EOF\n"));

        let mut reloaded = Document::load_mem(&out).unwrap();
        assert_eq!(reloaded.get_pages().unwrap().len(), 1);
        let catalog = reloaded.catalog().unwrap();
        assert!(catalog.has_type(b"Catalog"));
        let pages_ref = catalog.get(b"Pages").unwrap().as_reference().unwrap();
        let pages = reloaded.get_dictionary(pages_ref).unwrap();
        assert_eq!(pages.get(b"Count").unwrap().as_i64().unwrap(), 1);
    }

    #[test]
    fn renumbering_starts_at_one_and_is_dense() {
        let mut doc = minimal_document();
        // Make ids sparse.
        doc.max_id = 90;
        let extra = doc.add_object(Object::Integer(5));
        doc.catalog_mut().unwrap().set("Extra", Object::Reference(extra));
        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                static_id: true,
                ..SaveOptions::new()
            },
        )
        .unwrap();
        let reloaded = Document::load_mem(&out).unwrap();
        let ids: Vec<u32> = reloaded.objects.keys().map(|(id, _)| *id).collect();
        let max = *ids.iter().max().unwrap();
        assert_eq!(ids.len() as u32, max);
        assert!(ids.contains(&1));
    }

    #[test]
    fn unreferenced_objects_are_dropped_unless_preserved() {
        let mut doc = minimal_document();
        doc.add_object(Object::string_literal("orphan"));
        let mut out = Vec::new();
        doc.save_with(&mut out, &SaveOptions::new()).unwrap();
        let reloaded = Document::load_mem(&out).unwrap();
        assert_eq!(reloaded.objects.len(), 4);

        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                preserve_unreferenced: true,
                ..SaveOptions::new()
            },
        )
        .unwrap();
        let reloaded = Document::load_mem(&out).unwrap();
        assert_eq!(reloaded.objects.len(), 5);
    }

    #[test]
    fn compress_streams_wraps_with_flate() {
        let mut doc = minimal_document();
        let mut out = Vec::new();
        doc.save_with(&mut out, &SaveOptions::new()).unwrap();
        let reloaded = Document::load_mem(&out).unwrap();
        let stream_id = *reloaded
            .objects
            .iter()
            .find(|(_, object)| object.is_stream())
            .map(|(id, _)| id)
            .unwrap();
        let stream = reloaded.get_object(stream_id).unwrap().as_stream().unwrap();
        assert_eq!(stream.filters(), vec![b"FlateDecode".to_vec()]);
        assert_eq!(
            reloaded.get_stream_decoded(stream).unwrap(),
            b"BT /F1 12 Tf (hello) Tj ET"
        );
    }

    #[test]
    fn decode_level_none_preserves_stream_bytes() {
        let mut doc = minimal_document();
        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                stream_data_mode: Some(StreamDataMode::Preserve),
                ..SaveOptions::new()
            },
        )
        .unwrap();
        let reloaded = Document::load_mem(&out).unwrap();
        let stream = reloaded
            .objects
            .values()
            .find_map(|object| object.as_stream().ok())
            .unwrap();
        assert!(stream.filters().is_empty());
        assert_eq!(
            reloaded.raw_stream_bytes(stream).unwrap(),
            b"BT /F1 12 Tf (hello) Tj ET"
        );
    }

    #[test]
    fn object_streams_generate_and_reload() {
        let mut doc = minimal_document();
        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                object_stream_mode: ObjectStreamMode::Generate,
                static_id: true,
                ..SaveOptions::new()
            },
        )
        .unwrap();
        // An xref stream is mandatory with object streams.
        assert!(!out.windows(8).any(|w| w == b"trailer\n".as_slice()));
        let mut reloaded = Document::load_mem(&out).unwrap();
        assert_eq!(reloaded.get_pages().unwrap().len(), 1);
        assert!(reloaded.catalog().unwrap().has_type(b"Catalog"));
        // The version floor for object streams applies.
        assert_eq!(reloaded.version, "1.5");
    }

    #[test]
    fn qdf_mode_emits_origin_comments() {
        let mut doc = minimal_document();
        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                qdf_mode: true,
                compress_streams: false,
                ..SaveOptions::new()
            },
        )
        .unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("%QDF-1.0"));
        assert!(text.contains("%% Original object id:"));
        assert!(Document::load_mem(&out).is_ok());

        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                qdf_mode: true,
                suppress_original_object_ids: true,
                ..SaveOptions::new()
            },
        )
        .unwrap();
        assert!(!String::from_utf8_lossy(&out).contains("%% Original object id:"));
    }

    #[test]
    fn progress_is_monotonic_and_reaches_100() {
        let mut doc = minimal_document();
        let reports = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = reports.clone();
        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                progress: Some(Arc::new(move |percent| {
                    sink.lock().unwrap().push(percent);
                })),
                ..SaveOptions::new()
            },
        )
        .unwrap();
        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        assert!(reports.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(*reports.last().unwrap(), 100);
    }

    #[test]
    fn forced_version_wins() {
        let mut doc = minimal_document();
        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                force_pdf_version: Some("1.3".to_string()),
                ..SaveOptions::new()
            },
        )
        .unwrap();
        assert!(out.starts_with(b"%PDF-1.3\n"));
    }

    #[test]
    fn deterministic_id_is_stable_across_saves() {
        let options = SaveOptions {
            deterministic_id: true,
            ..SaveOptions::new()
        };
        let mut doc = minimal_document();
        let mut first = Vec::new();
        doc.save_with(&mut first, &options).unwrap();
        let mut doc = minimal_document();
        let mut second = Vec::new();
        doc.save_with(&mut second, &options).unwrap();
        assert_eq!(first, second);
    }
}
