mod encrypted;
mod load;
mod object_loader;
mod recovery;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::cmp;
use std::collections::HashSet;
use std::sync::Arc;

use log::warn;

use crate::error::{ErrorKind, ParseError, Warning, XrefError};
use crate::filters::FilterRegistry;
use crate::object_stream::ObjectStream;
use crate::parser::{self, ParserInput};
use crate::xref::XrefEntry;
use crate::{Document, Error, Object, ObjectId, Result};

pub struct Reader<'a> {
    pub buffer: &'a [u8],
    pub document: Document,
    /// Password for encrypted files.
    pub password: Option<String>,
    /// Recoverable problems found while parsing; drained into the document
    /// at the end of the read.
    warnings: RefCell<Vec<Warning>>,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8], password: Option<String>) -> Reader<'a> {
        Reader {
            buffer,
            document: Document::new(),
            password,
            warnings: RefCell::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(buffer: &'a [u8]) -> Reader<'a> {
        Reader::new(buffer, None)
    }

    /// Read the whole document.
    pub fn read(mut self) -> Result<Document> {
        let offset = self.buffer.windows(5).position(|w| w == b"%PDF-").unwrap_or(0);
        self.buffer = &self.buffer[offset..];

        let version =
            parser::header(ParserInput::new_extra(self.buffer, "header")).ok_or(ParseError::InvalidFileHeader)?;

        // The binary comment conventionally sits on line 2; keep its bytes
        // when they are all high-bit.
        if let Some(pos) = self.buffer.iter().position(|&byte| byte == b'\n') {
            if let Some(binary_mark) =
                parser::binary_mark(ParserInput::new_extra(&self.buffer[pos + 1..], "binary_mark"))
            {
                if !binary_mark.is_empty() && binary_mark.iter().all(|&byte| byte >= 128) {
                    self.document.binary_mark = binary_mark;
                }
            }
        }

        self.document.version = version;

        if let Err(err) = self.read_xref_chain() {
            self.push_warning(
                ErrorKind::DamagedPdf,
                String::new(),
                None,
                format!("cross-reference structure is unusable ({err}), reconstructing"),
            );
            self.reconstruct_xref()?;
        }

        let is_encrypted = self.document.trailer.get(b"Encrypt").is_ok();
        let load_result = if is_encrypted {
            self.load_encrypted_document()
        } else {
            self.load_objects_raw()
        };
        if let Err(err) = load_result {
            // A structurally unusable body gets one reconstruction attempt;
            // after that, errors stop being recoverable.
            if self.document.xref_reconstructed || is_encrypted || matches!(err, Error::InvalidPassword) {
                return Err(err);
            }
            self.push_warning(
                ErrorKind::DamagedPdf,
                String::new(),
                None,
                format!("object loading failed ({err}), reconstructing the cross-reference table"),
            );
            self.reconstruct_xref()?;
            self.document.objects.clear();
            self.load_objects_raw()?;
        }

        self.document.source = Some(Arc::from(self.buffer));
        self.drain_warnings()?;
        Ok(self.document)
    }

    /// Locate the last cross-reference section and follow its /Prev (and
    /// hybrid /XRefStm) chain, newest first.
    fn read_xref_chain(&mut self) -> Result<()> {
        let xref_start = Self::get_xref_start(self.buffer)?;
        if xref_start > self.buffer.len() {
            return Err(Error::Xref(XrefError::Start));
        }
        self.document.xref_start = xref_start;

        let (mut xref, mut trailer) = parser::xref_and_trailer(self.buffer, xref_start, self)?;

        let mut already_seen = HashSet::new();
        already_seen.insert(xref_start as i64);

        // Hybrid-reference file: the newest classic section points at an
        // extra xref stream.
        if let Some(stream_start) = trailer.remove(b"XRefStm").and_then(|offset| offset.as_i64().ok()) {
            if stream_start < 0 || stream_start as usize > self.buffer.len() {
                return Err(Error::Xref(XrefError::StreamStart));
            }
            let (stream_xref, _) = parser::xref_and_trailer(self.buffer, stream_start as usize, self)?;
            xref.merge(stream_xref);
        }

        let mut prev_xref_start = trailer.remove(b"Prev");
        while let Some(prev) = prev_xref_start.and_then(|offset| offset.as_i64().ok()) {
            if !already_seen.insert(prev) {
                break;
            }
            if prev < 0 || prev as usize > self.buffer.len() {
                return Err(Error::Xref(XrefError::PrevStart));
            }
            let (prev_xref, mut prev_trailer) = parser::xref_and_trailer(self.buffer, prev as usize, self)?;
            xref.merge(prev_xref);

            if let Some(stream_start) = prev_trailer.remove(b"XRefStm").and_then(|offset| offset.as_i64().ok()) {
                if stream_start < 0 || stream_start as usize > self.buffer.len() {
                    return Err(Error::Xref(XrefError::StreamStart));
                }
                let (stream_xref, _) = parser::xref_and_trailer(self.buffer, stream_start as usize, self)?;
                xref.merge(stream_xref);
            }

            prev_xref_start = prev_trailer.remove(b"Prev");
        }

        let xref_entry_count = xref.max_id().checked_add(1).ok_or(ParseError::InvalidXref)?;
        if xref.size != xref_entry_count {
            warn!(
                "Size entry of trailer dictionary is {}, correct value is {}.",
                xref.size, xref_entry_count
            );
            xref.size = xref_entry_count;
        }

        if !trailer.has(b"Root") {
            return Err(ParseError::InvalidTrailer.into());
        }

        self.document.max_id = xref.size.saturating_sub(1);
        self.document.reference_table = xref;
        self.document.trailer = trailer;
        Ok(())
    }

    fn load_objects_raw(&mut self) -> Result<()> {
        let entries: Vec<(u32, XrefEntry)> = self
            .document
            .reference_table
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut containers: Vec<u32> = Vec::new();
        for (entry_id, entry) in &entries {
            match entry {
                XrefEntry::Normal { offset, .. } => {
                    let result = self.read_object(*offset as usize, None, &mut HashSet::new());
                    match result {
                        Ok((object_id, object)) => {
                            // First definition wins for duplicate ids.
                            self.document.objects.entry(object_id).or_insert(object);
                        }
                        Err(err) => {
                            if !self.document.xref_reconstructed {
                                return Err(err);
                            }
                            self.push_warning(
                                ErrorKind::DamagedPdf,
                                format!("object {entry_id} ?"),
                                Some(*offset as usize),
                                format!("object could not be loaded: {err}"),
                            );
                        }
                    }
                }
                XrefEntry::Compressed { container, .. } => {
                    if !containers.contains(container) {
                        containers.push(*container);
                    }
                }
                XrefEntry::Free { .. } | XrefEntry::UnusableFree => {}
            }
        }

        for container in containers {
            if let Err(err) = self.load_object_stream((container, 0)) {
                self.push_warning(
                    ErrorKind::DamagedPdf,
                    format!("object {container} 0"),
                    None,
                    format!("object stream could not be decoded: {err}"),
                );
            }
        }

        Ok(())
    }

    fn load_object_stream(&mut self, container_id: ObjectId) -> Result<()> {
        let stream = self
            .document
            .get_object(container_id)
            .and_then(Object::as_stream)
            .map_err(|_| Error::InvalidStream("object stream container is not a stream".to_string()))?;
        if !stream.dict.has_type(b"ObjStm") {
            return Err(Error::InvalidStream("container is not /Type /ObjStm".to_string()));
        }
        let dict = stream.dict.clone();
        let raw = self.raw_range_bytes(stream)?;
        let decoded = if dict.has(b"Filter") {
            crate::filters::decode_data(
                &self.document.filter_registry,
                &stream.filters(),
                &stream.decode_parms(),
                &raw,
            )?
        } else {
            raw
        };
        let parsed = ObjectStream::parse(&dict, &decoded)?;
        self.warnings.borrow_mut().extend(parsed.warnings);
        for (id, object) in parsed.objects {
            self.document.objects.entry(id).or_insert(object);
        }
        Ok(())
    }

    /// Resolve a stream's payload against the input buffer.
    pub(crate) fn raw_range_bytes(&self, stream: &crate::Stream) -> Result<Vec<u8>> {
        match stream.data() {
            crate::object::StreamData::Buffer(bytes) => Ok(bytes.clone()),
            crate::object::StreamData::Range { offset, length } => self
                .buffer
                .get(*offset..*offset + *length)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::InvalidStream("stream range outside the input".to_string())),
            crate::object::StreamData::Provider(provider) => provider.collect(),
        }
    }

    fn get_xref_start(buffer: &[u8]) -> Result<usize> {
        let seek_pos = buffer.len() - cmp::min(buffer.len(), 512);
        Self::search_substring(buffer, b"%%EOF", seek_pos)
            .and_then(|eof_pos| if eof_pos > 25 { Some(eof_pos) } else { None })
            .and_then(|eof_pos| Self::search_substring(buffer, b"startxref", eof_pos - 25))
            .ok_or(Error::Xref(XrefError::Start))
            .and_then(
                |xref_pos| match parser::xref_start(ParserInput::new_extra(&buffer[xref_pos..], "xref")) {
                    Some(startxref) if startxref >= 0 => Ok(startxref as usize),
                    _ => Err(Error::Xref(XrefError::Start)),
                },
            )
    }

    /// Last occurrence of `pattern` at or after `start_pos`.
    pub(crate) fn search_substring(buffer: &[u8], pattern: &[u8], start_pos: usize) -> Option<usize> {
        buffer
            .get(start_pos..)?
            .windows(pattern.len())
            .rposition(|window| window == pattern)
            .map(|pos| start_pos + pos)
    }

    /// First occurrence of `pattern` at or after `start_pos`.
    pub(crate) fn search_substring_forward(buffer: &[u8], pattern: &[u8], start_pos: usize) -> Option<usize> {
        buffer
            .get(start_pos..)?
            .windows(pattern.len())
            .position(|window| window == pattern)
            .map(|pos| start_pos + pos)
    }

    pub(crate) fn filter_registry(&self) -> &FilterRegistry {
        &self.document.filter_registry
    }

    pub(crate) fn push_warnings(&self, id: ObjectId, warnings: Vec<Warning>) {
        let mut sink = self.warnings.borrow_mut();
        for mut warning in warnings {
            if warning.object.is_empty() && id != (0, 0) {
                warning.object = format!("object {} {}", id.0, id.1);
            }
            warn!("{warning}");
            sink.push(warning);
        }
    }

    pub(crate) fn push_warning(&self, kind: ErrorKind, object: String, offset: Option<usize>, message: String) {
        let warning = Warning {
            kind,
            object,
            offset,
            message,
        };
        warn!("{warning}");
        self.warnings.borrow_mut().push(warning);
    }

    fn drain_warnings(&mut self) -> Result<()> {
        let warnings = std::mem::take(&mut *self.warnings.borrow_mut());
        for warning in warnings {
            let Warning {
                kind,
                object,
                offset,
                message,
            } = warning;
            self.document.warn(kind, object, offset, message)?;
        }
        Ok(())
    }
}
