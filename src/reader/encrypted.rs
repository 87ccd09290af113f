use std::collections::HashSet;

use super::Reader;
use crate::encryption::{self, EncryptionState};
use crate::error::ErrorKind;
use crate::object::StreamData;
use crate::object_stream::ObjectStream;
use crate::xref::XrefEntry;
use crate::{Error, Object, ObjectId, Result};

impl Reader<'_> {
    /// Load an encrypted document: parse the encryption dictionary,
    /// authenticate, then decrypt every object as it is inserted.
    pub(super) fn load_encrypted_document(&mut self) -> Result<()> {
        self.parse_encryption_dictionary()?;

        let state = self.authenticate_and_setup_encryption()?;
        let encrypt_ref = self
            .document
            .trailer
            .get(b"Encrypt")
            .ok()
            .and_then(|obj| obj.as_reference().ok());

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
                    match self.read_object(*offset as usize, None, &mut HashSet::new()) {
                        Ok((object_id, mut object)) => {
                            if Some(object_id) == encrypt_ref {
                                continue;
                            }
                            // Encrypted payloads are rewritten, so ranges
                            // must become owned buffers first.
                            self.materialize_streams(&mut object)?;
                            if let Err(err) = encryption::decrypt_object(&state, object_id, &mut object) {
                                self.push_warning(
                                    ErrorKind::Password,
                                    format!("object {} {}", object_id.0, object_id.1),
                                    Some(*offset as usize),
                                    format!("object could not be decrypted: {err}"),
                                );
                            }
                            self.document.objects.entry(object_id).or_insert(object);
                        }
                        Err(err) => {
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

        // Containers are decrypted by now; their contents are parsed as
        // plain objects (objects inside object streams are never encrypted
        // individually).
        for container in containers {
            if let Err(err) = self.load_decrypted_object_stream((container, 0)) {
                self.push_warning(
                    ErrorKind::DamagedPdf,
                    format!("object {container} 0"),
                    None,
                    format!("object stream could not be decoded: {err}"),
                );
            }
        }

        self.document.encryption_state = Some(state);
        if let Some(encrypt_ref) = encrypt_ref {
            self.document.objects.remove(&encrypt_ref);
        }
        self.document.trailer.remove(b"Encrypt");
        Ok(())
    }

    fn load_decrypted_object_stream(&mut self, container_id: ObjectId) -> Result<()> {
        let stream = self
            .document
            .get_object(container_id)
            .and_then(Object::as_stream)
            .map_err(|_| Error::InvalidStream("object stream container is not a stream".to_string()))?;
        if !stream.dict.has_type(b"ObjStm") {
            return Err(Error::InvalidStream("container is not /Type /ObjStm".to_string()));
        }
        let dict = stream.dict.clone();
        let raw = stream
            .content()
            .ok_or_else(|| Error::InvalidStream("object stream payload was not materialized".to_string()))?
            .to_vec();
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

    /// Pull the /Encrypt dictionary into the object table so the state can
    /// be decoded from it.
    pub(super) fn parse_encryption_dictionary(&mut self) -> Result<()> {
        if let Ok(encrypt_ref) = self.document.trailer.get(b"Encrypt").and_then(|obj| obj.as_reference()) {
            let offset = self.get_offset(encrypt_ref)?;
            let (_, encrypt_object) = self.read_object(offset as usize, Some(encrypt_ref), &mut HashSet::new())?;
            self.document.objects.insert(encrypt_ref, encrypt_object);
        }
        Ok(())
    }

    /// Try the empty password first, then the caller's. Both failing is a
    /// hard password error; anything else (unsupported revision, malformed
    /// dictionary) propagates as itself.
    pub(super) fn authenticate_and_setup_encryption(&mut self) -> Result<EncryptionState> {
        match EncryptionState::decode(&self.document, "") {
            Ok(state) => return Ok(state),
            Err(Error::InvalidPassword) => {}
            Err(other) => return Err(other),
        }
        if let Some(password) = self.password.clone() {
            return EncryptionState::decode(&self.document, &password);
        }
        Err(Error::InvalidPassword)
    }

    /// Replace range payloads with owned copies of the input bytes.
    fn materialize_streams(&self, object: &mut Object) -> Result<()> {
        if let Object::Stream(stream) = object {
            if let StreamData::Range { offset, length } = *stream.data() {
                let bytes = self
                    .buffer
                    .get(offset..offset + length)
                    .ok_or_else(|| Error::InvalidStream("stream range outside the input".to_string()))?
                    .to_vec();
                stream.set_content(bytes);
            }
        }
        Ok(())
    }
}
