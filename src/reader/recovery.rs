use std::collections::HashSet;

use super::Reader;
use crate::error::{ErrorKind, XrefError};
use crate::parser::ObjectSource;
use crate::tokenizer::is_delimiter;
use crate::xref::{Xref, XrefEntry};
use crate::{Dictionary, Error, Object, Result};

impl Reader<'_> {
    /// Rebuild the cross-reference table by scanning the whole file for
    /// `N G obj` markers and `trailer` dictionaries. Later definitions win,
    /// matching how incremental updates append to a file. Flips the
    /// reconstruction latch so subsequent damage downgrades to warnings.
    pub(super) fn reconstruct_xref(&mut self) -> Result<()> {
        self.document.xref_reconstructed = true;
        let mut xref = Xref::new();

        let mut pos = 0;
        while let Some(found) = Self::search_substring_forward(self.buffer, b"obj", pos) {
            pos = found + 3;
            if let Some((id, generation, offset)) = object_marker_at(self.buffer, found) {
                // A later body wins over an earlier one.
                xref.insert(
                    id,
                    XrefEntry::Normal {
                        offset: offset as u32,
                        generation,
                    },
                );
            }
        }

        if xref.entries.is_empty() {
            return Err(Error::Xref(XrefError::Reconstruction));
        }
        xref.size = xref.max_id() + 1;

        // Collect trailer dictionaries; the last complete one wins, with
        // earlier ones filling in missing keys.
        let mut trailer = Dictionary::new();
        let mut scan = 0;
        while let Some(found) = Self::search_substring_forward(self.buffer, b"trailer", scan) {
            scan = found + b"trailer".len();
            let mut source = ObjectSource::new(self.buffer, scan);
            if let Ok(Object::Dictionary(found_trailer)) = source.read_object(0) {
                for (key, value) in found_trailer.iter() {
                    trailer.set(key.clone(), value.clone());
                }
            }
        }
        trailer.remove(b"Prev");
        trailer.remove(b"XRefStm");

        if !trailer.has(b"Root") {
            // No usable trailer: find a catalog among the recovered
            // objects.
            let mut catalog = None;
            for (&id, entry) in &xref.entries {
                let XrefEntry::Normal { offset, generation } = entry else {
                    continue;
                };
                let Ok((parsed_id, object)) =
                    self.read_object(*offset as usize, None, &mut HashSet::new())
                else {
                    continue;
                };
                if parsed_id != (id, *generation) {
                    continue;
                }
                if object.as_dict().map(|dict| dict.has_type(b"Catalog")).unwrap_or(false) {
                    catalog = Some(parsed_id);
                }
            }
            match catalog {
                Some(id) => trailer.set("Root", Object::Reference(id)),
                None => return Err(Error::Xref(XrefError::Reconstruction)),
            }
        }
        trailer.set("Size", xref.size as i64);

        self.push_warning(
            ErrorKind::DamagedPdf,
            String::new(),
            None,
            format!("cross-reference table reconstructed with {} objects", xref.entries.len()),
        );

        self.document.max_id = xref.size.saturating_sub(1);
        self.document.reference_table = xref;
        self.document.trailer = trailer;
        Ok(())
    }
}

/// Check for `N G obj` ending at `obj_pos` and return (id, generation,
/// offset of N). The keyword must sit at a delimiter boundary.
fn object_marker_at(buffer: &[u8], obj_pos: usize) -> Option<(u32, u16, usize)> {
    let after = obj_pos + 3;
    if after < buffer.len() && !is_delimiter(buffer[after]) {
        return None;
    }
    let mut pos = obj_pos;
    // whitespace between G and obj
    let ws_end = pos;
    while pos > 0 && (buffer[pos - 1] == b' ' || buffer[pos - 1] == b'\t') {
        pos -= 1;
    }
    if pos == ws_end {
        return None;
    }
    // generation digits
    let gen_end = pos;
    while pos > 0 && buffer[pos - 1].is_ascii_digit() {
        pos -= 1;
    }
    if pos == gen_end {
        return None;
    }
    let generation: u16 = std::str::from_utf8(&buffer[pos..gen_end]).ok()?.parse().ok()?;
    // whitespace between N and G
    let ws_end = pos;
    while pos > 0 && (buffer[pos - 1] == b' ' || buffer[pos - 1] == b'\t') {
        pos -= 1;
    }
    if pos == ws_end {
        return None;
    }
    // object number digits
    let id_end = pos;
    while pos > 0 && buffer[pos - 1].is_ascii_digit() {
        pos -= 1;
    }
    if pos == id_end {
        return None;
    }
    let id: u32 = std::str::from_utf8(&buffer[pos..id_end]).ok()?.parse().ok()?;
    if id == 0 {
        return None;
    }
    // The marker must start a line or follow other whitespace.
    if pos > 0 && !matches!(buffer[pos - 1], b'\n' | b'\r' | b' ' | b'\t' | b'\x0C' | 0) {
        return None;
    }
    Some((id, generation, pos))
}
