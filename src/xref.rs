use std::collections::BTreeMap;

use log::warn;

use crate::error::XrefError;
use crate::{Dictionary, Error, Object, Result};

/// One slot of the cross-reference structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XrefEntry {
    /// Unused object, part of the free list.
    Free { next_generation: u16 },
    /// A free entry whose fields could not be trusted.
    UnusableFree,
    /// In use at a byte offset.
    Normal { offset: u32, generation: u16 },
    /// Stored inside an object stream; generation is always zero.
    Compressed { container: u32, index: u16 },
}

impl XrefEntry {
    pub fn is_normal(&self) -> bool {
        matches!(self, XrefEntry::Normal { .. })
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, XrefEntry::Compressed { .. })
    }
}

/// The document cross-reference table: object number to entry.
#[derive(Debug, Clone, Default)]
pub struct Xref {
    pub entries: BTreeMap<u32, XrefEntry>,
    /// Expected value of the trailer /Size entry.
    pub size: u32,
}

impl Xref {
    pub fn new() -> Xref {
        Xref {
            entries: BTreeMap::new(),
            size: 0,
        }
    }

    pub fn get(&self, id: u32) -> Option<&XrefEntry> {
        self.entries.get(&id)
    }

    pub fn insert(&mut self, id: u32, entry: XrefEntry) {
        self.entries.insert(id, entry);
    }

    /// Merge an older section into this one. Sections are processed newest
    /// first, so existing entries win over incoming ones.
    pub fn merge(&mut self, older: Xref) {
        for (id, entry) in older.entries {
            self.entries.entry(id).or_insert(entry);
        }
        self.size = self.size.max(older.size);
    }

    pub fn max_id(&self) -> u32 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }
}

/// Decode the payload of a cross-reference stream into an `Xref`.
///
/// `W` gives the field widths (type, field 2, field 3); a zero-width type
/// field defaults every row to type 1. `Index` lists (first, count) runs and
/// defaults to a single run starting at zero.
pub fn decode_xref_stream(dict: &Dictionary, data: &[u8]) -> Result<Xref> {
    let widths = dict
        .get(b"W")
        .and_then(Object::as_array)
        .map_err(|_| Error::Xref(XrefError::Stream))?;
    if widths.len() < 3 {
        return Err(Error::Xref(XrefError::Stream));
    }
    let mut w = [0usize; 3];
    for (slot, obj) in w.iter_mut().zip(widths.iter()) {
        *slot = usize::try_from(obj.as_i64().map_err(|_| Error::Xref(XrefError::Stream))?)
            .map_err(|_| Error::Xref(XrefError::Stream))?;
        if *slot > 8 {
            return Err(Error::Xref(XrefError::Stream));
        }
    }
    let row_width: usize = w.iter().sum();
    if row_width == 0 {
        return Err(Error::Xref(XrefError::Stream));
    }

    let size = dict.get(b"Size").and_then(Object::as_i64).unwrap_or(0).max(0) as u32;

    let mut runs: Vec<(u32, u32)> = Vec::new();
    match dict.get_or_null(b"Index") {
        Object::Array(index) => {
            for pair in index.chunks(2) {
                if let [first, count] = pair {
                    let first = first.as_i64().map_err(|_| Error::Xref(XrefError::Stream))?;
                    let count = count.as_i64().map_err(|_| Error::Xref(XrefError::Stream))?;
                    if first < 0 || count < 0 {
                        return Err(Error::Xref(XrefError::Stream));
                    }
                    runs.push((first as u32, count as u32));
                }
            }
        }
        Object::Null => runs.push((0, size)),
        _ => return Err(Error::Xref(XrefError::Stream)),
    }

    let mut xref = Xref::new();
    xref.size = size;
    let mut rows = data.chunks_exact(row_width);
    'runs: for (first, count) in runs {
        for id in first..first.saturating_add(count) {
            let Some(row) = rows.next() else {
                warn!("cross-reference stream data is shorter than its /Index claims");
                break 'runs;
            };
            let mut pos = 0;
            let mut field = |width: usize| -> u64 {
                let mut value = 0u64;
                for &byte in &row[pos..pos + width] {
                    value = (value << 8) | byte as u64;
                }
                pos += width;
                value
            };
            let entry_type = if w[0] == 0 { 1 } else { field(w[0]) };
            let field2 = field(w[1]);
            let field3 = field(w[2]);
            let entry = match entry_type {
                0 => XrefEntry::Free {
                    next_generation: field3 as u16,
                },
                1 => XrefEntry::Normal {
                    offset: field2 as u32,
                    generation: field3 as u16,
                },
                2 => XrefEntry::Compressed {
                    container: field2 as u32,
                    index: field3 as u16,
                },
                other => {
                    // Unknown types read as null references per the spec;
                    // recording them as unusable keeps the slot occupied.
                    warn!("cross-reference stream entry for object {id} has unknown type {other}");
                    XrefEntry::UnusableFree
                }
            };
            xref.entries.entry(id).or_insert(entry);
        }
    }
    if xref.size == 0 {
        xref.size = xref.max_id().saturating_add(1);
    }
    Ok(xref)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary;

    #[test]
    fn merge_keeps_newest_entries() {
        let mut newer = Xref::new();
        newer.insert(1, XrefEntry::Normal { offset: 100, generation: 0 });
        newer.size = 3;
        let mut older = Xref::new();
        older.insert(1, XrefEntry::Normal { offset: 50, generation: 0 });
        older.insert(2, XrefEntry::Normal { offset: 70, generation: 0 });
        older.size = 3;
        newer.merge(older);
        assert_eq!(
            newer.get(1),
            Some(&XrefEntry::Normal { offset: 100, generation: 0 })
        );
        assert_eq!(
            newer.get(2),
            Some(&XrefEntry::Normal { offset: 70, generation: 0 })
        );
    }

    #[test]
    fn decode_xref_stream_fields() {
        // W = [1 2 1], two runs: object 0 (free) and objects 3..5.
        let dict = dictionary! {
            "Size" => 6,
            "W" => vec![1.into(), 2.into(), 1.into()],
            "Index" => vec![0.into(), 1.into(), 3.into(), 2.into()],
        };
        let data = [
            0u8, 0, 0, 0xFF, // free, next generation 255
            1, 0x01, 0x00, 0, // in use at offset 256
            2, 0x00, 0x05, 0x02, // compressed in object 5, index 2
        ];
        let xref = decode_xref_stream(&dict, &data).unwrap();
        assert_eq!(xref.get(0), Some(&XrefEntry::Free { next_generation: 255 }));
        assert_eq!(xref.get(3), Some(&XrefEntry::Normal { offset: 256, generation: 0 }));
        assert_eq!(xref.get(4), Some(&XrefEntry::Compressed { container: 5, index: 2 }));
        assert_eq!(xref.size, 6);
    }

    #[test]
    fn decode_xref_stream_defaults_type_to_in_use() {
        let dict = dictionary! {
            "Size" => 2,
            "W" => vec![0.into(), 2.into(), 1.into()],
            "Index" => vec![1.into(), 1.into()],
        };
        let data = [0x00u8, 0x2A, 0x00];
        let xref = decode_xref_stream(&dict, &data).unwrap();
        assert_eq!(xref.get(1), Some(&XrefEntry::Normal { offset: 42, generation: 0 }));
    }

    #[test]
    fn decode_xref_stream_rejects_bad_widths() {
        let dict = dictionary! {
            "Size" => 2,
            "W" => vec![1.into(), 2.into()],
        };
        assert!(decode_xref_stream(&dict, &[]).is_err());
    }

    #[test]
    fn short_data_is_tolerated() {
        let dict = dictionary! {
            "Size" => 10,
            "W" => vec![1.into(), 1.into(), 1.into()],
            "Index" => vec![0.into(), 10.into()],
        };
        let data = [1u8, 0x10, 0x00];
        let xref = decode_xref_stream(&dict, &data).unwrap();
        assert_eq!(xref.entries.len(), 1);
    }
}
