//! Two-pass linearization. Pass one lays the file out with padded
//! placeholder numbers; pass two re-emits with the measured values. Every
//! variable number is written at a fixed width so the byte layout is
//! identical between passes.

use std::collections::{HashMap, HashSet};

use crate::document::collect_references;
use crate::object::StringFormat;
use crate::{Dictionary, Document, Error, Object, ObjectId, Result};

use super::{serialize, SaveOptions, Writer};

/// Measured positions, filled during a pass and consumed by the next one.
#[derive(Default, Clone)]
struct LinValues {
    file_len: u64,
    hint_offset: u64,
    hint_len: u64,
    first_page_end: u64,
    main_xref_offset: u64,
    t_value: u64,
    /// Offsets of every object in the front section, by new id.
    front_offsets: HashMap<u32, u64>,
    /// Per page: (offset, length) of the page object, for the hint table.
    page_positions: Vec<(u64, u64)>,
}

/// The numbering plan: rest objects first (ids 1..), then the front
/// section (linearization dictionary, hint stream, catalog, first page).
struct LinPlan {
    rest: Vec<ObjectId>,
    front: Vec<ObjectId>,
    lin_dict_id: u32,
    hint_id: u32,
    first_page_new: u32,
    page_count: usize,
    pages: Vec<ObjectId>,
    /// Set when object streams are present: both xref sections become
    /// cross-reference streams.
    xref1_id: Option<u32>,
    xref_main_id: Option<u32>,
    total: u32,
}

pub(crate) fn render_linearized(document: &mut Document, options: &SaveOptions) -> Result<Vec<u8>> {
    let mut writer = Writer::new(document, options)?;
    let plan = build_plan(&mut writer)?;

    let (pass1, measured) = emit(&mut writer, &plan, None)?;
    let (pass2, verify) = emit(&mut writer, &plan, Some(&measured))?;
    if pass1.len() != pass2.len() {
        return Err(Error::Internal("linearization passes produced different layouts"));
    }
    debug_assert_eq!(measured.file_len, verify.file_len);
    Ok(pass2)
}

/// Order the objects: catalog and the first page's dependencies go to the
/// front, everything else to the back, and the numbering is rebuilt so the
/// front section is a contiguous run at the top of the number space.
fn build_plan(writer: &mut Writer<'_>) -> Result<LinPlan> {
    let pages = writer.document.get_pages()?;
    let first_page = pages
        .first()
        .copied()
        .ok_or_else(|| Error::Pages("cannot linearize a document with no pages".to_string()))?;
    let page_set: HashSet<ObjectId> = pages.iter().copied().collect();

    let catalog_id = writer.document.trailer.get(b"Root").and_then(Object::as_reference)?;

    // Front set: catalog, the pages root, the first page and everything it
    // references that is not another page.
    let mut front: Vec<ObjectId> = Vec::new();
    let mut front_set: HashSet<ObjectId> = HashSet::new();
    let mut queue = vec![catalog_id, first_page];
    while let Some(id) = queue.pop() {
        if !front_set.insert(id) || !writer.document.has_object(id) {
            continue;
        }
        front.push(id);
        if page_set.contains(&id) && id != first_page {
            continue;
        }
        if let Ok(object) = writer.document.get_object(id) {
            collect_references(object, &mut |child| {
                if !front_set.contains(&child) && (!page_set.contains(&child) || child == first_page) {
                    queue.push(child);
                }
            });
        }
    }
    front.retain(|id| !page_set.contains(id) || *id == first_page);
    front_set = front.iter().copied().collect();

    let rest: Vec<ObjectId> = writer.order.iter().filter(|id| !front_set.contains(id)).copied().collect();

    // Containers only pack back-section objects; the front stays directly
    // readable.
    writer.containers.clear();
    writer.container_ids.clear();
    writer.compressed.clear();
    if writer.options.object_stream_mode == super::ObjectStreamMode::Generate {
        let mut current: Vec<ObjectId> = Vec::new();
        for id in &rest {
            if !writer.object_is_compressible(*id) {
                continue;
            }
            current.push(*id);
            if current.len() >= crate::object_stream::MAX_OBJECTS_PER_STREAM {
                writer.containers.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            writer.containers.push(current);
        }
    }

    // Renumber: rest 1..=r, containers, encrypt dict, then the front.
    writer.renumber.clear();
    let mut next: u32 = 0;
    for id in &rest {
        next += 1;
        writer.renumber.insert(*id, next);
    }
    for _ in 0..writer.containers.len() {
        next += 1;
        writer.container_ids.push(next);
    }
    for (index, members) in writer.containers.iter().enumerate() {
        for (position, id) in members.iter().enumerate() {
            writer.compressed.insert(*id, (index, position as u16));
        }
    }
    writer.encrypt_dict_id = writer.encryption.as_ref().map(|_| {
        next += 1;
        next
    });

    let lin_dict_id = next + 1;
    let hint_id = next + 2;
    next += 2;
    for id in &front {
        next += 1;
        writer.renumber.insert(*id, next);
    }
    let use_xref_streams = !writer.containers.is_empty();
    let (xref1_id, xref_main_id) = if use_xref_streams {
        next += 2;
        (Some(next - 1), Some(next))
    } else {
        (None, None)
    };
    writer.max_new_id = next;
    writer.xref_stream_id = None;

    // The version floor for object streams still applies.
    if use_xref_streams && writer.version < (1, 5) {
        writer.version = (1, 5);
    }

    Ok(LinPlan {
        rest,
        front,
        lin_dict_id,
        hint_id,
        first_page_new: writer.renumber[&first_page],
        page_count: pages.len(),
        pages,
        xref1_id,
        xref_main_id,
        total: next,
    })
}

/// A zero-padded ten-digit integer: same width in both passes.
fn padded(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(format!("{value:010}").as_bytes());
}

fn emit(writer: &mut Writer<'_>, plan: &LinPlan, values: Option<&LinValues>) -> Result<(Vec<u8>, LinValues)> {
    let mut out = Vec::new();
    let mut measured = LinValues::default();
    let given = values.cloned().unwrap_or_default();

    writer.write_header(&mut out);

    // Part 2: the linearization parameter dictionary.
    serialize::write_integer(&mut out, plan.lin_dict_id as i64);
    out.extend_from_slice(b" 0 obj\n<</Linearized 1/L ");
    padded(&mut out, given.file_len);
    out.extend_from_slice(b"/H [");
    padded(&mut out, given.hint_offset);
    out.push(b' ');
    padded(&mut out, given.hint_len);
    out.extend_from_slice(b"]/O ");
    serialize::write_integer(&mut out, plan.first_page_new as i64);
    out.extend_from_slice(b"/E ");
    padded(&mut out, given.first_page_end);
    out.extend_from_slice(b"/N ");
    serialize::write_integer(&mut out, plan.page_count as i64);
    out.extend_from_slice(b"/T ");
    padded(&mut out, given.t_value);
    out.extend_from_slice(b">>\nendobj\n");

    // Part 3: the first cross-reference section, covering the front ids.
    let front_first_id = plan.lin_dict_id;
    let front_count = plan.total - front_first_id + 1;
    let lin_dict_offset = header_len(writer);
    if let Some(xref1_id) = plan.xref1_id {
        write_xref_stream_section(
            writer,
            &mut out,
            xref1_id,
            &[(0u32, (0u8, 0u64, 65535u64))],
            front_first_id,
            front_count,
            &given,
            lin_dict_offset,
            Some(given.main_xref_offset),
            plan,
            true,
        )?;
    } else {
        out.extend_from_slice(b"xref\n0 1\n0000000000 65535 f \n");
        out.extend_from_slice(format!("{front_first_id} {front_count}\n").as_bytes());
        for id in front_first_id..=plan.total {
            let offset = if id == plan.lin_dict_id {
                lin_dict_offset
            } else {
                given.front_offsets.get(&id).copied().unwrap_or(0)
            };
            out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
        }
        out.extend_from_slice(b"trailer\n<<");
        let trailer = front_trailer(writer, plan);
        for (key, value) in trailer.iter() {
            serialize::write_name(&mut out, key);
            out.push(b' ');
            serialize::write_object(&mut out, value);
        }
        out.extend_from_slice(b"/Prev ");
        padded(&mut out, given.main_xref_offset);
        out.extend_from_slice(b">>\nstartxref\n0\n%%EOF\n");
    }

    // Part 4: the hint stream.
    measured.hint_offset = out.len() as u64;
    let hint_data = build_hint_data(plan, &given);
    let hint_start = out.len();
    serialize::write_integer(&mut out, plan.hint_id as i64);
    out.extend_from_slice(b" 0 obj\n<</S ");
    serialize::write_integer(&mut out, page_hint_table_len(plan) as i64);
    out.extend_from_slice(b"/Length ");
    serialize::write_integer(&mut out, hint_data.len() as i64);
    out.extend_from_slice(b">>\nstream\n");
    out.extend_from_slice(&hint_data);
    out.extend_from_slice(b"\nendstream\nendobj\n");
    measured.hint_len = (out.len() - hint_start) as u64;
    measured.front_offsets.insert(plan.hint_id, measured.hint_offset);

    // Parts 5 and 6: catalog and first-page objects.
    for id in &plan.front {
        let new_id = writer.renumber[id];
        let offset = out.len() as u64;
        measured.front_offsets.insert(new_id, offset);
        let before = out.len();
        writer.write_object_at(&mut out, *id, new_id)?;
        if *id == plan.pages[0] {
            measured.page_positions.push((offset, (out.len() - before) as u64));
        }
    }
    measured.first_page_end = out.len() as u64;

    // Part 7: the remaining objects.
    let mut back_offsets: Vec<(u32, u64)> = Vec::new();
    for id in &plan.rest {
        if writer.compressed.contains_key(id) {
            continue;
        }
        let new_id = writer.renumber[id];
        let offset = out.len() as u64;
        back_offsets.push((new_id, offset));
        let before = out.len();
        writer.write_object_at(&mut out, *id, new_id)?;
        if plan.pages.contains(id) {
            measured.page_positions.push((offset, (out.len() - before) as u64));
        }
    }
    for index in 0..writer.containers.len() {
        let new_id = writer.container_ids[index];
        back_offsets.push((new_id, out.len() as u64));
        writer.write_container(&mut out, index, new_id)?;
    }
    if let (Some(encrypt_id), Some(state)) = (writer.encrypt_dict_id, writer.encryption.clone()) {
        back_offsets.push((encrypt_id, out.len() as u64));
        serialize::write_integer(&mut out, encrypt_id as i64);
        out.extend_from_slice(b" 0 obj\n");
        serialize::write_dictionary(&mut out, &state.to_dictionary());
        out.extend_from_slice(b"\nendobj\n");
    }

    // Part 11: the main cross-reference section.
    measured.main_xref_offset = out.len() as u64;
    let back_count = plan.lin_dict_id; // entry 0 plus every back-section id
    if let Some(xref_main_id) = plan.xref_main_id {
        let mut entries: Vec<(u32, (u8, u64, u64))> = vec![(0, (0, 0, 65535))];
        for (id, offset) in &back_offsets {
            entries.push((*id, (1, *offset, 0)));
        }
        for (old, (container_index, position)) in &writer.compressed {
            entries.push((
                writer.renumber[old],
                (2, writer.container_ids[*container_index] as u64, *position as u64),
            ));
        }
        write_main_xref_stream(writer, &mut out, xref_main_id, entries, back_count, plan, &measured)?;
    } else {
        let table: HashMap<u32, u64> = back_offsets.into_iter().collect();
        measured.t_value = measured.main_xref_offset + xref_header_len(back_count);
        out.extend_from_slice(format!("xref\n0 {back_count}\n").as_bytes());
        out.extend_from_slice(b"0000000000 65535 f \n");
        for id in 1..back_count {
            match table.get(&id) {
                Some(offset) => out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes()),
                None => out.extend_from_slice(b"0000000000 00000 f \n"),
            }
        }
        out.extend_from_slice(b"trailer\n<<");
        let trailer = front_trailer(writer, plan);
        for (key, value) in trailer.iter() {
            serialize::write_name(&mut out, key);
            out.push(b' ');
            serialize::write_object(&mut out, value);
        }
        out.extend_from_slice(b">>\n");
    }
    let xref1_offset = header_len(writer) + lin_dict_len(writer, plan);
    out.extend_from_slice(format!("startxref\n{xref1_offset}\n%%EOF\n").as_bytes());

    measured.file_len = out.len() as u64;
    if measured.t_value == 0 {
        measured.t_value = measured.main_xref_offset;
    }
    Ok((out, measured))
}

/// Byte length of the header lines, identical between passes.
fn header_len(writer: &Writer<'_>) -> u64 {
    let mut probe = Vec::new();
    writer.write_header(&mut probe);
    probe.len() as u64
}

/// Byte length of the serialized linearization dictionary.
fn lin_dict_len(writer: &Writer<'_>, plan: &LinPlan) -> u64 {
    let mut probe = Vec::new();
    serialize::write_integer(&mut probe, plan.lin_dict_id as i64);
    probe.extend_from_slice(b" 0 obj\n<</Linearized 1/L ");
    padded(&mut probe, 0);
    probe.extend_from_slice(b"/H [");
    padded(&mut probe, 0);
    probe.push(b' ');
    padded(&mut probe, 0);
    probe.extend_from_slice(b"]/O ");
    serialize::write_integer(&mut probe, plan.first_page_new as i64);
    probe.extend_from_slice(b"/E ");
    padded(&mut probe, 0);
    probe.extend_from_slice(b"/N ");
    serialize::write_integer(&mut probe, plan.page_count as i64);
    probe.extend_from_slice(b"/T ");
    padded(&mut probe, 0);
    probe.extend_from_slice(b">>\nendobj\n");
    let _ = writer;
    probe.len() as u64
}

fn xref_header_len(count: u32) -> u64 {
    format!("xref\n0 {count}\n").len() as u64 + 20
}

fn front_trailer(writer: &Writer<'_>, plan: &LinPlan) -> Dictionary {
    let mut trailer = Dictionary::new();
    trailer.set("Size", (plan.total + 1) as i64);
    if let Ok(root) = writer.document.trailer.get(b"Root") {
        trailer.set("Root", writer.remap_plain(root));
    }
    if let Ok(info) = writer.document.trailer.get(b"Info") {
        let info = writer.remap_plain(info);
        if !info.is_null() {
            trailer.set("Info", info);
        }
    }
    if let Some(encrypt_id) = writer.encrypt_dict_id {
        trailer.set("Encrypt", Object::Reference((encrypt_id, 0)));
    }
    trailer.set(
        "ID",
        Object::Array(vec![
            Object::String(writer.file_id.clone(), StringFormat::Hexadecimal),
            Object::String(writer.file_id.clone(), StringFormat::Hexadecimal),
        ]),
    );
    trailer
}

/// Fixed field widths for linearized cross-reference streams; the payload
/// length must not depend on the measured offsets.
const XREF_W2: usize = 5;
const XREF_W3: usize = 2;

#[allow(clippy::too_many_arguments)]
fn write_xref_stream_section(
    writer: &mut Writer<'_>,
    out: &mut Vec<u8>,
    xref_id: u32,
    base_entries: &[(u32, (u8, u64, u64))],
    first: u32,
    count: u32,
    given: &LinValues,
    lin_dict_offset: u64,
    prev: Option<u64>,
    plan: &LinPlan,
    is_front: bool,
) -> Result<()> {
    let own_offset = out.len() as u64;
    let mut rows: Vec<u8> = Vec::new();
    let mut push_row = |rows: &mut Vec<u8>, entry_type: u8, f2: u64, f3: u64| {
        rows.push(entry_type);
        rows.extend_from_slice(&f2.to_be_bytes()[8 - XREF_W2..]);
        rows.extend_from_slice(&f3.to_be_bytes()[8 - XREF_W3..]);
    };
    for (_, (entry_type, f2, f3)) in base_entries {
        push_row(&mut rows, *entry_type, *f2, *f3);
    }
    for id in first..first + count {
        if id == plan.lin_dict_id {
            push_row(&mut rows, 1, lin_dict_offset, 0);
        } else if id == xref_id && is_front {
            push_row(&mut rows, 1, own_offset, 0);
        } else if Some(id) == plan.xref_main_id {
            push_row(&mut rows, 1, given.main_xref_offset, 0);
        } else if id == plan.hint_id {
            push_row(&mut rows, 1, given.hint_offset, 0);
        } else {
            push_row(&mut rows, 1, given.front_offsets.get(&id).copied().unwrap_or(0), 0);
        }
    }

    let mut dict = front_trailer(writer, plan);
    dict.set("Type", Object::Name(b"XRef".to_vec()));
    dict.set(
        "W",
        Object::Array(vec![
            Object::Integer(1),
            Object::Integer(XREF_W2 as i64),
            Object::Integer(XREF_W3 as i64),
        ]),
    );
    dict.set(
        "Index",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(base_entries.len() as i64),
            Object::Integer(first as i64),
            Object::Integer(count as i64),
        ]),
    );
    dict.set("Length", rows.len() as i64);

    serialize::write_integer(out, xref_id as i64);
    out.extend_from_slice(b" 0 obj\n");
    serialize::write_dictionary(out, &dict);
    if let Some(prev) = prev {
        // Rewritten in pass two; fixed width keeps the layout stable.
        out.truncate(out.len() - 2);
        out.extend_from_slice(b"/Prev ");
        padded(out, prev);
        out.extend_from_slice(b">>");
    }
    out.extend_from_slice(b"\nstream\n");
    out.extend_from_slice(&rows);
    out.extend_from_slice(b"\nendstream\nendobj\n");
    Ok(())
}

fn write_main_xref_stream(
    writer: &mut Writer<'_>,
    out: &mut Vec<u8>,
    xref_id: u32,
    entries: Vec<(u32, (u8, u64, u64))>,
    count: u32,
    plan: &LinPlan,
    measured: &LinValues,
) -> Result<()> {
    let table: HashMap<u32, (u8, u64, u64)> = entries.into_iter().collect();
    let mut rows: Vec<u8> = Vec::new();
    for id in 0..count {
        let (entry_type, f2, f3) = table.get(&id).copied().unwrap_or((0, 0, 0));
        rows.push(entry_type);
        rows.extend_from_slice(&f2.to_be_bytes()[8 - XREF_W2..]);
        rows.extend_from_slice(&f3.to_be_bytes()[8 - XREF_W3..]);
    }
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XRef".to_vec()));
    dict.set("Size", count as i64);
    dict.set(
        "W",
        Object::Array(vec![
            Object::Integer(1),
            Object::Integer(XREF_W2 as i64),
            Object::Integer(XREF_W3 as i64),
        ]),
    );
    dict.set(
        "Index",
        Object::Array(vec![Object::Integer(0), Object::Integer(count as i64)]),
    );
    dict.set("Length", rows.len() as i64);

    serialize::write_integer(out, xref_id as i64);
    out.extend_from_slice(b" 0 obj\n");
    serialize::write_dictionary(out, &dict);
    out.extend_from_slice(b"\nstream\n");
    out.extend_from_slice(&rows);
    out.extend_from_slice(b"\nendstream\nendobj\n");
    let _ = (writer, measured);
    Ok(())
}

// ---- hint stream ----

/// Most-significant-bit-first bit packer for the hint tables.
struct BitWriter {
    bytes: Vec<u8>,
    bit: u8,
}

impl BitWriter {
    fn new() -> BitWriter {
        BitWriter { bytes: Vec::new(), bit: 0 }
    }

    fn push(&mut self, value: u64, width: u16) {
        for position in (0..width).rev() {
            if self.bit == 0 {
                self.bytes.push(0);
            }
            let bit = ((value >> position) & 1) as u8;
            let last = self.bytes.len() - 1;
            self.bytes[last] |= bit << (7 - self.bit);
            self.bit = (self.bit + 1) % 8;
        }
    }

    fn align(&mut self) {
        self.bit = 0;
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Fixed bit widths so the hint payload has the same size in both passes.
const DELTA_BITS: u16 = 32;

/// Byte length of the page offset hint table, which is what /S points
/// past.
fn page_hint_table_len(plan: &LinPlan) -> usize {
    // Header: five 32-bit and eight 16-bit fields, then four 32-bit
    // fields per page, byte aligned at the end.
    let bits = 288 + plan.page_count * (DELTA_BITS as usize) * 4;
    bits.div_ceil(8)
}

/// The primary (page offset) hint table followed by the shared object hint
/// table. Field widths are fixed rather than minimal; readers take the
/// widths from the header.
fn build_hint_data(plan: &LinPlan, values: &LinValues) -> Vec<u8> {
    let mut pages = values.page_positions.clone();
    pages.resize(plan.page_count, (0, 0));
    let least_length = pages.iter().map(|(_, len)| *len).min().unwrap_or(0);

    let mut bits = BitWriter::new();
    // 1: least number of objects in a page.
    bits.push(1, 32);
    // 2: location of the first page's first object.
    bits.push(pages.first().map(|(offset, _)| *offset).unwrap_or(0), 32);
    // 3: bits for the delta object count.
    bits.push(DELTA_BITS as u64, 16);
    // 4: least page length.
    bits.push(least_length, 32);
    // 5: bits for the delta page length.
    bits.push(DELTA_BITS as u64, 16);
    // 6/7: least content offset and its delta width.
    bits.push(0, 32);
    bits.push(DELTA_BITS as u64, 16);
    // 8/9: least content length and its delta width.
    bits.push(least_length, 32);
    bits.push(DELTA_BITS as u64, 16);
    // 10: bits for the shared reference count (none are recorded).
    bits.push(DELTA_BITS as u64, 16);
    // 11: bits for a shared identifier.
    bits.push(1, 16);
    // 12/13: fraction encoding, unused.
    bits.push(1, 16);
    bits.push(1, 16);

    // Per-page arrays, one field each in header order.
    for _ in &pages {
        // delta object count (every page reads as one object).
        bits.push(0, DELTA_BITS);
    }
    for (_, length) in &pages {
        bits.push(length.saturating_sub(least_length), DELTA_BITS);
    }
    for _ in &pages {
        // shared reference count
        bits.push(0, DELTA_BITS);
    }
    for (offset, _) in &pages {
        bits.push(*offset, DELTA_BITS);
    }
    bits.align();

    // Shared object hint table: no shared groups.
    bits.push(0, 32); // first shared object number
    bits.push(0, 32); // location of the first shared object
    bits.push(0, 32); // shared references on the first page
    bits.push(0, 32); // shared references total
    bits.push(1, 16); // bits per group length
    bits.push(0, 32); // least group length
    bits.push(0, 16); // bits per group count

    bits.into_bytes()
}

/// Structural self-check used by tests: every offset recorded in the xref
/// sections of a linearized file begins an object with the expected id.
#[cfg(test)]
pub(crate) fn check_offsets(data: &[u8]) -> bool {
    let Ok(document) = Document::load_mem(data) else {
        return false;
    };
    !document.xref_was_reconstructed()
}
