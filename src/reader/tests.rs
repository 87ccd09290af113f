use std::collections::BTreeMap;

use crate::{Document, Object};

/// Assemble a classic-xref file from object bodies, with correct offsets.
fn build_pdf(objects: &[(u32, &str)], root: u32) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(b"%PDF-1.5\n%\xE2\xE3\xCF\xD3\n");
    let mut offsets: BTreeMap<u32, usize> = BTreeMap::new();
    for (id, body) in objects {
        offsets.insert(*id, out.len());
        out.extend_from_slice(format!("{id} 0 obj\n{body}\nendobj\n").as_bytes());
    }
    let xref_pos = out.len();
    let max = *offsets.keys().next_back().unwrap();
    out.extend_from_slice(format!("xref\n0 {}\n", max + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for id in 1..=max {
        match offsets.get(&id) {
            Some(offset) => out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes()),
            None => out.extend_from_slice(b"0000000000 65535 f \n"),
        }
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root {root} 0 R >>\nstartxref\n{xref_pos}\n%%EOF",
            max + 1
        )
        .as_bytes(),
    );
    out
}

fn minimal_objects() -> Vec<(u32, &'static str)> {
    vec![
        (1, "<< /Type /Catalog /Pages 2 0 R >>"),
        (2, "<< /Type /Pages /Kids [3 0 R] /Count 1 >>"),
        (3, "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Resources << >> >>"),
    ]
}

#[test]
fn load_minimal_document() {
    let data = build_pdf(&minimal_objects(), 1);
    let doc = Document::load_mem(&data).unwrap();
    assert_eq!(doc.version, "1.5");
    assert_eq!(doc.binary_mark, vec![0xE2, 0xE3, 0xCF, 0xD3]);
    assert_eq!(doc.objects.len(), 3);
    assert!(!doc.xref_was_reconstructed());
    let catalog = doc.catalog().unwrap();
    assert!(catalog.has_type(b"Catalog"));
    assert_eq!(catalog.get(b"Pages").unwrap().as_reference().unwrap(), (2, 0));
}

#[test]
fn load_document_with_preceding_bytes() {
    let mut data = b"garbage bytes before the header\n".to_vec();
    data.extend(build_pdf(&minimal_objects(), 1));
    let doc = Document::load_mem(&data).unwrap();
    assert_eq!(doc.version, "1.5");
    assert_eq!(doc.objects.len(), 3);
}

#[test]
fn load_short_document_fails() {
    assert!(Document::load_mem(b"%PDF-1.5\n%%EOF\n").is_err());
}

#[test]
fn damaged_startxref_triggers_reconstruction() {
    let mut data = build_pdf(&minimal_objects(), 1);
    // Point startxref one byte past the true location.
    let pos = data.windows(9).rposition(|w| w == b"startxref").unwrap();
    let digits_at = pos + 10;
    let end = data[digits_at..].iter().position(|b| *b == b'\n').unwrap() + digits_at;
    let offset: usize = std::str::from_utf8(&data[digits_at..end]).unwrap().parse().unwrap();
    let fixed = format!("{}", offset + 1);
    data.splice(digits_at..end, fixed.bytes());

    let mut doc = Document::load_mem(&data).unwrap();
    assert!(doc.xref_was_reconstructed());
    assert!(!doc.take_warnings().is_empty());
    // All pages are still readable.
    assert_eq!(doc.objects.len(), 3);
    let catalog = doc.catalog().unwrap();
    assert!(catalog.has_type(b"Catalog"));
}

#[test]
fn missing_trailer_recovers_via_catalog_scan() {
    let mut data: Vec<u8> = Vec::new();
    data.extend_from_slice(b"%PDF-1.4\n");
    for (id, body) in minimal_objects() {
        data.extend_from_slice(format!("{id} 0 obj\n{body}\nendobj\n").as_bytes());
    }
    // No xref, no trailer, just an EOF marker far enough from the start.
    data.extend_from_slice(b"startxref\n999999\n%%EOF");
    let doc = Document::load_mem(&data).unwrap();
    assert!(doc.xref_was_reconstructed());
    assert!(doc.trailer.get(b"Root").is_ok());
    assert!(doc.catalog().unwrap().has_type(b"Catalog"));
}

#[test]
fn stream_with_wrong_length_is_repaired() {
    let objects = vec![
        (1, "<< /Type /Catalog /Pages 2 0 R >>"),
        (2, "<< /Type /Pages /Kids [3 0 R] /Count 1 >>"),
        (
            3,
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R >>",
        ),
        (4, "<< /Length 9999 >>\nstream\nBT ET\nendstream"),
    ];
    let data = build_pdf(&objects, 1);
    let mut doc = Document::load_mem(&data).unwrap();
    let stream = doc.get_object((4, 0)).unwrap().as_stream().unwrap();
    assert_eq!(stream.dict.get(b"Length").unwrap().as_i64().unwrap(), 5);
    let payload = doc.raw_stream_bytes(stream).unwrap();
    assert_eq!(payload, b"BT ET");
    assert!(!doc.take_warnings().is_empty());
}

#[test]
fn stream_with_indirect_length() {
    let objects = vec![
        (1, "<< /Type /Catalog /Pages 2 0 R >>"),
        (2, "<< /Type /Pages /Kids [] /Count 0 >>"),
        (3, "<< /Length 5 0 R >>\nstream\nhello world\nendstream"),
        (5, "11"),
    ];
    let data = build_pdf(&objects, 1);
    let doc = Document::load_mem(&data).unwrap();
    let stream = doc.get_object((3, 0)).unwrap().as_stream().unwrap();
    let payload = doc.raw_stream_bytes(stream).unwrap();
    assert_eq!(payload, b"hello world");
}

#[test]
fn incremental_update_newest_definition_wins() {
    // First revision.
    let mut data = build_pdf(&minimal_objects(), 1);
    let first_xref = {
        let pos = data.windows(9).rposition(|w| w == b"startxref").unwrap();
        let digits_at = pos + 10;
        let end = data[digits_at..].iter().position(|b| *b == b'\n').unwrap() + digits_at;
        std::str::from_utf8(&data[digits_at..end]).unwrap().parse::<usize>().unwrap()
    };
    // Incremental update replacing object 3.
    let update_offset = data.len() + 1;
    data.push(b'\n');
    data.extend_from_slice(
        b"3 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 100 100] /Resources << >> >>\nendobj\n",
    );
    let xref_pos = data.len();
    data.extend_from_slice(format!("xref\n3 1\n{update_offset:010} 00000 n \n").as_bytes());
    data.extend_from_slice(
        format!("trailer\n<< /Size 4 /Root 1 0 R /Prev {first_xref} >>\nstartxref\n{xref_pos}\n%%EOF").as_bytes(),
    );

    let doc = Document::load_mem(&data).unwrap();
    let page = doc.get_dictionary((3, 0)).unwrap();
    let media_box = page.get(b"MediaBox").unwrap().as_array().unwrap();
    assert_eq!(media_box[2].as_i64().unwrap(), 100);
}

#[test]
fn search_substring_finds_last_occurrence() {
    use super::Reader;
    assert_eq!(Reader::search_substring(b"hello world", b"xyz", 0), None);
    assert_eq!(Reader::search_substring(b"hello world", b"world", 0), Some(6));

    let buffer = b"%%EOF\ntest%%EOF\nend";
    assert_eq!(Reader::search_substring(buffer, b"%%EOF", 0), Some(10));
    assert_eq!(Reader::search_substring(buffer, b"%%EOF", 6), Some(10));
    assert_eq!(Reader::search_substring(buffer, b"%%EOF", 15), None);
    assert_eq!(Reader::search_substring_forward(buffer, b"%%EOF", 0), Some(0));
    assert_eq!(Reader::search_substring_forward(buffer, b"%%EOF", 1), Some(10));
}

#[test]
fn reference_cycle_in_length_is_an_error_not_a_hang() {
    let objects = vec![
        (1, "<< /Type /Catalog /Pages 2 0 R >>"),
        (2, "<< /Type /Pages /Kids [] /Count 0 >>"),
        (3, "<< /Length 3 0 R >>\nstream\nxy\nendstream"),
    ];
    let data = build_pdf(&objects, 1);
    // The self-referential /Length cannot resolve; the stream is repaired
    // by scanning instead.
    let doc = Document::load_mem(&data).unwrap();
    let stream = doc.get_object((3, 0)).unwrap().as_stream().unwrap();
    assert_eq!(doc.raw_stream_bytes(stream).unwrap(), b"xy");
}
