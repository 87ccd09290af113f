use opdf::{dictionary, Dictionary, Document, Object, ObjectStreamMode, SaveOptions, Stream, StreamDataMode};

/// A three-object file: catalog, pages, one page.
fn minimal_document() -> Document {
    let mut doc = Document::with_version("1.4");
    let pages_id = doc.new_object_id();
    let page = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(pages_id),
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Resources" => dictionary! {},
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
fn minimal_file_round_trip() {
    let mut doc = minimal_document();
    assert_eq!(doc.get_pages().unwrap().len(), 1);

    let mut out = Vec::new();
    doc.save_with(&mut out, &SaveOptions::new()).unwrap();

    let mut reloaded = Document::load_mem(&out).unwrap();
    assert_eq!(reloaded.get_pages().unwrap().len(), 1);
    let root = reloaded.trailer.get(b"Root").unwrap().as_reference().unwrap();
    let catalog = reloaded.get_dictionary(root).unwrap();
    assert!(catalog.has_type(b"Catalog"));
    let pages_ref = catalog.get(b"Pages").unwrap().as_reference().unwrap();
    let pages = reloaded.get_dictionary(pages_ref).unwrap();
    assert_eq!(pages.get(b"Count").unwrap().as_i64().unwrap(), 1);
}

#[test]
fn save_to_file_and_load_back() {
    let mut doc = minimal_document();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.pdf");
    doc.save(&path).unwrap();
    let mut reloaded = Document::load(&path).unwrap();
    assert_eq!(reloaded.get_pages().unwrap().len(), 1);
}

#[test]
fn xref_is_coherent_after_write() {
    let mut doc = minimal_document();
    // A handful of value shapes that must survive.
    let values = doc.add_object(dictionary! {
        "Int" => 42,
        "Neg" => Object::Integer(-7),
        "Real" => Object::real_from(2.5),
        "Str" => Object::string_literal("with (parens) and \\ backslash"),
        "Hex" => Object::String(vec![0xDE, 0xAD, 0xBE, 0xEF], opdf::StringFormat::Hexadecimal),
        "Name" => Object::name("Needs#Escape Space"),
        "Null" => Object::Null,
        "Bool" => true,
        "Nested" => vec![Object::Array(vec![1.into(), 2.into()]).into(), Object::Dictionary(dictionary!{ "X" => 1 }).into()],
    });
    doc.catalog_mut().unwrap().set("Values", Object::Reference(values));

    let mut out = Vec::new();
    doc.save_with(&mut out, &SaveOptions::new()).unwrap();

    let reloaded = Document::load_mem(&out).unwrap();
    // No reconstruction: every recorded offset parsed back to an object.
    assert!(!reloaded.xref_was_reconstructed());
    let root = reloaded.trailer.get(b"Root").unwrap().as_reference().unwrap();
    let catalog = reloaded.get_dictionary(root).unwrap();
    let values = catalog.get(b"Values").unwrap().as_reference().unwrap();
    let dict = reloaded.get_dictionary(values).unwrap();
    assert_eq!(dict.get(b"Int").unwrap().as_i64().unwrap(), 42);
    assert_eq!(dict.get(b"Neg").unwrap().as_i64().unwrap(), -7);
    assert_eq!(dict.get(b"Real").unwrap().as_f64().unwrap(), 2.5);
    assert_eq!(
        dict.get(b"Str").unwrap().as_string_bytes().unwrap(),
        b"with (parens) and \\ backslash"
    );
    assert_eq!(
        dict.get(b"Hex").unwrap().as_string_bytes().unwrap(),
        &[0xDE, 0xAD, 0xBE, 0xEF]
    );
    assert_eq!(dict.get(b"Name").unwrap().as_name().unwrap(), b"Needs#Escape Space");
    assert!(dict.get(b"Null").unwrap().is_null());
    assert!(dict.get(b"Bool").unwrap().as_bool().unwrap());
}

#[test]
fn referenced_objgen_set_is_preserved_modulo_renumbering() {
    let mut doc = minimal_document();
    let shared = doc.add_object(Object::string_literal("shared"));
    let a = doc.add_object(dictionary! { "S" => Object::Reference(shared) });
    let b = doc.add_object(dictionary! { "S" => Object::Reference(shared) });
    doc.catalog_mut().unwrap().set("A", Object::Reference(a));
    doc.catalog_mut().unwrap().set("B", Object::Reference(b));

    let mut out = Vec::new();
    doc.save_with(&mut out, &SaveOptions::new()).unwrap();
    let reloaded = Document::load_mem(&out).unwrap();

    let catalog = reloaded.catalog().unwrap();
    let a = catalog.get(b"A").unwrap().as_reference().unwrap();
    let b = catalog.get(b"B").unwrap().as_reference().unwrap();
    let shared_a = reloaded.get_dictionary(a).unwrap().get(b"S").unwrap().as_reference().unwrap();
    let shared_b = reloaded.get_dictionary(b).unwrap().get(b"S").unwrap().as_reference().unwrap();
    assert_eq!(shared_a, shared_b);
    assert_eq!(
        reloaded.get_object(shared_a).unwrap().as_string_bytes().unwrap(),
        b"shared"
    );
}

#[test]
fn stream_modes_round_trip_payloads() {
    let payload = b"BT /F1 24 Tf 72 712 Td (stream mode test) Tj ET".to_vec();
    for mode in [StreamDataMode::Uncompress, StreamDataMode::Preserve, StreamDataMode::Compress] {
        let mut doc = minimal_document();
        let content = doc.add_object(Object::Stream(Stream::new(Dictionary::new(), payload.clone())));
        let page = doc.get_pages().unwrap()[0];
        doc.get_dictionary_mut(page)
            .unwrap()
            .set("Contents", Object::Reference(content));

        let mut out = Vec::new();
        doc.save_with(
            &mut out,
            &SaveOptions {
                stream_data_mode: Some(mode),
                ..SaveOptions::new()
            },
        )
        .unwrap();

        let mut reloaded = Document::load_mem(&out).unwrap();
        let page = reloaded.get_pages().unwrap()[0];
        assert_eq!(reloaded.page_content(page).unwrap(), payload, "mode {mode:?}");
    }
}

#[test]
fn object_streams_with_many_objects() {
    let mut doc = minimal_document();
    let mut ids = Vec::new();
    for index in 0..250 {
        ids.push(doc.add_object(Object::Integer(index)));
    }
    let refs: Vec<Object> = ids.iter().map(|id| Object::Reference(*id)).collect();
    doc.catalog_mut().unwrap().set("Numbers", Object::Array(refs));

    let mut out = Vec::new();
    doc.save_with(
        &mut out,
        &SaveOptions {
            object_stream_mode: ObjectStreamMode::Generate,
            ..SaveOptions::new()
        },
    )
    .unwrap();

    let reloaded = Document::load_mem(&out).unwrap();
    assert!(!reloaded.xref_was_reconstructed());
    let catalog = reloaded.catalog().unwrap();
    let numbers = catalog.get(b"Numbers").unwrap().as_array().unwrap().clone();
    assert_eq!(numbers.len(), 250);
    for (index, reference) in numbers.iter().enumerate() {
        let id = reference.as_reference().unwrap();
        assert_eq!(
            reloaded.get_object(id).unwrap().as_i64().unwrap(),
            index as i64,
            "object {index} resolves through its object stream"
        );
    }
}

#[test]
fn preserve_object_streams_keeps_grouping() {
    let mut doc = minimal_document();
    for index in 0..10 {
        let id = doc.add_object(Object::Integer(index));
        doc.catalog_mut().unwrap().set(format!("K{index}").into_bytes(), Object::Reference(id));
    }
    let mut generated = Vec::new();
    doc.save_with(
        &mut generated,
        &SaveOptions {
            object_stream_mode: ObjectStreamMode::Generate,
            ..SaveOptions::new()
        },
    )
    .unwrap();

    // Reload and write again preserving the compressed grouping.
    let mut reloaded = Document::load_mem(&generated).unwrap();
    let mut preserved = Vec::new();
    reloaded
        .save_with(
            &mut preserved,
            &SaveOptions {
                object_stream_mode: ObjectStreamMode::Preserve,
                ..SaveOptions::new()
            },
        )
        .unwrap();
    let again = Document::load_mem(&preserved).unwrap();
    assert!(again.objects.values().any(|object| {
        object
            .as_stream()
            .map(|stream| stream.dict.has_type(b"ObjStm"))
            .unwrap_or(false)
    }));
}

#[test]
fn writer_output_ends_with_eof_marker() {
    let mut doc = minimal_document();
    let mut out = Vec::new();
    doc.save_with(&mut out, &SaveOptions::new()).unwrap();
    assert!(out.starts_with(b"%PDF-1.4\n"));
    assert!(out.ends_with(b"startxref\n") == false);
    assert!(out.ends_with(b"%%EOF\n"));
}
