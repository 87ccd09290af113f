use opdf::{dictionary, Dictionary, Document, ForeignCopier, Object, SaveOptions, Stream};

fn document_with_pages(texts: &[&str]) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let mut kids = Vec::new();
    for text in texts {
        let content = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            format!("BT /F1 12 Tf ({text}) Tj ET").into_bytes(),
        )));
        let page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => Object::Reference(font) },
            },
            "Contents" => Object::Reference(content),
        });
        kids.push(Object::Reference(page));
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => texts.len() as i64,
        }),
    );
    let catalog = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog));
    doc
}

fn page_font(doc: &Document, page: opdf::ObjectId) -> opdf::ObjectId {
    let resources = doc
        .get_dictionary(page)
        .unwrap()
        .get(b"Resources")
        .unwrap()
        .clone();
    let resources = match resources {
        Object::Reference(id) => doc.get_dictionary(id).unwrap().clone(),
        Object::Dictionary(dict) => dict,
        other => panic!("unexpected resources: {other:?}"),
    };
    resources
        .get(b"Font")
        .unwrap()
        .as_dict()
        .unwrap()
        .get(b"F1")
        .unwrap()
        .as_reference()
        .unwrap()
}

#[test]
fn page_list_maps_positions_to_leaves() {
    let mut doc = document_with_pages(&["one", "two", "three"]);
    let pages = doc.get_pages().unwrap();
    assert_eq!(pages.len(), 3);
    for (index, page) in pages.iter().enumerate() {
        assert_eq!(doc.find_page(*page).unwrap(), index);
        assert!(doc.get_dictionary(*page).unwrap().has_type(b"Page"));
    }
}

#[test]
fn insert_foreign_page_with_shared_resource() {
    let source = document_with_pages(&["src one", "src two"]);
    let mut source = source;
    let source_pages = source.get_pages().unwrap();
    let source_font = page_font(&source, source_pages[0]);

    let mut target = document_with_pages(&["dst"]);
    let mut copier = ForeignCopier::new();
    let local = target
        .insert_foreign_page(&source, &mut copier, source_pages[0], 1)
        .unwrap();

    let pages = target.get_pages().unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[1], local);

    // The target page references the target's copy of the font.
    let local_font = page_font(&target, local);
    assert!(target.has_object(local_font));

    // Mutating the source font does not affect the copy.
    source
        .get_dictionary_mut(source_font)
        .unwrap()
        .set("BaseFont", Object::Name(b"Courier".to_vec()));
    assert_eq!(
        target
            .get_dictionary(local_font)
            .unwrap()
            .get(b"BaseFont")
            .unwrap()
            .as_name()
            .unwrap(),
        b"Helvetica"
    );

    // The merged document survives a write/read cycle.
    let mut out = Vec::new();
    target.save_with(&mut out, &SaveOptions::new()).unwrap();
    let mut reloaded = Document::load_mem(&out).unwrap();
    assert_eq!(reloaded.get_pages().unwrap().len(), 2);
}

#[test]
fn inserting_both_pages_shares_the_font_once() {
    let mut source = document_with_pages(&["a", "b"]);
    let source_pages = source.get_pages().unwrap();

    let mut target = document_with_pages(&["existing"]);
    let mut copier = ForeignCopier::new();
    let first = target
        .insert_foreign_page(&source, &mut copier, source_pages[0], 0)
        .unwrap();
    let second = target
        .insert_foreign_page(&source, &mut copier, source_pages[1], 1)
        .unwrap();

    assert_eq!(page_font(&target, first), page_font(&target, second));
    assert_eq!(target.get_pages().unwrap().len(), 3);
}

#[test]
fn remove_then_reinsert_keeps_list_consistent() {
    let mut doc = document_with_pages(&["p0", "p1", "p2"]);
    let pages = doc.get_pages().unwrap();
    doc.remove_page(pages[1]).unwrap();
    assert_eq!(doc.get_pages().unwrap(), vec![pages[0], pages[2]]);
    doc.insert_page(pages[1], 0).unwrap();
    assert_eq!(doc.get_pages().unwrap(), vec![pages[1], pages[0], pages[2]]);

    let mut out = Vec::new();
    doc.save_with(&mut out, &SaveOptions::new()).unwrap();
    let mut reloaded = Document::load_mem(&out).unwrap();
    let reloaded_pages = reloaded.get_pages().unwrap();
    assert_eq!(reloaded_pages.len(), 3);
    // Depth-first kid order equals the page list order.
    let root = reloaded.catalog().unwrap().get(b"Pages").unwrap().as_reference().unwrap();
    let kids = reloaded.get_dictionary(root).unwrap().get(b"Kids").unwrap().as_array().unwrap().clone();
    let kid_ids: Vec<_> = kids.iter().map(|kid| kid.as_reference().unwrap()).collect();
    assert_eq!(kid_ids, reloaded_pages);
}

#[test]
fn linearized_multipage_output_is_structurally_sound() {
    let mut doc = document_with_pages(&["l0", "l1", "l2", "l3"]);
    let mut out = Vec::new();
    doc.save_with(
        &mut out,
        &SaveOptions {
            linearize: true,
            object_stream_mode: opdf::ObjectStreamMode::Generate,
            static_id: true,
            ..SaveOptions::new()
        },
    )
    .unwrap();

    // The linearization dictionary is the first indirect object.
    let body_start = out
        .iter()
        .enumerate()
        .position(|(index, byte)| *byte != b'%' && (index == 0 || out[index - 1] == b'\n') && byte.is_ascii_digit())
        .unwrap();
    let first_obj_region = &out[body_start..body_start + 200.min(out.len() - body_start)];
    assert!(
        first_obj_region.windows(11).any(|w| w == b"/Linearized"),
        "first object is the linearization dictionary"
    );

    // Every offset resolves: the reload does not need reconstruction and
    // every compressed object resolves.
    let mut reloaded = Document::load_mem(&out).unwrap();
    assert!(!reloaded.xref_was_reconstructed());
    assert!(reloaded.take_warnings().is_empty());
    assert_eq!(reloaded.get_pages().unwrap().len(), 4);
    for page in reloaded.get_pages().unwrap() {
        let content = reloaded.page_content(page).unwrap();
        assert!(content.starts_with(b"BT"));
    }
}
