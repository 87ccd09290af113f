use criterion::{criterion_group, criterion_main, Criterion};
use opdf::{dictionary, Dictionary, Document, Object, SaveOptions, Stream};

fn synthetic_document(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for index in 0..pages {
        let content = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            format!("BT /F1 12 Tf 72 720 Td (page {index}) Tj ET").into_bytes(),
        )));
        let page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => dictionary! {},
            "Contents" => Object::Reference(content),
        });
        kids.push(Object::Reference(page));
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog));

    let mut out = Vec::new();
    doc.save_with(&mut out, &SaveOptions::new()).unwrap();
    out
}

fn bench_load(c: &mut Criterion) {
    let small = synthetic_document(5);
    let large = synthetic_document(200);
    c.bench_function("load 5 pages", |b| {
        b.iter(|| Document::load_mem(&small).unwrap())
    });
    c.bench_function("load 200 pages", |b| {
        b.iter(|| Document::load_mem(&large).unwrap())
    });
}

fn bench_object_parse(c: &mut Criterion) {
    let source = b"<< /Type /Page /MediaBox [0 0 612.0 792.0] /Notes [(a) (b) <414243>] /Rotate 90 >>";
    c.bench_function("parse dictionary", |b| {
        b.iter(|| Object::parse(source).unwrap())
    });
}

criterion_group!(benches, bench_load, bench_object_parse);
criterion_main!(benches);
