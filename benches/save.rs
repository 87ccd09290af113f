use criterion::{criterion_group, criterion_main, Criterion};
use opdf::{dictionary, Dictionary, Document, Object, ObjectStreamMode, SaveOptions, Stream};

fn build_document(pages: usize) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for index in 0..pages {
        let content = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            format!("BT /F1 12 Tf 72 720 Td (page {index}) Tj ET").repeat(20).into_bytes(),
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
    doc
}

fn bench_save(c: &mut Criterion) {
    c.bench_function("save 50 pages", |b| {
        b.iter_batched(
            || build_document(50),
            |mut doc| {
                let mut out = Vec::new();
                doc.save_with(&mut out, &SaveOptions::new()).unwrap();
                out
            },
            criterion::BatchSize::SmallInput,
        )
    });
    c.bench_function("save 50 pages with object streams", |b| {
        b.iter_batched(
            || build_document(50),
            |mut doc| {
                let mut out = Vec::new();
                doc.save_with(
                    &mut out,
                    &SaveOptions {
                        object_stream_mode: ObjectStreamMode::Generate,
                        ..SaveOptions::new()
                    },
                )
                .unwrap();
                out
            },
            criterion::BatchSize::SmallInput,
        )
    });
    c.bench_function("save 50 pages linearized", |b| {
        b.iter_batched(
            || build_document(50),
            |mut doc| {
                let mut out = Vec::new();
                doc.save_with(
                    &mut out,
                    &SaveOptions {
                        linearize: true,
                        ..SaveOptions::new()
                    },
                )
                .unwrap();
                out
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_save);
criterion_main!(benches);
