use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use nodeclad::assertion::Assertion;
use nodeclad::config::Settings;
use nodeclad::entity::Entity;
use nodeclad::persist::Persistor;
use nodeclad::search::{MemoryIndex, SearchIndex, SearchQuery};
use nodeclad::value::Value;

pub fn validation_benchmark(c: &mut Criterion) {
    let age = Assertion::int().min(0).max(150).build().unwrap();
    c.bench_function("validate int", |b| b.iter(|| age.validate("age", black_box(&Value::Int(42)))));

    let code = Assertion::str().size(3).regex("^[A-Z]+$").build().unwrap();
    c.bench_function("validate regex", |b| b.iter(|| code.validate("code", black_box(&Value::from("SEK")))));

    let scores = Assertion::array(Assertion::int().max(1000)).build().unwrap();
    let list = Value::from((0..1000).collect::<Vec<i64>>());
    c.bench_function("validate 1k members", |b| b.iter(|| scores.validate("scores", black_box(&list))));
}

pub fn persistence_benchmark(c: &mut Criterion) {
    let scratch = tempfile::tempdir().unwrap();
    let persistor = Persistor::in_memory(Settings::for_test(scratch.path()));
    let people = persistor
        .declare(
            Entity::builder("Shop::Person")
                .attribute("age", Assertion::int().min(0).max(150))
                .attribute("tags", Assertion::array(Assertion::str())),
        )
        .unwrap();

    let mut node = people.create().with("age", 34).unwrap().with("tags", vec!["a", "b", "c"]).unwrap();
    people.save(&mut node, None).unwrap();
    let id = node.key().clone();
    c.bench_function("sqlite save", |b| b.iter(|| people.save(&mut node, None).unwrap()));
    c.bench_function("sqlite load", |b| b.iter(|| people.load(black_box(id.clone())).unwrap()));
}

pub fn search_benchmark(c: &mut Criterion) {
    let index = MemoryIndex::new();
    index.provision("Blog::Article", &["body"]).unwrap();
    for n in 0..10_000 {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("body".to_string(), format!("article number {n} about topic{}", n % 100));
        index.add("Blog::Article", &n.to_string(), &fields).unwrap();
    }
    let query = SearchQuery::parse("article topic7").unwrap();
    c.bench_function("search 10k", |b| b.iter(|| index.search("Blog::Article", black_box(&query)).unwrap()));
}

criterion_group!(benches, validation_benchmark, persistence_benchmark, search_benchmark);
criterion_main!(benches);
