use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;
use uvars::daemon::protocol::{decode, escape, Message};
use uvars::store::{parse, serialize, Variable};

fn sample_values() -> Vec<(&'static str, String)> {
    vec![
        ("ascii", "plain_ascii_value".to_string()),
        ("spaces", "a value with several spaces and: colons".to_string()),
        ("unicode", "héllo wörld ☃ 🐟".repeat(4)),
        ("path", "/usr/local/bin /usr/bin /bin /usr/sbin /sbin".to_string()),
    ]
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for (label, value) in sample_values() {
        group.bench_with_input(BenchmarkId::new("set", label), &value, |b, value| {
            b.iter(|| Message::set(black_box("fish_user_paths"), black_box(value), false))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (label, value) in sample_values() {
        let line = format!("SET_EXPORT var:{}", escape(&value));
        group.bench_with_input(BenchmarkId::new("set", label), &line, |b, line| {
            b.iter(|| decode(black_box(line)))
        });
    }
    group.finish();
}

fn bench_file(c: &mut Criterion) {
    let vars: BTreeMap<String, Variable> = (0..500)
        .map(|i| {
            (
                format!("var_{}", i),
                Variable {
                    value: format!("value number {} with some text", i),
                    exported: i % 3 == 0,
                },
            )
        })
        .collect();
    let contents = serialize(&vars);

    c.bench_function("file/serialize_500", |b| b.iter(|| serialize(black_box(&vars))));
    c.bench_function("file/parse_500", |b| b.iter(|| parse(black_box(&contents))));
}

criterion_group!(benches, bench_encode, bench_decode, bench_file);
criterion_main!(benches);
