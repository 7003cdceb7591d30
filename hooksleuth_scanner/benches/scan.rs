use criterion::{criterion_group, criterion_main, Criterion};
use hooksleuth_scanner::*;

fn planted(c: &mut Criterion) {
    use rand::prelude::*;
    let size = 64 * 1024 * 1024;
    let mut data: Vec<u8> = Vec::with_capacity(size);
    let mut rng = rand::thread_rng();

    let needle = b"\xf9\x82\xdb\xdb\x2d\x32\x6f\x15\x11\x44\x54\xf4\xc8\xaa\xd1\x72";

    data.extend((0..size - needle.len()).map(|_| rng.gen::<u8>()));
    data.extend(needle);

    let pattern =
        Pattern::parse("f9 82 db db 2d ?? 6f 15 ?? 44 54 f4 c8 aa d1 72").unwrap();

    let result = scan(&[&pattern], 0, &data);
    assert_eq!(result, [vec![size - needle.len()]]);
    assert_eq!(find_first(&pattern, 0, &data), Some(size - needle.len()));

    c.bench_function("planted scan", |b| b.iter(|| scan(&[&pattern], 0, &data)));
    c.bench_function("planted find_first", |b| {
        b.iter(|| find_first(&pattern, 0, &data))
    });
}

fn many(c: &mut Criterion) {
    use rand::prelude::*;
    let size = 16 * 1024 * 1024;
    let mut rng = rand::thread_rng();
    let data: Vec<u8> = (0..size).map(|_| rng.gen::<u8>()).collect();

    let patterns = [
        "E8 ?? ?? ?? ?? 48 8B C8",
        "48 89 5C 24 ?? 57 48 83 EC 20",
        "40 53 48 83 EC ?? 8B D9",
        "?? 8B 0D ?? ?? ?? ?? E8",
        "0F B6 44 24 ?? 84 C0",
        "4C 8D 05 ?? ?? ?? ?? BA",
    ]
    .map(|s| Pattern::parse(s).unwrap());
    let refs: Vec<_> = patterns.iter().collect();

    c.bench_function("many scan", |b| b.iter(|| scan(&refs, 0, &data)));
}

criterion_group! {
    name = bench1;
    config = Criterion::default().sample_size(30);
    targets = planted
}
criterion_group!(bench2, many);

criterion_main!(bench1, bench2);
