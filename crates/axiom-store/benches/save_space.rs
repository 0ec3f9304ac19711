//! Full-rewrite save and rebuild-on-load cost.
//!
//! Run with: cargo bench -p axiom-store

use axiom_core::{Coordinates, CoreConfig, Layer, TokenAttrs, TokenSpace, Vec3};
use axiom_store::TokenDb;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn populate(count: usize) -> TokenSpace {
    let space = TokenSpace::new(CoreConfig::default()).unwrap();
    for i in 0..count {
        let f = i as f32;
        let coords = Coordinates::new()
            .with(Layer::Physical, Vec3::new(f % 97.0, f % 89.0, f % 83.0))
            .with(Layer::Cognitive, Vec3::new(f * 0.01, 0.0, 1.0));
        space
            .create(&TokenAttrs::new((i % 16) as u8, (i % 7) as u8), coords)
            .unwrap();
    }
    space
}

fn bench_persistence(c: &mut Criterion) {
    let mut group = c.benchmark_group("persistence");
    group.sample_size(10);

    for count in [1_000, 10_000] {
        let space = populate(count);
        group.bench_with_input(BenchmarkId::new("save_space", count), &space, |b, space| {
            let db = TokenDb::open_in_memory().unwrap();
            b.iter(|| db.save_space(space).unwrap());
        });

        let db = TokenDb::open_in_memory().unwrap();
        db.save_space(&space).unwrap();
        group.bench_with_input(BenchmarkId::new("load_space", count), &db, |b, db| {
            b.iter(|| db.load_space(CoreConfig::default()).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_persistence);
criterion_main!(benches);
