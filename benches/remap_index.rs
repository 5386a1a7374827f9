use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dm_remap_core::remap_index::{RemapEntry, RemapIndex};

const UNIT_SECTORS: u64 = 8;

fn entry(unit: u64) -> RemapEntry {
    let main = unit * UNIT_SECTORS;
    RemapEntry {
        main_sector: main,
        spare_sector: main,
        length_sectors: UNIT_SECTORS as u32,
        created_ns: 0,
        error_count: 0,
        flags: 0,
    }
}

fn bench_lookup(c: &mut Criterion) {
    let index = RemapIndex::new(UNIT_SECTORS);
    for i in 0..100_000u64 {
        index.insert(entry(i));
    }
    c.bench_function("remap_index lookup hit", |b| {
        b.iter(|| index.lookup(black_box(54321 * UNIT_SECTORS)))
    });
    c.bench_function("remap_index lookup miss", |b| {
        b.iter(|| index.lookup(black_box(999_999_999 * UNIT_SECTORS)))
    });
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("remap_index insert into 10k table", |b| {
        b.iter_batched(
            || {
                let index = RemapIndex::new(UNIT_SECTORS);
                for i in 0..10_000u64 {
                    index.insert(entry(i));
                }
                index
            },
            |index| {
                index.insert(entry(10_001));
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_lookup, bench_insert);
criterion_main!(benches);
