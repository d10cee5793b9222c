use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::Array1;
use rand::prelude::SeedableRng;
use rand_pcg::Pcg64Mcg;
use zipmat::{gen_rand, CompressedMatrix};

fn criterion_benchmark(c: &mut Criterion) {
    let rng = &mut Pcg64Mcg::seed_from_u64(42);

    let rows = 100_000;
    let cols = 10;
    let card = 16;

    let blk = gen_rand::random_low_card_mat(rng, rows, cols, card);

    c.bench_function("compress 100k", {
        let blk = blk.clone();
        move |b| {
            b.iter(|| {
                let mut cm = CompressedMatrix::from_block(blk.clone());
                cm.compress(1).unwrap();
                cm
            })
        }
    });

    let mut cm = CompressedMatrix::from_block(blk);
    cm.compress(1).unwrap();
    let v = Array1::from(vec![1.0; cols]);

    c.bench_function("right-mv 100k", {
        let cm = cm.clone();
        let v = v.clone();
        move |b| b.iter(|| cm.right_mult_by_vector(&v, 1).unwrap())
    });

    c.bench_function("right-mv 100k par", move |b| {
        b.iter(|| cm.right_mult_by_vector(&v, 4).unwrap())
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = criterion_benchmark,
}

criterion_main!(benches);
