//! Methods for generating random matrix blocks. Useful for testing and
//! benchmarking

use crate::block::MatrixBlock;
use ndarray::Array2;
use num_traits::{One, Zero};
use rand::distributions::uniform::SampleUniform;
use rand::prelude::Rng;

/// Generate a vector of random numbers of length `size`, with values in
/// the range `[1, bound)`.
pub fn gen_vec_bounded<R: Rng + ?Sized, T: Zero + One + SampleUniform + Copy + PartialOrd>(
    rng: &mut R,
    size: usize,
    bound: T,
) -> Vec<T> {
    std::iter::repeat(())
        .map(|_| rng.gen_range(T::zero() + T::one()..bound))
        .take(size)
        .collect()
}

/// Generate a dense block whose cells are drawn uniformly from
/// `{0, 1, ..., card - 1}`. Zeros stay implicit after compression, so low
/// `card` values exercise the implicit-zero paths.
pub fn random_low_card_mat(rng: &mut impl Rng, rows: usize, cols: usize, card: u32) -> MatrixBlock {
    let arr = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(0..card) as f64);
    MatrixBlock::from_dense(arr.view())
}

/// Generate a dense block with continuous values uniform in `[0, 1)`.
pub fn random_uniform_mat(rng: &mut impl Rng, rows: usize, cols: usize) -> MatrixBlock {
    let arr = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(0.0..1.0f64));
    MatrixBlock::from_dense(arr.view())
}

/// Generate a sparse block with approximately `density * rows * cols`
/// non-zero cells drawn from `{1, ..., card - 1}`.
pub fn random_sparse_mat(
    rng: &mut impl Rng,
    rows: usize,
    cols: usize,
    density: f64,
    card: u32,
) -> MatrixBlock {
    let mut blk = MatrixBlock::new_sparse(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            if rng.gen_bool(density) {
                blk.set(r, c, rng.gen_range(1..card.max(2)) as f64);
            }
        }
    }
    blk.recompute_nonzeros();
    blk
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    #[test]
    fn generators_respect_bounds() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);

        let v = gen_vec_bounded(&mut rng, 100, 10u32);
        assert!(v.iter().all(|&x| (1..10).contains(&x)));

        let m = random_low_card_mat(&mut rng, 50, 3, 4);
        let d = m.to_dense();
        assert!(d.iter().all(|&x| (0.0..4.0).contains(&x) && x.fract() == 0.0));

        let s = random_sparse_mat(&mut rng, 40, 4, 0.2, 5);
        assert!(s.is_sparse());
        assert!(s.nnz() > 0 && s.nnz() < 40 * 4);
    }
}
