//! Co-coding planner: which compressible columns get encoded together
//!
//! Columns that share value patterns compress better jointly, because one
//! offset stream covers all of them. The planner first bins columns so a
//! bin's cardinality product stays manageable, then greedily merges column
//! sets inside each bin while the estimator predicts the joint encoding to
//! beat the separate ones.

use crate::estim::{uncompressed_size, SizeEstimator};
use itertools::Itertools;
use rayon::prelude::*;

/// Ceiling on the product of estimated tuple cardinalities within a bin.
pub(crate) const MAX_GROUP_CARD: f64 = 1e7;

#[derive(Debug, Clone)]
struct Candidate {
    cols: Vec<usize>,
    size: u64,
}

/// Partition `cols` into co-coding groups. `cards` and `sizes` are the
/// per-column estimates from the classification phase, parallel to `cols`.
pub(crate) fn plan_cocoding(
    estim: &SizeEstimator<'_>,
    cols: &[usize],
    cards: &[usize],
    sizes: &[u64],
    num_rows: usize,
    sparsity: f64,
    pool: Option<&rayon::ThreadPool>,
) -> Vec<Vec<usize>> {
    if cols.is_empty() {
        return Vec::new();
    }

    // bin by ascending cardinality, capping the cardinality product
    let order: Vec<usize> = (0..cols.len()).sorted_by_key(|&i| (cards[i], cols[i])).collect();
    let log_cap = MAX_GROUP_CARD.ln();
    let mut bins: Vec<Vec<usize>> = Vec::new();
    let mut bin: Vec<usize> = Vec::new();
    let mut log_prod = 0.0;
    for &i in &order {
        let l = (cards[i].max(2) as f64).ln();
        if !bin.is_empty() && log_prod + l > log_cap {
            bins.push(std::mem::take(&mut bin));
            log_prod = 0.0;
        }
        bin.push(i);
        log_prod += l;
    }
    if !bin.is_empty() {
        bins.push(bin);
    }

    let merge_bin = |bin: &Vec<usize>| -> Vec<Vec<usize>> {
        let mut groups: Vec<Candidate> = bin
            .iter()
            .map(|&i| Candidate {
                cols: vec![cols[i]],
                size: sizes[i],
            })
            .collect();

        // greedy pairwise merging while the joint size beats the parts;
        // pairs survive across rounds, so joint estimates are memoized
        let mut cache: std::collections::HashMap<Vec<usize>, u64> = std::collections::HashMap::new();
        loop {
            let mut best: Option<(usize, usize, Candidate, i64, f64)> = None;
            for a in 0..groups.len() {
                for b in a + 1..groups.len() {
                    let mut cand: Vec<usize> =
                        groups[a].cols.iter().chain(&groups[b].cols).copied().collect();
                    cand.sort_unstable();
                    let joint_size = *cache
                        .entry(cand.clone())
                        .or_insert_with(|| estim.estimate(&cand).min_size());
                    let saving = (groups[a].size + groups[b].size) as i64 - joint_size as i64;
                    if saving <= 0 {
                        continue;
                    }
                    let ratio =
                        uncompressed_size(num_rows, cand.len(), sparsity) / joint_size as f64;
                    let better = match &best {
                        None => true,
                        Some((.., s, r)) => saving > *s || (saving == *s && ratio > *r),
                    };
                    if better {
                        let merged = Candidate {
                            cols: cand,
                            size: joint_size,
                        };
                        best = Some((a, b, merged, saving, ratio));
                    }
                }
            }
            match best {
                Some((a, b, merged, _, _)) => {
                    groups.remove(b);
                    groups[a] = merged;
                }
                None => break,
            }
        }

        groups.into_iter().map(|g| g.cols).collect()
    };

    let mut out: Vec<Vec<usize>> = match pool {
        Some(p) if bins.len() > 1 => {
            p.install(|| bins.par_iter().flat_map_iter(merge_bin).collect())
        }
        _ => bins.iter().flat_map(merge_bin).collect(),
    };
    out.sort_by_key(|g| g[0]);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::MatrixBlock;
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    #[test]
    fn correlated_columns_merge() {
        // columns 0 and 1 are identical; column 2 is independent
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let mut arr = Array2::zeros((4000, 3));
        for r in 0..4000 {
            let v = rng.gen_range(1..4) as f64;
            arr[(r, 0)] = v;
            arr[(r, 1)] = v;
            arr[(r, 2)] = rng.gen_range(1..4) as f64;
        }
        let t = MatrixBlock::from_dense(arr.view()).transpose();
        let estim = SizeEstimator::new(&t, 4000);

        let infos: Vec<_> = (0..3).map(|c| estim.estimate(&[c])).collect();
        let cards: Vec<usize> = infos.iter().map(|i| i.est_cardinality).collect();
        let sizes: Vec<u64> = infos.iter().map(|i| i.min_size()).collect();

        let plan = plan_cocoding(&estim, &[0, 1, 2], &cards, &sizes, 4000, 1.0, None);
        let joint = plan.iter().find(|g| g.contains(&0)).unwrap();
        assert!(joint.contains(&1), "identical columns should co-code: {plan:?}");
    }

    #[test]
    fn empty_input() {
        let arr = Array2::zeros((10, 1));
        let t = MatrixBlock::from_dense(arr.view()).transpose();
        let estim = SizeEstimator::new(&t, 10);
        assert!(plan_cocoding(&estim, &[], &[], &[], 10, 1.0, None).is_empty());
    }
}
