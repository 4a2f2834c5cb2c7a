// Pairwise cache module
// Dense symmetric store of every trajectory pair's similarity result,
// indexed through a stable id-to-slot arena

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;

use crate::progress::ProgressBar;
use crate::similarity::{Metric, PairCalculation};
use crate::trajectory::TrajectoryTable;

/// Scalar field of a cached pair calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairAttribute {
    PValue,
    Statistic,
}

/// Symmetric matrix of pair calculations. Each unordered pair is computed
/// exactly once and queryable in either order; slots follow the sorted
/// trajectory id order of the source table.
pub struct PairwiseCache {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    values: Vec<PairCalculation>,
}

impl PairwiseCache {
    /// Compute all pairwise similarities for a trajectory table. Pairs fan
    /// out across the rayon pool; the collect below is the barrier that
    /// guarantees every pair has landed before clustering reads the cache.
    pub fn compute(
        table: &TrajectoryTable,
        metric: Metric,
        detection_cutoff: f64,
        fixed_cutoff: f64,
        show_progress: bool,
    ) -> PairwiseCache {
        let n = table.len();
        let ids: Vec<String> = table.ids().to_vec();
        let index: HashMap<String, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut pairs = Vec::with_capacity(n.saturating_mul(n.saturating_sub(1)) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                pairs.push((i, j));
            }
        }

        let done = AtomicUsize::new(0);
        let bar = Mutex::new(ProgressBar::new(pairs.len(), "Pairwise similarity"));
        let computed: Vec<((usize, usize), PairCalculation)> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let calc = metric.compare(
                    table.id_at(i),
                    table.id_at(j),
                    table.series_at(i),
                    table.series_at(j),
                    detection_cutoff,
                    fixed_cutoff,
                );
                if show_progress {
                    let count = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Ok(mut bar) = bar.lock() {
                        let _ = bar.update(count);
                    }
                }
                ((i, j), calc)
            })
            .collect();
        if show_progress {
            if let Ok(mut bar) = bar.lock() {
                let _ = bar.finish();
            }
        }

        // Self pairs sit on the diagonal with maximal similarity
        let mut values = vec![PairCalculation::identical(); n * n];
        for ((i, j), calc) in computed {
            values[i * n + j] = calc;
            values[j * n + i] = calc;
        }

        PairwiseCache { ids, index, values }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn id_at(&self, index: usize) -> &str {
        &self.ids[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Full calculation for a pair, in either order
    pub fn calculation(&self, left: &str, right: &str) -> Option<&PairCalculation> {
        let i = self.index_of(left)?;
        let j = self.index_of(right)?;
        Some(&self.values[i * self.ids.len() + j])
    }

    /// Requested scalar field for a pair, or `default` if the pair is unseen
    pub fn get(&self, left: &str, right: &str, attribute: PairAttribute, default: f64) -> f64 {
        match self.calculation(left, right) {
            Some(calc) => match attribute {
                PairAttribute::PValue => calc.pvalue,
                PairAttribute::Statistic => calc.x,
            },
            None => default,
        }
    }

    /// Calculation by arena slot, avoiding id lookups in hot loops
    pub fn calculation_at(&self, i: usize, j: usize) -> &PairCalculation {
        &self.values[i * self.ids.len() + j]
    }

    /// Drop every entry referencing an id outside `valid`, reusing the
    /// already-computed results for the surviving pairs.
    pub fn reduce(&self, valid: &HashSet<String>) -> PairwiseCache {
        let kept: Vec<usize> = (0..self.ids.len())
            .filter(|&i| valid.contains(&self.ids[i]))
            .collect();
        let n = kept.len();
        let mut ids = Vec::with_capacity(n);
        let mut index = HashMap::with_capacity(n);
        for &old in &kept {
            index.insert(self.ids[old].clone(), ids.len());
            ids.push(self.ids[old].clone());
        }
        let mut values = vec![PairCalculation::identical(); n * n];
        for (new_i, &old_i) in kept.iter().enumerate() {
            for (new_j, &old_j) in kept.iter().enumerate() {
                values[new_i * n + new_j] = self.values[old_i * self.ids.len() + old_j];
            }
        }
        PairwiseCache { ids, index, values }
    }

    /// Materialize the symmetric matrix of one attribute. Self pairs take
    /// the attribute's neutral value: zero distance for the statistic,
    /// p-value one for similarity.
    pub fn as_square_matrix(&self, attribute: PairAttribute) -> Vec<Vec<f64>> {
        let n = self.ids.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                matrix[i][j] = if i == j {
                    match attribute {
                        PairAttribute::Statistic => 0.0,
                        PairAttribute::PValue => 1.0,
                    }
                } else {
                    match attribute {
                        PairAttribute::Statistic => self.values[i * n + j].x,
                        PairAttribute::PValue => self.values[i * n + j].pvalue,
                    }
                };
            }
        }
        matrix
    }

    /// Condensed upper-triangle distance matrix (`1 - pvalue`) in the
    /// row-major order linkage expects. The p-value transform keeps the
    /// distance defined even where the statistic is NaN.
    pub fn condensed_distances(&self) -> Vec<f64> {
        let n = self.ids.len();
        let mut condensed = Vec::with_capacity(n.saturating_mul(n.saturating_sub(1)) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                condensed.push(1.0 - self.values[i * n + j].pvalue);
            }
        }
        condensed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cache() -> PairwiseCache {
        let table = TrajectoryTable::new(
            vec![
                ("a".to_string(), vec![0.0, 0.1, 0.5, 0.9]),
                ("b".to_string(), vec![0.0, 0.12, 0.48, 0.88]),
                ("c".to_string(), vec![0.6, 0.3, 0.1, 0.0]),
            ],
            vec![0.0, 1.0, 2.0, 3.0],
        )
        .unwrap();
        PairwiseCache::compute(&table, Metric::Binomial, 0.03, 0.97, false)
    }

    #[test]
    fn symmetric_lookup() {
        let cache = sample_cache();
        let ab = cache.get("a", "b", PairAttribute::PValue, -1.0);
        let ba = cache.get("b", "a", PairAttribute::PValue, -1.0);
        assert_eq!(ab, ba);
        assert!(ab > 0.0);
    }

    #[test]
    fn diagonal_is_identical() {
        let cache = sample_cache();
        assert_eq!(cache.get("a", "a", PairAttribute::PValue, -1.0), 1.0);
        assert_eq!(cache.get("a", "a", PairAttribute::Statistic, -1.0), 0.0);
    }

    #[test]
    fn unseen_pair_returns_default() {
        let cache = sample_cache();
        assert_eq!(cache.get("a", "zz", PairAttribute::PValue, -1.0), -1.0);
    }

    #[test]
    fn reduce_keeps_values_and_order() {
        let cache = sample_cache();
        let before = cache.get("a", "c", PairAttribute::PValue, -1.0);
        let valid: HashSet<String> = ["a".to_string(), "c".to_string()].into_iter().collect();
        let reduced = cache.reduce(&valid);
        assert_eq!(reduced.ids(), &["a".to_string(), "c".to_string()]);
        assert_eq!(reduced.get("a", "c", PairAttribute::PValue, -1.0), before);
        assert_eq!(reduced.get("a", "b", PairAttribute::PValue, -1.0), -1.0);
    }

    #[test]
    fn condensed_matrix_has_pair_count_entries() {
        let cache = sample_cache();
        let condensed = cache.condensed_distances();
        assert_eq!(condensed.len(), 3);
        for value in condensed {
            assert!((0.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn square_matrix_matches_lookup() {
        let cache = sample_cache();
        let matrix = cache.as_square_matrix(PairAttribute::PValue);
        let ab = cache.get("a", "b", PairAttribute::PValue, -1.0);
        assert_eq!(matrix[0][1], ab);
        assert_eq!(matrix[1][0], ab);
        assert_eq!(matrix[2][2], 1.0);
    }

    #[test]
    fn empty_table_yields_empty_cache() {
        let table = TrajectoryTable::new(vec![], vec![0.0, 1.0]).unwrap();
        let cache = PairwiseCache::compute(&table, Metric::Binomial, 0.03, 0.97, false);
        assert!(cache.is_empty());
        assert!(cache.condensed_distances().is_empty());
    }
}
