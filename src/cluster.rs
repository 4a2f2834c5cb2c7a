// Genotype grouping module
// Partitions trajectories into genotype candidates from the pairwise cache,
// either by two-step agglomerative union or by hierarchical linkage

use std::collections::HashMap;

use kodama::{linkage, Dendrogram, Method};

use crate::error::AppError;
use crate::pairwise::PairwiseCache;

/// Grouping strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMethod {
    Matlab,
    Hierarchy,
}

impl ClusterMethod {
    /// Parse a method name given on the command line
    pub fn from_name(name: &str) -> Result<ClusterMethod, AppError> {
        match name.to_lowercase().as_str() {
            "matlab" | "twostep" => Ok(ClusterMethod::Matlab),
            "hierarchy" | "hierarchical" => Ok(ClusterMethod::Hierarchy),
            other => Err(AppError::UnknownMethod(other.to_string())),
        }
    }
}

/// Linkage used by the hierarchy strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Average,
    Complete,
}

impl Linkage {
    pub fn from_name(name: &str) -> Result<Linkage, AppError> {
        match name.to_lowercase().as_str() {
            "average" => Ok(Linkage::Average),
            "complete" => Ok(Linkage::Complete),
            other => Err(AppError::UnknownLinkage(other.to_string())),
        }
    }
}

/// Partition the cached trajectories into genotype candidate groups. Every
/// trajectory in the cache lands in exactly one group.
pub fn group_trajectories(
    method: ClusterMethod,
    link: Linkage,
    cache: &PairwiseCache,
    similarity_breakpoint: f64,
    starting_genotypes: &[Vec<String>],
) -> Vec<Vec<String>> {
    match method {
        ClusterMethod::Matlab => matlab_method(cache, similarity_breakpoint, starting_genotypes),
        ClusterMethod::Hierarchy => hierarchy_method(cache, similarity_breakpoint, link),
    }
}

/// Two-step agglomerative strategy: walk the pairs in arena order and union
/// the genotypes of any pair scoring above the similarity breakpoint.
fn matlab_method(
    cache: &PairwiseCache,
    similarity_breakpoint: f64,
    starting_genotypes: &[Vec<String>],
) -> Vec<Vec<String>> {
    let mut genotypes: Vec<Vec<String>> = Vec::new();
    let mut membership: HashMap<String, usize> = HashMap::new();

    // Seed the running partition with the caller's known genotypes, or with
    // the first trajectory as its own singleton
    for seed in starting_genotypes {
        let slot = genotypes.len();
        let mut members = Vec::new();
        for id in seed {
            if cache.index_of(id).is_some() && !membership.contains_key(id) {
                membership.insert(id.clone(), slot);
                members.push(id.clone());
            }
        }
        if !members.is_empty() {
            genotypes.push(members);
        }
    }
    if genotypes.is_empty() && !cache.is_empty() {
        membership.insert(cache.id_at(0).to_string(), 0);
        genotypes.push(vec![cache.id_at(0).to_string()]);
    }

    let n = cache.len();
    for i in 0..n {
        for j in (i + 1)..n {
            if cache.calculation_at(i, j).pvalue <= similarity_breakpoint {
                continue;
            }
            let left = cache.id_at(i);
            let right = cache.id_at(j);
            match (membership.get(left).copied(), membership.get(right).copied()) {
                (None, None) => {
                    let slot = genotypes.len();
                    membership.insert(left.to_string(), slot);
                    membership.insert(right.to_string(), slot);
                    genotypes.push(vec![left.to_string(), right.to_string()]);
                }
                (Some(slot), None) => {
                    membership.insert(right.to_string(), slot);
                    genotypes[slot].push(right.to_string());
                }
                (None, Some(slot)) => {
                    membership.insert(left.to_string(), slot);
                    genotypes[slot].push(left.to_string());
                }
                (Some(a), Some(b)) if a != b => {
                    // Merge the later genotype into the earlier one
                    let (target, source) = if a < b { (a, b) } else { (b, a) };
                    let moved = std::mem::take(&mut genotypes[source]);
                    for id in &moved {
                        membership.insert(id.clone(), target);
                    }
                    genotypes[target].extend(moved);
                }
                _ => {}
            }
        }
    }

    // Trajectories never related to anything become their own genotypes
    for id in cache.ids() {
        if !membership.contains_key(id) {
            genotypes.push(vec![id.clone()]);
        }
    }

    genotypes.into_iter().filter(|g| !g.is_empty()).collect()
}

/// Hierarchical strategy: agglomerate over the condensed distance matrix and
/// cut the dendrogram where merge heights become inconsistent with their own
/// subtree's height distribution.
fn hierarchy_method(
    cache: &PairwiseCache,
    similarity_breakpoint: f64,
    link: Linkage,
) -> Vec<Vec<String>> {
    let n = cache.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![vec![cache.id_at(0).to_string()]];
    }

    let mut condensed = cache.condensed_distances();
    let method = match link {
        Linkage::Average => Method::Average,
        Linkage::Complete => Method::Complete,
    };
    let dendrogram = linkage(&mut condensed, n, method);
    let assignment = cut_inconsistent(&dendrogram, n, similarity_breakpoint);

    // Group leaves by flat cluster, ordered by smallest member slot
    let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
    for (leaf, &cluster) in assignment.iter().enumerate() {
        clusters.entry(cluster).or_default().push(leaf);
    }
    let mut groups: Vec<Vec<usize>> = clusters.into_values().collect();
    for group in &mut groups {
        group.sort_unstable();
    }
    groups.sort_by_key(|group| group[0]);

    groups
        .into_iter()
        .map(|group| group.into_iter().map(|i| cache.id_at(i).to_string()).collect())
        .collect()
}

/// Inconsistency coefficient per merge step, using the step's own height and
/// its direct child steps' heights (depth-2 statistics).
fn inconsistency_coefficients(dendrogram: &Dendrogram<f64>, n: usize) -> Vec<f64> {
    let steps = dendrogram.steps();
    let mut coefficients = Vec::with_capacity(steps.len());
    for step in steps {
        let mut heights = vec![step.dissimilarity];
        for child in [step.cluster1, step.cluster2] {
            if child >= n {
                heights.push(steps[child - n].dissimilarity);
            }
        }
        let count = heights.len() as f64;
        let mean = heights.iter().sum::<f64>() / count;
        let coefficient = if heights.len() > 1 {
            let variance = heights.iter().map(|h| (h - mean).powi(2)).sum::<f64>()
                / (count - 1.0);
            let std = variance.sqrt();
            if std > 0.0 {
                (step.dissimilarity - mean) / std
            } else {
                0.0
            }
        } else {
            0.0
        };
        coefficients.push(coefficient);
    }
    coefficients
}

/// Flat clusters from the dendrogram: a subtree whose merges are all
/// consistent (coefficient at or below the cutoff) collapses into one
/// cluster, anything above it keeps splitting.
fn cut_inconsistent(dendrogram: &Dendrogram<f64>, n: usize, cutoff: f64) -> Vec<usize> {
    let steps = dendrogram.steps();
    let coefficients = inconsistency_coefficients(dendrogram, n);

    // Child steps always precede their parent, so one forward pass suffices
    let mut subtree_max = vec![0.0f64; steps.len()];
    for (k, step) in steps.iter().enumerate() {
        let mut max = coefficients[k];
        for child in [step.cluster1, step.cluster2] {
            if child >= n {
                max = max.max(subtree_max[child - n]);
            }
        }
        subtree_max[k] = max;
    }

    let mut assignment = vec![0usize; n];
    let mut next_cluster = 0usize;
    let root = n + steps.len() - 1;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node < n {
            assignment[node] = next_cluster;
            next_cluster += 1;
        } else {
            let k = node - n;
            if subtree_max[k] <= cutoff {
                assign_leaves(node, steps, n, next_cluster, &mut assignment);
                next_cluster += 1;
            } else {
                stack.push(steps[k].cluster1);
                stack.push(steps[k].cluster2);
            }
        }
    }
    assignment
}

/// Assign every leaf under `node` to `cluster`
fn assign_leaves(
    node: usize,
    steps: &[kodama::Step<f64>],
    n: usize,
    cluster: usize,
    assignment: &mut [usize],
) {
    let mut stack = vec![node];
    while let Some(node) = stack.pop() {
        if node < n {
            assignment[node] = cluster;
        } else {
            stack.push(steps[node - n].cluster1);
            stack.push(steps[node - n].cluster2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::Metric;
    use crate::trajectory::TrajectoryTable;

    fn cache_for(entries: Vec<(&str, Vec<f64>)>, timepoints: Vec<f64>) -> PairwiseCache {
        let table = TrajectoryTable::new(
            entries
                .into_iter()
                .map(|(id, series)| (id.to_string(), series))
                .collect(),
            timepoints,
        )
        .unwrap();
        PairwiseCache::compute(&table, Metric::Binomial, 0.03, 0.97, false)
    }

    fn sweep_and_transient() -> PairwiseCache {
        cache_for(
            vec![
                ("trj-1", vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
                ("trj-2", vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
                ("trj-3", vec![0.0, 0.5, 0.5, 0.0, 0.0, 0.0]),
            ],
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        )
    }

    fn assert_partition(groups: &[Vec<String>], cache: &PairwiseCache) {
        let mut seen: Vec<&String> = groups.iter().flatten().collect();
        seen.sort_unstable();
        let mut expected: Vec<&String> = cache.ids().iter().collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn matlab_groups_identical_sweeps_apart_from_transient() {
        let cache = sweep_and_transient();
        let groups = group_trajectories(ClusterMethod::Matlab, Linkage::Average, &cache, 0.05, &[]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec!["trj-1".to_string(), "trj-2".to_string()]);
        assert_eq!(groups[1], vec!["trj-3".to_string()]);
        assert_partition(&groups, &cache);
    }

    #[test]
    fn hierarchy_groups_identical_sweeps_apart_from_transient() {
        let cache = sweep_and_transient();
        let groups =
            group_trajectories(ClusterMethod::Hierarchy, Linkage::Average, &cache, 0.05, &[]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec!["trj-1".to_string(), "trj-2".to_string()]);
        assert_eq!(groups[1], vec!["trj-3".to_string()]);
        assert_partition(&groups, &cache);
    }

    #[test]
    fn matlab_respects_starting_genotypes() {
        let cache = sweep_and_transient();
        let seeds = vec![vec!["trj-3".to_string()], vec!["trj-1".to_string()]];
        let groups =
            group_trajectories(ClusterMethod::Matlab, Linkage::Average, &cache, 0.05, &seeds);
        assert_eq!(groups[0], vec!["trj-3".to_string()]);
        assert!(groups[1].contains(&"trj-1".to_string()));
        assert!(groups[1].contains(&"trj-2".to_string()));
        assert_partition(&groups, &cache);
    }

    #[test]
    fn unrelated_trajectories_become_singletons() {
        let cache = cache_for(
            vec![
                ("trj-1", vec![0.0, 0.9, 0.9, 0.0]),
                ("trj-2", vec![0.9, 0.0, 0.0, 0.9]),
            ],
            vec![0.0, 1.0, 2.0, 3.0],
        );
        let groups = group_trajectories(ClusterMethod::Matlab, Linkage::Average, &cache, 0.05, &[]);
        assert_eq!(groups.len(), 2);
        assert_partition(&groups, &cache);
    }

    #[test]
    fn empty_cache_yields_no_groups() {
        let cache = cache_for(vec![], vec![0.0, 1.0]);
        for method in [ClusterMethod::Matlab, ClusterMethod::Hierarchy] {
            let groups = group_trajectories(method, Linkage::Average, &cache, 0.05, &[]);
            assert!(groups.is_empty());
        }
    }

    #[test]
    fn single_trajectory_is_one_singleton() {
        let cache = cache_for(vec![("trj-1", vec![0.0, 0.5, 1.0])], vec![0.0, 1.0, 2.0]);
        for method in [ClusterMethod::Matlab, ClusterMethod::Hierarchy] {
            let groups = group_trajectories(method, Linkage::Average, &cache, 0.05, &[]);
            assert_eq!(groups, vec![vec!["trj-1".to_string()]]);
        }
    }

    #[test]
    fn method_names_parse() {
        assert!(ClusterMethod::from_name("matlab").is_ok());
        assert!(ClusterMethod::from_name("Hierarchy").is_ok());
        assert!(matches!(
            ClusterMethod::from_name("kmeans"),
            Err(AppError::UnknownMethod(_))
        ));
        assert!(matches!(
            Linkage::from_name("ward"),
            Err(AppError::UnknownLinkage(_))
        ));
    }
}
