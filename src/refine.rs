// Genotype refinement module
// Splits genotypes whose members turn out not to be mutually similar,
// repeating full passes until the partition reaches a fixed point

use crate::error::AppError;
use crate::pairwise::{PairAttribute, PairwiseCache};

/// Split apart genotype members whose pairwise p-value falls below the
/// difference breakpoint. A split genotype can itself need re-splitting, so
/// passes repeat until the genotype count stops changing; exceeding
/// `max_passes` is a convergence failure.
pub fn unlink_unrelated_trajectories(
    genotypes: Vec<Vec<String>>,
    cache: &PairwiseCache,
    difference_breakpoint: f64,
    max_passes: usize,
) -> Result<Vec<Vec<String>>, AppError> {
    let mut genotypes = genotypes;
    for _ in 0..max_passes {
        let before = genotypes.len();
        let mut next = Vec::with_capacity(before);
        for genotype in genotypes {
            match split_genotype(&genotype, cache, difference_breakpoint) {
                Some((group_a, group_b)) => {
                    next.push(group_a);
                    next.push(group_b);
                }
                None => next.push(genotype),
            }
        }
        next.retain(|genotype| !genotype.is_empty());
        let stable = next.len() == before;
        genotypes = next;
        if stable {
            return Ok(genotypes);
        }
    }
    Err(AppError::NoConvergence {
        stage: "genotype unlinking",
        limit: max_passes,
    })
}

/// Split one genotype around its least-unrelated member pair, or None if
/// every member pair clears the difference breakpoint.
fn split_genotype(
    members: &[String],
    cache: &PairwiseCache,
    difference_breakpoint: f64,
) -> Option<(Vec<String>, Vec<String>)> {
    if members.len() < 2 {
        return None;
    }

    // The seed pair is the unrelated pair closest to the breakpoint from below
    let mut seed: Option<(usize, usize, f64)> = None;
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            let pvalue = cache.get(&members[i], &members[j], PairAttribute::PValue, 0.0);
            if pvalue < difference_breakpoint {
                let closer = match seed {
                    None => true,
                    Some((_, _, best)) => pvalue > best,
                };
                if closer {
                    seed = Some((i, j, pvalue));
                }
            }
        }
    }
    let (i, j, _) = seed?;

    // The lower-id member of the seed pair anchors group A
    let (seed_a, seed_b) = if members[i] <= members[j] { (i, j) } else { (j, i) };
    let mut group_a = vec![members[seed_a].clone()];
    let mut group_b = vec![members[seed_b].clone()];
    for (k, member) in members.iter().enumerate() {
        if k == seed_a || k == seed_b {
            continue;
        }
        let with_a = cache.get(member, &members[seed_a], PairAttribute::PValue, 0.0);
        let with_b = cache.get(member, &members[seed_b], PairAttribute::PValue, 0.0);
        if with_a >= with_b {
            group_a.push(member.clone());
        } else {
            group_b.push(member.clone());
        }
    }
    Some((group_a, group_b))
}
