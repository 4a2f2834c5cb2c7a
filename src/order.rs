// Ancestry ordering module
// Greedy single-pass construction of the genotype parent tree: genotypes are
// visited from most dominant to least, and each one picks the best-supported
// already-placed genotype as its parent

use std::fs::File;
use std::io::{BufWriter, Write};

use clap::Args;

use crate::error::AppError;
use crate::genotype::{Genotype, GenotypeTable, ROOT_GENOTYPE};

/// Thresholds for the parent relationship tests
#[derive(Debug, Clone)]
pub struct AncestryOptions {
    pub detection_cutoff: f64,
    pub significant_cutoff: f64,
    pub fixed_cutoff: f64,
    pub additive_single_cutoff: f64,
    pub additive_double_cutoff: f64,
    pub subtractive_single_cutoff: f64,
    pub subtractive_double_cutoff: f64,
    pub derivative_cutoff: f64,
}

impl Default for AncestryOptions {
    fn default() -> Self {
        Self {
            detection_cutoff: 0.03,
            significant_cutoff: 0.15,
            fixed_cutoff: 0.97,
            additive_single_cutoff: 0.03,
            additive_double_cutoff: 0.06,
            subtractive_single_cutoff: 0.15,
            subtractive_double_cutoff: 0.03,
            derivative_cutoff: 0.01,
        }
    }
}

/// One parent-child edge of the lineage tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestryEdge {
    pub parent: String,
    pub identity: String,
}

/// Which relationship test supported a candidate; additive evidence is
/// direct nesting evidence and always outranks subtractive evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Support {
    Additive,
    Subtractive,
}

/// Assign every genotype a parent. Genotypes are processed by first-fixed
/// timepoint, then first-significant timepoint, then peak frequency, so a
/// genotype can only attach to one placed before it; anything unsupported
/// attaches to the root sentinel. The resulting edge set is a tree rooted at
/// `genotype-0` by construction.
pub fn order_genotypes(table: &GenotypeTable, options: &AncestryOptions) -> Vec<AncestryEdge> {
    let mut order: Vec<usize> = (0..table.genotypes.len()).collect();
    order.sort_by(|&a, &b| {
        let left = &table.genotypes[a];
        let right = &table.genotypes[b];
        let left_fixed = left.first_above(options.fixed_cutoff).unwrap_or(usize::MAX);
        let right_fixed = right.first_above(options.fixed_cutoff).unwrap_or(usize::MAX);
        let left_significant = left
            .first_above(options.significant_cutoff)
            .unwrap_or(usize::MAX);
        let right_significant = right
            .first_above(options.significant_cutoff)
            .unwrap_or(usize::MAX);
        left_fixed
            .cmp(&right_fixed)
            .then(left_significant.cmp(&right_significant))
            .then(right.peak().total_cmp(&left.peak()))
            .then(left.name.cmp(&right.name))
    });

    let mut accepted: Vec<usize> = Vec::new();
    let mut edges = Vec::with_capacity(order.len());
    for &index in &order {
        let genotype = &table.genotypes[index];
        let mut best: Option<(Support, f64, usize)> = None;
        // Most recently accepted first, so strict comparisons resolve ties
        // in favor of the most recent candidate
        for &candidate in accepted.iter().rev() {
            let parent = &table.genotypes[candidate];
            if let Some(margin) = additive_check(parent, genotype, options) {
                let better = match best {
                    None => true,
                    Some((Support::Subtractive, _, _)) => true,
                    Some((Support::Additive, held, _)) => margin < held,
                };
                if better {
                    best = Some((Support::Additive, margin, candidate));
                }
            } else if let Some(margin) = subtractive_check(parent, genotype, options) {
                let better = match best {
                    None => true,
                    Some((Support::Additive, _, _)) => false,
                    Some((Support::Subtractive, held, _)) => margin < held,
                };
                if better {
                    best = Some((Support::Subtractive, margin, candidate));
                }
            }
        }
        let parent = match best {
            Some((_, _, candidate)) => table.genotypes[candidate].name.clone(),
            None => ROOT_GENOTYPE.to_string(),
        };
        edges.push(AncestryEdge {
            parent,
            identity: genotype.name.clone(),
        });
        accepted.push(index);
    }
    edges
}

/// Additive test: over the timepoints where both genotypes are detected, the
/// two frequencies must sum to one within a tight band, the signature of a
/// subclone expanding inside its parent background. Returns the mean
/// deviation from one as the margin, smaller being tighter support.
fn additive_check(parent: &Genotype, child: &Genotype, options: &AncestryOptions) -> Option<f64> {
    let mut deviations = Vec::new();
    for (&p, &c) in parent.frequencies.iter().zip(&child.frequencies) {
        if p > options.detection_cutoff && c > options.detection_cutoff {
            deviations.push((p + c - 1.0).abs());
        }
    }
    if deviations.is_empty() {
        return None;
    }
    let mean = deviations.iter().sum::<f64>() / deviations.len() as f64;
    let max = deviations.iter().fold(0.0f64, |m, &d| m.max(d));
    (mean <= options.additive_single_cutoff && max <= options.additive_double_cutoff)
        .then_some(mean)
}

/// Subtractive test: the candidate once led the child clearly, the child
/// rose while the candidate fell, and their frequency derivatives are
/// anti-correlated beyond the noise floor. Returns the mean derivative
/// product as the margin, more negative being tighter support.
fn subtractive_check(
    parent: &Genotype,
    child: &Genotype,
    options: &AncestryOptions,
) -> Option<f64> {
    let window: Vec<usize> = (0..parent.frequencies.len())
        .filter(|&t| {
            parent.frequencies[t] > options.detection_cutoff
                || child.frequencies[t] > options.detection_cutoff
        })
        .collect();
    if window.len() < 2 {
        return None;
    }

    // The candidate must have led the child decisively at least once, or
    // moderately at two timepoints
    let mut single = 0usize;
    let mut double = 0usize;
    for &t in &window {
        let lead = parent.frequencies[t] - child.frequencies[t];
        if lead > options.subtractive_single_cutoff {
            single += 1;
        }
        if lead > options.subtractive_double_cutoff {
            double += 1;
        }
    }
    if single < 1 && double < 2 {
        return None;
    }

    // Replacement runs one way: the child gains over the window while the
    // candidate loses
    let first = window[0];
    let last = window[window.len() - 1];
    let child_net = child.frequencies[last] - child.frequencies[first];
    let parent_net = parent.frequencies[last] - parent.frequencies[first];
    if child_net <= 0.0 || parent_net >= 0.0 {
        return None;
    }

    let mut product_sum = 0.0;
    let mut products = 0usize;
    for pair in window.windows(2) {
        let parent_delta = parent.frequencies[pair[1]] - parent.frequencies[pair[0]];
        let child_delta = child.frequencies[pair[1]] - child.frequencies[pair[0]];
        product_sum += parent_delta * child_delta;
        products += 1;
    }
    let mean_product = product_sum / products as f64;
    (mean_product <= -options.derivative_cutoff).then_some(mean_product)
}

/// Command-line arguments for ancestry ordering of an existing genotype table
#[derive(Args, Debug)]
pub struct OrderArgs {
    /// Input genotype mean-frequency CSV
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output edges CSV
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Minimum frequency considered a real observation
    #[arg(long = "detection", default_value_t = 0.03)]
    pub detection_breakpoint: f64,
    /// Frequency at which a genotype counts as significant
    #[arg(long = "significant", default_value_t = 0.15)]
    pub significant_breakpoint: f64,
    /// Frequency at which a genotype counts as fixed
    #[arg(long = "fixed", default_value_t = 0.97)]
    pub fixed_breakpoint: f64,
    /// Mean deviation allowed by the additive parent test
    #[arg(long = "additive-single", default_value_t = 0.03)]
    pub additive_single_cutoff: f64,
    /// Worst-point deviation allowed by the additive parent test
    #[arg(long = "additive-double", default_value_t = 0.06)]
    pub additive_double_cutoff: f64,
    /// Lead required once for the subtractive parent test
    #[arg(long = "subtractive-single", default_value_t = 0.15)]
    pub subtractive_single_cutoff: f64,
    /// Lead required twice for the subtractive parent test
    #[arg(long = "subtractive-double", default_value_t = 0.03)]
    pub subtractive_double_cutoff: f64,
    /// Anti-correlation floor for the derivative check
    #[arg(long = "derivative", default_value_t = 0.01)]
    pub derivative_cutoff: f64,
}

impl OrderArgs {
    pub fn ancestry_options(&self) -> AncestryOptions {
        AncestryOptions {
            detection_cutoff: self.detection_breakpoint,
            significant_cutoff: self.significant_breakpoint,
            fixed_cutoff: self.fixed_breakpoint,
            additive_single_cutoff: self.additive_single_cutoff,
            additive_double_cutoff: self.additive_double_cutoff,
            subtractive_single_cutoff: self.subtractive_single_cutoff,
            subtractive_double_cutoff: self.subtractive_double_cutoff,
            derivative_cutoff: self.derivative_cutoff,
        }
    }
}

/// Validate order command arguments
pub fn validate_order_args(args: &OrderArgs) -> Result<(), AppError> {
    if args.input.trim().is_empty() {
        return Err(AppError::InvalidArgument(
            "input file path cannot be empty".to_string(),
        ));
    }
    if !std::path::Path::new(&args.input).exists() {
        return Err(AppError::InvalidArgument(format!(
            "input file does not exist: {}",
            args.input
        )));
    }
    Ok(())
}

/// Run the order subcommand: read a genotype table, write its edges table
pub fn order_main(args: &OrderArgs) -> Result<(), AppError> {
    let table = GenotypeTable::from_csv(&args.input)?;
    let edges = order_genotypes(&table, &args.ancestry_options());
    write_edges(&args.output, &edges)?;
    println!(
        "Ordered {} genotypes into {} edges -> {}",
        table.len(),
        edges.len(),
        args.output
    );
    Ok(())
}

/// Write the Parent,Identity edges table
pub fn write_edges(path: &str, edges: &[AncestryEdge]) -> Result<(), AppError> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "Parent,Identity")?;
    for edge in edges {
        writeln!(out, "{},{}", edge.parent, edge.identity)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genotype(name: &str, frequencies: Vec<f64>) -> Genotype {
        Genotype {
            name: name.to_string(),
            members: vec![],
            frequencies,
        }
    }

    fn table_of(genotypes: Vec<Genotype>) -> GenotypeTable {
        let timepoints = (0..genotypes[0].frequencies.len()).map(|t| t as f64).collect();
        GenotypeTable {
            timepoints,
            genotypes,
        }
    }

    fn parent_of<'a>(edges: &'a [AncestryEdge], identity: &str) -> &'a str {
        &edges
            .iter()
            .find(|edge| edge.identity == identity)
            .expect("identity should be present")
            .parent
    }

    #[test]
    fn complementary_pair_forms_parent_child() {
        let table = table_of(vec![
            genotype("genotype-1", vec![1.0, 0.8, 0.5, 0.3]),
            genotype("genotype-2", vec![0.0, 0.2, 0.5, 0.7]),
        ]);
        let edges = order_genotypes(&table, &AncestryOptions::default());
        assert_eq!(parent_of(&edges, "genotype-1"), ROOT_GENOTYPE);
        assert_eq!(parent_of(&edges, "genotype-2"), "genotype-1");
    }

    #[test]
    fn replacement_attaches_by_subtractive_test() {
        let table = table_of(vec![
            genotype("genotype-1", vec![0.9, 0.8, 0.5, 0.2, 0.1]),
            genotype("genotype-2", vec![0.0, 0.1, 0.4, 0.7, 0.9]),
        ]);
        let edges = order_genotypes(&table, &AncestryOptions::default());
        assert_eq!(parent_of(&edges, "genotype-1"), ROOT_GENOTYPE);
        assert_eq!(parent_of(&edges, "genotype-2"), "genotype-1");
    }

    #[test]
    fn unrelated_genotypes_attach_to_root() {
        let table = table_of(vec![
            genotype("genotype-1", vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
            genotype("genotype-2", vec![0.0, 0.5, 0.5, 0.0, 0.0, 0.0]),
        ]);
        let edges = order_genotypes(&table, &AncestryOptions::default());
        assert_eq!(parent_of(&edges, "genotype-1"), ROOT_GENOTYPE);
        assert_eq!(parent_of(&edges, "genotype-2"), ROOT_GENOTYPE);
    }

    #[test]
    fn tie_prefers_most_recently_accepted_candidate() {
        // Both placed genotypes pass the additive test with the same margin;
        // the child picks the one accepted later
        let table = table_of(vec![
            genotype("genotype-1", vec![0.5, 0.5, 0.5]),
            genotype("genotype-2", vec![0.5, 0.5, 0.5]),
            genotype("genotype-3", vec![0.5, 0.5, 0.5]),
        ]);
        let edges = order_genotypes(&table, &AncestryOptions::default());
        assert_eq!(parent_of(&edges, "genotype-1"), ROOT_GENOTYPE);
        assert_eq!(parent_of(&edges, "genotype-2"), "genotype-1");
        assert_eq!(parent_of(&edges, "genotype-3"), "genotype-2");
    }

    #[test]
    fn edges_form_a_tree_rooted_at_the_sentinel() {
        let table = table_of(vec![
            genotype("genotype-1", vec![0.1, 0.6, 1.0, 1.0]),
            genotype("genotype-2", vec![0.0, 0.3, 0.5, 0.6]),
            genotype("genotype-3", vec![0.0, 0.0, 0.2, 0.4]),
            genotype("genotype-4", vec![0.2, 0.1, 0.0, 0.0]),
        ]);
        let edges = order_genotypes(&table, &AncestryOptions::default());
        assert_eq!(edges.len(), 4);
        let mut placed = vec![ROOT_GENOTYPE.to_string()];
        for edge in &edges {
            // Parents are always already placed, so no cycle can form
            assert!(placed.contains(&edge.parent), "unplaced parent {}", edge.parent);
            assert_ne!(edge.parent, edge.identity);
            placed.push(edge.identity.clone());
        }
    }

    #[test]
    fn dominant_genotype_is_processed_first() {
        let table = table_of(vec![
            genotype("genotype-1", vec![0.0, 0.2, 0.5, 0.7]),
            genotype("genotype-2", vec![0.3, 0.9, 0.98, 1.0]),
        ]);
        let edges = order_genotypes(&table, &AncestryOptions::default());
        assert_eq!(edges[0].identity, "genotype-2");
    }

    #[test]
    fn empty_table_yields_no_edges() {
        let table = GenotypeTable {
            timepoints: vec![],
            genotypes: vec![],
        };
        let edges = order_genotypes(&table, &AncestryOptions::default());
        assert!(edges.is_empty());
    }
}
