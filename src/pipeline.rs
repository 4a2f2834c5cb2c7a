// Pipeline module
// Orchestrates pairwise scoring, grouping, refinement, the bounded
// filter-and-recluster loop, and ancestry ordering

use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use clap::Args;

use crate::cluster::{group_trajectories, ClusterMethod, Linkage};
use crate::error::AppError;
use crate::filter::find_invalid_genotype;
use crate::genotype::GenotypeTable;
use crate::order::{order_genotypes, write_edges, AncestryEdge, AncestryOptions};
use crate::pairwise::PairwiseCache;
use crate::progress::format_time_used;
use crate::refine::unlink_unrelated_trajectories;
use crate::similarity::Metric;
use crate::trajectory::TrajectoryTable;

/// Thresholds and strategy switches for the full pipeline
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub metric: Metric,
    pub method: ClusterMethod,
    pub linkage: Linkage,
    pub detection_breakpoint: f64,
    pub significant_breakpoint: f64,
    pub fixed_breakpoint: f64,
    pub similarity_breakpoint: f64,
    pub difference_breakpoint: f64,
    pub starting_genotypes: Vec<Vec<String>>,
    pub use_filter: bool,
    pub strict_filter: bool,
    pub frequency_breakpoints: Vec<f64>,
    pub max_filter_rounds: usize,
    pub max_refine_passes: usize,
    pub additive_single_cutoff: f64,
    pub additive_double_cutoff: f64,
    pub subtractive_single_cutoff: f64,
    pub subtractive_double_cutoff: f64,
    pub derivative_cutoff: f64,
    pub show_progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            metric: Metric::Binomial,
            method: ClusterMethod::Matlab,
            linkage: Linkage::Average,
            detection_breakpoint: 0.03,
            significant_breakpoint: 0.15,
            fixed_breakpoint: 0.97,
            similarity_breakpoint: 0.05,
            difference_breakpoint: 0.10,
            starting_genotypes: Vec::new(),
            use_filter: true,
            strict_filter: false,
            frequency_breakpoints: vec![0.97, 0.93, 0.90, 0.87, 0.85, 0.80],
            max_filter_rounds: 10,
            max_refine_passes: 50,
            additive_single_cutoff: 0.03,
            additive_double_cutoff: 0.06,
            subtractive_single_cutoff: 0.15,
            subtractive_double_cutoff: 0.03,
            derivative_cutoff: 0.01,
            show_progress: false,
        }
    }
}

impl PipelineOptions {
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

/// Output of a full lineage run
#[derive(Debug)]
pub struct PipelineResult {
    pub genotypes: GenotypeTable,
    pub ancestry: Vec<AncestryEdge>,
    pub filter_rounds: usize,
    pub removed: Vec<String>,
}

/// One clustering round: group the cached trajectories, unlink unrelated
/// members, and average the surviving partition.
pub fn cluster_genotypes(
    table: &TrajectoryTable,
    cache: &PairwiseCache,
    options: &PipelineOptions,
) -> Result<GenotypeTable, AppError> {
    let groups = group_trajectories(
        options.method,
        options.linkage,
        cache,
        options.similarity_breakpoint,
        &options.starting_genotypes,
    );
    let groups = unlink_unrelated_trajectories(
        groups,
        cache,
        options.difference_breakpoint,
        options.max_refine_passes,
    )?;
    Ok(GenotypeTable::average(&groups, table))
}

/// Full pipeline. Each round clusters the working table and asks the filter
/// for an invalid genotype; finding one removes its member trajectories and
/// re-runs clustering on the reduced table. The round count is capped so an
/// oscillating filter surfaces as an error instead of spinning.
pub fn run_lineage_pipeline(
    table: &TrajectoryTable,
    options: &PipelineOptions,
) -> Result<PipelineResult, AppError> {
    let mut working = table.clone();
    let mut cache = PairwiseCache::compute(
        &working,
        options.metric,
        options.detection_breakpoint,
        options.fixed_breakpoint,
        options.show_progress,
    );
    let mut removed: Vec<String> = Vec::new();
    let mut rounds = 0usize;

    loop {
        let genotypes = cluster_genotypes(&working, &cache, options)?;
        let invalid = if options.use_filter && !genotypes.is_empty() {
            find_invalid_genotype(
                &genotypes,
                options.detection_breakpoint,
                options.strict_filter,
                &options.frequency_breakpoints,
            )?
        } else {
            None
        };
        match invalid {
            None => {
                let ancestry = order_genotypes(&genotypes, &options.ancestry_options());
                return Ok(PipelineResult {
                    genotypes,
                    ancestry,
                    filter_rounds: rounds,
                    removed,
                });
            }
            Some(name) => {
                rounds += 1;
                if rounds >= options.max_filter_rounds {
                    return Err(AppError::NoConvergence {
                        stage: "genotype filtering",
                        limit: options.max_filter_rounds,
                    });
                }
                let members: Vec<String> = genotypes
                    .get(&name)
                    .map(|genotype| genotype.members.clone())
                    .unwrap_or_default();
                let dropped: HashSet<String> = members.iter().cloned().collect();
                removed.extend(members);
                working = working.without(&dropped);
                let valid: HashSet<String> = working.ids().iter().cloned().collect();
                cache = cache.reduce(&valid);
            }
        }
    }
}

/// Command-line arguments for the cluster subcommand
#[derive(Args, Debug)]
pub struct ClusterArgs {
    /// Input trajectory CSV
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output genotype CSV
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Pairwise metric: binomial
    #[arg(long = "metric", default_value = "binomial")]
    pub metric: String,
    /// Clustering method: matlab, hierarchy
    #[arg(short = 'm', long = "method", default_value = "matlab")]
    pub method: String,
    /// Linkage for the hierarchy method: average, complete
    #[arg(long = "linkage", default_value = "average")]
    pub linkage: String,
    /// Minimum frequency considered a real observation
    #[arg(long = "detection", default_value_t = 0.03)]
    pub detection_breakpoint: f64,
    /// Frequency at which a trajectory counts as fixed
    #[arg(long = "fixed", default_value_t = 0.97)]
    pub fixed_breakpoint: f64,
    /// p-value above which two trajectories are related
    #[arg(long = "similarity", default_value_t = 0.05)]
    pub similarity_breakpoint: f64,
    /// p-value below which grouped trajectories are split apart
    #[arg(long = "difference", default_value_t = 0.10)]
    pub difference_breakpoint: f64,
    /// Known genotype seed, member ids joined by commas (repeatable)
    #[arg(long = "starting-genotype")]
    pub starting_genotypes: Vec<String>,
    /// Cap on unlinking passes
    #[arg(long = "max-refine-passes", default_value_t = 50)]
    pub max_refine_passes: usize,
    /// Number of parallel threads
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

/// Command-line arguments for the full lineage pipeline
#[derive(Args, Debug)]
pub struct LineageArgs {
    /// Input trajectory CSV
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output genotype CSV
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Output edges CSV
    #[arg(short = 'e', long = "edges")]
    pub edges: String,
    /// Pairwise metric: binomial
    #[arg(long = "metric", default_value = "binomial")]
    pub metric: String,
    /// Clustering method: matlab, hierarchy
    #[arg(short = 'm', long = "method", default_value = "matlab")]
    pub method: String,
    /// Linkage for the hierarchy method: average, complete
    #[arg(long = "linkage", default_value = "average")]
    pub linkage: String,
    /// Minimum frequency considered a real observation
    #[arg(long = "detection", default_value_t = 0.03)]
    pub detection_breakpoint: f64,
    /// Frequency at which a genotype counts as significant
    #[arg(long = "significant", default_value_t = 0.15)]
    pub significant_breakpoint: f64,
    /// Frequency at which a genotype counts as fixed
    #[arg(long = "fixed", default_value_t = 0.97)]
    pub fixed_breakpoint: f64,
    /// p-value above which two trajectories are related
    #[arg(long = "similarity", default_value_t = 0.05)]
    pub similarity_breakpoint: f64,
    /// p-value below which grouped trajectories are split apart
    #[arg(long = "difference", default_value_t = 0.10)]
    pub difference_breakpoint: f64,
    /// Known genotype seed, member ids joined by commas (repeatable)
    #[arg(long = "starting-genotype")]
    pub starting_genotypes: Vec<String>,
    /// Skip the background-consistency filter
    #[arg(long = "no-filter", default_value_t = false)]
    pub no_filter: bool,
    /// Treat any genotype straddling a sweep as invalid
    #[arg(long = "strict-filter", default_value_t = false)]
    pub strict_filter: bool,
    /// Candidate background cutoffs, descending, joined by commas
    #[arg(long = "frequency-breakpoints", default_value = "0.97,0.93,0.90,0.87,0.85,0.80")]
    pub frequency_breakpoints: String,
    /// Cap on filter-and-recluster rounds
    #[arg(long = "max-filter-rounds", default_value_t = 10)]
    pub max_filter_rounds: usize,
    /// Cap on unlinking passes
    #[arg(long = "max-refine-passes", default_value_t = 50)]
    pub max_refine_passes: usize,
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
    /// Number of parallel threads
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

fn validate_breakpoint(name: &str, value: f64) -> Result<(), AppError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{} must be between 0.0 and 1.0, current: {}",
            name, value
        )));
    }
    Ok(())
}

fn validate_input_path(input: &str) -> Result<(), AppError> {
    if input.trim().is_empty() {
        return Err(AppError::InvalidArgument(
            "input file path cannot be empty".to_string(),
        ));
    }
    if !Path::new(input).exists() {
        return Err(AppError::InvalidArgument(format!(
            "input file does not exist: {}",
            input
        )));
    }
    Ok(())
}

/// Validate cluster command arguments
pub fn validate_cluster_args(args: &ClusterArgs) -> Result<(), AppError> {
    validate_input_path(&args.input)?;
    Metric::from_name(&args.metric)?;
    ClusterMethod::from_name(&args.method)?;
    Linkage::from_name(&args.linkage)?;
    validate_breakpoint("detection breakpoint", args.detection_breakpoint)?;
    validate_breakpoint("fixed breakpoint", args.fixed_breakpoint)?;
    validate_breakpoint("similarity breakpoint", args.similarity_breakpoint)?;
    validate_breakpoint("difference breakpoint", args.difference_breakpoint)?;
    Ok(())
}

/// Validate lineage command arguments
pub fn validate_lineage_args(args: &LineageArgs) -> Result<(), AppError> {
    validate_input_path(&args.input)?;
    Metric::from_name(&args.metric)?;
    ClusterMethod::from_name(&args.method)?;
    Linkage::from_name(&args.linkage)?;
    validate_breakpoint("detection breakpoint", args.detection_breakpoint)?;
    validate_breakpoint("significant breakpoint", args.significant_breakpoint)?;
    validate_breakpoint("fixed breakpoint", args.fixed_breakpoint)?;
    validate_breakpoint("similarity breakpoint", args.similarity_breakpoint)?;
    validate_breakpoint("difference breakpoint", args.difference_breakpoint)?;
    parse_frequency_breakpoints(&args.frequency_breakpoints)?;
    if args.max_filter_rounds == 0 {
        return Err(AppError::InvalidArgument(
            "max filter rounds cannot be 0".to_string(),
        ));
    }
    Ok(())
}

/// Parse the descending candidate background cutoffs
fn parse_frequency_breakpoints(text: &str) -> Result<Vec<f64>, AppError> {
    let mut breakpoints = Vec::new();
    for field in text.split(',') {
        let value = field.trim().parse::<f64>().map_err(|_| {
            AppError::InvalidArgument(format!("cannot parse frequency breakpoint {:?}", field))
        })?;
        validate_breakpoint("frequency breakpoint", value)?;
        breakpoints.push(value);
    }
    breakpoints.sort_by(|a, b| b.total_cmp(a));
    Ok(breakpoints)
}

fn parse_starting_genotypes(seeds: &[String]) -> Vec<Vec<String>> {
    seeds
        .iter()
        .map(|seed| {
            seed.split(',')
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect()
        })
        .filter(|members: &Vec<String>| !members.is_empty())
        .collect()
}

impl ClusterArgs {
    fn pipeline_options(&self) -> Result<PipelineOptions, AppError> {
        Ok(PipelineOptions {
            metric: Metric::from_name(&self.metric)?,
            method: ClusterMethod::from_name(&self.method)?,
            linkage: Linkage::from_name(&self.linkage)?,
            detection_breakpoint: self.detection_breakpoint,
            fixed_breakpoint: self.fixed_breakpoint,
            similarity_breakpoint: self.similarity_breakpoint,
            difference_breakpoint: self.difference_breakpoint,
            starting_genotypes: parse_starting_genotypes(&self.starting_genotypes),
            max_refine_passes: self.max_refine_passes,
            use_filter: false,
            show_progress: true,
            ..PipelineOptions::default()
        })
    }
}

impl LineageArgs {
    fn pipeline_options(&self) -> Result<PipelineOptions, AppError> {
        Ok(PipelineOptions {
            metric: Metric::from_name(&self.metric)?,
            method: ClusterMethod::from_name(&self.method)?,
            linkage: Linkage::from_name(&self.linkage)?,
            detection_breakpoint: self.detection_breakpoint,
            significant_breakpoint: self.significant_breakpoint,
            fixed_breakpoint: self.fixed_breakpoint,
            similarity_breakpoint: self.similarity_breakpoint,
            difference_breakpoint: self.difference_breakpoint,
            starting_genotypes: parse_starting_genotypes(&self.starting_genotypes),
            use_filter: !self.no_filter,
            strict_filter: self.strict_filter,
            frequency_breakpoints: parse_frequency_breakpoints(&self.frequency_breakpoints)?,
            max_filter_rounds: self.max_filter_rounds,
            max_refine_passes: self.max_refine_passes,
            additive_single_cutoff: self.additive_single_cutoff,
            additive_double_cutoff: self.additive_double_cutoff,
            subtractive_single_cutoff: self.subtractive_single_cutoff,
            subtractive_double_cutoff: self.subtractive_double_cutoff,
            derivative_cutoff: self.derivative_cutoff,
            show_progress: true,
        })
    }
}

/// Run the cluster subcommand: trajectories in, genotype table out
pub fn cluster_main(args: &ClusterArgs) -> Result<(), AppError> {
    let start = Instant::now();
    let options = args.pipeline_options()?;
    let table = TrajectoryTable::from_csv(&args.input)?;
    println!("Loaded {} trajectories from {}", table.len(), args.input);

    let cache = PairwiseCache::compute(
        &table,
        options.metric,
        options.detection_breakpoint,
        options.fixed_breakpoint,
        options.show_progress,
    );
    let genotypes = cluster_genotypes(&table, &cache, &options)?;
    genotypes.write_csv(&args.output)?;
    println!(
        "Clustered {} trajectories into {} genotypes -> {}",
        table.len(),
        genotypes.len(),
        args.output
    );
    println!("{}", format_time_used(start.elapsed()));
    Ok(())
}

/// Run the lineage subcommand: trajectories in, genotype and edges tables out
pub fn lineage_main(args: &LineageArgs) -> Result<(), AppError> {
    let start = Instant::now();
    let options = args.pipeline_options()?;
    let table = TrajectoryTable::from_csv(&args.input)?;
    println!("Loaded {} trajectories from {}", table.len(), args.input);

    let result = run_lineage_pipeline(&table, &options)?;
    if !result.removed.is_empty() {
        println!(
            "Filter removed {} trajectories over {} rounds: {}",
            result.removed.len(),
            result.filter_rounds,
            result.removed.join(", ")
        );
    }
    result.genotypes.write_csv(&args.output)?;
    write_edges(&args.edges, &result.ancestry)?;
    println!(
        "Resolved {} genotypes -> {} ; lineage -> {}",
        result.genotypes.len(),
        args.output,
        args.edges
    );
    println!("{}", format_time_used(start.elapsed()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genotype::ROOT_GENOTYPE;

    fn table_of(entries: Vec<(&str, Vec<f64>)>) -> TrajectoryTable {
        let timepoints: Vec<f64> = (0..entries[0].1.len()).map(|t| t as f64).collect();
        TrajectoryTable::new(
            entries
                .into_iter()
                .map(|(id, series)| (id.to_string(), series))
                .collect(),
            timepoints,
        )
        .unwrap()
    }

    #[test]
    fn empty_input_yields_empty_outputs() {
        let table = TrajectoryTable::new(vec![], vec![0.0, 1.0]).unwrap();
        let result = run_lineage_pipeline(&table, &PipelineOptions::default()).unwrap();
        assert!(result.genotypes.is_empty());
        assert!(result.ancestry.is_empty());
        assert_eq!(result.filter_rounds, 0);
    }

    #[test]
    fn sweep_population_resolves_without_filtering() {
        let table = table_of(vec![
            ("trj-1", vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
            ("trj-2", vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
            ("trj-3", vec![0.0, 0.5, 0.5, 0.0, 0.0, 0.0]),
        ]);
        let result = run_lineage_pipeline(&table, &PipelineOptions::default()).unwrap();
        assert_eq!(result.genotypes.len(), 2);
        assert_eq!(result.genotypes.genotypes[0].members_field(), "trj-1|trj-2");
        assert_eq!(result.filter_rounds, 0);
        assert!(result.removed.is_empty());
        // The transient died before the sweep, so it hangs off the root
        for edge in &result.ancestry {
            assert_eq!(edge.parent, ROOT_GENOTYPE);
        }
    }

    #[test]
    fn filter_removes_sweep_straddler_and_reclusters() {
        let table = table_of(vec![
            ("trj-bg", vec![0.0, 0.1, 0.5, 0.98, 1.0]),
            ("trj-ghost", vec![0.1, 0.0, 0.0, 0.06, 0.12]),
        ]);
        let result = run_lineage_pipeline(&table, &PipelineOptions::default()).unwrap();
        assert_eq!(result.filter_rounds, 1);
        assert_eq!(result.removed, vec!["trj-ghost".to_string()]);
        assert_eq!(result.genotypes.len(), 1);
        assert_eq!(result.genotypes.genotypes[0].members_field(), "trj-bg");
    }

    #[test]
    fn no_filter_keeps_the_straddler() {
        let table = table_of(vec![
            ("trj-bg", vec![0.0, 0.1, 0.5, 0.98, 1.0]),
            ("trj-ghost", vec![0.1, 0.0, 0.0, 0.06, 0.12]),
        ]);
        let options = PipelineOptions {
            use_filter: false,
            ..PipelineOptions::default()
        };
        let result = run_lineage_pipeline(&table, &options).unwrap();
        assert_eq!(result.genotypes.len(), 2);
        assert!(result.removed.is_empty());
    }

    #[test]
    fn population_without_background_fails_when_filtering() {
        let table = table_of(vec![("trj-1", vec![0.0, 0.2, 0.4, 0.3])]);
        let result = run_lineage_pipeline(&table, &PipelineOptions::default());
        assert!(matches!(result, Err(AppError::NoBackground { .. })));
    }

    #[test]
    fn genotypes_partition_the_input() {
        let table = table_of(vec![
            ("trj-1", vec![0.0, 0.1, 0.4, 0.8, 1.0]),
            ("trj-2", vec![0.0, 0.12, 0.41, 0.79, 1.0]),
            ("trj-3", vec![0.0, 0.3, 0.6, 0.1, 0.0]),
            ("trj-4", vec![0.9, 0.6, 0.2, 0.0, 0.0]),
        ]);
        let options = PipelineOptions {
            use_filter: false,
            ..PipelineOptions::default()
        };
        let result = run_lineage_pipeline(&table, &options).unwrap();
        let mut members: Vec<String> = result
            .genotypes
            .genotypes
            .iter()
            .flat_map(|genotype| genotype.members.clone())
            .collect();
        members.sort();
        assert_eq!(
            members,
            vec!["trj-1", "trj-2", "trj-3", "trj-4"]
        );
        // Every genotype got exactly one parent
        assert_eq!(result.ancestry.len(), result.genotypes.len());
    }

    #[test]
    fn starting_genotype_parsing() {
        let seeds = vec!["trj-1, trj-2".to_string(), "".to_string(), "trj-3".to_string()];
        let parsed = parse_starting_genotypes(&seeds);
        assert_eq!(
            parsed,
            vec![
                vec!["trj-1".to_string(), "trj-2".to_string()],
                vec!["trj-3".to_string()]
            ]
        );
    }

    #[test]
    fn frequency_breakpoints_sort_descending() {
        let parsed = parse_frequency_breakpoints("0.85,0.97,0.90").unwrap();
        assert_eq!(parsed, vec![0.97, 0.90, 0.85]);
        assert!(parse_frequency_breakpoints("0.9,high").is_err());
    }
}
