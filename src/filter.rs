// Genotype filter module
// Flags genotypes whose detection pattern contradicts a background fixation
// event, so the pipeline can drop their members and re-cluster

use crate::error::AppError;
use crate::genotype::GenotypeTable;

/// Find the first genotype invalidated by a background sweep: one detected
/// both before the background arose and after the background fixed, which a
/// real competing lineage cannot survive. Returns the genotype label to
/// remove, or None when the table is consistent.
pub fn find_invalid_genotype(
    table: &GenotypeTable,
    detection_cutoff: f64,
    strict: bool,
    frequency_breakpoints: &[f64],
) -> Result<Option<String>, AppError> {
    if table.is_empty() {
        return Ok(None);
    }

    let (fuzzy_fixed, backgrounds) = detect_backgrounds(table, frequency_breakpoints)?;

    for &background_index in &backgrounds {
        let background = &table.genotypes[background_index];
        let first_detected = match background.first_above(detection_cutoff) {
            Some(index) => index,
            None => continue,
        };
        let first_fixed = match background.first_above(fuzzy_fixed) {
            Some(index) => index,
            None => continue,
        };

        for (index, genotype) in table.genotypes.iter().enumerate() {
            if backgrounds.contains(&index) {
                continue;
            }
            let detected_before = genotype.frequencies[..first_detected]
                .iter()
                .any(|&f| f > detection_cutoff);
            let detected_after = genotype.frequencies[first_fixed + 1..]
                .iter()
                .any(|&f| f > detection_cutoff);
            if !(detected_before && detected_after) {
                continue;
            }
            // In strict mode persistence alone is disqualifying; otherwise
            // the genotype must also be incompatible with the sweep itself
            let exceeds = genotype.frequencies[first_fixed] + background.frequencies[first_fixed]
                > 1.0 + detection_cutoff;
            if strict || exceeds {
                return Ok(Some(genotype.name.clone()));
            }
        }
    }

    Ok(None)
}

/// Background genotypes under the first candidate cutoff that any genotype
/// reaches, trying the breakpoints in their given (descending) order.
fn detect_backgrounds(
    table: &GenotypeTable,
    frequency_breakpoints: &[f64],
) -> Result<(f64, Vec<usize>), AppError> {
    for &breakpoint in frequency_breakpoints {
        let qualifying: Vec<usize> = table
            .genotypes
            .iter()
            .enumerate()
            .filter(|(_, genotype)| genotype.peak() > breakpoint)
            .map(|(index, _)| index)
            .collect();
        if !qualifying.is_empty() {
            return Ok((breakpoint, qualifying));
        }
    }
    Err(AppError::NoBackground {
        breakpoints: frequency_breakpoints.to_vec(),
    })
}
