// Genotype table module
// Mean frequency series per genotype, plus the table serialization shared
// by the cluster and lineage outputs

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

use crate::error::AppError;
use crate::trajectory::TrajectoryTable;

/// Parent sentinel for genotypes with no inferred ancestor
pub const ROOT_GENOTYPE: &str = "genotype-0";

/// One genotype: a stable member list and the mean frequency series over
/// those members.
#[derive(Debug, Clone)]
pub struct Genotype {
    pub name: String,
    pub members: Vec<String>,
    pub frequencies: Vec<f64>,
}

impl Genotype {
    /// Member ids serialized for the genotype table
    pub fn members_field(&self) -> String {
        self.members.join("|")
    }

    /// Index of the first timepoint where the mean frequency exceeds `cutoff`
    pub fn first_above(&self, cutoff: f64) -> Option<usize> {
        self.frequencies.iter().position(|&f| f > cutoff)
    }

    /// Highest mean frequency the genotype ever reaches
    pub fn peak(&self) -> f64 {
        self.frequencies.iter().fold(0.0, |max, &f| max.max(f))
    }
}

/// All genotypes of one clustering round, sharing a timepoint index
#[derive(Debug, Clone)]
pub struct GenotypeTable {
    pub timepoints: Vec<f64>,
    pub genotypes: Vec<Genotype>,
}

impl GenotypeTable {
    /// Average each member group into a genotype. Groups are labeled
    /// `genotype-1..N` ordered by their smallest member slot in the source
    /// table, with members sorted, so labels are reproducible run to run.
    pub fn average(groups: &[Vec<String>], table: &TrajectoryTable) -> GenotypeTable {
        let slot_of = |members: &[String]| -> usize {
            members
                .iter()
                .filter_map(|id| table.ids().binary_search(id).ok())
                .min()
                .unwrap_or(usize::MAX)
        };
        let mut ordered: Vec<&Vec<String>> = groups.iter().collect();
        ordered.sort_by_key(|members| slot_of(members.as_slice()));

        let mut genotypes = Vec::with_capacity(ordered.len());
        for (number, group) in ordered.into_iter().enumerate() {
            let mut members: Vec<String> = group.clone();
            members.sort();
            let series: Vec<&[f64]> = members.iter().filter_map(|id| table.series(id)).collect();
            let mut frequencies = vec![0.0; table.timepoints().len()];
            if !series.is_empty() {
                for (t, frequency) in frequencies.iter_mut().enumerate() {
                    *frequency =
                        series.iter().map(|s| s[t]).sum::<f64>() / series.len() as f64;
                }
            }
            genotypes.push(Genotype {
                name: format!("genotype-{}", number + 1),
                members,
                frequencies,
            });
        }

        GenotypeTable {
            timepoints: table.timepoints().to_vec(),
            genotypes,
        }
    }

    pub fn len(&self) -> usize {
        self.genotypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genotypes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Genotype> {
        self.genotypes.iter().find(|g| g.name == name)
    }

    /// Write the genotype table as CSV
    pub fn write_csv(&self, path: &str) -> Result<(), AppError> {
        let file = File::create(path)?;
        self.write(BufWriter::new(file))
    }

    fn write<W: Write>(&self, mut out: W) -> Result<(), AppError> {
        let header: Vec<String> = std::iter::once("Genotype".to_string())
            .chain(std::iter::once("members".to_string()))
            .chain(self.timepoints.iter().map(|t| t.to_string()))
            .collect();
        writeln!(out, "{}", header.join(","))?;
        for genotype in &self.genotypes {
            let mut record = vec![genotype.name.clone(), genotype.members_field()];
            record.extend(genotype.frequencies.iter().map(|f| f.to_string()));
            writeln!(out, "{}", record.join(","))?;
        }
        Ok(())
    }

    /// Load a genotype mean-frequency table from CSV. Numeric headers are
    /// timepoints; a `members` column is optional.
    pub fn from_csv(path: &str) -> Result<Self, AppError> {
        let file = File::open(path)?;
        Self::parse(BufReader::new(file))
    }

    fn parse<R: BufRead>(reader: R) -> Result<Self, AppError> {
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => {
                return Err(AppError::InvalidTable {
                    line: 1,
                    reason: "missing header row".to_string(),
                })
            }
        };

        let fields: Vec<&str> = header.split(',').collect();
        let mut members_column = None;
        let mut columns: Vec<(usize, f64)> = Vec::new();
        for (col, field) in fields.iter().enumerate().skip(1) {
            let field = field.trim();
            if field.eq_ignore_ascii_case("members") {
                members_column = Some(col);
            } else if let Ok(timepoint) = field.parse::<f64>() {
                columns.push((col, timepoint));
            }
        }
        columns.sort_by(|a, b| a.1.total_cmp(&b.1));
        if columns.is_empty() {
            return Err(AppError::InvalidTable {
                line: 1,
                reason: "header contains no numeric timepoint columns".to_string(),
            });
        }
        let timepoints: Vec<f64> = columns.iter().map(|&(_, t)| t).collect();
        let last_column = columns
            .iter()
            .map(|&(col, _)| col)
            .chain(members_column)
            .max()
            .unwrap_or(0);

        let mut names = HashMap::new();
        let mut genotypes = Vec::new();
        for (number, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < last_column + 1 {
                return Err(AppError::InvalidTable {
                    line: number + 2,
                    reason: format!("expected at least {} columns", last_column + 1),
                });
            }
            let name = fields[0].trim().to_string();
            if names.insert(name.clone(), number).is_some() {
                return Err(AppError::InvalidTable {
                    line: number + 2,
                    reason: format!("duplicate genotype {}", name),
                });
            }
            let members = match members_column {
                Some(col) => fields[col]
                    .trim()
                    .split('|')
                    .filter(|m| !m.is_empty())
                    .map(|m| m.to_string())
                    .collect(),
                None => Vec::new(),
            };
            let mut frequencies = Vec::with_capacity(columns.len());
            for &(col, _) in &columns {
                let value = fields[col].trim().parse::<f64>().map_err(|_| {
                    AppError::InvalidTable {
                        line: number + 2,
                        reason: format!("cannot parse frequency {:?}", fields[col]),
                    }
                })?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(AppError::InvalidTable {
                        line: number + 2,
                        reason: format!("genotype {} has frequency {} outside [0, 1]", name, value),
                    });
                }
                frequencies.push(value);
            }
            genotypes.push(Genotype {
                name,
                members,
                frequencies,
            });
        }

        Ok(GenotypeTable {
            timepoints,
            genotypes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> TrajectoryTable {
        TrajectoryTable::new(
            vec![
                ("trj-a".to_string(), vec![0.0, 0.4, 0.8]),
                ("trj-b".to_string(), vec![0.2, 0.6, 1.0]),
                ("trj-c".to_string(), vec![0.5, 0.3, 0.1]),
            ],
            vec![0.0, 10.0, 20.0],
        )
        .unwrap()
    }

    #[test]
    fn averages_member_series() {
        let table = sample_table();
        let groups = vec![
            vec!["trj-b".to_string(), "trj-a".to_string()],
            vec!["trj-c".to_string()],
        ];
        let averaged = GenotypeTable::average(&groups, &table);
        assert_eq!(averaged.len(), 2);
        let first = &averaged.genotypes[0];
        assert_eq!(first.name, "genotype-1");
        assert_eq!(first.members_field(), "trj-a|trj-b");
        assert_eq!(first.frequencies, vec![0.1, 0.5, 0.9]);
        assert_eq!(averaged.genotypes[1].members_field(), "trj-c");
    }

    #[test]
    fn labels_follow_smallest_member_slot() {
        let table = sample_table();
        let groups = vec![
            vec!["trj-c".to_string()],
            vec!["trj-a".to_string(), "trj-b".to_string()],
        ];
        let averaged = GenotypeTable::average(&groups, &table);
        // trj-a sits in the first slot, so its group is genotype-1
        assert_eq!(averaged.genotypes[0].members_field(), "trj-a|trj-b");
        assert_eq!(averaged.genotypes[1].name, "genotype-2");
    }

    #[test]
    fn peak_and_first_above() {
        let genotype = Genotype {
            name: "genotype-1".to_string(),
            members: vec![],
            frequencies: vec![0.0, 0.2, 0.98, 0.6],
        };
        assert_eq!(genotype.peak(), 0.98);
        assert_eq!(genotype.first_above(0.03), Some(1));
        assert_eq!(genotype.first_above(0.97), Some(2));
        assert_eq!(genotype.first_above(0.99), None);
    }

    #[test]
    fn roundtrips_through_csv() {
        let table = sample_table();
        let groups = vec![vec!["trj-a".to_string(), "trj-b".to_string()]];
        let averaged = GenotypeTable::average(&groups, &table);
        let mut buffer = Vec::new();
        averaged.write(&mut buffer).unwrap();
        let parsed = GenotypeTable::parse(buffer.as_slice()).unwrap();
        assert_eq!(parsed.timepoints, averaged.timepoints);
        assert_eq!(parsed.genotypes[0].name, "genotype-1");
        assert_eq!(parsed.genotypes[0].members, vec!["trj-a", "trj-b"]);
        assert_eq!(parsed.genotypes[0].frequencies, averaged.genotypes[0].frequencies);
    }

    #[test]
    fn parses_table_without_members_column() {
        let text = "Genotype,0,10\ngenotype-1,0.1,0.9\n";
        let parsed = GenotypeTable::parse(text.as_bytes()).unwrap();
        assert_eq!(parsed.genotypes[0].members, Vec::<String>::new());
        assert_eq!(parsed.genotypes[0].frequencies, vec![0.1, 0.9]);
    }
}
