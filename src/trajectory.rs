// Trajectory table module
// Loads and validates the shared per-timepoint frequency table consumed by the pipeline

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};

use crate::error::AppError;

/// Immutable table of measured frequency trajectories. Rows are kept sorted
/// by trajectory id so pair enumeration downstream is reproducible.
#[derive(Debug, Clone)]
pub struct TrajectoryTable {
    timepoints: Vec<f64>,
    ids: Vec<String>,
    rows: Vec<Vec<f64>>,
    index: HashMap<String, usize>,
}

impl TrajectoryTable {
    /// Build a table from (id, frequency series) entries sharing one timepoint index
    pub fn new(entries: Vec<(String, Vec<f64>)>, timepoints: Vec<f64>) -> Result<Self, AppError> {
        // Validate in caller order so reported rows match the input
        let mut seen: HashMap<&str, usize> = HashMap::with_capacity(entries.len());
        for (row, (id, series)) in entries.iter().enumerate() {
            if series.len() != timepoints.len() {
                return Err(AppError::InvalidTable {
                    line: row + 1,
                    reason: format!(
                        "trajectory {} has {} values for {} timepoints",
                        id,
                        series.len(),
                        timepoints.len()
                    ),
                });
            }
            for &value in series {
                if !(0.0..=1.0).contains(&value) {
                    return Err(AppError::InvalidTable {
                        line: row + 1,
                        reason: format!("trajectory {} has frequency {} outside [0, 1]", id, value),
                    });
                }
            }
            if seen.insert(id, row).is_some() {
                return Err(AppError::InvalidTable {
                    line: row + 1,
                    reason: format!("duplicate trajectory id {}", id),
                });
            }
        }

        let mut entries = entries;
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut ids = Vec::with_capacity(entries.len());
        let mut rows = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());
        for (id, series) in entries {
            index.insert(id.clone(), ids.len());
            ids.push(id);
            rows.push(series);
        }

        Ok(Self {
            timepoints,
            ids,
            rows,
            index,
        })
    }

    /// Load a trajectory table from a CSV file. The first column holds the
    /// trajectory id; columns with numeric headers are timepoints and any
    /// other column is treated as an annotation and ignored.
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

        // Numeric headers are timepoints; remember their column positions
        let fields: Vec<&str> = header.split(',').collect();
        let mut columns: Vec<(usize, f64)> = Vec::new();
        for (col, field) in fields.iter().enumerate().skip(1) {
            if let Ok(timepoint) = field.trim().parse::<f64>() {
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
        let last_column = columns.iter().map(|&(col, _)| col).max().unwrap_or(0);

        let mut entries = Vec::new();
        for (number, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < last_column + 1 {
                return Err(AppError::InvalidTable {
                    line: number + 2,
                    reason: format!("expected at least {} columns", columns.len() + 1),
                });
            }
            let id = fields[0].trim().to_string();
            let mut series = Vec::with_capacity(columns.len());
            for &(col, _) in &columns {
                let value = fields[col].trim().parse::<f64>().map_err(|_| {
                    AppError::InvalidTable {
                        line: number + 2,
                        reason: format!("cannot parse frequency {:?}", fields[col]),
                    }
                })?;
                series.push(value);
            }
            entries.push((id, series));
        }

        Self::new(entries, timepoints)
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

    pub fn timepoints(&self) -> &[f64] {
        &self.timepoints
    }

    /// Frequency series for a trajectory id
    pub fn series(&self, id: &str) -> Option<&[f64]> {
        self.index.get(id).map(|&i| self.rows[i].as_slice())
    }

    pub fn series_at(&self, index: usize) -> &[f64] {
        &self.rows[index]
    }

    pub fn id_at(&self, index: usize) -> &str {
        &self.ids[index]
    }

    /// Copy of the table without the given trajectory ids
    pub fn without(&self, removed: &HashSet<String>) -> TrajectoryTable {
        let mut ids = Vec::new();
        let mut rows = Vec::new();
        let mut index = HashMap::new();
        for (id, row) in self.ids.iter().zip(&self.rows) {
            if removed.contains(id) {
                continue;
            }
            index.insert(id.clone(), ids.len());
            ids.push(id.clone());
            rows.push(row.clone());
        }
        TrajectoryTable {
            timepoints: self.timepoints.clone(),
            ids,
            rows,
            index,
        }
    }
}
