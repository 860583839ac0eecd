//! Statement dataset loading for activation harvesting

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// A single labeled statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub statement: String,
    /// Truth label: 1 = true, 0 = false
    pub label: u8,
}

/// Collection of statements loaded from one dataset CSV
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    records: Vec<Statement>,
}

impl Dataset {
    /// Load a dataset by name from `<data_dir>/<name>.csv`
    ///
    /// The CSV must have a header row with `statement` and `label` columns.
    pub fn load(data_dir: &Path, name: &str) -> Result<Self> {
        let path = Self::csv_path(data_dir, name);
        Self::from_csv(&path, name)
    }

    /// Load a dataset from an explicit CSV path
    pub fn from_csv(path: &Path, name: &str) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open dataset CSV {}", path.display()))?;

        let mut records = Vec::new();
        for record in reader.deserialize() {
            let record: Statement =
                record.with_context(|| format!("Malformed row in {}", path.display()))?;
            records.push(record);
        }

        Ok(Self {
            name: name.to_string(),
            records,
        })
    }

    /// Path of the CSV backing a named dataset
    pub fn csv_path(data_dir: &Path, name: &str) -> PathBuf {
        data_dir.join(format!("{name}.csv"))
    }

    /// Dataset name (CSV file stem)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Statement strings in file order
    pub fn statements(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.statement.as_str()).collect()
    }

    /// Truth labels in file order
    pub fn labels(&self) -> Vec<bool> {
        self.records.iter().map(|r| r.label != 0).collect()
    }

    /// Count of true statements
    pub fn true_count(&self) -> usize {
        self.records.iter().filter(|r| r.label != 0).count()
    }

    /// Count of false statements
    pub fn false_count(&self) -> usize {
        self.records.iter().filter(|r| r.label == 0).count()
    }

    /// Drop every record past the first `limit`
    pub fn truncate(&mut self, limit: usize) {
        self.records.truncate(limit);
    }

    /// Total number of statements
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get all records
    pub fn records(&self) -> &[Statement] {
        &self.records
    }
}

/// Split row indices into train and test sets with a seeded shuffle.
///
/// Returned indices refer to dataset row order, which is also activation
/// row order, so callers can pair features and labels by index.
pub fn split_indices(n: usize, train_ratio: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut rng);

    let split_idx = (n as f64 * train_ratio) as usize;
    let train = indices[..split_idx].to_vec();
    let test = indices[split_idx..].to_vec();

    (train, test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "statement,label").unwrap();
        writeln!(file, "The sky is blue.,1").unwrap();
        writeln!(file, "Cows have nine legs.,0").unwrap();
        writeln!(file, "Water freezes at zero celsius.,1").unwrap();
        file
    }

    #[test]
    fn test_load_csv() {
        let file = sample_csv();
        let dataset = Dataset::from_csv(file.path(), "sample").unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.true_count(), 2);
        assert_eq!(dataset.false_count(), 1);
        assert_eq!(dataset.statements()[0], "The sky is blue.");
        assert_eq!(dataset.labels(), vec![true, false, true]);
    }

    #[test]
    fn test_truncate() {
        let file = sample_csv();
        let mut dataset = Dataset::from_csv(file.path(), "sample").unwrap();

        dataset.truncate(2);
        assert_eq!(dataset.len(), 2);

        // Truncating past the end is a no-op
        dataset.truncate(100);
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_split_indices() {
        let (train, test) = split_indices(10, 0.8, 42);
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);

        // No index appears twice
        let mut all: Vec<usize> = train.iter().chain(test.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_deterministic() {
        let (train1, test1) = split_indices(20, 0.5, 7);
        let (train2, test2) = split_indices(20, 0.5, 7);

        assert_eq!(train1, train2);
        assert_eq!(test1, test2);
    }
}
