//! Record sources backed by memory or CSV files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tessera_abstraction::{EngineError, EngineResult, Record, RecordSource, RecordStream};
use tracing::debug;

/// Split data held in memory. Mostly useful in tests.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    splits: BTreeMap<String, Vec<Record>>,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_split(mut self, split: impl Into<String>, records: Vec<Record>) -> Self {
        self.splits.insert(split.into(), records);
        self
    }
}

impl RecordSource for InMemorySource {
    fn split_names(&self) -> Vec<String> {
        self.splits.keys().cloned().collect()
    }

    fn open(&self, split: &str) -> EngineResult<RecordStream> {
        let records = self
            .splits
            .get(split)
            .ok_or_else(|| EngineError::Data(format!("unknown split '{split}'")))?
            .clone();
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}

/// A named feature column group. Width `k > 1` reads columns `name_0 .. name_{k-1}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvColumn {
    pub name: String,
    pub width: usize,
}

impl CsvColumn {
    #[must_use]
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        Self { name: name.into(), width }
    }

    fn headers(&self) -> Vec<String> {
        if self.width <= 1 {
            vec![self.name.clone()]
        } else {
            (0..self.width).map(|i| format!("{}_{i}", self.name)).collect()
        }
    }
}

/// CSV files with a header row, one file per split.
#[derive(Debug, Clone)]
pub struct CsvSource {
    features: Vec<CsvColumn>,
    labels: Vec<CsvColumn>,
    splits: BTreeMap<String, PathBuf>,
}

impl CsvSource {
    #[must_use]
    pub fn new(features: Vec<CsvColumn>, labels: Vec<CsvColumn>) -> Self {
        Self { features, labels, splits: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_split(mut self, split: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.splits.insert(split.into(), path.into());
        self
    }
}

fn column_indices(header: &csv::StringRecord, column: &CsvColumn) -> EngineResult<Vec<usize>> {
    column
        .headers()
        .into_iter()
        .map(|name| {
            header
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| EngineError::Data(format!("missing CSV column '{name}'")))
        })
        .collect()
}

fn parse_cell(row: &csv::StringRecord, idx: usize, line: u64) -> EngineResult<f32> {
    let raw = row.get(idx).unwrap_or("").trim();
    raw.parse::<f32>()
        .map_err(|e| EngineError::Data(format!("line {line}: cannot parse '{raw}' as a number: {e}")))
}

impl RecordSource for CsvSource {
    fn split_names(&self) -> Vec<String> {
        self.splits.keys().cloned().collect()
    }

    fn open(&self, split: &str) -> EngineResult<RecordStream> {
        let path = self
            .splits
            .get(split)
            .ok_or_else(|| EngineError::Data(format!("unknown split '{split}'")))?;
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| EngineError::Data(format!("failed to open {}: {e}", path.display())))?;
        let header = reader
            .headers()
            .map_err(|e| EngineError::Data(format!("failed to read header of {}: {e}", path.display())))?
            .clone();

        let mut feature_idx = Vec::new();
        for column in &self.features {
            feature_idx.extend(column_indices(&header, column)?);
        }
        let mut label_idx = Vec::with_capacity(self.labels.len());
        for column in &self.labels {
            label_idx.push((column.name.clone(), column_indices(&header, column)?));
        }
        debug!(path = %path.display(), split, "Opened CSV split");

        let rows = reader.into_records().map(move |row| {
            let row = row.map_err(|e| EngineError::Data(e.to_string()))?;
            let line = row.position().map_or(0, csv::Position::line);
            let features = feature_idx
                .iter()
                .map(|&i| parse_cell(&row, i, line))
                .collect::<EngineResult<Vec<f32>>>()?;
            let mut record = Record::new(features);
            for (name, indices) in &label_idx {
                let values = indices
                    .iter()
                    .map(|&i| parse_cell(&row, i, line))
                    .collect::<EngineResult<Vec<f32>>>()?;
                record.targets.insert(name.clone(), values);
            }
            Ok(record)
        });
        Ok(Box::new(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_in_memory_reopens_from_start() {
        let source = InMemorySource::new()
            .with_split("train", vec![Record::new(vec![1.0]), Record::new(vec![2.0])]);
        assert_eq!(source.split_names(), vec!["train".to_string()]);
        assert_eq!(source.open("train").unwrap().count(), 2);
        assert_eq!(source.open("train").unwrap().count(), 2);
        assert!(source.open("val").is_err());
    }

    #[test]
    fn test_csv_reads_wide_features_and_labels() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x_0,x_1,y").unwrap();
        writeln!(file, "1.0,2.0,3.0").unwrap();
        writeln!(file, "4.0,5.0,6.0").unwrap();

        let source = CsvSource::new(vec![CsvColumn::new("x", 2)], vec![CsvColumn::new("y", 1)])
            .with_split("train", file.path());
        let records: Vec<Record> = source.open("train").unwrap().map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].features, vec![4.0, 5.0]);
        assert_eq!(records[1].targets["y"], vec![6.0]);
    }

    #[test]
    fn test_csv_missing_column_fails_on_open() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a,b").unwrap();
        let source =
            CsvSource::new(vec![CsvColumn::new("x", 1)], vec![]).with_split("train", file.path());
        assert!(source.open("train").is_err());
    }

    #[test]
    fn test_csv_bad_cell_is_data_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x").unwrap();
        writeln!(file, "oops").unwrap();
        let source =
            CsvSource::new(vec![CsvColumn::new("x", 1)], vec![]).with_split("train", file.path());
        let first = source.open("train").unwrap().next().unwrap();
        assert!(matches!(first, Err(EngineError::Data(_))));
    }
}
