//! Shared fixtures for unit tests.

use crate::config::{DataConfig, HyperParameters, NamedMap};
use crate::datasets::{get_datasets, Dataset};
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_abstraction::{Record, RecordSource};
use tessera_reference::InMemorySource;

pub(crate) fn records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            let x = i as f32 / 4.0;
            Record::new(vec![x]).with_target("y", vec![2.0 * x + 1.0]).with_target("w", vec![x])
        })
        .collect()
}

pub(crate) fn toy_source(train: usize, val: usize) -> Arc<dyn RecordSource> {
    Arc::new(
        InMemorySource::new()
            .with_split("train", records(train))
            .with_split("val", records(val)),
    )
}

/// One dataset `toy` with input `x` and labels `y` and `w`.
pub(crate) fn toy_datasets() -> NamedMap<Dataset> {
    let data: DataConfig = serde_yaml::from_str(
        r"
datasets:
  toy:
    in:
      x: {shape: [1]}
      y: {shape: [1], label: true}
      w: {shape: [1], label: true}
",
    )
    .unwrap();
    let hp: HyperParameters = serde_yaml::from_str("dataset: {batch: 2}\nepochs: 1\n").unwrap();
    let mut raw = BTreeMap::new();
    raw.insert("toy".to_string(), toy_source(4, 2));
    get_datasets(&raw, &data, &hp, 0).unwrap()
}
