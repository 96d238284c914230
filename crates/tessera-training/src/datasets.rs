//! Dataset bindings and single-pass split iterators.

use crate::config::{DataConfig, DatasetConfig, HyperParameters, NamedMap};
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tessera_abstraction::{Batch, Record, RecordSource, RecordStream};
use tracing::{debug, warn};

/// A configured dataset bound to its record source.
#[derive(Clone)]
pub struct Dataset {
    pub name: String,
    pub config: DatasetConfig,
    pub source: Arc<dyn RecordSource>,
    /// Splits served for this run, in declaration order.
    pub splits: Vec<String>,
    pub batch_size: usize,
    pub shuffle_buffer: Option<usize>,
    pub seed: u64,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("splits", &self.splits)
            .field("batch_size", &self.batch_size)
            .field("shuffle_buffer", &self.shuffle_buffer)
            .finish_non_exhaustive()
    }
}

impl Dataset {
    pub fn has_split(&self, split: &str) -> bool {
        self.splits.iter().any(|s| s == split)
    }
}

/// Binds every configured dataset to a raw source.
///
/// Declared splits must be offered by the source. A dataset that declares
/// no splits serves whatever its source offers.
pub fn get_datasets(
    raw: &BTreeMap<String, Arc<dyn RecordSource>>,
    data: &DataConfig,
    hyper_parameters: &HyperParameters,
    seed: u64,
) -> TrainingResult<NamedMap<Dataset>> {
    let mut datasets = NamedMap::new();

    for (name, config) in data.datasets.iter() {
        let Some(source) = raw.get(name) else {
            return Err(TrainingError::config(format!("no record source for dataset '{name}'")));
        };

        let offered = source.split_names();
        let splits: Vec<String> = if config.splits.is_empty() {
            offered
        } else {
            let declared: Vec<String> = config.splits.names().map(str::to_string).collect();
            if let Some(missing) = declared.iter().find(|s| !offered.contains(s)) {
                return Err(TrainingError::config(format!(
                    "dataset '{name}' declares split '{missing}' but its source offers {offered:?}"
                )));
            }
            declared
        };

        debug!(dataset = name, ?splits, "Bound dataset");
        datasets.insert(
            name,
            Dataset {
                name: name.to_string(),
                config: config.clone(),
                source: Arc::clone(source),
                splits,
                batch_size: hyper_parameters.dataset.batch,
                shuffle_buffer: hyper_parameters.dataset.shuffle_buffer.filter(|n| *n > 1),
                seed,
            },
        );
    }

    for name in raw.keys().filter(|n| !data.datasets.contains(n)) {
        warn!(dataset = %name, "Ignoring record source with no dataset configuration");
    }

    Ok(datasets)
}

struct ShuffleBuffer {
    capacity: usize,
    pending: Vec<Record>,
    rng: StdRng,
}

/// A finite, fused pass over one split, yielding batches.
///
/// Once exhausted it keeps returning `None` without touching the source.
pub struct BatchIterator {
    dataset: String,
    split: String,
    batch_size: usize,
    records: Option<RecordStream>,
    shuffle: Option<ShuffleBuffer>,
    batches: u64,
}

impl fmt::Debug for BatchIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchIterator")
            .field("dataset", &self.dataset)
            .field("split", &self.split)
            .field("batches", &self.batches)
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}

impl BatchIterator {
    /// Opens a pass over `split`. `epoch` perturbs the shuffle seed.
    pub fn open(dataset: &Dataset, split: &str, epoch: u64) -> TrainingResult<Self> {
        let records = dataset.source.open(split).map_err(|e| {
            TrainingError::Dataset(format!("cannot open {}/{split}: {e}", dataset.name))
        })?;
        let shuffle = dataset.shuffle_buffer.map(|capacity| ShuffleBuffer {
            capacity,
            pending: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(dataset.seed.wrapping_add(epoch)),
        });
        Ok(Self {
            dataset: dataset.name.clone(),
            split: split.to_string(),
            batch_size: dataset.batch_size,
            records: Some(records),
            shuffle,
            batches: 0,
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.records.is_none()
    }

    /// Batches yielded so far in this pass.
    pub fn batches_yielded(&self) -> u64 {
        self.batches
    }

    fn pull(&mut self) -> TrainingResult<Option<Record>> {
        let Some(records) = self.records.as_mut() else {
            return Ok(None);
        };
        records.next().transpose().map_err(|e| {
            TrainingError::Dataset(format!("{}/{}: {e}", self.dataset, self.split))
        })
    }

    fn next_record(&mut self) -> TrainingResult<Option<Record>> {
        if self.shuffle.is_none() {
            return self.pull();
        }
        loop {
            let full = self.shuffle.as_ref().is_some_and(|s| s.pending.len() >= s.capacity);
            if full {
                break;
            }
            match self.pull()? {
                Some(record) => {
                    if let Some(shuffle) = self.shuffle.as_mut() {
                        shuffle.pending.push(record);
                    }
                }
                None => break,
            }
        }
        let Some(shuffle) = self.shuffle.as_mut() else {
            return Ok(None);
        };
        if shuffle.pending.is_empty() {
            return Ok(None);
        }
        let idx = shuffle.rng.gen_range(0..shuffle.pending.len());
        Ok(Some(shuffle.pending.swap_remove(idx)))
    }

    /// The next batch, or `None` at the end of the split.
    pub fn next_batch(&mut self) -> TrainingResult<Option<Batch>> {
        if self.is_exhausted() {
            return Ok(None);
        }
        let mut records = Vec::with_capacity(self.batch_size);
        while records.len() < self.batch_size {
            match self.next_record()? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        if records.is_empty() {
            self.records = None;
            self.shuffle = None;
            return Ok(None);
        }
        let batch = Batch::from_records(&records).map_err(|e| {
            TrainingError::Dataset(format!("{}/{}: {e}", self.dataset, self.split))
        })?;
        self.batches += 1;
        Ok(Some(batch))
    }
}

/// Split iterators for one dataset, plus how often each split was restarted.
#[derive(Debug)]
pub struct SplitIterators {
    pub dataset: String,
    iterators: BTreeMap<String, BatchIterator>,
    restarts: BTreeMap<String, u64>,
}

impl SplitIterators {
    pub fn open(dataset: &Dataset) -> TrainingResult<Self> {
        let mut iterators = BTreeMap::new();
        for split in &dataset.splits {
            iterators.insert(split.clone(), BatchIterator::open(dataset, split, 0)?);
        }
        Ok(Self { dataset: dataset.name.clone(), iterators, restarts: BTreeMap::new() })
    }

    pub fn get_mut(&mut self, split: &str) -> Option<&mut BatchIterator> {
        self.iterators.get_mut(split)
    }

    pub fn contains(&self, split: &str) -> bool {
        self.iterators.contains_key(split)
    }

    pub fn restarts(&self, split: &str) -> u64 {
        self.restarts.get(split).copied().unwrap_or(0)
    }
}

/// One fresh single-pass iterator set per dataset.
pub fn convert_to_single_pass_iterator(
    datasets: &NamedMap<Dataset>,
) -> TrainingResult<NamedMap<SplitIterators>> {
    datasets
        .values()
        .map(|dataset| Ok((dataset.name.clone(), SplitIterators::open(dataset)?)))
        .collect()
}

/// `Some(batch)` while data remains, then `None` forever.
pub fn get_next_batch(iterator: &mut BatchIterator) -> TrainingResult<Option<Batch>> {
    iterator.next_batch()
}

/// Replaces the iterator for `split` with a fresh pass.
pub fn re_init_iter(
    dataset: &Dataset,
    iterators: &mut SplitIterators,
    split: &str,
) -> TrainingResult<()> {
    if !dataset.has_split(split) {
        return Err(TrainingError::Dataset(format!(
            "dataset '{}' has no split '{split}'",
            dataset.name
        )));
    }
    let restarts = iterators.restarts.entry(split.to_string()).or_insert(0);
    *restarts += 1;
    let fresh = BatchIterator::open(dataset, split, *restarts)?;
    iterators.iterators.insert(split.to_string(), fresh);
    Ok(())
}
