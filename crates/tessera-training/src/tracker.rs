//! Tracker store: loss and metric aggregates per
//! (optimizer, objective, dataset, split) with cadence-gated emission.

use crate::config::{LossDescription, NamedMap};
use crate::datasets::Dataset;
use crate::objectives::Objective;
use crate::optimizers::{Meters, Optimizers};
use crate::telemetry::Telemetry;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    Loss,
    Metric,
}

impl TrackerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loss => "loss",
            Self::Metric => "metric",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TrackerKey {
    pub optimizer: String,
    pub objective: String,
    pub dataset: String,
    pub split: String,
    pub kind: TrackerKind,
}

/// Points kept per series. Older points only survive in the aggregates.
pub const SERIES_TAIL: usize = 256;

/// Rolling aggregate of emitted values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackedSeries {
    pub count: u64,
    pub last: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum: f64,
    /// The most recent `(step, value)` pairs in emission order, at most
    /// [`SERIES_TAIL`].
    pub points: VecDeque<(u64, f64)>,
}

impl TrackedSeries {
    pub fn record(&mut self, step: u64, value: f64) {
        self.count += 1;
        self.last = Some(value);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.sum += value;
        if self.points.len() == SERIES_TAIL {
            self.points.pop_front();
        }
        self.points.push_back((step, value));
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerEntry {
    /// One series per loss description or metric name.
    pub series: BTreeMap<String, TrackedSeries>,
    pub last_emitted_step: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerRecord {
    #[serde(flatten)]
    pub key: TrackerKey,
    pub entry: TrackerEntry,
}

#[derive(Debug, Clone, Default)]
pub struct TrackerStore {
    entries: BTreeMap<TrackerKey, TrackerEntry>,
    cadence: u64,
}

impl TrackerStore {
    /// Whether trackers update on this global step. A cadence of 0 never updates.
    pub fn should_update(&self, global_step: u64) -> bool {
        self.cadence > 0 && global_step % self.cadence == 0
    }

    pub fn cadence(&self) -> u64 {
        self.cadence
    }

    pub fn entry(&self, key: &TrackerKey) -> Option<&TrackerEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TrackerKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<TrackerRecord> {
        self.entries
            .iter()
            .map(|(key, entry)| TrackerRecord { key: key.clone(), entry: entry.clone() })
            .collect()
    }
}

/// Pre-populates an entry for every reachable combination and nothing else.
///
/// Reachable means the optimizer binds the objective, the objective reads the
/// dataset, and the split is a target split the dataset serves.
pub fn create_full_dict(
    optimizers: &Optimizers,
    objectives: &NamedMap<Objective>,
    datasets: &NamedMap<Dataset>,
    target_splits: &[&str],
    cadence: u64,
) -> TrackerStore {
    let mut entries = BTreeMap::new();

    for optimizer in optimizers.iter() {
        for objective_name in &optimizer.objectives {
            let Some(objective) = objectives.get(objective_name) else { continue };
            let Some(dataset) = datasets.get(objective.dataset()) else { continue };

            for split in target_splits.iter().filter(|s| dataset.has_split(s)) {
                let key = |kind| TrackerKey {
                    optimizer: optimizer.name.clone(),
                    objective: objective.name.clone(),
                    dataset: dataset.name.clone(),
                    split: (*split).to_string(),
                    kind,
                };

                let loss_series = objective
                    .loss_config
                    .tracked_on(split)
                    .iter()
                    .map(|d| (d.as_str().to_string(), TrackedSeries::default()))
                    .collect();
                entries.insert(
                    key(TrackerKind::Loss),
                    TrackerEntry { series: loss_series, last_emitted_step: None },
                );

                if !objective.metrics.is_empty() {
                    let metric_series = objective
                        .tracked_metrics(split)
                        .into_iter()
                        .map(|name| (name, TrackedSeries::default()))
                        .collect();
                    entries.insert(
                        key(TrackerKind::Metric),
                        TrackerEntry { series: metric_series, last_emitted_step: None },
                    );
                }
            }
        }
    }

    TrackerStore { entries, cadence }
}

/// Identifies which tracker entry an update belongs to.
#[derive(Debug, Clone, Copy)]
pub struct TrackingContext<'a> {
    pub optimizer: &'a str,
    pub objective: &'a str,
    pub dataset: &'a str,
    pub split: &'a str,
    /// Optimizer example step used as the telemetry x-axis.
    pub step: u64,
    pub global_step: u64,
}

impl TrackingContext<'_> {
    fn key(&self, kind: TrackerKind) -> TrackerKey {
        TrackerKey {
            optimizer: self.optimizer.to_string(),
            objective: self.objective.to_string(),
            dataset: self.dataset.to_string(),
            split: self.split.to_string(),
            kind,
        }
    }

    pub fn tag(&self, kind: TrackerKind, name: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}/{name}",
            self.split,
            self.dataset,
            self.objective,
            self.optimizer,
            kind.as_str()
        )
    }
}

fn emit(
    store: &mut TrackerStore,
    ctx: &TrackingContext<'_>,
    kind: TrackerKind,
    values: Vec<(String, f64)>,
    telemetry: &mut Telemetry,
) -> usize {
    let key = ctx.key(kind);
    let Some(entry) = store.entries.get_mut(&key) else {
        warn!(?key, "No tracker entry for update");
        return 0;
    };

    let mut emitted = 0;
    for (name, value) in values {
        entry.series.entry(name.clone()).or_default().record(ctx.step, value);
        telemetry.scalar(&ctx.tag(kind, &name), value, ctx.step);
        emitted += 1;
    }
    if emitted > 0 {
        entry.last_emitted_step = Some(ctx.step);
        trace!(?key, emitted, step = ctx.step, "Updated tracker");
    }
    emitted
}

/// Records the tracked loss aggregates and emits them. Returns the number of values recorded.
pub fn update_loss_trackers(
    store: &mut TrackerStore,
    ctx: &TrackingContext<'_>,
    descriptions: &[LossDescription],
    meters: &Meters,
    telemetry: &mut Telemetry,
) -> usize {
    let values = descriptions
        .iter()
        .filter_map(|d| meters.loss_value(*d).map(|v| (d.as_str().to_string(), v)))
        .collect();
    emit(store, ctx, TrackerKind::Loss, values, telemetry)
}

/// Records the tracked metric results and emits them. Returns the number of values recorded.
pub fn update_metrics_tracking(
    store: &mut TrackerStore,
    ctx: &TrackingContext<'_>,
    metric_names: &[String],
    meters: &Meters,
    telemetry: &mut Telemetry,
) -> usize {
    let values = metric_names
        .iter()
        .filter_map(|name| meters.metric_value(name).map(|v| (name.clone(), v)))
        .collect();
    emit(store, ctx, TrackerKind::Metric, values, telemetry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptimizeConfig, PerformanceConfig};
    use crate::objectives::build_objectives;
    use crate::optimizers::build_optimizers;
    use crate::telemetry::MemoryTelemetrySink;
    use crate::testing::toy_datasets;
    use std::collections::BTreeSet;
    use tessera_reference::ReferenceFactory;

    const SPLITS: [&str; 2] = ["train", "val"];

    fn setup(optimize: &str) -> (NamedMap<Objective>, Optimizers, NamedMap<Dataset>) {
        let perf: PerformanceConfig = serde_yaml::from_str(
            r"
objectives:
  a:
    loss: {type: mse, track: {train: [mean, last], val: [mean]}}
    metrics: [{type: mae, track: [train]}]
    in_config: {type: supervised, dataset: toy, options: {prediction: out, target: y}}
  b:
    loss: {type: mae, track: {train: [mean]}}
    in_config: {type: supervised, dataset: toy, options: {prediction: out, target: w}}
",
        )
        .unwrap();
        let datasets = toy_datasets();
        let objectives = build_objectives(&perf, &datasets, &SPLITS, &ReferenceFactory).unwrap();
        let config: OptimizeConfig = serde_yaml::from_str(optimize).unwrap();
        let optimizers = build_optimizers(&config, &objectives, &SPLITS, &ReferenceFactory).unwrap();
        (objectives, optimizers, datasets)
    }

    #[test]
    fn test_entries_exactly_match_bindings() {
        let (objectives, optimizers, datasets) = setup(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}, objectives: [a]}\n  o2: {type: sgd, options: {learning_rate: 0.1}, objectives: [b]}\n",
        );
        let store = create_full_dict(&optimizers, &objectives, &datasets, &SPLITS, 1);

        let got: BTreeSet<(String, String, String, TrackerKind)> = store
            .keys()
            .map(|k| (k.optimizer.clone(), k.objective.clone(), k.split.clone(), k.kind))
            .collect();
        let mut expected: BTreeSet<(String, String, String, TrackerKind)> = BTreeSet::new();
        for split in SPLITS {
            expected.insert(("o1".into(), "a".into(), split.into(), TrackerKind::Loss));
            expected.insert(("o1".into(), "a".into(), split.into(), TrackerKind::Metric));
            expected.insert(("o2".into(), "b".into(), split.into(), TrackerKind::Loss));
        }
        assert_eq!(got, expected);
        assert!(store.keys().all(|k| k.dataset == "toy"));
    }

    #[test]
    fn test_cadence() {
        let store = TrackerStore { entries: BTreeMap::new(), cadence: 0 };
        assert!(!(1..10).any(|s| store.should_update(s)));
        let store = TrackerStore { entries: BTreeMap::new(), cadence: 3 };
        assert_eq!((1..10).filter(|s| store.should_update(*s)).collect::<Vec<_>>(), vec![3, 6, 9]);
    }

    #[test]
    fn test_updates_record_and_emit() {
        let (objectives, mut optimizers, datasets) =
            setup("optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\n");
        let mut store = create_full_dict(&optimizers, &objectives, &datasets, &SPLITS, 1);
        let sink = MemoryTelemetrySink::new();
        let handle = sink.clone();
        let mut telemetry = Telemetry::new(Box::new(sink));

        let meters = optimizers.get_mut("o1").unwrap().meters_mut("a", "train").unwrap();
        meters.record_loss(2.0);
        meters.record_loss(4.0);

        let ctx = TrackingContext {
            optimizer: "o1",
            objective: "a",
            dataset: "toy",
            split: "train",
            step: 8,
            global_step: 2,
        };
        let a = objectives.get("a").unwrap();
        let meters = optimizers.get("o1").unwrap().meters("a", "train").unwrap();
        let n = update_loss_trackers(&mut store, &ctx, a.loss_config.tracked_on("train"), meters, &mut telemetry);
        assert_eq!(n, 2);
        // Metrics without a result are skipped.
        let m = update_metrics_tracking(&mut store, &ctx, &a.tracked_metrics("train"), meters, &mut telemetry);
        assert_eq!(m, 0);

        let entry = store.entry(&ctx.key(TrackerKind::Loss)).unwrap();
        assert_eq!(entry.last_emitted_step, Some(8));
        assert_eq!(entry.series["mean"].last, Some(3.0));
        assert_eq!(entry.series["last"].last, Some(4.0));

        let tags: Vec<String> = handle.events().iter().map(|e| e.tag().to_string()).collect();
        assert_eq!(tags, vec!["train/toy/a/o1/loss/mean", "train/toy/a/o1/loss/last"]);
    }

    #[test]
    fn test_missing_entry_is_not_an_error() {
        let mut store = TrackerStore::default();
        let ctx = TrackingContext {
            optimizer: "x",
            objective: "y",
            dataset: "z",
            split: "train",
            step: 1,
            global_step: 1,
        };
        let meters = Meters::new(Vec::new());
        let mut telemetry = Telemetry::disabled();
        assert_eq!(update_loss_trackers(&mut store, &ctx, &[LossDescription::Mean], &meters, &mut telemetry), 0);
    }

    #[test]
    fn test_series_aggregates() {
        let mut s = TrackedSeries::default();
        s.record(1, 3.0);
        s.record(2, 1.0);
        assert_eq!(s.min, Some(1.0));
        assert_eq!(s.max, Some(3.0));
        assert_eq!(s.mean(), Some(2.0));
        assert_eq!(s.points, vec![(1, 3.0), (2, 1.0)]);
    }

    #[test]
    fn test_series_keeps_bounded_tail() {
        let mut s = TrackedSeries::default();
        let total = SERIES_TAIL as u64 + 10;
        for step in 1..=total {
            s.record(step, step as f64);
        }
        assert_eq!(s.count, total);
        assert_eq!(s.points.len(), SERIES_TAIL);
        assert_eq!(s.points.front(), Some(&(11, 11.0)));
        assert_eq!(s.points.back(), Some(&(total, total as f64)));
        assert_eq!(s.min, Some(1.0));
        assert_eq!(s.mean(), Some((total + 1) as f64 / 2.0));
    }
}
