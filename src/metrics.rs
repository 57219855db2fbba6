//! Engine-owned metrics.
//!
//! A cheaply clonable handle over atomics; the engine creates one and
//! passes it into components explicitly. Meters only ever increase, gauges
//! are observable reads, timers accumulate call counts and wall time.
//! `snapshot` produces a plain value for reporters and tests; the default
//! reporting path logs the snapshot through the engine's logger.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
pub struct Meter(AtomicU64);

impl Meter {
    pub fn mark(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn update(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Timer {
    count: AtomicU64,
    total_micros: AtomicU64,
}

impl Timer {
    /// Times the enclosing scope; the measurement lands when the guard
    /// drops.
    pub fn time(&self) -> TimerGuard {
        TimerGuard {
            timer: self,
            start: Instant::now(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total_micros(&self) -> u64 {
        self.total_micros.load(Ordering::Relaxed)
    }
}

pub struct TimerGuard<'a> {
    timer: &'a Timer,
    start: Instant,
}

impl<'a> Drop for TimerGuard<'a> {
    fn drop(&mut self) {
        self.timer.count.fetch_add(1, Ordering::Relaxed);
        self.timer
            .total_micros
            .fetch_add(self.start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }
}

struct Inner {
    backups_created: Timer,
    backups_restored: Timer,
    backups_deleted: Meter,
    states_deleted: Meter,
    state_committed: Timer,
    records_consumed: Meter,
    records_consumed_by_topic: HashMap<String, Meter>,
    records_created: Meter,
    records_created_by_topic: HashMap<String, Meter>,
    records_to_create: Gauge,
    records_to_create_by_topic: HashMap<String, Gauge>,
    topic_lag: Gauge,
    topic_lag_by_topic: HashMap<String, Gauge>,
}

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

impl Metrics {
    /// Registrations are fixed up front: one consumed/lag pair per input
    /// entity, one created/pending pair per output name.
    pub fn new<'a>(
        inputs: impl IntoIterator<Item = &'a str>,
        outputs: impl IntoIterator<Item = &'a str>,
    ) -> Metrics {
        let mut consumed = HashMap::new();
        let mut lag = HashMap::new();
        for name in inputs {
            consumed.insert(name.to_string(), Meter::default());
            lag.insert(name.to_string(), Gauge::default());
        }
        let mut created = HashMap::new();
        let mut pending = HashMap::new();
        for name in outputs {
            created.insert(name.to_string(), Meter::default());
            pending.insert(name.to_string(), Gauge::default());
        }
        Metrics {
            inner: Arc::new(Inner {
                backups_created: Timer::default(),
                backups_restored: Timer::default(),
                backups_deleted: Meter::default(),
                states_deleted: Meter::default(),
                state_committed: Timer::default(),
                records_consumed: Meter::default(),
                records_consumed_by_topic: consumed,
                records_created: Meter::default(),
                records_created_by_topic: created,
                records_to_create: Gauge::default(),
                records_to_create_by_topic: pending,
                topic_lag: Gauge::default(),
                topic_lag_by_topic: lag,
            }),
        }
    }

    pub fn record_consumed(&self, entity: &str) {
        self.inner.records_consumed.mark(1);
        if let Some(meter) = self.inner.records_consumed_by_topic.get(entity) {
            meter.mark(1);
        }
    }

    pub fn record_created(&self, output: &str) {
        self.inner.records_created.mark(1);
        if let Some(meter) = self.inner.records_created_by_topic.get(output) {
            meter.mark(1);
        }
    }

    pub fn update_pending(&self, output: &str, value: u64) {
        if let Some(gauge) = self.inner.records_to_create_by_topic.get(output) {
            gauge.update(value);
        }
    }

    pub fn update_total_pending(&self, value: u64) {
        self.inner.records_to_create.update(value);
    }

    pub fn update_lag(&self, entity: &str, value: u64) {
        if let Some(gauge) = self.inner.topic_lag_by_topic.get(entity) {
            gauge.update(value);
        }
    }

    pub fn update_total_lag(&self, value: u64) {
        self.inner.topic_lag.update(value);
    }

    pub fn backups_created(&self) -> &Timer {
        &self.inner.backups_created
    }

    pub fn backups_restored(&self) -> &Timer {
        &self.inner.backups_restored
    }

    pub fn backups_deleted(&self) -> &Meter {
        &self.inner.backups_deleted
    }

    pub fn states_deleted(&self) -> &Meter {
        &self.inner.states_deleted
    }

    pub fn state_committed(&self) -> &Timer {
        &self.inner.state_committed
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            backups_created: inner.backups_created.count(),
            backups_restored: inner.backups_restored.count(),
            backups_deleted: inner.backups_deleted.count(),
            states_deleted: inner.states_deleted.count(),
            state_commits: inner.state_committed.count(),
            records_consumed: inner.records_consumed.count(),
            records_consumed_by_topic: counts(&inner.records_consumed_by_topic),
            records_created: inner.records_created.count(),
            records_created_by_topic: counts(&inner.records_created_by_topic),
            records_to_create: inner.records_to_create.value(),
            records_to_create_by_topic: values(&inner.records_to_create_by_topic),
            topic_lag: inner.topic_lag.value(),
            topic_lag_by_topic: values(&inner.topic_lag_by_topic),
        }
    }
}

fn counts(meters: &HashMap<String, Meter>) -> BTreeMap<String, u64> {
    meters
        .iter()
        .map(|(name, meter)| (name.clone(), meter.count()))
        .collect()
}

fn values(gauges: &HashMap<String, Gauge>) -> BTreeMap<String, u64> {
    gauges
        .iter()
        .map(|(name, gauge)| (name.clone(), gauge.value()))
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub backups_created: u64,
    pub backups_restored: u64,
    pub backups_deleted: u64,
    pub states_deleted: u64,
    pub state_commits: u64,
    pub records_consumed: u64,
    pub records_consumed_by_topic: BTreeMap<String, u64>,
    pub records_created: u64,
    pub records_created_by_topic: BTreeMap<String, u64>,
    pub records_to_create: u64,
    pub records_to_create_by_topic: BTreeMap<String, u64>,
    pub topic_lag: u64,
    pub topic_lag_by_topic: BTreeMap<String, u64>,
}
