use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Histograms keep only the most recent observations.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

struct Counter(AtomicU64);

impl Counter {
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// f64 stored as raw bits so it can be updated atomically.
struct Gauge(AtomicI64);

impl Gauge {
    fn set(&self, v: f64) {
        self.0.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits as u64) + delta).to_bits() as i64)
            });
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed) as u64)
    }
}

struct Histogram {
    total_count: AtomicU64,
    window: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            total_count: AtomicU64::new(0),
            window: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    fn observe(&self, value: f64) {
        self.total_count.fetch_add(1, Ordering::Relaxed);
        let mut window = self.window.lock();
        if window.len() == HISTOGRAM_WINDOW {
            window.pop_front();
        }
        window.push_back(value);
    }

    /// Percentiles are computed over the retained window; `count` is lifetime.
    fn summary(&self) -> HistogramSummary {
        let mut values: Vec<f64> = self.window.lock().iter().copied().collect();
        if values.is_empty() {
            return HistogramSummary::default();
        }
        values.sort_by(f64::total_cmp);
        let n = values.len();
        let pick = |q: f64| values[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.total_count.load(Ordering::Relaxed),
            sum: values.iter().sum(),
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }
}

/// Series identity: metric name plus labels sorted by key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// Thread-safe in-process metrics registry.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<SeriesKey, Counter>>,
    gauges: RwLock<HashMap<SeriesKey, Gauge>>,
    histograms: RwLock<HashMap<SeriesKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = SeriesKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.add(n);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| Counter(AtomicU64::new(0)))
            .add(n);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.set(value);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| Gauge(AtomicI64::new(0)))
            .set(value);
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = SeriesKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.add(delta);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| Gauge(AtomicI64::new(0)))
            .add(delta);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = SeriesKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = SeriesKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = SeriesKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Export every series. Histograms report p50 as `value` and carry the full summary.
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let now = Utc::now().to_rfc3339();
        let mut out = Vec::new();

        for (key, c) in self.counters.read().iter() {
            out.push(MetricsSnapshot {
                timestamp: now.clone(),
                name: key.name.clone(),
                value: c.get() as f64,
                labels: key.label_map(),
                metric_type: MetricType::Counter,
                summary: None,
            });
        }
        for (key, g) in self.gauges.read().iter() {
            out.push(MetricsSnapshot {
                timestamp: now.clone(),
                name: key.name.clone(),
                value: g.get(),
                labels: key.label_map(),
                metric_type: MetricType::Gauge,
                summary: None,
            });
        }
        for (key, h) in self.histograms.read().iter() {
            let summary = h.summary();
            out.push(MetricsSnapshot {
                timestamp: now.clone(),
                name: key.name.clone(),
                value: summary.p50,
                labels: key.label_map(),
                metric_type: MetricType::Histogram,
                summary: Some(summary),
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}
