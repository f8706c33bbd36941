use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Metric names reported by the bridge.
pub mod names {
    /// Requests received from the peer (counter, labels: method).
    pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
    /// Responses carrying an `error` payload (counter, labels: method).
    pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
    /// Request/response latency in milliseconds (histogram, labels: method).
    pub const RPC_REQUEST_DURATION_MS: &str = "rpc_request_duration_ms";
    /// Bridge-level failures (counter, labels: type = send_failed | process).
    pub const BRIDGE_ERRORS_TOTAL: &str = "bridge_errors_total";
    /// Admitted peers currently connected (gauge).
    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
    /// Peers admitted (counter).
    pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
    /// Peers turned away because the session was taken (counter).
    pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
    /// Agent processes started (counter).
    pub const AGENT_PROCESSES_SPAWNED_TOTAL: &str = "agent_processes_spawned_total";
    /// Agent process exits observed (counter).
    pub const AGENT_PROCESS_EXITS_TOTAL: &str = "agent_process_exits_total";
}

/// Kind of series a sample came from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// One series as served from `/metrics`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    /// Counter/gauge value, or the histogram's p50.
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

/// Observations kept per histogram series for percentile estimates.
pub const HISTOGRAM_WINDOW: usize = 1024;

/// Count and sum over every observation; nearest-rank percentiles over the
/// most recent [`HISTOGRAM_WINDOW`] observations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct HistogramCell {
    recent: VecDeque<f64>,
    count: u64,
    sum: f64,
}

impl HistogramCell {
    fn observe(&mut self, value: f64) {
        if self.recent.len() == HISTOGRAM_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
        self.count = self.count.saturating_add(1);
        self.sum += value;
    }
}

/// Copy the window out under the lock and sort it after releasing.
fn summarize(cell: &Mutex<HistogramCell>) -> HistogramSummary {
    let (mut window, count, sum) = {
        let cell = cell.lock();
        (cell.recent.iter().copied().collect::<Vec<_>>(), cell.count, cell.sum)
    };
    let Some(last) = window.len().checked_sub(1) else {
        return HistogramSummary::default();
    };
    window.sort_by(f64::total_cmp);
    let rank = |q: f64| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let idx = (window.len() as f64 * q) as usize;
        window[idx.min(last)]
    };
    HistogramSummary {
        count,
        sum,
        p50: rank(0.5),
        p95: rank(0.95),
        p99: rank(0.99),
    }
}

/// Gauge value kept as raw `f64` bits.
#[derive(Default)]
struct GaugeCell(AtomicU64);

impl GaugeCell {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        // the closure never returns None, so the update always lands
        let _ = self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + delta).to_bits())
        });
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
        let mut labels: Vec<(String, String)> =
            labels.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())).collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

type Series<T> = RwLock<HashMap<SeriesKey, T>>;

/// Run `f` against the series for `key`, creating it on first use.
fn with_series<T: Default>(series: &Series<T>, key: SeriesKey, f: impl FnOnce(&T)) {
    if let Some(cell) = series.read().get(&key) {
        f(cell);
        return;
    }
    f(series.write().entry(key).or_default());
}

/// Thread-safe in-memory metrics recorder shared by every bridge task.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: Series<AtomicU64>,
    gauges: Series<GaugeCell>,
    histograms: Series<Mutex<HistogramCell>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_series(&self.counters, SeriesKey::new(name, labels), |c| {
            c.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(&self.gauges, SeriesKey::new(name, labels), |g| g.store(value));
    }

    /// Move a gauge by `delta`; an unseen gauge starts at zero.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        with_series(&self.gauges, SeriesKey::new(name, labels), |g| g.add(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(&self.histograms, SeriesKey::new(name, labels), |h| h.lock().observe(value));
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&SeriesKey::new(name, labels))
            .map(summarize)
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&SeriesKey::new(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .get(&SeriesKey::new(name, labels))
            .map_or(0.0, GaugeCell::load)
    }

    /// Every series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let timestamp = Utc::now().to_rfc3339();
        let sample = |key: &SeriesKey, metric_type, value, summary| MetricSample {
            timestamp: timestamp.clone(),
            name: key.name.clone(),
            labels: key.labels.iter().cloned().collect(),
            metric_type,
            value,
            summary,
        };

        let mut samples: Vec<MetricSample> = Vec::new();
        #[allow(clippy::cast_precision_loss)]
        samples.extend(self.counters.read().iter().map(|(key, c)| {
            sample(key, MetricType::Counter, c.load(Ordering::Relaxed) as f64, None)
        }));
        samples.extend(
            self.gauges
                .read()
                .iter()
                .map(|(key, g)| sample(key, MetricType::Gauge, g.load(), None)),
        );
        samples.extend(self.histograms.read().iter().map(|(key, h)| {
            let summary = summarize(h);
            sample(key, MetricType::Histogram, summary.p50, Some(summary))
        }));

        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::RPC_REQUESTS_TOTAL, &[("method", "initialize")], 1);
        recorder.counter_inc(names::RPC_REQUESTS_TOTAL, &[("method", "initialize")], 1);
        recorder.counter_inc(names::RPC_REQUESTS_TOTAL, &[("method", "session/new")], 1);

        assert_eq!(recorder.counter_get(names::RPC_REQUESTS_TOTAL, &[("method", "initialize")]), 2);
        assert_eq!(recorder.counter_get(names::RPC_REQUESTS_TOTAL, &[("method", "session/new")]), 1);
        assert_eq!(recorder.counter_get(names::RPC_REQUESTS_TOTAL, &[("method", "session/prompt")]), 0);
    }

    #[test]
    fn gauge_set_and_increment() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set(names::WS_CONNECTIONS_ACTIVE, &[], 10.0);
        assert_eq!(recorder.gauge_get(names::WS_CONNECTIONS_ACTIVE, &[]), 10.0);

        recorder.gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], 5.0);
        assert_eq!(recorder.gauge_get(names::WS_CONNECTIONS_ACTIVE, &[]), 15.0);

        recorder.gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], -3.0);
        assert_eq!(recorder.gauge_get(names::WS_CONNECTIONS_ACTIVE, &[]), 12.0);
    }

    #[test]
    fn gauge_can_go_negative_from_zero() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("updown", &[], -1.0);
        assert_eq!(recorder.gauge_get("updown", &[]), -1.0);
    }

    #[test]
    fn histogram_observations() {
        let recorder = MetricsRecorder::new();
        let labels = &[("method", "session/prompt")];

        // recorded out of order on purpose
        for ms in (1..=20).rev() {
            recorder.histogram_observe(names::RPC_REQUEST_DURATION_MS, labels, f64::from(ms));
        }

        let summary = recorder.histogram_summary(names::RPC_REQUEST_DURATION_MS, labels);
        assert_eq!(summary.count, 20);
        assert_eq!(summary.sum, 210.0);
        assert_eq!(summary.p50, 11.0);
        assert_eq!(summary.p95, 20.0);
        assert_eq!(summary.p99, 20.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        let total = HISTOGRAM_WINDOW + 500;
        // early slow samples age out of the window
        for i in 0..total {
            let ms = if i < 500 { 1_000.0 } else { 2.0 };
            recorder.histogram_observe(names::RPC_REQUEST_DURATION_MS, &[], ms);
        }

        let summary = recorder.histogram_summary(names::RPC_REQUEST_DURATION_MS, &[]);
        assert_eq!(summary.count, u64::try_from(total).unwrap());
        assert_eq!(summary.sum, 500.0 * 1_000.0 + HISTOGRAM_WINDOW as f64 * 2.0);
        assert_eq!(summary.p99, 2.0);

        let series = recorder.histograms.read();
        let cell = series.values().next().unwrap().lock();
        assert_eq!(cell.recent.len(), HISTOGRAM_WINDOW);
    }

    #[test]
    fn histogram_single_observation() {
        let recorder = MetricsRecorder::new();
        recorder.histogram_observe("one", &[], 7.0);
        let summary = recorder.histogram_summary("one", &[]);
        assert_eq!(summary.count, 1);
        assert_eq!(summary.p50, 7.0);
        assert_eq!(summary.p95, 7.0);
        assert_eq!(summary.p99, 7.0);
    }

    #[test]
    fn histogram_empty() {
        let recorder = MetricsRecorder::new();
        let summary = recorder.histogram_summary("nonexistent", &[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.sum, 0.0);
    }

    #[test]
    fn label_order_does_not_split_series() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::RPC_ERRORS_TOTAL, &[("method", "x"), ("code", "-32603")], 1);
        recorder.counter_inc(names::RPC_ERRORS_TOTAL, &[("code", "-32603"), ("method", "x")], 1);
        assert_eq!(recorder.snapshot().len(), 1);
        assert_eq!(recorder.counter_get(names::RPC_ERRORS_TOTAL, &[("method", "x"), ("code", "-32603")]), 2);
    }

    #[test]
    fn snapshot_covers_all_kinds() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::BRIDGE_ERRORS_TOTAL, &[("type", "send_failed")], 3);
        recorder.gauge_set(names::WS_CONNECTIONS_ACTIVE, &[], 1.0);
        recorder.histogram_observe(names::RPC_REQUEST_DURATION_MS, &[("method", "initialize")], 12.0);

        let samples = recorder.snapshot();
        assert_eq!(samples.len(), 3);

        let errors = samples.iter().find(|s| s.name == names::BRIDGE_ERRORS_TOTAL).unwrap();
        assert_eq!(errors.metric_type, MetricType::Counter);
        assert_eq!(errors.value, 3.0);
        assert_eq!(errors.labels["type"], "send_failed");

        let latency = samples.iter().find(|s| s.name == names::RPC_REQUEST_DURATION_MS).unwrap();
        assert_eq!(latency.metric_type, MetricType::Histogram);
        assert_eq!(latency.summary.as_ref().unwrap().count, 1);
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("zeta", &[], 1);
        recorder.counter_inc("alpha", &[], 1);
        let names: Vec<String> = recorder.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn sample_serializes_metric_type_snake_case() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set("g", &[], 2.0);
        let json = serde_json::to_value(&recorder.snapshot()).unwrap();
        assert_eq!(json[0]["metric_type"], "gauge");
        assert!(json[0].get("summary").is_none());
    }

    #[test]
    fn counters_survive_parallel_writers() {
        let recorder = std::sync::Arc::new(MetricsRecorder::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        recorder.counter_inc(names::WS_CONNECTIONS_TOTAL, &[], 1);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(recorder.counter_get(names::WS_CONNECTIONS_TOTAL, &[]), 4_000);
    }
}
