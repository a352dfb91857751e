//! Metrics collector (spec §4.10): counters, gauges, and a fixed-bucket
//! latency histogram, exposed as Prometheus text and a JSON snapshot.
//! Grounded on `caddy::enterprise::tracing::metrics::MetricRegistry`.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// `[0.1, 0.5, 1, 2, 5, 10, 25, 50, 100]` ms plus an implicit `+Inf` bucket.
pub const LATENCY_BUCKETS_MS: [f64; 9] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0];

#[derive(Clone)]
struct CounterMetric {
    help: String,
    value: Arc<RwLock<f64>>,
}

#[derive(Clone)]
struct GaugeMetric {
    help: String,
    value: Arc<RwLock<f64>>,
}

#[derive(Clone)]
struct HistogramMetric {
    help: String,
    buckets: Vec<f64>,
    observations: Arc<RwLock<Vec<f64>>>,
}

#[derive(Clone)]
enum Metric {
    Counter(CounterMetric),
    Gauge(GaugeMetric),
    Histogram(HistogramMetric),
}

#[derive(Clone)]
pub struct Counter {
    value: Arc<RwLock<f64>>,
}

impl Counter {
    pub fn inc(&self) {
        *self.value.write() += 1.0;
    }

    pub fn inc_by(&self, amount: f64) {
        *self.value.write() += amount;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

#[derive(Clone)]
pub struct Gauge {
    value: Arc<RwLock<f64>>,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        *self.value.write() = value;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

#[derive(Clone)]
pub struct Histogram {
    observations: Arc<RwLock<Vec<f64>>>,
}

impl Histogram {
    pub fn observe(&self, value: f64) {
        self.observations.write().push(value);
    }
}

/// Central registry for all counters/gauges/histograms in the core.
pub struct MetricRegistry {
    metrics: RwLock<HashMap<String, Metric>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn counter(&self, name: impl Into<String>, help: impl Into<String>) -> Counter {
        let name = name.into();
        let value = Arc::new(RwLock::new(0.0));
        self.metrics.write().insert(
            name,
            Metric::Counter(CounterMetric {
                help: help.into(),
                value: Arc::clone(&value),
            }),
        );
        Counter { value }
    }

    pub fn gauge(&self, name: impl Into<String>, help: impl Into<String>) -> Gauge {
        let name = name.into();
        let value = Arc::new(RwLock::new(0.0));
        self.metrics.write().insert(
            name,
            Metric::Gauge(GaugeMetric {
                help: help.into(),
                value: Arc::clone(&value),
            }),
        );
        Gauge { value }
    }

    pub fn histogram(&self, name: impl Into<String>, help: impl Into<String>, buckets: Vec<f64>) -> Histogram {
        let name = name.into();
        let observations = Arc::new(RwLock::new(Vec::new()));
        self.metrics.write().insert(
            name,
            Metric::Histogram(HistogramMetric {
                help: help.into(),
                buckets,
                observations: Arc::clone(&observations),
            }),
        );
        Histogram { observations }
    }

    /// Registers the L1/L2 counters and per-layer latency histograms this
    /// crate's cache and cache-invalidator subsystems report into.
    pub fn register_cache_metrics(&self) -> CacheMetrics {
        CacheMetrics {
            l1_hits: self.counter("cache_l1_hits_total", "L1 cache hits"),
            l1_misses: self.counter("cache_l1_misses_total", "L1 cache misses"),
            l1_sets: self.counter("cache_l1_sets_total", "L1 cache sets"),
            l1_deletes: self.counter("cache_l1_deletes_total", "L1 cache deletes"),
            l1_invalidations: self.counter("cache_l1_invalidations_total", "L1 pattern invalidations"),
            l1_size: self.gauge("cache_l1_size", "current L1 entry count"),
            l2_hits: self.counter("cache_l2_hits_total", "L2 cache hits"),
            l2_misses: self.counter("cache_l2_misses_total", "L2 cache misses"),
            l2_sets: self.counter("cache_l2_sets_total", "L2 cache sets"),
            l2_deletes: self.counter("cache_l2_deletes_total", "L2 cache deletes"),
            l2_invalidations: self.counter("cache_l2_invalidations_total", "L2 pattern invalidations"),
            l1_latency_ms: self.histogram("cache_l1_latency_ms", "L1 access latency", LATENCY_BUCKETS_MS.to_vec()),
            l2_latency_ms: self.histogram("cache_l2_latency_ms", "L2 access latency", LATENCY_BUCKETS_MS.to_vec()),
        }
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.read().keys().cloned().collect()
    }

    pub fn prometheus_export(&self) -> String {
        let mut output = String::new();
        let metrics = self.metrics.read();
        let mut names: Vec<&String> = metrics.keys().collect();
        names.sort();
        for name in names {
            let metric = &metrics[name];
            match metric {
                Metric::Counter(c) => {
                    output.push_str(&format!("# HELP {name} {}\n", c.help));
                    output.push_str(&format!("# TYPE {name} counter\n"));
                    output.push_str(&format!("{name} {}\n", *c.value.read()));
                }
                Metric::Gauge(g) => {
                    output.push_str(&format!("# HELP {name} {}\n", g.help));
                    output.push_str(&format!("# TYPE {name} gauge\n"));
                    output.push_str(&format!("{name} {}\n", *g.value.read()));
                }
                Metric::Histogram(h) => {
                    output.push_str(&format!("# HELP {name} {}\n", h.help));
                    output.push_str(&format!("# TYPE {name} histogram\n"));
                    let observations = h.observations.read();
                    let mut sum = 0.0;
                    let mut cumulative = vec![0u64; h.buckets.len()];
                    for &obs in observations.iter() {
                        sum += obs;
                        for (i, &bucket) in h.buckets.iter().enumerate() {
                            if obs <= bucket {
                                cumulative[i] += 1;
                            }
                        }
                    }
                    for (i, &bucket) in h.buckets.iter().enumerate() {
                        output.push_str(&format!("{name}_bucket{{le=\"{bucket}\"}} {}\n", cumulative[i]));
                    }
                    output.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", observations.len()));
                    output.push_str(&format!("{name}_sum {sum}\n"));
                    output.push_str(&format!("{name}_count {}\n", observations.len()));
                }
            }
            output.push('\n');
        }
        output
    }

    /// The JSON shape mirrors the Prometheus metric families one-for-one —
    /// spec §4.10 names both exports but only fixes the Prometheus bucket
    /// layout, so the JSON shape is this crate's supplement.
    pub fn json_snapshot(&self) -> MetricsSnapshot {
        let metrics = self.metrics.read();
        let mut counters = HashMap::new();
        let mut gauges = HashMap::new();
        let mut histograms = HashMap::new();
        for (name, metric) in metrics.iter() {
            match metric {
                Metric::Counter(c) => {
                    counters.insert(name.clone(), *c.value.read());
                }
                Metric::Gauge(g) => {
                    gauges.insert(name.clone(), *g.value.read());
                }
                Metric::Histogram(h) => {
                    let observations = h.observations.read();
                    let sum: f64 = observations.iter().sum();
                    histograms.insert(
                        name.clone(),
                        HistogramSnapshot {
                            count: observations.len() as u64,
                            sum,
                        },
                    );
                }
            }
        }
        MetricsSnapshot { counters, gauges, histograms }
    }
}

#[derive(Debug, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, f64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSnapshot>,
}

/// Convenience bundle of the cache-subsystem metrics, so `cache::*` call
/// sites don't look up metrics by string name on the hot path.
#[derive(Clone)]
pub struct CacheMetrics {
    pub l1_hits: Counter,
    pub l1_misses: Counter,
    pub l1_sets: Counter,
    pub l1_deletes: Counter,
    pub l1_invalidations: Counter,
    pub l1_size: Gauge,
    pub l2_hits: Counter,
    pub l2_misses: Counter,
    pub l2_sets: Counter,
    pub l2_deletes: Counter,
    pub l2_invalidations: Counter,
    pub l1_latency_ms: Histogram,
    pub l2_latency_ms: Histogram,
}

impl CacheMetrics {
    pub fn combined_hit_rate(&self) -> f64 {
        let hits = self.l1_hits.get() + self.l2_hits.get();
        let total = hits + self.l1_misses.get() + self.l2_misses.get();
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

/// Spawns the periodic snapshotter (spec §4.10, §5: "the timer must not
/// block process exit"). The returned handle can be aborted on shutdown;
/// dropping the registry's last `Arc` also lets the task observe closure
/// naturally since it only holds a weak-equivalent read lock per tick.
pub fn spawn_snapshotter(
    registry: Arc<MetricRegistry>,
    interval_ms: u64,
    on_snapshot: impl Fn(MetricsSnapshot) + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            on_snapshot(registry.json_snapshot());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let registry = MetricRegistry::new();
        let counter = registry.counter("requests_total", "total requests");
        counter.inc();
        counter.inc_by(4.0);
        assert_eq!(counter.get(), 5.0);
    }

    #[test]
    fn gauge_holds_latest_value() {
        let registry = MetricRegistry::new();
        let gauge = registry.gauge("queue_size", "pending queue size");
        gauge.set(3.0);
        gauge.set(7.0);
        assert_eq!(gauge.get(), 7.0);
    }

    #[test]
    fn histogram_buckets_are_cumulative_in_prometheus_export() {
        let registry = MetricRegistry::new();
        let histogram = registry.histogram("latency_ms", "latency", LATENCY_BUCKETS_MS.to_vec());
        histogram.observe(0.3);
        histogram.observe(3.0);
        let output = registry.prometheus_export();
        assert!(output.contains("latency_ms_bucket{le=\"0.5\"} 1"));
        assert!(output.contains("latency_ms_bucket{le=\"5\"} 2"));
        assert!(output.contains("latency_ms_count 2"));
    }

    #[test]
    fn json_snapshot_mirrors_prometheus_families() {
        let registry = MetricRegistry::new();
        registry.counter("c", "help").inc();
        registry.gauge("g", "help").set(2.0);
        let snapshot = registry.json_snapshot();
        assert_eq!(snapshot.counters.get("c"), Some(&1.0));
        assert_eq!(snapshot.gauges.get("g"), Some(&2.0));
    }

    #[test]
    fn combined_hit_rate_across_l1_and_l2() {
        let registry = MetricRegistry::new();
        let cache_metrics = registry.register_cache_metrics();
        cache_metrics.l1_hits.inc_by(3.0);
        cache_metrics.l2_hits.inc_by(1.0);
        cache_metrics.l1_misses.inc_by(1.0);
        assert!((cache_metrics.combined_hit_rate() - 0.8).abs() < 1e-9);
    }
}
