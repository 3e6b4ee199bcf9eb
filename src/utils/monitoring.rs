use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use prometheus::{CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use rand::Rng;
use serde::Serialize;
use serde_json::json;

/// Bounded latency sample reservoir. Keeps `CAPACITY` samples (random
/// replacement once full) so percentile queries stay O(n log n) over a fixed
/// n regardless of traffic volume.
#[derive(Debug, Default, Clone)]
struct LatencyReservoir {
    samples: Vec<f64>,
    observed: u64,
}

impl LatencyReservoir {
    const CAPACITY: usize = 2048;

    fn record(&mut self, value_ms: f64) {
        self.observed += 1;
        if self.samples.len() < Self::CAPACITY {
            self.samples.push(value_ms);
        } else {
            let slot = rand::thread_rng().gen_range(0..Self::CAPACITY);
            self.samples[slot] = value_ms;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }
}

/// Percentile summary for one latency series.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl From<&LatencyReservoir> for LatencySummary {
    fn from(r: &LatencyReservoir) -> Self {
        Self {
            count: r.observed,
            p50_ms: r.percentile(50.0),
            p95_ms: r.percentile(95.0),
            p99_ms: r.percentile(99.0),
        }
    }
}

#[derive(Debug, Default)]
struct SendSeries {
    total: LatencyReservoir,
    telegram: LatencyReservoir,
}

/// Per-process send-pipeline metrics.
///
/// Prometheus counters/histograms carry the machine-readable export; the
/// reservoirs back the JSON percentile summaries the admin surface returns,
/// keyed `<slug>:<purpose>`.
pub struct SendMetrics {
    registry: Registry,

    pub attempts_total: CounterVec,
    pub sends_ok_total: CounterVec,
    pub sends_err_total: CounterVec,
    pub rate_limited_total: CounterVec,
    pub cache_hits_total: CounterVec,
    pub cache_misses_total: CounterVec,
    pub send_latency: HistogramVec,
    pub telegram_latency: HistogramVec,
    pub webhook_ack_latency: Histogram,
    pub start_first_send_latency: Histogram,

    series: RwLock<HashMap<String, SendSeries>>,
    ack_series: RwLock<LatencyReservoir>,
    first_send_series: RwLock<LatencyReservoir>,
    started_at: Instant,
}

impl SendMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let attempts_total = CounterVec::new(
            Opts::new("botgate_send_attempts_total", "Telegram send attempts"),
            &["slug", "purpose"],
        )?;
        registry.register(Box::new(attempts_total.clone()))?;

        let sends_ok_total = CounterVec::new(
            Opts::new("botgate_sends_ok_total", "Successful send operations"),
            &["slug", "purpose"],
        )?;
        registry.register(Box::new(sends_ok_total.clone()))?;

        let sends_err_total = CounterVec::new(
            Opts::new("botgate_sends_err_total", "Failed send operations"),
            &["slug", "purpose", "code"],
        )?;
        registry.register(Box::new(sends_err_total.clone()))?;

        let rate_limited_total = CounterVec::new(
            Opts::new(
                "botgate_telegram_429_total",
                "HTTP 429 responses from Telegram",
            ),
            &["slug", "purpose"],
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let cache_hits_total = CounterVec::new(
            Opts::new("botgate_media_cache_hits_total", "file_id cache hits"),
            &["slug"],
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let cache_misses_total = CounterVec::new(
            Opts::new(
                "botgate_media_cache_misses_total",
                "file_id cache misses resolved by in-band upload",
            ),
            &["slug"],
        )?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        let send_latency = HistogramVec::new(
            HistogramOpts::new(
                "botgate_send_latency_seconds",
                "End-to-end send operation latency",
            ),
            &["slug", "purpose"],
        )?;
        registry.register(Box::new(send_latency.clone()))?;

        let telegram_latency = HistogramVec::new(
            HistogramOpts::new(
                "botgate_telegram_latency_seconds",
                "Telegram Bot API HTTP latency",
            ),
            &["slug", "purpose"],
        )?;
        registry.register(Box::new(telegram_latency.clone()))?;

        let webhook_ack_latency = Histogram::with_opts(
            HistogramOpts::new(
                "botgate_webhook_ack_seconds",
                "Webhook arrival-to-ACK latency",
            )
            .buckets(vec![0.0005, 0.001, 0.002, 0.005, 0.01, 0.025, 0.1]),
        )?;
        registry.register(Box::new(webhook_ack_latency.clone()))?;

        let start_first_send_latency = Histogram::with_opts(HistogramOpts::new(
            "botgate_start_first_send_seconds",
            "Webhook arrival to first /start send completion",
        ))?;
        registry.register(Box::new(start_first_send_latency.clone()))?;

        Ok(Self {
            registry,
            attempts_total,
            sends_ok_total,
            sends_err_total,
            rate_limited_total,
            cache_hits_total,
            cache_misses_total,
            send_latency,
            telegram_latency,
            webhook_ack_latency,
            start_first_send_latency,
            series: RwLock::new(HashMap::new()),
            ack_series: RwLock::new(LatencyReservoir::default()),
            first_send_series: RwLock::new(LatencyReservoir::default()),
            started_at: Instant::now(),
        })
    }

    fn series_key(slug: &str, purpose: &str) -> String {
        format!("{}:{}", slug, purpose)
    }

    pub fn record_attempt(&self, slug: &str, purpose: &str) {
        self.attempts_total.with_label_values(&[slug, purpose]).inc();
    }

    pub fn record_rate_limited(&self, slug: &str, purpose: &str) {
        self.rate_limited_total
            .with_label_values(&[slug, purpose])
            .inc();
    }

    pub fn record_cache_hit(&self, slug: &str) {
        self.cache_hits_total.with_label_values(&[slug]).inc();
    }

    pub fn record_cache_miss(&self, slug: &str) {
        self.cache_misses_total.with_label_values(&[slug]).inc();
    }

    /// Record a finished send operation, successful or not.
    pub fn record_send(
        &self,
        slug: &str,
        purpose: &str,
        error_code: Option<&str>,
        total_ms: u64,
        telegram_ms: Option<u64>,
    ) {
        match error_code {
            None => self.sends_ok_total.with_label_values(&[slug, purpose]).inc(),
            Some(code) => self
                .sends_err_total
                .with_label_values(&[slug, purpose, code])
                .inc(),
        }
        self.send_latency
            .with_label_values(&[slug, purpose])
            .observe(total_ms as f64 / 1000.0);
        if let Some(tg_ms) = telegram_ms {
            self.telegram_latency
                .with_label_values(&[slug, purpose])
                .observe(tg_ms as f64 / 1000.0);
        }

        let key = Self::series_key(slug, purpose);
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        let entry = series.entry(key).or_default();
        entry.total.record(total_ms as f64);
        if let Some(tg_ms) = telegram_ms {
            entry.telegram.record(tg_ms as f64);
        }
    }

    pub fn record_webhook_ack(&self, elapsed_ms: f64) {
        self.webhook_ack_latency.observe(elapsed_ms / 1000.0);
        self.ack_series
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .record(elapsed_ms);
    }

    pub fn record_start_first_send(&self, elapsed_ms: f64) {
        self.start_first_send_latency.observe(elapsed_ms / 1000.0);
        self.first_send_series
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .record(elapsed_ms);
    }

    fn counter_value(vec: &CounterVec, labels: &[&str]) -> u64 {
        vec.get_metric_with_label_values(labels)
            .map(|c| c.get() as u64)
            .unwrap_or(0)
    }

    /// JSON summary for `/api/admin/metrics/send`, keyed `<slug>:<purpose>`.
    pub fn send_summary(&self) -> serde_json::Value {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        let mut out = serde_json::Map::new();
        for (key, s) in series.iter() {
            let (slug, purpose) = key.split_once(':').unwrap_or((key.as_str(), ""));
            out.insert(
                key.clone(),
                json!({
                    "attempts": Self::counter_value(&self.attempts_total, &[slug, purpose]),
                    "ok": Self::counter_value(&self.sends_ok_total, &[slug, purpose]),
                    "rate_limited": Self::counter_value(&self.rate_limited_total, &[slug, purpose]),
                    "latency": LatencySummary::from(&s.total),
                    "telegram_latency": LatencySummary::from(&s.telegram),
                }),
            );
        }
        serde_json::Value::Object(out)
    }

    /// JSON summary for `/api/admin/metrics/all`.
    pub fn full_summary(&self) -> serde_json::Value {
        let ack = self.ack_series.read().unwrap_or_else(|e| e.into_inner());
        let first = self
            .first_send_series
            .read()
            .unwrap_or_else(|e| e.into_inner());
        json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "webhook_ack": LatencySummary::from(&*ack),
            "start_first_send": LatencySummary::from(&*first),
            "send": self.send_summary(),
        })
    }

    /// Prometheus exposition text, for scrapers.
    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_percentiles() {
        let mut r = LatencyReservoir::default();
        for v in 1..=100 {
            r.record(v as f64);
        }
        assert_eq!(r.observed, 100);
        assert!((r.percentile(50.0) - 50.0).abs() <= 1.0);
        assert!(r.percentile(99.0) >= 98.0);
    }

    #[test]
    fn reservoir_stays_bounded() {
        let mut r = LatencyReservoir::default();
        for v in 0..10_000 {
            r.record(v as f64);
        }
        assert_eq!(r.samples.len(), LatencyReservoir::CAPACITY);
        assert_eq!(r.observed, 10_000);
    }

    #[test]
    fn send_summary_keyed_by_slug_and_purpose() {
        let metrics = SendMetrics::new().unwrap();
        metrics.record_attempt("acme", "start");
        metrics.record_send("acme", "start", None, 120, Some(80));
        metrics.record_send("acme", "shot", Some("CHAT_NOT_FOUND"), 45, Some(40));

        let summary = metrics.send_summary();
        let start = &summary["acme:start"];
        assert_eq!(start["attempts"], 1);
        assert_eq!(start["ok"], 1);
        assert_eq!(start["latency"]["count"], 1);
        assert_eq!(summary["acme:shot"]["ok"], 0);
    }

    #[test]
    fn error_codes_are_labelled() {
        let metrics = SendMetrics::new().unwrap();
        metrics.record_send("acme", "downsell", Some("FORBIDDEN"), 30, None);
        let errs = SendMetrics::counter_value(
            &metrics.sends_err_total,
            &["acme", "downsell", "FORBIDDEN"],
        );
        assert_eq!(errs, 1);
    }
}
