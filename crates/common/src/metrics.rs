use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    tasks_submitted: CounterVec,
    tasks_finished: CounterVec,
    task_time_seconds: HistogramVec,
    responses: CounterVec,
    stream_registrations: CounterVec,
    active_streams: GaugeVec,
    stream_reconnects: CounterVec,
    worker_pool_rejections: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// `role` is one of `root`, `intermediate`, `leaf`.
    pub fn record_task_submitted(&self, role: &str) {
        self.inner.tasks_submitted.with_label_values(&[role]).inc();
    }

    pub fn record_task_finished(&self, role: &str, ok: bool, secs: f64) {
        let outcome = if ok { "ok" } else { "error" };
        self.inner
            .tasks_finished
            .with_label_values(&[role, outcome])
            .inc();
        self.inner
            .task_time_seconds
            .with_label_values(&[role])
            .observe(secs.max(0.0));
    }

    /// Counts a response handed to the router; `routed` is false when no context claimed it.
    pub fn record_response(&self, routed: bool) {
        let outcome = if routed { "routed" } else { "dropped" };
        self.inner.responses.with_label_values(&[outcome]).inc();
    }

    pub fn record_stream_registered(&self, direction: &str) {
        self.inner
            .stream_registrations
            .with_label_values(&[direction])
            .inc();
        self.inner
            .active_streams
            .with_label_values(&[direction])
            .inc();
    }

    pub fn record_stream_deregistered(&self, direction: &str) {
        self.inner
            .active_streams
            .with_label_values(&[direction])
            .dec();
    }

    pub fn record_reconnect(&self, peer: &str) {
        self.inner
            .stream_reconnects
            .with_label_values(&[peer])
            .inc();
    }

    /// `reason` is one of `saturated`, `timeout`, `panic`.
    pub fn record_worker_rejection(&self, reason: &str) {
        self.inner
            .worker_pool_rejections
            .with_label_values(&[reason])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let tasks_submitted = counter_vec(
            &registry,
            "tsdq_tasks_submitted_total",
            "Task contexts registered with the task manager",
            &["role"],
        );
        let tasks_finished = counter_vec(
            &registry,
            "tsdq_tasks_finished_total",
            "Task contexts that reached a terminal state",
            &["role", "outcome"],
        );
        let task_time_seconds = histogram_vec(
            &registry,
            "tsdq_task_time_seconds",
            "Time from submit to terminal state",
            &["role"],
        );
        let responses = counter_vec(
            &registry,
            "tsdq_task_responses_total",
            "Task responses received on outbound streams",
            &["outcome"],
        );
        let stream_registrations = counter_vec(
            &registry,
            "tsdq_stream_registrations_total",
            "Stream registrations per direction",
            &["direction"],
        );
        let active_streams = gauge_vec(
            &registry,
            "tsdq_active_streams",
            "Currently registered streams",
            &["direction"],
        );
        let stream_reconnects = counter_vec(
            &registry,
            "tsdq_stream_reconnects_total",
            "Outbound stream reconnect attempts",
            &["peer"],
        );
        let worker_pool_rejections = counter_vec(
            &registry,
            "tsdq_worker_pool_rejections_total",
            "Tasks the worker pool did not complete normally",
            &["reason"],
        );

        Self {
            registry,
            tasks_submitted,
            tasks_finished,
            task_time_seconds,
            responses,
            stream_registrations,
            active_streams,
            stream_reconnects,
            worker_pool_rejections,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_task_submitted("root");
        m.record_task_finished("root", true, 0.01);
        let text = m.render_prometheus();
        assert!(text.contains("tsdq_tasks_submitted_total"));
        assert!(text.contains("tsdq_task_time_seconds"));
        assert!(text.contains("root"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_task_submitted("intermediate");
        m.record_task_finished("intermediate", false, 0.2);
        m.record_response(true);
        m.record_response(false);
        m.record_stream_registered("server");
        m.record_stream_deregistered("server");
        m.record_reconnect("1.1.1.1:9000");
        m.record_worker_rejection("panic");
        let text = m.render_prometheus();

        assert!(text.contains("tsdq_tasks_finished_total"));
        assert!(text.contains("tsdq_task_responses_total"));
        assert!(text.contains("dropped"));
        assert!(text.contains("tsdq_stream_registrations_total"));
        assert!(text.contains("tsdq_active_streams"));
        assert!(text.contains("tsdq_stream_reconnects_total"));
        assert!(text.contains("tsdq_worker_pool_rejections_total"));
    }
}
