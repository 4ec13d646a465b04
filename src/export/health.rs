use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "topsql_mock";

/// Prometheus metrics describing fleet ingestion.
///
/// Each instance owns its registry, so tests can create as many as they like.
pub struct HealthMetrics {
    registry: Registry,

    /// Sessions opened, by stream kind.
    pub sessions_opened: CounterVec,
    /// Sessions that ended on a transport error, by stream kind.
    pub sessions_aborted: CounterVec,
    /// Sessions currently streaming.
    pub sessions_active: Gauge,
    /// Session lifetime, by stream kind.
    pub session_duration: HistogramVec,
    /// Batches applied to the store, by protocol.
    pub batches_ingested: CounterVec,
    /// Messages dropped, by protocol and reason.
    pub batches_dropped: CounterVec,
    /// Data points appended to the store.
    pub samples_ingested: Counter,
    /// Digest texts recorded, by kind.
    pub digests_linked: CounterVec,
}

impl HealthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sessions_opened = CounterVec::new(
            Opts::new("sessions_opened_total", "Total reporting sessions opened.")
                .namespace(NAMESPACE),
            &["stream"],
        )?;
        let sessions_aborted = CounterVec::new(
            Opts::new(
                "sessions_aborted_total",
                "Total reporting sessions ended by a transport error.",
            )
            .namespace(NAMESPACE),
            &["stream"],
        )?;
        let sessions_active = Gauge::with_opts(
            Opts::new("sessions_active", "Number of sessions currently streaming.")
                .namespace(NAMESPACE),
        )?;
        let session_duration = HistogramVec::new(
            HistogramOpts::new(
                "session_duration_seconds",
                "Reporting session lifetime by stream kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.1, 1.0, 10.0, 60.0, 600.0]),
            &["stream"],
        )?;
        let batches_ingested = CounterVec::new(
            Opts::new(
                "batches_ingested_total",
                "Total batches appended to the store by protocol.",
            )
            .namespace(NAMESPACE),
            &["protocol"],
        )?;
        let batches_dropped = CounterVec::new(
            Opts::new(
                "batches_dropped_total",
                "Total messages dropped by protocol and reason.",
            )
            .namespace(NAMESPACE),
            &["protocol", "reason"],
        )?;
        let samples_ingested = Counter::with_opts(
            Opts::new(
                "samples_ingested_total",
                "Total data points appended to the store.",
            )
            .namespace(NAMESPACE),
        )?;
        let digests_linked = CounterVec::new(
            Opts::new("digests_linked_total", "Total digest texts recorded by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;

        registry.register(Box::new(sessions_opened.clone()))?;
        registry.register(Box::new(sessions_aborted.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(session_duration.clone()))?;
        registry.register(Box::new(batches_ingested.clone()))?;
        registry.register(Box::new(batches_dropped.clone()))?;
        registry.register(Box::new(samples_ingested.clone()))?;
        registry.register(Box::new(digests_linked.clone()))?;

        Ok(Self {
            registry,
            sessions_opened,
            sessions_aborted,
            sessions_active,
            session_duration,
            batches_ingested,
            batches_dropped,
            samples_ingested,
            digests_linked,
        })
    }

    /// Renders every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
