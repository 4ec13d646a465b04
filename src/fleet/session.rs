use std::sync::Arc;
use std::time::Instant;

use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, info, warn};

use crate::decode::{self, Decoded, Report};
use crate::export::health::HealthMetrics;
use crate::model::{DigestKind, DigestRegistry, IngestError, TimeSeriesData};

/// Reporting protocol, which also names the simulated node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Direct digests, SQL-layer reporters.
    TiDb,
    /// Digests inside a resource tag, storage-layer reporters.
    TiKv,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TiDb => "tidb",
            Self::TiKv => "tikv",
        }
    }

    /// Synthetic instance id for a fleet member listening on `port`.
    pub fn instance(&self, port: u16) -> String {
        format!("{}-{port}", self.as_str())
    }
}

/// The client-streaming RPCs a session can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    SqlMeta,
    PlanMeta,
    CpuTimeRecords,
    CpuTime,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlMeta => "sql_meta",
            Self::PlanMeta => "plan_meta",
            Self::CpuTimeRecords => "cpu_time_records",
            Self::CpuTime => "cpu_time",
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::SqlMeta | Self::PlanMeta | Self::CpuTimeRecords => Protocol::TiDb,
            Self::CpuTime => Protocol::TiKv,
        }
    }
}

/// What applying one report did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Ingested { points: usize },
    Linked(DigestKind),
    Skipped,
}

/// Shared store, registry and metrics handles that every session writes
/// through.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<TimeSeriesData>,
    registry: Arc<DigestRegistry>,
    health: Arc<HealthMetrics>,
}

impl Ingestor {
    pub fn new(
        store: Arc<TimeSeriesData>,
        registry: Arc<DigestRegistry>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            store,
            registry,
            health,
        }
    }

    pub fn store(&self) -> &Arc<TimeSeriesData> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DigestRegistry> {
        &self.registry
    }

    /// Decodes `report` and applies it on behalf of `instance`.
    pub fn apply(&self, instance: &str, report: Report) -> Result<Applied, IngestError> {
        match decode::decode(report)? {
            Decoded::Batch(batch) => {
                self.store.ingest(
                    instance,
                    &batch.sql_digest,
                    &batch.plan_digest,
                    &batch.timestamps,
                    &batch.cpu_ms,
                )?;
                Ok(Applied::Ingested {
                    points: batch.points(),
                })
            }
            Decoded::Link(link) => {
                self.registry.link(link.kind, link.digest, link.text);
                Ok(Applied::Linked(link.kind))
            }
            Decoded::Skip => Ok(Applied::Skipped),
        }
    }
}

/// Counters for one session, logged when it ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub batches: usize,
    pub points: usize,
    pub linked: usize,
    pub dropped: usize,
}

impl SessionStats {
    /// Average data points per ingested batch, `None` before the first one.
    pub fn points_per_batch(&self) -> Option<usize> {
        self.points.checked_div(self.batches)
    }
}

/// One inbound reporting stream.
pub struct Session {
    ingestor: Ingestor,
    kind: StreamKind,
    instance: String,
}

impl Session {
    pub fn new(ingestor: Ingestor, kind: StreamKind, port: u16) -> Self {
        Self {
            ingestor,
            kind,
            instance: kind.protocol().instance(port),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Applies every message of `stream` in order until it ends.
    ///
    /// A message that fails to decode or ingest is logged and skipped. A
    /// stream error ends the session and is returned, so no acknowledgement
    /// goes out for it.
    pub async fn run<S, M>(self, mut stream: S) -> Result<SessionStats, Status>
    where
        S: Stream<Item = Result<M, Status>> + Unpin,
        M: Into<Report>,
    {
        let kind = self.kind.as_str();
        let health = Arc::clone(&self.ingestor.health);

        info!(instance = %self.instance, stream = kind, "receive report stream");
        health.sessions_opened.with_label_values(&[kind]).inc();
        health.sessions_active.inc();
        let start = Instant::now();

        let result = self.drain(&mut stream).await;

        health.sessions_active.dec();
        health
            .session_duration
            .with_label_values(&[kind])
            .observe(start.elapsed().as_secs_f64());

        match &result {
            Ok(stats) => {
                info!(
                    instance = %self.instance,
                    stream = kind,
                    batches = stats.batches,
                    points_per_batch = ?stats.points_per_batch(),
                    linked = stats.linked,
                    dropped = stats.dropped,
                    elapsed = ?start.elapsed(),
                    "report stream ingested",
                );
            }
            Err(status) => {
                health.sessions_aborted.with_label_values(&[kind]).inc();
                warn!(
                    instance = %self.instance,
                    stream = kind,
                    error = %status,
                    "report stream aborted",
                );
            }
        }

        result
    }

    async fn drain<S, M>(&self, stream: &mut S) -> Result<SessionStats, Status>
    where
        S: Stream<Item = Result<M, Status>> + Unpin,
        M: Into<Report>,
    {
        let protocol = self.kind.protocol().as_str();
        let health = &self.ingestor.health;
        let mut stats = SessionStats::default();

        while let Some(message) = stream.next().await {
            let report: Report = message?.into();

            match self.ingestor.apply(&self.instance, report) {
                Ok(Applied::Ingested { points }) => {
                    stats.batches += 1;
                    stats.points += points;
                    health.batches_ingested.with_label_values(&[protocol]).inc();
                    health.samples_ingested.inc_by(points as f64);
                }
                Ok(Applied::Linked(digest_kind)) => {
                    stats.linked += 1;
                    health
                        .digests_linked
                        .with_label_values(&[digest_kind.as_str()])
                        .inc();
                }
                Ok(Applied::Skipped) => {
                    debug!(instance = %self.instance, "skipped meta without digest or text");
                }
                Err(e) => {
                    stats.dropped += 1;
                    health
                        .batches_dropped
                        .with_label_values(&[protocol, e.reason()])
                        .inc();
                    warn!(
                        instance = %self.instance,
                        stream = self.kind.as_str(),
                        error = %e,
                        "ignored stream slice",
                    );
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use prost::Message;

    use crate::proto::resource_usage_agent::ReportCpuTimeRequest;
    use crate::proto::tipb::{CpuTimeRecord, ResourceGroupTag, SqlMeta};

    fn ingestor() -> Ingestor {
        Ingestor::new(
            Arc::new(TimeSeriesData::new()),
            Arc::new(DigestRegistry::new()),
            Arc::new(HealthMetrics::new().unwrap()),
        )
    }

    fn tagged(tag: Vec<u8>, ts: Vec<u64>, cpu: Vec<u32>) -> ReportCpuTimeRequest {
        ReportCpuTimeRequest {
            resource_group_tag: tag,
            record_list_timestamp_sec: ts,
            record_list_cpu_time_ms: cpu,
        }
    }

    fn good_tag() -> Vec<u8> {
        ResourceGroupTag {
            sql_digest: vec![0xab, 0x12],
            plan_digest: vec![],
        }
        .encode_to_vec()
    }

    #[test]
    fn test_instance_naming() {
        assert_eq!(Protocol::TiDb.instance(10091), "tidb-10091");
        assert_eq!(StreamKind::CpuTime.protocol().instance(10092), "tikv-10092");
        assert_eq!(StreamKind::SqlMeta.protocol(), Protocol::TiDb);
    }

    #[test]
    fn test_points_per_batch_without_batches() {
        let stats = SessionStats {
            dropped: 4,
            ..Default::default()
        };
        assert_eq!(stats.points_per_batch(), None);

        let stats = SessionStats {
            batches: 2,
            points: 7,
            ..Default::default()
        };
        assert_eq!(stats.points_per_batch(), Some(3));
    }

    #[test]
    fn test_apply_scenario_then_link() {
        let ingestor = ingestor();
        let applied = ingestor
            .apply(
                "tidb-0",
                Report::CpuTime(CpuTimeRecord {
                    timestamp_list: vec![100, 100, 101],
                    cpu_time_ms_list: vec![5, 5, 10],
                    sql_digest: vec![0xab, 0x12],
                    plan_digest: vec![],
                }),
            )
            .unwrap();
        assert_eq!(applied, Applied::Ingested { points: 3 });

        let series = ingestor.store().series("tidb-0", "ab12", "").unwrap();
        assert_eq!(series.values.len(), 3);
        assert_eq!(series.values_sum(), 20);

        let applied = ingestor
            .apply(
                "tidb-0",
                Report::SqlMeta(SqlMeta {
                    sql_digest: vec![0xab, 0x12],
                    normalized_sql: "SELECT 1".to_string(),
                }),
            )
            .unwrap();
        assert_eq!(applied, Applied::Linked(DigestKind::Sql));
        assert_eq!(
            ingestor
                .registry()
                .snapshot(DigestKind::Sql)
                .get("ab12")
                .map(String::as_str),
            Some("SELECT 1")
        );
    }

    #[tokio::test]
    async fn test_session_skips_bad_tag_and_continues() {
        let ingestor = ingestor();
        let session = Session::new(ingestor.clone(), StreamKind::CpuTime, 20180);
        assert_eq!(session.instance(), "tikv-20180");

        let messages: Vec<Result<ReportCpuTimeRequest, Status>> = vec![
            Ok(tagged(vec![0x0a, 0x05, 0x01], vec![1], vec![1])),
            Ok(tagged(vec![], vec![1], vec![1])),
            Ok(tagged(good_tag(), vec![1, 2], vec![3, 4])),
        ];
        let stats = session.run(tokio_stream::iter(messages)).await.unwrap();

        assert_eq!(stats.batches, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.points, 2);
        assert_eq!(ingestor.store().instances(), vec!["tikv-20180"]);
        assert_eq!(
            ingestor
                .store()
                .series("tikv-20180", "ab12", "")
                .unwrap()
                .values_sum(),
            7
        );
    }

    #[tokio::test]
    async fn test_session_transport_error_ends_session() {
        let ingestor = ingestor();
        let session = Session::new(ingestor.clone(), StreamKind::CpuTime, 1);

        let messages: Vec<Result<ReportCpuTimeRequest, Status>> = vec![
            Ok(tagged(good_tag(), vec![1], vec![1])),
            Err(Status::unavailable("connection reset")),
            Ok(tagged(good_tag(), vec![2], vec![2])),
        ];
        let err = session.run(tokio_stream::iter(messages)).await.unwrap_err();

        assert_eq!(err.code(), tonic::Code::Unavailable);
        let series = ingestor.store().series("tikv-1", "ab12", "").unwrap();
        assert_eq!(series.values.len(), 1);
        assert_eq!(ingestor.health.sessions_active.get(), 0.0);
        assert_eq!(
            ingestor
                .health
                .sessions_aborted
                .with_label_values(&["cpu_time"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_session_with_only_failures_finishes() {
        let ingestor = ingestor();
        let session = Session::new(ingestor.clone(), StreamKind::CpuTimeRecords, 2);

        let messages: Vec<Result<CpuTimeRecord, Status>> = vec![Ok(CpuTimeRecord {
            timestamp_list: vec![1, 2],
            cpu_time_ms_list: vec![1],
            sql_digest: vec![1],
            plan_digest: vec![],
        })];
        let stats = session.run(tokio_stream::iter(messages)).await.unwrap();

        assert_eq!(stats.batches, 0);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.points_per_batch(), None);
        assert!(ingestor.store().is_empty());
        assert_eq!(
            ingestor
                .health
                .batches_dropped
                .with_label_values(&["tidb", "malformed_batch"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_empty_stream_yields_empty_stats() {
        let session = Session::new(ingestor(), StreamKind::SqlMeta, 3);
        let messages: Vec<Result<SqlMeta, Status>> = Vec::new();

        let stats = session.run(tokio_stream::iter(messages)).await.unwrap();
        assert_eq!(stats, SessionStats::default());
    }
}
