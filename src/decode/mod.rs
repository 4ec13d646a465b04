//! Normalizes both reporting protocols into one batch shape.
//!
//! SQL-layer reporters send digests inline and ship the normalized text on
//! separate meta streams. Storage-layer reporters wrap both digests in an
//! encoded [`ResourceGroupTag`]. Either way the result is a [`Batch`] keyed
//! by hex digests, or a [`DigestLink`] for the registry.

use prost::Message;

use crate::model::{DigestKind, IngestError};
use crate::proto::resource_usage_agent::ReportCpuTimeRequest;
use crate::proto::tipb::{CpuTimeRecord, PlanMeta, ResourceGroupTag, SqlMeta};

/// One inbound message from either protocol.
#[derive(Debug, Clone)]
pub enum Report {
    SqlMeta(SqlMeta),
    PlanMeta(PlanMeta),
    CpuTime(CpuTimeRecord),
    Tagged(ReportCpuTimeRequest),
}

impl From<SqlMeta> for Report {
    fn from(meta: SqlMeta) -> Self {
        Self::SqlMeta(meta)
    }
}

impl From<PlanMeta> for Report {
    fn from(meta: PlanMeta) -> Self {
        Self::PlanMeta(meta)
    }
}

impl From<CpuTimeRecord> for Report {
    fn from(record: CpuTimeRecord) -> Self {
        Self::CpuTime(record)
    }
}

impl From<ReportCpuTimeRequest> for Report {
    fn from(request: ReportCpuTimeRequest) -> Self {
        Self::Tagged(request)
    }
}

/// Normalized text to record for a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestLink {
    pub kind: DigestKind,
    pub digest: String,
    pub text: String,
}

/// CPU samples for one digest pair, ready for the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub sql_digest: String,
    pub plan_digest: String,
    pub timestamps: Vec<u64>,
    pub cpu_ms: Vec<u32>,
}

impl Batch {
    /// Number of data points, counting the timestamp list.
    pub fn points(&self) -> usize {
        self.timestamps.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Link(DigestLink),
    Batch(Batch),
    /// A meta message without digest or text.
    Skip,
}

/// Decodes a report. Only the tagged protocol can fail here; batch shape
/// checks are left to the store.
pub fn decode(report: Report) -> Result<Decoded, IngestError> {
    match report {
        Report::SqlMeta(meta) => Ok(link(DigestKind::Sql, &meta.sql_digest, meta.normalized_sql)),
        Report::PlanMeta(meta) => Ok(link(
            DigestKind::Plan,
            &meta.plan_digest,
            meta.normalized_plan,
        )),
        Report::CpuTime(record) => Ok(Decoded::Batch(Batch {
            sql_digest: hex::encode(&record.sql_digest),
            plan_digest: hex::encode(&record.plan_digest),
            timestamps: record.timestamp_list,
            cpu_ms: record.cpu_time_ms_list,
        })),
        Report::Tagged(request) => decode_tagged(request).map(Decoded::Batch),
    }
}

fn link(kind: DigestKind, digest: &[u8], text: String) -> Decoded {
    if digest.is_empty() || text.is_empty() {
        return Decoded::Skip;
    }

    Decoded::Link(DigestLink {
        kind,
        digest: hex::encode(digest),
        text,
    })
}

fn decode_tagged(request: ReportCpuTimeRequest) -> Result<Batch, IngestError> {
    if request.resource_group_tag.is_empty() {
        return Err(IngestError::MissingResourceTag);
    }

    let tag = ResourceGroupTag::decode(request.resource_group_tag.as_slice())?;

    Ok(Batch {
        sql_digest: hex::encode(&tag.sql_digest),
        plan_digest: hex::encode(&tag.plan_digest),
        timestamps: request.record_list_timestamp_sec,
        cpu_ms: request.record_list_cpu_time_ms,
    })
}
