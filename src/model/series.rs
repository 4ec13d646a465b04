use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

use super::IngestError;

/// One CPU usage data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    #[serde(rename = "Timestamp")]
    pub timestamp: u64,
    #[serde(rename = "CPUInMS")]
    pub cpu_ms: u64,
}

/// CPU usage of one (instance, sql digest, plan digest) triple.
///
/// Samples keep insertion order, which depends on arrival order across
/// sessions. Timestamps may repeat.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSeries {
    #[serde(rename = "Instance")]
    pub instance: String,
    #[serde(rename = "SQLDigest")]
    pub sql_digest: String,
    #[serde(rename = "PlanDigest")]
    pub plan_digest: String,
    #[serde(rename = "UnorderedValues")]
    pub values: Vec<Sample>,
    #[serde(skip)]
    values_sum: u64,
}

impl TimeSeries {
    fn new(key: &SeriesKey) -> Self {
        Self {
            instance: key.instance.clone(),
            sql_digest: key.sql_digest.clone(),
            plan_digest: key.plan_digest.clone(),
            values: Vec::with_capacity(100),
            values_sum: 0,
        }
    }

    /// Running total of `cpu_ms` over every sample.
    pub fn values_sum(&self) -> u64 {
        self.values_sum
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    instance: String,
    sql_digest: String,
    plan_digest: String,
}

/// Append-only store of every series reported to the fleet.
///
/// A single mutex guards the whole map, so each batch is applied atomically
/// and listings always see a consistent set of series. If contention across
/// many fleet members becomes a problem the map can be striped by a hash of
/// the series key, as long as a batch still lands under one lock and
/// listings still visit every stripe.
#[derive(Debug, Default)]
pub struct TimeSeriesData {
    series_by_key: Mutex<HashMap<SeriesKey, TimeSeries>>,
}

impl TimeSeriesData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch of samples to the series identified by
    /// `(instance, sql_digest, plan_digest)`, creating it on first use.
    ///
    /// The batch is rejected as a whole if the two lists differ in length or
    /// the sql digest is empty.
    pub fn ingest(
        &self,
        instance: &str,
        sql_digest: &str,
        plan_digest: &str,
        timestamps: &[u64],
        cpu_values: &[u32],
    ) -> Result<(), IngestError> {
        if timestamps.len() != cpu_values.len() {
            return Err(IngestError::MalformedBatch {
                timestamps: timestamps.len(),
                cpu_values: cpu_values.len(),
            });
        }
        if sql_digest.is_empty() {
            return Err(IngestError::MissingFingerprint);
        }

        let key = SeriesKey {
            instance: instance.to_string(),
            sql_digest: sql_digest.to_string(),
            plan_digest: plan_digest.to_string(),
        };

        let mut series_by_key = self.series_by_key.lock();
        let series = series_by_key
            .entry(key)
            .or_insert_with_key(TimeSeries::new);

        let mut sum = 0u64;
        series.values.reserve(timestamps.len());
        for (&timestamp, &cpu) in timestamps.iter().zip(cpu_values) {
            series.values.push(Sample {
                timestamp,
                cpu_ms: u64::from(cpu),
            });
            sum += u64::from(cpu);
        }
        series.values_sum += sum;

        Ok(())
    }

    /// Distinct instance ids across all series, sorted ascending.
    pub fn instances(&self) -> Vec<String> {
        let series_by_key = self.series_by_key.lock();
        let instances: BTreeSet<&str> = series_by_key
            .keys()
            .map(|key| key.instance.as_str())
            .collect();

        instances.into_iter().map(str::to_string).collect()
    }

    /// Snapshot of every series reported by `instance`.
    ///
    /// Samples ingested after this call returns are not reflected in the
    /// result; callers that need fresher data call again.
    pub fn series_for_instance(&self, instance: &str) -> Vec<TimeSeries> {
        self.series_by_key
            .lock()
            .values()
            .filter(|series| series.instance == instance)
            .cloned()
            .collect()
    }

    /// Snapshot of a single series, if it exists.
    pub fn series(&self, instance: &str, sql_digest: &str, plan_digest: &str) -> Option<TimeSeries> {
        let key = SeriesKey {
            instance: instance.to_string(),
            sql_digest: sql_digest.to_string(),
            plan_digest: plan_digest.to_string(),
        };
        self.series_by_key.lock().get(&key).cloned()
    }

    /// Number of series.
    pub fn len(&self) -> usize {
        self.series_by_key.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
