pub mod registry;
pub mod series;

pub use registry::{DigestKind, DigestRegistry};
pub use series::{Sample, TimeSeries, TimeSeriesData};

use thiserror::Error;

/// Errors that cause a single reported batch to be dropped.
///
/// None of these end the reporting session; the offending message is
/// skipped and the session moves on to the next one.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("data corrupted, timestamp list len = {timestamps}, cpu time list len = {cpu_values}")]
    MalformedBatch { timestamps: usize, cpu_values: usize },

    #[error("data corrupted, sql digest is empty")]
    MissingFingerprint,

    #[error("data corrupted, resource group tag is empty")]
    MissingResourceTag,

    #[error("unmarshal resource group tag failed: {0}")]
    TagDecode(#[from] prost::DecodeError),
}

impl IngestError {
    /// Short stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MalformedBatch { .. } => "malformed_batch",
            Self::MissingFingerprint => "missing_fingerprint",
            Self::MissingResourceTag => "missing_resource_tag",
            Self::TagDecode(_) => "tag_decode",
        }
    }
}
