use serde::{Deserialize, Serialize};

/// One reconciled metadata/content pair, ready for downstream processing.
///
/// Serialized as one JSON object per outbound queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub source: String,
    pub bucket: String,
    /// Content object key.
    pub key: String,
    /// Metadata object key.
    #[serde(rename = "metakey", default, skip_serializing_if = "Option::is_none")]
    pub meta_key: Option<String>,
}
