use crate::metadata::platform::Platform;
use serde::{Deserialize, Serialize};

/// The record handed back to callers.
///
/// Only [`crate::metadata::normalize::Normalizer`] builds one, which is what
/// guarantees the field invariants: `title` is never empty, `thumbnail` is an
/// absolute http(s) url or empty, and channel fields are either absent or non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataResult {
    title: String,
    description: String,
    thumbnail: String,
    platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel_avatar: Option<String>,
}

impl MetadataResult {
    pub(crate) fn new(
        title: String,
        description: String,
        thumbnail: String,
        platform: Platform,
        channel_name: Option<String>,
        channel_avatar: Option<String>,
    ) -> Self {
        Self {
            title,
            description,
            thumbnail,
            platform,
            channel_name,
            channel_avatar,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn thumbnail(&self) -> &str {
        &self.thumbnail
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn channel_name(&self) -> Option<&str> {
        self.channel_name.as_deref()
    }

    pub fn channel_avatar(&self) -> Option<&str> {
        self.channel_avatar.as_deref()
    }
}

/// Loosely-filled metadata as a single stage produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    /// Site icon, only used when nothing better turns up for `thumbnail`.
    pub favicon: Option<String>,
    pub channel_name: Option<String>,
    pub channel_avatar: Option<String>,
}

impl RawMetadata {
    pub fn has_title(&self) -> bool {
        self.title.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Returns true if any useful field is present
    pub fn has_any_data(&self) -> bool {
        [
            &self.title,
            &self.description,
            &self.thumbnail,
            &self.favicon,
            &self.channel_name,
            &self.channel_avatar,
        ]
        .into_iter()
        .any(|field| field.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }

    /// Fill only the fields this one is missing. Never overwrites a present value.
    pub fn fill_gaps(mut self, other: RawMetadata) -> Self {
        fn pick(slot: &mut Option<String>, candidate: Option<String>) {
            let missing = slot.as_deref().map_or(true, |v| v.trim().is_empty());
            if missing && candidate.as_deref().is_some_and(|v| !v.trim().is_empty()) {
                *slot = candidate;
            }
        }

        pick(&mut self.title, other.title);
        pick(&mut self.description, other.description);
        pick(&mut self.thumbnail, other.thumbnail);
        pick(&mut self.favicon, other.favicon);
        pick(&mut self.channel_name, other.channel_name);
        pick(&mut self.channel_avatar, other.channel_avatar);
        self
    }

    /// Describe which fields are present (for logging)
    pub fn describe_fields(&self) -> String {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.thumbnail.is_some() {
            fields.push("thumbnail");
        }
        if self.favicon.is_some() {
            fields.push("favicon");
        }
        if self.channel_name.is_some() {
            fields.push("channel_name");
        }
        if self.channel_avatar.is_some() {
            fields.push("channel_avatar");
        }
        fields.join(",")
    }
}

/// What a stage hands back to the pipeline when it did not fail outright.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Data(RawMetadata),
    /// The stage does not apply to this url, or found nothing worth returning.
    Skip(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResolveReport {
    pub url: String,
    pub platform: String,
    pub stages: Vec<StageReport>,
    /// Name of the stage whose output carried the title, if any.
    pub winner: Option<String>,
    pub cached: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub fields: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail")]
pub enum StageStatus {
    Success,
    Partial,
    Skip(String),
    Error(String),
    Timeout,
}
