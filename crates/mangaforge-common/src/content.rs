//! Generated content entity, deduplicated by content hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of artifact a phase produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    Dialogue,
    Layout,
    Composite,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Dialogue => "dialogue",
            ContentType::Layout => "layout",
            ContentType::Composite => "composite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentType::Text),
            "image" => Some(ContentType::Image),
            "dialogue" => Some(ContentType::Dialogue),
            "layout" => Some(ContentType::Layout),
            "composite" => Some(ContentType::Composite),
            _ => None,
        }
    }
}

/// Review/retention status of a content row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    Generated,
    Reviewed,
    Approved,
    Rejected,
    Finalized,
    Archived,
}

impl ContentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentStatus::Draft => "draft",
            ContentStatus::Generated => "generated",
            ContentStatus::Reviewed => "reviewed",
            ContentStatus::Approved => "approved",
            ContentStatus::Rejected => "rejected",
            ContentStatus::Finalized => "finalized",
            ContentStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ContentStatus::Draft),
            "generated" => Some(ContentStatus::Generated),
            "reviewed" => Some(ContentStatus::Reviewed),
            "approved" => Some(ContentStatus::Approved),
            "rejected" => Some(ContentStatus::Rejected),
            "finalized" => Some(ContentStatus::Finalized),
            "archived" => Some(ContentStatus::Archived),
            _ => None,
        }
    }
}

/// One piece of generated content owned by a session.
///
/// `content_hash` is deterministic in `data`; the repository deduplicates on
/// `(session_id, phase_number, content_type, content_hash)` and hands back
/// the existing row instead of inserting a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub id: Uuid,
    pub session_id: Uuid,
    pub phase_number: u8,
    pub content_type: ContentType,
    pub content_hash: String,
    pub data: serde_json::Value,
    pub status: ContentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    /// Model identifier, or "fallback" when the rule-based generator ran.
    pub generated_by: String,
    pub created_at: DateTime<Utc>,
}

impl GeneratedContent {
    pub fn new(
        session_id: Uuid,
        phase_number: u8,
        content_type: ContentType,
        content_hash: String,
        data: serde_json::Value,
        generated_by: &str,
        quality_score: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            phase_number,
            content_type,
            content_hash,
            data,
            status: ContentStatus::Generated,
            quality_score,
            generated_by: generated_by.to_string(),
            created_at: Utc::now(),
        }
    }
}
