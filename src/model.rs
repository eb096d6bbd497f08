//! Entities shipped to the ingestion endpoint: traces, observations, scores, and the wire
//! wrapper that batches them together.
//!
//! Every entity is a value-typed record; identity is a string id and relationships are by-id
//! references only (`trace_id`, `parent_observation_id`), never a runtime pointer graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Severity of an observation, mirrors the wire enum `ObservationLevel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObservationLevel {
    Debug,
    #[default]
    Default,
    Warning,
    Error,
}

/// Shape of a score's `value`, mirrors the wire enum `ScoreDataType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScoreDataType {
    Numeric,
    Categorical,
    Boolean,
}

/// Who produced a score, mirrors the wire enum `ScoreSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScoreSource {
    Api,
    Annotation,
    Eval,
}

/// The root of one execution flow. Mutable only via a subsequent `Update` event carrying the
/// same id; never destroyed client-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub tags: Option<Vec<String>>,
    pub release: Option<String>,
    pub version: Option<String>,
    pub public: Option<bool>,
    pub environment: Option<String>,
}

/// Fields shared by all three observation variants (Span, Generation, Event).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationCommon {
    pub id: String,
    pub trace_id: String,
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub level: ObservationLevel,
    pub status_message: Option<String>,
    pub parent_observation_id: Option<String>,
    pub version: Option<String>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub environment: Option<String>,
}

impl ObservationCommon {
    /// `endTime >= startTime` when both are present; holds trivially when `end_time` is unset.
    pub fn has_valid_time_range(&self) -> bool {
        match self.end_time {
            Some(end) => end >= self.start_time,
            None => true,
        }
    }
}

/// Generic work unit with start/end times but no LLM-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(flatten)]
    pub common: ObservationCommon,
}

/// Token accounting for a `Generation`. `total` is whatever the caller last set; it is never
/// recomputed from `input + output`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: i64,
    pub output: i64,
    pub total: i64,
    pub unit: Option<String>,
    pub input_cost: Option<f64>,
    pub output_cost: Option<f64>,
    pub total_cost: Option<f64>,
}

/// An LLM call: adds model, usage, and prompt linkage on top of the common observation fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    #[serde(flatten)]
    pub common: ObservationCommon,
    pub model: Option<String>,
    pub model_parameters: Option<HashMap<String, serde_json::Value>>,
    pub usage: Option<Usage>,
    pub prompt_name: Option<String>,
    pub prompt_version: Option<i64>,
    pub completion_start_time: Option<DateTime<Utc>>,
}

/// A point-in-time occurrence; shares the common shape but carries no `end_time` semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(flatten)]
    pub common: ObservationCommon,
}

/// An evaluation attached to a trace or observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub trace_id: String,
    pub observation_id: Option<String>,
    pub name: String,
    /// Numeric value, or a 0/1 encoding when `data_type` is `Boolean`. Ignored for `Categorical`
    /// scores, where `string_value` carries the result instead.
    pub value: f64,
    pub string_value: Option<String>,
    pub data_type: ScoreDataType,
    pub source: Option<ScoreSource>,
    pub comment: Option<String>,
    pub config_id: Option<String>,
    pub environment: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl Score {
    /// Whether `value`/`string_value` are populated consistently with `data_type`.
    pub fn is_value_consistent(&self) -> bool {
        match self.data_type {
            ScoreDataType::Numeric => true,
            ScoreDataType::Categorical => self.string_value.as_deref().is_some_and(|s| !s.is_empty()),
            ScoreDataType::Boolean => self.value == 0.0 || self.value == 1.0,
        }
    }
}

/// Discriminated payload of an [`IngestionEvent`]; the `type` tag and `body` key are wire-level
/// siblings of `id`/`timestamp`, produced by serde's adjacently-tagged representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum IngestionEventBody {
    #[serde(rename = "trace-create")]
    TraceCreate(Trace),
    #[serde(rename = "trace-update")]
    TraceUpdate(Trace),
    #[serde(rename = "span-create")]
    SpanCreate(Span),
    #[serde(rename = "span-update")]
    SpanUpdate(Span),
    #[serde(rename = "generation-create")]
    GenerationCreate(Generation),
    #[serde(rename = "generation-update")]
    GenerationUpdate(Generation),
    #[serde(rename = "event-create")]
    EventCreate(Event),
    #[serde(rename = "score-create")]
    ScoreCreate(Score),
    /// The SDK reporting its own health into the same pipeline it ships user data on.
    #[serde(rename = "sdk-log")]
    SdkLog(serde_json::Value),
}

/// The wire wrapper placed in a [`Batch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: IngestionEventBody,
}

/// Top-level metadata sent alongside every batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub sdk: String,
    pub sdk_version: String,
}

impl Default for BatchMetadata {
    fn default() -> Self {
        Self { sdk: "langfuse-core".to_string(), sdk_version: env!("CARGO_PKG_VERSION").to_string() }
    }
}

/// An ordered list of ingestion events shipped in a single HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch: Vec<IngestionEvent>,
    pub metadata: Option<BatchMetadata>,
}

/// One accepted event in an ingestion response.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionSuccessItem {
    pub id: String,
    pub status: u16,
}

/// One rejected event in an ingestion response.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionErrorItem {
    pub id: String,
    pub status: u16,
    pub message: Option<String>,
}

/// Server response body for a batch POST.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IngestionResponse {
    #[serde(default)]
    pub successes: Vec<IngestionSuccessItem>,
    #[serde(default)]
    pub errors: Vec<IngestionErrorItem>,
}
