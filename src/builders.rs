//! Fluent construction of traces and observations, with parent linkage carried through context
//! handles returned by `create`.
//!
//! Mirrors the teacher's accumulate-then-`build()` shape (see `RetryPolicy::builder()`): setters
//! return `Self` and validation errors accumulate in a side vec rather than failing fast, so a
//! caller sees every problem with a construction at once instead of one-at-a-time.

use crate::context::Context;
use crate::ids::IdGenerator;
use crate::ingest_error::{IdentifierError, IngestError, ValidationError};
use crate::model::{
    Event, Generation, IngestionEvent, IngestionEventBody, ObservationCommon, ObservationLevel, Score, ScoreDataType,
    ScoreSource, Span, Trace, Usage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const MAX_NAME_LEN: usize = 500;
const MAX_TAGS: usize = 50;

/// How a builder surfaces validation problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Errors accumulate silently and are all reported together from `create`.
    #[default]
    Permissive,
    /// Identical accumulation, but `create` returns a [`BuildResult`] the caller must explicitly
    /// unwrap, so a strict caller cannot accidentally ignore the error vec.
    Strict,
}

/// Error surfaced by a builder's `create`: either the construction never passed validation, or it
/// did and enqueuing the resulting event failed.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("{} validation error(s)", .0.len())]
    Validation(Vec<ValidationError>),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// Wraps a strict-mode build so the caller must call [`BuildResult::into_result`] to observe it.
#[must_use = "strict-mode builds must be unwrapped to observe validation errors"]
pub struct BuildResult<T>(Result<T, BuilderError>);

impl<T> BuildResult<T> {
    pub fn into_result(self) -> Result<T, BuilderError> {
        self.0
    }
}

/// Bridges a builder to the client facade without builders.rs depending on it directly.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, event: IngestionEvent, ctx: &Context) -> Result<(), IngestError>;
    fn new_id(&self) -> Result<String, IdentifierError>;
}

fn validate_id(id: &str, entity: &'static str) -> Result<(), ValidationError> {
    if id.is_empty() {
        Err(ValidationError::MissingField { entity, field: "id" })
    } else {
        Ok(())
    }
}

fn validate_name(name: &str, entity: &'static str) -> Result<(), ValidationError> {
    if name.chars().count() > MAX_NAME_LEN {
        Err(ValidationError::InvalidValue {
            entity,
            field: "name",
            reason: format!("length {} exceeds {MAX_NAME_LEN} runes", name.chars().count()),
        })
    } else {
        Ok(())
    }
}

fn validate_metadata(
    metadata: &HashMap<String, serde_json::Value>,
    entity: &'static str,
) -> Result<(), ValidationError> {
    if metadata.keys().any(|k| k.is_empty()) {
        Err(ValidationError::InvalidValue { entity, field: "metadata", reason: "keys must be non-empty".into() })
    } else {
        Ok(())
    }
}

fn validate_tags(tags: &[String], entity: &'static str) -> Result<(), ValidationError> {
    if tags.len() > MAX_TAGS {
        return Err(ValidationError::InvalidValue {
            entity,
            field: "tags",
            reason: format!("{} tags exceeds limit of {MAX_TAGS}", tags.len()),
        });
    }
    if tags.iter().any(|t| t.is_empty()) {
        return Err(ValidationError::InvalidValue { entity, field: "tags", reason: "tags must be non-empty".into() });
    }
    Ok(())
}

fn resolve_id(explicit: Option<String>, client: &dyn Enqueuer, errors: &mut Vec<ValidationError>) -> String {
    match explicit {
        Some(id) => id,
        None => client.new_id().unwrap_or_else(|_| {
            errors.push(ValidationError::MissingField { entity: "id", field: "id" });
            String::new()
        }),
    }
}

/// Returned from `TraceBuilder::create`; the entry point for attaching observations and scores to
/// this trace.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    pub fn span(&self) -> SpanBuilder {
        SpanBuilder::new(self.trace_id.clone(), None)
    }

    pub fn generation(&self) -> GenerationBuilder {
        GenerationBuilder::new(self.trace_id.clone(), None)
    }

    pub fn event(&self) -> EventBuilder {
        EventBuilder::new(self.trace_id.clone(), None)
    }

    pub fn score(&self) -> ScoreBuilder {
        ScoreBuilder::new(self.trace_id.clone(), None)
    }
}

/// Returned from an observation builder's `create`; children link back via `parent_observation_id`.
#[derive(Debug, Clone)]
pub struct ObservationContext {
    pub trace_id: String,
    pub observation_id: String,
}

impl ObservationContext {
    pub fn span(&self) -> SpanBuilder {
        SpanBuilder::new(self.trace_id.clone(), Some(self.observation_id.clone()))
    }

    pub fn generation(&self) -> GenerationBuilder {
        GenerationBuilder::new(self.trace_id.clone(), Some(self.observation_id.clone()))
    }

    pub fn event(&self) -> EventBuilder {
        EventBuilder::new(self.trace_id.clone(), Some(self.observation_id.clone()))
    }

    pub fn score(&self) -> ScoreBuilder {
        ScoreBuilder::new(self.trace_id.clone(), Some(self.observation_id.clone()))
    }
}

pub struct TraceBuilder {
    id: Option<String>,
    name: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    metadata: Option<HashMap<String, serde_json::Value>>,
    tags: Option<Vec<String>>,
    release: Option<String>,
    version: Option<String>,
    public: Option<bool>,
    environment: Option<String>,
    mode: ValidationMode,
    errors: Vec<ValidationError>,
}

impl Default for TraceBuilder {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            user_id: None,
            session_id: None,
            input: None,
            output: None,
            metadata: None,
            tags: None,
            release: None,
            version: None,
            public: None,
            environment: None,
            mode: ValidationMode::Permissive,
            errors: Vec::new(),
        }
    }
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self) -> Self {
        self.mode = ValidationMode::Strict;
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if let Err(err) = validate_name(&name, "Trace") {
            self.errors.push(err);
        }
        self.name = Some(name);
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        if let Err(err) = validate_metadata(&metadata, "Trace") {
            self.errors.push(err);
        }
        self.metadata = Some(metadata);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        if let Err(err) = validate_tags(&tags, "Trace") {
            self.errors.push(err);
        }
        self.tags = Some(tags);
        self
    }

    pub fn release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn public(mut self, public: bool) -> Self {
        self.public = Some(public);
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    async fn build_and_enqueue(mut self, client: &dyn Enqueuer, ctx: &Context) -> Result<TraceContext, BuilderError> {
        let id = resolve_id(self.id.take(), client, &mut self.errors);
        if let Err(err) = validate_id(&id, "Trace") {
            self.errors.push(err);
        }
        if !self.errors.is_empty() {
            return Err(BuilderError::Validation(self.errors));
        }

        let trace = Trace {
            id: id.clone(),
            timestamp: Utc::now(),
            name: self.name,
            user_id: self.user_id,
            session_id: self.session_id,
            input: self.input,
            output: self.output,
            metadata: self.metadata,
            tags: self.tags,
            release: self.release,
            version: self.version,
            public: self.public,
            environment: self.environment,
        };

        let event_id = client.new_id().unwrap_or_default();
        client
            .enqueue(IngestionEvent { id: event_id, timestamp: trace.timestamp, body: IngestionEventBody::TraceCreate(trace) }, ctx)
            .await?;
        Ok(TraceContext { trace_id: id })
    }

    pub async fn create(self, client: &dyn Enqueuer, ctx: &Context) -> Result<TraceContext, BuilderError> {
        self.build_and_enqueue(client, ctx).await
    }

    pub async fn create_strict(mut self, client: &dyn Enqueuer, ctx: &Context) -> BuildResult<TraceContext> {
        self.mode = ValidationMode::Strict;
        BuildResult(self.build_and_enqueue(client, ctx).await)
    }
}

/// Shared construction state for `Span`, `Generation`, and `Event`, which differ only in the
/// fields layered on top of [`ObservationCommon`].
struct ObservationBuilderState {
    trace_id: String,
    id: Option<String>,
    name: Option<String>,
    parent_observation_id: Option<String>,
    metadata: Option<HashMap<String, serde_json::Value>>,
    level: ObservationLevel,
    status_message: Option<String>,
    version: Option<String>,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    environment: Option<String>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    errors: Vec<ValidationError>,
}

impl ObservationBuilderState {
    fn new(trace_id: String, parent_observation_id: Option<String>) -> Self {
        Self {
            trace_id,
            id: None,
            name: None,
            parent_observation_id,
            metadata: None,
            level: ObservationLevel::default(),
            status_message: None,
            version: None,
            input: None,
            output: None,
            environment: None,
            start_time: Utc::now(),
            end_time: None,
            errors: Vec::new(),
        }
    }

    fn into_common(mut self, client: &dyn Enqueuer, entity: &'static str) -> Result<ObservationCommon, Vec<ValidationError>> {
        let id = resolve_id(self.id.take(), client, &mut self.errors);
        if let Err(err) = validate_id(&id, entity) {
            self.errors.push(err);
        }
        if self.end_time.is_some_and(|end| end < self.start_time) {
            self.errors.push(ValidationError::InvalidValue {
                entity,
                field: "end_time",
                reason: "must not precede start_time".into(),
            });
        }
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        Ok(ObservationCommon {
            id,
            trace_id: self.trace_id,
            name: self.name,
            start_time: self.start_time,
            end_time: self.end_time,
            metadata: self.metadata,
            level: self.level,
            status_message: self.status_message,
            parent_observation_id: self.parent_observation_id,
            version: self.version,
            input: self.input,
            output: self.output,
            environment: self.environment,
        })
    }
}

macro_rules! observation_setters {
    ($entity:expr) => {
        pub fn id(mut self, id: impl Into<String>) -> Self {
            self.state.id = Some(id.into());
            self
        }

        pub fn name(mut self, name: impl Into<String>) -> Self {
            let name = name.into();
            if let Err(err) = validate_name(&name, $entity) {
                self.state.errors.push(err);
            }
            self.state.name = Some(name);
            self
        }

        pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
            if let Err(err) = validate_metadata(&metadata, $entity) {
                self.state.errors.push(err);
            }
            self.state.metadata = Some(metadata);
            self
        }

        pub fn level(mut self, level: ObservationLevel) -> Self {
            self.state.level = level;
            self
        }

        pub fn status_message(mut self, message: impl Into<String>) -> Self {
            self.state.status_message = Some(message.into());
            self
        }

        pub fn version(mut self, version: impl Into<String>) -> Self {
            self.state.version = Some(version.into());
            self
        }

        pub fn input(mut self, input: serde_json::Value) -> Self {
            self.state.input = Some(input);
            self
        }

        pub fn output(mut self, output: serde_json::Value) -> Self {
            self.state.output = Some(output);
            self
        }

        pub fn environment(mut self, environment: impl Into<String>) -> Self {
            self.state.environment = Some(environment.into());
            self
        }

        pub fn end_time(mut self, end_time: DateTime<Utc>) -> Self {
            self.state.end_time = Some(end_time);
            self
        }
    };
}

pub struct SpanBuilder {
    state: ObservationBuilderState,
}

impl SpanBuilder {
    fn new(trace_id: String, parent_observation_id: Option<String>) -> Self {
        Self { state: ObservationBuilderState::new(trace_id, parent_observation_id) }
    }

    observation_setters!("Span");

    pub async fn create(self, client: &dyn Enqueuer, ctx: &Context) -> Result<ObservationContext, BuilderError> {
        let common = self.state.into_common(client, "Span").map_err(BuilderError::Validation)?;
        let observation_id = common.id.clone();
        let trace_id = common.trace_id.clone();
        let event_id = client.new_id().unwrap_or_default();
        let timestamp = common.start_time;
        client
            .enqueue(IngestionEvent { id: event_id, timestamp, body: IngestionEventBody::SpanCreate(Span { common }) }, ctx)
            .await?;
        Ok(ObservationContext { trace_id, observation_id })
    }
}

pub struct GenerationBuilder {
    state: ObservationBuilderState,
    model: Option<String>,
    model_parameters: Option<HashMap<String, serde_json::Value>>,
    usage: Option<Usage>,
    prompt_name: Option<String>,
    prompt_version: Option<i64>,
    completion_start_time: Option<DateTime<Utc>>,
}

impl GenerationBuilder {
    fn new(trace_id: String, parent_observation_id: Option<String>) -> Self {
        Self {
            state: ObservationBuilderState::new(trace_id, parent_observation_id),
            model: None,
            model_parameters: None,
            usage: None,
            prompt_name: None,
            prompt_version: None,
            completion_start_time: None,
        }
    }

    observation_setters!("Generation");

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn model_parameters(mut self, parameters: HashMap<String, serde_json::Value>) -> Self {
        self.model_parameters = Some(parameters);
        self
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        if usage.input < 0 || usage.output < 0 || usage.total < 0 {
            self.state.errors.push(ValidationError::InvalidValue {
                entity: "Generation",
                field: "usage",
                reason: "token counts must be non-negative".into(),
            });
        }
        self.usage = Some(usage);
        self
    }

    pub fn prompt_name(mut self, name: impl Into<String>) -> Self {
        self.prompt_name = Some(name.into());
        self
    }

    pub fn prompt_version(mut self, version: i64) -> Self {
        self.prompt_version = Some(version);
        self
    }

    pub fn completion_start_time(mut self, time: DateTime<Utc>) -> Self {
        self.completion_start_time = Some(time);
        self
    }

    pub async fn create(self, client: &dyn Enqueuer, ctx: &Context) -> Result<ObservationContext, BuilderError> {
        let common = self.state.into_common(client, "Generation").map_err(BuilderError::Validation)?;
        let observation_id = common.id.clone();
        let trace_id = common.trace_id.clone();
        let timestamp = common.start_time;
        let generation = Generation {
            common,
            model: self.model,
            model_parameters: self.model_parameters,
            usage: self.usage,
            prompt_name: self.prompt_name,
            prompt_version: self.prompt_version,
            completion_start_time: self.completion_start_time,
        };
        let event_id = client.new_id().unwrap_or_default();
        client
            .enqueue(IngestionEvent { id: event_id, timestamp, body: IngestionEventBody::GenerationCreate(generation) }, ctx)
            .await?;
        Ok(ObservationContext { trace_id, observation_id })
    }
}

pub struct EventBuilder {
    state: ObservationBuilderState,
}

impl EventBuilder {
    fn new(trace_id: String, parent_observation_id: Option<String>) -> Self {
        Self { state: ObservationBuilderState::new(trace_id, parent_observation_id) }
    }

    observation_setters!("Event");

    pub async fn create(self, client: &dyn Enqueuer, ctx: &Context) -> Result<ObservationContext, BuilderError> {
        let common = self.state.into_common(client, "Event").map_err(BuilderError::Validation)?;
        let observation_id = common.id.clone();
        let trace_id = common.trace_id.clone();
        let timestamp = common.start_time;
        let event_id = client.new_id().unwrap_or_default();
        client
            .enqueue(IngestionEvent { id: event_id, timestamp, body: IngestionEventBody::EventCreate(Event { common }) }, ctx)
            .await?;
        Ok(ObservationContext { trace_id, observation_id })
    }
}

pub struct ScoreBuilder {
    trace_id: String,
    observation_id: Option<String>,
    name: Option<String>,
    value: f64,
    string_value: Option<String>,
    data_type: ScoreDataType,
    source: Option<ScoreSource>,
    comment: Option<String>,
    config_id: Option<String>,
    environment: Option<String>,
    metadata: Option<HashMap<String, serde_json::Value>>,
    errors: Vec<ValidationError>,
}

impl ScoreBuilder {
    fn new(trace_id: String, observation_id: Option<String>) -> Self {
        Self {
            trace_id,
            observation_id,
            name: None,
            value: 0.0,
            string_value: None,
            data_type: ScoreDataType::Numeric,
            source: None,
            comment: None,
            config_id: None,
            environment: None,
            metadata: None,
            errors: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn numeric(mut self, value: f64) -> Self {
        self.data_type = ScoreDataType::Numeric;
        self.value = value;
        self
    }

    /// Convenience setter that also checks `value` falls within `range`.
    pub fn value_in_range(mut self, value: f64, range: std::ops::RangeInclusive<f64>) -> Self {
        if !range.contains(&value) {
            self.errors.push(ValidationError::InvalidValue {
                entity: "Score",
                field: "value",
                reason: format!("{value} outside expected range {:?}", range),
            });
        }
        self.data_type = ScoreDataType::Numeric;
        self.value = value;
        self
    }

    pub fn categorical(mut self, value: impl Into<String>) -> Self {
        self.data_type = ScoreDataType::Categorical;
        self.string_value = Some(value.into());
        self
    }

    pub fn boolean(mut self, value: bool) -> Self {
        self.data_type = ScoreDataType::Boolean;
        self.value = if value { 1.0 } else { 0.0 };
        self
    }

    pub fn source(mut self, source: ScoreSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn config_id(mut self, config_id: impl Into<String>) -> Self {
        self.config_id = Some(config_id.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        if let Err(err) = validate_metadata(&metadata, "Score") {
            self.errors.push(err);
        }
        self.metadata = Some(metadata);
        self
    }

    pub async fn create(mut self, client: &dyn Enqueuer, ctx: &Context) -> Result<(), BuilderError> {
        let name = match self.name.take() {
            Some(name) if !name.is_empty() => name,
            _ => {
                self.errors.push(ValidationError::MissingField { entity: "Score", field: "name" });
                String::new()
            }
        };
        if self.data_type == ScoreDataType::Categorical && self.string_value.as_deref().map_or(true, str::is_empty) {
            self.errors.push(ValidationError::MissingField { entity: "Score", field: "string_value" });
        }
        if !self.errors.is_empty() {
            return Err(BuilderError::Validation(self.errors));
        }

        let score = Score {
            trace_id: self.trace_id,
            observation_id: self.observation_id,
            name,
            value: self.value,
            string_value: self.string_value,
            data_type: self.data_type,
            source: self.source,
            comment: self.comment,
            config_id: self.config_id,
            environment: self.environment,
            metadata: self.metadata,
        };
        let event_id = client.new_id().unwrap_or_default();
        client
            .enqueue(IngestionEvent { id: event_id, timestamp: Utc::now(), body: IngestionEventBody::ScoreCreate(score) }, ctx)
            .await?;
        Ok(())
    }
}

/// Outcome of iterating a batch of builders sequentially: `total` attempted, `succeeded` contexts
/// in order, and `errors` indexed by the attempt's position in the input.
#[derive(Debug)]
pub struct BuilderBatchResult<T> {
    pub total: usize,
    pub succeeded: Vec<T>,
    pub errors: Vec<(usize, BuilderError)>,
}

async fn run_batch<T>(
    total: usize,
    stop_on_error: bool,
    mut attempts: impl Iterator<Item = std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, BuilderError>> + Send>>>,
) -> BuilderBatchResult<T> {
    let mut succeeded = Vec::new();
    let mut errors = Vec::new();
    let mut index = 0;
    while let Some(fut) = attempts.next() {
        match fut.await {
            Ok(value) => succeeded.push(value),
            Err(err) => {
                errors.push((index, err));
                if stop_on_error {
                    break;
                }
            }
        }
        index += 1;
    }
    BuilderBatchResult { total, succeeded, errors }
}

pub async fn batch_traces(
    client: &dyn Enqueuer,
    ctx: &Context,
    builders: Vec<TraceBuilder>,
    stop_on_error: bool,
) -> BuilderBatchResult<TraceContext> {
    let total = builders.len();
    let attempts = builders.into_iter().map(|b| {
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<TraceContext, BuilderError>> + Send>> =
            Box::pin(async move { b.build_and_enqueue_erased(client, ctx).await });
        fut
    });
    run_batch(total, stop_on_error, attempts).await
}

pub async fn batch_spans(
    client: &dyn Enqueuer,
    ctx: &Context,
    builders: Vec<SpanBuilder>,
    stop_on_error: bool,
) -> BuilderBatchResult<ObservationContext> {
    let total = builders.len();
    let attempts = builders.into_iter().map(|b| {
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<ObservationContext, BuilderError>> + Send>> =
            Box::pin(async move { b.create(client, ctx).await });
        fut
    });
    run_batch(total, stop_on_error, attempts).await
}

impl TraceBuilder {
    async fn build_and_enqueue_erased(self, client: &dyn Enqueuer, ctx: &Context) -> Result<TraceContext, BuilderError> {
        self.build_and_enqueue(client, ctx).await
    }
}
