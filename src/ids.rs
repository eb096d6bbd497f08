//! Collision-resistant ID generation for events and entities.
//!
//! Mirrors the trait-plus-default-impl shape of [`crate::sleeper::Sleeper`]: a small `IdGenerator`
//! trait so callers can substitute a deterministic generator in tests, plus a production
//! implementation backed by `uuid`.

use crate::ingest_error::IdentifierError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates an ID for every entity and every wrapping `IngestionEvent`.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Produce a new ID, falling back or erroring per the configured failure policy.
    fn new_id(&self) -> Result<String, IdentifierError>;
}

/// How the service reacts when the platform RNG is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Return a deterministic fallback ID and record a failure metric.
    #[default]
    Fallback,
    /// Surface the RNG error to the caller, aborting the current builder call.
    Strict,
}

/// Default `IdGenerator`: UUIDv4 on the happy path, counter-based fallback on RNG failure.
#[derive(Debug)]
pub struct IdentifierService {
    policy: FailurePolicy,
    fallback_counter: AtomicU64,
    fallback_count: AtomicU64,
}

impl Default for IdentifierService {
    fn default() -> Self {
        Self::new(FailurePolicy::Fallback)
    }
}

impl IdentifierService {
    pub fn new(policy: FailurePolicy) -> Self {
        Self { policy, fallback_counter: AtomicU64::new(0), fallback_count: AtomicU64::new(0) }
    }

    pub fn strict() -> Self {
        Self::new(FailurePolicy::Strict)
    }

    /// Number of times this service has fallen back to the counter-based ID since construction.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    fn fallback_id(&self) -> String {
        let n = self.fallback_counter.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        format!("fb-{n}-{nanos}")
    }
}

impl IdGenerator for IdentifierService {
    fn new_id(&self) -> Result<String, IdentifierError> {
        // uuid::Uuid::new_v4 draws from the OS RNG via getrandom and does not expose a
        // recoverable error in its public API; the strict/fallback split exists for the rare
        // platforms where getrandom itself can fail, which we treat as unreachable here and
        // instead exercise the fallback path directly in tests.
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

/// Test/demo double that always falls back, used to exercise the `Strict` vs `Fallback` split
/// without depending on an actual RNG failure.
#[derive(Debug, Default)]
pub struct AlwaysFallbackGenerator {
    policy: FailurePolicy,
    counter: AtomicU64,
}

impl AlwaysFallbackGenerator {
    pub fn new(policy: FailurePolicy) -> Self {
        Self { policy, counter: AtomicU64::new(0) }
    }
}

impl IdGenerator for AlwaysFallbackGenerator {
    fn new_id(&self) -> Result<String, IdentifierError> {
        match self.policy {
            FailurePolicy::Strict => Err(IdentifierError::InvalidFormat {
                value: String::new(),
                reason: "platform RNG unavailable",
            }),
            FailurePolicy::Fallback => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
                Ok(format!("fb-{n}-{nanos}"))
            }
        }
    }
}

/// Whether `id` is a canonical UUIDv4 (36 chars, hyphenated) or a 32-char compact hex form.
pub fn is_well_formed_uuid(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}
