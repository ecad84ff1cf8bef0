//! Per-provider circuit breaker and health tracking.
//!
//! Each provider id gets a [`ProviderHealth`] entry the first time it is
//! referenced. The breaker has three states:
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: the provider failed `failure_threshold` times in a row and is
//!   not called
//! - **Half-open**: the cooldown has elapsed; the next call is a probe and a
//!   success closes the circuit again
//!
//! A failure while half-open leaves the failure counter at or above the
//! threshold, so the circuit reopens and the cooldown restarts.
//!
//! # Usage
//!
//! ```rust
//! use materials_master::utils::{CircuitState, HealthManager, HealthPolicy};
//! use std::time::Duration;
//!
//! let health = HealthManager::new(HealthPolicy::default());
//! for _ in 0..3 {
//!     health.record_failure("mp");
//! }
//! assert_eq!(health.state("mp"), CircuitState::Open);
//! assert!(!health.should_query("mp"));
//!
//! health.record_success("oqmd", Duration::from_millis(120));
//! assert!(health.should_query("oqmd"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::persist::{read_json, write_json, PersistError};

/// Failures in a row before a circuit opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Time an open circuit waits before allowing a probe
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Weight of the previous average in the latency EMA
const LATENCY_SMOOTHING: f64 = 0.9;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    #[default]
    Closed,
    /// Failing - calls are not made
    Open,
    /// Testing recovery - the next call is a probe
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one provider, as persisted in the health snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub consecutive_failures: u32,

    pub circuit_state: CircuitState,

    /// Time of the most recent failure (epoch seconds on disk)
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_failure: Option<DateTime<Utc>>,

    /// Exponentially smoothed latency of successful calls
    #[serde(default)]
    pub avg_latency_ms: f64,

    #[serde(default)]
    pub success_count: u64,

    #[serde(default)]
    pub failure_count: u64,
}

impl ProviderHealth {
    fn observe_latency(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = if self.success_count == 0 {
            sample
        } else {
            LATENCY_SMOOTHING * self.avg_latency_ms + (1.0 - LATENCY_SMOOTHING) * sample
        };
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

type Entry = Arc<Mutex<ProviderHealth>>;

/// Registry of per-provider health entries.
///
/// Each entry has its own lock, so completions from different providers
/// never contend with each other.
#[derive(Debug, Default)]
pub struct HealthManager {
    entries: RwLock<HashMap<String, Entry>>,
    policy: HealthPolicy,
    path: Option<PathBuf>,
}

impl HealthManager {
    /// Create an in-memory manager
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            path: None,
        }
    }

    /// Persist to `path` on [`save`](Self::save)
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Restore a snapshot written by [`save`](Self::save).
    ///
    /// A missing or unreadable file yields an empty registry.
    pub fn load(path: impl Into<PathBuf>, policy: HealthPolicy) -> Self {
        let path = path.into();
        let manager = Self::new(policy).with_path(&path);

        if !path.exists() {
            return manager;
        }

        match read_json::<BTreeMap<String, ProviderHealth>>(&path) {
            Ok(snapshot) => {
                tracing::debug!(
                    "[circuit-breaker] restored {} provider(s) from {}",
                    snapshot.len(),
                    path.display()
                );
                let mut entries = manager.write_entries();
                for (id, health) in snapshot {
                    entries.insert(id, Arc::new(Mutex::new(health)));
                }
            }
            Err(e) => {
                tracing::warn!("[circuit-breaker] discarding health snapshot: {}", e);
            }
        }
        manager
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get or create the entry for a provider
    fn entry(&self, provider_id: &str) -> Entry {
        if let Some(entry) = self.read_entries().get(provider_id) {
            return Arc::clone(entry);
        }

        let mut entries = self.write_entries();
        Arc::clone(entries.entry(provider_id.to_string()).or_default())
    }

    fn with_entry<R>(&self, provider_id: &str, f: impl FnOnce(&mut ProviderHealth) -> R) -> R {
        let entry = self.entry(provider_id);
        let mut health = entry.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut health)
    }

    /// Whether a call to the provider is currently permitted
    pub fn should_query(&self, provider_id: &str) -> bool {
        self.should_query_at(provider_id, Utc::now())
    }

    /// [`should_query`](Self::should_query) evaluated at `now`.
    ///
    /// The open → half-open transition happens here, the first time the
    /// cooldown is seen to have elapsed.
    pub fn should_query_at(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        let cooldown = chrono::Duration::from_std(self.policy.cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        self.with_entry(provider_id, |health| match health.circuit_state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = health
                    .last_failure
                    .map_or(true, |failed_at| now - failed_at >= cooldown);
                if cooled {
                    health.circuit_state = CircuitState::HalfOpen;
                    tracing::info!("[circuit-breaker] {}: circuit half-open", provider_id);
                }
                cooled
            }
        })
    }

    /// Record a successful call and its latency
    pub fn record_success(&self, provider_id: &str, latency: Duration) {
        self.with_entry(provider_id, |health| {
            if health.circuit_state != CircuitState::Closed {
                tracing::info!(
                    "[circuit-breaker] {}: circuit closed (recovered)",
                    provider_id
                );
            }
            health.consecutive_failures = 0;
            health.circuit_state = CircuitState::Closed;
            health.observe_latency(latency);
            health.success_count += 1;
        });
    }

    /// Record a failed call
    pub fn record_failure(&self, provider_id: &str) {
        self.record_failure_at(provider_id, Utc::now());
    }

    pub fn record_failure_at(&self, provider_id: &str, now: DateTime<Utc>) {
        let threshold = self.policy.failure_threshold;

        self.with_entry(provider_id, |health| {
            health.consecutive_failures += 1;
            health.failure_count += 1;
            health.last_failure = Some(now);

            if health.consecutive_failures >= threshold {
                if health.circuit_state != CircuitState::Open {
                    tracing::warn!(
                        "[circuit-breaker] {}: circuit opened ({} failures)",
                        provider_id,
                        health.consecutive_failures
                    );
                }
                health.circuit_state = CircuitState::Open;
            }
        });
    }

    /// Stored state, without evaluating the cooldown
    pub fn state(&self, provider_id: &str) -> CircuitState {
        self.snapshot(provider_id)
            .map(|h| h.circuit_state)
            .unwrap_or_default()
    }

    /// Copy of a provider's entry, if it has been referenced
    pub fn snapshot(&self, provider_id: &str) -> Option<ProviderHealth> {
        let entry = self.read_entries().get(provider_id).cloned()?;
        let health = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Some(health.clone())
    }

    /// All entries, sorted by provider id
    pub fn status(&self) -> Vec<(String, ProviderHealth)> {
        let entries: Vec<(String, Entry)> = self
            .read_entries()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let mut status: Vec<(String, ProviderHealth)> = entries
            .into_iter()
            .map(|(id, entry)| {
                let health = entry.lock().unwrap_or_else(PoisonError::into_inner).clone();
                (id, health)
            })
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    /// Forget a provider's history; returns whether it was known
    pub fn reset(&self, provider_id: &str) -> bool {
        match self.read_entries().get(provider_id) {
            Some(entry) => {
                *entry.lock().unwrap_or_else(PoisonError::into_inner) = ProviderHealth::default();
                tracing::info!("[circuit-breaker] {}: reset", provider_id);
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.read_entries().values() {
            *entry.lock().unwrap_or_else(PoisonError::into_inner) = ProviderHealth::default();
        }
        tracing::info!("[circuit-breaker] all circuits reset");
    }

    /// Write the snapshot to the configured path; a no-op without one
    pub async fn save(&self) -> Result<(), PersistError> {
        match &self.path {
            Some(path) => self.save_to(path).await,
            None => Ok(()),
        }
    }

    /// Write the snapshot as a JSON object keyed by provider id
    pub async fn save_to(&self, path: &Path) -> Result<(), PersistError> {
        let snapshot: BTreeMap<String, ProviderHealth> = self.status().into_iter().collect();
        write_json(path, &snapshot).await
    }
}
