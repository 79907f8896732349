//! Credential rotation with per-key sliding-window rate limits.
//!
//! Each credential carries RPM/TPM counters over 60-second windows and an
//! RPD counter over 24 hours. Selection is round-robin among eligible keys;
//! a rate-limit signal puts the offending key into cooldown, doubling on
//! repeat offence. State survives restarts via
//! `$STATE_DIR/rotation_state.json`, written by atomic rename, with daily
//! snapshots retained for 30 days.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use podgraph_common::error::PodGraphError;

pub const STATE_FILE: &str = "rotation_state.json";

const RPM_WINDOW: Duration = Duration::from_secs(60);
const TPM_WINDOW: Duration = Duration::from_secs(60);
const RPD_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const COOLDOWN_CAP: Duration = Duration::from_secs(15 * 60);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
const SNAPSHOT_RETENTION_DAYS: i64 = 30;

/// Provider-imposed limits for one credential.
#[derive(Debug, Clone, Copy)]
pub struct CredentialLimits {
    pub rpm: u32,
    pub tpm: u32,
    pub rpd: u32,
}

impl Default for CredentialLimits {
    fn default() -> Self {
        Self {
            rpm: 10,
            tpm: 250_000,
            rpd: 1_500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub limits: CredentialLimits,
    pub max_wait: Duration,
    /// At most one in-flight call per credential when set.
    pub strict_serialize: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            limits: CredentialLimits::default(),
            max_wait: Duration::from_secs(120),
            strict_serialize: false,
        }
    }
}

/// Permission to issue one provider call against a specific credential.
#[derive(Debug)]
pub struct Lease {
    pub api_key: String,
    pub key_hint: String,
    index: usize,
    est_tokens: u32,
}

/// What happened to the leased call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallResult {
    Ok,
    RateLimited { retry_after: Option<Duration> },
    Failed,
}

struct CredentialState {
    key: String,
    hint: String,
    request_times: VecDeque<Instant>,
    token_events: VecDeque<(Instant, u32)>,
    day_requests: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    /// Sticky base for doubling; reset on a successful call.
    cooldown_base: Duration,
    failure_streak: u32,
    in_flight: u32,
}

impl CredentialState {
    fn new(key: String) -> Self {
        let hint = key_hint(&key);
        Self {
            key,
            hint,
            request_times: VecDeque::new(),
            token_events: VecDeque::new(),
            day_requests: VecDeque::new(),
            cooldown_until: None,
            cooldown_base: DEFAULT_COOLDOWN,
            failure_streak: 0,
            in_flight: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while self
            .request_times
            .front()
            .is_some_and(|t| now.duration_since(*t) >= RPM_WINDOW)
        {
            self.request_times.pop_front();
        }
        while self
            .token_events
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) >= TPM_WINDOW)
        {
            self.token_events.pop_front();
        }
        while self
            .day_requests
            .front()
            .is_some_and(|t| now.duration_since(*t) >= RPD_WINDOW)
        {
            self.day_requests.pop_front();
        }
        if self.cooldown_until.is_some_and(|until| now >= until) {
            self.cooldown_until = None;
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.token_events.iter().map(|(_, t)| *t as u64).sum()
    }

    fn admits(&self, limits: &CredentialLimits, est_tokens: u32, strict: bool) -> bool {
        if self.cooldown_until.is_some() {
            return false;
        }
        if strict && self.in_flight > 0 {
            return false;
        }
        if self.request_times.len() as u32 >= limits.rpm {
            return false;
        }
        if self.day_requests.len() as u32 >= limits.rpd {
            return false;
        }
        self.tokens_in_window() + est_tokens as u64 <= limits.tpm as u64
    }

    /// Earliest instant at which this credential could admit again.
    fn next_eligible(&self, now: Instant) -> Option<Instant> {
        let mut candidates = Vec::new();
        if let Some(until) = self.cooldown_until {
            candidates.push(until);
        }
        if let Some(first) = self.request_times.front() {
            candidates.push(*first + RPM_WINDOW);
        }
        if let Some((first, _)) = self.token_events.front() {
            candidates.push(*first + TPM_WINDOW);
        }
        candidates.into_iter().filter(|t| *t > now).min()
    }
}

struct RotatorInner {
    credentials: Vec<CredentialState>,
    cursor: usize,
}

/// Multiplexes provider calls across a pool of API credentials.
pub struct CredentialRotator {
    inner: Mutex<RotatorInner>,
    config: RotationConfig,
    notify: Notify,
    state_path: Option<PathBuf>,
}

impl CredentialRotator {
    /// Build a rotator over `keys`, restoring persisted day-window counts
    /// and cooldowns from `state_dir` when present.
    pub fn new(
        keys: Vec<String>,
        config: RotationConfig,
        state_dir: Option<&Path>,
    ) -> Result<Self, PodGraphError> {
        if keys.is_empty() {
            return Err(PodGraphError::Config(
                "credential rotator needs at least one key".to_string(),
            ));
        }
        let mut credentials: Vec<CredentialState> =
            keys.into_iter().map(CredentialState::new).collect();

        let state_path = state_dir.map(|d| d.join(STATE_FILE));
        if let Some(path) = &state_path {
            if let Some(persisted) = PersistedState::load(path) {
                restore(&mut credentials, &persisted);
            }
        }

        Ok(Self {
            inner: Mutex::new(RotatorInner {
                credentials,
                cursor: 0,
            }),
            config,
            notify: Notify::new(),
            state_path,
        })
    }

    /// Block until a credential admits the estimated cost, up to
    /// `max_wait`; round-robin among eligible credentials.
    pub async fn acquire(&self, est_tokens: u32) -> Result<Lease, PodGraphError> {
        let deadline = Instant::now() + self.config.max_wait;
        loop {
            let wait = {
                let mut inner = self.inner.lock().expect("rotator mutex poisoned");
                let now = Instant::now();
                if let Some(lease) = try_acquire(&mut inner, &self.config, est_tokens, now) {
                    debug!(key = lease.key_hint.as_str(), "credential lease acquired");
                    return Ok(lease);
                }
                next_wait(&inner, now)
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(PodGraphError::NoCredentialAvailable(self.config.max_wait));
            }
            let sleep = wait
                .unwrap_or(Duration::from_millis(500))
                .min(deadline - now)
                .max(Duration::from_millis(20));
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Update counters with the actual cost and outcome of the call.
    pub fn release(&self, lease: Lease, actual_tokens: u32, result: CallResult) {
        {
            let mut inner = self.inner.lock().expect("rotator mutex poisoned");
            let now = Instant::now();
            let cred = &mut inner.credentials[lease.index];
            cred.in_flight = cred.in_flight.saturating_sub(1);

            // The estimate was recorded at acquire time; top up if the call
            // cost more than estimated. Under-use is left in place so the
            // window can never be exceeded by a correction.
            if actual_tokens > lease.est_tokens {
                cred.token_events
                    .push_back((now, actual_tokens - lease.est_tokens));
            }

            match result {
                CallResult::Ok => {
                    cred.failure_streak = 0;
                    cred.cooldown_base = DEFAULT_COOLDOWN;
                }
                CallResult::RateLimited { retry_after } => {
                    let base = retry_after
                        .unwrap_or(DEFAULT_COOLDOWN)
                        .min(DEFAULT_COOLDOWN);
                    let cooldown = base.max(cred.cooldown_base).min(COOLDOWN_CAP);
                    cred.cooldown_until = Some(now + cooldown);
                    cred.cooldown_base = (cooldown * 2).min(COOLDOWN_CAP);
                    cred.failure_streak += 1;
                    warn!(
                        key = cred.hint.as_str(),
                        cooldown_secs = cooldown.as_secs(),
                        streak = cred.failure_streak,
                        "credential rate limited, cooling down"
                    );
                }
                CallResult::Failed => {
                    cred.failure_streak += 1;
                }
            }
        }
        self.persist();
        self.notify.notify_waiters();
    }

    /// Per-key counters and cooldowns, as persisted.
    pub fn status(&self) -> RotationStatus {
        let mut inner = self.inner.lock().expect("rotator mutex poisoned");
        let now = Instant::now();
        let wall_now = Utc::now();
        let per_key = inner
            .credentials
            .iter_mut()
            .map(|cred| {
                cred.prune(now);
                KeyStatus {
                    hint: cred.hint.clone(),
                    window_counts: WindowCounts {
                        rpm: cred.request_times.len() as u32,
                        tpm: cred.tokens_in_window(),
                        rpd: cred.day_requests.len() as u32,
                    },
                    cooldown_until: cred.cooldown_until.map(|until| {
                        wall_now
                            + chrono::Duration::from_std(until.duration_since(now))
                                .unwrap_or_default()
                    }),
                    failure_streak: cred.failure_streak,
                }
            })
            .collect();
        RotationStatus {
            version: 1,
            per_key,
            updated_at: wall_now,
        }
    }

    fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let status = self.status();
        if let Err(e) = status.write_atomic(path) {
            warn!(error = %e, "failed to persist rotation state");
        }
    }

    /// Remove snapshot backups older than the retention window. Returns the
    /// number of files removed.
    pub fn cleanup_old_snapshots(&self) -> usize {
        let Some(path) = &self.state_path else {
            return 0;
        };
        let Some(dir) = path.parent() else {
            return 0;
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        let cutoff = Utc::now() - chrono::Duration::days(SNAPSHOT_RETENTION_DAYS);
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = snapshot_date(name) else {
                continue;
            };
            if date < cutoff.date_naive() && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up old rotation snapshots");
        }
        removed
    }
}

fn try_acquire(
    inner: &mut RotatorInner,
    config: &RotationConfig,
    est_tokens: u32,
    now: Instant,
) -> Option<Lease> {
    let count = inner.credentials.len();
    for offset in 0..count {
        let index = (inner.cursor + offset) % count;
        let cred = &mut inner.credentials[index];
        cred.prune(now);
        if cred.admits(&config.limits, est_tokens, config.strict_serialize) {
            cred.request_times.push_back(now);
            cred.day_requests.push_back(now);
            cred.token_events.push_back((now, est_tokens));
            cred.in_flight += 1;
            inner.cursor = (index + 1) % count;
            return Some(Lease {
                api_key: cred.key.clone(),
                key_hint: cred.hint.clone(),
                index,
                est_tokens,
            });
        }
    }
    None
}

fn next_wait(inner: &RotatorInner, now: Instant) -> Option<Duration> {
    inner
        .credentials
        .iter()
        .filter_map(|c| c.next_eligible(now))
        .min()
        .map(|t| t.duration_since(now))
}

fn key_hint(key: &str) -> String {
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowCounts {
    pub rpm: u32,
    pub tpm: u64,
    pub rpd: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStatus {
    pub hint: String,
    pub window_counts: WindowCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub failure_streak: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationStatus {
    pub version: u32,
    pub per_key: Vec<KeyStatus>,
    pub updated_at: DateTime<Utc>,
}

type PersistedState = RotationStatus;

impl RotationStatus {
    fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write_atomic(&self, path: &Path) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        // One dated snapshot per day, cleaned up after 30 days.
        let snapshot = dir.join(format!(
            "rotation_state.{}.backup",
            self.updated_at.format("%Y-%m-%d")
        ));
        if !snapshot.exists() {
            let _ = std::fs::copy(path, snapshot);
        }
        Ok(())
    }
}

/// Restore persisted day-window counts and cooldowns onto fresh credential
/// state, matched by key hint. Minute windows are not restored: they expire
/// within 60 s of startup anyway.
fn restore(credentials: &mut [CredentialState], persisted: &PersistedState) {
    let now = Instant::now();
    let wall_now = Utc::now();
    for cred in credentials.iter_mut() {
        let Some(saved) = persisted.per_key.iter().find(|k| k.hint == cred.hint) else {
            continue;
        };
        for _ in 0..saved.window_counts.rpd {
            cred.day_requests.push_back(now);
        }
        cred.failure_streak = saved.failure_streak;
        if let Some(until) = saved.cooldown_until {
            if until > wall_now {
                let remaining = (until - wall_now).to_std().unwrap_or_default();
                cred.cooldown_until = Some(now + remaining);
            }
        }
    }
    info!(keys = persisted.per_key.len(), "restored rotation state");
}

fn snapshot_date(file_name: &str) -> Option<chrono::NaiveDate> {
    let rest = file_name.strip_prefix("rotation_state.")?;
    let date = rest.strip_suffix(".backup")?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
