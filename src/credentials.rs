//! Credential pool
//!
//! Tracks per-credential request counters against the provider's per-minute
//! and per-day ceilings and hands out the next eligible credential
//! round-robin. The wall clock is injected so rollover behavior is testable.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Duration;

use crate::{
    app_config::QuotaLimits,
    error::{AppError, AppResult},
};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    /// Key tail for logs; the full secret never leaves `key`.
    pub name: String,
    pub key: String,
    rpm_count: u32,
    rpd_count: u32,
    minute_stamp: i64,
    day_stamp: i64,
}

impl Credential {
    fn new(key: String, now: DateTime<Utc>) -> Self {
        let tail = key.chars().rev().take(4).collect::<Vec<_>>();
        let name = format!("...{}", tail.into_iter().rev().collect::<String>());
        Self {
            name,
            key,
            rpm_count: 0,
            rpd_count: 0,
            minute_stamp: minute_stamp(now),
            day_stamp: day_stamp(now),
        }
    }
}

fn minute_stamp(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(60)
}

fn day_stamp(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(86_400)
}

/// Owns the credential counters and nothing else; it has no knowledge of
/// batch content. Mutated only from the orchestrator's single logical thread.
pub struct CredentialPool {
    credentials: Vec<Credential>,
    cursor: usize,
    limits: QuotaLimits,
    clock: Arc<dyn Clock>,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>, limits: QuotaLimits, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let credentials = keys.into_iter().map(|k| Credential::new(k, now)).collect();
        Self {
            credentials,
            cursor: 0,
            limits,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn credential(&self, idx: usize) -> &Credential {
        &self.credentials[idx]
    }

    /// Advances the round-robin cursor without consuming quota. Used when the
    /// provider rate-limits a key that our own counters considered eligible.
    pub fn rotate(&mut self) {
        if !self.credentials.is_empty() {
            self.cursor = (self.cursor + 1) % self.credentials.len();
        }
    }

    /// Counters reset lazily: a credential untouched across a rollover still
    /// reads as fresh the next time it is inspected.
    fn roll_counters(&mut self, idx: usize) {
        let now = self.clock.now();
        let cred = &mut self.credentials[idx];

        let minute = minute_stamp(now);
        if minute != cred.minute_stamp {
            cred.rpm_count = 0;
            cred.minute_stamp = minute;
        }

        let day = day_stamp(now);
        if day != cred.day_stamp {
            cred.rpd_count = 0;
            cred.day_stamp = day;
        }
    }

    pub fn is_eligible(&mut self, idx: usize) -> bool {
        self.roll_counters(idx);
        let cred = &self.credentials[idx];
        cred.rpm_count < self.limits.requests_per_minute
            && cred.rpd_count < self.limits.requests_per_day
    }

    pub fn record_usage(&mut self, idx: usize) {
        self.roll_counters(idx);
        let cred = &mut self.credentials[idx];
        cred.rpm_count += 1;
        cred.rpd_count += 1;
    }

    fn scan(&mut self) -> Option<usize> {
        for offset in 0..self.credentials.len() {
            let idx = (self.cursor + offset) % self.credentials.len();
            if self.is_eligible(idx) {
                self.cursor = idx;
                return Some(idx);
            }
        }
        None
    }

    fn all_day_capped(&mut self) -> bool {
        (0..self.credentials.len()).all(|idx| {
            self.roll_counters(idx);
            self.credentials[idx].rpd_count >= self.limits.requests_per_day
        })
    }

    /// Blocks until some credential is under both caps. When every credential
    /// is only minute-capped, parks until just past the next minute boundary,
    /// resets minute counters, and retries once. All credentials day-capped is
    /// fatal to the run.
    pub async fn await_eligible(&mut self) -> AppResult<usize> {
        if let Some(idx) = self.scan() {
            return Ok(idx);
        }

        if self.all_day_capped() {
            return Err(AppError::QuotaExceeded);
        }

        let second = self.clock.now().timestamp().rem_euclid(60);
        let wait = Duration::from_secs((60 - second as u64) + 1);
        tracing::info!("all credentials at rpm cap, waiting {:?} for minute rollover", wait);
        tokio::time::sleep(wait).await;

        for cred in &mut self.credentials {
            cred.rpm_count = 0;
            cred.minute_stamp = minute_stamp(self.clock.now());
        }

        self.scan().ok_or(AppError::QuotaExceeded)
    }
}
