//! Per-address vote abuse heuristic.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use frictionary_core::VoteSign;
use lru::LruCache;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VoteRejection {
    #[error("invalid vote")]
    InvalidVote,
    #[error("already voted")]
    AlreadyVoted,
    #[error("rate limited")]
    RateLimited,
}

#[derive(Debug, Clone)]
pub struct VoteGateConfig {
    pub max_votes_per_window: usize,
    pub window: Duration,
    /// Maximum number of tracked addresses; least recently active ones are dropped first.
    pub capacity: NonZeroUsize,
}

impl Default for VoteGateConfig {
    fn default() -> Self {
        Self {
            max_votes_per_window: 50,
            window: Duration::minutes(60),
            capacity: NonZeroUsize::new(10_000).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRecord {
    pub suggestion_id: String,
    pub sign: VoteSign,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AddressHistory {
    votes: Vec<VoteRecord>,
    last_activity: Option<DateTime<Utc>>,
}

impl AddressHistory {
    fn is_idle(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_activity.is_none_or(|at| at <= now - window)
    }
}

/// In-memory vote history keyed by remote address.
///
/// Addresses inactive for longer than the rate-limit window are forgotten, as are
/// the least recently active ones once `capacity` addresses are tracked.
#[derive(Debug)]
pub struct VoteGate {
    config: VoteGateConfig,
    addresses: Mutex<LruCache<String, AddressHistory>>,
}

impl Default for VoteGate {
    fn default() -> Self {
        Self::new(VoteGateConfig::default())
    }
}

impl VoteGate {
    pub fn new(config: VoteGateConfig) -> Self {
        let addresses = Mutex::new(LruCache::new(config.capacity));
        Self { config, addresses }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, AddressHistory>> {
        self.addresses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evaluate(
        &self,
        history: Option<&AddressHistory>,
        suggestion_id: &str,
        sign: VoteSign,
        now: DateTime<Utc>,
    ) -> Result<(), VoteRejection> {
        let Some(history) = history.filter(|h| !h.is_idle(now, self.config.window)) else {
            return Ok(());
        };

        let net: i64 = history
            .votes
            .iter()
            .filter(|v| v.suggestion_id == suggestion_id)
            .map(|v| v.sign.as_i64())
            .sum();
        if (net + sign.as_i64()).abs() >= 2 {
            return Err(VoteRejection::AlreadyVoted);
        }

        let horizon = now - self.config.window;
        let recent = history.votes.iter().filter(|v| v.at > horizon).count();
        if recent + 1 > self.config.max_votes_per_window {
            return Err(VoteRejection::RateLimited);
        }

        Ok(())
    }

    /// Decides whether `vote` from `address` may go through, without recording it.
    pub fn check(
        &self,
        address: &str,
        suggestion_id: &str,
        vote: i64,
        now: DateTime<Utc>,
    ) -> Result<VoteSign, VoteRejection> {
        let sign = VoteSign::try_from(vote).map_err(|_| VoteRejection::InvalidVote)?;
        let addresses = self.lock();
        self.evaluate(addresses.peek(address), suggestion_id, sign, now)?;
        Ok(sign)
    }

    pub fn record(&self, address: &str, suggestion_id: &str, sign: VoteSign, now: DateTime<Utc>) {
        let mut addresses = self.lock();
        self.append(&mut addresses, address, suggestion_id, sign, now);
    }

    fn append(
        &self,
        addresses: &mut LruCache<String, AddressHistory>,
        address: &str,
        suggestion_id: &str,
        sign: VoteSign,
        now: DateTime<Utc>,
    ) {
        let history = addresses.get_or_insert_mut(address.to_string(), AddressHistory::default);
        // an idle history starts over
        if history.is_idle(now, self.config.window) {
            history.votes.clear();
        }
        history.votes.push(VoteRecord {
            suggestion_id: suggestion_id.to_string(),
            sign,
            at: now,
        });
        history.last_activity = Some(now);
    }

    /// Check and record in one step.
    pub fn admit(
        &self,
        address: &str,
        suggestion_id: &str,
        vote: i64,
        now: DateTime<Utc>,
    ) -> Result<VoteSign, VoteRejection> {
        let sign = VoteSign::try_from(vote).map_err(|_| VoteRejection::InvalidVote)?;
        let mut addresses = self.lock();

        if let Err(rejection) = self.evaluate(addresses.peek(address), suggestion_id, sign, now) {
            debug!(address, suggestion_id, %rejection, "vote rejected");
            return Err(rejection);
        }

        self.append(&mut addresses, address, suggestion_id, sign, now);
        Ok(sign)
    }

    /// Removes the vote recorded by `admit` or `record` for this address, id and time.
    /// Returns whether a matching record was found.
    pub fn rollback(&self, address: &str, suggestion_id: &str, at: DateTime<Utc>) -> bool {
        let mut addresses = self.lock();
        let Some(history) = addresses.peek_mut(address) else {
            return false;
        };
        let Some(pos) = history
            .votes
            .iter()
            .rposition(|v| v.suggestion_id == suggestion_id && v.at == at)
        else {
            return false;
        };
        history.votes.remove(pos);
        history.last_activity = history.votes.iter().map(|v| v.at).max();
        if history.votes.is_empty() {
            addresses.pop(address);
        }
        true
    }

    /// Drops addresses with no vote inside the window. Returns how many were dropped.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let mut addresses = self.lock();
        let idle: Vec<String> = addresses
            .iter()
            .filter(|(_, h)| h.is_idle(now, self.config.window))
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &idle {
            addresses.pop(addr);
        }
        idle.len()
    }

    pub fn tracked_addresses(&self) -> usize {
        self.lock().len()
    }
}
