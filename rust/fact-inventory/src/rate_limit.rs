//! Per-address admission control for fact submissions.
//!
//! Each client address owns one slot in a sharded map. The admit/reject
//! decision and the provisional record of an admission happen while holding
//! only that slot's entry lock, so submissions from one address are decided
//! one at a time while unrelated addresses proceed in parallel. No lock is
//! held across storage I/O.
//!
//! An admission is provisional until the caller resolves its [`Permit`]:
//! `commit` once the record is durably written, `release` when the write
//! failed. Releasing restores the previous accepted time and arms a short
//! cooldown instead of a full interval.

use crate::{
    config::RateLimitConfig,
    repository::{FactRepository, StorageError},
};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::{
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Remaining wait before a rejected client may submit again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAfter(Duration);

impl RetryAfter {
    pub fn new(remaining: Duration) -> Self {
        Self(remaining)
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Whole seconds, rounded up.
    pub fn as_secs(&self) -> u64 {
        let secs = self.0.as_secs();
        if self.0.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    /// Whole minutes, rounded up, never below one.
    pub fn as_minutes(&self) -> u64 {
        self.as_secs().div_ceil(60).max(1)
    }
}

impl fmt::Display for RetryAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_minutes() {
            1 => write!(f, "Wait 1 minute."),
            minutes => write!(f, "Wait {minutes} minutes."),
        }
    }
}

/// Outcome of [`RateLimiter::check_and_record`].
#[derive(Debug)]
pub enum Admission {
    Admitted(Permit),
    Rejected { retry_after: RetryAfter },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    ticket: u64,
    admitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    last_accepted: Option<DateTime<Utc>>,
    in_flight: Option<InFlight>,
    cooldown_until: Option<DateTime<Utc>>,
}

impl Slot {
    fn seeded(last_accepted: Option<DateTime<Utc>>) -> Self {
        Self {
            last_accepted,
            ..Self::default()
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, interval: TimeDelta) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        if self.cooldown_until.is_some_and(|until| until > now) {
            return false;
        }
        self.last_accepted.map_or(true, |last| now - last >= interval)
    }
}

struct Inner {
    interval: TimeDelta,
    storage_retry_cooldown: TimeDelta,
    slots: DashMap<IpAddr, Slot>,
    history: Arc<dyn FactRepository>,
    next_ticket: AtomicU64,
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, history: Arc<dyn FactRepository>) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval: to_delta(config.interval),
                storage_retry_cooldown: to_delta(config.storage_retry_cooldown),
                slots: DashMap::new(),
                history,
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    /// Decide whether `address` may submit at `now`, recording a provisional
    /// admission when it may.
    ///
    /// The first time an address is seen its last accepted submission is
    /// looked up in storage; a failed lookup is returned as-is and records
    /// nothing.
    pub async fn check_and_record(
        &self,
        address: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<Admission, StorageError> {
        if let Some(admission) = self.decide_existing(address, now) {
            return Ok(admission);
        }

        let seed = self.inner.history.last_submission_time(address).await?;
        let mut slot = self
            .inner
            .slots
            .entry(address)
            .or_insert_with(|| Slot::seeded(seed));
        Ok(self.decide(&mut slot, address, now))
    }

    /// Decide under the slot's lock when the address already has one.
    fn decide_existing(&self, address: IpAddr, now: DateTime<Utc>) -> Option<Admission> {
        let mut slot = self.inner.slots.get_mut(&address)?;
        Some(self.decide(&mut slot, address, now))
    }

    fn decide(&self, slot: &mut Slot, address: IpAddr, now: DateTime<Utc>) -> Admission {
        let reference = slot
            .in_flight
            .map(|flight| flight.admitted_at)
            .or(slot.last_accepted);
        if let Some(last) = reference {
            let elapsed = (now - last).max(TimeDelta::zero());
            if elapsed < self.inner.interval {
                return rejected(self.inner.interval - elapsed);
            }
        }
        if let Some(until) = slot.cooldown_until.filter(|until| *until > now) {
            return rejected(until - now);
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        slot.in_flight = Some(InFlight {
            ticket,
            admitted_at: now,
        });
        slot.cooldown_until = None;

        Admission::Admitted(Permit {
            limiter: self.clone(),
            address,
            ticket,
            admitted_at: now,
            resolved: false,
        })
    }

    /// Drop slots that no longer influence any decision. A dropped address is
    /// re-seeded from storage the next time it submits.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.inner.slots.len();
        let interval = self.inner.interval;
        self.inner
            .slots
            .retain(|_, slot| !slot.is_stale(now, interval));
        before.saturating_sub(self.inner.slots.len())
    }

    pub fn tracked_addresses(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = limiter.prune(Utc::now());
                if removed > 0 {
                    debug!(
                        removed,
                        remaining = limiter.tracked_addresses(),
                        "pruned idle rate limit slots"
                    );
                }
            }
        })
    }

    fn commit_slot(&self, address: IpAddr, ticket: u64, created_at: DateTime<Utc>) {
        let mut slot = self.inner.slots.entry(address).or_default();
        slot.last_accepted = Some(match slot.last_accepted {
            Some(previous) => previous.max(created_at),
            None => created_at,
        });
        if slot.in_flight.is_some_and(|flight| flight.ticket == ticket) {
            slot.in_flight = None;
        }
    }

    fn release_slot(&self, address: IpAddr, ticket: u64, now: DateTime<Utc>) {
        if let Some(mut slot) = self.inner.slots.get_mut(&address) {
            if slot.in_flight.is_some_and(|flight| flight.ticket == ticket) {
                slot.in_flight = None;
                slot.cooldown_until = Some(
                    now.checked_add_signed(self.inner.storage_retry_cooldown)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                );
            }
        }
    }
}

/// A provisional admission. Resolve it with [`Permit::commit`] or
/// [`Permit::release`]; an unresolved permit releases itself on drop.
#[must_use = "an unresolved permit is released when dropped"]
pub struct Permit {
    limiter: RateLimiter,
    address: IpAddr,
    ticket: u64,
    admitted_at: DateTime<Utc>,
    resolved: bool,
}

impl Permit {
    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }

    /// The submission was durably written at `created_at`.
    pub fn commit(mut self, created_at: DateTime<Utc>) {
        self.resolved = true;
        self.limiter.commit_slot(self.address, self.ticket, created_at);
    }

    /// The submission was not written; restore the previous state.
    pub fn release(mut self, now: DateTime<Utc>) {
        self.resolved = true;
        self.limiter.release_slot(self.address, self.ticket, now);
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("address", &self.address)
            .field("ticket", &self.ticket)
            .field("admitted_at", &self.admitted_at)
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(client_address = %self.address, "rate limit permit dropped unresolved; releasing");
            self.limiter.release_slot(self.address, self.ticket, Utc::now());
        }
    }
}

fn rejected(remaining: TimeDelta) -> Admission {
    Admission::Rejected {
        retry_after: RetryAfter::new(remaining.to_std().unwrap_or_default()),
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
