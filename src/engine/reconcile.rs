//! Level-triggered reconciliation of a wish's derived status.
//!
//! Nothing is remembered between passes: each pass re-derives `active`, the
//! conditions and the reservation set from the stored object and the clock,
//! writes them back only if they differ, and reports when the next pass is due.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::limits::MAX_RECONCILE_ATTEMPTS;
use crate::model::*;
use crate::observability;
use crate::store::StoreError;

use super::wake::next_wake;
use super::{CallContext, Engine, EngineError};

pub const CONDITION_ACTIVE: &str = "Active";
pub const CONDITION_AVAILABLE: &str = "Available";

/// Where a wish ended up after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Inactive,
    /// The wish no longer exists; nothing to do and nothing to schedule.
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub phase: Phase,
    /// When to run again. `None`: only an external change should re-trigger.
    pub requeue_after: Option<Duration>,
    /// Whether this pass wrote a new status.
    pub updated: bool,
}

impl Reconciled {
    fn gone() -> Self {
        Self {
            phase: Phase::Gone,
            requeue_after: None,
            updated: false,
        }
    }
}

/// The status a pass wants to persist, computed without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub status: WishStatus,
    pub dirty: bool,
    pub activity_changed: bool,
    /// The reservation converted from the legacy fields, if any.
    pub migrated: Option<Reservation>,
    /// Legacy fields were cleared (with or without a conversion).
    pub legacy_cleared: bool,
    pub swept: Vec<Reservation>,
    pub requeue_after: Option<Duration>,
}

impl Plan {
    pub fn phase(&self) -> Phase {
        if self.status.active {
            Phase::Active
        } else {
            Phase::Inactive
        }
    }
}

/// Set-status-condition semantics: the transition time only moves when the
/// status flips. Returns true if anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, desired: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.kind == desired.kind) else {
        conditions.push(desired);
        return true;
    };
    if existing.status != desired.status {
        *existing = desired;
        return true;
    }
    if existing.reason != desired.reason || existing.message != desired.message {
        existing.reason = desired.reason;
        existing.message = desired.message;
        return true;
    }
    false
}

fn condition(kind: &str, status: bool, reason: &str, message: String, now: Timestamp) -> Condition {
    Condition {
        kind: kind.to_string(),
        status: status.into(),
        reason: reason.to_string(),
        message,
        last_transition_time: now,
    }
}

/// Compute the next status of `wish` as of `now`.
pub fn plan(wish: &Wish, now: Timestamp) -> Plan {
    let mut status = wish.status.clone();
    let mut dirty = false;

    let active = !wish.is_expired(now);
    let activity_changed = status.active != active;
    if activity_changed {
        status.active = active;
        dirty = true;
    }

    let mut migrated = None;
    let mut legacy_cleared = false;
    if status.reservations.is_empty() {
        match status.legacy.state() {
            LegacyState::Absent => {}
            LegacyState::Convertible(reservation) => {
                status.reservations.push(reservation.clone());
                migrated = Some(reservation);
                status.legacy = LegacyReservation::default();
                legacy_cleared = true;
                dirty = true;
            }
            LegacyState::Incomplete => {
                status.legacy = LegacyReservation::default();
                legacy_cleared = true;
                dirty = true;
            }
        }
    }

    let (kept, swept): (Vec<_>, Vec<_>) = std::mem::take(&mut status.reservations)
        .into_iter()
        .partition(|r| !r.is_expired(now));
    status.reservations = kept;
    if !swept.is_empty() {
        dirty = true;
    }

    // Conditions and the wake are derived from the swept snapshot.
    let derived = Wish {
        metadata: wish.metadata.clone(),
        spec: wish.spec.clone(),
        status,
    };

    let (reason, message) = match (wish.spec.ttl, active) {
        (None, _) => ("NoTTL", "wish never expires".to_string()),
        (Some(ttl), true) => ("WithinTTL", format!("active for {ttl} after creation")),
        (Some(ttl), false) => ("TTLExpired", format!("ttl of {ttl} has elapsed")),
    };
    let mut status = derived.status.clone();
    dirty |= set_condition(
        &mut status.conditions,
        condition(CONDITION_ACTIVE, active, reason, message, now),
    );

    let available = derived.available_quantity();
    let (ok, reason, message) = if !active {
        (false, "Inactive", "wish is no longer active".to_string())
    } else if available == 0 {
        (false, "FullyReserved", "all items are reserved".to_string())
    } else {
        (
            true,
            "Available",
            format!("{available} of {} available", derived.effective_quantity()),
        )
    };
    dirty |= set_condition(
        &mut status.conditions,
        condition(CONDITION_AVAILABLE, ok, reason, message, now),
    );

    Plan {
        requeue_after: next_wake(&derived, now),
        status,
        dirty,
        activity_changed,
        migrated,
        legacy_cleared,
        swept,
    }
}

impl Engine {
    /// One reconciliation pass for `name`, bounded by `ctx`.
    pub async fn reconcile(
        &self,
        name: &str,
        ctx: &CallContext,
    ) -> Result<Reconciled, EngineError> {
        let started = std::time::Instant::now();
        let result = self.reconcile_inner(name, ctx).await;
        metrics::histogram!(observability::RECONCILE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let label = match &result {
            Ok(r) if r.updated => "updated",
            Ok(_) => "unchanged",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::RECONCILES_TOTAL, "result" => label).increment(1);
        result
    }

    async fn reconcile_inner(
        &self,
        name: &str,
        ctx: &CallContext,
    ) -> Result<Reconciled, EngineError> {
        for attempt in 1..=MAX_RECONCILE_ATTEMPTS {
            let wish = match self.get_wish(name, ctx).await {
                Ok(wish) => wish,
                Err(EngineError::NotFound(_)) => {
                    debug!(wish = %name, "wish gone, nothing to reconcile");
                    return Ok(Reconciled::gone());
                }
                Err(e) => return Err(e.into()),
            };

            let now = Utc::now();
            let plan = plan(&wish, now);
            if !plan.dirty {
                return Ok(Reconciled {
                    phase: plan.phase(),
                    requeue_after: plan.requeue_after,
                    updated: false,
                });
            }

            let mut next = wish;
            next.status = plan.status.clone();
            ctx.check()?;
            match self.store.update_status(&next).await {
                Ok(_) => {
                    log_transitions(name, &plan);
                    return Ok(Reconciled {
                        phase: plan.phase(),
                        requeue_after: plan.requeue_after,
                        updated: true,
                    });
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(wish = %name, attempt, "status write conflicted, re-running pass");
                    continue;
                }
                Err(StoreError::NotFound { .. }) => return Ok(Reconciled::gone()),
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(name.to_string()))
    }
}

fn log_transitions(name: &str, plan: &Plan) {
    if plan.activity_changed {
        info!(wish = %name, active = plan.status.active, "updated active status");
    }
    if let Some(r) = &plan.migrated {
        info!(
            wish = %name,
            expires_at = %r.expires_at,
            "migrated legacy reservation to reservation list"
        );
    } else if plan.legacy_cleared {
        info!(wish = %name, "cleared incomplete legacy reservation");
    }
    for r in &plan.swept {
        info!(
            wish = %name,
            quantity = r.quantity,
            expired_at = %r.expires_at,
            "removed expired reservation"
        );
    }
}
