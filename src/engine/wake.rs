use std::time::Duration;

use crate::limits::MIN_WAKE;
use crate::model::{Timestamp, Wish};

fn until(now: Timestamp, at: Timestamp) -> Option<Duration> {
    (at - now).to_std().ok().map(|d| d.max(MIN_WAKE))
}

/// How long until the derived state of `wish` can next change: the TTL
/// deadline (while still active) or the earliest unexpired reservation's
/// expiry, whichever comes first. `None` means nothing will change on its
/// own and only an external write should trigger another pass.
pub fn next_wake(wish: &Wish, now: Timestamp) -> Option<Duration> {
    let ttl = if wish.is_expired(now) {
        None
    } else {
        wish.ttl_deadline().and_then(|deadline| until(now, deadline))
    };

    let reservation = wish
        .active_reservations(now)
        .map(|r| r.expires_at)
        .min()
        .and_then(|at| until(now, at));

    match (ttl, reservation) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
