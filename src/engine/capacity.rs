//! Capacity arithmetic over a wish snapshot. No I/O, no clock: callers pass `now`.

use chrono::TimeDelta;

use crate::model::{Reservation, Timestamp, Wish};

impl Wish {
    /// Usable stock: `spec.quantity`, or 1 when that is zero or negative.
    pub fn effective_quantity(&self) -> i32 {
        if self.spec.quantity > 0 {
            self.spec.quantity
        } else {
            1
        }
    }

    /// Sum over every stored reservation, expired or not. Expired ones keep
    /// counting until a sweep removes them.
    pub fn total_reserved(&self) -> i64 {
        self.status
            .reservations
            .iter()
            .map(|r| i64::from(r.quantity))
            .sum()
    }

    /// Never negative, even when concurrent admissions overshot the stock.
    pub fn available_quantity(&self) -> i32 {
        let available = i64::from(self.effective_quantity()) - self.total_reserved();
        // Bounded above by effective_quantity, so the cast is lossless.
        available.max(0) as i32
    }

    pub fn is_fully_reserved(&self) -> bool {
        self.available_quantity() == 0
    }

    /// Reservations expiring strictly after `now`, in stored order.
    pub fn active_reservations(&self, now: Timestamp) -> impl Iterator<Item = &Reservation> {
        self.status
            .reservations
            .iter()
            .filter(move |r| !r.is_expired(now))
    }

    /// The reservation that expires first; the earliest stored one wins a tie.
    pub fn next_reservation_expiry(&self) -> Option<&Reservation> {
        self.status.reservations.iter().min_by_key(|r| r.expires_at)
    }

    /// `creationTimestamp + ttl`, or `None` when the wish never expires.
    pub fn ttl_deadline(&self) -> Option<Timestamp> {
        let ttl = self.spec.ttl?;
        let ttl = TimeDelta::from_std(ttl.as_std()).ok()?;
        self.metadata.creation_timestamp.checked_add_signed(ttl)
    }

    /// True once `now` is strictly past the TTL deadline.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.ttl_deadline().is_some_and(|deadline| now > deadline)
    }
}
