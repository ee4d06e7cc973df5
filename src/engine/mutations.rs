use chrono::Utc;
use tracing::{debug, info};

use crate::limits::MAX_ADMISSION_ATTEMPTS;
use crate::model::*;
use crate::observability;
use crate::store::StoreError;

use super::conflict::{check_capacity, validate_request};
use super::{CallContext, Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationRequest {
    pub quantity: i32,
    pub weeks: u32,
}

impl Engine {
    /// Reserve `req.quantity` units of `name` for `req.weeks` weeks.
    ///
    /// Compare-and-swap: every attempt re-reads the wish and re-checks
    /// capacity, and the write is accepted only if nothing committed in
    /// between. Returns the wish as stored after the reservation.
    pub async fn reserve(
        &self,
        name: &str,
        req: ReservationRequest,
        ctx: &CallContext,
    ) -> Result<Wish, EngineError> {
        let result = match validate_request(&req) {
            Ok(()) => self.reserve_inner(name, req, ctx).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => {
                metrics::counter!(observability::RESERVATIONS_GRANTED).increment(1);
            }
            Err(e) => {
                metrics::counter!(observability::RESERVATIONS_REJECTED, "reason" => e.kind())
                    .increment(1);
            }
        }
        result
    }

    async fn reserve_inner(
        &self,
        name: &str,
        req: ReservationRequest,
        ctx: &CallContext,
    ) -> Result<Wish, EngineError> {
        for attempt in 1..=MAX_ADMISSION_ATTEMPTS {
            let mut wish = self.get_wish(name, ctx).await?;
            check_capacity(&wish, req.quantity)?;

            let reservation = Reservation::for_weeks(req.quantity, Utc::now(), req.weeks);
            let expires_at = reservation.expires_at;
            wish.status.reservations.push(reservation);

            ctx.check()?;
            match self.store.update_status(&wish).await {
                Ok(updated) => {
                    info!(
                        wish = %name,
                        quantity = req.quantity,
                        weeks = req.weeks,
                        %expires_at,
                        available = updated.available_quantity(),
                        "reservation granted"
                    );
                    return Ok(updated);
                }
                Err(StoreError::Conflict { expected, actual, .. }) => {
                    metrics::counter!(observability::ADMISSION_CONFLICTS).increment(1);
                    debug!(
                        wish = %name,
                        attempt,
                        expected,
                        actual,
                        "reservation raced another write, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(name.to_string()))
    }
}
