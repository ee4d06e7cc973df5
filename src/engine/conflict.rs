use crate::limits::*;
use crate::model::Wish;

use super::EngineError;
use super::mutations::ReservationRequest;

pub(crate) fn validate_request(req: &ReservationRequest) -> Result<(), EngineError> {
    if !(MIN_WEEKS..=MAX_WEEKS).contains(&req.weeks) {
        return Err(EngineError::Validation(format!(
            "weeks must be between {MIN_WEEKS} and {MAX_WEEKS}"
        )));
    }
    if req.quantity < 1 {
        return Err(EngineError::Validation("invalid quantity".into()));
    }
    Ok(())
}

/// Admission check against a freshly read snapshot.
pub(crate) fn check_capacity(wish: &Wish, quantity: i32) -> Result<(), EngineError> {
    let available = wish.available_quantity();
    if available == 0 {
        return Err(EngineError::FullyReserved);
    }
    if quantity > available {
        return Err(EngineError::QuantityExceedsAvailable { available });
    }
    // Only reachable with many tiny reservations on a huge stock.
    if wish.status.reservations.len() >= MAX_RESERVATIONS_PER_WISH {
        return Err(EngineError::LimitExceeded("too many reservations on wish"));
    }
    Ok(())
}
