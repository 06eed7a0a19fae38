//! Authoritative action implementations run by the execution worker.

pub mod custom_code;
pub mod email;
pub mod webhook;

use visitflow_core::error::VisitflowError;

/// Map a non-2xx provider response to a delivery error.
///
/// With `classify` on, 4xx responses other than 408 and 429 are permanent.
pub(crate) fn status_error(action: &str, status: u16, message: String, classify: bool) -> VisitflowError {
    let permanent = classify && (400..500).contains(&status) && status != 408 && status != 429;
    if permanent {
        VisitflowError::DeliveryRejected {
            action: action.to_string(),
            message,
        }
    } else {
        VisitflowError::delivery(action, message)
    }
}
