//! SmartRent domain payloads and their constraint checks
//!
//! These types only validate; nothing in the gateway stores them or routes
//! on their content. Failed checks convert into `GatewayError::Validation`.

pub mod review;
pub mod user;

pub use review::RenterReview;
pub use user::{Gender, User, UserStatus};

use std::borrow::Cow;
use validator::ValidationError;

/// Build a violation with a human-readable message
pub(crate) fn violation(code: &'static str, message: &'static str) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(Cow::Borrowed(message));
    error
}
