//! Renter review payload

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Review left by a user about a renter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RenterReview {
    #[serde(rename = "userTID")]
    #[validate(required, length(min = 1, max = 100))]
    pub user_tid: Option<String>,

    #[serde(rename = "renterTID")]
    #[validate(required, length(min = 1, max = 100))]
    pub renter_tid: Option<String>,

    #[validate(required, length(min = 1, max = 1_000_000))]
    pub review: Option<String>,

    /// Optional star rating, 1 to 5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, max = 5))]
    pub rating: Option<i32>,
}
