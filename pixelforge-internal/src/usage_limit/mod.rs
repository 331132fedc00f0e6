pub mod limiter;

pub use limiter::{UsageLimiter, UsageLimiterConfig};

use chrono::{DateTime, Utc};

use crate::identity::{IdentityKey, TrackingMethod};

/// Free quota status for one caller in the current window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageLimitInfo {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub tracking_method: TrackingMethod,
    pub tracking_key: Option<IdentityKey>,
    pub window_start: i64,
    pub reset_at: DateTime<Utc>,
}
