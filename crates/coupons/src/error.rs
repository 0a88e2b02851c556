use thiserror::Error;

use orderflow_core::{Classified, ErrorClass};

/// Coupon lookup, definition and eligibility failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CouponError {
    #[error("coupon not found")]
    CouponNotFound,

    #[error("coupon is not active")]
    CouponInactive,

    #[error("coupon has not started yet")]
    CouponNotStarted,

    #[error("coupon has expired")]
    CouponExpired,

    #[error("coupon usage limit exceeded")]
    CouponUsageExceeded,

    #[error("minimum order amount not met (minimum {minimum}, got {actual})")]
    MinimumAmountNotMet { minimum: i64, actual: i64 },

    #[error("coupon is for first-time customers only")]
    FirstTimeOnly,

    #[error("user has exceeded coupon usage limit")]
    UserUsageExceeded,

    #[error("coupon not applicable to the selected courses")]
    CourseNotApplicable,

    #[error("invalid coupon code: {0}")]
    InvalidCode(String),

    /// The coupon definition itself is malformed.
    #[error("invalid coupon: {0}")]
    InvalidCoupon(String),
}

impl CouponError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidCoupon(msg.into())
    }
}

impl Classified for CouponError {
    fn class(&self) -> ErrorClass {
        match self {
            CouponError::CouponNotFound => ErrorClass::NotFound,
            CouponError::MinimumAmountNotMet { .. }
            | CouponError::CourseNotApplicable
            | CouponError::InvalidCode(_)
            | CouponError::InvalidCoupon(_) => ErrorClass::Validation,
            CouponError::CouponInactive
            | CouponError::CouponNotStarted
            | CouponError::CouponExpired
            | CouponError::CouponUsageExceeded
            | CouponError::FirstTimeOnly
            | CouponError::UserUsageExceeded => ErrorClass::Conflict,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            CouponError::CouponNotFound => "coupon_not_found",
            CouponError::CouponInactive => "coupon_inactive",
            CouponError::CouponNotStarted => "coupon_not_started",
            CouponError::CouponExpired => "coupon_expired",
            CouponError::CouponUsageExceeded => "coupon_usage_exceeded",
            CouponError::MinimumAmountNotMet { .. } => "minimum_amount_not_met",
            CouponError::FirstTimeOnly => "first_time_only",
            CouponError::UserUsageExceeded => "user_usage_exceeded",
            CouponError::CourseNotApplicable => "course_not_applicable",
            CouponError::InvalidCode(_) => "invalid_coupon_code",
            CouponError::InvalidCoupon(_) => "invalid_coupon",
        }
    }
}
