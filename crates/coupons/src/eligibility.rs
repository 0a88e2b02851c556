//! Coupon eligibility checks.
//!
//! Two stages, run in this order when an order is created:
//! 1. [`check_availability`]: is the coupon usable at all right now?
//! 2. [`check_user_restrictions`]: may *this* user use it on *this* order?

use chrono::{DateTime, Utc};

use orderflow_core::CourseId;

use crate::coupon::{Applicability, Coupon};
use crate::error::CouponError;

/// Facts about a user that the checker needs, loaded by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCouponHistory {
    /// The user has at least one order that was paid (or paid then refunded).
    pub has_prior_paid_order: bool,
    /// How many times the user already redeemed this coupon.
    pub redemptions_of_coupon: u32,
}

pub fn check_availability(coupon: &Coupon, now: DateTime<Utc>) -> Result<(), CouponError> {
    if !coupon.is_active() {
        return Err(CouponError::CouponInactive);
    }
    if now < coupon.valid_from() {
        return Err(CouponError::CouponNotStarted);
    }
    if matches!(coupon.expires_at(), Some(end) if now > end) {
        return Err(CouponError::CouponExpired);
    }
    if coupon.is_exhausted() {
        return Err(CouponError::CouponUsageExceeded);
    }
    Ok(())
}

pub fn check_user_restrictions(
    coupon: &Coupon,
    history: &UserCouponHistory,
    order_amount: i64,
    course_ids: &[CourseId],
) -> Result<(), CouponError> {
    if let Some(minimum) = coupon.minimum_amount() {
        if order_amount < minimum {
            return Err(CouponError::MinimumAmountNotMet {
                minimum,
                actual: order_amount,
            });
        }
    }

    check_user_limits(coupon, history)?;

    match coupon.applicability() {
        Applicability::All | Applicability::Category(_) => Ok(()),
        Applicability::Specific(applicable) => {
            if course_ids.iter().any(|id| applicable.contains(id)) {
                Ok(())
            } else {
                Err(CouponError::CourseNotApplicable)
            }
        }
    }
}

fn check_user_limits(coupon: &Coupon, history: &UserCouponHistory) -> Result<(), CouponError> {
    if coupon.first_time_only() && history.has_prior_paid_order {
        return Err(CouponError::FirstTimeOnly);
    }
    if let Some(cap) = coupon.max_redemptions_per_user() {
        if history.redemptions_of_coupon >= cap {
            return Err(CouponError::UserUsageExceeded);
        }
    }
    Ok(())
}

/// Whether a coupon should be listed as available to a user, before any
/// order exists (minimum amount and course checks need an order).
pub fn is_offered_to(coupon: &Coupon, history: &UserCouponHistory, now: DateTime<Utc>) -> bool {
    check_availability(coupon, now).is_ok() && check_user_limits(coupon, history).is_ok()
}
