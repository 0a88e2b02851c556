//! Coupons: definitions, the discount engine and the eligibility checker.
//!
//! Everything here is pure. Persistence-backed facts (a user's previous
//! orders, their redemption count) are passed in as [`UserCouponHistory`].

pub mod coupon;
pub mod discount;
pub mod eligibility;
pub mod error;
pub mod redemption;

pub use coupon::{Applicability, Coupon, CouponCode, Discount, NewCoupon};
pub use discount::calculate_discount;
pub use eligibility::{UserCouponHistory, check_availability, check_user_restrictions, is_offered_to};
pub use error::CouponError;
pub use redemption::CouponRedemption;
