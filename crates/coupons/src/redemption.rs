use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{CouponId, Entity, OrderId, RedemptionId, UserId};

/// Record of a coupon applied to exactly one order.
///
/// Written in the same unit of work as the order; never updated. Stores keep
/// `order_id` unique so an order can carry at most one redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponRedemption {
    pub id: RedemptionId,
    pub coupon_id: CouponId,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub discount_amount: i64,
    pub redeemed_at: DateTime<Utc>,
}

impl Entity for CouponRedemption {
    type Id = RedemptionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
