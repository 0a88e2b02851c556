use std::sync::Arc;

use tracing::{debug, info, instrument};

use orderflow_core::{Clock, CouponId, CourseId, UserId};
use orderflow_coupons::{
    Coupon, CouponCode, CouponError, NewCoupon, UserCouponHistory, calculate_discount, check_availability,
    check_user_restrictions, is_offered_to,
};

use crate::error::CheckoutError;
use crate::store::{Store, StoreError, UnitOfWork};

/// What a coupon would do to an order amount. Nothing is reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponQuote {
    pub coupon: Coupon,
    pub discount_amount: i64,
    pub final_amount: i64,
}

/// Load the per-user facts the eligibility checker needs.
pub(crate) async fn user_history(
    uow: &mut dyn UnitOfWork,
    coupon_id: CouponId,
    user_id: UserId,
) -> Result<UserCouponHistory, StoreError> {
    Ok(UserCouponHistory {
        has_prior_paid_order: uow.user_has_paid_order(user_id).await?,
        redemptions_of_coupon: uow.user_redemption_count(coupon_id, user_id).await?,
    })
}

#[derive(Clone)]
pub struct CouponService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl CouponService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self, definition), fields(code = %definition.code), err)]
    pub async fn create_coupon(&self, definition: NewCoupon) -> Result<Coupon, CheckoutError> {
        let coupon = Coupon::new(definition)?;
        let mut uow = self.store.begin().await?;
        uow.insert_coupon(&coupon).await?;
        uow.commit().await?;
        info!(coupon_id = %coupon.id(), code = %coupon.code(), kind = coupon.discount().kind(), "coupon created");
        Ok(coupon)
    }

    /// Preview a coupon against an order amount and course list.
    pub async fn validate_coupon(
        &self,
        code: &str,
        user_id: UserId,
        order_amount: i64,
        course_ids: &[CourseId],
    ) -> Result<CouponQuote, CheckoutError> {
        let code = CouponCode::parse(code)?;
        let now = self.clock.now();

        let mut uow = self.store.begin().await?;
        let coupon = uow.coupon_by_code(&code).await?.ok_or(CouponError::CouponNotFound)?;
        check_availability(&coupon, now)?;
        let history = user_history(uow.as_mut(), coupon.id(), user_id).await?;
        check_user_restrictions(&coupon, &history, order_amount, course_ids)?;

        let discount_amount = calculate_discount(&coupon, order_amount);
        Ok(CouponQuote {
            coupon,
            discount_amount,
            final_amount: order_amount - discount_amount,
        })
    }

    /// The candidate giving the largest discount on this order, if any.
    ///
    /// Codes that fail lookup or eligibility are skipped; a coupon worth
    /// nothing is never picked, and ties keep the earlier code.
    #[instrument(skip(self, course_ids, codes), fields(user_id = %user_id, candidates = codes.len()), err)]
    pub async fn best_coupon(
        &self,
        user_id: UserId,
        order_amount: i64,
        course_ids: &[CourseId],
        codes: &[String],
    ) -> Result<Option<CouponQuote>, CheckoutError> {
        let mut best: Option<CouponQuote> = None;
        for code in codes {
            let quote = match self.validate_coupon(code, user_id, order_amount, course_ids).await {
                Ok(quote) => quote,
                Err(CheckoutError::Coupon(e)) => {
                    debug!(code = %code, error = %e, "coupon not applicable");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let current = best.as_ref().map_or(0, |b| b.discount_amount);
            if quote.discount_amount > current {
                best = Some(quote);
            }
        }
        Ok(best)
    }

    /// Active coupons this user could still use, ignoring order-dependent
    /// rules (minimum amount, course applicability).
    pub async fn list_available(&self, user_id: UserId) -> Result<Vec<Coupon>, CheckoutError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let has_prior_paid_order = uow.user_has_paid_order(user_id).await?;

        let mut available = Vec::new();
        for coupon in uow.active_coupons().await? {
            let history = UserCouponHistory {
                has_prior_paid_order,
                redemptions_of_coupon: uow.user_redemption_count(coupon.id(), user_id).await?,
            };
            if is_offered_to(&coupon, &history, now) {
                available.push(coupon);
            }
        }
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use orderflow_core::{Classified, Currency, ErrorClass, ManualClock};
    use orderflow_coupons::{Applicability, Discount};

    use crate::store::InMemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap()
    }

    fn definition(code: &str, discount: Discount) -> NewCoupon {
        NewCoupon {
            id: CouponId::new(),
            code: code.to_string(),
            name: None,
            description: None,
            discount,
            max_redemptions: None,
            max_redemptions_per_user: None,
            minimum_amount: None,
            applicability: Applicability::All,
            first_time_only: false,
            valid_from: now() - Duration::days(1),
            expires_at: None,
            is_active: true,
        }
    }

    fn service() -> CouponService {
        CouponService::new(Arc::new(InMemoryStore::new()), Arc::new(ManualClock::new(now())))
    }

    #[tokio::test]
    async fn codes_are_matched_case_insensitively() {
        let service = service();
        service
            .create_coupon(definition("save10", Discount::Percentage { percent_off: 10 }))
            .await
            .unwrap();

        let quote = service
            .validate_coupon("  Save10 ", UserId::new(), 10_000, &[CourseId::new()])
            .await
            .unwrap();
        assert_eq!(quote.coupon.code().as_str(), "SAVE10");
        assert_eq!(quote.discount_amount, 1_000);
        assert_eq!(quote.final_amount, 9_000);
    }

    #[tokio::test]
    async fn duplicate_codes_conflict() {
        let service = service();
        let pct = Discount::Percentage { percent_off: 5 };
        service.create_coupon(definition("WELCOME", pct.clone())).await.unwrap();

        let err = service.create_coupon(definition("welcome", pct)).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[tokio::test]
    async fn fixed_discount_never_exceeds_the_amount() {
        let service = service();
        service
            .create_coupon(definition(
                "FLAT6000",
                Discount::FixedAmount {
                    amount_off: 6_000,
                    currency: Currency::usd(),
                },
            ))
            .await
            .unwrap();

        let quote = service
            .validate_coupon("FLAT6000", UserId::new(), 5_000, &[])
            .await
            .unwrap();
        assert_eq!(quote.discount_amount, 5_000);
        assert_eq!(quote.final_amount, 0);
    }

    #[tokio::test]
    async fn list_available_skips_inactive_and_not_started() {
        let service = service();
        service
            .create_coupon(definition("LIVE", Discount::Percentage { percent_off: 10 }))
            .await
            .unwrap();

        let mut inactive = definition("OFF", Discount::Percentage { percent_off: 10 });
        inactive.is_active = false;
        service.create_coupon(inactive).await.unwrap();

        let mut future = definition("SOON", Discount::Percentage { percent_off: 10 });
        future.valid_from = now() + Duration::days(2);
        service.create_coupon(future).await.unwrap();

        let codes: Vec<String> = service
            .list_available(UserId::new())
            .await
            .unwrap()
            .iter()
            .map(|c| c.code().to_string())
            .collect();
        assert_eq!(codes, vec!["LIVE"]);
    }

    #[tokio::test]
    async fn minimum_amount_is_checked_against_the_given_amount() {
        let service = service();
        let mut def = definition("BIGSPEND", Discount::Percentage { percent_off: 20 });
        def.minimum_amount = Some(5_000);
        service.create_coupon(def).await.unwrap();

        let err = service
            .validate_coupon("BIGSPEND", UserId::new(), 4_999, &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Coupon(CouponError::MinimumAmountNotMet {
                minimum: 5_000,
                actual: 4_999
            })
        ));
    }

    #[tokio::test]
    async fn best_coupon_picks_the_largest_applicable_discount() {
        let service = service();
        service
            .create_coupon(definition("TEN", Discount::Percentage { percent_off: 10 }))
            .await
            .unwrap();
        service
            .create_coupon(definition(
                "FLAT1500",
                Discount::FixedAmount {
                    amount_off: 1_500,
                    currency: Currency::usd(),
                },
            ))
            .await
            .unwrap();
        let mut big = definition("HALF", Discount::Percentage { percent_off: 50 });
        big.minimum_amount = Some(50_000);
        service.create_coupon(big).await.unwrap();

        let codes: Vec<String> = ["ten", "HALF", "MISSING", "flat1500"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let best = service
            .best_coupon(UserId::new(), 10_000, &[], &codes)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.coupon.code().as_str(), "FLAT1500");
        assert_eq!(best.discount_amount, 1_500);
        assert_eq!(best.final_amount, 8_500);
    }

    #[tokio::test]
    async fn best_coupon_is_none_without_a_usable_code() {
        let service = service();
        let mut expired = definition("GONE", Discount::Percentage { percent_off: 30 });
        expired.expires_at = Some(now() - Duration::hours(1));
        service.create_coupon(expired).await.unwrap();

        let codes = vec!["GONE".to_string(), "NOPE".to_string()];
        assert!(service.best_coupon(UserId::new(), 10_000, &[], &codes).await.unwrap().is_none());
        assert!(service.best_coupon(UserId::new(), 10_000, &[], &[]).await.unwrap().is_none());
    }
}
