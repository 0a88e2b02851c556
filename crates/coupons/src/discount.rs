//! Discount engine.

use crate::coupon::{Coupon, Discount};

/// Amount (minor units) a coupon takes off `order_amount`.
///
/// Percentage coupons round down; fixed coupons take their face value. The
/// result is clamped to `[0, order_amount]`, so the payable amount is never
/// negative.
pub fn calculate_discount(coupon: &Coupon, order_amount: i64) -> i64 {
    discount_for(coupon.discount(), order_amount)
}

pub(crate) fn discount_for(discount: &Discount, order_amount: i64) -> i64 {
    if order_amount <= 0 {
        return 0;
    }

    let raw = match discount {
        // i128 keeps `amount * pct` exact for any i64 amount.
        Discount::Percentage { percent_off } => {
            (i128::from(order_amount) * i128::from(*percent_off) / 100) as i64
        }
        Discount::FixedAmount { amount_off, .. } => *amount_off,
    };

    raw.clamp(0, order_amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coupon::tests::percentage_def;
    use crate::coupon::Coupon;
    use orderflow_core::Currency;

    fn fixed(amount_off: i64) -> Discount {
        Discount::FixedAmount {
            amount_off,
            currency: Currency::usd(),
        }
    }

    #[test]
    fn percentage_discount_on_ten_thousand() {
        let coupon = Coupon::new(percentage_def("SAVE10", 10)).unwrap();
        assert_eq!(calculate_discount(&coupon, 10_000), 1_000);
    }

    #[test]
    fn percentage_rounds_down() {
        assert_eq!(discount_for(&Discount::Percentage { percent_off: 15 }, 999), 149);
        assert_eq!(discount_for(&Discount::Percentage { percent_off: 1 }, 99), 0);
    }

    #[test]
    fn fixed_discount_is_clamped_to_order_amount() {
        assert_eq!(discount_for(&fixed(6_000), 5_000), 5_000);
        assert_eq!(discount_for(&fixed(1_500), 5_000), 1_500);
    }

    #[test]
    fn zero_amount_orders_get_no_discount() {
        assert_eq!(discount_for(&fixed(100), 0), 0);
        assert_eq!(discount_for(&Discount::Percentage { percent_off: 50 }, 0), 0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_discount() -> impl Strategy<Value = Discount> {
            prop_oneof![
                (1u8..=100).prop_map(|percent_off| Discount::Percentage { percent_off }),
                (1i64..=10_000_000).prop_map(fixed),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 1000,
                ..ProptestConfig::default()
            })]

            /// Property: 0 <= discount <= order amount.
            #[test]
            fn discount_never_exceeds_order_amount(
                discount in any_discount(),
                amount in 0i64..=i64::MAX / 2,
            ) {
                let d = discount_for(&discount, amount);
                prop_assert!(d >= 0);
                prop_assert!(d <= amount);
            }

            /// Property: equal inputs give equal outputs.
            #[test]
            fn discount_is_deterministic(
                discount in any_discount(),
                amount in 0i64..=100_000_000,
            ) {
                prop_assert_eq!(discount_for(&discount, amount), discount_for(&discount, amount));
            }

            /// Property: a full percentage discount wipes out the order.
            #[test]
            fn hundred_percent_is_whole_amount(amount in 0i64..=100_000_000) {
                prop_assert_eq!(
                    discount_for(&Discount::Percentage { percent_off: 100 }, amount),
                    amount
                );
            }
        }
    }
}
