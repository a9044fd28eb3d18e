//! Property-based tests for pricing, order numbering and the order lifecycle.

use chrono::{TimeZone, Utc};
use costura_store::{
    config::CheckoutConfig,
    entities::{CartLineModel, OrderStatus},
    services::{orders::order_number, pricing, CartView},
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..100_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn quantity_strategy() -> impl Strategy<Value = i32> {
    1i32..50
}

fn status_strategy() -> impl Strategy<Value = OrderStatus> {
    prop_oneof![
        Just(OrderStatus::Pending),
        Just(OrderStatus::Confirmed),
        Just(OrderStatus::InProduction),
        Just(OrderStatus::Shipped),
        Just(OrderStatus::Delivered),
        Just(OrderStatus::Cancelled),
    ]
}

fn cart_of(lines: &[(Decimal, i32)]) -> CartView {
    let user_id = Uuid::new_v4();
    let now = Utc::now();
    CartView {
        user_id,
        lines: lines
            .iter()
            .map(|&(unit_price, quantity)| CartLineModel {
                id: Uuid::new_v4(),
                user_id,
                product_id: Uuid::new_v4(),
                quantity,
                unit_price,
                created_at: now,
                updated_at: now,
            })
            .collect(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn total_is_the_sum_of_its_parts(
        lines in prop::collection::vec((price_strategy(), quantity_strategy()), 1..8),
        discount_share in 0u32..=100,
    ) {
        let policy = CheckoutConfig::default();
        let subtotal = pricing::subtotal(lines.iter().copied()).unwrap();
        let discount = pricing::round_money(subtotal * Decimal::new(discount_share.into(), 2));
        let totals = pricing::compute_totals(subtotal, discount, &policy).unwrap();

        prop_assert_eq!(
            totals.total,
            totals.subtotal - totals.discount + totals.shipping_fee + totals.platform_fee
        );
        prop_assert!(totals.total >= Decimal::ZERO);
        prop_assert_eq!(totals.total.round_dp(2), totals.total);
    }

    #[test]
    fn shipping_is_free_only_above_the_threshold(subtotal in price_strategy()) {
        let policy = CheckoutConfig::default();
        let fee = pricing::shipping_fee(subtotal, &policy);
        if subtotal > policy.free_shipping_threshold {
            prop_assert_eq!(fee, Decimal::ZERO);
        } else {
            prop_assert_eq!(fee, policy.flat_shipping_fee);
        }
    }

    #[test]
    fn discounts_beyond_the_subtotal_are_rejected(
        subtotal in price_strategy(),
        extra in 1i64..10_000,
    ) {
        let policy = CheckoutConfig::default();
        let discount = subtotal + Decimal::new(extra, 2);
        prop_assert!(pricing::compute_totals(subtotal, discount, &policy).is_err());
    }

    #[test]
    fn cart_total_matches_line_totals(
        lines in prop::collection::vec((price_strategy(), quantity_strategy()), 0..8),
    ) {
        let cart = cart_of(&lines);
        let by_line: Decimal = lines
            .iter()
            .map(|&(price, quantity)| pricing::line_total(price, quantity).unwrap())
            .sum();
        prop_assert_eq!(cart.total().unwrap(), by_line);
        prop_assert_eq!(
            cart.item_count(),
            lines.iter().map(|&(_, q)| i64::from(q)).sum::<i64>()
        );
    }
}

proptest! {
    #[test]
    fn order_numbers_are_well_formed(secs in 0i64..4_000_000_000, bytes in any::<[u8; 16]>()) {
        let created_at = Utc.timestamp_opt(secs, 0).unwrap();
        let number = order_number(created_at, Uuid::from_bytes(bytes));

        prop_assert_eq!(number.len(), "PED-YYYYMMDDHHMMSS-XXXXXX".len());
        prop_assert!(number.starts_with("PED-"));
        let suffix = &number[number.len() - 6..];
        prop_assert!(suffix.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[test]
    fn terminal_statuses_never_move(from in status_strategy(), to in status_strategy()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    #[test]
    fn open_orders_can_always_be_cancelled(from in status_strategy()) {
        if !from.is_terminal() {
            prop_assert!(from.can_transition_to(OrderStatus::Cancelled));
        }
    }

    #[test]
    fn transitions_never_go_backwards(from in status_strategy(), to in status_strategy()) {
        if from.can_transition_to(to) && to != OrderStatus::Cancelled {
            prop_assert!(!to.can_transition_to(from));
        }
    }
}
