use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::config::CheckoutConfig;
use crate::errors::ServiceError;

/// Monetary breakdown of an order.
///
/// `total = subtotal - discount + shipping_fee + platform_fee`, each part
/// rounded to cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping_fee: Decimal,
    pub platform_fee: Decimal,
    pub total: Decimal,
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn out_of_range() -> ServiceError {
    ServiceError::ValidationFailed("Amount out of range".to_string())
}

/// `unit_price * quantity`, rounded to cents.
pub fn line_total(unit_price: Decimal, quantity: i32) -> Result<Decimal, ServiceError> {
    unit_price
        .checked_mul(Decimal::from(quantity))
        .map(round_money)
        .ok_or_else(out_of_range)
}

/// Sum of the line totals of `(unit_price, quantity)` pairs, so a stored
/// order's subtotal always equals the sum of its lines.
pub fn subtotal(
    lines: impl IntoIterator<Item = (Decimal, i32)>,
) -> Result<Decimal, ServiceError> {
    lines
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, (unit_price, quantity)| {
            acc.checked_add(line_total(unit_price, quantity)?)
                .ok_or_else(out_of_range)
        })
}

/// Free above the threshold, flat fee otherwise.
pub fn shipping_fee(subtotal: Decimal, policy: &CheckoutConfig) -> Decimal {
    if subtotal > policy.free_shipping_threshold {
        Decimal::ZERO
    } else {
        round_money(policy.flat_shipping_fee)
    }
}

pub fn platform_fee(subtotal: Decimal, policy: &CheckoutConfig) -> Decimal {
    round_money(subtotal * policy.platform_fee_rate)
}

pub fn compute_totals(
    subtotal: Decimal,
    discount: Decimal,
    policy: &CheckoutConfig,
) -> Result<OrderTotals, ServiceError> {
    if discount < Decimal::ZERO {
        return Err(ServiceError::ValidationFailed(
            "Discount cannot be negative".to_string(),
        ));
    }
    if discount > subtotal {
        return Err(ServiceError::ValidationFailed(format!(
            "Discount {} exceeds subtotal {}",
            discount, subtotal
        )));
    }

    let discount = round_money(discount);
    let shipping_fee = shipping_fee(subtotal, policy);
    let platform_fee = platform_fee(subtotal, policy);

    Ok(OrderTotals {
        subtotal,
        discount,
        shipping_fee,
        platform_fee,
        total: subtotal - discount + shipping_fee + platform_fee,
    })
}
