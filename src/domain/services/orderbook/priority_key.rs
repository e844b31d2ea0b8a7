//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Encodes an order's sort tuple into the (score, member) pair the ordered store sorts by.
//
//   score  = priority
//   member = price | time | amount | id
//
// Decimal fields are written fixed-width (17 integer digits, '.', 12 fraction digits) so that
// comparing two members as strings gives the same answer as comparing (price, time, amount)
// numerically. The id is last and only breaks exact ties.
//
// | Function        | Description                                      | Return Type                   |
// |-----------------|--------------------------------------------------|-------------------------------|
// | encode          | Order -> store entry                             | Result<ScoredMember, KeyError> |
// | decode          | (side, store entry) -> Order                     | Result<Order, KeyError>       |
// | encode_decimal  | Fixed-width, order-preserving decimal text       | Result<String, KeyError>      |
//--------------------------------------------------------------------------------------------------

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;

use super::store::ScoredMember;
use crate::domain::models::types::{MEMBER_SEP, Order, OrderId, Side};

/// Digits kept before the decimal point.
pub const INTEGER_DIGITS: usize = 17;
/// Digits kept after the decimal point.
pub const FRACTION_DIGITS: u32 = 12;

const FIELD_COUNT: usize = 4;

/// Errors raised while encoding or decoding book entries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The stored member does not split into price, time, amount and id.
    #[error("malformed key {member:?}: expected {FIELD_COUNT} fields, found {found}")]
    WrongFieldCount { member: String, found: usize },

    /// One field of the stored member failed to parse.
    #[error("malformed key {member:?}: field {field} is invalid ({reason})")]
    InvalidField {
        member: String,
        field: &'static str,
        reason: String,
    },

    /// The value cannot be expressed in the fixed-width encoding.
    #[error("{field} value {value} cannot be encoded")]
    Unrepresentable { field: &'static str, value: String },

    /// The member parses but is not what `encode` writes for the same order.
    #[error("non-canonical key {member:?}, expected {expected:?}")]
    NonCanonical { member: String, expected: String },
}

/// Builds the store entry for `order`.
pub fn encode(order: &Order) -> Result<ScoredMember, KeyError> {
    let member = [
        encode_decimal("price", order.price)?,
        encode_decimal("time", order.time)?,
        encode_decimal("amount", order.amount)?,
        order.id.as_str().to_string(),
    ]
    .join(&MEMBER_SEP.to_string());
    Ok(ScoredMember::new(order.priority, member))
}

/// Rebuilds the order stored as `entry` on `side`.
///
/// Only members byte-identical to what [`encode`] writes are accepted; anything else,
/// including values outside the fixed-width limits, is a `KeyError`.
pub fn decode(side: Side, entry: &ScoredMember) -> Result<Order, KeyError> {
    let fields: Vec<&str> = entry.member.split(MEMBER_SEP).collect();
    if fields.len() != FIELD_COUNT {
        return Err(KeyError::WrongFieldCount {
            member: entry.member.clone(),
            found: fields.len(),
        });
    }

    let price = decode_decimal(&entry.member, "price", fields[0])?;
    let time = decode_decimal(&entry.member, "time", fields[1])?;
    let amount = decode_decimal(&entry.member, "amount", fields[2])?;
    let id = OrderId::new(fields[3]).map_err(|err| KeyError::InvalidField {
        member: entry.member.clone(),
        field: "id",
        reason: err.to_string(),
    })?;

    let order = Order::new(side, price, entry.score, time, amount, id).map_err(|err| KeyError::InvalidField {
        member: entry.member.clone(),
        field: "order",
        reason: err.to_string(),
    })?;

    // Guards and removals are built from `encode(order)`, so only the exact bytes it
    // produces can ever be matched.
    let expected = encode(&order)?.member;
    if expected != entry.member {
        return Err(KeyError::NonCanonical {
            member: entry.member.clone(),
            expected,
        });
    }
    Ok(order)
}

/// Writes `value` as `IIIIIIIIIIIIIIIII.FFFFFFFFFFFF`.
///
/// Negative values, values of 10^17 or more, and values needing more than
/// [`FRACTION_DIGITS`] fraction digits are rejected.
pub fn encode_decimal(field: &'static str, value: Decimal) -> Result<String, KeyError> {
    let unrepresentable = || KeyError::Unrepresentable {
        field,
        value: value.to_string(),
    };

    let value = value.normalize();
    if value.is_sign_negative() && !value.is_zero() {
        return Err(unrepresentable());
    }
    if value.scale() > FRACTION_DIGITS {
        return Err(unrepresentable());
    }

    if value >= Decimal::from(10u64.pow(INTEGER_DIGITS as u32)) {
        return Err(unrepresentable());
    }

    // value < 10^17 and scale <= 12, so the fixed-point units stay below 10^29.
    let units = value
        .mantissa()
        .to_u128()
        .and_then(|mantissa| mantissa.checked_mul(10u128.pow(FRACTION_DIGITS - value.scale())))
        .ok_or_else(unrepresentable)?;
    let fraction_base = 10u128.pow(FRACTION_DIGITS);
    let integer = units / fraction_base;

    Ok(format!(
        "{:0>width$}.{:0>frac$}",
        integer,
        units % fraction_base,
        width = INTEGER_DIGITS,
        frac = FRACTION_DIGITS as usize
    ))
}

fn decode_decimal(member: &str, field: &'static str, raw: &str) -> Result<Decimal, KeyError> {
    Decimal::from_str(raw)
        .map(|value| value.normalize())
        .map_err(|err| KeyError::InvalidField {
            member: member.to_string(),
            field,
            reason: err.to_string(),
        })
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------
// | Name                                  | Description                                     |
// |---------------------------------------|-------------------------------------------------|
// | test_encode_layout                    | Fixed-width layout of each field                |
// | test_decode_inverts_encode            | decode(encode(o)) == o                          |
// | test_member_order_matches_numeric     | String order equals numeric tuple order         |
// | test_decode_rejects_malformed_members | Field count and field parse failures            |
// | test_encode_rejects_unrepresentable   | Negative, too large, too precise                |
// | test_decode_rejects_non_canonical     | Short-form and over-precise members             |
//--------------------------------------------------------------------------------------------------
