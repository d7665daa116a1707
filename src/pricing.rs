use std::{fmt, str::FromStr};

use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Flat fee charged on every shipment, in rupees.
pub const BASE_FEE: i64 = 50;

/// Charge per kilogram, in rupees.
pub const RATE_PER_KG: i64 = 20;

/// The gateway takes amounts in paise.
pub const SUBUNITS_PER_UNIT: i64 = 100;

pub const CURRENCY: &str = "INR";

/// Heaviest package accepted for booking.
pub const MAX_WEIGHT_KG: i64 = 1000;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PackageSize {
    Small,
    Medium,
    Large,
}

impl PackageSize {
    pub fn multiplier(self) -> Decimal {
        match self {
            Self::Small => Decimal::ONE,
            Self::Medium => Decimal::new(15, 1),
            Self::Large => Decimal::TWO,
        }
    }
}

impl fmt::Display for PackageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Small => "Small",
            Self::Medium => "Medium",
            Self::Large => "Large",
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliverySpeed {
    Standard,
    Express,
}

impl DeliverySpeed {
    pub fn multiplier(self) -> Decimal {
        match self {
            Self::Standard => Decimal::ONE,
            Self::Express => Decimal::new(15, 1),
        }
    }
}

impl fmt::Display for DeliverySpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Standard => "Standard",
            Self::Express => "Express",
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown label {0:?}")]
pub struct UnknownLabel(pub String);

impl FromStr for PackageSize {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Small, Self::Medium, Self::Large]
            .into_iter()
            .find(|it| it.to_string() == s.trim())
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

impl FromStr for DeliverySpeed {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Standard, Self::Express]
            .into_iter()
            .find(|it| it.to_string() == s.trim())
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// `round((50 + weight * 20) * size * speed)`, rounding half away from zero.
///
/// Returns `None` when the weight is negative or the arithmetic overflows.
pub fn checked_price(size: PackageSize, weight_kg: Decimal, speed: DeliverySpeed) -> Option<i64> {
    if weight_kg.is_sign_negative() && !weight_kg.is_zero() {
        return None;
    }

    let raw = weight_kg
        .checked_mul(Decimal::from(RATE_PER_KG))?
        .checked_add(Decimal::from(BASE_FEE))?
        .checked_mul(size.multiplier())?
        .checked_mul(speed.multiplier())?;

    raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

pub fn price(size: PackageSize, weight_kg: Decimal, speed: DeliverySpeed) -> i64 {
    checked_price(size, weight_kg, speed).unwrap_or(0)
}

/// Price estimate for a partially filled form. Any missing input gives 0.
pub fn quote(
    size: Option<PackageSize>,
    weight_kg: Option<Decimal>,
    speed: Option<DeliverySpeed>,
) -> i64 {
    match (size, weight_kg, speed) {
        (Some(size), Some(weight), Some(speed)) => price(size, weight, speed),
        _ => 0,
    }
}

/// Amount handed to the payment gateway, in the smallest currency unit.
pub fn gateway_amount(price: i64) -> i64 {
    price.saturating_mul(SUBUNITS_PER_UNIT)
}
