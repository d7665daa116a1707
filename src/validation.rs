use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use validator::ValidationError;

use crate::pricing::MAX_WEIGHT_KG;

lazy_static! {
    /// Loose `something@something.something` shape, no whitespace.
    pub static ref EMAIL_SHAPE: Regex = Regex::new(r"^\S+@\S+\.\S+$").unwrap();
    pub static ref PHONE_DIGITS: Regex = Regex::new(r"^\d{10}$").unwrap();
    pub static ref PINCODE_DIGITS: Regex = Regex::new(r"^\d{6}$").unwrap();
}

pub const REQUIRED_MESSAGE: &str = "All fields are required";

fn error(code: &'static str, message: &'static str) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(Cow::Borrowed(message));
    error
}

pub fn non_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(error("required", REQUIRED_MESSAGE));
    }

    Ok(())
}

pub fn positive_weight(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO {
        return Err(error("positive", "Weight must be greater than zero"));
    }

    if *value > Decimal::from(MAX_WEIGHT_KG) {
        return Err(error("max_weight", "Weight must be at most 1000 kg"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_shape() {
        assert!(EMAIL_SHAPE.is_match("asha@example.in"));
        assert!(EMAIL_SHAPE.is_match("a@b.c"));
        assert!(!EMAIL_SHAPE.is_match("asha@example"));
        assert!(!EMAIL_SHAPE.is_match("asha example@x.in"));
        assert!(!EMAIL_SHAPE.is_match(""));
    }

    #[test]
    fn test_digit_patterns() {
        assert!(PHONE_DIGITS.is_match("9876543210"));
        assert!(!PHONE_DIGITS.is_match("98765"));
        assert!(!PHONE_DIGITS.is_match("98765432101"));
        assert!(!PHONE_DIGITS.is_match("98765-4321"));

        assert!(PINCODE_DIGITS.is_match("110001"));
        assert!(!PINCODE_DIGITS.is_match("11000"));
        assert!(!PINCODE_DIGITS.is_match("11000a"));
    }

    #[test]
    fn test_custom_checks() {
        assert!(non_blank("x").is_ok());
        assert_eq!(non_blank("   ").unwrap_err().code, "required");

        assert!(positive_weight(&Decimal::new(1, 1)).is_ok());
        assert!(positive_weight(&Decimal::ZERO).is_err());
        assert!(positive_weight(&Decimal::from(MAX_WEIGHT_KG)).is_ok());
        assert_eq!(
            positive_weight(&Decimal::from(1_000_000_000_000_000_000i64)).unwrap_err().code,
            "max_weight"
        );
    }
}
