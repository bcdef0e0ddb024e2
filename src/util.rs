use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use thiserror::Error;

static AMOUNT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(?:\.\d{1,2})?$").expect("valid regex"));

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
  #[error("amount must match 0.00 format")]
  InvalidFormat,
  #[error("amount exceeds supported range")]
  OutOfRange,
}

/// Parses a decimal coin amount ("10", "10.5", "10.55") into hundredths
/// of a coin, the unit the ledger stores.
pub fn parse_coin_amount(input: &str) -> Result<i64, AmountError> {
  let trimmed = input.trim();
  if !AMOUNT_PATTERN.is_match(trimmed) {
    return Err(AmountError::InvalidFormat);
  }

  let (whole, fraction) = match trimmed.split_once('.') {
    Some((whole, fraction)) => (whole, fraction),
    None => (trimmed, ""),
  };
  let whole: i64 = whole.parse().map_err(|_| AmountError::OutOfRange)?;
  // The pattern admits at most two fractional digits.
  let hundredths = match fraction.len() {
    0 => 0,
    1 => fraction.parse::<i64>().map_err(|_| AmountError::OutOfRange)? * 10,
    _ => fraction.parse::<i64>().map_err(|_| AmountError::OutOfRange)?,
  };

  whole
    .checked_mul(100)
    .and_then(|value| value.checked_add(hundredths))
    .ok_or(AmountError::OutOfRange)
}

pub fn format_coins(amount: i64) -> String {
  format!("{:.2} coins", (amount as f64) / 100.0)
}

/// Appointment confirmation code, A-Z and digits.
pub fn confirmation_code(len: usize) -> String {
  let mut rng = rand::thread_rng();
  (0 .. len)
    .map(|_| CODE_ALPHABET[rng.gen_range(0 .. CODE_ALPHABET.len())] as char)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::AmountError;
  use super::confirmation_code;
  use super::format_coins;
  use super::parse_coin_amount;

  #[test]
  fn parses_valid_amounts() {
    assert_eq!(parse_coin_amount("10"), Ok(1000));
    assert_eq!(parse_coin_amount("10.5"), Ok(1050));
    assert_eq!(parse_coin_amount("10.55"), Ok(1055));
  }

  #[test]
  fn rejects_invalid_formats() {
    assert_eq!(parse_coin_amount("abc"), Err(AmountError::InvalidFormat));
    assert_eq!(parse_coin_amount("10.555"), Err(AmountError::InvalidFormat));
    assert_eq!(parse_coin_amount("-5"), Err(AmountError::InvalidFormat));
  }

  #[test]
  fn formats_coins() {
    assert_eq!(format_coins(1234), "12.34 coins");
  }

  #[test]
  fn codes_use_expected_alphabet_and_length() {
    let code = confirmation_code(6);
    assert_eq!(code.len(), 6);
    assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
  }
}
