//! Fixed-point amounts
//!
//! The core counts value in integer minor units (`u64`). Decimal text only
//! exists at the edges: parsing a transfer request and rendering balances.

use crate::core::validator::Rejection;

/// Amount in minor units
pub type Amount = u64;

/// Parse a decimal string such as `"12.50"` into minor units
///
/// Rejects empty input, signs, exponents, more fractional digits than
/// `decimals`, and values that overflow `u64`.
pub fn parse_amount(text: &str, decimals: u32) -> Result<Amount, Rejection> {
    let text = text.trim();
    let (whole, fraction) = match text.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (text, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(Rejection::MalformedAmount);
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(Rejection::MalformedAmount);
    }
    if fraction.len() > decimals as usize {
        return Err(Rejection::MalformedAmount);
    }

    let scale = 10u64
        .checked_pow(decimals)
        .ok_or(Rejection::MalformedAmount)?;

    let whole_units = if whole.is_empty() {
        0
    } else {
        whole.parse::<u64>().map_err(|_| Rejection::MalformedAmount)?
    };

    let mut padded = fraction.to_string();
    while padded.len() < decimals as usize {
        padded.push('0');
    }
    let fraction_units = if padded.is_empty() {
        0
    } else {
        padded.parse::<u64>().map_err(|_| Rejection::MalformedAmount)?
    };

    whole_units
        .checked_mul(scale)
        .and_then(|units| units.checked_add(fraction_units))
        .ok_or(Rejection::MalformedAmount)
}

/// Render minor units as a decimal string with exactly `decimals` digits
pub fn format_amount(amount: Amount, decimals: u32) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let scale = 10u128.pow(decimals);
    let amount = amount as u128;
    format!(
        "{}.{:0width$}",
        amount / scale,
        amount % scale,
        width = decimals as usize
    )
}
