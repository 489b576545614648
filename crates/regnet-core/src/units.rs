//! Amount conversions. Conversions happen at the adapter boundary only.

use crate::constants::SATS_PER_BTC;

/// Satoshis to bitcoin.
#[allow(clippy::cast_precision_loss)]
pub fn sats_to_btc(sats: u64) -> f64 {
    sats as f64 / SATS_PER_BTC as f64
}

/// Bitcoin to satoshis, rounded to the nearest satoshi. Negative amounts clamp to 0.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn btc_to_sats(btc: f64) -> u64 {
    if btc <= 0.0 {
        return 0;
    }
    (btc * SATS_PER_BTC as f64).round() as u64
}

/// Millisatoshis to satoshis, rounded half up.
pub const fn msat_to_sats(msat: u64) -> u64 {
    msat.saturating_add(500) / 1000
}

/// Satoshis to millisatoshis.
pub const fn sats_to_msat(sats: u64) -> u64 {
    sats.saturating_mul(1000)
}
