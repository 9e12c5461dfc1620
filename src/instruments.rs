//! Instrument classification: segments, contract sizes and pip sizes.
//!
//! Symbols are mapped to a segment by a static table; anything unrecognized
//! falls back to forex so charge resolution never fails on a new symbol.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Instrument segment used for charge-scope matching and contract math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Forex,
    Metals,
    Crypto,
    Indices,
}

const METALS: &[&str] = &["XAUUSD", "XAGUSD", "XAUEUR", "XAGEUR", "GOLD", "SILVER"];
const CRYPTO: &[&str] = &[
    "BTCUSD", "ETHUSD", "LTCUSD", "XRPUSD", "SOLUSD", "BNBUSD", "ADAUSD", "DOGEUSD",
];
const INDICES: &[&str] = &[
    "US30", "NAS100", "SPX500", "GER40", "UK100", "JPN225", "AUS200", "FRA40",
];

/// Classify a symbol into its segment. Unknown symbols are treated as forex.
pub fn classify(symbol: &str) -> Segment {
    let upper = symbol.to_uppercase();
    if METALS.contains(&upper.as_str()) {
        Segment::Metals
    } else if CRYPTO.contains(&upper.as_str()) {
        Segment::Crypto
    } else if INDICES.contains(&upper.as_str()) {
        Segment::Indices
    } else {
        Segment::Forex
    }
}

/// Contract size per lot for an instrument.
pub fn contract_size(symbol: &str) -> Decimal {
    let upper = symbol.to_uppercase();
    match classify(&upper) {
        Segment::Metals => {
            if upper.starts_with("XAG") || upper == "SILVER" {
                dec!(5000)
            } else {
                dec!(100)
            }
        }
        Segment::Crypto => dec!(1),
        Segment::Indices => dec!(1),
        Segment::Forex => dec!(100000),
    }
}

/// Smallest quoted price increment for an instrument.
pub fn pip_size(symbol: &str) -> Decimal {
    let upper = symbol.to_uppercase();
    match classify(&upper) {
        Segment::Metals => dec!(0.01),
        Segment::Crypto => dec!(1),
        Segment::Indices => dec!(1),
        Segment::Forex => {
            // JPY-quoted pairs tick in hundredths
            if upper.ends_with("JPY") {
                dec!(0.01)
            } else {
                dec!(0.0001)
            }
        }
    }
}
