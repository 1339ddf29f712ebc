//! The fixed universe of 28 currency pairs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pair {
    Eurusd,
    Gbpusd,
    Audusd,
    Nzdusd,
    Usdcad,
    Usdchf,
    Usdjpy,
    Eurgbp,
    Euraud,
    Eurnzd,
    Eurcad,
    Eurchf,
    Eurjpy,
    Gbpaud,
    Gbpnzd,
    Gbpcad,
    Gbpchf,
    Gbpjpy,
    Audnzd,
    Audcad,
    Audchf,
    Audjpy,
    Nzdcad,
    Nzdchf,
    Nzdjpy,
    Cadchf,
    Cadjpy,
    Chfjpy,
}

pub const ALL_PAIRS: [Pair; 28] = [
    Pair::Eurusd,
    Pair::Gbpusd,
    Pair::Audusd,
    Pair::Nzdusd,
    Pair::Usdcad,
    Pair::Usdchf,
    Pair::Usdjpy,
    Pair::Eurgbp,
    Pair::Euraud,
    Pair::Eurnzd,
    Pair::Eurcad,
    Pair::Eurchf,
    Pair::Eurjpy,
    Pair::Gbpaud,
    Pair::Gbpnzd,
    Pair::Gbpcad,
    Pair::Gbpchf,
    Pair::Gbpjpy,
    Pair::Audnzd,
    Pair::Audcad,
    Pair::Audchf,
    Pair::Audjpy,
    Pair::Nzdcad,
    Pair::Nzdchf,
    Pair::Nzdjpy,
    Pair::Cadchf,
    Pair::Cadjpy,
    Pair::Chfjpy,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairError {
    #[error("unsupported currency pair: {0}")]
    Unsupported(String),
}

impl Pair {
    /// Lowercase six-letter code, also used verbatim in table names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eurusd => "eurusd",
            Self::Gbpusd => "gbpusd",
            Self::Audusd => "audusd",
            Self::Nzdusd => "nzdusd",
            Self::Usdcad => "usdcad",
            Self::Usdchf => "usdchf",
            Self::Usdjpy => "usdjpy",
            Self::Eurgbp => "eurgbp",
            Self::Euraud => "euraud",
            Self::Eurnzd => "eurnzd",
            Self::Eurcad => "eurcad",
            Self::Eurchf => "eurchf",
            Self::Eurjpy => "eurjpy",
            Self::Gbpaud => "gbpaud",
            Self::Gbpnzd => "gbpnzd",
            Self::Gbpcad => "gbpcad",
            Self::Gbpchf => "gbpchf",
            Self::Gbpjpy => "gbpjpy",
            Self::Audnzd => "audnzd",
            Self::Audcad => "audcad",
            Self::Audchf => "audchf",
            Self::Audjpy => "audjpy",
            Self::Nzdcad => "nzdcad",
            Self::Nzdchf => "nzdchf",
            Self::Nzdjpy => "nzdjpy",
            Self::Cadchf => "cadchf",
            Self::Cadjpy => "cadjpy",
            Self::Chfjpy => "chfjpy",
        }
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `eurusd`, `EURUSD`, `EUR_USD` and `eur/usd`.
pub fn parse_pair(input: &str) -> Result<Pair, PairError> {
    let normalized: String = input
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    ALL_PAIRS
        .iter()
        .copied()
        .find(|pair| pair.as_str() == normalized)
        .ok_or_else(|| PairError::Unsupported(input.to_string()))
}
