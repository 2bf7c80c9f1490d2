use thiserror::Error;

use crate::currency::{Amount, Nominal};

#[derive(Error, Debug)]
pub enum Error {
    // Currency errors
    #[error("Nominal is not valid for this group: {}", Amount::from(*nominal).format_100i())]
    NominalInvalid { nominal: Nominal },

    #[error("Not enough nominals for this amount: {}", amount.format_100i())]
    NominalCount { amount: Amount },

    #[error("Expend strategy is not usable: {0}")]
    StrategyInvalid(String),

    // Encoding errors
    #[error("Invalid hex input: {0}")]
    InvalidHex(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error in {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Configuration include loop: {path}")]
    IncludeLoop { path: String },
}

pub type Result<T> = std::result::Result<T, Error>;
