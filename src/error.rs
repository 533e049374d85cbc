//! crate error types

use snafu::prelude::*;

use crate::ws::{GatewayError, InvalidOptions as InvalidOptionsError};

/// crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// crate error type
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    /// Options rejected before connecting
    #[snafu(display("invalid gateway options: {source}"))]
    InvalidOptions {
        /// source error
        source: InvalidOptionsError,
    },

    /// Gateway client stopped for good
    #[snafu(context(false), display("gateway client stopped: {source}"))]
    Gateway {
        /// source error
        source: GatewayError,
    },
}
