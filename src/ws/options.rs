//! Gateway client configuration.

use std::{fmt::Display, str::FromStr, time::Duration};

use snafu::prelude::*;

use super::{
    payload::{Identify, IdentifyProperties, PresenceUpdate},
    retry::ReconnectOptions,
    session::SessionInfo,
};
use crate::{intent::Intents, shard::ShardInfo};

/// Environment variable overriding [GatewayOptions::outbound_capacity]
pub const OUTBOUND_CAPACITY_ENV: &str = "SHARDLINE_OUTBOUND_CAPACITY";

/// Gateway protocol version
pub const GATEWAY_VERSION: u32 = 10;

/// Invalid gateway client configuration
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum InvalidOptions {
    /// token is empty
    #[snafu(display("token is empty"))]
    EmptyToken,

    /// first backoff below the 2 seconds minimum
    #[snafu(display("first backoff {backoff:?} is shorter than 2s"))]
    FirstBackoffTooShort {
        /// configured backoff
        backoff: Duration,
    },

    /// max backoff below first backoff
    #[snafu(display("max backoff {max:?} is shorter than first backoff {first:?}"))]
    MaxBackoffTooShort {
        /// first backoff
        first: Duration,
        /// max backoff
        max: Duration,
    },

    /// jitter factor outside `[0, 1]`
    #[snafu(display("jitter factor {factor} is not within [0, 1]"))]
    InvalidJitter {
        /// configured factor
        factor: f64,
    },

    /// zero outbound capacity or period
    #[snafu(display("outbound limit {capacity} per {period:?} is invalid"))]
    InvalidOutboundLimit {
        /// capacity
        capacity: u32,
        /// period
        period: Duration,
    },

    /// gateway url can't be used
    #[snafu(display("invalid gateway url: {source}"))]
    InvalidGatewayUrl {
        /// source error
        source: ParseGatewayUrlError,
    },
}

/// Per connection identify configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyOptions {
    /// shard of the connection
    pub shard: ShardInfo,
    /// subscribed intents, none to let the remote decide
    pub intents: Option<Intents>,
    /// presence set right after identify
    pub initial_presence: Option<PresenceUpdate>,
    /// member count above which offline members are not sent, 50 to 250
    pub large_threshold: u32,
    /// connection properties
    pub properties: IdentifyProperties,
    /// session to resume instead of identifying
    pub resume: Option<SessionInfo>,
}

impl Default for IdentifyOptions {
    fn default() -> Self {
        Self::new(ShardInfo::default())
    }
}

impl IdentifyOptions {
    /// Options for shard
    pub fn new(shard: ShardInfo) -> Self {
        Self {
            shard,
            intents: None,
            initial_presence: None,
            large_threshold: 250,
            properties: IdentifyProperties::default(),
            resume: None,
        }
    }

    /// Set intents
    pub fn intents(mut self, intents: Intents) -> Self {
        self.intents = Some(intents);
        self
    }

    /// Set initial presence
    pub fn initial_presence(mut self, presence: PresenceUpdate) -> Self {
        self.initial_presence = Some(presence);
        self
    }

    /// Set large threshold, clamped to 50..=250
    pub fn large_threshold(mut self, threshold: u32) -> Self {
        self.large_threshold = threshold.clamp(50, 250);
        self
    }

    /// Resume a previous session on the first connection
    pub fn resume(mut self, session: SessionInfo) -> Self {
        self.resume = Some(session);
        self
    }

    pub(crate) fn to_identify(&self, token: &str) -> Identify {
        Identify {
            token: token.to_string(),
            properties: self.properties.clone(),
            // per payload compression, transport stream compression is asked for in the url
            compress: false,
            large_threshold: self.large_threshold,
            shard: self.shard,
            presence: self.initial_presence.clone(),
            intents: self.intents,
        }
    }
}

/// Gateway client configuration
#[derive(Clone, PartialEq)]
pub struct GatewayOptions {
    /// authentication token
    pub token: String,
    /// identify configuration
    pub identify: IdentifyOptions,
    /// reconnect policy
    pub reconnect: ReconnectOptions,
    /// unacknowledged heartbeats tolerated before the connection counts as zombie
    pub max_missed_heartbeat_ack: u32,
    /// outbound payloads allowed per `outbound_period`
    pub outbound_capacity: u32,
    /// outbound limiter refill period
    pub outbound_period: Duration,
    /// delay before a session start permit returns to the pool
    pub session_start_release_delay: Duration,
    /// ask for a zlib compressed transport stream
    pub compress: bool,
    /// capacity of the event stream channel
    pub event_buffer: usize,
}

impl std::fmt::Debug for GatewayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayOptions")
            .field("token", &"hunter2")
            .field("identify", &self.identify)
            .field("reconnect", &self.reconnect)
            .field("max_missed_heartbeat_ack", &self.max_missed_heartbeat_ack)
            .field("outbound_capacity", &self.outbound_capacity)
            .field("outbound_period", &self.outbound_period)
            .field(
                "session_start_release_delay",
                &self.session_start_release_delay,
            )
            .field("compress", &self.compress)
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

impl GatewayOptions {
    /// Default options for token
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
            identify: IdentifyOptions::default(),
            reconnect: ReconnectOptions::default(),
            max_missed_heartbeat_ack: 1,
            outbound_capacity: 115,
            outbound_period: Duration::from_secs(60),
            session_start_release_delay: Duration::from_millis(5500),
            compress: true,
            event_buffer: 128,
        }
    }

    /// Set identify options
    pub fn identify(mut self, identify: IdentifyOptions) -> Self {
        self.identify = identify;
        self
    }

    /// Set reconnect policy
    pub fn reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Enable or disable transport compression
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Override outbound capacity from [OUTBOUND_CAPACITY_ENV], if set and valid
    pub fn with_env(mut self) -> Self {
        if let Ok(value) = std::env::var(OUTBOUND_CAPACITY_ENV) {
            self.apply_outbound_capacity(&value);
        }
        self
    }

    fn apply_outbound_capacity(&mut self, value: &str) {
        match value.trim().parse::<u32>() {
            Ok(capacity) if capacity > 0 => {
                log::debug!("Outbound capacity set to {} from environment", capacity);
                self.outbound_capacity = capacity;
            }
            _ => log::warn!(
                "Ignore invalid {} value {:?}",
                OUTBOUND_CAPACITY_ENV,
                value
            ),
        }
    }

    /// Check the options
    pub fn validate(&self) -> Result<(), InvalidOptions> {
        ensure!(!self.token.is_empty(), error::EmptyToken);

        let reconnect = &self.reconnect;
        ensure!(
            reconnect.first_backoff >= Duration::from_secs(2),
            error::FirstBackoffTooShort {
                backoff: reconnect.first_backoff
            }
        );
        ensure!(
            reconnect.max_backoff >= reconnect.first_backoff,
            error::MaxBackoffTooShort {
                first: reconnect.first_backoff,
                max: reconnect.max_backoff,
            }
        );
        ensure!(
            (0.0..=1.0).contains(&reconnect.jitter_factor),
            error::InvalidJitter {
                factor: reconnect.jitter_factor
            }
        );
        ensure!(
            self.outbound_capacity > 0 && !self.outbound_period.is_zero(),
            error::InvalidOutboundLimit {
                capacity: self.outbound_capacity,
                period: self.outbound_period,
            }
        );

        Ok(())
    }
}

/// Parse string as gateway url error
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(parse_url_error), context(suffix(false)))]
pub enum ParseGatewayUrlError {
    /// the str is not a valid url
    #[snafu(display("{s} is an invalid url: {source}"))]
    InvalidUrl {
        /// string be parsed
        s: String,
        /// source error
        source: url::ParseError,
    },

    /// the parsed url schema is not websocket
    #[snafu(display("the url {s} has invalid schema {schema}, only ws or wss is ok"))]
    InvalidSchema {
        /// the url
        s: String,
        /// invalid schema
        schema: String,
    },

    /// the parsed url has no host
    #[snafu(display("the gateway url {s} has no host"))]
    NoHost {
        /// the url
        s: String,
    },
}

/// Parsed gateway url
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayUrl {
    base: url::Url,
}

impl GatewayUrl {
    /// base url, without query
    pub fn base(&self) -> &url::Url {
        &self.base
    }

    /// Construct final url to connect to
    pub fn url(&self, compress: bool) -> url::Url {
        let mut u = self.base.clone();

        {
            let mut query = u.query_pairs_mut();
            query.append_pair("v", &GATEWAY_VERSION.to_string());
            query.append_pair("encoding", "json");
            if compress {
                query.append_pair("compress", "zlib-stream");
            }
        }

        u
    }
}

impl FromStr for GatewayUrl {
    type Err = ParseGatewayUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut base = url::Url::parse(s)
            .with_context(|_| parse_url_error::InvalidUrl { s: s.to_string() })?;

        ensure!(
            base.scheme() == "wss" || base.scheme() == "ws",
            parse_url_error::InvalidSchema {
                s,
                schema: base.scheme(),
            }
        );

        ensure!(base.host().is_some(), parse_url_error::NoHost { s });

        // query parameters are always rebuilt
        base.set_query(None);

        Ok(Self { base })
    }
}

impl Display for GatewayUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_gateway_url_query() {
        let gateway: GatewayUrl = "wss://gateway.example.gg/?v=6&encoding=etf".parse().unwrap();

        assert_eq!(
            gateway.url(true).as_str(),
            "wss://gateway.example.gg/?v=10&encoding=json&compress=zlib-stream"
        );
        assert_eq!(
            gateway.url(false).as_str(),
            "wss://gateway.example.gg/?v=10&encoding=json"
        );
    }

    #[test]
    fn test_gateway_url_invalid_schema() {
        let err = "https://gateway.example.gg"
            .parse::<GatewayUrl>()
            .unwrap_err();
        assert!(matches!(err, ParseGatewayUrlError::InvalidSchema { .. }));
    }

    #[test]
    fn test_gateway_url_invalid() {
        let err = "not a url".parse::<GatewayUrl>().unwrap_err();
        assert!(matches!(err, ParseGatewayUrlError::InvalidUrl { .. }));
    }

    #[test]
    fn test_default_options_are_valid() {
        let options = GatewayOptions::new("t0k");
        options.validate().unwrap();

        assert_eq!(options.outbound_capacity, 115);
        assert_eq!(options.reconnect.first_backoff, Duration::from_secs(2));
        assert_eq!(options.reconnect.max_backoff, Duration::from_secs(120));
        assert_eq!(options.max_missed_heartbeat_ack, 1);
    }

    #[test]
    fn test_invalid_options() {
        assert!(matches!(
            GatewayOptions::new("").validate(),
            Err(InvalidOptions::EmptyToken)
        ));

        let options = GatewayOptions::new("t0k").reconnect(ReconnectOptions {
            first_backoff: Duration::from_secs(1),
            ..Default::default()
        });
        assert!(matches!(
            options.validate(),
            Err(InvalidOptions::FirstBackoffTooShort { .. })
        ));

        let options = GatewayOptions::new("t0k").reconnect(ReconnectOptions {
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        });
        assert!(matches!(
            options.validate(),
            Err(InvalidOptions::MaxBackoffTooShort { .. })
        ));
    }

    #[test]
    fn test_outbound_capacity_override() {
        let mut options = GatewayOptions::new("t0k");

        options.apply_outbound_capacity("60");
        assert_eq!(options.outbound_capacity, 60);

        options.apply_outbound_capacity("zero");
        options.apply_outbound_capacity("0");
        assert_eq!(options.outbound_capacity, 60);
    }

    #[test]
    fn test_debug_hides_token() {
        let options = GatewayOptions::new("secret.value");
        assert!(!format!("{:?}", options).contains("secret.value"));
    }

    #[test]
    fn test_identify_payload() {
        let identify = IdentifyOptions::new(ShardInfo::new(2, 4).unwrap())
            .intents(Intents::GUILDS)
            .large_threshold(1000)
            .to_identify("t0k");

        assert_eq!(identify.shard, ShardInfo::new(2, 4).unwrap());
        assert_eq!(identify.large_threshold, 250);
        assert!(!identify.compress);
        assert_eq!(identify.intents, Some(Intents::GUILDS));
    }
}
