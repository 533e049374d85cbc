//! # Shardline
//!
//! A realtime chat gateway client. Keeps one shard connected to the gateway:
//! identifies or resumes its session, heartbeats, reconnects with backoff and
//! publishes dispatches and lifecycle changes as one event stream.

#![deny(missing_debug_implementations, missing_docs)]
#![forbid(unsafe_code)]

pub mod intent;
pub mod shard;
pub mod ws;

mod error;
pub use error::{Error, Result};

pub use intent::Intents;
pub use shard::ShardInfo;
pub use ws::{GatewayClient, GatewayEvent, GatewayHandle, GatewayOptions};

/// Create a client for the gateway at `url` and start it
///
/// Returns a handle and the event stream, the client runs on a spawned task
/// whose result is the close status of an intentional stop.
pub fn spawn(
    url: &str,
    options: GatewayOptions,
) -> Result<(
    GatewayHandle,
    ws::EventStream,
    tokio::task::JoinHandle<std::result::Result<ws::CloseStatus, ws::GatewayError>>,
)> {
    use snafu::ResultExt;

    let (client, events) =
        GatewayClient::with_events(url, options).context(error::InvalidOptions)?;
    let handle = client.handle();

    log::debug!("Spawn gateway client task");

    let task = tokio::spawn(client.start());

    Ok((handle, events, task))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_spawn_rejects_bad_url() {
        let err = spawn("http://gateway.example.gg", GatewayOptions::new("t0k")).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions { .. }));
    }
}
