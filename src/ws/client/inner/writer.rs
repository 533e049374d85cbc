use std::sync::Arc;

use futures_util::SinkExt;
use snafu::prelude::*;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::ws::{
    limiter::{session::Permit, LimiterError, RateLimiter},
    payload::{redact_token, EncodePayloadError, Payload},
    transport::{CloseStatus, Frame, FrameSink, TransportError},
};

/// Error that stops the write worker
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub(crate) enum WriteError {
    #[snafu(display("write frame failed: {source}"))]
    Transport { source: TransportError },

    #[snafu(display("{source}"))]
    Encode { source: EncodePayloadError },

    #[snafu(display("outbound rate limiter failed: {source}"))]
    Limiter { source: LimiterError },
}

/// Item for the write worker
#[derive(Debug)]
pub(crate) enum Outbound {
    /// rate limited payload
    Payload(Payload),
    /// identify, sent without rate limit, the permit is released after sending
    Identify(Payload, Permit),
    /// session is ready, start sending queued commands
    Ready,
    /// send close frame and stop
    Close(CloseStatus),
}

/// Owns the sending half of one connection.
///
/// Heartbeats, session start payloads and user commands are merged here, so
/// they all share one outbound rate limiter.
pub(crate) struct WriteWorker {
    sink: FrameSink,
    limiter: RateLimiter,
    rx: mpsc::UnboundedReceiver<Outbound>,
    commands: Arc<Mutex<mpsc::Receiver<Payload>>>,
}

/// Take the next command once the limiter has a token for it.
///
/// Commands stay in the shared queue while rate limited, so a connection
/// closing in the meantime leaves them to the next one.
async fn next_command(
    commands: &mut Option<OwnedMutexGuard<mpsc::Receiver<Payload>>>,
    limiter: &RateLimiter,
) -> Payload {
    if let Some(rx) = commands {
        loop {
            let delay = limiter.delay_to_consume(1).unwrap_or_default();
            if delay.is_zero() {
                break;
            }
            tokio::time::sleep(delay).await;
        }
        if let Some(payload) = rx.recv().await {
            return payload;
        }
    }
    std::future::pending().await
}

impl WriteWorker {
    pub fn new(
        sink: FrameSink,
        limiter: RateLimiter,
        rx: mpsc::UnboundedReceiver<Outbound>,
        commands: Arc<Mutex<mpsc::Receiver<Payload>>>,
    ) -> Self {
        Self {
            sink,
            limiter,
            rx,
            commands,
        }
    }

    async fn write(&mut self, payload: &Payload) -> Result<(), WriteError> {
        let json = payload.to_json().context(error::Encode)?;

        log::trace!("Send {} payload: {}", payload.opcode(), redact_token(&json));

        self.sink
            .send(Frame::Text(json))
            .await
            .context(error::Transport)
    }

    pub async fn run(mut self) -> Result<(), WriteError> {
        log::debug!("Write worker start");

        let mut commands = None;

        loop {
            let item = tokio::select! {
                biased;

                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => {
                        log::debug!("Connection dropped write worker, stop");
                        break;
                    }
                },

                payload = next_command(&mut commands, &self.limiter) => {
                    log::trace!("Dequeue {} command", payload.opcode());
                    Outbound::Payload(payload)
                },
            };

            match item {
                Outbound::Payload(payload) => {
                    self.limiter.acquire(1).await.context(error::Limiter)?;
                    self.write(&payload).await?;
                }
                Outbound::Identify(payload, permit) => {
                    self.write(&payload).await?;
                    log::trace!("Identify sent, give back session start permit");
                    drop(permit);
                }
                Outbound::Ready if commands.is_none() => {
                    log::debug!("Session ready, start sending commands");
                    commands = Some(self.commands.clone().lock_owned().await);
                }
                Outbound::Ready => log::trace!("Already sending commands"),
                Outbound::Close(status) => {
                    log::debug!("Send close frame with status {}", status);
                    self.sink
                        .send(Frame::Close(Some(status)))
                        .await
                        .context(error::Transport)?;
                    break;
                }
            }
        }

        log::debug!("Write worker stop");

        self.sink.close().await.context(error::Transport)
    }
}
