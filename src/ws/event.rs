//! Events published by the gateway client: application dispatches and synthetic lifecycle events.

use std::{task::Poll, time::Duration};

use futures_util::Stream;
use tokio::sync::mpsc;

use super::{client::GatewayError, payload::Payload, transport::CloseStatus};

/// Application event, a dispatch payload
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// event name, like `MESSAGE_CREATE`
    pub name: String,
    /// sequence number
    pub sequence: Option<u64>,
    /// event body
    pub data: serde_json::Value,
}

impl Dispatch {
    pub(crate) fn from_payload(payload: Payload) -> Option<Self> {
        let data = payload.data.into_dispatch().ok()?;
        Some(Self {
            name: payload.event_name.unwrap_or_default(),
            sequence: payload.sequence,
            data,
        })
    }

    /// Deserialize the body into a typed event
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Lifecycle event, emitted on connection state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// first session of this client is ready
    Connected,
    /// first reconnect attempt, will start a new session
    RetryStarted {
        /// delay before the attempt
        backoff: Duration,
    },
    /// first reconnect attempt, will resume the session
    RetryStartedResume {
        /// delay before the attempt
        backoff: Duration,
    },
    /// a reconnect attempt failed, another one follows
    RetryFailed {
        /// number of the failed attempt
        attempt: u32,
        /// delay before the next attempt
        backoff: Duration,
    },
    /// reconnected after some failed attempts
    RetrySucceeded {
        /// attempts it took
        attempts: u32,
    },
    /// session was dropped, the next connection starts a new one
    SessionInvalidated,
    /// stopped, the session is gone
    Disconnected {
        /// close status
        status: CloseStatus,
    },
    /// stopped, the session was kept and can be resumed
    DisconnectedResume,
}

/// Item of the [EventStream]
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// application event
    Dispatch(Dispatch),
    /// lifecycle event
    StateChange(StateChange),
}

impl GatewayEvent {
    /// application event, if it is one
    pub fn as_dispatch(&self) -> Option<&Dispatch> {
        match self {
            Self::Dispatch(dispatch) => Some(dispatch),
            Self::StateChange(_) => None,
        }
    }

    /// lifecycle event, if it is one
    pub fn as_state_change(&self) -> Option<&StateChange> {
        match self {
            Self::StateChange(change) => Some(change),
            Self::Dispatch(_) => None,
        }
    }
}

/// Gateway event stream.
///
/// Ends after the client stopped, the last item is an error if it stopped
/// because of a fatal close or exhausted retries.
#[derive(Debug)]
pub struct EventStream {
    pub(crate) rx: mpsc::Receiver<Result<GatewayEvent, GatewayError>>,
}

impl Stream for EventStream {
    type Item = Result<GatewayEvent, GatewayError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<Result<GatewayEvent, GatewayError>>,
}

impl EventSender {
    pub fn new(buffer: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, EventStream { rx })
    }

    async fn send(&self, item: Result<GatewayEvent, GatewayError>) -> bool {
        // receiver dropped means nobody listens, the client keeps its connection anyway
        self.tx.send(item).await.is_ok()
    }

    pub async fn dispatch(&self, dispatch: Dispatch) -> bool {
        log::trace!("Publish dispatch {}", dispatch.name);
        self.send(Ok(GatewayEvent::Dispatch(dispatch))).await
    }

    pub async fn state_change(&self, change: StateChange) -> bool {
        log::debug!("Publish state change {:?}", change);
        self.send(Ok(GatewayEvent::StateChange(change))).await
    }

    pub async fn error(&self, err: GatewayError) -> bool {
        log::trace!("Publish terminal error: {}", err);
        self.send(Err(err)).await
    }
}

#[cfg(test)]
mod test {
    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_dispatch_from_payload() {
        let payload = Payload::dispatch("MESSAGE_CREATE", 4, json!({ "content": "hi" }));
        let dispatch = Dispatch::from_payload(payload).unwrap();

        assert_eq!(dispatch.name, "MESSAGE_CREATE");
        assert_eq!(dispatch.sequence, Some(4));

        #[derive(serde::Deserialize)]
        struct Message {
            content: String,
        }
        assert_eq!(dispatch.parse::<Message>().unwrap().content, "hi");
    }

    #[test]
    fn test_non_dispatch_payload() {
        assert!(Dispatch::from_payload(Payload::heartbeat(None)).is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_sender_dropped() {
        let (sender, mut stream) = EventSender::new(4);

        assert!(sender.state_change(StateChange::Connected).await);
        drop(sender);

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.as_state_change(), Some(&StateChange::Connected));
        assert!(stream.next().await.is_none());
    }
}
