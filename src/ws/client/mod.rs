//! Gateway client of one shard and the handle that controls it.

mod inner;

use std::{sync::Arc, time::Duration};

use snafu::prelude::*;
use tokio::sync::{mpsc, watch, Mutex};

use super::{
    event::{EventSender, EventStream},
    limiter::session::{LocalSessionStartLimiter, SessionStartLimiter},
    options::{error as options_error, GatewayOptions, GatewayUrl, InvalidOptions},
    payload::{Payload, PresenceUpdate, RequestGuildMembers, VoiceStateUpdate},
    retry::DisconnectCause,
    session::{ConnectionState, Session, SessionInfo},
    transport::{CloseStatus, Connector, WebsocketConnector},
};
use inner::Supervisor;

/// Error that stops the gateway client for good
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum GatewayError {
    /// remote rejected the token
    #[snafu(display("authentication failed, closed with status {status}"))]
    AuthenticationFailed {
        /// close status
        status: CloseStatus,
    },

    /// remote closed with a code that forbids reconnecting
    #[snafu(display("gateway closed with non-retryable status {status}"))]
    Fatal {
        /// close status
        status: CloseStatus,
    },

    /// reconnect attempts exceeded the configured limit
    #[snafu(display("retries exhausted after {attempts} attempts, last disconnect: {cause}"))]
    RetriesExhausted {
        /// attempts made
        attempts: u32,
        /// cause of the last disconnect
        cause: DisconnectCause,
    },
}

impl GatewayError {
    /// close status that caused this error, if any
    pub fn status(&self) -> Option<&CloseStatus> {
        match self {
            Self::AuthenticationFailed { status } | Self::Fatal { status } => Some(status),
            Self::RetriesExhausted { .. } => None,
        }
    }
}

/// Error when send a command through [GatewayHandle]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(command_error), context(suffix(false)))]
pub enum CommandError {
    /// client already stopped
    #[snafu(display("gateway client stopped"))]
    Stopped,

    /// payload can't be sent as a command, session start is managed by the client
    #[snafu(display("{opcode} payload can't be sent as a command"))]
    NotACommand {
        /// opcode
        opcode: crate::ws::payload::Opcode,
    },
}

#[derive(Debug)]
pub(crate) enum Control {
    Close { resumable: bool },
    Reconnect,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Health {
    pub session: Option<SessionInfo>,
    pub response_time: Option<Duration>,
}

/// Gateway client, supervises connections of one shard.
///
/// Opens a connection, starts or resumes the session and keeps reconnecting
/// until it is stopped by [GatewayHandle::close], a fatal close code or
/// exhausted retries.
pub struct GatewayClient {
    supervisor: Supervisor,
    handle: GatewayHandle,
    events: Option<EventStream>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("gateway", &self.supervisor.gateway)
            .field("options", &self.supervisor.options)
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Create a client for the gateway at `url`
    pub fn new(url: &str, options: GatewayOptions) -> Result<Self, InvalidOptions> {
        let (mut client, events) = Self::with_events(url, options)?;
        client.events = Some(events);
        Ok(client)
    }

    /// Create a client and hand its event stream out right away
    pub(crate) fn with_events(
        url: &str,
        options: GatewayOptions,
    ) -> Result<(Self, EventStream), InvalidOptions> {
        options.validate()?;

        let gateway: GatewayUrl = url.parse().context(options_error::InvalidGatewayUrl)?;

        let session = Session::new(options.identify.resume.clone());
        let initial_state = session.start_state();

        let (events_tx, events) = EventSender::new(options.event_buffer.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(options.outbound_capacity as usize);
        let (state_tx, state_rx) = watch::channel(initial_state);
        let (health_tx, health_rx) = watch::channel(Health {
            session: session.info(),
            response_time: None,
        });

        log::debug!(
            "Create gateway client for {}, shard {}",
            gateway,
            options.identify.shard
        );

        let supervisor = Supervisor {
            options,
            gateway,
            connector: Arc::new(WebsocketConnector),
            session_limiter: Arc::new(LocalSessionStartLimiter::default()),
            session,
            retry: Default::default(),
            events: events_tx,
            state_tx,
            health_tx,
            control_rx: Some(control_rx),
            commands: Arc::new(Mutex::new(command_rx)),
        };

        let client = Self {
            supervisor,
            handle: GatewayHandle {
                control_tx,
                command_tx,
                state_rx,
                health_rx,
            },
            events: None,
        };

        Ok((client, events))
    }

    /// Use another transport
    pub fn with_connector<C: Connector + 'static>(mut self, connector: C) -> Self {
        self.supervisor.connector = Arc::new(connector);
        self
    }

    /// Share a session start limiter with other clients
    pub fn with_session_start_limiter(mut self, limiter: Arc<dyn SessionStartLimiter>) -> Self {
        self.supervisor.session_limiter = limiter;
        self
    }

    /// Handle to control the client, can be cloned
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Take the event stream, only the first call returns it
    pub fn events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    /// Run the client until it stops for good.
    ///
    /// Returns the close status of an intentional stop, or the error that
    /// stopped it. The error is also the last item of the event stream.
    pub async fn start(self) -> Result<CloseStatus, GatewayError> {
        // the stream is closed when nobody took it
        drop(self.events);
        self.supervisor.run().await
    }
}

/// Handle of a running [GatewayClient]
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    command_tx: mpsc::Sender<Payload>,
    state_rx: watch::Receiver<ConnectionState>,
    health_rx: watch::Receiver<Health>,
}

impl GatewayHandle {
    /// Ask the client to stop, keeping the session resumable if `resumable`.
    ///
    /// Safe to call many times, calls after the client stopped do nothing.
    pub fn close(&self, resumable: bool) {
        log::debug!("Close requested, resumable: {}", resumable);
        let _ = self.control_tx.send(Control::Close { resumable });
    }

    /// Ask the client to drop the current connection and resume on a new one
    pub fn reconnect(&self) {
        log::debug!("Reconnect requested");
        let _ = self.control_tx.send(Control::Reconnect);
    }

    /// Queue a command, it is sent once the session is ready and the rate limit allows
    pub async fn send(&self, payload: Payload) -> Result<(), CommandError> {
        ensure!(
            !payload.is_startup(),
            command_error::NotACommand {
                opcode: payload.opcode()
            }
        );

        self.command_tx
            .send(payload)
            .await
            .map_err(|_| command_error::Stopped.build())
    }

    /// Update presence
    pub async fn update_presence(&self, presence: PresenceUpdate) -> Result<(), CommandError> {
        self.send(Payload::presence_update(presence)).await
    }

    /// Join, move or leave a voice channel
    pub async fn update_voice_state(&self, voice: VoiceStateUpdate) -> Result<(), CommandError> {
        self.send(Payload::voice_state_update(voice)).await
    }

    /// Request guild members, they arrive as dispatches
    pub async fn request_guild_members(
        &self,
        request: RequestGuildMembers,
    ) -> Result<(), CommandError> {
        self.send(Payload::request_guild_members(request)).await
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Is a session ready on the current connection
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch connection state changes
    pub fn state_events(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Current session, can be persisted and passed to
    /// [IdentifyOptions::resume](super::options::IdentifyOptions::resume)
    pub fn session(&self) -> Option<SessionInfo> {
        self.health_rx.borrow().session.clone()
    }

    /// Current session id
    pub fn session_id(&self) -> Option<String> {
        self.session().map(|s| s.session_id)
    }

    /// Last sequence number received
    pub fn sequence(&self) -> Option<u64> {
        self.session().map(|s| s.sequence)
    }

    /// Time between the last heartbeat and its ack
    pub fn response_time(&self) -> Option<Duration> {
        self.health_rx.borrow().response_time
    }
}
