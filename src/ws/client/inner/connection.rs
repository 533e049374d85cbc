use std::{future, time::Duration};

use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};

use super::{
    writer::{Outbound, WriteError, WriteWorker},
    Supervisor, CLOSE_TIMEOUT_SECS,
};
use crate::ws::{
    client::Control,
    event::{Dispatch, StateChange},
    heartbeat::{Beat, HeartbeatMonitor},
    limiter::{session::Permit, LimiterError, RateLimiter},
    payload::{
        Hello, InvalidSession, Payload, PayloadData, PayloadStream, PayloadStreamError, Resume,
        READY, RESUMED,
    },
    retry::{DisconnectAction, DisconnectCause},
    session::ConnectionState,
    transport::{CloseStatus, FrameStream, Transport},
};

/// One physical connection, lives until the transport closes.
///
/// Runs the inbound loop on the supervisor task, writes are handed to a
/// [WriteWorker] task.
pub(super) struct Connection<'a> {
    sv: &'a mut Supervisor,
    stream: PayloadStream<FrameStream>,
    outbound: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<Result<(), WriteError>>,
    writer_stopped: bool,
    /// commands are released to the writer once per connection
    commands_released: bool,
    heartbeat: HeartbeatMonitor,
    identify: Option<BoxFuture<'static, Result<Permit, LimiterError>>>,
}

async fn wait_permit(
    identify: &mut Option<BoxFuture<'static, Result<Permit, LimiterError>>>,
) -> Result<Permit, LimiterError> {
    match identify.as_mut() {
        Some(fut) => fut.await,
        None => future::pending().await,
    }
}

async fn wait_writer(writer: &mut JoinHandle<Result<(), WriteError>>, stopped: bool) -> String {
    if stopped {
        return future::pending().await;
    }
    match writer.await {
        Ok(Ok(())) => "write worker stopped".to_string(),
        Ok(Err(err)) => err.to_string(),
        Err(err) => format!("write worker panicked: {}", err),
    }
}

impl<'a> Connection<'a> {
    pub fn new(sv: &'a mut Supervisor, transport: Transport) -> Result<Self, LimiterError> {
        let limiter = RateLimiter::new(sv.options.outbound_capacity, sv.options.outbound_period)?;

        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = WriteWorker::new(transport.sink, limiter, rx, sv.commands.clone());
        let writer = tokio::spawn(writer.run());

        let stream = PayloadStream::new(transport.stream, sv.options.compress);
        let heartbeat = HeartbeatMonitor::new(sv.options.max_missed_heartbeat_ack);

        Ok(Self {
            sv,
            stream,
            outbound,
            writer,
            writer_stopped: false,
            commands_released: false,
            heartbeat,
            identify: None,
        })
    }

    fn send(&self, item: Outbound) {
        // a stopped writer is noticed by the select loop
        let _ = self.outbound.send(item);
    }

    fn send_heartbeat(&self) {
        log::trace!("Send heartbeat with sequence {:?}", self.sv.session.sequence());
        self.send(Outbound::Payload(Payload::heartbeat(self.sv.session.sequence())));
    }

    pub fn session_resumable(&self) -> bool {
        self.sv.session.resumable()
    }

    /// Run until the connection ends, returns why it ended
    pub async fn run(&mut self) -> DisconnectCause {
        log::debug!("Connection start in {} state", self.sv.state());

        let cause = loop {
            let cause = tokio::select! {
                biased;

                control = self.sv.recv_control() => match control {
                    Control::Close { resumable } => Some(DisconnectCause::UserClose { resumable }),
                    Control::Reconnect => Some(DisconnectCause::UserReconnect),
                },

                result = self.stream.next() => match result {
                    Some(Ok(payload)) => self.handle(payload).await,
                    Some(Err(err)) if !err.is_fatal() => {
                        log::warn!("Payload stream error happened but ignored: {}", err);
                        None
                    }
                    Some(Err(PayloadStreamError::Closed { status })) => {
                        log::info!("Connection closed by remote with status {}", status);
                        Some(DisconnectCause::RemoteClosed(status))
                    }
                    Some(Err(err)) => {
                        log::warn!("Payload stream broken: {}", err);
                        Some(DisconnectCause::Failure(err.to_string()))
                    }
                    None => {
                        log::info!("Connection dropped without close frame");
                        Some(DisconnectCause::RemoteClosed(CloseStatus::abnormal()))
                    }
                },

                beat = self.heartbeat.tick() => match beat {
                    Beat::Send => {
                        self.send_heartbeat();
                        None
                    }
                    Beat::Zombie => {
                        log::warn!("Reconnecting due to zombie or failed connection");
                        Some(DisconnectCause::Zombie)
                    }
                },

                permit = wait_permit(&mut self.identify) => {
                    self.identify = None;
                    match permit {
                        Ok(permit) => {
                            self.send_identify(permit);
                            None
                        }
                        Err(err) => {
                            log::warn!("Acquire session start permit failed: {}", err);
                            Some(DisconnectCause::Failure(err.to_string()))
                        }
                    }
                },

                reason = wait_writer(&mut self.writer, self.writer_stopped) => {
                    self.writer_stopped = true;
                    log::warn!("Outbound side broken: {}", reason);
                    Some(DisconnectCause::Failure(reason))
                },
            };

            if let Some(cause) = cause {
                break cause;
            }
        };

        self.sv.move_to(ConnectionState::Disconnecting);
        self.heartbeat.disarm();

        cause
    }

    /// Close the outbound side and wait for the writer to finish
    pub async fn close(mut self, cause: &DisconnectCause, action: DisconnectAction) {
        self.identify = None;

        if self.writer_stopped {
            return;
        }

        self.send(Outbound::Close(cause.local_close_status(action)));

        let timeout = Duration::from_secs(CLOSE_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, &mut self.writer).await {
            Ok(Ok(Ok(()))) => log::trace!("Write worker closed transport"),
            Ok(Ok(Err(err))) => log::debug!("Write worker stopped with error: {}", err),
            Ok(Err(err)) => log::debug!("Write worker panicked: {}", err),
            Err(_) => {
                log::debug!("Write worker not stopped in {:?}, abort it", timeout);
                self.writer.abort();
            }
        }
    }

    async fn handle(&mut self, payload: Payload) -> Option<DisconnectCause> {
        log::trace!("Received {} payload", payload.opcode());

        if matches!(payload.data, PayloadData::Dispatch(_)) {
            return self.handle_dispatch(payload).await;
        }

        match payload.data {
            PayloadData::Heartbeat(_) => {
                log::debug!("Remote requested a heartbeat");
                self.send_heartbeat();
                None
            }
            PayloadData::Reconnect => {
                log::info!("Reconnecting due to remote request");
                Some(DisconnectCause::ReconnectRequested)
            }
            PayloadData::InvalidSession(InvalidSession(resumable)) => {
                self.handle_invalid_session(resumable)
            }
            PayloadData::Hello(hello) => {
                self.handle_hello(hello);
                None
            }
            PayloadData::HeartbeatAck => {
                self.heartbeat.on_ack_received();
                let rtt = self.heartbeat.response_time();
                self.sv
                    .health_tx
                    .send_modify(|health| health.response_time = rtt);
                None
            }
            data => {
                log::debug!("Ignore unexpected inbound {} payload", data.opcode());
                None
            }
        }
    }

    fn handle_hello(&mut self, hello: Hello) {
        log::debug!("Received hello, heartbeat interval {}ms", hello.heartbeat_interval);

        self.heartbeat
            .arm(Duration::from_millis(hello.heartbeat_interval));

        match self.sv.state() {
            ConnectionState::StartResuming => self.send_resume(),
            ConnectionState::StartIdentifying => self.start_identify(),
            state => log::warn!("Ignore hello received in {} state", state),
        }
    }

    fn start_identify(&mut self) {
        if self.identify.is_some() {
            log::debug!("Identify already pending");
            return;
        }

        log::debug!("Waiting session start permit before identify");

        let limiter = self.sv.session_limiter.clone();
        let delay = self.sv.options.session_start_release_delay;
        self.identify = Some(async move { limiter.acquire(delay).await }.boxed());
    }

    fn send_identify(&mut self, permit: Permit) {
        let identify = self
            .sv
            .options
            .identify
            .to_identify(&self.sv.options.token);

        log::debug!("Identifying as shard {}", identify.shard);

        self.send(Outbound::Identify(Payload::identify(identify), permit));
    }

    fn send_resume(&mut self) {
        match self.sv.session.info() {
            Some(info) => {
                log::debug!(
                    "Resuming session {} from sequence {}",
                    info.session_id,
                    info.sequence
                );
                self.send(Outbound::Payload(Payload::resume(Resume {
                    token: self.sv.options.token.clone(),
                    session_id: info.session_id,
                    seq: info.sequence,
                })));
            }
            None => {
                log::debug!("No session to resume, identify instead");
                self.sv.move_to(ConnectionState::StartIdentifying);
                self.start_identify();
            }
        }
    }

    fn handle_invalid_session(&mut self, resumable: bool) -> Option<DisconnectCause> {
        if resumable && self.sv.session.resumable() {
            log::info!("Session invalidated but resumable, resume it");
            self.sv.move_to(ConnectionState::StartResuming);
            self.send_resume();
            None
        } else {
            log::info!("Reconnecting due to non-resumable session invalidation");
            Some(DisconnectCause::SessionInvalidated)
        }
    }

    async fn handle_dispatch(&mut self, payload: Payload) -> Option<DisconnectCause> {
        if let Some(sequence) = payload.sequence {
            if self.sv.session.observe_sequence(sequence) {
                self.sv.publish_health();
            }
        }

        match payload.event_name.as_deref() {
            Some(READY) => {
                let ready = match payload.ready() {
                    Some(Ok(ready)) => ready,
                    Some(Err(err)) => {
                        log::warn!("Invalid READY payload: {}", err);
                        return Some(DisconnectCause::Failure(err.to_string()));
                    }
                    None => return None,
                };
                self.sv.session.on_ready(&ready);
                self.sv.publish_health();
                self.on_session_ready().await;
            }
            Some(RESUMED) => {
                log::info!("Session resumed");
                self.on_session_ready().await;
            }
            _ => {}
        }

        if let Some(dispatch) = Dispatch::from_payload(payload) {
            self.sv.events.dispatch(dispatch).await;
        }

        None
    }

    async fn on_session_ready(&mut self) {
        self.sv.move_to(ConnectionState::Connected);
        if !self.commands_released {
            self.commands_released = true;
            self.send(Outbound::Ready);
        }

        let attempts = self.sv.retry.reset();
        let change = if attempts > 0 {
            log::info!("Reconnected after {} attempts", attempts);
            StateChange::RetrySucceeded { attempts }
        } else {
            log::info!("Connected to gateway");
            StateChange::Connected
        };
        self.sv.events.state_change(change).await;
    }
}
