mod connection;
mod supervisor;
mod writer;

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use super::{Control, Health};
use crate::ws::{
    event::EventSender,
    limiter::session::SessionStartLimiter,
    options::{GatewayOptions, GatewayUrl},
    payload::Payload,
    retry::RetryContext,
    session::{ConnectionState, Session},
    transport::Connector,
};

/// Wait for the writer to flush the close frame before dropping it
const CLOSE_TIMEOUT_SECS: u64 = 5;

/// State that outlives single connections, owned by the supervisor task.
pub(crate) struct Supervisor {
    pub options: GatewayOptions,
    pub gateway: GatewayUrl,
    pub connector: Arc<dyn Connector>,
    pub session_limiter: Arc<dyn SessionStartLimiter>,
    pub session: Session,
    pub retry: RetryContext,
    pub events: EventSender,
    pub state_tx: watch::Sender<ConnectionState>,
    pub health_tx: watch::Sender<Health>,
    /// none once every handle is dropped
    pub control_rx: Option<mpsc::UnboundedReceiver<Control>>,
    /// locked by the writer of the connected connection
    pub commands: Arc<Mutex<mpsc::Receiver<Payload>>>,
}

impl Supervisor {
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn move_to(&self, state: ConnectionState) {
        let last = self.state_tx.send_replace(state);
        if last != state {
            log::debug!("Move to {} state", state);
        }
    }

    pub fn publish_health(&self) {
        let session = self.session.info();
        self.health_tx.send_modify(|health| health.session = session);
    }

    pub async fn recv_control(&mut self) -> Control {
        match self.control_rx.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(control) => control,
                None => {
                    log::debug!("Every gateway handle dropped, stop watching controls");
                    self.control_rx = None;
                    std::future::pending().await
                }
            },
            None => std::future::pending().await,
        }
    }
}
