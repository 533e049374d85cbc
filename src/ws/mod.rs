//! Gateway websocket client: connection supervision, session lifecycle, codec and rate limits

pub mod client;
pub mod event;
pub mod heartbeat;
pub mod limiter;
pub mod options;
pub mod payload;
pub mod retry;
pub mod session;
pub mod transport;

pub use client::{CommandError, GatewayClient, GatewayError, GatewayHandle};
pub use event::{Dispatch, EventStream, GatewayEvent, StateChange};
pub use options::{GatewayOptions, GatewayUrl, IdentifyOptions, InvalidOptions};
pub use payload::{Opcode, Payload, PayloadData};
pub use retry::ReconnectOptions;
pub use session::{ConnectionState, SessionInfo};
pub use transport::{CloseStatus, Connector, WebsocketConnector};
