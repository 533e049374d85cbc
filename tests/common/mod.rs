#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use serde_json::{json, Value};
use shardline::ws::{
    transport::{Frame, Transport, TransportError},
    CloseStatus, Connector,
};
use tokio::sync::mpsc;

pub fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

/// Remote side of one mocked connection
pub struct MockConnection {
    pub url: url::Url,
    to_client: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl MockConnection {
    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.send(Ok(Frame::Text(value.to_string())));
    }

    pub fn hello(&self, heartbeat_interval: u64) {
        self.send_json(json!({ "op": 10, "d": { "heartbeat_interval": heartbeat_interval } }));
    }

    pub fn dispatch(&self, name: &str, sequence: u64, data: Value) {
        self.send_json(json!({ "op": 0, "s": sequence, "t": name, "d": data }));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self
            .to_client
            .send(Ok(Frame::Close(Some(CloseStatus::new(code, reason)))));
    }

    /// Next payload sent by the client, heartbeats are acked and skipped
    pub async fn recv_payload(&mut self) -> Value {
        loop {
            match self.from_client.recv().await {
                Some(Frame::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["op"] == 1 {
                        self.send_json(json!({ "op": 11 }));
                        continue;
                    }
                    return value;
                }
                Some(frame) => panic!("expect text frame, got {:?}", frame),
                None => panic!("client dropped the connection"),
            }
        }
    }

    /// Next payload sent by the client with opcode `op`, nothing is acked
    pub async fn recv_op(&mut self, op: u64) -> Value {
        loop {
            match self.from_client.recv().await {
                Some(Frame::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["op"] == op {
                        return value;
                    }
                }
                Some(frame) => panic!("expect text frame, got {:?}", frame),
                None => panic!("client dropped the connection"),
            }
        }
    }

    /// Status of the close frame sent by the client, skipping other frames
    pub async fn recv_close(&mut self) -> Option<CloseStatus> {
        while let Some(frame) = self.from_client.recv().await {
            if let Frame::Close(status) = frame {
                return status;
            }
        }
        None
    }
}

/// Hands every opened connection to the test
#[derive(Debug)]
pub struct MockConnector {
    tx: mpsc::UnboundedSender<MockConnection>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &url::Url) -> Result<Transport, TransportError> {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();

        let sink = futures_util::sink::unfold(
            client_tx,
            |tx: mpsc::UnboundedSender<Frame>, frame: Frame| async move {
                tx.send(frame).map_err(|_| TransportError::Closed)?;
                Ok::<_, TransportError>(tx)
            },
        );
        let stream = futures_util::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        self.tx
            .send(MockConnection {
                url: url.clone(),
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Closed)?;

        Ok(Transport::new(sink, stream))
    }
}

/// Refuses every connection
#[derive(Debug, Default, Clone)]
pub struct RefusingConnector {
    pub attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, _url: &url::Url) -> Result<Transport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Closed)
    }
}
