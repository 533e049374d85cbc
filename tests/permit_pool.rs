mod common;

use std::{sync::Arc, time::Duration};

use common::{init_logger, MockConnector};
use serde_json::json;
use shardline::{
    ws::limiter::{
        remote::{PermitServer, RemoteSessionStartLimiter},
        session::{LocalSessionStartLimiter, SessionStartLimiter},
    },
    GatewayClient, GatewayOptions,
};

async fn start_server() -> String {
    let server = PermitServer::bind("127.0.0.1:0", LocalSessionStartLimiter::new(1))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.run());
    addr
}

#[tokio::test]
async fn test_remote_permit_is_exclusive() {
    init_logger();

    let addr = start_server().await;
    let first = RemoteSessionStartLimiter::new(addr.clone());
    let second = RemoteSessionStartLimiter::new(addr);

    let permit = first.acquire(Duration::ZERO).await.unwrap();

    let waiting = tokio::time::timeout(Duration::from_millis(200), second.acquire(Duration::ZERO)).await;
    assert!(waiting.is_err(), "second permit granted while the first is held");

    permit.release();

    let permit = tokio::time::timeout(Duration::from_secs(5), second.acquire(Duration::ZERO))
        .await
        .expect("permit not released")
        .unwrap();
    drop(permit);
}

#[tokio::test]
async fn test_clients_share_remote_pool() {
    init_logger();

    let addr = start_server().await;
    let limiter: Arc<dyn SessionStartLimiter> = Arc::new(RemoteSessionStartLimiter::new(addr));

    let mut options = GatewayOptions::new("t0k").compress(false);
    options.session_start_release_delay = Duration::from_millis(10);

    let (connector, mut connections) = MockConnector::new();
    let client = GatewayClient::new("wss://gateway.test", options)
        .unwrap()
        .with_connector(connector)
        .with_session_start_limiter(limiter);
    let handle = client.handle();
    let task = tokio::spawn(client.start());

    let mut conn = connections.recv().await.unwrap();
    conn.hello(41250);

    let identify = tokio::time::timeout(Duration::from_secs(5), conn.recv_payload())
        .await
        .expect("identify not sent");
    assert_eq!(identify["op"], 2);

    conn.dispatch("READY", 1, json!({ "v": 10, "session_id": "abc" }));

    handle.close(false);
    task.await.unwrap().unwrap();
}
