//! Session start permit pool shared by many processes.
//!
//! Protocol: newline-delimited JSON over TCP, one permit per connection.
//!
//! Request: `{"op":"acquire","release_delay_ms":5500}\n`
//! Response: `{"op":"granted"}\n` or `{"op":"rejected","message":"..."}\n`
//!
//! The permit is held as long as the client keeps the connection open.
//! Closing it returns the permit to the pool after the requested delay.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, ToSocketAddrs},
};

use super::{
    session::{LocalSessionStartLimiter, Permit, SessionStartLimiter},
    LimiterError,
};

/// Error of the remote permit pool client/server
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum RemoteLimiterError {
    /// connect to the pool failed
    #[snafu(display("connect permit pool {addr} failed: {source}"))]
    Connect {
        /// pool address
        addr: String,
        /// source error
        source: std::io::Error,
    },

    /// bind the pool server failed
    #[snafu(display("bind permit pool server failed: {source}"))]
    Bind {
        /// source error
        source: std::io::Error,
    },

    /// read/write the pool connection failed
    #[snafu(display("permit pool connection broken: {source}"))]
    Io {
        /// source error
        source: std::io::Error,
    },

    /// line is not a valid protocol message
    #[snafu(display("invalid permit pool message: {source}"))]
    InvalidMessage {
        /// source error
        source: serde_json::Error,
    },

    /// peer closed the connection before answering
    #[snafu(display("permit pool connection closed unexpectedly"))]
    ConnectionClosed,

    /// pool refused to grant a permit
    #[snafu(display("permit pool rejected request: {message}"))]
    Rejected {
        /// reason
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Acquire { release_delay_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Response {
    Granted,
    Rejected { message: String },
}

fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, RemoteLimiterError> {
    let mut line = serde_json::to_vec(message).context(error::InvalidMessage)?;
    line.push(b'\n');
    Ok(line)
}

async fn read_line<R, T>(reader: &mut R) -> Result<T, RemoteLimiterError>
where
    R: AsyncBufReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.context(error::Io)?;
    ensure!(n > 0, error::ConnectionClosed);
    serde_json::from_str(line.trim_end()).context(error::InvalidMessage)
}

/// Client of a [PermitServer]
#[derive(Debug, Clone)]
pub struct RemoteSessionStartLimiter {
    addr: String,
}

impl RemoteSessionStartLimiter {
    /// Create a client for the pool listening at `addr`
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self { addr: addr.into() }
    }

    async fn request(&self, release_delay: Duration) -> Result<Permit, RemoteLimiterError> {
        log::trace!("Requesting session start permit from {}", self.addr);

        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|_| error::Connect {
                addr: self.addr.clone(),
            })?;

        let (read, mut write) = stream.into_split();
        let mut read = BufReader::new(read);

        let request = Request::Acquire {
            release_delay_ms: release_delay.as_millis() as u64,
        };
        write
            .write_all(&encode_line(&request)?)
            .await
            .context(error::Io)?;

        match read_line(&mut read).await? {
            Response::Granted => {
                log::debug!("Session start permit granted by {}", self.addr);
                // closing the connection gives the permit back
                Ok(Permit::new(move || drop((read, write))))
            }
            Response::Rejected { message } => error::Rejected { message }.fail(),
        }
    }
}

#[async_trait::async_trait]
impl SessionStartLimiter for RemoteSessionStartLimiter {
    async fn acquire(&self, release_delay: Duration) -> Result<Permit, LimiterError> {
        self.request(release_delay)
            .await
            .map_err(|source| LimiterError::Remote { source })
    }
}

/// Serves a [LocalSessionStartLimiter] to other processes
#[derive(Debug)]
pub struct PermitServer {
    listener: TcpListener,
    pool: LocalSessionStartLimiter,
}

impl PermitServer {
    /// Bind the server to `addr`
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        pool: LocalSessionStartLimiter,
    ) -> Result<Self, RemoteLimiterError> {
        let listener = TcpListener::bind(addr).await.context(error::Bind)?;
        Ok(Self { listener, pool })
    }

    /// Address the server listens on
    pub fn local_addr(&self) -> Result<SocketAddr, RemoteLimiterError> {
        self.listener.local_addr().context(error::Io)
    }

    /// Accept clients forever
    pub async fn run(self) -> Result<(), RemoteLimiterError> {
        log::info!("Permit server listening on {:?}", self.listener.local_addr());

        loop {
            let (stream, peer) = self.listener.accept().await.context(error::Io)?;
            let pool = self.pool.clone();

            tokio::spawn(async move {
                if let Err(err) = Self::serve(stream, pool).await {
                    log::warn!("Permit client {} failed: {}", peer, err);
                }
            });
        }
    }

    async fn serve(
        stream: TcpStream,
        pool: LocalSessionStartLimiter,
    ) -> Result<(), RemoteLimiterError> {
        let (read, mut write) = stream.into_split();
        let mut read = BufReader::new(read);

        let request: Request = read_line(&mut read).await?;
        let Request::Acquire { release_delay_ms } = request;
        let release_delay = Duration::from_millis(release_delay_ms);

        let mut rest = Vec::new();

        // a client giving up while queued must not be granted a permit
        let acquired = tokio::select! {
            acquired = pool.acquire(release_delay) => acquired,
            read = read.read_until(b'\n', &mut rest) => {
                match read {
                    Ok(0) | Err(_) => log::debug!("Permit client left before a permit was free"),
                    Ok(_) => log::warn!("Unexpected message from permit client, drop it"),
                }
                return Ok(());
            }
        };

        let permit = match acquired {
            Ok(permit) => permit,
            Err(err) => {
                let response = Response::Rejected {
                    message: err.to_string(),
                };
                write
                    .write_all(&encode_line(&response)?)
                    .await
                    .context(error::Io)?;
                return Ok(());
            }
        };

        write
            .write_all(&encode_line(&Response::Granted)?)
            .await
            .context(error::Io)?;

        // hold the permit until the client goes away
        loop {
            rest.clear();
            let n = read.read_until(b'\n', &mut rest).await.context(error::Io)?;
            if n == 0 {
                break;
            }
        }

        log::trace!("Permit client disconnected, release after {:?}", release_delay);
        drop(permit);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_protocol_lines() {
        let line = encode_line(&Request::Acquire {
            release_delay_ms: 5500,
        })
        .unwrap();
        assert_eq!(line, b"{\"op\":\"acquire\",\"release_delay_ms\":5500}\n");

        let granted: Response = serde_json::from_str(r#"{"op":"granted"}"#).unwrap();
        assert_eq!(granted, Response::Granted);
    }

    #[tokio::test]
    async fn test_client_leaving_queue_gets_no_permit() {
        let server = PermitServer::bind("127.0.0.1:0", LocalSessionStartLimiter::new(1))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(server.run());

        let holder = RemoteSessionStartLimiter::new(addr.clone());
        let permit = holder.acquire(Duration::ZERO).await.unwrap();

        // queue behind the holder with a long release delay, then leave
        let mut queued = TcpStream::connect(&addr).await.unwrap();
        queued
            .write_all(&encode_line(&Request::Acquire { release_delay_ms: 60_000 }).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(queued);
        tokio::time::sleep(Duration::from_millis(100)).await;

        permit.release();

        let next = RemoteSessionStartLimiter::new(addr);
        let permit = tokio::time::timeout(Duration::from_secs(2), next.acquire(Duration::ZERO))
            .await
            .expect("permit held for a client that left")
            .unwrap();
        drop(permit);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let limiter = RemoteSessionStartLimiter::new(addr.to_string());
        let err = limiter.acquire(Duration::ZERO).await.unwrap_err();

        assert!(matches!(
            err,
            LimiterError::Remote {
                source: RemoteLimiterError::Connect { .. }
            }
        ));
    }
}
