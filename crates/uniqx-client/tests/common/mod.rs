//! Scripted relay and local services for integration tests
#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uniqx_client::{ReconnectConfig, SessionTimeouts, Tunnel, TunnelConfig, TunnelError};
use uniqx_proto::{CloseReason, Frame, FrameCodec, Message, Protocol, StreamId};

/// Port the fake relay hands out to TCP tunnels that ask for none
pub const ASSIGNED_PORT: u16 = 30000;

/// A `register` frame as the relay received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub protocol: Protocol,
    pub remote_port: Option<u16>,
    pub subdomain: String,
}

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("uniqx_client=debug")
        .with_test_writer()
        .try_init();
}

/// Relay side of the protocol, driven step by step by the test
pub struct FakeRelay {
    listener: TcpListener,
}

impl FakeRelay {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> String {
        self.listener.local_addr().unwrap().to_string()
    }

    pub async fn accept(&self) -> RelayConn {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("client did not connect to the relay")
            .unwrap();
        RelayConn {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// True if the client stays away for `window`
    pub async fn no_connection_within(&self, window: Duration) -> bool {
        tokio::time::timeout(window, self.listener.accept())
            .await
            .is_err()
    }
}

pub struct RelayConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl RelayConn {
    /// Next frame from the client; `None` once it closed the connection
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = FrameCodec::decode(&mut self.buf).unwrap() {
                return Some(frame);
            }
            let read = tokio::time::timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for a frame from the client")
                .unwrap_or(0);
            if read == 0 {
                return None;
            }
        }
    }

    pub async fn recv_message(&mut self) -> Message {
        self.recv()
            .await
            .expect("client closed the relay connection")
            .into_message()
            .unwrap()
    }

    pub async fn send(&mut self, frame: Frame) {
        self.stream
            .write_all(&frame.encode().unwrap())
            .await
            .unwrap();
    }

    pub async fn expect_request(&mut self) -> TunnelRequest {
        match self.recv_message().await {
            Message::Register {
                protocol,
                remote_port,
                subdomain,
            } => TunnelRequest {
                protocol,
                remote_port,
                subdomain,
            },
            other => panic!("expected register, got {:?}", other),
        }
    }

    pub async fn expect_register(&mut self) -> String {
        self.expect_request().await.subdomain
    }

    /// Confirm whatever the client asks for, assigning a name (and a port
    /// for TCP) when it asks for none
    pub async fn accept_registration(&mut self) -> String {
        let request = self.expect_request().await;
        self.confirm(request).await.0
    }

    pub async fn confirm(&mut self, request: TunnelRequest) -> (String, Option<u16>) {
        let subdomain = if request.subdomain.is_empty() {
            "assigned-1".to_string()
        } else {
            request.subdomain
        };
        let port = match request.protocol {
            Protocol::Tcp => Some(request.remote_port.unwrap_or(ASSIGNED_PORT)),
            Protocol::Http => None,
        };
        self.send(Frame::registered(&subdomain, port)).await;
        (subdomain, port)
    }

    /// Read until the client closes the connection
    pub async fn expect_eof(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv().await {
            frames.push(frame);
        }
        frames
    }

    /// Gather data for `ids` until each has been closed by the client
    pub async fn collect_streams(
        &mut self,
        ids: &[StreamId],
    ) -> HashMap<StreamId, (Vec<u8>, CloseReason)> {
        let mut data: HashMap<StreamId, Vec<u8>> = HashMap::new();
        let mut closed = HashMap::new();

        while closed.len() < ids.len() {
            match self.recv_message().await {
                Message::Data { stream_id, payload } => {
                    data.entry(stream_id).or_default().extend_from_slice(&payload);
                }
                Message::Close {
                    stream_id, reason, ..
                } => {
                    let bytes = data.remove(&stream_id).unwrap_or_default();
                    closed.insert(stream_id, (bytes, reason));
                }
                Message::Ping { payload } => self.send(Frame::pong(payload)).await,
                other => panic!("unexpected frame while collecting streams: {:?}", other),
            }
        }
        closed
    }

    pub async fn collect_stream(&mut self, id: StreamId) -> (Vec<u8>, CloseReason) {
        self.collect_streams(&[id])
            .await
            .remove(&id)
            .expect("stream was not closed")
    }

    pub fn close(self) {
        drop(self.stream);
    }
}

/// Echo server; reports on the channel each time a connection ends
pub async fn spawn_echo_server() -> (u16, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
                let _ = closed_tx.send(());
            });
        }
    });

    (port, closed_rx)
}

/// Serves one canned HTTP response per connection after `delay`
pub async fn spawn_http_server(response: &'static [u8], delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                tokio::time::sleep(delay).await;
                let _ = socket.write_all(response).await;
            });
        }
    });

    port
}

/// A port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn test_timeouts() -> SessionTimeouts {
    SessionTimeouts {
        connect: Duration::from_secs(2),
        register: Duration::from_secs(2),
        read_idle: Duration::from_secs(30),
        ping_interval: Duration::from_secs(10),
        pong_timeout: Duration::from_secs(5),
        drain: Duration::from_secs(2),
        local_dial: Duration::from_secs(1),
    }
}

pub fn test_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        multiplier: 2.0,
        jitter: 0.0,
        stability_window: Duration::from_secs(10),
        max_attempts: None,
    }
}

pub fn test_config(relay: &FakeRelay, local_port: u16) -> TunnelConfig {
    TunnelConfig::builder()
        .local_port(local_port)
        .subdomain("demo")
        .relay_host(relay.addr())
        .timeouts(test_timeouts())
        .reconnect(test_reconnect())
        .build()
        .unwrap()
}

pub fn spawn_tunnel(
    config: TunnelConfig,
) -> (Arc<Tunnel>, JoinHandle<Result<(), TunnelError>>) {
    let tunnel = Arc::new(Tunnel::new(config));
    let runner = tunnel.clone();
    let task = tokio::spawn(async move { runner.start().await });
    (tunnel, task)
}

pub async fn wait_for_subdomain(tunnel: &Tunnel, expected: &str) {
    let mut subdomain = tunnel.subdomain();
    tokio::time::timeout(WAIT, subdomain.wait_for(|s| s.as_deref() == Some(expected)))
        .await
        .expect("subdomain was never published")
        .unwrap();
}

pub async fn wait_for_streams(tunnel: &Tunnel, count: usize) {
    let mut streams = tunnel.active_streams();
    tokio::time::timeout(WAIT, streams.wait_for(|n| *n == count))
        .await
        .expect("stream count never reached the expected value")
        .unwrap();
}

pub async fn join(task: JoinHandle<Result<(), TunnelError>>) -> Result<(), TunnelError> {
    tokio::time::timeout(WAIT, task)
        .await
        .expect("tunnel did not stop")
        .unwrap()
}

pub fn data(id: StreamId, bytes: &'static [u8]) -> Frame {
    Frame::data(id, Bytes::from_static(bytes))
}
