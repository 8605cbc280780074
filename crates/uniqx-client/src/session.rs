//! Control session: one relay connection from connect to close
//!
//! A session connects, registers, then runs three tasks until something ends
//! it: a reader that dispatches frames in wire order, a writer that owns the
//! relay write half, and a heartbeat. Nothing survives a session; the
//! supervisor builds a fresh one for every attempt.

use crate::config::TunnelConfig;
use crate::dialer::LocalDialer;
use crate::error::{RegistrationError, TunnelError};
use crate::multiplexer::Multiplexer;
use crate::status::{TunnelSignals, TunnelStatus};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uniqx_connection::connect_relay;
use uniqx_proto::{CloseReason, Frame, FrameCodec, Message, Protocol, RelayErrorCode};

/// Frames waiting for the relay writer
const OUTBOUND_QUEUE: usize = 256;

/// Frames are coalesced into writes of up to this many bytes
const WRITE_BATCH_SIZE: usize = 64 * 1024;

/// Time the writer gets to flush queued frames at teardown
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8 * 1024;

type TaskHandle = JoinHandle<Result<(), TunnelError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registering,
    Active,
    /// Explicit shutdown; no new streams, waiting for in-flight ones
    Draining,
    Closed,
}

/// What the supervisor learns when a session ends
#[derive(Debug)]
pub struct SessionReport {
    /// `Ok` after an explicit shutdown, otherwise what ended the session
    pub outcome: Result<(), TunnelError>,
    /// Subdomain the relay confirmed, if registration succeeded
    pub subdomain: Option<String>,
    /// Public port the relay confirmed for a TCP tunnel
    pub remote_port: Option<u16>,
    /// Time spent registered
    pub active_for: Option<Duration>,
}

pub struct ControlSession {
    config: Arc<TunnelConfig>,
    requested: Option<String>,
    requested_port: Option<u16>,
    signals: Arc<TunnelSignals>,
}

/// What the relay confirmed in `registered`
struct Confirmed {
    subdomain: String,
    remote_port: Option<u16>,
}

impl ControlSession {
    pub fn new(
        config: Arc<TunnelConfig>,
        requested: Option<String>,
        signals: Arc<TunnelSignals>,
    ) -> Self {
        Self {
            requested_port: config.remote_port,
            config,
            requested,
            signals,
        }
    }

    /// Ask for this public port instead of the configured one
    pub fn with_remote_port(mut self, port: Option<u16>) -> Self {
        self.requested_port = port;
        self
    }

    pub fn requested(&self) -> Option<&str> {
        self.requested.as_deref()
    }

    /// Run the session to completion. Cancelling `shutdown` drains an active
    /// session and abandons one that is still connecting or registering.
    pub async fn run(self, shutdown: CancellationToken) -> SessionReport {
        let mut report = SessionReport {
            outcome: Ok(()),
            subdomain: None,
            remote_port: None,
            active_for: None,
        };

        report.outcome = self.drive(&shutdown, &mut report).await;

        self.signals.subdomain.send_replace(None);
        self.signals.remote_port.send_replace(None);
        self.set_state(SessionState::Closed);
        match &report.outcome {
            Ok(()) => debug!("Session closed"),
            Err(e) => debug!("Session closed: {}", e),
        }
        report
    }

    fn set_state(&self, state: SessionState) {
        self.signals.session.send_replace(state);
    }

    async fn drive(
        &self,
        shutdown: &CancellationToken,
        report: &mut SessionReport,
    ) -> Result<(), TunnelError> {
        let relay = self.config.relay_addr()?;

        self.set_state(SessionState::Connecting);
        info!("Connecting to relay at {}", relay);
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return Err(TunnelError::Cancelled),
            result = connect_relay(&relay, self.config.timeouts.connect) => result?,
        };
        debug!("Connected to relay at {}", relay);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, self.config.timeouts.read_idle);

        self.set_state(SessionState::Registering);
        let register_timeout = self.config.timeouts.register;
        let confirmed = tokio::select! {
            _ = shutdown.cancelled() => return Err(TunnelError::Cancelled),
            result = tokio::time::timeout(register_timeout, self.register(&mut reader, &mut write_half)) => {
                match result {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(TunnelError::Transport(format!(
                            "relay did not confirm registration within {:?}",
                            register_timeout
                        )))
                    }
                }
            }
        };

        let Confirmed {
            subdomain,
            remote_port,
        } = confirmed;
        let active_since = Instant::now();
        report.subdomain = Some(subdomain.clone());
        report.remote_port = remote_port;
        // Port first, so a subdomain watcher always sees a complete endpoint
        self.signals.remote_port.send_replace(remote_port);
        self.signals.subdomain.send_replace(Some(subdomain.clone()));
        self.signals.set_status(TunnelStatus::Online {
            subdomain: subdomain.clone(),
        });
        self.set_state(SessionState::Active);
        match remote_port {
            Some(port) => info!("Tunnel registered as '{}' on port {}", subdomain, port),
            None => info!("Tunnel registered as '{}'", subdomain),
        }

        let outcome = self.serve(reader, write_half, shutdown).await;
        report.active_for = Some(active_since.elapsed());
        outcome
    }

    async fn register<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut W,
    ) -> Result<Confirmed, TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let protocol = self.config.protocol;
        let requested = self.requested.as_deref().unwrap_or("");
        if requested.is_empty() {
            debug!("Registering {} tunnel with a relay-assigned subdomain", protocol);
        } else {
            debug!("Registering {} tunnel for subdomain '{}'", protocol, requested);
        }
        let register = Frame::register(protocol, self.requested_port, requested);
        writer.write_all(&register.encode()?).await?;

        loop {
            let frame = reader.next_frame().await?.ok_or_else(|| {
                TunnelError::Transport("relay closed the connection during registration".to_string())
            })?;

            match frame.into_message()? {
                Message::Registered {
                    subdomain,
                    remote_port,
                } => return confirm(protocol, subdomain, remote_port),
                Message::Error { code, message } => {
                    return Err(RegistrationError::from_relay(code, message, self.requested()).into())
                }
                Message::Ping { payload } => {
                    writer.write_all(&Frame::pong(payload).encode()?).await?;
                }
                Message::Pong { .. } => {}
                other => {
                    return Err(TunnelError::Protocol(format!(
                        "unexpected {:?} before registration completed",
                        other
                    )))
                }
            }
        }
    }

    async fn serve<R, W>(
        &self,
        reader: FrameReader<R>,
        writer: W,
        shutdown: &CancellationToken,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let teardown = CancellationToken::new();
        let (outbound, frames) = mpsc::channel(OUTBOUND_QUEUE);
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();

        let mux = Multiplexer::new(
            LocalDialer::from_config(&self.config),
            outbound.clone(),
            self.config.stream_buffer_limit,
            self.signals.streams.clone(),
            teardown.child_token(),
        );

        let mut writer_task = tokio::spawn(write_frames(writer, frames, teardown.clone()));
        let mut reader_task = tokio::spawn(read_frames(
            reader,
            mux.clone(),
            outbound.clone(),
            pong_tx,
        ));
        let mut heartbeat_task = tokio::spawn(heartbeat(
            outbound,
            pong_rx,
            self.config.timeouts.ping_interval,
            self.config.timeouts.pong_timeout,
            teardown.clone(),
        ));

        let outcome = tokio::select! {
            result = &mut reader_task => flatten(result),
            result = &mut writer_task => flatten(result),
            result = &mut heartbeat_task => flatten(result),
            _ = shutdown.cancelled() => {
                self.drain(&mux, &mut reader_task, &mut writer_task, &mut heartbeat_task).await;
                Ok(())
            }
        };

        if let Err(e) = &outcome {
            warn!("Relay session lost: {}", e);
        }

        // Orphaned streams go first so their local connections close promptly.
        mux.shutdown();
        reader_task.abort();
        heartbeat_task.abort();
        teardown.cancel();
        if !writer_task.is_finished()
            && tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task)
                .await
                .is_err()
        {
            debug!("Relay writer did not flush within {:?}", FLUSH_TIMEOUT);
        }
        writer_task.abort();

        outcome
    }

    async fn drain(
        &self,
        mux: &Multiplexer,
        reader_task: &mut TaskHandle,
        writer_task: &mut TaskHandle,
        heartbeat_task: &mut TaskHandle,
    ) {
        mux.stop_accepting();
        self.set_state(SessionState::Draining);

        let drain_timeout = self.config.timeouts.drain;
        info!(
            "Draining {} active streams (up to {:?})",
            mux.active_streams(),
            drain_timeout
        );

        let ended = tokio::select! {
            idle = mux.wait_idle(drain_timeout) => {
                if !idle {
                    warn!(
                        "{} streams still open after {:?}, closing them",
                        mux.active_streams(),
                        drain_timeout
                    );
                    mux.close_all(CloseReason::Shutdown, "tunnel is shutting down").await;
                }
                return;
            }
            result = &mut *reader_task => flatten(result),
            result = &mut *writer_task => flatten(result),
            result = &mut *heartbeat_task => flatten(result),
        };

        if let Err(e) = ended {
            debug!("Relay connection ended while draining: {}", e);
        }
    }
}

/// Check a `registered` reply against the kind of tunnel asked for
fn confirm(
    protocol: Protocol,
    subdomain: String,
    remote_port: Option<u16>,
) -> Result<Confirmed, TunnelError> {
    if subdomain.is_empty() {
        return Err(TunnelError::Protocol(
            "relay confirmed an empty subdomain".to_string(),
        ));
    }
    let remote_port = match (protocol, remote_port) {
        (Protocol::Tcp, None) => {
            return Err(TunnelError::Protocol(
                "relay confirmed a tcp tunnel without a port".to_string(),
            ))
        }
        (Protocol::Tcp, port) => port,
        (Protocol::Http, _) => None,
    };
    Ok(Confirmed {
        subdomain,
        remote_port,
    })
}

fn flatten(result: Result<Result<(), TunnelError>, JoinError>) -> Result<(), TunnelError> {
    match result {
        Ok(result) => result,
        Err(e) => Err(TunnelError::Transport(format!("session task failed: {}", e))),
    }
}

/// Map an `error` frame received on an active session
fn relay_error(code: RelayErrorCode, message: String) -> TunnelError {
    match code {
        RelayErrorCode::QuotaExceeded => RegistrationError::QuotaExceeded(message).into(),
        RelayErrorCode::Unauthorized => RegistrationError::Unauthorized(message).into(),
        other => TunnelError::Transport(format!("relay ended the session ({}): {}", other, message)),
    }
}

/// Decodes frames from the relay, enforcing the read-idle timeout
struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    idle_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R, idle_timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            idle_timeout,
        }
    }

    /// Next complete frame; `None` on a clean EOF between frames
    async fn next_frame(&mut self) -> Result<Option<Frame>, TunnelError> {
        loop {
            if let Some(frame) = FrameCodec::decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            self.buf.reserve(READ_BUFFER_SIZE);
            let read = tokio::time::timeout(self.idle_timeout, self.inner.read_buf(&mut self.buf))
                .await
                .map_err(|_| {
                    TunnelError::Transport(format!(
                        "no data from relay for {:?}",
                        self.idle_timeout
                    ))
                })??;

            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TunnelError::Transport(
                    "relay closed the connection mid-frame".to_string(),
                ));
            }
        }
    }
}

/// Decode relay frames and dispatch them in wire order
async fn read_frames<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    mux: Multiplexer,
    outbound: mpsc::Sender<Frame>,
    pongs: mpsc::UnboundedSender<Bytes>,
) -> Result<(), TunnelError> {
    loop {
        let frame = reader
            .next_frame()
            .await?
            .ok_or_else(|| TunnelError::Transport("relay closed the connection".to_string()))?;

        match frame.into_message()? {
            Message::Open { stream_id } => mux
                .on_open(stream_id)
                .await
                .map_err(|e| TunnelError::Protocol(e.to_string()))?,
            Message::Data { stream_id, payload } => mux.on_data(stream_id, payload).await,
            Message::Close {
                stream_id,
                reason,
                detail,
            } => mux.on_close(stream_id, reason, &detail).await,
            Message::Ping { payload } => {
                if outbound.send(Frame::pong(payload)).await.is_err() {
                    return Err(TunnelError::Transport("relay writer stopped".to_string()));
                }
            }
            Message::Pong { payload } => {
                let _ = pongs.send(payload);
            }
            Message::Error { code, message } => return Err(relay_error(code, message)),
            Message::Register { .. } | Message::Registered { .. } => {
                return Err(TunnelError::Protocol(
                    "registration frame on an active session".to_string(),
                ))
            }
        }
    }
}

/// Sole owner of the relay write half. Returns `Ok` only after `cancel`,
/// once every frame already queued has been written.
async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let mut buf = BytesMut::with_capacity(WRITE_BATCH_SIZE);

    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => frame,
            _ = cancel.cancelled() => break,
        };
        let Some(frame) = frame else {
            return Err(TunnelError::Transport("relay writer queue closed".to_string()));
        };

        frame.encode_into(&mut buf)?;
        while buf.len() < WRITE_BATCH_SIZE {
            match frames.try_recv() {
                Ok(frame) => frame.encode_into(&mut buf)?,
                Err(_) => break,
            }
        }

        writer.write_all(&buf).await?;
        buf.clear();
    }

    while let Ok(frame) = frames.try_recv() {
        frame.encode_into(&mut buf)?;
    }
    if !buf.is_empty() {
        writer.write_all(&buf).await?;
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Failed to shut down relay write half: {}", e);
    }

    Ok(())
}

/// Ping the relay every `interval`; fail if a ping goes unanswered for
/// `pong_timeout`. The payload is a big-endian sequence number.
async fn heartbeat(
    outbound: mpsc::Sender<Frame>,
    mut pongs: mpsc::UnboundedReceiver<Bytes>,
    interval: Duration,
    pong_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sequence: u64 = 0;
    let mut awaiting: Option<(u64, Instant)> = None;

    loop {
        let deadline = awaiting.map(|(_, sent)| sent + pong_timeout);

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                if awaiting.is_some() {
                    continue;
                }
                sequence += 1;
                let ping = Frame::ping(Bytes::copy_from_slice(&sequence.to_be_bytes()));
                if outbound.send(ping).await.is_err() {
                    return Err(TunnelError::Transport("relay writer stopped".to_string()));
                }
                awaiting = Some((sequence, Instant::now()));
            }
            Some(payload) = pongs.recv() => {
                if let Some((expected, sent)) = awaiting {
                    if payload[..] == expected.to_be_bytes()[..] {
                        debug!("Relay round trip {:?}", sent.elapsed());
                        awaiting = None;
                    }
                }
            }
            _ = sleep_until(deadline) => {
                return Err(TunnelError::Transport(format!(
                    "relay did not answer ping within {:?}",
                    pong_timeout
                )));
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
