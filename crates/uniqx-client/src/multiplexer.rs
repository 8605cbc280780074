//! Stream multiplexer
//!
//! Maps the relay's stream IDs to freshly dialed local connections. Each
//! stream gets two tasks: a pump (local read -> `data` frames) and a writer
//! (queued relay bytes -> local write). The reader of the relay connection
//! only ever pushes into a stream's unbounded queue, so a slow local service
//! never stalls the other streams; the queue is capped in bytes instead.

use crate::dialer::LocalDialer;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uniqx_proto::{CloseReason, Frame, StreamId};

/// Largest chunk read from a local connection into one `data` frame
const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Stream {0} is already open")]
    StreamAlreadyExists(StreamId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Local connection is being dialed; relay data is queued
    Dialing,
    Open,
}

/// Snapshot of one stream
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub stream_id: StreamId,
    pub phase: StreamPhase,
    pub bytes_to_local: u64,
    pub bytes_from_local: u64,
    /// Relay bytes queued but not yet written locally
    pub buffered: usize,
    pub local_read_closed: bool,
    pub local_write_closed: bool,
    pub age: Duration,
}

enum WriterCmd {
    Data(Bytes),
    /// Relay half-closed; shut down the local write half after the queue
    Finish,
}

#[derive(Clone, Copy)]
enum Direction {
    LocalRead,
    LocalWrite,
}

#[derive(Default)]
struct Counters {
    to_local: AtomicU64,
    from_local: AtomicU64,
    buffered: AtomicUsize,
}

struct StreamEntry {
    /// Distinguishes a reused stream ID from the stream it replaced
    generation: u64,
    phase: StreamPhase,
    queue: mpsc::UnboundedSender<WriterCmd>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    opened_at: Instant,
    local_read_closed: bool,
    local_write_closed: bool,
    relay_closed: bool,
}

impl StreamEntry {
    /// Both sides have already announced their close
    fn fully_announced(&self) -> bool {
        self.local_read_closed && self.relay_closed
    }
}

struct Shared {
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    dialer: LocalDialer,
    outbound: mpsc::Sender<Frame>,
    buffer_limit: usize,
    accepting: AtomicBool,
    next_generation: AtomicU64,
    stream_count: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
}

impl Shared {
    // Never held across an await.
    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, StreamEntry>> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_count(&self, count: usize) {
        self.stream_count.send_replace(count);
    }

    async fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    fn is_current(&self, id: StreamId, generation: u64) -> bool {
        self.streams()
            .get(&id)
            .map_or(false, |entry| entry.generation == generation)
    }

    fn mark_open(&self, id: StreamId, generation: u64) -> bool {
        match self.streams().get_mut(&id) {
            Some(entry) if entry.generation == generation => {
                entry.phase = StreamPhase::Open;
                true
            }
            _ => false,
        }
    }

    /// Remove a stream, optionally only if it is still the given generation
    fn take(&self, id: StreamId, generation: Option<u64>) -> Option<StreamEntry> {
        let mut streams = self.streams();
        let matches = streams
            .get(&id)
            .map_or(false, |entry| generation.map_or(true, |g| entry.generation == g));
        if !matches {
            return None;
        }
        let entry = streams.remove(&id);
        self.publish_count(streams.len());
        entry
    }

    /// Tear a stream down at once. With `notify`, the relay is told why
    /// unless both sides already closed.
    async fn reset(
        &self,
        id: StreamId,
        generation: Option<u64>,
        reason: CloseReason,
        detail: &str,
        notify: bool,
    ) {
        let Some(entry) = self.take(id, generation) else {
            return;
        };
        entry.cancel.cancel();
        debug!("Stream {} reset ({}): {}", id, reason, detail);

        if notify && !entry.fully_announced() {
            self.send(Frame::close(id, reason, detail)).await;
        }
    }

    /// Mark one direction finished; the stream is removed once both are
    fn finish(&self, id: StreamId, generation: u64, direction: Direction) {
        let mut streams = self.streams();
        let done = match streams.get_mut(&id) {
            Some(entry) if entry.generation == generation => {
                match direction {
                    Direction::LocalRead => entry.local_read_closed = true,
                    Direction::LocalWrite => entry.local_write_closed = true,
                }
                entry.local_read_closed && entry.local_write_closed
            }
            _ => false,
        };

        if done {
            if let Some(entry) = streams.remove(&id) {
                entry.cancel.cancel();
                debug!(
                    "Stream {} closed after {:?}: {} bytes to local, {} bytes from local",
                    id,
                    entry.opened_at.elapsed(),
                    entry.counters.to_local.load(Ordering::Relaxed),
                    entry.counters.from_local.load(Ordering::Relaxed)
                );
            }
            self.publish_count(streams.len());
        }
    }
}

/// Routes relay stream frames to local connections
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// `outbound` feeds the relay writer; `stream_count` is kept equal to
    /// the number of live streams. Stream tasks are children of `cancel`.
    pub fn new(
        dialer: LocalDialer,
        outbound: mpsc::Sender<Frame>,
        buffer_limit: usize,
        stream_count: Arc<watch::Sender<usize>>,
        cancel: CancellationToken,
    ) -> Self {
        stream_count.send_replace(0);
        Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(HashMap::new()),
                dialer,
                outbound,
                buffer_limit,
                accepting: AtomicBool::new(true),
                next_generation: AtomicU64::new(0),
                stream_count,
                cancel,
            }),
        }
    }

    /// Handle `open`. A duplicate ID is a protocol violation and is returned
    /// to the caller, even while draining; a dial failure is reported to the
    /// relay, never here.
    pub async fn on_open(&self, id: StreamId) -> Result<(), MuxError> {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (queue, commands) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let cancel = self.shared.cancel.child_token();

        let refused = {
            let mut streams = self.shared.streams();
            if streams.contains_key(&id) {
                return Err(MuxError::StreamAlreadyExists(id));
            }
            if self.shared.accepting.load(Ordering::Acquire) {
                streams.insert(
                    id,
                    StreamEntry {
                        generation,
                        phase: StreamPhase::Dialing,
                        queue,
                        counters: counters.clone(),
                        cancel: cancel.clone(),
                        opened_at: Instant::now(),
                        local_read_closed: false,
                        local_write_closed: false,
                        relay_closed: false,
                    },
                );
                self.shared.publish_count(streams.len());
                false
            } else {
                true
            }
        };

        if refused {
            debug!("Refusing stream {} while draining", id);
            self.shared
                .send(Frame::close(id, CloseReason::Shutdown, "tunnel is shutting down"))
                .await;
            return Ok(());
        }

        debug!("Stream {} opened, dialing {}", id, self.shared.dialer.addr());
        tokio::spawn(run_stream(
            self.shared.clone(),
            id,
            generation,
            commands,
            counters,
            cancel,
        ));
        Ok(())
    }

    /// Handle `data`. Unknown streams are ignored; a stream whose queue would
    /// exceed the buffer limit is reset with `close{overflow}`.
    pub async fn on_data(&self, id: StreamId, payload: Bytes) {
        let overflowed = {
            let streams = self.shared.streams();
            let Some(entry) = streams.get(&id) else {
                debug!("Dropping {} bytes for unknown stream {}", payload.len(), id);
                return;
            };
            if entry.relay_closed {
                debug!("Dropping data received after close on stream {}", id);
                return;
            }

            let len = payload.len();
            let queued = entry.counters.buffered.fetch_add(len, Ordering::AcqRel) + len;
            if queued > self.shared.buffer_limit {
                entry.counters.buffered.fetch_sub(len, Ordering::AcqRel);
                Some(entry.generation)
            } else {
                let _ = entry.queue.send(WriterCmd::Data(payload));
                None
            }
        };

        if let Some(generation) = overflowed {
            warn!(
                "Stream {} exceeded its {} byte buffer, resetting",
                id, self.shared.buffer_limit
            );
            self.shared
                .reset(
                    id,
                    Some(generation),
                    CloseReason::Overflow,
                    "stream buffer limit exceeded",
                    true,
                )
                .await;
        }
    }

    /// Handle `close`. A normal close is a half-close: queued bytes are still
    /// delivered before the local write half is shut down.
    pub async fn on_close(&self, id: StreamId, reason: CloseReason, detail: &str) {
        if !reason.is_normal() {
            debug!("Relay aborted stream {} ({}): {}", id, reason, detail);
            self.shared.reset(id, None, reason, detail, false).await;
            return;
        }

        let mut streams = self.shared.streams();
        match streams.get_mut(&id) {
            Some(entry) if !entry.relay_closed => {
                debug!("Relay finished sending on stream {}", id);
                entry.relay_closed = true;
                let _ = entry.queue.send(WriterCmd::Finish);
            }
            Some(_) => debug!("Duplicate close for stream {}", id),
            None => debug!("Close for unknown stream {}", id),
        }
    }

    /// Answer further `open` frames with `close{shutdown}`
    pub fn stop_accepting(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }

    pub fn active_streams(&self) -> usize {
        self.shared.streams().len()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.shared.streams().contains_key(&id)
    }

    pub fn stream_stats(&self, id: StreamId) -> Option<StreamStats> {
        self.shared.streams().get(&id).map(|entry| StreamStats {
            stream_id: id,
            phase: entry.phase,
            bytes_to_local: entry.counters.to_local.load(Ordering::Relaxed),
            bytes_from_local: entry.counters.from_local.load(Ordering::Relaxed),
            buffered: entry.counters.buffered.load(Ordering::Relaxed),
            local_read_closed: entry.local_read_closed,
            local_write_closed: entry.local_write_closed,
            age: entry.opened_at.elapsed(),
        })
    }

    /// Wait until no streams are left. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut count = self.shared.stream_count.subscribe();
        let idle = match tokio::time::timeout(timeout, count.wait_for(|n| *n == 0)).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        };
        idle
    }

    /// Reset every stream, telling the relay why
    pub async fn close_all(&self, reason: CloseReason, detail: &str) {
        let entries: Vec<(StreamId, StreamEntry)> = {
            let mut streams = self.shared.streams();
            let entries = streams.drain().collect();
            self.shared.publish_count(0);
            entries
        };

        for (id, entry) in entries {
            entry.cancel.cancel();
            if !entry.fully_announced() {
                self.shared.send(Frame::close(id, reason, detail)).await;
            }
        }
    }

    /// Force-close every stream and drop its local connection
    pub fn shutdown(&self) {
        self.stop_accepting();
        self.shared.cancel.cancel();

        let mut streams = self.shared.streams();
        let count = streams.len();
        for (_, entry) in streams.drain() {
            entry.cancel.cancel();
        }
        self.shared.publish_count(0);

        if count > 0 {
            debug!("Force-closed {} streams", count);
        }
    }
}

/// Dial the local service, then run the stream until it finishes
async fn run_stream(
    shared: Arc<Shared>,
    id: StreamId,
    generation: u64,
    commands: mpsc::UnboundedReceiver<WriterCmd>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let dialed = tokio::select! {
        _ = cancel.cancelled() => return,
        result = shared.dialer.dial() => result,
    };

    let stream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Stream {}: {}", id, e);
            shared
                .reset(
                    id,
                    Some(generation),
                    CloseReason::DialFailed,
                    &e.to_string(),
                    true,
                )
                .await;
            return;
        }
    };

    if !shared.mark_open(id, generation) {
        // Reset while dialing
        return;
    }
    debug!("Stream {} connected to {}", id, shared.dialer.addr());

    let (reader, writer) = stream.into_split();
    tokio::spawn(pump(
        shared.clone(),
        id,
        generation,
        reader,
        counters.clone(),
        cancel.clone(),
    ));
    write_local(shared, id, generation, writer, commands, counters, cancel).await;
}

/// Local read -> relay
async fn pump(
    shared: Arc<Shared>,
    id: StreamId,
    generation: u64,
    mut reader: OwnedReadHalf,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                if !shared.is_current(id, generation) {
                    return;
                }
                debug!("Local service finished sending on stream {}", id);
                // Out of the table before the relay can see the close and reuse the ID
                shared.finish(id, generation, Direction::LocalRead);
                shared.send(Frame::close(id, CloseReason::Normal, "")).await;
                return;
            }
            Ok(n) => {
                counters.from_local.fetch_add(n as u64, Ordering::Relaxed);
                let frame = Frame::data(id, Bytes::copy_from_slice(&buf[..n]));
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = shared.outbound.send(frame) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                debug!("Reading from local service failed on stream {}: {}", id, e);
                shared
                    .reset(id, Some(generation), CloseReason::LocalIo, &e.to_string(), true)
                    .await;
                return;
            }
        }
    }
}

/// Relay -> local write
async fn write_local(
    shared: Arc<Shared>,
    id: StreamId,
    generation: u64,
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriterCmd>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => return,
            command = commands.recv() => command,
        };

        match command {
            Some(WriterCmd::Data(bytes)) => {
                let len = bytes.len();
                let written = tokio::select! {
                    _ = cancel.cancelled() => return,
                    written = writer.write_all(&bytes) => written,
                };
                counters.buffered.fetch_sub(len, Ordering::AcqRel);

                if let Err(e) = written {
                    debug!("Writing to local service failed on stream {}: {}", id, e);
                    shared
                        .reset(id, Some(generation), CloseReason::LocalIo, &e.to_string(), true)
                        .await;
                    return;
                }
                counters.to_local.fetch_add(len as u64, Ordering::Relaxed);
            }
            Some(WriterCmd::Finish) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("Failed to half-close local stream {}: {}", id, e);
                }
                shared.finish(id, generation, Direction::LocalWrite);
                return;
            }
            // Entry removed
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use uniqx_proto::FrameKind;

    fn mux_for(addr: String, buffer_limit: usize) -> (Multiplexer, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        let count = Arc::new(watch::channel(0).0);
        let mux = Multiplexer::new(
            LocalDialer::new(addr, Duration::from_secs(1)),
            tx,
            buffer_limit,
            count,
            CancellationToken::new(),
        );
        (mux, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound channel closed")
    }

    async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
        let result = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(result.is_err(), "unexpected frame: {:?}", result);
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap()
            .0
    }

    async fn read_eof(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 64];
        matches!(
            tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, mut rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.on_open(1).await.unwrap();
        let mut local = accept(&listener).await;

        mux.on_data(1, Bytes::from_static(b"ping")).await;
        let mut buf = [0u8; 4];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        local.write_all(b"pong").await.unwrap();
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame, Frame::data(1, Bytes::from_static(b"pong")));

        // Relay half-close reaches the local service as EOF
        mux.on_close(1, CloseReason::Normal, "").await;
        assert!(read_eof(&mut local).await);
        assert!(mux.contains(1));

        drop(local);
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame, Frame::close(1, CloseReason::Normal, ""));

        assert!(mux.wait_idle(Duration::from_secs(1)).await);
        assert!(!mux.contains(1));
    }

    #[tokio::test]
    async fn test_duplicate_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, _rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.on_open(1).await.unwrap();
        let result = mux.on_open(1).await;
        assert!(matches!(result, Err(MuxError::StreamAlreadyExists(1))));
    }

    #[tokio::test]
    async fn test_dial_failure_sends_one_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let (mux, mut rx) = mux_for(addr, 1024);

        mux.on_open(3).await.unwrap();
        mux.on_data(3, Bytes::from_static(b"lost")).await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.kind, FrameKind::Close);
        assert_eq!(frame.stream_id, 3);
        assert!(matches!(
            frame.into_message().unwrap(),
            uniqx_proto::Message::Close {
                reason: CloseReason::DialFailed,
                ..
            }
        ));

        assert_no_frame(&mut rx).await;
        assert!(!mux.contains(3));
        assert_eq!(mux.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_data_queued_while_dialing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, _rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.on_open(1).await.unwrap();
        mux.on_data(1, Bytes::from_static(b"a")).await;
        mux.on_data(1, Bytes::from_static(b"b")).await;
        mux.on_data(1, Bytes::from_static(b"c")).await;

        let mut local = accept(&listener).await;
        let mut buf = [0u8; 3];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn test_overflow_resets_only_that_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, mut rx) = mux_for(listener.local_addr().unwrap().to_string(), 8);

        mux.on_open(1).await.unwrap();
        let mut first = accept(&listener).await;
        mux.on_open(2).await.unwrap();
        let mut second = accept(&listener).await;

        mux.on_data(1, Bytes::from(vec![0u8; 16])).await;
        let frame = next_frame(&mut rx).await;
        assert_eq!(
            frame,
            Frame::close(1, CloseReason::Overflow, "stream buffer limit exceeded")
        );
        assert!(!mux.contains(1));
        assert!(read_eof(&mut first).await);

        mux.on_data(2, Bytes::from_static(b"ok")).await;
        let mut buf = [0u8; 2];
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        assert!(mux.contains(2));
    }

    #[tokio::test]
    async fn test_unknown_stream_ignored() {
        let (mux, mut rx) = mux_for("127.0.0.1:9".to_string(), 1024);

        mux.on_data(9, Bytes::from_static(b"stray")).await;
        mux.on_close(9, CloseReason::Normal, "").await;
        mux.on_close(9, CloseReason::LocalIo, "gone").await;

        assert_no_frame(&mut rx).await;
    }

    #[tokio::test]
    async fn test_relay_abort_closes_local() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, mut rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.on_open(5).await.unwrap();
        let mut local = accept(&listener).await;

        mux.on_close(5, CloseReason::Other(9), "client went away").await;
        assert!(!mux.contains(5));
        assert!(read_eof(&mut local).await);
        // An aborted stream is not answered
        assert_no_frame(&mut rx).await;
    }

    #[tokio::test]
    async fn test_draining_refuses_new_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, mut rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.stop_accepting();
        mux.on_open(4).await.unwrap();

        let frame = next_frame(&mut rx).await;
        assert_eq!(
            frame,
            Frame::close(4, CloseReason::Shutdown, "tunnel is shutting down")
        );
        assert!(!mux.contains(4));
    }

    #[tokio::test]
    async fn test_duplicate_open_while_draining() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, mut rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.on_open(1).await.unwrap();
        let _local = accept(&listener).await;
        mux.stop_accepting();

        let result = mux.on_open(1).await;
        assert!(matches!(result, Err(MuxError::StreamAlreadyExists(1))));
        // The live stream is not refused as if it were new
        assert_no_frame(&mut rx).await;
        assert!(mux.contains(1));
    }

    #[tokio::test]
    async fn test_stream_removed_before_close_is_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, mut rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.on_open(2).await.unwrap();
        let mut local = accept(&listener).await;

        mux.on_close(2, CloseReason::Normal, "").await;
        assert!(read_eof(&mut local).await);
        drop(local);

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame, Frame::close(2, CloseReason::Normal, ""));
        // The relay may reuse the ID as soon as it sees the close
        assert!(!mux.contains(2));
        mux.on_open(2).await.unwrap();
        assert!(mux.contains(2));
    }

    #[tokio::test]
    async fn test_shutdown_closes_local_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, _rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.on_open(1).await.unwrap();
        let mut first = accept(&listener).await;
        mux.on_open(2).await.unwrap();
        let mut second = accept(&listener).await;
        assert_eq!(mux.active_streams(), 2);

        mux.shutdown();
        assert_eq!(mux.active_streams(), 0);
        assert!(read_eof(&mut first).await);
        assert!(read_eof(&mut second).await);
    }

    #[tokio::test]
    async fn test_stream_stats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mux, mut rx) = mux_for(listener.local_addr().unwrap().to_string(), 1024);

        mux.on_open(1).await.unwrap();
        let mut local = accept(&listener).await;

        mux.on_data(1, Bytes::from_static(b"hello")).await;
        let mut buf = [0u8; 5];
        local.read_exact(&mut buf).await.unwrap();
        local.write_all(b"hi").await.unwrap();
        next_frame(&mut rx).await;

        let stats = mux.stream_stats(1).unwrap();
        assert_eq!(stats.phase, StreamPhase::Open);
        assert_eq!(stats.bytes_to_local, 5);
        assert_eq!(stats.bytes_from_local, 2);
        assert_eq!(stats.buffered, 0);
        assert!(mux.stream_stats(2).is_none());
    }
}
