//! Accepted local TCP sockets.
//!
//! A [`LocalSocket`] splits its stream between a reader task and a writer
//! task that report [`LocalEvent`]s to a listener. The engine never awaits
//! socket I/O:
//!
//! - `write` queues bytes and reports whether the backlog is still under the
//!   high-water mark; the writer reports `Drain` once it empties again.
//! - the reader posts one chunk at a time and waits for [`LocalSocket::read_done`]
//!   before reading on, so a `pause` issued while handling a chunk holds
//!   back the next one.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// Backlog size above which `write` reports "not flushed".
pub const WRITE_HIGH_WATER_MARK: usize = 16 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// What a local socket reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Data(Vec<u8>),
    /// The write backlog emptied after a write reported "not flushed".
    Drain,
    /// The peer finished sending.
    End,
    Error(String),
    /// The socket is gone. Reported exactly once.
    Closed,
}

pub type LocalListener = Arc<dyn Fn(LocalEvent) + Send + Sync>;

/// Shared between the handle and its tasks.
struct Inner {
    listener: LocalListener,
    closed: AtomicBool,
    pending: AtomicUsize,
    needs_drain: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    ack: Notify,
}

impl Inner {
    fn post(&self, event: LocalEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            (self.listener)(event);
        }
    }

    fn post_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            (self.listener)(LocalEvent::Closed);
        }
    }
}

pub struct LocalSocket {
    inner: Arc<Inner>,
    write_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    paused: watch::Sender<bool>,
    /// A chunk that arrived after `pause`; handed back by `resume`.
    held: Option<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LocalSocket {
    pub fn new(stream: TcpStream, listener: LocalListener) -> Self {
        let inner = Arc::new(Inner {
            listener,
            closed: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            needs_drain: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            ack: Notify::new(),
        });

        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (paused, paused_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(read_half, paused_rx, inner.clone()));
        let writer = tokio::spawn(write_loop(write_half, write_rx, inner.clone()));

        Self {
            inner,
            write_tx: Some(write_tx),
            paused,
            held: None,
            reader,
            writer,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Queue bytes for the peer. Returns `false` when the backlog reached the
    /// high-water mark; a `Drain` event follows once it is flushed.
    pub fn write(&mut self, data: &[u8]) -> bool {
        let Some(tx) = &self.write_tx else {
            return false;
        };
        let backlog = self.inner.pending.fetch_add(data.len(), Ordering::SeqCst) + data.len();
        let flushed = backlog < WRITE_HIGH_WATER_MARK;
        if !flushed {
            self.inner.needs_drain.store(true, Ordering::SeqCst);
        }
        if tx.send(data.to_vec()).is_err() {
            self.inner.pending.fetch_sub(data.len(), Ordering::SeqCst);
        }
        flushed
    }

    /// Acknowledge the last `Data` chunk so the reader fetches the next one.
    pub fn read_done(&self) {
        self.inner.ack.notify_one();
    }

    pub fn pause(&mut self) {
        self.paused.send_replace(true);
    }

    /// Resume reading. Returns a chunk held back while paused; the caller
    /// processes it like a fresh `Data` event (including `read_done`).
    pub fn resume(&mut self) -> Option<Vec<u8>> {
        self.paused.send_replace(false);
        self.held.take()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Filter an incoming chunk: while paused it is held back and `None`
    /// is returned.
    pub fn admit(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        if self.is_paused() {
            match &mut self.held {
                Some(held) => held.extend_from_slice(&chunk),
                None => self.held = Some(chunk),
            }
            None
        } else {
            Some(chunk)
        }
    }

    /// Flush queued writes, then close the write side and the socket.
    pub fn end(&mut self) {
        self.write_tx = None;
    }

    /// Tear the socket down now, dropping unsent data.
    pub fn destroy(&mut self) {
        self.write_tx = None;
        self.reader.abort();
        self.writer.abort();
        self.inner.post_closed();
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::SeqCst)
    }
}

impl Drop for LocalSocket {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(mut half: OwnedReadHalf, mut paused: watch::Receiver<bool>, inner: Arc<Inner>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if paused.wait_for(|p| !*p).await.is_err() {
            return;
        }
        match half.read(&mut buf).await {
            Ok(0) => {
                inner.post(LocalEvent::End);
                return;
            }
            Ok(n) => {
                inner.bytes_read.fetch_add(n as u64, Ordering::SeqCst);
                inner.post(LocalEvent::Data(buf[..n].to_vec()));
                inner.ack.notified().await;
            }
            Err(e) => {
                inner.post(LocalEvent::Error(e.to_string()));
                inner.post_closed();
                return;
            }
        }
    }
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    inner: Arc<Inner>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = half.write_all(&chunk).await {
            inner.post(LocalEvent::Error(e.to_string()));
            inner.post_closed();
            return;
        }
        inner
            .bytes_written
            .fetch_add(chunk.len() as u64, Ordering::SeqCst);
        let left = inner.pending.fetch_sub(chunk.len(), Ordering::SeqCst) - chunk.len();
        if left == 0 && inner.needs_drain.swap(false, Ordering::SeqCst) {
            inner.post(LocalEvent::Drain);
        }
    }

    // All senders gone: `end` or `destroy`.
    let _ = half.shutdown().await;
    inner.post_closed();
}
