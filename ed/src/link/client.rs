//! Link client
//!
//! Runs on its own OS thread with a current-thread runtime so the rest of
//! the daemon stays free of async.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::frame::{decode_frame, write_frame};
use crate::config::LinkConfig;
use crate::dispatch::IN_BOX;
use crate::evbox::{BoxList, ThreadKey};
use crate::pool::EventPool;
use crate::sync::{lock, wait_until};

/// Default timeout for one-shot connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Counts {
    queued: u64,
    sent: u64,
}

#[derive(Default)]
struct Progress {
    counts: Mutex<Counts>,
    sent: Condvar,
    connected: AtomicBool,
}

impl Progress {
    fn mark_sent(&self) {
        lock(&self.counts).sent += 1;
        self.sent.notify_all();
    }
}

/// Connection from this process to the hub
pub struct Link {
    config: LinkConfig,
    inbox: Arc<BoxList>,
    pool: EventPool,
    key: ThreadKey,
}

impl Link {
    /// Inbound frames land in `inbox`'s `in` box
    pub fn new(config: &LinkConfig, inbox: Arc<BoxList>, pool: EventPool) -> Self {
        Self {
            config: config.clone(),
            inbox,
            pool,
            key: ThreadKey::fresh(),
        }
    }

    pub fn spawn(self) -> Result<LinkHandle> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build link runtime")?;
        let (tx, rx) = mpsc::channel(self.config.queue_size.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let progress = Arc::new(Progress::default());

        let shared = Arc::clone(&progress);
        let thread = thread::Builder::new()
            .name("eddi-link".to_string())
            .spawn(move || runtime.block_on(self.run(rx, stop_rx, shared)))
            .context("Failed to spawn link thread")?;

        Ok(LinkHandle {
            inner: Arc::new(HandleInner {
                tx,
                progress,
                stop: stop_tx,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    async fn run(self, mut rx: mpsc::Receiver<String>, mut stop: watch::Receiver<bool>, progress: Arc<Progress>) {
        let socket = self.config.socket_path();
        info!(?socket, key = %self.key, "Link::run: starting");
        let mut carry: Option<String> = None;

        loop {
            if *stop.borrow() {
                break;
            }
            match UnixStream::connect(&socket).await {
                Ok(stream) => {
                    info!(?socket, "Link::run: connected to hub");
                    progress.connected.store(true, Ordering::Release);
                    let stopped = self.session(stream, &mut rx, &mut stop, &progress, &mut carry).await;
                    progress.connected.store(false, Ordering::Release);
                    if stopped {
                        break;
                    }
                }
                Err(e) => debug!(?socket, error = %e, "Link::run: hub unreachable"),
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(self.config.reconnect()) => {}
            }
        }
        info!("Link::run: stopped");
    }

    /// Pump frames until the connection drops; true when asked to stop
    async fn session(
        &self,
        stream: UnixStream,
        rx: &mut mpsc::Receiver<String>,
        stop: &mut watch::Receiver<bool>,
        progress: &Progress,
        carry: &mut Option<String>,
    ) -> bool {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        if let Some(frame) = carry.take()
            && !send(&mut write, frame, progress, carry).await
        {
            return false;
        }

        loop {
            tokio::select! {
                _ = stop.changed() => return true,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if !send(&mut write, frame, progress, carry).await {
                            return false;
                        }
                    }
                    // every handle is gone
                    None => return true,
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.receive(&line),
                    Ok(None) => {
                        info!("Link::session: hub closed the connection");
                        return false;
                    }
                    Err(e) => {
                        warn!(error = %e, "Link::session: read failed");
                        return false;
                    }
                },
            }
        }
    }

    fn receive(&self, line: &str) {
        match decode_frame(line) {
            Ok(Some(event)) => {
                debug!(name = ?event.name(), "Link::receive: frame received");
                let result = self
                    .pool
                    .adopt(event)
                    .and_then(|ev| self.inbox.insert(ev, IN_BOX, self.key).map_err(Into::into));
                if let Err(e) = result {
                    warn!(error = %e, "Link::receive: inbound event dropped");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Link::receive: invalid frame skipped"),
        }
    }
}

/// Write one frame; on failure it is kept in `carry` for the next connection
async fn send(write: &mut OwnedWriteHalf, frame: String, progress: &Progress, carry: &mut Option<String>) -> bool {
    match write_frame(write, &frame).await {
        Ok(()) => {
            progress.mark_sent();
            true
        }
        Err(e) => {
            warn!(error = %e, "Link::send: write failed, will retry after reconnect");
            *carry = Some(frame);
            false
        }
    }
}

struct HandleInner {
    tx: mpsc::Sender<String>,
    progress: Arc<Progress>,
    stop: watch::Sender<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HandleInner {
    fn shutdown(&self) {
        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        debug!("LinkHandle::shutdown: stopping link");
        // the receiver is gone once the thread has exited
        let _ = self.stop.send(true);
        if thread.join().is_err() {
            warn!("LinkHandle::shutdown: link thread panicked");
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a running [`Link`]; the link stops when the last clone drops
#[derive(Clone)]
pub struct LinkHandle {
    inner: Arc<HandleInner>,
}

impl LinkHandle {
    /// Queue a frame for sending; the frame comes back if the queue is full
    pub fn queue(&self, frame: String) -> std::result::Result<(), String> {
        lock(&self.inner.progress.counts).queued += 1;
        match self.inner.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame) | mpsc::error::TrySendError::Closed(frame)) => {
                lock(&self.inner.progress.counts).queued -= 1;
                Err(frame)
            }
        }
    }

    /// Wait until every queued frame has been written to the hub
    pub fn wait_for_sent(&self, timeout: Duration) -> bool {
        let progress = &self.inner.progress;
        wait_until(&progress.sent, lock(&progress.counts), timeout, |c| c.sent >= c.queued)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.progress.connected.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

/// Connect, write `frames` and close
pub async fn send_once(socket: &Path, frames: &[String]) -> Result<()> {
    debug!(?socket, count = frames.len(), "send_once: called");

    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket))
        .await
        .context("Connection timeout")?
        .context("Failed to connect to hub socket")?;

    for frame in frames {
        write_frame(&mut stream, frame).await?;
    }
    stream.shutdown().await.context("Failed to close hub connection")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoxConfig, PoolConfig};
    use crate::evbox::BoxRegistry;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn inbox() -> (Arc<BoxList>, EventPool) {
        let pool = EventPool::new(&PoolConfig {
            size: Some(16),
            grow: true,
        });
        let registry = BoxRegistry::new(&BoxConfig::default(), pool.clone());
        let inbox = registry.register(ThreadKey::fresh());
        inbox.open_box(IN_BOX);
        (inbox, pool)
    }

    fn link_config(socket: &Path, queue_size: usize) -> LinkConfig {
        LinkConfig {
            enabled: true,
            socket: Some(socket.to_path_buf()),
            reconnect_ms: 20,
            queue_size,
        }
    }

    #[test]
    fn test_queue_full_hands_frame_back() {
        let temp = TempDir::new().unwrap();
        let (inbox, pool) = inbox();
        let handle = Link::new(&link_config(&temp.path().join("missing.sock"), 1), inbox, pool)
            .spawn()
            .unwrap();

        assert!(handle.queue("* a::{}".to_string()).is_ok());
        assert_eq!(handle.queue("* b::{}".to_string()), Err("* b::{}".to_string()));
        assert!(!handle.is_connected());
        assert!(!handle.wait_for_sent(Duration::from_millis(20)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("hub.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (inbox, pool) = inbox();
        let handle = Link::new(&link_config(&socket, 8), Arc::clone(&inbox), pool).spawn().unwrap();

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        handle.queue("* ping:&i1::{}".to_string()).unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("* ping:&i1::{}"));
        assert!(handle.wait_for_sent(Duration::from_secs(5)));

        write.write_all(b"junk\n* pong:&i2::{}\n").await.unwrap();
        write.flush().await.unwrap();

        assert!(inbox.wait(IN_BOX, Duration::from_secs(5)));
        let envelope = inbox.pop_envelope(IN_BOX).unwrap();
        assert_eq!(envelope.event.name(), Some("pong"));
        assert!(inbox.pop(IN_BOX).is_none());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_send_once_to_missing_socket_fails() {
        let temp = TempDir::new().unwrap();
        let err = send_once(&temp.path().join("none.sock"), &["* x::{}".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to connect"));
    }
}
