//! Hub server
//!
//! Binds the link socket and relays frames between connected processes.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::frame::{decode_frame, write_frame};
use super::get_socket_path;

/// Frames buffered per client before a slow reader starts losing them
const RELAY_CAPACITY: usize = 1024;

type Relay = broadcast::Sender<(u64, Arc<str>)>;

/// Create and bind the hub socket at the default path
pub fn create_listener() -> Result<(UnixListener, PathBuf)> {
    create_listener_at(&get_socket_path())
}

/// Create the hub socket at `socket_path`
///
/// Creates the parent directory and removes a stale socket file left by an
/// earlier run.
pub fn create_listener_at(socket_path: &PathBuf) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener_at: creating hub socket");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind hub socket")?;
    info!(?socket_path, "create_listener_at: hub socket bound");

    Ok((listener, socket_path.clone()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &PathBuf) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Accept clients and relay frames until `shutdown` completes
pub async fn serve(listener: UnixListener, shutdown: impl Future<Output = ()>) -> Result<()> {
    let (relay, _) = broadcast::channel(RELAY_CAPACITY);
    let mut next_id: u64 = 0;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(clients = relay.receiver_count(), "serve: shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("Failed to accept hub client")?;
                next_id += 1;
                debug!(client = next_id, "serve: client connected");
                tokio::spawn(client_session(next_id, stream, relay.clone()));
            }
        }
    }
}

async fn client_session(id: u64, stream: UnixStream, relay: Relay) {
    let mut inbound = relay.subscribe();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match decode_frame(&line) {
                    Ok(Some(event)) => {
                        debug!(client = id, name = ?event.name(), "client_session: relaying frame");
                        // no other clients is not an error
                        let _ = relay.send((id, Arc::from(line.trim_end())));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(client = id, error = %e, "client_session: invalid frame skipped"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(client = id, error = %e, "client_session: read failed");
                    break;
                }
            },
            relayed = inbound.recv() => match relayed {
                Ok((from, frame)) if from != id => {
                    if let Err(e) = write_frame(&mut write, &frame).await {
                        warn!(client = id, error = %e, "client_session: write failed");
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(client = id, missed, "client_session: slow client lost frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!(client = id, "client_session: disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_create_listener_creates_parent_dir() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("subdir").join("eddi.sock");

        let (_, path) = create_listener_at(&socket_path).unwrap();
        assert_eq!(path, socket_path);
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_create_listener_removes_stale_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("eddi.sock");
        std::fs::write(&socket_path, "stale").unwrap();

        assert!(create_listener_at(&socket_path).is_ok());
    }

    #[test]
    fn test_cleanup_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("eddi.sock");
        std::fs::write(&socket_path, "test").unwrap();

        cleanup_socket(&socket_path);
        assert!(!socket_path.exists());
        // a missing file is fine
        cleanup_socket(&socket_path);
    }

    async fn read_line(lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .ok()?
            .ok()?
    }

    #[tokio::test]
    async fn test_relays_valid_frames_to_others() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("hub.sock");
        let (listener, _) = create_listener_at(&socket_path).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let hub = tokio::spawn(serve(listener, async {
            let _ = stop_rx.await;
        }));

        let a = UnixStream::connect(&socket_path).await.unwrap();
        let b = UnixStream::connect(&socket_path).await.unwrap();
        let (a_read, mut a_write) = a.into_split();
        let (b_read, _b_write) = b.into_split();
        let mut a_lines = BufReader::new(a_read).lines();
        let mut b_lines = BufReader::new(b_read).lines();

        // both sessions must be subscribed before anything is relayed
        tokio::time::sleep(Duration::from_millis(50)).await;

        a_write.write_all(b"garbage\n* ping:&i1::{}\n").await.unwrap();
        a_write.flush().await.unwrap();

        assert_eq!(read_line(&mut b_lines).await.as_deref(), Some("* ping:&i1::{}"));
        // the sender does not hear its own frame
        assert!(
            tokio::time::timeout(Duration::from_millis(100), a_lines.next_line())
                .await
                .is_err()
        );

        stop_tx.send(()).unwrap();
        hub.await.unwrap().unwrap();
    }
}
