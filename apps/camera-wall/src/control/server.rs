use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::command::CommandError;
use super::dispatcher::{CommandDispatcher, DispatchOutcome};
use crate::engine::MediaEngine;
use crate::Result;

/// Local control socket speaking newline-delimited JSON.
pub struct ControlServer<E: MediaEngine> {
    path: PathBuf,
    listener: UnixListener,
    dispatcher: CommandDispatcher<E>,
}

impl<E: MediaEngine> ControlServer<E> {
    /// Bind at `path`, replacing a stale socket left by an earlier instance.
    pub fn bind(path: &Path, dispatcher: CommandDispatcher<E>) -> Result<Self> {
        remove_stale_socket(path)?;
        let listener = UnixListener::bind(path)?;
        info!("Control server listening on {:?}", path);

        Ok(Self {
            path: path.to_path_buf(),
            listener,
            dispatcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` resolves. Open connections are
    /// dropped when it does.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Control server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("Control client connected");
                        let dispatcher = self.dispatcher.clone();
                        connections.spawn(serve_connection(stream, dispatcher));
                    }
                    Err(e) => {
                        error!("Control server accept failed: {}", e);
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Control connection task failed: {}", e);
                    }
                }
            }
        }

        connections.shutdown().await;
        Ok(())
    }
}

impl<E: MediaEngine> Drop for ControlServer<E> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove control socket {:?}: {}", self.path, e);
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("Removed stale control socket {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Longest record a client may send, newline excluded.
const MAX_RECORD_LEN: usize = 64 * 1024;

enum Record {
    Line,
    Oversized,
    Closed,
}

/// Read one newline-terminated record into `buf`. Longer records are
/// consumed up to their newline and reported as [`Record::Oversized`].
async fn read_record<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Record>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(MAX_RECORD_LEN as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(Record::Closed);
    }
    if read <= MAX_RECORD_LEN || buf.last() == Some(&b'\n') {
        return Ok(Record::Line);
    }

    loop {
        buf.clear();
        let skipped = (&mut *reader)
            .take(MAX_RECORD_LEN as u64)
            .read_until(b'\n', buf)
            .await?;
        if skipped == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(Record::Oversized)
}

/// Read records from one client and apply them in arrival order.
async fn serve_connection<E: MediaEngine>(stream: UnixStream, dispatcher: CommandDispatcher<E>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        let outcome = match read_record(&mut reader, &mut buf).await {
            Ok(Record::Line) => match std::str::from_utf8(&buf) {
                Ok(line) => dispatcher.dispatch_line(line).await,
                Err(e) => DispatchOutcome::Ignored(
                    CommandError::Malformed(format!("not UTF-8: {}", e)).to_string(),
                ),
            },
            Ok(Record::Oversized) => DispatchOutcome::Ignored(
                CommandError::Malformed(format!("longer than {} bytes", MAX_RECORD_LEN))
                    .to_string(),
            ),
            Ok(Record::Closed) => {
                debug!("Control client disconnected");
                break;
            }
            Err(e) => {
                warn!("Control connection read failed: {}", e);
                break;
            }
        };

        match outcome {
            DispatchOutcome::Applied => {}
            DispatchOutcome::Ignored(reason) => debug!("Control record ignored: {}", reason),
            DispatchOutcome::Rejected(reason) => info!("Control record rejected: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamDefaultConfig;
    use crate::engine::ScriptedEngine;
    use crate::stream::{FrameRouter, GridLayout, SessionRegistry};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    fn dispatcher() -> CommandDispatcher<ScriptedEngine> {
        let (router, _events) = FrameRouter::new();
        CommandDispatcher::new(Arc::new(SessionRegistry::new(
            ScriptedEngine::new(),
            router,
            GridLayout::default(),
            &StreamDefaultConfig::default(),
        )))
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = ControlServer::bind(&path, dispatcher()).unwrap();
        assert_eq!(server.path(), path.as_path());
        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_records_applied_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control.sock");
        let dispatcher = dispatcher();
        let registry = dispatcher.registry().clone();

        let server = ControlServer::bind(&path, dispatcher).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(
                concat!(
                    "{\"cmd\":\"add_stream\",\"payload\":{\"id\":\"cam1\",\"url\":\"rtsp://a\"}}\n",
                    "\n",
                    "garbage\n",
                    "{\"cmd\":\"add_stream\",\"payload\":{\"id\":\"cam2\",\"url\":\"rtsp://b\"}}\n",
                    "{\"cmd\":\"remove_stream\",\"payload\":{\"id\":\"cam1\"}}\n",
                    "{\"cmd\":\"grid\",\"payload\":{\"rows\":1,\"cols\":3}}\n",
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        wait_for(|| {
            let registry = registry.clone();
            async move { registry.layout().await == GridLayout { rows: 1, cols: 3 } }
        })
        .await;
        assert_eq!(registry.list().await, vec!["cam2"]);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_invalid_utf8_record_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control.sock");
        let dispatcher = dispatcher();
        let registry = dispatcher.registry().clone();

        let server = ControlServer::bind(&path, dispatcher).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let mut records = Vec::new();
        records.extend_from_slice(
            b"{\"cmd\":\"add_stream\",\"payload\":{\"id\":\"a\",\"url\":\"rtsp://a\"}}\n",
        );
        records.extend_from_slice(b"\xff\xfe garbage\n");
        records.extend_from_slice(
            b"{\"cmd\":\"add_stream\",\"payload\":{\"id\":\"b\",\"url\":\"rtsp://b\"}}\n",
        );
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(&records).await.unwrap();

        wait_for(|| {
            let registry = registry.clone();
            async move { registry.len().await == 2 }
        })
        .await;
        assert_eq!(registry.list().await, vec!["a", "b"]);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_record_is_skipped() {
        let mut input = vec![b'x'; MAX_RECORD_LEN * 2 + 10];
        input.extend_from_slice(b"\n{\"cmd\":\"grid\"}\n");
        let mut reader: &[u8] = &input;
        let mut buf = Vec::new();

        assert!(matches!(
            read_record(&mut reader, &mut buf).await.unwrap(),
            Record::Oversized
        ));
        assert!(matches!(
            read_record(&mut reader, &mut buf).await.unwrap(),
            Record::Line
        ));
        assert_eq!(buf, b"{\"cmd\":\"grid\"}\n");
        assert!(matches!(
            read_record(&mut reader, &mut buf).await.unwrap(),
            Record::Closed
        ));
    }

    #[tokio::test]
    async fn test_record_at_limit_is_kept() {
        let mut input = vec![b' '; MAX_RECORD_LEN];
        input.push(b'\n');
        let mut reader: &[u8] = &input;
        let mut buf = Vec::new();

        assert!(matches!(
            read_record(&mut reader, &mut buf).await.unwrap(),
            Record::Line
        ));
        assert_eq!(buf.len(), MAX_RECORD_LEN + 1);
    }
}
