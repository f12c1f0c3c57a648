//! TCP front end for the line protocol.

use crate::control_loop::ControlLoop;
use crate::protocol::{ProtocolError, ProtocolHandler, Response, MAX_REQUEST_SIZE};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Accepts connections until `shutdown` resolves.
pub async fn serve<S>(listener: TcpListener, control: Arc<ControlLoop>, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()>,
{
    info!("Listening on {}", listener.local_addr()?);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("Client connected: {}", addr);
                    let control = Arc::clone(&control);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, addr, control).await {
                            warn!("Client {} error: {}", addr, e);
                        }
                        info!("Client {} disconnected", addr);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }
    Ok(())
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, control: Arc<ControlLoop>) -> std::io::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let mut handler = ProtocolHandler::new();
    let mut subscription = SubscriptionGuard::default();

    loop {
        let response = match read_request_line(&mut reader).await? {
            LineRead::Eof => break,
            LineRead::Blank => continue,
            LineRead::TooLong(size) => {
                warn!("Client {} sent {} byte request", addr, size);
                Response::error(
                    0,
                    ProtocolError::MessageTooLarge {
                        size,
                        limit: MAX_REQUEST_SIZE,
                    }
                    .to_string(),
                )
            }
            LineRead::NotUtf8 => Response::error(0, "request is not valid UTF-8"),
            LineRead::Line(line) => {
                let handled = handler.handle_line(&control, &line).await;
                if handled.subscribe && !subscription.is_active() {
                    subscription.set(spawn_subscription(
                        handled.response.id,
                        &control,
                        Arc::clone(&writer),
                    ));
                }
                handled.response
            }
        };

        let encoded = match handler.serialize_response(&response) {
            Ok(json) => json.to_string(),
            Err(e) => {
                error!("Failed to encode response {}: {}", response.id, e);
                serde_json::to_string(&Response::error(response.id, e.to_string()))
                    .unwrap_or_default()
            }
        };
        write_line(&writer, &encoded).await?;
    }

    Ok(())
}

/// Owns a connection's status stream and aborts it when the connection
/// handler returns, errors included.
#[derive(Default)]
struct SubscriptionGuard(Option<JoinHandle<()>>);

impl SubscriptionGuard {
    fn is_active(&self) -> bool {
        self.0.is_some()
    }

    fn set(&mut self, task: JoinHandle<()>) {
        self.0 = Some(task);
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

/// Streams every status published after subscription to the client.
fn spawn_subscription(id: u32, control: &ControlLoop, writer: SharedWriter) -> JoinHandle<()> {
    let mut updates = control.subscribe();
    updates.mark_unchanged();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().clone();
            let line = match Response::status_update(id, &status).and_then(|r| {
                serde_json::to_string(&r).map_err(|e| ProtocolError::Serialization(e.to_string()))
            }) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Dropping status update: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_line(&writer, &line).await {
                warn!("Status stream ended: {}", e);
                break;
            }
        }
    })
}

async fn write_line(writer: &SharedWriter, line: &str) -> std::io::Result<()> {
    let mut guard = writer.lock().await;
    guard.write_all(line.as_bytes()).await?;
    guard.write_all(b"\n").await?;
    guard.flush().await
}

#[derive(Debug, PartialEq)]
enum LineRead {
    Eof,
    Blank,
    Line(String),
    TooLong(usize),
    NotUtf8,
}

/// Reads one newline-terminated request without buffering more than the
/// request limit. An oversized line is consumed and discarded.
async fn read_request_line<R>(reader: &mut R) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_REQUEST_SIZE as u64;
    let mut buf = Vec::new();
    let n = (&mut *reader).take(limit + 1).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }

    if n as u64 > limit && buf.last() != Some(&b'\n') {
        let mut dropped = n;
        loop {
            buf.clear();
            let m = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
            dropped += m;
            if m == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        return Ok(LineRead::TooLong(dropped));
    }

    match String::from_utf8(buf) {
        Ok(line) if line.trim().is_empty() => Ok(LineRead::Blank),
        Ok(line) => Ok(LineRead::Line(line)),
        Err(_) => Ok(LineRead::NotUtf8),
    }
}
