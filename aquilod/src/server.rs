//! Unix socket server
//!
//! Line-delimited JSON request/response handling for GUI and CLI clients,
//! plus push-mode streaming subscriptions.
//!
//! # Hardening
//! - Symlink refusal on the socket path
//! - Connection limit with a global counter
//! - Bounded line reads (MAX_MESSAGE_SIZE) with read/write timeouts
//! - All payloads validated before touching engine state
//!
//! # Streaming
//! After a `StreamSnapshots` request the connection switches to push mode:
//! every published snapshot and engine event is written to the subscriber.
//! A subscriber that can't keep up lags the event channel and loses frames,
//! or is disconnected on write timeout - the control loop is never
//! back-pressured. Sending any new request cancels the stream and is
//! processed normally. Overrides set by a connection are cleared when it
//! disconnects.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use aquilo_error::AquiloError;
use aquilo_protocol::{
    ErrorKind, Request, RequestEnvelope, Response, ResponseData, ResponseEnvelope, StreamMessage,
    MAX_MESSAGE_SIZE,
};

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 32;

/// Read timeout per request (idle connections are dropped)
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write timeout per message; a slower subscriber is disconnected
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket permissions (0660 = owner and group only)
const SOCKET_MODE: u32 = 0o660;

/// Global connection counter
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Connection id source (override ownership + logging)
static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    use tokio::io::AsyncBufReadExt;
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            // Consume enough to make forward progress, but don't buffer beyond max_len.
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

/// Run the Unix socket server until shutdown
pub async fn run_server(
    socket_path: &str,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(socket_path);

    if path.exists() {
        let metadata = path.symlink_metadata()?;
        // Refuse to remove symlinks
        if metadata.file_type().is_symlink() {
            return Err("Socket path is a symlink - refusing for security".into());
        }
        std::fs::remove_file(path)?;
        debug!("Removed existing socket file");
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    info!("Listening on {} (mode {:o})", socket_path, SOCKET_MODE);
    info!(
        "Limits: max_conn={}, max_msg={}, read_timeout={:?}",
        MAX_CONNECTIONS, MAX_MESSAGE_SIZE, READ_TIMEOUT
    );

    let mut shutdown = engine.subscribe_shutdown();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
                        if current >= MAX_CONNECTIONS {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            let conn_id = CONNECTION_IDS.fetch_add(1, Ordering::SeqCst);
                            handle_client(stream, conn_id, engine.clone()).await;
                            engine.clear_overrides_owned(conn_id).await;
                            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested, server stopping");
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("Server stopped");
    Ok(())
}

/// Handle a single client connection
async fn handle_client(stream: UnixStream, conn_id: u64, engine: Arc<Engine>) {
    debug!(conn = conn_id, "Client connected");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);

    loop {
        let read_result =
            timeout(READ_TIMEOUT, read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE))
                .await;

        let n = match read_result {
            Ok(Ok(0)) => {
                debug!(conn = conn_id, "Client disconnected");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(conn = conn_id, "Oversized request");
                    let envelope = ResponseEnvelope::new(
                        0,
                        Response::error(ErrorKind::Validation, "Message too large"),
                    );
                    let _ = send_json(&mut writer, &envelope).await;
                } else {
                    debug!(conn = conn_id, "Read error: {}", e);
                }
                break;
            }
            Err(_) => {
                debug!(conn = conn_id, "Read timeout");
                break;
            }
        };
        debug!(conn = conn_id, bytes = n, "Request received");

        let mut pending = Some(std::mem::take(&mut line));
        // A StreamSnapshots request may hand back the line that cancelled
        // the stream; it is processed as the next request.
        while let Some(request_line) = pending.take() {
            match process_line(&request_line, conn_id, &engine).await {
                Dispatch::Respond(envelope) => {
                    if send_json(&mut writer, &envelope).await.is_err() {
                        return;
                    }
                }
                Dispatch::Stream(envelope) => {
                    if send_json(&mut writer, &envelope).await.is_err() {
                        return;
                    }
                    match stream_loop(&mut reader, &mut writer, conn_id, &engine).await {
                        StreamEnd::Disconnected => return,
                        StreamEnd::Cancelled(next_line) => {
                            pending = Some(next_line);
                        }
                    }
                }
            }
        }
    }
}

enum Dispatch {
    Respond(ResponseEnvelope),
    /// Acknowledge, then switch the connection to push mode
    Stream(ResponseEnvelope),
}

enum StreamEnd {
    Disconnected,
    /// The client sent a new request while streaming
    Cancelled(Vec<u8>),
}

/// Parse and dispatch one request line
async fn process_line(line: &[u8], conn_id: u64, engine: &Arc<Engine>) -> Dispatch {
    let envelope: RequestEnvelope = match std::str::from_utf8(line)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(s).map_err(|e| e.to_string()))
    {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(conn = conn_id, "Malformed request: {}", e);
            return Dispatch::Respond(ResponseEnvelope::new(
                0,
                Response::error(ErrorKind::Validation, format!("Malformed request: {}", e)),
            ));
        }
    };

    let id = envelope.id;
    if let Err(e) = envelope.request.validate() {
        return Dispatch::Respond(ResponseEnvelope::new(id, Response::validation(e)));
    }

    debug!(conn = conn_id, request = envelope.request.type_name(), "Dispatching");
    if matches!(envelope.request, Request::StreamSnapshots) {
        return Dispatch::Stream(ResponseEnvelope::new(
            id,
            Response::Ok(ResponseData::streaming()),
        ));
    }

    let response = execute(envelope.request, conn_id, engine).await;
    Dispatch::Respond(ResponseEnvelope::new(id, response))
}

/// Execute a non-streaming request against the engine
async fn execute(request: Request, conn_id: u64, engine: &Arc<Engine>) -> Response {
    match request {
        Request::Ping => Response::Ok(ResponseData::string("pong")),
        Request::Version => Response::Ok(ResponseData::string(env!("CARGO_PKG_VERSION"))),
        Request::GetSnapshot => Response::Ok(ResponseData::snapshot(engine.view().await)),
        Request::SetProfile { profile } => match engine.set_profile(profile).await {
            Ok(accepted) => Response::Ok(ResponseData::profile(accepted)),
            Err(e) => error_response(e),
        },
        Request::DeleteProfile { id } => match engine.delete_profile(&id).await {
            Ok(()) => Response::ok(),
            Err(e) => error_response(e),
        },
        Request::SetOverride { channel_id, duty, ttl_ms } => {
            match engine.set_override(channel_id, duty, ttl_ms, conn_id).await {
                Ok(()) => Response::ok(),
                Err(e) => error_response(e),
            }
        }
        Request::ClearOverride { channel_id } => match engine.clear_override(&channel_id).await {
            Ok(_) => Response::ok(),
            Err(e) => error_response(e),
        },
        Request::Rediscover => {
            engine.rediscover().await;
            Response::ok()
        }
        // Handled by the caller
        Request::StreamSnapshots => Response::internal("stream request reached executor"),
    }
}

/// Push snapshots and events until disconnect or a new inbound request
async fn stream_loop(
    reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    conn_id: u64,
    engine: &Arc<Engine>,
) -> StreamEnd {
    let mut snapshots = engine.subscribe_snapshots();
    let mut events = engine.subscribe_events();
    info!(conn = conn_id, "Streaming subscription started");

    // The read future lives across select iterations so an inbound request
    // is never half-consumed when a frame write wins the race
    let cancel = read_owned_line(reader);
    tokio::pin!(cancel);

    loop {
        tokio::select! {
            read = &mut cancel => {
                return match read {
                    Ok(line) if !line.is_empty() => {
                        info!(conn = conn_id, "Streaming cancelled by client request");
                        StreamEnd::Cancelled(line)
                    }
                    _ => {
                        debug!(conn = conn_id, "Subscriber disconnected");
                        StreamEnd::Disconnected
                    }
                };
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return StreamEnd::Disconnected;
                }
                let view = engine.view().await;
                if send_json(writer, &StreamMessage::Snapshot(view)).await.is_err() {
                    warn!(conn = conn_id, "Subscriber write failed, dropping");
                    return StreamEnd::Disconnected;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if send_json(writer, &StreamMessage::Event(event)).await.is_err() {
                            warn!(conn = conn_id, "Subscriber write failed, dropping");
                            return StreamEnd::Disconnected;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Slow subscriber: drop frames, never block the engine
                        warn!(conn = conn_id, skipped, "Subscriber lagging, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return StreamEnd::Disconnected;
                    }
                }
            }
        }
    }
}

/// Read one line into an owned buffer (empty buffer = EOF)
async fn read_owned_line(
    reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
) -> std::io::Result<Vec<u8>> {
    let mut line = Vec::with_capacity(MAX_MESSAGE_SIZE);
    read_line_bounded(reader, &mut line, MAX_MESSAGE_SIZE).await?;
    Ok(line)
}

/// Serialize and send one JSON line with the write timeout applied
async fn send_json<T: serde::Serialize>(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    message: &T,
) -> Result<(), ()> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!("Response serialization failed: {}", e);
            return Err(());
        }
    };

    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            warn!("Write timeout");
            Err(())
        }
    }
}

/// Map engine errors onto protocol error kinds
fn error_response(error: AquiloError) -> Response {
    match &error {
        AquiloError::Validation(_)
        | AquiloError::UnknownChannel(_)
        | AquiloError::UnknownDevice(_)
        | AquiloError::UnsupportedOperation { .. } => Response::validation(error.to_string()),
        AquiloError::OutOfRange { .. } => {
            Response::error(ErrorKind::OutOfRange, error.to_string())
        }
        AquiloError::ProfileNotFound(_) => Response::not_found(error.to_string()),
        _ => Response::internal(error.to_string()),
    }
}
