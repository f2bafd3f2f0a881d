//! Unix-domain-socket line-JSON submission endpoint for `ask`. Grounded
//! on the accept-loop shape in `examples/Alb-O-xeno/crates/api/src/ipc.rs`
//! (spawn-per-connection `UnixListener::accept()` loop), generalized from
//! a fire-and-forget message to a request/response protocol since `ask`
//! needs the daemon's `TaskResult` back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use laskd_protocol::{Request, TaskResult};

use crate::lifecycle::Dispatchers;

/// One line of client → daemon traffic.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Submit { request: Request },
    Cancel { req_id: String },
}

/// One line of daemon → client traffic.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Result { result: TaskResult },
    Error { message: String },
    Ack,
}

/// Registry of in-flight cancellation flags so a later `Cancel` message on
/// the same connection (or a future one) can reach the right task.
#[derive(Default)]
pub struct CancellationTable {
    flags: dashmap::DashMap<String, Arc<std::sync::atomic::AtomicBool>>,
}

impl CancellationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, req_id: &str, flag: Arc<std::sync::atomic::AtomicBool>) {
        self.flags.insert(req_id.to_string(), flag);
    }

    fn cancel(&self, req_id: &str) -> bool {
        match self.flags.get(req_id) {
            Some(flag) => {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn forget(&self, req_id: &str) {
        self.flags.remove(req_id);
    }
}

pub async fn serve(
    socket_path: std::path::PathBuf,
    dispatchers: Arc<Dispatchers>,
    cancellations: Arc<CancellationTable>,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(
        component = "ipc",
        event = "ipc.listening",
        path = %socket_path.display(),
    );

    loop {
        let (stream, _addr) = listener.accept().await?;
        let dispatchers = dispatchers.clone();
        let cancellations = cancellations.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, dispatchers, cancellations).await {
                warn!(
                    component = "ipc",
                    event = "ipc.connection_error",
                    error = %e,
                );
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    dispatchers: Arc<Dispatchers>,
    cancellations: Arc<CancellationTable>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let message: ClientMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                send(&mut write_half, &ServerMessage::Error { message: e.to_string() }).await?;
                continue;
            }
        };

        match message {
            ClientMessage::Submit { request } => {
                handle_submit(request, &dispatchers, &cancellations, &mut write_half).await?;
            }
            ClientMessage::Cancel { req_id } => {
                let found = cancellations.cancel(&req_id);
                debug!(
                    component = "ipc",
                    event = "ipc.cancel_requested",
                    req_id = %req_id,
                    found,
                );
                send(&mut write_half, &ServerMessage::Ack).await?;
            }
        }
    }

    Ok(())
}

async fn handle_submit(
    request: Request,
    dispatchers: &Arc<Dispatchers>,
    cancellations: &Arc<CancellationTable>,
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
) -> anyhow::Result<()> {
    let provider = request.provider;
    let Some(dispatcher) = dispatchers.get(provider) else {
        send(
            write_half,
            &ServerMessage::Error {
                message: format!("no dispatcher configured for provider {:?}", provider),
            },
        )
        .await?;
        return Ok(());
    };

    let req_id = request.req_id.clone();
    let (cancelled, reply_rx) = dispatcher.submit(request);
    cancellations.register(&req_id, cancelled);

    let outcome = reply_rx.await;
    cancellations.forget(&req_id);

    match outcome {
        Ok(result) => send(write_half, &ServerMessage::Result { result }).await,
        Err(_) => {
            send(
                write_half,
                &ServerMessage::Error {
                    message: "lifecycle task dropped without a result".to_string(),
                },
            )
            .await
        }
    }
}

async fn send(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    message: &ServerMessage,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    Ok(())
}
