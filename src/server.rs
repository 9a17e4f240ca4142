//! TCP front end: admission gate, per-connection request loop, and hand-off
//! to the worker pool.

use crate::command::Response;
use crate::config::ServerConfig;
use crate::error::SyncError;
use crate::frame::FrameCodec;
use crate::logger::{EventSink, NoopSink};
use crate::protocol::timeouts::BUSY_WRITE_MS;
use crate::snapshot::SnapshotIndex;
use crate::worker::{shared_output, Completion, Job, JobContext, JobOutcome, JobQueue, SharedOutput, WorkerPool};
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct SyncServer {
    config: ServerConfig,
    index: Arc<SnapshotIndex>,
    sink: Arc<dyn EventSink>,
    codec: FrameCodec,
    shutdown: CancellationToken,
}

/// Per-connection settings shared by every handler
struct ConnectionSettings {
    codec: FrameCodec,
    admission_grace: Duration,
    idle_timeout: Duration,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl SyncServer {
    pub fn new(config: ServerConfig, index: Arc<SnapshotIndex>) -> Self {
        let codec = FrameCodec::new().with_max_decoded(config.max_request_bytes);
        Self {
            config,
            index,
            sink: Arc::new(NoopSink),
            codec,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use an externally owned shutdown signal (e.g. shared with the scan task)
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn index(&self) -> Arc<SnapshotIndex> {
        Arc::clone(&self.index)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("bind {}", self.config.bind))
    }

    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the shutdown token is cancelled.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().ok();
        tracing::info!(
            addr = ?local,
            root = %self.config.root.display(),
            workers = self.config.workers,
            max_connections = self.config.max_connections,
            "syncwire server listening"
        );

        let ctx = Arc::new(JobContext {
            index: Arc::clone(&self.index),
            codec: self.codec,
            sink: Arc::clone(&self.sink),
            shutdown: self.shutdown.clone(),
        });
        let pool = WorkerPool::start(self.config.workers, self.config.queue_capacity, ctx);
        tracing::debug!(workers = pool.size(), queue_capacity = self.config.queue_capacity, "worker pool started");
        let admission = Arc::new(Semaphore::new(self.config.max_connections));
        let settings = Arc::new(ConnectionSettings {
            codec: self.codec,
            admission_grace: self.config.admission_grace(),
            idle_timeout: self.config.idle_timeout(),
            sink: Arc::clone(&self.sink),
            shutdown: self.shutdown.clone(),
        });

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(%peer, "connection accepted");
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&admission),
                        pool.queue(),
                        Arc::clone(&settings),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    // Usually fd exhaustion; back off instead of spinning
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        drop(listener);
        admission.close();
        pool.join().await;
        tracing::info!("syncwire server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    admission: Arc<Semaphore>,
    queue: JobQueue,
    settings: Arc<ConnectionSettings>,
) {
    let acquired = tokio::select! {
        _ = settings.shutdown.cancelled() => return,
        acquired = timeout(settings.admission_grace, admission.acquire_owned()) => acquired,
    };
    let _permit = match acquired {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => return, // gate closed: shutting down
        Err(_) => {
            reject_busy(stream, peer, &settings).await;
            return;
        }
    };

    let (mut reader, writer) = stream.into_split();
    let output = shared_output(writer);
    match serve_requests(&mut reader, &output, peer, &queue, &settings).await {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        Err(SyncError::Cancelled) => tracing::debug!(%peer, "connection cancelled"),
        Err(e) => tracing::debug!(%peer, error = %e, "connection aborted"),
    }

    let mut out = output.lock().await;
    let _ = out.shutdown().await;
}

async fn reject_busy(mut stream: TcpStream, peer: SocketAddr, settings: &ConnectionSettings) {
    tracing::info!(%peer, "connection rejected: server busy");
    settings.sink.connection_rejected(peer);
    let busy = async {
        Response::busy().write_to(&settings.codec, &mut stream).await?;
        stream.shutdown().await?;
        // Drain whatever the client already sent so the close is a FIN, not a reset
        let mut scratch = [0u8; 4096];
        while stream.read(&mut scratch).await? > 0 {}
        Ok::<(), SyncError>(())
    };
    if let Err(e) = timeout(Duration::from_millis(BUSY_WRITE_MS), busy).await.unwrap_or(Err(SyncError::Cancelled)) {
        tracing::debug!(%peer, error = %e, "busy rejection did not finish cleanly");
    }
}

/// Strictly sequential: the next request is read only after the current job
/// has signalled completion.
async fn serve_requests(
    reader: &mut OwnedReadHalf,
    output: &SharedOutput,
    peer: SocketAddr,
    queue: &JobQueue,
    settings: &ConnectionSettings,
) -> Result<(), SyncError> {
    let shutdown = &settings.shutdown;
    loop {
        // Idle time is only the wait for a new request to start
        let first = tokio::select! {
            _ = shutdown.cancelled() => return Err(SyncError::Cancelled),
            first = timeout(settings.idle_timeout, settings.codec.read_first_field(reader)) => match first {
                Ok(first) => first,
                Err(_) => {
                    tracing::debug!(%peer, "idle timeout");
                    return Ok(());
                }
            },
        };
        let next = match first {
            Ok(Some(first)) => tokio::select! {
                _ = shutdown.cancelled() => return Err(SyncError::Cancelled),
                rest = settings.codec.read_rest(reader, first) => rest,
            },
            Ok(None) => return Ok(()),
            Err(e) => Err(e),
        };

        let request = match next {
            Ok(request) => request,
            Err(e) => {
                // Stream is out of sync; answer if the socket still takes writes, then drop it
                if matches!(e, SyncError::Framing(_) | SyncError::TooLarge(_)) {
                    let _ = write_direct(output, &Response::error(&e), settings).await;
                }
                return Err(e);
            }
        };

        let (completion, done) = Completion::pair();
        let job = Job {
            id: Uuid::new_v4(),
            peer,
            request,
            output: Arc::clone(output),
            completion,
        };
        tokio::select! {
            _ = shutdown.cancelled() => return Err(SyncError::Cancelled),
            submitted = queue.submit(job) => submitted?,
        }

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return Err(SyncError::Cancelled),
            outcome = done => outcome,
        };
        match outcome {
            Ok(JobOutcome::Responded) => {}
            Ok(JobOutcome::ConnectionLost) => {
                return Err(SyncError::Io(std::io::Error::new(
                    ErrorKind::BrokenPipe,
                    "response not delivered",
                )))
            }
            Err(_) => {
                // Job dropped without completing (panicked); response state unknown
                let _ = write_direct(output, &Response::error("internal error"), settings).await;
                return Err(SyncError::Io(std::io::Error::other("job aborted")));
            }
        }
    }
}

/// Write a response from the handler itself. Only used when no job owns the output.
async fn write_direct(output: &SharedOutput, response: &Response, settings: &ConnectionSettings) -> Result<(), SyncError> {
    let mut out = output.lock().await;
    timeout(
        Duration::from_millis(BUSY_WRITE_MS),
        response.write_to(&settings.codec, &mut **out),
    )
    .await
    .unwrap_or(Err(SyncError::Cancelled))
}
