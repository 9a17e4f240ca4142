//! Bounded job queue and the fixed pool of workers that drain it
//!
//! A connection handler decodes one request, wraps it in a [`Job`] together
//! with the connection's output half and a [`Completion`], and submits it.
//! The worker that picks the job up is the only writer on that output until it
//! fires the completion; the handler waits for that before reading again.

use crate::command::{Request, Response};
use crate::diff::diff;
use crate::error::{Result, SyncError};
use crate::frame::FrameCodec;
use crate::logger::EventSink;
use crate::protocol::timeouts::write_deadline_ms;
use crate::protocol::MAX_MESSAGE_LEN;
use crate::protocol_core::ensure_under_root;
use crate::snapshot::SnapshotIndex;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Write half of a connection, type-erased so tests can use in-memory pipes.
pub type ConnectionOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Output shared between a connection handler and whichever job currently owns it.
pub type SharedOutput = Arc<Mutex<ConnectionOutput>>;

pub fn shared_output<W>(writer: W) -> SharedOutput
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// A complete terminal response was written
    Responded,
    /// Writing the response failed; the connection is unusable
    ConnectionLost,
}

/// Single-shot completion signal; consumed on use.
pub struct Completion {
    tx: oneshot::Sender<JobOutcome>,
}

impl Completion {
    pub fn pair() -> (Self, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn complete(self, outcome: JobOutcome) {
        // Handler may already be gone (shutdown); nothing left to notify
        let _ = self.tx.send(outcome);
    }
}

pub struct Job {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub request: Vec<u8>,
    pub output: SharedOutput,
    pub completion: Completion,
}

/// Everything a worker needs besides the job itself.
pub struct JobContext {
    pub index: Arc<SnapshotIndex>,
    pub codec: FrameCodec,
    pub sink: Arc<dyn EventSink>,
    pub shutdown: CancellationToken,
}

/// Producer handle for the bounded queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Enqueue, waiting while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.tx.send(job).await.map_err(|_| SyncError::Cancelled)
    }
}

pub struct WorkerPool {
    queue: JobQueue,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(workers: usize, capacity: usize, ctx: Arc<JobContext>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|n| tokio::spawn(worker_loop(n, Arc::clone(&rx), Arc::clone(&ctx))))
            .collect();
        Self {
            queue: JobQueue { tx },
            workers,
        }
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit. Workers stop once shutdown is cancelled
    /// or every queue handle has been dropped.
    pub async fn join(self) {
        drop(self.queue);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(n: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>, ctx: Arc<JobContext>) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = ctx.shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        let (id, peer) = (job.id, job.peer);
        // Separate task so a panic takes down this job only
        if let Err(e) = tokio::spawn(process_job(Arc::clone(&ctx), job)).await {
            tracing::error!(worker = n, job_id = %id, %peer, error = %e, "job panicked");
            ctx.sink.job_failed(id, peer, "job panicked");
        }
    }
    tracing::debug!(worker = n, "worker stopped");
}

async fn process_job(ctx: Arc<JobContext>, job: Job) {
    let Job {
        id,
        peer,
        request,
        output,
        completion,
    } = job;

    let response = match Request::parse(&request) {
        Ok(req) => match execute(&ctx, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(job_id = %id, %peer, error = %e, "job failed");
                ctx.sink.job_failed(id, peer, &e.to_string());
                Response::error(e)
            }
        },
        Err(e) => {
            tracing::debug!(job_id = %id, %peer, error = %e, "rejected request");
            Response::error(e)
        }
    };

    let outcome = match send_response(&ctx, &output, &response).await {
        Ok(()) => JobOutcome::Responded,
        Err(e) => {
            tracing::debug!(job_id = %id, %peer, error = %e, "response not delivered");
            JobOutcome::ConnectionLost
        }
    };
    completion.complete(outcome);
}

async fn send_response(ctx: &JobContext, output: &SharedOutput, response: &Response) -> Result<()> {
    let body_len = match response {
        Response::File { bytes, .. } => bytes.len(),
        _ => 0,
    };
    let deadline = Duration::from_millis(write_deadline_ms(body_len));

    let mut out = output.lock().await;
    tokio::select! {
        _ = ctx.shutdown.cancelled() => Err(SyncError::Cancelled),
        res = tokio::time::timeout(deadline, response.write_to(&ctx.codec, &mut **out)) => match res {
            Ok(r) => r,
            Err(_) => Err(SyncError::Io(std::io::Error::new(ErrorKind::TimedOut, "response write timed out"))),
        },
    }
}

async fn execute(ctx: &JobContext, request: Request) -> Result<Response> {
    match request {
        Request::SyncGet {
            path,
            client_unix_ms,
            client_size,
        } => sync_get(ctx, &path, client_unix_ms, client_size).await,
        Request::SyncList(manifest) => {
            let snapshot = ctx.index.current();
            let result = tokio::task::spawn_blocking(move || diff(&snapshot, &manifest))
                .await
                .map_err(std::io::Error::other)?;
            Ok(Response::Diff(result))
        }
    }
}

async fn sync_get(ctx: &JobContext, path: &str, client_unix_ms: i64, client_size: u64) -> Result<Response> {
    let snapshot = ctx.index.current();
    let record = match snapshot.get(path) {
        Some(r) => r.clone(),
        None => return Ok(Response::NotFound),
    };
    if client_size == record.size && client_unix_ms >= record.modified_unix_ms() {
        return Ok(Response::NotModified);
    }
    if record.size > MAX_MESSAGE_LEN as u64 {
        return Ok(Response::error("file too large"));
    }

    let location = match ensure_under_root(snapshot.root(), &snapshot.resolve(&record)) {
        Ok(p) => p,
        Err(SyncError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ok(Response::NotFound),
        Err(e) => return Err(e),
    };
    let bytes = match tokio::fs::read(&location).await {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Response::NotFound),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() > MAX_MESSAGE_LEN {
        return Ok(Response::error("file too large"));
    }
    Ok(Response::File {
        name: record.path,
        bytes,
    })
}
