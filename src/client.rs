//! Client side of the request/response protocol.

use crate::command::{Reply, Request};
use crate::diff::{ClientManifest, DiffResult};
use crate::error::{Result, SyncError};
use crate::frame::FrameCodec;
use crate::protocol::timeouts::{write_deadline_ms, CONNECT_MS};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

/// How long to wait for the header of a reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a `SYNCGET`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    NotFound,
    NotModified,
    File { name: String, bytes: Vec<u8> },
}

/// One connection to a syncwired server. Requests are strictly sequential.
pub struct SyncClient {
    stream: TcpStream,
    codec: FrameCodec,
}

impl SyncClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = match timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(addr)).await {
            Ok(s) => s?,
            Err(_) => {
                return Err(SyncError::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("connect timeout ({} ms)", CONNECT_MS),
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            codec: FrameCodec::new(),
        })
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Ask for `path`, passing what the client already has so the server can
    /// answer NOTMODIFIED.
    pub async fn sync_get(&mut self, path: &str, client_unix_ms: i64, client_size: u64) -> Result<FetchOutcome> {
        let request = Request::SyncGet {
            path: path.to_string(),
            client_unix_ms,
            client_size,
        };
        match self.round_trip(&request).await? {
            Reply::NotFound => Ok(FetchOutcome::NotFound),
            Reply::NotModified => Ok(FetchOutcome::NotModified),
            Reply::File { name, size } => {
                let deadline = Duration::from_millis(write_deadline_ms(size as usize));
                let bytes = self.read_timed(deadline).await?;
                if bytes.len() as u64 != size {
                    return Err(SyncError::protocol(format!(
                        "FILE body is {} bytes, header said {}",
                        bytes.len(),
                        size
                    )));
                }
                Ok(FetchOutcome::File { name, bytes })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Send the local manifest and return what differs.
    pub async fn sync_list(&mut self, manifest: &ClientManifest) -> Result<DiffResult> {
        let request = Request::SyncList(manifest.clone());
        match self.round_trip(&request).await? {
            Reply::Diff(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn round_trip(&mut self, request: &Request) -> Result<Reply> {
        self.codec
            .write_message(&mut self.stream, &request.to_bytes()?)
            .await?;
        let header = self.read_timed(REPLY_TIMEOUT).await?;
        match Reply::parse(&header)? {
            reply if reply.is_busy() => Err(SyncError::AdmissionRejected),
            Reply::Error(reason) => Err(SyncError::protocol(format!("server error: {}", reason))),
            reply => Ok(reply),
        }
    }

    async fn read_timed(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        match timeout(deadline, self.codec.read_message(&mut self.stream)).await {
            Ok(r) => r,
            Err(_) => Err(SyncError::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("reply timeout ({} ms)", deadline.as_millis()),
            ))),
        }
    }
}

fn unexpected(reply: Reply) -> SyncError {
    SyncError::protocol(format!("unexpected reply: {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_busy_reply_maps_to_admission_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let codec = FrameCodec::new();
            let _ = codec.read_message(&mut s).await.unwrap();
            codec.write_message(&mut s, b"ERROR|server busy").await.unwrap();
        });

        let mut client = SyncClient::connect(addr).await.unwrap();
        let err = client.sync_get("a.txt", 0, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::AdmissionRejected));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_short_file_body_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let codec = FrameCodec::new();
            let _ = codec.read_message(&mut s).await.unwrap();
            codec.write_message(&mut s, b"FILE|a.txt|5").await.unwrap();
            codec.write_message(&mut s, b"abc").await.unwrap();
        });

        let mut client = SyncClient::connect(addr).await.unwrap();
        let err = client.sync_get("a.txt", 0, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        server.await.unwrap();
    }
}
