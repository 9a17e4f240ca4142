//! Text grammar carried inside framed messages
//!
//! Requests:  `SYNCGET|<path>|<clientUnixMs>|<clientSize>`, `SYNCLIST|<json manifest>`
//! Responses: `NOTFOUND`, `NOTMODIFIED`, `FILE|<name>|<size>` (+ one body message),
//!            `DIFF|<json>`, `ERROR|<reason>`

use crate::diff::{ClientManifest, DiffResult};
use crate::error::{Result, SyncError};
use crate::frame::FrameCodec;
use crate::protocol::{command, reply, FIELD_SEP};
use crate::protocol_core::normalize_relative;
use tokio::io::AsyncWrite;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SyncGet {
        path: String,
        client_unix_ms: i64,
        client_size: u64,
    },
    SyncList(ClientManifest),
}

impl Request {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| SyncError::protocol("request is not valid UTF-8"))?;
        // Tolerate the newline-terminated text form
        let text = text.trim_end_matches(['\r', '\n']);
        let (verb, rest) = text.split_once(FIELD_SEP).unwrap_or((text, ""));

        if verb.eq_ignore_ascii_case(command::SYNC_GET) {
            // Path may itself contain the separator: peel numeric fields off the right
            let mut fields = rest.rsplitn(3, FIELD_SEP);
            let size = fields.next();
            let ms = fields.next();
            let path = fields.next();
            let (path, ms, size) = match (path, ms, size) {
                (Some(p), Some(m), Some(s)) => (p, m, s),
                _ => {
                    return Err(SyncError::protocol(
                        "SYNCGET expects <path>|<clientUnixMs>|<clientSize>",
                    ))
                }
            };
            let client_unix_ms = ms
                .trim()
                .parse::<i64>()
                .map_err(|_| SyncError::protocol(format!("bad clientUnixMs: {:?}", ms)))?;
            let client_size = size
                .trim()
                .parse::<u64>()
                .map_err(|_| SyncError::protocol(format!("bad clientSize: {:?}", size)))?;
            Ok(Request::SyncGet {
                path: normalize_relative(path)?,
                client_unix_ms,
                client_size,
            })
        } else if verb.eq_ignore_ascii_case(command::SYNC_LIST) {
            let manifest: ClientManifest = serde_json::from_str(rest)
                .map_err(|e| SyncError::protocol(format!("bad manifest: {}", e)))?;
            Ok(Request::SyncList(manifest))
        } else {
            Err(SyncError::protocol(format!("unknown command: {:?}", verb)))
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let text = match self {
            Request::SyncGet {
                path,
                client_unix_ms,
                client_size,
            } => format!(
                "{}|{}|{}|{}",
                command::SYNC_GET,
                path,
                client_unix_ms,
                client_size
            ),
            Request::SyncList(manifest) => {
                let json = serde_json::to_string(manifest)
                    .map_err(|e| SyncError::protocol(format!("manifest encode: {}", e)))?;
                format!("{}|{}", command::SYNC_LIST, json)
            }
        };
        Ok(text.into_bytes())
    }
}

/// Terminal server answer to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    NotFound,
    NotModified,
    File { name: String, bytes: Vec<u8> },
    Diff(DiffResult),
    Error(String),
}

impl Response {
    pub fn error(reason: impl std::fmt::Display) -> Self {
        // Keep the reason on one line
        let reason = reason.to_string().replace(['\r', '\n'], " ");
        Response::Error(reason)
    }

    pub fn busy() -> Self {
        Response::Error(reply::BUSY_REASON.to_string())
    }

    /// First (or only) message of the response
    pub fn header(&self) -> Result<Vec<u8>> {
        let text = match self {
            Response::NotFound => reply::NOT_FOUND.to_string(),
            Response::NotModified => reply::NOT_MODIFIED.to_string(),
            Response::File { name, bytes } => format!("{}|{}|{}", reply::FILE, name, bytes.len()),
            Response::Diff(result) => {
                let json = serde_json::to_string(result)
                    .map_err(|e| SyncError::protocol(format!("diff encode: {}", e)))?;
                format!("{}|{}", reply::DIFF, json)
            }
            Response::Error(reason) => format!("{}|{}", reply::ERROR, reason),
        };
        Ok(text.into_bytes())
    }

    pub async fn write_to<W>(&self, codec: &FrameCodec, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        codec.write_message(writer, &self.header()?).await?;
        if let Response::File { bytes, .. } = self {
            codec.write_message(writer, bytes).await?;
        }
        Ok(())
    }
}

/// Client-side view of a response header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    NotFound,
    NotModified,
    File { name: String, size: u64 },
    Diff(DiffResult),
    Error(String),
}

impl Reply {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| SyncError::protocol("reply is not valid UTF-8"))?;
        let text = text.trim_end_matches(['\r', '\n']);
        let (verb, rest) = text.split_once(FIELD_SEP).unwrap_or((text, ""));
        match verb {
            reply::NOT_FOUND => Ok(Reply::NotFound),
            reply::NOT_MODIFIED => Ok(Reply::NotModified),
            reply::FILE => {
                let (name, size) = rest
                    .rsplit_once(FIELD_SEP)
                    .ok_or_else(|| SyncError::protocol("FILE reply missing size"))?;
                let size = size
                    .parse::<u64>()
                    .map_err(|_| SyncError::protocol(format!("bad FILE size: {:?}", size)))?;
                Ok(Reply::File {
                    name: name.to_string(),
                    size,
                })
            }
            reply::DIFF => {
                let result = serde_json::from_str(rest)
                    .map_err(|e| SyncError::protocol(format!("bad DIFF body: {}", e)))?;
                Ok(Reply::Diff(result))
            }
            reply::ERROR => Ok(Reply::Error(rest.to_string())),
            other => Err(SyncError::protocol(format!("unknown reply: {:?}", other))),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Reply::Error(reason) if reason == reply::BUSY_REASON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ManifestEntry;

    #[test]
    fn test_parse_syncget() {
        let req = Request::parse(b"SYNCGET|docs/a.txt|1700000000000|10").unwrap();
        assert_eq!(
            req,
            Request::SyncGet {
                path: "docs/a.txt".into(),
                client_unix_ms: 1_700_000_000_000,
                client_size: 10
            }
        );
        assert_eq!(Request::parse(&req.to_bytes().unwrap()).unwrap(), req);
    }

    #[test]
    fn test_parse_syncget_path_with_separator_and_newline() {
        let req = Request::parse(b"SYNCGET|we|ird.txt|0|0\r\n").unwrap();
        assert!(matches!(req, Request::SyncGet { ref path, .. } if path == "we|ird.txt"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let cases: [&[u8]; 9] = [
            b"SYNCGET|a.txt|0",
            b"SYNCGET|a.txt|soon|0",
            b"SYNCGET|a.txt|0|-1",
            b"SYNCGET|../etc/passwd|0|0",
            b"SYNCGET||0|0",
            b"FETCH|a.txt",
            b"",
            b"SYNCLIST|{not json",
            &[0xff, 0xfe],
        ];
        for bad in cases {
            assert!(
                matches!(Request::parse(bad), Err(SyncError::Protocol(_))),
                "{:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_synclist_round_trip() {
        let manifest = ClientManifest::new(vec![ManifestEntry {
            path: "a|b.txt".into(),
            size: 3,
            modified_unix_ms: 9,
            hash: "00".into(),
        }]);
        let req = Request::SyncList(manifest);
        assert_eq!(Request::parse(&req.to_bytes().unwrap()).unwrap(), req);
    }

    #[test]
    fn test_response_headers() {
        assert_eq!(Response::NotFound.header().unwrap(), b"NOTFOUND");
        assert_eq!(Response::NotModified.header().unwrap(), b"NOTMODIFIED");
        let file = Response::File {
            name: "a.txt".into(),
            bytes: vec![1; 10],
        };
        assert_eq!(file.header().unwrap(), b"FILE|a.txt|10");
        assert_eq!(
            Response::error("disk\nfull").header().unwrap(),
            b"ERROR|disk full"
        );
    }

    #[test]
    fn test_reply_parse() {
        assert_eq!(Reply::parse(b"NOTFOUND").unwrap(), Reply::NotFound);
        assert_eq!(
            Reply::parse(b"FILE|x|y.txt|42").unwrap(),
            Reply::File {
                name: "x|y.txt".into(),
                size: 42
            }
        );
        assert!(Reply::parse(b"ERROR|server busy").unwrap().is_busy());
        assert!(!Reply::parse(b"ERROR|other").unwrap().is_busy());
        assert!(Reply::parse(b"WHAT").is_err());

        let diff = Response::Diff(DiffResult::default()).header().unwrap();
        assert_eq!(Reply::parse(&diff).unwrap(), Reply::Diff(DiffResult::default()));
    }

    #[tokio::test]
    async fn test_file_response_is_two_messages() {
        let codec = FrameCodec::new();
        let resp = Response::File {
            name: "a.txt".into(),
            bytes: b"0123456789".to_vec(),
        };
        let mut wire = Vec::new();
        resp.write_to(&codec, &mut wire).await.unwrap();

        let mut reader = wire.as_slice();
        let header = codec.read_message(&mut reader).await.unwrap();
        assert_eq!(header, b"FILE|a.txt|10");
        let body = codec.read_message(&mut reader).await.unwrap();
        assert_eq!(body, b"0123456789");
        assert!(reader.is_empty());
    }
}
