//! Message framing codec for the syncwire transport
//!
//! An inner message is `[header: i32 LE][payload]`. The magnitude of the header
//! is the payload length; a negative header means the payload is raw DEFLATE.
//!
//! Inner messages whose payload fits in `CHUNK_MAX` bytes go on the wire as-is.
//! Larger ones are cut into `[len: i32 LE][bytes]` segments of at most
//! `CHUNK_MAX` bytes, with the inner header embedded at the start of the first
//! segment. There is no format tag: the decoder tells the two shapes apart from
//! the first length field alone, plus a peek into the first block when that
//! field sits exactly on the boundary.

use std::borrow::Cow;
use std::io::{ErrorKind, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};
use crate::protocol::{CHUNK_MAX, LEN_FIELD, MAX_MESSAGE_LEN};

const CHUNK_MAX_I32: i32 = CHUNK_MAX as i32;

// Cap on up-front allocation for chunked bodies; the declared size comes off the wire.
const PREALLOC_LIMIT: usize = 16 * 1024 * 1024;

/// Stateless encoder/decoder for single logical messages.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    level: Compression,
    /// Largest payload `read_*` will hand back, before or after inflation
    max_decoded: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
            max_decoded: MAX_MESSAGE_LEN,
        }
    }

    /// Codec with an explicit DEFLATE level (0-9).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            ..Self::new()
        }
    }

    /// Refuse to decode messages larger than `limit` bytes with `TooLarge`.
    /// Encoding is unaffected.
    pub fn with_max_decoded(mut self, limit: usize) -> Self {
        self.max_decoded = limit.min(MAX_MESSAGE_LEN);
        self
    }

    pub fn max_decoded(&self) -> usize {
        self.max_decoded
    }

    /// Signed inner header and the body it describes. Borrows `payload` when
    /// the raw form wins so large bodies are not copied.
    fn encode_body<'a>(&self, payload: &'a [u8]) -> Result<(i32, Cow<'a, [u8]>)> {
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(SyncError::TooLarge(payload.len() as u64));
        }
        let compressed = deflate(payload, self.level)?;

        // A raw payload of exactly CHUNK_MAX bytes is read back as a chunked
        // first block when its own first four bytes look like an oversized
        // header. A negative header is never ambiguous, so compress instead.
        let use_compressed = compressed.len() < payload.len()
            || (payload.len() == CHUNK_MAX && has_ambiguous_prefix(payload));

        let body: Cow<'a, [u8]> = if use_compressed {
            Cow::Owned(compressed)
        } else {
            Cow::Borrowed(payload)
        };
        if body.len() > MAX_MESSAGE_LEN {
            return Err(SyncError::TooLarge(body.len() as u64));
        }
        let len = body.len() as i32;
        Ok((if use_compressed { -len } else { len }, body))
    }

    /// Build the inner message for `payload`, keeping whichever of raw or
    /// compressed is smaller (raw on a tie).
    pub fn encode_inner(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let (header, body) = self.encode_body(payload)?;
        let mut inner = Vec::with_capacity(LEN_FIELD + body.len());
        inner.extend_from_slice(&header.to_le_bytes());
        inner.extend_from_slice(&body);
        Ok(inner)
    }

    /// Encode `payload` into the exact bytes written to the wire.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let inner = self.encode_inner(payload)?;
        Ok(frame_inner(inner))
    }

    /// Write one message. Chunked segments are written straight from the
    /// encoded body without assembling the whole wire image first.
    pub async fn write_message<W>(&self, writer: &mut W, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (header, body) = self.encode_body(payload)?;
        let header = header.to_le_bytes();

        if body.len() <= CHUNK_MAX {
            writer.write_all(&header).await?;
            writer.write_all(&body).await?;
        } else {
            // First segment carries the inner header
            let (first, rest) = body.split_at(CHUNK_MAX - LEN_FIELD);
            writer.write_all(&CHUNK_MAX_I32.to_le_bytes()).await?;
            writer.write_all(&header).await?;
            writer.write_all(first).await?;
            for segment in rest.chunks(CHUNK_MAX) {
                writer.write_all(&(segment.len() as i32).to_le_bytes()).await?;
                writer.write_all(segment).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    /// Read one message; a stream that closes before the first byte is an error.
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.read_next(reader).await?.ok_or(SyncError::EndOfStream)
    }

    /// Read one message, returning `None` when the peer closed the stream
    /// cleanly between messages.
    pub async fn read_next<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match self.read_first_field(reader).await? {
            Some(first) => self.read_rest(reader, first).await.map(Some),
            None => Ok(None),
        }
    }

    /// Read the leading length field of the next message. `None` means the
    /// peer closed the stream cleanly before it.
    pub async fn read_first_field<R>(&self, reader: &mut R) -> Result<Option<i32>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        read_len_field(reader).await
    }

    /// Finish a message whose leading length field was `first`.
    pub async fn read_rest<R>(&self, reader: &mut R, first: i32) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (header, body) = if first < CHUNK_MAX_I32 {
            // Unchunked: the whole inner payload fits in one block
            let len = magnitude(first)?;
            if len > CHUNK_MAX {
                return Err(SyncError::framing(format!(
                    "unchunked header {} exceeds chunk limit {}",
                    first, CHUNK_MAX
                )));
            }
            self.check_size(len)?;
            let mut body = vec![0u8; len];
            read_exact(reader, &mut body).await?;
            (first, body)
        } else if first == CHUNK_MAX_I32 {
            let mut block = vec![0u8; CHUNK_MAX];
            read_exact(reader, &mut block).await?;
            let cand = i32::from_le_bytes([block[0], block[1], block[2], block[3]]);
            let declared = magnitude(cand)?;
            if declared <= CHUNK_MAX {
                // Unchunked raw payload of exactly CHUNK_MAX bytes
                self.check_size(CHUNK_MAX)?;
                return Ok(block);
            }
            self.check_size(declared)?;
            let body = read_segments(reader, &block, declared).await?;
            (cand, body)
        } else {
            return Err(SyncError::framing(format!(
                "length field {} exceeds chunk limit {}",
                first, CHUNK_MAX
            )));
        };

        if header < 0 {
            inflate(&body, self.max_decoded)
        } else {
            Ok(body)
        }
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.max_decoded {
            return Err(SyncError::TooLarge(len as u64));
        }
        Ok(())
    }
}

/// Split an inner message into segments when its payload exceeds `CHUNK_MAX`.
fn frame_inner(inner: Vec<u8>) -> Vec<u8> {
    if inner.len() - LEN_FIELD <= CHUNK_MAX {
        return inner;
    }
    let segments = (inner.len() + CHUNK_MAX - 1) / CHUNK_MAX;
    let mut out = Vec::with_capacity(inner.len() + segments * LEN_FIELD);
    for segment in inner.chunks(CHUNK_MAX) {
        out.extend_from_slice(&(segment.len() as i32).to_le_bytes());
        out.extend_from_slice(segment);
    }
    out
}

fn has_ambiguous_prefix(payload: &[u8]) -> bool {
    payload.len() >= LEN_FIELD
        && i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]).unsigned_abs()
            as usize
            > CHUNK_MAX
}

fn magnitude(header: i32) -> Result<usize> {
    let len = header.unsigned_abs() as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(SyncError::framing(format!("header {} out of range", header)));
    }
    Ok(len)
}

/// Accumulate chunked segments after the first block until the bytes following
/// the embedded inner header reach `declared`.
async fn read_segments<R>(reader: &mut R, first_block: &[u8], declared: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut body = Vec::with_capacity(declared.min(PREALLOC_LIMIT));
    body.extend_from_slice(&first_block[LEN_FIELD..]);

    while body.len() < declared {
        let seg = match read_len_field(reader).await? {
            Some(v) => v,
            None => {
                return Err(SyncError::framing(format!(
                    "stream ended after {} of {} chunked bytes",
                    body.len(),
                    declared
                )))
            }
        };
        if seg <= 0 || seg > CHUNK_MAX_I32 {
            return Err(SyncError::framing(format!(
                "segment length {} outside (0, {}]",
                seg, CHUNK_MAX
            )));
        }
        let seg = seg as usize;
        if body.len() + seg > declared {
            return Err(SyncError::framing(format!(
                "segment of {} bytes overruns declared size {} at {}",
                seg,
                declared,
                body.len()
            )));
        }
        let start = body.len();
        body.resize(start + seg, 0);
        read_exact(reader, &mut body[start..]).await?;
    }
    Ok(body)
}

/// Read a 4-byte LE field. `None` means EOF before any byte of the field.
async fn read_len_field<R>(reader: &mut R) -> Result<Option<i32>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; LEN_FIELD];
    let mut filled = 0;
    while filled < LEN_FIELD {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SyncError::EndOfStream);
        }
        filled += n;
    }
    Ok(Some(i32::from_le_bytes(buf)))
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(SyncError::EndOfStream),
        Err(e) => Err(e.into()),
    }
}

fn deflate(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2 + 16), level);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate, stopping as soon as the output passes `limit`.
fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(PREALLOC_LIMIT).min(limit));
    DeflateDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| SyncError::framing(format!("corrupt compressed payload: {}", e)))?;
    if out.len() > limit {
        return Err(SyncError::TooLarge(out.len() as u64));
    }
    Ok(out)
}
