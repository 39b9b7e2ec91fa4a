//! SigV4 streaming-chunked payload validation
//!
//! Streaming uploads carry a seed signature in the Authorization header and
//! one signature per body chunk, each chained off the previous one. The
//! wrapper produced here decodes the aws-chunked framing, validates every
//! chunk signature as bytes flow, and truncates the stream on the first
//! mismatch.

use crate::credentials::constant_time_eq;
use crate::request::{ByteStream, find_subslice, io_error};
use crate::sigv4::{EMPTY_SHA256, calculate_signature, hex_sha256};
use bytes::Bytes;
use futures::StreamExt;
use reefgate_common::ApiError;
use std::io;

/// Prefix of the per-chunk string to sign
const CHUNK_STRING_TO_SIGN_PREFIX: &str = "AWS4-HMAC-SHA256-PAYLOAD";

/// A chunk metadata line must fit in this many bytes
const MAX_CHUNK_META_SIZE: usize = 1024;

/// Framing errors of the aws-chunked encoding
#[derive(Debug, thiserror::Error)]
pub enum ChunkStreamError {
    #[error("malformed streaming chunk encoding")]
    Malformed,
    #[error("truncated streaming chunk body")]
    Incomplete,
}

/// Build the string to sign for one chunk
pub fn chunk_string_to_sign(
    amz_date: &str,
    scope: &str,
    previous_signature: &str,
    chunk_data: &[u8],
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        CHUNK_STRING_TO_SIGN_PREFIX,
        amz_date,
        scope,
        previous_signature,
        EMPTY_SHA256,
        hex_sha256(chunk_data)
    )
}

struct ChunkState {
    inner: ByteStream,
    buf: Vec<u8>,
    signing_key: Vec<u8>,
    amz_date: String,
    scope: String,
    previous_signature: String,
    finished: bool,
}

fn malformed() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, ChunkStreamError::Malformed)
}

fn incomplete() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, ChunkStreamError::Incomplete)
}

impl ChunkState {
    /// Pull one chunk from the transport into the buffer; false on EOF.
    async fn fill(&mut self) -> io::Result<bool> {
        match self.inner.next().await {
            None => Ok(false),
            Some(Err(e)) => Err(e),
            Some(Ok(bytes)) => {
                self.buf.extend_from_slice(&bytes);
                Ok(true)
            }
        }
    }

    /// Read one CRLF-terminated metadata line, consuming the terminator.
    async fn read_meta_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(pos) = find_subslice(&self.buf, b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos).collect();
                self.buf.drain(..2);
                return Ok(line);
            }
            if self.buf.len() > MAX_CHUNK_META_SIZE {
                return Err(malformed());
            }
            if !self.fill().await? {
                return Err(incomplete());
            }
        }
    }

    /// Read exactly `size` payload bytes.
    async fn read_data(&mut self, size: usize) -> io::Result<Bytes> {
        while self.buf.len() < size {
            if !self.fill().await? {
                return Err(incomplete());
            }
        }
        let data: Vec<u8> = self.buf.drain(..size).collect();
        Ok(Bytes::from(data))
    }

    /// Consume the CRLF that terminates chunk data.
    async fn expect_crlf(&mut self) -> io::Result<()> {
        while self.buf.len() < 2 {
            if !self.fill().await? {
                return Err(incomplete());
            }
        }
        if &self.buf[..2] != b"\r\n" {
            return Err(malformed());
        }
        self.buf.drain(..2);
        Ok(())
    }

    fn verify_chunk(&mut self, data: &[u8], presented: &str) -> io::Result<()> {
        let string_to_sign =
            chunk_string_to_sign(&self.amz_date, &self.scope, &self.previous_signature, data);
        let signature = calculate_signature(&self.signing_key, &string_to_sign);
        if !constant_time_eq(&signature, presented) {
            return Err(io_error(ApiError::SignatureDoesNotMatch));
        }
        self.previous_signature = signature;
        Ok(())
    }
}

/// Parse a chunk metadata line: `<hex-size>;chunk-signature=<64 hex chars>`
fn parse_chunk_meta(line: &[u8]) -> io::Result<(usize, String)> {
    let line = std::str::from_utf8(line).map_err(|_| malformed())?;
    let (size_str, rest) = line.split_once(';').ok_or_else(malformed)?;
    let size = usize::from_str_radix(size_str, 16).map_err(|_| malformed())?;
    let signature = rest.strip_prefix("chunk-signature=").ok_or_else(malformed)?;
    if signature.len() != 64 || !signature.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(malformed());
    }
    Ok((size, signature.to_string()))
}

/// Wrap an aws-chunked body in a decoding, signature-validating stream.
///
/// `seed_signature`, `signing_key`, `amz_date` and `scope` come from the
/// verified seed (header) signature. The yielded bytes are the decoded
/// payload; a chunk whose signature does not match fails the stream with
/// `SignatureDoesNotMatch`.
pub fn wrap_signed_chunks(
    body: ByteStream,
    signing_key: Vec<u8>,
    seed_signature: String,
    amz_date: String,
    scope: String,
) -> ByteStream {
    let state = ChunkState {
        inner: body,
        buf: Vec::new(),
        signing_key,
        amz_date,
        scope,
        previous_signature: seed_signature,
        finished: false,
    };

    futures::stream::try_unfold(state, |mut st| async move {
        if st.finished {
            return Ok(None);
        }

        let meta = st.read_meta_line().await?;
        let (size, presented) = parse_chunk_meta(&meta)?;
        let data = st.read_data(size).await?;
        st.expect_crlf().await?;
        st.verify_chunk(&data, &presented)?;

        if size == 0 {
            st.finished = true;
            return Ok(None);
        }
        Ok(Some((data, st)))
    })
    .boxed()
}
