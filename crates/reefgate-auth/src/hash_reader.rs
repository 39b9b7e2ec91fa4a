//! Body-integrity binding
//!
//! Signed PUTs declare their payload digests up front. The binder wraps the
//! request body in a stream that updates SHA-256 and MD5 as bytes flow and
//! validates both at end of stream, so no handler can consume the body
//! without integrity checking.

use crate::auth_type::{AuthType, STREAMING_CONTENT_SHA256, UNSIGNED_PAYLOAD};
use crate::request::{Body, ByteStream, GatewayRequest, io_error};
use crate::sigv4::content_sha256;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures::StreamExt;
use md5::Md5;
use reefgate_common::ApiError;
use serde::Deserialize;
use sha2::{Digest, Sha256};

struct Hashers {
    sha256: Sha256,
    md5: Md5,
}

struct HashState {
    inner: ByteStream,
    hashers: Option<Hashers>,
    expected_sha256: Option<String>,
    expected_md5: Option<Vec<u8>>,
}

/// Wrap a byte stream so the declared digests are validated at EOF.
pub fn wrap_validating_body(
    body: ByteStream,
    expected_sha256: Option<String>,
    expected_md5: Option<Vec<u8>>,
) -> ByteStream {
    let state = HashState {
        inner: body,
        hashers: Some(Hashers {
            sha256: Sha256::new(),
            md5: Md5::new(),
        }),
        expected_sha256,
        expected_md5,
    };

    futures::stream::try_unfold(state, |mut st| async move {
        match st.inner.next().await {
            Some(Err(e)) => Err(e),
            Some(Ok(chunk)) => {
                if let Some(hashers) = st.hashers.as_mut() {
                    hashers.sha256.update(&chunk);
                    hashers.md5.update(&chunk);
                }
                Ok(Some((chunk, st)))
            }
            None => {
                let Some(hashers) = st.hashers.take() else {
                    return Ok(None);
                };
                if let Some(expected) = &st.expected_md5 {
                    let computed = hashers.md5.finalize();
                    if computed.as_slice() != expected.as_slice() {
                        return Err(io_error(ApiError::BadDigest));
                    }
                }
                if let Some(expected) = &st.expected_sha256 {
                    let computed = hex::encode(hashers.sha256.finalize());
                    if &computed != expected {
                        return Err(io_error(ApiError::ContentSha256Mismatch));
                    }
                }
                Ok(None)
            }
        }
    })
    .boxed()
}

/// Decode and validate the Content-MD5 header, if present.
pub fn content_md5_decoded(req: &GatewayRequest) -> Result<Option<Vec<u8>>, ApiError> {
    let Some(header) = req.header("content-md5") else {
        return Ok(None);
    };
    let decoded = BASE64.decode(header).map_err(|_| ApiError::InvalidDigest)?;
    if decoded.len() != 16 {
        return Err(ApiError::InvalidDigest);
    }
    Ok(Some(decoded))
}

/// Whether the declared payload hash opts out of SHA-256 verification.
pub fn skip_content_sha256(req: &GatewayRequest, auth_type: AuthType) -> bool {
    let declared = content_sha256(req, auth_type);
    declared == UNSIGNED_PAYLOAD || declared == STREAMING_CONTENT_SHA256
}

/// Install the validating reader over the request body.
///
/// Called after signature verification for Signed and Presigned requests;
/// downstream readers see a transparently validating stream.
pub fn install_body_hasher(req: &mut GatewayRequest, auth_type: AuthType) -> Result<(), ApiError> {
    let expected_md5 = content_md5_decoded(req)?;

    let expected_sha256 = if skip_content_sha256(req, auth_type) {
        None
    } else {
        let declared = content_sha256(req, auth_type).to_lowercase();
        if declared.len() != 64 || !declared.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ApiError::ContentSha256Mismatch);
        }
        Some(declared)
    };

    if expected_md5.is_none() && expected_sha256.is_none() {
        return Ok(());
    }

    let body = req.body.take().into_stream();
    req.body = Body::from_stream(wrap_validating_body(body, expected_sha256, expected_md5));
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename = "CreateBucketConfiguration")]
struct CreateBucketConfiguration {
    #[serde(rename = "LocationConstraint")]
    location_constraint: Option<String>,
}

/// Buffer a CreateBucket body to extract the location constraint, then
/// restore the body for the handler.
///
/// An empty body means the default region. The buffered read flows through
/// any installed integrity binder, so digests are validated here as well.
pub async fn parse_location_constraint(
    req: &mut GatewayRequest,
    max_size: usize,
) -> Result<String, ApiError> {
    let payload = req.body.take().read_all(max_size).await?;

    let region = if payload.is_empty() {
        String::new()
    } else {
        let text = std::str::from_utf8(&payload).map_err(|_| ApiError::MalformedXml)?;
        let config: CreateBucketConfiguration =
            quick_xml::de::from_str(text).map_err(|_| ApiError::MalformedXml)?;
        config.location_constraint.unwrap_or_default()
    };

    req.body = Body::from_bytes(payload);
    Ok(region)
}
