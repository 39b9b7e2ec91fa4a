//! S3 API error taxonomy
//!
//! Every stage of the request pipeline returns an [`ApiError`] on failure;
//! the first non-OK error terminates the pipeline and is rendered to the
//! client as the canonical S3 XML error body.

use serde::Serialize;
use thiserror::Error;

/// Common result type for pipeline operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// S3 API error codes surfaced by the authentication pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("the requested signature version is not supported")]
    SignatureVersionNotSupported,

    #[error("a valid Date or x-amz-date header is required for signed requests")]
    MissingDateHeader,

    #[error("the difference between the request time and the server's time is too large")]
    RequestTimeTooSkewed,

    #[error("the request signature we calculated does not match the signature you provided")]
    SignatureDoesNotMatch,

    #[error("request has expired")]
    ExpiredPresignRequest,

    #[error("request is not valid yet")]
    RequestNotReadyYet,

    #[error("the access key ID you provided does not exist in our records")]
    InvalidAccessKeyId,

    #[error("no AWSAccessKey was presented")]
    NoAccessKey,

    #[error("the provided token is malformed or otherwise invalid")]
    InvalidToken,

    #[error("authentication failed")]
    Authentication,

    #[error("the provided x-amz-content-sha256 header does not match what was computed")]
    ContentSha256Mismatch,

    #[error("the Content-MD5 you specified did not match what we received")]
    BadDigest,

    #[error("the Content-MD5 you specified is not valid")]
    InvalidDigest,

    #[error("the XML you provided was not well-formed or did not validate")]
    MalformedXml,

    #[error("access denied")]
    AccessDenied,

    #[error("the POST request fields or body are malformed")]
    MalformedPostRequest,

    #[error("the authorization header is malformed")]
    AuthorizationHeaderMalformed,

    #[error("error parsing the X-Amz-Credential parameter; the credential is mis-formatted")]
    CredMalformed,

    #[error("invalid date format in request")]
    MalformedDate,

    #[error("X-Amz-Expires should be a number")]
    MalformedExpires,

    #[error("X-Amz-Expires must be non-negative")]
    NegativeExpires,

    #[error("X-Amz-Expires must be less than a week")]
    MaximumExpires,

    #[error("there were headers present in the request which were not signed")]
    UnsignedHeaders,

    #[error("missing fields in request")]
    MissingFields,

    #[error("missing Credential field for this request")]
    MissingCredTag,

    #[error("missing SignedHeaders field for this request")]
    MissingSignHeadersTag,

    #[error("missing Signature field for this request")]
    MissingSignTag,

    #[error("the region is wrong for this request")]
    InvalidRegion,

    #[error("query parameter values could not be parsed")]
    InvalidQueryParams,

    #[error("your proposed upload exceeds the maximum allowed object size")]
    EntityTooLarge,

    #[error("your proposed upload is smaller than the minimum allowed object size")]
    EntityTooSmall,

    #[error("we encountered an internal error, please try again")]
    InternalError,
}

impl ApiError {
    /// HTTP status code for this error, per the S3 API
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::SignatureVersionNotSupported
            | Self::MissingDateHeader
            | Self::NoAccessKey
            | Self::InvalidToken
            | Self::ContentSha256Mismatch
            | Self::BadDigest
            | Self::InvalidDigest
            | Self::MalformedXml
            | Self::MalformedPostRequest
            | Self::AuthorizationHeaderMalformed
            | Self::CredMalformed
            | Self::MalformedDate
            | Self::MalformedExpires
            | Self::NegativeExpires
            | Self::MaximumExpires
            | Self::UnsignedHeaders
            | Self::MissingFields
            | Self::MissingCredTag
            | Self::MissingSignHeadersTag
            | Self::MissingSignTag
            | Self::InvalidRegion
            | Self::InvalidQueryParams
            | Self::EntityTooLarge
            | Self::EntityTooSmall => 400,

            Self::RequestTimeTooSkewed
            | Self::SignatureDoesNotMatch
            | Self::ExpiredPresignRequest
            | Self::RequestNotReadyYet
            | Self::InvalidAccessKeyId
            | Self::Authentication
            | Self::AccessDenied => 403,

            Self::InternalError => 500,
        }
    }

    /// S3 error code string for this error
    #[must_use]
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::SignatureVersionNotSupported => "SignatureVersionNotSupported",
            Self::MissingDateHeader => "AccessDenied",
            Self::RequestTimeTooSkewed => "RequestTimeTooSkewed",
            Self::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            Self::ExpiredPresignRequest => "AccessDenied",
            Self::RequestNotReadyYet => "AccessDenied",
            Self::InvalidAccessKeyId => "InvalidAccessKeyId",
            Self::NoAccessKey => "AccessDenied",
            Self::InvalidToken => "InvalidTokenId",
            Self::Authentication => "AccessDenied",
            Self::ContentSha256Mismatch => "XAmzContentSHA256Mismatch",
            Self::BadDigest => "BadDigest",
            Self::InvalidDigest => "InvalidDigest",
            Self::MalformedXml => "MalformedXML",
            Self::AccessDenied => "AccessDenied",
            Self::MalformedPostRequest => "MalformedPOSTRequest",
            Self::AuthorizationHeaderMalformed => "AuthorizationHeaderMalformed",
            Self::CredMalformed => "AuthorizationQueryParametersError",
            Self::MalformedDate => "MalformedDate",
            Self::MalformedExpires => "AuthorizationQueryParametersError",
            Self::NegativeExpires => "AuthorizationQueryParametersError",
            Self::MaximumExpires => "AuthorizationQueryParametersError",
            Self::UnsignedHeaders => "AccessDenied",
            Self::MissingFields => "MissingFields",
            Self::MissingCredTag => "InvalidRequest",
            Self::MissingSignHeadersTag => "InvalidArgument",
            Self::MissingSignTag => "AccessDenied",
            Self::InvalidRegion => "InvalidRegion",
            Self::InvalidQueryParams => "InvalidArgument",
            Self::EntityTooLarge => "EntityTooLarge",
            Self::EntityTooSmall => "EntityTooSmall",
            Self::InternalError => "InternalError",
        }
    }

    /// Render the canonical S3 XML error body for this error
    #[must_use]
    pub fn to_xml(&self, resource: &str, request_id: &str) -> String {
        let body = ErrorResponse {
            code: self.s3_error_code(),
            message: self.to_string(),
            resource,
            request_id,
        };
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}",
            quick_xml::se::to_string(&body).unwrap_or_default()
        )
    }
}

/// Serialized form of the S3 error body
#[derive(Serialize)]
#[serde(rename = "Error")]
struct ErrorResponse<'a> {
    #[serde(rename = "Code")]
    code: &'a str,
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "Resource")]
    resource: &'a str,
    #[serde(rename = "RequestId")]
    request_id: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::SignatureVersionNotSupported.http_status_code(), 400);
        assert_eq!(ApiError::RequestTimeTooSkewed.http_status_code(), 403);
        assert_eq!(ApiError::SignatureDoesNotMatch.http_status_code(), 403);
        assert_eq!(ApiError::InvalidToken.http_status_code(), 400);
        assert_eq!(ApiError::BadDigest.http_status_code(), 400);
        assert_eq!(ApiError::AccessDenied.http_status_code(), 403);
        assert_eq!(ApiError::InternalError.http_status_code(), 500);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::InvalidAccessKeyId.s3_error_code(), "InvalidAccessKeyId");
        assert_eq!(
            ApiError::ContentSha256Mismatch.s3_error_code(),
            "XAmzContentSHA256Mismatch"
        );
        assert_eq!(ApiError::MalformedXml.s3_error_code(), "MalformedXML");
    }

    #[test]
    fn test_xml_body() {
        let xml = ApiError::AccessDenied.to_xml("/mybucket/mykey", "req-1234");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Code>AccessDenied</Code>"));
        assert!(xml.contains("<Resource>/mybucket/mykey</Resource>"));
        assert!(xml.contains("<RequestId>req-1234</RequestId>"));
    }
}
