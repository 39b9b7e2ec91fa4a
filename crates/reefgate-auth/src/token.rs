//! Session token handling
//!
//! Temporary credentials and service accounts carry a JWT session token.
//! Tokens are signed with HMAC under the root secret (or the service
//! account's own secret) and embed claims, optionally including a base64
//! session policy that scopes the credential down.

use crate::credentials::{
    Claims, Credential, SESSION_POLICY_CLAIM, SESSION_POLICY_CLAIM_EXTRACTED, constant_time_eq,
    constant_time_eq_bytes,
};
use crate::handler::AuthSystem;
use crate::request::GatewayRequest;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64, engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reefgate_common::ApiError;
use sha2::{Sha256, Sha512};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Signing algorithm of a session token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAlgorithm {
    HS256,
    HS512,
}

impl TokenAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            TokenAlgorithm::HS256 => "HS256",
            TokenAlgorithm::HS512 => "HS512",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "HS256" => Some(TokenAlgorithm::HS256),
            "HS512" => Some(TokenAlgorithm::HS512),
            _ => None,
        }
    }

    fn sign(&self, secret: &str, input: &[u8]) -> Vec<u8> {
        match self {
            TokenAlgorithm::HS256 => {
                let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                    .expect("HMAC can take key of any size");
                mac.update(input);
                mac.finalize().into_bytes().to_vec()
            }
            TokenAlgorithm::HS512 => {
                let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
                    .expect("HMAC can take key of any size");
                mac.update(input);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// Sign claims into a session token
pub fn sign_claims(claims: &Claims, secret: &str, algorithm: TokenAlgorithm) -> String {
    let header = format!(r#"{{"alg":"{}","typ":"JWT"}}"#, algorithm.as_str());
    let payload = serde_json::to_string(claims).unwrap_or_else(|_| "{}".to_string());

    let signing_input = format!(
        "{}.{}",
        BASE64_URL.encode(header.as_bytes()),
        BASE64_URL.encode(payload.as_bytes())
    );
    let signature = algorithm.sign(secret, signing_input.as_bytes());

    format!("{}.{}", signing_input, BASE64_URL.encode(signature))
}

/// Decode a session token and verify its signature and expiry.
///
/// Any failure is reported as the coarse `Authentication` error; the
/// extractor never leaks which part of the token was wrong.
pub fn extract_claims(token: &str, secret: &str) -> Result<Claims, ApiError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(ApiError::Authentication);
    }

    let header_bytes = BASE64_URL
        .decode(parts[0])
        .map_err(|_| ApiError::Authentication)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| ApiError::Authentication)?;
    let algorithm = header
        .get("alg")
        .and_then(|v| v.as_str())
        .and_then(TokenAlgorithm::parse)
        .ok_or(ApiError::Authentication)?;

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let expected = algorithm.sign(secret, signing_input.as_bytes());
    let presented = BASE64_URL
        .decode(parts[2])
        .map_err(|_| ApiError::Authentication)?;
    if !constant_time_eq_bytes(&expected, &presented) {
        return Err(ApiError::Authentication);
    }

    let payload_bytes = BASE64_URL
        .decode(parts[1])
        .map_err(|_| ApiError::Authentication)?;
    let payload: serde_json::Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| ApiError::Authentication)?;
    let object = payload.as_object().ok_or(ApiError::Authentication)?;
    let claims = Claims::from_json_object(object);

    if let Some(exp) = claims.get("exp").and_then(|v| v.as_f64()) {
        if (exp as i64) < Utc::now().timestamp() {
            return Err(ApiError::Authentication);
        }
    }

    Ok(claims)
}

/// Fetch the security token set by the client.
pub fn session_token<'a>(req: &'a GatewayRequest) -> &'a str {
    if let Some(token) = req.header("x-amz-security-token") {
        if !token.is_empty() {
            return token;
        }
    }
    req.query_param("X-Amz-Security-Token").unwrap_or("")
}

/// Decode claims under `secret`, falling back to the root secret.
///
/// Session tokens are signed with the root secret so that clients cannot
/// decode them with their temporary secret keys and forge new claims. A
/// caller-supplied secret that fails is retried under the root secret,
/// unless the supplied secret already was the root secret.
pub fn claims_from_token_with_secret(
    ctx: &AuthSystem,
    token: &str,
    secret: &str,
) -> Result<Claims, ApiError> {
    let mut claims = match extract_claims(token, secret) {
        Ok(claims) => claims,
        Err(_) => {
            if constant_time_eq(secret, &ctx.root().secret_key) {
                return Err(ApiError::Authentication);
            }
            extract_claims(token, &ctx.root().secret_key)
                .map_err(|_| ApiError::Authentication)?
        }
    };

    // An external authorization engine consumes the raw claims.
    if ctx.has_external_authorizer() {
        return Ok(claims);
    }

    // Decode an embedded session policy, if any.
    if let Some(policy) = claims.lookup_str(SESSION_POLICY_CLAIM) {
        let decoded = BASE64.decode(policy).map_err(|e| {
            warn!(error = %e, "session policy base64 decode failed");
            ApiError::Authentication
        })?;
        let policy = String::from_utf8(decoded).map_err(|_| ApiError::Authentication)?;
        claims.insert(SESSION_POLICY_CLAIM_EXTRACTED, policy.as_str().into());
    }

    Ok(claims)
}

/// Decode claims under the root secret.
pub fn claims_from_token(ctx: &AuthSystem, token: &str) -> Result<Claims, ApiError> {
    claims_from_token_with_secret(ctx, token, &ctx.root().secret_key)
}

/// Best-effort claims fetch; empty claims on any error.
pub fn must_claims_from_token(ctx: &AuthSystem, req: &GatewayRequest) -> Claims {
    let token = session_token(req);
    if token.is_empty() {
        return Claims::new();
    }
    claims_from_token(ctx, token).unwrap_or_default()
}

/// Validate the session token presented with a request against the
/// resolved credential and extract its claims.
pub fn check_claims_from_token(
    ctx: &AuthSystem,
    req: &GatewayRequest,
    cred: &Credential,
) -> Result<Claims, ApiError> {
    let token = session_token(req);

    if !token.is_empty() && cred.access_key.is_empty() {
        // A security token is not allowed for anonymous access.
        return Err(ApiError::NoAccessKey);
    }

    if token.is_empty() && cred.is_temp() {
        // Temporary credentials always carry a security token.
        return Err(ApiError::InvalidToken);
    }

    if !token.is_empty() && !cred.is_temp() && !cred.is_service_account() {
        // A security token must not be presented for static credentials.
        return Err(ApiError::InvalidToken);
    }

    if cred.is_temp() && !constant_time_eq(token, &cred.session_token) {
        return Err(ApiError::InvalidToken);
    }

    let (token, secret) = if cred.is_service_account() {
        (cred.session_token.as_str(), cred.secret_key.as_str())
    } else {
        (token, ctx.root().secret_key.as_str())
    };

    if token.is_empty() {
        return Ok(Claims::new());
    }
    claims_from_token_with_secret(ctx, token, secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ClaimValue;
    use crate::policy::{MemoryPolicyStore, PolicyArgs};
    use crate::store::MemoryCredentialStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use http::Method;
    use reefgate_common::AuthConfig;
    use std::sync::Arc;

    const ROOT_ACCESS_KEY: &str = "AKIAROOT000000000000";
    const ROOT_SECRET_KEY: &str = "root-secret-key-for-token-tests";

    fn auth_system() -> AuthSystem {
        let config = AuthConfig::with_root(ROOT_ACCESS_KEY, ROOT_SECRET_KEY);
        let store = Arc::new(MemoryCredentialStore::new(Credential::new(
            ROOT_ACCESS_KEY,
            ROOT_SECRET_KEY,
        )));
        AuthSystem::new(config, store, Arc::new(MemoryPolicyStore::new()))
    }

    struct AllowAllAuthorizer;

    #[async_trait]
    impl crate::policy::ExternalAuthorizer for AllowAllAuthorizer {
        fn name(&self) -> &str {
            "allow-all"
        }

        async fn is_allowed(&self, _args: &PolicyArgs) -> Result<bool, ApiError> {
            Ok(true)
        }
    }

    fn request_with_token(token: &str) -> GatewayRequest {
        GatewayRequest::new(Method::GET, "/bucket/key".parse().unwrap())
            .with_header("x-amz-security-token", token)
    }

    #[test]
    fn test_sign_and_extract_roundtrip() {
        for algorithm in [TokenAlgorithm::HS256, TokenAlgorithm::HS512] {
            let mut claims = Claims::new();
            claims.insert("sub", ClaimValue::from("alice"));
            claims.insert("exp", ClaimValue::from((Utc::now().timestamp() + 3600) as f64));

            let token = sign_claims(&claims, "secret", algorithm);
            let decoded = extract_claims(&token, "secret").unwrap();
            assert_eq!(decoded.lookup_str("sub"), Some("alice"));
        }
    }

    #[test]
    fn test_extract_rejects_wrong_secret_and_garbage() {
        let claims = Claims::new();
        let token = sign_claims(&claims, "secret", TokenAlgorithm::HS256);
        assert_eq!(
            extract_claims(&token, "other-secret").unwrap_err(),
            ApiError::Authentication
        );
        assert_eq!(
            extract_claims("not-a-token", "secret").unwrap_err(),
            ApiError::Authentication
        );
        assert_eq!(
            extract_claims("a.b.c", "secret").unwrap_err(),
            ApiError::Authentication
        );
    }

    #[test]
    fn test_extract_rejects_expired() {
        let mut claims = Claims::new();
        claims.insert("exp", ClaimValue::from((Utc::now().timestamp() - 10) as f64));
        let token = sign_claims(&claims, "secret", TokenAlgorithm::HS256);
        assert_eq!(
            extract_claims(&token, "secret").unwrap_err(),
            ApiError::Authentication
        );
    }

    /// Embedding a base64 session policy round-trips into the extracted
    /// claim key.
    #[test]
    fn test_session_policy_extraction() {
        let ctx = auth_system();
        let policy = r#"{"Version":"2012-10-17","Statement":[]}"#;
        let mut claims = Claims::new();
        claims.insert(SESSION_POLICY_CLAIM, BASE64.encode(policy).as_str().into());

        let token = sign_claims(&claims, ROOT_SECRET_KEY, TokenAlgorithm::HS256);
        let extracted = claims_from_token(&ctx, &token).unwrap();
        assert_eq!(extracted.lookup_str(SESSION_POLICY_CLAIM_EXTRACTED), Some(policy));
    }

    #[test]
    fn test_session_policy_bad_base64_fails() {
        let ctx = auth_system();
        let mut claims = Claims::new();
        claims.insert(SESSION_POLICY_CLAIM, "!!!not-base64!!!".into());

        let token = sign_claims(&claims, ROOT_SECRET_KEY, TokenAlgorithm::HS256);
        assert_eq!(
            claims_from_token(&ctx, &token).unwrap_err(),
            ApiError::Authentication
        );
    }

    #[test]
    fn test_external_authorizer_skips_session_policy() {
        let ctx = auth_system().with_external_authorizer(Arc::new(AllowAllAuthorizer));
        let mut claims = Claims::new();
        claims.insert(SESSION_POLICY_CLAIM, "!!!not-base64!!!".into());

        // With an external engine the bad policy is passed through raw.
        let token = sign_claims(&claims, ROOT_SECRET_KEY, TokenAlgorithm::HS256);
        let extracted = claims_from_token(&ctx, &token).unwrap();
        assert_eq!(extracted.lookup_str(SESSION_POLICY_CLAIM), Some("!!!not-base64!!!"));
        assert!(extracted.lookup_str(SESSION_POLICY_CLAIM_EXTRACTED).is_none());
    }

    /// A non-root caller secret that fails falls back to the root secret;
    /// a failing secret that *is* the root secret does not retry.
    #[test]
    fn test_root_secret_retry() {
        let ctx = auth_system();
        let mut claims = Claims::new();
        claims.insert("sub", ClaimValue::from("svc"));
        let token = sign_claims(&claims, ROOT_SECRET_KEY, TokenAlgorithm::HS256);

        let extracted = claims_from_token_with_secret(&ctx, &token, "some-service-secret").unwrap();
        assert_eq!(extracted.lookup_str("sub"), Some("svc"));

        let token = sign_claims(&claims, "other-signer", TokenAlgorithm::HS256);
        assert_eq!(
            claims_from_token_with_secret(&ctx, &token, ROOT_SECRET_KEY).unwrap_err(),
            ApiError::Authentication
        );
    }

    #[test]
    fn test_check_claims_anonymous_with_token() {
        let ctx = auth_system();
        let req = request_with_token("some-token");
        assert_eq!(
            check_claims_from_token(&ctx, &req, &Credential::default()).unwrap_err(),
            ApiError::NoAccessKey
        );
    }

    #[test]
    fn test_check_claims_temp_without_token() {
        let ctx = auth_system();
        let req = GatewayRequest::new(Method::GET, "/bucket/key".parse().unwrap());
        let cred = Credential::temporary(
            "AKIATEMP",
            "secret",
            "token",
            Utc::now() + Duration::hours(1),
        );
        assert_eq!(
            check_claims_from_token(&ctx, &req, &cred).unwrap_err(),
            ApiError::InvalidToken
        );
    }

    #[test]
    fn test_check_claims_static_with_token() {
        let ctx = auth_system();
        let req = request_with_token("some-token");
        let cred = Credential::new("AKIASTATIC", "secret");
        assert_eq!(
            check_claims_from_token(&ctx, &req, &cred).unwrap_err(),
            ApiError::InvalidToken
        );
    }

    #[test]
    fn test_check_claims_temp_token_mismatch() {
        let ctx = auth_system();
        let mut claims = Claims::new();
        claims.insert("sub", ClaimValue::from("tmp"));
        let issued = sign_claims(&claims, ROOT_SECRET_KEY, TokenAlgorithm::HS256);
        let cred = Credential::temporary(
            "AKIATEMP",
            "secret",
            issued,
            Utc::now() + Duration::hours(1),
        );

        let req = request_with_token("arbitrary-bytes");
        assert_eq!(
            check_claims_from_token(&ctx, &req, &cred).unwrap_err(),
            ApiError::InvalidToken
        );
    }

    #[test]
    fn test_check_claims_temp_token_match() {
        let ctx = auth_system();
        let mut claims = Claims::new();
        claims.insert("sub", ClaimValue::from("tmp"));
        let issued = sign_claims(&claims, ROOT_SECRET_KEY, TokenAlgorithm::HS256);
        let cred = Credential::temporary(
            "AKIATEMP",
            "secret",
            issued.clone(),
            Utc::now() + Duration::hours(1),
        );

        let req = request_with_token(&issued);
        let extracted = check_claims_from_token(&ctx, &req, &cred).unwrap();
        assert_eq!(extracted.lookup_str("sub"), Some("tmp"));
    }

    #[test]
    fn test_check_claims_service_account_uses_own_secret() {
        let ctx = auth_system();
        let mut claims = Claims::new();
        claims.insert("parent", ClaimValue::from("alice"));
        let issued = sign_claims(&claims, "sa-secret", TokenAlgorithm::HS256);
        let cred = Credential::service_account("AKIASA", "sa-secret", "alice", issued);

        // Service accounts do not present the token on the wire.
        let req = GatewayRequest::new(Method::GET, "/bucket/key".parse().unwrap());
        let extracted = check_claims_from_token(&ctx, &req, &cred).unwrap();
        assert_eq!(extracted.lookup_str("parent"), Some("alice"));
    }

    #[test]
    fn test_check_claims_static_without_token() {
        let ctx = auth_system();
        let req = GatewayRequest::new(Method::GET, "/bucket/key".parse().unwrap());
        let cred = Credential::new("AKIASTATIC", "secret");
        let claims = check_claims_from_token(&ctx, &req, &cred).unwrap();
        assert!(claims.is_empty());
    }

    #[test]
    fn test_session_token_from_query() {
        let mut req = GatewayRequest::new(
            Method::GET,
            "/bucket/key?X-Amz-Security-Token=query-token".parse().unwrap(),
        );
        req.parse_form().unwrap();
        assert_eq!(session_token(&req), "query-token");

        let req = request_with_token("header-token");
        assert_eq!(session_token(&req), "header-token");
    }
}
