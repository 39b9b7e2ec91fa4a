//! Pipeline composition
//!
//! [`AuthSystem`] threads the process-wide authentication state (root
//! credential, region, stores, rejection counters) through the pipeline
//! stages: classification, the clock-skew gate, signature verification,
//! claims extraction, body-integrity binding, and policy authorization.

use crate::auth_type::{AuthType, is_supported_s3_auth_type, request_auth_type};
use crate::credentials::{Claims, Credential};
use crate::hash_reader;
use crate::policy::{
    ConditionValues, ExternalAuthorizer, PolicyArgs, PolicyStore, RetentionMode, action,
    condition_values,
};
use crate::request::{Body, GatewayRequest};
use crate::sigv2;
use crate::sigv4::{self, SERVICE_S3, SERVICE_STS};
use crate::store::CredentialStore;
use crate::streaming;
use crate::token;
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use reefgate_common::{ApiError, AuthConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Process-wide authentication state
///
/// Stateless per request; one instance is shared by every request task.
pub struct AuthSystem {
    config: AuthConfig,
    root: Credential,
    credentials: Arc<dyn CredentialStore>,
    policies: Arc<dyn PolicyStore>,
    external_authorizer: Option<Arc<dyn ExternalAuthorizer>>,
    rejected_auth: AtomicU64,
    rejected_time: AtomicU64,
}

impl AuthSystem {
    pub fn new(
        config: AuthConfig,
        credentials: Arc<dyn CredentialStore>,
        policies: Arc<dyn PolicyStore>,
    ) -> Self {
        let root = Credential::new(config.root_access_key.clone(), config.root_secret_key.clone());
        Self {
            config,
            root,
            credentials,
            policies,
            external_authorizer: None,
            rejected_auth: AtomicU64::new(0),
            rejected_time: AtomicU64::new(0),
        }
    }

    pub fn with_external_authorizer(mut self, authorizer: Arc<dyn ExternalAuthorizer>) -> Self {
        self.external_authorizer = Some(authorizer);
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn root(&self) -> &Credential {
        &self.root
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    pub fn credentials(&self) -> &dyn CredentialStore {
        self.credentials.as_ref()
    }

    pub fn policies(&self) -> &dyn PolicyStore {
        self.policies.as_ref()
    }

    pub fn has_external_authorizer(&self) -> bool {
        self.external_authorizer.is_some()
    }

    pub fn max_skew(&self) -> Duration {
        Duration::seconds(self.config.max_skew_secs as i64)
    }

    /// Requests rejected for unsupported authentication
    pub fn rejected_auth_requests(&self) -> u64 {
        self.rejected_auth.load(Ordering::Relaxed)
    }

    /// Requests rejected for clock skew or missing dates
    pub fn rejected_time_requests(&self) -> u64 {
        self.rejected_time.load(Ordering::Relaxed)
    }

    /// Admission gate run before any handler: classifies the request,
    /// enforces date freshness for signed requests, and rejects
    /// unsupported auth types outright.
    pub fn admit_request(&self, req: &mut GatewayRequest) -> Result<AuthType, ApiError> {
        let auth_type = request_auth_type(req);

        if matches!(
            auth_type,
            AuthType::Signed | AuthType::SignedV2 | AuthType::StreamingSigned
        ) {
            let date = match request_date(req) {
                Ok(date) => date,
                Err(e) => {
                    self.rejected_time.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };
            let now = Utc::now();
            let skew = self.max_skew();
            if now - date > skew || date - now > skew {
                self.rejected_time.fetch_add(1, Ordering::Relaxed);
                return Err(ApiError::RequestTimeTooSkewed);
            }
        }

        if is_supported_s3_auth_type(auth_type)
            || auth_type == AuthType::Jwt
            || auth_type == AuthType::Sts
        {
            return Ok(auth_type);
        }

        self.rejected_auth.fetch_add(1, Ordering::Relaxed);
        Err(ApiError::SignatureVersionNotSupported)
    }

    /// Verify the request signature and resolve the caller.
    ///
    /// Does not authorize, does not touch the body. JWT, STS, PostPolicy
    /// and anonymous requests resolve to the anonymous credential.
    pub async fn validate_signature(
        &self,
        req: &mut GatewayRequest,
    ) -> Result<(Credential, bool), ApiError> {
        let auth_type = request_auth_type(req);
        let (cred, owner) = match auth_type {
            AuthType::Unknown | AuthType::StreamingSigned => {
                return Err(ApiError::SignatureVersionNotSupported);
            }
            AuthType::SignedV2 => sigv2::does_sign_v2_match(self, req).await?,
            AuthType::PresignedV2 => sigv2::does_presign_v2_match(self, req).await?,
            AuthType::Signed => {
                let v = sigv4::does_signature_match(self, req, self.region(), SERVICE_S3).await?;
                (v.credential, v.owner)
            }
            AuthType::Presigned => {
                let v =
                    sigv4::does_presigned_signature_match(self, req, self.region(), SERVICE_S3)
                        .await?;
                (v.credential, v.owner)
            }
            _ => (Credential::default(), false),
        };

        let mut cred = cred;
        cred.claims = token::check_claims_from_token(self, req, &cred)?;
        Ok((cred, owner))
    }

    /// Authenticate the request for `action_name`: verify the signature,
    /// validate session-token claims, install the body-integrity binder,
    /// and for CreateBucket buffer the location constraint.
    pub async fn authenticate_request(
        &self,
        req: &mut GatewayRequest,
        action_name: &str,
    ) -> Result<(Credential, bool), ApiError> {
        let auth_type = request_auth_type(req);
        let (cred, owner) = match auth_type {
            AuthType::Unknown | AuthType::StreamingSigned => {
                return Err(ApiError::SignatureVersionNotSupported);
            }
            AuthType::SignedV2 => sigv2::does_sign_v2_match(self, req).await?,
            AuthType::PresignedV2 => sigv2::does_presign_v2_match(self, req).await?,
            AuthType::Signed | AuthType::Presigned => {
                // These actions verify against the empty region so that
                // global endpoints keep working across site regions.
                let region = match action_name {
                    action::GET_BUCKET_LOCATION | action::LIST_ALL_MY_BUCKETS => "",
                    _ => self.region(),
                };
                let v = if auth_type == AuthType::Signed {
                    sigv4::does_signature_match(self, req, region, SERVICE_S3).await?
                } else {
                    sigv4::does_presigned_signature_match(self, req, region, SERVICE_S3).await?
                };
                (v.credential, v.owner)
            }
            _ => (Credential::default(), false),
        };

        let mut cred = cred;
        cred.claims = token::check_claims_from_token(self, req, &cred)?;

        if matches!(auth_type, AuthType::Signed | AuthType::Presigned) {
            hash_reader::install_body_hasher(req, auth_type)?;
        }

        if action_name == action::CREATE_BUCKET {
            let constraint = hash_reader::parse_location_constraint(
                req,
                self.config.max_location_constraint_size,
            )
            .await?;
            if !constraint.is_empty() && constraint != self.config.region {
                return Err(ApiError::InvalidRegion);
            }
        }

        Ok((cred, owner))
    }

    /// Authorize an authenticated (or anonymous) caller for an action.
    ///
    /// Pure with respect to the request; safe to call repeatedly.
    pub async fn authorize_request(
        &self,
        req: &GatewayRequest,
        action_name: &str,
        cred: &Credential,
        owner: bool,
        bucket: &str,
        object: &str,
    ) -> Result<(), ApiError> {
        if action_name != action::LIST_ALL_MY_BUCKETS && cred.access_key.is_empty() {
            // Anonymous path: bucket policy only.
            let mut args = PolicyArgs {
                account: String::new(),
                groups: Vec::new(),
                action: action_name.to_string(),
                bucket: bucket.to_string(),
                object: object.to_string(),
                conditions: condition_values(req, "", "", None),
                is_owner: false,
                claims: Claims::new(),
            };
            if self.policies.bucket_allowed(&args).await {
                return Ok(());
            }
            if action_name == action::LIST_BUCKET_VERSIONS {
                // In AWS S3 the ListBucket permission covers
                // ListBucketVersions; verify as a fallback.
                args.action = action::LIST_BUCKET.to_string();
                if self.policies.bucket_allowed(&args).await {
                    return Ok(());
                }
            }
            return Err(ApiError::AccessDenied);
        }

        let mut args = PolicyArgs {
            account: cred.access_key.clone(),
            groups: cred.groups.clone(),
            action: action_name.to_string(),
            bucket: bucket.to_string(),
            object: object.to_string(),
            conditions: condition_values(req, "", &cred.access_key, Some(&cred.claims)),
            is_owner: owner,
            claims: cred.claims.clone(),
        };
        if self.policies.identity_allowed(&args).await {
            return Ok(());
        }
        if action_name == action::LIST_BUCKET_VERSIONS {
            args.action = action::LIST_BUCKET.to_string();
            if self.policies.identity_allowed(&args).await {
                return Ok(());
            }
        }
        Err(ApiError::AccessDenied)
    }

    /// Authenticate and authorize in one call, returning the caller.
    pub async fn check_request_auth_type_credential(
        &self,
        req: &mut GatewayRequest,
        action_name: &str,
        bucket: &str,
        object: &str,
    ) -> Result<(Credential, bool), ApiError> {
        let (cred, owner) = self.authenticate_request(req, action_name).await?;
        self.authorize_request(req, action_name, &cred, owner, bucket, object)
            .await?;
        Ok((cred, owner))
    }

    /// Authenticate and authorize in one call.
    pub async fn check_request_auth_type(
        &self,
        req: &mut GatewayRequest,
        action_name: &str,
        bucket: &str,
        object: &str,
    ) -> Result<(), ApiError> {
        self.check_request_auth_type_credential(req, action_name, bucket, object)
            .await
            .map(|_| ())
    }

    /// Verify a streaming upload's seed signature and wrap the body in the
    /// chunk-signature validating stream.
    pub async fn check_streaming_signature(
        &self,
        req: &mut GatewayRequest,
    ) -> Result<(Credential, bool), ApiError> {
        let v = sigv4::does_signature_match(self, req, self.region(), SERVICE_S3).await?;

        let mut cred = v.credential;
        cred.claims = token::check_claims_from_token(self, req, &cred)?;

        let body = req.body.take().into_stream();
        req.body = Body::from_stream(streaming::wrap_signed_chunks(
            body,
            v.signing_key,
            v.signature,
            v.amz_date,
            v.scope,
        ));

        Ok((cred, v.owner))
    }

    /// Verify an STS API request: V4 header auth under the "sts" service.
    pub async fn check_sts_signature(
        &self,
        req: &mut GatewayRequest,
    ) -> Result<(Credential, bool), ApiError> {
        let v = sigv4::does_signature_match(self, req, self.region(), SERVICE_STS).await?;
        let mut cred = v.credential;
        cred.claims = token::check_claims_from_token(self, req, &cred)?;
        Ok((cred, v.owner))
    }

    /// Admin APIs admit only V4 header signatures with a payload hash;
    /// presigned, V2, JWT and anonymous requests are rejected outright.
    pub async fn validate_admin_signature(
        &self,
        req: &mut GatewayRequest,
    ) -> Result<(Credential, bool), ApiError> {
        if !req.has_header("x-amz-content-sha256") || request_auth_type(req) != AuthType::Signed {
            warn!("admin request without a V4 header signature rejected");
            return Err(ApiError::AccessDenied);
        }

        let v = sigv4::does_signature_match(self, req, self.region(), SERVICE_S3).await?;
        let mut cred = v.credential;
        cred.claims = token::check_claims_from_token(self, req, &cred)?;
        hash_reader::install_body_hasher(req, AuthType::Signed)?;
        Ok((cred, v.owner))
    }

    /// Authenticate and authorize an administrative request.
    pub async fn check_admin_request_auth(
        &self,
        req: &mut GatewayRequest,
        admin_action: &str,
    ) -> Result<Credential, ApiError> {
        let (cred, owner) = self.validate_admin_signature(req).await?;

        let args = PolicyArgs {
            account: cred.access_key.clone(),
            groups: cred.groups.clone(),
            action: admin_action.to_string(),
            bucket: String::new(),
            object: String::new(),
            conditions: condition_values(req, "", &cred.access_key, Some(&cred.claims)),
            is_owner: owner,
            claims: cred.claims.clone(),
        };
        if self.policies.identity_allowed(&args).await {
            return Ok(cred);
        }
        Err(ApiError::AccessDenied)
    }

    /// Admission for object-lock retention writes.
    ///
    /// Permits when the caller may put retention, or when Governance mode
    /// is being bypassed and the caller holds the bypass permission.
    #[allow(clippy::too_many_arguments)]
    pub async fn is_put_retention_allowed(
        &self,
        req: &GatewayRequest,
        bucket: &str,
        object: &str,
        retention_days: i64,
        retain_until: Option<DateTime<Utc>>,
        retention_mode: Option<RetentionMode>,
        bypass_requested: bool,
        cred: &Credential,
        owner: bool,
    ) -> Result<(), ApiError> {
        if cred.access_key.is_empty() {
            return Err(ApiError::AccessDenied);
        }

        let mut conditions = condition_values(req, "", &cred.access_key, Some(&cred.claims));
        conditions.insert(
            "object-lock-mode".to_string(),
            vec![retention_mode.map(|m| m.as_str().to_string()).unwrap_or_default()],
        );
        conditions.insert(
            "object-lock-retain-until-date".to_string(),
            vec![
                retain_until
                    .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default(),
            ],
        );
        if retention_days > 0 {
            conditions.insert(
                "object-lock-remaining-retention-days".to_string(),
                vec![retention_days.to_string()],
            );
        }

        let args = |action_name: &str, conditions: ConditionValues| PolicyArgs {
            account: cred.access_key.clone(),
            groups: cred.groups.clone(),
            action: action_name.to_string(),
            bucket: bucket.to_string(),
            object: object.to_string(),
            conditions,
            is_owner: owner,
            claims: cred.claims.clone(),
        };

        let mut bypass_allowed = false;
        if retention_mode == Some(RetentionMode::Governance) && bypass_requested {
            bypass_allowed = self
                .policies
                .identity_allowed(&args(action::BYPASS_GOVERNANCE_RETENTION, conditions.clone()))
                .await;
        }

        let retention_allowed = self
            .policies
            .identity_allowed(&args(action::PUT_OBJECT_RETENTION, conditions))
            .await;

        if bypass_allowed || retention_allowed {
            return Ok(());
        }
        Err(ApiError::AccessDenied)
    }

    /// Admission for PUT operations: resolves the caller by access key and
    /// evaluates bucket or identity policy.
    pub async fn is_put_action_allowed(
        &self,
        req: &GatewayRequest,
        auth_type: AuthType,
        bucket: &str,
        object: &str,
        action_name: &str,
    ) -> Result<(), ApiError> {
        let (cred, owner) = match auth_type {
            AuthType::Unknown => return Err(ApiError::SignatureVersionNotSupported),
            AuthType::SignedV2 | AuthType::PresignedV2 => self.req_access_key_v2(req).await?,
            AuthType::StreamingSigned | AuthType::Presigned | AuthType::Signed => {
                self.req_access_key_v4(req).await?
            }
            _ => (Credential::default(), false),
        };

        // Do not check the retention permission when neither mode nor
        // retain-until date is set; a bucket default config may still
        // apply downstream.
        if action_name == action::PUT_OBJECT_RETENTION
            && req.header("x-amz-object-lock-mode").is_none()
            && req.header("x-amz-object-lock-retain-until-date").is_none()
        {
            return Ok(());
        }

        if cred.access_key.is_empty() {
            let args = PolicyArgs {
                account: String::new(),
                groups: cred.groups.clone(),
                action: action_name.to_string(),
                bucket: bucket.to_string(),
                object: object.to_string(),
                conditions: condition_values(req, "", "", None),
                is_owner: false,
                claims: Claims::new(),
            };
            if self.policies.bucket_allowed(&args).await {
                return Ok(());
            }
            return Err(ApiError::AccessDenied);
        }

        let args = PolicyArgs {
            account: cred.access_key.clone(),
            groups: cred.groups.clone(),
            action: action_name.to_string(),
            bucket: bucket.to_string(),
            object: object.to_string(),
            conditions: condition_values(req, "", &cred.access_key, Some(&cred.claims)),
            is_owner: owner,
            claims: cred.claims.clone(),
        };
        if self.policies.identity_allowed(&args).await {
            return Ok(());
        }
        Err(ApiError::AccessDenied)
    }

    /// Resolve the caller of a V4 request without verifying the signature.
    async fn req_access_key_v4(
        &self,
        req: &GatewayRequest,
    ) -> Result<(Credential, bool), ApiError> {
        let access_key = sigv4::request_access_key_v4(req)?;
        let mut cred = self.credentials.lookup(&access_key).await?;
        let owner = self.credentials.is_root(&access_key);
        cred.claims = token::check_claims_from_token(self, req, &cred)?;
        Ok((cred, owner))
    }

    /// Resolve the caller of a V2 request without verifying the signature.
    async fn req_access_key_v2(
        &self,
        req: &GatewayRequest,
    ) -> Result<(Credential, bool), ApiError> {
        let access_key = sigv2::request_access_key_v2(req)?;
        let mut cred = self.credentials.lookup(&access_key).await?;
        let owner = self.credentials.is_root(&access_key);
        cred.claims = token::check_claims_from_token(self, req, &cred)?;
        Ok((cred, owner))
    }
}

/// Whether the caller requested a governance-retention bypass.
pub fn bypass_governance_requested(req: &GatewayRequest) -> bool {
    req.header("x-amz-bypass-governance-retention")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Extract the request timestamp from `x-amz-date` or `Date`.
fn request_date(req: &GatewayRequest) -> Result<DateTime<Utc>, ApiError> {
    let value = req
        .header("x-amz-date")
        .or_else(|| req.header("date"))
        .ok_or(ApiError::MissingDateHeader)?;
    parse_request_date(value).ok_or(ApiError::MissingDateHeader)
}

/// Parse the date formats clients actually send: ISO8601 compact,
/// RFC 2822, and the common HTTP date.
fn parse_request_date(value: &str) -> Option<DateTime<Utc>> {
    if let Some(date) = sigv4::parse_amz_date(value) {
        return Some(date);
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT") {
        return Some(DateTime::<Utc>::from_naive_utc_and_offset(date, Utc));
    }
    None
}
