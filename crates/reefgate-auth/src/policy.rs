//! Policy evaluation interfaces
//!
//! The pipeline evaluates bucket policy for anonymous callers and identity
//! policy for authenticated callers; both are consumed through the
//! [`PolicyStore`] trait. [`PolicyArgs`] carries everything a policy engine
//! needs to decide a single request.

use crate::credentials::{ClaimValue, Claims};
use crate::request::GatewayRequest;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use regex::Regex;
use reefgate_common::ApiError;
use std::collections::HashMap;

/// S3 action names used by the pipeline
pub mod action {
    pub const GET_OBJECT: &str = "s3:GetObject";
    pub const PUT_OBJECT: &str = "s3:PutObject";
    pub const DELETE_OBJECT: &str = "s3:DeleteObject";
    pub const LIST_BUCKET: &str = "s3:ListBucket";
    pub const LIST_BUCKET_VERSIONS: &str = "s3:ListBucketVersions";
    pub const LIST_ALL_MY_BUCKETS: &str = "s3:ListAllMyBuckets";
    pub const CREATE_BUCKET: &str = "s3:CreateBucket";
    pub const DELETE_BUCKET: &str = "s3:DeleteBucket";
    pub const GET_BUCKET_LOCATION: &str = "s3:GetBucketLocation";
    pub const PUT_OBJECT_RETENTION: &str = "s3:PutObjectRetention";
    pub const GET_OBJECT_RETENTION: &str = "s3:GetObjectRetention";
    pub const BYPASS_GOVERNANCE_RETENTION: &str = "s3:BypassGovernanceRetention";
}

/// Administrative action names; a namespace disjoint from S3 actions
pub mod admin_action {
    pub const CREATE_USER: &str = "admin:CreateUser";
    pub const DELETE_USER: &str = "admin:DeleteUser";
    pub const LIST_USERS: &str = "admin:ListUsers";
    pub const SERVER_INFO: &str = "admin:ServerInfo";
    pub const CONFIG_UPDATE: &str = "admin:ConfigUpdate";
}

/// Per-request facts evaluated against policy conditions
pub type ConditionValues = HashMap<String, Vec<String>>;

/// Object-lock retention mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionMode {
    Governance,
    Compliance,
}

impl RetentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionMode::Governance => "GOVERNANCE",
            RetentionMode::Compliance => "COMPLIANCE",
        }
    }
}

/// Arguments for a single policy decision
#[derive(Debug, Clone, Default)]
pub struct PolicyArgs {
    pub account: String,
    pub groups: Vec<String>,
    pub action: String,
    pub bucket: String,
    pub object: String,
    pub conditions: ConditionValues,
    pub is_owner: bool,
    pub claims: Claims,
}

/// Build the condition values for a request.
///
/// Single-valued facts come from headers and the clock; the account's
/// string claims and groups are folded in for authenticated callers.
pub fn condition_values(
    req: &GatewayRequest,
    region: &str,
    account: &str,
    claims: Option<&Claims>,
) -> ConditionValues {
    let mut values = ConditionValues::new();

    if let Some(referer) = req.header("referer") {
        values.insert("aws:Referer".to_string(), vec![referer.to_string()]);
    }
    if let Some(ip) = req.remote_addr {
        values.insert("aws:SourceIp".to_string(), vec![ip.to_string()]);
    }

    let now = Utc::now();
    values.insert(
        "aws:CurrentTime".to_string(),
        vec![now.to_rfc3339_opts(SecondsFormat::Secs, true)],
    );
    values.insert("aws:EpochTime".to_string(), vec![now.timestamp().to_string()]);

    if !region.is_empty() {
        values.insert("aws:Region".to_string(), vec![region.to_string()]);
    }
    if !account.is_empty() {
        values.insert("aws:username".to_string(), vec![account.to_string()]);
        values.insert("aws:userid".to_string(), vec![account.to_string()]);
    }

    if let Some(claims) = claims {
        for (key, value) in claims.iter() {
            if let ClaimValue::String(s) = value {
                values.entry(key.clone()).or_insert_with(|| vec![s.clone()]);
            }
        }
    }

    values
}

/// Decides policy for the pipeline
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Evaluate bucket policy (anonymous path).
    async fn bucket_allowed(&self, args: &PolicyArgs) -> bool;

    /// Evaluate identity policy (authenticated path).
    async fn identity_allowed(&self, args: &PolicyArgs) -> bool;
}

/// Optional external authorization engine
///
/// When configured, session-policy post-processing in the claims extractor
/// is skipped and the raw claims are handed through.
#[async_trait]
pub trait ExternalAuthorizer: Send + Sync {
    /// Engine name for logging
    fn name(&self) -> &str;

    /// Evaluate the request against the external engine.
    async fn is_allowed(&self, args: &PolicyArgs) -> Result<bool, ApiError>;
}

/// A single allow rule of the in-memory policy store
#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Account the rule applies to; `None` matches any caller
    pub account: Option<String>,
    /// Action pattern, `*` wildcards allowed (e.g. `s3:Get*`)
    pub action: String,
    /// Bucket pattern, `*` wildcards allowed
    pub bucket: String,
}

impl PolicyRule {
    pub fn new(account: Option<&str>, action: &str, bucket: &str) -> Self {
        Self {
            account: account.map(str::to_string),
            action: action.to_string(),
            bucket: bucket.to_string(),
        }
    }

    fn matches(&self, args: &PolicyArgs) -> bool {
        if let Some(account) = &self.account {
            if account != &args.account {
                return false;
            }
        }
        matches_pattern(&self.action, &args.action) && matches_pattern(&self.bucket, &args.bucket)
    }
}

/// Match a pattern with wildcards (* and ?)
fn matches_pattern(pattern: &str, value: &str) -> bool {
    let regex_pattern = pattern
        .replace('.', r"\.")
        .replace('*', ".*")
        .replace('?', ".");

    let regex_pattern = format!("^{}$", regex_pattern);

    match Regex::new(&regex_pattern) {
        Ok(re) => re.is_match(value),
        Err(_) => pattern == value,
    }
}

/// In-memory policy store: a flat list of allow rules per stage
#[derive(Default)]
pub struct MemoryPolicyStore {
    bucket_rules: RwLock<Vec<PolicyRule>>,
    identity_rules: RwLock<Vec<PolicyRule>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_bucket(&self, rule: PolicyRule) {
        self.bucket_rules.write().push(rule);
    }

    pub fn allow_identity(&self, rule: PolicyRule) {
        self.identity_rules.write().push(rule);
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn bucket_allowed(&self, args: &PolicyArgs) -> bool {
        self.bucket_rules.read().iter().any(|r| r.matches(args))
    }

    async fn identity_allowed(&self, args: &PolicyArgs) -> bool {
        self.identity_rules.read().iter().any(|r| r.matches(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("s3:*", "s3:GetObject"));
        assert!(matches_pattern("s3:Get*", "s3:GetObject"));
        assert!(!matches_pattern("s3:Get*", "s3:PutObject"));
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("my-bucket", "my-bucket"));
    }

    #[tokio::test]
    async fn test_rule_matching() {
        let store = MemoryPolicyStore::new();
        store.allow_bucket(PolicyRule::new(None, action::LIST_BUCKET, "public-*"));
        store.allow_identity(PolicyRule::new(Some("alice"), "s3:*", "alice-data"));

        let args = PolicyArgs {
            action: action::LIST_BUCKET.to_string(),
            bucket: "public-photos".to_string(),
            ..Default::default()
        };
        assert!(store.bucket_allowed(&args).await);
        assert!(!store.identity_allowed(&args).await);

        let args = PolicyArgs {
            account: "alice".to_string(),
            action: action::PUT_OBJECT.to_string(),
            bucket: "alice-data".to_string(),
            ..Default::default()
        };
        assert!(store.identity_allowed(&args).await);

        let args = PolicyArgs {
            account: "bob".to_string(),
            action: action::PUT_OBJECT.to_string(),
            bucket: "alice-data".to_string(),
            ..Default::default()
        };
        assert!(!store.identity_allowed(&args).await);
    }

    #[test]
    fn test_condition_values() {
        let req = GatewayRequest::new(Method::GET, "/bucket".parse().unwrap())
            .with_header("referer", "https://example.com/")
            .with_remote_addr("10.1.2.3".parse().unwrap());

        let mut claims = Claims::new();
        claims.insert("preferred_username", ClaimValue::from("alice"));
        claims.insert("exp", ClaimValue::from(1716508800.0));

        let values = condition_values(&req, "", "AKIAALICE", Some(&claims));
        assert_eq!(values.get("aws:Referer").unwrap(), &vec!["https://example.com/".to_string()]);
        assert_eq!(values.get("aws:SourceIp").unwrap(), &vec!["10.1.2.3".to_string()]);
        assert_eq!(values.get("aws:username").unwrap(), &vec!["AKIAALICE".to_string()]);
        assert_eq!(values.get("preferred_username").unwrap(), &vec!["alice".to_string()]);
        // only string claims become condition values
        assert!(!values.contains_key("exp"));
        assert!(values.contains_key("aws:CurrentTime"));
    }

    #[test]
    fn test_retention_mode() {
        assert_eq!(RetentionMode::Governance.as_str(), "GOVERNANCE");
        assert_eq!(RetentionMode::Compliance.as_str(), "COMPLIANCE");
    }
}
