//! Credential Store & Resolver (§4.1).
//!
//! A `Credential` is a tagged variant, shared-immutable once created. Stores
//! map a reference to a concrete secret; the `CredentialResolver` (see
//! `resolver.rs`) adds the deadline-aware cache on top.

mod resolver;

pub use resolver::{CredentialResolver, ResolverConfig};

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::CredentialError;

/// Either a string or integer reference; integers are stringified for the
/// cache key, per §4.1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialRef(pub String);

impl From<&str> for CredentialRef {
    fn from(s: &str) -> Self {
        CredentialRef(s.to_string())
    }
}

impl From<String> for CredentialRef {
    fn from(s: String) -> Self {
        CredentialRef(s)
    }
}

impl From<i64> for CredentialRef {
    fn from(n: i64) -> Self {
        CredentialRef(n.to_string())
    }
}

impl std::fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resolved credential. Shared-immutable after creation; carries an
/// optional expiry that the cache must honour (§3).
#[derive(Debug, Clone)]
pub enum Credential {
    Simple {
        api_key: String,
        expires_at: Option<SystemTime>,
    },
    Bearer {
        token: String,
        expires_at: Option<SystemTime>,
    },
    Aws {
        region: String,
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
        use_instance_profile: bool,
        use_web_identity: bool,
        role_arn: Option<String>,
        expires_at: Option<SystemTime>,
    },
}

impl Credential {
    pub fn expires_at(&self) -> Option<SystemTime> {
        match self {
            Credential::Simple { expires_at, .. } => *expires_at,
            Credential::Bearer { expires_at, .. } => *expires_at,
            Credential::Aws { expires_at, .. } => *expires_at,
        }
    }

    /// A credential whose `expires_at < now` must never be returned from
    /// cache (§3, §8 P9).
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at().is_some_and(|exp| exp < now)
    }

    /// `authHeaders()` — the header map this credential injects (§3, §4.2).
    /// AWS credentials sign per-request (see `adapters::sigv4`) rather than
    /// emitting a static header, so this returns an empty map for that case.
    pub fn auth_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        match self {
            Credential::Simple { api_key, .. } => {
                headers.insert("Authorization".to_string(), format!("Bearer {api_key}"));
            }
            Credential::Bearer { token, .. } => {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            Credential::Aws { .. } => {}
        }
        headers
    }
}

/// Configuration for a single credential store entry, as named in the
/// gateway's configuration document (§6.3).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialStoreConfig {
    Simple {
        source: SimpleSource,
        #[serde(default)]
        cache_ttl_secs: Option<u64>,
    },
    Aws {
        #[serde(default)]
        region_var: Option<String>,
        #[serde(default)]
        access_key_id_var: Option<String>,
        #[serde(default)]
        secret_access_key_var: Option<String>,
        #[serde(default)]
        session_token_var: Option<String>,
        #[serde(default)]
        use_instance_profile: bool,
        #[serde(default)]
        use_web_identity: bool,
        #[serde(default)]
        web_identity_token_file: Option<String>,
        #[serde(default)]
        role_arn: Option<String>,
        #[serde(default)]
        cache_ttl_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimpleSource {
    Env { api_key_var: String },
    File { path: String },
}

/// A store knows how to fetch the concrete secret for a reference. One
/// instance is registered per reference in the gateway configuration.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn fetch(&self, reference: &CredentialRef) -> Result<Credential, CredentialError>;

    /// `validate(ref) -> {valid, error?}` (§4.1).
    fn validate(&self) -> Result<(), CredentialError>;

    /// TTL this store recommends be applied to cache entries it produces,
    /// when it doesn't itself report an `expiresAt` on the credential.
    fn default_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }
}

/// Reads an environment variable or a file for a plain API key / bearer
/// token. `validate` only checks configuration shape, not secret presence at
/// runtime (the read itself may legitimately race process startup).
pub struct SimpleStore {
    source: SimpleSource,
    cache_ttl: Option<std::time::Duration>,
}

impl SimpleStore {
    pub fn new(config: &CredentialStoreConfig) -> Result<Self, CredentialError> {
        match config {
            CredentialStoreConfig::Simple {
                source,
                cache_ttl_secs,
            } => Ok(Self {
                source: source.clone(),
                cache_ttl: cache_ttl_secs.map(std::time::Duration::from_secs),
            }),
            _ => Err(CredentialError::ValidationFailed(
                "simple".to_string(),
                "expected a simple store config".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CredentialStore for SimpleStore {
    async fn fetch(&self, reference: &CredentialRef) -> Result<Credential, CredentialError> {
        let key = match &self.source {
            SimpleSource::Env { api_key_var } => {
                std::env::var(api_key_var).map_err(|_| {
                    CredentialError::StoreFailed(
                        reference.to_string(),
                        format!("environment variable '{api_key_var}' is not set"),
                    )
                })?
            }
            SimpleSource::File { path } => std::fs::read_to_string(path)
                .map_err(|e| {
                    CredentialError::StoreFailed(reference.to_string(), format!("{e}"))
                })?
                .trim()
                .to_string(),
        };
        Ok(Credential::Simple {
            api_key: key,
            expires_at: None,
        })
    }

    fn validate(&self) -> Result<(), CredentialError> {
        match &self.source {
            SimpleSource::Env { api_key_var } if api_key_var.is_empty() => Err(
                CredentialError::ValidationFailed("simple".to_string(), "empty env var name".to_string()),
            ),
            SimpleSource::File { path } if path.is_empty() => Err(CredentialError::ValidationFailed(
                "simple".to_string(),
                "empty file path".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn default_ttl(&self) -> std::time::Duration {
        self.cache_ttl.unwrap_or(std::time::Duration::from_secs(300))
    }
}

/// Emits AWS credential material: static key/secret, instance profile,
/// or web-identity token. SigV4 signing itself lives in `adapters::sigv4`.
pub struct AwsStore {
    region_var: String,
    access_key_id_var: Option<String>,
    secret_access_key_var: Option<String>,
    session_token_var: Option<String>,
    use_instance_profile: bool,
    use_web_identity: bool,
    web_identity_token_file: Option<String>,
    role_arn: Option<String>,
    cache_ttl: Option<std::time::Duration>,
}

impl AwsStore {
    pub fn new(config: &CredentialStoreConfig) -> Result<Self, CredentialError> {
        match config {
            CredentialStoreConfig::Aws {
                region_var,
                access_key_id_var,
                secret_access_key_var,
                session_token_var,
                use_instance_profile,
                use_web_identity,
                web_identity_token_file,
                role_arn,
                cache_ttl_secs,
            } => Ok(Self {
                region_var: region_var.clone().unwrap_or_else(|| "AWS_REGION".to_string()),
                access_key_id_var: access_key_id_var.clone(),
                secret_access_key_var: secret_access_key_var.clone(),
                session_token_var: session_token_var.clone(),
                use_instance_profile: *use_instance_profile,
                use_web_identity: *use_web_identity,
                web_identity_token_file: web_identity_token_file.clone(),
                role_arn: role_arn.clone(),
                cache_ttl: cache_ttl_secs.map(std::time::Duration::from_secs),
            }),
            _ => Err(CredentialError::ValidationFailed(
                "aws".to_string(),
                "expected an aws store config".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CredentialStore for AwsStore {
    async fn fetch(&self, reference: &CredentialRef) -> Result<Credential, CredentialError> {
        let region = std::env::var(&self.region_var).map_err(|_| {
            CredentialError::StoreFailed(
                reference.to_string(),
                format!("region variable '{}' is not set", self.region_var),
            )
        })?;

        if self.use_web_identity {
            let token_file = self.web_identity_token_file.as_ref().ok_or_else(|| {
                CredentialError::ValidationFailed(
                    reference.to_string(),
                    "use_web_identity set but web_identity_token_file is missing".to_string(),
                )
            })?;
            // The presence of a readable token file is all this layer verifies;
            // actual STS exchange is an upstream-call concern outside this core.
            std::fs::metadata(token_file).map_err(|e| {
                CredentialError::StoreFailed(reference.to_string(), format!("{e}"))
            })?;
            return Ok(Credential::Aws {
                region,
                access_key_id: String::new(),
                secret_access_key: String::new(),
                session_token: None,
                use_instance_profile: false,
                use_web_identity: true,
                role_arn: self.role_arn.clone(),
                expires_at: None,
            });
        }

        if self.use_instance_profile {
            return Ok(Credential::Aws {
                region,
                access_key_id: String::new(),
                secret_access_key: String::new(),
                session_token: None,
                use_instance_profile: true,
                use_web_identity: false,
                role_arn: self.role_arn.clone(),
                expires_at: None,
            });
        }

        let access_key_id_var = self.access_key_id_var.as_deref().ok_or_else(|| {
            CredentialError::ValidationFailed(
                reference.to_string(),
                "access_key_id_var is required unless an instance/web-identity profile is used"
                    .to_string(),
            )
        })?;
        let secret_access_key_var = self.secret_access_key_var.as_deref().ok_or_else(|| {
            CredentialError::ValidationFailed(
                reference.to_string(),
                "secret_access_key_var is required unless an instance/web-identity profile is used"
                    .to_string(),
            )
        })?;

        let access_key_id = std::env::var(access_key_id_var).map_err(|_| {
            CredentialError::StoreFailed(
                reference.to_string(),
                format!("variable '{access_key_id_var}' is not set"),
            )
        })?;
        let secret_access_key = std::env::var(secret_access_key_var).map_err(|_| {
            CredentialError::StoreFailed(
                reference.to_string(),
                format!("variable '{secret_access_key_var}' is not set"),
            )
        })?;
        let session_token = self
            .session_token_var
            .as_deref()
            .and_then(|v| std::env::var(v).ok());

        Ok(Credential::Aws {
            region,
            access_key_id,
            secret_access_key,
            session_token,
            use_instance_profile: false,
            use_web_identity: false,
            role_arn: self.role_arn.clone(),
            expires_at: None,
        })
    }

    fn validate(&self) -> Result<(), CredentialError> {
        if self.region_var.is_empty() {
            return Err(CredentialError::ValidationFailed(
                "aws".to_string(),
                "empty region variable name".to_string(),
            ));
        }
        if !self.use_instance_profile
            && !self.use_web_identity
            && (self.access_key_id_var.is_none() || self.secret_access_key_var.is_none())
        {
            return Err(CredentialError::ValidationFailed(
                "aws".to_string(),
                "static credentials require both access_key_id_var and secret_access_key_var"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn default_ttl(&self) -> std::time::Duration {
        self.cache_ttl.unwrap_or(std::time::Duration::from_secs(300))
    }
}
