//! # Configuration for the Uplink Bridge
//!
//! Configuration is loaded from environment variables and validated once
//! at startup. Secrets are never serialized.

use crate::constants::*;
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::env;

// =============================================================================
// BRIDGE CONFIGURATION
// =============================================================================

/// Configuration for the bridge service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Provisioning scope id
    pub id_scope: String,

    /// Base64 group enrollment key
    #[serde(skip_serializing)]
    pub group_key: Option<String>,

    /// Service connection used for twin registry access
    #[serde(skip_serializing)]
    pub service_connection: Option<ServiceConnection>,

    /// API server configuration
    pub api: ApiConfig,

    /// Registration cache configuration
    pub cache: CacheConfig,

    /// Access signature configuration
    pub signature: SignatureConfig,

    /// Provisioning client configuration
    pub provisioning: ProvisioningConfig,

    /// Inbound message validation
    pub validation: ValidationConfig,
}

impl BridgeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = Self::default();

        if let Ok(scope) = env::var(ENV_ID_SCOPE) {
            config.id_scope = scope;
        }

        if let Ok(key) = env::var(ENV_GROUP_KEY) {
            config.group_key = Some(key);
        }

        if let Ok(host) = env::var(ENV_REGISTRATION_HOST) {
            config.provisioning.registration_host = host;
        }

        if let Ok(conn) = env::var(ENV_CLIENT_CONNECTION_STRING) {
            config.service_connection = Some(ServiceConnection::parse(&conn)?);
        }

        if let Ok(addr) = env::var(ENV_BIND_ADDR) {
            config.api = ApiConfig::parse_bind_addr(&addr)?;
        }

        if let Ok(ttl) = env::var(ENV_SIGNATURE_TTL_SECS) {
            config.signature.expiry_secs = ttl.parse().map_err(|_| {
                BridgeError::Configuration(format!("{} must be an integer", ENV_SIGNATURE_TTL_SECS))
            })?;
        }

        if let Ok(strict) = env::var(ENV_STRICT_MEASUREMENTS) {
            config.validation.strict_measurements =
                matches!(strict.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> BridgeResult<()> {
        if self.id_scope.is_empty() {
            return Err(BridgeError::MissingEnvVar(ENV_ID_SCOPE.into()));
        }

        // The group key must be present and decodable
        let _ = self.group_key_bytes()?;

        if self.signature.expiry_secs == 0 {
            return Err(BridgeError::Configuration(
                "signature expiry must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    /// Decoded group enrollment key
    pub fn group_key_bytes(&self) -> BridgeResult<Vec<u8>> {
        use base64::Engine;

        let key = self
            .group_key
            .as_deref()
            .ok_or_else(|| BridgeError::MissingEnvVar(ENV_GROUP_KEY.into()))?;

        Ok(base64::engine::general_purpose::STANDARD.decode(key)?)
    }
}

// =============================================================================
// SERVICE CONNECTION
// =============================================================================

/// Parsed service connection string
/// (`HostName=..;SharedAccessKeyName=..;SharedAccessKey=..`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConnection {
    pub host_name: String,
    pub key_name: String,
    #[serde(skip_serializing)]
    pub key: String,
}

impl ServiceConnection {
    /// Parse a connection string
    pub fn parse(connection_string: &str) -> BridgeResult<Self> {
        let mut host_name = None;
        let mut key_name = None;
        let mut key = None;

        for part in connection_string.split(';').filter(|p| !p.is_empty()) {
            // Keys are base64 and may end in '=', so split on the first one only
            let (name, value) = part.split_once('=').ok_or_else(|| {
                BridgeError::Configuration("malformed connection string segment".into())
            })?;

            match name {
                "HostName" => host_name = Some(value.to_string()),
                "SharedAccessKeyName" => key_name = Some(value.to_string()),
                "SharedAccessKey" => key = Some(value.to_string()),
                _ => {}
            }
        }

        let missing = |field: &str| {
            BridgeError::Configuration(format!("connection string is missing {}", field))
        };

        Ok(Self {
            host_name: host_name.ok_or_else(|| missing("HostName"))?,
            key_name: key_name.ok_or_else(|| missing("SharedAccessKeyName"))?,
            key: key.ok_or_else(|| missing("SharedAccessKey"))?,
        })
    }
}

// =============================================================================
// API CONFIGURATION
// =============================================================================

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Enable CORS
    pub enable_cors: bool,

    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: BRIDGE_SERVICE_PORT,
            enable_cors: true,
            max_body_size: MAX_REQUEST_BODY_SIZE,
        }
    }
}

impl ApiConfig {
    /// Get the bind address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn parse_bind_addr(addr: &str) -> BridgeResult<Self> {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
            BridgeError::Configuration(format!("{} must be host:port", ENV_BIND_ADDR))
        })?;
        let port = port
            .parse()
            .map_err(|_| BridgeError::Configuration(format!("invalid port '{}'", port)))?;

        Ok(Self {
            host: host.to_string(),
            port,
            ..Self::default()
        })
    }
}

// =============================================================================
// CACHE CONFIGURATION
// =============================================================================

/// Registration cache configuration.
///
/// Entries have no TTL; they live until invalidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of resolved identities
    pub max_identities: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_identities: CACHE_MAX_IDENTITIES,
        }
    }
}

// =============================================================================
// SIGNATURE CONFIGURATION
// =============================================================================

/// Access signature configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Token lifetime in seconds
    pub expiry_secs: u64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            expiry_secs: DEFAULT_SIGNATURE_EXPIRY_SECS,
        }
    }
}

// =============================================================================
// PROVISIONING CONFIGURATION
// =============================================================================

/// Provisioning client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Registration host
    pub registration_host: String,

    /// REST API version
    pub api_version: String,

    /// Delay between status polls
    pub poll_interval_ms: u64,

    /// Maximum number of status polls
    pub max_poll_attempts: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            registration_host: DEFAULT_REGISTRATION_HOST.into(),
            api_version: PROVISIONING_API_VERSION.into(),
            poll_interval_ms: PROVISIONING_POLL_INTERVAL_MS,
            max_poll_attempts: PROVISIONING_MAX_POLL_ATTEMPTS,
        }
    }
}

// =============================================================================
// VALIDATION CONFIGURATION
// =============================================================================

/// Inbound message validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Require every measurement to be a number, a string or a location
    pub strict_measurements: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.provisioning.registration_host, DEFAULT_REGISTRATION_HOST);
        assert_eq!(config.signature.expiry_secs, 3600);
        assert!(!config.validation.strict_measurements);
    }

    #[test]
    fn test_api_bind_addr() {
        let config = ApiConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");

        let parsed = ApiConfig::parse_bind_addr("127.0.0.1:9090").unwrap();
        assert_eq!(parsed.bind_addr(), "127.0.0.1:9090");
        assert!(ApiConfig::parse_bind_addr("nohost").is_err());
    }

    #[test]
    fn test_validate_requires_scope_and_key() {
        let mut config = BridgeConfig::default();
        assert!(matches!(config.validate(), Err(BridgeError::MissingEnvVar(_))));

        config.id_scope = "0ne000000".into();
        assert!(matches!(config.validate(), Err(BridgeError::MissingEnvVar(_))));

        config.group_key = Some("not base64!".into());
        assert!(matches!(config.validate(), Err(BridgeError::Configuration(_))));

        config.group_key = Some("c2VjcmV0".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_connection_parse() {
        let conn = ServiceConnection::parse(
            "HostName=hub.example.net;SharedAccessKeyName=iothubowner;SharedAccessKey=abc123==",
        )
        .unwrap();

        assert_eq!(conn.host_name, "hub.example.net");
        assert_eq!(conn.key_name, "iothubowner");
        assert_eq!(conn.key, "abc123==");

        assert!(ServiceConnection::parse("HostName=hub.example.net").is_err());
    }
}
