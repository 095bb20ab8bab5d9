//! # Constants for the Uplink Bridge
//!
//! Protocol constants for the provisioning service and the device hub,
//! plus the defaults used by configuration.

// =============================================================================
// PROVISIONING SERVICE
// =============================================================================

/// Global registration endpoint of the provisioning service
pub const DEFAULT_REGISTRATION_HOST: &str = "global.azure-devices-provisioning.net";

/// REST API version spoken to the provisioning service
pub const PROVISIONING_API_VERSION: &str = "2021-06-01";

/// Key name used when signing provisioning requests
pub const PROVISIONING_KEY_NAME: &str = "registration";

/// Interval between registration status polls (milliseconds)
pub const PROVISIONING_POLL_INTERVAL_MS: u64 = 2_000;

/// Maximum number of registration status polls before giving up
pub const PROVISIONING_MAX_POLL_ATTEMPTS: u32 = 10;

/// Registration status reported once a device is bound to a hub
pub const PROVISIONING_STATUS_ASSIGNED: &str = "assigned";

/// Registration status reported while assignment is in progress
pub const PROVISIONING_STATUS_ASSIGNING: &str = "assigning";

// =============================================================================
// DEVICE HUB
// =============================================================================

/// REST API version spoken to the device hub
pub const HUB_API_VERSION: &str = "2021-04-12";

/// Message property carrying the caller-supplied creation time
pub const HEADER_CREATION_TIME_UTC: &str = "iothub-creation-time-utc";

/// Content type for telemetry bodies
pub const TELEMETRY_CONTENT_TYPE: &str = "application/json";

// =============================================================================
// ACCESS SIGNATURES
// =============================================================================

/// Prefix of every access signature token
pub const SIGNATURE_TOKEN_PREFIX: &str = "SharedAccessSignature";

/// Default lifetime of a generated access signature (1 hour)
pub const DEFAULT_SIGNATURE_EXPIRY_SECS: u64 = 60 * 60;

// =============================================================================
// REGISTRATION CACHE
// =============================================================================

/// Maximum number of resolved identities kept in memory
pub const CACHE_MAX_IDENTITIES: u64 = 100_000;

// =============================================================================
// API CONFIGURATION
// =============================================================================

/// Default bridge API port
pub const BRIDGE_SERVICE_PORT: u16 = 8080;

/// Maximum request body size (1 MB)
pub const MAX_REQUEST_BODY_SIZE: usize = 1024 * 1024;

// =============================================================================
// ENVIRONMENT VARIABLE NAMES
// =============================================================================

/// Provisioning scope id
pub const ENV_ID_SCOPE: &str = "UPLINK_ID_SCOPE";

/// Base64 group enrollment key from which device keys are derived
pub const ENV_GROUP_KEY: &str = "UPLINK_SAS_TOKEN";

/// Provisioning registration host override
pub const ENV_REGISTRATION_HOST: &str = "UPLINK_REGISTRATION_HOST";

/// Service connection string used for twin registry access
pub const ENV_CLIENT_CONNECTION_STRING: &str = "UPLINK_CLIENT_CONNECTION_STRING";

/// API bind address (`host:port`)
pub const ENV_BIND_ADDR: &str = "UPLINK_BIND_ADDR";

/// Access signature lifetime in seconds
pub const ENV_SIGNATURE_TTL_SECS: &str = "UPLINK_SIGNATURE_TTL_SECS";

/// Enables per-field measurement type checks
pub const ENV_STRICT_MEASUREMENTS: &str = "UPLINK_STRICT_MEASUREMENTS";

// =============================================================================
// DEVICE IDS
// =============================================================================

/// Returns true if `device_id` is non-empty and only contains `[A-Za-z0-9_-]`
pub fn is_valid_device_id(device_id: &str) -> bool {
    !device_id.is_empty()
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
