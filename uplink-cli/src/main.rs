//! # Uplink CLI
//!
//! Operator tool for the uplink bridge:
//! - Derive a device key from the group enrollment key
//! - Mint an access signature for a device
//! - Submit a message to a running bridge
//!
//! ## Usage
//!
//! ```bash
//! # Derive a device key
//! uplink-cli derive-key --device-id sensor-42
//!
//! # Mint an access signature
//! uplink-cli sas-token --device-id sensor-42 --endpoint hub.example.net
//!
//! # Send a message through the bridge
//! uplink-cli send --device-id sensor-42 --measurements '{"temperature": 21.5}'
//! ```
//!
//! The group key is read from `--group-key` or `UPLINK_SAS_TOKEN`.

mod client;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use client::BridgeClient;
use shared::{
    constants::{is_valid_device_id, ENV_GROUP_KEY},
    types::{DeviceIdentity, DeviceRegistration, UplinkMessage},
};
use uplink_bridge::{keys::derive_key, signature::generate_access_signature};

#[derive(Parser)]
#[command(name = "uplink-cli")]
#[command(about = "Operator tool for the uplink bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the per-device key from the group enrollment key
    DeriveKey {
        /// Device id
        #[arg(long, short = 'd')]
        device_id: String,

        /// Base64 group enrollment key
        #[arg(long, env = ENV_GROUP_KEY, hide_env_values = true)]
        group_key: String,
    },

    /// Mint an access signature for a device
    SasToken {
        /// Device id
        #[arg(long, short = 'd')]
        device_id: String,

        /// Assigned hub host name
        #[arg(long, short = 'e')]
        endpoint: String,

        /// Device id assigned by the hub, if different
        #[arg(long)]
        assigned_device_id: Option<String>,

        /// Token lifetime in seconds
        #[arg(long, default_value = "3600")]
        ttl: u64,

        /// Base64 group enrollment key
        #[arg(long, env = ENV_GROUP_KEY, hide_env_values = true)]
        group_key: String,
    },

    /// Submit a message to a running bridge
    Send {
        /// Bridge base URL
        #[arg(long, default_value = "http://localhost:8080")]
        bridge_url: String,

        /// Device id
        #[arg(long, short = 'd')]
        device_id: String,

        /// Measurements as a JSON object
        #[arg(long, short = 'm')]
        measurements: String,

        /// Reported properties as a JSON object
        #[arg(long)]
        reported: Option<String>,

        /// Desired properties as a JSON object
        #[arg(long)]
        desired: Option<String>,

        /// Creation time of the measurements
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// Evict a device from a running bridge's cache
    Evict {
        /// Bridge base URL
        #[arg(long, default_value = "http://localhost:8080")]
        bridge_url: String,

        /// Device id
        #[arg(long, short = 'd')]
        device_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .init();

    match cli.command {
        Commands::DeriveKey { device_id, group_key } => {
            let key = derive_device_key(&group_key, &device_id)?;
            println!("{}", key);
        }
        Commands::SasToken {
            device_id,
            endpoint,
            assigned_device_id,
            ttl,
            group_key,
        } => {
            let token = sas_token(&group_key, &device_id, &endpoint, assigned_device_id, ttl)?;
            println!("{}", token);
        }
        Commands::Send {
            bridge_url,
            device_id,
            measurements,
            reported,
            desired,
            timestamp,
        } => {
            let message = UplinkMessage {
                reported_properties: reported.as_deref().map(|r| parse_json("reported", r)).transpose()?,
                desired_properties: desired.as_deref().map(|d| parse_json("desired", d)).transpose()?,
                timestamp: timestamp.map(Value::String),
                ..UplinkMessage::new(&device_id, parse_json("measurements", &measurements)?)
            };

            let outcome = BridgeClient::new(bridge_url).send(&message).await?;

            println!("\n✓ Message bridged");
            println!("  Device: {}", outcome.device_id);
            println!("  Stage: {}", outcome.stage);
            if let Some(twin) = outcome.twin {
                println!("  Reported updated: {}", twin.reported_updated);
                println!("  Desired updated: {}", twin.desired_updated);
            }
        }
        Commands::Evict { bridge_url, device_id } => {
            let result = BridgeClient::new(bridge_url).evict(&device_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn group_key_bytes(group_key: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(group_key.trim())
        .context("group key is not valid base64")
}

fn derive_device_key(group_key: &str, device_id: &str) -> Result<String> {
    if !is_valid_device_id(device_id) {
        return Err(anyhow!("invalid device id '{}'", device_id));
    }
    let key = derive_key(&group_key_bytes(group_key)?, device_id);
    Ok(key.as_base64().to_string())
}

fn sas_token(
    group_key: &str,
    device_id: &str,
    endpoint: &str,
    assigned_device_id: Option<String>,
    ttl: u64,
) -> Result<String> {
    if !is_valid_device_id(device_id) {
        return Err(anyhow!("invalid device id '{}'", device_id));
    }

    let identity = DeviceIdentity {
        device_id: device_id.to_string(),
        derived_key: derive_key(&group_key_bytes(group_key)?, device_id),
        registration: DeviceRegistration {
            assigned_endpoint: endpoint.to_string(),
            assigned_device_id: assigned_device_id.unwrap_or_else(|| device_id.to_string()),
        },
    };

    Ok(generate_access_signature(&identity, ttl)?.token())
}

fn parse_json(field: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", field))
}
