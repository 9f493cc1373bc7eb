//! Corrective actions with safety envelopes.
//!
//! Every action validates or clamps its parameters before any command
//! reaches the store: unknown eviction policies and malformed save
//! directives are rejected, numeric parameters are clamped into safe
//! ranges, cleanup is best-effort.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use taskpulse_shared::store::StoreGateway;
use taskpulse_shared::types::OptimizeActionKind;

pub const VALID_EVICTION_POLICIES: [&str; 6] = [
    "noeviction",
    "allkeys-lru",
    "volatile-lru",
    "allkeys-random",
    "volatile-random",
    "volatile-ttl",
];

pub const TIMEOUT_RANGE: (i64, i64) = (60, 3_600);
pub const MAXCLIENTS_RANGE: (i64, i64) = (100, 50_000);

/// Documented safe defaults used by rollback
pub const DEFAULT_EVICTION_POLICY: &str = "allkeys-lru";
pub const DEFAULT_TIMEOUT: &str = "300";
pub const DEFAULT_MAXCLIENTS: &str = "10000";
pub const DEFAULT_SAVE_POLICY: &str = "900 1 300 10 60 10000";

/// `save` directives are space-separated `<seconds> <changes>` pairs
static SAVE_POLICY_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+ \d+( \d+ \d+)*$").expect("static regex"));

/// Keys sampled for accounting during a memory-usage cleanup scan
const CLEANUP_SAMPLE_KEYS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error(transparent)]
    Store(#[from] taskpulse_shared::error::StoreError),
}

/// Apply one optimizer action against the store.
pub async fn apply_action(
    gateway: &StoreGateway,
    kind: OptimizeActionKind,
    parameters: &BTreeMap<String, Value>,
) -> Result<(), ActionError> {
    match kind {
        OptimizeActionKind::AdjustMaxmemoryPolicy => {
            let policy = str_param(parameters, "policy").unwrap_or(DEFAULT_EVICTION_POLICY);
            if !VALID_EVICTION_POLICIES.contains(&policy) {
                return Err(ActionError::InvalidParameter(format!(
                    "unknown maxmemory policy: {policy}"
                )));
            }
            gateway.config_set("maxmemory-policy", policy).await?;
            info!(policy, "adjusted maxmemory-policy");
        }
        OptimizeActionKind::AdjustConnectionTimeout => {
            let requested = int_param(parameters, "timeout_seconds").unwrap_or(300);
            let timeout = requested.clamp(TIMEOUT_RANGE.0, TIMEOUT_RANGE.1);
            if timeout != requested {
                debug!(requested, timeout, "timeout clamped into safety range");
            }
            gateway.config_set("timeout", &timeout.to_string()).await?;
            info!(timeout, "adjusted connection timeout");
        }
        OptimizeActionKind::AdjustMaxclients => {
            let requested = int_param(parameters, "maxclients").unwrap_or(10_000);
            let maxclients = requested.clamp(MAXCLIENTS_RANGE.0, MAXCLIENTS_RANGE.1);
            if maxclients != requested {
                debug!(requested, maxclients, "maxclients clamped into safety range");
            }
            gateway
                .config_set("maxclients", &maxclients.to_string())
                .await?;
            info!(maxclients, "adjusted maxclients");
        }
        OptimizeActionKind::TriggerMemoryCleanup => {
            let cleanup = str_param(parameters, "cleanup_type").unwrap_or("expire_scan");
            trigger_cleanup(gateway, cleanup).await?;
            info!(cleanup, "memory cleanup executed");
        }
        OptimizeActionKind::AdjustSavePolicy => {
            let policy = str_param(parameters, "save_policy").unwrap_or(DEFAULT_SAVE_POLICY);
            if !SAVE_POLICY_SHAPE.is_match(policy) {
                return Err(ActionError::InvalidParameter(format!(
                    "malformed save directive: {policy}"
                )));
            }
            gateway.config_set("save", policy).await?;
            info!(policy, "adjusted save policy");
        }
        OptimizeActionKind::EnableCompression => {
            let value = str_param(parameters, "rdb_compression").unwrap_or("yes");
            if value != "yes" && value != "no" {
                return Err(ActionError::InvalidParameter(format!(
                    "rdb_compression must be yes or no, got {value}"
                )));
            }
            gateway.config_set("rdbcompression", value).await?;
            info!(value, "set snapshot compression");
        }
    }
    Ok(())
}

/// Best-effort cleanup variants; none of them may fail the cycle.
async fn trigger_cleanup(gateway: &StoreGateway, cleanup_type: &str) -> Result<(), ActionError> {
    match cleanup_type {
        // A full scan touches every key and forces lazy expiry
        "expire_scan" => {
            let _ = gateway.scan("*").await?;
        }
        // MEMORY USAGE on a key sample forces allocator accounting
        "memory_usage_scan" => {
            let keys = gateway.scan("*").await?;
            for key in keys.iter().take(CLEANUP_SAMPLE_KEYS) {
                let _ = gateway.memory_usage(key).await;
            }
        }
        // Defragmentation support varies by server; ignore refusal
        "defrag" => {
            let _ = gateway.config_set("activedefrag", "yes").await;
        }
        other => {
            return Err(ActionError::InvalidParameter(format!(
                "unknown cleanup type: {other}"
            )))
        }
    }
    Ok(())
}

/// Revert a rollback-safe action to its documented default.
pub async fn rollback_action(
    gateway: &StoreGateway,
    kind: OptimizeActionKind,
) -> Result<bool, ActionError> {
    let (parameter, value) = match kind {
        OptimizeActionKind::AdjustMaxmemoryPolicy => ("maxmemory-policy", DEFAULT_EVICTION_POLICY),
        OptimizeActionKind::AdjustConnectionTimeout => ("timeout", DEFAULT_TIMEOUT),
        OptimizeActionKind::AdjustMaxclients => ("maxclients", DEFAULT_MAXCLIENTS),
        OptimizeActionKind::AdjustSavePolicy => ("save", DEFAULT_SAVE_POLICY),
        OptimizeActionKind::TriggerMemoryCleanup | OptimizeActionKind::EnableCompression => {
            return Ok(false)
        }
    };
    gateway.config_set(parameter, value).await?;
    info!(parameter, value, "configuration rolled back to default");
    Ok(true)
}

fn str_param<'a>(parameters: &'a BTreeMap<String, Value>, name: &str) -> Option<&'a str> {
    parameters.get(name).and_then(Value::as_str)
}

fn int_param(parameters: &BTreeMap<String, Value>, name: &str) -> Option<i64> {
    parameters.get(name).and_then(Value::as_i64)
}
