//! Stable identity of the machine this client runs on.

use common::InstanceMeta;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn machine_id() -> Option<String> {
    MACHINE_ID_PATHS
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .map(|id| id.trim().to_string())
        .find(|id| !id.is_empty())
}

/// Hex SHA-256 over machine id, hostname and architecture.
pub fn fingerprint() -> String {
    fingerprint_of(machine_id().as_deref(), &hostname(), std::env::consts::ARCH)
}

fn fingerprint_of(machine_id: Option<&str>, hostname: &str, arch: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.unwrap_or_default().as_bytes());
    hasher.update(b"\0");
    hasher.update(hostname.as_bytes());
    hasher.update(b"\0");
    hasher.update(arch.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn meta() -> InstanceMeta {
    let mut meta = InstanceMeta::new();
    meta.insert("os".to_string(), json!(std::env::consts::OS));
    meta.insert("arch".to_string(), json!(std::env::consts::ARCH));
    meta.insert("hostname".to_string(), json!(hostname()));
    meta.insert("cpu_count".to_string(), json!(num_cpus::get()));
    meta
}
