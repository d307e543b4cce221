//! Machine fingerprinting for license binding.
//!
//! Produces a stable hash identifying this machine so a license can be
//! bound to one install. The hash survives reboots; it changes only when
//! the underlying hardware identity changes (which triggers fingerprint
//! migration at startup).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;

/// Seam the engine uses to obtain the current machine's fingerprint.
pub trait FingerprintProvider: Send + Sync {
    /// Returns the stable fingerprint hash for this machine.
    fn fingerprint(&self) -> String;

    /// Returns descriptive machine information for display.
    fn machine_info(&self) -> MachineInfo;
}

/// Descriptive information about the current machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub os_name: String,
    pub os_version: String,
    pub hostname: String,
    pub arch: String,
    pub fingerprint_hash: String,
}

/// Default provider: hashes hardware identifiers of the running machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct MachineFingerprint;

impl MachineFingerprint {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FingerprintProvider for MachineFingerprint {
    fn fingerprint(&self) -> String {
        let joined = identifier_components().join("|");
        let digest = Sha256::digest(joined.as_bytes());
        BASE64.encode(&digest[..16])
    }

    fn machine_info(&self) -> MachineInfo {
        MachineInfo {
            os_name: env::consts::OS.to_string(),
            os_version: os_version(),
            hostname: current_hostname(),
            arch: env::consts::ARCH.to_string(),
            fingerprint_hash: self.fingerprint(),
        }
    }
}

/// Identifier sources, most stable first. Hostname and username are
/// included as weaker components so the hash still differs across
/// machines that lack a readable machine id.
fn identifier_components() -> Vec<String> {
    let mut components = vec![
        env::consts::OS.to_string(),
        env::consts::ARCH.to_string(),
        current_hostname(),
    ];
    if let Some(machine_id) = machine_id() {
        components.push(machine_id);
    }
    if let Ok(user) = env::var("USER").or_else(|_| env::var("USERNAME")) {
        components.push(user);
    }
    components
}

fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(target_os = "linux")]
fn os_version() -> String {
    let release = std::fs::read_to_string("/etc/os-release").unwrap_or_default();
    release
        .lines()
        .find_map(|l| l.strip_prefix("VERSION_ID="))
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(target_os = "macos")]
fn os_version() -> String {
    command_stdout("sw_vers", &["-productVersion"]).unwrap_or_else(|| "unknown".to_string())
}

#[cfg(target_os = "windows")]
fn os_version() -> String {
    "windows".to_string()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn os_version() -> String {
    "unknown".to_string()
}

/// Platform machine id, the strongest fingerprint component.
#[cfg(target_os = "linux")]
fn machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
}

#[cfg(target_os = "macos")]
fn machine_id() -> Option<String> {
    let listing = command_stdout("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"])?;
    listing
        .lines()
        .find(|l| l.contains("IOPlatformUUID"))
        .and_then(|l| l.split('"').nth(3))
        .map(String::from)
}

// MachineGuid comes from the registry, read by the desktop shell.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn machine_id() -> Option<String> {
    None
}

#[cfg(target_os = "macos")]
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(program).args(args).output().ok()?;
    let text = String::from_utf8(output.stdout).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
