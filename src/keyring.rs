//! Access to symmetric keys provisioned in the kernel keyring.
//!
//! Key lookup is an external collaborator: before this program runs, the boot
//! chain loads dm-integrity keys into the user keyring under well-known
//! descriptions.  Everything above the [`KeySource`] seam only sees
//! `description -> payload bytes`.

use std::{path::PathBuf, process::Command};

use thiserror::Error;
use zeroize::Zeroizing;

/// Upper bound on a keyring payload we are willing to embed into a
/// device-mapper table.
pub const KEYRING_PAYLOAD_MAX: usize = 256;

#[derive(Error, Debug)]
pub enum KeyringError {
    #[error("no key with description '{0}' in the kernel keyring")]
    NotFound(String),
    #[error("payload of key '{0}' exceeds {KEYRING_PAYLOAD_MAX} bytes")]
    TooLarge(String),
    #[error("keyctl invocation failed: {0}")]
    Lookup(String),
}

/// Source of symmetric key payloads, looked up by description.
pub trait KeySource {
    fn get_key(&self, description: &str) -> Result<Zeroizing<Vec<u8>>, KeyringError>;
}

/// [`KeySource`] backed by the `keyctl` binary.
///
/// The shell integration is kept isolated here so that the table composition
/// above stays testable against an in-memory source.
#[derive(Debug, Clone)]
pub struct KeyctlCommand {
    binary: PathBuf,
}

impl Default for KeyctlCommand {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("keyctl"),
        }
    }
}

impl KeyctlCommand {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>, KeyringError> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| KeyringError::Lookup(format!("spawning {:?}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(KeyringError::Lookup(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(output.stdout)
    }
}

impl KeySource for KeyctlCommand {
    fn get_key(&self, description: &str) -> Result<Zeroizing<Vec<u8>>, KeyringError> {
        let id = self
            .run(&["search", "@u", "user", description])
            .map_err(|_| KeyringError::NotFound(description.to_string()))?;
        let id = String::from_utf8_lossy(&id).trim().to_string();
        let payload = Zeroizing::new(self.run(&["pipe", &id])?);
        if payload.len() > KEYRING_PAYLOAD_MAX {
            return Err(KeyringError::TooLarge(description.to_string()));
        }
        Ok(payload)
    }
}
