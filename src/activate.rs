//! Boot-time orchestration.
//!
//! One linear flow: authenticate and parse the partition metadata, obtain
//! the dm-crypt key if the metadata asks for one, compose the device-mapper
//! tables, activate the stack bottom-up, hand back the device to mount.
//! Strictly in that order: no dm device is created before the metadata
//! signature has been verified, and no unseal happens before the signature
//! check has established which mode (and therefore whether a key) is needed.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use zeroize::Zeroizing;

use crate::{
    crypto::sha256_of_keyfile,
    dm::{ActivationGuard, DeviceMapper},
    dmtable,
    keyring::KeySource,
    metadata::PartitionMetadata,
    tpm::{parse_pcr_selection, SealedBlob, Tpm},
};

/// Supplier of the dm-crypt master key.
///
/// Production unseals through the TPM; tests substitute a fixed key.
pub trait KeyUnsealer {
    fn unseal_key(&mut self, pub_key_digest: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>>;
}

/// [`KeyUnsealer`] backed by a TPM-sealed blob on disk.
///
/// Connects lazily, so plain and verity-only roots never touch the TPM.
pub struct TpmKeyUnsealer {
    tcti: Option<String>,
    blob_path: PathBuf,
    pcrs: String,
}

impl TpmKeyUnsealer {
    pub fn new(tcti: Option<String>, blob_path: PathBuf, pcrs: String) -> Self {
        Self {
            tcti,
            blob_path,
            pcrs,
        }
    }
}

impl KeyUnsealer for TpmKeyUnsealer {
    fn unseal_key(&mut self, pub_key_digest: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>> {
        let selection = parse_pcr_selection(&self.pcrs)?;
        let blob = SealedBlob::read_from(&self.blob_path)?;
        let mut tpm = Tpm::connect(self.tcti.as_deref()).context("connecting to the TPM")?;
        Ok(tpm
            .unseal(pub_key_digest, &selection, &blob)
            .context("unsealing the rootfs key")?)
    }
}

/// [`KeyUnsealer`] for setups without a sealed key; crypt-mode metadata is a
/// configuration error then.
pub struct NoSealedKey;

impl KeyUnsealer for NoSealedKey {
    fn unseal_key(&mut self, _pub_key_digest: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>> {
        bail!("metadata requests dm-crypt but no sealed key blob is configured")
    }
}

/// Prepare the rootfs device and return the path to mount.
///
/// On any failure every dm device created so far is removed again in reverse
/// order before the error propagates; the next boot starts from scratch.
pub fn prepare_root(
    device: &Path,
    keyfile: &Path,
    dm_prefix: &str,
    dm: &dyn DeviceMapper,
    keys: &dyn KeySource,
    unsealer: &mut dyn KeyUnsealer,
) -> Result<PathBuf> {
    let mut meta = PartitionMetadata::load_and_verify(device, keyfile)
        .with_context(|| format!("loading metadata from {device:?}"))?;

    // the verified signature covers the mode declaration, so only now do we
    // know whether a key is needed at all
    let key_hex = if meta.mode.uses_crypt() {
        let digest = sha256_of_keyfile(keyfile)?;
        let key = unsealer.unseal_key(&digest)?;
        Some(Zeroizing::new(hex::encode(&*key)))
    } else {
        None
    };

    let plan = dmtable::plan(
        &mut meta,
        keys,
        key_hex.as_ref().map(|k| k.as_str()),
        dm_prefix,
    )
    .context("composing device-mapper tables")?;

    let mut guard = ActivationGuard::new(dm);
    let mut top = meta.device_path.clone();
    for layer in &plan.layers {
        top = dm
            .create(layer)
            .with_context(|| format!("activating dm device '{}'", layer.name))?;
        guard.push(layer.name.clone());
        crate::trace!("activated dm device '{}' at {}", layer.name, top.display());
    }
    guard.disarm();
    Ok(top)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::dm::fake::RecordingDm;
    use crate::keyring::fake::StaticKeys;
    use crate::test::{image_with_trailer, signed_trailer, write_keyfile};

    struct FixedKey(Vec<u8>);

    impl KeyUnsealer for FixedKey {
        fn unseal_key(&mut self, _pub_key_digest: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>> {
            Ok(Zeroizing::new(self.0.clone()))
        }
    }

    struct FailingUnsealer;

    impl KeyUnsealer for FailingUnsealer {
        fn unseal_key(&mut self, _pub_key_digest: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>> {
            bail!("policy mismatch")
        }
    }

    #[test]
    fn test_plain_passthrough() {
        let image = image_with_trailer(&signed_trailer(b"v1 ext4 ro plain\xFF\xFF"));
        let keyfile = write_keyfile();
        let dm = RecordingDm::default();

        let top = prepare_root(
            image.path(),
            keyfile.path(),
            "rootfs",
            &dm,
            &StaticKeys::default(),
            &mut NoSealedKey,
        )
        .unwrap();

        // the backing device is handed through untouched
        assert_eq!(top, image.path());
        assert!(dm.ops.borrow().is_empty());
    }

    #[test]
    fn test_crypt_verity_activation_order() {
        let image = image_with_trailer(&signed_trailer(
            b"v1 ext4 ro crypt-verity\xFF1 4096 4096 1024 1024 sha256 ab cd\xFFaes-xts-plain64",
        ));
        let keyfile = write_keyfile();
        let dm = RecordingDm::default();

        let top = prepare_root(
            image.path(),
            keyfile.path(),
            "rootfs",
            &dm,
            &StaticKeys::default(),
            &mut FixedKey(vec![0x11; 32]),
        )
        .unwrap();

        assert_eq!(top, PathBuf::from("/dev/mapper/rootfs-verint"));
        assert_eq!(
            *dm.ops.borrow(),
            vec!["create rootfs-crypt", "create rootfs-verint"]
        );
    }

    #[test]
    fn test_failed_layer_tears_down_the_stack() {
        let image = image_with_trailer(&signed_trailer(
            b"v1 ext4 ro crypt-verity\xFF1 4096 4096 1024 1024 sha256 ab cd\xFFaes-xts-plain64",
        ));
        let keyfile = write_keyfile();
        let dm = RecordingDm {
            fail_create: Some("rootfs-verint".to_string()),
            ..Default::default()
        };

        prepare_root(
            image.path(),
            keyfile.path(),
            "rootfs",
            &dm,
            &StaticKeys::default(),
            &mut FixedKey(vec![0x11; 32]),
        )
        .unwrap_err();

        // the crypt layer below was created first and must be gone again
        assert_eq!(
            *dm.ops.borrow(),
            vec!["create rootfs-crypt", "remove rootfs-crypt"]
        );
    }

    #[test]
    fn test_unseal_failure_creates_nothing() {
        let image = image_with_trailer(&signed_trailer(
            b"v1 ext4 rw crypt\xFF\xFFaes-xts-plain64 2048 512",
        ));
        let keyfile = write_keyfile();
        let dm = RecordingDm::default();

        prepare_root(
            image.path(),
            keyfile.path(),
            "rootfs",
            &dm,
            &StaticKeys::default(),
            &mut FailingUnsealer,
        )
        .unwrap_err();
        assert!(dm.ops.borrow().is_empty());
    }

    #[test]
    fn test_integrity_key_from_keyring() {
        let image = image_with_trailer(&signed_trailer(
            b"v1 ext4 rw integrity\xFF2048 512 1 journal_mac:hmac-sha256::bootkey\xFF",
        ));
        let keyfile = write_keyfile();
        let dm = RecordingDm::default();
        let keys = StaticKeys::with("bootkey", &(1..=32).collect::<Vec<u8>>());

        let top = prepare_root(
            image.path(),
            keyfile.path(),
            "rootfs",
            &dm,
            &keys,
            &mut NoSealedKey,
        )
        .unwrap();
        assert_eq!(top, PathBuf::from("/dev/mapper/rootfs-verint"));
        assert_eq!(*dm.ops.borrow(), vec!["create rootfs-verint"]);
    }
}
