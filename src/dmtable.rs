//! Device-mapper table composition.
//!
//! Translates parsed partition metadata into the table strings the kernel's
//! dm targets accept, derives the volume geometry, and lays the layers out in
//! activation order.  Stacking rules, bottom to top:
//!
//! | mode            | stack                                  |
//! |-----------------|----------------------------------------|
//! | plain           | raw partition                          |
//! | verity          | raw -> dm-verity                       |
//! | integrity       | raw -> dm-integrity                    |
//! | crypt           | raw -> dm-crypt                        |
//! | crypt-integrity | raw -> dm-integrity -> dm-crypt        |
//! | crypt-verity    | raw -> dm-crypt -> dm-verity           |
//!
//! For crypt-verity the crypt layer sits below so that dm-verity validates
//! the ciphertext.

use std::path::PathBuf;

use thiserror::Error;

use crate::{
    keyring::{KeySource, KeyringError},
    metadata::{
        CryptMode, IntegrityParams, PartitionMetadata, VerintParams, VerityParams, META_SIZE,
    },
};

/// Policy ceiling on a generated table string.  The kernel has its own
/// limits; staying under this keeps us clear of them.
pub const DM_TABLE_MAX: usize = 4096;

/// Device-mapper sector unit.
pub const SECTOR_SIZE: u64 = 512;

/// dm-integrity options whose value may reference a kernel keyring key via a
/// trailing `::<description>`.
const KEY_OPTIONS: [&str; 3] = ["internal_hash:", "journal_crypt:", "journal_mac:"];

#[derive(Error, Debug)]
pub enum TableError {
    #[error("device-mapper table would exceed {DM_TABLE_MAX} bytes")]
    Overflow,
    #[error("volume size of {0} bytes is not a multiple of the {SECTOR_SIZE}-byte sector size")]
    BadGeometry(u64),
    #[error(transparent)]
    Keyring(#[from] KeyringError),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmTargetKind {
    Verity,
    Integrity,
    Crypt,
}

impl DmTargetKind {
    /// Target name as the kernel table line spells it.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verity => "verity",
            Self::Integrity => "integrity",
            Self::Crypt => "crypt",
        }
    }
}

/// One device to create: everything the device-mapper collaborator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmTarget {
    pub name: String,
    pub uuid: String,
    pub kind: DmTargetKind,
    /// Length of the mapped device in 512-byte sectors.
    pub sectors: u64,
    /// Target parameter string, as the kernel parses it.
    pub table: String,
    pub readonly: bool,
}

/// Bottom-up activation plan for the rootfs stack.
#[derive(Debug)]
pub struct ActivationPlan {
    pub layers: Vec<DmTarget>,
    /// Path of the device to mount once every layer is live.
    pub device: PathBuf,
}

fn dm_node(name: &str) -> String {
    format!("/dev/mapper/{name}")
}

fn uuid_for(name: &str) -> String {
    format!("rootprep-{name}")
}

fn sectors(bytes: u64) -> Result<u64, TableError> {
    if bytes == 0 || bytes % SECTOR_SIZE != 0 {
        return Err(TableError::BadGeometry(bytes));
    }
    Ok(bytes / SECTOR_SIZE)
}

fn check_len(table: String) -> Result<String, TableError> {
    if table.len() >= DM_TABLE_MAX {
        return Err(TableError::Overflow);
    }
    Ok(table)
}

/// dm-verity table: version, data device, hash device (both the backing
/// device; the hash area lives behind the data at its start block), then the
/// metadata tail verbatim.
fn verity_table(p: &VerityParams, backing: &str) -> Result<String, TableError> {
    check_len(format!("{} {backing} {backing} {}", p.version, p.tail))
}

/// Rewrite a key-bearing dm-integrity option.
///
/// `journal_mac:hmac-sha256::bootkey` becomes
/// `journal_mac:hmac-sha256:<hex payload of 'bootkey'>`; options without a
/// `::<description>` suffix pass through untouched.
fn process_integrity_option(opt: &str, keys: &dyn KeySource) -> Result<String, TableError> {
    for prefix in KEY_OPTIONS {
        let Some(value) = opt.strip_prefix(prefix) else {
            continue;
        };
        let algorithm = value.split(':').next().unwrap_or_default();
        crate::trace!("dm-integrity algorithm for {prefix} {algorithm}");
        if let Some((head, description)) = value.split_once("::") {
            if !description.is_empty() {
                crate::trace!("dm-integrity will use key '{description}' from the kernel keyring");
                let payload = keys.get_key(description)?;
                return Ok(format!("{prefix}{head}:{}", hex::encode(&payload)));
            }
        }
        break;
    }
    Ok(opt.to_string())
}

/// dm-integrity table in journaled mode.  The `-` tells the kernel to use
/// the target's internal tag area; the option count includes the prepended
/// `block_size:` option.
fn integrity_table(
    p: &IntegrityParams,
    backing: &str,
    keys: &dyn KeySource,
) -> Result<String, TableError> {
    let mut processed = String::new();
    for opt in &p.options {
        processed.push_str(&process_integrity_option(opt, keys)?);
        processed.push(' ');
    }
    check_len(format!(
        "{backing} 0 - J {} block_size:{} {processed}",
        p.declared_opts + 1,
        p.block_size
    ))
}

/// dm-crypt table: cipher name, key in hex, IV offset, backing device,
/// device offset.
fn crypt_table(cipher: &str, key_hex: &str, backing: &str) -> Result<String, TableError> {
    check_len(format!("{cipher} {key_hex} 0 {backing} 0"))
}

/// Compose the activation plan for `meta`.
///
/// Fills `dm_table_verint`/`dm_table_crypt` and `dm_data_bytes` and returns
/// the layers bottom-up under deterministic names (`<prefix>-verint`,
/// `<prefix>-crypt`), so repeated activations are idempotent and
/// discoverable.  `crypt_key_hex` must be present exactly when the mode
/// carries a dm-crypt layer; the caller obtains it from the TPM or keyring
/// after the metadata signature has been verified.
pub fn plan(
    meta: &mut PartitionMetadata,
    keys: &dyn KeySource,
    crypt_key_hex: Option<&str>,
    dm_prefix: &str,
) -> Result<ActivationPlan, TableError> {
    let raw = meta.device_path.to_string_lossy().into_owned();
    let verint_name = format!("{dm_prefix}-verint");
    let crypt_name = format!("{dm_prefix}-crypt");

    meta.dm_data_bytes = match (&meta.verint, &meta.crypt) {
        (Some(VerintParams::Verity(p)), _) => p.data_block_size * p.num_data_blocks,
        (Some(VerintParams::Integrity(p)), _) => p.num_blocks * p.block_size,
        (None, Some(c)) => match (c.num_blocks, c.block_size) {
            (Some(blocks), Some(block_size)) => blocks * block_size,
            _ => return Err(TableError::Internal("crypt volume without geometry")),
        },
        (None, None) => 0,
    };

    let crypt_key = || {
        crypt_key_hex.ok_or(TableError::Internal(
            "dm-crypt table requested without a key",
        ))
    };

    let mut layers = Vec::new();
    match meta.mode {
        CryptMode::Plain => {}
        CryptMode::Verity => {
            let Some(VerintParams::Verity(p)) = &meta.verint else {
                return Err(TableError::Internal("verity mode without verity params"));
            };
            meta.dm_table_verint = verity_table(p, &raw)?;
            layers.push(DmTarget {
                name: verint_name.clone(),
                uuid: uuid_for(&verint_name),
                kind: DmTargetKind::Verity,
                sectors: sectors(meta.dm_data_bytes)?,
                table: meta.dm_table_verint.clone(),
                readonly: true,
            });
        }
        CryptMode::Integrity => {
            let Some(VerintParams::Integrity(p)) = &meta.verint else {
                return Err(TableError::Internal("integrity mode without integrity params"));
            };
            meta.dm_table_verint = integrity_table(p, &raw, keys)?;
            layers.push(DmTarget {
                name: verint_name.clone(),
                uuid: uuid_for(&verint_name),
                kind: DmTargetKind::Integrity,
                sectors: sectors(meta.dm_data_bytes)?,
                table: meta.dm_table_verint.clone(),
                readonly: meta.ro,
            });
        }
        CryptMode::Crypt => {
            let Some(c) = &meta.crypt else {
                return Err(TableError::Internal("crypt mode without crypt params"));
            };
            meta.dm_table_crypt = crypt_table(&c.cipher, crypt_key()?, &raw)?;
            layers.push(DmTarget {
                name: crypt_name.clone(),
                uuid: uuid_for(&crypt_name),
                kind: DmTargetKind::Crypt,
                sectors: sectors(meta.dm_data_bytes)?,
                table: meta.dm_table_crypt.clone(),
                readonly: meta.ro,
            });
        }
        CryptMode::CryptIntegrity => {
            let (Some(VerintParams::Integrity(p)), Some(c)) = (&meta.verint, &meta.crypt) else {
                return Err(TableError::Internal("crypt-integrity mode without params"));
            };
            meta.dm_table_verint = integrity_table(p, &raw, keys)?;
            meta.dm_table_crypt = crypt_table(&c.cipher, crypt_key()?, &dm_node(&verint_name))?;
            let data_sectors = sectors(meta.dm_data_bytes)?;
            layers.push(DmTarget {
                name: verint_name.clone(),
                uuid: uuid_for(&verint_name),
                kind: DmTargetKind::Integrity,
                sectors: data_sectors,
                table: meta.dm_table_verint.clone(),
                readonly: meta.ro,
            });
            layers.push(DmTarget {
                name: crypt_name.clone(),
                uuid: uuid_for(&crypt_name),
                kind: DmTargetKind::Crypt,
                sectors: data_sectors,
                table: meta.dm_table_crypt.clone(),
                readonly: meta.ro,
            });
        }
        CryptMode::CryptVerity => {
            let (Some(VerintParams::Verity(p)), Some(c)) = (&meta.verint, &meta.crypt) else {
                return Err(TableError::Internal("crypt-verity mode without params"));
            };
            // the crypt layer spans everything below the cleartext trailer so
            // the verity target can reach both data and hash area through it
            meta.dm_table_crypt = crypt_table(&c.cipher, crypt_key()?, &raw)?;
            meta.dm_table_verint = verity_table(p, &dm_node(&crypt_name))?;
            layers.push(DmTarget {
                name: crypt_name.clone(),
                uuid: uuid_for(&crypt_name),
                kind: DmTargetKind::Crypt,
                sectors: sectors(meta.part_size - META_SIZE as u64)?,
                table: meta.dm_table_crypt.clone(),
                readonly: meta.ro,
            });
            layers.push(DmTarget {
                name: verint_name.clone(),
                uuid: uuid_for(&verint_name),
                kind: DmTargetKind::Verity,
                sectors: sectors(meta.dm_data_bytes)?,
                table: meta.dm_table_verint.clone(),
                readonly: true,
            });
        }
    }

    let device = match layers.last() {
        Some(top) => PathBuf::from(dm_node(&top.name)),
        None => meta.device_path.clone(),
    };
    Ok(ActivationPlan { layers, device })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::keyring::fake::StaticKeys;
    use crate::metadata::CryptParams;

    fn verity_params() -> VerityParams {
        VerityParams {
            version: "1".to_string(),
            data_block_size: 4096,
            hash_block_size: 4096,
            num_data_blocks: 1024,
            hash_start_block: 1024,
            hash_algorithm: "sha256".to_string(),
            tail: "4096 4096 1024 1024 sha256 0123ab deadbeef".to_string(),
        }
    }

    fn base_meta(mode: CryptMode) -> PartitionMetadata {
        PartitionMetadata {
            device_path: "/dev/sda2".into(),
            part_size: 64 * 1024 * 1024,
            fs_type: "ext4".to_string(),
            ro: true,
            mode,
            verint: None,
            crypt: None,
            dm_table_verint: String::new(),
            dm_table_crypt: String::new(),
            dm_data_bytes: 0,
        }
    }

    #[test]
    fn test_verity_plan() {
        let mut meta = base_meta(CryptMode::Verity);
        meta.verint = Some(VerintParams::Verity(verity_params()));
        let plan = plan(&mut meta, &StaticKeys::default(), None, "rootfs").unwrap();

        assert_eq!(
            meta.dm_table_verint,
            "1 /dev/sda2 /dev/sda2 4096 4096 1024 1024 sha256 0123ab deadbeef"
        );
        assert_eq!(meta.dm_data_bytes, 4096 * 1024);
        assert_eq!(plan.layers.len(), 1);
        assert_eq!(plan.layers[0].name, "rootfs-verint");
        assert_eq!(plan.layers[0].kind, DmTargetKind::Verity);
        assert_eq!(plan.layers[0].sectors, 4096 * 1024 / 512);
        assert!(plan.layers[0].readonly);
        assert_eq!(plan.device, PathBuf::from("/dev/mapper/rootfs-verint"));
    }

    #[test]
    fn test_integrity_plan_with_keyring_key() {
        let payload: Vec<u8> = (1..=32).collect();
        let keys = StaticKeys::with("bootkey", &payload);

        let mut meta = base_meta(CryptMode::Integrity);
        meta.ro = false;
        meta.verint = Some(VerintParams::Integrity(IntegrityParams {
            num_blocks: 2048,
            block_size: 512,
            declared_opts: 1,
            options: vec!["journal_mac:hmac-sha256::bootkey".to_string()],
        }));
        let plan = plan(&mut meta, &keys, None, "rootfs").unwrap();

        assert_eq!(
            meta.dm_table_verint,
            format!(
                "/dev/sda2 0 - J 2 block_size:512 journal_mac:hmac-sha256:{} ",
                hex::encode(&payload)
            )
        );
        assert_eq!(meta.dm_data_bytes, 2048 * 512);
        assert_eq!(plan.layers[0].sectors, 2048);
        assert!(!plan.layers[0].readonly);
    }

    #[test]
    fn test_option_rewriting() {
        let keys = StaticKeys::with("k", &[0xaa, 0xbb]);
        // no key reference: passthrough
        assert_eq!(
            process_integrity_option("internal_hash:crc32c", &keys).unwrap(),
            "internal_hash:crc32c"
        );
        // unknown option: passthrough even with a double colon
        assert_eq!(
            process_integrity_option("sectors_per_bit:2::k", &keys).unwrap(),
            "sectors_per_bit:2::k"
        );
        // empty description: passthrough
        assert_eq!(
            process_integrity_option("journal_crypt:ctr-aes::", &keys).unwrap(),
            "journal_crypt:ctr-aes::"
        );
        // key reference resolves through the matched prefix
        assert_eq!(
            process_integrity_option("internal_hash:hmac-sha1::k", &keys).unwrap(),
            "internal_hash:hmac-sha1:aabb"
        );
        // missing key propagates the lookup failure
        assert!(matches!(
            process_integrity_option("journal_mac:hmac-sha256::absent", &keys),
            Err(TableError::Keyring(KeyringError::NotFound(..)))
        ));
    }

    #[test]
    fn test_crypt_only_plan() {
        let mut meta = base_meta(CryptMode::Crypt);
        meta.ro = false;
        meta.crypt = Some(CryptParams {
            cipher: "aes-xts-plain64".to_string(),
            num_blocks: Some(2048),
            block_size: Some(512),
        });
        let plan = plan(&mut meta, &StaticKeys::default(), Some("00ff"), "rootfs").unwrap();
        assert_eq!(meta.dm_table_crypt, "aes-xts-plain64 00ff 0 /dev/sda2 0");
        assert_eq!(plan.layers[0].name, "rootfs-crypt");
        assert_eq!(plan.layers[0].sectors, 2048);
        assert_eq!(plan.device, PathBuf::from("/dev/mapper/rootfs-crypt"));

        // a crypt layer without a key is a broken precondition
        let mut meta2 = base_meta(CryptMode::Crypt);
        meta2.crypt = meta.crypt.clone();
        assert!(matches!(
            super::plan(&mut meta2, &StaticKeys::default(), None, "rootfs"),
            Err(TableError::Internal(..))
        ));
    }

    #[test]
    fn test_crypt_verity_stacking() {
        let mut meta = base_meta(CryptMode::CryptVerity);
        meta.verint = Some(VerintParams::Verity(verity_params()));
        meta.crypt = Some(CryptParams {
            cipher: "aes-xts-plain64".to_string(),
            num_blocks: None,
            block_size: None,
        });
        let plan = plan(&mut meta, &StaticKeys::default(), Some("00ff"), "rootfs").unwrap();

        // crypt below verity, so verity validates ciphertext
        assert_eq!(plan.layers.len(), 2);
        assert_eq!(plan.layers[0].kind, DmTargetKind::Crypt);
        assert_eq!(plan.layers[1].kind, DmTargetKind::Verity);
        assert_eq!(meta.dm_table_crypt, "aes-xts-plain64 00ff 0 /dev/sda2 0");
        assert_eq!(
            meta.dm_table_verint,
            "1 /dev/mapper/rootfs-crypt /dev/mapper/rootfs-crypt 4096 4096 1024 1024 sha256 0123ab deadbeef"
        );
        // the crypt layer spans the partition up to the trailer
        assert_eq!(
            plan.layers[0].sectors,
            (meta.part_size - META_SIZE as u64) / 512
        );
        assert_eq!(plan.layers[1].sectors, 4096 * 1024 / 512);
        assert_eq!(plan.device, PathBuf::from("/dev/mapper/rootfs-verint"));
    }

    #[test]
    fn test_crypt_integrity_stacking() {
        let mut meta = base_meta(CryptMode::CryptIntegrity);
        meta.ro = false;
        meta.verint = Some(VerintParams::Integrity(IntegrityParams {
            num_blocks: 2048,
            block_size: 512,
            declared_opts: 1,
            options: vec!["internal_hash:crc32c".to_string()],
        }));
        meta.crypt = Some(CryptParams {
            cipher: "aes-xts-plain64".to_string(),
            num_blocks: None,
            block_size: None,
        });
        let plan = plan(&mut meta, &StaticKeys::default(), Some("00ff"), "rootfs").unwrap();

        assert_eq!(plan.layers[0].kind, DmTargetKind::Integrity);
        assert_eq!(plan.layers[1].kind, DmTargetKind::Crypt);
        assert_eq!(
            meta.dm_table_crypt,
            "aes-xts-plain64 00ff 0 /dev/mapper/rootfs-verint 0"
        );
        assert_eq!(plan.device, PathBuf::from("/dev/mapper/rootfs-crypt"));
    }

    #[test]
    fn test_bad_geometry() {
        let mut meta = base_meta(CryptMode::Integrity);
        meta.verint = Some(VerintParams::Integrity(IntegrityParams {
            num_blocks: 3,
            block_size: 100,
            declared_opts: 0,
            options: vec!["-".to_string()],
        }));
        assert!(matches!(
            plan(&mut meta, &StaticKeys::default(), None, "rootfs"),
            Err(TableError::BadGeometry(300))
        ));
    }

    #[test]
    fn test_table_length_boundary() {
        // "<version> <backing> <backing> <tail>" with a one-char version and
        // backing path sums to 22 bytes of fixed material plus the tail
        let backing = "/dev/sda2";
        let fixed = format!("1 {backing} {backing} ").len();

        let mut p = verity_params();
        p.tail = "y".repeat(DM_TABLE_MAX - 1 - fixed);
        let table = verity_table(&p, backing).unwrap();
        assert_eq!(table.len(), DM_TABLE_MAX - 1);

        p.tail.push('y');
        assert!(matches!(
            verity_table(&p, backing),
            Err(TableError::Overflow)
        ));
    }
}
