//! Signed partition metadata trailer.
//!
//! The last [`META_SIZE`] bytes of the rootfs partition hold a NUL-terminated
//! ASCII description of how to activate the filesystem, followed by an
//! RSA-PSS signature over that text (terminator included):
//!
//! ```text
//! [ metadata text ][ 0x00 ][ SIG_LEN signature bytes ]
//! ```
//!
//! Inside the text, `0xFF` bytes separate three sections: a header
//! (`VERSION FS_TYPE ro|rw CRYPTMODE`), the verity-or-integrity table
//! parameters and the crypt table parameters.  Tokens within a section are
//! space-separated.  Nothing in the trailer is trusted before the signature
//! has been verified against the provided public keyfile.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    os::{fd::AsFd, unix::fs::FileTypeExt},
    path::{Path, PathBuf},
};

use rustix::ioctl::{ioctl, opcode, Ioctl, IoctlOutput, Opcode};
use thiserror::Error;

use crate::crypto::{verify_signature, SignatureError, SIG_LEN};

/// Size in bytes of the metadata trailer at the end of the partition.
pub const META_SIZE: usize = 4096;

/// Expected version token at the start of the metadata text.
pub const META_VERSION: &str = "v1";

/// Upper bound on the filesystem-name token.
pub const FS_TYPE_MAX: usize = 32;

/// Separator byte between the three metadata sections.
const SECTION_SEPARATOR: u8 = 0xFF;

/// Loading or parsing the metadata trailer failed.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("failed to {op} {path:?}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("metadata trailer on {0:?} is corrupt")]
    Corrupt(PathBuf),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("malformed metadata: {0}")]
    Format(String),
}

fn format_err(msg: impl Into<String>) -> MetadataError {
    MetadataError::Format(msg.into())
}

/// Device-mapper feature selection for the rootfs.
///
/// One case per metadata token; dm-verity and dm-integrity are mutually
/// exclusive, which this representation makes impossible to express rather
/// than merely checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMode {
    Plain,
    Verity,
    Integrity,
    Crypt,
    CryptIntegrity,
    CryptVerity,
}

/// Which target, if any, occupies the verity-or-integrity slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerintKind {
    Verity,
    Integrity,
}

impl CryptMode {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "plain" => Some(Self::Plain),
            "verity" => Some(Self::Verity),
            "integrity" => Some(Self::Integrity),
            "crypt" => Some(Self::Crypt),
            "crypt-integrity" => Some(Self::CryptIntegrity),
            "crypt-verity" => Some(Self::CryptVerity),
            _ => None,
        }
    }

    /// True when the mode includes a dm-crypt layer (and therefore needs a
    /// symmetric key before activation).
    pub fn uses_crypt(self) -> bool {
        matches!(self, Self::Crypt | Self::CryptIntegrity | Self::CryptVerity)
    }

    pub fn verint_kind(self) -> Option<VerintKind> {
        match self {
            Self::Verity | Self::CryptVerity => Some(VerintKind::Verity),
            Self::Integrity | Self::CryptIntegrity => Some(VerintKind::Integrity),
            Self::Plain | Self::Crypt => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Plain => "none",
            Self::Verity => "dm-verity",
            Self::Integrity => "dm-integrity",
            Self::Crypt => "dm-crypt",
            Self::CryptIntegrity => "dm-crypt dm-integrity",
            Self::CryptVerity => "dm-crypt dm-verity",
        }
    }
}

/// Tokenized dm-verity parameters from metadata section 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityParams {
    pub version: String,
    pub data_block_size: u64,
    pub hash_block_size: u64,
    pub num_data_blocks: u64,
    pub hash_start_block: u64,
    pub hash_algorithm: String,
    /// Everything after the version token, verbatim; passes through into the
    /// generated table (salt, root hash and any extra target options).
    pub tail: String,
}

/// Tokenized dm-integrity parameters from metadata section 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityParams {
    pub num_blocks: u64,
    pub block_size: u64,
    /// Option count as declared in the metadata; the kernel additionally
    /// receives the prepended `block_size:` option.
    pub declared_opts: u64,
    pub options: Vec<String>,
}

/// Tokenized dm-crypt parameters from metadata section 3.
///
/// The size pair is present exactly when the mode is crypt-only; stacked
/// modes derive their geometry from the verity/integrity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptParams {
    pub cipher: String,
    pub num_blocks: Option<u64>,
    pub block_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerintParams {
    Verity(VerityParams),
    Integrity(IntegrityParams),
}

/// Everything needed to activate the rootfs, parsed from the signed trailer.
///
/// Created by [`PartitionMetadata::load_and_verify`]; the table strings stay
/// empty until the composer fills them in.
#[derive(Debug)]
pub struct PartitionMetadata {
    pub device_path: PathBuf,
    /// Size of the backing partition in bytes, as reported by the kernel.
    pub part_size: u64,
    pub fs_type: String,
    pub ro: bool,
    pub mode: CryptMode,
    pub verint: Option<VerintParams>,
    pub crypt: Option<CryptParams>,
    pub dm_table_verint: String,
    pub dm_table_crypt: String,
    /// Data-region size of the verity/integrity/crypt volume in bytes.
    pub dm_data_bytes: u64,
}

const BLKGETSIZE64: Opcode = opcode::read::<u64>(0x12, 114);

// BLKGETSIZE64 returns the partition size through the argument pointer;
// rustix has no pre-baked wrapper for it.
struct BlkGetSize64(u64);

unsafe impl Ioctl for BlkGetSize64 {
    type Output = u64;

    const IS_MUTATING: bool = true;

    fn opcode(&self) -> Opcode {
        BLKGETSIZE64
    }

    fn as_ptr(&mut self) -> *mut std::ffi::c_void {
        (&mut self.0 as *mut u64).cast()
    }

    unsafe fn output_from_ptr(
        _out: IoctlOutput,
        ptr: *mut std::ffi::c_void,
    ) -> rustix::io::Result<u64> {
        Ok(unsafe { ptr.cast::<u64>().read() })
    }
}

fn block_device_size(fd: impl AsFd) -> rustix::io::Result<u64> {
    unsafe { ioctl(fd, BlkGetSize64(0)) }
}

fn read_trailer(device: &Path) -> Result<(u64, Box<[u8; META_SIZE]>), MetadataError> {
    let io_err = |op: &'static str| {
        move |source: io::Error| MetadataError::Io {
            op,
            path: device.into(),
            source,
        }
    };

    let mut file = File::open(device).map_err(io_err("open"))?;
    let stat = file.metadata().map_err(io_err("stat"))?;
    let part_size = if stat.file_type().is_block_device() {
        block_device_size(&file).map_err(|e| MetadataError::Io {
            op: "ioctl(BLKGETSIZE64) on",
            path: device.into(),
            source: e.into(),
        })?
    } else {
        // image files carry the trailer the same way; their size comes from
        // stat rather than the block layer
        stat.len()
    };

    if part_size < META_SIZE as u64 {
        return Err(MetadataError::Corrupt(device.into()));
    }

    file.seek(SeekFrom::Start(part_size - META_SIZE as u64))
        .map_err(io_err("seek"))?;

    // the trailer must come back whole: we already seeked to exactly
    // META_SIZE bytes before the end, so any EOF here means the device
    // shrank under us or the size query lied.  Short reads and EINTR are
    // ordinary for block devices; keep going until the buffer is full.
    let mut buf = Box::new([0u8; META_SIZE]);
    let mut filled = 0;
    while filled < META_SIZE {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return Err(MetadataError::Corrupt(device.into())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(io_err("read")(source)),
        }
    }
    Ok((part_size, buf))
}

fn parse_u64(token: &str, what: &str) -> Result<u64, MetadataError> {
    token
        .parse()
        .map_err(|_| format_err(format!("bad {what} '{token}'")))
}

fn section_utf8(section: &[u8], what: &str) -> Result<&str, MetadataError> {
    std::str::from_utf8(section).map_err(|_| format_err(format!("{what} is not valid UTF-8")))
}

fn parse_verity(section: &str) -> Result<VerityParams, MetadataError> {
    let (version, tail) = section
        .split_once(' ')
        .ok_or_else(|| format_err("unexpected end of dm-verity parameters"))?;

    let mut tokens = tail.split_ascii_whitespace();
    let mut next = |what: &str| {
        tokens
            .next()
            .ok_or_else(|| format_err(format!("dm-verity parameters end before {what}")))
    };
    let data_block_size = parse_u64(next("data block size")?, "data block size")?;
    let hash_block_size = parse_u64(next("hash block size")?, "hash block size")?;
    let num_data_blocks = parse_u64(next("data block count")?, "data block count")?;
    let hash_start_block = parse_u64(next("hash start block")?, "hash start block")?;
    let hash_algorithm = next("hash algorithm")?.to_string();
    next("salt")?;
    next("root hash")?;

    crate::trace!("dm-verity hash algorithm: {hash_algorithm}");

    Ok(VerityParams {
        version: version.to_string(),
        data_block_size,
        hash_block_size,
        num_data_blocks,
        hash_start_block,
        hash_algorithm,
        tail: tail.to_string(),
    })
}

fn parse_integrity(section: &str) -> Result<IntegrityParams, MetadataError> {
    let mut tokens = section.split_ascii_whitespace();
    let mut next = |what: &str| {
        tokens
            .next()
            .ok_or_else(|| format_err(format!("dm-integrity parameters end before {what}")))
    };
    let num_blocks = parse_u64(next("block count")?, "block count")?;
    let block_size = parse_u64(next("block size")?, "block size")?;
    let declared_opts = parse_u64(next("option count")?, "option count")?;
    let options: Vec<String> = tokens.map(str::to_string).collect();
    if options.is_empty() {
        return Err(format_err("dm-integrity parameters end before options"));
    }

    Ok(IntegrityParams {
        num_blocks,
        block_size,
        declared_opts,
        options,
    })
}

fn parse_crypt(section: &str, standalone: bool) -> Result<CryptParams, MetadataError> {
    let mut tokens = section.split_ascii_whitespace();
    let cipher = tokens
        .next()
        .ok_or_else(|| format_err("unexpected end of dm-crypt parameters"))?
        .to_string();

    let (num_blocks, block_size) = if standalone {
        // a standalone crypt volume declares its own geometry
        let blocks = tokens
            .next()
            .ok_or_else(|| format_err("dm-crypt parameters end before block count"))?;
        let blksize = tokens
            .next()
            .ok_or_else(|| format_err("dm-crypt parameters end before block size"))?;
        (
            Some(parse_u64(blocks, "block count")?),
            Some(parse_u64(blksize, "block size")?),
        )
    } else {
        (None, None)
    };

    if tokens.next().is_some() {
        return Err(format_err("trailing tokens after dm-crypt parameters"));
    }

    Ok(CryptParams {
        cipher,
        num_blocks,
        block_size,
    })
}

impl PartitionMetadata {
    /// Read the trailer from `device`, authenticate it against the PEM public
    /// key at `keyfile` and parse it.
    ///
    /// Nothing from the trailer is interpreted before the signature check
    /// passes; a trailer whose text region is unterminated or leaves no room
    /// for the signature is rejected as corrupt without touching the crypto.
    pub fn load_and_verify(device: &Path, keyfile: &Path) -> Result<Self, MetadataError> {
        let (part_size, buf) = read_trailer(device)?;

        let text_len = buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| MetadataError::Corrupt(device.into()))?;
        if text_len >= META_SIZE - SIG_LEN - 1 {
            return Err(MetadataError::Corrupt(device.into()));
        }

        let sig = &buf[text_len + 1..text_len + 1 + SIG_LEN];
        verify_signature(&buf[..=text_len], sig, keyfile)?;

        Self::parse(device, part_size, &buf[..text_len])
    }

    fn parse(device: &Path, part_size: u64, text: &[u8]) -> Result<Self, MetadataError> {
        let mut sections = text.splitn(3, |&b| b == SECTION_SEPARATOR);
        let header = sections.next().unwrap_or_default();
        let verint_section = sections
            .next()
            .ok_or_else(|| format_err("missing first section separator"))?;
        let crypt_section = sections
            .next()
            .ok_or_else(|| format_err("missing second section separator"))?;

        let header = section_utf8(header, "metadata header")?;
        let mut tokens = header.split_ascii_whitespace();
        let mut next = |what: &str| {
            tokens
                .next()
                .ok_or_else(|| format_err(format!("metadata header ends before {what}")))
        };

        let version = next("version")?;
        if version != META_VERSION {
            return Err(format_err(format!("unsupported metadata version '{version}'")));
        }

        let fs_type = next("filesystem type")?;
        if fs_type.len() > FS_TYPE_MAX {
            return Err(format_err(format!("filesystem type '{fs_type}' too long")));
        }

        let ro = match next("filesystem mode")? {
            "ro" => true,
            "rw" => false,
            other => {
                return Err(format_err(format!(
                    "unsupported filesystem mode '{other}', must be 'ro' or 'rw'"
                )))
            }
        };

        let mode_token = next("crypt mode")?;
        let mode = CryptMode::from_token(mode_token)
            .ok_or_else(|| format_err(format!("unsupported crypt mode '{mode_token}'")))?;

        let verint = match mode.verint_kind() {
            Some(VerintKind::Verity) => Some(VerintParams::Verity(parse_verity(section_utf8(
                verint_section,
                "dm-verity section",
            )?)?)),
            Some(VerintKind::Integrity) => Some(VerintParams::Integrity(parse_integrity(
                section_utf8(verint_section, "dm-integrity section")?,
            )?)),
            None => None,
        };

        let crypt = if mode.uses_crypt() {
            Some(parse_crypt(
                section_utf8(crypt_section, "dm-crypt section")?,
                mode == CryptMode::Crypt,
            )?)
        } else {
            None
        };

        crate::trace!(
            "using rootfs '{}' with filesystem \"{}\", {}",
            device.display(),
            fs_type,
            if ro { "read-only" } else { "read-write" }
        );
        crate::trace!("rootfs device-mapper features: {}", mode.describe());

        Ok(Self {
            device_path: device.into(),
            part_size,
            fs_type: fs_type.to_string(),
            ro,
            mode,
            verint,
            crypt,
            dm_table_verint: String::new(),
            dm_table_crypt: String::new(),
            dm_data_bytes: 0,
        })
    }
}
