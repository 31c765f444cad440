use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rootprep::{
    activate::{prepare_root, KeyUnsealer, NoSealedKey, TpmKeyUnsealer},
    crypto::sha256_of_keyfile,
    dm::Dmsetup,
    keyring::KeyctlCommand,
    tpm::{parse_pcr_selection, Tpm},
};

#[derive(Parser, Debug)]
#[command(version, about = "Early-boot rootfs preparation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate the partition metadata and activate the rootfs
    /// device-mapper stack
    Setup {
        #[arg(long, help = "Block device holding the rootfs")]
        device: PathBuf,

        #[arg(long, help = "PEM public key of the metadata signer")]
        keyfile: PathBuf,

        #[arg(long, help = "TPM-sealed key blob (required for crypt modes)")]
        sealed_blob: Option<PathBuf>,

        #[arg(
            long,
            default_value = "0,1,2,3,4,5,6,7",
            help = "PCR selection the sealed key is bound to"
        )]
        pcrs: String,

        #[arg(
            long,
            default_value = "rootfs",
            help = "Name prefix for created dm devices"
        )]
        dm_prefix: String,

        #[arg(long, help = "TCTI configuration (for testing against swtpm)")]
        tcti: Option<String>,
    },
    /// Generate a fresh key, seal it against the PCR policy and write the
    /// blob (provisioning time)
    SealKey {
        #[arg(long, help = "PEM public key of the metadata signer")]
        keyfile: PathBuf,

        #[arg(long, help = "Where to write the sealed blob")]
        sealed_blob: PathBuf,

        #[arg(long, default_value = "0,1,2,3,4,5,6,7")]
        pcrs: String,

        #[arg(long, default_value_t = 32, help = "Key length in bytes")]
        key_bytes: usize,

        #[arg(long, help = "TCTI configuration (for testing against swtpm)")]
        tcti: Option<String>,
    },
}

fn setup(
    device: PathBuf,
    keyfile: PathBuf,
    sealed_blob: Option<PathBuf>,
    pcrs: String,
    dm_prefix: String,
    tcti: Option<String>,
) -> Result<()> {
    let dm = Dmsetup::default();
    let keys = KeyctlCommand::default();
    let mut unsealer: Box<dyn KeyUnsealer> = match sealed_blob {
        Some(blob) => Box::new(TpmKeyUnsealer::new(tcti, blob, pcrs)),
        None => Box::new(NoSealedKey),
    };

    let top = prepare_root(
        &device,
        &keyfile,
        &dm_prefix,
        &dm,
        &keys,
        unsealer.as_mut(),
    )?;

    // the mount/pivot stage consumes this
    println!("{}", top.display());
    Ok(())
}

fn seal_key(
    keyfile: PathBuf,
    sealed_blob: PathBuf,
    pcrs: String,
    key_bytes: usize,
    tcti: Option<String>,
) -> Result<()> {
    let selection = parse_pcr_selection(&pcrs)?;
    let digest = sha256_of_keyfile(&keyfile)?;
    let mut tpm = Tpm::connect(tcti.as_deref()).context("connecting to the TPM")?;

    let key = tpm.get_random(key_bytes)?;
    let blob = tpm.seal(&digest, &selection, &key)?;
    blob.write_to(&sealed_blob)
        .with_context(|| format!("writing sealed blob to {sealed_blob:?}"))?;

    // the provisioning side enrolls this key into the dm-crypt volume
    println!("{}", hex::encode(&*key));
    Ok(())
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Setup {
            device,
            keyfile,
            sealed_blob,
            pcrs,
            dm_prefix,
            tcti,
        } => setup(device, keyfile, sealed_blob, pcrs, dm_prefix, tcti),
        Command::SealKey {
            keyfile,
            sealed_blob,
            pcrs,
            key_bytes,
            tcti,
        } => seal_key(keyfile, sealed_blob, pcrs, key_bytes, tcti),
    }
}
