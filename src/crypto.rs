//! Signature verification for the partition metadata trailer.
//!
//! The trailer carries an RSA-PSS signature over the metadata text (including
//! its NUL terminator).  The matching public key is provided as a PEM file on
//! the initramfs; its SHA-256 digest doubles as the TPM primary-object
//! authorization, binding sealed key material to the metadata signer.

use std::{fs, io, path::Path};

use rsa::{pkcs8::DecodePublicKey, Pss, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length in bytes of a trailer signature (RSA-2048, PSS padding).
pub const SIG_LEN: usize = 256;

/// Verifying a metadata signature failed.
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("failed to read keyfile {path:?}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("keyfile is not a PEM-encoded RSA public key")]
    BadKey(#[from] rsa::pkcs8::spki::Error),
    #[error("signature does not authenticate the metadata")]
    BadSig,
}

/// Verify `sig` against `msg` using the PEM-encoded RSA public key at
/// `keyfile`.
///
/// The signature scheme is RSA-PSS with SHA-256.  Success means `sig` was
/// produced over exactly the bytes of `msg` by the holder of the matching
/// private key.
pub fn verify_signature(msg: &[u8], sig: &[u8], keyfile: &Path) -> Result<(), SignatureError> {
    let pem = fs::read_to_string(keyfile).map_err(|source| SignatureError::Io {
        path: keyfile.into(),
        source,
    })?;
    let key = RsaPublicKey::from_public_key_pem(&pem)?;
    let hashed = Sha256::digest(msg);
    key.verify(Pss::new::<Sha256>(), &hashed, sig)
        .map_err(|_| SignatureError::BadSig)
}

/// SHA-256 digest of the file at `path`.
///
/// Used on the public keyfile to derive the TPM object authorization: whoever
/// controls the signer's public key controls access to the sealed rootfs key.
pub fn sha256_of_keyfile(path: &Path) -> Result<[u8; 32], SignatureError> {
    let bytes = fs::read(path).map_err(|source| SignatureError::Io {
        path: path.into(),
        source,
    })?;
    Ok(Sha256::digest(&bytes).into())
}

#[cfg(test)]
mod tests {
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    use super::*;
    use crate::test::{sign, signing_key};

    #[test]
    fn test_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = dir.path().join("signer.pem");
        let pem = signing_key()
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        fs::write(&keyfile, pem).unwrap();

        let msg = b"v1 ext4 ro plain";
        let sig = sign(msg);
        assert_eq!(sig.len(), SIG_LEN);
        verify_signature(msg, &sig, &keyfile).unwrap();

        // a single flipped bit must be rejected
        let mut bad = sig.clone();
        bad[SIG_LEN - 1] ^= 1;
        assert!(matches!(
            verify_signature(msg, &bad, &keyfile),
            Err(SignatureError::BadSig)
        ));

        // so must a modified message
        assert!(matches!(
            verify_signature(b"v1 ext4 rw plain", &sig, &keyfile),
            Err(SignatureError::BadSig)
        ));
    }

    #[test]
    fn test_bad_keyfile() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = dir.path().join("garbage.pem");
        fs::write(&keyfile, "not a key").unwrap();
        assert!(matches!(
            verify_signature(b"x", &[0; SIG_LEN], &keyfile),
            Err(SignatureError::BadKey(..))
        ));

        assert!(matches!(
            verify_signature(b"x", &[0; SIG_LEN], &dir.path().join("absent.pem")),
            Err(SignatureError::Io { .. })
        ));
    }

    #[test]
    fn test_keyfile_digest() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = dir.path().join("key");
        fs::write(&keyfile, b"some key bytes").unwrap();
        let digest = sha256_of_keyfile(&keyfile).unwrap();
        assert_eq!(digest, <[u8; 32]>::from(Sha256::digest(b"some key bytes")));
    }
}
