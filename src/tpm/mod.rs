//! TPM 2.0 sealed-key flow.
//!
//! Drives the ESAPI layer through a fixed sequence: open the TCTI transport,
//! initialize the ESYS context, self-test, create a primary under the
//! endorsement hierarchy, bind a PCR policy session, then seal or unseal.
//! The primary object's authValue is the SHA-256 digest of the metadata
//! signer's public keyfile, so sealed material is tied to the signer: swap
//! the keyfile and the TPM will not release the key, disk and TPM possession
//! notwithstanding.
//!
//! Handle hygiene is the load-bearing invariant here.  Every transient
//! object and session acquired on the way to a result is flushed on every
//! exit path, and failures additionally sweep all transient handles via the
//! capability interface.  When unsealing fails, a designated PCR is extended
//! with a fixed mark so that subsequent boots can be bound to the outcome;
//! that extension is best-effort and never replaces the original error.

mod pcr;
pub use pcr::parse_pcr_selection;

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use sha2::{Digest as Sha2Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tss_esapi::{
    attributes::{ObjectAttributes, SessionAttributes},
    constants::{tss::TPM2_TRANSIENT_FIRST, CapabilityType, SessionType, StartupType},
    handles::{KeyHandle, ObjectHandle, PcrHandle, TpmHandle},
    interface_types::{
        algorithm::{HashingAlgorithm, PublicAlgorithm},
        ecc::EccCurve,
        resource_handles::Hierarchy,
        session_handles::{AuthSession, HmacSession, PolicySession},
    },
    structures::{
        Auth, CapabilityData, CreateKeyResult, CreatePrimaryKeyResult, Digest, DigestValues,
        EccPoint, KeyedHashScheme, MaxBuffer, PcrSelectionList, Private, Public,
        PublicEccParametersBuilder, PublicKeyedHashParameters, SensitiveData, SymmetricDefinition,
        SymmetricDefinitionObject,
    },
    tcti_ldr::TctiNameConf,
    traits::{Marshall, UnMarshall},
    Context,
};
use zeroize::Zeroizing;

/// PCR extended when unsealing fails, binding subsequent boots to the
/// outcome.
const UNSEAL_FAILURE_PCR: PcrHandle = PcrHandle::Pcr8;

/// The fixed mark whose SHA-256 digest goes into the failure PCR.
const UNSEAL_FAILURE_MARK: &[u8] = b"rootprep:unseal-failed";

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("TPM transport unavailable")]
    Transport(#[source] tss_esapi::Error),
    #[error("TPM refused to release the sealed key (PCR policy mismatch)")]
    PolicyDenied(#[source] tss_esapi::Error),
    #[error("sealed blob is malformed")]
    BadBlob,
    #[error("failed to {op} sealed blob {path:?}")]
    BlobIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid PCR selection: {0}")]
    BadPcr(String),
    #[error("TPM did not return an auth session")]
    NoSession,
    #[error(transparent)]
    Tss(#[from] tss_esapi::Error),
}

/// TPM-produced ciphertext for a sealed key.
///
/// Framing: little-endian u32 length of the marshalled public area, the
/// public area, then the private area.  The split is what `Load` needs to
/// reconstruct the object under the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob(Vec<u8>);

impl SealedBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn encode(public: &Public, private: &Private) -> Result<Self, TpmError> {
        let pub_bytes = public.marshall()?;
        let mut out = Vec::with_capacity(4 + pub_bytes.len() + private.value().len());
        out.extend_from_slice(&(pub_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&pub_bytes);
        out.extend_from_slice(private.value());
        Ok(Self(out))
    }

    fn decode(&self) -> Result<(Public, Private), TpmError> {
        let Some(prefix) = self.0.get(..4) else {
            return Err(TpmError::BadBlob);
        };
        let pub_len = u32::from_le_bytes(prefix.try_into().expect("4-byte slice")) as usize;
        let rest = &self.0[4..];
        if pub_len == 0 || pub_len > rest.len() {
            return Err(TpmError::BadBlob);
        }
        let public = Public::unmarshall(&rest[..pub_len]).map_err(|_| TpmError::BadBlob)?;
        let private = Private::try_from(rest[pub_len..].to_vec()).map_err(|_| TpmError::BadBlob)?;
        Ok((public, private))
    }

    pub fn read_from(path: &Path) -> Result<Self, TpmError> {
        Ok(Self(fs::read(path).map_err(|source| TpmError::BlobIo {
            op: "read",
            path: path.into(),
            source,
        })?))
    }

    /// Persist the blob atomically (tempfile in the target directory, then
    /// rename).
    pub fn write_to(&self, path: &Path) -> Result<(), TpmError> {
        let blob_io = |op: &'static str| {
            move |source: io::Error| TpmError::BlobIo {
                op,
                path: path.into(),
                source,
            }
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(blob_io("stage"))?;
        tmp.write_all(&self.0).map_err(blob_io("write"))?;
        tmp.persist(path).map_err(|e| TpmError::BlobIo {
            op: "persist",
            path: path.into(),
            source: e.error,
        })?;
        Ok(())
    }
}

fn session_object_handle(session: AuthSession) -> Option<ObjectHandle> {
    match session {
        AuthSession::HmacSession(HmacSession::HmacSession { session_handle, .. }) => {
            Some(session_handle.into())
        }
        AuthSession::PolicySession(PolicySession::PolicySession { session_handle, .. }) => {
            Some(session_handle.into())
        }
        _ => None,
    }
}

/// Live connection to the TPM.
pub struct Tpm {
    ctx: Context,
}

impl Tpm {
    /// Open the TCTI transport (explicit configuration string, or the
    /// `TPM2TOOLS_TCTI`/`TCTI` environment), initialize the ESYS context and
    /// run the TPM self-test.
    pub fn connect(tcti: Option<&str>) -> Result<Self, TpmError> {
        let conf = match tcti {
            Some(name) => TctiNameConf::from_str(name),
            None => TctiNameConf::from_environment_variable(),
        }
        .map_err(TpmError::Transport)?;
        let ctx = Context::new(conf).map_err(TpmError::Transport)?;
        let mut tpm = Self { ctx };

        // a firmware- or kernel-started TPM reports TPM_RC_INITIALIZE here
        if let Err(e) = tpm.ctx.startup(StartupType::Clear) {
            crate::trace!("TPM startup skipped: {e}");
        }
        tpm.ctx.self_test(false)?;
        tpm.flush_transient();
        Ok(tpm)
    }

    /// Seal `secret` under the current values of `selection`, authorized by
    /// `pub_key_digest` (the metadata signer binding).
    pub fn seal(
        &mut self,
        pub_key_digest: &[u8; 32],
        selection: &PcrSelectionList,
        secret: &[u8],
    ) -> Result<SealedBlob, TpmError> {
        let primary = self.create_primary(pub_key_digest)?;
        let session = match self.make_session(SessionType::Trial) {
            Ok(session) => session,
            Err(e) => {
                let _ = self.ctx.flush_context(primary.into());
                return Err(e);
            }
        };
        let result = self.seal_under_policy(primary, session, selection, secret);
        self.flush_session(session);
        let _ = self.ctx.flush_context(primary.into());
        if result.is_err() {
            self.flush_transient();
        }
        result
    }

    /// Release a previously sealed key.
    ///
    /// The TPM itself enforces that the live PCR values match the policy
    /// bound at seal time; we merely replay `PolicyPCR` on a real session.
    /// On any failure the designated failure PCR is extended (best-effort)
    /// before the error propagates.
    pub fn unseal(
        &mut self,
        pub_key_digest: &[u8; 32],
        selection: &PcrSelectionList,
        blob: &SealedBlob,
    ) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        let result = self.unseal_inner(pub_key_digest, selection, blob);
        if result.is_err() {
            if let Err(e) = self.extend_failure_pcr() {
                crate::etrace!("extending the unseal-failure PCR failed: {e}");
            }
        }
        result
    }

    /// Fresh random bytes from the TPM, for generating a key to seal.
    pub fn get_random(&mut self, len: usize) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        let bytes = self.ctx.get_random(len)?;
        Ok(Zeroizing::new(bytes.value().to_vec()))
    }

    fn unseal_inner(
        &mut self,
        pub_key_digest: &[u8; 32],
        selection: &PcrSelectionList,
        blob: &SealedBlob,
    ) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        let (public, private) = blob.decode()?;
        let primary = self.create_primary(pub_key_digest)?;
        let sealed = match self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.load(primary, private, public)
            }) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.ctx.flush_context(primary.into());
                self.flush_transient();
                return Err(e.into());
            }
        };
        let result = self.unseal_loaded(sealed, selection);
        let _ = self.ctx.flush_context(sealed.into());
        let _ = self.ctx.flush_context(primary.into());
        if result.is_err() {
            self.flush_transient();
        }
        result
    }

    fn unseal_loaded(
        &mut self,
        sealed: KeyHandle,
        selection: &PcrSelectionList,
    ) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        let session = self.make_session(SessionType::Policy)?;
        let result = self.unseal_with_session(sealed, session, selection);
        self.flush_session(session);
        result
    }

    fn unseal_with_session(
        &mut self,
        sealed: KeyHandle,
        session: AuthSession,
        selection: &PcrSelectionList,
    ) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        let pcr_digest = self.pcr_policy_digest(selection)?;
        self.ctx
            .policy_pcr(session.try_into()?, pcr_digest, selection.clone())?;
        let data = self
            .ctx
            .execute_with_session(Some(session), |ctx| ctx.unseal(sealed.into()))
            .map_err(TpmError::PolicyDenied)?;
        Ok(Zeroizing::new(data.value().to_vec()))
    }

    fn seal_under_policy(
        &mut self,
        primary: KeyHandle,
        session: AuthSession,
        selection: &PcrSelectionList,
        secret: &[u8],
    ) -> Result<SealedBlob, TpmError> {
        let pcr_digest = self.pcr_policy_digest(selection)?;
        self.ctx
            .policy_pcr(session.try_into()?, pcr_digest, selection.clone())?;
        let policy_digest = self.ctx.policy_get_digest(session.try_into()?)?;

        // userWithAuth off, adminWithPolicy on: the object releases its
        // payload only through the PCR policy recorded in authPolicy
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_admin_with_policy(true)
            .build()?;
        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(policy_digest)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()?;

        let data = SensitiveData::try_from(secret.to_vec())?;
        let CreateKeyResult {
            out_private,
            out_public,
            ..
        } = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create(primary, public, None, Some(data), None, None)
            })?;
        SealedBlob::encode(&out_public, &out_private)
    }

    /// Endorsement-hierarchy ECC storage primary with the keyfile digest as
    /// its authValue.
    fn create_primary(&mut self, auth: &[u8; 32]) -> Result<KeyHandle, TpmError> {
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_restricted(true)
            .build()?;
        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_ecc_parameters(
                PublicEccParametersBuilder::new_restricted_decryption_key(
                    SymmetricDefinitionObject::AES_128_CFB,
                    EccCurve::NistP256,
                )
                .build()?,
            )
            .with_ecc_unique_identifier(EccPoint::default())
            .build()?;

        let auth_value = Auth::try_from(auth.to_vec())?;
        let CreatePrimaryKeyResult { key_handle, .. } = {
            let auth_value = auth_value.clone();
            self.ctx.execute_with_nullauth_session(|ctx| {
                ctx.create_primary(
                    Hierarchy::Endorsement,
                    public,
                    Some(auth_value),
                    None,
                    None,
                    None,
                )
            })?
        };
        self.ctx.tr_set_auth(key_handle.into(), auth_value)?;
        Ok(key_handle)
    }

    fn make_session(&mut self, kind: SessionType) -> Result<AuthSession, TpmError> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                kind,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(TpmError::NoSession)?;
        let (attributes, mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.ctx.tr_sess_set_attributes(session, attributes, mask)?;
        Ok(session)
    }

    /// Digest over the live values of `selection`, as `PolicyPCR` wants it:
    /// the hash of the concatenated selected PCR contents.
    fn pcr_policy_digest(&mut self, selection: &PcrSelectionList) -> Result<Digest, TpmError> {
        let (_update_counter, _selection, digests) = self
            .ctx
            .execute_without_session(|ctx| ctx.pcr_read(selection.clone()))?;
        let concatenated: Vec<u8> = digests
            .value()
            .iter()
            .flat_map(|d| d.value().to_vec())
            .collect();
        let concatenated = MaxBuffer::try_from(concatenated)?;
        let (digest, _ticket) = self.ctx.execute_without_session(|ctx| {
            ctx.hash(concatenated, HashingAlgorithm::Sha256, Hierarchy::Owner)
        })?;
        Ok(digest)
    }

    fn extend_failure_pcr(&mut self) -> Result<(), TpmError> {
        let digest = Digest::try_from(Sha256::digest(UNSEAL_FAILURE_MARK).to_vec())?;
        let mut values = DigestValues::new();
        values.set(HashingAlgorithm::Sha256, digest);
        let session = self.make_session(SessionType::Hmac)?;
        let result = self
            .ctx
            .execute_with_session(Some(session), |ctx| {
                ctx.pcr_extend(UNSEAL_FAILURE_PCR, values)
            })
            .map_err(TpmError::from);
        self.flush_session(session);
        result
    }

    fn flush_session(&mut self, session: AuthSession) {
        if let Some(handle) = session_object_handle(session) {
            let _ = self.ctx.flush_context(handle);
        }
    }

    /// Sweep every transient handle still loaded.  Failure cleanup only;
    /// nothing to report if the sweep itself fails.
    fn flush_transient(&mut self) {
        let Ok((capabilities, _more)) =
            self.ctx
                .get_capability(CapabilityType::Handles, TPM2_TRANSIENT_FIRST, 80)
        else {
            return;
        };
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
            {
                if let Ok(object) = self
                    .ctx
                    .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))
                {
                    let _ = self.ctx.flush_context(object);
                }
            }
        }
    }
}

impl Drop for Tpm {
    fn drop(&mut self) {
        // the Context finalizes ESYS and the TCTI; make sure no transient
        // object of ours outlives it on the TPM side
        self.flush_transient();
    }
}
