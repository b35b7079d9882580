//! Per-runner RSA keypair storage.
//!
//! Each runner owns one RSA-3072 keypair. Sealing parties address secrets to
//! the runner's public key, identified by a content-derived key id:
//! `kid = base64url(SHA-256(SPKI DER))`.
//!
//! # Storage model
//!
//! - Only the private key is persisted, as PKCS#8 PEM, at a deterministic
//!   path derived from the runtime directory, project id and runner name.
//! - The public key is never stored; it is re-derived from the private key
//!   on every load, so the two can never drift apart.
//! - The key directory is owner-only (`0700`) and the key file `0600`.
//! - First creation is race-safe without a lock file: the new key is written
//!   to a temporary file and published with a no-clobber link. A runner that
//!   loses the race discards its key and re-reads the winner's.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use aes_gcm::aead::OsRng;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::envelope::{self, ENVELOPE_ALG};
use crate::error::{EnvelopeError, KeypairError};

/// RSA modulus size for runner keys.
pub const RSA_KEY_BITS: usize = 3072;

/// Directory (under the runtime directory) holding runner keys.
const KEYS_DIR: &str = "runner-keys";

/// Runtime directory used when none is configured, relative to `$HOME`.
const DEFAULT_RUNTIME_DIR: &str = ".clawlets";

/// Resolve the private key path for a runner.
///
/// The layout is `<runtime_dir>/runner-keys/<project_id>/<runner_name>.pem`.
/// Every caller-supplied segment is sanitized to `[A-Za-z0-9._-]`, so the
/// result can never escape the keys directory. When `runtime_dir` is `None`
/// (or empty), `$HOME/.clawlets` is used.
///
/// # Errors
///
/// Returns [`KeypairError::UnresolvedPath`] if no runtime directory is
/// configured and the home directory cannot be determined.
pub fn resolve_key_path(
    runtime_dir: Option<&Path>,
    project_id: &str,
    runner_name: &str,
) -> Result<PathBuf, KeypairError> {
    let base = match runtime_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => home_dir()?.join(DEFAULT_RUNTIME_DIR),
    };

    Ok(base
        .join(KEYS_DIR)
        .join(sanitize_segment(project_id))
        .join(format!("{}.pem", sanitize_segment(runner_name))))
}

/// Restrict a path segment to `[A-Za-z0-9._-]`.
///
/// Disallowed characters become `_`. Segments that would be empty or consist
/// only of dots (`.`, `..`) are replaced so they cannot act as traversal.
fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

fn home_dir() -> Result<PathBuf, KeypairError> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .map_err(|_| KeypairError::UnresolvedPath {
            reason: "no runtime directory configured and HOME / USERPROFILE not set".to_owned(),
        })
}

/// Public key advertisement published to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAdvertisement {
    /// Envelope algorithm this key accepts.
    pub alg: String,
    /// Content-derived key id.
    pub kid: String,
    /// Base64url SPKI DER of the public key.
    pub public_key_spki_b64: String,
}

/// A loaded runner keypair.
///
/// The private key never appears in `Debug` output.
#[derive(Clone)]
pub struct RunnerKeypair {
    private_key: RsaPrivateKey,
    private_key_pem: Zeroizing<String>,
    public_key_spki_b64: String,
    key_id: String,
}

impl RunnerKeypair {
    /// Generate a fresh, unpersisted RSA-3072 keypair (public exponent 65537).
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::Generation`] or [`KeypairError::Encoding`] if
    /// key generation or encoding fails.
    pub fn generate() -> Result<Self, KeypairError> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).map_err(|e| KeypairError::Generation {
                reason: e.to_string(),
            })?;
        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeypairError::Encoding {
                reason: e.to_string(),
            })?;
        Self::from_parts(private_key, pem)
    }

    /// Parse a PKCS#8 PEM private key.
    ///
    /// `origin` is only used for error messages.
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::InvalidKey`] if the PEM cannot be parsed or the
    /// modulus is smaller than [`RSA_KEY_BITS`].
    pub fn from_pem(origin: &Path, pem: Zeroizing<String>) -> Result<Self, KeypairError> {
        let private_key =
            RsaPrivateKey::from_pkcs8_pem(pem.trim()).map_err(|e| KeypairError::InvalidKey {
                path: origin.display().to_string(),
                reason: e.to_string(),
            })?;

        let bits = private_key.size().saturating_mul(8);
        if bits < RSA_KEY_BITS {
            return Err(KeypairError::InvalidKey {
                path: origin.display().to_string(),
                reason: format!("modulus is {bits} bits, need at least {RSA_KEY_BITS}"),
            });
        }

        Self::from_parts(private_key, pem)
    }

    fn from_parts(
        private_key: RsaPrivateKey,
        private_key_pem: Zeroizing<String>,
    ) -> Result<Self, KeypairError> {
        let spki = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| KeypairError::Encoding {
                reason: e.to_string(),
            })?;
        let spki_der = spki.as_bytes();

        Ok(Self {
            private_key,
            private_key_pem,
            public_key_spki_b64: URL_SAFE_NO_PAD.encode(spki_der),
            key_id: key_id_for_spki(spki_der),
        })
    }

    /// The RSA private key.
    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// The private key as PKCS#8 PEM.
    ///
    /// Use with care: the caller must not log or persist this string.
    #[must_use]
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Base64url SPKI DER of the public key.
    #[must_use]
    pub fn public_key_spki_b64(&self) -> &str {
        &self.public_key_spki_b64
    }

    /// Content-derived key id.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Envelope algorithm this key accepts.
    #[must_use]
    pub fn alg(&self) -> &'static str {
        ENVELOPE_ALG
    }

    /// Build the record the runner publishes so sealing parties can address it.
    #[must_use]
    pub fn advertisement(&self) -> KeyAdvertisement {
        KeyAdvertisement {
            alg: ENVELOPE_ALG.to_owned(),
            kid: self.key_id.clone(),
            public_key_spki_b64: self.public_key_spki_b64.clone(),
        }
    }

    /// Unseal an envelope addressed to this key, pinning both the algorithm
    /// and this key's id.
    ///
    /// # Errors
    ///
    /// See [`envelope::unseal_with_key`].
    pub fn unseal(&self, aad: &str, envelope_b64: &str) -> Result<String, EnvelopeError> {
        envelope::unseal_with_key(
            &self.private_key,
            aad,
            envelope_b64,
            Some(ENVELOPE_ALG),
            Some(&self.key_id),
        )
    }
}

impl fmt::Debug for RunnerKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerKeypair")
            .field("key_id", &self.key_id)
            .field("private_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Compute `base64url(SHA-256(spki_der))`.
#[must_use]
pub fn key_id_for_spki(spki_der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(spki_der))
}

/// Filesystem-backed keypair store for one runner.
#[derive(Debug, Clone)]
pub struct KeypairStore {
    path: PathBuf,
}

impl KeypairStore {
    /// Create a store for the key at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a store at the path resolved by [`resolve_key_path`].
    ///
    /// # Errors
    ///
    /// See [`resolve_key_path`].
    pub fn for_runner(
        runtime_dir: Option<&Path>,
        project_id: &str,
        runner_name: &str,
    ) -> Result<Self, KeypairError> {
        resolve_key_path(runtime_dir, project_id, runner_name).map(Self::new)
    }

    /// Path of the private key file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the runner key, generating and persisting one if none exists.
    ///
    /// Runs on the blocking pool: RSA key generation is CPU-bound. Repeated
    /// calls against the same path return the same key.
    ///
    /// # Errors
    ///
    /// See [`load_or_create`].
    pub async fn load_or_create(&self) -> Result<RunnerKeypair, KeypairError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_or_create(&path))
            .await
            .map_err(|e| KeypairError::Generation {
                reason: format!("key loading task failed: {e}"),
            })?
    }
}

/// Load the private key at `path`, creating it on first use.
///
/// # Errors
///
/// - [`KeypairError::Io`] if the directory or file cannot be created or read.
/// - [`KeypairError::InvalidKey`] if an existing key is unparseable or too small.
/// - [`KeypairError::Generation`] / [`KeypairError::Encoding`] on key generation failure.
pub fn load_or_create(path: &Path) -> Result<RunnerKeypair, KeypairError> {
    let dir = ensure_key_dir(path)?;

    if let Some(keypair) = read_existing(path)? {
        debug!(key_id = %keypair.key_id(), "loaded runner key");
        return Ok(keypair);
    }

    let keypair = RunnerKeypair::generate()?;

    match publish_exclusive(&dir, path, keypair.private_key_pem().as_bytes()) {
        Ok(()) => {
            info!(path = %path.display(), key_id = %keypair.key_id(), "generated runner key");
            Ok(keypair)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // Another runner published first; its key wins.
            debug!(path = %path.display(), "lost runner key creation race, re-reading");
            read_existing(path)?.ok_or_else(|| KeypairError::Io {
                path: path.display().to_string(),
                reason: "key file vanished after creation race".to_owned(),
            })
        }
        Err(e) => Err(io_error(path, &e)),
    }
}

fn read_existing(path: &Path) -> Result<Option<RunnerKeypair>, KeypairError> {
    match fs::read_to_string(path) {
        Ok(pem) => RunnerKeypair::from_pem(path, Zeroizing::new(pem)).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, &e)),
    }
}

/// Create the key's parent directory and restrict it to the owner.
fn ensure_key_dir(path: &Path) -> Result<PathBuf, KeypairError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    fs::create_dir_all(&dir).map_err(|e| io_error(&dir, &e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| io_error(&dir, &e))?;
    }

    Ok(dir)
}

/// Write `contents` to a temp file in `dir`, then link it to `path` only if
/// `path` does not exist yet. Readers never observe a partially written key.
fn publish_exclusive(dir: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let mut tmp = tempfile::Builder::new()
        .prefix(".runner-key-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

fn io_error(path: &Path, err: &io::Error) -> KeypairError {
    KeypairError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
