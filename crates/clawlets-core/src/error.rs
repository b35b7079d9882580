//! Error types for `clawlets-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Nothing here ever includes key material, plaintext, or secret
//! values; only lengths, identifiers, paths, and operation descriptions.

use std::fmt;

use serde::Serialize;

/// Errors from loading or creating the runner keypair.
#[derive(Debug, thiserror::Error)]
pub enum KeypairError {
    /// A filesystem operation on the key file or its directory failed.
    #[error("key file i/o failed at '{path}': {reason}")]
    Io { path: String, reason: String },

    /// No runtime directory was configured and no home directory is known.
    #[error("cannot resolve key path: {reason}")]
    UnresolvedPath { reason: String },

    /// The stored private key could not be parsed or is unacceptable.
    #[error("invalid private key at '{path}': {reason}")]
    InvalidKey { path: String, reason: String },

    /// RSA key generation failed.
    #[error("key generation failed: {reason}")]
    Generation { reason: String },

    /// Encoding the public key as SPKI DER failed.
    #[error("public key encoding failed: {reason}")]
    Encoding { reason: String },
}

/// Errors from the cryptographic steps of sealing and unsealing.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// RSA-OAEP unwrap of the content key failed.
    #[error("key unwrap failed: {reason}")]
    Unwrap { reason: String },

    /// RSA-OAEP wrap of the content key failed.
    #[error("key wrap failed: {reason}")]
    Wrap { reason: String },

    /// The unwrapped content key is not an AES-256 key.
    #[error("unwrapped key has wrong length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// AES-256-GCM authentication failed (wrong key, wrong AAD, or tampered data).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// The public key handed to the sealer could not be parsed.
    #[error("invalid public key: {reason}")]
    InvalidPublicKey { reason: String },
}

/// Errors from sealing or unsealing a [`SealedEnvelope`](crate::envelope::SealedEnvelope).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The encoded envelope exceeds the size cap; nothing was parsed.
    #[error("envelope too large: {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    /// The envelope is structurally invalid.
    #[error("malformed envelope: {reason}")]
    Malformed { reason: String },

    /// The envelope was sealed with an algorithm this runner does not accept.
    #[error("unsupported envelope algorithm '{alg}'")]
    UnsupportedAlgorithm { alg: String },

    /// The envelope targets a different runner key generation.
    ///
    /// Callers should re-seal against the runner's current key rather than
    /// retry the same envelope.
    #[error("runner key changed (envelope kid '{actual}', current kid '{expected}'); re-seal against the current key")]
    KeyChanged { expected: String, actual: String },

    /// The decrypted payload is not valid UTF-8.
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,

    /// A cryptographic step failed.
    #[error("envelope crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl EnvelopeError {
    /// Whether this failure means the sealing party must re-seal against the
    /// runner's current key.
    #[must_use]
    pub fn is_key_changed(&self) -> bool {
        matches!(self, Self::KeyChanged { .. })
    }
}

/// Best-known exit state of a child process at the time a call settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal number, if the process was killed by a signal.
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("exit status unknown"),
        }
    }
}

/// Errors from [`exec`](crate::exec).
///
/// A child that exits non-zero on its own is NOT an error; that is reported
/// in the result. These variants cover failures to run the child at all and
/// terminations the executor itself imposed, which carry the child's final
/// [`ExitInfo`] as `cause`.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The child process could not be spawned.
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// Reading child output or waiting for the child failed.
    #[error("i/o error while running '{program}': {reason}")]
    Io { program: String, reason: String },

    /// The child exceeded its time budget and was terminated.
    #[error("'{program}' timed out after {timeout_ms}ms ({cause})")]
    Timeout {
        program: String,
        timeout_ms: u64,
        cause: ExitInfo,
    },

    /// The child wrote more stdout than the hard cap allows and was terminated.
    #[error("'{program}' stdout exceeded {max_bytes} bytes ({cause})")]
    StdoutLimitExceeded {
        program: String,
        max_bytes: usize,
        cause: ExitInfo,
    },

    /// The caller cancelled the run and the child was terminated.
    #[error("'{program}' was cancelled ({cause})")]
    Cancelled { program: String, cause: ExitInfo },
}

impl ExecError {
    /// Exit state of a child the executor had to terminate.
    ///
    /// `None` for spawn and i/o failures, where there is no meaningful
    /// partial process state.
    #[must_use]
    pub fn cause(&self) -> Option<&ExitInfo> {
        match self {
            Self::Timeout { cause, .. }
            | Self::StdoutLimitExceeded { cause, .. }
            | Self::Cancelled { cause, .. } => Some(cause),
            Self::Spawn { .. } | Self::Io { .. } => None,
        }
    }

    /// Whether the executor terminated the child (as opposed to failing to
    /// run it at all).
    #[must_use]
    pub fn is_termination(&self) -> bool {
        self.cause().is_some()
    }
}
