//! Sealed secret envelopes.
//!
//! A sealed envelope lets a browser or the control plane address secrets to
//! one specific runner key without the control plane ever holding plaintext.
//! It is a hybrid construction:
//!
//! - a fresh AES-256-GCM content key encrypts the payload, with the caller's
//!   AAD (typically the job id) bound into the tag;
//! - the content key is wrapped with RSA-OAEP(SHA-256) to the runner's
//!   RSA-3072 public key.
//!
//! # Wire format
//!
//! ```text
//! {"v":1,"alg":"rsa-oaep-3072/aes-256-gcm","kid":"<b64url sha256(spki)>",
//!  "iv":"<b64url 12B>","w":"<b64url wrapped key>","ct":"<b64url ciphertext||tag>"}
//! ```
//!
//! The JSON object is itself base64url-encoded into one opaque string.
//!
//! # Validation
//!
//! Unsealing is fail-closed: size cap, structure, algorithm and key id are
//! checked before any cryptography runs, binary fields must be canonical
//! unpadded base64url, and there is no path that returns unauthenticated
//! plaintext.

use aes_gcm::aead::{Aead, AeadCore, AeadInPlace, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, EnvelopeError};
use crate::keypair::{RSA_KEY_BITS, key_id_for_spki};

/// The only envelope algorithm runners accept.
pub const ENVELOPE_ALG: &str = "rsa-oaep-3072/aes-256-gcm";

/// Envelope format version.
pub const ENVELOPE_VERSION: u64 = 1;

/// Upper bound on the encoded envelope, checked before any parsing.
pub const MAX_ENVELOPE_BYTES: usize = 2 * 1024 * 1024;

/// AES-GCM nonce length.
const IV_LEN: usize = 12;

/// AES-256 key length.
const CONTENT_KEY_LEN: usize = 32;

/// AES-GCM tag length.
const TAG_LEN: usize = 16;

/// At least one ciphertext byte plus the tag.
const MIN_CT_LEN: usize = TAG_LEN + 1;

/// Decoder that tolerates padding and non-zero trailing bits, so that
/// non-canonical input is caught by the re-encode check with a clear message
/// instead of an opaque decode error.
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decoded envelope fields, still base64url-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Format version, always [`ENVELOPE_VERSION`].
    pub v: u64,
    /// Algorithm identifier, always [`ENVELOPE_ALG`].
    pub alg: String,
    /// Key id of the runner key the content key is wrapped to.
    pub kid: String,
    /// AES-GCM nonce.
    pub iv: String,
    /// RSA-OAEP wrapped content key.
    pub w: String,
    /// AES-GCM ciphertext with the 16-byte tag appended.
    pub ct: String,
}

impl SealedEnvelope {
    /// Encode as the single base64url transport string.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if JSON serialization fails.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        let json = serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed {
            reason: format!("failed to serialize envelope: {e}"),
        })?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode and structurally validate a transport string.
    ///
    /// Checks the size cap, version, and presence of every field as a
    /// non-empty string. Does not touch any key material.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::TooLarge`] if the input exceeds [`MAX_ENVELOPE_BYTES`].
    /// - [`EnvelopeError::Malformed`] for any structural problem.
    pub fn decode(envelope_b64: &str) -> Result<Self, EnvelopeError> {
        if envelope_b64.len() > MAX_ENVELOPE_BYTES {
            return Err(EnvelopeError::TooLarge {
                size: envelope_b64.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }

        let raw = LENIENT_URL_SAFE
            .decode(envelope_b64.trim())
            .map_err(|e| malformed(format!("envelope is not base64url: {e}")))?;

        let value: Value = serde_json::from_slice(&raw)
            .map_err(|e| malformed(format!("envelope is not JSON: {e}")))?;
        let Value::Object(fields) = value else {
            return Err(malformed("envelope is not a JSON object"));
        };

        if fields.get("v").and_then(Value::as_u64) != Some(ENVELOPE_VERSION) {
            return Err(malformed(format!("unsupported version (expected v={ENVELOPE_VERSION})")));
        }

        Ok(Self {
            v: ENVELOPE_VERSION,
            alg: required_str(&fields, "alg")?,
            kid: required_str(&fields, "kid")?,
            iv: required_str(&fields, "iv")?,
            w: required_str(&fields, "w")?,
            ct: required_str(&fields, "ct")?,
        })
    }
}

fn required_str(fields: &Map<String, Value>, name: &str) -> Result<String, EnvelopeError> {
    match fields.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(malformed(format!("field '{name}' is empty"))),
        Some(_) => Err(malformed(format!("field '{name}' is not a string"))),
        None => Err(malformed(format!("field '{name}' is missing"))),
    }
}

fn malformed(reason: impl Into<String>) -> EnvelopeError {
    EnvelopeError::Malformed {
        reason: reason.into(),
    }
}

/// Decode a binary field, rejecting any encoding other than the canonical
/// unpadded base64url of the decoded bytes.
fn decode_canonical(name: &str, encoded: &str) -> Result<Vec<u8>, EnvelopeError> {
    let bytes = LENIENT_URL_SAFE
        .decode(encoded)
        .map_err(|e| malformed(format!("field '{name}' is not base64url: {e}")))?;

    if URL_SAFE_NO_PAD.encode(&bytes) != encoded {
        return Err(malformed(format!("field '{name}' is not canonical base64url")));
    }
    Ok(bytes)
}

/// AES-256 content key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct ContentKey([u8; CONTENT_KEY_LEN]);

impl ContentKey {
    fn from_unwrapped(unwrapped: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; CONTENT_KEY_LEN] =
            unwrapped
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: CONTENT_KEY_LEN,
                    actual: unwrapped.len(),
                })?;
        Ok(Self(bytes))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// Unseal an envelope with a PKCS#8 PEM private key.
///
/// `alg` must equal `expected_alg` (default [`ENVELOPE_ALG`]); when
/// `expected_kid` is given a mismatch yields [`EnvelopeError::KeyChanged`].
/// Both are enforced before any decryption.
///
/// # Errors
///
/// - [`EnvelopeError::Crypto`] if the PEM cannot be parsed, or see
///   [`unseal_with_key`].
pub fn unseal(
    private_key_pem: &str,
    aad: &str,
    envelope_b64: &str,
    expected_alg: Option<&str>,
    expected_kid: Option<&str>,
) -> Result<String, EnvelopeError> {
    // Bound the input before spending time on key parsing.
    if envelope_b64.len() > MAX_ENVELOPE_BYTES {
        return Err(EnvelopeError::TooLarge {
            size: envelope_b64.len(),
            max: MAX_ENVELOPE_BYTES,
        });
    }

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem.trim()).map_err(|e| {
        EnvelopeError::Crypto(CryptoError::Unwrap {
            reason: format!("invalid private key: {e}"),
        })
    })?;
    unseal_with_key(&private_key, aad, envelope_b64, expected_alg, expected_kid)
}

/// Unseal an envelope with an already-parsed private key.
///
/// Returns the payload as UTF-8 text. The codec is payload-agnostic; by
/// convention the payload is a small JSON object of secret name to value.
///
/// # Errors
///
/// - [`EnvelopeError::TooLarge`] if the envelope exceeds [`MAX_ENVELOPE_BYTES`].
/// - [`EnvelopeError::Malformed`] for structural or encoding problems.
/// - [`EnvelopeError::UnsupportedAlgorithm`] if `alg` differs from `expected_alg`.
/// - [`EnvelopeError::KeyChanged`] if `kid` differs from `expected_kid`.
/// - [`EnvelopeError::Crypto`] if unwrapping or authenticated decryption fails.
/// - [`EnvelopeError::InvalidUtf8`] if the authenticated payload is not UTF-8.
pub fn unseal_with_key(
    private_key: &RsaPrivateKey,
    aad: &str,
    envelope_b64: &str,
    expected_alg: Option<&str>,
    expected_kid: Option<&str>,
) -> Result<String, EnvelopeError> {
    let envelope = SealedEnvelope::decode(envelope_b64)?;

    if envelope.alg != expected_alg.unwrap_or(ENVELOPE_ALG) {
        return Err(EnvelopeError::UnsupportedAlgorithm { alg: envelope.alg });
    }
    if let Some(kid) = expected_kid {
        if envelope.kid != kid {
            debug!(envelope_kid = %envelope.kid, current_kid = %kid, "envelope sealed to a stale key");
            return Err(EnvelopeError::KeyChanged {
                expected: kid.to_owned(),
                actual: envelope.kid,
            });
        }
    }

    let iv = decode_canonical("iv", &envelope.iv)?;
    if iv.len() != IV_LEN {
        return Err(malformed(format!(
            "field 'iv' must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    let wrapped = decode_canonical("w", &envelope.w)?;
    let ct = decode_canonical("ct", &envelope.ct)?;
    if ct.len() < MIN_CT_LEN {
        return Err(malformed(format!(
            "field 'ct' must be at least {MIN_CT_LEN} bytes, got {}",
            ct.len()
        )));
    }

    let unwrapped = Zeroizing::new(
        private_key
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(|e| CryptoError::Unwrap {
                reason: e.to_string(),
            })?,
    );
    let content_key = ContentKey::from_unwrapped(&unwrapped)?;

    let (body, tag) = ct.split_at(ct.len().saturating_sub(TAG_LEN));
    let mut buffer = Zeroizing::new(body.to_vec());
    content_key
        .cipher()
        .decrypt_in_place_detached(
            Nonce::from_slice(&iv),
            aad.as_bytes(),
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })?;

    String::from_utf8(buffer.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8)
}

/// Seal `plaintext` to the runner whose public key is `public_key_spki_b64`.
///
/// The envelope's `kid` is derived from the public key itself.
///
/// # Errors
///
/// - [`EnvelopeError::Crypto`] with [`CryptoError::InvalidPublicKey`] if the
///   key cannot be parsed or is smaller than RSA-3072.
/// - See [`seal_to_key`].
pub fn seal(
    public_key_spki_b64: &str,
    aad: &str,
    plaintext: &[u8],
) -> Result<String, EnvelopeError> {
    let der = LENIENT_URL_SAFE
        .decode(public_key_spki_b64.trim())
        .map_err(|e| CryptoError::InvalidPublicKey {
            reason: format!("not base64url: {e}"),
        })?;
    let public_key =
        RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::InvalidPublicKey {
            reason: e.to_string(),
        })?;
    seal_to_key(&public_key, aad, plaintext)
}

/// Seal `plaintext` to an already-parsed public key.
///
/// # Errors
///
/// - [`EnvelopeError::Malformed`] if `plaintext` is empty.
/// - [`EnvelopeError::TooLarge`] if the resulting envelope would exceed
///   [`MAX_ENVELOPE_BYTES`].
/// - [`EnvelopeError::Crypto`] if the key is too small or a crypto step fails.
pub fn seal_to_key(
    public_key: &RsaPublicKey,
    aad: &str,
    plaintext: &[u8],
) -> Result<String, EnvelopeError> {
    if plaintext.is_empty() {
        return Err(malformed("plaintext must not be empty"));
    }

    let bits = public_key.size().saturating_mul(8);
    if bits < RSA_KEY_BITS {
        return Err(CryptoError::InvalidPublicKey {
            reason: format!("modulus is {bits} bits, need at least {RSA_KEY_BITS}"),
        }
        .into());
    }

    let spki = rsa::pkcs8::EncodePublicKey::to_public_key_der(public_key).map_err(|e| {
        CryptoError::InvalidPublicKey {
            reason: e.to_string(),
        }
    })?;

    let raw_key = Aes256Gcm::generate_key(OsRng);
    let content_key = ContentKey::from_unwrapped(raw_key.as_slice())?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ct = content_key
        .cipher()
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let wrapped = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key.0)
        .map_err(|e| CryptoError::Wrap {
            reason: e.to_string(),
        })?;

    let encoded = SealedEnvelope {
        v: ENVELOPE_VERSION,
        alg: ENVELOPE_ALG.to_owned(),
        kid: key_id_for_spki(spki.as_bytes()),
        iv: URL_SAFE_NO_PAD.encode(nonce),
        w: URL_SAFE_NO_PAD.encode(wrapped),
        ct: URL_SAFE_NO_PAD.encode(ct),
    }
    .encode()?;

    if encoded.len() > MAX_ENVELOPE_BYTES {
        return Err(EnvelopeError::TooLarge {
            size: encoded.len(),
            max: MAX_ENVELOPE_BYTES,
        });
    }
    Ok(encoded)
}
