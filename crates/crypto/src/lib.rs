//! Cryptographic helpers shared across the Nkata backend.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use ed25519_dalek::Signer;
use rand::rngs::OsRng;

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn verifying_key_from(signing_key: &SigningKey) -> VerifyingKey {
    signing_key.verifying_key()
}

/// Decode a URL-safe base64 32-byte seed into a signing key.
pub fn signing_key_from_base64(raw: &str) -> Result<SigningKey> {
    let decoded = URL_SAFE_NO_PAD
        .decode(raw.trim())
        .context("failed to decode signing key from base64 (URL-safe)")?;
    let bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|_| anyhow!("signing key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn signing_key_to_base64(signing_key: &SigningKey) -> String {
    URL_SAFE_NO_PAD.encode(signing_key.to_bytes())
}

pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> Signature {
    signing_key.sign(message)
}

pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    verifying_key
        .verify_strict(message, signature)
        .map_err(|err| anyhow!(err))
}

/// Produce a compact `payload.signature` token, both halves URL-safe base64.
pub fn seal(signing_key: &SigningKey, payload: &[u8]) -> String {
    let signature = sign_message(signing_key, payload);
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(payload),
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
}

/// Verify a token produced by [`seal`] and return its payload bytes.
pub fn open(verifying_key: &VerifyingKey, token: &str) -> Result<Vec<u8>> {
    let (payload, signature) = token
        .trim()
        .split_once('.')
        .ok_or_else(|| anyhow!("token must have two segments"))?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .context("token payload is not valid base64")?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .context("token signature is not valid base64")?;
    let signature = Signature::from_slice(&signature).map_err(|err| anyhow!(err))?;
    verify_signature(verifying_key, &payload, &signature)?;
    Ok(payload)
}
