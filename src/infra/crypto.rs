use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

/// Secret encryption for modem and CMS credentials stored in the database.
///
/// AES-256-GCM, key derived with scrypt (N=16384, r=8, p=1, dklen=32).
/// Cipher text format: `base64(iv) ":" base64(tag) ":" base64(ciphertext)`
/// with a 12-byte IV and 16-byte tag. Input that does not match this shape is
/// treated as plaintext and returned unchanged by `decrypt`.
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_ENV: &str = "CONFIG_ENCRYPTION_KEY";

fn derive_key() -> anyhow::Result<[u8; 32]> {
    let (passphrase, salt): (String, &[u8]) = match std::env::var(KEY_ENV) {
        Ok(k) if !k.is_empty() => (k, b"encryption-salt"),
        _ => {
            tracing::warn!("{KEY_ENV} not set; using insecure default key");
            ("default-dev-key-change-in-production".to_string(), b"salt")
        }
    };
    let params = scrypt::Params::new(14, 8, 1, 32).map_err(|e| anyhow::anyhow!("scrypt params: {e}"))?;
    let mut out = [0u8; 32];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut out)
        .map_err(|e| anyhow::anyhow!("scrypt derive: {e}"))?;
    Ok(out)
}

pub fn encrypt(plaintext: &str) -> anyhow::Result<String> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }
    let key = derive_key()?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let mut iv = [0u8; IV_LEN];
    rand::fill(&mut iv);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), Payload::from(plaintext.as_bytes()))
        .map_err(|e| anyhow::anyhow!("aes-gcm encrypt: {e}"))?;
    // aes-gcm appends the tag to the ciphertext; split for the iv:tag:ct format
    let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    Ok(format!("{}:{}:{}", B64.encode(iv), B64.encode(tag), B64.encode(ct)))
}

/// Decrypt `iv:tag:ciphertext`. Anything that does not parse as that shape is
/// assumed to be legacy plaintext and returned unchanged.
pub fn decrypt(data: &str) -> String {
    if data.is_empty() {
        return String::new();
    }
    match try_decrypt(data) {
        Ok(plain) => plain,
        Err(_) => data.to_string(),
    }
}

pub fn is_encrypted(data: &str) -> bool {
    let parts: Vec<&str> = data.split(':').collect();
    if parts.len() != 3 {
        return false;
    }
    matches!(
        (B64.decode(parts[0]), B64.decode(parts[1])),
        (Ok(iv), Ok(tag)) if iv.len() == IV_LEN && tag.len() == TAG_LEN
    )
}

fn try_decrypt(data: &str) -> anyhow::Result<String> {
    let parts: Vec<&str> = data.split(':').collect();
    anyhow::ensure!(parts.len() == 3, "not iv:tag:ciphertext shaped");
    let iv = B64.decode(parts[0]).context("iv")?;
    let tag = B64.decode(parts[1]).context("tag")?;
    let ct = B64.decode(parts[2]).context("ciphertext")?;
    anyhow::ensure!(iv.len() == IV_LEN && tag.len() == TAG_LEN, "bad iv/tag length");
    let key = derive_key()?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let mut sealed = ct;
    sealed.extend_from_slice(&tag);
    let plain = cipher
        .decrypt(Nonce::from_slice(&iv), Payload::from(sealed.as_slice()))
        .map_err(|e| anyhow::anyhow!("aes-gcm decrypt: {e}"))?;
    String::from_utf8(plain).context("decrypted bytes not utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ct = encrypt("modem-password-123").unwrap();
        assert!(is_encrypted(&ct));
        assert_eq!(decrypt(&ct), "modem-password-123");
    }

    #[test]
    fn plaintext_passes_through() {
        assert_eq!(decrypt("not-encrypted"), "not-encrypted");
        assert_eq!(decrypt("a:b:c"), "a:b:c");
        assert!(!is_encrypted("plain-password"));
    }

    #[test]
    fn empty_string() {
        assert_eq!(encrypt("").unwrap(), "");
        assert_eq!(decrypt(""), "");
    }

    #[test]
    fn tampered_ciphertext_returns_input() {
        let ct = encrypt("secret").unwrap();
        let mut parts: Vec<String> = ct.split(':').map(String::from).collect();
        parts[2] = B64.encode(b"garbage-bytes");
        let tampered = parts.join(":");
        assert_eq!(decrypt(&tampered), tampered);
    }
}
