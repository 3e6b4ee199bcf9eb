use base64::{engine::general_purpose, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::utils::errors::GatewayError;

/// AES-256-GCM cipher for tenant bot tokens at rest.
///
/// The stored envelope is `base64(nonce || ciphertext || tag)`. Key material
/// comes from `ENCRYPTION_KEY` (64 hex chars = 32 bytes) and never leaves
/// this module; decrypted plaintext is handed to the Telegram client and
/// must not be logged.
pub struct TokenCipher {
    key_bytes: [u8; 32],
    rng: SystemRandom,
}

impl TokenCipher {
    /// Build a cipher from the 64-hex-char key string.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, GatewayError> {
        if hex_key.len() != 64 {
            return Err(GatewayError::EncryptionKeyMissing);
        }
        let raw = hex::decode(hex_key).map_err(|_| GatewayError::EncryptionKeyMissing)?;
        let key_bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| GatewayError::EncryptionKeyMissing)?;
        Ok(Self {
            key_bytes,
            rng: SystemRandom::new(),
        })
    }

    fn sealing_key(&self) -> Result<LessSafeKey, GatewayError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key_bytes)
            .map_err(|_| GatewayError::EncryptionKeyMissing)?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypt a plaintext token into the storable envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, GatewayError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| GatewayError::EncryptionKeyMissing)?;

        let key = self.sealing_key()?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| GatewayError::EncryptionKeyMissing)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + in_out.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&in_out);
        Ok(general_purpose::STANDARD.encode(envelope))
    }

    /// Decrypt a stored envelope back into the plaintext token.
    pub fn decrypt(&self, envelope_b64: &str) -> Result<String, GatewayError> {
        let envelope = general_purpose::STANDARD
            .decode(envelope_b64)
            .map_err(|_| GatewayError::EncryptionKeyMissing)?;
        if envelope.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(GatewayError::EncryptionKeyMissing);
        }

        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| GatewayError::EncryptionKeyMissing)?;

        let key = self.sealing_key()?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| GatewayError::EncryptionKeyMissing)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| GatewayError::EncryptionKeyMissing)
    }
}

/// Mask a bot token for admin responses and logs: keep the numeric bot id
/// prefix and the last 4 chars, hide the secret middle.
pub fn mask_token(token: &str) -> String {
    let prefix = token.split(':').next().unwrap_or("");
    let tail: String = token
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}:****{}", prefix, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

    #[test]
    fn round_trip() {
        let cipher = TokenCipher::from_hex_key(KEY).unwrap();
        let token = "123456789:AAF-abcDEFghiJKLmnoPQRstuVWxyz012345";
        let sealed = cipher.encrypt(token).unwrap();
        assert_ne!(sealed, token);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), token);
    }

    #[test]
    fn distinct_nonces_per_encryption() {
        let cipher = TokenCipher::from_hex_key(KEY).unwrap();
        let a = cipher.encrypt("same-token").unwrap();
        let b = cipher.encrypt("same-token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_bad_key_material() {
        assert!(TokenCipher::from_hex_key("deadbeef").is_err());
        assert!(TokenCipher::from_hex_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn rejects_tampered_envelope() {
        let cipher = TokenCipher::from_hex_key(KEY).unwrap();
        let sealed = cipher.encrypt("123456789:secret").unwrap();
        let mut bytes = general_purpose::STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(bytes);
        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn token_masking_hides_secret() {
        let masked = mask_token("123456789:AAF-abcDEFghiJKLmnoPQRstuVWxyz012345");
        assert!(masked.starts_with("123456789:****"));
        assert!(masked.ends_with("2345"));
        assert!(!masked.contains("AAF-abc"));
    }
}
