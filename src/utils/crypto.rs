use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::{
    aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN},
    rand::{SecureRandom, SystemRandom},
};
use uuid::Uuid;

use crate::service::error::ServiceError;

/// Seals payment account identifiers with AES-256-GCM. The owner id is bound
/// as associated data, so a ciphertext copied onto another user's row fails
/// to open. Stored form is base64(nonce || ciphertext || tag).
pub struct AccountVault {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for AccountVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccountVault")
    }
}

impl AccountVault {
    pub fn new(key: &[u8; 32]) -> Result<Self, ServiceError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| ServiceError::Encryption("invalid data key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn seal(&self, owner_id: Uuid, account: &str) -> Result<String, ServiceError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| ServiceError::Encryption("nonce generation failed".to_string()))?;

        let mut in_out = account.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(owner_id.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| ServiceError::Encryption("seal failed".to_string()))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&in_out);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, owner_id: Uuid, sealed: &str) -> Result<String, ServiceError> {
        let bytes = STANDARD
            .decode(sealed)
            .map_err(|e| ServiceError::Encryption(format!("stored account is not base64: {}", e)))?;
        if bytes.len() <= NONCE_LEN {
            return Err(ServiceError::Encryption("stored account is truncated".to_string()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| ServiceError::Encryption("bad nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::from(owner_id.as_bytes()), &mut in_out)
            .map_err(|_| ServiceError::Encryption("account does not authenticate".to_string()))?;
        String::from_utf8(plain.to_vec()).map_err(|e| ServiceError::Encryption(e.to_string()))
    }
}
