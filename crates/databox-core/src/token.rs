//! Session tokens - signed, tamper-evident session snapshots.
//!
//! ## Token Format
//!
//! ```text
//! base64url(json(DbSessionData)) "." base64url(HMAC-SHA256)
//! ```
//!
//! The signing key is derived from the global secret, the token format
//! version, the DataBox id and its api level. Family members append their
//! member id, so a token never validates for another DataBox or member.

use crate::error::Result;
use crate::session::DbSessionData;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Bumped whenever the payload layout changes; old tokens stop validating.
pub const TOKEN_VERSION: u32 = 1;

/// Signing key scoped to one DataBox instance
#[derive(Clone)]
pub struct SessionTokenKey {
    key: [u8; 32],
}

impl SessionTokenKey {
    /// Derive the instance key from the global secret
    pub fn derive(secret: &[u8], data_box_id: &str, api_level: Option<u32>) -> Self {
        let scope = match api_level {
            Some(level) => format!("dbst:v{}:{}:{}", TOKEN_VERSION, data_box_id, level),
            None => format!("dbst:v{}:{}:-", TOKEN_VERSION, data_box_id),
        };
        Self {
            key: hmac_sha256(secret, scope.as_bytes()),
        }
    }

    /// Sign session data; `key_append` scopes the token to a family member
    pub fn sign(&self, session: &DbSessionData, key_append: Option<&str>) -> Result<String> {
        let payload = serde_json::to_vec(session)?;
        let mac = hmac_sha256(&self.scoped_key(key_append), &payload);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(mac)
        ))
    }

    /// Verify a token. Any failure means there is no resumable session.
    pub fn verify(&self, token: &str, key_append: Option<&str>) -> Option<DbSessionData> {
        let (payload_b64, mac_b64) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(mac_b64).ok()?;

        let mut mac = HmacSha256::new_from_slice(&self.scoped_key(key_append)).ok()?;
        mac.update(&payload);
        if mac.verify_slice(&signature).is_err() {
            debug!("Session token signature mismatch");
            return None;
        }

        serde_json::from_slice(&payload).ok()
    }

    fn scoped_key(&self, key_append: Option<&str>) -> [u8; 32] {
        match key_append {
            Some(append) => hmac_sha256(&self.key, append.as_bytes()),
            None => self.key,
        }
    }
}

impl std::fmt::Debug for SessionTokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionTokenKey(..)")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}
