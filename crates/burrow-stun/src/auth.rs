//! STUN credentials and MESSAGE-INTEGRITY key derivation.
//!
//! # Security Note on Cryptographic Algorithms
//!
//! RFC 5389 Section 15.4 mandates HMAC-SHA1 for MESSAGE-INTEGRITY and MD5 for
//! long-term credential key derivation. They are used here only for protocol
//! compliance. Do not reuse them for anything else.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::error::StunError;

type HmacSha1 = Hmac<Sha1>;

/// STUN authentication credentials
///
/// With a realm the credentials are long-term (key is
/// `MD5(username:realm:password)`), without one they are short-term and the
/// password is the key. The password is zeroized on drop.
#[derive(Clone)]
pub struct StunAuthentication {
    /// Username for authentication
    pub username: String,
    password: Zeroizing<String>,
    /// Realm for long-term credentials (optional)
    pub realm: Option<String>,
}

impl StunAuthentication {
    /// Create new STUN authentication credentials
    ///
    /// # Examples
    ///
    /// ```
    /// use burrow_stun::StunAuthentication;
    ///
    /// let auth = StunAuthentication::new("user", "pass", Some("example.com".to_string()));
    /// assert!(auth.is_long_term());
    /// ```
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            realm,
        }
    }

    /// Same credentials bound to a (possibly new) realm
    #[must_use]
    pub fn with_realm(&self, realm: impl Into<String>) -> Self {
        Self {
            username: self.username.clone(),
            password: self.password.clone(),
            realm: Some(realm.into()),
        }
    }

    /// Whether these are long-term credentials
    #[must_use]
    pub fn is_long_term(&self) -> bool {
        self.realm.is_some()
    }

    pub(crate) fn derive_key(&self) -> Zeroizing<Vec<u8>> {
        if let Some(realm) = &self.realm {
            use md5::Digest;
            let mut hasher = Md5::new();
            hasher.update(self.username.as_bytes());
            hasher.update(b":");
            hasher.update(realm.as_bytes());
            hasher.update(b":");
            hasher.update(self.password.as_bytes());
            Zeroizing::new(hasher.finalize().to_vec())
        } else {
            Zeroizing::new(self.password.as_bytes().to_vec())
        }
    }

    /// HMAC-SHA1 of `data` under the derived key
    pub(crate) fn sign(&self, data: &[u8]) -> Result<[u8; 20], StunError> {
        let key = self.derive_key();
        let mut mac =
            HmacSha1::new_from_slice(&key).map_err(|_| StunError::AuthenticationFailed)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Constant-time check of `tag` over `data`
    pub(crate) fn verify(&self, data: &[u8], tag: &[u8; 20]) -> Result<(), StunError> {
        let key = self.derive_key();
        let mut mac =
            HmacSha1::new_from_slice(&key).map_err(|_| StunError::AuthenticationFailed)?;
        mac.update(data);
        mac.verify_slice(tag)
            .map_err(|_| StunError::AuthenticationFailed)
    }
}

impl std::fmt::Debug for StunAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StunAuthentication")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("realm", &self.realm)
            .finish()
    }
}
