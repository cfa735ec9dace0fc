//! Delegating password encoder
//!
//! Encoded passwords carry their scheme as a `{id}` prefix, e.g.
//! `{argon2}$argon2id$v=19$m=19456,t=2,p=1$...`. Argon2id is the only scheme
//! this encoder produces or verifies. A bare PHC string starting with
//! `$argon2` is accepted as argon2 so hashes stored before prefixing still
//! verify.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params,
};

use crate::types::{GatewayError, Result};

const ARGON2_ID: &str = "argon2";

/// Encodes and verifies `{id}`-prefixed password hashes
#[derive(Clone, Default)]
pub struct PasswordEncoder {
    argon2: Argon2<'static>,
}

impl PasswordEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `raw` with a fresh salt
    pub fn encode(&self, raw: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(raw.as_bytes(), &salt)
            .map_err(|e| GatewayError::Auth(format!("Failed to hash password: {e}")))?;
        Ok(format!("{{{}}}{}", ARGON2_ID, hash))
    }

    /// Check `raw` against an encoded password
    ///
    /// Errors on an unknown scheme id or a malformed hash; a wrong password
    /// is `Ok(false)`.
    pub fn matches(&self, raw: &str, encoded: &str) -> Result<bool> {
        let phc = argon2_phc(encoded)?;
        let parsed = PasswordHash::new(phc)
            .map_err(|e| GatewayError::Auth(format!("Invalid password hash format: {e}")))?;

        Ok(self.argon2.verify_password(raw.as_bytes(), &parsed).is_ok())
    }

    /// Whether `encoded` should be re-hashed with the current scheme and
    /// parameters
    pub fn needs_upgrade(&self, encoded: &str) -> bool {
        if !encoded.starts_with(&format!("{{{}}}", ARGON2_ID)) {
            return true;
        }
        let Ok(phc) = argon2_phc(encoded) else {
            return true;
        };
        let Ok(parsed) = PasswordHash::new(phc) else {
            return true;
        };
        if parsed.algorithm.as_str() != Algorithm::Argon2id.ident().as_str() {
            return true;
        }

        let current = self.argon2.params();
        match Params::try_from(&parsed) {
            Ok(params) => {
                params.m_cost() != current.m_cost()
                    || params.t_cost() != current.t_cost()
                    || params.p_cost() != current.p_cost()
            }
            Err(_) => true,
        }
    }
}

/// Strip the `{argon2}` prefix, rejecting other scheme ids
fn argon2_phc(encoded: &str) -> Result<&str> {
    match encoded.strip_prefix('{') {
        Some(rest) => {
            let (id, phc) = rest
                .split_once('}')
                .ok_or_else(|| GatewayError::Auth("Unterminated password scheme id".into()))?;
            if id == ARGON2_ID {
                Ok(phc)
            } else {
                Err(GatewayError::Auth(format!("Unsupported password scheme: {{{}}}", id)))
            }
        }
        None if encoded.starts_with("$argon2") => Ok(encoded),
        None => Err(GatewayError::Auth("Password hash has no scheme id".into())),
    }
}
