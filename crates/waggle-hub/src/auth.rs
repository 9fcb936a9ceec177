//! Credential login and signed bearer tokens for the admin surface.
//!
//! A token is `base64url(claims-json) . base64url(hmac-sha256(secret, part1))`.
//! Tokens are opaque to drones; the SSE/tool plane never sees this module.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use waggle_types::{now_ms, HubError, HubResult};

use crate::config::AuthSection;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried inside a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username).
    pub sub: String,
    pub role: String,
    /// Expiry, unix epoch milliseconds.
    pub exp: i64,
}

/// Login checking plus token mint/verify.
pub struct AuthService {
    secret: Vec<u8>,
    ttl_ms: i64,
    admin_username: String,
    admin_password_sha256: Option<String>,
}

impl AuthService {
    pub fn new(section: &AuthSection) -> Self {
        let secret = match &section.token_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                // Ephemeral secret: tokens stop verifying after a restart,
                // which is the safe default for an unconfigured hub.
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        };
        Self {
            secret,
            ttl_ms: (section.token_ttl_s as i64) * 1000,
            admin_username: section.admin_username.clone(),
            admin_password_sha256: section.admin_password_sha256.clone(),
        }
    }

    /// Check credentials and mint an admin token.
    pub fn login(&self, username: &str, password: &str) -> HubResult<String> {
        let Some(expected) = &self.admin_password_sha256 else {
            return Err(HubError::Unauthorized("admin login not configured".into()));
        };
        let supplied = hex::encode(Sha256::digest(password.as_bytes()));
        let user_ok = constant_time_eq(username.as_bytes(), self.admin_username.as_bytes());
        let pass_ok = constant_time_eq(supplied.as_bytes(), expected.as_bytes());
        if !(user_ok && pass_ok) {
            return Err(HubError::Unauthorized("invalid credentials".into()));
        }
        self.sign(Claims {
            sub: username.to_string(),
            role: "admin".into(),
            exp: now_ms() + self.ttl_ms,
        })
    }

    /// Sign a claims set.
    pub fn sign(&self, claims: Claims) -> HubResult<String> {
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| HubError::Internal(format!("claims-encode-{e}")))?;
        let body = URL_SAFE_NO_PAD.encode(payload);
        let mac = self.mac(body.as_bytes());
        Ok(format!("{body}.{}", URL_SAFE_NO_PAD.encode(mac)))
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> HubResult<Claims> {
        let (body, signature) = token
            .split_once('.')
            .ok_or_else(|| HubError::Unauthorized("malformed token".into()))?;
        let supplied = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| HubError::Unauthorized("malformed token signature".into()))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| HubError::Internal(format!("hmac-key-{e}")))?;
        mac.update(body.as_bytes());
        mac.verify_slice(&supplied)
            .map_err(|_| HubError::Unauthorized("bad token signature".into()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| HubError::Unauthorized("malformed token body".into()))?;
        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|_| HubError::Unauthorized("malformed token claims".into()))?;

        if claims.exp < now_ms() {
            return Err(HubError::Unauthorized("token expired".into()));
        }
        Ok(claims)
    }

    /// Verify a token and require the admin role.
    pub fn require_admin(&self, token: &str) -> HubResult<Claims> {
        let claims = self.verify(token)?;
        if claims.role != "admin" {
            return Err(HubError::Forbidden(format!(
                "role '{}' may not use admin routes",
                claims.role
            )));
        }
        Ok(claims)
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Extract the token from an `Authorization: Bearer …` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hex sha-256 of a password, for seeding `admin_password_sha256`.
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(&AuthSection {
            token_secret: Some("test-secret".into()),
            token_ttl_s: 3600,
            admin_username: "admin".into(),
            admin_password_sha256: Some(password_hash("hunter2")),
        })
    }

    #[test]
    fn test_login_roundtrip() {
        let auth = service();
        let token = auth.login("admin", "hunter2").unwrap();
        let claims = auth.require_admin(&token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn test_bad_credentials() {
        let auth = service();
        assert!(matches!(
            auth.login("admin", "wrong"),
            Err(HubError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.login("root", "hunter2"),
            Err(HubError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let auth = service();
        let token = auth.login("admin", "hunter2").unwrap();
        let mut tampered = token.clone();
        tampered.replace_range(0..1, "X");
        assert!(auth.verify(&tampered).is_err());

        let truncated = token.split('.').next().unwrap();
        assert!(auth.verify(truncated).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = service();
        let token = auth
            .sign(Claims {
                sub: "admin".into(),
                role: "admin".into(),
                exp: now_ms() - 1000,
            })
            .unwrap();
        assert!(matches!(auth.verify(&token), Err(HubError::Unauthorized(_))));
    }

    #[test]
    fn test_non_admin_role_forbidden() {
        let auth = service();
        let token = auth
            .sign(Claims {
                sub: "viewer".into(),
                role: "viewer".into(),
                exp: now_ms() + 60_000,
            })
            .unwrap();
        assert!(matches!(
            auth.require_admin(&token),
            Err(HubError::Forbidden(_))
        ));
        // The token itself still verifies.
        assert!(auth.verify(&token).is_ok());
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("Basic abc"), None);
    }

    #[test]
    fn test_unconfigured_login_disabled() {
        let auth = AuthService::new(&AuthSection::default());
        assert!(matches!(
            auth.login("admin", "anything"),
            Err(HubError::Unauthorized(_))
        ));
    }
}
