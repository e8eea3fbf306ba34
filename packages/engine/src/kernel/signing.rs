//! Outbound request signing.
//!
//! Every dispatched request for a tenant with an active signing key carries
//! two headers:
//!
//! - `X-Cronicorn-Timestamp`: decimal unix seconds at dispatch time
//! - `X-Cronicorn-Signature`: lowercase hex HMAC-SHA256 over
//!   `"{timestamp}.{body}"` (empty string when the request has no body)
//!
//! Receivers recompute the HMAC with their copy of the secret and compare
//! in constant time.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::traits::SigningKeyProvider;
use crate::common::db_id;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "X-Cronicorn-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Cronicorn-Signature";

const SECRET_PREFIX: &str = "ck_";
const DISPLAY_PREFIX_LEN: usize = 11;

/// Lowercase hex HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Signature for an outbound request: HMAC over `"{timestamp}.{body}"`.
pub fn sign_request(secret: &str, unix_ts: i64, body: &str) -> String {
    let payload = format!("{}.{}", unix_ts, body);
    hmac_sha256_hex(secret.as_bytes(), payload.as_bytes())
}

/// Constant-time verification of a received signature.
pub fn verify_signature(secret: &str, unix_ts: i64, body: &str, signature: &str) -> bool {
    let expected = sign_request(secret, unix_ts, body);
    expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 1
}

/// Generate fresh key material: `ck_` + 32 random bytes, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
}

/// Display prefix for a secret (`ck_` plus the first hex characters).
pub fn display_prefix(secret: &str) -> String {
    secret.chars().take(DISPLAY_PREFIX_LEN).collect()
}

// =============================================================================
// Signing key storage
// =============================================================================

/// A freshly created or rotated key. The only place the full secret leaves
/// the storage layer; everything else sees `key_prefix`.
#[derive(Debug, Clone)]
pub struct IssuedSigningKey {
    pub id: Uuid,
    pub tenant_id: String,
    pub secret: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
}

/// Postgres-backed signing keys; also the production `SigningKeyProvider`.
#[derive(Clone)]
pub struct PostgresSigningKeys {
    pool: PgPool,
}

impl PostgresSigningKeys {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Issue a new key for a tenant. The returned secret is not retrievable
    /// through any display path afterwards.
    pub async fn create(&self, tenant_id: &str) -> Result<IssuedSigningKey> {
        let secret = generate_secret();
        let key_prefix = display_prefix(&secret);
        let id = db_id();

        let created_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            INSERT INTO signing_key (id, tenant_id, secret, key_prefix)
            VALUES ($1, $2, $3, $4)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(&secret)
        .bind(&key_prefix)
        .fetch_one(&self.pool)
        .await?;

        Ok(IssuedSigningKey {
            id,
            tenant_id: tenant_id.to_string(),
            secret,
            key_prefix,
            created_at,
        })
    }

    /// Rotate: revoke every active key for the tenant and issue a new one.
    pub async fn rotate(&self, tenant_id: &str) -> Result<IssuedSigningKey> {
        sqlx::query(
            r#"
            UPDATE signing_key
            SET revoked_at = NOW()
            WHERE tenant_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        self.create(tenant_id).await
    }

    /// Revoke all keys for a tenant without issuing a replacement.
    pub async fn revoke_all(&self, tenant_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE signing_key
            SET revoked_at = NOW()
            WHERE tenant_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SigningKeyProvider for PostgresSigningKeys {
    async fn get_key(&self, tenant_id: &str) -> Result<Option<String>> {
        let secret = sqlx::query_scalar::<_, String>(
            r#"
            SELECT secret
            FROM signing_key
            WHERE tenant_id = $1 AND revoked_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2.
    #[test]
    fn test_hmac_sha256_known_vector() {
        let digest = hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            digest,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sign_request_is_deterministic() {
        let a = sign_request("ck_secret", 1735689600, r#"{"ping":true}"#);
        let b = sign_request("ck_secret", 1735689600, r#"{"ping":true}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sign_request_covers_timestamp_and_body() {
        let base = sign_request("ck_secret", 1735689600, "body");
        assert_ne!(base, sign_request("ck_secret", 1735689601, "body"));
        assert_ne!(base, sign_request("ck_secret", 1735689600, "other"));
        assert_ne!(base, sign_request("ck_other", 1735689600, "body"));
    }

    #[test]
    fn test_signature_is_lowercase_hex() {
        let sig = sign_request("ck_secret", 0, "");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_empty_body_signs_trailing_dot_payload() {
        // "{ts}." with nothing after the dot, per the header contract.
        let direct = hmac_sha256_hex(b"ck_secret", b"1735689600.");
        assert_eq!(direct, sign_request("ck_secret", 1735689600, ""));
    }

    #[test]
    fn test_verify_signature_round_trip() {
        let sig = sign_request("ck_secret", 42, "payload");
        assert!(verify_signature("ck_secret", 42, "payload", &sig));
        assert!(!verify_signature("ck_secret", 42, "payload", "deadbeef"));
        assert!(!verify_signature("ck_wrong", 42, "payload", &sig));
    }

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret();
        assert!(secret.starts_with(SECRET_PREFIX));
        assert_eq!(secret.len(), SECRET_PREFIX.len() + 64);
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_display_prefix_hides_material() {
        let secret = generate_secret();
        let prefix = display_prefix(&secret);
        assert_eq!(prefix.len(), DISPLAY_PREFIX_LEN);
        assert!(secret.starts_with(&prefix));
    }
}
