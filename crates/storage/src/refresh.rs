use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::FromRow;

use dealboard_core::DeviceEnvironment;

use crate::StoragePool;

/// One refresh-session row per `(user_id, device_id)`. The `token`
/// column is the single source of truth for the currently valid refresh
/// token on that device; `expires_at` is the record TTL. Rows past their
/// expiry are treated as absent and overwritten on the next initialize.
#[derive(Clone)]
pub struct RefreshSessionRows {
    pool: StoragePool,
    ttl: Duration,
}

#[derive(Debug, FromRow)]
struct EnvRow {
    device_id: String,
    os: String,
    browser: String,
    version: String,
}

impl RefreshSessionRows {
    pub fn new(pool: StoragePool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Unconditional create-or-overwrite of the full record; resets the
    /// TTL. A single upsert statement, so concurrent writers can never
    /// leave a row mixing old and new field values.
    pub async fn initialize(
        &self,
        user_id: i64,
        token: &str,
        env: &DeviceEnvironment,
    ) -> Result<()> {
        let expires_at = Utc::now() + self.ttl;
        sqlx::query(
            r#"
            INSERT INTO refresh_sessions (
                user_id,
                device_id,
                token,
                os,
                browser,
                version,
                rotated_at,
                expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, now(), $7)
            ON CONFLICT (user_id, device_id) DO UPDATE
            SET token = EXCLUDED.token,
                os = EXCLUDED.os,
                browser = EXCLUDED.browser,
                version = EXCLUDED.version,
                rotated_at = EXCLUDED.rotated_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(user_id)
        .bind(&env.device_id)
        .bind(token)
        .bind(&env.os)
        .bind(&env.browser)
        .bind(&env.version)
        .bind(expires_at)
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("initializing refresh session for user {user_id}"))?;
        Ok(())
    }

    /// Compare-and-swap: replaces the token and resets the TTL only when
    /// the stored value still equals `current` and the row is live.
    /// Returns `false` when no row matched, leaving classification
    /// (absent vs. superseded) to the caller.
    pub async fn rotate(
        &self,
        user_id: i64,
        device_id: &str,
        current: &str,
        next: &str,
    ) -> Result<bool> {
        let expires_at = Utc::now() + self.ttl;
        let outcome = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET token = $4,
                rotated_at = now(),
                expires_at = $5
            WHERE user_id = $1
              AND device_id = $2
              AND token = $3
              AND expires_at > now()
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(current)
        .bind(next)
        .bind(expires_at)
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("rotating refresh session for user {user_id}"))?;

        Ok(outcome.rows_affected() == 1)
    }

    pub async fn load(&self, user_id: i64, device_id: &str) -> Result<Option<String>> {
        let token = sqlx::query_scalar::<_, String>(
            r#"
            SELECT token
            FROM refresh_sessions
            WHERE user_id = $1
              AND device_id = $2
              AND expires_at > now()
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("loading refresh session for user {user_id}"))?;

        Ok(token)
    }

    pub async fn load_env(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<DeviceEnvironment>> {
        let row = sqlx::query_as::<_, EnvRow>(
            r#"
            SELECT device_id, os, browser, version
            FROM refresh_sessions
            WHERE user_id = $1
              AND device_id = $2
              AND expires_at > now()
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("loading device environment for user {user_id}"))?;

        Ok(row.map(|row| DeviceEnvironment {
            device_id: row.device_id,
            os: row.os,
            browser: row.browser,
            version: row.version,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect;
    use anyhow::Context;
    use std::env;

    #[tokio::test]
    async fn initialize_rotate_and_load() -> anyhow::Result<()> {
        let database_url =
            match env::var("DEALBOARD_TEST_DATABASE_URL").or_else(|_| env::var("DATABASE_URL")) {
                Ok(url) => url,
                Err(_) => {
                    eprintln!(
                    "skipping refresh session persistence test: set DEALBOARD_TEST_DATABASE_URL or DATABASE_URL"
                );
                    return Ok(());
                }
            };

        let pool = connect(&database_url).await?;
        let rows = RefreshSessionRows::new(pool.clone(), Duration::days(14));

        // Ensure a user row exists while foreign keys are enforced.
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let user_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO users (oauth_id, provider, nickname)
            VALUES ($1, 'kakao', $2)
            RETURNING id
            "#,
        )
        .bind(format!("refresh-test-{suffix}"))
        .bind(format!("refresh-test-{suffix}"))
        .fetch_one(pool.pool())
        .await
        .with_context(|| "failed to insert test user")?;

        let env = DeviceEnvironment::new("device-123", "macOS", "Firefox", "131.0");
        rows.initialize(user_id, "token-a", &env).await?;

        assert_eq!(
            rows.load(user_id, "device-123").await?.as_deref(),
            Some("token-a")
        );
        assert_eq!(rows.load_env(user_id, "device-123").await?, Some(env));

        // CAS succeeds against the live value, fails against a stale one.
        assert!(rows.rotate(user_id, "device-123", "token-a", "token-b").await?);
        assert!(!rows.rotate(user_id, "device-123", "token-a", "token-c").await?);
        assert_eq!(
            rows.load(user_id, "device-123").await?.as_deref(),
            Some("token-b")
        );

        assert_eq!(rows.load(user_id, "device-404").await?, None);

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(pool.pool())
            .await?;

        Ok(())
    }
}
