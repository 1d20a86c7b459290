use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use thiserror::Error;

use dealboard_core::{NewUser, RoleSet, User};

/// Repository utilities for user persistence.
pub struct UserRepository;

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("oauth identity already registered")]
    DuplicateIdentity,
    #[error("nickname already taken")]
    NicknameTaken,
    #[error("failed to create user: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: i64,
    oauth_id: String,
    provider: String,
    nickname: String,
    email: Option<String>,
    roles: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            oauth_id: row.oauth_id,
            provider: row.provider,
            nickname: row.nickname,
            email: row.email,
            roles: RoleSet::from_iter(row.roles),
            created_at: row.created_at,
        }
    }
}

const USER_COLUMNS: &str = "id, oauth_id, provider, nickname, email, roles, created_at";

impl UserRepository {
    /// Insert a user row, mapping unique violations onto the typed
    /// conflict variants by constraint name.
    pub async fn create_user(pool: &PgPool, new_user: &NewUser) -> Result<User, CreateUserError> {
        let roles: Vec<String> = new_user.roles.iter().cloned().collect();
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users (oauth_id, provider, nickname, email, roles)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {USER_COLUMNS}
            "#,
        ))
        .bind(&new_user.oauth_id)
        .bind(&new_user.provider)
        .bind(&new_user.nickname)
        .bind(new_user.email.as_deref())
        .bind(&roles)
        .fetch_one(pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err)
                if matches!(db_err.code(), Some(code) if code.as_ref() == "23505") =>
            {
                match db_err.constraint() {
                    Some("users_nickname_key") => CreateUserError::NicknameTaken,
                    _ => CreateUserError::DuplicateIdentity,
                }
            }
            other => CreateUserError::Other(
                anyhow!(other).context(format!("creating user '{}'", new_user.nickname)),
            ),
        })?;

        Ok(row.into())
    }

    pub async fn find_by_oauth_id(
        pool: &PgPool,
        oauth_id: &str,
        provider: &str,
    ) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE oauth_id = $1 AND provider = $2
            "#,
        ))
        .bind(oauth_id)
        .bind(provider)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user by oauth id '{oauth_id}'"))?;

        Ok(row.map(Into::into))
    }

    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE id = $1
            "#,
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user {id}"))?;

        Ok(row.map(Into::into))
    }

    pub async fn find_by_nickname(pool: &PgPool, nickname: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE nickname = $1
            "#,
        ))
        .bind(nickname)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user by nickname '{nickname}'"))?;

        Ok(row.map(Into::into))
    }
}
