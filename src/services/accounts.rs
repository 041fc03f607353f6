//! Account directory backed by SQLite.
//!
//! Password verification uses argon2 PHC strings. Account management itself
//! lives outside the engine; `create_user` only provisions the startup admin.

use crate::{
    models::permission::{Grant, Identity, Permission, Role},
    services::{
        error::{EngineError, EngineResult},
        permissions::AccountDirectory,
    },
};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::warn;

#[derive(FromRow)]
struct UserRow {
    username: String,
    password_hash: String,
    role: String,
}

#[derive(FromRow)]
struct GrantRow {
    space_id: i64,
    permission: String,
}

#[derive(Clone)]
pub struct AccountService {
    db: Arc<SqlitePool>,
}

impl AccountService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Check a username/password pair. `Ok(None)` means bad credentials.
    pub async fn authenticate(&self, username: &str, password: &str) -> EngineResult<Option<Identity>> {
        let Some(row) = sqlx::query_as::<_, UserRow>(
            "SELECT username, password_hash, role FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&*self.db)
        .await?
        else {
            return Ok(None);
        };

        let password = password.to_string();
        let hash = row.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await?;
        if !valid {
            return Ok(None);
        }

        let role = row.role.parse::<Role>().unwrap_or_else(|err| {
            warn!(user = %row.username, "{}; treating as regular user", err);
            Role::User
        });
        Ok(Some(Identity::new(row.username, role)))
    }

    pub async fn create_user(&self, username: &str, password: &str, role: Role) -> EngineResult<()> {
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await?
            .map_err(|e| EngineError::InvalidInput(format!("cannot hash password: {}", e)))?;
        sqlx::query(
            "INSERT INTO users (username, password_hash, role) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET password_hash = excluded.password_hash,
             role = excluded.role",
        )
        .bind(username)
        .bind(hash)
        .bind(role.as_str())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn grant(&self, username: &str, space_id: i64, permission: Permission) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO space_permissions (username, space_id, permission) VALUES (?, ?, ?)
             ON CONFLICT(username, space_id) DO UPDATE SET permission = excluded.permission",
        )
        .bind(username)
        .bind(space_id)
        .bind(permission.as_str())
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountDirectory for AccountService {
    async fn role_of(&self, username: &str) -> EngineResult<Option<Role>> {
        let role: Option<String> = sqlx::query_scalar("SELECT role FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&*self.db)
            .await?;
        Ok(role.and_then(|r| r.parse().ok()))
    }

    async fn grants_for(&self, username: &str) -> EngineResult<Vec<Grant>> {
        let rows = sqlx::query_as::<_, GrantRow>(
            "SELECT space_id, permission FROM space_permissions WHERE username = ?",
        )
        .bind(username)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.permission.parse::<Permission>() {
                Ok(permission) => Some(Grant {
                    space_id: row.space_id,
                    permission,
                }),
                Err(err) => {
                    warn!(user = username, space_id = row.space_id, "ignoring grant: {}", err);
                    None
                }
            })
            .collect())
    }
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            warn!("stored password hash is malformed: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn authenticate_checks_password_and_role() {
        let accounts = AccountService::new(Arc::new(memory_pool().await));
        accounts.create_user("root", "s3cret", Role::Admin).await.unwrap();

        let identity = accounts.authenticate("root", "s3cret").await.unwrap().unwrap();
        assert!(identity.is_admin());
        assert!(accounts.authenticate("root", "wrong").await.unwrap().is_none());
        assert!(accounts.authenticate("nobody", "s3cret").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grants_are_listed_per_user() {
        let pool = Arc::new(memory_pool().await);
        sqlx::query(
            "INSERT INTO spaces (name, root_path, created_at) VALUES ('docs', '/tmp/docs', '2024-01-01T00:00:00Z')",
        )
        .execute(&*pool)
        .await
        .unwrap();
        let accounts = AccountService::new(pool);
        accounts.create_user("alice", "pw", Role::User).await.unwrap();
        accounts.grant("alice", 1, Permission::Read).await.unwrap();
        accounts.grant("alice", 1, Permission::Write).await.unwrap();

        let grants = accounts.grants_for("alice").await.unwrap();
        assert_eq!(
            grants,
            vec![Grant {
                space_id: 1,
                permission: Permission::Write
            }]
        );
        assert_eq!(accounts.role_of("alice").await.unwrap(), Some(Role::User));
    }
}
