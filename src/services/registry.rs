//! Space registry backed by SQLite.
//!
//! Space CRUD belongs to the administration surface; the engine needs lookups,
//! quota updates, and a way to register spaces at bootstrap.

use crate::{
    models::space::{NewSpace, Space},
    services::{
        error::{EngineError, EngineResult},
        sandbox,
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::fs;

const SPACE_COLUMNS: &str = "id, name, description, root_path, icon, category, quota_bytes, \
                             created_at, created_by, updated_at, updated_by";

#[derive(Clone)]
pub struct SpaceRegistry {
    db: Arc<SqlitePool>,
}

impl SpaceRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn get_by_id(&self, id: i64) -> EngineResult<Space> {
        sqlx::query_as::<_, Space>(&format!("SELECT {SPACE_COLUMNS} FROM spaces WHERE id = ?"))
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("space {}", id)))
    }

    pub async fn get_by_name(&self, name: &str) -> EngineResult<Space> {
        sqlx::query_as::<_, Space>(&format!("SELECT {SPACE_COLUMNS} FROM spaces WHERE name = ?"))
            .bind(name)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("space `{}`", name)))
    }

    pub async fn get_all(&self) -> EngineResult<Vec<Space>> {
        let spaces =
            sqlx::query_as::<_, Space>(&format!("SELECT {SPACE_COLUMNS} FROM spaces ORDER BY name"))
                .fetch_all(&*self.db)
                .await?;
        Ok(spaces)
    }

    /// Set or clear the byte ceiling of a space.
    pub async fn update_quota(
        &self,
        id: i64,
        quota_bytes: Option<i64>,
        updated_by: &str,
    ) -> EngineResult<Space> {
        if quota_bytes.is_some_and(|q| q < 0) {
            return Err(EngineError::InvalidInput("quotaBytes must not be negative".into()));
        }
        sqlx::query_as::<_, Space>(&format!(
            "UPDATE spaces SET quota_bytes = ?, updated_at = ?, updated_by = ? WHERE id = ? \
             RETURNING {SPACE_COLUMNS}"
        ))
        .bind(quota_bytes)
        .bind(Utc::now())
        .bind(updated_by)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("space {}", id)))
    }

    /// Register a space and make sure its root directory exists.
    pub async fn create(&self, new: NewSpace) -> EngineResult<Space> {
        sandbox::validate_name(&new.name)?;
        if new.root_path.trim().is_empty() {
            return Err(EngineError::InvalidInput("rootPath is required".into()));
        }
        fs::create_dir_all(&new.root_path).await?;

        let result = sqlx::query_as::<_, Space>(&format!(
            "INSERT INTO spaces (name, description, root_path, icon, category, quota_bytes, \
             created_at, created_by) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {SPACE_COLUMNS}"
        ))
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.root_path)
        .bind(&new.icon)
        .bind(&new.category)
        .bind(new.quota_bytes)
        .bind(Utc::now())
        .bind(&new.created_by)
        .fetch_one(&*self.db)
        .await;

        match result {
            Ok(space) => Ok(space),
            Err(err) if is_unique_violation(&err) => Err(EngineError::conflict(
                crate::models::transfer::ConflictCode::DestinationExists,
                format!("space `{}` already exists", new.name),
            )),
            Err(err) => Err(EngineError::Sqlx(err)),
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
