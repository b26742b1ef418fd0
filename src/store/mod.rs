use async_trait::async_trait;
use moka::sync::Cache;
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::evaluation::{FlagKind, FlagRecord, Targeting, Variant};

/// Default TTL for cached flag records.
pub const CACHE_TTL_SECS: u64 = 300;
const CACHE_SIZE: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Partial update applied to a flag record. `None` fields are left as-is.
#[derive(Debug, Default, Clone)]
pub struct FlagUpdate {
    pub enabled: Option<bool>,
    pub rollout_percentage: Option<i32>,
    pub targeting: Option<Targeting>,
    pub variants: Option<Vec<Variant>>,
    pub default_variant_id: Option<String>,
    pub off_variant_id: Option<String>,
}

/// Backing-store operations for flag records. The backing store is the
/// source of truth; the cache in [`FlagStore`] is only advisory.
#[async_trait]
pub trait FlagRepository: Send + Sync {
    async fn fetch_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<Option<FlagRecord>, StoreError>;

    async fn list_flags(
        &self,
        project_id: Uuid,
        environment: &str,
    ) -> Result<Vec<FlagRecord>, StoreError>;

    async fn update_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
        update: FlagUpdate,
    ) -> Result<Option<FlagRecord>, StoreError>;

    async fn toggle_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<Option<FlagRecord>, StoreError>;

    async fn delete_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<bool, StoreError>;
}

type CacheKey = (Uuid, String, String);

/// Cache-aside flag lookup: cache hit deserializes and returns, miss (or
/// any cache-side failure) falls through to the repository and then
/// best-effort populates the cache. Every mutating write path invalidates
/// its entry before the write is acknowledged to the caller, which gives
/// read-your-writes at the next lookup outside the documented
/// invalidate/repopulate race window (bounded by the TTL).
#[derive(Clone)]
pub struct FlagStore {
    cache: Cache<CacheKey, String>,
    repo: Arc<dyn FlagRepository>,
}

impl FlagStore {
    pub fn new(repo: Arc<dyn FlagRepository>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(CACHE_SIZE)
            .time_to_live(ttl)
            .build();
        FlagStore { cache, repo }
    }

    /// Read-through lookup. `Ok(None)` means the flag does not exist;
    /// callers translate that into a `FLAG_NOT_FOUND` result, never a 5xx.
    pub async fn get_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<Option<FlagRecord>, StoreError> {
        let cache_key = (project_id, environment.to_string(), key.to_string());

        if let Some(raw) = self.cache.get(&cache_key) {
            match serde_json::from_str::<FlagRecord>(&raw) {
                Ok(flag) => return Ok(Some(flag)),
                Err(e) => {
                    // Corrupt entry: treat as a miss and drop it.
                    warn!(flag = key, error = %e, "discarding undecodable cache entry");
                    self.cache.invalidate(&cache_key);
                }
            }
        }

        let flag = self.repo.fetch_flag(project_id, environment, key).await?;
        if let Some(flag) = &flag {
            self.populate(cache_key, flag);
        }
        Ok(flag)
    }

    /// Drops the cache entry for one flag. Idempotent.
    pub fn invalidate(&self, project_id: Uuid, environment: &str, key: &str) {
        self.cache
            .invalidate(&(project_id, environment.to_string(), key.to_string()));
    }

    /// Bulk-populates the cache for a project/environment. Purely an
    /// optimization; lookups are correct without it.
    pub async fn warm_cache(
        &self,
        project_id: Uuid,
        environment: &str,
    ) -> Result<usize, StoreError> {
        let flags = self.repo.list_flags(project_id, environment).await?;
        let count = flags.len();
        for flag in &flags {
            let cache_key = (project_id, environment.to_string(), flag.key.clone());
            self.populate(cache_key, flag);
        }
        Ok(count)
    }

    /// Full flag set straight from the backing store, for the bulk SDK
    /// fetch endpoint. Not served from the cache: sync clients poll
    /// infrequently and expect the authoritative set.
    pub async fn list_flags(
        &self,
        project_id: Uuid,
        environment: &str,
    ) -> Result<Vec<FlagRecord>, StoreError> {
        self.repo.list_flags(project_id, environment).await
    }

    pub async fn update_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
        update: FlagUpdate,
    ) -> Result<Option<FlagRecord>, StoreError> {
        let updated = self
            .repo
            .update_flag(project_id, environment, key, update)
            .await?;
        self.invalidate(project_id, environment, key);
        Ok(updated)
    }

    pub async fn toggle_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<Option<FlagRecord>, StoreError> {
        let toggled = self.repo.toggle_flag(project_id, environment, key).await?;
        self.invalidate(project_id, environment, key);
        Ok(toggled)
    }

    pub async fn delete_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<bool, StoreError> {
        let deleted = self.repo.delete_flag(project_id, environment, key).await?;
        self.invalidate(project_id, environment, key);
        Ok(deleted)
    }

    /// Cache-write failures must never fail the read, so serialization
    /// problems are logged and the populate is skipped.
    fn populate(&self, cache_key: CacheKey, flag: &FlagRecord) {
        match serde_json::to_string(flag) {
            Ok(raw) => self.cache.insert(cache_key, raw),
            Err(e) => warn!(flag = %flag.key, error = %e, "failed to serialize flag for cache"),
        }
    }

    #[cfg(test)]
    fn insert_raw(&self, cache_key: CacheKey, raw: &str) {
        self.cache.insert(cache_key, raw.to_string());
    }
}

// POSTGRES REPOSITORY

#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    key: String,
    kind: String,
    enabled: bool,
    rollout_percentage: i32,
    targeting: Json<Targeting>,
    variants: Json<Vec<Variant>>,
    default_variant_id: Option<String>,
    off_variant_id: Option<String>,
}

impl From<FlagRow> for FlagRecord {
    fn from(row: FlagRow) -> Self {
        let kind = match row.kind.as_str() {
            "multivariate" => FlagKind::Multivariate,
            _ => FlagKind::Boolean,
        };
        FlagRecord {
            key: row.key,
            kind,
            enabled: row.enabled,
            rollout_percentage: row.rollout_percentage,
            targeting: row.targeting.0,
            variants: row.variants.0,
            default_variant_id: row.default_variant_id,
            off_variant_id: row.off_variant_id,
        }
    }
}

const FLAG_COLUMNS: &str =
    "key, kind, enabled, rollout_percentage, targeting, variants, default_variant_id, off_variant_id";

pub struct PgFlagRepository {
    pool: PgPool,
}

impl PgFlagRepository {
    pub fn new(pool: PgPool) -> Self {
        PgFlagRepository { pool }
    }
}

#[async_trait]
impl FlagRepository for PgFlagRepository {
    async fn fetch_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<Option<FlagRecord>, StoreError> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            SELECT {FLAG_COLUMNS}
            FROM feature_flags
            WHERE project_id = $1 AND environment = $2 AND key = $3
            "#
        ))
        .bind(project_id)
        .bind(environment)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FlagRecord::from))
    }

    async fn list_flags(
        &self,
        project_id: Uuid,
        environment: &str,
    ) -> Result<Vec<FlagRecord>, StoreError> {
        let rows = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            SELECT {FLAG_COLUMNS}
            FROM feature_flags
            WHERE project_id = $1 AND environment = $2
            ORDER BY key
            "#
        ))
        .bind(project_id)
        .bind(environment)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FlagRecord::from).collect())
    }

    async fn update_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
        update: FlagUpdate,
    ) -> Result<Option<FlagRecord>, StoreError> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            UPDATE feature_flags
            SET
                enabled = COALESCE($4, enabled),
                rollout_percentage = COALESCE($5, rollout_percentage),
                targeting = COALESCE($6, targeting),
                variants = COALESCE($7, variants),
                default_variant_id = COALESCE($8, default_variant_id),
                off_variant_id = COALESCE($9, off_variant_id),
                updated_at = NOW()
            WHERE project_id = $1 AND environment = $2 AND key = $3
            RETURNING {FLAG_COLUMNS}
            "#
        ))
        .bind(project_id)
        .bind(environment)
        .bind(key)
        .bind(update.enabled)
        .bind(update.rollout_percentage)
        .bind(update.targeting.map(Json))
        .bind(update.variants.map(Json))
        .bind(update.default_variant_id)
        .bind(update.off_variant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FlagRecord::from))
    }

    async fn toggle_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<Option<FlagRecord>, StoreError> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            UPDATE feature_flags
            SET enabled = NOT enabled, updated_at = NOW()
            WHERE project_id = $1 AND environment = $2 AND key = $3
            RETURNING {FLAG_COLUMNS}
            "#
        ))
        .bind(project_id)
        .bind(environment)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FlagRecord::from))
    }

    async fn delete_flag(
        &self,
        project_id: Uuid,
        environment: &str,
        key: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM feature_flags
            WHERE project_id = $1 AND environment = $2 AND key = $3
            "#,
        )
        .bind(project_id)
        .bind(environment)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
