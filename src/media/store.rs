use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::db::media as media_db;
use crate::media::object_store::{ObjectStore, ObjectStoreError};
use crate::media::prewarm::{PrewarmJob, PrewarmQueue};
use crate::media::MediaKind;
use crate::utils::errors::GatewayError;

/// Result of saving a blob: identifiers the admin surface hands back.
#[derive(Debug, Clone, Serialize)]
pub struct SavedMedia {
    pub media_id: String,
    pub sha256: String,
    pub r2_key: String,
    pub status: String,
}

/// Cache lookup answer for the send path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedLookup {
    /// Warm: send by `file_id`, one round-trip.
    Ready(String),
    /// Cold: status plus the surfaced reason, if any.
    Pending {
        status: String,
        reason: Option<String>,
    },
    /// No cache row at all for this `(slug, sha256, kind)`.
    Missing,
}

/// Content-addressed media storage with the per-tenant warmth cache in
/// front. Writes hash the payload, persist the immutable store row, upload
/// the blob, and hand a warming cache row to the prewarm queue.
pub struct MediaService {
    pool: PgPool,
    objects: Arc<dyn ObjectStore>,
    prewarm: PrewarmQueue,
}

impl MediaService {
    pub fn new(pool: PgPool, objects: Arc<dyn ObjectStore>, prewarm: PrewarmQueue) -> Self {
        Self {
            pool,
            objects,
            prewarm,
        }
    }

    pub fn object_key(slug: &str, kind: MediaKind, sha256: &str, ext: &str) -> String {
        format!("{}/{}/{}.{}", slug, kind.as_str(), sha256, ext)
    }

    /// Save a blob for a tenant and make sure a cache row exists for it.
    pub async fn save_media(
        &self,
        slug: &str,
        kind: MediaKind,
        data: &[u8],
        mime: &str,
        ext: &str,
    ) -> Result<SavedMedia, GatewayError> {
        let sha256 = hex::encode(Sha256::digest(data));
        let r2_key = Self::object_key(slug, kind, &sha256, ext);

        media_db::upsert_store(&self.pool, slug, &sha256, kind, &r2_key, data.len() as i64, mime)
            .await?;
        self.objects
            .put(&r2_key, data)
            .await
            .map_err(store_error)?;

        let created = media_db::insert_cache_warming(&self.pool, slug, &sha256, kind).await?;
        if created {
            self.prewarm
                .enqueue(PrewarmJob::new(slug.to_string(), sha256.clone(), kind));
            info!(slug, sha256 = %sha256, kind = kind.as_str(), "media saved, warming queued");
        } else {
            debug!(slug, sha256 = %sha256, "media saved, cache row already present");
        }

        let status = match media_db::fetch_cache(&self.pool, slug, &sha256, kind).await? {
            Some(row) => row.status,
            None => media_db::cache_status::WARMING.to_string(),
        };

        Ok(SavedMedia {
            media_id: format!("{}:{}", kind.as_str(), sha256),
            sha256,
            r2_key,
            status,
        })
    }

    /// Single indexed lookup for the send path.
    pub async fn cached_file_id(
        &self,
        slug: &str,
        sha256: &str,
        kind: MediaKind,
    ) -> Result<CachedLookup, GatewayError> {
        let Some(row) = media_db::fetch_cache(&self.pool, slug, sha256, kind).await? else {
            return Ok(CachedLookup::Missing);
        };
        match (row.status.as_str(), row.file_id) {
            (media_db::cache_status::READY, Some(file_id)) => Ok(CachedLookup::Ready(file_id)),
            (status, _) => Ok(CachedLookup::Pending {
                status: status.to_string(),
                reason: row.error_reason,
            }),
        }
    }

    /// Load blob bytes plus their store metadata, for in-band upload
    /// fallback and the prewarm worker.
    pub async fn load_blob(
        &self,
        slug: &str,
        sha256: &str,
        kind: MediaKind,
    ) -> Result<(Vec<u8>, media_db::MediaStoreRow), GatewayError> {
        let row = media_db::fetch_store(&self.pool, slug, sha256, kind)
            .await?
            .ok_or_else(|| GatewayError::CacheMiss(format!("{}:{}", kind.as_str(), sha256)))?;
        let data = self.objects.get(&row.r2_key).await.map_err(store_error)?;
        Ok((data, row))
    }

    /// Operator invalidation: flip `ready → warming` and re-enqueue.
    pub async fn invalidate(
        &self,
        slug: &str,
        sha256: &str,
        kind: MediaKind,
    ) -> Result<bool, GatewayError> {
        let flipped = media_db::invalidate(&self.pool, slug, sha256, kind).await?;
        if flipped {
            self.prewarm
                .enqueue(PrewarmJob::new(slug.to_string(), sha256.to_string(), kind));
            info!(slug, sha256, kind = kind.as_str(), "cache invalidated, rewarming");
        }
        Ok(flipped)
    }

    /// Re-enqueue every warming row of one tenant; used when its warmup
    /// chat is configured after media was uploaded.
    pub async fn requeue_warming_for_bot(&self, slug: &str) -> Result<usize, GatewayError> {
        let rows = media_db::list_warming(&self.pool).await?;
        let mut queued = 0;
        for row in rows.into_iter().filter(|r| r.bot_slug == slug) {
            if let Some(kind) = row.media_kind() {
                let mut job = PrewarmJob::new(row.bot_slug, row.sha256, kind);
                job.attempts = 0;
                self.prewarm.enqueue(job);
                queued += 1;
            }
        }
        Ok(queued)
    }
}

fn store_error(e: ObjectStoreError) -> GatewayError {
    match e {
        ObjectStoreError::NotFound(key) => GatewayError::CacheMiss(key),
        other => GatewayError::DatabaseNotAvailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_tenant_and_kind_scoped() {
        let key = MediaService::object_key("acme", MediaKind::Photo, "abc123", "jpg");
        assert_eq!(key, "acme/photo/abc123.jpg");
    }

    #[test]
    fn sha256_addressing_matches_payload() {
        let digest = hex::encode(Sha256::digest(b"hello media"));
        assert_eq!(digest.len(), 64);
        // Same payload, same address.
        assert_eq!(digest, hex::encode(Sha256::digest(b"hello media")));
    }
}
