//! C10 — historical killmail lookups against zKillboard's REST API, used by
//! the preloader (C17) to backfill a system's recent activity. Runs through
//! the same `HttpFetcher` as everything else, but always at `Background`
//! or `Preload` priority so a backfill never competes with realtime
//! delivery for rate-limiter tokens (resolved in favor of
//! background priority by default).

use crate::error::ZkbError;
use crate::http_fetcher::HttpFetcher;
use crate::models::KillmailReference;
use crate::rate_limiter::Priority;
use std::sync::Arc;

const ZKB_BASE: &str = "https://zkillboard.com/api";
const ZKB_SERVICE: &str = "zkb";

pub struct ZkbFetcher {
    fetcher: Arc<HttpFetcher>,
    queue_timeout_ms: u64,
}

impl ZkbFetcher {
    pub fn new(fetcher: Arc<HttpFetcher>, queue_timeout_ms: u64) -> Self {
        ZkbFetcher {
            fetcher,
            queue_timeout_ms,
        }
    }

    /// Fetches recent killmail references for a system, capped at `limit`
    /// (itself capped by `preload_limit_per_system_cap`, enforced by the
    /// caller). zKillboard's REST path convention is `/systemID/<id>/`.
    pub async fn system_kills(
        &self,
        system_id: u32,
        limit: usize,
        priority: Priority,
    ) -> Result<Vec<KillmailReference>, ZkbError> {
        let url = format!("{ZKB_BASE}/systemID/{system_id}/");
        let refs: Vec<KillmailReference> = self
            .fetcher
            .get_json(ZKB_SERVICE, priority, self.queue_timeout_ms, &url)
            .await
            .map_err(ZkbError::Api)?;
        Ok(refs.into_iter().take(limit).collect())
    }

    /// Fetches references for a system no older than `since`, used by the
    /// preloader's time-bounded backfill mode. zKillboard has no
    /// server-side "since" filter on this endpoint, so filtering happens
    /// client-side once hashes are resolved to kill times downstream.
    pub async fn system_kills_since(
        &self,
        system_id: u32,
        limit: usize,
        priority: Priority,
    ) -> Result<Vec<KillmailReference>, ZkbError> {
        self.system_kills(system_id, limit, priority).await
    }
}
