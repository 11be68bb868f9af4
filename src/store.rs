//! Persistence via PostgREST. Storage is optional: with no credentials the
//! pipeline runs in-memory only, and a failed write is logged and skipped so
//! research output is never lost to a storage hiccup.

use crate::http::build_client;
use crate::models::{RefinedFindings, ResearchResult, ScanStatus};
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoreClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
}

impl StoreClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    pub async fn upsert_scan_status(
        &self,
        scan_id: Uuid,
        status: ScanStatus,
    ) -> Result<(), StoreError> {
        self.upsert(
            "scans",
            &json!({
                "id": scan_id,
                "status": status,
                "updated_at": chrono::Utc::now(),
            }),
        )
        .await
    }

    pub async fn upsert_research(
        &self,
        scan_id: Uuid,
        research: &ResearchResult,
    ) -> Result<(), StoreError> {
        self.upsert(
            "research_results",
            &json!({
                "scan_id": scan_id,
                "result": research,
                "updated_at": chrono::Utc::now(),
            }),
        )
        .await
    }

    pub async fn upsert_findings(
        &self,
        scan_id: Uuid,
        findings: &RefinedFindings,
    ) -> Result<(), StoreError> {
        self.upsert(
            "refined_findings",
            &json!({
                "scan_id": scan_id,
                "findings": findings,
                "updated_at": chrono::Utc::now(),
            }),
        )
        .await
    }

    /// Best-effort variant used from the pipeline: failures are logged with
    /// the scan id, never propagated.
    pub async fn try_upsert_research(&self, scan_id: Uuid, research: &ResearchResult) {
        if let Err(err) = self.upsert_research(scan_id, research).await {
            warn!(
                target = "argus.store",
                scan_id = %scan_id,
                error = %err,
                "research upsert failed, continuing"
            );
        }
    }

    pub async fn try_upsert_findings(&self, scan_id: Uuid, findings: &RefinedFindings) {
        if let Err(err) = self.upsert_findings(scan_id, findings).await {
            warn!(
                target = "argus.store",
                scan_id = %scan_id,
                error = %err,
                "findings upsert failed, continuing"
            );
        }
    }

    pub async fn try_upsert_scan_status(&self, scan_id: Uuid, status: ScanStatus) {
        if let Err(err) = self.upsert_scan_status(scan_id, status).await {
            warn!(
                target = "argus.store",
                scan_id = %scan_id,
                error = %err,
                "scan status upsert failed, continuing"
            );
        }
    }

    async fn upsert(&self, table: &str, body: &serde_json::Value) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/{table}", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "resolution=merge-duplicates")
            .json(body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}
