use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::model::{ApproveAllSummary, Cursor, StepResult, WorkTarget};

const STEP_PATH: &str = "api/v1/attendance/approvals/step";
const APPROVE_ALL_PATH: &str = "api/v1/attendance/approvals/approve-all";
const REJECT_PATH: &str = "api/v1/attendance/approvals/reject";

/// One remote batch step. Every call may send real notifications, so callers
/// must never repeat a call for the same cursor.
#[async_trait]
pub trait StepClient: Send + Sync {
    async fn execute_step(&self, target: &WorkTarget, cursor: Cursor) -> Result<StepResult>;
}

/// Single-shot operations that bypass pacing.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn approve_all_pending(&self) -> Result<ApproveAllSummary>;

    async fn reject(&self, target_identifier: &str, reason: Option<&str>) -> Result<bool>;
}

#[derive(Debug, Serialize)]
struct StepRequest<'a> {
    target_identifier: String,
    group_id: &'a str,
    date: String,
    cursor_offset: u64,
    cumulative_sent: u64,
}

/// Counts are signed on the wire so a misbehaving server is reported as such
/// instead of as an opaque decode failure.
#[derive(Debug, Deserialize)]
struct StepResponse {
    records_approved: i64,
    total_messages_sent: i64,
    messages_skipped: i64,
    next_offset: i64,
    has_more: bool,
    needs_break: bool,
}

impl TryFrom<StepResponse> for StepResult {
    type Error = anyhow::Error;

    fn try_from(resp: StepResponse) -> Result<Self> {
        let non_negative = |name: &str, value: i64| -> Result<u64> {
            u64::try_from(value).map_err(|_| anyhow!("step response has negative {name}: {value}"))
        };
        let messages_sent = non_negative("total_messages_sent", resp.total_messages_sent)?;
        Ok(StepResult {
            records_approved: non_negative("records_approved", resp.records_approved)?,
            messages_sent,
            messages_skipped: non_negative("messages_skipped", resp.messages_skipped)?,
            next_cursor: Cursor {
                offset: non_negative("next_offset", resp.next_offset)?,
                cumulative_sent: messages_sent,
            },
            has_more: resp.has_more,
            needs_break: resp.needs_break,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApproveAllResponse {
    approved_count: i64,
    failed_count: i64,
}

impl TryFrom<ApproveAllResponse> for ApproveAllSummary {
    type Error = anyhow::Error;

    fn try_from(resp: ApproveAllResponse) -> Result<Self> {
        let non_negative = |name: &str, value: i64| -> Result<u64> {
            u64::try_from(value).map_err(|_| anyhow!("approve-all response has negative {name}: {value}"))
        };
        Ok(ApproveAllSummary {
            approved_count: non_negative("approved_count", resp.approved_count)?,
            failed_count: non_negative("failed_count", resp.failed_count)?,
        })
    }
}

#[derive(Debug, Serialize)]
struct RejectRequest<'a> {
    target_identifier: &'a str,
    reason: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RejectResponse {
    success: bool,
}

/// HTTP adapter for the school backend.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.api.base_url).context("invalid api.base_url")?;
        let http = Client::builder()
            .user_agent(concat!("attendance-dispatch/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.api.request_timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::with_http(http, base_url, cfg.api.token.clone()))
    }

    pub fn with_http(http: Client, base_url: Url, token: String) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid API base URL")?;
        debug!(url = %endpoint, "sending API request");
        let res = self
            .http
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .context("failed to reach attendance API")?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%body, "rate limited by attendance API");
            return Err(anyhow!("received 429 from attendance API: {}", body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %body, "attendance API error");
            return Err(anyhow!("attendance API error {}: {}", status, body));
        }

        res.json::<R>()
            .await
            .context("invalid attendance API response")
    }
}

#[async_trait]
impl StepClient for ApiClient {
    #[instrument(skip_all, fields(target = %target, offset = cursor.offset))]
    async fn execute_step(&self, target: &WorkTarget, cursor: Cursor) -> Result<StepResult> {
        let body = StepRequest {
            target_identifier: target.identifier(),
            group_id: &target.group_id,
            date: target.date.format("%Y-%m-%d").to_string(),
            cursor_offset: cursor.offset,
            cumulative_sent: cursor.cumulative_sent,
        };
        let resp: StepResponse = self.post_json(STEP_PATH, &body).await?;
        resp.try_into()
    }
}

#[async_trait]
impl ApprovalService for ApiClient {
    #[instrument(skip_all)]
    async fn approve_all_pending(&self) -> Result<ApproveAllSummary> {
        let resp: ApproveAllResponse = self.post_json(APPROVE_ALL_PATH, &serde_json::json!({})).await?;
        resp.try_into()
    }

    #[instrument(skip_all, fields(target = target_identifier))]
    async fn reject(&self, target_identifier: &str, reason: Option<&str>) -> Result<bool> {
        let body = RejectRequest {
            target_identifier,
            reason,
        };
        let resp: RejectResponse = self.post_json(REJECT_PATH, &body).await?;
        Ok(resp.success)
    }
}
