// 表格写入：获取 OAuth 令牌后，以一次 values:batchUpdate 把两张表写入同一文档的命名区域。
use crate::error::{Result, Stage, SyncError};
use crate::table::Table;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
/// 原样写入字符串，不做公式求值或类型推断。
pub const VALUE_INPUT_RAW: &str = "RAW";

#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self, scopes: &[&str]) -> Result<String>;
}

/// 预先获取好的 bearer token。
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn access_token(&self, _scopes: &[&str]) -> Result<String> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err(SyncError::auth("static access token is empty"));
        }
        Ok(token.to_string())
    }
}

pub struct GcpTokenSource {
    provider: Arc<dyn gcp_auth::TokenProvider>,
}

impl GcpTokenSource {
    pub fn from_service_account_file(path: &Path) -> Result<Self> {
        let account = gcp_auth::CustomServiceAccount::from_file(path).map_err(|err| {
            SyncError::auth(format!(
                "load service account {} failed: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            provider: Arc::new(account),
        })
    }

    /// 自动发现应用默认凭据（GOOGLE_APPLICATION_CREDENTIALS、gcloud、元数据服务）。
    pub async fn discover() -> Result<Self> {
        let provider = gcp_auth::provider()
            .await
            .map_err(|err| SyncError::auth(format!("discover google credentials failed: {err}")))?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl AccessTokenSource for GcpTokenSource {
    async fn access_token(&self, scopes: &[&str]) -> Result<String> {
        let token = self
            .provider
            .token(scopes)
            .await
            .map_err(|err| SyncError::auth(format!("get google access token failed: {err}")))?;
        Ok(token.as_str().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub range: String,
    pub values: Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateRequest {
    pub value_input_option: String,
    pub data: Vec<ValueRange>,
}

impl BatchUpdateRequest {
    pub fn row_counts(&self) -> Vec<(String, usize)> {
        self.data
            .iter()
            .map(|item| (item.range.clone(), item.values.len()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateResponse {
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    #[serde(default)]
    pub total_updated_rows: Option<u64>,
    #[serde(default)]
    pub total_updated_columns: Option<u64>,
    #[serde(default)]
    pub total_updated_cells: Option<u64>,
    #[serde(default)]
    pub total_updated_sheets: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorResponse {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

pub fn build_batch_update(ranges: Vec<(String, Table)>) -> BatchUpdateRequest {
    BatchUpdateRequest {
        value_input_option: VALUE_INPUT_RAW.to_string(),
        data: ranges
            .into_iter()
            .map(|(range, values)| ValueRange { range, values })
            .collect(),
    }
}

pub struct SheetsClient {
    http: Client,
    api_base: String,
    spreadsheet_id: String,
    tokens: Arc<dyn AccessTokenSource>,
}

impl SheetsClient {
    pub fn new(
        http: Client,
        api_base: &str,
        spreadsheet_id: impl Into<String>,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            tokens,
        }
    }

    pub fn batch_update_url(&self) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values:batchUpdate",
            self.api_base,
            url::form_urlencoded::byte_serialize(self.spreadsheet_id.trim().as_bytes())
                .collect::<String>()
        )
    }

    pub async fn batch_update(&self, request: &BatchUpdateRequest) -> Result<BatchUpdateResponse> {
        let access_token = self.tokens.access_token(&[SPREADSHEETS_SCOPE]).await?;
        let url = self.batch_update_url();
        info!(
            "writing {} ranges to spreadsheet {}",
            request.data.len(),
            self.spreadsheet_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&access_token)
            .json(request)
            .send()
            .await
            .map_err(|err| {
                SyncError::write(format!("sheets batchUpdate request failed: {err}"))
                    .with_detail(json!({ "url": url }))
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(google_error(&url, status.as_u16(), &body));
        }
        let parsed = parse_batch_response(&body);
        info!(
            "spreadsheet updated: rows={}, cells={}",
            parsed.total_updated_rows.unwrap_or(0),
            parsed.total_updated_cells.unwrap_or(0)
        );
        Ok(parsed)
    }
}

/// 成功响应体无法解析时只告警，写入本身已经生效。
fn parse_batch_response(body: &str) -> BatchUpdateResponse {
    match serde_json::from_str::<BatchUpdateResponse>(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                "sheets batchUpdate succeeded but response is not valid json: {err}; body={}",
                crate::error::truncate_body(body, 256)
            );
            BatchUpdateResponse::default()
        }
    }
}

fn google_error(url: &str, status: u16, body: &str) -> SyncError {
    let Ok(parsed) = serde_json::from_str::<GoogleErrorResponse>(body) else {
        return SyncError::http_status(Stage::Write, url, status, body);
    };
    let remote_status = parsed.error.status.unwrap_or_default();
    // 401/403 多为令牌过期或权限不足，归到鉴权阶段。
    let stage = if matches!(status, 401 | 403) && remote_status != "PERMISSION_DENIED" {
        Stage::Auth
    } else {
        Stage::Write
    };
    SyncError::new(
        stage,
        format!(
            "sheets batchUpdate failed: {} ({})",
            parsed.error.message, remote_status
        ),
        Some(json!({
            "url": url,
            "status": status,
            "remote_code": parsed.error.code,
            "remote_status": remote_status,
            "remote_message": parsed.error.message,
        })),
    )
}
