// 同步流程：预检配置与密钥 -> 开隧道抓两份报表 -> 关隧道 -> 一次批量写入表格。
use crate::config::{Config, HttpConfig};
use crate::error::{Result, SyncError};
use crate::reports::ReportClient;
use crate::secrets::Secrets;
use crate::sheets::{
    build_batch_update, AccessTokenSource, BatchUpdateRequest, BatchUpdateResponse,
    GcpTokenSource, SheetsClient, StaticTokenSource,
};
use crate::shutdown::shutdown_signal;
use crate::table::Table;
use crate::tunnel::{Tunnel, TunnelSpec};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Write,
    DryRun,
}

#[derive(Debug, Clone)]
pub struct FetchedReports {
    pub learner_profiles: Table,
    pub problem_responses: Table,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeSummary {
    pub range: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub spreadsheet_id: String,
    pub ranges: Vec<RangeSummary>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<BatchUpdateResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<BatchUpdateRequest>,
}

pub struct SyncJob {
    config: Config,
    secrets: Secrets,
    http: Client,
}

impl SyncJob {
    /// 在任何网络动作之前完成全部校验。
    pub fn prepare(config: Config) -> Result<Self> {
        config.validate()?;
        let secrets = Secrets::load(&config)?;
        if config.tunnel.enabled {
            TunnelSpec::from_config(&config).preflight()?;
        }
        let http = build_http_client(&config.http)?;
        Ok(Self {
            config,
            secrets,
            http,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn report_client(&self) -> Result<ReportClient> {
        ReportClient::new(
            self.http.clone(),
            &self.config.api.base_url,
            self.secrets.api_token(),
            self.config.api.course_id.trim(),
            self.config.learner_fields_param(),
        )
    }

    /// 隧道只在抓取期间存在：无论抓取成功、失败还是被中断都会关闭。
    pub async fn fetch(&self) -> Result<FetchedReports> {
        let client = self.report_client()?;
        let tunnel = if self.config.tunnel.enabled {
            Tunnel::open(&TunnelSpec::from_config(&self.config)).await?
        } else {
            info!("tunnel disabled, using {} directly", self.config.api.base_url);
            Tunnel::disabled()
        };
        let result = tokio::select! {
            result = fetch_reports(&client) => result,
            _ = shutdown_signal() => Err(SyncError::fetch("interrupted while fetching reports")),
        };
        tunnel.close().await;
        result
    }

    pub fn build_request(&self, reports: FetchedReports) -> BatchUpdateRequest {
        build_batch_update(vec![
            (
                self.config.sheets.learners_range.trim().to_string(),
                reports.learner_profiles,
            ),
            (
                self.config.sheets.problems_range.trim().to_string(),
                reports.problem_responses,
            ),
        ])
    }

    pub async fn token_source(&self) -> Result<Arc<dyn AccessTokenSource>> {
        if let Some(token) = self.config.sheets.static_access_token() {
            return Ok(Arc::new(StaticTokenSource::new(token)));
        }
        let source = match &self.config.sheets.credentials_path {
            Some(path) => GcpTokenSource::from_service_account_file(path)?,
            None => GcpTokenSource::discover().await?,
        };
        Ok(Arc::new(source))
    }

    pub fn sheets_client(&self, tokens: Arc<dyn AccessTokenSource>) -> SheetsClient {
        SheetsClient::new(
            self.http.clone(),
            &self.config.sheets.api_base,
            self.config.sheets.spreadsheet_id.trim(),
            tokens,
        )
    }

    pub async fn run(&self, mode: WriteMode) -> Result<RunSummary> {
        let tokens = match mode {
            WriteMode::Write => Some(self.token_source().await?),
            WriteMode::DryRun => None,
        };
        let reports = self.fetch().await?;
        let request = self.build_request(reports);
        let ranges = request
            .row_counts()
            .into_iter()
            .map(|(range, rows)| RangeSummary { range, rows })
            .collect();
        let spreadsheet_id = self.config.sheets.spreadsheet_id.trim().to_string();

        let Some(tokens) = tokens else {
            info!("dry run: skipping spreadsheet write");
            return Ok(RunSummary {
                spreadsheet_id,
                ranges,
                dry_run: true,
                response: None,
                request: Some(request),
            });
        };
        let response = self.sheets_client(tokens).batch_update(&request).await?;
        Ok(RunSummary {
            spreadsheet_id,
            ranges,
            dry_run: false,
            response: Some(response),
            request: None,
        })
    }
}

async fn fetch_reports(client: &ReportClient) -> Result<FetchedReports> {
    let learner_profiles = client.learner_profiles().await?;
    let problem_responses = client.problem_responses().await?;
    Ok(FetchedReports {
        learner_profiles,
        problem_responses,
    })
}

pub fn build_http_client(config: &HttpConfig) -> Result<Client> {
    let mut builder = Client::builder();
    if config.timeout_s > 0 {
        builder = builder.timeout(Duration::from_secs(config.timeout_s));
    }
    if config.connect_timeout_s > 0 {
        builder = builder.connect_timeout(Duration::from_secs(config.connect_timeout_s));
    }
    builder
        .build()
        .map_err(|err| SyncError::config(format!("build http client failed: {err}")))
}
