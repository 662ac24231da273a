// 报表抓取：经隧道访问分析 API，下载学员档案 CSV 与题目作答 CSV（先取 JSON 中的下载地址）。
use crate::error::{Result, Stage, SyncError};
use crate::table::{decode_ascii_lossy, parse_csv, ragged_rows, Table};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

const LEARNERS_PATH: &str = "api/v0/learners/";

#[derive(Debug, Clone)]
pub struct ReportClient {
    http: Client,
    base_url: Url,
    token: String,
    course_id: String,
    learner_fields: String,
}

#[derive(Debug, Deserialize)]
struct ProblemResponseReport {
    download_url: Option<String>,
}

impl ReportClient {
    pub fn new(
        http: Client,
        base_url: &str,
        token: impl Into<String>,
        course_id: impl Into<String>,
        learner_fields: impl Into<String>,
    ) -> Result<Self> {
        let mut base_url = Url::parse(base_url.trim())
            .map_err(|err| SyncError::config(format!("invalid api base url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::config(format!(
                "api base url cannot carry paths: {base_url}"
            )));
        }
        // 保证以 `/` 结尾，join 时保留已有路径前缀。
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            token: token.into(),
            course_id: course_id.into(),
            learner_fields: learner_fields.into(),
        })
    }

    pub fn learner_profiles_url(&self) -> Result<Url> {
        let mut url = self.join(LEARNERS_PATH)?;
        url.query_pairs_mut()
            .append_pair("course_id", &self.course_id)
            .append_pair("fields", &self.learner_fields);
        Ok(url)
    }

    pub fn problem_report_url(&self) -> Result<Url> {
        let mut url = self.join("api/v0/courses/")?;
        url.path_segments_mut()
            .map_err(|_| SyncError::config("api base url cannot carry paths"))?
            .pop_if_empty()
            .extend([self.course_id.as_str(), "reports", "problem_response"]);
        Ok(url)
    }

    pub async fn learner_profiles(&self) -> Result<Table> {
        let url = self.learner_profiles_url()?;
        info!("fetching learner profiles for {}", self.course_id);
        let request = self
            .http
            .get(url.clone())
            .header(AUTHORIZATION, self.authorization())
            .header(ACCEPT, "text/csv");
        let table = self.fetch_csv(request, url.as_str()).await?;
        report_shape("learner profiles", &table);
        Ok(table)
    }

    pub async fn problem_responses(&self) -> Result<Table> {
        let report_url = self.problem_report_url()?;
        info!("fetching problem response report for {}", self.course_id);
        let response = self
            .http
            .get(report_url.clone())
            .header(AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(|err| transport_error(report_url.as_str(), err))?;
        let body = checked_body(response, report_url.as_str()).await?;
        let report: ProblemResponseReport = serde_json::from_slice(&body).map_err(|err| {
            SyncError::fetch(format!("problem response report is not valid JSON: {err}"))
                .with_detail(json!({ "url": report_url.as_str() }))
        })?;
        let download_url = report
            .download_url
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                SyncError::fetch("problem response report has no download_url")
                    .with_detail(json!({ "url": report_url.as_str() }))
            })?;

        // 下载地址为预签名链接，不携带 API 令牌。
        info!("downloading problem responses csv");
        let request = self.http.get(download_url.as_str());
        let table = self.fetch_csv(request, &download_url).await?;
        report_shape("problem responses", &table);
        Ok(table)
    }

    async fn fetch_csv(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Table> {
        let response = request
            .send()
            .await
            .map_err(|err| transport_error(url, err))?;
        let body = checked_body(response, url).await?;
        parse_csv(&decode_ascii_lossy(&body))
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| SyncError::config(format!("build api url failed: {err}")))
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.token)
    }
}

async fn checked_body(response: reqwest::Response, url: &str) -> Result<Vec<u8>> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(SyncError::http_status(
            Stage::Fetch,
            url,
            status.as_u16(),
            &text,
        ));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| transport_error(url, err))?;
    Ok(bytes.to_vec())
}

fn transport_error(url: &str, err: reqwest::Error) -> SyncError {
    let reason = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    SyncError::fetch(format!("GET {url} {reason}: {err}")).with_detail(json!({ "url": url }))
}

fn report_shape(name: &str, table: &Table) {
    let width = table.first().map(Vec::len).unwrap_or(0);
    info!("{name}: {} rows x {width} columns", table.len());
    let ragged = ragged_rows(table);
    if !ragged.is_empty() {
        warn!(
            "{name}: {} rows differ from header width {width} (first at row {})",
            ragged.len(),
            ragged[0]
        );
    }
}
