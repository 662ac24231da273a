// 配置读取：YAML 配置 + ${VAR:-default} 环境变量占位符展开，相对路径按配置目录解析。
use crate::error::{Result, SyncError};
use crate::path_utils::{config_base_dir, resolve_against};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_PATH_ENV: &str = "REPORT_SYNC_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/report-sync.yaml";
/// 抓取阶段经隧道串行发出的请求数：学员导出、报表元数据、报表下载。
const FETCH_REQUESTS: u64 = 3;
const WATCHDOG_SLACK_S: u64 = 10;

pub const DEFAULT_LEARNER_FIELDS: &[&str] = &[
    "user_id",
    "username",
    "name",
    "email",
    "language",
    "location",
    "year_of_birth",
    "gender",
    "level_of_education",
    "mailing_address",
    "goals",
    "enrollment_mode",
    "segments",
    "cohort",
    "city",
    "country",
    "enrollment_date",
    "last_updated",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sheets: SheetsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    /// 启动 SSH 客户端的命令，可带前置参数（如 `ssh -v`）。
    pub ssh_command: String,
    pub config_path: PathBuf,
    pub alias: String,
    #[serde(deserialize_with = "deserialize_number_from_any")]
    pub local_port: u16,
    /// 远端 `sleep` 秒数的下限；实际值见 `Config::tunnel_watchdog_s`。
    #[serde(deserialize_with = "deserialize_number_from_any")]
    pub idle_window_s: u64,
    #[serde(deserialize_with = "deserialize_number_from_any")]
    pub ready_timeout_s: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ssh_command: "ssh".to_string(),
            config_path: PathBuf::from("ssh-config"),
            alias: "epodx-analytics-api".to_string(),
            local_port: 18100,
            idle_window_s: 60,
            ready_timeout_s: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub token_path: PathBuf,
    pub course_id: String,
    pub learner_fields: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:18100".to_string(),
            token_path: PathBuf::from("hks_secret_token.txt"),
            course_id: "course-v1:epodx+BCURE-AGG+2016_v1".to_string(),
            learner_fields: DEFAULT_LEARNER_FIELDS
                .iter()
                .map(|field| field.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetsConfig {
    pub api_base: String,
    pub spreadsheet_id: String,
    pub learners_range: String,
    pub problems_range: String,
    /// Service account JSON；为空时走应用默认凭据发现。
    pub credentials_path: Option<PathBuf>,
    /// 预先获取的 OAuth access token，优先于 credentials_path。
    pub access_token: Option<String>,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            api_base: "https://sheets.googleapis.com".to_string(),
            spreadsheet_id: "1uMAyKZYtoVLzqpknBxOGbkLjR7-AMqlEEowdFqSc3pw".to_string(),
            learners_range: "student_profile_info".to_string(),
            problems_range: "problem_responses".to_string(),
            credentials_path: None,
            access_token: None,
        }
    }
}

impl SheetsConfig {
    pub fn static_access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(deserialize_with = "deserialize_number_from_any")]
    pub timeout_s: u64,
    #[serde(deserialize_with = "deserialize_number_from_any")]
    pub connect_timeout_s: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_s: 60,
            connect_timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

impl Config {
    /// 相对路径统一以配置文件所在目录为基准。
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        self.tunnel.config_path = resolve_against(base_dir, &self.tunnel.config_path);
        self.api.token_path = resolve_against(base_dir, &self.api.token_path);
        if let Some(path) = self.sheets.credentials_path.take() {
            self.sheets.credentials_path = Some(resolve_against(base_dir, &path));
        }
    }

    /// 只校验取值本身；文件存在性与密钥读取由 `Secrets::load` 负责。
    pub fn validate(&self) -> Result<()> {
        let base_url = self.api.base_url.trim();
        if base_url.is_empty() {
            return Err(SyncError::config("api.base_url is empty"));
        }
        url::Url::parse(base_url)
            .map_err(|err| SyncError::config(format!("api.base_url is invalid: {err}")))?;
        if self.api.course_id.trim().is_empty() {
            return Err(SyncError::config("api.course_id is empty"));
        }
        if self
            .api
            .learner_fields
            .iter()
            .all(|field| field.trim().is_empty())
        {
            return Err(SyncError::config("api.learner_fields is empty"));
        }
        url::Url::parse(self.sheets.api_base.trim())
            .map_err(|err| SyncError::config(format!("sheets.api_base is invalid: {err}")))?;
        if self.sheets.spreadsheet_id.trim().is_empty() {
            return Err(SyncError::config("sheets.spreadsheet_id is empty"));
        }
        if self.sheets.learners_range.trim().is_empty()
            || self.sheets.problems_range.trim().is_empty()
        {
            return Err(SyncError::config("sheets range names must not be empty"));
        }
        if self.sheets.learners_range.trim() == self.sheets.problems_range.trim() {
            return Err(SyncError::config(
                "sheets.learners_range and sheets.problems_range must differ",
            ));
        }
        if self.tunnel.enabled {
            if self.tunnel.alias.trim().is_empty() {
                return Err(SyncError::config("tunnel.alias is empty"));
            }
            if self.tunnel.local_port == 0 {
                return Err(SyncError::config("tunnel.local_port must be non-zero"));
            }
            if self.tunnel.idle_window_s == 0 {
                return Err(SyncError::config("tunnel.idle_window_s must be at least 1"));
            }
            if self.http.timeout_s == 0 {
                return Err(SyncError::config(
                    "http.timeout_s must be non-zero when the tunnel is enabled",
                ));
            }
        }
        Ok(())
    }

    /// 远端 `sleep` 的实际秒数，不短于一次完整抓取的最长耗时。
    /// 隧道正常情况下在抓取结束后被显式关闭，这个值只兜底异常退出。
    pub fn tunnel_watchdog_s(&self) -> u64 {
        let fetch_budget = self
            .tunnel
            .ready_timeout_s
            .max(1)
            .saturating_add(FETCH_REQUESTS.saturating_mul(self.http.timeout_s))
            .saturating_add(WATCHDOG_SLACK_S);
        self.tunnel.idle_window_s.max(fetch_budget)
    }

    pub fn learner_fields_param(&self) -> String {
        self.api
            .learner_fields
            .iter()
            .map(|field| field.trim())
            .filter(|field| !field.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn resolve_config_path(cli_path: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_path {
        return path.to_path_buf();
    }
    env::var(CONFIG_PATH_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|err| {
        SyncError::config(format!("read config {} failed: {err}", path.display()))
    })?;
    let mut config = parse_config(&content)
        .map_err(|err| SyncError::config(format!("parse config {}: {err}", path.display())))?;
    config.resolve_paths(&config_base_dir(path));
    config.validate()?;
    Ok(config)
}

/// 解析 YAML 文本；空文档视为全默认配置。
pub fn parse_config(content: &str) -> std::result::Result<Config, serde_yaml::Error> {
    let mut value: Value = serde_yaml::from_str(content)?;
    if value.is_null() {
        return Ok(Config::default());
    }
    expand_yaml_env(&mut value);
    serde_yaml::from_value(value)
}

fn deserialize_number_from_any<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64> + FromStr,
{
    struct NumberVisitor<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for NumberVisitor<T>
    where
        T: TryFrom<u64> + FromStr,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("non-negative integer or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            T::try_from(value).map_err(|_| E::custom("integer out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("integer must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("numeric string is empty"));
            }
            trimmed
                .parse::<T>()
                .map_err(|_| E::custom(format!("invalid number: {trimmed}")))
        }

        fn visit_string<E>(self, value: String) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(NumberVisitor(PhantomData))
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut pieces = input.split("${");
    let mut output = pieces.next().unwrap_or_default().to_string();
    for piece in pieces {
        match piece.split_once('}') {
            Some((inner, tail)) => {
                output.push_str(&resolve_placeholder(inner));
                output.push_str(tail);
            }
            None => {
                output.push_str("${");
                output.push_str(piece);
            }
        }
    }
    output
}

/// `NAME` 或 `NAME:-fallback`；变量为空视同未设置。
fn resolve_placeholder(inner: &str) -> String {
    let (name, fallback) = inner.split_once(":-").unwrap_or((inner, ""));
    let name = name.trim();
    if name.is_empty() {
        return format!("${{{inner}}}");
    }
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
