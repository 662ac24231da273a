// 统一错误类型：按阶段归类，附带可选的诊断细节（状态码、URL、远端消息）。
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Tunnel,
    Fetch,
    Auth,
    Write,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Tunnel => "tunnel",
            Self::Fetch => "fetch",
            Self::Auth => "auth",
            Self::Write => "write",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Config => "CONFIG_ERROR",
            Self::Tunnel => "TUNNEL_ERROR",
            Self::Fetch => "FETCH_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::Write => "WRITE_ERROR",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Config => 2,
            Self::Tunnel => 3,
            Self::Fetch => 4,
            Self::Auth => 5,
            Self::Write => 6,
        }
    }
}

#[derive(Debug)]
pub struct SyncError {
    stage: Stage,
    message: String,
    detail: Option<Value>,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    pub fn new(stage: Stage, message: impl Into<String>, detail: Option<Value>) -> Self {
        Self {
            stage,
            message: message.into(),
            detail,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(Stage::Config, message, None)
    }

    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::new(Stage::Tunnel, message, None)
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::new(Stage::Fetch, message, None)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(Stage::Auth, message, None)
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::new(Stage::Write, message, None)
    }

    /// HTTP 非 2xx 响应：保留状态码、URL 与截断后的响应体。
    pub fn http_status(stage: Stage, url: &str, status: u16, body: &str) -> Self {
        let snippet = truncate_body(body, BODY_SNIPPET_CHARS);
        Self::new(
            stage,
            format!("{url} returned HTTP {status}"),
            Some(json!({
                "url": url,
                "status": status,
                "body": snippet,
            })),
        )
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn code(&self) -> &'static str {
        self.stage.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&Value> {
        self.detail.as_ref()
    }

    pub fn exit_code(&self) -> i32 {
        self.stage.exit_code()
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "code": self.code(),
            "stage": self.stage.as_str(),
            "message": self.message,
        });
        if let Some(detail) = &self.detail {
            if let Value::Object(ref mut map) = payload {
                map.insert("detail".to_string(), detail.clone());
            }
        }
        payload
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage.as_str(), self.message)
    }
}

impl std::error::Error for SyncError {}

const BODY_SNIPPET_CHARS: usize = 512;

pub(crate) fn truncate_body(body: &str, max_chars: usize) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut output: String = trimmed.chars().take(max_chars).collect();
    output.push_str("...");
    output
}
