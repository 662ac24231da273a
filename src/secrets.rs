// 密钥预检：所有网络动作之前一次性读取并校验，缺失即失败。
use crate::config::Config;
use crate::error::{Result, SyncError};
use std::fs;
use std::path::Path;

pub struct Secrets {
    api_token: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("api_token", &"<redacted>")
            .finish()
    }
}

impl Secrets {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
        }
    }

    pub fn load(config: &Config) -> Result<Self> {
        let api_token = read_token_file(&config.api.token_path)?;
        if config.sheets.static_access_token().is_none() {
            if let Some(path) = &config.sheets.credentials_path {
                if !path.is_file() {
                    return Err(SyncError::config(format!(
                        "sheets credentials file not found: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(Self { api_token })
    }

    pub fn api_token(&self) -> &str {
        &self.api_token
    }
}

/// 读取令牌文件，去掉换行符；空文件视为缺失。
pub fn read_token_file(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).map_err(|err| {
        SyncError::config(format!("read token file {} failed: {err}", path.display()))
    })?;
    let token = raw.replace(['\r', '\n'], "");
    let token = token.trim();
    if token.is_empty() {
        return Err(SyncError::config(format!(
            "token file {} is empty",
            path.display()
        )));
    }
    Ok(token.to_string())
}
