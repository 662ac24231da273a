// SSH 隧道：拉起外部 ssh 客户端做本地端口转发，探活后交给抓取阶段，用完即关。
use crate::command_utils::{build_program_command, is_not_found_error, program_name};
use crate::config::Config;
use crate::error::{Result, SyncError};
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_READ_TIMEOUT: Duration = Duration::from_secs(1);
const STDERR_MAX_CHARS: usize = 2048;

#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub ssh_command: String,
    pub config_path: PathBuf,
    pub alias: String,
    pub local_port: u16,
    /// 远端 `sleep` 时长，隧道未被显式关闭时的兜底寿命，覆盖整个抓取。
    pub idle_window: Duration,
    pub ready_timeout: Duration,
}

impl TunnelSpec {
    pub fn from_config(config: &Config) -> Self {
        let tunnel = &config.tunnel;
        Self {
            ssh_command: tunnel.ssh_command.clone(),
            config_path: tunnel.config_path.clone(),
            alias: tunnel.alias.trim().to_string(),
            local_port: tunnel.local_port,
            idle_window: Duration::from_secs(config.tunnel_watchdog_s()),
            ready_timeout: Duration::from_secs(tunnel.ready_timeout_s.max(1)),
        }
    }

    /// 不拉起任何进程的前置检查。
    pub fn preflight(&self) -> Result<()> {
        if !self.config_path.is_file() {
            return Err(SyncError::tunnel(format!(
                "ssh config file not found: {}",
                self.config_path.display()
            ))
            .with_detail(json!({ "config_path": self.config_path.display().to_string() })));
        }
        if self.alias.is_empty() {
            return Err(SyncError::tunnel("ssh host alias is empty"));
        }
        if self.ssh_command.trim().is_empty() {
            return Err(SyncError::tunnel("ssh command is empty"));
        }
        Ok(())
    }
}

pub fn build_ssh_args(spec: &TunnelSpec) -> Vec<String> {
    vec![
        "-F".to_string(),
        spec.config_path.display().to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        spec.alias.clone(),
        "sleep".to_string(),
        spec.idle_window.as_secs().max(1).to_string(),
    ]
}

pub struct Tunnel {
    child: Option<Child>,
    local_port: Option<u16>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// API 可直连时使用的空隧道。
    pub fn disabled() -> Self {
        Self {
            child: None,
            local_port: None,
            stderr_drain: None,
        }
    }

    pub async fn open(spec: &TunnelSpec) -> Result<Self> {
        spec.preflight()?;
        if port_accepts_connections(spec.local_port).await {
            return Err(SyncError::tunnel(format!(
                "local port {} is already in use; another tunnel may still be open",
                spec.local_port
            )));
        }

        let mut command = build_program_command(&spec.ssh_command).ok_or_else(|| {
            SyncError::tunnel(format!("invalid ssh command: {}", spec.ssh_command))
        })?;
        command
            .args(build_ssh_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let program = program_name(&spec.ssh_command);
        let child = command.spawn().map_err(|err| {
            if is_not_found_error(&err) {
                SyncError::tunnel(format!("ssh client not found: {program}"))
            } else {
                SyncError::tunnel(format!("spawn {program} failed: {err}"))
            }
        })?;
        info!(
            "ssh tunnel starting: alias={}, local_port={}, watchdog={}s",
            spec.alias,
            spec.local_port,
            spec.idle_window.as_secs()
        );

        let mut tunnel = Self {
            child: Some(child),
            local_port: Some(spec.local_port),
            stderr_drain: None,
        };
        match tunnel.wait_until_ready(spec).await {
            Ok(()) => {
                info!("ssh tunnel ready on 127.0.0.1:{}", spec.local_port);
                let stderr = tunnel.child.as_mut().and_then(|child| child.stderr.take());
                tunnel.stderr_drain = stderr.map(|stderr| tokio::spawn(drain_stderr(stderr)));
                Ok(tunnel)
            }
            Err(err) => {
                tunnel.close().await;
                Err(err)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.child.is_some()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    async fn wait_until_ready(&mut self, spec: &TunnelSpec) -> Result<()> {
        let deadline = Instant::now() + spec.ready_timeout;
        loop {
            let Some(child) = self.child.as_mut() else {
                return Err(SyncError::tunnel("ssh tunnel is not running"));
            };
            let exited = child
                .try_wait()
                .map_err(|err| SyncError::tunnel(format!("poll ssh process failed: {err}")))?;
            if let Some(status) = exited {
                let stderr = read_stderr(child).await;
                self.child = None;
                return Err(SyncError::tunnel(format!(
                    "ssh exited before the forward was ready ({status})"
                ))
                .with_detail(json!({
                    "alias": spec.alias,
                    "exit_code": status.code(),
                    "stderr": stderr,
                })));
            }
            if port_accepts_connections(spec.local_port).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SyncError::tunnel(format!(
                    "ssh tunnel not ready on port {} after {}s",
                    spec.local_port,
                    spec.ready_timeout.as_secs()
                )));
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    /// 结束 ssh 进程并回收；已自行退出的进程直接忽略。
    pub async fn close(mut self) {
        if let Some(drain) = self.stderr_drain.take() {
            drain.abort();
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("ssh tunnel already exited: {status}");
            }
            _ => {
                if let Err(err) = child.kill().await {
                    warn!("stop ssh tunnel failed: {err}");
                } else {
                    info!("ssh tunnel closed");
                }
            }
        }
    }
}

async fn port_accepts_connections(port: u16) -> bool {
    timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
        .await
        .is_ok_and(|result| result.is_ok())
}

/// 就绪后持续读走 ssh 的 stderr，避免 `-v` 输出写满管道把 ssh 卡住。
async fn drain_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => debug!("ssh: {}", String::from_utf8_lossy(&line).trim_end()),
        }
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let _ = timeout(STDERR_READ_TIMEOUT, stderr.read_to_end(&mut buffer)).await;
    let text = String::from_utf8_lossy(&buffer);
    crate::error::truncate_body(&text, STDERR_MAX_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn spec_with(config_path: &Path, ssh_command: String, port: u16) -> TunnelSpec {
        TunnelSpec {
            ssh_command,
            config_path: config_path.to_path_buf(),
            alias: "analytics-api".to_string(),
            local_port: port,
            idle_window: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(5),
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// 模拟 ssh 建好转发：稍后在本地端口上开始监听。
    fn spawn_forward(port: u16) -> JoinHandle<()> {
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                .await
                .unwrap();
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        })
    }

    fn script_command(dir: &Path, body: &str) -> String {
        let script = dir.join("fake-ssh.sh");
        fs::write(&script, body).unwrap();
        format!("sh {}", shell_words::quote(&script.display().to_string()))
    }

    #[test]
    fn ssh_args_carry_config_alias_and_idle_window() {
        let spec = TunnelSpec {
            ssh_command: "ssh".to_string(),
            config_path: PathBuf::from("/etc/report-sync/ssh-config"),
            alias: "analytics-api".to_string(),
            local_port: 18100,
            idle_window: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(5),
        };
        assert_eq!(
            build_ssh_args(&spec),
            vec![
                "-F",
                "/etc/report-sync/ssh-config",
                "-o",
                "ExitOnForwardFailure=yes",
                "analytics-api",
                "sleep",
                "10",
            ]
        );
    }

    #[test]
    fn spec_idle_window_never_undercuts_the_fetch() {
        let mut config = Config::default();
        config.tunnel.idle_window_s = 10;
        config.tunnel.ready_timeout_s = 0;
        config.http.timeout_s = 60;
        let spec = TunnelSpec::from_config(&config);
        assert_eq!(spec.idle_window, Duration::from_secs(1 + 3 * 60 + 10));
        assert_eq!(spec.ready_timeout, Duration::from_secs(1));
        assert!(build_ssh_args(&spec).ends_with(&["sleep".to_string(), "191".to_string()]));

        config.tunnel.idle_window_s = 3600;
        let spec = TunnelSpec::from_config(&config);
        assert_eq!(spec.idle_window, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn missing_config_path_fails_without_spawning() {
        let spec = spec_with(
            Path::new("/nonexistent/report-sync/ssh-config"),
            "ssh".to_string(),
            free_port(),
        );
        let started = std::time::Instant::now();
        let err = match Tunnel::open(&spec).await {
            Ok(_) => panic!("tunnel should not open"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "TUNNEL_ERROR");
        assert!(err.message().contains("ssh config file not found"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_ssh_client_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("ssh-config");
        fs::write(&config_path, "Host analytics-api\n").unwrap();
        let spec = spec_with(
            &config_path,
            "report-sync-no-such-ssh-binary".to_string(),
            free_port(),
        );
        let err = match Tunnel::open(&spec).await {
            Ok(_) => panic!("tunnel should not open"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "TUNNEL_ERROR");
        assert!(err.message().contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_ssh_exit_reports_status_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("ssh-config");
        fs::write(&config_path, "Host analytics-api\n").unwrap();
        let command = script_command(
            dir.path(),
            "echo 'ssh: connect to host analytics: Connection refused' 1>&2\nexit 255\n",
        );
        let spec = spec_with(&config_path, command, free_port());
        let err = match Tunnel::open(&spec).await {
            Ok(_) => panic!("tunnel should not open"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "TUNNEL_ERROR");
        let detail = err.detail().cloned().unwrap_or_default();
        assert_eq!(detail["exit_code"], 255);
        assert!(detail["stderr"]
            .as_str()
            .unwrap_or_default()
            .contains("Connection refused"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tunnel_becomes_ready_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("ssh-config");
        fs::write(&config_path, "Host analytics-api\n").unwrap();
        let command = script_command(dir.path(), "exec sleep 30\n");
        let port = free_port();
        let spec = spec_with(&config_path, command, port);
        let forward = spawn_forward(port);

        let tunnel = Tunnel::open(&spec).await.unwrap();
        assert!(tunnel.is_active());
        assert_eq!(tunnel.local_port(), Some(port));
        tunnel.close().await;
        forward.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn verbose_ssh_output_does_not_stall_the_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("ssh-config");
        fs::write(&config_path, "Host analytics-api\n").unwrap();
        let marker = dir.path().join("stderr-done");
        // 约 300KB 的 stderr，远超管道缓冲。
        let body = format!(
            "i=0\nwhile [ $i -lt 3000 ]; do\n  echo \"debug1: channel $i: forwarding chatter padded out to roughly one hundred bytes\" 1>&2\n  i=$((i+1))\ndone\necho done > {}\nexec sleep 30\n",
            shell_words::quote(&marker.display().to_string())
        );
        let command = script_command(dir.path(), &body);
        let port = free_port();
        let spec = spec_with(&config_path, command, port);
        let forward = spawn_forward(port);

        let tunnel = Tunnel::open(&spec).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !marker.exists() && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        assert!(marker.exists(), "ssh stayed blocked on a full stderr pipe");
        tunnel.close().await;
        forward.abort();
    }

    #[tokio::test]
    async fn occupied_local_port_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("ssh-config");
        fs::write(&config_path, "Host analytics-api\n").unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        let spec = spec_with(&config_path, "ssh".to_string(), port);
        let err = match Tunnel::open(&spec).await {
            Ok(_) => panic!("tunnel should not open"),
            Err(err) => err,
        };
        assert!(err.message().contains("already in use"));
        accept.abort();
    }

    #[tokio::test]
    async fn disabled_tunnel_closes_as_noop() {
        let tunnel = Tunnel::disabled();
        assert!(!tunnel.is_active());
        tunnel.close().await;
    }
}
