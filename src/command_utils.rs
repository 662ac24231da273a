use std::io;
use tokio::process::Command;

const SHELL_META_CHARS: &[char] = &['|', '&', ';', '<', '>', '`', '$', '\n', '\r'];

/// 将 `ssh`、`/usr/bin/ssh -v` 这类命令行拆成程序与前置参数，不经过 shell。
pub fn build_program_command(command_line: &str) -> Option<Command> {
    let trimmed = command_line.trim();
    if trimmed.is_empty() || contains_shell_meta(trimmed) {
        return None;
    }
    let parts = shell_words::split(trimmed).ok()?;
    let (program, args) = parts.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Some(cmd)
}

pub fn program_name(command_line: &str) -> String {
    shell_words::split(command_line.trim())
        .ok()
        .and_then(|parts| parts.into_iter().next())
        .unwrap_or_else(|| command_line.trim().to_string())
}

pub fn is_not_found_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

fn contains_shell_meta(command: &str) -> bool {
    command.chars().any(|ch| SHELL_META_CHARS.contains(&ch))
}
