// 路径工具：相对路径统一按配置文件所在目录解析，不依赖进程工作目录。
use std::fs;
use std::path::{Path, PathBuf};

pub fn normalize_existing_path(path: &Path) -> PathBuf {
    if path.exists() {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    } else {
        path.to_path_buf()
    }
}

pub fn resolve_against(base_dir: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        return path.to_path_buf();
    }
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        return expanded;
    }
    base_dir.join(expanded)
}

pub fn config_base_dir(config_path: &Path) -> PathBuf {
    let normalized = normalize_existing_path(config_path);
    match normalized.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    match home {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_the_config_dir() {
        let base = Path::new("/etc/report-sync");
        assert_eq!(
            resolve_against(base, Path::new("./ssh-config")),
            PathBuf::from("/etc/report-sync/./ssh-config")
        );
        assert_eq!(
            resolve_against(base, Path::new("/abs/token.txt")),
            PathBuf::from("/abs/token.txt")
        );
    }

    #[test]
    fn config_base_dir_of_bare_file_name_is_current_dir() {
        let dir = config_base_dir(Path::new("definitely-missing-report-sync.yaml"));
        assert_eq!(dir, PathBuf::from("."));
    }
}
