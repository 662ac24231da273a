use report_sheet_sync::config::Config;
use report_sheet_sync::{RunSummary, SyncError};
use serde_json::{json, Value};

pub fn print_summary(summary: &RunSummary, as_json: bool) {
    if as_json {
        println!("{}", to_json_line(&json!(summary)));
        return;
    }
    if summary.dry_run {
        println!("dry run, spreadsheet {} not written", summary.spreadsheet_id);
    } else {
        println!("spreadsheet {} updated", summary.spreadsheet_id);
    }
    for range in &summary.ranges {
        println!("  {}: {} rows", range.range, range.rows);
    }
    if let Some(response) = &summary.response {
        println!(
            "  total: {} rows, {} cells",
            response.total_updated_rows.unwrap_or(0),
            response.total_updated_cells.unwrap_or(0)
        );
    }
}

pub fn plan_value(config: &Config) -> Value {
    json!({
        "tunnel": {
            "enabled": config.tunnel.enabled,
            "ssh_command": config.tunnel.ssh_command,
            "config_path": config.tunnel.config_path.display().to_string(),
            "alias": config.tunnel.alias,
            "local_port": config.tunnel.local_port,
            "idle_window_s": config.tunnel.idle_window_s,
            "watchdog_s": config.tunnel_watchdog_s(),
        },
        "api": {
            "base_url": config.api.base_url,
            "course_id": config.api.course_id,
            "token_path": config.api.token_path.display().to_string(),
            "learner_fields": config.api.learner_fields,
        },
        "sheets": {
            "spreadsheet_id": config.sheets.spreadsheet_id,
            "learners_range": config.sheets.learners_range,
            "problems_range": config.sheets.problems_range,
            "credentials": credentials_label(config),
        },
    })
}

pub fn print_plan(config: &Config, as_json: bool) {
    if as_json {
        println!("{}", to_json_line(&plan_value(config)));
        return;
    }
    println!("config ok");
    if config.tunnel.enabled {
        println!(
            "  tunnel: {} -F {} {} (port {}, watchdog {}s)",
            config.tunnel.ssh_command,
            config.tunnel.config_path.display(),
            config.tunnel.alias,
            config.tunnel.local_port,
            config.tunnel_watchdog_s()
        );
    } else {
        println!("  tunnel: disabled");
    }
    println!("  api: {} ({})", config.api.base_url, config.api.course_id);
    println!(
        "  sheets: {} -> {}, {}",
        config.sheets.spreadsheet_id, config.sheets.learners_range, config.sheets.problems_range
    );
    println!("  credentials: {}", credentials_label(config));
}

pub fn print_error(err: &SyncError, as_json: bool) {
    if as_json {
        eprintln!("{}", to_json_line(&err.to_payload()));
        return;
    }
    eprintln!("error[{}] {err}", err.code());
    if let Some(detail) = err.detail() {
        eprintln!("  detail: {detail}");
    }
}

fn credentials_label(config: &Config) -> String {
    if config.sheets.static_access_token().is_some() {
        return "static access token".to_string();
    }
    match &config.sheets.credentials_path {
        Some(path) => format!("service account {}", path.display()),
        None => "application default credentials".to_string(),
    }
}

fn to_json_line(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}
