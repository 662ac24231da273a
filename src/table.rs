// CSV 表格：响应体按 ASCII 尽力解码后解析为字符串二维表，首行表头原样保留，空行保留为空行。
use crate::error::{Result, SyncError};
use serde_json::json;

pub type Table = Vec<Vec<String>>;

/// 丢弃所有非 ASCII 字节。
pub fn decode_ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|byte| byte.is_ascii())
        .map(|byte| char::from(*byte))
        .collect()
}

pub fn parse_csv(text: &str) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(b',')
        .quote(b'"')
        .from_reader(text.as_bytes());
    let mut blanks = blank_line_slots(text).into_iter().peekable();
    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        while blanks.next_if(|slot| *slot == index).is_some() {
            rows.push(Vec::new());
        }
        let record = record.map_err(|err| {
            SyncError::fetch(format!("parse csv row {} failed: {err}", index + 1))
                .with_detail(json!({ "row": index + 1 }))
        })?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    rows.extend(blanks.map(|_| Vec::new()));
    Ok(rows)
}

/// csv 读取器会跳过空行；记下每个引号外空行前已有的记录数，解析后按位补回。
fn blank_line_slots(text: &str) -> Vec<usize> {
    let mut slots = Vec::new();
    let mut records = 0;
    let mut in_quotes = false;
    for line in text.lines() {
        if !in_quotes && line.is_empty() {
            slots.push(records);
            continue;
        }
        let quotes = line.bytes().filter(|byte| *byte == b'"').count();
        if quotes % 2 == 1 {
            in_quotes = !in_quotes;
        }
        if !in_quotes {
            records += 1;
        }
    }
    slots
}

/// 宽度与首行不一致的行号，空行不计。
pub fn ragged_rows(table: &Table) -> Vec<usize> {
    let Some(first) = table.iter().find(|row| !row.is_empty()) else {
        return Vec::new();
    };
    let width = first.len();
    table
        .iter()
        .enumerate()
        .filter(|(_, row)| !row.is_empty() && row.len() != width)
        .map(|(index, _)| index)
        .collect()
}

pub fn write_csv(table: &Table) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    for row in table {
        writer
            .write_record(row)
            .map_err(|err| SyncError::fetch(format!("encode csv failed: {err}")))?;
    }
    writer
        .into_inner()
        .map_err(|err| SyncError::fetch(format!("flush csv failed: {err}")))
}
