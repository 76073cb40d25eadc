//! 구분자 텍스트 추출 (csv, tsv)
//!
//! 헤더 행 + 데이터 행을 `Row N: col=value; col=value` 형식으로 렌더링합니다.
//! UTF-8 디코딩에 실패하면 Latin-1로 다시 읽습니다.

use super::{normalize_text, Extraction, ExtractionMetadata};
use crate::error::{RagError, Result};

/// 구분자 텍스트에서 텍스트 추출
pub fn extract(bytes: &[u8], source_name: &str, max_rows: usize) -> Result<Extraction> {
    let raw = decode(bytes);
    let delimiter = detect_delimiter(&raw);
    let records = parse_records(&raw, delimiter)
        .map_err(|reason| RagError::extraction(source_name, reason))?;

    let mut records = records.into_iter().filter(|r| r.iter().any(|c| !c.trim().is_empty()));
    let Some(header) = records.next() else {
        return Ok(Extraction {
            text: String::new(),
            metadata: ExtractionMetadata {
                row_count: Some(0),
                column_count: Some(0),
                ..Default::default()
            },
        });
    };

    let header: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = h.trim();
            if h.is_empty() {
                format!("column{}", i + 1)
            } else {
                h.to_string()
            }
        })
        .collect();

    let rows: Vec<Vec<String>> = records.collect();
    let row_count = rows.len();
    let truncated = row_count > max_rows;
    if truncated {
        tracing::warn!(
            "{}: rendering first {} of {} rows",
            source_name,
            max_rows,
            row_count
        );
    }

    let mut lines = Vec::with_capacity(row_count.min(max_rows) + 1);
    lines.push(format!("Columns: {}", header.join(", ")));
    for (i, row) in rows.iter().take(max_rows).enumerate() {
        lines.push(render_row(i + 1, &header, row));
    }

    Ok(Extraction {
        text: normalize_text(&lines.join("\n")),
        metadata: ExtractionMetadata {
            row_count: Some(row_count),
            column_count: Some(header.len()),
            truncated,
            ..Default::default()
        },
    })
}

/// 한 행 렌더링 (빈 값 생략)
fn render_row(number: usize, header: &[String], row: &[String]) -> String {
    let fields: Vec<String> = row
        .iter()
        .enumerate()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(i, value)| {
            let column = header
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("column{}", i + 1));
            format!("{}={}", column, value.trim().replace('\n', " "))
        })
        .collect();

    format!("Row {}: {}", number, fields.join("; "))
}

/// 바이트 디코딩 (UTF-8 → Latin-1 폴백)
fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// 첫 줄 기준 구분자 결정 (탭 vs 쉼표)
fn detect_delimiter(raw: &str) -> char {
    let first = raw.lines().next().unwrap_or("");
    if first.matches('\t').count() > first.matches(',').count() {
        '\t'
    } else {
        ','
    }
}

/// 따옴표 인식 레코드 파싱
fn parse_records(raw: &str, delimiter: char) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(format!("unterminated quoted field in record {}", records.len() + 1));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

// ============================================================================
// Tests
// ============================================================================
