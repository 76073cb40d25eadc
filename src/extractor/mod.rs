//! 문서 로더 모듈
//!
//! 다양한 파일 형식에서 텍스트와 구조 메타데이터를 추출합니다.
//! - PDF: pdf-extract (페이지별 구간 기록)
//! - Word (docx): zip 컨테이너의 word/document.xml
//! - Spreadsheet (xlsx): 시트 마커 + 시트별 구간 기록
//! - Delimited (csv/tsv): 행 단위 렌더링
//! - Plain/Markdown, HTML
//!
//! 형식은 닫힌 열거형 `DocumentFormat`이며, 형식마다 `extract_text` 하나를 구현합니다.

pub mod delimited;
pub mod html;
pub mod office;
pub mod pdf;

use std::io::Cursor;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// 구분자 텍스트에서 렌더링할 최대 데이터 행 수
pub const DEFAULT_MAX_ROWS: usize = 1000;

// ============================================================================
// Document Format
// ============================================================================

/// 지원하는 문서 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    WordDoc,
    Spreadsheet,
    DelimitedText,
    PlainText,
    Html,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::WordDoc => "word_doc",
            Self::Spreadsheet => "spreadsheet",
            Self::DelimitedText => "delimited_text",
            Self::PlainText => "plain_text",
            Self::Html => "html",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(Self::Pdf),
            "word_doc" => Some(Self::WordDoc),
            "spreadsheet" => Some(Self::Spreadsheet),
            "delimited_text" => Some(Self::DelimitedText),
            "plain_text" => Some(Self::PlainText),
            "html" => Some(Self::Html),
            _ => None,
        }
    }

    /// 확장자로 형식 결정
    ///
    /// - `Some(Ok(_))`: 지원 형식
    /// - `Some(Err(_))`: 알려진 미지원 형식 (레거시 바이너리 오피스 등)
    /// - `None`: 알 수 없는 확장자 (내용 스니핑 필요)
    pub fn from_extension(ext: &str) -> Option<Result<Self>> {
        let ext = ext.to_lowercase();
        let format = match ext.as_str() {
            "pdf" => Self::Pdf,
            "docx" => Self::WordDoc,
            "xlsx" | "xlsm" => Self::Spreadsheet,
            "csv" | "tsv" => Self::DelimitedText,
            "txt" | "text" | "md" | "markdown" | "rst" | "log" => Self::PlainText,
            "html" | "htm" | "xhtml" => Self::Html,
            "doc" | "xls" | "ppt" | "pptx" | "odt" | "ods" | "rtf" => {
                return Some(Err(RagError::UnsupportedFormat(format!(
                    ".{} documents are not supported (convert to docx/xlsx/pdf)",
                    ext
                ))))
            }
            _ => return None,
        };
        Some(Ok(format))
    }

    /// 파일 이름과 내용으로 형식 결정 (확장자 우선, 실패 시 스니핑)
    pub fn detect(filename: &str, bytes: &[u8]) -> Result<Self> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        if let Some(result) = Self::from_extension(ext) {
            return result;
        }

        Self::sniff(bytes).ok_or_else(|| {
            RagError::UnsupportedFormat(format!("{}: unrecognized content", filename))
        })
    }

    /// 내용 기반 형식 추정
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF-") {
            return Some(Self::Pdf);
        }

        if bytes.starts_with(b"PK\x03\x04") {
            let archive = zip::ZipArchive::new(Cursor::new(bytes)).ok()?;
            let names: Vec<&str> = archive.file_names().collect();
            if names.contains(&"word/document.xml") {
                return Some(Self::WordDoc);
            }
            if names.contains(&"xl/workbook.xml") {
                return Some(Self::Spreadsheet);
            }
            return None;
        }

        let text = std::str::from_utf8(bytes).ok()?;
        if text.contains('\0') {
            return None;
        }

        let head: String = text.trim_start().chars().take(512).collect::<String>().to_lowercase();
        if head.starts_with("<!doctype html") || head.contains("<html") {
            return Some(Self::Html);
        }

        Some(Self::PlainText)
    }

    /// 형식별 텍스트 추출
    pub fn extract_text(&self, bytes: &[u8], source_name: &str, max_rows: usize) -> Result<Extraction> {
        match self {
            Self::Pdf => pdf::extract(bytes, source_name),
            Self::WordDoc => office::extract_docx(bytes, source_name),
            Self::Spreadsheet => office::extract_xlsx(bytes, source_name),
            Self::DelimitedText => delimited::extract(bytes, source_name, max_rows),
            Self::PlainText => extract_plain(bytes, source_name),
            Self::Html => html::extract(bytes, source_name),
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Extracted Content
// ============================================================================

/// 문서 내 구간 (PDF 페이지, 스프레드시트 시트)
///
/// `start..end`는 추출 텍스트의 바이트 범위입니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSpan {
    pub label: String,
    pub start: usize,
    pub end: usize,
}

/// 추출 메타데이터
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    /// 원본 바이트 크기
    pub byte_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sheet_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paragraph_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_count: Option<usize>,
    /// 행 수 제한으로 일부만 렌더링되었는지
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<SectionSpan>,
    /// 저장 시 사용한 청크 설정 지문
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking: Option<String>,
}

impl ExtractionMetadata {
    /// 오프셋이 속한 구간
    pub fn section_at(&self, offset: usize) -> Option<&SectionSpan> {
        self.sections
            .iter()
            .find(|s| s.start <= offset && offset < s.end)
    }
}

/// 형식별 추출 결과 (정규화된 텍스트 + 메타데이터)
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub metadata: ExtractionMetadata,
}

// ============================================================================
// Document
// ============================================================================

/// 추출된 문서 (생성 후 불변, 같은 소스 재업로드 시 새 버전으로 대체)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub raw_format: DocumentFormat,
    pub extracted_text: String,
    pub metadata: ExtractionMetadata,
    /// 추출 텍스트의 SHA-256
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// 소스 URI로 문서 ID 생성 (같은 소스 → 같은 ID)
pub fn document_id_for(source_uri: &str) -> String {
    let digest = Sha256::digest(source_uri.as_bytes());
    hex_prefix(&digest, 16)
}

/// 텍스트 해시
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex_prefix(&digest, 64)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out.truncate(len);
    out
}

// ============================================================================
// Document Loader
// ============================================================================

/// 문서 로더
///
/// 바이트 + 파일 이름을 받아 `Document`를 만듭니다. 영속화는 호출자 책임입니다.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    max_rows: usize,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

impl DocumentLoader {
    pub fn new(max_rows: usize) -> Self {
        Self { max_rows }
    }

    /// 파일 이름을 소스 URI로 사용하여 로드
    pub fn load(&self, bytes: &[u8], filename: &str) -> Result<Document> {
        self.load_with_source(bytes, filename, filename)
    }

    /// 소스 URI를 지정하여 로드
    pub fn load_with_source(&self, bytes: &[u8], filename: &str, source_uri: &str) -> Result<Document> {
        if bytes.is_empty() {
            return Err(RagError::extraction(filename, "file is empty"));
        }

        let format = DocumentFormat::detect(filename, bytes)?;
        let mut extraction = format.extract_text(bytes, filename, self.max_rows)?;
        extraction.metadata.byte_size = bytes.len();

        if extraction.text.is_empty() {
            tracing::warn!("No text extracted from {} ({})", filename, format);
        }

        let hash = content_hash(&extraction.text);
        tracing::debug!(
            "Loaded {} as {} ({} chars)",
            filename,
            format,
            extraction.text.len()
        );

        Ok(Document {
            id: document_id_for(source_uri),
            source_uri: source_uri.to_string(),
            raw_format: format,
            extracted_text: extraction.text,
            metadata: extraction.metadata,
            content_hash: hash,
            created_at: Utc::now(),
        })
    }
}

// ============================================================================
// Plain Text
// ============================================================================

/// 일반 텍스트 / Markdown 추출
fn extract_plain(bytes: &[u8], source_name: &str) -> Result<Extraction> {
    if bytes.contains(&0) {
        return Err(RagError::extraction(source_name, "binary content in text file"));
    }

    let raw = String::from_utf8_lossy(bytes);
    let text = normalize_text(&raw);

    let title = text
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    Ok(Extraction {
        text,
        metadata: ExtractionMetadata {
            title,
            ..Default::default()
        },
    })
}

// ============================================================================
// Helper Functions
// ============================================================================

fn trailing_space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+\n").expect("valid regex"))
}

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

fn space_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]{2,}").expect("valid regex"))
}

/// 텍스트 정규화
///
/// 줄바꿈 통일, 줄 끝 공백 제거, 3줄 이상 빈 줄 → 1줄, 연속 공백 → 1칸, 양끝 trim
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = trailing_space_re().replace_all(&text, "\n");
    let text = blank_lines_re().replace_all(&text, "\n\n");
    let text = space_run_re().replace_all(&text, " ");
    text.trim().to_string()
}

/// 구간 목록으로 텍스트 조립 (빈 줄로 연결, 구간 바이트 범위 기록)
pub(crate) fn join_sections(parts: Vec<(String, String)>) -> (String, Vec<SectionSpan>) {
    let mut text = String::new();
    let mut sections = Vec::with_capacity(parts.len());

    for (label, body) in parts {
        if body.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        let start = text.len();
        text.push_str(&body);
        sections.push(SectionSpan {
            label,
            start,
            end: text.len(),
        });
    }

    (text, sections)
}

/// XML 엔티티 복원 (미리 정의된 5개 + 10진/16진 문자 참조)
///
/// 한 번에 치환하므로 `&amp;lt;`는 `&lt;`로 남습니다. 잘못된 문자 참조는 그대로 둡니다.
pub(crate) fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    entity_re()
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(|dec| dec.parse::<u32>()))
                    .and_then(|code| code.ok())
                    .and_then(char::from_u32),
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&(lt|gt|quot|apos|amp|#[xX][0-9A-Fa-f]+|#[0-9]+);").expect("valid regex"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_metadata_default() {
        let meta = ExtractionMetadata::default();
        assert!(meta.page_count.is_none());
        assert!(meta.sheet_names.is_empty());
        assert!(meta.section_at(0).is_none());
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::detect("a.PDF", b"x").unwrap(), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::detect("notes.md", b"x").unwrap(), DocumentFormat::PlainText);
        assert_eq!(DocumentFormat::detect("t.tsv", b"x").unwrap(), DocumentFormat::DelimitedText);
        assert_eq!(DocumentFormat::detect("r.docx", b"x").unwrap(), DocumentFormat::WordDoc);
        assert!(matches!(
            DocumentFormat::detect("legacy.doc", b"x"),
            Err(RagError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_format_sniffing() {
        assert_eq!(DocumentFormat::detect("upload", b"%PDF-1.7 ...").unwrap(), DocumentFormat::Pdf);
        assert_eq!(
            DocumentFormat::detect("page", b"  <!DOCTYPE html><html></html>").unwrap(),
            DocumentFormat::Html
        );
        assert_eq!(DocumentFormat::detect("README", b"hello").unwrap(), DocumentFormat::PlainText);
        assert!(matches!(
            DocumentFormat::detect("blob.bin", &[0u8, 159, 146, 150]),
            Err(RagError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_zero_byte_file_is_extraction_error() {
        let loader = DocumentLoader::default();
        let err = loader.load(b"", "empty.txt").unwrap_err();
        assert!(matches!(err, RagError::ExtractionError { .. }));
    }

    #[test]
    fn test_load_plain_text() {
        let loader = DocumentLoader::default();
        let doc = loader
            .load(b"# Handbook\r\n\r\n\r\n\r\nFirst   line.\t\nSecond line.", "handbook.md")
            .unwrap();
        assert_eq!(doc.raw_format, DocumentFormat::PlainText);
        assert_eq!(doc.extracted_text, "# Handbook\n\nFirst line.\nSecond line.");
        assert_eq!(doc.metadata.title.as_deref(), Some("Handbook"));
        assert_eq!(doc.metadata.byte_size, 45);
        assert_eq!(doc.id, document_id_for("handbook.md"));
        assert_eq!(doc.content_hash.len(), 64);
    }

    #[test]
    fn test_binary_text_rejected() {
        let loader = DocumentLoader::default();
        let err = loader.load(b"abc\0def", "weird.txt").unwrap_err();
        assert!(matches!(err, RagError::ExtractionError { .. }));
    }

    #[test]
    fn test_document_id_stable_per_source() {
        assert_eq!(document_id_for("file:///a.txt"), document_id_for("file:///a.txt"));
        assert_ne!(document_id_for("file:///a.txt"), document_id_for("file:///b.txt"));
        assert_eq!(document_id_for("x").len(), 16);
    }

    #[test]
    fn test_join_sections_records_spans() {
        let (text, spans) = join_sections(vec![
            ("Page 1".into(), "alpha".into()),
            ("Page 2".into(), String::new()),
            ("Page 3".into(), "gamma".into()),
        ]);
        assert_eq!(text, "alpha\n\ngamma");
        assert_eq!(spans.len(), 2);
        assert_eq!(&text[spans[1].start..spans[1].end], "gamma");
        assert_eq!(spans[1].label, "Page 3");
    }

    #[test]
    fn test_unescape_xml() {
        assert_eq!(unescape_xml("a &amp; b &lt;c&gt;"), "a & b <c>");
        assert_eq!(unescape_xml("&amp;lt;"), "&lt;");
        assert_eq!(unescape_xml("caf&#233; &#x2014; &#X41;&#10;&#9;x"), "café \u{2014} A\n\tx");
        assert_eq!(unescape_xml("&#8364;100 &#x1F600;"), "\u{20ac}100 \u{1F600}");
        assert_eq!(unescape_xml("bad &#xD800; &#99999999; &nbsp;"), "bad &#xD800; &#99999999; &nbsp;");
    }
}
