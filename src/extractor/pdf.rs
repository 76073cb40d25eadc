//! PDF 텍스트 추출 모듈
//!
//! pdf-extract 크레이트를 사용하여 메모리의 PDF에서 텍스트를 추출합니다.
//! 페이지별 구간을 메타데이터에 기록하여 청크의 출처(페이지)를 복원할 수 있습니다.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use regex::Regex;

use super::{join_sections, normalize_text, Extraction, ExtractionMetadata};
use crate::error::{RagError, Result};

/// PDF에서 텍스트 추출
///
/// 암호화/손상된 PDF는 `ExtractionError`로 반환합니다.
/// 파서 내부 패닉도 에러로 변환합니다.
pub fn extract(bytes: &[u8], source_name: &str) -> Result<Extraction> {
    let raw = catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
        .map_err(|_| RagError::extraction(source_name, "PDF parser crashed on malformed input"))?
        .map_err(|e| RagError::extraction(source_name, format!("unreadable PDF: {}", e)))?;

    if raw.trim().is_empty() {
        tracing::warn!(
            "No text extracted from PDF: {}. It might be a scanned document.",
            source_name
        );
        return Ok(Extraction {
            text: String::new(),
            metadata: ExtractionMetadata {
                page_count: Some(split_pdf_pages(&raw).1),
                ..Default::default()
            },
        });
    }

    let (pages, page_count) = split_pdf_pages(&raw);

    let parts = pages
        .into_iter()
        .map(|page| (format!("Page {}", page.number), normalize_text(&page.text)))
        .collect();
    let (text, sections) = join_sections(parts);

    Ok(Extraction {
        text,
        metadata: ExtractionMetadata {
            page_count: Some(page_count),
            sections,
            ..Default::default()
        },
    })
}

fn page_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[\s]*[-=]+[\s]*(?:Page[\s]*)?(\d+)[\s]*[-=]+[\s]*$").expect("valid regex")
    })
}

/// 번호가 붙은 PDF 페이지
#[derive(Debug, Clone, PartialEq)]
struct PdfPage {
    /// 1부터 시작하는 페이지 번호
    number: usize,
    text: String,
}

impl PdfPage {
    fn new(number: usize, text: &str) -> Self {
        Self {
            number,
            text: text.trim().to_string(),
        }
    }
}

/// PDF 텍스트를 페이지별로 분리 (빈 페이지 제외, 번호는 원래 위치 유지)
///
/// 반환값의 두 번째 요소는 빈 페이지를 포함한 전체 페이지 수입니다.
fn split_pdf_pages(text: &str) -> (Vec<PdfPage>, usize) {
    // 폼피드 문자 (\x0c)로 페이지 분리 시도
    let mut raw_pages: Vec<&str> = text.split('\x0c').collect();
    // 마지막 페이지 뒤의 구분자
    if raw_pages.len() > 1 && raw_pages.last().map_or(false, |s| s.trim().is_empty()) {
        raw_pages.pop();
    }

    if raw_pages.len() > 1 {
        let page_count = raw_pages.len();
        let pages = raw_pages
            .into_iter()
            .enumerate()
            .map(|(i, page)| PdfPage::new(i + 1, page))
            .filter(|page| !page.text.is_empty())
            .collect();
        return (pages, page_count);
    }

    // 페이지 구분자 패턴 (예: "--- Page 5 ---"), 표기된 번호 사용
    if let Some(pages) = split_by_markers(text) {
        let page_count = pages.iter().map(|p| p.number).max().unwrap_or(1);
        let pages = pages.into_iter().filter(|page| !page.text.is_empty()).collect();
        return (pages, page_count);
    }

    // 분리 실패 - 전체를 하나의 페이지로
    (vec![PdfPage::new(1, text)], 1)
}

/// 구분자 기준 분리 (구분자가 없으면 None)
///
/// 첫 구분자 앞의 내용은 그 구분자 번호의 앞 페이지로 봅니다.
fn split_by_markers(text: &str) -> Option<Vec<PdfPage>> {
    let markers: Vec<(std::ops::Range<usize>, usize)> = page_marker_re()
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let number = cap[1].parse::<usize>().ok()?;
            Some((whole.range(), number))
        })
        .collect();

    let (first_range, first_number) = markers.first()?.clone();

    let mut pages = vec![PdfPage::new(
        first_number.saturating_sub(1).max(1),
        &text[..first_range.start],
    )];
    for (i, (range, number)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(text.len(), |(next, _)| next.start);
        pages.push(PdfPage::new(*number, &text[range.end..end]));
    }

    Some(pages)
}

// ============================================================================
// Tests
// ============================================================================
