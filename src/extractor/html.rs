//! HTML 텍스트 추출
//!
//! 제목(<title> → <h1>)과 본문(article > main > body)을 추출합니다.
//! 스크립트/스타일 텍스트는 무시하고, 블록 요소 경계는 빈 줄로 보존합니다.

use scraper::{ElementRef, Html, Selector};

use super::{normalize_text, Extraction, ExtractionMetadata};
use crate::error::Result;

/// 본문 후보 셀렉터 (우선순위 순)
const CONTENT_SELECTORS: &[&str] = &["article", "main", "[role=main]", "#content", ".content", "body"];

/// 본문으로 인정할 최소 길이
const MIN_CONTENT_LEN: usize = 100;

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "svg"];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "li", "tr", "br", "h1", "h2", "h3", "h4", "h5", "h6",
    "pre", "blockquote", "table", "ul", "ol", "header", "footer",
];

/// HTML에서 텍스트 추출
pub fn extract(bytes: &[u8], _source_name: &str) -> Result<Extraction> {
    let raw = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&raw);

    let title = extract_title(&document);
    let text = normalize_text(&extract_content(&document));

    Ok(Extraction {
        text,
        metadata: ExtractionMetadata {
            title,
            ..Default::default()
        },
    })
}

/// 제목 추출
fn extract_title(document: &Html) -> Option<String> {
    ["title", "h1"].iter().find_map(|tag| {
        let selector = Selector::parse(tag).ok()?;
        let element = document.select(&selector).next()?;
        let title = collapse_spaces(&element.text().collect::<String>());
        (!title.is_empty()).then_some(title)
    })
}

/// 본문 추출
fn extract_content(document: &Html) -> String {
    let mut fallback = String::new();

    for selector_str in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(selector_str) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = element_text(element);
            if text.trim().len() >= MIN_CONTENT_LEN {
                return text;
            }
            if fallback.trim().is_empty() {
                fallback = text;
            }
        }
    }

    fallback
}

/// 요소의 가시 텍스트 (블록 경계 → 빈 줄)
fn element_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();

    for node in element.descendants() {
        if let Some(el) = node.value().as_element() {
            if BLOCK_TAGS.contains(&el.name()) && !out.is_empty() && !out.ends_with("\n\n") {
                out.push_str("\n\n");
            }
            continue;
        }

        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|e| SKIPPED_TAGS.contains(&e.name()))
                .unwrap_or(false)
        });
        if hidden {
            continue;
        }

        let piece = collapse_spaces(text);
        if piece.is_empty() {
            continue;
        }
        if !out.is_empty() && !out.ends_with('\n') {
            out.push(' ');
        }
        out.push_str(&piece);
    }

    out
}

fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_title() {
        let html = r#"
            <html>
                <head><title>Test Page Title</title></head>
                <body><h1>Main Heading</h1></body>
            </html>
        "#;
        let document = Html::parse_document(html);
        assert_eq!(extract_title(&document), Some("Test Page Title".to_string()));
    }

    #[test]
    fn test_extract_title_h1_fallback() {
        let html = r#"
            <html>
                <head><title></title></head>
                <body><h1>H1 Heading</h1></body>
            </html>
        "#;
        let document = Html::parse_document(html);
        assert_eq!(extract_title(&document), Some("H1 Heading".to_string()));
    }

    #[test]
    fn test_extract_skips_scripts_and_keeps_paragraphs() {
        let html = br#"
            <html>
                <head><title>Guide</title><style>body { color: red; }</style></head>
                <body>
                    <nav>Home</nav>
                    <article>
                        <p>The onboarding guide explains how new accounts are verified by the compliance team.</p>
                        <script>var tracking = true;</script>
                        <p>Escalations go to the duty manager within one business day.</p>
                    </article>
                </body>
            </html>
        "#;
        let extraction = extract(html, "guide.html").unwrap();

        assert_eq!(extraction.metadata.title.as_deref(), Some("Guide"));
        assert!(extraction.text.starts_with("The onboarding guide"));
        assert!(extraction.text.contains("team.\n\nEscalations"));
        assert!(!extraction.text.contains("tracking"));
        assert!(!extraction.text.contains("Home"));
    }

    #[test]
    fn test_short_page_falls_back_to_first_match() {
        let html = b"<html><body><p>Tiny page</p></body></html>";
        let extraction = extract(html, "tiny.html").unwrap();
        assert_eq!(extraction.text, "Tiny page");
    }
}
