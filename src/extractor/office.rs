//! Office Open XML 추출 (docx, xlsx)
//!
//! 두 형식 모두 zip 컨테이너 안의 XML입니다.
//! 암호화된 문서는 zip이 아닌 OLE 컨테이너이므로 열기 단계에서 `ExtractionError`가 됩니다.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::OnceLock;

use regex::Regex;

use super::{join_sections, normalize_text, unescape_xml, Extraction, ExtractionMetadata};
use crate::error::{RagError, Result};

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

// ============================================================================
// Word (docx)
// ============================================================================

/// docx에서 텍스트 추출 (문단은 빈 줄로 구분)
pub fn extract_docx(bytes: &[u8], source_name: &str) -> Result<Extraction> {
    let mut archive = open_archive(bytes, source_name)?;
    let xml = read_entry(&mut archive, "word/document.xml", source_name)?
        .ok_or_else(|| RagError::extraction(source_name, "missing word/document.xml"))?;

    let paragraphs: Vec<String> = paragraph_re()
        .captures_iter(&xml)
        .map(|cap| paragraph_text(&cap[0]))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    let paragraph_count = paragraphs.len();
    let text = normalize_text(&paragraphs.join("\n\n"));

    Ok(Extraction {
        text,
        metadata: ExtractionMetadata {
            paragraph_count: Some(paragraph_count),
            ..Default::default()
        },
    })
}

/// 문단 XML에서 텍스트 런 추출 (탭/줄바꿈 요소 포함)
fn paragraph_text(xml: &str) -> String {
    let mut out = String::new();
    for cap in run_re().captures_iter(xml) {
        if let Some(t) = cap.get(1) {
            out.push_str(&unescape_xml(t.as_str()));
        } else if cap.get(0).map(|m| m.as_str().starts_with("<w:tab")).unwrap_or(false) {
            out.push('\t');
        } else {
            out.push('\n');
        }
    }
    out
}

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<w:p[ >].*?</w:p>").expect("valid regex"))
}

fn run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>|<w:tab/>|<w:br/>").expect("valid regex")
    })
}

// ============================================================================
// Spreadsheet (xlsx)
// ============================================================================

/// xlsx에서 텍스트 추출
///
/// 시트마다 `## Sheet: <이름>` 마커와 `a | b | c` 형식의 행을 출력하고,
/// 시트별 바이트 구간을 메타데이터에 기록합니다.
pub fn extract_xlsx(bytes: &[u8], source_name: &str) -> Result<Extraction> {
    let mut archive = open_archive(bytes, source_name)?;

    let workbook = read_entry(&mut archive, "xl/workbook.xml", source_name)?
        .ok_or_else(|| RagError::extraction(source_name, "missing xl/workbook.xml"))?;
    let rels = read_entry(&mut archive, "xl/_rels/workbook.xml.rels", source_name)?
        .map(|xml| parse_relationships(&xml))
        .unwrap_or_default();
    let shared = read_entry(&mut archive, "xl/sharedStrings.xml", source_name)?
        .map(|xml| parse_shared_strings(&xml))
        .unwrap_or_default();

    let sheets = parse_sheets(&workbook);
    if sheets.is_empty() {
        return Err(RagError::extraction(source_name, "workbook has no sheets"));
    }

    let mut parts = Vec::with_capacity(sheets.len());
    let mut sheet_names = Vec::with_capacity(sheets.len());
    let mut row_count = 0;

    for (index, (name, rel_id)) in sheets.into_iter().enumerate() {
        let path = rel_id
            .and_then(|id| rels.get(&id).cloned())
            .map(|target| resolve_target(&target))
            .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", index + 1));

        let rows = match read_entry(&mut archive, &path, source_name)? {
            Some(xml) => parse_rows(&xml, &shared),
            None => {
                tracing::warn!("Sheet '{}' not found at {} in {}", name, path, source_name);
                Vec::new()
            }
        };
        row_count += rows.len();

        let mut body = format!("## Sheet: {}", name);
        for row in rows {
            body.push('\n');
            body.push_str(&row.join(" | "));
        }

        parts.push((name.clone(), normalize_text(&body)));
        sheet_names.push(name);
    }

    let (text, sections) = join_sections(parts);

    Ok(Extraction {
        text,
        metadata: ExtractionMetadata {
            sheet_names,
            row_count: Some(row_count),
            sections,
            ..Default::default()
        },
    })
}

/// workbook.xml에서 (시트 이름, 관계 ID) 목록
fn parse_sheets(xml: &str) -> Vec<(String, Option<String>)> {
    sheet_tag_re()
        .find_iter(xml)
        .filter_map(|m| {
            let tag = m.as_str();
            let name = attribute(tag, "name")?;
            Some((unescape_xml(&name), attribute(tag, "r:id")))
        })
        .collect()
}

/// workbook.xml.rels에서 관계 ID → 대상 경로
fn parse_relationships(xml: &str) -> HashMap<String, String> {
    relationship_tag_re()
        .find_iter(xml)
        .filter_map(|m| {
            let tag = m.as_str();
            Some((attribute(tag, "Id")?, attribute(tag, "Target")?))
        })
        .collect()
}

fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

/// sharedStrings.xml의 문자열 테이블
fn parse_shared_strings(xml: &str) -> Vec<String> {
    shared_item_re()
        .captures_iter(xml)
        .map(|cap| {
            text_node_re()
                .captures_iter(&cap[1])
                .map(|t| unescape_xml(&t[1]))
                .collect::<String>()
        })
        .collect()
}

/// 시트 XML의 행 목록 (비어 있지 않은 셀만)
fn parse_rows(xml: &str, shared: &[String]) -> Vec<Vec<String>> {
    row_re()
        .captures_iter(xml)
        .map(|row| {
            cell_re()
                .captures_iter(&row[1])
                .filter_map(|cell| {
                    let attrs = cell.get(1).map(|m| m.as_str()).unwrap_or("");
                    let inner = cell.get(2).map(|m| m.as_str()).unwrap_or("");
                    cell_value(attrs, inner, shared)
                })
                .collect::<Vec<String>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect()
}

fn cell_value(attrs: &str, inner: &str, shared: &[String]) -> Option<String> {
    let cell_type = attribute(attrs, "t");
    let value = match cell_type.as_deref() {
        Some("s") => {
            let index: usize = value_re().captures(inner)?[1].trim().parse().ok()?;
            shared.get(index)?.clone()
        }
        Some("inlineStr") => text_node_re()
            .captures_iter(inner)
            .map(|t| unescape_xml(&t[1]))
            .collect(),
        _ => unescape_xml(&value_re().captures(inner)?[1]),
    };

    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// 태그 문자열에서 속성 값 추출
fn attribute(tag: &str, name: &str) -> Option<String> {
    attribute_re()
        .captures_iter(tag)
        .find(|cap| &cap[1] == name)
        .map(|cap| cap[2].to_string())
}

fn attribute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:^|\s)([A-Za-z_][\w:.-]*)="([^"]*)""#).expect("valid regex"))
}

fn sheet_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<sheet\s[^>]*>").expect("valid regex"))
}

fn relationship_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<Relationship\s[^>]*>").expect("valid regex"))
}

fn shared_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<si>(.*?)</si>").expect("valid regex"))
}

fn text_node_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>").expect("valid regex"))
}

fn row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<row(?:\s[^>]*)?>(.*?)</row>").expect("valid regex"))
}

fn cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<c(\s[^>]*?)?(?:/>|>(.*?)</c>)").expect("valid regex")
    })
}

fn value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<v>(.*?)</v>").expect("valid regex"))
}

// ============================================================================
// Zip Helpers
// ============================================================================

fn open_archive<'a>(bytes: &'a [u8], source_name: &str) -> Result<Archive<'a>> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
        RagError::extraction(
            source_name,
            format!("not a readable Office container (encrypted or corrupt?): {}", e),
        )
    })
}

/// zip 엔트리를 문자열로 읽기 (없으면 None)
fn read_entry(archive: &mut Archive<'_>, name: &str, source_name: &str) -> Result<Option<String>> {
    let mut file = match archive.by_name(name) {
        Ok(f) => f,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(RagError::extraction(source_name, format!("{}: {}", name, e))),
    };

    let mut xml = String::new();
    file.read_to_string(&mut xml)
        .map_err(|e| RagError::extraction(source_name, format!("{}: {}", name, e)))?;
    Ok(Some(xml))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    /// 테스트용 zip 컨테이너 생성
    pub(crate) fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (name, content) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    pub(crate) fn sample_docx() -> Vec<u8> {
        build_zip(&[(
            "word/document.xml",
            r#"<?xml version="1.0"?><w:document><w:body>
<w:p><w:r><w:t>Quarterly onboarding report</w:t></w:r></w:p>
<w:p><w:pPr/></w:p>
<w:p><w:r><w:t xml:space="preserve">Leads &amp; </w:t></w:r><w:r><w:t>conversions grew.</w:t></w:r></w:p>
</w:body></w:document>"#,
        )])
    }

    pub(crate) fn sample_xlsx() -> Vec<u8> {
        build_zip(&[
            (
                "xl/workbook.xml",
                r#"<workbook><sheets><sheet name="Q3" sheetId="1" r:id="rId1"/><sheet name="Q4 &amp; Plan" sheetId="2" r:id="rId2"/></sheets></workbook>"#,
            ),
            (
                "xl/_rels/workbook.xml.rels",
                r#"<Relationships><Relationship Id="rId1" Type="ws" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="ws" Target="worksheets/sheet2.xml"/></Relationships>"#,
            ),
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>Region</t></si><si><t>Leads</t></si><si><r><t>North</t></r></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row><row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>42</v></c></row></sheetData></worksheet>"#,
            ),
            (
                "xl/worksheets/sheet2.xml",
                r#"<worksheet><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Target</t></is></c><c r="B1"/><c r="C1"><v>50</v></c></row></sheetData></worksheet>"#,
            ),
        ])
    }

    #[test]
    fn test_extract_docx() {
        let extraction = extract_docx(&sample_docx(), "report.docx").unwrap();
        assert_eq!(
            extraction.text,
            "Quarterly onboarding report\n\nLeads & conversions grew."
        );
        assert_eq!(extraction.metadata.paragraph_count, Some(2));
    }

    #[test]
    fn test_extract_xlsx_records_sheets() {
        let extraction = extract_xlsx(&sample_xlsx(), "funnel.xlsx").unwrap();
        let meta = &extraction.metadata;

        assert_eq!(meta.sheet_names, vec!["Q3".to_string(), "Q4 & Plan".to_string()]);
        assert_eq!(meta.row_count, Some(3));
        assert_eq!(meta.sections.len(), 2);

        let first = &extraction.text[meta.sections[0].start..meta.sections[0].end];
        assert_eq!(first, "## Sheet: Q3\nRegion | Leads\nNorth | 42");

        let second = &extraction.text[meta.sections[1].start..meta.sections[1].end];
        assert_eq!(second, "## Sheet: Q4 & Plan\nTarget | 50");
    }

    #[test]
    fn test_not_a_zip_is_extraction_error() {
        let err = extract_docx(b"\xD0\xCF\x11\xE0 encrypted ole", "secret.docx").unwrap_err();
        assert!(matches!(err, RagError::ExtractionError { .. }));
        let err = extract_xlsx(b"garbage", "broken.xlsx").unwrap_err();
        assert!(matches!(err, RagError::ExtractionError { .. }));
    }

    #[test]
    fn test_attribute() {
        let tag = r#"<sheet name="Data" sheetId="3" r:id="rId7"/>"#;
        assert_eq!(attribute(tag, "name").as_deref(), Some("Data"));
        assert_eq!(attribute(tag, "r:id").as_deref(), Some("rId7"));
        assert_eq!(attribute(tag, "id"), None);
        assert_eq!(attribute(tag, "Id"), None);

        let rel = r#"<Relationship Id="rId7" Type="worksheet" Target="worksheets/sheet3.xml"/>"#;
        assert_eq!(attribute(rel, "Id").as_deref(), Some("rId7"));
        assert_eq!(attribute(rel, "Target").as_deref(), Some("worksheets/sheet3.xml"));
        assert_eq!(attribute(r#" r="B2" t="s""#, "t").as_deref(), Some("s"));
    }
}
