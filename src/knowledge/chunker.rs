//! Text Chunking Module
//!
//! 추출 텍스트를 임베딩 크기의 겹치는 청크로 분할합니다.
//!
//! - 토큰: 공백 구분 단어 (각 토큰은 뒤따르는 공백을 소유하므로 토큰 구간이 텍스트를 빈틈없이 덮음)
//! - 윈도우: 최대 `max_tokens` 토큰, 윈도우 마지막 1/4 안에서 문단 > 문장 경계 우선, 없으면 강제 분할
//! - 오버랩: 다음 청크는 이전 청크 끝에서 정확히 `overlap_tokens` 토큰 앞에서 시작

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::extractor::Document;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정 (토큰 단위)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// 청크 최대 토큰 수
    pub max_tokens: usize,
    /// 연속 청크 간 공유 토큰 수
    pub overlap_tokens: usize,
}

impl ChunkConfig {
    /// 검증된 설정 생성 (`overlap_tokens < max_tokens`)
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        if max_tokens == 0 {
            return Err(RagError::InvalidConfig(
                "chunk max_tokens must be greater than 0".into(),
            ));
        }
        if overlap_tokens >= max_tokens {
            return Err(RagError::InvalidConfig(format!(
                "chunk overlap_tokens ({}) must be less than max_tokens ({})",
                overlap_tokens, max_tokens
            )));
        }
        Ok(Self {
            max_tokens,
            overlap_tokens,
        })
    }

    pub fn from_rag_config(config: &RagConfig) -> Result<Self> {
        Self::new(config.chunk_max_tokens, config.chunk_overlap_tokens)
    }

    /// 청크 경계를 결정하는 설정 지문 (같으면 같은 텍스트에서 같은 청크)
    pub fn fingerprint(&self) -> String {
        format!("sliding-window-v1:{}:{}", self.max_tokens, self.overlap_tokens)
    }
}

// ============================================================================
// Chunk
// ============================================================================

/// 문서의 한 구간 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `<document_id>#<position_index>`
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub position_index: usize,
    /// 문서 추출 텍스트 내 바이트 범위
    pub char_span: Range<usize>,
    /// 이전 청크와 공유하는 앞부분 (바이트)
    pub overlap_with_predecessor: usize,
    /// 이전 청크와 공유하는 토큰 수
    pub overlap_tokens: usize,
    /// 청크가 시작하는 문서 구간 (PDF 페이지, 시트)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

pub fn chunk_id(document_id: &str, position_index: usize) -> String {
    format!("{}#{}", document_id, position_index)
}

// ============================================================================
// SlidingWindowChunker
// ============================================================================

/// 문장/문단 경계를 선호하는 슬라이딩 윈도우 청커
#[derive(Debug, Clone)]
pub struct SlidingWindowChunker {
    config: ChunkConfig,
}

impl SlidingWindowChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    /// 문서를 청크로 분할 (구간 레이블 포함)
    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        let mut chunks = self.chunk_text(&document.id, &document.extracted_text);
        if !document.metadata.sections.is_empty() {
            for chunk in &mut chunks {
                chunk.section = document
                    .metadata
                    .section_at(chunk.char_span.start)
                    .map(|s| s.label.clone());
            }
        }
        chunks
    }

    /// 텍스트를 청크로 분할
    pub fn chunk_text(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return vec![];
        }

        let bounds = token_bounds(text);
        let token_count = bounds.len() - 1;
        let ChunkConfig {
            max_tokens,
            overlap_tokens,
        } = self.config;

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut prev_end = 0;

        loop {
            let hard_end = (start + max_tokens).min(token_count);
            let end = if hard_end == token_count {
                token_count
            } else {
                self.preferred_break(text, &bounds, start, hard_end)
            };

            let position_index = chunks.len();
            let shared_tokens = if position_index == 0 { 0 } else { prev_end - start };
            let span = bounds[start]..bounds[end];

            chunks.push(Chunk {
                id: chunk_id(document_id, position_index),
                document_id: document_id.to_string(),
                text: text[span.clone()].to_string(),
                position_index,
                overlap_with_predecessor: if position_index == 0 {
                    0
                } else {
                    bounds[prev_end] - bounds[start]
                },
                overlap_tokens: shared_tokens,
                char_span: span,
                section: None,
            });

            if end == token_count {
                break;
            }

            prev_end = end;
            start = end - overlap_tokens;
        }

        chunks
    }

    /// 윈도우 끝 후보 중 문단 > 문장 경계 선택
    ///
    /// 후보 끝 `e`는 `start + max(overlap + 1, max - max/4) ..= hard_end` 범위이므로
    /// 다음 윈도우 시작(`e - overlap`)은 항상 앞으로 진행합니다.
    fn preferred_break(&self, text: &str, bounds: &[usize], start: usize, hard_end: usize) -> usize {
        let ChunkConfig {
            max_tokens,
            overlap_tokens,
        } = self.config;
        let min_len = (overlap_tokens + 1).max(max_tokens - max_tokens / 4);
        let min_end = (start + min_len).min(hard_end);

        let token = |e: usize| &text[bounds[e - 1]..bounds[e]];

        if let Some(e) = (min_end..=hard_end).rev().find(|&e| is_paragraph_end(token(e))) {
            return e;
        }
        if let Some(e) = (min_end..=hard_end).rev().find(|&e| is_sentence_end(token(e))) {
            return e;
        }
        hard_end
    }
}

/// 설정 검증 후 문서 청킹
pub fn chunk(document: &Document, max_tokens: usize, overlap_tokens: usize) -> Result<Vec<Chunk>> {
    let config = ChunkConfig::new(max_tokens, overlap_tokens)?;
    Ok(SlidingWindowChunker::new(config).chunk_document(document))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 토큰 경계 (`bounds[k]..bounds[k+1]`이 k번째 토큰, 마지막 값은 텍스트 길이)
fn token_bounds(text: &str) -> Vec<usize> {
    let mut bounds = Vec::new();
    let mut prev_whitespace = true;

    for (i, c) in text.char_indices() {
        let whitespace = c.is_whitespace();
        if !whitespace && prev_whitespace {
            bounds.push(i);
        }
        prev_whitespace = whitespace;
    }

    // 선행 공백은 첫 토큰 소유
    if let Some(first) = bounds.first_mut() {
        *first = 0;
    }
    bounds.push(text.len());
    bounds
}

fn is_paragraph_end(token: &str) -> bool {
    let word_len = token.trim_end().len();
    token[word_len..].matches('\n').count() >= 2
}

fn is_sentence_end(token: &str) -> bool {
    let word = token
        .trim_end()
        .trim_end_matches(|c| matches!(c, '"' | '\'' | ')' | ']' | '”' | '’'));
    word.ends_with(['.', '!', '?', '。', '…'])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max: usize, overlap: usize) -> SlidingWindowChunker {
        SlidingWindowChunker::new(ChunkConfig::new(max, overlap).unwrap())
    }

    /// 청크 텍스트에서 오버랩을 제거하고 이어붙이기
    fn reassemble(chunks: &[Chunk]) -> String {
        chunks
            .iter()
            .map(|c| &c.text[c.overlap_with_predecessor..])
            .collect()
    }

    #[test]
    fn test_overlap_must_be_smaller() {
        assert!(matches!(ChunkConfig::new(4, 4), Err(RagError::InvalidConfig(_))));
        assert!(matches!(ChunkConfig::new(0, 0), Err(RagError::InvalidConfig(_))));
        assert!(ChunkConfig::new(4, 3).is_ok());
    }

    #[test]
    fn test_empty_text() {
        assert!(chunker(4, 1).chunk_text("doc", "").is_empty());
        assert!(chunker(4, 1).chunk_text("doc", "  \n\t ").is_empty());
    }

    #[test]
    fn test_single_chunk() {
        let text = "A.\n\nB.\n\nC.";
        let chunks = chunker(64, 8).chunk_text("doc", text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].id, "doc#0");
        assert_eq!(chunks[0].char_span, 0..text.len());
    }

    #[test]
    fn test_hard_split_with_exact_overlap() {
        let text = "a b c d e f g h i j";
        let chunks = chunker(4, 1).chunk_text("doc", text);

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.trim_end()).collect();
        assert_eq!(texts, vec!["a b c d", "d e f g", "g h i j"]);

        for pair in chunks.windows(2) {
            assert_eq!(pair[1].overlap_tokens, 1);
            let shared = &pair[1].text[..pair[1].overlap_with_predecessor];
            assert!(pair[0].text.ends_with(shared));
        }
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        // 윈도우 8, 마지막 1/4(6..=8) 안의 문장 끝(6번째 토큰)에서 분할
        let text = "one two three four five six. seven eight nine ten eleven";
        let chunks = chunker(8, 2).chunk_text("doc", text);
        assert_eq!(chunks[0].text, "one two three four five six. ");
        assert!(chunks[1].text.starts_with("five six. seven"));
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_prefers_paragraph_over_sentence() {
        let text = "w1 w2 w3 w4 w5 end.\n\nw7 w8. w9 w10 w11 w12";
        let chunks = chunker(8, 1).chunk_text("doc", text);
        assert_eq!(chunks[0].text, "w1 w2 w3 w4 w5 end.\n\n");
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_coverage_on_long_text() {
        let paragraph = "Revenue grew in the north region. Churn fell after the onboarding redesign! \
                         Did support tickets drop as well? Yes, by a third.";
        let text = (0..12)
            .map(|i| format!("Section {} notes. {}", i, paragraph))
            .collect::<Vec<_>>()
            .join("\n\n");

        for (max, overlap) in [(16, 4), (10, 0), (7, 6), (50, 10)] {
            let chunks = chunker(max, overlap).chunk_text("doc", &text);
            assert_eq!(reassemble(&chunks), text, "max={} overlap={}", max, overlap);

            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.position_index, i);
                assert_eq!(&text[c.char_span.clone()], c.text);
                assert!(c.text.split_whitespace().count() <= max);
                if i > 0 {
                    assert_eq!(c.overlap_tokens, overlap);
                }
            }
        }
    }

    #[test]
    fn test_multibyte_text() {
        let text = "안녕하세요 세계. 문서를 청크로 나눕니다. 겹침을 확인합니다.";
        let chunks = chunker(3, 1).chunk_text("doc", text);
        assert!(chunks.len() > 1);
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_token_bounds_tile_text() {
        let text = "  lead\tspace  trail ";
        let bounds = token_bounds(text);
        assert_eq!(bounds, vec![0, 7, 14, text.len()]);
    }

    #[test]
    fn test_boundary_detection() {
        assert!(is_paragraph_end("end.\n\n"));
        assert!(is_paragraph_end("word \n \n"));
        assert!(!is_paragraph_end("end.\n"));
        assert!(is_sentence_end("done. "));
        assert!(is_sentence_end("really?\") "));
        assert!(!is_sentence_end("e.g"));
    }
}
