//! 추출형 답변 생성기 - 오프라인 결정적 구현
//!
//! 쿼리와 겹치는 단어가 가장 많은 컨텍스트 문장을 골라 원문 그대로 제시하고,
//! 문장마다 출처 청크를 인용합니다.

use async_trait::async_trait;

use super::{citation_marker, content_terms, split_sentences, AnswerSynthesizer, SynthesizedAnswer};
use crate::error::{RagError, Result};
use crate::knowledge::RetrievedChunk;

/// 기본 최대 문장 수
const DEFAULT_MAX_SENTENCES: usize = 3;

/// 추출형 답변 생성기
#[derive(Debug, Clone)]
pub struct ExtractiveSynthesizer {
    max_sentences: usize,
}

impl Default for ExtractiveSynthesizer {
    fn default() -> Self {
        Self {
            max_sentences: DEFAULT_MAX_SENTENCES,
        }
    }
}

impl ExtractiveSynthesizer {
    pub fn with_max_sentences(mut self, max_sentences: usize) -> Self {
        self.max_sentences = max_sentences.max(1);
        self
    }
}

/// 후보 문장
struct Candidate<'a> {
    overlap: usize,
    rank: usize,
    position: usize,
    chunk_id: &'a str,
    sentence: &'a str,
}

#[async_trait]
impl AnswerSynthesizer for ExtractiveSynthesizer {
    async fn synthesize(&self, query: &str, context: &[RetrievedChunk]) -> Result<SynthesizedAnswer> {
        let Some(top) = context.first() else {
            return Err(RagError::GenerationError("no context to answer from".into()));
        };

        let query_terms = content_terms(query);

        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        for (rank, item) in context.iter().enumerate() {
            for (position, sentence) in split_sentences(&item.chunk.text).into_iter().enumerate() {
                let sentence_terms = content_terms(sentence);
                let overlap = query_terms.intersection(&sentence_terms).count();
                if overlap > 0 {
                    candidates.push(Candidate {
                        overlap,
                        rank,
                        position,
                        chunk_id: &item.chunk.id,
                        sentence,
                    });
                }
            }
        }

        // 겹침 내림차순 → 순위 → 문장 위치
        candidates.sort_by(|a, b| {
            b.overlap
                .cmp(&a.overlap)
                .then(a.rank.cmp(&b.rank))
                .then(a.position.cmp(&b.position))
        });
        candidates.truncate(self.max_sentences);

        if candidates.is_empty() {
            // 겹치는 문장이 없으면 최상위 청크의 첫 문장
            let sentence = split_sentences(&top.chunk.text)
                .into_iter()
                .next()
                .unwrap_or_else(|| top.chunk.text.trim());
            candidates.push(Candidate {
                overlap: 0,
                rank: 0,
                position: 0,
                chunk_id: &top.chunk.id,
                sentence,
            });
        }

        // 읽기 순서로 재정렬
        candidates.sort_by(|a, b| a.rank.cmp(&b.rank).then(a.position.cmp(&b.position)));

        let answer_text = candidates
            .iter()
            .map(|c| format!("{} {}", c.sentence, citation_marker(c.chunk_id)))
            .collect::<Vec<_>>()
            .join(" ");
        let citations = candidates.iter().map(|c| c.chunk_id.to_string()).collect();

        Ok(SynthesizedAnswer {
            answer_text,
            citations,
        })
    }

    fn name(&self) -> &str {
        "extractive"
    }
}

// ============================================================================
// Tests
// ============================================================================
