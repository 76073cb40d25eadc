//! 답변 검증 - 문장 단위 주장을 인용 청크와 대조
//!
//! 답변을 문장(주장)으로 나누고, 각 주장의 내용어가 인용한 청크에 얼마나 나오는지로
//! 뒷받침 정도를 판정합니다. 판정 결과로 답변 신뢰도와 한계 목록을 만듭니다.
//!
//! 인용 표기가 문장 부호 뒤에 오는 경우(`... days. [source:a#0]`)는 직전 문장의 인용으로 봅니다.

use serde::Serialize;

use super::{citation_re, content_terms, parse_citations, split_sentences, strip_citations};
use crate::knowledge::RetrievedChunk;

/// 뒷받침 판정 기본 하한
const SUPPORTED_THRESHOLD: f32 = 0.75;
const PARTIAL_THRESHOLD: f32 = 0.4;

// ============================================================================
// Types
// ============================================================================

/// 주장의 뒷받침 정도
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupportLevel {
    Supported,
    PartiallySupported,
    NotSupported,
}

impl SupportLevel {
    /// 신뢰도 계산 가중치
    pub fn weight(&self) -> f32 {
        match self {
            Self::Supported => 1.0,
            Self::PartiallySupported => 0.6,
            Self::NotSupported => 0.1,
        }
    }
}

/// 주장 하나의 검증 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimCheck {
    /// 인용 표기를 뺀 문장
    pub claim: String,
    /// 이 문장이 인용한 chunk_id (등장 순서)
    pub citations: Vec<String>,
    /// 주장 내용어 중 인용 청크에 나오는 비율 (인용 청크 중 최댓값)
    pub support: f32,
    pub level: SupportLevel,
}

/// 답변 전체 검증 결과
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Verification {
    pub claims: Vec<ClaimCheck>,
    /// 주장별 `support × 가중치`의 평균 (주장이 없으면 0)
    pub confidence: f32,
    pub limitations: Vec<String>,
}

// ============================================================================
// ClaimVerifier
// ============================================================================

/// 인용 청크 대조 검증기
#[derive(Debug, Clone)]
pub struct ClaimVerifier {
    supported_threshold: f32,
    partial_threshold: f32,
}

impl Default for ClaimVerifier {
    fn default() -> Self {
        Self {
            supported_threshold: SUPPORTED_THRESHOLD,
            partial_threshold: PARTIAL_THRESHOLD,
        }
    }
}

impl ClaimVerifier {
    /// 답변 검증
    pub fn verify(&self, answer: &str, context: &[RetrievedChunk]) -> Verification {
        let claims: Vec<ClaimCheck> = extract_claims(answer)
            .into_iter()
            .map(|(claim, citations)| self.check(claim, citations, context))
            .collect();

        let confidence = if claims.is_empty() {
            0.0
        } else {
            claims.iter().map(|c| c.support * c.level.weight()).sum::<f32>() / claims.len() as f32
        };

        let limitations = claims
            .iter()
            .filter_map(|check| match check.level {
                SupportLevel::Supported => None,
                SupportLevel::PartiallySupported => Some(format!(
                    "Only partly supported by the cited passages: \"{}\"",
                    check.claim
                )),
                SupportLevel::NotSupported if check.citations.is_empty() => {
                    Some(format!("No source cited for: \"{}\"", check.claim))
                }
                SupportLevel::NotSupported => Some(format!(
                    "Not supported by the cited passages: \"{}\"",
                    check.claim
                )),
            })
            .collect();

        Verification {
            claims,
            confidence,
            limitations,
        }
    }

    fn check(&self, claim: String, citations: Vec<String>, context: &[RetrievedChunk]) -> ClaimCheck {
        let claim_terms = content_terms(&claim);

        let support = citations
            .iter()
            .filter_map(|id| context.iter().find(|item| &item.chunk.id == id))
            .map(|item| {
                let chunk_terms = content_terms(&item.chunk.text);
                claim_terms.intersection(&chunk_terms).count() as f32 / claim_terms.len().max(1) as f32
            })
            .fold(0.0_f32, f32::max);

        let level = if support >= self.supported_threshold {
            SupportLevel::Supported
        } else if support >= self.partial_threshold {
            SupportLevel::PartiallySupported
        } else {
            SupportLevel::NotSupported
        };

        ClaimCheck {
            claim,
            citations,
            support,
            level,
        }
    }
}

/// 답변을 (주장, 인용 목록)으로 분리
///
/// 제목/도입 문장(`:`로 끝남)과 숫자뿐인 조각(목록 번호)은 주장으로 보지 않습니다.
fn extract_claims(answer: &str) -> Vec<(String, Vec<String>)> {
    let mut claims: Vec<(String, Vec<String>)> = Vec::new();
    let mut carried: Vec<String> = Vec::new();

    for sentence in split_sentences(answer) {
        // 문장 앞쪽 인용 → 직전 주장 소속
        let mut rest = sentence;
        loop {
            let trimmed = rest.trim_start();
            let Some(m) = citation_re().find(trimmed).filter(|m| m.start() == 0) else {
                rest = trimmed;
                break;
            };
            let ids = parse_citations(m.as_str());
            match claims.last_mut() {
                Some((_, citations)) => push_unique(citations, ids),
                None => push_unique(&mut carried, ids),
            }
            rest = &trimmed[m.end()..];
        }

        let text = strip_citations(rest, |_| false).trim().to_string();
        let ids = parse_citations(rest);

        if !is_claim(&text) {
            if let Some((_, citations)) = claims.last_mut() {
                push_unique(citations, ids);
            } else {
                push_unique(&mut carried, ids);
            }
            continue;
        }

        let mut citations = std::mem::take(&mut carried);
        push_unique(&mut citations, ids);
        claims.push((text, citations));
    }

    claims
}

fn is_claim(text: &str) -> bool {
    !text.ends_with(':')
        && content_terms(text)
            .iter()
            .any(|t| t.chars().any(char::is_alphabetic))
}

fn push_unique(target: &mut Vec<String>, ids: impl IntoIterator<Item = String>) {
    for id in ids {
        if !target.contains(&id) {
            target.push(id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::tests::retrieved;

    fn levels(verification: &Verification) -> Vec<SupportLevel> {
        verification.claims.iter().map(|c| c.level).collect()
    }

    #[test]
    fn test_trailing_markers_belong_to_previous_sentence() {
        let context = vec![
            retrieved("a#0", "Refunds require a receipt.", 0.8),
            retrieved("b#3", "Refunds are paid to the original card.", 0.6),
        ];
        let answer = "Refunds require a receipt. [source:a#0] Refunds are paid to the original card. [source:b#3]";

        let verification = ClaimVerifier::default().verify(answer, &context);
        let claims: Vec<(&str, Vec<&str>)> = verification
            .claims
            .iter()
            .map(|c| (c.claim.as_str(), c.citations.iter().map(String::as_str).collect()))
            .collect();
        assert_eq!(
            claims,
            vec![
                ("Refunds require a receipt.", vec!["a#0"]),
                ("Refunds are paid to the original card.", vec!["b#3"]),
            ]
        );
        assert_eq!(levels(&verification), vec![SupportLevel::Supported; 2]);
        assert!((verification.confidence - 1.0).abs() < 1e-6);
        assert!(verification.limitations.is_empty());
    }

    #[test]
    fn test_unsupported_and_uncited_claims() {
        let context = vec![retrieved("a#0", "Refunds take thirty days. Shipping costs ten dollars.", 0.9)];
        let answer = "Refunds take thirty days [source:a#0]. Shipping is free worldwide [source:a#0]. Staff love pizza.";

        let verification = ClaimVerifier::default().verify(answer, &context);
        assert_eq!(
            levels(&verification),
            vec![
                SupportLevel::Supported,
                SupportLevel::NotSupported,
                SupportLevel::NotSupported
            ]
        );
        assert!(verification.claims[2].citations.is_empty());
        assert_eq!(verification.limitations.len(), 2);
        assert!(verification.limitations[0].starts_with("Not supported by the cited passages"));
        assert!(verification.limitations[1].starts_with("No source cited for"));

        let expected = (1.0 + (1.0 / 3.0) * 0.1) / 3.0;
        assert!((verification.confidence - expected).abs() < 1e-4);
    }

    #[test]
    fn test_partial_support() {
        let context = vec![retrieved("a#0", "Refunds take thirty days.", 0.9)];
        let verification = ClaimVerifier::default()
            .verify("Refunds take thirty business days by mail [source:a#0].", &context);

        assert_eq!(levels(&verification), vec![SupportLevel::PartiallySupported]);
        assert!((verification.claims[0].support - 4.0 / 6.0).abs() < 1e-4);
        assert!((verification.confidence - 0.4).abs() < 1e-4);
        assert!(verification.limitations[0].starts_with("Only partly supported"));
    }

    #[test]
    fn test_citation_outside_context_supports_nothing() {
        let context = vec![retrieved("a#0", "Refunds take thirty days.", 0.9)];
        let verification = ClaimVerifier::default().verify("Refunds take thirty days [source:z#9].", &context);
        assert_eq!(levels(&verification), vec![SupportLevel::NotSupported]);
        assert_eq!(verification.claims[0].support, 0.0);
    }

    #[test]
    fn test_headings_and_list_numbers_are_not_claims() {
        let context = vec![retrieved("a#0", "Refunds take thirty days.", 0.9)];
        let answer = "Steps:\n1. Refunds take thirty days [source:a#0]";

        let verification = ClaimVerifier::default().verify(answer, &context);
        assert_eq!(verification.claims.len(), 1);
        assert_eq!(verification.claims[0].claim, "Refunds take thirty days");
        assert_eq!(verification.claims[0].level, SupportLevel::Supported);
    }

    #[test]
    fn test_empty_answer() {
        let verification = ClaimVerifier::default().verify("", &[]);
        assert_eq!(verification, Verification::default());
    }
}
