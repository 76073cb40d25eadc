//! Pipeline 모듈 - 질의 오케스트레이터 (유한 상태 기계)
//!
//! `START → REWRITE_QUERY → RETRIEVE → {EMPTY_RESULT_BRANCH | SYNTHESIZE → CITE} → END`
//!
//! - REWRITE_QUERY 실패: 경고 로그 후 원문 쿼리로 계속
//! - RETRIEVE: 유사도 하한 적용 후 재정렬기로 상위 N개를 컨텍스트로 선택 (재정렬 실패 시 유사도 순서)
//! - 검색 결과(유사도 하한 적용 후)가 비면: 고정 답변, 생성기 호출 없음
//! - SYNTHESIZE 실패: `PipelineError{stage: SYNTHESIZE}`로 실행 종료
//! - CITE: 컨텍스트에 없는 인용은 제거하고 경고 로그, 남은 답변의 주장을 인용 청크와 대조해 신뢰도 계산
//!
//! 취소는 START 이후 모든 단계 진입 직전에 확인합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let pipeline = Pipeline::from_config(&RagConfig::load(None)?)?;
//! let answer = pipeline.run_query("What is the refund policy?").await?;
//! ```

mod state;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::RagConfig;
use crate::embedding::{create_provider, EmbeddingGateway};
use crate::error::{PipelineError, RagError, Result};
use crate::generation::{
    create_reranker, create_rewriter, create_synthesizer, strip_citations, ClaimVerifier, QueryRewriter, Reranker,
    SynthesisGateway,
};
use crate::knowledge::{check_compatible, RetrievedChunk, Retriever, SqliteVectorStore};

pub use state::{Citation, PipelineState, QueryAnswer, RetrievalHit, Stage, EXCERPT_MAX_CHARS};

/// 근거가 부족할 때의 고정 답변
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "I could not find enough relevant information in the indexed documents to answer this question.";

/// 빈 검색 결과일 때의 한계
const NO_CONTEXT_LIMITATION: &str = "No indexed passage was relevant enough to answer the question";

// ============================================================================
// Pipeline
// ============================================================================

/// 질의 파이프라인
///
/// 실행마다 독립적인 `PipelineState`를 만들며, 실행 간 공유 상태는 벡터 저장소뿐입니다.
#[derive(Clone)]
pub struct Pipeline {
    retriever: Retriever,
    synthesis: SynthesisGateway,
    rewriter: Arc<dyn QueryRewriter>,
    reranker: Option<Arc<dyn Reranker>>,
    verifier: ClaimVerifier,
    retrieval_k: usize,
    min_similarity: Option<f32>,
}

impl Pipeline {
    /// 구성 요소로 생성 (설정 검증 + 임베딩/컬렉션 호환성 확인)
    ///
    /// 재정렬기는 설정(`rerank`, `rerank_top_n`)에서 만들고, `with_reranker`로 바꿀 수 있습니다.
    pub fn new(
        config: &RagConfig,
        retriever: Retriever,
        synthesis: SynthesisGateway,
        rewriter: Arc<dyn QueryRewriter>,
    ) -> Result<Self> {
        config.validate()?;
        check_compatible(retriever.gateway(), retriever.store().as_ref())?;

        Ok(Self {
            retriever,
            synthesis,
            rewriter,
            reranker: create_reranker(config),
            verifier: ClaimVerifier::default(),
            retrieval_k: config.retrieval_k,
            min_similarity: config.min_similarity,
        })
    }

    /// 재정렬기 교체 (None이면 유사도 순서 그대로)
    pub fn with_reranker(mut self, reranker: Option<Arc<dyn Reranker>>) -> Self {
        self.reranker = reranker;
        self
    }

    /// 설정만으로 생성 (프로바이더 + 컬렉션 열기)
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        config.validate()?;

        let gateway = EmbeddingGateway::from_config(create_provider(config)?, config);
        let store = SqliteVectorStore::open_collection(config, gateway.model_id(), gateway.dimension())?;
        let retriever = Retriever::new(gateway, Arc::new(store));
        let synthesis = SynthesisGateway::from_config(create_synthesizer(config)?, config);

        Self::new(config, retriever, synthesis, create_rewriter(config)?)
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// 질의 실행
    pub async fn run_query(&self, text: &str) -> std::result::Result<QueryAnswer, PipelineError> {
        self.run_query_with_cancel(text, &CancellationToken::new()).await
    }

    /// 취소 가능한 질의 실행
    pub async fn run_query_with_cancel(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<QueryAnswer, PipelineError> {
        let mut state = PipelineState::new(text);
        let span = tracing::info_span!("query", run_id = %state.run_id);

        match self.execute(&mut state, cancel).instrument(span).await {
            Ok(()) => Ok(state.into_answer()),
            Err(e) => {
                tracing::warn!(run_id = %state.run_id, "Query failed at {}: {}", e.stage, e.cause);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), PipelineError> {
        state.enter(Stage::Start);
        tracing::info!("Query: {}", state.query);

        // 1. REWRITE_QUERY
        checkpoint(cancel, Stage::RewriteQuery)?;
        state.enter(Stage::RewriteQuery);
        self.rewrite(state).await;

        // 2. RETRIEVE
        checkpoint(cancel, Stage::Retrieve)?;
        state.enter(Stage::Retrieve);
        let retrieved = self
            .retriever
            .retrieve(state.effective_query(), self.retrieval_k)
            .await
            .map_err(|e| PipelineError::new(Stage::Retrieve, e))?;
        let above_floor = self.filter_context(&retrieved.items);
        let floor_count = above_floor.len();
        let query = state.effective_query().to_string();
        state.filtered_context = self.rerank(&query, above_floor).await;
        state.retrieved = retrieved;
        tracing::info!(
            "Retrieved {} chunks, {} above similarity floor, {} in context",
            state.retrieved.len(),
            floor_count,
            state.filtered_context.len()
        );

        // 3a. EMPTY_RESULT_BRANCH
        if state.filtered_context.is_empty() {
            checkpoint(cancel, Stage::EmptyResultBranch)?;
            state.enter(Stage::EmptyResultBranch);
            state.draft_answer = Some(INSUFFICIENT_CONTEXT_ANSWER.to_string());
            state.limitations.push(NO_CONTEXT_LIMITATION.to_string());

            checkpoint(cancel, Stage::End)?;
            state.enter(Stage::End);
            return Ok(());
        }

        // 3b. SYNTHESIZE
        checkpoint(cancel, Stage::Synthesize)?;
        state.enter(Stage::Synthesize);
        let synthesized = self
            .synthesis
            .synthesize(&state.query, &state.filtered_context)
            .await
            .map_err(|e| PipelineError::new(Stage::Synthesize, e))?;
        state.draft_answer = Some(synthesized.answer_text);
        state.citations = synthesized.citations;

        // 4. CITE
        checkpoint(cancel, Stage::Cite)?;
        state.enter(Stage::Cite);
        validate_citations(state);
        let verification = self
            .verifier
            .verify(state.draft_answer.as_deref().unwrap_or_default(), &state.filtered_context);
        tracing::info!(
            "Verified {} claims (confidence {:.2}, {} limitations)",
            verification.claims.len(),
            verification.confidence,
            verification.limitations.len()
        );
        state.verification = Some(verification);

        checkpoint(cancel, Stage::End)?;
        state.enter(Stage::End);
        tracing::info!("Answered with {} citations", state.citations.len());
        Ok(())
    }

    /// 재작성 (실패 시 원문 유지)
    async fn rewrite(&self, state: &mut PipelineState) {
        match self.rewriter.rewrite(&state.query).await {
            Ok(rewritten) => {
                let rewritten = rewritten.trim();
                if !rewritten.is_empty() && rewritten != state.query.trim() {
                    tracing::info!("Rewritten query: {}", rewritten);
                    state.rewritten_query = Some(rewritten.to_string());
                }
            }
            Err(e) => {
                tracing::warn!("Query rewrite failed, using the raw query: {}", e);
            }
        }
    }

    /// 재정렬 (실패하거나 비면 유사도 순서 유지, 결과는 입력의 부분집합으로 제한)
    async fn rerank(&self, query: &str, context: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
        let Some(reranker) = &self.reranker else {
            return context;
        };
        if context.is_empty() {
            return context;
        }

        match reranker.rerank(query, &context).await {
            Ok(mut ranked) => {
                ranked.retain(|item| context.iter().any(|c| c.chunk.id == item.chunk.id));
                if ranked.is_empty() {
                    context
                } else {
                    ranked
                }
            }
            Err(e) => {
                tracing::warn!("Rerank with {} failed, keeping similarity order: {}", reranker.name(), e);
                context
            }
        }
    }

    /// 유사도 하한 적용 (하한이 없으면 전부)
    fn filter_context(&self, items: &[RetrievedChunk]) -> Vec<RetrievedChunk> {
        items
            .iter()
            .filter(|item| self.min_similarity.map_or(true, |floor| item.score >= floor))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("retrieval_k", &self.retrieval_k)
            .field("min_similarity", &self.min_similarity)
            .field("reranker", &self.reranker.as_ref().map(|r| r.name()))
            .field("synthesis", &self.synthesis)
            .finish()
    }
}

/// 다음 단계 진입 전 취소 확인
fn checkpoint(cancel: &CancellationToken, next: Stage) -> std::result::Result<(), PipelineError> {
    if cancel.is_cancelled() {
        tracing::info!("Run cancelled before {}", next);
        return Err(PipelineError::new(next, RagError::Cancelled));
    }
    Ok(())
}

/// 컨텍스트에 없는 인용 제거 (본문 표기 포함)
fn validate_citations(state: &mut PipelineState) {
    let allowed: BTreeSet<&str> = state
        .filtered_context
        .iter()
        .map(|item| item.chunk.id.as_str())
        .collect();

    let (valid, dropped): (BTreeSet<String>, BTreeSet<String>) = std::mem::take(&mut state.citations)
        .into_iter()
        .partition(|id| allowed.contains(id.as_str()));

    for id in &dropped {
        tracing::warn!("Dropping citation {} (not in the retrieved context)", id);
    }
    if !dropped.is_empty() {
        state.limitations.push(format!(
            "Removed {} citation(s) to passages outside the retrieved context",
            dropped.len()
        ));
    }

    if let Some(answer) = state.draft_answer.take() {
        state.draft_answer = Some(strip_citations(&answer, |id| allowed.contains(id)));
    }
    state.citations = valid;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, LocalHashEmbedding, LOCAL_MODEL_ID};
    use crate::extractor::document_id_for;
    use crate::generation::tests::ScriptedSynthesizer;
    use crate::generation::{AnswerSynthesizer, ExtractiveSynthesizer, LexicalReranker, NoopRewriter, SupportLevel, SynthesizedAnswer};
    use crate::knowledge::ingest_tests::{local_gateway, open_store, test_config, DIMENSION};
    use crate::knowledge::{Ingestor, VectorStore};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const ABC: &str = "Apples grow in the north orchard.\n\n\
        Bananas ship from the southern port every Tuesday.\n\n\
        Cherries are harvested in early summer.";

    fn config(dir: &TempDir) -> RagConfig {
        RagConfig {
            chunk_max_tokens: 256,
            chunk_overlap_tokens: 32,
            ..test_config(dir)
        }
    }

    fn build(config: &RagConfig, synthesizer: Arc<dyn crate::generation::AnswerSynthesizer>) -> (Pipeline, Ingestor) {
        let store = open_store(config);
        let ingestor = Ingestor::new(config, local_gateway(), store.clone()).unwrap();
        let pipeline = Pipeline::new(
            config,
            Retriever::new(local_gateway(), store),
            SynthesisGateway::new(synthesizer),
            create_rewriter(config).unwrap(),
        )
        .unwrap();
        (pipeline, ingestor)
    }

    /// 임베딩 호출 시 토큰을 취소하는 프로바이더 (RETRIEVE 도중 취소)
    struct CancellingEmbedding {
        inner: LocalHashEmbedding,
        token: CancellationToken,
    }

    #[async_trait]
    impl EmbeddingProvider for CancellingEmbedding {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.token.cancel();
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_id(&self) -> &str {
            LOCAL_MODEL_ID
        }
    }

    /// 받은 컨텍스트의 chunk_id를 기록하는 생성기
    #[derive(Default)]
    struct RecordingSynthesizer {
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl AnswerSynthesizer for RecordingSynthesizer {
        async fn synthesize(&self, query: &str, context: &[RetrievedChunk]) -> Result<SynthesizedAnswer> {
            self.seen
                .lock()
                .unwrap()
                .push(context.iter().map(|item| item.chunk.id.clone()).collect());
            ExtractiveSynthesizer::default().synthesize(query, context).await
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct FailingRewriter;

    #[async_trait]
    impl QueryRewriter for FailingRewriter {
        async fn rewrite(&self, _query: &str) -> Result<String> {
            Err(RagError::ModelUnavailable("rewriter offline".into()))
        }
    }

    #[tokio::test]
    async fn test_empty_corpus_takes_empty_branch() {
        let dir = TempDir::new().unwrap();
        let synthesizer = Arc::new(ScriptedSynthesizer::answering("never", &[]));
        let (pipeline, _) = build(&config(&dir), synthesizer.clone());

        let answer = pipeline.run_query("What grows in the orchard?").await.unwrap();

        assert_eq!(answer.answer, INSUFFICIENT_CONTEXT_ANSWER);
        assert!(answer.citations.is_empty());
        assert!(!answer.grounded);
        assert_eq!(
            answer.stage_history,
            vec![
                Stage::Start,
                Stage::RewriteQuery,
                Stage::Retrieve,
                Stage::EmptyResultBranch,
                Stage::End
            ]
        );
        assert_eq!(synthesizer.call_count(), 0);
        assert_eq!(answer.confidence, 0.0);
        assert_eq!(answer.limitations, vec![NO_CONTEXT_LIMITATION.to_string()]);
    }

    #[tokio::test]
    async fn test_end_to_end_single_chunk() {
        let dir = TempDir::new().unwrap();
        let (pipeline, ingestor) = build(&config(&dir), Arc::new(ExtractiveSynthesizer::default()));

        let document_id = ingestor.ingest_document(ABC.as_bytes(), "fruit.txt").await.unwrap();
        assert_eq!(ingestor.store().count().unwrap(), 1);
        assert_eq!(ingestor.store().document_entry_count(&document_id).unwrap(), 1);

        let answer = pipeline.run_query("When do bananas ship?").await.unwrap();
        let chunk_id = format!("{}#0", document_id);

        assert_eq!(answer.retrieved.len(), 1);
        assert_eq!(answer.retrieved[0].chunk_id, chunk_id);
        assert!(answer.retrieved[0].score >= 0.0);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].chunk_id, chunk_id);
        assert_eq!(answer.citations[0].source_uri, "fruit.txt");
        assert!(answer.answer.contains("Bananas ship from the southern port every Tuesday."));
        assert!(answer.grounded);
        assert!(!answer.claims.is_empty());
        assert!(answer.claims.iter().all(|c| c.level == SupportLevel::Supported));
        assert!((answer.confidence - 1.0).abs() < 1e-6);
        assert!(answer.limitations.is_empty());
        assert_eq!(
            answer.stage_history,
            vec![
                Stage::Start,
                Stage::RewriteQuery,
                Stage::Retrieve,
                Stage::Synthesize,
                Stage::Cite,
                Stage::End
            ]
        );
    }

    #[tokio::test]
    async fn test_hallucinated_citations_are_dropped() {
        let dir = TempDir::new().unwrap();
        let real = format!("{}#0", document_id_for("fruit.txt"));
        let synthesizer = Arc::new(ScriptedSynthesizer::answering(
            &format!("Bananas ship Tuesdays [source:{}]. Plums are blue [source:ghost#4].", real),
            &[real.as_str(), "ghost#4"],
        ));
        let (pipeline, ingestor) = build(&config(&dir), synthesizer);
        ingestor.ingest_document(ABC.as_bytes(), "fruit.txt").await.unwrap();

        let answer = pipeline.run_query("bananas").await.unwrap();

        let cited: Vec<&str> = answer.citations.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(cited, vec![real.as_str()]);
        assert!(!answer.answer.contains("ghost#4"));
        assert!(answer.answer.ends_with("Plums are blue."));
        assert!(answer.limitations.iter().any(|l| l.starts_with("Removed 1 citation")));
        let plums = answer.claims.iter().find(|c| c.claim.starts_with("Plums")).unwrap();
        assert_eq!(plums.level, SupportLevel::NotSupported);
        assert!(plums.citations.is_empty());
        assert!(answer.confidence < 1.0);
        for citation in &answer.citations {
            assert!(answer.retrieved.iter().any(|hit| hit.chunk_id == citation.chunk_id));
        }
    }

    #[tokio::test]
    async fn test_cancel_after_retrieve_skips_synthesis() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let store = open_store(&config);
        Ingestor::new(&config, local_gateway(), store.clone())
            .unwrap()
            .ingest_document(ABC.as_bytes(), "fruit.txt")
            .await
            .unwrap();

        let token = CancellationToken::new();
        let embedding = CancellingEmbedding {
            inner: LocalHashEmbedding::new(DIMENSION).unwrap(),
            token: token.clone(),
        };
        let synthesizer = Arc::new(ScriptedSynthesizer::answering("never", &[]));
        let pipeline = Pipeline::new(
            &config,
            Retriever::new(EmbeddingGateway::new(Arc::new(embedding)), store),
            SynthesisGateway::new(synthesizer.clone()),
            Arc::new(NoopRewriter),
        )
        .unwrap();

        let err = pipeline.run_query_with_cancel("bananas", &token).await.unwrap_err();
        assert_eq!(err.stage, Stage::Synthesize);
        assert!(matches!(err.cause, RagError::Cancelled));
        assert_eq!(synthesizer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_of_rewrite() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = build(&config(&dir), Arc::new(ExtractiveSynthesizer::default()));

        let token = CancellationToken::new();
        token.cancel();
        let err = pipeline.run_query_with_cancel("anything", &token).await.unwrap_err();
        assert_eq!(err.stage, Stage::RewriteQuery);
        assert_eq!(err.report().kind, "Cancelled");
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let synthesizer = Arc::new(ScriptedSynthesizer::failing(10, RagError::GenerationError));
        let (pipeline, ingestor) = build(&config(&dir), synthesizer);
        ingestor.ingest_document(ABC.as_bytes(), "fruit.txt").await.unwrap();

        let err = pipeline.run_query("bananas").await.unwrap_err();
        assert_eq!(err.stage, Stage::Synthesize);
        let report = err.report();
        assert_eq!(report.kind, "GenerationError");
        assert_eq!(report.stage, Some(Stage::Synthesize));
    }

    #[tokio::test]
    async fn test_rewrite_failure_falls_back_to_raw_query() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let store = open_store(&config);
        Ingestor::new(&config, local_gateway(), store.clone())
            .unwrap()
            .ingest_document(ABC.as_bytes(), "fruit.txt")
            .await
            .unwrap();
        let pipeline = Pipeline::new(
            &config,
            Retriever::new(local_gateway(), store),
            SynthesisGateway::new(Arc::new(ExtractiveSynthesizer::default())),
            Arc::new(FailingRewriter),
        )
        .unwrap();

        let answer = pipeline.run_query("cherries").await.unwrap();
        assert_eq!(answer.rewritten_query, None);
        assert!(answer.stage_history.contains(&Stage::RewriteQuery));
        assert!(answer.answer.contains("Cherries"));
    }

    #[tokio::test]
    async fn test_abbreviations_rewrite_query() {
        let dir = TempDir::new().unwrap();
        let config = RagConfig {
            abbreviations: BTreeMap::from([("OKR".to_string(), "objectives and key results".to_string())]),
            ..config(&dir)
        };
        let (pipeline, _) = build(&config, Arc::new(ExtractiveSynthesizer::default()));

        let answer = pipeline.run_query("team OKR").await.unwrap();
        assert_eq!(
            answer.rewritten_query.as_deref(),
            Some("team objectives and key results (OKR)")
        );
    }

    #[tokio::test]
    async fn test_similarity_floor_filters_context() {
        let dir = TempDir::new().unwrap();
        let config = RagConfig {
            min_similarity: Some(0.99),
            ..config(&dir)
        };
        let synthesizer = Arc::new(ScriptedSynthesizer::answering("never", &[]));
        let (pipeline, ingestor) = build(&config, synthesizer.clone());
        ingestor.ingest_document(ABC.as_bytes(), "fruit.txt").await.unwrap();

        let answer = pipeline.run_query("bananas").await.unwrap();
        assert_eq!(answer.retrieved.len(), 1);
        assert_eq!(answer.answer, INSUFFICIENT_CONTEXT_ANSWER);
        assert!(answer.stage_history.contains(&Stage::EmptyResultBranch));
        assert_eq!(synthesizer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reranker_narrows_context_to_top_n() {
        let dir = TempDir::new().unwrap();
        let config = RagConfig {
            chunk_max_tokens: 8,
            chunk_overlap_tokens: 2,
            rerank_top_n: 1,
            ..config(&dir)
        };
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let (pipeline, ingestor) = build(&config, synthesizer.clone());
        ingestor.ingest_document(ABC.as_bytes(), "fruit.txt").await.unwrap();

        let answer = pipeline.run_query("When are cherries harvested?").await.unwrap();
        assert!(answer.retrieved.len() > 1);
        assert!(answer.answer.contains("Cherries"));

        let seen = synthesizer.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 1);
        assert!(answer.retrieved.iter().any(|hit| hit.chunk_id == seen[0][0]));
        assert_eq!(
            answer.stage_history,
            vec![
                Stage::Start,
                Stage::RewriteQuery,
                Stage::Retrieve,
                Stage::Synthesize,
                Stage::Cite,
                Stage::End
            ]
        );
    }

    #[tokio::test]
    async fn test_without_reranker_context_is_similarity_order() {
        let dir = TempDir::new().unwrap();
        let config = RagConfig {
            chunk_max_tokens: 8,
            chunk_overlap_tokens: 2,
            ..config(&dir)
        };
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let (pipeline, ingestor) = build(&config, synthesizer.clone());
        let pipeline = pipeline.with_reranker(None);
        ingestor.ingest_document(ABC.as_bytes(), "fruit.txt").await.unwrap();

        let answer = pipeline.run_query("When are cherries harvested?").await.unwrap();
        let seen = synthesizer.seen.lock().unwrap().clone();
        let retrieved: Vec<String> = answer.retrieved.iter().map(|hit| hit.chunk_id.clone()).collect();
        assert_eq!(seen, vec![retrieved]);

        let narrowed = pipeline.with_reranker(Some(Arc::new(LexicalReranker::new(2))));
        narrowed.run_query("When are cherries harvested?").await.unwrap();
        assert_eq!(synthesizer.seen.lock().unwrap()[1].len(), 2.min(answer.retrieved.len()));
    }

    #[tokio::test]
    async fn test_runs_are_deterministic() {
        let dir = TempDir::new().unwrap();
        let config = RagConfig {
            chunk_max_tokens: 8,
            chunk_overlap_tokens: 2,
            ..config(&dir)
        };
        let (pipeline, ingestor) = build(&config, Arc::new(ExtractiveSynthesizer::default()));
        ingestor.ingest_document(ABC.as_bytes(), "fruit.txt").await.unwrap();

        let first = pipeline.run_query("Where do bananas ship from?").await.unwrap();
        let second = pipeline.run_query("Where do bananas ship from?").await.unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.retrieved, second.retrieved);
        assert_eq!(first.answer, second.answer);
        assert_eq!(first.citations, second.citations);
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let dir = TempDir::new().unwrap();
        let (pipeline, ingestor) = build(&config(&dir), Arc::new(ExtractiveSynthesizer::default()));
        ingestor.ingest_document(ABC.as_bytes(), "fruit.txt").await.unwrap();

        let (a, b) = tokio::join!(pipeline.run_query("apples"), pipeline.run_query("cherries"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.answer.contains("Apples"));
        assert!(b.answer.contains("Cherries"));
        assert_eq!(a.stage_history, b.stage_history);
    }

    #[test]
    fn test_invalid_config_fails_at_construction() {
        let dir = TempDir::new().unwrap();
        let bad = RagConfig {
            retrieval_k: 0,
            ..config(&dir)
        };
        let err = Pipeline::from_config(&bad).err().unwrap();
        assert!(matches!(err, RagError::InvalidConfig(_)));
    }

    #[test]
    fn test_dimension_mismatch_fails_before_search() {
        let dir = TempDir::new().unwrap();
        let small = RagConfig {
            embedding_dimension: 384,
            ..RagConfig::local()
        };
        let small = RagConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..small
        };
        Pipeline::from_config(&small).unwrap();

        let large = RagConfig {
            embedding_dimension: 768,
            ..small
        };
        let err = Pipeline::from_config(&large).err().unwrap();
        assert!(matches!(err, RagError::StoreIncompatible(_)));
    }
}
