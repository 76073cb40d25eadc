//! CLI 모듈
//!
//! ragpipe CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectionStats, FileCollector};
use crate::config::{ProviderKind, RagConfig};
use crate::embedding::{create_provider, EmbeddingGateway};
use crate::error::ErrorReport;
use crate::extractor::content_hash;
use crate::gemini::has_api_key;
use crate::knowledge::{
    IngestFailure, IngestItem, IngestionSummary, Ingestor, Retriever, SqliteVectorStore, VectorStore,
};
use crate::pipeline::Pipeline;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "ragpipe")]
#[command(version, about = "문서 기반 질의응답 RAG 파이프라인", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (기본: <data_dir>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 파일, 폴더, 또는 텍스트를 컬렉션에 추가
    Ingest {
        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 수집할 파일 경로
        #[arg(long)]
        file: Option<PathBuf>,

        /// 수집할 폴더 경로 (재귀)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 강제 재수집 (내용이 같아도 다시 임베딩)
        #[arg(long)]
        force: bool,
    },

    /// 질문하고 인용이 포함된 답변 받기
    Query {
        /// 질문
        query: String,

        /// 검색할 청크 수 (기본: 설정의 retrieval_k)
        #[arg(short)]
        k: Option<usize>,

        /// JSON으로 출력
        #[arg(long)]
        json: bool,
    },

    /// 답변 생성 없이 청크 검색
    Search {
        /// 검색 쿼리
        query: String,

        /// 결과 개수
        #[arg(short, default_value = "5")]
        k: usize,
    },

    /// 저장된 문서 목록
    List {
        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 문서 삭제
    Delete {
        /// 삭제할 문서 ID
        #[arg(short, long)]
        id: Option<String>,

        /// 삭제할 문서의 소스 URI
        #[arg(short, long)]
        source: Option<String>,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = RagConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;

    match cli.command {
        Commands::Ingest {
            text,
            file,
            dir,
            force,
        } => cmd_ingest(&config, text, file, dir, force).await,
        Commands::Query { query, k, json } => cmd_query(config, &query, k, json).await,
        Commands::Search { query, k } => cmd_search(&config, &query, k).await,
        Commands::List { limit } => cmd_list(&config, limit),
        Commands::Delete { id, source } => cmd_delete(&config, id, source),
        Commands::Status => cmd_status(&config),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 문서 수집 명령어 (ingest)
async fn cmd_ingest(
    config: &RagConfig,
    text: Option<String>,
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    ensure_api_key(config.embedding_provider)?;

    let mut read_failures = Vec::new();
    let items = if let Some(text) = text {
        let source_uri = format!("text:{}", &content_hash(&text)[..16]);
        vec![IngestItem {
            filename: "direct-input.txt".to_string(),
            source_uri,
            bytes: text.into_bytes(),
        }]
    } else if let Some(ref file_path) = file {
        let collected = FileCollector::with_defaults().collect_file(file_path)?;
        vec![IngestItem::from_path(&collected.path)?]
    } else if let Some(ref dir_path) = dir {
        let files = FileCollector::with_defaults().collect_directory(dir_path)?;
        if files.is_empty() {
            println!("[!] 수집할 파일이 없습니다.");
            return Ok(());
        }

        let stats = CollectionStats::from_files(&files);
        println!("[*] 수집 대상: {} 파일", stats.total_files);
        let by_format: Vec<String> = stats
            .by_format
            .iter()
            .map(|(format, count)| format!("{}: {}", format, count))
            .collect();
        println!("    {}", by_format.join(", "));
        println!("    총 크기: {}", format_bytes(stats.total_size as usize));
        println!();

        let mut items = Vec::with_capacity(files.len());
        for collected in files {
            match IngestItem::from_path(&collected.path) {
                Ok(item) => items.push(item),
                Err(e) => read_failures.push(IngestFailure {
                    source_uri: collected.path.display().to_string(),
                    error: ErrorReport::from(&e),
                }),
            }
        }
        items
    } else {
        bail!("--text, --file, --dir 중 하나를 지정해야 합니다");
    };

    let gateway = EmbeddingGateway::from_config(create_provider(config)?, config);
    let store = SqliteVectorStore::open_collection(config, gateway.model_id(), gateway.dimension())
        .context("벡터 컬렉션 열기 실패")?;
    let ingestor = Ingestor::new(config, gateway, Arc::new(store))?.with_force(force);

    println!("[*] 문서 저장 및 임베딩 생성 중...");
    let mut summary = ingestor.ingest_batch(items).await;
    summary.failed.extend(read_failures);

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &IngestionSummary) {
    for doc in &summary.succeeded {
        println!("  [OK] {} ({} chunks, ID: {})", doc.source_uri, doc.chunk_count, doc.document_id);
    }
    for doc in &summary.skipped {
        println!("  [=] {} (변경 없음)", doc.source_uri);
    }
    for failure in &summary.failed {
        println!("  [!] {} - {}: {}", failure.source_uri, failure.error.kind, failure.error.message);
    }
    println!();
    println!("[OK] 완료: {}", summary);
}

/// 질의 명령어 (query)
async fn cmd_query(mut config: RagConfig, query: &str, k: Option<usize>, json: bool) -> Result<()> {
    ensure_api_key(config.embedding_provider)?;
    ensure_api_key(config.generation_provider)?;

    if let Some(k) = k {
        config.retrieval_k = k;
    }
    let pipeline = Pipeline::from_config(&config).context("파이프라인 초기화 실패")?;

    // Ctrl+C → 다음 단계 진입 전 취소
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    if !json {
        println!("[*] 질의 중: \"{}\"", query);
    }

    let answer = match pipeline.run_query_with_cancel(query, &cancel).await {
        Ok(answer) => answer,
        Err(e) => {
            let report = e.report();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            bail!("{} ({} at {})", report.message, report.kind, e.stage);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    if let Some(ref rewritten) = answer.rewritten_query {
        println!("    재작성: \"{}\"", rewritten);
    }
    println!();
    println!("{}", answer.answer);
    println!();

    if answer.citations.is_empty() {
        println!("[!] 인용된 출처가 없습니다.");
    } else {
        println!("[OK] 출처 ({} 건, 신뢰도 {:.2}):\n", answer.citations.len(), answer.confidence);
        for (i, citation) in answer.citations.iter().enumerate() {
            let section = citation
                .section
                .as_deref()
                .map(|s| format!(" [{}]", s))
                .unwrap_or_default();
            println!("{}. [점수: {:.4}] {}{}", i + 1, citation.score, citation.source_uri, section);
            println!("   청크: {}", citation.chunk_id);
            println!("   내용: {}", truncate_text(&citation.excerpt, 200));
            println!();
        }
    }

    if !answer.limitations.is_empty() {
        println!("[!] 한계:");
        for limitation in &answer.limitations {
            println!("    - {}", limitation);
        }
        println!();
    }

    let stages: Vec<&str> = answer.stage_history.iter().map(|s| s.as_str()).collect();
    println!("    단계: {}", stages.join(" → "));

    Ok(())
}

/// 검색 명령어 (search)
async fn cmd_search(config: &RagConfig, query: &str, k: usize) -> Result<()> {
    ensure_api_key(config.embedding_provider)?;
    config.validate()?;

    let gateway = EmbeddingGateway::from_config(create_provider(config)?, config);
    let store = SqliteVectorStore::open_collection(config, gateway.model_id(), gateway.dimension())
        .context("벡터 컬렉션 열기 실패")?;
    let retriever = Retriever::new(gateway, Arc::new(store));

    println!("[*] 검색 중: \"{}\"", query);
    let result = retriever.retrieve(query, k).await.context("검색 실패")?;

    if result.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", result.len());
    for (i, item) in result.iter().enumerate() {
        println!("{}. [점수: {:.4}] {}", i + 1, item.score, item.chunk.id);
        if let Some(ref title) = item.metadata.title {
            println!("   제목: {}", title);
        }
        println!("   소스: {}", item.metadata.source_uri);
        println!("   내용: {}", truncate_text(&item.chunk.text, 200));
        println!();
    }

    Ok(())
}

/// 목록 명령어 (list)
fn cmd_list(config: &RagConfig, limit: usize) -> Result<()> {
    let Some(store) = open_existing(config)? else {
        println!("[!] 컬렉션 '{}'이(가) 아직 없습니다.", config.collection);
        return Ok(());
    };

    let docs = store.list_documents(limit).context("문서 목록 조회 실패")?;
    if docs.is_empty() {
        println!("[!] 저장된 문서가 없습니다.");
        return Ok(());
    }

    println!("[OK] 저장된 문서 ({} 건):\n", docs.len());
    for doc in docs {
        let title = doc
            .metadata
            .title
            .as_ref()
            .map(|t| truncate_text(t, 40))
            .unwrap_or_else(|| "-".to_string());

        println!("  {} [{}] {}", doc.id, doc.raw_format, title);
        println!("        소스: {}", doc.source_uri);
        println!(
            "        {} | {} chunks | {}",
            doc.created_at.format("%Y-%m-%d %H:%M"),
            doc.chunk_count,
            format_bytes(doc.metadata.byte_size)
        );
        println!();
    }

    Ok(())
}

/// 삭제 명령어 (delete)
fn cmd_delete(config: &RagConfig, id: Option<String>, source: Option<String>) -> Result<()> {
    let Some(store) = open_existing(config)? else {
        bail!("컬렉션 '{}'이(가) 없습니다", config.collection);
    };

    let doc = if let Some(ref id) = id {
        store.get_document(id).context("문서 조회 실패")?
    } else if let Some(ref source) = source {
        store.find_document_by_source(source).context("문서 조회 실패")?
    } else {
        bail!("--id 또는 --source 중 하나를 지정해야 합니다");
    };

    let Some(doc) = doc else {
        bail!("문서를 찾을 수 없습니다");
    };

    let removed = store.delete(&doc.id).context("문서 삭제 실패")?;
    println!("[OK] 문서 {} 삭제됨 ({} chunks)", doc.id, removed);
    println!("     소스: {}", doc.source_uri);

    Ok(())
}

/// 상태 명령어 (status)
fn cmd_status(config: &RagConfig) -> Result<()> {
    println!("ragpipe v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 데이터 디렉토리: {}", config.data_dir().display());
    println!("[*] 컬렉션: {}", config.collection);

    match config.validate() {
        Ok(()) => println!("[OK] 설정: 유효"),
        Err(e) => println!("[!] 설정: {}", e),
    }

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match open_existing(config) {
        Ok(Some(store)) => match store.stats() {
            Ok(stats) => {
                println!("[OK] 저장된 문서: {} 건", stats.document_count);
                println!("     벡터 엔트리: {} 청크", stats.entry_count);
                println!(
                    "     모델: {} ({}차원, {})",
                    stats.model_id,
                    stats.dimension,
                    stats.metric.as_str()
                );
            }
            Err(e) => println!("[!] 통계 조회 실패: {}", e),
        },
        Ok(None) => println!("[!] 컬렉션이 아직 없습니다 (ingest로 생성)"),
        Err(e) => println!("[!] 컬렉션 열기 실패: {}", e),
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 기존 컬렉션을 저장된 모델 정보로 열기 (임베딩 프로바이더 불필요)
fn open_existing(config: &RagConfig) -> Result<Option<SqliteVectorStore>> {
    let path = config.collection_path();
    open_with_stored_spec(&path)
}

fn open_with_stored_spec(path: &Path) -> Result<Option<SqliteVectorStore>> {
    match SqliteVectorStore::read_spec(path)? {
        Some(spec) => Ok(Some(SqliteVectorStore::open(path, spec)?)),
        None => Ok(None),
    }
}

/// Gemini 프로바이더 사용 시 API 키 확인
fn ensure_api_key(provider: ProviderKind) -> Result<()> {
    if provider == ProviderKind::Gemini && !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey\n\
             오프라인 사용: RAGPIPE_EMBEDDING_PROVIDER=local RAGPIPE_GENERATION_PROVIDER=local"
        );
    }
    Ok(())
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::CollectionSpec;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_truncate_unicode() {
        let korean = "안녕하세요 세계";
        let truncated = truncate_text(korean, 5);
        assert_eq!(truncated, "안녕하세요...");
    }

    #[test]
    fn test_parse_commands() {
        let cli = Cli::parse_from(["ragpipe", "--config", "rag.toml", "query", "what is KYC?", "-k", "3", "--json"]);
        assert_eq!(cli.config, Some(PathBuf::from("rag.toml")));
        match cli.command {
            Commands::Query { query, k, json } => {
                assert_eq!(query, "what is KYC?");
                assert_eq!(k, Some(3));
                assert!(json);
            }
            _ => panic!("expected query command"),
        }

        let cli = Cli::parse_from(["ragpipe", "delete", "--source", "notes.md"]);
        assert!(matches!(cli.command, Commands::Delete { id: None, source: Some(_) }));
    }

    #[test]
    fn test_open_with_stored_spec() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.db");
        assert!(open_with_stored_spec(&path).unwrap().is_none());

        let spec = CollectionSpec {
            model_id: "m".into(),
            dimension: 8,
            metric: Default::default(),
        };
        drop(SqliteVectorStore::open(&path, spec.clone()).unwrap());

        let store = open_with_stored_spec(&path).unwrap().unwrap();
        assert_eq!(store.spec(), &spec);
    }

    #[test]
    fn test_local_providers_need_no_key() {
        assert!(ensure_api_key(ProviderKind::Local).is_ok());
    }
}
