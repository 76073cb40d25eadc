//! 파일 수집 모듈
//!
//! 로컬 파일 및 폴더에서 수집 대상 문서를 찾습니다.
//! .gitignore 패턴을 존중하고, 지원하는 문서 형식만 수집합니다.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use ignore::WalkBuilder;

use crate::extractor::DocumentFormat;

// ============================================================================
// Collected File
// ============================================================================

/// 수집된 파일 정보
#[derive(Debug, Clone)]
pub struct CollectedFile {
    /// 파일 절대 경로
    pub path: PathBuf,
    /// 확장자로 결정한 문서 형식
    pub format: DocumentFormat,
    /// 파일 크기 (바이트)
    pub size: u64,
    /// 수정 시간
    pub modified_at: Option<SystemTime>,
}

impl CollectedFile {
    /// 파일에서 CollectedFile 생성 (지원하지 않는 확장자는 None)
    pub fn from_path(path: PathBuf) -> Result<Option<Self>> {
        let format = match format_of(&path) {
            Some(format) => format,
            None => return Ok(None),
        };

        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("Failed to read metadata: {:?}", path))?;

        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(Self {
            path,
            format,
            size: metadata.len(),
            modified_at: metadata.modified().ok(),
        }))
    }
}

/// 확장자로 지원 형식 결정 (미지원/알 수 없는 확장자는 None)
fn format_of(path: &Path) -> Option<DocumentFormat> {
    let ext = path.extension()?.to_str()?;
    match DocumentFormat::from_extension(ext)? {
        Ok(format) => Some(format),
        Err(e) => {
            tracing::debug!("Skipping {:?}: {}", path, e);
            None
        }
    }
}

// ============================================================================
// File Collector
// ============================================================================

/// 파일 수집기 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// .gitignore 패턴 존중 여부
    pub respect_gitignore: bool,
    /// 숨김 파일 포함 여부
    pub include_hidden: bool,
    /// 최대 파일 크기 (바이트, 0이면 제한 없음)
    pub max_file_size: u64,
    /// 특정 형식만 수집 (비어있으면 모든 지원 형식)
    pub formats: Vec<DocumentFormat>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: 50 * 1024 * 1024, // 50MB
            formats: vec![],
        }
    }
}

/// 파일 수집기
pub struct FileCollector {
    config: CollectorConfig,
}

impl FileCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    /// 기본 설정으로 수집기 생성
    pub fn with_defaults() -> Self {
        Self::new(CollectorConfig::default())
    }

    /// 단일 파일 수집
    ///
    /// 명시적으로 지정한 파일은 확장자와 무관하게 수집합니다 (형식 판정은 로더가 수행).
    pub fn collect_file(&self, path: &Path) -> Result<CollectedFile> {
        let abs_path = absolute(path)?;

        if !abs_path.is_file() {
            anyhow::bail!("Not a file: {:?}", abs_path);
        }

        let metadata = std::fs::metadata(&abs_path)
            .with_context(|| format!("Failed to read metadata: {:?}", abs_path))?;

        Ok(CollectedFile {
            format: format_of(&abs_path).unwrap_or(DocumentFormat::PlainText),
            size: metadata.len(),
            modified_at: metadata.modified().ok(),
            path: abs_path,
        })
    }

    /// 폴더 재귀 수집 (경로 순 정렬)
    pub fn collect_directory(&self, path: &Path) -> Result<Vec<CollectedFile>> {
        let abs_path = absolute(path)?;

        if !abs_path.is_dir() {
            anyhow::bail!("Not a directory: {:?}", abs_path);
        }

        let mut files = Vec::new();

        // ignore 크레이트로 .gitignore 지원
        let walker = WalkBuilder::new(&abs_path)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .require_git(false)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            match CollectedFile::from_path(entry.path().to_path_buf()) {
                Ok(Some(file)) => {
                    if self.should_include(&file) {
                        files.push(file);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to collect file: {}", e);
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::info!("Collected {} files from {:?}", files.len(), abs_path);
        Ok(files)
    }

    /// 파일이 필터 조건을 만족하는지 확인
    fn should_include(&self, file: &CollectedFile) -> bool {
        if self.config.max_file_size > 0 && file.size > self.config.max_file_size {
            tracing::debug!("Skipping large file: {:?} ({} bytes)", file.path, file.size);
            return false;
        }

        if !self.config.formats.is_empty() && !self.config.formats.contains(&file.format) {
            return false;
        }

        true
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    if !abs_path.exists() {
        anyhow::bail!("Path not found: {:?}", abs_path);
    }
    Ok(abs_path)
}

// ============================================================================
// Statistics
// ============================================================================

/// 수집 통계
#[derive(Debug, Default)]
pub struct CollectionStats {
    pub total_files: usize,
    pub total_size: u64,
    /// 형식별 파일 수
    pub by_format: BTreeMap<&'static str, usize>,
}

impl CollectionStats {
    /// 수집된 파일 목록에서 통계 계산
    pub fn from_files(files: &[CollectedFile]) -> Self {
        let mut stats = Self::default();

        for file in files {
            stats.total_files += 1;
            stats.total_size += file.size;
            *stats.by_format.entry(file.format.as_str()).or_default() += 1;
        }

        stats
    }
}

// ============================================================================
// Tests
// ============================================================================
