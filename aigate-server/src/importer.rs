//! Loading finished analyses into the store.
//!
//! The whole batch is retried when no target imports; a batch where at
//! least one repository imported counts as a success.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use aigate_core::{
    Commit, CommitStatus, CompositionPercentages, LineCounts, PullRequest, RepositoryRecord,
};

use crate::error::OrchestratorError;
use crate::store::{Store, StoreError};

/// One (repository, commit, pull request) tuple to import.
#[derive(Debug, Clone)]
pub struct ImportTarget {
    pub repository: RepositoryRecord,
    pub commit: Commit,
    pub pull_request: PullRequest,
    pub artifact: PathBuf,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed artifact line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait ImportBackend: Send + Sync {
    async fn import(&self, target: &ImportTarget) -> Result<(), ImportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Sleeps between attempts: `delay`, `2 * delay`, `4 * delay`, ...
///
/// There is one sleep fewer than there are attempts.
pub fn backoff_schedule(max_attempts: u32, delay: Duration) -> Vec<Duration> {
    (0..max_attempts.saturating_sub(1))
        .map(|i| delay.saturating_mul(1u32.checked_shl(i).unwrap_or(u32::MAX)))
        .collect()
}

pub struct Importer {
    backend: Arc<dyn ImportBackend>,
    config: ImportConfig,
}

impl Importer {
    pub fn new(backend: Arc<dyn ImportBackend>, config: ImportConfig) -> Self {
        Self { backend, config }
    }

    /// Import every target, retrying the whole batch until one succeeds.
    ///
    /// Returns how many targets imported on the successful attempt.
    pub async fn import_data(&self, targets: &[ImportTarget]) -> Result<usize, OrchestratorError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delays = backoff_schedule(max_attempts, self.config.retry_delay).into_iter();

        for attempt in 1..=max_attempts {
            let mut imported = 0;
            for target in targets {
                match self.backend.import(target).await {
                    Ok(()) => imported += 1,
                    Err(e) => warn!(
                        "Import of {} at {} failed (attempt {}/{}): {}",
                        target.repository.full_name,
                        target.commit.sha.short(),
                        attempt,
                        max_attempts,
                        e
                    ),
                }
            }
            if imported > 0 {
                info!("Imported {}/{} repositories", imported, targets.len());
                return Ok(imported);
            }
            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }

        Err(OrchestratorError::ImportFailed {
            attempts: max_attempts,
        })
    }
}

/// Reads the CSV artifact written by the analyzer.
pub struct ArtifactImporter {
    store: Arc<dyn Store>,
}

impl ArtifactImporter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

/// Sum the per-file rows of an artifact.
///
/// The first line is a header; each row is
/// `path,total_lines,ai_pure_lines,ai_blended_lines`. Paths may contain
/// commas, so the counts are taken from the right.
pub fn parse_artifact(contents: &str) -> Result<LineCounts, ImportError> {
    let mut counts = LineCounts::default();
    for (index, line) in contents.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.rsplitn(4, ',').collect();
        let [blended, pure, total, _path] = fields.as_slice() else {
            return Err(ImportError::Parse {
                line: index + 1,
                message: "expected 4 fields".to_string(),
            });
        };
        let number = |s: &str| {
            s.trim().parse::<u64>().map_err(|_| ImportError::Parse {
                line: index + 1,
                message: format!("invalid count {:?}", s),
            })
        };
        let (total, pure, blended) = (number(total)?, number(pure)?, number(blended)?);
        let overflow = || ImportError::Parse {
            line: index + 1,
            message: "line counts overflow".to_string(),
        };
        if pure.checked_add(blended).ok_or_else(overflow)? > total {
            return Err(ImportError::Parse {
                line: index + 1,
                message: "AI lines exceed total lines".to_string(),
            });
        }
        counts = LineCounts {
            analyzed_files: counts.analyzed_files + 1,
            total: counts.total.checked_add(total).ok_or_else(overflow)?,
            ai_pure: counts.ai_pure.checked_add(pure).ok_or_else(overflow)?,
            ai_blended: counts.ai_blended.checked_add(blended).ok_or_else(overflow)?,
        };
    }
    Ok(counts)
}

#[async_trait]
impl ImportBackend for ArtifactImporter {
    async fn import(&self, target: &ImportTarget) -> Result<(), ImportError> {
        let contents = tokio::fs::read_to_string(&target.artifact)
            .await
            .map_err(|source| ImportError::Read {
                path: target.artifact.clone(),
                source,
            })?;
        let lines = parse_artifact(&contents)?;

        let mut commit = target.commit.clone();
        commit.status = CommitStatus::Analyzed;
        commit.failure_kind = None;
        commit.analysis_path = Some(target.artifact.clone());
        commit.lines = lines;
        self.store.update_commit(&commit).await?;

        self.store
            .cache_composition(
                target.pull_request.id,
                &CompositionPercentages::from_counts(&lines),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use aigate_core::{CommitSha, Provider, RepositoryId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImportBackend for FailingBackend {
        async fn import(&self, _target: &ImportTarget) -> Result<(), ImportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ImportError::Parse {
                line: 1,
                message: "broken".to_string(),
            })
        }
    }

    /// Fails for every repository except `ok_repository`.
    struct SelectiveBackend {
        ok_repository: RepositoryId,
    }

    #[async_trait]
    impl ImportBackend for SelectiveBackend {
        async fn import(&self, target: &ImportTarget) -> Result<(), ImportError> {
            if target.repository.id == self.ok_repository {
                Ok(())
            } else {
                Err(ImportError::Parse {
                    line: 1,
                    message: "broken".to_string(),
                })
            }
        }
    }

    async fn target(store: &InMemoryStore, repository_id: i64, artifact: PathBuf) -> ImportTarget {
        let sha = CommitSha::from("abc123");
        let commit = store
            .get_or_create_commit(RepositoryId(repository_id), &sha)
            .await
            .unwrap();
        let pull_request = store
            .upsert_pull_request(RepositoryId(repository_id), 42, &sha, &sha)
            .await
            .unwrap();
        ImportTarget {
            repository: RepositoryRecord {
                id: RepositoryId(repository_id),
                organization_id: 1,
                group_id: None,
                provider: Provider::GitHub,
                external_id: "99".to_string(),
                installation_id: None,
                full_name: format!("acme/repo-{}", repository_id),
                status_check_enabled: true,
            },
            commit,
            pull_request,
            artifact,
        }
    }

    #[test]
    fn test_backoff_schedule_doubles() {
        assert_eq!(
            backoff_schedule(3, Duration::from_secs(1)),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(
            backoff_schedule(4, Duration::from_millis(250)),
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000)
            ]
        );
        assert!(backoff_schedule(1, Duration::from_secs(1)).is_empty());
        assert!(backoff_schedule(0, Duration::from_secs(1)).is_empty());
    }

    /// Three attempts with sleeps of 1s then 2s, then give up.
    #[tokio::test(start_paused = true)]
    async fn test_always_failing_importer_is_called_three_times() {
        let store = InMemoryStore::new();
        let backend = Arc::new(FailingBackend {
            calls: AtomicUsize::new(0),
        });
        let importer = Importer::new(backend.clone(), ImportConfig::default());
        let targets = vec![target(&store, 1, PathBuf::from("/nonexistent.csv")).await];

        let start = tokio::time::Instant::now();
        let err = importer.import_data(&targets).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::ImportFailed { attempts: 3 }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_successful_repository_is_enough() {
        let store = InMemoryStore::new();
        let importer = Importer::new(
            Arc::new(SelectiveBackend {
                ok_repository: RepositoryId(2),
            }),
            ImportConfig::default(),
        );
        let targets = vec![
            target(&store, 1, PathBuf::from("/a.csv")).await,
            target(&store, 2, PathBuf::from("/b.csv")).await,
        ];
        let start = tokio::time::Instant::now();
        assert_eq!(importer.import_data(&targets).await.unwrap(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_parse_artifact() {
        let csv = "path,total_lines,ai_pure_lines,ai_blended_lines\n\
                   src/lib.rs,100,20,10\n\
                   src/a,b.rs,50,0,5\n\n";
        let counts = parse_artifact(csv).unwrap();
        assert_eq!(
            counts,
            LineCounts {
                analyzed_files: 2,
                total: 150,
                ai_pure: 20,
                ai_blended: 15,
            }
        );
    }

    #[test]
    fn test_parse_artifact_rejects_bad_rows() {
        let header = "path,total_lines,ai_pure_lines,ai_blended_lines\n";
        assert!(matches!(
            parse_artifact(&format!("{}src/lib.rs,10,x,0", header)),
            Err(ImportError::Parse { line: 2, .. })
        ));
        assert!(parse_artifact(&format!("{}src/lib.rs,10,8,8", header)).is_err());
        assert!(parse_artifact(&format!("{}10,8", header)).is_err());
        assert_eq!(parse_artifact(header).unwrap(), LineCounts::default());
    }

    #[test]
    fn test_parse_artifact_rejects_overflowing_counts() {
        let header = "path,total_lines,ai_pure_lines,ai_blended_lines\n";
        let max = u64::MAX;
        assert!(matches!(
            parse_artifact(&format!("{}a.rs,{},{},1", header, max, max)),
            Err(ImportError::Parse { line: 2, .. })
        ));
        assert!(matches!(
            parse_artifact(&format!("{}a.rs,{},0,0\nb.rs,1,0,0", header, max)),
            Err(ImportError::Parse { line: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_artifact_importer_updates_commit_and_pull_request() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("repository.csv");
        std::fs::write(
            &artifact,
            "path,total_lines,ai_pure_lines,ai_blended_lines\nsrc/lib.rs,200,50,30\n",
        )
        .unwrap();

        let store = Arc::new(InMemoryStore::new());
        let target = target(&store, 1, artifact.clone()).await;
        ArtifactImporter::new(store.clone())
            .import(&target)
            .await
            .unwrap();

        let commit = store
            .commit(RepositoryId(1), &CommitSha::from("abc123"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commit.status, CommitStatus::Analyzed);
        assert_eq!(commit.analysis_path, Some(artifact));
        assert_eq!(commit.lines.total, 200);

        let pr = store.pull_request(RepositoryId(1), 42).await.unwrap().unwrap();
        let composition = pr.composition.unwrap();
        assert_eq!(composition.pure, 25.0);
        assert_eq!(composition.overall, 40.0);
    }
}
