//! SQLite implementation of `Store`.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use aigate_core::{
    CheckRunId, Commit, CommitId, CommitSha, CommitStatus, CompositionPercentages, LineCounts,
    NewStatusCheck, OrganizationSettings, Provider, PullRequest, PullRequestId, RepositoryId,
    RepositoryRecord, RiskClass, Rule, RuleCondition, StatusCheck,
};

use super::{Store, StoreError};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::storage(
                        "create database directory",
                        format!("{}: {}", parent.display(), e),
                    )
                })?;
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "SQLite returned '{}' instead of 'wal'; the state directory must be on a \
                     filesystem that supports shared memory",
                    journal_mode
                ),
            ));
        }

        Self::configure(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::storage("open in-memory database", e.to_string()))?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_millis(5000))
            .map_err(|e| StoreError::storage("set busy_timeout", e.to_string()))?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS organizations (
                    id INTEGER PRIMARY KEY,
                    status_check_mark_as_failed INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY,
                    organization_id INTEGER NOT NULL,
                    group_id INTEGER,
                    provider TEXT NOT NULL CHECK(provider IN ('github', 'bitbucket', 'azure_devops')),
                    external_id TEXT NOT NULL,
                    installation_id INTEGER,
                    full_name TEXT NOT NULL,
                    status_check_enabled INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_repositories_external
                    ON repositories(provider, external_id);

                CREATE TABLE IF NOT EXISTS rules (
                    id INTEGER PRIMARY KEY,
                    organization_id INTEGER,
                    group_id INTEGER,
                    name TEXT NOT NULL,
                    risk TEXT NOT NULL CHECK(risk IN ('low', 'medium', 'high', 'strength')),
                    condition_json TEXT NOT NULL,
                    CHECK(organization_id IS NOT NULL OR group_id IS NOT NULL)
                );

                CREATE TABLE IF NOT EXISTS commits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repository_id INTEGER NOT NULL,
                    sha TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('pending', 'analyzed', 'failure')),
                    failure_kind TEXT,
                    analysis_path TEXT,
                    analyzed_files INTEGER NOT NULL DEFAULT 0,
                    total_lines INTEGER NOT NULL DEFAULT 0,
                    ai_pure_lines INTEGER NOT NULL DEFAULT 0,
                    ai_blended_lines INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(repository_id, sha)
                );

                CREATE TABLE IF NOT EXISTS pull_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repository_id INTEGER NOT NULL,
                    pr_number INTEGER NOT NULL,
                    base_sha TEXT NOT NULL,
                    head_sha TEXT NOT NULL,
                    is_closed INTEGER NOT NULL DEFAULT 0,
                    pure_pct REAL,
                    blended_pct REAL,
                    overall_pct REAL,
                    UNIQUE(repository_id, pr_number)
                );

                CREATE TABLE IF NOT EXISTS status_checks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pull_request_id INTEGER NOT NULL REFERENCES pull_requests(id),
                    check_run_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    external_data TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_status_checks_pr
                    ON status_checks(pull_request_id, id DESC);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&conn).map_err(|e| StoreError::storage(operation, e.to_string()))
        })
        .await
        .map_err(|e| StoreError::storage(operation, format!("blocking task failed: {}", e)))?
    }

    pub async fn insert_repository(&self, repository: &RepositoryRecord) -> Result<(), StoreError> {
        let r = repository.clone();
        self.with_conn("insert repository", move |conn| {
            conn.execute(
                "INSERT INTO repositories
                    (id, organization_id, group_id, provider, external_id, installation_id,
                     full_name, status_check_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    r.id.0,
                    r.organization_id,
                    r.group_id,
                    r.provider.as_str(),
                    r.external_id,
                    r.installation_id.map(|id| id as i64),
                    r.full_name,
                    r.status_check_enabled,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn set_organization_settings(
        &self,
        organization_id: i64,
        settings: OrganizationSettings,
    ) -> Result<(), StoreError> {
        self.with_conn("set organization settings", move |conn| {
            conn.execute(
                "INSERT INTO organizations (id, status_check_mark_as_failed) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    status_check_mark_as_failed = excluded.status_check_mark_as_failed",
                params![organization_id, settings.status_check_mark_as_failed],
            )
            .map(|_| ())
        })
        .await
    }

    /// Attach a rule to an organization or a repository group.
    pub async fn insert_rule(
        &self,
        organization_id: Option<i64>,
        group_id: Option<i64>,
        rule: &Rule,
    ) -> Result<(), StoreError> {
        let condition = serde_json::to_string(&rule.condition)
            .map_err(|e| StoreError::storage("encode rule condition", e.to_string()))?;
        let risk = risk_to_str(rule.risk);
        let id = rule.id;
        let name = rule.name.clone();
        self.with_conn("insert rule", move |conn| {
            conn.execute(
                "INSERT INTO rules (id, organization_id, group_id, name, risk, condition_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, organization_id, group_id, name, risk, condition],
            )
            .map(|_| ())
        })
        .await
    }

    async fn rules_where(&self, column: &'static str, id: i64) -> Result<Vec<Rule>, StoreError> {
        let sql = format!(
            "SELECT id, name, risk, condition_json FROM rules WHERE {} = ?1 ORDER BY id",
            column
        );
        let rows: Vec<(i64, String, String, String)> = self
            .with_conn("load rules", move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, name, risk, condition)| {
                let condition: RuleCondition = serde_json::from_str(&condition)
                    .map_err(|e| StoreError::corrupt("rules", e.to_string()))?;
                Ok(Rule {
                    id,
                    name,
                    risk: risk_from_str(&risk)?,
                    condition,
                })
            })
            .collect()
    }
}

fn risk_to_str(risk: RiskClass) -> &'static str {
    match risk {
        RiskClass::Low => "low",
        RiskClass::Medium => "medium",
        RiskClass::High => "high",
        RiskClass::Strength => "strength",
    }
}

fn risk_from_str(risk: &str) -> Result<RiskClass, StoreError> {
    match risk {
        "low" => Ok(RiskClass::Low),
        "medium" => Ok(RiskClass::Medium),
        "high" => Ok(RiskClass::High),
        "strength" => Ok(RiskClass::Strength),
        other => Err(StoreError::corrupt("rules", format!("unknown risk {}", other))),
    }
}

/// Raw commit columns; decoded outside the blocking closure.
struct CommitRow {
    id: i64,
    repository_id: i64,
    sha: String,
    status: String,
    failure_kind: Option<String>,
    analysis_path: Option<String>,
    lines: [i64; 4],
}

const COMMIT_COLUMNS: &str = "id, repository_id, sha, status, failure_kind, analysis_path, \
                              analyzed_files, total_lines, ai_pure_lines, ai_blended_lines";

fn read_commit_row(row: &Row<'_>) -> rusqlite::Result<CommitRow> {
    Ok(CommitRow {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        sha: row.get(2)?,
        status: row.get(3)?,
        failure_kind: row.get(4)?,
        analysis_path: row.get(5)?,
        lines: [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?],
    })
}

fn decode_commit(row: CommitRow) -> Result<Commit, StoreError> {
    let status: CommitStatus = row
        .status
        .parse()
        .map_err(|e: String| StoreError::corrupt("commits", e))?;
    let failure_kind = row
        .failure_kind
        .map(|k| k.parse())
        .transpose()
        .map_err(|e: String| StoreError::corrupt("commits", e))?;
    Ok(Commit {
        id: CommitId(row.id),
        repository_id: RepositoryId(row.repository_id),
        sha: CommitSha(row.sha),
        status,
        failure_kind,
        analysis_path: row.analysis_path.map(PathBuf::from),
        lines: LineCounts {
            analyzed_files: row.lines[0] as u64,
            total: row.lines[1] as u64,
            ai_pure: row.lines[2] as u64,
            ai_blended: row.lines[3] as u64,
        },
    })
}

const PULL_REQUEST_COLUMNS: &str =
    "id, repository_id, pr_number, base_sha, head_sha, is_closed, pure_pct, blended_pct, overall_pct";

fn read_pull_request(row: &Row<'_>) -> rusqlite::Result<PullRequest> {
    let pure: Option<f64> = row.get(6)?;
    let blended: Option<f64> = row.get(7)?;
    let overall: Option<f64> = row.get(8)?;
    let composition = match (pure, blended, overall) {
        (Some(pure), Some(blended), Some(overall)) => Some(CompositionPercentages {
            pure,
            blended,
            overall,
        }),
        _ => None,
    };
    Ok(PullRequest {
        id: PullRequestId(row.get(0)?),
        repository_id: RepositoryId(row.get(1)?),
        pr_number: row.get::<_, i64>(2)? as u64,
        base_sha: CommitSha(row.get(3)?),
        head_sha: CommitSha(row.get(4)?),
        is_closed: row.get(5)?,
        composition,
    })
}

/// Raw status-check columns; decoded outside the blocking closure.
type StatusCheckRow = (i64, i64, String, String, String, String);

const STATUS_CHECK_COLUMNS: &str =
    "id, pull_request_id, check_run_id, status, external_data, created_at";

fn read_status_check(row: &Row<'_>) -> rusqlite::Result<StatusCheckRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_status_check(row: StatusCheckRow) -> Result<StatusCheck, StoreError> {
    let (id, pull_request_id, check_run_id, status, external_data, created_at) = row;
    Ok(StatusCheck {
        id,
        pull_request_id: PullRequestId(pull_request_id),
        check_run_id: CheckRunId(check_run_id),
        status: status
            .parse()
            .map_err(|e: String| StoreError::corrupt("status_checks", e))?,
        external_data: serde_json::from_str(&external_data)
            .map_err(|e| StoreError::corrupt("status_checks", e.to_string()))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StoreError::corrupt("status_checks", e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_repositories(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Vec<RepositoryRecord>, StoreError> {
        let external_id = external_id.to_string();
        let rows: Vec<(i64, i64, Option<i64>, String, Option<i64>, String, bool)> = self
            .with_conn("find repositories", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, organization_id, group_id, external_id, installation_id,
                            full_name, status_check_enabled
                     FROM repositories WHERE provider = ?1 AND external_id = ?2 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![provider.as_str(), external_id], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, organization_id, group_id, external_id, installation_id, full_name, enabled)| {
                    RepositoryRecord {
                        id: RepositoryId(id),
                        organization_id,
                        group_id,
                        provider,
                        external_id,
                        installation_id: installation_id.map(|i| i as u64),
                        full_name,
                        status_check_enabled: enabled,
                    }
                },
            )
            .collect())
    }

    async fn organization_settings(
        &self,
        organization_id: i64,
    ) -> Result<OrganizationSettings, StoreError> {
        let mark_as_failed: Option<bool> = self
            .with_conn("load organization settings", move |conn| {
                conn.query_row(
                    "SELECT status_check_mark_as_failed FROM organizations WHERE id = ?1",
                    params![organization_id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        Ok(mark_as_failed
            .map(|status_check_mark_as_failed| OrganizationSettings {
                status_check_mark_as_failed,
            })
            .unwrap_or_default())
    }

    async fn organization_rules(&self, organization_id: i64) -> Result<Vec<Rule>, StoreError> {
        self.rules_where("organization_id", organization_id).await
    }

    async fn group_rules(&self, group_id: i64) -> Result<Vec<Rule>, StoreError> {
        self.rules_where("group_id", group_id).await
    }

    async fn get_or_create_commit(
        &self,
        repository_id: RepositoryId,
        sha: &CommitSha,
    ) -> Result<Commit, StoreError> {
        let sha = sha.0.clone();
        let row = self
            .with_conn("get or create commit", move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO commits (repository_id, sha, status)
                     VALUES (?1, ?2, 'pending')",
                    params![repository_id.0, sha],
                )?;
                conn.query_row(
                    &format!(
                        "SELECT {} FROM commits WHERE repository_id = ?1 AND sha = ?2",
                        COMMIT_COLUMNS
                    ),
                    params![repository_id.0, sha],
                    read_commit_row,
                )
            })
            .await?;
        decode_commit(row)
    }

    async fn commit(
        &self,
        repository_id: RepositoryId,
        sha: &CommitSha,
    ) -> Result<Option<Commit>, StoreError> {
        let sha = sha.0.clone();
        let row = self
            .with_conn("load commit", move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM commits WHERE repository_id = ?1 AND sha = ?2",
                        COMMIT_COLUMNS
                    ),
                    params![repository_id.0, sha],
                    read_commit_row,
                )
                .optional()
            })
            .await?;
        row.map(decode_commit).transpose()
    }

    async fn update_commit(&self, commit: &Commit) -> Result<(), StoreError> {
        let c = commit.clone();
        let changed = self
            .with_conn("update commit", move |conn| {
                conn.execute(
                    "UPDATE commits SET status = ?2, failure_kind = ?3, analysis_path = ?4,
                        analyzed_files = ?5, total_lines = ?6, ai_pure_lines = ?7,
                        ai_blended_lines = ?8
                     WHERE id = ?1",
                    params![
                        c.id.0,
                        c.status.as_str(),
                        c.failure_kind.map(|k| k.as_str()),
                        c.analysis_path.map(|p| p.to_string_lossy().into_owned()),
                        c.lines.analyzed_files as i64,
                        c.lines.total as i64,
                        c.lines.ai_pure as i64,
                        c.lines.ai_blended as i64,
                    ],
                )
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::not_found(format!("commit {}", commit.id.0)));
        }
        Ok(())
    }

    async fn upsert_pull_request(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
        base_sha: &CommitSha,
        head_sha: &CommitSha,
    ) -> Result<PullRequest, StoreError> {
        let base = base_sha.0.clone();
        let head = head_sha.0.clone();
        self.with_conn("upsert pull request", move |conn| {
            conn.execute(
                "INSERT INTO pull_requests (repository_id, pr_number, base_sha, head_sha)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(repository_id, pr_number) DO UPDATE SET
                    base_sha = excluded.base_sha,
                    head_sha = excluded.head_sha",
                params![repository_id.0, pr_number as i64, base, head],
            )?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM pull_requests WHERE repository_id = ?1 AND pr_number = ?2",
                    PULL_REQUEST_COLUMNS
                ),
                params![repository_id.0, pr_number as i64],
                read_pull_request,
            )
        })
        .await
    }

    async fn pull_request(
        &self,
        repository_id: RepositoryId,
        pr_number: u64,
    ) -> Result<Option<PullRequest>, StoreError> {
        self.with_conn("load pull request", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM pull_requests WHERE repository_id = ?1 AND pr_number = ?2",
                    PULL_REQUEST_COLUMNS
                ),
                params![repository_id.0, pr_number as i64],
                read_pull_request,
            )
            .optional()
        })
        .await
    }

    async fn set_pull_requests_closed(
        &self,
        repository_ids: &[RepositoryId],
        pr_number: u64,
        closed: bool,
    ) -> Result<usize, StoreError> {
        if repository_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = repository_ids.iter().map(|id| id.0).collect();
        self.with_conn("set pull requests closed", move |conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "UPDATE pull_requests SET is_closed = {}
                 WHERE pr_number = {} AND is_closed != {} AND repository_id IN ({})",
                closed as i64, pr_number as i64, closed as i64, placeholders
            );
            conn.execute(&sql, params_from_iter(ids.iter()))
        })
        .await
    }

    async fn cache_composition(
        &self,
        pull_request_id: PullRequestId,
        composition: &CompositionPercentages,
    ) -> Result<(), StoreError> {
        let pct = *composition;
        let changed = self
            .with_conn("cache composition", move |conn| {
                conn.execute(
                    "UPDATE pull_requests SET pure_pct = ?2, blended_pct = ?3, overall_pct = ?4
                     WHERE id = ?1",
                    params![pull_request_id.0, pct.pure, pct.blended, pct.overall],
                )
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::not_found(format!(
                "pull request {}",
                pull_request_id.0
            )));
        }
        Ok(())
    }

    async fn latest_status_check(
        &self,
        pull_request_ids: &[PullRequestId],
    ) -> Result<Option<StatusCheck>, StoreError> {
        if pull_request_ids.is_empty() {
            return Ok(None);
        }
        let ids: Vec<i64> = pull_request_ids.iter().map(|id| id.0).collect();
        let row = self
            .with_conn("latest status check", move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql = format!(
                    "SELECT {} FROM status_checks WHERE pull_request_id IN ({})
                     ORDER BY id DESC LIMIT 1",
                    STATUS_CHECK_COLUMNS, placeholders
                );
                conn.query_row(&sql, params_from_iter(ids.iter()), read_status_check)
                    .optional()
            })
            .await?;
        row.map(decode_status_check).transpose()
    }

    async fn insert_status_check(&self, check: NewStatusCheck) -> Result<StatusCheck, StoreError> {
        let external_data = serde_json::to_string(&check.external_data)
            .map_err(|e| StoreError::storage("encode external data", e.to_string()))?;
        let created_at = Utc::now();
        let created_at_text = created_at.to_rfc3339();
        let status = check.status.as_str();
        let pull_request_id = check.pull_request_id.0;
        let check_run_id = check.check_run_id.0.clone();
        let id = self
            .with_conn("insert status check", move |conn| {
                conn.execute(
                    "INSERT INTO status_checks
                        (pull_request_id, check_run_id, status, external_data, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![pull_request_id, check_run_id, status, external_data, created_at_text],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(StatusCheck {
            id,
            pull_request_id: check.pull_request_id,
            check_run_id: check.check_run_id,
            status: check.status,
            external_data: check.external_data,
            created_at,
        })
    }

    async fn status_checks(
        &self,
        pull_request_id: PullRequestId,
    ) -> Result<Vec<StatusCheck>, StoreError> {
        let rows = self
            .with_conn("load status checks", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM status_checks WHERE pull_request_id = ?1 ORDER BY id",
                    STATUS_CHECK_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![pull_request_id.0], read_status_check)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_status_check).collect()
    }
}
