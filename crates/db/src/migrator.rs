//! Plain-SQL migration runner.
//!
//! Migrations are `<version>_<name>.sql` files in a single directory, applied in
//! version order and recorded in the `executed_migrations` table. A sibling
//! `<version>_<name>.down.sql` makes a migration reversible. Dependencies on
//! other migrations are declared with header lines of the form
//! `-- depends: <migration name>`.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::executed_migration::ExecutedMigration;

const DEPENDS_PREFIX: &str = "-- depends:";
const DOWN_SUFFIX: &str = ".down.sql";
const UP_SUFFIX: &str = ".sql";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migrations directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("invalid migration file name `{0}` (expected <version>_<name>.sql)")]
    InvalidFileName(String),
    #[error("duplicate migration version {0}")]
    DuplicateVersion(u64),
    #[error("migration `{migration}` depends on unknown migration `{dependency}`")]
    UnknownDependency {
        migration: String,
        dependency: String,
    },
    #[error("migration `{migration}` depends on `{dependency}` which is ordered after it")]
    DependencyOrder {
        migration: String,
        dependency: String,
    },
    #[error("checksum mismatch for executed migration `{0}`; the file changed after it ran")]
    ChecksumMismatch(String),
    #[error("migration `{0}` has no down script")]
    Irreversible(String),
    #[error("migration `{name}` failed: {source}")]
    Execution {
        name: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A migration discovered on disk.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u64,
    pub name: String,
    pub up_sql: String,
    pub down_sql: Option<String>,
    pub depends_on: Vec<String>,
    pub checksum: String,
}

impl Migration {
    pub fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Executed {
        executed_at: chrono::DateTime<Utc>,
        execution_time_ms: i64,
    },
    Pending,
    /// Recorded as executed but the file is gone.
    Missing,
}

#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub name: String,
    pub state: MigrationState,
}

#[derive(Debug, Clone)]
pub struct Migrator {
    dir: PathBuf,
    migrations: Vec<Migration>,
}

impl Migrator {
    /// Discover all migrations in `dir`. Dependencies are resolved by `run`,
    /// against what the database has already executed.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(MigrationError::MissingDirectory(dir));
        }

        let mut ups: Vec<(u64, String, PathBuf)> = Vec::new();
        let mut downs: HashMap<String, PathBuf> = HashMap::new();

        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if let Some(stem) = file_name.strip_suffix(DOWN_SUFFIX) {
                parse_version(stem)
                    .ok_or_else(|| MigrationError::InvalidFileName(file_name.to_string()))?;
                downs.insert(stem.to_string(), path.clone());
            } else if let Some(stem) = file_name.strip_suffix(UP_SUFFIX) {
                let version = parse_version(stem)
                    .ok_or_else(|| MigrationError::InvalidFileName(file_name.to_string()))?;
                ups.push((version, stem.to_string(), path.clone()));
            }
        }

        ups.sort_by_key(|(version, _, _)| *version);

        let mut seen = HashSet::new();
        let mut migrations = Vec::with_capacity(ups.len());
        for (version, name, path) in ups {
            if !seen.insert(version) {
                return Err(MigrationError::DuplicateVersion(version));
            }
            let up_sql = std::fs::read_to_string(&path)?;
            let down_sql = match downs.remove(&name) {
                Some(down_path) => Some(std::fs::read_to_string(down_path)?),
                None => None,
            };
            migrations.push(Migration {
                version,
                depends_on: parse_dependencies(&up_sql),
                checksum: checksum(&up_sql),
                name,
                up_sql,
                down_sql,
            });
        }

        for orphan in downs.keys() {
            warn!(migration = %orphan, "down script has no matching up script");
        }

        Ok(Self { dir, migrations })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Check the dependencies of the migrations about to run. A dependency is
    /// satisfied when it has already been executed or runs earlier in this
    /// batch. Pending runs in version order, so a dependency on a pending
    /// migration at or after its dependent (including a cycle) is an error.
    fn resolve_dependencies(
        pending: &[&Migration],
        executed: &HashMap<String, ExecutedMigration>,
    ) -> Result<(), MigrationError> {
        let pending_names: HashSet<&str> = pending.iter().map(|m| m.name.as_str()).collect();
        let mut scheduled: HashSet<&str> = HashSet::new();

        for migration in pending {
            for dependency in &migration.depends_on {
                if executed.contains_key(dependency) || scheduled.contains(dependency.as_str()) {
                    continue;
                }
                let error = if pending_names.contains(dependency.as_str()) {
                    MigrationError::DependencyOrder {
                        migration: migration.name.clone(),
                        dependency: dependency.clone(),
                    }
                } else {
                    MigrationError::UnknownDependency {
                        migration: migration.name.clone(),
                        dependency: dependency.clone(),
                    }
                };
                return Err(error);
            }
            scheduled.insert(migration.name.as_str());
        }
        Ok(())
    }

    /// Apply every pending migration. Returns the names that ran.
    pub async fn run(&self, pool: &SqlitePool) -> Result<Vec<String>, MigrationError> {
        ExecutedMigration::ensure_table(pool).await?;
        let executed: HashMap<String, ExecutedMigration> = ExecutedMigration::find_all(pool)
            .await?
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        for migration in &self.migrations {
            if let Some(record) = executed.get(&migration.name) {
                if record.checksum != migration.checksum {
                    return Err(MigrationError::ChecksumMismatch(migration.name.clone()));
                }
            }
        }

        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| !executed.contains_key(&m.name))
            .collect();
        Self::resolve_dependencies(&pending, &executed)?;

        let mut applied = Vec::new();
        for migration in pending {
            self.apply(pool, migration).await?;
            applied.push(migration.name.clone());
        }

        if applied.is_empty() {
            info!("database schema is up to date");
        } else {
            info!(count = applied.len(), "applied migrations");
        }
        Ok(applied)
    }

    async fn apply(&self, pool: &SqlitePool, migration: &Migration) -> Result<(), MigrationError> {
        let started = Instant::now();
        let execution_error = |source| MigrationError::Execution {
            name: migration.name.clone(),
            source,
        };

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(&migration.up_sql)
            .execute(&mut *tx)
            .await
            .map_err(execution_error)?;

        let elapsed_ms = started.elapsed().as_millis() as i64;
        ExecutedMigration::record(
            &mut *tx,
            &migration.name,
            &migration.checksum,
            Utc::now(),
            elapsed_ms,
        )
        .await?;
        tx.commit().await?;

        info!(
            migration = %migration.name,
            elapsed_ms,
            "applied migration"
        );
        Ok(())
    }

    /// Revert the most recent `steps` executed migrations, newest first.
    pub async fn rollback(
        &self,
        pool: &SqlitePool,
        steps: usize,
    ) -> Result<Vec<String>, MigrationError> {
        ExecutedMigration::ensure_table(pool).await?;
        let mut executed = ExecutedMigration::find_all(pool).await?;
        executed.sort_by_key(|m| std::cmp::Reverse(parse_version(&m.name).unwrap_or(0)));

        let by_name: HashMap<&str, &Migration> = self
            .migrations
            .iter()
            .map(|m| (m.name.as_str(), m))
            .collect();

        let mut reverted = Vec::new();
        for record in executed.into_iter().take(steps) {
            let down_sql = by_name
                .get(record.name.as_str())
                .and_then(|m| m.down_sql.as_deref())
                .ok_or_else(|| MigrationError::Irreversible(record.name.clone()))?;

            let mut tx = pool.begin().await?;
            sqlx::raw_sql(down_sql)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::Execution {
                    name: record.name.clone(),
                    source,
                })?;
            ExecutedMigration::remove(&mut *tx, &record.name).await?;
            tx.commit().await?;

            info!(migration = %record.name, "reverted migration");
            reverted.push(record.name);
        }
        Ok(reverted)
    }

    /// Report every known migration plus executed ones whose file vanished.
    pub async fn status(&self, pool: &SqlitePool) -> Result<Vec<MigrationStatus>, MigrationError> {
        ExecutedMigration::ensure_table(pool).await?;
        let mut executed: HashMap<String, ExecutedMigration> = ExecutedMigration::find_all(pool)
            .await?
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        let mut statuses: Vec<MigrationStatus> = self
            .migrations
            .iter()
            .map(|m| {
                let state = match executed.remove(&m.name) {
                    Some(record) => MigrationState::Executed {
                        executed_at: record.executed_at,
                        execution_time_ms: record.execution_time_ms,
                    },
                    None => MigrationState::Pending,
                };
                MigrationStatus {
                    name: m.name.clone(),
                    state,
                }
            })
            .collect();

        let mut missing: Vec<MigrationStatus> = executed
            .into_keys()
            .map(|name| MigrationStatus {
                name,
                state: MigrationState::Missing,
            })
            .collect();
        missing.sort_by(|a, b| a.name.cmp(&b.name));
        statuses.extend(missing);

        Ok(statuses)
    }

    /// Create an empty up/down pair for a new migration. Returns the up path.
    pub fn create(dir: impl AsRef<Path>, name: &str) -> Result<PathBuf, MigrationError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let slug = utils::text::slugify(name).replace('-', "_");
        if slug.is_empty() {
            return Err(MigrationError::InvalidFileName(name.to_string()));
        }
        let stem = format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S"), slug);

        let up_path = dir.join(format!("{stem}{UP_SUFFIX}"));
        let down_path = dir.join(format!("{stem}{DOWN_SUFFIX}"));
        std::fs::write(&up_path, format!("-- {stem}\n"))?;
        std::fs::write(&down_path, format!("-- revert {stem}\n"))?;
        Ok(up_path)
    }
}

fn parse_version(stem: &str) -> Option<u64> {
    let (version, name) = stem.split_once('_')?;
    if name.is_empty() || version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    version.parse().ok()
}

fn parse_dependencies(sql: &str) -> Vec<String> {
    sql.lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix(DEPENDS_PREFIX))
        .flat_map(|rest| rest.split(','))
        .map(|dep| dep.trim().to_string())
        .filter(|dep| !dep.is_empty())
        .collect()
}

fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}
