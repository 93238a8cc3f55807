//! Applies, rolls back and reports migrations and seeds against their ledger.

use std::collections::HashSet;

use sqlx::{AnyConnection, Connection};

use crate::blueprint::{SqlPair, join_scripts};
use crate::context::Context;
use crate::dialect::Dialect;
use crate::error::{MigrationError, MigrationResult};
use crate::ledger::{ArtifactKind, Ledger, NewLedgerEntry};
use crate::metadata::Catalog;
use crate::migration::{MigrationBuilder, Step};
use crate::registry::{Registry, RegistryEntry};

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Maximum number of entries to apply (or plan) in this run.
    pub limit: Option<usize>,
    pub module: Option<String>,
    /// Diff and report without executing anything or touching the ledger.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    pub limit: Option<usize>,
    pub module: Option<String>,
}

/// The `up` script an apply would run for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedScript {
    pub name: String,
    pub up: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    /// Entries whose content key is already in the ledger.
    pub skipped: Vec<String>,
    pub planned: Vec<PlannedScript>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub rolled_back: Vec<String>,
    /// Total `down` scripts executed.
    pub operations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Applied,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusItem {
    pub name: String,
    pub module: Option<String>,
    pub file_path: String,
    pub state: EntryState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub items: Vec<StatusItem>,
    pub applied: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Apply,
    Skip,
    Rollback,
    Compensate,
}

fn event_name(kind: ArtifactKind, event: Event) -> &'static str {
    match (kind, event) {
        (ArtifactKind::Migration, Event::Apply) => "migration_apply",
        (ArtifactKind::Migration, Event::Skip) => "migration_skip",
        (ArtifactKind::Migration, Event::Rollback) => "migration_rollback",
        (ArtifactKind::Migration, Event::Compensate) => "migration_compensate",
        (ArtifactKind::Seed, Event::Apply) => "seed_apply",
        (ArtifactKind::Seed, Event::Skip) => "seed_skip",
        (ArtifactKind::Seed, Event::Rollback) => "seed_rollback",
        (ArtifactKind::Seed, Event::Compensate) => "seed_compensate",
    }
}

/// Folds `pre_sql`/`post_sql` into the first and last recorded operations.
fn attach_fragments(operations: &mut Vec<SqlPair>, pre: Option<&str>, post: Option<&str>) {
    let pre = pre.unwrap_or_default();
    let post = post.unwrap_or_default();
    if operations.is_empty() {
        let up = join_scripts(pre, post);
        if !up.trim().is_empty() {
            operations.push(SqlPair::new(up, ""));
        }
        return;
    }
    let first = &mut operations[0];
    first.up = join_scripts(pre, &first.up);
    let last = operations.len() - 1;
    let last = &mut operations[last];
    last.up = join_scripts(&last.up, post);
}

/// Runner for one artifact kind. [`Migrator::migrations`] and
/// [`Migrator::seeds`] differ only in the ledger tables they use.
#[derive(Debug, Clone)]
pub struct Migrator {
    kind: ArtifactKind,
    ledger: Ledger,
}

impl Migrator {
    pub fn new(kind: ArtifactKind, dialect: Dialect) -> Self {
        Self {
            kind,
            ledger: Ledger::new(kind, dialect),
        }
    }

    pub fn migrations(dialect: Dialect) -> Self {
        Self::new(ArtifactKind::Migration, dialect)
    }

    pub fn seeds(dialect: Dialect) -> Self {
        Self::new(ArtifactKind::Seed, dialect)
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Applies pending entries oldest first. Stops at the first failure.
    pub async fn apply<C: Catalog>(
        &self,
        ctx: &mut Context<C>,
        registry: &Registry,
        options: &ApplyOptions,
    ) -> MigrationResult<ApplyReport> {
        let mut conn = ctx.acquire().await?;
        self.ledger.ensure_tables(&mut conn).await?;
        let mut report = ApplyReport::default();

        for entry in registry.filtered(options.module.as_deref()) {
            let done = report.applied.len() + report.planned.len();
            if options.limit.is_some_and(|limit| done >= limit) {
                break;
            }

            let key = entry.content_key();
            if self.ledger.find_by_key(&mut conn, &key).await?.is_some() {
                tracing::debug!(
                    operation = event_name(self.kind, Event::Skip),
                    name = %entry.name,
                    module = ?entry.module,
                    "splitmig {}",
                    self.kind.label()
                );
                report.skipped.push(entry.name.clone());
                continue;
            }

            let mut builder = MigrationBuilder::new();
            entry.migration.apply(&mut builder)?;
            let problems = builder.validate();
            if !problems.is_empty() {
                return Err(MigrationError::Validation(problems));
            }

            if options.dry_run {
                let up = self.plan(ctx, &mut conn, &builder).await?;
                report.planned.push(PlannedScript {
                    name: entry.name.clone(),
                    up,
                });
                continue;
            }

            self.apply_one(ctx, &mut conn, entry, &key, &builder).await?;
            tracing::info!(
                operation = event_name(self.kind, Event::Apply),
                name = %entry.name,
                module = ?entry.module,
                "splitmig {}",
                self.kind.label()
            );
            report.applied.push(entry.name.clone());
        }
        Ok(report)
    }

    async fn apply_one<C: Catalog>(
        &self,
        ctx: &mut Context<C>,
        conn: &mut AnyConnection,
        entry: &RegistryEntry,
        key: &str,
        builder: &MigrationBuilder,
    ) -> MigrationResult<()> {
        if let Some(database) = builder.target_database() {
            ctx.ensure_database(conn, database).await?;
        }
        let mut executed = Vec::new();
        let mut outcome = self.execute_steps(ctx, conn, builder, &mut executed).await;
        if outcome.is_ok() {
            let mut operations = executed.clone();
            attach_fragments(
                &mut operations,
                builder.pre_sql_fragment(),
                builder.post_sql_fragment(),
            );
            outcome = self.record(conn, entry, key, &operations).await;
        }

        let Err(source) = outcome else {
            return Ok(());
        };
        if executed.is_empty() {
            return Err(source);
        }
        let compensated = self.compensate(ctx, conn, &entry.name, &executed).await;
        // Cached metadata may describe half-applied tables.
        ctx.reader.clear_cache()?;
        Err(MigrationError::PartialApply {
            name: entry.name.clone(),
            source: Box::new(source),
            compensated,
        })
    }

    /// Diffs and runs each step in turn so later steps see earlier ones.
    async fn execute_steps<C: Catalog>(
        &self,
        ctx: &mut Context<C>,
        conn: &mut AnyConnection,
        builder: &MigrationBuilder,
        executed: &mut Vec<SqlPair>,
    ) -> MigrationResult<()> {
        let diff = ctx.diff_context();

        if let Some(pre) = builder.pre_sql_fragment() {
            ctx.execute(conn, pre).await?;
        }
        for step in builder.steps() {
            let pair = match step {
                Step::Blueprint(blueprint) => {
                    match blueprint.obtain_sql(&mut ctx.reader, conn, &diff).await? {
                        Some(pair) => pair,
                        None => continue,
                    }
                }
                Step::Raw(pair) => pair.clone(),
            };
            if pair.is_empty() {
                continue;
            }
            ctx.execute(conn, &pair.up).await?;
            if let Step::Blueprint(blueprint) = step {
                ctx.reader.invalidate(blueprint.target());
            }
            executed.push(pair);
        }
        if let Some(post) = builder.post_sql_fragment() {
            ctx.execute(conn, post).await?;
        }
        Ok(())
    }

    async fn record(
        &self,
        conn: &mut AnyConnection,
        entry: &RegistryEntry,
        key: &str,
        operations: &[SqlPair],
    ) -> MigrationResult<()> {
        let mut tx = conn.begin().await?;
        self.ledger
            .record(
                &mut tx,
                &NewLedgerEntry {
                    name: &entry.name,
                    filepath: &entry.file_path,
                    key,
                    module: entry.module.as_deref(),
                },
                operations,
            )
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Runs the `down` of every executed step, newest first. Returns whether all succeeded.
    async fn compensate<C: Catalog>(
        &self,
        ctx: &Context<C>,
        conn: &mut AnyConnection,
        name: &str,
        executed: &[SqlPair],
    ) -> bool {
        let mut clean = true;
        for pair in executed.iter().rev() {
            if let Err(err) = ctx.execute(conn, &pair.down).await {
                tracing::error!(
                    operation = event_name(self.kind, Event::Compensate),
                    name = %name,
                    error = %err,
                    "splitmig {}",
                    self.kind.label()
                );
                clean = false;
            }
        }
        tracing::warn!(
            operation = event_name(self.kind, Event::Compensate),
            name = %name,
            steps = executed.len(),
            compensated = clean,
            "splitmig {}",
            self.kind.label()
        );
        clean
    }

    /// `up` script against the current catalog, without executing it.
    async fn plan<C: Catalog>(
        &self,
        ctx: &mut Context<C>,
        conn: &mut AnyConnection,
        builder: &MigrationBuilder,
    ) -> MigrationResult<String> {
        let diff = ctx.diff_context();
        let mut operations = Vec::new();
        for step in builder.steps() {
            let pair = match step {
                Step::Blueprint(blueprint) => blueprint.obtain_sql(&mut ctx.reader, conn, &diff).await?,
                Step::Raw(pair) => Some(pair.clone()),
            };
            if let Some(pair) = pair.filter(|p| !p.is_empty()) {
                operations.push(pair);
            }
        }
        attach_fragments(
            &mut operations,
            builder.pre_sql_fragment(),
            builder.post_sql_fragment(),
        );
        Ok(operations
            .iter()
            .fold(String::new(), |acc, op| join_scripts(&acc, &op.up)))
    }

    /// Reverts applied entries newest first, running each entry's recorded
    /// `down` scripts in reverse insertion order before deleting its ledger row.
    pub async fn rollback<C: Catalog>(
        &self,
        ctx: &mut Context<C>,
        options: &RollbackOptions,
    ) -> MigrationResult<RollbackReport> {
        let mut conn = ctx.acquire().await?;
        self.ledger.ensure_tables(&mut conn).await?;
        let entries = self
            .ledger
            .applied(&mut conn, options.module.as_deref())
            .await?;

        let mut report = RollbackReport::default();
        for entry in entries.into_iter().take(options.limit.unwrap_or(usize::MAX)) {
            let operations = self.ledger.operations(&mut conn, entry.id).await?;
            for op in operations.iter().rev() {
                ctx.execute(&mut conn, &op.down).await?;
            }

            let mut tx = Connection::begin(&mut *conn).await?;
            self.ledger.remove(&mut tx, entry.id).await?;
            tx.commit().await?;

            tracing::info!(
                operation = event_name(self.kind, Event::Rollback),
                name = %entry.name,
                module = ?entry.module,
                operations = operations.len(),
                "splitmig {}",
                self.kind.label()
            );
            report.operations += operations.len();
            report.rolled_back.push(entry.name);
        }

        if report.operations > 0 {
            ctx.reader.clear_cache()?;
        }
        Ok(report)
    }

    /// Registry entries against ledger rows, keyed by file path. Ledger rows
    /// whose file no longer exists are listed as applied after the known ones.
    pub async fn status<C: Catalog>(
        &self,
        ctx: &Context<C>,
        registry: &Registry,
        module: Option<&str>,
    ) -> MigrationResult<StatusReport> {
        let mut conn = ctx.acquire().await?;
        self.ledger.ensure_tables(&mut conn).await?;
        let applied = self.ledger.applied(&mut conn, module).await?;
        let applied_paths: HashSet<&str> = applied.iter().map(|e| e.filepath.as_str()).collect();

        let mut report = StatusReport::default();
        let mut known = HashSet::new();
        for entry in registry.filtered(module) {
            known.insert(entry.file_path.as_str());
            let state = if applied_paths.contains(entry.file_path.as_str()) {
                EntryState::Applied
            } else {
                EntryState::Pending
            };
            report.items.push(StatusItem {
                name: entry.name.clone(),
                module: entry.module.clone(),
                file_path: entry.file_path.clone(),
                state,
            });
        }
        for entry in applied.iter().rev() {
            if known.insert(entry.filepath.as_str()) {
                report.items.push(StatusItem {
                    name: entry.name.clone(),
                    module: entry.module.clone(),
                    file_path: entry.filepath.clone(),
                    state: EntryState::Applied,
                });
            }
        }

        report.applied = report
            .items
            .iter()
            .filter(|i| i.state == EntryState::Applied)
            .count();
        report.pending = report.items.len() - report.applied;
        Ok(report)
    }
}
