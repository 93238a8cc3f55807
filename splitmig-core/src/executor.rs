use std::future::Future;
use std::time::Duration;

use sqlx::{AnyConnection, Connection};

use crate::error::{MigrationResult, map_sqlx_error};
use crate::sql::{GUARD_FLAG, GUARD_STMT};

/// Fixed-delay retry settings for transient database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first one. Never below 1.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(1000))
    }
}

const TRANSIENT_MYSQL_CODES: &[&str] = &["1205", "1213", "2006", "2013"];
const CONNECTION_LOST_MYSQL_CODES: &[&str] = &["2006", "2013"];

/// Lock waits, deadlocks, dropped connections and busy SQLite files.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            if db
                .code()
                .is_some_and(|code| TRANSIENT_MYSQL_CODES.contains(&&*code))
            {
                return true;
            }
            let msg = db.message().to_ascii_lowercase();
            msg.contains("gone away")
                || msg.contains("lost connection")
                || msg.contains("database is locked")
                || msg.contains("database is busy")
                || msg.contains("deadlock")
        }
        _ => false,
    }
}

/// Errors after which the connection itself is unusable.
pub fn is_connection_lost(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            if db
                .code()
                .is_some_and(|code| CONNECTION_LOST_MYSQL_CODES.contains(&&*code))
            {
                return true;
            }
            let msg = db.message().to_ascii_lowercase();
            msg.contains("gone away") || msg.contains("lost connection")
        }
        _ => false,
    }
}

async fn back_off(policy: RetryPolicy, label: &str, attempt: u32, err: &sqlx::Error) {
    tracing::warn!(
        operation = "sql_retry",
        label = %label,
        attempt,
        error = %err,
        "splitmig retry"
    );
    tokio::time::sleep(policy.delay).await;
}

/// Runs `f` until it succeeds, fails with a non-transient error, or the policy runs out.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut f: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < policy.attempts => {
                back_off(policy, label, attempt, &err).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Something a script can be run against, one unit at a time.
#[allow(async_fn_in_trait)]
pub trait ScriptTarget {
    /// Whether string literals treat `\` as an escape character.
    fn backslash_escapes(&self) -> bool;

    async fn run(&mut self, statement: &str) -> Result<(), sqlx::Error>;

    /// Whether [`Self::reconnect`] can replace a lost connection.
    fn can_reconnect(&self) -> bool;

    async fn reconnect(&mut self) -> Result<(), sqlx::Error>;
}

/// A borrowed connection, reopened in place from `reconnect_url` when the
/// server drops it.
pub struct ScriptConnection<'c> {
    conn: &'c mut AnyConnection,
    reconnect_url: Option<&'c str>,
}

impl<'c> ScriptConnection<'c> {
    pub fn new(conn: &'c mut AnyConnection) -> Self {
        Self {
            conn,
            reconnect_url: None,
        }
    }

    pub fn reconnect_to(mut self, url: Option<&'c str>) -> Self {
        self.reconnect_url = url;
        self
    }
}

impl ScriptTarget for ScriptConnection<'_> {
    fn backslash_escapes(&self) -> bool {
        self.conn.backend_name().eq_ignore_ascii_case("mysql")
    }

    async fn run(&mut self, statement: &str) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(statement).execute(&mut *self.conn).await?;
        Ok(())
    }

    fn can_reconnect(&self) -> bool {
        self.reconnect_url.is_some()
    }

    async fn reconnect(&mut self) -> Result<(), sqlx::Error> {
        let Some(url) = self.reconnect_url else {
            return Ok(());
        };
        *self.conn = AnyConnection::connect(url).await?;
        tracing::info!(operation = "sql_reconnect", "splitmig retry");
        Ok(())
    }
}

/// Executes a possibly multi-statement script on `conn` without reconnecting.
pub async fn execute_script(
    conn: &mut AnyConnection,
    sql: &str,
    policy: RetryPolicy,
) -> MigrationResult<()> {
    run_script(&mut ScriptConnection::new(conn), sql, policy).await
}

/// Runs `script` unit by unit (see [`split_script`]). A transient failure
/// retries only the failing unit, so finished units never run twice. Lost
/// connections are retried only when the target can reconnect.
///
/// The error carries the text of the unit that failed.
pub async fn run_script<T: ScriptTarget>(
    target: &mut T,
    script: &str,
    policy: RetryPolicy,
) -> MigrationResult<()> {
    if script.trim().is_empty() {
        return Ok(());
    }
    for unit in split_script(script, target.backslash_escapes()) {
        run_unit(target, &unit, policy)
            .await
            .map_err(|err| map_sqlx_error(&unit, err))?;
    }
    Ok(())
}

async fn run_unit<T: ScriptTarget>(
    target: &mut T,
    unit: &str,
    policy: RetryPolicy,
) -> Result<(), sqlx::Error> {
    let mut attempt = 1u32;
    let mut reopen = false;
    loop {
        let result = if reopen {
            match target.reconnect().await {
                Ok(()) => target.run(unit).await,
                Err(err) => Err(err),
            }
        } else {
            target.run(unit).await
        };
        match result {
            Ok(()) => return Ok(()),
            Err(err)
                if is_transient(&err)
                    && attempt < policy.attempts
                    && (target.can_reconnect() || !is_connection_lost(&err)) =>
            {
                reopen = is_connection_lost(&err);
                back_off(policy, "statement", attempt, &err).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Splits a script into the units [`run_script`] executes one at a time.
///
/// Semicolons inside quotes, comments and `BEGIN ... END` bodies do not end a
/// unit. A guarded DDL block stays one unit because its statements share
/// session variables.
pub fn split_script(script: &str, backslash_escapes: bool) -> Vec<String> {
    let guard_start = format!("SET {}", GUARD_FLAG);
    let guard_end = format!("DEALLOCATE PREPARE {}", GUARD_STMT);

    let mut units = Vec::new();
    let mut guard: Option<String> = None;
    for statement in split_statements(script, backslash_escapes) {
        if let Some(block) = guard.as_mut() {
            block.push_str(";\n");
            block.push_str(&statement);
            if statement.starts_with(&guard_end) {
                units.extend(guard.take());
            }
        } else if statement.starts_with(&guard_start) {
            guard = Some(statement);
        } else {
            units.push(statement);
        }
    }
    units.extend(guard);
    units
}

fn split_statements(script: &str, backslash_escapes: bool) -> Vec<String> {
    let chars: Vec<char> = script.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' | '`' => {
                let end = quoted_end(&chars, i, backslash_escapes && c != '`');
                current.extend(&chars[i..end]);
                i = end;
            }
            '-' if next == Some('-') => i = line_end(&chars, i),
            '#' if backslash_escapes => i = line_end(&chars, i),
            '/' if next == Some('*') && chars.get(i + 2) != Some(&'!') => {
                current.push(' ');
                i = block_comment_end(&chars, i);
            }
            ';' if depth == 0 => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_owned());
                }
                current.clear();
                i += 1;
            }
            c if is_word_char(c) => {
                let end = word_end(&chars, i);
                let word: String = chars[i..end].iter().collect();
                current.push_str(&word);
                i = end;
                match word.to_ascii_uppercase().as_str() {
                    "BEGIN" if opens_block(&chars, i) => depth += 1,
                    "CASE" => depth += 1,
                    "END" => match next_word(&chars, i) {
                        Some((word, _)) if matches!(word.as_str(), "IF" | "LOOP" | "WHILE" | "REPEAT") => {}
                        Some((word, end)) if word == "CASE" => {
                            depth = depth.saturating_sub(1);
                            current.extend(&chars[i..end]);
                            i = end;
                        }
                        _ => depth = depth.saturating_sub(1),
                    },
                    _ => {}
                }
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }

    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_owned());
    }
    statements
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn word_end(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i < chars.len() && is_word_char(chars[i]) {
        i += 1;
    }
    i
}

fn quoted_end(chars: &[char], start: usize, backslash_escapes: bool) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if backslash_escapes => i += 2,
            c if c == quote && chars.get(i + 1) == Some(&quote) => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

fn line_end(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i < chars.len() && chars[i] != '\n' {
        i += 1;
    }
    i
}

fn block_comment_end(chars: &[char], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

/// Skips whitespace and comments.
fn skip_trivia(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1).copied()) {
            (c, _) if c.is_whitespace() => i += 1,
            ('-', Some('-')) | ('#', _) => i = line_end(chars, i),
            ('/', Some('*')) => i = block_comment_end(chars, i),
            _ => break,
        }
    }
    i
}

/// The upper-cased word after `start` and the index just past it.
fn next_word(chars: &[char], start: usize) -> Option<(String, usize)> {
    let begin = skip_trivia(chars, start);
    let end = word_end(chars, begin);
    (end > begin).then(|| (chars[begin..end].iter().collect::<String>().to_ascii_uppercase(), end))
}

/// `BEGIN` starts a compound statement unless it starts a transaction.
fn opens_block(chars: &[char], after: usize) -> bool {
    !matches!(
        next_word(chars, after).as_ref().map(|(word, _)| word.as_str()),
        None | Some("TRANSACTION" | "WORK" | "DEFERRED" | "IMMEDIATE" | "EXCLUSIVE")
    )
}
