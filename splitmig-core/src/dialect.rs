use crate::error::{MigrationError, MigrationResult};
use crate::value::Value;

/// The SQL flavour a connection speaks.
///
/// The dialect decides identifier quoting, literal escaping and whether
/// existence-guarded DDL can be expressed server-side. SQLite tables get their
/// keys at creation time only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    /// Picks the dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> MigrationResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(MigrationError::Message(format!(
                "unsupported database scheme '{}', expected mysql:// or sqlite:",
                other
            ))),
        }
    }

    /// Returns the placeholder for a bound parameter.
    pub fn placeholder(&self) -> &'static str {
        "?"
    }

    /// Quotes an identifier (table/column name). Dotted names are quoted per segment.
    pub fn quote_identifier(&self, ident: &str) -> String {
        ident
            .split('.')
            .map(|part| match self {
                Self::MySql => format!("`{}`", part.replace('`', "``")),
                Self::Sqlite => format!("\"{}\"", part.replace('"', "\"\"")),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Escapes a raw string so it can be placed between single quotes.
    pub fn escape_string(&self, raw: &str) -> String {
        match self {
            Self::MySql => {
                let mut out = String::with_capacity(raw.len() + 8);
                for ch in raw.chars() {
                    match ch {
                        '\0' => out.push_str("\\0"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\\' => out.push_str("\\\\"),
                        '\'' => out.push_str("\\'"),
                        '"' => out.push_str("\\\""),
                        '\x1a' => out.push_str("\\Z"),
                        other => out.push(other),
                    }
                }
                out
            }
            Self::Sqlite => raw.replace('\'', "''"),
        }
    }

    /// Renders a string as a quoted, escaped SQL literal.
    pub fn quote_string(&self, raw: &str) -> String {
        format!("'{}'", self.escape_string(raw))
    }

    /// Renders a value as an inline SQL literal.
    pub fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_owned(),
            Value::Bool(true) => "1".to_owned(),
            Value::Bool(false) => "0".to_owned(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) if v.is_finite() => v.to_string(),
            Value::Float(_) => "NULL".to_owned(),
            Value::Text(v) => self.quote_string(v),
            Value::Uuid(v) => self.quote_string(&v.to_string()),
            Value::DateTime(v) => self.quote_string(&v.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }

    /// Statement creating a database when the engine has that concept.
    pub fn ensure_database_sql(&self, name: &str) -> Option<String> {
        match self {
            Self::MySql => Some(format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                self.quote_identifier(name)
            )),
            Self::Sqlite => None,
        }
    }

    /// Whether existence checks can be embedded in the emitted SQL.
    pub fn supports_guarded_ddl(&self) -> bool {
        matches!(self, Self::MySql)
    }
}
