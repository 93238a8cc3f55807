use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::value::Value;

/// Logical column datatype understood by the blueprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Text,
    Int,
    Bigint,
    Decimal,
    Float,
    Date,
    Datetime,
    Time,
    Timestamp,
    #[serde(alias = "boolean")]
    Bool,
    Blob,
    Json,
    Uuid,
}

impl ColumnType {
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int | Self::Bigint)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            Self::Date | Self::Datetime | Self::Time | Self::Timestamp
        )
    }

    /// Whether the type carries a character set and collation.
    pub fn is_textual(&self) -> bool {
        matches!(self, Self::String | Self::Text)
    }

    /// Whether `length` (and `scale`) are part of the definition.
    pub fn takes_length(&self) -> bool {
        matches!(self, Self::String | Self::Decimal)
    }

    fn default_length(&self) -> (Option<u32>, Option<u32>) {
        match self {
            Self::String => (Some(255), None),
            Self::Decimal => (Some(10), Some(2)),
            _ => (None, None),
        }
    }

    /// Native MySQL type name, without length.
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::String => "VARCHAR",
            Self::Text => "TEXT",
            Self::Int => "INT",
            Self::Bigint => "BIGINT",
            Self::Decimal => "DECIMAL",
            Self::Float => "FLOAT",
            Self::Date => "DATE",
            Self::Datetime => "DATETIME",
            Self::Time => "TIME",
            Self::Timestamp => "TIMESTAMP",
            Self::Bool => "TINYINT(1)",
            Self::Blob => "LONGBLOB",
            Self::Json => "JSON",
            Self::Uuid => "CHAR(36)",
        }
    }
}

/// Result of parsing a declared type such as `int unsigned` or `varchar(64)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclaredType {
    pub column_type: ColumnType,
    pub length: Option<u32>,
    pub scale: Option<u32>,
    pub unsigned: bool,
}

/// Parses a catalog type declaration (MySQL `COLUMN_TYPE` or SQLite declared type).
pub fn parse_declared_type(declared: &str) -> DeclaredType {
    let lower = declared.trim().to_ascii_lowercase();
    let unsigned = lower.contains("unsigned");
    let base_end = lower
        .find(|c: char| c == '(' || c.is_whitespace())
        .unwrap_or(lower.len());
    let base = &lower[..base_end];
    let args: Vec<u32> = match (lower.find('('), lower.find(')')) {
        (Some(open), Some(close)) if close > open => lower[open + 1..close]
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect(),
        _ => Vec::new(),
    };
    let first = args.first().copied();

    let (column_type, length, scale) = match base {
        "varchar" | "nvarchar" | "character varying" => {
            (ColumnType::String, first.or(Some(255)), None)
        }
        "char" | "nchar" | "character" if first == Some(36) => (ColumnType::Uuid, None, None),
        "char" | "nchar" | "character" => (ColumnType::String, first.or(Some(1)), None),
        "uuid" => (ColumnType::Uuid, None, None),
        "tinyint" if first == Some(1) => (ColumnType::Bool, None, None),
        "bool" | "boolean" => (ColumnType::Bool, None, None),
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" => (ColumnType::Int, None, None),
        "bigint" => (ColumnType::Bigint, None, None),
        "decimal" | "numeric" => (
            ColumnType::Decimal,
            first.or(Some(10)),
            args.get(1).copied().or(Some(0)),
        ),
        "float" | "double" | "real" => (ColumnType::Float, None, None),
        "date" => (ColumnType::Date, None, None),
        "datetime" => (ColumnType::Datetime, None, None),
        "time" => (ColumnType::Time, None, None),
        "timestamp" => (ColumnType::Timestamp, None, None),
        "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
            (ColumnType::Blob, None, None)
        }
        "json" => (ColumnType::Json, None, None),
        _ => (ColumnType::Text, None, None),
    };

    DeclaredType {
        column_type,
        length,
        scale,
        unsigned,
    }
}

/// A column default: either a literal or the engine's current timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultValue {
    Literal(Value),
    CurrentTimestamp,
}

impl DefaultValue {
    fn canonical(&self) -> Option<String> {
        match self {
            Self::Literal(value) => value.canonical(),
            Self::CurrentTimestamp => Some("CURRENT_TIMESTAMP".to_owned()),
        }
    }

    fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            Self::Literal(value) => dialect.literal(value),
            Self::CurrentTimestamp => "CURRENT_TIMESTAMP".to_owned(),
        }
    }
}

/// Interprets the default expression a catalog reports for a column.
pub fn parse_catalog_default(raw: Option<&str>, column_type: ColumnType) -> Option<DefaultValue> {
    let raw = raw?.trim();
    let upper = raw.to_ascii_uppercase();
    if upper == "NULL" {
        return None;
    }
    if upper.starts_with("CURRENT_TIMESTAMP") || upper == "NOW()" {
        return Some(DefaultValue::CurrentTimestamp);
    }
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .map(|s| s.replace("''", "'"));
    let text = unquoted.as_deref().unwrap_or(raw);
    let value = match column_type {
        ColumnType::Int | ColumnType::Bigint | ColumnType::Bool => text
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(text.to_owned())),
        ColumnType::Decimal | ColumnType::Float => text
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Text(text.to_owned())),
        _ => Value::Text(text.to_owned()),
    };
    Some(DefaultValue::Literal(value))
}

/// Metadata about a database column, shared by the catalog and the blueprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// The name of the column.
    pub name: String,
    pub column_type: ColumnType,
    /// VARCHAR length or DECIMAL precision.
    pub length: Option<u32>,
    /// DECIMAL scale.
    pub scale: Option<u32>,
    pub unsigned: bool,
    /// Whether the column can contain NULL values.
    pub nullable: bool,
    pub auto_increment: bool,
    pub default: Option<DefaultValue>,
    pub charset: Option<String>,
    pub collation: Option<String>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let (length, scale) = column_type.default_length();
        Self {
            name: name.into(),
            column_type,
            length,
            scale,
            unsigned: false,
            nullable: false,
            auto_increment: false,
            default: None,
            charset: None,
            collation: None,
        }
    }

    /// Returns true when `self` (the desired state) needs a change to match `current`.
    ///
    /// Auto-increment is excluded; it is reconciled in its own DDL phase. A charset
    /// or collation left unset on the desired side accepts whatever the table uses.
    pub fn differs_from(&self, current: &ColumnDefinition) -> bool {
        let length_differs = self.column_type.takes_length()
            && (self.length != current.length
                || (self.column_type == ColumnType::Decimal && self.scale != current.scale));
        let charset_differs = self
            .charset
            .as_ref()
            .is_some_and(|c| Some(c) != current.charset.as_ref());
        let collation_differs = self
            .collation
            .as_ref()
            .is_some_and(|c| Some(c) != current.collation.as_ref());
        let default_of = |d: &Option<DefaultValue>| d.as_ref().and_then(DefaultValue::canonical);

        self.column_type != current.column_type
            || length_differs
            || (self.column_type.is_integer() && self.unsigned != current.unsigned)
            || self.nullable != current.nullable
            || default_of(&self.default) != default_of(&current.default)
            || charset_differs
            || collation_differs
    }

    /// Type portion of the definition, e.g. `VARCHAR(255)` or `INT UNSIGNED`.
    pub fn type_sql(&self) -> String {
        let mut sql = match (self.column_type, self.length, self.scale) {
            (ColumnType::String, Some(len), _) => format!("VARCHAR({})", len),
            (ColumnType::Decimal, Some(p), Some(s)) => format!("DECIMAL({},{})", p, s),
            (ColumnType::Decimal, Some(p), None) => format!("DECIMAL({})", p),
            (other, _, _) => other.sql_name().to_owned(),
        };
        if self.unsigned && self.column_type.is_integer() {
            sql.push_str(" UNSIGNED");
        }
        sql
    }

    /// Full column definition as used by CREATE TABLE, ADD COLUMN and MODIFY COLUMN.
    pub fn to_sql(&self, dialect: Dialect, with_auto_increment: bool) -> String {
        let mut sql = format!("{} {}", dialect.quote_identifier(&self.name), self.type_sql());
        if dialect == Dialect::MySql && self.column_type.is_textual() {
            if let Some(charset) = &self.charset {
                sql.push_str(" CHARACTER SET ");
                sql.push_str(charset);
            }
            if let Some(collation) = &self.collation {
                sql.push_str(" COLLATE ");
                sql.push_str(collation);
            }
        }
        sql.push_str(if self.nullable { " NULL" } else { " NOT NULL" });
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.to_sql(dialect));
        }
        if with_auto_increment && self.auto_increment {
            sql.push_str(" AUTO_INCREMENT");
        }
        sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Primary,
    Index,
    Unique,
}

/// Metadata about a database index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// The name of the index. Primary keys are always named `PRIMARY`.
    pub name: String,
    pub kind: IndexKind,
    /// The columns included in the index, in index order.
    pub columns: Vec<String>,
}

impl IndexDefinition {
    pub const PRIMARY: &'static str = "PRIMARY";

    pub fn new(name: impl Into<String>, kind: IndexKind, columns: Vec<String>) -> Self {
        let name = match kind {
            IndexKind::Primary => Self::PRIMARY.to_owned(),
            _ => name.into(),
        };
        Self {
            name,
            kind,
            columns,
        }
    }
}

/// Action taken by a foreign key on update/delete of the referenced row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
    #[default]
    Restrict,
    Cascade,
    SetNull,
    NoAction,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::NoAction => "NO ACTION",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().replace('_', " ").as_str() {
            "CASCADE" => Self::Cascade,
            "SET NULL" => Self::SetNull,
            "NO ACTION" => Self::NoAction,
            _ => Self::Restrict,
        }
    }

    /// InnoDB treats RESTRICT and NO ACTION identically.
    fn equivalent(&self, other: &Self) -> bool {
        let normalize = |a: &Self| match a {
            Self::NoAction => Self::Restrict,
            other => *other,
        };
        normalize(self) == normalize(other)
    }
}

/// Metadata about a foreign key relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDefinition {
    pub name: String,
    /// The columns in the current table.
    pub columns: Vec<String>,
    /// The table being referenced.
    pub referenced_table: String,
    /// The referenced columns, positionally matching `columns`.
    pub referenced_columns: Vec<String>,
    pub on_update: ReferentialAction,
    pub on_delete: ReferentialAction,
}

impl ForeignKeyDefinition {
    pub fn same_as(&self, other: &ForeignKeyDefinition) -> bool {
        self.columns == other.columns
            && self.referenced_table.eq_ignore_ascii_case(&other.referenced_table)
            && self.referenced_columns == other.referenced_columns
            && self.on_update.equivalent(&other.on_update)
            && self.on_delete.equivalent(&other.on_delete)
    }
}

/// A foreign key declared on another table that points at this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyReference {
    pub table: String,
    pub foreign_key: ForeignKeyDefinition,
}

/// Metadata about a database table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// The name of the table.
    pub name: String,
    pub charset: Option<String>,
    pub collation: Option<String>,
    /// The columns in the table, in ordinal order.
    pub columns: Vec<ColumnDefinition>,
    pub indexes: Vec<IndexDefinition>,
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    /// Foreign keys on other tables referencing this table.
    pub referenced_by: Vec<ForeignKeyReference>,
}

impl TableMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            charset: None,
            collation: None,
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            referenced_by: Vec::new(),
        }
    }

    /// Returns a column by name if it exists in the table.
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn primary_key(&self) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|i| i.kind == IndexKind::Primary)
    }

    /// Finds a foreign key by name, falling back to its local column set.
    pub fn foreign_key(&self, name: &str, columns: &[String]) -> Option<&ForeignKeyDefinition> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.name == name)
            .or_else(|| self.foreign_keys.iter().find(|fk| fk.columns == columns))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureArg {
    pub name: String,
    pub sql_type: String,
}

/// A stored procedure as declared or as read back from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureDefinition {
    pub name: String,
    pub args: Vec<ProcedureArg>,
    pub output: Option<ProcedureArg>,
    /// Statements between BEGIN and END.
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mysql_column_types() {
        let t = parse_declared_type("int(10) unsigned");
        assert_eq!(t.column_type, ColumnType::Int);
        assert!(t.unsigned);
        assert_eq!(t.length, None);

        let t = parse_declared_type("varchar(64)");
        assert_eq!((t.column_type, t.length), (ColumnType::String, Some(64)));

        let t = parse_declared_type("decimal(12,4)");
        assert_eq!(
            (t.column_type, t.length, t.scale),
            (ColumnType::Decimal, Some(12), Some(4))
        );

        assert_eq!(parse_declared_type("tinyint(1)").column_type, ColumnType::Bool);
        assert_eq!(parse_declared_type("char(36)").column_type, ColumnType::Uuid);
        assert_eq!(parse_declared_type("longtext").column_type, ColumnType::Text);
        assert_eq!(parse_declared_type("BIGINT UNSIGNED").column_type, ColumnType::Bigint);
    }

    #[test]
    fn catalog_defaults_are_typed() {
        assert_eq!(parse_catalog_default(None, ColumnType::Int), None);
        assert_eq!(parse_catalog_default(Some("NULL"), ColumnType::Text), None);
        assert_eq!(
            parse_catalog_default(Some("0"), ColumnType::Int),
            Some(DefaultValue::Literal(Value::Int(0)))
        );
        assert_eq!(
            parse_catalog_default(Some("current_timestamp()"), ColumnType::Datetime),
            Some(DefaultValue::CurrentTimestamp)
        );
        assert_eq!(
            parse_catalog_default(Some("'draft'"), ColumnType::String),
            Some(DefaultValue::Literal(Value::from("draft")))
        );
    }

    #[test]
    fn column_sql_renders_full_definition() {
        let mut col = ColumnDefinition::new("qty", ColumnType::Int);
        col.unsigned = true;
        col.nullable = true;
        assert_eq!(col.to_sql(Dialect::MySql, true), "`qty` INT UNSIGNED NULL");

        let mut id = ColumnDefinition::new("id", ColumnType::Bigint);
        id.auto_increment = true;
        assert_eq!(id.to_sql(Dialect::MySql, false), "`id` BIGINT NOT NULL");
        assert_eq!(
            id.to_sql(Dialect::MySql, true),
            "`id` BIGINT NOT NULL AUTO_INCREMENT"
        );
    }

    #[test]
    fn differs_ignores_unset_charset_and_auto_increment() {
        let desired = ColumnDefinition::new("name", ColumnType::String);
        let mut current = desired.clone();
        current.charset = Some("utf8mb4".to_owned());
        current.auto_increment = true;
        assert!(!desired.differs_from(&current));

        current.length = Some(100);
        assert!(desired.differs_from(&current));
    }

    #[test]
    fn restrict_matches_no_action() {
        let a = ForeignKeyDefinition {
            name: "fk".to_owned(),
            columns: vec!["user_id".to_owned()],
            referenced_table: "users".to_owned(),
            referenced_columns: vec!["id".to_owned()],
            on_update: ReferentialAction::Restrict,
            on_delete: ReferentialAction::Cascade,
        };
        let mut b = a.clone();
        b.on_update = ReferentialAction::NoAction;
        assert!(a.same_as(&b));
        b.on_delete = ReferentialAction::SetNull;
        assert!(!a.same_as(&b));
    }
}
