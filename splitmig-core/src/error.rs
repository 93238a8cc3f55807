use std::fmt;

/// Which kind of blueprint a validation problem belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlueprintKind {
    Table,
    Column,
    Index,
    ForeignKey,
    Procedure,
    Seed,
    /// A configuration value rather than a blueprint.
    Setting,
}

impl fmt::Display for BlueprintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Table => "table",
            Self::Column => "column",
            Self::Index => "index",
            Self::ForeignKey => "foreign key",
            Self::Procedure => "procedure",
            Self::Seed => "seed",
            Self::Setting => "setting",
        };
        f.write_str(label)
    }
}

/// A single blueprint consistency problem, raised before any SQL is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: BlueprintKind,
    /// Name of the offending blueprint (column name, index name, ...).
    pub name: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: BlueprintKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': {}", self.kind, self.name, self.message)
    }
}

/// Migration engine error type with actionable variants.
#[derive(Debug)]
pub enum MigrationError {
    /// The database user cannot read the schema catalog.
    CatalogAccess { view: String, source: sqlx::Error },
    /// A statement failed after retries were exhausted.
    Sql {
        sql: String,
        code: Option<String>,
        source: sqlx::Error,
    },
    /// Blueprint construction failed.
    Validation(Vec<ValidationError>),
    /// A migration failed midway; already executed steps were compensated.
    PartialApply {
        name: String,
        source: Box<MigrationError>,
        compensated: bool,
    },
    /// A migration or seed file could not be parsed.
    Parse { path: String, message: String },
    Io(std::io::Error),
    /// Generic message error.
    Message(String),
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CatalogAccess { view, source } => write!(
                f,
                "cannot read schema catalog ({}), check the database user's privileges: {}",
                view, source
            ),
            Self::Sql { sql, code, source } => match code {
                Some(code) => write!(f, "sql error [{}]: {} in `{}`", code, source, sql),
                None => write!(f, "sql error: {} in `{}`", source, sql),
            },
            Self::Validation(errors) => {
                write!(f, "validation failed ({} errors)", errors.len())?;
                for error in errors {
                    write!(f, "; {}", error)?;
                }
                Ok(())
            }
            Self::PartialApply {
                name,
                source,
                compensated,
            } => {
                if *compensated {
                    write!(f, "migration {} failed and was rolled back: {}", name, source)
                } else {
                    write!(
                        f,
                        "migration {} failed and could not be fully rolled back: {}",
                        name, source
                    )
                }
            }
            Self::Parse { path, message } => write!(f, "cannot parse {}: {}", path, message),
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Message(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CatalogAccess { source, .. } | Self::Sql { source, .. } => Some(source),
            Self::PartialApply { source, .. } => Some(source.as_ref()),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        map_sqlx_error("", err)
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<Vec<ValidationError>> for MigrationError {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self::Validation(errors)
    }
}

/// Result alias for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Wrap a sqlx error together with the statement that produced it and the
/// engine error code, when the driver reports one.
pub fn map_sqlx_error(sql: &str, err: sqlx::Error) -> MigrationError {
    let code = match &err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    };
    MigrationError::Sql {
        sql: sql.to_owned(),
        code,
        source: err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_lists_every_problem() {
        let err = MigrationError::Validation(vec![
            ValidationError::new(BlueprintKind::Column, "name", "unsigned requires int or bigint"),
            ValidationError::new(BlueprintKind::Index, "PRIMARY", "duplicate primary index"),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("validation failed (2 errors)"));
        assert!(text.contains("column 'name': unsigned requires int or bigint"));
        assert!(text.contains("index 'PRIMARY'"));
    }

    #[test]
    fn sql_error_keeps_statement_text() {
        let err = map_sqlx_error("DROP TABLE `x`", sqlx::Error::RowNotFound);
        match &err {
            MigrationError::Sql { sql, code, .. } => {
                assert_eq!(sql, "DROP TABLE `x`");
                assert!(code.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("DROP TABLE `x`"));
    }
}
