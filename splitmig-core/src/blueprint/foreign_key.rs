use sha2::{Digest, Sha256};

use crate::error::{BlueprintKind, ValidationError};
use crate::schema::{ForeignKeyDefinition, ReferentialAction};

const MAX_IDENTIFIER_LEN: usize = 64;

/// Generated constraint name, `fk_<table>_<columns>`, shortened with a hash
/// suffix when it would exceed the MySQL identifier limit.
pub fn foreign_key_name(table: &str, columns: &[String]) -> String {
    let name = format!("fk_{}_{}", table, columns.join("_"));
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }
    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    let prefix: String = name.chars().take(MAX_IDENTIFIER_LEN - 9).collect();
    format!("{}_{}", prefix, &digest[..8])
}

/// Desired state of one foreign key.
///
/// ```ignore
/// table
///     .foreign(["user_id"])
///     .references(["id"])
///     .at_table("users")
///     .on_delete(ReferentialAction::Cascade);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyBlueprint {
    table: String,
    definition: ForeignKeyDefinition,
    drop: bool,
}

impl ForeignKeyBlueprint {
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        Self {
            definition: ForeignKeyDefinition {
                name: foreign_key_name(&table, &columns),
                columns,
                referenced_table: String::new(),
                referenced_columns: Vec::new(),
                on_update: ReferentialAction::default(),
                on_delete: ReferentialAction::default(),
            },
            table,
            drop: false,
        }
    }

    pub fn dropped<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            drop: true,
            ..Self::new(table, columns)
        }
    }

    pub fn named(&mut self, name: impl Into<String>) -> &mut Self {
        self.definition.name = name.into();
        self
    }

    pub fn references<I, S>(&mut self, columns: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition.referenced_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn at_table(&mut self, table: impl Into<String>) -> &mut Self {
        self.definition.referenced_table = table.into();
        self
    }

    pub fn on_update(&mut self, action: ReferentialAction) -> &mut Self {
        self.definition.on_update = action;
        self
    }

    pub fn on_delete(&mut self, action: ReferentialAction) -> &mut Self {
        self.definition.on_delete = action;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn definition(&self) -> &ForeignKeyDefinition {
        &self.definition
    }

    pub fn is_dropped(&self) -> bool {
        self.drop
    }

    pub fn sets_null(&self) -> bool {
        self.definition.on_delete == ReferentialAction::SetNull
            || self.definition.on_update == ReferentialAction::SetNull
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let def = &self.definition;
        let mut errors = Vec::new();
        let mut fail = |message: String| {
            errors.push(ValidationError::new(BlueprintKind::ForeignKey, &def.name, message));
        };
        if def.columns.is_empty() {
            fail("foreign key must name at least one local column".to_owned());
        }
        if self.drop {
            return errors;
        }
        if def.referenced_table.trim().is_empty() {
            fail("foreign key must reference a table".to_owned());
        }
        if def.columns.len() != def.referenced_columns.len() {
            fail(format!(
                "foreign key has {} local columns but {} referenced columns",
                def.columns.len(),
                def.referenced_columns.len()
            ));
        }
        errors
    }
}
