use crate::error::{BlueprintKind, ValidationError};
use crate::schema::{IndexDefinition, IndexKind};

/// Desired state of one index. Column order is significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlueprint {
    table: String,
    definition: IndexDefinition,
    drop: bool,
}

impl IndexBlueprint {
    pub fn new<I, S>(table: impl Into<String>, name: impl Into<String>, kind: IndexKind, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            definition: IndexDefinition::new(name, kind, columns.into_iter().map(Into::into).collect()),
            drop: false,
        }
    }

    pub fn dropped(table: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = if name == IndexDefinition::PRIMARY {
            IndexKind::Primary
        } else {
            IndexKind::Index
        };
        Self {
            drop: true,
            ..Self::new(table, name, kind, Vec::<String>::new())
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn is_dropped(&self) -> bool {
        self.drop
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.definition.name.trim().is_empty() {
            errors.push(ValidationError::new(
                BlueprintKind::Index,
                &self.definition.name,
                "index name must not be empty",
            ));
        }
        if !self.drop && self.definition.columns.is_empty() {
            errors.push(ValidationError::new(
                BlueprintKind::Index,
                &self.definition.name,
                "index must cover at least one column",
            ));
        }
        errors
    }
}
