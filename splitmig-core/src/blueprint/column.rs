use crate::error::{BlueprintKind, ValidationError};
use crate::schema::{ColumnDefinition, ColumnType, DefaultValue};
use crate::value::Value;

/// Desired state of one column. Modifiers are chainable and are checked by
/// [`ColumnBlueprint::validate`] once the owning table is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBlueprint {
    table: String,
    definition: ColumnDefinition,
    primary: bool,
    drop: bool,
}

impl ColumnBlueprint {
    pub fn new(table: impl Into<String>, name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            table: table.into(),
            definition: ColumnDefinition::new(name, column_type),
            primary: false,
            drop: false,
        }
    }

    /// A column scheduled for removal.
    pub fn dropped(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            drop: true,
            ..Self::new(table, name, ColumnType::Text)
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn definition(&self) -> &ColumnDefinition {
        &self.definition
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn is_dropped(&self) -> bool {
        self.drop
    }

    /// VARCHAR length or DECIMAL precision.
    pub fn length(&mut self, length: u32) -> &mut Self {
        self.definition.length = Some(length);
        self
    }

    pub fn scale(&mut self, scale: u32) -> &mut Self {
        self.definition.scale = Some(scale);
        self
    }

    pub fn nullable(&mut self) -> &mut Self {
        self.definition.nullable = true;
        self
    }

    pub fn unsigned(&mut self) -> &mut Self {
        self.definition.unsigned = true;
        self
    }

    pub fn auto_increment(&mut self) -> &mut Self {
        self.definition.auto_increment = true;
        self
    }

    pub fn default(&mut self, value: impl Into<Value>) -> &mut Self {
        self.definition.default = Some(DefaultValue::Literal(value.into()));
        self
    }

    pub fn default_current_timestamp(&mut self) -> &mut Self {
        self.definition.default = Some(DefaultValue::CurrentTimestamp);
        self
    }

    /// Binds a PRIMARY index to this column.
    pub fn primary(&mut self) -> &mut Self {
        self.primary = true;
        self
    }

    pub fn charset(&mut self, charset: impl Into<String>) -> &mut Self {
        self.definition.charset = Some(charset.into());
        self
    }

    pub fn collation(&mut self, collation: impl Into<String>) -> &mut Self {
        self.definition.collation = Some(collation.into());
        self
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let def = &self.definition;
        let mut errors = Vec::new();
        let mut fail = |message: &str| {
            errors.push(ValidationError::new(BlueprintKind::Column, &def.name, message));
        };

        if def.name.trim().is_empty() {
            fail("column name must not be empty");
        }
        if self.drop {
            return errors;
        }

        let ty = def.column_type;
        if def.unsigned && !ty.is_integer() {
            fail("unsigned is only valid for int and bigint columns");
        }
        if def.auto_increment && !ty.is_integer() {
            fail("auto increment is only valid for int and bigint columns");
        }
        if (def.charset.is_some() || def.collation.is_some()) && !ty.is_textual() {
            fail("charset and collation are only valid for string and text columns");
        }
        if !ty.takes_length() && def.length.is_some() {
            fail("length is only valid for string and decimal columns");
        }
        match (ty, def.length, def.scale) {
            (ColumnType::String, Some(0), _) => fail("string length must be positive"),
            (ColumnType::String, Some(len), _) if len > 65_535 => {
                fail("string length must not exceed 65535")
            }
            (ColumnType::Decimal, Some(p), Some(s)) if s > p || p == 0 || p > 65 => {
                fail("decimal precision must be 1..=65 and not smaller than its scale")
            }
            _ => {}
        }
        match &def.default {
            Some(DefaultValue::Literal(Value::Null)) if !def.nullable => {
                fail("default NULL requires a nullable column")
            }
            Some(DefaultValue::CurrentTimestamp) | Some(DefaultValue::Literal(Value::DateTime(_)))
                if !ty.is_temporal() =>
            {
                fail("date/time defaults are only valid for date and time columns")
            }
            _ => {}
        }
        if self.primary && def.nullable {
            fail("a primary key column cannot be nullable");
        }
        errors
    }
}
