use std::collections::HashSet;

use crate::error::{BlueprintKind, ValidationError};
use crate::schema::{ProcedureArg, ProcedureDefinition};
use crate::sql::SqlStatementBuilder;

use super::{DiffContext, SqlPair};

/// A stored procedure with typed arguments, an optional output and a raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureBlueprint {
    definition: ProcedureDefinition,
    drop: bool,
}

impl ProcedureBlueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: ProcedureDefinition {
                name: name.into(),
                args: Vec::new(),
                output: None,
                body: String::new(),
            },
            drop: false,
        }
    }

    pub fn dropped(name: impl Into<String>) -> Self {
        Self {
            drop: true,
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ProcedureDefinition {
        &self.definition
    }

    pub fn is_dropped(&self) -> bool {
        self.drop
    }

    pub fn arg(&mut self, name: impl Into<String>, sql_type: impl Into<String>) -> &mut Self {
        self.definition.args.push(ProcedureArg {
            name: name.into(),
            sql_type: sql_type.into(),
        });
        self
    }

    pub fn output(&mut self, name: impl Into<String>, sql_type: impl Into<String>) -> &mut Self {
        self.definition.output = Some(ProcedureArg {
            name: name.into(),
            sql_type: sql_type.into(),
        });
        self
    }

    pub fn body(&mut self, sql: impl Into<String>) -> &mut Self {
        self.definition.body = sql.into();
        self
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let def = &self.definition;
        let mut errors = Vec::new();
        let mut fail = |message: String| {
            errors.push(ValidationError::new(BlueprintKind::Procedure, &def.name, message));
        };
        if def.name.trim().is_empty() {
            fail("procedure name must not be empty".to_owned());
        }
        if self.drop {
            return errors;
        }
        if def.body.trim().is_empty() {
            fail("procedure body must not be empty".to_owned());
        }
        let mut seen = HashSet::new();
        for param in def.args.iter().chain(def.output.iter()) {
            if !seen.insert(param.name.as_str()) {
                fail(format!("duplicate parameter '{}'", param.name));
            }
            if param.sql_type.trim().is_empty() {
                fail(format!("parameter '{}' has no type", param.name));
            }
        }
        errors
    }

    /// Up replaces the procedure; down restores `current` or removes it.
    pub fn obtain_sql(&self, current: Option<&ProcedureDefinition>, ctx: &DiffContext) -> SqlPair {
        let name = &self.definition.name;
        let mut up = SqlStatementBuilder::new(ctx.dialect);
        up.drop_procedure(name);
        if !self.drop {
            up.create_procedure(&self.definition);
        }

        let mut down = SqlStatementBuilder::new(ctx.dialect);
        down.drop_procedure(name);
        if let Some(current) = current {
            down.create_procedure(current);
        }

        SqlPair::new(up.output(true).sql, down.output(true).sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;

    fn touch_user() -> ProcedureBlueprint {
        let mut p = ProcedureBlueprint::new("touch_user");
        p.arg("user_id", "BIGINT")
            .output("touched", "INT")
            .body("UPDATE users SET updated_at = NOW() WHERE id = user_id;\nSET touched = ROW_COUNT();");
        p
    }

    #[test]
    fn new_procedure_down_only_drops() {
        let pair = touch_user().obtain_sql(None, &DiffContext::new(Dialect::MySql, "dev"));
        assert!(pair.up.starts_with("DROP PROCEDURE IF EXISTS `touch_user`;\nCREATE PROCEDURE `touch_user`(IN `user_id` BIGINT, OUT `touched` INT)\nBEGIN\n"));
        assert_eq!(pair.down, "DROP PROCEDURE IF EXISTS `touch_user`;");
    }

    #[test]
    fn replaced_procedure_down_restores_previous_body() {
        let previous = ProcedureDefinition {
            name: "touch_user".to_owned(),
            args: vec![ProcedureArg {
                name: "user_id".to_owned(),
                sql_type: "INT".to_owned(),
            }],
            output: None,
            body: "SELECT 1;".to_owned(),
        };
        let pair = touch_user().obtain_sql(Some(&previous), &DiffContext::new(Dialect::MySql, "dev"));
        assert!(pair.down.contains("CREATE PROCEDURE `touch_user`(IN `user_id` INT)\nBEGIN\nSELECT 1;\nEND"));
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let mut p = touch_user();
        p.arg("touched", "INT");
        assert_eq!(p.validate().len(), 1);
    }
}
