//! Static sandbox checks over a parsed program
//!
//! Runs once at compile time so a forbidden construct is rejected before any
//! evaluation.

use super::ast::{Expression, Program, Statement};
use super::error::{EvalError, EvalResult};
use serde_json::Value;

const FORBIDDEN_NAMES: &[&str] = &[
    "eval",
    "Function",
    "require",
    "process",
    "globalThis",
    "window",
    "global",
    "import",
    "module",
    "exports",
    "setTimeout",
    "setInterval",
    "fetch",
];

const FORBIDDEN_MEMBERS: &[&str] = &["constructor", "prototype", "__proto__"];

pub fn validate_program(program: &Program) -> EvalResult<()> {
    for statement in &program.statements {
        match statement {
            Statement::Let(name, expr) => {
                check_name(name)?;
                validate_expression(expr)?;
            }
            Statement::Expression(expr) | Statement::Return(expr) => validate_expression(expr)?,
        }
    }
    Ok(())
}

fn check_name(name: &str) -> EvalResult<()> {
    if FORBIDDEN_NAMES.contains(&name) {
        return Err(EvalError::Forbidden(name.to_string()));
    }
    Ok(())
}

fn check_member(name: &str) -> EvalResult<()> {
    if FORBIDDEN_MEMBERS.contains(&name) {
        return Err(EvalError::Forbidden(name.to_string()));
    }
    Ok(())
}

fn validate_expression(expr: &Expression) -> EvalResult<()> {
    match expr {
        Expression::Literal(_) => Ok(()),
        Expression::Identifier(name) => check_name(name),
        Expression::Array(items) => items.iter().try_for_each(validate_expression),
        Expression::Object(entries) => entries.iter().try_for_each(|(key, value)| {
            check_member(key)?;
            validate_expression(value)
        }),
        Expression::Member {
            object, property, ..
        } => {
            check_member(property)?;
            validate_expression(object)
        }
        Expression::Index { object, index, .. } => {
            if let Expression::Literal(Value::String(key)) = index.as_ref() {
                check_member(key)?;
            }
            validate_expression(object)?;
            validate_expression(index)
        }
        Expression::Call { callee, args } => {
            validate_expression(callee)?;
            args.iter().try_for_each(validate_expression)
        }
        Expression::Unary(_, operand) => validate_expression(operand),
        Expression::Binary(_, left, right) | Expression::Logical(_, left, right) => {
            validate_expression(left)?;
            validate_expression(right)
        }
        Expression::Conditional {
            test,
            consequent,
            alternate,
        } => {
            validate_expression(test)?;
            validate_expression(consequent)?;
            validate_expression(alternate)
        }
        Expression::Lambda { params, body } => {
            params.iter().try_for_each(|p| check_name(p))?;
            validate_program(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::ExpressionParser;

    fn validate(source: &str) -> EvalResult<()> {
        let program = ExpressionParser::new().parse(source).unwrap();
        validate_program(&program)
    }

    #[test]
    fn test_plain_expressions_pass() {
        assert!(validate("outputs.a.count > 1 && contains(branch, 'main')").is_ok());
        assert!(validate("any(issues, i => i.severity == 'error')").is_ok());
    }

    #[test]
    fn test_forbidden_globals() {
        assert_eq!(
            validate("process.env.HOME").unwrap_err(),
            EvalError::Forbidden("process".into())
        );
        assert!(validate("eval('1')").is_err());
        assert!(validate("xs.map(x => require(x))").is_err());
        assert!(validate("const fetch = 1").is_err());
    }

    #[test]
    fn test_forbidden_members() {
        assert!(validate("a.constructor").is_err());
        assert!(validate("a?.__proto__").is_err());
        assert!(validate("a['prototype']").is_err());
    }

    #[test]
    fn test_computed_index_is_allowed() {
        assert!(validate("outputs[checkName]").is_ok());
    }
}
