//! Abstract Syntax Tree types for sandboxed expressions
//!
//! These types are data-only and separate from parsing logic.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    StrictEqual,
    StrictNotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

/// Short-circuiting operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

/// Parsed expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Identifier(String),
    Array(Vec<Expression>),
    Object(Vec<(String, Expression)>),

    Member {
        object: Box<Expression>,
        property: String,
        optional: bool,
    },
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
        optional: bool,
    },
    Call {
        callee: Box<Expression>,
        args: Vec<Expression>,
    },

    Unary(UnaryOp, Box<Expression>),
    Binary(BinaryOp, Box<Expression>, Box<Expression>),
    Logical(LogicalOp, Box<Expression>, Box<Expression>),
    Conditional {
        test: Box<Expression>,
        consequent: Box<Expression>,
        alternate: Box<Expression>,
    },

    /// Arrow function; only meaningful as an argument to a higher-order built-in
    Lambda {
        params: Vec<String>,
        body: Box<Program>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Let(String, Expression),
    Expression(Expression),
    Return(Expression),
}

/// A parsed body: one or more statements
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn single(expr: Expression) -> Self {
        Self {
            statements: vec![Statement::Return(expr)],
        }
    }
}
