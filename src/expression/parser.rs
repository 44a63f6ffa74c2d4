//! Expression parser
//!
//! Recursive descent with precedence climbing for binary operators. The
//! grammar is a small JavaScript-flavoured subset: no assignment to existing
//! bindings, no loops, no function declarations. Arrow functions exist only so
//! they can be handed to higher-order built-ins such as `any` or `filter`.

use super::ast::{BinaryOp, Expression, LogicalOp, Program, Statement, UnaryOp};
use super::error::{EvalError, EvalResult};
use super::tokenizer::{tokenize, Token, TokenKind};
use serde_json::Value;

const DEFAULT_MAX_DEPTH: usize = 64;

/// Binary operator classes, lowest precedence first
#[derive(Clone, Copy)]
enum Operator {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn binary_operator(kind: &TokenKind) -> Option<(u8, Operator)> {
    let op = match kind {
        TokenKind::Nullish => (1, Operator::Logical(LogicalOp::Nullish)),
        TokenKind::Or => (1, Operator::Logical(LogicalOp::Or)),
        TokenKind::And => (2, Operator::Logical(LogicalOp::And)),
        TokenKind::Equal => (3, Operator::Binary(BinaryOp::Equal)),
        TokenKind::NotEqual => (3, Operator::Binary(BinaryOp::NotEqual)),
        TokenKind::StrictEqual => (3, Operator::Binary(BinaryOp::StrictEqual)),
        TokenKind::StrictNotEqual => (3, Operator::Binary(BinaryOp::StrictNotEqual)),
        TokenKind::Less => (4, Operator::Binary(BinaryOp::Less)),
        TokenKind::LessEqual => (4, Operator::Binary(BinaryOp::LessEqual)),
        TokenKind::Greater => (4, Operator::Binary(BinaryOp::Greater)),
        TokenKind::GreaterEqual => (4, Operator::Binary(BinaryOp::GreaterEqual)),
        TokenKind::Plus => (5, Operator::Binary(BinaryOp::Add)),
        TokenKind::Minus => (5, Operator::Binary(BinaryOp::Subtract)),
        TokenKind::Star => (6, Operator::Binary(BinaryOp::Multiply)),
        TokenKind::Slash => (6, Operator::Binary(BinaryOp::Divide)),
        TokenKind::Percent => (6, Operator::Binary(BinaryOp::Modulo)),
        _ => return None,
    };
    Some(op)
}

/// Expression parser
#[derive(Debug, Clone)]
pub struct ExpressionParser {
    max_depth: usize,
}

impl ExpressionParser {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Parse a full body; several statements evaluate to the last one
    pub fn parse(&self, source: &str) -> EvalResult<Program> {
        let tokens = tokenize(source)?;
        let mut cursor = Cursor {
            tokens,
            pos: 0,
            depth: 0,
            max_depth: self.max_depth,
        };
        let program = cursor.program(&TokenKind::Eof)?;
        if program.statements.is_empty() {
            return Err(EvalError::syntax("empty expression", 0));
        }
        Ok(program)
    }
}

impl Default for ExpressionParser {
    fn default() -> Self {
        Self::new()
    }
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Cursor {
    fn peek(&self) -> &Token {
        // tokenize() always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> EvalResult<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: String) -> EvalError {
        let token = self.peek();
        EvalError::syntax(
            format!("{} but found {:?}", message, token.kind),
            token.position,
        )
    }

    fn enter(&mut self) -> EvalResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(EvalError::syntax(
                "expression nesting too deep",
                self.peek().position,
            ));
        }
        Ok(())
    }

    fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn program(&mut self, terminator: &TokenKind) -> EvalResult<Program> {
        let mut statements = Vec::new();
        loop {
            while self.check(&TokenKind::Semicolon) {
                self.advance();
            }
            if self.check(terminator) || self.check(&TokenKind::Eof) {
                break;
            }
            statements.push(self.statement(terminator)?);

            if self.check(&TokenKind::Semicolon) {
                self.advance();
            } else if self.check(terminator) || self.peek().newline_before {
                continue;
            } else {
                return Err(self.error("expected ';' or end of expression".to_string()));
            }
        }
        Ok(Program { statements })
    }

    fn statement(&mut self, terminator: &TokenKind) -> EvalResult<Statement> {
        match self.peek().kind {
            TokenKind::Let => {
                self.advance();
                let name = match self.advance().kind {
                    TokenKind::Identifier(name) => name,
                    _ => return Err(self.error("expected variable name".to_string())),
                };
                self.expect(TokenKind::Assign, "'=' in declaration")?;
                Ok(Statement::Let(name, self.expression()?))
            }
            TokenKind::Return => {
                self.advance();
                if self.check(&TokenKind::Semicolon)
                    || self.check(terminator)
                    || self.check(&TokenKind::Eof)
                {
                    Ok(Statement::Return(Expression::Literal(Value::Null)))
                } else {
                    Ok(Statement::Return(self.expression()?))
                }
            }
            _ => Ok(Statement::Expression(self.expression()?)),
        }
    }

    fn expression(&mut self) -> EvalResult<Expression> {
        self.enter()?;
        let result = self.conditional();
        self.exit();
        result
    }

    fn conditional(&mut self) -> EvalResult<Expression> {
        let test = self.binary(1)?;
        if !self.check(&TokenKind::Question) {
            return Ok(test);
        }
        self.advance();
        let consequent = self.expression()?;
        self.expect(TokenKind::Colon, "':' in conditional expression")?;
        let alternate = self.expression()?;
        Ok(Expression::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn binary(&mut self, min_precedence: u8) -> EvalResult<Expression> {
        let mut left = self.unary()?;
        while let Some((precedence, op)) = binary_operator(&self.peek().kind) {
            if precedence < min_precedence {
                break;
            }
            self.advance();
            let right = self.binary(precedence + 1)?;
            left = match op {
                Operator::Binary(op) => Expression::Binary(op, Box::new(left), Box::new(right)),
                Operator::Logical(op) => Expression::Logical(op, Box::new(left), Box::new(right)),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> EvalResult<Expression> {
        let op = match self.peek().kind {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Plus => UnaryOp::Plus,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.exit();
        Ok(Expression::Unary(op, Box::new(operand?)))
    }

    fn postfix(&mut self) -> EvalResult<Expression> {
        let mut expr = self.primary()?;
        loop {
            match self.peek().kind {
                TokenKind::Dot => {
                    self.advance();
                    let property = self.property_name()?;
                    expr = Expression::Member {
                        object: Box::new(expr),
                        property,
                        optional: false,
                    };
                }
                TokenKind::OptionalDot => {
                    self.advance();
                    if self.check(&TokenKind::LeftBracket) {
                        self.advance();
                        let index = self.expression()?;
                        self.expect(TokenKind::RightBracket, "']'")?;
                        expr = Expression::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                            optional: true,
                        };
                    } else {
                        let property = self.property_name()?;
                        expr = Expression::Member {
                            object: Box::new(expr),
                            property,
                            optional: true,
                        };
                    }
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(TokenKind::RightBracket, "']'")?;
                    expr = Expression::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: false,
                    };
                }
                TokenKind::LeftParen => {
                    self.advance();
                    let args = self.list(&TokenKind::RightParen)?;
                    expr = Expression::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn property_name(&mut self) -> EvalResult<String> {
        let token = self.advance();
        match token.kind {
            TokenKind::Identifier(name) => Ok(name),
            // `x.return` and friends are valid property names
            TokenKind::Return => Ok("return".to_string()),
            TokenKind::Null => Ok("null".to_string()),
            TokenKind::True => Ok("true".to_string()),
            TokenKind::False => Ok("false".to_string()),
            other => Err(EvalError::syntax(
                format!("expected property name but found {:?}", other),
                token.position,
            )),
        }
    }

    /// Comma separated expressions up to `close`, which is consumed
    fn list(&mut self, close: &TokenKind) -> EvalResult<Vec<Expression>> {
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(self.expression()?);
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else if !self.check(close) {
                return Err(self.error("expected ',' or closing delimiter".to_string()));
            }
        }
        self.advance();
        Ok(items)
    }

    fn primary(&mut self) -> EvalResult<Expression> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expression::Literal(number_literal(n)))
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Expression::Literal(Value::String(s)))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expression::Literal(Value::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expression::Literal(Value::Bool(false)))
            }
            TokenKind::Null | TokenKind::Undefined => {
                self.advance();
                Ok(Expression::Literal(Value::Null))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if self.check(&TokenKind::Arrow) {
                    self.advance();
                    return self.lambda(vec![name]);
                }
                Ok(Expression::Identifier(name))
            }
            TokenKind::LeftParen => {
                if let Some(params) = self.arrow_params() {
                    return self.lambda(params);
                }
                self.advance();
                let expr = self.expression()?;
                self.expect(TokenKind::RightParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                self.advance();
                Ok(Expression::Array(self.list(&TokenKind::RightBracket)?))
            }
            TokenKind::LeftBrace => {
                self.advance();
                self.object()
            }
            _ => Err(self.error("expected expression".to_string())),
        }
    }

    fn object(&mut self) -> EvalResult<Expression> {
        let mut entries = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            let token = self.advance();
            let key = match token.kind {
                TokenKind::Identifier(name) => name,
                TokenKind::String(s) => s,
                TokenKind::Number(n) => number_literal(n).to_string(),
                other => {
                    return Err(EvalError::syntax(
                        format!("expected object key but found {:?}", other),
                        token.position,
                    ))
                }
            };
            let value = if self.check(&TokenKind::Colon) {
                self.advance();
                self.expression()?
            } else {
                Expression::Identifier(key.clone())
            };
            entries.push((key, value));
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else if !self.check(&TokenKind::RightBrace) {
                return Err(self.error("expected ',' or '}' in object literal".to_string()));
            }
        }
        self.advance();
        Ok(Expression::Object(entries))
    }

    /// If the tokens at the cursor form `(a, b) =>`, consume them and return the names
    fn arrow_params(&mut self) -> Option<Vec<String>> {
        let mut offset = 1;
        let mut params = Vec::new();
        loop {
            match self.peek_at(offset) {
                TokenKind::RightParen => break,
                TokenKind::Identifier(name) => {
                    params.push(name.clone());
                    offset += 1;
                    match self.peek_at(offset) {
                        TokenKind::Comma => offset += 1,
                        TokenKind::RightParen => break,
                        _ => return None,
                    }
                }
                _ => return None,
            }
        }
        if self.peek_at(offset + 1) != &TokenKind::Arrow {
            return None;
        }
        for _ in 0..offset + 2 {
            self.advance();
        }
        Some(params)
    }

    fn lambda(&mut self, params: Vec<String>) -> EvalResult<Expression> {
        let body = if self.check(&TokenKind::LeftBrace) {
            self.advance();
            self.enter()?;
            let program = self.program(&TokenKind::RightBrace);
            self.exit();
            let program = program?;
            self.expect(TokenKind::RightBrace, "'}' closing arrow body")?;
            program
        } else {
            Program::single(self.expression()?)
        };
        Ok(Expression::Lambda {
            params,
            body: Box::new(body),
        })
    }
}

/// Integral literals become JSON integers so `1 === 1.0` display stays tidy
pub(crate) fn number_literal(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
