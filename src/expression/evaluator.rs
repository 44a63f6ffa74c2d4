//! Tree-walking evaluator for compiled programs
//!
//! Local declarations live in a stack of frames that shadows the scope
//! bindings. Every visited node costs one step against the budget.

use super::ast::{BinaryOp, Expression, LogicalOp, Program, Statement, UnaryOp};
use super::error::{EvalError, EvalResult};
use super::scope::EvalScope;
use super::value::{compare, loose_equals, number, strict_equals, to_js_string, to_number, truthy, type_name};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

pub const DEFAULT_STEP_BUDGET: usize = 100_000;

/// An arrow function argument, borrowed from the program it appears in
#[derive(Clone, Copy)]
pub(super) struct Lambda<'p> {
    pub params: &'p [String],
    pub body: &'p Program,
}

/// Evaluated call argument
pub(super) enum Arg<'p> {
    Value(Value),
    Lambda(Lambda<'p>),
}

impl<'p> Arg<'p> {
    pub fn value(&self) -> Value {
        match self {
            Arg::Value(v) => v.clone(),
            Arg::Lambda(_) => Value::Null,
        }
    }

    pub fn lambda(&self) -> Option<Lambda<'p>> {
        match self {
            Arg::Lambda(l) => Some(*l),
            Arg::Value(_) => None,
        }
    }
}

enum Flow {
    Next(Value),
    Return(Value),
}

pub struct Evaluator<'s> {
    pub(super) scope: &'s EvalScope,
    frames: Vec<HashMap<String, Value>>,
    steps: usize,
    max_steps: usize,
}

impl<'s> Evaluator<'s> {
    pub fn new(scope: &'s EvalScope) -> Self {
        Self::with_budget(scope, DEFAULT_STEP_BUDGET)
    }

    pub fn with_budget(scope: &'s EvalScope, max_steps: usize) -> Self {
        Self {
            scope,
            frames: Vec::new(),
            steps: 0,
            max_steps,
        }
    }

    /// Run a program to its `return` value or the value of its last statement
    pub fn run(&mut self, program: &Program) -> EvalResult<Value> {
        self.run_with(program, HashMap::new())
    }

    fn run_with(&mut self, program: &Program, frame: HashMap<String, Value>) -> EvalResult<Value> {
        self.frames.push(frame);
        let result = self.run_statements(&program.statements);
        self.frames.pop();
        result
    }

    fn run_statements(&mut self, statements: &[Statement]) -> EvalResult<Value> {
        let mut last = Value::Null;
        for statement in statements {
            match self.statement(statement)? {
                Flow::Next(value) => last = value,
                Flow::Return(value) => return Ok(value),
            }
        }
        Ok(last)
    }

    fn statement(&mut self, statement: &Statement) -> EvalResult<Flow> {
        match statement {
            Statement::Let(name, expr) => {
                let value = self.eval(expr)?;
                if let Some(frame) = self.frames.last_mut() {
                    frame.insert(name.clone(), value);
                }
                Ok(Flow::Next(Value::Null))
            }
            Statement::Expression(expr) => Ok(Flow::Next(self.eval(expr)?)),
            Statement::Return(expr) => Ok(Flow::Return(self.eval(expr)?)),
        }
    }

    pub(super) fn call_lambda(&mut self, lambda: Lambda<'_>, args: &[Value]) -> EvalResult<Value> {
        let frame = lambda
            .params
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), args.get(i).cloned().unwrap_or(Value::Null)))
            .collect();
        self.run_with(lambda.body, frame)
    }

    fn tick(&mut self) -> EvalResult<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(EvalError::Budget);
        }
        Ok(())
    }

    pub(super) fn local(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    fn lookup(&self, name: &str) -> EvalResult<Value> {
        if let Some(value) = self.local(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.scope.get(name) {
            return Ok(value.clone());
        }
        if name == "memory" {
            if let Some(memory) = self.scope.memory() {
                return Ok(Value::Object(memory.get_all(None)));
            }
        }
        Err(EvalError::Reference(name.to_string()))
    }

    pub fn eval(&mut self, expr: &Expression) -> EvalResult<Value> {
        self.tick()?;
        match expr {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Identifier(name) => self.lookup(name),
            Expression::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<EvalResult<Vec<_>>>()?;
                Ok(Value::Array(values))
            }
            Expression::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Object(map))
            }
            Expression::Member {
                object,
                property,
                optional,
            } => {
                let target = self.eval(object)?;
                member(&target, property, *optional)
            }
            Expression::Index {
                object,
                index,
                optional,
            } => {
                let target = self.eval(object)?;
                if target.is_null() && *optional {
                    return Ok(Value::Null);
                }
                let key = self.eval(index)?;
                index_value(&target, &key)
            }
            Expression::Call { callee, args } => self.call(callee, args),
            Expression::Unary(op, operand) => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!truthy(&value)),
                    UnaryOp::Negate => number(-to_number(&value)),
                    UnaryOp::Plus => number(to_number(&value)),
                })
            }
            Expression::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(binary(*op, &left, &right))
            }
            Expression::Logical(op, left, right) => {
                let left = self.eval(left)?;
                let short_circuit = match op {
                    LogicalOp::And => !truthy(&left),
                    LogicalOp::Or => truthy(&left),
                    LogicalOp::Nullish => !left.is_null(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expression::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if truthy(&self.eval(test)?) {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expression::Lambda { .. } => Err(EvalError::type_error(
                "arrow functions may only be passed to built-in functions",
            )),
        }
    }

    fn eval_args<'p>(&mut self, args: &'p [Expression]) -> EvalResult<Vec<Arg<'p>>> {
        args.iter()
            .map(|arg| match arg {
                Expression::Lambda { params, body } => Ok(Arg::Lambda(Lambda {
                    params: params.as_slice(),
                    body: body.as_ref(),
                })),
                other => self.eval(other).map(Arg::Value),
            })
            .collect()
    }

    fn call(&mut self, callee: &Expression, args: &[Expression]) -> EvalResult<Value> {
        match callee {
            Expression::Identifier(name) => {
                if self.local(name).is_some() || self.scope.get(name).is_some() {
                    return Err(EvalError::type_error(format!("{} is not a function", name)));
                }
                let args = self.eval_args(args)?;
                self.call_function(name, args)
            }
            Expression::Member {
                object,
                property,
                optional,
            } => {
                if let Expression::Identifier(namespace) = object.as_ref() {
                    if self.local(namespace).is_none() && self.is_namespace(namespace) {
                        let args = self.eval_args(args)?;
                        return self.call_namespace(namespace, property, args);
                    }
                }
                let receiver = self.eval(object)?;
                if receiver.is_null() && *optional {
                    return Ok(Value::Null);
                }
                let args = self.eval_args(args)?;
                self.call_method(receiver, property, args)
            }
            _ => Err(EvalError::type_error("expression is not callable")),
        }
    }
}

/// Property access; `length` is synthesized for strings and arrays
pub(super) fn member(target: &Value, property: &str, optional: bool) -> EvalResult<Value> {
    match target {
        Value::Null if optional => Ok(Value::Null),
        Value::Null => Err(EvalError::type_error(format!(
            "cannot read property '{}' of null",
            property
        ))),
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if property == "length" => Ok(Value::from(items.len())),
        Value::String(s) if property == "length" => Ok(Value::from(s.chars().count())),
        _ => Ok(Value::Null),
    }
}

fn index_value(target: &Value, key: &Value) -> EvalResult<Value> {
    match target {
        Value::Null => Err(EvalError::type_error(format!(
            "cannot read index {} of null",
            to_js_string(key)
        ))),
        Value::Array(items) => {
            if let Value::String(name) = key {
                return member(target, name, false);
            }
            let idx = to_number(key);
            if idx.fract() != 0.0 || idx < 0.0 {
                return Ok(Value::Null);
            }
            Ok(items.get(idx as usize).cloned().unwrap_or(Value::Null))
        }
        Value::String(s) => {
            if let Value::String(name) = key {
                return member(target, name, false);
            }
            let idx = to_number(key);
            if idx.fract() != 0.0 || idx < 0.0 {
                return Ok(Value::Null);
            }
            Ok(s.chars()
                .nth(idx as usize)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null))
        }
        Value::Object(map) => Ok(map.get(&to_js_string(key)).cloned().unwrap_or(Value::Null)),
        other => Err(EvalError::type_error(format!(
            "cannot index into {}",
            type_name(other)
        ))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::String(_), _)
            | (_, Value::String(_))
            | (Value::Array(_), _)
            | (_, Value::Array(_))
            | (Value::Object(_), _)
            | (_, Value::Object(_)) => {
                Value::String(format!("{}{}", to_js_string(left), to_js_string(right)))
            }
            _ => number(to_number(left) + to_number(right)),
        },
        BinaryOp::Subtract => number(to_number(left) - to_number(right)),
        BinaryOp::Multiply => number(to_number(left) * to_number(right)),
        BinaryOp::Divide => number(to_number(left) / to_number(right)),
        BinaryOp::Modulo => number(to_number(left) % to_number(right)),
        BinaryOp::Equal => Value::Bool(loose_equals(left, right)),
        BinaryOp::NotEqual => Value::Bool(!loose_equals(left, right)),
        BinaryOp::StrictEqual => Value::Bool(strict_equals(left, right)),
        BinaryOp::StrictNotEqual => Value::Bool(!strict_equals(left, right)),
        BinaryOp::Less => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOp::LessEqual => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Greater => Value::Bool(compare(left, right) == Some(Ordering::Greater)),
        BinaryOp::GreaterEqual => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
    }
}
