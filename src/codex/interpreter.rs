use super::ast::{BinaryOp, CodexProgram, Expr, Statement, StmtKind, UnaryOp};
use super::builtins::{self, BuiltinContext};
use super::scope::CodexHost;
use super::{CodexOutput, ExecutionBudget, entity_value};
use crate::core::value::{as_f64, compare, display, float_value, truthy, type_name, values_equal};
use crate::core::{Attributes, KernelError, Result, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Wall time is sampled once per this many steps.
const TIME_CHECK_INTERVAL: u64 = 64;

const ENTITY_VAR: &str = "entity";
const ARGS_VAR: &str = "args";
const RESERVED_FIELDS: &[&str] = &["id", "kind", "owner", "relations"];

enum Flow {
    Next,
    Return(Option<Value>),
}

/// Tree-walking evaluator for one codex run.
pub(crate) struct Interpreter<'a> {
    codex_id: &'a str,
    host: &'a mut dyn CodexHost,
    budget: &'a ExecutionBudget,
    env: HashMap<String, Value>,
    emitted: Vec<Value>,
    steps: u64,
    started: Instant,
    line: usize,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        codex_id: &'a str,
        host: &'a mut dyn CodexHost,
        budget: &'a ExecutionBudget,
        entity: Value,
        args: Value,
    ) -> Self {
        let mut env = HashMap::new();
        env.insert(ENTITY_VAR.to_string(), entity);
        env.insert(ARGS_VAR.to_string(), args);
        Self {
            codex_id,
            host,
            budget,
            env,
            emitted: Vec::new(),
            steps: 0,
            started: Instant::now(),
            line: 0,
        }
    }

    pub(crate) fn run(mut self, program: &CodexProgram) -> Result<CodexOutput> {
        let flow = match self.exec_block(&program.statements) {
            Ok(flow) => flow,
            Err(err) => return Err(self.locate(err)),
        };

        let value = match flow {
            Flow::Return(Some(value)) => value,
            _ if !self.emitted.is_empty() => Value::Array(self.emitted.clone()),
            _ => Value::Null,
        };
        Ok(CodexOutput {
            value,
            emitted: self.emitted,
            steps: self.steps,
        })
    }

    /// Prefixes an error with the codex id and current line.
    fn locate(&self, err: KernelError) -> KernelError {
        let message = match err {
            KernelError::ExecutionError(message) => message,
            other => other.to_string(),
        };
        KernelError::ExecutionError(format!(
            "codex '{}' line {}: {}",
            self.codex_id, self.line, message
        ))
    }

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.budget.max_steps {
            return Err(KernelError::ExecutionError(format!(
                "step budget of {} exceeded",
                self.budget.max_steps
            )));
        }
        if self.steps % TIME_CHECK_INTERVAL == 0
            && self.started.elapsed() > Duration::from_millis(self.budget.max_duration_ms)
        {
            return Err(KernelError::ExecutionError(format!(
                "time budget of {} ms exceeded",
                self.budget.max_duration_ms
            )));
        }
        Ok(())
    }

    fn exec_block(&mut self, statements: &[Statement]) -> Result<Flow> {
        for statement in statements {
            if let Flow::Return(value) = self.exec(statement)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, statement: &Statement) -> Result<Flow> {
        self.line = statement.line;
        self.tick()?;

        match &statement.kind {
            StmtKind::Let { name, value } => {
                if name == ENTITY_VAR || name == ARGS_VAR {
                    return Err(rebind_error(name));
                }
                let value = self.eval(value)?;
                self.env.insert(name.clone(), value);
            }
            StmtKind::Assign { name, value } => {
                if name == ENTITY_VAR || name == ARGS_VAR {
                    return Err(rebind_error(name));
                }
                if !self.env.contains_key(name) {
                    return Err(KernelError::ExecutionError(format!(
                        "assignment to undefined variable '{}'",
                        name
                    )));
                }
                let value = self.eval(value)?;
                self.env.insert(name.clone(), value);
            }
            StmtKind::SetAttribute { attribute, value } => {
                let value = self.eval(value)?;
                self.set_attribute(attribute, value)?;
            }
            StmtKind::Emit(expr) => {
                let value = self.eval(expr)?;
                if self.emitted.len() >= self.budget.max_collection_len {
                    return Err(KernelError::ExecutionError(format!(
                        "more than {} emitted values",
                        self.budget.max_collection_len
                    )));
                }
                self.emitted.push(value);
            }
            StmtKind::Fail(expr) => {
                let value = self.eval(expr)?;
                return Err(KernelError::ExecutionError(display(&value)));
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => Some(self.eval(expr)?),
                    None => None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If { condition, then_branch, else_branch } => {
                let branch = if truthy(&self.eval(condition)?) {
                    then_branch
                } else {
                    else_branch
                };
                return self.exec_block(branch);
            }
            StmtKind::Repeat { count, body } => {
                let count = self.eval(count)?;
                let times = match count.as_i64() {
                    Some(n) if n >= 0 => n,
                    _ => {
                        return Err(KernelError::ExecutionError(format!(
                            "repeat count must be a non-negative int, got {}",
                            display(&count)
                        )));
                    }
                };
                for _ in 0..times {
                    self.tick()?;
                    if let Flow::Return(value) = self.exec_block(body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            StmtKind::ForIn { var, iterable, body } => {
                if var == ENTITY_VAR || var == ARGS_VAR {
                    return Err(rebind_error(var));
                }
                let items = match self.eval(iterable)? {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(key, _)| Value::String(key)).collect(),
                    other => {
                        return Err(KernelError::ExecutionError(format!(
                            "cannot iterate over {}",
                            type_name(&other)
                        )));
                    }
                };
                for item in items {
                    self.tick()?;
                    self.env.insert(var.clone(), item);
                    if let Flow::Return(value) = self.exec_block(body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(Flow::Next)
    }

    /// `set entity.attr = value` writes through the host and refreshes the binding.
    fn set_attribute(&mut self, attribute: &str, value: Value) -> Result<()> {
        if RESERVED_FIELDS.contains(&attribute) {
            return Err(KernelError::ExecutionError(format!(
                "cannot set reserved field '{}'",
                attribute
            )));
        }
        let id = match self.env.get(ENTITY_VAR).and_then(|entity| entity.get("id")) {
            Some(Value::String(id)) => id.clone(),
            _ => {
                return Err(KernelError::ExecutionError(
                    "no entity is bound to this run".to_string(),
                ));
            }
        };

        let mut patch = Attributes::new();
        patch.insert(attribute.to_string(), value);
        let updated = self.host.update(&id, &patch)?;
        self.env.insert(ENTITY_VAR.to_string(), entity_value(&updated));
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                self.check_size(Value::Array(values))
            }
            Expr::Object(fields) => {
                let mut map = Attributes::new();
                for (key, value) in fields {
                    let value = self.eval(value)?;
                    map.insert(key.clone(), value);
                }
                self.check_size(Value::Object(map))
            }
            Expr::Variable(name) => self.env.get(name).cloned().ok_or_else(|| {
                KernelError::ExecutionError(format!("undefined variable '{}'", name))
            }),
            Expr::Member { object, field } => match self.eval(object)? {
                Value::Object(mut map) => Ok(map.remove(field).unwrap_or(Value::Null)),
                other => Err(KernelError::ExecutionError(format!(
                    "cannot read field '{}' of {}",
                    field,
                    type_name(&other)
                ))),
            },
            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                index_value(object, &index)
            }
            Expr::Call { function, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                let mut ctx = BuiltinContext {
                    codex_id: self.codex_id,
                    host: &mut *self.host,
                    max_results: self.budget.max_collection_len,
                };
                let result = builtins::call(&mut ctx, function, values)?;
                self.check_size(result)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Negate => negate(&value),
                }
            }
            Expr::Binary { op: BinaryOp::And, left, right } => {
                if !truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Binary { op: BinaryOp::Or, left, right } => {
                if truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                let result = binary(*op, &left, &right)?;
                self.check_size(result)
            }
        }
    }

    fn check_size(&self, value: Value) -> Result<Value> {
        let too_big = match &value {
            Value::String(s) => s.len() > self.budget.max_string_len,
            Value::Array(items) => items.len() > self.budget.max_collection_len,
            Value::Object(map) => map.len() > self.budget.max_collection_len,
            _ => false,
        };
        if too_big {
            return Err(KernelError::ExecutionError(format!(
                "{} value exceeds the size budget",
                type_name(&value)
            )));
        }
        Ok(value)
    }
}

fn rebind_error(name: &str) -> KernelError {
    KernelError::ExecutionError(format!("'{}' cannot be rebound", name))
}

fn index_value(object: Value, index: &Value) -> Result<Value> {
    match (object, index) {
        (Value::Array(mut items), Value::Number(_)) => match index.as_i64() {
            Some(i) if i >= 0 => {
                let i = i as usize;
                Ok(if i < items.len() { items.swap_remove(i) } else { Value::Null })
            }
            _ => Err(KernelError::ExecutionError(format!(
                "invalid array index {}",
                display(index)
            ))),
        },
        (Value::Object(mut map), Value::String(key)) => Ok(map.remove(key).unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(_)) => match index.as_i64() {
            Some(i) if i >= 0 => Ok(s
                .chars()
                .nth(i as usize)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null)),
            _ => Err(KernelError::ExecutionError(format!(
                "invalid string index {}",
                display(index)
            ))),
        },
        (object, index) => Err(KernelError::ExecutionError(format!(
            "cannot index {} with {}",
            type_name(&object),
            type_name(index)
        ))),
    }
}

fn negate(value: &Value) -> Result<Value> {
    if let Some(i) = value.as_i64() {
        return i.checked_neg().map(Value::from).ok_or_else(|| {
            KernelError::ExecutionError("integer overflow in negation".to_string())
        });
    }
    match as_f64(value) {
        Some(f) => float_value(-f),
        None => Err(KernelError::ExecutionError(format!(
            "cannot negate {}",
            type_name(value)
        ))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(left, right)?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if op == BinaryOp::Add {
        match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                return Ok(Value::String(format!("{}{}", display(left), display(right))));
            }
            (Value::Array(a), Value::Array(b)) => {
                return Ok(Value::Array(a.iter().chain(b).cloned().collect()));
            }
            _ => {}
        }
    }

    if !left.is_number() || !right.is_number() {
        return Err(KernelError::ExecutionError(format!(
            "unsupported operand types for {}: {} and {}",
            op.symbol(),
            type_name(left),
            type_name(right)
        )));
    }

    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        return integer_arithmetic(op, a, b);
    }

    let a = as_f64(left).unwrap_or(f64::NAN);
    let b = as_f64(right).unwrap_or(f64::NAN);
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Mod if b == 0.0 => {
            return Err(KernelError::ExecutionError("division by zero".to_string()));
        }
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    float_value(result)
}

/// Checked integer math; a non-exact division yields a float.
fn integer_arithmetic(op: BinaryOp, a: i64, b: i64) -> Result<Value> {
    if matches!(op, BinaryOp::Div | BinaryOp::Mod) && b == 0 {
        return Err(KernelError::ExecutionError("division by zero".to_string()));
    }
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div => {
            if let Some(rem) = a.checked_rem(b)
                && rem != 0
            {
                return float_value(a as f64 / b as f64);
            }
            a.checked_div(b)
        }
        _ => a.checked_rem(b),
    };
    result.map(Value::from).ok_or_else(|| {
        KernelError::ExecutionError(format!("integer overflow in {}", op.symbol()))
    })
}
