//! Tree-walking evaluation over `serde_json::Value`.

use super::parser::{BinaryOp, Builtin, Expr, UnaryOp};
use crate::types::{CarveError, CarveResult};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Variables visible to an expression.
pub type Env = HashMap<String, Value>;

fn eval_error(message: impl Into<String>) -> CarveError {
    CarveError::Evaluation(message.into())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn float(value: f64) -> CarveResult<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| eval_error(format!("{value} is not a finite number")))
}

/// Text form used by string concatenation and `string()`.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_bool(value: &Value, context: &str) -> CarveResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| eval_error(format!("{context} expects a bool, got {}", type_name(value))))
}

fn as_str<'a>(value: &'a Value, context: &str) -> CarveResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| eval_error(format!("{context} expects a string, got {}", type_name(value))))
}

pub fn eval(expr: &Expr, env: &Env) -> CarveResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, env))
            .collect::<CarveResult<Vec<_>>>()
            .map(Value::Array),
        Expr::Ident(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| eval_error(format!("unknown identifier '{name}'"))),
        Expr::Member(target, field) => member(eval(target, env)?, field),
        Expr::Index(target, index) => {
            let target = eval(target, env)?;
            let index = eval(index, env)?;
            index_into(target, &index)
        }
        Expr::Call(builtin, args) => {
            let args = args
                .iter()
                .map(|a| eval(a, env))
                .collect::<CarveResult<Vec<_>>>()?;
            call(*builtin, &args)
        }
        Expr::Unary(UnaryOp::Not, operand) => {
            let value = eval(operand, env)?;
            Ok(Value::Bool(!as_bool(&value, "'!'")?))
        }
        Expr::Unary(UnaryOp::Neg, operand) => match eval(operand, env)? {
            Value::Number(n) => match n.as_i64() {
                Some(i) => i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| eval_error("integer overflow")),
                None => float(-n.as_f64().unwrap_or_default()),
            },
            other => Err(eval_error(format!("cannot negate {}", type_name(&other)))),
        },
        Expr::Binary(BinaryOp::And, left, right) => {
            if !as_bool(&eval(left, env)?, "'&&'")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(right, env)?, "'&&'")?))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if as_bool(&eval(left, env)?, "'||'")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(right, env)?, "'||'")?))
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, env)?;
            let right = eval(right, env)?;
            binary(*op, &left, &right)
        }
        Expr::Ternary(condition, then, otherwise) => {
            if as_bool(&eval(condition, env)?, "'?:'")? {
                eval(then, env)
            } else {
                eval(otherwise, env)
            }
        }
    }
}

fn member(target: Value, field: &str) -> CarveResult<Value> {
    match target {
        Value::Object(mut fields) => Ok(fields.remove(field).unwrap_or(Value::Null)),
        Value::Null => Ok(Value::Null),
        other => Err(eval_error(format!(
            "cannot read field '{field}' of {}",
            type_name(&other)
        ))),
    }
}

fn index_into(target: Value, index: &Value) -> CarveResult<Value> {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| eval_error("array index must be an integer"))?;
            let len = items.len() as i64;
            let i = if i < 0 { len + i } else { i };
            Ok(usize::try_from(i)
                .ok()
                .and_then(|i| items.into_iter().nth(i))
                .unwrap_or(Value::Null))
        }
        (Value::Object(mut fields), Value::String(key)) => Ok(fields.remove(key).unwrap_or(Value::Null)),
        (Value::Null, _) => Ok(Value::Null),
        (target, index) => Err(eval_error(format!(
            "cannot index {} with {}",
            type_name(&target),
            type_name(index)
        ))),
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> CarveResult<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Ok(a.cmp(&b));
            }
            let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            a.partial_cmp(&b)
                .ok_or_else(|| eval_error("numbers are not comparable"))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(eval_error(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> CarveResult<bool> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| equals(item, needle))),
        Value::Object(fields) => Ok(fields.contains_key(as_str(needle, "'in' on an object")?)),
        Value::String(s) => Ok(s.contains(as_str(needle, "'in' on a string")?)),
        Value::Null => Ok(false),
        other => Err(eval_error(format!("cannot search in {}", type_name(other)))),
    }
}

fn arithmetic(op: BinaryOp, left: &Number, right: &Number) -> CarveResult<Value> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Rem => {
                if b == 0 {
                    return Err(eval_error("modulo by zero"));
                }
                a.checked_rem(b)
            }
            BinaryOp::Div => {
                if b == 0 {
                    return Err(eval_error("division by zero"));
                }
                match a.checked_rem(b) {
                    Some(0) => a.checked_div(b),
                    Some(_) => return float(a as f64 / b as f64),
                    None => None,
                }
            }
            _ => unreachable!("non-arithmetic operator"),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| eval_error("integer overflow"));
    }

    let (a, b) = (left.as_f64().unwrap_or_default(), right.as_f64().unwrap_or_default());
    match op {
        BinaryOp::Add => float(a + b),
        BinaryOp::Sub => float(a - b),
        BinaryOp::Mul => float(a * b),
        BinaryOp::Div if b == 0.0 => Err(eval_error("division by zero")),
        BinaryOp::Div => float(a / b),
        BinaryOp::Rem if b == 0.0 => Err(eval_error("modulo by zero")),
        BinaryOp::Rem => float(a % b),
        _ => unreachable!("non-arithmetic operator"),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> CarveResult<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(left, right))),
        BinaryOp::Neq => Ok(Value::Bool(!equals(left, right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(left, right)? == Ordering::Less)),
        BinaryOp::Lte => Ok(Value::Bool(compare(left, right)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(left, right)? == Ordering::Greater)),
        BinaryOp::Gte => Ok(Value::Bool(compare(left, right)? != Ordering::Less)),
        BinaryOp::In => Ok(Value::Bool(contains(right, left)?)),
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(stringify(left) + &stringify(right)))
            }
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
            _ => Err(eval_error(format!(
                "cannot add {} and {}",
                type_name(left),
                type_name(right)
            ))),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => match (left, right) {
            (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b),
            _ => Err(eval_error(format!(
                "arithmetic needs numbers, got {} and {}",
                type_name(left),
                type_name(right)
            ))),
        },
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators are handled in eval"),
    }
}

fn call(builtin: Builtin, args: &[Value]) -> CarveResult<Value> {
    let arg = &args[0];
    match builtin {
        Builtin::Len => match arg {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(fields) => Ok(Value::from(fields.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(eval_error(format!("len() of {}", type_name(other)))),
        },
        Builtin::Lower => Ok(Value::String(as_str(arg, "lower()")?.to_lowercase())),
        Builtin::Upper => Ok(Value::String(as_str(arg, "upper()")?.to_uppercase())),
        Builtin::Trim => Ok(Value::String(as_str(arg, "trim()")?.trim().to_string())),
        Builtin::Contains => Ok(Value::Bool(contains(arg, &args[1])?)),
        Builtin::StartsWith => Ok(Value::Bool(
            as_str(arg, "starts_with()")?.starts_with(as_str(&args[1], "starts_with()")?),
        )),
        Builtin::EndsWith => Ok(Value::Bool(
            as_str(arg, "ends_with()")?.ends_with(as_str(&args[1], "ends_with()")?),
        )),
        Builtin::Int => match arg {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::from(i)),
                None => Ok(Value::from(n.as_f64().unwrap_or_default().trunc() as i64)),
            },
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    return Ok(Value::from(i));
                }
                s.parse::<f64>()
                    .map(|f| Value::from(f.trunc() as i64))
                    .map_err(|_| eval_error(format!("int(): '{s}' is not a number")))
            }
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            other => Err(eval_error(format!("int() of {}", type_name(other)))),
        },
        Builtin::Float => match arg {
            Value::Number(n) => float(n.as_f64().unwrap_or_default()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| eval_error(format!("float(): '{s}' is not a number")))
                .and_then(float),
            other => Err(eval_error(format!("float() of {}", type_name(other)))),
        },
        Builtin::String => Ok(Value::String(stringify(arg))),
    }
}
