//! Expression collaborator contract consumed by the update pipeline.
//!
//! The full query expression language lives outside this crate; the update
//! executor only needs `decode` and `eval` against a property context. The
//! tree here covers constants, property references, arithmetic, comparisons
//! and boolean connectives, which is the surface the storage-side update
//! and filter paths consume.

use std::collections::HashMap;

use crate::error::{Result, StoreError};
use crate::row::Value;

const TAG_CONST: u8 = 0x00;
const TAG_PROP: u8 = 0x01;
const TAG_ADD: u8 = 0x02;
const TAG_SUB: u8 = 0x03;
const TAG_MUL: u8 = 0x04;
const TAG_EQ: u8 = 0x10;
const TAG_NE: u8 = 0x11;
const TAG_LT: u8 = 0x12;
const TAG_GT: u8 = 0x13;
const TAG_AND: u8 = 0x20;
const TAG_OR: u8 = 0x21;
const TAG_NOT: u8 = 0x22;

// Request bytes are untrusted; bound decode recursion so a hostile chain
// of unary or binary tags cannot exhaust the stack.
const MAX_EXPR_DEPTH: usize = 128;

/// Property environment an expression evaluates against.
///
/// The executor materializes every property the request's expressions can
/// reference before evaluation starts, and writes each computed result back
/// immediately so later expressions in the same request observe it.
#[derive(Default, Debug)]
pub struct UpdateContext {
    props: HashMap<String, Value>,
}

impl UpdateContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or overwrites) one property.
    pub fn set_prop(&mut self, name: impl Into<String>, value: Value) {
        self.props.insert(name.into(), value);
    }

    /// Reads one property.
    pub fn prop(&self, name: &str) -> Option<&Value> {
        self.props.get(name)
    }

    /// The full property map.
    pub fn props(&self) -> &HashMap<String, Value> {
        &self.props
    }

    /// Consumes the context, yielding the property map.
    pub fn into_props(self) -> HashMap<String, Value> {
        self.props
    }
}

/// A decoded update or filter expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Literal value.
    Const(Value),
    /// Reference to a context property.
    Prop(String),
    /// Addition; string operands concatenate.
    Add(Box<Expr>, Box<Expr>),
    /// Subtraction.
    Sub(Box<Expr>, Box<Expr>),
    /// Multiplication.
    Mul(Box<Expr>, Box<Expr>),
    /// Equality.
    Eq(Box<Expr>, Box<Expr>),
    /// Inequality.
    Ne(Box<Expr>, Box<Expr>),
    /// Strict less-than.
    Lt(Box<Expr>, Box<Expr>),
    /// Strict greater-than.
    Gt(Box<Expr>, Box<Expr>),
    /// Boolean conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Boolean disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Boolean negation.
    Not(Box<Expr>),
}

impl Expr {
    /// Serializes the expression into the wire form `decode` accepts.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Expr::Const(v) => {
                out.push(TAG_CONST);
                v.encode_into(out);
            }
            Expr::Prop(name) => {
                out.push(TAG_PROP);
                out.extend_from_slice(&(name.len() as u16).to_be_bytes());
                out.extend_from_slice(name.as_bytes());
            }
            Expr::Add(l, r) => encode_binary(TAG_ADD, l, r, out),
            Expr::Sub(l, r) => encode_binary(TAG_SUB, l, r, out),
            Expr::Mul(l, r) => encode_binary(TAG_MUL, l, r, out),
            Expr::Eq(l, r) => encode_binary(TAG_EQ, l, r, out),
            Expr::Ne(l, r) => encode_binary(TAG_NE, l, r, out),
            Expr::Lt(l, r) => encode_binary(TAG_LT, l, r, out),
            Expr::Gt(l, r) => encode_binary(TAG_GT, l, r, out),
            Expr::And(l, r) => encode_binary(TAG_AND, l, r, out),
            Expr::Or(l, r) => encode_binary(TAG_OR, l, r, out),
            Expr::Not(e) => {
                out.push(TAG_NOT);
                e.encode_into(out);
            }
        }
    }

    /// Decodes a serialized expression. Malformed input is `InvalidData`,
    /// including trees nested deeper than the decoder's fixed depth bound.
    pub fn decode(raw: &[u8]) -> Result<Expr> {
        let (expr, used) = Self::decode_from(raw, 0)?;
        if used != raw.len() {
            return Err(StoreError::InvalidData(
                "trailing bytes after expression".into(),
            ));
        }
        Ok(expr)
    }

    fn decode_from(src: &[u8], depth: usize) -> Result<(Expr, usize)> {
        if depth >= MAX_EXPR_DEPTH {
            return Err(StoreError::InvalidData(
                "expression nested too deeply".into(),
            ));
        }
        let tag = *src
            .first()
            .ok_or_else(|| StoreError::InvalidData("expression truncated".into()))?;
        let body = &src[1..];
        match tag {
            TAG_CONST => {
                let (value, used) = Value::decode_from(body)?;
                Ok((Expr::Const(value), 1 + used))
            }
            TAG_PROP => {
                if body.len() < 2 {
                    return Err(StoreError::InvalidData("prop name truncated".into()));
                }
                let len = u16::from_be_bytes([body[0], body[1]]) as usize;
                if body.len() < 2 + len {
                    return Err(StoreError::InvalidData("prop name truncated".into()));
                }
                let name = std::str::from_utf8(&body[2..2 + len])
                    .map_err(|_| StoreError::InvalidData("prop name not utf-8".into()))?;
                Ok((Expr::Prop(name.to_string()), 3 + len))
            }
            TAG_NOT => {
                let (inner, used) = Self::decode_from(body, depth + 1)?;
                Ok((Expr::Not(Box::new(inner)), 1 + used))
            }
            TAG_ADD | TAG_SUB | TAG_MUL | TAG_EQ | TAG_NE | TAG_LT | TAG_GT | TAG_AND
            | TAG_OR => {
                let (lhs, l_used) = Self::decode_from(body, depth + 1)?;
                let (rhs, r_used) = Self::decode_from(&body[l_used..], depth + 1)?;
                let l = Box::new(lhs);
                let r = Box::new(rhs);
                let expr = match tag {
                    TAG_ADD => Expr::Add(l, r),
                    TAG_SUB => Expr::Sub(l, r),
                    TAG_MUL => Expr::Mul(l, r),
                    TAG_EQ => Expr::Eq(l, r),
                    TAG_NE => Expr::Ne(l, r),
                    TAG_LT => Expr::Lt(l, r),
                    TAG_GT => Expr::Gt(l, r),
                    TAG_AND => Expr::And(l, r),
                    _ => Expr::Or(l, r),
                };
                Ok((expr, 1 + l_used + r_used))
            }
            other => Err(StoreError::InvalidData(format!(
                "unknown expression tag {other}"
            ))),
        }
    }

    /// Evaluates the expression. Unknown properties and operand type
    /// mismatches are `InvalidData`; null operands propagate as null
    /// through arithmetic and compare unequal to everything.
    pub fn eval(&self, ctx: &UpdateContext) -> Result<Value> {
        match self {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Prop(name) => ctx
                .prop(name)
                .cloned()
                .ok_or_else(|| StoreError::InvalidData(format!("unknown property {name}"))),
            Expr::Add(l, r) => arith(l.eval(ctx)?, r.eval(ctx)?, ArithOp::Add),
            Expr::Sub(l, r) => arith(l.eval(ctx)?, r.eval(ctx)?, ArithOp::Sub),
            Expr::Mul(l, r) => arith(l.eval(ctx)?, r.eval(ctx)?, ArithOp::Mul),
            Expr::Eq(l, r) => compare(l.eval(ctx)?, r.eval(ctx)?, CmpOp::Eq),
            Expr::Ne(l, r) => compare(l.eval(ctx)?, r.eval(ctx)?, CmpOp::Ne),
            Expr::Lt(l, r) => compare(l.eval(ctx)?, r.eval(ctx)?, CmpOp::Lt),
            Expr::Gt(l, r) => compare(l.eval(ctx)?, r.eval(ctx)?, CmpOp::Gt),
            Expr::And(l, r) => Ok(Value::Bool(truthy(l.eval(ctx)?)? && truthy(r.eval(ctx)?)?)),
            Expr::Or(l, r) => Ok(Value::Bool(truthy(l.eval(ctx)?)? || truthy(r.eval(ctx)?)?)),
            Expr::Not(e) => Ok(Value::Bool(!truthy(e.eval(ctx)?)?)),
        }
    }
}

fn encode_binary(tag: u8, l: &Expr, r: &Expr, out: &mut Vec<u8>) {
    out.push(tag);
    l.encode_into(out);
    r.encode_into(out);
}

enum ArithOp {
    Add,
    Sub,
    Mul,
}

fn arith(l: Value, r: Value, op: ArithOp) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
            ArithOp::Add => a.wrapping_add(b),
            ArithOp::Sub => a.wrapping_sub(b),
            ArithOp::Mul => a.wrapping_mul(b),
        })),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
        })),
        (Value::Int(a), Value::Float(b)) => arith(Value::Float(a as f64), Value::Float(b), op),
        (Value::Float(a), Value::Int(b)) => arith(Value::Float(a), Value::Float(b as f64), op),
        (Value::Str(a), Value::Str(b)) if matches!(op, ArithOp::Add) => Ok(Value::Str(a + &b)),
        _ => Err(StoreError::InvalidData(
            "operand types not arithmetic-compatible".into(),
        )),
    }
}

enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
}

fn compare(l: Value, r: Value, op: CmpOp) -> Result<Value> {
    if l.is_null() || r.is_null() {
        // Null compares unequal to everything, including null.
        return Ok(Value::Bool(matches!(op, CmpOp::Ne)));
    }
    let ordering = match (&l, &r) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
        (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
        (Value::Bytes(a), Value::Bytes(b)) => a.partial_cmp(b),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return Err(StoreError::InvalidData(
            "operand types not comparable".into(),
        ));
    };
    let result = match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::Ne => ordering.is_ne(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Gt => ordering.is_gt(),
    };
    Ok(Value::Bool(result))
}

fn truthy(v: Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        _ => Err(StoreError::InvalidData(
            "boolean operator on non-boolean operand".into(),
        )),
    }
}
