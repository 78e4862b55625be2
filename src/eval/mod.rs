// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Reference interpreter for kernel programs.
//!
//! Runs user functions and generated derivatives alike, so derivative
//! values can be checked numerically. Memory is a flat vector of slots:
//! a struct takes one slot per scalar field, an array variable holds a
//! handle to its elements and a reference parameter aliases the caller's
//! slot. Every frame releases the slots it allocated when it returns.

pub mod value;

use std::collections::HashMap;

use crate::ast::{
    AssignOp, BinOp, Block, Expr, ExprKind, Function, Program, Stmt, StmtKind, Type, UnaryOp,
};
use crate::tape::{Interval, RestoreTarget, SmartTape, TapeIntervalViolation, TapeValue};

pub use value::Value;

const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("call to '{name}' with {arity} arguments is ambiguous")]
    Ambiguous { name: String, arity: usize },
    #[error("'{0}' has no body")]
    NoBody(String),
    #[error("unknown variable: {0}")]
    UnknownVar(String),
    #[error("type error: {0}")]
    TypeError(String),
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: i64, len: usize },
    #[error("division by zero")]
    DivZero,
    #[error("integer overflow in {0}")]
    Overflow(String),
    #[error("pop from an empty tape")]
    EmptyTape,
    #[error("expression is not assignable")]
    NotAPlace,
    #[error("'{0}' finished without returning a value")]
    MissingReturn(String),
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
    #[error(transparent)]
    Tape(#[from] TapeIntervalViolation),
}

#[derive(Debug, Default)]
struct Memory {
    slots: Vec<Value>,
}

impl Memory {
    fn alloc(&mut self, values: Vec<Value>) -> usize {
        let base = self.slots.len();
        self.slots.extend(values);
        base
    }

    fn get(&self, addr: usize) -> Result<&Value, EvalError> {
        self.slots.get(addr).ok_or(EvalError::OutOfBounds {
            index: addr as i64,
            len: self.slots.len(),
        })
    }

    fn range(&self, addr: usize, width: usize) -> Result<&[Value], EvalError> {
        self.slots.get(addr..addr + width).ok_or(EvalError::OutOfBounds {
            index: (addr + width) as i64,
            len: self.slots.len(),
        })
    }

    fn set(&mut self, addr: usize, value: Value) -> Result<(), EvalError> {
        let len = self.slots.len();
        let slot = self.slots.get_mut(addr).ok_or(EvalError::OutOfBounds {
            index: addr as i64,
            len,
        })?;
        *slot = value;
        Ok(())
    }
}

impl RestoreTarget for Memory {
    fn write_back(&mut self, start: usize, value: &TapeValue) {
        for (i, s) in value.scalars().iter().enumerate() {
            if let Some(slot) = self.slots.get_mut(start + i) {
                *slot = Value::from_tape_scalar(*s);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    addr: usize,
    ty: Type,
}

/// Resolved storage location.
#[derive(Debug, Clone)]
struct Place {
    addr: usize,
    ty: Type,
}

#[derive(Debug, Default)]
struct Frame {
    vars: HashMap<String, Binding>,
    tapes: Vec<Vec<Vec<Value>>>,
    smart: SmartTape,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Machine<'p> {
    program: &'p Program,
    memory: Memory,
    frames: Vec<Frame>,
}

impl<'p> Machine<'p> {
    pub fn new(program: &'p Program) -> Self {
        Machine {
            program,
            memory: Memory::default(),
            frames: Vec::new(),
        }
    }

    /// Allocate a host-owned `f64` array and return its handle.
    pub fn alloc_array(&mut self, values: &[f64]) -> Value {
        let base = self
            .memory
            .alloc(values.iter().map(|v| Value::F64(*v)).collect());
        Value::Array {
            base,
            len: values.len(),
        }
    }

    /// Allocate a host-owned `f64` slot and return a reference to it.
    pub fn alloc_scalar(&mut self, value: f64) -> Value {
        Value::Ref(self.memory.alloc(vec![Value::F64(value)]))
    }

    pub fn read_array(&self, handle: &Value) -> Result<Vec<f64>, EvalError> {
        let Value::Array { base, len } = handle else {
            return Err(EvalError::TypeError(format!("expected an array, got {}", handle)));
        };
        self.memory
            .range(*base, *len)?
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| EvalError::TypeError(format!("non-numeric element {}", v)))
            })
            .collect()
    }

    pub fn read_scalar(&self, value: &Value) -> Result<f64, EvalError> {
        let v = match value {
            Value::Ref(addr) => self.memory.get(*addr)?,
            other => other,
        };
        v.as_f64()
            .ok_or_else(|| EvalError::TypeError(format!("expected a number, got {}", v)))
    }

    /// Call `name` with host values. Reference parameters take `Value::Ref`.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let func = self.resolve(name, args.len())?;
        self.invoke(func, args.to_vec())
    }

    fn resolve(&self, name: &str, arity: usize) -> Result<&'p Function, EvalError> {
        let program: &'p Program = self.program;
        let mut candidates = program
            .functions
            .iter()
            .filter(|f| f.qualified_name() == name && f.params.len() == arity);
        let first = candidates.next().ok_or_else(|| {
            if program.functions.iter().any(|f| f.qualified_name() == name) {
                EvalError::TypeError(format!("no overload of '{}' takes {} arguments", name, arity))
            } else {
                EvalError::UnknownFunction(name.to_string())
            }
        })?;
        if candidates.next().is_some() {
            return Err(EvalError::Ambiguous {
                name: name.to_string(),
                arity,
            });
        }
        Ok(first)
    }

    fn width(&self, ty: &Type) -> usize {
        match ty.deref() {
            Type::Struct(name) => self
                .program
                .struct_def(name)
                .map(|s| s.fields.iter().map(|f| self.width(&f.ty)).sum())
                .unwrap_or(1),
            _ => 1,
        }
    }

    fn field_offset(&self, ty: &Type, field: &str) -> Result<(usize, Type), EvalError> {
        let name = ty.struct_name().ok_or_else(|| {
            EvalError::TypeError(format!("field '{}' on non-struct {}", field, ty))
        })?;
        let def = self
            .program
            .struct_def(name)
            .ok_or_else(|| EvalError::TypeError(format!("unknown struct '{}'", name)))?;
        let mut offset = 0;
        for f in &def.fields {
            if f.name == field {
                return Ok((offset, f.ty.clone()));
            }
            offset += self.width(&f.ty);
        }
        Err(EvalError::TypeError(format!("'{}' has no field '{}'", name, field)))
    }

    fn zero(&mut self, ty: &Type) -> Value {
        match ty.deref() {
            Type::F64 => Value::F64(0.0),
            Type::I64 => Value::I64(0),
            Type::Bool => Value::Bool(false),
            Type::Array(_) => Value::Array { base: 0, len: 0 },
            Type::Struct(name) => {
                let fields: Vec<Type> = self
                    .program
                    .struct_def(name)
                    .map(|s| s.fields.iter().map(|f| f.ty.clone()).collect())
                    .unwrap_or_default();
                let mut slots = Vec::new();
                for f in &fields {
                    slots.extend(self.zero(f).flatten());
                }
                Value::Struct(slots)
            }
            Type::Tape => {
                let frame = self.frame_mut();
                frame.tapes.push(Vec::new());
                Value::Tape(frame.tapes.len() - 1)
            }
            Type::Tag(name) => Value::Tag(name.clone()),
            Type::Ref(_) | Type::Void => Value::Void,
        }
    }

    /// Convert a value to the representation of `ty` before storing it.
    fn coerce(ty: &Type, value: Value) -> Value {
        match (ty.deref(), value) {
            (Type::F64, Value::I64(v)) => Value::F64(v as f64),
            (_, v) => v,
        }
    }

    fn frame(&self) -> &Frame {
        // A frame is always pushed before any body runs.
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn invoke(&mut self, func: &'p Function, args: Vec<Value>) -> Result<Value, EvalError> {
        let Some(body) = &func.body else {
            return Err(EvalError::NoBody(func.qualified_name()));
        };
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(EvalError::StackOverflow(MAX_CALL_DEPTH));
        }
        let mark = self.memory.slots.len();
        self.frames.push(Frame::default());
        let result = self.run_body(func, body, args);
        self.frames.pop();
        self.memory.slots.truncate(mark);
        result
    }

    fn run_body(
        &mut self,
        func: &'p Function,
        body: &'p Block,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        for (param, arg) in func.params.iter().zip(args) {
            let binding = match (&param.ty, arg) {
                (Type::Ref(inner), Value::Ref(addr)) => Binding {
                    addr,
                    ty: (**inner).clone(),
                },
                (Type::Ref(_), other) => {
                    return Err(EvalError::TypeError(format!(
                        "parameter '{}' of '{}' expects a reference, got {}",
                        param.name,
                        func.qualified_name(),
                        other
                    )))
                }
                (ty, value) => {
                    let addr = self.memory.alloc(Self::coerce(ty, value).flatten());
                    Binding {
                        addr,
                        ty: ty.clone(),
                    }
                }
            };
            self.frame_mut().vars.insert(param.name.clone(), binding);
        }
        match self.exec_block(body)? {
            Flow::Return(v) => Ok(Self::coerce(&func.ret, v)),
            _ if func.ret == Type::Void => Ok(Value::Void),
            _ => Err(EvalError::MissingReturn(func.qualified_name())),
        }
    }

    fn exec_block(&mut self, block: &'p Block) -> Result<Flow, EvalError> {
        for stmt in &block.stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &'p Stmt) -> Result<Flow, EvalError> {
        match &stmt.kind {
            StmtKind::Let { name, ty, value, .. } => {
                let v = match value {
                    Some(e) => Self::coerce(ty, self.eval(e)?),
                    None => self.zero(ty),
                };
                self.bind_local(name, ty, v)?;
            }
            StmtKind::Assign { target, op, value } => {
                let place = self.place(target)?;
                let rhs = self.eval(value)?;
                let new = match op.binop() {
                    None => rhs,
                    Some(bin) => {
                        let old = self.read(&place)?;
                        arith(bin, old, rhs)?
                    }
                };
                self.write(&place, new)?;
            }
            StmtKind::Expr(e) => {
                self.eval(e)?;
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                if self.truth(cond)? {
                    return self.exec_block(then_block);
                } else if let Some(b) = else_block {
                    return self.exec_block(b);
                }
            }
            StmtKind::While { cond, body } => {
                while self.truth(cond)? {
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For {
                var,
                start,
                end,
                body,
                ..
            } => {
                let lo = self.int(start)?;
                let hi = self.int(end)?;
                let addr = self.bind_local(var, &Type::I64, Value::I64(lo))?;
                loop {
                    let i = self
                        .memory
                        .get(addr)?
                        .as_i64()
                        .ok_or_else(|| EvalError::TypeError(format!("loop variable '{}'", var)))?;
                    if i >= hi {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    let i = self.memory.get(addr)?.as_i64().unwrap_or(i);
                    self.memory.set(addr, Value::I64(i + 1))?;
                }
            }
            StmtKind::Return(value) => {
                let v = match value {
                    Some(e) => self.eval(e)?,
                    None => Value::Void,
                };
                return Ok(Flow::Return(v));
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Block(b) => return self.exec_block(b),
        }
        Ok(Flow::Normal)
    }

    /// Bind a local, reusing its slots when the name is re-declared with the
    /// same type (loop bodies, sibling scopes).
    fn bind_local(&mut self, name: &str, ty: &Type, value: Value) -> Result<usize, EvalError> {
        let existing = self
            .frame()
            .vars
            .get(name)
            .filter(|b| &b.ty == ty)
            .map(|b| b.addr);
        let addr = match existing {
            Some(addr) => {
                for (i, v) in value.flatten().into_iter().enumerate() {
                    self.memory.set(addr + i, v)?;
                }
                addr
            }
            None => {
                let addr = self.memory.alloc(value.flatten());
                self.frame_mut().vars.insert(
                    name.to_string(),
                    Binding {
                        addr,
                        ty: ty.clone(),
                    },
                );
                addr
            }
        };
        Ok(addr)
    }

    fn truth(&mut self, e: &'p Expr) -> Result<bool, EvalError> {
        let v = self.eval(e)?;
        v.as_bool()
            .ok_or_else(|| EvalError::TypeError(format!("condition evaluated to {}", v)))
    }

    fn int(&mut self, e: &'p Expr) -> Result<i64, EvalError> {
        let v = self.eval(e)?;
        v.as_i64()
            .ok_or_else(|| EvalError::TypeError(format!("expected an integer, got {}", v)))
    }

    fn place(&mut self, e: &'p Expr) -> Result<Place, EvalError> {
        match &e.kind {
            ExprKind::Var(name) => {
                let b = self
                    .frame()
                    .vars
                    .get(name)
                    .ok_or_else(|| EvalError::UnknownVar(name.clone()))?;
                Ok(Place {
                    addr: b.addr,
                    ty: b.ty.clone(),
                })
            }
            ExprKind::Index { base, index } => {
                let base = self.place(base)?;
                let elem = base.ty.elem().cloned().ok_or_else(|| {
                    EvalError::TypeError(format!("indexing non-array {}", base.ty))
                })?;
                let idx = self.int(index)?;
                let (start, len) = match self.memory.get(base.addr)? {
                    Value::Array { base, len } => (*base, *len),
                    other => return Err(EvalError::TypeError(format!("indexing {}", other))),
                };
                if idx < 0 || idx as usize >= len {
                    return Err(EvalError::OutOfBounds { index: idx, len });
                }
                let w = self.width(&elem);
                Ok(Place {
                    addr: start + idx as usize * w,
                    ty: elem,
                })
            }
            ExprKind::Field { base, field } => {
                let base = self.place(base)?;
                let (offset, ty) = self.field_offset(&base.ty, field)?;
                Ok(Place {
                    addr: base.addr + offset,
                    ty,
                })
            }
            _ => Err(EvalError::NotAPlace),
        }
    }

    fn read(&self, place: &Place) -> Result<Value, EvalError> {
        if place.ty.struct_name().is_some() {
            let w = self.width(&place.ty);
            return Ok(Value::Struct(self.memory.range(place.addr, w)?.to_vec()));
        }
        Ok(self.memory.get(place.addr)?.clone())
    }

    fn write(&mut self, place: &Place, value: Value) -> Result<(), EvalError> {
        let value = Self::coerce(&place.ty, value);
        for (i, v) in value.flatten().into_iter().enumerate() {
            self.memory.set(place.addr + i, v)?;
        }
        Ok(())
    }

    /// Slots covered by a place; a whole array covers its elements.
    fn extent(&self, place: &Place) -> Result<(usize, usize), EvalError> {
        if let Some(elem) = place.ty.elem() {
            let w = self.width(elem);
            return match self.memory.get(place.addr)? {
                Value::Array { base, len } => Ok((*base, *len * w)),
                other => Err(EvalError::TypeError(format!("expected an array, got {}", other))),
            };
        }
        Ok((place.addr, self.width(&place.ty)))
    }

    fn tape_index(&mut self, e: &'p Expr) -> Result<usize, EvalError> {
        match self.eval(e)? {
            Value::Tape(id) => Ok(id),
            other => Err(EvalError::TypeError(format!("expected a tape, got {}", other))),
        }
    }

    fn eval(&mut self, e: &'p Expr) -> Result<Value, EvalError> {
        match &e.kind {
            ExprKind::Float(v) => Ok(Value::F64(*v)),
            ExprKind::Int(v) => Ok(Value::I64(*v)),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Tag(name) => Ok(Value::Tag(name.clone())),
            ExprKind::Var(_) | ExprKind::Index { .. } => {
                let place = self.place(e)?;
                self.read(&place)
            }
            ExprKind::Field { base, field } => {
                if base.is_place() {
                    let place = self.place(e)?;
                    return self.read(&place);
                }
                let ty = self.static_type(base)?;
                let (offset, fty) = self.field_offset(&ty, field)?;
                let slots = self.eval(base)?.flatten();
                let w = self.width(&fty);
                let part = slots
                    .get(offset..offset + w)
                    .ok_or_else(|| EvalError::TypeError(format!("field '{}' out of range", field)))?
                    .to_vec();
                Ok(if fty.struct_name().is_some() {
                    Value::Struct(part)
                } else {
                    part.into_iter().next().unwrap_or(Value::Void)
                })
            }
            ExprKind::Unary { op, operand } => {
                let v = self.eval(operand)?;
                match (op, v) {
                    (UnaryOp::Neg, Value::F64(x)) => Ok(Value::F64(-x)),
                    (UnaryOp::Neg, Value::I64(x)) => Ok(Value::I64(x.wrapping_neg())),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (op, v) => Err(EvalError::TypeError(format!("cannot apply {:?} to {}", op, v))),
                }
            }
            ExprKind::Binary { op, left, right } => match op {
                BinOp::And => Ok(Value::Bool(self.truth(left)? && self.truth(right)?)),
                BinOp::Or => Ok(Value::Bool(self.truth(left)? || self.truth(right)?)),
                _ => {
                    let l = self.eval(left)?;
                    let r = self.eval(right)?;
                    arith(*op, l, r)
                }
            },
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                if self.truth(cond)? {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }
            ExprKind::Call { callee, args } => self.eval_call(callee, args),
            ExprKind::StructLit { name, fields } => {
                let def = self
                    .program
                    .struct_def(name)
                    .ok_or_else(|| EvalError::TypeError(format!("unknown struct '{}'", name)))?;
                let mut slots = Vec::new();
                for fd in &def.fields {
                    let v = match fields.iter().find(|(n, _)| n == &fd.name) {
                        Some((_, fe)) => Self::coerce(&fd.ty, self.eval(fe)?),
                        None => self.zero(&fd.ty),
                    };
                    slots.extend(v.flatten());
                }
                Ok(Value::Struct(slots))
            }
            ExprKind::ArrayFill { value, len } => {
                let v = self.eval(value)?;
                let n = self.int(len)?;
                if n < 0 {
                    return Err(EvalError::OutOfBounds { index: n, len: 0 });
                }
                let elem = v.flatten();
                let mut slots = Vec::with_capacity(elem.len() * n as usize);
                for _ in 0..n {
                    slots.extend(elem.iter().cloned());
                }
                let base = self.memory.alloc(slots);
                Ok(Value::Array {
                    base,
                    len: n as usize,
                })
            }
            ExprKind::ArrayLit(items) => {
                let mut values = Vec::with_capacity(items.len());
                for i in items {
                    values.push(self.eval(i)?);
                }
                let promote = values.iter().any(|v| matches!(v, Value::F64(_)));
                let slots: Vec<Value> = values
                    .into_iter()
                    .flat_map(|v| {
                        if promote {
                            Self::coerce(&Type::F64, v).flatten()
                        } else {
                            v.flatten()
                        }
                    })
                    .collect();
                let len = items.len();
                let base = self.memory.alloc(slots);
                Ok(Value::Array { base, len })
            }
        }
    }

    /// Struct type of a non-place expression (calls, literals).
    fn static_type(&self, e: &Expr) -> Result<Type, EvalError> {
        match &e.kind {
            ExprKind::StructLit { name, .. } => Ok(Type::Struct(name.clone())),
            ExprKind::Call { callee, args } => Ok(self.resolve(callee, args.len())?.ret.clone()),
            ExprKind::Field { base, field } => {
                let ty = self.static_type(base)?;
                Ok(self.field_offset(&ty, field)?.1)
            }
            ExprKind::Var(name) => self
                .frame()
                .vars
                .get(name)
                .map(|b| b.ty.clone())
                .ok_or_else(|| EvalError::UnknownVar(name.clone())),
            _ => Err(EvalError::NotAPlace),
        }
    }

    fn eval_call(&mut self, callee: &str, args: &'p [Expr]) -> Result<Value, EvalError> {
        if callee.starts_with("__") {
            return self.eval_intrinsic(callee, args);
        }
        if callee == "len" {
            let place = self.place(args.first().ok_or(EvalError::NotAPlace)?)?;
            return match self.memory.get(place.addr)? {
                Value::Array { len, .. } => Ok(Value::I64(*len as i64)),
                other => Err(EvalError::TypeError(format!("len of {}", other))),
            };
        }
        if crate::types::BUILTINS.contains(&callee) {
            let mut xs = Vec::with_capacity(args.len());
            for a in args {
                let v = self.eval(a)?;
                xs.push(
                    v.as_f64()
                        .ok_or_else(|| EvalError::TypeError(format!("{}({})", callee, v)))?,
                );
            }
            return builtin(callee, &xs);
        }
        let func = self.resolve(callee, args.len())?;
        let mut values = Vec::with_capacity(args.len());
        for (param, arg) in func.params.iter().zip(args) {
            if param.ty.is_ref() {
                values.push(Value::Ref(self.place(arg)?.addr));
            } else {
                values.push(self.eval(arg)?);
            }
        }
        self.invoke(func, values)
    }

    fn eval_intrinsic(&mut self, name: &str, args: &'p [Expr]) -> Result<Value, EvalError> {
        let arg = |i: usize| args.get(i).ok_or(EvalError::NotAPlace);
        match name {
            "__push" => {
                let t = self.tape_index(arg(0)?)?;
                let v = self.eval(arg(1)?)?;
                self.push_tape(t, v.clone().flatten())?;
                Ok(v)
            }
            "__pop" => {
                let t = self.tape_index(arg(0)?)?;
                let mut slots = self.pop_tape(t)?;
                Ok(if slots.len() == 1 {
                    slots.pop().unwrap_or(Value::Void)
                } else {
                    Value::Struct(slots)
                })
            }
            "__push_mem" => {
                let t = self.tape_index(arg(0)?)?;
                let place = self.place(arg(1)?)?;
                let (start, w) = self.extent(&place)?;
                let slots = self.memory.range(start, w)?.to_vec();
                self.push_tape(t, slots)?;
                Ok(Value::Void)
            }
            "__pop_mem" => {
                let t = self.tape_index(arg(0)?)?;
                let place = self.place(arg(1)?)?;
                let (start, _) = self.extent(&place)?;
                for (i, v) in self.pop_tape(t)?.into_iter().enumerate() {
                    self.memory.set(start + i, v)?;
                }
                Ok(Value::Void)
            }
            "__tape_store" => {
                let place = self.place(arg(0)?)?;
                let (start, w) = self.extent(&place)?;
                let at = if w == 1 && place.ty.elem().is_none() {
                    Interval::point(start)
                } else {
                    Interval::range(start, start + w)
                };
                if let Some(snap) = value::snapshot(self.memory.range(start, w)?) {
                    let frame = self.frames.len() - 1;
                    self.frames[frame].smart.store(at, snap)?;
                }
                Ok(Value::Void)
            }
            "__tape_ignore" => {
                let place = self.place(arg(0)?)?;
                let (start, w) = self.extent(&place)?;
                if w > 0 {
                    self.frame_mut().smart.ignore(start, w)?;
                }
                Ok(Value::Void)
            }
            "__tape_restore" => {
                let frame = self.frames.len() - 1;
                self.frames[frame].smart.restore(&mut self.memory);
                Ok(Value::Void)
            }
            other => Err(EvalError::UnknownFunction(other.to_string())),
        }
    }

    fn push_tape(&mut self, t: usize, slots: Vec<Value>) -> Result<(), EvalError> {
        let tape = self
            .frame_mut()
            .tapes
            .get_mut(t)
            .ok_or_else(|| EvalError::TypeError(format!("no tape #{}", t)))?;
        tape.push(slots);
        Ok(())
    }

    fn pop_tape(&mut self, t: usize) -> Result<Vec<Value>, EvalError> {
        self.frame_mut()
            .tapes
            .get_mut(t)
            .and_then(|tape| tape.pop())
            .ok_or(EvalError::EmptyTape)
    }
}

fn arith(op: BinOp, l: Value, r: Value) -> Result<Value, EvalError> {
    use Value::*;
    match (l, r) {
        (I64(a), I64(b)) => Ok(match op {
            BinOp::Add => I64(a.wrapping_add(b)),
            BinOp::Sub => I64(a.wrapping_sub(b)),
            BinOp::Mul => I64(a.wrapping_mul(b)),
            BinOp::Div => match a.checked_div(b) {
                Some(q) => I64(q),
                None if b == 0 => return Err(EvalError::DivZero),
                None => return Err(EvalError::Overflow(format!("{} / {}", a, b))),
            },
            BinOp::Lt => Bool(a < b),
            BinOp::Le => Bool(a <= b),
            BinOp::Gt => Bool(a > b),
            BinOp::Ge => Bool(a >= b),
            BinOp::Eq => Bool(a == b),
            BinOp::Ne => Bool(a != b),
            BinOp::And | BinOp::Or => {
                return Err(EvalError::TypeError("logical operator on integers".into()))
            }
        }),
        (Bool(a), Bool(b)) => match op {
            BinOp::Eq => Ok(Bool(a == b)),
            BinOp::Ne => Ok(Bool(a != b)),
            BinOp::And => Ok(Bool(a && b)),
            BinOp::Or => Ok(Bool(a || b)),
            _ => Err(EvalError::TypeError(format!("'{}' on booleans", op.symbol()))),
        },
        (l, r) => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(EvalError::TypeError(format!(
                    "cannot apply '{}' to {} and {}",
                    op.symbol(),
                    l,
                    r
                )));
            };
            Ok(match op {
                BinOp::Add => F64(a + b),
                BinOp::Sub => F64(a - b),
                BinOp::Mul => F64(a * b),
                BinOp::Div => F64(a / b),
                BinOp::Lt => Bool(a < b),
                BinOp::Le => Bool(a <= b),
                BinOp::Gt => Bool(a > b),
                BinOp::Ge => Bool(a >= b),
                BinOp::Eq => Bool(a == b),
                BinOp::Ne => Bool(a != b),
                BinOp::And | BinOp::Or => {
                    return Err(EvalError::TypeError("logical operator on numbers".into()))
                }
            })
        }
    }
}

fn builtin(name: &str, xs: &[f64]) -> Result<Value, EvalError> {
    let x = xs.first().copied().unwrap_or(0.0);
    let v = match name {
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "exp" => x.exp(),
        "log" => x.ln(),
        "sqrt" => x.sqrt(),
        "abs" => x.abs(),
        "tanh" => x.tanh(),
        "pow" => x.powf(xs.get(1).copied().unwrap_or(1.0)),
        other => return Err(EvalError::UnknownFunction(other.to_string())),
    };
    Ok(Value::F64(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn program(src: &str) -> Program {
        parser::parse(src).expect("parse")
    }

    #[test]
    fn runs_loops_and_arrays() {
        let p = program(
            "fn sum(a: [f64]) -> f64 { let s: f64; for i in 0..len(a) { s += a[i]; } return s; }",
        );
        let mut m = Machine::new(&p);
        let a = m.alloc_array(&[1.0, 2.0, 3.5]);
        assert_eq!(m.call("sum", &[a]).unwrap(), Value::F64(6.5));
    }

    #[test]
    fn reference_parameters_alias_caller_slots() {
        let p = program(
            "fn bump(x: &f64, k: f64) { x += k; }
            fn twice(y: f64) -> f64 { bump(y, 1.0); bump(y, 1.0); return y; }",
        );
        let mut m = Machine::new(&p);
        assert_eq!(m.call("twice", &[Value::F64(1.0)]).unwrap(), Value::F64(3.0));
        let r = m.alloc_scalar(0.5);
        m.call("bump", &[r.clone(), Value::F64(2.0)]).unwrap();
        assert_eq!(m.read_scalar(&r).unwrap(), 2.5);
    }

    #[test]
    fn structs_and_methods() {
        let p = program(
            "struct P { x: f64, y: f64 }
            impl P { fn norm2(p: P) -> f64 { return p.x * p.x + p.y * p.y; } }
            fn f(a: f64) -> f64 { let q: P = P { y: 2.0, x: a }; q.y *= 2.0; return P::norm2(q); }",
        );
        let mut m = Machine::new(&p);
        assert_eq!(m.call("f", &[Value::F64(3.0)]).unwrap(), Value::F64(25.0));
    }

    #[test]
    fn integer_division_truncates() {
        let p = program("fn f(n: i64) -> f64 { let k: i64 = n / 2; return k * 1.5; }");
        let mut m = Machine::new(&p);
        assert_eq!(m.call("f", &[Value::I64(5)]).unwrap(), Value::F64(3.0));
    }

    #[test]
    fn integer_division_overflow_is_an_error() {
        let p = program("fn f(a: i64, b: i64) -> i64 { return a / b; }");
        let mut m = Machine::new(&p);
        let err = m
            .call("f", &[Value::I64(i64::MIN), Value::I64(-1)])
            .unwrap_err();
        assert!(matches!(err, EvalError::Overflow(_)), "{err}");
        assert!(matches!(
            m.call("f", &[Value::I64(1), Value::I64(0)]),
            Err(EvalError::DivZero)
        ));
        assert_eq!(m.call("f", &[Value::I64(-7), Value::I64(2)]).unwrap(), Value::I64(-3));
    }

    #[test]
    fn break_and_continue() {
        let p = program(
            "fn f(n: i64) -> i64 {
                let s: i64;
                for i in 0..n { if i == 1 { continue; } if i == 4 { break; } s += i; }
                return s;
            }",
        );
        let mut m = Machine::new(&p);
        assert_eq!(m.call("f", &[Value::I64(10)]).unwrap(), Value::I64(5));
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let p = program("fn f(a: [f64]) -> f64 { return a[3]; }");
        let mut m = Machine::new(&p);
        let a = m.alloc_array(&[1.0]);
        assert!(matches!(
            m.call("f", &[a]),
            Err(EvalError::OutOfBounds { index: 3, len: 1 })
        ));
    }

    #[test]
    fn frame_memory_is_released() {
        let p = program("fn f(n: i64) -> f64 { let a: [f64] = [1.0; n]; return a[0]; }");
        let mut m = Machine::new(&p);
        let before = m.memory.slots.len();
        m.call("f", &[Value::I64(100)]).unwrap();
        assert_eq!(m.memory.slots.len(), before);
    }
}
