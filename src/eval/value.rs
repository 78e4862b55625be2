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

use std::fmt;

use crate::tape::{TapeScalar, TapeValue};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    F64(f64),
    I64(i64),
    Bool(bool),
    /// Array handle into machine memory; `len` counts elements.
    Array { base: usize, len: usize },
    /// Struct rvalue, flattened to one value per scalar slot.
    Struct(Vec<Value>),
    /// Address bound to a reference parameter.
    Ref(usize),
    /// Index of a push/pop stack in the current frame.
    Tape(usize),
    Tag(String),
    Void,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            Value::I64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Slot values this value occupies in memory.
    pub fn flatten(self) -> Vec<Value> {
        match self {
            Value::Struct(fields) => fields,
            other => vec![other],
        }
    }

    pub fn to_tape_scalar(&self) -> Option<TapeScalar> {
        match self {
            Value::F64(v) => Some(TapeScalar::F64(*v)),
            Value::I64(v) => Some(TapeScalar::I64(*v)),
            Value::Bool(b) => Some(TapeScalar::Bool(*b)),
            _ => None,
        }
    }

    pub fn from_tape_scalar(s: TapeScalar) -> Value {
        match s {
            TapeScalar::F64(v) => Value::F64(v),
            TapeScalar::I64(v) => Value::I64(v),
            TapeScalar::Bool(b) => Value::Bool(b),
        }
    }
}

/// Snapshot of consecutive slots; `None` if a slot is not a plain scalar.
pub fn snapshot(slots: &[Value]) -> Option<TapeValue> {
    if slots.len() == 1 {
        return slots[0].to_tape_scalar().map(TapeValue::Scalar);
    }
    slots
        .iter()
        .map(Value::to_tape_scalar)
        .collect::<Option<Vec<_>>>()
        .map(TapeValue::Aggregate)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::F64(v) => write!(f, "{}", trim_float(*v)),
            Value::I64(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Array { base, len } => write!(f, "array@{}[{}]", base, len),
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, v) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")
            }
            Value::Ref(addr) => write!(f, "&{}", addr),
            Value::Tape(id) => write!(f, "tape#{}", id),
            Value::Tag(name) => write!(f, "tag<{}>", name),
            Value::Void => write!(f, "void"),
        }
    }
}

fn trim_float(x: f64) -> String {
    let s = format!("{:.6}", x);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}
