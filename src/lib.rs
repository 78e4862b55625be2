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

//! Source-to-source automatic differentiation for the MIND kernel language.
//!
//! Source is parsed into [`ast::Program`], derivative requests are served by
//! [`diff::DerivativeBuilder`], and the generated functions can be run with
//! the reference interpreter in [`eval`].
pub mod analysis;
pub mod ast;
pub mod cfg;
pub mod config;
pub mod diagnostics;
pub mod diff;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod pipeline;
pub mod tape;
pub mod types;

pub use config::{ConfigError, EngineConfig};
pub use diff::{DerivativeBuilder, DerivativeResult, DiffError, DiffMode, DiffRequest};
pub use eval::{EvalError, Machine, Value};
pub use pipeline::{differentiate_source, parse_source, Derivation, PipelineError};
pub use tape::{Interval, SmartTape, TapeIntervalViolation};
