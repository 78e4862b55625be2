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

//! Pretty diagnostics: spans, line/col, caret-highlights.

use crate::ast::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub line: usize, // 1-based
    pub col: usize,  // 1-based, counts bytes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    /// Absent when the error concerns generated code with no source position.
    pub span: Option<Span>,
    pub start: Location,
    pub end: Location,
    pub notes: Vec<String>,
}

/// Compute (line, col) from byte offset.
fn offset_to_loc(src: &str, offset: usize) -> Location {
    let mut line = 1usize;
    let mut col = 1usize;
    let mut count = 0usize;
    for ch in src.chars() {
        if count >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
        count += ch.len_utf8();
    }
    Location { line, col }
}

/// Extract the single source line containing `offset`.
fn line_at(src: &str, offset: usize) -> (&str, usize) {
    let bytes = src.as_bytes();
    let offset = offset.min(bytes.len());
    let mut b = offset;
    while b > 0 && bytes[b - 1] != b'\n' {
        b -= 1;
    }
    let mut e = offset;
    while e < bytes.len() && bytes[e] != b'\n' {
        e += 1;
    }
    (&src[b..e], b)
}

impl Diagnostic {
    pub fn new(src: &str, message: impl Into<String>, span: Option<Span>) -> Self {
        let span = span.filter(|s| !s.is_synthetic() && s.end() <= src.len());
        let (start, end) = match span {
            Some(s) => (offset_to_loc(src, s.start()), offset_to_loc(src, s.end())),
            None => (Location { line: 0, col: 0 }, Location { line: 0, col: 0 }),
        };
        Diagnostic {
            message: message.into(),
            span,
            start,
            end,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Construct from a chumsky `Simple` error.
    pub fn from_chumsky(src: &str, e: chumsky::error::Simple<char>) -> Self {
        let span = e.span();
        Self::new(src, e.to_string(), Some(Span::new(span.start, span.end)))
    }
}

/// Render caret-highlight under the selected span (single-line best effort).
pub fn render(src: &str, diag: &Diagnostic) -> String {
    let mut out = format!("error: {}", diag.message);
    if let Some(span) = diag.span {
        let (line_str, line_off) = line_at(src, span.start());
        let caret_start = span.start().saturating_sub(line_off);
        let caret_len = span
            .end()
            .saturating_sub(span.start())
            .max(1)
            .min(line_str.len().saturating_sub(caret_start).max(1));
        out.push_str(&format!(
            "\n--> line {}, col {}\n{}\n{}{}",
            diag.start.line,
            diag.start.col,
            line_str,
            " ".repeat(caret_start),
            "^".repeat(caret_len)
        ));
    }
    for note in &diag.notes {
        out.push_str("\nnote: ");
        out.push_str(note);
    }
    out
}
