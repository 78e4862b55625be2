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

//! Syntax tree of the MIND kernel language.
//!
//! The same tree describes user programs and the functions generated by the
//! differentiation engine, so every node can be printed back as source (see
//! [`print`]) and evaluated by [`crate::eval`].

pub mod print;

use std::fmt;

/// Byte range in the original source. Generated nodes carry `Span::default()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    start: usize,
    end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn is_synthetic(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(r: std::ops::Range<usize>) -> Self {
        Span::new(r.start, r.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    F64,
    I64,
    Bool,
    Void,
    /// Array handle; arrays are always shared by reference.
    Array(Box<Type>),
    /// Reference parameter bound to a caller lvalue.
    Ref(Box<Type>),
    Struct(String),
    /// Push/pop stack used by generated reverse-mode code.
    Tape,
    /// Constructor sentinel carrying the constructed type.
    Tag(String),
}

impl Type {
    pub fn array_of(elem: Type) -> Type {
        Type::Array(Box::new(elem))
    }

    pub fn ref_to(inner: Type) -> Type {
        Type::Ref(Box::new(inner))
    }

    /// The type seen through a reference.
    pub fn deref(&self) -> &Type {
        match self {
            Type::Ref(inner) => inner,
            other => other,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self.deref(), Type::F64)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.deref(), Type::F64 | Type::I64 | Type::Bool)
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, Type::Ref(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.deref(), Type::Array(_))
    }

    pub fn elem(&self) -> Option<&Type> {
        match self.deref() {
            Type::Array(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn struct_name(&self) -> Option<&str> {
        match self.deref() {
            Type::Struct(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::F64 => write!(f, "f64"),
            Type::I64 => write!(f, "i64"),
            Type::Bool => write!(f, "bool"),
            Type::Void => write!(f, "void"),
            Type::Array(elem) => write!(f, "[{}]", elem),
            Type::Ref(inner) => write!(f, "&{}", inner),
            Type::Struct(name) => write!(f, "{}", name),
            Type::Tape => write!(f, "tape"),
            Type::Tag(name) => write!(f, "tag<{}>", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn is_arithmetic(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    /// Binary operator a compound assignment desugars to.
    pub fn binop(self) -> Option<BinOp> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinOp::Add),
            AssignOp::Sub => Some(BinOp::Sub),
            AssignOp::Mul => Some(BinOp::Mul),
            AssignOp::Div => Some(BinOp::Div),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Float(f64),
    Int(i64),
    Bool(bool),
    Var(String),
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Field {
        base: Box<Expr>,
        field: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Call by (possibly qualified) name, e.g. `sin(x)` or `P::norm(p)`.
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    /// Ternary `cond ? then_expr : else_expr`.
    Cond {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    StructLit {
        name: String,
        fields: Vec<(String, Expr)>,
    },
    ArrayFill {
        value: Box<Expr>,
        len: Box<Expr>,
    },
    ArrayLit(Vec<Expr>),
    Tag(String),
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn synthetic(kind: ExprKind) -> Self {
        Self::new(kind, Span::default())
    }

    pub fn float(v: f64) -> Self {
        Self::synthetic(ExprKind::Float(v))
    }

    pub fn int(v: i64) -> Self {
        Self::synthetic(ExprKind::Int(v))
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::synthetic(ExprKind::Var(name.into()))
    }

    pub fn boolean(v: bool) -> Self {
        Self::synthetic(ExprKind::Bool(v))
    }

    pub fn index(base: Expr, index: Expr) -> Self {
        Self::synthetic(ExprKind::Index {
            base: Box::new(base),
            index: Box::new(index),
        })
    }

    pub fn field(base: Expr, field: impl Into<String>) -> Self {
        Self::synthetic(ExprKind::Field {
            base: Box::new(base),
            field: field.into(),
        })
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::synthetic(ExprKind::Call {
            callee: callee.into(),
            args,
        })
    }

    pub fn cond(cond: Expr, then_expr: Expr, else_expr: Expr) -> Self {
        Self::synthetic(ExprKind::Cond {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    pub fn fill(value: Expr, len: Expr) -> Self {
        Self::synthetic(ExprKind::ArrayFill {
            value: Box::new(value),
            len: Box::new(len),
        })
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Self::synthetic(ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// `-e`, folding literals and double negation.
    pub fn neg(e: Expr) -> Self {
        match e.kind {
            ExprKind::Float(v) => Expr::float(-v),
            ExprKind::Int(v) => Expr::int(-v),
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => *operand,
            kind => Self::synthetic(ExprKind::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(Expr::synthetic(kind)),
            }),
        }
    }

    pub fn not(e: Expr) -> Self {
        Self::synthetic(ExprKind::Unary {
            op: UnaryOp::Not,
            operand: Box::new(e),
        })
    }

    /// `a + b` with zero folding.
    pub fn add(a: Expr, b: Expr) -> Self {
        if a.is_zero() {
            return b;
        }
        if b.is_zero() {
            return a;
        }
        Expr::binary(BinOp::Add, a, b)
    }

    /// `a - b` with zero folding.
    pub fn sub(a: Expr, b: Expr) -> Self {
        if b.is_zero() {
            return a;
        }
        if a.is_zero() {
            return Expr::neg(b);
        }
        Expr::binary(BinOp::Sub, a, b)
    }

    /// `a * b` folding zeros and ones.
    pub fn mul(a: Expr, b: Expr) -> Self {
        if a.is_zero() || b.is_zero() {
            return Expr::float(0.0);
        }
        if a.is_one() {
            return b;
        }
        if b.is_one() {
            return a;
        }
        Expr::binary(BinOp::Mul, a, b)
    }

    /// `a / b`; a zero numerator folds away.
    pub fn div(a: Expr, b: Expr) -> Self {
        if a.is_zero() {
            return Expr::float(0.0);
        }
        if b.is_one() {
            return a;
        }
        Expr::binary(BinOp::Div, a, b)
    }

    pub fn is_zero(&self) -> bool {
        match &self.kind {
            ExprKind::Float(v) => *v == 0.0,
            ExprKind::Int(v) => *v == 0,
            _ => false,
        }
    }

    pub fn is_one(&self) -> bool {
        match &self.kind {
            ExprKind::Float(v) => *v == 1.0,
            ExprKind::Int(v) => *v == 1,
            _ => false,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Float(_) | ExprKind::Int(_) | ExprKind::Bool(_)
        )
    }

    /// True for `x`, `a[i]`, `p.f` and chains of those.
    pub fn is_place(&self) -> bool {
        match &self.kind {
            ExprKind::Var(_) => true,
            ExprKind::Index { base, .. } | ExprKind::Field { base, .. } => base.is_place(),
            _ => false,
        }
    }

    /// Root variable of a place expression.
    pub fn root_var(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Var(name) => Some(name),
            ExprKind::Index { base, .. } | ExprKind::Field { base, .. } => base.root_var(),
            _ => None,
        }
    }

    /// Copy of a place with its root variable renamed.
    pub fn with_root(&self, root: &str) -> Expr {
        match &self.kind {
            ExprKind::Var(_) => Expr::new(ExprKind::Var(root.to_string()), self.span),
            ExprKind::Index { base, index } => Expr::new(
                ExprKind::Index {
                    base: Box::new(base.with_root(root)),
                    index: index.clone(),
                },
                self.span,
            ),
            ExprKind::Field { base, field } => Expr::new(
                ExprKind::Field {
                    base: Box::new(base.with_root(root)),
                    field: field.clone(),
                },
                self.span,
            ),
            _ => self.clone(),
        }
    }

    /// Whether the expression mentions `name` anywhere.
    pub fn mentions(&self, name: &str) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if let ExprKind::Var(v) = &e.kind {
                if v == name {
                    found = true;
                }
            }
        });
        found
    }

    pub fn contains_call(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e.kind, ExprKind::Call { .. }) {
                found = true;
            }
        });
        found
    }

    /// Pre-order traversal of this expression and its children.
    pub fn walk(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match &self.kind {
            ExprKind::Float(_)
            | ExprKind::Int(_)
            | ExprKind::Bool(_)
            | ExprKind::Var(_)
            | ExprKind::Tag(_) => {}
            ExprKind::Index { base, index } => {
                base.walk(f);
                index.walk(f);
            }
            ExprKind::Field { base, .. } => base.walk(f),
            ExprKind::Unary { operand, .. } => operand.walk(f),
            ExprKind::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            ExprKind::Call { args, .. } | ExprKind::ArrayLit(args) => {
                for a in args {
                    a.walk(f);
                }
            }
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                cond.walk(f);
                then_expr.walk(f);
                else_expr.walk(f);
            }
            ExprKind::StructLit { fields, .. } => {
                for (_, e) in fields {
                    e.walk(f);
                }
            }
            ExprKind::ArrayFill { value, len } => {
                value.walk(f);
                len.walk(f);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self {
            stmts,
            span: Span::default(),
        }
    }

    /// Visit every statement, nested ones included, in source order.
    pub fn walk(&self, f: &mut dyn FnMut(&Stmt)) {
        for stmt in &self.stmts {
            stmt.walk(f);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `let name: ty = value;`; a missing value zero-initialises.
    Let {
        name: String,
        name_span: Span,
        ty: Type,
        value: Option<Expr>,
    },
    Assign {
        target: Expr,
        op: AssignOp,
        value: Expr,
    },
    Expr(Expr),
    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    /// `for var in start..end`, bounds evaluated once on entry.
    For {
        var: String,
        var_span: Span,
        start: Expr,
        end: Expr,
        body: Block,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Block(Block),
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn synthetic(kind: StmtKind) -> Self {
        Self::new(kind, Span::default())
    }

    pub fn let_(name: impl Into<String>, ty: Type, value: Option<Expr>) -> Self {
        Self::synthetic(StmtKind::Let {
            name: name.into(),
            name_span: Span::default(),
            ty,
            value,
        })
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Self::synthetic(StmtKind::Assign {
            target,
            op: AssignOp::Set,
            value,
        })
    }

    /// `target += value`, written out as a plain assignment.
    pub fn accumulate(target: Expr, value: Expr) -> Self {
        let sum = Expr::add(target.clone(), value);
        Self::assign(target, sum)
    }

    pub fn expr(e: Expr) -> Self {
        Self::synthetic(StmtKind::Expr(e))
    }

    pub fn if_(cond: Expr, then_stmts: Vec<Stmt>, else_stmts: Option<Vec<Stmt>>) -> Self {
        Self::synthetic(StmtKind::If {
            cond,
            then_block: Block::new(then_stmts),
            else_block: else_stmts.map(Block::new),
        })
    }

    pub fn while_(cond: Expr, body: Vec<Stmt>) -> Self {
        Self::synthetic(StmtKind::While {
            cond,
            body: Block::new(body),
        })
    }

    pub fn for_(var: impl Into<String>, start: Expr, end: Expr, body: Vec<Stmt>) -> Self {
        Self::synthetic(StmtKind::For {
            var: var.into(),
            var_span: Span::default(),
            start,
            end,
            body: Block::new(body),
        })
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Self::synthetic(StmtKind::Return(value))
    }

    pub fn walk(&self, f: &mut dyn FnMut(&Stmt)) {
        f(self);
        match &self.kind {
            StmtKind::If {
                then_block,
                else_block,
                ..
            } => {
                then_block.walk(f);
                if let Some(b) = else_block {
                    b.walk(f);
                }
            }
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => body.walk(f),
            StmtKind::Block(b) => b.walk(f),
            _ => {}
        }
    }

    /// Expressions held directly by this statement (not by nested blocks).
    pub fn exprs(&self) -> Vec<&Expr> {
        match &self.kind {
            StmtKind::Let { value, .. } => value.iter().collect(),
            StmtKind::Assign { target, value, .. } => vec![target, value],
            StmtKind::Expr(e) => vec![e],
            StmtKind::If { cond, .. } | StmtKind::While { cond, .. } => vec![cond],
            StmtKind::For { start, end, .. } => vec![start, end],
            StmtKind::Return(value) => value.iter().collect(),
            StmtKind::Break | StmtKind::Continue | StmtKind::Block(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub span: Span,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            span: Span::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    /// Struct the function is a method of.
    pub owner: Option<String>,
    /// Enclosing `mod`, e.g. `custom_derivatives`.
    pub namespace: Option<String>,
    pub params: Vec<Param>,
    pub ret: Type,
    /// `None` for declaration-only functions.
    pub body: Option<Block>,
    pub non_differentiable: bool,
    pub span: Span,
}

impl Function {
    pub fn qualified_name(&self) -> String {
        qualify(self.owner.as_deref(), &self.name)
    }

    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    pub fn param(&self, name: &str) -> Option<(usize, &Param)> {
        self.params.iter().enumerate().find(|(_, p)| p.name == name)
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.params.iter().map(|p| p.ty.clone()).collect()
    }
}

/// `Owner::name` for methods, `name` otherwise.
pub fn qualify(owner: Option<&str>, name: &str) -> String {
    match owner {
        Some(owner) => format!("{}::{}", owner, name),
        None => name.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub non_differentiable: bool,
    pub span: Span,
}

impl StructDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub structs: Vec<StructDef>,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }

    /// All functions whose qualified name is `name`.
    pub fn functions_named<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Function> + 'a {
        let name = name.to_string();
        self.functions
            .iter()
            .filter(move |f| f.qualified_name() == name)
    }
}
