//! The abstract syntax tree for an assembly source file.
//!
//! Items, operands and expressions are closed sum types; every consumer
//! matches exhaustively.

use thiserror::Error;

/// A parsed source file: an ordered sequence of items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct File {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Label {
        name: String,
        line: usize,
        col: usize,
    },

    /// A directive with its arguments recorded as raw token text.
    Directive {
        name: String,
        args: Vec<String>,
        line: usize,
        col: usize,
    },

    Instruction(Instruction),

    Data(DataDecl),

    /// A `%macro` block. The body is parsed for structure but never
    /// expanded here; expansion is a future pre-pass over the AST.
    Macro(MacroDef),

    /// A `%if` block, parsed but not evaluated.
    If(IfBlock),
}

impl Item {
    /// Source position of the item, for error attribution.
    pub fn pos(&self) -> (usize, usize) {
        match self {
            Item::Label { line, col, .. } => (*line, *col),
            Item::Directive { line, col, .. } => (*line, *col),
            Item::Instruction(ins) => (ins.line, ins.col),
            Item::Data(d) => (d.line, d.col),
            Item::Macro(m) => (m.line, m.col),
            Item::If(b) => (b.line, b.col),
        }
    }
}

/// One machine instruction. The mnemonic keeps its source spelling;
/// consumers lowercase it for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    pub line: usize,
    pub col: usize,
}

/// The width class of a data declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Db,
    Dw,
    Dd,
    Dq,
    Resb,
    Resw,
    Resd,
}

impl DataKind {
    pub fn from_keyword(kw: &str) -> Option<DataKind> {
        match kw {
            "db" => Some(DataKind::Db),
            "dw" => Some(DataKind::Dw),
            "dd" => Some(DataKind::Dd),
            "dq" => Some(DataKind::Dq),
            "resb" => Some(DataKind::Resb),
            "resw" => Some(DataKind::Resw),
            "resd" => Some(DataKind::Resd),
            _ => None,
        }
    }

    /// Bytes per unit: the width written per expression for `d*` kinds, the
    /// unit reserved per count for `res*` kinds.
    pub fn unit(&self) -> usize {
        match self {
            DataKind::Db | DataKind::Resb => 1,
            DataKind::Dw | DataKind::Resw => 2,
            DataKind::Dd | DataKind::Resd => 4,
            DataKind::Dq => 8,
        }
    }

    /// True for the storage-reserving kinds (`resb`/`resw`/`resd`).
    pub fn reserves(&self) -> bool {
        matches!(self, DataKind::Resb | DataKind::Resw | DataKind::Resd)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataDecl {
    pub kind: DataKind,
    pub items: Vec<DataItem>,
    pub line: usize,
    pub col: usize,
}

/// One comma-separated element of a data declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum DataItem {
    Str(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroDef {
    pub name: String,
    /// Raw tokens following the name on the `%macro` line.
    pub params: Vec<String>,
    pub body: Vec<Item>,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfBlock {
    pub cond: Expr,
    pub then_items: Vec<Item>,
    pub else_items: Vec<Item>,
    pub line: usize,
    pub col: usize,
}

/// An instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A register, matched by name case-insensitively.
    Reg(String),
    Imm(Expr),
    Mem(MemOperand),
    /// An identifier that is not a register name.
    Label(String),
    Str(String),
}

/// A memory operand.
///
/// Only the displacement expression is recorded; base/index/scale structure
/// is not carried through yet and the encoder's memory forms do not encode
/// the displacement.
// TODO: carry base/index/scale through so `[base + index*scale + disp]`
// can be encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct MemOperand {
    pub disp: Expr,
}

/// A constant expression over 64-bit signed integers.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(i64),
    Ident(String),
    Str(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Plus,
    Neg,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unresolved identifier: {0}")]
    Unresolved(String),

    #[error("string is not a constant")]
    NotAConstant,

    #[error("division by zero")]
    DivisionByZero,
}

impl Expr {
    /// Folds the expression to a 64-bit signed constant. Arithmetic wraps;
    /// identifiers are not constants here, they defer to the relocation
    /// pass.
    pub fn eval(&self) -> Result<i64, EvalError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Ident(name) => Err(EvalError::Unresolved(name.clone())),
            Expr::Str(_) => Err(EvalError::NotAConstant),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.eval()?;
                let r = rhs.eval()?;
                match op {
                    BinOp::Add => Ok(l.wrapping_add(r)),
                    BinOp::Sub => Ok(l.wrapping_sub(r)),
                    BinOp::Mul => Ok(l.wrapping_mul(r)),
                    BinOp::Div => {
                        if r == 0 {
                            Err(EvalError::DivisionByZero)
                        } else {
                            Ok(l.wrapping_div(r))
                        }
                    }
                }
            }
            Expr::Unary { op, expr } => {
                let v = expr.eval()?;
                match op {
                    UnOp::Plus => Ok(v),
                    UnOp::Neg => Ok(v.wrapping_neg()),
                }
            }
        }
    }

    /// Recognizes the relocatable shapes: a bare identifier, or an
    /// identifier combined with a constant by `+` (either side) or `-`
    /// (identifier on the left). Returns the symbol name and the addend to
    /// carry on the relocation.
    pub fn symbol_ref(&self) -> Option<(&str, i64)> {
        match self {
            Expr::Ident(name) => Some((name, 0)),
            Expr::Binary { op, lhs, rhs } => match (op, lhs.as_ref(), rhs.as_ref()) {
                (BinOp::Add, Expr::Ident(name), k) => Some((name, k.eval().ok()?)),
                (BinOp::Add, k, Expr::Ident(name)) => Some((name, k.eval().ok()?)),
                (BinOp::Sub, Expr::Ident(name), k) => {
                    Some((name, k.eval().ok()?.wrapping_neg()))
                }
                _ => None,
            },
            _ => None,
        }
    }
}
