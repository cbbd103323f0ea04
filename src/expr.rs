use std::{
    fmt::Display,
    ops::{Add, Div, Mul, Neg, Sub},
    sync::{Arc, RwLock, RwLockReadGuard},
};

use crate::{bail, Error, Result, Sparsity};

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn as_c_op(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }

    pub(crate) fn apply(&self, x: f64, y: f64) -> f64 {
        match self {
            Self::Add => x + y,
            Self::Sub => x - y,
            Self::Mul => x * y,
            Self::Div => x / y,
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Sin,
    Cos,
    Exp,
    Ln,
}

impl UnaryOp {
    pub fn fill_in_c_op(&self, val: impl Display) -> String {
        match self {
            Self::Neg => format!("-{val}"),
            Self::Sqrt => format!("sqrt({val})"),
            Self::Sin => format!("sin({val})"),
            Self::Cos => format!("cos({val})"),
            Self::Exp => format!("exp({val})"),
            Self::Ln => format!("log({val})"),
        }
    }

    pub(crate) fn apply(&self, x: f64) -> f64 {
        match self {
            Self::Neg => -x,
            Self::Sqrt => x.sqrt(),
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Exp => x.exp(),
            Self::Ln => x.ln(),
        }
    }
}

/// One scalar operation in an expression graph.
#[derive(PartialEq, Debug, Clone)]
pub(crate) enum ExprOp {
    Const(f64),
    /// Free symbolic placeholder. The label is cosmetic; identity is the id.
    Sym { label: String },
    Binary {
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Unary {
        op: UnaryOp,
        arg: ExprId,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ExprId(pub(crate) usize);

impl From<ExprId> for usize {
    fn from(value: ExprId) -> Self {
        value.0
    }
}

/// Shared append-only list of scalar operations. Expression handles append
/// to the graph; nothing is computed until the graph is compiled into a
/// function node.
#[derive(Clone, Default)]
pub struct ExprGraph {
    ops: Arc<RwLock<Vec<ExprOp>>>,
}

impl ExprGraph {
    /// Create an empty expression graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only access to the list of operations.
    pub(crate) fn ops(&self) -> RwLockReadGuard<Vec<ExprOp>> {
        self.ops.read().unwrap()
    }

    pub fn len(&self) -> usize {
        self.ops.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn same_graph(&self, other: &ExprGraph) -> bool {
        Arc::ptr_eq(&self.ops, &other.ops)
    }

    fn push(&self, op: ExprOp) -> ExprId {
        let mut ops = self.ops.write().unwrap();
        let id = ExprId(ops.len());
        ops.push(op);
        id
    }

    /// Create a named free symbolic scalar.
    pub fn sym(&self, label: &str) -> Expr {
        let id = self.push(ExprOp::Sym {
            label: label.to_string(),
        });
        Expr {
            id,
            graph: self.clone(),
        }
    }

    /// Create a constant scalar.
    pub fn constant(&self, v: f64) -> Expr {
        let id = self.push(ExprOp::Const(v));
        Expr {
            id,
            graph: self.clone(),
        }
    }

    fn const_value(ops: &[ExprOp], id: ExprId) -> Option<f64> {
        match ops[id.0] {
            ExprOp::Const(v) => Some(v),
            _ => None,
        }
    }

    /// Append a binary operation, folding constants and applying identity
    /// simplifications so derivative sweeps do not bloat the graph.
    pub(crate) fn binary(&self, op: BinaryOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        let mut ops = self.ops.write().unwrap();
        let lc = Self::const_value(&ops, lhs);
        let rc = Self::const_value(&ops, rhs);
        if let (Some(x), Some(y)) = (lc, rc) {
            let id = ExprId(ops.len());
            ops.push(ExprOp::Const(op.apply(x, y)));
            return id;
        }
        let lzero = lc == Some(0.0);
        let rzero = rc == Some(0.0);
        match op {
            BinaryOp::Add => {
                if lzero {
                    return rhs;
                }
                if rzero {
                    return lhs;
                }
            }
            BinaryOp::Sub => {
                if rzero {
                    return lhs;
                }
                if lzero {
                    let id = ExprId(ops.len());
                    ops.push(ExprOp::Unary {
                        op: UnaryOp::Neg,
                        arg: rhs,
                    });
                    return id;
                }
            }
            BinaryOp::Mul => {
                if lc == Some(1.0) {
                    return rhs;
                }
                if rc == Some(1.0) {
                    return lhs;
                }
                if lzero || rzero {
                    let id = ExprId(ops.len());
                    ops.push(ExprOp::Const(0.0));
                    return id;
                }
            }
            BinaryOp::Div => {
                if rc == Some(1.0) {
                    return lhs;
                }
                if lzero {
                    let id = ExprId(ops.len());
                    ops.push(ExprOp::Const(0.0));
                    return id;
                }
            }
        }
        let id = ExprId(ops.len());
        ops.push(ExprOp::Binary { op, lhs, rhs });
        id
    }

    pub(crate) fn unary(&self, op: UnaryOp, arg: ExprId) -> ExprId {
        let mut ops = self.ops.write().unwrap();
        if let Some(x) = Self::const_value(&ops, arg) {
            let id = ExprId(ops.len());
            ops.push(ExprOp::Const(op.apply(x)));
            return id;
        }
        let id = ExprId(ops.len());
        ops.push(ExprOp::Unary { op, arg });
        id
    }
}

/// A scalar handle into an [`ExprGraph`]. Operations on expressions append
/// to the graph and perform no computation.
#[derive(Clone)]
pub struct Expr {
    id: ExprId,
    graph: ExprGraph,
}

impl Expr {
    pub(crate) fn from_id(graph: &ExprGraph, id: ExprId) -> Self {
        Self {
            id,
            graph: graph.clone(),
        }
    }

    pub fn id(&self) -> ExprId {
        self.id
    }

    pub fn graph(&self) -> &ExprGraph {
        &self.graph
    }

    fn bin(&self, op: BinaryOp, rhs: &Expr) -> Expr {
        assert!(
            self.graph.same_graph(&rhs.graph),
            "cannot combine expressions from different graphs"
        );
        Expr {
            id: self.graph.binary(op, self.id, rhs.id),
            graph: self.graph.clone(),
        }
    }

    fn un(&self, op: UnaryOp) -> Expr {
        Expr {
            id: self.graph.unary(op, self.id),
            graph: self.graph.clone(),
        }
    }

    pub fn sqrt(&self) -> Expr {
        self.un(UnaryOp::Sqrt)
    }

    pub fn sin(&self) -> Expr {
        self.un(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Expr {
        self.un(UnaryOp::Cos)
    }

    pub fn exp(&self) -> Expr {
        self.un(UnaryOp::Exp)
    }

    pub fn ln(&self) -> Expr {
        self.un(UnaryOp::Ln)
    }
}

macro_rules! expr_binop {
    ($trait:ident, $fn_name:ident, $op:ident) => {
        impl $trait for &Expr {
            type Output = Expr;
            fn $fn_name(self, rhs: Self) -> Expr {
                self.bin(BinaryOp::$op, rhs)
            }
        }

        impl $trait for Expr {
            type Output = Expr;
            fn $fn_name(self, rhs: Self) -> Expr {
                self.bin(BinaryOp::$op, &rhs)
            }
        }

        impl $trait<f64> for &Expr {
            type Output = Expr;
            fn $fn_name(self, rhs: f64) -> Expr {
                self.bin(BinaryOp::$op, &self.graph.constant(rhs))
            }
        }
    };
}

expr_binop!(Add, add, Add);
expr_binop!(Sub, sub, Sub);
expr_binop!(Mul, mul, Mul);
expr_binop!(Div, div, Div);

impl Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        self.un(UnaryOp::Neg)
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        self.un(UnaryOp::Neg)
    }
}

/// A matrix-valued symbolic quantity: a sparsity pattern plus one scalar
/// expression per structural nonzero, in the pattern's column-major order.
/// This is the unit function ports are made of.
#[derive(Clone)]
pub struct SymVec {
    graph: ExprGraph,
    sp: Sparsity,
    elems: Vec<Expr>,
}

impl SymVec {
    /// A fresh named symbolic placeholder with the given pattern.
    pub fn sym(graph: &ExprGraph, name: &str, sp: Sparsity) -> SymVec {
        let nnz = sp.nnz();
        let elems = (0..nnz)
            .map(|k| {
                if nnz == 1 {
                    graph.sym(name)
                } else {
                    graph.sym(&format!("{name}_{k}"))
                }
            })
            .collect();
        SymVec {
            graph: graph.clone(),
            sp,
            elems,
        }
    }

    /// All nonzeros set to the same constant.
    pub fn constant(graph: &ExprGraph, sp: Sparsity, v: f64) -> SymVec {
        let elems = (0..sp.nnz()).map(|_| graph.constant(v)).collect();
        SymVec {
            graph: graph.clone(),
            sp,
            elems,
        }
    }

    pub fn from_elems(graph: &ExprGraph, sp: Sparsity, elems: Vec<Expr>) -> Result<SymVec> {
        if elems.len() != sp.nnz() {
            return Err(Error::Shape {
                what: "symbolic vector".to_string(),
                expected: format!("{} elements", sp.nnz()),
                got: format!("{}", elems.len()),
            });
        }
        for e in &elems {
            if !e.graph().same_graph(graph) {
                bail!("all elements of a symbolic vector must share one graph");
            }
        }
        Ok(SymVec {
            graph: graph.clone(),
            sp,
            elems,
        })
    }

    pub fn sparsity(&self) -> &Sparsity {
        &self.sp
    }

    pub fn elems(&self) -> &[Expr] {
        &self.elems
    }

    pub fn graph(&self) -> &ExprGraph {
        &self.graph
    }

    pub fn nnz(&self) -> usize {
        self.elems.len()
    }

    /// Elementwise binary operation. Patterns must match exactly; a scalar
    /// operand broadcasts against any pattern.
    pub fn binary_elem(&self, op: BinaryOp, rhs: &SymVec) -> Result<SymVec> {
        if !self.graph.same_graph(&rhs.graph) {
            bail!("cannot combine symbolic vectors from different graphs");
        }
        let (sp, elems) = if self.sp == rhs.sp {
            let elems = self
                .elems
                .iter()
                .zip(&rhs.elems)
                .map(|(a, b)| a.bin(op, b))
                .collect();
            (self.sp.clone(), elems)
        } else if rhs.sp.is_scalar() {
            let b = &rhs.elems[0];
            (self.sp.clone(), self.elems.iter().map(|a| a.bin(op, b)).collect())
        } else if self.sp.is_scalar() {
            let a = &self.elems[0];
            (rhs.sp.clone(), rhs.elems.iter().map(|b| a.bin(op, b)).collect())
        } else {
            return Err(Error::Shape {
                what: "elementwise operation".to_string(),
                expected: format!("{:?}", self.sp.size()),
                got: format!("{:?}", rhs.sp.size()),
            });
        };
        Ok(SymVec {
            graph: self.graph.clone(),
            sp,
            elems,
        })
    }

    fn unary_elem(&self, op: UnaryOp) -> SymVec {
        SymVec {
            graph: self.graph.clone(),
            sp: self.sp.clone(),
            elems: self.elems.iter().map(|e| e.un(op)).collect(),
        }
    }

    pub fn sqrt(&self) -> SymVec {
        self.unary_elem(UnaryOp::Sqrt)
    }

    pub fn sin(&self) -> SymVec {
        self.unary_elem(UnaryOp::Sin)
    }

    pub fn cos(&self) -> SymVec {
        self.unary_elem(UnaryOp::Cos)
    }

    pub fn exp(&self) -> SymVec {
        self.unary_elem(UnaryOp::Exp)
    }

    pub fn ln(&self) -> SymVec {
        self.unary_elem(UnaryOp::Ln)
    }

    /// Concatenate horizontally; element order is the concatenation of the
    /// parts' element orders.
    pub fn horzcat(parts: &[SymVec]) -> Result<SymVec> {
        let Some(first) = parts.first() else {
            bail!("horzcat of an empty list");
        };
        for p in parts {
            if !p.graph.same_graph(&first.graph) {
                bail!("cannot concatenate symbolic vectors from different graphs");
            }
        }
        let sp = Sparsity::horzcat(&parts.iter().map(|p| p.sp.clone()).collect::<Vec<_>>())?;
        let elems = parts.iter().flat_map(|p| p.elems.iter().cloned()).collect();
        Ok(SymVec {
            graph: first.graph.clone(),
            sp,
            elems,
        })
    }

    /// Split into consecutive column blocks of the given widths.
    pub fn horzsplit(&self, widths: &[usize]) -> Result<Vec<SymVec>> {
        let patterns = self.sp.horzsplit(widths)?;
        let mut parts = Vec::with_capacity(patterns.len());
        let mut off = 0;
        for sp in patterns {
            let nnz = sp.nnz();
            parts.push(SymVec {
                graph: self.graph.clone(),
                sp,
                elems: self.elems[off..off + nnz].to_vec(),
            });
            off += nnz;
        }
        Ok(parts)
    }

    /// `n` copies side by side, sharing the underlying expressions.
    pub fn repmat(&self, n: usize) -> SymVec {
        SymVec {
            graph: self.graph.clone(),
            sp: self.sp.repeat_horz(n),
            elems: (0..n).flat_map(|_| self.elems.iter().cloned()).collect(),
        }
    }

    /// Elementwise sum of same-patterned vectors.
    pub fn sum(parts: &[SymVec]) -> Result<SymVec> {
        let Some((first, rest)) = parts.split_first() else {
            bail!("sum of an empty list");
        };
        let mut acc = first.clone();
        for p in rest {
            acc = acc.binary_elem(BinaryOp::Add, p)?;
        }
        Ok(acc)
    }
}

macro_rules! symvec_binop {
    ($trait:ident, $fn_name:ident, $op:ident) => {
        impl $trait for &SymVec {
            type Output = SymVec;
            fn $fn_name(self, rhs: Self) -> SymVec {
                match self.binary_elem(BinaryOp::$op, rhs) {
                    Ok(v) => v,
                    Err(e) => panic!("{e}"),
                }
            }
        }

        impl $trait for SymVec {
            type Output = SymVec;
            fn $fn_name(self, rhs: Self) -> SymVec {
                (&self).$fn_name(&rhs)
            }
        }
    };
}

symvec_binop!(Add, add, Add);
symvec_binop!(Sub, sub, Sub);
symvec_binop!(Mul, mul, Mul);
symvec_binop!(Div, div, Div);

impl Neg for &SymVec {
    type Output = SymVec;
    fn neg(self) -> SymVec {
        self.unary_elem(UnaryOp::Neg)
    }
}
