use indexmap::IndexMap;

use crate::codegen::CodeGenerator;
use crate::expr::{ExprGraph, SymVec};
use crate::pool::WorkPool;
use crate::primitive::SxNode;
use crate::{Error, Function, Result, Sparsity};

/// A named input or output slot with fixed sparsity.
#[derive(Clone, Debug)]
pub struct Port {
    pub name: String,
    pub sparsity: Sparsity,
    pub default_value: f64,
}

impl Port {
    pub fn new(name: impl Into<String>, sparsity: Sparsity) -> Self {
        Port {
            name: name.into(),
            sparsity,
            default_value: 0.0,
        }
    }
}

/// Scratch-buffer requirements of a node: argument-slot count, result-slot
/// count, integer work length and floating work length. Bit-vector
/// propagation reuses the same counts with a `u64` element type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkSizes {
    pub sz_arg: usize,
    pub sz_res: usize,
    pub sz_iw: usize,
    pub sz_w: usize,
}

/// Tag identifying the concrete node variant behind a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Primitive,
    Map,
    Switch,
    Spline,
    Slice,
}

/// A construction-time option value.
#[derive(Clone, Debug, PartialEq)]
pub enum OptVal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
    FloatList(Vec<f64>),
}

impl OptVal {
    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            OptVal::StrList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float_list(&self) -> Option<&[f64]> {
        match self {
            OptVal::FloatList(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for OptVal {
    fn from(v: bool) -> Self {
        OptVal::Bool(v)
    }
}

impl From<i64> for OptVal {
    fn from(v: i64) -> Self {
        OptVal::Int(v)
    }
}

impl From<f64> for OptVal {
    fn from(v: f64) -> Self {
        OptVal::Float(v)
    }
}

impl From<&str> for OptVal {
    fn from(v: &str) -> Self {
        OptVal::Str(v.to_string())
    }
}

impl From<Vec<String>> for OptVal {
    fn from(v: Vec<String>) -> Self {
        OptVal::StrList(v)
    }
}

impl From<Vec<f64>> for OptVal {
    fn from(v: Vec<f64>) -> Self {
        OptVal::FloatList(v)
    }
}

/// Construction-time configuration map, ordered by insertion.
pub type Opts = IndexMap<String, OptVal>;

/// Options carrying explicit port schemes and input defaults.
pub(crate) fn scheme_opts(
    in_names: Vec<String>,
    out_names: Vec<String>,
    defaults: Vec<f64>,
) -> Opts {
    let mut opts = Opts::new();
    opts.insert("input_scheme".to_string(), OptVal::StrList(in_names));
    opts.insert("output_scheme".to_string(), OptVal::StrList(out_names));
    opts.insert("default_in".to_string(), OptVal::FloatList(defaults));
    opts
}

/// Data shared by every node variant: a validated name, the port descriptor
/// tables, scratch sizing and the memory checkout pool. Frozen at
/// construction; never mutated afterwards.
pub struct NodeCore {
    name: String,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    in_index: IndexMap<String, usize>,
    out_index: IndexMap<String, usize>,
    work: WorkSizes,
    pool: WorkPool,
}

impl NodeCore {
    pub(crate) fn new(
        name: &str,
        inputs: Vec<Port>,
        outputs: Vec<Port>,
        work: WorkSizes,
    ) -> Result<Self> {
        if !Function::check_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        let mut in_index = IndexMap::with_capacity(inputs.len());
        for (i, p) in inputs.iter().enumerate() {
            if in_index.insert(p.name.clone(), i).is_some() {
                return Err(Error::Msg(format!("duplicate input name '{}'", p.name)));
            }
        }
        let mut out_index = IndexMap::with_capacity(outputs.len());
        for (i, p) in outputs.iter().enumerate() {
            if out_index.insert(p.name.clone(), i).is_some() {
                return Err(Error::Msg(format!("duplicate output name '{}'", p.name)));
            }
        }
        log::debug!(
            "constructed node '{}': {} inputs, {} outputs, sz_w {}",
            name,
            inputs.len(),
            outputs.len(),
            work.sz_w
        );
        Ok(NodeCore {
            name: name.to_string(),
            inputs,
            outputs,
            in_index,
            out_index,
            work,
            pool: WorkPool::new(work),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_in(&self) -> usize {
        self.inputs.len()
    }

    pub fn n_out(&self) -> usize {
        self.outputs.len()
    }

    pub fn in_port(&self, i: usize) -> Result<&Port> {
        self.inputs.get(i).ok_or(Error::Index {
            what: "input port",
            index: i,
            limit: self.inputs.len(),
        })
    }

    pub fn out_port(&self, i: usize) -> Result<&Port> {
        self.outputs.get(i).ok_or(Error::Index {
            what: "output port",
            index: i,
            limit: self.outputs.len(),
        })
    }

    pub fn index_in(&self, name: &str) -> Result<usize> {
        self.in_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownEntry(name.to_string()))
    }

    pub fn index_out(&self, name: &str) -> Result<usize> {
        self.out_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownEntry(name.to_string()))
    }

    pub fn names_in(&self) -> Vec<String> {
        self.inputs.iter().map(|p| p.name.clone()).collect()
    }

    pub fn names_out(&self) -> Vec<String> {
        self.outputs.iter().map(|p| p.name.clone()).collect()
    }

    pub fn work(&self) -> WorkSizes {
        self.work
    }

    pub fn pool(&self) -> &WorkPool {
        &self.pool
    }
}

/// The capability set every node variant implements: numeric evaluation,
/// symbolic re-expansion, bit-vector sparsity propagation, derivative
/// generation and code emission. A handle owns exactly one node.
pub trait FunctionNode: Send + Sync {
    fn core(&self) -> &NodeCore;

    fn kind(&self) -> NodeKind;

    /// Numeric evaluation with the raw calling convention: one optional
    /// buffer per port (`None` argument means "use the port default", `None`
    /// result means "not requested") plus scratch sized per [`WorkSizes`].
    fn eval(
        &self,
        args: &[Option<&[f64]>],
        res: &mut [Option<&mut [f64]>],
        iw: &mut [i64],
        w: &mut [f64],
    ) -> Result<()>;

    /// Symbolic re-expansion: substitute expressions for the inputs and
    /// return expressions for the outputs, appended to `graph`.
    fn eval_sym(&self, _graph: &ExprGraph, _args: &[SymVec]) -> Result<Vec<SymVec>> {
        Err(Error::Capability("symbolic evaluation"))
    }

    fn has_spfwd(&self) -> bool {
        false
    }

    fn has_sprev(&self) -> bool {
        false
    }

    /// Forward dependency propagation: output bits become the OR of the
    /// input bits they structurally depend on.
    fn sp_forward(
        &self,
        _args: &[Option<&[u64]>],
        _res: &mut [Option<&mut [u64]>],
        _iw: &mut [i64],
        _bw: &mut [u64],
    ) -> Result<()> {
        Err(Error::Capability("forward sparsity propagation"))
    }

    /// Reverse dependency propagation: output seed bits are accumulated
    /// backward into the input bits that feed them, consuming the seeds.
    fn sp_reverse(
        &self,
        _args: &mut [Option<&mut [u64]>],
        _res: &mut [Option<&mut [u64]>],
        _iw: &mut [i64],
        _bw: &mut [u64],
    ) -> Result<()> {
        Err(Error::Capability("reverse sparsity propagation"))
    }

    /// Forward-mode directional derivative with `k` seed directions.
    /// The default lowers through symbolic re-expansion.
    fn forward(&self, f: &Function, k: usize) -> Result<Function> {
        f.expand()?.forward(k)
    }

    /// Reverse-mode directional derivative with `k` adjoint directions.
    fn reverse(&self, f: &Function, k: usize) -> Result<Function> {
        f.expand()?.reverse(k)
    }

    fn as_primitive(&self) -> Option<&SxNode> {
        None
    }

    fn codegen(&self, _gen: &mut CodeGenerator) -> Result<()> {
        Err(Error::Capability("code generation"))
    }
}
