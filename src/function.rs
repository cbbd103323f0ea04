use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use petgraph::dot::{Config, Dot};
use petgraph::Graph as PetGraph;

use crate::codegen::CodeGenerator;
use crate::expr::{ExprGraph, SymVec};
use crate::node::{FunctionNode, NodeKind, OptVal, Opts, WorkSizes};
use crate::pool::PoolMetrics;
use crate::primitive::{Instr, SxNode};
use crate::{bail, Error, Result, Sparsity};

/// Reserved identifiers a function may not be named after.
const KEYWORDS: [&str; 3] = ["null", "jac", "hess"];

/// A shared handle to one immutable function node. Copying a handle is
/// cheap; the node is destroyed when the last handle referencing it drops.
/// A handle may also be null, in which case every query fails and
/// [`Function::name`] returns `"null"`.
#[derive(Clone, Default)]
pub struct Function {
    node: Option<Arc<dyn FunctionNode>>,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name())
            .finish()
    }
}

impl Function {
    /// A handle with no node.
    pub fn null() -> Function {
        Function { node: None }
    }

    pub(crate) fn from_node(node: Arc<dyn FunctionNode>) -> Function {
        Function { node: Some(node) }
    }

    /// Construct a function from symbolic input and output expressions.
    ///
    /// Recognized options: `input_scheme` / `output_scheme` (positional port
    /// names) and `default_in` (per-input default values).
    pub fn new(
        name: &str,
        inputs: &[SymVec],
        outputs: &[SymVec],
        opts: &Opts,
    ) -> Result<Function> {
        Ok(Function::from_node(Arc::new(SxNode::new(
            name, inputs, outputs, opts,
        )?)))
    }

    /// [`Function::new`] with the port names given directly.
    pub fn new_named(
        name: &str,
        inputs: &[SymVec],
        outputs: &[SymVec],
        argn: &[String],
        resn: &[String],
        opts: &Opts,
    ) -> Result<Function> {
        let mut opts2 = opts.clone();
        opts2.insert(
            "input_scheme".to_string(),
            OptVal::StrList(argn.to_vec()),
        );
        opts2.insert(
            "output_scheme".to_string(),
            OptVal::StrList(resn.to_vec()),
        );
        Function::new(name, inputs, outputs, &opts2)
    }

    /// Construct from a named mapping of expressions: every entry must
    /// match exactly one declared input or output name. Unmatched ports
    /// become empty.
    pub fn from_map(
        name: &str,
        entries: &IndexMap<String, SymVec>,
        argn: &[String],
        resn: &[String],
        opts: &Opts,
    ) -> Result<Function> {
        let mut arg: Vec<Option<SymVec>> = vec![None; argn.len()];
        let mut res: Vec<Option<SymVec>> = vec![None; resn.len()];
        let mut graph: Option<ExprGraph> = None;
        for (key, v) in entries {
            graph.get_or_insert_with(|| v.graph().clone());
            if let Some(pos) = argn.iter().position(|n| n == key) {
                arg[pos] = Some(v.clone());
            } else if let Some(pos) = resn.iter().position(|n| n == key) {
                res[pos] = Some(v.clone());
            } else {
                return Err(Error::UnknownEntry(key.clone()));
            }
        }
        let Some(graph) = graph else {
            bail!("cannot construct '{name}' from an empty mapping");
        };
        let empty = |g: &ExprGraph| SymVec::from_elems(g, Sparsity::dense(0, 0), Vec::new());
        let arg: Vec<SymVec> = arg
            .into_iter()
            .map(|v| v.map_or_else(|| empty(&graph), Ok))
            .collect::<Result<_>>()?;
        let res: Vec<SymVec> = res
            .into_iter()
            .map(|v| v.map_or_else(|| empty(&graph), Ok))
            .collect::<Result<_>>()?;
        Function::new_named(name, &arg, &res, argn, resn, opts)
    }

    pub(crate) fn node(&self) -> Result<&Arc<dyn FunctionNode>> {
        self.node.as_ref().ok_or(Error::NullHandle)
    }

    pub fn is_null(&self) -> bool {
        self.node.is_none()
    }

    /// Whether two handles share the same node.
    pub fn is_same(&self, other: &Function) -> bool {
        match (&self.node, &other.node) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Name of the function, or `"null"` for a null handle.
    pub fn name(&self) -> String {
        match &self.node {
            None => "null".to_string(),
            Some(n) => n.core().name().to_string(),
        }
    }

    pub fn kind(&self) -> Result<NodeKind> {
        Ok(self.node()?.kind())
    }

    pub fn n_in(&self) -> Result<usize> {
        Ok(self.node()?.core().n_in())
    }

    pub fn n_out(&self) -> Result<usize> {
        Ok(self.node()?.core().n_out())
    }

    pub fn name_in(&self, i: usize) -> Result<String> {
        Ok(self.node()?.core().in_port(i)?.name.clone())
    }

    pub fn name_out(&self, i: usize) -> Result<String> {
        Ok(self.node()?.core().out_port(i)?.name.clone())
    }

    pub fn names_in(&self) -> Result<Vec<String>> {
        Ok(self.node()?.core().names_in())
    }

    pub fn names_out(&self) -> Result<Vec<String>> {
        Ok(self.node()?.core().names_out())
    }

    pub fn index_in(&self, name: &str) -> Result<usize> {
        self.node()?.core().index_in(name)
    }

    pub fn index_out(&self, name: &str) -> Result<usize> {
        self.node()?.core().index_out(name)
    }

    pub fn sparsity_in(&self, i: usize) -> Result<Sparsity> {
        Ok(self.node()?.core().in_port(i)?.sparsity.clone())
    }

    pub fn sparsity_out(&self, i: usize) -> Result<Sparsity> {
        Ok(self.node()?.core().out_port(i)?.sparsity.clone())
    }

    pub fn size_in(&self, i: usize) -> Result<(usize, usize)> {
        Ok(self.node()?.core().in_port(i)?.sparsity.size())
    }

    pub fn size_out(&self, i: usize) -> Result<(usize, usize)> {
        Ok(self.node()?.core().out_port(i)?.sparsity.size())
    }

    pub fn nnz_in(&self, i: usize) -> Result<usize> {
        Ok(self.node()?.core().in_port(i)?.sparsity.nnz())
    }

    pub fn nnz_out(&self, i: usize) -> Result<usize> {
        Ok(self.node()?.core().out_port(i)?.sparsity.nnz())
    }

    pub fn numel_in(&self, i: usize) -> Result<usize> {
        Ok(self.node()?.core().in_port(i)?.sparsity.numel())
    }

    pub fn numel_out(&self, i: usize) -> Result<usize> {
        Ok(self.node()?.core().out_port(i)?.sparsity.numel())
    }

    /// Total nonzero count over all input ports.
    pub fn nnz_in_total(&self) -> Result<usize> {
        let core = self.node()?.core();
        (0..core.n_in()).map(|i| Ok(core.in_port(i)?.sparsity.nnz())).sum()
    }

    /// Total nonzero count over all output ports.
    pub fn nnz_out_total(&self) -> Result<usize> {
        let core = self.node()?.core();
        (0..core.n_out()).map(|j| Ok(core.out_port(j)?.sparsity.nnz())).sum()
    }

    pub fn default_in(&self, i: usize) -> Result<f64> {
        Ok(self.node()?.core().in_port(i)?.default_value)
    }

    pub fn work_sizes(&self) -> Result<WorkSizes> {
        Ok(self.node()?.core().work())
    }

    pub fn has_spfwd(&self) -> Result<bool> {
        Ok(self.node()?.has_spfwd())
    }

    pub fn has_sprev(&self) -> Result<bool> {
        Ok(self.node()?.has_sprev())
    }

    /// Reserve a scratch-memory slot for exclusive use by one caller.
    pub fn checkout(&self) -> Result<usize> {
        Ok(self.node()?.core().pool().checkout())
    }

    /// Return a previously checked-out slot to the pool.
    pub fn release(&self, mem: usize) -> Result<()> {
        self.node()?.core().pool().release(mem)
    }

    pub fn pool_metrics(&self) -> Result<PoolMetrics> {
        Ok(self.node()?.core().pool().metrics())
    }

    /// A valid function name is nonempty, no reserved keyword, starts with
    /// a letter, and continues with alphanumerics or single underscores.
    pub fn check_name(name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        if KEYWORDS.contains(&name) {
            return false;
        }
        let chars: Vec<char> = name.chars().collect();
        if !chars[0].is_ascii_alphabetic() {
            return false;
        }
        for i in 1..chars.len() {
            if chars[i] == '_' {
                if i + 1 < chars.len() && chars[i + 1] == '_' {
                    return false;
                }
            } else if !chars[i].is_ascii_alphanumeric() {
                return false;
            }
        }
        true
    }

    /// Deterministically rewrite an arbitrary string into a valid name:
    /// prepend a letter if needed, collapse runs of other characters into
    /// one underscore, append `1` on keyword collision.
    pub fn fix_name(name: &str) -> String {
        if Self::check_name(name) {
            return name.to_string();
        }
        if name.is_empty() {
            return "unnamed".to_string();
        }
        let mut fixed = String::new();
        if !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
            fixed.push('a');
        }
        let mut previous_is_underscore = false;
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                fixed.push(c);
                previous_is_underscore = false;
            } else if !previous_is_underscore {
                fixed.push('_');
                previous_is_underscore = true;
            }
        }
        if KEYWORDS.contains(&fixed.as_str()) {
            fixed.push('1');
        }
        fixed
    }

    /// Rebuild this function as a primitive node exposing its full internal
    /// structure, by symbolic re-expansion.
    pub fn expand(&self) -> Result<Function> {
        self.expand_renamed(&self.name(), &Opts::new())
    }

    pub fn expand_renamed(&self, name: &str, opts: &Opts) -> Result<Function> {
        let node = self.node()?;
        let core = node.core();
        let graph = ExprGraph::new();
        let args: Vec<SymVec> = (0..core.n_in())
            .map(|i| {
                let p = core.in_port(i)?;
                Ok(SymVec::sym(&graph, &p.name, p.sparsity.clone()))
            })
            .collect::<Result<_>>()?;
        let res = self.call_sym(&graph, &args)?;
        let mut opts2 = opts.clone();
        if !opts2.contains_key("input_scheme") {
            opts2.insert(
                "input_scheme".to_string(),
                OptVal::StrList(core.names_in()),
            );
        }
        if !opts2.contains_key("output_scheme") {
            opts2.insert(
                "output_scheme".to_string(),
                OptVal::StrList(core.names_out()),
            );
        }
        if !opts2.contains_key("default_in") {
            let defaults: Vec<f64> = (0..core.n_in())
                .map(|i| Ok(core.in_port(i)?.default_value))
                .collect::<Result<_>>()?;
            opts2.insert("default_in".to_string(), OptVal::FloatList(defaults));
        }
        Function::new(name, &args, &res, &opts2)
    }

    pub(crate) fn ensure_primitive(&self) -> Result<Function> {
        if self.kind()? == NodeKind::Primitive {
            Ok(self.clone())
        } else {
            self.expand()
        }
    }

    /// Forward-mode derivative with `k` seed directions: inputs are the
    /// original inputs plus one seed port per input, outputs the original
    /// outputs plus one sensitivity port per output.
    pub fn forward(&self, k: usize) -> Result<Function> {
        if k == 0 {
            bail!("forward requires at least one seed direction");
        }
        self.node()?.forward(self, k)
    }

    /// Reverse-mode derivative with `k` adjoint directions: inputs are the
    /// original inputs plus one adjoint-seed port per output, outputs the
    /// original outputs plus one adjoint port per input.
    pub fn reverse(&self, k: usize) -> Result<Function> {
        if k == 0 {
            bail!("reverse requires at least one adjoint direction");
        }
        self.node()?.reverse(self, k)
    }

    /// Full Jacobian of all outputs with respect to all inputs as one
    /// combined dense matrix output named `jac`.
    pub fn jacobian(&self) -> Result<Function> {
        let prim = self.ensure_primitive()?;
        let node = prim.node()?.clone();
        let sx = node
            .as_primitive()
            .ok_or(Error::Capability("jacobian of a non-expandable node"))?;
        sx.jacobian_fn()
    }

    /// Build a new function whose outputs are derivative quantities of this
    /// one, named by colon-delimited specifications: `jac:OUT:IN`,
    /// `grad:OUT:IN`, `hess:OUT:IN:IN` (optionally prefixed `sym:`) or a
    /// plain declared output name.
    pub fn factory(&self, name: &str, outputs: &[&str]) -> Result<Function> {
        let prim = self.ensure_primitive()?;
        let node = prim.node()?.clone();
        let sx = node
            .as_primitive()
            .ok_or(Error::Capability("derivative factory"))?;
        let core = node.core();

        let graph = ExprGraph::new();
        let args: Vec<SymVec> = (0..core.n_in())
            .map(|i| {
                let p = core.in_port(i)?;
                Ok(SymVec::sym(&graph, &p.name, p.sparsity.clone()))
            })
            .collect::<Result<_>>()?;
        let primal = prim.call_sym(&graph, &args)?;

        let unknown = |spec: &str| Error::UnknownSpec(spec.to_string());
        let mut outs = Vec::with_capacity(outputs.len());
        let mut out_names = Vec::with_capacity(outputs.len());
        for &spec in outputs {
            let all: Vec<&str> = spec.split(':').collect();
            let parts: &[&str] = if all.first() == Some(&"sym") {
                &all[1..]
            } else {
                &all[..]
            };
            let sv = match *parts {
                [single] => {
                    let j = prim.index_out(single).map_err(|_| unknown(spec))?;
                    primal[j].clone()
                }
                ["jac", o, i] => {
                    let o = prim.index_out(o).map_err(|_| unknown(spec))?;
                    let i = prim.index_in(i).map_err(|_| unknown(spec))?;
                    let h = sx.jac_block_fn(o, i)?;
                    h.call_sym(&graph, &args)?.swap_remove(0)
                }
                ["grad", o, i] => {
                    let o = prim.index_out(o).map_err(|_| unknown(spec))?;
                    let i = prim.index_in(i).map_err(|_| unknown(spec))?;
                    let h = sx.grad_fn(o, i)?;
                    h.call_sym(&graph, &args)?.swap_remove(0)
                }
                ["hess", o, i, i2] => {
                    let o = prim.index_out(o).map_err(|_| unknown(spec))?;
                    let i = prim.index_in(i).map_err(|_| unknown(spec))?;
                    let i2 = prim.index_in(i2).map_err(|_| unknown(spec))?;
                    let g = sx.grad_fn(o, i)?;
                    let gnode = g.node()?.clone();
                    let gsx = gnode
                        .as_primitive()
                        .ok_or(Error::Capability("derivative factory"))?;
                    let h = gsx.jac_block_fn(0, i2)?;
                    h.call_sym(&graph, &args)?.swap_remove(0)
                }
                _ => return Err(unknown(spec)),
            };
            outs.push(sv);
            out_names.push(Function::fix_name(spec));
        }

        let defaults: Vec<f64> = (0..core.n_in())
            .map(|i| Ok(core.in_port(i)?.default_value))
            .collect::<Result<_>>()?;
        let mut opts = Opts::new();
        opts.insert(
            "input_scheme".to_string(),
            OptVal::StrList(core.names_in()),
        );
        opts.insert("output_scheme".to_string(), OptVal::StrList(out_names));
        opts.insert("default_in".to_string(), OptVal::FloatList(defaults));
        Function::new(name, &args, &outs, &opts)
    }

    /// Lower this function to a textual artifact via the code-generation
    /// backend.
    pub fn generate(&self, fname: &str, opts: &Opts) -> Result<String> {
        let mut gen = CodeGenerator::new(fname, opts)?;
        gen.add(self)?;
        Ok(gen.generate())
    }

    /// Construct a function from a persisted `KEY value` description. The
    /// first directive names the node type; only `interpolant` is
    /// recognized.
    pub fn load(path: impl AsRef<Path>) -> Result<Function> {
        let text = fs::read_to_string(path)?;
        let mut stream = TokenStream::new(&text);
        if !stream.proceed_to("CLASS") {
            bail!("expected a CLASS directive");
        }
        let class = stream.next_token().ok_or(Error::Msg(
            "unexpected end of stream after CLASS".to_string(),
        ))?;
        if class != "interpolant" {
            return Err(Error::UnsupportedType(class));
        }
        let name = if stream.proceed_to("NAME") {
            stream.next_token().ok_or(Error::Msg(
                "unexpected end of stream after NAME".to_string(),
            ))?
        } else {
            "interpolant".to_string()
        };
        if !stream.proceed_to("GRID") {
            bail!("expected a GRID directive");
        }
        let grid = stream.parse_values()?;
        if !stream.proceed_to("VALUES") {
            bail!("expected a VALUES directive");
        }
        let values = stream.parse_values()?;
        Function::interpolant(&name, &grid, &values)
    }

    /// The instruction-dependency graph of a primitive node.
    pub fn to_petgraph(&self) -> Result<PetGraph<String, ()>> {
        let node = self.node()?.clone();
        let sx = node
            .as_primitive()
            .ok_or(Error::Capability("graph export"))?;
        let mut g = PetGraph::<String, ()>::new();
        let mut idx = Vec::with_capacity(sx.instrs().len());
        for (k, instr) in sx.instrs().iter().enumerate() {
            let label = match *instr {
                Instr::Input { port, elem } => {
                    format!("{}[{}]", node.core().in_port(port)?.name, elem)
                }
                Instr::Const { v } => format!("{v:?}"),
                Instr::Binary { op, .. } => format!("({})", op.as_c_op()),
                Instr::Unary { op, .. } => format!("{op:?}"),
            };
            idx.push(g.add_node(label));
            match *instr {
                Instr::Binary { lhs, rhs, .. } => {
                    g.add_edge(idx[lhs], idx[k], ());
                    g.add_edge(idx[rhs], idx[k], ());
                }
                Instr::Unary { arg, .. } => {
                    g.add_edge(idx[arg], idx[k], ());
                }
                _ => {}
            }
        }
        Ok(g)
    }

    /// Produce a DOT format string of a primitive node's instruction graph.
    pub fn to_dot(&self) -> Result<String> {
        let g = self.to_petgraph()?;
        Ok(format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel])))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(node) = &self.node else {
            return write!(f, "null");
        };
        let core = node.core();
        let dims = |sp: &Sparsity| {
            let (r, c) = sp.size();
            if sp.is_scalar() {
                String::new()
            } else if c == 1 && sp.is_dense() {
                format!("[{r}]")
            } else if sp.is_dense() {
                format!("[{r}x{c}]")
            } else {
                format!("[{r}x{c},{}nz]", sp.nnz())
            }
        };
        write!(f, "{}:(", core.name())?;
        for i in 0..core.n_in() {
            let p = core.in_port(i).map_err(|_| fmt::Error)?;
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}{}", p.name, dims(&p.sparsity))?;
        }
        write!(f, ")->(")?;
        for j in 0..core.n_out() {
            let p = core.out_port(j).map_err(|_| fmt::Error)?;
            if j > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}{}", p.name, dims(&p.sparsity))?;
        }
        write!(f, ")")
    }
}

/// Whitespace-delimited token stream over a `KEY value` description.
/// Lines beginning with `#` are comments; a keyword mismatch leaves the
/// read position untouched.
struct TokenStream {
    toks: Vec<String>,
    pos: usize,
}

impl TokenStream {
    fn new(text: &str) -> Self {
        let toks = text
            .lines()
            .filter(|l| !l.trim_start().starts_with('#'))
            .flat_map(|l| l.split_whitespace())
            .map(|t| t.to_string())
            .collect();
        TokenStream { toks, pos: 0 }
    }

    /// Consume the next token if it equals `kw`; otherwise rewind.
    fn proceed_to(&mut self, kw: &str) -> bool {
        if self.toks.get(self.pos).map(|t| t == kw).unwrap_or(false) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Option<String> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    /// A count followed by that many floating-point values.
    fn parse_values(&mut self) -> Result<Vec<f64>> {
        let count: usize = self
            .next_token()
            .ok_or(Error::Msg("unexpected end of stream".to_string()))?
            .parse()
            .map_err(|_| Error::Msg("expected a count".to_string()))?;
        let mut vals = Vec::with_capacity(count);
        for _ in 0..count {
            let tok = self
                .next_token()
                .ok_or(Error::Msg("unexpected end of stream".to_string()))?;
            vals.push(
                tok.parse()
                    .map_err(|_| Error::Msg(format!("expected a number, got '{tok}'")))?,
            );
        }
        Ok(vals)
    }
}
