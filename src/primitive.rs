use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::codegen::CodeGenerator;
use crate::dispatch::Element;
use crate::expr::{BinaryOp, Expr, ExprGraph, ExprOp, SymVec, UnaryOp};
use crate::node::{scheme_opts, FunctionNode, NodeCore, NodeKind, OptVal, Opts, Port, WorkSizes};
use crate::{bail, Error, Function, Result, Sparsity};

/// One instruction of a compiled operation tape. Instruction `k` writes
/// work slot `k`; operands always refer to earlier slots.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Instr {
    /// Load one element of an input port, falling back to the port default
    /// when the argument buffer is absent.
    Input { port: usize, elem: usize },
    Const {
        v: f64,
    },
    Binary {
        op: BinaryOp,
        lhs: usize,
        rhs: usize,
    },
    Unary {
        op: UnaryOp,
        arg: usize,
    },
}

/// Primitive node: a symbolic expression graph compiled into a flat
/// instruction tape. Implements numeric evaluation, symbolic re-expansion,
/// both sparsity-propagation directions and both AD modes.
pub struct SxNode {
    core: NodeCore,
    instrs: Vec<Instr>,
    /// Per output port, per element: the work slot holding its value.
    out_map: Vec<Vec<usize>>,
}

impl SxNode {
    pub(crate) fn new(
        name: &str,
        inputs: &[SymVec],
        outputs: &[SymVec],
        opts: &Opts,
    ) -> Result<SxNode> {
        // Configuration
        let mut in_scheme: Option<Vec<String>> = None;
        let mut out_scheme: Option<Vec<String>> = None;
        let mut defaults: Option<Vec<f64>> = None;
        for (key, val) in opts {
            match key.as_str() {
                "input_scheme" => match val {
                    OptVal::StrList(v) => in_scheme = Some(v.clone()),
                    _ => bail!("option 'input_scheme' must be a list of strings"),
                },
                "output_scheme" => match val {
                    OptVal::StrList(v) => out_scheme = Some(v.clone()),
                    _ => bail!("option 'output_scheme' must be a list of strings"),
                },
                "default_in" => match val {
                    OptVal::FloatList(v) => defaults = Some(v.clone()),
                    _ => bail!("option 'default_in' must be a list of floats"),
                },
                _ => bail!("unrecognized option '{}'", key),
            }
        }
        if let Some(s) = &in_scheme {
            if s.len() != inputs.len() {
                return Err(Error::Arity {
                    what: "input scheme entries",
                    expected: inputs.len(),
                    got: s.len(),
                });
            }
        }
        if let Some(s) = &out_scheme {
            if s.len() != outputs.len() {
                return Err(Error::Arity {
                    what: "output scheme entries",
                    expected: outputs.len(),
                    got: s.len(),
                });
            }
        }
        if let Some(d) = &defaults {
            if d.len() != inputs.len() {
                return Err(Error::Arity {
                    what: "default_in entries",
                    expected: inputs.len(),
                    got: d.len(),
                });
            }
        }

        // All ports must live in one expression graph
        let graph = inputs.iter().chain(outputs).map(|v| v.graph()).next();
        if let Some(g) = graph {
            for v in inputs.iter().chain(outputs) {
                if !v.graph().same_graph(g) {
                    bail!("function inputs and outputs must share one expression graph");
                }
            }
        }

        // Port descriptor tables
        let port_name = |scheme: &Option<Vec<String>>, prefix: &str, idx: usize| {
            scheme
                .as_ref()
                .map(|s| s[idx].clone())
                .unwrap_or_else(|| format!("{prefix}{idx}"))
        };
        let in_ports: Vec<Port> = inputs
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut p = Port::new(port_name(&in_scheme, "i", i), v.sparsity().clone());
                if let Some(d) = &defaults {
                    p.default_value = d[i];
                }
                p
            })
            .collect();
        let out_ports: Vec<Port> = outputs
            .iter()
            .enumerate()
            .map(|(i, v)| Port::new(port_name(&out_scheme, "o", i), v.sparsity().clone()))
            .collect();

        // Map free symbolic primitives to (port, element)
        let mut sym_of: HashMap<usize, (usize, usize)> = HashMap::new();
        for (i, v) in inputs.iter().enumerate() {
            for (e, x) in v.elems().iter().enumerate() {
                let id = usize::from(x.id());
                let is_sym = graph
                    .map(|g| matches!(g.ops()[id], ExprOp::Sym { .. }))
                    .unwrap_or(false);
                if !is_sym {
                    bail!("function inputs must be free symbolic placeholders");
                }
                if sym_of.insert(id, (i, e)).is_some() {
                    bail!("repeated symbolic primitive among the inputs");
                }
            }
        }

        // Compile the reachable part of the expression graph into a tape
        let mut instrs = Vec::new();
        let mut out_map = vec![Vec::new(); outputs.len()];
        if let Some(g) = graph {
            let ops = g.ops();

            // Reachability from the outputs
            let mut reach = vec![false; ops.len()];
            let mut stack: Vec<usize> = outputs
                .iter()
                .flat_map(|v| v.elems().iter().map(|x| usize::from(x.id())))
                .collect();
            while let Some(id) = stack.pop() {
                if reach[id] {
                    continue;
                }
                reach[id] = true;
                match ops[id] {
                    ExprOp::Binary { lhs, rhs, .. } => {
                        stack.push(lhs.0);
                        stack.push(rhs.0);
                    }
                    ExprOp::Unary { arg, .. } => stack.push(arg.0),
                    ExprOp::Const(_) | ExprOp::Sym { .. } => {}
                }
            }

            // Dependency graph over reachable operations, evaluated in
            // topological order
            let mut dep = DiGraphMap::<usize, ()>::new();
            for id in 0..ops.len() {
                if !reach[id] {
                    continue;
                }
                dep.add_node(id);
                match ops[id] {
                    ExprOp::Binary { lhs, rhs, .. } => {
                        dep.add_edge(lhs.0, id, ());
                        dep.add_edge(rhs.0, id, ());
                    }
                    ExprOp::Unary { arg, .. } => {
                        dep.add_edge(arg.0, id, ());
                    }
                    _ => {}
                }
            }
            let order = toposort(&dep, None)
                .map_err(|_| Error::Msg("cycle detected in expression graph".to_string()))?;

            let mut widx = vec![usize::MAX; ops.len()];
            for id in order {
                widx[id] = instrs.len();
                let instr = match &ops[id] {
                    ExprOp::Const(v) => Instr::Const { v: *v },
                    ExprOp::Sym { label } => {
                        let &(port, elem) = sym_of.get(&id).ok_or_else(|| {
                            Error::Msg(format!("free symbolic primitive '{label}' in outputs"))
                        })?;
                        Instr::Input { port, elem }
                    }
                    ExprOp::Binary { op, lhs, rhs } => Instr::Binary {
                        op: *op,
                        lhs: widx[lhs.0],
                        rhs: widx[rhs.0],
                    },
                    ExprOp::Unary { op, arg } => Instr::Unary {
                        op: *op,
                        arg: widx[arg.0],
                    },
                };
                instrs.push(instr);
            }

            for (j, v) in outputs.iter().enumerate() {
                out_map[j] = v
                    .elems()
                    .iter()
                    .map(|x| widx[usize::from(x.id())])
                    .collect();
            }
        }

        let work = WorkSizes {
            sz_arg: in_ports.len(),
            sz_res: out_ports.len(),
            sz_iw: 0,
            sz_w: instrs.len(),
        };
        let core = NodeCore::new(name, in_ports, out_ports, work)?;
        Ok(SxNode {
            core,
            instrs,
            out_map,
        })
    }

    pub(crate) fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// One interpreter serves numeric evaluation and forward dependency
    /// propagation; only the element type differs.
    fn interp<E: Element>(
        &self,
        args: &[Option<&[E]>],
        res: &mut [Option<&mut [E]>],
        w: &mut [E],
    ) -> Result<()> {
        for (k, instr) in self.instrs.iter().enumerate() {
            w[k] = match *instr {
                Instr::Input { port, elem } => match args[port] {
                    Some(buf) => buf[elem],
                    None => E::constant(self.core.in_port(port)?.default_value),
                },
                Instr::Const { v } => E::constant(v),
                Instr::Binary { op, lhs, rhs } => E::binary(op, w[lhs], w[rhs]),
                Instr::Unary { op, arg } => E::unary(op, w[arg]),
            };
        }
        for (j, map) in self.out_map.iter().enumerate() {
            if let Some(buf) = res[j].as_deref_mut() {
                for (e, &wi) in map.iter().enumerate() {
                    buf[e] = w[wi];
                }
            }
        }
        Ok(())
    }

    /// Run the tape symbolically, returning the expression held by every
    /// work slot.
    pub(crate) fn sym_sweep(&self, graph: &ExprGraph, args: &[SymVec]) -> Result<Vec<Expr>> {
        let mut w: Vec<Expr> = Vec::with_capacity(self.instrs.len());
        for instr in &self.instrs {
            let x = match *instr {
                Instr::Input { port, elem } => args[port].elems()[elem].clone(),
                Instr::Const { v } => graph.constant(v),
                Instr::Binary { op, lhs, rhs } => {
                    Expr::from_id(graph, graph.binary(op, w[lhs].id(), w[rhs].id()))
                }
                Instr::Unary { op, arg } => {
                    Expr::from_id(graph, graph.unary(op, w[arg].id()))
                }
            };
            w.push(x);
        }
        Ok(w)
    }

    fn collect_outputs(&self, graph: &ExprGraph, w: &[Expr]) -> Result<Vec<SymVec>> {
        (0..self.core.n_out())
            .map(|j| {
                let sp = self.core.out_port(j)?.sparsity.clone();
                let elems = self.out_map[j].iter().map(|&wi| w[wi].clone()).collect();
                SymVec::from_elems(graph, sp, elems)
            })
            .collect()
    }

    /// Forward sweep of tangents through the tape. `seed` supplies the
    /// tangent of each input element; `w` holds the primal expressions.
    fn tangent_sweep(
        &self,
        graph: &ExprGraph,
        w: &[Expr],
        seed: &dyn Fn(usize, usize) -> Expr,
    ) -> Vec<Expr> {
        let zero = graph.constant(0.0);
        let mut dot: Vec<Expr> = Vec::with_capacity(self.instrs.len());
        for (k, instr) in self.instrs.iter().enumerate() {
            let d = match *instr {
                Instr::Input { port, elem } => seed(port, elem),
                Instr::Const { .. } => zero.clone(),
                Instr::Binary { op, lhs, rhs } => {
                    let (dl, dr) = (&dot[lhs], &dot[rhs]);
                    match op {
                        BinaryOp::Add => dl + dr,
                        BinaryOp::Sub => dl - dr,
                        BinaryOp::Mul => &(dl * &w[rhs]) + &(&w[lhs] * dr),
                        BinaryOp::Div => &(dl - &(&w[k] * dr)) / &w[rhs],
                    }
                }
                Instr::Unary { op, arg } => {
                    let da = &dot[arg];
                    match op {
                        UnaryOp::Neg => -da,
                        UnaryOp::Sqrt => da / &(&w[k] * 2.0),
                        UnaryOp::Sin => da * &w[arg].cos(),
                        UnaryOp::Cos => -&(da * &w[arg].sin()),
                        UnaryOp::Exp => da * &w[k],
                        UnaryOp::Ln => da / &w[arg],
                    }
                }
            };
            dot.push(d);
        }
        dot
    }

    /// Adjoint sweep through the tape. `seed` supplies the adjoint of each
    /// output element; returns the adjoint of every input element.
    fn adjoint_sweep(
        &self,
        graph: &ExprGraph,
        w: &[Expr],
        seed: &dyn Fn(usize, usize) -> Expr,
    ) -> Result<Vec<Vec<Expr>>> {
        let zero = graph.constant(0.0);
        let mut bar: Vec<Expr> = vec![zero.clone(); self.instrs.len()];
        for (j, map) in self.out_map.iter().enumerate() {
            for (e, &wi) in map.iter().enumerate() {
                let t = bar[wi].clone();
                bar[wi] = &t + &seed(j, e);
            }
        }
        let mut adj: Vec<Vec<Expr>> = (0..self.core.n_in())
            .map(|i| {
                Ok(vec![
                    zero.clone();
                    self.core.in_port(i)?.sparsity.nnz()
                ])
            })
            .collect::<Result<_>>()?;
        for k in (0..self.instrs.len()).rev() {
            let b = bar[k].clone();
            match self.instrs[k] {
                Instr::Binary { op, lhs, rhs } => {
                    let (cl, cr) = match op {
                        BinaryOp::Add => (b.clone(), b.clone()),
                        BinaryOp::Sub => (b.clone(), -&b),
                        BinaryOp::Mul => (&b * &w[rhs], &b * &w[lhs]),
                        BinaryOp::Div => (&b / &w[rhs], -&(&(&b * &w[k]) / &w[rhs])),
                    };
                    let t = bar[lhs].clone();
                    bar[lhs] = &t + &cl;
                    let t = bar[rhs].clone();
                    bar[rhs] = &t + &cr;
                }
                Instr::Unary { op, arg } => {
                    let c = match op {
                        UnaryOp::Neg => -&b,
                        UnaryOp::Sqrt => &b / &(&w[k] * 2.0),
                        UnaryOp::Sin => &b * &w[arg].cos(),
                        UnaryOp::Cos => -&(&b * &w[arg].sin()),
                        UnaryOp::Exp => &b * &w[k],
                        UnaryOp::Ln => &b / &w[arg],
                    };
                    let t = bar[arg].clone();
                    bar[arg] = &t + &c;
                }
                Instr::Input { port, elem } => {
                    adj[port][elem] = b;
                }
                Instr::Const { .. } => {}
            }
        }
        Ok(adj)
    }

    /// Fresh symbolic arguments mirroring this node's input ports.
    fn sym_args(&self, graph: &ExprGraph) -> Result<Vec<SymVec>> {
        (0..self.core.n_in())
            .map(|i| {
                let p = self.core.in_port(i)?;
                Ok(SymVec::sym(graph, &p.name, p.sparsity.clone()))
            })
            .collect()
    }

    pub(crate) fn ad_forward(&self, k: usize) -> Result<Function> {
        let core = &self.core;
        let graph = ExprGraph::new();
        let mut args = self.sym_args(&graph)?;
        let mut in_names = core.names_in();
        let mut defaults: Vec<f64> = (0..core.n_in())
            .map(|i| Ok(core.in_port(i)?.default_value))
            .collect::<Result<_>>()?;

        let mut seeds = Vec::with_capacity(core.n_in());
        for i in 0..core.n_in() {
            let p = core.in_port(i)?;
            let name = format!("fwd_{}", p.name);
            seeds.push(SymVec::sym(&graph, &name, p.sparsity.repeat_horz(k)));
            in_names.push(name);
            defaults.push(0.0);
        }

        let w = self.sym_sweep(&graph, &args)?;
        let mut outputs = self.collect_outputs(&graph, &w)?;
        let mut out_names = core.names_out();

        let mut sens_elems: Vec<Vec<Expr>> = vec![Vec::new(); core.n_out()];
        for d in 0..k {
            let seeds_ref = &seeds;
            let nnz_of: Vec<usize> = (0..core.n_in())
                .map(|i| Ok(core.in_port(i)?.sparsity.nnz()))
                .collect::<Result<_>>()?;
            let seed = move |port: usize, elem: usize| {
                seeds_ref[port].elems()[d * nnz_of[port] + elem].clone()
            };
            let dot = self.tangent_sweep(&graph, &w, &seed);
            for (j, map) in self.out_map.iter().enumerate() {
                sens_elems[j].extend(map.iter().map(|&wi| dot[wi].clone()));
            }
        }
        for j in 0..core.n_out() {
            let p = core.out_port(j)?;
            outputs.push(SymVec::from_elems(
                &graph,
                p.sparsity.repeat_horz(k),
                std::mem::take(&mut sens_elems[j]),
            )?);
            out_names.push(format!("fwd_{}", p.name));
        }

        args.extend(seeds);
        let opts = scheme_opts(in_names, out_names, defaults);
        Function::new(
            &format!("fwd{}_{}", k, core.name()),
            &args,
            &outputs,
            &opts,
        )
    }

    pub(crate) fn ad_reverse(&self, k: usize) -> Result<Function> {
        let core = &self.core;
        let graph = ExprGraph::new();
        let mut args = self.sym_args(&graph)?;
        let mut in_names = core.names_in();
        let mut defaults: Vec<f64> = (0..core.n_in())
            .map(|i| Ok(core.in_port(i)?.default_value))
            .collect::<Result<_>>()?;

        let mut seeds = Vec::with_capacity(core.n_out());
        for j in 0..core.n_out() {
            let p = core.out_port(j)?;
            let name = format!("adj_{}", p.name);
            seeds.push(SymVec::sym(&graph, &name, p.sparsity.repeat_horz(k)));
            in_names.push(name);
            defaults.push(0.0);
        }

        let w = self.sym_sweep(&graph, &args)?;
        let mut outputs = self.collect_outputs(&graph, &w)?;
        let mut out_names = core.names_out();

        let mut adj_elems: Vec<Vec<Expr>> = vec![Vec::new(); core.n_in()];
        for d in 0..k {
            let seeds_ref = &seeds;
            let nnz_of: Vec<usize> = (0..core.n_out())
                .map(|j| Ok(core.out_port(j)?.sparsity.nnz()))
                .collect::<Result<_>>()?;
            let seed = move |port: usize, elem: usize| {
                seeds_ref[port].elems()[d * nnz_of[port] + elem].clone()
            };
            let adj = self.adjoint_sweep(&graph, &w, &seed)?;
            for (i, elems) in adj.into_iter().enumerate() {
                adj_elems[i].extend(elems);
            }
        }
        for i in 0..core.n_in() {
            let p = core.in_port(i)?;
            outputs.push(SymVec::from_elems(
                &graph,
                p.sparsity.repeat_horz(k),
                std::mem::take(&mut adj_elems[i]),
            )?);
            out_names.push(format!("adj_{}", p.name));
        }

        args.extend(seeds);
        let opts = scheme_opts(in_names, out_names, defaults);
        Function::new(
            &format!("adj{}_{}", k, core.name()),
            &args,
            &outputs,
            &opts,
        )
    }

    /// Full Jacobian of all outputs with respect to all inputs, as a single
    /// dense matrix output named `jac`: rows span output nonzeros, columns
    /// span input nonzeros, both in port declaration order.
    pub(crate) fn jacobian_fn(&self) -> Result<Function> {
        let core = &self.core;
        let graph = ExprGraph::new();
        let args = self.sym_args(&graph)?;
        let w = self.sym_sweep(&graph, &args)?;
        let total_out: usize = (0..core.n_out())
            .map(|j| core.out_port(j).map(|p| p.sparsity.nnz()))
            .sum::<Result<usize>>()?;
        let total_in: usize = (0..core.n_in())
            .map(|i| core.in_port(i).map(|p| p.sparsity.nnz()))
            .sum::<Result<usize>>()?;

        let mut elems = Vec::with_capacity(total_out * total_in);
        for i in 0..core.n_in() {
            for c in 0..core.in_port(i)?.sparsity.nnz() {
                let block = self.jac_column(&graph, &w, i, c);
                elems.extend(block);
            }
        }
        let jac = SymVec::from_elems(&graph, Sparsity::dense(total_out, total_in), elems)?;
        let defaults: Vec<f64> = (0..core.n_in())
            .map(|i| Ok(core.in_port(i)?.default_value))
            .collect::<Result<_>>()?;
        let opts = scheme_opts(core.names_in(), vec!["jac".to_string()], defaults);
        Function::new(&format!("jac_{}", core.name()), &args, &[jac], &opts)
    }

    /// One Jacobian column: derivatives of every output element with
    /// respect to input element (`i`, `c`).
    fn jac_column(&self, graph: &ExprGraph, w: &[Expr], i: usize, c: usize) -> Vec<Expr> {
        let one = graph.constant(1.0);
        let zero = graph.constant(0.0);
        let seed = move |port: usize, elem: usize| {
            if port == i && elem == c {
                one.clone()
            } else {
                zero.clone()
            }
        };
        let dot = self.tangent_sweep(graph, w, &seed);
        self.out_map
            .iter()
            .flat_map(|map| map.iter().map(|&wi| dot[wi].clone()))
            .collect()
    }

    /// Jacobian block of one output port with respect to one input port.
    pub(crate) fn jac_block_fn(&self, o: usize, i: usize) -> Result<Function> {
        let core = &self.core;
        let graph = ExprGraph::new();
        let args = self.sym_args(&graph)?;
        let w = self.sym_sweep(&graph, &args)?;
        let nnz_out = core.out_port(o)?.sparsity.nnz();
        let nnz_in = core.in_port(i)?.sparsity.nnz();
        let mut elems = Vec::with_capacity(nnz_out * nnz_in);
        for c in 0..nnz_in {
            let one = graph.constant(1.0);
            let zero = graph.constant(0.0);
            let seed = move |port: usize, elem: usize| {
                if port == i && elem == c {
                    one.clone()
                } else {
                    zero.clone()
                }
            };
            let dot = self.tangent_sweep(&graph, &w, &seed);
            elems.extend(self.out_map[o].iter().map(|&wi| dot[wi].clone()));
        }
        let block = SymVec::from_elems(&graph, Sparsity::dense(nnz_out, nnz_in), elems)?;
        let defaults: Vec<f64> = (0..core.n_in())
            .map(|ix| Ok(core.in_port(ix)?.default_value))
            .collect::<Result<_>>()?;
        let name = Function::fix_name(&format!(
            "jac_{}_{}",
            core.out_port(o)?.name,
            core.in_port(i)?.name
        ));
        let opts = scheme_opts(core.names_in(), vec!["jac".to_string()], defaults);
        Function::new(&name, &args, &[block], &opts)
    }

    /// Gradient of a scalar output port with respect to one input port,
    /// as a column vector, via one adjoint sweep.
    pub(crate) fn grad_fn(&self, o: usize, i: usize) -> Result<Function> {
        let core = &self.core;
        if core.out_port(o)?.sparsity.nnz() != 1 {
            return Err(Error::UnknownSpec(format!(
                "gradient requires a scalar output, '{}' is not",
                core.out_port(o)?.name
            )));
        }
        let graph = ExprGraph::new();
        let args = self.sym_args(&graph)?;
        let w = self.sym_sweep(&graph, &args)?;
        let one = graph.constant(1.0);
        let zero = graph.constant(0.0);
        let seed = move |port: usize, _elem: usize| {
            if port == o {
                one.clone()
            } else {
                zero.clone()
            }
        };
        let adj = self.adjoint_sweep(&graph, &w, &seed)?;
        let nnz_in = core.in_port(i)?.sparsity.nnz();
        let grad = SymVec::from_elems(&graph, Sparsity::vector(nnz_in), adj[i].clone())?;
        let defaults: Vec<f64> = (0..core.n_in())
            .map(|ix| Ok(core.in_port(ix)?.default_value))
            .collect::<Result<_>>()?;
        let name = Function::fix_name(&format!(
            "grad_{}_{}",
            core.out_port(o)?.name,
            core.in_port(i)?.name
        ));
        let opts = scheme_opts(core.names_in(), vec!["grad".to_string()], defaults);
        Function::new(&name, &args, &[grad], &opts)
    }
}

impl FunctionNode for SxNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Primitive
    }

    fn eval(
        &self,
        args: &[Option<&[f64]>],
        res: &mut [Option<&mut [f64]>],
        _iw: &mut [i64],
        w: &mut [f64],
    ) -> Result<()> {
        self.interp(args, res, w)
    }

    fn eval_sym(&self, graph: &ExprGraph, args: &[SymVec]) -> Result<Vec<SymVec>> {
        let w = self.sym_sweep(graph, args)?;
        self.collect_outputs(graph, &w)
    }

    fn has_spfwd(&self) -> bool {
        true
    }

    fn has_sprev(&self) -> bool {
        true
    }

    fn sp_forward(
        &self,
        args: &[Option<&[u64]>],
        res: &mut [Option<&mut [u64]>],
        _iw: &mut [i64],
        bw: &mut [u64],
    ) -> Result<()> {
        self.interp(args, res, bw)
    }

    fn sp_reverse(
        &self,
        args: &mut [Option<&mut [u64]>],
        res: &mut [Option<&mut [u64]>],
        _iw: &mut [i64],
        bw: &mut [u64],
    ) -> Result<()> {
        let n = self.instrs.len();
        let bw = &mut bw[..n];
        bw.fill(0);
        for (j, map) in self.out_map.iter().enumerate() {
            if let Some(seed) = res[j].as_deref_mut() {
                for (e, &wi) in map.iter().enumerate() {
                    bw[wi] |= seed[e];
                    seed[e] = 0;
                }
            }
        }
        for k in (0..n).rev() {
            let b = bw[k];
            if b == 0 {
                continue;
            }
            match self.instrs[k] {
                Instr::Binary { lhs, rhs, .. } => {
                    bw[lhs] |= b;
                    bw[rhs] |= b;
                }
                Instr::Unary { arg, .. } => bw[arg] |= b,
                Instr::Input { port, elem } => {
                    if let Some(acc) = args[port].as_deref_mut() {
                        acc[elem] |= b;
                    }
                }
                Instr::Const { .. } => {}
            }
        }
        Ok(())
    }

    fn forward(&self, _f: &Function, k: usize) -> Result<Function> {
        self.ad_forward(k)
    }

    fn reverse(&self, _f: &Function, k: usize) -> Result<Function> {
        self.ad_reverse(k)
    }

    fn as_primitive(&self) -> Option<&SxNode> {
        Some(self)
    }

    fn codegen(&self, gen: &mut CodeGenerator) -> Result<()> {
        gen.line(format!(
            "void {}(const double** arg, double** res, long long* iw, double* w) {{",
            self.core.name()
        ));
        for (k, instr) in self.instrs.iter().enumerate() {
            let stmt = match *instr {
                Instr::Input { port, elem } => format!(
                    "  w[{k}] = arg[{port}] ? arg[{port}][{elem}] : {:?};",
                    self.core.in_port(port)?.default_value
                ),
                Instr::Const { v } => format!("  w[{k}] = {v:?};"),
                Instr::Binary { op, lhs, rhs } => {
                    format!("  w[{k}] = w[{lhs}] {} w[{rhs}];", op.as_c_op())
                }
                Instr::Unary { op, arg } => {
                    format!("  w[{k}] = {};", op.fill_in_c_op(format!("w[{arg}]")))
                }
            };
            gen.line(stmt);
        }
        for (j, map) in self.out_map.iter().enumerate() {
            for (e, &wi) in map.iter().enumerate() {
                gen.line(format!("  if (res[{j}]) res[{j}][{e}] = w[{wi}];"));
            }
        }
        gen.line("}".to_string());
        Ok(())
    }
}
