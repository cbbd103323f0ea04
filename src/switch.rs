use std::sync::Arc;

use crate::node::{FunctionNode, NodeCore, NodeKind, Port, WorkSizes};
use crate::{Error, Function, Result, Sparsity};

/// Multi-branch node: a runtime integer selector, passed as an extra
/// leading input, picks which candidate evaluates. Out-of-range selector
/// values fall back to the default function.
pub(crate) struct SwitchNode {
    core: NodeCore,
    candidates: Vec<Function>,
    default: Function,
}

impl Function {
    /// Build a switch over an ordered candidate list. All candidates and
    /// the default must agree on port counts and shapes.
    pub fn conditional(name: &str, candidates: &[Function], default: &Function) -> Result<Function> {
        let dnode = default.node()?;
        let dcore = dnode.core();
        for c in candidates {
            let cnode = c.node()?;
            let ccore = cnode.core();
            if ccore.n_in() != dcore.n_in() || ccore.n_out() != dcore.n_out() {
                return Err(Error::Shape {
                    what: format!("switch candidate '{}'", ccore.name()),
                    expected: format!("{} inputs, {} outputs", dcore.n_in(), dcore.n_out()),
                    got: format!("{} inputs, {} outputs", ccore.n_in(), ccore.n_out()),
                });
            }
            for i in 0..dcore.n_in() {
                if ccore.in_port(i)?.sparsity != dcore.in_port(i)?.sparsity {
                    return Err(Error::Shape {
                        what: format!("input {} of switch candidate '{}'", i, ccore.name()),
                        expected: format!("{:?}", dcore.in_port(i)?.sparsity.size()),
                        got: format!("{:?}", ccore.in_port(i)?.sparsity.size()),
                    });
                }
            }
            for j in 0..dcore.n_out() {
                if ccore.out_port(j)?.sparsity != dcore.out_port(j)?.sparsity {
                    return Err(Error::Shape {
                        what: format!("output {} of switch candidate '{}'", j, ccore.name()),
                        expected: format!("{:?}", dcore.out_port(j)?.sparsity.size()),
                        got: format!("{:?}", ccore.out_port(j)?.sparsity.size()),
                    });
                }
            }
        }

        let mut inputs = Vec::with_capacity(1 + dcore.n_in());
        inputs.push(Port::new("ind", Sparsity::scalar()));
        for i in 0..dcore.n_in() {
            inputs.push(dcore.in_port(i)?.clone());
        }
        let outputs: Vec<Port> = (0..dcore.n_out())
            .map(|j| Ok(dcore.out_port(j)?.clone()))
            .collect::<Result<_>>()?;

        // Scratch must cover whichever branch gets selected
        let mut sz_iw = dcore.work().sz_iw;
        let mut sz_w = dcore.work().sz_w;
        for c in candidates {
            let w = c.node()?.core().work();
            sz_iw = sz_iw.max(w.sz_iw);
            sz_w = sz_w.max(w.sz_w);
        }
        let work = WorkSizes {
            sz_arg: 1 + dcore.n_in(),
            sz_res: dcore.n_out(),
            sz_iw,
            sz_w,
        };
        let core = NodeCore::new(name, inputs, outputs, work)?;
        Ok(Function::from_node(Arc::new(SwitchNode {
            core,
            candidates: candidates.to_vec(),
            default: default.clone(),
        })))
    }

    /// Two-branch conditional: selector 0 evaluates `f_false`, anything
    /// else `f_true`.
    pub fn if_else(name: &str, f_true: &Function, f_false: &Function) -> Result<Function> {
        Function::conditional(name, &[f_false.clone()], f_true)
    }
}

impl SwitchNode {
    fn select(&self, sel: f64) -> &Function {
        if sel.is_finite() && sel >= 0.0 && (sel as usize) < self.candidates.len() {
            &self.candidates[sel as usize]
        } else {
            &self.default
        }
    }
}

impl FunctionNode for SwitchNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Switch
    }

    fn eval(
        &self,
        args: &[Option<&[f64]>],
        res: &mut [Option<&mut [f64]>],
        iw: &mut [i64],
        w: &mut [f64],
    ) -> Result<()> {
        let sel = match args[0] {
            Some(buf) => buf[0],
            None => self.core.in_port(0)?.default_value,
        };
        let chosen = self.select(sel);
        chosen.node()?.eval(&args[1..], res, iw, w)
    }

    /// Branch-wise derivative: the switch of the candidates' derivatives.
    /// The selector is integer-valued and carries no seed port.
    fn forward(&self, _f: &Function, k: usize) -> Result<Function> {
        let fwd_cands: Vec<Function> = self
            .candidates
            .iter()
            .map(|c| c.forward(k))
            .collect::<Result<_>>()?;
        let fwd_def = self.default.forward(k)?;
        Function::conditional(
            &format!("fwd{}_{}", k, self.core.name()),
            &fwd_cands,
            &fwd_def,
        )
    }

    fn reverse(&self, _f: &Function, k: usize) -> Result<Function> {
        let adj_cands: Vec<Function> = self
            .candidates
            .iter()
            .map(|c| c.reverse(k))
            .collect::<Result<_>>()?;
        let adj_def = self.default.reverse(k)?;
        Function::conditional(
            &format!("adj{}_{}", k, self.core.name()),
            &adj_cands,
            &adj_def,
        )
    }
}
