use indexmap::IndexMap;

use crate::expr::{BinaryOp, ExprGraph, SymVec, UnaryOp};
use crate::pool::WorkBuffers;
use crate::{bail, Error, Function, Result};

/// Numeric-like element the marshalling layer is generic over: plain
/// numbers evaluate, dependency masks propagate sparsity by OR-accumulation.
pub(crate) trait Element: Copy {
    fn constant(v: f64) -> Self;
    fn binary(op: BinaryOp, a: Self, b: Self) -> Self;
    fn unary(op: UnaryOp, a: Self) -> Self;
}

impl Element for f64 {
    fn constant(v: f64) -> Self {
        v
    }

    fn binary(op: BinaryOp, a: Self, b: Self) -> Self {
        op.apply(a, b)
    }

    fn unary(op: UnaryOp, a: Self) -> Self {
        op.apply(a)
    }
}

/// Dependency masks: every operation propagates the union of its operand
/// bits, constants carry no dependencies.
impl Element for u64 {
    fn constant(_v: f64) -> Self {
        0
    }

    fn binary(_op: BinaryOp, a: Self, b: Self) -> Self {
        a | b
    }

    fn unary(_op: UnaryOp, a: Self) -> Self {
        a
    }
}

fn check_inline_flags(always_inline: bool, never_inline: bool) -> Result<()> {
    if always_inline && never_inline {
        bail!("'always_inline' and 'never_inline' are mutually exclusive");
    }
    Ok(())
}

impl Function {
    /// Numeric evaluation with ordered dense-by-nnz containers, one per
    /// declared input. Returns one container per output.
    pub fn call(&self, arg: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.call_ext(arg, false, false)
    }

    /// [`Function::call`] with explicit inlining hints. The hints only
    /// matter when the call is embedded in a larger graph; setting both is
    /// a usage error.
    pub fn call_ext(
        &self,
        arg: &[Vec<f64>],
        always_inline: bool,
        never_inline: bool,
    ) -> Result<Vec<Vec<f64>>> {
        check_inline_flags(always_inline, never_inline)?;
        let node = self.node()?;
        let mem = node.core().pool().checkout();
        let out = self.call_in_slot(mem, arg);
        let released = node.core().pool().release(mem);
        let out = out?;
        released?;
        Ok(out)
    }

    /// Evaluate using an explicitly checked-out memory slot. Callers on
    /// different slots may evaluate the same handle concurrently.
    pub fn call_in_slot(&self, mem: usize, arg: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        let node = self.node()?;
        let core = node.core();
        if arg.len() != core.n_in() {
            return Err(Error::Arity {
                what: "inputs",
                expected: core.n_in(),
                got: arg.len(),
            });
        }

        // Scalar arguments broadcast against any pattern; anything else
        // must match the port's nonzero count exactly.
        let mut broadcast: Vec<Option<Vec<f64>>> = vec![None; core.n_in()];
        for (i, a) in arg.iter().enumerate() {
            let port = core.in_port(i)?;
            let nnz = port.sparsity.nnz();
            if a.len() == nnz {
                continue;
            }
            if a.len() == 1 {
                broadcast[i] = Some(vec![a[0]; nnz]);
            } else {
                return Err(Error::Shape {
                    what: format!("input '{}'", port.name),
                    expected: format!("{nnz} entries"),
                    got: format!("{}", a.len()),
                });
            }
        }
        let args: Vec<Option<&[f64]>> = (0..core.n_in())
            .map(|i| Some(broadcast[i].as_deref().unwrap_or(&arg[i][..])))
            .collect();

        let mut out: Vec<Vec<f64>> = (0..core.n_out())
            .map(|j| Ok(vec![0.0; core.out_port(j)?.sparsity.nnz()]))
            .collect::<Result<_>>()?;
        let mut res: Vec<Option<&mut [f64]>> =
            out.iter_mut().map(|b| Some(b.as_mut_slice())).collect();

        let slot = core.pool().slot(mem)?;
        let mut buffers = slot.lock().unwrap();
        let WorkBuffers { iw, w, .. } = &mut *buffers;
        node.eval(&args, &mut res, iw, w)?;
        drop(res);
        Ok(out)
    }

    /// Named-mapping evaluation: absent inputs fall back to each port's
    /// default value, the result is keyed by output name.
    pub fn call_named(
        &self,
        arg: &IndexMap<String, Vec<f64>>,
    ) -> Result<IndexMap<String, Vec<f64>>> {
        self.call_named_ext(arg, false, false)
    }

    pub fn call_named_ext(
        &self,
        arg: &IndexMap<String, Vec<f64>>,
        always_inline: bool,
        never_inline: bool,
    ) -> Result<IndexMap<String, Vec<f64>>> {
        check_inline_flags(always_inline, never_inline)?;
        let node = self.node()?;
        let core = node.core();

        let mut provided: Vec<Option<&Vec<f64>>> = vec![None; core.n_in()];
        for (name, v) in arg {
            provided[core.index_in(name)?] = Some(v);
        }
        let mut broadcast: Vec<Option<Vec<f64>>> = vec![None; core.n_in()];
        for (i, p) in provided.iter().enumerate() {
            let Some(a) = p else { continue };
            let port = core.in_port(i)?;
            let nnz = port.sparsity.nnz();
            if a.len() == nnz {
                continue;
            }
            if a.len() == 1 {
                broadcast[i] = Some(vec![a[0]; nnz]);
            } else {
                return Err(Error::Shape {
                    what: format!("input '{}'", port.name),
                    expected: format!("{nnz} entries"),
                    got: format!("{}", a.len()),
                });
            }
        }
        let args: Vec<Option<&[f64]>> = (0..core.n_in())
            .map(|i| match (&broadcast[i], provided[i]) {
                (Some(b), _) => Some(b.as_slice()),
                (None, Some(a)) => Some(a.as_slice()),
                (None, None) => None,
            })
            .collect();

        let mut out: Vec<Vec<f64>> = (0..core.n_out())
            .map(|j| Ok(vec![0.0; core.out_port(j)?.sparsity.nnz()]))
            .collect::<Result<_>>()?;
        let mut res: Vec<Option<&mut [f64]>> =
            out.iter_mut().map(|b| Some(b.as_mut_slice())).collect();

        let mem = core.pool().checkout();
        let evaluated = {
            let slot = core.pool().slot(mem)?;
            let mut buffers = slot.lock().unwrap();
            let WorkBuffers { iw, w, .. } = &mut *buffers;
            node.eval(&args, &mut res, iw, w)
        };
        let released = core.pool().release(mem);
        evaluated?;
        released?;
        drop(res);

        let mut named = IndexMap::with_capacity(core.n_out());
        for (j, buf) in out.into_iter().enumerate() {
            named.insert(core.out_port(j)?.name.clone(), buf);
        }
        Ok(named)
    }

    /// Symbolic re-expansion: substitute expressions for the inputs, get
    /// expressions for the outputs, appended to `graph`.
    pub fn call_sym(&self, graph: &ExprGraph, args: &[SymVec]) -> Result<Vec<SymVec>> {
        self.call_sym_ext(graph, args, false, false)
    }

    pub fn call_sym_ext(
        &self,
        graph: &ExprGraph,
        args: &[SymVec],
        always_inline: bool,
        never_inline: bool,
    ) -> Result<Vec<SymVec>> {
        check_inline_flags(always_inline, never_inline)?;
        if never_inline {
            return Err(Error::Capability(
                "opaque sub-calls in the scalar expression algebra",
            ));
        }
        let node = self.node()?;
        let core = node.core();
        if args.len() != core.n_in() {
            return Err(Error::Arity {
                what: "inputs",
                expected: core.n_in(),
                got: args.len(),
            });
        }
        let mut resolved = Vec::with_capacity(args.len());
        for (i, a) in args.iter().enumerate() {
            if !a.graph().same_graph(graph) {
                bail!("symbolic arguments must live in the target graph");
            }
            let port = core.in_port(i)?;
            if *a.sparsity() == port.sparsity {
                resolved.push(a.clone());
            } else if a.sparsity().is_scalar() {
                let elems = vec![a.elems()[0].clone(); port.sparsity.nnz()];
                resolved.push(SymVec::from_elems(graph, port.sparsity.clone(), elems)?);
            } else {
                return Err(Error::Shape {
                    what: format!("input '{}'", port.name),
                    expected: format!("{:?}", port.sparsity.size()),
                    got: format!("{:?}", a.sparsity().size()),
                });
            }
        }
        node.eval_sym(graph, &resolved)
    }

    /// Forward dependency propagation: seed one word-packed mask per input
    /// element, get the propagated mask of every output element.
    pub fn sp_forward(&self, seeds: &[Vec<u64>]) -> Result<Vec<Vec<u64>>> {
        let node = self.node()?;
        let core = node.core();
        if !node.has_spfwd() {
            return Err(Error::Capability("forward sparsity propagation"));
        }
        if seeds.len() != core.n_in() {
            return Err(Error::Arity {
                what: "input seeds",
                expected: core.n_in(),
                got: seeds.len(),
            });
        }
        for (i, s) in seeds.iter().enumerate() {
            let port = core.in_port(i)?;
            if s.len() != port.sparsity.nnz() {
                return Err(Error::Shape {
                    what: format!("seed for input '{}'", port.name),
                    expected: format!("{} entries", port.sparsity.nnz()),
                    got: format!("{}", s.len()),
                });
            }
        }
        let args: Vec<Option<&[u64]>> = seeds.iter().map(|s| Some(s.as_slice())).collect();
        let mut out: Vec<Vec<u64>> = (0..core.n_out())
            .map(|j| Ok(vec![0; core.out_port(j)?.sparsity.nnz()]))
            .collect::<Result<_>>()?;
        let mut res: Vec<Option<&mut [u64]>> =
            out.iter_mut().map(|b| Some(b.as_mut_slice())).collect();

        let mem = core.pool().checkout();
        let propagated = {
            let slot = core.pool().slot(mem)?;
            let mut buffers = slot.lock().unwrap();
            let WorkBuffers { iw, bw, .. } = &mut *buffers;
            node.sp_forward(&args, &mut res, iw, bw)
        };
        let released = core.pool().release(mem);
        propagated?;
        released?;
        drop(res);
        Ok(out)
    }

    /// Reverse dependency propagation: seed one mask per output element,
    /// get the accumulated mask of every input element.
    pub fn sp_reverse(&self, seeds: &[Vec<u64>]) -> Result<Vec<Vec<u64>>> {
        let node = self.node()?;
        let core = node.core();
        if !node.has_sprev() {
            return Err(Error::Capability("reverse sparsity propagation"));
        }
        if seeds.len() != core.n_out() {
            return Err(Error::Arity {
                what: "output seeds",
                expected: core.n_out(),
                got: seeds.len(),
            });
        }
        for (j, s) in seeds.iter().enumerate() {
            let port = core.out_port(j)?;
            if s.len() != port.sparsity.nnz() {
                return Err(Error::Shape {
                    what: format!("seed for output '{}'", port.name),
                    expected: format!("{} entries", port.sparsity.nnz()),
                    got: format!("{}", s.len()),
                });
            }
        }
        let mut consumed: Vec<Vec<u64>> = seeds.to_vec();
        let mut acc: Vec<Vec<u64>> = (0..core.n_in())
            .map(|i| Ok(vec![0; core.in_port(i)?.sparsity.nnz()]))
            .collect::<Result<_>>()?;
        let mut args: Vec<Option<&mut [u64]>> =
            acc.iter_mut().map(|b| Some(b.as_mut_slice())).collect();
        let mut res: Vec<Option<&mut [u64]>> = consumed
            .iter_mut()
            .map(|b| Some(b.as_mut_slice()))
            .collect();

        let mem = core.pool().checkout();
        let propagated = {
            let slot = core.pool().slot(mem)?;
            let mut buffers = slot.lock().unwrap();
            let WorkBuffers { iw, bw, .. } = &mut *buffers;
            node.sp_reverse(&mut args, &mut res, iw, bw)
        };
        let released = core.pool().release(mem);
        propagated?;
        released?;
        drop(args);
        drop(res);
        Ok(acc)
    }
}
