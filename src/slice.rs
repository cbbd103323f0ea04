use std::sync::Arc;

use crate::expr::{ExprGraph, SymVec};
use crate::node::{FunctionNode, NodeCore, NodeKind, Port};
use crate::{bail, Error, Function, Result};

/// Port view node: exposes a permuted or subset view of another function's
/// ports without re-deriving any computation. Inputs left out of the view
/// fall back to their default values; outputs left out are not computed.
pub(crate) struct SliceNode {
    core: NodeCore,
    inner: Function,
    order_in: Vec<usize>,
    order_out: Vec<usize>,
}

impl Function {
    /// A view of this function with inputs `order_in` and outputs
    /// `order_out`, in that order.
    pub fn slice(&self, name: &str, order_in: &[usize], order_out: &[usize]) -> Result<Function> {
        let node = self.node()?;
        let icore = node.core();
        check_order("sliced input", order_in, icore.n_in())?;
        check_order("sliced output", order_out, icore.n_out())?;

        let inputs: Vec<Port> = order_in
            .iter()
            .map(|&i| Ok(icore.in_port(i)?.clone()))
            .collect::<Result<_>>()?;
        let outputs: Vec<Port> = order_out
            .iter()
            .map(|&j| Ok(icore.out_port(j)?.clone()))
            .collect::<Result<_>>()?;
        let core = NodeCore::new(name, inputs, outputs, icore.work())?;
        Ok(Function::from_node(Arc::new(SliceNode {
            core,
            inner: self.clone(),
            order_in: order_in.to_vec(),
            order_out: order_out.to_vec(),
        })))
    }
}

fn check_order(what: &'static str, order: &[usize], limit: usize) -> Result<()> {
    for (k, &i) in order.iter().enumerate() {
        if i >= limit {
            return Err(Error::Index {
                what,
                index: i,
                limit,
            });
        }
        if order[..k].contains(&i) {
            bail!("repeated {what} index {i}");
        }
    }
    Ok(())
}

impl FunctionNode for SliceNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Slice
    }

    fn eval(
        &self,
        args: &[Option<&[f64]>],
        res: &mut [Option<&mut [f64]>],
        iw: &mut [i64],
        w: &mut [f64],
    ) -> Result<()> {
        let inode = self.inner.node()?;
        let icore = inode.core();
        let mut inner_args: Vec<Option<&[f64]>> = vec![None; icore.n_in()];
        for (pos, &i) in self.order_in.iter().enumerate() {
            inner_args[i] = args[pos];
        }
        let mut inner_res: Vec<Option<&mut [f64]>> =
            (0..icore.n_out()).map(|_| None).collect();
        for (pos, &j) in self.order_out.iter().enumerate() {
            inner_res[j] = res[pos].take();
        }
        inode.eval(&inner_args, &mut inner_res, iw, w)
    }

    fn eval_sym(&self, graph: &ExprGraph, args: &[SymVec]) -> Result<Vec<SymVec>> {
        let inode = self.inner.node()?;
        let icore = inode.core();
        let mut inner_args: Vec<Option<SymVec>> = vec![None; icore.n_in()];
        for (pos, &i) in self.order_in.iter().enumerate() {
            inner_args[i] = Some(args[pos].clone());
        }
        let inner_args: Vec<SymVec> = (0..icore.n_in())
            .map(|i| match inner_args[i].take() {
                Some(v) => Ok(v),
                None => {
                    let p = icore.in_port(i)?;
                    Ok(SymVec::constant(
                        graph,
                        p.sparsity.clone(),
                        p.default_value,
                    ))
                }
            })
            .collect::<Result<_>>()?;
        let inner_out = self.inner.call_sym(graph, &inner_args)?;
        Ok(self
            .order_out
            .iter()
            .map(|&j| inner_out[j].clone())
            .collect())
    }

    fn has_spfwd(&self) -> bool {
        self.inner.node().map(|n| n.has_spfwd()).unwrap_or(false)
    }

    fn has_sprev(&self) -> bool {
        self.inner.node().map(|n| n.has_sprev()).unwrap_or(false)
    }

    fn sp_forward(
        &self,
        args: &[Option<&[u64]>],
        res: &mut [Option<&mut [u64]>],
        iw: &mut [i64],
        bw: &mut [u64],
    ) -> Result<()> {
        let inode = self.inner.node()?;
        let icore = inode.core();
        let mut inner_args: Vec<Option<&[u64]>> = vec![None; icore.n_in()];
        for (pos, &i) in self.order_in.iter().enumerate() {
            inner_args[i] = args[pos];
        }
        let mut inner_res: Vec<Option<&mut [u64]>> =
            (0..icore.n_out()).map(|_| None).collect();
        for (pos, &j) in self.order_out.iter().enumerate() {
            inner_res[j] = res[pos].take();
        }
        inode.sp_forward(&inner_args, &mut inner_res, iw, bw)
    }

    fn sp_reverse(
        &self,
        args: &mut [Option<&mut [u64]>],
        res: &mut [Option<&mut [u64]>],
        iw: &mut [i64],
        bw: &mut [u64],
    ) -> Result<()> {
        let inode = self.inner.node()?;
        let icore = inode.core();
        let mut inner_args: Vec<Option<&mut [u64]>> =
            (0..icore.n_in()).map(|_| None).collect();
        for (pos, &i) in self.order_in.iter().enumerate() {
            inner_args[i] = args[pos].take();
        }
        let mut inner_res: Vec<Option<&mut [u64]>> =
            (0..icore.n_out()).map(|_| None).collect();
        for (pos, &j) in self.order_out.iter().enumerate() {
            inner_res[j] = res[pos].take();
        }
        inode.sp_reverse(&mut inner_args, &mut inner_res, iw, bw)
    }
}
