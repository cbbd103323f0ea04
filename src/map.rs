use std::sync::Arc;

use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

use crate::expr::{ExprGraph, SymVec};
use crate::node::{scheme_opts, FunctionNode, NodeCore, NodeKind, Port, WorkSizes};
use crate::{bail, Error, Function, Result};

/// How a [`Function::map`] evaluates its `n` iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapStrategy {
    /// Replicate the computation symbolically `n` times: a larger graph,
    /// no runtime loop.
    Unrolled,
    /// One map node running the iterations in a loop.
    Serial,
    /// One map node fanning the iterations out over a rayon pool, each
    /// iteration on its own chunk of scratch memory.
    Threaded,
}

/// Batched evaluation node: runs the inner function `n` times over
/// horizontally concatenated inputs. Reduced inputs are shared across
/// iterations, reduced outputs are summed instead of concatenated.
pub(crate) struct MapNode {
    core: NodeCore,
    inner: Function,
    n: usize,
    threaded: bool,
    reduce_in: Vec<bool>,
    reduce_out: Vec<bool>,
}

impl Function {
    /// Evaluate this function `n` times over batched inputs.
    /// `n == 1` returns the handle unchanged.
    pub fn map(&self, n: usize, strategy: MapStrategy) -> Result<Function> {
        self.map_reduced(n, strategy, &[], &[])
    }

    /// [`Function::map`] with reduced axes: inputs listed in `reduce_in`
    /// are broadcast to every iteration instead of batched, outputs listed
    /// in `reduce_out` are summed over iterations instead of concatenated.
    pub fn map_reduced(
        &self,
        n: usize,
        strategy: MapStrategy,
        reduce_in: &[usize],
        reduce_out: &[usize],
    ) -> Result<Function> {
        let node = self.node()?;
        let core = node.core();
        if n == 0 {
            bail!("degenerate map operation");
        }
        check_indices("reduced input", reduce_in, core.n_in())?;
        check_indices("reduced output", reduce_out, core.n_out())?;
        if n == 1 {
            return Ok(self.clone());
        }
        log::debug!(
            "building {:?} map of '{}' over {} iterations",
            strategy,
            core.name(),
            n
        );
        match strategy {
            MapStrategy::Unrolled => self.unroll_map(n, reduce_in, reduce_out),
            MapStrategy::Serial => MapNode::create(self, n, false, reduce_in, reduce_out),
            MapStrategy::Threaded => MapNode::create(self, n, true, reduce_in, reduce_out),
        }
    }

    /// [`Function::map_reduced`] with the reduced ports given by name.
    pub fn map_reduced_named(
        &self,
        n: usize,
        strategy: MapStrategy,
        reduce_in: &[&str],
        reduce_out: &[&str],
    ) -> Result<Function> {
        let ri: Vec<usize> = reduce_in
            .iter()
            .map(|s| {
                self.index_in(s)
                    .map_err(|_| Error::UnknownSpec(s.to_string()))
            })
            .collect::<Result<_>>()?;
        let ro: Vec<usize> = reduce_out
            .iter()
            .map(|s| {
                self.index_out(s)
                    .map_err(|_| Error::UnknownSpec(s.to_string()))
            })
            .collect::<Result<_>>()?;
        self.map_reduced(n, strategy, &ri, &ro)
    }

    fn unroll_map(&self, n: usize, reduce_in: &[usize], reduce_out: &[usize]) -> Result<Function> {
        let node = self.node()?;
        let core = node.core();
        let red_in = flags(reduce_in, core.n_in());
        let red_out = flags(reduce_out, core.n_out());
        let graph = ExprGraph::new();

        // Function-level inputs: one shared symbol for reduced ports,
        // per-iteration symbols batched for the rest
        let mut arg_full = Vec::with_capacity(core.n_in());
        let mut iter_args: Vec<Vec<SymVec>> = vec![Vec::with_capacity(core.n_in()); n];
        for i in 0..core.n_in() {
            let p = core.in_port(i)?;
            if red_in[i] {
                let x = SymVec::sym(&graph, &p.name, p.sparsity.clone());
                for it in iter_args.iter_mut() {
                    it.push(x.clone());
                }
                arg_full.push(x);
            } else {
                let mut cols = Vec::with_capacity(n);
                for (k, it) in iter_args.iter_mut().enumerate() {
                    let x = SymVec::sym(&graph, &format!("{}_{}", p.name, k), p.sparsity.clone());
                    it.push(x.clone());
                    cols.push(x);
                }
                arg_full.push(SymVec::horzcat(&cols)?);
            }
        }

        let mut iter_res: Vec<Vec<SymVec>> = Vec::with_capacity(n);
        for it in &iter_args {
            iter_res.push(self.call_sym(&graph, it)?);
        }

        let mut res_full = Vec::with_capacity(core.n_out());
        for j in 0..core.n_out() {
            let cols: Vec<SymVec> = iter_res.iter().map(|r| r[j].clone()).collect();
            if red_out[j] {
                res_full.push(SymVec::sum(&cols)?);
            } else {
                res_full.push(SymVec::horzcat(&cols)?);
            }
        }

        let defaults: Vec<f64> = (0..core.n_in())
            .map(|i| Ok(core.in_port(i)?.default_value))
            .collect::<Result<_>>()?;
        let opts = scheme_opts(core.names_in(), core.names_out(), defaults);
        Function::new(
            &format!("{}_{}", core.name(), n),
            &arg_full,
            &res_full,
            &opts,
        )
    }
}

fn check_indices(what: &'static str, indices: &[usize], limit: usize) -> Result<()> {
    for (k, &i) in indices.iter().enumerate() {
        if i >= limit {
            return Err(Error::Index {
                what,
                index: i,
                limit,
            });
        }
        if indices[..k].contains(&i) {
            bail!("repeated {what} index {i}");
        }
    }
    Ok(())
}

fn flags(indices: &[usize], n: usize) -> Vec<bool> {
    let mut f = vec![false; n];
    for &i in indices {
        f[i] = true;
    }
    f
}

/// Split `buf` into `n` consecutive chunks of `size` elements each.
/// Unlike `chunks_mut`, a zero size yields `n` empty slices.
fn chunk_exact_mut<T>(buf: &mut [T], size: usize, n: usize) -> Vec<&mut [T]> {
    let mut rest = buf;
    let mut chunks = Vec::with_capacity(n);
    for _ in 0..n {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(size);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Carve one scratch slice per summed output out of the reduction region
/// of the work buffer.
fn chunk_red<'a, T: Default>(
    buf: &'a mut [T],
    reduce_out: &[bool],
    nnz: impl Fn(usize) -> Result<usize>,
) -> Result<Vec<Option<&'a mut [T]>>> {
    let mut rest = buf;
    let mut slices = Vec::with_capacity(reduce_out.len());
    for (j, &red) in reduce_out.iter().enumerate() {
        if red {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(nnz(j)?);
            slices.push(Some(head));
            rest = tail;
        } else {
            slices.push(None);
        }
    }
    Ok(slices)
}

impl MapNode {
    fn create(
        inner: &Function,
        n: usize,
        threaded: bool,
        reduce_in: &[usize],
        reduce_out: &[usize],
    ) -> Result<Function> {
        let inode = inner.node()?;
        let icore = inode.core();
        let red_in = flags(reduce_in, icore.n_in());
        let red_out = flags(reduce_out, icore.n_out());
        let has_reduce = red_in.iter().chain(&red_out).any(|&b| b);
        // Summing accumulators serializes the iteration order
        let threaded = threaded && !has_reduce;

        let mut inputs = Vec::with_capacity(icore.n_in());
        for i in 0..icore.n_in() {
            let p = icore.in_port(i)?;
            let mut port = Port::new(
                p.name.clone(),
                if red_in[i] {
                    p.sparsity.clone()
                } else {
                    p.sparsity.repeat_horz(n)
                },
            );
            port.default_value = p.default_value;
            inputs.push(port);
        }
        let mut outputs = Vec::with_capacity(icore.n_out());
        for j in 0..icore.n_out() {
            let p = icore.out_port(j)?;
            outputs.push(Port::new(
                p.name.clone(),
                if red_out[j] {
                    p.sparsity.clone()
                } else {
                    p.sparsity.repeat_horz(n)
                },
            ));
        }

        let iwork = icore.work();
        let red_tmp: usize = (0..icore.n_out())
            .map(|j| {
                Ok(if red_out[j] {
                    icore.out_port(j)?.sparsity.nnz()
                } else {
                    0
                })
            })
            .sum::<Result<usize>>()?;
        let work = WorkSizes {
            sz_arg: iwork.sz_arg,
            sz_res: iwork.sz_res,
            sz_iw: if threaded { n * iwork.sz_iw } else { iwork.sz_iw },
            sz_w: if threaded {
                n * iwork.sz_w
            } else {
                iwork.sz_w + red_tmp
            },
        };
        let core = NodeCore::new(
            &format!("map{}_{}", n, icore.name()),
            inputs,
            outputs,
            work,
        )?;
        Ok(Function::from_node(Arc::new(MapNode {
            core,
            inner: inner.clone(),
            n,
            threaded,
            reduce_in: red_in,
            reduce_out: red_out,
        })))
    }

    fn inner_nnz_in(&self, i: usize) -> Result<usize> {
        Ok(self.inner.node()?.core().in_port(i)?.sparsity.nnz())
    }

    fn inner_nnz_out(&self, j: usize) -> Result<usize> {
        Ok(self.inner.node()?.core().out_port(j)?.sparsity.nnz())
    }
}

impl FunctionNode for MapNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Map
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
        let n = self.n;
        let n_in = icore.n_in();
        let n_out = icore.n_out();
        let iwork = icore.work();

        if self.threaded {
            let mut iter_args: Vec<Vec<Option<&[f64]>>> = Vec::with_capacity(n);
            for it in 0..n {
                let mut a = Vec::with_capacity(n_in);
                for i in 0..n_in {
                    let nnz = self.inner_nnz_in(i)?;
                    a.push(args[i].map(|b| &b[it * nnz..(it + 1) * nnz]));
                }
                iter_args.push(a);
            }
            let mut iter_res: Vec<Vec<Option<&mut [f64]>>> =
                (0..n).map(|_| Vec::with_capacity(n_out)).collect();
            for j in 0..n_out {
                let nnz = self.inner_nnz_out(j)?;
                match res[j].take() {
                    Some(buf) => {
                        for (it, chunk) in chunk_exact_mut(buf, nnz, n).into_iter().enumerate() {
                            iter_res[it].push(Some(chunk));
                        }
                    }
                    None => {
                        for it_res_k in iter_res.iter_mut() {
                            it_res_k.push(None);
                        }
                    }
                }
            }
            let w_chunks = chunk_exact_mut(w, iwork.sz_w, n);
            let iw_chunks = chunk_exact_mut(iw, iwork.sz_iw, n);
            iter_res
                .into_par_iter()
                .zip(iter_args)
                .zip(w_chunks)
                .zip(iw_chunks)
                .try_for_each(|(((mut r, a), wc), iwc)| inode.eval(&a, &mut r, iwc, wc))
        } else {
            let (w_inner, w_red) = w.split_at_mut(iwork.sz_w);
            let mut red_slices = chunk_red(w_red, &self.reduce_out, |j| self.inner_nnz_out(j))?;

            // Summed outputs accumulate from zero
            for j in 0..n_out {
                if self.reduce_out[j] {
                    if let Some(buf) = res[j].as_deref_mut() {
                        buf.fill(0.0);
                    }
                }
            }

            for it in 0..n {
                let mut it_args: Vec<Option<&[f64]>> = Vec::with_capacity(n_in);
                for i in 0..n_in {
                    let nnz = self.inner_nnz_in(i)?;
                    it_args.push(args[i].map(|b| {
                        if self.reduce_in[i] {
                            b
                        } else {
                            &b[it * nnz..(it + 1) * nnz]
                        }
                    }));
                }
                let mut it_res: Vec<Option<&mut [f64]>> = Vec::with_capacity(n_out);
                for (j, (r, red_slot)) in res.iter_mut().zip(red_slices.iter_mut()).enumerate() {
                    let nnz = self.inner.node()?.core().out_port(j)?.sparsity.nnz();
                    if self.reduce_out[j] {
                        it_res.push(match (r.is_some(), red_slot.as_deref_mut()) {
                            (true, Some(tmp)) => Some(tmp),
                            _ => None,
                        });
                    } else {
                        it_res.push(r.as_deref_mut().map(|b| &mut b[it * nnz..(it + 1) * nnz]));
                    }
                }
                inode.eval(&it_args, &mut it_res, iw, w_inner)?;
                drop(it_res);
                for j in 0..n_out {
                    if self.reduce_out[j] {
                        if let (Some(buf), Some(tmp)) =
                            (res[j].as_deref_mut(), red_slices[j].as_ref())
                        {
                            for (acc, v) in buf.iter_mut().zip(tmp.iter()) {
                                *acc += *v;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
    }

    fn eval_sym(&self, graph: &ExprGraph, args: &[SymVec]) -> Result<Vec<SymVec>> {
        let inode = self.inner.node()?;
        let icore = inode.core();
        let n = self.n;
        let mut iter_args: Vec<Vec<SymVec>> = vec![Vec::with_capacity(icore.n_in()); n];
        for i in 0..icore.n_in() {
            if self.reduce_in[i] {
                for it in iter_args.iter_mut() {
                    it.push(args[i].clone());
                }
            } else {
                let ncol = icore.in_port(i)?.sparsity.ncol();
                let parts = args[i].horzsplit(&vec![ncol; n])?;
                for (it, part) in iter_args.iter_mut().zip(parts) {
                    it.push(part);
                }
            }
        }
        let mut iter_res = Vec::with_capacity(n);
        for it in &iter_args {
            iter_res.push(self.inner.call_sym(graph, it)?);
        }
        let mut out = Vec::with_capacity(icore.n_out());
        for j in 0..icore.n_out() {
            let cols: Vec<SymVec> = iter_res.iter().map(|r| r[j].clone()).collect();
            if self.reduce_out[j] {
                out.push(SymVec::sum(&cols)?);
            } else {
                out.push(SymVec::horzcat(&cols)?);
            }
        }
        Ok(out)
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
        let iwork = icore.work();
        let (bw_inner, bw_red) = bw.split_at_mut(iwork.sz_w);
        let mut red_slices = chunk_red(bw_red, &self.reduce_out, |j| self.inner_nnz_out(j))?;

        for j in 0..icore.n_out() {
            if self.reduce_out[j] {
                if let Some(buf) = res[j].as_deref_mut() {
                    buf.fill(0);
                }
            }
        }
        for it in 0..self.n {
            let mut it_args: Vec<Option<&[u64]>> = Vec::with_capacity(icore.n_in());
            for i in 0..icore.n_in() {
                let nnz = self.inner_nnz_in(i)?;
                it_args.push(args[i].map(|b| {
                    if self.reduce_in[i] {
                        b
                    } else {
                        &b[it * nnz..(it + 1) * nnz]
                    }
                }));
            }
            let mut it_res: Vec<Option<&mut [u64]>> = Vec::with_capacity(icore.n_out());
            for (j, (r, red_slot)) in res.iter_mut().zip(red_slices.iter_mut()).enumerate() {
                let nnz = self.inner.node()?.core().out_port(j)?.sparsity.nnz();
                if self.reduce_out[j] {
                    it_res.push(match (r.is_some(), red_slot.as_deref_mut()) {
                        (true, Some(tmp)) => Some(tmp),
                        _ => None,
                    });
                } else {
                    it_res.push(r.as_deref_mut().map(|b| &mut b[it * nnz..(it + 1) * nnz]));
                }
            }
            inode.sp_forward(&it_args, &mut it_res, iw, bw_inner)?;
            drop(it_res);
            for j in 0..icore.n_out() {
                if self.reduce_out[j] {
                    if let (Some(buf), Some(tmp)) = (res[j].as_deref_mut(), red_slices[j].as_ref())
                    {
                        for (acc, v) in buf.iter_mut().zip(tmp.iter()) {
                            *acc |= *v;
                        }
                    }
                }
            }
        }
        Ok(())
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
        let iwork = icore.work();
        let (bw_inner, bw_red) = bw.split_at_mut(iwork.sz_w);
        let mut red_slices = chunk_red(bw_red, &self.reduce_out, |j| self.inner_nnz_out(j))?;

        for it in 0..self.n {
            let mut it_args: Vec<Option<&mut [u64]>> = Vec::with_capacity(icore.n_in());
            for (i, a) in args.iter_mut().enumerate() {
                let nnz = self.inner_nnz_in(i)?;
                let reduced = self.reduce_in[i];
                it_args.push(a.as_deref_mut().map(|b| {
                    if reduced {
                        b
                    } else {
                        &mut b[it * nnz..(it + 1) * nnz]
                    }
                }));
            }
            let mut it_res: Vec<Option<&mut [u64]>> = Vec::with_capacity(icore.n_out());
            for (j, (r, red_slot)) in res.iter_mut().zip(red_slices.iter_mut()).enumerate() {
                let nnz = self.inner.node()?.core().out_port(j)?.sparsity.nnz();
                if self.reduce_out[j] {
                    // A summed output seeds every iteration; give the inner
                    // sweep a copy it may consume
                    it_res.push(match (r.as_ref(), red_slot.as_deref_mut()) {
                        (Some(seed), Some(tmp)) => {
                            tmp.copy_from_slice(&seed[..]);
                            Some(tmp)
                        }
                        _ => None,
                    });
                } else {
                    it_res.push(r.as_deref_mut().map(|b| &mut b[it * nnz..(it + 1) * nnz]));
                }
            }
            inode.sp_reverse(&mut it_args, &mut it_res, iw, bw_inner)?;
        }
        for j in 0..icore.n_out() {
            if self.reduce_out[j] {
                if let Some(seed) = res[j].as_deref_mut() {
                    seed.fill(0);
                }
            }
        }
        Ok(())
    }
}
