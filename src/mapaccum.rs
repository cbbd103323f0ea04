use crate::expr::{ExprGraph, SymVec};
use crate::node::Opts;
use crate::{bail, Error, Function, Result};

impl Function {
    /// Accumulating map: evaluate this function `n` times, feeding the
    /// first `n_accum` outputs of each call back into the same-positioned
    /// inputs of the next. Remaining inputs are batched per iteration,
    /// remaining outputs concatenated. `n == 1` returns the handle
    /// unchanged.
    pub fn mapaccum(&self, name: &str, n: usize, n_accum: usize, opts: &Opts) -> Result<Function> {
        let node = self.node()?;
        let core = node.core();
        let n_in = core.n_in();
        let n_out = core.n_out();
        if n == 0 {
            bail!("mapaccum: n must be positive");
        }
        if n_accum > n_in.min(n_out) {
            bail!("mapaccum: too many accumulators");
        }
        if n == 1 {
            return Ok(self.clone());
        }
        log::debug!(
            "building mapaccum '{}' of '{}': {} iterations, {} accumulators",
            name,
            core.name(),
            n,
            n_accum
        );

        let graph = ExprGraph::new();
        let mut arg: Vec<SymVec> = (0..n_in)
            .map(|i| {
                let p = core.in_port(i)?;
                Ok(SymVec::sym(&graph, &p.name, p.sparsity.clone()))
            })
            .collect::<Result<_>>()?;
        let mut varg: Vec<Vec<SymVec>> = vec![Vec::new(); n_in];
        let mut vres: Vec<Vec<SymVec>> = vec![Vec::new(); n_out];
        for i in 0..n_accum {
            varg[i].push(arg[i].clone());
        }

        for iter in 0..n {
            // Fresh symbols for the batched inputs of this iteration
            for i in n_accum..n_in {
                let p = core.in_port(i)?;
                arg[i] = SymVec::sym(&graph, &format!("{}_{}", p.name, iter), p.sparsity.clone());
                varg[i].push(arg[i].clone());
            }
            let res = self.call_sym(&graph, &arg)?;
            for j in 0..n_out {
                vres[j].push(res[j].clone());
            }
            if iter == n - 1 {
                break;
            }
            // Thread the accumulators into the next iteration
            for i in 0..n_accum {
                let mut next = res[i].clone();
                let ncol_out = core.out_port(i)?.sparsity.ncol();
                let ncol_in = core.in_port(i)?.sparsity.ncol();
                if ncol_out > ncol_in {
                    // Only the trailing slice is carried, so stacked
                    // accumulator state keeps working
                    next = next
                        .horzsplit(&[ncol_out - ncol_in, ncol_in])?
                        .pop()
                        .ok_or(Error::Msg("empty accumulator split".to_string()))?;
                }
                arg[i] = next;
            }
        }

        let arg_full: Vec<SymVec> = varg
            .iter()
            .map(|cols| SymVec::horzcat(cols))
            .collect::<Result<_>>()?;
        let res_full: Vec<SymVec> = vres
            .iter()
            .map(|cols| SymVec::horzcat(cols))
            .collect::<Result<_>>()?;
        let mut opts2 = opts.clone();
        if !opts2.contains_key("input_scheme") {
            opts2.insert(
                "input_scheme".to_string(),
                crate::node::OptVal::StrList(core.names_in()),
            );
        }
        if !opts2.contains_key("output_scheme") {
            opts2.insert(
                "output_scheme".to_string(),
                crate::node::OptVal::StrList(core.names_out()),
            );
        }
        Function::new(name, &arg_full, &res_full, &opts2)
    }

    /// [`Function::mapaccum`] with accumulator positions chosen freely.
    /// Ports are reordered into the contiguous-prefix form, accumulated,
    /// and the original order restored on the result.
    pub fn mapaccum_sel(
        &self,
        name: &str,
        n: usize,
        accum_in: &[usize],
        accum_out: &[usize],
        opts: &Opts,
    ) -> Result<Function> {
        let node = self.node()?;
        let core = node.core();
        let n_in = core.n_in();
        let n_out = core.n_out();
        check_accum_indices("accumulator input", accum_in, n_in)?;
        check_accum_indices("accumulator output", accum_out, n_out)?;
        if accum_in.len() != accum_out.len() {
            return Err(Error::Arity {
                what: "accumulator outputs",
                expected: accum_in.len(),
                got: accum_out.len(),
            });
        }
        let n_accum = accum_in.len();

        // Already in prefix form?
        let is_prefix = |v: &[usize]| v.iter().enumerate().all(|(k, &i)| k == i);
        if is_prefix(accum_in) && is_prefix(accum_out) {
            return self.mapaccum(name, n, n_accum, opts);
        }

        let mut order_in = accum_in.to_vec();
        order_in.extend(complement(accum_in, n_in));
        let mut order_out = accum_out.to_vec();
        order_out.extend(complement(accum_out, n_out));
        let ret = self.slice(&format!("slice_{name}"), &order_in, &order_out)?;
        let ret = ret.mapaccum(&format!("mapacc_{name}"), n, n_accum, opts)?;
        ret.slice(
            name,
            &lookupvector(&order_in, n_in),
            &lookupvector(&order_out, n_out),
        )
    }

    /// [`Function::mapaccum_sel`] with the accumulator ports given by name.
    pub fn mapaccum_named(
        &self,
        name: &str,
        n: usize,
        accum_in: &[&str],
        accum_out: &[&str],
        opts: &Opts,
    ) -> Result<Function> {
        let ai: Vec<usize> = accum_in
            .iter()
            .map(|s| {
                self.index_in(s)
                    .map_err(|_| Error::UnknownSpec(s.to_string()))
            })
            .collect::<Result<_>>()?;
        let ao: Vec<usize> = accum_out
            .iter()
            .map(|s| {
                self.index_out(s)
                    .map_err(|_| Error::UnknownSpec(s.to_string()))
            })
            .collect::<Result<_>>()?;
        self.mapaccum_sel(name, n, &ai, &ao, opts)
    }
}

fn check_accum_indices(what: &'static str, indices: &[usize], limit: usize) -> Result<()> {
    for (k, &i) in indices.iter().enumerate() {
        if i >= limit || indices[..k].contains(&i) {
            return Err(Error::Arity {
                what,
                expected: limit,
                got: i,
            });
        }
    }
    Ok(())
}

/// Indices in `0..n` not present in `v`, ascending.
fn complement(v: &[usize], n: usize) -> Vec<usize> {
    (0..n).filter(|i| !v.contains(i)).collect()
}

/// Inverse permutation: `lut[order[k]] == k`.
fn lookupvector(order: &[usize], n: usize) -> Vec<usize> {
    let mut lut = vec![0; n];
    for (k, &o) in order.iter().enumerate() {
        lut[o] = k;
    }
    lut
}
