use std::sync::Arc;

use crate::node::{FunctionNode, NodeCore, NodeKind, Port, WorkSizes};
use crate::{bail, Function, Result, Sparsity};

/// 1-D piecewise-linear interpolant node: scalar input `x`, scalar output
/// `f`. Queries outside the grid extrapolate linearly from the boundary
/// segments.
pub(crate) struct SplineNode {
    core: NodeCore,
    grid: Vec<f64>,
    values: Vec<f64>,
}

impl Function {
    /// Build a piecewise-linear interpolant over a strictly increasing
    /// grid.
    pub fn interpolant(name: &str, grid: &[f64], values: &[f64]) -> Result<Function> {
        if grid.len() < 2 {
            bail!("interpolant needs at least two grid points");
        }
        if grid.len() != values.len() {
            bail!(
                "interpolant grid and values disagree: {} vs {}",
                grid.len(),
                values.len()
            );
        }
        if grid.windows(2).any(|p| p[1] <= p[0]) {
            bail!("interpolant grid must be strictly increasing");
        }
        let inputs = vec![Port::new("x", Sparsity::scalar())];
        let outputs = vec![Port::new("f", Sparsity::scalar())];
        let work = WorkSizes {
            sz_arg: 1,
            sz_res: 1,
            sz_iw: 0,
            sz_w: 0,
        };
        let core = NodeCore::new(name, inputs, outputs, work)?;
        Ok(Function::from_node(Arc::new(SplineNode {
            core,
            grid: grid.to_vec(),
            values: values.to_vec(),
        })))
    }
}

/// Index of the segment containing `x`, clamped to the boundary segments.
fn locate(grid: &[f64], x: f64) -> usize {
    if x.is_nan() || x <= grid[0] {
        0
    } else if x >= grid[grid.len() - 1] {
        grid.len() - 2
    } else {
        grid.partition_point(|&g| g <= x) - 1
    }
}

fn interp_linear(grid: &[f64], values: &[f64], x: f64) -> f64 {
    let s = locate(grid, x);
    let t = (x - grid[s]) / (grid[s + 1] - grid[s]);
    values[s] + t * (values[s + 1] - values[s])
}

fn segment_slope(grid: &[f64], values: &[f64], x: f64) -> f64 {
    let s = locate(grid, x);
    (values[s + 1] - values[s]) / (grid[s + 1] - grid[s])
}

impl FunctionNode for SplineNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Spline
    }

    fn eval(
        &self,
        args: &[Option<&[f64]>],
        res: &mut [Option<&mut [f64]>],
        _iw: &mut [i64],
        _w: &mut [f64],
    ) -> Result<()> {
        let x = match args[0] {
            Some(buf) => buf[0],
            None => self.core.in_port(0)?.default_value,
        };
        if let Some(buf) = res[0].as_deref_mut() {
            buf[0] = interp_linear(&self.grid, &self.values, x);
        }
        Ok(())
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
        _bw: &mut [u64],
    ) -> Result<()> {
        let bits = args[0].map(|b| b[0]).unwrap_or(0);
        if let Some(buf) = res[0].as_deref_mut() {
            buf[0] = bits;
        }
        Ok(())
    }

    fn sp_reverse(
        &self,
        args: &mut [Option<&mut [u64]>],
        res: &mut [Option<&mut [u64]>],
        _iw: &mut [i64],
        _bw: &mut [u64],
    ) -> Result<()> {
        if let Some(seed) = res[0].as_deref_mut() {
            if let Some(acc) = args[0].as_deref_mut() {
                acc[0] |= seed[0];
            }
            seed[0] = 0;
        }
        Ok(())
    }

    fn forward(&self, _f: &Function, k: usize) -> Result<Function> {
        SplineTangentNode::create(self, k, TangentMode::Forward)
    }

    fn reverse(&self, _f: &Function, k: usize) -> Result<Function> {
        SplineTangentNode::create(self, k, TangentMode::Reverse)
    }
}

#[derive(Clone, Copy)]
enum TangentMode {
    Forward,
    Reverse,
}

/// Derivative node of the linear interpolant: the tangent (or adjoint) is
/// the slope of the segment under the query point times the seed. Forward
/// and reverse mode share the computation and differ only in port naming.
pub(crate) struct SplineTangentNode {
    core: NodeCore,
    grid: Vec<f64>,
    values: Vec<f64>,
    k: usize,
}

impl SplineTangentNode {
    fn create(base: &SplineNode, k: usize, mode: TangentMode) -> Result<Function> {
        let seed_sp = Sparsity::scalar().repeat_horz(k);
        let (prefix, seed_name, sens_name) = match mode {
            TangentMode::Forward => ("fwd", "fwd_x", "fwd_f"),
            TangentMode::Reverse => ("adj", "adj_f", "adj_x"),
        };
        let inputs = vec![
            Port::new("x", Sparsity::scalar()),
            Port::new(seed_name, seed_sp.clone()),
        ];
        let outputs = vec![
            Port::new("f", Sparsity::scalar()),
            Port::new(sens_name, seed_sp),
        ];
        let work = WorkSizes {
            sz_arg: 2,
            sz_res: 2,
            sz_iw: 0,
            sz_w: 0,
        };
        let core = NodeCore::new(
            &format!("{}{}_{}", prefix, k, base.core.name()),
            inputs,
            outputs,
            work,
        )?;
        Ok(Function::from_node(Arc::new(SplineTangentNode {
            core,
            grid: base.grid.clone(),
            values: base.values.clone(),
            k,
        })))
    }
}

impl FunctionNode for SplineTangentNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Spline
    }

    fn eval(
        &self,
        args: &[Option<&[f64]>],
        res: &mut [Option<&mut [f64]>],
        _iw: &mut [i64],
        _w: &mut [f64],
    ) -> Result<()> {
        let x = match args[0] {
            Some(buf) => buf[0],
            None => self.core.in_port(0)?.default_value,
        };
        if let Some(buf) = res[0].as_deref_mut() {
            buf[0] = interp_linear(&self.grid, &self.values, x);
        }
        if let Some(buf) = res[1].as_deref_mut() {
            let slope = segment_slope(&self.grid, &self.values, x);
            for d in 0..self.k {
                let seed = args[1].map(|b| b[d]).unwrap_or(0.0);
                buf[d] = slope * seed;
            }
        }
        Ok(())
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
        _bw: &mut [u64],
    ) -> Result<()> {
        let x_bits = args[0].map(|b| b[0]).unwrap_or(0);
        if let Some(buf) = res[0].as_deref_mut() {
            buf[0] = x_bits;
        }
        if let Some(buf) = res[1].as_deref_mut() {
            for d in 0..self.k {
                let seed_bits = args[1].map(|b| b[d]).unwrap_or(0);
                buf[d] = x_bits | seed_bits;
            }
        }
        Ok(())
    }

    fn sp_reverse(
        &self,
        args: &mut [Option<&mut [u64]>],
        res: &mut [Option<&mut [u64]>],
        _iw: &mut [i64],
        _bw: &mut [u64],
    ) -> Result<()> {
        let mut to_x = 0;
        if let Some(seed) = res[0].as_deref_mut() {
            to_x |= seed[0];
            seed[0] = 0;
        }
        if let Some(seed) = res[1].as_deref_mut() {
            for d in 0..self.k {
                to_x |= seed[d];
                if let Some(acc) = args[1].as_deref_mut() {
                    acc[d] |= seed[d];
                }
                seed[d] = 0;
            }
        }
        if let Some(acc) = args[0].as_deref_mut() {
            acc[0] |= to_x;
        }
        Ok(())
    }
}
