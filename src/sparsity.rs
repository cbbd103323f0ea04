use crate::{Error, Result};

/// Structural sparsity pattern of a matrix-valued quantity: dimensions plus
/// the set of structurally nonzero positions, kept sorted column-major.
///
/// Values attached to a pattern (numeric buffers, symbolic elements,
/// dependency masks) always carry exactly one entry per nonzero, in the
/// pattern's column-major order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Sparsity {
    nrow: usize,
    ncol: usize,
    /// (row, col) pairs, sorted by (col, row).
    nz: Vec<(usize, usize)>,
}

impl Sparsity {
    /// Pattern with an explicit nonzero set. Out-of-range positions are an
    /// error; duplicates are collapsed.
    pub fn new(nrow: usize, ncol: usize, mut nz: Vec<(usize, usize)>) -> Result<Self> {
        for &(r, c) in &nz {
            if r >= nrow || c >= ncol {
                return Err(Error::Shape {
                    what: format!("nonzero position ({r}, {c})"),
                    expected: format!("within {nrow}x{ncol}"),
                    got: format!("({r}, {c})"),
                });
            }
        }
        nz.sort_by_key(|&(r, c)| (c, r));
        nz.dedup();
        Ok(Self { nrow, ncol, nz })
    }

    /// Fully dense pattern.
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        let mut nz = Vec::with_capacity(nrow * ncol);
        for c in 0..ncol {
            for r in 0..nrow {
                nz.push((r, c));
            }
        }
        Self { nrow, ncol, nz }
    }

    /// Dense 1x1 pattern.
    pub fn scalar() -> Self {
        Self::dense(1, 1)
    }

    /// Dense column vector.
    pub fn vector(n: usize) -> Self {
        Self::dense(n, 1)
    }

    pub fn nrow(&self) -> usize {
        self.nrow
    }

    pub fn ncol(&self) -> usize {
        self.ncol
    }

    pub fn size(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    /// Number of structural nonzeros.
    pub fn nnz(&self) -> usize {
        self.nz.len()
    }

    /// Dense element count.
    pub fn numel(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_dense(&self) -> bool {
        self.nz.len() == self.numel()
    }

    pub fn is_scalar(&self) -> bool {
        self.nrow == 1 && self.ncol == 1 && self.is_dense()
    }

    /// Nonzero positions in column-major order.
    pub fn nz(&self) -> &[(usize, usize)] {
        &self.nz
    }

    /// Concatenate patterns horizontally. All parts must agree on the row
    /// count. The nonzero order of the result is the concatenation of the
    /// parts' nonzero orders.
    pub fn horzcat(parts: &[Sparsity]) -> Result<Sparsity> {
        let Some(first) = parts.first() else {
            return Ok(Sparsity::dense(0, 0));
        };
        let nrow = first.nrow;
        let mut ncol = 0;
        let mut nz = Vec::new();
        for p in parts {
            if p.nrow != nrow {
                return Err(Error::Shape {
                    what: "horzcat".to_string(),
                    expected: format!("{nrow} rows"),
                    got: format!("{} rows", p.nrow),
                });
            }
            nz.extend(p.nz.iter().map(|&(r, c)| (r, c + ncol)));
            ncol += p.ncol;
        }
        Ok(Sparsity { nrow, ncol, nz })
    }

    /// Split into consecutive column blocks of the given widths, which must
    /// sum to the column count. Inverse of [`Sparsity::horzcat`].
    pub fn horzsplit(&self, widths: &[usize]) -> Result<Vec<Sparsity>> {
        if widths.iter().sum::<usize>() != self.ncol {
            return Err(Error::Shape {
                what: "horzsplit".to_string(),
                expected: format!("widths summing to {}", self.ncol),
                got: format!("{:?}", widths),
            });
        }
        let mut parts = Vec::with_capacity(widths.len());
        let mut col0 = 0;
        for &width in widths {
            let nz = self
                .nz
                .iter()
                .filter(|&&(_, c)| c >= col0 && c < col0 + width)
                .map(|&(r, c)| (r, c - col0))
                .collect();
            parts.push(Sparsity {
                nrow: self.nrow,
                ncol: width,
                nz,
            });
            col0 += width;
        }
        Ok(parts)
    }

    /// `n` copies of this pattern side by side.
    pub fn repeat_horz(&self, n: usize) -> Sparsity {
        let mut nz = Vec::with_capacity(self.nz.len() * n);
        for k in 0..n {
            nz.extend(self.nz.iter().map(|&(r, c)| (r, c + k * self.ncol)));
        }
        Sparsity {
            nrow: self.nrow,
            ncol: self.ncol * n,
            nz,
        }
    }
}
