//! Integer affine maps `y = Mx + c`.
//!
//! Access relations, frames, and schedule maps are all affine maps with
//! integer coefficients and integer constant offsets. Division and modulo
//! never appear here; they are materialized as runtime operations on
//! already-computed indices.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An affine map from `in_dim` input coordinates to `out_dim` output
/// coordinates: `y[r] = sum_j coef[r][j] * x[j] + cst[r]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffineMatrix {
    pub in_dim: usize,
    pub out_dim: usize,
    coef: Vec<Vec<i64>>,
    cst: Vec<i64>,
}

impl AffineMatrix {
    /// The zero map.
    pub fn zero(in_dim: usize, out_dim: usize) -> Self {
        Self {
            in_dim,
            out_dim,
            coef: vec![vec![0; in_dim]; out_dim],
            cst: vec![0; out_dim],
        }
    }

    /// The identity map.
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zero(n, n);
        for i in 0..n {
            m.coef[i][i] = 1;
        }
        m
    }

    /// A map permuting inputs into outputs: output `r` reads input
    /// `perm[r]`.
    pub fn permutation(perm: &[usize], in_dim: usize) -> Self {
        let mut m = Self::zero(in_dim, perm.len());
        for (r, &j) in perm.iter().enumerate() {
            m.coef[r][j] = 1;
        }
        m
    }

    /// A single-row map selecting input `j`.
    pub fn row_select(j: usize, in_dim: usize) -> Self {
        let mut m = Self::zero(in_dim, 1);
        m.coef[0][j] = 1;
        m
    }

    /// A single constant row.
    pub fn row_constant(value: i64, in_dim: usize) -> Self {
        let mut m = Self::zero(in_dim, 1);
        m.cst[0] = value;
        m
    }

    pub fn coef(&self, out: usize, inp: usize) -> i64 {
        self.coef[out][inp]
    }

    pub fn set_coef(&mut self, out: usize, inp: usize, value: i64) {
        self.coef[out][inp] = value;
    }

    pub fn constant(&self, out: usize) -> i64 {
        self.cst[out]
    }

    pub fn set_constant(&mut self, out: usize, value: i64) {
        self.cst[out] = value;
    }

    /// Apply the map to a point.
    pub fn apply(&self, x: &[i64]) -> Vec<i64> {
        assert_eq!(x.len(), self.in_dim);
        (0..self.out_dim)
            .map(|r| {
                self.cst[r]
                    + self.coef[r]
                        .iter()
                        .zip(x)
                        .map(|(&c, &v)| c * v)
                        .sum::<i64>()
            })
            .collect()
    }

    /// Compose with another map: `(self . inner)(x) = self(inner(x))`.
    pub fn compose(&self, inner: &AffineMatrix) -> AffineMatrix {
        assert_eq!(self.in_dim, inner.out_dim);
        let mut result = AffineMatrix::zero(inner.in_dim, self.out_dim);
        for r in 0..self.out_dim {
            let mut constant = self.cst[r];
            for k in 0..self.in_dim {
                let c = self.coef[r][k];
                if c == 0 {
                    continue;
                }
                constant += c * inner.cst[k];
                for j in 0..inner.in_dim {
                    result.coef[r][j] += c * inner.coef[k][j];
                }
            }
            result.cst[r] = constant;
        }
        result
    }

    /// Entrywise sum of two maps over the same spaces.
    pub fn add(&self, other: &AffineMatrix) -> AffineMatrix {
        assert_eq!(self.in_dim, other.in_dim);
        assert_eq!(self.out_dim, other.out_dim);
        let mut result = self.clone();
        for r in 0..self.out_dim {
            for j in 0..self.in_dim {
                result.coef[r][j] += other.coef[r][j];
            }
            result.cst[r] += other.cst[r];
        }
        result
    }

    /// Scale every coefficient and constant.
    pub fn scale(&self, factor: i64) -> AffineMatrix {
        let mut result = self.clone();
        for r in 0..self.out_dim {
            for j in 0..self.in_dim {
                result.coef[r][j] *= factor;
            }
            result.cst[r] *= factor;
        }
        result
    }

    /// Widen the input space to `in_dim >= self.in_dim`; existing inputs
    /// keep their column positions, new columns are zero.
    pub fn pad_inputs(&self, in_dim: usize) -> AffineMatrix {
        assert!(in_dim >= self.in_dim);
        if in_dim == self.in_dim {
            return self.clone();
        }
        let mut result = AffineMatrix::zero(in_dim, self.out_dim);
        for r in 0..self.out_dim {
            result.coef[r][..self.in_dim].copy_from_slice(&self.coef[r]);
            result.cst[r] = self.cst[r];
        }
        result
    }

    /// Stack another map's rows below this one's (same input space).
    pub fn stack(&self, below: &AffineMatrix) -> AffineMatrix {
        assert_eq!(self.in_dim, below.in_dim);
        let mut result = self.clone();
        result.out_dim += below.out_dim;
        result.coef.extend(below.coef.iter().cloned());
        result.cst.extend(below.cst.iter().cloned());
        result
    }

    /// Keep a subset of output rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> AffineMatrix {
        let mut result = AffineMatrix::zero(self.in_dim, rows.len());
        for (r, &src) in rows.iter().enumerate() {
            result.coef[r] = self.coef[src].clone();
            result.cst[r] = self.cst[src];
        }
        result
    }

    /// One output row as a 1-row map.
    pub fn row(&self, r: usize) -> AffineMatrix {
        self.select_rows(&[r])
    }

    /// True if this is the identity map.
    pub fn is_identity(&self) -> bool {
        if self.in_dim != self.out_dim {
            return false;
        }
        for r in 0..self.out_dim {
            if self.cst[r] != 0 {
                return false;
            }
            for j in 0..self.in_dim {
                if self.coef[r][j] != i64::from(r == j) {
                    return false;
                }
            }
        }
        true
    }
}

impl fmt::Display for AffineMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ [")?;
        for j in 0..self.in_dim {
            if j > 0 {
                write!(f, ", ")?;
            }
            write!(f, "i{}", j)?;
        }
        write!(f, "] -> [")?;
        for r in 0..self.out_dim {
            if r > 0 {
                write!(f, ", ")?;
            }
            let mut first = true;
            for j in 0..self.in_dim {
                let c = self.coef[r][j];
                if c == 0 {
                    continue;
                }
                if !first {
                    write!(f, " + ")?;
                }
                if c == 1 {
                    write!(f, "i{}", j)?;
                } else {
                    write!(f, "{}*i{}", c, j)?;
                }
                first = false;
            }
            if self.cst[r] != 0 || first {
                if !first {
                    write!(f, " + ")?;
                }
                write!(f, "{}", self.cst[r])?;
            }
        }
        write!(f, "] }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_apply() {
        let m = AffineMatrix::identity(3);
        assert_eq!(m.apply(&[1, 2, 3]), vec![1, 2, 3]);
        assert!(m.is_identity());
    }

    #[test]
    fn test_compose() {
        // outer: y = 2x + 1; inner: x = z + 3  =>  y = 2z + 7
        let mut outer = AffineMatrix::zero(1, 1);
        outer.set_coef(0, 0, 2);
        outer.set_constant(0, 1);
        let mut inner = AffineMatrix::identity(1);
        inner.set_constant(0, 3);

        let composed = outer.compose(&inner);
        assert_eq!(composed.apply(&[5]), vec![17]);
    }

    #[test]
    fn test_permutation() {
        let m = AffineMatrix::permutation(&[1, 0], 2);
        assert_eq!(m.apply(&[7, 9]), vec![9, 7]);
    }

    #[test]
    fn test_pad_inputs() {
        let m = AffineMatrix::identity(2).pad_inputs(4);
        assert_eq!(m.apply(&[5, 6, 7, 8]), vec![5, 6]);
    }

    #[test]
    fn test_stack_and_select() {
        let top = AffineMatrix::row_select(0, 2);
        let bottom = AffineMatrix::row_constant(4, 2);
        let stacked = top.stack(&bottom);
        assert_eq!(stacked.apply(&[3, 9]), vec![3, 4]);
        assert_eq!(stacked.row(1).apply(&[3, 9]), vec![4]);
    }
}
