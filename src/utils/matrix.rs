//! Rational matrices for the dataflow solve.
//!
//! The rate-balance equations and the initialization solve need exact
//! arithmetic: steady counts are the primitive integer vector spanning the
//! nullspace of the flow matrix, and rounding would silently unbalance the
//! graph. Everything here works over `Rational64`.

use num_integer::Integer;
use num_rational::Rational64;
use num_traits::Zero;
use std::fmt;

/// A matrix with rational entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RationalMatrix {
    data: Vec<Vec<Rational64>>,
    rows: usize,
    cols: usize,
}

impl RationalMatrix {
    /// Create a new matrix with the given dimensions, initialized to zero.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![vec![Rational64::zero(); cols]; rows],
            rows,
            cols,
        }
    }

    /// Create a matrix from integer row vectors.
    pub fn from_rows(data: Vec<Vec<i64>>) -> Self {
        let rows = data.len();
        let cols = if rows > 0 { data[0].len() } else { 0 };
        let data = data
            .into_iter()
            .map(|row| row.into_iter().map(Rational64::from_integer).collect())
            .collect();
        Self { data, rows, cols }
    }

    /// Get the number of rows.
    pub fn nrows(&self) -> usize {
        self.rows
    }

    /// Get the number of columns.
    pub fn ncols(&self) -> usize {
        self.cols
    }

    /// Get an element.
    pub fn get(&self, row: usize, col: usize) -> Rational64 {
        self.data[row][col]
    }

    /// Set an element.
    pub fn set(&mut self, row: usize, col: usize, value: Rational64) {
        self.data[row][col] = value;
    }

    /// Set an element from an integer.
    pub fn set_int(&mut self, row: usize, col: usize, value: i64) {
        self.data[row][col] = Rational64::from_integer(value);
    }

    /// Reduce the matrix in place to reduced row-echelon form.
    /// Returns the pivot column of each pivot row.
    pub fn row_reduce(&mut self) -> Vec<usize> {
        let mut pivots = Vec::new();
        let mut row = 0;

        for col in 0..self.cols {
            if row >= self.rows {
                break;
            }

            // Find a pivot in this column
            let mut pivot_row = None;
            for r in row..self.rows {
                if !self.data[r][col].is_zero() {
                    pivot_row = Some(r);
                    break;
                }
            }
            let Some(p) = pivot_row else { continue };

            self.data.swap(row, p);

            // Scale the pivot row
            let pivot = self.data[row][col];
            for c in col..self.cols {
                self.data[row][c] /= pivot;
            }

            // Eliminate the column everywhere else
            for r in 0..self.rows {
                if r != row && !self.data[r][col].is_zero() {
                    let factor = self.data[r][col];
                    let pivot_row_copy: Vec<_> = self.data[row].clone();
                    for c in 0..self.cols {
                        let delta = factor * pivot_row_copy[c];
                        self.data[r][c] -= delta;
                    }
                }
            }

            pivots.push(col);
            row += 1;
        }

        pivots
    }

    /// Compute a basis of the (right) nullspace.
    ///
    /// Each returned vector `v` satisfies `A v = 0`. Free columns get one
    /// basis vector each, with the free variable set to 1.
    pub fn nullspace(&self) -> Vec<Vec<Rational64>> {
        let mut reduced = self.clone();
        let pivots = reduced.row_reduce();

        let is_pivot: Vec<bool> = {
            let mut v = vec![false; self.cols];
            for &p in &pivots {
                v[p] = true;
            }
            v
        };

        let mut basis = Vec::new();
        for free in 0..self.cols {
            if is_pivot[free] {
                continue;
            }
            let mut vec = vec![Rational64::zero(); self.cols];
            vec[free] = Rational64::from_integer(1);
            for (row, &p) in pivots.iter().enumerate() {
                vec[p] = -reduced.data[row][free];
            }
            basis.push(vec);
        }
        basis
    }
}

impl fmt::Display for RationalMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[")?;
        for row in &self.data {
            write!(f, "  [")?;
            for (j, val) in row.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                if val.is_integer() {
                    write!(f, "{}", val.numer())?;
                } else {
                    write!(f, "{}/{}", val.numer(), val.denom())?;
                }
            }
            writeln!(f, "]")?;
        }
        write!(f, "]")
    }
}

/// Scale a rational vector to the smallest integer vector with the same
/// direction and a positive first non-zero entry.
pub fn primitive_integer_vector(v: &[Rational64]) -> Vec<i64> {
    let denom_lcm = v
        .iter()
        .fold(1i64, |acc, r| acc.lcm(r.denom()));
    let mut ints: Vec<i64> = v.iter().map(|r| r.numer() * (denom_lcm / r.denom())).collect();

    let g = ints.iter().fold(0i64, |acc, &x| acc.gcd(&x));
    if g > 1 {
        for x in &mut ints {
            *x /= g;
        }
    }

    if let Some(first) = ints.iter().find(|&&x| x != 0) {
        if *first < 0 {
            for x in &mut ints {
                *x = -*x;
            }
        }
    }
    ints
}

/// Compute the GCD of a vector of integers.
pub fn vector_gcd(v: &[i64]) -> i64 {
    v.iter().fold(0, |acc, &x| acc.gcd(&x))
}

/// Compute the LCM of a vector of integers.
pub fn vector_lcm(v: &[i64]) -> i64 {
    v.iter().fold(1, |acc, &x| acc.lcm(&x))
}
