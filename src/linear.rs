//! Linear systems over Z/nZ and their Gaussian-elimination solver.
//!
//! Cross-key collision graphs reduce to systems of the form
//! `s_i * k_j - r_j * d_i = z_i (mod n)` with nonces and private keys as
//! the unknowns. Variables are registered by name so callers can read the
//! solution back out without tracking column indices.

use std::collections::HashMap;

use k256::Scalar;
use thiserror::Error;

use crate::math;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SolveError {
    #[error("empty system")]
    Empty,
    #[error("underdetermined system: {equations} equations, {variables} variables")]
    Underdetermined { equations: usize, variables: usize },
    #[error("singular matrix: no pivot in column {column}")]
    Singular { column: usize },
    #[error("non-invertible pivot in column {column}")]
    NonInvertiblePivot { column: usize },
}

#[derive(Debug, Default)]
pub struct LinearSystem {
    coeffs: Vec<Vec<Scalar>>,
    constants: Vec<Scalar>,
    vars: Vec<String>,
}

impl LinearSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, name: impl Into<String>) -> usize {
        self.vars.push(name.into());
        self.vars.len() - 1
    }

    /// Missing indices are treated as zero coefficients; out-of-range
    /// indices are ignored, matching the tolerant map-based input shape.
    pub fn add_equation(&mut self, coeffs: &HashMap<usize, Scalar>, constant: Scalar) {
        let mut row = vec![Scalar::ZERO; self.vars.len()];
        for (idx, c) in coeffs {
            if *idx < row.len() {
                row[*idx] = *c;
            }
        }
        self.coeffs.push(row);
        self.constants.push(constant);
    }

    pub fn can_solve(&self) -> bool {
        self.coeffs.len() >= self.vars.len()
    }

    pub fn num_equations(&self) -> usize {
        self.coeffs.len()
    }

    pub fn num_variables(&self) -> usize {
        self.vars.len()
    }

    /// Gaussian elimination with partial pivoting. The pivot is always the
    /// first row at or below the diagonal with a non-zero entry, which keeps
    /// the elimination deterministic.
    pub fn solve(&self) -> Result<HashMap<String, Scalar>, SolveError> {
        let rows = self.coeffs.len();
        let cols = self.vars.len();
        if rows == 0 || cols == 0 {
            return Err(SolveError::Empty);
        }
        if rows < cols {
            return Err(SolveError::Underdetermined {
                equations: rows,
                variables: cols,
            });
        }

        // Augmented matrix [A | b]; rows may be wider than the variable
        // count, extra equations participate in elimination as usual.
        let mut m: Vec<Vec<Scalar>> = self
            .coeffs
            .iter()
            .zip(&self.constants)
            .map(|(row, c)| {
                let mut r = row.clone();
                r.push(*c);
                r
            })
            .collect();

        for col in 0..cols {
            let pivot_row = (col..rows)
                .find(|&r| !bool::from(m[r][col].is_zero()))
                .ok_or(SolveError::Singular { column: col })?;
            m.swap(col, pivot_row);

            let pivot_inv = math::inv(&m[col][col])
                .map_err(|_| SolveError::NonInvertiblePivot { column: col })?;
            for j in col..=cols {
                m[col][j] *= pivot_inv;
            }

            for row in (col + 1)..rows {
                if bool::from(m[row][col].is_zero()) {
                    continue;
                }
                let factor = m[row][col];
                for j in col..=cols {
                    let scaled = factor * m[col][j];
                    m[row][j] -= scaled;
                }
            }
        }

        let mut solution = vec![Scalar::ZERO; cols];
        for i in (0..cols).rev() {
            let mut value = m[i][cols];
            for j in (i + 1)..cols {
                value -= m[i][j] * solution[j];
            }
            solution[i] = value;
        }

        Ok(self
            .vars
            .iter()
            .cloned()
            .zip(solution)
            .collect())
    }
}
