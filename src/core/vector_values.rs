//! Per-variable tangent vectors and their permuted views.
//!
//! [`VectorValues`] stores one tangent row per variable, indexed by physical
//! position. [`PermutedVectorValues`] pairs a container with a logical
//! permutation so that the engine can reorder variables without moving row
//! data: a reorder rewrites N indices, never N·dim floats. Appending a row
//! extends the view by identity, so a freshly added variable is visible at
//! the logical index equal to its physical one.

use nalgebra::DVector;

use crate::core::ordering::Permutation;

/// A dense collection of per-variable tangent rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorValues {
    rows: Vec<DVector<f64>>,
}

impl VectorValues {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total scalar dimension across all rows.
    pub fn total_dim(&self) -> usize {
        self.rows.iter().map(|r| r.len()).sum()
    }

    /// Append a row, returning its physical index.
    pub fn push(&mut self, row: DVector<f64>) -> usize {
        self.rows.push(row);
        self.rows.len() - 1
    }

    /// Row at a physical index.
    pub fn row(&self, index: usize) -> &DVector<f64> {
        &self.rows[index]
    }

    /// Overwrite a row at a physical index.
    pub fn set_row(&mut self, index: usize, row: DVector<f64>) {
        debug_assert_eq!(self.rows[index].len(), row.len());
        self.rows[index] = row;
    }

    /// L2 norm of the concatenated vector.
    pub fn norm(&self) -> f64 {
        self.rows
            .iter()
            .map(|r| r.norm_squared())
            .sum::<f64>()
            .sqrt()
    }

    /// Dot product with another collection of identical shape.
    pub fn dot(&self, other: &VectorValues) -> f64 {
        debug_assert_eq!(self.len(), other.len());
        self.rows
            .iter()
            .zip(other.rows.iter())
            .map(|(a, b)| a.dot(b))
            .sum()
    }

    /// A zero collection with the same row shapes as `self`.
    pub fn zeros_like(&self) -> VectorValues {
        VectorValues {
            rows: self
                .rows
                .iter()
                .map(|r| DVector::zeros(r.len()))
                .collect(),
        }
    }

    /// Elementwise `self * a + other * b` over matching shapes.
    pub fn blend(&self, a: f64, other: &VectorValues, b: f64) -> VectorValues {
        debug_assert_eq!(self.len(), other.len());
        VectorValues {
            rows: self
                .rows
                .iter()
                .zip(other.rows.iter())
                .map(|(x, y)| x * a + y * b)
                .collect(),
        }
    }

    /// Elementwise scaling.
    pub fn scale(&self, a: f64) -> VectorValues {
        VectorValues {
            rows: self.rows.iter().map(|x| x * a).collect(),
        }
    }
}

/// A logical view over a [`VectorValues`] through a [`Permutation`].
///
/// Reading logical index `i` returns the underlying row at `permutation[i]`.
/// The pairing keeps reorders cheap: [`permute_logical`](Self::permute_logical)
/// rewrites the permutation only, the row storage never moves.
#[derive(Debug, Clone, PartialEq)]
pub struct PermutedVectorValues {
    permutation: Permutation,
    values: VectorValues,
}

impl Default for PermutedVectorValues {
    fn default() -> Self {
        Self::new()
    }
}

impl PermutedVectorValues {
    /// Create an empty view.
    pub fn new() -> Self {
        PermutedVectorValues {
            permutation: Permutation::identity(0),
            values: VectorValues::new(),
        }
    }

    /// Create from an explicit permutation and container.
    pub fn from_parts(permutation: Permutation, values: VectorValues) -> Self {
        debug_assert_eq!(permutation.len(), values.len());
        PermutedVectorValues {
            permutation,
            values,
        }
    }

    /// Number of logical rows.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The logical permutation.
    pub fn permutation(&self) -> &Permutation {
        &self.permutation
    }

    /// The underlying physical container.
    pub fn container(&self) -> &VectorValues {
        &self.values
    }

    /// Row at a logical index.
    pub fn logical(&self, index: usize) -> &DVector<f64> {
        self.values.row(self.permutation[index])
    }

    /// Overwrite the row at a logical index.
    pub fn set_logical(&mut self, index: usize, row: DVector<f64>) {
        let physical = self.permutation[index];
        self.values.set_row(physical, row);
    }

    /// Append a row; the permutation is extended by identity so the new row
    /// is visible at the logical index equal to its physical one.
    pub fn push(&mut self, row: DVector<f64>) -> usize {
        let physical = self.values.push(row);
        self.permutation.push(physical);
        physical
    }

    /// Drop the most recently appended rows down to `len` entries. Only valid
    /// while the dropped tail is still identity-permuted (transaction
    /// rollback only).
    pub(crate) fn truncate(&mut self, len: usize) {
        debug_assert!(
            (len..self.permutation.len()).all(|i| self.permutation[i] == i),
            "truncating a non-identity tail"
        );
        let mut indices = self.permutation.as_slice().to_vec();
        indices.truncate(len);
        self.permutation = Permutation::from_vec(indices);
        while self.values.len() > len {
            self.values.rows.pop();
        }
    }

    /// Rewrite the logical order through `perm`, oriented new → old: reading
    /// logical `i` afterwards returns what reading logical `perm[i]` returned
    /// before. Storage is untouched.
    pub fn permute_logical(&mut self, perm: &Permutation) {
        debug_assert_eq!(perm.len(), self.permutation.len());
        let mut rewritten = Vec::with_capacity(perm.len());
        for i in 0..perm.len() {
            rewritten.push(self.permutation[perm[i]]);
        }
        self.permutation = Permutation::from_vec(rewritten);
    }

    /// Materialize the rows in logical order.
    pub fn to_logical(&self) -> VectorValues {
        let mut out = VectorValues::new();
        for i in 0..self.len() {
            out.push(self.logical(i).clone());
        }
        out
    }

    /// Overwrite all rows from a logically ordered collection.
    pub fn set_from_logical(&mut self, logical: &VectorValues) {
        debug_assert_eq!(logical.len(), self.len());
        for i in 0..self.len() {
            self.set_logical(i, logical.row(i).clone());
        }
    }
}
