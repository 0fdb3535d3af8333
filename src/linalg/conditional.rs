//! Gaussian conditionals `p(F | S)` and sequences of them.
//!
//! A conditional stores the square-root rows produced when its frontal
//! variables were eliminated:
//!
//! ```text
//!   [ R_FF  R_FS | d ]      p(F | S) ∝ exp(−½ ‖R_FF·x_F + R_FS·x_S − d‖²)
//! ```
//!
//! with `R_FF` upper triangular and a per-frontal-row noise scaling (unit
//! after whitened elimination, kept for the data model). Back-substitution
//! solves `x_F = R_FF⁻¹ (d − R_FS·x_S)`.

use nalgebra::{DMatrix, DVector};

use crate::linalg::{JacobianFactor, LinAlgError, LinAlgResult};

/// A Gaussian conditional over ordered frontal and separator index blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianConditional {
    frontals: Vec<usize>,
    frontal_dims: Vec<usize>,
    separator: Vec<usize>,
    separator_dims: Vec<usize>,
    r: DMatrix<f64>,
    s: DMatrix<f64>,
    d: DVector<f64>,
    sigmas: DVector<f64>,
}

impl GaussianConditional {
    /// Create from explicit blocks. `r` must be square over the summed
    /// frontal dimensions; `s` spans the summed separator dimensions.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frontals: Vec<usize>,
        frontal_dims: Vec<usize>,
        separator: Vec<usize>,
        separator_dims: Vec<usize>,
        r: DMatrix<f64>,
        s: DMatrix<f64>,
        d: DVector<f64>,
        sigmas: DVector<f64>,
    ) -> Self {
        let fdim: usize = frontal_dims.iter().sum();
        let sdim: usize = separator_dims.iter().sum();
        debug_assert_eq!(frontals.len(), frontal_dims.len());
        debug_assert_eq!(separator.len(), separator_dims.len());
        debug_assert_eq!(r.nrows(), fdim);
        debug_assert_eq!(r.ncols(), fdim);
        debug_assert_eq!(s.nrows(), fdim);
        debug_assert_eq!(s.ncols(), sdim);
        debug_assert_eq!(d.len(), fdim);
        debug_assert_eq!(sigmas.len(), fdim);
        GaussianConditional {
            frontals,
            frontal_dims,
            separator,
            separator_dims,
            r,
            s,
            d,
            sigmas,
        }
    }

    /// Frontal variable indices, in elimination order.
    pub fn frontals(&self) -> &[usize] {
        &self.frontals
    }

    /// Per-frontal block dimensions.
    pub fn frontal_dims(&self) -> &[usize] {
        &self.frontal_dims
    }

    /// Separator variable indices.
    pub fn separator(&self) -> &[usize] {
        &self.separator
    }

    /// Per-separator block dimensions.
    pub fn separator_dims(&self) -> &[usize] {
        &self.separator_dims
    }

    /// Summed frontal dimension.
    pub fn frontal_dim(&self) -> usize {
        self.r.nrows()
    }

    /// Upper-triangular frontal block.
    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    /// Separator block.
    pub fn s(&self) -> &DMatrix<f64> {
        &self.s
    }

    /// Right-hand side.
    pub fn d(&self) -> &DVector<f64> {
        &self.d
    }

    /// Per-frontal-row noise scaling.
    pub fn sigmas(&self) -> &DVector<f64> {
        &self.sigmas
    }

    /// All variable indices, frontals then separator.
    pub fn all_keys(&self) -> Vec<usize> {
        let mut keys = self.frontals.clone();
        keys.extend_from_slice(&self.separator);
        keys
    }

    /// Rewrite every variable label through `perm`: label k becomes perm[k].
    pub fn relabel(&mut self, perm: &[usize]) {
        for key in self.frontals.iter_mut() {
            *key = perm[*key];
        }
        for key in self.separator.iter_mut() {
            *key = perm[*key];
        }
    }

    /// Solve `x_F = R⁻¹ (d − S·x_S)` where `lookup` supplies the separator
    /// values.
    pub fn solve<F>(&self, lookup: F) -> LinAlgResult<DVector<f64>>
    where
        F: Fn(usize) -> DVector<f64>,
    {
        let mut rhs = self.d.clone();
        let mut offset = 0;
        for (key, dim) in self.separator.iter().zip(self.separator_dims.iter()) {
            let x_s = lookup(*key);
            debug_assert_eq!(x_s.len(), *dim);
            rhs -= self.s.view((0, offset), (self.r.nrows(), *dim)) * x_s;
            offset += dim;
        }
        self.r.solve_upper_triangular(&rhs).ok_or_else(|| {
            LinAlgError::FactorizationFailed(
                "singular triangular block in back-substitution".to_string(),
            )
            .log()
        })
    }

    /// Split a stacked frontal vector into one row per frontal variable.
    pub fn split_frontal_rows(&self, x: &DVector<f64>) -> Vec<DVector<f64>> {
        debug_assert_eq!(x.len(), self.frontal_dim());
        let mut rows = Vec::with_capacity(self.frontal_dims.len());
        let mut offset = 0;
        for &dim in &self.frontal_dims {
            rows.push(x.rows(offset, dim).into_owned());
            offset += dim;
        }
        rows
    }

    /// Reinterpret the conditional as the factor `‖[R S]·x − d‖²`.
    pub fn to_jacobian_factor(&self) -> JacobianFactor {
        let mut keys = Vec::with_capacity(self.frontals.len() + self.separator.len());
        let mut blocks = Vec::with_capacity(keys.capacity());
        let rows = self.frontal_dim();

        let mut offset = 0;
        for (key, dim) in self.frontals.iter().zip(self.frontal_dims.iter()) {
            keys.push(*key);
            blocks.push(self.r.view((0, offset), (rows, *dim)).into_owned());
            offset += dim;
        }
        offset = 0;
        for (key, dim) in self.separator.iter().zip(self.separator_dims.iter()) {
            keys.push(*key);
            blocks.push(self.s.view((0, offset), (rows, *dim)).into_owned());
            offset += dim;
        }

        JacobianFactor::new(keys, blocks, self.d.clone())
    }

    /// Gradient of the conditional's quadratic at the origin, spanning
    /// frontal then separator columns: `−[R S]ᵀ d`.
    pub fn gradient_at_zero(&self) -> DVector<f64> {
        let gf = -(self.r.transpose() * &self.d);
        let gs = -(self.s.transpose() * &self.d);
        let mut grad = DVector::zeros(gf.len() + gs.len());
        grad.rows_mut(0, gf.len()).copy_from(&gf);
        grad.rows_mut(gf.len(), gs.len()).copy_from(&gs);
        grad
    }

    /// The product `R·x_F + S·x_S` for values supplied by `lookup`.
    pub fn apply<F>(&self, lookup: F) -> DVector<f64>
    where
        F: Fn(usize) -> DVector<f64>,
    {
        let rows = self.frontal_dim();
        let mut product = DVector::zeros(rows);
        let mut offset = 0;
        for (key, dim) in self.frontals.iter().zip(self.frontal_dims.iter()) {
            product += self.r.view((0, offset), (rows, *dim)) * lookup(*key);
            offset += dim;
        }
        offset = 0;
        for (key, dim) in self.separator.iter().zip(self.separator_dims.iter()) {
            product += self.s.view((0, offset), (rows, *dim)) * lookup(*key);
            offset += dim;
        }
        product
    }

    /// Linear error `½‖R·x_F + S·x_S − d‖²` for values supplied by `lookup`.
    pub fn error<F>(&self, lookup: F) -> f64
    where
        F: Fn(usize) -> DVector<f64>,
    {
        let residual = self.apply(lookup) - &self.d;
        0.5 * residual.norm_squared()
    }

    /// Merge a conditional eliminated just before this one into a combined
    /// conditional, prepending its frontal block.
    ///
    /// `front`'s parent set must equal this conditional's frontals followed by
    /// its separator (the clique-merge condition); its columns then align with
    /// ours and the stacked system stays block upper triangular.
    pub fn merge_prepend(&self, front: &GaussianConditional) -> GaussianConditional {
        let front_fdim = front.frontal_dim();
        let self_fdim = self.frontal_dim();
        let sdim: usize = self.separator_dims.iter().sum();
        debug_assert_eq!(front.s.ncols(), self_fdim + sdim);

        let mut frontals = front.frontals.clone();
        frontals.extend_from_slice(&self.frontals);
        let mut frontal_dims = front.frontal_dims.clone();
        frontal_dims.extend_from_slice(&self.frontal_dims);

        let new_fdim = front_fdim + self_fdim;
        let mut r = DMatrix::zeros(new_fdim, new_fdim);
        r.view_mut((0, 0), (front_fdim, front_fdim)).copy_from(&front.r);
        r.view_mut((0, front_fdim), (front_fdim, self_fdim))
            .copy_from(&front.s.view((0, 0), (front_fdim, self_fdim)));
        r.view_mut((front_fdim, front_fdim), (self_fdim, self_fdim))
            .copy_from(&self.r);

        let mut s = DMatrix::zeros(new_fdim, sdim);
        s.view_mut((0, 0), (front_fdim, sdim))
            .copy_from(&front.s.view((0, self_fdim), (front_fdim, sdim)));
        s.view_mut((front_fdim, 0), (self_fdim, sdim)).copy_from(&self.s);

        let mut d = DVector::zeros(new_fdim);
        d.rows_mut(0, front_fdim).copy_from(&front.d);
        d.rows_mut(front_fdim, self_fdim).copy_from(&self.d);

        let mut sigmas = DVector::zeros(new_fdim);
        sigmas.rows_mut(0, front_fdim).copy_from(&front.sigmas);
        sigmas.rows_mut(front_fdim, self_fdim).copy_from(&self.sigmas);

        GaussianConditional::new(
            frontals,
            frontal_dims,
            self.separator.clone(),
            self.separator_dims.clone(),
            r,
            s,
            d,
            sigmas,
        )
    }
}

/// The result of sequential elimination: one conditional per eliminated
/// variable, in elimination order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaussianBayesNet {
    conditionals: Vec<GaussianConditional>,
}

impl GaussianBayesNet {
    /// Create an empty net.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a conditional (in elimination order).
    pub fn push(&mut self, conditional: GaussianConditional) {
        self.conditionals.push(conditional);
    }

    /// Conditionals in elimination order.
    pub fn conditionals(&self) -> &[GaussianConditional] {
        &self.conditionals
    }

    /// Consume the net, yielding the conditionals in elimination order.
    pub fn into_conditionals(self) -> Vec<GaussianConditional> {
        self.conditionals
    }

    /// Number of conditionals.
    pub fn len(&self) -> usize {
        self.conditionals.len()
    }

    /// Whether the net is empty.
    pub fn is_empty(&self) -> bool {
        self.conditionals.is_empty()
    }

    /// Back-substitute from the last conditional down, returning one tangent
    /// row per eliminated variable keyed by index.
    pub fn optimize(&self) -> LinAlgResult<std::collections::HashMap<usize, DVector<f64>>> {
        let mut solution: std::collections::HashMap<usize, DVector<f64>> =
            std::collections::HashMap::new();
        for conditional in self.conditionals.iter().rev() {
            let x_f = conditional.solve(|key| {
                solution
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| panic!("separator {} solved out of order", key))
            })?;
            for (key, row) in conditional
                .frontals()
                .iter()
                .zip(conditional.split_frontal_rows(&x_f))
            {
                solution.insert(*key, row);
            }
        }
        Ok(solution)
    }
}
