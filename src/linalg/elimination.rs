//! Sequential variable elimination.
//!
//! Eliminating a variable gathers every factor that touches it, combines them
//! into one dense block system, and factors out the variable's columns:
//!
//! ```text
//!   [ A_target  A_rest | b ]  →  [ R_FF  R_FS | d_F ]   (conditional)
//!                                 [  0    M'   |  …  ]   (marginal on rest)
//! ```
//!
//! Two kernels are available. **Cholesky** squares the stacked system into
//! an augmented information matrix and runs a partial in-place factorization;
//! a non-positive pivot surfaces [`LinAlgError::IndefiniteSystem`] and the
//! caller may retry with QR. **QR** runs a Householder factorization of the
//! stacked rows directly, avoiding the squared condition number; information
//! form factors are converted to square-root form first.
//!
//! Columns are eliminated in the order given; rows may be permuted inside a
//! single factorization but columns never are.

use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

use crate::linalg::{
    Factorization, GaussianConditional, GaussianBayesNet, GaussianFactor, HessianFactor,
    JacobianFactor, LinAlgError, LinAlgResult,
};

/// Output of [`eliminate_sequential`].
#[derive(Debug, Clone)]
pub struct EliminationResult {
    /// One conditional per eliminated variable, in elimination order.
    pub bayes_net: GaussianBayesNet,
    /// The marginal produced by each elimination, in information form, on the
    /// variables that remained. `None` once nothing remains.
    pub marginals: Vec<Option<HessianFactor>>,
}

/// Eliminate the variables listed in `order`, one at a time, from `factors`.
///
/// Every factor's keys must be covered by `order`; the marginal produced by
/// each step re-enters the working set until its own variables are
/// eliminated.
pub fn eliminate_sequential(
    factors: Vec<GaussianFactor>,
    order: &[usize],
    mode: Factorization,
) -> LinAlgResult<EliminationResult> {
    let mut working: Vec<Option<GaussianFactor>> = factors.into_iter().map(Some).collect();
    let mut touching: HashMap<usize, Vec<usize>> = HashMap::new();
    for (id, factor) in working.iter().enumerate() {
        if let Some(factor) = factor {
            for &key in factor.keys() {
                touching.entry(key).or_default().push(id);
            }
        }
    }

    let mut bayes_net = GaussianBayesNet::new();
    let mut marginals = Vec::with_capacity(order.len());

    for &target in order {
        let ids = touching.remove(&target).unwrap_or_default();
        let involved: Vec<GaussianFactor> = ids
            .into_iter()
            .filter_map(|id| working[id].take())
            .collect();
        if involved.is_empty() {
            return Err(LinAlgError::FactorizationFailed(format!(
                "variable {} has no remaining factors",
                target
            ))
            .log());
        }

        let (conditional, marginal) = eliminate_one(&involved, target, mode)?;
        bayes_net.push(conditional);

        match marginal {
            Some(factor) => {
                marginals.push(Some(match &factor {
                    GaussianFactor::Hessian(h) => h.clone(),
                    GaussianFactor::Jacobian(j) => HessianFactor::from_jacobian(j),
                }));
                let id = working.len();
                for &key in factor.keys() {
                    touching.entry(key).or_default().push(id);
                }
                working.push(Some(factor));
            }
            None => marginals.push(None),
        }
    }

    debug_assert!(
        working.iter().all(|f| f.is_none()),
        "factors left over after elimination; order did not cover all keys"
    );

    Ok(EliminationResult {
        bayes_net,
        marginals,
    })
}

/// Eliminate a single variable from the given factors.
///
/// Returns the conditional `p(target | rest)` and, unless `target` was the
/// last involved variable, the marginal factor on the rest.
pub fn eliminate_one(
    factors: &[GaussianFactor],
    target: usize,
    mode: Factorization,
) -> LinAlgResult<(GaussianConditional, Option<GaussianFactor>)> {
    // Column layout: target first, remaining involved variables by index
    let mut dims: HashMap<usize, usize> = HashMap::new();
    for factor in factors {
        for &key in factor.keys() {
            let dim = factor.dim_of(key).unwrap();
            let known = dims.entry(key).or_insert(dim);
            debug_assert_eq!(*known, dim, "conflicting dims for variable {}", key);
        }
    }
    debug_assert!(dims.contains_key(&target));

    let mut rest: Vec<usize> = dims.keys().copied().filter(|&k| k != target).collect();
    rest.sort_unstable();

    let mut columns = vec![target];
    columns.extend_from_slice(&rest);
    let col_dims: Vec<usize> = columns.iter().map(|k| dims[k]).collect();
    let mut offsets = HashMap::new();
    let mut total = 0;
    for (key, dim) in columns.iter().zip(col_dims.iter()) {
        offsets.insert(*key, total);
        total += dim;
    }

    let fdim = dims[&target];
    match mode {
        Factorization::Cholesky => {
            eliminate_cholesky(factors, target, &rest, &offsets, &dims, total, fdim)
        }
        Factorization::QR => {
            eliminate_qr(factors, target, &rest, &offsets, &dims, total, fdim)
        }
    }
}

fn eliminate_cholesky(
    factors: &[GaussianFactor],
    target: usize,
    rest: &[usize],
    offsets: &HashMap<usize, usize>,
    dims: &HashMap<usize, usize>,
    total: usize,
    fdim: usize,
) -> LinAlgResult<(GaussianConditional, Option<GaussianFactor>)> {
    let n = total + 1;
    let mut info = DMatrix::<f64>::zeros(n, n);

    for factor in factors {
        scatter_information(factor, offsets, total, &mut info);
    }

    partial_cholesky_in_place(&mut info, fdim)?;

    let conditional = conditional_from_rows(&info, target, rest, dims, fdim, total);

    let marginal = if rest.is_empty() {
        None
    } else {
        let sub = info.view((fdim, fdim), (n - fdim, n - fdim)).into_owned();
        let rest_dims: Vec<usize> = rest.iter().map(|k| dims[k]).collect();
        Some(GaussianFactor::Hessian(HessianFactor::new(
            rest.to_vec(),
            rest_dims,
            sub,
        )))
    };

    Ok((conditional, marginal))
}

fn eliminate_qr(
    factors: &[GaussianFactor],
    target: usize,
    rest: &[usize],
    offsets: &HashMap<usize, usize>,
    dims: &HashMap<usize, usize>,
    total: usize,
    fdim: usize,
) -> LinAlgResult<(GaussianConditional, Option<GaussianFactor>)> {
    // Convert information form factors to square-root form, then stack
    let mut jacobians: Vec<JacobianFactor> = Vec::with_capacity(factors.len());
    for factor in factors {
        match factor {
            GaussianFactor::Jacobian(j) => jacobians.push(j.clone()),
            GaussianFactor::Hessian(h) => jacobians.push(hessian_to_jacobian(h)?),
        }
    }

    let rows: usize = jacobians.iter().map(|j| j.rows()).sum();
    if rows < fdim {
        return Err(LinAlgError::FactorizationFailed(format!(
            "variable {} is underdetermined: {} rows for {} frontal dims",
            target, rows, fdim
        ))
        .log());
    }

    let mut stacked = DMatrix::<f64>::zeros(rows, total + 1);
    let mut row = 0;
    for jf in &jacobians {
        let height = jf.rows();
        for (i, &key) in jf.keys().iter().enumerate() {
            let offset = offsets[&key];
            stacked
                .view_mut((row, offset), (height, jf.block(i).ncols()))
                .copy_from(jf.block(i));
        }
        stacked
            .view_mut((row, total), (height, 1))
            .copy_from(jf.b());
        row += height;
    }

    let r_mat = stacked.qr().unpack_r();

    for k in 0..fdim {
        if r_mat[(k, k)] == 0.0 {
            return Err(LinAlgError::IndefiniteSystem {
                pivot: 0.0,
                column: k,
            }
            .log());
        }
    }

    let conditional = conditional_from_rows(&r_mat, target, rest, dims, fdim, total);

    let tail_rows = r_mat.nrows().min(total + 1) - fdim;
    let marginal = if rest.is_empty() || tail_rows == 0 {
        None
    } else {
        let mut keys = Vec::with_capacity(rest.len());
        let mut blocks = Vec::with_capacity(rest.len());
        for &key in rest {
            keys.push(key);
            blocks.push(
                r_mat
                    .view((fdim, offsets[&key]), (tail_rows, dims[&key]))
                    .into_owned(),
            );
        }
        let b = r_mat.view((fdim, total), (tail_rows, 1)).column(0).into_owned();
        Some(GaussianFactor::Jacobian(JacobianFactor::new(keys, blocks, b)))
    };

    Ok((conditional, marginal))
}

/// Scatter a factor's information contribution into the augmented matrix.
fn scatter_information(
    factor: &GaussianFactor,
    offsets: &HashMap<usize, usize>,
    total: usize,
    info: &mut DMatrix<f64>,
) {
    match factor {
        GaussianFactor::Jacobian(jf) => {
            let k = jf.keys().len();
            for i in 0..k {
                let oi = offsets[&jf.keys()[i]];
                let ai = jf.block(i);
                for j in 0..k {
                    let oj = offsets[&jf.keys()[j]];
                    let contribution = ai.transpose() * jf.block(j);
                    let mut view = info.view_mut((oi, oj), (ai.ncols(), contribution.ncols()));
                    view += contribution;
                }
                let g = ai.transpose() * jf.b();
                let mut view = info.view_mut((oi, total), (ai.ncols(), 1));
                view += g.clone();
                let mut view = info.view_mut((total, oi), (1, ai.ncols()));
                view += g.transpose();
            }
            info[(total, total)] += jf.b().dot(jf.b());
        }
        GaussianFactor::Hessian(hf) => {
            // Map the factor's local layout onto the global one
            let mut local_offsets = Vec::with_capacity(hf.keys().len() + 1);
            let mut local = 0;
            for &dim in hf.dims() {
                local_offsets.push(local);
                local += dim;
            }
            let local_total = local;

            let global_of = |li: usize| -> usize {
                if li >= local_total {
                    total + (li - local_total)
                } else {
                    let block = local_offsets
                        .iter()
                        .rposition(|&o| o <= li)
                        .unwrap();
                    offsets[&hf.keys()[block]] + (li - local_offsets[block])
                }
            };

            let source = hf.info();
            for li in 0..source.nrows() {
                let gi = global_of(li);
                for lj in 0..source.ncols() {
                    let gj = global_of(lj);
                    info[(gi, gj)] += source[(li, lj)];
                }
            }
        }
    }
}

/// Factor the first `fdim` columns of a symmetric augmented information
/// matrix in place. On return the top rows hold `[R_FF R_FS | d]` and the
/// trailing submatrix holds the Schur complement.
fn partial_cholesky_in_place(info: &mut DMatrix<f64>, fdim: usize) -> LinAlgResult<()> {
    let n = info.nrows();
    for k in 0..fdim {
        let pivot = info[(k, k)];
        if pivot <= 0.0 {
            return Err(LinAlgError::IndefiniteSystem { pivot, column: k }.log());
        }
        let rkk = pivot.sqrt();
        for j in k..n {
            info[(k, j)] /= rkk;
        }
        for i in (k + 1)..n {
            let rki = info[(k, i)];
            if rki != 0.0 {
                for j in (k + 1)..n {
                    let update = rki * info[(k, j)];
                    info[(i, j)] -= update;
                }
            }
            info[(i, k)] = 0.0;
        }
    }
    Ok(())
}

/// Convert an information form factor to square-root form via a full
/// in-place Cholesky of its variable columns.
fn hessian_to_jacobian(factor: &HessianFactor) -> LinAlgResult<JacobianFactor> {
    let total: usize = factor.dims().iter().sum();
    let mut info = factor.info().clone();
    partial_cholesky_in_place(&mut info, total)?;

    // Rows 0..total now hold [R | d]; the remaining scalar is a constant
    // residual that does not influence the minimizer.
    let mut blocks = Vec::with_capacity(factor.keys().len());
    let mut offset = 0;
    for &dim in factor.dims() {
        blocks.push(info.view((0, offset), (total, dim)).into_owned());
        offset += dim;
    }
    let b = info.view((0, total), (total, 1)).column(0).into_owned();
    Ok(JacobianFactor::new(factor.keys().to_vec(), blocks, b))
}

/// Assemble the conditional from the top `fdim` factored rows.
fn conditional_from_rows(
    rows: &DMatrix<f64>,
    target: usize,
    rest: &[usize],
    dims: &HashMap<usize, usize>,
    fdim: usize,
    total: usize,
) -> GaussianConditional {
    let mut r = rows.view((0, 0), (fdim, fdim)).into_owned();
    // Zero strictly-lower entries left behind by the factorization
    for i in 0..fdim {
        for j in 0..i {
            r[(i, j)] = 0.0;
        }
    }
    let s = rows.view((0, fdim), (fdim, total - fdim)).into_owned();
    let d = rows.view((0, total), (fdim, 1)).column(0).into_owned();
    let rest_dims: Vec<usize> = rest.iter().map(|k| dims[k]).collect();

    GaussianConditional::new(
        vec![target],
        vec![fdim],
        rest.to_vec(),
        rest_dims,
        r,
        s,
        d,
        DVector::from_element(fdim, 1.0),
    )
}
