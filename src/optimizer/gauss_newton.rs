//! Gauss-Newton back-substitution over the Bayes tree.
//!
//! The full Gauss-Newton step solves `delta = R⁻¹ d` from the roots
//! downwards. In steady state only a small top of the tree changes per
//! update, so the solve is partial ("wildfire"): a clique is recomputed only
//! if one of its frontal variables was replaced by the last re-elimination or
//! a separator entry changed; once the recomputed delta moves by less than
//! the threshold and the clique itself was not replaced, the descent stops
//! and the entire subtree below keeps its previous values.
//!
//! Replaced cliques form a connected top of the tree, so a stopped descent
//! can never skip over one.

use nalgebra::DVector;
use std::collections::HashSet;

use crate::core::vector_values::PermutedVectorValues;
use crate::linalg::LinAlgResult;
use crate::tree::SharedClique;

/// Partially recompute `delta` from the tree, returning the number of
/// variables whose rows were refreshed.
pub fn optimize_wildfire(
    roots: &[SharedClique],
    threshold: f64,
    replaced: &[bool],
    delta: &mut PermutedVectorValues,
) -> LinAlgResult<usize> {
    let mut changed: HashSet<usize> = HashSet::new();
    let mut count = 0;
    for root in roots {
        optimize_wildfire_node(root, threshold, replaced, &mut changed, delta, &mut count)?;
    }
    Ok(count)
}

fn optimize_wildfire_node(
    clique: &SharedClique,
    threshold: f64,
    replaced: &[bool],
    changed: &mut HashSet<usize>,
    delta: &mut PermutedVectorValues,
    count: &mut usize,
) -> LinAlgResult<()> {
    let (frontal_replaced, separator_changed) = {
        let node = clique.borrow();
        (
            node.frontals().iter().any(|&i| replaced[i]),
            node.separator().iter().any(|i| changed.contains(i)),
        )
    };
    if !frontal_replaced && !separator_changed {
        return Ok(());
    }

    let (rows, frontals): (Vec<DVector<f64>>, Vec<usize>) = {
        let node = clique.borrow();
        let solution = node
            .conditional()
            .solve(|key| delta.logical(key).clone())?;
        (
            node.conditional().split_frontal_rows(&solution),
            node.frontals().to_vec(),
        )
    };

    let mut max_change: f64 = 0.0;
    for (index, row) in frontals.iter().zip(rows.into_iter()) {
        let change = (&row - delta.logical(*index)).amax();
        max_change = max_change.max(change);
        delta.set_logical(*index, row);
        *count += 1;
    }

    if max_change > threshold {
        changed.extend(frontals.iter().copied());
    }
    let children = clique.borrow().children().to_vec();
    for child in children {
        optimize_wildfire_node(&child, threshold, replaced, changed, delta, count)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ordering::Permutation;
    use crate::core::vector_values::VectorValues;
    use crate::linalg::GaussianConditional;
    use crate::tree::{BayesTree, Clique};
    use nalgebra::DMatrix;

    fn scalar_conditional(
        frontal: usize,
        separator: Vec<usize>,
        r: f64,
        s_values: &[f64],
        d: f64,
    ) -> GaussianConditional {
        let sdim = separator.len();
        GaussianConditional::new(
            vec![frontal],
            vec![1],
            separator,
            vec![1; sdim],
            DMatrix::from_element(1, 1, r),
            DMatrix::from_row_slice(1, sdim, s_values),
            DVector::from_element(1, d),
            DVector::from_element(1, 1.0),
        )
    }

    fn delta_of(n: usize) -> PermutedVectorValues {
        let mut values = VectorValues::new();
        for _ in 0..n {
            values.push(DVector::zeros(1));
        }
        PermutedVectorValues::from_parts(Permutation::identity(n), values)
    }

    /// Chain x0 ← x1: root solves x1 = 2, child solves x0 = 1 − 0.5·x1.
    fn chain() -> BayesTree {
        let mut tree = BayesTree::new();
        let root = Clique::new(scalar_conditional(1, vec![], 1.0, &[], 2.0), None);
        tree.attach(root.clone(), None);
        let child = Clique::new(scalar_conditional(0, vec![1], 1.0, &[0.5], 1.0), None);
        tree.attach(child, Some(&root));
        tree
    }

    #[test]
    fn test_full_solve_when_all_replaced() {
        let tree = chain();
        let mut delta = delta_of(2);
        let count =
            optimize_wildfire(tree.roots(), 0.0, &[true, true], &mut delta).unwrap();
        assert_eq!(count, 2);
        assert!((delta.logical(1)[0] - 2.0).abs() < 1e-12);
        assert!((delta.logical(0)[0] - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_untouched_tree_is_skipped() {
        let tree = chain();
        let mut delta = delta_of(2);
        let count =
            optimize_wildfire(tree.roots(), 0.0, &[false, false], &mut delta).unwrap();
        assert_eq!(count, 0);
        assert!(delta.logical(0)[0].abs() < 1e-12);
    }

    #[test]
    fn test_change_propagates_to_children() {
        let tree = chain();
        let mut delta = delta_of(2);
        // Only the root was replaced; the child must still be refreshed
        // because its separator value moves.
        let count =
            optimize_wildfire(tree.roots(), 1e-9, &[false, true], &mut delta).unwrap();
        assert_eq!(count, 2);
        assert!((delta.logical(0)[0]).abs() < 1e-12);
        assert!((delta.logical(1)[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_descent_stops_below_threshold() {
        let tree = chain();
        let mut delta = delta_of(2);
        // Prime with the exact solution, then replace the root: its
        // recomputed delta does not move, so the child is never touched.
        delta.set_logical(1, DVector::from_element(1, 2.0));
        delta.set_logical(0, DVector::from_element(1, 0.0));
        let count =
            optimize_wildfire(tree.roots(), 0.001, &[false, true], &mut delta).unwrap();
        assert_eq!(count, 1);
    }
}
