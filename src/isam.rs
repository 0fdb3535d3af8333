//! The incremental smoothing and mapping engine.
//!
//! [`Isam`] maintains the MAP estimate of a growing nonlinear factor graph.
//! Instead of re-solving the whole problem after every measurement, it keeps
//! a [`BayesTree`] of Gaussian conditionals — the result of eliminating the
//! current linearized graph — and updates it in place:
//!
//! 1. New factors, removed factors and variables whose accumulated delta
//!    exceeds the relinearization threshold mark a set of affected variables.
//! 2. The top of the tree reaching those variables is detached. The factors
//!    fully inside the affected set are relinearized; everything below the
//!    detach line is summarized by the cached separator marginals of the
//!    orphaned subtrees.
//! 3. The affected variables move to the top of the elimination ordering
//!    (a metadata-only permutation of the ordering, the tree and the running
//!    delta views) and the local graph is re-eliminated into fresh cliques,
//!    which are attached where the old top was; orphans reattach below.
//! 4. The step controller (Gauss-Newton or Powell's dogleg) refreshes the
//!    delta rows invalidated by the re-elimination and the estimate is read
//!    as `theta ⊞ delta`.
//!
//! Updates are transactional: either the call completes and every tree
//! invariant holds, or the call fails and the engine is unchanged.
//!
//! # Example
//!
//! ```
//! use trellis_isam::{
//!     DiagonalNoise, Factor, Isam, PriorFactor, SE2, Value, Values,
//! };
//!
//! let mut isam = Isam::default();
//!
//! let prior = Factor::Prior(PriorFactor::new(
//!     0,
//!     Value::Pose2(SE2::from_xy_angle(0.0, 0.0, 0.0)),
//!     DiagonalNoise::from_sigmas(&[0.1, 0.1, 0.01]),
//! ));
//! let mut init = Values::new();
//! init.insert(0, Value::Pose2(SE2::from_xy_angle(0.01, 0.01, 0.01))).unwrap();
//!
//! let result = isam.update(vec![prior], init).unwrap();
//! assert_eq!(result.new_factor_indices, vec![0]);
//! let estimate = isam.calculate_estimate().unwrap();
//! assert_eq!(estimate.len(), 1);
//! ```

use nalgebra::DVector;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use tracing::debug;

use crate::core::factor_store::FactorStore;
use crate::core::key::{Key, KeyFormatter, default_key_formatter};
use crate::core::ordering::{Ordering, Permutation};
use crate::core::values::{Value, Values};
use crate::core::vector_values::{PermutedVectorValues, VectorValues};
use crate::core::CoreError;
use crate::error::TrellisResult;
use crate::factors::Factor;
use crate::linalg::{
    EliminationResult, Factorization, GaussianFactor, eliminate_sequential,
};
use crate::optimizer::{OptimizationParams, dogleg_step, optimize_wildfire};
use crate::tree::{BayesTree, Clique, SharedClique};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct IsamParams {
    /// Step controller strategy, fixed for the engine's lifetime.
    pub optimization: OptimizationParams,
    /// L∞ delta threshold above which a variable is relinearized.
    pub relinearize_threshold: f64,
    /// Number of updates between relinearization checks (0 checks every
    /// update).
    pub relinearize_skip: usize,
    /// Master switch for relinearization.
    pub enable_relinearization: bool,
    /// Whether update results carry nonlinear error evaluations.
    pub evaluate_nonlinear_error: bool,
    /// Factorization used by the elimination kernel.
    pub factorization: Factorization,
    /// Debug stringifier for keys.
    pub key_formatter: KeyFormatter,
}

impl IsamParams {
    /// Create a parameter set in the conventional argument order.
    pub fn new(
        optimization: OptimizationParams,
        relinearize_threshold: f64,
        relinearize_skip: usize,
        enable_relinearization: bool,
        evaluate_nonlinear_error: bool,
        factorization: Factorization,
    ) -> Self {
        IsamParams {
            optimization,
            relinearize_threshold,
            relinearize_skip,
            enable_relinearization,
            evaluate_nonlinear_error,
            factorization,
            key_formatter: default_key_formatter,
        }
    }
}

impl Default for IsamParams {
    fn default() -> Self {
        IsamParams {
            optimization: OptimizationParams::default(),
            relinearize_threshold: 0.1,
            relinearize_skip: 10,
            enable_relinearization: true,
            evaluate_nonlinear_error: false,
            factorization: Factorization::default(),
            key_formatter: default_key_formatter,
        }
    }
}

/// Statistics of one `update` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    /// Slot assigned to each new factor, in input order.
    pub new_factor_indices: Vec<usize>,
    /// Number of variables re-eliminated.
    pub variables_reeliminated: usize,
    /// Number of variables relinearized.
    pub variables_relinearized: usize,
    /// Number of cliques created by the re-elimination.
    pub cliques: usize,
    /// Number of factors relinearized into the local graph.
    pub factors_recalculated: usize,
    /// Total nonlinear error before re-elimination (new factors included),
    /// when error evaluation is enabled.
    pub error_before: Option<f64>,
    /// Total nonlinear error at the updated estimate, when error evaluation
    /// is enabled.
    pub error_after: Option<f64>,
}

/// Everything the fallible preparation phase hands to the infallible commit.
struct Reelimination {
    affected_old: Vec<usize>,
    new_index_of: Vec<usize>,
    elimination: EliminationResult,
    top: Vec<SharedClique>,
    orphans: Vec<SharedClique>,
    involved_slots: usize,
}

/// Undo record for a relinearized variable.
struct RelinUndo {
    key: Key,
    index: usize,
    old_value: Value,
    old_delta: DVector<f64>,
    old_newton: DVector<f64>,
    old_rg: DVector<f64>,
}

/// The incremental smoothing and mapping engine.
#[derive(Debug, Clone)]
pub struct Isam {
    params: IsamParams,
    theta: Values,
    ordering: Ordering,
    factors: FactorStore,
    tree: BayesTree,
    delta: PermutedVectorValues,
    delta_newton: PermutedVectorValues,
    delta_rg: PermutedVectorValues,
    replaced: Vec<bool>,
    dogleg_radius: f64,
    update_count: usize,
}

impl Default for Isam {
    fn default() -> Self {
        Isam::new(IsamParams::default())
    }
}

/// Equality of the inference state: parameters, estimate, factors, tree and
/// accumulated steps. The internal update counter is deliberately excluded
/// so that no-op updates compare equal.
impl PartialEq for Isam {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
            && self.theta == other.theta
            && self.ordering == other.ordering
            && self.factors == other.factors
            && self.tree == other.tree
            && self.delta == other.delta
            && self.delta_newton == other.delta_newton
            && self.delta_rg == other.delta_rg
            && self.replaced == other.replaced
            && self.dogleg_radius == other.dogleg_radius
    }
}

impl Isam {
    /// Create an engine with the given configuration.
    pub fn new(params: IsamParams) -> Self {
        let dogleg_radius = match params.optimization {
            OptimizationParams::Dogleg(dogleg) => dogleg.initial_trust_radius,
            OptimizationParams::GaussNewton(_) => 0.0,
        };
        Isam {
            params,
            theta: Values::new(),
            ordering: Ordering::new(),
            factors: FactorStore::new(),
            tree: BayesTree::new(),
            delta: PermutedVectorValues::new(),
            delta_newton: PermutedVectorValues::new(),
            delta_rg: PermutedVectorValues::new(),
            replaced: Vec::new(),
            dogleg_radius,
            update_count: 0,
        }
    }

    /// The engine configuration.
    pub fn params(&self) -> &IsamParams {
        &self.params
    }

    /// Current key ↔ index mapping.
    pub fn ordering(&self) -> &Ordering {
        &self.ordering
    }

    /// Read-only view of the live factors by slot.
    pub fn factors(&self) -> &FactorStore {
        &self.factors
    }

    /// The current linearization point.
    pub fn linearization_point(&self) -> &Values {
        &self.theta
    }

    /// The accumulated step at the current linearization point, as a
    /// permuted view over the elimination ordering.
    pub fn delta(&self) -> &PermutedVectorValues {
        &self.delta
    }

    /// All cliques of the Bayes tree, top-down.
    pub fn nodes(&self) -> Vec<SharedClique> {
        self.tree.cliques()
    }

    /// The Bayes tree itself.
    pub fn tree(&self) -> &BayesTree {
        &self.tree
    }

    /// Current nonlinear estimate: `theta ⊞ delta` for every variable.
    pub fn calculate_estimate(&self) -> TrellisResult<Values> {
        Ok(self.theta.retract(&self.delta.to_logical(), &self.ordering)?)
    }

    /// Current estimate of a single variable.
    pub fn calculate_estimate_of(&self, key: Key) -> TrellisResult<Value> {
        let index = self.ordering.at(key)?;
        Ok(self.theta.get(key)?.retract(self.delta.logical(index))?)
    }

    /// Total nonlinear error of the live factors at `values`.
    pub fn error(&self, values: &Values) -> TrellisResult<f64> {
        Ok(self.factors.error(values)?)
    }

    /// Gradient of the linearized system at the origin, assembled by
    /// scatter-summing every clique's gradient contribution.
    pub fn gradient_at_zero(&self) -> VectorValues {
        let mut gradient = self.delta.to_logical().zeros_like();
        for clique in self.tree.cliques() {
            let node = clique.borrow();
            let contribution = node.gradient_contribution();
            let conditional = node.conditional();
            let mut offset = 0;
            for (key, dim) in conditional
                .frontals()
                .iter()
                .zip(conditional.frontal_dims().iter())
                .chain(
                    conditional
                        .separator()
                        .iter()
                        .zip(conditional.separator_dims().iter()),
                )
            {
                let mut row = gradient.row(*key).clone();
                row += contribution.rows(offset, *dim);
                gradient.set_row(*key, row);
                offset += dim;
            }
        }
        gradient
    }

    /// Add new factors and variables; see [`update_full`](Self::update_full).
    pub fn update(
        &mut self,
        new_factors: Vec<Factor>,
        new_values: Values,
    ) -> TrellisResult<UpdateResult> {
        self.update_full(new_factors, new_values, &[], &HashMap::new())
    }

    /// Add and remove factors, add variables, and refresh the estimate.
    ///
    /// `remove_slots` lists factor slots to retire; `constrained_last_keys`
    /// forces the listed keys to the end of the elimination ordering, higher
    /// group numbers last (ties keep their relative order).
    ///
    /// The call is transactional: on error the engine is left exactly as it
    /// was before.
    pub fn update_full(
        &mut self,
        new_factors: Vec<Factor>,
        new_values: Values,
        remove_slots: &[usize],
        constrained_last_keys: &HashMap<Key, u32>,
    ) -> TrellisResult<UpdateResult> {
        self.update_count += 1;

        // Validation up front, before anything is mutated
        let mut seen_slots = HashSet::new();
        for &slot in remove_slots {
            if !self.factors.is_live(slot) || !seen_slots.insert(slot) {
                return Err(CoreError::UnknownSlot { slot }.log().into());
            }
        }
        for key in new_values.keys_sorted() {
            if self.theta.contains(key) {
                return Err(CoreError::DuplicateKey { key }.log().into());
            }
        }
        for factor in &new_factors {
            for &key in factor.keys() {
                if !self.theta.contains(key) && !new_values.contains(key) {
                    return Err(CoreError::UnknownKey { key }.log().into());
                }
            }
        }

        let checkpoint_vars = self.ordering.len();
        let checkpoint_slots = self.factors.num_slots();

        // 1. AddVariables: append in ascending key order
        let added_keys = self.add_variables(&new_values)?;

        // Constrained keys must exist now that new variables are in
        for &key in constrained_last_keys.keys() {
            if !self.ordering.contains(key) {
                self.rollback(checkpoint_vars, checkpoint_slots, Vec::new(), Vec::new());
                return Err(CoreError::DuplicateKey { key }.log().into());
            }
        }

        // 2. AddFactors
        let new_slots: Vec<usize> = new_factors
            .into_iter()
            .map(|factor| self.factors.add(factor))
            .collect();

        let error_before = if self.params.evaluate_nonlinear_error {
            Some(self.factors.error(&self.calculate_estimate()?)?)
        } else {
            None
        };

        // 3. RemoveFactors
        let mut removed: Vec<(usize, Factor)> = Vec::with_capacity(remove_slots.len());
        for &slot in remove_slots {
            removed.push((slot, self.factors.remove(slot)?));
        }

        // 4. Mark affected variables (sorted so downstream float summation
        // orders are reproducible across engines with the same history)
        let mut marked: BTreeSet<Key> = BTreeSet::new();
        for &slot in &new_slots {
            marked.extend(self.factors.get(slot).unwrap().keys().iter().copied());
        }
        for (_, factor) in &removed {
            marked.extend(factor.keys().iter().copied());
        }
        marked.extend(added_keys.iter().copied());
        marked.extend(constrained_last_keys.keys().copied());

        // 5. CheckRelinearization
        let relin_keys = self.check_relinearization();
        if !relin_keys.is_empty() {
            let formatter = self.params.key_formatter;
            debug!(
                "relinearizing {} variables: {}",
                relin_keys.len(),
                relin_keys
                    .iter()
                    .map(|&key| formatter(key))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            // Every factor touching a relinearized variable must be rebuilt,
            // so all of its variables join the marked set.
            for slot in self.factors.slots_touching(relin_keys.iter()) {
                if let Some(factor) = self.factors.get(slot) {
                    marked.extend(factor.keys().iter().copied());
                }
            }
            marked.extend(relin_keys.iter().copied());
        }

        if marked.is_empty() {
            // Nothing to do; an empty update preserves all invariants
            return Ok(UpdateResult {
                new_factor_indices: new_slots,
                error_after: error_before,
                error_before,
                ..Default::default()
            });
        }

        // Apply the accumulated step to relinearized variables and reset
        // their delta rows
        let relin_undo = self.apply_relinearization(&relin_keys);
        let variables_relinearized = relin_keys.len();

        // 6/7. Detach, rebuild and re-eliminate (fallible; engine untouched
        // until commit)
        let prepared = match self.prepare_reelimination(&marked, constrained_last_keys) {
            Ok(prepared) => prepared,
            Err(error) => {
                self.rollback(checkpoint_vars, checkpoint_slots, removed, relin_undo);
                return Err(error);
            }
        };

        let variables_reeliminated = prepared.affected_old.len();
        let factors_recalculated = prepared.involved_slots;
        let cliques = self.commit_reelimination(prepared);

        debug!(
            "update {}: reeliminated {} variables into {} cliques ({} factors, {} relinearized)",
            self.update_count,
            variables_reeliminated,
            cliques,
            factors_recalculated,
            variables_relinearized
        );

        // 8/9. Step controller refreshes the invalidated delta rows
        self.run_step_controller()?;
        self.replaced.fill(false);

        #[cfg(debug_assertions)]
        self.factors.check_invariants();

        let error_after = if self.params.evaluate_nonlinear_error {
            Some(self.factors.error(&self.calculate_estimate()?)?)
        } else {
            None
        };

        Ok(UpdateResult {
            new_factor_indices: new_slots,
            variables_reeliminated,
            variables_relinearized,
            cliques,
            factors_recalculated,
            error_before,
            error_after,
        })
    }

    /// Append the new variables in ascending key order, extending the three
    /// running delta views by identity-permuted zero rows.
    fn add_variables(&mut self, new_values: &Values) -> TrellisResult<Vec<Key>> {
        let added = new_values.keys_sorted();
        for &key in &added {
            let value = new_values.get(key)?.clone();
            let dim = value.dim();
            self.theta.insert(key, value)?;
            self.ordering.insert(key)?;
            self.delta.push(DVector::zeros(dim));
            self.delta_newton.push(DVector::zeros(dim));
            self.delta_rg.push(DVector::zeros(dim));
            self.replaced.push(false);
        }
        Ok(added)
    }

    /// Variables whose accumulated delta exceeds the relinearization
    /// threshold, honoring the skip counter.
    fn check_relinearization(&self) -> BTreeSet<Key> {
        let mut relin = BTreeSet::new();
        if !self.params.enable_relinearization {
            return relin;
        }
        if self.update_count % self.params.relinearize_skip.max(1) != 0 {
            return relin;
        }
        for index in 0..self.ordering.len() {
            let row = self.delta.logical(index);
            if !row.is_empty() && row.amax() > self.params.relinearize_threshold {
                relin.insert(self.ordering.key_of(index));
            }
        }
        relin
    }

    /// Move the linearization point of the given variables by their current
    /// delta and zero the rows, recording undo information.
    fn apply_relinearization(&mut self, relin_keys: &BTreeSet<Key>) -> Vec<RelinUndo> {
        let mut undo = Vec::with_capacity(relin_keys.len());
        for &key in relin_keys {
            let index = self.ordering.at(key).expect("relinearized key unknown");
            let old_value = self.theta.get(key).expect("relinearized key unknown").clone();
            let old_delta = self.delta.logical(index).clone();
            let moved = old_value
                .retract(&old_delta)
                .expect("delta row dimension mismatch");
            *self.theta.get_mut(key).unwrap() = moved;

            let dim = old_delta.len();
            undo.push(RelinUndo {
                key,
                index,
                old_value,
                old_delta,
                old_newton: self.delta_newton.logical(index).clone(),
                old_rg: self.delta_rg.logical(index).clone(),
            });
            self.delta.set_logical(index, DVector::zeros(dim));
            self.delta_newton.set_logical(index, DVector::zeros(dim));
            self.delta_rg.set_logical(index, DVector::zeros(dim));
            self.replaced[index] = true;
        }
        undo
    }

    /// Compute the affected top, assemble and eliminate the local graph in
    /// the new index space. Engine state is not touched.
    fn prepare_reelimination(
        &self,
        marked: &BTreeSet<Key>,
        constrained_last_keys: &HashMap<Key, u32>,
    ) -> TrellisResult<Reelimination> {
        let marked_indices: BTreeSet<usize> = marked
            .iter()
            .map(|&key| self.ordering.at(key))
            .collect::<Result<_, _>>()?;

        // Affected = frontals of the detached top plus marked variables not
        // yet in the tree (fresh this update)
        let top = self.tree.find_all(&marked_indices);
        let top_ptrs: HashSet<*const _> = top.iter().map(Rc::as_ptr).collect();
        let mut affected: BTreeSet<usize> = BTreeSet::new();
        for clique in &top {
            affected.extend(clique.borrow().frontals().iter().copied());
        }
        for &index in &marked_indices {
            if self.tree.clique_of(index).is_none() {
                affected.insert(index);
            }
        }

        let mut orphans: Vec<SharedClique> = Vec::new();
        for clique in &top {
            for child in clique.borrow().children() {
                if !top_ptrs.contains(&Rc::as_ptr(child)) {
                    orphans.push(child.clone());
                }
            }
        }

        // Factors to relinearize: those whose keys all lie in the affected
        // set. Factors reaching outside stay summarized inside an orphan's
        // cached marginal.
        let affected_keys: HashSet<Key> = affected
            .iter()
            .map(|&index| self.ordering.key_of(index))
            .collect();
        let mut involved: Vec<usize> = self
            .factors
            .slots_touching(affected_keys.iter())
            .into_iter()
            .filter(|&slot| {
                self.factors
                    .get(slot)
                    .is_some_and(|factor| {
                        factor.keys().iter().all(|key| affected_keys.contains(key))
                    })
            })
            .collect();
        involved.sort_unstable();

        let linearized = self
            .factors
            .linearize_slots(&involved, &self.theta, &self.ordering)?;

        // New ordering: unaffected variables compact low in prior relative
        // order; affected follow, unconstrained first, then the constrained
        // tail grouped by ascending group number
        let n = self.ordering.len();
        let mut new_index_of = vec![usize::MAX; n];
        let mut next = 0;
        for index in 0..n {
            if !affected.contains(&index) {
                new_index_of[index] = next;
                next += 1;
            }
        }
        let constrained_group = |index: usize| -> Option<u32> {
            constrained_last_keys
                .get(&self.ordering.key_of(index))
                .copied()
        };
        for &index in affected.iter() {
            if constrained_group(index).is_none() {
                new_index_of[index] = next;
                next += 1;
            }
        }
        let mut tail: Vec<(u32, usize)> = affected
            .iter()
            .filter_map(|&index| constrained_group(index).map(|group| (group, index)))
            .collect();
        tail.sort();
        for (_, index) in tail {
            new_index_of[index] = next;
            next += 1;
        }
        debug_assert_eq!(next, n);

        // Local graph in the new index space: relinearized factors plus the
        // cached separator marginals of the orphaned subtrees
        let mut local: Vec<GaussianFactor> = Vec::with_capacity(linearized.len() + orphans.len());
        for (_, mut jacobian) in linearized {
            jacobian.relabel(&new_index_of);
            local.push(GaussianFactor::Jacobian(jacobian));
        }
        for orphan in &orphans {
            if let Some(cached) = orphan.borrow().cached() {
                let mut hessian = cached.clone();
                hessian.relabel(&new_index_of);
                local.push(GaussianFactor::Hessian(hessian));
            }
        }

        let mut elimination_order: Vec<usize> =
            affected.iter().map(|&index| new_index_of[index]).collect();
        elimination_order.sort_unstable();

        let elimination =
            eliminate_sequential(local, &elimination_order, self.params.factorization)?;

        Ok(Reelimination {
            affected_old: affected.into_iter().collect(),
            new_index_of,
            elimination,
            top,
            orphans,
            involved_slots: involved.len(),
        })
    }

    /// Apply a prepared re-elimination: permute everything, swap the top of
    /// the tree for the fresh cliques and reattach the orphans. Infallible.
    fn commit_reelimination(&mut self, prepared: Reelimination) -> usize {
        let Reelimination {
            affected_old,
            new_index_of,
            elimination,
            top,
            orphans,
            ..
        } = prepared;

        // Sever the orphans, then drop the detached top
        for orphan in &orphans {
            self.tree.detach(orphan);
        }
        for clique in &top {
            if clique.borrow().parent().is_none() {
                self.tree.detach(clique);
            }
        }
        drop(top);

        // One global permutation, applied as metadata everywhere
        let new_to_old = Permutation::from_vec(new_index_of.clone()).inverse();
        self.tree.permute_with_inverse(&new_index_of);
        for orphan in &orphans {
            Clique::permute_with_inverse(orphan, &new_index_of);
        }
        self.ordering.permute_in_place(&new_to_old);
        self.delta.permute_logical(&new_to_old);
        self.delta_newton.permute_logical(&new_to_old);
        self.delta_rg.permute_logical(&new_to_old);
        let old_replaced = std::mem::take(&mut self.replaced);
        self.replaced = (0..old_replaced.len())
            .map(|index| old_replaced[new_to_old[index]])
            .collect();

        // Attach the replacement sub-tree, then hang each orphan below the
        // clique holding its first separator variable
        let fragment_roots = BayesTree::assemble_subtree(elimination);
        let mut cliques = 0;
        for root in fragment_roots {
            let mut stack = vec![root.clone()];
            while let Some(clique) = stack.pop() {
                stack.extend(clique.borrow().children().iter().cloned());
                cliques += 1;
            }
            self.tree.attach_subtree(root, None);
        }
        for orphan in orphans {
            let anchor = *orphan
                .borrow()
                .separator()
                .iter()
                .min()
                .expect("orphan without a separator");
            let parent = self
                .tree
                .clique_of(anchor)
                .expect("orphan separator not re-eliminated")
                .clone();
            self.tree.attach_subtree(orphan, Some(&parent));
        }

        for index in affected_old {
            self.replaced[new_index_of[index]] = true;
        }

        cliques
    }

    /// Run the configured step controller over the updated tree.
    fn run_step_controller(&mut self) -> TrellisResult<()> {
        match self.params.optimization {
            OptimizationParams::GaussNewton(gauss_newton) => {
                optimize_wildfire(
                    self.tree.roots(),
                    gauss_newton.wildfire_threshold,
                    &self.replaced,
                    &mut self.delta,
                )?;
            }
            OptimizationParams::Dogleg(dogleg) => {
                // Gauss-Newton leg, fully propagated
                optimize_wildfire(
                    self.tree.roots(),
                    0.0,
                    &self.replaced,
                    &mut self.delta_newton,
                )?;

                // Steepest-descent (Cauchy) leg: δ_sd = −α·g with
                // α = ‖g‖² / ‖J·g‖²
                let gradient = self.gradient_at_zero();
                let g_norm_sq = gradient.dot(&gradient);
                let jg_norm_sq: f64 = self
                    .tree
                    .cliques()
                    .iter()
                    .map(|clique| {
                        clique
                            .borrow()
                            .conditional()
                            .apply(|key| gradient.row(key).clone())
                            .norm_squared()
                    })
                    .sum();
                let alpha = if jg_norm_sq > 0.0 {
                    g_norm_sq / jg_norm_sq
                } else {
                    0.0
                };
                let steepest = gradient.scale(-alpha);
                self.delta_rg.set_from_logical(&steepest);

                let gauss_newton = self.delta_newton.to_logical();
                let base_error = self.factors.error(&self.theta)?;
                let theta = &self.theta;
                let ordering = &self.ordering;
                let factors = &self.factors;
                let outcome = dogleg_step(
                    &dogleg,
                    self.dogleg_radius,
                    &self.tree,
                    &gauss_newton,
                    &steepest,
                    base_error,
                    |candidate| {
                        let estimate = theta.retract(candidate, ordering)?;
                        Ok(factors.error(&estimate)?)
                    },
                )?;
                self.dogleg_radius = outcome.radius;
                if let Some(step) = outcome.step {
                    self.delta.set_from_logical(&step);
                } else {
                    debug!(
                        "dogleg rejected every candidate; keeping previous step, radius {:.3e}",
                        self.dogleg_radius
                    );
                }
            }
        }
        Ok(())
    }

    /// Undo all provisional mutations of a failed update.
    fn rollback(
        &mut self,
        checkpoint_vars: usize,
        checkpoint_slots: usize,
        removed: Vec<(usize, Factor)>,
        relin_undo: Vec<RelinUndo>,
    ) {
        while self.factors.num_slots() > checkpoint_slots {
            self.factors.pop();
        }
        for (slot, factor) in removed {
            self.factors.restore(slot, factor);
        }
        for undo in relin_undo {
            *self.theta.get_mut(undo.key).unwrap() = undo.old_value;
            self.delta.set_logical(undo.index, undo.old_delta);
            self.delta_newton.set_logical(undo.index, undo.old_newton);
            self.delta_rg.set_logical(undo.index, undo.old_rg);
            self.replaced[undo.index] = false;
        }
        for index in checkpoint_vars..self.ordering.len() {
            self.theta.remove(self.ordering.key_of(index));
        }
        self.ordering.truncate(checkpoint_vars);
        self.delta.truncate(checkpoint_vars);
        self.delta_newton.truncate(checkpoint_vars);
        self.delta_rg.truncate(checkpoint_vars);
        self.replaced.truncate(checkpoint_vars);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::noise::DiagonalNoise;
    use crate::factors::PriorFactor;
    use crate::manifold::SE2;
    use nalgebra::Vector2;

    fn pose(x: f64, y: f64, theta: f64) -> Value {
        Value::Pose2(SE2::from_xy_angle(x, y, theta))
    }

    fn unit_prior(key: Key, value: Value) -> Factor {
        let dim = value.dim();
        Factor::Prior(PriorFactor::new(key, value, DiagonalNoise::unit(dim)))
    }

    /// The three running delta views extend in lockstep: identical lengths,
    /// identity-extended permutations, zero rows, clear replaced flags.
    #[test]
    fn test_add_variables_extension() {
        let mut isam = Isam::default();
        let mut initial = Values::new();
        initial.insert(0, pose(0.1, 0.2, 0.3)).unwrap();
        initial
            .insert(100, Value::Point2(Vector2::new(0.4, 0.5)))
            .unwrap();
        isam.add_variables(&initial).unwrap();

        let mut fresh = Values::new();
        fresh.insert(1, pose(0.6, 0.7, 0.8)).unwrap();
        isam.add_variables(&fresh).unwrap();

        assert_eq!(isam.delta.len(), 3);
        assert_eq!(isam.delta_newton.len(), 3);
        assert_eq!(isam.delta_rg.len(), 3);
        // Key 1 was appended at index 2, identity-permuted
        assert_eq!(isam.ordering.at(1).unwrap(), 2);
        assert_eq!(isam.delta.permutation().get(2), 2);
        assert_eq!(isam.delta_newton.permutation().get(2), 2);
        assert_eq!(isam.delta_rg.permutation().get(2), 2);
        assert_eq!(isam.delta.logical(2), &DVector::zeros(3));
        assert!(!isam.replaced[2]);
    }

    #[test]
    fn test_add_variables_duplicate_key() {
        let mut isam = Isam::default();
        let mut initial = Values::new();
        initial.insert(0, pose(0.0, 0.0, 0.0)).unwrap();
        isam.update(vec![unit_prior(0, pose(0.0, 0.0, 0.0))], initial)
            .unwrap();

        let mut duplicate = Values::new();
        duplicate.insert(0, pose(1.0, 0.0, 0.0)).unwrap();
        let err = isam.update(Vec::new(), duplicate);
        assert!(err.is_err());
        // The failed update left the engine untouched
        assert_eq!(isam.ordering.len(), 1);
        assert_eq!(isam.factors.num_slots(), 1);
    }

    #[test]
    fn test_empty_update_is_noop() {
        let mut isam = Isam::default();
        let result = isam.update(Vec::new(), Values::new()).unwrap();
        assert_eq!(result.variables_reeliminated, 0);
        assert_eq!(result.cliques, 0);
        assert!(isam.calculate_estimate().unwrap().is_empty());

        // Also after real content has been added
        let mut initial = Values::new();
        initial.insert(0, pose(0.0, 0.0, 0.0)).unwrap();
        isam.update(vec![unit_prior(0, pose(0.0, 0.0, 0.0))], initial)
            .unwrap();
        let before = isam.clone();
        let result = isam.update(Vec::new(), Values::new()).unwrap();
        assert_eq!(result.variables_reeliminated, 0);
        assert!(isam == before);
    }

    #[test]
    fn test_remove_unknown_slot() {
        let mut isam = Isam::default();
        let err = isam.update_full(Vec::new(), Values::new(), &[3], &HashMap::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_single_prior_converges() {
        let mut isam = Isam::default();
        let mut initial = Values::new();
        initial.insert(0, pose(0.01, 0.01, 0.01)).unwrap();
        isam.update(vec![unit_prior(0, pose(0.0, 0.0, 0.0))], initial)
            .unwrap();

        let estimate = isam.calculate_estimate().unwrap();
        let recovered = estimate.get(0).unwrap();
        let target = pose(0.0, 0.0, 0.0);
        // One Gauss-Newton step lands on the prior up to the second-order
        // retraction error of the 0.017-radian initial offset
        assert!(
            recovered.local_coordinates(&target).unwrap().norm() < 1e-4,
            "prior not recovered: {:?}",
            recovered
        );
    }

    #[test]
    fn test_clone_of_fresh_engine_equals_default() {
        let isam = Isam::default();
        let copy = isam.clone();
        assert!(copy == Isam::default());
    }
}
