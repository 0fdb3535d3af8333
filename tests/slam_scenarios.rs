//! End-to-end planar SLAM scenarios for the incremental engine.
//!
//! Each test drives a 12-pose trajectory with two landmarks through the
//! engine one measurement batch at a time and compares the incremental
//! estimate against a batch reference: the full nonlinear graph linearized at
//! the accumulated initial values under the engine's current ordering,
//! eliminated in one shot, solved and retracted once. With relinearization
//! disabled the two must agree to tight tolerance, whatever order the
//! measurements arrived in.
//!
//! # Test Coverage
//!
//! - Gauss-Newton, dogleg, and QR-factorization variants of the trajectory
//! - Factor removal and replacement after the fact
//! - Constrained elimination orderings
//! - Deep copy isolation
//! - Per-clique and global gradient bookkeeping

use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_4, PI};

use nalgebra::Vector2;
use trellis_isam::{
    BearingRangeFactor, BetweenFactor, DiagonalNoise, DoglegParams, Factor,
    Factorization, FactorStore, GaussNewtonParams, GaussianFactor, Isam, IsamParams,
    Key, OptimizationParams, PriorFactor, SE2, UpdateResult, Value, Values,
    VectorValues, eliminate_sequential,
};

const TOL: f64 = 1e-4;

fn odo_noise() -> DiagonalNoise {
    DiagonalNoise::from_sigmas(&[0.1, 0.1, PI / 100.0])
}

fn br_noise() -> DiagonalNoise {
    DiagonalNoise::from_sigmas(&[PI / 100.0, 0.1])
}

fn pose(x: f64, y: f64, theta: f64) -> Value {
    Value::Pose2(SE2::from_xy_angle(x, y, theta))
}

fn point(x: f64, y: f64) -> Value {
    Value::Point2(Vector2::new(x, y))
}

fn odometry(from: Key) -> Factor {
    Factor::Between(BetweenFactor::new(
        from,
        from + 1,
        SE2::from_xy_angle(1.0, 0.0, 0.0),
        odo_noise(),
    ))
}

fn bearing_range(pose_key: Key, landmark: Key, bearing: f64, range: f64) -> Factor {
    Factor::BearingRange(BearingRangeFactor::new(
        pose_key, landmark, bearing, range,
        br_noise(),
    ))
}

fn gauss_newton_params(factorization: Factorization) -> IsamParams {
    IsamParams::new(
        OptimizationParams::GaussNewton(GaussNewtonParams::new(0.001)),
        0.0,
        0,
        false,
        false,
        factorization,
    )
}

fn dogleg_params(factorization: Factorization) -> IsamParams {
    IsamParams::new(
        OptimizationParams::Dogleg(DoglegParams::new(1.0)),
        0.0,
        0,
        false,
        false,
        factorization,
    )
}

/// Solve the full graph in one shot at the accumulated initial values, under
/// the engine's current ordering, and retract once.
fn batch_estimate(fullgraph: &[Factor], fullinit: &Values, isam: &Isam) -> Values {
    let ordering = isam.ordering();
    let linearized: Vec<GaussianFactor> = fullgraph
        .iter()
        .map(|factor| {
            GaussianFactor::Jacobian(factor.linearize(fullinit, ordering).unwrap())
        })
        .collect();
    let order: Vec<usize> = (0..ordering.len()).collect();
    let result =
        eliminate_sequential(linearized, &order, isam.params().factorization).unwrap();
    let solution = result.bayes_net.optimize().unwrap();

    let mut delta = VectorValues::new();
    for index in 0..ordering.len() {
        delta.push(solution[&index].clone());
    }
    fullinit.retract(&delta, ordering).unwrap()
}

fn values_close(a: &Values, b: &Values, tol: f64) -> bool {
    a.len() == b.len()
        && a.iter().all(|(key, value)| {
            b.get(key)
                .map(|other| value.local_coordinates(other).unwrap().norm() < tol)
                .unwrap_or(false)
        })
}

fn isam_check(fullgraph: &[Factor], fullinit: &Values, isam: &Isam) -> bool {
    let expected = batch_estimate(fullgraph, fullinit, isam);
    let actual = isam.calculate_estimate().unwrap();
    values_close(&expected, &actual, TOL)
}

/// Per-clique and global gradient bookkeeping: every clique's cached
/// gradient contribution equals the gradient of its conditional viewed as a
/// plain factor, and their scatter-sum equals the engine's gradient at zero.
fn check_gradients(isam: &Isam) {
    let actual = isam.gradient_at_zero();
    let mut expected = actual.zeros_like();

    for clique in isam.nodes() {
        let node = clique.borrow();
        let factor_form = node.conditional().to_jacobian_factor();
        let per_variable = factor_form.gradient_at_zero();
        let contribution = node.gradient_contribution();

        let mut position = 0;
        for (key, gradient) in &per_variable {
            for row in 0..gradient.len() {
                assert!(
                    (contribution[position + row] - gradient[row]).abs() < 1e-9,
                    "clique gradient mismatch at variable {}",
                    key
                );
            }
            position += gradient.len();

            let mut slot = expected.row(*key).clone();
            slot += gradient;
            expected.set_row(*key, slot);
        }
        assert_eq!(position, contribution.len());
    }

    for index in 0..actual.len() {
        let difference = actual.row(index) - expected.row(index);
        assert!(
            difference.amax() < 1e-9,
            "global gradient mismatch at index {}",
            index
        );
    }
}

struct Scenario<'a> {
    isam: Isam,
    fullgraph: Vec<Factor>,
    fullinit: Values,
    constrained: Option<&'a HashMap<Key, u32>>,
    check_each: bool,
}

impl<'a> Scenario<'a> {
    fn new(params: IsamParams) -> Self {
        Scenario {
            isam: Isam::new(params),
            fullgraph: Vec::new(),
            fullinit: Values::new(),
            constrained: None,
            check_each: false,
        }
    }

    fn update(
        &mut self,
        factors: Vec<Factor>,
        init: Values,
        constrained_active: bool,
    ) -> UpdateResult {
        let result = match self.constrained {
            Some(constrained) if constrained_active => self
                .isam
                .update_full(factors, init, &[], constrained)
                .unwrap(),
            _ => self.isam.update(factors, init).unwrap(),
        };
        if self.check_each {
            assert!(
                isam_check(&self.fullgraph, &self.fullinit, &self.isam),
                "incremental and batch estimates diverged"
            );
        }
        result
    }

    fn insert_init(&mut self, init: &mut Values, key: Key, value: Value) {
        init.insert(key, value.clone()).unwrap();
        self.fullinit.insert(key, value).unwrap();
    }

    /// The trajectory through pose x10: prior, five odometry steps, the
    /// first landmark sightings at x5, four more odometry steps.
    fn build_prefix(&mut self) {
        // Prior at time 0
        let prior = Factor::Prior(PriorFactor::new(0, pose(0.0, 0.0, 0.0), odo_noise()));
        self.fullgraph.push(prior.clone());
        let mut init = Values::new();
        self.insert_init(&mut init, 0, pose(0.01, 0.01, 0.01));
        self.update(vec![prior], init, false);

        // Odometry from time 0 to time 5
        for i in 0..5u64 {
            let odo = odometry(i);
            self.fullgraph.push(odo.clone());
            let mut init = Values::new();
            self.insert_init(&mut init, i + 1, pose(i as f64 + 1.1, -0.1, 0.01));
            self.update(vec![odo], init, i >= 3);
        }

        // Odometry from time 5 to 6 and landmark measurements at time 5
        let odo = odometry(5);
        let l100 = bearing_range(5, 100, FRAC_PI_4, 5.0);
        let l101 = bearing_range(5, 101, -FRAC_PI_4, 5.0);
        self.fullgraph.push(odo.clone());
        self.fullgraph.push(l100.clone());
        self.fullgraph.push(l101.clone());
        let mut init = Values::new();
        self.insert_init(&mut init, 6, pose(1.01, 0.01, 0.01));
        self.insert_init(&mut init, 100, point(5.0 / 2f64.sqrt(), 5.0 / 2f64.sqrt()));
        self.insert_init(&mut init, 101, point(5.0 / 2f64.sqrt(), -5.0 / 2f64.sqrt()));
        self.update(vec![odo, l100, l101], init, true);

        // Odometry from time 6 to time 10
        for i in 6..10u64 {
            let odo = odometry(i);
            self.fullgraph.push(odo.clone());
            let mut init = Values::new();
            self.insert_init(&mut init, i + 1, pose(i as f64 + 1.1, -0.1, 0.01));
            self.update(vec![odo], init, true);
        }
    }

    /// The final step: odometry to x11 and the second landmark sightings.
    fn final_step(&mut self) -> UpdateResult {
        let odo = odometry(10);
        let l100 = bearing_range(10, 100, FRAC_PI_4 + PI / 16.0, 4.5);
        let l101 = bearing_range(10, 101, -FRAC_PI_4 + PI / 16.0, 4.5);
        self.fullgraph.push(odo.clone());
        self.fullgraph.push(l100.clone());
        self.fullgraph.push(l101.clone());
        let mut init = Values::new();
        self.insert_init(&mut init, 11, pose(6.9, 0.1, 0.01));
        self.update(vec![odo, l100, l101], init, true)
    }

    fn build(&mut self) {
        self.build_prefix();
        self.final_step();
    }
}

/// Live factors in slot order, for graph comparison after removals.
fn live_factors(store: &FactorStore) -> Vec<Factor> {
    store.iter_live().map(|(_, factor)| factor.clone()).collect()
}

#[test]
fn slamlike_solution_gauss_newton() {
    let mut scenario = Scenario::new(gauss_newton_params(Factorization::Cholesky));
    scenario.check_each = true;
    scenario.build();

    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));
    check_gradients(&scenario.isam);
}

#[test]
fn slamlike_solution_dogleg() {
    let mut scenario = Scenario::new(dogleg_params(Factorization::Cholesky));
    scenario.build_prefix();
    scenario.final_step();

    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));
    check_gradients(&scenario.isam);
}

#[test]
fn slamlike_solution_gauss_newton_qr() {
    let mut scenario = Scenario::new(gauss_newton_params(Factorization::QR));
    scenario.check_each = true;
    scenario.build();

    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));
    check_gradients(&scenario.isam);
}

#[test]
fn slamlike_solution_dogleg_qr() {
    let mut scenario = Scenario::new(dogleg_params(Factorization::QR));
    scenario.build();

    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));
    check_gradients(&scenario.isam);
}

/// Insert the second sighting of landmark 100 and then retire it again; the
/// estimate must match a batch reference that never saw it.
#[test]
fn remove_factor() {
    let mut scenario = Scenario::new(gauss_newton_params(Factorization::Cholesky));
    scenario.build_prefix();

    let odo = odometry(10);
    let l100 = bearing_range(10, 100, FRAC_PI_4 + PI / 16.0, 4.5);
    let l101 = bearing_range(10, 101, -FRAC_PI_4 + PI / 16.0, 4.5);
    // The reference graph keeps only the odometry and the landmark-101
    // measurement
    scenario.fullgraph.push(odo.clone());
    scenario.fullgraph.push(l101.clone());
    let mut init = Values::new();
    scenario
        .fullinit
        .insert(11, pose(6.9, 0.1, 0.01))
        .unwrap();
    init.insert(11, pose(6.9, 0.1, 0.01)).unwrap();

    let result = scenario
        .isam
        .update(vec![odo, l100, l101], init)
        .unwrap();
    let slot_to_remove = result.new_factor_indices[1];
    assert_eq!(slot_to_remove, scenario.isam.factors().num_slots() - 2);

    let removal = scenario
        .isam
        .update_full(Vec::new(), Values::new(), &[slot_to_remove], &HashMap::new())
        .unwrap();
    assert!(removal.variables_reeliminated > 0);

    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));
    check_gradients(&scenario.isam);
}

/// Replace the second sighting of landmark 100 (range 4.5) with a different
/// measurement (range 5.0) in a single update that both inserts and removes.
#[test]
fn swap_factor() {
    let mut scenario = Scenario::new(gauss_newton_params(Factorization::Cholesky));
    scenario.build();

    let swap_slot = scenario.isam.factors().num_slots() - 2;
    scenario.fullgraph.remove(swap_slot);
    let replacement = bearing_range(10, 100, FRAC_PI_4 + PI / 16.0, 5.0);
    scenario.fullgraph.push(replacement.clone());

    scenario
        .isam
        .update_full(
            vec![replacement],
            Values::new(),
            &[swap_slot],
            &HashMap::new(),
        )
        .unwrap();

    assert_eq!(live_factors(scenario.isam.factors()), scenario.fullgraph);
    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));
    check_gradients(&scenario.isam);
}

/// Keys constrained to the end of the ordering stay there: x3 (group 1) and
/// x4 (group 2) take the two highest indices, x4 last.
#[test]
fn constrained_ordering() {
    let constrained: HashMap<Key, u32> = HashMap::from([(3, 1), (4, 2)]);
    let mut scenario = Scenario::new(gauss_newton_params(Factorization::Cholesky));
    scenario.constrained = Some(&constrained);
    scenario.check_each = true;
    scenario.build();

    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));

    let n = scenario.isam.ordering().len();
    assert_eq!(scenario.isam.ordering().at(3).unwrap(), n - 2);
    assert_eq!(scenario.isam.ordering().at(4).unwrap(), n - 1);

    check_gradients(&scenario.isam);
}

/// An update containing only removals still re-eliminates the cliques the
/// removed factor touched.
#[test]
fn removal_only_update() {
    let mut scenario = Scenario::new(gauss_newton_params(Factorization::Cholesky));
    scenario.build();

    // Retire the final landmark-101 measurement (last slot assigned)
    let slot = scenario.isam.factors().num_slots() - 1;
    scenario.fullgraph.pop();
    let result = scenario
        .isam
        .update_full(Vec::new(), Values::new(), &[slot], &HashMap::new())
        .unwrap();
    assert!(result.variables_reeliminated > 0);

    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));
}

/// Deep copies are isolated: mutating the original afterwards leaves the
/// copy equal to a fresh engine built from the same history.
#[test]
fn clone_isolation() {
    fn create_slamlike() -> Scenario<'static> {
        let mut scenario = Scenario::new(IsamParams::new(
            OptimizationParams::GaussNewton(GaussNewtonParams::new(0.001)),
            0.0,
            0,
            false,
            true,
            Factorization::Cholesky,
        ));
        scenario.build();
        scenario
    }

    let mut scenario = create_slamlike();
    let snapshot = scenario.isam.clone();

    // Mutate the original with a loop-closure-style factor between the
    // current estimates of x0 and x10
    let pose0 = *scenario
        .isam
        .calculate_estimate_of(0)
        .unwrap()
        .as_pose2()
        .unwrap();
    let pose10 = *scenario
        .isam
        .calculate_estimate_of(10)
        .unwrap()
        .as_pose2()
        .unwrap();
    let closure = Factor::Between(BetweenFactor::new(
        0,
        10,
        pose0.between(&pose10, None, None),
        DiagonalNoise::unit(3),
    ));
    scenario.isam.update(vec![closure], Values::new()).unwrap();

    let fresh = create_slamlike();
    assert!(snapshot == fresh.isam, "copy was disturbed by the original");
    assert!(snapshot != scenario.isam);

    // A copy of an engine that has received no updates equals a fresh one
    let empty = Isam::default();
    let empty_copy = empty.clone();
    assert!(empty_copy == Isam::default());
}

/// An empty update is a no-op and preserves every invariant.
#[test]
fn empty_update_preserves_state() {
    let mut scenario = Scenario::new(gauss_newton_params(Factorization::Cholesky));
    scenario.build();

    let before = scenario.isam.clone();
    let result = scenario.isam.update(Vec::new(), Values::new()).unwrap();
    assert_eq!(result.variables_reeliminated, 0);
    assert_eq!(result.factors_recalculated, 0);
    assert!(scenario.isam == before);
    assert!(isam_check(
        &scenario.fullgraph,
        &scenario.fullinit,
        &scenario.isam
    ));
}
