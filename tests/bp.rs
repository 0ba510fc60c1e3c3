use std::sync::Arc;

use ndarray::{array, Array2};
use ndarray_rand::rand_distr::Gumbel;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use fgmax::{
    build_inferer, compute_energy, decode_map_states, get_marginals, Backend, BpOptions, Config,
    EnumeratedPotentials, FactorGraph, InferError, InitUpdates, PairwisePotentials,
};

/// Two binary variables with one attractive pairwise factor. BP at
/// temperature 0 on a tree is exact, so the decoding must match the
/// brute-force maximum and the energy its (negated) value.
#[test]
fn two_variable_chain_max_product() {
    for (ev_a, ev_b) in [([0.1, 0.0], [0.0, 0.2]), ([0.1, 0.0], [0.2, 0.0])] {
        let mut b = FactorGraph::builder();
        let va = b.add_var_group("a", 1, 2).unwrap();
        let vb = b.add_var_group("b", 1, 2).unwrap();
        let lp = array![[1.0, -1.0], [-1.0, 1.0]];
        b.add_pairwise_group(
            "coupling",
            vec![[va.var(0), vb.var(0)]],
            PairwisePotentials::Shared(lp.clone()),
        )
        .unwrap();
        let graph = Arc::new(b.build());
        let inferer = build_inferer(&graph, Backend::Bp);
        let mut updates = InitUpdates::default();
        updates
            .evidence
            .insert("a".into(), Array2::from_shape_vec((1, 2), ev_a.to_vec()).unwrap());
        updates
            .evidence
            .insert("b".into(), Array2::from_shape_vec((1, 2), ev_b.to_vec()).unwrap());
        let mut st = inferer.init(&updates).unwrap();
        inferer.run_bp(&mut st, &BpOptions::new(5), &Config::no_progress()).unwrap();
        let map = decode_map_states(&inferer.get_beliefs(&st));

        // brute force over the four joint configurations
        let mut best = (0usize, 0usize);
        let mut best_val = f64::NEG_INFINITY;
        for xa in 0..2 {
            for xb in 0..2 {
                let val = ev_a[xa] + ev_b[xb] + lp[(xa, xb)];
                if val > best_val {
                    best_val = val;
                    best = (xa, xb);
                }
            }
        }
        assert_eq!(map["a"][0] as usize, best.0);
        assert_eq!(map["b"][0] as usize, best.1);
        let energy = compute_energy(&st, &map).unwrap();
        assert!((energy + best_val).abs() < 1e-9);
    }
}

/// Adding a constant to one v2f message must not change any argmax
/// belief: messages are equivalence classes modulo an additive constant.
#[test]
fn v2f_translation_leaves_decoding_unchanged() {
    let mut b = FactorGraph::builder();
    let v = b.add_var_group("v", 3, 2).unwrap();
    b.add_pairwise_group(
        "chain",
        vec![[v.var(0), v.var(1)], [v.var(1), v.var(2)]],
        PairwisePotentials::Shared(array![[0.7, -0.4], [-0.4, 0.9]]),
    )
    .unwrap();
    let graph = Arc::new(b.build());
    let inferer = build_inferer(&graph, Backend::Bp);
    let mut updates = InitUpdates::default();
    updates
        .evidence
        .insert("v".into(), array![[0.3, -0.1], [0.0, 0.05], [-0.2, 0.4]]);
    let mut st = inferer.init(&updates).unwrap();
    inferer.run_bp(&mut st, &BpOptions::new(3), &Config::no_progress()).unwrap();

    let mut st2 = st.clone();
    let shifted: Vec<f64> = st2
        .v2f_msg("chain", 0, 0)
        .unwrap()
        .iter()
        .map(|x| x + 3.7)
        .collect();
    st2.set_v2f_msg("chain", 0, 0, &shifted).unwrap();
    st.propagate_factors(0.0, 0.0);
    st2.propagate_factors(0.0, 0.0);
    let map1 = decode_map_states(&inferer.get_beliefs(&st));
    let map2 = decode_map_states(&inferer.get_beliefs(&st2));
    assert_eq!(map1, map2);
}

/// A symmetric pairwise potential with equal evidence on both variables
/// keeps the two beliefs identical at every iteration.
#[test]
fn pairwise_symmetry() {
    for temperature in [0.0, 1.0] {
        for iters in 1..5u32 {
            let mut b = FactorGraph::builder();
            let v = b.add_var_group("v", 2, 2).unwrap();
            b.add_pairwise_group(
                "sym",
                vec![[v.var(0), v.var(1)]],
                PairwisePotentials::Shared(array![[0.8, -0.2], [-0.2, 0.3]]),
            )
            .unwrap();
            let graph = Arc::new(b.build());
            let inferer = build_inferer(&graph, Backend::Bp);
            let mut updates = InitUpdates::default();
            updates
                .evidence
                .insert("v".into(), array![[0.4, -0.1], [0.4, -0.1]]);
            let mut st = inferer.init(&updates).unwrap();
            inferer
                .run_bp(
                    &mut st,
                    &BpOptions::new(iters).temperature(temperature),
                    &Config::no_progress(),
                )
                .unwrap();
            let beliefs = inferer.get_beliefs(&st);
            let arr = &beliefs["v"];
            for x in 0..2 {
                assert!(
                    (arr[(0, x)] - arr[(1, x)]).abs() < 1e-12,
                    "iters={iters} T={temperature}"
                );
            }
        }
    }
}

/// One sum-product iteration on a single-factor tree yields exact
/// marginals. Exercises the enumerated kernel's log-sum-exp reduction
/// with heterogeneous state counts.
#[test]
fn sum_product_on_tree_is_exact() {
    let ks = [2usize, 3, 2];
    let mut b = FactorGraph::builder();
    let va = b.add_var_group("a", 1, 2).unwrap();
    let vb = b.add_var_group("b", 1, 3).unwrap();
    let vc = b.add_var_group("c", 1, 2).unwrap();

    // full Cartesian configuration table
    let n_configs = ks.iter().product::<usize>();
    let mut configs = Array2::zeros((n_configs, 3));
    let mut rng = StdRng::seed_from_u64(7);
    let potentials =
        ndarray::Array1::random_using(n_configs, Gumbel::new(0.0, 1.0).unwrap(), &mut rng);
    for (ci, mut row) in configs.outer_iter_mut().enumerate() {
        let mut rest = ci;
        for (s, &k) in ks.iter().enumerate().rev() {
            row[s] = (rest % k) as u32;
            rest /= k;
        }
    }
    b.add_enumerated_group(
        "joint",
        vec![vec![va.var(0), vb.var(0), vc.var(0)]],
        configs.clone(),
        EnumeratedPotentials::Shared(potentials.clone()),
    )
    .unwrap();
    let graph = Arc::new(b.build());
    let inferer = build_inferer(&graph, Backend::Bp);

    let ev: Vec<Array2<f64>> = ks
        .iter()
        .map(|&k| Array2::random_using((1, k), Gumbel::new(0.0, 1.0).unwrap(), &mut rng))
        .collect();
    let mut updates = InitUpdates::default();
    for (name, e) in ["a", "b", "c"].iter().zip(&ev) {
        updates.evidence.insert((*name).into(), e.clone());
    }
    let mut st = inferer.init(&updates).unwrap();
    inferer
        .run_bp(&mut st, &BpOptions::new(1).temperature(1.0), &Config::no_progress())
        .unwrap();
    let marginals = get_marginals(&inferer.get_beliefs(&st), 1.0);

    // brute-force joint distribution
    let mut joint = vec![0.0f64; n_configs];
    for (ci, cfg) in configs.outer_iter().enumerate() {
        let mut lv = potentials[ci];
        for (s, &x) in cfg.iter().enumerate() {
            lv += ev[s][(0, x as usize)];
        }
        joint[ci] = lv;
    }
    let m = joint.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let z: f64 = joint.iter().map(|&v| (v - m).exp()).sum();
    for (s, name) in ["a", "b", "c"].iter().enumerate() {
        for x in 0..ks[s] {
            let mut p = 0.0;
            for (ci, cfg) in configs.outer_iter().enumerate() {
                if cfg[s] as usize == x {
                    p += (joint[ci] - m).exp() / z;
                }
            }
            assert!(
                (marginals[*name][(0, x)] - p).abs() < 1e-9,
                "{name} state {x}: {} vs {p}",
                marginals[*name][(0, x)]
            );
        }
    }
}

fn toroidal_ising(n: usize, coupling: f64) -> (Arc<FactorGraph>, fgmax::VarGroupId) {
    let mut b = FactorGraph::builder();
    let spins = b.add_var_group("spins", n * n, 2).unwrap();
    let at = |i: usize, j: usize| spins.var((i % n) * n + (j % n));
    let mut pairs = Vec::with_capacity(2 * n * n);
    for i in 0..n {
        for j in 0..n {
            pairs.push([at(i, j), at(i, j + 1)]);
            pairs.push([at(i, j), at(i + 1, j)]);
        }
    }
    let lp = array![[coupling, -coupling], [-coupling, coupling]];
    b.add_pairwise_group("couplings", pairs, PairwisePotentials::Shared(lp))
        .unwrap();
    (Arc::new(b.build()), spins)
}

/// Identical inputs produce byte-identical message arenas, independently
/// of rayon's scheduling.
#[test]
fn deterministic_reruns() {
    let (graph, _) = toroidal_ising(8, 0.8);
    let inferer = build_inferer(&graph, Backend::Bp);
    let mut rng = StdRng::seed_from_u64(3);
    let mut updates = InitUpdates::default();
    updates.evidence.insert(
        "spins".into(),
        Array2::random_using((64, 2), Gumbel::new(0.0, 1.0).unwrap(), &mut rng),
    );
    let run = |updates: &InitUpdates| {
        let mut st = inferer.init(updates).unwrap();
        inferer
            .run_bp(
                &mut st,
                &BpOptions::new(20).temperature(0.3).damping(0.4),
                &Config::no_progress(),
            )
            .unwrap();
        st
    };
    let st1 = run(&updates);
    let st2 = run(&updates);
    for f in 0..128 {
        for s in 0..2 {
            assert_eq!(
                st1.f2v_msg("couplings", f, s).unwrap(),
                st2.f2v_msg("couplings", f, s).unwrap()
            );
            assert_eq!(
                st1.v2f_msg("couplings", f, s).unwrap(),
                st2.v2f_msg("couplings", f, s).unwrap()
            );
        }
    }
}

/// Fully frustrated 4-clique: synchronous BP without damping oscillates,
/// damping 0.5 settles it.
#[test]
fn damping_stabilizes_frustrated_clique() {
    let build = || {
        let mut b = FactorGraph::builder();
        let v = b.add_var_group("v", 4, 2).unwrap();
        let mut pairs = Vec::new();
        for i in 0..4 {
            for j in (i + 1)..4 {
                pairs.push([v.var(i), v.var(j)]);
            }
        }
        // antiferromagnetic couplings: no assignment satisfies a clique
        let lp = array![[-1.5, 1.5], [1.5, -1.5]];
        b.add_pairwise_group("clique", pairs, PairwisePotentials::Shared(lp))
            .unwrap();
        Arc::new(b.build())
    };
    let graph = build();
    let inferer = build_inferer(&graph, Backend::Bp);
    let mut rng = StdRng::seed_from_u64(11);
    let mut updates = InitUpdates::default();
    updates.evidence.insert(
        "v".into(),
        Array2::random_using((4, 2), Gumbel::new(0.0, 0.3).unwrap(), &mut rng),
    );

    let belief_changes = |damping: f64, warmup: u32, probes: u32| -> Vec<f64> {
        let mut st = inferer.init(&updates).unwrap();
        let opts = BpOptions::new(warmup).temperature(1.0).damping(damping);
        inferer.run_bp(&mut st, &opts, &Config::no_progress()).unwrap();
        let one = BpOptions::new(1).temperature(1.0).damping(damping);
        let mut prev = inferer.get_beliefs(&st);
        let mut changes = Vec::new();
        for _ in 0..probes {
            inferer.run_bp(&mut st, &one, &Config::no_progress()).unwrap();
            let cur = inferer.get_beliefs(&st);
            let mut linf = 0.0f64;
            // compare normalized marginals so additive shifts don't count
            let (p, q) = (get_marginals(&cur, 1.0), get_marginals(&prev, 1.0));
            for (a, b) in p["v"].iter().zip(q["v"].iter()) {
                linf = linf.max((a - b).abs());
            }
            prev = cur;
            changes.push(linf);
        }
        changes
    };

    let undamped = belief_changes(0.0, 60, 10);
    let max_undamped = undamped.iter().cloned().fold(0.0f64, f64::max);
    assert!(
        max_undamped > 0.1,
        "expected oscillation, max change {max_undamped}"
    );
    let damped = belief_changes(0.5, 300, 3);
    let max_damped = damped.iter().cloned().fold(0.0f64, f64::max);
    assert!(max_damped < 1e-3, "expected convergence, got {max_damped}");
}

/// Variables outside every factor are legal; their belief is their
/// evidence. Empty factor groups are skipped.
#[test]
fn unreferenced_variables_and_empty_groups() {
    let mut b = FactorGraph::builder();
    let v = b.add_var_group("v", 3, 2).unwrap();
    b.add_pairwise_group(
        "pair",
        vec![[v.var(0), v.var(1)]],
        PairwisePotentials::Shared(array![[0.5, 0.0], [0.0, 0.5]]),
    )
    .unwrap();
    b.add_pairwise_group(
        "empty",
        vec![],
        PairwisePotentials::Shared(array![[0.0, 0.0], [0.0, 0.0]]),
    )
    .unwrap();
    let graph = Arc::new(b.build());
    let inferer = build_inferer(&graph, Backend::Bp);
    let mut updates = InitUpdates::default();
    updates
        .evidence
        .insert("v".into(), array![[0.0, 0.1], [0.2, 0.0], [-0.4, 0.9]]);
    let mut st = inferer.init(&updates).unwrap();
    inferer
        .run_bp(&mut st, &BpOptions::new(4).temperature(0.7), &Config::no_progress())
        .unwrap();
    let beliefs = inferer.get_beliefs(&st);
    // var 2 touches no factor
    assert_eq!(beliefs["v"][(2, 0)], -0.4);
    assert_eq!(beliefs["v"][(2, 1)], 0.9);
}

#[test]
fn run_and_init_validation() {
    let mut b = FactorGraph::builder();
    let v = b.add_var_group("v", 2, 2).unwrap();
    b.add_pairwise_group(
        "pair",
        vec![[v.var(0), v.var(1)]],
        PairwisePotentials::Shared(array![[0.5, 0.0], [0.0, 0.5]]),
    )
    .unwrap();
    let graph = Arc::new(b.build());
    let inferer = build_inferer(&graph, Backend::Bp);
    let st = inferer.init(&InitUpdates::default()).unwrap();

    let mut bad_shape = InitUpdates::default();
    bad_shape.evidence.insert("v".into(), array![[0.0, 0.0]]);
    assert!(matches!(
        inferer.init(&bad_shape),
        Err(InferError::ShapeError { .. })
    ));

    let mut unknown = InitUpdates::default();
    unknown.evidence.insert("w".into(), array![[0.0, 0.0]]);
    assert!(matches!(
        inferer.init(&unknown),
        Err(InferError::UnknownVarGroup(_))
    ));

    let mut st2 = st.clone();
    assert!(matches!(
        inferer.run_bp(&mut st2, &BpOptions::new(1).temperature(-1.0), &Config::no_progress()),
        Err(InferError::BadTemperature(_))
    ));
    assert!(matches!(
        inferer.run_bp(&mut st2, &BpOptions::new(1).damping(1.0), &Config::no_progress()),
        Err(InferError::BadDamping(_))
    ));
    assert!(matches!(
        inferer.get_primal_upper_bound(&st2),
        Err(InferError::WrongBackend(_))
    ));
}
