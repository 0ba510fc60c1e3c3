use std::sync::Arc;

use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::{Gumbel, Normal};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fgmax::{
    build_inferer, compute_energy, compute_energy_debug, decode_map_states, Backend, BpOptions,
    Config, EnumeratedPotentials, FactorGraph, InitUpdates, VarRef,
};

/// All `(parents..., child)` rows with `child = OR(parents)` (or AND).
fn logical_configs(n: usize, and: bool) -> Array2<u32> {
    let mut rows = Vec::new();
    for bits in 0..(1u32 << n) {
        let parents: Vec<u32> = (0..n).map(|i| (bits >> i) & 1).collect();
        let child = if and {
            parents.iter().all(|&p| p == 1) as u32
        } else {
            parents.iter().any(|&p| p == 1) as u32
        };
        rows.extend_from_slice(&parents);
        rows.push(child);
    }
    Array2::from_shape_vec((1 << n, n + 1), rows).unwrap()
}

/// A single logical factor next to its enumerated-table twin: beliefs
/// must agree for every parent count and temperature.
#[test]
fn logical_kernels_match_enumeration() {
    for and in [false, true] {
        for n in 1..=4usize {
            for temperature in [0.0, 0.001, 0.2, 1.0] {
                let mut rng = StdRng::seed_from_u64(1000 + n as u64 + and as u64);
                let ev_p =
                    Array2::random_using((n, 2), Gumbel::new(0.0, 1.0).unwrap(), &mut rng);
                let ev_c = Array2::random_using((1, 2), Gumbel::new(0.0, 1.0).unwrap(), &mut rng);
                let seed_p =
                    Array2::random_using((n, 2), Normal::new(0.0, 1.0).unwrap(), &mut rng);
                let seed_c =
                    Array2::random_using((1, 2), Normal::new(0.0, 1.0).unwrap(), &mut rng);

                let build = |enumerated: bool| {
                    let mut b = FactorGraph::builder();
                    let p = b.add_var_group("parents", n, 2).unwrap();
                    let c = b.add_var_group("child", 1, 2).unwrap();
                    let mut vars: Vec<VarRef> = (0..n).map(|i| p.var(i)).collect();
                    vars.push(c.var(0));
                    if enumerated {
                        b.add_enumerated_group(
                            "factor",
                            vec![vars],
                            logical_configs(n, and),
                            EnumeratedPotentials::Shared(Array1::zeros(1 << n)),
                        )
                        .unwrap();
                    } else if and {
                        b.add_and_group("factor", vec![vars]).unwrap();
                    } else {
                        b.add_or_group("factor", vec![vars]).unwrap();
                    }
                    Arc::new(b.build())
                };

                let mut beliefs = Vec::new();
                for enumerated in [false, true] {
                    let graph = build(enumerated);
                    let inferer = build_inferer(&graph, Backend::Bp);
                    let mut updates = InitUpdates::default();
                    updates.evidence.insert("parents".into(), ev_p.clone());
                    updates.evidence.insert("child".into(), ev_c.clone());
                    updates.f2v_msgs.insert("parents".into(), seed_p.clone());
                    updates.f2v_msgs.insert("child".into(), seed_c.clone());
                    let mut st = inferer.init(&updates).unwrap();
                    inferer
                        .run_bp(
                            &mut st,
                            &BpOptions::new(5).temperature(temperature),
                            &Config::no_progress(),
                        )
                        .unwrap();
                    beliefs.push(inferer.get_beliefs(&st));
                }
                for group in ["parents", "child"] {
                    for (x, y) in beliefs[0][group].iter().zip(beliefs[1][group].iter()) {
                        assert!(
                            (x - y).abs() < 1e-5,
                            "and={and} n={n} T={temperature} {group}: {x} vs {y}"
                        );
                    }
                }
            }
        }
    }
}

/// Fixed 3-parent OR instance, messages compared against the explicit
/// enumeration: with parent differences d = [0, 1, -0.5] the child-on
/// mass is 1 and the leave-one-out masses follow.
#[test]
fn or_factor_messages() {
    let mut b = FactorGraph::builder();
    let p = b.add_var_group("parents", 3, 2).unwrap();
    let c = b.add_var_group("child", 1, 2).unwrap();
    b.add_or_group("or", vec![vec![p.var(0), p.var(1), p.var(2), c.var(0)]])
        .unwrap();
    let graph = Arc::new(b.build());
    let inferer = build_inferer(&graph, Backend::Bp);
    let mut st = inferer.init(&InitUpdates::default()).unwrap();
    let incoming: [&[f64]; 4] = [&[0.0, 0.0], &[0.0, 1.0], &[0.0, -0.5], &[0.0, 0.0]];
    for (slot, msg) in incoming.iter().enumerate() {
        st.set_v2f_msg("or", 0, slot, msg).unwrap();
    }
    st.propagate_factors(0.0, 0.0);

    // brute enumeration over the 16 configurations of (parents, child)
    let mut expected = vec![[f64::NEG_INFINITY; 2]; 4];
    for bits in 0..16u32 {
        let cfg: Vec<usize> = (0..4).map(|i| ((bits >> i) & 1) as usize).collect();
        let valid = (cfg[3] == 1) == cfg[..3].iter().any(|&x| x == 1);
        if !valid {
            continue;
        }
        let score: f64 = (0..4).map(|s| incoming[s][cfg[s]]).sum();
        for s in 0..4 {
            let extrinsic = score - incoming[s][cfg[s]];
            if extrinsic > expected[s][cfg[s]] {
                expected[s][cfg[s]] = extrinsic;
            }
        }
    }
    for s in 0..4 {
        let got = st.f2v_msg("or", 0, s).unwrap();
        for x in 0..2 {
            assert!(
                (got[x] - expected[s][x]).abs() < 1e-6,
                "slot {s} state {x}: {} vs {}",
                got[x],
                expected[s][x]
            );
        }
    }
    // spot-check the closed-form values for this instance
    assert!((st.f2v_msg("or", 0, 3).unwrap()[1] - 1.0).abs() < 1e-6);
    assert!((st.f2v_msg("or", 0, 0).unwrap()[0] - 1.0).abs() < 1e-6);
    assert!(st.f2v_msg("or", 0, 1).unwrap()[1].abs() < 1e-6);
}

/// AND-factor stress test: two graphs over the same variables, one
/// holding each factor as an enumerated table where the other holds it
/// as an AND factor. Beliefs, decodings and energies must agree at
/// every temperature.
#[test]
fn mixed_and_graphs_agree() {
    for (seed, temperature, atol) in [
        (0u64, 0.0, 1e-5),
        (1, 0.001, 5e-3),
        (2, 0.1, 5e-3),
        (3, 1.0, 1e-5),
    ] {
        let mut rng = StdRng::seed_from_u64(seed);
        let num_factors = rng.gen_range(6..12);
        let num_parents: Vec<usize> = (0..num_factors).map(|_| rng.gen_range(1..6)).collect();
        let total_parents: usize = num_parents.iter().sum();

        let factor_vars = |p: fgmax::VarGroupId, c: fgmax::VarGroupId| {
            let mut out = Vec::new();
            let mut off = 0;
            for (f, &np) in num_parents.iter().enumerate() {
                let mut vars: Vec<VarRef> = (0..np).map(|i| p.var(off + i)).collect();
                vars.push(c.var(f));
                out.push(vars);
                off += np;
            }
            out
        };

        // graph 1: first half enumerated, second half AND; graph 2 swapped
        let build = |first_half_enum: bool| {
            let mut b = FactorGraph::builder();
            let p = b.add_var_group("parents", total_parents, 2).unwrap();
            let c = b.add_var_group("children", num_factors, 2).unwrap();
            let vars = factor_vars(p, c);
            let half = num_factors / 2;
            let mut enum_sel = Vec::new();
            let mut and_sel = Vec::new();
            for (f, v) in vars.into_iter().enumerate() {
                if (f < half) == first_half_enum {
                    enum_sel.push(v);
                } else {
                    and_sel.push(v);
                }
            }
            // enumerated twins are grouped by parent count
            let mut by_arity: std::collections::BTreeMap<usize, Vec<Vec<VarRef>>> =
                Default::default();
            for v in enum_sel {
                by_arity.entry(v.len() - 1).or_default().push(v);
            }
            for (np, group_vars) in by_arity {
                b.add_enumerated_group(
                    format!("enum_{np}"),
                    group_vars,
                    logical_configs(np, true),
                    EnumeratedPotentials::Shared(Array1::zeros(1 << np)),
                )
                .unwrap();
            }
            b.add_and_group("ands", and_sel).unwrap();
            Arc::new(b.build())
        };

        let mut rng_ev = StdRng::seed_from_u64(seed ^ 0xabcd);
        let ev_p = Array2::random_using(
            (total_parents, 2),
            Gumbel::new(0.0, 1.0).unwrap(),
            &mut rng_ev,
        );
        let ev_c = Array2::random_using(
            (num_factors, 2),
            Gumbel::new(0.0, 1.0).unwrap(),
            &mut rng_ev,
        );
        let seed_p = Array2::random_using(
            (total_parents, 2),
            Normal::new(0.0, 1.0).unwrap(),
            &mut rng_ev,
        );
        let seed_c = Array2::random_using(
            (num_factors, 2),
            Normal::new(0.0, 1.0).unwrap(),
            &mut rng_ev,
        );

        let mut all_beliefs = Vec::new();
        let mut all_states = Vec::new();
        for first_half_enum in [true, false] {
            let graph = build(first_half_enum);
            let inferer = build_inferer(&graph, Backend::Bp);
            let mut updates = InitUpdates::default();
            updates.evidence.insert("parents".into(), ev_p.clone());
            updates.evidence.insert("children".into(), ev_c.clone());
            updates.f2v_msgs.insert("parents".into(), seed_p.clone());
            updates.f2v_msgs.insert("children".into(), seed_c.clone());
            let mut st = inferer.init(&updates).unwrap();
            inferer
                .run_bp(
                    &mut st,
                    &BpOptions::new(5).temperature(temperature),
                    &Config::no_progress(),
                )
                .unwrap();
            all_beliefs.push(inferer.get_beliefs(&st));
            all_states.push(st);
        }
        for group in ["parents", "children"] {
            for (x, y) in all_beliefs[0][group]
                .iter()
                .zip(all_beliefs[1][group].iter())
            {
                assert!(
                    (x - y).abs() < atol,
                    "seed={seed} T={temperature} {group}: {x} vs {y}"
                );
            }
        }

        // energies of the two decodings agree, as do their breakdowns
        let map1 = decode_map_states(&all_beliefs[0]);
        let map2 = decode_map_states(&all_beliefs[1]);
        let e1 = compute_energy(&all_states[0], &map1).unwrap();
        if map1 == map2 {
            // a near-tie belief may decode differently across the two
            // graphs; energies are only comparable on equal decodings
            let e2 = compute_energy(&all_states[1], &map2).unwrap();
            assert!((e1 - e2).abs() < 1e-6 || (e1 > 1e29 && e2 > 1e29));
        }
        let dbg1 = compute_energy_debug(&all_states[0], &map1).unwrap();
        assert!((dbg1.energy - e1).abs() < 1e-9);
        let var_sum: f64 = dbg1.var_energies.values().map(|a| a.sum()).sum();
        let fac_sum: f64 = dbg1.factor_energies.values().map(|a| a.sum()).sum();
        assert!((var_sum + fac_sum - e1).abs() < 1e-9);
    }
}
