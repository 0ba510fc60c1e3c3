//! Message kernels, one per factor kind, plus the type-agnostic variable
//! update and the smooth-dual gradient pass.
//!
//! All kernels operate on disjoint mutable windows of the flat arenas:
//! the caller splits a group's outgoing block into per-factor windows
//! (see [`crate::utils::partition_mut`]) and rayon iterates over them.
//! Reduction order inside a factor or variable is fixed, so results do
//! not depend on thread scheduling.

pub(crate) mod enumerated;
pub(crate) mod logical;
pub(crate) mod pairwise;

use itertools::izip;
use rayon::prelude::*;

use crate::graph::{FactorGraph, GroupKind, StateVal};
use crate::numeric;
use crate::state::{BPState, GroupPotentials};
use crate::utils::partition_mut;

/// Splits a message arena into per-edge windows, in global edge order.
fn edge_partition<'a>(graph: &FactorGraph, mut arena: &'a mut [f64]) -> Vec<&'a mut [f64]> {
    let mut parts = Vec::with_capacity(graph.edges.len());
    for ed in &graph.edges {
        let (head, rest) = std::mem::take(&mut arena).split_at_mut(ed.num_states);
        parts.push(head);
        arena = rest;
    }
    parts
}

/// `belief[v] = evidence[v] + sum of msgs over v's incident edges`,
/// in CSR order.
fn refresh_beliefs(graph: &FactorGraph, evidence: &[f64], msgs: &[f64], belief: &mut [f64]) {
    let parts = partition_mut(belief, &graph.var_states_off);
    parts.into_par_iter().enumerate().for_each(|(v, bel)| {
        let off = graph.var_states_off[v];
        bel.copy_from_slice(&evidence[off..off + bel.len()]);
        for &e in graph.var_incident(v) {
            let ed = &graph.edges[e];
            let msg = &msgs[ed.msg_off..ed.msg_off + ed.num_states];
            for (b, m) in bel.iter_mut().zip(msg) {
                *b += m;
            }
        }
    });
}

/// Variable-side update: refresh beliefs from the current f2v messages,
/// then emit the extrinsic `v2f = belief - f2v` per edge, shifted by its
/// maximum to keep message magnitudes bounded.
pub(crate) fn update_variables(graph: &FactorGraph, st: &mut BPState) {
    let BPState {
        evidence,
        belief,
        f2v,
        v2f,
        ..
    } = st;
    refresh_beliefs(graph, evidence, f2v, belief);
    let belief: &[f64] = belief;
    let f2v: &[f64] = f2v;
    let parts = edge_partition(graph, v2f);
    parts.into_par_iter().enumerate().for_each(|(i, out)| {
        let ed = &graph.edges[i];
        let bel = &belief[graph.var_states_off[ed.var]..][..ed.num_states];
        let msg = &f2v[ed.msg_off..ed.msg_off + ed.num_states];
        let mut mx = f64::NEG_INFINITY;
        for (o, b, m) in izip!(out.iter_mut(), bel, msg) {
            *o = b - m;
            mx = mx.max(*o);
        }
        if mx.is_finite() {
            for o in out.iter_mut() {
                *o -= mx;
            }
        }
    });
}

/// Factor-side update: every group's f2v block is recomputed from the
/// current v2f messages, group by group in declaration order. Damping
/// mixes the new value into the old one elementwise.
pub(crate) fn update_factors(graph: &FactorGraph, st: &mut BPState, temperature: f64, damping: f64) {
    let BPState {
        f2v,
        v2f,
        potentials,
        ..
    } = st;
    let v2f: &[f64] = v2f;
    let mut rest: &mut [f64] = f2v;
    let mut consumed = 0usize;
    for (gi, group) in graph.factor_groups.values().enumerate() {
        if group.num_factors == 0 {
            continue;
        }
        let start = group.msg_bounds[0];
        let end = *group.msg_bounds.last().unwrap();
        debug_assert_eq!(start, consumed);
        let (gslice, r) = std::mem::take(&mut rest).split_at_mut(end - start);
        rest = r;
        consumed = end;
        let parts = partition_mut(gslice, &group.msg_bounds);
        match (&group.kind, &potentials[gi]) {
            (GroupKind::Enumerated { configs, .. }, GroupPotentials::Enumerated(lp)) => {
                enumerated::update_msgs(
                    group,
                    configs,
                    lp,
                    &graph.edges,
                    v2f,
                    parts,
                    temperature,
                    damping,
                );
            }
            (GroupKind::Pairwise { .. }, GroupPotentials::Pairwise(lp)) => {
                pairwise::update_msgs(group, lp, &graph.edges, v2f, parts, temperature, damping);
            }
            (GroupKind::Or, _) => {
                logical::update_msgs(group, &graph.edges, v2f, parts, 0, temperature, damping);
            }
            (GroupKind::And, _) => {
                logical::update_msgs(group, &graph.edges, v2f, parts, 1, temperature, damping);
            }
            _ => unreachable!("potential kind mismatch"),
        }
    }
}

/// One gradient pass of the smoothed dual: with `mu` playing the role of
/// the f2v messages, writes `p_variable - p_factor` per edge into `grad`,
/// refreshes `belief` from `mu`, and returns the dual objective
/// `sum_f smoothmax(scores_f) + sum_v smoothmax(belief_v)`.
pub(crate) fn smooth_dual_gradient(
    graph: &FactorGraph,
    potentials: &[GroupPotentials],
    evidence: &[f64],
    mu: &[f64],
    belief: &mut [f64],
    grad: &mut [f64],
    temperature: f64,
) -> f64 {
    refresh_beliefs(graph, evidence, mu, belief);
    let belief_r: &[f64] = belief;

    // Variable side: each edge starts from its variable's local softmax.
    let parts = edge_partition(graph, grad);
    parts.into_par_iter().enumerate().for_each(|(i, g)| {
        let ed = &graph.edges[i];
        let bel = &belief_r[graph.var_states_off[ed.var]..][..ed.num_states];
        numeric::softmax_into(bel, temperature, g);
    });

    // Factor side: subtract the factor-local marginals, collecting each
    // factor's smoothed-max score for the objective.
    let num_factors: usize = graph
        .factor_groups
        .values()
        .map(|g| g.num_factors)
        .sum();
    let mut fac_obj = vec![0.0f64; num_factors];
    let mut obj_rest: &mut [f64] = &mut fac_obj;
    let mut rest: &mut [f64] = grad;
    let mut consumed = 0usize;
    for (gi, group) in graph.factor_groups.values().enumerate() {
        let (obj, obj_r) = std::mem::take(&mut obj_rest).split_at_mut(group.num_factors);
        obj_rest = obj_r;
        if group.num_factors == 0 {
            continue;
        }
        let start = group.msg_bounds[0];
        let end = *group.msg_bounds.last().unwrap();
        debug_assert_eq!(start, consumed);
        let (gslice, r) = std::mem::take(&mut rest).split_at_mut(end - start);
        rest = r;
        consumed = end;
        let parts = partition_mut(gslice, &group.msg_bounds);
        match (&group.kind, &potentials[gi]) {
            (GroupKind::Enumerated { configs, .. }, GroupPotentials::Enumerated(lp)) => {
                enumerated::grad_msgs(group, configs, lp, &graph.edges, mu, parts, obj, temperature);
            }
            (GroupKind::Pairwise { .. }, GroupPotentials::Pairwise(lp)) => {
                pairwise::grad_msgs(group, lp, &graph.edges, mu, parts, obj, temperature);
            }
            (GroupKind::Or, _) => {
                logical::grad_msgs(group, &graph.edges, mu, parts, obj, 0, temperature);
            }
            (GroupKind::And, _) => {
                logical::grad_msgs(group, &graph.edges, mu, parts, obj, 1, temperature);
            }
            _ => unreachable!("potential kind mismatch"),
        }
    }

    let var_obj: Vec<f64> = (0..graph.num_vars)
        .into_par_iter()
        .map(|v| {
            let bel = &belief_r[graph.var_states_off[v]..graph.var_states_off[v + 1]];
            numeric::smooth_max_slice(bel, temperature)
        })
        .collect();
    // Sequential sums keep the objective bit-reproducible.
    fac_obj.iter().sum::<f64>() + var_obj.iter().sum::<f64>()
}

/// The log-potential each factor of each group contributes at an integer
/// assignment, in group declaration order. Invalid logical or enumerated
/// configurations contribute [`numeric::LOG_ZERO`].
pub(crate) fn factor_values(
    graph: &FactorGraph,
    potentials: &[GroupPotentials],
    decoding: &[StateVal],
) -> Vec<Vec<f64>> {
    graph
        .factor_groups
        .values()
        .zip(potentials)
        .map(|(group, pots)| match (&group.kind, pots) {
            (GroupKind::Enumerated { configs, .. }, GroupPotentials::Enumerated(lp)) => {
                enumerated::factor_values(group, configs, lp, &graph.edges, decoding)
            }
            (GroupKind::Pairwise { .. }, GroupPotentials::Pairwise(lp)) => {
                pairwise::factor_values(group, lp, &graph.edges, decoding)
            }
            (GroupKind::Or, _) => logical::factor_values(group, &graph.edges, decoding, 0),
            (GroupKind::And, _) => logical::factor_values(group, &graph.edges, decoding, 1),
            _ => unreachable!("potential kind mismatch"),
        })
        .collect()
}
