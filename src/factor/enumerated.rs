//! Generic enumerated factors: an explicit list of valid configurations
//! with one log-potential per configuration. The f2v update scores every
//! configuration once per pass and scatters the reduction into per-slot
//! accumulators, so the cost is O(n_configs * arity) per factor
//! independently of the state counts.

use ndarray::Array2;
use rayon::prelude::*;

use crate::graph::{Edge, FactorGroup, StateVal};
use crate::numeric::LOG_ZERO;

/// Score of one configuration: log-potential plus incoming messages.
#[inline(always)]
fn config_score(
    lp: f64,
    cfg: &ndarray::ArrayView1<StateVal>,
    eids: &[usize],
    edges: &[Edge],
    msgs: &[f64],
) -> f64 {
    let mut score = lp;
    for (s, &e) in eids.iter().enumerate() {
        score += msgs[edges[e].msg_off + cfg[s] as usize];
    }
    score
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn update_msgs(
    group: &FactorGroup,
    configs: &Array2<StateVal>,
    log_potentials: &Array2<f64>,
    edges: &[Edge],
    v2f: &[f64],
    f2v_parts: Vec<&mut [f64]>,
    temperature: f64,
    damping: f64,
) {
    let arity = configs.ncols();
    // All factors of the group share the block length.
    let block = group.msg_bounds[1] - group.msg_bounds[0];
    f2v_parts.into_par_iter().enumerate().for_each_init(
        || (vec![0.0f64; block], vec![0.0f64; block], vec![0usize; arity + 1]),
        |(acc_max, acc_sum, slot_off), (f, out)| {
            let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
            slot_off[0] = 0;
            for (s, &e) in eids.iter().enumerate() {
                slot_off[s + 1] = slot_off[s] + edges[e].num_states;
            }
            let lp = log_potentials.row(f);
            // Max pass; ties go to the lowest configuration index through
            // the strict comparison.
            acc_max.fill(f64::NEG_INFINITY);
            for (ci, cfg) in configs.outer_iter().enumerate() {
                let score = config_score(lp[ci], &cfg, eids, edges, v2f);
                for (s, &x) in cfg.iter().enumerate() {
                    let i = slot_off[s] + x as usize;
                    if score > acc_max[i] {
                        acc_max[i] = score;
                    }
                }
            }
            if temperature > 0.0 {
                acc_sum.fill(0.0);
                for (ci, cfg) in configs.outer_iter().enumerate() {
                    let score = config_score(lp[ci], &cfg, eids, edges, v2f);
                    for (s, &x) in cfg.iter().enumerate() {
                        let i = slot_off[s] + x as usize;
                        acc_sum[i] += ((score - acc_max[i]) / temperature).exp();
                    }
                }
            }
            for (s, &e) in eids.iter().enumerate() {
                let ed = &edges[e];
                for x in 0..ed.num_states {
                    let i = slot_off[s] + x;
                    // States appearing in no configuration are impossible.
                    let reduced = if acc_max[i] == f64::NEG_INFINITY {
                        LOG_ZERO
                    } else if temperature > 0.0 {
                        acc_max[i] + temperature * acc_sum[i].ln()
                    } else {
                        acc_max[i]
                    };
                    let new = reduced - v2f[ed.msg_off + x];
                    out[i] = if damping > 0.0 {
                        damping * out[i] + (1.0 - damping) * new
                    } else {
                        new
                    };
                }
            }
        },
    );
}

/// Smooth-dual gradient: subtracts the factor-local marginals (softmax of
/// `log_potential - sum mu` over configurations, scattered per slot) from
/// `grad`, and records each factor's smoothed-max score in `obj`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn grad_msgs(
    group: &FactorGroup,
    configs: &Array2<StateVal>,
    log_potentials: &Array2<f64>,
    edges: &[Edge],
    mu: &[f64],
    grad_parts: Vec<&mut [f64]>,
    obj: &mut [f64],
    temperature: f64,
) {
    let arity = configs.ncols();
    let block = group.msg_bounds[1] - group.msg_bounds[0];
    grad_parts
        .into_par_iter()
        .zip(obj.par_iter_mut())
        .enumerate()
        .for_each_init(
            || (vec![0.0f64; block], vec![0usize; arity + 1]),
            |(marg, slot_off), (f, (grad, obj))| {
                let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
                slot_off[0] = 0;
                for (s, &e) in eids.iter().enumerate() {
                    slot_off[s + 1] = slot_off[s] + edges[e].num_states;
                }
                let lp = log_potentials.row(f);
                // Scores use the dual convention: potentials minus mu.
                let mut best = f64::NEG_INFINITY;
                let mut best_ci = 0usize;
                for (ci, cfg) in configs.outer_iter().enumerate() {
                    let mut score = lp[ci];
                    for (s, &e) in eids.iter().enumerate() {
                        score -= mu[edges[e].msg_off + cfg[s] as usize];
                    }
                    if score > best {
                        best = score;
                        best_ci = ci;
                    }
                }
                if temperature == 0.0 {
                    for (s, &x) in configs.row(best_ci).iter().enumerate() {
                        grad[slot_off[s] + x as usize] -= 1.0;
                    }
                    *obj = best;
                    return;
                }
                marg.fill(0.0);
                let mut z = 0.0;
                for (ci, cfg) in configs.outer_iter().enumerate() {
                    let mut score = lp[ci];
                    for (s, &e) in eids.iter().enumerate() {
                        score -= mu[edges[e].msg_off + cfg[s] as usize];
                    }
                    let w = ((score - best) / temperature).exp();
                    z += w;
                    for (s, &x) in cfg.iter().enumerate() {
                        marg[slot_off[s] + x as usize] += w;
                    }
                }
                for (g, m) in grad.iter_mut().zip(marg.iter()) {
                    *g -= m / z;
                }
                *obj = best + temperature * z.ln();
            },
        );
}

/// Log-potential of each factor at an integer assignment; assignments
/// matching no configuration are impossible.
pub(crate) fn factor_values(
    group: &FactorGroup,
    configs: &Array2<StateVal>,
    log_potentials: &Array2<f64>,
    edges: &[Edge],
    decoding: &[StateVal],
) -> Vec<f64> {
    (0..group.num_factors)
        .map(|f| {
            let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
            configs
                .outer_iter()
                .enumerate()
                .find(|(_, cfg)| {
                    cfg.iter()
                        .zip(eids)
                        .all(|(&x, &e)| decoding[edges[e].var] == x)
                })
                .map(|(ci, _)| log_potentials[(f, ci)])
                .unwrap_or(LOG_ZERO)
        })
        .collect()
}
