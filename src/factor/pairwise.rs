//! Pairwise factors, the hot path for grid MRFs: one (k1, k2)
//! log-potential matrix per factor, messages computed by direct row and
//! column reductions without materializing the scored matrix.

use ndarray::{Array3, Axis};
use rayon::prelude::*;

use crate::graph::{Edge, FactorGroup, StateVal};

pub(crate) fn update_msgs(
    group: &FactorGroup,
    log_potentials: &Array3<f64>,
    edges: &[Edge],
    v2f: &[f64],
    f2v_parts: Vec<&mut [f64]>,
    temperature: f64,
    damping: f64,
) {
    let (_, k1, k2) = log_potentials.dim();
    f2v_parts.into_par_iter().enumerate().for_each(|(f, out)| {
        let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
        let (e0, e1) = (&edges[eids[0]], &edges[eids[1]]);
        let lp = log_potentials.index_axis(Axis(0), f);
        let v0 = &v2f[e0.msg_off..e0.msg_off + k1];
        let v1 = &v2f[e1.msg_off..e1.msg_off + k2];
        let (out0, out1) = out.split_at_mut(k1);
        // The own incoming message cancels out of the extrinsic update,
        // so each side only reduces over the other side's states.
        for a in 0..k1 {
            let mut m = f64::NEG_INFINITY;
            for b in 0..k2 {
                m = m.max(lp[(a, b)] + v1[b]);
            }
            let new = if temperature > 0.0 {
                let mut s = 0.0;
                for b in 0..k2 {
                    s += ((lp[(a, b)] + v1[b] - m) / temperature).exp();
                }
                m + temperature * s.ln()
            } else {
                m
            };
            out0[a] = if damping > 0.0 {
                damping * out0[a] + (1.0 - damping) * new
            } else {
                new
            };
        }
        for b in 0..k2 {
            let mut m = f64::NEG_INFINITY;
            for a in 0..k1 {
                m = m.max(lp[(a, b)] + v0[a]);
            }
            let new = if temperature > 0.0 {
                let mut s = 0.0;
                for a in 0..k1 {
                    s += ((lp[(a, b)] + v0[a] - m) / temperature).exp();
                }
                m + temperature * s.ln()
            } else {
                m
            };
            out1[b] = if damping > 0.0 {
                damping * out1[b] + (1.0 - damping) * new
            } else {
                new
            };
        }
    });
}

/// Smooth-dual gradient: softmax of `lp - mu0 - mu1` over the full
/// matrix, marginalized to rows and columns.
#[allow(clippy::too_many_arguments)]
pub(crate) fn grad_msgs(
    group: &FactorGroup,
    log_potentials: &Array3<f64>,
    edges: &[Edge],
    mu: &[f64],
    grad_parts: Vec<&mut [f64]>,
    obj: &mut [f64],
    temperature: f64,
) {
    let (_, k1, k2) = log_potentials.dim();
    grad_parts
        .into_par_iter()
        .zip(obj.par_iter_mut())
        .enumerate()
        .for_each_init(
            || vec![0.0f64; k1 + k2],
            |marg, (f, (grad, obj))| {
                let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
                let (e0, e1) = (&edges[eids[0]], &edges[eids[1]]);
                let lp = log_potentials.index_axis(Axis(0), f);
                let m0 = &mu[e0.msg_off..e0.msg_off + k1];
                let m1 = &mu[e1.msg_off..e1.msg_off + k2];
                let mut best = f64::NEG_INFINITY;
                for a in 0..k1 {
                    for b in 0..k2 {
                        best = best.max(lp[(a, b)] - m0[a] - m1[b]);
                    }
                }
                if temperature == 0.0 {
                    // Row-major scan: the first maximum is the lowest
                    // configuration index.
                    let mut hit = (0, 0);
                    'outer: for a in 0..k1 {
                        for b in 0..k2 {
                            if lp[(a, b)] - m0[a] - m1[b] == best {
                                hit = (a, b);
                                break 'outer;
                            }
                        }
                    }
                    grad[hit.0] -= 1.0;
                    grad[k1 + hit.1] -= 1.0;
                    *obj = best;
                    return;
                }
                marg.fill(0.0);
                let mut z = 0.0;
                for a in 0..k1 {
                    for b in 0..k2 {
                        let w = ((lp[(a, b)] - m0[a] - m1[b] - best) / temperature).exp();
                        z += w;
                        marg[a] += w;
                        marg[k1 + b] += w;
                    }
                }
                for (g, m) in grad.iter_mut().zip(marg.iter()) {
                    *g -= m / z;
                }
                *obj = best + temperature * z.ln();
            },
        );
}

pub(crate) fn factor_values(
    group: &FactorGroup,
    log_potentials: &Array3<f64>,
    edges: &[Edge],
    decoding: &[StateVal],
) -> Vec<f64> {
    (0..group.num_factors)
        .map(|f| {
            let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
            let a = decoding[edges[eids[0]].var] as usize;
            let b = decoding[edges[eids[1]].var] as usize;
            log_potentials[(f, a, b)]
        })
        .collect()
}
