//! OR and AND factors over binary variables, `parents..., child`.
//!
//! The conceptual log-potential table (0 on the valid configurations,
//! -inf elsewhere) is never materialized: the updates run in O(n) per
//! factor through leave-one-out masses, and agree with the enumerated
//! kernel on the equivalent table.
//!
//! Both kinds share one implementation. With `base` the "neutral" parent
//! state (0 for OR, 1 for AND), the child takes the non-base state
//! exactly when at least one parent does. Writing `m_i` for the incoming
//! parent messages, `d_i = m_i[1-base] - m_i[base]`, `A = sum m_i[base]`
//! and `S = sum softplus_T(d_i)`, the log-mass of "some parent non-base"
//! is `A + T log(exp(S/T) - 1)`; at `T == 0` it is
//! `A + sum max(d_i, 0) + min(0, max_i d_i)`.

use rayon::prelude::*;

use crate::graph::{Edge, FactorGroup, StateVal};
use crate::numeric::{self, LOG_ZERO};

#[inline(always)]
fn write_damped(out: &mut [f64], i: usize, new: f64, damping: f64) {
    out[i] = if damping > 0.0 {
        damping * out[i] + (1.0 - damping) * new
    } else {
        new
    };
}

/// `T log(prod(1 + exp(d_i / T)) - 1)` over the parents (minus `skip`):
/// the log-mass of "at least one non-base". `s` is the matching softplus
/// total and `m` the matching maximum of the `d_i`. When `s / T`
/// underflows (every parent overwhelmingly base) or cancels in the
/// leave-one-out subtraction, the product collapses to the sum of the
/// individual masses, so the exact log-sum-exp of the `d_i` takes over.
fn any_non_base(ds: &[f64], skip: Option<usize>, s: f64, m: f64, temperature: f64) -> f64 {
    if s / temperature > 1e-6 {
        return numeric::logexpm1(s, temperature);
    }
    if m == f64::NEG_INFINITY {
        return LOG_ZERO;
    }
    let mut tot = 0.0;
    for (i, &d) in ds.iter().enumerate() {
        if Some(i) == skip {
            continue;
        }
        tot += ((d - m) / temperature).exp();
    }
    m + temperature * tot.ln()
}

/// Top-two values of `ds` with the argmax, `(-inf, usize::MAX, -inf)`
/// when empty.
fn top2(ds: &[f64]) -> (f64, usize, f64) {
    let mut m1 = f64::NEG_INFINITY;
    let mut m1_idx = usize::MAX;
    let mut m2 = f64::NEG_INFINITY;
    for (j, &d) in ds.iter().enumerate() {
        if d > m1 {
            m2 = m1;
            m1 = d;
            m1_idx = j;
        } else if d > m2 {
            m2 = d;
        }
    }
    (m1, m1_idx, m2)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn update_msgs(
    group: &FactorGroup,
    edges: &[Edge],
    v2f: &[f64],
    f2v_parts: Vec<&mut [f64]>,
    base: usize,
    temperature: f64,
    damping: f64,
) {
    let other = 1 - base;
    f2v_parts.into_par_iter().enumerate().for_each_init(
        Vec::new,
        |ds: &mut Vec<f64>, (f, out)| {
            let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
            let n = eids.len() - 1;
            let child = &edges[eids[n]];
            let c_base = v2f[child.msg_off + base];
            let c_other = v2f[child.msg_off + other];

            ds.clear();
            let mut a = 0.0;
            let mut s_total = 0.0;
            let mut r_total = 0.0;
            for &e in &eids[..n] {
                let ed = &edges[e];
                let mb = v2f[ed.msg_off + base];
                let d = v2f[ed.msg_off + other] - mb;
                a += mb;
                ds.push(d);
                if temperature > 0.0 {
                    s_total += numeric::softplus(d, temperature);
                } else {
                    r_total += d.max(0.0);
                }
            }
            let (m1, m1_idx, m2) = top2(ds);

            // Child messages; the child's own incoming message is extrinsic.
            let any_on = if temperature > 0.0 {
                any_non_base(ds, None, s_total, m1, temperature)
            } else if m1 > 0.0 {
                r_total
            } else {
                m1
            };
            write_damped(out, 2 * n + base, a, damping);
            write_damped(out, 2 * n + other, a + any_on, damping);

            // Parent messages via leave-one-out masses.
            for (j, &d) in ds.iter().enumerate() {
                let ed = &edges[eids[j]];
                let a_j = a - v2f[ed.msg_off + base];
                let m_j = if j == m1_idx { m2 } else { m1 };
                let (others_free, others_on) = if temperature > 0.0 {
                    let s_j = s_total - numeric::softplus(d, temperature);
                    (s_j, any_non_base(ds, Some(j), s_j, m_j, temperature))
                } else {
                    let r_j = r_total - d.max(0.0);
                    let on = if m_j == f64::NEG_INFINITY {
                        // no other parent: the child cannot be non-base
                        LOG_ZERO
                    } else if m_j > 0.0 {
                        r_j
                    } else {
                        r_j + m_j
                    };
                    (r_j, on)
                };
                // j non-base forces the child non-base; j base leaves both
                // child states open (non-base needs another non-base parent).
                write_damped(out, 2 * j + other, c_other + a_j + others_free, damping);
                write_damped(
                    out,
                    2 * j + base,
                    numeric::smooth_max2(c_base + a_j, c_other + a_j + others_on, temperature),
                    damping,
                );
            }
        },
    );
}

/// Smooth-dual gradient. The factor-local distribution over valid
/// configurations has unaries `-mu`; its per-edge marginals come from the
/// same leave-one-out partition masses as the message update, evaluated
/// in units of the temperature.
#[allow(clippy::too_many_arguments)]
pub(crate) fn grad_msgs(
    group: &FactorGroup,
    edges: &[Edge],
    mu: &[f64],
    grad_parts: Vec<&mut [f64]>,
    obj: &mut [f64],
    base: usize,
    temperature: f64,
) {
    let other = 1 - base;
    grad_parts
        .into_par_iter()
        .zip(obj.par_iter_mut())
        .enumerate()
        .for_each_init(Vec::new, |ds: &mut Vec<f64>, (f, (grad, obj))| {
            let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
            let n = eids.len() - 1;
            let child = &edges[eids[n]];
            let u_base = -mu[child.msg_off + base];
            let u_other = -mu[child.msg_off + other];

            if temperature == 0.0 {
                // Subgradient: indicator of the best valid configuration,
                // the all-base branch winning ties.
                let mut a = 0.0;
                let mut r = 0.0;
                ds.clear();
                for &e in &eids[..n] {
                    let ed = &edges[e];
                    let ab = -mu[ed.msg_off + base];
                    let d = -mu[ed.msg_off + other] - ab;
                    a += ab;
                    r += d.max(0.0);
                    ds.push(d);
                }
                let (m1, m1_idx, _) = top2(ds);
                let v_base = u_base + a;
                let v_other = u_other + a + if m1 > 0.0 { r } else { m1 };
                if v_base >= v_other {
                    grad[2 * n + base] -= 1.0;
                    for j in 0..n {
                        grad[2 * j + base] -= 1.0;
                    }
                    *obj = v_base;
                } else {
                    grad[2 * n + other] -= 1.0;
                    let any_positive = m1 > 0.0;
                    for (j, &d) in ds.iter().enumerate() {
                        let takes_other = if any_positive { d > 0.0 } else { j == m1_idx };
                        grad[2 * j + if takes_other { other } else { base }] -= 1.0;
                    }
                    *obj = v_other;
                }
                return;
            }

            // Work in units of the temperature so all masses are plain
            // log-sum-exps.
            let t = temperature;
            let mut a_hat = 0.0;
            let mut s_hat = 0.0;
            ds.clear();
            for &e in &eids[..n] {
                let ed = &edges[e];
                let ab = -mu[ed.msg_off + base] / t;
                let d = -mu[ed.msg_off + other] / t - ab;
                a_hat += ab;
                s_hat += numeric::softplus(d, 1.0);
                ds.push(d);
            }
            let (m1, _, _) = top2(ds);
            let lz_base = u_base / t + a_hat;
            let lz_other = u_other / t + a_hat + any_non_base(ds, None, s_hat, m1, 1.0);
            let lz = numeric::smooth_max2(lz_base, lz_other, 1.0);
            let p_child_other = (lz_other - lz).exp().min(1.0);
            grad[2 * n + base] -= 1.0 - p_child_other;
            grad[2 * n + other] -= p_child_other;
            for (j, &d) in ds.iter().enumerate() {
                let ed = &edges[eids[j]];
                let ab = -mu[ed.msg_off + base] / t;
                let ao = -mu[ed.msg_off + other] / t;
                let s_j = s_hat - numeric::softplus(d, 1.0);
                // parent j non-base forces the child non-base; the other
                // parents stay free.
                let lz_j_other = u_other / t + ao + (a_hat - ab) + s_j;
                let p_other = (lz_j_other - lz).exp().min(1.0);
                grad[2 * j + base] -= 1.0 - p_other;
                grad[2 * j + other] -= p_other;
            }
            *obj = t * lz;
        });
}

/// 0 when the assignment satisfies `child = OR/AND(parents)`, impossible
/// otherwise.
pub(crate) fn factor_values(
    group: &FactorGroup,
    edges: &[Edge],
    decoding: &[StateVal],
    base: usize,
) -> Vec<f64> {
    let other = 1 - base as StateVal;
    (0..group.num_factors)
        .map(|f| {
            let eids = &group.edge_ids[group.factor_off[f]..group.factor_off[f + 1]];
            let n = eids.len() - 1;
            let any_non_base = eids[..n]
                .iter()
                .any(|&e| decoding[edges[e].var] == other);
            let child = decoding[edges[eids[n]].var];
            if (child == other) == any_non_base {
                0.0
            } else {
                LOG_ZERO
            }
        })
        .collect()
}
