//! Smooth dual LP-MAP solver.
//!
//! Minimizes the smoothed dual objective
//! `D_T(mu) = sum_f smoothmax_T(lp_f - sum_s mu_s) +
//!            sum_v smoothmax_T(evidence_v + sum_e mu_e)`
//! over the f2v message arena `mu` by Nesterov-accelerated gradient
//! descent. `D_T(mu)` upper-bounds the LP-MAP optimum for any `mu`; the
//! bound tightens as the temperature goes to zero. At `logsumexp_temp ==
//! 0` the updates degenerate to subgradient descent on a non-smooth
//! objective, which still runs but loses any monotonicity.

use rayon::prelude::*;

use crate::factor;
use crate::infer::{self, Decoding};
use crate::state::{BPState, InferError};
use crate::Config;

#[derive(Debug, Clone)]
pub struct SdlpOptions {
    pub num_iters: u32,
    /// Smoothing temperature of the dual objective.
    pub logsumexp_temp: f64,
    /// Gradient step size; `None` picks `max(T, 1e-3) / max_degree`.
    pub step_size: Option<f64>,
}

impl SdlpOptions {
    pub fn new(num_iters: u32, logsumexp_temp: f64) -> Self {
        Self {
            num_iters,
            logsumexp_temp,
            step_size: None,
        }
    }
    pub fn step_size(mut self, step_size: f64) -> Self {
        self.step_size = Some(step_size);
        self
    }
}

/// Runs the solver, returning the dual objective at each iteration's
/// lookahead point.
pub(crate) fn run(
    st: &mut BPState,
    opts: &SdlpOptions,
    config: &Config,
) -> Result<Vec<f64>, InferError> {
    let temperature = opts.logsumexp_temp;
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(InferError::BadTemperature(temperature));
    }
    let graph = st.graph().clone();
    st.ensure_sdlp_aux(temperature);
    let eta = opts
        .step_size
        .unwrap_or_else(|| temperature.max(1e-3) / graph.max_degree() as f64);
    let mut objvals = Vec::with_capacity(opts.num_iters as usize);
    let progress = crate::utils::IterProgress::new(opts.num_iters as u64, "Smooth dual LP", config);
    for _ in 0..opts.num_iters {
        let BPState {
            evidence,
            belief,
            f2v,
            potentials,
            sdlp,
            ..
        } = st;
        let aux = sdlp.as_mut().expect("aux attached above");
        aux.step += 1;
        let beta = (aux.step - 1) as f64 / (aux.step + 2) as f64;
        aux.lookahead
            .par_iter_mut()
            .zip(f2v.par_iter())
            .zip(aux.prev.par_iter())
            .for_each(|((nu, &mu), &prev)| {
                *nu = mu + beta * (mu - prev);
            });
        let obj = factor::smooth_dual_gradient(
            &graph,
            potentials,
            evidence,
            &aux.lookahead,
            belief,
            &mut aux.grad,
            temperature,
        );
        objvals.push(obj);
        f2v.par_iter_mut()
            .zip(aux.prev.par_iter_mut())
            .zip(aux.lookahead.par_iter())
            .zip(aux.grad.par_iter())
            .for_each(|(((mu, prev), &nu), &g)| {
                *prev = *mu;
                *mu = nu - eta * g;
            });
        progress.tick();
    }
    progress.finish();
    if config.check_numerics {
        st.scan_numerics();
    }
    Ok(objvals)
}

/// The dual objective at the arena's current messages.
pub(crate) fn dual_objective(st: &BPState, temperature: f64) -> f64 {
    let graph = st.graph();
    let mut belief = vec![0.0; graph.tot_states()];
    let mut grad = vec![0.0; graph.tot_msg()];
    factor::smooth_dual_gradient(
        graph,
        &st.potentials,
        &st.evidence,
        &st.f2v,
        &mut belief,
        &mut grad,
        temperature,
    )
}

pub(crate) fn primal_upper_bound(st: &BPState) -> Result<f64, InferError> {
    let aux = st.sdlp.as_ref().ok_or(InferError::WrongBackend("sdlp"))?;
    Ok(dual_objective(st, aux.temperature))
}

/// Total log-potential of a rounded integer assignment: a lower bound on
/// the MAP value.
pub(crate) fn map_lower_bound(st: &BPState, decoding: &Decoding) -> Result<f64, InferError> {
    let flat = infer::flatten_decoding(st.graph(), decoding)?;
    Ok(infer::assignment_value(st, &flat))
}

/// Rounds the variable-wise beliefs to their argmax and scores the
/// resulting assignment.
pub(crate) fn decode_primal_unaries(st: &BPState) -> Result<(Decoding, f64), InferError> {
    let beliefs = st.beliefs();
    let decoding = infer::decode_map_states(&beliefs);
    let flat = infer::flatten_decoding(st.graph(), &decoding)?;
    let score = infer::assignment_value(st, &flat);
    Ok((decoding, score))
}
