//! Loopy belief propagation driver.
//!
//! Runs a fixed number of synchronous iterations: the variable-side
//! update first (extrinsic v2f messages from the current f2v arena),
//! then every factor group in declaration order. Convergence is not
//! checked; on loopy graphs it is not guaranteed.

use crate::factor;
use crate::state::{BPState, InferError};
use crate::Config;

#[derive(Debug, Clone)]
pub struct BpOptions {
    pub num_iters: u32,
    /// 0 runs max-product, > 0 sum-product with soft reductions.
    pub temperature: f64,
    /// Convex mixing of new f2v messages into the old ones.
    pub damping: f64,
}

impl BpOptions {
    pub fn new(num_iters: u32) -> Self {
        Self {
            num_iters,
            temperature: 0.0,
            damping: 0.0,
        }
    }
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }
}

pub(crate) fn run(st: &mut BPState, opts: &BpOptions, config: &Config) -> Result<(), InferError> {
    if !opts.temperature.is_finite() || opts.temperature < 0.0 {
        return Err(InferError::BadTemperature(opts.temperature));
    }
    if !(0.0..1.0).contains(&opts.damping) {
        return Err(InferError::BadDamping(opts.damping));
    }
    let graph = st.graph().clone();
    let progress = crate::utils::IterProgress::new(opts.num_iters as u64, "Loopy BP", config);
    for _ in 0..opts.num_iters {
        factor::update_variables(&graph, st);
        factor::update_factors(&graph, st, opts.temperature, opts.damping);
        progress.tick();
    }
    progress.finish();
    if config.check_numerics {
        st.scan_numerics();
    }
    Ok(())
}
