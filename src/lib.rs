//! Approximate inference on discrete factor graphs.
//!
//! The crate compiles a description of a factor graph (named variable
//! groups and homogeneous factor groups) into a flat, immutable
//! representation, then runs either loopy belief propagation (sum-product
//! or max-product, selected by a temperature parameter) or a smoothed
//! dual LP-MAP solver over a mutable message arena. All messages live in
//! the log domain and all kernels are batched over the factors of a group.

pub mod bp;
pub(crate) mod factor;
pub mod graph;
pub mod infer;
pub(crate) mod numeric;
pub mod sdlp;
pub mod state;
pub(crate) mod utils;

pub(crate) type NamedList<T> = indexmap::IndexMap<String, T>;

pub use bp::BpOptions;
pub use graph::{
    EnumeratedPotentials, FactorGraph, GraphBuildError, GraphBuilder, PairwisePotentials,
    StateVal, VarGroupId, VarRef,
};
pub use infer::{
    build_inferer, compute_energy, compute_energy_debug, decode_map_states, get_marginals,
    Backend, Beliefs, Decoding, EnergyBreakdown, Inferer, InitUpdates,
};
pub use sdlp::SdlpOptions;
pub use state::{BPState, InferError};

#[derive(Clone)]
pub struct Config {
    /// Show progress bars for long runs.
    pub show_progress: bool,
    /// Computation time after which a progress bar is displayed.
    /// This avoids showing progress bars for negligible amounts of time.
    pub progress_min_time: std::time::Duration,
    /// Scan the message arena for NaN/Inf after each run and count the
    /// offending entries in [`BPState::numerical_warnings`]. Detection
    /// never aborts a run.
    pub check_numerics: bool,
}

impl Config {
    pub fn no_progress() -> Self {
        Self {
            show_progress: false,
            ..Default::default()
        }
    }
}

impl std::default::Default for Config {
    fn default() -> Self {
        Self {
            show_progress: true,
            progress_min_time: std::time::Duration::from_millis(500),
            check_numerics: false,
        }
    }
}
