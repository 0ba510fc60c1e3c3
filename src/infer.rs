//! Inference facade and decoders.
//!
//! [`build_inferer`] is the single entry point: it binds a compiled
//! graph to a backend and exposes `init` / `run` / `get_beliefs`, plus
//! the bound extractors of the smooth-dual backend. The decoders at the
//! bottom are plain functions over belief maps.

use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayD};

use crate::bp::{self, BpOptions};
use crate::factor;
use crate::graph::{FactorGraph, StateVal};
use crate::numeric;
use crate::sdlp::{self, SdlpOptions};
use crate::state::{BPState, InferError};
use crate::Config;

/// Log-domain beliefs (or evidence) keyed by variable group.
pub type Beliefs = IndexMap<String, Array2<f64>>;
/// Integer assignment keyed by variable group.
pub type Decoding = IndexMap<String, Array1<StateVal>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Bp,
    Sdlp,
}

/// State updates applied by [`Inferer::init`]. Groups absent from a map
/// keep their defaults (zero evidence, zero messages, baseline
/// potentials).
#[derive(Debug, Clone, Default)]
pub struct InitUpdates {
    pub evidence: IndexMap<String, Array2<f64>>,
    pub log_potentials: IndexMap<String, ArrayD<f64>>,
    /// Per-variable f2v seeds, spread across the variable's edges.
    pub f2v_msgs: IndexMap<String, Array2<f64>>,
}

pub struct Inferer {
    graph: Arc<FactorGraph>,
    backend: Backend,
}

pub fn build_inferer(graph: &Arc<FactorGraph>, backend: Backend) -> Inferer {
    Inferer {
        graph: graph.clone(),
        backend,
    }
}

impl Inferer {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Creates a fresh arena and applies the given updates. A failed
    /// update leaves nothing observable: the arena is only returned on
    /// success.
    pub fn init(&self, updates: &InitUpdates) -> Result<BPState, InferError> {
        let mut st = BPState::new(self.graph.clone());
        for (name, arr) in &updates.evidence {
            st.set_evidence(name, arr)?;
        }
        for (name, arr) in &updates.log_potentials {
            st.set_log_potentials(name, arr)?;
        }
        for (name, arr) in &updates.f2v_msgs {
            st.spread_f2v(name, arr)?;
        }
        if self.backend == Backend::Sdlp {
            // bound extractors read the aux temperature even before a run
            st.ensure_sdlp_aux(0.0);
        }
        Ok(st)
    }

    pub fn run_bp(
        &self,
        st: &mut BPState,
        opts: &BpOptions,
        config: &Config,
    ) -> Result<(), InferError> {
        if self.backend != Backend::Bp {
            return Err(InferError::WrongBackend("bp"));
        }
        bp::run(st, opts, config)
    }

    pub fn run_sdlp(
        &self,
        st: &mut BPState,
        opts: &SdlpOptions,
        config: &Config,
    ) -> Result<(), InferError> {
        self.run_with_objvals(st, opts, config).map(|_| ())
    }

    /// Like [`Self::run_sdlp`], also returning the dual objective at each
    /// iteration.
    pub fn run_with_objvals(
        &self,
        st: &mut BPState,
        opts: &SdlpOptions,
        config: &Config,
    ) -> Result<Vec<f64>, InferError> {
        if self.backend != Backend::Sdlp {
            return Err(InferError::WrongBackend("sdlp"));
        }
        sdlp::run(st, opts, config)
    }

    /// Log-domain beliefs per variable group.
    pub fn get_beliefs(&self, st: &BPState) -> Beliefs {
        st.beliefs()
    }

    /// Dual objective at the current messages: an upper bound on the
    /// LP-MAP optimum (smooth-dual backend only).
    pub fn get_primal_upper_bound(&self, st: &BPState) -> Result<f64, InferError> {
        if self.backend != Backend::Sdlp {
            return Err(InferError::WrongBackend("sdlp"));
        }
        sdlp::primal_upper_bound(st)
    }

    /// Value of a rounded assignment: a lower bound on the MAP optimum
    /// (smooth-dual backend only).
    pub fn get_map_lower_bound(&self, st: &BPState, decoding: &Decoding) -> Result<f64, InferError> {
        if self.backend != Backend::Sdlp {
            return Err(InferError::WrongBackend("sdlp"));
        }
        sdlp::map_lower_bound(st, decoding)
    }

    /// Argmax-rounds the variable beliefs and scores the assignment
    /// (smooth-dual backend only).
    pub fn decode_primal_unaries(&self, st: &BPState) -> Result<(Decoding, f64), InferError> {
        if self.backend != Backend::Sdlp {
            return Err(InferError::WrongBackend("sdlp"));
        }
        sdlp::decode_primal_unaries(st)
    }
}

/// Per-variable argmax of log beliefs, ties resolved toward the lowest
/// state index.
pub fn decode_map_states(beliefs: &Beliefs) -> Decoding {
    beliefs
        .iter()
        .map(|(name, arr)| {
            let states = arr
                .outer_iter()
                .map(|row| numeric::argmax(row.as_slice().expect("row-major beliefs")) as StateVal)
                .collect::<Array1<StateVal>>();
            (name.clone(), states)
        })
        .collect()
}

/// Normalizes log beliefs into proper per-variable distributions at the
/// given temperature (1.0 recovers the ordinary softmax).
pub fn get_marginals(beliefs: &Beliefs, temperature: f64) -> Beliefs {
    beliefs
        .iter()
        .map(|(name, arr)| {
            let mut out = Array2::zeros(arr.dim());
            for (row, mut dst) in arr.outer_iter().zip(out.outer_iter_mut()) {
                numeric::softmax_into(
                    row.as_slice().expect("row-major beliefs"),
                    temperature,
                    dst.as_slice_mut().expect("row-major output"),
                );
            }
            (name.clone(), out)
        })
        .collect()
}

/// Flattens a per-group decoding into a per-variable state vector,
/// validating coverage, shapes and ranges.
pub(crate) fn flatten_decoding(
    graph: &FactorGraph,
    decoding: &Decoding,
) -> Result<Vec<StateVal>, InferError> {
    let mut flat = vec![0 as StateVal; graph.num_vars()];
    for (name, vg) in &graph.var_groups {
        let states = decoding
            .get(name)
            .ok_or_else(|| InferError::MissingDecoding(name.clone()))?;
        if states.len() != vg.num_vars {
            return Err(InferError::ShapeError {
                name: format!("decoding of {name}"),
                expected: vec![vg.num_vars],
                got: vec![states.len()],
            });
        }
        for (i, &x) in states.iter().enumerate() {
            if x as usize >= vg.num_states {
                return Err(InferError::DecodingOutOfRange {
                    group: name.clone(),
                    state: x,
                    num_states: vg.num_states,
                });
            }
            flat[vg.first_var + i] = x;
        }
    }
    for name in decoding.keys() {
        if !graph.var_groups.contains_key(name) {
            return Err(InferError::UnknownVarGroup(name.clone()));
        }
    }
    Ok(flat)
}

/// Total log-potential of an integer assignment under the arena's
/// evidence and (possibly overridden) factor potentials.
pub(crate) fn assignment_value(st: &BPState, flat: &[StateVal]) -> f64 {
    let graph = st.graph();
    let mut value = 0.0;
    for (v, &x) in flat.iter().enumerate() {
        value += st.evidence[graph.var_states_off[v] + x as usize];
    }
    for group_values in factor::factor_values(graph, &st.potentials, flat) {
        value += group_values.iter().sum::<f64>();
    }
    value
}

/// Negated total log-potential of a decoding: lower is better.
pub fn compute_energy(st: &BPState, decoding: &Decoding) -> Result<f64, InferError> {
    let flat = flatten_decoding(st.graph(), decoding)?;
    Ok(-assignment_value(st, &flat))
}

/// Energy of a decoding together with its per-variable and per-factor
/// breakdown (all negated, so the parts sum to the total).
#[derive(Debug, Clone)]
pub struct EnergyBreakdown {
    pub energy: f64,
    pub var_energies: IndexMap<String, Array1<f64>>,
    pub factor_energies: IndexMap<String, Array1<f64>>,
}

pub fn compute_energy_debug(
    st: &BPState,
    decoding: &Decoding,
) -> Result<EnergyBreakdown, InferError> {
    let graph = st.graph();
    let flat = flatten_decoding(graph, decoding)?;
    let mut energy = 0.0;
    let mut var_energies = IndexMap::with_capacity(graph.var_groups.len());
    for (name, vg) in &graph.var_groups {
        let mut arr = Array1::zeros(vg.num_vars);
        for (i, e) in arr.iter_mut().enumerate() {
            let v = vg.first_var + i;
            let x = flat[v] as usize;
            *e = -st.evidence[graph.var_states_off[v] + x];
            energy += *e;
        }
        var_energies.insert(name.clone(), arr);
    }
    let mut factor_energies = IndexMap::with_capacity(graph.factor_groups.len());
    for ((name, _), values) in graph
        .factor_groups
        .iter()
        .zip(factor::factor_values(graph, &st.potentials, &flat))
    {
        let arr = values.iter().map(|v| -v).collect::<Array1<f64>>();
        energy += arr.sum();
        factor_energies.insert(name.clone(), arr);
    }
    Ok(EnergyBreakdown {
        energy,
        var_energies,
        factor_energies,
    })
}
