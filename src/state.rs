//! Mutable message arena for one inference session.
//!
//! A [`BPState`] owns every quantity an inference run mutates: the two
//! flat message arenas (`f2v`, `v2f`), the flat evidence, a belief
//! scratch array, the per-group log-potentials (baseline or overridden at
//! `init`), and the auxiliary vectors of the smooth-dual solver. The
//! compiled [`FactorGraph`] it points at is never modified.

use std::sync::Arc;

use ndarray::{Array2, ArrayD, ArrayViewD, Ix2, Ix3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{EdgeId, FactorGraph, GroupKind, StateVal, VarId};
use crate::NamedList;

#[derive(Debug, Clone, Error)]
pub enum InferError {
    #[error("Array for {name} has shape {got:?}, expected {expected:?}.")]
    ShapeError {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("No variable group named {0}.")]
    UnknownVarGroup(String),
    #[error("No factor group named {0}.")]
    UnknownFactorGroup(String),
    #[error("Decoding is missing variable group {0}.")]
    MissingDecoding(String),
    #[error("Decoded state {state} out of range for group {group} ({num_states} states).")]
    DecodingOutOfRange {
        group: String,
        state: StateVal,
        num_states: usize,
    },
    #[error("Temperature must be finite and non-negative, got {0}.")]
    BadTemperature(f64),
    #[error("Damping must be in [0, 1), got {0}.")]
    BadDamping(f64),
    #[error("This operation requires the {0} backend.")]
    WrongBackend(&'static str),
    #[error("No edge at ({group}, factor {factor}, slot {slot}).")]
    EdgeIndex {
        group: String,
        factor: usize,
        slot: usize,
    },
    #[error("Log-potentials of group {0} cannot be overridden (logical factors have none).")]
    PotentialOverride(String),
}

/// Per-group log-potentials as seen by the kernels: the graph baseline,
/// possibly replaced by an override at `init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum GroupPotentials {
    Enumerated(Array2<f64>),
    Pairwise(ndarray::Array3<f64>),
    Logical,
}

/// Auxiliary state of the smooth-dual solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SdlpAux {
    /// Previous iterate, for the momentum term.
    pub(crate) prev: Vec<f64>,
    /// Lookahead point the gradient is evaluated at.
    pub(crate) lookahead: Vec<f64>,
    pub(crate) grad: Vec<f64>,
    /// Momentum step counter, persists across `run` calls.
    pub(crate) step: u64,
    /// Temperature of the last run, used by the bound extractors.
    pub(crate) temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BPState {
    pub(crate) graph: Arc<FactorGraph>,
    /// Log-domain unaries, flat over `tot_states`.
    pub(crate) evidence: Vec<f64>,
    /// Belief scratch, flat over `tot_states`. Refreshed by the variable
    /// update and by the gradient pass; [`Self::beliefs`] recomputes it
    /// on demand so readers never observe a stale value.
    pub(crate) belief: Vec<f64>,
    /// Factor-to-variable messages (the dual iterate under SDLP).
    pub(crate) f2v: Vec<f64>,
    /// Variable-to-factor messages (extrinsic beliefs).
    pub(crate) v2f: Vec<f64>,
    /// One entry per factor group, in group order.
    pub(crate) potentials: Vec<GroupPotentials>,
    pub(crate) sdlp: Option<SdlpAux>,
    pub(crate) numerical_warnings: u64,
}

impl BPState {
    pub fn new(graph: Arc<FactorGraph>) -> Self {
        let potentials = graph
            .factor_groups
            .values()
            .map(|g| match &g.kind {
                GroupKind::Enumerated { log_potentials, .. } => {
                    GroupPotentials::Enumerated(log_potentials.clone())
                }
                GroupKind::Pairwise { log_potentials } => {
                    GroupPotentials::Pairwise(log_potentials.clone())
                }
                GroupKind::Or | GroupKind::And => GroupPotentials::Logical,
            })
            .collect();
        Self {
            evidence: vec![0.0; graph.tot_states],
            belief: vec![0.0; graph.tot_states],
            f2v: vec![0.0; graph.tot_msg],
            v2f: vec![0.0; graph.tot_msg],
            potentials,
            sdlp: None,
            numerical_warnings: 0,
            graph,
        }
    }

    pub fn graph(&self) -> &Arc<FactorGraph> {
        &self.graph
    }

    /// Number of NaN/Inf message entries found so far by the optional
    /// numerics check ([`crate::Config::check_numerics`]).
    pub fn numerical_warnings(&self) -> u64 {
        self.numerical_warnings
    }

    /// Replaces the evidence of one variable group. The array shape must
    /// be (num_vars, num_states).
    pub fn set_evidence(&mut self, group: &str, evidence: &Array2<f64>) -> Result<(), InferError> {
        let vg = self
            .graph
            .var_groups
            .get(group)
            .ok_or_else(|| InferError::UnknownVarGroup(group.to_owned()))?;
        if evidence.dim() != (vg.num_vars, vg.num_states) {
            return Err(InferError::ShapeError {
                name: format!("evidence of {group}"),
                expected: vec![vg.num_vars, vg.num_states],
                got: evidence.shape().to_vec(),
            });
        }
        let off = self.graph.var_states_off[vg.first_var];
        let dst = &mut self.evidence[off..off + vg.num_vars * vg.num_states];
        for (d, s) in dst.iter_mut().zip(evidence.iter()) {
            *d = *s;
        }
        Ok(())
    }

    /// Replaces the log-potentials of one factor group for this session.
    /// The array must match the baseline shape; logical groups carry no
    /// potentials and reject overrides.
    pub fn set_log_potentials(
        &mut self,
        group: &str,
        log_potentials: &ArrayD<f64>,
    ) -> Result<(), InferError> {
        let idx = self
            .graph
            .factor_groups
            .get_index_of(group)
            .ok_or_else(|| InferError::UnknownFactorGroup(group.to_owned()))?;
        let shape_err = |expected: &[usize], got: ArrayViewD<f64>| InferError::ShapeError {
            name: format!("log-potentials of {group}"),
            expected: expected.to_vec(),
            got: got.shape().to_vec(),
        };
        match &mut self.potentials[idx] {
            GroupPotentials::Enumerated(baseline) => {
                let expected = [baseline.dim().0, baseline.dim().1];
                let update = log_potentials
                    .view()
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| shape_err(&expected, log_potentials.view()))?;
                if update.dim() != baseline.dim() {
                    return Err(shape_err(&expected, log_potentials.view()));
                }
                baseline.assign(&update);
            }
            GroupPotentials::Pairwise(baseline) => {
                let expected = [baseline.dim().0, baseline.dim().1, baseline.dim().2];
                let update = log_potentials
                    .view()
                    .into_dimensionality::<Ix3>()
                    .map_err(|_| shape_err(&expected, log_potentials.view()))?;
                if update.dim() != baseline.dim() {
                    return Err(shape_err(&expected, log_potentials.view()));
                }
                baseline.assign(&update);
            }
            GroupPotentials::Logical => {
                return Err(InferError::PotentialOverride(group.to_owned()));
            }
        }
        Ok(())
    }

    /// Seeds the factor-to-variable messages of one variable group: the
    /// per-variable vector is spread uniformly over the variable's
    /// incident edges, so the induced belief offset equals the given
    /// vector. Variables touching no factor are skipped.
    pub fn spread_f2v(&mut self, group: &str, msgs: &Array2<f64>) -> Result<(), InferError> {
        let vg = self
            .graph
            .var_groups
            .get(group)
            .ok_or_else(|| InferError::UnknownVarGroup(group.to_owned()))?;
        if msgs.dim() != (vg.num_vars, vg.num_states) {
            return Err(InferError::ShapeError {
                name: format!("f2v messages of {group}"),
                expected: vec![vg.num_vars, vg.num_states],
                got: msgs.shape().to_vec(),
            });
        }
        for (i, row) in msgs.outer_iter().enumerate() {
            let v: VarId = vg.first_var + i;
            let incident = self.graph.var_incident(v);
            if incident.is_empty() {
                continue;
            }
            let scale = 1.0 / incident.len() as f64;
            for &e in incident {
                let ed = &self.graph.edges[e];
                let dst = &mut self.f2v[ed.msg_off..ed.msg_off + ed.num_states];
                for (d, s) in dst.iter_mut().zip(row.iter()) {
                    *d = *s * scale;
                }
            }
        }
        Ok(())
    }

    fn edge_at(&self, group: &str, factor: usize, slot: usize) -> Result<EdgeId, InferError> {
        let g = self
            .graph
            .factor_groups
            .get(group)
            .ok_or_else(|| InferError::UnknownFactorGroup(group.to_owned()))?;
        let err = || InferError::EdgeIndex {
            group: group.to_owned(),
            factor,
            slot,
        };
        if factor >= g.num_factors {
            return Err(err());
        }
        let slots = &g.edge_ids[g.factor_off[factor]..g.factor_off[factor + 1]];
        slots.get(slot).copied().ok_or_else(err)
    }

    pub fn f2v_msg(&self, group: &str, factor: usize, slot: usize) -> Result<&[f64], InferError> {
        let e = self.edge_at(group, factor, slot)?;
        let ed = &self.graph.edges[e];
        Ok(&self.f2v[ed.msg_off..ed.msg_off + ed.num_states])
    }

    pub fn v2f_msg(&self, group: &str, factor: usize, slot: usize) -> Result<&[f64], InferError> {
        let e = self.edge_at(group, factor, slot)?;
        let ed = &self.graph.edges[e];
        Ok(&self.v2f[ed.msg_off..ed.msg_off + ed.num_states])
    }

    pub fn set_f2v_msg(
        &mut self,
        group: &str,
        factor: usize,
        slot: usize,
        msg: &[f64],
    ) -> Result<(), InferError> {
        let e = self.edge_at(group, factor, slot)?;
        let ed = &self.graph.edges[e];
        if msg.len() != ed.num_states {
            return Err(InferError::ShapeError {
                name: format!("f2v message of {group}"),
                expected: vec![ed.num_states],
                got: vec![msg.len()],
            });
        }
        self.f2v[ed.msg_off..ed.msg_off + ed.num_states].copy_from_slice(msg);
        Ok(())
    }

    pub fn set_v2f_msg(
        &mut self,
        group: &str,
        factor: usize,
        slot: usize,
        msg: &[f64],
    ) -> Result<(), InferError> {
        let e = self.edge_at(group, factor, slot)?;
        let ed = &self.graph.edges[e];
        if msg.len() != ed.num_states {
            return Err(InferError::ShapeError {
                name: format!("v2f message of {group}"),
                expected: vec![ed.num_states],
                got: vec![msg.len()],
            });
        }
        self.v2f[ed.msg_off..ed.msg_off + ed.num_states].copy_from_slice(msg);
        Ok(())
    }

    /// Log-domain beliefs of every variable group, computed as
    /// `evidence + sum of incoming f2v messages`.
    pub fn beliefs(&self) -> NamedList<Array2<f64>> {
        let graph = &*self.graph;
        let mut out = NamedList::with_capacity(graph.var_groups.len());
        for (name, vg) in &graph.var_groups {
            let mut arr = Array2::zeros((vg.num_vars, vg.num_states));
            for (i, mut row) in arr.outer_iter_mut().enumerate() {
                let v = vg.first_var + i;
                let off = graph.var_states_off[v];
                for (j, b) in row.iter_mut().enumerate() {
                    *b = self.evidence[off + j];
                }
                for &e in graph.var_incident(v) {
                    let ed = &graph.edges[e];
                    let msg = &self.f2v[ed.msg_off..ed.msg_off + ed.num_states];
                    for (b, m) in row.iter_mut().zip(msg) {
                        *b += m;
                    }
                }
            }
            out.insert(name.clone(), arr);
        }
        out
    }

    /// One synchronous variable-side half-step: recomputes every
    /// extrinsic v2f message from the current f2v arena and the evidence.
    pub fn propagate_variables(&mut self) {
        let graph = self.graph.clone();
        crate::factor::update_variables(&graph, self);
    }

    /// One synchronous factor-side half-step: recomputes every f2v
    /// message from the current v2f arena, with elementwise damping.
    pub fn propagate_factors(&mut self, temperature: f64, damping: f64) {
        let graph = self.graph.clone();
        crate::factor::update_factors(&graph, self, temperature, damping);
    }

    /// Counts non-finite entries of both message arenas into
    /// [`Self::numerical_warnings`].
    pub(crate) fn scan_numerics(&mut self) {
        let bad = self
            .f2v
            .iter()
            .chain(self.v2f.iter())
            .filter(|x| !x.is_finite())
            .count();
        self.numerical_warnings += bad as u64;
    }

    pub(crate) fn ensure_sdlp_aux(&mut self, temperature: f64) {
        let n = self.graph.tot_msg;
        match &mut self.sdlp {
            Some(aux) => aux.temperature = temperature,
            None => {
                self.sdlp = Some(SdlpAux {
                    prev: self.f2v.clone(),
                    lookahead: vec![0.0; n],
                    grad: vec![0.0; n],
                    step: 0,
                    temperature,
                });
            }
        }
    }
}
