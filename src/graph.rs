//! Flat, immutable factor-graph representation.
//!
//! A [`GraphBuilder`] collects named variable groups and homogeneous
//! factor groups, then compiles them into a [`FactorGraph`]: dense
//! variable ids, a global edge table with message-arena offsets, and a
//! CSR reverse map from variables to their incident edges. The compiled
//! graph is immutable and shared (`Arc`) between inference sessions;
//! every mutable quantity lives in [`crate::state::BPState`].
//!
//! Message offsets are assigned in (group, factor, slot) order, so the
//! outgoing messages of a factor group form one contiguous block of the
//! arena and the outgoing messages of each factor form a contiguous
//! sub-block. Kernels rely on this to split the arena into disjoint
//! mutable per-factor windows.

use ndarray::{Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NamedList;

pub type VarId = usize;
pub type EdgeId = usize;
/// Decoded state of a variable.
pub type StateVal = u32;

/// Reference to one variable of a declared variable group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub group: usize,
    pub idx: usize,
}

/// Handle returned by [`GraphBuilder::add_var_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarGroupId(pub(crate) usize);

impl VarGroupId {
    pub fn var(self, idx: usize) -> VarRef {
        VarRef {
            group: self.0,
            idx,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarGroup {
    pub(crate) first_var: VarId,
    pub(crate) num_vars: usize,
    pub(crate) num_states: usize,
}

impl VarGroup {
    pub fn num_vars(&self) -> usize {
        self.num_vars
    }
    pub fn num_states(&self) -> usize {
        self.num_states
    }
}

/// An ordered (factor, variable, slot) incidence. `msg_off` is the start
/// of this edge's `num_states`-long message window in the flat arenas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Edge {
    pub(crate) var: VarId,
    pub(crate) msg_off: usize,
    pub(crate) num_states: usize,
}

/// Baseline log-potentials of an enumerated factor group: either one row
/// shared by every factor or one row per factor.
#[derive(Debug, Clone)]
pub enum EnumeratedPotentials {
    Shared(Array1<f64>),
    PerFactor(Array2<f64>),
}

/// Baseline log-potentials of a pairwise factor group.
#[derive(Debug, Clone)]
pub enum PairwisePotentials {
    Shared(Array2<f64>),
    PerFactor(Array3<f64>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum GroupKind {
    Enumerated {
        /// Valid configurations, shared by all factors of the group.
        configs: Array2<StateVal>,
        /// Baseline log-potentials, one row per factor.
        log_potentials: Array2<f64>,
    },
    Pairwise {
        /// Baseline log-potentials, one matrix per factor.
        log_potentials: Array3<f64>,
    },
    Or,
    And,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FactorGroup {
    pub(crate) kind: GroupKind,
    pub(crate) num_factors: usize,
    /// Global edge ids, factor-major then slot order. For logical factors
    /// the slot order is `parents..., child`.
    pub(crate) edge_ids: Vec<EdgeId>,
    /// CSR bounds into `edge_ids`, length `num_factors + 1`.
    pub(crate) factor_off: Vec<usize>,
    /// Absolute message-arena bounds of each factor's outgoing block,
    /// length `num_factors + 1`. The group's whole block is
    /// `msg_bounds[0]..msg_bounds[num_factors]`.
    pub(crate) msg_bounds: Vec<usize>,
}

#[derive(Debug, Clone, Error)]
pub enum GraphBuildError {
    #[error("A group named {0} already exists.")]
    MultipleGroupDecl(String),
    #[error("Variable reference (group {group}, index {idx}) does not exist.")]
    UnknownVar { group: usize, idx: usize },
    #[error("Factor {factor} connects variable {var} more than once.")]
    RepeatedOperand { factor: usize, var: VarId },
    #[error("Variable {var} has {got} states, expected {expected}.")]
    MismatchedStates {
        var: VarId,
        expected: usize,
        got: usize,
    },
    #[error("Configuration value {value} out of range for slot {slot} ({num_states} states).")]
    ConfigOutOfRange {
        slot: usize,
        value: StateVal,
        num_states: usize,
    },
    #[error("Log-potential array has shape {got:?}, expected {expected:?}.")]
    PotentialShape {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Factor {factor} has {got} variables, expected {expected}.")]
    WrongArity {
        factor: usize,
        expected: usize,
        got: usize,
    },
    #[error("Logical factor {factor} needs at least one parent and a child.")]
    MissingParents { factor: usize },
    #[error("Variable {var} has {num_states} states, logical factors are binary.")]
    NotBinary { var: VarId, num_states: usize },
}

/// A factor group before edge and offset assignment.
struct GroupSpec {
    kind: GroupKind,
    /// Global variable ids, factor-major then slot order.
    vars: Vec<VarId>,
    /// CSR bounds into `vars`, length `num_factors + 1`.
    factor_off: Vec<usize>,
}

pub struct GraphBuilder {
    var_groups: NamedList<VarGroup>,
    factor_groups: NamedList<GroupSpec>,
    num_vars: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            var_groups: NamedList::new(),
            factor_groups: NamedList::new(),
            num_vars: 0,
        }
    }

    pub fn add_var_group(
        &mut self,
        name: impl Into<String>,
        num_vars: usize,
        num_states: usize,
    ) -> Result<VarGroupId, GraphBuildError> {
        let name = name.into();
        self.check_new_group(&name)?;
        assert!(num_states >= 2, "variables need at least two states");
        let id = VarGroupId(self.var_groups.len());
        self.var_groups.insert(
            name,
            VarGroup {
                first_var: self.num_vars,
                num_vars,
                num_states,
            },
        );
        self.num_vars += num_vars;
        Ok(id)
    }

    /// Adds a group of enumerated factors. All factors share `configs`
    /// (one row per valid configuration, one column per slot); the
    /// potentials carry one log-value per configuration.
    pub fn add_enumerated_group(
        &mut self,
        name: impl Into<String>,
        vars: Vec<Vec<VarRef>>,
        configs: Array2<StateVal>,
        log_potentials: EnumeratedPotentials,
    ) -> Result<(), GraphBuildError> {
        let name = name.into();
        self.check_new_group(&name)?;
        let arity = configs.ncols();
        let num_factors = vars.len();
        let (var_ids, factor_off) = self.resolve_factors(&vars, Some(arity))?;
        // Per-slot state counts must agree across the group and bound the
        // configuration values.
        if num_factors > 0 {
            let slot_states: Vec<usize> = var_ids[..arity]
                .iter()
                .map(|&v| self.var_states(v))
                .collect();
            for factor_vars in var_ids.chunks(arity).skip(1) {
                for (s, &v) in factor_vars.iter().enumerate() {
                    if self.var_states(v) != slot_states[s] {
                        return Err(GraphBuildError::MismatchedStates {
                            var: v,
                            expected: slot_states[s],
                            got: self.var_states(v),
                        });
                    }
                }
            }
            for (s, &k) in slot_states.iter().enumerate() {
                for &value in configs.index_axis(Axis(1), s) {
                    if value as usize >= k {
                        return Err(GraphBuildError::ConfigOutOfRange {
                            slot: s,
                            value,
                            num_states: k,
                        });
                    }
                }
            }
        }
        let log_potentials = match log_potentials {
            EnumeratedPotentials::PerFactor(p) => {
                if p.dim() != (num_factors, configs.nrows()) {
                    return Err(GraphBuildError::PotentialShape {
                        expected: vec![num_factors, configs.nrows()],
                        got: p.shape().to_vec(),
                    });
                }
                p
            }
            EnumeratedPotentials::Shared(p) => {
                if p.len() != configs.nrows() {
                    return Err(GraphBuildError::PotentialShape {
                        expected: vec![configs.nrows()],
                        got: p.shape().to_vec(),
                    });
                }
                p.broadcast((num_factors, configs.nrows()))
                    .expect("broadcast row")
                    .to_owned()
            }
        };
        self.factor_groups.insert(
            name,
            GroupSpec {
                kind: GroupKind::Enumerated {
                    configs,
                    log_potentials,
                },
                vars: var_ids,
                factor_off,
            },
        );
        Ok(())
    }

    pub fn add_pairwise_group(
        &mut self,
        name: impl Into<String>,
        vars: Vec<[VarRef; 2]>,
        log_potentials: PairwisePotentials,
    ) -> Result<(), GraphBuildError> {
        let name = name.into();
        self.check_new_group(&name)?;
        let num_factors = vars.len();
        let nested: Vec<Vec<VarRef>> = vars.iter().map(|p| p.to_vec()).collect();
        let (var_ids, factor_off) = self.resolve_factors(&nested, Some(2))?;
        let log_potentials = match log_potentials {
            PairwisePotentials::PerFactor(p) => {
                if p.dim().0 != num_factors {
                    return Err(GraphBuildError::PotentialShape {
                        expected: vec![num_factors, p.dim().1, p.dim().2],
                        got: p.shape().to_vec(),
                    });
                }
                p
            }
            PairwisePotentials::Shared(p) => {
                let (k1, k2) = p.dim();
                p.broadcast((num_factors, k1, k2))
                    .expect("broadcast matrix")
                    .to_owned()
            }
        };
        let (_, k1, k2) = log_potentials.dim();
        for pair in var_ids.chunks(2) {
            for (&v, expected) in pair.iter().zip([k1, k2]) {
                if self.var_states(v) != expected {
                    return Err(GraphBuildError::MismatchedStates {
                        var: v,
                        expected,
                        got: self.var_states(v),
                    });
                }
            }
        }
        self.factor_groups.insert(
            name,
            GroupSpec {
                kind: GroupKind::Pairwise { log_potentials },
                vars: var_ids,
                factor_off,
            },
        );
        Ok(())
    }

    /// Adds a group of OR factors. Each factor lists its parents first
    /// and its child last; all variables must be binary.
    pub fn add_or_group(
        &mut self,
        name: impl Into<String>,
        vars: Vec<Vec<VarRef>>,
    ) -> Result<(), GraphBuildError> {
        self.add_logical_group(name.into(), vars, GroupKind::Or)
    }

    /// Adds a group of AND factors, `parents..., child` like [`Self::add_or_group`].
    pub fn add_and_group(
        &mut self,
        name: impl Into<String>,
        vars: Vec<Vec<VarRef>>,
    ) -> Result<(), GraphBuildError> {
        self.add_logical_group(name.into(), vars, GroupKind::And)
    }

    fn add_logical_group(
        &mut self,
        name: String,
        vars: Vec<Vec<VarRef>>,
        kind: GroupKind,
    ) -> Result<(), GraphBuildError> {
        self.check_new_group(&name)?;
        for (factor, factor_vars) in vars.iter().enumerate() {
            if factor_vars.len() < 2 {
                return Err(GraphBuildError::MissingParents { factor });
            }
        }
        let (var_ids, factor_off) = self.resolve_factors(&vars, None)?;
        for &v in &var_ids {
            if self.var_states(v) != 2 {
                return Err(GraphBuildError::NotBinary {
                    var: v,
                    num_states: self.var_states(v),
                });
            }
        }
        self.factor_groups.insert(
            name,
            GroupSpec {
                kind,
                vars: var_ids,
                factor_off,
            },
        );
        Ok(())
    }

    /// Compiles the collected groups into the flat representation.
    pub fn build(self) -> FactorGraph {
        let num_vars = self.num_vars;
        let mut var_states_off = Vec::with_capacity(num_vars + 1);
        var_states_off.push(0);
        for vg in self.var_groups.values() {
            for _ in 0..vg.num_vars {
                let last = *var_states_off.last().unwrap();
                var_states_off.push(last + vg.num_states);
            }
        }
        let tot_states = *var_states_off.last().unwrap();

        let mut edges: Vec<Edge> = Vec::new();
        let mut per_var_edges: Vec<Vec<EdgeId>> = vec![Vec::new(); num_vars];
        let mut factor_groups = NamedList::with_capacity(self.factor_groups.len());
        let mut tot_msg = 0usize;
        for (name, spec) in self.factor_groups {
            let num_factors = spec.factor_off.len() - 1;
            let mut edge_ids = Vec::with_capacity(spec.vars.len());
            let mut msg_bounds = Vec::with_capacity(num_factors + 1);
            msg_bounds.push(tot_msg);
            for f in 0..num_factors {
                for &v in &spec.vars[spec.factor_off[f]..spec.factor_off[f + 1]] {
                    let num_states = var_states_off[v + 1] - var_states_off[v];
                    let id = edges.len();
                    edges.push(Edge {
                        var: v,
                        msg_off: tot_msg,
                        num_states,
                    });
                    per_var_edges[v].push(id);
                    edge_ids.push(id);
                    tot_msg += num_states;
                }
                msg_bounds.push(tot_msg);
            }
            factor_groups.insert(
                name,
                FactorGroup {
                    kind: spec.kind,
                    num_factors,
                    edge_ids,
                    factor_off: spec.factor_off,
                    msg_bounds,
                },
            );
        }

        let mut var_edges_off = Vec::with_capacity(num_vars + 1);
        var_edges_off.push(0);
        let mut var_edges = Vec::with_capacity(edges.len());
        let mut max_degree = 1;
        for incident in &per_var_edges {
            var_edges.extend_from_slice(incident);
            var_edges_off.push(var_edges.len());
            max_degree = max_degree.max(incident.len() + 1);
        }

        FactorGraph {
            var_groups: self.var_groups,
            factor_groups,
            num_vars,
            var_states_off,
            edges,
            var_edges_off,
            var_edges,
            tot_states,
            tot_msg,
            max_degree,
        }
    }

    fn check_new_group(&self, name: &str) -> Result<(), GraphBuildError> {
        if self.var_groups.contains_key(name) || self.factor_groups.contains_key(name) {
            return Err(GraphBuildError::MultipleGroupDecl(name.to_owned()));
        }
        Ok(())
    }

    fn var_states(&self, var: VarId) -> usize {
        for vg in self.var_groups.values() {
            if var < vg.first_var + vg.num_vars {
                return vg.num_states;
            }
        }
        unreachable!("var id out of range")
    }

    /// Resolves nested variable references to flat global ids, checking
    /// existence, arity and duplicate operands.
    fn resolve_factors(
        &self,
        vars: &[Vec<VarRef>],
        arity: Option<usize>,
    ) -> Result<(Vec<VarId>, Vec<usize>), GraphBuildError> {
        let mut var_ids = Vec::with_capacity(vars.iter().map(Vec::len).sum());
        let mut factor_off = Vec::with_capacity(vars.len() + 1);
        factor_off.push(0);
        for (factor, factor_vars) in vars.iter().enumerate() {
            if let Some(expected) = arity {
                if factor_vars.len() != expected {
                    return Err(GraphBuildError::WrongArity {
                        factor,
                        expected,
                        got: factor_vars.len(),
                    });
                }
            }
            let start = var_ids.len();
            for r in factor_vars {
                let vg = self
                    .var_groups
                    .get_index(r.group)
                    .map(|(_, vg)| vg)
                    .filter(|vg| r.idx < vg.num_vars)
                    .ok_or(GraphBuildError::UnknownVar {
                        group: r.group,
                        idx: r.idx,
                    })?;
                let v = vg.first_var + r.idx;
                if var_ids[start..].contains(&v) {
                    return Err(GraphBuildError::RepeatedOperand { factor, var: v });
                }
                var_ids.push(v);
            }
            factor_off.push(var_ids.len());
        }
        Ok((var_ids, factor_off))
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorGraph {
    pub(crate) var_groups: NamedList<VarGroup>,
    pub(crate) factor_groups: NamedList<FactorGroup>,
    pub(crate) num_vars: usize,
    /// Per-variable offsets into the flat evidence/belief arrays,
    /// length `num_vars + 1`.
    pub(crate) var_states_off: Vec<usize>,
    pub(crate) edges: Vec<Edge>,
    /// CSR reverse map: incident edges of variable `v` are
    /// `var_edges[var_edges_off[v]..var_edges_off[v + 1]]`, in
    /// (group, factor, slot) order.
    pub(crate) var_edges_off: Vec<usize>,
    pub(crate) var_edges: Vec<EdgeId>,
    pub(crate) tot_states: usize,
    pub(crate) tot_msg: usize,
    /// Largest per-variable incidence count, plus one for the unary.
    pub(crate) max_degree: usize,
}

impl FactorGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
    /// Total variable-state count (the length of the evidence array).
    pub fn tot_states(&self) -> usize {
        self.tot_states
    }
    /// Total message length (the length of each message arena).
    pub fn tot_msg(&self) -> usize {
        self.tot_msg
    }
    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    pub fn var_group(&self, name: &str) -> Option<&VarGroup> {
        self.var_groups.get(name)
    }
    pub fn var_group_names(&self) -> impl Iterator<Item = &str> {
        self.var_groups.keys().map(String::as_str)
    }
    pub fn factor_group_names(&self) -> impl Iterator<Item = &str> {
        self.factor_groups.keys().map(String::as_str)
    }

    pub(crate) fn var_incident(&self, var: VarId) -> &[EdgeId] {
        &self.var_edges[self.var_edges_off[var]..self.var_edges_off[var + 1]]
    }
}
