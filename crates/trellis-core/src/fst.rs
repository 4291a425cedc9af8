//! The decoding graph: a weighted FST viewed through `TransitionGraph`.
//!
//! Input labels are acoustic-unit indices (one-based; 0 is the non-emitting
//! epsilon), output labels are lexical units, weights are tropical costs.
//! The decoders only ever need the start state, per-state final weights, and
//! outgoing-arc iteration, so the graph is abstracted behind a small trait;
//! `VectorGraph` is the canonical CSR-backed implementation.

use crate::error::DecodeError;

pub type StateId = u32;
pub type Label = i32;

/// Input label of a non-emitting arc.
pub const EPSILON: Label = 0;

/// One WFST edge. `weight` is the graph cost in the tropical semiring; a
/// final weight of `+∞` on a state means non-final.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arc {
    pub ilabel: Label,
    pub olabel: Label,
    pub weight: f32,
    pub nextstate: StateId,
}

impl Arc {
    pub fn new(ilabel: Label, olabel: Label, weight: f32, nextstate: StateId) -> Self {
        Arc {
            ilabel,
            olabel,
            weight,
            nextstate,
        }
    }
}

/// Read-only view of a decoding graph.
///
/// Arc iteration must be safe for concurrent readers; the decoders hold a
/// shared reference for their whole lifetime.
pub trait TransitionGraph {
    /// The start state, or `None` for an empty graph.
    fn start(&self) -> Option<StateId>;

    /// Final cost of `state`; `+∞` means non-final.
    fn final_weight(&self, state: StateId) -> f32;

    /// Outgoing arcs of `state`.
    fn arcs(&self, state: StateId) -> &[Arc];

    /// Number of outgoing arcs with input label 0. The lattice decoder uses
    /// this to skip states that cannot extend the non-emitting closure.
    fn num_input_epsilons(&self, state: StateId) -> usize;
}

/// FST stored in CSR format: arcs sorted by source state with an offsets
/// array, plus per-state final weights and epsilon-arc counts.
pub struct VectorGraph {
    num_states: u32,
    start: Option<StateId>,
    final_weights: Vec<f32>,

    // CSR arc storage (sorted by source state)
    offsets: Vec<u32>, // length num_states+1
    arcs: Vec<Arc>,

    num_input_epsilons: Vec<u32>,
}

impl VectorGraph {
    /// Build a graph from parallel arc arrays. `finals` is a list of
    /// `(state, final_cost)` pairs; states not listed are non-final.
    /// Rejects arrays that disagree in length and state ids out of range.
    pub fn new(
        num_states: u32,
        start: Option<StateId>,
        finals: &[(StateId, f32)],
        arc_src: &[StateId],
        arc_ilabel: &[Label],
        arc_olabel: &[Label],
        arc_weight: &[f32],
        arc_dst: &[StateId],
    ) -> Result<Self, DecodeError> {
        let n = num_states as usize;
        let num_arcs = arc_src.len();

        if arc_ilabel.len() != num_arcs
            || arc_olabel.len() != num_arcs
            || arc_weight.len() != num_arcs
            || arc_dst.len() != num_arcs
        {
            return Err(DecodeError::Config(format!(
                "arc arrays disagree in length: src={}, ilabel={}, olabel={}, weight={}, dst={}",
                num_arcs,
                arc_ilabel.len(),
                arc_olabel.len(),
                arc_weight.len(),
                arc_dst.len()
            )));
        }
        if let Some(s) = start {
            if s as usize >= n {
                return Err(DecodeError::Config(format!(
                    "start state {} out of range for {} states",
                    s, num_states
                )));
            }
        }
        for &(s, _) in finals {
            if s as usize >= n {
                return Err(DecodeError::Config(format!(
                    "final state {} out of range for {} states",
                    s, num_states
                )));
            }
        }
        for i in 0..num_arcs {
            if arc_src[i] as usize >= n || arc_dst[i] as usize >= n {
                return Err(DecodeError::Config(format!(
                    "arc {} connects {} -> {}, out of range for {} states",
                    i, arc_src[i], arc_dst[i], num_states
                )));
            }
        }

        let mut final_weights = vec![f32::INFINITY; n];
        for &(s, w) in finals {
            final_weights[s as usize] = w;
        }

        // Sort arcs by source state for CSR
        let mut indices: Vec<usize> = (0..num_arcs).collect();
        indices.sort_by_key(|&i| arc_src[i]);

        let mut offsets = vec![0u32; n + 1];
        let mut arcs = Vec::with_capacity(num_arcs);
        let mut num_input_epsilons = vec![0u32; n];

        for &idx in &indices {
            let src = arc_src[idx] as usize;
            offsets[src + 1] += 1;
            if arc_ilabel[idx] == EPSILON {
                num_input_epsilons[src] += 1;
            }
            arcs.push(Arc {
                ilabel: arc_ilabel[idx],
                olabel: arc_olabel[idx],
                weight: arc_weight[idx],
                nextstate: arc_dst[idx],
            });
        }

        // Prefix sum
        for i in 1..=n {
            offsets[i] += offsets[i - 1];
        }

        Ok(VectorGraph {
            num_states,
            start,
            final_weights,
            offsets,
            arcs,
            num_input_epsilons,
        })
    }

    pub fn num_states(&self) -> u32 {
        self.num_states
    }
}

impl TransitionGraph for VectorGraph {
    fn start(&self) -> Option<StateId> {
        self.start
    }

    fn final_weight(&self, state: StateId) -> f32 {
        self.final_weights[state as usize]
    }

    #[inline]
    fn arcs(&self, state: StateId) -> &[Arc] {
        let lo = self.offsets[state as usize] as usize;
        let hi = self.offsets[state as usize + 1] as usize;
        &self.arcs[lo..hi]
    }

    fn num_input_epsilons(&self, state: StateId) -> usize {
        self.num_input_epsilons[state as usize] as usize
    }
}
