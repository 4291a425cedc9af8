//! Output lattices.
//!
//! Both the best-path tracebacks and the raw state-level lattice are emitted
//! as a small mutable vector FST over `LatticeArc`, whose weights keep the
//! graph and acoustic cost components separate.

use crate::fst::{Label, StateId};
use crate::weight::LatticeWeight;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeArc {
    pub ilabel: Label,
    pub olabel: Label,
    pub weight: LatticeWeight,
    pub nextstate: StateId,
}

impl LatticeArc {
    pub fn new(ilabel: Label, olabel: Label, weight: LatticeWeight, nextstate: StateId) -> Self {
        LatticeArc {
            ilabel,
            olabel,
            weight,
            nextstate,
        }
    }
}

/// Mutable vector FST holding decoder output. A state's final weight of
/// `LatticeWeight::zero()` means non-final.
pub struct Lattice {
    arcs: Vec<Vec<LatticeArc>>,
    finals: Vec<LatticeWeight>,
    start: Option<StateId>,
}

impl Lattice {
    pub fn new() -> Self {
        Lattice {
            arcs: Vec::new(),
            finals: Vec::new(),
            start: None,
        }
    }

    pub fn add_state(&mut self) -> StateId {
        self.arcs.push(Vec::new());
        self.finals.push(LatticeWeight::zero());
        (self.arcs.len() - 1) as StateId
    }

    pub fn set_start(&mut self, state: StateId) {
        self.start = Some(state);
    }

    pub fn start(&self) -> Option<StateId> {
        self.start
    }

    pub fn add_arc(&mut self, state: StateId, arc: LatticeArc) {
        self.arcs[state as usize].push(arc);
    }

    pub fn set_final(&mut self, state: StateId, weight: LatticeWeight) {
        self.finals[state as usize] = weight;
    }

    pub fn final_weight(&self, state: StateId) -> LatticeWeight {
        self.finals[state as usize]
    }

    pub fn is_final(&self, state: StateId) -> bool {
        !self.finals[state as usize].is_zero()
    }

    pub fn arcs(&self, state: StateId) -> &[LatticeArc] {
        &self.arcs[state as usize]
    }

    pub fn num_states(&self) -> usize {
        self.arcs.len()
    }

    pub fn num_arcs(&self) -> usize {
        self.arcs.iter().map(|a| a.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() || self.arcs.is_empty()
    }
}

/// Collapse arcs that are epsilon on both labels by folding their weight
/// into the successor arc (or into the final weight when they trail the
/// chain). Operates on the linear lattices produced by best-path traceback;
/// a lattice with any branching is left untouched.
pub fn remove_eps_local(lat: &mut Lattice) {
    let Some(start) = lat.start() else {
        return;
    };

    let mut chain: Vec<LatticeArc> = Vec::new();
    let mut s = start;
    loop {
        match lat.arcs(s) {
            [] => break,
            [arc] => {
                chain.push(*arc);
                s = arc.nextstate;
            }
            _ => return,
        }
    }
    let end_weight = lat.final_weight(s);

    let mut out: Vec<LatticeArc> = Vec::with_capacity(chain.len());
    let mut pending = LatticeWeight::one();
    for arc in chain {
        if arc.ilabel == 0 && arc.olabel == 0 {
            pending = pending.times(&arc.weight);
        } else {
            out.push(LatticeArc {
                weight: pending.times(&arc.weight),
                ..arc
            });
            pending = LatticeWeight::one();
        }
    }
    let end_weight = pending.times(&end_weight);

    let mut rebuilt = Lattice::new();
    let mut cur = rebuilt.add_state();
    rebuilt.set_start(cur);
    for mut arc in out {
        let next = rebuilt.add_state();
        arc.nextstate = next;
        rebuilt.add_arc(cur, arc);
        cur = next;
    }
    rebuilt.set_final(cur, end_weight);
    *lat = rebuilt;
}

/// Single-source shortest path in the tropical semiring: returns the linear
/// lattice of the cheapest start-to-final path, or an empty lattice when no
/// final state is reachable.
///
/// Label-correcting relaxation over a FIFO queue; decoder lattices have no
/// negative-total cycles (epsilon cycles strictly increase cost), so the
/// relaxation terminates.
pub fn shortest_path(lat: &Lattice) -> Lattice {
    let n = lat.num_states();
    let Some(start) = lat.start() else {
        return Lattice::new();
    };
    if n == 0 {
        return Lattice::new();
    }

    let mut dist = vec![f64::INFINITY; n];
    // Predecessor state and the index of the arc taken from it.
    let mut pred: Vec<Option<(StateId, usize)>> = vec![None; n];
    let mut in_queue = vec![false; n];
    let mut queue: VecDeque<StateId> = VecDeque::new();

    dist[start as usize] = 0.0;
    in_queue[start as usize] = true;
    queue.push_back(start);

    while let Some(s) = queue.pop_front() {
        in_queue[s as usize] = false;
        let base = dist[s as usize];
        for (i, arc) in lat.arcs(s).iter().enumerate() {
            let nd = base + arc.weight.total() as f64;
            let ns = arc.nextstate as usize;
            if nd < dist[ns] {
                dist[ns] = nd;
                pred[ns] = Some((s, i));
                if !in_queue[ns] {
                    in_queue[ns] = true;
                    queue.push_back(arc.nextstate);
                }
            }
        }
    }

    // Best final state by forward cost plus final cost.
    let mut best: Option<(StateId, f64)> = None;
    for s in 0..n {
        let fw = lat.final_weight(s as StateId);
        if fw.is_zero() || dist[s] == f64::INFINITY {
            continue;
        }
        let total = dist[s] + fw.total() as f64;
        if best.map_or(true, |(_, b)| total < b) {
            best = Some((s as StateId, total));
        }
    }
    let Some((end, _)) = best else {
        return Lattice::new();
    };

    // Walk predecessors back to the start, then emit the path forward.
    let mut arcs_reverse: Vec<LatticeArc> = Vec::new();
    let mut s = end;
    while let Some((p, i)) = pred[s as usize] {
        arcs_reverse.push(lat.arcs(p)[i]);
        s = p;
    }
    debug_assert_eq!(s, start);

    let mut out = Lattice::new();
    let mut cur = out.add_state();
    out.set_start(cur);
    for mut arc in arcs_reverse.into_iter().rev() {
        let next = out.add_state();
        arc.nextstate = next;
        out.add_arc(cur, arc);
        cur = next;
    }
    out.set_final(cur, lat.final_weight(end));
    out
}
