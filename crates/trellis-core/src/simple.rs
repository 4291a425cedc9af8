//! Baseline token-passing Viterbi decoder.
//!
//! Keeps one hash map of tokens per frame (current and previous), propagates
//! emitting arcs from the previous frame's active set, closes over
//! non-emitting arcs within the current frame, then prunes against
//! `best + beam`. Best-path output walks the reference-counted backtrace
//! chain. This is the reference implementation the optimized decoders are
//! checked against.

use crate::error::DecodeError;
use crate::fst::{Arc, StateId, TransitionGraph, EPSILON};
use crate::lattice::{remove_eps_local, Lattice, LatticeArc};
use crate::scorer::FrameScorer;
use crate::token::{TokenArena, TokenId};
use crate::weight::LatticeWeight;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

pub struct SimpleDecoder<'a, G: TransitionGraph> {
    fst: &'a G,
    beam: f32,
    arena: TokenArena,
    cur_toks: FxHashMap<StateId, TokenId>,
    prev_toks: FxHashMap<StateId, TokenId>,
    // -1 until init_decoding() has run.
    num_frames_decoded: i32,
}

impl<'a, G: TransitionGraph> SimpleDecoder<'a, G> {
    pub fn new(fst: &'a G, beam: f32) -> Result<Self, DecodeError> {
        if beam <= 0.0 {
            return Err(DecodeError::Config(format!("beam must be > 0, got {}", beam)));
        }
        Ok(SimpleDecoder {
            fst,
            beam,
            arena: TokenArena::new(),
            cur_toks: FxHashMap::default(),
            prev_toks: FxHashMap::default(),
            num_frames_decoded: -1,
        })
    }

    /// Decode the whole utterance. Returns true if any tokens survived to
    /// the last frame (not necessarily in a final state; query
    /// `reached_final` for that).
    pub fn decode<S: FrameScorer + ?Sized>(&mut self, scorer: &S) -> Result<bool, DecodeError> {
        self.init_decoding()?;
        self.advance_decoding(scorer, None)?;
        Ok(!self.cur_toks.is_empty())
    }

    /// Reset state and place a single zero-cost token at the start state,
    /// then close over non-emitting arcs.
    pub fn init_decoding(&mut self) -> Result<(), DecodeError> {
        self.clear_toks(true);
        self.clear_toks(false);
        let start_state = self
            .fst
            .start()
            .ok_or_else(|| DecodeError::Graph("graph has no start state".into()))?;
        let dummy_arc = Arc::new(0, 0, 0.0, start_state);
        let tok = self.arena.alloc(&dummy_arc, 0.0, None);
        self.cur_toks.insert(start_state, tok);
        self.num_frames_decoded = 0;
        self.process_nonemitting();
        Ok(())
    }

    /// Decode until no more frames are ready in the scorer, or until
    /// `max_frames` more frames have been consumed.
    pub fn advance_decoding<S: FrameScorer + ?Sized>(
        &mut self,
        scorer: &S,
        max_frames: Option<i32>,
    ) -> Result<(), DecodeError> {
        if self.num_frames_decoded < 0 {
            return Err(DecodeError::Usage(
                "init_decoding must be called before advance_decoding".into(),
            ));
        }
        let num_frames_ready = scorer.num_frames_ready();
        // The number of frames ready must not decrease: that would mean the
        // scorer changed (or went backwards) between calls.
        if num_frames_ready < self.num_frames_decoded {
            return Err(DecodeError::Usage(format!(
                "num_frames_ready ({}) < num_frames_decoded ({})",
                num_frames_ready, self.num_frames_decoded
            )));
        }
        let mut target_frames_decoded = num_frames_ready;
        if let Some(max) = max_frames {
            target_frames_decoded = target_frames_decoded.min(self.num_frames_decoded + max);
        }
        while self.num_frames_decoded < target_frames_decoded {
            // process_emitting() increments num_frames_decoded.
            self.clear_toks(false);
            std::mem::swap(&mut self.cur_toks, &mut self.prev_toks);
            self.process_emitting(scorer);
            self.process_nonemitting();
            self.prune_toks();
        }
        Ok(())
    }

    pub fn num_frames_decoded(&self) -> i32 {
        self.num_frames_decoded
    }

    /// True if any current token sits at a state with a finite final weight.
    pub fn reached_final(&self) -> bool {
        self.cur_toks.iter().any(|(&state, &tok)| {
            self.arena.cost(tok) != f64::INFINITY
                && self.fst.final_weight(state) != f32::INFINITY
        })
    }

    /// Difference between the best cost-plus-final-cost and the best cost
    /// over the current tokens, or `+∞` when no tokens (or no final-state
    /// tokens) survive.
    pub fn final_relative_cost(&self) -> f32 {
        if self.cur_toks.is_empty() {
            return f32::INFINITY;
        }
        let mut best_cost = f64::INFINITY;
        let mut best_cost_with_final = f64::INFINITY;
        for (&state, &tok) in &self.cur_toks {
            let cost = self.arena.cost(tok);
            best_cost = best_cost.min(cost);
            best_cost_with_final =
                best_cost_with_final.min(cost + self.fst.final_weight(state) as f64);
        }
        let extra_cost = (best_cost_with_final - best_cost) as f32;
        if extra_cost.is_nan() {
            warn!("found NaN relative cost (likely search failure)");
            return f32::INFINITY;
        }
        // +infinity here means no final state survived.
        extra_cost
    }

    /// Best-path traceback as a linear lattice. With `use_final_probs` and a
    /// reached final state, restricts to final-state tokens and applies the
    /// final weight; otherwise takes the overall best token. Returns `None`
    /// when nothing survived the search.
    pub fn get_best_path(&self, use_final_probs: bool) -> Option<Lattice> {
        let is_final = self.reached_final();
        let best_tok = if !is_final {
            self.cur_toks
                .values()
                .copied()
                .min_by(|&a, &b| self.arena.cost(a).total_cmp(&self.arena.cost(b)))
        } else {
            self.cur_toks
                .iter()
                .filter_map(|(&state, &tok)| {
                    let cost = self.arena.cost(tok) + self.fst.final_weight(state) as f64;
                    (cost != f64::INFINITY).then_some((tok, cost))
                })
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(tok, _)| tok)
        };
        let best_tok = best_tok?;

        // Arcs in reverse order, ending with the sentinel start token.
        let mut arcs_reverse: Vec<LatticeArc> = Vec::new();
        let mut cur = Some(best_tok);
        while let Some(id) = cur {
            let tok = self.arena.get(id);
            arcs_reverse.push(LatticeArc::new(
                tok.ilabel,
                tok.olabel,
                LatticeWeight::new(tok.graph_cost, tok.acoustic_cost),
                tok.nextstate,
            ));
            cur = tok.prev;
        }
        debug_assert_eq!(
            arcs_reverse.last().map(|a| a.nextstate),
            self.fst.start()
        );
        arcs_reverse.pop(); // sentinel; carries no information

        let mut fst_out = Lattice::new();
        let mut cur_state = fst_out.add_state();
        fst_out.set_start(cur_state);
        for mut arc in arcs_reverse.into_iter().rev() {
            arc.nextstate = fst_out.add_state();
            fst_out.add_arc(cur_state, arc);
            cur_state = arc.nextstate;
        }
        if is_final && use_final_probs {
            let end_state = self.arena.get(best_tok).nextstate;
            fst_out.set_final(
                cur_state,
                LatticeWeight::new(self.fst.final_weight(end_state), 0.0),
            );
        } else {
            fst_out.set_final(cur_state, LatticeWeight::one());
        }
        remove_eps_local(&mut fst_out);
        Some(fst_out)
    }

    /// Propagate emitting arcs from the previous frame's tokens into the
    /// current frame, consuming one frame of acoustic scores. Keeps a
    /// running cutoff of `best_so_far + beam`.
    fn process_emitting<S: FrameScorer + ?Sized>(&mut self, scorer: &S) {
        let frame = self.num_frames_decoded;
        let fst = self.fst;
        let mut cutoff = f64::INFINITY;
        let prev_toks = std::mem::take(&mut self.prev_toks);
        for (&state, &tok) in &prev_toks {
            debug_assert_eq!(state, self.arena.get(tok).nextstate);
            for arc in fst.arcs(state) {
                if arc.ilabel == EPSILON {
                    continue;
                }
                let acoustic_cost = -scorer.log_likelihood(frame, arc.ilabel);
                let total_cost =
                    self.arena.cost(tok) + arc.weight as f64 + acoustic_cost as f64;
                if total_cost >= cutoff {
                    continue;
                }
                if total_cost + (self.beam as f64) < cutoff {
                    cutoff = total_cost + self.beam as f64;
                }
                let new_tok = self.arena.alloc(arc, acoustic_cost, Some(tok));
                match self.cur_toks.get(&arc.nextstate).copied() {
                    None => {
                        self.cur_toks.insert(arc.nextstate, new_tok);
                    }
                    Some(existing) => {
                        if self.arena.cost(existing) > self.arena.cost(new_tok) {
                            self.arena.release(existing);
                            self.cur_toks.insert(arc.nextstate, new_tok);
                        } else {
                            self.arena.release(new_tok);
                        }
                    }
                }
            }
        }
        self.prev_toks = prev_toks;
        self.num_frames_decoded += 1;
    }

    /// Close the current frame under non-emitting arcs: LIFO queue over
    /// active states, merging by minimum cost, bounded by `best + beam`.
    fn process_nonemitting(&mut self) {
        let fst = self.fst;
        let mut queue: Vec<StateId> = Vec::new();
        let mut best_cost = f64::INFINITY;
        for (&state, &tok) in &self.cur_toks {
            queue.push(state);
            best_cost = best_cost.min(self.arena.cost(tok));
        }
        let cutoff = best_cost + self.beam as f64;

        while let Some(state) = queue.pop() {
            let tok = self.cur_toks[&state];
            debug_assert_eq!(state, self.arena.get(tok).nextstate);
            for arc in fst.arcs(state) {
                if arc.ilabel != EPSILON {
                    continue;
                }
                let new_tok = self.arena.alloc(arc, 0.0, Some(tok));
                if self.arena.cost(new_tok) > cutoff {
                    self.arena.release(new_tok);
                    continue;
                }
                match self.cur_toks.get(&arc.nextstate).copied() {
                    None => {
                        self.cur_toks.insert(arc.nextstate, new_tok);
                        queue.push(arc.nextstate);
                    }
                    Some(existing) => {
                        if self.arena.cost(existing) > self.arena.cost(new_tok) {
                            self.arena.release(existing);
                            self.cur_toks.insert(arc.nextstate, new_tok);
                            queue.push(arc.nextstate);
                        } else {
                            self.arena.release(new_tok);
                        }
                    }
                }
            }
        }
    }

    /// Keep current tokens with cost strictly below `best + beam`.
    fn prune_toks(&mut self) {
        if self.cur_toks.is_empty() {
            debug!("no tokens to prune");
            return;
        }
        let best_cost = self
            .cur_toks
            .values()
            .map(|&t| self.arena.cost(t))
            .fold(f64::INFINITY, f64::min);
        let cutoff = best_cost + self.beam as f64;
        let before = self.cur_toks.len();
        let pruned: Vec<(StateId, TokenId)> = self
            .cur_toks
            .iter()
            .filter(|&(_, &tok)| self.arena.cost(tok) >= cutoff)
            .map(|(&s, &t)| (s, t))
            .collect();
        for (state, tok) in pruned {
            self.cur_toks.remove(&state);
            self.arena.release(tok);
        }
        debug!("pruned from {} to {} toks", before, self.cur_toks.len());
    }

    fn clear_toks(&mut self, current: bool) {
        let toks = if current {
            std::mem::take(&mut self.cur_toks)
        } else {
            std::mem::take(&mut self.prev_toks)
        };
        for (_, tok) in toks {
            self.arena.release(tok);
        }
    }
}

impl<G: TransitionGraph> Drop for SimpleDecoder<'_, G> {
    fn drop(&mut self) {
        self.clear_toks(true);
        self.clear_toks(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::VectorGraph;
    use crate::scorer::MatrixScorer;

    /// Linear graph over 3 emitting arcs (ilabels 1, 2, 3), all graph
    /// weights 0, final state 3.
    fn linear_graph() -> VectorGraph {
        VectorGraph::new(
            4,
            Some(0),
            &[(3, 0.0)],
            &[0, 1, 2],
            &[1, 2, 3],
            &[1, 2, 3],
            &[0.0, 0.0, 0.0],
            &[1, 2, 3],
        ).unwrap()
    }

    /// Identity-dominant scorer: log[f, f] = 0, everything else -10.
    fn identity_scorer() -> MatrixScorer<'static> {
        let mut m = vec![-10.0f32; 9];
        for f in 0..3 {
            m[f * 3 + f] = 0.0;
        }
        MatrixScorer::from_matrix(m, 3, 3).unwrap()
    }

    fn path_ilabels(lat: &Lattice) -> Vec<i32> {
        let mut v = Vec::new();
        let mut s = lat.start().unwrap();
        while let Some(arc) = lat.arcs(s).first() {
            v.push(arc.ilabel);
            s = arc.nextstate;
        }
        v
    }

    fn path_total_cost(lat: &Lattice) -> f32 {
        let mut total = 0.0;
        let mut s = lat.start().unwrap();
        while let Some(arc) = lat.arcs(s).first() {
            total += arc.weight.total();
            s = arc.nextstate;
        }
        total + lat.final_weight(s).total()
    }

    #[test]
    fn test_linear_best_path() {
        let g = linear_graph();
        let scorer = identity_scorer();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        assert!(dec.decode(&scorer).unwrap());
        assert!(dec.reached_final());
        assert_eq!(dec.final_relative_cost(), 0.0);

        let lat = dec.get_best_path(true).unwrap();
        assert_eq!(path_ilabels(&lat), vec![1, 2, 3]);
        assert_eq!(path_total_cost(&lat), 0.0);
    }

    #[test]
    fn test_fork_prefers_cheaper_branch() {
        // Fork at the start, join at state 3; graph weight 1.0 per arc on
        // the top branch, 2.0 on the bottom; acoustics all zero.
        let g = VectorGraph::new(
            4,
            Some(0),
            &[(3, 0.0)],
            &[0, 1, 0, 2],
            &[1, 2, 1, 2],
            &[10, 11, 20, 21],
            &[1.0, 1.0, 2.0, 2.0],
            &[1, 3, 2, 3],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0; 4], 2, 2).unwrap();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        assert!(dec.decode(&scorer).unwrap());
        assert!(dec.reached_final());

        let lat = dec.get_best_path(true).unwrap();
        let mut olabels = Vec::new();
        let mut s = lat.start().unwrap();
        while let Some(arc) = lat.arcs(s).first() {
            olabels.push(arc.olabel);
            s = arc.nextstate;
        }
        assert_eq!(olabels, vec![10, 11]);
        assert_eq!(path_total_cost(&lat), 2.0);
    }

    #[test]
    fn test_zero_frames_ready() {
        let g = linear_graph();
        let scorer = MatrixScorer::from_matrix(vec![], 0, 3).unwrap();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        // Only the start token exists; no final state is reachable without
        // consuming frames.
        assert!(dec.decode(&scorer).unwrap());
        assert!(!dec.reached_final());
        assert_eq!(dec.final_relative_cost(), f32::INFINITY);
    }

    #[test]
    fn test_advance_decoding_frame_cap() {
        let g = VectorGraph::new(
            6,
            Some(0),
            &[(5, 0.0)],
            &[0, 1, 2, 3, 4],
            &[1, 1, 1, 1, 1],
            &[0, 0, 0, 0, 0],
            &[0.0; 5],
            &[1, 2, 3, 4, 5],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0; 5], 5, 1).unwrap();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        dec.init_decoding().unwrap();
        for expected in 1..=5 {
            dec.advance_decoding(&scorer, Some(1)).unwrap();
            assert_eq!(dec.num_frames_decoded(), expected);
        }
        // Already at the end; another capped call is a no-op.
        dec.advance_decoding(&scorer, Some(1)).unwrap();
        assert_eq!(dec.num_frames_decoded(), 5);
    }

    #[test]
    fn test_advance_before_init_is_usage_error() {
        let g = linear_graph();
        let scorer = identity_scorer();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        assert!(matches!(
            dec.advance_decoding(&scorer, None),
            Err(DecodeError::Usage(_))
        ));
    }

    #[test]
    fn test_epsilon_closure_applies_graph_cost() {
        // 0 -1:1-> 1 -eps/0.5-> 2(final); the epsilon hop must show up in
        // the total cost but be collapsed out of the best path.
        let g = VectorGraph::new(
            3,
            Some(0),
            &[(2, 0.0)],
            &[0, 1],
            &[1, 0],
            &[1, 0],
            &[0.0, 0.5],
            &[1, 2],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0], 1, 1).unwrap();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        assert!(dec.decode(&scorer).unwrap());
        assert!(dec.reached_final());
        let lat = dec.get_best_path(true).unwrap();
        assert_eq!(path_ilabels(&lat), vec![1]);
        assert!((path_total_cost(&lat) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_positive_epsilon_cycle_terminates() {
        // eps cycle 1 <-> 2 with positive weights; closure must stop once
        // costs exceed the cutoff.
        let g = VectorGraph::new(
            3,
            Some(0),
            &[(2, 0.0)],
            &[0, 1, 2],
            &[1, 0, 0],
            &[1, 0, 0],
            &[0.0, 0.5, 0.5],
            &[1, 2, 1],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0], 1, 1).unwrap();
        let mut dec = SimpleDecoder::new(&g, 4.0).unwrap();
        assert!(dec.decode(&scorer).unwrap());
        assert!(dec.reached_final());
    }

    #[test]
    fn test_decode_twice_is_deterministic() {
        let g = linear_graph();
        let scorer = identity_scorer();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        dec.decode(&scorer).unwrap();
        let first = path_ilabels(&dec.get_best_path(true).unwrap());
        dec.decode(&scorer).unwrap();
        let second = path_ilabels(&dec.get_best_path(true).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_arc_acoustic_cost() {
        // One emitting arc, one frame: the emitted arc's acoustic cost is
        // the negated log-likelihood of its ilabel.
        let g = VectorGraph::new(
            2,
            Some(0),
            &[(1, 0.0)],
            &[0],
            &[1],
            &[1],
            &[0.25],
            &[1],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![-0.7], 1, 1).unwrap();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        assert!(dec.decode(&scorer).unwrap());
        let lat = dec.get_best_path(true).unwrap();
        let arc = lat.arcs(lat.start().unwrap())[0];
        assert_eq!(arc.ilabel, 1);
        assert_eq!(arc.weight.graph_cost, 0.25);
        assert_eq!(arc.weight.acoustic_cost, 0.7);
    }

    #[test]
    fn test_empty_graph_is_graph_error() {
        let g = VectorGraph::new(0, None, &[], &[], &[], &[], &[], &[]).unwrap();
        let mut dec = SimpleDecoder::new(&g, 16.0).unwrap();
        assert!(matches!(dec.init_decoding(), Err(DecodeError::Graph(_))));
    }

    #[test]
    fn test_rejects_nonpositive_beam() {
        let g = linear_graph();
        assert!(matches!(
            SimpleDecoder::new(&g, 0.0),
            Err(DecodeError::Config(_))
        ));
    }
}
