//! Token-passing decoder with an adaptive beam and an intrusive hash-list
//! frontier.
//!
//! Same search semantics as `SimpleDecoder`, with two changes in the
//! bookkeeping: the active set lives in an insertion-ordered `HashList`
//! (O(1) lookup plus a sequential walk for cutoffs and frame rollover), and
//! the per-frame cutoff adapts to `max_active`/`min_active` bounds on the
//! frontier size. Emitting propagation is two-pass: the best token of the
//! previous frame is expanded first to seed a tight cutoff for everyone
//! else.

use crate::error::DecodeError;
use crate::fst::{Arc, TransitionGraph, EPSILON};
use crate::hash_list::{ElemId, HashList};
use crate::lattice::{remove_eps_local, Lattice, LatticeArc};
use crate::scorer::FrameScorer;
use crate::token::{TokenArena, TokenId};
use crate::weight::LatticeWeight;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FasterDecoderOptions {
    /// Decoding beam. Larger is slower but more accurate.
    pub beam: f32,
    /// Cap on active states per frame.
    pub max_active: i32,
    /// Floor on active states per frame (don't prune below this).
    pub min_active: i32,
    /// Increment added to the adaptive beam when an active-state bound
    /// overrides the plain beam cutoff.
    pub beam_delta: f32,
    /// Bucket count divided by token count for the hash list.
    pub hash_ratio: f32,
}

impl Default for FasterDecoderOptions {
    fn default() -> Self {
        FasterDecoderOptions {
            beam: 16.0,
            max_active: i32::MAX,
            // This decoder is mostly used for alignment; small default.
            min_active: 20,
            beam_delta: 0.5,
            hash_ratio: 2.0,
        }
    }
}

impl FasterDecoderOptions {
    pub fn check(&self) -> Result<(), DecodeError> {
        if self.beam <= 0.0 {
            return Err(DecodeError::Config(format!(
                "beam must be > 0, got {}",
                self.beam
            )));
        }
        if self.max_active <= 1 {
            return Err(DecodeError::Config(format!(
                "max_active must be > 1, got {}",
                self.max_active
            )));
        }
        if self.min_active < 0 || self.min_active >= self.max_active {
            return Err(DecodeError::Config(format!(
                "min_active must be in [0, max_active), got {}",
                self.min_active
            )));
        }
        if self.hash_ratio < 1.0 {
            return Err(DecodeError::Config(format!(
                "hash_ratio must be >= 1, got {}",
                self.hash_ratio
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FasterDecoderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FasterDecoderOptions(beam={}, max_active={}, min_active={}, beam_delta={}, hash_ratio={})",
            self.beam, self.max_active, self.min_active, self.beam_delta, self.hash_ratio
        )
    }
}

/// Result of the per-frame cutoff computation.
struct Cutoff {
    weight_cutoff: f64,
    adaptive_beam: f32,
    tok_count: usize,
    best_elem: Option<ElemId>,
}

pub struct FasterDecoder<'a, G: TransitionGraph> {
    fst: &'a G,
    config: FasterDecoderOptions,
    toks: HashList<TokenId>,
    arena: TokenArena,
    // Scratch for the non-emitting closure and the nth-element cutoffs.
    queue: Vec<ElemId>,
    tmp_array: Vec<f32>,
    num_frames_decoded: i32,
}

impl<'a, G: TransitionGraph> FasterDecoder<'a, G> {
    pub fn new(fst: &'a G, config: FasterDecoderOptions) -> Result<Self, DecodeError> {
        config.check()?;
        let mut toks = HashList::new();
        // Just so we do something reasonable on the first frame.
        toks.set_size(1000);
        Ok(FasterDecoder {
            fst,
            config,
            toks,
            arena: TokenArena::new(),
            queue: Vec::new(),
            tmp_array: Vec::new(),
            num_frames_decoded: -1,
        })
    }

    pub fn set_options(&mut self, config: FasterDecoderOptions) -> Result<(), DecodeError> {
        config.check()?;
        self.config = config;
        Ok(())
    }

    pub fn decode<S: FrameScorer + ?Sized>(&mut self, scorer: &S) -> Result<(), DecodeError> {
        self.init_decoding()?;
        self.advance_decoding(scorer, None)
    }

    pub fn init_decoding(&mut self) -> Result<(), DecodeError> {
        let list = self.toks.clear_and_take_list();
        self.clear_toks(list);
        let start_state = self
            .fst
            .start()
            .ok_or_else(|| DecodeError::Graph("graph has no start state".into()))?;
        let dummy_arc = Arc::new(0, 0, 0.0, start_state);
        let tok = self.arena.alloc(&dummy_arc, 0.0, None);
        self.toks.insert(start_state, tok);
        self.process_nonemitting(f64::INFINITY);
        self.num_frames_decoded = 0;
        Ok(())
    }

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
            let weight_cutoff = self.process_emitting(scorer);
            self.process_nonemitting(weight_cutoff);
        }
        Ok(())
    }

    pub fn num_frames_decoded(&self) -> i32 {
        self.num_frames_decoded
    }

    /// True if a final state is active on the last decoded frame.
    pub fn reached_final(&self) -> bool {
        let mut e = self.toks.head();
        while let Some(id) = e {
            let elem = self.toks.elem(id);
            if self.arena.cost(elem.val) != f64::INFINITY
                && self.fst.final_weight(elem.key) != f32::INFINITY
            {
                return true;
            }
            e = elem.tail;
        }
        false
    }

    pub fn final_relative_cost(&self) -> f32 {
        let mut best_cost = f64::INFINITY;
        let mut best_cost_with_final = f64::INFINITY;
        let mut any = false;
        let mut e = self.toks.head();
        while let Some(id) = e {
            let elem = self.toks.elem(id);
            let cost = self.arena.cost(elem.val);
            best_cost = best_cost.min(cost);
            best_cost_with_final =
                best_cost_with_final.min(cost + self.fst.final_weight(elem.key) as f64);
            any = true;
            e = elem.tail;
        }
        if !any {
            return f32::INFINITY;
        }
        (best_cost_with_final - best_cost) as f32
    }

    /// Best-path traceback as a linear lattice; see
    /// `SimpleDecoder::get_best_path` for the `use_final_probs` contract.
    pub fn get_best_path(&self, use_final_probs: bool) -> Option<Lattice> {
        let is_final = self.reached_final();
        let mut best_tok: Option<TokenId> = None;
        let mut best_cost = f64::INFINITY;
        let mut e = self.toks.head();
        while let Some(id) = e {
            let elem = self.toks.elem(id);
            let this_cost = if is_final {
                self.arena.cost(elem.val) + self.fst.final_weight(elem.key) as f64
            } else {
                self.arena.cost(elem.val)
            };
            if this_cost < best_cost && this_cost != f64::INFINITY {
                best_cost = this_cost;
                best_tok = Some(elem.val);
            }
            e = elem.tail;
        }
        let best_tok = best_tok?;

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
        arcs_reverse.pop(); // sentinel start token

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

    /// Weight cutoff for the frame whose tokens start at `list_head`, plus
    /// the adaptive beam, token count, and best element. One sequential
    /// walk collects the costs; `max_active`/`min_active` tighten or loosen
    /// the plain `best + beam` cutoff via nth-element selection.
    fn get_cutoff(&mut self, list_head: Option<ElemId>) -> Cutoff {
        let mut best_cost = f64::INFINITY;
        let mut best_elem: Option<ElemId> = None;
        let mut count = 0usize;

        if self.config.max_active == i32::MAX && self.config.min_active == 0 {
            // No constraints.
            let mut e = list_head;
            while let Some(id) = e {
                let elem = self.toks.elem(id);
                let w = self.arena.cost(elem.val);
                if w < best_cost {
                    best_cost = w;
                    best_elem = Some(id);
                }
                count += 1;
                e = elem.tail;
            }
            return Cutoff {
                weight_cutoff: best_cost + self.config.beam as f64,
                adaptive_beam: self.config.beam,
                tok_count: count,
                best_elem,
            };
        }

        self.tmp_array.clear();
        let mut e = list_head;
        while let Some(id) = e {
            let elem = self.toks.elem(id);
            let w = self.arena.cost(elem.val);
            self.tmp_array.push(w as f32);
            if w < best_cost {
                best_cost = w;
                best_elem = Some(id);
            }
            count += 1;
            e = elem.tail;
        }

        let beam_cutoff = best_cost + self.config.beam as f64;
        let max_active = self.config.max_active as usize;
        let min_active = self.config.min_active as usize;
        let mut max_active_cutoff = f64::INFINITY;

        if self.tmp_array.len() > max_active {
            let (_, nth, _) = self
                .tmp_array
                .select_nth_unstable_by(max_active, f32::total_cmp);
            max_active_cutoff = *nth as f64;
        }

        if max_active_cutoff < beam_cutoff {
            // max_active is tighter than beam.
            return Cutoff {
                weight_cutoff: max_active_cutoff,
                adaptive_beam: (max_active_cutoff - best_cost) as f32 + self.config.beam_delta,
                tok_count: count,
                best_elem,
            };
        }

        let mut min_active_cutoff = f64::INFINITY;
        if self.tmp_array.len() > min_active {
            if min_active == 0 {
                min_active_cutoff = best_cost;
            } else {
                // Keep the selection within the first max_active elements if
                // that bound applied above.
                let bound = self.tmp_array.len().min(max_active);
                let (_, nth, _) =
                    self.tmp_array[..bound].select_nth_unstable_by(min_active, f32::total_cmp);
                min_active_cutoff = *nth as f64;
            }
        }

        if min_active_cutoff > beam_cutoff {
            // min_active is looser than beam.
            Cutoff {
                weight_cutoff: min_active_cutoff,
                adaptive_beam: (min_active_cutoff - best_cost) as f32 + self.config.beam_delta,
                tok_count: count,
                best_elem,
            }
        } else {
            Cutoff {
                weight_cutoff: beam_cutoff,
                adaptive_beam: self.config.beam,
                tok_count: count,
                best_elem,
            }
        }
    }

    /// Grow the hash to `num_toks * hash_ratio` buckets. Never shrinks.
    fn possibly_resize_hash(&mut self, num_toks: usize) {
        let new_sz = (num_toks as f32 * self.config.hash_ratio) as usize;
        if new_sz > self.toks.size() {
            self.toks.set_size(new_sz);
        }
    }

    /// Decode one frame of emitting arcs; returns the cutoff bound for the
    /// frame's non-emitting closure.
    fn process_emitting<S: FrameScorer + ?Sized>(&mut self, scorer: &S) -> f64 {
        let fst = self.fst;
        let frame = self.num_frames_decoded;
        let last_toks = self.toks.clear_and_take_list();
        let Cutoff {
            weight_cutoff,
            adaptive_beam,
            tok_count,
            best_elem,
        } = self.get_cutoff(last_toks);

        // The hash must be big enough for the tokens we are about to insert.
        self.possibly_resize_hash(tok_count);

        // Bound on the cutoff we will use for the next frame, after adding
        // in the log-likelihoods.
        let mut next_weight_cutoff = f64::INFINITY;

        // First process the best token, to get a hopefully reasonably tight
        // bound on the next cutoff.
        if let Some(best) = best_elem {
            let state = self.toks.elem(best).key;
            let tok = self.toks.elem(best).val;
            for arc in fst.arcs(state) {
                if arc.ilabel != EPSILON {
                    let ac_cost = -scorer.log_likelihood(frame, arc.ilabel);
                    let new_weight =
                        arc.weight as f64 + self.arena.cost(tok) + ac_cost as f64;
                    if new_weight + (adaptive_beam as f64) < next_weight_cutoff {
                        next_weight_cutoff = new_weight + adaptive_beam as f64;
                    }
                }
            }
        }

        // The previous frame's tokens are now owned by the detached list;
        // each element must be released and deleted as we pass it.
        let mut e = last_toks;
        while let Some(id) = e {
            let state = self.toks.elem(id).key;
            let tok = self.toks.elem(id).val;
            if self.arena.cost(tok) < weight_cutoff {
                // Not pruned.
                debug_assert_eq!(state, self.arena.get(tok).nextstate);
                for arc in fst.arcs(state) {
                    if arc.ilabel == EPSILON {
                        continue;
                    }
                    let ac_cost = -scorer.log_likelihood(frame, arc.ilabel);
                    let new_weight = arc.weight as f64 + self.arena.cost(tok) + ac_cost as f64;
                    if new_weight >= next_weight_cutoff {
                        continue;
                    }
                    let new_tok = self.arena.alloc(arc, ac_cost, Some(tok));
                    let e_found = self.toks.insert(arc.nextstate, new_tok);

                    if new_weight + (adaptive_beam as f64) < next_weight_cutoff {
                        next_weight_cutoff = new_weight + adaptive_beam as f64;
                    }

                    let existing = self.toks.elem(e_found).val;
                    if existing != new_tok {
                        if self.arena.cost(existing) > self.arena.cost(new_tok) {
                            self.arena.release(existing);
                            self.toks.elem_mut(e_found).val = new_tok;
                        } else {
                            self.arena.release(new_tok);
                        }
                    }
                }
            }
            let tail = self.toks.elem(id).tail;
            self.arena.release(tok);
            self.toks.delete(id);
            e = tail;
        }
        self.num_frames_decoded += 1;
        next_weight_cutoff
    }

    /// Queue-driven closure over epsilon arcs on the current frame, bounded
    /// by `cutoff`.
    fn process_nonemitting(&mut self, cutoff: f64) {
        let fst = self.fst;
        debug_assert!(self.queue.is_empty());
        let mut queue = std::mem::take(&mut self.queue);

        let mut e = self.toks.head();
        while let Some(id) = e {
            queue.push(id);
            e = self.toks.elem(id).tail;
        }

        while let Some(id) = queue.pop() {
            let state = self.toks.elem(id).key;
            let tok = self.toks.elem(id).val;
            if self.arena.cost(tok) > cutoff {
                // Don't bother processing successors.
                continue;
            }
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
                let e_found = self.toks.insert(arc.nextstate, new_tok);
                let existing = self.toks.elem(e_found).val;
                if existing == new_tok {
                    // Inserted fresh.
                    queue.push(e_found);
                } else if self.arena.cost(existing) > self.arena.cost(new_tok) {
                    // Keep the lower-cost token.
                    self.arena.release(existing);
                    self.toks.elem_mut(e_found).val = new_tok;
                    queue.push(e_found);
                } else {
                    self.arena.release(new_tok);
                }
            }
        }
        self.queue = queue;
    }

    fn clear_toks(&mut self, list: Option<ElemId>) {
        let mut e = list;
        while let Some(id) = e {
            let tok = self.toks.elem(id).val;
            self.arena.release(tok);
            let tail = self.toks.elem(id).tail;
            self.toks.delete(id);
            e = tail;
        }
    }
}

impl<G: TransitionGraph> Drop for FasterDecoder<'_, G> {
    fn drop(&mut self) {
        let list = self.toks.clear_and_take_list();
        self.clear_toks(list);
    }
}
