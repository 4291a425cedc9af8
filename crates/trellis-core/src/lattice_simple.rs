//! Lattice-generating token-passing decoder.
//!
//! On top of the Viterbi search this decoder records, for every surviving
//! token, the forward links to its successor tokens (on the next frame for
//! emitting arcs, on the same frame for epsilon arcs), so that a state-level
//! lattice can be read off afterwards. Backward pruning keeps the recorded
//! graph within `lattice_beam` of the best path: every `prune_interval`
//! frames a sweep walks from the most recent frame toward the start,
//! recomputing per-token `extra_cost` (the slack between the best path
//! through the token and the global best) to a fixed point and excising
//! links whose slack exceeds the lattice beam. Tokens whose `extra_cost`
//! reaches `+∞` are unlinked on a later pass so no dangling references are
//! ever followed.
//!
//! Tokens and links live in index slabs with free lists; per-frame token
//! lists and per-token link lists are index-chained.

use crate::error::DecodeError;
use crate::fst::{Label, StateId, TransitionGraph, EPSILON};
use crate::lattice::{shortest_path, Lattice, LatticeArc};
use crate::scorer::FrameScorer;
use crate::weight::{approx_equal, LatticeWeight};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeSimpleDecoderConfig {
    /// Decoding beam.
    pub beam: f32,
    /// Lattice generation beam: slack kept around the best path.
    pub lattice_beam: f32,
    /// Interval (in frames) between backward pruning sweeps.
    pub prune_interval: i32,
    /// Scales lattice_beam down for the interim sweeps; the final sweep
    /// uses the full beam.
    pub prune_scale: f32,
}

impl Default for LatticeSimpleDecoderConfig {
    fn default() -> Self {
        LatticeSimpleDecoderConfig {
            beam: 16.0,
            lattice_beam: 10.0,
            prune_interval: 25,
            prune_scale: 0.1,
        }
    }
}

impl LatticeSimpleDecoderConfig {
    pub fn check(&self) -> Result<(), DecodeError> {
        if self.beam <= 0.0 {
            return Err(DecodeError::Config(format!(
                "beam must be > 0, got {}",
                self.beam
            )));
        }
        if self.lattice_beam <= 0.0 {
            return Err(DecodeError::Config(format!(
                "lattice_beam must be > 0, got {}",
                self.lattice_beam
            )));
        }
        if self.prune_interval <= 0 {
            return Err(DecodeError::Config(format!(
                "prune_interval must be > 0, got {}",
                self.prune_interval
            )));
        }
        if !(self.prune_scale > 0.0 && self.prune_scale < 1.0) {
            return Err(DecodeError::Config(format!(
                "prune_scale must be in (0, 1), got {}",
                self.prune_scale
            )));
        }
        Ok(())
    }
}

impl fmt::Display for LatticeSimpleDecoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LatticeSimpleDecoderConfig(beam={}, lattice_beam={}, prune_interval={}, prune_scale={})",
            self.beam, self.lattice_beam, self.prune_interval, self.prune_scale
        )
    }
}

type TokId = u32;
type LinkId = u32;

/// One recorded arc instance from a token to a successor token.
#[derive(Debug, Clone, Copy)]
struct ForwardLink {
    next_tok: TokId,
    ilabel: Label,
    olabel: Label,
    graph_cost: f32,
    acoustic_cost: f32,
    next: Option<LinkId>,
}

/// A token resident at one state on one frame. `extra_cost` is the backward
/// pruning slack: after `prune_forward_links` stabilizes it equals the
/// minimum over outgoing links of the link slack, clamped to 0, and `+∞`
/// marks the token for deletion.
#[derive(Debug, Clone, Copy)]
struct Token {
    tot_cost: f32,
    extra_cost: f32,
    links: Option<LinkId>,
    next: Option<TokId>,
}

/// Head of one frame's token list plus the pruning dirty flags, seeded true
/// so every frame gets at least one sweep.
struct TokenList {
    toks: Option<TokId>,
    must_prune_forward_links: bool,
    must_prune_tokens: bool,
}

impl TokenList {
    fn new() -> Self {
        TokenList {
            toks: None,
            must_prune_forward_links: true,
            must_prune_tokens: true,
        }
    }
}

pub struct LatticeSimpleDecoder<'a, G: TransitionGraph> {
    fst: &'a G,
    config: LatticeSimpleDecoderConfig,

    toks: Vec<Token>,
    tok_free: Vec<TokId>,
    links: Vec<ForwardLink>,
    link_free: Vec<LinkId>,
    /// Live tokens across all of active_toks; kept exact.
    num_toks: i32,

    cur_toks: FxHashMap<StateId, TokId>,
    prev_toks: FxHashMap<StateId, TokId>,
    /// Token lists indexed by frame.
    active_toks: Vec<TokenList>,

    warned: bool,
    /// Set by finalize_decoding(); decoding further is then forbidden, and
    /// the three cached final-cost values below are valid. cur_toks is
    /// cleared at that point because finalization may free tokens on the
    /// last frame.
    decoding_finalized: bool,
    final_costs: FxHashMap<TokId, f32>,
    final_relative_cost: f32,
    final_best_cost: f32,
}

impl<'a, G: TransitionGraph> LatticeSimpleDecoder<'a, G> {
    pub fn new(fst: &'a G, config: LatticeSimpleDecoderConfig) -> Result<Self, DecodeError> {
        config.check()?;
        Ok(LatticeSimpleDecoder {
            fst,
            config,
            toks: Vec::new(),
            tok_free: Vec::new(),
            links: Vec::new(),
            link_free: Vec::new(),
            num_toks: 0,
            cur_toks: FxHashMap::default(),
            prev_toks: FxHashMap::default(),
            active_toks: Vec::new(),
            warned: false,
            decoding_finalized: false,
            final_costs: FxHashMap::default(),
            final_relative_cost: f32::INFINITY,
            final_best_cost: f32::INFINITY,
        })
    }

    pub fn config(&self) -> &LatticeSimpleDecoderConfig {
        &self.config
    }

    pub fn num_frames_decoded(&self) -> i32 {
        self.active_toks.len() as i32 - 1
    }

    /// Decode the whole utterance: init, per-frame emitting/pruning/closure,
    /// then finalize. Returns true if any traceback is available (not
    /// necessarily reaching a final state).
    pub fn decode<S: FrameScorer + ?Sized>(&mut self, scorer: &S) -> Result<bool, DecodeError> {
        self.init_decoding()?;

        while !scorer.is_last_frame(self.num_frames_decoded() - 1) {
            if self.num_frames_decoded() % self.config.prune_interval == 0 {
                self.prune_active_tokens(self.config.lattice_beam * self.config.prune_scale);
            }
            self.process_emitting(scorer);
            // Pruning the map must precede the non-emitting closure, or the
            // closure would extend tokens the map no longer knows about and
            // leave dangling forward pointers.
            self.prune_current_tokens();
            self.process_nonemitting();
        }
        self.finalize_decoding();
        Ok(!self.final_costs.is_empty())
    }

    pub fn init_decoding(&mut self) -> Result<(), DecodeError> {
        self.cur_toks.clear();
        self.prev_toks.clear();
        self.clear_active_tokens();
        self.warned = false;
        self.decoding_finalized = false;
        self.final_costs.clear();
        self.toks.clear();
        self.tok_free.clear();
        self.links.clear();
        self.link_free.clear();

        let start_state = self
            .fst
            .start()
            .ok_or_else(|| DecodeError::Graph("graph has no start state".into()))?;
        self.active_toks.push(TokenList::new());
        let start_tok = self.new_token(0.0, 0.0);
        self.active_toks[0].toks = Some(start_tok);
        self.cur_toks.insert(start_state, start_tok);
        self.process_nonemitting();
        Ok(())
    }

    /// Final pruning pass over all frames, using final-probs where a final
    /// state survived. After this, decoding cannot continue and
    /// `get_raw_lattice` requires `use_final_probs = true`.
    pub fn finalize_decoding(&mut self) {
        let final_frame_plus_one = self.num_frames_decoded();
        let num_toks_begin = self.num_toks;
        self.prune_forward_links_final();
        for f in (0..final_frame_plus_one).rev() {
            self.prune_forward_links(f as usize, 0.0);
            self.prune_tokens_for_frame(f as usize + 1);
        }
        self.prune_tokens_for_frame(0);
        debug!(
            "finalize: pruned tokens from {} to {}",
            num_toks_begin, self.num_toks
        );
    }

    /// Difference between the best cost-plus-final-cost and the best cost on
    /// the last frame, or `+∞` when no final state survived there.
    pub fn final_relative_cost(&self) -> f32 {
        if self.decoding_finalized {
            // compute_final_costs() must not run after finalization (the
            // current-frame map has been cleared); use the cached value.
            self.final_relative_cost
        } else {
            self.compute_final_costs().1
        }
    }

    /// Output the raw state-level lattice. Each live token becomes a state;
    /// forward links become arcs; the last frame's states get final weights
    /// from the final-probs (or `One` if `use_final_probs` is false).
    /// Returns `Ok(None)` when some frame has no surviving tokens.
    pub fn get_raw_lattice(&self, use_final_probs: bool) -> Result<Option<Lattice>, DecodeError> {
        if self.decoding_finalized && !use_final_probs {
            return Err(DecodeError::Usage(
                "cannot call get_raw_lattice with use_final_probs == false after finalize_decoding"
                    .into(),
            ));
        }

        let final_costs_local;
        let final_costs: &FxHashMap<TokId, f32> = if self.decoding_finalized {
            &self.final_costs
        } else {
            final_costs_local = if use_final_probs {
                self.compute_final_costs().0
            } else {
                FxHashMap::default()
            };
            &final_costs_local
        };

        let num_frames = self.num_frames_decoded();
        if num_frames <= 0 {
            return Ok(None);
        }

        let mut ofst = Lattice::new();
        let mut tok_map: FxHashMap<TokId, StateId> =
            FxHashMap::with_capacity_and_hasher(self.num_toks as usize, Default::default());

        // First create all states.
        for f in 0..=num_frames as usize {
            if self.active_toks[f].toks.is_none() {
                warn!("no tokens active on frame {}: not producing lattice", f);
                return Ok(None);
            }
            let mut tok = self.active_toks[f].toks;
            while let Some(t) = tok {
                tok_map.insert(t, ofst.add_state());
                tok = self.toks[t as usize].next;
            }
            // Tokens are prepended to each frame's list, so the first one
            // created on frame 0 -- the start token -- is the last state
            // added here.
            if f == 0 && ofst.num_states() > 0 {
                ofst.set_start(ofst.num_states() as StateId - 1);
            }
        }

        // States were numbered consecutively in the same traversal order.
        let mut cur_state: StateId = 0;
        for f in 0..=num_frames as usize {
            let mut tok = self.active_toks[f].toks;
            while let Some(t) = tok {
                let mut link = self.toks[t as usize].links;
                while let Some(l) = link {
                    let fl = self.links[l as usize];
                    let nextstate = tok_map[&fl.next_tok];
                    ofst.add_arc(
                        cur_state,
                        LatticeArc::new(
                            fl.ilabel,
                            fl.olabel,
                            LatticeWeight::new(fl.graph_cost, fl.acoustic_cost),
                            nextstate,
                        ),
                    );
                    link = fl.next;
                }
                if f == num_frames as usize {
                    if use_final_probs && !final_costs.is_empty() {
                        if let Some(&fc) = final_costs.get(&t) {
                            ofst.set_final(cur_state, LatticeWeight::new(fc, 0.0));
                        }
                    } else {
                        ofst.set_final(cur_state, LatticeWeight::one());
                    }
                }
                cur_state += 1;
                tok = self.toks[t as usize].next;
            }
        }
        debug_assert_eq!(cur_state as usize, ofst.num_states());
        Ok(Some(ofst))
    }

    /// Best path through the recorded lattice: `get_raw_lattice` followed by
    /// a tropical shortest path.
    pub fn get_best_path(&self, use_final_probs: bool) -> Result<Option<Lattice>, DecodeError> {
        let Some(raw) = self.get_raw_lattice(use_final_probs)? else {
            return Ok(None);
        };
        let best = shortest_path(&raw);
        Ok(if best.is_empty() { None } else { Some(best) })
    }

    // ------------------------------------------------------------------
    // Slab management
    // ------------------------------------------------------------------

    fn new_token(&mut self, tot_cost: f32, extra_cost: f32) -> TokId {
        let tok = Token {
            tot_cost,
            extra_cost,
            links: None,
            next: None,
        };
        self.num_toks += 1;
        match self.tok_free.pop() {
            Some(id) => {
                self.toks[id as usize] = tok;
                id
            }
            None => {
                let id = self.toks.len() as TokId;
                self.toks.push(tok);
                id
            }
        }
    }

    fn free_token(&mut self, id: TokId) {
        self.delete_forward_links(id);
        self.tok_free.push(id);
        self.num_toks -= 1;
    }

    fn new_link(
        &mut self,
        next_tok: TokId,
        ilabel: Label,
        olabel: Label,
        graph_cost: f32,
        acoustic_cost: f32,
        next: Option<LinkId>,
    ) -> LinkId {
        let link = ForwardLink {
            next_tok,
            ilabel,
            olabel,
            graph_cost,
            acoustic_cost,
            next,
        };
        match self.link_free.pop() {
            Some(id) => {
                self.links[id as usize] = link;
                id
            }
            None => {
                let id = self.links.len() as LinkId;
                self.links.push(link);
                id
            }
        }
    }

    fn delete_forward_links(&mut self, tok: TokId) {
        let mut link = self.toks[tok as usize].links;
        while let Some(l) = link {
            link = self.links[l as usize].next;
            self.link_free.push(l);
        }
        self.toks[tok as usize].links = None;
    }

    fn clear_active_tokens(&mut self) {
        for f in 0..self.active_toks.len() {
            let mut tok = self.active_toks[f].toks;
            while let Some(t) = tok {
                tok = self.toks[t as usize].next;
                self.free_token(t);
            }
        }
        self.active_toks.clear();
        debug_assert_eq!(self.num_toks, 0);
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Locate the token for `state` on `frame`, or insert a new one (into
    /// the map and at the head of the frame's token list). Returns the
    /// token and whether it is new or had its cost lowered.
    fn find_or_add_token(&mut self, state: StateId, frame: usize, tot_cost: f32) -> (TokId, bool) {
        debug_assert!(frame < self.active_toks.len());
        match self.cur_toks.get(&state).copied() {
            None => {
                // Tokens on the current frontier get extra_cost 0: any of
                // them may yet end up on the winning path.
                let tok = self.new_token(tot_cost, 0.0);
                self.toks[tok as usize].next = self.active_toks[frame].toks;
                self.active_toks[frame].toks = Some(tok);
                self.cur_toks.insert(state, tok);
                (tok, true)
            }
            Some(tok) => {
                if self.toks[tok as usize].tot_cost > tot_cost {
                    self.toks[tok as usize].tot_cost = tot_cost;
                    (tok, true)
                } else {
                    (tok, false)
                }
            }
        }
    }

    /// Consume one frame of acoustic scores, propagating emitting arcs from
    /// the previous frame's tokens and recording a forward link for each
    /// surviving arc instance. Keeps a running `best + beam` cutoff.
    fn process_emitting<S: FrameScorer + ?Sized>(&mut self, scorer: &S) {
        let fst = self.fst;
        // Acoustic frame index for the scorer.
        let frame = self.active_toks.len() as i32 - 1;
        self.active_toks.push(TokenList::new());
        let new_frame = self.active_toks.len() - 1;
        self.prev_toks.clear();
        std::mem::swap(&mut self.cur_toks, &mut self.prev_toks);

        let mut cutoff = f32::INFINITY;
        let prev_toks = std::mem::take(&mut self.prev_toks);
        for (&state, &tok) in &prev_toks {
            for arc in fst.arcs(state) {
                if arc.ilabel == EPSILON {
                    continue;
                }
                let ac_cost = -scorer.log_likelihood(frame, arc.ilabel);
                let graph_cost = arc.weight;
                let cur_cost = self.toks[tok as usize].tot_cost;
                let tot_cost = cur_cost + ac_cost + graph_cost;
                if tot_cost >= cutoff {
                    continue;
                } else if tot_cost + self.config.beam < cutoff {
                    cutoff = tot_cost + self.config.beam;
                }
                let (next_tok, _) = self.find_or_add_token(arc.nextstate, new_frame, tot_cost);
                // Record the traversal on the source token's link list.
                let head = self.toks[tok as usize].links;
                let link =
                    self.new_link(next_tok, arc.ilabel, arc.olabel, graph_cost, ac_cost, head);
                self.toks[tok as usize].links = Some(link);
            }
        }
        self.prev_toks = prev_toks;
    }

    /// Close the current frame under epsilon arcs. A state popped from the
    /// queue first drops its existing forward links and regenerates them;
    /// this can redo work when a token's cost is lowered repeatedly within
    /// one closure, which is accepted, and the regeneration order is
    /// deterministic so the lattice shape is reproducible.
    fn process_nonemitting(&mut self) {
        debug_assert!(!self.active_toks.is_empty());
        let fst = self.fst;
        let frame = self.active_toks.len() - 1;

        let mut queue: Vec<StateId> = Vec::new();
        let mut best_cost = f32::INFINITY;
        for (&state, &tok) in &self.cur_toks {
            if fst.num_input_epsilons(state) != 0 {
                queue.push(state);
            }
            best_cost = best_cost.min(self.toks[tok as usize].tot_cost);
        }
        if queue.is_empty() && !self.warned {
            warn!(
                "no tokens entered the non-emitting closure on frame {}",
                frame as i32 - 1
            );
            self.warned = true;
        }
        let cutoff = best_cost + self.config.beam;

        while let Some(state) = queue.pop() {
            let tok = self.cur_toks[&state];
            // About to regenerate this token's epsilon links.
            self.delete_forward_links(tok);
            for arc in fst.arcs(state) {
                if arc.ilabel != EPSILON {
                    continue;
                }
                let graph_cost = arc.weight;
                let cur_cost = self.toks[tok as usize].tot_cost;
                let tot_cost = cur_cost + graph_cost;
                if tot_cost < cutoff {
                    let (new_tok, changed) =
                        self.find_or_add_token(arc.nextstate, frame, tot_cost);
                    let head = self.toks[tok as usize].links;
                    let link = self.new_link(new_tok, 0, arc.olabel, graph_cost, 0.0, head);
                    self.toks[tok as usize].links = Some(link);
                    // A new or improved target may in turn have epsilon
                    // successors to revisit.
                    if changed && fst.num_input_epsilons(arc.nextstate) != 0 {
                        queue.push(arc.nextstate);
                    }
                }
            }
        }
    }

    /// Beam-prune the current frame's map. The frame's token-list overlay
    /// is left alone (tokens may still carry links from the closure); the
    /// backward sweep reclaims them without dangling pointers.
    fn prune_current_tokens(&mut self) {
        if self.cur_toks.is_empty() {
            debug!("no tokens to prune");
            return;
        }
        let mut best_cost = f32::INFINITY;
        for &tok in self.cur_toks.values() {
            best_cost = best_cost.min(self.toks[tok as usize].tot_cost);
        }
        let cutoff = best_cost + self.config.beam;
        let toks = &self.toks;
        self.cur_toks
            .retain(|_, tok| toks[*tok as usize].tot_cost < cutoff);
        debug!("pruned to {} toks", self.cur_toks.len());
    }

    /// Recompute `extra_cost` for every token on `frame` to a fixed point
    /// (epsilon arcs can create intra-frame back edges, so one pass is not
    /// enough), excising links whose slack exceeds `lattice_beam`. `delta`
    /// is the change threshold below which an `extra_cost` update does not
    /// count as a change. Returns (extra_costs_changed, links_pruned).
    fn prune_forward_links(&mut self, frame: usize, delta: f32) -> (bool, bool) {
        let mut extra_costs_changed = false;
        let mut links_pruned = false;
        debug_assert!(frame < self.active_toks.len());

        if self.active_toks[frame].toks.is_none() && !self.warned {
            // This should not happen.
            warn!("no tokens alive while pruning forward links");
            self.warned = true;
        }

        let mut changed = true;
        while changed {
            changed = false;
            let mut tok_iter = self.active_toks[frame].toks;
            while let Some(tok) = tok_iter {
                let mut tok_extra_cost = f32::INFINITY;
                let mut prev_link: Option<LinkId> = None;
                let mut link_iter = self.toks[tok as usize].links;
                while let Some(link) = link_iter {
                    let fl = self.links[link as usize];
                    let next_tok = &self.toks[fl.next_tok as usize];
                    let link_extra_cost = next_tok.extra_cost
                        + ((self.toks[tok as usize].tot_cost + fl.acoustic_cost + fl.graph_cost)
                            - next_tok.tot_cost);
                    debug_assert!(!link_extra_cost.is_nan());
                    if link_extra_cost > self.config.lattice_beam {
                        // Excise the link; prev_link stays put.
                        match prev_link {
                            Some(p) => self.links[p as usize].next = fl.next,
                            None => self.toks[tok as usize].links = fl.next,
                        }
                        self.link_free.push(link);
                        link_iter = fl.next;
                        links_pruned = true;
                    } else {
                        let mut link_extra_cost = link_extra_cost;
                        if link_extra_cost < 0.0 {
                            if link_extra_cost < -0.01 && !self.warned {
                                warn!("negative extra cost {}", link_extra_cost);
                                self.warned = true;
                            }
                            link_extra_cost = 0.0;
                        }
                        if link_extra_cost < tok_extra_cost {
                            tok_extra_cost = link_extra_cost;
                        }
                        prev_link = Some(link);
                        link_iter = fl.next;
                    }
                }
                if (tok_extra_cost - self.toks[tok as usize].extra_cost).abs() > delta {
                    changed = true;
                }
                // Will be +infinity or <= lattice_beam.
                self.toks[tok as usize].extra_cost = tok_extra_cost;
                tok_iter = self.toks[tok as usize].next;
            }
            if changed {
                extra_costs_changed = true;
            }
        }
        (extra_costs_changed, links_pruned)
    }

    /// Variant of `prune_forward_links` for the last frame: a token's
    /// starting slack is its cost-plus-final-cost relative to the best such
    /// cost, so directly-final tokens survive on that strength alone.
    fn prune_forward_links_final(&mut self) {
        debug_assert!(!self.active_toks.is_empty());
        let frame_plus_one = self.active_toks.len() - 1;

        if self.active_toks[frame_plus_one].toks.is_none() && !self.warned {
            warn!("no tokens alive at end of utterance");
            self.warned = true;
        }

        let (final_costs, final_relative_cost, final_best_cost) = self.compute_final_costs();
        self.final_costs = final_costs;
        self.final_relative_cost = final_relative_cost;
        self.final_best_cost = final_best_cost;
        self.decoding_finalized = true;
        // Tokens on the last frame are about to be freed; drop the map so
        // it cannot dangle.
        self.cur_toks.clear();

        let delta = 1.0e-05;
        let mut changed = true;
        while changed {
            changed = false;
            let mut tok_iter = self.active_toks[frame_plus_one].toks;
            while let Some(tok) = tok_iter {
                let final_cost = if self.final_costs.is_empty() {
                    0.0
                } else {
                    self.final_costs
                        .get(&tok)
                        .copied()
                        .unwrap_or(f32::INFINITY)
                };
                let mut tok_extra_cost =
                    self.toks[tok as usize].tot_cost + final_cost - self.final_best_cost;
                // tok_extra_cost is a min over being directly final and
                // being final through forward links.
                let mut prev_link: Option<LinkId> = None;
                let mut link_iter = self.toks[tok as usize].links;
                while let Some(link) = link_iter {
                    let fl = self.links[link as usize];
                    let next_tok = &self.toks[fl.next_tok as usize];
                    let link_extra_cost = next_tok.extra_cost
                        + ((self.toks[tok as usize].tot_cost + fl.acoustic_cost + fl.graph_cost)
                            - next_tok.tot_cost);
                    if link_extra_cost > self.config.lattice_beam {
                        match prev_link {
                            Some(p) => self.links[p as usize].next = fl.next,
                            None => self.toks[tok as usize].links = fl.next,
                        }
                        self.link_free.push(link);
                        link_iter = fl.next;
                    } else {
                        let mut link_extra_cost = link_extra_cost;
                        if link_extra_cost < 0.0 {
                            if link_extra_cost < -0.01 && !self.warned {
                                warn!("negative extra cost {}", link_extra_cost);
                                self.warned = true;
                            }
                            link_extra_cost = 0.0;
                        }
                        if link_extra_cost < tok_extra_cost {
                            tok_extra_cost = link_extra_cost;
                        }
                        prev_link = Some(link);
                        link_iter = fl.next;
                    }
                }
                // Tokens worse than lattice_beam above the best final path
                // are marked for deletion; in the non-final case this falls
                // out of having no forward links, but here the final-prob
                // term keeps such tokens temporarily alive.
                if tok_extra_cost > self.config.lattice_beam {
                    tok_extra_cost = f32::INFINITY;
                }
                if !approx_equal(self.toks[tok as usize].extra_cost, tok_extra_cost, delta) {
                    changed = true;
                }
                self.toks[tok as usize].extra_cost = tok_extra_cost;
                tok_iter = self.toks[tok as usize].next;
            }
        }
    }

    /// Delete tokens on `frame` whose `extra_cost` reached `+∞`, unlinking
    /// them from the frame's token list. Kept separate from
    /// `prune_forward_links` so no link ever points at a freed token.
    fn prune_tokens_for_frame(&mut self, frame: usize) {
        debug_assert!(frame < self.active_toks.len());
        if self.active_toks[frame].toks.is_none() && !self.warned {
            warn!("no tokens alive while pruning frame {}", frame);
            self.warned = true;
        }
        let mut prev_tok: Option<TokId> = None;
        let mut tok_iter = self.active_toks[frame].toks;
        while let Some(tok) = tok_iter {
            let next = self.toks[tok as usize].next;
            if self.toks[tok as usize].extra_cost == f32::INFINITY {
                // Unreachable from the end of the graph.
                match prev_tok {
                    Some(p) => self.toks[p as usize].next = next,
                    None => self.active_toks[frame].toks = next,
                }
                self.free_token(tok);
            } else {
                prev_tok = Some(tok);
            }
            tok_iter = next;
        }
    }

    /// Backward sweep from the newest frame toward the start, pruning
    /// forward links where a frame is flagged dirty and propagating the
    /// dirtiness backwards while extra costs keep changing by more than
    /// `delta`.
    fn prune_active_tokens(&mut self, delta: f32) {
        let cur_frame_plus_one = self.num_frames_decoded();
        let num_toks_begin = self.num_toks;
        for f in (0..cur_frame_plus_one).rev() {
            let f = f as usize;
            if self.active_toks[f].must_prune_forward_links {
                let (extra_costs_changed, links_pruned) = self.prune_forward_links(f, delta);
                if extra_costs_changed && f > 0 {
                    self.active_toks[f - 1].must_prune_forward_links = true;
                }
                if links_pruned {
                    self.active_toks[f].must_prune_tokens = true;
                }
                self.active_toks[f].must_prune_forward_links = false;
            }
            if f + 1 < cur_frame_plus_one as usize && self.active_toks[f + 1].must_prune_tokens {
                self.prune_tokens_for_frame(f + 1);
                self.active_toks[f + 1].must_prune_tokens = false;
            }
        }
        debug!(
            "prune_active_tokens: pruned tokens from {} to {}",
            num_toks_begin, self.num_toks
        );
    }

    /// Final costs for tokens on the current frontier: a map from token to
    /// the final-prob of its state (only for final states), the relative
    /// cost (best-with-final minus best), and the best cost including
    /// final-probs (or excluding them if no final state is active).
    fn compute_final_costs(&self) -> (FxHashMap<TokId, f32>, f32, f32) {
        debug_assert!(!self.decoding_finalized);
        let infinity = f32::INFINITY;
        let mut final_costs = FxHashMap::default();
        let mut best_cost = infinity;
        let mut best_cost_with_final = infinity;

        for (&state, &tok) in &self.cur_toks {
            let final_cost = self.fst.final_weight(state);
            let cost = self.toks[tok as usize].tot_cost;
            let cost_with_final = cost + final_cost;
            best_cost = best_cost.min(cost);
            best_cost_with_final = best_cost_with_final.min(cost_with_final);
            if final_cost != infinity {
                final_costs.insert(tok, final_cost);
            }
        }

        let final_relative_cost = if best_cost == infinity && best_cost_with_final == infinity {
            // Likely no tokens survived at all.
            infinity
        } else {
            best_cost_with_final - best_cost
        };
        let final_best_cost = if best_cost_with_final != infinity {
            best_cost_with_final
        } else {
            best_cost
        };
        (final_costs, final_relative_cost, final_best_cost)
    }
}

impl<G: TransitionGraph> Drop for LatticeSimpleDecoder<'_, G> {
    fn drop(&mut self) {
        self.clear_active_tokens();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::VectorGraph;
    use crate::scorer::MatrixScorer;

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

    fn identity_scorer() -> MatrixScorer<'static> {
        let mut m = vec![-10.0f32; 9];
        for f in 0..3 {
            m[f * 3 + f] = 0.0;
        }
        MatrixScorer::from_matrix(m, 3, 3).unwrap()
    }

    fn path_olabels(lat: &Lattice) -> Vec<i32> {
        let mut v = Vec::new();
        let mut s = lat.start().unwrap();
        while let Some(arc) = lat.arcs(s).first() {
            v.push(arc.olabel);
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
    fn test_linear_raw_lattice_shape() {
        // With a tight lattice beam the raw lattice of the linear utterance
        // is exactly the single path: 4 states, 3 arcs.
        let g = linear_graph();
        let scorer = identity_scorer();
        let config = LatticeSimpleDecoderConfig {
            lattice_beam: 1.0,
            ..Default::default()
        };
        let mut dec = LatticeSimpleDecoder::new(&g, config).unwrap();
        assert!(dec.decode(&scorer).unwrap());
        assert_eq!(dec.num_frames_decoded(), 3);
        assert_eq!(dec.final_relative_cost(), 0.0);

        let raw = dec.get_raw_lattice(true).unwrap().unwrap();
        assert_eq!(raw.num_states(), 4);
        assert_eq!(raw.num_arcs(), 3);

        // Every surviving token lies on the single best path: zero slack.
        for f in 0..dec.active_toks.len() {
            let mut tok = dec.active_toks[f].toks;
            while let Some(t) = tok {
                assert_eq!(dec.toks[t as usize].extra_cost, 0.0);
                tok = dec.toks[t as usize].next;
            }
        }

        let best = dec.get_best_path(true).unwrap().unwrap();
        assert_eq!(path_olabels(&best), vec![1, 2, 3]);
        assert_eq!(path_total_cost(&best), 0.0);
    }

    #[test]
    fn test_parallel_paths_within_lattice_beam() {
        // Two parallel word paths, both within the lattice beam: the raw
        // lattice keeps both, the best path picks the cheaper, and the
        // relative cost at the end equals their difference.
        let g = VectorGraph::new(
            4,
            Some(0),
            &[(3, 0.0)],
            &[0, 1, 0, 2],
            &[1, 2, 1, 2],
            &[100, 0, 200, 0],
            &[0.0, 0.0, 1.5, 0.0],
            &[1, 3, 2, 3],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0; 4], 2, 2).unwrap();
        let config = LatticeSimpleDecoderConfig {
            lattice_beam: 10.0,
            ..Default::default()
        };
        let mut dec = LatticeSimpleDecoder::new(&g, config).unwrap();
        assert!(dec.decode(&scorer).unwrap());

        let raw = dec.get_raw_lattice(true).unwrap().unwrap();
        // start + two tokens on frame 1 + one merged token on frame 2.
        assert_eq!(raw.num_states(), 4);
        assert_eq!(raw.num_arcs(), 4);

        let best = dec.get_best_path(true).unwrap().unwrap();
        assert_eq!(path_olabels(&best), vec![100, 0]);
        assert_eq!(path_total_cost(&best), 0.0);
    }

    #[test]
    fn test_parallel_paths_outside_lattice_beam_are_pruned() {
        // Same fork, but the worse branch is more than lattice_beam away:
        // only the winning path survives in the raw lattice.
        let g = VectorGraph::new(
            4,
            Some(0),
            &[(3, 0.0)],
            &[0, 1, 0, 2],
            &[1, 2, 1, 2],
            &[100, 0, 200, 0],
            &[0.0, 0.0, 5.0, 0.0],
            &[1, 3, 2, 3],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0; 4], 2, 2).unwrap();
        let config = LatticeSimpleDecoderConfig {
            lattice_beam: 2.0,
            ..Default::default()
        };
        let mut dec = LatticeSimpleDecoder::new(&g, config).unwrap();
        assert!(dec.decode(&scorer).unwrap());

        // The losing branch's token is reclaimed outright, so the raw
        // lattice is the bare winning path.
        let raw = dec.get_raw_lattice(true).unwrap().unwrap();
        assert_eq!(raw.num_states(), 3);
        assert_eq!(raw.num_arcs(), 2);
        assert_eq!(path_olabels(&shortest_path(&raw)), vec![100, 0]);
    }

    #[test]
    fn test_final_relative_cost_gap_to_final_state() {
        // The cheaper endpoint is not final, the dearer one is: the
        // relative cost is the gap between the best token and the best
        // final-state token.
        let g = VectorGraph::new(
            3,
            Some(0),
            &[(2, 0.0)],
            &[0, 0],
            &[1, 1],
            &[100, 200],
            &[0.0, 1.5],
            &[1, 2],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0], 1, 1).unwrap();
        let mut dec = LatticeSimpleDecoder::new(&g, Default::default()).unwrap();
        dec.init_decoding().unwrap();
        // Drive the loop by hand so we can query before finalization.
        dec.process_emitting(&scorer);
        dec.prune_current_tokens();
        dec.process_nonemitting();
        assert_eq!(dec.final_relative_cost(), 1.5);
        dec.finalize_decoding();
        assert_eq!(dec.final_relative_cost(), 1.5);
        // Finalization prunes the non-final endpoint (its cost-plus-final
        // is infinite), leaving only the word-200 path.
        let best = dec.get_best_path(true).unwrap().unwrap();
        assert_eq!(path_olabels(&best), vec![200]);
    }

    #[test]
    fn test_zero_frames_ready() {
        let g = linear_graph();
        let scorer = MatrixScorer::from_matrix(vec![], 0, 3).unwrap();
        let mut dec = LatticeSimpleDecoder::new(&g, Default::default()).unwrap();
        assert!(!dec.decode(&scorer).unwrap());
        assert_eq!(dec.final_relative_cost(), f32::INFINITY);
        assert!(dec.get_raw_lattice(true).unwrap().is_none());
    }

    #[test]
    fn test_raw_lattice_after_finalize_without_finals_is_usage_error() {
        let g = linear_graph();
        let scorer = identity_scorer();
        let mut dec = LatticeSimpleDecoder::new(&g, Default::default()).unwrap();
        dec.decode(&scorer).unwrap();
        assert!(matches!(
            dec.get_raw_lattice(false),
            Err(DecodeError::Usage(_))
        ));
        assert!(dec.get_raw_lattice(true).unwrap().is_some());
    }

    #[test]
    fn test_epsilon_closure_links_appear_in_lattice() {
        // 0 -1:7-> 1 -eps:8/0.5-> 2(final): the epsilon traversal must be a
        // lattice arc with graph cost 0.5 and acoustic cost 0.
        let g = VectorGraph::new(
            3,
            Some(0),
            &[(2, 0.0)],
            &[0, 1],
            &[1, 0],
            &[7, 8],
            &[0.0, 0.5],
            &[1, 2],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0], 1, 1).unwrap();
        let mut dec = LatticeSimpleDecoder::new(&g, Default::default()).unwrap();
        assert!(dec.decode(&scorer).unwrap());
        let raw = dec.get_raw_lattice(true).unwrap().unwrap();
        assert_eq!(raw.num_states(), 3);
        assert_eq!(raw.num_arcs(), 2);
        let best = dec.get_best_path(true).unwrap().unwrap();
        assert_eq!(path_olabels(&best), vec![7, 8]);
        assert!((path_total_cost(&best) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_interim_pruning_keeps_best_path() {
        // Long utterance with prune_interval 2 so several backward sweeps
        // run mid-utterance; the best path must be unaffected.
        let n = 10u32;
        let mut src = Vec::new();
        let mut il = Vec::new();
        let mut ol = Vec::new();
        let mut w = Vec::new();
        let mut dst = Vec::new();
        for i in 0..n {
            src.push(i);
            il.push(1);
            ol.push(i as i32 + 1);
            w.push(0.0);
            dst.push(i + 1);
            // A parallel, slightly worse arc for every step.
            src.push(i);
            il.push(2);
            ol.push(-(i as i32 + 1));
            w.push(1.0);
            dst.push(i + 1);
        }
        let g = VectorGraph::new(n + 1, Some(0), &[(n, 0.0)], &src, &il, &ol, &w, &dst).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0; 2 * n as usize], n as i32, 2).unwrap();
        let config = LatticeSimpleDecoderConfig {
            prune_interval: 2,
            lattice_beam: 0.5,
            ..Default::default()
        };
        let mut dec = LatticeSimpleDecoder::new(&g, config).unwrap();
        assert!(dec.decode(&scorer).unwrap());
        let best = dec.get_best_path(true).unwrap().unwrap();
        assert_eq!(path_total_cost(&best), 0.0);
        assert_eq!(
            path_olabels(&best),
            (1..=n as i32).collect::<Vec<_>>()
        );
        // lattice_beam 0.5 excludes every +1.0 alternative: the raw lattice
        // collapses to the single best path.
        let raw = dec.get_raw_lattice(true).unwrap().unwrap();
        assert_eq!(raw.num_states() as u32, n + 1);
        assert_eq!(raw.num_arcs() as u32, n);
    }

    #[test]
    fn test_config_validation() {
        let g = linear_graph();
        for bad in [
            LatticeSimpleDecoderConfig {
                beam: 0.0,
                ..Default::default()
            },
            LatticeSimpleDecoderConfig {
                lattice_beam: -1.0,
                ..Default::default()
            },
            LatticeSimpleDecoderConfig {
                prune_interval: 0,
                ..Default::default()
            },
            LatticeSimpleDecoderConfig {
                prune_scale: 1.0,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                LatticeSimpleDecoder::new(&g, bad),
                Err(DecodeError::Config(_))
            ));
        }
    }

    #[test]
    fn test_config_deserialize_with_defaults() {
        let config: LatticeSimpleDecoderConfig =
            serde_json::from_str(r#"{"lattice_beam": 4.0}"#).unwrap();
        assert_eq!(config.lattice_beam, 4.0);
        assert_eq!(config.beam, 16.0);
        assert_eq!(config.prune_interval, 25);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_decode_twice_is_deterministic() {
        let g = VectorGraph::new(
            4,
            Some(0),
            &[(3, 0.0)],
            &[0, 1, 0, 2],
            &[1, 2, 1, 2],
            &[100, 0, 200, 0],
            &[0.0, 0.0, 1.5, 0.0],
            &[1, 3, 2, 3],
        ).unwrap();
        let scorer = MatrixScorer::from_matrix(vec![0.0; 4], 2, 2).unwrap();
        let mut dec = LatticeSimpleDecoder::new(&g, Default::default()).unwrap();
        dec.decode(&scorer).unwrap();
        let first = path_olabels(&dec.get_best_path(true).unwrap().unwrap());
        let first_arcs = dec.get_raw_lattice(true).unwrap().unwrap().num_arcs();
        dec.decode(&scorer).unwrap();
        let second = path_olabels(&dec.get_best_path(true).unwrap().unwrap());
        let second_arcs = dec.get_raw_lattice(true).unwrap().unwrap().num_arcs();
        assert_eq!(first, second);
        assert_eq!(first_arcs, second_arcs);
    }

    #[test]
    fn test_num_toks_accounting() {
        let g = linear_graph();
        let scorer = identity_scorer();
        let mut dec = LatticeSimpleDecoder::new(&g, Default::default()).unwrap();
        dec.decode(&scorer).unwrap();
        // After the final sweep only the surviving lattice tokens remain:
        // one per frame on the single path.
        assert_eq!(dec.num_toks, 4);
        let mut counted = 0;
        for f in 0..dec.active_toks.len() {
            let mut tok = dec.active_toks[f].toks;
            while let Some(t) = tok {
                counted += 1;
                tok = dec.toks[t as usize].next;
            }
        }
        assert_eq!(counted, dec.num_toks);
    }
}
