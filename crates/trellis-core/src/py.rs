use crate::error::DecodeError;
use crate::faster::{FasterDecoder, FasterDecoderOptions};
use crate::fst::{StateId, VectorGraph};
use crate::lattice::Lattice;
use crate::lattice_simple::{LatticeSimpleDecoder, LatticeSimpleDecoderConfig};
use crate::scorer::MatrixScorer;
use crate::simple::SimpleDecoder;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

fn to_py_err(e: DecodeError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// Python-visible decoding graph. Constructed once from Python arrays, then
/// passed to the decode functions repeatedly.
#[pyclass]
pub struct RustGraph {
    pub(crate) inner: VectorGraph,
}

#[pymethods]
impl RustGraph {
    #[new]
    #[pyo3(signature = (num_states, start, final_states, final_costs, arc_src, arc_ilabel, arc_olabel, arc_weight, arc_dst))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        num_states: u32,
        start: Option<u32>,
        final_states: Vec<u32>,
        final_costs: Vec<f32>,
        arc_src: Vec<u32>,
        arc_ilabel: Vec<i32>,
        arc_olabel: Vec<i32>,
        arc_weight: Vec<f32>,
        arc_dst: Vec<u32>,
    ) -> PyResult<Self> {
        let finals: Vec<(StateId, f32)> = final_states
            .into_iter()
            .zip(final_costs)
            .collect();
        let inner = VectorGraph::new(
            num_states,
            start,
            &finals,
            &arc_src,
            &arc_ilabel,
            &arc_olabel,
            &arc_weight,
            &arc_dst,
        )
        .map_err(to_py_err)?;
        Ok(RustGraph { inner })
    }
}

/// Python-visible lattice result, as parallel arc arrays.
#[pyclass]
pub struct RustLattice {
    num_states: u32,
    start: Option<u32>,
    arc_src: Vec<u32>,
    arc_ilabel: Vec<i32>,
    arc_olabel: Vec<i32>,
    arc_graph_cost: Vec<f32>,
    arc_acoustic_cost: Vec<f32>,
    arc_dst: Vec<u32>,
    final_states: Vec<u32>,
    final_graph_cost: Vec<f32>,
    final_acoustic_cost: Vec<f32>,
}

#[pymethods]
impl RustLattice {
    fn num_states(&self) -> u32 {
        self.num_states
    }

    fn start(&self) -> Option<u32> {
        self.start
    }

    #[allow(clippy::type_complexity)]
    fn arcs(&self) -> (Vec<u32>, Vec<i32>, Vec<i32>, Vec<f32>, Vec<f32>, Vec<u32>) {
        (
            self.arc_src.clone(),
            self.arc_ilabel.clone(),
            self.arc_olabel.clone(),
            self.arc_graph_cost.clone(),
            self.arc_acoustic_cost.clone(),
            self.arc_dst.clone(),
        )
    }

    fn final_states(&self) -> (Vec<u32>, Vec<f32>, Vec<f32>) {
        (
            self.final_states.clone(),
            self.final_graph_cost.clone(),
            self.final_acoustic_cost.clone(),
        )
    }
}

fn lattice_to_py(lat: &Lattice) -> RustLattice {
    let mut arc_src = Vec::new();
    let mut arc_ilabel = Vec::new();
    let mut arc_olabel = Vec::new();
    let mut arc_graph_cost = Vec::new();
    let mut arc_acoustic_cost = Vec::new();
    let mut arc_dst = Vec::new();
    let mut final_states = Vec::new();
    let mut final_graph_cost = Vec::new();
    let mut final_acoustic_cost = Vec::new();

    for s in 0..lat.num_states() as StateId {
        for arc in lat.arcs(s) {
            arc_src.push(s);
            arc_ilabel.push(arc.ilabel);
            arc_olabel.push(arc.olabel);
            arc_graph_cost.push(arc.weight.graph_cost);
            arc_acoustic_cost.push(arc.weight.acoustic_cost);
            arc_dst.push(arc.nextstate);
        }
        let fw = lat.final_weight(s);
        if !fw.is_zero() {
            final_states.push(s);
            final_graph_cost.push(fw.graph_cost);
            final_acoustic_cost.push(fw.acoustic_cost);
        }
    }

    RustLattice {
        num_states: lat.num_states() as u32,
        start: lat.start(),
        arc_src,
        arc_ilabel,
        arc_olabel,
        arc_graph_cost,
        arc_acoustic_cost,
        arc_dst,
        final_states,
        final_graph_cost,
        final_acoustic_cost,
    }
}

/// Decode with the baseline decoder and return the best path, or None when
/// nothing survived the search.
#[pyfunction]
#[pyo3(signature = (graph, log_probs, num_frames, num_cols, beam=16.0, use_final_probs=true))]
pub fn decode_simple(
    graph: &RustGraph,
    log_probs: Vec<f32>,
    num_frames: i32,
    num_cols: i32,
    beam: f32,
    use_final_probs: bool,
) -> PyResult<Option<RustLattice>> {
    let scorer = MatrixScorer::from_matrix(log_probs, num_frames, num_cols).map_err(to_py_err)?;
    let mut decoder = SimpleDecoder::new(&graph.inner, beam).map_err(to_py_err)?;
    decoder.decode(&scorer).map_err(to_py_err)?;
    Ok(decoder.get_best_path(use_final_probs).map(|l| lattice_to_py(&l)))
}

/// Decode with the adaptive-beam decoder and return the best path.
#[pyfunction]
#[pyo3(signature = (graph, log_probs, num_frames, num_cols, beam=16.0, max_active=i32::MAX, min_active=20, beam_delta=0.5, hash_ratio=2.0, use_final_probs=true))]
#[allow(clippy::too_many_arguments)]
pub fn decode_faster(
    graph: &RustGraph,
    log_probs: Vec<f32>,
    num_frames: i32,
    num_cols: i32,
    beam: f32,
    max_active: i32,
    min_active: i32,
    beam_delta: f32,
    hash_ratio: f32,
    use_final_probs: bool,
) -> PyResult<Option<RustLattice>> {
    let scorer = MatrixScorer::from_matrix(log_probs, num_frames, num_cols).map_err(to_py_err)?;
    let options = FasterDecoderOptions {
        beam,
        max_active,
        min_active,
        beam_delta,
        hash_ratio,
    };
    let mut decoder = FasterDecoder::new(&graph.inner, options).map_err(to_py_err)?;
    decoder.decode(&scorer).map_err(to_py_err)?;
    Ok(decoder.get_best_path(use_final_probs).map(|l| lattice_to_py(&l)))
}

/// Decode with the lattice decoder; returns (raw_lattice, best_path),
/// either of which may be None when nothing survived.
#[pyfunction]
#[pyo3(signature = (graph, log_probs, num_frames, num_cols, beam=16.0, lattice_beam=10.0, prune_interval=25, prune_scale=0.1, use_final_probs=true))]
#[allow(clippy::too_many_arguments)]
pub fn decode_lattice(
    graph: &RustGraph,
    log_probs: Vec<f32>,
    num_frames: i32,
    num_cols: i32,
    beam: f32,
    lattice_beam: f32,
    prune_interval: i32,
    prune_scale: f32,
    use_final_probs: bool,
) -> PyResult<(Option<RustLattice>, Option<RustLattice>)> {
    let scorer = MatrixScorer::from_matrix(log_probs, num_frames, num_cols).map_err(to_py_err)?;
    let config = LatticeSimpleDecoderConfig {
        beam,
        lattice_beam,
        prune_interval,
        prune_scale,
    };
    let mut decoder = LatticeSimpleDecoder::new(&graph.inner, config).map_err(to_py_err)?;
    decoder.decode(&scorer).map_err(to_py_err)?;
    let raw = decoder.get_raw_lattice(use_final_probs).map_err(to_py_err)?;
    let best = decoder.get_best_path(use_final_probs).map_err(to_py_err)?;
    Ok((
        raw.map(|l| lattice_to_py(&l)),
        best.map(|l| lattice_to_py(&l)),
    ))
}

#[pymodule]
fn trellis_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<RustGraph>()?;
    m.add_class::<RustLattice>()?;
    m.add_function(wrap_pyfunction!(decode_simple, m)?)?;
    m.add_function(wrap_pyfunction!(decode_faster, m)?)?;
    m.add_function(wrap_pyfunction!(decode_lattice, m)?)?;
    Ok(())
}
