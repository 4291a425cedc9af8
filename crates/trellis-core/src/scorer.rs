//! Frame scoring: the decoders' view of the acoustic model.
//!
//! A `FrameScorer` hands out per-frame log-likelihoods by acoustic-unit
//! index. Indices are one-based to line up with the graph's input labels
//! (label 0 is reserved for epsilon); scorers backed by a matrix subtract 1
//! when indexing columns.

use crate::error::DecodeError;
use std::borrow::Cow;

/// Per-frame log-likelihood source.
pub trait FrameScorer {
    /// Log-likelihood of acoustic unit `index` (one-based) on `frame`
    /// (zero-based).
    fn log_likelihood(&self, frame: i32, index: i32) -> f32;

    /// Number of frames currently scorable. Must be monotonically
    /// non-decreasing across calls for one utterance.
    fn num_frames_ready(&self) -> i32;

    /// Whether `frame` is the last frame of the utterance.
    fn is_last_frame(&self, frame: i32) -> bool;

    /// Number of acoustic-unit indices (columns).
    fn num_indices(&self) -> i32;
}

/// Scorer over a dense row-major `(num_rows, num_cols)` matrix of
/// log-softmax outputs, typically from a CTC acoustic model.
///
/// The matrix may be owned or borrowed. An optional `offset` lets the
/// scorer model an unbounded stream while holding only a window:
/// row lookup is `frame - offset`, and `num_frames_ready` is
/// `offset + num_rows`.
pub struct MatrixScorer<'a> {
    data: Cow<'a, [f32]>,
    num_rows: i32,
    num_cols: i32,
    offset: i32,
}

fn check_shape(len: usize, num_rows: i32, num_cols: i32) -> Result<(), DecodeError> {
    if num_rows < 0 || num_cols < 0 || len as i64 != num_rows as i64 * num_cols as i64 {
        return Err(DecodeError::Config(format!(
            "matrix of {} values does not match shape ({}, {})",
            len, num_rows, num_cols
        )));
    }
    Ok(())
}

impl MatrixScorer<'static> {
    /// Take ownership of the matrix.
    pub fn from_matrix(data: Vec<f32>, num_rows: i32, num_cols: i32) -> Result<Self, DecodeError> {
        check_shape(data.len(), num_rows, num_cols)?;
        Ok(MatrixScorer {
            data: Cow::Owned(data),
            num_rows,
            num_cols,
            offset: 0,
        })
    }
}

impl<'a> MatrixScorer<'a> {
    /// Borrow the matrix; the slice must outlive the scorer.
    pub fn from_slice(data: &'a [f32], num_rows: i32, num_cols: i32) -> Result<Self, DecodeError> {
        check_shape(data.len(), num_rows, num_cols)?;
        Ok(MatrixScorer {
            data: Cow::Borrowed(data),
            num_rows,
            num_cols,
            offset: 0,
        })
    }

    /// Set the index of the first frame held in the matrix window.
    pub fn with_offset(mut self, offset: i32) -> Result<Self, DecodeError> {
        if offset < 0 {
            return Err(DecodeError::Config(format!(
                "frame offset must be >= 0, got {}",
                offset
            )));
        }
        self.offset = offset;
        Ok(self)
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }
}

impl FrameScorer for MatrixScorer<'_> {
    fn log_likelihood(&self, frame: i32, index: i32) -> f32 {
        // Input labels of the graph are incremented during construction so
        // that 0 can mean epsilon; undo that here.
        assert!(index >= 1 && index <= self.num_cols);
        let row = frame - self.offset;
        assert!(row >= 0 && row < self.num_rows);
        self.data[(row * self.num_cols + index - 1) as usize]
    }

    fn num_frames_ready(&self) -> i32 {
        self.offset + self.num_rows
    }

    fn is_last_frame(&self, frame: i32) -> bool {
        assert!(frame < self.num_frames_ready());
        frame == self.num_frames_ready() - 1
    }

    fn num_indices(&self) -> i32 {
        self.num_cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_based_indexing() {
        // 2 frames x 3 units
        let m = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let s = MatrixScorer::from_matrix(m, 2, 3).unwrap();
        assert_eq!(s.log_likelihood(0, 1), 0.1);
        assert_eq!(s.log_likelihood(0, 3), 0.3);
        assert_eq!(s.log_likelihood(1, 2), 0.5);
        assert_eq!(s.num_frames_ready(), 2);
        assert_eq!(s.num_indices(), 3);
        assert!(!s.is_last_frame(0));
        assert!(s.is_last_frame(1));
    }

    #[test]
    fn test_borrowed_with_offset() {
        let m = [0.1, 0.2, 0.3, 0.4];
        // Window holds frames 10 and 11 of the stream.
        let s = MatrixScorer::from_slice(&m, 2, 2)
            .unwrap()
            .with_offset(10)
            .unwrap();
        assert_eq!(s.num_frames_ready(), 12);
        assert_eq!(s.log_likelihood(10, 1), 0.1);
        assert_eq!(s.log_likelihood(11, 2), 0.4);
        assert!(s.is_last_frame(11));
    }

    #[test]
    fn test_rejects_bad_shape() {
        assert!(matches!(
            MatrixScorer::from_matrix(vec![0.0; 5], 2, 3),
            Err(DecodeError::Config(_))
        ));
        let m = [0.0; 4];
        assert!(matches!(
            MatrixScorer::from_slice(&m, 2, 3),
            Err(DecodeError::Config(_))
        ));
        assert!(matches!(
            MatrixScorer::from_slice(&m, 2, 2).unwrap().with_offset(-1),
            Err(DecodeError::Config(_))
        ));
    }
}
