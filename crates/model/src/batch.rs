//! Padded batches of variable-length sequences.

use crate::error::{ModelError, Result};
use ndarray::{Array2, ArrayView2};

/// Rectangular token ids plus the valid length of each row.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBatch {
    ids: Array2<usize>,
    lengths: Vec<usize>,
}

impl TokenBatch {
    /// Right-pad `sequences` with `pad_id` to the longest one.
    pub fn from_sequences(sequences: &[Vec<usize>], pad_id: usize) -> Result<Self> {
        if sequences.is_empty() {
            return Err(ModelError::OutOfRange("batch has no sequences".to_string()));
        }
        if let Some(row) = sequences.iter().position(Vec::is_empty) {
            return Err(ModelError::OutOfRange(format!("sequence {} is empty", row)));
        }

        let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
        let seq_len = lengths.iter().copied().max().unwrap_or(0);
        let ids = Array2::from_shape_fn((sequences.len(), seq_len), |(row, pos)| {
            sequences[row].get(pos).copied().unwrap_or(pad_id)
        });
        Ok(Self { ids, lengths })
    }

    pub fn ids(&self) -> ArrayView2<'_, usize> {
        self.ids.view()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn batch_size(&self) -> usize {
        self.ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.ids.ncols()
    }

    pub fn is_padded(&self) -> bool {
        self.lengths.iter().any(|&len| len < self.seq_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn pads_to_longest_sequence() {
        let batch = TokenBatch::from_sequences(&[vec![1, 2, 3], vec![4]], 0).expect("batch");
        assert_eq!(batch.ids(), array![[1usize, 2, 3], [4, 0, 0]]);
        assert_eq!(batch.lengths(), &[3, 1]);
        assert_eq!((batch.batch_size(), batch.seq_len()), (2, 3));
        assert!(batch.is_padded());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            TokenBatch::from_sequences(&[], 0),
            Err(ModelError::OutOfRange(_))
        ));
        assert!(matches!(
            TokenBatch::from_sequences(&[vec![1], vec![]], 0),
            Err(ModelError::OutOfRange(_))
        ));
    }
}
