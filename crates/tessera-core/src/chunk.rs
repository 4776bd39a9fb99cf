use serde::{Deserialize, Serialize};

use crate::array::HostArray;
use crate::errors::Error;
use crate::hparams::HParams;
use crate::parameterized_struct;
use crate::partitioning::{LogicalAxes, EMBEDDING_EMBED, LOGIT_BATCH, TIME, VOCAB};
use crate::types::{ArrayType, DataType};

parameterized_struct! {
    /// Batch of token sequences processed by one forward call.
    ///
    /// Row `i` holds `lengths[i]` real tokens followed by padding. Padding positions never influence any other row
    /// or any real position of the same row, and they are not appended to the KV cache as valid slots.
    #[derive(Clone, Debug, PartialEq)]
    pub struct Chunk<P> {
        /// Token ids `[batch, seq_len]`.
        pub tokens: P,

        /// Number of real tokens of each row `[batch]`.
        pub lengths: P,
    }
}

impl Chunk<LogicalAxes> {
    /// Chunks are replicated on every device.
    pub fn logical_axes() -> Self {
        Chunk { tokens: LogicalAxes::replicated(2), lengths: LogicalAxes::replicated(1) }
    }
}

impl Chunk<ArrayType> {
    /// Array types of a chunk with `batch` rows of `seq_len` tokens.
    pub fn shapes(batch: usize, seq_len: usize) -> Self {
        Chunk {
            tokens: ArrayType::new(DataType::UInt32, vec![batch, seq_len]),
            lengths: ArrayType::new(DataType::UInt32, vec![batch]),
        }
    }
}

impl Chunk<HostArray<u32>> {
    /// Creates a chunk from token ids `[batch, seq_len]` and per-row lengths `[batch]`.
    pub fn new(tokens: HostArray<u32>, lengths: HostArray<u32>) -> Result<Self, Error> {
        let chunk = Chunk { tokens, lengths };
        chunk.validate()?;
        Ok(chunk)
    }

    /// Creates a chunk from variable-length sequences, right-padding every row with `0` up to `seq_len`.
    pub fn from_sequences<S: AsRef<[u32]>>(sequences: &[S], seq_len: usize) -> Result<Self, Error> {
        let mut tokens = Vec::with_capacity(sequences.len() * seq_len);
        let mut lengths = Vec::with_capacity(sequences.len());
        for (row, sequence) in sequences.iter().enumerate() {
            let sequence = sequence.as_ref();
            if sequence.len() > seq_len {
                let length = sequence.len();
                return Err(Error::InvalidChunk {
                    message: format!("row {row} has {length} tokens, more than the sequence length {seq_len}"),
                });
            }
            tokens.extend_from_slice(sequence);
            tokens.resize((row + 1) * seq_len, 0);
            lengths.push(sequence.len() as u32);
        }
        let tokens = HostArray::new(vec![sequences.len(), seq_len], tokens)?;
        Self::new(tokens, HostArray::new(vec![sequences.len()], lengths)?)
    }

    /// Number of rows.
    pub fn batch_size(&self) -> usize {
        self.tokens.shape().first().copied().unwrap_or(0)
    }

    /// Number of positions of every row, padding included.
    pub fn seq_len(&self) -> usize {
        self.tokens.shape().get(1).copied().unwrap_or(0)
    }

    /// Number of real tokens of each row.
    pub fn row_lengths(&self) -> Result<Vec<usize>, Error> {
        Ok(self.lengths.to_vec()?.into_iter().map(|length| length as usize).collect())
    }

    /// Checks the ranks and shapes of the chunk, that it has at least one position, and that every length is in
    /// `[0, seq_len]`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tokens.rank() != 2 {
            return Err(Error::RankMismatch { tensor: "tokens".to_string(), expected: 2, actual: self.tokens.rank() });
        }
        if self.lengths.shape() != [self.batch_size()] {
            return Err(Error::InvalidChunk {
                message: format!(
                    "lengths have shape {:?}, but the chunk has {} row(s)",
                    self.lengths.shape(),
                    self.batch_size(),
                ),
            });
        }
        let seq_len = self.seq_len();
        if seq_len == 0 {
            return Err(Error::InvalidChunk { message: "the chunk has no positions".to_string() });
        }
        if let Some((row, length)) = self.row_lengths()?.into_iter().enumerate().find(|(_, length)| *length > seq_len)
        {
            return Err(Error::InvalidChunk {
                message: format!("row {row} has length {length}, outside of [0, {seq_len}]"),
            });
        }
        Ok(())
    }

    /// Checks that every real token is a valid id for a vocabulary of size `vocab`. Padding is not checked.
    pub fn validate_tokens(&self, vocab: usize) -> Result<(), Error> {
        let seq_len = self.seq_len();
        let tokens = self.tokens.to_vec()?;
        for (row, length) in self.row_lengths()?.into_iter().enumerate() {
            let row_tokens = &tokens[row * seq_len..row * seq_len + length];
            if let Some(token) = row_tokens.iter().find(|token| **token as usize >= vocab) {
                return Err(Error::InvalidToken { token: *token as i64, vocab });
            }
        }
        Ok(())
    }
}

/// What a forward call returns for every position.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Logits over the vocabulary `[batch, seq_len, vocab]`.
    #[default]
    Logits,

    /// Final normalized activations `[batch, seq_len, embed]`.
    Activations,
}

parameterized_struct! {
    /// Output of a forward call.
    #[derive(Clone, Debug, PartialEq)]
    pub struct FullChunkResult<P> {
        /// Logits `[batch, seq_len, vocab]`, or final normalized activations `[batch, seq_len, embed]` in
        /// [`OutputMode::Activations`].
        pub logits: P,
    }
}

impl FullChunkResult<LogicalAxes> {
    pub fn logical_axes(output_mode: OutputMode) -> Self {
        let logits = match output_mode {
            OutputMode::Logits => LogicalAxes::new(&[Some(LOGIT_BATCH), Some(TIME), Some(VOCAB)]),
            OutputMode::Activations => LogicalAxes::new(&[None, Some(TIME), Some(EMBEDDING_EMBED)]),
        };
        FullChunkResult { logits }
    }
}

impl FullChunkResult<ArrayType> {
    pub fn shapes(hparams: &HParams, batch: usize, seq_len: usize, output_mode: OutputMode) -> Self {
        let width = match output_mode {
            OutputMode::Logits => hparams.vocab(),
            OutputMode::Activations => hparams.embed(),
        };
        FullChunkResult { logits: ArrayType::new(DataType::Float32, vec![batch, seq_len, width]) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_sequences_pads_rows() {
        let chunk = Chunk::from_sequences(&[vec![5, 6, 7], vec![1, 2, 3, 4, 5]], 8).unwrap();
        assert_eq!(chunk.batch_size(), 2);
        assert_eq!(chunk.seq_len(), 8);
        assert_eq!(chunk.row_lengths().unwrap(), vec![3, 5]);
        assert_eq!(chunk.tokens.to_vec().unwrap()[..8], [5, 6, 7, 0, 0, 0, 0, 0]);
        assert!(matches!(Chunk::from_sequences(&[vec![1, 2, 3]], 2), Err(Error::InvalidChunk { .. })));
    }

    #[test]
    fn test_chunk_validation() {
        let tokens = HostArray::<u32>::zeros(vec![2, 4]).unwrap();
        assert!(matches!(
            Chunk::new(tokens.clone(), HostArray::new(vec![2], vec![4, 5]).unwrap()),
            Err(Error::InvalidChunk { message }) if message.contains("row 1"),
        ));
        assert!(matches!(
            Chunk::new(tokens.clone(), HostArray::new(vec![3], vec![1, 1, 1]).unwrap()),
            Err(Error::InvalidChunk { .. }),
        ));
        assert!(matches!(
            Chunk::new(HostArray::zeros(vec![8]).unwrap(), HostArray::zeros(vec![8]).unwrap()),
            Err(Error::RankMismatch { expected: 2, actual: 1, .. }),
        ));
    }

    #[test]
    fn test_chunk_without_positions_is_rejected() {
        let tokens = HostArray::<u32>::zeros(vec![2, 0]).unwrap();
        assert!(matches!(
            Chunk::new(tokens, HostArray::new(vec![2], vec![0, 0]).unwrap()),
            Err(Error::InvalidChunk { message }) if message.contains("no positions"),
        ));
        assert!(matches!(Chunk::from_sequences(&[Vec::<u32>::new()], 0), Err(Error::InvalidChunk { .. })));
    }

    #[test]
    fn test_token_validation_ignores_padding() {
        let tokens = HostArray::new(vec![1, 4], vec![1, 2, 99, u32::MAX]).unwrap();
        let chunk = Chunk::new(tokens, HostArray::new(vec![1], vec![2]).unwrap()).unwrap();
        assert!(chunk.validate_tokens(16).is_ok());
        assert_eq!(chunk.validate_tokens(2), Err(Error::InvalidToken { token: 2, vocab: 2 }));
    }

    #[test]
    fn test_result_annotations() {
        assert_eq!(
            FullChunkResult::logical_axes(OutputMode::Logits).logits.to_string(),
            "P('logit_batch', 'time', 'vocab')",
        );
        assert_eq!(
            FullChunkResult::logical_axes(OutputMode::Activations).logits.to_string(),
            "P(None, 'time', 'embedding_embed')",
        );
    }
}
