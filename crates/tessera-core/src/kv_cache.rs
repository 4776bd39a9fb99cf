use candle_core::DType;

use crate::array::HostArray;
use crate::errors::Error;
use crate::parameterized_struct;
use crate::partitioning::{LogicalAxes, ATTN_BATCH, QKV, TIME};
use crate::types::{ArrayType, DataType};

/// Slots with a mask value above this threshold are valid.
pub(crate) const VALID_SLOT_THRESHOLD: f64 = 0.5;

parameterized_struct! {
    /// Keys and values of one layer for every position processed so far.
    ///
    /// The cache is owned by the caller, who holds one [`KVCache`] per layer and passes them back in on the next
    /// forward call. It starts empty, grows by the sequence length of every chunk, and may never exceed the
    /// maximum sequence length of the model. Padding positions are stored too, but are marked invalid in `mask` so
    /// that they are never attended to and do not advance the positions of later tokens.
    #[derive(Clone, Debug, PartialEq)]
    pub struct KVCache<P> {
        /// Keys `[batch, cache_len, qkv]`.
        pub k: P,

        /// Values `[batch, cache_len, qkv]`.
        pub v: P,

        /// Validity of every slot `[batch, cache_len]`: `1` for real tokens and `0` for padding.
        pub mask: P,
    }
}

impl KVCache<LogicalAxes> {
    pub fn logical_axes() -> Self {
        KVCache {
            k: LogicalAxes::new(&[Some(ATTN_BATCH), Some(TIME), Some(QKV)]),
            v: LogicalAxes::new(&[Some(ATTN_BATCH), Some(TIME), Some(QKV)]),
            mask: LogicalAxes::new(&[Some(ATTN_BATCH), Some(TIME)]),
        }
    }
}

impl KVCache<ArrayType> {
    pub fn shapes(batch: usize, cache_len: usize, qkv: usize) -> Self {
        KVCache {
            k: ArrayType::new(DataType::Float32, vec![batch, cache_len, qkv]),
            v: ArrayType::new(DataType::Float32, vec![batch, cache_len, qkv]),
            mask: ArrayType::new(DataType::Float32, vec![batch, cache_len]),
        }
    }
}

impl KVCache<HostArray> {
    /// Empty cache for `batch` rows.
    pub fn empty(batch: usize, qkv: usize) -> Result<Self, Error> {
        Ok(KVCache {
            k: HostArray::zeros(vec![batch, 0, qkv])?,
            v: HostArray::zeros(vec![batch, 0, qkv])?,
            mask: HostArray::zeros(vec![batch, 0])?,
        })
    }

    /// Empty caches for every layer.
    pub fn empty_layers(layers: usize, batch: usize, qkv: usize) -> Result<Vec<Self>, Error> {
        (0..layers).map(|_| Self::empty(batch, qkv)).collect()
    }

    pub fn batch_size(&self) -> usize {
        self.mask.shape().first().copied().unwrap_or(0)
    }

    /// Number of slots in this cache, padding included.
    pub fn cache_len(&self) -> usize {
        self.mask.shape().get(1).copied().unwrap_or(0)
    }

    /// Number of valid slots of each row. This is the position of the next token of that row.
    pub fn valid_lengths(&self) -> Result<Vec<usize>, Error> {
        if self.cache_len() == 0 {
            return Ok(vec![0; self.batch_size()]);
        }
        let valid = self.mask.tensor().gt(VALID_SLOT_THRESHOLD)?.to_dtype(DType::U32)?.sum(1)?;
        Ok(valid.to_vec1::<u32>()?.into_iter().map(|count| count as usize).collect())
    }

    /// Checks that keys, values, and the mask agree with each other, with `batch`, and with `qkv`.
    pub fn validate(&self, batch: usize, qkv: usize) -> Result<(), Error> {
        let axes = KVCache::logical_axes();
        let cache_len = self.cache_len();
        let expected = KVCache::shapes(batch, cache_len, qkv);
        crate::weights::check_shape("kv_cache.mask", self.mask.shape(), &expected.mask.shape, &axes.mask)?;
        crate::weights::check_shape("kv_cache.k", self.k.shape(), &expected.k.shape, &axes.k)?;
        crate::weights::check_shape("kv_cache.v", self.v.shape(), &expected.v.shape, &axes.v)
    }

    /// Returns this cache extended along time by `k`, `v` `[batch, seq_len, qkv]` and `mask` `[batch, seq_len]`.
    /// Fails with [`Error::CacheOverflow`] if the result would hold more than `max_len` slots.
    pub fn append(&self, k: &HostArray, v: &HostArray, mask: &HostArray, max_len: usize) -> Result<Self, Error> {
        let cache_len = self.cache_len();
        let seq_len = mask.shape().get(1).copied().unwrap_or(0);
        if cache_len + seq_len > max_len {
            return Err(Error::CacheOverflow { cache_len, seq_len, max_len });
        }
        Ok(KVCache {
            k: HostArray::concat(&[self.k.clone(), k.clone()], 1)?,
            v: HostArray::concat(&[self.v.clone(), v.clone()], 1)?,
            mask: HostArray::concat(&[self.mask.clone(), mask.clone()], 1)?,
        })
    }
}
