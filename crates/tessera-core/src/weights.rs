//! Model weights and their logical annotations.
//!
//! The weights of all layers are stacked along a leading `layers` axis so that the whole model is a handful of
//! arrays. [`Weights`] (like every other tensor container in this crate) is generic over its leaf type:
//!
//! | Leaf | Use |
//! |---|---|
//! | [`LogicalAxes`] | [`Weights::logical_axes`] |
//! | [`ArrayType`] | [`Weights::shapes`] |
//! | [`PartitionSpec`](crate::sharding::PartitionSpec) | output of [`resolve`](crate::resolver::resolve) |
//! | [`HostArray`] | global weights ([`Weights::random`]) and per-device shards |

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::array::HostArray;
use crate::errors::Error;
use crate::hparams::HParams;
use crate::parameterized_struct;
use crate::partitioning::{LogicalAxes, LAYERS, PARAMS_EMBED, PARAMS_HEADS, PARAMS_KV_EMBED, PARAMS_VOCAB};
use crate::types::{ArrayType, DataType};

/// Base of the geometric progression of rotary frequencies.
const ROTARY_BASE: f32 = 10_000.0;

parameterized_struct! {
    /// Weights of every layer, stacked along a leading `layers` axis.
    #[derive(Clone, Debug, PartialEq)]
    pub struct Layer<P> {
        /// Fused input projection `[layers, heads, embed, q_wi_per_head]` holding, per head, the query projection
        /// followed by the feed-forward gate and linear projections.
        pub q_wi: P,

        /// Shared key/value projection `[layers, embed, 1, 2 * qkv]` (keys first, then values).
        pub kv: P,

        /// Fused output projection `[layers, heads, o_wo_per_head, embed]` consuming, per head, the attention
        /// context followed by the gated feed-forward activation.
        pub o_wo: P,
    }
}

parameterized_struct! {
    /// Weights of a whole model.
    #[derive(Clone, Debug, PartialEq)]
    pub struct Weights<P> {
        pub layer: Layer<P>,

        /// Rotary sine table `[max_len, qkv / 2]`.
        pub sin: P,

        /// Rotary cosine table `[max_len, qkv / 2]`.
        pub cos: P,

        /// Token embedding `[vocab, embed]`, also used (transposed) to project final activations onto logits.
        pub embedding: P,
    }
}

impl Weights<LogicalAxes> {
    /// Logical annotation of every weight.
    pub fn logical_axes() -> Self {
        Weights {
            layer: Layer {
                q_wi: LogicalAxes::new(&[Some(LAYERS), Some(PARAMS_HEADS), Some(PARAMS_EMBED), None]),
                kv: LogicalAxes::new(&[Some(LAYERS), Some(PARAMS_KV_EMBED), None, None]),
                o_wo: LogicalAxes::new(&[Some(LAYERS), Some(PARAMS_HEADS), None, Some(PARAMS_EMBED)]),
            },
            sin: LogicalAxes::replicated(2),
            cos: LogicalAxes::replicated(2),
            embedding: LogicalAxes::new(&[Some(PARAMS_VOCAB), Some(PARAMS_EMBED)]),
        }
    }
}

impl Weights<ArrayType> {
    /// Global array types of every weight.
    pub fn shapes(hparams: &HParams, data_type: DataType) -> Self {
        let h = hparams;
        let array = |shape: Vec<usize>| ArrayType::new(data_type, shape);
        Weights {
            layer: Layer {
                q_wi: array(vec![h.layers(), h.heads(), h.embed(), h.q_wi_per_head()]),
                kv: array(vec![h.layers(), h.embed(), 1, 2 * h.qkv()]),
                o_wo: array(vec![h.layers(), h.heads(), h.o_wo_per_head(), h.embed()]),
            },
            sin: array(vec![h.max_len(), h.qkv() / 2]),
            cos: array(vec![h.max_len(), h.qkv() / 2]),
            embedding: array(vec![h.vocab(), h.embed()]),
        }
    }
}

impl Weights<HostArray> {
    /// Randomly initialized weights.
    ///
    /// Projections are drawn from a Gaussian scaled by `1 / sqrt(fan_in)`, the embedding from a standard Gaussian,
    /// and the rotary tables hold the standard sinusoidal frequencies `base^(-2i / qkv)`. The same `seed` always
    /// yields the same weights.
    pub fn random(hparams: &HParams, seed: u64) -> Result<Self, Error> {
        let h = hparams;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut gaussian = |shape: Vec<usize>, fan_in: usize| -> Result<HostArray, Error> {
            let scale = 1.0 / (fan_in as f32).sqrt();
            let normal = Normal::new(0.0f32, scale)
                .map_err(|error| Error::InvalidHParams { message: format!("invalid initialization scale: {error}") })?;
            let count = shape.iter().product::<usize>();
            Ok(HostArray::new(shape, (0..count).map(|_| normal.sample(&mut rng)).collect())?)
        };
        let q_wi = gaussian(vec![h.layers(), h.heads(), h.embed(), h.q_wi_per_head()], h.embed())?;
        let kv = gaussian(vec![h.layers(), h.embed(), 1, 2 * h.qkv()], h.embed())?;
        let o_wo = gaussian(vec![h.layers(), h.heads(), h.o_wo_per_head(), h.embed()], h.heads() * h.o_wo_per_head())?;
        let embedding = gaussian(vec![h.vocab(), h.embed()], 1)?;
        let (sin, cos) = rotary_tables(h.max_len(), h.qkv())?;
        debug!(layers = h.layers(), embed = h.embed(), heads = h.heads(), seed, "initialized random weights");
        Ok(Weights { layer: Layer { q_wi, kv, o_wo }, sin, cos, embedding })
    }

    /// Checks that every weight has the shape implied by `hparams`.
    pub fn validate(&self, hparams: &HParams) -> Result<(), Error> {
        let expected = Weights::shapes(hparams, DataType::Float32);
        let logical_axes = Weights::logical_axes();
        let named = [
            ("q_wi", &self.layer.q_wi, &expected.layer.q_wi, &logical_axes.layer.q_wi),
            ("kv", &self.layer.kv, &expected.layer.kv, &logical_axes.layer.kv),
            ("o_wo", &self.layer.o_wo, &expected.layer.o_wo, &logical_axes.layer.o_wo),
            ("sin", &self.sin, &expected.sin, &logical_axes.sin),
            ("cos", &self.cos, &expected.cos, &logical_axes.cos),
            ("embedding", &self.embedding, &expected.embedding, &logical_axes.embedding),
        ];
        for (tensor, array, expected, axes) in named {
            check_shape(tensor, array.shape(), &expected.shape, axes)?;
        }
        Ok(())
    }
}

/// Checks that `actual` equals `expected`, naming the offending logical axis on mismatch.
pub(crate) fn check_shape(tensor: &str, actual: &[usize], expected: &[usize], axes: &LogicalAxes) -> Result<(), Error> {
    if actual.len() != expected.len() {
        return Err(Error::RankMismatch { tensor: tensor.to_string(), expected: expected.len(), actual: actual.len() });
    }
    match (0..actual.len()).find(|dimension| actual[*dimension] != expected[*dimension]) {
        Some(dimension) => Err(Error::ShapeMismatch {
            tensor: tensor.to_string(),
            logical_axis: axes.label(dimension),
            expected: expected[dimension],
            actual: actual[dimension],
        }),
        None => Ok(()),
    }
}

/// Standard rotary `(sin, cos)` tables `[max_len, qkv / 2]`.
fn rotary_tables(max_len: usize, qkv: usize) -> Result<(HostArray, HostArray), Error> {
    let half = qkv / 2;
    let angle = |index: &[usize]| {
        let frequency = ROTARY_BASE.powf(-2.0 * index[1] as f32 / qkv as f32);
        index[0] as f32 * frequency
    };
    let sin = HostArray::from_fn(vec![max_len, half], |index| angle(index).sin())?;
    let cos = HostArray::from_fn(vec![max_len, half], |index| angle(index).cos())?;
    Ok((sin, cos))
}

#[cfg(test)]
mod tests {
    use crate::parameters::Parameterized;

    use super::*;

    fn hparams() -> HParams {
        HParams::new(8, 16, 32, 16, 4, 256, 1024).unwrap()
    }

    #[test]
    fn test_logical_axes_match_shapes() {
        let axes = Weights::logical_axes();
        let shapes = Weights::shapes(&hparams(), DataType::BFloat16);
        assert_eq!(axes.param_count(), 6);
        for (axes, shape) in axes.params().into_iter().zip(shapes.params()) {
            assert_eq!(axes.rank(), shape.rank());
        }
        assert_eq!(shapes.layer.q_wi.to_string(), "bf16[8, 16, 16, 8]");
        assert_eq!(shapes.layer.o_wo.to_string(), "bf16[8, 16, 6, 16]");
        assert_eq!(shapes.sin.to_string(), "bf16[256, 2]");
    }

    #[test]
    fn test_random_weights_are_seeded_and_well_formed() {
        let hparams = hparams();
        let weights = Weights::random(&hparams, 0).unwrap();
        assert!(weights.validate(&hparams).is_ok());
        assert_eq!(weights, Weights::random(&hparams, 0).unwrap());
        assert_ne!(weights.layer.q_wi, Weights::random(&hparams, 1).unwrap().layer.q_wi);
        assert_eq!(weights.sin.get(&[0, 0]), Ok(0.0));
        assert_eq!(weights.cos.get(&[0, 1]), Ok(1.0));
        assert!((weights.sin.get(&[3, 0]).unwrap() - 3.0f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_validate_names_the_mismatched_logical_axis() {
        let hparams = hparams();
        let mut weights = Weights::random(&hparams, 0).unwrap();
        weights.layer.q_wi = HostArray::zeros(vec![8, 8, 16, 8]).unwrap();
        assert!(matches!(
            weights.validate(&hparams),
            Err(Error::ShapeMismatch { tensor, logical_axis, expected: 16, actual: 8 })
                if tensor == "q_wi" && logical_axis == PARAMS_HEADS
        ));
    }
}
