use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Shape hyperparameters of a decoder-only transformer built from parallel attention and gated feed-forward blocks
/// with multi-query attention.
///
/// Every layer uses two fused projections per head:
///
/// | Projection | Per-head width                | Contents                                               |
/// | ---------- | ----------------------------- | ------------------------------------------------------ |
/// | `q_wi`     | `qkv + 2 * ff / heads`        | query, feed-forward gate, feed-forward linear input    |
/// | `o_wo`     | `qkv + ff / heads`            | attention context, gated feed-forward hidden activation |
///
/// The derived widths are computed once, when the [`HParams`] are constructed, and the constructor rejects shapes
/// that cannot be laid out this way.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ModelShape", into = "ModelShape")]
pub struct HParams {
    layers: usize,
    embed: usize,
    ff: usize,
    heads: usize,
    qkv: usize,
    max_len: usize,
    vocab: usize,
    q_wi_per_head: usize,
    o_wo_per_head: usize,
}

impl HParams {
    /// Creates new [`HParams`], validating that every field is positive, that `ff` divides evenly across `heads`,
    /// and that `qkv` is even (rotary encodings rotate pairs of features).
    pub fn new(
        layers: usize,
        embed: usize,
        ff: usize,
        heads: usize,
        qkv: usize,
        max_len: usize,
        vocab: usize,
    ) -> Result<Self, Error> {
        let fields = [
            ("layers", layers),
            ("embed", embed),
            ("ff", ff),
            ("heads", heads),
            ("qkv", qkv),
            ("max_len", max_len),
            ("vocab", vocab),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidHParams { message: format!("'{name}' must be positive") });
        }
        if ff % heads != 0 {
            return Err(Error::InvalidHParams {
                message: format!("'ff' ({ff}) must be divisible by 'heads' ({heads})"),
            });
        }
        if qkv % 2 != 0 {
            return Err(Error::InvalidHParams { message: format!("'qkv' ({qkv}) must be even") });
        }
        let ff_per_head = ff / heads;
        Ok(Self {
            layers,
            embed,
            ff,
            heads,
            qkv,
            max_len,
            vocab,
            q_wi_per_head: qkv + 2 * ff_per_head,
            o_wo_per_head: qkv + ff_per_head,
        })
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    pub fn embed(&self) -> usize {
        self.embed
    }

    pub fn ff(&self) -> usize {
        self.ff
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn qkv(&self) -> usize {
        self.qkv
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    /// Width of the feed-forward hidden layer owned by each head.
    pub fn ff_per_head(&self) -> usize {
        self.ff / self.heads
    }

    /// Width of the fused input projection of each head.
    pub fn q_wi_per_head(&self) -> usize {
        self.q_wi_per_head
    }

    /// Width of the fused output projection of each head.
    pub fn o_wo_per_head(&self) -> usize {
        self.o_wo_per_head
    }
}

/// Serialized form of [`HParams`]. The derived widths are not part of it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelShape {
    layers: usize,
    embed: usize,
    ff: usize,
    heads: usize,
    qkv: usize,
    max_len: usize,
    vocab: usize,
}

impl TryFrom<ModelShape> for HParams {
    type Error = Error;

    fn try_from(shape: ModelShape) -> Result<Self, Self::Error> {
        HParams::new(shape.layers, shape.embed, shape.ff, shape.heads, shape.qkv, shape.max_len, shape.vocab)
    }
}

impl From<HParams> for ModelShape {
    fn from(hparams: HParams) -> Self {
        Self {
            layers: hparams.layers,
            embed: hparams.embed,
            ff: hparams.ff,
            heads: hparams.heads,
            qkv: hparams.qkv,
            max_len: hparams.max_len,
            vocab: hparams.vocab,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_widths() {
        let hparams = HParams::new(8, 16, 32, 16, 4, 256, 1024).unwrap();
        assert_eq!(hparams.ff_per_head(), 2);
        assert_eq!(hparams.q_wi_per_head(), 8);
        assert_eq!(hparams.o_wo_per_head(), 6);
        assert_eq!(hparams.heads() * hparams.q_wi_per_head(), hparams.heads() * hparams.qkv() + 2 * hparams.ff());
        assert_eq!(hparams.heads() * hparams.o_wo_per_head(), hparams.heads() * hparams.qkv() + hparams.ff());
    }

    #[test]
    fn test_invalid_hparams() {
        assert!(matches!(
            HParams::new(8, 0, 32, 16, 4, 256, 1024),
            Err(Error::InvalidHParams { message }) if message.contains("'embed'"),
        ));
        assert!(matches!(
            HParams::new(8, 16, 30, 16, 4, 256, 1024),
            Err(Error::InvalidHParams { message }) if message.contains("divisible"),
        ));
        assert!(matches!(
            HParams::new(8, 16, 32, 16, 3, 256, 1024),
            Err(Error::InvalidHParams { message }) if message.contains("even"),
        ));
    }
}
