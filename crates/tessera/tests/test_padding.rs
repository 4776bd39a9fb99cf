use tessera::{
    AttnAllToAll, Chunk, Error, HParams, HostArray, InferenceEngine, InferenceOptions, KVCache, Mesh, Weights,
};

const SEQ_LEN: usize = 8;

fn hparams() -> HParams {
    HParams::new(4, 16, 32, 16, 4, 256, 1024).unwrap()
}

fn engine(shape: (usize, usize, usize)) -> InferenceEngine {
    let options = InferenceOptions { batch_unsharded: true, ..Default::default() };
    engine_with_options(shape, options)
}

fn engine_with_options(shape: (usize, usize, usize), options: InferenceOptions) -> InferenceEngine {
    let mesh = Mesh::grid(&[("x", shape.0), ("y", shape.1), ("z", shape.2)]).unwrap();
    let weights = Weights::random(&hparams(), 3).unwrap();
    InferenceEngine::new(mesh, hparams(), &weights, options).unwrap()
}

/// Rows of `[3, 5]` real tokens, with every padding position set to `padding`.
fn chunk(padding: u32) -> Chunk<HostArray<u32>> {
    padded_chunk(&[3, 5], padding)
}

/// Rows with the given numbers of real tokens, with every padding position set to `padding`.
fn padded_chunk(lengths: &[usize], padding: u32) -> Chunk<HostArray<u32>> {
    let tokens = HostArray::from_fn(vec![lengths.len(), SEQ_LEN], |index| {
        if index[1] < lengths[index[0]] {
            (index[0] * 100 + index[1] * 7 + 1) as u32
        } else {
            padding
        }
    })
    .unwrap();
    let lengths = HostArray::new(vec![lengths.len()], lengths.iter().map(|length| *length as u32).collect()).unwrap();
    Chunk::new(tokens, lengths).unwrap()
}

/// Logits of the real positions of every row.
fn valid_logits(logits: &HostArray, lengths: &[usize]) -> Vec<HostArray> {
    lengths
        .iter()
        .enumerate()
        .map(|(row, length)| logits.region(&[row, 0, 0], &[1, *length, logits.shape()[2]]).unwrap())
        .collect()
}

#[test]
fn test_padding_does_not_influence_real_positions() {
    for shape in [(1, 1, 1), (2, 2, 2)] {
        let engine = engine(shape);
        let caches = KVCache::empty_layers(4, 2, 4).unwrap();
        let (zeros, _) = engine.forward(&chunk(0), &caches).unwrap();
        let (other, _) = engine.forward(&chunk(977), &caches).unwrap();
        for (zeros, other) in valid_logits(&zeros.logits, &[3, 5]).iter().zip(valid_logits(&other.logits, &[3, 5])) {
            assert!(zeros.max_abs_diff(&other).unwrap() < 1e-5, "mesh {shape:?}");
        }
    }
}

#[test]
fn test_padding_does_not_influence_sharded_batches() {
    let lengths = [3, 5, 0, 8, 1, 2, 7, 4];
    let mut variants = AttnAllToAll::ALL
        .into_iter()
        .map(|strategy| InferenceOptions { attn_all_to_all: strategy, ..Default::default() })
        .collect::<Vec<_>>();
    variants.push(InferenceOptions { shard_seqlen_vs_batch: true, ..Default::default() });
    for options in variants {
        let engine = engine_with_options((2, 2, 2), options);
        let caches = KVCache::empty_layers(4, lengths.len(), 4).unwrap();
        let (zeros, zeros_caches) = engine.forward(&padded_chunk(&lengths, 0), &caches).unwrap();
        let (other, other_caches) = engine.forward(&padded_chunk(&lengths, 977), &caches).unwrap();
        assert_eq!(zeros.logits.shape(), &[8, SEQ_LEN, 1024]);
        assert_eq!(zeros_caches[3].valid_lengths().unwrap(), lengths);
        assert_eq!(zeros_caches[3].mask, other_caches[3].mask);
        let rows = valid_logits(&zeros.logits, &lengths).into_iter().zip(valid_logits(&other.logits, &lengths));
        for (row, (zeros, other)) in rows.enumerate().filter(|(row, _)| lengths[*row] > 0) {
            let difference = zeros.max_abs_diff(&other).unwrap();
            assert!(difference < 1e-5, "{options:?}: row {row} differs by {difference}");
        }
    }
}

#[test]
fn test_chunk_without_positions_is_rejected() {
    let engine = engine((1, 1, 1));
    let chunk = Chunk { tokens: HostArray::zeros(vec![2, 0]).unwrap(), lengths: HostArray::zeros(vec![2]).unwrap() };
    assert!(matches!(
        engine.forward(&chunk, &KVCache::empty_layers(4, 2, 4).unwrap()),
        Err(Error::InvalidChunk { .. }),
    ));
}

#[test]
fn test_rows_do_not_influence_each_other() {
    let engine = engine((2, 2, 2));
    let (batched, _) = engine.forward(&chunk(0), &KVCache::empty_layers(4, 2, 4).unwrap()).unwrap();

    let alone = Chunk::from_sequences(&[vec![1, 8, 15]], SEQ_LEN).unwrap();
    let (single, _) = engine.forward(&alone, &KVCache::empty_layers(4, 1, 4).unwrap()).unwrap();
    let expected = valid_logits(&single.logits, &[3]).remove(0);
    let actual = valid_logits(&batched.logits, &[3]).remove(0);
    assert!(actual.max_abs_diff(&expected).unwrap() < 1e-3);
}

#[test]
fn test_padding_slots_are_masked_in_the_cache() {
    let engine = engine((2, 2, 2));
    let (_, caches) = engine.forward(&chunk(0), &KVCache::empty_layers(4, 2, 4).unwrap()).unwrap();
    for cache in &caches {
        assert_eq!(cache.cache_len(), SEQ_LEN);
        assert_eq!(cache.valid_lengths(), Ok(vec![3, 5]));
        assert_eq!(&cache.mask.to_vec().unwrap()[..SEQ_LEN], &[1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }
}
