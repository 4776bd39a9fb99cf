use tessera::{Chunk, Error, HParams, HostArray, InferenceEngine, InferenceOptions, KVCache, Mesh, Weights};

const BATCH: usize = 8;
const TOLERANCE: f32 = 1e-3;

fn hparams() -> HParams {
    HParams::new(2, 16, 32, 4, 8, 12, 64).unwrap()
}

fn engine(options: InferenceOptions) -> InferenceEngine {
    let mesh = Mesh::grid(&[("x", 2), ("y", 2), ("z", 2)]).unwrap();
    let weights = Weights::random(&hparams(), 11).unwrap();
    InferenceEngine::new(mesh, hparams(), &weights, options).unwrap()
}

fn token(row: usize, position: usize) -> u32 {
    ((row * 13 + position * 5 + 3) % 64) as u32
}

/// Row `b` holds the tokens at positions `[start, start + lengths[b])` of the `b`-th sequence.
fn chunk(start: &[usize], lengths: &[usize], seq_len: usize) -> Chunk<HostArray<u32>> {
    let sequences = (0..BATCH)
        .map(|row| (start[row]..start[row] + lengths[row]).map(|position| token(row, position)).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    Chunk::from_sequences(&sequences, seq_len).unwrap()
}

fn assert_continuation_matches(options: InferenceOptions, prefix_lengths: &[usize]) {
    let engine = engine(options);
    let empty = KVCache::empty_layers(2, BATCH, 8).unwrap();
    let continuation_lengths = [4; BATCH];
    let full_lengths = prefix_lengths.iter().map(|length| length + 4).collect::<Vec<_>>();

    let (one_shot, one_shot_caches) = engine.forward(&chunk(&[0; BATCH], &full_lengths, 8), &empty).unwrap();
    let (_, prefix_caches) = engine.forward(&chunk(&[0; BATCH], prefix_lengths, 4), &empty).unwrap();
    assert_eq!(prefix_caches[0].valid_lengths().unwrap(), prefix_lengths);
    let (continuation, caches) =
        engine.forward(&chunk(prefix_lengths, &continuation_lengths, 4), &prefix_caches).unwrap();

    assert_eq!(caches[1].cache_len(), 8);
    assert_eq!(caches[1].valid_lengths().unwrap(), full_lengths);
    assert_eq!(one_shot_caches[1].valid_lengths().unwrap(), full_lengths);
    for (row, prefix_length) in prefix_lengths.iter().enumerate() {
        let expected = one_shot.logits.region(&[row, *prefix_length, 0], &[1, 4, 64]).unwrap();
        let actual = continuation.logits.region(&[row, 0, 0], &[1, 4, 64]).unwrap();
        let difference = actual.max_abs_diff(&expected).unwrap();
        assert!(difference < TOLERANCE, "row {row} differs by {difference}");
    }
}

#[test]
fn test_continuation_matches_one_shot() {
    assert_continuation_matches(InferenceOptions::default(), &[4; BATCH]);
}

#[test]
fn test_continuation_after_padded_prefix_matches_one_shot() {
    let prefix_lengths = (0..BATCH).map(|row| 1 + row % 4).collect::<Vec<_>>();
    assert_continuation_matches(InferenceOptions::default(), &prefix_lengths);
    let options = InferenceOptions { shard_seqlen_vs_batch: true, latency_collectives: true, ..Default::default() };
    assert_continuation_matches(options, &prefix_lengths);
}

#[test]
fn test_cache_overflow() {
    let engine = engine(InferenceOptions::default());
    let empty = KVCache::empty_layers(2, BATCH, 8).unwrap();
    let (_, caches) = engine.forward(&chunk(&[0; BATCH], &[8; BATCH], 8), &empty).unwrap();
    let before = caches.clone();
    assert_eq!(
        engine.forward(&chunk(&[8; BATCH], &[8; BATCH], 8), &caches).map(|_| ()),
        Err(Error::CacheOverflow { cache_len: 8, seq_len: 8, max_len: 12 }),
    );
    assert_eq!(caches, before);

    let (_, caches) = engine.forward(&chunk(&[8; BATCH], &[4; BATCH], 4), &caches).unwrap();
    assert_eq!(caches[0].cache_len(), 12);
}
