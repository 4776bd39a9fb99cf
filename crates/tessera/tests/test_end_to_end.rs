use tessera::{
    AttnAllToAll, Chunk, DataType, FullChunkResult, HParams, HostArray, InferenceEngine, InferenceOptions, KVCache,
    Mesh, OutputMode, Weights,
};
use tracing_subscriber::EnvFilter;

const BATCH: usize = 8;
const SEQ_LEN: usize = 32;
const TOLERANCE: f32 = 1e-3;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
}

fn hparams() -> HParams {
    HParams::new(8, 16, 32, 16, 4, 256, 1024).unwrap()
}

fn chunk(hparams: &HParams) -> Chunk<HostArray<u32>> {
    let vocab = hparams.vocab();
    let tokens = HostArray::from_fn(vec![BATCH, SEQ_LEN], |index| ((index[0] * 131 + index[1] * 17) % vocab) as u32)
        .unwrap();
    let lengths = HostArray::full(vec![BATCH], SEQ_LEN as u32).unwrap();
    Chunk::new(tokens, lengths).unwrap()
}

fn forward(
    shape: (usize, usize, usize),
    hparams: HParams,
    options: InferenceOptions,
) -> (FullChunkResult<HostArray>, Vec<KVCache<HostArray>>) {
    let mesh = Mesh::grid(&[("x", shape.0), ("y", shape.1), ("z", shape.2)]).unwrap();
    let weights = Weights::random(&hparams, 42).unwrap();
    let engine = InferenceEngine::new(mesh, hparams, &weights, options).unwrap();
    let caches = KVCache::empty_layers(hparams.layers(), BATCH, hparams.qkv()).unwrap();
    engine.forward(&chunk(&hparams), &caches).unwrap()
}

fn assert_close(actual: &HostArray, expected: &HostArray, context: &str) {
    let difference = actual.max_abs_diff(expected).unwrap();
    assert!(difference < TOLERANCE, "{context}: results differ by {difference}");
}

#[test]
fn test_all_strategies_agree() {
    init_logging();
    let (reference, reference_caches) = forward((1, 1, 1), hparams(), InferenceOptions::default());
    assert_eq!(reference.logits.shape(), &[BATCH, SEQ_LEN, 1024]);
    assert!(reference.logits.to_vec().unwrap().iter().all(|value| value.is_finite()));
    for strategy in AttnAllToAll::ALL {
        let options = InferenceOptions { attn_all_to_all: strategy, ..Default::default() };
        let (result, caches) = forward((2, 2, 2), hparams(), options);
        assert_eq!(result.logits.shape(), &[BATCH, SEQ_LEN, 1024]);
        assert_close(&result.logits, &reference.logits, &strategy.to_string());
        assert_eq!(caches.len(), 8);
        assert_eq!(caches[7].k.shape(), &[BATCH, SEQ_LEN, 4]);
        assert_close(&caches[7].k, &reference_caches[7].k, &strategy.to_string());
    }
}

#[test]
fn test_activations_output_mode() {
    init_logging();
    let options = InferenceOptions { output_mode: OutputMode::Activations, ..Default::default() };
    let (reference, _) = forward((1, 1, 1), hparams(), options);
    for strategy in [AttnAllToAll::AxesXYZ, AttnAllToAll::AxesZYX] {
        let (result, _) = forward((2, 2, 2), hparams(), InferenceOptions { attn_all_to_all: strategy, ..options });
        assert_eq!(result.logits.shape(), &[BATCH, SEQ_LEN, 16]);
        assert_close(&result.logits, &reference.logits, &strategy.to_string());
    }

    // Final activations are layer-normalized.
    let activations = reference.logits.to_vec().unwrap();
    let position = &activations[..16];
    let mean = position.iter().sum::<f32>() / 16.0;
    assert!(mean.abs() < 1e-4);
}

#[test]
fn test_partitioning_options_agree() {
    init_logging();
    let (reference, reference_caches) = forward((2, 2, 2), hparams(), InferenceOptions::default());
    let variants = [
        InferenceOptions { latency_collectives: true, ..Default::default() },
        InferenceOptions { shard_seqlen_vs_batch: true, ..Default::default() },
        InferenceOptions { batch_unsharded: true, ..Default::default() },
        InferenceOptions { batch_unsharded: true, shard_seqlen_vs_batch: true, ..Default::default() },
        InferenceOptions {
            attn_all_to_all: AttnAllToAll::AxesYZX,
            latency_collectives: true,
            shard_seqlen_vs_batch: true,
            ..Default::default()
        },
        InferenceOptions { batch_unsharded: true, latency_collectives: true, ..Default::default() },
    ];
    for options in variants {
        let (result, caches) = forward((2, 2, 2), hparams(), options);
        assert_close(&result.logits, &reference.logits, &format!("{options:?}"));
        assert_close(&caches[3].v, &reference_caches[3].v, &format!("{options:?}"));
        assert_eq!(caches[3].mask, reference_caches[3].mask);
    }
}

#[test]
fn test_non_cubic_meshes_agree() {
    init_logging();
    let (reference, _) = forward((1, 1, 1), hparams(), InferenceOptions::default());
    for shape in [(2, 1, 4), (1, 4, 2), (4, 2, 1)] {
        let (result, _) = forward(shape, hparams(), InferenceOptions::default());
        assert_close(&result.logits, &reference.logits, &format!("{shape:?}"));
    }
}

#[test]
fn test_reduced_precision_intermediates() {
    init_logging();
    let hparams = HParams::new(2, 16, 32, 16, 4, 256, 1024).unwrap();
    let (reference, _) = forward((2, 2, 2), hparams, InferenceOptions::default());
    for data_type in [DataType::BFloat16, DataType::Float16] {
        let options = InferenceOptions { intermediate_dtype: data_type, ..Default::default() };
        let (result, _) = forward((2, 2, 2), hparams, options);
        let difference = result.logits.max_abs_diff(&reference.logits).unwrap();
        assert!(difference > 0.0);
        assert!(difference < 0.1 * reference.logits.max_abs().unwrap(), "{data_type}: results differ by {difference}");
    }
}
