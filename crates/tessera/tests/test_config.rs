use indoc::indoc;
use tessera::{AttnAllToAll, Chunk, Config, DataType, KVCache, OutputMode, ProgramSignature, Weights};

const CONFIG: &str = indoc! {r#"
    [model]
    layers = 2
    embed = 16
    ff = 32
    heads = 4
    qkv = 8
    max_len = 32
    vocab = 64

    [inference]
    attn_all_to_all = "axes_zxy"
    latency_collectives = true
    intermediate_dtype = "f32"
    output_mode = "logits"

    [mesh]
    x = 2
    y = 1
    z = 2
"#};

#[test]
fn test_engine_from_config() {
    let config = Config::from_toml_str(CONFIG).unwrap();
    assert_eq!(config.inference.attn_all_to_all, AttnAllToAll::AxesZXY);
    assert_eq!(config.inference.intermediate_dtype, DataType::Float32);
    assert_eq!(config.inference.output_mode, OutputMode::Logits);

    let weights = Weights::random(&config.model, 5).unwrap();
    let engine = config.engine(&weights).unwrap();
    assert_eq!(engine.mesh().device_count(), 4);

    let chunk = Chunk::from_sequences(&[vec![1, 2], vec![3], vec![4, 5, 6], vec![7, 8, 9, 10]], 4).unwrap();
    let (result, caches) = engine.forward(&chunk, &KVCache::empty_layers(2, 4, 8).unwrap()).unwrap();
    assert_eq!(result.logits.shape(), &[4, 4, 64]);
    assert_eq!(caches[1].valid_lengths(), Ok(vec![2, 1, 3, 4]));
}

#[test]
fn test_signature_from_config() {
    let config = Config::from_toml_str(CONFIG).unwrap();
    let mesh = config.mesh.build().unwrap();
    let signature = ProgramSignature::forward(&mesh, &config.model, &config.inference, 4, 4, 0).unwrap();
    let rendered = signature.to_mlir("mesh").unwrap();
    assert!(rendered.starts_with("sdy.mesh @mesh = <[\"x\"=2, \"y\"=1, \"z\"=2]>\nfunc.func @forward(\n"));

    // Under `axes_zxy`, `z` shards the embedding and `(x, y)` the heads.
    let q_wi = &signature.arguments[0];
    assert_eq!(
        q_wi.sharding.to_shardy_tensor_sharding_attribute("mesh").unwrap(),
        "#sdy.sharding<@mesh, [{}, {\"x\", \"y\"}, {\"z\"}, {}]>",
    );
}
