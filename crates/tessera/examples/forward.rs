use tessera::{Chunk, Config, KVCache, ProgramSignature, Weights};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
[model]
layers = 8
embed = 16
ff = 32
heads = 16
qkv = 4
max_len = 256
vocab = 1024

[inference]
attn_all_to_all = "axes_xyz"

[mesh]
x = 2
y = 2
z = 2
"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::from_toml_str(CONFIG)?,
    };
    let weights = Weights::random(&config.model, 0)?;
    let engine = config.engine(&weights)?;

    let batch = engine.mesh().device_count();
    let prompt = (0..batch).map(|row| (0..=row as u32).collect::<Vec<_>>()).collect::<Vec<_>>();
    let chunk = Chunk::from_sequences(&prompt, batch)?;
    let caches = KVCache::empty_layers(config.model.layers(), batch, config.model.qkv())?;
    let (result, caches) = engine.forward(&chunk, &caches)?;
    println!("logits: {:?}, cache valid lengths: {:?}", result.logits.shape(), caches[0].valid_lengths()?);

    // Greedy next token of every row, decoded through the cache.
    let vocab = config.model.vocab();
    let all_logits = result.logits.to_vec()?;
    let next = chunk
        .row_lengths()?
        .iter()
        .enumerate()
        .map(|(row, length)| {
            let offset = (row * batch + length - 1) * vocab;
            let logits = &all_logits[offset..offset + vocab];
            let token = (0..vocab).max_by(|lhs, rhs| logits[*lhs].total_cmp(&logits[*rhs])).unwrap_or(0);
            vec![token as u32]
        })
        .collect::<Vec<_>>();
    let (result, caches) = engine.forward(&Chunk::from_sequences(&next, 2)?, &caches)?;
    println!("logits: {:?}, cache valid lengths: {:?}", result.logits.shape(), caches[0].valid_lengths()?);

    let signature = ProgramSignature::forward(engine.mesh(), &config.model, &config.inference, batch, 2, 0)?;
    println!("{}", signature.to_mlir("mesh")?);
    Ok(())
}
