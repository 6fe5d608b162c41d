// ============================================================================
// Datei      : main.rs – Demo: Stack aus Presets bauen und einmal ausfuehren
// ============================================================================
//
//  Baut denselben Encoder/Decoder-Stack einmal sequenziell und einmal
//  reversibel, fuehrt einen Forward-Pass auf zufaelligen Token-Ids aus und
//  schreibt optional einen Checkpoint (erstes Argument = Pfad).

use anyhow::{Context, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use stackformer::checkpoint::save_stack;
use stackformer::presets::Preset;
use stackformer::{AttentionMask, Layer, RuntimeConfig, Sequence, Stack};

const BATCH: usize = 4;
const SEED: u64 = 42;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("stackformer=info".parse()?))
        .init();

    let p_checkpoint = std::env::args().nth(1);

    let preset = Preset {
        dim_model: 64,
        seq_len: 32,
        ..Preset::default()
    };

    let mut rng = StdRng::seed_from_u64(SEED);
    let m_tokens = Array2::from_shape_fn((BATCH, preset.seq_len), |_| rng.random_range(0..preset.vocab_size));
    let source = Sequence::Tokens(m_tokens);
    let mask = AttentionMask::zeros(preset.seq_len);

    for b_reversible in [false, true] {
        let config = RuntimeConfig::from_records(preset.encoder_decoder_records(b_reversible))
            .context("preset records rejected")?;
        let mut stack = Stack::build_seeded(&config, SEED);
        stack.set_train_mode(false);

        let m_out = stack
            .forward_with_rng(&source, None, Some(&mask), Some(&mask), &mut rng)
            .context("forward pass failed")?;
        let f_mean = m_out.mean().unwrap_or(0.0);
        info!(
            reversible = b_reversible,
            shape = ?m_out.dim(),
            mean = f_mean,
            parameters = stack.parameter_count(),
            "forward done"
        );

        if let Some(p_path) = &p_checkpoint {
            let p_target = if b_reversible {
                format!("{p_path}.reversible")
            } else {
                p_path.clone()
            };
            save_stack(&stack, &p_target).with_context(|| format!("cannot write checkpoint {p_target}"))?;
        }
    }

    Ok(())
}
