//! Command-line interface for the Qwen3-TTS inference engine.
//!
//! # Usage
//!
//! ```bash
//! # Token ids of the chat template, produced by the Qwen tokenizer
//! qwen-tts-engine -p /path/to/Qwen3-TTS-12Hz-0.6B-CustomVoice \
//!     --tokens 151644,77091,198,9707,11,1879,0,151645,198,151644,77091,198 \
//!     --speaker vivian --language english -o hello.wav
//!
//! # Stream in chunks of 12 frames, decoding incrementally
//! qwen-tts-engine -p /path/to/model --tokens-file tokens.txt \
//!     --stream-chunk 12 --stream-mode incremental
//!
//! # Greedy, fixed-length generation
//! qwen-tts-engine -p /path/to/model --tokens-file tokens.txt --greedy --fixed-tokens 60
//!
//! # Inspect the model
//! qwen-tts-engine -p /path/to/model --list-speakers
//! qwen-tts-engine -p /path/to/model --verify-codec
//! ```

mod args;
mod wav;

use std::io::Write;
use std::ops::ControlFlow;

use anyhow::{Context, Result, bail};
use clap::Parser;
use qwen_tts_engine::GenerateError;
use qwen_tts_engine::model::{CodeFrames, Model, StreamOutcome};

use args::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.tracing {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .init();
    }

    println!("Qwen3-TTS engine");
    println!();

    let mut model = Model::load(&cli.model_path, &cli.load_options())
        .with_context(|| format!("Failed to load model from {}", cli.model_path.display()))?;

    if cli.list_speakers {
        print_names("Speakers", &model.speakers());
        print_names("Languages", &model.languages());
        return Ok(());
    }

    if cli.verify_codec {
        return verify_codec(&mut model, cli.verify_frames);
    }

    let tokens = cli.read_tokens()?;
    let options = cli.generate_options(model.options().clone());
    let speaker = cli.speaker.as_deref();
    let language = cli.language();
    tracing::debug!(tokens = tokens.len(), ?speaker, ?language, ?options, "Generation request");

    if !cli.tracing {
        model.set_progress_callback(|step, max| {
            if step % 12 == 0 {
                eprint!("\r  {step} frames (limit {max})");
                let _ = std::io::stderr().flush();
            }
        });
    }

    let samples = match cli.stream_chunk {
        Some(chunk) => {
            let mut samples = Vec::new();
            let mut chunks = 0usize;
            let outcome = model
                .generate_stream_with(&tokens, speaker, language, chunk, &options, |audio| {
                    chunks += 1;
                    samples.extend_from_slice(audio);
                    ControlFlow::Continue(())
                })
                .context("Streaming generation failed")?;
            eprintln!();
            if outcome == StreamOutcome::Aborted {
                bail!("Generation was aborted");
            }
            println!("Received {chunks} audio chunks");
            samples
        }
        None => match model.generate_with(&tokens, speaker, language, &options) {
            Ok(samples) => {
                eprintln!();
                samples
            }
            Err(GenerateError::CodecUnavailable { reason, frames }) => {
                eprintln!();
                tracing::warn!(%reason, frames = frames.len(), "Codec unavailable, retrying once");
                model
                    .decode_codes(&frames)
                    .with_context(|| format!("Codec unavailable: {reason}"))?
            }
            Err(err) => return Err(err).context("Generation failed"),
        },
    };

    let sample_rate = model.sample_rate();
    wav::write_wav(&cli.output, &samples, sample_rate)?;

    let perf = model.last_perf();
    println!(
        "Wrote {} ({:.2}s of audio, {} frames, stopped by {})",
        cli.output.display(),
        samples.len() as f64 / sample_rate as f64,
        perf.frames,
        perf.stop_reason
    );
    println!(
        "  prefill {:.0} ms, talker {:.0} ms, subtalker {:.0} ms, codec {:.0} ms, total {:.0} ms ({:.1} ms/frame)",
        perf.prefill_ms,
        perf.talker_ms,
        perf.subtalker_ms,
        perf.codec_ms,
        perf.total_ms,
        perf.ms_per_frame()
    );
    Ok(())
}

fn print_names(title: &str, names: &[&str]) {
    println!("{title}:");
    if names.is_empty() {
        println!("  (none)");
    }
    for name in names {
        println!("  {name}");
    }
}

/// Decode deterministic synthetic codes both ways and report the difference.
fn verify_codec(model: &mut Model, frames: usize) -> Result<()> {
    let groups = model.num_code_groups();
    let vocab = model.config().talker_config.code_predictor_config.vocab_size.max(1);
    let codes = (0..frames * groups)
        .map(|i| ((i * 7919 + 13) % vocab) as u32)
        .collect();
    let frames = CodeFrames::from_codes(groups, codes);
    let check = model.verify_codec(&frames).context("Codec check failed")?;
    println!(
        "Batch {} samples, incremental {} samples, max |diff| {:.2e}, mean |diff| {:.2e}",
        check.batch_len, check.incremental_len, check.max_abs_diff, check.mean_abs_diff
    );
    if !check.passed() {
        bail!("Incremental decoding diverges from batch decoding");
    }
    println!("Incremental decoding matches batch decoding");
    Ok(())
}
