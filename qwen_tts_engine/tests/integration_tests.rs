//! Integration tests against a real Qwen3-TTS CustomVoice checkpoint.
//!
//! These tests are gated behind the `integration-tests` feature flag and
//! read the model from `QWEN_TTS_MODEL_DIR`.
//!
//! Run with: `QWEN_TTS_MODEL_DIR=/path/to/model cargo test --features integration-tests`

#![cfg(feature = "integration-tests")]

use std::ops::ControlFlow;
use std::path::PathBuf;

use qwen_tts_engine::model::{GenerateOptions, LoadOptions, Model, StreamDecode, StreamOutcome};

/// "Hello, world!" in the CustomVoice chat template.
const HELLO: [u32; 12] = [151644, 77091, 198, 9707, 11, 1879, 0, 151645, 198, 151644, 77091, 198];

fn model_dir() -> PathBuf {
    let dir = std::env::var_os("QWEN_TTS_MODEL_DIR").expect("QWEN_TTS_MODEL_DIR must point at a model directory");
    PathBuf::from(dir)
}

fn load_model(cache_dir: &std::path::Path) -> Model {
    let options = LoadOptions {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..LoadOptions::default()
    };
    Model::load(model_dir(), &options).expect("Failed to load model")
}

fn greedy(frames: usize) -> GenerateOptions {
    GenerateOptions {
        do_sample: false,
        subtalker_do_sample: false,
        fixed_codec_tokens: frames,
        ..GenerateOptions::default()
    }
}

mod loader_tests {
    use super::*;

    #[test]
    fn test_load_custom_voice_model() {
        let cache = tempfile::tempdir().unwrap();
        let model = load_model(cache.path());
        assert_eq!(model.sample_rate(), 24000);
        assert!(model.num_code_groups() >= 16);
        assert!(model.speakers().iter().any(|s| s.eq_ignore_ascii_case("vivian")));
        assert!(model.codec().is_some());
    }

    #[test]
    fn test_cached_load_matches_fresh_load() {
        let cache = tempfile::tempdir().unwrap();
        let mut fresh = load_model(cache.path());
        let a = fresh.generate_codes(&HELLO, Some("vivian"), Some("english"), &greedy(12)).unwrap();
        drop(fresh);

        let mut cached = load_model(cache.path());
        let b = cached.generate_codes(&HELLO, Some("vivian"), Some("english"), &greedy(12)).unwrap();
        assert_eq!(a, b);
    }
}

mod synthesis_tests {
    use super::*;

    #[test]
    fn test_hello_world_audio() {
        let cache = tempfile::tempdir().unwrap();
        let mut model = load_model(cache.path());
        let audio = model.generate(&HELLO, Some("vivian"), Some("english")).unwrap();
        // At least a quarter second, at most the token budget
        assert!(audio.len() > 6000, "only {} samples", audio.len());
        assert!(audio.iter().all(|s| (-1.0..=1.0).contains(s)));
        let peak = audio.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.01, "audio is silent");
    }

    #[test]
    fn test_codec_incremental_matches_batch() {
        let cache = tempfile::tempdir().unwrap();
        let mut model = load_model(cache.path());
        let frames = model.generate_codes(&HELLO, Some("ryan"), None, &greedy(24)).unwrap();
        let check = model.verify_codec(&frames).unwrap();
        assert!(check.passed(), "{check:?}");
    }

    #[test]
    fn test_streaming_modes_agree_in_length() {
        let cache = tempfile::tempdir().unwrap();
        let mut model = load_model(cache.path());
        for mode in [StreamDecode::Overlap, StreamDecode::Incremental] {
            let options = GenerateOptions {
                stream_decode: mode,
                ..greedy(30)
            };
            let mut samples = 0;
            let outcome = model
                .generate_stream_with(&HELLO, Some("vivian"), Some("english"), 10, &options, |audio| {
                    samples += audio.len();
                    ControlFlow::Continue(())
                })
                .unwrap();
            assert_eq!(outcome, StreamOutcome::Completed);
            assert_eq!(samples, 30 * 1920, "{mode:?}");
        }
    }
}
