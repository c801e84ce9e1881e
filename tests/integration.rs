//! End-to-end tests on small random models written to disk.

mod common;

use candle_core::{Device, Tensor};
use common::{scenario_hparams, small_hparams, test_signal, write_model, ModelOptions};
use encodec::models::{FileType, PadMode, RecurrentSkip};
use encodec::{
    Codes, EncodecContext, EncodecError, EncodecModel, ReconstructOptions, DECODER_TRIM,
};
use std::sync::Arc;
use tempfile::tempdir;

fn small_context(opts: &ModelOptions) -> EncodecContext {
    let dir = tempdir().unwrap();
    let path = write_model(dir.path(), "small.bin", &small_hparams(), opts);
    EncodecContext::load(&path).unwrap()
}

fn max_abs(a: &Tensor) -> f32 {
    a.abs().unwrap().max_all().unwrap().to_scalar().unwrap()
}

fn l2(a: &Tensor) -> f32 {
    a.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap().sqrt()
}

#[test]
fn test_output_length_for_every_stage_count() {
    let mut ctx = small_context(&ModelOptions::default());
    let hp = ctx.hparams().unwrap().clone();
    let hop = hp.compression_factor();

    for n_q in hp.supported_n_q() {
        for frames in [1, 3, 7] {
            let input = test_signal(frames * hop, hp.sample_rate);
            let opts = ReconstructOptions::default().with_n_q(n_q).keep_codes(true);
            let out = ctx.reconstruct_with(&input, &opts).unwrap();
            assert_eq!(out.audio.len(), input.len() - DECODER_TRIM, "n_q={n_q}");

            let codes = out.codes.unwrap();
            assert_eq!(codes.n_q(), n_q);
            assert_eq!(codes.n_frames(), frames);
        }
    }
}

#[test]
fn test_scenario_32000_samples() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let hp = scenario_hparams();
    assert_eq!(hp.compression_factor(), 320);
    let path = write_model(dir.path(), "scenario.bin", &hp, &ModelOptions::default());
    let mut ctx = EncodecContext::load(&path)?;

    let input = test_signal(32000, hp.sample_rate);
    let opts = ReconstructOptions::default()
        .with_threads(2)
        .with_n_q(8)
        .keep_codes(true);
    let out = ctx.reconstruct_with(&input, &opts)?;

    assert_eq!(out.audio.len(), 32000);
    assert!(out.audio.iter().all(|s| s.is_finite()));
    let codes = out.codes.expect("codes requested");
    assert_eq!(codes.n_q(), 8);
    for stage in codes.stages() {
        assert_eq!(stage.len(), 100);
        assert!(stage.iter().all(|&i| (i as usize) < hp.n_bins));
    }
    Ok(())
}

#[test]
fn test_quantizer_decode_matches_latent_minus_residual() {
    let ctx = small_context(&ModelOptions::default());
    let model = ctx.model().unwrap();
    let hp = model.hparams();

    let input = test_signal(12 * hp.compression_factor(), hp.sample_rate);
    let x = Tensor::from_vec(input.clone(), (1, 1, input.len()), &Device::Cpu).unwrap();
    let latent = model.encoder().forward(&x).unwrap();

    for n_q in hp.supported_n_q() {
        let (codes, residual) = model.quantizer().encode(&latent, n_q).unwrap();
        let decoded = model.quantizer().decode(&codes, &Device::Cpu).unwrap();
        let expected = (&latent - &residual).unwrap();
        let err = max_abs(&(decoded - expected).unwrap());
        assert!(err < 1e-4, "n_q={n_q} err={err}");
    }
}

#[test]
fn test_residual_shrinks_with_more_stages() {
    // A zero row in every codebook means a stage can always keep the residual
    // as it is, so the greedy search never makes it larger.
    let opts = ModelOptions {
        zero_rows: true,
        ..Default::default()
    };
    let ctx = small_context(&opts);
    let model = ctx.model().unwrap();
    let hp = model.hparams();

    let input = test_signal(10 * hp.compression_factor(), hp.sample_rate);
    let x = Tensor::from_vec(input.clone(), (1, 1, input.len()), &Device::Cpu).unwrap();
    let latent = model.encoder().forward(&x).unwrap();

    let mut previous = l2(&latent);
    for n_q in hp.supported_n_q() {
        let (_, residual) = model.quantizer().encode(&latent, n_q).unwrap();
        let gap = l2(&residual);
        assert!(gap <= previous + 1e-5, "n_q={n_q}: {gap} > {previous}");
        previous = gap;
    }
}

#[test]
fn test_deterministic_across_calls_and_contexts() {
    let dir = tempdir().unwrap();
    let path = write_model(dir.path(), "m.bin", &small_hparams(), &ModelOptions::default());
    let model = Arc::new(EncodecModel::load(&path, &Device::Cpu).unwrap());

    let hop = model.hparams().compression_factor();
    let input = test_signal(9 * hop, model.hparams().sample_rate);

    let mut a = EncodecContext::from_model(Arc::clone(&model));
    let mut b = EncodecContext::from_model(Arc::clone(&model));
    let first = a.reconstruct(&input, 1).unwrap();
    let second = a.reconstruct(&input, 1).unwrap();
    let other = b.reconstruct(&input, 1).unwrap();

    assert_eq!(first, second);
    assert_eq!(first, other);
}

#[test]
fn test_thread_count_does_not_change_output() {
    let mut ctx = small_context(&ModelOptions::default());
    let hp = ctx.hparams().unwrap().clone();
    let input = test_signal(16 * hp.compression_factor(), hp.sample_rate);

    let opts = |threads| {
        ReconstructOptions::default()
            .with_threads(threads)
            .keep_codes(true)
    };
    let one = ctx.reconstruct_with(&input, &opts(1)).unwrap();
    let four = ctx.reconstruct_with(&input, &opts(4)).unwrap();

    assert_eq!(one.codes, four.codes);
    assert_eq!(one.audio, four.audio);
}

#[test]
fn test_concurrent_contexts_share_one_model() {
    let dir = tempdir().unwrap();
    let path = write_model(dir.path(), "m.bin", &small_hparams(), &ModelOptions::default());
    let model = Arc::new(EncodecModel::load(&path, &Device::Cpu).unwrap());
    let hop = model.hparams().compression_factor();
    let input = test_signal(6 * hop, model.hparams().sample_rate);

    let expected = EncodecContext::from_model(Arc::clone(&model))
        .reconstruct(&input, 1)
        .unwrap();

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let model = Arc::clone(&model);
                let input = &input;
                s.spawn(move || {
                    let mut ctx = EncodecContext::from_model(model);
                    ctx.reconstruct(input, i + 1).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
}

#[test]
fn test_misaligned_length_rejected_before_allocation() {
    let mut ctx = small_context(&ModelOptions::default());
    let hop = ctx.hparams().unwrap().compression_factor();

    assert_eq!(ctx.scratch_bytes(), 0);
    let err = ctx.reconstruct(&vec![0.1; 3 * hop + 1], 2).unwrap_err();
    assert!(matches!(err, EncodecError::InputShape(_)), "{err}");
    assert_eq!(ctx.scratch_bytes(), 0);
    assert_eq!(ctx.worker_threads(), None);

    let err = ctx.reconstruct(&[], 2).unwrap_err();
    assert!(matches!(err, EncodecError::InputShape(_)));

    // after a successful call the pool keeps its size
    ctx.reconstruct(&vec![0.1; 3 * hop], 2).unwrap();
    let reserved = ctx.scratch_bytes();
    assert!(reserved > 0);
    assert!(ctx.reconstruct(&vec![0.1; 5 * hop - 1], 2).is_err());
    assert_eq!(ctx.scratch_bytes(), reserved);
    assert_eq!(ctx.timings().n_calls, 1);
}

#[test]
fn test_scratch_grows_and_is_reused() {
    let mut ctx = small_context(&ModelOptions::default());
    let hop = ctx.hparams().unwrap().compression_factor();

    ctx.reconstruct(&vec![0.0; 20 * hop], 1).unwrap();
    let big = ctx.scratch_bytes();
    ctx.reconstruct(&vec![0.0; 2 * hop], 1).unwrap();
    assert_eq!(ctx.scratch_bytes(), big);
}

#[test]
fn test_unsupported_stage_counts() {
    let mut ctx = small_context(&ModelOptions::default());
    let hop = ctx.hparams().unwrap().compression_factor();
    let input = vec![0.0; 2 * hop];

    for n_q in [0, 3, 16, 32] {
        let opts = ReconstructOptions::default().with_n_q(n_q);
        let err = ctx.reconstruct_with(&input, &opts).unwrap_err();
        assert!(
            matches!(err, EncodecError::UnsupportedStageCount { .. }),
            "n_q={n_q}: {err}"
        );
    }
}

#[test]
fn test_encode_decode_round_trip_through_json() -> anyhow::Result<()> {
    let mut ctx = small_context(&ModelOptions::default());
    let hp = ctx.hparams()?.clone();
    let input = test_signal(5 * hp.compression_factor(), hp.sample_rate);
    let opts = ReconstructOptions::default().with_n_q(4);

    let codes = ctx.encode(&input, &opts)?;
    let json = serde_json::to_string(&codes)?;
    let restored: Codes = serde_json::from_str(&json)?;
    let audio = ctx.decode(&restored, 2)?;

    let direct = ctx.reconstruct_with(&input, &opts)?;
    assert_eq!(audio, direct.audio);

    // a lower bit-rate is a prefix of the stages
    let low = ctx.encode(&input, &opts.clone().with_n_q(2))?;
    assert_eq!(low, codes.truncate(2)?);
    Ok(())
}

#[test]
fn test_decode_rejects_bad_codes() {
    let mut ctx = small_context(&ModelOptions::default());
    let n_bins = ctx.hparams().unwrap().n_bins as u32;

    let out_of_range = Codes::new(2, 3, vec![0, 1, 2, 3, n_bins, 5]).unwrap();
    assert!(matches!(
        ctx.decode(&out_of_range, 1),
        Err(EncodecError::InputShape(_))
    ));

    let empty = Codes::new(2, 0, vec![]).unwrap();
    assert!(matches!(ctx.decode(&empty, 1), Err(EncodecError::InputShape(_))));

    let odd_stages = Codes::new(3, 1, vec![0, 0, 0]).unwrap();
    assert!(matches!(
        ctx.decode(&odd_stages, 1),
        Err(EncodecError::UnsupportedStageCount { .. })
    ));
}

#[test]
fn test_codes_with_missing_stages_never_reach_the_decoder() {
    let mut ctx = small_context(&ModelOptions::default());

    // two stages declared, one stage of data
    let short = r#"{"n_q":2,"n_frames":3,"data":[1,2,3]}"#;
    assert!(serde_json::from_str::<Codes>(short).is_err());
    assert!(matches!(
        Codes::new(2, 3, vec![1, 2, 3]),
        Err(EncodecError::InputShape(_))
    ));

    let full = r#"{"n_q":2,"n_frames":3,"data":[1,2,3,4,5,6]}"#;
    let codes: Codes = serde_json::from_str(full).unwrap();
    let hop = ctx.hparams().unwrap().compression_factor();
    assert_eq!(ctx.decode(&codes, 1).unwrap().len(), 3 * hop);
}

#[test]
fn test_free_releases_and_is_idempotent() {
    let mut ctx = small_context(&ModelOptions::default());
    let hop = ctx.hparams().unwrap().compression_factor();
    ctx.reconstruct(&vec![0.0; 2 * hop], 2).unwrap();
    assert!(ctx.scratch_bytes() > 0);

    ctx.free();
    assert!(ctx.is_released());
    assert_eq!(ctx.scratch_bytes(), 0);
    assert_eq!(ctx.worker_threads(), None);
    ctx.free();

    let opts = ReconstructOptions::default();
    assert!(matches!(
        ctx.reconstruct(&vec![0.0; 2 * hop], 1),
        Err(EncodecError::ContextReleased)
    ));
    assert!(matches!(
        ctx.encode(&vec![0.0; 2 * hop], &opts),
        Err(EncodecError::ContextReleased)
    ));
    let codes = Codes::new(2, 1, vec![0, 0]).unwrap();
    assert!(matches!(ctx.decode(&codes, 1), Err(EncodecError::ContextReleased)));
}

#[test]
fn test_timings_accumulate() {
    let mut ctx = small_context(&ModelOptions::default());
    let hop = ctx.hparams().unwrap().compression_factor();
    assert!(ctx.timings().t_load_us > 0);
    assert_eq!(ctx.timings().n_calls, 0);

    ctx.reconstruct(&vec![0.0; 4 * hop], 1).unwrap();
    let after_one = ctx.timings().t_compute_ms;
    ctx.reconstruct(&vec![0.0; 4 * hop], 1).unwrap();

    assert_eq!(ctx.timings().n_calls, 2);
    assert!(ctx.timings().t_compute_ms >= after_one);
    let last = ctx.last_timing().unwrap();
    assert!(last.total_ms >= last.encode_ms + last.quantize_ms);
}

#[test]
fn test_half_precision_weights() {
    let f32_ctx = small_context(&ModelOptions::default());
    let mut f16_ctx = small_context(&ModelOptions {
        ftype: FileType::F16,
        ..Default::default()
    });
    let hop = f16_ctx.hparams().unwrap().compression_factor();

    let out = f16_ctx.reconstruct(&test_signal(4 * hop, 8000), 1).unwrap();
    assert_eq!(out.len(), 4 * hop);
    assert!(out.iter().all(|s| s.is_finite()));

    // same random draw, rounded to f16 on disk
    let a = f32_ctx.model().unwrap().layout().n_params();
    let b = f16_ctx.model().unwrap().layout().n_params();
    assert_eq!(a, b);
}

#[test]
fn test_header_variants_run() {
    for (pad_mode, skip) in [
        (PadMode::Constant, RecurrentSkip::Stack),
        (PadMode::Reflect, RecurrentSkip::PerLayer),
    ] {
        let dir = tempdir().unwrap();
        let hp = encodec::Hyperparameters {
            pad_mode,
            recurrent_skip: skip,
            ..small_hparams()
        };
        let path = write_model(dir.path(), "variant.bin", &hp, &ModelOptions::default());
        let mut ctx = EncodecContext::load(&path).unwrap();
        assert_eq!(ctx.hparams().unwrap(), &hp);

        let hop = hp.compression_factor();
        let out = ctx.reconstruct(&test_signal(3 * hop, hp.sample_rate), 1).unwrap();
        assert_eq!(out.len(), 3 * hop);
    }
}
