use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{MultimodalConfig, MultimodalTransformer};

fn build_config() -> MultimodalConfig {
    MultimodalConfig {
        n_layers: 1,
        n_heads: 2,
        n_classes: 5,
        d_audio_orig: 6,
        d_text_orig: 12,
        d_model: 8,
        ..MultimodalConfig::default()
    }
}

fn inputs(batch: usize) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
    let device = Device::Cpu;
    let audio = Tensor::randn(0f32, 1.0, (batch, 7, 6), &device)?;
    let text = Tensor::randn(0f32, 1.0, (batch, 4, 12), &device)?;
    let audio_mask = Tensor::from_vec(
        (0..batch * 7).map(|i| u8::from(i % 7 < 5)).collect::<Vec<_>>(),
        (batch, 7),
        &device,
    )?;
    let text_mask = Tensor::ones((batch, 4), DType::U8, &device)?;
    Ok((audio, text, audio_mask, text_mask))
}

#[test]
fn forward_produces_class_logits() -> Result<()> {
    let mut model = MultimodalTransformer::new(build_config(), &Device::Cpu)?;
    model.set_training(false);
    let (audio, text, audio_mask, text_mask) = inputs(3)?;

    let output = model.forward(Some(&audio), Some(&text), Some(&audio_mask), Some(&text_mask))?;

    assert_eq!(output.logits.dims(), &[3, 5]);
    assert_eq!(output.hidden.dims(), &[3, 16]);
    assert_eq!(output.logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn single_modality_models_ignore_the_other_input() -> Result<()> {
    let (audio, text, audio_mask, text_mask) = inputs(2)?;

    let mut audio_only = MultimodalTransformer::new(
        MultimodalConfig {
            only_audio: true,
            ..build_config()
        },
        &Device::Cpu,
    )?;
    audio_only.set_training(false);
    let output = audio_only.forward(Some(&audio), None, Some(&audio_mask), None)?;
    assert_eq!(output.logits.dims(), &[2, 5]);
    assert_eq!(output.hidden.dims(), &[2, 8]);
    assert!(audio_only
        .parameters()
        .iter()
        .all(|(name, _)| !name.starts_with("text_")));

    let mut text_only = MultimodalTransformer::new(
        MultimodalConfig {
            only_text: true,
            ..build_config()
        },
        &Device::Cpu,
    )?;
    text_only.set_training(false);
    let output = text_only.forward(None, Some(&text), None, Some(&text_mask))?;
    assert_eq!(output.logits.dims(), &[2, 5]);
    Ok(())
}

#[test]
fn missing_required_modality_is_an_error() -> Result<()> {
    let model = MultimodalTransformer::new(build_config(), &Device::Cpu)?;
    let (audio, _, audio_mask, _) = inputs(1)?;
    assert!(model
        .forward(Some(&audio), None, Some(&audio_mask), None)
        .is_err());
    Ok(())
}

#[test]
fn eval_mode_is_deterministic() -> Result<()> {
    let mut model = MultimodalTransformer::new(build_config(), &Device::Cpu)?;
    model.set_training(false);
    let (audio, text, audio_mask, text_mask) = inputs(2)?;

    let first = model.forward(Some(&audio), Some(&text), Some(&audio_mask), Some(&text_mask))?;
    let second = model.forward(Some(&audio), Some(&text), Some(&audio_mask), Some(&text_mask))?;

    let diff = (first.logits - second.logits)?
        .abs()?
        .sum_all()?
        .to_vec0::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}

#[test]
fn padded_audio_frames_do_not_change_predictions() -> Result<()> {
    let mut model = MultimodalTransformer::new(build_config(), &Device::Cpu)?;
    model.set_training(false);
    let (audio, text, audio_mask, text_mask) = inputs(1)?;

    let baseline = model.forward(Some(&audio), Some(&text), Some(&audio_mask), Some(&text_mask))?;

    // Frames 5 and 6 are padding; overwrite them with noise.
    let valid = audio.narrow(1, 0, 5)?;
    let noise = Tensor::randn(0f32, 10.0, (1, 2, 6), &Device::Cpu)?;
    let perturbed = Tensor::cat(&[&valid, &noise], 1)?;
    let changed = model.forward(
        Some(&perturbed),
        Some(&text),
        Some(&audio_mask),
        Some(&text_mask),
    )?;

    let diff = (baseline.logits - changed.logits)?
        .abs()?
        .max_keepdim(1)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert!(diff[0] < 1e-4, "padding leaked into logits: {}", diff[0]);
    Ok(())
}

#[test]
fn invalid_configurations_are_rejected() {
    let both = MultimodalConfig {
        only_audio: true,
        only_text: true,
        ..build_config()
    };
    assert!(MultimodalTransformer::new(both, &Device::Cpu).is_err());

    let uneven_heads = MultimodalConfig {
        d_model: 10,
        n_heads: 3,
        ..build_config()
    };
    assert!(uneven_heads.validate().is_err());

    let bad_dropout = MultimodalConfig {
        attn_dropout: 1.0,
        ..build_config()
    };
    assert!(bad_dropout.validate().is_err());
}

fn parameter_values(model: &MultimodalTransformer) -> Result<Vec<(String, Vec<f32>)>> {
    model
        .parameters()
        .into_iter()
        .map(|(name, var)| Ok((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
        .collect()
}

#[test]
fn seeded_models_start_from_identical_parameters() -> Result<()> {
    let first = MultimodalTransformer::new_seeded(build_config(), &Device::Cpu, 42)?;
    let second = MultimodalTransformer::new_seeded(build_config(), &Device::Cpu, 42)?;
    let other = MultimodalTransformer::new_seeded(build_config(), &Device::Cpu, 43)?;

    let a = parameter_values(&first)?;
    assert_eq!(a, parameter_values(&second)?);
    assert_ne!(a, parameter_values(&other)?);

    let (_, out_weight) = a
        .iter()
        .find(|(name, _)| name == "out_layer.weight")
        .expect("classifier weight");
    // out_layer maps the 16-wide fused vector to the classes
    let bound = 1.0 / 16f32.sqrt();
    assert!(out_weight.iter().all(|w| w.abs() <= bound));

    let (_, norm_scale) = a
        .iter()
        .find(|(name, _)| name == "audio_encoder.final_norm.weight")
        .expect("norm scale");
    assert!(norm_scale.iter().all(|&w| w == 1.0));
    Ok(())
}
