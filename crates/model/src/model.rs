use std::{collections::HashMap, sync::PoisonError};

use candle_core::{bail, DType, Device, Result, Tensor, Var, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder, VarMap};
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};

use crate::{block::CrossModalEncoder, config::MultimodalConfig};

/// Classifier logits plus the representation they were computed from.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `(batch, n_classes)`
    pub logits: Tensor,
    /// `(batch, combined_dim)`
    pub hidden: Tensor,
}

/// Audio/text transformer classifier.
///
/// With both modalities enabled, audio frames attend into the text sequence
/// and text tokens attend into the audio sequence. With a single modality the
/// matching encoder runs plain self-attention.
pub struct MultimodalTransformer {
    config: MultimodalConfig,
    device: Device,
    varmap: VarMap,
    audio_proj: Option<Linear>,
    text_proj: Option<Linear>,
    audio_encoder: Option<CrossModalEncoder>,
    text_encoder: Option<CrossModalEncoder>,
    proj1: Linear,
    proj2: Linear,
    out_layer: Linear,
    out_dropout: Dropout,
    training: bool,
}

impl std::fmt::Debug for MultimodalTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultimodalTransformer")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("training", &self.training)
            .finish()
    }
}

impl MultimodalTransformer {
    /// Allocates freshly initialised parameters on `device`.
    pub fn new(config: MultimodalConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let uses_audio = !config.only_text;
        let uses_text = !config.only_audio;

        let audio_proj = if uses_audio {
            Some(candle_nn::linear_no_bias(
                config.d_audio_orig,
                config.d_model,
                vb.pp("audio_proj"),
            )?)
        } else {
            None
        };
        let text_proj = if uses_text {
            Some(candle_nn::linear_no_bias(
                config.d_text_orig,
                config.d_model,
                vb.pp("text_proj"),
            )?)
        } else {
            None
        };

        let audio_encoder = if uses_audio {
            Some(CrossModalEncoder::new(&config, vb.pp("audio_encoder"))?)
        } else {
            None
        };
        let text_encoder = if uses_text {
            Some(CrossModalEncoder::new(&config, vb.pp("text_encoder"))?)
        } else {
            None
        };

        let combined = config.combined_dim();
        let proj1 = candle_nn::linear(combined, combined, vb.pp("proj1"))?;
        let proj2 = candle_nn::linear(combined, combined, vb.pp("proj2"))?;
        let out_layer = candle_nn::linear(combined, config.n_classes, vb.pp("out_layer"))?;
        let out_dropout = Dropout::new(config.out_dropout);

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            audio_proj,
            text_proj,
            audio_encoder,
            text_encoder,
            proj1,
            proj2,
            out_layer,
            out_dropout,
            training: true,
        })
    }

    /// Like [`Self::new`], but every projection weight and bias is drawn
    /// from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` with a host RNG seeded by
    /// `seed`, so the same seed always yields the same parameters. Layer
    /// norms keep their unit scale and zero shift.
    pub fn new_seeded(config: MultimodalConfig, device: &Device, seed: u64) -> Result<Self> {
        let model = Self::new(config, device)?;
        model.reinitialize(seed)?;
        Ok(model)
    }

    fn reinitialize(&self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        let params = self.parameters();
        let fan_in_by_layer: HashMap<&str, usize> = params
            .iter()
            .filter_map(|(name, var)| match (name.strip_suffix(".weight"), var.dims()) {
                (Some(layer), &[_, fan_in]) => Some((layer, fan_in)),
                _ => None,
            })
            .collect();

        for (name, var) in &params {
            let layer = name
                .strip_suffix(".weight")
                .or_else(|| name.strip_suffix(".bias"))
                .unwrap_or(name.as_str());
            let Some(&fan_in) = fan_in_by_layer.get(layer) else {
                continue;
            };
            let bound = 1.0 / (fan_in as f32).sqrt();
            let values: Vec<f32> = (&mut rng)
                .sample_iter(Uniform::new_inclusive(-bound, bound))
                .take(var.elem_count())
                .collect();
            var.set(&Tensor::from_vec(values, var.dims(), &self.device)?)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &MultimodalConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Named trainable parameters, sorted by name.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    /// Runs the classifier. Sequences are `(batch, len, features)`, masks are
    /// `(batch, len)` with non-zero entries marking valid positions.
    pub fn forward(
        &self,
        audio: Option<&Tensor>,
        text: Option<&Tensor>,
        audio_mask: Option<&Tensor>,
        text_mask: Option<&Tensor>,
    ) -> Result<ModelOutput> {
        let train = self.training;
        let audio_hidden = project("audio", self.audio_proj.as_ref(), audio)?;
        let text_hidden = project("text", self.text_proj.as_ref(), text)?;

        let mut pooled = Vec::with_capacity(2);

        if let (Some(encoder), Some(audio_hidden)) = (&self.audio_encoder, audio_hidden.as_ref()) {
            let (memory, key_mask) = match text_hidden.as_ref() {
                Some(text_hidden) => (Some(text_hidden), text_mask),
                None => (None, audio_mask),
            };
            let encoded =
                encoder.forward(audio_hidden, memory, self.attention_mask(key_mask), train)?;
            pooled.push(masked_mean(&encoded, audio_mask)?);
        }

        if let (Some(encoder), Some(text_hidden)) = (&self.text_encoder, text_hidden.as_ref()) {
            let (memory, key_mask) = match audio_hidden.as_ref() {
                Some(audio_hidden) => (Some(audio_hidden), audio_mask),
                None => (None, text_mask),
            };
            let encoded =
                encoder.forward(text_hidden, memory, self.attention_mask(key_mask), train)?;
            pooled.push(masked_mean(&encoded, text_mask)?);
        }

        let combined = match pooled.len() {
            0 => bail!("model has no enabled modality"),
            1 => pooled.remove(0),
            _ => Tensor::cat(&pooled, D::Minus1)?,
        };

        let hidden = self.proj1.forward(&combined)?.relu()?;
        let hidden = self.out_dropout.forward(&hidden, train)?;
        let hidden = (self.proj2.forward(&hidden)? + &combined)?;
        let logits = self.out_layer.forward(&hidden)?;

        Ok(ModelOutput { logits, hidden })
    }

    fn attention_mask<'a>(&self, mask: Option<&'a Tensor>) -> Option<&'a Tensor> {
        if self.config.attn_mask {
            mask
        } else {
            None
        }
    }
}

fn project(label: &str, proj: Option<&Linear>, input: Option<&Tensor>) -> Result<Option<Tensor>> {
    match (proj, input) {
        (Some(proj), Some(input)) => {
            let input = if input.dtype() == DType::F32 {
                input.clone()
            } else {
                input.to_dtype(DType::F32)?
            };
            Ok(Some(proj.forward(&input)?))
        }
        (Some(_), None) => bail!("{label} input is required by the model configuration"),
        (None, _) => Ok(None),
    }
}

/// Mean over valid positions of a `(batch, len, dim)` tensor.
fn masked_mean(hidden: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let Some(mask) = mask else {
        return hidden.mean(1);
    };
    let weights = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&weights)?.sum(1)?;
    let counts = weights.sum(1)?.affine(1.0, 1e-6)?;
    summed.broadcast_div(&counts)
}
