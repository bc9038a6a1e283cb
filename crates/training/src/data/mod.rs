use std::{collections::HashMap, path::Path};

use candle_core::{DType, Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    config::TrainingConfig,
    error::to_runtime_error,
    labels::{Emotion, SessionSpec},
    TrainingError,
};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch returned by session loaders. Tensors already live on the
/// training device; `labels` holds session-local class indices.
#[derive(Debug)]
pub struct SessionBatch {
    pub audio: Option<Tensor>,
    pub audio_mask: Option<Tensor>,
    pub text: Option<Tensor>,
    pub text_mask: Option<Tensor>,
    pub labels: Tensor,
    pub size: usize,
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<SessionBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<SessionBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut L {
        &mut self.inner
    }
}

/// Which inputs a split must provide and how they are shaped.
#[derive(Debug, Clone, Copy)]
pub struct DatasetOptions {
    pub use_audio: bool,
    pub use_text: bool,
    pub n_mfcc: usize,
    pub text_dim: usize,
    pub max_len_audio: usize,
}

impl DatasetOptions {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            use_audio: !config.model.only_text,
            use_text: !config.model.only_audio,
            n_mfcc: config.data.n_mfcc,
            text_dim: config.data.text_dim,
            max_len_audio: config.data.max_len_audio,
        }
    }
}

/// One split of a session held in host memory.
#[derive(Debug)]
pub struct SessionDataset {
    name: String,
    audio: Option<Tensor>,
    audio_mask: Option<Tensor>,
    text: Option<Tensor>,
    text_mask: Option<Tensor>,
    labels: Vec<u32>,
}

impl SessionDataset {
    /// Reads `{split}.safetensors` and remaps the stored emotion codes into
    /// the session's class indices.
    pub fn load(
        path: impl AsRef<Path>,
        session: &SessionSpec,
        options: DatasetOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("split")
            .to_string();
        if !path.is_file() {
            return Err(TrainingError::data(format!(
                "{name}: file {} does not exist",
                path.display()
            )));
        }
        let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|err| {
            TrainingError::data(format!("{name}: failed to read {}: {err}", path.display()))
        })?;
        Self::from_tensors(name, tensors, session, options)
    }

    pub fn from_tensors(
        name: impl Into<String>,
        mut tensors: HashMap<String, Tensor>,
        session: &SessionSpec,
        options: DatasetOptions,
    ) -> Result<Self> {
        let name = name.into();
        let raw_labels = tensors
            .remove("labels")
            .ok_or_else(|| TrainingError::data(format!("{name}: missing `labels` tensor")))?;
        let labels = remap_labels(&name, &raw_labels, session)?;
        let count = labels.len();
        if count == 0 {
            return Err(TrainingError::data(format!("{name}: split has no samples")));
        }

        let (audio, audio_mask) = if options.use_audio {
            let (audio, mask) = load_sequence(
                &name,
                &mut tensors,
                ("audio", "audio_mask"),
                count,
                options.n_mfcc,
                Some(options.max_len_audio),
            )?;
            (Some(audio), Some(mask))
        } else {
            (None, None)
        };

        let (text, text_mask) = if options.use_text {
            let (text, mask) = load_sequence(
                &name,
                &mut tensors,
                ("text", "text_mask"),
                count,
                options.text_dim,
                None,
            )?;
            (Some(text), Some(mask))
        } else {
            (None, None)
        };

        Ok(Self {
            name,
            audio,
            audio_mask,
            text,
            text_mask,
            labels,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    fn gather(&self, indices: &[usize], device: &Device) -> Result<SessionBatch> {
        let index: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let index = Tensor::from_vec(index, indices.len(), &Device::Cpu).map_err(to_runtime_error)?;
        let select = |tensor: &Option<Tensor>| -> Result<Option<Tensor>> {
            tensor
                .as_ref()
                .map(|t| {
                    t.index_select(&index, 0)
                        .and_then(|t| t.to_device(device))
                        .map_err(to_runtime_error)
                })
                .transpose()
        };

        let labels: Vec<u32> = indices.iter().map(|&i| self.labels[i]).collect();
        let labels = Tensor::from_vec(labels, indices.len(), device).map_err(to_runtime_error)?;

        Ok(SessionBatch {
            audio: select(&self.audio)?,
            audio_mask: select(&self.audio_mask)?,
            text: select(&self.text)?,
            text_mask: select(&self.text_mask)?,
            labels,
            size: indices.len(),
        })
    }
}

fn remap_labels(name: &str, raw: &Tensor, session: &SessionSpec) -> Result<Vec<u32>> {
    let flat = match raw.dims() {
        [_] => raw.clone(),
        [_, 1] => raw.squeeze(1).map_err(to_runtime_error)?,
        dims => {
            return Err(TrainingError::data(format!(
                "{name}: `labels` must have shape [N] or [N, 1], got {dims:?}"
            )))
        }
    };
    let codes = match flat.dtype() {
        DType::U8 | DType::U32 | DType::I64 => flat
            .to_dtype(DType::I64)
            .and_then(|t| t.to_vec1::<i64>())
            .map_err(to_runtime_error)?,
        dtype => {
            return Err(TrainingError::data(format!(
                "{name}: `labels` must be an integer tensor, got {dtype:?}"
            )))
        }
    };

    codes
        .into_iter()
        .enumerate()
        .map(|(index, code)| {
            let emotion = u32::try_from(code)
                .ok()
                .and_then(Emotion::from_code)
                .ok_or_else(|| {
                    TrainingError::data(format!(
                        "{name}: sample {index} has unknown emotion code {code}"
                    ))
                })?;
            session
                .label_set
                .class_index(emotion)
                .map(|class| class as u32)
                .ok_or_else(|| {
                    TrainingError::data(format!(
                        "{name}: sample {index} is labelled '{emotion}' which is not in label set {} of session {}",
                        session.label_set.name, session.id
                    ))
                })
        })
        .collect()
}

fn load_sequence(
    name: &str,
    tensors: &mut HashMap<String, Tensor>,
    (key, mask_key): (&str, &str),
    count: usize,
    feature_dim: usize,
    max_len: Option<usize>,
) -> Result<(Tensor, Tensor)> {
    let values = tensors
        .remove(key)
        .ok_or_else(|| TrainingError::data(format!("{name}: missing `{key}` tensor")))?;
    let (n, seq_len, dim) = match values.dims() {
        &[n, t, d] => (n, t, d),
        dims => {
            return Err(TrainingError::data(format!(
                "{name}: `{key}` must have shape [N, T, D], got {dims:?}"
            )))
        }
    };
    if n != count {
        return Err(TrainingError::data(format!(
            "{name}: `{key}` holds {n} samples but `labels` holds {count}"
        )));
    }
    if dim != feature_dim {
        return Err(TrainingError::data(format!(
            "{name}: `{key}` feature dimension is {dim}, expected {feature_dim}"
        )));
    }
    if seq_len == 0 {
        return Err(TrainingError::data(format!("{name}: `{key}` has zero length")));
    }

    let mask = match tensors.remove(mask_key) {
        Some(mask) => {
            if mask.dims() != [n, seq_len] {
                return Err(TrainingError::data(format!(
                    "{name}: `{mask_key}` must have shape [{n}, {seq_len}], got {:?}",
                    mask.dims()
                )));
            }
            mask.ne(0u8).map_err(to_runtime_error)?
        }
        None => Tensor::ones((n, seq_len), DType::U8, &Device::Cpu).map_err(to_runtime_error)?,
    };

    let keep = max_len.map_or(seq_len, |limit| seq_len.min(limit));
    let values = values
        .narrow(1, 0, keep)
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.contiguous())
        .map_err(to_runtime_error)?;
    let mask = mask
        .narrow(1, 0, keep)
        .and_then(|t| t.contiguous())
        .map_err(to_runtime_error)?;
    Ok((values, mask))
}

/// Batches one session split. Training splits are reshuffled every epoch
/// from `seed + epoch`; evaluation splits keep file order.
#[derive(Debug)]
pub struct SessionDataLoader {
    dataset: SessionDataset,
    device: Device,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
}

impl SessionDataLoader {
    pub fn new(
        dataset: SessionDataset,
        device: Device,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let order = (0..dataset.len()).collect();
        let mut loader = Self {
            dataset,
            device,
            batch_size,
            shuffle,
            seed,
            order,
            cursor: 0,
            epoch: 0,
        };
        loader.start_epoch(0);
        Ok(loader)
    }

    /// Opens `{data_path}/{split}.safetensors` for `session`.
    pub fn for_split(
        config: &TrainingConfig,
        session: &SessionSpec,
        split: &str,
        device: &Device,
        shuffle: bool,
    ) -> Result<Self> {
        let dataset = SessionDataset::load(
            config.data.split_path(split),
            session,
            DatasetOptions::from_config(config),
        )?;
        Self::new(
            dataset,
            device.clone(),
            config.data.batch_size,
            shuffle,
            config.runtime.seed,
        )
    }

    pub fn dataset(&self) -> &SessionDataset {
        &self.dataset
    }

    /// Batches per epoch, counting a trailing partial batch.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.cursor = 0;
        self.order = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            self.order.shuffle(&mut rng);
        }
    }

    fn build_batch(&mut self) -> Result<Option<SessionBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self
            .dataset
            .gather(&self.order[self.cursor..end], &self.device)?;
        self.cursor = end;
        Ok(Some(batch))
    }
}

impl DataLoader for SessionDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<SessionBatch>>> {
        Box::pin(async move { self.build_batch() })
    }
}
