mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::{split_tensors, write_split, AUDIO_LEN, N_MFCC, TEXT_DIM, TEXT_LEN};
use tempfile::tempdir;
use training::{
    data::DatasetOptions, labels::session, BlockingDataLoader, SessionDataLoader, SessionDataset,
};

fn options() -> DatasetOptions {
    DatasetOptions {
        use_audio: true,
        use_text: true,
        n_mfcc: N_MFCC,
        text_dim: TEXT_DIM,
        max_len_audio: 400,
    }
}

#[test]
fn labels_are_remapped_into_session_classes() -> Result<()> {
    // session 18 uses [disgust, fear, happy, neutral, sad]
    let sess = session(18)?;
    let dataset =
        SessionDataset::from_tensors("train_18", split_tensors(&[4, 6, 1, 0, 5])?, &sess, options())?;
    assert_eq!(dataset.labels(), &[0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn emotion_outside_label_set_is_a_data_error() -> Result<()> {
    // session 1 has no angry class
    let sess = session(1)?;
    let err = SessionDataset::from_tensors("train_01", split_tensors(&[0, 2])?, &sess, options())
        .expect_err("angry is not in label set B");
    let message = err.to_string();
    assert!(message.contains("sample 1"), "{message}");
    assert!(message.contains("angry"), "{message}");
    Ok(())
}

#[test]
fn audio_is_truncated_and_shapes_are_checked() -> Result<()> {
    let sess = session(1)?;
    let truncating = DatasetOptions {
        max_len_audio: 4,
        ..options()
    };
    let dataset = SessionDataset::from_tensors("dev_01", split_tensors(&[0, 1, 3])?, &sess, truncating)?;
    let mut loader = BlockingDataLoader::new(SessionDataLoader::new(dataset, Device::Cpu, 8, false, 1)?);
    let batch = loader.next_batch()?.expect("batch");
    assert_eq!(batch.audio.as_ref().expect("audio").dims(), &[3, 4, N_MFCC]);
    assert_eq!(batch.audio_mask.as_ref().expect("mask").dims(), &[3, 4]);
    assert_eq!(batch.text.as_ref().expect("text").dims(), &[3, TEXT_LEN, TEXT_DIM]);
    assert_eq!(batch.labels.to_vec1::<u32>()?, vec![0, 1, 2]);

    let wrong_dim = DatasetOptions {
        n_mfcc: N_MFCC + 1,
        ..options()
    };
    assert!(SessionDataset::from_tensors("dev_01", split_tensors(&[0])?, &sess, wrong_dim).is_err());

    let mut missing_text = split_tensors(&[0])?;
    missing_text.remove("text");
    assert!(SessionDataset::from_tensors("dev_01", missing_text.clone(), &sess, options()).is_err());
    let audio_only = DatasetOptions {
        use_text: false,
        ..options()
    };
    assert!(SessionDataset::from_tensors("dev_01", missing_text, &sess, audio_only).is_ok());
    Ok(())
}

#[test]
fn missing_mask_means_every_frame_is_valid() -> Result<()> {
    let sess = session(1)?;
    let mut tensors = split_tensors(&[0, 1])?;
    tensors.remove("audio_mask");
    let dataset = SessionDataset::from_tensors("dev_01", tensors, &sess, options())?;
    let mut loader = BlockingDataLoader::new(SessionDataLoader::new(dataset, Device::Cpu, 2, false, 1)?);
    let batch = loader.next_batch()?.expect("batch");
    let valid = batch
        .audio_mask
        .expect("mask")
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_vec0::<f32>()?;
    assert_eq!(valid as usize, 2 * AUDIO_LEN);
    Ok(())
}

#[test]
fn empty_or_mismatched_splits_are_rejected() -> Result<()> {
    let sess = session(1)?;
    let mut tensors = split_tensors(&[0, 1])?;
    tensors.insert(
        "labels".to_string(),
        Tensor::from_vec(vec![0i64, 1, 3], 3, &Device::Cpu)?,
    );
    assert!(SessionDataset::from_tensors("dev_01", tensors, &sess, options()).is_err());

    let mut empty = split_tensors(&[0])?;
    empty.insert(
        "labels".to_string(),
        Tensor::zeros(0, DType::I64, &Device::Cpu)?,
    );
    assert!(SessionDataset::from_tensors("dev_01", empty, &sess, options()).is_err());
    Ok(())
}

fn epoch_labels(loader: &mut BlockingDataLoader<SessionDataLoader>, epoch: usize) -> Result<Vec<u32>> {
    loader.get_mut().start_epoch(epoch);
    let mut labels = Vec::new();
    while let Some(batch) = loader.next_batch()? {
        labels.extend(batch.labels.to_vec1::<u32>()?);
    }
    Ok(labels)
}

#[test]
fn training_loader_shuffles_per_epoch_and_keeps_partial_batch() -> Result<()> {
    let dir = tempdir()?;
    let sess = session(5)?; // label set D: codes equal class indices
    let codes: Vec<i64> = (0..10).map(|i| i % 7).collect();
    write_split(dir.path(), "train_05", &codes)?;

    let load = || -> Result<BlockingDataLoader<SessionDataLoader>> {
        let dataset =
            SessionDataset::load(dir.path().join("train_05.safetensors"), &sess, options())?;
        Ok(BlockingDataLoader::new(SessionDataLoader::new(
            dataset,
            Device::Cpu,
            4,
            true,
            7,
        )?))
    };
    let mut first = load()?;
    let mut second = load()?;
    assert_eq!(first.get_ref().len(), 3);

    let a1 = epoch_labels(&mut first, 1)?;
    let b1 = epoch_labels(&mut second, 1)?;
    assert_eq!(a1, b1);
    assert_eq!(a1.len(), 10);

    let mut sorted = a1.clone();
    sorted.sort_unstable();
    let mut expected: Vec<u32> = codes.iter().map(|&c| c as u32).collect();
    expected.sort_unstable();
    assert_eq!(sorted, expected);

    let a2 = epoch_labels(&mut first, 2)?;
    assert_ne!(a1, a2);
    Ok(())
}

#[test]
fn missing_split_file_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let sess = session(2)?;
    let err = SessionDataset::load(dir.path().join("dev_02.safetensors"), &sess, options())
        .expect_err("missing file");
    assert!(err.to_string().contains("dev_02"));
    Ok(())
}
