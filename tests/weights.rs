//! Weight file loading failures.

mod common;

use byteorder::{LittleEndian, WriteBytesExt};
use candle_core::Device;
use common::{small_hparams, write_model, write_model_with, ModelOptions};
use encodec::models::layout::ModelLayout;
use encodec::models::weights::{FILE_MAGIC, FILE_VERSION};
use encodec::{EncodecContext, EncodecError, EncodecModel};
use std::io::Write;
use tempfile::tempdir;

fn load_message(path: &std::path::Path) -> String {
    match EncodecModel::load(path, &Device::Cpu) {
        Err(EncodecError::ModelLoad { message, .. }) => message,
        Err(other) => panic!("expected a load error, got {other}"),
        Ok(_) => panic!("expected a load error"),
    }
}

fn first_tensor_name() -> String {
    ModelLayout::new(&small_hparams()).tensors()[0].name.clone()
}

#[test]
fn test_missing_file() {
    let dir = tempdir().unwrap();
    let err = EncodecContext::load(dir.path().join("absent.bin")).err().unwrap();
    match err {
        EncodecError::ModelLoad { path, source, .. } => {
            assert!(path.ends_with("absent.bin"));
            assert_eq!(source.unwrap().kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_bad_magic_and_version() {
    let dir = tempdir().unwrap();

    let path = dir.path().join("magic.bin");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_u32::<LittleEndian>(0x1234_5678).unwrap();
    f.write_u32::<LittleEndian>(FILE_VERSION).unwrap();
    drop(f);
    assert!(load_message(&path).contains("bad magic"));

    let path = dir.path().join("version.bin");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_u32::<LittleEndian>(FILE_MAGIC).unwrap();
    f.write_u32::<LittleEndian>(FILE_VERSION + 1).unwrap();
    drop(f);
    assert!(load_message(&path).contains("version"));
}

#[test]
fn test_truncated_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("short.bin");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_u32::<LittleEndian>(FILE_MAGIC).unwrap();
    f.write_u32::<LittleEndian>(FILE_VERSION).unwrap();
    f.write_i32::<LittleEndian>(1).unwrap();
    drop(f);

    let err = EncodecModel::load(&path, &Device::Cpu).err().unwrap();
    assert!(matches!(
        err,
        EncodecError::ModelLoad {
            source: Some(_),
            ..
        }
    ));
}

#[test]
fn test_truncated_tensor_data() {
    let dir = tempdir().unwrap();
    let path = write_model(dir.path(), "full.bin", &small_hparams(), &ModelOptions::default());
    let bytes = std::fs::read(&path).unwrap();

    let cut = dir.path().join("cut.bin");
    std::fs::File::create(&cut)
        .unwrap()
        .write_all(&bytes[..bytes.len() - 10])
        .unwrap();
    let message = load_message(&cut);
    assert!(message.contains("failed to read"), "{message}");
}

#[test]
fn test_invalid_hyperparameters() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nq.bin");
    let hp = encodec::Hyperparameters {
        n_q: 3,
        ..small_hparams()
    };
    write_model_with(&path, &hp, &ModelOptions::default(), &[], &[]).unwrap();
    assert!(load_message(&path).contains("n_q"));

    let path = dir.path().join("stereo.bin");
    let hp = encodec::Hyperparameters {
        in_channels: 2,
        ..small_hparams()
    };
    write_model_with(&path, &hp, &ModelOptions::default(), &[], &[]).unwrap();
    assert!(load_message(&path).contains("mono"));
}

#[test]
fn test_oversized_tensor_record() {
    let dir = tempdir().unwrap();
    let path = write_model(dir.path(), "base.bin", &small_hparams(), &ModelOptions::default());
    let mut bytes = std::fs::read(&path).unwrap();

    // one record claiming 2^32 values with 16 bytes behind it
    for v in [2, 4, 0, 1 << 28, 16] {
        bytes.write_i32::<LittleEndian>(v).unwrap();
    }
    bytes.extend_from_slice(b"huge");
    bytes.extend_from_slice(&[0; 16]);
    let big = dir.path().join("big.bin");
    std::fs::write(&big, &bytes).unwrap();
    assert!(load_message(&big).contains("failed to read data of huge"));

    // element count beyond usize
    let mut bytes = std::fs::read(&path).unwrap();
    for v in [4, 4, 0, i32::MAX, i32::MAX, i32::MAX, i32::MAX] {
        bytes.write_i32::<LittleEndian>(v).unwrap();
    }
    bytes.extend_from_slice(b"huge");
    let overflow = dir.path().join("overflow.bin");
    std::fs::write(&overflow, &bytes).unwrap();
    assert!(load_message(&overflow).contains("too many elements"));
}

#[test]
fn test_compression_factor_bounded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ratios.bin");
    let hp = encodec::Hyperparameters {
        ratios: vec![i32::MAX as usize; 16],
        ..small_hparams()
    };
    encodec::models::WeightWriter::create(&path, &hp)
        .unwrap()
        .finish()
        .unwrap();
    assert!(load_message(&path).contains("compression factor"));
}

#[test]
fn test_missing_tensor() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.bin");
    let name = first_tensor_name();
    write_model_with(
        &path,
        &small_hparams(),
        &ModelOptions::default(),
        &[name.as_str()],
        &[],
    )
    .unwrap();

    let message = load_message(&path);
    assert!(message.contains("missing tensor"), "{message}");
    assert!(message.contains(&name));
}

#[test]
fn test_misshaped_tensor() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shape.bin");
    let name = first_tensor_name();
    write_model_with(
        &path,
        &small_hparams(),
        &ModelOptions::default(),
        &[name.as_str()],
        &[(name.as_str(), vec![3, 3])],
    )
    .unwrap();

    let message = load_message(&path);
    assert!(message.contains("has shape [3, 3]"), "{message}");
}

#[test]
fn test_duplicate_tensor() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dup.bin");
    let spec = ModelLayout::new(&small_hparams()).tensors()[0].clone();
    write_model_with(
        &path,
        &small_hparams(),
        &ModelOptions::default(),
        &[],
        &[(spec.name.as_str(), spec.shape.clone())],
    )
    .unwrap();
    assert!(load_message(&path).contains("duplicate tensor"));
}

#[test]
fn test_extra_tensors_are_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("extra.bin");
    write_model_with(
        &path,
        &small_hparams(),
        &ModelOptions::default(),
        &[],
        &[("encoder.unused.weight", vec![2, 2])],
    )
    .unwrap();

    let mut ctx = EncodecContext::load(&path).unwrap();
    let hop = ctx.hparams().unwrap().compression_factor();
    assert_eq!(ctx.reconstruct(&vec![0.0; 2 * hop], 1).unwrap().len(), 2 * hop);
}
