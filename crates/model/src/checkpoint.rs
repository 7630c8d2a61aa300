//! Versioned safetensors checkpoints.
//!
//! A checkpoint is a single safetensors blob. Its metadata carries the format
//! identifier, the format version and the JSON `ModelConfig`; the tensors use
//! the names from [`crate::params::tensor_specs`], stored as little-endian F32.

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::params::Parameters;
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::{serialize, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

pub const FORMAT_ID: &str = "themis-gpt";
pub const FORMAT_VERSION: &str = "1";

const META_FORMAT: &str = "format";
const META_VERSION: &str = "format_version";
const META_CONFIG: &str = "config";

pub fn to_bytes(config: &ModelConfig, params: &Parameters) -> Result<Vec<u8>> {
    config.validate()?;
    params.validate(config)?;

    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = params
        .named_tensors()
        .into_iter()
        .map(|(name, view)| {
            let bytes = view.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name, view.shape().to_vec(), bytes)
        })
        .collect();

    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }

    let metadata = HashMap::from([
        (META_FORMAT.to_string(), FORMAT_ID.to_string()),
        (META_VERSION.to_string(), FORMAT_VERSION.to_string()),
        (META_CONFIG.to_string(), serde_json::to_string(config)?),
    ]);
    Ok(serialize(views, &Some(metadata))?)
}

/// Decode a checkpoint, taking the configuration from its metadata.
pub fn from_bytes(bytes: &[u8]) -> Result<(ModelConfig, Parameters)> {
    let metadata = read_metadata(bytes)?;
    let raw_config = metadata
        .get(META_CONFIG)
        .ok_or_else(|| ModelError::Format("checkpoint metadata has no config".to_string()))?;
    let config: ModelConfig = serde_json::from_str(raw_config)?;
    config.validate()?;
    let params = decode_parameters(bytes, &config)?;
    Ok((config, params))
}

/// Decode a checkpoint against a caller-supplied configuration.
///
/// Tensors that disagree with `config` produce `ShapeMismatch`.
pub fn from_bytes_with_config(bytes: &[u8], config: &ModelConfig) -> Result<Parameters> {
    config.validate()?;
    read_metadata(bytes)?;
    decode_parameters(bytes, config)
}

pub fn save(path: impl AsRef<Path>, config: &ModelConfig, params: &Parameters) -> Result<()> {
    let path = path.as_ref();
    let blob = to_bytes(config, params)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, &blob)?;
    info!(
        path = %path.display(),
        bytes = blob.len(),
        parameters = params.parameter_count(),
        version = FORMAT_VERSION,
        "checkpoint saved"
    );
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> Result<(ModelConfig, Parameters)> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let (config, params) = from_bytes(&data)?;
    info!(
        path = %path.display(),
        parameters = params.parameter_count(),
        layers = config.n_layers,
        "checkpoint loaded"
    );
    Ok((config, params))
}

pub fn load_with_config(path: impl AsRef<Path>, config: &ModelConfig) -> Result<Parameters> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let params = from_bytes_with_config(&data, config)?;
    info!(path = %path.display(), "checkpoint loaded against supplied config");
    Ok(params)
}

fn read_metadata(bytes: &[u8]) -> Result<HashMap<String, String>> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    let entries = metadata
        .metadata()
        .clone()
        .ok_or_else(|| ModelError::Format("checkpoint has no metadata".to_string()))?;

    match entries.get(META_FORMAT).map(String::as_str) {
        Some(FORMAT_ID) => {}
        Some(other) => {
            return Err(ModelError::Format(format!(
                "unknown format identifier '{}'",
                other
            )))
        }
        None => return Err(ModelError::Format("missing format identifier".to_string())),
    }
    match entries.get(META_VERSION).map(String::as_str) {
        Some(FORMAT_VERSION) => {}
        other => {
            return Err(ModelError::Format(format!(
                "unsupported format version {:?}",
                other
            )))
        }
    }
    Ok(entries)
}

fn decode_parameters(bytes: &[u8], config: &ModelConfig) -> Result<Parameters> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let mut named = HashMap::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(ModelError::ShapeMismatch(format!(
                "tensor '{}' has dtype {:?}, expected F32",
                name,
                view.dtype()
            )));
        }
        let floats: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let array = ArrayD::from_shape_vec(IxDyn(view.shape()), floats).map_err(|err| {
            ModelError::ShapeMismatch(format!("tensor '{}': {}", name, err))
        })?;
        named.insert(name, array);
    }
    Parameters::from_named_tensors(config, named)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastrand::Rng;

    #[test]
    fn round_trip_is_exact() {
        let config = ModelConfig::new(12, 8, 2, 2, 6).with_causal(true);
        let params = Parameters::init(&config, &mut Rng::with_seed(17)).expect("init");

        let blob = to_bytes(&config, &params).expect("encode");
        let (loaded_config, loaded) = from_bytes(&blob).expect("decode");
        assert_eq!(loaded_config, config);
        assert_eq!(loaded, params);
    }

    #[test]
    fn rejects_foreign_format() {
        let buffer = vec![0u8; 8];
        let view = TensorView::new(Dtype::F32, vec![2], &buffer).expect("view");
        let metadata = HashMap::from([(META_FORMAT.to_string(), "gguf".to_string())]);
        let blob = serialize(vec![("x", view)], &Some(metadata)).expect("serialize");
        assert!(matches!(from_bytes(&blob), Err(ModelError::Format(_))));

        let view = TensorView::new(Dtype::F32, vec![2], &buffer).expect("view");
        let blob = serialize(vec![("x", view)], &None).expect("serialize");
        assert!(matches!(from_bytes(&blob), Err(ModelError::Format(_))));
    }

    fn metadata(version: &str, config: &ModelConfig) -> HashMap<String, String> {
        HashMap::from([
            (META_FORMAT.to_string(), FORMAT_ID.to_string()),
            (META_VERSION.to_string(), version.to_string()),
            (
                META_CONFIG.to_string(),
                serde_json::to_string(config).expect("config json"),
            ),
        ])
    }

    #[test]
    fn rejects_unsupported_version() {
        let config = ModelConfig::new(12, 8, 1, 2, 6);
        let buffer = vec![0u8; 8];
        let view = TensorView::new(Dtype::F32, vec![2], &buffer).expect("view");
        let blob =
            serialize(vec![("x", view)], &Some(metadata("2", &config))).expect("serialize");
        assert!(matches!(from_bytes(&blob), Err(ModelError::Format(_))));
        assert!(matches!(
            from_bytes_with_config(&blob, &config),
            Err(ModelError::Format(_))
        ));
    }

    #[test]
    fn rejects_non_f32_tensors() {
        let config = ModelConfig::new(12, 8, 1, 2, 6);
        let buffer = vec![0u8; 12 * 8 * 4];
        let view = TensorView::new(Dtype::I32, vec![12, 8], &buffer).expect("view");
        let blob = serialize(
            vec![("token_embedding", view)],
            &Some(metadata(FORMAT_VERSION, &config)),
        )
        .expect("serialize");
        let err = from_bytes(&blob).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch(msg) if msg.contains("dtype")));
    }

    #[test]
    fn supplied_config_must_match_tensors() {
        let config = ModelConfig::new(12, 8, 1, 2, 6);
        let params = Parameters::init(&config, &mut Rng::with_seed(2)).expect("init");
        let blob = to_bytes(&config, &params).expect("encode");

        let wider_vocab = ModelConfig::new(13, 8, 1, 2, 6);
        let err = from_bytes_with_config(&blob, &wider_vocab).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch(_)));

        let deeper = ModelConfig::new(12, 8, 2, 2, 6);
        let err = from_bytes_with_config(&blob, &deeper).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch(_)));

        let same = from_bytes_with_config(&blob, &config).expect("decode");
        assert_eq!(same, params);
    }
}
