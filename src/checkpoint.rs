use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Context;
use candle_core::Device;
use candle_nn::VarMap;

use crate::error::CheckpointError;

/// Loads a safetensors checkpoint into every variable of `varmap`.
///
/// A missing file and an undecodable archive are reported as
/// [`CheckpointError::NotFound`] and [`CheckpointError::Corrupt`]. Anything
/// else, including tensors that are absent or have the wrong shape, is
/// [`CheckpointError::Other`].
pub fn load_into(varmap: &VarMap, path: &Path, device: &Device) -> Result<(), CheckpointError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(CheckpointError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("Failed reading checkpoint: {}", path.display()))
                .into())
        }
    };

    let tensors = candle_core::safetensors::load_buffer(&bytes, device).map_err(|source| {
        CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("Variable map lock poisoned"))?;
    for (name, var) in vars.iter() {
        let tensor = tensors.get(name).with_context(|| {
            format!(
                "Checkpoint {} is missing tensor '{name}'",
                path.display()
            )
        })?;
        if tensor.dims() != var.dims() {
            return Err(anyhow::anyhow!(
                "Shape mismatch for '{name}' in {}: checkpoint {:?}, model {:?}",
                path.display(),
                tensor.dims(),
                var.dims()
            )
            .into());
        }
        let tensor = tensor
            .to_dtype(var.dtype())
            .with_context(|| format!("Failed converting '{name}'"))?;
        var.set(&tensor)
            .with_context(|| format!("Failed assigning '{name}'"))?;
    }

    tracing::info!(
        path = %path.display(),
        tensors = vars.len(),
        "loaded pretrained weights"
    );
    Ok(())
}

pub fn save(varmap: &VarMap, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    varmap
        .save(path)
        .with_context(|| format!("Failed writing checkpoint: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Tensor};
    use candle_nn::{Init, VarBuilder};

    use super::*;

    fn small_varmap(value: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 3), "layer.weight", Init::Const(value))
            .unwrap();
        varmap
    }

    fn weight(varmap: &VarMap) -> Vec<Vec<f32>> {
        let vars = varmap.data().lock().unwrap();
        vars["layer.weight"].as_tensor().to_vec2::<f32>().unwrap()
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_into(
            &small_varmap(0.0),
            &dir.path().join("absent.safetensors"),
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        fs::write(&path, b"definitely not a checkpoint").unwrap();
        let err = load_into(&small_varmap(0.0), &path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }), "{err}");
    }

    #[test]
    fn round_trip_restores_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weights.safetensors");
        save(&small_varmap(0.25), &path).unwrap();

        let fresh = small_varmap(0.0);
        load_into(&fresh, &path, &Device::Cpu).unwrap();
        assert_eq!(weight(&fresh), vec![vec![0.25f32; 3]; 2]);
    }

    #[test]
    fn shape_mismatch_is_not_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let other = VarMap::new();
        let vb = VarBuilder::from_varmap(&other, DType::F32, &Device::Cpu);
        vb.get_with_hints((4,), "layer.weight", Init::Const(1.0))
            .unwrap();
        save(&other, &path).unwrap();

        let err = load_into(&small_varmap(0.0), &path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, CheckpointError::Other(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn missing_tensor_is_not_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let t = Tensor::zeros((1,), DType::F32, &Device::Cpu).unwrap();
        candle_core::safetensors::save(
            &std::collections::HashMap::from([("unrelated".to_string(), t)]),
            &path,
        )
        .unwrap();
        let err = load_into(&small_varmap(0.0), &path, &Device::Cpu).unwrap_err();
        assert!(!err.is_recoverable());
    }
}
