/// Backbone weight loading from safetensors files
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::path::Path;

use super::Vgg19Backbone;
use crate::PoseError;

/// Load the pretrained backbone snapshot
///
/// # Arguments
/// * `weights_path` - Path to the safetensors file
/// * `device` - Device to load the tensors on
///
/// # Returns
/// The raw parameter tensors and the backbone built from them. A missing
/// file, a missing tensor or a shape mismatch is a startup error; nothing is
/// partially restored.
pub fn load_backbone<P: AsRef<Path>>(
    weights_path: P,
    device: &Device,
) -> crate::Result<(HashMap<String, Tensor>, Vgg19Backbone)> {
    let path = weights_path.as_ref();
    if !path.is_file() {
        return Err(PoseError::Startup(format!(
            "backbone checkpoint not found: {:?}",
            path
        )));
    }

    let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
        PoseError::Startup(format!("cannot read backbone checkpoint {:?}: {}", path, e))
    })?;

    let backbone = backbone_from_tensors(&tensors, device).map_err(|e| {
        PoseError::Startup(format!("incompatible backbone checkpoint {:?}: {}", path, e))
    })?;

    log::info!(
        "Restored {} backbone tensors from {:?}",
        tensors.len(),
        path
    );

    Ok((tensors, backbone))
}

/// Build the backbone over an in-memory snapshot
pub fn backbone_from_tensors(
    tensors: &HashMap<String, Tensor>,
    device: &Device,
) -> candle_core::Result<Vgg19Backbone> {
    for (name, shape) in Vgg19Backbone::parameter_shapes() {
        match tensors.get(&name) {
            None => candle_core::bail!("missing tensor {}", name),
            Some(t) if t.dims() != shape.as_slice() => candle_core::bail!(
                "tensor {} has shape {:?}, expected {:?}",
                name,
                t.dims(),
                shape
            ),
            Some(_) => {}
        }
    }
    let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, device);
    Vgg19Backbone::new(vb)
}
