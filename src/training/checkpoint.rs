/// Model checkpointing with safetensors
///
/// One file per checkpoint, `model-<step>.safetensors`, holding every
/// refinement-stage variable and the training state in the header metadata.
/// Files are never rewritten once created.
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::tensor::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::PoseError;

const PREFIX: &str = "model-";
const EXTENSION: &str = ".safetensors";

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMetadata {
    /// Global step the parameters were saved at
    pub global_step: usize,
    /// Learning rate for the next update
    pub learning_rate: f64,
    /// Last reported loss
    pub loss: Option<f64>,
}

impl CheckpointMetadata {
    fn to_header(&self) -> HashMap<String, String> {
        let mut header = HashMap::new();
        header.insert("global_step".to_string(), self.global_step.to_string());
        header.insert("learning_rate".to_string(), self.learning_rate.to_string());
        if let Some(loss) = self.loss {
            header.insert("loss".to_string(), loss.to_string());
        }
        header
    }

    fn from_header(header: &HashMap<String, String>) -> crate::Result<Self> {
        let field = |key: &str| {
            header
                .get(key)
                .ok_or_else(|| PoseError::Resume(format!("checkpoint metadata lacks '{}'", key)))
        };
        let bad = |key: &str, value: &str| {
            PoseError::Resume(format!("checkpoint metadata '{}' is invalid: {}", key, value))
        };

        let step = field("global_step")?;
        let lr = field("learning_rate")?;
        Ok(Self {
            global_step: step.parse().map_err(|_| bad("global_step", step))?,
            learning_rate: lr.parse().map_err(|_| bad("learning_rate", lr))?,
            loss: match header.get("loss") {
                Some(v) => Some(v.parse().map_err(|_| bad("loss", v))?),
                None => None,
            },
        })
    }
}

/// Checkpoint files of one run directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a given step
    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{}{}{}", PREFIX, step, EXTENSION))
    }

    /// Save parameters + metadata; fails rather than overwrite
    ///
    /// The file is first written under a temporary name and then renamed, so
    /// a crash never leaves a truncated `model-<step>` file behind.
    pub fn save(
        &self,
        params: &HashMap<String, Tensor>,
        metadata: &CheckpointMetadata,
    ) -> crate::Result<PathBuf> {
        let path = self.path_for(metadata.global_step);
        if path.exists() {
            return Err(PoseError::CheckpointWrite(format!(
                "refusing to overwrite {:?}",
                path
            )));
        }

        let tmp = self
            .dir
            .join(format!(".{}{}{}.tmp", PREFIX, metadata.global_step, EXTENSION));
        let write_err = |e: &dyn std::fmt::Display| {
            PoseError::CheckpointWrite(format!("cannot write {:?}: {}", path, e))
        };

        safetensors::tensor::serialize_to_file(params.iter(), &Some(metadata.to_header()), &tmp)
            .map_err(|e| write_err(&e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            std::fs::remove_file(&tmp).ok();
            return Err(write_err(&e));
        }

        log::info!("Saved checkpoint {:?} ({} tensors)", path, params.len());
        Ok(path)
    }

    /// All checkpoint files, ascending by step
    pub fn list(&self) -> crate::Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(PREFIX))
                .and_then(|n| n.strip_suffix(EXTENSION))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(step) = step {
                found.push((step, path));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    /// Checkpoint with the highest step, if any
    pub fn latest(&self) -> crate::Result<Option<(usize, PathBuf)>> {
        Ok(self.list()?.pop())
    }

    /// Read a checkpoint file
    pub fn load<P: AsRef<Path>>(
        path: P,
        device: &Device,
    ) -> crate::Result<(HashMap<String, Tensor>, CheckpointMetadata)> {
        let path = path.as_ref();
        let corrupt = |e: &dyn std::fmt::Display| {
            PoseError::Resume(format!("cannot read checkpoint {:?}: {}", path, e))
        };

        let bytes = std::fs::read(path).map_err(|e| corrupt(&e))?;
        let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|e| corrupt(&e))?;
        let metadata = match header.metadata() {
            Some(map) => CheckpointMetadata::from_header(map)?,
            None => return Err(corrupt(&"no metadata header")),
        };
        let tensors = candle_core::safetensors::load_buffer(&bytes, device).map_err(|e| corrupt(&e))?;

        Ok((tensors, metadata))
    }

    /// Load a checkpoint into existing variables
    ///
    /// Every variable must be present with the same shape and the file may
    /// not carry unknown names; nothing is assigned unless all of them match.
    pub fn restore<P: AsRef<Path>>(
        path: P,
        varmap: &VarMap,
        device: &Device,
    ) -> crate::Result<CheckpointMetadata> {
        let path = path.as_ref();
        let (tensors, metadata) = Self::load(path, device)?;

        let vars = varmap
            .data()
            .lock()
            .map_err(|e| PoseError::Resume(format!("parameter store poisoned: {}", e)))?;

        for (name, var) in vars.iter() {
            match tensors.get(name) {
                None => {
                    return Err(PoseError::Resume(format!(
                        "checkpoint {:?} lacks variable {}",
                        path, name
                    )))
                }
                Some(t) if t.dims() != var.as_tensor().dims() => {
                    return Err(PoseError::Resume(format!(
                        "variable {} has shape {:?} in {:?}, expected {:?}",
                        name,
                        t.dims(),
                        path,
                        var.as_tensor().dims()
                    )))
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = tensors.keys().find(|k| !vars.contains_key(*k)) {
            return Err(PoseError::Resume(format!(
                "checkpoint {:?} has unknown variable {}",
                path, extra
            )));
        }

        for (name, var) in vars.iter() {
            if let Some(t) = tensors.get(name) {
                var.set(&t.to_dtype(var.as_tensor().dtype())?)?;
            }
        }

        log::info!(
            "Restored {} variables from {:?} at step {}",
            vars.len(),
            path,
            metadata.global_step
        );
        Ok(metadata)
    }
}
