/// Typed split between frozen and trainable parameters
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;

/// The two disjoint parameter collections of the network
///
/// Backbone tensors are plain (non-`Var`) tensors restored once from the
/// pretrained snapshot; only the refinement `VarMap` is handed to the
/// optimizer.
pub struct ParameterPartition {
    backbone: HashMap<String, Tensor>,
    refinement: VarMap,
}

impl ParameterPartition {
    pub fn new(backbone: HashMap<String, Tensor>) -> Self {
        Self {
            backbone,
            refinement: VarMap::new(),
        }
    }

    /// Frozen backbone tensors, by name
    pub fn backbone(&self) -> &HashMap<String, Tensor> {
        &self.backbone
    }

    /// Trainable refinement-stage store
    pub fn refinement(&self) -> &VarMap {
        &self.refinement
    }

    /// Builder that creates (or reuses) refinement variables
    pub fn refinement_builder(&self, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.refinement, DType::F32, device)
    }

    /// Variables handed to the optimizer
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.refinement.all_vars()
    }

    /// Snapshot of the refinement variables, by name
    pub fn refinement_tensors(&self) -> crate::Result<HashMap<String, Tensor>> {
        let data = self
            .refinement
            .data()
            .lock()
            .map_err(|e| crate::PoseError::Pipeline(format!("parameter store poisoned: {}", e)))?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    /// Number of scalar values in each partition: (backbone, refinement)
    pub fn counts(&self) -> (usize, usize) {
        let backbone = self.backbone.values().map(|t| t.elem_count()).sum();
        let refinement = self
            .trainable_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum();
        (backbone, refinement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpmStages, RefinementNet};

    #[test]
    fn test_partitions_are_disjoint() -> crate::Result<()> {
        let device = Device::Cpu;
        let mut backbone = HashMap::new();
        backbone.insert(
            "conv1_1.weight".to_string(),
            Tensor::zeros((64, 3, 3, 3), DType::F32, &device)?,
        );
        let params = ParameterPartition::new(backbone);

        let net = CpmStages::new(8, 1, 3, 4, params.refinement_builder(&device))?;
        assert_eq!(net.stage_num(), 1);

        let trainable = params.refinement_tensors()?;
        assert!(!trainable.contains_key("conv1_1.weight"));
        assert!(trainable.contains_key("added.conv4_3_cpm.weight"));
        assert!(trainable.contains_key("stage1.heatmap.conv5.bias"));

        let (frozen, train) = params.counts();
        assert_eq!(frozen, 64 * 27);
        assert!(train > 0);

        Ok(())
    }
}
