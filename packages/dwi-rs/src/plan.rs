//! The correction pipeline as data: steps connected by typed artifacts.
//!
//! The plan's shape is a pure function of a [`PlanShape`], which in turn
//! is fixed once the run has been resolved. Execution walks the nodes in
//! topological order and releases every temporary artifact right after
//! its last consumer.

use crate::config::QcMode;
use crate::error::{DwiError, Result};
use crate::types::AcquisitionStrategy;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Files exchanged between steps, all inside the scratch directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    /// Imported DWI in acquisition order.
    Dwi,
    /// Imported field-map series on its own grid.
    FieldMapRaw,
    /// Field-map series on the DWI voxel grid.
    FieldMapOnGrid,
    PaddedDwi,
    FieldInput,
    TopupDatain,
    /// topup spline coefficients and movement parameters.
    FieldCoefficients,
    /// Estimated off-resonance field in Hz.
    FieldMap,
    /// Field-corrected field-estimation series.
    FieldCorrected,
    Mask,
    EddyInput,
    EddyConfig,
    EddyIndices,
    EddyGradients,
    SliceSpec,
    EddyOutput,
    /// Eddy output back in acquisition order and original grid.
    Corrected,
    Recombined,
    QcDirectory,
    Output,
}

impl Artifact {
    /// Scratch-relative files making up the artifact.
    pub fn files(&self) -> &'static [&'static str] {
        match self {
            Artifact::Dwi => &["dwi.nii"],
            Artifact::FieldMapRaw => &["se_epi.nii"],
            Artifact::FieldMapOnGrid => &["se_epi_regrid.nii"],
            Artifact::PaddedDwi => &["dwi_pad.nii"],
            Artifact::FieldInput => &["topup_in.nii"],
            Artifact::TopupDatain => &["topup_datain.txt"],
            Artifact::FieldCoefficients => &["field_fieldcoef.nii", "field_movpar.txt"],
            Artifact::FieldMap => &["field_map.nii"],
            Artifact::FieldCorrected => &["field_corrected.nii"],
            Artifact::Mask => &["eddy_mask.nii"],
            Artifact::EddyInput => &["eddy_in.nii"],
            Artifact::EddyConfig => &["eddy_config.txt"],
            Artifact::EddyIndices => &["eddy_indices.txt"],
            Artifact::EddyGradients => &["bvecs", "bvals"],
            Artifact::SliceSpec => &["slspec.txt"],
            Artifact::EddyOutput => &["dwi_post_eddy.nii", "dwi_post_eddy.eddy_rotated_bvecs"],
            Artifact::Corrected => &["corrected.nii"],
            Artifact::Recombined => &["recombined.nii"],
            Artifact::QcDirectory | Artifact::Output => &[],
        }
    }

    /// Artifacts living outside the scratch directory are never released.
    pub fn is_temporary(&self) -> bool {
        !matches!(self, Artifact::QcDirectory | Artifact::Output)
    }
}

/// Fixed scratch prefixes used by the field-estimation and eddy steps.
pub const FIELD_PREFIX: &str = "field";
pub const EDDY_PREFIX: &str = "dwi_post_eddy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    RegridFieldMap,
    PadDwi,
    BuildFieldInput,
    EstimateField,
    ImportPrecomputedField,
    BuildMask,
    PrepareEddy,
    RunEddy,
    RestoreOrder,
    Recombine,
    ExportQc,
    Export,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanNode {
    pub step: Step,
    pub inputs: Vec<Artifact>,
    pub outputs: Vec<Artifact>,
}

/// Everything about a resolved run that changes the graph's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanShape {
    pub strategy: AcquisitionStrategy,
    pub regrid_field_map: bool,
    pub precomputed_field: bool,
    /// Precomputed results include an off-resonance field image.
    pub precomputed_field_map: bool,
    pub slice_to_volume: bool,
    pub recombine: bool,
    pub qc: QcMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelinePlan {
    pub nodes: Vec<PlanNode>,
}

impl PipelinePlan {
    pub fn from_shape(shape: &PlanShape) -> Self {
        use Artifact as A;

        let mut nodes = Vec::new();
        let mut node = |step: Step, inputs: Vec<Artifact>, outputs: Vec<Artifact>| {
            nodes.push(PlanNode {
                step,
                inputs,
                outputs,
            })
        };

        // The DWI and the raw field-map series are imported while the run
        // is resolved; the plan starts from those files.
        let field_map_image = shape.strategy.uses_field_map_image();
        let field_map_series = if field_map_image && shape.regrid_field_map && !shape.precomputed_field {
            node(
                Step::RegridFieldMap,
                vec![A::FieldMapRaw, A::Dwi],
                vec![A::FieldMapOnGrid],
            );
            A::FieldMapOnGrid
        } else {
            A::FieldMapRaw
        };

        node(Step::PadDwi, vec![A::Dwi], vec![A::PaddedDwi]);

        let mut field_available = false;
        let mut field_map_available = false;
        if shape.precomputed_field {
            let mut outputs = vec![A::FieldCoefficients];
            if shape.precomputed_field_map {
                outputs.push(A::FieldMap);
            }
            node(Step::ImportPrecomputedField, vec![], outputs);
            field_available = true;
            field_map_available = shape.precomputed_field_map;
        } else if shape.strategy.estimates_field() {
            let mut inputs = vec![A::Dwi];
            if field_map_image {
                inputs.push(field_map_series);
            }
            node(
                Step::BuildFieldInput,
                inputs,
                vec![A::FieldInput, A::TopupDatain],
            );
            node(
                Step::EstimateField,
                vec![A::FieldInput, A::TopupDatain],
                vec![A::FieldCoefficients, A::FieldMap, A::FieldCorrected],
            );
            field_available = true;
            field_map_available = true;
        }

        node(Step::BuildMask, vec![A::PaddedDwi], vec![A::Mask]);

        let mut prepared = vec![A::EddyInput, A::EddyConfig, A::EddyIndices, A::EddyGradients];
        if shape.slice_to_volume {
            prepared.push(A::SliceSpec);
        }
        node(Step::PrepareEddy, vec![A::PaddedDwi], prepared.clone());

        let mut eddy_inputs = prepared;
        eddy_inputs.push(A::Mask);
        if field_available {
            eddy_inputs.push(A::FieldCoefficients);
        }
        node(Step::RunEddy, eddy_inputs, vec![A::EddyOutput]);
        node(Step::RestoreOrder, vec![A::EddyOutput], vec![A::Corrected]);

        let result = if shape.recombine && field_map_available {
            node(
                Step::Recombine,
                vec![A::Corrected, A::FieldMap],
                vec![A::Recombined],
            );
            A::Recombined
        } else {
            A::Corrected
        };

        if shape.qc != QcMode::None {
            let mut inputs = vec![A::EddyOutput, A::Mask];
            if field_map_available {
                inputs.push(A::FieldMap);
            }
            if field_available && !shape.precomputed_field {
                inputs.push(A::FieldCorrected);
            }
            node(Step::ExportQc, inputs, vec![A::QcDirectory]);
        }
        node(Step::Export, vec![result], vec![A::Output]);

        Self { nodes }
    }

    pub fn contains(&self, step: Step) -> bool {
        self.nodes.iter().any(|n| n.step == step)
    }

    /// Node indices in dependency order; ties keep declaration order.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let producers: BTreeMap<Artifact, usize> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.outputs.iter().map(move |&a| (a, i)))
            .collect();

        let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.nodes.len()];
        let mut pending: Vec<usize> = vec![0; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let deps: BTreeSet<usize> = node
                .inputs
                .iter()
                .filter_map(|a| producers.get(a).copied())
                .collect();
            pending[i] = deps.len();
            for d in deps {
                dependents[d].insert(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &d in &dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.push_back(d);
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(DwiError::config("Pipeline plan contains a dependency cycle"));
        }
        Ok(order)
    }

    /// Temporary artifacts that can be released once the node at
    /// `position` of `order` has finished.
    pub fn release_schedule(&self, order: &[usize]) -> Vec<Vec<Artifact>> {
        let mut last_use: BTreeMap<Artifact, usize> = BTreeMap::new();
        for (pos, &i) in order.iter().enumerate() {
            let node = &self.nodes[i];
            for &a in node.inputs.iter().chain(node.outputs.iter()) {
                last_use.insert(a, pos);
            }
        }
        let mut schedule = vec![Vec::new(); order.len()];
        for (artifact, pos) in last_use {
            if artifact.is_temporary() {
                schedule[pos].push(artifact);
            }
        }
        schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(strategy: AcquisitionStrategy) -> PlanShape {
        PlanShape {
            strategy,
            regrid_field_map: false,
            precomputed_field: false,
            precomputed_field_map: false,
            slice_to_volume: false,
            recombine: false,
            qc: QcMode::None,
        }
    }

    fn steps(plan: &PipelinePlan) -> Vec<Step> {
        plan.topological_order()
            .unwrap()
            .into_iter()
            .map(|i| plan.nodes[i].step)
            .collect()
    }

    #[test]
    fn test_no_field_estimation_plan() {
        let plan = PipelinePlan::from_shape(&shape(AcquisitionStrategy::None));
        assert_eq!(
            steps(&plan),
            vec![
                Step::PadDwi,
                Step::BuildMask,
                Step::PrepareEddy,
                Step::RunEddy,
                Step::RestoreOrder,
                Step::Export
            ]
        );
    }

    #[test]
    fn test_full_plan_orders_dependencies() {
        let mut s = shape(AcquisitionStrategy::SeEpiConcatFirstBzero);
        s.regrid_field_map = true;
        s.recombine = true;
        s.qc = QcMode::All;
        s.slice_to_volume = true;
        let plan = PipelinePlan::from_shape(&s);
        let order = steps(&plan);

        let pos = |step| order.iter().position(|&s| s == step).unwrap();
        assert!(pos(Step::RegridFieldMap) < pos(Step::BuildFieldInput));
        assert!(pos(Step::EstimateField) < pos(Step::RunEddy));
        assert!(pos(Step::BuildMask) < pos(Step::RunEddy));
        assert!(pos(Step::RunEddy) < pos(Step::Recombine));
        assert_eq!(*order.last().unwrap(), Step::Export);

        let eddy = plan.nodes.iter().find(|n| n.step == Step::RunEddy).unwrap();
        assert!(eddy.inputs.contains(&Artifact::SliceSpec));
        assert!(eddy.inputs.contains(&Artifact::FieldCoefficients));
    }

    #[test]
    fn test_recombination_needs_field_map() {
        let mut s = shape(AcquisitionStrategy::Bzeros);
        s.precomputed_field = true;
        s.recombine = true;
        let plan = PipelinePlan::from_shape(&s);
        assert!(!plan.contains(Step::Recombine));
        assert!(!plan.contains(Step::EstimateField));

        s.precomputed_field_map = true;
        assert!(PipelinePlan::from_shape(&s).contains(Step::Recombine));
    }

    #[test]
    fn test_release_after_last_consumer() {
        let mut s = shape(AcquisitionStrategy::Bzeros);
        s.recombine = true;
        let plan = PipelinePlan::from_shape(&s);
        let order = plan.topological_order().unwrap();
        let schedule = plan.release_schedule(&order);

        let released_at = |artifact| {
            schedule
                .iter()
                .position(|batch| batch.contains(&artifact))
                .map(|pos| plan.nodes[order[pos]].step)
        };
        assert_eq!(released_at(Artifact::FieldInput), Some(Step::EstimateField));
        assert_eq!(released_at(Artifact::FieldCorrected), Some(Step::EstimateField));
        assert_eq!(released_at(Artifact::FieldMap), Some(Step::Recombine));
        assert_eq!(released_at(Artifact::EddyOutput), Some(Step::RestoreOrder));
        assert_eq!(released_at(Artifact::Output), None);

        let total: usize = schedule.iter().map(Vec::len).sum();
        let temporaries: BTreeSet<Artifact> = plan
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter().chain(n.outputs.iter()).copied())
            .filter(Artifact::is_temporary)
            .collect();
        assert_eq!(total, temporaries.len());
    }

    #[test]
    fn test_cycle_detected() {
        let plan = PipelinePlan {
            nodes: vec![
                PlanNode {
                    step: Step::PadDwi,
                    inputs: vec![Artifact::Mask],
                    outputs: vec![Artifact::PaddedDwi],
                },
                PlanNode {
                    step: Step::BuildMask,
                    inputs: vec![Artifact::PaddedDwi],
                    outputs: vec![Artifact::Mask],
                },
            ],
        };
        assert!(plan.topological_order().is_err());
    }
}
