//! Assembly of the image series handed to field estimation, and the
//! even-dimension padding that field estimation requires.

use crate::error::{DwiError, Result};
use crate::image::Image;
use crate::phase_encoding::PeScheme;
use crate::types::{AcquisitionStrategy, GradientTable};
use serde::Serialize;

/// Odd spatial axes padded by one duplicated slice, and how to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpatialPadding {
    pub axes: Vec<usize>,
    pub original_dims: [usize; 3],
}

impl SpatialPadding {
    pub fn for_dims(dims: [usize; 4]) -> Self {
        Self {
            axes: (0..3).filter(|&a| dims[a] % 2 == 1).collect(),
            original_dims: [dims[0], dims[1], dims[2]],
        }
    }

    pub fn none(dims: [usize; 4]) -> Self {
        Self {
            axes: Vec::new(),
            original_dims: [dims[0], dims[1], dims[2]],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn padded_dims(&self) -> [usize; 3] {
        let mut dims = self.original_dims;
        for &axis in &self.axes {
            dims[axis] += 1;
        }
        dims
    }

    pub fn pad(&self, image: &Image) -> Result<Image> {
        self.check_grid(image, false)?;
        Ok(self
            .axes
            .iter()
            .fold(image.clone(), |img, &axis| img.pad_axis(axis)))
    }

    pub fn crop(&self, image: &Image) -> Result<Image> {
        self.check_grid(image, true)?;
        Ok(self.axes.iter().fold(image.clone(), |img, &axis| {
            img.crop_axis(axis, self.original_dims[axis])
        }))
    }

    fn check_grid(&self, image: &Image, padded: bool) -> Result<()> {
        for axis in 0..3 {
            let extra = usize::from(padded && self.axes.contains(&axis));
            if image.dims[axis] != self.original_dims[axis] + extra {
                return Err(DwiError::metadata(format!(
                    "Image dimension {} along axis {} does not match expected {}",
                    image.dims[axis],
                    axis,
                    self.original_dims[axis] + extra
                )));
            }
        }
        Ok(())
    }

    /// Slice timing for the padded grid: the duplicated slice along the
    /// slice-encoding axis gets a synthetic time of zero.
    pub fn pad_slice_timing(&self, timing: &[f64], slice_axis: usize) -> Vec<f64> {
        let mut padded = timing.to_vec();
        if self.axes.contains(&slice_axis) {
            padded.push(0.0);
        }
        padded
    }
}

/// Field-map series ready for field estimation.
#[derive(Debug, Clone)]
pub struct FieldEstimationInput {
    pub image: Image,
    pub scheme: PeScheme,
    /// Field-map volume replaced by the DWI b=0 volume, if any.
    pub replaced_volume: Option<usize>,
}

pub struct FieldEstimationInputBuilder {
    strategy: AcquisitionStrategy,
    bzero_threshold: f64,
}

impl FieldEstimationInputBuilder {
    pub fn new(strategy: AcquisitionStrategy, bzero_threshold: f64) -> Self {
        Self {
            strategy,
            bzero_threshold,
        }
    }

    /// Build the (unpadded) field-estimation series.
    ///
    /// `field_map` must already lie on the DWI voxel grid; callers regrid
    /// beforehand when [`crate::metadata::requires_regrid`] says so.
    pub fn build(
        &self,
        dwi: &Image,
        dwi_scheme: &PeScheme,
        gradients: &GradientTable,
        field_map: Option<(&Image, &PeScheme)>,
        first_bzero: usize,
    ) -> Result<FieldEstimationInput> {
        if let Some((fmap, scheme)) = field_map {
            if !fmap.same_grid(dwi) {
                return Err(DwiError::metadata(
                    "Field-map image must be regridded onto the DWI voxel grid before assembly",
                ));
            }
            if scheme.len() != fmap.num_volumes() {
                return Err(DwiError::metadata(format!(
                    "Field-map phase-encoding scheme has {} rows for {} volumes",
                    scheme.len(),
                    fmap.num_volumes()
                )));
            }
        }
        let require_fmap = || {
            field_map.ok_or_else(|| {
                DwiError::config(format!(
                    "Strategy '{}' requires a field-map image",
                    self.strategy
                ))
            })
        };

        let input = match self.strategy {
            AcquisitionStrategy::None => {
                return Err(DwiError::config(
                    "No field-estimation input exists for strategy 'none'",
                ))
            }
            AcquisitionStrategy::SeEpiStandalone => {
                let (fmap, scheme) = require_fmap()?;
                FieldEstimationInput {
                    image: fmap.clone(),
                    scheme: scheme.clone(),
                    replaced_volume: None,
                }
            }
            AcquisitionStrategy::SeEpiConcatFirstBzero => {
                let (fmap, scheme) = require_fmap()?;
                self.concat_first_bzero(dwi, dwi_scheme, fmap, scheme, first_bzero)?
            }
            AcquisitionStrategy::SeEpiConcatAllBzeros => {
                let (fmap, scheme) = require_fmap()?;
                let (b0s, b0_scheme) = self.extract_bzeros(dwi, dwi_scheme, gradients)?;
                FieldEstimationInput {
                    image: b0s.concat(fmap)?,
                    scheme: b0_scheme.concat(scheme),
                    replaced_volume: None,
                }
            }
            AcquisitionStrategy::Bzeros => {
                let (b0s, b0_scheme) = self.extract_bzeros(dwi, dwi_scheme, gradients)?;
                FieldEstimationInput {
                    image: b0s,
                    scheme: b0_scheme,
                    replaced_volume: None,
                }
            }
        };

        if !input.scheme.has_contrast() {
            return Err(DwiError::MissingPhaseEncoding(format!(
                "Field-estimation input for strategy '{}' has no phase-encoding contrast",
                self.strategy
            )));
        }
        log::info!(
            "Field-estimation input: {} volumes ({})",
            input.image.num_volumes(),
            self.strategy
        );
        Ok(input)
    }

    /// Lead with the first DWI b=0. A balanced field-map series gives up
    /// its first volume with the same encoding direction so that the
    /// series stays balanced; otherwise nothing is removed.
    fn concat_first_bzero(
        &self,
        dwi: &Image,
        dwi_scheme: &PeScheme,
        fmap: &Image,
        fmap_scheme: &PeScheme,
        first_bzero: usize,
    ) -> Result<FieldEstimationInput> {
        let b0 = dwi.select_volumes(&[first_bzero])?;
        let b0_row = dwi_scheme.rows[first_bzero];

        let replaced = if fmap_scheme.is_balanced() {
            fmap_scheme
                .rows
                .iter()
                .position(|r| r.direction == b0_row.direction)
        } else {
            None
        };

        let keep: Vec<usize> = (0..fmap.num_volumes())
            .filter(|&v| Some(v) != replaced)
            .collect();
        let image = b0.concat(&fmap.select_volumes(&keep)?)?;
        let scheme = PeScheme::new(vec![b0_row]).concat(&fmap_scheme.select(&keep));

        if let Some(v) = replaced {
            log::info!(
                "Replacing field-map volume {} with the first DWI b=0 volume ({})",
                v,
                first_bzero
            );
        }
        Ok(FieldEstimationInput {
            image,
            scheme,
            replaced_volume: replaced,
        })
    }

    fn extract_bzeros(
        &self,
        dwi: &Image,
        dwi_scheme: &PeScheme,
        gradients: &GradientTable,
    ) -> Result<(Image, PeScheme)> {
        let indices = gradients.bzero_indices(self.bzero_threshold);
        if indices.is_empty() {
            return Err(DwiError::metadata("DWI series contains no b=0 volumes"));
        }
        Ok((dwi.select_volumes(&indices)?, dwi_scheme.select(&indices)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase_encoding::PeRow;
    use crate::types::GradientRow;

    const AP: [i8; 3] = [0, -1, 0];
    const PA: [i8; 3] = [0, 1, 0];

    fn series(nt: usize, base: f64) -> Image {
        Image::from_fn([4, 4, 3, nt], [2.0; 3], |_, _, _, t| base + t as f64)
    }

    fn scheme(dirs: &[[i8; 3]]) -> PeScheme {
        PeScheme::new(dirs.iter().map(|&d| PeRow::new(d, 0.05)).collect())
    }

    fn grads(bvals: &[f64]) -> GradientTable {
        GradientTable::new(bvals.iter().map(|&b| GradientRow::new(0.0, 0.0, 1.0, b)).collect())
    }

    #[test]
    fn test_padding_plan_and_slice_timing() {
        let pad = SpatialPadding::for_dims([4, 5, 3, 10]);
        assert_eq!(pad.axes, vec![1, 2]);
        assert_eq!(pad.padded_dims(), [4, 6, 4]);
        assert_eq!(pad.pad_slice_timing(&[0.0, 0.5, 0.25], 2), vec![0.0, 0.5, 0.25, 0.0]);
        assert_eq!(pad.pad_slice_timing(&[0.0, 0.5, 0.25], 0), vec![0.0, 0.5, 0.25]);

        let img = Image::from_fn([4, 5, 3, 2], [1.0; 3], |x, y, z, t| (x + y + z + t) as f64);
        let padded = pad.pad(&img).unwrap();
        assert_eq!(padded.dims, [4, 6, 4, 2]);
        assert_eq!(pad.crop(&padded).unwrap(), img);
        assert!(pad.crop(&img).is_err());
    }

    #[test]
    fn test_standalone_passes_field_map_through() {
        let dwi = series(3, 0.0);
        let fmap = series(2, 100.0);
        let builder = FieldEstimationInputBuilder::new(AcquisitionStrategy::SeEpiStandalone, 10.0);
        let input = builder
            .build(
                &dwi,
                &scheme(&[AP, AP, AP]),
                &grads(&[0.0, 1000.0, 1000.0]),
                Some((&fmap, &scheme(&[AP, PA]))),
                0,
            )
            .unwrap();
        assert_eq!(input.image, fmap);
    }

    #[test]
    fn test_first_bzero_replaces_matching_volume_in_balanced_series() {
        let dwi = series(3, 0.0);
        let fmap = series(2, 100.0);
        let builder =
            FieldEstimationInputBuilder::new(AcquisitionStrategy::SeEpiConcatFirstBzero, 10.0);
        let input = builder
            .build(
                &dwi,
                &scheme(&[PA, PA, PA]),
                &grads(&[1000.0, 0.0, 1000.0]),
                Some((&fmap, &scheme(&[AP, PA]))),
                1,
            )
            .unwrap();
        assert_eq!(input.replaced_volume, Some(1));
        assert_eq!(input.image.num_volumes(), 2);
        assert_eq!(input.image.get(0, 0, 0, 0), 1.0);
        assert_eq!(input.image.get(0, 0, 0, 1), 100.0);
        assert!(input.scheme.is_balanced());
    }

    #[test]
    fn test_first_bzero_prepends_to_unbalanced_series() {
        let dwi = series(2, 0.0);
        let fmap = series(3, 100.0);
        let builder =
            FieldEstimationInputBuilder::new(AcquisitionStrategy::SeEpiConcatFirstBzero, 10.0);
        let input = builder
            .build(
                &dwi,
                &scheme(&[AP, AP]),
                &grads(&[0.0, 1000.0]),
                Some((&fmap, &scheme(&[PA, PA, AP]))),
                0,
            )
            .unwrap();
        assert_eq!(input.replaced_volume, None);
        assert_eq!(input.image.num_volumes(), 4);
        assert_eq!(input.scheme.rows[0].direction, AP);
    }

    #[test]
    fn test_all_bzeros_leads_with_dwi_bzeros() {
        let dwi = series(4, 0.0);
        let fmap = series(1, 100.0);
        let builder =
            FieldEstimationInputBuilder::new(AcquisitionStrategy::SeEpiConcatAllBzeros, 10.0);
        let input = builder
            .build(
                &dwi,
                &scheme(&[PA, PA, PA, PA]),
                &grads(&[0.0, 1000.0, 5.0, 1000.0]),
                Some((&fmap, &scheme(&[AP]))),
                0,
            )
            .unwrap();
        assert_eq!(input.image.num_volumes(), 3);
        assert_eq!(input.image.get(0, 0, 0, 1), 2.0);
        assert_eq!(input.image.get(0, 0, 0, 2), 100.0);
    }

    #[test]
    fn test_bzeros_requires_contrast() {
        let dwi = series(4, 0.0);
        let builder = FieldEstimationInputBuilder::new(AcquisitionStrategy::Bzeros, 10.0);
        let ok = builder.build(
            &dwi,
            &scheme(&[AP, AP, PA, PA]),
            &grads(&[0.0, 1000.0, 0.0, 1000.0]),
            None,
            0,
        );
        assert_eq!(ok.unwrap().image.num_volumes(), 2);

        let err = builder
            .build(
                &dwi,
                &scheme(&[AP, AP, AP, AP]),
                &grads(&[0.0, 1000.0, 0.0, 1000.0]),
                None,
                0,
            )
            .unwrap_err();
        assert!(matches!(err, DwiError::MissingPhaseEncoding(_)));
    }

    #[test]
    fn test_grid_mismatch_rejected() {
        let dwi = series(2, 0.0);
        let fmap = Image::zeros([4, 4, 4, 2], [2.0; 3]);
        let builder = FieldEstimationInputBuilder::new(AcquisitionStrategy::SeEpiStandalone, 10.0);
        assert!(builder
            .build(
                &dwi,
                &scheme(&[AP, AP]),
                &grads(&[0.0, 0.0]),
                Some((&fmap, &scheme(&[AP, PA]))),
                0
            )
            .is_err());
    }
}
