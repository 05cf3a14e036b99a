//! Jacobian-weighted recombination of reversed phase-encoding pairs.
//!
//! Each phase-encoding configuration sees the estimated field as a
//! displacement along its own axis. The local stretch of that
//! displacement (its Jacobian) weights how much each volume of a pair
//! contributes to the combined volume: stretched regions keep their
//! signal, compressed regions piled it up and are trusted less
//! (Skare & Bammer, 2010).

use crate::error::{DwiError, Result};
use crate::image::Image;
use crate::phase_encoding::{EddyConfig, PeRow};
use crate::types::{GradientRow, GradientTable, PreprocWarning, VolumePair};
use nalgebra::Vector3;
use rayon::prelude::*;

/// Spatial derivative of a 3-D field along `axis`, in voxel units.
///
/// Central differences in the interior, one-sided differences at the two
/// boundary slices.
pub fn axis_derivative(field: &[f64], dims: [usize; 3], axis: usize) -> Vec<f64> {
    let [nx, ny, _] = dims;
    let stride = match axis {
        0 => 1,
        1 => nx,
        _ => nx * ny,
    };
    let len = dims[axis];
    let mut out = vec![0.0; field.len()];
    if len < 2 {
        return out;
    }

    out.par_chunks_mut(nx * ny)
        .enumerate()
        .for_each(|(z, slab)| {
            for y in 0..ny {
                for x in 0..nx {
                    let c = [x, y, z][axis];
                    let idx = x + nx * (y + ny * z);
                    let d = if c == 0 {
                        field[idx + stride] - field[idx]
                    } else if c == len - 1 {
                        field[idx] - field[idx - stride]
                    } else {
                        0.5 * (field[idx + stride] - field[idx - stride])
                    };
                    slab[x + nx * y] = d;
                }
            }
        });
    out
}

/// Jacobian of the displacement seen by one phase-encoding configuration.
///
/// The field (Hz) is scaled by the total readout time, giving a
/// displacement in voxels, negated for a negative encoding sign.
/// Values are clamped at zero.
pub fn jacobian(field: &Image, row: &PeRow) -> Vec<f64> {
    let scale = if row.sign() < 0 {
        -row.readout_time
    } else {
        row.readout_time
    };
    let scaled: Vec<f64> = field.volume(0).iter().map(|v| v * scale).collect();
    let dims = [field.dims[0], field.dims[1], field.dims[2]];
    axis_derivative(&scaled, dims, row.axis())
        .into_iter()
        .map(|d| (1.0 + d).max(0.0))
        .collect()
}

/// Squared Jacobian per configuration row, computed in parallel.
pub fn compute_weights(field: &Image, config: &[PeRow]) -> Vec<Vec<f64>> {
    config
        .par_iter()
        .map(|row| jacobian(field, row).into_iter().map(|j| j * j).collect())
        .collect()
}

/// Weighted average of two volumes, clamped at zero. Voxels where both
/// weights vanish are set to zero.
pub fn combine_volumes(a: &[f64], wa: &[f64], b: &[f64], wb: &[f64]) -> Vec<f64> {
    a.par_iter()
        .zip(wa.par_iter())
        .zip(b.par_iter().zip(wb.par_iter()))
        .map(|((&va, &ka), (&vb, &kb))| {
            let denom = ka + kb;
            if denom > 0.0 {
                ((va * ka + vb * kb) / denom).max(0.0)
            } else {
                0.0
            }
        })
        .collect()
}

/// Merge the gradient rows of one pair.
///
/// The direction is the normalised mean of the two vectors; if the
/// vectors point in opposite hemispheres (their half-difference is
/// longer than their mean) the half-difference is used instead. Two zero
/// vectors give a zero vector. The b-value is the mean of the pair.
pub fn combine_gradient_rows(a: &GradientRow, b: &GradientRow) -> GradientRow {
    let va = a.vector();
    let vb = b.vector();
    let mean = (va + vb) * 0.5;
    let half_diff = (va - vb) * 0.5;
    let mut direction = if mean.norm_squared() < half_diff.norm_squared() {
        half_diff
    } else {
        mean
    };
    let norm = direction.norm();
    if norm > 0.0 {
        direction /= norm;
    } else {
        direction = Vector3::zeros();
    }
    GradientRow::new(
        direction.x,
        direction.y,
        direction.z,
        0.5 * (a.bvalue + b.bvalue),
    )
}

pub fn combine_gradients(gradients: &GradientTable, pairs: &[VolumePair]) -> GradientTable {
    GradientTable::new(
        pairs
            .iter()
            .map(|p| combine_gradient_rows(&gradients.rows[p.first], &gradients.rows[p.second]))
            .collect(),
    )
}

/// Reduce a degenerate 4-D field estimate to its first volume.
pub fn prepare_field_map(field: Image) -> Result<(Image, Option<PreprocWarning>)> {
    if field.num_volumes() <= 1 {
        return Ok((field, None));
    }
    let volumes = field.num_volumes();
    Ok((
        field.select_volumes(&[0])?,
        Some(PreprocWarning::FieldMapFirstVolumeOnly { volumes }),
    ))
}

#[derive(Debug, Clone)]
pub struct Recombined {
    pub image: Image,
    pub gradients: GradientTable,
}

pub struct VolumeRecombiner;

impl VolumeRecombiner {
    /// Recombine eddy-corrected volumes pair by pair.
    ///
    /// Returns `Ok(None)` when `pairs` does not cover every volume: the
    /// acquisition lacks a complete reversed-pair design and the
    /// corrected series is kept as is.
    pub fn recombine(
        eddy_output: &Image,
        pairs: &[VolumePair],
        field_map: &Image,
        eddy_config: &EddyConfig,
        gradients: &GradientTable,
    ) -> Result<Option<Recombined>> {
        let n = eddy_output.num_volumes();
        if n % 2 != 0 || pairs.len() != n / 2 {
            log::info!(
                "Skipping volume recombination: {} pairs for {} volumes",
                pairs.len(),
                n
            );
            return Ok(None);
        }
        if !eddy_output.same_grid(field_map) {
            return Err(DwiError::metadata(format!(
                "Field map grid {:?} does not match corrected DWI grid {:?}",
                &field_map.dims[..3],
                &eddy_output.dims[..3]
            )));
        }
        if eddy_config.indices.len() != n || gradients.len() != n {
            return Err(DwiError::metadata(format!(
                "Recombination inputs disagree: {} volumes, {} eddy indices, {} gradient rows",
                n,
                eddy_config.indices.len(),
                gradients.len()
            )));
        }

        let weights = compute_weights(field_map, &eddy_config.config);
        log::info!(
            "Computed recombination weights for {} phase-encoding configuration(s)",
            weights.len()
        );

        let volumes: Vec<Vec<f64>> = pairs
            .iter()
            .map(|p| {
                let wa = &weights[eddy_config.group_of(p.first)];
                let wb = &weights[eddy_config.group_of(p.second)];
                combine_volumes(
                    eddy_output.volume(p.first),
                    wa,
                    eddy_output.volume(p.second),
                    wb,
                )
            })
            .collect();

        Ok(Some(Recombined {
            image: Image::from_volumes(eddy_output, volumes)?,
            gradients: combine_gradients(gradients, pairs),
        }))
    }
}
