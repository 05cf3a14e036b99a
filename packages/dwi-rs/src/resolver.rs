//! Reconciles phase-encoding information from the DWI header, the
//! field-map header and manual overrides into one scheme per image.

use crate::error::{DwiError, Result};
use crate::metadata::ImageMetadata;
use crate::phase_encoding::{PeRow, PeScheme, DEFAULT_READOUT_TIME, READOUT_TIME_TOLERANCE};
use crate::types::{AcquisitionDesign, PreprocWarning, Warnings};
use serde::Serialize;

/// How a field-map series without its own contrast was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContrastRescue {
    /// Concatenated with the first DWI b=0 volume.
    FirstBzero,
    /// Concatenated with every DWI b=0 volume.
    AllBzeros,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPhaseEncoding {
    pub dwi_scheme: PeScheme,
    pub field_map_scheme: Option<PeScheme>,
    /// Whether the field-map series has contrast on its own.
    pub field_map_contrast: bool,
    pub rescue: Option<ContrastRescue>,
    /// True when the DWI scheme came from manual input.
    pub manual: bool,
    pub warnings: Vec<PreprocWarning>,
}

/// Manual phase-encoding overrides from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualPhaseEncoding {
    pub direction: Option<[i8; 3]>,
    pub readout_time: Option<f64>,
}

pub struct PhaseEncodingResolver {
    design: AcquisitionDesign,
    align_seepi: bool,
    bzero_threshold: f64,
}

impl PhaseEncodingResolver {
    pub fn new(design: AcquisitionDesign, align_seepi: bool, bzero_threshold: f64) -> Self {
        Self {
            design,
            align_seepi,
            bzero_threshold,
        }
    }

    pub fn resolve(
        &self,
        dwi: &ImageMetadata,
        field_map: Option<&ImageMetadata>,
        manual: ManualPhaseEncoding,
    ) -> Result<ResolvedPhaseEncoding> {
        self.check_design_inputs(field_map, &manual)?;

        let mut warnings = Warnings::new();
        let num_volumes = dwi.num_volumes();
        let header_dwi = dwi.pe_scheme()?;
        let header_fmap = match field_map {
            Some(f) => f.pe_scheme()?,
            None => None,
        };

        let (dwi_scheme, fmap_scheme, is_manual) = match manual.direction {
            Some(direction) => {
                let readout_time = match manual.readout_time {
                    Some(t) => t,
                    None => match dwi.readout_time()? {
                        Some(t) => t,
                        None => {
                            warnings.push(PreprocWarning::DefaultReadoutTime {
                                seconds: DEFAULT_READOUT_TIME,
                            });
                            DEFAULT_READOUT_TIME
                        }
                    },
                };
                if readout_time <= 0.0 {
                    return Err(DwiError::config(format!(
                        "Total readout time must be positive (got {})",
                        readout_time
                    )));
                }
                let row = PeRow::new(direction, readout_time);

                let manual_dwi = match self.design {
                    AcquisitionDesign::All => PeScheme::reversed_halves(row, num_volumes)
                        .map_err(|_| {
                            DwiError::config(format!(
                                "Design 'all' requires an even number of DWI volumes (found {})",
                                num_volumes
                            ))
                        })?,
                    _ => PeScheme::uniform(row, num_volumes),
                };
                if let Some(header) = &header_dwi {
                    compare_schemes(header, &manual_dwi, &mut warnings);
                }

                let manual_fmap = match (self.design, field_map) {
                    (AcquisitionDesign::Pair, Some(fmap)) => {
                        let scheme = PeScheme::reversed_halves(row, fmap.num_volumes())
                            .map_err(|_| {
                                DwiError::config(format!(
                                    "Design 'pair' requires an even number of field-map volumes (found {})",
                                    fmap.num_volumes()
                                ))
                            })?;
                        if let Some(header) = &header_fmap {
                            compare_schemes(header, &scheme, &mut warnings);
                        }
                        Some(scheme)
                    }
                    _ => header_fmap,
                };
                (Some(manual_dwi), manual_fmap, true)
            }
            None => (header_dwi, header_fmap, false),
        };

        let mut defaulted = !is_manual && dwi.readout_time_defaulted()?;
        if let Some(fmap) = field_map {
            let fmap_from_header = !(is_manual && self.design == AcquisitionDesign::Pair);
            defaulted |= fmap_from_header && fmap.readout_time_defaulted()?;
        }
        let already_warned = warnings
            .items()
            .iter()
            .any(|w| matches!(w, PreprocWarning::DefaultReadoutTime { .. }));
        if defaulted && !already_warned {
            warnings.push(PreprocWarning::DefaultReadoutTime {
                seconds: DEFAULT_READOUT_TIME,
            });
        }

        let dwi_scheme = match dwi_scheme {
            Some(s) => s,
            None if self.design == AcquisitionDesign::None => {
                warnings.push(PreprocWarning::DefaultPhaseEncoding);
                PeScheme::uniform(PeRow::new([0, 1, 0], DEFAULT_READOUT_TIME), num_volumes)
            }
            None => {
                return Err(DwiError::MissingPhaseEncoding(format!(
                    "DWI {} has no phase-encoding information in its header and none was provided manually",
                    dwi.path.display()
                )))
            }
        };

        if self.design == AcquisitionDesign::All && !dwi_scheme.has_contrast() {
            return Err(DwiError::MissingPhaseEncoding(
                "Design 'all' requires reversed phase encoding within the DWI series".to_string(),
            ));
        }

        let mut field_map_contrast = false;
        let mut rescue = None;
        if let Some(fmap) = field_map {
            let scheme = fmap_scheme.as_ref().ok_or_else(|| {
                DwiError::MissingPhaseEncoding(format!(
                    "Field-map image {} has no phase-encoding information",
                    fmap.path.display()
                ))
            })?;
            field_map_contrast = scheme.has_contrast();
            if !field_map_contrast {
                rescue = Some(self.rescue_contrast(dwi, &dwi_scheme, scheme)?);
            }
        }

        Ok(ResolvedPhaseEncoding {
            dwi_scheme,
            field_map_scheme: fmap_scheme,
            field_map_contrast,
            rescue,
            manual: is_manual,
            warnings: warnings.into_vec(),
        })
    }

    fn check_design_inputs(
        &self,
        field_map: Option<&ImageMetadata>,
        manual: &ManualPhaseEncoding,
    ) -> Result<()> {
        match self.design {
            AcquisitionDesign::None | AcquisitionDesign::All if field_map.is_some() => {
                Err(DwiError::config(format!(
                    "A field-map image cannot be used with design '{}'",
                    self.design
                )))
            }
            AcquisitionDesign::Pair if field_map.is_none() => Err(DwiError::config(
                "Design 'pair' requires a field-map (spin-echo EPI) image",
            )),
            AcquisitionDesign::Header if manual.direction.is_some() => Err(DwiError::config(
                "Design 'header' reads phase encoding from image headers; do not provide a manual direction",
            )),
            _ => Ok(()),
        }
    }

    /// Try to obtain contrast by appending DWI b=0 rows to the field-map
    /// scheme. Only the header design (all b=0 volumes) and the pair
    /// design with alignment requested (first b=0 volume) may do this.
    fn rescue_contrast(
        &self,
        dwi: &ImageMetadata,
        dwi_scheme: &PeScheme,
        fmap_scheme: &PeScheme,
    ) -> Result<ContrastRescue> {
        let bzeros = dwi.gradient_table()?.bzero_indices(self.bzero_threshold);
        let (kind, rows) = match self.design {
            AcquisitionDesign::Header => (ContrastRescue::AllBzeros, bzeros),
            AcquisitionDesign::Pair if self.align_seepi => {
                (ContrastRescue::FirstBzero, bzeros.into_iter().take(1).collect())
            }
            _ => {
                return Err(DwiError::MissingPhaseEncoding(
                    "Field-map image has no phase-encoding contrast; field estimation is impossible"
                        .to_string(),
                ))
            }
        };
        if rows.is_empty() {
            return Err(DwiError::MissingPhaseEncoding(
                "Field-map image has no phase-encoding contrast and the DWI has no b=0 volumes"
                    .to_string(),
            ));
        }
        log::info!(
            "Field-map series lacks phase-encoding contrast; re-examining with {} DWI b=0 volume(s)",
            rows.len()
        );
        if !fmap_scheme.concat(&dwi_scheme.select(&rows)).has_contrast() {
            return Err(DwiError::MissingPhaseEncoding(
                "No phase-encoding contrast even after combining field-map and DWI b=0 volumes"
                    .to_string(),
            ));
        }
        Ok(kind)
    }
}

/// Row-wise comparison of a header scheme against a manual one; the
/// first direction mismatch and first readout mismatch are reported.
fn compare_schemes(header: &PeScheme, manual: &PeScheme, warnings: &mut Warnings) {
    let mut direction_reported = false;
    let mut readout_reported = false;
    for (volume, (h, m)) in header.rows.iter().zip(manual.rows.iter()).enumerate() {
        if !direction_reported && h.direction != m.direction {
            warnings.push(PreprocWarning::PeDirectionMismatch {
                volume,
                header: h.direction,
                manual: m.direction,
            });
            direction_reported = true;
        }
        if !readout_reported && (h.readout_time - m.readout_time).abs() > READOUT_TIME_TOLERANCE {
            warnings.push(PreprocWarning::ReadoutTimeMismatch {
                volume,
                header: h.readout_time,
                manual: m.readout_time,
            });
            readout_reported = true;
        }
    }
}
