//! Classification of the acquisition into a field-estimation strategy.

use crate::error::{DwiError, Result};
use crate::types::{AcquisitionDesign, AcquisitionStrategy};

/// Inputs to strategy selection, all known before any subprocess runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyInputs {
    pub design: AcquisitionDesign,
    pub has_field_map: bool,
    /// Phase-encoding contrast within the field-map series itself.
    pub field_map_contrast: bool,
    /// Align the field estimate with the first DWI b=0 volume.
    pub align_seepi: bool,
}

/// Decision table over design, field-map presence and contrast.
///
/// There is no fallback between rows: a combination not listed is an
/// error rather than a guess.
pub fn select(inputs: StrategyInputs) -> Result<AcquisitionStrategy> {
    use AcquisitionDesign as D;
    use AcquisitionStrategy as S;

    let StrategyInputs {
        design,
        has_field_map,
        field_map_contrast,
        align_seepi,
    } = inputs;

    let strategy = match (design, has_field_map, field_map_contrast) {
        (D::None, false, _) => S::None,
        (D::Pair, true, true) if align_seepi => S::SeEpiConcatFirstBzero,
        (D::Pair, true, true) => S::SeEpiStandalone,
        // Contrast obtained only once the first DWI b=0 joins the series.
        (D::Pair, true, false) if align_seepi => S::SeEpiConcatFirstBzero,
        (D::All, false, _) => S::Bzeros,
        (D::Header, true, false) => S::SeEpiConcatAllBzeros,
        (D::Header, true, true) => S::SeEpiStandalone,
        _ => {
            return Err(DwiError::UnsupportedAcquisitionDesign {
                design: design.to_string(),
                has_field_map,
                has_contrast: field_map_contrast,
            })
        }
    };

    log::info!(
        "Acquisition design '{}' (field map: {}, contrast: {}) -> strategy '{}'",
        design,
        has_field_map,
        field_map_contrast,
        strategy
    );
    Ok(strategy)
}

/// Whether `align_seepi` has any influence under this design.
pub fn alignment_applies(design: AcquisitionDesign) -> bool {
    design == AcquisitionDesign::Pair
}

#[cfg(test)]
mod tests {
    use super::*;
    use AcquisitionDesign as D;
    use AcquisitionStrategy as S;

    fn inputs(design: D, fmap: bool, contrast: bool, align: bool) -> StrategyInputs {
        StrategyInputs {
            design,
            has_field_map: fmap,
            field_map_contrast: contrast,
            align_seepi: align,
        }
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(select(inputs(D::None, false, false, false)).unwrap(), S::None);
        assert_eq!(
            select(inputs(D::Pair, true, true, false)).unwrap(),
            S::SeEpiStandalone
        );
        assert_eq!(
            select(inputs(D::Pair, true, true, true)).unwrap(),
            S::SeEpiConcatFirstBzero
        );
        assert_eq!(select(inputs(D::All, false, false, false)).unwrap(), S::Bzeros);
        assert_eq!(
            select(inputs(D::Header, true, false, false)).unwrap(),
            S::SeEpiConcatAllBzeros
        );
        assert_eq!(
            select(inputs(D::Header, true, true, false)).unwrap(),
            S::SeEpiStandalone
        );
    }

    #[test]
    fn test_pair_without_contrast_requires_alignment() {
        assert!(matches!(
            select(inputs(D::Pair, true, false, false)).unwrap_err(),
            DwiError::UnsupportedAcquisitionDesign { .. }
        ));
        assert_eq!(
            select(inputs(D::Pair, true, false, true)).unwrap(),
            S::SeEpiConcatFirstBzero
        );
    }

    #[test]
    fn test_unmatched_combinations_are_fatal() {
        for i in [
            inputs(D::None, true, true, false),
            inputs(D::Pair, false, false, false),
            inputs(D::All, true, true, false),
            inputs(D::Header, false, true, false),
            inputs(D::Header, false, false, false),
        ] {
            assert!(select(i).is_err(), "{:?} should be rejected", i);
        }
    }
}
