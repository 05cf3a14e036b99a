//! Pairing of gradient-matched, phase-encoding-reversed DWI volumes.

use crate::error::{DwiError, Result};
use crate::gradient::ShellAssignment;
use crate::phase_encoding::PeScheme;
use crate::types::{GradientTable, VolumePair};

/// Minimum |cos| between two gradient directions to count as matched.
pub const DIRECTION_MATCH_THRESHOLD: f64 = 0.999;

/// Greedy pairing of volume `i` in the first half with the first
/// acceptable unmatched `j` in the second half, both in ascending order.
///
/// A pair is acceptable when both volumes lie in the same shell, their
/// gradient directions agree up to sign (any direction on a b=0 shell),
/// and their phase-encoding directions cancel exactly. The result is a
/// perfect matching or an error.
pub fn match_pairs(
    gradients: &GradientTable,
    shells: &ShellAssignment,
    pe_scheme: &PeScheme,
) -> Result<Vec<VolumePair>> {
    let n = gradients.len();
    if shells.volume_shell.len() != n || pe_scheme.len() != n {
        return Err(DwiError::metadata(format!(
            "Cannot pair volumes: {} gradient rows, {} shell assignments, {} phase-encoding rows",
            n,
            shells.volume_shell.len(),
            pe_scheme.len()
        )));
    }
    if n % 2 != 0 {
        return Err(DwiError::OddVolumeCount(n));
    }

    let half = n / 2;
    let mut matched = vec![false; n];
    let mut pairs = Vec::with_capacity(half);

    for i in 0..half {
        if matched[i] {
            continue;
        }
        for j in half..n {
            if matched[j] {
                continue;
            }
            if volumes_match(gradients, shells, pe_scheme, i, j) {
                matched[i] = true;
                matched[j] = true;
                pairs.push(VolumePair::new(i, j));
                break;
            }
        }
    }

    let unmatched = matched.iter().filter(|&&m| !m).count();
    if unmatched > 0 {
        return Err(DwiError::IncompletePairing {
            unmatched,
            total: n,
        });
    }

    log::debug!("Matched {} reversed phase-encoding volume pairs", pairs.len());
    Ok(pairs)
}

fn volumes_match(
    gradients: &GradientTable,
    shells: &ShellAssignment,
    pe_scheme: &PeScheme,
    i: usize,
    j: usize,
) -> bool {
    let shell = shells.shell_of(i);
    if shell != shells.shell_of(j) {
        return false;
    }

    let pe_i = pe_scheme.rows[i].direction;
    let pe_j = pe_scheme.rows[j].direction;
    if (0..3).any(|axis| pe_i[axis] + pe_j[axis] != 0) {
        return false;
    }

    if shells.is_bzero_shell(shell) {
        return true;
    }
    directions_match(gradients.rows[i].vector(), gradients.rows[j].vector())
}

fn directions_match(a: nalgebra::Vector3<f64>, b: nalgebra::Vector3<f64>) -> bool {
    let (na, nb) = (a.norm(), b.norm());
    match (na > 0.0, nb > 0.0) {
        (false, false) => true,
        (true, true) => (a.dot(&b) / (na * nb)).abs() >= DIRECTION_MATCH_THRESHOLD,
        _ => false,
    }
}
