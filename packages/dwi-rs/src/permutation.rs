//! First b=0 location and the volume permutation that places it first.
//!
//! Field estimation puts the first DWI b=0 volume at the head of its
//! input, and eddy aligns everything to its own first volume. When the
//! first b=0 is not volume 0, the DWI series is reordered before eddy and
//! restored afterwards.

use crate::error::{DwiError, Result};
use crate::types::GradientTable;
use serde::Serialize;

/// Index of the first volume with b-value at or below `threshold`.
pub fn locate_first_bzero(gradients: &GradientTable, threshold: f64) -> Result<usize> {
    gradients
        .rows
        .iter()
        .position(|r| r.bvalue <= threshold)
        .ok_or_else(|| {
            DwiError::metadata(format!(
                "No b=0 volume (b <= {}) found in the DWI series",
                threshold
            ))
        })
}

/// Reordering applied before eddy and its inverse applied after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumePermutation {
    /// Output volume `k` of the forward permutation is input `forward[k]`.
    pub forward: Vec<usize>,
    pub inverse: Vec<usize>,
}

impl VolumePermutation {
    /// Move `first_bzero` to the front, keeping the remaining order.
    pub fn bring_to_front(num_volumes: usize, first_bzero: usize) -> Result<Self> {
        if first_bzero >= num_volumes {
            return Err(DwiError::metadata(format!(
                "First b=0 index {} out of range for {} volumes",
                first_bzero, num_volumes
            )));
        }
        let mut forward = Vec::with_capacity(num_volumes);
        forward.push(first_bzero);
        forward.extend((0..num_volumes).filter(|&i| i != first_bzero));
        Ok(Self::from_forward(forward))
    }

    pub fn from_forward(forward: Vec<usize>) -> Self {
        let mut inverse = vec![0; forward.len()];
        for (k, &i) in forward.iter().enumerate() {
            inverse[i] = k;
        }
        Self { forward, inverse }
    }

    pub fn is_identity(&self) -> bool {
        self.forward.iter().enumerate().all(|(k, &i)| k == i)
    }

    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.forward.iter().map(|&i| items[i].clone()).collect()
    }

    pub fn apply_inverse<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.inverse.iter().map(|&k| items[k].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GradientRow;
    use proptest::prelude::*;

    #[test]
    fn test_locate_first_bzero() {
        let t = GradientTable::new(vec![
            GradientRow::new(1.0, 0.0, 0.0, 1000.0),
            GradientRow::new(0.0, 1.0, 0.0, 1000.0),
            GradientRow::new(0.0, 0.0, 0.0, 5.0),
            GradientRow::new(0.0, 0.0, 0.0, 0.0),
        ]);
        assert_eq!(locate_first_bzero(&t, 10.0).unwrap(), 2);
        assert!(locate_first_bzero(&t, 1.0).is_ok());
        assert!(locate_first_bzero(&t, -1.0).is_err());
    }

    #[test]
    fn test_bring_to_front() {
        let p = VolumePermutation::bring_to_front(5, 3).unwrap();
        assert_eq!(p.forward, vec![3, 0, 1, 2, 4]);
        assert_eq!(p.apply(&["a", "b", "c", "d", "e"]), vec!["d", "a", "b", "c", "e"]);
        assert!(!p.is_identity());
        assert!(VolumePermutation::bring_to_front(5, 0).unwrap().is_identity());
        assert!(VolumePermutation::bring_to_front(5, 5).is_err());
    }

    proptest! {
        #[test]
        fn prop_permutation_round_trip(n in 1usize..64, seed in 0usize..1000) {
            let first = seed % n;
            let p = VolumePermutation::bring_to_front(n, first).unwrap();
            let original: Vec<usize> = (0..n).collect();
            let permuted = p.apply(&original);
            prop_assert_eq!(permuted[0], first);
            prop_assert_eq!(p.apply_inverse(&permuted), original);
        }
    }
}
