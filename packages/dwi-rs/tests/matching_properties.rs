use dwi_rs::gradient::{ShellAssignment, DEFAULT_BZERO_THRESHOLD, DEFAULT_SHELL_TOLERANCE};
use dwi_rs::matcher::match_pairs;
use dwi_rs::phase_encoding::{PeRow, PeScheme};
use dwi_rs::{GradientRow, GradientTable};
use proptest::prelude::*;

const AXES: [[f64; 3]; 6] = [
    [1.0, 0.0, 0.0],
    [-1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, -1.0, 0.0],
    [0.0, 0.0, 1.0],
    [0.0, 0.0, -1.0],
];
const SHELLS: [f64; 3] = [0.0, 1000.0, 2000.0];

fn row(axis: usize, shell: usize) -> GradientRow {
    let b = SHELLS[shell];
    if b == 0.0 {
        GradientRow::new(0.0, 0.0, 0.0, 0.0)
    } else {
        let d = AXES[axis];
        GradientRow::new(d[0], d[1], d[2], b)
    }
}

/// First half of the series plus the same volumes, shuffled, with the
/// phase encoding reversed.
fn reversed_series() -> impl Strategy<Value = (GradientTable, PeScheme)> {
    prop::collection::vec((0usize..6, 0usize..3), 1..12)
        .prop_flat_map(|first| {
            let order: Vec<usize> = (0..first.len()).collect();
            (Just(first), Just(order).prop_shuffle())
        })
        .prop_map(|(first, order)| {
            let mut rows: Vec<GradientRow> = first.iter().map(|&(a, s)| row(a, s)).collect();
            rows.extend(order.iter().map(|&i| row(first[i].0, first[i].1)));
            let half = first.len();
            let scheme = PeScheme::new(
                (0..half * 2)
                    .map(|v| {
                        let sign = if v < half { -1 } else { 1 };
                        PeRow::new([0, sign, 0], 0.05)
                    })
                    .collect(),
            );
            (GradientTable::new(rows), scheme)
        })
}

proptest! {
    #[test]
    fn prop_pairing_is_perfect_matching((gradients, scheme) in reversed_series()) {
        let shells = ShellAssignment::from_table(
            &gradients,
            DEFAULT_BZERO_THRESHOLD,
            DEFAULT_SHELL_TOLERANCE,
        );
        let pairs = match_pairs(&gradients, &shells, &scheme).unwrap();
        let n = gradients.len();
        prop_assert_eq!(pairs.len(), n / 2);

        let mut seen = vec![0usize; n];
        for pair in &pairs {
            seen[pair.first] += 1;
            seen[pair.second] += 1;
            prop_assert!(pair.first < n / 2);
            prop_assert!(pair.second >= n / 2);
        }
        prop_assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn prop_odd_series_never_pairs(extra in 0usize..6) {
        let rows: Vec<GradientRow> = (0..(2 * extra + 1)).map(|i| row(i % 6, 1)).collect();
        let gradients = GradientTable::new(rows);
        let shells = ShellAssignment::from_table(
            &gradients,
            DEFAULT_BZERO_THRESHOLD,
            DEFAULT_SHELL_TOLERANCE,
        );
        let scheme = PeScheme::uniform(PeRow::new([0, 1, 0], 0.05), gradients.len());
        prop_assert!(match_pairs(&gradients, &shells, &scheme).is_err());
    }
}
