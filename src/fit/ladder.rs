//! Candidate time ladders for the pulse processor.
//!
//! The processor never searches times freely from a cold start. It walks a
//! short, fixed list of starting guesses around the configured peak index so
//! the outcome is deterministic for a given trace.

/// Offsets (samples) tried in order for the single-pulse fit.
pub const SINGLE_PULSE_OFFSETS: [i32; 3] = [0, 1, -1];

/// Offset pairs `(first, second)` walked when the two-pulse fit stays poor.
pub const TWO_PULSE_OFFSETS: [(i32, i32); 7] = [
    (-2, 1),
    (-1, 1),
    (-2, 2),
    (-5, 0),
    (0, 5),
    (-10, 0),
    (0, 10),
];

/// Single-pulse time guesses around `peak_index`.
pub fn single_pulse_guesses(peak_index: f64) -> impl Iterator<Item = f64> {
    SINGLE_PULSE_OFFSETS
        .into_iter()
        .map(move |o| peak_index + f64::from(o))
}

/// Two-pulse time guesses around `peak_index`.
pub fn two_pulse_guesses(peak_index: f64) -> impl Iterator<Item = [f64; 2]> {
    TWO_PULSE_OFFSETS
        .into_iter()
        .map(move |(a, b)| [peak_index + f64::from(a), peak_index + f64::from(b)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_ladder_order() {
        let g: Vec<f64> = single_pulse_guesses(7.0).collect();
        assert_eq!(g, vec![7.0, 8.0, 6.0]);
    }

    #[test]
    fn two_pulse_ladder_is_ordered_in_time() {
        let g: Vec<[f64; 2]> = two_pulse_guesses(20.0).collect();
        assert_eq!(g.len(), 7);
        assert_eq!(g[0], [18.0, 21.0]);
        assert_eq!(g[6], [20.0, 30.0]);
        assert!(g.iter().all(|[a, b]| a < b));
    }
}
