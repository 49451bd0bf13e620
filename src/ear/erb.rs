//! ERB scale and placement of resonator poles along the channel axis.
//!
//! Glasberg & Moore (1990): ERB = (break_freq + cf) / Q. With the Greenwood
//! break frequency this gives the quasi-logarithmic cochlear map.

/// Equivalent rectangular bandwidth in Hz at `cf_hz`.
#[inline]
pub fn erb_hz(cf_hz: f64, erb_break_freq: f64, erb_q: f64) -> f64 {
    (erb_break_freq + cf_hz) / erb_q
}

/// Pole frequencies obtained by stepping `erb_per_step` ERBs downward from
/// `top_hz` while staying above `min_hz`. Channel 0 is the highest frequency.
pub fn stepped_pole_frequencies(
    top_hz: f64,
    min_hz: f64,
    erb_per_step: f64,
    erb_break_freq: f64,
    erb_q: f64,
) -> Vec<f64> {
    let mut poles = Vec::new();
    let mut pole_hz = top_hz;
    while pole_hz > min_hz {
        poles.push(pole_hz);
        pole_hz -= erb_per_step * erb_hz(pole_hz, erb_break_freq, erb_q);
    }
    poles
}

/// Exactly `n` pole frequencies from `top_hz` down to `min_hz`, equally
/// spaced on the same ERB-rate scale used by [`stepped_pole_frequencies`].
///
/// Stepping by a fixed ERB fraction is geometric in `f + break_freq`, so the
/// spacing ratio follows directly from the end points.
pub fn spaced_pole_frequencies(n: usize, top_hz: f64, min_hz: f64, erb_break_freq: f64) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![top_hz],
        _ => {
            let ratio = ((min_hz + erb_break_freq) / (top_hz + erb_break_freq))
                .powf(1.0 / (n - 1) as f64);
            (0..n)
                .map(|k| (top_hz + erb_break_freq) * ratio.powi(k as i32) - erb_break_freq)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BREAK: f64 = 165.3;
    const Q: f64 = 1000.0 / (24.7 * 4.37);

    #[test]
    fn erb_at_one_khz() {
        // Glasberg & Moore with the standard break frequency: ~132.6 Hz
        let erb = erb_hz(1000.0, 1000.0 / 4.37, Q);
        assert!((erb - 24.7 * (1.0 + 4.37)).abs() < 1e-9, "got {erb}");
    }

    #[test]
    fn stepped_poles_descend_above_floor() {
        let poles = stepped_pole_frequencies(9371.0, 30.0, 0.5, BREAK, Q);
        assert!(poles.len() > 50, "expected a dense filterbank, got {}", poles.len());
        assert!(poles.windows(2).all(|w| w[0] > w[1]));
        assert!(*poles.last().unwrap() > 30.0);
    }

    #[test]
    fn spaced_poles_hit_both_ends() {
        let poles = spaced_pole_frequencies(40, 9000.0, 50.0, BREAK);
        assert_eq!(poles.len(), 40);
        assert!((poles[0] - 9000.0).abs() < 1e-6);
        assert!((poles[39] - 50.0).abs() < 1e-6);
        assert!(poles.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn spaced_poles_constant_erb_step() {
        let poles = spaced_pole_frequencies(20, 8000.0, 100.0, BREAK);
        let steps: Vec<f64> = poles
            .windows(2)
            .map(|w| (w[0] - w[1]) / erb_hz(w[0], BREAK, Q))
            .collect();
        for s in &steps {
            assert!((s - steps[0]).abs() < 1e-9, "uneven ERB step {s} vs {}", steps[0]);
        }
    }

    #[test]
    fn spaced_poles_degenerate_counts() {
        assert!(spaced_pole_frequencies(0, 8000.0, 100.0, BREAK).is_empty());
        assert_eq!(spaced_pole_frequencies(1, 8000.0, 100.0, BREAK), vec![8000.0]);
    }
}
