//! Scan target generation.
//!
//! Edge scans sample densely around the absorption edge and sparsely away
//! from it. EXAFS scans step uniformly in photon wavenumber `k` above the edge
//! and lengthen the count time as the signal falls off.
//!
//! All energies are in keV.

/// ħ²/2mₑ in keV·Å²
const HBAR2_OVER_2M: f64 = 3.809_98e-3;

/// Fixed step of the region around the edge
pub const MAD_FINE_STEP: f64 = 0.001;

/// Offset from the edge (keV) to photoelectron wavenumber (Å⁻¹)
///
/// Negative offsets give negative `k`.
pub fn energy_to_k(delta_e: f64) -> f64 {
    delta_e.signum() * (delta_e.abs() / HBAR2_OVER_2M).sqrt()
}

/// Photoelectron wavenumber (Å⁻¹) to offset above the edge (keV)
pub fn k_to_energy(k: f64) -> f64 {
    k * k * HBAR2_OVER_2M
}

/// Targets for a MAD edge scan around `edge`
///
/// Five zones relative to the edge:
///
/// | zone      | range            | step                               |
/// |-----------|------------------|------------------------------------|
/// | very low  | -0.2, -0.17      | two single points                  |
/// | low       | -0.15 .. -0.03   | 0.02, shrinking by 0.0015 per point |
/// | mid       | -0.03 .. +0.03   | 0.001                              |
/// | high      | +0.0315 .. +0.16 | 0.002, growing by 0.0015 per point |
/// | very high | +0.18, +0.21     | two single points                  |
pub fn mad_targets(edge: f64) -> Vec<f64> {
    let mut targets = vec![edge - 0.2, edge - 0.17];

    let mut step = 0.02;
    let mut offset = -0.15;
    while offset < -0.03 {
        targets.push(edge + offset);
        step -= 0.0015;
        offset += step;
    }

    // integer stepping keeps the fine zone free of accumulated error
    let fine_points = (0.06 / MAD_FINE_STEP).round() as usize;
    targets.extend((0..fine_points).map(|i| edge - 0.03 + i as f64 * MAD_FINE_STEP));

    let mut step = 0.002;
    let mut offset = 0.0315;
    while offset < 0.16 {
        targets.push(edge + offset);
        step += 0.0015;
        offset += step;
    }

    targets.push(edge + 0.18);
    targets.push(edge + 0.21);
    targets
}

/// Targets for an EXAFS scan of `edge` out to `kmax` Å⁻¹
///
/// Pre-edge points approach the edge geometrically from -0.2 keV, the edge
/// itself is stepped at 0.5 eV up to +6 eV, then the scan steps by 0.05 Å⁻¹
/// in `k`.
pub fn exafs_targets(edge: f64, kmax: f64) -> Vec<f64> {
    const START: f64 = -0.2;
    const PRE_EDGE_END: f64 = -0.005;
    const EDGE_END: f64 = 0.006;
    const PRE_EDGE_FACTOR: f64 = 10.0;
    const EDGE_STEP: f64 = 0.0005;
    const K_STEP: f64 = 0.05;

    let mut offsets = vec![START];
    let mut offset = START;
    while offset < PRE_EDGE_END {
        offset += offset.abs() / PRE_EDGE_FACTOR;
        offsets.push(offset);
    }
    while offset < EDGE_END {
        offset += EDGE_STEP;
        offsets.push(offset);
    }
    let mut k = energy_to_k(offset);
    while k < kmax {
        k += K_STEP;
        offsets.push(k_to_energy(k));
    }
    offsets.into_iter().map(|o| edge + o).collect()
}

/// Count time at wavenumber `k` for a base time `t`
///
/// Below k = 3 Å⁻¹ the base time is used; above, the time grows
/// quadratically to ten times the base at `kmax`.
pub fn exafs_time_func(t: f64, k: f64, kmax: f64) -> f64 {
    const KMIN: f64 = 3.0;
    if k < KMIN || kmax <= KMIN {
        t
    } else {
        t + 9.0 * t * ((k - KMIN) / (kmax - KMIN)).powi(2)
    }
}

/// `steps` evenly spaced positions from `start` up to, but excluding, `end`
pub fn linear_targets(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps == 0 {
        return Vec::new();
    }
    let step = (end - start) / steps as f64;
    (0..steps).map(|i| start + i as f64 * step).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SE_K: f64 = 12.658;

    #[test]
    fn mad_targets_are_monotonic() {
        let targets = mad_targets(SE_K);
        assert!(targets.windows(2).all(|w| w[1] > w[0]));
        assert!((targets[0] - (SE_K - 0.2)).abs() < 1e-12);
        assert!((targets.last().unwrap() - (SE_K + 0.21)).abs() < 1e-12);
    }

    #[test]
    fn mad_spacing_is_finest_around_edge() {
        let targets = mad_targets(SE_K);
        let in_mid = |x: f64| x >= SE_K - 0.03 - 1e-9 && x <= SE_K + 0.03 + 1e-9;

        let mut fine = 0;
        for pair in targets.windows(2) {
            let spacing = pair[1] - pair[0];
            if in_mid(pair[0]) && in_mid(pair[1]) {
                assert!((spacing - MAD_FINE_STEP).abs() < 1e-9, "spacing {spacing} at {}", pair[0]);
                fine += 1;
            } else {
                assert!(spacing > MAD_FINE_STEP + 1e-9, "spacing {spacing} at {}", pair[0]);
            }
        }
        assert_eq!(fine, 59);
    }

    #[test]
    fn mad_zone_sizes() {
        let offsets = mad_targets(0.0);
        let low = offsets.iter().filter(|&&x| x >= -0.15 - 1e-9 && x < -0.03 - 1e-9).count();
        let high = offsets.iter().filter(|&&x| x > 0.03 + 1e-9 && x < 0.16).count();
        assert_eq!(low, 11);
        assert_eq!(high, 12);
        assert_eq!(offsets.len(), 2 + 11 + 60 + 12 + 2);
    }

    #[test]
    fn k_space_round_trip() {
        let k = energy_to_k(0.5);
        assert!((k - 11.456).abs() < 1e-3, "got {k}");
        assert!((k_to_energy(k) - 0.5).abs() < 1e-12);
        assert!(energy_to_k(-0.1) < 0.0);
    }

    #[test]
    fn exafs_targets_reach_kmax() {
        let targets = exafs_targets(SE_K, 12.0);
        assert!(targets.windows(2).all(|w| w[1] > w[0]));
        assert!((targets[0] - (SE_K - 0.2)).abs() < 1e-12);
        let k_last = energy_to_k(targets.last().unwrap() - SE_K);
        assert!(k_last >= 12.0 && k_last < 12.0 + 0.05 + 1e-9, "got {k_last}");
    }

    #[test]
    fn exafs_time_grows_with_k() {
        assert_eq!(exafs_time_func(1.0, 2.0, 14.0), 1.0);
        assert_eq!(exafs_time_func(1.0, 3.0, 14.0), 1.0);
        assert!((exafs_time_func(1.0, 14.0, 14.0) - 10.0).abs() < 1e-12);
        assert!(exafs_time_func(2.0, 8.0, 14.0) > exafs_time_func(2.0, 7.0, 14.0));
    }

    #[test]
    fn linear_targets_exclude_end() {
        assert_eq!(linear_targets(1.0, 5.0, 4), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(linear_targets(1.0, 5.0, 0).is_empty());
    }
}
