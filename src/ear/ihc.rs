//! IHC: inner hair cell transduction.
//!
//! Each channel's basilar-membrane motion is AC-coupled, passed through a
//! rectifying conductance nonlinearity and drawn through one or two
//! capacitor "reservoirs" that deplete under sustained drive and recover at
//! rest. Two low-pass smoothers and a rest-level subtraction turn the
//! receptor current into a non-negative firing-probability-like signal.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::block::ChannelBlock;
use super::component::EarComponent;
use crate::error::{CarfacError, require_finite, require_positive};

/// Full charge of a reservoir capacitor.
pub const RESERVOIR_CAPACITY: f64 = 1.0;

/// Output ceiling when only half-wave rectifying.
const HWR_SATURATION: f64 = 2.0;

/// Receptor conductance as a function of (AC-coupled) displacement.
///
/// A cubic onset offset slightly into negative displacement, limited by a
/// rational function so it saturates toward 1 at large positive input.
#[inline]
pub fn detect(x: f64) -> f64 {
    const OFFSET: f64 = 0.175;
    let z = (x + OFFSET).max(0.0);
    let z2 = z * z;
    let z3 = z2 * z;
    z3 / (z3 + z2 + 0.1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IhcParams {
    /// Skip the reservoirs and only half-wave rectify.
    pub just_half_wave_rectify: bool,
    /// Use the single-capacitor model instead of the two-capacitor one.
    pub one_capacitor: bool,
    /// Output smoothing, applied twice.
    pub tau_lpf: f64,
    /// Depletion time constant (one capacitor).
    pub tau_out: f64,
    /// Recovery time constant (one capacitor).
    pub tau_in: f64,
    pub tau1_out: f64,
    pub tau1_in: f64,
    pub tau2_out: f64,
    pub tau2_in: f64,
    /// AC-coupling corner; the only parameter used when just rectifying.
    pub ac_corner_hz: f64,
}

impl Default for IhcParams {
    fn default() -> Self {
        IhcParams {
            just_half_wave_rectify: false,
            one_capacitor: false,
            tau_lpf: 0.000080,
            tau_out: 0.0005,
            tau_in: 0.010,
            tau1_out: 0.010,
            tau1_in: 0.020,
            tau2_out: 0.0025,
            tau2_in: 0.005,
            ac_corner_hz: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IhcMode {
    HalfWaveRectify,
    OneCapacitor,
    TwoCapacitor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IhcCoeffs {
    pub mode: IhcMode,
    pub ac_coeff: f64,
    pub lpf_coeff: f64,
    pub in1_rate: f64,
    pub out1_rate: f64,
    pub in2_rate: f64,
    pub out2_rate: f64,
    pub output_gain: f64,
    pub rest_output: f64,
    pub rest_cap1: f64,
    pub rest_cap2: f64,
    /// Upper bound of the output signal.
    pub saturation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IhcState {
    pub ac_coupler: Vec<f64>,
    pub lpf1_state: Vec<f64>,
    pub lpf2_state: Vec<f64>,
    pub cap1_voltage: Vec<f64>,
    pub cap2_voltage: Vec<f64>,
    /// Reservoir updates that had to be pulled back into `[0, capacity]`.
    pub clamp_count: u64,
}

impl IhcState {
    pub fn num_channels(&self) -> usize {
        self.ac_coupler.len()
    }

    fn check_channels(&self) -> Result<(), CarfacError> {
        let n = self.num_channels();
        for v in [
            &self.lpf1_state,
            &self.lpf2_state,
            &self.cap1_voltage,
            &self.cap2_voltage,
        ] {
            if v.len() != n {
                return Err(CarfacError::ChannelCountMismatch {
                    expected: n,
                    found: v.len(),
                });
            }
        }
        Ok(())
    }
}

/// Per-sample rate for a time constant, rejecting ones the sample rate can't resolve.
fn rate(name: &'static str, tau: f64, sample_rate: f64) -> Result<f64, CarfacError> {
    let r = 1.0 / (require_positive(name, tau)? * sample_rate);
    if r >= 1.0 {
        return Err(CarfacError::invalid(name, tau, "time constant shorter than one sample"));
    }
    Ok(r)
}

#[inline]
fn clamp_counted(v: f64, lo: f64, hi: f64, count: &mut u64) -> f64 {
    if v < lo {
        *count += 1;
        lo
    } else if v > hi {
        *count += 1;
        hi
    } else {
        v
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ihc;

impl EarComponent for Ihc {
    type Params = IhcParams;
    type Coeffs = IhcCoeffs;
    type State = IhcState;
    type Input<'a> = &'a ChannelBlock;
    type Output = ChannelBlock;

    fn design(params: &IhcParams, sample_rate: f64) -> Result<IhcCoeffs, CarfacError> {
        require_positive("sample_rate", sample_rate)?;
        let ac_coeff = 2.0 * PI * require_positive("ac_corner_hz", params.ac_corner_hz)? / sample_rate;
        if ac_coeff >= 1.0 {
            return Err(CarfacError::invalid(
                "ac_corner_hz",
                params.ac_corner_hz,
                "AC-coupling corner too high for the sample rate",
            ));
        }

        let coeffs = if params.just_half_wave_rectify {
            IhcCoeffs {
                mode: IhcMode::HalfWaveRectify,
                ac_coeff,
                lpf_coeff: 0.0,
                in1_rate: 0.0,
                out1_rate: 0.0,
                in2_rate: 0.0,
                out2_rate: 0.0,
                output_gain: 1.0,
                rest_output: 0.0,
                rest_cap1: 0.0,
                rest_cap2: 0.0,
                saturation: HWR_SATURATION,
            }
        } else {
            let lpf_coeff =
                1.0 - (-1.0 / (require_positive("tau_lpf", params.tau_lpf)? * sample_rate)).exp();
            let g_max = detect(10.0);
            let g_rest = detect(0.0);

            if params.one_capacitor {
                // c sized so tau_out is the depletion time at max conductance.
                let c = require_positive("tau_out", params.tau_out)? * g_max;
                let r = require_positive("tau_in", params.tau_in)? / c;
                let out1_rate = 1.0 / (c * sample_rate);
                if out1_rate >= 1.0 {
                    return Err(CarfacError::invalid(
                        "tau_out",
                        params.tau_out,
                        "time constant shorter than one sample",
                    ));
                }
                // Doubled r_min approximates a 50% duty cycle at saturation.
                let saturation_current = 1.0 / (2.0 / g_max + r);
                let rest_current = 1.0 / (1.0 / g_rest + r);
                let output_gain = 1.0 / (saturation_current - rest_current);
                let rest_output = rest_current * output_gain;
                IhcCoeffs {
                    mode: IhcMode::OneCapacitor,
                    ac_coeff,
                    lpf_coeff,
                    in1_rate: rate("tau_in", params.tau_in, sample_rate)?,
                    out1_rate,
                    in2_rate: 0.0,
                    out2_rate: 0.0,
                    output_gain,
                    rest_output,
                    rest_cap1: 1.0 - rest_current * r,
                    rest_cap2: 0.0,
                    saturation: output_gain - rest_output,
                }
            } else {
                let c2 = require_positive("tau2_out", params.tau2_out)? * g_max;
                let r2 = require_positive("tau2_in", params.tau2_in)? / c2;
                let c1 = require_positive("tau1_out", params.tau1_out)? / r2;
                let r1 = require_positive("tau1_in", params.tau1_in)? / c1;
                let out2_rate = 1.0 / (c2 * sample_rate);
                if out2_rate >= 1.0 {
                    return Err(CarfacError::invalid(
                        "tau2_out",
                        params.tau2_out,
                        "time constant shorter than one sample",
                    ));
                }
                let saturation_current = 1.0 / (2.0 / g_max + r1 + r2);
                let rest_current = 1.0 / (1.0 / g_rest + r1 + r2);
                let output_gain = 1.0 / (saturation_current - rest_current);
                let rest_output = rest_current * output_gain;
                let rest_cap1 = 1.0 - rest_current * r1;
                IhcCoeffs {
                    mode: IhcMode::TwoCapacitor,
                    ac_coeff,
                    lpf_coeff,
                    in1_rate: rate("tau1_in", params.tau1_in, sample_rate)?,
                    out1_rate: rate("tau1_out", params.tau1_out, sample_rate)?,
                    in2_rate: rate("tau2_in", params.tau2_in, sample_rate)?,
                    out2_rate,
                    output_gain,
                    rest_output,
                    rest_cap1,
                    rest_cap2: rest_cap1 - rest_current * r2,
                    saturation: output_gain - rest_output,
                }
            }
        };

        debug!(mode = ?coeffs.mode, saturation = coeffs.saturation, "designed IHC");
        Ok(coeffs)
    }

    fn init_state(coeffs: &IhcCoeffs, num_channels: usize) -> Result<IhcState, CarfacError> {
        let mut state = IhcState {
            ac_coupler: vec![0.0; num_channels],
            lpf1_state: vec![0.0; num_channels],
            lpf2_state: vec![0.0; num_channels],
            cap1_voltage: vec![0.0; num_channels],
            cap2_voltage: vec![0.0; num_channels],
            clamp_count: 0,
        };
        Ihc::reset(coeffs, &mut state);
        Ok(state)
    }

    fn process_block(
        coeffs: &IhcCoeffs,
        state: &mut IhcState,
        input: &ChannelBlock,
    ) -> Result<ChannelBlock, CarfacError> {
        state.check_channels()?;
        let n_ch = state.num_channels();
        if input.num_channels() != n_ch {
            return Err(CarfacError::ChannelCountMismatch {
                expected: n_ch,
                found: input.num_channels(),
            });
        }
        require_finite(input.as_slice(), n_ch)?;

        let mut out = ChannelBlock::zeros(n_ch, input.num_samples());
        let mut clamped = 0u64;
        for t in 0..input.num_samples() {
            let frame = input.frame(t);
            let out_frame = out.frame_mut(t);
            for ch in 0..n_ch {
                let ac_diff = frame[ch] - state.ac_coupler[ch];
                state.ac_coupler[ch] += coeffs.ac_coeff * ac_diff;

                let y = match coeffs.mode {
                    IhcMode::HalfWaveRectify => ac_diff,
                    IhcMode::OneCapacitor => {
                        let v1 = state.cap1_voltage[ch];
                        let current = detect(ac_diff) * v1;
                        let v1 = v1 - current * coeffs.out1_rate
                            + (RESERVOIR_CAPACITY - v1) * coeffs.in1_rate;
                        state.cap1_voltage[ch] = clamp_counted(v1, 0.0, RESERVOIR_CAPACITY, &mut clamped);
                        Ihc::smooth(coeffs, state, ch, current)
                    }
                    IhcMode::TwoCapacitor => {
                        let v1 = state.cap1_voltage[ch];
                        let v2 = state.cap2_voltage[ch];
                        let current = detect(ac_diff) * v2;
                        let v1 = v1 - (v1 - v2) * coeffs.out1_rate
                            + (RESERVOIR_CAPACITY - v1) * coeffs.in1_rate;
                        let v1 = clamp_counted(v1, 0.0, RESERVOIR_CAPACITY, &mut clamped);
                        let v2 = v2 - current * coeffs.out2_rate + (v1 - v2) * coeffs.in2_rate;
                        state.cap1_voltage[ch] = v1;
                        state.cap2_voltage[ch] = clamp_counted(v2, 0.0, RESERVOIR_CAPACITY, &mut clamped);
                        Ihc::smooth(coeffs, state, ch, current)
                    }
                };
                out_frame[ch] = y.clamp(0.0, coeffs.saturation);
            }
        }
        if clamped > 0 {
            trace!(clamped, "IHC reservoir clamped");
            state.clamp_count += clamped;
        }
        Ok(out)
    }

    fn reset(coeffs: &IhcCoeffs, state: &mut IhcState) {
        state.ac_coupler.fill(0.0);
        state.lpf1_state.fill(coeffs.rest_output);
        state.lpf2_state.fill(coeffs.rest_output);
        state.cap1_voltage.fill(coeffs.rest_cap1);
        state.cap2_voltage.fill(coeffs.rest_cap2);
        state.clamp_count = 0;
    }
}

impl Ihc {
    /// Gain-normalise the receptor current, smooth twice, and remove the rest level.
    #[inline]
    fn smooth(coeffs: &IhcCoeffs, state: &mut IhcState, ch: usize, current: f64) -> f64 {
        let x = current * coeffs.output_gain;
        state.lpf1_state[ch] += coeffs.lpf_coeff * (x - state.lpf1_state[ch]);
        state.lpf2_state[ch] += coeffs.lpf_coeff * (state.lpf1_state[ch] - state.lpf2_state[ch]);
        state.lpf2_state[ch] - coeffs.rest_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    const FS: f64 = 22050.0;

    fn tone_block(n_ch: usize, n: usize, freq: f64, amp: f64) -> ChannelBlock {
        let mut b = ChannelBlock::zeros(n_ch, n);
        for t in 0..n {
            let x = amp * (2.0 * PI * freq * t as f64 / FS).sin();
            b.frame_mut(t).fill(x);
        }
        b
    }

    #[test]
    fn detect_is_monotone_and_bounded() {
        let mut prev = detect(-1.0);
        assert_eq!(prev, 0.0);
        for i in -100..=400 {
            let g = detect(i as f64 * 0.05);
            assert!(g >= prev && g < 1.0, "detect not monotone/bounded at {i}");
            prev = g;
        }
    }

    #[test]
    fn rest_state_is_a_fixed_point() {
        for one_capacitor in [false, true] {
            let params = IhcParams {
                one_capacitor,
                ..Default::default()
            };
            let coeffs = Ihc::design(&params, FS).unwrap();
            let mut state = Ihc::init_state(&coeffs, 4).unwrap();
            let out = Ihc::process_block(&coeffs, &mut state, &ChannelBlock::zeros(4, 2000)).unwrap();
            assert!(out.max_value() < 1e-9, "silence produced {}", out.max_value());
            assert!((state.cap1_voltage[0] - coeffs.rest_cap1).abs() < 1e-9);
            assert_eq!(state.clamp_count, 0);
        }
    }

    #[test]
    fn tone_gives_positive_output_below_saturation() {
        let coeffs = Ihc::design(&IhcParams::default(), FS).unwrap();
        let mut state = Ihc::init_state(&coeffs, 2).unwrap();
        let out = Ihc::process_block(&coeffs, &mut state, &tone_block(2, 2000, 1000.0, 1.0)).unwrap();
        assert!(out.channel_mean(0) > 0.0);
        assert!(out.max_value() < coeffs.saturation);
        assert!(out.min_value() >= 0.0);
    }

    #[test]
    fn adaptation_reduces_sustained_response() {
        let coeffs = Ihc::design(&IhcParams::default(), FS).unwrap();
        let mut state = Ihc::init_state(&coeffs, 1).unwrap();
        let out = Ihc::process_block(&coeffs, &mut state, &tone_block(1, 4410, 1000.0, 1.0)).unwrap();
        let onset: f64 = out.channel(0).take(441).sum();
        let sustained: f64 = out.channel(0).skip(4410 - 441).sum();
        assert!(
            sustained < 0.8 * onset,
            "expected adaptation: onset {onset}, sustained {sustained}"
        );
    }

    #[test]
    fn output_bounded_for_extreme_inputs() {
        for params in [
            IhcParams::default(),
            IhcParams {
                one_capacitor: true,
                ..Default::default()
            },
            IhcParams {
                just_half_wave_rectify: true,
                ..Default::default()
            },
        ] {
            let coeffs = Ihc::design(&params, FS).unwrap();
            let mut state = Ihc::init_state(&coeffs, 3).unwrap();
            let mut rng = StdRng::seed_from_u64(11);
            let mut input = ChannelBlock::zeros(3, 3000);
            for t in 0..3000 {
                for v in input.frame_mut(t) {
                    *v = rng.random_range(-1.0e3..1.0e3);
                }
            }
            let out = Ihc::process_block(&coeffs, &mut state, &input).unwrap();
            assert!(out.min_value() >= 0.0);
            assert!(out.max_value() <= coeffs.saturation);
            for ch in 0..3 {
                for v in [state.cap1_voltage[ch], state.cap2_voltage[ch]] {
                    assert!((0.0..=RESERVOIR_CAPACITY).contains(&v), "reservoir out of range: {v}");
                }
            }
        }
    }

    #[test]
    fn half_wave_mode_rectifies() {
        let params = IhcParams {
            just_half_wave_rectify: true,
            ..Default::default()
        };
        let coeffs = Ihc::design(&params, FS).unwrap();
        assert_eq!(coeffs.mode, IhcMode::HalfWaveRectify);
        assert_eq!(coeffs.saturation, 2.0);
        let mut state = Ihc::init_state(&coeffs, 1).unwrap();
        let out = Ihc::process_block(&coeffs, &mut state, &tone_block(1, 500, 2000.0, 5.0)).unwrap();
        assert_eq!(out.max_value(), 2.0);
        assert_eq!(out.min_value(), 0.0);
    }

    #[test]
    fn design_rejects_bad_time_constants() {
        for params in [
            IhcParams {
                tau_lpf: 0.0,
                ..Default::default()
            },
            IhcParams {
                tau2_in: -1.0,
                ..Default::default()
            },
            IhcParams {
                tau1_out: 1.0e-6,
                ..Default::default()
            },
            IhcParams {
                ac_corner_hz: f64::INFINITY,
                ..Default::default()
            },
        ] {
            assert!(
                matches!(Ihc::design(&params, FS), Err(CarfacError::InvalidParameter { .. })),
                "expected rejection for {params:?}"
            );
        }
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let coeffs = Ihc::design(&IhcParams::default(), FS).unwrap();
        let mut state = Ihc::init_state(&coeffs, 4).unwrap();
        let before = state.clone();
        let result = Ihc::process_block(&coeffs, &mut state, &ChannelBlock::zeros(5, 10));
        assert!(matches!(result, Err(CarfacError::ChannelCountMismatch { expected: 4, found: 5 })));
        assert_eq!(state, before);
    }

    #[test]
    fn inconsistent_state_is_rejected_untouched() {
        let coeffs = Ihc::design(&IhcParams::default(), FS).unwrap();
        let mut state = Ihc::init_state(&coeffs, 4).unwrap();
        state.cap2_voltage.truncate(2);
        let before = state.clone();
        let result = Ihc::process_block(&coeffs, &mut state, &tone_block(4, 10, 500.0, 0.5));
        assert!(matches!(result, Err(CarfacError::ChannelCountMismatch { expected: 4, found: 2 })));
        assert_eq!(state, before);
    }

    #[test]
    fn infinite_input_is_rejected_untouched() {
        let coeffs = Ihc::design(&IhcParams::default(), FS).unwrap();
        let mut state = Ihc::init_state(&coeffs, 3).unwrap();
        let before = state.clone();
        let mut input = tone_block(3, 20, 500.0, 0.5);
        input.frame_mut(7)[1] = f64::INFINITY;
        let result = Ihc::process_block(&coeffs, &mut state, &input);
        assert!(matches!(result, Err(CarfacError::NonFiniteInput { sample: 7 })));
        assert_eq!(state, before);
    }

    #[test]
    fn reset_restores_rest() {
        let coeffs = Ihc::design(&IhcParams::default(), FS).unwrap();
        let fresh = Ihc::init_state(&coeffs, 2).unwrap();
        let mut state = fresh.clone();
        Ihc::process_block(&coeffs, &mut state, &tone_block(2, 300, 700.0, 0.8)).unwrap();
        assert_ne!(state, fresh);
        Ihc::reset(&coeffs, &mut state);
        assert_eq!(state, fresh);
    }
}
