//! CAR: cascade of asymmetric resonators.
//!
//! The basilar membrane is modelled as a chain of two-pole/two-zero sections,
//! highest characteristic frequency first. Each section is a coupled-form
//! resonator whose pole radius moves between a max-damping radius `r1` and
//! `r1 + zr` as the undamping signal goes from 0 to 1. The AGC supplies the
//! damping adjustment once per block; the outer-hair-cell velocity
//! nonlinearity modulates undamping sample by sample.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::block::ChannelBlock;
use super::component::EarComponent;
use super::erb::{erb_hz, spaced_pole_frequencies, stepped_pole_frequencies};
use crate::error::{CarfacError, require_finite, require_positive};

/// Upper end of the damping-adjustment range accepted from the AGC.
/// An adjustment of 0 is fully undamped, 1 is maximum damping.
pub const MAX_DAMPING_ADJUSTMENT: f64 = 1.0;

/// Tuning constants for the resonator cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarParams {
    /// Scale of the velocity nonlinearity.
    pub velocity_scale: f64,
    /// Offset giving the nonlinearity a quadratic part.
    pub v_offset: f64,
    /// Minimum damping factor in mid-frequency channels.
    pub min_zeta: f64,
    /// Maximum damping factor in mid-frequency channels.
    pub max_zeta: f64,
    /// Angle of the first (highest) pole, in radians per sample.
    pub first_pole_theta: f64,
    /// How far each zero sits above its pole.
    pub zero_ratio: f64,
    /// 0 to 1; compresses theta to give higher Q at the highest channels.
    pub high_f_damping_compression: f64,
    /// Channel spacing when the channel count is derived.
    pub erb_per_step: f64,
    /// Lowest allowed pole frequency in Hz.
    pub min_pole_hz: f64,
    /// Greenwood map break frequency.
    pub erb_break_freq: f64,
    /// Glasberg & Moore high-CF ratio.
    pub erb_q: f64,
    /// Fixed channel count. `None` steps `erb_per_step` ERBs down from the
    /// first pole until `min_pole_hz`.
    pub num_channels: Option<usize>,
}

impl Default for CarParams {
    fn default() -> Self {
        CarParams {
            velocity_scale: 0.1,
            v_offset: 0.04,
            min_zeta: 0.10,
            max_zeta: 0.35,
            first_pole_theta: 0.85 * PI,
            zero_ratio: 2.0_f64.sqrt(),
            high_f_damping_compression: 0.5,
            erb_per_step: 0.5,
            min_pole_hz: 30.0,
            erb_break_freq: 165.3,
            erb_q: 1000.0 / (24.7 * 4.37),
            num_channels: None,
        }
    }
}

/// Designed per-channel filter constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarCoeffs {
    pub velocity_scale: f64,
    pub v_offset: f64,
    pub pole_freqs: Vec<f64>,
    /// Pole radius at maximum damping.
    pub r1_coeffs: Vec<f64>,
    /// cos(theta)
    pub a0_coeffs: Vec<f64>,
    /// sin(theta)
    pub c0_coeffs: Vec<f64>,
    /// Zero placement.
    pub h_coeffs: Vec<f64>,
    /// Stage gain at full undamping.
    pub g0_coeffs: Vec<f64>,
    /// Radius change per unit undamping.
    pub zr_coeffs: Vec<f64>,
}

impl CarCoeffs {
    pub fn num_channels(&self) -> usize {
        self.pole_freqs.len()
    }

    /// Stage gains giving unity DC gain per section for each channel's undamping.
    pub fn stage_g(&self, undamping: &[f64]) -> Vec<f64> {
        undamping
            .iter()
            .enumerate()
            .map(|(ch, &u)| self.stage_g_at(ch, u))
            .collect()
    }

    #[inline]
    fn stage_g_at(&self, ch: usize, undamping: f64) -> f64 {
        let r = self.r1_coeffs[ch] + self.zr_coeffs[ch] * undamping;
        let a0 = self.a0_coeffs[ch];
        let c0 = self.c0_coeffs[ch];
        let h = self.h_coeffs[ch];
        (1.0 - 2.0 * r * a0 + r * r) / (1.0 - 2.0 * r * a0 + h * r * c0 + r * r)
    }

    /// Every per-channel table must be as long as `pole_freqs`.
    fn check_channels(&self) -> Result<(), CarfacError> {
        let n = self.num_channels();
        for table in [
            &self.r1_coeffs,
            &self.a0_coeffs,
            &self.c0_coeffs,
            &self.h_coeffs,
            &self.g0_coeffs,
            &self.zr_coeffs,
        ] {
            if table.len() != n {
                return Err(CarfacError::ChannelCountMismatch {
                    expected: n,
                    found: table.len(),
                });
            }
        }
        Ok(())
    }

    /// log(2) / log(f0 / f1): how densely the top of the cascade samples an octave.
    pub fn max_channels_per_octave(&self) -> f64 {
        match self.pole_freqs.as_slice() {
            [f0, f1, ..] => 2.0_f64.ln() / (f0 / f1).ln(),
            _ => 0.0,
        }
    }
}

/// Filter memory of the cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarState {
    pub z1_memory: Vec<f64>,
    pub z2_memory: Vec<f64>,
    /// One-sample delay of z2, for the velocity estimate.
    pub za_memory: Vec<f64>,
    /// Current undamping radius term (zr * undamping).
    pub zb_memory: Vec<f64>,
    /// Channel outputs.
    pub zy_memory: Vec<f64>,
    /// Current stage gains.
    pub g_memory: Vec<f64>,
    /// Damping adjustments that arrived outside the stable range.
    pub clamp_count: u64,
}

impl CarState {
    fn check_channels(&self, n: usize) -> Result<(), CarfacError> {
        for memory in [
            &self.z1_memory,
            &self.z2_memory,
            &self.za_memory,
            &self.zb_memory,
            &self.zy_memory,
            &self.g_memory,
        ] {
            if memory.len() != n {
                return Err(CarfacError::ChannelCountMismatch {
                    expected: n,
                    found: memory.len(),
                });
            }
        }
        Ok(())
    }
}

/// One block of CAR input: the raw waveform plus the damping adjustment the
/// AGC produced from the previous block.
#[derive(Debug, Clone, Copy)]
pub struct CarInput<'a> {
    pub audio: &'a [f64],
    pub damping: &'a [f64],
}

/// Clamp a damping adjustment into `[0, MAX_DAMPING_ADJUSTMENT]`.
/// NaN maps to maximum damping. Returns the value and whether it moved.
#[inline]
pub fn clamp_damping(d: f64) -> (f64, bool) {
    if d.is_nan() {
        (MAX_DAMPING_ADJUSTMENT, true)
    } else if d < 0.0 {
        (0.0, true)
    } else if d > MAX_DAMPING_ADJUSTMENT {
        (MAX_DAMPING_ADJUSTMENT, true)
    } else {
        (d, false)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Car;

impl Car {
    fn validate(params: &CarParams, sample_rate: f64) -> Result<(), CarfacError> {
        require_positive("sample_rate", sample_rate)?;
        require_positive("velocity_scale", params.velocity_scale)?;
        if !params.v_offset.is_finite() || params.v_offset < 0.0 {
            return Err(CarfacError::invalid(
                "v_offset",
                params.v_offset,
                "must be finite and non-negative",
            ));
        }
        require_positive("min_zeta", params.min_zeta)?;
        require_positive("max_zeta", params.max_zeta)?;
        if params.max_zeta < params.min_zeta {
            return Err(CarfacError::invalid(
                "max_zeta",
                params.max_zeta,
                "must not be below min_zeta",
            ));
        }
        require_positive("first_pole_theta", params.first_pole_theta)?;
        if params.first_pole_theta >= PI {
            return Err(CarfacError::invalid(
                "first_pole_theta",
                params.first_pole_theta,
                "must be below pi (Nyquist)",
            ));
        }
        require_positive("zero_ratio", params.zero_ratio)?;
        if params.zero_ratio <= 1.0 {
            return Err(CarfacError::invalid(
                "zero_ratio",
                params.zero_ratio,
                "zeros must sit above their poles",
            ));
        }
        let ff = params.high_f_damping_compression;
        if !ff.is_finite() || !(0.0..1.0).contains(&ff) {
            return Err(CarfacError::invalid(
                "high_f_damping_compression",
                ff,
                "must lie in [0, 1)",
            ));
        }
        require_positive("erb_per_step", params.erb_per_step)?;
        require_positive("min_pole_hz", params.min_pole_hz)?;
        require_positive("erb_break_freq", params.erb_break_freq)?;
        require_positive("erb_q", params.erb_q)?;
        if params.erb_per_step >= params.erb_q {
            return Err(CarfacError::invalid(
                "erb_per_step",
                params.erb_per_step,
                "step would skip past zero frequency",
            ));
        }
        let top_hz = params.first_pole_theta * sample_rate / (2.0 * PI);
        if params.min_pole_hz >= top_hz {
            return Err(CarfacError::invalid(
                "min_pole_hz",
                params.min_pole_hz,
                "must be below the first pole frequency",
            ));
        }
        if params.num_channels == Some(0) {
            return Err(CarfacError::invalid("num_channels", 0.0, "must be positive"));
        }
        Ok(())
    }

    /// [`EarComponent::process_block`] that also returns the outer-hair-cell
    /// nonlinearity (1 at rest, toward 0 at high velocity) per sample.
    pub fn process_block_with_ohc(
        coeffs: &CarCoeffs,
        state: &mut CarState,
        input: CarInput<'_>,
    ) -> Result<(ChannelBlock, ChannelBlock), CarfacError> {
        let mut ohc = ChannelBlock::zeros(coeffs.num_channels(), input.audio.len());
        let bm = Car::run(coeffs, state, input, Some(&mut ohc))?;
        Ok((bm, ohc))
    }

    /// One block of the cascade. When `ohc` is given, the velocity
    /// nonlinearity of every channel is written to it sample by sample.
    fn run(
        coeffs: &CarCoeffs,
        state: &mut CarState,
        input: CarInput<'_>,
        mut ohc: Option<&mut ChannelBlock>,
    ) -> Result<ChannelBlock, CarfacError> {
        let n_ch = coeffs.num_channels();
        coeffs.check_channels()?;
        state.check_channels(n_ch)?;
        if input.damping.len() != n_ch {
            return Err(CarfacError::ChannelCountMismatch {
                expected: n_ch,
                found: input.damping.len(),
            });
        }
        require_finite(input.audio, 1)?;

        let n_samples = input.audio.len();
        let mut out = ChannelBlock::zeros(n_ch, n_samples);
        if n_samples == 0 {
            return Ok(out);
        }

        // Targets for this block's damping; zB and g ramp toward them.
        let mut clamped = 0u64;
        let mut zb_target = Vec::with_capacity(n_ch);
        let mut g_target = Vec::with_capacity(n_ch);
        for ch in 0..n_ch {
            let (d, moved) = clamp_damping(input.damping[ch]);
            clamped += moved as u64;
            let undamping = 1.0 - d;
            zb_target.push(coeffs.zr_coeffs[ch] * undamping);
            g_target.push(coeffs.stage_g_at(ch, undamping));
        }
        if clamped > 0 {
            trace!(clamped, "CAR damping adjustment clamped");
            state.clamp_count += clamped;
        }
        let steps = n_samples as f64;
        let dzb: Vec<f64> = (0..n_ch)
            .map(|ch| (zb_target[ch] - state.zb_memory[ch]) / steps)
            .collect();
        let dg: Vec<f64> = (0..n_ch)
            .map(|ch| (g_target[ch] - state.g_memory[ch]) / steps)
            .collect();

        let mut z1_next = vec![0.0; n_ch];
        for (t, &sample) in input.audio.iter().enumerate() {
            for ch in 0..n_ch {
                state.g_memory[ch] += dg[ch];
                state.zb_memory[ch] += dzb[ch];

                let z1 = state.z1_memory[ch];
                let z2 = state.z2_memory[ch];
                let velocity = z2 - state.za_memory[ch];
                let v = velocity * coeffs.velocity_scale + coeffs.v_offset;
                let nonlinear = 1.0 / (1.0 + v * v);
                if let Some(ohc) = ohc.as_mut() {
                    ohc.frame_mut(t)[ch] = nonlinear;
                }
                // zB * nonlinear is the undamping delta on r.
                let r = coeffs.r1_coeffs[ch] + state.zb_memory[ch] * nonlinear;
                state.za_memory[ch] = z2;

                let a0 = coeffs.a0_coeffs[ch];
                let c0 = coeffs.c0_coeffs[ch];
                z1_next[ch] = r * (a0 * z1 - c0 * z2);
                let z2_new = r * (c0 * z1 + a0 * z2);
                state.z2_memory[ch] = z2_new;
                state.zy_memory[ch] = coeffs.h_coeffs[ch] * z2_new;
            }

            // Ripple the input down the cascade; this is the only sequential part.
            let mut in_out = sample;
            for ch in 0..n_ch {
                state.z1_memory[ch] = z1_next[ch] + in_out;
                in_out = state.g_memory[ch] * (in_out + state.zy_memory[ch]);
                state.zy_memory[ch] = in_out;
            }
            out.frame_mut(t).copy_from_slice(&state.zy_memory);
        }

        // Land exactly on the targets so rounding never accumulates across blocks.
        state.zb_memory = zb_target;
        state.g_memory = g_target;

        Ok(out)
    }

    fn pole_frequencies(params: &CarParams, sample_rate: f64) -> Vec<f64> {
        let top_hz = params.first_pole_theta * sample_rate / (2.0 * PI);
        match params.num_channels {
            Some(n) => spaced_pole_frequencies(n, top_hz, params.min_pole_hz, params.erb_break_freq),
            None => stepped_pole_frequencies(
                top_hz,
                params.min_pole_hz,
                params.erb_per_step,
                params.erb_break_freq,
                params.erb_q,
            ),
        }
    }
}

impl EarComponent for Car {
    type Params = CarParams;
    type Coeffs = CarCoeffs;
    type State = CarState;
    type Input<'a> = CarInput<'a>;
    type Output = ChannelBlock;

    fn design(params: &CarParams, sample_rate: f64) -> Result<CarCoeffs, CarfacError> {
        Car::validate(params, sample_rate)?;
        let pole_freqs = Car::pole_frequencies(params, sample_rate);
        let n = pole_freqs.len();

        // In the book's circuit D, zero_ratio is 1/sqrt(a) with a = 1/(1+f), h = f*c.
        let f = params.zero_ratio * params.zero_ratio - 1.0;
        let ff = params.high_f_damping_compression;

        let mut coeffs = CarCoeffs {
            velocity_scale: params.velocity_scale,
            v_offset: params.v_offset,
            pole_freqs,
            r1_coeffs: Vec::with_capacity(n),
            a0_coeffs: Vec::with_capacity(n),
            c0_coeffs: Vec::with_capacity(n),
            h_coeffs: Vec::with_capacity(n),
            g0_coeffs: Vec::with_capacity(n),
            zr_coeffs: Vec::with_capacity(n),
        };

        for &pole_hz in &coeffs.pole_freqs {
            let theta = pole_hz * 2.0 * PI / sample_rate;
            let c0 = theta.sin();
            let a0 = theta.cos();
            // Compressed theta: equal to theta at ff = 0, reaches 0 at pi when ff = 1.
            let x = theta / PI;
            let zr_theta = PI * (x - ff * x * x * x);
            let r1 = 1.0 - zr_theta * params.max_zeta;
            // Pull min damping 25% toward ERB/f where channels spread out.
            let min_zeta = params.min_zeta
                + 0.25 * (erb_hz(pole_hz, params.erb_break_freq, params.erb_q) / pole_hz - params.min_zeta);
            let zr = zr_theta * (params.max_zeta - min_zeta);

            for r in [r1, r1 + zr] {
                if !(r.abs() < 1.0) {
                    return Err(CarfacError::invalid(
                        "pole_radius",
                        r,
                        "resonator would be unstable",
                    ));
                }
            }

            coeffs.c0_coeffs.push(c0);
            coeffs.a0_coeffs.push(a0);
            coeffs.r1_coeffs.push(r1);
            coeffs.zr_coeffs.push(zr);
            coeffs.h_coeffs.push(c0 * f);
        }

        coeffs.g0_coeffs = coeffs.stage_g(&vec![1.0; n]);

        debug!(
            channels = n,
            top_hz = coeffs.pole_freqs.first().copied().unwrap_or(0.0),
            bottom_hz = coeffs.pole_freqs.last().copied().unwrap_or(0.0),
            "designed CAR cascade"
        );
        Ok(coeffs)
    }

    fn init_state(coeffs: &CarCoeffs, num_channels: usize) -> Result<CarState, CarfacError> {
        if coeffs.num_channels() != num_channels {
            return Err(CarfacError::ChannelCountMismatch {
                expected: coeffs.num_channels(),
                found: num_channels,
            });
        }
        Ok(CarState {
            z1_memory: vec![0.0; num_channels],
            z2_memory: vec![0.0; num_channels],
            za_memory: vec![0.0; num_channels],
            zb_memory: coeffs.zr_coeffs.clone(),
            zy_memory: vec![0.0; num_channels],
            g_memory: coeffs.g0_coeffs.clone(),
            clamp_count: 0,
        })
    }

    fn process_block(
        coeffs: &CarCoeffs,
        state: &mut CarState,
        input: CarInput<'_>,
    ) -> Result<ChannelBlock, CarfacError> {
        Car::run(coeffs, state, input, None)
    }

    fn reset(coeffs: &CarCoeffs, state: &mut CarState) {
        state.z1_memory.fill(0.0);
        state.z2_memory.fill(0.0);
        state.za_memory.fill(0.0);
        state.zy_memory.fill(0.0);
        state.zb_memory.clone_from(&coeffs.zr_coeffs);
        state.g_memory.clone_from(&coeffs.g0_coeffs);
        state.clamp_count = 0;
    }
}
