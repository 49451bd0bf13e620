//! AGC: multi-timescale automatic gain control.
//!
//! A chain of leaky integrators, fastest first, each running at a
//! progressively decimated rate. Every stage smooths its input in time and
//! then across neighbouring channels; slower stages feed back into faster
//! ones with `agc_stage_gain`, so the fastest stage's memory carries the
//! weighted sum of all time scales. That memory, clamped, is the damping
//! adjustment sent back to the CAR.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::block::ChannelBlock;
use super::car::MAX_DAMPING_ADJUSTMENT;
use super::component::EarComponent;
use crate::error::{CarfacError, require_finite, require_positive};

/// Upper limit on repeated FIR passes before design gives up.
const MAX_SPATIAL_ITERATIONS: usize = 16;

/// At this many FIR passes the double-exponential smoother is cheaper.
const DOUBLE_EXPONENTIAL_ITERATIONS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgcParams {
    /// Seconds, one per stage, strictly increasing.
    pub time_constants: Vec<f64>,
    /// Gain from each stage into the next faster one.
    pub agc_stage_gain: f64,
    /// Update decimation of each stage relative to the previous one.
    pub decimation: Vec<usize>,
    /// Spatial spread toward the apex, in channels.
    pub agc1_scales: Vec<f64>,
    /// Spatial spread toward the base, in channels.
    pub agc2_scales: Vec<f64>,
    /// Cross-ear mixing strength.
    pub agc_mix_coeff: f64,
    /// Ceiling of the feedback signal, at most [`MAX_DAMPING_ADJUSTMENT`].
    pub max_damping_adjustment: f64,
}

impl Default for AgcParams {
    fn default() -> Self {
        AgcParams {
            time_constants: vec![0.002, 0.008, 0.032, 0.128],
            agc_stage_gain: 2.0,
            decimation: vec![8, 2, 2, 2],
            agc1_scales: vec![1.0, 1.4, 2.0, 2.8],
            agc2_scales: vec![1.6, 2.25, 3.2, 4.5],
            agc_mix_coeff: 0.5,
            max_damping_adjustment: MAX_DAMPING_ADJUSTMENT,
        }
    }
}

impl AgcParams {
    pub fn num_stages(&self) -> usize {
        self.time_constants.len()
    }
}

/// Designed constants for one smoothing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgcStageCoeffs {
    /// Decimation relative to the previous stage.
    pub decimation: usize,
    /// Fraction of new input taken per update, about 1/(tau*fs).
    pub epsilon: f64,
    pub pole_z1: f64,
    pub pole_z2: f64,
    pub spatial_n_taps: usize,
    pub spatial_iterations: usize,
    /// Left, centre and right weights; outer ones are doubled up for 5 taps.
    pub spatial_fir: [f64; 3],
    /// Cross-ear mixing weight per update.
    pub mix_coeff: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgcCoeffs {
    pub stages: Vec<AgcStageCoeffs>,
    pub agc_stage_gain: f64,
    /// Normalises the input so a steady input maps to the same steady output.
    pub detect_scale: f64,
    pub max_damping_adjustment: f64,
}

impl AgcCoeffs {
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Input samples per update of `stage`.
    pub fn cumulative_decimation(&self, stage: usize) -> usize {
        self.stages[..=stage].iter().map(|s| s.decimation).product()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgcStageState {
    pub memory: Vec<f64>,
    pub input_accum: Vec<f64>,
    pub decim_phase: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgcState {
    pub stages: Vec<AgcStageState>,
    /// Feedback values pulled back into `[0, max_damping_adjustment]`.
    pub clamp_count: u64,
}

impl AgcState {
    pub fn num_channels(&self) -> usize {
        self.stages.first().map_or(0, |s| s.memory.len())
    }

    /// Whether this state fits `coeffs`: same stage count, every stage
    /// vector `num_channels` long, and a usable decimation per stage.
    pub fn check(&self, coeffs: &AgcCoeffs) -> Result<(), CarfacError> {
        if self.stages.len() != coeffs.num_stages() {
            return Err(CarfacError::StageCountMismatch {
                expected: coeffs.num_stages(),
                found: self.stages.len(),
            });
        }
        if let Some(stage) = coeffs.stages.iter().find(|s| s.decimation == 0) {
            return Err(CarfacError::invalid(
                "decimation",
                stage.decimation as f64,
                "must be at least 1",
            ));
        }
        let n = self.num_channels();
        for stage in &self.stages {
            for v in [&stage.memory, &stage.input_accum] {
                if v.len() != n {
                    return Err(CarfacError::ChannelCountMismatch {
                        expected: n,
                        found: v.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// FIR weights matching the mean and variance of the target spread.
/// Returns the weights and whether the centre tap stays large enough.
fn design_fir(n_taps: usize, var: f64, mean: f64, n_iter: usize) -> ([f64; 3], bool) {
    let mn = mean / n_iter as f64;
    let var = var / n_iter as f64;
    if n_taps == 3 {
        let a = (var + mn * mn - mn) / 2.0;
        let b = (var + mn * mn + mn) / 2.0;
        let fir = [a, 1.0 - a - b, b];
        (fir, fir[1] >= 0.2)
    } else {
        // Outer taps are implicitly duplicated to make [a/2, a/2, 1-a-b, b/2, b/2].
        let a = ((var + mn * mn) * 2.0 / 5.0 - mn * 2.0 / 3.0) / 2.0;
        let b = ((var + mn * mn) * 2.0 / 5.0 + mn * 2.0 / 3.0) / 2.0;
        let fir = [a / 2.0, 1.0 - a - b, b / 2.0];
        (fir, fir[1] >= 0.1)
    }
}

fn validate(params: &AgcParams, sample_rate: f64) -> Result<(), CarfacError> {
    require_positive("sample_rate", sample_rate)?;
    let n = params.num_stages();
    if n == 0 {
        return Err(CarfacError::invalid("time_constants", 0.0, "need at least one stage"));
    }
    for (name, len) in [
        ("decimation", params.decimation.len()),
        ("agc1_scales", params.agc1_scales.len()),
        ("agc2_scales", params.agc2_scales.len()),
    ] {
        if len != n {
            return Err(CarfacError::invalid(name, len as f64, "length must match time_constants"));
        }
    }
    let mut prev = 0.0;
    for &tau in &params.time_constants {
        require_positive("time_constants", tau)?;
        if tau <= prev {
            return Err(CarfacError::invalid(
                "time_constants",
                tau,
                "must be strictly increasing, fastest first",
            ));
        }
        prev = tau;
    }
    if let Some(&d) = params.decimation.iter().find(|&&d| d == 0) {
        return Err(CarfacError::invalid("decimation", d as f64, "must be at least 1"));
    }
    for &s in params.agc1_scales.iter().chain(&params.agc2_scales) {
        require_positive("agc_scales", s)?;
    }
    require_positive("agc_stage_gain", params.agc_stage_gain)?;
    if !params.agc_mix_coeff.is_finite() || params.agc_mix_coeff < 0.0 {
        return Err(CarfacError::invalid(
            "agc_mix_coeff",
            params.agc_mix_coeff,
            "must be finite and non-negative",
        ));
    }
    require_positive("max_damping_adjustment", params.max_damping_adjustment)?;
    if params.max_damping_adjustment > MAX_DAMPING_ADJUSTMENT {
        return Err(CarfacError::invalid(
            "max_damping_adjustment",
            params.max_damping_adjustment,
            "exceeds the stable damping range",
        ));
    }
    Ok(())
}

fn design_stage(
    params: &AgcParams,
    stage: usize,
    decim: f64,
    sample_rate: f64,
) -> Result<AgcStageCoeffs, CarfacError> {
    let tau = params.time_constants[stage];
    // Effective number of smoothings in a time constant, typically 5 to 50.
    let ntimes = tau * (sample_rate / decim);
    // Target spread (variance) and delay (mean) of the impulse response,
    // as a distribution convolved ntimes.
    let delay = (params.agc2_scales[stage] - params.agc1_scales[stage]) / ntimes;
    let spread_sq = (params.agc1_scales[stage].powi(2) + params.agc2_scales[stage].powi(2)) / ntimes;

    // Pole that gives the spread when used once in each direction.
    let u = 1.0 + 1.0 / spread_sq;
    let p = u - (u * u - 1.0).sqrt();
    let dp = delay * (1.0 - 2.0 * p + p * p) / 2.0;

    let mut n_taps = 3;
    let mut n_iterations = 1;
    let fir = loop {
        let (fir, ok) = design_fir(n_taps, spread_sq, delay, n_iterations);
        if ok {
            break fir;
        }
        if n_taps == 3 {
            n_taps = 5;
        } else {
            n_iterations += 1;
            if n_iterations > MAX_SPATIAL_ITERATIONS {
                return Err(CarfacError::invalid(
                    "agc_scales",
                    spread_sq,
                    "spatial spread too wide for the FIR smoother",
                ));
            }
        }
    };

    let mix_coeff = if stage == 0 {
        0.0
    } else {
        params.agc_mix_coeff / ntimes
    };

    Ok(AgcStageCoeffs {
        decimation: params.decimation[stage],
        epsilon: 1.0 - (-decim / (tau * sample_rate)).exp(),
        pole_z1: p - dp,
        pole_z2: p + dp,
        spatial_n_taps: n_taps,
        spatial_iterations: n_iterations,
        spatial_fir: fir,
        mix_coeff,
    })
}

/// Smooth `values` across channels in place, using `scratch` as the tap source.
fn spatial_smooth(stage: &AgcStageCoeffs, values: &mut [f64], scratch: &mut Vec<f64>) {
    let n = values.len();
    if n == 0 {
        return;
    }
    if stage.spatial_iterations >= DOUBLE_EXPONENTIAL_ITERATIONS {
        smooth_double_exponential(stage.pole_z1, stage.pole_z2, values);
        return;
    }
    let [left, mid, right] = stage.spatial_fir;
    // Edges replicate the end channels.
    let at = |src: &[f64], i: isize| src[i.clamp(0, n as isize - 1) as usize];
    for _ in 0..stage.spatial_iterations {
        scratch.clear();
        scratch.extend_from_slice(values);
        let src: &[f64] = scratch;
        for (i, v) in values.iter_mut().enumerate() {
            let j = i as isize;
            *v = if stage.spatial_n_taps == 3 {
                left * at(src, j - 1) + mid * src[i] + right * at(src, j + 1)
            } else {
                left * (at(src, j - 2) + at(src, j - 1))
                    + mid * src[i]
                    + right * (at(src, j + 1) + at(src, j + 2))
            };
        }
    }
}

/// Two-pass one-pole smoother: backward with `pole_z2`, then forward with
/// `pole_z1`. The backward pass is seeded from the last few channels.
pub fn smooth_double_exponential(pole_z1: f64, pole_z2: f64, values: &mut [f64]) {
    let n = values.len();
    let mut state = 0.0;
    for &x in &values[n.saturating_sub(11)..] {
        state += (1.0 - pole_z1) * (x - state);
    }
    for v in values.iter_mut().rev() {
        state += (1.0 - pole_z2) * (*v - state);
        *v = state;
    }
    for v in values.iter_mut() {
        state += (1.0 - pole_z1) * (*v - state);
        *v = state;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Agc;

impl Agc {
    /// Fastest-stage memory clamped to `[0, max_damping_adjustment]`, with
    /// the number of values that had to move. Leaves `state` untouched.
    pub fn clamp_feedback(coeffs: &AgcCoeffs, state: &AgcState) -> (Vec<f64>, u64) {
        let max = coeffs.max_damping_adjustment;
        let mut clamped = 0u64;
        let fastest = state.stages.first().map_or(&[][..], |s| s.memory.as_slice());
        let out = fastest
            .iter()
            .map(|&m| {
                if m.is_nan() || m > max {
                    clamped += 1;
                    max
                } else if m < 0.0 {
                    clamped += 1;
                    0.0
                } else {
                    m
                }
            })
            .collect();
        (out, clamped)
    }

    /// The feedback signal for the CAR. Clamps are counted in `state`.
    pub fn damping_adjustment(coeffs: &AgcCoeffs, state: &mut AgcState) -> Vec<f64> {
        let (out, clamped) = Agc::clamp_feedback(coeffs, state);
        if clamped > 0 {
            trace!(clamped, "AGC feedback clamped");
            state.clamp_count += clamped;
        }
        out
    }

    /// [`EarComponent::process_block`] that also returns the fastest stage's
    /// memory after every input sample, before clamping.
    pub fn process_block_with_memory(
        coeffs: &AgcCoeffs,
        state: &mut AgcState,
        input: &ChannelBlock,
    ) -> Result<(Vec<f64>, ChannelBlock), CarfacError> {
        let mut memory = ChannelBlock::zeros(state.num_channels(), input.num_samples());
        let adjustment = Agc::run(coeffs, state, input, Some(&mut memory))?;
        Ok((adjustment, memory))
    }

    fn run(
        coeffs: &AgcCoeffs,
        state: &mut AgcState,
        input: &ChannelBlock,
        mut memory: Option<&mut ChannelBlock>,
    ) -> Result<Vec<f64>, CarfacError> {
        state.check(coeffs)?;
        let n_ch = state.num_channels();
        if input.num_channels() != n_ch {
            return Err(CarfacError::ChannelCountMismatch {
                expected: n_ch,
                found: input.num_channels(),
            });
        }
        require_finite(input.as_slice(), n_ch)?;
        let mut stage_inputs = vec![vec![0.0; n_ch]; coeffs.num_stages()];
        let mut scratch = Vec::with_capacity(n_ch);
        for (t, frame) in input.frames().enumerate() {
            Agc::step(coeffs, state, frame, &mut stage_inputs, &mut scratch);
            if let (Some(memory), Some(fastest)) = (memory.as_mut(), state.stages.first()) {
                memory.frame_mut(t).copy_from_slice(&fastest.memory);
            }
        }
        Ok(Agc::damping_adjustment(coeffs, state))
    }

    /// Advance every stage by one input frame.
    fn step(
        coeffs: &AgcCoeffs,
        state: &mut AgcState,
        frame: &[f64],
        stage_inputs: &mut [Vec<f64>],
        scratch: &mut Vec<f64>,
    ) {
        let n_stages = coeffs.num_stages();
        let mut deepest = None;

        // Accumulate downward until a stage is not on its decimation phase.
        for s in 0..n_stages {
            let decim = coeffs.stages[s].decimation;
            let (done, rest) = stage_inputs.split_at_mut(s);
            let st = &mut state.stages[s];
            match done.last() {
                None => {
                    for (acc, &x) in st.input_accum.iter_mut().zip(frame) {
                        *acc += coeffs.detect_scale * x;
                    }
                }
                Some(prev) => {
                    for (acc, &x) in st.input_accum.iter_mut().zip(prev) {
                        *acc += x;
                    }
                }
            }
            st.decim_phase = (st.decim_phase + 1) % decim;
            if st.decim_phase != 0 {
                break;
            }
            let decimated = &mut rest[0];
            for (d, acc) in decimated.iter_mut().zip(st.input_accum.iter_mut()) {
                *d = *acc / decim as f64;
                *acc = 0.0;
            }
            deepest = Some(s);
        }

        let Some(deepest) = deepest else {
            return;
        };

        // Update from the slowest active stage back up to the fastest.
        for s in (0..=deepest).rev() {
            if s + 1 < n_stages {
                let slower = &state.stages[s + 1].memory;
                for (x, &m) in stage_inputs[s].iter_mut().zip(slower) {
                    *x += coeffs.agc_stage_gain * m;
                }
            }
            let stage = &coeffs.stages[s];
            let memory = &mut state.stages[s].memory;
            for (m, &x) in memory.iter_mut().zip(&stage_inputs[s]) {
                *m += stage.epsilon * (x - *m);
            }
            spatial_smooth(stage, memory, scratch);
        }
    }
}

impl EarComponent for Agc {
    type Params = AgcParams;
    type Coeffs = AgcCoeffs;
    type State = AgcState;
    type Input<'a> = &'a ChannelBlock;
    type Output = Vec<f64>;

    fn design(params: &AgcParams, sample_rate: f64) -> Result<AgcCoeffs, CarfacError> {
        validate(params, sample_rate)?;
        let mut stages = Vec::with_capacity(params.num_stages());
        let mut decim = 1.0;
        let mut total_dc_gain = 0.0;
        for stage in 0..params.num_stages() {
            decim *= params.decimation[stage] as f64;
            let coeffs = design_stage(params, stage, decim, sample_rate)?;
            debug!(
                stage,
                taps = coeffs.spatial_n_taps,
                iterations = coeffs.spatial_iterations,
                epsilon = coeffs.epsilon,
                "designed AGC stage"
            );
            stages.push(coeffs);
            total_dc_gain += params.agc_stage_gain.powi(stage as i32);
        }
        Ok(AgcCoeffs {
            stages,
            agc_stage_gain: params.agc_stage_gain,
            detect_scale: 1.0 / total_dc_gain,
            max_damping_adjustment: params.max_damping_adjustment,
        })
    }

    fn init_state(coeffs: &AgcCoeffs, num_channels: usize) -> Result<AgcState, CarfacError> {
        let stages = coeffs
            .stages
            .iter()
            .map(|_| AgcStageState {
                memory: vec![0.0; num_channels],
                input_accum: vec![0.0; num_channels],
                decim_phase: 0,
            })
            .collect();
        Ok(AgcState {
            stages,
            clamp_count: 0,
        })
    }

    fn process_block(
        coeffs: &AgcCoeffs,
        state: &mut AgcState,
        input: &ChannelBlock,
    ) -> Result<Vec<f64>, CarfacError> {
        Agc::run(coeffs, state, input, None)
    }

    fn reset(_coeffs: &AgcCoeffs, state: &mut AgcState) {
        for stage in &mut state.stages {
            stage.memory.fill(0.0);
            stage.input_accum.fill(0.0);
            stage.decim_phase = 0;
        }
        state.clamp_count = 0;
    }
}
