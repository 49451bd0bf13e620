//! A group of ears advanced in lock-step, with optional binaural AGC coupling.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::agc::{Agc, AgcCoeffs, AgcState};
use super::ear::{Ear, EarOutput};
use crate::config::EarsConfig;
use crate::error::{CarfacError, require_finite};

/// How AGC memories are mixed across ears once every ear has run a block.
///
/// Each stage memory moves toward the across-ear mean by the stage's weight:
/// `memory += w * (mean - memory)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossEarCoupling {
    /// Ears run independently.
    #[default]
    None,
    /// Per-stage weights from `agc_mix_coeff`; the fastest stage is not mixed.
    Designed,
    /// The same weight in `[0, 1]` for every stage.
    Uniform(f64),
}

impl CrossEarCoupling {
    fn validate(self) -> Result<(), CarfacError> {
        match self {
            CrossEarCoupling::Uniform(w) if !(0.0..=1.0).contains(&w) => Err(CarfacError::invalid(
                "coupling",
                w,
                "uniform weight must lie in [0, 1]",
            )),
            _ => Ok(()),
        }
    }

    /// Mixing weight for one stage over a block of `block_len` samples.
    ///
    /// `Designed` compounds the per-update coefficient over the stage's
    /// updates in the block, `1 - (1 - w)^(block_len / decimation)`, so the
    /// coupling per second does not depend on block size. `Uniform` is a
    /// per-block weight.
    pub fn stage_weight(self, coeffs: &AgcCoeffs, stage: usize, block_len: usize) -> f64 {
        match self {
            CrossEarCoupling::None => 0.0,
            CrossEarCoupling::Designed => {
                let per_update = coeffs.stages[stage].mix_coeff.clamp(0.0, 1.0);
                let updates = block_len as f64 / coeffs.cumulative_decimation(stage).max(1) as f64;
                1.0 - (1.0 - per_update).powf(updates)
            }
            CrossEarCoupling::Uniform(w) => w,
        }
    }
}

/// Pull every ear's stage memories toward their across-ear mean, with the
/// weights `coupling` gives for a block of `block_len` samples.
pub fn mix_agc_memories(
    coupling: CrossEarCoupling,
    coeffs: &AgcCoeffs,
    states: &mut [&mut AgcState],
    block_len: usize,
) -> Result<(), CarfacError> {
    let Some(first) = states.first() else {
        return Ok(());
    };
    let n_ch = first.num_channels();
    for state in states.iter() {
        state.check(coeffs)?;
        if state.num_channels() != n_ch {
            return Err(CarfacError::ChannelCountMismatch {
                expected: n_ch,
                found: state.num_channels(),
            });
        }
    }
    if states.len() < 2 {
        return Ok(());
    }
    let n_ears = states.len() as f64;
    for stage in 0..coeffs.num_stages() {
        let w = coupling.stage_weight(coeffs, stage, block_len);
        if w == 0.0 {
            continue;
        }
        for ch in 0..n_ch {
            let mean = states.iter().map(|s| s.stages[stage].memory[ch]).sum::<f64>() / n_ears;
            for state in states.iter_mut() {
                let m = &mut state.stages[stage].memory[ch];
                *m += w * (mean - *m);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Ears {
    ears: Vec<Ear>,
    coupling: CrossEarCoupling,
}

impl Ears {
    pub fn new(config: &EarsConfig) -> Result<Self, CarfacError> {
        if config.num_ears == 0 {
            return Err(CarfacError::invalid("num_ears", 0.0, "need at least one ear"));
        }
        config.coupling.validate()?;
        let ears = (0..config.num_ears)
            .map(|_| Ear::new(&config.ear))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(ears = ears.len(), coupling = ?config.coupling, "ear group ready");
        Ok(Ears {
            ears,
            coupling: config.coupling,
        })
    }

    /// Advance every ear by one block, in index order. All inputs are
    /// checked before any ear runs, so an error leaves every ear untouched.
    pub fn process_block(&mut self, inputs: &[&[f64]]) -> Result<Vec<EarOutput>, CarfacError> {
        if inputs.len() != self.ears.len() {
            return Err(CarfacError::EarCountMismatch {
                expected: self.ears.len(),
                found: inputs.len(),
            });
        }
        let block_len = inputs[0].len();
        if let Some(bad) = inputs.iter().find(|x| x.len() != block_len) {
            return Err(CarfacError::BlockLengthMismatch {
                expected: block_len,
                found: bad.len(),
            });
        }
        for audio in inputs {
            require_finite(audio, 1)?;
        }

        let mut outputs = self
            .ears
            .iter_mut()
            .zip(inputs)
            .map(|(ear, audio)| ear.run_block(audio))
            .collect::<Result<Vec<_>, _>>()?;

        if self.coupling != CrossEarCoupling::None && self.ears.len() > 1 {
            let coeffs = self.ears[0].agc().coeffs().clone();
            let mut states: Vec<&mut AgcState> = self.ears.iter_mut().map(|e| e.agc_state_mut()).collect();
            mix_agc_memories(self.coupling, &coeffs, &mut states, block_len)?;
            for (ear, out) in self.ears.iter().zip(outputs.iter_mut()) {
                out.damping = Agc::clamp_feedback(&coeffs, ear.agc().state()).0;
            }
        }

        for (ear, out) in self.ears.iter_mut().zip(&outputs) {
            ear.close_loop(&out.damping);
        }
        Ok(outputs)
    }

    /// Process equal-length waveforms, one per ear, in blocks of `block_len`.
    pub fn process_waveforms(&mut self, inputs: &[&[f64]], block_len: usize) -> Result<Vec<EarOutput>, CarfacError> {
        if block_len == 0 {
            return Err(CarfacError::invalid("block_len", 0.0, "must be at least one sample"));
        }
        if inputs.len() != self.ears.len() {
            return Err(CarfacError::EarCountMismatch {
                expected: self.ears.len(),
                found: inputs.len(),
            });
        }
        let total = inputs[0].len();
        if let Some(bad) = inputs.iter().find(|x| x.len() != total) {
            return Err(CarfacError::BlockLengthMismatch {
                expected: total,
                found: bad.len(),
            });
        }

        let mut merged: Vec<EarOutput> = self
            .ears
            .iter()
            .map(|ear| EarOutput::empty(ear.num_channels(), ear.outputs(), ear.damping_adjustment().to_vec()))
            .collect();
        let mut start = 0;
        while start < total {
            let end = (start + block_len).min(total);
            let blocks: Vec<&[f64]> = inputs.iter().map(|x| &x[start..end]).collect();
            for (acc, out) in merged.iter_mut().zip(self.process_block(&blocks)?) {
                acc.append(out);
            }
            start = end;
        }
        Ok(merged)
    }

    pub fn reset(&mut self) {
        for ear in &mut self.ears {
            ear.reset();
        }
    }

    pub fn set_open_loop(&mut self, open_loop: bool) {
        for ear in &mut self.ears {
            ear.set_open_loop(open_loop);
        }
    }

    pub fn coupling(&self) -> CrossEarCoupling {
        self.coupling
    }

    pub fn num_ears(&self) -> usize {
        self.ears.len()
    }

    pub fn ear(&self, index: usize) -> Option<&Ear> {
        self.ears.get(index)
    }

    pub fn ears(&self) -> &[Ear] {
        &self.ears
    }
}
