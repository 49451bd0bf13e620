//! One ear: CAR, IHC and AGC wired into a closed loop.
//!
//! Each block runs CAR then IHC then AGC. The damping adjustment the AGC
//! computes from block k is stored and handed to the CAR for block k+1, never
//! applied to block k itself.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::agc::{Agc, AgcState};
use super::block::ChannelBlock;
use super::car::{Car, CarInput};
use super::component::{Component, EarComponent};
use super::ihc::Ihc;
use crate::config::EarParams;
use crate::error::{CarfacError, require_positive};

/// Optional per-sample signals an ear records besides BM and NAP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSelection {
    /// Outer-hair-cell velocity nonlinearity of every channel.
    pub ohc: bool,
    /// Fastest AGC stage memory, before clamping.
    pub agc: bool,
    /// NAP averaged over each update period of the fastest AGC stage.
    pub nap_decim: bool,
}

/// What one ear produced for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarOutput {
    /// Basilar-membrane displacement per channel.
    pub bm: ChannelBlock,
    /// Neural activity pattern from the hair cells.
    pub nap: ChannelBlock,
    /// AGC feedback computed from this block, applied to the next one.
    pub damping: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ohc: Option<ChannelBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agc: Option<ChannelBlock>,
    /// One frame per fastest-stage AGC update that completed in the block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nap_decim: Option<ChannelBlock>,
}

impl EarOutput {
    /// No frames yet; the selected extras start as empty blocks.
    pub(crate) fn empty(num_channels: usize, outputs: OutputSelection, damping: Vec<f64>) -> Self {
        let extra = |on: bool| on.then(|| ChannelBlock::zeros(num_channels, 0));
        EarOutput {
            bm: ChannelBlock::zeros(num_channels, 0),
            nap: ChannelBlock::zeros(num_channels, 0),
            damping,
            ohc: extra(outputs.ohc),
            agc: extra(outputs.agc),
            nap_decim: extra(outputs.nap_decim),
        }
    }

    /// Concatenate a later block; its feedback replaces ours.
    pub(crate) fn append(&mut self, later: EarOutput) {
        self.bm.append(&later.bm);
        self.nap.append(&later.nap);
        for (acc, more) in [
            (&mut self.ohc, &later.ohc),
            (&mut self.agc, &later.agc),
            (&mut self.nap_decim, &later.nap_decim),
        ] {
            if let (Some(acc), Some(more)) = (acc.as_mut(), more) {
                acc.append(more);
            }
        }
        self.damping = later.damping;
    }
}

/// Running totals of values each stage had to clamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClampCounts {
    pub car: u64,
    pub ihc: u64,
    pub agc: u64,
}

#[derive(Debug, Clone)]
pub struct Ear {
    sample_rate: f64,
    car: Component<Car>,
    ihc: Component<Ihc>,
    agc: Component<Agc>,
    /// Feedback waiting to be applied to the next block.
    damping: Vec<f64>,
    open_loop: bool,
    outputs: OutputSelection,
    /// NAP summed since the fastest AGC stage last updated.
    nap_accum: Vec<f64>,
}

impl Ear {
    pub fn new(params: &EarParams) -> Result<Self, CarfacError> {
        let fs = require_positive("sample_rate", params.sample_rate)?;
        let car_coeffs = Car::design(&params.car, fs)?;
        let n = car_coeffs.num_channels();
        let car = Component::<Car>::from_coeffs(params.car.clone(), car_coeffs, n)?;
        let ihc = Component::<Ihc>::new(params.ihc.clone(), fs, n)?;
        let agc = Component::<Agc>::new(params.agc.clone(), fs, n)?;
        debug!(sample_rate = fs, channels = n, outputs = ?params.outputs, "ear ready");
        Ok(Ear {
            sample_rate: fs,
            car,
            ihc,
            agc,
            damping: vec![0.0; n],
            open_loop: false,
            outputs: params.outputs,
            nap_accum: vec![0.0; n],
        })
    }

    /// Run one block through the loop and store its feedback for the next.
    pub fn process_block(&mut self, audio: &[f64]) -> Result<EarOutput, CarfacError> {
        let out = self.run_block(audio)?;
        self.close_loop(&out.damping);
        Ok(out)
    }

    /// CAR, IHC and AGC for one block, without touching the pending feedback.
    pub(crate) fn run_block(&mut self, audio: &[f64]) -> Result<EarOutput, CarfacError> {
        let car_input = CarInput {
            audio,
            damping: &self.damping,
        };
        let (bm, ohc) = if self.outputs.ohc {
            let (coeffs, state) = self.car.parts_mut();
            let (bm, ohc) = Car::process_block_with_ohc(coeffs, state, car_input)?;
            (bm, Some(ohc))
        } else {
            (self.car.process(car_input)?, None)
        };
        let nap = self.ihc.process(&bm)?;
        let phase = self.agc.state().stages.first().map_or(0, |s| s.decim_phase);
        let (damping, agc) = if self.outputs.agc {
            let (coeffs, state) = self.agc.parts_mut();
            let (damping, memory) = Agc::process_block_with_memory(coeffs, state, &nap)?;
            (damping, Some(memory))
        } else {
            (self.agc.process(&nap)?, None)
        };
        let nap_decim = self.outputs.nap_decim.then(|| self.decimate_nap(&nap, phase));
        Ok(EarOutput {
            bm,
            nap,
            damping,
            ohc,
            agc,
            nap_decim,
        })
    }

    /// Average NAP over each update period of the fastest AGC stage, which
    /// was at decimation phase `phase` when the block started.
    fn decimate_nap(&mut self, nap: &ChannelBlock, mut phase: usize) -> ChannelBlock {
        let decim = self.agc.coeffs().stages.first().map_or(1, |s| s.decimation.max(1));
        let mut out = ChannelBlock::zeros(self.nap_accum.len(), 0);
        for frame in nap.frames() {
            for (acc, &x) in self.nap_accum.iter_mut().zip(frame) {
                *acc += x;
            }
            phase = (phase + 1) % decim;
            if phase == 0 {
                let mean: Vec<f64> = self.nap_accum.iter().map(|a| a / decim as f64).collect();
                out.push_frame(&mean);
                self.nap_accum.fill(0.0);
            }
        }
        out
    }

    /// Latch the feedback for the next block. Open loop keeps it neutral.
    pub(crate) fn close_loop(&mut self, damping: &[f64]) {
        if self.open_loop {
            self.damping.fill(0.0);
        } else {
            self.damping.copy_from_slice(damping);
        }
    }

    /// Process a whole waveform in blocks of `block_len` samples (the last
    /// one may be shorter) and concatenate the results. `damping` is the
    /// last block's AGC output, or the pending feedback if `samples` is empty.
    pub fn process_waveform(&mut self, samples: &[f64], block_len: usize) -> Result<EarOutput, CarfacError> {
        if block_len == 0 {
            return Err(CarfacError::invalid("block_len", 0.0, "must be at least one sample"));
        }
        let mut merged = EarOutput::empty(self.num_channels(), self.outputs, self.damping.clone());
        for chunk in samples.chunks(block_len) {
            merged.append(self.process_block(chunk)?);
        }
        Ok(merged)
    }

    /// Back to the state of a freshly built ear. The open-loop flag is kept.
    pub fn reset(&mut self) {
        self.car.reset();
        self.ihc.reset();
        self.agc.reset();
        self.damping.fill(0.0);
        self.nap_accum.fill(0.0);
    }

    /// With `open_loop` the AGC keeps adapting but the CAR always sees
    /// neutral feedback.
    pub fn set_open_loop(&mut self, open_loop: bool) {
        self.open_loop = open_loop;
        if open_loop {
            self.damping.fill(0.0);
        }
    }

    pub fn is_open_loop(&self) -> bool {
        self.open_loop
    }

    pub fn outputs(&self) -> OutputSelection {
        self.outputs
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> usize {
        self.car.num_channels()
    }

    /// Pole frequency of each channel in Hz, highest first.
    pub fn pole_frequencies(&self) -> &[f64] {
        &self.car.coeffs().pole_freqs
    }

    pub fn max_channels_per_octave(&self) -> f64 {
        self.car.coeffs().max_channels_per_octave()
    }

    /// Feedback the CAR will use on the next block.
    pub fn damping_adjustment(&self) -> &[f64] {
        &self.damping
    }

    pub fn clamp_counts(&self) -> ClampCounts {
        ClampCounts {
            car: self.car.state().clamp_count,
            ihc: self.ihc.state().clamp_count,
            agc: self.agc.state().clamp_count,
        }
    }

    pub fn car(&self) -> &Component<Car> {
        &self.car
    }

    pub fn ihc(&self) -> &Component<Ihc> {
        &self.ihc
    }

    pub fn agc(&self) -> &Component<Agc> {
        &self.agc
    }

    pub(crate) fn agc_state_mut(&mut self) -> &mut AgcState {
        self.agc.state_mut()
    }
}
