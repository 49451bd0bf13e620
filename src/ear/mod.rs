//! The CARFAC auditory periphery model.
//!
//! A waveform enters the CAR cascade, whose basilar-membrane output drives the
//! IHC stage; the IHC output drives the AGC, which feeds damping back into the
//! CAR on the next block. [`Ear`] owns one such loop and [`Ears`] drives
//! several in lock-step.

pub mod agc;
pub mod block;
pub mod car;
pub mod component;
pub mod ear;
pub mod ears;
pub mod erb;
pub mod ihc;

pub use block::ChannelBlock;
pub use component::{Component, EarComponent};
pub use ear::{ClampCounts, Ear, EarOutput, OutputSelection};
pub use ears::{CrossEarCoupling, Ears};
