pub mod config;
pub mod ear;
pub mod error;

pub use config::{EarParams, EarsConfig};
pub use ear::agc::{Agc, AgcParams};
pub use ear::car::{Car, CarParams};
pub use ear::ihc::{Ihc, IhcParams};
pub use ear::{
    ChannelBlock, ClampCounts, Component, CrossEarCoupling, Ear, EarComponent, EarOutput, Ears, OutputSelection,
};
pub use error::CarfacError;

use wasm_bindgen::prelude::*;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the carfac-core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// Run an interleaved multi-ear waveform through a freshly built ear group.
/// `samples` holds `num_ears` interleaved streams.
pub fn process_interleaved(
    config: &EarsConfig,
    samples: &[f64],
    block_len: usize,
) -> Result<Vec<EarOutput>, CarfacError> {
    let n = config.num_ears.max(1);
    if samples.len() % n != 0 {
        return Err(CarfacError::InvalidParameter {
            name: "samples",
            value: samples.len() as f64,
            reason: "length must be a multiple of num_ears",
        });
    }
    let streams: Vec<Vec<f64>> = (0..n)
        .map(|ear| samples.iter().skip(ear).step_by(n).copied().collect())
        .collect();
    let inputs: Vec<&[f64]> = streams.iter().map(Vec::as_slice).collect();
    let mut ears = Ears::new(config)?;
    ears.process_waveforms(&inputs, block_len)
}

/// WASM-exposed: run `samples` (interleaved when `num_ears > 1`) through the
/// model described by `config_json`, returning one BM/NAP output per ear.
#[wasm_bindgen]
pub fn process_waveform(samples: &[f32], config_json: &str, block_len: usize) -> Result<JsValue, JsValue> {
    let config = EarsConfig::from_json(config_json).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    let samples: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    let outputs =
        process_interleaved(&config, &samples, block_len).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    serde_wasm_bindgen::to_value(&outputs).map_err(|e| JsValue::from_str(&format!("{e}")))
}
