//! JSON-loadable parameter bundles.
//!
//! Every field has a default, so a partial document such as
//! `{"sample_rate": 16000, "car": {"num_channels": 40}}` is a valid config.

use serde::{Deserialize, Serialize};

use crate::ear::agc::AgcParams;
use crate::ear::car::CarParams;
use crate::ear::ear::OutputSelection;
use crate::ear::ears::CrossEarCoupling;
use crate::ear::ihc::IhcParams;
use crate::error::CarfacError;

/// Everything needed to build one [`Ear`](crate::Ear). All three stages run
/// at the single `sample_rate` given here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarParams {
    pub sample_rate: f64,
    pub car: CarParams,
    pub agc: AgcParams,
    pub ihc: IhcParams,
    /// Extra per-sample signals to record alongside BM and NAP.
    pub outputs: OutputSelection,
}

impl Default for EarParams {
    fn default() -> Self {
        EarParams {
            sample_rate: 22050.0,
            car: CarParams::default(),
            agc: AgcParams::default(),
            ihc: IhcParams::default(),
            outputs: OutputSelection::default(),
        }
    }
}

impl EarParams {
    pub fn from_json(json: &str) -> Result<Self, CarfacError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, CarfacError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A group of identically configured ears driven in lock-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarsConfig {
    pub ear: EarParams,
    pub num_ears: usize,
    pub coupling: CrossEarCoupling,
}

impl Default for EarsConfig {
    fn default() -> Self {
        EarsConfig {
            ear: EarParams::default(),
            num_ears: 1,
            coupling: CrossEarCoupling::None,
        }
    }
}

impl EarsConfig {
    pub fn from_json(json: &str) -> Result<Self, CarfacError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, CarfacError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let params = EarParams::from_json(r#"{"sample_rate": 16000, "car": {"num_channels": 40}}"#).unwrap();
        assert_eq!(params.sample_rate, 16000.0);
        assert_eq!(params.car.num_channels, Some(40));
        assert_eq!(params.car.max_zeta, CarParams::default().max_zeta);
        assert_eq!(params.agc, AgcParams::default());
        assert_eq!(params.ihc, IhcParams::default());
    }

    #[test]
    fn empty_object_is_default() {
        assert_eq!(EarParams::from_json("{}").unwrap(), EarParams::default());
        assert_eq!(EarsConfig::from_json("{}").unwrap(), EarsConfig::default());
    }

    #[test]
    fn ears_config_survives_json() {
        let config = EarsConfig {
            num_ears: 2,
            coupling: CrossEarCoupling::Uniform(0.25),
            ..Default::default()
        };
        let json = config.to_json().unwrap();
        assert!(json.contains("\"num_ears\": 2"), "got {json}");
        assert_eq!(EarsConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn coupling_parses_from_lowercase_names() {
        let config = EarsConfig::from_json(r#"{"num_ears": 2, "coupling": "designed"}"#).unwrap();
        assert_eq!(config.coupling, CrossEarCoupling::Designed);
        let config = EarsConfig::from_json(r#"{"coupling": {"uniform": 0.1}}"#).unwrap();
        assert_eq!(config.coupling, CrossEarCoupling::Uniform(0.1));
    }

    #[test]
    fn output_selection_from_json() {
        let params = EarParams::from_json(r#"{"outputs": {"ohc": true, "nap_decim": true}}"#).unwrap();
        assert!(params.outputs.ohc && params.outputs.nap_decim);
        assert!(!params.outputs.agc);
        assert_eq!(EarParams::default().outputs, OutputSelection::default());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let result = EarParams::from_json(r#"{"sample_rate": "fast"}"#);
        assert!(matches!(result, Err(CarfacError::Config(_))), "got {result:?}");
    }
}
