//! The contract shared by the CAR, IHC and AGC stages.
//!
//! Each stage is a zero-sized marker type implementing [`EarComponent`] over
//! its own (Params, Coeffs, State) triple. Coefficient design is a pure
//! function; all mutation goes through `process_block` and `reset`.
//! [`Component`] bundles one designed instance so an ear can own its stages
//! without any shared base state.

use std::fmt::Debug;

use crate::error::CarfacError;

pub trait EarComponent {
    /// User-facing, immutable tuning constants.
    type Params: Clone + Debug;
    /// Time-invariant constants derived from `Params` and the sample rate.
    type Coeffs: Clone + Debug;
    /// Per-channel simulation variables, mutated on every block.
    type State: Clone + Debug + PartialEq;
    /// What one block of processing consumes.
    type Input<'a>;
    /// What one block of processing produces.
    type Output;

    /// Derive coefficients. Fails with `InvalidParameter` on non-positive,
    /// non-finite, or unstable input.
    fn design(params: &Self::Params, sample_rate: f64) -> Result<Self::Coeffs, CarfacError>;

    /// The equilibrium state for `num_channels` channels.
    fn init_state(coeffs: &Self::Coeffs, num_channels: usize) -> Result<Self::State, CarfacError>;

    /// Process one block. Validation happens before any state is touched, so
    /// an `Err` leaves `state` exactly as it was.
    fn process_block(
        coeffs: &Self::Coeffs,
        state: &mut Self::State,
        input: Self::Input<'_>,
    ) -> Result<Self::Output, CarfacError>;

    /// Restore `state` to the equilibrium `init_state` produces, in place.
    fn reset(coeffs: &Self::Coeffs, state: &mut Self::State);
}

/// One designed stage: its parameters, coefficients and live state.
#[derive(Debug, Clone)]
pub struct Component<T: EarComponent> {
    params: T::Params,
    coeffs: T::Coeffs,
    state: T::State,
    num_channels: usize,
}

impl<T: EarComponent> Component<T> {
    /// Design coefficients and build the equilibrium state.
    pub fn new(params: T::Params, sample_rate: f64, num_channels: usize) -> Result<Self, CarfacError> {
        let coeffs = T::design(&params, sample_rate)?;
        Self::from_coeffs(params, coeffs, num_channels)
    }

    /// Wrap coefficients that were already designed from `params`.
    pub fn from_coeffs(params: T::Params, coeffs: T::Coeffs, num_channels: usize) -> Result<Self, CarfacError> {
        let state = T::init_state(&coeffs, num_channels)?;
        Ok(Component {
            params,
            coeffs,
            state,
            num_channels,
        })
    }

    pub fn process(&mut self, input: T::Input<'_>) -> Result<T::Output, CarfacError> {
        T::process_block(&self.coeffs, &mut self.state, input)
    }

    pub fn reset(&mut self) {
        T::reset(&self.coeffs, &mut self.state);
    }

    pub fn params(&self) -> &T::Params {
        &self.params
    }

    pub fn coeffs(&self) -> &T::Coeffs {
        &self.coeffs
    }

    pub fn state(&self) -> &T::State {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut T::State {
        &mut self.state
    }

    /// Coefficients and state borrowed together, for processing variants
    /// outside the trait.
    pub(crate) fn parts_mut(&mut self) -> (&T::Coeffs, &mut T::State) {
        (&self.coeffs, &mut self.state)
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }
}
