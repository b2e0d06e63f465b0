//! The contract a supervised unit must fulfil.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::UnitError;

/// A long-lived object whose operations a [`Worker`](super::Worker) runs on a
/// fixed period.
///
/// The unit is rebuilt from `Params` whenever the worker is healed, so
/// `build` must be cheap and must not depend on previous instances.
#[async_trait]
pub trait Unit: Send + 'static {
    /// Everything needed to (re)construct the unit.
    type Params: Clone + Send + Sync + 'static;

    /// The operations this unit exposes.
    type Action: Copy + Debug + PartialEq + Send + Sync + 'static;

    /// Registry key. At most one worker per name.
    const NAME: &'static str;

    fn build(params: &Self::Params) -> Result<Self, UnitError>
    where
        Self: Sized;

    /// Operations this unit can actually perform.
    fn capabilities() -> &'static [Self::Action];

    /// Run one operation.
    ///
    /// Return [`UnitError::ExitRequested`] to terminate the worker at once.
    async fn perform(&mut self, action: Self::Action) -> Result<(), UnitError>;
}
