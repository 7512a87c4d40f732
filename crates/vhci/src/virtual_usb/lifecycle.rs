//! Plug-and-play lifecycle of the virtual roles
//!
//! Query transitions (`QueryStop`, `QueryRemove`) are provisional and undone
//! by the matching cancel; only `Stop` and `Remove` commit. `Removed` is
//! terminal and reachable from every other state.

use common::{Error, RemovalReason, Result};
use std::sync::{Mutex, PoisonError};
use tracing::info;

use super::DeviceRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PnpState {
    Created,
    Started,
    StopPending,
    Stopped,
    RemovePending,
    SurpriseRemovePending,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PnpEvent {
    Start,
    QueryStop,
    CancelStop,
    Stop,
    QueryRemove,
    CancelRemove,
    SurpriseRemoval,
    Remove,
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: PnpState,
    /// State to return to on `CancelRemove`
    before_query_remove: PnpState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: PnpState::Created,
            before_query_remove: PnpState::Created,
        }
    }

    pub fn state(&self) -> PnpState {
        self.state
    }

    /// Apply `event`, returning the new state
    pub fn apply(&mut self, event: PnpEvent) -> Result<PnpState> {
        use PnpEvent::*;
        use PnpState::*;

        let next = match (self.state, event) {
            (Removed, _) => None,
            (_, Remove) => Some(Removed),
            (_, SurpriseRemoval) => Some(SurpriseRemovePending),
            (Created | Stopped, Start) => Some(Started),
            (Started, QueryStop) => Some(StopPending),
            (StopPending, CancelStop) => Some(Started),
            (StopPending, Stop) => Some(Stopped),
            (Started | Stopped, QueryRemove) => {
                self.before_query_remove = self.state;
                Some(RemovePending)
            }
            (RemovePending, CancelRemove) => Some(self.before_query_remove),
            _ => None,
        };

        match next {
            Some(state) => {
                self.state = state;
                Ok(state)
            }
            None => Err(Error::InvalidParameter(format!(
                "{:?} not valid in state {:?}",
                event, self.state
            ))),
        }
    }

    /// Whether new URBs may be queued
    pub fn accepts_submissions(&self) -> bool {
        !matches!(
            self.state,
            PnpState::SurpriseRemovePending | PnpState::Removed
        )
    }

    pub fn is_removed(&self) -> bool {
        self.state == PnpState::Removed
    }
}

/// Role-specific behaviour behind the shared lifecycle
pub trait PnpDevice {
    fn role(&self) -> DeviceRole;

    fn lifecycle(&self) -> &Mutex<Lifecycle>;

    /// Free everything the role owns; called once, on entering `Removed`
    fn release(&self, reason: RemovalReason);

    fn pnp_state(&self) -> PnpState {
        self.lifecycle()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    fn pnp(&self, event: PnpEvent) -> Result<PnpState> {
        self.pnp_with_reason(event, RemovalReason::Detached)
    }

    /// Apply `event`, releasing the role if it reaches `Removed`
    fn pnp_with_reason(&self, event: PnpEvent, reason: RemovalReason) -> Result<PnpState> {
        let (previous, state) = {
            let mut lifecycle = self.lifecycle().lock().unwrap_or_else(PoisonError::into_inner);
            let previous = lifecycle.state();
            (previous, lifecycle.apply(event)?)
        };

        if previous != state {
            info!("{}: {:?} -> {:?}", self.role(), previous, state);
        }
        if state == PnpState::Removed {
            self.release(reason);
        }
        Ok(state)
    }
}
