//! Channel wrapper handed to the child policy.
//!
//! # Responsibilities
//! - Stand in for a transport channel so the child never sees ejection
//! - Remember the last real transport state
//! - Report `TRANSIENT_FAILURE` to the child while ejected
//! - Point at the call counter of the endpoint it is attached to
//!
//! State and ejection changes are not delivered directly. They are queued
//! and the coordinator's run loop invokes the child's listener, so the child
//! observes one totally ordered stream per channel.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;

use crate::health::CallCounter;
use crate::load_balancer::{
    Address, Channel, ChannelId, ChannelState, ConnectivityState, StateListener,
};

/// Error text attached to the state synthesized on ejection.
pub const EJECTED_ERROR: &str = "endpoint ejected by outlier detection";

/// Work item for the coordinator's endpoint-update queue.
pub(crate) enum ChannelUpdate {
    /// The transport reported a new state for the wrapped channel.
    State {
        wrapper: Arc<ChannelWrapper>,
        state: ChannelState,
    },
    /// The wrapper's endpoint was ejected or un-ejected.
    Ejection {
        wrapper: Arc<ChannelWrapper>,
        ejected: bool,
    },
}

#[derive(Debug, Default)]
struct WrapperStatus {
    latest_state: Option<ChannelState>,
    ejected: bool,
    /// Ejection state after every queued update is applied.
    ejection_requested: bool,
}

/// A child-facing channel that can be ejected independently of its transport.
pub struct ChannelWrapper {
    underlying: Arc<dyn Channel>,
    listener: Option<StateListener>,
    addresses: Mutex<Vec<Address>>,
    /// Counter of the attached endpoint; empty when unattached. Shared with
    /// every picker that handed this wrapper out, so re-attachment is seen
    /// by RPCs that are still in flight.
    call_counter: Arc<ArcSwapOption<CallCounter>>,
    status: Mutex<WrapperStatus>,
    updates: mpsc::UnboundedSender<ChannelUpdate>,
}

impl ChannelWrapper {
    pub(crate) fn new(
        underlying: Arc<dyn Channel>,
        addresses: Vec<Address>,
        listener: Option<StateListener>,
        updates: mpsc::UnboundedSender<ChannelUpdate>,
    ) -> Self {
        Self {
            underlying,
            listener,
            addresses: Mutex::new(addresses),
            call_counter: Arc::new(ArcSwapOption::empty()),
            status: Mutex::new(WrapperStatus::default()),
            updates,
        }
    }

    /// The transport channel behind this wrapper.
    pub fn underlying(&self) -> &Arc<dyn Channel> {
        &self.underlying
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.lock_addresses().clone()
    }

    pub(crate) fn set_addresses(&self, addresses: Vec<Address>) {
        *self.lock_addresses() = addresses;
    }

    /// The address when the wrapper has exactly one, otherwise `None`.
    /// Only single-address wrappers take part in outlier detection.
    pub fn single_address(&self) -> Option<String> {
        single_address(&self.lock_addresses())
    }

    /// Whether the child currently sees this wrapper as ejected.
    pub fn is_ejected(&self) -> bool {
        self.lock_status().ejected
    }

    /// Last state reported by the transport, if any.
    pub fn latest_state(&self) -> Option<ChannelState> {
        self.lock_status().latest_state.clone()
    }

    pub(crate) fn counter_slot(&self) -> Arc<ArcSwapOption<CallCounter>> {
        self.call_counter.clone()
    }

    pub(crate) fn bind(&self, counter: Arc<CallCounter>) {
        self.call_counter.store(Some(counter));
    }

    pub(crate) fn unbind(&self) {
        self.call_counter.store(None);
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.call_counter.load().is_some()
    }

    /// Whether the wrapper is ejected or has an ejection queued.
    pub(crate) fn ejection_requested(&self) -> bool {
        self.lock_status().ejection_requested
    }

    pub(crate) fn eject(self: &Arc<Self>) {
        self.lock_status().ejection_requested = true;
        self.enqueue(ChannelUpdate::Ejection {
            wrapper: self.clone(),
            ejected: true,
        });
    }

    pub(crate) fn uneject(self: &Arc<Self>) {
        self.lock_status().ejection_requested = false;
        self.enqueue(ChannelUpdate::Ejection {
            wrapper: self.clone(),
            ejected: false,
        });
    }

    fn enqueue(&self, update: ChannelUpdate) {
        if self.updates.send(update).is_err() {
            tracing::debug!(channel = %self.underlying.id(), "Update dropped, balancer closed");
        }
    }

    /// Cache a transport state. Returns the state to forward to the child,
    /// or `None` while ejected. `Shutdown` is always forwarded.
    pub(crate) fn apply_transport_state(&self, state: ChannelState) -> Option<ChannelState> {
        let mut status = self.lock_status();
        let forward =
            !status.ejected || state.connectivity_state == ConnectivityState::Shutdown;
        status.latest_state = Some(state.clone());
        forward.then_some(state)
    }

    /// Apply an ejection change. Returns the state the child should now see.
    pub(crate) fn apply_ejection(&self, ejected: bool) -> ChannelState {
        let mut status = self.lock_status();
        status.ejected = ejected;
        if ejected {
            ChannelState {
                connectivity_state: ConnectivityState::TransientFailure,
                connection_error: Some(EJECTED_ERROR.to_string()),
            }
        } else {
            status
                .latest_state
                .clone()
                .unwrap_or_else(|| ChannelState::new(ConnectivityState::Idle))
        }
    }

    /// Invoke the child's listener.
    pub(crate) fn notify(&self, state: ChannelState) {
        if let Some(listener) = &self.listener {
            listener(state);
        }
    }

    fn lock_addresses(&self) -> MutexGuard<'_, Vec<Address>> {
        self.addresses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> MutexGuard<'_, WrapperStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn single_address(addresses: &[Address]) -> Option<String> {
    match addresses {
        [only] => Some(only.addr.clone()),
        _ => None,
    }
}

impl Channel for ChannelWrapper {
    fn id(&self) -> ChannelId {
        self.underlying.id()
    }

    fn connect(&self) {
        self.underlying.connect();
    }

    fn shutdown(&self) {
        self.underlying.shutdown();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for ChannelWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWrapper")
            .field("id", &self.underlying.id())
            .field("addresses", &*self.lock_addresses())
            .field("ejected", &self.is_ejected())
            .finish()
    }
}
