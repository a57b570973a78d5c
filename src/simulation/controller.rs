//! Simulated owning channel.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::load_balancer::{
    Address, BalancerState, Channel, ChannelController, ChannelId, ChannelState,
    ConnectivityState, LbError, NewChannelOptions, Picker, StateListener,
};

/// A fake transport channel.
///
/// With `auto_ready` set, `connect` moves straight through CONNECTING to
/// READY.
pub struct SimChannel {
    id: ChannelId,
    addresses: Mutex<Vec<Address>>,
    listener: Option<StateListener>,
    auto_ready: bool,
    shut_down: AtomicBool,
}

impl SimChannel {
    pub fn addresses(&self) -> Vec<Address> {
        self.addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Report a transport state to whoever created the channel.
    pub fn emit(&self, state: ChannelState) {
        if self.is_shut_down() {
            return;
        }
        if let Some(listener) = &self.listener {
            listener(state);
        }
    }
}

impl Channel for SimChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn connect(&self) {
        self.emit(ChannelState::new(ConnectivityState::Connecting));
        if self.auto_ready {
            self.emit(ChannelState::new(ConnectivityState::Ready));
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = &self.listener {
            listener(ChannelState::new(ConnectivityState::Shutdown));
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimChannel")
            .field("id", &self.id)
            .field("addresses", &self.addresses())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Owning channel that records everything the balancer asks of it.
pub struct SimulatedController {
    auto_ready: bool,
    channels: Mutex<Vec<Arc<SimChannel>>>,
    pickers: Mutex<Vec<BalancerState>>,
    resolve_now_calls: AtomicUsize,
}

impl SimulatedController {
    /// Channels become READY as soon as they are asked to connect.
    pub fn new() -> Self {
        Self::with_auto_ready(true)
    }

    pub fn with_auto_ready(auto_ready: bool) -> Self {
        Self {
            auto_ready,
            channels: Mutex::new(Vec::new()),
            pickers: Mutex::new(Vec::new()),
            resolve_now_calls: AtomicUsize::new(0),
        }
    }

    fn lock_channels(&self) -> MutexGuard<'_, Vec<Arc<SimChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pickers(&self) -> MutexGuard<'_, Vec<BalancerState>> {
        self.pickers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The most recently published picker.
    pub fn latest_picker(&self) -> Option<Arc<dyn Picker>> {
        self.lock_pickers().last().map(|s| s.picker.clone())
    }

    /// The most recently published aggregate state.
    pub fn latest_state(&self) -> Option<ConnectivityState> {
        self.lock_pickers().last().map(|s| s.connectivity_state)
    }

    pub fn picker_update_count(&self) -> usize {
        self.lock_pickers().len()
    }

    pub fn resolve_now_count(&self) -> usize {
        self.resolve_now_calls.load(Ordering::Relaxed)
    }

    /// Channels that have not been shut down.
    pub fn live_channels(&self) -> Vec<Arc<SimChannel>> {
        self.lock_channels()
            .iter()
            .filter(|c| !c.is_shut_down())
            .cloned()
            .collect()
    }

    pub fn live_channel_count(&self) -> usize {
        self.live_channels().len()
    }

    /// Push a transport state into every live channel that includes `addr`.
    pub fn set_channel_state(&self, addr: &str, state: ChannelState) {
        let targets: Vec<Arc<SimChannel>> = self
            .live_channels()
            .into_iter()
            .filter(|c| c.addresses().iter().any(|a| a.addr == addr))
            .collect();
        for channel in targets {
            channel.emit(state.clone());
        }
    }

    /// The backend address behind a picked channel.
    pub fn address_of(&self, channel: &Arc<dyn Channel>) -> Option<String> {
        let channel = channel.as_any().downcast_ref::<SimChannel>()?;
        channel.addresses().first().map(|a| a.addr.clone())
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelController for SimulatedController {
    fn new_channel(
        &self,
        addresses: Vec<Address>,
        options: NewChannelOptions,
    ) -> Result<Arc<dyn Channel>, LbError> {
        if addresses.is_empty() {
            return Err(LbError::ChannelCreation("no addresses".to_string()));
        }
        let channel = Arc::new(SimChannel {
            id: ChannelId::next(),
            addresses: Mutex::new(addresses),
            listener: options.state_listener,
            auto_ready: self.auto_ready,
            shut_down: AtomicBool::new(false),
        });
        tracing::trace!(channel = %channel.id, "Simulated channel created");
        self.lock_channels().push(channel.clone());
        Ok(channel)
    }

    fn update_addresses(&self, channel: &Arc<dyn Channel>, addresses: Vec<Address>) {
        if let Some(channel) = channel.as_any().downcast_ref::<SimChannel>() {
            *channel
                .addresses
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = addresses;
        }
    }

    fn update_state(&self, state: BalancerState) {
        self.lock_pickers().push(state);
    }

    fn resolve_now(&self) {
        self.resolve_now_calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_connect_reports_ready() {
        let controller = SimulatedController::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: StateListener = Arc::new(move |state: ChannelState| {
            sink.lock().unwrap().push(state.connectivity_state);
        });
        let channel = controller
            .new_channel(
                vec![Address::new("a:1")],
                NewChannelOptions {
                    state_listener: Some(listener),
                },
            )
            .unwrap();

        channel.connect();
        channel.shutdown();
        channel.shutdown();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectivityState::Connecting,
                ConnectivityState::Ready,
                ConnectivityState::Shutdown
            ]
        );
        assert_eq!(controller.live_channel_count(), 0);
        assert_eq!(controller.address_of(&channel), Some("a:1".to_string()));
    }

    #[test]
    fn test_set_channel_state_targets_address() {
        let controller = SimulatedController::with_auto_ready(false);
        let hits = Arc::new(AtomicUsize::new(0));
        for addr in ["a:1", "b:1"] {
            let hits = hits.clone();
            controller
                .new_channel(
                    vec![Address::new(addr)],
                    NewChannelOptions {
                        state_listener: Some(Arc::new(move |_| {
                            hits.fetch_add(1, Ordering::SeqCst);
                        })),
                    },
                )
                .unwrap();
        }
        controller.set_channel_state("b:1", ChannelState::new(ConnectivityState::Ready));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_addresses_rejected() {
        let controller = SimulatedController::new();
        assert!(matches!(
            controller.new_channel(Vec::new(), NewChannelOptions::default()),
            Err(LbError::ChannelCreation(_))
        ));
    }
}
