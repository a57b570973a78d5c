//! Round-robin child policy.
//!
//! One channel per resolved address. The picker rotates over the channels
//! that are READY using an internal counter.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::load_balancer::{
    Address, BalancerState, Channel, ChannelController, ChannelState, ClientConnState,
    ConnectivityState, LbError, LoadBalancer, LoadBalancerBuilder, NewChannelOptions, PickInfo,
    PickResult, Picker, StateListener,
};

pub const NAME: &str = "round_robin";

/// Builds [`RoundRobin`] policies.
#[derive(Debug, Default)]
pub struct RoundRobinBuilder;

impl LoadBalancerBuilder for RoundRobinBuilder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(&self, controller: Arc<dyn ChannelController>) -> Box<dyn LoadBalancer> {
        Box::new(RoundRobin::new(controller))
    }
}

struct Entry {
    /// Distinguishes this channel from an earlier one to the same address.
    token: u64,
    address: Address,
    channel: Arc<dyn Channel>,
    state: ChannelState,
}

#[derive(Default)]
struct Shared {
    entries: Vec<Entry>,
    next_token: u64,
    resolver_error: Option<String>,
}

impl Shared {
    fn balancer_state(&self) -> BalancerState {
        let ready: Vec<Arc<dyn Channel>> = self
            .entries
            .iter()
            .filter(|e| e.state.connectivity_state == ConnectivityState::Ready)
            .map(|e| e.channel.clone())
            .collect();

        if !ready.is_empty() {
            return BalancerState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RoundRobinPicker::new(ready)),
            };
        }

        let connecting = self.entries.iter().any(|e| {
            matches!(
                e.state.connectivity_state,
                ConnectivityState::Idle | ConnectivityState::Connecting
            )
        });
        if connecting {
            return BalancerState {
                connectivity_state: ConnectivityState::Connecting,
                picker: Arc::new(ErrorPicker(LbError::NoChannelAvailable)),
            };
        }

        let reason = self
            .entries
            .iter()
            .rev()
            .find_map(|e| e.state.connection_error.clone())
            .or_else(|| self.resolver_error.clone())
            .unwrap_or_else(|| "all channels in transient failure".to_string());
        BalancerState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(ErrorPicker(LbError::Unavailable(reason))),
        }
    }
}

/// Round-robin policy state.
pub struct RoundRobin {
    controller: Arc<dyn ChannelController>,
    shared: Arc<Mutex<Shared>>,
}

impl RoundRobin {
    pub fn new(controller: Arc<dyn ChannelController>) -> Self {
        Self {
            controller,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    fn listener(&self, token: u64) -> StateListener {
        let shared = Arc::downgrade(&self.shared);
        let controller = self.controller.clone();
        Arc::new(move |state: ChannelState| {
            on_channel_state(&shared, controller.as_ref(), token, state);
        })
    }

    fn publish(&self) {
        let state = self.lock().balancer_state();
        self.controller.update_state(state);
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn on_channel_state(
    shared: &Weak<Mutex<Shared>>,
    controller: &dyn ChannelController,
    token: u64,
    state: ChannelState,
) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    if state.connectivity_state == ConnectivityState::Shutdown {
        return;
    }

    let (balancer_state, reconnect) = {
        let mut guard = lock_shared(&shared);
        let Some(entry) = guard.entries.iter_mut().find(|e| e.token == token) else {
            return;
        };
        tracing::trace!(
            address = %entry.address,
            state = %state.connectivity_state,
            "Round robin channel state changed"
        );
        let reconnect = (state.connectivity_state == ConnectivityState::Idle)
            .then(|| entry.channel.clone());
        entry.state = state;
        (guard.balancer_state(), reconnect)
    };

    controller.update_state(balancer_state);
    if let Some(channel) = reconnect {
        channel.connect();
    }
}

impl LoadBalancer for RoundRobin {
    fn update_client_conn_state(&mut self, state: ClientConnState) -> Result<(), LbError> {
        let mut seen = HashSet::new();
        let addresses: Vec<Address> = state
            .resolver_state
            .addresses
            .into_iter()
            .filter(|a| seen.insert(a.addr.clone()))
            .collect();

        if addresses.is_empty() {
            let stale = {
                let mut guard = self.lock();
                guard.resolver_error = Some("produced zero addresses".to_string());
                std::mem::take(&mut guard.entries)
            };
            for entry in stale {
                entry.channel.shutdown();
            }
            self.publish();
            return Err(LbError::BadResolverState);
        }

        let (removed, existing) = {
            let mut guard = self.lock();
            guard.resolver_error = None;
            let wanted: HashSet<&str> = addresses.iter().map(|a| a.addr.as_str()).collect();
            let (keep, removed): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut guard.entries)
                .into_iter()
                .partition(|e| wanted.contains(e.address.addr.as_str()));
            guard.entries = keep;
            let existing: HashSet<String> =
                guard.entries.iter().map(|e| e.address.addr.clone()).collect();
            (removed, existing)
        };

        for entry in removed {
            entry.channel.shutdown();
        }

        let mut created = Vec::new();
        for address in addresses.iter().filter(|a| !existing.contains(&a.addr)) {
            let token = {
                let mut guard = self.lock();
                guard.next_token += 1;
                guard.next_token
            };
            let options = NewChannelOptions {
                state_listener: Some(self.listener(token)),
            };
            let channel = match self.controller.new_channel(vec![address.clone()], options) {
                Ok(channel) => channel,
                Err(err) => {
                    tracing::warn!(address = %address, error = %err, "Failed to create channel");
                    continue;
                }
            };
            created.push(channel.clone());
            self.lock().entries.push(Entry {
                token,
                address: address.clone(),
                channel,
                state: ChannelState::new(ConnectivityState::Idle),
            });
        }

        {
            // Keep entries in resolver order.
            let mut guard = self.lock();
            guard.entries.sort_by_key(|e| {
                addresses
                    .iter()
                    .position(|a| a.addr == e.address.addr)
                    .unwrap_or(usize::MAX)
            });
        }

        self.publish();
        for channel in created {
            channel.connect();
        }
        Ok(())
    }

    fn resolver_error(&mut self, error: LbError) {
        let empty = {
            let mut guard = self.lock();
            guard.resolver_error = Some(error.to_string());
            guard.entries.is_empty()
        };
        if empty {
            self.publish();
        }
    }

    fn exit_idle(&mut self) {
        let idle: Vec<Arc<dyn Channel>> = self
            .lock()
            .entries
            .iter()
            .filter(|e| e.state.connectivity_state == ConnectivityState::Idle)
            .map(|e| e.channel.clone())
            .collect();
        for channel in idle {
            channel.connect();
        }
    }

    fn close(&mut self) {
        let entries = std::mem::take(&mut self.lock().entries);
        for entry in entries {
            entry.channel.shutdown();
        }
    }
}

/// Rotates over READY channels.
#[derive(Debug)]
pub struct RoundRobinPicker {
    channels: Vec<Arc<dyn Channel>>,
    counter: AtomicUsize,
}

impl RoundRobinPicker {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self {
            channels,
            counter: AtomicUsize::new(0),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, LbError> {
        if self.channels.is_empty() {
            return Err(LbError::NoChannelAvailable);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        Ok(PickResult::new(self.channels[index].clone()))
    }
}

/// Fails every pick with the same error.
#[derive(Debug)]
pub struct ErrorPicker(pub LbError);

impl Picker for ErrorPicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, LbError> {
        Err(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{ChannelId, ResolverState};
    use std::any::Any;

    struct TestChannel {
        id: ChannelId,
        address: Address,
        listener: Option<StateListener>,
    }

    impl TestChannel {
        fn emit(&self, state: ConnectivityState) {
            if let Some(listener) = &self.listener {
                listener(ChannelState::new(state));
            }
        }
    }

    impl std::fmt::Debug for TestChannel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TestChannel")
                .field("id", &self.id)
                .field("address", &self.address)
                .finish()
        }
    }

    impl Channel for TestChannel {
        fn id(&self) -> ChannelId {
            self.id
        }
        fn connect(&self) {}
        fn shutdown(&self) {
            self.emit(ConnectivityState::Shutdown);
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct TestController {
        channels: Mutex<Vec<Arc<TestChannel>>>,
        states: Mutex<Vec<BalancerState>>,
    }

    impl TestController {
        fn channel(&self, addr: &str) -> Arc<TestChannel> {
            self.channels
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|c| c.address.addr == addr)
                .cloned()
                .unwrap()
        }

        fn latest(&self) -> BalancerState {
            self.states.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl ChannelController for TestController {
        fn new_channel(
            &self,
            addresses: Vec<Address>,
            options: NewChannelOptions,
        ) -> Result<Arc<dyn Channel>, LbError> {
            let channel = Arc::new(TestChannel {
                id: ChannelId::next(),
                address: addresses[0].clone(),
                listener: options.state_listener,
            });
            self.channels.lock().unwrap().push(channel.clone());
            Ok(channel)
        }

        fn update_addresses(&self, _channel: &Arc<dyn Channel>, _addresses: Vec<Address>) {}

        fn update_state(&self, state: BalancerState) {
            self.states.lock().unwrap().push(state);
        }
    }

    fn conn_state(addrs: &[&str]) -> ClientConnState {
        ClientConnState {
            resolver_state: ResolverState::new(addrs.iter().copied()),
            config: None,
        }
    }

    #[test]
    fn test_round_robin_rotates_ready_channels() {
        let controller = Arc::new(TestController::default());
        let mut lb = RoundRobin::new(controller.clone());
        lb.update_client_conn_state(conn_state(&["a", "b"])).unwrap();
        assert_eq!(
            controller.latest().connectivity_state,
            ConnectivityState::Connecting
        );

        controller.channel("a").emit(ConnectivityState::Ready);
        controller.channel("b").emit(ConnectivityState::Ready);

        let picker = controller.latest().picker;
        let ids: Vec<ChannelId> = (0..4)
            .map(|_| picker.pick(&PickInfo::default()).unwrap().channel.id())
            .collect();
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[1], ids[3]);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_transient_failure_channels_are_skipped() {
        let controller = Arc::new(TestController::default());
        let mut lb = RoundRobin::new(controller.clone());
        lb.update_client_conn_state(conn_state(&["a", "b"])).unwrap();

        controller.channel("a").emit(ConnectivityState::Ready);
        controller.channel("b").emit(ConnectivityState::TransientFailure);

        let picker = controller.latest().picker;
        let a = controller.channel("a").id;
        for _ in 0..3 {
            assert_eq!(picker.pick(&PickInfo::default()).unwrap().channel.id(), a);
        }
    }

    #[test]
    fn test_all_failing_reports_transient_failure() {
        let controller = Arc::new(TestController::default());
        let mut lb = RoundRobin::new(controller.clone());
        lb.update_client_conn_state(conn_state(&["a"])).unwrap();
        controller.channel("a").emit(ConnectivityState::TransientFailure);

        let state = controller.latest();
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
        assert!(matches!(
            state.picker.pick(&PickInfo::default()),
            Err(LbError::Unavailable(_))
        ));
    }

    #[test]
    fn test_empty_addresses_is_bad_resolver_state() {
        let controller = Arc::new(TestController::default());
        let mut lb = RoundRobin::new(controller.clone());
        assert_eq!(
            lb.update_client_conn_state(conn_state(&[])),
            Err(LbError::BadResolverState)
        );
        assert_eq!(
            controller.latest().connectivity_state,
            ConnectivityState::TransientFailure
        );
    }

    #[test]
    fn test_removed_address_is_shut_down_and_ignored() {
        let controller = Arc::new(TestController::default());
        let mut lb = RoundRobin::new(controller.clone());
        lb.update_client_conn_state(conn_state(&["a", "b"])).unwrap();
        let old_b = controller.channel("b");

        lb.update_client_conn_state(conn_state(&["a"])).unwrap();
        old_b.emit(ConnectivityState::Ready);
        assert_eq!(
            controller.latest().connectivity_state,
            ConnectivityState::Connecting
        );
    }

    #[test]
    fn test_listener_after_close_is_ignored() {
        let controller = Arc::new(TestController::default());
        let mut lb = RoundRobin::new(controller.clone());
        lb.update_client_conn_state(conn_state(&["a"])).unwrap();
        let a = controller.channel("a");
        lb.close();
        drop(lb);
        let published = controller.states.lock().unwrap().len();
        a.emit(ConnectivityState::Ready);
        assert_eq!(controller.states.lock().unwrap().len(), published);
    }
}
