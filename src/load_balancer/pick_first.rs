//! Pick-first child policy.
//!
//! A single channel over the whole address list. Address changes are pushed
//! into the existing channel instead of recreating it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::load_balancer::round_robin::ErrorPicker;
use crate::load_balancer::{
    BalancerState, Channel, ChannelController, ChannelState, ClientConnState, ConnectivityState,
    LbError, LoadBalancer, LoadBalancerBuilder, NewChannelOptions, PickInfo, PickResult, Picker,
};

pub const NAME: &str = "pick_first";

/// Builds [`PickFirst`] policies.
#[derive(Debug, Default)]
pub struct PickFirstBuilder;

impl LoadBalancerBuilder for PickFirstBuilder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(&self, controller: Arc<dyn ChannelController>) -> Box<dyn LoadBalancer> {
        Box::new(PickFirst::new(controller))
    }
}

#[derive(Default)]
struct Shared {
    channel: Option<Arc<dyn Channel>>,
    state: ChannelState,
}

impl Shared {
    fn balancer_state(&self) -> BalancerState {
        let picker: Arc<dyn Picker> = match (&self.channel, self.state.connectivity_state) {
            (Some(channel), ConnectivityState::Ready) => Arc::new(FixedPicker(channel.clone())),
            (_, ConnectivityState::TransientFailure) => {
                Arc::new(ErrorPicker(LbError::Unavailable(
                    self.state
                        .connection_error
                        .clone()
                        .unwrap_or_else(|| "connection failed".to_string()),
                )))
            }
            _ => Arc::new(ErrorPicker(LbError::NoChannelAvailable)),
        };
        let connectivity_state = match self.state.connectivity_state {
            ConnectivityState::Idle => ConnectivityState::Connecting,
            other => other,
        };
        BalancerState {
            connectivity_state,
            picker,
        }
    }
}

/// Pick-first policy state.
pub struct PickFirst {
    controller: Arc<dyn ChannelController>,
    shared: Arc<Mutex<Shared>>,
}

impl PickFirst {
    pub fn new(controller: Arc<dyn ChannelController>) -> Self {
        Self {
            controller,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn on_channel_state(
    shared: &Weak<Mutex<Shared>>,
    controller: &dyn ChannelController,
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
        let reconnect = if state.connectivity_state == ConnectivityState::Idle {
            guard.channel.clone()
        } else {
            None
        };
        guard.state = state;
        (guard.balancer_state(), reconnect)
    };
    controller.update_state(balancer_state);
    if let Some(channel) = reconnect {
        channel.connect();
    }
}

impl LoadBalancer for PickFirst {
    fn update_client_conn_state(&mut self, state: ClientConnState) -> Result<(), LbError> {
        let addresses = state.resolver_state.addresses;
        if addresses.is_empty() {
            let (stale, balancer_state) = {
                let mut guard = self.lock();
                guard.state = ChannelState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    connection_error: Some("produced zero addresses".to_string()),
                };
                (guard.channel.take(), guard.balancer_state())
            };
            if let Some(channel) = stale {
                channel.shutdown();
            }
            self.controller.update_state(balancer_state);
            return Err(LbError::BadResolverState);
        }

        let existing = self.lock().channel.clone();
        if let Some(channel) = existing {
            self.controller.update_addresses(&channel, addresses);
            return Ok(());
        }

        let shared = Arc::downgrade(&self.shared);
        let controller = self.controller.clone();
        let options = NewChannelOptions {
            state_listener: Some(Arc::new(move |state: ChannelState| {
                on_channel_state(&shared, controller.as_ref(), state);
            })),
        };
        let channel = self.controller.new_channel(addresses, options)?;
        let balancer_state = {
            let mut guard = self.lock();
            guard.channel = Some(channel.clone());
            guard.state = ChannelState::new(ConnectivityState::Idle);
            guard.balancer_state()
        };
        self.controller.update_state(balancer_state);
        channel.connect();
        Ok(())
    }

    fn resolver_error(&mut self, error: LbError) {
        let balancer_state = {
            let mut guard = self.lock();
            if guard.channel.is_some() {
                return;
            }
            guard.state = ChannelState {
                connectivity_state: ConnectivityState::TransientFailure,
                connection_error: Some(error.to_string()),
            };
            guard.balancer_state()
        };
        self.controller.update_state(balancer_state);
    }

    fn exit_idle(&mut self) {
        let channel = {
            let guard = self.lock();
            match guard.state.connectivity_state {
                ConnectivityState::Idle => guard.channel.clone(),
                _ => None,
            }
        };
        if let Some(channel) = channel {
            channel.connect();
        }
    }

    fn close(&mut self) {
        let channel = self.lock().channel.take();
        if let Some(channel) = channel {
            channel.shutdown();
        }
    }
}

/// Always returns the same channel.
#[derive(Debug)]
struct FixedPicker(Arc<dyn Channel>);

impl Picker for FixedPicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, LbError> {
        Ok(PickResult::new(self.0.clone()))
    }
}
