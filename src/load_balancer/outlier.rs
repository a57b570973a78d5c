//! Outlier detection coordinator.
//!
//! # Data Flow
//! ```text
//! update_client_conn_state (caller task):
//!     validate → switch child if needed → [state lock] rebuild endpoint
//!     map, reschedule timer → [child lock] forward to child
//!     → ConfigApplied on picker queue → wait for the run loop
//!
//! Interval timer (spawned task):
//!     [state lock] health::ejection::run_interval → wrappers enqueue
//!     ejection updates → reschedule
//!
//! Run loop (one task):
//!     endpoint queue  → wrapper bookkeeping → [child lock] child listener
//!     picker queue    → wrap child picker → owning channel
//! ```
//!
//! # Design Decisions
//! - Lock order is child lock, then state lock; never the reverse
//! - Every call into the child's listeners happens on the run loop, so the
//!   child sees one ordered stream of state changes
//! - Child pickers produced during a config update are held back until the
//!   update is fully applied, then at most one picker is published

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::validation::validate_lb_config;
use crate::config::{ConfigError, OutlierDetectionConfig};
use crate::health::{ejection, EndpointSet};
use crate::lifecycle::Shutdown;
use crate::load_balancer::picker::WrappedPicker;
use crate::load_balancer::wrapper::{single_address, ChannelUpdate, ChannelWrapper};
use crate::load_balancer::{
    Address, BalancerState, Channel, ChannelController, ChannelId, ChannelState, ClientConnState,
    ConnectivityState, LbError, LoadBalancer, LoadBalancerBuilder, NewChannelOptions, Registry,
    ResolverState,
};
use crate::observability::metrics;

/// Name under which this policy is known in service configs.
pub const NAME: &str = "outlier_detection_experimental";

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub address: String,
    pub ejected: bool,
    pub ejection_time_multiplier: u32,
    pub attached_channels: usize,
    /// RPCs counted so far in the current interval.
    pub current_interval_calls: u64,
}

enum PickerUpdate {
    Child(BalancerState),
    ConfigApplied {
        noop: bool,
        done: oneshot::Sender<()>,
    },
}

struct ActiveChild {
    name: &'static str,
    policy: Box<dyn LoadBalancer>,
}

#[derive(Default)]
struct State {
    endpoints: EndpointSet,
    config: Option<Arc<OutlierDetectionConfig>>,
    wrappers: HashMap<ChannelId, Arc<ChannelWrapper>>,
    timer_start: Option<Instant>,
    interval_timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is cancelled or rescheduled. A timer task
    /// only sweeps if the generation it was spawned with is still current.
    timer_generation: u64,
    inhibit_picker_updates: bool,
    update_unconditionally: bool,
    closed: bool,
}

impl State {
    fn cancel_timer(&mut self) {
        self.timer_generation = self.timer_generation.wrapping_add(1);
        if let Some(timer) = self.interval_timer.take() {
            timer.abort();
        }
    }
}

/// Where the upstream listener of a new channel delivers states.
///
/// States reported before the wrapper exists are held and replayed once it
/// is registered.
enum ListenerSlot {
    Pending(Vec<ChannelState>),
    Bound(Weak<ChannelWrapper>),
}

struct Inner {
    upstream: Arc<dyn ChannelController>,
    registry: Registry,
    child: Mutex<Option<ActiveChild>>,
    state: Mutex<State>,
    channel_tx: mpsc::UnboundedSender<ChannelUpdate>,
    picker_tx: mpsc::UnboundedSender<PickerUpdate>,
    shutdown: Shutdown,
}

/// Load balancer that ejects misbehaving endpoints from its child policy.
///
/// Must be created inside a Tokio runtime: construction spawns the run loop.
pub struct OutlierDetectionBalancer {
    inner: Arc<Inner>,
    run_loop: Mutex<Option<JoinHandle<()>>>,
}

impl OutlierDetectionBalancer {
    pub fn new(upstream: Arc<dyn ChannelController>, registry: Registry) -> Self {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (picker_tx, picker_rx) = mpsc::unbounded_channel();
        let shutdown = Shutdown::new();
        let stop = shutdown.subscribe();

        let inner = Arc::new(Inner {
            upstream,
            registry,
            child: Mutex::new(None),
            state: Mutex::new(State::default()),
            channel_tx,
            picker_tx,
            shutdown,
        });

        let run_loop = tokio::spawn(run(inner.clone(), channel_rx, picker_rx, stop));

        Self {
            inner,
            run_loop: Mutex::new(Some(run_loop)),
        }
    }

    /// Apply a resolver update together with a new configuration.
    ///
    /// Invalid configs are rejected before anything changes. Returns once
    /// the child has seen the update and any resulting picker was published.
    pub async fn update_client_conn_state(
        &self,
        resolver_state: ResolverState,
        config: OutlierDetectionConfig,
    ) -> Result<(), LbError> {
        if let Err(errors) = validate_lb_config(&config, &self.inner.registry) {
            tracing::warn!(errors = errors.len(), "Rejected outlier detection config");
            return Err(ConfigError::Validation(errors).into());
        }
        let builder = self
            .inner
            .registry
            .get(&config.child_policy.name)
            .ok_or_else(|| LbError::ChildPolicyNotRegistered(config.child_policy.name.clone()))?;

        if self.inner.lock_state().closed {
            return Err(LbError::Closed);
        }

        self.inner.switch_child(builder);

        let config = Arc::new(config);
        let noop = config.is_noop();
        let no_addresses = resolver_state.addresses.is_empty();
        self.inner.apply_config(&config, &resolver_state.addresses);

        let child_result = {
            let mut child = self.inner.lock_child();
            match child.as_mut() {
                Some(child) => child.policy.update_client_conn_state(ClientConnState {
                    resolver_state,
                    config: config.child_policy.config.clone(),
                }),
                None => Err(LbError::Closed),
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .inner
            .picker_tx
            .send(PickerUpdate::ConfigApplied {
                noop,
                done: done_tx,
            })
            .is_ok()
        {
            // The sender is dropped unanswered if the balancer closes first.
            let _ = done_rx.await;
        }

        child_result?;
        if no_addresses {
            return Err(LbError::BadResolverState);
        }
        Ok(())
    }

    /// Forward a resolver error to the child.
    pub fn resolver_error(&self, error: LbError) {
        if let Some(child) = self.inner.lock_child().as_mut() {
            child.policy.resolver_error(error);
        }
    }

    /// Forward an exit-idle request to the child.
    pub fn exit_idle(&self) {
        if let Some(child) = self.inner.lock_child().as_mut() {
            child.policy.exit_idle();
        }
    }

    /// Shut the balancer down: stop the timer and run loop, close the child,
    /// drop every endpoint record.
    pub async fn close(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.cancel_timer();
        }
        self.inner.shutdown.trigger();

        let run_loop = self
            .run_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(run_loop) = run_loop {
            let _ = run_loop.await;
        }

        let child = self.inner.lock_child().take();
        if let Some(mut child) = child {
            child.policy.close();
        }

        let mut state = self.inner.lock_state();
        state.endpoints.clear();
        state.wrappers.clear();
        state.config = None;
        state.timer_start = None;
        metrics::record_ejected_endpoints(0);
        tracing::info!("Outlier detection balancer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Name of the active child policy.
    pub fn child_policy(&self) -> Option<&'static str> {
        self.inner.lock_child().as_ref().map(|c| c.name)
    }

    /// Current state of every endpoint, ordered by address.
    pub fn endpoint_snapshot(&self) -> Vec<EndpointSnapshot> {
        let state = self.inner.lock_state();
        state
            .endpoints
            .iter()
            .map(|(address, record)| EndpointSnapshot {
                address: address.clone(),
                ejected: record.is_ejected(),
                ejection_time_multiplier: record.ejection_time_multiplier(),
                attached_channels: record.attached().len(),
                current_interval_calls: record.call_counter().active().total(),
            })
            .collect()
    }

    pub fn ejected_count(&self) -> usize {
        self.inner.lock_state().endpoints.ejected_count()
    }
}

impl Drop for OutlierDetectionBalancer {
    fn drop(&mut self) {
        self.inner.lock_state().cancel_timer();
        self.inner.shutdown.trigger();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_child(&self) -> MutexGuard<'_, Option<ActiveChild>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn switch_child(self: &Arc<Self>, builder: Arc<dyn LoadBalancerBuilder>) {
        let mut child = self.lock_child();
        if child.as_ref().is_some_and(|c| c.name == builder.name()) {
            return;
        }
        if let Some(mut old) = child.take() {
            tracing::info!(from = old.name, to = builder.name(), "Switching child policy");
            old.policy.close();
        }
        let controller = Arc::new(ChildController {
            inner: Arc::downgrade(self),
        });
        *child = Some(ActiveChild {
            name: builder.name(),
            policy: builder.build(controller),
        });
    }

    fn apply_config(self: &Arc<Self>, config: &Arc<OutlierDetectionConfig>, addresses: &[Address]) {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        state.inhibit_picker_updates = true;
        state.update_unconditionally = false;
        state.config = Some(config.clone());

        if addresses.is_empty() {
            tracing::warn!("Resolver produced zero addresses, keeping current endpoints");
        } else {
            let added = state.endpoints.sync_addresses(addresses);
            for addr in &added {
                // Adopt channels the child already holds for this address.
                let Some(record) = state.endpoints.get_mut(addr) else {
                    continue;
                };
                for wrapper in state.wrappers.values() {
                    if wrapper.single_address().as_deref() == Some(addr.as_str()) {
                        record.attach(wrapper);
                    }
                }
            }
        }

        state.cancel_timer();

        if config.is_noop() {
            state.timer_start = None;
            for addr in state.endpoints.reset_ejections() {
                tracing::info!(address = %addr, "Un-ejecting endpoint: ejection disabled");
                metrics::record_unejection();
            }
        } else {
            let now = Instant::now();
            let delay = match state.timer_start {
                None => {
                    state.timer_start = Some(now);
                    state.endpoints.clear_counters();
                    config.interval()
                }
                Some(start) => (start + config.interval()).saturating_duration_since(now),
            };
            self.schedule_interval(state, delay);
        }

        metrics::record_ejected_endpoints(state.endpoints.ejected_count());
        tracing::info!(
            endpoints = state.endpoints.len(),
            noop = config.is_noop(),
            child_policy = %config.child_policy.name,
            "Outlier detection config applied"
        );
    }

    fn schedule_interval(self: &Arc<Self>, state: &mut State, delay: Duration) {
        state.timer_generation = state.timer_generation.wrapping_add(1);
        let generation = state.timer_generation;
        let inner = Arc::downgrade(self);
        state.interval_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.run_interval(generation);
            }
        }));
    }

    fn run_interval(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }
        // Woke up just before a config update replaced this timer.
        if state.timer_generation != generation {
            tracing::debug!(generation, "Skipping superseded interval timer");
            return;
        }
        let Some(config) = state.config.clone() else {
            return;
        };
        if config.is_noop() {
            return;
        }

        let now = Instant::now();
        state.timer_start = Some(now);
        let outcome =
            ejection::run_interval(&mut state.endpoints, &config, now, &mut rand::thread_rng());

        for (addr, algorithm) in &outcome.ejected {
            let multiplier = state
                .endpoints
                .get(addr)
                .map_or(0, |r| r.ejection_time_multiplier());
            tracing::debug!(address = %addr, %algorithm, multiplier, "Endpoint ejected");
            metrics::record_ejection(algorithm.as_str());
        }
        for _ in &outcome.unejected {
            metrics::record_unejection();
        }
        metrics::record_ejected_endpoints(state.endpoints.ejected_count());
        metrics::record_interval();

        // Replaces the handle of the task running this sweep.
        self.schedule_interval(&mut state, config.interval());
    }

    fn new_channel(
        self: &Arc<Self>,
        addresses: Vec<Address>,
        options: NewChannelOptions,
    ) -> Result<Arc<dyn Channel>, LbError> {
        if self.lock_state().closed {
            return Err(LbError::Closed);
        }

        let slot = Arc::new(Mutex::new(ListenerSlot::Pending(Vec::new())));
        let listener = {
            let inner = Arc::downgrade(self);
            let slot = slot.clone();
            Arc::new(move |channel_state: ChannelState| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                match &mut *slot {
                    ListenerSlot::Pending(early) => early.push(channel_state),
                    ListenerSlot::Bound(wrapper) => {
                        if let Some(wrapper) = wrapper.upgrade() {
                            inner.on_transport_state(&wrapper, channel_state);
                        }
                    }
                }
            })
        };
        let underlying = self.upstream.new_channel(
            addresses.clone(),
            NewChannelOptions {
                state_listener: Some(listener),
            },
        )?;

        let wrapper = Arc::new(ChannelWrapper::new(
            underlying,
            addresses,
            options.state_listener,
            self.channel_tx.clone(),
        ));

        {
            let mut state = self.lock_state();
            state.wrappers.insert(wrapper.id(), wrapper.clone());
            if let Some(addr) = wrapper.single_address() {
                if let Some(record) = state.endpoints.get_mut(&addr) {
                    record.attach(&wrapper);
                    if record.is_ejected() {
                        wrapper.eject();
                    }
                }
            }
        }

        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let bound = ListenerSlot::Bound(Arc::downgrade(&wrapper));
        if let ListenerSlot::Pending(early) = std::mem::replace(&mut *slot, bound) {
            for channel_state in early {
                self.on_transport_state(&wrapper, channel_state);
            }
        }
        drop(slot);
        Ok(wrapper)
    }

    fn update_addresses(&self, channel: &Arc<dyn Channel>, addresses: Vec<Address>) {
        let Some(wrapper) = channel.as_any().downcast_ref::<ChannelWrapper>() else {
            tracing::error!(channel = ?channel, "Address update for a channel not created through outlier detection");
            return;
        };
        self.upstream.update_addresses(wrapper.underlying(), addresses.clone());

        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(wrapper) = state.wrappers.get(&wrapper.id()).cloned() else {
            wrapper.set_addresses(addresses);
            return;
        };

        match (wrapper.single_address(), single_address(&addresses)) {
            (Some(old), Some(new)) if old == new => {}
            (Some(old), Some(new)) => {
                if let Some(record) = state.endpoints.get_mut(&old) {
                    record.detach(&wrapper);
                }
                match state.endpoints.get_mut(&new) {
                    Some(record) => {
                        record.attach(&wrapper);
                        if record.is_ejected() {
                            wrapper.eject();
                        } else {
                            wrapper.uneject();
                        }
                    }
                    None => wrapper.uneject(),
                }
            }
            (Some(old), None) => {
                if let Some(record) = state.endpoints.get_mut(&old) {
                    record.detach(&wrapper);
                    record.call_counter().clear();
                }
                if wrapper.ejection_requested() {
                    wrapper.uneject();
                }
            }
            (None, Some(new)) => {
                if let Some(record) = state.endpoints.get_mut(&new) {
                    record.attach(&wrapper);
                    if record.is_ejected() {
                        wrapper.eject();
                    }
                }
            }
            (None, None) => {}
        }
        wrapper.set_addresses(addresses);
    }

    fn on_transport_state(&self, wrapper: &Arc<ChannelWrapper>, channel_state: ChannelState) {
        {
            let mut state = self.lock_state();
            let id = wrapper.id();
            if !state.wrappers.contains_key(&id) {
                tracing::debug!(channel = %id, "State update for a released channel");
                return;
            }
            if channel_state.connectivity_state == ConnectivityState::Shutdown {
                state.wrappers.remove(&id);
                if let Some(addr) = wrapper.single_address() {
                    if let Some(record) = state.endpoints.get_mut(&addr) {
                        record.detach(wrapper);
                    }
                }
            }
        }
        let _ = self.channel_tx.send(ChannelUpdate::State {
            wrapper: wrapper.clone(),
            state: channel_state,
        });
    }

    fn handle_channel_update(&self, update: ChannelUpdate) {
        match update {
            ChannelUpdate::State { wrapper, state } => {
                if let Some(state) = wrapper.apply_transport_state(state) {
                    let _child = self.lock_child();
                    wrapper.notify(state);
                }
            }
            ChannelUpdate::Ejection { wrapper, ejected } => {
                let state = wrapper.apply_ejection(ejected);
                let _child = self.lock_child();
                wrapper.notify(state);
            }
        }
    }

    fn publish(&self, child_state: &BalancerState, noop: bool) {
        tracing::debug!(
            state = %child_state.connectivity_state,
            noop,
            "Publishing picker"
        );
        metrics::record_picker_update(noop);
        self.upstream.update_state(BalancerState {
            connectivity_state: child_state.connectivity_state,
            picker: Arc::new(WrappedPicker::new(child_state.picker.clone(), noop)),
        });
    }
}

/// Run-loop-local picker bookkeeping.
#[derive(Default)]
struct PickerSerializer {
    child_state: Option<BalancerState>,
    recent_picker_noop: bool,
}

impl PickerSerializer {
    fn handle(&mut self, inner: &Inner, update: PickerUpdate) {
        match update {
            PickerUpdate::Child(child_state) => {
                let noop = {
                    let mut state = inner.lock_state();
                    if state.inhibit_picker_updates {
                        state.update_unconditionally = true;
                        self.child_state = Some(child_state);
                        return;
                    }
                    state.config.as_ref().map_or(true, |c| c.is_noop())
                };
                self.recent_picker_noop = noop;
                inner.publish(&child_state, noop);
                self.child_state = Some(child_state);
            }
            PickerUpdate::ConfigApplied { noop, done } => {
                let unconditional = inner.lock_state().update_unconditionally;
                if let Some(child_state) = &self.child_state {
                    if noop != self.recent_picker_noop || unconditional {
                        self.recent_picker_noop = noop;
                        inner.publish(child_state, noop);
                    }
                }
                {
                    let mut state = inner.lock_state();
                    state.inhibit_picker_updates = false;
                    state.update_unconditionally = false;
                }
                let _ = done.send(());
            }
        }
    }
}

async fn run(
    inner: Arc<Inner>,
    mut channel_rx: mpsc::UnboundedReceiver<ChannelUpdate>,
    mut picker_rx: mpsc::UnboundedReceiver<PickerUpdate>,
    mut stop: broadcast::Receiver<()>,
) {
    let mut pickers = PickerSerializer::default();
    loop {
        tokio::select! {
            update = channel_rx.recv() => {
                let Some(update) = update else { break };
                if inner.shutdown.is_triggered() {
                    break;
                }
                inner.handle_channel_update(update);
            }
            update = picker_rx.recv() => {
                let Some(update) = update else { break };
                if inner.shutdown.is_triggered() {
                    break;
                }
                pickers.handle(&inner, update);
            }
            _ = stop.recv() => break,
        }
    }
    tracing::debug!("Outlier detection run loop stopped");
}

/// The controller handed to the child policy.
///
/// Holds the coordinator weakly so a child that outlives it cannot keep it
/// alive.
struct ChildController {
    inner: Weak<Inner>,
}

impl ChannelController for ChildController {
    fn new_channel(
        &self,
        addresses: Vec<Address>,
        options: NewChannelOptions,
    ) -> Result<Arc<dyn Channel>, LbError> {
        match self.inner.upgrade() {
            Some(inner) => inner.new_channel(addresses, options),
            None => Err(LbError::Closed),
        }
    }

    fn update_addresses(&self, channel: &Arc<dyn Channel>, addresses: Vec<Address>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.update_addresses(channel, addresses);
        }
    }

    fn update_state(&self, state: BalancerState) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.picker_tx.send(PickerUpdate::Child(state));
        }
    }

    fn resolve_now(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.upstream.resolve_now();
        }
    }
}
