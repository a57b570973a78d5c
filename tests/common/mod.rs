//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use outlier_detection::config::{
    FailurePercentageEjectionConfig, OutlierDetectionConfig, SuccessRateEjectionConfig,
};
use outlier_detection::load_balancer::{
    Address, BalancerState, Channel, ChannelController, ChannelState, ClientConnState,
    ConnectivityState, DoneInfo, LbError, LoadBalancer, LoadBalancerBuilder, NewChannelOptions,
    PickInfo, PickResult, Picker,
};
use outlier_detection::simulation::SimulatedController;
use outlier_detection::{OutlierDetectionBalancer, Registry};

pub const RECORDING: &str = "recording";

/// Everything the recording child has seen and created.
#[derive(Default)]
pub struct Recorder {
    /// Listener calls as (label, state). The label is the address the
    /// channel was created for.
    events: Mutex<Vec<(String, ConnectivityState)>>,
    channels: Mutex<Vec<(String, Arc<dyn Channel>)>>,
    controller: Mutex<Option<Arc<dyn ChannelController>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<(String, ConnectivityState)> {
        self.events.lock().unwrap().clone()
    }

    /// Every state delivered for the channel labelled `label`.
    pub fn states_for(&self, label: &str) -> Vec<ConnectivityState> {
        self.events()
            .into_iter()
            .filter(|(l, _)| l == label)
            .map(|(_, s)| s)
            .collect()
    }

    pub fn last_state(&self, label: &str) -> Option<ConnectivityState> {
        self.states_for(label).last().copied()
    }

    pub fn channel(&self, label: &str) -> Arc<dyn Channel> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, c)| c.clone())
            .unwrap()
    }

    fn controller(&self) -> Arc<dyn ChannelController> {
        self.controller.lock().unwrap().clone().unwrap()
    }

    /// Ask the balancer to move the channel labelled `label` to new addresses,
    /// the way a child policy would.
    pub fn update_addresses(&self, label: &str, addresses: &[&str]) {
        let channel = self.channel(label);
        let addresses = addresses.iter().map(|a| Address::new(*a)).collect();
        self.controller().update_addresses(&channel, addresses);
    }

    pub fn resolve_now(&self) {
        self.controller().resolve_now();
    }
}

/// Child policy that creates one channel per address, connects it, records
/// every listener call and publishes a picker that routes by address.
struct RecordingPolicy {
    recorder: Arc<Recorder>,
    controller: Arc<dyn ChannelController>,
}

impl LoadBalancer for RecordingPolicy {
    fn update_client_conn_state(&mut self, state: ClientConnState) -> Result<(), LbError> {
        if state.resolver_state.addresses.is_empty() {
            return Err(LbError::BadResolverState);
        }
        for address in state.resolver_state.addresses {
            let label = address.addr.clone();
            let exists = self
                .recorder
                .channels
                .lock()
                .unwrap()
                .iter()
                .any(|(l, _)| *l == label);
            if exists {
                continue;
            }
            let recorder = self.recorder.clone();
            let listener_label = label.clone();
            let channel = self.controller.new_channel(
                vec![address],
                NewChannelOptions {
                    state_listener: Some(Arc::new(move |state: ChannelState| {
                        recorder
                            .events
                            .lock()
                            .unwrap()
                            .push((listener_label.clone(), state.connectivity_state));
                    })),
                },
            )?;
            self.recorder
                .channels
                .lock()
                .unwrap()
                .push((label, channel.clone()));
            channel.connect();
        }

        let channels = self.recorder.channels.lock().unwrap().clone();
        self.controller.update_state(BalancerState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(AddressPicker { channels }),
        });
        Ok(())
    }

    fn resolver_error(&mut self, _error: LbError) {}

    fn close(&mut self) {
        for (_, channel) in self.recorder.channels.lock().unwrap().drain(..) {
            channel.shutdown();
        }
    }
}

/// Picks the channel whose label equals `PickInfo::method`.
struct AddressPicker {
    channels: Vec<(String, Arc<dyn Channel>)>,
}

impl Picker for AddressPicker {
    fn pick(&self, info: &PickInfo) -> Result<PickResult, LbError> {
        self.channels
            .iter()
            .find(|(label, _)| *label == info.method)
            .map(|(_, channel)| PickResult::new(channel.clone()))
            .ok_or(LbError::NoChannelAvailable)
    }
}

struct RecordingBuilder {
    recorder: Arc<Recorder>,
}

impl LoadBalancerBuilder for RecordingBuilder {
    fn name(&self) -> &'static str {
        RECORDING
    }

    fn build(&self, controller: Arc<dyn ChannelController>) -> Box<dyn LoadBalancer> {
        *self.recorder.controller.lock().unwrap() = Some(controller.clone());
        Box::new(RecordingPolicy {
            recorder: self.recorder.clone(),
            controller,
        })
    }
}

pub struct Harness {
    pub controller: Arc<SimulatedController>,
    pub balancer: OutlierDetectionBalancer,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    /// A balancer over a simulated channel with the recording child
    /// registered next to the built-in policies.
    pub fn new() -> Self {
        let recorder = Arc::new(Recorder::default());
        let mut registry = Registry::with_defaults();
        registry.register(Arc::new(RecordingBuilder {
            recorder: recorder.clone(),
        }));
        let controller = Arc::new(SimulatedController::new());
        let balancer = OutlierDetectionBalancer::new(controller.clone(), registry);
        Self {
            controller,
            balancer,
            recorder,
        }
    }

    /// Complete RPCs to `addr` through the latest published picker.
    pub fn send(&self, addr: &str, successes: u32, failures: u32) {
        let picker = self.controller.latest_picker().unwrap();
        let info = PickInfo {
            method: addr.to_string(),
        };
        for i in 0..successes + failures {
            let result = picker.pick(&info).unwrap();
            let done = if i < successes {
                DoneInfo::success()
            } else {
                DoneInfo::failure("unavailable")
            };
            result.complete(&done);
        }
    }

    pub fn is_ejected(&self, addr: &str) -> bool {
        self.balancer
            .endpoint_snapshot()
            .iter()
            .any(|e| e.address == addr && e.ejected)
    }

    pub fn multiplier(&self, addr: &str) -> u32 {
        self.balancer
            .endpoint_snapshot()
            .iter()
            .find(|e| e.address == addr)
            .map(|e| e.ejection_time_multiplier)
            .unwrap()
    }
}

pub fn addresses(list: &[&str]) -> outlier_detection::load_balancer::ResolverState {
    outlier_detection::load_balancer::ResolverState::new(list.iter().copied())
}

pub fn noop_config() -> OutlierDetectionConfig {
    OutlierDetectionConfig {
        interval_ms: 1_000,
        ..OutlierDetectionConfig::new(RECORDING)
    }
}

pub fn failure_percentage_config() -> OutlierDetectionConfig {
    OutlierDetectionConfig {
        interval_ms: 1_000,
        base_ejection_time_ms: 10_000,
        max_ejection_time_ms: 30_000,
        max_ejection_percent: 50,
        failure_percentage_ejection: Some(FailurePercentageEjectionConfig {
            threshold: 50,
            enforcement_percentage: 100,
            minimum_hosts: 2,
            request_volume: 10,
        }),
        ..OutlierDetectionConfig::new(RECORDING)
    }
}

pub fn success_rate_config(max_ejection_percent: u32) -> OutlierDetectionConfig {
    OutlierDetectionConfig {
        interval_ms: 1_000,
        base_ejection_time_ms: 10_000,
        max_ejection_time_ms: 30_000,
        max_ejection_percent,
        success_rate_ejection: Some(SuccessRateEjectionConfig {
            stdev_factor: 1000,
            enforcement_percentage: 100,
            minimum_hosts: 5,
            request_volume: 100,
        }),
        ..OutlierDetectionConfig::new(RECORDING)
    }
}
