//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Resolver addresses + OutlierDetectionConfig
//!     → outlier.rs (update endpoint map, schedule interval timer)
//!     → child policy (round_robin.rs / pick_first.rs via registry.rs)
//!         → new channels are created through outlier.rs
//!           and handed back as wrapper.rs ChannelWrappers
//!         → child pickers are published through outlier.rs
//!           and wrapped by picker.rs
//!     → RPC picks go through WrappedPicker
//!     → completions increment the endpoint's call counter (health/)
//! ```
//!
//! # Design Decisions
//! - The child policy never sees transport channels directly, only wrappers
//! - All listener calls into the child are serialized on one task
//! - The hot pick path is lock-free; only atomics are touched per RPC
//! - Child policies are trait objects selected by name from a registry

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

pub mod outlier;
pub mod pick_first;
pub mod picker;
pub mod registry;
pub mod round_robin;
pub mod types;
pub mod wrapper;

pub use outlier::{EndpointSnapshot, OutlierDetectionBalancer};
pub use registry::Registry;
pub use types::*;

/// A transport-level connection to one or more addresses.
pub trait Channel: Send + Sync + Debug {
    /// Identity assigned by the owning channel.
    fn id(&self) -> ChannelId;

    /// Ask the transport to start connecting.
    fn connect(&self);

    /// Tear the channel down. The listener receives a final `Shutdown` state.
    fn shutdown(&self);

    /// Access to the concrete type behind the trait object.
    fn as_any(&self) -> &dyn Any;
}

/// The API a policy uses to talk to whatever sits above it.
pub trait ChannelController: Send + Sync {
    /// Create a channel for the given addresses.
    fn new_channel(
        &self,
        addresses: Vec<Address>,
        options: NewChannelOptions,
    ) -> Result<Arc<dyn Channel>, LbError>;

    /// Replace the address list of an existing channel.
    fn update_addresses(&self, channel: &Arc<dyn Channel>, addresses: Vec<Address>);

    /// Publish a new aggregate state and picker.
    fn update_state(&self, state: BalancerState);

    /// Ask the resolver to re-resolve.
    fn resolve_now(&self) {}
}

/// Selects a channel for each RPC.
pub trait Picker: Send + Sync {
    fn pick(&self, info: &PickInfo) -> Result<PickResult, LbError>;
}

/// A load balancing policy that can sit below the outlier detection layer.
pub trait LoadBalancer: Send {
    /// Apply a new resolver state and policy configuration.
    fn update_client_conn_state(&mut self, state: ClientConnState) -> Result<(), LbError>;

    /// The resolver failed; keep using the previous addresses if any.
    fn resolver_error(&mut self, error: LbError);

    /// Leave idle mode and start connecting.
    fn exit_idle(&mut self) {}

    /// Release every channel owned by the policy.
    fn close(&mut self);
}

/// Constructs policies of one kind.
pub trait LoadBalancerBuilder: Send + Sync {
    /// The name used in `child_policy.name`.
    fn name(&self) -> &'static str;

    fn build(&self, controller: Arc<dyn ChannelController>) -> Box<dyn LoadBalancer>;
}
