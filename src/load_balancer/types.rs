//! Shared load balancing types and error definitions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::load_balancer::{Channel, Picker};

/// Connectivity state of a channel, or the aggregate state of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectivityState {
    #[default]
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "IDLE"),
            ConnectivityState::Connecting => write!(f, "CONNECTING"),
            ConnectivityState::Ready => write!(f, "READY"),
            ConnectivityState::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
            ConnectivityState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// A resolved backend address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub addr: String,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

impl From<&str> for Address {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

/// State update delivered for a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelState {
    pub connectivity_state: ConnectivityState,
    /// Set when the state is `TransientFailure` and the transport knows why.
    pub connection_error: Option<String>,
}

impl ChannelState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            connection_error: None,
        }
    }
}

/// Identity of a transport-level channel, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Allocate the next process-wide identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Callback receiving state changes for one channel.
pub type StateListener = Arc<dyn Fn(ChannelState) + Send + Sync>;

/// Options for creating a channel.
#[derive(Clone, Default)]
pub struct NewChannelOptions {
    pub state_listener: Option<StateListener>,
}

impl fmt::Debug for NewChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewChannelOptions")
            .field("state_listener", &self.state_listener.is_some())
            .finish()
    }
}

/// Resolver output handed to a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
}

impl ResolverState {
    pub fn new<I, A>(addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }
}

/// Resolver state plus the policy-specific configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConnState {
    pub resolver_state: ResolverState,
    pub config: Option<serde_json::Value>,
}

/// Aggregate state and picker published by a policy.
#[derive(Clone)]
pub struct BalancerState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl fmt::Debug for BalancerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancerState")
            .field("connectivity_state", &self.connectivity_state)
            .finish_non_exhaustive()
    }
}

/// Per-RPC information available to a picker.
#[derive(Debug, Clone, Default)]
pub struct PickInfo {
    pub method: String,
}

/// Outcome of a finished RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoneInfo {
    /// `None` when the RPC succeeded.
    pub error: Option<String>,
}

impl DoneInfo {
    pub fn success() -> Self {
        Self { error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}

/// Completion callback attached to a pick.
pub type DoneCallback = Box<dyn FnOnce(&DoneInfo) + Send>;

/// The channel chosen for an RPC.
pub struct PickResult {
    pub channel: Arc<dyn Channel>,
    pub on_complete: Option<DoneCallback>,
}

impl PickResult {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            on_complete: None,
        }
    }

    /// Report the RPC outcome, consuming the completion callback.
    pub fn complete(self, info: &DoneInfo) {
        if let Some(done) = self.on_complete {
            done(info);
        }
    }
}

impl fmt::Debug for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickResult")
            .field("channel", &self.channel)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Errors produced by the load balancing layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LbError {
    /// The resolver produced an unusable state (for example no addresses).
    #[error("bad resolver state")]
    BadResolverState,

    /// The configured child policy has no registered builder.
    #[error("child policy {0:?} not registered")]
    ChildPolicyNotRegistered(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No channel is ready yet; the RPC should wait for the next picker.
    #[error("no channel available")]
    NoChannelAvailable,

    /// All channels are failing.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The owning channel refused to create a channel.
    #[error("channel creation failed: {0}")]
    ChannelCreation(String),

    /// The balancer has been shut down.
    #[error("balancer closed")]
    Closed,
}

impl From<ConfigError> for LbError {
    fn from(err: ConfigError) -> Self {
        LbError::InvalidConfig(err.to_string())
    }
}
