//! Picker wrapper that counts RPC results.

use std::sync::Arc;

use crate::load_balancer::wrapper::ChannelWrapper;
use crate::load_balancer::{DoneCallback, DoneInfo, LbError, PickInfo, PickResult, Picker};

/// Wraps the child's picker.
///
/// Unwraps the chosen channel back to its transport channel and, unless the
/// active config is a no-op, records each completion in the endpoint's
/// call counter.
pub struct WrappedPicker {
    child: Arc<dyn Picker>,
    noop: bool,
}

impl WrappedPicker {
    pub fn new(child: Arc<dyn Picker>, noop: bool) -> Self {
        Self { child, noop }
    }
}

impl Picker for WrappedPicker {
    fn pick(&self, info: &PickInfo) -> Result<PickResult, LbError> {
        let PickResult {
            channel,
            on_complete,
        } = self.child.pick(info)?;

        let Some(wrapper) = channel.as_any().downcast_ref::<ChannelWrapper>() else {
            tracing::error!(channel = ?channel, "Child picked a channel not created through outlier detection");
            return Ok(PickResult {
                channel,
                on_complete,
            });
        };

        let underlying = wrapper.underlying().clone();
        let counter = (!self.noop).then(|| wrapper.counter_slot());

        let done: DoneCallback = Box::new(move |done_info: &DoneInfo| {
            // Loaded at completion time: the wrapper may have moved endpoints
            // while the RPC was in flight.
            if let Some(slot) = counter {
                if let Some(counter) = &*slot.load() {
                    counter.record(done_info.error.is_none());
                }
            }
            if let Some(child_done) = on_complete {
                child_done(done_info);
            }
        });

        Ok(PickResult {
            channel: underlying,
            on_complete: Some(done),
        })
    }
}
