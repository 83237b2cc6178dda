//! Fire-and-forget publication of pipeline events.

use tracing::warn;

use im2_events::{EventBus, PipelineEvent};

/// Object-safe view of an [`EventBus`] carrying [`PipelineEvent`]s.
///
/// Publication happens after the store commit; a failure is logged and never
/// undoes the transition.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

impl<B> EventSink for B
where
    B: EventBus<PipelineEvent>,
{
    fn emit(&self, event: PipelineEvent) {
        let kind = event.kind.clone();
        if let Err(error) = self.publish(event) {
            warn!(error = %error, kind = ?kind, "failed to publish pipeline event");
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Fan out to several sinks (e.g. in-process bus plus Redis).
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: PipelineEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
