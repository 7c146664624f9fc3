// ── Event emission ──
//
// Runs pre-send hooks over a normalized event and publishes it to the
// raw exchange. Failures end here: they are logged and never reach the
// polling loop that produced the event.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::MessageSink;
use crate::error::CoreError;
use crate::event::NormalizedEvent;

/// Transform applied to every event before publication.
///
/// Hooks run in registration order; each sees the previous one's output.
#[async_trait]
pub trait PreSendHook: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, event: NormalizedEvent) -> Result<NormalizedEvent, CoreError>;
}

/// Outcome of [`Emitter::emit`], mostly useful to tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    Published,
    /// A hook failed; the event was dropped.
    Dropped,
    /// Serialization or publication failed.
    Failed,
}

#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn MessageSink>,
    exchange: String,
    routing_key: String,
    hooks: Vec<Arc<dyn PreSendHook>>,
}

impl Emitter {
    pub fn new(sink: Arc<dyn MessageSink>, exchange: impl Into<String>) -> Self {
        Self {
            sink,
            exchange: exchange.into(),
            routing_key: String::new(),
            hooks: Vec::new(),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn PreSendHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn emit(&self, event: NormalizedEvent) -> Emitted {
        let source = event.brokerage.id.clone();
        let mut event = event;

        for hook in &self.hooks {
            match hook.apply(event).await {
                Ok(next) => event = next,
                Err(e) => {
                    warn!(hook = hook.name(), source = %source, error = %e, "pre-send hook failed, dropping event");
                    return Emitted::Dropped;
                }
            }
        }

        let payload = match event.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                warn!(source = %source, error = %e, "failed to encode event");
                return Emitted::Failed;
            }
        };

        match self.sink.publish(&self.exchange, &self.routing_key, payload).await {
            Ok(()) => {
                debug!(source = %event.brokerage.id, exchange = %self.exchange, "event published");
                Emitted::Published
            }
            Err(e) => {
                warn!(source = %source, exchange = %self.exchange, error = %e, "failed to submit event for processing");
                Emitted::Failed
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::bus::{MemoryBus, MessageSource};
    use crate::event::{TimeseriesRef, ValueRef};

    fn event(source: &str) -> NormalizedEvent {
        let mut event = NormalizedEvent {
            brokerage: crate::event::BrokerageRef::default(),
            platform: crate::event::PlatformRef::default(),
            sensor: crate::event::SensorRef::default(),
            timeseries: TimeseriesRef {
                unit: None,
                value: ValueRef {
                    time: Utc::now(),
                    time_accuracy: None,
                    data: Some(serde_json::json!(1.0)),
                    kind: "Real".into(),
                },
            },
        };
        event.brokerage.broker.id = "BMS".into();
        event.brokerage.id = source.into();
        event
    }

    struct Suffix;

    #[async_trait]
    impl PreSendHook for Suffix {
        fn name(&self) -> &str {
            "suffix"
        }

        async fn apply(&self, mut event: NormalizedEvent) -> Result<NormalizedEvent, CoreError> {
            event.brokerage.id.push_str(":A");
            Ok(event)
        }
    }

    struct Broken;

    #[async_trait]
    impl PreSendHook for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn apply(&self, _event: NormalizedEvent) -> Result<NormalizedEvent, CoreError> {
            Err(CoreError::Hook {
                hook: "broken".into(),
                reason: "classifier offline".into(),
            })
        }
    }

    #[tokio::test]
    async fn hooks_rewrite_before_publish() {
        let bus = MemoryBus::new();
        bus.bind("uo.raw", "q");
        let emitter = Emitter::new(Arc::new(bus.clone()), "uo.raw").with_hook(Arc::new(Suffix));

        assert_eq!(emitter.emit(event("CAM1")).await, Emitted::Published);
        let mut source = bus.consume("q").await.unwrap();
        let delivery = source.next().await.unwrap();
        let sent = NormalizedEvent::from_slice(delivery.payload()).unwrap();
        assert_eq!(sent.brokerage.id, "CAM1:A");
    }

    #[tokio::test]
    async fn hook_failure_drops_the_event() {
        let bus = MemoryBus::new();
        bus.bind("uo.raw", "q");
        let emitter = Emitter::new(Arc::new(bus.clone()), "uo.raw").with_hook(Arc::new(Broken));

        assert_eq!(emitter.emit(event("CAM1")).await, Emitted::Dropped);
        assert_eq!(bus.stats("q").published, 0);
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let bus = MemoryBus::new();
        let emitter = Emitter::new(Arc::new(bus), "unbound");
        assert_eq!(emitter.emit(event("X")).await, Emitted::Failed);
    }
}
