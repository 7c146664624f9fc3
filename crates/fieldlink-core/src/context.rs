// ── Application context ──
//
// Everything controllers share, built once at startup and passed down:
// the shutdown token, the cross-controller BACnet request queue and
// socket, and the emitter that publishes to the message sink.

use std::sync::Arc;

use fieldlink_api::{BacnetClient, BacnetClientConfig, RestClient, RestClientConfig};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{ApiController, ApiOptions};
use crate::bacnet::{BacnetController, BacnetOptions};
use crate::bus::MessageSink;
use crate::controller::{ControllerRuntime, ProtocolController, RuntimeSettings};
use crate::datapoint::{DebounceRule, DebounceTable};
use crate::emit::{Emitter, PreSendHook};
use crate::error::CoreError;
use crate::queue::RequestQueue;
use crate::socket::{SocketController, SocketOptions};

/// Settings the context needs beyond individual controllers.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Exchange normalized events are published to.
    pub exchange: String,
    pub routing_key: String,
    pub bacnet: BacnetClientConfig,
    pub runtime: RuntimeSettings,
    pub debounce: Vec<DebounceRule>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            exchange: "uo.raw".into(),
            routing_key: String::new(),
            bacnet: BacnetClientConfig::default(),
            runtime: RuntimeSettings::default(),
            debounce: Vec::new(),
        }
    }
}

struct ContextInner {
    settings: ContextSettings,
    shutdown: CancellationToken,
    emitter: Emitter,
    debounce: Arc<DebounceTable>,
    bacnet_queue: RequestQueue,
    bacnet_client: OnceCell<BacnetClient>,
}

/// Cheaply cloneable handle to the shared application state.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<ContextInner>,
}

impl AppContext {
    /// Must be called within a Tokio runtime.
    pub fn new(
        settings: ContextSettings,
        sink: Arc<dyn MessageSink>,
        hooks: Vec<Arc<dyn PreSendHook>>,
        shutdown: CancellationToken,
    ) -> Self {
        let emitter = hooks.into_iter().fold(
            Emitter::new(sink, settings.exchange.clone())
                .with_routing_key(settings.routing_key.clone()),
            Emitter::with_hook,
        );
        let debounce = Arc::new(DebounceTable::new(settings.debounce.clone()));
        Self {
            inner: Arc::new(ContextInner {
                settings,
                shutdown,
                emitter,
                debounce,
                bacnet_queue: RequestQueue::new("bacnet"),
                bacnet_client: OnceCell::new(),
            }),
        }
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.inner.settings
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub fn emitter(&self) -> Emitter {
        self.inner.emitter.clone()
    }

    pub fn debounce(&self) -> Arc<DebounceTable> {
        Arc::clone(&self.inner.debounce)
    }

    /// The queue every BACnet controller submits through.
    pub fn bacnet_queue(&self) -> RequestQueue {
        self.inner.bacnet_queue.clone()
    }

    /// The shared BACnet socket, bound on first use.
    pub async fn bacnet_client(&self) -> Result<BacnetClient, CoreError> {
        let client = self
            .inner
            .bacnet_client
            .get_or_try_init(|| async {
                let client = BacnetClient::bind(&self.inner.settings.bacnet, &self.inner.shutdown).await?;
                info!(bind = %self.inner.settings.bacnet.bind, "BACnet socket bound");
                Ok::<_, CoreError>(client)
            })
            .await?;
        Ok(client.clone())
    }

    // ── Controller construction ──────────────────────────────────

    pub async fn bacnet_controller(&self, options: BacnetOptions) -> Result<ControllerRuntime, CoreError> {
        let transport = Arc::new(self.bacnet_client().await?);
        let controller = BacnetController::new(options, transport, self.bacnet_queue(), self.emitter());
        Ok(self.runtime(Arc::new(controller)))
    }

    pub fn api_controller(
        &self,
        options: ApiOptions,
        client: RestClientConfig,
    ) -> Result<ControllerRuntime, CoreError> {
        let client = RestClient::new(client)?;
        let controller = ApiController::new(options, client, self.emitter(), self.debounce());
        Ok(self.runtime(Arc::new(controller)))
    }

    pub fn socket_controller(&self, options: SocketOptions) -> ControllerRuntime {
        self.runtime(Arc::new(SocketController::new(options, self.emitter())))
    }

    /// Wrap any controller in a runtime tied to the shutdown token.
    pub fn runtime(&self, controller: Arc<dyn ProtocolController>) -> ControllerRuntime {
        ControllerRuntime::new(controller, self.inner.settings.runtime.clone(), &self.inner.shutdown)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::bus::MemoryBus;

    fn context() -> AppContext {
        let settings = ContextSettings {
            bacnet: BacnetClientConfig {
                bind: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..BacnetClientConfig::default()
            },
            ..ContextSettings::default()
        };
        AppContext::new(settings, Arc::new(MemoryBus::new()), Vec::new(), CancellationToken::new())
    }

    #[tokio::test]
    async fn bacnet_socket_is_bound_once() {
        let ctx = context();
        let a = ctx.bacnet_client().await.unwrap();
        let b = ctx.bacnet_client().await.unwrap();
        assert_eq!(a.local_addr().unwrap(), b.local_addr().unwrap());
    }

    #[tokio::test]
    async fn emitter_targets_configured_exchange() {
        let ctx = context();
        assert_eq!(ctx.emitter().exchange(), "uo.raw");
    }
}
