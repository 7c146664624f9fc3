// ── Delimited TCP controller ──
//
// Streams delimited frames from a raw TCP device. There is no discovery
// or polling; each frame updates the configured variables and emits the
// ones that changed. The runtime reconnects after the stream drops.

pub mod frame;
pub mod variable;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use indexmap::IndexMap;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{ProtocolController, Schedule};
use crate::datapoint::MetadataTemplate;
use crate::emit::Emitter;
use crate::error::CoreError;
use crate::event::{Meta, NormalizedEvent};

pub use frame::{CastAs, ValueDescription, interpret, next_frame, split_fields};
pub use variable::SocketVariable;

/// Frames longer than this without a terminator are discarded.
const MAX_FRAME: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub delimiter: String,
    /// Drop characters outside `[A-Za-z0-9.; ,]` before splitting.
    pub strip_characters: bool,
    pub values: Vec<ValueDescription>,
    pub template: MetadataTemplate,
}

pub struct SocketController {
    options: SocketOptions,
    emitter: Emitter,
    endpoint: Mutex<Option<SocketAddr>>,
    variables: Mutex<IndexMap<String, SocketVariable>>,
}

impl SocketController {
    pub fn new(options: SocketOptions, emitter: Emitter) -> Self {
        let expected: usize = options.values.iter().map(ValueDescription::width).sum();
        debug!(controller = %options.name, expected, "expecting values per frame");
        Self {
            options,
            emitter,
            endpoint: Mutex::new(None),
            variables: Mutex::new(IndexMap::new()),
        }
    }

    pub async fn variable(&self, name: &str) -> Option<SocketVariable> {
        self.variables.lock().await.get(name).cloned()
    }

    /// Apply one frame and emit the variables that changed.
    pub async fn process_frame(&self, raw: &str) {
        let fields = split_fields(raw, &self.options.delimiter, self.options.strip_characters);
        let Some(values) = interpret(&fields, &self.options.values) else {
            warn!(
                controller = %self.options.name,
                fields = fields.len(),
                "received socket data that does not match expected length"
            );
            return;
        };

        let now = Utc::now();
        let events: Vec<NormalizedEvent> = {
            let mut variables = self.variables.lock().await;
            values
                .into_iter()
                .filter_map(|(name, value)| {
                    let variable = variables.entry(name.clone()).or_insert_with(|| {
                        let description = self
                            .options
                            .values
                            .iter()
                            .find(|d| d.name == name)
                            .cloned()
                            .unwrap_or_else(|| ValueDescription {
                                name: name.clone(),
                                cast_as: CastAs::String,
                                length: None,
                                matrix: None,
                            });
                        SocketVariable::new(description)
                    });
                    if !variable.consume(value, now) {
                        return None;
                    }
                    variable.to_event(&self.options.name, &self.metadata(), &self.options.template)
                })
                .collect()
        };

        for event in events {
            self.emitter.emit(event).await;
        }
    }
}

#[async_trait]
impl ProtocolController for SocketController {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn protocol(&self) -> &'static str {
        "Raw TCP/IP"
    }

    fn metadata(&self) -> Meta {
        let mut meta = Meta::new();
        meta.insert("protocol".into(), self.protocol().into());
        meta
    }

    fn address(&self) -> Option<&str> {
        Some(&self.options.address)
    }

    fn port(&self) -> u16 {
        self.options.port
    }

    fn schedule(&self) -> Schedule {
        Schedule {
            discovery: None,
            acquisition: None,
            streaming: true,
        }
    }

    async fn connect(&self, endpoint: Option<SocketAddr>) -> Result<(), CoreError> {
        if endpoint.is_none() {
            return Err(CoreError::Connection {
                controller: self.options.name.clone(),
                reason: "no address configured".into(),
            });
        }
        *self.endpoint.lock().await = endpoint;
        Ok(())
    }

    async fn stream(&self, cancel: CancellationToken) -> Result<(), CoreError> {
        let endpoint = self.endpoint.lock().await.ok_or_else(|| CoreError::NotConnected {
            controller: self.options.name.clone(),
        })?;

        let mut socket = TcpStream::connect(endpoint)
            .await
            .map_err(|e| CoreError::Connection {
                controller: self.options.name.clone(),
                reason: e.to_string(),
            })?;
        info!(controller = %self.options.name, %endpoint, "connected socket");

        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                read = socket.read_buf(&mut buffer) => read,
            };
            match read {
                Ok(0) => {
                    info!(controller = %self.options.name, "socket closed by peer");
                    return Ok(());
                }
                Ok(_) => {
                    while let Some(frame) = next_frame(&mut buffer) {
                        self.process_frame(&frame).await;
                    }
                    if buffer.len() > MAX_FRAME {
                        warn!(controller = %self.options.name, bytes = buffer.len(), "discarding unterminated data");
                        buffer.clear();
                    }
                }
                Err(e) => {
                    return Err(CoreError::Connection {
                        controller: self.options.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        info!(controller = %self.options.name, "disconnecting from socket");
        *self.endpoint.lock().await = None;
        Ok(())
    }
}
