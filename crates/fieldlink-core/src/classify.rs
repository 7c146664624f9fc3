// ── Camera view classifier ──
//
// Pre-send hook for archived camera images. An external classifier
// program names which of a camera's fixed views the image shows; the
// event is then split into one series per view.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::api::instance::FILE_URL_KEY;
use crate::emit::PreSendHook;
use crate::error::CoreError;
use crate::event::NormalizedEvent;

pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewClassifierOptions {
    /// Controllers whose events are classified. Empty means all.
    pub controllers: Vec<String>,
    pub program: PathBuf,
    /// `{image}` is replaced by the archived image path.
    pub args: Vec<String>,
    /// Root the archived file names are relative to.
    pub archive_dir: PathBuf,
    /// Source id prefixes never classified.
    pub disabled: Vec<String>,
    pub timeout: Duration,
}

pub struct ViewClassifier {
    options: ViewClassifierOptions,
}

impl ViewClassifier {
    pub fn new(options: ViewClassifierOptions) -> Self {
        Self { options }
    }

    fn wants(&self, event: &NormalizedEvent) -> bool {
        let controller = &event.brokerage.broker.id;
        let source = &event.brokerage.id;
        (self.options.controllers.is_empty() || self.options.controllers.contains(controller))
            && !self.options.disabled.iter().any(|p| source.starts_with(p.as_str()))
    }

    async fn classify(&self, image: &str) -> Result<Option<u32>, CoreError> {
        let path = self.options.archive_dir.join(image);
        let path = path.to_string_lossy();
        let args = self.options.args.iter().map(|a| a.replace("{image}", &path));

        let run = Command::new(&self.options.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.options.timeout, run)
            .await
            .map_err(|_| self.failure(format!("no answer within {:?}", self.options.timeout)))?
            .map_err(|e| self.failure(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(format!("{}: {}", output.status, stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().parse().ok())
    }

    fn failure(&self, reason: String) -> CoreError {
        CoreError::Hook {
            hook: self.name().to_owned(),
            reason,
        }
    }
}

/// Archived image behind a reading: the data itself when it is a file
/// name, else the first archived file.
fn archived_image(data: Option<&Value>) -> Option<&str> {
    match data? {
        Value::String(name) => Some(name.as_str()),
        Value::Object(fields) => fields.get(FILE_URL_KEY)?.get(0)?.as_str(),
        _ => None,
    }
}

/// Rename the series after the view, counted from one.
fn split_by_view(mut event: NormalizedEvent, view: u32) -> NormalizedEvent {
    let suffix = format!("{:02}", view + 1);
    event.brokerage.id = format!("{}:V{suffix}", event.brokerage.id);
    event.sensor.observed_property = format!("{}: View {suffix}", event.sensor.observed_property);
    event.sensor.meta.insert("viewId".into(), view.into());
    event
}

#[async_trait]
impl PreSendHook for ViewClassifier {
    fn name(&self) -> &str {
        "view-classifier"
    }

    /// Classification problems never drop the event; it goes out
    /// unclassified instead.
    async fn apply(&self, event: NormalizedEvent) -> Result<NormalizedEvent, CoreError> {
        if !self.wants(&event) {
            return Ok(event);
        }
        let Some(image) = archived_image(event.timeseries.value.data.as_ref()) else {
            return Ok(event);
        };

        match self.classify(image).await {
            Ok(Some(view)) => {
                debug!(source = %event.brokerage.id, view, "image classified");
                Ok(split_by_view(event, view))
            }
            Ok(None) => {
                warn!(source = %event.brokerage.id, "invalid classification returned");
                Ok(event)
            }
            Err(e) => {
                warn!(source = %event.brokerage.id, error = %e, "image classification failed");
                Ok(event)
            }
        }
    }
}
