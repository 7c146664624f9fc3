//! Command dispatch and the controller set shared by `broker` and `run`.

pub mod broker;
pub mod config_cmd;
pub mod run;
pub mod store;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use fieldlink_config::Config;
use fieldlink_core::{AppContext, ControllerRuntime, CoreError, MessageSink};

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;

pub async fn dispatch(cli: Cli, shutdown: CancellationToken) -> Result<(), CliError> {
    debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        Command::Config(args) => config_cmd::handle(args, &cli.global),
        Command::Broker(args) => broker::handle(args, &cli.global, shutdown).await,
        Command::Store(args) => store::handle(args, &cli.global, shutdown).await,
        Command::Run(args) => run::handle(args, &cli.global, shutdown).await,
    }
}

pub(crate) fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(fieldlink_config::load(global.config.as_deref())?)
}

pub(crate) fn context(
    config: &Config,
    sink: Arc<dyn MessageSink>,
    shutdown: CancellationToken,
) -> Result<AppContext, CliError> {
    Ok(AppContext::new(config.context_settings()?, sink, config.pre_send_hooks(), shutdown))
}

/// Names from `only` that are not configured, or every configured name
/// when nothing was requested.
fn select(config: &Config, only: &[String]) -> Result<Vec<String>, CliError> {
    let available: Vec<&str> = config.controllers.names().collect();
    let no_match = |requested: String| CliError::NoControllers {
        requested,
        available: if available.is_empty() {
            "none".into()
        } else {
            available.join(", ")
        },
    };

    if only.is_empty() {
        if available.is_empty() {
            return Err(no_match("any configured controller".into()));
        }
        return Ok(available.iter().map(|n| (*n).to_owned()).collect());
    }
    if let Some(unknown) = only.iter().find(|n| !available.contains(&n.as_str())) {
        return Err(no_match(format!("'{unknown}'")));
    }
    Ok(only.to_vec())
}

/// Build a runtime for every selected controller.
pub(crate) async fn runtimes(
    config: &Config,
    ctx: &AppContext,
    only: &[String],
) -> Result<Vec<ControllerRuntime>, CliError> {
    let selected = select(config, only)?;
    let wanted = |name: &str| selected.iter().any(|s| s == name);
    let failed = |controller: &str| {
        let controller = controller.to_owned();
        move |source: CoreError| CliError::Controller { controller, source }
    };

    let mut runtimes = Vec::with_capacity(selected.len());
    for options in config.bacnet_options() {
        if wanted(&options.name) {
            let name = options.name.clone();
            runtimes.push(ctx.bacnet_controller(options).await.map_err(failed(&name))?);
        }
    }
    for endpoint in config.api_endpoints()? {
        if wanted(&endpoint.options.name) {
            let name = endpoint.options.name.clone();
            runtimes.push(
                ctx.api_controller(endpoint.options, endpoint.client)
                    .map_err(failed(&name))?,
            );
        }
    }
    for options in config.socket_options()? {
        if wanted(&options.name) {
            runtimes.push(ctx.socket_controller(options));
        }
    }
    Ok(runtimes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const TWO: &str = r#"
    [controllers.socket.WX]
    address = "127.0.0.1"
    port = 4001
    values = [{ name = "t", cast_as = "float" }]

    [controllers.socket.MAST]
    address = "127.0.0.1"
    port = 4002
    values = [{ name = "t", cast_as = "float" }]
    "#;

    #[test]
    fn empty_selection_starts_everything() {
        let config = Config::from_toml(TWO).unwrap();
        assert_eq!(select(&config, &[]).unwrap(), vec!["WX", "MAST"]);
    }

    #[test]
    fn unknown_names_are_reported_with_the_alternatives() {
        let config = Config::from_toml(TWO).unwrap();
        let err = select(&config, &["WX".into(), "AHU".into()]).unwrap_err();
        let CliError::NoControllers { requested, available } = err else {
            panic!("expected NoControllers");
        };
        assert_eq!(requested, "'AHU'");
        assert_eq!(available, "WX, MAST");
    }

    #[test]
    fn no_configured_controllers_is_a_usage_error() {
        let config = Config::from_toml("").unwrap();
        assert!(matches!(select(&config, &[]), Err(CliError::NoControllers { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn configured_hooks_run_before_publish() {
        use fieldlink_core::{MemoryBus, MessageSource, NormalizedEvent};

        let config = Config::from_toml(
            r#"
            [hooks.view_classifier]
            program = "sh"
            args = ["-c", "echo 0"]
            archive_dir = "/archive"
            "#,
        )
        .unwrap();
        let bus = MemoryBus::new();
        bus.bind("uo.raw", "store");
        let ctx = context(&config, Arc::new(bus.clone()), CancellationToken::new()).unwrap();

        let event = NormalizedEvent::from_slice(
            br#"{
                "brokerage": { "broker": { "id": "CCTV" }, "id": "GH_A167F1" },
                "sensor": { "observedProperty": "Camera image" },
                "timeseries": { "value": { "time": "2026-03-01T12:00:00Z", "data": "a.jpg", "type": "File" } }
            }"#,
        )
        .unwrap();
        ctx.emitter().emit(event).await;

        let mut source = bus.consume("store").await.unwrap();
        let sent = NormalizedEvent::from_slice(source.next().await.unwrap().payload()).unwrap();
        assert_eq!(sent.brokerage.id, "GH_A167F1:V01");
    }
}
