/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::main
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Entry point for Syn-Pkg-Core. Initialises the packager
    facade and serves JSON-RPC requests over stdio, or
    performs a single call from the command line.

  Security / Safety Notes:
    Operates within user privileges. Writes bundles only below
    the configured applications directory. Stdout carries RPC
    traffic exclusively; diagnostics go to stderr and the log.

  Dependencies:
    clap for CLI parsing, chrono for session stamps, tokio for
    the runtime and stdio.

  Operational Scope:
    Launched by a host process that speaks line-delimited
    JSON-RPC, or by operators issuing one-off calls.

  Revision History:
    2026-10-17 COD  Authored Syn-Pkg-Core runtime.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Result-first error handling with deterministic exits
    - Structured logging following Synavera cadence
    - Configurable execution via CLI and config file
============================================================*/

mod config;
mod error;
mod fetch;
mod installer;
mod logger;
mod package_info;
mod packager;
mod plugin;
mod rpc;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use config::PackagerConfig;
use error::{PackagerError, Result};
use logger::Logger;
use packager::{InstallerEvent, InstallerEventKind};
use plugin::PackagerPlugin;
use rpc::{Dispatcher, RpcRequest, RpcResponse};

/// Exit status when a one-shot call is answered with an RPC error.
const RPC_FAILURE_EXIT: u8 = 60;

/// Command-line arguments for Syn-Pkg-Core.
#[derive(Debug, Parser)]
#[command(
    name = "Syn-Pkg-Core",
    version,
    author = "Synavera Systems",
    about = "Package installer service for Syn-Pkg"
)]
struct Cli {
    /// Override configuration file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Explicit log file path.
    #[arg(long, global = true, value_name = "PATH")]
    log: Option<PathBuf>,
    /// Enable verbose logging to stderr.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve line-delimited JSON-RPC 2.0 over stdin/stdout.
    Serve,
    /// Perform one call and print the response; a started install is awaited.
    Call {
        /// Method name, e.g. `getInstalled`.
        method: String,
        /// Parameter object as JSON.
        params: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[Syn-Pkg-Core] {}", err);
            err.exit_code()
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = PackagerConfig::load_from_optional_path(cli.config.as_deref())?;

    let session_stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let log_path = cli
        .log
        .clone()
        .unwrap_or_else(|| config.log_dir().join(format!("core_{session_stamp}.log")));
    let logger = Arc::new(Logger::new(Some(log_path), cli.verbose)?);
    logger.info("INIT", "Syn-Pkg Core awakening.");

    let plugin = PackagerPlugin::new();
    let connection = plugin.initialize(&config, logger.clone())?;
    logger.debug("PLUGIN", plugin.information());

    let outcome = match cli.command {
        Command::Serve => {
            let served = serve(&plugin, &logger, tokio::io::stdin(), tokio::io::stdout()).await;
            // Stdin closing, or failing, is the remote side going away.
            plugin.deactivated(connection).await;
            served.map(|_| 0)
        }
        Command::Call { method, params } => {
            let called = call_once(&plugin, &logger, &method, params.as_deref()).await;
            plugin.deinitialize().await;
            called
        }
    };

    if let Err(err) = &outcome {
        logger.error("RUNTIME", err.to_string());
    }
    logger.info("COMPLETE", "Syn-Pkg Core at rest.");
    logger.finalize()?;
    outcome.map(ExitCode::from)
}

/// Serve requests from `input` until it ends; returns `output` once drained.
async fn serve<R, W>(
    plugin: &PackagerPlugin,
    logger: &Arc<Logger>,
    input: R,
    mut output: W,
) -> Result<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let dispatcher = plugin.dispatcher();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<W, std::io::Error>(output)
    });

    let forwarder = plugin
        .subscribe()
        .map(|events| tokio::spawn(forward_events(events, tx.clone(), logger.clone())));

    logger.info("SERVE", "Accepting JSON-RPC requests on stdin");
    let pumped = pump_requests(&dispatcher, logger, BufReader::new(input), &tx).await;

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    drop(tx);
    let output = writer
        .await
        .map_err(|err| PackagerError::Runtime(format!("stdout writer failed: {err}")))??;
    pumped?;
    Ok(output)
}

async fn pump_requests<R: AsyncBufRead + Unpin>(
    dispatcher: &Dispatcher,
    logger: &Logger,
    mut reader: R,
    tx: &mpsc::UnboundedSender<String>,
) -> Result<()> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read?,
            _ = tokio::signal::ctrl_c() => {
                logger.warn("SERVE", "Interrupted; shutting down");
                0
            }
        };
        if read == 0 {
            return Ok(());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        logger.debug(
            "RPC",
            format!("<- {}", String::from_utf8_lossy(&line).trim_end()),
        );
        if let Some(reply) = dispatcher.dispatch_bytes(&line).await {
            logger.debug("RPC", format!("-> {reply}"));
            if tx.send(reply).is_err() {
                return Err(PackagerError::Runtime("stdout writer stopped".into()));
            }
        }
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<InstallerEvent>,
    tx: mpsc::UnboundedSender<String>,
    logger: Arc<Logger>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let notification = json!({
                    "jsonrpc": "2.0",
                    "method": "event",
                    "params": event,
                });
                if tx.send(notification.to_string()).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                logger.warn("EVENTS", format!("Dropped {skipped} installer events"));
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn call_once(
    plugin: &PackagerPlugin,
    logger: &Logger,
    method: &str,
    params: Option<&str>,
) -> Result<u8> {
    let params = params
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|err| PackagerError::Serialization(format!("Invalid params JSON: {err}")))?;

    let mut events = plugin.subscribe();
    let response = plugin
        .dispatcher()
        .dispatch(RpcRequest::new(1, method, params))
        .await
        .ok_or_else(|| PackagerError::Runtime("No response produced".into()))?;
    print_response(&response)?;

    if response.error.is_some() {
        return Ok(RPC_FAILURE_EXIT);
    }

    let task = response
        .result
        .as_ref()
        .and_then(|result| result.get("task"))
        .and_then(Value::as_str);
    // Teardown cancels whatever is still running, so the task must land first.
    if let (Some(task), Some(events)) = (task, events.as_mut()) {
        logger.info("CALL", format!("Waiting for {task} to settle"));
        return wait_for_task(events, task, logger).await;
    }
    Ok(0)
}

async fn wait_for_task(
    events: &mut broadcast::Receiver<InstallerEvent>,
    task: &str,
    logger: &Logger,
) -> Result<u8> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                logger.warn("EVENTS", format!("Dropped {skipped} installer events"));
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(PackagerError::Runtime(format!(
                    "Installer stopped before {task} settled"
                )))
            }
        };
        if event.task.as_deref() != Some(task) {
            continue;
        }
        match event.kind {
            InstallerEventKind::Progress(percent) => {
                logger.info("PROGRESS", format!("{task} {percent}%"));
            }
            InstallerEventKind::Installed => {
                eprintln!("→ {task} installed {}", event.pkg_id);
                return Ok(0);
            }
            InstallerEventKind::Cancelled => {
                eprintln!("→ {task} cancelled");
                return Ok(RPC_FAILURE_EXIT);
            }
            InstallerEventKind::Failed(status) => {
                eprintln!("→ {task} failed: {status}");
                return Ok(RPC_FAILURE_EXIT);
            }
            InstallerEventKind::Removed => {}
        }
    }
}

fn print_response(response: &RpcResponse) -> Result<()> {
    let body = serde_json::to_string_pretty(response).map_err(|err| {
        PackagerError::Serialization(format!("Failed to encode response: {err}"))
    })?;
    println!("{body}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    use crate::store::PackageStore;

    fn attached_plugin() -> (PackagerPlugin, Arc<Logger>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().display().to_string();
        let config = PackagerConfig::from_toml_str(&format!(
            "[paths]\napps_dir = \"{root}/apps\"\nstore_path = \"{root}/state/packages.json\"\n"
        ))
        .unwrap();
        let logger = Arc::new(Logger::new(None, false).unwrap());
        let plugin = PackagerPlugin::new();
        plugin.initialize(&config, logger.clone()).unwrap();
        (plugin, logger, dir)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn call_accepts_method_params_and_global_flags() {
        let cli = Cli::try_parse_from([
            "Syn-Pkg-Core",
            "call",
            "isInstalled",
            r#"{"id":"com.example.app"}"#,
            "--verbose",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Call { method, params } => {
                assert_eq!(method, "isInstalled");
                assert_eq!(params.as_deref(), Some(r#"{"id":"com.example.app"}"#));
            }
            Command::Serve => panic!("expected call"),
        }
    }

    #[test]
    fn serve_takes_config_override() {
        let cli =
            Cli::try_parse_from(["Syn-Pkg-Core", "--config", "/etc/synpkg.toml", "serve"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/synpkg.toml")));
        assert!(matches!(cli.command, Command::Serve));
    }

    #[test]
    fn call_has_no_detached_mode() {
        let parsed = Cli::try_parse_from(["Syn-Pkg-Core", "call", "install", "{}", "--no-wait"]);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn call_keeps_a_started_install_until_it_lands() {
        let (plugin, logger, dir) = attached_plugin();
        let bundle = dir.path().join("big.tar");
        std::fs::write(&bundle, vec![7u8; 2_000_000]).unwrap();
        let params = json!({ "id": "com.example.big", "url": bundle.display().to_string() });

        let code = call_once(&plugin, &logger, "install", Some(&params.to_string()))
            .await
            .unwrap();
        assert_eq!(code, 0);

        // Teardown after the call must not undo the install.
        plugin.deinitialize().await;
        let store = PackageStore::open(dir.path().join("state/packages.json")).unwrap();
        assert!(store.contains("com.example.big"));
        assert!(dir.path().join("apps/com.example.big/big.tar").exists());
    }

    #[tokio::test]
    async fn call_reports_failures_through_the_exit_status() {
        let (plugin, logger, dir) = attached_plugin();
        let missing = dir.path().join("absent.tar");
        let params = json!({ "id": "com.example.gone", "url": missing.display().to_string() });
        let code = call_once(&plugin, &logger, "install", Some(&params.to_string()))
            .await
            .unwrap();
        assert_eq!(code, RPC_FAILURE_EXIT);

        let code = call_once(&plugin, &logger, "launch", None).await.unwrap();
        assert_eq!(code, RPC_FAILURE_EXIT);

        assert!(matches!(
            call_once(&plugin, &logger, "getInstalled", Some("{oops")).await,
            Err(PackagerError::Serialization(_))
        ));
        plugin.deinitialize().await;
    }

    #[tokio::test]
    async fn serve_answers_every_line_and_survives_bad_bytes() {
        let (plugin, logger, _dir) = attached_plugin();
        let mut input = Vec::new();
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":1,"method":"getInstalled"}"#);
        input.extend_from_slice(b"\n\xff\xfe\n\n");
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":3,"method":"getInstalled"}"#);
        input.push(b'\n');

        let output = serve(&plugin, &logger, input.as_slice(), Vec::new())
            .await
            .unwrap();
        let replies: Vec<RpcResponse> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].id, json!(1));
        assert_eq!(replies[1].id, Value::Null);
        assert_eq!(replies[1].error.as_ref().unwrap().code, rpc::RpcError::PARSE_ERROR);
        assert_eq!(replies[2].id, json!(3));
        assert_eq!(replies[2].result, Some(json!({ "packages": [] })));
        plugin.deinitialize().await;
    }
}
