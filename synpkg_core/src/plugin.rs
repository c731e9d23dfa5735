/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::plugin
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Packager facade: owns the implementation handle, registers
    the JSON-RPC methods that forward to it, and tears both
    down on deinitialisation or connection loss.

  Security / Safety Notes:
    Only parameters named by each method are forwarded; the
    bundle token is passed through untouched and never logged.

  Dependencies:
    serde_json for results, tokio broadcast for events.

  Operational Scope:
    Created once by the entry point; shared with the stdio loop
    and the one-shot `call` command.

  Revision History:
    2026-10-17 COD  Authored packager facade.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Symmetric registration and unregistration
    - Idempotent teardown
    - Structured logging of lifecycle transitions
============================================================*/

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::config::PackagerConfig;
use crate::error::{PackagerError, Result};
use crate::installer::BundleInstaller;
use crate::logger::Logger;
use crate::package_info::pkg2json;
use crate::packager::{InstallRequest, InstallerEvent, Packager, Status};
use crate::rpc::{
    Dispatcher, Params, ALL_METHODS, CANCEL_METHOD, GET_AVAILABLE_SPACE_METHOD,
    GET_INSTALLED_METHOD, GET_INSTALL_PROGRESS_METHOD, GET_PACKAGE_INFO_METHOD, INSTALL_METHOD,
    IS_INSTALLED_METHOD, REMOVE_METHOD, SYNCHRONIZE_METHOD,
};

struct Active {
    implementation: Arc<dyn Packager>,
    connection_id: u32,
    logger: Arc<Logger>,
}

/// Facade exposing a packager implementation over JSON-RPC.
pub struct PackagerPlugin {
    dispatcher: Arc<Dispatcher>,
    active: Mutex<Option<Active>>,
    next_connection: AtomicU32,
}

impl Default for PackagerPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl PackagerPlugin {
    pub fn new() -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new()),
            active: Mutex::new(None),
            next_connection: AtomicU32::new(1),
        }
    }

    /// Build the bundle installer from `config` and attach it.
    pub fn initialize(&self, config: &PackagerConfig, logger: Arc<Logger>) -> Result<u32> {
        let installer = BundleInstaller::new(config, logger.clone())?;
        self.attach(Arc::new(installer), logger)
    }

    /// Attach an implementation and register every method; returns its connection id.
    pub fn attach(&self, implementation: Arc<dyn Packager>, logger: Arc<Logger>) -> Result<u32> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return Err(PackagerError::Runtime(
                "Packager plugin is already initialised".into(),
            ));
        }

        if let Some(taken) = ALL_METHODS
            .iter()
            .find(|method| self.dispatcher.is_registered(method))
        {
            return Err(PackagerError::Runtime(format!(
                "Method `{taken}` is already registered"
            )));
        }
        register_methods(&self.dispatcher, &implementation);
        let connection_id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        logger.info(
            "PLUGIN",
            format!(
                "{} attached on connection {connection_id}; {} methods registered",
                implementation.name(),
                ALL_METHODS.len()
            ),
        );
        *active = Some(Active {
            implementation,
            connection_id,
            logger,
        });
        Ok(connection_id)
    }

    /// Unregister every method and shut the implementation down.
    pub async fn deinitialize(&self) {
        let detached = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(active) = detached else {
            return;
        };

        for method in ALL_METHODS {
            self.dispatcher.unregister(method);
        }
        active.implementation.shutdown().await;
        active.logger.info(
            "PLUGIN",
            format!(
                "{} detached from connection {}",
                active.implementation.name(),
                active.connection_id
            ),
        );
    }

    /// Remote connection `connection_id` went away.
    pub async fn deactivated(&self, connection_id: u32) {
        let logger = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|active| active.connection_id == connection_id)
            .map(|active| active.logger.clone());
        if let Some(logger) = logger {
            logger.warn(
                "PLUGIN",
                format!("Connection {connection_id} deactivated; tearing down"),
            );
            self.deinitialize().await;
        }
    }

    /// JSON summary of the plugin state.
    pub fn information(&self) -> String {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        json!({
            "initialized": active.is_some(),
            "implementation": active.as_ref().map(|active| active.implementation.name()),
            "connection": active.as_ref().map(|active| active.connection_id),
            "methods": self.dispatcher.methods(),
        })
        .to_string()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Installer events, when an implementation is attached.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<InstallerEvent>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| active.implementation.subscribe())
    }
}

fn register_methods(dispatcher: &Dispatcher, implementation: &Arc<dyn Packager>) {
    let packager = implementation.clone();
    dispatcher.register(INSTALL_METHOD, move |params: Params| {
        let packager = packager.clone();
        async move {
            // A bundle install names the package id and its URL.
            if !params.id.is_empty() && !params.url.is_empty() {
                let task = packager
                    .install_bundle(InstallRequest {
                        pkg_id: params.id,
                        name: params.package,
                        version: params.version,
                        kind: params.kind,
                        url: params.url,
                        token: params.token,
                        listener: params.listener,
                    })
                    .await?;
                Ok::<_, Status>(json!({ "task": task }))
            } else {
                packager
                    .install(&params.package, &params.version, &params.architecture)
                    .await?;
                Ok::<_, Status>(Value::Null)
            }
        }
    });

    let packager = implementation.clone();
    dispatcher.register(SYNCHRONIZE_METHOD, move |_params: Params| {
        let packager = packager.clone();
        async move {
            packager.synchronize_repository().await?;
            Ok::<_, Status>(Value::Null)
        }
    });

    let packager = implementation.clone();
    dispatcher.register(REMOVE_METHOD, move |params: Params| {
        let packager = packager.clone();
        async move {
            packager.remove(&params.id, &params.listener).await?;
            Ok::<_, Status>(Value::Null)
        }
    });

    let packager = implementation.clone();
    dispatcher.register(CANCEL_METHOD, move |params: Params| {
        let packager = packager.clone();
        async move {
            packager
                .cancel(&params.id, &params.task, &params.listener)
                .await?;
            Ok::<_, Status>(Value::Null)
        }
    });

    let packager = implementation.clone();
    dispatcher.register(IS_INSTALLED_METHOD, move |params: Params| {
        let packager = packager.clone();
        async move {
            let installed = packager.is_installed(&params.id, &params.app_id).await?;
            Ok::<_, Status>(json!({ "installed": installed }))
        }
    });

    let packager = implementation.clone();
    dispatcher.register(GET_INSTALL_PROGRESS_METHOD, move |params: Params| {
        let packager = packager.clone();
        async move {
            let progress = packager.get_install_progress(&params.task).await?;
            Ok::<_, Status>(json!({ "progress": progress }))
        }
    });

    let packager = implementation.clone();
    dispatcher.register(GET_INSTALLED_METHOD, move |_params: Params| {
        let packager = packager.clone();
        async move {
            let packages: Vec<Value> = packager
                .get_installed()
                .await?
                .iter()
                .map(|pkg| pkg2json(pkg))
                .collect();
            Ok::<_, Status>(json!({ "packages": packages }))
        }
    });

    let packager = implementation.clone();
    dispatcher.register(GET_PACKAGE_INFO_METHOD, move |params: Params| {
        let packager = packager.clone();
        async move {
            let package = packager.get_package_info(&params.id).await?;
            Ok::<_, Status>(pkg2json(&package))
        }
    });

    let packager = implementation.clone();
    dispatcher.register(GET_AVAILABLE_SPACE_METHOD, move |_params: Params| {
        let packager = packager.clone();
        async move {
            let available = packager.get_available_space().await?;
            Ok::<_, Status>(json!({ "availableSpace": available }))
        }
    });
}
