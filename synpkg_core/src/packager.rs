/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::packager
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Define the packager interface the RPC facade forwards to,
    its status codes, and the events implementations publish.

  Security / Safety Notes:
    Interface only; bundle tokens pass through `InstallRequest`
    and must never be logged by implementations.

  Dependencies:
    async-trait for object-safe async methods, tokio broadcast
    channels for event fan-out, serde for event encoding.

  Operational Scope:
    Implemented by `installer::BundleInstaller`; consumed as
    `Arc<dyn Packager>` by `plugin::PackagerPlugin`.

  Revision History:
    2026-10-17 COD  Defined packager interface and status codes.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Stable numeric status codes on the wire
    - Capability boundary between facade and implementation
============================================================*/

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::package_info::SharedPackageInfo;

/// Unsigned status code returned by every packager operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const NONE: Status = Status(0);
    pub const GENERAL: Status = Status(1);
    pub const UNAVAILABLE: Status = Status(2);
    pub const ASYNC_ABORTED: Status = Status(4);
    pub const ILLEGAL_STATE: Status = Status(5);
    pub const TIMEDOUT: Status = Status(11);
    pub const INPROGRESS: Status = Status(12);
    pub const INCORRECT_HASH: Status = Status(14);
    pub const INCORRECT_URL: Status = Status(15);
    pub const UNKNOWN_KEY: Status = Status(22);
    pub const BAD_REQUEST: Status = Status(30);
    pub const WRITE_ERROR: Status = Status(33);
    pub const NOT_SUPPORTED: Status = Status(39);

    pub fn code(self) -> u32 {
        self.0
    }

    /// Symbolic name for known codes.
    pub fn name(self) -> &'static str {
        match self {
            Status::NONE => "ERROR_NONE",
            Status::GENERAL => "ERROR_GENERAL",
            Status::UNAVAILABLE => "ERROR_UNAVAILABLE",
            Status::ASYNC_ABORTED => "ERROR_ASYNC_ABORTED",
            Status::ILLEGAL_STATE => "ERROR_ILLEGAL_STATE",
            Status::TIMEDOUT => "ERROR_TIMEDOUT",
            Status::INPROGRESS => "ERROR_INPROGRESS",
            Status::INCORRECT_HASH => "ERROR_INCORRECT_HASH",
            Status::INCORRECT_URL => "ERROR_INCORRECT_URL",
            Status::UNKNOWN_KEY => "ERROR_UNKNOWN_KEY",
            Status::BAD_REQUEST => "ERROR_BAD_REQUEST",
            Status::WRITE_ERROR => "ERROR_WRITE_ERROR",
            Status::NOT_SUPPORTED => "ERROR_NOT_SUPPORTED",
            _ => "ERROR_UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl std::error::Error for Status {}

impl Serialize for Status {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

/// Result alias for packager operations.
pub type PackagerResult<T> = std::result::Result<T, Status>;

/// Arguments for a bundle install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRequest {
    pub pkg_id: String,
    /// Display name; the package id is used when empty.
    pub name: String,
    pub version: String,
    /// Package type tag recorded on success.
    pub kind: String,
    pub url: String,
    /// Bearer credential for the download; never logged.
    pub token: String,
    pub listener: String,
}

/// What happened to a task or package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "value", rename_all = "camelCase")]
pub enum InstallerEventKind {
    Progress(u32),
    Installed,
    Cancelled,
    Failed(Status),
    Removed,
}

/// Notification published by implementations on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallerEvent {
    pub listener: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(rename = "id")]
    pub pkg_id: String,
    #[serde(flatten)]
    pub kind: InstallerEventKind,
}

/// Install, remove and query operations behind the RPC facade.
#[async_trait]
pub trait Packager: Send + Sync {
    /// Short implementation name reported by the facade.
    fn name(&self) -> &'static str;

    /// Install a repository package by name, version and architecture.
    async fn install(
        &self,
        package: &str,
        version: &str,
        architecture: &str,
    ) -> PackagerResult<()>;

    /// Refresh the repository index.
    async fn synchronize_repository(&self) -> PackagerResult<()>;

    /// Start a bundle install; returns the task id.
    async fn install_bundle(&self, request: InstallRequest) -> PackagerResult<String>;

    async fn remove(&self, pkg_id: &str, listener: &str) -> PackagerResult<()>;

    async fn cancel(&self, pkg_id: &str, task: &str, listener: &str) -> PackagerResult<()>;

    async fn is_installed(&self, pkg_id: &str, app_id: &str) -> PackagerResult<bool>;

    /// Percent complete, 0 to 100.
    async fn get_install_progress(&self, task: &str) -> PackagerResult<u32>;

    async fn get_installed(&self) -> PackagerResult<Vec<SharedPackageInfo>>;

    async fn get_package_info(&self, pkg_id: &str) -> PackagerResult<SharedPackageInfo>;

    /// Bytes still available for bundles.
    async fn get_available_space(&self) -> PackagerResult<u64>;

    fn subscribe(&self) -> broadcast::Receiver<InstallerEvent>;

    /// Cancel in-flight work and wait for it to settle.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_known_codes() {
        assert_eq!(Status::UNKNOWN_KEY.name(), "ERROR_UNKNOWN_KEY");
        assert_eq!(Status(9999).name(), "ERROR_UNKNOWN");
        assert_eq!(Status::INPROGRESS.to_string(), "ERROR_INPROGRESS (12)");
    }

    #[test]
    fn events_encode_flat() {
        let event = InstallerEvent {
            listener: "ui".into(),
            task: Some("task-3".into()),
            pkg_id: "com.example.app".into(),
            kind: InstallerEventKind::Progress(40),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["value"], 40);
        assert_eq!(json["id"], "com.example.app");
        assert_eq!(json["task"], "task-3");

        let removed = InstallerEvent {
            listener: String::new(),
            task: None,
            pkg_id: "com.example.app".into(),
            kind: InstallerEventKind::Removed,
        };
        let json = serde_json::to_value(&removed).unwrap();
        assert_eq!(json["event"], "removed");
        assert!(json.get("task").is_none());
    }
}
