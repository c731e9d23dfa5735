/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::store
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Persist the set of installed packages as a versioned JSON
    document and migrate documents written by older revisions.

  Security / Safety Notes:
    Writes go to a sibling temporary file and are renamed into
    place so readers never observe a torn document.

  Dependencies:
    serde_json for the document body.

  Operational Scope:
    Loaded when the installer starts; rewritten after every
    successful install or removal.

  Revision History:
    2026-10-17 COD  Authored versioned package store.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Deterministic ordering for reproducible documents
    - Explicit schema revision with migration on read
    - Graceful error propagation on I/O failures
============================================================*/

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{PackagerError, Result};
use crate::package_info::{json2pkg, PackageInfo, SharedPackageInfo, SizeSchema};

const CURRENT_SCHEMA: SizeSchema = SizeSchema::Wide64;

/// Installed packages keyed by package id.
#[derive(Debug, Default)]
pub struct PackageStore {
    path: PathBuf,
    packages: BTreeMap<String, SharedPackageInfo>,
}

impl PackageStore {
    /// Read the store at `path`; a missing file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                packages: BTreeMap::new(),
            });
        }

        let raw = std::fs::read_to_string(&path).map_err(|err| {
            PackagerError::Filesystem(format!(
                "Failed to read package store {}: {err}",
                path.display()
            ))
        })?;
        let document: Value = serde_json::from_str(&raw).map_err(|err| {
            PackagerError::Serialization(format!(
                "Package store {} is not valid JSON: {err}",
                path.display()
            ))
        })?;
        let packages = decode_document(&document)?;
        Ok(Self { path, packages })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, pkg_id: &str) -> Option<SharedPackageInfo> {
        self.packages.get(pkg_id).cloned()
    }

    pub fn contains(&self, pkg_id: &str) -> bool {
        self.packages.contains_key(pkg_id)
    }

    /// Snapshot ordered by package id.
    pub fn list(&self) -> Vec<SharedPackageInfo> {
        self.packages.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Sum of recorded bundle sizes.
    pub fn used_bytes(&self) -> u64 {
        self.packages
            .values()
            .fold(0u64, |acc, pkg| acc.saturating_add(pkg.size_in_bytes()))
    }

    pub fn insert(&mut self, package: SharedPackageInfo) -> Option<SharedPackageInfo> {
        self.packages.insert(package.pkg_id().to_string(), package)
    }

    pub fn remove(&mut self, pkg_id: &str) -> Option<SharedPackageInfo> {
        self.packages.remove(pkg_id)
    }

    /// Write the current document at the current schema revision.
    pub fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                PackagerError::Filesystem(format!(
                    "Failed to create store directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let packages = self
            .packages
            .values()
            .map(|pkg| pkg.to_json_for(CURRENT_SCHEMA))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let document = json!({
            "schema": CURRENT_SCHEMA.revision(),
            "packages": packages,
        });
        let body = serde_json::to_vec_pretty(&document).map_err(|err| {
            PackagerError::Serialization(format!("Failed to encode package store: {err}"))
        })?;

        let mut staging = self.path.as_os_str().to_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, body).map_err(|err| {
            PackagerError::Filesystem(format!(
                "Failed to write package store {}: {err}",
                staging.display()
            ))
        })?;
        std::fs::rename(&staging, &self.path).map_err(|err| {
            PackagerError::Filesystem(format!(
                "Failed to replace package store {}: {err}",
                self.path.display()
            ))
        })?;
        Ok(())
    }
}

fn decode_document(document: &Value) -> Result<BTreeMap<String, SharedPackageInfo>> {
    // Documents predating the `schema` member used 32-bit sizes.
    let schema = match document.get("schema") {
        None | Some(Value::Null) => SizeSchema::Legacy32,
        Some(value) => value
            .as_u64()
            .and_then(SizeSchema::from_revision)
            .ok_or_else(|| {
                PackagerError::Serialization(format!("Unsupported package store schema {value}"))
            })?,
    };

    let entries = match document.get("packages") {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(PackagerError::Serialization(
                "Package store `packages` member is not an array".into(),
            ))
        }
    };

    let mut packages = BTreeMap::new();
    for entry in entries {
        let decoded = match schema {
            SizeSchema::Wide64 => json2pkg(entry),
            SizeSchema::Legacy32 => PackageInfo::from_json_with(entry, schema).map(Arc::new),
        };
        let package = decoded.map_err(|err| {
            let id = entry.get("id").and_then(Value::as_str).unwrap_or("<unknown>");
            PackagerError::Serialization(format!("Package store entry `{id}`: {err}"))
        })?;
        packages.insert(package.pkg_id().to_string(), package);
    }
    Ok(packages)
}
