/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::package_info
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Shared record describing one installed or installable
    package, together with its JSON wire form and the size
    schema revisions spoken by older clients.

  Security / Safety Notes:
    Pure data container; no I/O performed in this module.

  Dependencies:
    serde_json for the wire object, thiserror for parse errors.

  Operational Scope:
    Used by the installer, the package store, and the RPC layer
    to pass package metadata between components.

  Revision History:
    2026-10-17 COD  Introduced unified PackageInfo record.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Clear data contracts between modules
    - Explicit migration between wire revisions
    - Immutable records once shared
============================================================*/

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Reference-counted handle handed out to consumers of package records.
pub type SharedPackageInfo = Arc<PackageInfo>;

/// Wire revisions of the `size` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSchema {
    /// First revision: sizes travel as signed 32-bit decimal text.
    Legacy32,
    /// Current revision: sizes travel as signed 64-bit decimal text, never negative.
    Wide64,
}

impl SizeSchema {
    /// Numeric revision recorded in persisted documents.
    pub fn revision(self) -> u64 {
        match self {
            SizeSchema::Legacy32 => 1,
            SizeSchema::Wide64 => 2,
        }
    }

    /// Largest size a consumer of this revision can hold.
    pub fn max_size(self) -> u64 {
        match self {
            SizeSchema::Legacy32 => i32::MAX as u64,
            SizeSchema::Wide64 => i64::MAX as u64,
        }
    }

    pub fn from_revision(revision: u64) -> Option<Self> {
        match revision {
            1 => Some(SizeSchema::Legacy32),
            2 => Some(SizeSchema::Wide64),
            _ => None,
        }
    }
}

impl fmt::Display for SizeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeSchema::Legacy32 => write!(f, "legacy 32-bit"),
            SizeSchema::Wide64 => write!(f, "64-bit"),
        }
    }
}

/// Failures raised while decoding or re-encoding a package record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackageError {
    #[error("size `{value}` is not an integer: {reason}")]
    InvalidSize { value: String, reason: String },
    #[error("size `{value}` is out of range for the {schema} schema")]
    SizeOutOfRange { value: String, schema: SizeSchema },
    #[error("package record is not a JSON object")]
    NotAnObject,
}

/// Metadata for one package: identity, location, install stamp, and size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    name: String,
    bundle_path: String,
    version: String,
    pkg_id: String,
    installed: String,
    size_in_bytes: u64,
    kind: String,
}

impl PackageInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        pkg_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            pkg_id: pkg_id.into(),
            ..Self::default()
        }
    }

    pub fn with_bundle_path(mut self, bundle_path: impl Into<String>) -> Self {
        self.bundle_path = bundle_path.into();
        self
    }

    /// Install timestamp, RFC 3339 in UTC.
    pub fn with_installed(mut self, installed: impl Into<String>) -> Self {
        self.installed = installed.into();
        self
    }

    pub fn with_size_in_bytes(mut self, size_in_bytes: u64) -> Self {
        self.size_in_bytes = size_in_bytes;
        self
    }

    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bundle_path(&self) -> &str {
        &self.bundle_path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn pkg_id(&self) -> &str {
        &self.pkg_id
    }

    pub fn installed(&self) -> &str {
        &self.installed
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Encode the record as its wire object. `size` is emitted as decimal text.
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "bundlePath": self.bundle_path,
            "version": self.version,
            "id": self.pkg_id,
            "installed": self.installed,
            "size": self.size_in_bytes.to_string(),
            "type": self.kind,
        })
    }

    /// Encode for a consumer speaking the given schema revision.
    pub fn to_json_for(&self, schema: SizeSchema) -> Result<Value, PackageError> {
        self.validate_for(schema)?;
        Ok(self.to_json())
    }

    /// Decode a current-revision wire object.
    pub fn from_json(json: &Value) -> Result<Self, PackageError> {
        Self::from_json_with(json, SizeSchema::Wide64)
    }

    /// Decode a wire object written under `schema`, migrating the size.
    pub fn from_json_with(json: &Value, schema: SizeSchema) -> Result<Self, PackageError> {
        let object = json.as_object().ok_or(PackageError::NotAnObject)?;
        Ok(Self {
            name: member_text(object, "name"),
            bundle_path: member_text(object, "bundlePath"),
            version: member_text(object, "version"),
            pkg_id: member_text(object, "id"),
            installed: member_text(object, "installed"),
            size_in_bytes: parse_size(&member_text(object, "size"), schema)?,
            kind: member_text(object, "type"),
        })
    }

    /// Check that the record can be represented under `schema`.
    pub fn validate_for(&self, schema: SizeSchema) -> Result<(), PackageError> {
        if self.size_in_bytes <= schema.max_size() {
            Ok(())
        } else {
            Err(PackageError::SizeOutOfRange {
                value: self.size_in_bytes.to_string(),
                schema,
            })
        }
    }
}

impl fmt::Display for PackageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name: '{}', path: '{}', ver: '{}', id: '{}', installed: '{}', size: {}, type: '{}'",
            self.name,
            self.bundle_path,
            self.version,
            self.pkg_id,
            self.installed,
            self.size_in_bytes,
            self.kind
        )
    }
}

/// Encode a record as its wire object.
pub fn pkg2json(pkg: &PackageInfo) -> Value {
    pkg.to_json()
}

/// Decode a wire object into a shared record.
pub fn json2pkg(json: &Value) -> Result<SharedPackageInfo, PackageError> {
    PackageInfo::from_json(json).map(Arc::new)
}

// Absent or null members read as empty text; scalars read as their literal.
fn member_text(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn parse_size(text: &str, schema: SizeSchema) -> Result<u64, PackageError> {
    let trimmed = text.trim();
    let value = trimmed
        .parse::<i128>()
        .map_err(|err| PackageError::InvalidSize {
            value: text.to_string(),
            reason: err.to_string(),
        })?;
    let out_of_range = || PackageError::SizeOutOfRange {
        value: trimmed.to_string(),
        schema,
    };

    match schema {
        SizeSchema::Wide64 => i64::try_from(value)
            .ok()
            .and_then(|wide| u64::try_from(wide).ok())
            .ok_or_else(out_of_range),
        SizeSchema::Legacy32 => {
            let narrow = i32::try_from(value).map_err(|_| out_of_range())?;
            // Legacy writers printed the unsigned size with `%d`.
            Ok(u64::from(narrow as u32))
        }
    }
}
