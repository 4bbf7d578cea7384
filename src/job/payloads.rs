//! Payload shapes for each [`super::JobKind`]. These are intentionally thin:
//! the business logic that interprets them lives in processors supplied by
//! the collaborating subsystem (USB daemon, plugin loader, LLM batcher,
//! memory indexer) that this crate treats as pluggable functions.

use serde::{Deserialize, Serialize};

/// A stable 16-hex-character identifier for a physical USB connection
/// point, derived from (vendorId, productId, bus, address). See GLOSSARY.
pub type DeviceSignature = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub signature: DeviceSignature,
}

impl UsbDeviceInfo {
    pub fn validate(&self) -> Result<(), String> {
        if self.signature.len() != 16 || !self.signature.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!(
                "device signature {:?} is not 16 hex characters",
                self.signature
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbAttachPayload {
    pub device: UsbDeviceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDetachPayload {
    pub device: UsbDeviceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbScanPayload {
    /// Restrict the scan to a bus number, or scan every bus if unset.
    pub bus: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginLoadPayload {
    pub plugin_id: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginUnloadPayload {
    pub plugin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginExecutePayload {
    pub plugin_id: String,
    pub function: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginValidatePayload {
    pub plugin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginReloadPayload {
    pub plugin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmBatchPayload {
    pub model: String,
    pub requests: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmEmbeddingsPayload {
    pub model: String,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmCompletionPayload {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemMaintenancePayload {
    pub task: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemCleanupPayload {
    pub target: String,
    #[serde(default)]
    pub grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemHealthPayload {
    #[serde(default)]
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemBackupPayload {
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryVectorizePayload {
    pub collection: String,
    pub document_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryIndexPayload {
    pub collection: String,
    pub document_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemorySearchPayload {
    pub collection: String,
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

fn default_search_limit() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryCleanupPayload {
    pub collection: String,
    pub older_than_ms: u64,
}
