use crate::error::ValidationError;
use crate::job::JobPayload;

/// Structural checks on a payload's contents, beyond what serde already
/// enforces by deserializing into the right shape. Execution parameters
/// (priority, attempts, timeout) are never rejected here — they are
/// clamped into range during normalization, in
/// [`crate::job::JobRecord::from_submission`].
pub fn validate_payload(payload: &JobPayload) -> Result<(), ValidationError> {
    let invalid = |reason: &str| {
        Err(ValidationError::InvalidPayload {
            kind: payload.kind(),
            reason: reason.to_string(),
        })
    };

    match payload {
        JobPayload::UsbAttach(p) => p
            .device
            .validate()
            .map_err(|reason| ValidationError::InvalidPayload { kind: payload.kind(), reason }),
        JobPayload::UsbDetach(p) => p
            .device
            .validate()
            .map_err(|reason| ValidationError::InvalidPayload { kind: payload.kind(), reason }),
        JobPayload::UsbScan(_) => Ok(()),
        JobPayload::PluginLoad(p) => {
            if p.plugin_id.trim().is_empty() {
                return invalid("pluginId must not be empty");
            }
            if p.source_path.trim().is_empty() {
                return invalid("sourcePath must not be empty");
            }
            Ok(())
        }
        JobPayload::PluginUnload(p) => {
            if p.plugin_id.trim().is_empty() {
                return invalid("pluginId must not be empty");
            }
            Ok(())
        }
        JobPayload::PluginValidate(p) => {
            if p.plugin_id.trim().is_empty() {
                return invalid("pluginId must not be empty");
            }
            Ok(())
        }
        JobPayload::PluginReload(p) => {
            if p.plugin_id.trim().is_empty() {
                return invalid("pluginId must not be empty");
            }
            Ok(())
        }
        JobPayload::PluginExecute(p) => {
            if p.plugin_id.trim().is_empty() {
                return invalid("pluginId must not be empty");
            }
            if p.function.trim().is_empty() {
                return invalid("function must not be empty");
            }
            Ok(())
        }
        JobPayload::LlmBatch(p) => {
            if p.model.trim().is_empty() {
                return invalid("model must not be empty");
            }
            if p.requests.is_empty() {
                return invalid("requests must not be empty");
            }
            Ok(())
        }
        JobPayload::LlmEmbeddings(p) => {
            if p.model.trim().is_empty() {
                return invalid("model must not be empty");
            }
            if p.inputs.is_empty() {
                return invalid("inputs must not be empty");
            }
            Ok(())
        }
        JobPayload::LlmCompletion(p) => {
            if p.model.trim().is_empty() {
                return invalid("model must not be empty");
            }
            if p.prompt.is_empty() {
                return invalid("prompt must not be empty");
            }
            Ok(())
        }
        JobPayload::SystemMaintenance(p) => {
            if p.task.trim().is_empty() {
                return invalid("task must not be empty");
            }
            Ok(())
        }
        JobPayload::SystemCleanup(p) => {
            if p.target.trim().is_empty() {
                return invalid("target must not be empty");
            }
            Ok(())
        }
        JobPayload::SystemHealth(_) => Ok(()),
        JobPayload::SystemBackup(p) => {
            if p.destination.trim().is_empty() {
                return invalid("destination must not be empty");
            }
            Ok(())
        }
        JobPayload::MemoryVectorize(p) => {
            if p.collection.trim().is_empty() {
                return invalid("collection must not be empty");
            }
            if p.document_ids.is_empty() {
                return invalid("documentIds must not be empty");
            }
            Ok(())
        }
        JobPayload::MemoryIndex(p) => {
            if p.collection.trim().is_empty() {
                return invalid("collection must not be empty");
            }
            if p.document_ids.is_empty() {
                return invalid("documentIds must not be empty");
            }
            Ok(())
        }
        JobPayload::MemorySearch(p) => {
            if p.collection.trim().is_empty() {
                return invalid("collection must not be empty");
            }
            if p.query.trim().is_empty() {
                return invalid("query must not be empty");
            }
            if p.limit == 0 {
                return invalid("limit must be greater than zero");
            }
            Ok(())
        }
        JobPayload::MemoryCleanup(p) => {
            if p.collection.trim().is_empty() {
                return invalid("collection must not be empty");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{MemorySearchPayload, UsbScanPayload};

    #[test]
    fn empty_query_rejected() {
        let payload = JobPayload::MemorySearch(MemorySearchPayload {
            collection: "docs".into(),
            query: "   ".into(),
            limit: 10,
        });
        assert!(validate_payload(&payload).is_err());
    }

    #[test]
    fn scan_payload_has_no_required_fields() {
        let payload = JobPayload::UsbScan(UsbScanPayload { bus: None });
        assert!(validate_payload(&payload).is_ok());
    }
}
