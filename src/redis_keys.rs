//! Key-naming helpers for the queue's Redis data layout. Centralized here so
//! the layout documented in the external interface contract has exactly one
//! place that can drift from it.

/// Keys scoped to a single named queue. `base` is `Q:<name>`, optionally
/// prefixed with the owning [`autoweave_database::RedisPool`]'s configured
/// key prefix, so several tenants/environments can share one physical Redis
/// without key collisions.
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    pub fn new(name: impl AsRef<str>, key_prefix: Option<&str>) -> Self {
        let base = match key_prefix {
            Some(prefix) => format!("{prefix}:Q:{}", name.as_ref()),
            None => format!("Q:{}", name.as_ref()),
        };
        QueueKeys { base }
    }

    pub fn waiting(&self) -> String {
        format!("{}:waiting", self.base)
    }

    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    pub fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    pub fn completed(&self) -> String {
        format!("{}:completed", self.base)
    }

    pub fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }

    pub fn cancelled(&self) -> String {
        format!("{}:cancelled", self.base)
    }

    pub fn dead(&self) -> String {
        format!("{}:dead", self.base)
    }

    pub fn pause(&self) -> String {
        format!("{}:pause", self.base)
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.base, id)
    }

    /// Prefix shared by every `job:<id>` key in this queue, used by the
    /// Lua scripts that compute a job key from an id they read out of a
    /// sorted set or hash rather than one passed in directly.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    /// Terminal-class list key, used by [`crate::queue::Queue::clean`].
    pub fn terminal(&self, class: TerminalClass) -> String {
        match class {
            TerminalClass::Completed => self.completed(),
            TerminalClass::Failed => self.failed(),
            TerminalClass::Cancelled => self.cancelled(),
            TerminalClass::DeadLettered => self.dead(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalClass {
    Completed,
    Failed,
    Cancelled,
    DeadLettered,
}

impl TerminalClass {
    pub const ALL: [TerminalClass; 4] = [
        TerminalClass::Completed,
        TerminalClass::Failed,
        TerminalClass::Cancelled,
        TerminalClass::DeadLettered,
    ];
}

pub const SCHEDULED_ENTRIES_KEY: &str = "sched:entries";
pub const USB_CONNECTED_KEY: &str = "usb:connected";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_queue() {
        let keys = QueueKeys::new("usb-events", None);
        assert_eq!(keys.waiting(), "Q:usb-events:waiting");
        assert_eq!(keys.job("abc"), "Q:usb-events:job:abc");
        assert_eq!(keys.terminal(TerminalClass::DeadLettered), "Q:usb-events:dead");
    }

    #[test]
    fn keys_carry_an_optional_tenant_prefix() {
        let keys = QueueKeys::new("usb-events", Some("tenant-a"));
        assert_eq!(keys.waiting(), "tenant-a:Q:usb-events:waiting");
        assert_eq!(keys.job_prefix(), "tenant-a:Q:usb-events:job:");
    }
}
