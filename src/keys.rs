//! Keyspace layout shared by every script and every producer/worker operation.
//!
//! A queue is identified by a prefix `P` and a name `Q`; every Redis key the
//! rest of this crate touches is derived from `P:Q` by a fixed suffix so that
//! a deployment can mix implementations against the same keyspace.

/// Builds the fixed set of keys for one `prefix:queue` pair.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    /// `prefix:queue`, e.g. `bull:emails`.
    base: String,
}

impl QueueKeys {
    pub fn new(prefix: impl AsRef<str>, queue_name: impl AsRef<str>) -> Self {
        Self::from_base(format!("{}:{}", prefix.as_ref(), queue_name.as_ref()))
    }

    /// Builds directly from an already-joined `prefix:queue` string, as found
    /// on a [`crate::job::ParentRef`] — a flow's ancestor may live in a
    /// different queue than the job pointing to it, so its keys can't be
    /// derived from `self`'s own prefix/queue pair.
    pub fn from_base(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// The bare `prefix:queue` key, used as the `""` name in the original keymap.
    pub fn base(&self) -> &str {
        &self.base
    }

    fn suffixed(&self, suffix: &str) -> String {
        format!("{}:{}", self.base, suffix)
    }

    pub fn wait(&self) -> String {
        self.suffixed("wait")
    }

    pub fn paused(&self) -> String {
        self.suffixed("paused")
    }

    pub fn active(&self) -> String {
        self.suffixed("active")
    }

    pub fn delayed(&self) -> String {
        self.suffixed("delayed")
    }

    pub fn prioritized(&self) -> String {
        self.suffixed("prioritized")
    }

    pub fn waiting_children(&self) -> String {
        self.suffixed("waiting-children")
    }

    pub fn completed(&self) -> String {
        self.suffixed("completed")
    }

    pub fn failed(&self) -> String {
        self.suffixed("failed")
    }

    pub fn stalled(&self) -> String {
        self.suffixed("stalled")
    }

    pub fn stalled_check(&self) -> String {
        self.suffixed("stalled-check")
    }

    pub fn limiter(&self) -> String {
        self.suffixed("limiter")
    }

    pub fn meta(&self) -> String {
        self.suffixed("meta")
    }

    pub fn events(&self) -> String {
        self.suffixed("events")
    }

    pub fn marker(&self) -> String {
        self.suffixed("marker")
    }

    pub fn id(&self) -> String {
        self.suffixed("id")
    }

    /// Priority counter used to break ties between same-priority jobs.
    pub fn pc(&self) -> String {
        self.suffixed("pc")
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:{}", self.base, job_id)
    }

    pub fn logs(&self, job_id: &str) -> String {
        format!("{}:{}:logs", self.base, job_id)
    }

    pub fn lock(&self, job_id: &str) -> String {
        format!("{}:{}:lock", self.base, job_id)
    }

    pub fn processed(&self, job_id: &str) -> String {
        format!("{}:{}:processed", self.base, job_id)
    }

    pub fn dependencies(&self, job_id: &str) -> String {
        format!("{}:{}:dependencies", self.base, job_id)
    }

    pub fn unsuccessful(&self, job_id: &str) -> String {
        format!("{}:{}:unsuccessful", self.base, job_id)
    }

    pub fn dedup(&self, dedup_id: &str) -> String {
        format!("{}:de:{}", self.base, dedup_id)
    }

    pub fn metrics(&self, state: &str) -> String {
        format!("{}:metrics:{}", self.base, state)
    }

    /// Key for the named logical state set/list used by counts/ranges/state lookups.
    pub fn by_state(&self, state: &str) -> String {
        match state {
            "wait" | "waiting" => self.wait(),
            "paused" => self.paused(),
            "active" => self.active(),
            "delayed" => self.delayed(),
            "prioritized" => self.prioritized(),
            "waiting-children" => self.waiting_children(),
            "completed" => self.completed(),
            "failed" => self.failed(),
            other => self.suffixed(other),
        }
    }
}

/// Normalizes the public `"waiting"` alias to the internal `"wait"` state name.
pub fn normalize_state_name(name: &str) -> &str {
    if name == "waiting" {
        "wait"
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_expected_suffixes() {
        let keys = QueueKeys::new("bull", "emails");
        assert_eq!(keys.base(), "bull:emails");
        assert_eq!(keys.wait(), "bull:emails:wait");
        assert_eq!(keys.paused(), "bull:emails:paused");
        assert_eq!(keys.marker(), "bull:emails:marker");
        assert_eq!(keys.job("42"), "bull:emails:42");
        assert_eq!(keys.logs("42"), "bull:emails:42:logs");
        assert_eq!(keys.lock("42"), "bull:emails:42:lock");
        assert_eq!(keys.dependencies("42"), "bull:emails:42:dependencies");
        assert_eq!(keys.dedup("k"), "bull:emails:de:k");
        assert_eq!(keys.metrics("completed"), "bull:emails:metrics:completed");
    }

    #[test]
    fn by_state_normalizes_waiting() {
        let keys = QueueKeys::new("bull", "q");
        assert_eq!(keys.by_state("waiting"), keys.wait());
        assert_eq!(normalize_state_name("waiting"), "wait");
        assert_eq!(normalize_state_name("failed"), "failed");
    }
}
