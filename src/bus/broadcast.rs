//! Broadcast recipient resolution and strategy selection.
//!
//! Recipient tokens:
//!
//! | Token            | Resolves to                          |
//! |------------------|--------------------------------------|
//! | `all_agents`     | every registered recipient           |
//! | `group:<id>`     | members of group `<id>`              |
//! | `coalition:<id>` | members of coalition `<id>`          |
//! | anything else    | itself                               |

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::Serialize;

use super::message::{BroadcastStrategy, Priority, RoutingOptions};
use crate::config::BroadcastConfig;

/// Token resolving to every registered recipient.
pub const ALL_AGENTS: &str = "all_agents";

#[derive(Default)]
struct Directory {
    recipients: Vec<String>,
    groups: HashMap<String, Vec<String>>,
    coalitions: HashMap<String, Vec<String>>,
}

/// Known recipients, groups and coalitions.
#[derive(Default)]
pub struct RecipientDirectory {
    inner: RwLock<Directory>,
}

impl std::fmt::Debug for RecipientDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("RecipientDirectory")
            .field("recipients", &inner.recipients.len())
            .field("groups", &inner.groups.len())
            .field("coalitions", &inner.coalitions.len())
            .finish()
    }
}

impl RecipientDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a recipient (kept in registration order; re-adding is a no-op).
    pub fn add_recipient(&self, id: &str) {
        let mut inner = self.inner.write();
        if !inner.recipients.iter().any(|r| r == id) {
            inner.recipients.push(id.to_string());
        }
    }

    /// Remove a recipient from the directory and every group and coalition.
    pub fn remove_recipient(&self, id: &str) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.recipients.retain(|r| r != id);
        for members in inner.groups.values_mut().chain(inner.coalitions.values_mut()) {
            members.retain(|r| r != id);
        }
    }

    /// Put `member` in group `group`.
    pub fn add_to_group(&self, group: &str, member: &str) {
        let mut inner = self.inner.write();
        let members = inner.groups.entry(group.to_string()).or_default();
        if !members.iter().any(|m| m == member) {
            members.push(member.to_string());
        }
    }

    /// Put `member` in coalition `coalition`.
    pub fn add_to_coalition(&self, coalition: &str, member: &str) {
        let mut inner = self.inner.write();
        let members = inner.coalitions.entry(coalition.to_string()).or_default();
        if !members.iter().any(|m| m == member) {
            members.push(member.to_string());
        }
    }

    /// Registered recipients in registration order.
    pub fn recipients(&self) -> Vec<String> {
        self.inner.read().recipients.clone()
    }

    /// Expand `tokens` into concrete recipient ids, first occurrence wins.
    /// Unknown groups and coalitions expand to nothing.
    pub fn resolve<I, S>(&self, tokens: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for token in tokens {
            let token = token.as_ref();
            let expanded: Vec<String> = if token == ALL_AGENTS {
                inner.recipients.clone()
            } else if let Some(group) = token.strip_prefix("group:") {
                inner.groups.get(group).cloned().unwrap_or_default()
            } else if let Some(coalition) = token.strip_prefix("coalition:") {
                inner.coalitions.get(coalition).cloned().unwrap_or_default()
            } else {
                vec![token.to_string()]
            };
            for id in expanded {
                if seen.insert(id.clone()) {
                    resolved.push(id);
                }
            }
        }
        resolved
    }
}

/// Pick a broadcast strategy.
///
/// An explicit `routing.strategy` wins. Otherwise: large payloads stream,
/// critical or ordered broadcasts go sequentially, more than
/// `parallel_max_recipients` recipients are batched, and everything else
/// fans out in parallel.
pub fn choose_strategy(
    recipients: usize,
    payload_bytes: usize,
    priority: Priority,
    routing: &RoutingOptions,
    config: &BroadcastConfig,
) -> BroadcastStrategy {
    if let Some(strategy) = routing.strategy {
        return strategy;
    }
    if payload_bytes > config.stream_payload_threshold_bytes {
        BroadcastStrategy::Streamed
    } else if priority == Priority::Critical || routing.ordered {
        BroadcastStrategy::Sequential
    } else if recipients > config.parallel_max_recipients {
        BroadcastStrategy::Batched
    } else {
        BroadcastStrategy::Parallel
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastReport {
    /// Shared id of the broadcast message.
    pub message_id: String,
    /// Strategy used.
    pub strategy: BroadcastStrategy,
    /// Resolved recipients, in order.
    pub recipients: Vec<String>,
    /// Recipients that accepted the message.
    pub delivered: Vec<String>,
    /// Recipients that failed, with the error.
    pub failed: Vec<(String, String)>,
    /// Recipients never tried (sequential stop-on-error).
    pub skipped: Vec<String>,
    /// Stream the message was published on, for streamed broadcasts.
    pub stream_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> RecipientDirectory {
        let dir = RecipientDirectory::new();
        for id in ["a", "b", "c", "d"] {
            dir.add_recipient(id);
        }
        dir.add_to_group("ops", "b");
        dir.add_to_group("ops", "c");
        dir.add_to_coalition("north", "d");
        dir.add_to_coalition("north", "a");
        dir
    }

    #[test]
    fn test_resolve_tokens_and_dedupe() {
        let dir = directory();
        assert_eq!(dir.resolve(["group:ops", "c", "x"]), vec!["b", "c", "x"]);
        assert_eq!(dir.resolve(["coalition:north"]), vec!["d", "a"]);
        assert_eq!(dir.resolve([ALL_AGENTS, "group:ops"]), vec!["a", "b", "c", "d"]);
        assert!(dir.resolve(["group:missing"]).is_empty());
    }

    #[test]
    fn test_remove_recipient_leaves_groups() {
        let dir = directory();
        dir.remove_recipient("b");
        assert_eq!(dir.resolve(["group:ops"]), vec!["c"]);
        assert_eq!(dir.recipients(), vec!["a", "c", "d"]);
    }

    #[test]
    fn test_strategy_selection() {
        let config = BroadcastConfig::default();
        let plain = RoutingOptions::default();
        assert_eq!(
            choose_strategy(5, 10, Priority::Medium, &plain, &config),
            BroadcastStrategy::Parallel
        );
        assert_eq!(
            choose_strategy(21, 10, Priority::Medium, &plain, &config),
            BroadcastStrategy::Batched
        );
        assert_eq!(
            choose_strategy(21, 10, Priority::Critical, &plain, &config),
            BroadcastStrategy::Sequential
        );
        assert_eq!(
            choose_strategy(2, config.stream_payload_threshold_bytes + 1, Priority::Critical, &plain, &config),
            BroadcastStrategy::Streamed
        );
        let forced = RoutingOptions {
            strategy: Some(BroadcastStrategy::Batched),
            ..RoutingOptions::default()
        };
        assert_eq!(
            choose_strategy(1, 10, Priority::Low, &forced, &config),
            BroadcastStrategy::Batched
        );
    }
}
