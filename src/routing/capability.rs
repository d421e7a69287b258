//! Capabilities and request requirements.
//!
//! A [`Capability`] is a named operation a server can perform. The well-known
//! capabilities are enum variants so that routing tables are checked at
//! compile time; anything else is carried as [`Capability::Custom`].
//!
//! The static table in [`Capability::default_cache_ttl`] is the baseline
//! cache policy; the `cache.policies` config section overrides it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A named operation a backend server can perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    /// Free-text or structured search.
    Search,
    /// Bulk data retrieval from a backing store.
    DataRetrieval,
    /// Analytical computation over supplied data.
    Analysis,
    /// Text or content generation.
    Generation,
    /// Vector embedding.
    Embedding,
    /// Document / report rendering.
    Reporting,
    /// Outbound notification (mail, chat, paging).
    Notification,
    /// Live data feeds. Never cached.
    RealTime,
    /// Any other capability, by name.
    Custom(String),
}

impl Capability {
    /// Canonical snake_case name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Search => "search",
            Self::DataRetrieval => "data_retrieval",
            Self::Analysis => "analysis",
            Self::Generation => "generation",
            Self::Embedding => "embedding",
            Self::Reporting => "reporting",
            Self::Notification => "notification",
            Self::RealTime => "real_time",
            Self::Custom(name) => name,
        }
    }

    /// Baseline cache TTL in seconds; `0` means never cache.
    ///
    /// Side-effecting and live capabilities are never cached.
    pub fn default_cache_ttl(&self) -> u64 {
        match self {
            Self::RealTime | Self::Notification => 0,
            Self::Search | Self::DataRetrieval => 300,
            Self::Analysis | Self::Reporting => 600,
            Self::Embedding => 3600,
            Self::Generation | Self::Custom(_) => 0,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(|c: char| c == '-' || c == ' ', "_");
        if normalized.is_empty() {
            return Err("capability name must not be empty".to_string());
        }
        Ok(match normalized.as_str() {
            "search" => Self::Search,
            "data_retrieval" => Self::DataRetrieval,
            "analysis" => Self::Analysis,
            "generation" => Self::Generation,
            "embedding" => Self::Embedding,
            "reporting" => Self::Reporting,
            "notification" => Self::Notification,
            "real_time" | "realtime" => Self::RealTime,
            _ => Self::Custom(normalized),
        })
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.as_str().to_string()
    }
}

impl JsonSchema for Capability {
    fn schema_name() -> String {
        "Capability".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// Soft preferences and hard limits attached to a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    /// Capabilities that raise a server's capability-match score if present.
    pub preferred: HashSet<Capability>,
    /// Servers costing more per request are filtered out.
    pub max_cost_per_request: Option<f64>,
    /// Servers with a slower mean response time are filtered out.
    pub max_response_ms: Option<f64>,
    /// Servers never to consider (used by failover to skip tried servers).
    pub excluded: HashSet<String>,
}

/// What a request needs from a server.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirements {
    /// The capability being invoked.
    pub capability: Capability,
    /// Additional capabilities the server must also advertise.
    pub also_required: HashSet<Capability>,
    /// Soft preferences and hard limits.
    pub constraints: Constraints,
}

impl Requirements {
    /// Requirements for a single capability with no constraints.
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            also_required: HashSet::new(),
            constraints: Constraints::default(),
        }
    }

    /// Require an additional capability.
    pub fn require(mut self, capability: Capability) -> Self {
        self.also_required.insert(capability);
        self
    }

    /// Prefer servers that also advertise `capability`.
    pub fn prefer(mut self, capability: Capability) -> Self {
        self.constraints.preferred.insert(capability);
        self
    }

    /// Filter out servers costing more than `max` per request.
    pub fn max_cost(mut self, max: f64) -> Self {
        self.constraints.max_cost_per_request = Some(max);
        self
    }

    /// Never consider `server_id`.
    pub fn exclude(mut self, server_id: impl Into<String>) -> Self {
        self.constraints.excluded.insert(server_id.into());
        self
    }

    /// Every capability the server must advertise.
    pub fn required_capabilities(&self) -> impl Iterator<Item = &Capability> {
        std::iter::once(&self.capability).chain(self.also_required.iter())
    }

    /// True when `capabilities` is a superset of the required set.
    pub fn is_satisfied_by(&self, capabilities: &HashSet<Capability>) -> bool {
        self.required_capabilities().all(|c| capabilities.contains(c))
    }
}
