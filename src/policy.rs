//! Tier Policy
//!
//! Decision table for where a write lands. Priority is fixed:
//!
//! | rank | condition                                   | tier       |
//! |------|---------------------------------------------|------------|
//! | 1    | size class Large, or payload over threshold | Archival   |
//! | 2    | `semantic_search`                           | Vector     |
//! | 3    | `durability_required`                       | Structured |
//! | 4    | short `expected_ttl`, or nothing else       | Cache      |
//!
//! Reads always use `Tier::FALLBACK_CHAIN`; the policy only decides writes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::tiers::Tier;

/// Payload size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    #[default]
    Small,
    Large,
}

/// Caller-supplied routing input. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TierHint {
    pub durability_required: bool,
    pub semantic_search: bool,
    pub expected_ttl: Option<Duration>,
    pub size_class: SizeClass,
    /// Allow a fallback read hit to be copied into the cache
    pub allow_promotion: bool,
}

impl Default for TierHint {
    fn default() -> Self {
        Self {
            durability_required: false,
            semantic_search: false,
            expected_ttl: None,
            size_class: SizeClass::Small,
            allow_promotion: true,
        }
    }
}

impl TierHint {
    pub fn durable() -> Self {
        Self {
            durability_required: true,
            ..Default::default()
        }
    }

    pub fn semantic() -> Self {
        Self {
            semantic_search: true,
            ..Default::default()
        }
    }

    pub fn ephemeral(ttl: Duration) -> Self {
        Self {
            expected_ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn large() -> Self {
        Self {
            size_class: SizeClass::Large,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expected_ttl = Some(ttl);
        self
    }

    pub fn with_durability(mut self) -> Self {
        self.durability_required = true;
        self
    }

    pub fn with_semantic_search(mut self) -> Self {
        self.semantic_search = true;
        self
    }

    pub fn with_size(mut self, size_class: SizeClass) -> Self {
        self.size_class = size_class;
        self
    }

    pub fn without_promotion(mut self) -> Self {
        self.allow_promotion = false;
        self
    }
}

/// Why a tier was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    Oversized,
    Semantic,
    Durable,
    ShortTtl,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteDecision {
    pub tier: Tier,
    pub reason: RouteReason,
}

/// Write routing policy
#[derive(Debug, Clone)]
pub struct WritePolicy {
    /// TTLs at or below this count as short-lived
    pub short_ttl: Duration,
    /// Payloads above this size go to the archive regardless of hints
    pub archival_threshold_bytes: usize,
}

impl WritePolicy {
    pub fn new(short_ttl: Duration, archival_threshold_bytes: usize) -> Self {
        Self {
            short_ttl,
            archival_threshold_bytes,
        }
    }

    /// Pick the tier for a write
    pub fn route_write(&self, hints: &TierHint, payload_size: usize, has_embedding: bool) -> CoreResult<WriteDecision> {
        if hints.expected_ttl == Some(Duration::ZERO) {
            return Err(CoreError::RoutingAmbiguous(
                "expected_ttl of zero cannot be stored".to_string(),
            ));
        }

        let oversized = hints.size_class == SizeClass::Large || payload_size > self.archival_threshold_bytes;
        let short_lived = hints.expected_ttl.map(|t| t <= self.short_ttl).unwrap_or(false);

        let decision = match (oversized, hints.semantic_search, hints.durability_required, short_lived) {
            (true, _, _, _) => WriteDecision {
                tier: Tier::Archival,
                reason: RouteReason::Oversized,
            },
            (false, true, _, _) => {
                if !has_embedding {
                    return Err(CoreError::RoutingAmbiguous(
                        "semantic_search requested without an embedding".to_string(),
                    ));
                }
                WriteDecision {
                    tier: Tier::Vector,
                    reason: RouteReason::Semantic,
                }
            }
            (false, false, true, _) => WriteDecision {
                tier: Tier::Structured,
                reason: RouteReason::Durable,
            },
            (false, false, false, true) => WriteDecision {
                tier: Tier::Cache,
                reason: RouteReason::ShortTtl,
            },
            (false, false, false, false) => WriteDecision {
                tier: Tier::Cache,
                reason: RouteReason::Default,
            },
        };

        Ok(decision)
    }

    /// Tiers tried, in order, when the chosen write tier is unavailable
    pub fn write_fallbacks(tier: Tier) -> &'static [Tier] {
        match tier {
            Tier::Cache => &[Tier::Structured],
            Tier::Structured => &[Tier::Archival],
            Tier::Vector | Tier::Archival => &[],
        }
    }
}
