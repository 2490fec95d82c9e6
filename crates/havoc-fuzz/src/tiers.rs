use serde::{Deserialize, Serialize};

/// Logical container class a tier occupies. Two faults may share a scenario
/// only if their tiers' namespace sets are disjoint; otherwise concurrent
/// traffic-control / packet-filter commands would race on one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Consensus,
    Execution,
    Messaging,
}

/// A named group of service selectors the fuzzer can aim a fault at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTier {
    pub name: &'static str,
    /// Selector regex resolved at DISCOVER time.
    pub pattern: &'static str,
    pub namespaces: &'static [Namespace],
}

impl TargetTier {
    pub fn is_disjoint(&self, other: &TargetTier) -> bool {
        !self.namespaces.iter().any(|n| other.namespaces.contains(n))
    }
}

/// Fixed, ordered tier table. A Vec (not a map) so iteration order — and
/// with it every seeded sample sequence — is stable.
#[derive(Debug, Clone)]
pub struct TierRegistry {
    tiers: Vec<TargetTier>,
}

impl TierRegistry {
    /// The tier set for the standard two-layer devnet topology
    /// (heimdall = consensus, bor = execution, rabbitmq = messaging).
    pub fn default_devnet() -> Self {
        use Namespace::*;
        Self {
            tiers: vec![
                TargetTier {
                    name: "validator1_heimdall",
                    pattern: r"^validator1-heimdall",
                    namespaces: &[Consensus],
                },
                TargetTier {
                    name: "validator2_heimdall",
                    pattern: r"^validator2-heimdall",
                    namespaces: &[Consensus],
                },
                TargetTier {
                    name: "all_heimdall",
                    pattern: r"^validator\d+-heimdall",
                    namespaces: &[Consensus],
                },
                TargetTier {
                    name: "validator1_bor",
                    pattern: r"^validator1-bor",
                    namespaces: &[Execution],
                },
                TargetTier {
                    name: "all_bor",
                    pattern: r"^validator\d+-bor",
                    namespaces: &[Execution],
                },
                TargetTier {
                    name: "all_both",
                    pattern: r"^validator\d+-(heimdall|bor)",
                    namespaces: &[Consensus, Execution],
                },
                TargetTier {
                    name: "rabbitmq",
                    pattern: r"^rabbitmq",
                    namespaces: &[Messaging],
                },
            ],
        }
    }

    pub fn tiers(&self) -> &[TargetTier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjointness_is_symmetric_and_namespace_based() {
        let reg = TierRegistry::default_devnet();
        let by_name = |n: &str| reg.tiers().iter().find(|t| t.name == n).unwrap();

        let heimdall = by_name("all_heimdall");
        let bor = by_name("all_bor");
        let both = by_name("all_both");
        let mq = by_name("rabbitmq");

        assert!(heimdall.is_disjoint(bor));
        assert!(bor.is_disjoint(heimdall));
        assert!(heimdall.is_disjoint(mq));
        assert!(!heimdall.is_disjoint(both));
        assert!(!bor.is_disjoint(both));
        assert!(both.is_disjoint(mq));
        assert!(!heimdall.is_disjoint(by_name("validator1_heimdall")));
    }
}
