use std::collections::HashMap;
use std::time::Duration;

use havoc_domain::{
    CheckMode, CriterionCheck, Fault, FaultKind, Scenario, ScenarioMeta, ScenarioSpec,
    SelectorKind, SuccessCriterion, Target, TargetSelector,
};

use crate::sample::{SampledFault, Sampler};

/// Invariants every synthetic scenario checks, independent of which faults
/// or tiers were drawn: the network keeps producing blocks and keeps BFT
/// quorum.
fn invariant_criteria() -> Vec<SuccessCriterion> {
    vec![
        SuccessCriterion {
            name: "network-block-production".into(),
            description: Some("the chain must keep producing blocks".into()),
            critical: true,
            window: Some(Duration::from_secs(120)),
            check: CriterionCheck::MetricQuery {
                query: "increase(tendermint_consensus_height[2m])".into(),
                threshold: "> 0".into(),
            },
        },
        SuccessCriterion {
            name: "bft-quorum".into(),
            description: Some("online voting power must stay at or above 2/3".into()),
            critical: true,
            window: Some(Duration::from_secs(60)),
            check: CriterionCheck::MetricQuery {
                query: "min(tendermint_consensus_validators_power_online_fraction)".into(),
                threshold: ">= 0.6666".into(),
            },
        },
    ]
}

/// Assemble a runnable scenario from a sampled fault set.
///
/// Durations derive from the mix: compounds get a longer observation
/// window, resource faults longer warmup/cooldown so limits settle. Two
/// non-critical precompile probes are appended per round: one known-good
/// precompile that must answer, one reserved address that must return
/// empty.
pub fn build_scenario(
    sampler: &mut Sampler,
    round: usize,
    faults: &[SampledFault],
    enclave: &str,
) -> Scenario {
    let compound = faults.len() > 1;
    let has_resource_fault = faults
        .iter()
        .any(|f| matches!(f.kind, FaultKind::CpuStress | FaultKind::MemoryStress));

    let duration = if compound {
        Duration::from_secs(120)
    } else {
        Duration::from_secs(60)
    };
    let settle = if has_resource_fault {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(15)
    };

    let targets: Vec<Target> = faults
        .iter()
        .map(|f| Target {
            alias: f.tier.name.to_string(),
            selector: TargetSelector {
                kind: SelectorKind::EnclaveService,
                enclave: Some(enclave.to_string()),
                pattern: Some(f.tier.pattern.to_string()),
                labels: HashMap::new(),
                container_id: None,
                service_name: None,
            },
        })
        .collect();

    let fault_specs: Vec<Fault> = faults
        .iter()
        .map(|f| Fault {
            phase: format!("{}-{}", f.kind, f.tier.name),
            description: None,
            target_alias: f.tier.name.to_string(),
            kind: f.kind,
            params: f.params.clone(),
        })
        .collect();

    let mut success_criteria = invariant_criteria();

    let precompile = sampler.sample_precompile();
    success_criteria.push(SuccessCriterion {
        name: format!("precompile-{}", precompile.name),
        description: Some("a known-good precompile must still answer".into()),
        critical: false,
        window: None,
        check: CriterionCheck::Rpc {
            address: precompile.address.to_string(),
            call_data: precompile.call_data.to_string(),
            check_mode: CheckMode::NonEmpty,
            expected: None,
        },
    });
    success_criteria.push(SuccessCriterion {
        name: "reserved-address-empty".into(),
        description: Some("an unassigned address must return no code path".into()),
        critical: false,
        window: None,
        check: CriterionCheck::Rpc {
            address: sampler.sample_empty_address(),
            call_data: "0x".into(),
            check_mode: CheckMode::Empty,
            expected: None,
        },
    });

    let mix: Vec<String> = faults.iter().map(|f| f.kind.to_string()).collect();
    let tiers: Vec<&str> = faults.iter().map(|f| f.tier.name).collect();
    let name = format!("fuzz-r{}-{}", round, mix.join("+"));

    Scenario {
        api_version: "havoc/v1".into(),
        kind: "ChaosScenario".into(),
        metadata: ScenarioMeta {
            name,
            description: Some(format!(
                "generated round {}: {} on {}",
                round,
                mix.join(", "),
                tiers.join(", ")
            )),
            tags: vec!["fuzz".into()],
        },
        spec: ScenarioSpec {
            targets,
            duration,
            warmup: settle,
            cooldown: settle,
            faults: fault_specs,
            success_criteria,
            collect_metrics: vec![
                "tendermint_consensus_height".into(),
                "tendermint_consensus_validators".into(),
            ],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::TierRegistry;

    fn sampler(seed: u64) -> Sampler {
        Sampler::new(seed, TierRegistry::default_devnet())
    }

    #[test]
    fn built_scenarios_validate() {
        let mut s = sampler(42);
        for round in 0..50 {
            let faults = s.sample(0.5, 3);
            let scenario = build_scenario(&mut s, round, &faults, "devnet");
            havoc_domain::validate(&scenario)
                .unwrap_or_else(|e| panic!("round {} invalid: {}", round, e));
        }
    }

    #[test]
    fn same_seed_builds_same_scenario_names() {
        let mut a = sampler(42);
        let mut b = sampler(42);
        for round in 0..20 {
            let fa = a.sample(1.0, 3);
            let fb = b.sample(1.0, 3);
            let sa = build_scenario(&mut a, round, &fa, "devnet");
            let sb = build_scenario(&mut b, round, &fb, "devnet");
            assert_eq!(sa.metadata.name, sb.metadata.name);
            assert_eq!(
                havoc_domain::scenario_hash(&sa),
                havoc_domain::scenario_hash(&sb)
            );
        }
    }

    #[test]
    fn compound_rounds_get_longer_windows() {
        let mut s = sampler(3);
        let faults = s.sample_multi(3);
        assert!(faults.len() >= 2);
        let scenario = build_scenario(&mut s, 0, &faults, "devnet");
        assert_eq!(scenario.spec.duration, Duration::from_secs(120));
    }

    #[test]
    fn two_noncritical_rpc_probes_are_appended() {
        let mut s = sampler(5);
        let faults = s.sample_single();
        let scenario = build_scenario(&mut s, 0, &faults, "devnet");

        let rpc: Vec<&SuccessCriterion> = scenario
            .spec
            .success_criteria
            .iter()
            .filter(|c| matches!(c.check, CriterionCheck::Rpc { .. }))
            .collect();
        assert_eq!(rpc.len(), 2);
        assert!(rpc.iter().all(|c| !c.critical));

        let invariants: Vec<&SuccessCriterion> = scenario
            .spec
            .success_criteria
            .iter()
            .filter(|c| c.critical)
            .collect();
        assert_eq!(invariants.len(), 2);
    }
}
