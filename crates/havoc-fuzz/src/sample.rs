use havoc_domain::{FaultKind, FaultParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tiers::{TargetTier, TierRegistry};

/// One sampled (kind, tier, parameters) triple.
#[derive(Debug, Clone)]
pub struct SampledFault {
    pub kind: FaultKind,
    pub tier: TargetTier,
    pub params: FaultParams,
}

/// A known-good precompile the scenario builder probes each round.
#[derive(Debug, Clone, Copy)]
pub struct Precompile {
    pub name: &'static str,
    pub address: &'static str,
    pub call_data: &'static str,
}

/// Precompiles that must answer on any healthy EVM chain. sha256/ripemd/
/// identity get a byte of input so the result is provably non-empty.
const PRECOMPILES: &[Precompile] = &[
    Precompile {
        name: "sha256",
        address: "0x0000000000000000000000000000000000000002",
        call_data: "0x00",
    },
    Precompile {
        name: "ripemd160",
        address: "0x0000000000000000000000000000000000000003",
        call_data: "0x00",
    },
    Precompile {
        name: "identity",
        address: "0x0000000000000000000000000000000000000004",
        call_data: "0xdeadbeef",
    },
];

/// All randomness for a fuzz session flows through this one seeded RNG, so
/// equal seeds replay identical (kind, tier, parameter) sequences. No
/// wall-clock reads happen here.
pub struct Sampler {
    rng: StdRng,
    registry: TierRegistry,
}

impl Sampler {
    pub fn new(seed: u64, registry: TierRegistry) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            registry,
        }
    }

    // ── Distributions ─────────────────────────────────────────────────────

    /// Triangular distribution via inverse CDF; mode picks the
    /// "interesting" zone near protocol thresholds.
    fn triangular(&mut self, min: f64, mode: f64, max: f64) -> f64 {
        let u: f64 = self.rng.gen();
        let cut = (mode - min) / (max - min);
        if u < cut {
            min + ((max - min) * (mode - min) * u).sqrt()
        } else {
            max - ((max - min) * (max - mode) * (1.0 - u)).sqrt()
        }
    }

    /// Log-uniform over [min, max]; spreads samples across orders of
    /// magnitude (latencies, bandwidths).
    fn log_uniform(&mut self, min: f64, max: f64) -> f64 {
        let u: f64 = self.rng.gen();
        (min.ln() + u * (max.ln() - min.ln())).exp()
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.rng.gen_range(0..items.len())]
    }

    /// Weighted discrete choice; weights need not sum to 1.
    fn weighted<'a, T>(&mut self, items: &'a [(T, f64)]) -> &'a T {
        let total: f64 = items.iter().map(|(_, w)| w).sum();
        let mut roll = self.rng.gen::<f64>() * total;
        for (item, weight) in items {
            roll -= weight;
            if roll <= 0.0 {
                return item;
            }
        }
        &items[items.len() - 1].0
    }

    // ── Per-kind parameters ───────────────────────────────────────────────

    /// Draw parameters for one fault kind, biased toward values that
    /// straddle consensus/timeout thresholds.
    pub fn sample_params(&mut self, kind: FaultKind) -> FaultParams {
        let mut p = FaultParams::new();
        match kind {
            FaultKind::Network => {
                let latency = self.log_uniform(50.0, 3000.0).round();
                let loss = self.triangular(0.0, 25.0, 80.0).round();
                let with_reorder = self.rng.gen::<f64>() < 0.25;
                let reorder = self.rng.gen_range(5.0..40.0_f64).round();
                let correlation = self.rng.gen_range(0.0..50.0_f64).round();

                p.insert("latency", latency);
                p.insert("jitter", (latency * 0.1).round());
                p.insert("packet_loss", loss);
                p.insert("target_proto", *self.pick(&["tcp", "tcp,udp"]));
                if with_reorder {
                    p.insert("reorder", reorder);
                    p.insert("reorder_correlation", correlation);
                }
            }
            FaultKind::ConnectionDrop => {
                let probability =
                    (self.triangular(0.1, 0.5, 0.95) * 100.0).round() / 100.0;
                p.insert("probability", probability);
                p.insert("rule_type", *self.pick(&["drop", "reject"]));
                p.insert("target_proto", "tcp");
                p.insert(
                    "target_ports",
                    *self.pick(&["26656", "26657", "30303", "8545"]),
                );
            }
            FaultKind::Dns => {
                p.insert("delay_ms", self.log_uniform(100.0, 5000.0).round());
                p.insert(
                    "failure_rate",
                    (self.triangular(0.0, 0.2, 0.9) * 100.0).round() / 100.0,
                );
            }
            FaultKind::ContainerRestart => {
                let grace = *self.weighted(&[(0u64, 0.3), (5, 0.4), (10, 0.2), (30, 0.1)]);
                p.insert("grace_period", grace);
                p.insert("restart_delay", self.rng.gen_range(0..10u64));
                let staggered = self.rng.gen::<f64>() < 0.4;
                let stagger = self.rng.gen_range(1..6u64);
                p.insert("stagger", if staggered { stagger } else { 0 });
            }
            FaultKind::ContainerKill => {
                p.insert("signal", *self.pick(&["SIGKILL", "SIGTERM"]));
                p.insert("restart", true);
                p.insert("restart_delay", self.rng.gen_range(0..10u64));
            }
            FaultKind::ContainerPause => {
                p.insert("duration", self.log_uniform(2.0, 60.0).round());
                p.insert("unpause", true);
            }
            FaultKind::CpuStress => {
                p.insert("method", *self.pick(&["stress", "limit"]));
                p.insert("cpu_percent", self.triangular(20.0, 85.0, 100.0).round());
                p.insert("cores", self.rng.gen_range(1..3u64));
            }
            FaultKind::MemoryStress => {
                p.insert("memory_mb", *self.weighted(&[(128u64, 0.3), (256, 0.5), (512, 0.2)]));
            }
            FaultKind::ProcessPriority => {
                p.insert(
                    "process_pattern",
                    *self.pick(&["heimdalld", "bor", "rabbitmq-server"]),
                );
                p.insert("priority", self.triangular(5.0, 19.0, 19.0).round());
            }
            FaultKind::DiskIo => {
                p.insert("io_latency_ms", self.log_uniform(10.0, 500.0).round());
                p.insert(
                    "target_path",
                    *self.pick(&["/var/lib/bor", "/root/.heimdalld/data", "/"]),
                );
                p.insert("operation", *self.pick(&["read", "write", "all"]));
            }
        }
        p
    }

    // ── Fault-set sampling ────────────────────────────────────────────────

    /// One random fault kind on one random tier.
    pub fn sample_single(&mut self) -> Vec<SampledFault> {
        let kind = *self.pick(&FaultKind::ALL);
        let tier = self.pick_tier();
        let params = self.sample_params(kind);
        vec![SampledFault { kind, tier, params }]
    }

    /// Up to `n` faults on pairwise namespace-disjoint tiers: shuffle the
    /// tier table, greedily keep tiers that don't overlap anything picked,
    /// and attach a preferably-unused kind to each.
    pub fn sample_multi(&mut self, n: usize) -> Vec<SampledFault> {
        let mut order: Vec<usize> = (0..self.registry.len()).collect();
        // Fisher-Yates on the seeded rng.
        for i in (1..order.len()).rev() {
            let j = self.rng.gen_range(0..=i);
            order.swap(i, j);
        }

        let mut picked: Vec<TargetTier> = Vec::new();
        for idx in order {
            if picked.len() >= n {
                break;
            }
            let candidate = self.registry.tiers()[idx].clone();
            if picked.iter().all(|t| t.is_disjoint(&candidate)) {
                picked.push(candidate);
            }
        }

        let mut used_kinds: Vec<FaultKind> = Vec::new();
        picked
            .into_iter()
            .map(|tier| {
                let unused: Vec<FaultKind> = FaultKind::ALL
                    .iter()
                    .copied()
                    .filter(|k| !used_kinds.contains(k))
                    .collect();
                let kind = if unused.is_empty() {
                    *self.pick(&FaultKind::ALL)
                } else {
                    *self.pick(&unused)
                };
                used_kinds.push(kind);
                let params = self.sample_params(kind);
                SampledFault { kind, tier, params }
            })
            .collect()
    }

    /// With probability `compound_bias`, a compound of 2..=max_faults
    /// faults; otherwise a single fault.
    pub fn sample(&mut self, compound_bias: f64, max_faults: usize) -> Vec<SampledFault> {
        let compound = self.rng.gen::<f64>() < compound_bias;
        if compound && max_faults >= 2 {
            let k = self.rng.gen_range(2..=max_faults);
            self.sample_multi(k)
        } else {
            self.sample_single()
        }
    }

    fn pick_tier(&mut self) -> TargetTier {
        let idx = self.rng.gen_range(0..self.registry.len());
        self.registry.tiers()[idx].clone()
    }

    // ── Precompile probes ─────────────────────────────────────────────────

    pub fn sample_precompile(&mut self) -> Precompile {
        *self.pick(PRECOMPILES)
    }

    /// A random address in [0x0a, 0xffff] — below the deployed-contract
    /// range, above the precompiles — that must return empty.
    pub fn sample_empty_address(&mut self) -> String {
        let suffix: u32 = self.rng.gen_range(0x0a..=0xffff);
        format!("0x{:040x}", suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::TierRegistry;

    fn sampler(seed: u64) -> Sampler {
        Sampler::new(seed, TierRegistry::default_devnet())
    }

    fn fingerprint(
        faults: &[SampledFault],
    ) -> Vec<(havoc_domain::FaultKind, &'static str, FaultParams)> {
        faults
            .iter()
            .map(|f| (f.kind, f.tier.name, f.params.clone()))
            .collect()
    }

    #[test]
    fn equal_seeds_replay_identical_sequences() {
        let mut a = sampler(42);
        let mut b = sampler(42);
        for _ in 0..50 {
            assert_eq!(
                fingerprint(&a.sample(0.5, 3)),
                fingerprint(&b.sample(0.5, 3))
            );
        }
        assert_eq!(a.sample_empty_address(), b.sample_empty_address());
        assert_eq!(a.sample_precompile().name, b.sample_precompile().name);
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = sampler(1);
        let mut b = sampler(2);
        let seq_a: Vec<_> = (0..10).map(|_| fingerprint(&a.sample(0.5, 3))).collect();
        let seq_b: Vec<_> = (0..10).map(|_| fingerprint(&b.sample(0.5, 3))).collect();
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn multi_samples_are_pairwise_disjoint() {
        let mut s = sampler(7);
        for _ in 0..200 {
            let faults = s.sample_multi(3);
            for i in 0..faults.len() {
                for j in (i + 1)..faults.len() {
                    assert!(
                        faults[i].tier.is_disjoint(&faults[j].tier),
                        "{} and {} overlap",
                        faults[i].tier.name,
                        faults[j].tier.name
                    );
                }
            }
        }
    }

    #[test]
    fn compound_bias_one_always_compounds() {
        let mut s = sampler(9);
        for _ in 0..50 {
            let faults = s.sample(1.0, 3);
            assert!(faults.len() >= 2, "expected a compound, got {}", faults.len());
        }
    }

    #[test]
    fn compound_bias_zero_always_single() {
        let mut s = sampler(9);
        for _ in 0..50 {
            assert_eq!(s.sample(0.0, 3).len(), 1);
        }
    }

    #[test]
    fn sampled_percentages_are_in_range() {
        let mut s = sampler(11);
        for _ in 0..100 {
            let p = s.sample_params(FaultKind::Network);
            let loss = p.percent("packet_loss").unwrap().unwrap();
            assert!((0.0..=100.0).contains(&loss));
            let latency = p.get_f64("latency").unwrap().unwrap();
            assert!((50.0..=3000.0).contains(&latency));
        }
        for _ in 0..100 {
            let p = s.sample_params(FaultKind::ConnectionDrop);
            let prob = p.probability("probability").unwrap().unwrap();
            assert!((0.0..=1.0).contains(&prob));
        }
    }

    #[test]
    fn empty_address_is_in_reserved_range() {
        let mut s = sampler(13);
        for _ in 0..100 {
            let addr = s.sample_empty_address();
            assert_eq!(addr.len(), 42);
            let value = u64::from_str_radix(&addr[2..], 16).unwrap();
            assert!((0x0a..=0xffff).contains(&value));
        }
    }
}
