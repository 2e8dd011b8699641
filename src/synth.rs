//! Synthetic transaction generator.
//!
//! Features are drawn independently per record from fixed distributions. A
//! record is `safe` outright with probability [`SAFE_PROBABILITY`]; otherwise
//! the ordered [`threat_rules`] list is scanned and the first matching rule
//! labels the record and overwrites some of its fields. A record that matches
//! no rule falls back to `safe`.

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::config::TrainerConfig;
use crate::input::write_csv;
use crate::utils::{FeatureTable, ThreatLabel, TransactionRecord};

pub const SAFE_PROBABILITY: f64 = 0.7;

/// One threat pattern: a predicate over raw fields and the field overrides
/// applied when it is the first rule to match.
pub struct ThreatRule {
    pub label: ThreatLabel,
    pub matches: fn(&TransactionRecord) -> bool,
    pub inject: fn(&mut TransactionRecord, &mut ChaCha8Rng),
}

static THREAT_RULES: [ThreatRule; 7] = [
    ThreatRule {
        label: ThreatLabel::Phishing,
        matches: is_phishing,
        inject: inject_phishing,
    },
    ThreatRule {
        label: ThreatLabel::RugPull,
        matches: is_rug_pull,
        inject: inject_rug_pull,
    },
    ThreatRule {
        label: ThreatLabel::FlashLoanAttack,
        matches: is_flash_loan,
        inject: inject_flash_loan,
    },
    ThreatRule {
        label: ThreatLabel::SmartContractExploit,
        matches: is_contract_exploit,
        inject: inject_contract_exploit,
    },
    ThreatRule {
        label: ThreatLabel::SandwichAttack,
        matches: is_sandwich,
        inject: inject_sandwich,
    },
    ThreatRule {
        label: ThreatLabel::FrontRunning,
        matches: is_front_running,
        inject: no_overrides,
    },
    ThreatRule {
        label: ThreatLabel::BackRunning,
        matches: is_back_running,
        inject: no_overrides,
    },
];

/// Threat rules in priority order. Earlier rules shadow later ones.
pub fn threat_rules() -> &'static [ThreatRule] {
    &THREAT_RULES
}

/// First rule whose predicate holds for `record`, ignoring the safe draw.
pub fn match_rule(record: &TransactionRecord) -> Option<&'static ThreatRule> {
    THREAT_RULES.iter().find(|rule| (rule.matches)(record))
}

fn is_phishing(r: &TransactionRecord) -> bool {
    r.approval_amount > 10_000.0 && r.to_address_age < 7.0 && r.contract_verified == 0.0
}

fn inject_phishing(r: &mut TransactionRecord, rng: &mut ChaCha8Rng) {
    // unlimited approval
    r.approval_amount = rng.gen_range(1e18..1e30);
    r.honeypot_score = rng.gen_range(0.7..1.0);
}

fn is_rug_pull(r: &TransactionRecord) -> bool {
    r.dex_interaction == 1.0 && r.value > 10.0 && r.time_between_txs < 10.0
}

fn inject_rug_pull(r: &mut TransactionRecord, rng: &mut ChaCha8Rng) {
    r.slippage_tolerance = rng.gen_range(50.0..100.0);
    r.mev_potential = rng.gen_range(0.8..1.0);
}

fn is_flash_loan(r: &TransactionRecord) -> bool {
    r.gas_limit > 300_000.0 && r.data_length > 5_000.0 && r.unique_addresses > 10.0
}

fn inject_flash_loan(r: &mut TransactionRecord, rng: &mut ChaCha8Rng) {
    r.value = rng.gen_range(1_000.0..100_000.0);
    // same block
    r.time_between_txs = 0.0;
}

fn is_contract_exploit(r: &TransactionRecord) -> bool {
    r.contract_creation == 1.0 && r.gas_limit > 200_000.0 && r.contract_verified == 0.0
}

fn inject_contract_exploit(r: &mut TransactionRecord, rng: &mut ChaCha8Rng) {
    r.honeypot_score = rng.gen_range(0.6..0.9);
}

fn is_sandwich(r: &TransactionRecord) -> bool {
    r.dex_interaction == 1.0 && r.mev_potential > 0.7 && r.gas_price > 50.0
}

fn inject_sandwich(r: &mut TransactionRecord, rng: &mut ChaCha8Rng) {
    r.slippage_tolerance = rng.gen_range(0.1..1.0);
}

fn is_front_running(r: &TransactionRecord) -> bool {
    r.gas_price > 100.0 && r.mev_potential > 0.8 && r.time_between_txs < 5.0
}

fn is_back_running(r: &TransactionRecord) -> bool {
    r.gas_price < 10.0 && r.mev_potential > 0.6 && r.dex_interaction == 1.0
}

fn no_overrides(_: &mut TransactionRecord, _: &mut ChaCha8Rng) {}

/// Label bookkeeping for one generation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    /// Records labeled safe by the 70% draw.
    pub drawn_safe: usize,
    /// Records that went through the rules but matched none.
    pub fallback_safe: usize,
    /// Matches per rule, in rule order.
    pub rule_hits: Vec<(ThreatLabel, usize)>,
}

impl GenerationStats {
    fn new() -> Self {
        Self {
            drawn_safe: 0,
            fallback_safe: 0,
            rule_hits: THREAT_RULES.iter().map(|r| (r.label, 0)).collect(),
        }
    }
}

fn exponential(rng: &mut ChaCha8Rng, scale: f64) -> f64 {
    let u: f64 = rng.r#gen();
    -scale * (1.0 - u).ln()
}

/// `1.0` with probability `p_one`, else `0.0`.
fn flag(rng: &mut ChaCha8Rng, p_one: f64) -> f64 {
    let u: f64 = rng.r#gen();
    if u < 1.0 - p_one { 0.0 } else { 1.0 }
}

fn int_in(rng: &mut ChaCha8Rng, low: i64, high: i64) -> f64 {
    rng.gen_range(low..high) as f64
}

/// Draw the raw features of record `index`. The label is provisional.
pub fn draw_record(index: usize, rng: &mut ChaCha8Rng) -> TransactionRecord {
    TransactionRecord {
        tx_id: format!("tx_{index}"),
        gas_limit: int_in(rng, 21_000, 500_000),
        gas_price: exponential(rng, 20.0),
        value: exponential(rng, 1.0),
        data_length: int_in(rng, 0, 10_000),
        to_address_age: int_in(rng, 0, 365 * 5),
        from_address_age: int_in(rng, 0, 365 * 5),
        transaction_count: int_in(rng, 1, 1_000),
        unique_addresses: int_in(rng, 1, 100),
        time_between_txs: exponential(rng, 60.0),
        contract_creation: flag(rng, 0.1),
        token_transfer: flag(rng, 0.3),
        dex_interaction: flag(rng, 0.2),
        approval_amount: exponential(rng, 1_000.0),
        slippage_tolerance: rng.gen_range(0.1..10.0),
        mev_potential: rng.gen_range(0.0..1.0),
        network_congestion: rng.gen_range(0.0..1.0),
        address_reputation: rng.gen_range(0.0..1.0),
        contract_verified: flag(rng, 0.7),
        honeypot_score: rng.gen_range(0.0..1.0),
        threat_type: ThreatLabel::Safe,
    }
}

fn assign_label(
    record: &mut TransactionRecord,
    rng: &mut ChaCha8Rng,
    stats: &mut GenerationStats,
) -> ThreatLabel {
    let draw: f64 = rng.r#gen();
    if draw < SAFE_PROBABILITY {
        stats.drawn_safe += 1;
        return ThreatLabel::Safe;
    }

    match THREAT_RULES
        .iter()
        .position(|rule| (rule.matches)(record))
    {
        Some(idx) => {
            let rule = &THREAT_RULES[idx];
            (rule.inject)(record, rng);
            stats.rule_hits[idx].1 += 1;
            rule.label
        }
        None => {
            stats.fallback_safe += 1;
            ThreatLabel::Safe
        }
    }
}

/// Generate `n_samples` labeled records. Same `(n_samples, seed)` gives the same records.
pub fn generate_records(n_samples: usize, seed: u64) -> (Vec<TransactionRecord>, GenerationStats) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut stats = GenerationStats::new();
    let mut records = Vec::with_capacity(n_samples);

    for i in 0..n_samples {
        let mut record = draw_record(i, &mut rng);
        record.threat_type = assign_label(&mut record, &mut rng, &mut stats);
        records.push(record);
    }

    for (label, hits) in &stats.rule_hits {
        debug!(label = %label, hits, "threat rule matches");
    }
    (records, stats)
}

/// Generate the synthetic dataset and write it to the default data file.
pub fn generate_synthetic_data(config: &TrainerConfig) -> Result<FeatureTable> {
    info!(samples = config.n_samples, seed = config.seed, "generating synthetic training samples");
    let (records, stats) = generate_records(config.n_samples, config.seed);
    if stats.fallback_safe > 0 {
        info!(
            fallback_safe = stats.fallback_safe,
            "records drawn as threats matched no rule and were labeled safe"
        );
    }

    let table = FeatureTable::from_records(&records);
    let path = config.synthetic_data_file();
    write_csv(&path, &table)?;
    info!(path = %path.display(), rows = table.len(), "synthetic data saved");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> TransactionRecord {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut r = draw_record(0, &mut rng);
        // neutral values that trip no rule
        r.approval_amount = 10.0;
        r.dex_interaction = 0.0;
        r.gas_limit = 100_000.0;
        r.contract_creation = 0.0;
        r.gas_price = 20.0;
        r.mev_potential = 0.1;
        r
    }

    #[test]
    fn neutral_record_matches_no_rule() {
        assert!(match_rule(&base_record()).is_none());
    }

    #[test]
    fn forced_phishing_record_matches_phishing() {
        let mut r = base_record();
        r.approval_amount = 1e25;
        r.to_address_age = 1.0;
        r.contract_verified = 0.0;
        let rule = match_rule(&r).expect("rule");
        assert_eq!(rule.label, ThreatLabel::Phishing);
    }

    #[test]
    fn rug_pull_shadows_flash_loan() {
        let mut r = base_record();
        r.dex_interaction = 1.0;
        r.value = 50.0;
        r.time_between_txs = 1.0;
        r.gas_limit = 400_000.0;
        r.data_length = 8_000.0;
        r.unique_addresses = 50.0;
        assert!(is_flash_loan(&r));
        assert_eq!(match_rule(&r).unwrap().label, ThreatLabel::RugPull);
    }

    #[test]
    fn rule_order_is_fixed() {
        let order: Vec<ThreatLabel> = threat_rules().iter().map(|r| r.label).collect();
        assert_eq!(
            order,
            vec![
                ThreatLabel::Phishing,
                ThreatLabel::RugPull,
                ThreatLabel::FlashLoanAttack,
                ThreatLabel::SmartContractExploit,
                ThreatLabel::SandwichAttack,
                ThreatLabel::FrontRunning,
                ThreatLabel::BackRunning,
            ]
        );
    }

    #[test]
    fn flash_loan_overrides_value_and_timing() {
        let mut r = base_record();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        inject_flash_loan(&mut r, &mut rng);
        assert!((1_000.0..100_000.0).contains(&r.value));
        assert_eq!(r.time_between_txs, 0.0);
    }

    #[test]
    fn generation_is_deterministic() {
        let (a, sa) = generate_records(500, 42);
        let (b, sb) = generate_records(500, 42);
        assert_eq!(a, b);
        assert_eq!(sa, sb);
        let (c, _) = generate_records(500, 43);
        assert_ne!(a, c);
    }

    #[test]
    fn raw_draws_stay_in_range() {
        let (records, _) = generate_records(2_000, 42);
        for r in &records {
            assert!((21_000.0..500_000.0).contains(&r.gas_limit));
            assert!((0.0..10_000.0).contains(&r.data_length));
            assert!((1.0..100.0).contains(&r.unique_addresses));
            assert!(r.contract_creation == 0.0 || r.contract_creation == 1.0);
            assert!(r.gas_price >= 0.0);
        }
        assert_eq!(records[17].tx_id, "tx_17");
    }

    #[test]
    fn label_distribution_is_mostly_safe() {
        let n = 10_000;
        let (records, stats) = generate_records(n, 42);
        let safe = records
            .iter()
            .filter(|r| r.threat_type == ThreatLabel::Safe)
            .count();
        assert_eq!(safe, stats.drawn_safe + stats.fallback_safe);

        let drawn_frac = stats.drawn_safe as f64 / n as f64;
        assert!((drawn_frac - SAFE_PROBABILITY).abs() < 0.02, "drawn safe {drawn_frac}");

        let threats: usize = stats.rule_hits.iter().map(|(_, h)| h).sum();
        assert_eq!(threats + safe, n);
        // flash loans are by far the most common threat pattern
        let flash = stats
            .rule_hits
            .iter()
            .find(|(l, _)| *l == ThreatLabel::FlashLoanAttack)
            .unwrap()
            .1;
        assert!(flash > 0);
        assert!(stats.rule_hits.iter().all(|(_, h)| *h <= flash));
    }
}
