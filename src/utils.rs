use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Error, anyhow};
use bincode::{Decode, Encode};

/// Identifier column; never used as a feature.
pub const ID_COLUMN: &str = "tx_id";
/// Label column; never used as a feature.
pub const LABEL_COLUMN: &str = "threat_type";

/// Canonical feature order of a synthetic transaction record.
pub const FEATURE_NAMES: [&str; 19] = [
    "gas_limit",
    "gas_price",
    "value",
    "data_length",
    "to_address_age",
    "from_address_age",
    "transaction_count",
    "unique_addresses",
    "time_between_txs",
    "contract_creation",
    "token_transfer",
    "dex_interaction",
    "approval_amount",
    "slippage_tolerance",
    "mev_potential",
    "network_congestion",
    "address_reputation",
    "contract_verified",
    "honeypot_score",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum ThreatLabel {
    Safe,
    Phishing,
    RugPull,
    FlashLoanAttack,
    SmartContractExploit,
    SandwichAttack,
    FrontRunning,
    BackRunning,
}

impl ThreatLabel {
    /// Declaration order. Encoded class order is alphabetical, see `LabelEncoder`.
    pub const ALL: [ThreatLabel; 8] = [
        ThreatLabel::Safe,
        ThreatLabel::Phishing,
        ThreatLabel::RugPull,
        ThreatLabel::FlashLoanAttack,
        ThreatLabel::SmartContractExploit,
        ThreatLabel::SandwichAttack,
        ThreatLabel::FrontRunning,
        ThreatLabel::BackRunning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLabel::Safe => "safe",
            ThreatLabel::Phishing => "phishing",
            ThreatLabel::RugPull => "rug_pull",
            ThreatLabel::FlashLoanAttack => "flash_loan_attack",
            ThreatLabel::SmartContractExploit => "smart_contract_exploit",
            ThreatLabel::SandwichAttack => "sandwich_attack",
            ThreatLabel::FrontRunning => "front_running",
            ThreatLabel::BackRunning => "back_running",
        }
    }
}

impl fmt::Display for ThreatLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ThreatLabel::ALL
            .into_iter()
            .find(|label| label.as_str() == trimmed)
            .ok_or_else(|| anyhow!("unknown threat label '{trimmed}'"))
    }
}

/// One synthetic transaction. Integer-valued and boolean fields are stored as
/// `f64` so rule overrides and CSV output treat every feature uniformly.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub tx_id: String,
    pub gas_limit: f64,
    pub gas_price: f64,
    pub value: f64,
    pub data_length: f64,
    pub to_address_age: f64,
    pub from_address_age: f64,
    pub transaction_count: f64,
    pub unique_addresses: f64,
    pub time_between_txs: f64,
    pub contract_creation: f64,
    pub token_transfer: f64,
    pub dex_interaction: f64,
    pub approval_amount: f64,
    pub slippage_tolerance: f64,
    pub mev_potential: f64,
    pub network_congestion: f64,
    pub address_reputation: f64,
    pub contract_verified: f64,
    pub honeypot_score: f64,
    pub threat_type: ThreatLabel,
}

impl TransactionRecord {
    /// Feature values in `FEATURE_NAMES` order.
    pub fn features(&self) -> [f64; 19] {
        [
            self.gas_limit,
            self.gas_price,
            self.value,
            self.data_length,
            self.to_address_age,
            self.from_address_age,
            self.transaction_count,
            self.unique_addresses,
            self.time_between_txs,
            self.contract_creation,
            self.token_transfer,
            self.dex_interaction,
            self.approval_amount,
            self.slippage_tolerance,
            self.mev_potential,
            self.network_congestion,
            self.address_reputation,
            self.contract_verified,
            self.honeypot_score,
        ]
    }
}

/// Raw labeled table as loaded from CSV or produced by the generator.
/// `None` cells are missing values awaiting imputation.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    pub columns: Vec<String>,
    pub ids: Vec<String>,
    pub rows: Vec<Vec<Option<f64>>>,
    pub labels: Vec<ThreatLabel>,
}

impl FeatureTable {
    pub fn from_records(records: &[TransactionRecord]) -> Self {
        Self {
            columns: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            ids: records.iter().map(|r| r.tx_id.clone()).collect(),
            rows: records
                .iter()
                .map(|r| r.features().into_iter().map(Some).collect())
                .collect(),
            labels: records.iter().map(|r| r.threat_type).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn missing_cells(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.iter().filter(|c| c.is_none()).count())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub name: String,
    pub accuracy: f64,
}

/// Everything the CLI reports once a run completes.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub samples: usize,
    pub features: usize,
    pub candidates: Vec<CandidateScore>,
    pub winner: String,
    pub held_out_accuracy: f64,
    pub onnx_exported: bool,
    pub artifacts: Vec<PathBuf>,
    pub model_dir: PathBuf,
}

pub fn print_summary(summary: &PipelineSummary) {
    println!();
    println!("{:-<64}", "");
    println!(
        "  dagshield-train  ({} samples, {} features)",
        summary.samples, summary.features
    );
    println!("{:-<64}", "");
    println!("  {:<28} | {:>10} | {:>8}", "Candidate", "Accuracy", "Winner");
    println!("  {:-<28}-+-{:-<10}-+-{:-<8}", "", "", "");
    for c in &summary.candidates {
        let mark = if c.name == summary.winner { "yes" } else { "" };
        println!("  {:<28} | {:>10.4} | {:>8}", c.name, c.accuracy, mark);
    }
    println!("{:-<64}", "");
    for path in &summary.artifacts {
        println!("  wrote {}", path.display());
    }
    if !summary.onnx_exported {
        println!("  ONNX export skipped (see warnings)");
    }
    println!("  artifacts in {}", summary.model_dir.display());
    println!();
}
