//! Audit and conservation validator
//!
//! Re-checks the at-rest invariants of settlement records and the
//! cross-record conservation of each client/date scope. Used inline after
//! batch runs and as a standalone reconciliation pass. Violations are
//! reported, never auto-repaired: a finding means a computation or
//! concurrency defect needing manual or recompute intervention.

use crate::{slots, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use settlement_store::{DateRange, SettlementKey, SettlementRecord, SettlementStore};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Severity of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Invariant violation; the data is wrong
    Error,
    /// Suspicious but not provably wrong
    Warning,
}

/// Kind of invariant a finding concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// A monetary field is negative
    NegativeAmount,
    /// A monetary field carries more than 2 decimal places
    ExcessScale,
    /// `after_intra != baseline - intra_settlement`
    IntraIdentity,
    /// `intra_settlement != min(baseline generation, baseline demand)`
    IntraMinRule,
    /// Inter debits do not sum to `inter_settlement` or increase a side
    InterIdentity,
    /// A later stage's amounts exceed an earlier stage's
    Monotonicity,
    /// Stage markers or fields out of sequence
    StageOrder,
    /// Settled amounts exceed the scope's baseline surplus
    ScopeConservation,
    /// One slot name maps to several slot time labels
    SlotTimeAmbiguity,
}

/// One violated invariant
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// Offending key, when the finding concerns a single record
    pub key: Option<SettlementKey>,

    /// Invariant kind
    pub kind: FindingKind,

    /// Severity
    pub severity: Severity,

    /// Description
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "[{:?}] {} ({})", self.kind, self.message, key),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

/// Report of a validation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    /// All findings, record-level first
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    /// Whether no error-severity finding was raised
    pub fn is_clean(&self) -> bool {
        self.findings.iter().all(|f| f.severity != Severity::Error)
    }

    /// Number of error-severity findings
    pub fn error_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count()
    }

    /// Number of warning-severity findings
    pub fn warning_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
            .count()
    }
}

/// Audit/conservation validator
///
/// Read-only: mutates nothing, reads scopes from a store snapshot.
#[derive(Debug, Default)]
pub struct ConservationValidator;

impl ConservationValidator {
    /// Create a validator
    pub fn new() -> Self {
        Self
    }

    /// Check the at-rest invariants of a single record
    pub fn check_record(&self, record: &SettlementRecord) -> Vec<Finding> {
        let mut findings = Vec::new();
        let key = &record.key;

        let amounts = [
            ("surplus_demand_sum", record.surplus_demand_sum),
            ("surplus_generation_sum", record.surplus_generation_sum),
            ("matched_settled_sum", record.matched_settled_sum),
            (
                "surplus_generation_sum_after_intra",
                record.surplus_generation_sum_after_intra,
            ),
            (
                "surplus_demand_sum_after_intra",
                record.surplus_demand_sum_after_intra,
            ),
            ("intra_settlement", record.intra_settlement),
            (
                "surplus_generation_sum_after_inter",
                record.surplus_generation_sum_after_inter,
            ),
            (
                "surplus_demand_sum_after_inter",
                record.surplus_demand_sum_after_inter,
            ),
            ("inter_settlement", record.inter_settlement),
        ];
        for (field, value) in amounts {
            if value < Decimal::ZERO {
                findings.push(Finding {
                    key: Some(key.clone()),
                    kind: FindingKind::NegativeAmount,
                    severity: Severity::Error,
                    message: format!("{} is negative: {}", field, value),
                });
            }
            if value.scale() > 2 {
                findings.push(Finding {
                    key: Some(key.clone()),
                    kind: FindingKind::ExcessScale,
                    severity: Severity::Error,
                    message: format!("{} has more than 2 decimal places: {}", field, value),
                });
            }
        }

        if record.has_inter && !record.has_intra {
            findings.push(Finding {
                key: Some(key.clone()),
                kind: FindingKind::StageOrder,
                severity: Severity::Error,
                message: "inter stage marked complete without intra".to_string(),
            });
        }

        if record.has_intra {
            let expected_gen = record.surplus_generation_sum - record.intra_settlement;
            let expected_dem = record.surplus_demand_sum - record.intra_settlement;
            if record.surplus_generation_sum_after_intra != expected_gen
                || record.surplus_demand_sum_after_intra != expected_dem
            {
                findings.push(Finding {
                    key: Some(key.clone()),
                    kind: FindingKind::IntraIdentity,
                    severity: Severity::Error,
                    message: format!(
                        "after-intra amounts ({}, {}) != baseline - {}",
                        record.surplus_generation_sum_after_intra,
                        record.surplus_demand_sum_after_intra,
                        record.intra_settlement
                    ),
                });
            }

            let min_rule = record
                .surplus_generation_sum
                .min(record.surplus_demand_sum);
            if record.intra_settlement != min_rule {
                findings.push(Finding {
                    key: Some(key.clone()),
                    kind: FindingKind::IntraMinRule,
                    severity: Severity::Error,
                    message: format!(
                        "intra_settlement {} != min(generation, demand) = {}",
                        record.intra_settlement, min_rule
                    ),
                });
            }

            if record.surplus_generation_sum_after_intra > record.surplus_generation_sum
                || record.surplus_demand_sum_after_intra > record.surplus_demand_sum
            {
                findings.push(Finding {
                    key: Some(key.clone()),
                    kind: FindingKind::Monotonicity,
                    severity: Severity::Error,
                    message: "after-intra amounts exceed baseline".to_string(),
                });
            }
        } else if record.intra_settlement != Decimal::ZERO
            || record.surplus_generation_sum_after_intra != Decimal::ZERO
            || record.surplus_demand_sum_after_intra != Decimal::ZERO
        {
            findings.push(Finding {
                key: Some(key.clone()),
                kind: FindingKind::StageOrder,
                severity: Severity::Error,
                message: "intra fields populated without stage marker".to_string(),
            });
        }

        if record.has_inter {
            let delta_gen =
                record.surplus_generation_sum_after_intra - record.surplus_generation_sum_after_inter;
            let delta_dem =
                record.surplus_demand_sum_after_intra - record.surplus_demand_sum_after_inter;
            if delta_gen < Decimal::ZERO || delta_dem < Decimal::ZERO {
                findings.push(Finding {
                    key: Some(key.clone()),
                    kind: FindingKind::Monotonicity,
                    severity: Severity::Error,
                    message: "after-inter amounts exceed after-intra".to_string(),
                });
            } else if delta_gen + delta_dem != record.inter_settlement {
                findings.push(Finding {
                    key: Some(key.clone()),
                    kind: FindingKind::InterIdentity,
                    severity: Severity::Error,
                    message: format!(
                        "inter debits ({}, {}) do not sum to {}",
                        delta_gen, delta_dem, record.inter_settlement
                    ),
                });
            }
        } else if record.inter_settlement != Decimal::ZERO
            || record.surplus_generation_sum_after_inter != Decimal::ZERO
            || record.surplus_demand_sum_after_inter != Decimal::ZERO
        {
            findings.push(Finding {
                key: Some(key.clone()),
                kind: FindingKind::StageOrder,
                severity: Severity::Error,
                message: "inter fields populated without stage marker".to_string(),
            });
        }

        findings
    }

    /// Validate every record in a scope plus cross-record conservation
    ///
    /// Records are read from a single store snapshot so the cross-record
    /// sums see one consistent point in time.
    pub fn check_scope(
        &self,
        store: &SettlementStore,
        range: Option<DateRange>,
        client: Option<&str>,
    ) -> Result<ValidationReport> {
        let records = store.snapshot_scope(range, client)?;
        let mut findings = Vec::new();

        for record in &records {
            findings.extend(self.check_record(record));
        }

        findings.extend(self.check_conservation(&records));
        findings.extend(self.check_slot_times(&records));

        if !findings.is_empty() {
            tracing::warn!(
                findings = findings.len(),
                records = records.len(),
                "Validation pass raised findings"
            );
        }

        Ok(ValidationReport { findings })
    }

    /// Cross-record conservation per (client, date) scope
    ///
    /// Settled energy is counted per debit side: the intra amount plus the
    /// generation-side inter debit must fit inside the baseline generation
    /// sum (symmetrically for demand). A violation indicates a computation
    /// or concurrency defect.
    fn check_conservation(&self, records: &[SettlementRecord]) -> Vec<Finding> {
        #[derive(Default)]
        struct ScopeTotals {
            baseline_gen: Decimal,
            baseline_dem: Decimal,
            settled_gen_side: Decimal,
            settled_dem_side: Decimal,
        }

        let mut scopes: BTreeMap<(String, NaiveDate), ScopeTotals> = BTreeMap::new();

        for record in records {
            let totals = scopes
                .entry((record.key.client_name.clone(), record.key.date))
                .or_default();
            totals.baseline_gen += record.surplus_generation_sum;
            totals.baseline_dem += record.surplus_demand_sum;
            totals.settled_gen_side += record.intra_settlement;
            totals.settled_dem_side += record.intra_settlement;
            if record.has_inter {
                totals.settled_gen_side += record.surplus_generation_sum_after_intra
                    - record.surplus_generation_sum_after_inter;
                totals.settled_dem_side += record.surplus_demand_sum_after_intra
                    - record.surplus_demand_sum_after_inter;
            }
        }

        let mut findings = Vec::new();
        for ((client, date), totals) in scopes {
            if totals.settled_gen_side > totals.baseline_gen {
                findings.push(Finding {
                    key: None,
                    kind: FindingKind::ScopeConservation,
                    severity: Severity::Error,
                    message: format!(
                        "{}/{}: settled generation {} exceeds baseline {}",
                        client, date, totals.settled_gen_side, totals.baseline_gen
                    ),
                });
            }
            if totals.settled_dem_side > totals.baseline_dem {
                findings.push(Finding {
                    key: None,
                    kind: FindingKind::ScopeConservation,
                    severity: Severity::Error,
                    message: format!(
                        "{}/{}: settled demand {} exceeds baseline {}",
                        client, date, totals.settled_dem_side, totals.baseline_dem
                    ),
                });
            }
        }
        findings
    }

    /// Slot-time audit
    ///
    /// `slot_time` is descriptive and excluded from the unique key, so
    /// nothing stops one slot name carrying several time labels. Flagged as
    /// warnings, along with labels that disagree with the canonical slot
    /// table.
    fn check_slot_times(&self, records: &[SettlementRecord]) -> Vec<Finding> {
        let mut labels: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for record in records {
            labels
                .entry(record.key.slot_name.as_str())
                .or_default()
                .insert(record.key.slot_time.as_str());
        }

        let mut findings = Vec::new();
        for (slot_name, slot_times) in labels {
            if slot_times.len() > 1 {
                findings.push(Finding {
                    key: None,
                    kind: FindingKind::SlotTimeAmbiguity,
                    severity: Severity::Warning,
                    message: format!(
                        "slot '{}' carries {} slot_time labels: {}",
                        slot_name,
                        slot_times.len(),
                        slot_times.iter().copied().collect::<Vec<_>>().join(", ")
                    ),
                });
            }
            if let Some(canonical) = slots::canonical_slot(slot_name) {
                for slot_time in &slot_times {
                    if *slot_time != canonical.slot_time {
                        findings.push(Finding {
                            key: None,
                            kind: FindingKind::SlotTimeAmbiguity,
                            severity: Severity::Warning,
                            message: format!(
                                "slot '{}' label '{}' differs from canonical '{}'",
                                slot_name, slot_time, canonical.slot_time
                            ),
                        });
                    }
                }
            }
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use settlement_store::PlantType;
    use uuid::Uuid;

    fn dec(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    fn record(gen: i64, dem: i64) -> SettlementRecord {
        SettlementRecord {
            record_id: Uuid::now_v7(),
            key: SettlementKey {
                client_name: "Acme Textiles".to_string(),
                plant_name: "Acme Solar I".to_string(),
                cons_unit: "HT-201".to_string(),
                slot_name: "Morning Peak".to_string(),
                slot_time: "06:00-09:00".to_string(),
                date: chrono::NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
                plant_type: PlantType::Solar,
            },
            surplus_demand_sum: dec(dem),
            surplus_generation_sum: dec(gen),
            matched_settled_sum: Decimal::ZERO,
            surplus_generation_sum_after_intra: Decimal::ZERO,
            surplus_demand_sum_after_intra: Decimal::ZERO,
            intra_settlement: Decimal::ZERO,
            surplus_generation_sum_after_inter: Decimal::ZERO,
            surplus_demand_sum_after_inter: Decimal::ZERO,
            inter_settlement: Decimal::ZERO,
            has_intra: false,
            has_inter: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn settled_record(gen: i64, dem: i64) -> SettlementRecord {
        let mut r = record(gen, dem);
        let settled = r.surplus_generation_sum.min(r.surplus_demand_sum);
        r.intra_settlement = settled;
        r.surplus_generation_sum_after_intra = r.surplus_generation_sum - settled;
        r.surplus_demand_sum_after_intra = r.surplus_demand_sum - settled;
        r.has_intra = true;
        r
    }

    #[test]
    fn test_clean_baseline_record() {
        let validator = ConservationValidator::new();
        assert!(validator.check_record(&record(10000, 6000)).is_empty());
    }

    #[test]
    fn test_negative_amount_flagged() {
        let validator = ConservationValidator::new();
        let mut r = record(10000, 6000);
        r.surplus_demand_sum = dec(-100);

        let findings = validator.check_record(&r);
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::NegativeAmount));
    }

    #[test]
    fn test_intra_identity_flagged() {
        let validator = ConservationValidator::new();
        let mut r = settled_record(10000, 6000);
        r.surplus_generation_sum_after_intra = dec(9999);

        let findings = validator.check_record(&r);
        assert!(findings.iter().any(|f| f.kind == FindingKind::IntraIdentity));
    }

    #[test]
    fn test_intra_min_rule_flagged() {
        let validator = ConservationValidator::new();
        let mut r = record(10000, 6000);
        // Identity holds but the settled amount is not the min
        r.intra_settlement = dec(5000);
        r.surplus_generation_sum_after_intra = dec(5000);
        r.surplus_demand_sum_after_intra = dec(1000);
        r.has_intra = true;

        let findings = validator.check_record(&r);
        assert!(findings.iter().any(|f| f.kind == FindingKind::IntraMinRule));
    }

    #[test]
    fn test_stage_order_flagged() {
        let validator = ConservationValidator::new();
        let mut r = record(10000, 6000);
        r.has_inter = true;

        let findings = validator.check_record(&r);
        assert!(findings.iter().any(|f| f.kind == FindingKind::StageOrder));
    }

    #[test]
    fn test_fields_without_marker_flagged() {
        let validator = ConservationValidator::new();
        let mut r = record(10000, 6000);
        r.intra_settlement = dec(6000);

        let findings = validator.check_record(&r);
        assert!(findings.iter().any(|f| f.kind == FindingKind::StageOrder));
    }

    #[test]
    fn test_inter_identity_flagged() {
        let validator = ConservationValidator::new();
        let mut r = settled_record(10000, 6000);
        // 40.00 generation left; claim 30.00 settled but debit only 20.00
        r.surplus_generation_sum_after_inter = dec(2000);
        r.inter_settlement = dec(3000);
        r.has_inter = true;

        let findings = validator.check_record(&r);
        assert!(findings.iter().any(|f| f.kind == FindingKind::InterIdentity));
    }

    #[test]
    fn test_conservation_violation_flagged() {
        let validator = ConservationValidator::new();
        // Corrupt intra bookkeeping: 60.00 settled intra but only 50.00
        // deducted, then the inflated 60.00 leftover settled inter. The
        // generation side spends 120.00 out of a 110.00 baseline.
        let mut r = record(11000, 6000);
        r.intra_settlement = dec(6000);
        r.surplus_generation_sum_after_intra = dec(6000);
        r.surplus_demand_sum_after_intra = Decimal::ZERO;
        r.has_intra = true;
        r.surplus_generation_sum_after_inter = Decimal::ZERO;
        r.surplus_demand_sum_after_inter = Decimal::ZERO;
        r.inter_settlement = dec(6000);
        r.has_inter = true;

        let findings = validator.check_conservation(&[r]);
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::ScopeConservation));
    }

    #[test]
    fn test_conservation_clean_scope() {
        let validator = ConservationValidator::new();
        // Generator banks 30.00 into a sibling's leftover demand
        let mut generator = settled_record(10000, 6000);
        generator.surplus_generation_sum_after_inter = dec(1000);
        generator.surplus_demand_sum_after_inter = Decimal::ZERO;
        generator.inter_settlement = dec(3000);
        generator.has_inter = true;

        let mut consumer = settled_record(0, 3000);
        consumer.key.plant_name = "Acme Solar II".to_string();
        consumer.surplus_generation_sum_after_inter = Decimal::ZERO;
        consumer.surplus_demand_sum_after_inter = Decimal::ZERO;
        consumer.inter_settlement = dec(3000);
        consumer.has_inter = true;

        let findings = validator.check_conservation(&[generator, consumer]);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_slot_time_ambiguity_warning() {
        let validator = ConservationValidator::new();
        let a = record(100, 0);
        let mut b = record(200, 0);
        b.key.plant_name = "Acme Solar II".to_string();
        b.key.slot_time = "06:00-10:00".to_string();

        let findings = validator.check_slot_times(&[a, b]);
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::SlotTimeAmbiguity
                && f.severity == Severity::Warning));
    }
}
