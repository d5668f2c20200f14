//! Surplus allocation algorithms
//!
//! Pure functions, no I/O, no shared state. Identical inputs always yield
//! identical outputs, so stage transitions can be retried and recomputed
//! safely.
//!
//! # Algorithm
//!
//! Within one record, surplus generation and surplus demand cancel up to
//! `min(generation, demand)` (intra pass). Whatever remains on one side is
//! then matched against the opposite leftovers of sibling records in the
//! same eligibility group (inter pass), largest leftover first.
//!
//! # Example
//!
//! ```text
//! Baseline:
//!   generation: 100.00, demand: 60.00
//!
//! Intra pass:
//!   settled: 60.00 → generation 40.00, demand 0.00
//!
//! Inter pass against a sibling with 30.00 leftover demand:
//!   matched: 30.00 → generation 10.00, demand 0.00
//! ```

use crate::{Error, Result};
use rust_decimal::Decimal;
use settlement_store::{SettlementKey, SettlementRecord};

/// Outcome of a single allocation pass over one generation/demand pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Amount settled by the pass
    pub settled: Decimal,

    /// Generation remaining after the pass
    pub generation_after: Decimal,

    /// Demand remaining after the pass
    pub demand_after: Decimal,
}

fn check_input(field: &str, value: Decimal) -> Result<()> {
    if value < Decimal::ZERO {
        return Err(Error::InvalidInput(format!(
            "{} must be non-negative, got {}",
            field, value
        )));
    }
    Ok(())
}

fn match_surplus(generation: Decimal, demand: Decimal) -> Allocation {
    let settled = generation.min(demand);
    Allocation {
        settled,
        generation_after: generation - settled,
        demand_after: demand - settled,
    }
}

/// Compute the intra settlement for one key's baseline aggregates
///
/// `settled = min(generation, demand)`; equal inputs fully settle both
/// sides to zero. Negative inputs are rejected, never clamped.
pub fn compute_intra(generation_sum: Decimal, demand_sum: Decimal) -> Result<Allocation> {
    check_input("generation_sum", generation_sum)?;
    check_input("demand_sum", demand_sum)?;
    Ok(match_surplus(generation_sum, demand_sum))
}

/// Compute an inter settlement step over Stage-2 leftovers
///
/// Identical algorithm to [`compute_intra`], applied at the group level.
pub fn compute_inter(generation_after_intra: Decimal, demand_after_intra: Decimal) -> Result<Allocation> {
    check_input("generation_after_intra", generation_after_intra)?;
    check_input("demand_after_intra", demand_after_intra)?;
    Ok(match_surplus(generation_after_intra, demand_after_intra))
}

/// One record's position inside an inter-settlement eligibility group
#[derive(Debug, Clone)]
pub struct InterPosition {
    /// Record identity
    pub key: SettlementKey,

    /// Surplus generation still unmatched
    pub generation_left: Decimal,

    /// Surplus demand still unmatched
    pub demand_left: Decimal,

    /// Amount matched for this record so far
    pub matched: Decimal,
}

impl InterPosition {
    /// Build a position from a Stage-2 record
    pub fn from_record(record: &SettlementRecord) -> Self {
        Self {
            key: record.key.clone(),
            generation_left: record.surplus_generation_sum_after_intra,
            demand_left: record.surplus_demand_sum_after_intra,
            matched: Decimal::ZERO,
        }
    }
}

/// Match remaining surplus generation against remaining surplus demand
/// inside one eligibility group
///
/// Greedy matching, largest leftover first, ties broken by key order, so
/// the allocation is deterministic for a given group. Each match debits a
/// generator's `generation_left` and a consumer's `demand_left` by the same
/// amount and accrues it into both records' `matched` totals. Returns the
/// total matched across the group, which equals
/// `min(Σ generation_left, Σ demand_left)`.
///
/// Positions are expected to come from validated Stage-2 records, so
/// amounts are non-negative.
pub fn allocate_inter_group(positions: &mut [InterPosition]) -> Decimal {
    let mut generators: Vec<usize> = (0..positions.len())
        .filter(|&i| positions[i].generation_left > Decimal::ZERO)
        .collect();
    let mut consumers: Vec<usize> = (0..positions.len())
        .filter(|&i| positions[i].demand_left > Decimal::ZERO)
        .collect();

    // Largest leftover first; key order for equal amounts
    generators.sort_by(|&a, &b| {
        positions[b]
            .generation_left
            .cmp(&positions[a].generation_left)
            .then_with(|| positions[a].key.cmp(&positions[b].key))
    });
    consumers.sort_by(|&a, &b| {
        positions[b]
            .demand_left
            .cmp(&positions[a].demand_left)
            .then_with(|| positions[a].key.cmp(&positions[b].key))
    });

    let mut total = Decimal::ZERO;
    let mut gi = 0;
    let mut ci = 0;

    while gi < generators.len() && ci < consumers.len() {
        let g = generators[gi];
        let c = consumers[ci];

        // A record never banks against itself
        if g == c {
            ci += 1;
            continue;
        }

        let amount = positions[g].generation_left.min(positions[c].demand_left);
        if amount > Decimal::ZERO {
            positions[g].generation_left -= amount;
            positions[g].matched += amount;
            positions[c].demand_left -= amount;
            positions[c].matched += amount;
            total += amount;
        }

        if positions[g].generation_left == Decimal::ZERO {
            gi += 1;
        }
        if positions[c].demand_left == Decimal::ZERO {
            ci += 1;
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use settlement_store::PlantType;

    fn dec(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    fn position(plant: &str, generation_left: i64, demand_left: i64) -> InterPosition {
        InterPosition {
            key: SettlementKey {
                client_name: "Acme Textiles".to_string(),
                plant_name: plant.to_string(),
                cons_unit: "HT-201".to_string(),
                slot_name: "Morning Peak".to_string(),
                slot_time: "06:00-09:00".to_string(),
                date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
                plant_type: PlantType::Solar,
            },
            generation_left: dec(generation_left),
            demand_left: dec(demand_left),
            matched: Decimal::ZERO,
        }
    }

    #[test]
    fn test_intra_generation_surplus() {
        let alloc = compute_intra(dec(10000), dec(6000)).unwrap();
        assert_eq!(alloc.settled, dec(6000));
        assert_eq!(alloc.generation_after, dec(4000));
        assert_eq!(alloc.demand_after, Decimal::ZERO);
    }

    #[test]
    fn test_intra_demand_surplus() {
        let alloc = compute_intra(dec(2500), dec(9000)).unwrap();
        assert_eq!(alloc.settled, dec(2500));
        assert_eq!(alloc.generation_after, Decimal::ZERO);
        assert_eq!(alloc.demand_after, dec(6500));
    }

    #[test]
    fn test_intra_tie_settles_both_sides() {
        let alloc = compute_intra(dec(5000), dec(5000)).unwrap();
        assert_eq!(alloc.settled, dec(5000));
        assert_eq!(alloc.generation_after, Decimal::ZERO);
        assert_eq!(alloc.demand_after, Decimal::ZERO);
    }

    #[test]
    fn test_negative_input_rejected() {
        let err = compute_intra(Decimal::new(-500, 2), dec(1000)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = compute_inter(dec(1000), Decimal::new(-1, 2)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_inter_matches_intra_algorithm() {
        let a = compute_intra(dec(4000), dec(3000)).unwrap();
        let b = compute_inter(dec(4000), dec(3000)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_group_allocation_simple() {
        // One generator with 40.00 left, one consumer with 30.00 left
        let mut positions = vec![
            position("Acme Solar I", 4000, 0),
            position("Acme Solar II", 0, 3000),
        ];

        let total = allocate_inter_group(&mut positions);

        assert_eq!(total, dec(3000));
        assert_eq!(positions[0].matched, dec(3000));
        assert_eq!(positions[0].generation_left, dec(1000));
        assert_eq!(positions[1].matched, dec(3000));
        assert_eq!(positions[1].demand_left, Decimal::ZERO);
    }

    #[test]
    fn test_group_allocation_splits_across_consumers() {
        let mut positions = vec![
            position("Acme Solar I", 10000, 0),
            position("Acme Solar II", 0, 6000),
            position("Acme Solar III", 0, 7000),
        ];

        let total = allocate_inter_group(&mut positions);

        // min(100.00, 130.00) = 100.00 matched in total
        assert_eq!(total, dec(10000));
        assert_eq!(positions[0].generation_left, Decimal::ZERO);
        assert_eq!(positions[0].matched, dec(10000));
        // Largest consumer served first
        assert_eq!(positions[2].demand_left, Decimal::ZERO);
        assert_eq!(positions[1].demand_left, dec(3000));
    }

    #[test]
    fn test_group_allocation_no_counterparty() {
        let mut positions = vec![
            position("Acme Solar I", 4000, 0),
            position("Acme Solar II", 1000, 0),
        ];

        let total = allocate_inter_group(&mut positions);

        assert_eq!(total, Decimal::ZERO);
        assert_eq!(positions[0].generation_left, dec(4000));
        assert_eq!(positions[1].matched, Decimal::ZERO);
    }

    #[test]
    fn test_group_allocation_deterministic() {
        let build = || {
            vec![
                position("Acme Solar I", 5000, 0),
                position("Acme Solar II", 5000, 0),
                position("Acme Solar III", 0, 7000),
            ]
        };

        let mut first = build();
        let mut second = build();
        allocate_inter_group(&mut first);
        allocate_inter_group(&mut second);

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.matched, b.matched);
            assert_eq!(a.generation_left, b.generation_left);
            assert_eq!(a.demand_left, b.demand_left);
        }
    }
}
