//! Property-based tests for settlement invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Intra allocation: `settled = min(g, d)`, leftovers non-negative
//! - Group allocation: total matched = min(Σ generation, Σ demand)
//! - Pipeline conservation: baseline − final = intra + inter debit, per side
//! - Idempotency: re-applying identical stage values changes nothing

use banking_engine::allocation::{allocate_inter_group, compute_intra, InterPosition};
use banking_engine::validator::ConservationValidator;
use chrono::NaiveDate;
use proptest::prelude::*;
use rust_decimal::Decimal;
use settlement_store::{
    BaselineAmounts, DateRange, PlantType, SettlementKey, SettlementStore, StageAmounts,
};

/// Strategy for valid amounts (non-negative, 2 decimal places)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (0u64..1_000_000_00u64).prop_map(|cents| Decimal::new(cents as i64, 2))
}

fn test_key(index: usize) -> SettlementKey {
    SettlementKey {
        client_name: "Acme Textiles".to_string(),
        plant_name: format!("Acme Solar {}", index + 1),
        cons_unit: format!("HT-{:03}", index + 1),
        slot_name: "Morning Peak".to_string(),
        slot_time: "06:00-09:00".to_string(),
        date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        plant_type: PlantType::Solar,
    }
}

fn open_store(dir: &tempfile::TempDir) -> SettlementStore {
    let mut config = settlement_store::Config::default();
    config.data_dir = dir.path().to_path_buf();
    SettlementStore::open(&config).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: intra allocation is the min rule with exact leftovers
    #[test]
    fn prop_intra_min_rule(g in amount_strategy(), d in amount_strategy()) {
        let alloc = compute_intra(g, d).unwrap();

        prop_assert_eq!(alloc.settled, g.min(d));
        prop_assert_eq!(alloc.generation_after, g - alloc.settled);
        prop_assert_eq!(alloc.demand_after, d - alloc.settled);
        prop_assert!(alloc.generation_after >= Decimal::ZERO);
        prop_assert!(alloc.demand_after >= Decimal::ZERO);

        // At least one side fully settles; both when inputs tie
        if g == d {
            prop_assert_eq!(alloc.generation_after, Decimal::ZERO);
            prop_assert_eq!(alloc.demand_after, Decimal::ZERO);
        } else {
            prop_assert!(
                alloc.generation_after == Decimal::ZERO || alloc.demand_after == Decimal::ZERO
            );
        }
    }

    /// Property: intra allocation is deterministic
    #[test]
    fn prop_intra_deterministic(g in amount_strategy(), d in amount_strategy()) {
        prop_assert_eq!(compute_intra(g, d).unwrap(), compute_intra(g, d).unwrap());
    }

    /// Property: group matching settles exactly min(Σ generation, Σ demand)
    /// and never leaves a negative position
    #[test]
    fn prop_group_allocation_conserves(pairs in prop::collection::vec(
        (amount_strategy(), amount_strategy()), 1..6)
    ) {
        // One-sided positions, as the intra pass leaves them
        let mut positions: Vec<InterPosition> = pairs
            .iter()
            .enumerate()
            .map(|(i, (g, d))| {
                let alloc = compute_intra(*g, *d).unwrap();
                InterPosition {
                    key: test_key(i),
                    generation_left: alloc.generation_after,
                    demand_left: alloc.demand_after,
                    matched: Decimal::ZERO,
                }
            })
            .collect();

        let total_gen: Decimal = positions.iter().map(|p| p.generation_left).sum();
        let total_dem: Decimal = positions.iter().map(|p| p.demand_left).sum();

        let matched = allocate_inter_group(&mut positions);

        prop_assert_eq!(matched, total_gen.min(total_dem));
        for position in &positions {
            prop_assert!(position.generation_left >= Decimal::ZERO);
            prop_assert!(position.demand_left >= Decimal::ZERO);
            prop_assert!(position.matched >= Decimal::ZERO);
        }

        let left_gen: Decimal = positions.iter().map(|p| p.generation_left).sum();
        let left_dem: Decimal = positions.iter().map(|p| p.demand_left).sum();
        prop_assert_eq!(left_gen, total_gen - matched);
        prop_assert_eq!(left_dem, total_dem - matched);
    }

    /// Property: the full Stage 1 → 2 → 3 pipeline conserves energy per key
    /// and per side, and the audit pass is clean
    #[test]
    fn prop_pipeline_conservation(pairs in prop::collection::vec(
        (amount_strategy(), amount_strategy()), 1..5)
    ) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let keys: Vec<SettlementKey> = (0..pairs.len()).map(test_key).collect();

        // Stage 1 + 2
        for (key, (g, d)) in keys.iter().zip(pairs.iter()) {
            store
                .create(key, &BaselineAmounts {
                    surplus_generation_sum: *g,
                    surplus_demand_sum: *d,
                    matched_settled_sum: Decimal::ZERO,
                })
                .unwrap();
            let alloc = compute_intra(*g, *d).unwrap();
            store
                .apply_intra(
                    key,
                    &StageAmounts {
                        generation: alloc.generation_after,
                        demand: alloc.demand_after,
                    },
                    alloc.settled,
                    false,
                )
                .unwrap();
        }

        // Stage 3 over the single eligibility group
        let mut positions: Vec<InterPosition> = keys
            .iter()
            .map(|key| InterPosition::from_record(&store.get(key).unwrap().unwrap()))
            .collect();
        allocate_inter_group(&mut positions);
        for position in positions {
            let after = StageAmounts {
                generation: position.generation_left,
                demand: position.demand_left,
            };
            store
                .apply_inter(&position.key, &after, position.matched, false)
                .unwrap();
        }

        // Per-key, per-side conservation
        for key in &keys {
            let record = store.get(key).unwrap().unwrap();
            let gen_inter_debit = record.surplus_generation_sum_after_intra
                - record.surplus_generation_sum_after_inter;
            let dem_inter_debit = record.surplus_demand_sum_after_intra
                - record.surplus_demand_sum_after_inter;

            prop_assert_eq!(
                record.surplus_generation_sum - record.surplus_generation_sum_after_inter,
                record.intra_settlement + gen_inter_debit
            );
            prop_assert_eq!(
                record.surplus_demand_sum - record.surplus_demand_sum_after_inter,
                record.intra_settlement + dem_inter_debit
            );
            prop_assert_eq!(record.inter_settlement, gen_inter_debit + dem_inter_debit);

            // Monotonic decrease on both sides
            prop_assert!(
                record.surplus_generation_sum_after_inter
                    <= record.surplus_generation_sum_after_intra
            );
            prop_assert!(
                record.surplus_generation_sum_after_intra <= record.surplus_generation_sum
            );
            prop_assert!(
                record.surplus_demand_sum_after_inter <= record.surplus_demand_sum_after_intra
            );
            prop_assert!(record.surplus_demand_sum_after_intra <= record.surplus_demand_sum);
        }

        // The audit pass agrees
        let range = DateRange::single(keys[0].date);
        let report = ConservationValidator::new()
            .check_scope(&store, Some(range), None)
            .unwrap();
        prop_assert!(report.is_clean());
    }

    /// Property: re-applying identical intra values is a no-op
    #[test]
    fn prop_apply_intra_idempotent(g in amount_strategy(), d in amount_strategy()) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let key = test_key(0);

        store
            .create(&key, &BaselineAmounts {
                surplus_generation_sum: g,
                surplus_demand_sum: d,
                matched_settled_sum: Decimal::ZERO,
            })
            .unwrap();

        let alloc = compute_intra(g, d).unwrap();
        let after = StageAmounts {
            generation: alloc.generation_after,
            demand: alloc.demand_after,
        };
        store.apply_intra(&key, &after, alloc.settled, false).unwrap();
        let first = store.get(&key).unwrap().unwrap();

        store.apply_intra(&key, &after, alloc.settled, false).unwrap();
        let second = store.get(&key).unwrap().unwrap();

        prop_assert_eq!(first.updated_at, second.updated_at);
        prop_assert_eq!(first.intra_settlement, second.intra_settlement);
    }
}
