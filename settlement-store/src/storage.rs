//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `records` - Settlement records (key: record_id)
//! - `keys` - Unique index (key: identity tuple, value: record_id)
//! - `scope` - Scope index for date/client scans (key: date || client || record_id)
//!
//! Every stage transition is a single atomic `WriteBatch`, so readers never
//! observe a record that violates the at-rest invariants. Stage transitions
//! for one key are serialized by a per-key mutex held for the duration of a
//! single transition only.

use crate::{
    config::Config,
    error::{Error, Result},
    types::{BaselineAmounts, DateRange, RecordId, SettlementKey, SettlementRecord, StageAmounts},
};
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_RECORDS: &str = "records";
const CF_KEYS: &str = "keys";
const CF_SCOPE: &str = "scope";

/// Field separator inside index keys
const SEP: u8 = 0x1f;

/// Durable keyed store for banking settlement records
pub struct SettlementStore {
    db: Arc<DB>,

    /// Per-key mutexes serializing stage transitions
    locks: DashMap<Vec<u8>, Arc<Mutex<()>>>,
}

impl SettlementStore {
    /// Open or create the store
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Settlement runs are write-heavy bursts once per batch
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_RECORDS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_KEYS, Self::cf_options_keys()),
            ColumnFamilyDescriptor::new(CF_SCOPE, Self::cf_options_scope()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = %path.display(), "Opened settlement store");

        Ok(Self {
            db: Arc::new(db),
            locks: DashMap::new(),
        })
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_keys() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Point lookups on the unique index benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_scope() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn key_lock(&self, tuple: &[u8]) -> Arc<Mutex<()>> {
        self.locks
            .entry(tuple.to_vec())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Index key helpers

    fn scope_index_key(date: NaiveDate, client_name: &str, record_id: RecordId) -> Vec<u8> {
        let mut key = date.format("%Y-%m-%d").to_string().into_bytes();
        key.push(SEP);
        key.extend_from_slice(client_name.as_bytes());
        key.push(SEP);
        key.extend_from_slice(record_id.as_bytes());
        key
    }

    fn parse_scope_key(key: &[u8]) -> Option<(NaiveDate, &str, Uuid)> {
        if key.len() < 28 || key[10] != SEP || key[key.len() - 17] != SEP {
            return None;
        }
        let date = std::str::from_utf8(&key[..10])
            .ok()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())?;
        let client = std::str::from_utf8(&key[11..key.len() - 17]).ok()?;
        let id_bytes: [u8; 16] = key[key.len() - 16..].try_into().ok()?;
        Some((date, client, Uuid::from_bytes(id_bytes)))
    }

    // Amount validation

    fn validate_amount(field: &str, value: Decimal) -> Result<()> {
        if value < Decimal::ZERO {
            return Err(Error::Validation(format!(
                "{} must be non-negative, got {}",
                field, value
            )));
        }
        if value.scale() > 2 {
            return Err(Error::Validation(format!(
                "{} must have at most 2 decimal places, got {}",
                field, value
            )));
        }
        Ok(())
    }

    fn validate_baseline(baseline: &BaselineAmounts) -> Result<()> {
        Self::validate_amount("surplus_generation_sum", baseline.surplus_generation_sum)?;
        Self::validate_amount("surplus_demand_sum", baseline.surplus_demand_sum)?;
        Self::validate_amount("matched_settled_sum", baseline.matched_settled_sum)?;
        Ok(())
    }

    fn validate_stage(after: &StageAmounts) -> Result<()> {
        Self::validate_amount("generation", after.generation)?;
        Self::validate_amount("demand", after.demand)?;
        Ok(())
    }

    // Record plumbing

    fn load_by_tuple(&self, tuple: &[u8]) -> Result<Option<SettlementRecord>> {
        let cf_keys = self.cf_handle(CF_KEYS)?;
        let record_id = match self.db.get_cf(&cf_keys, tuple)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let cf_records = self.cf_handle(CF_RECORDS)?;
        let value = self
            .db
            .get_cf(&cf_records, &record_id)?
            .ok_or_else(|| Error::Storage("Key index points at missing record".to_string()))?;
        let record: SettlementRecord = bincode::deserialize(&value)?;
        Ok(Some(record))
    }

    fn put_record(&self, record: &SettlementRecord) -> Result<()> {
        let cf_records = self.cf_handle(CF_RECORDS)?;
        let value = bincode::serialize(record)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_records, record.record_id.as_bytes(), &value);
        self.db.write(batch)?;
        Ok(())
    }

    // Store contract

    /// Create a Stage-1 record for the key
    ///
    /// Fails with [`Error::DuplicateKey`] if a record for the unique tuple
    /// already exists, or [`Error::Validation`] if a baseline amount is
    /// negative or carries more than 2 decimal places.
    pub fn create(&self, key: &SettlementKey, baseline: &BaselineAmounts) -> Result<RecordId> {
        Self::validate_baseline(baseline)?;

        let tuple = key.unique_tuple_bytes();
        let lock = self.key_lock(&tuple);
        let _guard = lock.lock();

        let cf_keys = self.cf_handle(CF_KEYS)?;
        if self.db.get_cf(&cf_keys, &tuple)?.is_some() {
            return Err(Error::DuplicateKey(key.to_string()));
        }

        let record_id = Uuid::now_v7();
        let now = Utc::now();
        let record = SettlementRecord {
            record_id,
            key: key.clone(),
            surplus_demand_sum: baseline.surplus_demand_sum,
            surplus_generation_sum: baseline.surplus_generation_sum,
            matched_settled_sum: baseline.matched_settled_sum,
            surplus_generation_sum_after_intra: Decimal::ZERO,
            surplus_demand_sum_after_intra: Decimal::ZERO,
            intra_settlement: Decimal::ZERO,
            surplus_generation_sum_after_inter: Decimal::ZERO,
            surplus_demand_sum_after_inter: Decimal::ZERO,
            inter_settlement: Decimal::ZERO,
            has_intra: false,
            has_inter: false,
            created_at: now,
            updated_at: now,
        };

        let cf_records = self.cf_handle(CF_RECORDS)?;
        let cf_scope = self.cf_handle(CF_SCOPE)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_records, record_id.as_bytes(), &bincode::serialize(&record)?);
        batch.put_cf(&cf_keys, &tuple, record_id.as_bytes());
        batch.put_cf(
            &cf_scope,
            &Self::scope_index_key(key.date, &key.client_name, record_id),
            b"",
        );
        self.db.write(batch)?;

        tracing::debug!(%record_id, key = %key, "Settlement record created");

        Ok(record_id)
    }

    /// Apply the intra settlement outcome to a Stage-1 record
    ///
    /// Re-applying identical values is an idempotent no-op. Differing values
    /// fail with [`Error::StageOrder`] unless `force` is set, in which case
    /// the intra fields are overwritten and the inter stage is cleared so
    /// downstream amounts are re-derived.
    pub fn apply_intra(
        &self,
        key: &SettlementKey,
        after: &StageAmounts,
        amount: Decimal,
        force: bool,
    ) -> Result<()> {
        Self::validate_amount("intra_settlement", amount)?;
        Self::validate_stage(after)?;

        let tuple = key.unique_tuple_bytes();
        let lock = self.key_lock(&tuple);
        let _guard = lock.lock();

        let mut record = self
            .load_by_tuple(&tuple)?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        if record.has_intra && !force {
            if record.surplus_generation_sum_after_intra == after.generation
                && record.surplus_demand_sum_after_intra == after.demand
                && record.intra_settlement == amount
            {
                return Ok(());
            }
            return Err(Error::StageOrder(format!(
                "intra settlement already applied for {} with different values",
                key
            )));
        }

        // Invariant: after = baseline - amount on both sides
        if record.surplus_generation_sum - amount != after.generation
            || record.surplus_demand_sum - amount != after.demand
        {
            return Err(Error::Validation(format!(
                "intra identity violated for {}: baseline ({}, {}) - {} != ({}, {})",
                key,
                record.surplus_generation_sum,
                record.surplus_demand_sum,
                amount,
                after.generation,
                after.demand
            )));
        }

        record.surplus_generation_sum_after_intra = after.generation;
        record.surplus_demand_sum_after_intra = after.demand;
        record.intra_settlement = amount;
        record.has_intra = true;
        if record.has_inter {
            // Forced rewrite invalidates the inter stage
            record.surplus_generation_sum_after_inter = Decimal::ZERO;
            record.surplus_demand_sum_after_inter = Decimal::ZERO;
            record.inter_settlement = Decimal::ZERO;
            record.has_inter = false;
        }
        record.updated_at = Utc::now();

        self.put_record(&record)?;

        tracing::debug!(key = %key, %amount, "Intra settlement applied");

        Ok(())
    }

    /// Apply the inter settlement outcome to a Stage-2 record
    ///
    /// Gated on the intra stage having completed. After the intra pass at
    /// most one side of a record is non-zero, so the settled amount debits
    /// exactly the surplus side: both sides may only decrease, and the two
    /// decreases must sum to `amount`.
    pub fn apply_inter(
        &self,
        key: &SettlementKey,
        after: &StageAmounts,
        amount: Decimal,
        force: bool,
    ) -> Result<()> {
        Self::validate_amount("inter_settlement", amount)?;
        Self::validate_stage(after)?;

        let tuple = key.unique_tuple_bytes();
        let lock = self.key_lock(&tuple);
        let _guard = lock.lock();

        let mut record = self
            .load_by_tuple(&tuple)?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        if !record.has_intra {
            return Err(Error::StageOrder(format!(
                "inter settlement attempted before intra for {}",
                key
            )));
        }

        if record.has_inter && !force {
            if record.surplus_generation_sum_after_inter == after.generation
                && record.surplus_demand_sum_after_inter == after.demand
                && record.inter_settlement == amount
            {
                return Ok(());
            }
            return Err(Error::StageOrder(format!(
                "inter settlement already applied for {} with different values",
                key
            )));
        }

        let delta_gen = record.surplus_generation_sum_after_intra - after.generation;
        let delta_dem = record.surplus_demand_sum_after_intra - after.demand;
        if delta_gen < Decimal::ZERO || delta_dem < Decimal::ZERO {
            return Err(Error::Validation(format!(
                "inter settlement must not increase surplus for {}",
                key
            )));
        }
        if delta_gen + delta_dem != amount {
            return Err(Error::Validation(format!(
                "inter identity violated for {}: debits ({}, {}) do not sum to {}",
                key, delta_gen, delta_dem, amount
            )));
        }

        record.surplus_generation_sum_after_inter = after.generation;
        record.surplus_demand_sum_after_inter = after.demand;
        record.inter_settlement = amount;
        record.has_inter = true;
        record.updated_at = Utc::now();

        self.put_record(&record)?;

        tracing::debug!(key = %key, %amount, "Inter settlement applied");

        Ok(())
    }

    /// Rewrite the Stage-1 baseline of an existing record and clear both
    /// stage markers (recompute entry point)
    pub fn reset_baseline(&self, key: &SettlementKey, baseline: &BaselineAmounts) -> Result<()> {
        Self::validate_baseline(baseline)?;

        let tuple = key.unique_tuple_bytes();
        let lock = self.key_lock(&tuple);
        let _guard = lock.lock();

        let mut record = self
            .load_by_tuple(&tuple)?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        record.surplus_generation_sum = baseline.surplus_generation_sum;
        record.surplus_demand_sum = baseline.surplus_demand_sum;
        record.matched_settled_sum = baseline.matched_settled_sum;
        record.surplus_generation_sum_after_intra = Decimal::ZERO;
        record.surplus_demand_sum_after_intra = Decimal::ZERO;
        record.intra_settlement = Decimal::ZERO;
        record.surplus_generation_sum_after_inter = Decimal::ZERO;
        record.surplus_demand_sum_after_inter = Decimal::ZERO;
        record.inter_settlement = Decimal::ZERO;
        record.has_intra = false;
        record.has_inter = false;
        record.updated_at = Utc::now();

        self.put_record(&record)?;

        tracing::debug!(key = %key, "Baseline reset for recompute");

        Ok(())
    }

    /// Get the record for a key, if any
    pub fn get(&self, key: &SettlementKey) -> Result<Option<SettlementRecord>> {
        self.load_by_tuple(&key.unique_tuple_bytes())
    }

    /// Lazily scan records by date range and client
    ///
    /// Both filters are optional; with neither, the whole store is scanned in
    /// scope-index order. Read-only.
    pub fn query<'a>(
        &'a self,
        range: Option<DateRange>,
        client: Option<&str>,
    ) -> Result<impl Iterator<Item = Result<SettlementRecord>> + 'a> {
        let cf_scope = self.cf_handle(CF_SCOPE)?;

        let scope_iter = match range {
            Some(r) => {
                let start = r.start.format("%Y-%m-%d").to_string().into_bytes();
                self.db
                    .iterator_cf(&cf_scope, IteratorMode::From(&start, Direction::Forward))
            }
            None => self.db.iterator_cf(&cf_scope, IteratorMode::Start),
        };

        let end = range.map(|r| r.end);
        let client = client.map(|s| s.to_string());
        let db = self.db.clone();

        let iter = scope_iter
            .map(|item| item.map_err(Error::from))
            .take_while(move |item| match item {
                Ok((key, _)) => match Self::parse_scope_key(key) {
                    Some((date, _, _)) => end.map_or(true, |e| date <= e),
                    None => false,
                },
                // Surface iterator errors instead of stopping silently
                Err(_) => true,
            })
            .filter_map(move |item| {
                let (key, _) = match item {
                    Ok(kv) => kv,
                    Err(e) => return Some(Err(e)),
                };
                let (_, record_client, record_id) = Self::parse_scope_key(&key)?;
                if let Some(ref wanted) = client {
                    if record_client != wanted.as_str() {
                        return None;
                    }
                }
                let cf = match db.cf_handle(CF_RECORDS) {
                    Some(cf) => cf,
                    None => {
                        return Some(Err(Error::Storage(
                            "Column family records not found".to_string(),
                        )))
                    }
                };
                match db.get_cf(&cf, record_id.as_bytes()) {
                    Ok(Some(value)) => Some(bincode::deserialize(&value).map_err(Error::from)),
                    Ok(None) => Some(Err(Error::Storage(
                        "Scope index points at missing record".to_string(),
                    ))),
                    Err(e) => Some(Err(e.into())),
                }
            });

        Ok(iter)
    }

    /// Read-consistent snapshot of a scope, for validation passes
    ///
    /// All records are read from a single RocksDB snapshot so cross-record
    /// checks see one point in time even while settlement runs continue.
    pub fn snapshot_scope(
        &self,
        range: Option<DateRange>,
        client: Option<&str>,
    ) -> Result<Vec<SettlementRecord>> {
        let snapshot = self.db.snapshot();
        let cf_scope = self.cf_handle(CF_SCOPE)?;
        let cf_records = self.cf_handle(CF_RECORDS)?;

        let iter = match range {
            Some(r) => {
                let start = r.start.format("%Y-%m-%d").to_string().into_bytes();
                snapshot.iterator_cf(&cf_scope, IteratorMode::From(&start, Direction::Forward))
            }
            None => snapshot.iterator_cf(&cf_scope, IteratorMode::Start),
        };

        let end = range.map(|r| r.end);
        let mut records = Vec::new();

        for item in iter {
            let (key, _) = item?;
            let (date, record_client, record_id) = match Self::parse_scope_key(&key) {
                Some(parsed) => parsed,
                None => continue,
            };
            if let Some(e) = end {
                if date > e {
                    break;
                }
            }
            if let Some(wanted) = client {
                if record_client != wanted {
                    continue;
                }
            }
            let value = snapshot
                .get_cf(&cf_records, record_id.as_bytes())?
                .ok_or_else(|| Error::Storage("Scope index points at missing record".to_string()))?;
            records.push(bincode::deserialize(&value)?);
        }

        Ok(records)
    }

    /// Approximate number of stored records
    pub fn record_count(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_RECORDS)?;
        let count = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(count)
    }
}
