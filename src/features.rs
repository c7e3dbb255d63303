//! RFM profile and behavioral enrichment per customer
//!
//! Flat aggregations (frequency, monetary, per-basket means) run as Polars
//! lazy group-bys. Order-dependent features (recency, purchase intervals,
//! monthly activity) walk the deduplicated invoice ledger.

use crate::data::{
    collect_transactions, f64_values, i64_values, normalize_transactions, ProfileTable,
    Transaction, AMOUNT, ANONYMOUS_CUSTOMER, CUSTOMER_ID, INVOICE_ID, ITEM_ID, QUANTITY,
};
use crate::error::SegmentationError;
use chrono::{Datelike, NaiveDateTime};
use ndarray::Array2;
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Profile columns in output order
pub const PROFILE_FEATURES: [&str; 10] = [
    "recency",
    "frequency",
    "monetary",
    "is_first_time_buyer",
    "mean_time_interval",
    "mean_ticket_size",
    "mean_quantity",
    "mean_unique_item",
    "freq_per_month",
    "mean_spent_per_month",
];

/// Derives one profile row per customer from line-item transactions
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEngineer;

/// Deduplicated invoices grouped per customer, ordered by time.
///
/// Built once per call to [`FeatureEngineer::build_profile`] and handed to
/// the derivations that need it.
#[derive(Debug, Clone)]
pub struct InvoiceLedger {
    /// Invoice timestamps per customer, ascending
    pub invoices: BTreeMap<i64, Vec<NaiveDateTime>>,
    /// Latest invoice timestamp over the whole run
    pub calculation_date: NaiveDateTime,
}

impl InvoiceLedger {
    /// Keep the first row seen for each invoice id
    pub fn from_transactions(rows: &[Transaction]) -> Option<Self> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut per_customer: BTreeMap<i64, Vec<(NaiveDateTime, &str)>> = BTreeMap::new();

        for row in rows {
            if seen.insert(row.invoice_id.as_str()) {
                per_customer
                    .entry(row.customer_id)
                    .or_default()
                    .push((row.invoice_date, row.invoice_id.as_str()));
            }
        }

        let calculation_date = per_customer
            .values()
            .flat_map(|v| v.iter().map(|(ts, _)| *ts))
            .max()?;

        let invoices = per_customer
            .into_iter()
            .map(|(customer, mut list)| {
                list.sort();
                (customer, list.into_iter().map(|(ts, _)| ts).collect())
            })
            .collect();

        Some(Self {
            invoices,
            calculation_date,
        })
    }
}

/// Recency outcome for one customer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recency {
    pub days: f64,
    pub first_time_buyer: bool,
}

/// Whole days between two timestamps, floored
fn day_gap(earlier: NaiveDateTime, later: NaiveDateTime) -> f64 {
    (later - earlier).num_seconds().div_euclid(86_400) as f64
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn consecutive_gaps(invoices: &[NaiveDateTime]) -> Vec<f64> {
    invoices.windows(2).map(|w| day_gap(w[0], w[1])).collect()
}

impl FeatureEngineer {
    pub fn new() -> Self {
        Self
    }

    /// Build the enriched customer profile.
    ///
    /// Anonymous rows (customer id 0) are dropped first; an empty remainder
    /// is an [`SegmentationError::EmptyDataset`].
    pub fn build_profile(&self, df: &DataFrame) -> crate::Result<ProfileTable> {
        let normalized = normalize_transactions(df)?;
        let total_rows = normalized.height();

        let filtered = normalized
            .lazy()
            .filter(col(CUSTOMER_ID).neq(lit(ANONYMOUS_CUSTOMER)))
            .collect()?;

        info!(
            "Dropped {} anonymous rows, {} rows remain",
            total_rows - filtered.height(),
            filtered.height()
        );

        if filtered.height() == 0 {
            return Err(SegmentationError::EmptyDataset(
                "no transactions left after removing anonymous customers".to_string(),
            ));
        }

        let rows = collect_transactions(&filtered)?;
        let ledger = InvoiceLedger::from_transactions(&rows).ok_or_else(|| {
            SegmentationError::EmptyDataset("no invoices after deduplication".to_string())
        })?;

        let recency = self.get_recency(&ledger);
        let (frequency, monetary) = self.get_frequency_monetary(&filtered)?;
        let intervals = self.mean_time_interval(&ledger, &recency);
        let baskets = self.mean_per_purchase(&filtered)?;
        let monthly = self.per_month(&rows);

        // Inner join on customer id across every derived table
        let customers: Vec<i64> = recency
            .keys()
            .copied()
            .filter(|c| {
                frequency.contains_key(c)
                    && monetary.contains_key(c)
                    && intervals.contains_key(c)
                    && baskets.contains_key(c)
                    && monthly.contains_key(c)
            })
            .collect();

        if customers.is_empty() {
            return Err(SegmentationError::EmptyDataset(
                "no customer present in every RFM table".to_string(),
            ));
        }

        let mut features = Array2::zeros((customers.len(), PROFILE_FEATURES.len()));
        for (i, customer) in customers.iter().enumerate() {
            let r = recency[customer];
            let [ticket, quantity, unique_items] = baskets[customer];
            let [freq_month, spent_month] = monthly[customer];
            let row = [
                r.days,
                frequency[customer],
                monetary[customer],
                if r.first_time_buyer { 1.0 } else { 0.0 },
                intervals[customer],
                ticket,
                quantity,
                unique_items,
                freq_month,
                spent_month,
            ];
            for (j, value) in row.into_iter().enumerate() {
                features[[i, j]] = value;
            }
        }

        debug!("Profile built with {} customers", customers.len());

        ProfileTable::new(
            customers,
            PROFILE_FEATURES.iter().map(|s| s.to_string()).collect(),
            features,
        )
    }

    /// Gap between the two latest invoices, or days to the run's last
    /// invoice for single-invoice customers.
    pub fn get_recency(&self, ledger: &InvoiceLedger) -> BTreeMap<i64, Recency> {
        ledger
            .invoices
            .iter()
            .map(|(&customer, invoices)| {
                let recency = match consecutive_gaps(invoices).last() {
                    Some(&days) => Recency {
                        days,
                        first_time_buyer: false,
                    },
                    None => Recency {
                        days: day_gap(invoices[0], ledger.calculation_date),
                        first_time_buyer: true,
                    },
                };
                (customer, recency)
            })
            .collect()
    }

    /// Distinct invoices and total spend per customer
    pub fn get_frequency_monetary(
        &self,
        filtered: &DataFrame,
    ) -> crate::Result<(BTreeMap<i64, f64>, BTreeMap<i64, f64>)> {
        let rfm = filtered
            .clone()
            .lazy()
            .group_by([col(CUSTOMER_ID)])
            .agg([
                col(INVOICE_ID).n_unique().cast(DataType::Float64).alias("frequency"),
                col(AMOUNT).sum().alias("monetary"),
            ])
            .collect()?;

        let customers = i64_values(&rfm, CUSTOMER_ID)?;
        let frequency = f64_values(&rfm, "frequency")?;
        let monetary = f64_values(&rfm, "monetary")?;

        Ok((
            customers.iter().copied().zip(frequency).collect(),
            customers.into_iter().zip(monetary).collect(),
        ))
    }

    /// Mean of all consecutive invoice gaps; first-time buyers use recency
    pub fn mean_time_interval(
        &self,
        ledger: &InvoiceLedger,
        recency: &BTreeMap<i64, Recency>,
    ) -> BTreeMap<i64, f64> {
        ledger
            .invoices
            .iter()
            .filter_map(|(&customer, invoices)| {
                let gaps = consecutive_gaps(invoices);
                let value = if gaps.is_empty() {
                    recency.get(&customer)?.days
                } else {
                    gaps.iter().sum::<f64>() / gaps.len() as f64
                };
                Some((customer, round_to(value, 2)))
            })
            .collect()
    }

    /// Per-invoice totals (spend, quantity, distinct items) averaged per customer
    pub fn mean_per_purchase(&self, filtered: &DataFrame) -> crate::Result<BTreeMap<i64, [f64; 3]>> {
        let baskets = filtered
            .clone()
            .lazy()
            .group_by([col(CUSTOMER_ID), col(INVOICE_ID)])
            .agg([
                col(AMOUNT).sum().alias("ticket"),
                col(QUANTITY).sum().alias("items"),
                col(ITEM_ID).n_unique().cast(DataType::Float64).alias("unique_items"),
            ])
            .group_by([col(CUSTOMER_ID)])
            .agg([
                col("ticket").mean().alias("mean_ticket_size"),
                col("items").mean().alias("mean_quantity"),
                col("unique_items").mean().alias("mean_unique_item"),
            ])
            .collect()?;

        let customers = i64_values(&baskets, CUSTOMER_ID)?;
        let ticket = f64_values(&baskets, "mean_ticket_size")?;
        let quantity = f64_values(&baskets, "mean_quantity")?;
        let unique_items = f64_values(&baskets, "mean_unique_item")?;

        Ok(customers
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                (
                    c,
                    [
                        round_to(ticket[i], 2),
                        round_to(quantity[i], 2),
                        round_to(unique_items[i], 2),
                    ],
                )
            })
            .collect())
    }

    /// Distinct invoices and spend per active calendar month, averaged
    pub fn per_month(&self, rows: &[Transaction]) -> BTreeMap<i64, [f64; 2]> {
        let mut months: HashMap<(i64, i32, u32), (HashSet<&str>, f64)> = HashMap::new();
        for row in rows {
            let key = (row.customer_id, row.invoice_date.year(), row.invoice_date.month());
            let entry = months.entry(key).or_default();
            entry.0.insert(row.invoice_id.as_str());
            entry.1 += row.amount;
        }

        let mut per_customer: BTreeMap<i64, (f64, f64, usize)> = BTreeMap::new();
        for ((customer, _, _), (invoices, spent)) in months {
            let acc = per_customer.entry(customer).or_insert((0.0, 0.0, 0));
            acc.0 += invoices.len() as f64;
            acc.1 += spent;
            acc.2 += 1;
        }

        per_customer
            .into_iter()
            .map(|(customer, (invoices, spent, active))| {
                let n = active as f64;
                (customer, [round_to(invoices / n, 2), round_to(spent / n, 2)])
            })
            .collect()
    }
}
