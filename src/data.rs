//! Transaction schema and customer profile tables backed by Polars

use crate::error::SegmentationError;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use ndarray::{Array2, ArrayView1};
use polars::prelude::*;
use std::collections::{BTreeSet, HashSet};

pub const CUSTOMER_ID: &str = "customer_id";
pub const INVOICE_ID: &str = "invoice_id";
pub const INVOICE_DATE: &str = "invoice_date";
pub const ITEM_ID: &str = "item_id";
pub const QUANTITY: &str = "quantity";
pub const AMOUNT: &str = "amount";
pub const CLUSTER: &str = "cluster";

/// Normalized timestamp column (seconds since epoch) carried alongside the input
pub(crate) const INVOICE_TS: &str = "invoice_ts";

/// Columns every transaction dataset must provide
pub const REQUIRED_COLUMNS: [&str; 6] = [CUSTOMER_ID, INVOICE_ID, INVOICE_DATE, ITEM_ID, QUANTITY, AMOUNT];

/// Customer id reserved for anonymous/guest checkouts
pub const ANONYMOUS_CUSTOMER: i64 = 0;

const DATE_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

/// One line item after schema normalization
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub customer_id: i64,
    pub invoice_id: String,
    pub invoice_date: NaiveDateTime,
    pub item_id: String,
    pub quantity: f64,
    pub amount: f64,
}

/// Check that all required columns are present
pub fn validate_schema(df: &DataFrame) -> crate::Result<()> {
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|name| df.get_column_index(name).is_none())
        .collect();

    if !missing.is_empty() {
        return Err(SegmentationError::Schema(format!(
            "missing required columns: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Cast the raw input into canonical column types.
///
/// The result holds `customer_id` (i64), `invoice_id` / `item_id` (string),
/// `invoice_ts` (i64 seconds), `quantity` / `amount` (f64). Unparseable or
/// null values are schema errors.
pub fn normalize_transactions(df: &DataFrame) -> crate::Result<DataFrame> {
    validate_schema(df)?;

    let customer_ids = i64_values(df, CUSTOMER_ID)?;
    let invoice_ids = string_values(df, INVOICE_ID)?;
    let item_ids = string_values(df, ITEM_ID)?;
    let quantities = f64_values(df, QUANTITY)?;
    let amounts = f64_values(df, AMOUNT)?;
    let timestamps: Vec<i64> = timestamp_values(df, INVOICE_DATE)?
        .into_iter()
        .map(|ts| ts.and_utc().timestamp())
        .collect();

    let normalized = DataFrame::new(vec![
        Series::new(CUSTOMER_ID, customer_ids),
        Series::new(INVOICE_ID, invoice_ids),
        Series::new(INVOICE_TS, timestamps),
        Series::new(ITEM_ID, item_ids),
        Series::new(QUANTITY, quantities),
        Series::new(AMOUNT, amounts),
    ])?;
    Ok(normalized)
}

/// Read normalized rows back into typed records
pub(crate) fn collect_transactions(normalized: &DataFrame) -> crate::Result<Vec<Transaction>> {
    let customer_ids = i64_values(normalized, CUSTOMER_ID)?;
    let invoice_ids = string_values(normalized, INVOICE_ID)?;
    let timestamps = i64_values(normalized, INVOICE_TS)?;
    let item_ids = string_values(normalized, ITEM_ID)?;
    let quantities = f64_values(normalized, QUANTITY)?;
    let amounts = f64_values(normalized, AMOUNT)?;

    let mut rows = Vec::with_capacity(customer_ids.len());
    for i in 0..customer_ids.len() {
        let invoice_date = DateTime::from_timestamp(timestamps[i], 0)
            .ok_or_else(|| {
                SegmentationError::Schema(format!("timestamp {} out of range", timestamps[i]))
            })?
            .naive_utc();
        rows.push(Transaction {
            customer_id: customer_ids[i],
            invoice_id: invoice_ids[i].clone(),
            invoice_date,
            item_id: item_ids[i].clone(),
            quantity: quantities[i],
            amount: amounts[i],
        });
    }
    Ok(rows)
}

fn column<'a>(df: &'a DataFrame, name: &str) -> crate::Result<&'a Series> {
    df.column(name)
        .map_err(|_| SegmentationError::Schema(format!("missing column '{}'", name)))
}

fn cast_error(name: &str, dtype: &DataType, target: &str) -> SegmentationError {
    SegmentationError::Schema(format!(
        "column '{}' of type {} cannot be read as {}",
        name, dtype, target
    ))
}

fn null_error(name: &str) -> SegmentationError {
    SegmentationError::Schema(format!("column '{}' contains null values", name))
}

pub(crate) fn i64_values(df: &DataFrame, name: &str) -> crate::Result<Vec<i64>> {
    let series = column(df, name)?;
    let cast = series
        .strict_cast(&DataType::Int64)
        .map_err(|_| cast_error(name, series.dtype(), "integer"))?;
    cast.i64()?
        .into_iter()
        .map(|v| v.ok_or_else(|| null_error(name)))
        .collect()
}

pub(crate) fn f64_values(df: &DataFrame, name: &str) -> crate::Result<Vec<f64>> {
    let series = column(df, name)?;
    let cast = series
        .strict_cast(&DataType::Float64)
        .map_err(|_| cast_error(name, series.dtype(), "number"))?;
    cast.f64()?
        .into_iter()
        .map(|v| v.ok_or_else(|| null_error(name)))
        .collect()
}

fn string_values(df: &DataFrame, name: &str) -> crate::Result<Vec<String>> {
    let series = column(df, name)?;
    let cast = series
        .cast(&DataType::String)
        .map_err(|_| cast_error(name, series.dtype(), "string"))?;
    cast.str()?
        .into_iter()
        .map(|v| v.map(str::to_string).ok_or_else(|| null_error(name)))
        .collect()
}

fn timestamp_values(df: &DataFrame, name: &str) -> crate::Result<Vec<NaiveDateTime>> {
    let series = column(df, name)?;
    match series.dtype() {
        DataType::Datetime(unit, _) => {
            let unit = *unit;
            let raw = series.cast(&DataType::Int64)?;
            raw.i64()?
                .into_iter()
                .map(|v| {
                    let v = v.ok_or_else(|| null_error(name))?;
                    let ts = match unit {
                        TimeUnit::Milliseconds => DateTime::from_timestamp_millis(v),
                        TimeUnit::Microseconds => DateTime::from_timestamp_micros(v),
                        TimeUnit::Nanoseconds => Some(DateTime::from_timestamp_nanos(v)),
                    };
                    ts.map(|t| t.naive_utc())
                        .ok_or_else(|| cast_error(name, series.dtype(), "timestamp"))
                })
                .collect()
        }
        DataType::Date => {
            let raw = series.cast(&DataType::Int32)?;
            raw.i32()?
                .into_iter()
                .map(|v| {
                    let days = v.ok_or_else(|| null_error(name))?;
                    NaiveDate::from_num_days_from_ce_opt(days + 719_163)
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .ok_or_else(|| cast_error(name, series.dtype(), "date"))
                })
                .collect()
        }
        DataType::String => series
            .str()?
            .into_iter()
            .map(|v| {
                let raw = v.ok_or_else(|| null_error(name))?;
                parse_timestamp(raw).ok_or_else(|| {
                    SegmentationError::Schema(format!(
                        "column '{}' has unparseable timestamp '{}'",
                        name, raw
                    ))
                })
            })
            .collect(),
        other => Err(cast_error(name, other, "timestamp")),
    }
}

/// Parse the timestamp layouts commonly found in invoice exports
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    for format in DATE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// One row per customer, numeric feature columns in a dense matrix
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileTable {
    /// Customer ids, unique, one per row
    pub customer_ids: Vec<i64>,
    /// Feature column names, one per matrix column
    pub feature_names: Vec<String>,
    /// Unscaled feature values (n_customers, n_features)
    pub features: Array2<f64>,
}

impl ProfileTable {
    /// Build a table, checking shapes and id uniqueness
    pub fn new(
        customer_ids: Vec<i64>,
        feature_names: Vec<String>,
        features: Array2<f64>,
    ) -> crate::Result<Self> {
        if features.nrows() != customer_ids.len() || features.ncols() != feature_names.len() {
            return Err(SegmentationError::Schema(format!(
                "profile shape {:?} does not match {} ids and {} feature names",
                features.shape(),
                customer_ids.len(),
                feature_names.len()
            )));
        }

        let mut seen = HashSet::with_capacity(customer_ids.len());
        if let Some(dup) = customer_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(SegmentationError::Schema(format!(
                "customer id {} appears more than once in the profile",
                dup
            )));
        }

        let mut names = HashSet::with_capacity(feature_names.len());
        if let Some(dup) = feature_names.iter().find(|n| !names.insert(n.as_str())) {
            return Err(SegmentationError::Schema(format!("duplicate feature column '{}'", dup)));
        }

        Ok(Self {
            customer_ids,
            feature_names,
            features,
        })
    }

    /// Read a profile from a DataFrame: every column except the id and the
    /// cluster label is a numeric feature.
    pub fn from_dataframe(df: &DataFrame) -> crate::Result<Self> {
        let customer_ids = i64_values(df, CUSTOMER_ID)?;
        let feature_names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .filter(|name| *name != CUSTOMER_ID && *name != CLUSTER)
            .map(str::to_string)
            .collect();

        let mut features = Array2::zeros((customer_ids.len(), feature_names.len()));
        for (j, name) in feature_names.iter().enumerate() {
            for (i, value) in f64_values(df, name)?.into_iter().enumerate() {
                features[[i, j]] = value;
            }
        }

        Self::new(customer_ids, feature_names, features)
    }

    pub fn n_customers(&self) -> usize {
        self.customer_ids.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    /// Values of one feature column
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.feature_names
            .iter()
            .position(|n| n == name)
            .map(|j| self.features.column(j))
    }

    /// Value of a feature for one customer
    pub fn value(&self, customer_id: i64, feature: &str) -> Option<f64> {
        let row = self.customer_ids.iter().position(|&id| id == customer_id)?;
        let col = self.feature_names.iter().position(|n| n == feature)?;
        Some(self.features[[row, col]])
    }

    pub fn to_dataframe(&self) -> crate::Result<DataFrame> {
        let mut columns = Vec::with_capacity(self.n_features() + 1);
        columns.push(Series::new(CUSTOMER_ID, self.customer_ids.clone()));
        for (j, name) in self.feature_names.iter().enumerate() {
            columns.push(Series::new(name, self.features.column(j).to_vec()));
        }
        Ok(DataFrame::new(columns)?)
    }
}

/// Customer profile with a cluster label per row
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledProfile {
    pub profile: ProfileTable,
    pub clusters: Vec<usize>,
}

impl LabeledProfile {
    pub fn new(profile: ProfileTable, clusters: Vec<usize>) -> crate::Result<Self> {
        if clusters.len() != profile.n_customers() {
            return Err(SegmentationError::Schema(format!(
                "{} cluster labels for {} customers",
                clusters.len(),
                profile.n_customers()
            )));
        }
        Ok(Self { profile, clusters })
    }

    /// Read a labeled profile from a DataFrame with a `cluster` column
    pub fn from_dataframe(df: &DataFrame) -> crate::Result<Self> {
        let profile = ProfileTable::from_dataframe(df)?;
        let clusters = i64_values(df, CLUSTER)?
            .into_iter()
            .map(|c| {
                usize::try_from(c).map_err(|_| {
                    SegmentationError::Schema(format!("negative cluster label {}", c))
                })
            })
            .collect::<crate::Result<Vec<usize>>>()?;
        Self::new(profile, clusters)
    }

    /// Distinct cluster labels in ascending order
    pub fn distinct_clusters(&self) -> Vec<usize> {
        self.clusters
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Customers per cluster, indexed by label
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let n = self.clusters.iter().max().map_or(0, |m| m + 1);
        let mut sizes = vec![0; n];
        for &label in &self.clusters {
            sizes[label] += 1;
        }
        sizes
    }

    pub fn to_dataframe(&self) -> crate::Result<DataFrame> {
        let mut df = self.profile.to_dataframe()?;
        let labels: Vec<u32> = self.clusters.iter().map(|&c| c as u32).collect();
        df.with_column(Series::new(CLUSTER, labels))?;
        Ok(df)
    }
}
