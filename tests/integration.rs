//! Integration tests for SegmentForge

use chrono::{Duration, NaiveDate};
use ndarray::Array2;
use polars::prelude::*;
use segmentforge::io::{INTERPRETER_MODEL, IMPORTANCE_TABLE, PROFILE_TABLE, SCALER_MODEL, SEGMENTER_MODEL};
use segmentforge::{
    find_best_elbow, report, Backend, FeatureEngineer, InterpreterConfig, Interpreter,
    LabeledProfile, LocalStore, MemoryStore, OutputSink, ParamGrid, Pipeline, PipelineConfig,
    PipelineOutput, ProfileTable, SegmentationError, Segmenter, SegmenterConfig,
    TransactionSource,
};
use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use tempfile::TempDir;

struct Line {
    customer_id: i64,
    invoice_id: String,
    day: i64,
    hour: i64,
    item_id: String,
    quantity: i64,
    amount: f64,
}

/// Three behavioral groups plus anonymous guest checkouts
fn lines() -> Vec<Line> {
    let mut lines = Vec::new();
    let mut push = |customer_id: i64, invoice: usize, day: i64, hour: i64, item: String, quantity: i64, amount: f64| {
        lines.push(Line {
            customer_id,
            invoice_id: format!("INV-{}-{}", customer_id, invoice),
            day,
            hour,
            item_id: item,
            quantity,
            amount,
        });
    };

    for c in 0..20i64 {
        // Loyal: eight invoices roughly every 20 days, two lines each
        let id = 1000 + c;
        for k in 0..8usize {
            let day = 10 + 20 * k as i64 + c % 5;
            let amount = 150.0 + ((c * 13) % 40) as f64 + 3.0 * k as f64;
            push(id, k, day, 9 + c % 7, format!("A{}", k % 3), 5 + c % 4, amount);
            push(id, k, day, 9 + c % 7, format!("B{}", c % 2), 2, amount / 4.0);
        }
    }
    for c in 0..20i64 {
        // Occasional: three invoices about a quarter apart
        let id = 2000 + c;
        for k in 0..3usize {
            let day = 30 + 90 * k as i64 + c % 11;
            push(id, k, day, 14, "C1".to_string(), 2, 40.0 + ((c * 7) % 15) as f64);
        }
    }
    for c in 0..20i64 {
        // One-off buyers
        let id = 3000 + c;
        push(id, 0, 100 + 9 * c, 18, "D1".to_string(), 1, 15.0 + (c % 6) as f64);
    }
    for g in 0..4i64 {
        // Guest checkouts, later than every known customer
        push(0, g as usize, 500 + g, 12, "G1".to_string(), 3, 999.0);
    }
    lines
}

fn to_frame(lines: &[Line]) -> DataFrame {
    let base = NaiveDate::from_ymd_opt(2023, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let dates: Vec<String> = lines
        .iter()
        .map(|l| {
            (base + Duration::days(l.day) + Duration::hours(l.hour))
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .collect();

    df!(
        "customer_id" => lines.iter().map(|l| l.customer_id).collect::<Vec<i64>>(),
        "invoice_id" => lines.iter().map(|l| l.invoice_id.clone()).collect::<Vec<String>>(),
        "invoice_date" => dates,
        "item_id" => lines.iter().map(|l| l.item_id.clone()).collect::<Vec<String>>(),
        "quantity" => lines.iter().map(|l| l.quantity).collect::<Vec<i64>>(),
        "amount" => lines.iter().map(|l| l.amount).collect::<Vec<f64>>()
    )
    .unwrap()
}

fn transactions() -> DataFrame {
    to_frame(&lines())
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        segmenter: SegmenterConfig {
            seed: 7,
            n_runs: 3,
            ..Default::default()
        },
        interpreter: InterpreterConfig {
            seed: 7,
            search_iterations: 2,
            cv_folds: 3,
            grid: ParamGrid {
                n_estimators: vec![20],
                learning_rate: vec![0.3],
                max_depth: vec![4],
                num_leaves: vec![15],
                lambda_l1: vec![0.0],
                lambda_l2: vec![0.0, 0.5],
                min_data_in_leaf: vec![2],
                max_bin: vec![63],
                feature_fraction: vec![1.0],
                subsample: vec![1.0],
            },
            ..Default::default()
        },
    }
}

fn run_pipeline() -> PipelineOutput {
    Pipeline::new(test_config()).run(&transactions(), None).unwrap()
}

#[test]
fn test_anonymous_customer_excluded() {
    let profile = FeatureEngineer::new().build_profile(&transactions()).unwrap();
    assert!(!profile.customer_ids.contains(&0));
    assert_eq!(profile.n_customers(), 60);
    assert_eq!(profile.n_features(), 10);

    // Guest rows are the latest, yet must not move the recency reference date
    let known: Vec<Line> = lines().into_iter().filter(|l| l.customer_id != 0).collect();
    let without_guests = FeatureEngineer::new().build_profile(&to_frame(&known)).unwrap();
    assert_eq!(profile, without_guests);
}

#[test]
fn test_frequency_and_monetary_match_raw_sums() {
    let all = lines();
    let known: Vec<&Line> = all.iter().filter(|l| l.customer_id != 0).collect();
    let profile = FeatureEngineer::new().build_profile(&transactions()).unwrap();

    let total_amount: f64 = known.iter().map(|l| l.amount).sum();
    let monetary: f64 = profile.column("monetary").unwrap().sum();
    assert!((monetary - total_amount).abs() < 1e-6);

    let invoices: HashSet<&str> = known.iter().map(|l| l.invoice_id.as_str()).collect();
    let frequency: f64 = profile.column("frequency").unwrap().sum();
    assert_eq!(frequency, invoices.len() as f64);
}

#[test]
fn test_recency_rules() {
    let profile = FeatureEngineer::new().build_profile(&transactions()).unwrap();

    // Loyal customer 1000: last invoices at days 130 and 150, same hour
    assert_eq!(profile.value(1000, "recency"), Some(20.0));
    assert_eq!(profile.value(1000, "is_first_time_buyer"), Some(0.0));

    // Single-invoice recency counts whole days up to the run's latest invoice
    let latest_hour = lines()
        .iter()
        .filter(|l| l.customer_id != 0)
        .map(|l| l.day * 24 + l.hour)
        .max()
        .unwrap();
    // One-off buyer 3000 bought at day 100, 18:00
    let expected = (latest_hour - (100 * 24 + 18)).div_euclid(24) as f64;
    assert_eq!(profile.value(3000, "recency"), Some(expected));
    assert_eq!(profile.value(3000, "is_first_time_buyer"), Some(1.0));
    assert_eq!(profile.value(3000, "mean_time_interval"), Some(expected));
}

#[test]
fn test_single_feature_is_insufficient() {
    let profile = ProfileTable::new(
        vec![1, 2, 3],
        vec!["monetary".to_string()],
        Array2::from_shape_vec((3, 1), vec![1.0, 2.0, 3.0]).unwrap(),
    )
    .unwrap();

    assert!(matches!(
        Segmenter::default().segment(profile),
        Err(SegmentationError::InsufficientFeatures { found: 1, .. })
    ));
}

#[test]
fn test_knee_at_three() {
    assert_eq!(find_best_elbow(&[100.0, 50.0, 20.0, 8.0, 7.0, 6.5]).unwrap(), 3);
}

#[test]
fn test_single_cluster_is_insufficient() {
    let profile = ProfileTable::new(
        vec![1, 2, 3, 4],
        vec!["recency".to_string(), "monetary".to_string()],
        Array2::from_shape_vec((4, 2), vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]).unwrap(),
    )
    .unwrap();
    let labeled = LabeledProfile::new(profile, vec![0; 4]).unwrap();

    assert!(matches!(
        Interpreter::default().interpret(&labeled, None),
        Err(SegmentationError::InsufficientClasses { found: 1 })
    ));
}

#[test]
fn test_pipeline_end_to_end() {
    let output = run_pipeline();

    assert!(output.k_selected >= 2);
    assert_eq!(output.distortions.len(), 10);
    assert_eq!(output.labeled.profile.n_customers(), 60);
    assert!(output.is_train_interpreter);

    let clusters: BTreeSet<usize> = output.labeled.clusters.iter().copied().collect();
    assert_eq!(
        output.importances.iter().map(|r| r.cluster).collect::<BTreeSet<_>>(),
        clusters
    );

    for record in &output.importances {
        assert!(!record.features.is_empty() && record.features.len() <= 5);
        assert!(record.features.windows(2).all(|w| w[0].score >= w[1].score));

        let all_zero = record.features.iter().all(|f| f.score == 0.0);
        assert_eq!(output.anomalies[&record.cluster], all_zero);
    }
    for row in &output.importance_table {
        assert_eq!(row.is_anomaly, output.anomalies[&row.cluster]);
    }
    assert_eq!(
        output.is_anomaly_exist,
        output.anomalies.values().any(|&flag| flag)
    );
    for record in &output.significant_features {
        assert!(!output.anomalies[&record.cluster]);
        assert!(record.features.iter().all(|f| f.score > 0.0));
    }

    let control = output.control_file();
    assert_eq!(control.trained_params, output.best_params);
    assert_eq!(control.is_anomaly_exist, output.is_anomaly_exist);

    let profile = output.profile_frame().unwrap();
    assert_eq!(profile.height(), 60);
    assert!(profile.column("cluster").is_ok());
    assert_eq!(output.importance_frame().unwrap().height(), output.importance_table.len());
}

#[test]
fn test_pipeline_is_deterministic() {
    let first = run_pipeline();
    let second = run_pipeline();

    assert_eq!(first.k_selected, second.k_selected);
    assert_eq!(first.labeled.clusters, second.labeled.clusters);
    assert_eq!(first.importances, second.importances);
    assert_eq!(first.best_params, second.best_params);
}

#[test]
fn test_memory_store_reuses_written_interpreter() {
    let mut store = Backend::Memory(MemoryStore::new(transactions())).open().unwrap();
    let pipeline = Pipeline::new(test_config());

    let first = pipeline
        .run(&store.load_transactions().unwrap(), store.load_interpreter().unwrap())
        .unwrap();
    store.write(&first).unwrap();
    assert!(first.is_train_interpreter);

    let second = pipeline
        .run(&store.load_transactions().unwrap(), store.load_interpreter().unwrap())
        .unwrap();
    assert!(!second.is_train_interpreter);
    assert_eq!(second.classifier, first.classifier);
}

#[test]
fn test_local_store_layout_and_versions() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("transactions.csv");
    let mut file = std::fs::File::create(&input).unwrap();
    writeln!(file, "customer_id,invoice_id,invoice_date,item_id,quantity,amount").unwrap();
    let base = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    for l in lines() {
        let date = base + Duration::days(l.day) + Duration::hours(l.hour);
        writeln!(
            file,
            "{},{},{},{},{},{}",
            l.customer_id,
            l.invoice_id,
            date.format("%Y-%m-%d %H:%M:%S"),
            l.item_id,
            l.quantity,
            l.amount
        )
        .unwrap();
    }
    drop(file);

    let root = dir.path().join("out");
    let mut store = LocalStore::new(&input, &root);
    store.ensure_layout().unwrap();
    let pipeline = Pipeline::new(test_config());

    let first = pipeline
        .run(&store.load_transactions().unwrap(), store.load_interpreter().unwrap())
        .unwrap();
    store.write(&first).unwrap();

    assert_eq!(store.read_table(PROFILE_TABLE).unwrap().height(), 60);
    assert_eq!(
        store.read_table(IMPORTANCE_TABLE).unwrap().height(),
        first.importance_table.len()
    );
    assert_eq!(store.latest_version(SEGMENTER_MODEL).unwrap(), Some(1));
    assert_eq!(store.latest_version(INTERPRETER_MODEL).unwrap(), Some(1));

    let control = store.read_control_file().unwrap();
    assert!(control.is_train_interpreter);
    assert_eq!(control.eval_metrics.interpreter_model.as_deref(), Some(INTERPRETER_MODEL));
    assert_eq!(control.eval_metrics.interpreter_model_version, Some(1));

    // Second run reuses the persisted interpreter and bumps the other models
    let second = pipeline
        .run(&store.load_transactions().unwrap(), store.load_interpreter().unwrap())
        .unwrap();
    assert!(!second.is_train_interpreter);
    store.write(&second).unwrap();

    assert_eq!(store.latest_version(SCALER_MODEL).unwrap(), Some(2));
    assert_eq!(store.latest_version(INTERPRETER_MODEL).unwrap(), Some(1));
    let control = store.read_control_file().unwrap();
    assert!(!control.is_train_interpreter);
    assert_eq!(control.eval_metrics.interpreter_train_date, None);
}

#[test]
fn test_summary_lists_every_cluster() {
    let output = run_pipeline();
    let summary = report::render_summary(&output, true).unwrap();

    assert!(summary.contains(&format!("Number of clusters: {}", output.k_selected)));
    for record in &output.importances {
        assert!(summary.contains(&format!("Cluster {}:", record.cluster)));
    }
    assert!(summary.contains("Distortion curve"));
}
