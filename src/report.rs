//! Console summary of a finished run

use crate::pipeline::PipelineOutput;
use std::fmt::Write;

/// Customers used for the sampled silhouette score
const SILHOUETTE_SAMPLE: usize = 100;

/// Render the run summary; `verbose` adds the elbow curve and centroids
pub fn render_summary(output: &PipelineOutput, verbose: bool) -> crate::Result<String> {
    let mut out = String::new();
    let n_customers = output.labeled.profile.n_customers();
    let model = &output.cluster_model;

    writeln!(out, "=== Cluster Statistics ===")?;
    writeln!(out, "Number of clusters: {}", output.k_selected)?;
    writeln!(out, "Total customers: {}", n_customers)?;
    writeln!(out, "Within-cluster sum of squares (Inertia): {:.2}", model.inertia)?;

    let scaled = output.scaler.transform(&output.labeled.profile.features)?;
    let silhouette = model.compute_silhouette_sample(&scaled, SILHOUETTE_SAMPLE);
    writeln!(out, "Silhouette score (sample): {:.3}", silhouette)?;

    writeln!(out, "\nCluster sizes:")?;
    for (i, &size) in model.cluster_sizes().iter().enumerate() {
        let percentage = (size as f64 / n_customers as f64) * 100.0;
        let flag = if output.anomalies.get(&i).copied().unwrap_or(false) {
            "  [anomaly]"
        } else {
            ""
        };
        writeln!(out, "  Cluster {}: {} customers ({:.1}%){}", i, size, percentage, flag)?;
    }

    if verbose {
        writeln!(out, "\nDistortion curve:")?;
        for (k, d) in output.distortions.iter().enumerate() {
            writeln!(out, "  k={:<3} {:.4}", k + 1, d)?;
        }

        writeln!(out, "\nCluster centroids (scaled):")?;
        let names = &output.labeled.profile.feature_names;
        for (i, centroid) in model.centroids.outer_iter().enumerate() {
            let values: Vec<String> = names
                .iter()
                .zip(centroid.iter())
                .map(|(name, v)| format!("{}={:.2}", name, v))
                .collect();
            writeln!(out, "  Cluster {}: {}", i, values.join(", "))?;
        }
    }

    writeln!(out, "\n=== Important Features ===")?;
    for record in &output.importances {
        let ranked: Vec<String> = record
            .features
            .iter()
            .map(|f| format!("{} ({:.4})", f.feature, f.score))
            .collect();
        writeln!(out, "  Cluster {}: {}", record.cluster, ranked.join(", "))?;
    }

    let metrics = &output.eval_metrics;
    writeln!(out, "\n=== Interpreter ===")?;
    writeln!(
        out,
        "Trained this run: {}",
        if output.is_train_interpreter { "yes" } else { "no (reused)" }
    )?;
    writeln!(
        out,
        "F1 (macro): {:.4}  Accuracy: {:.4}  Precision: {:.4}  Recall: {:.4}",
        metrics.f1_score_macro, metrics.accuracy, metrics.precision, metrics.recall
    )?;
    if verbose {
        writeln!(out, "Parameters: {:?}", output.best_params)?;
    }

    if output.is_anomaly_exist {
        let flagged: Vec<String> = output
            .anomalies
            .iter()
            .filter(|(_, &flag)| flag)
            .map(|(c, _)| c.to_string())
            .collect();
        writeln!(out, "\n⚠ Anomaly clusters: {}", flagged.join(", "))?;
    }

    Ok(out)
}

/// Print the run summary to stdout
pub fn print_summary(output: &PipelineOutput, verbose: bool) -> crate::Result<()> {
    print!("{}", render_summary(output, verbose)?);
    Ok(())
}
