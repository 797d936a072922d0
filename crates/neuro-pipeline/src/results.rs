//! `metrics.json` next to the job's segmentation output.

use chrono::Utc;
use neuro_segment::{Invocation, OutputSource};
use neuro_types::{JobId, Metric};
use serde::Serialize;
use std::path::PathBuf;

pub const RESULTS_FILE: &str = "metrics.json";

#[derive(Serialize)]
struct RegionResult<'a> {
    region: &'a str,
    left_volume: f64,
    right_volume: f64,
    asymmetry_index: f64,
    laterality: &'static str,
}

#[derive(Serialize)]
struct Results<'a> {
    job_id: String,
    generated_at: String,
    source: String,
    placeholder: bool,
    metrics: Vec<RegionResult<'a>>,
}

fn source_label(source: &OutputSource) -> String {
    match source {
        OutputSource::Runtime { runtime, .. } => runtime.clone(),
        OutputSource::Placeholder { .. } => "placeholder".to_string(),
        OutputSource::Existing => "existing".to_string(),
    }
}

pub(crate) async fn write_results_file(
    invocation: &Invocation,
    job_id: &JobId,
    metrics: &[Metric],
    laterality_threshold: f64,
) -> std::io::Result<PathBuf> {
    let results = Results {
        job_id: job_id.to_string(),
        generated_at: Utc::now().to_rfc3339(),
        source: source_label(&invocation.source),
        placeholder: invocation.source.is_placeholder(),
        metrics: metrics
            .iter()
            .map(|m| RegionResult {
                region: &m.region,
                left_volume: m.left_volume,
                right_volume: m.right_volume,
                asymmetry_index: m.asymmetry_index,
                laterality: m.laterality(laterality_threshold).label(),
            })
            .collect(),
    };
    let body = serde_json::to_vec_pretty(&results)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let path = invocation.job_dir.join(RESULTS_FILE);
    tokio::fs::write(&path, body).await?;
    Ok(path)
}
