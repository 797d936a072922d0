//! Last rung: deterministic synthetic output in the tool's own layout.
//!
//! Every placeholder directory carries a marker file so the output can never
//! be mistaken for a real segmentation after the fact.

use chrono::Utc;
use neuro_types::JobId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Marker written into `<seg_dir>/<job_id>/` next to placeholder stats.
pub const PLACEHOLDER_MARKER: &str = ".placeholder.json";

const LEFT_HIPPOCAMPUS: f64 = 1250.5;
const RIGHT_HIPPOCAMPUS: f64 = 1198.2;

/// (name, left, right) subfield volumes in mm³.
const SUBFIELDS: [(&str, f64, f64); 4] = [
    ("CA1", 1250.5, 1198.2),
    ("CA3", 450.3, 465.1),
    ("subiculum", 580.7, 555.9),
    ("dentate_gyrus", 380.2, 395.6),
];

#[derive(Serialize)]
struct Marker<'a> {
    job_id: String,
    reason: &'a str,
    written_at: String,
}

fn stats_dir(seg_dir: &Path, job_id: &JobId) -> PathBuf {
    seg_dir.join(job_id.to_string()).join("stats")
}

/// Write an `aseg+DKT.stats` with the given hippocampus volumes.
pub async fn write_aseg_stats(
    seg_dir: &Path,
    job_id: &JobId,
    left: f64,
    right: f64,
) -> std::io::Result<PathBuf> {
    let dir = stats_dir(seg_dir, job_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join("aseg+DKT.stats");
    let body = format!(
        "# Title Segmentation Statistics\n\
         # ColHeaders  Index SegId NVoxels Volume_mm3 StructName normMean normStdDev normMin normMax normRange\n\
         \x20 1  17  31262  {left:.1}  Left-Hippocampus  110.5  15.2  85.3  145.6  60.3\n\
         \x20 2  53  29845  {right:.1}  Right-Hippocampus  108.7  14.8  82.1  142.3  60.2\n"
    );
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

async fn write_subfields(seg_dir: &Path, job_id: &JobId) -> std::io::Result<()> {
    let dir = stats_dir(seg_dir, job_id);
    for (hemi, label) in [("lh", "left"), ("rh", "right")] {
        let mut body = format!("# Hippocampal subfield volumes ({} hemisphere)\n# Region Volume\n", label);
        for (name, l, r) in SUBFIELDS {
            let v = if hemi == "lh" { l } else { r };
            body.push_str(&format!("{} {:.2}\n", name, v));
        }
        tokio::fs::write(dir.join(format!("{}.hippoSfVolumes-T1.v21.txt", hemi)), body).await?;
    }
    Ok(())
}

/// Write the full placeholder layout and its marker. Returns `seg_dir`.
pub async fn write_placeholder(
    seg_dir: &Path,
    job_id: &JobId,
    reason: &str,
) -> std::io::Result<PathBuf> {
    write_aseg_stats(seg_dir, job_id, LEFT_HIPPOCAMPUS, RIGHT_HIPPOCAMPUS).await?;
    write_subfields(seg_dir, job_id).await?;
    let marker = Marker {
        job_id: job_id.to_string(),
        reason,
        written_at: Utc::now().to_rfc3339(),
    };
    let body = serde_json::to_vec_pretty(&marker)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(seg_dir.join(job_id.to_string()).join(PLACEHOLDER_MARKER), body).await?;
    tracing::warn!(job_id = %job_id, reason, "wrote placeholder segmentation output");
    Ok(seg_dir.to_path_buf())
}

#[derive(Deserialize)]
struct MarkerReason {
    reason: String,
}

/// The reason recorded by an earlier placeholder run, if this output is one.
///
/// A marker that cannot be parsed still counts as a placeholder.
pub async fn placeholder_reason(seg_dir: &Path, job_id: &JobId) -> Option<String> {
    let path = seg_dir.join(job_id.to_string()).join(PLACEHOLDER_MARKER);
    let body = tokio::fs::read(&path).await.ok()?;
    Some(
        serde_json::from_slice::<MarkerReason>(&body)
            .map(|m| m.reason)
            .unwrap_or_else(|_| "unreadable placeholder marker".to_string()),
    )
}
