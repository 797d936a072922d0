//! Metric extraction: turns the segmentation tool's statistics files into
//! named left/right volume pairs.
//!
//! The tool writes `<seg_dir>/<job_id>/stats/aseg+DKT.stats`, a whitespace
//! table whose fourth column is the volume in mm³ and fifth the structure
//! name. Hippocampal subfield tables (`lh/rh.hippoSfVolumes-T1.v21.txt`,
//! `name volume` per line) are read only when asked for.

use neuro_types::{JobId, VolumePair};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ASEG_STATS: &str = "aseg+DKT.stats";
const SUBFIELD_FILES: (&str, &str) = ("lh.hippoSfVolumes-T1.v21.txt", "rh.hippoSfVolumes-T1.v21.txt");

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// No statistics were produced. Fatal: there is no fallback at this stage.
    #[error("no segmentation statistics found at {}", .0.display())]
    NoArtifacts(PathBuf),
    #[error("structure {label} missing from {}", path.display())]
    MissingStructure { label: String, path: PathBuf },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One left/right region to pull from the aseg table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    pub name: String,
    pub left_label: String,
    pub right_label: String,
}

impl RegionSpec {
    pub fn new(
        name: impl Into<String>,
        left_label: impl Into<String>,
        right_label: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            left_label: left_label.into(),
            right_label: right_label.into(),
        }
    }

    pub fn hippocampus() -> Self {
        Self::new("Hippocampus", "Left-Hippocampus", "Right-Hippocampus")
    }
}

/// Parse an aseg stats table into `StructName -> volume`. Comment lines and
/// rows that do not parse are skipped.
pub fn parse_aseg(text: &str) -> HashMap<String, f64> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            let volume = fields[3].parse::<f64>().ok()?;
            Some((fields[4].to_string(), volume))
        })
        .collect()
}

/// Parse a subfield table (`name volume` per line) preserving file order.
pub fn parse_subfields(text: &str) -> Vec<(String, f64)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let volume = parts.next()?.parse::<f64>().ok()?;
            Some((name.to_string(), volume))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct MetricExtractor {
    regions: Vec<RegionSpec>,
    include_subfields: bool,
}

impl Default for MetricExtractor {
    fn default() -> Self {
        Self {
            regions: vec![RegionSpec::hippocampus()],
            include_subfields: false,
        }
    }
}

impl MetricExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_regions(mut self, regions: Vec<RegionSpec>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_subfields(mut self, include: bool) -> Self {
        self.include_subfields = include;
        self
    }

    pub fn stats_dir(seg_dir: &Path, job_id: &JobId) -> PathBuf {
        seg_dir.join(job_id.to_string()).join("stats")
    }

    /// Read the job's statistics under `seg_dir` and return one pair per region.
    pub async fn extract(&self, seg_dir: &Path, job_id: &JobId) -> Result<Vec<VolumePair>, ExtractError> {
        let stats_dir = Self::stats_dir(seg_dir, job_id);
        let aseg_path = stats_dir.join(ASEG_STATS);
        let text = match tokio::fs::read_to_string(&aseg_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(job_id = %job_id, path = %aseg_path.display(), "no stats files found");
                return Err(ExtractError::NoArtifacts(aseg_path));
            }
            Err(source) => return Err(ExtractError::Io { path: aseg_path, source }),
        };
        let volumes = parse_aseg(&text);
        if volumes.is_empty() {
            return Err(ExtractError::NoArtifacts(aseg_path));
        }

        let lookup = |label: &str| {
            volumes
                .get(label)
                .copied()
                .ok_or_else(|| ExtractError::MissingStructure {
                    label: label.to_string(),
                    path: aseg_path.clone(),
                })
        };
        let mut pairs = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            let left = lookup(&region.left_label)?;
            let right = lookup(&region.right_label)?;
            tracing::info!(job_id = %job_id, region = %region.name, left, right, "region volumes found");
            pairs.push(VolumePair::new(region.name.clone(), left, right));
        }

        if self.include_subfields {
            pairs.extend(self.subfields(&stats_dir, job_id).await?);
        }
        Ok(pairs)
    }

    /// Subfields present in both hemispheres, as `Hippocampus_<name>` regions.
    /// Missing subfield files are not an error.
    async fn subfields(&self, stats_dir: &Path, job_id: &JobId) -> Result<Vec<VolumePair>, ExtractError> {
        let read = |name: &str| {
            let path = stats_dir.join(name);
            async move {
                match tokio::fs::read_to_string(&path).await {
                    Ok(text) => Ok(Some(parse_subfields(&text))),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(source) => Err(ExtractError::Io { path, source }),
                }
            }
        };
        let (left, right) = match (read(SUBFIELD_FILES.0).await?, read(SUBFIELD_FILES.1).await?) {
            (Some(l), Some(r)) => (l, r),
            _ => {
                tracing::debug!(job_id = %job_id, "no hippocampal subfield volumes");
                return Ok(Vec::new());
            }
        };
        let right: HashMap<String, f64> = right.into_iter().collect();
        Ok(left
            .into_iter()
            .filter_map(|(name, l)| {
                let r = *right.get(&name)?;
                Some(VolumePair::new(format!("Hippocampus_{}", name), l, r))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASEG: &str = "# Title Segmentation Statistics\n\
        # ColHeaders  Index SegId NVoxels Volume_mm3 StructName normMean\n\
        \x20 1  17  31262  1250.0  Left-Hippocampus  110.5\n\
        \x20 2  53  29845  1200.0  Right-Hippocampus  108.7\n\
        \x20 3  18  1500  bad  Left-Amygdala  99.0\n";

    async fn write_stats(seg_dir: &Path, job_id: &JobId, files: &[(&str, &str)]) {
        let dir = MetricExtractor::stats_dir(seg_dir, job_id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        for (name, body) in files {
            tokio::fs::write(dir.join(name), body).await.unwrap();
        }
    }

    #[test]
    fn parses_volume_and_name_columns() {
        let volumes = parse_aseg(ASEG);
        assert_eq!(volumes.get("Left-Hippocampus"), Some(&1250.0));
        assert_eq!(volumes.get("Right-Hippocampus"), Some(&1200.0));
        assert!(!volumes.contains_key("Left-Amygdala"));
    }

    #[tokio::test]
    async fn extracts_hippocampus_pair() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        write_stats(dir.path(), &job_id, &[(ASEG_STATS, ASEG)]).await;
        let pairs = MetricExtractor::new().extract(dir.path(), &job_id).await.unwrap();
        assert_eq!(pairs, vec![VolumePair::new("Hippocampus", 1250.0, 1200.0)]);
    }

    #[tokio::test]
    async fn missing_stats_is_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let err = MetricExtractor::new()
            .extract(dir.path(), &JobId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::NoArtifacts(_)));
    }

    #[tokio::test]
    async fn missing_structure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        write_stats(dir.path(), &job_id, &[(ASEG_STATS, ASEG)]).await;
        let err = MetricExtractor::new()
            .with_regions(vec![RegionSpec::new("Amygdala", "Left-Amygdala", "Right-Amygdala")])
            .extract(dir.path(), &job_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::MissingStructure { ref label, .. } if label == "Left-Amygdala"));
    }

    #[tokio::test]
    async fn subfields_only_when_enabled_and_paired() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        write_stats(
            dir.path(),
            &job_id,
            &[
                (ASEG_STATS, ASEG),
                (SUBFIELD_FILES.0, "# Region Volume\nCA1 1250.50\nCA3 450.30\nfissure 12.00\n"),
                (SUBFIELD_FILES.1, "# Region Volume\nCA1 1198.20\nCA3 465.10\n"),
            ],
        )
        .await;

        let plain = MetricExtractor::new().extract(dir.path(), &job_id).await.unwrap();
        assert_eq!(plain.len(), 1);

        let pairs = MetricExtractor::new()
            .with_subfields(true)
            .extract(dir.path(), &job_id)
            .await
            .unwrap();
        let names: Vec<&str> = pairs.iter().map(|p| p.region.as_str()).collect();
        assert_eq!(names, ["Hippocampus", "Hippocampus_CA1", "Hippocampus_CA3"]);
        assert_eq!(pairs[2].right_volume, 465.1);
    }
}
