// The results file the invoking UI reads after a successful exit.
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{create_dir_all, File};
use tokio::io::AsyncWriteExt;

use crate::layers::taxonomy::display_category;
use crate::layers::ScoredPaper;

pub const DEFAULT_RESULTS_FILE: &str = "results.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultRecord {
    pub title: String,
    pub authors: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub url: String,
    pub pdf_url: String,
    pub subjects: String,
    pub relevancy_score: u8,
    pub reasons_for_match: String,
}

impl From<&ScoredPaper> for ResultRecord {
    fn from(scored: &ScoredPaper) -> Self {
        let paper = &scored.paper;
        Self {
            title: paper.title.clone(),
            authors: paper.authors.join(", "),
            abstract_text: paper.abstract_text.clone(),
            url: paper.url.clone(),
            pdf_url: paper.pdf_url.clone(),
            subjects: paper
                .categories
                .iter()
                .map(|c| display_category(c))
                .collect::<Vec<_>>()
                .join("; "),
            relevancy_score: scored.relevancy_score,
            reasons_for_match: scored.reasons_for_match.clone(),
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_RESULTS_FILE.to_string());
    path.with_file_name(format!(".{name}.partial"))
}

/// Remove a previous run's artifact so it can never be mistaken for fresh output.
pub async fn clear(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!("Removed stale results at {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Replace the artifact at `path` with `results`, atomically.
pub async fn write(path: &Path, results: &[ScoredPaper]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent).await?;
    }

    let records: Vec<ResultRecord> = results.iter().map(ResultRecord::from).collect();
    let json = serde_json::to_vec_pretty(&records)?;

    let staging = staging_path(path);
    if let Err(e) = stage_and_swap(&staging, path, &json).await {
        if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
            if cleanup.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Could not remove {:?}: {}", staging, cleanup);
            }
        }
        return Err(e);
    }
    tracing::info!("Wrote {} results to {:?}", records.len(), path);
    Ok(())
}

async fn stage_and_swap(staging: &Path, path: &Path, json: &[u8]) -> io::Result<()> {
    let mut file = File::create(staging).await?;
    file.write_all(json).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(staging, path).await
}

pub async fn read(path: &Path) -> io::Result<Vec<ResultRecord>> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
