//! Per-run artifact layout
//!
//! ```text
//! <runs_dir>/<run_id>/<unit_slug>/final_contacts.csv
//! <runs_dir>/<run_id>/<Domain_Title>_leads_final.csv
//! ```

use npsa_storage::RunId;
use std::path::{Path, PathBuf};

pub const UNIT_ARTIFACT_NAME: &str = "final_contacts.csv";
/// Some pipeline versions split channel-less contacts into a second file
pub const UNIT_NO_CHANNEL_ARTIFACT_NAME: &str = "final_contacts_no_emails.csv";

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    runs_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.as_str())
    }

    pub fn unit_dir(&self, run_id: &RunId, unit_id: &str) -> PathBuf {
        self.run_dir(run_id).join(unit_slug(unit_id))
    }

    pub fn unit_artifact(&self, run_id: &RunId, unit_id: &str) -> PathBuf {
        self.unit_dir(run_id, unit_id).join(UNIT_ARTIFACT_NAME)
    }

    pub fn unit_no_channel_artifact(&self, run_id: &RunId, unit_id: &str) -> PathBuf {
        self.unit_dir(run_id, unit_id)
            .join(UNIT_NO_CHANNEL_ARTIFACT_NAME)
    }

    pub fn final_artifact(&self, run_id: &RunId, domain: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("{}_leads_final.csv", domain_title(domain)))
    }

    pub fn has_unit_artifact(&self, run_id: &RunId, unit_id: &str) -> bool {
        self.unit_artifact(run_id, unit_id).is_file()
    }
}

/// Directory-safe unit name: whitespace and path separators become `_`, a leading
/// dot is dropped.
pub fn unit_slug(unit_id: &str) -> String {
    let slug: String = unit_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '/' || c == '\\' || c == '\0' {
                '_'
            } else {
                c
            }
        })
        .collect();
    let slug = slug.trim_start_matches('.');
    if slug.is_empty() {
        "_".to_string()
    } else {
        slug.to_string()
    }
}

/// `"new york"` → `"New_York"`
pub fn domain_title(domain: &str) -> String {
    domain
        .split(|c: char| c.is_whitespace() || c == '_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join("_")
}
