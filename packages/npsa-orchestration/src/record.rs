//! Contact record model and its CSV artifact codec

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One extracted contact
///
/// Serialized with the artifact column names; the reader also accepts the
/// title-case headers produced by older pipeline versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, alias = "First Name")]
    pub first_name: String,
    #[serde(default, alias = "Last Name")]
    pub last_name: String,
    #[serde(default, alias = "Title")]
    pub title: String,
    #[serde(
        rename = "email",
        alias = "Email",
        default,
        deserialize_with = "blank_as_none"
    )]
    pub contact_channel: Option<String>,
    #[serde(default, alias = "Phone")]
    pub phone: String,
    #[serde(rename = "school_name", alias = "School Name", default)]
    pub org_name: String,
    #[serde(rename = "source_url", alias = "Source URL", default)]
    pub source_locator: String,
}

impl Record {
    /// Counts and partitions agree with deduplication on what a channel is.
    pub fn has_channel(&self) -> bool {
        self.contact_channel
            .as_deref()
            .and_then(crate::dedup::normalize_channel)
            .is_some()
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()))
}

/// Channel counts over a record set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub total: usize,
    pub with_channel: usize,
    pub without_channel: usize,
}

impl RecordCounts {
    pub fn of(records: &[Record]) -> Self {
        let with_channel = records.iter().filter(|r| r.has_channel()).count();
        Self {
            total: records.len(),
            with_channel,
            without_channel: records.len() - with_channel,
        }
    }
}

pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_path(path)?;

    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

/// Write records to `path`, replacing any previous file atomically.
pub fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = csv::Writer::from_writer(tmp.as_file());
        if records.is_empty() {
            writer.write_record(HEADER)?;
        }
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub const HEADER: [&str; 7] = [
    "first_name",
    "last_name",
    "title",
    "email",
    "phone",
    "school_name",
    "source_url",
];
