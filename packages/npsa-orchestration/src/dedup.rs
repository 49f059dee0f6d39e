//! Record normalization and deduplication
//!
//! Records are split by presence of a contact channel. The channel partition is keyed
//! by the normalized channel; the channel-less partition by normalized name plus the
//! source domain (or the organization when no usable domain exists). Within a
//! partition the first record per key wins and the survivors are ordered by key, so
//! the output depends only on the input order, never on hashing.

use crate::record::Record;
use std::collections::BTreeMap;

const ZERO_WIDTH: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// `" Ann@Example.ORG\u{200B}"` → `"ann@example.org"`; `None` when nothing is left.
pub fn normalize_channel(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !ZERO_WIDTH.contains(c))
        .collect::<String>()
        .trim()
        .to_lowercase();
    (!cleaned.is_empty()).then_some(cleaned)
}

pub fn normalized_name(record: &Record) -> String {
    format!(
        "{} {}",
        record.first_name.trim().to_lowercase(),
        record.last_name.trim().to_lowercase()
    )
    .trim()
    .to_string()
}

/// Host part of a source locator, `www.` stripped and lowercased.
///
/// The scheme is optional. Hosts without a dot or of 3 characters or fewer are
/// rejected.
pub fn extract_source_domain(locator: &str) -> Option<String> {
    let locator = locator.trim();
    if locator.is_empty() {
        return None;
    }

    let rest = match locator.find("://") {
        Some(i) => &locator[i + 3..],
        None => locator,
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host).to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();

    (host.contains('.') && host.len() > 3).then_some(host)
}

/// Dedup key for a record; channel-keyed records and name-keyed records never collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DedupKey {
    Channel(String),
    NameAndSource { name: String, source: String },
}

pub fn dedup_key(record: &Record) -> DedupKey {
    if let Some(channel) = record.contact_channel.as_deref().and_then(normalize_channel) {
        return DedupKey::Channel(channel);
    }
    name_and_source_key(record)
}

/// The key a record has in the channel-less partition, whatever its channel.
pub fn name_and_source_key(record: &Record) -> DedupKey {
    let source = extract_source_domain(&record.source_locator)
        .unwrap_or_else(|| record.org_name.trim().to_lowercase());
    DedupKey::NameAndSource {
        name: normalized_name(record),
        source,
    }
}

/// Output of [`dedup_records`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deduped {
    pub with_channel: Vec<Record>,
    pub without_channel: Vec<Record>,
}

impl Deduped {
    pub fn len(&self) -> usize {
        self.with_channel.len() + self.without_channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channel partition first, then the channel-less partition.
    pub fn into_records(self) -> Vec<Record> {
        let mut all = self.with_channel;
        all.extend(self.without_channel);
        all
    }
}

/// Deduplicate `records`; earlier records win over later ones with the same key.
pub fn dedup_records<I>(records: I) -> Deduped
where
    I: IntoIterator<Item = Record>,
{
    let mut with_channel: BTreeMap<String, Record> = BTreeMap::new();
    let mut without_channel: BTreeMap<(String, String), Record> = BTreeMap::new();

    for mut record in records {
        match dedup_key(&record) {
            DedupKey::Channel(channel) => {
                record.contact_channel = Some(channel.clone());
                with_channel.entry(channel).or_insert(record);
            }
            DedupKey::NameAndSource { name, source } => {
                record.contact_channel = None;
                without_channel.entry((name, source)).or_insert(record);
            }
        }
    }

    Deduped {
        with_channel: with_channel.into_values().collect(),
        without_channel: without_channel.into_values().collect(),
    }
}
