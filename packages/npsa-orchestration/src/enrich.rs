//! Contact enrichment port
//!
//! An enrichment service receives the deduplicated channel-less records and returns
//! the subset for which it could resolve a contact channel.

use crate::record::Record;
use async_trait::async_trait;

#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    async fn enrich(&self, domain: &str, records: Vec<Record>) -> anyhow::Result<Vec<Record>>;
}

/// Fixed lookup from normalized name to channel, for local runs and tests
#[derive(Debug, Default)]
pub struct StaticEnricher {
    channels: std::collections::HashMap<String, String>,
}

impl StaticEnricher {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            channels: entries
                .into_iter()
                .map(|(k, v)| (k.into().to_lowercase(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl Enricher for StaticEnricher {
    fn name(&self) -> &str {
        "static"
    }

    async fn enrich(&self, _domain: &str, records: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(records
            .into_iter()
            .filter_map(|mut record| {
                let key = crate::dedup::normalized_name(&record);
                self.channels.get(&key).map(|channel| {
                    record.contact_channel = Some(channel.clone());
                    record
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_enricher_returns_resolved_subset() {
        let enricher = StaticEnricher::new([("ann lee", "ann@adams.edu")]);
        let records = vec![
            Record {
                first_name: "Ann".to_string(),
                last_name: "Lee".to_string(),
                ..Default::default()
            },
            Record {
                first_name: "Bo".to_string(),
                last_name: "Li".to_string(),
                ..Default::default()
            },
        ];

        let out = enricher.enrich("ohio", records).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].contact_channel.as_deref(), Some("ann@adams.edu"));
    }
}
