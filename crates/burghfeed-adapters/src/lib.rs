//! Extract parsing, header remapping and record normalization for the three feed tables.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use burghfeed_core::{CanonicalRecord, NormalizeError, RawRecord, RecordSchema, SchemaError, TableKind, TableProfile};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod headers;
pub mod normalize;

pub use headers::HeaderMapper;
pub use normalize::{fuse_categories, format_geocoordinates, split_geocoordinates, NormalizeStep, RecordNormalizer};

pub const CRATE_NAME: &str = "burghfeed-adapters";

/// Delimiter of the source extracts. The first line of each file declares it and is discarded.
pub const FIELD_DELIMITER: u8 = b'|';

/// What happens to a row whose combined coordinate field cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedRowPolicy {
    /// Fail the whole batch.
    Abort,
    /// Log the row, record it in the report and continue without it.
    #[default]
    Quarantine,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("reading {kind} extract: {source}")]
    Csv {
        kind: TableKind,
        #[source]
        source: csv::Error,
    },
    #[error("{kind} extract line {line}: {source}")]
    Record {
        kind: TableKind,
        line: u64,
        #[source]
        source: NormalizeError,
    },
}

/// Row left out of a batch, with the 1-based line it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub kind: TableKind,
    /// Header row after canonical renaming.
    pub headers: Vec<String>,
    pub records: Vec<CanonicalRecord>,
    /// Rows with an unparseable coordinate field.
    pub quarantined: Vec<SkippedRow>,
    /// Rows whose never-null field was empty.
    pub rejected: Vec<SkippedRow>,
}

/// Parses one extract, renames its headers and runs every row through the normalizer.
pub struct BatchIngestor {
    profile: TableProfile,
    normalizer: RecordNormalizer,
    policy: MalformedRowPolicy,
}

impl BatchIngestor {
    pub fn new(profile: TableProfile, policy: MalformedRowPolicy) -> Self {
        let normalizer = RecordNormalizer::for_profile(&profile);
        Self {
            profile,
            normalizer,
            policy,
        }
    }

    pub fn profile(&self) -> &TableProfile {
        &self.profile
    }

    /// Raw rows keyed by source header, each paired with its line number.
    pub fn parse(&self, text: &str) -> Result<(Vec<String>, Vec<(u64, RawRecord)>), IngestError> {
        let kind = self.profile.kind;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let Some((_declaration, body)) = text.split_once('\n') else {
            return Err(SchemaError::MissingHeader { kind }.into());
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(FIELD_DELIMITER)
            .quote(b'"')
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_reader(body.as_bytes());
        let headers = reader
            .headers()
            .map_err(|source| IngestError::Csv { kind, source })?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if headers.iter().all(String::is_empty) {
            return Err(SchemaError::MissingHeader { kind }.into());
        }

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|source| IngestError::Csv { kind, source })?;
            // +1 for the discarded delimiter line.
            let line = record.position().map(|p| p.line() + 1).unwrap_or_default();
            rows.push((
                line,
                RawRecord::from_pairs(headers.iter().cloned().zip(record.iter().map(ToString::to_string))),
            ));
        }
        Ok((headers, rows))
    }

    pub fn ingest(&self, text: &str) -> Result<IngestReport, IngestError> {
        let kind = self.profile.kind;
        let (mut headers, rows) = self.parse(text)?;
        let (lines, mut raws): (Vec<u64>, Vec<RawRecord>) = rows.into_iter().unzip();

        HeaderMapper::new(&self.profile).apply(&mut headers, &mut raws)?;
        if !headers.contains(&self.profile.required_field) {
            return Err(SchemaError::MissingColumn {
                kind,
                column: self.profile.required_field.clone(),
            }
            .into());
        }

        let mut records = Vec::with_capacity(raws.len());
        let mut quarantined = Vec::new();
        let mut rejected = Vec::new();
        for (line, raw) in lines.into_iter().zip(&raws) {
            match self.normalizer.normalize(raw) {
                Ok(record) => records.push(record),
                Err(err @ NormalizeError::MissingRequiredField { .. }) => {
                    warn!(table = %kind, line, error = %err, "rejecting row");
                    rejected.push(SkippedRow {
                        line,
                        reason: err.to_string(),
                    });
                }
                Err(err @ NormalizeError::MalformedGeocoordinate { .. }) => match self.policy {
                    MalformedRowPolicy::Abort => {
                        return Err(IngestError::Record {
                            kind,
                            line,
                            source: err,
                        })
                    }
                    MalformedRowPolicy::Quarantine => {
                        warn!(table = %kind, line, error = %err, "quarantining row");
                        quarantined.push(SkippedRow {
                            line,
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }

        debug!(
            table = %kind,
            records = records.len(),
            quarantined = quarantined.len(),
            rejected = rejected.len(),
            "ingested extract"
        );
        Ok(IngestReport {
            kind,
            headers,
            records,
            quarantined,
            rejected,
        })
    }

    pub fn ingest_path(&self, path: impl AsRef<Path>) -> Result<IngestReport> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        self.ingest(&text)
            .with_context(|| format!("ingesting {}", path.display()))
    }
}

/// Writes records as a comma-separated file headed by publish names.
pub fn write_canonical_csv(path: impl AsRef<Path>, schema: &RecordSchema, records: &[CanonicalRecord]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(schema.publish_names())
        .with_context(|| format!("writing header to {}", path.display()))?;
    for record in records {
        let row = schema
            .fields
            .iter()
            .map(|f| record.get(&f.name).map(ToString::to_string).unwrap_or_default());
        writer
            .write_record(row)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burghfeed_core::Mode;

    const EVENTS: &str = "sep=|\n\
Event Name|Program Lat and Long|Category One|Category Two|Organization Name\n\
\"Lunch\"|\"Lat: 40.1, Lon: -79.9\"|\"Food\"|\"\"|\"Eastside\"\n\
\"Dinner\"|\"Lat: 40.2, Lon: -79.8\"|\"Food\"|\"\"|\"Eastside\"\n\
\"Clinic\"|\"Lat: ?, Lon: -79.8\"|\"Legal\"|\"Housing\"|\"NLS\"\n";

    fn ingestor(policy: MalformedRowPolicy) -> BatchIngestor {
        BatchIngestor::new(TableProfile::for_kind(TableKind::Events), policy)
    }

    #[test]
    fn parse_discards_delimiter_line_and_keeps_header_order() {
        let (headers, rows) = ingestor(MalformedRowPolicy::Abort).parse(EVENTS).unwrap();
        assert_eq!(headers[0], "Event Name");
        assert_eq!(headers.len(), 5);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, 3);
        assert_eq!(rows[0].1.get("Category Two"), Some(""));
    }

    #[test]
    fn quarantine_policy_skips_malformed_rows() {
        let report = ingestor(MalformedRowPolicy::Quarantine).ingest(EVENTS).unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.quarantined.len(), 1);
        assert_eq!(report.quarantined[0].line, 5);
        assert!(report.quarantined[0].reason.contains("Lat: ?, Lon: -79.8"));
        assert!(report
            .records
            .iter()
            .all(|r| r.text("category") == Some("Food")));
        assert!(report.headers.contains(&"event_name".to_string()));
    }

    #[test]
    fn abort_policy_fails_the_batch() {
        let err = ingestor(MalformedRowPolicy::Abort).ingest(EVENTS).unwrap_err();
        match err {
            IngestError::Record { line, source, .. } => {
                assert_eq!(line, 5);
                assert_eq!(
                    source,
                    NormalizeError::MalformedGeocoordinate {
                        raw: "Lat: ?, Lon: -79.8".into()
                    }
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn header_collision_is_a_schema_error() {
        let text = "sep=|\nEvent Name|event_name\n\"a\"|\"b\"\n";
        let err = ingestor(MalformedRowPolicy::Quarantine).ingest(text).unwrap_err();
        assert!(matches!(err, IngestError::Schema(SchemaError::Collision { .. })));
    }

    #[test]
    fn missing_name_column_is_a_schema_error() {
        let text = "sep=|\nSchedule\n\"Mon\"\n";
        let err = ingestor(MalformedRowPolicy::Quarantine).ingest(text).unwrap_err();
        assert!(matches!(err, IngestError::Schema(SchemaError::MissingColumn { .. })));
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let text = "sep=|\nEvent Name|Schedule\n\"a\"|\"Mon\"|\"extra\"\n";
        let err = ingestor(MalformedRowPolicy::Quarantine).ingest(text).unwrap_err();
        assert!(matches!(err, IngestError::Csv { .. }));
    }

    #[test]
    fn file_without_header_row_is_rejected() {
        let err = ingestor(MalformedRowPolicy::Quarantine).ingest("sep=|").unwrap_err();
        assert!(matches!(err, IngestError::Schema(SchemaError::MissingHeader { .. })));
    }

    #[test]
    fn canonical_csv_uses_publish_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("events.csv");
        let profile = TableProfile::for_kind(TableKind::Events);
        let report = ingestor(MalformedRowPolicy::Quarantine).ingest(EVENTS).unwrap();
        write_canonical_csv(&path, &profile.schema(Mode::Live), &report.records).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("event_name,recurrence,"));
        assert!(header.contains(",organization,"));
        assert!(!header.contains("organization_name"));
        assert_eq!(lines.count(), 2);
    }
}
