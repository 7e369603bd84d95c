//! Core domain model for the burghfeed pipeline: table kinds, record shapes, profiles and decisions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "burghfeed-core";

/// Field added to every archived record.
pub const PERIOD_FIELD: &str = "period";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Events,
    SafePlaces,
    Services,
}

impl TableKind {
    pub const ALL: [TableKind; 3] = [TableKind::Events, TableKind::SafePlaces, TableKind::Services];

    pub fn slug(self) -> &'static str {
        match self {
            TableKind::Events => "events",
            TableKind::SafePlaces => "safe_places",
            TableKind::Services => "services",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            TableKind::Events => "Events",
            TableKind::SafePlaces => "Safe Places",
            TableKind::Services => "Services",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for TableKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "events" => Ok(TableKind::Events),
            "safe_places" | "safeplaces" => Ok(TableKind::SafePlaces),
            "services" => Ok(TableKind::Services),
            other => Err(format!("unknown table kind `{other}`")),
        }
    }
}

/// Whether a batch is shaped for the live resources or for the period-tagged archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Live,
    Archive,
}

/// Calendar year-month bucket, rendered as `YYYYMM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (0..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Period of the wall clock at the moment of processing.
    pub fn current() -> Self {
        Self::from_date(Local::now().date_naive())
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("period `{s}` is not in YYYYMM form"));
        }
        let year = s[..4].parse::<i32>().map_err(|e| e.to_string())?;
        let month = s[4..].parse::<u32>().map_err(|e| e.to_string())?;
        Period::new(year, month).ok_or_else(|| format!("period `{s}` has an invalid month"))
    }
}

impl TryFrom<String> for Period {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

/// One parsed source row: source column name to raw string, in header order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    entries: Vec<(String, String)>,
}

impl RawRecord {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Absent keys and empty strings read the same.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Relabels every entry in one pass, each new key derived from the entry's original key.
    /// Entries for which `rename` returns `None` keep their key. Values and positions never move.
    pub fn relabel<F>(&mut self, rename: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (key, _) in &mut self.entries {
            if let Some(to) = rename(key) {
                *key = to;
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Text value with the missing-value policy applied: empty becomes null.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            FieldValue::Null
        } else {
            FieldValue::Text(value)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// Normalized record keyed by canonical field name. Built once by the normalizer, then read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    values: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    pub fn from_values(values: BTreeMap<String, FieldValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_str)
    }

    pub fn float(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_f64)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy of this record carrying `period`.
    pub fn stamped(&self, period: Period) -> Self {
        let mut values = self.values.clone();
        values.insert(PERIOD_FIELD.to_string(), FieldValue::Text(period.to_string()));
        Self { values }
    }

    /// Row keyed by publish names, holding every schema field (null when absent).
    pub fn to_wire_row(&self, schema: &RecordSchema) -> JsonMap<String, JsonValue> {
        schema
            .fields
            .iter()
            .map(|field| {
                let value = self
                    .values
                    .get(&field.name)
                    .map(FieldValue::to_json)
                    .unwrap_or(JsonValue::Null);
                (field.publish_name.clone(), value)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Float,
}

impl FieldType {
    /// Column type name understood by the datastore.
    pub fn wire_type(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Float => "float",
        }
    }
}

/// One canonical field and the label it is published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub publish_name: String,
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            publish_name: name.to_string(),
            field_type: FieldType::Text,
        }
    }

    pub fn float(name: &str) -> Self {
        Self {
            name: name.to_string(),
            publish_name: name.to_string(),
            field_type: FieldType::Float,
        }
    }

    pub fn published_as(mut self, publish_name: &str) -> Self {
        self.publish_name = publish_name.to_string();
        self
    }
}

/// Column as sent to the datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireField {
    pub id: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

/// Output field set for a (table kind, mode) pair: the profile's base fields plus `period` when archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub kind: TableKind,
    pub mode: Mode,
    pub fields: Vec<FieldDef>,
}

impl RecordSchema {
    pub fn for_profile(profile: &TableProfile, mode: Mode) -> Self {
        let mut fields = profile.fields.clone();
        if mode == Mode::Archive {
            fields.push(FieldDef::text(PERIOD_FIELD));
        }
        Self {
            kind: profile.kind,
            mode,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn publish_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.publish_name.clone()).collect()
    }

    pub fn wire_fields(&self) -> Vec<WireField> {
        self.fields
            .iter()
            .map(|f| WireField {
                id: f.publish_name.clone(),
                field_type: f.field_type.wire_type().to_string(),
            })
            .collect()
    }

    /// Maps canonical key field names to their publish names.
    pub fn publish_keys(&self, key_fields: &[String]) -> Vec<String> {
        key_fields
            .iter()
            .map(|k| {
                self.field(k)
                    .map(|f| f.publish_name.clone())
                    .unwrap_or_else(|| k.clone())
            })
            .collect()
    }
}

/// Combined `"Lat: <num>, Lon: <num>"` source field split into two numeric fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocoordinateRule {
    pub source: String,
    pub latitude: String,
    pub longitude: String,
}

/// Two optional category fields fused into one `|`-joined field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryFusionRule {
    pub first: String,
    pub second: String,
    pub target: String,
}

/// Per-table configuration. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableProfile {
    pub kind: TableKind,
    /// Source column alias to canonical field name.
    pub header_rename_map: BTreeMap<String, String>,
    /// Canonical field that must carry a non-empty value.
    pub required_field: String,
    pub geocoordinates: Option<GeocoordinateRule>,
    pub category_fusion: Option<CategoryFusionRule>,
    /// Base output fields, in publish order.
    pub fields: Vec<FieldDef>,
    pub key_fields: Vec<String>,
    pub resource_name: String,
    pub archive_resource_name: String,
    /// Name of the per-period snapshot; `{period}` is substituted.
    pub period_archive_name_template: String,
}

const ORGANIZATION_PUBLISH_NAME: &str = "organization";

impl TableProfile {
    pub fn for_kind(kind: TableKind) -> Self {
        match kind {
            TableKind::Events => listing_profile(
                kind,
                "event_name",
                &[
                    ("Event Name", "event_name"),
                    ("Recurring, One-Time or One-on-One?", "recurrence"),
                    ("(Event) Recommended For :", "recommended_for"),
                    ("(Event) Requirements", "requirements"),
                    ("Event Phone", "phone"),
                    ("Event Narrative", "narrative"),
                ],
                true,
                vec!["event_name".into(), "program_or_facility".into(), "schedule".into()],
            ),
            TableKind::Services => listing_profile(
                kind,
                "service_name",
                &[
                    ("Service Name", "service_name"),
                    ("(Service) Recommended For :", "recommended_for"),
                    ("(Service) Requirements", "requirements"),
                    ("Service Phone", "phone"),
                    ("Service Narrative", "narrative"),
                ],
                false,
                vec!["service_name".into(), "program_or_facility".into()],
            ),
            TableKind::SafePlaces => {
                let header_rename_map = [
                    ("Safe Place Name", "safe_place_name"),
                    ("Address", "address"),
                    ("Neighborhood", "neighborhood"),
                    ("Lat and Long", "geocoordinates"),
                    ("Phone", "phone"),
                    ("Narrative", "narrative"),
                    ("Schedule", "schedule"),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
                let fields = vec![
                    FieldDef::text("safe_place_name"),
                    FieldDef::text("address"),
                    FieldDef::text("neighborhood"),
                    FieldDef::float("latitude"),
                    FieldDef::float("longitude"),
                    FieldDef::text("phone"),
                    FieldDef::text("narrative"),
                    FieldDef::text("schedule"),
                ];
                Self {
                    kind,
                    header_rename_map,
                    required_field: "safe_place_name".into(),
                    geocoordinates: Some(default_geocoordinate_rule()),
                    category_fusion: None,
                    fields,
                    key_fields: vec!["safe_place_name".into(), "address".into()],
                    resource_name: kind.display_name().to_string(),
                    archive_resource_name: format!("{} Archive", kind.display_name()),
                    period_archive_name_template: format!("{} {{period}}", kind.display_name()),
                }
            }
        }
    }

    pub fn all() -> Vec<TableProfile> {
        TableKind::ALL.into_iter().map(Self::for_kind).collect()
    }

    pub fn schema(&self, mode: Mode) -> RecordSchema {
        RecordSchema::for_profile(self, mode)
    }

    pub fn period_resource_name(&self, period: Period) -> String {
        self.period_archive_name_template
            .replace("{period}", &period.to_string())
    }

    pub fn canonical_for(&self, source_header: &str) -> Option<&str> {
        self.header_rename_map.get(source_header).map(String::as_str)
    }
}

fn default_geocoordinate_rule() -> GeocoordinateRule {
    GeocoordinateRule {
        source: "geocoordinates".into(),
        latitude: "latitude".into(),
        longitude: "longitude".into(),
    }
}

/// Events and services share the program/organization layout and differ in their leading columns.
fn listing_profile(
    kind: TableKind,
    name_field: &str,
    specific_aliases: &[(&str, &str)],
    has_recurrence: bool,
    key_fields: Vec<String>,
) -> TableProfile {
    let shared_aliases = [
        ("Program (Facility) Name", "program_or_facility"),
        ("Program Neighborhood", "neighborhood"),
        ("Program Address", "address"),
        ("Program Lat and Long", "geocoordinates"),
        ("Organization Name", "organization_name"),
        ("Category One", "category_one"),
        ("Category Two", "category_two"),
        ("Schedule", "schedule"),
        ("Holiday Exception", "holiday_exception"),
    ];
    let header_rename_map = specific_aliases
        .iter()
        .chain(shared_aliases.iter())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let mut fields = vec![FieldDef::text(name_field)];
    if has_recurrence {
        fields.push(FieldDef::text("recurrence"));
    }
    fields.extend([
        FieldDef::text("program_or_facility"),
        FieldDef::text("neighborhood"),
        FieldDef::text("address"),
        FieldDef::float("latitude"),
        FieldDef::float("longitude"),
        FieldDef::text("organization_name").published_as(ORGANIZATION_PUBLISH_NAME),
        FieldDef::text("category"),
        FieldDef::text("recommended_for"),
        FieldDef::text("requirements"),
        FieldDef::text("phone"),
        FieldDef::text("narrative"),
        FieldDef::text("schedule"),
        FieldDef::text("holiday_exception"),
    ]);

    TableProfile {
        kind,
        header_rename_map,
        required_field: name_field.to_string(),
        geocoordinates: Some(default_geocoordinate_rule()),
        category_fusion: Some(CategoryFusionRule {
            first: "category_one".into(),
            second: "category_two".into(),
            target: "category".into(),
        }),
        fields,
        key_fields,
        resource_name: kind.display_name().to_string(),
        archive_resource_name: format!("{} Archive", kind.display_name()),
        period_archive_name_template: format!("{} {{period}}", kind.display_name()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMethod {
    Insert,
    Upsert,
}

impl fmt::Display for WriteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMethod::Insert => f.write_str("insert"),
            WriteMethod::Upsert => f.write_str("upsert"),
        }
    }
}

/// What the admission policy observed about the cumulative archive for one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArchiveState {
    NoArchiveYet,
    ExistsIncomplete { existing: u64 },
    ExistsSufficient { existing: u64 },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDecision {
    pub should_archive: bool,
    pub method: WriteMethod,
    pub state: ArchiveState,
    pub reason: String,
    pub alert: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("headers `{first}` and `{second}` both map to canonical field `{canonical}`")]
    Collision {
        canonical: String,
        first: String,
        second: String,
    },
    #[error("{kind} extract is missing required column `{column}`")]
    MissingColumn { kind: TableKind, column: String },
    #[error("{kind} extract has no header row")]
    MissingHeader { kind: TableKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed geocoordinate field {raw:?}")]
    MalformedGeocoordinate { raw: String },
    #[error("required field `{field}` is empty")]
    MissingRequiredField { field: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_renders_and_parses_yyyymm() {
        let period = Period::new(2026, 3).unwrap();
        assert_eq!(period.to_string(), "202603");
        assert_eq!("202603".parse::<Period>().unwrap(), period);
        assert!("202613".parse::<Period>().is_err());
        assert!("2026-03".parse::<Period>().is_err());
    }

    #[test]
    fn period_from_date_uses_calendar_month() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(Period::from_date(date).to_string(), "202610");
    }

    #[test]
    fn raw_record_relabel_keeps_position_and_value() {
        let mut record = RawRecord::from_pairs([("Event Name", "Lunch"), ("Schedule", "Mon")]);
        record.relabel(|k| (k == "Event Name").then(|| "event_name".to_string()));
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["event_name", "Schedule"]);
        assert_eq!(record.get("event_name"), Some("Lunch"));
        assert_eq!(record.get("Event Name"), None);
    }

    #[test]
    fn raw_record_relabel_swaps_without_carrying_values() {
        let mut record = RawRecord::from_pairs([("a", "1"), ("b", "2")]);
        record.relabel(|k| match k {
            "a" => Some("b".to_string()),
            "b" => Some("a".to_string()),
            _ => None,
        });
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(record.get("b"), Some("1"));
        assert_eq!(record.get("a"), Some("2"));
    }

    #[test]
    fn archive_schema_adds_period_to_base_fields() {
        let profile = TableProfile::for_kind(TableKind::Events);
        let live = profile.schema(Mode::Live);
        let archive = profile.schema(Mode::Archive);
        assert_eq!(archive.fields.len(), live.fields.len() + 1);
        assert_eq!(archive.fields.last().unwrap().name, PERIOD_FIELD);
        assert!(live.field(PERIOD_FIELD).is_none());
    }

    #[test]
    fn organization_publishes_under_alias() {
        let profile = TableProfile::for_kind(TableKind::Services);
        let schema = profile.schema(Mode::Live);
        let org = schema.field("organization_name").unwrap();
        assert_eq!(org.publish_name, "organization");

        let mut values = BTreeMap::new();
        values.insert("organization_name".to_string(), FieldValue::text("Goodwill"));
        values.insert("service_name".to_string(), FieldValue::text("Meals"));
        let row = CanonicalRecord::from_values(values).to_wire_row(&schema);
        assert_eq!(row.get("organization"), Some(&JsonValue::String("Goodwill".into())));
        assert!(!row.contains_key("organization_name"));
        assert_eq!(row.get("phone"), Some(&JsonValue::Null));
    }

    #[test]
    fn period_resource_name_substitutes_template() {
        let profile = TableProfile::for_kind(TableKind::SafePlaces);
        let period = Period::new(2026, 10).unwrap();
        assert_eq!(profile.period_resource_name(period), "Safe Places 202610");
        assert_eq!(profile.archive_resource_name, "Safe Places Archive");
    }

    #[test]
    fn empty_text_is_null() {
        assert!(FieldValue::text("").is_null());
        assert_eq!(FieldValue::text(" x").as_str(), Some(" x"));
    }

    #[test]
    fn table_kind_parses_cli_spellings() {
        assert_eq!("safe-places".parse::<TableKind>().unwrap(), TableKind::SafePlaces);
        assert_eq!("Events".parse::<TableKind>().unwrap(), TableKind::Events);
        assert!("jobs".parse::<TableKind>().is_err());
    }
}
