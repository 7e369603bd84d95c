//! Source column names to canonical field names.

use std::collections::BTreeMap;

use burghfeed_core::{RawRecord, SchemaError, TableProfile};

pub struct HeaderMapper<'a> {
    profile: &'a TableProfile,
}

impl<'a> HeaderMapper<'a> {
    pub fn new(profile: &'a TableProfile) -> Self {
        Self { profile }
    }

    /// Same length and order as `headers`; unknown headers pass through unchanged.
    pub fn map_headers(&self, headers: &[String]) -> Result<Vec<String>, SchemaError> {
        let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();
        let mut mapped = Vec::with_capacity(headers.len());
        for header in headers {
            let canonical = self.profile.canonical_for(header).unwrap_or(header.as_str());
            if let Some(first) = claimed.insert(canonical, header.as_str()) {
                return Err(SchemaError::Collision {
                    canonical: canonical.to_string(),
                    first: first.to_string(),
                    second: header.clone(),
                });
            }
            mapped.push(canonical.to_string());
        }
        Ok(mapped)
    }

    /// Renames the header list and every record's keys together.
    pub fn apply(&self, headers: &mut Vec<String>, records: &mut [RawRecord]) -> Result<(), SchemaError> {
        let mapped = self.map_headers(headers)?;
        // Keyed by the original header, so chained aliases (A to B, B to C) never move a value twice.
        let renames = headers
            .iter()
            .zip(&mapped)
            .filter(|(from, to)| from != to)
            .map(|(from, to)| (from.as_str(), to.as_str()))
            .collect::<BTreeMap<_, _>>();
        for record in records.iter_mut() {
            record.relabel(|key| renames.get(key).map(|to| to.to_string()));
        }
        *headers = mapped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burghfeed_core::TableKind;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn known_aliases_are_replaced_and_order_kept() {
        let profile = TableProfile::for_kind(TableKind::Events);
        let mapper = HeaderMapper::new(&profile);
        let headers = strings(&["Schedule", "Unlisted Column", "Event Name", "Program Lat and Long"]);
        let mapped = mapper.map_headers(&headers).unwrap();
        assert_eq!(
            mapped,
            strings(&["schedule", "Unlisted Column", "event_name", "geocoordinates"])
        );
    }

    #[test]
    fn output_length_always_matches_input() {
        let profile = TableProfile::for_kind(TableKind::Services);
        let mapper = HeaderMapper::new(&profile);
        for headers in [
            strings(&[]),
            strings(&["a"]),
            strings(&["Service Name", "x", "y", "Organization Name"]),
        ] {
            assert_eq!(mapper.map_headers(&headers).unwrap().len(), headers.len());
        }
    }

    #[test]
    fn two_headers_for_one_canonical_name_collide() {
        let profile = TableProfile::for_kind(TableKind::Events);
        let mapper = HeaderMapper::new(&profile);
        let err = mapper
            .map_headers(&strings(&["Event Name", "event_name"]))
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::Collision {
                canonical: "event_name".into(),
                first: "Event Name".into(),
                second: "event_name".into(),
            }
        );
    }

    #[test]
    fn apply_renames_records_with_headers() {
        let profile = TableProfile::for_kind(TableKind::SafePlaces);
        let mapper = HeaderMapper::new(&profile);
        let mut headers = strings(&["Safe Place Name", "Lat and Long", "Notes"]);
        let mut records = vec![RawRecord::from_pairs([
            ("Safe Place Name", "Library"),
            ("Lat and Long", "Lat: 1, Lon: 2"),
            ("Notes", "quiet"),
        ])];
        mapper.apply(&mut headers, &mut records).unwrap();
        assert_eq!(headers, strings(&["safe_place_name", "geocoordinates", "Notes"]));
        assert_eq!(records[0].get("safe_place_name"), Some("Library"));
        assert_eq!(records[0].get("geocoordinates"), Some("Lat: 1, Lon: 2"));
        assert_eq!(records[0].get("Safe Place Name"), None);
        assert_eq!(records[0].get("Notes"), Some("quiet"));
    }

    #[test]
    fn chained_aliases_keep_each_value_with_its_column() {
        let mut profile = TableProfile::for_kind(TableKind::SafePlaces);
        profile.header_rename_map = BTreeMap::from([
            ("Phone".to_string(), "Contact".to_string()),
            ("Contact".to_string(), "contact_name".to_string()),
        ]);
        let mapper = HeaderMapper::new(&profile);
        let mut headers = strings(&["Phone", "Contact"]);
        let mut records = vec![RawRecord::from_pairs([("Phone", "412-555"), ("Contact", "Ann")])];
        mapper.apply(&mut headers, &mut records).unwrap();

        assert_eq!(headers, strings(&["Contact", "contact_name"]));
        assert_eq!(records[0].get("Contact"), Some("412-555"));
        assert_eq!(records[0].get("contact_name"), Some("Ann"));
        assert_eq!(records[0].keys().collect::<Vec<_>>(), vec!["Contact", "contact_name"]);
    }
}
