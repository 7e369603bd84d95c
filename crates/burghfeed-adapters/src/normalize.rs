//! Raw record to canonical record, as an explicit ordered list of steps.

use std::collections::BTreeMap;

use burghfeed_core::{
    CanonicalRecord, CategoryFusionRule, FieldType, FieldValue, GeocoordinateRule, NormalizeError, Period,
    RawRecord, TableProfile,
};

/// One transformation applied to every record of a batch.
pub trait NormalizeStep: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, raw: &RawRecord, out: &mut BTreeMap<String, FieldValue>) -> Result<(), NormalizeError>;
}

/// Copies plain text fields, empty values becoming null.
struct CopyTextFields {
    fields: Vec<String>,
}

impl NormalizeStep for CopyTextFields {
    fn name(&self) -> &'static str {
        "copy_text_fields"
    }

    fn apply(&self, raw: &RawRecord, out: &mut BTreeMap<String, FieldValue>) -> Result<(), NormalizeError> {
        for field in &self.fields {
            out.insert(field.clone(), FieldValue::text(raw.get(field).unwrap_or_default()));
        }
        Ok(())
    }
}

struct RequireNonEmpty {
    field: String,
}

impl NormalizeStep for RequireNonEmpty {
    fn name(&self) -> &'static str {
        "require_non_empty"
    }

    fn apply(&self, raw: &RawRecord, _out: &mut BTreeMap<String, FieldValue>) -> Result<(), NormalizeError> {
        match raw.get(&self.field).map(str::trim) {
            Some(value) if !value.is_empty() => Ok(()),
            _ => Err(NormalizeError::MissingRequiredField {
                field: self.field.clone(),
            }),
        }
    }
}

struct SplitGeocoordinates {
    rule: GeocoordinateRule,
}

impl NormalizeStep for SplitGeocoordinates {
    fn name(&self) -> &'static str {
        "split_geocoordinates"
    }

    fn apply(&self, raw: &RawRecord, out: &mut BTreeMap<String, FieldValue>) -> Result<(), NormalizeError> {
        let (lat, lon) = match split_geocoordinates(raw.get(&self.rule.source).unwrap_or_default())? {
            Some((lat, lon)) => (FieldValue::Float(lat), FieldValue::Float(lon)),
            None => (FieldValue::Null, FieldValue::Null),
        };
        out.insert(self.rule.latitude.clone(), lat);
        out.insert(self.rule.longitude.clone(), lon);
        Ok(())
    }
}

struct FuseCategories {
    rule: CategoryFusionRule,
}

impl NormalizeStep for FuseCategories {
    fn name(&self) -> &'static str {
        "fuse_categories"
    }

    fn apply(&self, raw: &RawRecord, out: &mut BTreeMap<String, FieldValue>) -> Result<(), NormalizeError> {
        let fused = fuse_categories(raw.get(&self.rule.first), raw.get(&self.rule.second));
        out.insert(
            self.rule.target.clone(),
            fused.map(FieldValue::Text).unwrap_or(FieldValue::Null),
        );
        Ok(())
    }
}

/// Splits `"Lat: <num>, Lon: <num>"`. Absent or blank input yields `None`.
///
/// Some historical rows separate the pair with `,,`; that form is tried when a single-comma split
/// does not produce exactly two parts.
pub fn split_geocoordinates(raw: &str) -> Result<Option<(f64, f64)>, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let malformed = || NormalizeError::MalformedGeocoordinate {
        raw: raw.to_string(),
    };

    let mut parts = trimmed.split(',').collect::<Vec<_>>();
    if parts.len() != 2 {
        parts = trimmed.split(",,").collect();
    }
    let [lat, lon] = parts.as_slice() else {
        return Err(malformed());
    };
    let lat = labeled_number(lat, "Lat").ok_or_else(malformed)?;
    let lon = labeled_number(lon, "Lon").ok_or_else(malformed)?;
    Ok(Some((lat, lon)))
}

fn labeled_number(part: &str, expected: &str) -> Option<f64> {
    let (label, value) = part.split_once(':')?;
    if !label.trim().eq_ignore_ascii_case(expected) {
        return None;
    }
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Inverse of [`split_geocoordinates`].
pub fn format_geocoordinates(lat: f64, lon: f64) -> String {
    format!("Lat: {lat}, Lon: {lon}")
}

/// Absent and empty read the same; both present join as `first|second`.
pub fn fuse_categories(first: Option<&str>, second: Option<&str>) -> Option<String> {
    let first = first.filter(|s| !s.is_empty());
    let second = second.filter(|s| !s.is_empty());
    match (first, second) {
        (None, None) => None,
        (Some(one), None) | (None, Some(one)) => Some(one.to_string()),
        (Some(a), Some(b)) => Some(format!("{a}|{b}")),
    }
}

pub struct RecordNormalizer {
    steps: Vec<Box<dyn NormalizeStep>>,
}

impl RecordNormalizer {
    pub fn for_profile(profile: &TableProfile) -> Self {
        let derived = [
            profile.category_fusion.as_ref().map(|r| r.target.as_str()),
            profile.geocoordinates.as_ref().map(|r| r.latitude.as_str()),
            profile.geocoordinates.as_ref().map(|r| r.longitude.as_str()),
        ];
        let text_fields = profile
            .fields
            .iter()
            .filter(|f| f.field_type == FieldType::Text && !derived.contains(&Some(f.name.as_str())))
            .map(|f| f.name.clone())
            .collect();

        let mut steps: Vec<Box<dyn NormalizeStep>> = vec![
            Box::new(RequireNonEmpty {
                field: profile.required_field.clone(),
            }),
            Box::new(CopyTextFields { fields: text_fields }),
        ];
        if let Some(rule) = &profile.geocoordinates {
            steps.push(Box::new(SplitGeocoordinates { rule: rule.clone() }));
        }
        if let Some(rule) = &profile.category_fusion {
            steps.push(Box::new(FuseCategories { rule: rule.clone() }));
        }
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecord, NormalizeError> {
        let mut out = BTreeMap::new();
        for step in &self.steps {
            step.apply(raw, &mut out)?;
        }
        Ok(CanonicalRecord::from_values(out))
    }

    /// Archive-mode copies of `records`, all carrying the same period.
    pub fn stamp_period(records: &[CanonicalRecord], period: Period) -> Vec<CanonicalRecord> {
        records.iter().map(|r| r.stamped(period)).collect()
    }
}
