/// Location manifest loading.
///
/// The manifest is the single source of truth for which location ids are
/// valid during a run. It is a JSON array of `{id, x, y}` records, read
/// once before ingestion starts, either from a local file or downloaded from
/// an object-storage bucket over HTTPS.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use crate::config::ManifestConfig;
use crate::logging::{self, Component};
use crate::model::MonitorError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// An identifier that upstream producers send either as a JSON string or as
/// a JSON number. Both normalize to the same string key.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Ident {
    Text(String),
    Int(i64),
    Float(f64),
}

impl Ident {
    pub fn into_key(self) -> String {
        match self {
            Ident::Text(s) => s,
            Ident::Int(n) => n.to_string(),
            Ident::Float(f) => f.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest records
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawLocationRecord {
    id: Ident,
    x: f64,
    y: f64,
}

/// One fixed sensor location from the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRecord {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

/// Parses and validates manifest JSON.
///
/// Order is preserved; it becomes the column order of the exported report.
/// Duplicate ids and non-finite coordinates are manifest errors.
pub fn parse_manifest(json: &str) -> Result<Vec<LocationRecord>, MonitorError> {
    let raw: Vec<RawLocationRecord> = serde_json::from_str(json)
        .map_err(|e| MonitorError::Manifest(format!("invalid manifest JSON: {}", e)))?;

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(raw.len());
    for entry in raw {
        let id = entry.id.into_key();
        if !entry.x.is_finite() || !entry.y.is_finite() {
            return Err(MonitorError::Manifest(format!(
                "location '{}' has non-finite coordinates",
                id
            )));
        }
        if !seen.insert(id.clone()) {
            return Err(MonitorError::Manifest(format!("duplicate location id '{}'", id)));
        }
        records.push(LocationRecord { id, x: entry.x, y: entry.y });
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Builds the virtual-hosted HTTPS URL for an object in a storage bucket.
pub fn build_object_url(bucket: &str, region: &str, key: &str) -> String {
    format!(
        "https://{}.s3.{}.amazonaws.com/{}",
        bucket,
        region,
        key.trim_start_matches('/')
    )
}

/// Downloads manifest text from `url`.
pub fn fetch_manifest_text(
    client: &reqwest::blocking::Client,
    url: &str,
) -> Result<String, MonitorError> {
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .send()?;

    if !response.status().is_success() {
        return Err(MonitorError::Http(response.status().as_u16()));
    }

    Ok(response.text()?)
}

/// Loads the manifest from whichever source the configuration names.
pub fn load_manifest(config: &ManifestConfig) -> Result<Vec<LocationRecord>, MonitorError> {
    let text = if let Some(path) = &config.path {
        logging::info(Component::Manifest, None, &format!("Reading manifest from {}", path));
        fs::read_to_string(path)
            .map_err(|e| MonitorError::Manifest(format!("cannot read {}: {}", path, e)))?
    } else {
        let url = match (&config.url, &config.bucket) {
            (Some(url), _) => url.clone(),
            (None, Some(bucket)) => build_object_url(bucket, &config.region, &config.key),
            (None, None) => {
                return Err(MonitorError::Manifest("no manifest source configured".into()));
            }
        };
        logging::info(Component::Manifest, None, &format!("Downloading manifest from {}", url));
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        fetch_manifest_text(&client, &url)?
    };

    let records = parse_manifest(&text)?;
    if records.is_empty() {
        logging::warn(Component::Manifest, None, "Manifest contains no locations; every event will be rejected");
    } else {
        logging::info(Component::Manifest, None, &format!("Loaded {} locations", records.len()));
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest_preserves_order() {
        let json = r#"[
            {"id": "L2", "x": 10.0, "y": 10.0},
            {"id": "L1", "x": 0, "y": 0}
        ]"#;
        let records = parse_manifest(json).expect("valid manifest");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "L2");
        assert_eq!(records[1], LocationRecord { id: "L1".into(), x: 0.0, y: 0.0 });
    }

    #[test]
    fn test_numeric_ids_are_normalized_to_strings() {
        let json = r#"[{"id": 42, "x": 1.5, "y": -2.0}]"#;
        let records = parse_manifest(json).expect("numeric id should be accepted");
        assert_eq!(records[0].id, "42");
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let json = r#"[{"id": "A", "x": 0, "y": 0}, {"id": "A", "x": 1, "y": 1}]"#;
        let result = parse_manifest(json);
        assert!(
            matches!(result, Err(MonitorError::Manifest(ref msg)) if msg.contains("duplicate")),
            "expected duplicate-id error, got {:?}",
            result
        );
    }

    #[test]
    fn test_missing_coordinate_is_rejected() {
        let json = r#"[{"id": "A", "x": 0}]"#;
        assert!(matches!(parse_manifest(json), Err(MonitorError::Manifest(_))));
    }

    #[test]
    fn test_not_an_array_is_rejected() {
        assert!(parse_manifest(r#"{"id": "A"}"#).is_err());
    }

    #[test]
    fn test_empty_manifest_is_valid() {
        assert_eq!(parse_manifest("[]").unwrap(), Vec::new());
    }

    #[test]
    fn test_build_object_url() {
        assert_eq!(
            build_object_url("sensor-manifests", "eu-west-1", "locations-part2.json"),
            "https://sensor-manifests.s3.eu-west-1.amazonaws.com/locations-part2.json"
        );
        assert_eq!(
            build_object_url("b", "us-east-2", "/nested/key.json"),
            "https://b.s3.us-east-2.amazonaws.com/nested/key.json"
        );
    }

    #[test]
    fn test_load_manifest_from_file() {
        let path = std::env::temp_dir().join(format!("event_monitor_manifest_{}.json", std::process::id()));
        fs::write(&path, r#"[{"id": "L1", "x": 0, "y": 0}]"#).unwrap();
        let config = ManifestConfig {
            path: Some(path.to_string_lossy().into_owned()),
            ..ManifestConfig::default()
        };
        let records = load_manifest(&config).expect("manifest file should load");
        assert_eq!(records.len(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_manifest_missing_file_is_manifest_error() {
        let config = ManifestConfig {
            path: Some("/nonexistent/locations.json".into()),
            ..ManifestConfig::default()
        };
        assert!(matches!(load_manifest(&config), Err(MonitorError::Manifest(_))));
    }
}
