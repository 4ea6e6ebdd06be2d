use std::collections::BTreeMap;
use std::{fs, path::Path};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreResult, TelemetryError};

/// One ingestion destination.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublisherConfig {
    /// Whether requests carry a bearer token.
    #[serde(default)]
    pub authenticate: bool,
    pub ingestion_endpoint: String,
    pub instrumentation_key: Uuid,
    /// Identity to request tokens for. None = the default identity.
    #[serde(default)]
    pub managed_identity_id: Option<Uuid>,
    /// Tags applied to everything this publisher sends.
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
}

impl PublisherConfig {
    /// Parsed endpoint. Fails for anything but an absolute http(s) URL.
    pub fn endpoint_url(&self) -> CoreResult<Url> {
        let url = Url::parse(&self.ingestion_endpoint).map_err(|e| {
            TelemetryError::Configuration(format!(
                "invalid ingestion endpoint '{}': {e}",
                self.ingestion_endpoint
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TelemetryError::Configuration(format!(
                "ingestion endpoint '{}' must use http or https",
                self.ingestion_endpoint
            )));
        }
        Ok(url)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    /// Items per ingestion request; larger batches are split by count.
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
            max_batch_items: default_max_batch_items(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_max_batch_items() -> usize {
    512
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub publishers: Vec<PublisherConfig>,
    /// Default tags for every item the client tracks.
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
    /// HTTP client configuration (timeouts, pooling, batching). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl ClientConfig {
    /// Load a config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(TelemetryError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| {
            TelemetryError::Configuration(format!("{} is not valid UTF-8: {e}", path.display()))
        })?;
        let parse_json = |s: &str| {
            serde_json::from_str::<Self>(s).map_err(|e| {
                TelemetryError::Configuration(format!("cannot parse {}: {e}", path.display()))
            })
        };
        let parse_toml = |s: &str| {
            toml::from_str::<Self>(s).map_err(|e| {
                TelemetryError::Configuration(format!("cannot parse {}: {e}", path.display()))
            })
        };
        let cfg = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => parse_json(s)?,
            Some("toml") => parse_toml(s)?,
            _ => parse_json(s).or_else(|_| parse_toml(s))?,
        };
        Ok(cfg)
    }

    /// Parse a JSON document handed over by an external configuration store.
    pub fn from_json_str(s: &str) -> CoreResult<Self> {
        serde_json::from_str::<Self>(s).map_err(|e| {
            TelemetryError::Configuration(format!("cannot deserialize client configuration: {e}"))
        })
    }

    /// Reject configurations the client cannot be built from.
    pub fn validate(&self) -> CoreResult<()> {
        if self.publishers.is_empty() {
            return Err(TelemetryError::Configuration(
                "at least one publisher must be configured".into(),
            ));
        }
        if self.http.max_batch_items == 0 {
            return Err(TelemetryError::Configuration(
                "maxBatchItems must be greater than zero".into(),
            ));
        }
        for (i, p) in self.publishers.iter().enumerate() {
            p.endpoint_url()?;
            if p.instrumentation_key.is_nil() {
                return Err(TelemetryError::Configuration(format!(
                    "publisher {i}: instrumentation key must not be the nil UUID"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const JSON: &str = r#"{
      "publishers": [
        {
          "authenticate": true,
          "ingestionEndpoint": "https://ingest.example.com/",
          "instrumentationKey": "11111111-1111-1111-1111-111111111111",
          "managedIdentityId": "22222222-2222-2222-2222-222222222222"
        },
        {
          "ingestionEndpoint": "https://other.example.com/",
          "instrumentationKey": "33333333-3333-3333-3333-333333333333",
          "tags": {"env": "test"}
        }
      ],
      "tags": {"ai.cloud.role": "worker"}
    }"#;

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("telemetry.json");
        fs::write(&file, JSON).unwrap();
        let cfg = ClientConfig::from_path(&file).unwrap();
        assert_eq!(cfg.publishers.len(), 2);
        assert!(cfg.publishers[0].authenticate);
        assert!(!cfg.publishers[1].authenticate);
        assert!(cfg.publishers[0].managed_identity_id.is_some());
        assert_eq!(
            cfg.publishers[1].tags.as_ref().unwrap().get("env").map(String::as_str),
            Some("test")
        );
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
        assert_eq!(cfg.http.max_batch_items, 512);
        cfg.validate().unwrap();
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("telemetry.toml");
        let toml = r#"
[[publishers]]
authenticate = false
ingestionEndpoint = "http://localhost:8080/"
instrumentationKey = "33333333-3333-3333-3333-333333333333"

[http]
maxBatchItems = 10
"#;
        fs::write(&file, toml).unwrap();
        let cfg = ClientConfig::from_path(&file).unwrap();
        assert_eq!(cfg.publishers.len(), 1);
        assert_eq!(cfg.http.max_batch_items, 10);
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/teleclient-missing.json");
        let err = ClientConfig::from_path(&missing).unwrap_err();
        match err {
            TelemetryError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_utf8_returns_configuration_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.bin");
        fs::write(&file, vec![0xff, 0xfe, 0xfd, 0x00, 0x80]).unwrap();
        let err = ClientConfig::from_path(&file).unwrap_err();
        assert!(matches!(err, TelemetryError::Configuration(_)));
    }

    #[test]
    fn file_missing_instrumentation_key_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let json = dir.path().join("bad.json");
        fs::write(&json, r#"{"publishers":[{"ingestionEndpoint":"https://a/"}]}"#).unwrap();
        let err = ClientConfig::from_path(&json).unwrap_err();
        assert!(matches!(err, TelemetryError::Configuration(_)), "got {err:?}");
        assert!(err.to_string().contains("instrumentationKey"));

        let toml = dir.path().join("bad.toml");
        fs::write(&toml, "[[publishers]]\ningestionEndpoint = \"https://a/\"\n").unwrap();
        let err = ClientConfig::from_path(&toml).unwrap_err();
        assert!(matches!(err, TelemetryError::Configuration(_)), "got {err:?}");
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("a.conf");
        fs::write(&json_path, JSON).unwrap();
        assert_eq!(ClientConfig::from_path(&json_path).unwrap().publishers.len(), 2);

        let toml_path = dir.path().join("b.conf");
        fs::write(
            &toml_path,
            r#"
[[publishers]]
ingestionEndpoint = "https://x.example.com/"
instrumentationKey = "33333333-3333-3333-3333-333333333333"
"#,
        )
        .unwrap();
        let cfg = ClientConfig::from_path(&toml_path).unwrap();
        assert_eq!(cfg.publishers[0].ingestion_endpoint, "https://x.example.com/");
    }

    #[test]
    fn from_json_str_maps_to_configuration_error() {
        let err = ClientConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, TelemetryError::Configuration(_)));
        let err = ClientConfig::from_json_str(r#"{"publishers":[{"ingestionEndpoint":"https://a/"}]}"#)
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Configuration(_)));
    }

    fn publisher(endpoint: &str, key: Uuid) -> PublisherConfig {
        PublisherConfig {
            authenticate: false,
            ingestion_endpoint: endpoint.into(),
            instrumentation_key: key,
            managed_identity_id: None,
            tags: None,
        }
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let empty = ClientConfig {
            publishers: vec![],
            tags: None,
            http: HttpCfg::default(),
        };
        assert!(matches!(empty.validate(), Err(TelemetryError::Configuration(_))));

        let bad_scheme = ClientConfig {
            publishers: vec![publisher("ftp://x/", Uuid::new_v4())],
            tags: None,
            http: HttpCfg::default(),
        };
        assert!(matches!(bad_scheme.validate(), Err(TelemetryError::Configuration(_))));

        let relative = ClientConfig {
            publishers: vec![publisher("/v2/track", Uuid::new_v4())],
            tags: None,
            http: HttpCfg::default(),
        };
        assert!(matches!(relative.validate(), Err(TelemetryError::Configuration(_))));

        let nil_key = ClientConfig {
            publishers: vec![publisher("https://x/", Uuid::nil())],
            tags: None,
            http: HttpCfg::default(),
        };
        assert!(matches!(nil_key.validate(), Err(TelemetryError::Configuration(_))));

        let zero_batch = ClientConfig {
            publishers: vec![publisher("https://x/", Uuid::new_v4())],
            tags: None,
            http: HttpCfg {
                max_batch_items: 0,
                ..HttpCfg::default()
            },
        };
        assert!(matches!(zero_batch.validate(), Err(TelemetryError::Configuration(_))));
    }
}
