use std::sync::Arc;

use uuid::Uuid;

use crate::auth::{BearerTokenProvider, TokenSource};
use crate::client::TelemetryClient;
use crate::config::ClientConfig;
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::publisher::TelemetryPublisher;
use crate::publishers::HttpTelemetryPublisher;
use crate::tags::TelemetryTags;

/// Build a client with one HTTP publisher per configured destination.
///
/// Authenticated publishers each get their own token provider, backed by the
/// source `token_sources` returns for the publisher's managed identity.
/// Default tags are the configured ones overlaid with `tags`.
pub fn create_telemetry_client<F>(
    config: &ClientConfig,
    http: HttpClient,
    token_sources: F,
    tags: Option<TelemetryTags>,
) -> CoreResult<TelemetryClient>
where
    F: Fn(Option<Uuid>) -> Arc<dyn TokenSource>,
{
    config.validate()?;

    let mut publishers: Vec<Arc<dyn TelemetryPublisher>> = Vec::with_capacity(config.publishers.len());
    for p in &config.publishers {
        let url = p.endpoint_url()?;
        let mut publisher = HttpTelemetryPublisher::new(http.clone(), &url, p.instrumentation_key)
            .with_max_batch_items(config.http.max_batch_items);
        if let Some(t) = &p.tags {
            publisher = publisher.with_tags(TelemetryTags::from(t.clone()));
        }
        if p.authenticate {
            let provider = BearerTokenProvider::new(
                p.instrumentation_key.to_string(),
                token_sources(p.managed_identity_id),
                p.managed_identity_id,
            );
            publisher = publisher.with_token_provider(provider);
        }
        tracing::debug!(
            publisher = %p.instrumentation_key,
            endpoint = %url,
            authenticate = p.authenticate,
            "registered telemetry publisher"
        );
        publishers.push(Arc::new(publisher));
    }

    let defaults = config
        .tags
        .clone()
        .map(TelemetryTags::from)
        .unwrap_or_default();
    let defaults = match &tags {
        Some(overlay) => defaults.merged(overlay),
        None => defaults,
    };
    Ok(TelemetryClient::new(publishers, defaults))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::config::{HttpCfg, PublisherConfig};
    use crate::error::TelemetryError;
    use crate::tags::keys;
    use std::cell::RefCell;

    fn publisher(authenticate: bool, key: &str, identity: Option<&str>) -> PublisherConfig {
        PublisherConfig {
            authenticate,
            ingestion_endpoint: "https://ingest.example.com/".into(),
            instrumentation_key: Uuid::parse_str(key).unwrap(),
            managed_identity_id: identity.map(|s| Uuid::parse_str(s).unwrap()),
            tags: None,
        }
    }

    #[test]
    fn builds_one_publisher_per_entry_and_asks_for_identity_sources() {
        let cfg = ClientConfig {
            publishers: vec![
                publisher(
                    true,
                    "11111111-1111-1111-1111-111111111111",
                    Some("22222222-2222-2222-2222-222222222222"),
                ),
                publisher(false, "33333333-3333-3333-3333-333333333333", None),
            ],
            tags: Some([(keys::CLOUD_ROLE.to_string(), "worker".to_string())].into()),
            http: HttpCfg::default(),
        };
        let asked = RefCell::new(Vec::new());
        let client = create_telemetry_client(
            &cfg,
            HttpClient::new_default().unwrap(),
            |identity| {
                asked.borrow_mut().push(identity);
                Arc::new(StaticTokenSource::new("t")) as Arc<dyn TokenSource>
            },
            Some(TelemetryTags::from_pairs([(keys::CLOUD_ROLE_INSTANCE, "host-1")])),
        )
        .unwrap();

        assert_eq!(
            client.publisher_names(),
            vec![
                "11111111-1111-1111-1111-111111111111@ingest.example.com",
                "33333333-3333-3333-3333-333333333333@ingest.example.com"
            ]
        );
        assert_eq!(
            *asked.borrow(),
            vec![Some(Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap())]
        );
        let tags = client.tags();
        assert_eq!(tags.cloud_role(), Some("worker"));
        assert_eq!(tags.cloud_role_instance(), Some("host-1"));
    }

    #[test]
    fn invalid_config_is_fatal() {
        let cfg = ClientConfig {
            publishers: vec![],
            tags: None,
            http: HttpCfg::default(),
        };
        let err = create_telemetry_client(
            &cfg,
            HttpClient::new_default().unwrap(),
            |_| Arc::new(StaticTokenSource::new("t")) as Arc<dyn TokenSource>,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TelemetryError::Configuration(_)));
    }
}
