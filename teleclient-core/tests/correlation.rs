use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;

use teleclient_core::clock::ManualClock;
use teleclient_core::host::WORK_FAILED;
use teleclient_core::model::ItemKind;
use teleclient_core::{
    HostRunner, InMemoryPublisher, SeverityLevel, TelemetryClient, TelemetryData,
    TelemetryOperation, TelemetryPublisher, TelemetryTags,
};

fn client_with_sink() -> (TelemetryClient, Arc<InMemoryPublisher>) {
    let sink = Arc::new(InMemoryPublisher::new("mem"));
    let publishers: Vec<Arc<dyn TelemetryPublisher>> = vec![sink.clone()];
    (TelemetryClient::new(publishers, TelemetryTags::new()), sink)
}

#[tokio::test]
async fn nested_scopes_chain_parent_ids() {
    let (client, sink) = client_with_sink();
    client.set_operation(TelemetryOperation::new("root").with_name("ProcessOrder"));

    let a = client.activity_scope_begin("scope-a");
    client.track_trace("in a", SeverityLevel::Information, None);
    let b = client.activity_scope_begin("scope-b");
    client.track_trace("in b", SeverityLevel::Information, None);
    client.activity_scope_end(b);
    client.track_trace("back in a", SeverityLevel::Information, None);
    client.activity_scope_end(a);
    client.track_trace("after a", SeverityLevel::Information, None);

    client.publish(&Default::default()).await;
    let items = sink.items();
    let ids: Vec<_> = items
        .iter()
        .map(|i| (i.operation_id(), i.operation_parent_id()))
        .collect();
    assert_eq!(
        ids,
        vec![
            (Some("scope-a"), Some("root")),
            (Some("scope-b"), Some("scope-a")),
            (Some("scope-a"), Some("root")),
            (Some("root"), None),
        ]
    );
    assert!(items.iter().all(|i| i.tags.operation_name() == Some("ProcessOrder")));
}

#[test]
fn duration_ignores_wall_clock_skew() {
    let clock = Arc::new(ManualClock::default());
    let (client, _) = client_with_sink();
    let client = client.with_clock(clock.clone());

    let token = client.activity_scope_begin("work");
    clock.advance(Duration::from_millis(250));
    clock.skew_wall(chrono::Duration::hours(-3));
    let duration = client.activity_scope_end(token);

    assert_eq!(duration, Duration::from_millis(250));
}

#[test]
fn duplicate_end_leaves_open_sibling_alone() {
    let (client, _) = client_with_sink();
    let outer = client.activity_scope_begin("outer");
    let inner = client.activity_scope_begin("inner");

    // ending the outer scope while the inner one is open is a caller bug
    let _ = client.activity_scope_end(outer);
    assert_eq!(client.operation().id, "inner");

    let _ = client.activity_scope_end(inner);
    assert_eq!(client.operation().id, "outer");
}

#[tokio::test]
async fn failing_host_work_links_exception_and_request() {
    let (client, sink) = client_with_sink();
    let runner = HostRunner::new(
        Arc::new(client),
        Url::parse("https://plugin.example.com/execute").unwrap(),
    )
    .with_request_name("ApproveInvoice");

    let exec = runner
        .execute(|client| -> anyhow::Result<()> {
            client.track_trace("validating", SeverityLevel::Verbose, None);
            anyhow::bail!("invoice total is negative")
        })
        .await;

    // the error comes back only after publishing finished
    assert!(exec.publish.all_succeeded());
    let err = exec.result.unwrap_err();
    assert_eq!(err.to_string(), WORK_FAILED);
    assert_eq!(err.root_cause().to_string(), "invoice total is negative");

    let items = sink.items();
    let exceptions: Vec<_> = items.iter().filter(|i| i.kind() == ItemKind::Exception).collect();
    let requests: Vec<_> = items.iter().filter(|i| i.kind() == ItemKind::Request).collect();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(requests.len(), 1);
    assert_eq!(exceptions[0].operation_id(), Some(exec.request_id.as_str()));
    assert_eq!(requests[0].operation_id(), Some(exec.request_id.as_str()));

    match &requests[0].data {
        TelemetryData::Request {
            response_code,
            success,
            name,
            ..
        } => {
            assert_eq!(response_code, "1");
            assert!(!success);
            assert_eq!(name.as_deref(), Some("ApproveInvoice"));
        }
        other => panic!("expected request, got {other:?}"),
    }
    match &exceptions[0].data {
        TelemetryData::Exception { details } => {
            assert_eq!(details.message, "invoice total is negative");
        }
        other => panic!("expected exception, got {other:?}"),
    }
}
