//! Resource listing tests over a scripted transport

mod common;

use common::{patrol, ScriptedTransport, END, START};
use patrolflow::client::{SourceQuery, SubjectQuery, DEFAULT_SUBJECT_COLOR};
use patrolflow::transport::QueryParams;
use patrolflow::{ClientConfig, Error, PatrolFilter, TrackingClient};
use serde_json::json;
use std::sync::Arc;

fn client(transport: Arc<ScriptedTransport>) -> TrackingClient<Arc<ScriptedTransport>> {
    TrackingClient::with_transport(ClientConfig::new("https://er.test"), transport)
}

#[tokio::test]
async fn test_get_subjects_resolves_group_name() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_pages("subjectgroups/", vec![vec![json!({"id": "group-1", "name": "Rangers"})]])
            .with_pages(
                "subjects/",
                vec![
                    vec![json!({"id": "s1", "name": "Kibo", "additional": {"rgb": "200, 70, 146"}})],
                    vec![json!({"id": "s2", "name": "Mumbi"})],
                ],
            ),
    );

    let query = SubjectQuery {
        subject_group_name: Some("Rangers".to_string()),
        include_inactive: Some(true),
        ..SubjectQuery::default()
    };
    let subjects = client(transport.clone())
        .get_subjects(&query, &QueryParams::new())
        .await
        .unwrap();

    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0].hex, "#c84692");
    assert_eq!(subjects[1].hex, DEFAULT_SUBJECT_COLOR);

    let groups = transport.calls_to("subjectgroups/");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].params.get("group_name").map(String::as_str), Some("Rangers"));
    assert_eq!(groups[0].params.get("flat").map(String::as_str), Some("true"));

    let listing = transport.calls_to("subjects/");
    assert_eq!(listing[0].params.get("subject_group").map(String::as_str), Some("group-1"));
    assert_eq!(listing[0].params.get("include_inactive").map(String::as_str), Some("true"));
    assert!(!listing[0].params.contains_key("group_name"));
    assert!(!listing[0].params.contains_key("name"));
}

#[tokio::test]
async fn test_get_subjects_unknown_group() {
    let transport = Arc::new(ScriptedTransport::new());
    let query = SubjectQuery {
        subject_group_name: Some("Nobody".to_string()),
        ..SubjectQuery::default()
    };

    let err = client(transport.clone())
        .get_subjects(&query, &QueryParams::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SubjectGroupNotFound(ref name) if name == "Nobody"), "got {:?}", err);
    assert!(transport.calls_to("subjects/").is_empty());
}

#[tokio::test]
async fn test_get_subjects_rejects_group_id_and_name() {
    let transport = Arc::new(ScriptedTransport::new());
    let query = SubjectQuery {
        subject_group_id: Some("group-1".to_string()),
        subject_group_name: Some("Rangers".to_string()),
        ..SubjectQuery::default()
    };

    let err = client(transport.clone())
        .get_subjects(&query, &QueryParams::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidArgument(_)), "got {:?}", err);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_get_sources_flattens_and_sends_extras() {
    let transport = Arc::new(ScriptedTransport::new().with_pages(
        "sources/",
        vec![vec![json!({
            "id": "src-1",
            "provider": "gps",
            "additional": {"collar": {"model": "G5"}},
        })]],
    ));

    let mut extra = QueryParams::new();
    extra.insert("source_type".to_string(), "tracking-device".to_string());
    let query = SourceQuery {
        provider: Some("gps".to_string()),
        ..SourceQuery::default()
    };

    let sources = client(transport.clone()).get_sources(&query, &extra).await.unwrap();

    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].get("additional__collar__model"), Some(&json!("G5")));

    let calls = transport.calls_to("sources/");
    assert_eq!(calls[0].params.get("provider").map(String::as_str), Some("gps"));
    assert_eq!(calls[0].params.get("source_type").map(String::as_str), Some("tracking-device"));
    assert!(!calls[0].params.contains_key("manufacturer_id"));
}

#[tokio::test]
async fn test_get_subjectsources() {
    let transport = Arc::new(ScriptedTransport::new().with_pages(
        "subjectsources/",
        vec![vec![json!({"id": "ss-1", "subject": "s1", "source": "src-1"})]],
    ));

    let rows = client(transport.clone())
        .get_subjectsources(Some("s1"), None, &QueryParams::new())
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    let calls = transport.calls_to("subjectsources/");
    assert_eq!(calls[0].params.get("subjects").map(String::as_str), Some("s1"));
    assert!(!calls[0].params.contains_key("sources"));
}

#[tokio::test]
async fn test_get_patrols_skips_undecodable_records() {
    let transport = Arc::new(ScriptedTransport::new().with_pages(
        "activity/patrols",
        vec![vec![
            patrol("patrol-1", &[(Some("ranger-a"), Some(START), Some(END))]),
            json!({"serial_number": "not a patrol"}),
        ]],
    ));

    let patrols = client(transport).get_patrols(&PatrolFilter::new()).await.unwrap();

    assert_eq!(patrols.len(), 1);
    assert_eq!(patrols[0].id, "patrol-1");
    assert_eq!(patrols[0].segment_queries()[0].subject_id, "ranger-a");
}
