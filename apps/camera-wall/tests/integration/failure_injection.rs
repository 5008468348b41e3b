use camera_wall::{
    engine::{ElementKind, GraphEvent, PortInfo, VideoCodec},
    stream::SessionState,
};

use super::common::{state_changed, TestFixture};

#[tokio::test]
async fn test_construction_failure_is_isolated() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();

    registry.add_stream("good", "rtsp://good").await.unwrap();
    fixture.engine.fail_element(ElementKind::Converter);
    registry.add_stream("bad", "rtsp://bad").await.unwrap();
    fixture.engine.restore_element(ElementKind::Converter);

    assert_eq!(
        registry.state_of("bad").await,
        Some(SessionState::Error("Failed to create elements".to_string()))
    );
    assert_eq!(registry.state_of("good").await, Some(SessionState::Starting));
    assert!(fixture
        .events_for("bad")
        .contains(&state_changed("bad", "Failed to create elements")));

    let good = fixture.graph("good");
    good.discover_port(PortInfo::video("p0", "H264"));
    good.post(GraphEvent::Playing);
    assert_eq!(registry.state_of("good").await, Some(SessionState::Running));

    assert!(registry.remove_stream("bad").await.unwrap());
    assert_eq!(registry.list().await, vec!["good"]);
}

#[tokio::test]
async fn test_missing_decoder_then_other_codec() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();
    fixture
        .engine
        .fail_element(ElementKind::Decoder(VideoCodec::H265));

    registry.add_stream("cam1", "rtsp://cam1").await.unwrap();
    let graph = fixture.graph("cam1");
    graph.discover_port(PortInfo::video("p0", "H265"));
    assert_eq!(
        registry.state_of("cam1").await,
        Some(SessionState::Negotiating)
    );

    graph.discover_port(PortInfo::video("p1", "H264"));
    assert_eq!(registry.state_of("cam1").await, Some(SessionState::Linked));

    let statuses: Vec<_> = fixture.events_for("cam1");
    assert!(statuses.contains(&state_changed("cam1", "Link failure")));
}

#[tokio::test]
async fn test_runtime_error_then_remove() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();

    registry.add_stream("cam1", "rtsp://cam1").await.unwrap();
    let graph = fixture.graph("cam1");
    graph.discover_port(PortInfo::video("p0", "H264"));
    graph.post(GraphEvent::Playing);
    graph.post(GraphEvent::Error("Could not read from resource.".to_string()));

    assert_eq!(
        registry.state_of("cam1").await,
        Some(SessionState::Error(
            "Error: Could not read from resource.".to_string()
        ))
    );
    assert!(fixture
        .events_for("cam1")
        .contains(&state_changed("cam1", "Error: Could not read from resource.")));

    // The error is absorbing: later engine events change nothing.
    graph.post(GraphEvent::Playing);
    graph.post(GraphEvent::EndOfStream);
    assert!(matches!(
        registry.state_of("cam1").await,
        Some(SessionState::Error(_))
    ));

    assert!(registry.remove_stream("cam1").await.unwrap());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_refused_start_can_be_retried_after_remove() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();

    fixture.engine.fail_start(true);
    registry.add_stream("cam1", "rtsp://cam1").await.unwrap();
    assert!(fixture
        .events_for("cam1")
        .contains(&state_changed("cam1", "Failed to start pipeline")));

    fixture.engine.fail_start(false);
    registry.remove_stream("cam1").await.unwrap();
    registry.add_stream("cam1", "rtsp://cam1").await.unwrap();
    assert_eq!(registry.state_of("cam1").await, Some(SessionState::Starting));
    assert_eq!(fixture.engine.graphs().len(), 2);
}
