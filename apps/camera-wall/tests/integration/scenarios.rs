use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camera_wall::{
    control::{CommandDispatcher, ControlServer},
    engine::{ElementKind, GraphEvent, PortInfo, VideoCodec},
    stream::{ConsumerEvent, GridLayout, SessionState},
};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::oneshot;

use super::common::{frame_updated, state_changed, TestFixture};

#[tokio::test]
async fn test_h264_camera_end_to_end() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();

    registry.add_stream("cam1", "rtsp://cam1/live").await.unwrap();
    assert_eq!(registry.state_of("cam1").await, Some(SessionState::Starting));
    let graph = fixture.graph("cam1");

    graph.discover_port(PortInfo::video("recv_rtp_src_0_1_96", "H264"));
    assert_eq!(registry.state_of("cam1").await, Some(SessionState::Linked));

    graph.post(GraphEvent::Playing);
    assert_eq!(registry.state_of("cam1").await, Some(SessionState::Running));

    assert!(graph.push_frame(640, 480, 0x40));
    assert_eq!(
        fixture.events.drain(),
        vec![
            ConsumerEvent::StreamAdded("cam1".to_string()),
            state_changed("cam1", "cam1 -> PLAYING"),
            frame_updated("cam1"),
        ]
    );

    let frame = registry.router().latest_frame("cam1").unwrap();
    assert_eq!((frame.width, frame.height), (640, 480));
    assert_eq!(frame.stride, 640 * 4);
    assert!(frame.data.iter().all(|b| *b == 0x40));

    assert!(registry.remove_stream("cam1").await.unwrap());
    assert!(registry.is_empty().await);
    assert!(!graph.push_frame(640, 480, 0x41));
    graph.post(GraphEvent::Error("late".to_string()));
    assert_eq!(
        fixture.events.drain(),
        vec![ConsumerEvent::StreamRemoved("cam1".to_string())]
    );
}

#[tokio::test]
async fn test_audio_only_camera_keeps_negotiating() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();

    registry.add_stream("cam1", "rtsp://cam1/audio").await.unwrap();
    let graph = fixture.graph("cam1");

    graph.discover_port(PortInfo::audio("recv_rtp_src_0_1_0", "PCMA"));
    graph.post(GraphEvent::Playing);

    assert_eq!(
        registry.state_of("cam1").await,
        Some(SessionState::Negotiating)
    );
    let session = registry.session("cam1").await.unwrap();
    assert_eq!(session.linked_codec(), None);
    for codec in VideoCodec::ALL {
        assert_eq!(graph.count_of(ElementKind::Decoder(codec)), 0);
    }
    assert_eq!(
        fixture.events_for("cam1"),
        vec![ConsumerEvent::StreamAdded("cam1".to_string())]
    );
}

#[tokio::test]
async fn test_two_video_ports_link_one_chain() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();

    registry.add_stream("cam1", "rtsp://cam1/live").await.unwrap();
    let graph = fixture.graph("cam1");
    graph.post(GraphEvent::Playing);
    graph.discover_port(PortInfo::video("p0", "H265"));
    graph.discover_port(PortInfo::video("p1", "H264"));

    assert_eq!(registry.state_of("cam1").await, Some(SessionState::Running));
    assert_eq!(graph.port_links(), vec!["p0".to_string()]);
    assert_eq!(graph.count_of(ElementKind::Depayloader(VideoCodec::H264)), 0);
    assert_eq!(graph.count_of(ElementKind::Depayloader(VideoCodec::H265)), 1);
    let playing: Vec<_> = fixture
        .events_for("cam1")
        .into_iter()
        .filter(|e| *e == state_changed("cam1", "cam1 -> PLAYING"))
        .collect();
    assert_eq!(playing.len(), 1);
}

#[tokio::test]
async fn test_back_to_back_frames_coalesce() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();

    registry.add_stream("cam1", "rtsp://cam1/live").await.unwrap();
    let graph = fixture.graph("cam1");
    fixture.events.drain();

    for fill in 1..=5 {
        graph.push_frame(4, 4, fill);
    }
    assert_eq!(fixture.events.drain(), vec![frame_updated("cam1")]);
    assert_eq!(registry.router().latest_frame("cam1").unwrap().data[0], 5);

    graph.push_frame(4, 4, 6);
    assert_eq!(fixture.events.drain(), vec![frame_updated("cam1")]);

    let stats = registry.router().stats("cam1").unwrap();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.replaced, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_notifications_after_remove_under_load() {
    let mut fixture = TestFixture::new();
    let registry = fixture.registry.clone();

    for round in 0..20 {
        registry.add_stream("cam1", "rtsp://cam1/live").await.unwrap();
        let graph = fixture.graph("cam1");
        graph.discover_port(PortInfo::video("p0", "H264"));
        graph.post(GraphEvent::Playing);

        let running = Arc::new(AtomicBool::new(true));
        let delivered = Arc::new(AtomicUsize::new(0));
        let producers: Vec<_> = (0..3)
            .map(|n| {
                let graph = graph.clone();
                let running = running.clone();
                let delivered = delivered.clone();
                std::thread::spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        if graph.push_frame(8, 8, n) {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        graph.post(GraphEvent::Playing);
                    }
                })
            })
            .collect();

        while delivered.load(Ordering::Relaxed) < 10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        registry.remove_stream("cam1").await.unwrap();
        let seen_after_remove: Vec<_> = fixture
            .events_for("cam1")
            .into_iter()
            .skip_while(|e| *e != ConsumerEvent::StreamRemoved("cam1".to_string()))
            .skip(1)
            .collect();
        assert!(
            seen_after_remove.is_empty(),
            "round {}: {:?}",
            round,
            seen_after_remove
        );

        tokio::time::sleep(Duration::from_millis(2)).await;
        running.store(false, Ordering::Relaxed);
        for producer in producers {
            producer.join().unwrap();
        }

        let late: Vec<_> = fixture.events_for("cam1");
        assert!(late.is_empty(), "round {}: late events {:?}", round, late);
    }
}

#[tokio::test]
async fn test_control_socket_drives_registry() {
    let fixture = TestFixture::new();
    let registry = fixture.registry.clone();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("basestation-cameras-ipc");
    std::fs::write(&path, b"left over").unwrap();

    let server = ControlServer::bind(&path, CommandDispatcher::new(registry.clone())).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    let mut client = UnixStream::connect(&path).await.unwrap();
    let records = [
        serde_json::json!({"cmd": "add_stream", "payload": {"id": "front", "url": "rtsp://front"}}),
        serde_json::json!({"cmd": "add_stream", "payload": {"id": "back", "url": "rtsp://back"}}),
        serde_json::json!({"cmd": "add_stream", "payload": {"url": "rtsp://no-id"}}),
        serde_json::json!({"cmd": "grid", "payload": {"rows": 1, "cols": "wide"}}),
        serde_json::json!({"cmd": "self_destruct"}),
        serde_json::json!({"cmd": "remove_stream", "payload": {"id": "front"}}),
        serde_json::json!({"cmd": "grid", "payload": {"cols": 3}}),
    ];
    for record in &records {
        client
            .write_all(format!("{}\n", record).as_bytes())
            .await
            .unwrap();
    }
    client.write_all(b"{\"cmd\": oops\n\n").await.unwrap();
    client.shutdown().await.unwrap();

    for _ in 0..200 {
        if registry.layout().await == (GridLayout { rows: 1, cols: 3 }) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.layout().await, GridLayout { rows: 1, cols: 3 });
    assert_eq!(registry.list().await, vec!["back"]);

    stop_tx.send(()).unwrap();
    server_task.await.unwrap().unwrap();
    assert!(!path.exists());
}
