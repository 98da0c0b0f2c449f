// Integration tests for the stream server over live sessions.

mod common;

use axum::http::{header, StatusCode};

use common::{content, single_file_hash, Harness};
use ma_torrent_engine::engine::{SeedOptions, TorrentHandle};
use ma_torrent_engine::protocol::{Command, Notification, ServerInfo};

/// The server binds loopback in tests; `localhost` may resolve to ::1 first.
fn loopback_url(info: &ServerInfo) -> String {
    info.local_url.replace("localhost", "127.0.0.1")
}

async fn wait_for_server(h: &mut Harness, key: &str) -> ServerInfo {
    let key = key.to_string();
    match h
        .wait_for(|n| matches!(n, Notification::ServerRunning(info) if info.torrent_key == key))
        .await
    {
        Notification::ServerRunning(info) => info,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_stream_serves_ranges() {
    let mut h = Harness::new();
    let data = content(2000);
    let file = h.write_file("movie.mp4", &data);
    h.seed("k1", vec![file]).await;
    h.wait_for(|n| matches!(n, Notification::Ready { .. })).await;

    h.send(Command::StartServer {
        key: "k1".to_string(),
        file_index: 0,
    });
    let info = wait_for_server(&mut h, "k1").await;
    assert!(info.local_url.starts_with("http://localhost:"));
    assert!(info.local_url.ends_with("/0"));
    assert!(info.network_url.ends_with("/0"));

    let client = reqwest::Client::new();
    let url = loopback_url(&info);

    let resp = client
        .get(&url)
        .header(header::RANGE, "bytes=100-199")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        resp.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 100-199/2000"
    );
    assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "video/mp4");
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &data[100..200]);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(&resp.bytes().await.unwrap()[..], &data[..]);

    let resp = client
        .get(&url)
        .header(header::RANGE, "bytes=-10")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&resp.bytes().await.unwrap()[..], &data[1990..]);

    let resp = client
        .get(&url)
        .header(header::RANGE, "bytes=5000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let resp = client.head(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(header::ACCEPT_RANGES).unwrap(), "bytes");

    let resp = client
        .get(url.replace("/0", "/7"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_from_incomplete_session() {
    let mut h = Harness::new();
    let data = content(600);
    let file = h.write_file("song.mp3", &data);
    let hash = h.seed("seed", vec![file]).await;
    let leech = h.leech("k1", &hash).await;
    assert!(leech.bitfield().not_any());

    h.send(Command::StartServer {
        key: "k1".to_string(),
        file_index: 0,
    });
    let info = wait_for_server(&mut h, "k1").await;

    // Pieces under the requested range are pulled on demand.
    let resp = reqwest::Client::new()
        .get(loopback_url(&info))
        .header(header::RANGE, "bytes=300-349")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&resp.bytes().await.unwrap()[..], &data[300..350]);
    assert!(leech.bitfield().any());
    assert!(!leech.bitfield().all());
}

#[tokio::test]
async fn test_second_start_is_ignored() {
    let mut h = Harness::new();
    let a = h.write_file("a.mp4", &content(64));
    let b = h.write_file("b.mp4", &content(96));
    for (key, file) in [("a", a), ("b", b)] {
        h.seed(key, vec![file]).await;
        h.wait_for(|n| matches!(n, Notification::Ready { key: k, .. } if k == key))
            .await;
    }

    let controller = h.worker.controller.clone();
    controller.start_server("a", 0).await.unwrap();
    wait_for_server(&mut h, "a").await;

    controller.start_server("b", 0).await.unwrap();
    let status = controller.servers().status().await.unwrap();
    assert_eq!(status.key, "a");
    assert_eq!(status.file_index, 0);
    assert!(!h
        .drain()
        .iter()
        .any(|n| matches!(n, Notification::ServerRunning(_))));

    controller.stop_server().await;
    assert!(controller.servers().status().await.is_none());

    // Stopping again from idle changes nothing.
    controller.stop_server().await;
    assert!(controller.servers().status().await.is_none());
}

#[tokio::test]
async fn test_start_waits_until_ready() {
    let mut h = Harness::new();
    let data = content(80);
    let hash = single_file_hash("late.mkv", data.len() as u64);

    h.send(Command::StartSession {
        key: "k1".to_string(),
        identifier: hash,
        path: h.dir.path().join("downloads"),
        file_mod_times: Vec::new(),
    });
    h.wait_for(|n| matches!(n, Notification::ContentHashResolved { .. }))
        .await;

    let controller = h.worker.controller.clone();
    controller.start_server("k1", 0).await.unwrap();
    assert!(controller.servers().has_pending("k1"));
    assert!(controller.servers().status().await.is_none());

    // A seeder appearing makes the session ready, which releases the start.
    let file = h.write_file("late.mkv", &data);
    h.send(Command::CreateAndSeed {
        key: "seed".to_string(),
        options: SeedOptions {
            files: vec![file],
            ..SeedOptions::default()
        },
    });
    let info = wait_for_server(&mut h, "k1").await;
    assert!(!controller.servers().has_pending("k1"));
    assert_eq!(controller.servers().status().await.unwrap().key, "k1");

    let resp = reqwest::get(loopback_url(&info)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "video/x-matroska"
    );
    assert_eq!(&resp.bytes().await.unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_stopped_session_is_not_served() {
    let mut h = Harness::new();
    let file = h.write_file("a.mp4", &content(64));
    h.seed("k1", vec![file]).await;
    h.wait_for(|n| matches!(n, Notification::Ready { .. })).await;

    let controller = h.worker.controller.clone();
    controller.start_server("k1", 0).await.unwrap();
    let info = wait_for_server(&mut h, "k1").await;

    controller.stop_session("k1").await.unwrap();
    let resp = reqwest::get(loopback_url(&info)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_server_unknown_key() {
    let mut h = Harness::new();
    h.send(Command::StartServer {
        key: "missing".to_string(),
        file_index: 0,
    });
    let error = h
        .wait_for(|n| matches!(n, Notification::Error { .. }))
        .await;
    assert!(matches!(error, Notification::Error { key: Some(ref k), .. } if k == "missing"));
    assert!(h.worker.controller.servers().status().await.is_none());
}
