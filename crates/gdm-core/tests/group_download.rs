//! End-to-end: a download group over libcurl against a local range server.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::range_server::{RangeServer, ServerOptions};
use gdm_core::config::GroupConfig;
use gdm_core::event::Notification;
use gdm_core::storage;
use gdm_core::transport::{BodySink, CurlOptions, CurlTransport, Flow, ResponseHead, Transport};
use gdm_core::{DownloadError, DownloadGroup, GroupManager, Task, TaskState};
use tempfile::tempdir;

fn body(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn transport() -> Arc<CurlTransport> {
    Arc::new(CurlTransport::new(CurlOptions {
        connect_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_secs(5),
        ..CurlOptions::default()
    }))
}

fn group(limit: usize) -> DownloadGroup {
    let mut config = GroupConfig::new(limit);
    config.sample_interval = Duration::from_millis(20);
    DownloadGroup::with_transport(config, transport())
}

fn wait_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn wait_finished(task: &Task) {
    wait_until(task.url(), || task.state().is_finished());
}

fn assert_file(path: &Path, expected: &[u8]) {
    let got = std::fs::read(path).unwrap();
    assert_eq!(got.len(), expected.len(), "size of {}", path.display());
    assert!(got == expected, "content of {}", path.display());
    assert!(!storage::temp_path(path).exists(), "temp left behind for {}", path.display());
}

#[test]
fn group_downloads_every_file() {
    let files: Vec<(String, Vec<u8>)> = (0..5)
        .map(|i| (format!("/f{i}.bin"), body(40 * 1024 + i * 7, i as u8)))
        .collect();
    let server = RangeServer::start(
        files.iter().map(|(p, b)| (p.as_str(), b.clone())).collect(),
        ServerOptions::default(),
    );
    let dir = tempdir().unwrap();
    let g = group(2);
    let tasks: Vec<_> = files
        .iter()
        .map(|(p, _)| {
            g.submit(server.url(p), dir.path().join(p.trim_start_matches('/')))
                .unwrap()
        })
        .collect();
    g.start().unwrap();

    for t in &tasks {
        wait_finished(t);
    }
    assert!(g.is_all_successful());
    assert_eq!(g.total_progress(), 100.0);
    for (t, (_, expected)) in tasks.iter().zip(&files) {
        assert_eq!(t.state(), TaskState::Success);
        assert_file(t.local_path(), expected);
    }
    wait_until("in-flight drained", || g.in_flight_tasks().is_empty());
}

#[test]
fn stopped_download_resumes_from_partial_file() {
    let expected = body(64 * 1024, 3);
    let server = RangeServer::start(
        vec![("/big.iso", expected.clone())],
        ServerOptions {
            throttle: Some((1024, Duration::from_millis(20))),
            ..ServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();
    let dest = dir.path().join("big.iso");
    let g = group(1);
    let task = g.submit(server.url("/big.iso"), &dest).unwrap();
    g.start().unwrap();

    wait_until("some progress", || task.progress() > 10.0);
    g.stop_group().unwrap();
    wait_until("stopped", || task.state() == TaskState::Stopped);
    let partial = std::fs::metadata(storage::temp_path(&dest)).unwrap().len();
    assert!(partial > 0 && partial < expected.len() as u64);
    assert_eq!(g.waiting_tasks().len(), 1);

    g.start().unwrap();
    wait_finished(&task);
    assert_eq!(task.state(), TaskState::Success);
    assert_file(&dest, &expected);

    let gets = server.gets("/big.iso");
    assert_eq!(gets.first().and_then(|r| r.range_start), Some(0));
    assert!(
        gets.iter().skip(1).any(|r| r.range_start.unwrap_or(0) >= partial),
        "resumed request should start past the kept bytes: {gets:?}"
    );
}

#[test]
fn zero_length_resource_fails_without_get() {
    let server = RangeServer::start(vec![("/empty", Vec::new())], ServerOptions::default());
    let dir = tempdir().unwrap();
    let g = group(1);
    let task = g.submit(server.url("/empty"), dir.path().join("empty")).unwrap();
    let mut states = task.state_stream();
    g.start().unwrap();
    wait_finished(&task);

    assert_eq!(task.state(), TaskState::Error);
    assert!(server.gets("/empty").is_empty());
    let terminal = std::iter::from_fn(|| states.recv_timeout(Duration::from_secs(5)))
        .find(|n| n.is_terminal());
    match terminal {
        Some(Notification::Failed(e)) => {
            assert!(matches!(*e, DownloadError::EmptyContent { .. }))
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn missing_resource_is_an_error() {
    let server = RangeServer::start(vec![], ServerOptions::default());
    let dir = tempdir().unwrap();
    let g = group(1);
    let task = g.submit(server.url("/nope"), dir.path().join("nope")).unwrap();
    g.start().unwrap();
    wait_finished(&task);
    assert_eq!(task.state(), TaskState::Error);
    assert!(!g.is_all_successful());
}

#[test]
fn head_blocked_falls_back_to_range_probe() {
    let expected = body(10_000, 9);
    let server = RangeServer::start(
        vec![("/nohead", expected.clone())],
        ServerOptions {
            head_allowed: false,
            ..ServerOptions::default()
        },
    );
    let t = transport();
    let len = t
        .content_length(&server.url("/nohead"), &Default::default())
        .unwrap();
    assert_eq!(len, Some(10_000));

    let dir = tempdir().unwrap();
    let g = group(1);
    let task = g.submit(server.url("/nohead"), dir.path().join("nohead")).unwrap();
    g.start().unwrap();
    wait_finished(&task);
    assert_eq!(task.state(), TaskState::Success);
    assert_file(task.local_path(), &expected);
}

#[test]
fn server_ignoring_range_rewrites_from_start() {
    let expected = body(20_000, 5);
    let server = RangeServer::start(
        vec![("/norange", expected.clone())],
        ServerOptions {
            support_ranges: false,
            ..ServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();
    let dest = dir.path().join("norange");
    // A stale prefix that does not match the body.
    std::fs::write(storage::temp_path(&dest), vec![0xAA; 4096]).unwrap();

    let g = group(1);
    let task = g.submit(server.url("/norange"), &dest).unwrap();
    g.start().unwrap();
    wait_finished(&task);
    assert_eq!(task.state(), TaskState::Success);
    assert_file(&dest, &expected);
    assert_eq!(server.gets("/norange")[0].range_start, Some(4096));
}

#[test]
fn request_headers_reach_the_server() {
    let server = RangeServer::start(vec![("/h", body(100, 1))], ServerOptions::default());
    let dir = tempdir().unwrap();
    let mut config = GroupConfig::new(1);
    config
        .default_headers
        .insert("X-Client".into(), "gdm-test".into());
    config.default_headers.insert("X-Token".into(), "group".into());
    let g = DownloadGroup::with_transport(config, transport());
    let task = g.submit(server.url("/h"), dir.path().join("h")).unwrap();
    task.add_header("X-Token", "task");
    g.start().unwrap();
    wait_finished(&task);
    assert_eq!(task.state(), TaskState::Success);

    let requests = server.requests();
    assert!(requests.len() >= 2);
    for r in requests {
        assert_eq!(r.headers.get("x-client").map(String::as_str), Some("gdm-test"));
        assert_eq!(r.headers.get("x-token").map(String::as_str), Some("task"));
    }
}

#[test]
fn range_past_end_is_not_satisfiable() {
    struct Discard;
    impl BodySink for Discard {
        fn on_head(&mut self, _: &ResponseHead) -> Flow {
            Flow::Continue
        }
        fn on_data(&mut self, _: &[u8]) -> Flow {
            Flow::Continue
        }
    }

    let server = RangeServer::start(vec![("/s", body(10, 0))], ServerOptions::default());
    let outcome = transport()
        .fetch_from(&server.url("/s"), &Default::default(), 10, &mut Discard)
        .unwrap();
    assert_eq!(outcome.head.status, 416);
    assert!(!outcome.head.is_success());
    let total = outcome.head.content_range.and_then(|r| r.total);
    assert_eq!(total, Some(10));
}

#[test]
fn manager_runs_named_groups() {
    let expected = body(8 * 1024, 2);
    let server = RangeServer::start(vec![("/m.bin", expected.clone())], ServerOptions::default());
    let dir = tempdir().unwrap();
    let manager = GroupManager::with_transport(GroupConfig::new(2), transport());

    let g = manager.find_or_create_group("nightly", 2);
    let task = g.submit(server.url("/m.bin"), dir.path().join("m.bin")).unwrap();
    manager.start_group("nightly", 2).unwrap();
    wait_finished(&task);
    assert_file(task.local_path(), &expected);

    manager.destroy_all().unwrap();
    assert!(g.is_destroyed());
    assert!(manager.find_group("nightly").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aggregate_stream_reaches_completion() {
    let server = RangeServer::start(
        vec![("/a", body(30_000, 1)), ("/b", body(50_000, 2))],
        ServerOptions {
            throttle: Some((4096, Duration::from_millis(5))),
            ..ServerOptions::default()
        },
    );
    let dir = tempdir().unwrap();
    let g = group(2);
    g.submit_weighted(server.url("/a"), dir.path().join("a"), 1.0).unwrap();
    g.submit_weighted(server.url("/b"), dir.path().join("b"), 3.0).unwrap();
    let mut stream = g.total_progress_stream().unwrap();
    g.start().unwrap();

    let mut last = 0.0;
    let completed = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(n) = stream.recv().await {
            match n {
                Notification::Next(p) => {
                    assert!(p.progress >= 0.0 && p.progress <= 100.0);
                    last = p.progress;
                }
                Notification::Completed => return true,
                Notification::Failed(e) => panic!("aggregate failed: {e}"),
            }
        }
        false
    })
    .await
    .expect("aggregate stream timed out");

    assert!(completed);
    assert_eq!(last, 100.0);
    assert!(g.is_all_successful());
}
