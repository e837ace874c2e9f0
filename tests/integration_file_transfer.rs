//! File reception end to end: transactional delivery with CONFIRM, refusal
//! of escaping destinations and of reception without a configured root.

mod common;

use common::{pair, Seen};
use parcelnet::error::file_code;
use parcelnet::{Parameters, Priority};
use rand::RngCore;
use std::time::Duration;

#[tokio::test]
async fn file_round_trip_confirms_to_the_sender() {
    let root = tempfile::tempdir().unwrap();
    let mut server_params = Parameters::new();
    server_params.set_file_root(root.path()).unwrap();

    let (_server, server_events, client, client_events) =
        pair(server_params, Parameters::new()).await;

    let mut content = vec![0u8; 256 * 1024];
    rand::thread_rng().fill_bytes(&mut content);
    let source = root.path().join("outgoing.bin");
    std::fs::write(&source, &content).unwrap();

    let file_id = client
        .send_file(&source, "stored/report.bin", Priority::Normal)
        .await
        .unwrap();

    let seen = server_events
        .wait_for("the file", Duration::from_secs(15), |seen| {
            seen.iter().any(|s| matches!(s, Seen::File { .. }))
        })
        .await;

    let (path, size) = seen
        .iter()
        .find_map(|s| match s {
            Seen::File { path, size, .. } => Some((path.clone(), *size)),
            _ => None,
        })
        .unwrap();
    assert_eq!(size, content.len() as u64);
    assert!(path.ends_with("stored/report.bin"));
    assert_eq!(std::fs::read(&path).unwrap(), content);
    // nothing half-written left behind
    assert!(!path.with_extension("bin.temp").exists());

    client_events
        .wait_for("the confirm", Duration::from_secs(10), |seen| {
            seen.contains(&Seen::FileConfirmed { id: file_id })
        })
        .await;

    client.close().await;
    client.wait_closed().await;
}

#[tokio::test]
async fn escaping_destination_is_refused_on_both_sides() {
    let root = tempfile::tempdir().unwrap();
    let mut server_params = Parameters::new();
    server_params.set_file_root(root.path()).unwrap();

    let (_server, server_events, client, client_events) =
        pair(server_params, Parameters::new()).await;

    let source = root.path().join("escape-source.bin");
    std::fs::write(&source, b"contained").unwrap();

    let file_id = client
        .send_file(&source, "../../etc/passwd", Priority::Normal)
        .await
        .unwrap();

    server_events
        .wait_for("the local refusal", Duration::from_secs(10), |seen| {
            seen.contains(&Seen::FileAborted {
                id: file_id,
                info: file_code::IN_LOCAL_ASSIGNMENT,
            })
        })
        .await;
    client_events
        .wait_for("the remote refusal", Duration::from_secs(10), |seen| {
            seen.contains(&Seen::FileAborted {
                id: file_id,
                info: file_code::OUT_REMOTE_ASSIGNMENT,
            })
        })
        .await;

    // nothing was created inside or outside the root
    let entries: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("escape-source.bin")]);

    client.close().await;
    client.wait_closed().await;
}

#[tokio::test]
async fn reception_without_a_root_is_refused() {
    // server has no file root configured
    let (_server, server_events, client, client_events) =
        pair(Parameters::new(), Parameters::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("unwanted.bin");
    std::fs::write(&source, b"no home for this").unwrap();

    let file_id = client
        .send_file(&source, "unwanted.bin", Priority::Normal)
        .await
        .unwrap();

    server_events
        .wait_for("the local refusal", Duration::from_secs(10), |seen| {
            seen.contains(&Seen::FileAborted {
                id: file_id,
                info: file_code::IN_LOCAL_ASSIGNMENT,
            })
        })
        .await;
    client_events
        .wait_for("the remote refusal", Duration::from_secs(10), |seen| {
            seen.contains(&Seen::FileAborted {
                id: file_id,
                info: file_code::OUT_REMOTE_ASSIGNMENT,
            })
        })
        .await;

    client.close().await;
    client.wait_closed().await;
}

#[tokio::test]
async fn empty_file_round_trips() {
    let root = tempfile::tempdir().unwrap();
    let mut server_params = Parameters::new();
    server_params.set_file_root(root.path()).unwrap();

    let (_server, server_events, client, _client_events) =
        pair(server_params, Parameters::new()).await;

    let source = root.path().join("empty-source.bin");
    std::fs::write(&source, b"").unwrap();

    client
        .send_file(&source, "stored/empty.bin", Priority::Low)
        .await
        .unwrap();

    let seen = server_events
        .wait_for("the empty file", Duration::from_secs(10), |seen| {
            seen.iter().any(|s| matches!(s, Seen::File { .. }))
        })
        .await;
    let size = seen
        .iter()
        .find_map(|s| match s {
            Seen::File { size, .. } => Some(*size),
            _ => None,
        })
        .unwrap();
    assert_eq!(size, 0);

    client.close().await;
    client.wait_closed().await;
}
