//! The two-phase shutdown: in-flight traffic drains, both sides report the
//! matching close causes, and new send orders are refused.

mod common;

use common::{pair, Seen};
use parcelnet::{CloseCause, Parameters, Priority, TransportError, UserFault};
use std::time::Duration;

#[tokio::test]
async fn graceful_close_drains_in_flight_sends() {
    let (server, server_events, client, client_events) =
        pair(Parameters::new(), Parameters::new()).await;

    for text in ["first", "second", "third"] {
        client
            .send_object(text.to_string(), Priority::Normal)
            .await
            .unwrap();
    }
    client.close().await;

    // everything queued before close still arrives
    let seen = server_events
        .wait_for("three objects and the close", Duration::from_secs(15), |seen| {
            seen.iter().filter(|s| matches!(s, Seen::Object { .. })).count() == 3
                && seen.iter().any(|s| matches!(s, Seen::Closed { .. }))
        })
        .await;
    let texts: Vec<String> = seen
        .iter()
        .filter_map(|s| match s {
            Seen::Object { text, .. } => text.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["first", "second", "third"]);

    // both sides pass through SHUTDOWN and end with the matching causes
    let client_seen = client_events
        .wait_for("the local close", Duration::from_secs(15), |seen| {
            seen.iter().any(|s| matches!(s, Seen::Closed { .. }))
        })
        .await;
    assert!(client_seen.contains(&Seen::Shutdown));
    assert!(client_seen.contains(&Seen::Closed {
        cause: CloseCause::LocalClose.code()
    }));

    assert!(seen.contains(&Seen::Shutdown));
    assert!(seen.contains(&Seen::Closed {
        cause: CloseCause::RemoteClose.code()
    }));

    // the closing side refuses new orders
    let err = client
        .send_object("late".to_string(), Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::User(UserFault::ShuttingDown) | TransportError::User(UserFault::ConnectionClosed)
    ));

    server.wait_closed().await;
    client.wait_closed().await;
}

#[tokio::test]
async fn hard_close_is_immediate_on_both_sides() {
    let (server, server_events, client, client_events) =
        pair(Parameters::new(), Parameters::new()).await;

    client.close_hard().await;

    client_events
        .wait_for("the hard close", Duration::from_secs(10), |seen| {
            seen.contains(&Seen::Closed {
                cause: CloseCause::HardClose.code(),
            })
        })
        .await;

    // the peer sees the socket die, not a regular shutdown
    server_events
        .wait_for("the peer close", Duration::from_secs(10), |seen| {
            seen.contains(&Seen::Closed {
                cause: CloseCause::SocketError.code(),
            })
        })
        .await;

    let err = client
        .send_object("dead".to_string(), Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::User(UserFault::ConnectionClosed)
    ));

    server.wait_closed().await;
    client.wait_closed().await;
}

#[tokio::test]
async fn simultaneous_close_settles_both_sides() {
    let (server, server_events, client, client_events) =
        pair(Parameters::new(), Parameters::new()).await;

    tokio::join!(client.close(), server.close());

    client_events
        .wait_for("the client close", Duration::from_secs(15), |seen| {
            seen.iter().any(|s| matches!(s, Seen::Closed { .. }))
        })
        .await;
    server_events
        .wait_for("the server close", Duration::from_secs(15), |seen| {
            seen.iter().any(|s| matches!(s, Seen::Closed { .. }))
        })
        .await;

    server.wait_closed().await;
    client.wait_closed().await;
}
