//! The ALIVE watchdog: a peer that goes silent is detected and the
//! connection closes with the alive-timeout cause.

mod common;

use common::{raw_client, Recorder, Seen};
use parcelnet::{Acceptor, CloseCause, Parameters};
use std::time::Duration;

#[tokio::test]
async fn silent_peer_trips_the_watchdog() {
    let mut params = Parameters::new();
    params.set_alive_period(Duration::from_secs(5)).unwrap();

    let acceptor = Acceptor::bind("127.0.0.1:0", params).await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    // a peer that handshakes correctly and then never says anything again
    let (server, stream) = tokio::join!(acceptor.accept(), raw_client(addr));
    let server = server.unwrap();
    let events = Recorder::new();
    server.add_listener(events.clone());

    // roughly two alive periods of silence should close the connection
    events
        .wait_for("the watchdog close", Duration::from_secs(20), |seen| {
            seen.contains(&Seen::Closed {
                cause: CloseCause::AliveTimeout.code(),
            })
        })
        .await;
    drop(stream);
    server.wait_closed().await;
}
