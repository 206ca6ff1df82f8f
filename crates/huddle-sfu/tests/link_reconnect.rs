use futures_util::{SinkExt, StreamExt};
use huddle_common::protocol::{self, ConnectRequest, Envelope, MessageKind, SignalPayload};
use huddle_sfu::{HubLink, LinkSettings, Sfu, SfuSettings};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

const RECONNECT: Duration = Duration::from_millis(200);

async fn start_link() -> (TcpListener, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = mpsc::channel(256);
    let settings = SfuSettings {
        stun_urls: vec![],
        ..SfuSettings::default()
    };
    let sfu = Sfu::new(&settings, tx).unwrap();
    let link = HubLink::new(LinkSettings {
        hub_url: format!("ws://{addr}/ws/sfu-internal-channel"),
        reconnect_interval: RECONNECT,
        heartbeat_interval: Duration::from_millis(100),
        write_wait: Duration::from_secs(1),
        read_timeout: Duration::from_secs(5),
    });

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { link.run(sfu, rx, token).await });
    (listener, shutdown)
}

#[tokio::test]
async fn link_redials_after_the_hub_drops_it() {
    let (listener, shutdown) = start_link().await;

    let (first, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    let first = accept_async(first).await.unwrap();
    let dropped_at = Instant::now();
    drop(first);

    let (second, _) = timeout(RECONNECT * 10, listener.accept())
        .await
        .expect("link did not reconnect")
        .unwrap();
    assert!(dropped_at.elapsed() >= RECONNECT / 2);
    let mut hub = accept_async(second).await.unwrap();

    // Signaling works on the new session.
    let request = protocol::encode(
        MessageKind::WebrtcConnectRequest,
        &ConnectRequest {
            user_id: "u1".into(),
            project_id: "p1".into(),
        },
    )
    .unwrap();
    hub.send(Message::Text(request.into())).await.unwrap();

    let offer = timeout(Duration::from_secs(5), async {
        while let Some(frame) = hub.next().await {
            if let Message::Text(text) = frame.unwrap() {
                let env = Envelope::parse(text.as_str()).unwrap();
                if env.kind == MessageKind::WebrtcOffer {
                    return env.payload_as::<SignalPayload>().unwrap();
                }
            }
        }
        panic!("hub socket closed before an offer arrived");
    })
    .await
    .unwrap();
    assert_eq!(offer.target, "u1");
    assert_eq!(offer.sender, "sfu");
    assert_eq!(offer.data["type"], "offer");

    shutdown.cancel();
}

#[tokio::test]
async fn link_sends_heartbeats() {
    let (listener, shutdown) = start_link().await;
    let (stream, _) = listener.accept().await.unwrap();
    let mut hub = accept_async(stream).await.unwrap();

    let ping = timeout(Duration::from_secs(2), async {
        loop {
            match hub.next().await {
                Some(Ok(Message::Ping(_))) => return true,
                Some(Ok(_)) => continue,
                _ => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(ping);

    shutdown.cancel();
}

#[tokio::test]
async fn link_closes_the_session_on_shutdown() {
    let (listener, shutdown) = start_link().await;
    let (stream, _) = listener.accept().await.unwrap();
    let mut hub = accept_async(stream).await.unwrap();

    shutdown.cancel();
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match hub.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}
