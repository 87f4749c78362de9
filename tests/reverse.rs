use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use revnet::{
    ErrorKind,
    reverse::{
        BoxedStream, Dialer, DialerOptions, Event, Listener, ListenerOptions, StreamListener,
        TcpStreamListener,
        protocol::{DATAGRAM_LEN, decode, encode},
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
    time::Instant,
};

async fn start_pool(opts: DialerOptions) -> (Arc<Dialer>, String) {
    let ln = TcpStreamListener::bind("127.0.0.1:0").await.unwrap();
    let dialer = Arc::new(Dialer::new(ln, opts));
    let addr = dialer.local_addr().unwrap().to_string();
    let srv = dialer.clone();
    tokio::spawn(async move { srv.serve().await });
    (dialer, addr)
}

#[tokio::test]
async fn handshake_then_bytes_pass_verbatim() {
    let (dialer, addr) = start_pool(DialerOptions::default()).await;
    let listener = Listener::new(addr, ListenerOptions::default());

    let (accepted, dialed) = tokio::join!(listener.accept(), dialer.dial());
    let mut server = accepted.unwrap();
    let mut client = dialed.unwrap();

    // Bytes that look like control datagrams must come through untouched.
    let mut payload = encode(Event::Syn).to_vec();
    payload.extend_from_slice(b"GET /info HTTP/1.1\r\n\r\n");
    payload.extend_from_slice(&encode(Event::Heart));

    client.write_all(&payload).await.unwrap();
    let mut got = vec![0u8; payload.len()];
    server.read_exact(&mut got).await.unwrap();
    assert_eq!(got, payload);

    server.write_all(b"reverse listener").await.unwrap();
    let mut got = [0u8; 16];
    client.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"reverse listener");
}

#[tokio::test]
async fn each_pooled_connection_has_one_claimant() {
    let opts = DialerOptions::default()
        .with_handshake(false)
        .with_heartbeat(Duration::ZERO);
    let (dialer, addr) = start_pool(opts).await;

    let (results_tx, mut results) = mpsc::unbounded_channel();
    for _ in 0..5 {
        let dialer = dialer.clone();
        let results_tx = results_tx.clone();
        tokio::spawn(async move {
            let _ = results_tx.send(dialer.dial().await);
        });
    }

    let _raw = tokio::net::TcpStream::connect(&addr).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.is_ok());
    assert!(
        tokio::time::timeout(Duration::from_millis(150), results.recv())
            .await
            .is_err(),
        "a second claimant received the same connection"
    );

    dialer.close().unwrap();
    for _ in 0..4 {
        let r = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(r.err().unwrap().is_closed());
    }
}

#[tokio::test]
async fn closing_unblocks_pending_accept() {
    let (_dialer, addr) = start_pool(DialerOptions::default()).await;
    let listener = Arc::new(Listener::new(addr, ListenerOptions::default()));

    // The accept's connection sits unclaimed in the pool, waiting for Syn.
    let accept = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.close().unwrap();

    let err = tokio::time::timeout(Duration::from_secs(1), accept)
        .await
        .unwrap()
        .unwrap()
        .err()
        .unwrap();
    assert!(err.is_closed());
    assert!(listener.close().unwrap_err().is_closed());
    assert!(listener.accept().await.err().unwrap().is_closed());
}

#[tokio::test]
async fn closing_unblocks_pending_dial_and_serve() {
    let ln = TcpStreamListener::bind("127.0.0.1:0").await.unwrap();
    let dialer = Arc::new(Dialer::new(ln, DialerOptions::default()));

    let serve = {
        let dialer = dialer.clone();
        tokio::spawn(async move { dialer.serve().await })
    };
    let dial = {
        let dialer = dialer.clone();
        tokio::spawn(async move { dialer.dial().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    dialer.close().unwrap();

    let dialed = tokio::time::timeout(Duration::from_secs(1), dial)
        .await
        .unwrap()
        .unwrap();
    assert!(dialed.err().unwrap().is_closed());
    let served = tokio::time::timeout(Duration::from_secs(1), serve)
        .await
        .unwrap()
        .unwrap();
    assert!(served.unwrap_err().is_closed());
    assert!(dialer.close().unwrap_err().is_closed());
}

#[tokio::test]
async fn initiator_timeout_is_distinct_and_closes_connection() {
    let opts = DialerOptions::default()
        .with_heartbeat(Duration::ZERO)
        .with_timeout(Duration::from_millis(100));
    let (dialer, addr) = start_pool(opts).await;

    let mut silent = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let err = dialer.dial().await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(!err.is_closed());

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), silent.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rest, encode(Event::Syn));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_listener_waiting_for_syn() {
    let (peer_tx, mut peer_rx) = mpsc::channel(1);
    let opts = ListenerOptions::default()
        .with_heartbeat_timeout(Duration::from_millis(200))
        .with_dial(move |_addr| {
            let peer_tx = peer_tx.clone();
            async move {
                let (ours, theirs) = tokio::io::duplex(256);
                peer_tx
                    .send(theirs)
                    .await
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                Ok::<BoxedStream, io::Error>(Box::new(ours))
            }
        });
    let listener = Listener::new("relay:9000", opts);

    let claimant = tokio::spawn(async move {
        let mut peer = peer_rx.recv().await.unwrap();
        peer.write_all(&encode(Event::Heart)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer.write_all(&encode(Event::Heart)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer.write_all(&encode(Event::Syn)).await.unwrap();

        let mut buf = [0u8; DATAGRAM_LEN];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(decode(&buf).unwrap(), Event::SynAck);
        peer.write_all(&encode(Event::Ack)).await.unwrap();
        peer
    });

    let mut conn = listener.accept().await.unwrap();
    let mut peer = claimant.await.unwrap();
    peer.write_all(b"ok").await.unwrap();
    let mut got = [0u8; 2];
    conn.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"ok");
}

#[tokio::test(start_paused = true)]
async fn each_heart_restarts_inactivity_timeout() {
    let (peer_tx, mut peer_rx) = mpsc::channel(1);
    let opts = ListenerOptions::default()
        .with_heartbeat_timeout(Duration::from_millis(200))
        .with_dial(move |_addr| {
            let peer_tx = peer_tx.clone();
            async move {
                let (ours, theirs) = tokio::io::duplex(256);
                peer_tx
                    .send(theirs)
                    .await
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                Ok::<BoxedStream, io::Error>(Box::new(ours))
            }
        });
    let listener = Listener::new("relay:9000", opts);

    // Syn arrives 450ms in, well past a single 200ms window, but no gap
    // between datagrams exceeds 150ms.
    let claimant = tokio::spawn(async move {
        let mut peer = peer_rx.recv().await.unwrap();
        for _ in 0..3 {
            peer.write_all(&encode(Event::Heart)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        peer.write_all(&encode(Event::Syn)).await.unwrap();

        let mut buf = [0u8; DATAGRAM_LEN];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(decode(&buf).unwrap(), Event::SynAck);
        peer.write_all(&encode(Event::Ack)).await.unwrap();
        peer
    });

    let start = Instant::now();
    let conn = listener.accept().await;
    assert!(start.elapsed() >= Duration::from_millis(450));
    assert!(conn.is_ok());
    claimant.await.unwrap();
}

#[tokio::test]
async fn failing_dial_surfaces_transport_error() {
    let opts = ListenerOptions::default().with_dial(|addr| async move {
        Err::<BoxedStream, _>(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("connect {addr}: refused"),
        ))
    });
    let listener = Listener::new("127.0.0.1:9", opts);

    let err = listener.accept().await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Io);
    match err {
        revnet::Error::Io(io) => assert_eq!(io.kind(), io::ErrorKind::ConnectionRefused),
        other => panic!("unexpected error: {other:?}"),
    }
    // A failed attempt does not close the listener.
    assert!(!listener.is_closed());
}

/// Listener that plays back a fixed list of accept outcomes and records when
/// each accept was attempted.
struct ScriptedListener {
    script: Mutex<VecDeque<io::Result<()>>>,
    calls: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl StreamListener for ScriptedListener {
    async fn accept(&self) -> io::Result<BoxedStream> {
        self.calls.lock().unwrap().push(Instant::now());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(())) => {
                let (ours, _theirs) = tokio::io::duplex(64);
                Ok(Box::new(ours))
            }
            Some(Err(err)) => Err(err),
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[tokio::test(start_paused = true)]
async fn accept_backoff_grows_caps_and_resets() {
    let mut script: VecDeque<io::Result<()>> = VecDeque::new();
    for _ in 0..10 {
        script.push_back(Err(io::Error::from(io::ErrorKind::ConnectionAborted)));
    }
    script.push_back(Ok(()));
    script.push_back(Err(io::Error::from(io::ErrorKind::ConnectionAborted)));
    script.push_back(Err(io::Error::from(io::ErrorKind::InvalidInput)));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let ln = ScriptedListener {
        script: Mutex::new(script),
        calls: calls.clone(),
    };
    let dialer = Dialer::new(ln, DialerOptions::default().with_heartbeat(Duration::ZERO));

    let err = dialer.serve().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 13);
    let gaps: Vec<u128> = calls
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis())
        .collect();

    let expected = [5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000];
    for (got, want) in gaps[..10].iter().zip(expected) {
        assert!(*got >= want && *got <= want + 1, "gaps: {gaps:?}");
    }
    for w in gaps[..10].windows(2) {
        assert!(w[1] + 1 >= w[0], "backoff shrank: {gaps:?}");
    }
    assert!(gaps[..10].iter().all(|g| *g <= 1001), "backoff over cap: {gaps:?}");

    // Success resets the schedule: the next accept is immediate and the next
    // failure sleeps the base delay again.
    assert_eq!(gaps[10], 0);
    assert!(gaps[11] >= 5 && gaps[11] <= 6, "gaps: {gaps:?}");
}
