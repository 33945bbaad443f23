use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use mill_sockets::{
    ConnectionId, ServerConfig, ServerConfigBuilder, SocketServer, Verdict, SHUTDOWN_REASON,
};

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn local_config() -> ServerConfigBuilder {
    ServerConfig::builder()
        .host("127.0.0.1")
        .port(0)
        .block_time(Duration::from_millis(20))
}

type Closures = Arc<Mutex<Vec<(ConnectionId, String)>>>;

fn recording(builder: ServerConfigBuilder) -> (ServerConfigBuilder, Closures) {
    let closures: Closures = Arc::default();
    let sink = closures.clone();
    let builder = builder.on_closed(move |_, conn, reason| {
        sink.lock().unwrap().push((conn.id(), reason.to_string()));
    });
    (builder, closures)
}

fn started(builder: ServerConfigBuilder) -> (SocketServer, SocketAddr) {
    let server = SocketServer::new(builder.build()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

#[test]
fn fixed_read_then_peer_close() {
    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = received.clone();
    let (builder, closures) = recording(local_config().on_readable(move |_, conn| {
        let data = conn.recv(100, true)?;
        sink.lock().unwrap().extend_from_slice(&data);
        Ok(Verdict::Continue)
    }));
    let (server, addr) = started(builder);

    let mut client = TcpStream::connect(addr).unwrap();
    assert!(wait_for(|| server.clients().len() == 1));
    let conn = server.clients().pop().unwrap();
    assert!(wait_for(|| conn.is_accepted()));

    let payload: Vec<u8> = (0..100u8).collect();
    client.write_all(&payload).unwrap();
    assert!(wait_for(|| received.lock().unwrap().len() == 100));
    assert_eq!(*received.lock().unwrap(), payload);

    drop(client);
    assert!(wait_for(|| closures.lock().unwrap().len() == 1));
    thread::sleep(Duration::from_millis(50));

    let closures = closures.lock().unwrap();
    assert_eq!(closures.len(), 1);
    assert_eq!(closures[0].0, conn.id());
    assert_eq!(closures[0].1, "Socket connection broken on recv");
    assert!(server.clients().is_empty());
    assert!(conn.is_closed());
    drop(closures);
    server.stop().unwrap();
}

#[test]
fn rejected_handshake_reports_reason() {
    let (builder, closures) =
        recording(local_config().on_incoming(|_, _| Ok(Verdict::reject("bad handshake"))));
    let (server, addr) = started(builder);

    let mut client = TcpStream::connect(addr).unwrap();
    assert!(wait_for(|| closures.lock().unwrap().len() == 1));

    assert_eq!(closures.lock().unwrap()[0].1, "bad handshake");
    assert!(server.clients().is_empty());

    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    server.stop().unwrap();
}

#[test]
fn stop_disconnects_every_client() {
    let (builder, closures) = recording(local_config());
    let (server, addr) = started(builder);

    let clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(wait_for(|| server.clients().len() == 3));

    server.stop().unwrap();

    {
        let closures = closures.lock().unwrap();
        assert_eq!(closures.len(), 3);
        assert!(closures.iter().all(|(_, reason)| reason == SHUTDOWN_REASON));
    }
    assert!(server.clients().is_empty());
    assert!(!server.is_running());
    assert!(TcpStream::connect(addr).is_err());
    drop(clients);
}

#[test]
fn worker_ceiling_serializes_handshakes() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let builder = {
        let (active, peak, handled) = (active.clone(), peak.clone(), handled.clone());
        local_config()
            .max_subthreads(Some(1))
            .on_readable(move |_, conn| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                let data = conn.recv_some(64);
                active.fetch_sub(1, Ordering::SeqCst);
                data?;
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(Verdict::Continue)
            })
    };
    let (server, addr) = started(builder);

    let mut first = TcpStream::connect(addr).unwrap();
    let mut second = TcpStream::connect(addr).unwrap();
    assert!(wait_for(|| server
        .clients()
        .iter()
        .filter(|c| server.context().is_registered(c))
        .count()
        == 2));

    first.write_all(b"one").unwrap();
    second.write_all(b"two").unwrap();

    assert!(wait_for(|| handled.load(Ordering::SeqCst) == 2));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    server.stop().unwrap();
}

#[test]
fn one_readiness_event_is_never_dispatched_twice() {
    let in_flight: Arc<Mutex<HashMap<ConnectionId, usize>>> = Arc::default();
    let violations = Arc::new(AtomicUsize::new(0));
    let bytes = Arc::new(AtomicUsize::new(0));

    let builder = {
        let (in_flight, violations, bytes) = (in_flight.clone(), violations.clone(), bytes.clone());
        local_config().on_readable(move |_, conn| {
            {
                let mut map = in_flight.lock().unwrap();
                let count = map.entry(conn.id()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
            }
            thread::sleep(Duration::from_millis(2));
            let data = conn.recv_some(16);
            *in_flight.lock().unwrap().get_mut(&conn.id()).unwrap() -= 1;
            bytes.fetch_add(data?.len(), Ordering::SeqCst);
            Ok(Verdict::Continue)
        })
    };
    let (server, addr) = started(builder);

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_nodelay(true).unwrap();
    assert!(wait_for(|| server.clients().len() == 1));

    let total = 200;
    for _ in 0..total {
        client.write_all(b"x").unwrap();
        thread::sleep(Duration::from_micros(200));
    }

    assert!(wait_for(|| bytes.load(Ordering::SeqCst) == total));
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    server.stop().unwrap();
}

#[test]
fn close_callback_fires_once_per_path() {
    let (builder, closures) = recording(
        local_config()
            .on_incoming(|_, conn| {
                if conn.id().as_u64() % 2 == 0 {
                    Ok(Verdict::reject("even ids are refused"))
                } else {
                    Ok(Verdict::Continue)
                }
            })
            .on_readable(|_, conn| {
                conn.recv_some(64)?;
                Ok(Verdict::Continue)
            }),
    );
    let (server, addr) = started(builder);

    let mut clients: Vec<TcpStream> = (0..6).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(wait_for(|| closures.lock().unwrap().len() == 3));
    assert!(wait_for(|| server.clients().len() == 3));

    // explicit disconnect, raced against the peer closing
    let victim = server.clients().pop().unwrap();
    server.context().disconnect(&victim, "kicked");
    server.context().disconnect(&victim, "kicked twice");

    // peer close on whatever is left, except one that survives until stop
    clients.truncate(1);
    assert!(wait_for(|| closures.lock().unwrap().len() >= 5));

    server.stop().unwrap();
    thread::sleep(Duration::from_millis(50));

    let closures = closures.lock().unwrap();
    assert_eq!(closures.len(), 6);
    let mut ids: Vec<ConnectionId> = closures.iter().map(|(id, _)| *id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6);
    assert!(closures.iter().any(|(_, r)| r == "kicked"));
    assert!(!closures.iter().any(|(_, r)| r == "kicked twice"));
}

#[test]
fn callbacks_can_reply_through_the_context() {
    let (server, addr) = started(local_config().on_readable(|ctx, conn| {
        let data = conn.recv_some(1024)?;
        let reply: Vec<u8> = data.iter().map(u8::to_ascii_uppercase).collect();
        Ok(Verdict::from(
            ctx.send(conn, &reply, Some(Duration::from_secs(1))) == reply.len(),
        ))
    }));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    for word in ["hello", "mill", "sockets"] {
        client.write_all(word.as_bytes()).unwrap();
        let mut reply = vec![0u8; word.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, word.to_ascii_uppercase().as_bytes());
    }
    server.stop().unwrap();
}
