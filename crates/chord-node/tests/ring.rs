//! End-to-end tests driving real nodes over loopback sockets, with the
//! maintenance intervals shrunk so convergence happens in milliseconds.

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chord_node::id::Id;
use chord_node::Intervals;
use chord_node::Node;
use chord_node::NodeConfig;
use std::future::Future;
use std::sync::Once;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

fn init_tracing() {
    static TRACING_TEST_SUBSCRIBER: Once = Once::new();

    TRACING_TEST_SUBSCRIBER.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .init()
    })
}

fn fast_intervals() -> Intervals {
    Intervals {
        stabilize: Duration::from_millis(100),
        fix_finger: Duration::from_millis(150),
        backup: Duration::from_millis(100),
        ping: Duration::from_millis(100),
        show_timeout: Duration::from_millis(500),
        // Wide enough that a joining node's first backup round cannot beat
        // its own join lookup, mirroring the 5-10 s to-RTT ratio of the
        // real intervals.
        stagger_ms: 150..300,
    }
}

/// Binds the TCP listener and the UDP socket on one shared port, the way
/// the process manager does for a real node.
async fn bind_node_sockets() -> Result<(TcpListener, UdpSocket, String)> {
    loop {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        match UdpSocket::bind(("127.0.0.1", port)).await {
            Ok(udp) => return Ok((listener, udp, format!("127.0.0.1:{port}"))),
            // Another process holds the UDP side of this port; roll again.
            Err(_) => continue,
        }
    }
}

fn launch(
    listener: TcpListener,
    udp: UdpSocket,
    listen_addr: String,
    boot_peer: Option<String>,
) -> JoinHandle<Result<()>> {
    let node = Node::new(NodeConfig {
        listen_addr,
        listener,
        udp,
        boot_peer,
        intervals: fast_intervals(),
    });
    tokio::spawn(node.run())
}

async fn start_node(boot_peer: Option<String>) -> Result<(String, JoinHandle<Result<()>>)> {
    let (listener, udp, addr) = bind_node_sockets().await?;
    let task = launch(listener, udp, addr.clone(), boot_peer);
    Ok((addr, task))
}

/// Sends one operator line and collects every reply line until the node
/// closes the connection.
async fn request(addr: &str, line: &str) -> Result<Vec<String>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(format!("{line}\n").as_bytes()).await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(String::from_utf8(buf)?.lines().map(str::to_string).collect())
}

async fn wait_until<P, T, F>(timeout: Duration, predicate_fn: P) -> Result<T>
where
    P: Fn() -> F,
    F: Future<Output = Result<Option<T>>>,
{
    tokio::time::timeout(timeout, async {
        loop {
            match predicate_fn().await? {
                Some(value) => return Ok(value),
                None => tokio::time::sleep(Duration::from_millis(100)).await,
            };
        }
    })
    .await?
}

#[tokio::test]
async fn singleton_stores_and_returns_an_item() -> Result<()> {
    init_tracing();
    let (addr, _node) = start_node(None).await?;

    let hash = Id::for_item(b"hello");
    let reply = request(&addr, "CPUT aGVsbG8=").await?;
    assert_eq!(reply, vec![format!("COK {hash}")]);

    let reply = request(&addr, &format!("CGET {hash}")).await?;
    assert_eq!(reply, vec!["CDATA aGVsbG8=".to_string()]);
    Ok(())
}

#[tokio::test]
async fn missing_items_come_back_as_errors() -> Result<()> {
    init_tracing();
    let (addr, _node) = start_node(None).await?;

    let absent = Id::for_item(b"never stored");
    let reply = request(&addr, &format!("CGET {absent}")).await?;
    assert_eq!(reply, vec!["CERROR data.not.found".to_string()]);
    Ok(())
}

#[tokio::test]
async fn keepalive_lines_are_ignored() -> Result<()> {
    init_tracing();
    let (addr, _node) = start_node(None).await?;

    let mut stream = TcpStream::connect(&addr).await?;
    stream.write_all(b"\n\nCPUT aGVsbG8=\n").await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;

    let hash = Id::for_item(b"hello");
    assert_eq!(String::from_utf8(buf)?, format!("COK {hash}\n"));
    Ok(())
}

#[tokio::test]
async fn two_nodes_form_a_ring_and_serve_each_other() -> Result<()> {
    init_tracing();
    let (a, _node_a) = start_node(None).await?;
    let (b, _node_b) = start_node(Some(a.clone())).await?;

    // The roll call answers with both members once stabilization has
    // linked the successors up in both directions.
    let own = format!("CPEER {} {a}", Id::for_addr(&a));
    let other = format!("CPEER {} {b}", Id::for_addr(&b));
    wait_until(Duration::from_secs(20), || {
        let (a, own, other) = (a.clone(), own.clone(), other.clone());
        async move {
            let lines = request(&a, "CSHOW").await?;
            Ok((lines.len() == 2 && lines.contains(&own) && lines.contains(&other))
                .then_some(()))
        }
    })
    .await?;

    // With the ring formed, items stored through one node are readable
    // through the other, whoever ends up owning them.
    let payload = BASE64.encode(b"ring item");
    let hash = Id::for_item(b"ring item");
    let reply = request(&a, &format!("CPUT {payload}")).await?;
    assert_eq!(reply, vec![format!("COK {hash}")]);

    let reply = request(&b, &format!("CGET {hash}")).await?;
    assert_eq!(reply, vec![format!("CDATA {payload}")]);
    Ok(())
}

#[tokio::test]
async fn joining_node_pulls_items_it_now_owns() -> Result<()> {
    init_tracing();
    let (a, _node_a) = start_node(None).await?;
    let id_a = Id::for_addr(&a);

    // Pick the joiner's sockets first so we can craft a payload whose id
    // falls inside the arc the joiner will take over from us.
    let (listener, udp, b, payload) = loop {
        let (listener, udp, b) = bind_node_sockets().await?;
        let id_b = Id::for_addr(&b);
        let payload = (0..50_000)
            .map(|i| format!("item-{i}"))
            .find(|p| id_a.distance_to(Id::for_item(p.as_bytes())) < id_a.distance_to(id_b));
        match payload {
            Some(payload) => break (listener, udp, b, payload),
            None => continue,
        }
    };
    let hash = Id::for_item(payload.as_bytes());
    let encoded = BASE64.encode(payload.as_bytes());

    // Alone, the first node owns everything.
    let reply = request(&a, &format!("CPUT {encoded}")).await?;
    assert_eq!(reply, vec![format!("COK {hash}")]);

    // The join-time lookup resolves the newcomer's successor and the RETR
    // that follows copies the item across.
    let _node_b = launch(listener, udp, b.clone(), Some(a.clone()));
    wait_until(Duration::from_secs(20), || {
        let (b, encoded) = (b.clone(), encoded.clone());
        async move {
            let lines = request(&b, &format!("GET {hash} probe-0")).await?;
            Ok((lines == vec![format!("DATA {encoded} probe-0")]).then_some(()))
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn dead_successor_is_replaced_by_its_successor() -> Result<()> {
    init_tracing();
    let (a, _node_a) = start_node(None).await?;
    let (b, node_b) = start_node(Some(a.clone())).await?;
    let (c, _node_c) = start_node(Some(a.clone())).await?;

    // Wait for all three members to answer the roll call.
    wait_until(Duration::from_secs(30), || {
        let a = a.clone();
        async move {
            let lines = request(&a, "CSHOW").await?;
            Ok((lines.len() == 3).then_some(()))
        }
    })
    .await?;

    // Kill one node; the survivors detect the silence and splice it out
    // via their successor backups.
    node_b.abort();
    let dead = format!("CPEER {} {b}", Id::for_addr(&b));
    let survivor = format!("CPEER {} {c}", Id::for_addr(&c));
    wait_until(Duration::from_secs(30), || {
        let (a, dead, survivor) = (a.clone(), dead.clone(), survivor.clone());
        async move {
            let lines = request(&a, "CSHOW").await?;
            Ok((lines.len() == 2 && lines.contains(&survivor) && !lines.contains(&dead))
                .then_some(()))
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn stale_replies_and_junk_datagrams_are_dropped() -> Result<()> {
    init_tracing();
    let (addr, _node) = start_node(None).await?;

    let probe = UdpSocket::bind("127.0.0.1:0").await?;
    probe
        .send_to(
            b"FOUND deadbeefdeadbeefdeadbeefdeadbeefdeadbeef 127.0.0.1:9 bogus-id",
            &addr,
        )
        .await?;
    probe.send_to(b"FROB one two", &addr).await?;
    probe.send_to(b"FIND short", &addr).await?;

    // The node shrugs all of it off and keeps serving.
    let payload = BASE64.encode(b"still alive");
    let hash = Id::for_item(b"still alive");
    let reply = request(&addr, &format!("CPUT {payload}")).await?;
    assert_eq!(reply, vec![format!("COK {hash}")]);

    let reply = request(&addr, &format!("CGET {hash}")).await?;
    assert_eq!(reply, vec![format!("CDATA {payload}")]);
    Ok(())
}
