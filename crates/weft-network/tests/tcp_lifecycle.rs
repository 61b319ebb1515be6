use std::{
    io::{Read, Write},
    sync::{
        Arc, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use weft_network::{
    ServerConfig,
    tcp::{TcpClient, TcpServer},
};

fn start_echo(port: u16) -> (thread::JoinHandle<()>, weft_network::tcp::ServerHandle) {
    let mut server = TcpServer::bind(ServerConfig::new("127.0.0.1", port), |peer| {
        peer.set_data_callback(|ctx, frame| {
            ctx.send(frame).unwrap();
        });
    })
    .unwrap();
    let handle = server.handle();
    (thread::spawn(move || server.run().unwrap()), handle)
}

#[test]
fn open_and_close_fire_exactly_once() {
    let port = 24841;
    let (server, server_handle) = start_echo(port);

    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let datas = Arc::new(AtomicUsize::new(0));

    let mut client = TcpClient::new("127.0.0.1", port).unwrap();
    let sender = client.handle();
    let (o, c, d) = (opens.clone(), closes.clone(), datas.clone());
    client.set_open_callback(move |result| {
        result.unwrap();
        o.fetch_add(1, Ordering::SeqCst);
        sender.send(b"once").unwrap();
    });
    client.set_data_callback(move |ctx, _frame| {
        d.fetch_add(1, Ordering::SeqCst);
        ctx.close();
    });
    client.set_close_callback(move |err| {
        assert!(err.is_none(), "local close must be clean: {err:?}");
        c.fetch_add(1, Ordering::SeqCst);
    });
    client.run().unwrap();

    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(datas.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    server_handle.stop();
    server.join().unwrap();
}

#[test]
fn refused_connection_reports_through_open_only() {
    // Nothing listens here.
    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut client = TcpClient::new("127.0.0.1", 24842).unwrap();
    let (o, c) = (opens.clone(), closes.clone());
    client.set_open_callback(move |result| {
        assert!(result.is_err());
        o.fetch_add(1, Ordering::SeqCst);
    });
    client.set_close_callback(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    client.run().unwrap();

    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 0);
}

#[test]
fn idle_header_then_frame() {
    // Raw wire: four zero bytes (keep-alive) followed by a 3-byte frame.
    let port = 24843;
    let (server, server_handle) = start_echo(port);

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(&[0, 0, 0, 0]).unwrap();
    stream.write_all(&[0, 0, 0, 3, 1, 2, 3]).unwrap();

    // Exactly one echoed frame comes back.
    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0, 0, 0, 3, 1, 2, 3]);

    server_handle.stop();
    server.join().unwrap();
}

#[test]
fn straddled_frame_delivered_once() {
    // 300 bytes of 0xAA split 200/104 on the wire (scenario from the
    // framing contract), via a raw socket so the split is explicit.
    let port = 24844;
    let (server, server_handle) = start_echo(port);

    let mut wire = vec![0, 0, 1, 44]; // 300 big-endian
    wire.extend(std::iter::repeat_n(0xAA, 300));

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(&wire[..200]).unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(&wire[200..]).unwrap();

    let mut reply = vec![0u8; wire.len()];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, wire);

    server_handle.stop();
    server.join().unwrap();
}

#[test]
fn oversized_frame_declaration_closes_the_connection() {
    let port = 24846;
    let (close_tx, close_rx) = mpsc::channel();
    let mut server = TcpServer::bind(
        ServerConfig::new("127.0.0.1", port).with_max_payload(1024),
        move |peer| {
            let close_tx = close_tx.clone();
            peer.set_close_callback(move |_, err| {
                close_tx.send(err.map(|e| e.kind())).unwrap();
            });
        },
    )
    .unwrap();
    let server_handle = server.handle();
    let server = thread::spawn(move || server.run().unwrap());

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    // Declares a 2 KiB body against a 1 KiB cap.
    stream.write_all(&[0, 0, 8, 0]).unwrap();

    let kind = close_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, Some(std::io::ErrorKind::InvalidData));

    // Server hung up on us.
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    server_handle.stop();
    server.join().unwrap();
}

#[test]
fn server_kick_closes_cleanly() {
    let port = 24845;
    let (conn_tx, conn_rx) = mpsc::channel();
    let mut server = TcpServer::bind(ServerConfig::new("127.0.0.1", port), move |peer| {
        conn_tx.send(peer.id()).unwrap();
    })
    .unwrap();

    let (closed_tx, closed_rx) = mpsc::channel();
    let mut client = TcpClient::new("127.0.0.1", port).unwrap();
    client.set_close_callback(move |err| {
        closed_tx.send(err.is_none()).unwrap();
    });
    let client = thread::spawn(move || client.run().unwrap());

    let id = loop {
        server.poll(Some(Duration::from_millis(50))).unwrap();
        if let Ok(id) = conn_rx.try_recv() {
            break id;
        }
    };
    assert_eq!(server.connection_count(), 1);
    assert!(server.peer_addr(id).is_some());
    assert!(server.kick(id));
    assert_eq!(server.connection_count(), 0);

    // Client observes EOF as a clean close.
    let clean = closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(clean);
    client.join().unwrap();
}
