use std::{sync::mpsc, thread, time::Duration};

use weft_network::{NodeConfig, udp::UdpNode};

#[test]
fn datagram_with_sender_endpoint() {
    // Node B on a fixed port, node A ephemeral; A sends four bytes to B.
    let port_b = 24851;

    let mut node_b = UdpNode::new(NodeConfig::default()).unwrap();
    let handle_b = node_b.handle();
    let (data_tx, data_rx) = mpsc::channel();
    let (open_b_tx, open_b_rx) = mpsc::channel();
    node_b.set_open_callback(move |result| {
        open_b_tx.send(result.map_err(|e| e.kind())).unwrap();
    });
    node_b.set_data_callback(move |peer, data| {
        data_tx.send((peer, data.to_vec())).unwrap();
    });
    let node_b = thread::spawn(move || node_b.run("127.0.0.1", port_b).unwrap());
    open_b_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    let mut node_a = UdpNode::new(NodeConfig::default()).unwrap();
    let handle_a = node_a.handle();
    let (open_tx, open_rx) = mpsc::channel();
    node_a.set_open_callback(move |result| {
        open_tx.send(result.unwrap()).unwrap();
    });
    let node_a = thread::spawn(move || node_a.run("127.0.0.1", 0).unwrap());

    let a_local = open_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(a_local.port(), 0);

    // B may not be bound yet; retry until the datagram lands.
    let payload = [0xDE, 0xAD, 0xBE, 0xEF];
    let (peer, data) = loop {
        let sent = handle_a.send("127.0.0.1", port_b, &payload).unwrap();
        assert_eq!(sent, payload.len());
        match data_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(got) => break got,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(e) => panic!("{e}"),
        }
    };
    assert_eq!(data, payload);
    assert_eq!(peer, a_local);

    handle_a.stop();
    handle_b.stop();
    node_a.join().unwrap();
    node_b.join().unwrap();
}

#[test]
fn async_send_completion_on_reactor() {
    let port_b = 24852;

    let mut node_b = UdpNode::new(NodeConfig::default()).unwrap();
    let handle_b = node_b.handle();
    let (data_tx, data_rx) = mpsc::channel();
    let (open_b_tx, open_b_rx) = mpsc::channel();
    node_b.set_open_callback(move |result| {
        open_b_tx.send(result.map_err(|e| e.kind())).unwrap();
    });
    node_b.set_data_callback(move |_, data| {
        data_tx.send(data.to_vec()).unwrap();
    });
    let node_b = thread::spawn(move || node_b.run("127.0.0.1", port_b).unwrap());
    open_b_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    let mut node_a = UdpNode::new(NodeConfig::default()).unwrap();
    let handle_a = node_a.handle();
    let (open_tx, open_rx) = mpsc::channel();
    node_a.set_open_callback(move |result| {
        open_tx.send(result.unwrap()).unwrap();
    });
    let node_a = thread::spawn(move || node_a.run("127.0.0.1", 0).unwrap());
    open_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (sent_tx, sent_rx) = mpsc::channel();
    let payload = b"async".to_vec();
    let expect = payload.clone();
    loop {
        let sent_tx = sent_tx.clone();
        handle_a.send_async("127.0.0.1", port_b, payload.clone(), move |result| {
            sent_tx.send(result.map_err(|e| e.kind())).unwrap();
        });
        assert_eq!(sent_rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(expect.len()));
        match data_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(got) => {
                assert_eq!(got, expect);
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(e) => panic!("{e}"),
        }
    }

    handle_a.stop();
    handle_b.stop();
    node_a.join().unwrap();
    node_b.join().unwrap();
}

#[test]
fn stopped_node_refuses_sends() {
    let node = UdpNode::new(NodeConfig::default()).unwrap();
    let handle = node.handle();
    // Never ran: not running, so sync send refuses immediately.
    let err = handle.send("127.0.0.1", 9, b"x").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);

    let (tx, rx) = mpsc::channel();
    handle.send_async("127.0.0.1", 9, b"x".to_vec(), move |result| {
        tx.send(result.map_err(|e| e.kind())).unwrap();
    });
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Err(std::io::ErrorKind::NotConnected)
    );
    drop(node);
}
