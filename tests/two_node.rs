//! End-to-end tests for two nodes talking over the loopback mesh.
//!
//! Each test drives full nodes: console input in, mesh frames across, console
//! output checked on the other side.

use salsalink::{
    CounterMode, DataRequest, FileEeprom, KeyStore, LinkConfig, LoopbackMesh, LoopbackNode,
    MemoryEeprom, MeshTransport, Node, Nonce, OperatingMode, PresharedKey, PskState,
    APP_ENDPOINT, NWK_OPT_ENABLE_SECURITY, PSK_ADDRESS,
};

const KEY_HEX: &str = "3c9f0e6a51d84b27e0a5c3f1829b6d4e7f10a2b3c4d5e6f708192a3b4c5d6e7f";

fn provisioned_store() -> KeyStore<MemoryEeprom> {
    let mut keys = KeyStore::new(MemoryEeprom::new());
    keys.store(&PresharedKey::from_hex(KEY_HEX).unwrap()).unwrap();
    keys
}

fn start(mesh: &LoopbackMesh, config: LinkConfig) -> Node<LoopbackNode> {
    let mut keys = provisioned_store();
    Node::start(config, mesh.node(), &mut keys).unwrap()
}

/// Starts a sender and a listener and clears their start-up output.
fn pair(config: LinkConfig) -> (LoopbackMesh, Node<LoopbackNode>, Node<LoopbackNode>) {
    let mesh = LoopbackMesh::new();
    let mut sender = start(&mesh, config.clone());
    let mut listener = start(&mesh, config);

    sender.type_bytes(b"1").unwrap();
    listener.type_bytes(b"2").unwrap();
    sender.take_output();
    listener.take_output();

    (mesh, sender, listener)
}

/// Messages shown as received in console output.
fn received(output: &str) -> Vec<String> {
    const MARKER: &str = "[MESSAGE RECEIVED] ";
    output
        .match_indices(MARKER)
        .map(|(at, _)| {
            let rest = &output[at + MARKER.len()..];
            let end = rest.find("\r\n").unwrap_or(rest.len());
            rest[..end].to_string()
        })
        .collect()
}

/// Types a line on `from`, then lets both nodes service the mesh.
fn send_line(from: &mut Node<LoopbackNode>, to: &mut Node<LoopbackNode>, line: &str) -> String {
    from.type_bytes(line.as_bytes()).unwrap();
    from.type_bytes(b"\r").unwrap();
    from.poll().unwrap();
    to.poll().unwrap();
    to.take_output()
}

#[test]
fn test_sender_to_listener() {
    let (mesh, mut sender, mut listener) = pair(LinkConfig::default());

    assert_eq!(sender.session().mode(), OperatingMode::Sender);
    assert_eq!(sender.transport().local_address(), 1);
    assert_eq!(listener.transport().local_address(), 0);

    let output = send_line(&mut sender, &mut listener, "HI");

    assert_eq!(received(&output), vec!["HI"]);
    assert_eq!(mesh.delivered(), 1);
    assert_eq!(sender.session().nonce().as_bytes(), &[1, 0, 0, 0, 0, 0, 0, 0]);
    assert!(!sender.session().is_send_busy());
    assert!(sender.take_output().contains("Enter message to encrypt"));
}

#[test]
fn test_messages_in_order() {
    let (_mesh, mut sender, mut listener) = pair(LinkConfig::default());

    let mut seen = Vec::new();
    for line in ["first", "second", "third"] {
        seen.extend(received(&send_line(&mut sender, &mut listener, line)));
    }

    assert_eq!(seen, vec!["first", "second", "third"]);
    assert_eq!(sender.session().nonce().as_bytes(), &[3, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_second_send_dropped_until_confirmed() {
    let (mesh, mut sender, mut listener) = pair(LinkConfig::default());

    sender.type_bytes(b"A\rB\r").unwrap();
    assert!(sender
        .take_output()
        .contains("Previous send not confirmed, message dropped"));

    sender.poll().unwrap();
    listener.poll().unwrap();
    assert_eq!(received(&listener.take_output()), vec!["A"]);
    assert_eq!(mesh.delivered(), 1);

    let output = send_line(&mut sender, &mut listener, "C");
    assert_eq!(received(&output), vec!["C"]);
    assert_eq!(sender.session().nonce().as_bytes(), &[2, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_full_buffer_sends_without_line_end() {
    let config = LinkConfig::default();
    let capacity = config.input_capacity();
    let (_mesh, mut sender, mut listener) = pair(config);

    let message = "x".repeat(capacity);
    sender.type_bytes(message.as_bytes()).unwrap();
    assert!(sender.session().pending_input().is_empty());
    assert!(sender.session().is_send_busy());

    sender.poll().unwrap();
    listener.poll().unwrap();
    assert_eq!(received(&listener.take_output()), vec![message]);
}

#[test]
fn test_restarted_node_skips_used_nonces() {
    let mesh = LoopbackMesh::new();
    let mut alice = start(&mesh, LinkConfig::default());
    let mut bob = start(&mesh, LinkConfig::default());
    alice.type_bytes(b"1").unwrap();
    bob.type_bytes(b"2").unwrap();

    for line in ["one", "two", "three"] {
        send_line(&mut alice, &mut bob, line);
    }
    // Nonces 0, 1 and 2 were used. Bob adopted 1 + 1 and then saw 2 again.
    assert_eq!(bob.session().nonce().as_bytes(), &[2, 0, 0, 0, 0, 0, 0, 0]);

    // Park the old node on the listener address and bring Alice back fresh.
    alice.type_bytes(b"M2").unwrap();
    drop(alice);
    let mut alice = start(&mesh, LinkConfig::default());
    alice.type_bytes(b"2").unwrap();
    assert_eq!(alice.session().nonce(), Nonce::ZERO);

    bob.type_bytes(b"M1").unwrap();
    assert_eq!(bob.transport().local_address(), 1);
    let output = send_line(&mut bob, &mut alice, "back");

    assert_eq!(received(&output), vec!["back"]);
    assert_eq!(alice.session().nonce().as_bytes(), &[3, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_mismatched_keys_give_garbage() {
    let mesh = LoopbackMesh::new();
    let mut sender = start(&mesh, LinkConfig::default());

    let mut other_keys = KeyStore::new(MemoryEeprom::new());
    other_keys.store(&PresharedKey::from_bytes([0x42; 32])).unwrap();
    let mut listener = Node::start(LinkConfig::default(), mesh.node(), &mut other_keys).unwrap();

    sender.type_bytes(b"1").unwrap();
    listener.type_bytes(b"2").unwrap();
    listener.take_output();

    let output = send_line(&mut sender, &mut listener, "ATTACK AT DAWN");
    let messages = received(&output);

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].len(), "ATTACK AT DAWN".len());
    assert_ne!(messages[0], "ATTACK AT DAWN");
}

#[test]
fn test_short_frame_rejected() {
    let (mesh, _sender, mut listener) = pair(LinkConfig::default());

    let mut raw = mesh.node();
    raw.set_local_address(1).unwrap();
    raw.send(DataRequest {
        dst_addr: 0,
        src_endpoint: APP_ENDPOINT,
        dst_endpoint: APP_ENDPOINT,
        options: NWK_OPT_ENABLE_SECURITY,
        data: vec![0u8; 8],
    })
    .unwrap();

    listener.poll().unwrap();
    let output = listener.take_output();
    assert!(output.contains("Received data too short: 8 bytes"));
    assert!(received(&output).is_empty());
    assert_eq!(listener.session().nonce(), Nonce::ZERO);
}

#[test]
fn test_fresh_storage_uses_fallback_key() {
    let mesh = LoopbackMesh::new();
    let mut keys_a = KeyStore::new(MemoryEeprom::new());
    let mut keys_b = KeyStore::new(MemoryEeprom::new());

    let mut sender = Node::start(LinkConfig::default(), mesh.node(), &mut keys_a).unwrap();
    let mut listener = Node::start(LinkConfig::default(), mesh.node(), &mut keys_b).unwrap();

    assert!(sender.take_output().contains("fallback key"));
    assert_eq!(sender.session().psk_state(), PskState::Valid);
    assert_eq!(keys_a.status().unwrap(), PskState::Valid);

    sender.type_bytes(b"1").unwrap();
    listener.type_bytes(b"2").unwrap();
    let output = send_line(&mut sender, &mut listener, "default");
    assert_eq!(received(&output), vec!["default"]);
}

#[test]
fn test_corrupt_key_blocks_sending() {
    let mesh = LoopbackMesh::new();
    let mut keys = provisioned_store();
    keys.storage_mut().as_bytes_mut()[PSK_ADDRESS + 5] ^= 0x01;

    let mut node = Node::start(LinkConfig::default(), mesh.node(), &mut keys).unwrap();
    assert_eq!(node.session().psk_state(), PskState::Error);
    assert!(node.take_output().contains("checksum mismatch"));

    node.type_bytes(b"1HI\r").unwrap();
    assert!(node.take_output().contains("Cannot send data - PSK not valid!"));
    assert_eq!(mesh.delivered() + mesh.dropped(), 0);
}

#[test]
fn test_key_survives_restart_on_file_image() {
    let path = std::env::temp_dir().join(format!("salsalink-two-node-{}.eeprom", std::process::id()));
    let _ = std::fs::remove_file(&path);

    {
        let mut keys = KeyStore::new(FileEeprom::open(&path).unwrap());
        keys.store(&PresharedKey::from_hex(KEY_HEX).unwrap()).unwrap();
    }

    let mesh = LoopbackMesh::new();
    let mut keys = KeyStore::new(FileEeprom::open(&path).unwrap());
    let mut sender = Node::start(LinkConfig::default(), mesh.node(), &mut keys).unwrap();
    assert_eq!(sender.session().psk_state(), PskState::Valid);
    assert!(!sender.take_output().contains("fallback key"));

    let mut listener = start(&mesh, LinkConfig::default());
    sender.type_bytes(b"1").unwrap();
    listener.type_bytes(b"2").unwrap();
    let output = send_line(&mut sender, &mut listener, "persisted");
    assert_eq!(received(&output), vec!["persisted"]);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_firmware_compatible_pair() {
    let long = "0123456789".repeat(10);
    let (_mesh, mut sender, mut listener) = pair(LinkConfig::firmware_compatible());

    let output = send_line(&mut sender, &mut listener, &long);
    assert_eq!(received(&output), vec![long]);
}

#[test]
fn test_counter_modes_diverge_after_first_block() {
    let long = "ABCDEFGHIJ".repeat(10);
    let mesh = LoopbackMesh::new();
    let mut sender = start(
        &mesh,
        LinkConfig::default().with_counter_mode(CounterMode::Frozen),
    );
    let mut listener = start(&mesh, LinkConfig::default());
    sender.type_bytes(b"1").unwrap();
    listener.type_bytes(b"2").unwrap();
    listener.take_output();

    let output = send_line(&mut sender, &mut listener, &long);
    let messages = received(&output);

    assert_eq!(messages.len(), 1);
    assert_eq!(&messages[0][..64], &long[..64]);
    assert_ne!(&messages[0][64..], &long[64..]);
}
