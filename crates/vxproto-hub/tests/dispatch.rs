//! Packet dispatch between agent connections and module sockets.

use std::sync::Arc;
use std::time::Duration;
use vxproto_hub::file::split_file;
use vxproto_hub::{AgentSocket, HubConfig, Inbound, LoggingApp, MemoryTransport, Transport, VxProto};
use vxproto_policy::ConnectionPolicy;
use vxproto_token::TokenCipher;
use vxproto_types::{wire, AgentInfo, AgentType, Data, File, Packet, Payload};

fn hub_with(config: HubConfig) -> VxProto {
    VxProto::new(Arc::new(LoggingApp), TokenCipher::new(*b"0123456789ab"), config)
}

fn test_hub(files: &tempfile::TempDir) -> VxProto {
    hub_with(HubConfig {
        files_dir: files.path().to_path_buf(),
        ..HubConfig::default()
    })
}

fn agent_info(hub: &VxProto, id: &str, group_id: &str) -> AgentInfo {
    AgentInfo {
        id: id.to_string(),
        agent_type: AgentType::VxAgent,
        group_id: group_id.to_string(),
        ip: "127.0.0.1".to_string(),
        token: hub.cipher().new_token(id, AgentType::VxAgent).unwrap(),
        version: "1.0.0".to_string(),
    }
}

/// Registers an agent connection and returns it with the remote end of its
/// transport.
fn connect(hub: &VxProto, id: &str, group_id: &str) -> (Arc<AgentSocket>, MemoryTransport) {
    let (local, remote) = MemoryTransport::pair();
    let socket = Arc::new(AgentSocket::new(
        agent_info(hub, id, group_id),
        "local-token",
        ConnectionPolicy::Allow,
        Arc::new(local),
    ));
    hub.add_agent(Arc::clone(&socket)).unwrap();
    (socket, remote)
}

fn data_packet(module: &str, dst: &str, body: &[u8]) -> Packet {
    Packet::new(module, dst, Payload::Data(Data { data: body.to_vec() }))
}

async fn read_remote(remote: &MemoryTransport) -> Packet {
    let frame = tokio::time::timeout(Duration::from_secs(1), remote.read())
        .await
        .expect("nothing written to the remote end")
        .unwrap();
    match frame {
        Some(Inbound::Packet(raw)) => wire::decode(&raw).unwrap(),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_inbound_packet_reaches_group_module_with_agent_source() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let module = hub.new_module("M", "G");
    hub.add_module(&module).unwrap();
    let (agent, _remote) = connect(&hub, "agent-1", "G");

    hub.recv_packet(data_packet("M", agent.token(), b"hello"))
        .await
        .unwrap();

    let pkt = module.router().recv_data(1000).await.unwrap().unwrap();
    assert_eq!(pkt.src, agent.token());
    assert_eq!(pkt.bytes(), b"hello");
}

#[tokio::test]
async fn test_groupless_module_serves_every_group() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let shared = hub.new_module("M", "");
    hub.add_module(&shared).unwrap();
    let (agent, _remote) = connect(&hub, "agent-1", "G");

    hub.recv_packet(data_packet("M", agent.token(), b"x"))
        .await
        .unwrap();
    assert!(shared.router().recv_data(1000).await.unwrap().is_some());
}

#[tokio::test]
async fn test_groupless_agent_falls_back_to_single_module() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let only = hub.new_module("M", "G");
    hub.add_module(&only).unwrap();
    let (agent, _remote) = connect(&hub, "agent-1", "");

    hub.recv_packet(data_packet("M", agent.token(), b"x"))
        .await
        .unwrap();
    assert!(only.router().recv_data(1000).await.unwrap().is_some());
}

#[tokio::test]
async fn test_run_loop_pumps_transport_into_modules() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let module = hub.new_module("M", "");
    hub.add_module(&module).unwrap();
    let (agent, remote) = connect(&hub, "agent-1", "");

    let runner = {
        let hub = hub.clone();
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.run(&hub).await })
    };

    let mut pkt = data_packet("M", agent.token(), b"over the wire");
    pkt.src = "ignored".to_string();
    remote.write(&wire::encode(&pkt).unwrap()).await.unwrap();
    remote.write(b"not a packet").await.unwrap();
    remote
        .write(&wire::encode(&data_packet("M", "", b"second")).unwrap())
        .await
        .unwrap();

    let first = module.router().recv_data(1000).await.unwrap().unwrap();
    assert_eq!(first.src, agent.token());
    assert_eq!(first.bytes(), b"over the wire");
    // Garbage is skipped, and an empty destination means this connection.
    let second = module.router().recv_data(1000).await.unwrap().unwrap();
    assert_eq!(second.bytes(), b"second");

    remote.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), runner)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_hostile_chunk_ids_do_not_stop_the_run_loop() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let module = hub.new_module("M", "");
    hub.add_module(&module).unwrap();
    let (agent, remote) = connect(&hub, "agent-1", "");

    let runner = {
        let hub = hub.clone();
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.run(&hub).await })
    };

    let max = u64::MAX;
    let hostile = Packet::new(
        "M",
        agent.token(),
        Payload::File(File {
            data: vec![0; 16],
            name: "evil".to_string(),
            uniq: format!("abc:{max}:{max}"),
            ..File::default()
        }),
    );
    let err = hub.recv_packet(hostile.clone()).await.unwrap_err();
    assert!(matches!(err, vxproto_hub::HubError::BadChunk(_)), "{:?}", err);

    remote.write(&wire::encode(&hostile).unwrap()).await.unwrap();
    remote
        .write(&wire::encode(&data_packet("M", "", b"still here")).unwrap())
        .await
        .unwrap();

    let pkt = module.router().recv_data(1000).await.unwrap().unwrap();
    assert_eq!(pkt.bytes(), b"still here");
    assert!(!runner.is_finished());
    assert_eq!(hub.agent_count(), 1);

    remote.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), runner)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_module_send_is_written_to_the_agent_transport() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let module = hub.new_module("M", "");
    hub.add_module(&module).unwrap();
    let (agent, remote) = connect(&hub, "agent-1", "");

    let (pkt, waiter) = data_packet("M", agent.token(), b"reply").with_ack();
    module.send_packet(pkt).await.unwrap();
    assert!(waiter.wait().await);

    let written = read_remote(&remote).await;
    assert_eq!(written.src, "local-token");
    assert_eq!(written.dst, agent.token());
    assert_eq!(written.bytes(), b"reply");
}

#[tokio::test]
async fn test_inbound_packet_is_replayed_after_agent_connects() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let module = hub.new_module("M", "");
    hub.add_module(&module).unwrap();

    let token = hub.cipher().new_token("late", AgentType::VxAgent).unwrap();
    hub.recv_packet(data_packet("M", &token, b"early"))
        .await
        .unwrap();
    assert_eq!(hub.deferred_len().0, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let (agent, _remote) = connect(&hub, "late", "");
    assert_eq!(agent.token(), token);

    let pkt = module.router().recv_data(300).await.unwrap().unwrap();
    assert_eq!(pkt.bytes(), b"early");
    assert_eq!(pkt.src, token);
}

#[tokio::test]
async fn test_full_mailbox_does_not_stall_replay_for_other_modules() {
    let files = tempfile::tempdir().unwrap();
    let hub = hub_with(HubConfig {
        mailbox_capacity: 1,
        files_dir: files.path().to_path_buf(),
        ..HubConfig::default()
    });
    let slow = hub.new_module("slow", "");
    hub.add_module(&slow).unwrap();
    let fast = hub.new_module("fast", "");
    hub.add_module(&fast).unwrap();

    let token = hub.cipher().new_token("late", AgentType::VxAgent).unwrap();
    hub.recv_packet(data_packet("slow", &token, b"s1")).await.unwrap();
    hub.recv_packet(data_packet("slow", &token, b"s2")).await.unwrap();
    hub.recv_packet(data_packet("fast", &token, b"f1")).await.unwrap();
    assert_eq!(hub.deferred_len().0, 3);

    let _conn = connect(&hub, "late", "");

    let pkt = fast.router().recv_data(1000).await.unwrap().unwrap();
    assert_eq!(pkt.bytes(), b"f1");
    // The packet that did not fit stays parked until the mailbox drains.
    assert_eq!(hub.deferred_len().0, 1);

    let first = slow.router().recv_data(1000).await.unwrap().unwrap();
    assert_eq!(first.bytes(), b"s1");
    let second = slow.router().recv_data(1000).await.unwrap().unwrap();
    assert_eq!(second.bytes(), b"s2");
    assert_eq!(hub.deferred_len().0, 0);
}

#[tokio::test]
async fn test_inbound_packet_waits_for_its_module() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let (agent, _remote) = connect(&hub, "agent-1", "");

    hub.recv_packet(data_packet("late-module", agent.token(), b"x"))
        .await
        .unwrap();

    let module = hub.new_module("late-module", "");
    hub.add_module(&module).unwrap();
    assert!(module.router().recv_data(300).await.unwrap().is_some());
}

#[tokio::test]
async fn test_outbound_packet_is_replayed_after_agent_connects() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let module = hub.new_module("M", "");
    hub.add_module(&module).unwrap();

    let token = hub.cipher().new_token("late", AgentType::VxAgent).unwrap();
    module.send_data_to(&token, b"queued".to_vec()).await.unwrap();
    assert_eq!(hub.deferred_len().1, 1);

    let (_agent, remote) = connect(&hub, "late", "");
    let written = read_remote(&remote).await;
    assert_eq!(written.bytes(), b"queued");
}

#[tokio::test]
async fn test_expired_deferred_packet_is_never_delivered() {
    let files = tempfile::tempdir().unwrap();
    let hub = hub_with(HubConfig {
        deferred_ttl: Duration::from_millis(150),
        files_dir: files.path().to_path_buf(),
        ..HubConfig::default()
    });
    let module = hub.new_module("M", "");
    hub.add_module(&module).unwrap();

    let token = hub.cipher().new_token("late", AgentType::VxAgent).unwrap();
    let (pkt, waiter) = data_packet("M", &token, b"stale").with_ack();
    hub.recv_packet(pkt).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hub.deferred_len().0, 0);
    let _conn = connect(&hub, "late", "");

    assert!(module.router().recv_data(300).await.unwrap().is_none());
    assert!(!waiter.wait().await);
}

#[tokio::test]
async fn test_route_forwards_to_the_owning_connection() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let (upstream, remote) = connect(&hub, "aggregator", "");
    hub.add_route("behind-the-aggregator", upstream.token());
    assert_eq!(hub.get_route("behind-the-aggregator").as_deref(), Some(upstream.token()));

    // Inbound traffic for a routed destination goes back out.
    hub.recv_packet(data_packet("M", "behind-the-aggregator", b"hop"))
        .await
        .unwrap();
    let written = read_remote(&remote).await;
    assert_eq!(written.dst, "behind-the-aggregator");
    assert_eq!(written.bytes(), b"hop");

    hub.del_agent(upstream.token()).unwrap();
    assert!(hub.get_route("behind-the-aggregator").is_none());
}

#[tokio::test]
async fn test_chunked_file_from_agent_is_reassembled_in_any_order() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let module = hub.new_module("M", "");
    hub.add_module(&module).unwrap();
    let (agent, _remote) = connect(&hub, "agent-1", "");

    let data: Vec<u8> = (0..vxproto_hub::FILE_CHUNK_SIZE * 4 + 17)
        .map(|i| (i * 7 % 256) as u8)
        .collect();
    let mut chunks = split_file("M", agent.token(), "payload.bin", &data, false);
    assert_eq!(chunks.len(), 5);
    chunks.reverse();
    for chunk in chunks {
        hub.recv_packet(chunk).await.unwrap();
    }

    let pkt = module.router().recv_file(1000).await.unwrap().unwrap();
    let file = pkt.file().unwrap();
    assert!(file.data.is_empty());
    assert_eq!(std::fs::read(&file.path).unwrap(), data);
    assert!(!std::path::Path::new(&format!("{}.meta", file.path)).exists());
    // Only the completed file reaches the module.
    assert!(module.router().recv_packet(0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_file_sent_from_path_arrives_in_chunks() {
    let files = tempfile::tempdir().unwrap();
    let hub = test_hub(&files);
    let module = hub.new_module("M", "");
    hub.add_module(&module).unwrap();
    let (agent, remote) = connect(&hub, "agent-1", "");

    let src = files.path().join("report.txt");
    std::fs::write(&src, vec![b'r'; vxproto_hub::FILE_CHUNK_SIZE + 5]).unwrap();
    module.send_file_from_path(agent.token(), &src).await.unwrap();

    let first = read_remote(&remote).await;
    let second = read_remote(&remote).await;
    assert_eq!(first.file().unwrap().name, "report.txt");
    assert!(first.file().unwrap().uniq.ends_with(":1:2"));
    assert!(second.file().unwrap().uniq.ends_with(":2:2"));
    assert_eq!(second.bytes().len(), 5);
}
