//! In-process module addressing and topic fan-out.

use std::sync::Arc;
use vxproto_hub::{HubConfig, HubError, LoggingApp, ModuleSocket, VxProto};
use vxproto_token::TokenCipher;

fn test_hub() -> VxProto {
    VxProto::new(
        Arc::new(LoggingApp),
        TokenCipher::new(*b"0123456789ab"),
        HubConfig::default(),
    )
}

fn register(hub: &VxProto, name: &str, group_id: &str) -> Arc<ModuleSocket> {
    let module = hub.new_module(name, group_id);
    hub.add_module(&module).unwrap();
    module
}

#[tokio::test]
async fn test_direct_delivery_by_imc_token() {
    let hub = test_hub();
    let sender = register(&hub, "sender", "");
    let receiver = register(&hub, "receiver", "");

    sender
        .send_data_to(receiver.imc_token(), b"ping".to_vec())
        .await
        .unwrap();

    let pkt = receiver.router().recv_data(1000).await.unwrap().unwrap();
    assert_eq!(pkt.src, sender.imc_token());
    assert_eq!(pkt.bytes(), b"ping");
}

#[tokio::test]
async fn test_topic_fans_out_to_every_subscriber() {
    let hub = test_hub();
    let publisher = register(&hub, "publisher", "");
    let topic = hub.make_imc_topic("events", "");

    let subscribers: Vec<_> = (0..5)
        .map(|i| {
            let m = register(&hub, &format!("sub-{}", i), "");
            m.subscribe(&topic).unwrap();
            m
        })
        .collect();
    assert_eq!(hub.topic_subscribers(&topic).unwrap().len(), 5);

    publisher.send_data_to(&topic, b"first".to_vec()).await.unwrap();
    for m in &subscribers {
        let pkt = m.router().recv_data(1000).await.unwrap().unwrap();
        assert_eq!(pkt.bytes(), b"first");
        assert_eq!(pkt.src, publisher.imc_token());
    }

    subscribers[2].unsubscribe(&topic).unwrap();
    publisher.send_data_to(&topic, b"second".to_vec()).await.unwrap();
    for (i, m) in subscribers.iter().enumerate() {
        let got = m.router().recv_data(if i == 2 { 100 } else { 1000 }).await.unwrap();
        if i == 2 {
            assert!(got.is_none());
        } else {
            assert_eq!(got.unwrap().bytes(), b"second");
        }
    }
}

#[tokio::test]
async fn test_empty_topic_is_removed() {
    let hub = test_hub();
    let m = register(&hub, "m", "");
    let topic = hub.make_imc_topic("t", "");
    m.subscribe(&topic).unwrap();
    m.subscribe(&topic).unwrap();
    assert_eq!(hub.topic_subscribers(&topic).unwrap().len(), 1);

    m.unsubscribe(&topic).unwrap();
    assert!(hub.topic_subscribers(&topic).is_none());
    let err = m.send_data_to(&topic, vec![]).await.unwrap_err();
    assert!(matches!(err, HubError::TopicUnreachable(_)));
}

#[tokio::test]
async fn test_deleted_module_leaves_its_topics() {
    let hub = test_hub();
    let stays = register(&hub, "stays", "");
    let leaves = register(&hub, "leaves", "");
    let topic = hub.make_imc_topic("t", "");
    stays.subscribe(&topic).unwrap();
    leaves.subscribe(&topic).unwrap();

    hub.del_module(&leaves).unwrap();
    assert_eq!(hub.topic_subscribers(&topic).unwrap(), vec![stays.imc_token().to_string()]);

    let err = stays
        .send_data_to(leaves.imc_token(), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::DstUnreachable(_)));
}

#[tokio::test]
async fn test_imc_error_sentinels() {
    let hub = test_hub();
    let m = register(&hub, "m", "");

    let ghost = hub.cipher().make_imc_token("ghost", "");
    assert!(matches!(
        m.send_data_to(&ghost, vec![]).await,
        Err(HubError::DstUnreachable(_))
    ));

    let silent_topic = hub.make_imc_topic("nobody-listens", "");
    assert!(matches!(
        m.send_data_to(&silent_topic, vec![]).await,
        Err(HubError::TopicUnreachable(_))
    ));

    for bad in ["", "ffffffffnothex", "ffff7777"] {
        assert!(
            matches!(m.send_data_to(bad, vec![]).await, Err(HubError::DstMalformed(_))),
            "{:?}",
            bad
        );
    }
    assert!(matches!(m.subscribe("not-a-topic"), Err(HubError::DstMalformed(_))));
}

#[tokio::test]
async fn test_imc_file_transfer_is_reassembled() {
    let files = tempfile::tempdir().unwrap();
    let hub = VxProto::new(
        Arc::new(LoggingApp),
        TokenCipher::new(*b"0123456789ab"),
        HubConfig {
            files_dir: files.path().to_path_buf(),
            ..HubConfig::default()
        },
    );
    let sender = register(&hub, "sender", "");
    let receiver = register(&hub, "receiver", "");

    let data = vec![42u8; vxproto_hub::FILE_CHUNK_SIZE * 2 + 1];
    sender
        .send_file_to(receiver.imc_token(), "blob", &data)
        .await
        .unwrap();

    let pkt = receiver.router().recv_file(1000).await.unwrap().unwrap();
    assert_eq!(std::fs::read(&pkt.file().unwrap().path).unwrap(), data);
}
