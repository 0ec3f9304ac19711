//! Fan-out through the façade with many concurrent writers and subscribers.

use std::time::Duration;

use axiom_core::{Coordinates, CoreConfig, Layer, TokenAttrs, TokenPatch, Vec3};
use axiom_signal::{Axiom, SignalConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_subscriber_sees_every_change() {
    let ax = Axiom::new(CoreConfig::default(), SignalConfig::default()).unwrap();
    let mut subs = Vec::new();
    for i in 0..3 {
        let sub = ax.register_connection(format!("conn-{i}")).unwrap();
        ax.subscribe(sub.id(), ["tokens"]).unwrap();
        subs.push(sub);
    }

    let writers: Vec<_> = (0..4u8)
        .map(|w| {
            let ax = ax.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    ax.create_token(
                        &TokenAttrs::new(w, w),
                        Coordinates::new().with(Layer::Physical, Vec3::new(i as f32, 0.0, 0.0)),
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap();
    }

    for sub in &mut subs {
        let mut seen = 0;
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
            assert_eq!(msg.payload["type"], "created");
            seen += 1;
        }
        assert_eq!(seen, 40);
    }
    assert_eq!(ax.status().registry.delivered, 120);
}

#[tokio::test]
async fn unregistered_connection_receives_nothing_more() {
    let ax = Axiom::new(CoreConfig::default(), SignalConfig::default()).unwrap();
    let mut sub = ax.register_connection("gone").unwrap();
    ax.subscribe(sub.id(), ["tokens"]).unwrap();
    ax.unregister_connection(sub.id()).unwrap();

    ax.create_token(&TokenAttrs::default(), Coordinates::new())
        .unwrap();
    assert!(sub.recv().await.is_none());
    assert_eq!(ax.status().registry.connections, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_token_lifecycle_arrives_in_order() {
    let signal = SignalConfig {
        subscriber_buffer: 8_192,
        ..SignalConfig::default()
    };
    let ax = Axiom::new(CoreConfig::default(), signal).unwrap();
    let mut sub = ax.register_connection("mirror").unwrap();
    ax.subscribe(sub.id(), ["tokens"]).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let ax = ax.clone();
            tokio::spawn(async move {
                for i in 0..250 {
                    let token = ax
                        .create_token(&TokenAttrs::default(), Coordinates::new())
                        .unwrap();
                    ax.update_token(
                        token.id,
                        &TokenPatch::new().set_layer(Layer::Social, Vec3::new(i as f32, 0.0, 0.0)),
                    )
                    .unwrap();
                    ax.delete_token(token.id).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap();
    }

    let mut last_sequence = 0;
    let mut stage = std::collections::HashMap::new();
    for _ in 0..3_000 {
        let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.sequence > last_sequence);
        last_sequence = msg.sequence;

        let id = msg.payload["token"]["id"]
            .as_u64()
            .or_else(|| msg.payload["id"].as_u64())
            .unwrap();
        let kind = msg.payload["type"].as_str().unwrap().to_string();
        let previous = stage.insert(id, kind.clone());
        let expected = match kind.as_str() {
            "created" => None,
            "updated" => Some("created"),
            "deleted" => Some("updated"),
            other => panic!("unexpected event {other}"),
        };
        assert_eq!(previous.as_deref(), expected, "token {id:#x}");
    }
    assert!(stage.values().all(|kind| kind == "deleted"));
    assert_eq!(stage.len(), 1_000);
}
