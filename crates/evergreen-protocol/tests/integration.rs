//! End-to-end tests: an engine talking to a scripted remote action host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use evergreen_core::{BasicMimetypeCodec, Chunk, SessionId, SessionRegistry, StreamError, StreamId};
use evergreen_protocol::{ActionRequest, Evergreen, EvergreenConfig, Invocation};
use evergreen_telemetry::{init_telemetry, TelemetryConfig};
use evergreen_transport::{
    encode_chunk, MemoryNetwork, MemoryPeer, NodeFragment, SessionMessage, WebSocketFactory,
    WireChunk,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn memory_engine() -> (Evergreen, mpsc::UnboundedReceiver<(String, MemoryPeer)>) {
    let (network, peers) = MemoryNetwork::new();
    let config = EvergreenConfig {
        address: "memory://action-host".into(),
        ..EvergreenConfig::default()
    };
    (Evergreen::new(config, Arc::new(network)), peers)
}

fn text(s: &str) -> Option<WireChunk> {
    Some(encode_chunk(&Chunk::text(s), &BasicMimetypeCodec))
}

fn output_id(invocation: &Invocation, name: &str) -> StreamId {
    invocation.output_ids()[name].clone()
}

async fn read_texts(pipe: &evergreen_core::Pipe) -> Vec<String> {
    timeout(TIMEOUT, pipe.read_all())
        .await
        .expect("output did not finish")
        .expect("output failed")
        .iter()
        .filter_map(|c| c.as_text().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn children_arriving_before_parent_are_reassembled() {
    let (engine, mut peers) = memory_engine();
    let registry = SessionRegistry::new();
    let reply = registry.create_pipe();

    let invocation = engine
        .invoke(ActionRequest::new(SessionId::new(), "model", "generate").output("reply", reply.clone()))
        .await
        .unwrap();
    let (_, peer) = peers.recv().await.unwrap();
    let root = output_id(&invocation, "reply");
    let (a, b) = (StreamId::new(), StreamId::new());

    peer.send(&SessionMessage::fragments(vec![
        NodeFragment::leaf(b.clone(), 0, false, text("world")),
        NodeFragment::leaf(a.clone(), 0, true, text("hello")),
        NodeFragment::leaf(a.clone(), 1, false, text(", ")),
    ]));
    peer.send(&SessionMessage::fragments(vec![NodeFragment::node(root, 0, false, vec![a, b])]));

    assert_eq!(read_texts(&reply).await, ["hello", ", ", "world"]);
    assert!(invocation.is_complete());
    assert_eq!(invocation.pending_fragments(), 0);
}

#[tokio::test]
async fn parent_first_multi_level_tree() {
    let (engine, mut peers) = memory_engine();
    let registry = SessionRegistry::new();
    let reply = registry.create_pipe();

    let invocation = engine
        .invoke(ActionRequest::new(SessionId::new(), "model", "generate").output("reply", reply.clone()))
        .await
        .unwrap();
    let (_, peer) = peers.recv().await.unwrap();
    let root = output_id(&invocation, "reply");
    let (section, leaf_a, leaf_b) = (StreamId::new(), StreamId::new(), StreamId::new());

    peer.send(&SessionMessage::fragments(vec![
        NodeFragment::node(root.clone(), 0, true, vec![section.clone()]),
        NodeFragment::node(section.clone(), 0, false, vec![leaf_a.clone()]),
        NodeFragment::leaf(leaf_a, 0, false, text("one")),
    ]));
    // Root still open: it may declare more children.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(reply.is_open());

    peer.send(&SessionMessage::fragments(vec![
        NodeFragment::node(root, 1, false, vec![leaf_b.clone()]),
        NodeFragment::leaf(leaf_b, 0, false, text("two")),
    ]));
    assert_eq!(read_texts(&reply).await, ["one", "two"]);
}

#[tokio::test]
async fn inputs_are_pumped_independently_with_increasing_seq() {
    let (engine, mut peers) = memory_engine();
    let registry = SessionRegistry::new();
    let (left, right) = (registry.create_pipe(), registry.create_pipe());

    let invocation = engine
        .invoke(
            ActionRequest::new(SessionId::new(), "mixer", "mix")
                .input("left", left.clone())
                .input("right", right.clone()),
        )
        .await
        .unwrap();

    let writers = [(left, "l"), (right, "r")].map(|(pipe, tag)| {
        tokio::spawn(async move {
            for i in 0..20 {
                pipe.write(Chunk::text(format!("{tag}{i}"))).unwrap();
                tokio::task::yield_now().await;
            }
            pipe.close().unwrap();
        })
    });
    for writer in writers {
        writer.await.unwrap();
    }
    timeout(TIMEOUT, invocation.wait_inputs()).await.unwrap();

    let (_, mut peer) = peers.recv().await.unwrap();
    let mut by_id: HashMap<StreamId, Vec<NodeFragment>> = HashMap::new();
    for fragment in peer.drain().into_iter().flat_map(|m| m.node_fragments) {
        by_id.entry(fragment.id.clone().unwrap()).or_default().push(fragment);
    }

    assert_eq!(by_id.len(), 2);
    for id in invocation.input_ids().values() {
        let fragments = &by_id[id];
        assert_eq!(fragments.len(), 21);
        for (n, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.seq, Some(n as u64));
        }
        assert!(fragments[..20].iter().all(|f| f.continued));
        assert!(!fragments[20].continued);
    }
}

#[tokio::test]
async fn decode_error_only_fails_its_output() {
    let (engine, mut peers) = memory_engine();
    let registry = SessionRegistry::new();
    let (good, bad) = (registry.create_pipe(), registry.create_pipe());

    let invocation = engine
        .invoke(
            ActionRequest::new(SessionId::new(), "model", "generate")
                .output("good", good.clone())
                .output("bad", bad.clone()),
        )
        .await
        .unwrap();
    let (_, peer) = peers.recv().await.unwrap();

    let garbage = WireChunk {
        metadata: None,
        reference: Some("blob://1".into()),
        data: Some("aGk=".into()),
    };
    peer.send(&SessionMessage::fragments(vec![
        NodeFragment::leaf(output_id(&invocation, "bad"), 0, true, Some(garbage)),
        NodeFragment::leaf(output_id(&invocation, "good"), 0, false, text("fine")),
    ]));

    assert_eq!(read_texts(&good).await, ["fine"]);
    assert!(matches!(
        timeout(TIMEOUT, bad.read_all()).await.unwrap(),
        Err(StreamError::Decode(_))
    ));
}

#[tokio::test]
async fn session_reuses_connection_until_it_drops() {
    let (engine, mut peers) = memory_engine();
    let registry = SessionRegistry::new();
    let session = SessionId::new();

    let request = || ActionRequest::new(session.clone(), "model", "generate").output("reply", registry.create_pipe());
    let _first = engine.invoke(request()).await.unwrap();
    let _second = engine.invoke(request()).await.unwrap();

    let (_, mut peer) = peers.recv().await.unwrap();
    assert_eq!(peer.drain().len(), 2);
    assert!(peers.try_recv().is_err());

    peer.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _third = engine.invoke(request()).await.unwrap();
    let (_, mut replacement) = peers.recv().await.unwrap();
    assert_eq!(replacement.drain().len(), 1);
    assert_eq!(engine.cache().len(), 1);
}

/// Minimal action host: echoes every input fragment onto the output with the
/// same index.
async fn echo_host() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut routes: HashMap<StreamId, StreamId> = HashMap::new();
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(raw) = msg else { continue };
            let message: SessionMessage = serde_json::from_str(raw.as_str()).unwrap();
            for action in &message.actions {
                for (input, output) in action.inputs.iter().zip(&action.outputs) {
                    routes.insert(input.id.clone(), output.id.clone());
                }
            }
            let echoed: Vec<NodeFragment> = message
                .node_fragments
                .into_iter()
                .filter_map(|mut f| {
                    f.id = Some(routes.get(f.id.as_ref()?)?.clone());
                    Some(f)
                })
                .collect();
            if !echoed.is_empty() {
                let reply = serde_json::to_string(&SessionMessage::fragments(echoed)).unwrap();
                ws.send(Message::Text(reply.into())).await.unwrap();
            }
        }
    });
    format!("ws://{addr}/session")
}

#[tokio::test]
async fn websocket_round_trip() {
    let _telemetry = init_telemetry(TelemetryConfig {
        json: false,
        ..TelemetryConfig::default()
    });
    let address = echo_host().await;
    let engine = Evergreen::new(EvergreenConfig::default(), Arc::new(WebSocketFactory));
    let registry = SessionRegistry::new();
    let (prompt, reply) = (registry.create_pipe(), registry.create_pipe());
    prompt.write(Chunk::text("ping")).unwrap();
    prompt.write(Chunk::text("pong")).unwrap();
    prompt.close().unwrap();

    let invocation = engine
        .invoke(
            ActionRequest::new(SessionId::new(), "echo", "echo")
                .address(address)
                .input("prompt", prompt)
                .output("reply", reply.clone()),
        )
        .await
        .unwrap();
    timeout(TIMEOUT, invocation.wait_inputs()).await.unwrap();

    assert_eq!(read_texts(&reply).await, ["ping", "pong"]);
    engine.cache().close_all().await;
}
