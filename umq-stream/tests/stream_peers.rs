//! Two full peers over framed byte streams: in-process duplex pipes and
//! a real TCP socket.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use umq_peer::{Peer, PeerError, ready_attachment};
use umq_stream::{StreamConnection, StreamListener, connect};

async fn recv<F: std::future::Future>(fut: F) -> F::Output {
    timeout(Duration::from_secs(5), fut).await.expect("timed out")
}

async fn handshake(client_conn: StreamConnection, server_conn: StreamConnection) -> (Peer, Peer) {
    let (client, welcome) = Peer::start_client(client_conn, "hi", Vec::new());
    let (server, hello) = Peer::start_server(server_conn);
    let hello = recv(hello).await.unwrap();
    assert_eq!(hello.text, "hi");
    server.accept_client("ok", Vec::new());
    assert_eq!(recv(welcome).await.unwrap().text, "ok");
    (client, server)
}

#[tokio::test]
async fn rpc_with_attachments_over_duplex_pipe() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (client, server) = handshake(StreamConnection::new(a), StreamConnection::new(b)).await;

    let server_task = tokio::spawn(async move {
        let request = server.rpc_server().await.unwrap();
        assert_eq!(request.text, "thumbnail");
        let blob = recv(request.attachments[0].clone()).await.unwrap();
        assert_eq!(blob.as_ref(), b"image-bytes");
        server.rpc_result(request.id, "done", vec![ready_attachment(Bytes::from_static(b"thumb"))]);
    });
    tokio::task::yield_now().await;

    let response = recv(client.rpc_call("thumbnail", vec![ready_attachment(&b"image-bytes"[..])]))
        .await
        .unwrap();
    assert_eq!(response.text, "done");
    assert_eq!(
        recv(response.attachments[0].clone()).await.unwrap().as_ref(),
        b"thumb"
    );
    server_task.await.unwrap();
}

#[tokio::test]
async fn subscription_stream_over_tcp() {
    let listener = StreamListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let client_conn = connect(addr).await.unwrap();
    let server_conn = accept_task.await.unwrap();

    let (client, server) = handshake(client_conn, server_conn).await;

    let id = client.create_subscription();
    let first = client.listen_subscription(id);
    let topic = server.begin_publish(id);
    assert!(recv(topic.publish("tick-1", Vec::new())).await);
    assert_eq!(recv(first).await.unwrap().text, "tick-1");

    let second = client.listen_subscription(id);
    topic.close();
    assert_eq!(recv(second).await.unwrap_err(), PeerError::SubscriptionClosed);

    client.close();
    assert_eq!(recv(server.close_event()).await, Ok(()));
}

#[tokio::test]
async fn peer_disappearing_rejects_pending_calls() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (client, server) = handshake(StreamConnection::new(a), StreamConnection::new(b)).await;

    server.shutdown();
    let pending = client.rpc_call("never answered", Vec::new());
    assert_eq!(recv(pending).await.unwrap_err(), PeerError::Disconnected);
    assert_eq!(recv(client.close_event()).await, Ok(()));
}
