//! A client sends a request type the server never registered a handler
//! for; the client must observe `TransportError::UnknownMessageType`
//! specifically, not a generic handler failure.

mod common;

use cluster_rpc::{Address, TcpClient, TcpServer, TokioContext, TransportError};
use common::{any_ctx, init_tracing, run_on};
use tokio::sync::oneshot;

#[tokio::test]
async fn unregistered_request_type_fails_as_unknown_message_type() {
    init_tracing();
    let server_ctx = TokioContext::spawn_new("unknown-type-test-server");
    let client_ctx = TokioContext::spawn_new("unknown-type-test-client");
    let server_ctx_any = any_ctx(&server_ctx);
    let client_ctx_any = any_ctx(&client_ctx);

    let server = TcpServer::new(server_ctx_any.clone());
    let bind_address = Address::new("127.0.0.1", 0).unwrap();

    run_on(&server_ctx, {
        let server = server.clone();
        async move {
            // No handlers registered at all: every request type is unknown.
            server.listen(bind_address, Box::new(|_conn| {})).await.unwrap();
        }
    })
    .await;

    let bound = server.local_addr().unwrap();
    let client = TcpClient::new(client_ctx_any, "unknown-type-client-id");
    let connect_address = Address::new(bound.ip().to_string(), bound.port()).unwrap();

    let (tx, rx) = oneshot::channel();
    client_ctx.executor().spawn(async move {
        let connection = client.connect(connect_address).await.unwrap();
        let reply = connection.send::<u64, u64>(99).await;
        let _ = tx.send((connection, reply));
    });
    let (connection, reply) = rx.await.unwrap();

    assert!(matches!(reply, Err(TransportError::UnknownMessageType(_))));

    connection.close().await;
    server.close().await;
    server_ctx.shutdown();
    client_ctx.shutdown();
}
