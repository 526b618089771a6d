//! Loopback TCP tests for the connection acceptor.

use connect_server::{
    ConnectServerConfig, ConnectServerError, ConnectionAcceptor, TcpTransport, TracingInterpreter, HELLO_PACKET,
};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn tcp_acceptor() -> ConnectionAcceptor {
    let config = ConnectServerConfig {
        timeout: Duration::from_secs(5),
        ..Default::default()
    };
    ConnectionAcceptor::builder(config, TcpTransport::localhost(), TracingInterpreter::factory())
        .build()
        .unwrap()
}

async fn wait_for_len(acceptor: &ConnectionAcceptor, expected: usize) {
    let registry = acceptor.registry();
    timeout(Duration::from_secs(5), async {
        while registry.len() != expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("registry did not reach the expected size");
}

#[tokio::test]
async fn test_client_receives_hello_and_is_tracked() {
    let acceptor = tcp_acceptor();
    let local_addr = acceptor.start(0, 128).await.unwrap();

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let mut hello = [0u8; 4];
    timeout(Duration::from_secs(5), client.read_exact(&mut hello))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hello, HELLO_PACKET);

    wait_for_len(&acceptor, 1).await;
    let session = acceptor.sessions().remove(0);
    assert_eq!(session.endpoint(), client.local_addr().unwrap());

    drop(client);
    wait_for_len(&acceptor, 0).await;
    let registry = acceptor.registry();
    timeout(Duration::from_secs(5), async {
        while registry.changes() != 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("removal was not signalled");

    acceptor.stop().await;
}

#[tokio::test]
async fn test_disconnect_all_closes_client_sockets() {
    let acceptor = tcp_acceptor();
    let local_addr = acceptor.start(0, 128).await.unwrap();

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let mut hello = [0u8; 4];
    client.read_exact(&mut hello).await.unwrap();
    wait_for_len(&acceptor, 1).await;

    acceptor.stop().await;
    acceptor.disconnect_all().await;
    assert!(acceptor.wait_until_empty(Duration::from_secs(5)).await);

    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_port_in_use_is_a_bind_error() {
    let first = tcp_acceptor();
    let local_addr = first.start(0, 128).await.unwrap();

    let second = tcp_acceptor();
    let result = second.start(local_addr.port(), 128).await;

    assert!(matches!(result, Err(ConnectServerError::Bind { port, .. }) if port == local_addr.port()));
    first.stop().await;
}
