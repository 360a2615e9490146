//! End-to-end scenarios from spec §8, exercised against the real sockets
//! (no mocked transport) the way the teacher's own tests prefer real I/O
//! over mocks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::net::TcpStream;

use sniproxy::address::Address;
use sniproxy::connection::Connection;
use sniproxy::listener::{Listener, Protocol};
use sniproxy::reactor::Reactor;
use sniproxy::resolver::Resolver;
use sniproxy::table::{Backend, Table, TableHandle};

/// A minimal TCP echo backend: replies to every connection with a fixed
/// banner line and then closes.
async fn spawn_banner_backend(banner: &'static str) -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(banner.as_bytes()).await;
            });
        }
    });
    addr
}

fn test_reactor() -> Arc<Reactor> {
    Reactor::new(Resolver::new(&[], &[]))
}

/// Build a minimal TLS ClientHello carrying `host` in its SNI extension,
/// reusing the same byte layout the parser's own unit tests build.
fn tls_client_hello(host: &[u8]) -> Vec<u8> {
    fn u16b(n: u16) -> [u8; 2] {
        n.to_be_bytes()
    }
    let mut server_name_entry = vec![0u8];
    server_name_entry.extend_from_slice(&u16b(host.len() as u16));
    server_name_entry.extend_from_slice(host);
    let mut server_name_list = Vec::new();
    server_name_list.extend_from_slice(&u16b(server_name_entry.len() as u16));
    server_name_list.extend_from_slice(&server_name_entry);
    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&u16b(0x0000));
    sni_ext.extend_from_slice(&u16b(server_name_list.len() as u16));
    sni_ext.extend_from_slice(&server_name_list);
    let mut hello_body = Vec::new();
    hello_body.extend_from_slice(&[0x03, 0x03]);
    hello_body.extend_from_slice(&[0u8; 32]);
    hello_body.push(0);
    hello_body.extend_from_slice(&u16b(2));
    hello_body.extend_from_slice(&[0x13, 0x01]);
    hello_body.push(1);
    hello_body.push(0);
    hello_body.extend_from_slice(&u16b(sni_ext.len() as u16));
    hello_body.extend_from_slice(&sni_ext);
    let mut handshake = vec![0x01];
    let len = hello_body.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello_body);
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&u16b(handshake.len() as u16));
    record.extend_from_slice(&handshake);
    record
}

/// Same as `tls_client_hello` but with no server_name extension at all.
fn tls_client_hello_no_sni() -> Vec<u8> {
    fn u16b(n: u16) -> [u8; 2] {
        n.to_be_bytes()
    }
    let mut hello_body = Vec::new();
    hello_body.extend_from_slice(&[0x03, 0x03]);
    hello_body.extend_from_slice(&[0u8; 32]);
    hello_body.push(0);
    hello_body.extend_from_slice(&u16b(2));
    hello_body.extend_from_slice(&[0x13, 0x01]);
    hello_body.push(1);
    hello_body.push(0);
    hello_body.extend_from_slice(&u16b(0));
    let mut handshake = vec![0x01];
    let len = hello_body.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello_body);
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&u16b(handshake.len() as u16));
    record.extend_from_slice(&handshake);
    record
}

#[tokio::test]
async fn tls_sni_routes_to_matching_backend() {
    let backend_addr = spawn_banner_backend("hello from tls backend\n").await;

    let table = Table::new(
        None,
        vec![Backend::new(
            "^nginx1\\.umbrella\\.com$",
            Address::Sockaddr(sniproxy::address::SockAddr::Inet(backend_addr)),
            false,
        )
        .unwrap()],
        false,
    );

    let frontend = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = frontend.local_addr().unwrap();
    let listener = Listener::new(
        Address::parse(&local.to_string()).unwrap(),
        Protocol::Tls,
        TableHandle::new(table),
        None,
        None,
        false,
        None,
        true,
    );
    let reactor = test_reactor();

    tokio::spawn(async move {
        let (stream, peer) = frontend.accept().await.unwrap();
        Connection::new(stream, peer, local, listener, reactor).run().await;
    });

    let mut client = TcpStream::connect(local).await.unwrap();
    client
        .write_all(&tls_client_hello(b"nginx1.umbrella.com"))
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut response))
        .await
        .expect("response within timeout")
        .unwrap();
    assert_eq!(response, b"hello from tls backend\n");
}

#[tokio::test]
async fn http_host_header_with_port_is_stripped_before_routing() {
    let backend_addr = spawn_banner_backend("hello from http backend\n").await;

    let table = Table::new(
        None,
        vec![Backend::new(
            "^example\\.com$",
            Address::Sockaddr(sniproxy::address::SockAddr::Inet(backend_addr)),
            false,
        )
        .unwrap()],
        false,
    );

    let frontend = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = frontend.local_addr().unwrap();
    let listener = Listener::new(
        Address::parse(&local.to_string()).unwrap(),
        Protocol::Http,
        TableHandle::new(table),
        None,
        None,
        false,
        None,
        true,
    );
    let reactor = test_reactor();

    tokio::spawn(async move {
        let (stream, peer) = frontend.accept().await.unwrap();
        Connection::new(stream, peer, local, listener, reactor).run().await;
    });

    let mut client = TcpStream::connect(local).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com:9999\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut response))
        .await
        .expect("response within timeout")
        .unwrap();
    assert_eq!(response, b"hello from http backend\n");
}

#[tokio::test]
async fn missing_sni_with_no_fallback_gets_abort_alert() {
    let table = Table::new(
        None,
        vec![Backend::new("^only\\.this\\.matches$", Address::parse("127.0.0.1:1").unwrap(), false).unwrap()],
        false,
    );

    let frontend = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = frontend.local_addr().unwrap();
    let listener = Listener::new(
        Address::parse(&local.to_string()).unwrap(),
        Protocol::Tls,
        TableHandle::new(table),
        None,
        None,
        false,
        None,
        true,
    );
    let reactor = test_reactor();

    tokio::spawn(async move {
        let (stream, peer) = frontend.accept().await.unwrap();
        Connection::new(stream, peer, local, listener, reactor).run().await;
    });

    let mut client = TcpStream::connect(local).await.unwrap();
    client.write_all(&tls_client_hello_no_sni()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut response))
        .await
        .expect("response within timeout")
        .unwrap();
    assert_eq!(response, sniproxy::parse::tls::ABORT_MESSAGE);
}

#[tokio::test]
async fn binder_rebinding_the_same_address_fails() {
    use sniproxy::binder::SockKind;

    let binder = sniproxy::binder::Binder::start().expect("binder should start");
    let addr = Address::parse("127.0.0.1:0").unwrap();

    let first = binder.bind(&addr, SockKind::Stream);
    assert!(first.is_ok(), "first bind should succeed: {:?}", first.err());

    // Binding an ephemeral (`:0`) address twice doesn't guarantee a
    // collision since each request picks its own free port, so instead
    // bind a fixed, almost-certainly-free high port twice in a row: the
    // first bind succeeds, the second must fail with the child's relayed
    // error since the port is now held (not yet listening, but still bound).
    let fixed = Address::parse("127.0.0.1:18943").unwrap();
    let held = binder
        .bind(&fixed, SockKind::Stream)
        .expect("first fixed bind should succeed");
    let second = binder.bind(&fixed, SockKind::Stream);
    assert!(second.is_err(), "rebinding a held port should fail");

    drop(held);
    binder.stop().ok();
}
