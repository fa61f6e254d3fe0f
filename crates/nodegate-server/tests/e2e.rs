//! End-to-end tunnel tests over loopback
//!
//! Each test starts a real server and a real client, then drives public
//! traffic through the server and checks what the local services see.

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use nodegate_client::{Client, ClientConfig, ClientError, TlsMaterial};
use nodegate_proto::TunnelDeclaration;
use nodegate_server::{Server, ServerConfig};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TOKEN: &str = "s3cret";
const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nodegate=debug")
        .with_test_writer()
        .try_init();
}

/// A one-port range that was free a moment ago
async fn free_range(len: u16) -> (u16, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let first = listener.local_addr().unwrap().port();
    (first, format!("{}:{}", first, first + len))
}

async fn start_server(config: ServerConfig) -> Arc<Server> {
    let server = Arc::new(Server::bind(config).await.unwrap());
    tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });
    server
}

fn client_config(server: &Server, id: &str) -> ClientConfig {
    ClientConfig::new(server.local_addr().to_string(), TOKEN, id).with_tls(TlsMaterial::Insecure)
}

fn spawn_client(config: ClientConfig) -> (Arc<Client>, JoinHandle<Result<(), ClientError>>) {
    let client = Arc::new(Client::new(config).unwrap());
    let handle = tokio::spawn({
        let client = client.clone();
        async move { client.start().await }
    });
    (client, handle)
}

/// Poll `check` until it holds or the wait budget runs out
async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// TCP echo service standing in for a node's p2p port
async fn spawn_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    addr
}

/// HTTP service standing in for a node's RPC port
///
/// Answers `201` with `method path body` and echoes the forwarded headers.
async fn spawn_rpc() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();
                    let authorization = req.headers().contains_key("authorization");
                    let forwarded_host = req
                        .headers()
                        .get("x-forwarded-host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let body = req.into_body().collect().await.unwrap().to_bytes();

                    let reply = format!("{} {} {}", method, path, String::from_utf8_lossy(&body));
                    let resp = Response::builder()
                        .status(StatusCode::CREATED)
                        .header("x-saw-forwarded-host", forwarded_host)
                        .header("x-saw-authorization", authorization.to_string())
                        .body(Full::new(Bytes::from(reply)))
                        .unwrap();
                    Ok::<_, Infallible>(resp)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// WebSocket-style service: answers `101` only when the upgrade headers
/// arrive intact, then echoes raw bytes on the upgraded connection
async fn spawn_upgrade_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|mut req: Request<Incoming>| async move {
                    let upgrade = req
                        .headers()
                        .get("upgrade")
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.eq_ignore_ascii_case("websocket"))
                        .unwrap_or(false);
                    if !upgrade {
                        let resp = Response::builder()
                            .status(StatusCode::BAD_REQUEST)
                            .body(Full::new(Bytes::from_static(b"no upgrade header")))
                            .unwrap();
                        return Ok::<_, Infallible>(resp);
                    }

                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        let upgraded = on_upgrade.await.unwrap();
                        let (mut r, mut w) = tokio::io::split(TokioIo::new(upgraded));
                        let _ = tokio::io::copy(&mut r, &mut w).await;
                    });

                    let resp = Response::builder()
                        .status(StatusCode::SWITCHING_PROTOCOLS)
                        .header("connection", "upgrade")
                        .header("upgrade", "websocket")
                        .body(Full::new(Bytes::new()))
                        .unwrap();
                    Ok::<_, Infallible>(resp)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

/// Read an HTTP/1.1 response head byte by byte so nothing after it is consumed
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        timeout(WAIT, stream.read_exact(&mut byte))
            .await
            .unwrap()
            .unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn start_http_entrypoint(server: &Arc<Server>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn({
        let server = server.clone();
        async move { server.serve_http(listener).await }
    });
    addr
}

async fn http_post(
    addr: &str,
    host: &str,
    bearer: Option<&str>,
    body: &'static str,
) -> Response<Bytes> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(conn);

    let mut req = Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("host", host);
    if let Some(token) = bearer {
        req = req.header("authorization", format!("Bearer {}", token));
    }
    let req = req.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap();

    let resp = timeout(WAIT, sender.send_request(req)).await.unwrap().unwrap();
    let (parts, body) = resp.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Response::from_parts(parts, body)
}

async fn echo_round_trip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    public.write_all(payload).await.unwrap();

    let mut buf = vec![0u8; payload.len()];
    timeout(WAIT, public.read_exact(&mut buf)).await.unwrap().unwrap();
    buf
}

// ============================================================================
// TCP tunnels
// ============================================================================

#[tokio::test]
async fn test_tcp_tunnel_echo() {
    init_tracing();
    let (first, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let echo = spawn_echo().await;

    let (client, _handle) = spawn_client(
        client_config(&server, "node-1")
            .with_tunnel("p2p", TunnelDeclaration::tcp(echo, "0.0.0.0:AUTO")),
    );

    let pool = server.port_pool();
    wait_for("port allocation", || {
        let pool = pool.clone();
        async move { pool.lookup_port("node-1").is_ok() }
    })
    .await;
    let port = pool.lookup_port("node-1").unwrap();
    assert_eq!(port, first);

    assert_eq!(echo_round_trip(port, b"enode handshake").await, b"enode handshake");

    // several public connections share the one control connection
    let tasks: Vec<_> = (0..5)
        .map(|i| {
            tokio::spawn(async move {
                let payload = format!("peer-{}", i).into_bytes();
                assert_eq!(echo_round_trip(port, &payload).await, payload);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(server.connection_count(), 1);
    client.stop();
}

#[tokio::test]
async fn test_disconnect_frees_port() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let echo = spawn_echo().await;

    let (client, handle) = spawn_client(
        client_config(&server, "node-1")
            .with_tunnel("p2p", TunnelDeclaration::tcp(echo, "127.0.0.1:AUTO")),
    );

    let pool = server.port_pool();
    wait_for("port allocation", || {
        let pool = pool.clone();
        async move { pool.lookup_port("node-1").is_ok() }
    })
    .await;
    let port = pool.lookup_port("node-1").unwrap();
    assert_eq!(echo_round_trip(port, b"ping").await, b"ping");

    client.stop();
    assert!(timeout(WAIT, handle).await.unwrap().unwrap().is_ok());

    wait_for("port release", || {
        let pool = pool.clone();
        async move { pool.lookup_port("node-1").is_err() }
    })
    .await;
    wait_for("listener close", || async move {
        TcpStream::connect(("127.0.0.1", port)).await.is_err()
    })
    .await;

    assert!(server.registry().client_names().is_empty());
    assert_eq!(pool.acquire("node-2", "p2p").unwrap(), port);
}

#[tokio::test]
async fn test_stop_tears_down_every_client() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let echo = spawn_echo().await;
    let rpc = spawn_rpc().await;

    let (client, _handle) = spawn_client(
        client_config(&server, "node-1")
            .with_tunnel("p2p", TunnelDeclaration::tcp(echo, "127.0.0.1:AUTO"))
            .with_tunnel(
                "rpc",
                TunnelDeclaration::http("n1.example", format!("http://{}", rpc)),
            ),
    );

    let pool = server.port_pool();
    wait_for("port allocation", || {
        let pool = pool.clone();
        async move { pool.lookup_port("node-1").is_ok() }
    })
    .await;
    let port = pool.lookup_port("node-1").unwrap();
    assert!(server.registry().subscriber("n1.example").is_some());

    server.stop();
    server.stop();

    wait_for("teardown", || {
        let done = server.address_pool().in_use() == 0
            && server.registry().client_names().is_empty()
            && server.connection_count() == 0;
        async move { done }
    })
    .await;
    assert!(server.registry().subscriber("n1.example").is_none());
    wait_for("listener close", || async move {
        TcpStream::connect(("127.0.0.1", port)).await.is_err()
    })
    .await;

    client.stop();
}

#[tokio::test]
async fn test_unsubscribe_drops_one_client() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let echo = spawn_echo().await;
    let rpc = spawn_rpc().await;

    let (client, _handle) = spawn_client(
        client_config(&server, "node-1")
            .with_tunnel("p2p", TunnelDeclaration::tcp(echo, "127.0.0.1:AUTO"))
            .with_tunnel(
                "rpc",
                TunnelDeclaration::http("n1.example", format!("http://{}", rpc)),
            ),
    );

    wait_for("host route", || {
        let found = server.registry().subscriber("n1.example").is_some()
            && server.address_pool().in_use() == 1;
        async move { found }
    })
    .await;
    let key = server.registry().subscriber("n1.example").unwrap().client_id;

    assert!(!server.unsubscribe(&key, "someone-else"));
    assert!(server.registry().is_subscribed("node-1"));

    assert!(server.unsubscribe(&key, "node-1"));
    assert_eq!(server.address_pool().in_use(), 0);
    assert!(!server.unsubscribe(&key, "node-1"));

    // the control connection was closed, so the client dials back in
    wait_for("re-registration", || {
        let route = server.registry().subscriber("n1.example");
        let back = matches!(route, Some(route) if route.client_id != key)
            && server.address_pool().in_use() == 1;
        async move { back }
    })
    .await;
    assert_eq!(server.connection_count(), 1);

    client.stop();
}

#[tokio::test]
async fn test_batch_rolls_back_on_bind_failure() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let echo = spawn_echo().await;

    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_addr = taken.local_addr().unwrap().to_string();

    // "auto" provisions before "fixed" fails
    let (_client, handle) = spawn_client(
        client_config(&server, "node-1")
            .with_tunnel("auto", TunnelDeclaration::tcp(echo.clone(), "127.0.0.1:AUTO"))
            .with_tunnel("fixed", TunnelDeclaration::tcp(echo, taken_addr)),
    );

    let result = timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::Rejected(_))), "{:?}", result);

    assert_eq!(server.address_pool().in_use(), 0);
    assert!(server.port_pool().lookup_port("node-1").is_err());
    wait_for("registry cleanup", || {
        let empty = server.registry().client_names().is_empty();
        async move { empty }
    })
    .await;
}

// ============================================================================
// HTTP tunnels
// ============================================================================

#[tokio::test]
async fn test_http_tunnel_forwards_request() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let rpc = spawn_rpc().await;
    let public = start_http_entrypoint(&server).await;

    let (client, _handle) = spawn_client(client_config(&server, "node-1").with_tunnel(
        "rpc",
        TunnelDeclaration::http("n1.example", format!("http://{}", rpc)),
    ));

    wait_for("host route", || {
        let found = server.registry().subscriber("n1.example").is_some();
        async move { found }
    })
    .await;

    let resp = http_post(&public, "n1.example", None, r#"{"method":"eth_blockNumber"}"#).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(
        resp.body().as_ref(),
        br#"POST /rpc {"method":"eth_blockNumber"}"#
    );
    assert_eq!(resp.headers()["x-saw-forwarded-host"], "n1.example");

    // host matching ignores the port and case
    let resp = http_post(&public, "N1.Example:8545", None, "again").await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    client.stop();
}

#[tokio::test]
async fn test_websocket_upgrade_through_http_tunnel() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let ws = spawn_upgrade_echo().await;
    let public = start_http_entrypoint(&server).await;

    let (client, _handle) = spawn_client(client_config(&server, "node-1").with_tunnel(
        "ws",
        TunnelDeclaration::http("n1.example", format!("http://{}", ws)),
    ));
    wait_for("host route", || {
        let found = server.registry().subscriber("n1.example").is_some();
        async move { found }
    })
    .await;

    let mut stream = TcpStream::connect(&public).await.unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: n1.example\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);
    assert!(head.to_ascii_lowercase().contains("upgrade: websocket"), "{}", head);

    // raw frames flow both ways once switched
    for payload in [&b"subscribe newHeads"[..], &b"second frame"[..]] {
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(buf, payload);
    }

    // plain requests on the same tunnel still use the pooled path
    let resp = http_post(&public, "n1.example", None, "").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    client.stop();
}

#[tokio::test]
async fn test_unknown_host_is_not_found() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let public = start_http_entrypoint(&server).await;

    let resp = http_post(&public, "nobody.example", None, "").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_per_host_bearer_auth() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let rpc = spawn_rpc().await;
    let public = start_http_entrypoint(&server).await;

    let (client, _handle) = spawn_client(client_config(&server, "node-1").with_tunnel(
        "rpc",
        TunnelDeclaration::http("n1.example", format!("http://{}", rpc)).with_auth("t0k"),
    ));

    wait_for("host route", || {
        let found = server.registry().subscriber("n1.example").is_some();
        async move { found }
    })
    .await;

    let resp = http_post(&public, "n1.example", None, "").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = http_post(&public, "n1.example", Some("wrong"), "").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = http_post(&public, "n1.example", Some("t0k"), "").await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    // the caller's credential stays at the edge
    assert_eq!(resp.headers()["x-saw-authorization"], "false");

    client.stop();
}

#[tokio::test]
async fn test_host_collision_rejects_second_client() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let rpc = spawn_rpc().await;
    let public = start_http_entrypoint(&server).await;
    let local = format!("http://{}", rpc);

    let (first, _first_handle) = spawn_client(
        client_config(&server, "node-a")
            .with_tunnel("rpc", TunnelDeclaration::http("n1.example", local.clone())),
    );
    wait_for("first client", || {
        let found = server.registry().subscriber("n1.example").is_some();
        async move { found }
    })
    .await;

    let (_second, second_handle) = spawn_client(
        client_config(&server, "node-b")
            .with_tunnel("rpc", TunnelDeclaration::http("n1.example", local)),
    );
    let result = timeout(WAIT, second_handle).await.unwrap().unwrap();
    match result {
        Err(ClientError::Rejected(reason)) => assert!(reason.contains("n1.example"), "{}", reason),
        other => panic!("expected rejection, got {:?}", other),
    }

    let route = server.registry().subscriber("n1.example:443").unwrap();
    assert_eq!(route.client_name, "node-a");
    assert_eq!(http_post(&public, "n1.example", None, "").await.status(), StatusCode::CREATED);

    first.stop();
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_bad_token_is_rejected() {
    init_tracing();
    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;
    let echo = spawn_echo().await;

    let config = ClientConfig {
        auth_token: "wrong".to_string(),
        ..client_config(&server, "node-1")
    }
    .with_tunnel("p2p", TunnelDeclaration::tcp(echo, "127.0.0.1:AUTO"));
    let (_client, handle) = spawn_client(config);

    let result = timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::Rejected(_))), "{:?}", result);
    assert_eq!(server.address_pool().in_use(), 0);
    assert!(server.registry().client_names().is_empty());
}

#[tokio::test]
async fn test_tls_control_connection() {
    init_tracing();
    nodegate_client::ensure_crypto_provider();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = rustls::pki_types::CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()),
    );
    let tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();

    let (_, range) = free_range(1).await;
    let server = start_server(
        ServerConfig::new("127.0.0.1:0", range)
            .with_token(TOKEN)
            .with_tls(Arc::new(tls)),
    )
    .await;
    let echo = spawn_echo().await;

    let material =
        TlsMaterial::from_ca_pem(cert.serialize_pem().unwrap().as_bytes(), "localhost").unwrap();
    let (client, _handle) = spawn_client(
        ClientConfig::new(server.local_addr().to_string(), TOKEN, "node-tls")
            .with_tls(material)
            .with_tunnel("p2p", TunnelDeclaration::tcp(echo, "127.0.0.1:AUTO")),
    );

    let pool = server.port_pool();
    wait_for("port allocation", || {
        let pool = pool.clone();
        async move { pool.lookup_port("node-tls").is_ok() }
    })
    .await;
    let port = pool.lookup_port("node-tls").unwrap();
    assert_eq!(echo_round_trip(port, b"over tls").await, b"over tls");

    client.stop();
}

// ============================================================================
// SNI passthrough
// ============================================================================

#[tokio::test]
async fn test_sni_passthrough() {
    init_tracing();
    nodegate_client::ensure_crypto_provider();

    let (_, range) = free_range(1).await;
    let server = start_server(ServerConfig::new("127.0.0.1:0", range).with_token(TOKEN)).await;

    // local "TLS service" that reports the first bytes it sees
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap().to_string();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
    tokio::spawn(async move {
        let (mut socket, _) = local.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap();
        buf.truncate(n);
        let _ = seen_tx.send(buf);
    });

    let sni = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sni_addr = sni.local_addr().unwrap();
    tokio::spawn({
        let server = server.clone();
        async move { server.serve_sni(sni).await }
    });

    let (client, _handle) = spawn_client(
        client_config(&server, "node-1")
            .with_tunnel("wss", TunnelDeclaration::sni("secure.example", local_addr)),
    );
    wait_for("sni route", || {
        let found = server.registry().subscriber("secure.example").is_some();
        async move { found }
    })
    .await;

    // a real TLS client; the handshake never completes, only the hello matters
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls));
    let stream = TcpStream::connect(sni_addr).await.unwrap();
    let name = rustls::pki_types::ServerName::try_from("secure.example").unwrap();
    let handshake = tokio::spawn(async move { connector.connect(name, stream).await });

    let seen = timeout(WAIT, seen_rx).await.unwrap().unwrap();
    assert_eq!(seen[0], 0x16, "first byte should open a handshake record");
    let needle = b"secure.example";
    assert!(seen.windows(needle.len()).any(|w| w == needle));

    handshake.abort();
    client.stop();
}
