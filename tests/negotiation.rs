use hreq_nio::echo::EchoFactory;
use hreq_nio::{Error, HttpProtocol, NegotiationConfig, ServerConfig, VersionPolicy};
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::{Scenario, TestServer};

fn config(strict: bool, allowed: &[HttpProtocol]) -> ServerConfig {
    let mut config = ServerConfig::new(Arc::new(EchoFactory::default()));
    config.negotiation = NegotiationConfig {
        policy: VersionPolicy::Negotiate,
        strict,
        allowed: allowed.to_vec(),
    };
    config
}

const TLS_H2: Scenario = Scenario {
    protocol: HttpProtocol::Http2,
    tls: true,
};

const BOTH: &[HttpProtocol] = &[HttpProtocol::Http1, HttpProtocol::Http2];
const ONLY_H1: &[HttpProtocol] = &[HttpProtocol::Http1];

/// HTTP/1.1 request from a client offering both ALPN ids, which makes the
/// server pick `h2`.
async fn h1_offering_h2(server: &TestServer) -> Result<(http::Response<()>, Vec<u8>), Error> {
    let port = server.port();
    let certs = server.certs.clone().unwrap();
    let uri = server.uri("/");

    tokio::task::spawn_blocking(move || {
        let tcp = std::net::TcpStream::connect(("127.0.0.1", port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(5)))?;

        let tls = common::client_config(&certs.cert, &[b"h2", b"http/1.1"])?;
        let name = rustls::pki_types::ServerName::try_from("localhost")
            .map_err(|e| Error::User(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls, name)?;

        let stream = rustls::StreamOwned::new(conn, tcp);
        common::h1_exchange(stream, common::post(&uri, b"hello".to_vec()))
    })
    .await
    .map_err(|e| Error::User(e.to_string()))?
}

#[tokio::test(flavor = "multi_thread")]
async fn strict_disallowed_is_rejected() -> Result<(), Error> {
    let server = TestServer::start(TLS_H2, config(true, ONLY_H1)).await?;

    let res = server
        .request(TLS_H2, common::post(&server.uri("/"), b"hello".to_vec()))
        .await;
    assert!(res.is_err());

    // the fallback isn't taken either.
    assert!(h1_offering_h2(&server).await.is_err());

    let rejected = server
        .reactor
        .exceptions()
        .iter()
        .any(|e| e.message.contains("not allowed"));
    assert!(rejected);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn strict_allowed_is_http2() -> Result<(), Error> {
    let server = TestServer::start(TLS_H2, config(true, BOTH)).await?;

    let (res, body) = server
        .request(TLS_H2, common::post(&server.uri("/"), b"hello".to_vec()))
        .await?;

    assert_eq!(res.version(), http::Version::HTTP_2);
    assert_eq!(body, b"hello");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lenient_disallowed_falls_back_to_http1() -> Result<(), Error> {
    let server = TestServer::start(TLS_H2, config(false, ONLY_H1)).await?;

    let (res, body) = h1_offering_h2(&server).await?;

    assert_eq!(res.version(), http::Version::HTTP_11);
    assert_eq!(body, b"hello");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lenient_allowed_is_http2() -> Result<(), Error> {
    let server = TestServer::start(TLS_H2, config(false, BOTH)).await?;

    let (res, body) = server
        .request(TLS_H2, common::post(&server.uri("/"), b"hello".to_vec()))
        .await?;

    assert_eq!(res.version(), http::Version::HTTP_2);
    assert_eq!(body, b"hello");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn plaintext_prior_knowledge() -> Result<(), Error> {
    let plain_h2 = Scenario {
        protocol: HttpProtocol::Http2,
        tls: false,
    };
    let plain_h1 = Scenario {
        protocol: HttpProtocol::Http1,
        tls: false,
    };

    let server = TestServer::start(plain_h2, config(false, BOTH)).await?;

    let (res, _) = server
        .request(plain_h2, common::post(&server.uri("/"), b"a".to_vec()))
        .await?;
    assert_eq!(res.version(), http::Version::HTTP_2);

    let (res, _) = server
        .request(plain_h1, common::post(&server.uri("/"), b"a".to_vec()))
        .await?;
    assert_eq!(res.version(), http::Version::HTTP_11);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_http1_ignores_preface() -> Result<(), Error> {
    let plain_h2 = Scenario {
        protocol: HttpProtocol::Http2,
        tls: false,
    };

    let mut config = config(false, BOTH);
    config.negotiation.policy = VersionPolicy::ForceHttp1;

    let server = TestServer::start(plain_h2, config).await?;

    // "PRI * HTTP/2.0" isn't a request HTTP/1.1 accepts.
    let res = server
        .request(plain_h2, common::post(&server.uri("/"), b"a".to_vec()))
        .await;
    assert!(res.is_err());

    Ok(())
}
