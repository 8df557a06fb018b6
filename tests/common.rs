#![allow(dead_code)]

use bytes::Bytes;
use futures_util::future::poll_fn;
use hreq_nio::chunked::{ChunkedDecoder, Decoded};
use hreq_nio::http11::{try_parse_res, write_http1x_req};
use hreq_nio::reactor::IoEventHandlerFactory;
use hreq_nio::{Error, HttpProtocol, IoReactor, IoReactorConfig, ListenerEndpoint};
use hreq_nio::{Scheme, ServerConfig, TlsConfig};
use rustls::pki_types::{CertificateDer, ServerName};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("hreq_nio", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

/// Which client talks to the server, and how.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub protocol: HttpProtocol,
    pub tls: bool,
}

impl Scenario {
    pub fn all() -> Vec<Scenario> {
        let mut v = vec![];
        for protocol in &[HttpProtocol::Http1, HttpProtocol::Http2] {
            for tls in &[false, true] {
                v.push(Scenario {
                    protocol: *protocol,
                    tls: *tls,
                });
            }
        }
        v
    }

    pub fn scheme(&self) -> Scheme {
        if self.tls {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }
}

/// Self-signed certificate for `localhost`, DER encoded.
#[derive(Clone)]
pub struct Certs {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

pub fn self_signed() -> Certs {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    Certs {
        cert: cert.cert.der().to_vec(),
        key: cert.key_pair.serialize_der(),
    }
}

pub fn reactor_config() -> IoReactorConfig {
    IoReactorConfig {
        io_thread_count: 2,
        graceful_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// A started reactor with one listener.
pub struct TestServer {
    pub reactor: IoReactor,
    pub endpoint: ListenerEndpoint,
    pub certs: Option<Certs>,
}

impl TestServer {
    pub async fn start(scenario: Scenario, config: ServerConfig) -> Result<TestServer, Error> {
        let policy = config.negotiation.policy;
        TestServer::start_with(scenario, Arc::new(config), policy).await
    }

    pub async fn start_with(
        scenario: Scenario,
        factory: Arc<dyn IoEventHandlerFactory>,
        policy: hreq_nio::VersionPolicy,
    ) -> Result<TestServer, Error> {
        setup_logger();

        let certs = if scenario.tls { Some(self_signed()) } else { None };

        let tls = match &certs {
            Some(c) => Some(TlsConfig::from_der(vec![c.cert.clone()], c.key.clone(), policy)?),
            None => None,
        };

        let reactor = IoReactor::new(reactor_config(), factory, tls);
        reactor.start()?;

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let endpoint = reactor.listen(addr, scenario.scheme()).await?;

        Ok(TestServer {
            reactor,
            endpoint,
            certs,
        })
    }

    pub fn port(&self) -> u16 {
        self.endpoint.address().port()
    }

    pub fn uri(&self, path: &str) -> String {
        let scheme = if self.certs.is_some() { "https" } else { "http" };
        format!("{}://localhost:{}{}", scheme, self.port(), path)
    }

    /// Send a request with whatever protocol the scenario says.
    pub async fn request(
        &self,
        scenario: Scenario,
        req: http::Request<Vec<u8>>,
    ) -> Result<(http::Response<()>, Vec<u8>), Error> {
        match scenario.protocol {
            HttpProtocol::Http1 => {
                let port = self.port();
                let certs = self.certs.clone();
                // blocking client, off the async test thread.
                tokio::task::spawn_blocking(move || h1_request(port, certs.as_ref(), req))
                    .await
                    .map_err(|e| Error::User(e.to_string()))?
            }
            HttpProtocol::Http2 => h2_request(self.port(), self.certs.as_ref(), req).await,
        }
    }
}

pub fn client_config(cert: &[u8], alpn: &[&[u8]]) -> Result<Arc<rustls::ClientConfig>, Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(CertificateDer::from(cert.to_vec()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

fn localhost() -> Result<ServerName<'static>, Error> {
    ServerName::try_from("localhost").map_err(|e| Error::User(e.to_string()))
}

/// Blocking HTTP/1.1 request.
pub fn h1_request(
    port: u16,
    certs: Option<&Certs>,
    req: http::Request<Vec<u8>>,
) -> Result<(http::Response<()>, Vec<u8>), Error> {
    let tcp = std::net::TcpStream::connect(("127.0.0.1", port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(10)))?;

    match certs {
        Some(c) => {
            let config = client_config(&c.cert, &[b"http/1.1"])?;
            let conn = rustls::ClientConnection::new(config, localhost()?)?;
            h1_exchange(rustls::StreamOwned::new(conn, tcp), req)
        }
        None => h1_exchange(tcp, req),
    }
}

pub fn h1_exchange<S: Read + Write>(
    mut stream: S,
    req: http::Request<Vec<u8>>,
) -> Result<(http::Response<()>, Vec<u8>), Error> {
    let (parts, body) = req.into_parts();
    let mut req = http::Request::from_parts(parts, ());

    if !body.is_empty() && !req.headers().contains_key("content-length") {
        req.headers_mut()
            .insert("content-length", http::HeaderValue::from(body.len()));
    }

    let mut head = vec![];
    write_http1x_req(&req, &mut head)?;

    stream.write_all(&head)?;
    stream.write_all(&body)?;
    stream.flush()?;

    read_h1_response(&mut stream, req.method() == http::Method::HEAD)
}

/// Read one HTTP/1.1 response, with body.
pub fn read_h1_response<S: Read>(
    stream: &mut S,
    head_request: bool,
) -> Result<(http::Response<()>, Vec<u8>), Error> {
    let mut buf = vec![];
    let mut tmp = [0_u8; 4096];

    let (res, size) = loop {
        if let Some(v) = try_parse_res(&buf)? {
            break v;
        }
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            return Err(Error::Closed);
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let mut rest = buf.split_off(size);

    if head_request {
        return Ok((res, vec![]));
    }

    let chunked = res
        .headers()
        .get("transfer-encoding")
        .map(|v| v == "chunked")
        .unwrap_or(false);

    let length: Option<usize> = res
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let body = if chunked {
        let mut dec = ChunkedDecoder::new();
        let mut out = vec![];
        let mut pos = 0;

        loop {
            match dec.decode(&rest[pos..], usize::MAX)? {
                Decoded::Data { consumed, data } => {
                    out.extend_from_slice(&rest[pos..][data]);
                    pos += consumed;
                }
                Decoded::NeedMore { consumed } => {
                    pos += consumed;
                    let n = stream.read(&mut tmp)?;
                    if n == 0 {
                        return Err(Error::Closed);
                    }
                    rest.extend_from_slice(&tmp[..n]);
                }
                Decoded::End { .. } => break,
            }
        }

        out
    } else if let Some(len) = length {
        while rest.len() < len {
            let n = stream.read(&mut tmp)?;
            if n == 0 {
                return Err(Error::Closed);
            }
            rest.extend_from_slice(&tmp[..n]);
        }
        rest.truncate(len);
        rest
    } else {
        stream.read_to_end(&mut rest)?;
        rest
    };

    Ok((res, body))
}

/// HTTP/2 request over a fresh connection. Must run inside tokio.
pub async fn h2_request(
    port: u16,
    certs: Option<&Certs>,
    req: http::Request<Vec<u8>>,
) -> Result<(http::Response<()>, Vec<u8>), Error> {
    let tcp = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;

    match certs {
        Some(c) => {
            let connector = tokio_rustls::TlsConnector::from(client_config(&c.cert, &[b"h2"])?);
            let tls = connector.connect(localhost()?, tcp).await?;
            h2_exchange(tls, req).await
        }
        None => h2_exchange(tcp, req).await,
    }
}

pub async fn h2_exchange<T>(
    io: T,
    req: http::Request<Vec<u8>>,
) -> Result<(http::Response<()>, Vec<u8>), Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client = h2_connect(io).await?;
    h2_send(client, req).await
}

/// HTTP/2 handshake. The connection is driven by a spawned task.
pub async fn h2_connect<T>(io: T) -> Result<h2::client::SendRequest<Bytes>, Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, conn) = h2::client::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            log::debug!("h2 client connection: {}", e);
        }
    });

    Ok(client)
}

/// One request on an HTTP/2 connection.
///
/// The body goes out from its own task while the response is read, since the
/// server may hold back window until it has echoed part of it.
pub async fn h2_send(
    client: h2::client::SendRequest<Bytes>,
    req: http::Request<Vec<u8>>,
) -> Result<(http::Response<()>, Vec<u8>), Error> {
    let mut client = client.ready().await?;

    let (parts, body) = req.into_parts();
    let req = http::Request::from_parts(parts, ());

    let end = body.is_empty();
    let (response, send) = client.send_request(req, end)?;

    let sender = tokio::spawn(send_h2_body(send, Bytes::from(body)));

    let res = response.await?;
    let (parts, mut recv) = res.into_parts();

    let mut out = vec![];

    while let Some(chunk) = recv.data().await {
        let chunk = chunk?;
        recv.flow_control().release_capacity(chunk.len())?;
        out.extend_from_slice(&chunk);
    }

    sender.await.map_err(|e| Error::User(e.to_string()))??;

    Ok((http::Response::from_parts(parts, ()), out))
}

async fn send_h2_body(mut send: h2::SendStream<Bytes>, mut data: Bytes) -> Result<(), Error> {
    while !data.is_empty() {
        send.reserve_capacity(data.len());

        let cap = match poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(v) => v?,
            None => return Err(Error::Closed),
        };

        if cap == 0 {
            continue;
        }

        let chunk = data.split_to(cap.min(data.len()));
        send.send_data(chunk, data.is_empty())?;
    }

    Ok(())
}

pub fn random_body(size: usize) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(size as u64);
    (0..size).map(|_| rng.u8(..)).collect()
}

pub fn post(uri: &str, body: Vec<u8>) -> http::Request<Vec<u8>> {
    let mut req = http::Request::post(uri).body(body).unwrap();
    let len = req.body().len();
    if len > 0 {
        req.headers_mut()
            .insert("content-length", http::HeaderValue::from(len));
    }
    req
}
