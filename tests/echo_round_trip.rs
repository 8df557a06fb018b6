use hreq_nio::echo::EchoFactory;
use hreq_nio::{Error, HttpProtocol, ServerConfig};
use std::sync::Arc;

mod common;

use common::{Scenario, TestServer};

async fn echo(scenario: Scenario, size: usize, initial_window: usize) -> Result<(), Error> {
    let config = ServerConfig::new(Arc::new(EchoFactory::new(initial_window)));
    let server = TestServer::start(scenario, config).await?;

    let body = common::random_body(size);
    let req = common::post(&server.uri("/echo"), body.clone());

    let (res, echoed) = server.request(scenario, req).await?;

    assert_eq!(res.status(), 200, "{:?} size {}", scenario, size);
    assert_eq!(echoed.len(), body.len(), "{:?} size {}", scenario, size);
    assert!(echoed == body, "{:?} size {}: body differs", scenario, size);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_all_scenarios() -> Result<(), Error> {
    for scenario in Scenario::all() {
        for size in &[0, 2048, 10240] {
            echo(scenario, *size, 65_535).await?;
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_small_window_h1() -> Result<(), Error> {
    let scenario = Scenario {
        protocol: HttpProtocol::Http1,
        tls: false,
    };
    // far more than the handler lets in at once.
    echo(scenario, 200_000, 1024).await
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_small_window_h2() -> Result<(), Error> {
    let scenario = Scenario {
        protocol: HttpProtocol::Http2,
        tls: false,
    };
    echo(scenario, 200_000, 1024).await
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_small_window_tls() -> Result<(), Error> {
    for protocol in &[HttpProtocol::Http1, HttpProtocol::Http2] {
        let scenario = Scenario {
            protocol: *protocol,
            tls: true,
        };
        echo(scenario, 100_000, 2048).await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn h1_keep_alive_serves_sequential_requests() -> Result<(), Error> {
    use std::io::Write;

    let scenario = Scenario {
        protocol: HttpProtocol::Http1,
        tls: false,
    };
    let server = TestServer::start(scenario, ServerConfig::new(Arc::new(EchoFactory::default()))).await?;
    let port = server.port();

    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let mut tcp = std::net::TcpStream::connect(("127.0.0.1", port))?;

        // two pipelined requests in one write.
        tcp.write_all(
            b"POST /a HTTP/1.1\r\ncontent-length: 3\r\n\r\nabc\
              POST /b HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n2\r\nde\r\n0\r\n\r\n",
        )?;

        let (res, body) = common::read_h1_response(&mut tcp, false)?;
        assert_eq!(res.status(), 200);
        assert_eq!(body, b"abc");

        let (res, body) = common::read_h1_response(&mut tcp, false)?;
        assert_eq!(res.status(), 200);
        assert_eq!(res.headers().get("transfer-encoding").unwrap(), "chunked");
        assert_eq!(body, b"de");

        Ok(())
    })
    .await
    .map_err(|e| Error::User(e.to_string()))??;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn h1_head_request_has_no_body() -> Result<(), Error> {
    let scenario = Scenario {
        protocol: HttpProtocol::Http1,
        tls: false,
    };
    let server = TestServer::start(scenario, ServerConfig::new(Arc::new(EchoFactory::default()))).await?;

    let req = http::Request::head(server.uri("/")).body(vec![]).unwrap();
    let (res, body) = server.request(scenario, req).await?;

    assert_eq!(res.status(), 200);
    assert!(body.is_empty());

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn h1_malformed_head_is_answered_with_400() -> Result<(), Error> {
    use std::io::Write;

    let scenario = Scenario {
        protocol: HttpProtocol::Http1,
        tls: false,
    };
    let server = TestServer::start(scenario, ServerConfig::new(Arc::new(EchoFactory::default()))).await?;
    let port = server.port();

    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let mut tcp = std::net::TcpStream::connect(("127.0.0.1", port))?;
        tcp.write_all(b"POST / HTTP/1.1\r\ncontent-length: nope\r\n\r\n")?;

        let (res, _) = common::read_h1_response(&mut tcp, false)?;
        assert_eq!(res.status(), 400);
        assert_eq!(res.headers().get("connection").unwrap(), "close");

        Ok(())
    })
    .await
    .map_err(|e| Error::User(e.to_string()))??;

    Ok(())
}
