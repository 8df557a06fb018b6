use hreq_nio::bridge::{ClassicFactory, ClassicResponse, InputStream};
use hreq_nio::reactor::CloseMode;
use hreq_nio::{Error, HttpProtocol, IoReactorStatus, ServerConfig};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod common;

use common::{Scenario, TestServer};

/// Reads the whole body, answers with it upper cased.
fn upper(req: http::Request<InputStream>, res: &mut ClassicResponse) -> Result<(), Error> {
    let mut body = vec![];
    req.into_body().read_to_end(&mut body)?;

    res.headers_mut()
        .unwrap()
        .insert("content-type", http::HeaderValue::from_static("text/plain"));

    let upper: Vec<u8> = body.iter().map(|b| b.to_ascii_uppercase()).collect();
    res.body().write_all(&upper)?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn classic_upper_all_scenarios() -> Result<(), Error> {
    for scenario in Scenario::all() {
        // small buffers so both directions block a couple of times.
        let factory = ClassicFactory::new(upper).buffer_size(1024);
        let server = TestServer::start(scenario, ServerConfig::new(Arc::new(factory))).await?;

        let body: Vec<u8> = (0..50_000).map(|i| b'a' + (i % 26) as u8).collect();
        let expected: Vec<u8> = body.iter().map(|b| b.to_ascii_uppercase()).collect();

        let (res, out) = server
            .request(scenario, common::post(&server.uri("/"), body))
            .await?;

        assert_eq!(res.status(), 200, "{:?}", scenario);
        assert_eq!(res.headers().get("content-type").unwrap(), "text/plain");
        assert!(out == expected, "{:?}: body differs", scenario);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn classic_error_before_commit_is_500() -> Result<(), Error> {
    let failing = |_: http::Request<InputStream>, _: &mut ClassicResponse| -> Result<(), Error> {
        Err(Error::User("nope".into()))
    };

    for protocol in &[HttpProtocol::Http1, HttpProtocol::Http2] {
        let scenario = Scenario {
            protocol: *protocol,
            tls: false,
        };

        let factory = ClassicFactory::new(failing);
        let server = TestServer::start(scenario, ServerConfig::new(Arc::new(factory))).await?;

        let req = http::Request::get(server.uri("/")).body(vec![]).unwrap();
        let (res, _) = server.request(scenario, req).await?;

        assert_eq!(res.status(), 500, "{:?}", scenario);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn classic_status_and_empty_body() -> Result<(), Error> {
    let created = |_: http::Request<InputStream>, res: &mut ClassicResponse| -> Result<(), Error> {
        res.set_status(http::StatusCode::CREATED)?;
        Ok(())
    };

    let scenario = Scenario {
        protocol: HttpProtocol::Http1,
        tls: false,
    };

    let server = TestServer::start(scenario, ServerConfig::new(Arc::new(ClassicFactory::new(created)))).await?;

    let req = http::Request::get(server.uri("/")).body(vec![]).unwrap();
    let (res, body) = server.request(scenario, req).await?;

    assert_eq!(res.status(), 201);
    assert_eq!(res.headers().get("content-length").unwrap(), "0");
    assert!(body.is_empty());

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn classic_read_times_out_when_peer_stalls() -> Result<(), Error> {
    let (tx, rx) = std::sync::mpsc::channel();
    let tx = std::sync::Mutex::new(tx);

    let reader = move |req: http::Request<InputStream>, _: &mut ClassicResponse| -> Result<(), Error> {
        let mut buf = [0; 16];
        let res = req.into_body().read(&mut buf);
        tx.lock().unwrap().send(res.map_err(|e| e.kind())).ok();
        Ok(())
    };

    let scenario = Scenario {
        protocol: HttpProtocol::Http1,
        tls: false,
    };

    let factory = ClassicFactory::new(reader).timeout(Duration::from_millis(100));
    let server = TestServer::start(scenario, ServerConfig::new(Arc::new(factory))).await?;
    let port = server.port();

    // promises a body it never sends.
    let _tcp = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
        let mut tcp = std::net::TcpStream::connect(("127.0.0.1", port))?;
        tcp.write_all(b"POST / HTTP/1.1\r\ncontent-length: 10\r\n\r\n")?;
        Ok(tcp)
    })
    .await
    .map_err(|e| Error::User(e.to_string()))??;

    let outcome = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
        .await
        .map_err(|e| Error::User(e.to_string()))?
        .map_err(|e| Error::User(e.to_string()))?;

    assert_eq!(outcome, Err(std::io::ErrorKind::TimedOut));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_completes_inflight_exchange() -> Result<(), Error> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let slow = move |req: http::Request<InputStream>, res: &mut ClassicResponse| -> Result<(), Error> {
        let mut body = vec![];
        req.into_body().read_to_end(&mut body)?;

        tx.lock().unwrap().send(()).ok();
        std::thread::sleep(Duration::from_millis(300));

        res.body().write_all(&body)?;
        Ok(())
    };

    let scenario = Scenario {
        protocol: HttpProtocol::Http1,
        tls: false,
    };

    let server = TestServer::start(scenario, ServerConfig::new(Arc::new(ClassicFactory::new(slow)))).await?;
    let port = server.port();
    let req = common::post(&server.uri("/"), b"in flight".to_vec());

    let client = tokio::task::spawn_blocking(move || common::h1_request(port, None, req));

    // the handler has the request.
    tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
        .await
        .map_err(|e| Error::User(e.to_string()))?
        .map_err(|e| Error::User(e.to_string()))?;

    server.reactor.close(CloseMode::Graceful);

    let (res, body) = client.await.map_err(|e| Error::User(e.to_string()))??;
    assert_eq!(res.status(), 200);
    assert_eq!(body, b"in flight");

    let done = tokio::task::block_in_place(|| server.reactor.await_shutdown(Duration::from_secs(5)));
    assert!(done);
    assert_eq!(server.reactor.status(), IoReactorStatus::ShutDown);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn h2_failed_stream_leaves_sibling_intact() -> Result<(), Error> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let rx = Mutex::new(rx);

    let handler = move |req: http::Request<InputStream>, res: &mut ClassicResponse| -> Result<(), Error> {
        let fail = req.uri().path() == "/fail";

        let mut body = vec![];
        req.into_body().read_to_end(&mut body)?;

        if fail {
            // wait for the sibling to be half way.
            rx.lock().unwrap().recv_timeout(Duration::from_secs(5)).ok();
            res.body().write_all(b"partial")?;
            res.body().flush()?;
            return Err(Error::User("broken stream".into()));
        }

        let (first, rest) = body.split_at(body.len() / 2);
        res.body().write_all(first)?;
        res.body().flush()?;
        tx.lock().unwrap().send(()).ok();

        std::thread::sleep(Duration::from_millis(100));
        res.body().write_all(rest)?;

        Ok(())
    };

    let scenario = Scenario {
        protocol: HttpProtocol::Http2,
        tls: false,
    };

    let server = TestServer::start(scenario, ServerConfig::new(Arc::new(ClassicFactory::new(handler)))).await?;

    let tcp = tokio::net::TcpStream::connect(("127.0.0.1", server.port())).await?;
    let client = common::h2_connect(tcp).await?;

    let body = common::random_body(50_000);

    let failing = common::h2_send(client.clone(), common::post(&server.uri("/fail"), b"x".to_vec()));
    let sibling = common::h2_send(client, common::post(&server.uri("/ok"), body.clone()));

    let (failed, ok) = tokio::join!(failing, sibling);

    // committed before failing, so the stream is reset.
    assert!(failed.is_err());

    let (res, echoed) = ok?;
    assert_eq!(res.status(), 200);
    assert!(echoed == body, "sibling body differs");

    Ok(())
}
