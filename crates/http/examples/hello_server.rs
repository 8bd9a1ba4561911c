use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::{StatusCode, header};
use reactor_http::handler::{Response, make_handler};
use reactor_http::protocol::RequestHeader;
use reactor_http::reactor::Reactor;
use reactor_http::server::HttpServer;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let reactor = Reactor::named("http-reactor").expect("can't build reactor");
    let handler = make_handler(|header: RequestHeader, body, response: Response| match header.uri().path() {
        "/echo" => {
            body.collect(move |result| match result {
                Ok(bytes) => send(response, StatusCode::OK, bytes),
                Err(e) => response.fail(e),
            });
        }
        "/slow" => {
            // finishes on another thread; pipelined responses behind it wait their turn
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(500));
                send(response, StatusCode::OK, Bytes::from_static(b"finally\r\n"));
            });
        }
        _ => send(response, StatusCode::OK, Bytes::from_static(b"Hello World!\r\n")),
    });

    let server = HttpServer::new(&reactor, Arc::new(handler));
    if let Err(e) = server.listen("127.0.0.1:8080".parse().expect("valid address")) {
        error!(cause = %e, "bind server error");
        return;
    }

    reactor.start().expect("reactor started once");
    if let Err(e) = reactor.join() {
        warn!(cause = %e, "can't join reactor");
    }
    info!("bye");
}

fn send(response: Response, status: StatusCode, body: Bytes) {
    let message = http::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .expect("valid response");
    if let Err(e) = response.send(message) {
        error!(cause = %e, "can't send response");
    }
}
