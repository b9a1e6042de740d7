//! End-to-end tests driving a real `Server` with plain blocking
//! `std::net::TcpStream` clients — no async runtime involved, matching the
//! synchronous, thread-based nature of this crate.

use bytes::BytesMut;
use reactor_server::handler::{Handler, Payload};
use reactor_server::{Connection, Message, Server, ServerConfig};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

struct EchoHandler;

impl Handler for EchoHandler {
    fn decode(&self, src: &mut BytesMut) -> reactor_server::Result<Option<Payload>> {
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = src.split_to(pos + 1);
                Ok(Some(Box::new(line.to_vec()) as Payload))
            }
            None => Ok(None),
        }
    }

    fn encode(&self, dst: &mut BytesMut, response: &Payload) {
        if let Some(line) = response.downcast_ref::<Vec<u8>>() {
            dst.extend_from_slice(line);
        }
    }

    fn process(&self, message: &mut Message) {
        if let Some(request) = message.take_request() {
            message.set_response(request);
        }
    }
}

struct RejectHandler;

impl Handler for RejectHandler {
    fn decode(&self, _src: &mut BytesMut) -> reactor_server::Result<Option<Payload>> {
        Err(reactor_server::Error::Decode("malformed frame".into()))
    }

    fn encode(&self, _dst: &mut BytesMut, _response: &Payload) {}

    fn process(&self, _message: &mut Message) {}
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn echoes_a_line_back_to_the_client() {
    let port = free_port();
    let config = ServerConfig::builder().io_threads(2).build().unwrap();
    let mut server = Server::init(config);
    server.add_listen("127.0.0.1", port, Arc::new(EchoHandler)).unwrap();
    server.start().unwrap();

    // Give the IO threads a moment to finish registering listeners.
    std::thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"hello\n").unwrap();

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello\n");

    server.stop().unwrap();
}

#[test]
fn decode_error_closes_the_connection_without_a_response() {
    let port = free_port();
    let config = ServerConfig::builder().io_threads(1).build().unwrap();
    let mut server = Server::init(config);
    server.add_listen("127.0.0.1", port, Arc::new(RejectHandler)).unwrap();
    server.start().unwrap();

    std::thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"anything\n").unwrap();

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "connection should have been closed with no response written");

    server.stop().unwrap();
}
