//! echo-server
//!
//! A minimal demonstration of the reactor runtime: every line received from
//! a client is echoed back unchanged. Parses command-line arguments with
//! `clap` and installs a Ctrl-C handler that stops the server gracefully.

use bytes::BytesMut;
use clap::Parser;
use reactor_server::handler::{Handler, Payload};
use reactor_server::{Connection, Message, Result, Server, ServerConfig};
use std::sync::Arc;

struct EchoHandler;

impl Handler for EchoHandler {
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Payload>> {
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

    fn on_connect(&self, conn: &Arc<Connection>) {
        tracing::info!(addr = conn.addr(), port = conn.port(), "client connected");
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        tracing::info!(addr = conn.addr(), port = conn.port(), "client disconnected");
    }
}

#[derive(Parser, Debug)]
#[clap(name = "echo-server", version, author, about = "A demo reactor-server echo server")]
struct Cli {
    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1")]
    addr: String,

    /// Port to listen on.
    #[clap(long, default_value_t = 7000)]
    port: u16,

    /// Total IO reactor threads (leader + followers).
    #[clap(long, default_value_t = 4)]
    io_threads: usize,

    /// Worker threads for `process`. Omit to process inline on followers.
    #[clap(long)]
    worker_threads: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let cli = Cli::parse();

    let mut builder = ServerConfig::builder().io_threads(cli.io_threads);
    if let Some(n) = cli.worker_threads {
        builder = builder.worker_threads(n);
    }
    let config = builder.build()?;

    let mut server = Server::init(config);
    server.add_listen(cli.addr.clone(), cli.port, Arc::new(EchoHandler))?;
    server.start()?;

    let server = Arc::new(server);
    let stop_handle = server.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt, shutting down");
        let _ = stop_handle.stop();
    })
    .expect("failed to install Ctrl-C handler");

    server.run()
}
