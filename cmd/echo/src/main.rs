//! Echo server: one acceptor fiber, one fiber per connection.
//!
//! ```text
//! weft-echo [port]     # default 8080, WEFT_THREADS workers (default 2)
//! ```

use anyhow::{Context, Result};
use weft::{kerror, kinfo, net, IoManager};

fn main() -> Result<()> {
    let port: u16 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("invalid port")?,
        None => 8080,
    };
    let threads = std::env::var("WEFT_THREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2usize);

    let iom = IoManager::new(threads, true, "echo");
    iom.schedule(move || serve(port));

    // The acceptor keeps an event pending, so this drains forever: the
    // caller thread joins the pool and the server runs until killed.
    iom.stop();
    Ok(())
}

fn serve(port: u16) {
    let listener = match net::Listener::bind(port) {
        Ok(listener) => listener,
        Err(e) => {
            kerror!("echo: bind({}) failed: {}", port, e);
            return;
        }
    };
    kinfo!("echo: listening on 0.0.0.0:{}", port);

    loop {
        match listener.accept() {
            Ok(stream) => {
                let iom = IoManager::current().expect("acceptor runs on the io manager");
                iom.schedule(move || handle(stream));
            }
            Err(e) => {
                kerror!("echo: accept failed: {}", e);
                return;
            }
        }
    }
}

fn handle(stream: net::Stream) {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf);
        if n <= 0 {
            return;
        }
        if stream.write_all(&buf[..n as usize]) < 0 {
            return;
        }
    }
}
