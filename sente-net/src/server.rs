//! Thread-per-connection TCP server exposing a local evaluator to remote
//! search processes.

use crate::wire::{encode_response, FEATURE_BYTES, HANDSHAKE_BYTES};
use sente_core::eval::Evaluator;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub struct InferenceServer {
    evaluator: Arc<dyn Evaluator>,
    max_workers: usize,
}

impl InferenceServer {
    pub fn new(evaluator: Arc<dyn Evaluator>, max_workers: usize) -> Self {
        assert!(max_workers > 0, "worker limit must be at least 1");
        InferenceServer {
            evaluator,
            max_workers,
        }
    }

    /// Bind `port` on all interfaces and serve until the process exits.
    pub fn listen(&self, port: u16, weights_hash: u64) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        info!("inference server listening on port {port}");
        self.run(listener, weights_hash)
    }

    /// Accept loop over an already-bound listener. Connections beyond the
    /// worker limit are shut down immediately; each accepted connection
    /// gets its own handler thread.
    pub fn run(&self, listener: TcpListener, weights_hash: u64) -> std::io::Result<()> {
        let active_workers = Arc::new(AtomicUsize::new(0));
        let mut connection_id = 0usize;

        for incoming in listener.incoming() {
            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            let peer = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string());

            let worker = active_workers.fetch_add(1, Ordering::SeqCst);
            if worker >= self.max_workers {
                active_workers.fetch_sub(1, Ordering::SeqCst);
                warn!(
                    "dropping connection from {peer}: all {} workers busy",
                    self.max_workers
                );
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }

            info!(
                "connection established from {peer} (worker {worker}, max {})",
                self.max_workers
            );

            let evaluator = Arc::clone(&self.evaluator);
            let active_workers = Arc::clone(&active_workers);
            connection_id += 1;

            thread::Builder::new()
                .name(format!("nn-worker-{connection_id}"))
                .spawn(move || {
                    match serve_connection(stream, evaluator.as_ref(), weights_hash) {
                        Ok(()) => info!("connection closed from {peer}"),
                        Err(e) => warn!("connection from {peer} failed: {e}"),
                    }
                    active_workers.fetch_sub(1, Ordering::SeqCst);
                })
                .expect("Failed to spawn nn-worker thread");
        }

        Ok(())
    }
}

/// Read a full frame, reporting a clean end-of-stream as `Ok(false)`.
fn read_frame(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<bool> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn serve_connection(
    mut stream: TcpStream,
    evaluator: &dyn Evaluator,
    weights_hash: u64,
) -> std::io::Result<()> {
    let mut handshake = [0u8; HANDSHAKE_BYTES];
    if !read_frame(&mut stream, &mut handshake)? {
        return Ok(());
    }
    let client_hash = u64::from_le_bytes(handshake);
    stream.write_all(&weights_hash.to_le_bytes())?;

    if client_hash != weights_hash {
        // The client compares fingerprints and hangs up; nothing to do
        // here beyond noting it.
        debug!("client announced weights fingerprint {client_hash:#x}, ours is {weights_hash:#x}");
    }

    let mut features = vec![0u8; FEATURE_BYTES];
    loop {
        if !read_frame(&mut stream, &mut features)? {
            return Ok(());
        }

        let result = evaluator.forward(&features, false);
        stream.write_all(&encode_response(&result))?;
    }
}
