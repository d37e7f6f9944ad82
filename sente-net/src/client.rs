//! Evaluation dispatcher. Routes requests to a pooled worker connection
//! under a wall-clock deadline and degrades to the local evaluator when
//! the remote side is unavailable.

use crate::pool::{ServerParseError, SocketPool};
use crate::wire::{decode_response, RESPONSE_BYTES};
use sente_config::config::NetworkSettings;
use sente_core::cache::NNCache;
use sente_core::eval::Evaluator;
use sente_core::result::Netresult;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Wall-clock budget for one request/response exchange.
const REQUEST_DEADLINE: Duration = Duration::from_millis(500);

/// Pause before retrying when neither a socket nor a local evaluator is
/// available.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Rounds of pool filling attempted at startup before handing the rest to
/// the refill task.
const INIT_FILL_ROUNDS: usize = 5;

struct Remote {
    pool: Arc<SocketPool>,
    runtime: tokio::runtime::Runtime,
}

/// Dispatches evaluations to remote workers with local fallback, caching
/// every result. Shared by reference between search threads.
pub struct DistributedClient {
    cache: Arc<NNCache>,
    local: Option<Arc<dyn Evaluator>>,
    remote: Option<Remote>,
}

impl DistributedClient {
    /// Purely local evaluation; no sockets are ever opened.
    pub fn local(max_playouts: usize, evaluator: Arc<dyn Evaluator>, cache: Arc<NNCache>) -> Self {
        cache.set_size_from_playouts(max_playouts);

        DistributedClient {
            cache,
            local: Some(evaluator),
            remote: None,
        }
    }

    /// Remote evaluation over a connection pool, with `local_fallback`
    /// taking over whenever the pool cannot serve a request. A malformed
    /// `serverlist` entry is fatal.
    pub fn remote(
        max_playouts: usize,
        settings: &NetworkSettings,
        local_fallback: Option<Arc<dyn Evaluator>>,
        cache: Arc<NNCache>,
    ) -> Result<Self, ServerParseError> {
        cache.set_size_from_playouts(max_playouts);

        let pool = Arc::new(SocketPool::new(
            &settings.serverlist,
            settings.num_threads,
            settings.weights_hash,
            settings.nn_client_verbose,
        )?);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("nn-client-io")
            .enable_io()
            .enable_time()
            .build()
            .expect("Failed to build client I/O runtime");

        runtime.block_on(async {
            for _ in 0..INIT_FILL_ROUNDS {
                if pool.active_count() >= pool.desired() {
                    break;
                }
                pool.fill().await;
            }
        });

        if pool.active_count() < pool.desired() {
            warn!(
                "worker pool under target after startup ({}/{}); refill keeps trying",
                pool.active_count(),
                pool.desired()
            );
        }

        pool.spawn_refill(runtime.handle());

        Ok(DistributedClient {
            cache,
            local: local_fallback,
            remote: Some(Remote { pool, runtime }),
        })
    }

    pub fn cache(&self) -> &NNCache {
        &self.cache
    }

    /// Evaluate one position. Previously seen hashes are answered from the
    /// cache; fresh results are inserted before returning. The selfcheck
    /// path always computes locally and bypasses the cache.
    pub fn evaluate(&self, hash: u64, features: &[u8], selfcheck: bool) -> Netresult {
        if selfcheck {
            if let Some(local) = &self.local {
                return local.forward(features, true);
            }
        }

        if let Some(result) = self.cache.lookup(hash) {
            return result;
        }

        let result = self.dispatch(features);
        self.cache.insert(hash, &result);
        result
    }

    fn dispatch(&self, features: &[u8]) -> Netresult {
        let Some(remote) = &self.remote else {
            let local = self
                .local
                .as_ref()
                .expect("client built with neither remote nor local evaluator");
            return local.forward(features, false);
        };

        loop {
            if let Some(mut stream) = remote.pool.acquire() {
                let exchanged = remote.runtime.block_on(tokio::time::timeout(
                    REQUEST_DEADLINE,
                    exchange(&mut stream, features),
                ));

                match exchanged {
                    Ok(Ok(result)) => {
                        remote.pool.release_ok(stream);
                        return result;
                    }
                    Ok(Err(e)) => {
                        debug!("remote evaluation failed: {e}");
                        remote.pool.release_bad(stream);
                    }
                    Err(_) => {
                        debug!("remote evaluation timed out");
                        remote.pool.release_bad(stream);
                    }
                }
            }

            if let Some(local) = &self.local {
                return local.forward(features, false);
            }

            std::thread::sleep(RETRY_BACKOFF);
        }
    }
}

async fn exchange(stream: &mut TcpStream, features: &[u8]) -> std::io::Result<Netresult> {
    stream.write_all(features).await?;

    let mut frame = vec![0u8; RESPONSE_BYTES];
    stream.read_exact(&mut frame).await?;
    Ok(decode_response(&frame))
}
