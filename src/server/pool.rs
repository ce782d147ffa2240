use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ServerConfig;
use crate::server::handler::handle_connection;
use crate::server::lottery::Lottery;
use crate::Result;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accept loop with a fixed number of worker slots.
///
/// A slot is taken before the next `accept`, so a saturated pool stops
/// accepting and lets the kernel backlog absorb new peers. Each worker owns
/// its slot and gives it back when it ends, whatever the outcome.
pub struct Server {
    listener: TcpListener,
    lottery: Arc<Lottery>,
    permits: Arc<Semaphore>,
    workers: TaskTracker,
    shutdown: CancellationToken,
    io_timeout: Duration,
}

impl Server {
    pub async fn bind(config: &ServerConfig, lottery: Lottery) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen_addr).await?;
        Ok(Self {
            listener,
            lottery: Arc::new(lottery),
            permits: Arc::new(Semaphore::new(config.max_workers)),
            workers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            io_timeout: config.io_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling this token stops the accept loop and starts the drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn lottery(&self) -> Arc<Lottery> {
        Arc::clone(&self.lottery)
    }

    /// Runs until shutdown is requested, then closes the listener and waits
    /// for every in-flight worker to finish.
    pub async fn run(self) -> Result<()> {
        info!(
            "action: accept_connections | result: in_progress | addr: {}",
            self.local_addr()?
        );

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("action: accept_connections | result: fail | error: {}", err);
                        drop(permit);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };
            debug!("action: accept_connections | result: success | ip: {}", peer.ip());

            let lottery = Arc::clone(&self.lottery);
            let shutdown = self.shutdown.clone();
            let io_timeout = self.io_timeout;
            self.workers.spawn(async move {
                let _permit = permit;
                handle_connection(stream, peer, lottery, shutdown, io_timeout).await;
            });
        }

        drop(self.listener);
        self.workers.close();
        info!(
            "action: shutdown | result: in_progress | in_flight: {}",
            self.workers.len()
        );
        self.workers.wait().await;
        info!("action: shutdown | result: success");
        Ok(())
    }
}
