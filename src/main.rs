use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use venue_ledger::config::Config;
use venue_ledger::engine::Engine;
use venue_ledger::notify::NotifyHub;
use venue_ledger::{compactor, observability, tls, wire};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection task needs, cloned per accepted socket.
#[derive(Clone)]
struct Session {
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
}

impl Session {
    fn spawn(self, socket: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = wire::process_connection(socket, self.engine, self.password, self.tls).await {
                error!("connection error from {peer}: {e}");
            }
            metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    observability::init_tracing(config.log_json);
    observability::init_metrics(config.metrics_port)?;

    let tls_acceptor = tls::load_tls_acceptor(&config)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(config.wal_path(), Arc::new(NotifyHub::new()))?);
    tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(
        data_dir = %config.data_dir.display(),
        max_connections = config.max_connections,
        tls = tls_acceptor.is_some(),
        metrics_port = ?config.metrics_port,
        "venue-ledger listening on {addr}"
    );

    let limit = Arc::new(Semaphore::new(config.max_connections));
    let session = Session {
        engine,
        password: config.password.clone(),
        tls: tls_acceptor,
    };
    accept_until_shutdown(&listener, &limit, session).await?;
    drain(&limit, config.max_connections).await;

    info!("venue-ledger stopped");
    Ok(())
}

/// Serve connections until ctrl-c or SIGTERM; over-limit sockets are closed.
async fn accept_until_shutdown(
    listener: &TcpListener,
    limit: &Arc<Semaphore>,
    session: Session,
) -> std::io::Result<()> {
    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
        };

        match limit.clone().try_acquire_owned() {
            Ok(permit) => {
                info!("connection from {peer}");
                session.clone().spawn(socket, peer, permit);
            }
            Err(_) => {
                warn!("connection limit reached, rejecting {peer}");
                metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            }
        }
    }
}

/// Wait until every connection permit is back, or give up after `DRAIN_TIMEOUT`.
async fn drain(limit: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let all = u32::try_from(max_connections).unwrap_or(u32::MAX);
    match tokio::time::timeout(DRAIN_TIMEOUT, limit.acquire_many(all)).await {
        Ok(_) => info!("all connections drained"),
        Err(_) => {
            let remaining = max_connections.saturating_sub(limit.available_permits());
            warn!("drain timeout, {remaining} connections still open");
        }
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    })
}
