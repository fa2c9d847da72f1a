use crate::interceptor::Interceptor;
use crate::pool::{Forwarder, ProxyBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The capturing reverse proxy server
pub struct ProxyServer<F> {
    listener: TcpListener,
    interceptor: Arc<Interceptor<F>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<F> ProxyServer<F>
where
    F: Forwarder<Incoming>,
{
    /// Bind the listening socket. Binding port 0 picks a free port.
    pub async fn bind(
        bind_addr: SocketAddr,
        interceptor: Arc<Interceptor<F>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            anyhow::anyhow!("Failed to bind proxy listener on {}: {}", bind_addr, e)
        })?;

        Ok(Self {
            listener,
            interceptor,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self) -> anyhow::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let interceptor = Arc::clone(&self.interceptor);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, interceptor).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S, F>(
    stream: S,
    addr: SocketAddr,
    interceptor: Arc<Interceptor<F>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Forwarder<Incoming>,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let interceptor = Arc::clone(&interceptor);
        async move {
            let response: Response<ProxyBody> = interceptor.handle(req, addr).await;
            Ok::<_, Infallible>(response)
        }
    });

    // auto::Builder serves both HTTP/1.1 and h2c on the same port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
