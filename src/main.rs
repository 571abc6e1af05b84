use anyhow::Context;
use axum::{extract::ConnectInfo, Extension, Router};
use futures_util::future::join_all;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use launchsite::config::{Config, TlsConfig, CONFIG_FILE};
use launchsite::extract::TlsConnection;
use launchsite::password::spawn_rotation;
use launchsite::webhook::ChatWebhook;
use launchsite::{router, AppState, VERSION};

#[derive(Clone)]
pub struct TowerToHyperService<S> {
    service: S,
}

impl<S, R> hyper::service::Service<R> for TowerToHyperService<S>
where
    S: tower::Service<R> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn call(&self, req: R) -> Self::Future {
        self.service.clone().call(req)
    }
}

fn load_tls_config(tls: &TlsConfig) -> anyhow::Result<rustls::ServerConfig> {
    let cert_file = &mut BufReader::new(
        File::open(&tls.cert).with_context(|| format!("opening {}", tls.cert.display()))?,
    );
    let key_file = &mut BufReader::new(
        File::open(&tls.key).with_context(|| format!("opening {}", tls.key.display()))?,
    );

    let cert_chain = rustls_pemfile::certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    if cert_chain.is_empty() {
        anyhow::bail!("No certificates found in {}", tls.cert.display());
    }

    let key = rustls_pemfile::private_key(key_file)?
        .ok_or_else(|| anyhow::anyhow!("No private keys found in {}", tls.key.display()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("building TLS configuration")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn is_common_connection_error(err: &dyn std::error::Error) -> bool {
    let s = format!("{:?}", err);
    s.contains("BrokenPipe")
        || s.contains("ConnectionReset")
        || s.contains("UnexpectedEof")
        || s.contains("ConnectionAborted")
        || s.contains("NotConnected")
        || s.contains("TimedOut")
        || s.contains("IncompleteMessage")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn serve_http(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("launchsite HTTP listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn serve_https(addr: SocketAddr, app: Router, tls: rustls::ServerConfig) -> anyhow::Result<()> {
    let tls_acceptor = TlsAcceptor::from(Arc::new(tls));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("launchsite HTTPS listening on {}", addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut shutdown => return Ok(()),
        };
        let (stream, peer) = match accepted {
            Ok(s) => s,
            Err(e) => {
                warn!("Accept error: {e}");
                continue;
            }
        };

        let acceptor = tls_acceptor.clone();
        let app = app
            .clone()
            .layer(Extension(ConnectInfo(peer)))
            .layer(Extension(TlsConnection));

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let io = TokioIo::new(tls_stream);
                    let service = TowerToHyperService { service: app };

                    if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        if !is_common_connection_error(err.as_ref()) {
                            warn!("Error serving connection from {peer}: {:?}", err);
                        }
                    }
                }
                Err(e) => {
                    if !is_common_connection_error(&e) {
                        warn!("TLS accept error from {peer}: {e}");
                    }
                }
            }
        });
    }
}

fn socket_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("LAUNCHSITE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CONFIG_FILE));
    let config = Config::load(Path::new(&config_path))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("launchsite {} starting (config {})", VERSION, config_path.display());
    if config.webhook.url.is_none() {
        warn!("No webhook configured; daily passwords will only be stored on disk");
    }

    let notifier = Arc::new(ChatWebhook::new(config.webhook.clone()));
    let state = Arc::new(AppState::build(config.clone(), notifier).await?);

    if let Some(manager) = &state.passwords {
        let password = manager.current_password().await?;
        let prefix: String = password.chars().take(4).collect();
        info!("Today's admin password initialized: {}...", prefix);
        spawn_rotation(manager.clone());
    }

    let app = router(state.clone());
    let mut tasks = Vec::new();

    let http_addr = socket_addr(&config.server.host, config.server.port)?;
    tasks.push(tokio::spawn(serve_http(http_addr, app.clone())));

    if let Some(tls) = &config.tls {
        // reqwest pulls in ring as well, so the provider must be chosen explicitly.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let tls_config = load_tls_config(tls)?;
        let https_addr = socket_addr(&config.server.host, tls.port)?;
        tasks.push(tokio::spawn(serve_https(https_addr, app.clone(), tls_config)));
    }

    for result in join_all(tasks).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Listener failed: {e:#}"),
            Err(e) => error!("Listener task panicked: {e}"),
        }
    }

    Ok(())
}
