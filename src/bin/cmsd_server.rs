use anyhow::{Context, Result};
use cmsd_svc::app::AppEnv;
use cmsd_svc::config::{self, Config};
use cmsd_svc::http::router;
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{
    EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

const LISTEN_BACKLOG: u32 = 10000;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cnf = config::init()?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cnf.rust_log)))
        .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::CLOSE))
        .init();

    let app = AppEnv::from_config(cnf).await?;
    let router = router::new(app).await;
    let listener = bind_listener(cnf)?;
    tracing::info!(
        "shaping {} on {}:{}",
        cnf.origin_url,
        cnf.app_host,
        cnf.app_port
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("cmsd server failed")?;
    tracing::info!("cmsd server stopped");
    Ok(())
}

/// Several shaper processes may share the port; the delay store keeps them consistent.
fn bind_listener(cnf: &Config) -> Result<TcpListener> {
    let addr = format!("{}:{}", cnf.app_host, cnf.app_port)
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid listen address {}:{}", cnf.app_host, cnf.app_port))?;
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM, only ctrl-c stops the server: {e}");
            None
        }
    };
    let terminated = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => tracing::info!("ctrl-c received, draining connections"),
            Err(e) => tracing::error!("ctrl-c handler failed, shutting down: {e}"),
        },
        _ = terminated => tracing::info!("SIGTERM received, draining connections"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen_config(host: &str) -> Config {
        let vars = [("APP_HOST", host), ("APP_PORT", "0")];
        envy::from_iter(vars.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap()
    }

    #[tokio::test]
    async fn binds_loopback_on_an_ephemeral_port() {
        let listener = bind_listener(&listen_config("127.0.0.1")).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn unparsable_host_is_an_error() {
        let err = bind_listener(&listen_config("not a host")).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"), "{err}");
    }
}
