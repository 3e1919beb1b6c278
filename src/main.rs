use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gatehouse::acme::CertManager;
use gatehouse::admin::{AdminServer, AdminState};
use gatehouse::config::Config;
use gatehouse::db::{DomainStore, ProjectStore};
use gatehouse::process::Supervisor;
use gatehouse::proxy::{ProxyServer, Router};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        ))
        .init();

    // Both rustls providers are compiled in; pin the one we link against.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("no other crypto provider installed yet");

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "configuration error");
        e
    })?;
    config.ensure_directories()?;

    info!(
        http_port = config.http_port,
        https_port = config.https_port,
        admin_port = config.admin_port,
        data_dir = %config.data_dir.display(),
        sockets_dir = %config.sockets_dir.display(),
        production = config.production,
        "starting gatehouse"
    );

    // Metadata first: a corrupted store file is fatal here, before any
    // listener comes up.
    let domains = Arc::new(DomainStore::open(config.domains_db_path()).map_err(|e| {
        error!(error = %e, "failed to open domain store");
        anyhow::anyhow!(e)
    })?);
    let projects = Arc::new(ProjectStore::open(config.projects_db_path()).map_err(|e| {
        error!(error = %e, "failed to open project store");
        anyhow::anyhow!(e)
    })?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn every known project.
    let supervisor = Supervisor::new(Arc::clone(&projects), &config);
    supervisor.start_all().await;

    // Warm the certificate cache from disk for ssl-enabled domains.
    let cert_manager = Arc::new(CertManager::new(config.clone()));
    cert_manager.warm(&domains.ssl_enabled_hostnames());

    let router = Router::new(Arc::clone(&domains), Arc::clone(&projects), Arc::clone(&supervisor));

    // HTTP listener: ACME challenges plus redirect to HTTPS.
    let http_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let http_server = ProxyServer::new(
        http_addr,
        Arc::clone(&router),
        Arc::clone(&cert_manager),
        shutdown_rx.clone(),
    )
    .with_https_redirect(config.https_port);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            error!(error = %e, "HTTP listener error");
        }
    });

    // HTTPS listener: started only once the certificate bundle is
    // non-empty, which may be at boot or after the first issuance.
    let https_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], config.https_port));
    let https_handle = {
        let router = Arc::clone(&router);
        let cert_manager = Arc::clone(&cert_manager);
        let mut bundle_rx = cert_manager.bundle_watch();
        let mut shutdown_rx = shutdown_rx.clone();
        let listener_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            while !*bundle_rx.borrow_and_update() {
                tokio::select! {
                    changed = bundle_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }

            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(cert_manager.resolver());
            let acceptor = TlsAcceptor::from(Arc::new(tls_config));

            let https_server = ProxyServer::new(
                https_addr,
                router,
                cert_manager,
                listener_shutdown,
            )
            .with_tls(acceptor);
            if let Err(e) = https_server.run().await {
                error!(error = %e, "HTTPS listener error");
            }
        })
    };

    // Admin surface, loopback only.
    let admin_addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], config.admin_port));
    let admin_state = Arc::new(AdminState {
        config: config.clone(),
        domains: Arc::clone(&domains),
        projects: Arc::clone(&projects),
        supervisor: Arc::clone(&supervisor),
        cert_manager: Arc::clone(&cert_manager),
    });
    let admin_server = AdminServer::new(admin_addr, admin_state, shutdown_rx.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "admin server error");
        }
    });

    // Background timers.
    tokio::spawn(Arc::clone(&supervisor).run_health_loop(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&cert_manager).run_renewal_loop(shutdown_rx.clone()));

    wait_for_shutdown_signal().await;

    // First signal wins; anything later just logs.
    let _ = shutdown_tx.send(true);
    tokio::spawn(async move {
        loop {
            wait_for_shutdown_signal().await;
            warn!("shutdown already in progress");
        }
    });

    info!("stopping all backends");
    supervisor.stop_all().await;

    if let Err(e) = domains.flush() {
        error!(error = %e, "failed to flush domain store");
    }
    if let Err(e) = projects.flush() {
        error!(error = %e, "failed to flush project store");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        let _ = https_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
    }
}
