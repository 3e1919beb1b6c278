//! End-to-end scenarios: metadata durability, record corruption isolation,
//! supervisor crash restarts, Unix-socket forwarding, and the HTTP
//! listener's challenge/redirect behavior.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener};
use tokio::sync::watch;
use uuid::Uuid;

use gatehouse::acme::CertManager;
use gatehouse::config::Config;
use gatehouse::db::{DomainStore, ProjectStatus, ProjectStore};
use gatehouse::process::Supervisor;
use gatehouse::proxy::{forward_to_socket, ProxyServer, Router};

fn test_config(dir: &Path) -> Config {
    let dir = dir.to_string_lossy().into_owned();
    Config::from_lookup(move |key| match key {
        "ADMIN_API_KEY" => Some("integration-key".to_string()),
        "DATA_DIR" => Some(dir.clone()),
        "CERTBOT_PATH" => Some("/bin/false".to_string()),
        "PROCESS_START_TIMEOUT" => Some("3000".to_string()),
        _ => None,
    })
    .unwrap()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Serves an HTTP/1.1 echo backend on a Unix socket: responds with a JSON
/// summary of the request it saw.
fn spawn_echo_backend(listener: UnixListener) {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(String::from)
                    };
                    let summary = serde_json::json!({
                        "method": req.method().as_str(),
                        "path": req.uri().path(),
                        "query": req.uri().query(),
                        "host": header("host"),
                        "x_forwarded_for": header("x-forwarded-for"),
                        "x_forwarded_host": header("x-forwarded-host"),
                        "x_forwarded_proto": header("x-forwarded-proto"),
                    });
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(
                        summary.to_string(),
                    ))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });
}

#[test]
fn metadata_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    config.ensure_directories().unwrap();

    let (domain_ids, project_ids) = {
        let domains = DomainStore::open(config.domains_db_path()).unwrap();
        let projects = ProjectStore::open(config.projects_db_path()).unwrap();

        let p1 = projects
            .create("web".to_string(), "/opt/web".into(), "/run/web.sock".into())
            .unwrap();
        let p2 = projects
            .create("api".to_string(), "/opt/api".into(), "/run/api.sock".into())
            .unwrap();

        let d1 = domains.create("a.test".to_string(), p1.id, false).unwrap();
        let d2 = domains.create("b.test".to_string(), p1.id, true).unwrap();
        let d3 = domains.create("c.test".to_string(), p2.id, false).unwrap();

        (vec![d1.id, d2.id, d3.id], vec![p1.id, p2.id])
        // Dropped without any orderly shutdown; every mutation already
        // flushed, so this models an abrupt kill.
    };

    let domains = DomainStore::open(config.domains_db_path()).unwrap();
    let projects = ProjectStore::open(config.projects_db_path()).unwrap();

    assert_eq!(domains.list().len(), 3);
    assert_eq!(projects.list().len(), 2);
    for id in domain_ids {
        assert!(domains.get(id).is_some(), "domain {id} survived restart");
    }
    for id in project_ids {
        assert!(projects.get(id).is_some(), "project {id} survived restart");
    }
    assert!(domains.get_by_hostname("b.test").unwrap().ssl_enabled);
}

#[test]
fn corrupted_domain_record_does_not_poison_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    config.ensure_directories().unwrap();

    {
        let domains = DomainStore::open(config.domains_db_path()).unwrap();
        let project_id = Uuid::new_v4();
        domains.create("a.test".to_string(), project_id, false).unwrap();
        domains.create("b.test".to_string(), project_id, false).unwrap();
        domains.create("c.test".to_string(), project_id, false).unwrap();
    }

    // Flip one byte inside the first record's payload. Records start
    // right after the 32-byte header: id(16) + size(4) + payload.
    let path = config.domains_db_path();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[32 + 20 + 2] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let domains = DomainStore::open(&path).unwrap();
    let hostnames: Vec<String> = domains.list().into_iter().map(|d| d.hostname).collect();
    assert_eq!(hostnames.len(), 2, "exactly one record lost: {hostnames:?}");
    for hostname in &hostnames {
        assert!(["a.test", "b.test", "c.test"].contains(&hostname.as_str()));
    }
}

#[tokio::test]
async fn crashed_backend_restarts_with_a_new_pid() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    config.ensure_directories().unwrap();

    let projects = Arc::new(ProjectStore::open(config.projects_db_path()).unwrap());
    let id = Uuid::new_v4();
    // Comes up, then dies after a second; the supervisor should bring it
    // back roughly five seconds later.
    let binary = write_script(dir.path(), "shortlived", "touch \"$SOCKET_PATH\"\nsleep 1");
    let project = projects
        .create_with_id(id, "shortlived".to_string(), binary, config.socket_path_for(id))
        .unwrap();

    let supervisor = Supervisor::new(Arc::clone(&projects), &config);
    supervisor.start(project.id).await.unwrap();
    let first_pid = supervisor.info(project.id).unwrap().pid;

    // Crash is detected within ~1.5s, restart follows after the 5s delay.
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut restarted_pid = None;
    while Instant::now() < deadline {
        if let Some(info) = supervisor.info(project.id) {
            if info.pid != first_pid {
                restarted_pid = Some(info.pid);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let restarted_pid = restarted_pid.expect("backend restarted after crash");
    assert_ne!(restarted_pid, first_pid);

    supervisor.stop(project.id).await.unwrap();
    assert_eq!(projects.get(project.id).unwrap().status, ProjectStatus::Stopped);
}

#[tokio::test]
async fn router_maps_failures_to_the_right_codes() {
    use gatehouse::error::RouteErrorCode;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    config.ensure_directories().unwrap();

    let domains = Arc::new(DomainStore::open(config.domains_db_path()).unwrap());
    let projects = Arc::new(ProjectStore::open(config.projects_db_path()).unwrap());
    let supervisor = Supervisor::new(Arc::clone(&projects), &config);
    let router = Router::new(Arc::clone(&domains), Arc::clone(&projects), supervisor);

    // No domain at all.
    let err = router.resolve("ghost.test").unwrap_err();
    assert!(matches!(err.0, RouteErrorCode::UnknownHost));

    // Domain pointing at a deleted project.
    domains.create("dangling.test".to_string(), Uuid::new_v4(), false).unwrap();
    let err = router.resolve("dangling.test").unwrap_err();
    assert!(matches!(err.0, RouteErrorCode::ProjectMissing));

    // Project exists but was never started.
    let project = projects
        .create("idle".to_string(), "/opt/idle".into(), "/run/idle.sock".into())
        .unwrap();
    domains.create("idle.test".to_string(), project.id, false).unwrap();
    let err = router.resolve("idle.test").unwrap_err();
    assert!(matches!(err.0, RouteErrorCode::BackendNotRunning));
}

#[tokio::test]
async fn requests_forward_over_the_backend_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    config.ensure_directories().unwrap();

    let domains = Arc::new(DomainStore::open(config.domains_db_path()).unwrap());
    let projects = Arc::new(ProjectStore::open(config.projects_db_path()).unwrap());
    let supervisor = Supervisor::new(Arc::clone(&projects), &config);

    let id = Uuid::new_v4();
    let socket_path = config.socket_path_for(id);
    let binary = write_script(dir.path(), "sleeper", "exec sleep 60");
    let project = projects
        .create_with_id(id, "echo".to_string(), binary, socket_path.clone())
        .unwrap();
    domains.create("echo.test".to_string(), project.id, false).unwrap();

    // Bind the backend socket while the supervisor's readiness poll is
    // running, the way a real backend would.
    let start = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.start(id).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    let listener = UnixListener::bind(&socket_path).unwrap();
    spawn_echo_backend(listener);
    start.await.unwrap().unwrap();
    assert_eq!(projects.get(id).unwrap().status, ProjectStatus::Running);

    // Route and relay, with the forwarding headers a real request carries.
    let router = Router::new(Arc::clone(&domains), Arc::clone(&projects), Arc::clone(&supervisor));
    let route = router.resolve("echo.test").unwrap();

    let req = Request::builder()
        .method("GET")
        .uri("http://echo.test/widgets/7?full=1")
        .header("host", "echo.test")
        .header("x-forwarded-for", "203.0.113.9")
        .header("x-forwarded-host", "echo.test")
        .header("x-forwarded-proto", "https")
        .body(Empty::<Bytes>::new())
        .unwrap();

    let response = forward_to_socket(req, &route.socket_path).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let echoed: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(echoed["method"], "GET");
    assert_eq!(echoed["path"], "/widgets/7");
    assert_eq!(echoed["query"], "full=1");
    assert_eq!(echoed["host"], "echo.test");
    assert_eq!(echoed["x_forwarded_for"], "203.0.113.9");
    assert_eq!(echoed["x_forwarded_host"], "echo.test");
    assert_eq!(echoed["x_forwarded_proto"], "https");

    supervisor.stop(id).await.unwrap();
}

#[tokio::test]
async fn dial_failure_surfaces_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("nobody-home.sock");

    let req = Request::builder()
        .uri("/")
        .header("host", "a.test")
        .body(Empty::<Bytes>::new())
        .unwrap();
    assert!(forward_to_socket(req, &socket_path).await.is_err());
}

#[tokio::test]
async fn http_listener_serves_challenges_and_redirects() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    config.ensure_directories().unwrap();

    let domains = Arc::new(DomainStore::open(config.domains_db_path()).unwrap());
    let projects = Arc::new(ProjectStore::open(config.projects_db_path()).unwrap());
    let supervisor = Supervisor::new(Arc::clone(&projects), &config);
    let router = Router::new(domains, projects, supervisor);
    let cert_manager = Arc::new(CertManager::new(config.clone()));
    cert_manager.set_challenge("live-token", "live-token.key-auth");

    // Grab a free port, then hand it to the listener.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(addr, router, Arc::clone(&cert_manager), shutdown_rx)
        .with_https_redirect(8443);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Challenge path answers from the in-memory map.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /.well-known/acme-challenge/live-token HTTP/1.1\r\n\
              Host: a.test\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("live-token.key-auth"));

    // Unknown tokens are 404, not redirected.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /.well-known/acme-challenge/missing HTTP/1.1\r\n\
              Host: a.test\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    // Everything else redirects to HTTPS with path and query intact.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /dashboard?tab=2 HTTP/1.1\r\n\
              Host: a.test\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 301"), "{response}");
    assert!(
        response.contains("location: https://a.test:8443/dashboard?tab=2")
            || response.contains("Location: https://a.test:8443/dashboard?tab=2"),
        "{response}"
    );
}

#[test]
fn certificate_bundle_swaps_without_listener_restart() {
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("live");

    for hostname in ["a.test", "b.test"] {
        let certified = rcgen::generate_simple_self_signed(vec![hostname.to_string()]).unwrap();
        let host_dir = live.join(hostname);
        std::fs::create_dir_all(&host_dir).unwrap();
        std::fs::write(host_dir.join("fullchain.pem"), certified.cert.pem()).unwrap();
        std::fs::write(host_dir.join("privkey.pem"), certified.key_pair.serialize_pem()).unwrap();
    }

    let dir_str = dir.path().to_string_lossy().into_owned();
    let config = Config::from_lookup(move |key| match key {
        "ADMIN_API_KEY" => Some("integration-key".to_string()),
        "DATA_DIR" => Some(format!("{dir_str}/data")),
        "LETSENCRYPT_DIR" => Some(format!("{dir_str}/live")),
        _ => None,
    })
    .unwrap();

    let manager = CertManager::new(config);
    // The resolver shares the live cache, so entries added after the
    // listener is built are visible to it.
    let resolver = manager.resolver();

    manager.warm(&["a.test".to_string()]);
    assert_eq!(manager.hostnames(), vec!["a.test".to_string()]);
    assert!(format!("{resolver:?}").contains("a.test"));

    manager.reload("b.test").unwrap();
    let mut hostnames = manager.hostnames();
    hostnames.sort();
    assert_eq!(hostnames, vec!["a.test".to_string(), "b.test".to_string()]);
    let debug = format!("{resolver:?}");
    assert!(debug.contains("a.test") && debug.contains("b.test"));

    manager.evict("a.test");
    assert_eq!(manager.hostnames(), vec!["b.test".to_string()]);
}
