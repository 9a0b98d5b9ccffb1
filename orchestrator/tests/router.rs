//! Traefik file-provider router tests

use std::time::Duration;

use shipyard::errors::ErrorKind;
use shipyard::models::instance::InstanceHandle;
use shipyard::models::service::RouteRule;
use shipyard::router::traefik::{TraefikFileRouter, TraefikOptions};
use shipyard::router::Router;
use tokio_test::{assert_err, assert_ok};

fn options(dir: &std::path::Path) -> TraefikOptions {
    TraefikOptions {
        dynamic_dir: dir.to_path_buf(),
        api_url: None,
        timeout: Duration::from_secs(1),
    }
}

fn rule(host: &str) -> RouteRule {
    RouteRule {
        host: host.to_string(),
        entrypoint: "websecure".to_string(),
        tls_resolver: Some("letsencrypt".to_string()),
    }
}

#[tokio::test]
async fn test_missing_directory_is_unreachable() {
    let tmp = tempfile::tempdir().unwrap();
    let err = TraefikFileRouter::open(options(&tmp.path().join("nope")))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::RouterUnreachable);
}

#[tokio::test]
async fn test_register_writes_file_and_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let router = TraefikFileRouter::open(options(tmp.path())).await.unwrap();
    assert_ok!(router.ping().await);

    let target = InstanceHandle::new("web-v1-aaaa1111");
    router
        .register_route("web", &rule("web.example.com"), 8080, &target)
        .await
        .unwrap();

    let raw = std::fs::read_to_string(tmp.path().join("web.yml")).unwrap();
    assert!(raw.contains("Host(`web.example.com`)"));
    assert!(raw.contains("http://web-v1-aaaa1111:8080"));
    assert!(raw.contains("certResolver: letsencrypt"));

    let reopened = TraefikFileRouter::open(options(tmp.path())).await.unwrap();
    let route = reopened.current("web").await.unwrap().unwrap();
    assert_eq!(route.target, target);
    assert_eq!(route.port, 8080);
    assert_eq!(route.rule, rule("web.example.com"));
}

#[tokio::test]
async fn test_swap_target_returns_previous() {
    let tmp = tempfile::tempdir().unwrap();
    let router = TraefikFileRouter::open(options(tmp.path())).await.unwrap();

    let err = router
        .swap_target("web", &InstanceHandle::new("web-v2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    router
        .register_route("web", &rule("web.example.com"), 8080, &InstanceHandle::new("web-v1"))
        .await
        .unwrap();
    let previous = router
        .swap_target("web", &InstanceHandle::new("web-v2"))
        .await
        .unwrap();
    assert_eq!(previous.target, InstanceHandle::new("web-v1"));

    let current = router.current("web").await.unwrap().unwrap();
    assert_eq!(current.target, InstanceHandle::new("web-v2"));
    let raw = std::fs::read_to_string(tmp.path().join("web.yml")).unwrap();
    assert!(raw.contains("http://web-v2:8080"));
    assert!(!raw.contains("web-v1"));
}

#[tokio::test]
async fn test_host_conflict() {
    let tmp = tempfile::tempdir().unwrap();
    let router = TraefikFileRouter::open(options(tmp.path())).await.unwrap();

    router
        .register_route("web", &rule("example.com"), 8080, &InstanceHandle::new("web-v1"))
        .await
        .unwrap();
    let err = assert_err!(
        router
            .register_route("blog", &rule("example.com"), 8080, &InstanceHandle::new("blog-v1"))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::RuleConflict);
    assert!(!tmp.path().join("blog.yml").exists());

    // Re-registering the owner replaces its route
    router
        .register_route("web", &rule("example.com"), 9090, &InstanceHandle::new("web-v2"))
        .await
        .unwrap();
    assert_eq!(router.current("web").await.unwrap().unwrap().port, 9090);
}

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let router = TraefikFileRouter::open(options(tmp.path())).await.unwrap();

    router
        .register_route("web", &rule("web.example.com"), 8080, &InstanceHandle::new("web-v1"))
        .await
        .unwrap();
    assert_ok!(router.deregister_route("web").await);
    assert_ok!(router.deregister_route("web").await);

    assert!(router.current("web").await.unwrap().is_none());
    assert!(!tmp.path().join("web.yml").exists());
}

#[tokio::test]
async fn test_foreign_files_are_left_alone() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("middlewares.yml"), "http:\n  middlewares: {}\n").unwrap();

    let router = TraefikFileRouter::open(options(tmp.path())).await.unwrap();
    assert!(router.current("middlewares").await.unwrap().is_none());
    assert!(tmp.path().join("middlewares.yml").exists());
}

#[tokio::test]
async fn test_current_follows_the_file_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let router = TraefikFileRouter::open(options(tmp.path())).await.unwrap();
    router
        .register_route("web", &rule("web.example.com"), 8080, &InstanceHandle::new("web-v1"))
        .await
        .unwrap();

    // A write that landed without the in-memory table catching up
    let other = TraefikFileRouter::open(options(tmp.path())).await.unwrap();
    other
        .swap_target("web", &InstanceHandle::new("web-v2"))
        .await
        .unwrap();

    let route = assert_ok!(router.current("web").await).unwrap();
    assert_eq!(route.target, InstanceHandle::new("web-v2"));

    other.deregister_route("web").await.unwrap();
    assert!(router.current("web").await.unwrap().is_none());

    // The refreshed table no longer claims the host
    router
        .register_route("blog", &rule("web.example.com"), 8080, &InstanceHandle::new("blog-v1"))
        .await
        .unwrap();
}
