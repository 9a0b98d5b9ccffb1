//! Host bootstrap tests

mod common;

use std::sync::Arc;

use common::MemoryRuntime;
use shipyard::bootstrap::{Bootstrap, BootstrapStep};
use shipyard::storage::layout::StorageLayout;
use shipyard::storage::settings::Settings;

#[tokio::test]
async fn test_bootstrap_prepares_host() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(tmp.path());
    let settings = Settings::default();
    let runtime = Arc::new(MemoryRuntime::new());

    let bootstrap = Bootstrap::new(layout.clone(), settings.clone(), runtime.clone());
    let plan = bootstrap.plan();
    assert_eq!(plan.first(), Some(&BootstrapStep::SettingsFile));
    assert!(plan.contains(&BootstrapStep::Network("web".to_string())));

    let reports = bootstrap.run().await.unwrap();
    assert_eq!(reports.len(), plan.len());
    assert!(reports.iter().all(|r| r.ok() && r.tries == 1));

    assert!(layout.settings_file().exists().await);
    assert!(layout.routes_dir().exists().await);
    assert!(layout.logs_dir().exists().await);
    assert_eq!(layout.secrets_dir().mode().await.unwrap() & 0o777, 0o700);
    assert_eq!(layout.settings_file().mode().await.unwrap() & 0o777, 0o600);

    let written: Settings = layout.settings_file().read_json().await.unwrap();
    assert_eq!(written.server.port, settings.server.port);

    let networks = runtime.networks();
    for name in &settings.networks {
        assert!(networks.contains(name));
    }
}

#[tokio::test]
async fn test_bootstrap_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(tmp.path());
    let runtime = Arc::new(MemoryRuntime::new());

    let mut settings = Settings::default();
    settings.controller.history_limit = 7;
    let bootstrap = Bootstrap::new(layout.clone(), settings, runtime.clone());
    bootstrap.run().await.unwrap();

    // An existing settings file is never overwritten
    let again = Bootstrap::new(layout.clone(), Settings::default(), runtime);
    let reports = again.run().await.unwrap();
    assert!(reports.iter().all(|r| r.ok()));

    let kept: Settings = layout.settings_file().read_json().await.unwrap();
    assert_eq!(kept.controller.history_limit, 7);
}
