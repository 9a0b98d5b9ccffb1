//! Secret store adapter
//!
//! Per-service environment files live in one owner-only directory. The
//! store refuses to read anything group- or world-accessible.

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind as IoErrorKind;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;

/// Key/value environment for exactly one service.
///
/// Values are never printed; `Debug` shows the keys only.
pub struct SecretBundle {
    service: String,
    values: BTreeMap<String, SecretString>,
}

impl SecretBundle {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(key.into(), SecretString::from(value.into()));
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over keys and exposed values, for handing to the runtime
    pub fn expose(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose_secret()))
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("service", &self.service)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Source of per-service secrets
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Load the bundle for `service`.
    ///
    /// With `optional` set, a missing file yields an empty bundle.
    async fn load(&self, service: &str, optional: bool) -> Result<SecretBundle, OrchestratorError>;
}

/// Secrets read from `<dir>/<service>.env`
pub struct FileSecretStore {
    dir: Dir,
}

impl FileSecretStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Dir {
        &self.dir
    }
}

fn check_owner_only(path: &std::path::Path, mode: u32) -> Result<(), OrchestratorError> {
    if mode & 0o077 != 0 {
        return Err(OrchestratorError::InsecureStorage {
            path: path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn load(&self, service: &str, optional: bool) -> Result<SecretBundle, OrchestratorError> {
        let dir_mode = self.dir.mode().await.map_err(|e| match e {
            OrchestratorError::IoError(io) => map_io(io, &self.dir.path().display().to_string()),
            other => other,
        })?;
        check_owner_only(self.dir.path(), dir_mode)?;

        let file = self.dir.file(&format!("{service}.env"));
        let display = file.path().display().to_string();

        let file_mode = match file.mode().await {
            Ok(mode) => mode,
            Err(OrchestratorError::IoError(io)) if io.kind() == IoErrorKind::NotFound && optional => {
                debug!("No secrets file for {}, continuing without secrets", service);
                return Ok(SecretBundle::new(service));
            }
            Err(OrchestratorError::IoError(io)) => return Err(map_io(io, &display)),
            Err(other) => return Err(other),
        };
        check_owner_only(file.path(), file_mode)?;

        let contents = file.read_string().await.map_err(|e| match e {
            OrchestratorError::IoError(io) => map_io(io, &display),
            other => other,
        })?;

        let bundle = parse_env(service, &contents)?;
        debug!("Loaded {} secret keys for {}", bundle.len(), service);
        Ok(bundle)
    }
}

fn map_io(err: std::io::Error, path: &str) -> OrchestratorError {
    match err.kind() {
        IoErrorKind::NotFound => OrchestratorError::SecretsUnavailable(format!("{path} does not exist")),
        IoErrorKind::PermissionDenied => OrchestratorError::PermissionDenied(format!("cannot read {path}")),
        _ => OrchestratorError::SecretsUnavailable(format!("{path}: {err}")),
    }
}

/// Parse `KEY=value` lines.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is allowed
/// and values may be wrapped in single or double quotes. Errors name the
/// line number only.
pub fn parse_env(service: &str, contents: &str) -> Result<SecretBundle, OrchestratorError> {
    let mut bundle = SecretBundle::new(service);

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let (key, value) = line.split_once('=').ok_or_else(|| {
            OrchestratorError::SecretsUnavailable(format!(
                "{service}.env line {}: expected KEY=value",
                idx + 1
            ))
        })?;

        let key = key.trim();
        let key_ok = !key.is_empty()
            && !key.starts_with(|c: char| c.is_ascii_digit())
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !key_ok {
            return Err(OrchestratorError::SecretsUnavailable(format!(
                "{service}.env line {}: invalid key",
                idx + 1
            )));
        }

        bundle.insert(key, unquote(value.trim()));
    }

    Ok(bundle)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        let contents = r#"
# database credentials
POSTGRES_USER=app
export POSTGRES_PASSWORD="s3cr=t with spaces"
API_KEY='abc'
EMPTY=
"#;
        let bundle = parse_env("db", contents).unwrap();
        let values: Vec<_> = bundle.expose().collect();
        assert_eq!(
            values,
            vec![
                ("API_KEY", "abc"),
                ("EMPTY", ""),
                ("POSTGRES_PASSWORD", "s3cr=t with spaces"),
                ("POSTGRES_USER", "app"),
            ]
        );
    }

    #[test]
    fn test_parse_env_reports_line_not_value() {
        let err = parse_env("db", "OK=1\nthis-is-secret\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 2"));
        assert!(!msg.contains("this-is-secret"));

        assert!(parse_env("db", "1KEY=x").is_err());
        assert!(parse_env("db", "BAD-KEY=x").is_err());
    }

    #[test]
    fn test_debug_hides_values() {
        let mut bundle = SecretBundle::new("api");
        bundle.insert("TOKEN", "hunter2");
        let printed = format!("{bundle:?}");
        assert!(printed.contains("TOKEN"));
        assert!(!printed.contains("hunter2"));
    }
}
