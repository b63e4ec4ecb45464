use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub const JM_TOKEN_VAR: &str = "JM_TOKEN";
pub const SDP_SESSION_VAR: &str = "SDP_SESSION";

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The two opaque bearer values every backend call carries.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub jm_token: String,
    pub sdp_session: String,
}

impl Credentials {
    pub fn new(jm_token: impl Into<String>, sdp_session: impl Into<String>) -> Self {
        Self {
            jm_token: jm_token.into(),
            sdp_session: sdp_session.into(),
        }
    }

    /// Last four characters of each value, safe to log.
    pub fn fingerprint(&self) -> String {
        format!("{}/{}", tail(&self.jm_token), tail(&self.sdp_session))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn tail(value: &str) -> String {
    let count = value.chars().count();
    let skip = count.saturating_sub(4);
    format!("…{}", value.chars().skip(skip).collect::<String>())
}

pub trait CredentialProvider: Send + Sync {
    /// Read on every backend call so rotations apply without a restart.
    fn current(&self) -> Option<Arc<Credentials>>;
}

#[derive(Debug, Default)]
pub struct CredentialStore {
    snapshot: ArcSwapOption<Credentials>,
}

impl CredentialStore {
    pub fn new(initial: Option<Credentials>) -> Self {
        Self {
            snapshot: ArcSwapOption::from(initial.map(Arc::new)),
        }
    }

    pub fn replace(&self, credentials: Option<Credentials>) {
        self.snapshot.store(credentials.map(Arc::new));
    }
}

impl CredentialProvider for CredentialStore {
    fn current(&self) -> Option<Arc<Credentials>> {
        self.snapshot.load_full()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("read env file {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenvy::Error,
    },
}

/// Dotenv file written by the external login flow, with process env as fallback.
#[derive(Debug, Clone)]
pub struct EnvFileSource {
    path: PathBuf,
}

impl EnvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Values in the file win over process env; either value missing yields `None`.
    pub fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        let mut jm_token = None;
        let mut sdp_session = None;

        if self.path.is_file() {
            let iter = dotenvy::from_path_iter(&self.path).map_err(|source| self.error(source))?;
            for item in iter {
                let (key, value) = item.map_err(|source| self.error(source))?;
                match key.as_str() {
                    JM_TOKEN_VAR => jm_token = non_empty(value),
                    SDP_SESSION_VAR => sdp_session = non_empty(value),
                    _ => {}
                }
            }
        }

        let jm_token = jm_token.or_else(|| std::env::var(JM_TOKEN_VAR).ok().and_then(non_empty));
        let sdp_session =
            sdp_session.or_else(|| std::env::var(SDP_SESSION_VAR).ok().and_then(non_empty));

        Ok(match (jm_token, sdp_session) {
            (Some(jm_token), Some(sdp_session)) => Some(Credentials::new(jm_token, sdp_session)),
            _ => None,
        })
    }

    fn error(&self, source: dotenvy::Error) -> CredentialError {
        CredentialError::EnvFile {
            path: self.path.display().to_string(),
            source,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Background poller that swaps the store whenever the env file changes.
pub struct CredentialWatcher {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CredentialWatcher {
    pub fn spawn(store: Arc<CredentialStore>, source: EnvFileSource, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                refresh(&store, &source);
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!(event = "credential_watcher_join_failed", error = %err);
        }
    }
}

/// Reloads `source` into `store`; returns whether the snapshot changed.
pub fn refresh(store: &CredentialStore, source: &EnvFileSource) -> bool {
    let loaded = match source.load() {
        Ok(loaded) => loaded,
        Err(err) => {
            warn!(event = "credentials_reload_failed", error = %err);
            return false;
        }
    };
    let current = store.current();
    if current.as_deref() == loaded.as_ref() {
        return false;
    }
    match &loaded {
        Some(credentials) => info!(
            event = "credentials_rotated",
            path = %source.path().display(),
            fingerprint = %credentials.fingerprint()
        ),
        None => warn!(
            event = "credentials_missing",
            path = %source.path().display()
        ),
    }
    store.replace(loaded);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_env_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("jmproxy-cred-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".env");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn fingerprint_never_exposes_full_value() {
        let creds = Credentials::new("abcdefgh1234", "xyz");
        assert_eq!(creds.fingerprint(), "…1234/…xyz");
        assert!(!format!("{creds:?}").contains("abcdefgh"));
    }

    #[test]
    fn loads_both_values_from_file() {
        let path = temp_env_file("both", "JM_TOKEN=token-1\nSDP_SESSION=\"session-1\"\n");
        let loaded = EnvFileSource::new(&path).load().unwrap();
        assert_eq!(loaded, Some(Credentials::new("token-1", "session-1")));
    }

    #[test]
    fn refresh_swaps_only_on_change() {
        let path = temp_env_file("rotate", "JM_TOKEN=a\nSDP_SESSION=b\n");
        let source = EnvFileSource::new(&path);
        let store = CredentialStore::default();

        assert!(refresh(&store, &source));
        assert!(!refresh(&store, &source));

        std::fs::write(&path, "JM_TOKEN=c\nSDP_SESSION=b\n").unwrap();
        assert!(refresh(&store, &source));
        assert_eq!(store.current().unwrap().jm_token, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_floored() {
        let path = temp_env_file("zero", "JM_TOKEN=t-zero\nSDP_SESSION=s-zero\n");
        let store = Arc::new(CredentialStore::default());
        let watcher =
            CredentialWatcher::spawn(store.clone(), EnvFileSource::new(&path), Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.current().unwrap().jm_token, "t-zero");
        watcher.shutdown().await;
    }
}
