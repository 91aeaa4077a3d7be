//! Profile-driven connection setup.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::core::ssh::{ConnectParams, SshTransport};
use crate::core::transport::{Transport, TransportError};
use crate::vault::{Profile, Vault};

/// Establishes transports from profiles.
pub trait Connector {
    fn connect(
        &self,
        profile: &Profile,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Connects with libssh2.
#[derive(Debug, Clone)]
pub struct SshConnector {
    /// Bound on individual SFTP operations
    pub fs_timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            fs_timeout: Duration::from_secs(30),
        }
    }
}

impl Connector for SshConnector {
    fn connect(
        &self,
        profile: &Profile,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let params = ConnectParams {
            host: &profile.host,
            port: profile.port,
            username: &profile.username,
            secret: &profile.secret,
            timeout,
        };
        let transport = SshTransport::connect(&params)?.with_fs_timeout(self.fs_timeout);
        Ok(Arc::new(transport))
    }
}

/// User-facing text for a failed connection attempt.
pub fn failure_message(profile: &Profile, err: &TransportError) -> String {
    match err {
        TransportError::Authentication(_) => format!(
            "Authentication failed for {}@{}",
            profile.username, profile.host
        ),
        TransportError::Timeout { operation } => format!(
            "Timed out during {} to {}:{}",
            operation, profile.host, profile.port
        ),
        other => format!(
            "Connection to {}:{} failed: {}",
            profile.host, profile.port, other
        ),
    }
}

/// Load `name` from the vault and connect to it.
///
/// `on_result(success, message)` is always called exactly once. A successful
/// connection stamps the profile's `last_used`.
pub fn connect_profile(
    vault: &Vault,
    connector: &dyn Connector,
    name: &str,
    timeout: Duration,
    on_result: &mut dyn FnMut(bool, &str),
) -> Option<Arc<dyn Transport>> {
    let Some(profile) = vault.load(name) else {
        let message = format!("Profile {} not found or unreadable", name);
        warn!("{}", message);
        on_result(false, &message);
        return None;
    };

    match connector.connect(&profile, timeout) {
        Ok(transport) => {
            if !vault.mark_used(name) {
                warn!("Could not record use of profile {}", name);
            }
            let message = format!("Connected to {}", profile.host);
            info!("{} ({})", message, name);
            on_result(true, &message);
            Some(transport)
        }
        Err(e) => {
            let message = failure_message(&profile, &e);
            warn!("{}", message);
            on_result(false, &message);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use std::cell::RefCell;
    use tempfile::TempDir;

    enum Outcome {
        Succeed,
        Fail(fn() -> TransportError),
    }

    struct FakeConnector {
        outcome: Outcome,
        seen: RefCell<Vec<(String, String)>>,
    }

    impl FakeConnector {
        fn new(outcome: Outcome) -> Self {
            Self {
                outcome,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl Connector for FakeConnector {
        fn connect(
            &self,
            profile: &Profile,
            _timeout: Duration,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            self.seen
                .borrow_mut()
                .push((profile.username.clone(), profile.secret.clone()));
            match &self.outcome {
                Outcome::Succeed => Ok(FakeTransport::new()),
                Outcome::Fail(make) => Err(make()),
            }
        }
    }

    fn vault_with(name: &str) -> (TempDir, Vault) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        vault.save(&Profile::new(name, "10.0.0.5", "ops", "s3cret").with_port(2200));
        (dir, vault)
    }

    fn run(vault: &Vault, connector: &FakeConnector, name: &str) -> (bool, Vec<(bool, String)>) {
        let mut results = Vec::new();
        let transport = connect_profile(
            vault,
            connector,
            name,
            Duration::from_secs(1),
            &mut |ok, msg| results.push((ok, msg.to_string())),
        );
        (transport.is_some(), results)
    }

    #[test]
    fn test_connect_success_marks_used() {
        let (_dir, vault) = vault_with("lab");
        let connector = FakeConnector::new(Outcome::Succeed);

        let (connected, results) = run(&vault, &connector, "lab");
        assert!(connected);
        assert_eq!(results, vec![(true, "Connected to 10.0.0.5".to_string())]);
        assert_eq!(
            connector.seen.borrow().as_slice(),
            &[("ops".to_string(), "s3cret".to_string())]
        );
        assert!(vault.load("lab").unwrap().last_used.is_some());
    }

    #[test]
    fn test_auth_failure_is_named() {
        let (_dir, vault) = vault_with("lab");
        let connector = FakeConnector::new(Outcome::Fail(|| {
            TransportError::Authentication("password rejected".to_string())
        }));

        let (connected, results) = run(&vault, &connector, "lab");
        assert!(!connected);
        assert_eq!(results, vec![(false, "Authentication failed for ops@10.0.0.5".to_string())]);
        assert!(vault.load("lab").unwrap().last_used.is_none());
    }

    #[test]
    fn test_timeout_is_named() {
        let (_dir, vault) = vault_with("lab");
        let connector = FakeConnector::new(Outcome::Fail(|| TransportError::timeout("connect")));
        let (_, results) = run(&vault, &connector, "lab");
        assert_eq!(results[0].1, "Timed out during connect to 10.0.0.5:2200");
    }

    #[test]
    fn test_missing_profile_reported() {
        let (_dir, vault) = vault_with("lab");
        let connector = FakeConnector::new(Outcome::Succeed);
        let (connected, results) = run(&vault, &connector, "prod");
        assert!(!connected);
        assert_eq!(results.len(), 1);
        assert!(!results[0].0);
        assert!(results[0].1.contains("prod"));
        assert!(connector.seen.borrow().is_empty());
    }
}
