//! Connection manager
//!
//! Owns the set of endpoints and the shared job registry, and is the
//! surface the CLI talks to. Endpoints are keyed by address; asking
//! for an address twice hands back the same endpoint.

use std::sync::Arc;

use dashmap::DashMap;

use fl_core::{ClientConfig, ClientError, ConnectionError, JobKey};

use crate::endpoint::{Endpoint, Submission};
use crate::registry::{Job, JobRegistry};
use crate::ssh::{SshLauncher, TunnelLauncher};

/// The set of known endpoints plus the shared job registry
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    registry: Arc<JobRegistry>,
    launcher: Arc<dyn TunnelLauncher>,
    endpoints: DashMap<String, Arc<Endpoint>>,
}

impl ConnectionManager {
    /// Create a manager using the ssh subprocess launcher
    pub fn new(config: ClientConfig) -> Self {
        let config = Arc::new(config);
        Self::with_launcher(
            Arc::clone(&config),
            Arc::new(SshLauncher::new(Arc::clone(&config))),
        )
    }

    /// Create a manager with a caller-supplied launcher
    pub fn with_launcher(config: Arc<ClientConfig>, launcher: Arc<dyn TunnelLauncher>) -> Self {
        Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            launcher,
            endpoints: DashMap::new(),
        }
    }

    /// The endpoint for `address`, created on first use
    pub fn endpoint(&self, address: &str) -> Arc<Endpoint> {
        self.endpoints
            .entry(address.to_string())
            .or_insert_with(|| {
                Endpoint::new(
                    address,
                    Arc::clone(&self.config),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.launcher),
                )
            })
            .clone()
    }

    /// Connect (or reconnect) the endpoint for `address`
    pub async fn connect(&self, address: &str) -> Result<Arc<Endpoint>, ClientError> {
        let endpoint = self.endpoint(address);
        endpoint.connect().await?;
        Ok(endpoint)
    }

    /// Disconnect one endpoint, keeping its job records
    pub async fn disconnect(&self, address: &str) {
        if let Some(endpoint) = self.endpoints.get(address).map(|e| Arc::clone(&e)) {
            endpoint.disconnect().await;
        }
    }

    /// Submit a serialized flow to the endpoint for `address`
    pub async fn submit(&self, address: &str, flow: &str) -> Result<Submission, ClientError> {
        self.connected(address)?.submit(flow).await
    }

    /// Ask `address` to end a job after its current step
    pub async fn terminate_job(&self, key: &JobKey) -> Result<(), ClientError> {
        self.connected(&key.endpoint)?.terminate_job(&key.id).await
    }

    /// Ask `address` to kill a job immediately
    pub async fn kill_job(&self, key: &JobKey) -> Result<(), ClientError> {
        self.connected(&key.endpoint)?.kill_job(&key.id).await
    }

    /// Forget a job record on this side. The daemon is not told.
    pub fn remove_job(&self, key: &JobKey) -> Option<Arc<tokio::sync::RwLock<Job>>> {
        self.registry.remove(key)
    }

    /// The shared job registry
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Addresses of all known endpoints
    pub fn addresses(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.key().clone()).collect()
    }

    /// Disconnect every endpoint
    pub async fn shutdown(&self) {
        let endpoints: Vec<_> = self.endpoints.iter().map(|e| Arc::clone(&e)).collect();
        for endpoint in endpoints {
            endpoint.disconnect().await;
        }
    }

    fn connected(&self, address: &str) -> Result<Arc<Endpoint>, ClientError> {
        self.endpoints
            .get(address)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| {
                ConnectionError::NotConnected {
                    address: address.to_string(),
                }
                .into()
            })
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoints", &self.addresses())
            .field("jobs", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::SecureTunnel;
    use async_trait::async_trait;
    use fl_core::SubprocessError;

    struct NullLauncher;

    #[async_trait]
    impl TunnelLauncher for NullLauncher {
        async fn ask_port(&self, _address: &str) -> Result<Option<u16>, SubprocessError> {
            Ok(None)
        }
        async fn launch_daemon(&self, _address: &str) -> Result<(), SubprocessError> {
            Ok(())
        }
        async fn open_tunnel(
            &self,
            address: &str,
            remote_port: u16,
        ) -> Result<SecureTunnel, SubprocessError> {
            Ok(SecureTunnel::detached(remote_port, address, remote_port))
        }
        async fn session_credential(&self) -> Option<String> {
            None
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::with_launcher(
            Arc::new(ClientConfig::default()),
            Arc::new(NullLauncher),
        )
    }

    #[test]
    fn test_endpoint_is_created_once() {
        let manager = manager();
        let first = manager.endpoint("rocky");
        let second = manager.endpoint("rocky");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.addresses(), ["rocky"]);
    }

    #[tokio::test]
    async fn test_job_actions_need_a_known_endpoint() {
        let manager = manager();
        let key = JobKey::new("rocky", "1");
        assert!(matches!(
            manager.terminate_job(&key).await.unwrap_err(),
            ClientError::Connection(ConnectionError::NotConnected { .. })
        ));
        assert!(matches!(
            manager.submit("rocky", "flow").await.unwrap_err(),
            ClientError::Connection(ConnectionError::NotConnected { .. })
        ));
    }
}
