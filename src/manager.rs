use futures::StreamExt;
use secrecy::SecretString;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::client::ChatClient;
use crate::config::{LaunchMode, ServiceConfig};
use crate::error::{Result, SessionError};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Concrete model identifier served by the local service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelHandle {
    id: String,
}

impl ModelHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Locates (or starts) the local inference service and resolves model aliases.
#[derive(Debug, Clone)]
pub struct ServiceManager {
    config: Arc<ServiceConfig>,
    client: ChatClient,
    // Model ids served by the service, fetched once per manager
    catalog: Arc<RwLock<Option<Vec<ModelHandle>>>>,
    // Set only when this manager launched the service itself
    child: Arc<Mutex<Option<Child>>>,
}

impl ServiceManager {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let client = ChatClient::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            client,
            catalog: Arc::new(RwLock::new(None)),
            child: Arc::new(Mutex::new(None)),
        })
    }

    /// Builds a manager and makes sure the service is reachable.
    pub async fn connect(config: ServiceConfig) -> Result<Self> {
        let manager = Self::new(config)?;
        manager.start_service().await?;
        Ok(manager)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn service_uri(&self) -> String {
        self.config.service_uri()
    }

    pub fn endpoint(&self) -> String {
        self.config.base_url()
    }

    pub fn api_key(&self) -> &SecretString {
        &self.config.api_key
    }

    /// Label reported as the source of runs issued through this manager.
    pub fn source(&self) -> &str {
        &self.config.source
    }

    pub(crate) fn client(&self) -> ChatClient {
        self.client.clone()
    }

    pub async fn is_service_running(&self) -> bool {
        self.client.ping(self.config.connect_timeout()).await
    }

    /// Makes the service reachable, launching it first when configured to.
    ///
    /// In attach mode an unreachable service is an error. Calling this while
    /// the service is already up is a no-op.
    pub async fn start_service(&self) -> Result<()> {
        if self.is_service_running().await {
            tracing::debug!(endpoint = %self.endpoint(), "Local service already running");
            return Ok(());
        }

        match &self.config.launch {
            LaunchMode::Attach => Err(SessionError::unavailable(
                self.endpoint(),
                "service is not running (launch mode is attach)",
            )),
            LaunchMode::Spawn { program, args } => {
                self.spawn_service(program, args).await?;
                self.wait_until_ready().await
            }
        }
    }

    async fn spawn_service(&self, program: &str, args: &[String]) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::debug!("Service process already spawned, waiting for readiness");
                return Ok(());
            }
        }

        tracing::info!(program = %program, args = ?args, "Starting local service");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                let reason = format!("failed to spawn {}: {}", program, e);
                SessionError::unavailable(self.endpoint(), reason)
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(FramedRead::new(stdout, LinesCodec::new()), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(FramedRead::new(stderr, LinesCodec::new()), "stderr");
        }

        *guard = Some(child);
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let timeout = self.config.startup_timeout();
        tracing::info!(endpoint = %self.endpoint(), ?timeout, "Waiting for local service");

        let ready = tokio::time::timeout(timeout, async {
            loop {
                if self.is_service_running().await {
                    return Ok(());
                }

                // A launcher that exits cleanly may have daemonized the service
                if let Some(child) = self.child.lock().await.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        if !status.success() {
                            return Err(SessionError::unavailable(
                                self.endpoint(),
                                format!("service process exited with {}", status),
                            ));
                        }
                    }
                }

                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        })
        .await;

        match ready {
            Ok(Ok(())) => {
                tracing::info!(endpoint = %self.endpoint(), "Local service ready");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Local service failed to start");
                self.reap_spawned().await;
                Err(e)
            }
            Err(_) => {
                tracing::error!(?timeout, "Local service startup timed out");
                self.reap_spawned().await;
                Err(SessionError::unavailable(
                    self.endpoint(),
                    format!("service not ready after {:?}", timeout),
                ))
            }
        }
    }

    // Kills and waits on a child that never became ready
    async fn reap_spawned(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to stop service process after failed start");
            }
        }
    }

    /// Models currently served, queried fresh on every call.
    pub async fn list_loaded(&self) -> Result<Vec<ModelHandle>> {
        let models = self.client.list_models().await?;
        Ok(models.into_iter().map(|m| ModelHandle::new(m.id)).collect())
    }

    async fn catalog(&self) -> Result<Vec<ModelHandle>> {
        let read_lock = self.catalog.read().await;
        if let Some(models) = read_lock.as_ref() {
            return Ok(models.clone());
        }
        drop(read_lock);

        let mut write_lock = self.catalog.write().await;
        if let Some(models) = write_lock.as_ref() {
            return Ok(models.clone());
        }

        let models = self.list_loaded().await?;
        tracing::debug!(count = models.len(), "Fetched model catalog");
        *write_lock = Some(models.clone());
        Ok(models)
    }

    /// Forgets the cached catalog so the next resolve queries the service.
    pub async fn refresh_catalog(&self) {
        *self.catalog.write().await = None;
    }

    /// Resolves a human-friendly alias to a concrete served model.
    pub async fn resolve(&self, alias: &str) -> Result<ModelHandle> {
        let catalog = self.catalog().await?;
        let ids: Vec<&str> = catalog.iter().map(ModelHandle::id).collect();

        let wanted = self
            .config
            .aliases
            .get(alias)
            .map(String::as_str)
            .unwrap_or(alias);

        let resolved = if wanted == alias {
            match_alias(alias, &ids)
        } else {
            // Configured override: the id itself must be served
            ids.iter().copied().find(|id| id.eq_ignore_ascii_case(wanted))
        };

        match resolved {
            Some(id) => {
                tracing::info!(alias = %alias, model_id = %id, "Resolved model alias");
                Ok(ModelHandle::new(id))
            }
            None => {
                tracing::warn!(alias = %alias, available = ids.len(), "Alias did not resolve");
                Err(SessionError::UnknownAlias {
                    alias: alias.to_string(),
                    available: ids.iter().map(|id| id.to_string()).collect(),
                })
            }
        }
    }

    /// Stops the service process if this manager spawned it.
    pub async fn shutdown(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            tracing::info!("Stopping spawned local service");
            child.kill().await.map_err(|e| {
                SessionError::unavailable(self.endpoint(), format!("failed to stop service: {}", e))
            })?;
        }
        Ok(())
    }
}

fn forward_output<R>(mut lines: FramedRead<R, LinesCodec>, stream: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(Ok(line)) = lines.next().await {
            let line = line.trim();
            if !line.is_empty() {
                tracing::debug!(stream, "service: {}", line);
            }
        }
    });
}

/// Picks the served id an alias refers to.
///
/// An exact (case-insensitive) id match wins. Otherwise the alias names a
/// family: any id that continues the alias with `-`, `:` or `/` matches, and
/// the lexicographically smallest candidate is chosen.
pub fn match_alias<'a>(alias: &str, ids: &[&'a str]) -> Option<&'a str> {
    let alias = alias.trim().to_ascii_lowercase();
    if alias.is_empty() {
        return None;
    }

    if let Some(id) = ids.iter().copied().find(|id| id.to_ascii_lowercase() == alias) {
        return Some(id);
    }

    ids.iter()
        .copied()
        .filter(|id| {
            let id = id.to_ascii_lowercase();
            id.strip_prefix(&alias)
                .and_then(|rest| rest.chars().next())
                .is_some_and(|sep| matches!(sep, '-' | ':' | '/'))
        })
        .min()
}
