//! SSH port forwarding in front of the database connection.
//!
//! The tunnel is opened before any URI is built; its bound endpoint replaces
//! the database host and port. A tunnel is stopped exactly once, by its owner.

use crate::error::DbResult;
use crate::models::TunnelConfig;
use crate::runtime::SharedRuntime;

/// A running local-to-remote forwarder.
pub trait Tunnel: Send {
    /// Host the local listener is bound to.
    fn bound_host(&self) -> &str;

    /// Port the local listener is bound to.
    fn bound_port(&self) -> u16;

    /// Stop forwarding. Calling it again is a no-op.
    fn stop(&mut self) -> DbResult<()>;
}

/// Opens tunnels.
pub trait TunnelOpener: Send + Sync {
    /// Connect, authenticate and bind the listener. Returns once the listener
    /// is accepting connections.
    fn open(&self, config: &TunnelConfig) -> DbResult<Box<dyn Tunnel>>;
}

/// Tunnel opener backed by russh.
#[derive(Debug, Clone, Default)]
pub struct SshTunnelService {
    runtime: SharedRuntime,
}

impl SshTunnelService {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self { runtime }
    }
}

#[cfg(not(feature = "ssh-tunnel"))]
impl TunnelOpener for SshTunnelService {
    fn open(&self, _config: &TunnelConfig) -> DbResult<Box<dyn Tunnel>> {
        let _ = &self.runtime;
        Err(crate::error::DbBootError::capability_unavailable("SSH tunnel", "ssh-tunnel"))
    }
}

#[cfg(feature = "ssh-tunnel")]
pub use ssh::SshTunnelHandle;

#[cfg(feature = "ssh-tunnel")]
mod ssh {
    use super::{SshTunnelService, Tunnel, TunnelOpener};
    use crate::error::{DbBootError, DbResult};
    use crate::models::{SshAuthMethod, TunnelConfig};
    use async_trait::async_trait;
    use russh::client;
    use russh_keys::key::KeyPair;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::runtime::Runtime;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    /// How long `stop` waits for the forwarding task to wind down.
    const STOP_GRACE: Duration = Duration::from_secs(2);

    /// Handle to an active SSH tunnel.
    pub struct SshTunnelHandle {
        bound_host: String,
        bound_port: u16,
        remote: String,
        cancel_token: CancellationToken,
        task: Option<JoinHandle<()>>,
        runtime: Arc<Runtime>,
    }

    impl Tunnel for SshTunnelHandle {
        fn bound_host(&self) -> &str {
            &self.bound_host
        }

        fn bound_port(&self) -> u16 {
            self.bound_port
        }

        fn stop(&mut self) -> DbResult<()> {
            let Some(task) = self.task.take() else {
                return Ok(());
            };
            self.cancel_token.cancel();

            let joined = self.runtime.block_on(tokio::time::timeout(STOP_GRACE, task));
            tracing::info!(
                local = %format!("{}:{}", self.bound_host, self.bound_port),
                remote = %self.remote,
                "SSH tunnel stopped"
            );
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DbBootError::ssh(format!("SSH tunnel task failed: {e}"))),
                Err(_) => Err(DbBootError::ssh("Timed out waiting for the SSH tunnel to stop")),
            }
        }
    }

    impl Drop for SshTunnelHandle {
        fn drop(&mut self) {
            self.cancel_token.cancel();
        }
    }

    /// SSH client handler for russh.
    struct SshClientHandler;

    #[async_trait]
    impl client::Handler for SshClientHandler {
        type Error = russh::Error;

        async fn check_server_key(
            &mut self,
            _server_public_key: &russh_keys::key::PublicKey,
        ) -> Result<bool, Self::Error> {
            // TODO: verify against known_hosts once a host key path is configurable
            Ok(true)
        }
    }

    impl TunnelOpener for SshTunnelService {
        fn open(&self, config: &TunnelConfig) -> DbResult<Box<dyn Tunnel>> {
            let runtime = self.runtime.get()?;
            let handle = runtime.block_on(establish(config, Arc::clone(&runtime)))?;
            Ok(Box::new(handle))
        }
    }

    async fn establish(config: &TunnelConfig, runtime: Arc<Runtime>) -> DbResult<SshTunnelHandle> {
        tracing::info!(
            ssh_host = %config.ssh_host,
            ssh_port = config.ssh_port,
            auth = config.auth.as_str(),
            "Establishing SSH tunnel"
        );

        let ssh_client = connect_ssh(config).await?;
        let ssh_client = Arc::new(Mutex::new(ssh_client));

        let listener =
            TcpListener::bind((config.local_bind_host.as_str(), config.local_bind_port))
                .await
                .map_err(|e| {
                    DbBootError::ssh_with_hint(
                        format!("Failed to bind local port for SSH tunnel: {e}"),
                        "Use a different local port or 0 to let the system choose one",
                    )
                })?;
        let bound_port = listener.local_addr()?.port();
        let remote = format!("{}:{}", config.remote_host, config.remote_port);

        tracing::info!(
            local = %format!("{}:{}", config.local_bind_host, bound_port),
            remote = %remote,
            "SSH tunnel listening"
        );

        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(run_tunnel(
            listener,
            ssh_client,
            config.remote_host.clone(),
            config.remote_port,
            cancel_token.clone(),
        ));

        Ok(SshTunnelHandle {
            bound_host: config.local_bind_host.clone(),
            bound_port,
            remote,
            cancel_token,
            task: Some(task),
            runtime,
        })
    }

    fn client_config(config: &TunnelConfig) -> client::Config {
        let mut ssh_config = client::Config::default();
        for (key, value) in &config.extra {
            let seconds = value.parse::<u64>().ok().map(Duration::from_secs);
            match (key.as_str(), seconds) {
                ("keepalive_interval", Some(interval)) => {
                    ssh_config.keepalive_interval = Some(interval)
                }
                ("inactivity_timeout", Some(timeout)) => {
                    ssh_config.inactivity_timeout = Some(timeout)
                }
                _ => tracing::warn!(option = %key, value = %value, "Ignoring SSH tunnel option"),
            }
        }
        ssh_config
    }

    async fn connect_ssh(config: &TunnelConfig) -> DbResult<client::Handle<SshClientHandler>> {
        let ssh_config = Arc::new(client_config(config));

        let mut handle =
            client::connect(ssh_config, (config.ssh_host.as_str(), config.ssh_port), SshClientHandler)
                .await
                .map_err(|e| {
                    DbBootError::ssh_with_hint(
                        format!("Failed to connect to SSH server: {e}"),
                        "Verify the SSH server is running and reachable",
                    )
                })?;

        let authenticated = match &config.auth {
            SshAuthMethod::Password { password } => handle
                .authenticate_password(config.username.as_str(), password.as_str())
                .await
                .map_err(|e| {
                    DbBootError::ssh_with_hint(
                        format!("SSH password authentication failed: {e}"),
                        "Check your SSH username and password",
                    )
                })?,
            SshAuthMethod::KeyFile { path, passphrase } => {
                let key = load_private_key(path, passphrase.as_deref()).await?;
                handle.authenticate_publickey(config.username.as_str(), key).await.map_err(
                    |e| {
                        DbBootError::ssh_with_hint(
                            format!("SSH key authentication failed: {e}"),
                            "Verify your SSH key is valid and has the correct permissions",
                        )
                    },
                )?
            }
            SshAuthMethod::Agent => authenticate_with_agent(&mut handle, &config.username).await?,
        };

        if !authenticated {
            return Err(DbBootError::ssh_with_hint(
                "SSH authentication failed",
                "Check your credentials and try again",
            ));
        }

        tracing::info!(user = %config.username, ssh_host = %config.ssh_host, "SSH authentication successful");
        Ok(handle)
    }

    async fn load_private_key(path: &Path, passphrase: Option<&str>) -> DbResult<Arc<KeyPair>> {
        let key_data = tokio::fs::read(path).await.map_err(|e| {
            DbBootError::ssh_with_hint(
                format!("Failed to read SSH key file {}: {e}", path.display()),
                "Check that the key file exists and is readable",
            )
        })?;

        let key = russh_keys::decode_secret_key(&String::from_utf8_lossy(&key_data), passphrase)
            .map_err(|e| match passphrase {
                Some(_) => DbBootError::ssh_with_hint(
                    format!("Failed to decrypt SSH key: {e}"),
                    "Check your key passphrase is correct",
                ),
                None => DbBootError::ssh_with_hint(
                    format!("Failed to parse SSH key: {e}"),
                    "The key may be encrypted - provide the passphrase",
                ),
            })?;

        Ok(Arc::new(key))
    }

    #[cfg(unix)]
    async fn authenticate_with_agent(
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> DbResult<bool> {
        use russh_keys::agent::client::AgentClient;
        use tokio::net::UnixStream;

        let socket_path = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
            DbBootError::ssh_with_hint(
                "SSH agent not available (SSH_AUTH_SOCK not set)",
                "Start your SSH agent with: eval $(ssh-agent)",
            )
        })?;

        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            DbBootError::ssh_with_hint(
                format!("Failed to connect to SSH agent: {e}"),
                "Ensure your SSH agent is running",
            )
        })?;

        let mut agent = AgentClient::connect(stream);
        let identities = agent.request_identities().await.map_err(|e| {
            DbBootError::ssh_with_hint(
                format!("Failed to get identities from SSH agent: {e}"),
                "Ensure your SSH agent is running and has keys loaded",
            )
        })?;

        if identities.is_empty() {
            return Err(DbBootError::ssh_with_hint(
                "No identities available in SSH agent",
                "Add your SSH key to the agent with: ssh-add",
            ));
        }

        tracing::debug!(count = identities.len(), "Found SSH agent identities");

        for identity in identities {
            let (returned_agent, auth_result) =
                handle.authenticate_future(username, identity.clone(), agent).await;
            agent = returned_agent;
            match auth_result {
                Ok(true) => return Ok(true),
                Ok(false) => tracing::debug!("SSH agent key rejected, trying next"),
                Err(e) => tracing::debug!(error = %e, "SSH agent auth error, trying next"),
            }
        }

        Ok(false)
    }

    #[cfg(not(unix))]
    async fn authenticate_with_agent(
        _handle: &mut client::Handle<SshClientHandler>,
        _username: &str,
    ) -> DbResult<bool> {
        Err(DbBootError::ssh_with_hint(
            "SSH agent authentication is only supported on Unix",
            "Use password or key file authentication",
        ))
    }

    async fn run_tunnel(
        listener: TcpListener,
        ssh_client: Arc<Mutex<client::Handle<SshClientHandler>>>,
        remote_host: String,
        remote_port: u16,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((local_stream, peer_addr)) => {
                            tracing::debug!(peer = %peer_addr, "New tunnel connection");

                            let ssh_client = ssh_client.clone();
                            let remote_host = remote_host.clone();
                            let cancel = cancel_token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = forward_connection(
                                    local_stream,
                                    ssh_client,
                                    &remote_host,
                                    remote_port,
                                    cancel,
                                )
                                .await
                                {
                                    tracing::warn!(error = %e, "Tunnel forwarding error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept tunnel connection");
                        }
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }

        let handle = ssh_client.lock().await;
        if let Err(e) =
            handle.disconnect(russh::Disconnect::ByApplication, "tunnel stopped", "en").await
        {
            tracing::debug!(error = %e, "SSH disconnect failed");
        }
    }

    async fn forward_connection(
        mut local_stream: TcpStream,
        ssh_client: Arc<Mutex<client::Handle<SshClientHandler>>>,
        remote_host: &str,
        remote_port: u16,
        cancel_token: CancellationToken,
    ) -> DbResult<()> {
        let channel = {
            let handle = ssh_client.lock().await;
            handle
                .channel_open_direct_tcpip(remote_host, u32::from(remote_port), "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    DbBootError::ssh_with_hint(
                        format!("Failed to open SSH channel: {e}"),
                        "The SSH server may not allow TCP forwarding",
                    )
                })?
        };

        let mut channel = channel.into_stream();
        let mut buf_local = [0u8; 8192];
        let mut buf_remote = [0u8; 8192];

        loop {
            tokio::select! {
                n = local_stream.read(&mut buf_local) => match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if channel.write_all(&buf_local[..n]).await.is_err() {
                            break;
                        }
                    }
                },
                n = channel.read(&mut buf_remote) => match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if local_stream.write_all(&buf_remote[..n]).await.is_err() {
                            break;
                        }
                    }
                },
                _ = cancel_token.cancelled() => break,
            }
        }

        Ok(())
    }

}
