//! HAProxy runtime API client.
//!
//! The admin socket speaks a newline-delimited text protocol and closes the
//! connection after each response, so every command opens a fresh stream.
//! Failures are detected by substring: `Unknown command` means the running
//! HAProxy is too old for the command, `Error` means it refused it.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SOCKET_TIMEOUT;
use crate::error::AdminSocketError;

#[derive(Debug, Clone)]
pub struct AdminClient {
    socket_path: PathBuf,
    dry_run: bool,
}

impl AdminClient {
    pub fn new(socket_path: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            socket_path: socket_path.into(),
            dry_run,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Send one command and return the accumulated response. The server
    /// half-closes when it is done; a 5 s deadline bounds the read, and
    /// whatever arrived by then is the response.
    pub async fn send(&self, command: &str) -> Result<String, AdminSocketError> {
        if self.dry_run {
            info!(command, "dry run: would send to HAProxy");
            return Ok(String::new());
        }

        let mut stream = timeout(SOCKET_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| AdminSocketError::Timeout(SOCKET_TIMEOUT))??;

        timeout(SOCKET_TIMEOUT, async {
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\n").await
        })
        .await
        .map_err(|_| AdminSocketError::Timeout(SOCKET_TIMEOUT))??;

        let mut response = Vec::new();
        match timeout(SOCKET_TIMEOUT, stream.read_to_end(&mut response)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(AdminSocketError::Io(e)),
            Err(_) => {
                debug!(command, "read deadline expired, keeping accumulated bytes");
            }
        }

        let response = String::from_utf8_lossy(&response).into_owned();
        debug!(command, bytes = response.len(), "HAProxy responded");
        Ok(response)
    }

    /// Startup probe: the admin socket must answer before the monitor
    /// starts publishing configuration.
    pub async fn check(&self) -> Result<(), AdminSocketError> {
        self.send("show info").await.map(|_| ())
    }

    /// Ask HAProxy to reload itself. Best-effort at every call site: the
    /// rendered file stays on disk and the next reconcile retries.
    pub async fn reload(&self) -> Result<(), AdminSocketError> {
        let response = self.send("reload").await?;
        vet("reload", &response)
    }

    /// Load a fresh PEM bundle into the running HAProxy via its certificate
    /// store. Four commands, strictly ordered, each on its own connection;
    /// the first failure aborts the rest.
    pub async fn install_certificate(
        &self,
        bundle_path: &Path,
        canonical: &str,
    ) -> Result<(), AdminSocketError> {
        let bundle = bundle_path.display();
        let commands = [
            "show ssl cert".to_string(),
            format!("new ssl cert {bundle}"),
            format!("set ssl cert {canonical} {bundle}"),
            "commit ssl cert".to_string(),
        ];

        for command in &commands {
            let response = self.send(command).await?;
            vet(command, &response)?;
        }

        if !self.dry_run {
            info!(canonical, bundle = %bundle, "certificate installed into HAProxy");
        }
        Ok(())
    }
}

fn vet(command: &str, response: &str) -> Result<(), AdminSocketError> {
    if response.contains("Unknown command") {
        warn!(command, "HAProxy does not support this command");
        return Err(AdminSocketError::CommandUnsupported {
            command: command.to_string(),
        });
    }
    if response.contains("Error") {
        return Err(AdminSocketError::CommandFailed {
            command: command.to_string(),
            response: response.trim().to_string(),
        });
    }
    Ok(())
}
