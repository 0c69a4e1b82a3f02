//! Helper socket transport.
//!
//! Platform-specific addresses:
//! - **Named**: Filesystem socket (macOS, Linux, BSD)
//! - **Abstract**: Linux abstract namespace (no filesystem, auto-cleanup)
//!
//! The launcher binds, passes the address to the helper on its command line,
//! and accepts exactly one connection.

use std::io;
use std::path::PathBuf;

use tokio::net::{UnixListener, UnixStream};

const ABSTRACT_PREFIX: &str = "abstract:";

/// Where the helper connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperAddress {
    Named(PathBuf),
    #[cfg(target_os = "linux")]
    Abstract(String),
}

impl HelperAddress {
    /// Render as a single command-line argument for the helper.
    pub fn to_arg(&self) -> String {
        match self {
            Self::Named(path) => path.display().to_string(),
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => format!("{ABSTRACT_PREFIX}{name}"),
        }
    }

    pub fn parse_arg(arg: &str) -> io::Result<Self> {
        match arg.strip_prefix(ABSTRACT_PREFIX) {
            #[cfg(target_os = "linux")]
            Some(name) => Ok(Self::Abstract(name.to_string())),
            #[cfg(not(target_os = "linux"))]
            Some(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "abstract sockets are only available on Linux",
            )),
            None if arg.is_empty() => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty helper address",
            )),
            None => Ok(Self::Named(PathBuf::from(arg))),
        }
    }
}

impl std::fmt::Display for HelperAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_arg())
    }
}

/// Listening side, owned by the launcher until the helper connects.
pub struct HelperListener {
    address: HelperAddress,
    listener: UnixListener,
    cleanup_dir: Option<PathBuf>,
}

impl HelperListener {
    /// Bind using the platform default (abstract on Linux, named elsewhere).
    pub fn bind() -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            Self::bind_abstract()
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::bind_named()
        }
    }

    /// Socket path format: `{temp_dir}/proclaunch-{pid}-{uuid}/launcher.sock`
    pub fn bind_named() -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let dir = std::env::temp_dir().join(format!(
            "proclaunch-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("launcher.sock");

        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::debug!(transport_type = "named", path = %path.display(), "Bound helper socket");

        Ok(Self {
            address: HelperAddress::Named(path),
            listener,
            cleanup_dir: Some(dir),
        })
    }

    #[cfg(target_os = "linux")]
    pub fn bind_abstract() -> io::Result<Self> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

        let name = format!(
            "proclaunch-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;

        let std_listener = StdUnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::debug!(transport_type = "abstract", name = %name, "Bound helper socket");

        Ok(Self {
            address: HelperAddress::Abstract(name),
            listener,
            cleanup_dir: None,
        })
    }

    pub fn address(&self) -> &HelperAddress {
        &self.address
    }

    /// Accept the helper's connection.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        tracing::trace!(address = %self.address, "Waiting for helper connection");
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!(address = %self.address, "Helper connected");
        Ok(stream)
    }

    fn cleanup(&mut self) -> io::Result<()> {
        if let Some(dir) = self.cleanup_dir.take()
            && dir.exists()
        {
            tracing::debug!(dir = %dir.display(), "Cleaning up socket directory");
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

impl Drop for HelperListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to cleanup socket directory");
        }
    }
}

/// Connect from the helper side.
pub async fn connect(address: &HelperAddress) -> io::Result<UnixStream> {
    match address {
        HelperAddress::Named(path) => {
            tracing::trace!(path = %path.display(), "Connecting to launcher socket");
            UnixStream::connect(path).await
        }
        #[cfg(target_os = "linux")]
        HelperAddress::Abstract(name) => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            tracing::trace!(name = %name, "Connecting to abstract launcher socket");
            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;

            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}
