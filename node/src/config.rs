use std::{env, io};

const DEFAULT_HOST: &str = "127.0.0.1";

/// Where a node listens, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    host: String,
    port: u16,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Reads `HOST` (defaults to `127.0.0.1`) and the required `PORT`.
    ///
    /// # Returns
    /// The config or an `io::Error` if `PORT` is missing or not a port number.
    pub fn from_env() -> io::Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = env::var("PORT").map_err(io::Error::other)?;
        Self::parse(host, &port)
    }

    fn parse(host: String, port: &str) -> io::Result<Self> {
        let port = port.parse().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid PORT {port}: {e}"))
        })?;
        Ok(Self { host, port })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
