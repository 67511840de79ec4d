// SSH transport layer
//
// The crawler talks to devices through the `DeviceSession` capability
// surface rather than a concrete client, so tests can drive the whole
// pipeline with an in-memory transcript player. The one concrete variant is
// a password-authenticated ssh2 interactive shell: no key lookup, host keys
// accepted through an injectable policy.

use std::fmt;
use std::io::{Read, Write};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{DiscoveryError, Result};

#[cfg(test)]
pub mod playback;

/// Default overall timeout for a single read
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default idle window: a read returns once the channel stays quiet this long
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(2);
/// Polling granularity for non-blocking channel reads
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// TCP reachability probe timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// SSH login material, held in memory only for the duration of a run
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Credentials {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Interactive shell capability set
///
/// `read_until_idle` accumulates channel output and returns when the
/// right-trimmed buffer ends with `prompt`, when no new data arrives for
/// `idle`, or when `overall` elapses. An empty prompt never matches, making
/// the call a pure idle-bounded read (used for prompt detection).
pub trait DeviceSession: Send {
    fn send_line(&mut self, line: &str) -> Result<()>;
    fn read_until_idle(&mut self, prompt: &str, overall: Duration, idle: Duration)
        -> Result<String>;
    fn close(&mut self);
}

/// Opens sessions for the crawler; injectable so tests can substitute
/// transcript players
pub trait SessionFactory: Send + Sync {
    fn open(&self, host: &str, credentials: &Credentials) -> Result<Box<dyn DeviceSession>>;

    /// TCP reachability gate run before any session is attempted
    fn probe(&self, host: &str, port: u16, timeout: Duration) -> bool {
        probe(host, port, timeout)
    }
}

/// Quick TCP connect check; no banner exchange
pub fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

/// Resolve a seed that may be a hostname; literal addresses pass through
pub async fn resolve_seed(host: &str) -> Option<String> {
    if host.parse::<IpAddr>().is_ok() {
        return Some(host.to_string());
    }
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};
    use hickory_resolver::TokioAsyncResolver;

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    match resolver.lookup_ip(host).await {
        Ok(lookup) => lookup.iter().next().map(|ip| ip.to_string()),
        Err(e) => {
            warn!(host, error = %e, "seed resolution failed");
            None
        }
    }
}

/// Host-key acceptance hook; returning false aborts the session
pub type HostKeyPolicy = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Factory producing password-authenticated ssh2 shells
pub struct SshSessionFactory {
    port: u16,
    connect_timeout: Duration,
    host_key_policy: Option<HostKeyPolicy>,
}

impl SshSessionFactory {
    pub fn new(connect_timeout: Duration) -> SshSessionFactory {
        SshSessionFactory {
            port: 22,
            connect_timeout,
            host_key_policy: None,
        }
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> SshSessionFactory {
        self.host_key_policy = Some(policy);
        self
    }
}

impl SessionFactory for SshSessionFactory {
    fn open(&self, host: &str, credentials: &Credentials) -> Result<Box<dyn DeviceSession>> {
        let shell = SshShell::connect(
            host,
            self.port,
            credentials,
            self.connect_timeout,
            self.host_key_policy.as_ref(),
        )?;
        Ok(Box::new(shell))
    }
}

/// Interactive shell over libssh2
pub struct SshShell {
    host: String,
    session: ssh2::Session,
    channel: ssh2::Channel,
}

impl SshShell {
    fn connect(
        host: &str,
        port: u16,
        credentials: &Credentials,
        timeout: Duration,
        host_key_policy: Option<&HostKeyPolicy>,
    ) -> Result<SshShell> {
        let transport_err = |reason: String| DiscoveryError::Transport {
            host: host.to_string(),
            reason,
        };

        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| transport_err(e.to_string()))?;
        let addr = addrs
            .next()
            .ok_or_else(|| transport_err("address resolution yielded nothing".to_string()))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| transport_err(e.to_string()))?;

        let mut session = ssh2::Session::new().map_err(|e| transport_err(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| transport_err(e.to_string()))?;

        if let Some(policy) = host_key_policy {
            if let Some((key, _)) = session.host_key() {
                if !policy(host, key) {
                    return Err(transport_err("host key rejected by policy".to_string()));
                }
            }
        }

        // Password only; never fall back to agent or key files
        session
            .userauth_password(&credentials.username, &credentials.password)
            .map_err(|e| DiscoveryError::AuthFailure {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let mut channel = session
            .channel_session()
            .map_err(|e| transport_err(e.to_string()))?;
        channel
            .request_pty("vt100", None, None)
            .map_err(|e| transport_err(e.to_string()))?;
        channel.shell().map_err(|e| transport_err(e.to_string()))?;

        debug!(host, "interactive shell established");
        Ok(SshShell {
            host: host.to_string(),
            session,
            channel,
        })
    }
}

impl DeviceSession for SshShell {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.session.set_blocking(true);
        let payload = format!("{}\n", line);
        self.channel
            .write_all(payload.as_bytes())
            .and_then(|_| self.channel.flush())
            .map_err(|e| DiscoveryError::Transport {
                host: self.host.clone(),
                reason: e.to_string(),
            })
    }

    fn read_until_idle(
        &mut self,
        prompt: &str,
        overall: Duration,
        idle: Duration,
    ) -> Result<String> {
        let start = Instant::now();
        let mut last_data = Instant::now();
        let mut output = String::new();
        let mut chunk = [0u8; 4096];

        self.session.set_blocking(false);
        let result = loop {
            match self.channel.read(&mut chunk) {
                Ok(0) => {
                    break Err(DiscoveryError::Transport {
                        host: self.host.clone(),
                        reason: "channel closed".to_string(),
                    });
                }
                Ok(n) => {
                    output.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    last_data = Instant::now();
                    if !prompt.is_empty() && output.trim_end().ends_with(prompt) {
                        break Ok(output);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= overall || last_data.elapsed() >= idle {
                        break Ok(output);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    break Err(DiscoveryError::Transport {
                        host: self.host.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        };
        self.session.set_blocking(true);
        result
    }

    fn close(&mut self) {
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
        let _ = self.channel.wait_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe("127.0.0.1", port, Duration::from_millis(500)));
    }

    #[test]
    fn test_probe_closed_port() {
        // Bind then drop to find a port that is very likely closed
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!probe("127.0.0.1", port, Duration::from_millis(200)));
    }

    #[test]
    fn test_probe_bad_host() {
        assert!(!probe("host.invalid.", 22, Duration::from_millis(200)));
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let creds = Credentials::new("admin", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_resolve_seed_literal_ip() {
        assert_eq!(
            resolve_seed("10.1.2.3").await.as_deref(),
            Some("10.1.2.3")
        );
    }
}
