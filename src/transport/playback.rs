// In-memory transcript player standing in for SSH sessions in tests.
// A transcript maps sent command lines to canned output; anything without a
// canned reply is echoed back with the prompt, which reads as success to the
// paging phase.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Credentials, DeviceSession, SessionFactory};
use crate::error::{DiscoveryError, Result};

pub struct Transcript {
    pub prompt: String,
    outputs: HashMap<String, String>,
    pub sent: Arc<Mutex<Vec<String>>>,
}

impl Transcript {
    pub fn new(prompt: impl Into<String>) -> Transcript {
        Transcript {
            prompt: prompt.into(),
            outputs: HashMap::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Canned reply for a command line
    pub fn on(mut self, command: impl Into<String>, output: impl Into<String>) -> Transcript {
        self.outputs.insert(command.into(), output.into());
        self
    }

    fn reply(&self, command: &str) -> String {
        if command.is_empty() {
            return format!("\r\n{}", self.prompt);
        }
        self.outputs
            .get(command)
            .cloned()
            .unwrap_or_else(|| format!("{}\r\n{}", command, self.prompt))
    }
}

pub struct TranscriptSession {
    transcript: Arc<Transcript>,
    pending: Option<String>,
}

impl DeviceSession for TranscriptSession {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.transcript.sent.lock().push(line.to_string());
        self.pending = Some(self.transcript.reply(line));
        Ok(())
    }

    fn read_until_idle(
        &mut self,
        _prompt: &str,
        _overall: Duration,
        _idle: Duration,
    ) -> Result<String> {
        Ok(self.pending.take().unwrap_or_default())
    }

    fn close(&mut self) {}
}

struct DeviceSim {
    transcript: Arc<Transcript>,
    reachable: bool,
    password: Option<String>,
}

/// Factory over a fixed set of simulated devices keyed by address
#[derive(Default)]
pub struct TranscriptFactory {
    devices: HashMap<String, DeviceSim>,
}

impl TranscriptFactory {
    pub fn new() -> TranscriptFactory {
        TranscriptFactory::default()
    }

    pub fn device(mut self, address: impl Into<String>, transcript: Transcript) -> Self {
        self.devices.insert(
            address.into(),
            DeviceSim {
                transcript: Arc::new(transcript),
                reachable: true,
                password: None,
            },
        );
        self
    }

    /// Device that answers the probe only with the given password
    pub fn device_with_password(
        mut self,
        address: impl Into<String>,
        transcript: Transcript,
        password: impl Into<String>,
    ) -> Self {
        self.devices.insert(
            address.into(),
            DeviceSim {
                transcript: Arc::new(transcript),
                reachable: true,
                password: Some(password.into()),
            },
        );
        self
    }

    /// Address that fails the TCP probe
    pub fn unreachable(mut self, address: impl Into<String>) -> Self {
        self.devices.insert(
            address.into(),
            DeviceSim {
                transcript: Arc::new(Transcript::new("#")),
                reachable: false,
                password: None,
            },
        );
        self
    }

    pub fn transcript(&self, address: &str) -> Option<Arc<Transcript>> {
        self.devices.get(address).map(|d| Arc::clone(&d.transcript))
    }
}

impl SessionFactory for TranscriptFactory {
    fn open(&self, host: &str, credentials: &Credentials) -> Result<Box<dyn DeviceSession>> {
        let sim = self
            .devices
            .get(host)
            .ok_or_else(|| DiscoveryError::Transport {
                host: host.to_string(),
                reason: "no such simulated device".to_string(),
            })?;
        if let Some(expected) = &sim.password {
            if credentials.password != *expected {
                return Err(DiscoveryError::AuthFailure {
                    host: host.to_string(),
                    reason: "simulated rejection".to_string(),
                });
            }
        }
        Ok(Box::new(TranscriptSession {
            transcript: Arc::clone(&sim.transcript),
            pending: None,
        }))
    }

    fn probe(&self, host: &str, _port: u16, _timeout: Duration) -> bool {
        self.devices.get(host).map(|d| d.reachable).unwrap_or(false)
    }
}
