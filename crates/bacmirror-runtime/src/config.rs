use bacmirror_core::ObjectId;
use bacmirror_datalink::DEFAULT_PORT;
use std::net::SocketAddr;
use std::time::Duration;

/// Default request priority for writes.
pub const DEFAULT_PRIORITY: u8 = 16;
/// Fallback correlation deadline when no heartbeat interval applies.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-destination send sequencing.
#[derive(Debug, Clone, Copy)]
pub struct SequenceConfig {
    /// Max entries executing concurrently per destination key.
    pub concurrency: usize,
    /// Pause after each entry settles before admitting the next.
    pub delay: Duration,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            delay: Duration::from_millis(50),
        }
    }
}

/// COV lease tick.
#[derive(Debug, Clone, Copy)]
pub struct CovTimerConfig {
    /// Lease length and renewal period.
    pub period: Duration,
}

impl Default for CovTimerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(120),
        }
    }
}

/// Connection-level runtime configuration, handed in by the host.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    pub sequence: SequenceConfig,
    pub cov_timer: CovTimerConfig,
    /// Heartbeat interval; zero disables liveness checks.
    pub status_checks_interval: Duration,
    /// Request priority used by write-property calls.
    pub priority: u8,
    pub ip_match_required: bool,
    pub vendor_id_match_required: bool,
    pub device_id_match_required: bool,
    /// Confirm presence with a unicast Who-Is before initial reads.
    pub unicast_who_is_confirmation: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            sequence: SequenceConfig::default(),
            cov_timer: CovTimerConfig::default(),
            status_checks_interval: Duration::from_secs(30),
            priority: DEFAULT_PRIORITY,
            ip_match_required: false,
            vendor_id_match_required: false,
            device_id_match_required: false,
            unicast_who_is_confirmation: false,
        }
    }
}

impl RuntimeConfig {
    /// The port to bind, falling back to the default when the configured
    /// value is outside the unprivileged range.
    pub fn normalized_port(&self) -> u16 {
        if self.port < 1024 {
            log::warn!(
                "configured port {} outside 1024-65535, falling back to {}",
                self.port,
                DEFAULT_PORT
            );
            DEFAULT_PORT
        } else {
            self.port
        }
    }
}

/// Per-actor configuration: which remote objects one actor mirrors.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// The remote peer this actor talks to.
    pub destination: SocketAddr,
    /// Mirrored object ids, resolved by the host from its metadata.
    pub objects: Vec<ObjectId>,
    /// The remote device object, when known (Who-Is confirmation).
    pub device: Option<ObjectId>,
    /// Expected vendor id (Who-Is confirmation).
    pub vendor_id: Option<u32>,
}

impl DeviceConfig {
    pub fn new(destination: SocketAddr, objects: Vec<ObjectId>) -> Self {
        Self {
            destination,
            objects,
            device: None,
            vendor_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeConfig;
    use bacmirror_datalink::DEFAULT_PORT;

    #[test]
    fn privileged_port_falls_back_to_default() {
        let config = RuntimeConfig {
            port: 80,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.normalized_port(), DEFAULT_PORT);
    }

    #[test]
    fn valid_port_is_kept() {
        let config = RuntimeConfig {
            port: 47999,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.normalized_port(), 47999);
    }
}
