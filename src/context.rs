//! Process-wide state shared by both WSD roles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Config;

/// Maximum number of recently seen MessageIDs kept for duplicate detection
pub const WSD_MAX_KNOWN_MESSAGES: usize = 10;

/// SOAP-over-UDP transmission constants and other timing knobs.
///
/// Kept adjustable so tests can run the retransmission and probe paths
/// without real-time delays.
#[derive(Debug, Clone)]
pub struct WsdTiming {
    pub multicast_udp_repeat: u32,
    pub unicast_udp_repeat: u32,
    /// Lower bound of the initial retransmit delay in milliseconds
    pub udp_min_delay: u64,
    /// Upper bound of the initial retransmit delay in milliseconds
    pub udp_max_delay: u64,
    /// Clamp for doubled retransmit delays in milliseconds
    pub udp_upper_delay: u64,
    /// Maximum random delay before the client's first probe, in seconds
    pub max_startup_probe_delay: u64,
    /// Metadata HTTP exchange timeout
    pub metadata_timeout: Duration,
}

impl Default for WsdTiming {
    fn default() -> Self {
        WsdTiming {
            multicast_udp_repeat: 4,
            unicast_udp_repeat: 2,
            udp_min_delay: 50,
            udp_max_delay: 250,
            udp_upper_delay: 500,
            max_startup_probe_delay: 3,
            metadata_timeout: Duration::from_secs(2),
        }
    }
}

impl WsdTiming {
    /// Timing with all delays zeroed, for tests
    pub fn immediate() -> Self {
        WsdTiming {
            udp_min_delay: 0,
            udp_max_delay: 0,
            udp_upper_delay: 0,
            max_startup_probe_delay: 0,
            ..WsdTiming::default()
        }
    }
}

/// AppSequence state of the host role.
///
/// `InstanceId` is fixed at startup, `MessageNumber` grows by one for every
/// outgoing host message.
#[derive(Debug)]
pub struct HostSequence {
    instance_id: u64,
    message_number: AtomicU64,
}

impl HostSequence {
    pub fn new() -> Self {
        let instance_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        HostSequence {
            instance_id,
            message_number: AtomicU64::new(0),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Returns the current message number and advances the counter
    pub fn next_message_number(&self) -> u64 {
        self.message_number.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HostSequence {
    fn default() -> Self {
        HostSequence::new()
    }
}

/// Bounded window of recently seen MessageIDs.
///
/// Implements SOAP-over-UDP Appendix II item 2: a datagram whose MessageID
/// is still in the window is dropped.
#[derive(Debug, Default)]
pub struct MessageDedup {
    known: Mutex<VecDeque<String>>,
}

impl MessageDedup {
    pub fn new() -> Self {
        MessageDedup {
            known: Mutex::new(VecDeque::with_capacity(WSD_MAX_KNOWN_MESSAGES)),
        }
    }

    /// Checks whether the id was seen recently and records it otherwise
    pub fn is_duplicate(&self, message_id: &str) -> bool {
        let mut known = self.known.lock().expect("dedup lock poisoned");
        if known.iter().any(|id| id == message_id) {
            return true;
        }

        if known.len() == WSD_MAX_KNOWN_MESSAGES {
            known.pop_front();
        }
        known.push_back(message_id.to_string());
        false
    }
}

/// Identity and shared state of this daemon instance
#[derive(Debug)]
pub struct WsdContext {
    pub config: Arc<Config>,
    /// Canonical device UUID
    pub device_uuid: uuid::Uuid,
    /// Device URN (`urn:uuid:...`)
    pub urn: String,
    pub sequence: HostSequence,
    pub dedup: MessageDedup,
    pub timing: WsdTiming,
}

impl WsdContext {
    pub fn new(config: Arc<Config>) -> Self {
        let device_uuid = config.device_uuid();
        WsdContext {
            config,
            device_uuid,
            urn: format!("{}", device_uuid.urn()),
            sequence: HostSequence::new(),
            dedup: MessageDedup::new(),
            timing: WsdTiming::default(),
        }
    }

    /// Context with immediate timing, for tests
    pub fn with_timing(config: Arc<Config>, timing: WsdTiming) -> Self {
        WsdContext {
            timing,
            ..WsdContext::new(config)
        }
    }
}
