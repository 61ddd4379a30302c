//! SOAP-over-UDP retransmission (Appendix I of the binding spec).
//!
//! Every outbound datagram is sent immediately and then repeated with a
//! randomized, doubling delay: four transmissions total towards the
//! discovery group, two for unicast replies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::context::{WsdContext, WsdTiming};
use crate::multicast::MulticastEndpoint;

/// Outbound datagram path of one role instance on one endpoint
pub struct SoapUdpChannel {
    mep: Arc<MulticastEndpoint>,
    ctx: Arc<WsdContext>,
}

impl SoapUdpChannel {
    pub fn new(mep: Arc<MulticastEndpoint>, ctx: Arc<WsdContext>) -> Self {
        SoapUdpChannel { mep, ctx }
    }

    /// Schedules a datagram for (repeated) transmission.
    ///
    /// Without an explicit destination the endpoint's discovery group is
    /// used. The returned handle completes once all repeats went out; the
    /// monitor awaits it for `Bye` messages during teardown.
    pub fn enqueue(
        &self,
        msg: Vec<u8>,
        addr: Option<SocketAddr>,
        msg_type: Option<&str>,
    ) -> JoinHandle<()> {
        let addr = addr.unwrap_or(self.mep.multicast_address);
        if let Some(msg_type) = msg_type {
            info!(
                "scheduling {} message via {} to {}",
                msg_type, self.mep.interface.name, addr
            );
        }

        let mep = Arc::clone(&self.mep);
        let timing = self.ctx.timing.clone();
        tokio::spawn(async move {
            schedule_datagram(&mep, &timing, msg, addr).await;
        })
    }
}

/// Sends the datagram and its repeats. Send failures are logged and do not
/// stop the remaining repeats.
async fn schedule_datagram(
    mep: &MulticastEndpoint,
    timing: &WsdTiming,
    msg: Vec<u8>,
    addr: SocketAddr,
) {
    let multicast = addr == mep.multicast_address;
    let initial = rand::thread_rng().gen_range(timing.udp_min_delay..=timing.udp_max_delay);

    send_datagram(mep, &msg, addr).await;
    for delay in retransmit_delays(timing, multicast, initial) {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        send_datagram(mep, &msg, addr).await;
    }
}

async fn send_datagram(mep: &MulticastEndpoint, msg: &[u8], addr: SocketAddr) {
    if let Err(e) = mep.send(msg, addr).await {
        error!(
            "error while sending packet on {}: {}",
            mep.interface.name, e
        );
    }
}

/// The sleep intervals between repeats: the initial delay, then doubled
/// values clamped to the upper bound. The initial transmission counts
/// towards the repeat total.
pub fn retransmit_delays(timing: &WsdTiming, multicast: bool, initial_delay: u64) -> Vec<u64> {
    let repeats = if multicast {
        timing.multicast_udp_repeat
    } else {
        timing.unicast_udp_repeat
    };

    let mut delays = Vec::new();
    let mut delay = initial_delay;
    for _ in 1..repeats {
        delays.push(delay);
        delay = (delay * 2).min(timing.udp_upper_delay);
    }
    delays
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_repeat_count() {
        let timing = WsdTiming::default();
        // three repeats after the initial transmission
        assert_eq!(retransmit_delays(&timing, true, 50).len(), 3);
    }

    #[test]
    fn test_unicast_repeat_count() {
        let timing = WsdTiming::default();
        assert_eq!(retransmit_delays(&timing, false, 50).len(), 1);
    }

    #[test]
    fn test_delays_double_and_clamp() {
        let timing = WsdTiming::default();
        let delays = retransmit_delays(&timing, true, 250);
        assert_eq!(delays, vec![250, 500, 500]);

        let delays = retransmit_delays(&timing, true, 50);
        assert_eq!(delays, vec![50, 100, 200]);
    }

    #[test]
    fn test_delays_within_bounds() {
        let timing = WsdTiming::default();
        for initial in [50, 137, 250] {
            for delay in retransmit_delays(&timing, true, initial) {
                assert!((50..=500).contains(&delay));
            }
        }
    }

    #[test]
    fn test_delays_non_decreasing() {
        let timing = WsdTiming::default();
        let delays = retransmit_delays(&timing, true, 113);
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }
}
