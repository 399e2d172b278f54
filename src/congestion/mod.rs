//! Congestion controller selection and installation.
//!
//! Hysteria2 picks the congestion controller once, when a connection authenticates:
//! either a fixed-rate sender at the bandwidth the client declared, or an adaptive
//! (BBR) sender. quinn fixes the controller factory when a connection is accepted, so
//! every connection is accepted with a [`SwitchableControllerFactory`] and the
//! selected controller is installed afterwards through its [`CongestionHandle`].

mod brutal;
mod switchable;

pub use brutal::BrutalController;
pub use switchable::{CongestionHandle, SwitchableControllerFactory};

/// Default initial window of the adaptive controller, in packets.
pub const DEFAULT_INITIAL_WINDOW_PACKETS: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionChoice {
    /// Fixed-rate sender at `rate` bytes per second.
    Brutal { rate: u64 },
    /// Bandwidth estimating sender seeded with `initial_window` packets.
    Bbr { initial_window: u64 },
}

impl CongestionChoice {
    /// Whether the client should treat the server's rate as an estimate rather than
    /// an enforced cap.
    pub fn is_auto_rate(&self) -> bool {
        matches!(self, CongestionChoice::Bbr { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionDecision {
    /// The server requires a client declared rate and none was given.
    Reject,
    Use(CongestionChoice),
}

/// Inputs to [`select_congestion_control`]. All rates are bytes per second, 0 meaning
/// unspecified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CongestionParams {
    pub server_receive_bps: u64,
    pub server_send_bps: u64,
    pub ignore_client_bandwidth: bool,
    pub client_rx: u64,
    pub initial_window: u64,
}

pub fn select_congestion_control(params: &CongestionParams) -> CongestionDecision {
    let CongestionParams {
        server_receive_bps,
        server_send_bps,
        ignore_client_bandwidth,
        client_rx,
        initial_window,
    } = *params;

    if server_receive_bps > 0 && ignore_client_bandwidth && client_rx == 0 {
        return CongestionDecision::Reject;
    }

    if !(server_receive_bps == 0 && ignore_client_bandwidth) && client_rx > 0 {
        let rate = if server_send_bps > 0 {
            client_rx.min(server_send_bps)
        } else {
            client_rx
        };
        return CongestionDecision::Use(CongestionChoice::Brutal { rate });
    }

    CongestionDecision::Use(CongestionChoice::Bbr { initial_window })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(
        server_receive_bps: u64,
        ignore_client_bandwidth: bool,
        client_rx: u64,
        server_send_bps: u64,
    ) -> CongestionParams {
        CongestionParams {
            server_receive_bps,
            server_send_bps,
            ignore_client_bandwidth,
            client_rx,
            initial_window: DEFAULT_INITIAL_WINDOW_PACKETS,
        }
    }

    const ADAPTIVE: CongestionDecision = CongestionDecision::Use(CongestionChoice::Bbr {
        initial_window: DEFAULT_INITIAL_WINDOW_PACKETS,
    });

    fn brutal(rate: u64) -> CongestionDecision {
        CongestionDecision::Use(CongestionChoice::Brutal { rate })
    }

    #[test]
    fn test_selection_table() {
        let cases = [
            // (server rx, ignore client, client rx, server tx) -> decision
            (params(200_000, true, 0, 0), CongestionDecision::Reject),
            (params(200_000, true, 0, 500_000), CongestionDecision::Reject),
            (params(200_000, true, 300_000, 0), brutal(300_000)),
            (params(200_000, true, 300_000, 100_000), brutal(100_000)),
            (params(200_000, false, 0, 0), ADAPTIVE),
            (params(200_000, false, 300_000, 0), brutal(300_000)),
            (params(0, true, 0, 0), ADAPTIVE),
            // ignoring the client without a server rate always means adaptive
            (params(0, true, 1_000_000, 500_000), ADAPTIVE),
            (params(0, false, 0, 500_000), ADAPTIVE),
            (params(0, false, 1_000_000, 500_000), brutal(500_000)),
            (params(0, false, 1_000_000, 0), brutal(1_000_000)),
            (params(0, false, 400_000, 500_000), brutal(400_000)),
        ];

        for (input, expected) in cases {
            assert_eq!(select_congestion_control(&input), expected, "{input:?}");
        }
    }

    #[test]
    fn test_fixed_rate_never_exceeds_send_cap() {
        for send_cap in [1u64, 1_000, 500_000, 10_000_000] {
            for over in [1u64, 7, 1_000_000] {
                let decision = select_congestion_control(&params(0, false, send_cap + over, send_cap));
                assert_eq!(decision, brutal(send_cap));
            }
        }
    }

    #[test]
    fn test_auto_rate_flag() {
        assert!(CongestionChoice::Bbr { initial_window: 10 }.is_auto_rate());
        assert!(!CongestionChoice::Brutal { rate: 10 }.is_auto_rate());
    }
}
