use std::any::Any;
use std::time::{Duration, Instant};

use log::debug;
use quinn::congestion::Controller;
use quinn_proto::RttEstimator;

const SLOT_COUNT: usize = 5;
const MIN_SAMPLE_COUNT: u64 = 50;
const MIN_ACK_RATE: f64 = 0.8;
const WINDOW_MULTIPLIER: f64 = 2.0;
const MIN_WINDOW_PACKETS: u64 = 10;
const DEBUG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
struct PacketSlot {
    timestamp: u64,
    acked: u64,
    lost: u64,
}

/// Fixed-rate sender.
///
/// The window is sized so the connection keeps `rate` bytes per second in flight
/// regardless of loss: `rate * rtt * 2 / ack_rate`, where the ack rate is measured
/// over the last five seconds and never drops below 0.8.
#[derive(Debug, Clone)]
pub struct BrutalController {
    rate: u64,
    mtu: u16,
    window: u64,
    ack_rate: f64,
    slots: [PacketSlot; SLOT_COUNT],
    epoch: Instant,
    debug: bool,
    last_debug: Option<Instant>,
}

impl BrutalController {
    pub fn new(rate: u64, now: Instant, current_mtu: u16, debug: bool) -> Self {
        let mut controller = Self {
            rate,
            mtu: current_mtu,
            window: 0,
            ack_rate: 1.0,
            slots: [PacketSlot::default(); SLOT_COUNT],
            epoch: now,
            debug,
            last_debug: None,
        };
        controller.window = controller.min_window();
        controller
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn ack_rate(&self) -> f64 {
        self.ack_rate
    }

    fn min_window(&self) -> u64 {
        MIN_WINDOW_PACKETS * self.mtu as u64
    }

    fn slot_mut(&mut self, now: Instant) -> &mut PacketSlot {
        let timestamp = now.saturating_duration_since(self.epoch).as_secs();
        let slot = &mut self.slots[(timestamp % SLOT_COUNT as u64) as usize];
        if slot.timestamp != timestamp {
            *slot = PacketSlot {
                timestamp,
                acked: 0,
                lost: 0,
            };
        }
        slot
    }

    fn update_ack_rate(&mut self, now: Instant) {
        let current = now.saturating_duration_since(self.epoch).as_secs();
        let (acked, lost) = self
            .slots
            .iter()
            .filter(|slot| current.saturating_sub(slot.timestamp) < SLOT_COUNT as u64)
            .fold((0u64, 0u64), |(acked, lost), slot| {
                (acked + slot.acked, lost + slot.lost)
            });

        let total = acked + lost;
        self.ack_rate = if total < MIN_SAMPLE_COUNT {
            1.0
        } else {
            (acked as f64 / total as f64).max(MIN_ACK_RATE)
        };
    }

    fn update_window(&mut self, now: Instant, rtt: Duration) {
        let window = self.rate as f64 * rtt.as_secs_f64() * WINDOW_MULTIPLIER / self.ack_rate;
        self.window = (window as u64).max(self.min_window());

        if self.debug
            && self
                .last_debug
                .is_none_or(|last| now.saturating_duration_since(last) >= DEBUG_INTERVAL)
        {
            self.last_debug = Some(now);
            debug!(
                "brutal: rate={} ack_rate={:.3} window={} rtt={:?}",
                self.rate, self.ack_rate, self.window, rtt
            );
        }
    }
}

impl Controller for BrutalController {
    fn on_ack(
        &mut self,
        now: Instant,
        _sent: Instant,
        _bytes: u64,
        _app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.slot_mut(now).acked += 1;
        self.update_ack_rate(now);
        self.update_window(now, rtt.get());
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        _sent: Instant,
        _is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        let lost_packets = (lost_bytes / self.mtu.max(1) as u64).max(1);
        self.slot_mut(now).lost += lost_packets;
        self.update_ack_rate(now);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = new_mtu;
        self.window = self.window.max(self.min_window());
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        self.min_window()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
