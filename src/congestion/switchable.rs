use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use quinn::congestion::{BbrConfig, Controller, ControllerFactory, CubicConfig};
use quinn_proto::RttEstimator;

use super::{BrutalController, CongestionChoice};

struct CongestionSlot {
    generation: AtomicU64,
    choice: Mutex<Option<CongestionChoice>>,
    brutal_debug: bool,
}

/// Installs the congestion controller of one connection after it was accepted.
#[derive(Clone)]
pub struct CongestionHandle {
    slot: Arc<CongestionSlot>,
}

impl CongestionHandle {
    pub fn install(&self, choice: CongestionChoice) {
        *self.slot.choice.lock() = Some(choice);
        self.slot.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn installed(&self) -> Option<CongestionChoice> {
        *self.slot.choice.lock()
    }
}

impl std::fmt::Debug for CongestionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CongestionHandle")
            .field("installed", &self.installed())
            .finish()
    }
}

/// Controller factory for a single connection.
///
/// Connections start with cubic and switch to the installed controller on the next
/// packet sent or acknowledged after [`CongestionHandle::install`].
pub struct SwitchableControllerFactory {
    slot: Arc<CongestionSlot>,
}

impl SwitchableControllerFactory {
    pub fn new(brutal_debug: bool) -> (Arc<Self>, CongestionHandle) {
        let slot = Arc::new(CongestionSlot {
            generation: AtomicU64::new(0),
            choice: Mutex::new(None),
            brutal_debug,
        });
        let handle = CongestionHandle { slot: slot.clone() };
        (Arc::new(Self { slot }), handle)
    }
}

impl ControllerFactory for SwitchableControllerFactory {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(SwitchableController {
            slot: self.slot.clone(),
            generation: 0,
            mtu: current_mtu,
            inner: Arc::new(CubicConfig::default()).build(now, current_mtu),
        })
    }
}

fn build_controller(
    choice: CongestionChoice,
    now: Instant,
    current_mtu: u16,
    brutal_debug: bool,
) -> Box<dyn Controller> {
    match choice {
        CongestionChoice::Brutal { rate } => {
            Box::new(BrutalController::new(rate, now, current_mtu, brutal_debug))
        }
        CongestionChoice::Bbr { initial_window } => {
            let mut config = BbrConfig::default();
            config.initial_window(initial_window.saturating_mul(current_mtu as u64));
            Arc::new(config).build(now, current_mtu)
        }
    }
}

struct SwitchableController {
    slot: Arc<CongestionSlot>,
    generation: u64,
    mtu: u16,
    inner: Box<dyn Controller>,
}

impl SwitchableController {
    fn refresh(&mut self, now: Instant) {
        let generation = self.slot.generation.load(Ordering::Acquire);
        if generation == self.generation {
            return;
        }
        self.generation = generation;
        if let Some(choice) = *self.slot.choice.lock() {
            self.inner = build_controller(choice, now, self.mtu, self.slot.brutal_debug);
        }
    }
}

impl Controller for SwitchableController {
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {
        self.refresh(now);
        self.inner.on_sent(now, bytes, last_packet_number);
    }

    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.refresh(now);
        self.inner.on_ack(now, sent, bytes, app_limited, rtt);
    }

    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
        self.inner
            .on_end_acks(now, in_flight, app_limited, largest_packet_num_acked);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        self.inner
            .on_congestion_event(now, sent, is_persistent_congestion, lost_bytes);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = new_mtu;
        self.inner.on_mtu_update(new_mtu);
    }

    fn window(&self) -> u64 {
        self.inner.window()
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(SwitchableController {
            slot: self.slot.clone(),
            generation: self.generation,
            mtu: self.mtu,
            inner: self.inner.clone_box(),
        })
    }

    fn initial_window(&self) -> u64 {
        self.inner.initial_window()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
