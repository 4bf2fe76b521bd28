//! Host model of the TWI peripheral and the devices around it.
//!
//! Writing TWCR with TWINT set executes the requested bus operation at once,
//! the way the hardware would after some SCL periods, so a wait on TWINT
//! returns immediately. A peer configured to hang never completes, leaving
//! TWINT low. Remote masters are driven from the test through the
//! `remote_*` methods; [`service`] then runs the interrupt vector if the
//! peripheral would raise it.

use alloc::{
    collections::{BTreeMap, VecDeque},
    vec::Vec,
};
use core::cell::RefCell;

use critical_section::Mutex;

use crate::{
    clock::Prescaler,
    controller::BusController,
    interrupts::handle_twi_interrupt,
    status::StatusCode,
    twi::{Twar, Twcr, Twi},
};

/// What the simulated peripheral put on the bus as master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    Start,
    RepeatedStart,
    /// SLA+R/W byte.
    Address(u8),
    Stop,
}

/// Outcome forced on the next START request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFault {
    ArbitrationLost,
    AddressedAsSlave { general_call: bool },
    AddressedForRead,
    BusError,
}

/// A slave device on the simulated bus.
#[derive(Debug, Clone, Default)]
pub struct SimPeer {
    pub ignores_address: bool,
    /// Bytes acknowledged by this peer, one entry per write transaction.
    pub sessions: Vec<Vec<u8>>,
    /// Bytes the peer sends when read.
    pub transmit: VecDeque<u8>,
    /// ACK (true) or NACK the master returned for each byte read.
    pub acks_seen: Vec<bool>,
    nack_schedule: VecDeque<usize>,
    hang_after: Option<usize>,
}

impl SimPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transmitting(mut self, bytes: &[u8]) -> Self {
        self.transmit.extend(bytes.iter().copied());
        self
    }

    /// NACKs the byte at `index` of the next write transaction reaching it.
    pub fn nack_write_at(mut self, index: usize) -> Self {
        self.nack_schedule.push_back(index);
        self
    }

    /// Stops responding after `bytes` data bytes of a write.
    pub fn hang_after(mut self, bytes: usize) -> Self {
        self.hang_after = Some(bytes);
        self
    }

    pub fn ignoring_address(mut self) -> Self {
        self.ignores_address = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitAddress,
    /// Bus owned, no peer answered.
    MasterHeld,
    MasterWrite(u8),
    MasterRead(u8),
    SlaveReceive { general_call: bool },
    SlaveTransmit,
    Hung,
}

struct SimState {
    twcr: u8,
    twsr: u8,
    twdr: u8,
    twar: u8,
    twbr: u8,
    phase: Phase,
    owns_bus: bool,
    peers: BTreeMap<u8, SimPeer>,
    start_faults: VecDeque<StartFault>,
    events: Vec<BusEvent>,
}

impl SimState {
    fn control(&self) -> Twcr {
        Twcr::from(self.twcr)
    }

    fn set_status(&mut self, status: StatusCode) {
        self.twsr = (self.twsr & 0x03) | u8::from(status);
    }

    /// Job done: set TWINT.
    fn raise(&mut self, status: StatusCode) {
        self.set_status(status);
        self.twcr |= 0x80;
    }

    fn write_control(&mut self, value: Twcr) {
        let flag = self.control().twint() && !value.twint();
        let mut stored = value;
        stored.set_twint(flag);
        self.twcr = u8::from(stored);

        if !value.twen() {
            self.phase = Phase::Idle;
            self.owns_bus = false;
            return;
        }
        if value.twint() {
            self.execute(value);
        }
    }

    fn execute(&mut self, w: Twcr) {
        if w.twsto() {
            if self.owns_bus {
                self.events.push(BusEvent::Stop);
                self.owns_bus = false;
            }
            self.phase = Phase::Idle;
            self.twcr &= !0x10;
            self.set_status(StatusCode::NoInfo);
            return;
        }

        if w.twsta() {
            if let Some(fault) = self.start_faults.pop_front() {
                self.apply_start_fault(fault);
                return;
            }
            if self.owns_bus {
                self.events.push(BusEvent::RepeatedStart);
                self.phase = Phase::AwaitAddress;
                self.raise(StatusCode::RepeatedStart);
            } else {
                self.events.push(BusEvent::Start);
                self.owns_bus = true;
                self.phase = Phase::AwaitAddress;
                self.raise(StatusCode::Start);
            }
            return;
        }

        match self.phase {
            Phase::AwaitAddress => self.address_phase(),
            Phase::MasterWrite(address) => self.master_write(address),
            Phase::MasterRead(address) => self.master_read(address, w.twea()),
            // Acknowledging an event, or releasing the bus.
            Phase::Idle
            | Phase::MasterHeld
            | Phase::SlaveReceive { .. }
            | Phase::SlaveTransmit
            | Phase::Hung => {}
        }
    }

    fn apply_start_fault(&mut self, fault: StartFault) {
        self.owns_bus = false;
        match fault {
            StartFault::ArbitrationLost => {
                self.phase = Phase::Idle;
                self.raise(StatusCode::ArbitrationLost);
            }
            StartFault::AddressedAsSlave { general_call } => {
                self.phase = Phase::SlaveReceive { general_call };
                self.raise(if general_call {
                    StatusCode::SrArbitrationLostGeneralCallAck
                } else {
                    StatusCode::SrArbitrationLostAddressAck
                });
            }
            StartFault::AddressedForRead => {
                self.phase = Phase::SlaveTransmit;
                self.raise(StatusCode::StArbitrationLostAddressAck);
            }
            StartFault::BusError => {
                self.phase = Phase::Idle;
                self.raise(StatusCode::BusError);
            }
        }
    }

    fn address_phase(&mut self) {
        let sla = self.twdr;
        self.events.push(BusEvent::Address(sla));
        let address = sla >> 1;
        let read = sla & 1 == 1;

        let acked = match self.peers.get_mut(&address) {
            Some(peer) if !peer.ignores_address => {
                if !read {
                    peer.sessions.push(Vec::new());
                }
                true
            }
            _ => false,
        };

        match (acked, read) {
            (true, false) => {
                self.phase = Phase::MasterWrite(address);
                self.raise(StatusCode::MtAddressAck);
            }
            (true, true) => {
                self.phase = Phase::MasterRead(address);
                self.raise(StatusCode::MrAddressAck);
            }
            (false, false) => {
                self.phase = Phase::MasterHeld;
                self.raise(StatusCode::MtAddressNack);
            }
            (false, true) => {
                self.phase = Phase::MasterHeld;
                self.raise(StatusCode::MrAddressNack);
            }
        }
    }

    fn master_write(&mut self, address: u8) {
        let byte = self.twdr;
        let Some(peer) = self.peers.get_mut(&address) else {
            return;
        };
        let index = peer.sessions.last().map_or(0, Vec::len);

        if peer.hang_after == Some(index) {
            self.phase = Phase::Hung;
            return;
        }

        let nack = peer.nack_schedule.front() == Some(&index);
        if nack {
            peer.nack_schedule.pop_front();
            self.raise(StatusCode::MtDataNack);
        } else {
            if let Some(session) = peer.sessions.last_mut() {
                session.push(byte);
            }
            self.raise(StatusCode::MtDataAck);
        }
    }

    fn master_read(&mut self, address: u8, ack: bool) {
        let Some(peer) = self.peers.get_mut(&address) else {
            return;
        };
        let byte = peer.transmit.pop_front().unwrap_or(0xFF);
        peer.acks_seen.push(ack);
        self.twdr = byte;
        self.raise(if ack {
            StatusCode::MrDataAck
        } else {
            StatusCode::MrDataNack
        });
    }

    /// The peripheral only reacts to a remote master once the previous event
    /// was acknowledged.
    fn ready_for_remote(&self) -> bool {
        let c = self.control();
        c.twen() && !c.twint()
    }
}

pub struct SimulatedTwi {
    core_clock: u32,
    state: Mutex<RefCell<SimState>>,
}

impl SimulatedTwi {
    pub const fn new(core_clock: u32) -> Self {
        Self {
            core_clock,
            state: Mutex::new(RefCell::new(SimState {
                twcr: 0,
                twsr: 0xF8,
                twdr: 0xFF,
                twar: 0xFE,
                twbr: 0,
                phase: Phase::Idle,
                owns_bus: false,
                peers: BTreeMap::new(),
                start_faults: VecDeque::new(),
                events: Vec::new(),
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    pub fn attach_peer(&self, address: u8, peer: SimPeer) {
        self.with(|s| {
            s.peers.insert(address, peer);
        });
    }

    /// Snapshot of a peer.
    pub fn peer(&self, address: u8) -> Option<SimPeer> {
        self.with(|s| s.peers.get(&address).cloned())
    }

    pub fn queue_start_fault(&self, fault: StartFault) {
        self.with(|s| s.start_faults.push_back(fault));
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.with(|s| s.events.clone())
    }

    pub fn bit_rate(&self) -> (u8, Prescaler) {
        self.with(|s| (s.twbr, Prescaler::from_index(s.twsr)))
    }

    /// TWIE and TWINT are both set: the vector would run now.
    pub fn interrupt_pending(&self) -> bool {
        let c = self.control();
        c.twen() && c.twie() && c.twint()
    }

    /// A remote master sends our SLA+W, or the general call address.
    /// Returns whether the peripheral acknowledged it.
    pub fn remote_address(&self, general_call: bool) -> bool {
        self.with(|s| {
            let c = s.control();
            let twar = Twar::from(s.twar);
            if !s.ready_for_remote() || !c.twea() || (general_call && !twar.twgce()) {
                return false;
            }
            s.phase = Phase::SlaveReceive { general_call };
            s.twdr = if general_call { 0 } else { twar.address() << 1 };
            s.raise(if general_call {
                StatusCode::SrGeneralCallAck
            } else {
                StatusCode::SrAddressAck
            });
            true
        })
    }

    /// A remote master sends one data byte. Returns whether it was ACKed.
    pub fn remote_write_byte(&self, byte: u8) -> bool {
        self.with(|s| {
            let Phase::SlaveReceive { general_call } = s.phase else {
                return false;
            };
            if !s.ready_for_remote() {
                return false;
            }
            let ack = s.control().twea();
            s.twdr = byte;
            let status = match (general_call, ack) {
                (false, true) => StatusCode::SrDataAck,
                (false, false) => StatusCode::SrDataNack,
                (true, true) => StatusCode::SrGeneralCallDataAck,
                (true, false) => StatusCode::SrGeneralCallDataNack,
            };
            if !ack {
                // Not addressed any more after returning NACK.
                s.phase = Phase::Idle;
            }
            s.raise(status);
            ack
        })
    }

    /// A remote master ends its transfer with STOP or repeated START.
    pub fn remote_stop(&self) {
        self.with(|s| {
            if matches!(s.phase, Phase::SlaveReceive { .. }) && s.ready_for_remote() {
                s.phase = Phase::Idle;
                s.raise(StatusCode::SrStopOrRepeatedStart);
            }
        });
    }

    /// A remote master sends our SLA+R.
    pub fn remote_read_request(&self) -> bool {
        self.with(|s| {
            if !s.ready_for_remote() || !s.control().twea() {
                return false;
            }
            s.phase = Phase::SlaveTransmit;
            s.raise(StatusCode::StAddressAck);
            true
        })
    }

    /// A remote master clocks one byte out of TWDR and answers `ack`.
    pub fn remote_read_byte(&self, ack: bool) -> Option<u8> {
        self.with(|s| {
            if s.phase != Phase::SlaveTransmit || !s.ready_for_remote() {
                return None;
            }
            let byte = s.twdr;
            let last = !s.control().twea();
            let status = match (ack, last) {
                (false, _) => StatusCode::StDataNack,
                (true, true) => StatusCode::StLastDataAck,
                (true, false) => StatusCode::StDataAck,
            };
            if !ack || last {
                s.phase = Phase::Idle;
            }
            s.raise(status);
            Some(byte)
        })
    }

    /// Misplaced START or STOP on the bus.
    pub fn remote_bus_error(&self) {
        self.with(|s| {
            s.phase = Phase::Idle;
            s.raise(StatusCode::BusError);
        });
    }
}

impl Twi for SimulatedTwi {
    fn core_clock(&self) -> u32 {
        self.core_clock
    }

    fn control(&self) -> Twcr {
        self.with(|s| s.control())
    }

    fn write_control(&self, value: Twcr) {
        self.with(|s| s.write_control(value));
    }

    fn status(&self) -> u8 {
        self.with(|s| s.twsr)
    }

    fn data(&self) -> u8 {
        self.with(|s| s.twdr)
    }

    fn write_data(&self, byte: u8) {
        self.with(|s| {
            if s.control().twint() {
                s.twdr = byte;
            } else {
                s.twcr |= 0x08;
            }
        });
    }

    fn address(&self) -> Twar {
        self.with(|s| Twar::from(s.twar))
    }

    fn write_address(&self, value: Twar) {
        self.with(|s| s.twar = u8::from(value));
    }

    fn write_bit_rate(&self, divisor: u8, prescaler: Prescaler) {
        self.with(|s| {
            s.twbr = divisor;
            s.twsr = (s.twsr & 0xF8) | prescaler.index();
        });
    }
}

/// Runs the interrupt vector if the peripheral raised it.
pub fn service(bus: &BusController<SimulatedTwi>) -> bool {
    if bus.twi().interrupt_pending() {
        handle_twi_interrupt::<SimulatedTwi, _>(bus);
        true
    } else {
        false
    }
}

/// A remote master writes `data` to this device and ends with STOP.
/// Returns how many bytes were acknowledged.
pub fn remote_write(bus: &BusController<SimulatedTwi>, general_call: bool, data: &[u8]) -> usize {
    let twi = bus.twi();
    if !twi.remote_address(general_call) {
        return 0;
    }
    service(bus);

    let mut acked = 0;
    for &byte in data {
        let ack = twi.remote_write_byte(byte);
        service(bus);
        if !ack {
            return acked;
        }
        acked += 1;
    }

    twi.remote_stop();
    service(bus);
    acked
}
