use alloc::boxed::Box;
use core::cell::{Cell, RefCell};

use atomic::{Atomic, Ordering};
use critical_section::{CriticalSection, Mutex};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel};

use crate::{
    clock,
    interrupts::InterruptBridge,
    master::MasterEngine,
    queue::{Drain, TransmissionQueue},
    slave::{ReceivedStream, ReceiverState, SlaveReceiver, Step},
    status::{self, StatusCode, StatusLog},
    transaction::{Termination, Transaction},
    twi::{Twar, Twi},
    ArbitrationError, BusConfig, BusStateError, ConfigError, ReceiveFault, Role, TransactionError,
    TransactionResult, MAX_OWN_ADDRESS, MIN_OWN_ADDRESS,
};

pub const STATUS_HISTORY_SIZE: usize = 8;

#[cfg(feature = "dump")]
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusDump {
    /// Oldest first, padded with `NoInfo` at the front.
    pub status_history: [StatusCode; STATUS_HISTORY_SIZE],
    pub current_status: StatusCode,
    pub receiver_state: ReceiverState,
    pub last_fault: Option<ReceiveFault>,
}

/// Single-consumer hand-off of received streams to an async task.
pub type ReceiveChannel<const SZ: usize> =
    channel::Channel<CriticalSectionRawMutex, ReceivedStream, SZ>;

/// Subscriber that pushes every received stream into `channel`. Streams are
/// dropped while the channel is full.
pub fn forward_to<const SZ: usize>(
    channel: &'static ReceiveChannel<SZ>,
) -> impl FnMut(ReceivedStream) + Send + 'static {
    move |stream| {
        if channel.try_send(stream).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("twi: receive channel full, stream dropped");
        }
    }
}

type Subscriber = Box<dyn FnMut(ReceivedStream) + Send>;

struct SubscriberSlot {
    callback: Option<Subscriber>,
    /// Bumped on every (un)subscribe, so a callback that replaced itself is
    /// not put back.
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::NoUninit)]
#[repr(u8)]
enum Gate {
    Free,
    Busy,
}

/// One TWI peripheral used as master, slave or both.
///
/// Foreground code drives master transactions; the `TWI` interrupt handler
/// must call [`handle_twi_interrupt`](crate::handle_twi_interrupt) with the
/// same controller.
pub struct BusController<T: Twi> {
    twi: T,
    config: Mutex<Cell<Option<BusConfig>>>,
    enabled: Atomic<bool>,
    ack_enabled: Atomic<bool>,
    gate: Atomic<Gate>,
    holding_bus: Atomic<bool>,

    receiver: Mutex<RefCell<SlaveReceiver>>,
    subscriber: Mutex<RefCell<SubscriberSlot>>,
    last_fault: Mutex<Cell<Option<ReceiveFault>>>,

    status_log: StatusLog<STATUS_HISTORY_SIZE>,
}

impl<T: Twi> BusController<T> {
    pub const fn new(twi: T) -> Self {
        Self {
            twi,
            config: Mutex::new(Cell::new(None)),
            enabled: Atomic::new(false),
            ack_enabled: Atomic::new(false),
            gate: Atomic::new(Gate::Free),
            holding_bus: Atomic::new(false),
            receiver: Mutex::new(RefCell::new(SlaveReceiver::new())),
            subscriber: Mutex::new(RefCell::new(SubscriberSlot {
                callback: None,
                generation: 0,
            })),
            last_fault: Mutex::new(Cell::new(None)),
            status_log: StatusLog::new(),
        }
    }

    /// Validates `config` and programs the peripheral. The peripheral stays
    /// disabled until [`enable`](Self::enable).
    pub fn initialize(&self, config: BusConfig) -> Result<(), ConfigError> {
        let bit_rate = if config.role.can_master() {
            Some(clock::compute(self.twi.core_clock(), config.frequency)?)
        } else {
            None
        };

        if config.role.can_slave()
            && !(MIN_OWN_ADDRESS..=MAX_OWN_ADDRESS).contains(&config.own_address)
        {
            return Err(ConfigError::InvalidAddress);
        }

        critical_section::with(|cs| {
            if let Some((divisor, prescaler)) = bit_rate {
                self.twi.write_bit_rate(divisor, prescaler);
            }

            let twar = if config.role.can_slave() {
                Twar::with_address(config.own_address, config.recognize_general_call)
            } else {
                Twar::from(0u8)
            };
            self.twi.write_address(twar);

            let enabled = self.enabled.load(Ordering::SeqCst);
            self.twi.modify_control(|w| {
                w.set_twen(enabled);
                w.set_twea(true);
                w.set_twie(config.role.can_slave());
                w.set_twsta(false);
                w.set_twsto(false);
            });

            self.receiver.borrow_ref_mut(cs).reset();
            self.config.borrow(cs).set(Some(config));
            self.ack_enabled.store(true, Ordering::SeqCst);
            self.holding_bus.store(false, Ordering::SeqCst);
        });

        #[cfg(feature = "defmt")]
        defmt::debug!("twi: initialized {:?}", config);

        Ok(())
    }

    pub fn enable(&self) {
        critical_section::with(|_| {
            self.twi.modify_control(|w| w.set_twen(true));
            self.enabled.store(true, Ordering::SeqCst);
        });
    }

    /// Turns the peripheral off. A stream being received is dropped.
    pub fn disable(&self) {
        let abandoned = critical_section::with(|cs| {
            self.twi.modify_control(|w| w.set_twen(false));
            self.enabled.store(false, Ordering::SeqCst);
            self.holding_bus.store(false, Ordering::SeqCst);
            self.receiver.borrow_ref_mut(cs).reset()
        });

        if let Some(fault) = abandoned {
            self.fail(fault);
        }
    }

    pub fn enable_acknowledge(&self) {
        self.set_acknowledge(true);
    }

    /// Stops answering own address, general call and data bytes as slave.
    pub fn disable_acknowledge(&self) {
        self.set_acknowledge(false);
    }

    fn set_acknowledge(&self, on: bool) {
        critical_section::with(|_| {
            self.twi.modify_control(|w| w.set_twea(on));
            self.ack_enabled.store(on, Ordering::SeqCst);
        });
    }

    /// Does nothing before initialization or for a pure master.
    pub fn set_general_call_recognition(&self, on: bool) {
        let Some(config) = self.config() else {
            return;
        };
        if !config.role.can_slave() {
            return;
        }

        critical_section::with(|_| {
            let mut twar = self.twi.address();
            twar.set_twgce(on);
            self.twi.write_address(twar);
        });
    }

    /// Runs `txn` as bus master and blocks until it is done.
    ///
    /// The outcome is also recorded on the transaction. A transaction built
    /// with [`without_stop`](Transaction::without_stop) keeps the bus, and
    /// the next one starts with a repeated START.
    pub fn start_transaction(&self, txn: &mut Transaction) -> TransactionResult {
        let config = match self.check_preconditions(txn) {
            Ok(config) => config,
            Err(e) => {
                txn.restart();
                txn.status = match e {
                    TransactionError::BusState(BusStateError::BusDisabled) => {
                        StatusCode::BusDisabled
                    }
                    TransactionError::BusState(BusStateError::AckDisabled) => {
                        StatusCode::AckDisabled
                    }
                    _ => StatusCode::Pending,
                };
                return txn.finish(Err(e));
            }
        };

        if let Err(e) = self.acquire(config.wait_budget) {
            txn.restart();
            return txn.finish(Err(e));
        }

        let rearm = config.role.can_slave();
        let mut engine = MasterEngine::new(&self.twi, &self.status_log, config.wait_budget);
        let result = engine.execute(txn);

        critical_section::with(|_| {
            let held = engine.conclude(&result, txn.send_stop_after, rearm);
            self.holding_bus.store(held, Ordering::SeqCst);
            self.gate.store(Gate::Free, Ordering::Release);
        });

        txn.finish(result)
    }

    fn check_preconditions(&self, txn: &Transaction) -> Result<BusConfig, TransactionError> {
        let config = self.config().ok_or(BusStateError::NotInitialized)?;

        if !self.is_enabled() {
            return Err(BusStateError::BusDisabled.into());
        }
        if !self.is_acknowledge_enabled() {
            return Err(BusStateError::AckDisabled.into());
        }
        if config.role == Role::Slave {
            return Err(BusStateError::RoleViolation.into());
        }
        if let Termination::FixedLength(n) = txn.termination {
            if n as usize > txn.payload.len() {
                return Err(TransactionError::BufferTooShort);
            }
        }

        Ok(config)
    }

    /// Takes the busy gate and masks the TWI interrupt in one step.
    ///
    /// Waits while the slave path owns the peripheral: an unserviced slave
    /// event, or a remote master still writing to us. Once `budget` polls of
    /// that run out, gives up without touching the bus.
    fn acquire(&self, budget: Option<u32>) -> TransactionResult {
        enum Blocker {
            Gate,
            SlavePath,
        }

        let mut budget = budget;
        loop {
            let blocker = critical_section::with(|cs| {
                if self.slave_exchange_in_progress(cs) {
                    return Some(Blocker::SlavePath);
                }
                let taken = self
                    .gate
                    .compare_exchange(Gate::Free, Gate::Busy, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok();
                if taken {
                    self.twi.modify_control(|w| w.set_twie(false));
                    None
                } else {
                    Some(Blocker::Gate)
                }
            });

            match blocker {
                None => return Ok(()),
                // Another foreground caller, it always finishes.
                Some(Blocker::Gate) => {}
                Some(Blocker::SlavePath) => match budget.as_mut() {
                    Some(0) => {
                        #[cfg(feature = "defmt")]
                        defmt::debug!("twi: slave exchange in progress, master yields");

                        return Err(ArbitrationError::LostWithAddressMatch.into());
                    }
                    Some(n) => *n -= 1,
                    None => {}
                },
            }
            core::hint::spin_loop();
        }
    }

    fn slave_exchange_in_progress(&self, cs: CriticalSection) -> bool {
        let event_pending = self.twi.control().twint() && {
            let status = status::decode(self.twi.status());
            status.is_slave_receive() || status.is_slave_transmit() || status == StatusCode::BusError
        };

        event_pending
            || matches!(
                self.receiver.borrow_ref(cs).state(),
                ReceiverState::AddressMatched | ReceiverState::Receiving
            )
    }

    /// Drains `queue` through this controller.
    pub fn run_queue<const N: usize>(
        &self,
        queue: &mut TransmissionQueue<'_, N>,
        attempts: u8,
    ) -> Drain {
        queue.run(self, attempts)
    }

    /// Registers the receiver of finished slave streams, replacing the
    /// previous one. The callback runs in interrupt context.
    pub fn subscribe_on_receive<F>(&self, callback: F)
    where
        F: FnMut(ReceivedStream) + Send + 'static,
    {
        self.replace_subscriber(Some(Box::new(callback)));
    }

    /// Finished streams are dropped until the next subscription.
    pub fn unsubscribe_on_receive(&self) {
        self.replace_subscriber(None);
    }

    fn replace_subscriber(&self, callback: Option<Subscriber>) {
        // The old callback is dropped outside the critical section.
        let _old = critical_section::with(|cs| {
            let mut slot = self.subscriber.borrow_ref_mut(cs);
            slot.generation = slot.generation.wrapping_add(1);
            core::mem::replace(&mut slot.callback, callback)
        });
    }

    /// Last fault of the slave receive path, cleared by reading it.
    pub fn take_receive_fault(&self) -> Option<ReceiveFault> {
        critical_section::with(|cs| self.last_fault.borrow(cs).take())
    }

    pub fn last_status(&self) -> StatusCode {
        self.status_log.last()
    }

    /// Actual SCL frequency after divisor rounding, `None` for a pure slave
    /// or before initialization.
    pub fn bus_frequency(&self) -> Option<u32> {
        let config = self.config()?;
        if !config.role.can_master() {
            return None;
        }

        let core_clock = self.twi.core_clock();
        let (divisor, prescaler) = clock::compute(core_clock, config.frequency).ok()?;
        Some(clock::scl_frequency(core_clock, divisor, prescaler))
    }

    pub fn config(&self) -> Option<BusConfig> {
        critical_section::with(|cs| self.config.borrow(cs).get())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_acknowledge_enabled(&self) -> bool {
        self.ack_enabled.load(Ordering::SeqCst)
    }

    /// A transaction ended without STOP and the bus is still ours.
    pub fn is_holding_bus(&self) -> bool {
        self.holding_bus.load(Ordering::SeqCst)
    }

    pub fn receiver_state(&self) -> ReceiverState {
        critical_section::with(|cs| self.receiver.borrow_ref(cs).state())
    }

    pub fn twi(&self) -> &T {
        &self.twi
    }

    #[cfg(feature = "dump")]
    pub fn dump_state(&self) -> StatusDump {
        StatusDump {
            status_history: self.status_log.snapshot(),
            current_status: self.status_log.last(),
            receiver_state: self.receiver_state(),
            last_fault: critical_section::with(|cs| self.last_fault.borrow(cs).get()),
        }
    }
}

impl<T: Twi> InterruptBridge<T> for BusController<T> {
    fn twi(&self) -> &T {
        &self.twi
    }

    fn record_status(&self, status: StatusCode) {
        self.status_log.record(status);
    }

    fn receiver_step(&self, status: StatusCode, byte: u8) -> Step {
        critical_section::with(|cs| self.receiver.borrow_ref_mut(cs).on_event(status, byte))
    }

    fn reset_receiver(&self) -> Option<ReceiveFault> {
        critical_section::with(|cs| self.receiver.borrow_ref_mut(cs).reset())
    }

    fn deliver(&self, stream: ReceivedStream) {
        // Taken out of the slot so the callback can (un)subscribe.
        let taken = critical_section::with(|cs| {
            let mut slot = self.subscriber.borrow_ref_mut(cs);
            let generation = slot.generation;
            slot.callback.take().map(|callback| (callback, generation))
        });

        let Some((mut callback, generation)) = taken else {
            #[cfg(feature = "defmt")]
            defmt::trace!("twi: no subscriber, {} bytes dropped", stream.len());
            return;
        };

        callback(stream);

        critical_section::with(|cs| {
            let mut slot = self.subscriber.borrow_ref_mut(cs);
            if slot.generation == generation {
                slot.callback = Some(callback);
            }
        });
    }

    fn fail(&self, fault: ReceiveFault) {
        #[cfg(feature = "defmt")]
        defmt::warn!("twi: receive fault {:?}", fault);

        critical_section::with(|cs| self.last_fault.borrow(cs).set(Some(fault)));
    }

    fn ack_enabled(&self) -> bool {
        self.is_acknowledge_enabled()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{
        clock::{Prescaler, DEFAULT_CORE_CLOCK},
        interrupts::IDLE_BYTE,
        sim::{self, BusEvent, SimPeer, SimulatedTwi, StartFault},
    };

    const PEER: u8 = 0x0F;
    const OWN: u8 = 0x21;

    fn bus_with(config: BusConfig) -> BusController<SimulatedTwi> {
        let bus = BusController::new(SimulatedTwi::new(DEFAULT_CORE_CLOCK));
        bus.initialize(config).unwrap();
        bus.enable();
        bus
    }

    fn master() -> BusController<SimulatedTwi> {
        let bus = bus_with(BusConfig::master(100_000).with_wait_budget(1_000));
        bus.twi().attach_peer(PEER, SimPeer::new().transmitting(&[7, 8, 9]));
        bus
    }

    fn collect(bus: &BusController<SimulatedTwi>) -> mpsc::Receiver<ReceivedStream> {
        let (tx, rx) = mpsc::channel();
        bus.subscribe_on_receive(move |stream| {
            let _ = tx.send(stream);
        });
        rx
    }

    #[test]
    fn initialize_validates_before_touching_hardware() {
        let bus = BusController::new(SimulatedTwi::new(DEFAULT_CORE_CLOCK));

        assert_eq!(
            bus.initialize(BusConfig::master(0)),
            Err(ConfigError::InvalidFrequency)
        );
        assert_eq!(
            bus.initialize(BusConfig::slave(0x05)),
            Err(ConfigError::InvalidAddress)
        );
        assert_eq!(
            bus.initialize(BusConfig::multi_master(100_000, 0x78)),
            Err(ConfigError::InvalidAddress)
        );
        assert_eq!(bus.config(), None);
        assert_eq!(bus.twi().bit_rate(), (0, Prescaler::Div1));

        // A pure master ignores the address, a pure slave the frequency.
        assert_eq!(bus.initialize(BusConfig::master(400_000)), Ok(()));
        assert_eq!(bus.twi().bit_rate(), (12, Prescaler::Div1));
        assert_eq!(bus.initialize(BusConfig::slave(OWN)), Ok(()));
        assert_eq!(bus.twi().address().address(), OWN);
        assert!(!bus.is_enabled());
    }

    #[test]
    fn bus_frequency_follows_the_role() {
        let bus = bus_with(BusConfig::master(100_000));
        assert_eq!(bus.bus_frequency(), Some(100_000));

        let bus = bus_with(BusConfig::slave(OWN));
        assert_eq!(bus.bus_frequency(), None);
    }

    #[test]
    fn preconditions_are_checked_in_order() {
        let data = [1, 2, 3, 4];

        let bus = BusController::new(SimulatedTwi::new(DEFAULT_CORE_CLOCK));
        let mut txn = Transaction::write(PEER, &data);
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(BusStateError::NotInitialized.into())
        );

        bus.initialize(BusConfig::master(100_000)).unwrap();
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(BusStateError::BusDisabled.into())
        );
        assert_eq!(txn.status(), StatusCode::BusDisabled);

        bus.enable();
        bus.disable_acknowledge();
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(BusStateError::AckDisabled.into())
        );
        assert_eq!(txn.status(), StatusCode::AckDisabled);
        assert!(txn.is_complete());

        bus.enable_acknowledge();
        let mut txn = Transaction::write(PEER, &data).fixed_length(5);
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(TransactionError::BufferTooShort)
        );

        let slave = bus_with(BusConfig::slave(OWN));
        let mut txn = Transaction::write(PEER, &data);
        assert_eq!(
            slave.start_transaction(&mut txn),
            Err(BusStateError::RoleViolation.into())
        );

        assert!(bus.twi().events().is_empty());
        assert!(slave.twi().events().is_empty());
    }

    #[test]
    fn write_then_read() {
        let bus = master();
        let data = [0xA0, 0xA1];
        let mut buf = [0u8; 3];

        let mut write = Transaction::write(PEER, &data);
        assert_eq!(bus.start_transaction(&mut write), Ok(()));
        let mut read = Transaction::read(PEER, &mut buf);
        assert_eq!(bus.start_transaction(&mut read), Ok(()));

        assert_eq!(read.data(), &[7, 8, 9]);
        assert_eq!(bus.twi().peer(PEER).unwrap().sessions, vec![data.to_vec()]);
        assert_eq!(bus.last_status(), StatusCode::MrDataNack);
        assert!(!bus.is_holding_bus());
    }

    #[test]
    fn bus_is_held_between_chained_transactions() {
        let bus = master();
        let register = [0x01];
        let mut buf = [0u8; 1];

        let mut select = Transaction::write(PEER, &register).without_stop();
        assert_eq!(bus.start_transaction(&mut select), Ok(()));
        assert!(bus.is_holding_bus());

        let mut read = Transaction::read(PEER, &mut buf);
        assert_eq!(bus.start_transaction(&mut read), Ok(()));
        assert!(!bus.is_holding_bus());
        assert_eq!(
            bus.twi().events(),
            vec![
                BusEvent::Start,
                BusEvent::Address(0x1E),
                BusEvent::RepeatedStart,
                BusEvent::Address(0x1F),
                BusEvent::Stop,
            ]
        );
    }

    #[test]
    fn timeout_releases_the_bus() {
        let bus = master();
        bus.twi().attach_peer(0x30, SimPeer::new().hang_after(0));

        let mut txn = Transaction::write(0x30, &[1, 2]);
        assert_eq!(bus.start_transaction(&mut txn), Err(TransactionError::Timeout));
        assert_eq!(bus.twi().events().last(), Some(&BusEvent::Stop));

        let mut txn = Transaction::write(PEER, &[1]);
        assert_eq!(bus.start_transaction(&mut txn), Ok(()));
    }

    #[test]
    fn back_to_back_receives_do_not_bleed() {
        let bus = bus_with(BusConfig::slave(OWN));
        let rx = collect(&bus);

        assert_eq!(sim::remote_write(&bus, false, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]), 10);
        assert_eq!(sim::remote_write(&bus, false, &[0x42]), 1);

        let streams: Vec<ReceivedStream> = rx.try_iter().collect();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(streams[0].stream().capacity(), 10);
        assert_eq!(streams[1].as_slice(), &[0x42]);
        assert_eq!(bus.take_receive_fault(), None);
        assert_eq!(bus.receiver_state(), ReceiverState::Complete);
    }

    #[test]
    fn general_call_recognition_can_be_toggled() {
        let bus = bus_with(BusConfig::slave(OWN).with_general_call(true));
        let rx = collect(&bus);

        assert_eq!(sim::remote_write(&bus, true, &[0x06]), 1);
        let stream = rx.try_recv().unwrap();
        assert!(stream.is_general_call());

        bus.set_general_call_recognition(false);
        assert_eq!(sim::remote_write(&bus, true, &[0x06]), 0);
        assert!(rx.try_recv().is_err());

        // Own address still works.
        assert_eq!(sim::remote_write(&bus, false, &[0x07]), 1);
        assert!(!rx.try_recv().unwrap().is_general_call());
    }

    #[test]
    fn general_call_toggle_is_ignored_for_a_master() {
        let bus = bus_with(BusConfig::master(100_000));
        bus.set_general_call_recognition(true);
        assert!(!bus.twi().address().twgce());
    }

    #[test]
    fn without_subscriber_streams_are_dropped() {
        let bus = bus_with(BusConfig::slave(OWN));
        assert_eq!(sim::remote_write(&bus, false, &[1, 2]), 2);

        let rx = collect(&bus);
        assert_eq!(sim::remote_write(&bus, false, &[3]), 1);
        assert_eq!(rx.try_recv().unwrap().as_slice(), &[3]);

        bus.unsubscribe_on_receive();
        assert_eq!(sim::remote_write(&bus, false, &[4]), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callback_can_unsubscribe_itself() {
        let bus: &'static BusController<SimulatedTwi> =
            Box::leak(Box::new(bus_with(BusConfig::slave(OWN))));
        let (tx, rx) = mpsc::channel();

        bus.subscribe_on_receive(move |stream: ReceivedStream| {
            let _ = tx.send(stream.into_vec());
            bus.unsubscribe_on_receive();
        });

        sim::remote_write(bus, false, &[1]);
        sim::remote_write(bus, false, &[2]);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![vec![1]]);
    }

    #[test]
    fn callback_can_hand_over_to_another() {
        let bus: &'static BusController<SimulatedTwi> =
            Box::leak(Box::new(bus_with(BusConfig::slave(OWN))));
        let (first_tx, first_rx) = mpsc::channel();
        let (second_tx, second_rx) = mpsc::channel();

        bus.subscribe_on_receive(move |stream: ReceivedStream| {
            let _ = first_tx.send(stream.into_vec());
            let second_tx = second_tx.clone();
            bus.subscribe_on_receive(move |stream: ReceivedStream| {
                let _ = second_tx.send(stream.into_vec());
            });
        });

        sim::remote_write(bus, false, &[1]);
        sim::remote_write(bus, false, &[2]);
        sim::remote_write(bus, false, &[3]);
        assert_eq!(first_rx.try_iter().collect::<Vec<_>>(), vec![vec![1]]);
        assert_eq!(second_rx.try_iter().collect::<Vec<_>>(), vec![vec![2], vec![3]]);
    }

    #[test]
    fn new_address_match_abandons_the_open_stream() {
        let bus = bus_with(BusConfig::slave(OWN));
        let rx = collect(&bus);
        let twi = bus.twi();

        assert!(twi.remote_address(false));
        sim::service(&bus);
        assert!(twi.remote_write_byte(0x11));
        sim::service(&bus);

        assert_eq!(sim::remote_write(&bus, false, &[0x22]), 1);
        assert_eq!(bus.take_receive_fault(), Some(ReceiveFault::Abandoned));
        assert_eq!(bus.take_receive_fault(), None);
        let received: Vec<Vec<u8>> = rx.try_iter().map(ReceivedStream::into_vec).collect();
        assert_eq!(received, vec![vec![0x22]]);
    }

    #[test]
    fn disable_drops_the_open_stream() {
        let bus = bus_with(BusConfig::slave(OWN));
        let twi = bus.twi();
        assert!(twi.remote_address(false));
        sim::service(&bus);

        bus.disable();
        assert!(!bus.is_enabled());
        assert_eq!(bus.take_receive_fault(), Some(ReceiveFault::Abandoned));
        assert_eq!(bus.receiver_state(), ReceiverState::Idle);
    }

    #[test]
    fn arbitration_loss_with_address_match_is_served_as_slave() {
        let bus = bus_with(BusConfig::multi_master(100_000, OWN).with_wait_budget(1_000));
        let rx = collect(&bus);
        let twi = bus.twi();
        twi.attach_peer(PEER, SimPeer::new());
        twi.queue_start_fault(StartFault::AddressedAsSlave { general_call: false });

        let mut txn = Transaction::write(PEER, &[1, 2]);
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(ArbitrationError::LostWithAddressMatch.into())
        );
        assert!(twi.interrupt_pending());

        sim::service(&bus);
        assert_eq!(bus.receiver_state(), ReceiverState::AddressMatched);
        assert!(twi.remote_write_byte(0x5A));
        sim::service(&bus);
        twi.remote_stop();
        sim::service(&bus);
        assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x5A]);

        // The master side is usable again.
        assert_eq!(bus.start_transaction(&mut txn), Ok(()));
        assert_eq!(twi.peer(PEER).unwrap().sessions, vec![vec![1, 2]]);
    }

    #[test]
    fn arbitration_loss_to_a_remote_reader_answers_the_idle_byte() {
        let bus = bus_with(BusConfig::multi_master(100_000, OWN).with_wait_budget(1_000));
        let twi = bus.twi();
        twi.attach_peer(PEER, SimPeer::new());
        twi.queue_start_fault(StartFault::AddressedForRead);

        let mut txn = Transaction::write(PEER, &[3]);
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(ArbitrationError::LostWithAddressMatch.into())
        );
        assert!(twi.interrupt_pending());

        sim::service(&bus);
        assert!(!twi.control().twea());
        assert_eq!(twi.remote_read_byte(true), Some(IDLE_BYTE));
        sim::service(&bus);
        assert!(twi.control().twea());
        assert_eq!(bus.last_status(), StatusCode::StLastDataAck);

        assert_eq!(bus.start_transaction(&mut txn), Ok(()));
        assert_eq!(twi.peer(PEER).unwrap().sessions, vec![vec![3]]);
    }

    #[test]
    fn master_waits_out_a_remote_write_to_us() {
        let bus = bus_with(BusConfig::multi_master(100_000, OWN).with_wait_budget(1_000));
        let rx = collect(&bus);
        let twi = bus.twi();
        twi.attach_peer(PEER, SimPeer::new());

        assert!(twi.remote_address(false));
        sim::service(&bus);
        assert!(twi.remote_write_byte(0x11));
        assert!(twi.interrupt_pending());

        // The data byte is still waiting for the vector.
        let mut txn = Transaction::write(PEER, &[1]);
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(ArbitrationError::LostWithAddressMatch.into())
        );
        assert_eq!(txn.status(), StatusCode::Pending);
        assert!(twi.interrupt_pending());
        assert!(twi.events().is_empty());

        // Serviced, but the remote master has not sent STOP yet.
        sim::service(&bus);
        assert_eq!(bus.receiver_state(), ReceiverState::Receiving);
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(ArbitrationError::LostWithAddressMatch.into())
        );
        assert!(twi.control().twie());

        twi.remote_stop();
        sim::service(&bus);
        assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x11]);
        assert_eq!(bus.take_receive_fault(), None);

        assert_eq!(bus.start_transaction(&mut txn), Ok(()));
        assert_eq!(twi.peer(PEER).unwrap().sessions, vec![vec![1]]);
    }

    #[test]
    fn plain_arbitration_loss_keeps_the_slave_path_armed() {
        let bus = bus_with(BusConfig::multi_master(100_000, OWN).with_wait_budget(1_000));
        let rx = collect(&bus);
        bus.twi().queue_start_fault(StartFault::ArbitrationLost);

        let mut txn = Transaction::write(PEER, &[1]);
        assert_eq!(
            bus.start_transaction(&mut txn),
            Err(ArbitrationError::Lost.into())
        );
        assert!(bus.twi().control().twie());
        assert!(!bus.twi().control().twint());

        assert_eq!(sim::remote_write(&bus, false, &[9]), 1);
        assert_eq!(rx.try_recv().unwrap().as_slice(), &[9]);
    }

    #[test]
    fn streams_can_be_forwarded_to_a_channel() {
        static STREAMS: ReceiveChannel<2> = ReceiveChannel::new();

        let bus = bus_with(BusConfig::slave(OWN));
        bus.subscribe_on_receive(forward_to(&STREAMS));

        sim::remote_write(&bus, false, b"ab");
        sim::remote_write(&bus, false, b"cd");
        sim::remote_write(&bus, false, b"ef");

        assert_eq!(STREAMS.try_receive().unwrap().as_slice(), b"ab");
        assert_eq!(STREAMS.try_receive().unwrap().as_slice(), b"cd");
        assert!(STREAMS.try_receive().is_err());
    }

    #[cfg(feature = "dump")]
    #[test]
    fn dump_pads_the_history() {
        let bus = master();
        let mut txn = Transaction::write(PEER, &[1]);
        bus.start_transaction(&mut txn).unwrap();

        let dump = bus.dump_state();
        assert_eq!(
            dump.status_history[STATUS_HISTORY_SIZE - 3..],
            [StatusCode::Start, StatusCode::MtAddressAck, StatusCode::MtDataAck]
        );
        assert_eq!(dump.status_history[0], StatusCode::NoInfo);
        assert_eq!(dump.current_status, StatusCode::MtDataAck);
        assert_eq!(dump.last_fault, None);
    }
}
