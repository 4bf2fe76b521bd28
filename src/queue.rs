use heapless::Deque;

use crate::{
    controller::BusController, transaction::Transaction, twi::Twi, ArbitrationError,
    TransactionError,
};

/// How [`TransmissionQueue::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Drain {
    /// Every transaction has an outcome.
    Complete,
    /// The head transaction lost arbitration to a master addressing us. It is
    /// still pending; call `run` again once the slave exchange is over.
    Yielded,
}

/// The queue is full. Carries the rejected transaction back to the caller.
#[derive(Debug)]
pub struct QueueFull<'a>(pub Transaction<'a>);

impl<'a> QueueFull<'a> {
    pub fn into_inner(self) -> Transaction<'a> {
        self.0
    }
}

/// FIFO of master transactions executed one at a time with bounded retry.
///
/// Entries before the cursor are completed, the rest are pending. Completed
/// entries stay in the queue until [`pop_completed`](Self::pop_completed),
/// so their outcome and data can be inspected in place.
pub struct TransmissionQueue<'a, const N: usize> {
    entries: Deque<Transaction<'a>, N>,
    cursor: usize,
}

impl<'a, const N: usize> TransmissionQueue<'a, N> {
    pub const fn new() -> Self {
        Self {
            entries: Deque::new(),
            cursor: 0,
        }
    }

    pub fn enqueue(&mut self, mut txn: Transaction<'a>) -> Result<(), QueueFull<'a>> {
        txn.restart();
        self.entries.push_back(txn).map_err(QueueFull)
    }

    /// Executes the pending transactions in order, each up to `attempts`
    /// times (at least once). Only retryable failures are attempted again.
    pub fn run<T: Twi>(&mut self, bus: &BusController<T>, attempts: u8) -> Drain {
        let attempts = attempts.max(1);

        for txn in self.entries.iter_mut().skip(self.cursor) {
            let mut attempt = 1;
            let result = loop {
                let result = bus.start_transaction(txn);
                match result {
                    Err(e) if e.is_retryable() && attempt < attempts => {
                        #[cfg(feature = "defmt")]
                        defmt::debug!("twi: retrying after {:?} ({}/{})", e, attempt, attempts);

                        attempt += 1;
                    }
                    _ => break result,
                }
            };

            if result == Err(TransactionError::Arbitration(ArbitrationError::LostWithAddressMatch)) {
                txn.restart();
                return Drain::Yielded;
            }
            self.cursor += 1;
        }

        Drain::Complete
    }

    /// Removes and returns the oldest completed transaction.
    pub fn pop_completed(&mut self) -> Option<Transaction<'a>> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.entries.pop_front()
    }

    pub fn completed(&self) -> impl Iterator<Item = &Transaction<'a>> {
        self.entries.iter().take(self.cursor)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Transaction<'a>> {
        self.entries.iter().skip(self.cursor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }
}

impl<const N: usize> Default for TransmissionQueue<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::DEFAULT_CORE_CLOCK,
        sim::{self, SimPeer, SimulatedTwi, StartFault},
        status::StatusCode,
        BusConfig,
    };

    const PEER: u8 = 0x0F;

    fn bus(config: BusConfig) -> BusController<SimulatedTwi> {
        let bus = BusController::new(SimulatedTwi::new(DEFAULT_CORE_CLOCK));
        bus.initialize(config.with_wait_budget(1_000)).unwrap();
        bus.enable();
        bus
    }

    #[test]
    fn succeeds_on_the_third_attempt() {
        let bus = bus(BusConfig::master(100_000));
        bus.twi()
            .attach_peer(PEER, SimPeer::new().nack_write_at(1).nack_write_at(1));

        let data = [1, 2, 3, 4];
        let mut queue: TransmissionQueue<4> = TransmissionQueue::new();
        queue.enqueue(Transaction::write(PEER, &data)).unwrap();

        assert_eq!(bus.run_queue(&mut queue, 3), Drain::Complete);

        let txn = queue.pop_completed().unwrap();
        assert_eq!(txn.outcome(), Some(Ok(())));
        assert_eq!(txn.bytes_transferred(), 4);
        assert_eq!(txn.status(), StatusCode::Success);
        assert_eq!(
            bus.twi().peer(PEER).unwrap().sessions,
            vec![vec![1], vec![1], vec![1, 2, 3, 4]]
        );
    }

    #[test]
    fn gives_up_after_the_attempt_budget() {
        let bus = bus(BusConfig::master(100_000));
        bus.twi()
            .attach_peer(PEER, SimPeer::new().nack_write_at(1).nack_write_at(1));

        let data = [1, 2, 3, 4];
        let mut queue: TransmissionQueue<4> = TransmissionQueue::new();
        queue.enqueue(Transaction::write(PEER, &data)).unwrap();

        assert_eq!(queue.run(&bus, 2), Drain::Complete);
        let txn = queue.completed().next().unwrap();
        assert_eq!(txn.outcome(), Some(Err(TransactionError::UnexpectedState)));
        assert_eq!(txn.bytes_transferred(), 1);
        assert_eq!(txn.status(), StatusCode::MtDataNack);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let bus = bus(BusConfig::master(100_000));
        bus.twi().attach_peer(PEER, SimPeer::new());

        let mut queue: TransmissionQueue<2> = TransmissionQueue::new();
        queue.enqueue(Transaction::write(PEER, &[9])).unwrap();
        assert_eq!(queue.run(&bus, 0), Drain::Complete);
        assert_eq!(queue.completed().count(), 1);
        assert_eq!(bus.twi().peer(PEER).unwrap().sessions, vec![vec![9]]);
    }

    #[test]
    fn final_errors_are_not_retried() {
        let bus = bus(BusConfig::master(100_000));
        bus.twi().attach_peer(PEER, SimPeer::new().transmitting(&[1, 2]));

        let mut buf = [0u8; 2];
        let mut queue: TransmissionQueue<2> = TransmissionQueue::new();
        queue
            .enqueue(Transaction::read(PEER, &mut buf).terminated_by(0))
            .unwrap();

        assert_eq!(queue.run(&bus, 5), Drain::Complete);
        let txn = queue.pop_completed().unwrap();
        assert_eq!(txn.outcome(), Some(Err(TransactionError::TerminatorNotDetected)));
        assert_eq!(txn.data(), &[1, 2]);
        assert_eq!(bus.twi().peer(PEER).unwrap().acks_seen.len(), 2);
    }

    #[test]
    fn runs_in_fifo_order() {
        let bus = bus(BusConfig::master(100_000));
        bus.twi().attach_peer(PEER, SimPeer::new());

        let data = [[1u8], [2], [3]];
        let mut queue: TransmissionQueue<4> = TransmissionQueue::new();
        for chunk in &data {
            queue.enqueue(Transaction::write(PEER, chunk)).unwrap();
        }
        assert_eq!(queue.pending().count(), 3);

        assert_eq!(queue.run(&bus, 1), Drain::Complete);
        assert_eq!(queue.pending().count(), 0);
        assert_eq!(
            bus.twi().peer(PEER).unwrap().sessions,
            vec![vec![1], vec![2], vec![3]]
        );

        while queue.pop_completed().is_some() {}
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_returns_the_transaction() {
        let mut queue: TransmissionQueue<1> = TransmissionQueue::new();
        queue.enqueue(Transaction::write(PEER, &[1])).unwrap();
        assert!(queue.is_full());

        let rejected = queue.enqueue(Transaction::write(0x10, &[2])).unwrap_err();
        assert_eq!(rejected.into_inner().peer_address, 0x10);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn yields_to_the_slave_path() {
        let bus = bus(BusConfig::multi_master(100_000, 0x21));
        let twi = bus.twi();
        twi.attach_peer(PEER, SimPeer::new());
        twi.queue_start_fault(StartFault::AddressedAsSlave { general_call: false });

        let mut queue: TransmissionQueue<2> = TransmissionQueue::new();
        queue.enqueue(Transaction::write(PEER, &[1])).unwrap();
        queue.enqueue(Transaction::write(PEER, &[2])).unwrap();

        assert_eq!(queue.run(&bus, 3), Drain::Yielded);
        let head = queue.pending().next().unwrap();
        assert_eq!(head.status(), StatusCode::Pending);
        assert!(!head.is_complete());

        // The remote master finishes its write.
        sim::service(&bus);
        assert!(twi.remote_write_byte(0x77));
        sim::service(&bus);
        twi.remote_stop();
        sim::service(&bus);

        assert_eq!(queue.run(&bus, 3), Drain::Complete);
        assert_eq!(twi.peer(PEER).unwrap().sessions, vec![vec![1], vec![2]]);
    }
}
