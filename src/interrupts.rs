use crate::{
    slave::{ReceivedStream, Step},
    status::{self, StatusCode},
    twi::{Twcr, Twi},
    ReceiveFault,
};

/// Byte returned to a remote master that reads from us. Nothing is ever
/// queued for slave transmission.
pub const IDLE_BYTE: u8 = 0xFF;

/// What the interrupt vector needs from the controller.
pub trait InterruptBridge<T: Twi> {
    fn twi(&self) -> &T;

    fn record_status(&self, status: StatusCode);

    /// Feeds one event to the slave receiver.
    fn receiver_step(&self, status: StatusCode, byte: u8) -> Step;

    /// Drops the in-progress stream. Returns a fault if one was open.
    fn reset_receiver(&self) -> Option<ReceiveFault>;

    fn deliver(&self, stream: ReceivedStream);

    fn fail(&self, fault: ReceiveFault);

    fn ack_enabled(&self) -> bool;
}

/// TWI interrupt vector body. Call it from the `TWI` interrupt handler.
pub fn handle_twi_interrupt<T: Twi, B: InterruptBridge<T>>(bridge: &B) {
    let twi = bridge.twi();
    let status = status::decode(twi.status());

    let mut completed = None;
    let mut stop = false;

    let ack = if status.is_slave_receive() {
        bridge.record_status(status);

        let step = bridge.receiver_step(status, twi.data());
        if let Some(fault) = step.fault {
            bridge.fail(fault);
        }
        completed = step.completed;
        step.ack
    } else if status.is_slave_transmit() {
        bridge.record_status(status);

        match status {
            StatusCode::StAddressAck
            | StatusCode::StArbitrationLostAddressAck
            | StatusCode::StDataAck => {
                twi.write_data(IDLE_BYTE);
                // Announce it as the last byte.
                false
            }
            _ => true,
        }
    } else if status == StatusCode::BusError {
        bridge.record_status(status);

        #[cfg(feature = "defmt")]
        defmt::warn!("twi: bus error");

        bridge.reset_receiver();
        bridge.fail(ReceiveFault::BusError);
        // Only the internal hardware is reset, no STOP goes on the bus.
        stop = true;
        true
    } else {
        // Master statuses belong to the foreground engine.
        return;
    };

    let mut w = Twcr::from(0u8);
    w.set_twen(true);
    w.set_twie(true);
    w.set_twea(ack && bridge.ack_enabled());
    w.set_twsto(stop);
    w.set_twint(true);
    twi.write_control(w);

    if let Some(stream) = completed {
        bridge.deliver(stream);
    }
}
