//! Framed request/answer exchange over a transport, with one retry pass.

use super::task::Reply;
use crate::codec::{self, Scan, SequenceCounter};
use crate::error::{PumpError, Result};
use crate::transport::Transport;
use std::time::{Duration, Instant};

pub(crate) struct BusLink {
    transport: Box<dyn Transport>,
    sequence: SequenceCounter,
    timeout: Duration,
    retries: u8,
    rx: Vec<u8>,
}

impl BusLink {
    pub fn new(transport: Box<dyn Transport>, timeout: Duration, retries: u8) -> Self {
        BusLink {
            transport,
            sequence: SequenceCounter::new(),
            timeout,
            retries,
            rx: Vec::with_capacity(64),
        }
    }

    pub fn name(&self) -> String {
        self.transport.name()
    }

    /// Send `payload` to `address` and wait for the answer.
    ///
    /// Broadcasts are written once and return `None`. Individual requests are
    /// repeated with the retry bit set until `retries` is exhausted.
    pub fn transact(&mut self, address: u8, payload: &[u8]) -> Result<Option<Reply>> {
        let counter = self.sequence.next(address);

        if codec::is_broadcast(address) {
            let frame = codec::encode_request(address, codec::sequence_byte(counter, false), payload);
            self.send(&frame)?;
            return Ok(None);
        }

        let mut last_error = None;
        for attempt in 0..=self.retries {
            let seq = codec::sequence_byte(counter, attempt > 0);
            let frame = codec::encode_request(address, seq, payload);
            self.send(&frame)?;
            match self.receive() {
                Ok(reply) => return Ok(Some(reply)),
                Err(e @ PumpError::BusFraming(_)) | Err(e @ PumpError::BusTimeout { .. }) => {
                    log::debug!(
                        "BUS: attempt {} to {:#04x} failed: {}",
                        attempt + 1,
                        address,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = last_error {
            log::debug!("BUS: giving up on {:#04x} after {}", address, e);
        }
        Err(PumpError::BusTimeout { address })
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.rx.clear();
        self.transport.clear_input()?;
        log::trace!("BUS TX: {}", codec::hex(frame));
        self.transport.write(frame)?;
        self.transport.flush()
    }

    fn receive(&mut self) -> Result<Reply> {
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; 64];
        loop {
            match codec::scan_frame(&self.rx) {
                Scan::Complete { frame, consumed } => {
                    log::trace!("BUS RX: {}", codec::hex(&self.rx[..consumed]));
                    self.rx.drain(..consumed);
                    return Ok(Reply {
                        status: frame.status(),
                        payload: frame.payload,
                    });
                }
                Scan::Invalid { reason, consumed } => {
                    self.rx.drain(..consumed);
                    return Err(PumpError::BusFraming(reason));
                }
                Scan::Incomplete => {}
            }
            if Instant::now() >= deadline {
                return Err(if self.rx.is_empty() {
                    PumpError::BusTimeout { address: 0 }
                } else {
                    PumpError::BusFraming("missing ETX".to_string())
                });
            }
            let n = self.transport.read(&mut chunk)?;
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedBus;

    fn link(bus: &SimulatedBus) -> BusLink {
        BusLink::new(Box::new(bus.clone()), Duration::from_millis(20), 1)
    }

    #[test]
    fn transact_reads_answer() {
        let bus = SimulatedBus::new().with_syringe(1);
        bus.set_position(1, 1234);
        let reply = link(&bus).transact(0x31, b"?").unwrap().unwrap();
        assert_eq!(reply.numeric(), Some(1234));
    }

    #[test]
    fn retry_recovers_from_lost_answer() {
        let bus = SimulatedBus::new().with_syringe(1);
        bus.drop_answers(1);
        let reply = link(&bus).transact(0x31, b"&").unwrap().unwrap();
        assert!(reply.text().starts_with("PSD"));
        let frames = bus.received();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn retry_recovers_from_bad_checksum() {
        let bus = SimulatedBus::new().with_syringe(1);
        bus.corrupt_answers(1);
        assert!(link(&bus).transact(0x31, b"?").unwrap().is_some());
    }

    #[test]
    fn exhausted_retries_time_out() {
        let bus = SimulatedBus::new().with_syringe(1);
        bus.drop_answers(2);
        assert!(matches!(
            link(&bus).transact(0x31, b"?"),
            Err(PumpError::BusTimeout { address: 0x31 })
        ));
    }

    #[test]
    fn broadcast_does_not_wait() {
        let bus = SimulatedBus::new().with_syringe(1).with_syringe(2);
        assert!(link(&bus).transact(0x41, b"T").unwrap().is_none());
        assert_eq!(bus.received(), vec![(0x41, "T".to_string())]);
    }
}
