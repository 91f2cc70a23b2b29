use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::anyhow;

use crate::message::block::{BlockValue, MAX_SIZE_EXPONENT};

/// MAX_LATENCY from RFC 7252 §4.8.2.
const MAX_LATENCY: Duration = Duration::from_secs(100);
const PROCESSING_DELAY: Duration = Duration::from_secs(2);

/// Datagram bytes reserved for header, token and options when deriving a block size from
/// the link MTU.
const MESSAGE_OVERHEAD: u32 = 64;

/// Retransmission policy for Confirmable messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionParameters {
    ack_timeout: Duration,
    ack_random_factor: f32,
    max_retransmit: usize,
}

/// Default values come from the
/// [CoAP RFC](https://datatracker.ietf.org/doc/html/rfc7252#section-4.8).
impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl TransmissionParameters {
    pub fn new(
        ack_timeout: Duration,
        ack_random_factor: f32,
        max_retransmit: usize,
    ) -> anyhow::Result<Self> {
        if ack_random_factor < 1.0 {
            return Err(anyhow!("Invalid ack_random_factor={ack_random_factor}"));
        }
        if ack_timeout.is_zero() {
            return Err(anyhow!("Invalid ack_timeout={ack_timeout:?}"));
        }
        if max_retransmit > 16 {
            return Err(anyhow!("Invalid max_retransmit={max_retransmit}"));
        }
        Ok(Self {
            ack_timeout,
            ack_random_factor,
            max_retransmit,
        })
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn max_retransmit(&self) -> usize {
        self.max_retransmit
    }

    /// Range the initial retransmission timeout is drawn from.
    pub fn ack_timeout_range(&self) -> RangeInclusive<Duration> {
        let timeout_low = self.ack_timeout;
        if self.ack_random_factor != 1.0 {
            let timeout_high = timeout_low.mul_f32(self.ack_random_factor);
            timeout_low..=timeout_high
        } else {
            timeout_low..=timeout_low
        }
    }

    /// Longest time from the first to the last transmission of a Confirmable message.
    pub fn max_transmit_span(&self) -> Duration {
        let doublings = (1u32 << self.max_retransmit) - 1;
        (self.ack_timeout * doublings).mul_f32(self.ack_random_factor)
    }

    /// How long a message ID stays reserved after a Confirmable message is first sent.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + MAX_LATENCY * 2 + PROCESSING_DELAY
    }

    /// How long a Non-confirmable message ID is remembered for duplicate detection.
    pub fn non_lifetime(&self) -> Duration {
        self.max_transmit_span() + MAX_LATENCY
    }
}

/// Tunables for every protocol layer of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub transmission: TransmissionParameters,

    /// MIN_EMPTY_ACK_DELAY: how long a Confirmable request waits for a piggy-backed response
    /// before an empty acknowledgement is sent on its own.
    pub empty_ack_delay: Duration,

    /// Period of the sweep that fires due empty acknowledgements.
    pub ack_sweep_interval: Duration,

    pub exchange_lifetime: Duration,
    pub non_lifetime: Duration,

    /// Largest block size this endpoint sends or accepts, as an exponent (block size is
    /// `2^(exponent + 4)`).
    pub max_block_size_exponent: u8,

    /// Cap on a reassembled Block1 request body.  `None` accepts any size.
    pub max_request_body: Option<usize>,

    /// Block transfers left idle for this long are discarded.
    pub blockwise_lifetime: Duration,

    /// Length of tokens generated for outgoing requests.
    pub token_length: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let transmission = TransmissionParameters::default();
        Self {
            transmission,
            empty_ack_delay: Duration::from_millis(1700),
            ack_sweep_interval: Duration::from_millis(100),
            exchange_lifetime: transmission.exchange_lifetime(),
            non_lifetime: transmission.non_lifetime(),
            max_block_size_exponent: MAX_SIZE_EXPONENT,
            max_request_body: None,
            blockwise_lifetime: transmission.exchange_lifetime(),
            token_length: 4,
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replaces the retransmission policy and the lifetimes derived from it.
    pub fn transmission(mut self, transmission: TransmissionParameters) -> Self {
        self.transmission = transmission;
        self.exchange_lifetime = transmission.exchange_lifetime();
        self.non_lifetime = transmission.non_lifetime();
        self.blockwise_lifetime = transmission.exchange_lifetime();
        self
    }

    pub fn empty_ack_delay(mut self, delay: Duration) -> Self {
        self.empty_ack_delay = delay;
        self
    }

    pub fn ack_sweep_interval(mut self, interval: Duration) -> Self {
        self.ack_sweep_interval = interval;
        self
    }

    pub fn exchange_lifetime(mut self, lifetime: Duration) -> Self {
        self.exchange_lifetime = lifetime;
        self
    }

    pub fn non_lifetime(mut self, lifetime: Duration) -> Self {
        self.non_lifetime = lifetime;
        self
    }

    pub fn max_block_size_exponent(mut self, size_exponent: u8) -> Self {
        self.max_block_size_exponent = size_exponent.min(MAX_SIZE_EXPONENT);
        self
    }

    pub fn max_request_body(mut self, limit: usize) -> Self {
        self.max_request_body = Some(limit);
        self
    }

    pub fn blockwise_lifetime(mut self, lifetime: Duration) -> Self {
        self.blockwise_lifetime = lifetime;
        self
    }

    pub fn token_length(mut self, length: usize) -> Self {
        self.token_length = length.clamp(1, 8);
        self
    }

    /// Lowers the maximum block size so that a block plus message overhead fits within the
    /// link MTU.
    pub fn for_mtu(mut self, mtu: Option<u32>) -> Self {
        if let Some(mtu) = mtu {
            let usable = mtu.saturating_sub(MESSAGE_OVERHEAD) as usize;
            let exponent = BlockValue::exponent_for_size(usable).unwrap_or(0);
            self.max_block_size_exponent = self.max_block_size_exponent.min(exponent);
        }
        self
    }

    pub fn max_block_size(&self) -> usize {
        BlockValue::size_for_exponent(self.max_block_size_exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc_derived_lifetimes() {
        let parameters = TransmissionParameters::default();
        assert_eq!(parameters.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(parameters.exchange_lifetime(), Duration::from_secs(247));
        assert_eq!(parameters.non_lifetime(), Duration::from_secs(145));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(TransmissionParameters::new(Duration::from_secs(2), 0.5, 4).is_err());
        assert!(TransmissionParameters::new(Duration::ZERO, 1.5, 4).is_err());
        assert!(TransmissionParameters::new(Duration::from_secs(1), 1.0, 2).is_ok());
    }

    #[test]
    fn test_timeout_range() {
        let parameters = TransmissionParameters::default();
        assert_eq!(
            parameters.ack_timeout_range(),
            Duration::from_secs(2)..=Duration::from_secs(3)
        );
    }

    #[test]
    fn test_for_mtu() {
        let config = ProtocolConfig::new().for_mtu(Some(1280));
        assert_eq!(config.max_block_size(), 1024);
        let config = ProtocolConfig::new().for_mtu(Some(300));
        assert_eq!(config.max_block_size(), 128);
        let config = ProtocolConfig::new().for_mtu(None);
        assert_eq!(config.max_block_size(), 1024);
    }
}
