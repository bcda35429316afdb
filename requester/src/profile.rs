use std::time::Duration;

/// Retransmission schedule applied to an outstanding STUN request.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetransmitProfile {
    /// RFC 5389 7.2.1: 500 ms initial RTO, doubling, capped at 1600 ms,
    /// 7 requests total.
    #[default]
    Udp,
    /// Shortened schedule for ICE connectivity checks: same initial RTO,
    /// capped at 800 ms, 4 requests total.
    IceCheck,
    /// Single request over a stream transport; the transport owns
    /// retransmission and only the RFC 5389 overall deadline applies.
    Tcp,
}

impl RetransmitProfile {
    pub(crate) fn initial_interval(&self) -> Duration {
        match self {
            RetransmitProfile::Udp | RetransmitProfile::IceCheck => Duration::from_millis(500),
            // 7.2.2: Ti = 39.5s
            RetransmitProfile::Tcp => Duration::from_millis(39_500),
        }
    }

    pub(crate) fn max_interval(&self) -> Duration {
        match self {
            RetransmitProfile::Udp => Duration::from_millis(1600),
            RetransmitProfile::IceCheck => Duration::from_millis(800),
            RetransmitProfile::Tcp => Duration::from_millis(39_500),
        }
    }

    pub(crate) fn max_sends(&self) -> u16 {
        match self {
            RetransmitProfile::Udp => 7,
            RetransmitProfile::IceCheck => 4,
            RetransmitProfile::Tcp => 1,
        }
    }
}
