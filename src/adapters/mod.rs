//! Boundaries to external collaborators: clocks, the NTP daemon, the PTP
//! wire implementation, PPS sources and the remote monitor.

pub mod clock;
pub mod monitor;
pub mod ntp_client;
pub mod pps;
pub mod ptp_codec;
