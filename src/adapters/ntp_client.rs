//! Semantic client for an external NTP daemon's control interface.
//!
//! Two wire modes exist in the wild: the standardized control protocol and
//! the legacy private/mode-7 protocol. The client starts in the configured
//! mode and falls back to the other one when the daemon rejects an opcode
//! as unsupported, then sticks with whichever worked. The wire codecs
//! themselves live behind [`NtpTransport`]; swapping the transport must not
//! change any behavior above it.

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::domain::state::LeapType;
use crate::domain::timespec::Timespec;

#[derive(Error, Debug)]
pub enum NtpClientError {
    /// The daemon rejected our credentials.
    #[error("authentication rejected")]
    AuthFailed,
    /// The daemon does not implement the requested opcode.
    #[error("opcode not supported")]
    Unsupported,
    /// Response did not parse as the expected structure.
    #[error("malformed response")]
    BadFormat,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NtpClientError {
    /// Errno-style code surfaced to status reporting.
    pub fn errno(&self) -> i32 {
        match self {
            NtpClientError::AuthFailed => libc::EACCES,
            NtpClientError::Unsupported => libc::ENOSYS,
            NtpClientError::BadFormat => libc::EBADMSG,
            NtpClientError::Timeout => libc::ETIMEDOUT,
            NtpClientError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// Standard control protocol (NTP mode 6).
    Control,
    /// Legacy private protocol (NTP mode 7).
    Private,
}

impl WireMode {
    fn other(self) -> Self {
        match self {
            WireMode::Control => WireMode::Private,
            WireMode::Private => WireMode::Control,
        }
    }
}

/// Symmetric key credentials for authenticated requests.
#[derive(Debug, Clone)]
pub struct NtpAuth {
    pub key_id: u32,
    pub key_value: String,
}

#[derive(Debug, Clone)]
pub enum NtpRequest {
    SysInfo,
    PeerInfo,
    ClockControl { enable: bool, auth: Option<NtpAuth> },
    Ping,
}

#[derive(Debug, Clone)]
pub enum NtpResponse {
    SysInfo(NtpSysInfo),
    PeerInfo(Vec<NtpPeerInfo>),
    Ack,
}

/// System variables of the queried daemon.
#[derive(Debug, Clone, Default)]
pub struct NtpSysInfo {
    pub stratum: u8,
    /// Offset of the daemon's clock from its selected peer.
    pub offset: Timespec,
    pub root_delay_ns: f64,
    pub root_dispersion_ns: f64,
    pub leap: LeapType,
    pub ref_id: String,
    /// Whether the daemon is currently disciplining the clock.
    pub clock_control_enabled: bool,
    /// Whether a sync peer is selected at all.
    pub peer_selected: bool,
}

/// One row of the daemon's peer table.
#[derive(Debug, Clone, Default)]
pub struct NtpPeerInfo {
    pub address: String,
    pub stratum: u8,
    pub offset: Timespec,
    pub root_delay_ns: f64,
    pub root_dispersion_ns: f64,
    pub selected: bool,
    pub shortlist: bool,
    pub reachable: bool,
}

/// Wire transport: one request/response exchange in the given mode.
pub trait NtpTransport: Send {
    fn exchange(
        &mut self,
        mode: WireMode,
        request: &NtpRequest,
    ) -> Result<NtpResponse, NtpClientError>;
}

impl NtpTransport for Box<dyn NtpTransport> {
    fn exchange(
        &mut self,
        mode: WireMode,
        request: &NtpRequest,
    ) -> Result<NtpResponse, NtpClientError> {
        (**self).exchange(mode, request)
    }
}

/// Placeholder transport for deployments without a wire backend linked in:
/// every exchange times out, so the module keeps its alarms raised.
pub struct NullTransport;

impl NtpTransport for NullTransport {
    fn exchange(
        &mut self,
        _mode: WireMode,
        _request: &NtpRequest,
    ) -> Result<NtpResponse, NtpClientError> {
        Err(NtpClientError::Timeout)
    }
}

/// Mode-negotiating client over any transport.
pub struct NtpClient<T: NtpTransport> {
    transport: T,
    mode: WireMode,
    fallback_tried: bool,
    auth: Option<NtpAuth>,
}

impl<T: NtpTransport> NtpClient<T> {
    pub fn new(transport: T, mode: WireMode, auth: Option<NtpAuth>) -> Self {
        NtpClient {
            transport,
            mode,
            fallback_tried: false,
            auth,
        }
    }

    pub fn mode(&self) -> WireMode {
        self.mode
    }

    #[instrument(skip(self))]
    pub fn get_sys_info(&mut self) -> Result<NtpSysInfo, NtpClientError> {
        match self.request(&NtpRequest::SysInfo)? {
            NtpResponse::SysInfo(info) => Ok(info),
            _ => Err(NtpClientError::BadFormat),
        }
    }

    #[instrument(skip(self))]
    pub fn get_peer_info(&mut self) -> Result<Vec<NtpPeerInfo>, NtpClientError> {
        match self.request(&NtpRequest::PeerInfo)? {
            NtpResponse::PeerInfo(peers) => Ok(peers),
            _ => Err(NtpClientError::BadFormat),
        }
    }

    /// Enable or disable the daemon's own clock discipline. Requires
    /// credentials when the daemon is configured for authentication.
    #[instrument(skip(self))]
    pub fn clock_control(&mut self, enable: bool) -> Result<(), NtpClientError> {
        let request = NtpRequest::ClockControl {
            enable,
            auth: self.auth.clone(),
        };
        match self.request(&request)? {
            NtpResponse::Ack => Ok(()),
            _ => Err(NtpClientError::BadFormat),
        }
    }

    pub fn test_connection(&mut self) -> Result<(), NtpClientError> {
        match self.request(&NtpRequest::Ping)? {
            NtpResponse::Ack => Ok(()),
            _ => Err(NtpClientError::BadFormat),
        }
    }

    fn request(&mut self, request: &NtpRequest) -> Result<NtpResponse, NtpClientError> {
        match self.transport.exchange(self.mode, request) {
            Err(NtpClientError::Unsupported) if !self.fallback_tried => {
                let fallback = self.mode.other();
                warn!(?fallback, "daemon rejected opcode, falling back");
                self.fallback_tried = true;
                let result = self.transport.exchange(fallback, request);
                if result.is_ok() {
                    debug!(?fallback, "wire mode switched");
                    self.mode = fallback;
                }
                result
            }
            other => other,
        }
    }
}
