//! The legacy RTCOPY wire protocol: fixed-layout binary messages exchanged
//! with the tape mover (rtcpd) and the media-changer daemon.
//!
//! A message is a 12-byte header (`magic`, `reqtype`, `len_or_status`, all
//! big-endian u32) followed by a body whose shape is determined by `reqtype`.
//! Strings on the wire are null-terminated and not padded.

pub mod codec;
pub mod header;
pub mod messages;

/// Magic number written on every outgoing message.
pub const RTCOPY_MAGIC: u32 = 0x120D_0301;

/// Legacy magic number still accepted on incoming messages. Old movers and
/// the job submission path use this value.
pub const RTCOPY_MAGIC_OLD0: u32 = 0x0000_0200;

/// Magic number of the media-changer daemon protocol.
pub const RMC_MAGIC: u32 = 0x120D_0410;

/// Fixed size of the mover-facing message buffer. No message, header
/// included, may exceed this.
pub const RTCP_MSGBUFSIZ: usize = 4096;

/// Maximum length of a host name field, terminator excluded.
pub const CA_MAXHOSTNAMELEN: usize = 63;
/// Maximum length of a user name field, terminator excluded.
pub const CA_MAXUSRNAMELEN: usize = 14;
/// Maximum length of a device group name, terminator excluded.
pub const CA_MAXDGNLEN: usize = 6;
/// Maximum length of a drive unit name, terminator excluded.
pub const CA_MAXUNMLEN: usize = 8;
/// Maximum length of a volume id, terminator excluded.
pub const CA_MAXVIDLEN: usize = 6;
/// Maximum length of a tape path, terminator excluded.
pub const CA_MAXPATHLEN: usize = 1023;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Request types of the mover-facing protocol.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ReqType {
    RtcpTapeReq = 1,
    RtcpFileReq = 2,
    RtcpNoMoreReq = 3,
    RtcpTapeErrReq = 4,
    RtcpFileErrReq = 5,
    RtcpEndOfReq = 6,
    RtcpAbortReq = 7,
    RtcpDumpReq = 8,
    RtcpDumpTapeReq = 9,
    RtcpKillJidReq = 10,
    RtcpRslctReq = 11,
    RtcpPingReq = 12,
    RtcpHasMoreWork = 13,
    /// Request information sent by the mover on its initial callback
    /// connection.
    RtcpInfoReq = 14,
}

/// Request type of the job submission request / reply, shared with the drive
/// queue manager's message catalogue and therefore outside the [`ReqType`]
/// numbering.
pub const VDQM_CLIENTINFO: u32 = 0x1007;
