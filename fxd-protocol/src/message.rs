//! Control messages exchanged over the daemon's seqpacket socket. One
//! message per packet, fixed-size Pod structs tagged by magic. The open
//! reply additionally carries three fds as SCM_RIGHTS ancillary data.

use bytemuck::{Pod, Zeroable};

use crate::types::stats::SessionStats;
use crate::types::{AudioConfig, Magic, ResultCode, TransportDescriptor};
use crate::MAX_PARAM_VALUE;

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(C)]
pub struct MessageHeader {
    pub magic: Magic,
    pub flags: u32,
}

impl MessageHeader {
    pub fn new(magic: Magic) -> Self {
        MessageHeader { magic, flags: 0 }
    }
}

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct OpenRequest {
    pub header: MessageHeader,
    pub effect_type: u32,
    pub padding: u32,
    pub config: AudioConfig,
}

/// Start, stop, close, queryState and queryStats all carry a bare session
/// id; the magic tells them apart.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct SessionRequest {
    pub header: MessageHeader,
    pub session_id: u32,
    pub padding: u32,
}

impl SessionRequest {
    pub fn new(magic: Magic, session_id: u32) -> Self {
        SessionRequest {
            header: MessageHeader::new(magic),
            session_id,
            padding: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct SetParamRequest {
    pub header: MessageHeader,
    pub session_id: u32,
    pub key: u32,
    pub value_len: u32,
    pub padding: u32,
    pub value: [u8; MAX_PARAM_VALUE],
}

impl SetParamRequest {
    /// Returns `None` if `value` exceeds the inline limit.
    pub fn new(session_id: u32, key: u32, value: &[u8]) -> Option<Self> {
        if value.len() > MAX_PARAM_VALUE {
            return None;
        }
        let mut request = SetParamRequest {
            header: MessageHeader::new(Magic::SET_PARAM),
            session_id,
            key,
            value_len: value.len() as u32,
            padding: 0,
            value: [0; MAX_PARAM_VALUE],
        };
        request.value[..value.len()].copy_from_slice(value);
        Some(request)
    }

    pub fn value(&self) -> &[u8] {
        let len = (self.value_len as usize).min(MAX_PARAM_VALUE);
        &self.value[..len]
    }
}

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct OpenReply {
    pub header: MessageHeader,
    pub result: ResultCode,
    pub session_id: u32,
    pub descriptor: TransportDescriptor,
}

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct SimpleReply {
    pub header: MessageHeader,
    pub result: ResultCode,
    pub padding: u32,
}

impl SimpleReply {
    pub fn new(result: ResultCode) -> Self {
        SimpleReply {
            header: MessageHeader::new(Magic::REPLY),
            result,
            padding: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct StateReply {
    pub header: MessageHeader,
    pub result: ResultCode,
    pub state: u32,
}

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct StatsReply {
    pub header: MessageHeader,
    pub result: ResultCode,
    pub padding: u32,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Copy)]
pub enum Request {
    Open(OpenRequest),
    Start(SessionRequest),
    Stop(SessionRequest),
    Close(SessionRequest),
    SetParam(SetParamRequest),
    QueryState(SessionRequest),
    QueryStats(SessionRequest),
}

#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Open(OpenReply),
    Simple(SimpleReply),
    State(StateReply),
    Stats(StatsReply),
}

fn peek_magic(bytes: &[u8]) -> Option<Magic> {
    let header: MessageHeader =
        read(bytes.get(..core::mem::size_of::<MessageHeader>())?)?;
    Some(header.magic)
}

fn read<T: Pod>(bytes: &[u8]) -> Option<T> {
    bytemuck::try_pod_read_unaligned(bytes).ok()
}

pub fn parse_request(bytes: &[u8]) -> Option<Request> {
    match peek_magic(bytes)? {
        Magic::OPEN => Some(Request::Open(read(bytes)?)),
        Magic::START => Some(Request::Start(read(bytes)?)),
        Magic::STOP => Some(Request::Stop(read(bytes)?)),
        Magic::CLOSE => Some(Request::Close(read(bytes)?)),
        Magic::SET_PARAM => Some(Request::SetParam(read(bytes)?)),
        Magic::QUERY_STATE => Some(Request::QueryState(read(bytes)?)),
        Magic::QUERY_STATS => Some(Request::QueryStats(read(bytes)?)),
        _ => None,
    }
}

pub fn parse_reply(bytes: &[u8]) -> Option<Reply> {
    match peek_magic(bytes)? {
        Magic::OPEN_REPLY => Some(Reply::Open(read(bytes)?)),
        Magic::REPLY => Some(Reply::Simple(read(bytes)?)),
        Magic::STATE_REPLY => Some(Reply::State(read(bytes)?)),
        Magic::STATS_REPLY => Some(Reply::Stats(read(bytes)?)),
        _ => None,
    }
}
