// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the vmbus control messages exchanged through the
//! hypervisor's message port.

use crate::Guid;
use bitfield_struct::bitfield;
use std::ops::Deref;
use std::ops::DerefMut;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[macro_use]
mod macros;

pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_UNSUCCESSFUL: i32 = 0x8000ffff_u32 as i32;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();

/// The payload size of a single hypervisor message.
pub const MAX_MESSAGE_SIZE: usize = 240;

vmbus_messages! {
    pub enum Message, MessageType {
        1 OFFER_CHANNEL { OfferChannel },
        2 RESCIND_CHANNEL_OFFER { RescindChannelOffer },
        3 REQUEST_OFFERS { RequestOffers },
        4 ALL_OFFERS_DELIVERED { AllOffersDelivered },
        5 OPEN_CHANNEL { OpenChannel },
        6 OPEN_CHANNEL_RESULT { OpenResult },
        7 CLOSE_CHANNEL { CloseChannel },
        8 GPADL_HEADER { GpadlHeader },
        9 GPADL_BODY { GpadlBody },
        10 GPADL_CREATED { GpadlCreated },
        11 GPADL_TEARDOWN { GpadlTeardown },
        12 GPADL_TORNDOWN { GpadlTorndown },
        13 REL_ID_RELEASED { RelIdReleased },
    }
}

/// An error that occurred while parsing a vmbus control message.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The message was smaller than required for the message type.
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    /// The message type is not one the guest understands.
    #[error("unexpected message type: {0:?}")]
    InvalidMessageType(MessageType),
}

/// Trait implemented on all control message structs by `vmbus_messages!`.
pub trait VmbusMessage: Sized {
    /// The corresponding message type for the struct.
    const MESSAGE_TYPE: MessageType;

    /// The size of the message, including the message header.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

/// The header of a vmbus control message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    /// Creates a new `MessageHeader` for the specified message type.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

/// A guest-allocated GPADL handle.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct GpadlId(pub u32);

impl std::fmt::Display for GpadlId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A host-assigned channel id (also called relid).
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// User-defined data provided by a device as part of an offer or open request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct UserDefinedData([u8; 120]);

impl Deref for UserDefinedData {
    type Target = [u8; 120];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UserDefinedData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<[u8; 120]> for UserDefinedData {
    fn from(value: [u8; 120]) -> Self {
        Self(value)
    }
}

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OfferChannel {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub rsvd: [u32; 4],
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub mmio_megabytes_optional: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    pub monitor_allocated: u8,
    pub is_dedicated: u16,
    pub connection_id: u32,
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OfferFlags {
    pub enumerate_device_interface: bool, // 0x1
    /// Indicates the channel must use an encrypted ring buffer on a hardware-isolated VM.
    pub confidential_ring_buffer: bool, // 0x2
    /// Indicates the channel must use encrypted additional GPADLs on a
    /// hardware-isolated VM.
    pub confidential_external_memory: bool, // 0x4
    #[bits(1)]
    _reserved1: u16,
    pub named_pipe_mode: bool, // 0x10
    #[bits(11)]
    _reserved2: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

/// The first message of a GPADL registration. Followed by `len` bytes of
/// range data (a `GpaRange` header and page numbers per range), as much as
/// fits in one message; the rest is sent in `GpadlBody` messages.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub len: u16,
    pub count: u16,
}

impl GpadlHeader {
    /// The maximum number of 64 bit values that fit after the message data.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlBody {
    pub rsvd: u32,
    pub gpadl_id: GpadlId,
}

impl GpadlBody {
    /// The maximum number of 64 bit values that fit after the message data.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: i32,
}

/// Requests that the host open a channel.
///
/// `ring_buffer_gpadl_id` describes the guest-to-host ring. When both rings
/// share one GPADL, the host-to-guest ring starts
/// `downstream_ring_buffer_page_offset` pages into it and
/// `downstream_ring_buffer_gpadl_id` is zero; otherwise the host-to-guest ring
/// has its own GPADL and the page offset is zero.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
    pub downstream_ring_buffer_gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RelIdReleased {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}

// Empty messages, so that every message can go through `VmbusMessage`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RequestOffers {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct AllOffersDelivered {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_sizes() {
        assert_eq!(OfferChannel::MESSAGE_SIZE, 196);
        assert_eq!(OpenChannel::MESSAGE_SIZE, 152);
        assert_eq!(GpadlHeader::MAX_DATA_VALUES, 27);
        assert_eq!(GpadlBody::MAX_DATA_VALUES, 28);
    }

    #[test]
    fn test_parse() {
        let mut data = Vec::new();
        data.extend_from_slice(MessageHeader::new(MessageType::GPADL_CREATED).as_bytes());
        data.extend_from_slice(
            GpadlCreated {
                channel_id: ChannelId(3),
                gpadl_id: GpadlId(0xe1e10),
                status: STATUS_SUCCESS,
            }
            .as_bytes(),
        );

        match Message::parse(&data).unwrap() {
            Message::GpadlCreated(msg, rest) => {
                assert_eq!(msg.gpadl_id, GpadlId(0xe1e10));
                assert_eq!(msg.channel_id, ChannelId(3));
                assert!(rest.is_empty());
            }
            msg => panic!("unexpected message {msg:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Message::parse(&[1, 0, 0]),
            Err(ParseError::MessageTooSmall(None))
        ));

        let header = MessageHeader::new(MessageType::OPEN_CHANNEL_RESULT);
        assert!(matches!(
            Message::parse(header.as_bytes()),
            Err(ParseError::MessageTooSmall(Some(
                MessageType::OPEN_CHANNEL_RESULT
            )))
        ));

        let header = MessageHeader::new(MessageType(99));
        assert!(matches!(
            Message::parse(header.as_bytes()),
            Err(ParseError::InvalidMessageType(MessageType(99)))
        ));
    }

    #[test]
    fn test_message_type_debug() {
        assert_eq!(format!("{:?}", MessageType::GPADL_BODY), "GPADL_BODY");
        assert_eq!(format!("{:?}", MessageType(0x40)), "0x40");
    }
}
