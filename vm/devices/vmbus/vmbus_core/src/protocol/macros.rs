// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Defines the message type newtype with a constant for each control message,
/// an enum with a variant for each parsed message, and `VmbusMessage` trait
/// implementations for the message structs.
///
/// The syntax is `number NAME { Struct },*`.
macro_rules! vmbus_messages {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $name:ident { $type:ident }, )* }) => {
        /// The message type value that identifies a vmbus control message.
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
        pub struct $type_name(pub u32);

        impl $type_name {
            $(pub const $name: Self = Self($num);)*
        }

        impl std::fmt::Debug for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match *self {
                    $(Self::$name => f.pad(stringify!($name)),)*
                    Self(n) => write!(f, "{n:#x}"),
                }
            }
        }

        /// A parsed vmbus control message, along with any trailing data.
        #[derive(Debug)]
        pub enum $enum_name<'a> {
            $($type($type, &'a [u8]),)*
        }

        impl<'a> $enum_name<'a> {
            /// Parses a message received from the host.
            pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
                let (header, data) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;

                let message = match header.message_type {
                    $(
                        $type_name::$name => {
                            let (message, remaining) = $type::read_from_prefix(data)
                                .map_err(|_| ParseError::MessageTooSmall(Some(header.message_type)))?;
                            Self::$type(message, remaining)
                        }
                    )*
                    _ => return Err(ParseError::InvalidMessageType(header.message_type)),
                };

                Ok(message)
            }
        }

        $(
            impl VmbusMessage for $type {
                const MESSAGE_TYPE: $type_name = $type_name::$name;
            }

            static_assertions::const_assert!($type::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )*
    };
}
