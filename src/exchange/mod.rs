//! Message-layer bookkeeping shared by the server dispatcher and the client: token and
//! message-id matching, inbound deduplication and Confirmable retransmission.

pub use matcher::{DuplicateDetector, InboundMatch, MessageKey, TokenKey, TokenMatcher};
pub use retransmission_manager::{
    RetransmissionManager, SendFailed, SendReliably, TransmissionParameters,
};

pub mod matcher;
pub mod retransmission_manager;

use crate::msg::{Message, MessageClass, MessageType};

/// Empty Acknowledgement for `message`, used both for separate responses and for ACKing
/// Confirmable responses at the client.
pub fn new_empty_ack(message: &Message) -> Message {
    let mut ack = Message::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = message.header.message_id;
    ack
}

/// Reset for `message`.  Also the reply to a CoAP "ping" (an empty Confirmable).
pub fn new_reset(message: &Message) -> Message {
    let mut reset = Message::new();
    reset.header.set_type(MessageType::Reset);
    reset.header.code = MessageClass::Empty;
    reset.header.message_id = message.header.message_id;
    reset
}
