use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::msg::{
    status_code, type_bits, type_from_bits, Header, Message, MessageClass, MessageType,
    ResponseType, MAX_TOKEN_LENGTH,
};

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xff;

/// Failure to decode (or encode) a message.  Every variant maps onto the CoAP response code
/// that a server would use to reject the offending message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is shorter than its header")]
    UnexpectedEof,

    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),

    #[error("invalid token length {0}")]
    InvalidTokenLength(usize),

    #[error("reserved option delta nibble")]
    InvalidOptionDelta,

    #[error("reserved option length nibble")]
    InvalidOptionLength,

    #[error("option number overflows u16")]
    InvalidOptionNumber,

    #[error("option value of {0} bytes is too long to encode")]
    OptionValueTooLong(usize),

    #[error("payload marker with empty payload")]
    EmptyPayload,

    #[error("empty message must not carry a token, options or payload")]
    InvalidEmptyMessage,

    #[error("invalid block option value")]
    InvalidBlockValue,

    #[error("invalid option value: {0}")]
    InvalidOptionValue(String),
}

impl MessageError {
    /// Response code to reject a request that failed with this error.
    pub fn code(&self) -> ResponseType {
        match self {
            MessageError::InvalidBlockValue | MessageError::InvalidOptionValue(_) => {
                ResponseType::BadOption
            }
            _ => ResponseType::BadRequest,
        }
    }

    /// Numeric (single byte) form of [`MessageError::code`], e.g. `0x80` for 4.00.
    pub fn numeric_code(&self) -> u8 {
        status_code(self.code())
    }
}

/// Serializes a message into a single datagram.
pub fn encode(message: &Message) -> Result<Bytes, MessageError> {
    let token = message.get_token();
    if token.len() > MAX_TOKEN_LENGTH {
        return Err(MessageError::InvalidTokenLength(token.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + token.len() + message.payload.len() + 16);
    let header = &message.header;
    buf.put_u8((VERSION << 6) | (type_bits(header.get_type()) << 4) | token.len() as u8);
    buf.put_u8(u8::from(header.code));
    buf.put_u16(header.message_id);
    buf.put_slice(token);

    let mut last_number = 0u16;
    for (number, value) in message.options() {
        let delta = number - last_number;
        last_number = number;

        let (delta_nibble, delta_ext) = split_extended(usize::from(delta))?;
        let (length_nibble, length_ext) = split_extended(value.len())?;
        buf.put_u8((delta_nibble << 4) | length_nibble);
        put_extended(&mut buf, delta_ext);
        put_extended(&mut buf, length_ext);
        buf.put_slice(value);
    }

    if !message.payload.is_empty() {
        buf.put_u8(PAYLOAD_MARKER);
        buf.put_slice(&message.payload);
    }

    Ok(buf.freeze())
}

enum Extended {
    None,
    Byte(u8),
    Word(u16),
}

fn split_extended(value: usize) -> Result<(u8, Extended), MessageError> {
    match value {
        0..=12 => Ok((value as u8, Extended::None)),
        13..=268 => Ok((13, Extended::Byte((value - 13) as u8))),
        269..=65804 => Ok((14, Extended::Word((value - 269) as u16))),
        _ => Err(MessageError::OptionValueTooLong(value)),
    }
}

fn put_extended(buf: &mut BytesMut, ext: Extended) {
    match ext {
        Extended::None => {}
        Extended::Byte(b) => buf.put_u8(b),
        Extended::Word(w) => buf.put_u16(w),
    }
}

/// Parses a datagram.  Callers must branch on the result; malformed input is never
/// partially accepted.
pub fn decode(bytes: &[u8]) -> Result<Message, MessageError> {
    let mut buf = bytes;
    let (mtype, token_length) = read_fixed_header(&mut buf)?;
    let code = MessageClass::from(buf.get_u8());
    let message_id = buf.get_u16();

    if buf.remaining() < token_length {
        return Err(MessageError::UnexpectedEof);
    }
    let token = buf[..token_length].to_vec();
    buf.advance(token_length);

    let mut message = Message::new();
    message.header = Header {
        mtype,
        code,
        message_id,
    };
    message.set_token(token);

    let mut number = 0u32;
    while buf.has_remaining() {
        let byte = buf.get_u8();
        if byte == PAYLOAD_MARKER {
            if !buf.has_remaining() {
                return Err(MessageError::EmptyPayload);
            }
            message.payload = buf.to_vec();
            break;
        }

        let delta = read_extended(&mut buf, byte >> 4)
            .ok_or(MessageError::InvalidOptionDelta)??;
        let length = read_extended(&mut buf, byte & 0x0f)
            .ok_or(MessageError::InvalidOptionLength)??;

        number += delta as u32;
        let option_number = u16::try_from(number).map_err(|_| MessageError::InvalidOptionNumber)?;
        if buf.remaining() < length {
            return Err(MessageError::UnexpectedEof);
        }
        message.push_raw_option(option_number, buf[..length].to_vec());
        buf.advance(length);
    }

    if code == MessageClass::Empty
        && (!message.get_token().is_empty()
            || message.options().next().is_some()
            || !message.payload.is_empty())
    {
        return Err(MessageError::InvalidEmptyMessage);
    }

    Ok(message)
}

/// Reads the first header byte, leaving the cursor at the code byte.
fn read_fixed_header(buf: &mut &[u8]) -> Result<(MessageType, usize), MessageError> {
    if buf.remaining() < 4 {
        return Err(MessageError::UnexpectedEof);
    }
    let first = buf.get_u8();
    let version = first >> 6;
    if version != VERSION {
        return Err(MessageError::InvalidVersion(version));
    }
    let token_length = usize::from(first & 0x0f);
    if token_length > MAX_TOKEN_LENGTH {
        return Err(MessageError::InvalidTokenLength(token_length));
    }
    Ok((type_from_bits(first >> 4), token_length))
}

/// `None` when the nibble is the reserved value 15.
fn read_extended(buf: &mut &[u8], nibble: u8) -> Option<Result<usize, MessageError>> {
    let value = match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 if buf.remaining() >= 1 => Ok(usize::from(buf.get_u8()) + 13),
        14 if buf.remaining() >= 2 => Ok(usize::from(buf.get_u16()) + 269),
        13 | 14 => Err(MessageError::UnexpectedEof),
        _ => return None,
    };
    Some(value)
}

/// Builds the reply owed to a peer whose datagram failed to decode, if any: a Confirmable
/// request with a readable header and token gets a piggybacked error carrying a diagnostic
/// payload, a Confirmable message with only a readable header gets a Reset, anything else is
/// silently dropped.
pub fn malformed_reply(bytes: &[u8], error: &MessageError) -> Option<Message> {
    let mut buf = bytes;
    if buf.remaining() < 4 || buf[0] >> 6 != VERSION {
        return None;
    }
    let first = buf.get_u8();
    if type_from_bits(first >> 4) != MessageType::Confirmable {
        return None;
    }
    let code = buf.get_u8();
    let message_id = buf.get_u16();
    let token_length = usize::from(first & 0x0f);

    let mut reply = Message::new();
    reply.header.message_id = message_id;
    let is_request = code != 0 && code >> 5 == 0;
    if is_request && token_length <= MAX_TOKEN_LENGTH && buf.remaining() >= token_length {
        reply.header.set_type(MessageType::Acknowledgement);
        reply.header.code = MessageClass::Response(error.code());
        reply.set_token(buf[..token_length].to_vec());
        reply.payload = error.to_string().into_bytes();
    } else {
        reply.header.set_type(MessageType::Reset);
    }
    Some(reply)
}
