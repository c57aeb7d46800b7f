//! Option registry and value helpers layered over coap-lite's option vocabulary.

use std::convert::TryFrom;

use coap_lite::block_handler::BlockValue;
use coap_lite::{ContentFormat, ObserveOption};

use crate::msg::codec::MessageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Empty,
    Opaque,
    Uint,
    String,
}

/// Static registry entry describing how an option is encoded and whether it may repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDefinition {
    pub value_type: ValueType,
    pub repeatable: bool,
    pub min_length: usize,
    pub max_length: usize,
    pub default: Option<u32>,
}

const fn def(
    value_type: ValueType,
    repeatable: bool,
    min_length: usize,
    max_length: usize,
) -> OptionDefinition {
    OptionDefinition {
        value_type,
        repeatable,
        min_length,
        max_length,
        default: None,
    }
}

/// Registry entry for an option number (RFC 7252 §12.2, RFC 7641, RFC 7959), or `None` for
/// numbers this crate does not understand.
pub fn definition(number: u16) -> Option<OptionDefinition> {
    use ValueType::*;
    let definition = match number {
        1 => def(Opaque, true, 0, 8),
        3 => def(String, false, 1, 255),
        4 => def(Opaque, true, 1, 8),
        5 => def(Empty, false, 0, 0),
        6 => def(Uint, false, 0, 3),
        7 => def(Uint, false, 0, 2),
        8 => def(String, true, 0, 255),
        11 => def(String, true, 0, 255),
        12 => def(Uint, false, 0, 2),
        14 => OptionDefinition {
            default: Some(60),
            ..def(Uint, false, 0, 4)
        },
        15 => def(String, true, 0, 255),
        17 => def(Uint, false, 0, 2),
        20 => def(String, true, 0, 255),
        23 => def(Uint, false, 0, 3),
        27 => def(Uint, false, 0, 3),
        28 => def(Uint, false, 0, 4),
        35 => def(String, false, 1, 1034),
        39 => def(String, false, 1, 255),
        60 => def(Uint, false, 0, 4),
        258 => def(Uint, false, 0, 1),
        _ => return None,
    };
    Some(definition)
}

/// Critical options have the low bit set (RFC 7252 §5.4.6).
pub fn is_critical(number: u16) -> bool {
    number & 0x01 != 0
}

pub fn is_unsafe(number: u16) -> bool {
    number & 0x02 != 0
}

pub fn is_no_cache_key(number: u16) -> bool {
    number & 0x1e == 0x1c
}

pub fn is_repeatable(number: u16) -> bool {
    definition(number).map_or(true, |d| d.repeatable)
}

pub fn content_format_number(format: ContentFormat) -> u16 {
    usize::from(format) as u16
}

/// `None` for formats coap-lite has no variant for.
pub fn content_format(number: u16) -> Option<ContentFormat> {
    ContentFormat::try_from(usize::from(number)).ok()
}

pub fn observe_flag(value: u32) -> Option<ObserveOption> {
    match value {
        0 => Some(ObserveOption::Register),
        1 => Some(ObserveOption::Deregister),
        _ => None,
    }
}

/// Largest block number representable in a 3 byte option.
const MAX_BLOCK_NUM: u32 = (1 << 20) - 1;

/// `size` must be a power of two between 16 and 1024 inclusive.
pub fn block_value(num: u32, more: bool, size: usize) -> Result<BlockValue, MessageError> {
    if !size.is_power_of_two() || !(16..=1024).contains(&size) || num > MAX_BLOCK_NUM {
        return Err(MessageError::InvalidBlockValue);
    }
    BlockValue::new(num as usize, more, size).map_err(|_| MessageError::InvalidBlockValue)
}

/// Block size in bytes, `2^(szx + 4)`.
pub fn block_size(block: &BlockValue) -> usize {
    1 << (usize::from(block.size_exponent) + 4)
}

/// Byte offset of a block within the full body.
pub fn block_offset(block: &BlockValue) -> usize {
    block.num as usize * block_size(block)
}

/// Parses a Block1/Block2 value: `NUM | M | SZX` packed big-endian into at most 3 bytes.
pub fn decode_block(value: &[u8]) -> Result<BlockValue, MessageError> {
    if value.len() > 3 {
        return Err(MessageError::InvalidBlockValue);
    }
    let raw = decode_uint(value).ok_or(MessageError::InvalidBlockValue)?;
    let size_exponent = raw & 0x07;
    if size_exponent == 7 {
        return Err(MessageError::InvalidBlockValue);
    }
    block_value(raw >> 4, raw & 0x08 != 0, 1 << (size_exponent + 4))
}

pub fn encode_block(block: &BlockValue) -> Vec<u8> {
    let raw = (block.num as u32) << 4
        | u32::from(block.more) << 3
        | u32::from(block.size_exponent);
    encode_uint(raw)
}

/// Minimal big-endian encoding of a uint option; zero is the empty string.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}
