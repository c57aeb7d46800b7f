//! Typed CoAP message model and its binary wire codec.
//!
//! The vocabulary types (message types, codes, option numbers, content formats, block values)
//! are coap-lite's. A [`Message`] is the decoded form of one datagram.  The peer address never
//! lives inside the message; it travels beside it as the `Endpoint` of a framed item or request.

use std::collections::BTreeMap;

pub use coap_lite::block_handler::BlockValue;
pub use coap_lite::{
    CoapOption, ContentFormat, MessageClass, MessageType, ObserveOption, RequestType,
    ResponseType,
};
pub use codec::{decode, encode, MessageError};
pub use option::{OptionDefinition, ValueType};

pub mod codec;
pub mod option;

pub type MessageId = u16;

/// Maximum token length permitted by RFC 7252 §3.
pub const MAX_TOKEN_LENGTH: usize = 8;

pub(crate) fn type_from_bits(bits: u8) -> MessageType {
    match bits & 0x03 {
        0 => MessageType::Confirmable,
        1 => MessageType::NonConfirmable,
        2 => MessageType::Acknowledgement,
        _ => MessageType::Reset,
    }
}

pub(crate) fn type_bits(mtype: MessageType) -> u8 {
    match mtype {
        MessageType::Confirmable => 0,
        MessageType::NonConfirmable => 1,
        MessageType::Acknowledgement => 2,
        MessageType::Reset => 3,
    }
}

/// Single byte form of a response code, e.g. `0x84` for 4.04.
pub fn status_code(status: ResponseType) -> u8 {
    u8::from(MessageClass::Response(status))
}

/// True for the 2.xx class.
pub fn is_success(status: ResponseType) -> bool {
    status_code(status) >> 5 == 2
}

pub fn is_error(status: ResponseType) -> bool {
    matches!(status_code(status) >> 5, 4 | 5)
}

/// Dotted `c.dd` rendering of a code.
pub fn code_string(class: MessageClass) -> String {
    let value = u8::from(class);
    format!("{}.{:02}", value >> 5, value & 0x1f)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    mtype: MessageType,
    pub code: MessageClass,
    pub message_id: MessageId,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            mtype: MessageType::Confirmable,
            code: MessageClass::Empty,
            message_id: 0,
        }
    }
}

impl Header {
    pub fn get_type(&self) -> MessageType {
        self.mtype
    }

    pub fn set_type(&mut self, mtype: MessageType) {
        self.mtype = mtype;
    }
}

/// One CoAP message.  Options are kept as an ordered multimap so that encoding naturally
/// produces ascending option deltas.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: Header,
    token: Vec<u8>,
    options: BTreeMap<u16, Vec<Vec<u8>>>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new() -> Self {
        Default::default()
    }

    /// Convenience constructor for an outbound request addressed by a slash separated path.
    pub fn request(method: RequestType, mtype: MessageType, path: &str) -> Self {
        let mut message = Self::new();
        message.header.set_type(mtype);
        message.header.code = MessageClass::Request(method);
        message.set_path(path);
        message
    }

    pub fn get_token(&self) -> &[u8] {
        &self.token
    }

    /// Tokens longer than [`MAX_TOKEN_LENGTH`] are rejected when the message is encoded.
    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = token;
    }

    /// Unassigned method codes (0.08 to 0.31) are still requests.
    pub fn is_request(&self) -> bool {
        match self.header.code {
            MessageClass::Request(_) => true,
            MessageClass::Reserved(code) => code != 0 && code >> 5 == 0,
            _ => false,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.header.code, MessageClass::Response(_))
    }

    pub fn method(&self) -> Option<RequestType> {
        match self.header.code {
            MessageClass::Request(
                method @ (RequestType::Get
                | RequestType::Post
                | RequestType::Put
                | RequestType::Delete
                | RequestType::Fetch
                | RequestType::Patch
                | RequestType::IPatch),
            ) => Some(method),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<ResponseType> {
        match self.header.code {
            MessageClass::Response(status) => Some(status),
            _ => None,
        }
    }

    /// Iterates every option instance in ascending option number order.
    pub fn options(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.options
            .iter()
            .flat_map(|(number, values)| values.iter().map(move |v| (*number, v.as_slice())))
    }

    pub fn get_option(&self, option: CoapOption) -> Option<&[Vec<u8>]> {
        self.options.get(&u16::from(option)).map(|v| v.as_slice())
    }

    pub fn get_first_option(&self, option: CoapOption) -> Option<&[u8]> {
        self.get_option(option)
            .and_then(|values| values.first())
            .map(|v| v.as_slice())
    }

    pub fn has_option(&self, option: CoapOption) -> bool {
        self.options.contains_key(&u16::from(option))
    }

    /// Replaces all instances of `option` with a single value.
    pub fn set_option(&mut self, option: CoapOption, value: Vec<u8>) {
        self.options.insert(option.into(), vec![value]);
    }

    /// Appends another instance of a (repeatable) option.
    pub fn add_option(&mut self, option: CoapOption, value: Vec<u8>) {
        self.options.entry(option.into()).or_default().push(value);
    }

    pub fn clear_option(&mut self, option: CoapOption) {
        self.options.remove(&u16::from(option));
    }

    pub(crate) fn push_raw_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.entry(number).or_default().push(value);
    }

    pub fn get_uint_option(&self, option: CoapOption) -> Option<u32> {
        self.get_first_option(option).and_then(option::decode_uint)
    }

    pub fn set_uint_option(&mut self, option: CoapOption, value: u32) {
        self.set_option(option, option::encode_uint(value));
    }

    pub fn get_observe_value(&self) -> Option<u32> {
        self.get_uint_option(CoapOption::Observe)
    }

    pub fn set_observe_value(&mut self, value: u32) {
        self.set_uint_option(CoapOption::Observe, value);
    }

    /// `None` when absent or when the number is not a registered format.
    pub fn get_content_format(&self) -> Option<ContentFormat> {
        self.get_uint_option(CoapOption::ContentFormat)
            .and_then(|v| u16::try_from(v).ok())
            .and_then(option::content_format)
    }

    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.set_uint_option(
            CoapOption::ContentFormat,
            u32::from(option::content_format_number(format)),
        );
    }

    /// Raw Accept number, kept so that unregistered formats can still be refused.
    pub fn get_accept_number(&self) -> Option<u16> {
        self.get_uint_option(CoapOption::Accept)
            .map(|v| u16::try_from(v).unwrap_or(u16::MAX))
    }

    pub fn get_accept(&self) -> Option<ContentFormat> {
        self.get_accept_number().and_then(option::content_format)
    }

    pub fn set_accept(&mut self, format: ContentFormat) {
        self.set_uint_option(
            CoapOption::Accept,
            u32::from(option::content_format_number(format)),
        );
    }

    pub fn get_block1(&self) -> Result<Option<BlockValue>, MessageError> {
        self.get_first_option(CoapOption::Block1)
            .map(option::decode_block)
            .transpose()
    }

    pub fn set_block1(&mut self, block: BlockValue) {
        self.set_option(CoapOption::Block1, option::encode_block(&block));
    }

    pub fn get_block2(&self) -> Result<Option<BlockValue>, MessageError> {
        self.get_first_option(CoapOption::Block2)
            .map(option::decode_block)
            .transpose()
    }

    pub fn set_block2(&mut self, block: BlockValue) {
        self.set_option(CoapOption::Block2, option::encode_block(&block));
    }

    /// Uri-Path segments joined with `/`, without a leading slash.
    pub fn get_path(&self) -> String {
        self.get_path_as_vec().unwrap_or_default().join("/")
    }

    pub fn get_path_as_vec(&self) -> Result<Vec<String>, MessageError> {
        string_options(self.get_option(CoapOption::UriPath))
    }

    pub fn set_path(&mut self, path: &str) {
        self.clear_option(CoapOption::UriPath);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
    }

    pub fn get_location_path(&self) -> Result<Vec<String>, MessageError> {
        string_options(self.get_option(CoapOption::LocationPath))
    }

    pub fn set_location_path(&mut self, path: &str) {
        self.clear_option(CoapOption::LocationPath);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::LocationPath, segment.as_bytes().to_vec());
        }
    }

    pub fn get_queries(&self) -> Result<Vec<String>, MessageError> {
        string_options(self.get_option(CoapOption::UriQuery))
    }

    pub fn add_query(&mut self, query: &str) {
        self.add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
    }

    pub fn get_etag(&self) -> Option<&[u8]> {
        self.get_first_option(CoapOption::ETag)
    }

    /// Checks received request options against the option registry: unknown critical options
    /// and repeated non-repeatable critical options are rejected, returning the offending number.
    pub fn validate_options(&self) -> Result<(), u16> {
        for (number, values) in &self.options {
            match option::definition(*number) {
                None if option::is_critical(*number) => return Err(*number),
                None => {}
                Some(definition) => {
                    if !definition.repeatable && values.len() > 1 && option::is_critical(*number) {
                        return Err(*number);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drops elective options that are repeated despite being non-repeatable, keeping the
    /// first occurrence.
    pub(crate) fn normalize_elective_repeats(&mut self) {
        for (number, values) in self.options.iter_mut() {
            if let Some(definition) = option::definition(*number) {
                if !definition.repeatable && !option::is_critical(*number) {
                    values.truncate(1);
                }
            }
        }
    }
}

fn string_options(values: Option<&[Vec<u8>]>) -> Result<Vec<String>, MessageError> {
    values
        .unwrap_or_default()
        .iter()
        .map(|v| {
            String::from_utf8(v.clone()).map_err(|e| MessageError::InvalidOptionValue(e.to_string()))
        })
        .collect()
}
