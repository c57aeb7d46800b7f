use std::fmt;

use crate::app::{Request, Response};
use crate::msg::{CoapOption, MessageError, ResponseType};

/// Error type which can be converted to a [`crate::app::Response`] as a convenience for allowing
/// Rust's `?` operator to work naturally in handler code without violating the protocol by
/// failing to respond to requests.
#[derive(Debug, Clone, PartialEq)]
pub struct CoapError {
    pub code: ResponseType,
    pub message: String,
    /// Extra options for the error response, e.g. Size1 on 4.13.
    pub(crate) size1: Option<u32>,
}

impl CoapError {
    pub fn internal(msg: impl ToString) -> Self {
        Self::for_code(ResponseType::InternalServerError, msg)
    }

    pub fn bad_request(msg: impl ToString) -> Self {
        Self::for_code(ResponseType::BadRequest, msg)
    }

    pub fn bad_option(number: u16) -> Self {
        Self::for_code(ResponseType::BadOption, format!("Unsupported critical option {number}"))
    }

    pub fn not_found() -> Self {
        Self::for_code(ResponseType::NotFound, "Not found")
    }

    pub fn method_not_allowed() -> Self {
        Self::for_code(ResponseType::MethodNotAllowed, "Method not allowed")
    }

    pub fn not_acceptable() -> Self {
        Self::for_code(ResponseType::NotAcceptable, "Not acceptable")
    }

    pub fn precondition_failed() -> Self {
        Self::for_code(ResponseType::PreconditionFailed, "Precondition failed")
    }

    pub fn request_entity_incomplete() -> Self {
        Self::for_code(ResponseType::RequestEntityIncomplete, "Request entity incomplete")
    }

    pub fn request_entity_too_large(max_size: usize) -> Self {
        Self {
            size1: u32::try_from(max_size).ok(),
            ..Self::for_code(ResponseType::RequestEntityTooLarge, "Request entity too large")
        }
    }

    pub fn for_code(code: ResponseType, msg: impl ToString) -> Self {
        Self {
            code,
            message: msg.to_string(),
            size1: None,
        }
    }

    /// Error response for `request`, carrying the message as a diagnostic payload.
    pub fn into_response<Endpoint>(self, request: &Request<Endpoint>) -> Response {
        let mut response = Response::new(&request.original);
        response.set_status(self.code);
        response.message.payload = self.message.into_bytes();
        if let Some(size1) = self.size1 {
            response.message.set_uint_option(CoapOption::Size1, size1);
        }
        response
    }
}

impl fmt::Display for CoapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handling error {:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for CoapError {}

impl From<MessageError> for CoapError {
    fn from(src: MessageError) -> Self {
        Self::for_code(src.code(), src)
    }
}
