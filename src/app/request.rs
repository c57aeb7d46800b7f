use std::collections::HashMap;

use crate::app::coap_utils;
use crate::app::response::Response;
use crate::msg::{Message, RequestType, ResponseType};

#[derive(Debug, Clone)]
pub struct Request<Endpoint> {
    pub original: Message,
    pub source: Endpoint,
    /// Path segments below the resource that received the request.  Only non-empty when a
    /// POST to a missing path was routed to an ancestor that allows children.
    pub unmatched_path: Vec<String>,
}

impl<Endpoint> Request<Endpoint> {
    pub fn new(original: Message, source: Endpoint) -> Self {
        Self {
            original,
            source,
            unmatched_path: Vec::new(),
        }
    }

    pub fn method(&self) -> Option<RequestType> {
        self.original.method()
    }

    pub fn path(&self) -> String {
        self.original.get_path()
    }

    pub fn queries(&self) -> HashMap<String, String> {
        coap_utils::request_get_queries(&self.original)
    }

    pub fn new_response(&self) -> Response {
        let mut response = Response::new(&self.original);
        let default_code = match self.method() {
            Some(RequestType::Get) | Some(RequestType::Fetch) => ResponseType::Content,
            Some(RequestType::Post) => ResponseType::Created,
            Some(RequestType::Put) | Some(RequestType::Patch) | Some(RequestType::IPatch) => {
                ResponseType::Changed
            }
            Some(RequestType::Delete) => ResponseType::Deleted,
            _ => ResponseType::Valid,
        };
        response.set_status(default_code);
        response
    }
}
