use std::collections::HashMap;

use crate::app::CoapError;
use crate::msg::{CoapOption, Message};

/// Uri-Query options as a key/value map.  Queries without `=` are kept with an empty value,
/// undecodable ones are skipped.
pub fn request_get_queries(message: &Message) -> HashMap<String, String> {
    message
        .get_option(CoapOption::UriQuery)
        .map_or_else(HashMap::new, |options| {
            options
                .iter()
                .map(|value| OptionValueQuery::try_from(value.as_slice()))
                .filter_map(Result::ok)
                .map(|query| (query.key, query.value))
                .collect::<HashMap<_, _>>()
        })
}

pub struct OptionValueQuery {
    key: String,
    value: String,
}

impl TryFrom<&[u8]> for OptionValueQuery {
    type Error = CoapError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut key_value_iter = value.splitn(2, |&c| c == b'=');
        let key_vec = key_value_iter.next().unwrap_or_default().to_vec();
        let value_vec = key_value_iter.next().unwrap_or_default().to_vec();
        if key_vec.is_empty() {
            return Err(CoapError::bad_request("Empty query key"));
        }
        let key = String::from_utf8(key_vec)
            .map_err(|e| CoapError::bad_request(format!("Key is not UTF-8: {e}")))?;
        let value = String::from_utf8(value_vec)
            .map_err(|e| CoapError::bad_request(format!("Value is not UTF-8: {e}")))?;

        Ok(OptionValueQuery { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{MessageType, RequestType};

    #[test]
    fn test_queries() {
        let mut message = Message::request(RequestType::Post, MessageType::Confirmable, "rd");
        message.add_query("ep=node1");
        message.add_query("lt=3600");
        message.add_query("con");
        message.add_query("d=a=b");
        let queries = request_get_queries(&message);
        assert_eq!(queries.get("ep").map(String::as_str), Some("node1"));
        assert_eq!(queries.get("lt").map(String::as_str), Some("3600"));
        assert_eq!(queries.get("con").map(String::as_str), Some(""));
        assert_eq!(queries.get("d").map(String::as_str), Some("a=b"));
    }
}
