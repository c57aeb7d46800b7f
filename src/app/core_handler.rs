use std::collections::HashMap;

use coap_lite::link_format::LinkFormatWrite;
use log::debug;

use crate::app::error::CoapError;
use crate::app::resource::ResourceState;
use crate::app::{Request, Response};
use crate::msg::{ContentFormat, RequestType, ResponseType};

pub(crate) const WELL_KNOWN_CORE: &str = ".well-known/core";

/// Serves `GET /.well-known/core`: every visible resource in traversal order, optionally
/// filtered by the query string (RFC 6690 §4.1).
pub(crate) fn handle_discovery<'a, Endpoint>(
    request: &Request<Endpoint>,
    resources: impl Iterator<Item = &'a ResourceState>,
) -> Result<Response, CoapError> {
    if request.method() != Some(RequestType::Get) {
        return Err(CoapError::method_not_allowed());
    }
    let queries = request.queries();

    let mut payload = String::new();
    let mut write = LinkFormatWrite::new(&mut payload);
    let mut count = 0;
    for state in resources.filter(|s| s.is_visible() && filter_by_query(s, &queries)) {
        write = state
            .attributes()
            .write_link(&format!("/{}", state.path()), write)
            .map_err(|_| CoapError::internal("Link format error"))?;
        count += 1;
    }
    write
        .finish()
        .map_err(|_| CoapError::internal("Link format error"))?;
    debug!("Discovery for {queries:?} matched {count} resources");

    let mut response = request.new_response();
    response.set_status(ResponseType::Content);
    response
        .message
        .set_content_format(ContentFormat::ApplicationLinkFormat);
    response.message.payload = payload.into_bytes();
    Ok(response)
}

fn filter_by_query(state: &ResourceState, queries: &HashMap<String, String>) -> bool {
    queries.iter().all(|(key, pattern)| {
        if key == "href" {
            return matches_pattern(&format!("/{}", state.path()), pattern);
        }
        match state.attributes().get(key) {
            // Relation types and interfaces may be space separated lists.
            Some(value) => {
                matches_pattern(&value, pattern)
                    || value.split(' ').any(|item| matches_pattern(item, pattern))
            }
            None => false,
        }
    })
}

fn matches_pattern(value: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => value == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Message, MessageType};
    use coap_lite::link_format::LINK_ATTR_RESOURCE_TYPE;

    fn state(path: &str, rt: &'static str) -> ResourceState {
        let mut state = ResourceState::new(path);
        state.set_attr(LINK_ATTR_RESOURCE_TYPE, rt);
        state
    }

    fn discover(query: Option<&str>, states: &[ResourceState]) -> String {
        let mut message = Message::request(RequestType::Get, MessageType::Confirmable, WELL_KNOWN_CORE);
        if let Some(query) = query {
            message.add_query(query);
        }
        let request = Request::new(message, ());
        let response = handle_discovery(&request, states.iter()).unwrap();
        assert_eq!(
            response.message.get_content_format(),
            Some(ContentFormat::ApplicationLinkFormat)
        );
        String::from_utf8(response.message.payload).unwrap()
    }

    #[test]
    fn test_filters() {
        let mut hidden = state("secret", "core.rd");
        hidden.set_visible(false);
        let states = vec![
            state("rd", "core.rd"),
            state("rd-lookup/ep", "core.rd-lookup-ep"),
            state("rd-lookup/res", "core.rd-lookup-res"),
            hidden,
        ];

        assert_eq!(
            discover(None, &states),
            r#"</rd>;rt="core.rd",</rd-lookup/ep>;rt="core.rd-lookup-ep",</rd-lookup/res>;rt="core.rd-lookup-res""#
        );
        assert_eq!(discover(Some("rt=core.rd"), &states), r#"</rd>;rt="core.rd""#);
        assert_eq!(
            discover(Some("rt=core.rd-lookup*"), &states),
            r#"</rd-lookup/ep>;rt="core.rd-lookup-ep",</rd-lookup/res>;rt="core.rd-lookup-res""#
        );
        assert_eq!(discover(Some("href=/rd"), &states), r#"</rd>;rt="core.rd""#);
        assert_eq!(discover(Some("if=sensor"), &states), "");
    }

    #[test]
    fn test_only_get() {
        let message = Message::request(RequestType::Post, MessageType::Confirmable, WELL_KNOWN_CORE);
        let request = Request::new(message, ());
        let err = handle_discovery(&request, std::iter::empty()).unwrap_err();
        assert_eq!(err.code, ResponseType::MethodNotAllowed);
    }
}
