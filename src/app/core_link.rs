use std::fmt::{Debug, Error};

use coap_lite::link_format::{LinkAttributeWrite, LinkFormatWrite};
use dyn_clone::DynClone;

use crate::msg::option::content_format_number;
use crate::msg::ContentFormat;

/// CoRE Link Format attributes of one resource (`rt`, `if`, `ct`, `sz`, `obs`, or anything
/// else an application wants to advertise).  Later values for the same key replace earlier
/// ones.
#[derive(Default, Debug)]
pub struct LinkAttributes {
    attributes: Vec<(String, Box<dyn LinkAttributeValue>)>,
}

impl LinkAttributes {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn attr(&mut self, key: &str, value: impl LinkAttributeValue + 'static) {
        let value: Box<dyn LinkAttributeValue> = Box::new(value);
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.attributes.retain(|(k, _)| k != key);
    }

    /// Comparison form of the attribute value, as used by discovery query filtering.
    pub fn get(&self, key: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.format_for_comparison())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, String)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.format_for_comparison()))
    }

    /// Writes `</path>` followed by every attribute.  Valued attributes whose value renders
    /// as the empty string are skipped entirely.
    pub(crate) fn write_link<'a>(
        &self,
        path: &str,
        mut write: LinkFormatWrite<'a, String>,
    ) -> Result<LinkFormatWrite<'a, String>, Error> {
        let mut link = write.link(path);
        for (key, value) in &self.attributes {
            if !value.is_flag() && value.format_for_comparison().is_empty() {
                continue;
            }
            link = value.write_to(link, key);
        }
        link.finish().map(|_| write)
    }

    pub fn format_single_link(&self, path: &str) -> String {
        let mut buf = String::new();
        let write = LinkFormatWrite::new(&mut buf);
        if let Ok(write) = self.write_link(path, write) {
            let _ = write.finish();
        }
        buf
    }
}

impl Clone for LinkAttributes {
    fn clone(&self) -> Self {
        let attributes: Vec<_> = self
            .attributes
            .iter()
            .map(|(key, value)| (key.clone(), dyn_clone::clone_box(value.as_ref())))
            .collect();
        Self { attributes }
    }
}

impl PartialEq for LinkAttributes {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

pub trait LinkAttributeValue: DynClone + Debug + Send + Sync {
    fn format_for_comparison(&self) -> String;

    fn write_to<'a, 'b>(
        &self,
        write: LinkAttributeWrite<'a, 'b, String>,
        key: &str,
    ) -> LinkAttributeWrite<'a, 'b, String>;

    /// Valueless attributes such as `obs`.
    fn is_flag(&self) -> bool {
        false
    }
}

dyn_clone::clone_trait_object!(LinkAttributeValue);

impl LinkAttributeValue for &'static str {
    fn format_for_comparison(&self) -> String {
        self.to_string()
    }

    fn write_to<'a, 'b>(
        &self,
        write: LinkAttributeWrite<'a, 'b, String>,
        key: &str,
    ) -> LinkAttributeWrite<'a, 'b, String> {
        write.attr_quoted(key, self)
    }
}

impl LinkAttributeValue for String {
    fn format_for_comparison(&self) -> String {
        self.clone()
    }

    fn write_to<'a, 'b>(
        &self,
        write: LinkAttributeWrite<'a, 'b, String>,
        key: &str,
    ) -> LinkAttributeWrite<'a, 'b, String> {
        write.attr_quoted(key, self)
    }
}

impl LinkAttributeValue for u32 {
    fn format_for_comparison(&self) -> String {
        self.to_string()
    }

    fn write_to<'a, 'b>(
        &self,
        write: LinkAttributeWrite<'a, 'b, String>,
        key: &str,
    ) -> LinkAttributeWrite<'a, 'b, String> {
        write.attr_u32(key, *self)
    }
}

impl LinkAttributeValue for ContentFormat {
    fn format_for_comparison(&self) -> String {
        content_format_number(*self).to_string()
    }

    fn write_to<'a, 'b>(
        &self,
        write: LinkAttributeWrite<'a, 'b, String>,
        key: &str,
    ) -> LinkAttributeWrite<'a, 'b, String> {
        write.attr_u32(key, u32::from(content_format_number(*self)))
    }
}

impl LinkAttributeValue for () {
    fn format_for_comparison(&self) -> String {
        "".to_string()
    }

    fn write_to<'a, 'b>(
        &self,
        write: LinkAttributeWrite<'a, 'b, String>,
        key: &str,
    ) -> LinkAttributeWrite<'a, 'b, String> {
        write.attr(key, "")
    }

    fn is_flag(&self) -> bool {
        true
    }
}
