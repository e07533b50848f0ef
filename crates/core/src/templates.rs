//! Message template resolution using `{{variable}}` and `{{group.field}}`
//! placeholders.
//!
//! Resolution never fails: a placeholder whose variable is unknown is copied
//! through verbatim so that missing data stays visible in the rendered
//! message and can be detected downstream with [`placeholders`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Business, Customer};

/// A template variable: either a plain value or a group of named values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Scalar(String),
    /// A `None` field is known but empty and resolves to `""`.
    Nested(BTreeMap<String, Option<String>>),
}

/// Named variables available to a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVariables(BTreeMap<String, TemplateValue>);

impl TemplateVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0
            .insert(name.into(), TemplateValue::Scalar(value.into()));
        self
    }

    pub fn nested<K, I>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Option<String>)>,
    {
        let fields = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.0.insert(name.into(), TemplateValue::Nested(fields));
        self
    }

    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.0.get(name)
    }

    /// Standard variables for messaging `customer` on behalf of `business`:
    /// `customer.*`, `business.*` and `links.*`.
    pub fn for_recipient(customer: &Customer, business: Option<&Business>) -> Self {
        let vars = Self::new().nested(
            "customer",
            [
                ("first_name", customer.first_name.clone()),
                ("last_name", customer.last_name.clone()),
                ("name", customer.full_name()),
                ("email", customer.email.clone()),
                ("phone", customer.phone.clone()),
            ],
        );
        match business {
            Some(business) => vars
                .nested(
                    "business",
                    [
                        ("name", Some(business.name.clone())),
                        ("phone", business.phone.clone()),
                    ],
                )
                .nested(
                    "links",
                    business
                        .links
                        .iter()
                        .map(|(k, v)| (k.clone(), Some(v.clone()))),
                ),
            None => vars,
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name.split_once('.') {
            Some((group, field)) => match self.0.get(group.trim())? {
                TemplateValue::Nested(fields) => fields
                    .get(field.trim())
                    .map(|value| value.as_deref().unwrap_or("")),
                TemplateValue::Scalar(_) => None,
            },
            None => match self.0.get(name)? {
                TemplateValue::Scalar(value) => Some(value.as_str()),
                TemplateValue::Nested(_) => None,
            },
        }
    }
}

/// Substitute every known placeholder in `template`.
pub fn resolve(template: &str, variables: &TemplateVariables) -> String {
    let mut out = String::with_capacity(template.len());
    scan(template, |segment| match segment {
        Segment::Text(text) => out.push_str(text),
        Segment::Placeholder { raw, name } => match variables.lookup(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(raw),
        },
    });
    out
}

/// Names of all placeholders present in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    scan(template, |segment| {
        if let Segment::Placeholder { name, .. } = segment {
            names.push(name.to_string());
        }
    });
    names
}

enum Segment<'a> {
    Text(&'a str),
    Placeholder { raw: &'a str, name: &'a str },
}

fn scan<'a>(template: &'a str, mut visit: impl FnMut(Segment<'a>)) {
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + close;
        // `{{ a {{b}}` — the innermost opening brace owns the placeholder.
        let open = open + rest[open..close].rfind("{{").unwrap_or(0);

        if open > 0 {
            visit(Segment::Text(&rest[..open]));
        }
        let name = rest[open + 2..close].trim();
        let raw = &rest[open..close + 2];
        if name.is_empty() {
            visit(Segment::Text(raw));
        } else {
            visit(Segment::Placeholder { raw, name });
        }
        rest = &rest[close + 2..];
    }
    if !rest.is_empty() {
        visit(Segment::Text(rest));
    }
}
