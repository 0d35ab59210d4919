//! Minimal message templating.
//!
//! Rendering syntax is deliberately small: `{{ field }}` placeholders are
//! substituted per subscriber. The fields are the subscriber's `email`,
//! `name`, `uuid` and `attribs.<key>` attributes, plus the campaign-level
//! `campaign_name`, `campaign_uuid` and `unsubscribe_url`. Anything richer
//! belongs to the surrounding application's template layer.
//!
//! Templates are compiled once per campaign when its pipe is built and
//! cached per engine instance.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::subscriber::Subscriber;

/// Errors raised while compiling or rendering a template.
///
/// A render error affects a single subscriber: the engine logs it and
/// skips that subscriber, it is never fatal to the batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unclosed placeholder starting at byte {0}")]
    UnclosedPlaceholder(usize),

    #[error("empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),

    #[error("unknown template field '{0}'")]
    UnknownField(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A compiled template: literal chunks interleaved with field lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    segments: Vec<Segment>,
}

/// Everything a template can address during a render.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub subscriber: &'a Subscriber,
    pub campaign_name: &'a str,
    pub campaign_uuid: Uuid,
    pub unsubscribe_url: &'a str,
}

impl Template {
    /// Compile template source into substitutable segments.
    pub fn compile(source: &str) -> Result<Self, RenderError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }

            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(RenderError::UnclosedPlaceholder(offset + start));
            };

            let field = after[..end].trim();
            if field.is_empty() {
                return Err(RenderError::EmptyPlaceholder(offset + start));
            }
            segments.push(Segment::Field(field.to_string()));

            offset += start + 2 + end + 2;
            rest = &after[end + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Render this template for one subscriber.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<String, RenderError> {
        let mut out = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => out.push_str(&Self::resolve(name, ctx)?),
            }
        }

        Ok(out)
    }

    fn resolve(name: &str, ctx: &RenderContext<'_>) -> Result<String, RenderError> {
        match name {
            "campaign_name" => Ok(ctx.campaign_name.to_string()),
            "campaign_uuid" => Ok(ctx.campaign_uuid.to_string()),
            "unsubscribe_url" => Ok(ctx.unsubscribe_url.to_string()),
            other => ctx
                .subscriber
                .field(other)
                .ok_or_else(|| RenderError::UnknownField(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn subscriber() -> Subscriber {
        let mut attribs = ahash::AHashMap::new();
        attribs.insert("city".to_string(), "Bengaluru".to_string());

        Subscriber {
            id: 42,
            uuid: Uuid::new_v4(),
            email: "ana@example.com".to_string(),
            name: "Ana".to_string(),
            attribs,
        }
    }

    fn ctx(sub: &Subscriber) -> RenderContext<'_> {
        RenderContext {
            subscriber: sub,
            campaign_name: "Launch",
            campaign_uuid: Uuid::nil(),
            unsubscribe_url: "https://example.com/u/x/y",
        }
    }

    #[test]
    fn renders_subscriber_and_campaign_fields() {
        let sub = subscriber();
        let tpl = Template::compile("Hi {{ name }} from {{attribs.city}}, re {{campaign_name}}")
            .unwrap();

        assert_eq!(
            tpl.render(&ctx(&sub)).unwrap(),
            "Hi Ana from Bengaluru, re Launch"
        );
    }

    #[test]
    fn plain_text_passes_through() {
        let sub = subscriber();
        let tpl = Template::compile("no placeholders here").unwrap();
        assert_eq!(tpl.render(&ctx(&sub)).unwrap(), "no placeholders here");
    }

    #[test]
    fn unknown_field_errors() {
        let sub = subscriber();
        let tpl = Template::compile("{{ nope }}").unwrap();
        assert_eq!(
            tpl.render(&ctx(&sub)),
            Err(RenderError::UnknownField("nope".to_string()))
        );
    }

    #[test]
    fn unclosed_placeholder_fails_compile() {
        assert_eq!(
            Template::compile("broken {{ email"),
            Err(RenderError::UnclosedPlaceholder(7))
        );
    }

    #[test]
    fn empty_placeholder_fails_compile() {
        assert_eq!(
            Template::compile("{{  }}"),
            Err(RenderError::EmptyPlaceholder(0))
        );
    }
}
