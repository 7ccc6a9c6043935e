//! Response formats and `Accept` negotiation.

use crate::error::{CoreResult, ErrorKind};
use std::fmt;
use std::str::FromStr;

/// Wire format of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// `application/json`
    #[default]
    Json,
    /// Newline delimited JSON.
    Jsonl,
    /// Comma separated values.
    Csv,
    /// Plain text table.
    Ascii,
    /// HTML page.
    Html,
    /// RDF/XML.
    RdfXml,
}

const MEDIA_TYPES: [(&str, Format); 8] = [
    ("application/json", Format::Json),
    ("application/x-jsonlines", Format::Jsonl),
    ("application/jsonl", Format::Jsonl),
    ("text/csv", Format::Csv),
    ("text/plain", Format::Ascii),
    ("text/html", Format::Html),
    ("application/xhtml+xml", Format::Html),
    ("application/rdf+xml", Format::RdfXml),
];

impl Format {
    /// Name used in `/:format/{name}`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Csv => "csv",
            Self::Ascii => "ascii",
            Self::Html => "html",
            Self::RdfXml => "rdf",
        }
    }

    /// Media type of the response body.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Jsonl => "application/x-jsonlines",
            Self::Csv => "text/csv",
            Self::Ascii => "text/plain",
            Self::Html => "text/html",
            Self::RdfXml => "application/rdf+xml",
        }
    }

    /// Picks the format for an `Accept` header: highest `q` wins, ties go to
    /// the earlier entry, `*/*` and unknown types fall back to JSON.
    #[must_use]
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::Json;
        };
        let mut best: Option<(f32, Self)> = None;
        for item in accept.split(',') {
            let mut parts = item.split(';').map(str::trim);
            let media = parts.next().unwrap_or_default().to_ascii_lowercase();
            let q = parts
                .filter_map(|p| p.strip_prefix("q="))
                .find_map(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            let Some(format) = MEDIA_TYPES
                .iter()
                .find(|(m, _)| *m == media)
                .map(|(_, f)| *f)
            else {
                continue;
            };
            if q > 0.0 && best.map_or(true, |(bq, _)| q > bq) {
                best = Some((q, format));
            }
        }
        best.map_or(Self::Json, |(_, f)| f)
    }
}

impl FromStr for Format {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Ok(match s {
            "json" => Self::Json,
            "jsonl" => Self::Jsonl,
            "csv" => Self::Csv,
            "ascii" => Self::Ascii,
            "html" => Self::Html,
            "rdf" | "rdf+xml" => Self::RdfXml,
            other => {
                return Err(ErrorKind::UnsupportedMediaType
                    .err()
                    .with("given", other)
                    .into())
            }
        })
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!("rdf+xml".parse::<Format>().unwrap(), Format::RdfXml);
        assert_eq!("csv".parse::<Format>().unwrap(), Format::Csv);
        assert_eq!(
            "xlsx".parse::<Format>().unwrap_err().code(),
            "UnsupportedMediaType"
        );
    }

    #[test]
    fn negotiation() {
        assert_eq!(Format::negotiate(None), Format::Json);
        assert_eq!(Format::negotiate(Some("text/csv")), Format::Csv);
        assert_eq!(
            Format::negotiate(Some("text/html;q=0.5, text/csv;q=0.9")),
            Format::Csv
        );
        assert_eq!(
            Format::negotiate(Some("text/html,application/xhtml+xml,*/*;q=0.8")),
            Format::Html
        );
        assert_eq!(Format::negotiate(Some("image/png")), Format::Json);
    }
}
