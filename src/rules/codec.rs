//! Rule name codec.
//!
//! The namespace limits rule names to 50 characters while filter values (fully
//! qualified type names) are routinely longer. Short values are used verbatim;
//! long values keep their most specific tail and gain a digest suffix:
//!
//! ```text
//! <last 34 chars of value>--<base64url(sha1(value)[..10])>
//! ```
//!
//! Decoding is a linear scan over known values, so a full pass over `n` rules
//! costs O(n²) encodes. Endpoints carry tens of rules, which keeps this cheap.

use super::RuleError;
use crate::config::{base64_unpadded_len, NamingConfig};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::borrow::Cow;

/// Maps filter values to bounded-length rule names and back.
#[derive(Debug, Clone, Default)]
pub struct RuleNameCodec {
    config: NamingConfig,
}

impl RuleNameCodec {
    pub fn new(config: NamingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    /// Derive the rule name for a filter value.
    ///
    /// # Examples
    ///
    /// ```
    /// use busrules::rules::RuleNameCodec;
    ///
    /// let codec = RuleNameCodec::default();
    /// assert_eq!(codec.encode("Orders.Created"), "Orders.Created");
    ///
    /// let long = format!("Contoso.Sales.Integration.Events.{}", "V".repeat(40));
    /// let name = codec.encode(&long);
    /// assert_eq!(name.chars().count(), 50);
    /// assert!(name.contains("--"));
    /// ```
    pub fn encode(&self, value: &str) -> String {
        let sanitized = self.sanitize(value);
        if sanitized.chars().count() <= self.config.max_length {
            return sanitized.into_owned();
        }

        let suffix = self.digest_suffix(&sanitized);
        let tail_length = self
            .config
            .max_length
            .saturating_sub(base64_unpadded_len(self.config.digest_bytes))
            .saturating_sub(self.config.separator.chars().count());
        let tail = crop_tail(&sanitized, tail_length);

        format!("{}{}{}", tail, self.config.separator, suffix)
    }

    /// Find which known value a live rule name was derived from.
    ///
    /// Returns `Ok(None)` when no known value encodes to `observed`, and
    /// [`RuleError::AmbiguousIdentifier`] when several distinct values do.
    pub fn decode<'a, S: AsRef<str>>(
        &self,
        known: &'a [S],
        observed: &str,
    ) -> Result<Option<&'a str>, RuleError> {
        let mut matches: Vec<&'a str> = Vec::new();
        for candidate in known {
            let candidate = candidate.as_ref();
            if matches.contains(&candidate) {
                continue;
            }
            if self.encode(candidate) == observed {
                matches.push(candidate);
            }
        }

        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => Err(RuleError::AmbiguousIdentifier {
                identifier: observed.to_string(),
                candidates: matches.into_iter().map(str::to_string).collect(),
            }),
        }
    }

    fn sanitize<'v>(&self, value: &'v str) -> Cow<'v, str> {
        if !self.config.sanitize || !value.contains([',', ' ', '=']) {
            return Cow::Borrowed(value);
        }

        Cow::Owned(
            value
                .chars()
                .filter(|c| *c != ',')
                .map(|c| if c == ' ' || c == '=' { '_' } else { c })
                .collect(),
        )
    }

    fn digest_suffix(&self, value: &str) -> String {
        let digest = Sha1::digest(value.as_bytes());
        let len = self.config.digest_bytes.min(digest.len());
        URL_SAFE_NO_PAD.encode(&digest[..len])
    }
}

/// Last `length` characters of `value`, trimming surrounding spaces once.
fn crop_tail(value: &str, length: usize) -> &str {
    if value.chars().count() < length {
        return value;
    }

    let trimmed = value.trim_matches(' ');
    let count = trimmed.chars().count();
    if count < length {
        return trimmed;
    }

    let start = trimmed
        .char_indices()
        .nth(count - length)
        .map(|(index, _)| index)
        .unwrap_or(trimmed.len());
    &trimmed[start..]
}
