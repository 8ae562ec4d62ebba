//! Header and query parameter extraction
//!
//! Header names are normalized to lower case before anything else, then each
//! configured sensitive header is replaced with a single [`MASK`] value,
//! whatever the number of values it originally carried. Query parameters are
//! extracted the same way but are never masked.
//!
//! All functions here are pure, and `None` input always yields an empty map.

use http::HeaderMap;
use std::collections::BTreeSet;

use super::record::MultiMap;

/// Value substituted for every masked header
pub const MASK: &str = "_masked_";

/// Headers masked when nothing else is configured
pub const DEFAULT_MASKED_HEADERS: &[&str] = &["authorization"];

/// Header extractor holding the set of names to mask
#[derive(Debug, Clone)]
pub struct Redactor {
    masked: BTreeSet<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(DEFAULT_MASKED_HEADERS.iter().copied())
    }
}

impl Redactor {
    /// Create a redactor masking the given header names (case-insensitive)
    pub fn new<I, S>(masked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            masked: masked
                .into_iter()
                .map(|name| name.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Names masked by this redactor, lower-cased
    pub fn masked_headers(&self) -> impl Iterator<Item = &str> {
        self.masked.iter().map(String::as_str)
    }

    /// Extract and mask headers from an `http` header map
    ///
    /// Values that are not valid UTF-8 are kept, converted lossily.
    pub fn extract_headers(&self, raw: Option<&HeaderMap>) -> MultiMap {
        let Some(raw) = raw else {
            return MultiMap::new();
        };
        let pairs = raw.iter().map(|(name, value)| {
            let value = match value.to_str() {
                Ok(v) => v.to_string(),
                Err(_) => {
                    tracing::warn!(
                        header = %name,
                        "Header value is not valid UTF-8, keeping a lossy copy"
                    );
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                }
            };
            (name.as_str(), value)
        });
        self.mask(normalize(pairs))
    }

    /// Extract and mask headers from arbitrary `(name, value)` pairs
    pub fn extract_header_pairs<I, K, V>(&self, raw: Option<I>) -> MultiMap
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        match raw {
            Some(pairs) => self.mask(normalize(pairs)),
            None => MultiMap::new(),
        }
    }

    /// Replace the values of every sensitive header with the mask
    pub fn mask(&self, mut headers: MultiMap) -> MultiMap {
        for name in &self.masked {
            if let Some(values) = headers.get_mut(name) {
                *values = vec![MASK.to_string()];
            }
        }
        headers
    }
}

/// Extract query parameters from a raw (still encoded) query string
///
/// Keys keep their case, values are percent-decoded, repeated keys
/// accumulate in order of appearance.
pub fn extract_query_params(raw: Option<&str>) -> MultiMap {
    let mut params = MultiMap::new();
    let Some(query) = raw else {
        return params;
    };
    for (key, value) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

fn normalize<I, K, V>(pairs: I) -> MultiMap
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut map = MultiMap::new();
    for (name, value) in pairs {
        map.entry(name.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};

    #[test]
    fn test_none_yields_empty_maps() {
        let redactor = Redactor::default();
        assert!(redactor.extract_headers(None).is_empty());
        assert!(redactor
            .extract_header_pairs(None::<Vec<(String, String)>>)
            .is_empty());
        assert!(extract_query_params(None).is_empty());
    }

    #[test]
    fn test_authorization_masked_regardless_of_arity() {
        let mut headers = HeaderMap::new();
        headers.append(AUTHORIZATION, HeaderValue::from_static("Bearer a"));
        headers.append(AUTHORIZATION, HeaderValue::from_static("Bearer b"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let extracted = Redactor::default().extract_headers(Some(&headers));

        assert_eq!(extracted["authorization"], vec![MASK.to_string()]);
        assert_eq!(extracted["content-type"], vec!["application/json".to_string()]);
    }

    #[test]
    fn test_case_variants_are_normalized_then_masked() {
        let pairs = vec![
            ("AUTHORIZATION", "secret"),
            ("Authorization", "other"),
            ("X-Trace", "abc"),
        ];
        let extracted = Redactor::default().extract_header_pairs(Some(pairs));

        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted["authorization"], vec!["_masked_".to_string()]);
        assert_eq!(extracted["x-trace"], vec!["abc".to_string()]);
    }

    #[test]
    fn test_configured_masks_are_case_insensitive() {
        let redactor = Redactor::new(["X-Api-Key", "Cookie"]);
        let extracted =
            redactor.extract_header_pairs(Some(vec![("x-api-key", "k"), ("COOKIE", "c")]));

        assert_eq!(extracted["x-api-key"], vec![MASK.to_string()]);
        assert_eq!(extracted["cookie"], vec![MASK.to_string()]);
        assert_eq!(
            redactor.masked_headers().collect::<Vec<_>>(),
            vec!["cookie", "x-api-key"]
        );
    }

    #[test]
    fn test_non_utf8_header_kept_lossily() {
        let mut headers = HeaderMap::new();
        headers.insert("x-raw", HeaderValue::from_bytes(&[0x66, 0xff, 0x6f]).unwrap());

        let extracted = Redactor::default().extract_headers(Some(&headers));
        assert_eq!(extracted["x-raw"], vec!["f\u{fffd}o".to_string()]);
    }

    #[test]
    fn test_query_params_decoded_and_accumulated() {
        let params = extract_query_params(Some("p=toto&tag=a&tag=b%20c&Empty="));

        assert_eq!(params["p"], vec!["toto".to_string()]);
        assert_eq!(params["tag"], vec!["a".to_string(), "b c".to_string()]);
        assert_eq!(params["Empty"], vec![String::new()]);
    }

    #[test]
    fn test_query_params_never_masked() {
        let params = extract_query_params(Some("?authorization=visible"));
        assert_eq!(params["authorization"], vec!["visible".to_string()]);
    }
}
