pub(crate) mod sse_parser;

#[cfg(any(feature = "sse", feature = "streamable-http"))]
use crate::error::{TransportError, TransportResult};
#[cfg(any(feature = "sse", feature = "streamable-http"))]
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
#[cfg(any(feature = "sse", feature = "streamable-http"))]
use std::collections::HashMap;

/// Converts caller-supplied string headers into a `HeaderMap`, rejecting
/// names or values the HTTP layer would not accept.
#[cfg(any(feature = "sse", feature = "streamable-http"))]
pub(crate) fn validate_headers(
    headers: &Option<HashMap<String, String>>,
) -> TransportResult<HeaderMap> {
    let mut header_map = HeaderMap::new();
    if let Some(headers) = headers {
        for (key, value) in headers {
            let header_name = key
                .parse::<HeaderName>()
                .map_err(|e| TransportError::Configuration {
                    message: format!("Invalid header name: {e}"),
                })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| TransportError::Configuration {
                    message: format!("Invalid header value: {e}"),
                })?;
            header_map.insert(header_name, header_value);
        }
    }
    Ok(header_map)
}
