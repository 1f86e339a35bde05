//! Server-provided "retry after" hints.
//!
//! Hints are discovered by walking the failure's source chain looking for
//! [`RetryAfter`] or [`HttpError`] values. Other error types can take part by
//! implementing [`RetryAfterHint`] and plugging [`hint_from`] into a
//! [`HintedStrategy`](crate::HintedStrategy) as its extractor.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::DynError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Capability of errors that know how long the caller should wait.
pub trait RetryAfterHint {
    /// `Some(d)` means "wait at least `d` before retrying".
    fn retry_after(&self) -> Option<Duration>;
}

/// An error annotated with an explicit wait hint.
#[derive(Debug, Error)]
#[error("{source} (retry after {after:?})")]
pub struct RetryAfter {
    after: Duration,
    source: BoxError,
}

impl RetryAfter {
    pub fn new<E>(after: Duration, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            after,
            source: source.into(),
        }
    }
}

impl RetryAfterHint for RetryAfter {
    fn retry_after(&self) -> Option<Duration> {
        Some(self.after)
    }
}

/// An HTTP failure carrying the response headers needed for hint extraction.
#[derive(Debug, Error)]
#[error("http error: {status}{}", cause_suffix(.source))]
pub struct HttpError {
    pub status: u16,
    headers: Vec<(String, String)>,
    /// When the response was received; anchors date-based `Retry-After`.
    pub received_at: DateTime<Utc>,
    source: Option<BoxError>,
}

impl HttpError {
    /// Creates an error for the given status code received now.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            received_at: Utc::now(),
            source: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        self.source = Some(source.into());
        self
    }

    /// Looks up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn cause_suffix(source: &Option<BoxError>) -> String {
    source.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
}

impl RetryAfterHint for HttpError {
    fn retry_after(&self) -> Option<Duration> {
        self.header("Retry-After")
            .and_then(|v| parse_retry_after(v, self.received_at))
    }
}

/// Parses a `Retry-After` header value.
///
/// Supports delta-seconds (`"120"`) and HTTP-dates in IMF-fixdate, RFC 850
/// and asctime forms. Dates in the past yield a zero wait.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = parse_http_date(value)?;
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Finds a wait hint anywhere in the failure's source chain.
pub fn extract_retry_after(err: &DynError) -> Option<Duration> {
    let mut current: Option<&DynError> = Some(err);
    while let Some(e) = current {
        let hint = if let Some(ra) = e.downcast_ref::<RetryAfter>() {
            ra.retry_after()
        } else if let Some(http) = e.downcast_ref::<HttpError>() {
            http.retry_after()
        } else {
            None
        };
        if let Some(d) = hint.filter(|d| !d.is_zero()) {
            return Some(d);
        }
        current = e.source();
    }
    None
}

/// Builds an extractor that recognizes a caller-defined hint-carrying error type.
pub fn hint_from<T>() -> impl Fn(&DynError) -> Option<Duration> + Send + Sync + 'static
where
    T: RetryAfterHint + std::error::Error + 'static,
{
    |err: &DynError| {
        let mut current: Option<&DynError> = Some(err);
        while let Some(e) = current {
            if let Some(typed) = e.downcast_ref::<T>() {
                return typed.retry_after();
            }
            current = e.source();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 10, 21, h, m, s).unwrap()
    }

    #[test]
    fn parses_delta_seconds() {
        assert_eq!(parse_retry_after(" 120 ", Utc::now()), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("0", Utc::now()), Some(Duration::ZERO));
    }

    #[test]
    fn parses_imf_fixdate() {
        let now = at(7, 27, 0);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn parses_rfc850_and_asctime() {
        let now = at(7, 27, 30);
        assert_eq!(
            parse_retry_after("Wednesday, 21-Oct-15 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed Oct 21 07:28:00 2015", now),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn past_date_yields_zero() {
        let now = at(8, 0, 0);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn garbage_and_negative_are_rejected() {
        assert_eq!(parse_retry_after("", Utc::now()), None);
        assert_eq!(parse_retry_after("soon", Utc::now()), None);
        assert_eq!(parse_retry_after("-5", Utc::now()), None);
    }

    #[test]
    fn http_error_header_lookup_is_case_insensitive() {
        let err = HttpError::new(503).with_header("retry-after", "7");
        assert_eq!(err.header("Retry-After"), Some("7"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn http_error_display_and_source() {
        use std::error::Error;

        let bare = HttpError::new(502);
        assert_eq!(bare.to_string(), "http error: 502");
        assert!(bare.source().is_none());

        let wrapped = HttpError::new(503).with_source("upstream closed");
        assert_eq!(wrapped.to_string(), "http error: 503: upstream closed");
        assert_eq!(wrapped.source().unwrap().to_string(), "upstream closed");

        let hinted = RetryAfter::new(Duration::from_secs(2), "busy");
        assert_eq!(hinted.to_string(), "busy (retry after 2s)");
        assert_eq!(hinted.source().unwrap().to_string(), "busy");
    }

    #[test]
    fn extract_walks_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("call failed")]
        struct Wrapper(#[source] HttpError);

        let err = Wrapper(HttpError::new(429).with_header("Retry-After", "3"));
        assert_eq!(extract_retry_after(&err), Some(Duration::from_secs(3)));
    }

    #[test]
    fn extract_ignores_errors_without_hint() {
        let err = HttpError::new(500);
        assert_eq!(extract_retry_after(&err), None);
    }

    #[test]
    fn hint_from_custom_type() {
        #[derive(Debug, thiserror::Error)]
        #[error("throttled")]
        struct Throttled;

        impl RetryAfterHint for Throttled {
            fn retry_after(&self) -> Option<Duration> {
                Some(Duration::from_millis(250))
            }
        }

        let extract = hint_from::<Throttled>();
        assert_eq!(extract(&Throttled), Some(Duration::from_millis(250)));
    }
}
