//! HTTP date header value management service.
//!
//! Maintains the current `Date` header value in a lock-free cell, refreshed
//! by a background thread, so the serialization path never formats a date
//! per response.

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A service that maintains and periodically updates the current HTTP date string.
pub(crate) struct DateService {
    current: Arc<ArcSwap<Bytes>>,
}

static DATE_SERVICE: Lazy<DateService> = Lazy::new(|| DateService::new_with_update_interval(Duration::from_millis(800)));

impl DateService {
    /// Returns the shared process-wide instance.
    pub(crate) fn global() -> &'static DateService {
        &DATE_SERVICE
    }

    fn new_with_update_interval(update_interval: Duration) -> Self {
        let current = Arc::new(ArcSwap::from_pointee(format_now()));
        let current_arc = Arc::clone(&current);

        // detached refresher; lives as long as the process
        let builder = thread::Builder::new().name("http-date".to_string());
        let _ = builder.spawn(move || loop {
            thread::sleep(update_interval);
            current_arc.store(Arc::new(format_now()));
        });

        DateService { current }
    }

    /// Returns the current date as a ready-to-insert header value.
    pub(crate) fn header_value(&self) -> HeaderValue {
        let date = self.current.load().as_ref().clone();
        // SAFE: the bytes come from faf_http_date and contain only visible ASCII
        unsafe { HeaderValue::from_maybe_shared_unchecked(date) }
    }
}

fn format_now() -> Bytes {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    Bytes::from_owner(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_value_looks_like_an_imf_fixdate() {
        let value = DateService::global().header_value();
        let text = value.to_str().unwrap();
        // e.g. "Tue, 01 Jul 2025 10:00:00 GMT"
        assert!(text.ends_with("GMT"), "unexpected date format: {text}");
        assert!(text.len() >= 24);
    }
}
