//! Broker address redaction for logs.

use url::Url;

const MASK: &str = "****";

/// Returns `address` with any password replaced by `****`.
///
/// Addresses that do not parse are not echoed back, since they may still
/// carry credentials.
pub fn redact_url(address: &str) -> String {
    let mut url = match Url::parse(address) {
        Ok(url) => url,
        Err(_) => return "<invalid url>".to_string(),
    };

    if url.password().is_some() {
        // Only fails for URLs without a host, which cannot carry a password.
        let _ = url.set_password(Some(MASK));
    }
    url.to_string()
}
