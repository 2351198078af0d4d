pub mod request;
pub mod response;

/// A protocol-level failure carrying the HTTP status it maps to. These are
/// plain values, converted to error responses at the connection boundary;
/// they never unwind through the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpError {
    pub status: u16,
}

impl HttpError {
    pub fn new(status: u16) -> HttpError {
        HttpError { status }
    }
}
