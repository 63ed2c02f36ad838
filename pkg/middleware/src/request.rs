use http::{Extensions, HeaderMap, Method, Request, Uri};

/// A borrowed, read-only view of an inbound request.
///
/// Collaborators only ever see the request head, never the body.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub extensions: &'a Extensions,
}

impl<'a> RequestHead<'a> {
    /// Returns the first value of the header `name` if it is present and non-empty.
    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .get(name)
            .map(|value| value.as_bytes())
            .filter(|value| !value.is_empty())
    }

    /// Returns the header `name` as a string if it is present, non-empty and valid utf-8.
    pub fn header_str(&self, name: &str) -> Option<&'a str> {
        self.header(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}

impl<'a, B> From<&'a Request<B>> for RequestHead<'a> {
    fn from(request: &'a Request<B>) -> Self {
        Self {
            method: request.method(),
            uri: request.uri(),
            headers: request.headers(),
            extensions: request.extensions(),
        }
    }
}
