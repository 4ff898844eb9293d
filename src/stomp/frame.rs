use std::fmt;

/// A STOMP frame: command, ordered headers and raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command (e.g. CONNECT, SEND, ERROR)
    pub command: String,
    /// Ordered headers as (key, value) pairs
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame with the given command and no headers or body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build a `SEND` frame addressed to `destination`.
    ///
    /// Parameters
    /// - `destination`: full STOMP destination, e.g. `/queue/orders`.
    /// - `body`: message payload. Binary payloads get a `content-length`
    ///   header from the codec.
    pub fn send(destination: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new("SEND")
            .header("destination", destination)
            .set_body(body)
    }

    /// Add a header (builder style).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Ask the broker to confirm this frame with a `RECEIPT`.
    pub fn receipt(self, receipt_id: impl Into<String>) -> Self {
        self.header("receipt", receipt_id)
    }

    /// Set the frame body (builder style).
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `key` (case-sensitive), if present.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (k, v) in &self.headers {
            // passcode stays out of logs
            if k == "passcode" {
                writeln!(f, "{}: ***", k)?;
            } else {
                writeln!(f, "{}: {}", k, v)?;
            }
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}
