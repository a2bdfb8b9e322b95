//! Minimal STOMP 1.2 frame codec
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! \n
//! body\0
//! ```
//!
//! Only what the subscription session needs is modeled: CONNECT, SUBSCRIBE,
//! UNSUBSCRIBE and DISCONNECT go out; CONNECTED, MESSAGE, RECEIPT and ERROR
//! come in. Bare EOLs between frames are heart-beats and are skipped.

#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    Empty,
    MissingHeaderTerminator,
    InvalidHeader(String),
    UnknownCommand(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Empty => write!(f, "Empty STOMP frame"),
            FrameError::MissingHeaderTerminator => write!(f, "STOMP frame has no header terminator"),
            FrameError::InvalidHeader(line) => write!(f, "Invalid STOMP header line: {}", line),
            FrameError::UnknownCommand(cmd) => write!(f, "Unknown STOMP command: {}", cmd),
        }
    }
}

impl std::error::Error for FrameError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CONNECT" | "STOMP" => Some(Command::Connect),
            "CONNECTED" => Some(Command::Connected),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "UNSUBSCRIBE" => Some(Command::Unsubscribe),
            "DISCONNECT" => Some(Command::Disconnect),
            "MESSAGE" => Some(Command::Message),
            "RECEIPT" => Some(Command::Receipt),
            "ERROR" => Some(Command::Error),
            _ => None,
        }
    }

    // CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First value of a header (STOMP gives the first occurrence precedence)
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, bearer_token: Option<&str>) -> Self {
        let frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2,1.1,1.0")
            .header("host", host)
            .header("heart-beat", "0,0");
        match bearer_token {
            Some(token) => frame.header("Authorization", &format!("Bearer {}", token)),
            None => frame,
        }
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Serialize to wire text, including the trailing NUL
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());

        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame; leading heart-beat EOLs and the trailing NUL are optional
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() || text == "\0" {
            return Err(FrameError::Empty);
        }

        let (command_line, rest) = text
            .split_once('\n')
            .ok_or(FrameError::MissingHeaderTerminator)?;
        let command_name = command_line.trim_end_matches('\r');
        let command = Command::from_str(command_name)
            .ok_or_else(|| FrameError::UnknownCommand(command_name.to_string()))?;

        let (header_block, body) = split_headers(rest).ok_or(FrameError::MissingHeaderTerminator)?;

        let mut headers = Vec::new();
        for line in header_block.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::InvalidHeader(line.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name), unescape_header(value)));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: String::new(),
        };
        frame.body = read_body(&frame, body);
        Ok(frame)
    }

    /// Parse every frame in a transport message (a message may carry several
    /// NUL-terminated frames or only heart-beats)
    pub fn parse_all(text: &str) -> Result<Vec<Self>, FrameError> {
        let mut frames = Vec::new();
        let mut rest = text;

        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                break;
            }
            let frame = Frame::parse(rest)?;
            let consumed = frame_len(rest, &frame);
            frames.push(frame);
            rest = rest.get(consumed..).unwrap_or("");
        }
        Ok(frames)
    }
}

// Header block ends at the first blank line (LF LF or CRLF CRLF)
fn split_headers(rest: &str) -> Option<(&str, &str)> {
    if rest.starts_with('\n') {
        return Some(("", &rest[1..]));
    }
    if rest.starts_with("\r\n") {
        return Some(("", &rest[2..]));
    }
    let lf = rest.find("\n\n").map(|i| (i, 2));
    let crlf = rest.find("\n\r\n").map(|i| (i, 3));
    let (index, width) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&rest[..index], &rest[index + width..]))
}

fn read_body(frame: &Frame, body: &str) -> String {
    let declared = frame
        .get_header("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok());

    match declared {
        Some(len) if len <= body.len() && body.is_char_boundary(len) => body[..len].to_string(),
        _ => match body.find('\0') {
            Some(end) => body[..end].to_string(),
            None => body.to_string(),
        },
    }
}

// Bytes of `text` taken by `frame`, through its NUL terminator
fn frame_len(text: &str, frame: &Frame) -> usize {
    let header_end = text
        .find("\n\n")
        .map(|i| i + 2)
        .into_iter()
        .chain(text.find("\r\n\r\n").map(|i| i + 4))
        .min()
        .unwrap_or(text.len());
    let after_body = header_end + frame.body.len();
    match text.get(after_body..) {
        Some(tail) => match tail.find('\0') {
            Some(nul) => after_body + nul + 1,
            None => text.len(),
        },
        None => text.len(),
    }
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_subscribe() {
        let wire = Frame::subscribe("sub-0", "/topic/telemetry/dev-1").encode();
        assert_eq!(
            wire,
            "SUBSCRIBE\nid:sub-0\ndestination:/topic/telemetry/dev-1\nack:auto\n\n\0"
        );
    }

    #[test]
    fn test_connect_carries_token_unescaped() {
        let frame = Frame::connect("localhost", Some("abc:def"));
        let wire = frame.encode();
        assert!(wire.starts_with("CONNECT\n"));
        assert!(wire.contains("Authorization:Bearer abc:def\n"));
        assert!(wire.contains("accept-version:1.2,1.1,1.0\n"));

        let without = Frame::connect("localhost", None);
        assert_eq!(without.get_header("Authorization"), None);
    }

    #[test]
    fn test_parse_message_frame() {
        let wire = "MESSAGE\ndestination:/topic/telemetry\nmessage-id:1\nsubscription:sub-0\n\n{\"deviceId\":\"d\"}\0";
        let frame = Frame::parse(wire).unwrap();

        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get_header("subscription"), Some("sub-0"));
        assert_eq!(frame.body, "{\"deviceId\":\"d\"}");
    }

    #[test]
    fn test_parse_skips_heartbeats_and_crlf() {
        let wire = "\n\r\nCONNECTED\r\nversion:1.2\r\n\r\n\0";
        let frame = Frame::parse(wire).unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.get_header("version"), Some("1.2"));
        assert_eq!(frame.body, "");
    }

    #[test]
    fn test_parse_unescapes_headers() {
        let wire = "ERROR\nmessage:bad\\cvalue\\nline\n\nbody\0";
        let frame = Frame::parse(wire).unwrap();
        assert_eq!(frame.get_header("message"), Some("bad:value\nline"));
    }

    #[test]
    fn test_content_length_allows_nul_in_body() {
        let wire = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frame = Frame::parse(wire).unwrap();
        assert_eq!(frame.body, "a\0b");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Frame::parse("\n\n"), Err(FrameError::Empty));
        assert!(matches!(Frame::parse("BOGUS\n\n\0"), Err(FrameError::UnknownCommand(_))));
        assert_eq!(
            Frame::parse("MESSAGE\nno-terminator"),
            Err(FrameError::MissingHeaderTerminator)
        );
        assert!(matches!(
            Frame::parse("MESSAGE\nbroken\n\n\0"),
            Err(FrameError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_parse_all_splits_frames() {
        let wire = "MESSAGE\nmessage-id:1\n\none\0\nMESSAGE\nmessage-id:2\n\ntwo\0\n";
        let frames = Frame::parse_all(wire).unwrap();
        let bodies: Vec<&str> = frames.iter().map(|f| f.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two"]);

        assert!(Frame::parse_all("\n").unwrap().is_empty());
    }

    #[test]
    fn test_header_escape_roundtrip_for_values() {
        let frame = Frame::new(Command::Subscribe).header("destination", "/a:b\\c");
        let parsed = Frame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed.get_header("destination"), Some("/a:b\\c"));
    }
}
