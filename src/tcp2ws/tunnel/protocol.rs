use bytes::Bytes;
use thiserror::Error;

/// Liveness probe sent by the terminator's reaper. Acknowledged by ignoring it.
pub const PROBE: &str = "tcp2wsSparkle";
/// Explicit session close. Tears down both legs on receipt.
pub const CLOSE: &str = "tcp2wsSparkleClose";

pub const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("identity message must be a text frame")]
    NotText,
    #[error("session id too long: {0} bytes")]
    TooLong(usize),
    #[error("session id contains non-printable characters")]
    BadChars,
    #[error("session id collides with a control word")]
    Reserved,
    #[error("tunnel closed before identity message")]
    Closed,
    #[error("timed out waiting for identity message")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One WebSocket data message. Ping/pong/close frames never surface at this level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn framing(&self) -> Framing {
        match self {
            Frame::Text(_) => Framing::Text,
            Frame::Binary(_) => Framing::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(s) => s.as_bytes(),
            Frame::Binary(b) => b,
        }
    }

    /// Returns the control word carried by this frame, if any.
    pub fn control(&self) -> Option<Control> {
        match self {
            Frame::Text(s) if s == PROBE => Some(Control::Probe),
            Frame::Text(s) if s == CLOSE => Some(Control::Close),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Probe,
    Close,
}

/// Framing mode last observed from the peer, tracked per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    Text,
    #[default]
    Binary,
}

impl Framing {
    /// Wraps a backend chunk in the framing mode the peer is using.
    ///
    /// Falls back to binary when the chunk is not valid UTF-8 or would be read
    /// back as a control word.
    pub fn frame(self, chunk: Bytes) -> Frame {
        if self == Framing::Binary {
            return Frame::Binary(chunk);
        }
        match std::str::from_utf8(&chunk) {
            Ok(s) if s != PROBE && s != CLOSE => Frame::Text(s.to_string()),
            _ => Frame::Binary(chunk),
        }
    }
}

/// Builds the identity message the dialing side sends first on every tunnel.
pub fn identity_frame(session_id: &str) -> Frame {
    Frame::Text(session_id.to_string())
}

/// Validates the first message on an accepted tunnel and returns the session id.
///
/// An empty id is valid and means "no resume".
pub fn parse_identity(frame: &Frame) -> Result<String, HandshakeError> {
    let Frame::Text(id) = frame else {
        return Err(HandshakeError::NotText);
    };
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(HandshakeError::TooLong(id.len()));
    }
    if !id.chars().all(|c| c.is_ascii_graphic()) {
        return Err(HandshakeError::BadChars);
    }
    if id == PROBE || id == CLOSE {
        return Err(HandshakeError::Reserved);
    }
    Ok(id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_words_are_recognized_only_as_text() {
        assert_eq!(Frame::Text(PROBE.into()).control(), Some(Control::Probe));
        assert_eq!(Frame::Text(CLOSE.into()).control(), Some(Control::Close));
        assert_eq!(
            Frame::Binary(Bytes::from_static(CLOSE.as_bytes())).control(),
            None
        );
        assert_eq!(Frame::Text("hello".into()).control(), None);
    }

    #[test]
    fn text_framing_falls_back_to_binary() {
        let f = Framing::Text.frame(Bytes::from_static(b"hello"));
        assert_eq!(f, Frame::Text("hello".into()));

        let f = Framing::Text.frame(Bytes::from_static(&[0xff, 0xfe]));
        assert_eq!(f.framing(), Framing::Binary);

        // A backend chunk must never be mistaken for a control word by the peer.
        let f = Framing::Text.frame(Bytes::from_static(CLOSE.as_bytes()));
        assert_eq!(f.framing(), Framing::Binary);
        assert_eq!(f.control(), None);

        let f = Framing::Binary.frame(Bytes::from_static(b"hello"));
        assert_eq!(f, Frame::Binary(Bytes::from_static(b"hello")));
    }

    #[test]
    fn identity_accepts_plain_ids_and_empty() {
        assert_eq!(parse_identity(&identity_frame("a1b2c3")).unwrap(), "a1b2c3");
        assert_eq!(parse_identity(&identity_frame("")).unwrap(), "");
    }

    #[test]
    fn identity_rejects_malformed() {
        assert!(matches!(
            parse_identity(&Frame::Binary(Bytes::from_static(b"abc"))),
            Err(HandshakeError::NotText)
        ));
        assert!(matches!(
            parse_identity(&Frame::Text("a b".into())),
            Err(HandshakeError::BadChars)
        ));
        assert!(matches!(
            parse_identity(&Frame::Text("x".repeat(MAX_SESSION_ID_LEN + 1))),
            Err(HandshakeError::TooLong(_))
        ));
        assert!(matches!(
            parse_identity(&Frame::Text(PROBE.into())),
            Err(HandshakeError::Reserved)
        ));
    }
}
