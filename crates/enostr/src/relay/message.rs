use crate::{Error, Result};

#[derive(Debug, Eq, PartialEq)]
pub struct CommandResult<'a> {
    pub event_id: &'a str,
    pub status: bool,
    pub message: &'a str,
}

/// Messages sent by relays, received by clients. Borrowed from the raw
/// websocket text so that routing doesn't allocate.
#[derive(Debug, Eq, PartialEq)]
pub enum RelayMessage<'a> {
    OK(CommandResult<'a>),
    Eose(&'a str),
    /// subscription id, full message text
    Event(&'a str, &'a str),
    Notice(&'a str),
    /// subscription id, reason
    Closed(&'a str, String),
}

impl<'a> RelayMessage<'a> {
    pub fn eose(subid: &'a str) -> Self {
        RelayMessage::Eose(subid)
    }

    pub fn notice(msg: &'a str) -> Self {
        RelayMessage::Notice(msg)
    }

    pub fn ok(event_id: &'a str, status: bool, message: &'a str) -> Self {
        RelayMessage::OK(CommandResult {
            event_id,
            status,
            message,
        })
    }

    pub fn event(ev: &'a str, sub_id: &'a str) -> Self {
        RelayMessage::Event(sub_id, ev)
    }

    pub fn closed(sub_id: &'a str, reason: impl Into<String>) -> Self {
        RelayMessage::Closed(sub_id, reason.into())
    }

    #[profiling::function]
    pub fn from_json(msg: &'a str) -> Result<RelayMessage<'a>> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        // make sure we can inspect the begning of the message below ...
        if msg.len() < 12 {
            return Err(Error::DecodeFailed("message too short".into()));
        }

        // Notice
        // Relay response format: ["NOTICE", <message>]
        if msg.starts_with("[\"NOTICE\",") {
            let start = if msg.as_bytes().get(10).copied() == Some(b' ') {
                12
            } else {
                11
            };
            let end = msg.len() - 2;
            if start > end {
                return Err(Error::DecodeFailed("Invalid NOTICE format".into()));
            }
            return Ok(Self::notice(slice(msg, start, end, "NOTICE")?));
        }

        // Event
        // Relay response format: ["EVENT", <subscription id>, <event JSON>]
        if msg.starts_with("[\"EVENT\"") {
            let mut start = 9;
            while let Some(&b' ') = msg.as_bytes().get(start) {
                start += 1; // Move past optional spaces
            }
            let Some(comma_index) = msg.get(start..).and_then(|rest| rest.find(',')) else {
                return Err(Error::DecodeFailed("Invalid EVENT format".into()));
            };
            let subid = slice(msg, start, start + comma_index, "EVENT")?
                .trim()
                .trim_matches('"');
            return Ok(Self::event(msg, subid));
        }

        // EOSE (NIP-15)
        // Relay response format: ["EOSE", <subscription_id>]
        if msg.starts_with("[\"EOSE\",") {
            let start = if msg.as_bytes().get(8).copied() == Some(b' ') {
                10 // Skip space after the comma
            } else {
                9 // Start immediately after the comma
            };

            if let Some(end_bracket_index) = msg.rfind(']') {
                let end = end_bracket_index.saturating_sub(1); // Account for space before bracket
                if start < end {
                    let subid = slice(msg, start, end, "EOSE")?
                        .trim()
                        .trim_matches('"')
                        .trim();
                    return Ok(RelayMessage::eose(subid));
                }
            }
            return Err(Error::DecodeFailed(
                "Invalid subscription ID or format".into(),
            ));
        }

        // CLOSED (NIP-01)
        // Relay response format: ["CLOSED", <subscription_id>, <message>]
        // The reason is arbitrary text, so let serde deal with escapes.
        if msg.starts_with("[\"CLOSED\",") {
            let parts: Vec<&str> = msg
                .trim_start_matches("[\"CLOSED\",")
                .splitn(2, ',')
                .collect();
            let subid = parts
                .first()
                .map(|s| s.trim().trim_end_matches(']').trim().trim_matches('"'))
                .unwrap_or_default();
            let decoded: Vec<String> = serde_json::from_str(msg)?;
            let reason = decoded.get(2).cloned().unwrap_or_default();
            return Ok(Self::closed(subid, reason));
        }

        // OK (NIP-20)
        // Relay response format: ["OK",<event_id>, <true|false>, <message>]
        if msg.starts_with("[\"OK\",") && msg.len() >= 78 {
            let event_id = slice(msg, 7, 71, "OK")?;
            let booly = slice(msg, 73, 77, "OK")?;
            let status: bool = if booly == "true" {
                true
            } else if booly == "false" {
                false
            } else {
                return Err(Error::DecodeFailed("bad boolean value".into()));
            };
            let message_start = msg
                .rfind(',')
                .ok_or_else(|| Error::DecodeFailed("missing OK message".into()))?
                + 1;
            let message = slice(msg, message_start, msg.len() - 2, "OK")?
                .trim()
                .trim_matches('"');
            return Ok(Self::ok(event_id, status, message));
        }

        Err(Error::DecodeFailed(format!(
            "unrecognized message type: '{msg}'"
        )))
    }
}

/// Byte range of relay text that may not fall on char boundaries
fn slice<'a>(msg: &'a str, start: usize, end: usize, what: &str) -> Result<&'a str> {
    msg.get(start..end)
        .ok_or_else(|| Error::DecodeFailed(format!("invalid {what} format")))
}
