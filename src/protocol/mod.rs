//! Binary framing shared by the aggregator and the agencies.
//!
//! Every exchange is one frame each way over a fresh TCP connection.
//! Multi-byte integers are little-endian.
//!
//! ```text
//! request:  | type u8 | agency u8 | [ length u16 | payload ] |
//! response: | type u8 | length u16 | payload |
//! ```
//!
//! Only BETS requests carry a length and payload; FINISH and ASK_WINNERS are
//! the bare two-byte header. Every response carries a length, possibly zero.
//!
//! # Payloads
//!
//! | Frame | Payload |
//! |-------|---------|
//! | BETS request | records joined by `\n`; fields `first_name`, `last_name`, `document`, `birthdate` each followed by NUL, then `number` |
//! | SUCCESS to BETS | decimal count of stored records |
//! | SUCCESS to ASK_WINNERS | documents joined by NUL, empty when nobody won |
//! | ERROR | one of the [`ErrorReason`] texts |

mod frame;

use std::fmt;

use crate::bet::{parse_birthdate, Bet};
use crate::{Error, Result};

pub use frame::{FrameIo, RequestHeader};

/// Largest payload a peer may declare.
pub const MAX_PAYLOAD_LEN: usize = 8190;
pub const RECORD_SEPARATOR: u8 = b'\n';
pub const FIELD_SEPARATOR: u8 = 0;

const FIELDS_PER_RECORD: usize = 5;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Bets = 1,
    Finish = 2,
    AskWinners = 4,
    Error = 8,
    Success = 9,
}

impl MessageType {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Bets),
            2 => Ok(MessageType::Finish),
            4 => Ok(MessageType::AskWinners),
            8 => Ok(MessageType::Error),
            9 => Ok(MessageType::Success),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// Fixed set of ERROR payloads the aggregator sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    MessageTooLong,
    LotteryNotDone,
    Malformed,
    StoreFailure,
    ServerClosing,
}

impl ErrorReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorReason::MessageTooLong => "Message exceeded maximum length",
            ErrorReason::LotteryNotDone => "Lottery not done yet",
            ErrorReason::Malformed => "Malformed message",
            ErrorReason::StoreFailure => "Could not store bets",
            ErrorReason::ServerClosing => "Server is closing",
        }
    }

    pub fn from_text(text: &str) -> Option<Self> {
        [
            ErrorReason::MessageTooLong,
            ErrorReason::LotteryNotDone,
            ErrorReason::Malformed,
            ErrorReason::StoreFailure,
            ErrorReason::ServerClosing,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == text)
    }

    /// Reason reported to the peer for a request that failed with `err`.
    /// Connection-level failures have no reason: nobody is left to tell.
    pub fn for_error(err: &Error) -> Option<Self> {
        match err {
            Error::Io(_) | Error::Timeout(_) => None,
            Error::PayloadTooLarge { .. } => Some(ErrorReason::MessageTooLong),
            Error::Csv(_) | Error::StoreLocked(_) => Some(ErrorReason::StoreFailure),
            Error::UnknownMessageType(_)
            | Error::Malformed(_)
            | Error::UnknownAgency(_)
            | Error::AgencyFinished(_)
            | Error::InvalidConfig(_) => Some(ErrorReason::Malformed),
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bets { agency: u8, bets: Vec<Bet> },
    Finish { agency: u8 },
    AskWinners { agency: u8 },
}

impl Request {
    pub fn agency(&self) -> u8 {
        match self {
            Request::Bets { agency, .. }
            | Request::Finish { agency }
            | Request::AskWinners { agency } => *agency,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Bets { .. } => MessageType::Bets,
            Request::Finish { .. } => MessageType::Finish,
            Request::AskWinners { .. } => MessageType::AskWinners,
        }
    }

    /// Encodes the whole frame. The only size check is the 16-bit length
    /// field; judging against [`MAX_PAYLOAD_LEN`] is left to the receiver.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut frame = vec![self.message_type().as_u8(), self.agency()];
        if let Request::Bets { bets, .. } = self {
            let payload = encode_bets(bets)?;
            push_length(&mut frame, payload.len())?;
            frame.extend_from_slice(&payload);
        }
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success(Vec<u8>),
    Error(String),
}

impl Response {
    pub fn stored(count: usize) -> Self {
        Response::Success(count.to_string().into_bytes())
    }

    pub fn winners(documents: &[String]) -> Self {
        Response::Success(documents.join("\0").into_bytes())
    }

    pub fn error(reason: ErrorReason) -> Self {
        Response::Error(reason.as_str().to_string())
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Response::Success(_) => MessageType::Success,
            Response::Error(_) => MessageType::Error,
        }
    }

    /// Known reason of an ERROR response, if its text is one we define.
    pub fn reason(&self) -> Option<ErrorReason> {
        match self {
            Response::Error(text) => ErrorReason::from_text(text),
            Response::Success(_) => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Response::Success(payload) => payload.as_slice(),
            Response::Error(text) => text.as_bytes(),
        };
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                declared: payload.len(),
            });
        }
        let mut frame = Vec::with_capacity(3 + payload.len());
        frame.push(self.message_type().as_u8());
        push_length(&mut frame, payload.len())?;
        frame.extend_from_slice(payload);
        Ok(frame)
    }
}

fn push_length(frame: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u16::try_from(len).map_err(|_| Error::PayloadTooLarge { declared: len })?;
    frame.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Encodes a BETS payload. Fails if any field contains a separator byte,
/// since the record could not be split back apart.
pub fn encode_bets(bets: &[Bet]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for (idx, bet) in bets.iter().enumerate() {
        if idx > 0 {
            payload.push(RECORD_SEPARATOR);
        }
        let birthdate = bet.birthdate_text()?;
        let fields = [
            bet.first_name.as_str(),
            bet.last_name.as_str(),
            bet.document.as_str(),
            birthdate.as_str(),
        ];
        for field in fields {
            push_field(&mut payload, field)?;
            payload.push(FIELD_SEPARATOR);
        }
        push_field(&mut payload, &bet.number)?;
    }
    Ok(payload)
}

fn push_field(payload: &mut Vec<u8>, field: &str) -> Result<()> {
    if field
        .bytes()
        .any(|b| b == RECORD_SEPARATOR || b == FIELD_SEPARATOR)
    {
        return Err(Error::Malformed("field contains a separator byte"));
    }
    payload.extend_from_slice(field.as_bytes());
    Ok(())
}

/// Decodes a BETS payload, stamping every record with the header's agency.
pub fn decode_bets(agency: u8, payload: &[u8]) -> Result<Vec<Bet>> {
    let text = std::str::from_utf8(payload).map_err(|_| Error::Malformed("payload is not utf-8"))?;
    if text.is_empty() {
        return Err(Error::Malformed("empty bet batch"));
    }

    let mut bets = Vec::new();
    for record in text.split(RECORD_SEPARATOR as char) {
        let fields: Vec<&str> = record.split(FIELD_SEPARATOR as char).collect();
        if fields.len() != FIELDS_PER_RECORD {
            return Err(Error::Malformed("bet record does not have five fields"));
        }
        bets.push(Bet {
            agency,
            first_name: fields[0].to_string(),
            last_name: fields[1].to_string(),
            document: fields[2].to_string(),
            birthdate: parse_birthdate(fields[3])?,
            number: fields[4].to_string(),
        });
    }
    Ok(bets)
}

/// Parses the SUCCESS payload of a BETS exchange.
pub fn decode_count(payload: &[u8]) -> Result<usize> {
    std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or(Error::Malformed("stored count is not a decimal number"))
}

/// Parses the SUCCESS payload of an ASK_WINNERS exchange.
pub fn decode_winners(payload: &[u8]) -> Result<Vec<String>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let text = std::str::from_utf8(payload).map_err(|_| Error::Malformed("winners are not utf-8"))?;
    Ok(text
        .split(FIELD_SEPARATOR as char)
        .map(str::to_string)
        .collect())
}
