//! BinkP binary frame model and codec.
//!
//! Every frame starts with a 2-byte big-endian header. The top bit of the
//! first byte distinguishes data frames (0) from command frames (1); the
//! remaining 15 bits carry the payload length, which must be non-zero. A
//! command frame's first payload byte is the opcode; the rest is text.

use crate::address::{Address, AddressError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// NUL opcode: informational text, or protocol options when the text
/// begins with `OPT `.
pub const CMD_NUL: u8 = 0;
/// ADR opcode: whitespace-separated list of addresses the peer speaks for.
pub const CMD_ADR: u8 = 1;
/// PWD opcode: plaintext password or `CRAM-<hash>-<hex>` response.
pub const CMD_PWD: u8 = 2;
/// FILE opcode: offer of a file transfer.
pub const CMD_FILE: u8 = 3;
/// OK opcode: successful authentication.
pub const CMD_OK: u8 = 4;
/// EOB opcode: end of the file batch in this direction.
pub const CMD_EOB: u8 = 5;
/// GOT opcode: acknowledges complete receipt of a file.
pub const CMD_GOT: u8 = 6;
/// ERR opcode: fatal diagnostic; the session is over.
pub const CMD_ERR: u8 = 7;
/// BSY opcode: transient rejection; the caller may retry later.
pub const CMD_BSY: u8 = 8;
/// GET opcode: request to (re)send a file from an offset.
pub const CMD_GET: u8 = 9;
/// SKIP opcode: request to omit a file from this session.
pub const CMD_SKIP: u8 = 10;

/// Largest payload a single frame can carry (15-bit length field).
pub const MAX_FRAME_SIZE: usize = 32767;

/// The command bit in the first header byte.
const CMD_BIT: u8 = 0x80;

/// Wire identity of a file: name, size and modification time (seconds
/// since the Unix epoch). Transfer acknowledgments and retries match on
/// all three components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    /// File name as offered by the sender.
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} size {} mtime {}", self.name, self.size, self.mtime)
    }
}

/// The parameters of a FILE offer.
///
/// Trailing tokens after the offset are classified per token: anything that
/// parses as base-16 `u32` is the CRC, everything else is an opaque option
/// flag (`BZ2` and friends), preserved but never acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// Identity of the offered file.
    pub id: FileId,
    /// Byte offset transmission starts from.
    pub offset: u64,
    /// CRC-32 of the file contents, 0 when not supplied.
    pub crc: u32,
    /// Unrecognized option flags, kept verbatim.
    pub flags: Vec<String>,
}

/// A decoded BinkP frame: raw data or one of the eleven commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Uninterpreted bytes, usually file contents.
    Data(Vec<u8>),
    /// Informational text for the remote operator.
    Nul(String),
    /// Protocol options, carried inside a NUL frame with an `OPT ` prefix.
    Opt(Vec<String>),
    /// Addresses the peer speaks for.
    Adr(Vec<Address>),
    /// Password or CRAM response.
    Pwd(String),
    /// Offer to transfer a file.
    File(FileOffer),
    /// Authentication succeeded.
    Ok(String),
    /// No more files will be sent in this direction.
    Eob,
    /// The peer received a file completely.
    Got(FileId),
    /// Fatal error; terminates the session.
    Err(String),
    /// The peer is busy; try again later.
    Bsy(String),
    /// Request to restart a file from an offset.
    Get {
        /// Identity of the requested file.
        id: FileId,
        /// Offset to resume from.
        offset: u64,
    },
    /// Request to omit a file from this session.
    Skip(FileId),
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The header declared a zero-length payload.
    #[error("invalid empty frame")]
    Empty,
    /// Fewer bytes were supplied than the header declared.
    #[error("truncated frame")]
    Truncated,
    /// The payload does not fit the 15-bit length field.
    #[error("frame payload of {0} bytes exceeds {MAX_FRAME_SIZE}")]
    TooLong(usize),
    /// A command frame carried an opcode outside 0..=10.
    #[error("invalid command frame type {0}")]
    UnknownCommand(u8),
    /// An ADR payload contained an unparseable address.
    #[error(transparent)]
    Address(#[from] AddressError),
    /// A command payload failed positional-field parsing.
    #[error("{cmd} decode failed: {text:?}")]
    Malformed {
        /// Command mnemonic, for diagnostics.
        cmd: &'static str,
        /// The offending payload text.
        text: String,
    },
}

impl Frame {
    /// Builds the OPT frame advertising a CRAM challenge.
    #[must_use]
    pub fn challenge(hash: &str, hex: &str) -> Self {
        Self::Opt(vec![format!("CRAM-{hash}-{hex}")])
    }

    /// Builds the PWD frame carrying a CRAM response.
    #[must_use]
    pub fn cram_response(hash: &str, hex: &str) -> Self {
        Self::Pwd(format!("CRAM-{hash}-{hex}"))
    }

    /// Short mnemonic for log lines.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "DATA",
            Self::Nul(_) => "NUL",
            Self::Opt(_) => "OPT",
            Self::Adr(_) => "ADR",
            Self::Pwd(_) => "PWD",
            Self::File(_) => "FILE",
            Self::Ok(_) => "OK",
            Self::Eob => "EOB",
            Self::Got(_) => "GOT",
            Self::Err(_) => "ERR",
            Self::Bsy(_) => "BSY",
            Self::Get { .. } => "GET",
            Self::Skip(_) => "SKIP",
        }
    }

    /// Decodes a complete wire frame (header plus payload).
    ///
    /// Returns `Ok(None)` for a frame that is recognized but unusable and
    /// should simply be skipped; see [`Frame::decode_body`].
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when the header or payload is malformed.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>, FrameError> {
        if bytes.len() < 2 {
            return Err(FrameError::Truncated);
        }
        let is_command = bytes[0] & CMD_BIT != 0;
        let length = usize::from(bytes[0] & 0x7f) << 8 | usize::from(bytes[1]);
        if length == 0 {
            return Err(FrameError::Empty);
        }
        if bytes.len() - 2 < length {
            return Err(FrameError::Truncated);
        }
        Self::decode_body(is_command, &bytes[2..2 + length])
    }

    /// Decodes a frame payload whose header has already been consumed.
    ///
    /// Returns `Ok(None)` when the frame should be silently skipped: the
    /// only such case today is an informational NUL whose text is not valid
    /// UTF-8, which carries nothing the protocol needs. Load-bearing
    /// commands are converted lossily instead so their numeric fields decide
    /// validity.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] for an empty payload, an unknown opcode, or a
    /// payload that fails positional-field parsing.
    pub fn decode_body(is_command: bool, payload: &[u8]) -> Result<Option<Self>, FrameError> {
        if payload.is_empty() {
            return Err(FrameError::Empty);
        }
        if !is_command {
            return Ok(Some(Self::Data(payload.to_vec())));
        }
        let opcode = payload[0];
        let data = &payload[1..];
        let frame = match opcode {
            CMD_NUL => {
                if std::str::from_utf8(data).is_err() {
                    return Ok(None);
                }
                decode_nul(data)
            }
            CMD_ADR => decode_adr(data)?,
            CMD_PWD => Self::Pwd(text_of(data)),
            CMD_FILE => decode_file(data)?,
            CMD_OK => Self::Ok(text_of(data)),
            CMD_EOB => Self::Eob,
            CMD_GOT => Self::Got(decode_file_id("GOT", data)?),
            CMD_ERR => Self::Err(text_of(data)),
            CMD_BSY => Self::Bsy(text_of(data)),
            CMD_GET => decode_get(data)?,
            CMD_SKIP => Self::Skip(decode_file_id("SKIP", data)?),
            other => return Err(FrameError::UnknownCommand(other)),
        };
        Ok(Some(frame))
    }

    /// Encodes this frame into its complete wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLong`] when the payload exceeds
    /// [`MAX_FRAME_SIZE`] and [`FrameError::Empty`] for an empty data frame.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if let Self::Data(data) = self {
            if data.is_empty() {
                return Err(FrameError::Empty);
            }
            let mut out = Vec::with_capacity(2 + data.len());
            out.extend_from_slice(&header(false, data.len())?);
            out.extend_from_slice(data);
            return Ok(out);
        }

        let (opcode, text) = self.command_text();
        let length = 1 + text.len();
        let mut out = Vec::with_capacity(2 + length);
        out.extend_from_slice(&header(true, length)?);
        out.push(opcode);
        out.extend_from_slice(text.as_bytes());
        Ok(out)
    }

    /// Opcode and payload text for a command frame.
    fn command_text(&self) -> (u8, String) {
        match self {
            Self::Data(_) => unreachable!("data frames are encoded separately"),
            Self::Nul(text) => (CMD_NUL, text.clone()),
            Self::Opt(options) => {
                let mut text = "OPT".to_string();
                for option in options {
                    text.push(' ');
                    text.push_str(option);
                }
                (CMD_NUL, text)
            }
            Self::Adr(addrs) => {
                let rendered: Vec<String> = addrs.iter().map(ToString::to_string).collect();
                (CMD_ADR, rendered.join(" "))
            }
            Self::Pwd(password) => (CMD_PWD, password.clone()),
            Self::File(offer) => {
                let mut text = format!(
                    "{} {} {} {}",
                    offer.id.name, offer.id.size, offer.id.mtime, offer.offset
                );
                if offer.crc != 0 {
                    text.push_str(&format!(" {:x}", offer.crc));
                } else {
                    for flag in &offer.flags {
                        text.push(' ');
                        text.push_str(flag);
                    }
                }
                (CMD_FILE, text)
            }
            Self::Ok(text) => (CMD_OK, text.clone()),
            Self::Eob => (CMD_EOB, String::new()),
            Self::Got(id) => (CMD_GOT, format!("{} {} {}", id.name, id.size, id.mtime)),
            Self::Err(text) => (CMD_ERR, text.clone()),
            Self::Bsy(text) => (CMD_BSY, text.clone()),
            Self::Get { id, offset } => (
                CMD_GET,
                format!("{} {} {} {}", id.name, id.size, id.mtime, offset),
            ),
            Self::Skip(id) => (CMD_SKIP, format!("{} {} {}", id.name, id.size, id.mtime)),
        }
    }
}

fn header(is_command: bool, length: usize) -> Result<[u8; 2], FrameError> {
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLong(length));
    }
    let mut first = (length >> 8) as u8;
    if is_command {
        first |= CMD_BIT;
    }
    Ok([first, length as u8])
}

/// Converts command payload bytes to text: lossy UTF-8, NUL terminators
/// stripped from the right, surrounding whitespace trimmed.
fn text_of(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

fn decode_nul(data: &[u8]) -> Frame {
    let text = text_of(data);
    if let Some(rest) = text.strip_prefix("OPT ") {
        return Frame::Opt(rest.split_whitespace().map(str::to_string).collect());
    }
    Frame::Nul(text)
}

fn decode_adr(data: &[u8]) -> Result<Frame, FrameError> {
    let text = text_of(data);
    let addrs = text
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<Vec<Address>, _>>()?;
    Ok(Frame::Adr(addrs))
}

fn decode_file(data: &[u8]) -> Result<Frame, FrameError> {
    let text = text_of(data);
    let malformed = || FrameError::Malformed { cmd: "FILE", text: text.clone() };
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(malformed());
    }
    let id = file_id_from_fields("FILE", &text, &fields[..3])?;
    let offset = fields[3].parse().map_err(|_| malformed())?;
    let mut crc = 0;
    let mut flags = Vec::new();
    for token in &fields[4..] {
        match u32::from_str_radix(token, 16) {
            Ok(value) => crc = value,
            Err(_) => flags.push((*token).to_string()),
        }
    }
    Ok(Frame::File(FileOffer { id, offset, crc, flags }))
}

fn decode_get(data: &[u8]) -> Result<Frame, FrameError> {
    let text = text_of(data);
    let malformed = || FrameError::Malformed { cmd: "GET", text: text.clone() };
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(malformed());
    }
    let id = file_id_from_fields("GET", &text, &fields[..3])?;
    let offset = fields[3].parse().map_err(|_| malformed())?;
    Ok(Frame::Get { id, offset })
}

fn decode_file_id(cmd: &'static str, data: &[u8]) -> Result<FileId, FrameError> {
    let text = text_of(data);
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(FrameError::Malformed { cmd, text: text.clone() });
    }
    file_id_from_fields(cmd, &text, &fields)
}

fn file_id_from_fields(
    cmd: &'static str,
    text: &str,
    fields: &[&str],
) -> Result<FileId, FrameError> {
    let malformed = || FrameError::Malformed { cmd, text: text.to_string() };
    Ok(FileId {
        name: fields[0].to_string(),
        size: fields[1].parse().map_err(|_| malformed())?,
        mtime: fields[2].parse().map_err(|_| malformed())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_frame(opcode: u8, text: &str) -> Vec<u8> {
        let length = 1 + text.len();
        let mut bytes = vec![0x80 | (length >> 8) as u8, length as u8, opcode];
        bytes.extend_from_slice(text.as_bytes());
        bytes
    }

    #[test]
    fn nul_frame_round_trips_bit_for_bit() {
        let bytes = [0x80, 0x06, 0x00, b'H', b'e', b'l', b'l', b'o'];
        let frame = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::Nul("Hello".to_string()));
        assert_eq!(frame.encode().unwrap(), bytes);
    }

    #[test]
    fn data_frame_carries_raw_bytes() {
        let bytes = [0x00, 0x05, b'H', b'e', b'l', b'l', b'o'];
        let frame = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::Data(b"Hello".to_vec()));
        assert_eq!(frame.encode().unwrap(), bytes);
    }

    #[test]
    fn adr_tolerates_padding_and_nuls() {
        let bytes = command_frame(
            CMD_ADR,
            "  21:1/100@fsxnet 21:1/3@fsxnet   21:1/0@fsxnet \x00\x00",
        );
        let frame = Frame::parse(&bytes).unwrap().unwrap();
        let Frame::Adr(addrs) = frame else {
            panic!("expected ADR, got {frame:?}");
        };
        let rendered: Vec<String> = addrs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["21:1/100@fsxnet", "21:1/3@fsxnet", "21:1/0@fsxnet"]);
    }

    #[test]
    fn adr_with_bad_address_is_rejected() {
        let bytes = command_frame(CMD_ADR, "21:1/100@fsxnet not-an-address");
        assert!(matches!(
            Frame::parse(&bytes),
            Err(FrameError::Address(_))
        ));
    }

    #[test]
    fn opt_is_split_out_of_nul() {
        let bytes = command_frame(CMD_NUL, "OPT CRAM-MD5-deadcafe EXTCMD");
        let frame = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Opt(vec!["CRAM-MD5-deadcafe".to_string(), "EXTCMD".to_string()])
        );
    }

    #[test]
    fn bare_opt_prefix_stays_informational() {
        let bytes = command_frame(CMD_NUL, "OPT");
        let frame = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::Nul("OPT".to_string()));
    }

    #[test]
    fn pwd_round_trips() {
        let bytes = command_frame(CMD_PWD, "CRAM-md5-deadcafe");
        let frame = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::Pwd("CRAM-md5-deadcafe".to_string()));
        assert_eq!(frame.encode().unwrap(), bytes);
    }

    #[test]
    fn file_without_trailing_tokens() {
        let bytes = command_frame(CMD_FILE, "foo.txt 1234 100 2");
        let frame = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::File(FileOffer {
                id: FileId { name: "foo.txt".to_string(), size: 1234, mtime: 100 },
                offset: 2,
                crc: 0,
                flags: vec![],
            })
        );
        assert_eq!(frame.encode().unwrap(), bytes);
    }

    #[test]
    fn file_trailing_hex_token_is_crc() {
        let bytes = command_frame(CMD_FILE, "foo.txt 1234 100 2 cafef00d");
        let Frame::File(offer) = Frame::parse(&bytes).unwrap().unwrap() else {
            panic!("expected FILE");
        };
        assert_eq!(offer.crc, 0xcafe_f00d);
        assert!(offer.flags.is_empty());
    }

    #[test]
    fn file_trailing_non_hex_token_is_flag() {
        let bytes = command_frame(CMD_FILE, "foo.txt 1234 100 2 BZ2");
        let Frame::File(offer) = Frame::parse(&bytes).unwrap().unwrap() else {
            panic!("expected FILE");
        };
        assert_eq!(offer.crc, 0);
        assert_eq!(offer.flags, ["BZ2"]);
    }

    #[test]
    fn file_crc_and_flag_together() {
        let bytes = command_frame(CMD_FILE, "foo.txt 1234 100 2 deadf00d BZ2");
        let Frame::File(offer) = Frame::parse(&bytes).unwrap().unwrap() else {
            panic!("expected FILE");
        };
        assert_eq!(offer.crc, 0xdead_f00d);
        assert_eq!(offer.flags, ["BZ2"]);
    }

    #[test]
    fn file_crc_encodes_as_hex() {
        let frame = Frame::File(FileOffer {
            id: FileId { name: "foo.txt".to_string(), size: 1234, mtime: 100 },
            offset: 0,
            crc: 0xcafe_f00d,
            flags: vec!["BZ2".to_string()],
        });
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[3..], b"foo.txt 1234 100 0 cafef00d".as_slice());
    }

    #[test]
    fn file_with_too_few_fields_is_rejected() {
        let bytes = command_frame(CMD_FILE, "foo.txt 1234 100");
        assert!(matches!(
            Frame::parse(&bytes),
            Err(FrameError::Malformed { cmd: "FILE", .. })
        ));
    }

    #[test]
    fn got_get_skip_parse_their_fields() {
        let id = FileId { name: "foo.txt".to_string(), size: 1234, mtime: 100 };

        let got = Frame::parse(&command_frame(CMD_GOT, "foo.txt 1234 100"))
            .unwrap()
            .unwrap();
        assert_eq!(got, Frame::Got(id.clone()));

        let get = Frame::parse(&command_frame(CMD_GET, "foo.txt 1234 100 512"))
            .unwrap()
            .unwrap();
        assert_eq!(get, Frame::Get { id: id.clone(), offset: 512 });

        let skip = Frame::parse(&command_frame(CMD_SKIP, "foo.txt 1234 100"))
            .unwrap()
            .unwrap();
        assert_eq!(skip, Frame::Skip(id));
    }

    #[test]
    fn got_with_wrong_field_count_is_rejected() {
        let bytes = command_frame(CMD_GOT, "foo.txt 1234");
        assert!(matches!(
            Frame::parse(&bytes),
            Err(FrameError::Malformed { cmd: "GOT", .. })
        ));
    }

    #[test]
    fn eob_round_trips() {
        let frame = Frame::Eob;
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes, [0x80, 0x01, CMD_EOB]);
        assert_eq!(Frame::parse(&bytes).unwrap().unwrap(), Frame::Eob);
    }

    #[test]
    fn empty_frames_are_rejected() {
        assert_eq!(Frame::parse(&[0x00, 0x00]), Err(FrameError::Empty));
        assert_eq!(Frame::parse(&[0x80, 0x00]), Err(FrameError::Empty));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert_eq!(Frame::parse(&[0x80]), Err(FrameError::Truncated));
        assert_eq!(Frame::parse(&[0x80, 0x05, CMD_NUL, b'a']), Err(FrameError::Truncated));
    }

    #[test]
    fn every_unknown_opcode_is_rejected() {
        for opcode in 11..=255u8 {
            assert_eq!(
                Frame::parse(&[0x80, 0x01, opcode]),
                Err(FrameError::UnknownCommand(opcode)),
                "opcode {opcode}"
            );
        }
    }

    #[test]
    fn oversized_payload_fails_to_encode() {
        let frame = Frame::Data(vec![0u8; MAX_FRAME_SIZE + 1]);
        assert_eq!(frame.encode(), Err(FrameError::TooLong(MAX_FRAME_SIZE + 1)));

        let frame = Frame::Nul("x".repeat(MAX_FRAME_SIZE));
        assert_eq!(frame.encode(), Err(FrameError::TooLong(MAX_FRAME_SIZE + 1)));
    }

    #[test]
    fn empty_data_frame_fails_to_encode() {
        assert_eq!(Frame::Data(vec![]).encode(), Err(FrameError::Empty));
    }

    #[test]
    fn non_utf8_informational_nul_is_skipped() {
        let bytes = [0x80, 0x03, CMD_NUL, 0xff, 0xfe];
        assert_eq!(Frame::parse(&bytes), Ok(None));
    }

    #[test]
    fn non_utf8_err_text_is_still_delivered() {
        let bytes = [0x80, 0x03, CMD_ERR, 0xff, b'x'];
        let frame = Frame::parse(&bytes).unwrap().unwrap();
        assert!(matches!(frame, Frame::Err(_)));
    }
}
