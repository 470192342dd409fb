//! Message bodies of the PakBus control (PakCtrl) and application
//! (BMP5) protocols.
//!
//! A message body starts with its type code and the transaction number
//! that ties a response to the command that caused it; the rest of the
//! body is a fixed layout per type, decoded with the
//! [`types`](crate::types) codec.

use bitmatch::bitmatch;
use log::warn;

use crate::error::Result;
use crate::header;
use crate::types::{NSec, Reader, Writer};

/// PakCtrl hello command, sent to ring a node.
pub const HELLO_CMD: u8 = 0x09;
/// PakCtrl hello response.
pub const HELLO_RESPONSE: u8 = 0x89;
/// PakCtrl delivery failure notification.
pub const FAILURE: u8 = 0x81;
/// PakCtrl get-settings command.
pub const GETSETTINGS_CMD: u8 = 0x0F;
/// PakCtrl get-settings response.
pub const GETSETTINGS_RESPONSE: u8 = 0x8F;
/// PakCtrl bye command.
pub const BYE_CMD: u8 = 0x0D;

/// BMP5 collect-data command.
pub const COLLECTDATA_CMD: u8 = 0x09;
/// BMP5 collect-data response.
pub const COLLECTDATA_RESPONSE: u8 = 0x89;
/// BMP5 clock command.
pub const CLOCK_CMD: u8 = 0x17;
/// BMP5 clock response.
pub const CLOCK_RESPONSE: u8 = 0x97;
/// BMP5 get-programming-statistics command.
pub const GETPROGSTAT_CMD: u8 = 0x18;
/// BMP5 get-programming-statistics response.
pub const GETPROGSTAT_RESPONSE: u8 = 0x98;
/// BMP5 file-upload command.
pub const FILEUPLOAD_CMD: u8 = 0x1D;
/// BMP5 file-upload response.
pub const FILEUPLOAD_RESPONSE: u8 = 0x9D;
/// BMP5 please-wait notification.
pub const PLEASE_WAIT: u8 = 0xA1;

/// Hello command or response body.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hello {
    pub tran_nbr: u8,
    pub is_router: bool,
    pub hop_metric: u8,
    /// Link verification interval in seconds.
    pub verify_interval: u16,
}

/// One entry of the device settings block.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Setting {
    pub id: u16,
    pub large_value: bool,
    pub read_only: bool,
    /// Raw value bytes; the meaning depends on the setting id.
    pub value: Vec<u8>,
}

/// Get-settings response body.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SettingsResponse {
    pub tran_nbr: u8,
    pub outcome: u8,
    /// Device identification and settings, present when the outcome
    /// byte reports success.
    pub report: Option<SettingsReport>,
}

/// Successful part of a get-settings response.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SettingsReport {
    pub device_type: u16,
    pub major_version: u8,
    pub minor_version: u8,
    pub more_settings: u8,
    pub settings: Vec<Setting>,
}

/// Clock response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClockResponse {
    pub tran_nbr: u8,
    pub resp_code: u8,
    /// Device time before any adjustment carried by the command was
    /// applied.
    pub time: NSec,
}

/// Programming statistics record.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgStats {
    pub os_version: String,
    pub os_signature: u16,
    pub serial_number: String,
    pub power_up_program: String,
    pub compile_state: u8,
    pub program_name: String,
    pub program_signature: u16,
    pub compile_time: NSec,
    pub compile_result: String,
}

/// Get-programming-statistics response body.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgStatsResponse {
    pub tran_nbr: u8,
    pub resp_code: u8,
    /// Present when the response code reports success.
    pub stats: Option<ProgStats>,
}

/// File-upload response body.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileUploadResponse {
    pub tran_nbr: u8,
    pub resp_code: u8,
    /// Offset into the file of the first byte of `data`.
    pub file_offset: u32,
    pub data: Vec<u8>,
}

/// Collect-data response body. The record data stays raw here; it can
/// only be interpreted against the table definitions (see
/// [`collect`](crate::collect)).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CollectDataResponse {
    pub tran_nbr: u8,
    pub resp_code: u8,
    pub data: Vec<u8>,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Incoming hello probe from the peer; must be answered.
    HelloCmd(Hello),
    HelloResponse(Hello),
    /// The peer could not deliver our command.
    Failure { tran_nbr: u8, code: u8 },
    Settings(SettingsResponse),
    Clock(ClockResponse),
    ProgStats(ProgStatsResponse),
    FileUpload(FileUploadResponse),
    CollectData(CollectDataResponse),
    /// Back-pressure: the command will take a while, wait and keep
    /// listening.
    PleaseWait {
        tran_nbr: u8,
        /// Message type of the command being delayed.
        cmd_msg_type: u8,
        wait_secs: u16,
    },
    /// A protocol/message-type pair this crate has no handler for; the
    /// body is kept raw.
    Unsupported {
        hi_proto: u8,
        msg_type: u8,
        tran_nbr: u8,
        raw: Vec<u8>,
    },
}

impl Message {
    /// The transaction number the message belongs to.
    pub fn tran_nbr(&self) -> u8 {
        match self {
            Message::HelloCmd(m) | Message::HelloResponse(m) => m.tran_nbr,
            Message::Failure { tran_nbr, .. } => *tran_nbr,
            Message::Settings(m) => m.tran_nbr,
            Message::Clock(m) => m.tran_nbr,
            Message::ProgStats(m) => m.tran_nbr,
            Message::FileUpload(m) => m.tran_nbr,
            Message::CollectData(m) => m.tran_nbr,
            Message::PleaseWait { tran_nbr, .. } => *tran_nbr,
            Message::Unsupported { tran_nbr, .. } => *tran_nbr,
        }
    }

    /// Decodes a message body (the packet after its 8-byte header).
    /// Trailing bytes beyond a fixed layout are ignored.
    pub fn parse(hi_proto: u8, body: &[u8]) -> Result<Message> {
        let mut r = Reader::new(body);
        let msg_type = r.pop_u8()?;
        let tran_nbr = r.pop_u8()?;

        Ok(match (hi_proto, msg_type) {
            (header::PAKCTRL, HELLO_CMD) => Message::HelloCmd(parse_hello(tran_nbr, &mut r)?),
            (header::PAKCTRL, HELLO_RESPONSE) => {
                Message::HelloResponse(parse_hello(tran_nbr, &mut r)?)
            }
            (header::PAKCTRL, FAILURE) => Message::Failure {
                tran_nbr,
                code: r.pop_u8()?,
            },
            (header::PAKCTRL, GETSETTINGS_RESPONSE) => {
                Message::Settings(parse_settings(tran_nbr, &mut r)?)
            }
            (header::BMP5, COLLECTDATA_RESPONSE) => Message::CollectData(CollectDataResponse {
                tran_nbr,
                resp_code: r.pop_u8()?,
                data: r.take_rest().to_vec(),
            }),
            (header::BMP5, CLOCK_RESPONSE) => Message::Clock(ClockResponse {
                tran_nbr,
                resp_code: r.pop_u8()?,
                time: r.pop_nsec()?,
            }),
            (header::BMP5, GETPROGSTAT_RESPONSE) => {
                Message::ProgStats(parse_progstats(tran_nbr, &mut r)?)
            }
            (header::BMP5, FILEUPLOAD_RESPONSE) => Message::FileUpload(FileUploadResponse {
                tran_nbr,
                resp_code: r.pop_u8()?,
                file_offset: r.pop_u32_be()?,
                data: r.take_rest().to_vec(),
            }),
            (header::BMP5, PLEASE_WAIT) => Message::PleaseWait {
                tran_nbr,
                cmd_msg_type: r.pop_u8()?,
                wait_secs: r.pop_u16_be()?,
            },
            (hi_proto, msg_type) => {
                warn!(
                    "no handler for protocol {:#03x} message type {:#04x}",
                    hi_proto, msg_type
                );
                Message::Unsupported {
                    hi_proto,
                    msg_type,
                    tran_nbr,
                    raw: r.take_rest().to_vec(),
                }
            }
        })
    }
}

fn parse_hello(tran_nbr: u8, r: &mut Reader) -> Result<Hello> {
    Ok(Hello {
        tran_nbr,
        is_router: r.pop_u8()? != 0,
        hop_metric: r.pop_u8()?,
        verify_interval: r.pop_u16_be()?,
    })
}

#[bitmatch]
fn parse_settings(tran_nbr: u8, rd: &mut Reader) -> Result<SettingsResponse> {
    let outcome = rd.pop_u8()?;
    if outcome != 0x01 {
        return Ok(SettingsResponse {
            tran_nbr,
            outcome,
            report: None,
        });
    }

    let device_type = rd.pop_u16_be()?;
    let major_version = rd.pop_u8()?;
    let minor_version = rd.pop_u8()?;
    let more_settings = rd.pop_u8()?;

    let mut settings = Vec::new();
    while !rd.is_empty() {
        let id = rd.pop_u16_be()?;
        if rd.is_empty() {
            break;
        }
        #[bitmatch]
        let "lrnn_nnnn_nnnn_nnnn" = rd.pop_u16_be()?;
        settings.push(Setting {
            id,
            large_value: l != 0,
            read_only: r != 0,
            value: rd.pop_bytes(n as usize)?,
        });
    }

    Ok(SettingsResponse {
        tran_nbr,
        outcome,
        report: Some(SettingsReport {
            device_type,
            major_version,
            minor_version,
            more_settings,
            settings,
        }),
    })
}

fn parse_progstats(tran_nbr: u8, r: &mut Reader) -> Result<ProgStatsResponse> {
    let resp_code = r.pop_u8()?;
    if resp_code != 0 {
        return Ok(ProgStatsResponse {
            tran_nbr,
            resp_code,
            stats: None,
        });
    }

    let stats = ProgStats {
        os_version: r.pop_asciiz()?,
        os_signature: r.pop_u16_be()?,
        serial_number: r.pop_asciiz()?,
        power_up_program: r.pop_asciiz()?,
        compile_state: r.pop_u8()?,
        program_name: r.pop_asciiz()?,
        program_signature: r.pop_u16_be()?,
        compile_time: r.pop_nsec()?,
        compile_result: r.pop_asciiz()?,
    };
    Ok(ProgStatsResponse {
        tran_nbr,
        resp_code,
        stats: Some(stats),
    })
}

/// Collection window of a collect-data command. The variant selects
/// the mode code and how the two parameter slots are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CollectMode {
    /// Everything the table currently holds (mode 0x03).
    All,
    /// A record number and everything stored after it (mode 0x04).
    FromRecord(u32),
    /// The most recently stored `n` records (mode 0x05).
    MostRecent(u32),
    /// A record number range (mode 0x06).
    RecordRange(u32, u32),
    /// Records stamped inside a time window (mode 0x07).
    TimeRange(NSec, NSec),
    /// A byte range of one record, for records larger than a packet
    /// (mode 0x08).
    PartialRecord(u32, u32),
}

impl CollectMode {
    /// The wire mode code.
    pub fn code(&self) -> u8 {
        match self {
            CollectMode::All => 0x03,
            CollectMode::FromRecord(_) => 0x04,
            CollectMode::MostRecent(_) => 0x05,
            CollectMode::RecordRange(..) => 0x06,
            CollectMode::TimeRange(..) => 0x07,
            CollectMode::PartialRecord(..) => 0x08,
        }
    }

    /// Appends the P1/P2 parameter slots in the encoding the mode
    /// calls for.
    pub(crate) fn encode_params(&self, w: &mut Writer) {
        match *self {
            CollectMode::All => {}
            CollectMode::FromRecord(p1) | CollectMode::MostRecent(p1) => {
                w.put_u32_be(p1);
            }
            CollectMode::RecordRange(p1, p2) | CollectMode::PartialRecord(p1, p2) => {
                w.put_u32_be(p1).put_u32_be(p2);
            }
            CollectMode::TimeRange(p1, p2) => {
                w.put_nsec(p1).put_nsec(p2);
            }
        }
    }
}
