// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framed transport client.
//!
//! One request in flight at a time: `call` writes a sealed frame and then
//! reads exactly one response frame before returning. The transport is any
//! ordered reliable byte pipe (`Read + Write`); timeouts are its business
//! and surface here as I/O errors, at which point the session is dead —
//! callers drop the client rather than resynchronize.

use std::fmt;
use std::io::{Read, Write};

use num_traits::FromPrimitive;
use zerocopy::FromBytes;

use wire::{
    Command, ErrorResponse, FrameHeader, FrameKind, InfoResponse,
    CHECKSUM_SIZE, FRAME_OVERHEAD, HEADER_SIZE, MAGIC, MAX_PAYLOAD,
    PROTOCOL_MAJOR, PROTOCOL_MINOR,
};

#[derive(Debug)]
pub enum ProtoError {
    Io(std::io::Error),
    /// Response didn't start with the magic bytes; the stream is
    /// desynchronized.
    BadMagic,
    /// Advertised payload length over the protocol maximum.
    TooLong(u32),
    BadChecksum { expected: u16, got: u16 },
    /// Response carried a different command id than the request.
    Mismatch { sent: u8, got: u8 },
    /// Response kind byte was neither ok nor error.
    NotAResponse(u8),
    /// OK response payload too short for its fixed record.
    ShortPayload { command: u8, len: usize },
    /// The device answered with an error frame.
    Device { command: u8, code: u32 },
    /// Incompatible protocol major version; connection refused.
    VersionMismatch { device_major: u8 },
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::Io(e) => write!(f, "transport: {e}"),
            ProtoError::BadMagic => write!(f, "response out of sync (bad magic)"),
            ProtoError::TooLong(len) => {
                write!(f, "response payload of {len} bytes exceeds the protocol maximum")
            }
            ProtoError::BadChecksum { expected, got } => write!(
                f,
                "response checksum {got:#06x} != computed {expected:#06x}"
            ),
            ProtoError::Mismatch { sent, got } => write!(
                f,
                "response for command {got:#04x} while {sent:#04x} was in flight"
            ),
            ProtoError::NotAResponse(kind) => {
                write!(f, "frame kind {kind:#04x} is not a response")
            }
            ProtoError::ShortPayload { command, len } => write!(
                f,
                "command {command:#04x}: {len}-byte payload too short"
            ),
            ProtoError::Device { command, code } => write!(
                f,
                "device rejected command {command:#04x} with error {code:#x}"
            ),
            ProtoError::VersionMismatch { device_major } => write!(
                f,
                "device speaks protocol {device_major}.x, host speaks {PROTOCOL_MAJOR}.{PROTOCOL_MINOR}"
            ),
        }
    }
}

impl std::error::Error for ProtoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtoError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        ProtoError::Io(e)
    }
}

/// What get-info said about the other end.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub max_payload: u32,
    pub cache_line: u32,
    pub max_allocations: u32,
    pub firmware_version: String,
}

pub struct Client<T> {
    io: T,
}

impl<T: Read + Write> Client<T> {
    pub fn new(io: T) -> Self {
        Self { io }
    }

    /// Issues one request and reads its response payload. Error frames
    /// come back as [`ProtoError::Device`].
    pub fn call(
        &mut self,
        command: Command,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtoError> {
        let mut frame = vec![0u8; payload.len() + FRAME_OVERHEAD];
        let n = wire::emit_frame(
            &mut frame,
            command as u8,
            FrameKind::Request,
            payload,
        )
        .map_err(|_| ProtoError::TooLong(payload.len() as u32))?;
        self.io.write_all(&frame[..n])?;
        self.io.flush()?;
        self.read_response(command as u8)
    }

    fn read_response(&mut self, sent: u8) -> Result<Vec<u8>, ProtoError> {
        let mut header = [0u8; HEADER_SIZE];
        self.io.read_exact(&mut header)?;
        let h = FrameHeader::read_from_bytes(&header[..]).unwrap();
        if h.magic != MAGIC {
            return Err(ProtoError::BadMagic);
        }
        let len = h.len.get();
        if len as usize > MAX_PAYLOAD {
            return Err(ProtoError::TooLong(len));
        }

        let mut payload = vec![0u8; len as usize];
        self.io.read_exact(&mut payload)?;
        let mut csum = [0u8; CHECKSUM_SIZE];
        self.io.read_exact(&mut csum)?;

        let got = u16::from_le_bytes(csum);
        let expected = wire::checksum(&header, &payload);
        if got != expected {
            return Err(ProtoError::BadChecksum { expected, got });
        }
        if h.command != sent {
            return Err(ProtoError::Mismatch {
                sent,
                got: h.command,
            });
        }
        match FrameKind::from_u8(h.kind) {
            Some(FrameKind::Ok) => Ok(payload),
            Some(FrameKind::Error) => {
                let code = ErrorResponse::read_from_bytes(&payload[..])
                    .map(|e| e.code.get())
                    .unwrap_or(0);
                Err(ProtoError::Device {
                    command: sent,
                    code,
                })
            }
            _ => Err(ProtoError::NotAResponse(h.kind)),
        }
    }

    /// Version handshake: get-info, refuse on a major mismatch.
    pub fn hello(&mut self) -> Result<DeviceInfo, ProtoError> {
        let payload = self.call(Command::GetInfo, &[])?;
        let info = InfoResponse::read_from_bytes(&payload[..]).map_err(|_| {
            ProtoError::ShortPayload {
                command: Command::GetInfo as u8,
                len: payload.len(),
            }
        })?;
        if info.protocol_major != PROTOCOL_MAJOR {
            return Err(ProtoError::VersionMismatch {
                device_major: info.protocol_major,
            });
        }

        let version = &info.firmware_version;
        let end = version.iter().position(|&b| b == 0).unwrap_or(version.len());
        Ok(DeviceInfo {
            protocol_major: info.protocol_major,
            protocol_minor: info.protocol_minor,
            max_payload: info.max_payload.get(),
            cache_line: info.cache_line.get(),
            max_allocations: info.max_allocations.get(),
            firmware_version: String::from_utf8_lossy(&version[..end])
                .into_owned(),
        })
    }
}
