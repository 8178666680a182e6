// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire ABI shared between the host driver and the on-device loader server.
//!
//! Everything that crosses the serial link is defined here: the frame
//! header, the command set, the request/response payload records, the
//! additive checksum, and the layout constants of the argument frame. Both
//! sides depend on this crate, so a change here is by definition a protocol
//! change and must be reflected in [`PROTOCOL_MAJOR`]/[`PROTOCOL_MINOR`].
//!
//! All multi-byte fields are little-endian, expressed through
//! `zerocopy::little_endian` integer types so the structs can be
//! reinterpreted directly over RX/TX buffer bytes without alignment or
//! endianness hazards.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

// Both sides build payload records out of these; re-export so they don't
// need their own zerocopy import just for the integer types.
pub use zerocopy::little_endian;

/// Frame synchronization bytes, in on-wire order.
pub const MAGIC: [u8; 2] = [0xA5, 0x5A];

/// Protocol version. A major mismatch is incompatible; minor bumps are
/// additive (new commands, new flag bits).
pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;

/// Largest payload either side will put in a single frame. The device sizes
/// its RX/TX buffers from this, and reports it in [`InfoResponse`] so the
/// host can chunk uploads accordingly.
pub const MAX_PAYLOAD: usize = 128 * 1024;

/// Fixed per-frame overhead: header plus trailing checksum.
pub const HEADER_SIZE: usize = 8;
pub const CHECKSUM_SIZE: usize = 2;
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// Argument frame geometry. Slot `i` carries argument `i`; the final slot
/// carries the return value. This is load-bearing ABI between the generated
/// wrapper and the host marshaller — changing it changes the wire ABI.
pub const ARG_SLOTS: usize = 32;
pub const SLOT_SIZE: usize = 4;
pub const ARG_AREA_SIZE: usize = ARG_SLOTS * SLOT_SIZE;
pub const RETURN_SLOT: usize = ARG_SLOTS - 1;
pub const MAX_ARGS: usize = ARG_SLOTS - 1;

/// Symbol name of the generated entry shim. The device is only ever asked
/// to execute this symbol's address.
pub const ENTRY_NAME: &str = "call_remote";

/// Capability bits passed through to the device allocator. The region and
/// permission split mirrors the target heap's capability scheme.
pub const CAP_EXEC: u32 = 1 << 0;
pub const CAP_DMA: u32 = 1 << 1;
pub const CAP_BYTE_ACCESSIBLE: u32 = 1 << 2;
pub const CAP_EXTERNAL: u32 = 1 << 3;
pub const CAP_INTERNAL: u32 = 1 << 4;

/// `flags` bit 0 on write/read requests: skip the allocation-table bounds
/// check. Narrow escape hatch for access to memory owned by other firmware
/// subsystems; everything the loader itself allocates is checked.
pub const MEM_SKIP_BOUNDS: u8 = 1 << 0;

/// Frame direction/disposition, carried in the header `kind` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0x00,
    Ok = 0x01,
    Error = 0x02,
}

/// Command identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    Ping = 0x01,
    GetInfo = 0x02,
    Alloc = 0x10,
    Free = 0x11,
    WriteMem = 0x20,
    ReadMem = 0x21,
    Execute = 0x30,
    HeapInfo = 0x40,
}

/// Error codes carried in an [`FrameKind::Error`] response payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum ResponseCode {
    /// Frame checksum did not match; the command id in the error frame is
    /// the one from the corrupted request so the host can attribute it.
    BadChecksum = 0x01,
    /// Unknown command id, or a payload shorter than its fixed header.
    BadCommand = 0x02,
    /// The underlying allocator refused the request.
    AllocFailed = 0x03,
    /// Address range not covered by a live allocation record (and the
    /// skip-bounds flag was clear).
    BadAddress = 0x04,
}

/// On-wire frame header. Followed by `len` payload bytes and a little-endian
/// `u16` additive checksum over header and payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub magic: [u8; 2],
    pub command: u8,
    pub kind: u8,
    pub len: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AllocRequest {
    pub size: U32,
    pub caps: U32,
    pub align: U32,
}

/// `address == 0` means the allocator refused; the frame is still
/// [`FrameKind::Ok`] (the *call* succeeded) and `error` carries the reason.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AllocResponse {
    pub address: U32,
    pub error: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FreeRequest {
    pub address: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FreeResponse {
    pub status: U32,
}

/// Fixed prefix of a write-memory request; the data to write follows
/// immediately after it in the payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct WriteRequest {
    pub address: U32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct WriteResponse {
    pub written: U32,
    pub status: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ReadRequest {
    pub address: U32,
    pub size: U32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ExecuteRequest {
    pub address: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ExecuteResponse {
    pub value: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct InfoResponse {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub reserved: U16,
    pub max_payload: U32,
    pub cache_line: U32,
    pub max_allocations: U32,
    /// NUL-padded ASCII.
    pub firmware_version: [u8; 16],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HeapInfoResponse {
    pub free_external: U32,
    pub total_external: U32,
    pub free_internal: U32,
    pub total_internal: U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ErrorResponse {
    pub code: U32,
}

// The structs above are on-wire ABI; pin their sizes so an accidental field
// change fails to compile rather than desynchronizing the two sides.
const_assert_eq!(core::mem::size_of::<FrameHeader>(), HEADER_SIZE);
const_assert_eq!(core::mem::size_of::<AllocRequest>(), 12);
const_assert_eq!(core::mem::size_of::<AllocResponse>(), 8);
const_assert_eq!(core::mem::size_of::<FreeRequest>(), 4);
const_assert_eq!(core::mem::size_of::<FreeResponse>(), 4);
const_assert_eq!(core::mem::size_of::<WriteRequest>(), 8);
const_assert_eq!(core::mem::size_of::<WriteResponse>(), 8);
const_assert_eq!(core::mem::size_of::<ReadRequest>(), 12);
const_assert_eq!(core::mem::size_of::<ExecuteRequest>(), 4);
const_assert_eq!(core::mem::size_of::<ExecuteResponse>(), 4);
const_assert_eq!(core::mem::size_of::<InfoResponse>(), 32);
const_assert_eq!(core::mem::size_of::<HeapInfoResponse>(), 16);
const_assert_eq!(core::mem::size_of::<ErrorResponse>(), 4);

/// Computes the frame checksum: the unsigned sum of every header byte and
/// every payload byte, modulo 2^16.
pub fn checksum(header: &[u8], payload: &[u8]) -> u16 {
    let mut sum = 0u16;
    for &b in header.iter().chain(payload) {
        sum = sum.wrapping_add(u16::from(b));
    }
    sum
}

/// Errors from [`seal_frame`]/[`parse_frame`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Payload exceeds [`MAX_PAYLOAD`] or the buffer can't hold the frame.
    TooLong,
    /// Fewer bytes than a complete frame.
    Truncated,
    BadMagic,
    BadChecksum { expected: u16, got: u16 },
}

/// Finishes a frame in place. The caller has already written `payload_len`
/// payload bytes starting at `buf[HEADER_SIZE]`; this writes the header in
/// front of them and the checksum after them, and returns the total frame
/// length.
pub fn seal_frame(
    buf: &mut [u8],
    command: u8,
    kind: FrameKind,
    payload_len: usize,
) -> Result<usize, FrameError> {
    let total = HEADER_SIZE + payload_len + CHECKSUM_SIZE;
    if payload_len > MAX_PAYLOAD || total > buf.len() {
        return Err(FrameError::TooLong);
    }

    let header = FrameHeader {
        magic: MAGIC,
        command,
        kind: kind as u8,
        len: U32::new(payload_len as u32),
    };
    buf[..HEADER_SIZE].copy_from_slice(header.as_bytes());

    let sum = checksum(
        &buf[..HEADER_SIZE],
        &buf[HEADER_SIZE..HEADER_SIZE + payload_len],
    );
    buf[HEADER_SIZE + payload_len..total].copy_from_slice(&sum.to_le_bytes());
    Ok(total)
}

/// Assembles a frame from a separate payload slice. Convenience wrapper
/// around [`seal_frame`] for callers whose payload isn't already in the
/// output buffer.
pub fn emit_frame(
    buf: &mut [u8],
    command: u8,
    kind: FrameKind,
    payload: &[u8],
) -> Result<usize, FrameError> {
    let total = HEADER_SIZE + payload.len() + CHECKSUM_SIZE;
    if payload.len() > MAX_PAYLOAD || total > buf.len() {
        return Err(FrameError::TooLong);
    }
    buf[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    seal_frame(buf, command, kind, payload.len())
}

/// A parsed frame borrowing its payload from the receive buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

/// Validates and splits a complete frame: magic, length, checksum. Intended
/// for the host side, which reads exactly one frame at a time; the device
/// uses its byte-at-a-time receive state machine instead.
pub fn parse_frame(buf: &[u8]) -> Result<Frame<'_>, FrameError> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated);
    }
    let (header, rest) = FrameHeader::read_from_prefix(buf)
        .map_err(|_| FrameError::Truncated)?;
    if header.magic != MAGIC {
        return Err(FrameError::BadMagic);
    }
    let len = header.len.get() as usize;
    if len > MAX_PAYLOAD || rest.len() < len + CHECKSUM_SIZE {
        return Err(FrameError::Truncated);
    }
    let payload = &rest[..len];
    let got = u16::from_le_bytes([rest[len], rest[len + 1]]);
    let expected = checksum(&buf[..HEADER_SIZE], payload);
    if got != expected {
        return Err(FrameError::BadChecksum { expected, got });
    }
    Ok(Frame { header, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn checksum_known_vector() {
        // 0xA5 + 0x5A + 0x01 + 0x00 + 4 length bytes (4,0,0,0) + payload.
        let header = [0xA5, 0x5A, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00];
        let payload = [0xCA, 0xFE, 0xBA, 0xBE];
        let expected: u16 = header
            .iter()
            .chain(&payload)
            .fold(0u16, |a, &b| a.wrapping_add(b as u16));
        assert_eq!(checksum(&header, &payload), expected);
    }

    #[test]
    fn checksum_wraps_mod_2_16() {
        let payload = [0xFF; 4096];
        // 4096 * 255 = 1_044_480, well past u16::MAX.
        let sum = checksum(&[], &payload);
        assert_eq!(sum, (4096u32 * 255 % 65536) as u16);
    }

    #[test]
    fn seal_parse_round_trip() {
        let payload = [0xCA, 0xFE, 0xBA, 0xBE];
        let mut buf = [0u8; 64];
        buf[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&payload);
        let n = seal_frame(&mut buf, Command::Ping as u8, FrameKind::Request, 4)
            .unwrap();
        assert_eq!(n, FRAME_OVERHEAD + 4);

        let frame = parse_frame(&buf[..n]).unwrap();
        assert_eq!(frame.header.command, Command::Ping as u8);
        assert_eq!(frame.header.kind, FrameKind::Request as u8);
        assert_eq!(frame.payload, &payload);
    }

    #[test]
    fn emit_matches_seal() {
        let payload = b"abcdef";
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        let na =
            emit_frame(&mut a, 0x20, FrameKind::Ok, payload).unwrap();
        b[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
        let nb = seal_frame(&mut b, 0x20, FrameKind::Ok, payload.len()).unwrap();
        assert_eq!(&a[..na], &b[..nb]);
    }

    #[test]
    fn every_flipped_byte_is_detected() {
        let payload = [0x11, 0x22, 0x33];
        let mut buf = [0u8; 32];
        let n =
            emit_frame(&mut buf, 0x01, FrameKind::Request, &payload).unwrap();

        for i in 0..n - CHECKSUM_SIZE {
            let mut copy = buf;
            copy[i] ^= 0x40;
            let r = parse_frame(&copy[..n]);
            // Flipping a magic byte is a framing error and flipping a
            // length byte changes how much frame we expect; every other
            // flip must land as a checksum failure. No flip passes.
            if i < 2 {
                assert_eq!(r, Err(FrameError::BadMagic), "byte {i}");
            } else if (4..8).contains(&i) {
                assert!(r.is_err(), "byte {i}: {r:?}");
            } else {
                assert!(
                    matches!(r, Err(FrameError::BadChecksum { .. })),
                    "byte {i}: {r:?}"
                );
            }
        }
    }

    #[test]
    fn truncated_frames_rejected() {
        let mut buf = [0u8; 32];
        let n = emit_frame(&mut buf, 0x01, FrameKind::Request, b"xy").unwrap();
        for cut in 0..n {
            assert!(parse_frame(&buf[..cut]).is_err(), "cut {cut}");
        }
        assert!(parse_frame(&buf[..n]).is_ok());
    }

    #[test]
    fn oversize_payload_refused() {
        let mut buf = [0u8; 64];
        assert_eq!(
            seal_frame(&mut buf, 0x01, FrameKind::Request, 60),
            Err(FrameError::TooLong)
        );
    }

    #[test]
    fn command_ids_match_the_wire() {
        for (id, cmd) in [
            (0x01, Command::Ping),
            (0x02, Command::GetInfo),
            (0x10, Command::Alloc),
            (0x11, Command::Free),
            (0x20, Command::WriteMem),
            (0x21, Command::ReadMem),
            (0x30, Command::Execute),
            (0x40, Command::HeapInfo),
        ] {
            assert_eq!(Command::from_u8(id), Some(cmd));
        }
        assert_eq!(Command::from_u8(0x03), None);
        assert_eq!(Command::from_u8(0xFF), None);
    }

    #[test]
    fn response_payloads_reinterpret_cleanly() {
        let raw = [0x10, 0x32, 0x54, 0x76, 0x03, 0x00, 0x00, 0x00];
        let resp = AllocResponse::read_from_bytes(&raw[..]).unwrap();
        assert_eq!(resp.address.get(), 0x7654_3210);
        assert_eq!(resp.error.get(), 3);
    }
}
