// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device façade: typed operations over the framed protocol, with the
//! shadow allocation table consulted before anything touches the wire.
//!
//! Large transfers are chunked to the device's advertised maximum payload;
//! ordering within a session is the protocol's single-in-flight guarantee.

use std::fmt;
use std::io::{Read, Write};

use zerocopy::{FromBytes, IntoBytes};

use wire::little_endian::U32;
use wire::{
    AllocRequest, AllocResponse, Command, ExecuteRequest, ExecuteResponse,
    FreeRequest, FreeResponse, HeapInfoResponse, ReadRequest, WriteRequest,
    WriteResponse, MEM_SKIP_BOUNDS, PROTOCOL_MINOR,
};

use crate::client::{Client, DeviceInfo, ProtoError};
use crate::shadow::ShadowTable;

#[derive(Debug)]
pub enum DeviceError {
    Proto(ProtoError),
    /// Refused host-side: the range isn't covered by the shadow table, so
    /// the device would reject it anyway.
    NotAllocated { address: u32, len: u32 },
    /// The device's allocator refused (inner error in an ok frame).
    AllocFailed { size: u32, code: u32 },
    /// An ok response payload didn't match its fixed record.
    ShortPayload { command: Command },
    /// The device reported a different write length than requested.
    WriteTruncated { requested: u32, written: u32 },
    /// Ping came back with different bytes.
    PingMismatch,
    /// Free rejected by the device's own table.
    FreeRejected { address: u32, status: u32 },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Proto(e) => write!(f, "{e}"),
            DeviceError::NotAllocated { address, len } => write!(
                f,
                "range {address:#010x}+{len:#x} is not covered by any allocation"
            ),
            DeviceError::AllocFailed { size, code } => write!(
                f,
                "device allocator refused {size} bytes (error {code:#x})"
            ),
            DeviceError::ShortPayload { command } => {
                write!(f, "malformed ok response for {command:?}")
            }
            DeviceError::WriteTruncated { requested, written } => write!(
                f,
                "device wrote {written} of {requested} bytes"
            ),
            DeviceError::PingMismatch => {
                write!(f, "ping payload came back different")
            }
            DeviceError::FreeRejected { address, status } => write!(
                f,
                "device refused to free {address:#010x} (status {status:#x})"
            ),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Proto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtoError> for DeviceError {
    fn from(e: ProtoError) -> Self {
        DeviceError::Proto(e)
    }
}

/// Host-side heap occupancy report, straight from the heap-info command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapInfo {
    pub free_external: u32,
    pub total_external: u32,
    pub free_internal: u32,
    pub total_internal: u32,
}

pub struct Device<T> {
    client: Client<T>,
    shadow: ShadowTable,
    info: DeviceInfo,
}

impl<T: Read + Write> Device<T> {
    /// Connects: performs the version handshake and captures the device's
    /// limits. A protocol-major mismatch refuses the connection; a minor
    /// difference warns and proceeds.
    pub fn open(io: T) -> Result<Self, DeviceError> {
        let mut client = Client::new(io);
        let info = client.hello()?;
        if info.protocol_minor != PROTOCOL_MINOR {
            eprintln!(
                "warning: device protocol {}.{} differs from host 1.{}; proceeding",
                info.protocol_major, info.protocol_minor, PROTOCOL_MINOR
            );
        }
        Ok(Self {
            client,
            shadow: ShadowTable::new(),
            info,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn shadow(&self) -> &ShadowTable {
        &self.shadow
    }

    /// Round-trips `data` through the echo command.
    pub fn ping(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let echoed = self.client.call(Command::Ping, data)?;
        if echoed != data {
            return Err(DeviceError::PingMismatch);
        }
        Ok(())
    }

    /// Allocates a device region and mirrors it in the shadow table.
    pub fn alloc(
        &mut self,
        size: u32,
        align: u32,
        caps: u32,
    ) -> Result<u32, DeviceError> {
        let req = AllocRequest {
            size: U32::new(size),
            caps: U32::new(caps),
            align: U32::new(align),
        };
        let payload = self.client.call(Command::Alloc, req.as_bytes())?;
        let resp = AllocResponse::read_from_bytes(&payload[..]).map_err(|_| {
            DeviceError::ShortPayload {
                command: Command::Alloc,
            }
        })?;
        let address = resp.address.get();
        if address == 0 {
            return Err(DeviceError::AllocFailed {
                size,
                code: resp.error.get(),
            });
        }
        self.shadow.insert(address, size);
        Ok(address)
    }

    /// Frees a region previously returned by [`alloc`](Self::alloc).
    pub fn free(&mut self, address: u32) -> Result<(), DeviceError> {
        if !self.shadow.contains_exact(address) {
            return Err(DeviceError::NotAllocated { address, len: 0 });
        }
        let req = FreeRequest {
            address: U32::new(address),
        };
        let payload = self.client.call(Command::Free, req.as_bytes())?;
        let resp = FreeResponse::read_from_bytes(&payload[..]).map_err(|_| {
            DeviceError::ShortPayload {
                command: Command::Free,
            }
        })?;
        if resp.status.get() != 0 {
            return Err(DeviceError::FreeRejected {
                address,
                status: resp.status.get(),
            });
        }
        self.shadow.remove(address);
        Ok(())
    }

    /// Writes into a region this session allocated.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceError> {
        if !self.shadow.covers(address, data.len() as u32) {
            return Err(DeviceError::NotAllocated {
                address,
                len: data.len() as u32,
            });
        }
        self.write_raw(address, data, false)
    }

    /// Writes with the device-side bounds check skipped, for memory owned
    /// by other firmware subsystems. No shadow check either — the caller
    /// is asserting it knows the address.
    pub fn write_unchecked(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.write_raw(address, data, true)
    }

    fn write_raw(
        &mut self,
        address: u32,
        data: &[u8],
        skip_bounds: bool,
    ) -> Result<(), DeviceError> {
        let header_len = std::mem::size_of::<WriteRequest>();
        let chunk_len =
            (self.info.max_payload as usize).saturating_sub(header_len).max(1);
        let flags = if skip_bounds { MEM_SKIP_BOUNDS } else { 0 };

        let mut cursor = address;
        for chunk in data.chunks(chunk_len) {
            let req = WriteRequest {
                address: U32::new(cursor),
                flags,
                reserved: [0; 3],
            };
            let mut payload = Vec::with_capacity(header_len + chunk.len());
            payload.extend_from_slice(req.as_bytes());
            payload.extend_from_slice(chunk);

            let resp_payload =
                self.client.call(Command::WriteMem, &payload)?;
            let resp = WriteResponse::read_from_bytes(&resp_payload[..])
                .map_err(|_| DeviceError::ShortPayload {
                    command: Command::WriteMem,
                })?;
            if resp.written.get() as usize != chunk.len() {
                return Err(DeviceError::WriteTruncated {
                    requested: chunk.len() as u32,
                    written: resp.written.get(),
                });
            }
            cursor += chunk.len() as u32;
        }
        Ok(())
    }

    /// Reads from a region this session allocated.
    pub fn read(&mut self, address: u32, len: u32) -> Result<Vec<u8>, DeviceError> {
        if !self.shadow.covers(address, len) {
            return Err(DeviceError::NotAllocated { address, len });
        }
        self.read_raw(address, len, false)
    }

    /// Reads with the device-side bounds check skipped.
    pub fn read_unchecked(
        &mut self,
        address: u32,
        len: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        self.read_raw(address, len, true)
    }

    fn read_raw(
        &mut self,
        address: u32,
        len: u32,
        skip_bounds: bool,
    ) -> Result<Vec<u8>, DeviceError> {
        let flags = if skip_bounds { MEM_SKIP_BOUNDS } else { 0 };
        let mut out = Vec::with_capacity(len as usize);
        let mut cursor = address;
        let mut remaining = len;

        while remaining > 0 {
            let take = remaining.min(self.info.max_payload.max(1));
            let req = ReadRequest {
                address: U32::new(cursor),
                size: U32::new(take),
                flags,
                reserved: [0; 3],
            };
            let chunk = self.client.call(Command::ReadMem, req.as_bytes())?;
            if chunk.len() != take as usize {
                return Err(DeviceError::ShortPayload {
                    command: Command::ReadMem,
                });
            }
            out.extend_from_slice(&chunk);
            cursor += take;
            remaining -= take;
        }
        Ok(out)
    }

    /// Runs the code at `address` (which must lie in an allocated region)
    /// and returns its raw 32-bit result. Blocks for as long as the loaded
    /// code runs; a fault on the device surfaces as a transport timeout.
    pub fn execute(&mut self, address: u32) -> Result<u32, DeviceError> {
        if !self.shadow.covers(address, 1) {
            return Err(DeviceError::NotAllocated { address, len: 1 });
        }
        let req = ExecuteRequest {
            address: U32::new(address),
        };
        let payload = self.client.call(Command::Execute, req.as_bytes())?;
        let resp = ExecuteResponse::read_from_bytes(&payload[..]).map_err(
            |_| DeviceError::ShortPayload {
                command: Command::Execute,
            },
        )?;
        Ok(resp.value.get())
    }

    pub fn heap_info(&mut self) -> Result<HeapInfo, DeviceError> {
        let payload = self.client.call(Command::HeapInfo, &[])?;
        let resp = HeapInfoResponse::read_from_bytes(&payload[..]).map_err(
            |_| DeviceError::ShortPayload {
                command: Command::HeapInfo,
            },
        )?;
        Ok(HeapInfo {
            free_external: resp.free_external.get(),
            total_external: resp.total_external.get(),
            free_internal: resp.free_internal.get(),
            total_internal: resp.total_internal.get(),
        })
    }
}
