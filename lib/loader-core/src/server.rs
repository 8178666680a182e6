// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The protocol loop: byte-at-a-time frame reception and command dispatch.
//!
//! The server is fed one byte at a time from the transport queue and
//! produces at most one response frame per request frame. It never blocks
//! and never panics on link-borne garbage: bad magic resynchronizes
//! silently, an oversize length drains the advertised payload to stay in
//! sync, and a checksum mismatch answers an error frame carrying the
//! received command id so the host can attribute the failure.
//!
//! Dispatch runs to completion between frames. The one deliberate exception
//! to "without blocking" is execute, which runs host-supplied machine code
//! inline for as long as it takes; a runaway function can only be cleared
//! by device reset.

use num_traits::FromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use wire::little_endian::{U16, U32};
use wire::{
    AllocRequest, AllocResponse, Command, ErrorResponse, ExecuteRequest,
    ExecuteResponse, FrameKind, FreeRequest, FreeResponse, HeapInfoResponse,
    InfoResponse, ReadRequest, ResponseCode, WriteRequest, WriteResponse,
    CHECKSUM_SIZE, FRAME_OVERHEAD, HEADER_SIZE, MAGIC, MEM_SKIP_BOUNDS,
    PROTOCOL_MAJOR, PROTOCOL_MINOR,
};

use crate::platform::{round_to_cache_lines, Platform};
use crate::table::AllocTable;
use crate::trace::{Event, EventRing};

/// Entries kept in the event ring.
pub const TRACE_DEPTH: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RxState {
    WaitMagic0,
    WaitMagic1,
    Header,
    Payload,
    Checksum,
    /// Advertised payload exceeded the RX buffer: swallow it (plus the
    /// trailing checksum) to stay frame-aligned. No response is sent; the
    /// host sees a timeout.
    Drain,
}

pub struct Server<'b, P: Platform> {
    platform: P,
    table: AllocTable,
    trace: EventRing<TRACE_DEPTH>,
    state: RxState,
    header: [u8; HEADER_SIZE],
    header_fill: usize,
    /// Payload bytes land here; capacity bounds the advertised max payload.
    rx: &'b mut [u8],
    payload_len: usize,
    payload_fill: usize,
    csum: [u8; CHECKSUM_SIZE],
    csum_fill: usize,
    drain_remaining: usize,
    /// Responses are assembled here, header and checksum included.
    tx: &'b mut [u8],
    firmware_version: [u8; 16],
}

impl<'b, P: Platform> Server<'b, P> {
    /// Creates a server over borrowed RX/TX buffers. `rx`'s length is the
    /// maximum payload this device will accept and is what get-info
    /// advertises; `tx` must additionally hold the frame overhead.
    pub fn new(
        platform: P,
        rx: &'b mut [u8],
        tx: &'b mut [u8],
        firmware_version: &str,
    ) -> Self {
        assert!(tx.len() >= core::mem::size_of::<InfoResponse>() + FRAME_OVERHEAD);
        let mut version = [0u8; 16];
        let src = firmware_version.as_bytes();
        let n = src.len().min(version.len());
        version[..n].copy_from_slice(&src[..n]);

        Self {
            platform,
            table: AllocTable::new(),
            trace: EventRing::new(),
            state: RxState::WaitMagic0,
            header: [0; HEADER_SIZE],
            header_fill: 0,
            rx,
            payload_len: 0,
            payload_fill: 0,
            csum: [0; CHECKSUM_SIZE],
            csum_fill: 0,
            drain_remaining: 0,
            tx,
            firmware_version: version,
        }
    }

    /// Feeds one received byte through the state machine. Returns the
    /// complete response frame when this byte finishes a request.
    pub fn step(&mut self, byte: u8) -> Option<&[u8]> {
        match self.state {
            RxState::WaitMagic0 => {
                if byte == MAGIC[0] {
                    self.header[0] = byte;
                    self.state = RxState::WaitMagic1;
                }
                None
            }
            RxState::WaitMagic1 => {
                if byte == MAGIC[1] {
                    self.header[1] = byte;
                    self.header_fill = 2;
                    self.state = RxState::Header;
                } else if byte != MAGIC[0] {
                    // A repeated 0xA5 keeps us here; anything else restarts
                    // the hunt.
                    self.state = RxState::WaitMagic0;
                }
                None
            }
            RxState::Header => {
                self.header[self.header_fill] = byte;
                self.header_fill += 1;
                if self.header_fill == HEADER_SIZE {
                    self.begin_body();
                }
                None
            }
            RxState::Payload => {
                self.rx[self.payload_fill] = byte;
                self.payload_fill += 1;
                if self.payload_fill == self.payload_len {
                    self.csum_fill = 0;
                    self.state = RxState::Checksum;
                }
                None
            }
            RxState::Checksum => {
                self.csum[self.csum_fill] = byte;
                self.csum_fill += 1;
                if self.csum_fill == CHECKSUM_SIZE {
                    self.state = RxState::WaitMagic0;
                    let n = self.finish_frame();
                    Some(&self.tx[..n])
                } else {
                    None
                }
            }
            RxState::Drain => {
                self.drain_remaining -= 1;
                if self.drain_remaining == 0 {
                    self.state = RxState::WaitMagic0;
                }
                None
            }
        }
    }

    /// Read-only view of the allocation table, for introspection.
    pub fn table(&self) -> &AllocTable {
        &self.table
    }

    /// The event trace ring.
    pub fn trace(&self) -> &EventRing<TRACE_DEPTH> {
        &self.trace
    }

    fn begin_body(&mut self) {
        let len = u32::from_le_bytes(self.header[4..8].try_into().unwrap());
        if len as usize > self.rx.len() {
            self.trace.record(Event::OversizeDrained { len });
            self.drain_remaining = len as usize + CHECKSUM_SIZE;
            self.state = RxState::Drain;
        } else {
            self.payload_len = len as usize;
            self.payload_fill = 0;
            if self.payload_len == 0 {
                self.csum_fill = 0;
                self.state = RxState::Checksum;
            } else {
                self.state = RxState::Payload;
            }
        }
    }

    /// Verifies the completed frame and dispatches it, leaving the response
    /// in `tx`. Returns the response length.
    fn finish_frame(&mut self) -> usize {
        let command = self.header[2];
        let kind = self.header[3];

        let received = u16::from_le_bytes(self.csum);
        let computed =
            wire::checksum(&self.header, &self.rx[..self.payload_len]);
        if received != computed {
            self.trace.record(Event::ChecksumMismatch { command });
            return self.error_frame(command, ResponseCode::BadChecksum);
        }

        if kind != FrameKind::Request as u8 {
            self.trace.record(Event::BadCommand { command });
            return self.error_frame(command, ResponseCode::BadCommand);
        }

        self.trace.record(Event::FrameAccepted { command });
        let result = match Command::from_u8(command) {
            Some(Command::Ping) => self.cmd_ping(),
            Some(Command::GetInfo) => self.cmd_get_info(),
            Some(Command::Alloc) => self.cmd_alloc(),
            Some(Command::Free) => self.cmd_free(),
            Some(Command::WriteMem) => self.cmd_write(),
            Some(Command::ReadMem) => self.cmd_read(),
            Some(Command::Execute) => self.cmd_execute(),
            Some(Command::HeapInfo) => self.cmd_heap_info(),
            None => {
                self.trace.record(Event::BadCommand { command });
                Err(ResponseCode::BadCommand)
            }
        };

        match result {
            Ok(len) => {
                match wire::seal_frame(self.tx, command, FrameKind::Ok, len) {
                    Ok(n) => n,
                    // Can't happen for handler-produced lengths, but the
                    // server must not panic on the failure path either.
                    Err(_) => self.error_frame(command, ResponseCode::BadCommand),
                }
            }
            Err(code) => self.error_frame(command, code),
        }
    }

    fn error_frame(&mut self, command: u8, code: ResponseCode) -> usize {
        let resp = ErrorResponse {
            code: U32::new(code as u32),
        };
        self.put(&resp);
        // The TX buffer always holds an error frame; see the assert in new.
        wire::seal_frame(
            self.tx,
            command,
            FrameKind::Error,
            core::mem::size_of::<ErrorResponse>(),
        )
        .unwrap_or(0)
    }

    /// Copies a fixed response record into the TX payload area.
    fn put<T: IntoBytes + Immutable>(&mut self, value: &T) -> usize {
        let bytes = value.as_bytes();
        self.tx[HEADER_SIZE..HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
        bytes.len()
    }

    fn cmd_ping(&mut self) -> Result<usize, ResponseCode> {
        let n = self.payload_len;
        if n + FRAME_OVERHEAD > self.tx.len() {
            return Err(ResponseCode::BadCommand);
        }
        self.tx[HEADER_SIZE..HEADER_SIZE + n].copy_from_slice(&self.rx[..n]);
        Ok(n)
    }

    fn cmd_get_info(&mut self) -> Result<usize, ResponseCode> {
        let resp = InfoResponse {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            reserved: U16::new(0),
            max_payload: U32::new(self.rx.len() as u32),
            cache_line: U32::new(self.platform.cache_line()),
            max_allocations: U32::new(crate::table::MAX_ALLOCATIONS as u32),
            firmware_version: self.firmware_version,
        };
        Ok(self.put(&resp))
    }

    fn cmd_alloc(&mut self) -> Result<usize, ResponseCode> {
        let req = AllocRequest::read_from_bytes(&self.rx[..self.payload_len])
            .map_err(|_| ResponseCode::BadCommand)?;
        let size = req.size.get();
        let caps = req.caps.get();
        let align = req.align.get();

        let mut address = 0u32;
        // Refuse rather than hand the allocator an alignment it documents
        // as undefined; refuse up front when the table is full so we don't
        // leak a region we can't track.
        if align.is_power_of_two()
            && self.table.live_count() < crate::table::MAX_ALLOCATIONS
        {
            if let Some(a) = self.platform.alloc(size, align, caps) {
                // Insert can't fail: we just checked occupancy.
                if self.table.insert(a, size).is_ok() {
                    address = a;
                } else {
                    self.platform.free(a);
                }
            }
        }

        let error = if address == 0 {
            self.trace.record(Event::AllocRefused { size });
            ResponseCode::AllocFailed as u32
        } else {
            self.trace.record(Event::Alloc { size, caps });
            0
        };
        let resp = AllocResponse {
            address: U32::new(address),
            error: U32::new(error),
        };
        Ok(self.put(&resp))
    }

    fn cmd_free(&mut self) -> Result<usize, ResponseCode> {
        let req = FreeRequest::read_from_bytes(&self.rx[..self.payload_len])
            .map_err(|_| ResponseCode::BadCommand)?;
        let address = req.address.get();

        if !self.table.remove(address) {
            self.trace.record(Event::FreeUnknown { address });
            return Err(ResponseCode::BadAddress);
        }
        self.platform.free(address);
        self.trace.record(Event::Free { address });
        let resp = FreeResponse { status: U32::new(0) };
        Ok(self.put(&resp))
    }

    fn cmd_write(&mut self) -> Result<usize, ResponseCode> {
        let (req, data) =
            WriteRequest::read_from_prefix(&self.rx[..self.payload_len])
                .map_err(|_| ResponseCode::BadCommand)?;
        let address = req.address.get();
        let len = data.len() as u32;

        if req.flags & MEM_SKIP_BOUNDS == 0
            && !self.table.range_fits(address, len)
        {
            self.trace.record(Event::OutOfBounds { address, len });
            return Err(ResponseCode::BadAddress);
        }

        self.platform.write(address, data);
        // Round out to cache lines and make the new bytes visible to
        // instruction fetch before the host can ask us to run them.
        let (start, span) =
            round_to_cache_lines(address, len, self.platform.cache_line());
        let status = self.platform.sync_range(start, span);

        self.trace.record(Event::Write { address, len });
        let resp = WriteResponse {
            written: U32::new(len),
            status: U32::new(status as u32),
        };
        Ok(self.put(&resp))
    }

    fn cmd_read(&mut self) -> Result<usize, ResponseCode> {
        let req = ReadRequest::read_from_bytes(&self.rx[..self.payload_len])
            .map_err(|_| ResponseCode::BadCommand)?;
        let address = req.address.get();
        let size = req.size.get();

        if size as usize + FRAME_OVERHEAD > self.tx.len() {
            return Err(ResponseCode::BadCommand);
        }
        if req.flags & MEM_SKIP_BOUNDS == 0
            && !self.table.range_fits(address, size)
        {
            self.trace.record(Event::OutOfBounds { address, len: size });
            return Err(ResponseCode::BadAddress);
        }

        self.platform.read(
            address,
            &mut self.tx[HEADER_SIZE..HEADER_SIZE + size as usize],
        );
        self.trace.record(Event::Read { address, len: size });
        Ok(size as usize)
    }

    fn cmd_execute(&mut self) -> Result<usize, ResponseCode> {
        let req = ExecuteRequest::read_from_bytes(&self.rx[..self.payload_len])
            .map_err(|_| ResponseCode::BadCommand)?;
        let address = req.address.get();

        if !self.table.range_fits(address, 1) {
            self.trace.record(Event::OutOfBounds { address, len: 1 });
            return Err(ResponseCode::BadAddress);
        }

        self.trace.record(Event::ExecuteEnter { address });
        // Safety: the entry address lies inside a live allocation that the
        // host populated and the write path cache-synced. What the code
        // does is the host's responsibility; running it is this command's
        // entire purpose.
        let value = unsafe { self.platform.execute(address) };
        self.trace.record(Event::ExecuteReturn { value });

        let resp = ExecuteResponse {
            value: U32::new(value as u32),
        };
        Ok(self.put(&resp))
    }

    fn cmd_heap_info(&mut self) -> Result<usize, ResponseCode> {
        let stats = self.platform.heap_stats();
        let resp = HeapInfoResponse {
            free_external: U32::new(stats.free_external),
            total_external: U32::new(stats.total_external),
            free_internal: U32::new(stats.free_internal),
            total_internal: U32::new(stats.total_internal),
        };
        Ok(self.put(&resp))
    }
}
