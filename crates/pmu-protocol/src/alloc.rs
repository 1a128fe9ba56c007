//! Payload allocation descriptors.
//!
//! Commands that carry more data than fits in the record body describe the
//! data out-of-line: a DMEM slice inside the firmware's software-managed
//! area, plus (optionally) a frame-buffer surface for data the firmware
//! DMAs itself. Four wire revisions of the descriptor exist; all of them
//! encode from / decode to the canonical [`PayloadAlloc`] so nothing
//! downstream branches on the revision.
//!
//! Wire layouts (packed little-endian):
//! - v0: `pad[3], fb_in_use:u8, dmem{size:u16,offset:u32}, fb{base:u32,offset:u8,idx:u8}` (16 bytes)
//! - v1: `dmem{size:u16,offset:u32}, fb{base:u32,offset:u8,idx:u8,size:u16}` (14 bytes)
//! - v2: `dmem{size:u16,offset:u32}, fb{base:u32,base_hi:u16,offset:u8,idx:u8,size:u16}` (16 bytes)
//! - v3: `dmem{size:u16,offset:u32}, fb{address:u64,params:u32}` (18 bytes)
//!
//! v3 packs the surface size into the low 24 bits of `params` and the DMA
//! index into the high byte.

use crate::version::ProtocolVersion;
use crate::wire::{push_u16, push_u32, push_u64, DecodeError, Reader};

/// A slice of the firmware's local data memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmemSlice {
    pub size: u16,
    pub offset: u32,
}

/// A frame-buffer surface reachable by the firmware's DMA engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbSurface {
    /// Byte address of the surface base.
    pub address: u64,
    /// Maximum DMA transfer size for the surface.
    pub size: u32,
    /// DMA aperture index to use for accesses.
    pub dma_idx: u8,
}

impl FbSurface {
    pub fn is_present(&self) -> bool {
        self.address != 0 || self.size != 0
    }
}

/// Canonical payload descriptor: where the payload lives in DMEM and, if
/// indirect, which frame-buffer surface backs it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadAlloc {
    pub dmem: DmemSlice,
    pub fb: FbSurface,
}

impl PayloadAlloc {
    /// Encoded size for the given interface revision.
    pub const fn encoded_len(version: ProtocolVersion) -> usize {
        match version {
            ProtocolVersion::V0 => 16,
            ProtocolVersion::V1 => 14,
            ProtocolVersion::V2 => 16,
            ProtocolVersion::V3 => 18,
        }
    }

    pub fn encode_into(&self, version: ProtocolVersion, out: &mut Vec<u8>) {
        match version {
            ProtocolVersion::V0 => {
                out.extend_from_slice(&[0, 0, 0]);
                out.push(u8::from(self.fb.is_present()));
                push_u16(out, self.dmem.size);
                push_u32(out, self.dmem.offset);
                push_u32(out, (self.fb.address >> 8) as u32);
                out.push((self.fb.address & 0xFF) as u8);
                out.push(self.fb.dma_idx);
            }
            ProtocolVersion::V1 => {
                push_u16(out, self.dmem.size);
                push_u32(out, self.dmem.offset);
                push_u32(out, (self.fb.address >> 8) as u32);
                out.push((self.fb.address & 0xFF) as u8);
                out.push(self.fb.dma_idx);
                push_u16(out, self.fb.size as u16);
            }
            ProtocolVersion::V2 => {
                push_u16(out, self.dmem.size);
                push_u32(out, self.dmem.offset);
                push_u32(out, (self.fb.address >> 8) as u32);
                push_u16(out, ((self.fb.address >> 40) & 0x1FF) as u16);
                out.push((self.fb.address & 0xFF) as u8);
                out.push(self.fb.dma_idx);
                push_u16(out, self.fb.size as u16);
            }
            ProtocolVersion::V3 => {
                push_u16(out, self.dmem.size);
                push_u32(out, self.dmem.offset);
                push_u64(out, self.fb.address);
                push_u32(out, (self.fb.size & 0x00FF_FFFF) | (u32::from(self.fb.dma_idx) << 24));
            }
        }
    }

    pub fn encode(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(version));
        self.encode_into(version, &mut out);
        out
    }

    pub fn decode(version: ProtocolVersion, bytes: &[u8]) -> Result<PayloadAlloc, DecodeError> {
        let mut r = Reader::new(bytes);
        let alloc = match version {
            ProtocolVersion::V0 => {
                r.skip(3)?;
                let _fb_in_use = r.read_u8()?;
                let dmem = read_dmem(&mut r)?;
                let base = r.read_u32()?;
                let offset = r.read_u8()?;
                let dma_idx = r.read_u8()?;
                PayloadAlloc {
                    dmem,
                    fb: FbSurface {
                        address: (u64::from(base) << 8) | u64::from(offset),
                        size: 0,
                        dma_idx,
                    },
                }
            }
            ProtocolVersion::V1 => {
                let dmem = read_dmem(&mut r)?;
                let base = r.read_u32()?;
                let offset = r.read_u8()?;
                let dma_idx = r.read_u8()?;
                let size = r.read_u16()?;
                PayloadAlloc {
                    dmem,
                    fb: FbSurface {
                        address: (u64::from(base) << 8) | u64::from(offset),
                        size: u32::from(size),
                        dma_idx,
                    },
                }
            }
            ProtocolVersion::V2 => {
                let dmem = read_dmem(&mut r)?;
                let base = r.read_u32()?;
                let base_hi = r.read_u16()?;
                let offset = r.read_u8()?;
                let dma_idx = r.read_u8()?;
                let size = r.read_u16()?;
                PayloadAlloc {
                    dmem,
                    fb: FbSurface {
                        address: (u64::from(base_hi & 0x1FF) << 40)
                            | (u64::from(base) << 8)
                            | u64::from(offset),
                        size: u32::from(size),
                        dma_idx,
                    },
                }
            }
            ProtocolVersion::V3 => {
                let dmem = read_dmem(&mut r)?;
                let address = r.read_u64()?;
                let params = r.read_u32()?;
                PayloadAlloc {
                    dmem,
                    fb: FbSurface {
                        address,
                        size: params & 0x00FF_FFFF,
                        dma_idx: (params >> 24) as u8,
                    },
                }
            }
        };
        Ok(alloc)
    }
}

fn read_dmem(r: &mut Reader<'_>) -> Result<DmemSlice, DecodeError> {
    Ok(DmemSlice {
        size: r.read_u16()?,
        offset: r.read_u32()?,
    })
}
