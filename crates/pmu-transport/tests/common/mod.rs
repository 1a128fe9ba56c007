//! Shared fakes for the transport integration tests: a register file with
//! the hardware-mutex grant rule, a Vec-backed DMEM window, and a scripted
//! firmware that consumes command queues and produces messages the same
//! way the real microcontroller does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pmu_protocol::{
    align_up, unit_id, CtrlFlags, DmemRegion, InitMessage, ProtocolVersion, QueueGeometry,
    RecordHeader, QUEUE_COUNT,
};
use pmu_transport::{
    DmemBus, DmemHeap, NullInterruptControl, RegisterBus, RegisterLayout, Transport,
    MUTEX_OWNER_INIT,
};

pub const DMEM_SIZE: usize = 0x1000;
pub const QUEUE_BYTES: u16 = 0x80;
pub const QUEUE_BASE: u16 = 0x400;
pub const SW_REGION: DmemRegion = DmemRegion { offset: 0x800, size: 0x600 };

pub fn layout() -> RegisterLayout {
    RegisterLayout {
        cmd_queue_head_base: 0x4A0,
        cmd_queue_head_stride: 4,
        cmd_queue_tail_base: 0x4C0,
        cmd_queue_tail_stride: 4,
        msgq_head: 0x4E0,
        msgq_tail: 0x4E4,
        mutex_base: 0x580,
        mutex_stride: 4,
        mutex_owner_acquire: 0x488,
        mutex_owner_release: 0x48C,
    }
}

#[derive(Default)]
pub struct HwState {
    pub regs: HashMap<u32, u32>,
    pub dmem: Vec<u8>,
    pub next_token: u32,
    pub tokens_returned: Vec<u32>,
}

/// Both the transport (through its trait handles) and the scripted
/// firmware poke at the same state.
#[derive(Clone)]
pub struct SharedHw(pub Arc<Mutex<HwState>>);

impl SharedHw {
    pub fn new() -> SharedHw {
        SharedHw(Arc::new(Mutex::new(HwState {
            regs: HashMap::new(),
            dmem: vec![0; DMEM_SIZE],
            next_token: 1,
            tokens_returned: Vec::new(),
        })))
    }

    pub fn reg(&self, offset: u32) -> u32 {
        self.0.lock().unwrap().regs.get(&offset).copied().unwrap_or(0)
    }

    pub fn set_reg(&self, offset: u32, value: u32) {
        self.0.lock().unwrap().regs.insert(offset, value);
    }

    pub fn dmem_read(&self, offset: u32, len: usize) -> Vec<u8> {
        let state = self.0.lock().unwrap();
        state.dmem[offset as usize..offset as usize + len].to_vec()
    }

    pub fn dmem_write(&self, offset: u32, bytes: &[u8]) {
        let mut state = self.0.lock().unwrap();
        state.dmem[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }
}

struct RegsHandle {
    hw: SharedHw,
    layout: RegisterLayout,
}

impl RegisterBus for RegsHandle {
    fn read32(&mut self, offset: u32) -> u32 {
        let mut state = self.hw.0.lock().unwrap();
        if offset == self.layout.mutex_owner_acquire {
            let token = state.next_token;
            state.next_token += 1;
            return token;
        }
        state.regs.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&mut self, offset: u32, value: u32) {
        let mut state = self.hw.0.lock().unwrap();
        if offset == self.layout.mutex_owner_release {
            state.tokens_returned.push(value);
            return;
        }
        let mutex_bank = self.layout.mutex_base
            ..self.layout.mutex_base + self.layout.mutex_stride * 16;
        if mutex_bank.contains(&offset) {
            let current = state.regs.get(&offset).copied().unwrap_or(0);
            if current != u32::from(MUTEX_OWNER_INIT) && value != u32::from(MUTEX_OWNER_INIT) {
                return; // held by another agent
            }
        }
        state.regs.insert(offset, value);
    }
}

struct DmemHandle(SharedHw);

impl DmemBus for DmemHandle {
    fn copy_to(&mut self, offset: u32, bytes: &[u8]) {
        self.0.dmem_write(offset, bytes);
    }

    fn copy_from(&mut self, offset: u32, out: &mut [u8]) {
        out.copy_from_slice(&self.0.dmem_read(offset, out.len()));
    }
}

pub fn geometry() -> [QueueGeometry; QUEUE_COUNT] {
    std::array::from_fn(|i| QueueGeometry {
        size: QUEUE_BYTES,
        offset: QUEUE_BASE + QUEUE_BYTES * i as u16,
        index: i as u8,
    })
}

pub fn new_transport(version: ProtocolVersion, hw: &SharedHw) -> Transport {
    Transport::new(
        version,
        layout(),
        Box::new(RegsHandle { hw: hw.clone(), layout: layout() }),
        Box::new(DmemHandle(hw.clone())),
        Box::new(DmemHeap::new()),
        Box::new(NullInterruptControl),
    )
}

/// The firmware side of the shared state: publishes the init message,
/// produces message-queue records, and drains command queues.
pub struct FakeFirmware {
    pub hw: SharedHw,
    pub layout: RegisterLayout,
    version: ProtocolVersion,
    msgq: QueueGeometry,
}

impl FakeFirmware {
    pub fn new(version: ProtocolVersion, hw: SharedHw) -> FakeFirmware {
        let geometry = geometry();
        FakeFirmware { hw, layout: layout(), version, msgq: geometry[4] }
    }

    /// Boot: reset every cursor to its queue base and publish the init
    /// message.
    pub fn boot(&self) {
        let geometry = geometry();
        for (i, queue) in geometry.iter().enumerate().take(4) {
            self.hw.set_reg(self.layout.cmd_queue_head(i as u8), u32::from(queue.offset));
            self.hw.set_reg(self.layout.cmd_queue_tail(i as u8), u32::from(queue.offset));
        }
        self.hw.set_reg(self.layout.msgq_head, u32::from(self.msgq.offset));
        self.hw.set_reg(self.layout.msgq_tail, u32::from(self.msgq.offset));

        let init = InitMessage {
            queues: geometry,
            sw_managed: SW_REGION,
            os_debug_entry_point: self.version.has_os_debug_entry_point().then_some(0xBEE5),
        };
        self.push_record(unit_id::INIT, CtrlFlags::empty(), 0, &init.encode(self.version));
    }

    /// Append one record to the message queue and publish the new head.
    pub fn push_record(&self, unit: u8, flags: CtrlFlags, seq_id: u8, body: &[u8]) {
        let size = RecordHeader::SIZE_BYTES + body.len();
        let header = RecordHeader {
            unit_id: unit,
            size: size as u8,
            ctrl_flags: flags.bits(),
            seq_id,
        };

        let mut head = self.hw.reg(self.layout.msgq_head);
        let end = u32::from(self.msgq.offset) + u32::from(self.msgq.size);
        if head + align_up(size) as u32 > end {
            // Not enough room at the tail end: drop a REWIND marker and
            // wrap, mirroring the writer protocol the host uses.
            let mut marker = Vec::new();
            RecordHeader::rewind().encode_into(&mut marker);
            self.hw.dmem_write(head, &marker);
            head = u32::from(self.msgq.offset);
        }

        let mut record = Vec::with_capacity(size);
        header.encode_into(&mut record);
        record.extend_from_slice(body);
        self.hw.dmem_write(head, &record);
        self.hw.set_reg(self.layout.msgq_head, head + align_up(size) as u32);
    }

    /// Drain every record currently in command queue `index`, advancing
    /// the tail cursor like the firmware's dispatcher would.
    pub fn drain_commands(&self, index: u8) -> Vec<(RecordHeader, Vec<u8>)> {
        let geometry = geometry()[index as usize];
        let head = self.hw.reg(self.layout.cmd_queue_head(index));
        let mut tail = self.hw.reg(self.layout.cmd_queue_tail(index));
        let mut records = Vec::new();

        while tail != head {
            let header =
                RecordHeader::decode(&self.hw.dmem_read(tail, RecordHeader::SIZE_BYTES))
                    .expect("header bytes");
            if header.unit_id == unit_id::REWIND {
                tail = u32::from(geometry.offset);
                continue;
            }
            let body = self
                .hw
                .dmem_read(tail + RecordHeader::SIZE_BYTES as u32, header.body_len());
            tail += align_up(header.size as usize) as u32;
            records.push((header, body));
        }
        self.hw.set_reg(self.layout.cmd_queue_tail(index), tail);
        records
    }
}
