//! Full-stack check: controller → transport → scripted firmware → pump →
//! controller, over real queue bytes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pmu_elpg::{ElpgController, ElpgState};
use pmu_protocol::pg::{ElpgEvent, ElpgOp};
use pmu_protocol::{
    align_up, unit_id, CtrlFlags, DmemRegion, InitMessage, ProtocolVersion, QueueGeometry,
    RecordHeader, QUEUE_COUNT,
};
use pmu_transport::{
    DmemBus, DmemHeap, NullInterruptControl, RegisterBus, RegisterLayout, Transport,
};

const VERSION: ProtocolVersion = ProtocolVersion::V1;

fn layout() -> RegisterLayout {
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

fn geometry() -> [QueueGeometry; QUEUE_COUNT] {
    std::array::from_fn(|i| QueueGeometry {
        size: 0x80,
        offset: 0x400 + 0x80 * i as u16,
        index: i as u8,
    })
}

#[derive(Clone)]
struct SharedHw(Arc<Mutex<(HashMap<u32, u32>, Vec<u8>)>>);

impl SharedHw {
    fn new() -> SharedHw {
        SharedHw(Arc::new(Mutex::new((HashMap::new(), vec![0; 0x1000]))))
    }

    fn reg(&self, offset: u32) -> u32 {
        self.0.lock().unwrap().0.get(&offset).copied().unwrap_or(0)
    }

    fn set_reg(&self, offset: u32, value: u32) {
        self.0.lock().unwrap().0.insert(offset, value);
    }

    fn read(&self, offset: u32, len: usize) -> Vec<u8> {
        self.0.lock().unwrap().1[offset as usize..offset as usize + len].to_vec()
    }

    fn write(&self, offset: u32, bytes: &[u8]) {
        self.0.lock().unwrap().1[offset as usize..offset as usize + bytes.len()]
            .copy_from_slice(bytes);
    }
}

impl RegisterBus for SharedHw {
    fn read32(&mut self, offset: u32) -> u32 {
        self.reg(offset)
    }
    fn write32(&mut self, offset: u32, value: u32) {
        self.set_reg(offset, value);
    }
}

impl DmemBus for SharedHw {
    fn copy_to(&mut self, offset: u32, bytes: &[u8]) {
        self.write(offset, bytes);
    }
    fn copy_from(&mut self, offset: u32, out: &mut [u8]) {
        out.copy_from_slice(&self.read(offset, out.len()));
    }
}

/// Drain the high-priority queue and acknowledge every ELPG command.
fn firmware_service_hpq(hw: &SharedHw) -> usize {
    let layout = layout();
    let hpq = geometry()[0];
    let head = hw.reg(layout.cmd_queue_head(0));
    let mut tail = hw.reg(layout.cmd_queue_tail(0));
    let mut serviced = 0;

    while tail != head {
        let header = RecordHeader::decode(&hw.read(tail, 4)).unwrap();
        if header.unit_id == unit_id::REWIND {
            tail = u32::from(hpq.offset);
            continue;
        }
        let body = hw.read(tail + 4, header.body_len());
        tail += align_up(header.size as usize) as u32;

        assert_eq!(header.unit_id, unit_id::PG);
        let engine_id = body[1];
        let op = u16::from_le_bytes([body[2], body[3]]);
        let event = match op {
            0 => ElpgEvent::InitAck,
            1 => ElpgEvent::DisallowAck,
            2 => ElpgEvent::AllowAck,
            3 => ElpgEvent::FreezeAck,
            4 => ElpgEvent::UnfreezeAck,
            other => panic!("unexpected elpg op {other}"),
        };

        // Write the acknowledgement into the message queue.
        let ack = [0u8, engine_id, event as u8, 0];
        let response = RecordHeader {
            unit_id: unit_id::PG,
            size: (4 + ack.len()) as u8,
            ctrl_flags: CtrlFlags::empty().bits(),
            seq_id: header.seq_id,
        };
        let mut record = Vec::new();
        response.encode_into(&mut record);
        record.extend_from_slice(&ack);
        let msg_head = hw.reg(layout.msgq_head);
        hw.write(msg_head, &record);
        hw.set_reg(layout.msgq_head, msg_head + align_up(record.len()) as u32);
        serviced += 1;
    }
    hw.set_reg(layout.cmd_queue_tail(0), tail);
    serviced
}

fn boot(hw: &SharedHw) {
    let layout = layout();
    let geometry = geometry();
    for (i, queue) in geometry.iter().enumerate().take(4) {
        hw.set_reg(layout.cmd_queue_head(i as u8), u32::from(queue.offset));
        hw.set_reg(layout.cmd_queue_tail(i as u8), u32::from(queue.offset));
    }
    hw.set_reg(layout.msgq_head, u32::from(geometry[4].offset));
    hw.set_reg(layout.msgq_tail, u32::from(geometry[4].offset));

    let init = InitMessage {
        queues: geometry,
        sw_managed: DmemRegion { offset: 0x800, size: 0x600 },
        os_debug_entry_point: Some(0),
    };
    let body = init.encode(VERSION);
    let header = RecordHeader {
        unit_id: unit_id::INIT,
        size: (4 + body.len()) as u8,
        ctrl_flags: 0,
        seq_id: 0,
    };
    let mut record = Vec::new();
    header.encode_into(&mut record);
    record.extend_from_slice(&body);
    let head = hw.reg(layout.msgq_head);
    hw.write(head, &record);
    hw.set_reg(layout.msgq_head, head + align_up(record.len()) as u32);
}

#[test]
fn gate_cycle_runs_end_to_end_over_the_transport() {
    let hw = SharedHw::new();
    boot(&hw);

    let transport = Arc::new(Transport::new(
        VERSION,
        layout(),
        Box::new(hw.clone()),
        Box::new(hw.clone()),
        Box::new(DmemHeap::new()),
        Box::new(NullInterruptControl),
    ));
    assert_eq!(transport.pump_once().unwrap(), 1);

    let controller = ElpgController::new(transport.clone());
    const GR: u8 = 0;

    controller.init_engine(GR).unwrap();
    assert_eq!(firmware_service_hpq(&hw), 1);
    transport.pump_once().unwrap();
    assert!(controller.is_initialized(GR));

    // Enable, then immediately disable while the ALLOW is still in
    // flight: the controller must serialize, ending up gated off.
    controller.request_enable(GR).unwrap();
    controller.request_disable(GR).unwrap();

    assert_eq!(firmware_service_hpq(&hw), 1); // ALLOW only
    transport.pump_once().unwrap(); // ALLOW_ACK -> queued DISALLOW sent
    assert_eq!(
        controller.state(GR),
        Some(ElpgState::OffPending { enable_queued: false })
    );

    assert_eq!(firmware_service_hpq(&hw), 1); // DISALLOW
    transport.pump_once().unwrap();
    assert_eq!(controller.state(GR), Some(ElpgState::Off));
    assert_eq!(transport.outstanding_commands(), 0);

    let stats = controller.stats(GR).unwrap();
    assert_eq!(stats.allow_acks, 1);
    assert_eq!(stats.disallow_acks, 1);
}
