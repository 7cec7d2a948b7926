//! Status Report Module
//!
//! Per-submission completion records written by the engine into a
//! host-visible ring. The primary pipe opens a record with START, stores the
//! error and unit-count registers at the end of the frame and closes it with
//! END. Completion is decided against a global counter that either frame
//! tracking or a post-sync flush advances.
//!
//! Buffer layout:
//! ```text
//! +0x00  global completion counter
//! +0x04  reserved
//! +0x08  StatusRecord[depth]
//! ```

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::cmdbuf::CommandDescriptor;
use crate::encoder::{CodecKind, CommandEncoder};
use crate::error::{MediaError, Result};
use crate::mi::FlushDwParams;
use crate::protocol::*;
use crate::resource::{GpuRef, HostMemory, ResourceHandle, ResourceTracker};

pub const STATUS_HEADER_DWORDS: u32 = 2;
const HEADER_BYTES: u32 = STATUS_HEADER_DWORDS * DWORD_SIZE as u32;
const RECORD_BYTES: u32 = size_of::<StatusRecord>() as u32;

/// One ring entry as the engine writes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StatusRecord {
    /// START, END or SKIPPED.
    pub status: u32,
    /// Software counter value the global counter must reach.
    pub sw_count: u32,
    pub unit_id: u32,
    /// Decode status register.
    pub error_status: u32,
    /// CABAC status register; carries the processed-unit count.
    pub unit_count: u32,
    pub crc: u32,
    pub reserved: [u32; 2],
}

const _: () = assert!(size_of::<StatusRecord>() == 32);

/// Fields of a record the engine can be pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    Status,
    SwCount,
    UnitId,
    ErrorStatus,
    UnitCount,
    Crc,
}

impl StatusField {
    fn offset(self) -> u32 {
        match self {
            StatusField::Status => 0,
            StatusField::SwCount => 4,
            StatusField::UnitId => 8,
            StatusField::ErrorStatus => 12,
            StatusField::UnitCount => 16,
            StatusField::Crc => 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusOptions {
    /// The submission path writes the tracking tag to the global counter.
    pub frame_tracking: bool,
    pub report_crc: bool,
}

/// Advisory values read back with a completed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diagnostics {
    pub raw_status: u32,
    pub error_flags: u32,
    pub affected_units: u32,
    pub crc: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedReport {
    pub unit_id: u32,
    pub error: Option<MediaError>,
    pub diagnostics: Diagnostics,
}

impl CompletedReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn code(&self) -> u32 {
        self.error.as_ref().map_or(MEDIA_ERROR_SUCCESS, MediaError::code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    Pending,
    Complete(CompletedReport),
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    slot: u32,
    sw_count: u32,
    codec: CodecKind,
}

pub struct StatusReport {
    buffer: ResourceHandle,
    memory: HostMemory,
    depth: u32,
    options: StatusOptions,
    submitted: u32,
    open: Option<u32>,
    in_flight: HashMap<u32, InFlight>,
    sender: watch::Sender<Option<CompletedReport>>,
}

impl StatusReport {
    /// Allocate a status buffer with a ring of `depth` records.
    pub fn new(tracker: &mut ResourceTracker, depth: u32, options: StatusOptions) -> Result<Self> {
        if depth == 0 || !depth.is_power_of_two() {
            return Err(MediaError::invalid(format!("status ring depth {depth} is not a power of two")));
        }
        let buffer = tracker.create_buffer("status report", HEADER_BYTES + depth * RECORD_BYTES, true)?;
        let memory = tracker.host_memory(buffer)?;
        let (sender, _) = watch::channel(None);
        debug!("Status report ring of {} records, {:?}", depth, options);
        Ok(Self {
            buffer,
            memory,
            depth,
            options,
            submitted: 0,
            open: None,
            in_flight: HashMap::new(),
            sender,
        })
    }

    pub fn buffer(&self) -> ResourceHandle {
        self.buffer
    }

    pub fn options(&self) -> StatusOptions {
        self.options
    }

    /// Where frame tracking writes its tag.
    pub fn global_count_address(&self) -> GpuRef {
        self.buffer.at(0)
    }

    pub fn submitted_count(&self) -> u32 {
        self.submitted
    }

    /// Tag the next submission completes with.
    pub fn next_tag(&self) -> u32 {
        self.submitted.wrapping_add(1)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CompletedReport>> {
        self.sender.subscribe()
    }

    fn record_offset(&self, slot: u32) -> u32 {
        HEADER_BYTES + slot * RECORD_BYTES
    }

    fn field_ref(&self, slot: u32, field: StatusField) -> GpuRef {
        self.buffer.at(self.record_offset(slot) + field.offset())
    }

    /// Address of `field` in the record opened for `unit_id`.
    pub fn completion_address(&self, unit_id: u32, field: StatusField) -> Result<GpuRef> {
        let entry = self
            .in_flight
            .get(&unit_id)
            .ok_or_else(|| MediaError::invalid(format!("no status record for unit {unit_id}")))?;
        Ok(self.field_ref(entry.slot, field))
    }

    pub fn read_record(&self, slot: u32) -> Result<StatusRecord> {
        let bytes = self.memory.read_bytes(self.record_offset(slot % self.depth), RECORD_BYTES as usize)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    /// Open the record for `unit_id`. Only the primary pipe calls this.
    pub fn start(
        &mut self,
        unit_id: u32,
        codec: CodecKind,
        encoder: &dyn CommandEncoder,
        tracker: &ResourceTracker,
    ) -> Result<Vec<CommandDescriptor>> {
        if let Some(open) = self.open {
            return Err(MediaError::contract(format!(
                "status record for unit {open} still open when starting unit {unit_id}"
            )));
        }
        if self.in_flight.contains_key(&unit_id) {
            return Err(MediaError::invalid(format!("unit {unit_id} already has a status record")));
        }
        if self.in_flight.len() as u32 >= self.depth {
            return Err(MediaError::invalid(format!("status ring of {} records is full", self.depth)));
        }

        let sw_count = self.next_tag();
        let slot = sw_count % self.depth;
        if let Some((&owner, _)) = self.in_flight.iter().find(|(_, f)| f.slot == slot) {
            return Err(MediaError::invalid(format!(
                "status slot {slot} still holds unretired unit {owner}"
            )));
        }
        let record = StatusRecord {
            sw_count,
            unit_id,
            ..StatusRecord::zeroed()
        };
        self.memory
            .write_bytes(self.record_offset(slot), bytemuck::bytes_of(&record))?;

        let cmd = encoder.store_data_imm(tracker, self.field_ref(slot, StatusField::Status), STATUS_QUERY_START_FLAG)?;
        self.in_flight.insert(unit_id, InFlight { slot, sw_count, codec });
        self.open = Some(unit_id);
        trace!("Status record {} opened in slot {} (sw {})", unit_id, slot, sw_count);
        Ok(vec![cmd])
    }

    /// Close the record for `unit_id`, capturing the status registers of
    /// `vdbox`.
    pub fn end(
        &mut self,
        unit_id: u32,
        encoder: &dyn CommandEncoder,
        tracker: &ResourceTracker,
        vdbox: usize,
    ) -> Result<Vec<CommandDescriptor>> {
        if self.open != Some(unit_id) {
            return Err(MediaError::contract(format!("status record for unit {unit_id} is not open")));
        }
        let entry = self.in_flight[&unit_id];
        let mmio = encoder.mmio(vdbox)?;

        let mut cmds = vec![encoder.store_register_mem(
            tracker,
            mmio.cabac_status,
            self.field_ref(entry.slot, StatusField::UnitCount),
        )?];
        if self.options.report_crc {
            cmds.push(encoder.store_register_mem(tracker, mmio.frame_crc, self.field_ref(entry.slot, StatusField::Crc))?);
        }
        cmds.push(encoder.store_register_mem(
            tracker,
            mmio.dec_status,
            self.field_ref(entry.slot, StatusField::ErrorStatus),
        )?);
        cmds.push(encoder.store_data_imm(tracker, self.field_ref(entry.slot, StatusField::Status), STATUS_QUERY_END_FLAG)?);
        if !self.options.frame_tracking {
            cmds.push(encoder.flush_dw(
                tracker,
                &FlushDwParams {
                    post_sync_write: Some((self.global_count_address(), entry.sw_count)),
                    ..FlushDwParams::default()
                },
            )?);
        }

        // The next slot is reused by the following frame.
        let next = (entry.slot + 1) % self.depth;
        if !self.in_flight.values().any(|f| f.slot == next) {
            self.memory.fill(self.record_offset(next), RECORD_BYTES as usize, 0)?;
        }
        self.open = None;
        Ok(cmds)
    }

    /// Advance the software counter once the frame has been submitted.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(open) = self.open {
            return Err(MediaError::contract(format!("status record for unit {open} never closed")));
        }
        self.submitted = self.submitted.wrapping_add(1);
        Ok(())
    }

    /// Drop the record of a unit that will never be submitted. The software
    /// counter is not advanced, so its slot is handed out again.
    pub fn cancel(&mut self, unit_id: u32) -> bool {
        if self.open == Some(unit_id) {
            self.open = None;
        }
        self.in_flight.remove(&unit_id).is_some()
    }

    fn decode(&self, unit_id: u32, entry: InFlight, record: &StatusRecord) -> CompletedReport {
        let mut diagnostics = Diagnostics {
            raw_status: record.status,
            crc: self.options.report_crc.then_some(record.crc),
            ..Diagnostics::default()
        };
        let error = match record.status {
            STATUS_QUERY_END_FLAG => {
                diagnostics.error_flags = record.error_status & HCP_CABAC_ERROR_MASK;
                diagnostics.affected_units = match entry.codec {
                    CodecKind::Vp9 => record.unit_count & VP9_AFFECTED_UNIT_MASK,
                    _ => (record.unit_count & HEVC_AFFECTED_CTB_MASK) >> HEVC_AFFECTED_CTB_SHIFT,
                };
                (diagnostics.error_flags != 0).then_some(MediaError::HardwareReportedError {
                    flags: diagnostics.error_flags,
                    affected_units: diagnostics.affected_units,
                })
            }
            STATUS_QUERY_SKIPPED => None,
            other => Some(MediaError::HardwareReportedError {
                flags: other,
                affected_units: 0,
            }),
        };
        if let Some(err) = &error {
            warn!("Unit {} completed with {}", unit_id, err);
        }
        CompletedReport {
            unit_id,
            error,
            diagnostics,
        }
    }

    /// Check whether `unit_id` has completed. A completed record is retired
    /// and published to subscribers.
    pub fn poll(&mut self, unit_id: u32) -> Result<PollResult> {
        let entry = *self
            .in_flight
            .get(&unit_id)
            .ok_or_else(|| MediaError::invalid(format!("unit {unit_id} unknown or already retired")))?;
        if self.open == Some(unit_id) {
            return Ok(PollResult::Pending);
        }

        let global = self.memory.read_u32(0)?;
        if (global.wrapping_sub(entry.sw_count) as i32) < 0 {
            return Ok(PollResult::Pending);
        }

        let record = self.read_record(entry.slot)?;
        let report = self.decode(unit_id, entry, &record);
        self.in_flight.remove(&unit_id);
        self.sender.send_replace(Some(report.clone()));
        debug!("Unit {} retired with code {}", unit_id, report.code());
        Ok(PollResult::Complete(report))
    }
}

/// Async waiter over a shared status report.
#[derive(Clone)]
pub struct StatusMonitor {
    report: Arc<Mutex<StatusReport>>,
    period: Duration,
}

impl StatusMonitor {
    pub fn new(report: Arc<Mutex<StatusReport>>, period: Duration) -> Self {
        Self { report, period }
    }

    /// Poll `unit_id` every period until it completes.
    pub async fn wait_for(&self, unit_id: u32) -> Result<CompletedReport> {
        let mut ticker = tokio::time::interval(self.period);
        loop {
            ticker.tick().await;
            let result = {
                let mut report = self
                    .report
                    .lock()
                    .map_err(|_| MediaError::missing("status report lock poisoned"))?;
                report.poll(unit_id)?
            };
            if let PollResult::Complete(done) = result {
                return Ok(done);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdbuf::CommandBuffer;
    use crate::encoder::{create_encoder, Generation};
    use crate::engine::SimulatedEngine;

    fn run_frame(
        report: &mut StatusReport,
        tracker: &ResourceTracker,
        unit_id: u32,
        codec: CodecKind,
        registers: &[(u32, u32)],
    ) {
        let encoder = create_encoder(Generation::Gen12);
        let mut cb = CommandBuffer::new(1024, 16, MAX_COMMAND_BUFFER_SIZE);
        for cmd in report.start(unit_id, codec, encoder.as_ref(), tracker).unwrap() {
            cb.append(&cmd).unwrap();
        }
        for cmd in report.end(unit_id, encoder.as_ref(), tracker, 0).unwrap() {
            cb.append(&cmd).unwrap();
        }
        cb.append(&encoder.batch_buffer_end().unwrap()).unwrap();

        let mut engine = SimulatedEngine::new(tracker);
        for &(reg, value) in registers {
            engine.set_register(reg, value);
        }
        engine.run(&[cb.as_bytes()]).unwrap();
        report.reset().unwrap();
    }

    #[test]
    fn test_success_after_completion() {
        let mut tracker = ResourceTracker::new();
        let mut report = StatusReport::new(&mut tracker, 4, StatusOptions::default()).unwrap();
        let mut rx = report.subscribe();

        let encoder = create_encoder(Generation::Gen12);
        report.start(7, CodecKind::Hevc, encoder.as_ref(), &tracker).unwrap();
        assert_eq!(report.poll(7).unwrap(), PollResult::Pending);
        report.end(7, encoder.as_ref(), &tracker, 0).unwrap();
        // Not executed yet.
        assert_eq!(report.poll(7).unwrap(), PollResult::Pending);
        report.reset().unwrap();

        let mut report2 = StatusReport::new(&mut tracker, 4, StatusOptions::default()).unwrap();
        run_frame(&mut report2, &tracker, 8, CodecKind::Hevc, &[]);
        match report2.poll(8).unwrap() {
            PollResult::Complete(done) => {
                assert!(done.is_success());
                assert_eq!(done.diagnostics.raw_status, STATUS_QUERY_END_FLAG);
            }
            PollResult::Pending => panic!("frame should be complete"),
        }
        assert!(matches!(report2.poll(8), Err(MediaError::InvalidParameter(_))));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_hevc_error_flags_and_affected_ctbs() {
        let mut tracker = ResourceTracker::new();
        let mut report = StatusReport::new(&mut tracker, 2, StatusOptions::default()).unwrap();
        let mmio = create_encoder(Generation::Gen12).mmio(0).unwrap();
        run_frame(
            &mut report,
            &tracker,
            1,
            CodecKind::Hevc,
            &[(mmio.dec_status, 0x0801), (mmio.cabac_status, 5 << 18)],
        );
        let PollResult::Complete(done) = report.poll(1).unwrap() else {
            panic!("frame should be complete");
        };
        assert_eq!(
            done.error,
            Some(MediaError::HardwareReportedError {
                flags: 0x0801,
                affected_units: 5
            })
        );
        assert_eq!(done.code(), MEDIA_ERROR_HARDWARE_REPORTED);
    }

    #[test]
    fn test_vp9_affected_units_low_bits() {
        let mut tracker = ResourceTracker::new();
        let options = StatusOptions {
            frame_tracking: false,
            report_crc: true,
        };
        let mut report = StatusReport::new(&mut tracker, 2, options).unwrap();
        let mmio = create_encoder(Generation::Gen12).mmio(0).unwrap();
        run_frame(
            &mut report,
            &tracker,
            3,
            CodecKind::Vp9,
            &[(mmio.dec_status, 0x0008), (mmio.cabac_status, 0xABCD_0012), (mmio.frame_crc, 0x1234)],
        );
        let PollResult::Complete(done) = report.poll(3).unwrap() else {
            panic!("frame should be complete");
        };
        assert_eq!(done.diagnostics.affected_units, 0x12);
        assert_eq!(done.diagnostics.crc, Some(0x1234));
        assert!(!done.is_success());
    }

    #[test]
    fn test_ring_rules() {
        let mut tracker = ResourceTracker::new();
        assert!(StatusReport::new(&mut tracker, 3, StatusOptions::default()).is_err());

        let encoder = create_encoder(Generation::Gen11);
        let mut report = StatusReport::new(&mut tracker, 1, StatusOptions::default()).unwrap();
        report.start(1, CodecKind::Hevc, encoder.as_ref(), &tracker).unwrap();
        assert!(matches!(
            report.start(2, CodecKind::Hevc, encoder.as_ref(), &tracker),
            Err(MediaError::SynchronizationContractViolation(_))
        ));
        assert!(matches!(report.reset(), Err(MediaError::SynchronizationContractViolation(_))));
        report.end(1, encoder.as_ref(), &tracker, 0).unwrap();
        report.reset().unwrap();
        assert!(matches!(
            report.start(2, CodecKind::Hevc, encoder.as_ref(), &tracker),
            Err(MediaError::InvalidParameter(_))
        ));

        // Cancelling frees the ring entry and the open record.
        assert!(report.cancel(1));
        report.start(2, CodecKind::Hevc, encoder.as_ref(), &tracker).unwrap();
        assert!(report.cancel(2));
        assert!(!report.cancel(2));
        report.reset().unwrap();
        assert_eq!(report.pending(), 0);
    }

    #[test]
    fn test_slot_kept_until_retired() {
        let mut tracker = ResourceTracker::new();
        let mut report = StatusReport::new(&mut tracker, 2, StatusOptions::default()).unwrap();
        let encoder = create_encoder(Generation::Gen12);
        let mmio = encoder.mmio(0).unwrap();
        run_frame(&mut report, &tracker, 1, CodecKind::Hevc, &[(mmio.dec_status, 0x0001)]);
        run_frame(&mut report, &tracker, 2, CodecKind::Hevc, &[]);
        assert!(matches!(report.poll(2).unwrap(), PollResult::Complete(_)));

        // Unit 3 maps onto unit 1's slot while unit 1 is unread.
        assert!(matches!(
            report.start(3, CodecKind::Hevc, encoder.as_ref(), &tracker),
            Err(MediaError::InvalidParameter(_))
        ));
        let PollResult::Complete(done) = report.poll(1).unwrap() else {
            panic!("unit 1 should be complete");
        };
        assert_eq!(
            done.error,
            Some(MediaError::HardwareReportedError {
                flags: 0x0001,
                affected_units: 0
            })
        );
        report.start(3, CodecKind::Hevc, encoder.as_ref(), &tracker).unwrap();
    }

    #[tokio::test]
    async fn test_monitor_waits_for_completion() {
        let mut tracker = ResourceTracker::new();
        let encoder = create_encoder(Generation::Gen12);
        let mut report = StatusReport::new(&mut tracker, 4, StatusOptions::default()).unwrap();
        report.start(11, CodecKind::Hevc, encoder.as_ref(), &tracker).unwrap();
        report.end(11, encoder.as_ref(), &tracker, 0).unwrap();
        let slot_status = report.completion_address(11, StatusField::Status).unwrap();
        let tag = report.next_tag();
        report.reset().unwrap();

        let memory = tracker.host_memory(report.buffer()).unwrap();
        let mut rx = report.subscribe();
        let shared = Arc::new(Mutex::new(report));
        let monitor = StatusMonitor::new(shared.clone(), Duration::from_millis(5));

        let hw = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            memory.write_u32(slot_status.offset, STATUS_QUERY_END_FLAG).unwrap();
            memory.write_u32(0, tag).unwrap();
        });

        let done = monitor.wait_for(11).await.unwrap();
        hw.await.unwrap();
        assert!(done.is_success());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|r| r.unit_id), Some(11));
        assert_eq!(shared.lock().unwrap().pending(), 0);
    }
}
