//! Keeps tracked RAM regions up to date by reading them over and over.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{
    Context, Operation, OperationEvent, Preamble, PreambleSettings, SessionSettings, Step,
};
use crate::{
    actions::{ActionReport, AnyAction, ReadMemory},
    kwp2000::constants::{DiagnosticSession, ResponseCode},
    memory::{MemoryImage, RegionTag, SharedRegions, TaggedMemoryImage},
};

/// Address and size bytes in front of the data of a read request
const READ_REQUEST_OVERHEAD: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionSyncSettings {
    /// Zero or less reads as fast as the ECU answers
    pub max_reads_per_second: f32,
    /// Larger reads at high baud rates have been seen to reset a running
    /// engine
    pub max_bytes_per_read: u8,
    /// Read neighbouring regions with one request
    pub coalesce: bool,
}

impl Default for RegionSyncSettings {
    fn default() -> Self {
        Self {
            max_reads_per_second: 20.0,
            max_bytes_per_read: 64,
            coalesce: true,
        }
    }
}

impl RegionSyncSettings {
    pub fn read_interval(&self) -> Option<Duration> {
        (self.max_reads_per_second.is_finite() && self.max_reads_per_second > 0.0)
            .then(|| Duration::from_secs_f32(1.0 / self.max_reads_per_second))
    }
}

type Region = (u32, u32, RegionTag);

/// Round robins through the tracked regions in address order.
///
/// Regions can be added and removed through the shared set while the
/// operation runs. It only ends when aborted or on a communication error.
pub struct SynchronizeRamRegions {
    preamble: Preamble,
    settings: RegionSyncSettings,
    regions: SharedRegions,
    snapshot: Vec<Region>,
    revision: Option<u64>,
    cursor: usize,
    /// Regions covered by the running read
    pending: Vec<Region>,
    next_read: Option<Instant>,
}

impl SynchronizeRamRegions {
    pub fn new(session: &SessionSettings, settings: RegionSyncSettings, regions: SharedRegions) -> Self {
        Self {
            preamble: Preamble::new(
                PreambleSettings::session(DiagnosticSession::Development, session).with_timing(session),
            ),
            settings,
            regions,
            snapshot: Vec::new(),
            revision: None,
            cursor: 0,
            pending: Vec::new(),
            next_read: None,
        }
    }

    /// Picks up added or removed regions, starting over from the lowest
    /// address when anything changed.
    fn refresh(&mut self) {
        let regions = self.regions.lock();
        if self.revision == Some(regions.revision()) {
            return;
        }
        self.revision = Some(regions.revision());
        self.snapshot = regions.iter().collect();
        self.cursor = 0;
        debug!(regions = self.snapshot.len(), "tracked regions changed");
    }

    /// Takes the regions for the next read, returns the range to read.
    fn next_regions(&mut self) -> Option<(u32, u32)> {
        let first = *self.snapshot.get(self.cursor % self.snapshot.len().max(1))?;
        let (start, _, _) = first;
        let limit = start as u64 + self.settings.max_bytes_per_read.max(1) as u64;

        self.pending.clear();
        let mut end = start as u64;
        for offset in 0..self.snapshot.len() {
            let region = self.snapshot[(self.cursor + offset) % self.snapshot.len()];
            let (region_start, size, _) = region;
            let region_end = region_start as u64 + size as u64;
            let fits = region_start >= start && region_end <= limit;
            if offset > 0 && !(self.settings.coalesce && fits) {
                break;
            }
            self.pending.push(region);
            end = end.max(region_end);
        }
        self.cursor = (self.cursor + self.pending.len()) % self.snapshot.len();
        Some((start, (end - start as u64) as u32))
    }

    /// Waits out the read rate, returns false if it is too early to read.
    fn rate_limit(&mut self) -> bool {
        let Some(interval) = self.settings.read_interval() else {
            return true;
        };
        let now = Instant::now();
        match self.next_read {
            Some(next_read) if now < next_read => false,
            Some(next_read) => {
                // keep the cadence unless we fell behind by a whole interval
                self.next_read = Some((next_read + interval).max(now));
                true
            }
            None => {
                self.next_read = Some(now + interval);
                true
            }
        }
    }

    fn regions_read(&mut self, cx: &mut Context<'_>, image: &MemoryImage) {
        let read: Vec<_> = self
            .pending
            .drain(..)
            .filter_map(|(start, size, tag)| {
                let data = image.slice(start, size)?.to_vec();
                Some(TaggedMemoryImage {
                    image: MemoryImage::new(start, data),
                    tag,
                })
            })
            .collect();
        if !read.is_empty() {
            cx.emit(OperationEvent::RegionsRead(read));
        }
    }
}

impl Operation for SynchronizeRamRegions {
    fn name(&self) -> &'static str {
        "SynchronizeRamRegions"
    }

    fn next(&mut self, cx: &mut Context<'_>) -> Step {
        if let Some(action) = self.preamble.next(cx.link) {
            return Step::Run(action);
        }
        self.refresh();
        if self.snapshot.is_empty() || !self.rate_limit() {
            return Step::Wait;
        }
        let Some((start, size)) = self.next_regions() else {
            return Step::Wait;
        };
        trace!("reading {size:#x} bytes at {start:#08x}");
        let max_block_size = self
            .settings
            .max_bytes_per_read
            .max(1)
            .saturating_add(READ_REQUEST_OVERHEAD);
        Step::Run(ReadMemory::new(start, size, max_block_size).into())
    }

    fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool {
        if self.preamble.is_running() {
            return self.preamble.completed(cx, &action, report);
        }
        let AnyAction::ReadMemory(read) = action else {
            return report.success;
        };
        if report.success {
            self.regions_read(cx, read.image());
            return true;
        }

        self.pending.clear();
        debug!(
            start = format_args!("{:#08x}", read.image().start),
            size = read.image().size(),
            "region read failed"
        );
        // unreadable addresses are skipped, the service missing entirely is not
        report.completed_without_communication_error
            && read.failure_code() != Some(ResponseCode::ServiceNotSupported as u8)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::super::{RunnerState, test_ecu::*};
    use super::*;
    use crate::{
        actions::test_link::response,
        kwp2000::{InterfaceEvent, Message, ResponsesFinished, constants::*},
        memory::TrackedRegions,
    };
    use pretty_assertions::assert_eq;

    fn unlimited() -> RegionSyncSettings {
        RegionSyncSettings {
            max_reads_per_second: 0.0,
            max_bytes_per_read: 16,
            coalesce: true,
        }
    }

    fn session() -> SessionSettings {
        SessionSettings {
            baud_rates: vec![baud::UNSPECIFIED],
            negotiate_timing: false,
            ..SessionSettings::default()
        }
    }

    fn regions(list: &[(u32, u32, RegionTag)]) -> SharedRegions {
        let mut regions = TrackedRegions::default();
        for (start, size, tag) in list {
            regions.add(*start, *size, *tag);
        }
        Arc::new(Mutex::new(regions))
    }

    /// Memory where every byte holds the low byte of its address
    fn ram(request: &Message) -> Reply {
        match request.service {
            0x10 => Reply::Positive(request.data.clone()),
            0x23 => {
                let address = u32::from_be_bytes([0, request.data[0], request.data[1], request.data[2]]);
                let size = request.data[3] as u32;
                Reply::Positive((address..address + size).map(|a| a as u8).collect())
            }
            _ => Reply::Negative(ResponseCode::ServiceNotSupported),
        }
    }

    /// Answers the requests sent so far, returns the state after the last
    fn answer(harness: &mut Harness, answered: &mut usize) -> RunnerState {
        let mut state = harness.advance();
        let sent = harness.link.sent.len();
        while *answered < sent {
            let id = *answered;
            *answered += 1;
            let request = harness.link.sent[id].clone();
            if let Reply::Positive(data) = ram(&request) {
                harness.event(response(request.service | 0x40, &data));
            }
            state = harness.event(InterfaceEvent::Finished(ResponsesFinished {
                id: id as u64,
                service: request.service,
                sent_properly: true,
                received_any: true,
                waited_for_all: true,
                retries: 0,
            }));
        }
        state
    }

    fn reads(harness: &Harness) -> Vec<(u32, u8)> {
        harness
            .requests()
            .into_iter()
            .filter(|(service, _)| *service == 0x23)
            .map(|(_, data)| (u32::from_be_bytes([0, data[0], data[1], data[2]]), data[3]))
            .collect()
    }

    #[test]
    fn coalesces_neighbouring_regions() {
        let tracked = regions(&[(0x380000, 2, 1), (0x380004, 4, 2), (0x380020, 2, 3)]);
        let mut harness = Harness::new(SynchronizeRamRegions::new(&session(), unlimited(), tracked));
        let mut answered = 0;
        assert_eq!(harness.start(), RunnerState::Running);
        for _ in 0..4 {
            assert_eq!(answer(&mut harness, &mut answered), RunnerState::Running);
        }

        assert_eq!(
            reads(&harness)[..4],
            [(0x380000, 8), (0x380020, 2), (0x380000, 8), (0x380020, 2)]
        );
        let first = harness
            .events
            .iter()
            .find_map(|event| match event {
                OperationEvent::RegionsRead(read) => Some(read.clone()),
                _ => None,
            })
            .unwrap_or_default();
        assert_eq!(
            first,
            vec![
                TaggedMemoryImage {
                    image: MemoryImage::new(0x380000, vec![0x00, 0x01]),
                    tag: 1
                },
                TaggedMemoryImage {
                    image: MemoryImage::new(0x380004, vec![0x04, 0x05, 0x06, 0x07]),
                    tag: 2
                },
            ]
        );
    }

    #[test]
    fn reads_regions_one_by_one_without_coalescing() {
        let tracked = regions(&[(0x380000, 2, 1), (0x380004, 4, 2)]);
        let settings = RegionSyncSettings {
            coalesce: false,
            ..unlimited()
        };
        let mut harness = Harness::new(SynchronizeRamRegions::new(&session(), settings, tracked));
        let mut answered = 0;
        harness.start();
        for _ in 0..3 {
            answer(&mut harness, &mut answered);
        }
        assert_eq!(reads(&harness)[..3], [(0x380000, 2), (0x380004, 4), (0x380000, 2)]);
    }

    #[test]
    fn picks_up_new_regions() {
        let tracked = regions(&[(0x380000, 2, 1)]);
        let mut harness =
            Harness::new(SynchronizeRamRegions::new(&session(), unlimited(), tracked.clone()));
        let mut answered = 0;
        harness.start();
        answer(&mut harness, &mut answered);

        tracked.lock().add(0x381000, 2, 2);
        answer(&mut harness, &mut answered);
        answer(&mut harness, &mut answered);
        assert!(reads(&harness).contains(&(0x381000, 2)));

        tracked.lock().clear();
        let before = reads(&harness).len();
        answer(&mut harness, &mut answered);
        answer(&mut harness, &mut answered);
        assert!(reads(&harness).len() <= before + 1);
    }

    #[test]
    fn idles_without_regions() {
        let mut harness =
            Harness::new(SynchronizeRamRegions::new(&session(), unlimited(), regions(&[])));
        assert_eq!(harness.start(), RunnerState::Running);
        assert_eq!(harness.advance(), RunnerState::Running);
        assert!(reads(&harness).is_empty());
    }

    #[test]
    fn rate_limit_spaces_reads() {
        let tracked = regions(&[(0x380000, 2, 1)]);
        let settings = RegionSyncSettings {
            max_reads_per_second: 0.5,
            ..unlimited()
        };
        let mut harness = Harness::new(SynchronizeRamRegions::new(&session(), settings, tracked));
        let mut answered = 0;
        harness.start();
        answer(&mut harness, &mut answered);
        answer(&mut harness, &mut answered);
        assert_eq!(reads(&harness).len(), 1);
    }

    #[test]
    fn unsupported_read_service_fails() {
        let tracked = regions(&[(0x380000, 2, 1)]);
        let mut harness = Harness::new(SynchronizeRamRegions::new(&session(), unlimited(), tracked));
        let state = harness.run(|request| match request.service {
            0x23 => Reply::Negative(ResponseCode::ServiceNotSupported),
            _ => ram(request),
        });
        assert_eq!(state, RunnerState::Finished(false));
    }

    #[test]
    fn refused_address_keeps_running() {
        let tracked = regions(&[(0x380000, 2, 1)]);
        let settings = RegionSyncSettings {
            max_reads_per_second: 0.5,
            ..unlimited()
        };
        let mut harness = Harness::new(SynchronizeRamRegions::new(&session(), settings, tracked));
        let state = harness.run(|request| match request.service {
            0x23 => Reply::Negative(ResponseCode::RequestOutOfRange),
            _ => ram(request),
        });
        assert_eq!(state, RunnerState::Running);
    }
}
