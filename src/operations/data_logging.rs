//! Logs tracked RAM variables through the injected define/read variable
//! services.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    Context, Operation, OperationEvent, Preamble, PreambleSettings, SessionSettings, Step,
    relocate::{RelocateMessageHandlingTable, RelocationPayload},
};
use crate::{
    actions::{
        ActionReport, AnyAction, DefineVariables, ReadVariables,
        variables::{MAX_VARIABLES_PER_DEFINE, Variable, VariableSize},
    },
    kwp2000::constants::{DiagnosticSession, ResponseCode},
    memory::{MemoryImage, RegionTag, SharedRegions, TaggedMemoryImage},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLoggingSettings {
    /// Zero or less reads as fast as the ECU answers
    pub max_reads_per_second: f32,
    /// How often the ECU samples the variables between two reads
    pub max_variable_reads_per_tick: u8,
    pub max_bytes_per_read: u8,
}

impl Default for DataLoggingSettings {
    fn default() -> Self {
        Self {
            max_reads_per_second: 20.0,
            max_variable_reads_per_tick: 255,
            max_bytes_per_read: 64,
        }
    }
}

impl DataLoggingSettings {
    pub fn read_interval(&self) -> Option<Duration> {
        (self.max_reads_per_second.is_finite() && self.max_reads_per_second > 0.0)
            .then(|| Duration::from_secs_f32(1.0 / self.max_reads_per_second))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoggingState {
    Define,
    Read,
    Relocate,
}

type Region = (u32, u32, RegionTag);

/// Defines the tracked regions as variables and reads them over and over,
/// defining them again whenever the tracked set changes.
///
/// Regions are byte or word sized, larger ones are logged as words. When
/// the ECU doesn't know the define service and a relocation payload was
/// given, the handlers are injected first.
pub struct ExtendedDataLogging {
    preamble: Preamble,
    session: SessionSettings,
    settings: DataLoggingSettings,
    regions: SharedRegions,
    payload: Option<RelocationPayload>,
    relocation: Option<Box<RelocateMessageHandlingTable>>,
    relocated: bool,
    state: LoggingState,
    revision: Option<u64>,
    /// Regions in the order they were defined
    defined: Vec<Region>,
    next_read: Option<Instant>,
}

impl ExtendedDataLogging {
    pub fn new(session: &SessionSettings, settings: DataLoggingSettings, regions: SharedRegions) -> Self {
        Self {
            preamble: Preamble::new(
                PreambleSettings::session(DiagnosticSession::Development, session).with_timing(session),
            ),
            session: session.clone(),
            settings,
            regions,
            payload: None,
            relocation: None,
            relocated: false,
            state: LoggingState::Define,
            revision: None,
            defined: Vec::new(),
            next_read: None,
        }
    }

    /// Injects the payload's handlers if the ECU lacks them.
    pub fn with_relocation(mut self, payload: RelocationPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    fn refresh(&mut self) {
        let regions = self.regions.lock();
        if self.revision == Some(regions.revision()) {
            return;
        }
        self.revision = Some(regions.revision());
        self.defined = regions
            .iter()
            .filter(|(_, size, _)| *size > 0)
            .take(MAX_VARIABLES_PER_DEFINE)
            .collect();
        self.state = LoggingState::Define;
    }

    fn variables(&self) -> Vec<Variable> {
        self.defined
            .iter()
            .map(|(start, size, _)| {
                let size = VariableSize::from_len(*size).unwrap_or(VariableSize::Word);
                Variable::new(*start, size)
            })
            .collect()
    }

    fn rate_limit(&mut self) -> bool {
        let Some(interval) = self.settings.read_interval() else {
            return true;
        };
        let now = Instant::now();
        match self.next_read {
            Some(next_read) if now < next_read => false,
            Some(next_read) => {
                self.next_read = Some((next_read + interval).max(now));
                true
            }
            None => {
                self.next_read = Some(now + interval);
                true
            }
        }
    }

    fn relocation_next(&mut self, cx: &mut Context<'_>) -> Step {
        let Some(relocation) = &mut self.relocation else {
            return Step::Finished(false);
        };
        match relocation.next(cx) {
            Step::Finished(true) => {
                info!("data logging handlers installed");
                self.relocation = None;
                self.state = LoggingState::Define;
                self.next(cx)
            }
            step => step,
        }
    }

    fn define_failed(&mut self, failure_code: Option<u8>) -> bool {
        if failure_code != Some(ResponseCode::ServiceNotSupported as u8) {
            warn!("failed to define data logging variables with the ECU");
            return false;
        }
        if self.relocated {
            warn!("data logging handlers still missing after installing them");
            return false;
        }
        let Some(payload) = self.payload.clone() else {
            warn!("the ECU has no data logging handlers installed");
            return false;
        };
        info!("data logging handlers are missing, installing them");
        self.relocated = true;
        self.relocation = Some(Box::new(RelocateMessageHandlingTable::new(&self.session, payload)));
        self.state = LoggingState::Relocate;
        true
    }

    fn values_read(&mut self, cx: &mut Context<'_>, values: Vec<Vec<u8>>) {
        let read: Vec<_> = self
            .defined
            .iter()
            .zip(values)
            .map(|((start, _, tag), value)| TaggedMemoryImage {
                image: MemoryImage::new(*start, value),
                tag: *tag,
            })
            .collect();
        if !read.is_empty() {
            cx.emit(OperationEvent::RegionsRead(read));
        }
    }
}

impl std::fmt::Debug for ExtendedDataLogging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendedDataLogging")
            .field("state", &self.state)
            .field("defined", &self.defined.len())
            .field("relocated", &self.relocated)
            .finish()
    }
}

impl Operation for ExtendedDataLogging {
    fn name(&self) -> &'static str {
        "ExtendedDataLogging"
    }

    fn next(&mut self, cx: &mut Context<'_>) -> Step {
        if let Some(action) = self.preamble.next(cx.link) {
            return Step::Run(action);
        }
        if self.state == LoggingState::Relocate {
            return self.relocation_next(cx);
        }
        self.refresh();
        if self.defined.is_empty() {
            return Step::Wait;
        }
        let ready = self.state == LoggingState::Read && self.rate_limit();
        match self.state {
            LoggingState::Define => {
                info!(variables = self.defined.len(), "defining data logging variables");
                Step::Run(DefineVariables::new(&self.variables()).into())
            }
            LoggingState::Read if ready => {
                let sizes = self.variables().iter().map(|variable| variable.size).collect();
                Step::Run(
                    ReadVariables::new(
                        sizes,
                        self.settings.max_variable_reads_per_tick,
                        self.settings.max_bytes_per_read,
                    )
                    .into(),
                )
            }
            _ => Step::Wait,
        }
    }

    fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool {
        if self.preamble.is_running() {
            return self.preamble.completed(cx, &action, report);
        }
        match (self.state, action) {
            (LoggingState::Relocate, action) => match &mut self.relocation {
                Some(relocation) => relocation.completed(cx, action, report),
                None => false,
            },
            (LoggingState::Define, AnyAction::DefineVariables(define)) => {
                if report.success {
                    info!(defined = define.defined(), "ECU defined data logging variables");
                    self.state = LoggingState::Read;
                    true
                } else if report.completed_without_communication_error {
                    self.define_failed(define.failure_code())
                } else {
                    false
                }
            }
            (LoggingState::Read, AnyAction::ReadVariables(read)) => {
                if !report.success {
                    warn!("failed to read data logging variables from the ECU");
                    return false;
                }
                debug!(values = read.values().len(), "data logging variables read");
                self.values_read(cx, read.into_values());
                true
            }
            // a define started before the regions changed
            (_, _) => report.success,
        }
    }
}
