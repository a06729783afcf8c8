//! Multi step jobs built out of actions.
//!
//! An [`Operation`] hands out one action at a time and decides what to do
//! once that action completes. The [`OperationRunner`] drives an operation
//! from the interface events of the communication loop, so nothing here
//! blocks on the ECU.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::{debug, info, warn};

use crate::{
    actions::{self, ActionReport, AnyAction, Dtc, diagnostic::DataIdentifier},
    identification::IdentificationInfo,
    kwp2000::{ConnectionStatus, InterfaceEvent, Link},
    memory::{MemoryImage, TaggedMemoryImage},
};

pub mod data_logging;
pub mod identification;
pub mod preamble;
pub mod read_flash;
pub mod relocate;
pub mod sequential;
pub mod sync;
pub mod write_flash;

pub use data_logging::{DataLoggingSettings, ExtendedDataLogging};
pub use identification::ReadAllEcuIdentification;
pub use preamble::{Preamble, PreambleSettings, SessionSettings};
pub use read_flash::{ReadExternalFlash, ReadFlashSettings};
pub use relocate::{RelocateMessageHandlingTable, RelocationPayload};
pub use sequential::SequentialOperation;
pub use sync::{RegionSyncSettings, SynchronizeRamRegions};
pub use write_flash::{FlashReport, WriteExternalFlash, WriteFlashSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    OkCancel,
    YesNoCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Ok,
    Yes,
    No,
    Cancel,
}

/// Somebody who can decide how an operation continues.
pub trait UserPrompt: Send {
    fn ask(&mut self, title: &str, message: &str, kind: PromptKind) -> PromptAnswer;
}

/// Answers every question with OK or Yes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl UserPrompt for AcceptAll {
    fn ask(&mut self, title: &str, message: &str, kind: PromptKind) -> PromptAnswer {
        info!(title, "{message}");
        match kind {
            PromptKind::OkCancel => PromptAnswer::Ok,
            PromptKind::YesNoCancel => PromptAnswer::Yes,
        }
    }
}

/// Answers every question with Cancel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelAll;

impl UserPrompt for CancelAll {
    fn ask(&mut self, title: &str, message: &str, _kind: PromptKind) -> PromptAnswer {
        info!(title, "{message}");
        PromptAnswer::Cancel
    }
}

/// Published while an operation runs
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    /// Fraction done, between 0 and 1
    Progress(f32),
    RegionsRead(Vec<TaggedMemoryImage>),
}

/// What a finished operation hands back.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OperationOutput {
    #[default]
    None,
    Memory(MemoryImage),
    Flash(Vec<MemoryImage>),
    Flashed(FlashReport),
    Dtcs(Vec<Dtc>),
    ChecksumMatches(bool),
    Identification(IdentificationInfo),
    Identifiers(Vec<(DataIdentifier, Vec<u8>)>),
}

/// What an operation can use while deciding its next step
pub struct Context<'a> {
    pub link: &'a mut dyn Link,
    pub prompt: &'a mut dyn UserPrompt,
    events: &'a mut Vec<OperationEvent>,
}

impl<'a> Context<'a> {
    pub fn new(
        link: &'a mut dyn Link,
        prompt: &'a mut dyn UserPrompt,
        events: &'a mut Vec<OperationEvent>,
    ) -> Self {
        Self {
            link,
            prompt,
            events,
        }
    }

    pub fn emit(&mut self, event: OperationEvent) {
        self.events.push(event);
    }

    pub fn ask(&mut self, title: &str, message: &str, kind: PromptKind) -> PromptAnswer {
        let answer = self.prompt.ask(title, message, kind);
        debug!(title, ?answer, "user answered prompt");
        answer
    }
}

pub enum Step {
    /// Start this action and report back when it completes
    Run(AnyAction),
    /// Nothing to do yet, ask again on the next event or poll
    Wait,
    /// The connection has to be opened again before continuing
    Reconnect,
    Finished(bool),
}

pub trait Operation: Send {
    fn name(&self) -> &'static str;

    fn next(&mut self, cx: &mut Context<'_>) -> Step;

    /// Called with every action handed out by [`Operation::next`] once it
    /// completes. Returning false fails the operation.
    fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool;

    /// Returning false fails the operation.
    fn connection_changed(&mut self, _cx: &mut Context<'_>, status: ConnectionStatus) -> bool {
        !matches!(
            status,
            ConnectionStatus::Disconnected | ConnectionStatus::CommunicationTerminated
        )
    }

    fn progress(&self, _running: Option<&AnyAction>) -> Option<f32> {
        None
    }

    fn into_output(self: Box<Self>) -> OperationOutput {
        OperationOutput::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Running,
    /// The interface has to be opened again
    NeedsReconnect,
    Finished(bool),
}

/// Drives one operation from interface events.
pub struct OperationRunner {
    operation: Box<dyn Operation>,
    running: Option<AnyAction>,
    result: Option<bool>,
    abort: Arc<AtomicBool>,
    last_progress: Option<u16>,
}

impl OperationRunner {
    pub fn new(operation: Box<dyn Operation>) -> Self {
        Self {
            operation,
            running: None,
            result: None,
            abort: Arc::new(AtomicBool::new(false)),
            last_progress: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.operation.name()
    }

    /// Setting the flag fails the operation at its next step
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn result(&self) -> Option<bool> {
        self.result
    }

    /// Operations only start on an open connection.
    pub fn start(&mut self, cx: &mut Context<'_>) -> RunnerState {
        if !cx.link.is_connected() {
            info!(operation = self.name(), "can't start operation without a connection");
            return self.finish(false);
        }
        info!(operation = self.name(), "starting operation");
        self.advance(cx)
    }

    pub fn handle_event(&mut self, cx: &mut Context<'_>, event: &InterfaceEvent) -> RunnerState {
        if let Some(success) = self.result {
            return RunnerState::Finished(success);
        }

        if let Some(action) = &mut self.running {
            actions::dispatch(action.as_action_mut(), cx.link, event);
        }
        if let InterfaceEvent::Connection(status) = event {
            if !self.operation.connection_changed(cx, *status) {
                info!(operation = self.name(), %status, "operation lost its connection");
                return self.finish(false);
            }
        }
        self.advance(cx)
    }

    /// Feeds completed actions back and starts new ones until the
    /// operation has to wait for the ECU.
    pub fn advance(&mut self, cx: &mut Context<'_>) -> RunnerState {
        loop {
            if let Some(success) = self.result {
                return RunnerState::Finished(success);
            }
            if self.abort.load(Ordering::Relaxed) {
                warn!(operation = self.name(), "operation aborted");
                return self.finish(false);
            }

            if let Some(mut action) = self.running.take() {
                match action.as_action_mut().core_mut().take_report() {
                    Some(report) => {
                        debug!(
                            operation = self.name(),
                            action = ?action,
                            success = report.success,
                            communication_error = !report.completed_without_communication_error,
                            "action completed"
                        );
                        if !self.operation.completed(cx, action, report) {
                            return self.finish(false);
                        }
                        self.update_progress(cx);
                        continue;
                    }
                    None => {
                        self.running = Some(action);
                        self.update_progress(cx);
                        return RunnerState::Running;
                    }
                }
            }

            match self.operation.next(cx) {
                Step::Run(mut action) => {
                    actions::start(action.as_action_mut(), cx.link);
                    self.running = Some(action);
                }
                Step::Wait => return RunnerState::Running,
                Step::Reconnect => return RunnerState::NeedsReconnect,
                Step::Finished(success) => return self.finish(success),
            }
        }
    }

    pub fn into_output(self) -> OperationOutput {
        self.operation.into_output()
    }

    fn finish(&mut self, success: bool) -> RunnerState {
        if self.result.is_none() {
            if success {
                info!(operation = self.name(), "operation finished");
            } else {
                warn!(operation = self.name(), "operation failed");
            }
            self.result = Some(success);
            self.running = None;
        }
        RunnerState::Finished(self.result == Some(true))
    }

    fn update_progress(&mut self, cx: &mut Context<'_>) {
        let Some(progress) = self.operation.progress(self.running.as_ref()) else {
            return;
        };
        let progress = progress.clamp(0.0, 1.0);
        // report in steps of a tenth of a percent
        let step = (progress * 1000.0) as u16;
        if self.last_progress != Some(step) {
            self.last_progress = Some(step);
            cx.emit(OperationEvent::Progress(progress));
        }
    }
}

#[cfg(test)]
pub(crate) mod test_ecu {
    //! Runs operations against a scripted ECU.

    use std::collections::VecDeque;

    use super::*;
    use crate::{
        actions::test_link::*,
        kwp2000::{Message, ResponsesFinished, constants::*},
    };

    pub use super::{OperationEvent, RunnerState};

    /// The answer the scripted ECU gives to one request
    pub enum Reply {
        Positive(Vec<u8>),
        Negative(ResponseCode),
        Silence,
    }

    /// Prompt answering from a list, Cancel once it runs out.
    #[derive(Default)]
    pub struct ScriptedPrompt {
        pub answers: VecDeque<PromptAnswer>,
        pub asked: Vec<String>,
    }

    impl ScriptedPrompt {
        pub fn new(answers: &[PromptAnswer]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                asked: Vec::new(),
            }
        }
    }

    impl UserPrompt for ScriptedPrompt {
        fn ask(&mut self, title: &str, _message: &str, _kind: PromptKind) -> PromptAnswer {
            self.asked.push(title.to_string());
            self.answers.pop_front().unwrap_or(PromptAnswer::Cancel)
        }
    }

    pub struct Harness {
        pub link: TestLink,
        pub prompt: ScriptedPrompt,
        pub events: Vec<OperationEvent>,
        pub runner: OperationRunner,
        answered: usize,
    }

    impl Harness {
        pub fn new(operation: impl Operation + 'static) -> Self {
            Self {
                link: TestLink::default(),
                prompt: ScriptedPrompt::default(),
                events: Vec::new(),
                runner: OperationRunner::new(Box::new(operation)),
                answered: 0,
            }
        }

        pub fn with_prompt(mut self, answers: &[PromptAnswer]) -> Self {
            self.prompt = ScriptedPrompt::new(answers);
            self
        }

        pub fn start(&mut self) -> RunnerState {
            let mut cx = Context::new(&mut self.link, &mut self.prompt, &mut self.events);
            self.runner.start(&mut cx)
        }

        pub fn event(&mut self, event: InterfaceEvent) -> RunnerState {
            let mut cx = Context::new(&mut self.link, &mut self.prompt, &mut self.events);
            self.runner.handle_event(&mut cx, &event)
        }

        pub fn advance(&mut self) -> RunnerState {
            let mut cx = Context::new(&mut self.link, &mut self.prompt, &mut self.events);
            self.runner.advance(&mut cx)
        }

        /// Answers requests with `ecu` until the operation stops sending.
        pub fn run(&mut self, mut ecu: impl FnMut(&Message) -> Reply) -> RunnerState {
            let mut state = self.start();
            while state == RunnerState::Running && self.answered < self.link.sent.len() {
                let id = self.answered;
                self.answered += 1;
                let request = self.link.sent[id].clone();

                let reply = ecu(&request);
                let received_any = !matches!(reply, Reply::Silence);
                match reply {
                    Reply::Positive(data) => {
                        state = self.event(response(request.service | 0x40, &data));
                    }
                    Reply::Negative(code) => {
                        state = self.event(response(
                            ServiceResponse::NegativeResponse as u8,
                            &[request.service, code as u8],
                        ));
                    }
                    Reply::Silence => {}
                }
                if state != RunnerState::Running {
                    break;
                }
                state = self.event(InterfaceEvent::Finished(ResponsesFinished {
                    id: id as u64,
                    service: request.service,
                    sent_properly: true,
                    received_any,
                    waited_for_all: true,
                    retries: 0,
                }));
            }
            state
        }

        pub fn requests(&self) -> Vec<(u8, Vec<u8>)> {
            self.link.requests()
        }

        pub fn output(self) -> OperationOutput {
            self.runner.into_output()
        }
    }
}
