//! Session setup run in front of every operation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Context, PromptAnswer, PromptKind};
use crate::{
    actions::{
        ActionReport, AnyAction, NegotiateTiming, ReadEcuIdentification, SecurityAccess,
        StartDiagnosticSession, TimingTarget, session::should_start_session,
    },
    identification::{FLASH_STATUS_OPTION, FlashStatus},
    kwp2000::{Link, constants::*},
    security::SecuritySettings,
};

/// Connection preferences shared by every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Tried in order when starting a session
    pub baud_rates: Vec<u32>,
    pub negotiate_timing: bool,
    pub security: SecuritySettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            baud_rates: vec![baud::B124800, baud::B52800, baud::B38400, baud::B10400],
            negotiate_timing: true,
            security: SecuritySettings::default(),
        }
    }
}

/// Which preamble steps an operation wants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreambleSettings {
    pub session: Option<DiagnosticSession>,
    pub baud_rates: Vec<u32>,
    pub timing: Option<TimingTarget>,
    pub security: Option<SecuritySettings>,
}

impl PreambleSettings {
    /// Starts `session` at the preferred baud rates and nothing else
    pub fn session(session: DiagnosticSession, settings: &SessionSettings) -> Self {
        Self {
            session: Some(session),
            baud_rates: settings.baud_rates.clone(),
            timing: None,
            security: None,
        }
    }

    /// Leaves the session alone
    pub fn current_session() -> Self {
        Self::default()
    }

    /// Negotiates timing limits if the settings allow it
    pub fn with_timing(mut self, settings: &SessionSettings) -> Self {
        self.timing = settings.negotiate_timing.then_some(TimingTarget::Limits);
        self
    }

    pub fn with_security(mut self, settings: &SessionSettings) -> Self {
        self.security = Some(settings.security);
        self
    }

    fn first_baud_rate(&self) -> u32 {
        self.baud_rates.first().copied().unwrap_or(baud::UNSPECIFIED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreambleState {
    Begin,
    CheckProgrammingPreconditions,
    SwitchToDefaultTiming,
    PreNegotiateSecurity,
    StartDiagnosticSession,
    NegotiateTiming,
    NegotiateSecurity,
    Finished,
}

/// Gets the ECU into the session, timing and security state an operation
/// needs before its own actions run.
///
/// Programming sessions first check the ECU's flash preconditions and drop
/// back to default timing, since fast timing doesn't survive the switch.
#[derive(Debug)]
pub struct Preamble {
    settings: PreambleSettings,
    state: PreambleState,
    running: bool,
}

impl Preamble {
    pub fn new(settings: PreambleSettings) -> Self {
        Self {
            settings,
            state: PreambleState::Begin,
            running: false,
        }
    }

    pub fn settings(&self) -> &PreambleSettings {
        &self.settings
    }

    /// Runs the whole preamble again, for example after a reconnect.
    pub fn reset(&mut self) {
        self.state = PreambleState::Begin;
        self.running = false;
    }

    pub fn is_finished(&self) -> bool {
        self.state == PreambleState::Finished
    }

    /// Whether the action that just completed belongs to the preamble
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The next preamble action, `None` once the preamble is done.
    pub fn next(&mut self, link: &dyn Link) -> Option<AnyAction> {
        if self.running {
            return None;
        }
        let mut state = match self.state {
            PreambleState::Begin => self.begin(link),
            state => self.after(state),
        };
        while state != PreambleState::Finished {
            if let Some(action) = self.action_for(state) {
                debug!(?state, "preamble step");
                self.state = state;
                self.running = true;
                return Some(action);
            }
            state = self.after(state);
        }
        self.state = PreambleState::Finished;
        None
    }

    /// Decides whether a preamble action counts as successful.
    pub fn completed(&mut self, cx: &mut Context<'_>, action: &AnyAction, report: ActionReport) -> bool {
        self.running = false;
        match self.state {
            PreambleState::CheckProgrammingPreconditions => {
                if !report.success {
                    return report.completed_without_communication_error;
                }
                match action {
                    AnyAction::ReadEcuIdentification(read)
                        if read.data().len() >= FlashStatus::LENGTH =>
                    {
                        check_preconditions(cx, FlashStatus::from_bytes(read.data()))
                    }
                    _ => true,
                }
            }
            PreambleState::PreNegotiateSecurity
            | PreambleState::NegotiateTiming
            | PreambleState::SwitchToDefaultTiming => report.completed_without_communication_error,
            _ => report.success,
        }
    }

    fn begin(&self, link: &dyn Link) -> PreambleState {
        let Some(session) = self.settings.session else {
            return self.after(PreambleState::StartDiagnosticSession);
        };
        let programming = session == DiagnosticSession::Programming;
        if should_start_session(link, session, self.settings.first_baud_rate()) {
            if programming {
                PreambleState::CheckProgrammingPreconditions
            } else {
                PreambleState::StartDiagnosticSession
            }
        } else if programming {
            self.after(PreambleState::CheckProgrammingPreconditions)
        } else {
            self.after(PreambleState::StartDiagnosticSession)
        }
    }

    fn after(&self, state: PreambleState) -> PreambleState {
        let security = self.settings.security.is_some();
        match state {
            PreambleState::Begin | PreambleState::CheckProgrammingPreconditions => {
                PreambleState::SwitchToDefaultTiming
            }
            PreambleState::SwitchToDefaultTiming if security => PreambleState::PreNegotiateSecurity,
            PreambleState::SwitchToDefaultTiming | PreambleState::PreNegotiateSecurity => {
                PreambleState::StartDiagnosticSession
            }
            PreambleState::StartDiagnosticSession if self.settings.timing.is_some() => {
                PreambleState::NegotiateTiming
            }
            PreambleState::StartDiagnosticSession | PreambleState::NegotiateTiming if security => {
                PreambleState::NegotiateSecurity
            }
            _ => PreambleState::Finished,
        }
    }

    fn action_for(&self, state: PreambleState) -> Option<AnyAction> {
        match state {
            PreambleState::CheckProgrammingPreconditions => {
                Some(ReadEcuIdentification::new(FLASH_STATUS_OPTION).into())
            }
            PreambleState::SwitchToDefaultTiming => {
                Some(NegotiateTiming::new(TimingTarget::Default).into())
            }
            PreambleState::PreNegotiateSecurity | PreambleState::NegotiateSecurity => self
                .settings
                .security
                .map(|security| SecurityAccess::new(security).into()),
            PreambleState::StartDiagnosticSession => self.settings.session.map(|session| {
                StartDiagnosticSession::new(session, self.settings.baud_rates.clone()).into()
            }),
            PreambleState::NegotiateTiming => self
                .settings
                .timing
                .map(|target| NegotiateTiming::new(target).into()),
            PreambleState::Begin | PreambleState::Finished => None,
        }
    }
}

fn check_preconditions(cx: &mut Context<'_>, status: FlashStatus) -> bool {
    if status.preconditions_met() {
        return true;
    }
    let mut message =
        String::from("The ECU reports the following programming preconditions are not met:\n");
    for reason in status.failed_preconditions() {
        message.push_str(reason);
        message.push('\n');
    }
    message.push_str("Press OK to continue anyway, or Cancel to stop.");
    cx.ask("Programming preconditions", &message, PromptKind::OkCancel) == PromptAnswer::Ok
}

#[cfg(test)]
mod tests {
    use super::super::{Operation, Step, test_ecu::*};
    use super::*;
    use pretty_assertions::assert_eq;

    /// Just the preamble
    struct SessionOnly(Preamble);

    impl Operation for SessionOnly {
        fn name(&self) -> &'static str {
            "SessionOnly"
        }

        fn next(&mut self, cx: &mut Context<'_>) -> Step {
            match self.0.next(cx.link) {
                Some(action) => Step::Run(action),
                None => Step::Finished(true),
            }
        }

        fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool {
            self.0.completed(cx, &action, report)
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            baud_rates: vec![baud::UNSPECIFIED],
            negotiate_timing: false,
            security: SecuritySettings::default(),
        }
    }

    #[test]
    fn development_session() {
        let preamble = Preamble::new(PreambleSettings::session(
            DiagnosticSession::Development,
            &settings(),
        ));
        let mut harness = Harness::new(SessionOnly(preamble));
        let state = harness.run(|request| match request.service {
            0x10 => Reply::Positive(request.data.clone()),
            _ => Reply::Silence,
        });
        assert_eq!(state, RunnerState::Finished(true));
        assert_eq!(harness.requests(), vec![(0x10, vec![0x86, 0x14])]);
        assert_eq!(harness.link.session, DiagnosticSession::Development);
    }

    #[test]
    fn nothing_to_do_in_current_session() {
        let preamble = Preamble::new(PreambleSettings::current_session());
        let mut harness = Harness::new(SessionOnly(preamble));
        assert_eq!(harness.run(|_| Reply::Silence), RunnerState::Finished(true));
        assert!(harness.requests().is_empty());
    }

    #[test]
    fn programming_checks_preconditions_first() {
        let preamble = Preamble::new(
            PreambleSettings::session(DiagnosticSession::Programming, &settings())
                .with_security(&settings()),
        );
        let mut harness = Harness::new(SessionOnly(preamble)).with_prompt(&[PromptAnswer::Cancel]);
        let state = harness.run(|request| match request.service {
            0x1A => Reply::Positive(vec![0x9C, 0x00, 0x01, 0x01, 0x01]),
            _ => Reply::Silence,
        });
        assert_eq!(state, RunnerState::Finished(false));
        assert_eq!(harness.prompt.asked, vec!["Programming preconditions"]);
        assert_eq!(harness.requests(), vec![(0x1A, vec![0x9C])]);
    }

    #[test]
    fn programming_order() {
        let preamble = Preamble::new(
            PreambleSettings::session(DiagnosticSession::Programming, &settings())
                .with_security(&settings()),
        );
        let mut harness = Harness::new(SessionOnly(preamble));
        let state = harness.run(|request| match request.service {
            0x1A => Reply::Positive(vec![0x9C, 0x00, 0x01, 0x01, 0x00]),
            0x27 => Reply::Positive(vec![request.data[0], 0, 0, 0, 0]),
            0x10 => Reply::Positive(request.data.clone()),
            _ => Reply::Negative(ResponseCode::ServiceNotSupported),
        });
        assert_eq!(state, RunnerState::Finished(true));
        let services: Vec<u8> = harness.requests().iter().map(|(service, _)| *service).collect();
        // preconditions, default timing, security, session, security again
        assert_eq!(services, vec![0x1A, 0x83, 0x27, 0x10, 0x27]);
    }
}
