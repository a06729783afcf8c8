use tracing::{debug, info};

use super::{Action, ActionCore};
use crate::kwp2000::{
    Link, Message, Request,
    constants::*,
    response::{is_positive_response_to, negative_response_to},
};

/// Whether `session` at `baud_rate` differs from what the link is in.
pub fn should_start_session(link: &dyn Link, session: DiagnosticSession, baud_rate: u32) -> bool {
    session != link.session()
        || (baud_rate != baud::UNSPECIFIED && baud_rate != link.session_baud_rate())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestFormat {
    SpecificBaudRate,
    NoBaudRate,
    StopSession,
}

/// Switches the ECU to a diagnostic session.
///
/// Baud rates are tried in order until the ECU accepts one, then the request
/// is repeated without a baud rate. If the ECU refuses every form of the
/// request the action gives up and succeeds with whatever session is active.
#[derive(Debug)]
pub struct StartDiagnosticSession {
    core: ActionCore,
    session: DiagnosticSession,
    baud_rates: Vec<u32>,
    next_baud_rate: usize,
    format: RequestFormat,
}

impl StartDiagnosticSession {
    pub fn new(session: DiagnosticSession, baud_rates: Vec<u32>) -> Self {
        let baud_rates = if baud_rates.is_empty() {
            vec![baud::UNSPECIFIED]
        } else {
            baud_rates
        };
        Self {
            core: ActionCore::default(),
            session,
            baud_rates,
            next_baud_rate: 0,
            format: RequestFormat::NoBaudRate,
        }
    }

    pub fn session(&self) -> DiagnosticSession {
        self.session
    }

    fn send_start(&mut self, link: &mut dyn Link, baud_rate: u32) {
        let baud_rate = (baud_rate != baud::UNSPECIFIED).then_some(baud_rate);
        debug!(session = %self.session, ?baud_rate, "requesting diagnostic session");
        self.core
            .send(link, Request::StartDiagnosticSession(self.session, baud_rate));
    }

    fn send_stop(&mut self, link: &mut dyn Link) {
        self.format = RequestFormat::StopSession;
        self.core.send(link, Request::StopDiagnosticSession);
    }

    fn give_up(&mut self) -> bool {
        info!(
            session = %self.session,
            "could not start diagnostic session, continuing with the current session"
        );
        self.core.complete(true);
        true
    }

    /// Responds to a refusal that may have been caused by the request format.
    fn retry_format(&mut self, link: &mut dyn Link) -> bool {
        match self.format {
            RequestFormat::SpecificBaudRate => {
                if let Some(baud_rate) = self.baud_rates.get(self.next_baud_rate).copied() {
                    self.next_baud_rate += 1;
                    self.send_start(link, baud_rate);
                } else {
                    self.format = RequestFormat::NoBaudRate;
                    self.send_start(link, baud::UNSPECIFIED);
                }
                true
            }
            RequestFormat::NoBaudRate if self.session == DiagnosticSession::Standard => {
                self.send_stop(link);
                true
            }
            RequestFormat::NoBaudRate => self.give_up(),
            RequestFormat::StopSession => false,
        }
    }
}

impl Action for StartDiagnosticSession {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "StartDiagnosticSession"
    }

    fn start(&mut self, link: &mut dyn Link) {
        let first = self.baud_rates[0];
        self.next_baud_rate = 1;

        if !should_start_session(link, self.session, first) {
            self.core.complete(true);
            return;
        }

        self.format = RequestFormat::SpecificBaudRate;
        let mut baud_rate = first;
        if baud_rate == baud::UNSPECIFIED {
            // standard sessions only run at the default rate
            if !link.is_connection_open() || self.session == DiagnosticSession::Standard {
                baud_rate = baud::DEFAULT;
            } else {
                baud_rate = link.session_baud_rate();
                self.format = RequestFormat::NoBaudRate;
            }
        }
        self.send_start(link, baud_rate);
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::StartDiagnosticSession, message) {
            if let Some(session) = message.data.first() {
                link.set_session(DiagnosticSession::from_repr(*session).unwrap_or_default());
                let baud_rate = message
                    .data
                    .get(1)
                    .map_or(baud::DEFAULT, |byte| baud::from_byte(*byte));
                link.set_session_baud_rate(baud_rate);
                info!(session = %link.session(), baud_rate, "diagnostic session started");
            }
            self.core.complete(link.session() == self.session);
            true
        } else if is_positive_response_to(ServiceId::StopDiagnosticSession, message) {
            link.set_session(DiagnosticSession::Standard);
            link.set_session_baud_rate(baud::DEFAULT);
            self.core
                .complete(self.session == DiagnosticSession::Standard);
            true
        } else if let Some(negative) =
            negative_response_to(ServiceId::StartDiagnosticSession, message)
        {
            match negative.response_code() {
                Some(ResponseCode::SecurityAccessDenied) => {
                    debug!("diagnostic session needs security access");
                    self.core.complete(false);
                    true
                }
                Some(ResponseCode::NoProgram) if self.session == DiagnosticSession::Standard => {
                    self.send_stop(link);
                    true
                }
                Some(ResponseCode::NoProgram) => self.give_up(),
                Some(
                    ResponseCode::SubFunctionNotSupported
                    | ResponseCode::ConditionsNotCorrect
                    | ResponseCode::RequestOutOfRange,
                ) => {
                    debug!(format = ?self.format, "{negative}");
                    self.retry_format(link)
                }
                _ => false,
            }
        } else if negative_response_to(ServiceId::StopDiagnosticSession, message).is_some() {
            self.give_up()
        } else {
            false
        }
    }
}

/// Ends the diagnostic session, which puts the ECU back in the standard session.
#[derive(Debug, Default)]
pub struct StopDiagnosticSession {
    core: ActionCore,
}

impl Action for StopDiagnosticSession {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "StopDiagnosticSession"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.core.send(link, Request::StopDiagnosticSession);
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::StopDiagnosticSession, message) {
            link.set_session(DiagnosticSession::Standard);
            self.core.complete(true);
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct StopCommunication {
    core: ActionCore,
}

impl Action for StopCommunication {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "StopCommunication"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.core.send(link, Request::StopCommunication);
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::StopCommunication, message) {
            self.core.complete(true);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, start, test_link::*};
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn already_in_session() {
        let mut link = TestLink::default();
        let mut action = StartDiagnosticSession::new(DiagnosticSession::Standard, vec![]);
        start(&mut action, &mut link);
        assert!(action.core().success());
        assert!(link.sent.is_empty());
    }

    #[test]
    fn programming_session_at_baud_rate() {
        let mut link = TestLink::default();
        let mut action =
            StartDiagnosticSession::new(DiagnosticSession::Programming, vec![baud::B38400]);
        start(&mut action, &mut link);
        assert_eq!(link.last_request(), (0x10, vec![0x85, 0x50]));

        dispatch(&mut action, &mut link, &response(0x50, &[0x85, 0x50]));
        assert!(action.core().success());
        assert_eq!(link.session, DiagnosticSession::Programming);
        assert_eq!(link.baud_rate, baud::B38400);
    }

    #[test]
    fn falls_back_through_baud_rates() {
        let mut link = TestLink::default();
        let mut action = StartDiagnosticSession::new(
            DiagnosticSession::Development,
            vec![baud::B124800, baud::B52800],
        );
        start(&mut action, &mut link);

        let refuse = negative(ServiceId::StartDiagnosticSession, ResponseCode::RequestOutOfRange);
        dispatch(&mut action, &mut link, &refuse);
        assert_eq!(
            link.last_request(),
            (0x10, vec![0x86, baud::to_byte(baud::B52800)])
        );

        dispatch(&mut action, &mut link, &refuse);
        assert_eq!(link.last_request(), (0x10, vec![0x86]));

        // out of formats, keep going in the current session
        dispatch(&mut action, &mut link, &refuse);
        assert!(action.core().success());
        assert_eq!(link.sent.len(), 3);
    }

    #[test]
    fn security_denied_fails() {
        let mut link = TestLink::default();
        let mut action = StartDiagnosticSession::new(DiagnosticSession::Programming, vec![]);
        start(&mut action, &mut link);
        dispatch(
            &mut action,
            &mut link,
            &negative(ServiceId::StartDiagnosticSession, ResponseCode::SecurityAccessDenied),
        );
        assert!(action.core().is_complete());
        assert!(!action.core().success());
    }

    #[test]
    fn standard_session_without_program_stops_session() {
        let mut link = TestLink {
            session: DiagnosticSession::Development,
            ..TestLink::default()
        };
        let mut action = StartDiagnosticSession::new(DiagnosticSession::Standard, vec![]);
        start(&mut action, &mut link);
        assert_eq!(link.last_request(), (0x10, vec![0x81, 0x14]));

        dispatch(
            &mut action,
            &mut link,
            &negative(ServiceId::StartDiagnosticSession, ResponseCode::NoProgram),
        );
        assert_eq!(link.last_request(), (0x20, vec![]));

        dispatch(&mut action, &mut link, &response(0x60, &[]));
        assert!(action.core().success());
        assert_eq!(link.session, DiagnosticSession::Standard);
    }

    #[test]
    fn stop_communication() {
        let mut link = TestLink::default();
        let mut action = StopCommunication::default();
        start(&mut action, &mut link);
        assert_eq!(link.last_request(), (0x82, vec![]));
        dispatch(&mut action, &mut link, &response(0xC2, &[]));
        assert!(action.core().success());
    }
}
