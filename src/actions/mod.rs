//! Single purpose protocol exchanges.
//!
//! An action sends one kind of request, possibly spread over many messages,
//! and interprets what comes back. Actions are driven by feeding them the
//! [`InterfaceEvent`]s of the interface they were started on.

use std::fmt;

use tracing::debug;

use crate::kwp2000::{
    InterfaceEvent, Link, Message, MessageId, Request, ResponsesFinished,
    constants::*,
    response::NegativeResponse,
};

pub mod diagnostic;
pub mod memory;
pub mod routine;
pub mod security;
pub mod session;
pub mod timing;
pub mod transfer;
pub mod variables;

pub use diagnostic::{
    ClearDiagnosticInformation, DataIdentifier, Dtc, ReadDataByIdentifier, ReadDtcByStatus,
    ReadEcuIdentification,
};
pub use memory::{ReadMemory, WriteMemory};
pub use routine::{EraseFlash, ValidateFlashChecksum};
pub use security::SecurityAccess;
pub use session::{StartDiagnosticSession, StopCommunication, StopDiagnosticSession};
pub use timing::{AccessTimingParameters, NegotiateTiming, TimingTarget};
pub use transfer::{
    LayoutValidation, RequestTransfer, RequestTransferExit, TransferData, TransferDirection,
    ValidateStartAndEnd,
};
pub use variables::{DefineVariables, ReadVariables};

/// How an action ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionReport {
    pub success: bool,
    pub completed_without_communication_error: bool,
}

/// State shared by every action.
#[derive(Debug, Default)]
pub struct ActionCore {
    complete: bool,
    success: bool,
    communication_error: bool,
    reported: bool,
    sent: Vec<MessageId>,
}

impl ActionCore {
    /// Queues `request` and remembers it belongs to this action
    pub fn send(&mut self, link: &mut dyn Link, request: Request) -> MessageId {
        let id = link.send_request(request);
        self.sent.push(id);
        id
    }

    pub fn sent(&self, id: MessageId) -> bool {
        self.sent.contains(&id)
    }

    /// Only the first completion counts
    pub fn complete(&mut self, success: bool) {
        if !self.complete {
            self.complete = true;
            self.success = success;
        }
    }

    pub fn fail_communication(&mut self) {
        if !self.complete {
            self.communication_error = true;
            self.complete(false);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn success(&self) -> bool {
        self.complete && self.success
    }

    /// The report of a completed action, handed out once
    pub fn take_report(&mut self) -> Option<ActionReport> {
        if !self.complete || self.reported {
            return None;
        }
        self.reported = true;
        Some(ActionReport {
            success: self.success,
            completed_without_communication_error: !self.communication_error,
        })
    }

    /// Makes a completed action runnable again
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub trait Action {
    fn core(&self) -> &ActionCore;
    fn core_mut(&mut self) -> &mut ActionCore;
    fn name(&self) -> &'static str;

    /// Sends the first request, or completes right away when there is nothing to do.
    fn start(&mut self, link: &mut dyn Link);

    /// Returns whether the message meant anything to the action.
    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool;

    /// Called when the interface is done with one of the action's messages.
    fn responses_finished(&mut self, _link: &mut dyn Link, finished: &ResponsesFinished) {
        if !finished.sent_properly {
            debug!(action = self.name(), "message failed to send properly");
            self.core_mut().fail_communication();
        } else if !finished.received_any {
            debug!(action = self.name(), "did not receive any replies to message");
            self.core_mut().fail_communication();
        }
    }
}

/// Starts `action`, which needs an established connection.
///
/// Returns false if the action could not start.
pub fn start(action: &mut dyn Action, link: &mut dyn Link) -> bool {
    if !link.is_connected() {
        debug!(action = action.name(), "can't start action without a connection");
        action.core_mut().fail_communication();
        return false;
    }
    debug!(action = action.name(), "starting action");
    action.start(link);
    true
}

/// Feeds one interface event to a running action.
pub fn dispatch(action: &mut dyn Action, link: &mut dyn Link, event: &InterfaceEvent) {
    if action.core().is_complete() {
        return;
    }

    match event {
        InterfaceEvent::Received(message) => {
            if !action.handle_message(link, message) && !is_absorbed(message) {
                match NegativeResponse::from_message(message) {
                    Some(negative) => debug!(action = action.name(), "unhandled {negative}"),
                    None => debug!(
                        action = action.name(),
                        service = %service_name(message.service),
                        "received unhandled message"
                    ),
                }
                action.core_mut().complete(false);
            }
        }
        InterfaceEvent::Finished(finished) => {
            if action.core().sent(finished.id) {
                action.responses_finished(link, finished);
            }
        }
        InterfaceEvent::Connection(_) => {
            if !link.is_connected() {
                action.core_mut().fail_communication();
            }
        }
    }
}

/// Responses every action lets through without complaint
fn is_absorbed(message: &Message) -> bool {
    match ServiceResponse::from_repr(message.service) {
        Some(
            ServiceResponse::StartCommunication
            | ServiceResponse::StopCommunication
            | ServiceResponse::TesterPresent,
        ) => true,
        Some(ServiceResponse::NegativeResponse) => {
            NegativeResponse::from_message(message).is_some_and(|negative| {
                matches!(
                    negative.response_code(),
                    Some(ResponseCode::ResponsePending | ResponseCode::BusyRepeatRequest)
                ) || negative.is_for(ServiceId::StartCommunication)
                    || negative.is_for(ServiceId::StopCommunication)
            })
        }
        _ => false,
    }
}

macro_rules! AnyActions {
    {$($name:ident($action:ty)),* $(,)?} => {
        /// Every action an operation can run
        pub enum AnyAction {
            $($name($action),)*
        }

        impl AnyAction {
            pub fn as_action(&self) -> &dyn Action {
                match self {
                    $(AnyAction::$name(action) => action,)*
                }
            }

            pub fn as_action_mut(&mut self) -> &mut dyn Action {
                match self {
                    $(AnyAction::$name(action) => action,)*
                }
            }
        }

        $(
            impl From<$action> for AnyAction {
                fn from(action: $action) -> Self {
                    AnyAction::$name(action)
                }
            }
        )*
    };
}

AnyActions! {
    StartDiagnosticSession(StartDiagnosticSession),
    StopDiagnosticSession(StopDiagnosticSession),
    StopCommunication(StopCommunication),
    AccessTimingParameters(AccessTimingParameters),
    NegotiateTiming(NegotiateTiming),
    SecurityAccess(SecurityAccess),
    ReadMemory(ReadMemory),
    WriteMemory(WriteMemory),
    EraseFlash(EraseFlash),
    ValidateFlashChecksum(ValidateFlashChecksum),
    ValidateStartAndEnd(ValidateStartAndEnd),
    RequestTransfer(RequestTransfer),
    TransferData(TransferData),
    RequestTransferExit(RequestTransferExit),
    ReadEcuIdentification(ReadEcuIdentification),
    ReadDtcByStatus(ReadDtcByStatus),
    ClearDiagnosticInformation(ClearDiagnosticInformation),
    ReadDataByIdentifier(ReadDataByIdentifier),
    DefineVariables(DefineVariables),
    ReadVariables(ReadVariables),
}

impl fmt::Debug for AnyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_action().name())
    }
}

#[cfg(test)]
pub(crate) mod test_link {
    //! In memory [`Link`] that records requests instead of sending them.

    use super::*;
    use crate::kwp2000::{
        ConnectionStatus,
        timing::{TimingMode, TimingParameters},
    };

    pub const ECU: u8 = 0x01;

    pub struct TestLink {
        pub status: ConnectionStatus,
        pub sent: Vec<Message>,
        pub rejected: Vec<u8>,
        pub session: DiagnosticSession,
        pub baud_rate: u32,
        pub timing: TimingParameters,
        pub timing_mode: TimingMode,
    }

    impl Default for TestLink {
        fn default() -> Self {
            Self {
                status: ConnectionStatus::Connected,
                sent: Vec::new(),
                rejected: Vec::new(),
                session: DiagnosticSession::Standard,
                baud_rate: baud::DEFAULT,
                timing: TimingParameters::default(),
                timing_mode: TimingMode::Unknown,
            }
        }
    }

    impl TestLink {
        /// Service id and data of every request so far
        pub fn requests(&self) -> Vec<(u8, Vec<u8>)> {
            self.sent.iter().map(|m| (m.service, m.data.clone())).collect()
        }

        pub fn last_request(&self) -> (u8, Vec<u8>) {
            self.requests().pop().unwrap_or_default()
        }

        pub fn last_id(&self) -> MessageId {
            self.sent.len() as MessageId - 1
        }
    }

    impl Link for TestLink {
        fn status(&self) -> ConnectionStatus {
            self.status
        }
        fn send(&mut self, message: Message) -> MessageId {
            self.sent.push(message);
            self.sent.len() as MessageId - 1
        }
        fn reject(&mut self, service: u8) -> MessageId {
            self.rejected.push(service);
            MessageId::MAX - self.rejected.len() as MessageId
        }
        fn ecu_address(&self) -> u8 {
            ECU
        }
        fn session(&self) -> DiagnosticSession {
            self.session
        }
        fn set_session(&mut self, session: DiagnosticSession) {
            if session != self.session {
                self.timing = TimingParameters::default();
                self.timing_mode = TimingMode::Unknown;
            }
            self.session = session;
        }
        fn session_baud_rate(&self) -> u32 {
            self.baud_rate
        }
        fn set_session_baud_rate(&mut self, baud_rate: u32) {
            self.baud_rate = baud_rate;
        }
        fn timing_mode(&self) -> TimingMode {
            self.timing_mode
        }
        fn timing(&self) -> TimingParameters {
            self.timing
        }
        fn set_timing(&mut self, timing: TimingParameters, mode: TimingMode) {
            self.timing = timing;
            self.timing_mode = mode;
        }
        fn default_timing(&self) -> TimingParameters {
            TimingParameters::default()
        }
        fn disconnect(&mut self) {
            self.status = ConnectionStatus::Disconnected;
        }
    }

    pub fn response(service: u8, data: &[u8]) -> InterfaceEvent {
        InterfaceEvent::Received(Message::new(
            AddressMode::Physical,
            ECU,
            TESTER_ADDRESS,
            service,
            data.to_vec(),
        ).unwrap())
    }

    pub fn negative(request: ServiceId, code: ResponseCode) -> InterfaceEvent {
        response(ServiceResponse::NegativeResponse as u8, &[request as u8, code as u8])
    }

    pub fn finished(link: &TestLink, received_any: bool) -> InterfaceEvent {
        InterfaceEvent::Finished(ResponsesFinished {
            id: link.last_id(),
            service: link.last_request().0,
            sent_properly: true,
            received_any,
            waited_for_all: true,
            retries: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_link::*;
    use super::*;
    use crate::kwp2000::ConnectionStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn unanswered_request_is_a_communication_error() {
        let mut link = TestLink::default();
        let mut action = RequestTransferExit::default();
        assert!(start(&mut action, &mut link));

        let done = finished(&link, false);
        dispatch(&mut action, &mut link, &done);
        assert_eq!(
            action.core_mut().take_report(),
            Some(ActionReport {
                success: false,
                completed_without_communication_error: false
            })
        );
        assert_eq!(action.core_mut().take_report(), None);
    }

    #[test]
    fn actions_need_a_connection() {
        let mut link = TestLink {
            status: ConnectionStatus::Disconnected,
            ..TestLink::default()
        };
        let mut action = RequestTransferExit::default();
        assert!(!start(&mut action, &mut link));
        assert!(link.sent.is_empty());
        assert!(action.core().is_complete());
    }

    #[test]
    fn absorbed_responses_do_not_fail() {
        let mut link = TestLink::default();
        let mut action = RequestTransferExit::default();
        start(&mut action, &mut link);

        dispatch(&mut action, &mut link, &response(0x7E, &[]));
        dispatch(
            &mut action,
            &mut link,
            &negative(ServiceId::StopCommunication, ResponseCode::GeneralReject),
        );
        assert!(!action.core().is_complete());

        dispatch(&mut action, &mut link, &response(0x61, &[0x01]));
        assert_eq!(
            action.core_mut().take_report(),
            Some(ActionReport {
                success: false,
                completed_without_communication_error: true
            })
        );
    }

    #[test]
    fn disconnect_fails_running_action() {
        let mut link = TestLink::default();
        let mut action = RequestTransferExit::default();
        start(&mut action, &mut link);

        link.status = ConnectionStatus::Disconnected;
        dispatch(
            &mut action,
            &mut link,
            &InterfaceEvent::Connection(ConnectionStatus::Disconnected),
        );
        assert!(!action.core().success());
        assert!(action.core().is_complete());
    }

    #[test]
    fn any_action_names() {
        let action: AnyAction = RequestTransferExit::default().into();
        assert_eq!(format!("{action:?}"), "RequestTransferExit");
    }
}
