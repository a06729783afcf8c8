use tracing::debug;

use super::{Action, ActionCore};
use crate::kwp2000::{
    Link, Message, Request,
    constants::*,
    response::{is_positive_response_to, negative_response_to},
    timing::{TimingMode, TimingParameters},
};

/// One AccessTimingParameters request.
#[derive(Debug)]
pub struct AccessTimingParameters {
    core: ActionCore,
    identifier: TimingParameterIdentifier,
    timing: TimingParameters,
}

impl AccessTimingParameters {
    pub fn new(identifier: TimingParameterIdentifier, timing: Option<TimingParameters>) -> Self {
        Self {
            core: ActionCore::default(),
            identifier,
            timing: timing.unwrap_or_default(),
        }
    }

    /// Values sent, or the values the ECU answered with
    pub fn timing(&self) -> TimingParameters {
        self.timing
    }
}

impl Action for AccessTimingParameters {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "AccessTimingParameters"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.core
            .send(link, Request::AccessTimingParameters(self.identifier, self.timing));
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        if !is_positive_response_to(ServiceId::AccessTimingParameters, message) {
            return false;
        }
        if message.data.len() >= 6 {
            if let Some(timing) = TimingParameters::from_bytes(&message.data[1..], self.timing.p1_max)
            {
                self.timing = timing;
            }
        }
        self.core.complete(true);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingTarget {
    Default,
    Current,
    #[default]
    Limits,
}

impl TimingTarget {
    fn mode(self) -> TimingMode {
        match self {
            TimingTarget::Default => TimingMode::Default,
            TimingTarget::Current => TimingMode::Current,
            TimingTarget::Limits => TimingMode::Limits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    ReadCurrent,
    ReadLimits,
    SetDefaults,
    SetValues,
    Finished,
}

/// Moves the link timing to the ECU defaults, its current values or its limits.
///
/// An ECU that refuses to talk about timing is left alone and the action
/// still succeeds.
#[derive(Debug)]
pub struct NegotiateTiming {
    core: ActionCore,
    target: TimingTarget,
    state: Negotiation,
    timing: TimingParameters,
}

impl NegotiateTiming {
    pub fn new(target: TimingTarget) -> Self {
        Self {
            core: ActionCore::default(),
            target,
            state: Negotiation::ReadCurrent,
            timing: TimingParameters::default(),
        }
    }

    pub fn should_negotiate(link: &dyn Link, target: TimingTarget) -> bool {
        link.timing_mode() != target.mode()
    }

    fn send(&mut self, link: &mut dyn Link, state: Negotiation, identifier: TimingParameterIdentifier) {
        self.state = state;
        self.core
            .send(link, Request::AccessTimingParameters(identifier, self.timing));
    }

    fn read_timing(&mut self, message: &Message) {
        if let Some(timing) = message
            .data
            .get(1..)
            .and_then(|bytes| TimingParameters::from_bytes(bytes, self.timing.p1_max))
        {
            self.timing = timing;
        }
    }
}

impl Action for NegotiateTiming {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "NegotiateTiming"
    }

    fn start(&mut self, link: &mut dyn Link) {
        if !Self::should_negotiate(link, self.target) {
            self.core.complete(true);
            return;
        }
        self.timing = link.timing();
        self.send(
            link,
            Negotiation::ReadCurrent,
            TimingParameterIdentifier::ReadCurrent,
        );
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if negative_response_to(ServiceId::AccessTimingParameters, message).is_some() {
            debug!(state = ?self.state, "ECU refused timing negotiation, keeping current timing");
            self.core.complete(true);
            return true;
        }
        if !is_positive_response_to(ServiceId::AccessTimingParameters, message) {
            return false;
        }

        match self.state {
            Negotiation::ReadCurrent => {
                self.read_timing(message);
                link.set_timing(self.timing, TimingMode::Current);
                match self.target {
                    TimingTarget::Limits => self.send(
                        link,
                        Negotiation::ReadLimits,
                        TimingParameterIdentifier::ReadLimits,
                    ),
                    TimingTarget::Default => self.send(
                        link,
                        Negotiation::SetDefaults,
                        TimingParameterIdentifier::SetDefaults,
                    ),
                    TimingTarget::Current => {
                        self.state = Negotiation::Finished;
                        self.core.complete(true);
                    }
                }
            }
            Negotiation::ReadLimits => {
                self.read_timing(message);
                self.timing.enforce_interval_requirements();
                self.send(
                    link,
                    Negotiation::SetValues,
                    TimingParameterIdentifier::SetValues,
                );
            }
            Negotiation::SetDefaults => {
                self.send(
                    link,
                    Negotiation::SetValues,
                    TimingParameterIdentifier::ReadCurrent,
                );
            }
            Negotiation::SetValues => {
                if self.target == TimingTarget::Default {
                    self.read_timing(message);
                }
                debug!(timing = %self.timing, "timing negotiated");
                link.set_timing(self.timing, self.target.mode());
                self.state = Negotiation::Finished;
                self.core.complete(true);
            }
            Negotiation::Finished => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, start, test_link::*};
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn negotiates_limits() {
        let mut link = TestLink::default();
        let mut action = NegotiateTiming::new(TimingTarget::Limits);
        start(&mut action, &mut link);
        assert_eq!(link.last_request().1[0], 0x02);

        dispatch(&mut action, &mut link, &response(0xC3, &[0x02, 0x32, 0x28, 0x6E, 0x14, 0x0A]));
        assert_eq!(link.timing_mode, TimingMode::Current);
        assert_eq!(link.last_request().1[0], 0x00);

        // limits with P2 max too close to P2 min
        dispatch(&mut action, &mut link, &response(0xC3, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]));
        let (service, data) = link.last_request();
        assert_eq!(service, 0x83);
        assert_eq!(data[0], 0x03);

        dispatch(&mut action, &mut link, &response(0xC3, &[0x03]));
        assert!(action.core().success());
        assert_eq!(link.timing_mode, TimingMode::Limits);
        assert!(link.timing.p2_max >= link.timing.p2_min + 13);
        assert!(link.timing.p3_max >= link.timing.p3_min + 13);
    }

    #[test]
    fn nothing_to_do_when_already_at_target() {
        let mut link = TestLink {
            timing_mode: TimingMode::Limits,
            ..TestLink::default()
        };
        let mut action = NegotiateTiming::new(TimingTarget::Limits);
        start(&mut action, &mut link);
        assert!(action.core().success());
        assert!(link.sent.is_empty());
    }

    #[test]
    fn refusal_is_not_a_failure() {
        let mut link = TestLink::default();
        let mut action = NegotiateTiming::new(TimingTarget::Default);
        start(&mut action, &mut link);
        dispatch(
            &mut action,
            &mut link,
            &negative(ServiceId::AccessTimingParameters, ResponseCode::ServiceNotSupported),
        );
        assert!(action.core().success());
    }

    #[test]
    fn access_reads_values() {
        let mut link = TestLink::default();
        let mut action = AccessTimingParameters::new(TimingParameterIdentifier::ReadLimits, None);
        start(&mut action, &mut link);
        assert_eq!(link.last_request().1.len(), 6);

        dispatch(&mut action, &mut link, &response(0xC3, &[0x00, 0x00, 0x02, 0x0A, 0x14, 0x02]));
        assert!(action.core().success());
        assert_eq!(action.timing().p2_max, 50);
        assert_eq!(action.timing().p3_max, 5000);
    }
}
