use std::fmt;

use tracing::debug;

use super::{Action, ActionCore};
use crate::kwp2000::{
    Link, Message, Request, ResponsesFinished,
    constants::*,
    response::{is_positive_response_to, negative_response_to},
};

/// Reads one ECU identification option.
#[derive(Debug)]
pub struct ReadEcuIdentification {
    core: ActionCore,
    option: u8,
    data: Vec<u8>,
}

impl ReadEcuIdentification {
    pub fn new(option: u8) -> Self {
        Self {
            core: ActionCore::default(),
            option,
            data: Vec::new(),
        }
    }

    pub fn option(&self) -> u8 {
        self.option
    }

    /// Response data without the option byte
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl Action for ReadEcuIdentification {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "ReadEcuIdentification"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.data.clear();
        self.core
            .send(link, Request::ReadECUIdentification(self.option));
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        if !is_positive_response_to(ServiceId::ReadECUIdentification, message) {
            return false;
        }
        match message.data.split_first() {
            Some((option, data)) if *option == self.option && !data.is_empty() => {
                self.data = data.to_vec();
                self.core.complete(true);
            }
            _ => {
                debug!(option = self.option, "identification response for another option");
                self.core.complete(false);
            }
        }
        true
    }
}

/// A stored diagnostic trouble code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtc {
    pub code: u16,
    pub status: u8,
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05} status {:#04x}", self.code, self.status)
    }
}

/// DTC group covering every code
pub const ALL_DTC_GROUPS: u16 = 0xFF00;

/// Reads trouble codes, the ECU may split them over several responses.
#[derive(Debug)]
pub struct ReadDtcByStatus {
    core: ActionCore,
    status: u8,
    group: u16,
    expected: u8,
    dtcs: Vec<Dtc>,
}

impl ReadDtcByStatus {
    pub fn new(status: u8, group: u16) -> Self {
        Self {
            core: ActionCore::default(),
            status,
            group,
            expected: 0,
            dtcs: Vec::new(),
        }
    }

    /// Count from the first response
    pub fn expected(&self) -> u8 {
        self.expected
    }

    pub fn dtcs(&self) -> &[Dtc] {
        &self.dtcs
    }
}

impl Action for ReadDtcByStatus {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "ReadDtcByStatus"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.expected = 0;
        self.dtcs.clear();
        self.core.send(
            link,
            Request::ReadDTCByStatus {
                status: self.status,
                group: self.group,
            },
        );
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::ReadDTCByStatus, message) {
            let mut entries = &message.data[..];
            if self.expected == 0 {
                let Some((count, rest)) = entries.split_first() else {
                    debug!("trouble code response did not contain any data");
                    return true;
                };
                self.expected = *count;
                entries = rest;
            }
            if self.expected > 0 {
                self.dtcs.extend(entries.chunks_exact(3).map(|entry| Dtc {
                    code: u16::from_be_bytes([entry[0], entry[1]]),
                    status: entry[2],
                }));
            }
            if self.dtcs.len() >= self.expected as usize {
                self.core.complete(true);
            }
            true
        } else if let Some(negative) = negative_response_to(ServiceId::ReadDTCByStatus, message) {
            debug!("trouble code read failed, {negative}");
            self.core.complete(false);
            true
        } else {
            false
        }
    }

    fn responses_finished(&mut self, _link: &mut dyn Link, finished: &ResponsesFinished) {
        if finished.service == ServiceId::ReadDTCByStatus as u8 {
            self.core.complete(!self.dtcs.is_empty());
        }
    }
}

#[derive(Debug)]
pub struct ClearDiagnosticInformation {
    core: ActionCore,
    group: u16,
}

impl ClearDiagnosticInformation {
    pub fn new(group: u16) -> Self {
        Self {
            core: ActionCore::default(),
            group,
        }
    }
}

impl Action for ClearDiagnosticInformation {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "ClearDiagnosticInformation"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.core
            .send(link, Request::ClearDiagnosticInformation(self.group));
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::ClearDiagnosticInformation, message) {
            let cleared = message.data[..] == self.group.to_be_bytes();
            if !cleared {
                debug!(response = ?message.data, "cleared a different group than requested");
            }
            self.core.complete(cleared);
            true
        } else if let Some(negative) =
            negative_response_to(ServiceId::ClearDiagnosticInformation, message)
        {
            debug!("clearing diagnostic information failed, {negative}");
            self.core.complete(false);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataIdentifier {
    Local(u8),
    Common(u16),
}

/// Reads a record with ReadDataByLocalIdentifier or ReadDataByCommonIdentifier.
#[derive(Debug)]
pub struct ReadDataByIdentifier {
    core: ActionCore,
    identifier: DataIdentifier,
    data: Vec<u8>,
}

impl ReadDataByIdentifier {
    pub fn local(identifier: u8) -> Self {
        Self::new(DataIdentifier::Local(identifier))
    }

    pub fn common(identifier: u16) -> Self {
        Self::new(DataIdentifier::Common(identifier))
    }

    fn new(identifier: DataIdentifier) -> Self {
        Self {
            core: ActionCore::default(),
            identifier,
            data: Vec::new(),
        }
    }

    pub fn identifier(&self) -> DataIdentifier {
        self.identifier
    }

    /// Positive response data, identifier included
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn service(&self) -> ServiceId {
        match self.identifier {
            DataIdentifier::Local(_) => ServiceId::ReadDataByLocalIdentifier,
            DataIdentifier::Common(_) => ServiceId::ReadDataByCommonIdentifier,
        }
    }
}

impl Action for ReadDataByIdentifier {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        match self.identifier {
            DataIdentifier::Local(_) => "ReadDataByLocalIdentifier",
            DataIdentifier::Common(_) => "ReadDataByCommonIdentifier",
        }
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.data.clear();
        let request = match self.identifier {
            DataIdentifier::Local(id) => Request::ReadDataByLocalIdentifier(id),
            DataIdentifier::Common(id) => Request::ReadDataByCommonIdentifier(id),
        };
        self.core.send(link, request);
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(self.service(), message) {
            self.data = message.data.clone();
            self.core.complete(true);
            return true;
        }
        false
    }
}
