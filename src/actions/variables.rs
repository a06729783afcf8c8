//! Vendor data logging services.
//!
//! These only answer once the define/read handlers have been injected into
//! the ECU's message handling table.

use tracing::debug;

use super::{Action, ActionCore};
use crate::kwp2000::{
    Link, Message, Request,
    constants::*,
    response::{is_positive_response_to, negative_response_to},
};

/// Three address bytes per variable in a define message
pub const MAX_VARIABLES_PER_DEFINE: usize = 252 / 3;

/// Bit of the top address byte marking a word sized variable
const WORD_FLAG: u32 = 0x800000;
const ADDRESS_MASK: u32 = 0x7FFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableSize {
    Byte,
    Word,
}

impl VariableSize {
    pub fn from_len(len: u32) -> Option<Self> {
        match len {
            1 => Some(VariableSize::Byte),
            2 => Some(VariableSize::Word),
            _ => None,
        }
    }

    pub fn len(self) -> usize {
        match self {
            VariableSize::Byte => 1,
            VariableSize::Word => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variable {
    pub address: u32,
    pub size: VariableSize,
}

impl Variable {
    pub fn new(address: u32, size: VariableSize) -> Self {
        Self { address, size }
    }

    /// Address as sent in a define message, the size in the top bit
    fn encoded(&self) -> u32 {
        let flag = match self.size {
            VariableSize::Byte => 0,
            VariableSize::Word => WORD_FLAG,
        };
        (self.address & ADDRESS_MASK) | flag
    }
}

/// Tells the injected handler which addresses to sample.
#[derive(Debug)]
pub struct DefineVariables {
    core: ActionCore,
    variables: Vec<Variable>,
    defined: u8,
    failure_code: Option<u8>,
}

impl DefineVariables {
    /// Only the first [`MAX_VARIABLES_PER_DEFINE`] variables are sent.
    pub fn new(variables: &[Variable]) -> Self {
        let count = variables.len().min(MAX_VARIABLES_PER_DEFINE);
        Self {
            core: ActionCore::default(),
            variables: variables[..count].to_vec(),
            defined: 0,
            failure_code: None,
        }
    }

    /// Number of variables the ECU accepted
    pub fn defined(&self) -> u8 {
        self.defined
    }

    pub fn failure_code(&self) -> Option<u8> {
        self.failure_code
    }
}

impl Action for DefineVariables {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "DefineVariables"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.defined = 0;
        self.failure_code = None;
        let addresses = self.variables.iter().map(Variable::encoded).collect();
        self.core.send(link, Request::DefineReadVariables(addresses));
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::DefineReadVariables, message) {
            self.defined = message.data.first().copied().unwrap_or_default();
            debug!(defined = self.defined, "variables defined");
            self.core.complete(true);
            return true;
        }
        if let Some(negative) = negative_response_to(ServiceId::DefineReadVariables, message) {
            debug!("defining variables failed, {negative}");
            self.failure_code = Some(negative.code);
        }
        false
    }
}

/// Reads the values of previously defined variables, in as many requests
/// as the per read byte limit needs.
#[derive(Debug)]
pub struct ReadVariables {
    core: ActionCore,
    sizes: Vec<VariableSize>,
    max_reads_per_tick: u8,
    max_bytes_per_read: u8,
    next_index: u8,
    last_count: u8,
    values: Vec<Vec<u8>>,
}

impl ReadVariables {
    /// `sizes` lists the defined variables in definition order.
    pub fn new(sizes: Vec<VariableSize>, max_reads_per_tick: u8, max_bytes_per_read: u8) -> Self {
        Self {
            core: ActionCore::default(),
            sizes,
            max_reads_per_tick,
            max_bytes_per_read,
            next_index: 0,
            last_count: 0,
            values: Vec::new(),
        }
    }

    /// One entry per variable read, one or two bytes each
    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Vec<u8>> {
        self.values
    }

    fn defined(&self) -> u8 {
        self.sizes.len().min(u8::MAX as usize) as u8
    }

    fn request_next(&mut self, link: &mut dyn Link) {
        // assume every variable is a word
        let per_read = (self.max_bytes_per_read / 2).max(1);
        self.last_count = per_read.min(self.defined() - self.next_index);
        self.core.send(
            link,
            Request::ReadVariables {
                max_reads: self.max_reads_per_tick,
                index: self.next_index,
                count: self.last_count,
            },
        );
    }
}

impl Action for ReadVariables {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "ReadVariables"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.next_index = 0;
        self.values.clear();
        if self.sizes.is_empty() {
            self.core.complete(true);
            return;
        }
        self.request_next(link);
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if !is_positive_response_to(ServiceId::ReadVariables, message) {
            return false;
        }

        let first = self.next_index as usize;
        let mut data = &message.data[..];
        for size in &self.sizes[first..first + self.last_count as usize] {
            if data.len() < size.len() {
                debug!(index = self.values.len(), "variable response too short");
                break;
            }
            let (value, rest) = data.split_at(size.len());
            self.values.push(value.to_vec());
            data = rest;
        }

        self.next_index += self.last_count;
        if self.next_index >= self.defined() {
            self.core.complete(true);
        } else {
            self.request_next(link);
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
    fn define_marks_words() {
        let mut link = TestLink::default();
        let variables = [
            Variable::new(0x380010, VariableSize::Byte),
            Variable::new(0x38ABCD, VariableSize::Word),
        ];
        let mut action = DefineVariables::new(&variables);
        start(&mut action, &mut link);
        assert_eq!(
            link.last_request(),
            (0xB7, vec![2, 0x38, 0x00, 0x10, 0xB8, 0xAB, 0xCD])
        );

        dispatch(&mut action, &mut link, &response(0xF7, &[2]));
        assert!(action.core().success());
        assert_eq!(action.defined(), 2);
    }

    #[test]
    fn define_is_capped() {
        let mut link = TestLink::default();
        let variables: Vec<_> = (0..100)
            .map(|i| Variable::new(0x380000 + i, VariableSize::Byte))
            .collect();
        let mut action = DefineVariables::new(&variables);
        start(&mut action, &mut link);
        let (_, data) = link.last_request();
        assert_eq!(data[0] as usize, MAX_VARIABLES_PER_DEFINE);
        assert_eq!(data.len(), 1 + 3 * MAX_VARIABLES_PER_DEFINE);
    }

    #[test]
    fn define_refused() {
        let mut link = TestLink::default();
        let mut action = DefineVariables::new(&[Variable::new(0x380000, VariableSize::Byte)]);
        start(&mut action, &mut link);
        dispatch(
            &mut action,
            &mut link,
            &negative(ServiceId::DefineReadVariables, ResponseCode::ServiceNotSupported),
        );
        assert!(!action.core().success());
        assert_eq!(action.failure_code(), Some(0x11));
    }

    #[test]
    fn read_splits_by_byte_limit() {
        let mut link = TestLink::default();
        let sizes = vec![VariableSize::Word, VariableSize::Byte, VariableSize::Word];
        let mut action = ReadVariables::new(sizes, 255, 4);
        start(&mut action, &mut link);
        assert_eq!(link.last_request(), (0xB8, vec![255, 0, 2]));

        dispatch(&mut action, &mut link, &response(0xF8, &[0x12, 0x34, 0x56]));
        assert_eq!(link.last_request(), (0xB8, vec![255, 2, 1]));
        assert!(!action.core().is_complete());

        dispatch(&mut action, &mut link, &response(0xF8, &[0xAB, 0xCD]));
        assert!(action.core().success());
        assert_eq!(
            action.values(),
            &[vec![0x12, 0x34], vec![0x56], vec![0xAB, 0xCD]]
        );
    }

    #[test]
    fn nothing_to_read() {
        let mut link = TestLink::default();
        let mut action = ReadVariables::new(Vec::new(), 255, 64);
        start(&mut action, &mut link);
        assert!(action.core().success());
        assert!(link.sent.is_empty());
    }
}
