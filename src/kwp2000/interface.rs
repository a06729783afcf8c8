//! The KWP2000 protocol engine.
//!
//! [`Interface::poll`] runs one iteration of the send/receive loop: it
//! (re)connects when needed, drains the transport into the receive buffer,
//! extracts and dispatches frames, services the P1, P2 and P3 timers in that
//! order and transmits the next queued message when the bus allows it.
//! Everything the engine has to say to its users is queued as an
//! [`InterfaceEvent`] and collected with [`Interface::take_events`].

use std::{collections::VecDeque, time::Duration};

use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, error, info, trace, warn};

use super::constants::*;
use super::frame::{EchoTracker, FrameError, ReceiveBuffer};
use super::handshake::{self, HandshakeSettings, KeyBytes, Parity};
use super::message::Message;
use super::request::Request;
use super::response::{NegativeResponse, is_response_to, uses_data_segmentation};
use super::timing::*;
use crate::k_line::KLine;

pub type MessageId = u64;

/// Timeout for reads issued by the loop itself
const READ_TIMEOUT: Duration = Duration::from_millis(2);
/// Time allowed for a requested disconnect to complete
pub const DISCONNECT_TIMEOUT_MS: u64 = 5000;
/// Any running P3 window is waited out for this long before reconnecting
const RECONNECT_WAIT: Duration = Duration::from_millis(P3_DEFAULT_TESTER_REQUEST_MAX);
const MAX_UNSOLICITED_RESPONSES: u32 = 5;
const MAX_UNANSWERED_MESSAGES: u32 = 3;
/// Sleep between loop iterations, longer sleeps slow the whole protocol down
pub const POLL_INTERVAL: Duration = Duration::from_millis(2);
/// Written when opening to check the adapter echoes, must not look like a sync byte
const ECHO_TEST_BYTE: u8 = 0xF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionStatus {
    Disconnected,
    ConnectionPending,
    Connected,
    DisconnectionPending,
    /// The loop has stopped, the interface must be opened again
    CommunicationTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMethod {
    #[default]
    SlowInit,
    FastInit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    pub connect_method: ConnectMethod,
    pub connect_address: u8,
    /// Address mode of the fast init StartCommunication request
    pub address_mode: AddressMode,
    pub connection_attempts: u32,
    /// Remove the reflection of every sent byte from the receive side
    pub consume_echo: bool,
    /// Check the adapter echoes a test byte when opening
    pub verify_echo_on_open: bool,
    /// EDC15 ECUs need a longer inter byte time until connected
    pub p4_min_when_connecting_ms: u64,
    pub default_timing: TimingParameters,
    pub handshake: HandshakeSettings,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            connect_method: ConnectMethod::SlowInit,
            connect_address: KWP1281_INIT_ADDRESS,
            address_mode: AddressMode::Physical,
            connection_attempts: 2,
            consume_echo: true,
            verify_echo_on_open: true,
            p4_min_when_connecting_ms: 17,
            default_timing: TimingParameters::default(),
            handshake: HandshakeSettings::default(),
        }
    }
}

/// Reported once the interface is done with a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsesFinished {
    pub id: MessageId,
    pub service: u8,
    pub sent_properly: bool,
    pub received_any: bool,
    pub waited_for_all: bool,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterfaceEvent {
    /// Response to the message at the head of the queue
    Received(Message),
    Finished(ResponsesFinished),
    Connection(ConnectionStatus),
}

/// The surface of the engine used by actions and operations.
pub trait Link {
    fn status(&self) -> ConnectionStatus;
    /// Queues a message, the result shows up as events
    fn send(&mut self, message: Message) -> MessageId;
    /// Finishes a request that could not be framed without sending it
    fn reject(&mut self, service: u8) -> MessageId;
    fn ecu_address(&self) -> u8;

    fn session(&self) -> DiagnosticSession;
    /// Changing the session puts the timing back to defaults
    fn set_session(&mut self, session: DiagnosticSession);
    fn session_baud_rate(&self) -> u32;
    fn set_session_baud_rate(&mut self, baud_rate: u32);

    fn timing_mode(&self) -> TimingMode;
    fn timing(&self) -> TimingParameters;
    fn set_timing(&mut self, timing: TimingParameters, mode: TimingMode);
    fn default_timing(&self) -> TimingParameters;

    /// Requests a clean StopCommunication when connected
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    fn is_connection_open(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::ConnectionPending
                | ConnectionStatus::Connected
                | ConnectionStatus::DisconnectionPending
        )
    }

    fn request(&mut self, service: ServiceId, data: Vec<u8>) -> MessageId {
        let length = data.len();
        match Message::request(self.ecu_address(), service, data) {
            Ok(message) => self.send(message),
            Err(e) => {
                warn!(service = %service, length, "not sending request: {e}");
                self.reject(service as u8)
            }
        }
    }

    fn send_request(&mut self, request: Request) -> MessageId {
        let (service, data) = request.raw();
        self.request(service, data)
    }
}

/// Bookkeeping for the message at the head of the send queue
#[derive(Debug, Clone, Copy, Default)]
struct CurrentMessage {
    sent_properly: bool,
    received_any: bool,
    waited_for_all: bool,
    finished: bool,
    attempts: u32,
}

pub struct Interface<K: KLine> {
    line: K,
    settings: InterfaceSettings,
    status: ConnectionStatus,
    connect_attempts_remaining: u32,
    connect_address: u8,
    ecu_address: u8,
    key_bytes: KeyBytes,

    session: DiagnosticSession,
    session_baud_rate: u32,
    timing_mode: TimingMode,
    timing: TimingParameters,
    /// P2 max from the timing, or longer while a response is pending
    p2_max_current: u64,

    p1: Stopwatch,
    p2: Stopwatch,
    p3: Stopwatch,
    disconnect_timer: Stopwatch,
    flush: bool,

    receive: ReceiveBuffer,
    echo: EchoTracker,
    pending: VecDeque<(MessageId, Message)>,
    next_id: MessageId,
    current: CurrentMessage,
    unsolicited: u32,
    unanswered: u32,

    events: VecDeque<InterfaceEvent>,
}

impl<K: KLine> Interface<K> {
    pub fn new(line: K, settings: InterfaceSettings) -> Self {
        let timing = settings.default_timing;
        Self {
            line,
            connect_address: settings.connect_address,
            ecu_address: settings.connect_address,
            settings,
            status: ConnectionStatus::CommunicationTerminated,
            connect_attempts_remaining: 0,
            key_bytes: KeyBytes::default(),
            session: DiagnosticSession::InternalUndefined,
            session_baud_rate: baud::UNSPECIFIED,
            timing_mode: TimingMode::Unknown,
            timing,
            p2_max_current: P2_CONNECT_ECU_RESPONSE_MAX,
            p1: Stopwatch::default(),
            p2: Stopwatch::default(),
            p3: Stopwatch::default(),
            disconnect_timer: Stopwatch::default(),
            flush: false,
            receive: ReceiveBuffer::default(),
            echo: EchoTracker::default(),
            pending: VecDeque::new(),
            next_id: 0,
            current: CurrentMessage::default(),
            unsolicited: 0,
            unanswered: 0,
            events: VecDeque::new(),
        }
    }

    pub fn line(&self) -> &K {
        &self.line
    }

    pub fn line_mut(&mut self) -> &mut K {
        &mut self.line
    }

    pub fn settings(&self) -> &InterfaceSettings {
        &self.settings
    }

    pub fn key_bytes(&self) -> KeyBytes {
        self.key_bytes
    }

    pub fn connect_attempts_remaining(&self) -> u32 {
        self.connect_attempts_remaining
    }

    pub fn take_events(&mut self) -> Vec<InterfaceEvent> {
        self.events.drain(..).collect()
    }

    /// Prepares the transport and arms the connection attempts.
    ///
    /// The handshake itself runs on the next [`poll`](Self::poll). Returns
    /// false if the interface is already open or the adapter failed the echo
    /// check.
    pub fn open(&mut self) -> Result<bool, K::Error> {
        if self.status != ConnectionStatus::CommunicationTerminated {
            return Ok(false);
        }

        self.connect_attempts_remaining = self.settings.connection_attempts;
        self.connect_address = self.settings.connect_address;
        self.set_address_and_key_bytes(self.connect_address, KeyBytes::default());
        self.clear_message_buffers();

        self.line.set_high()?;
        self.line.set_baud_rate(baud::DEFAULT)?;
        self.line.purge()?;

        if self.settings.verify_echo_on_open && !self.verify_echo()? {
            return Ok(false);
        }

        self.set_status(ConnectionStatus::Disconnected);
        Ok(true)
    }

    /// Stops the loop without talking to the ECU.
    pub fn close(&mut self) {
        self.connect_attempts_remaining = 0;
        self.set_status(ConnectionStatus::CommunicationTerminated);
        if let Err(e) = self.line.purge() {
            warn!(error = %e, "failed to purge transport while closing");
        }
    }

    fn verify_echo(&mut self) -> Result<bool, K::Error> {
        let timeout = Duration::from_millis(self.settings.handshake.echo_timeout_ms);
        if !self.line.write_byte(ECHO_TEST_BYTE)? {
            warn!("failed to write test echo to adapter");
            return Ok(false);
        }
        let echo = self.line.read_byte(timeout)?;
        self.line.purge()?;

        match echo {
            Some(ECHO_TEST_BYTE) => {
                info!("validated adapter echoes sent bytes");
                Ok(true)
            }
            Some(other) => {
                warn!(
                    read = format_args!("{other:#04x}"),
                    "adapter echo did not match, make sure the cable is connected to the OBD port"
                );
                Ok(false)
            }
            None => {
                warn!("failed to read test echo from adapter");
                Ok(false)
            }
        }
    }

    /// Runs one iteration of the send/receive loop.
    ///
    /// Returns false once communication has terminated.
    pub fn poll(&mut self) -> bool {
        if self.status == ConnectionStatus::CommunicationTerminated {
            return false;
        }

        if let Err(e) = self.service() {
            error!(error = %e, "transport failure");
            self.set_status(ConnectionStatus::Disconnected);
        }

        if self.status == ConnectionStatus::Disconnected && self.connect_attempts_remaining == 0 {
            info!("send receive loop terminated");
            self.set_status(ConnectionStatus::CommunicationTerminated);
        }

        self.status != ConnectionStatus::CommunicationTerminated
    }

    fn service(&mut self) -> Result<(), K::Error> {
        self.connect_while_disconnected();

        if self.flush {
            self.p1.reset();
        }

        let mut p3 = self.p3.elapsed_ms();
        let mut p2 = self.p2.elapsed_ms();
        let mut p1 = self.p1.elapsed_ms();
        let mut to_read = self.line.bytes_available()?;

        while to_read > 0 || self.receive.is_dirty() || self.flush {
            p3 = self.p3.elapsed_ms();
            p2 = self.p2.elapsed_ms();
            p1 = self.p1.elapsed_ms();

            if to_read > 0 && self.read_and_append(to_read)? {
                p1 = 0;
            }
            to_read = 0;

            if self.p1.is_running() {
                self.flush = false;
            }

            if self.receive.is_dirty() || self.flush {
                if self.flush {
                    debug!("checking receive buffer for complete frames before flushing");
                }

                let mut needed;
                loop {
                    let (found, more) = self.process_receive_buffer(self.flush);
                    needed = more;
                    if !found {
                        break;
                    }
                    if self.receive.is_empty() {
                        self.p1.reset();
                        p1 = 0;
                        if !self.p3.is_running() {
                            self.p3.restart();
                            p3 = 0;
                        }
                        if !self.p2.is_running() {
                            self.p2.restart();
                            p2 = 0;
                        }
                    }
                }

                if self.flush && !self.receive.is_empty() {
                    debug!(
                        bytes = self.receive.len(),
                        "flushing receive buffer after P1 inter byte timeout"
                    );
                    self.receive.clear();
                }

                if !self.receive.is_empty() {
                    to_read = needed;
                }
                self.flush = false;
            }
        }

        let timing = self.timing;

        if p1 > timing.p1_max {
            debug!(elapsed = p1, "P1 inter byte timeout expired");
            if !self.read_and_append(1)? {
                self.flush = true;
            }
        }

        if !self.p1.is_running() && p2 > self.p2_max_current * 2 {
            if self.is_expecting_responses() {
                self.current.waited_for_all = true;
                if self.current.received_any {
                    self.finish_current_message();
                } else {
                    debug!("message received no replies");
                }
            }
            self.p2.reset();
        }

        if !self.p1.is_running()
            && p3 >= timing.p3_min
            && self.status != ConnectionStatus::Disconnected
            && !self.is_expecting_responses()
        {
            if self.echo.is_outstanding() {
                debug!("failed to read echo in time, clearing expected echo");
                self.echo.clear();
            }

            if p3 * 2 > timing.p3_max
                && self.pending.is_empty()
                && self.status == ConnectionStatus::Connected
            {
                self.request(ServiceId::TesterPresent, vec![0x01]);
            }

            while !self.pending.is_empty()
                && self.status != ConnectionStatus::Disconnected
                && !self.is_expecting_responses()
            {
                let max_retries = self.pending.front().map_or(0, |(_, m)| m.max_retries);
                if self.current.attempts <= max_retries {
                    if self.current.attempts > 0 {
                        debug!(attempt = self.current.attempts + 1, "resending message");
                    }
                    if self.transmit_head()? {
                        p3 = 0;
                    }
                    break;
                }

                debug!(attempts = self.current.attempts, "message send failed");
                self.finish_current_message();
            }
        }

        if !self.p1.is_running()
            && p3 > timing.p3_max
            && !self.is_expecting_responses()
            && !matches!(
                self.status,
                ConnectionStatus::Disconnected | ConnectionStatus::DisconnectionPending
            )
            && !self.read_and_append(1)?
        {
            warn!(
                p3_max = timing.p3_max,
                "disconnecting because there was no successful communication within P3 max"
            );
            self.set_status(ConnectionStatus::Disconnected);
        }

        if self.status == ConnectionStatus::DisconnectionPending
            && self.disconnect_timer.elapsed_ms() > DISCONNECT_TIMEOUT_MS
        {
            warn!("disconnecting because the disconnect took too long");
            self.set_status(ConnectionStatus::Disconnected);
        }

        if self.is_connection_open()
            && !self.p1.is_running()
            && !self.p2.is_running()
            && !self.p3.is_running()
        {
            error!("connection is open and no message timers are running");
            self.p2.start();
            self.p3.start();
        }

        Ok(())
    }

    fn connect_while_disconnected(&mut self) {
        while self.status == ConnectionStatus::Disconnected && self.connect_attempts_remaining > 0 {
            self.connect_attempts_remaining -= 1;

            let elapsed = self.p3.elapsed();
            if self.p3.is_running() && elapsed < RECONNECT_WAIT {
                info!("waiting for the previous tester request timeout to expire");
                std::thread::sleep(RECONNECT_WAIT - elapsed);
                self.p3.reset();
            }

            self.set_status(ConnectionStatus::ConnectionPending);

            let started = match self.settings.connect_method {
                ConnectMethod::SlowInit => self.connect_slow_init(),
                ConnectMethod::FastInit => self.connect_fast_init(),
            };

            let started = started.unwrap_or_else(|e| {
                warn!(error = %e, "transport failure while connecting");
                self.clear_message_buffers();
                false
            });

            if !started {
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    fn connect_slow_init(&mut self) -> Result<bool, K::Error> {
        let settings = self.settings.handshake.clone();
        let consume_echo = self.settings.consume_echo;
        let between_inits = Duration::from_millis(settings.time_between_slow_inits_ms);
        let mut address = self.connect_address;

        self.line.set_high()?;
        idle_for(Duration::from_millis(settings.idle_before_init_ms));

        info!(address = format_args!("{address:#04x}"), "starting slow init");
        let mut result = handshake::slow_init(&mut self.line, &settings, address, Parity::Odd, consume_echo)?;

        if result.is_some_and(|r| r.key_bytes.is_kwp1281()) {
            info!("ECU started a KWP1281 session, ending it and trying again");
            handshake::kwp1281_short_session(&mut self.line, &settings, consume_echo)?;
            idle_for(between_inits);
            result = handshake::slow_init(&mut self.line, &settings, address, Parity::Odd, consume_echo)?;

            if address == KWP1281_INIT_ADDRESS && result.is_some_and(|r| r.key_bytes.is_kwp1281()) {
                info!("ECU started KWP1281 again, trying the KWP2000 address");
                handshake::kwp1281_short_session(&mut self.line, &settings, consume_echo)?;
                idle_for(between_inits);
                address = KWP2000_INIT_ADDRESS;
                result = handshake::slow_init(&mut self.line, &settings, address, Parity::Even, consume_echo)?;
            }
        }

        let connected = match result {
            Some(result) => {
                self.connect_address = address;
                self.session_baud_rate = result.baud_rate;

                let key_bytes = result.key_bytes;
                let usable = key_bytes.second != key_byte::KWP1281_KEY_BYTE_2
                    && key_bytes.is_valid_kwp2000(false);
                self.set_address_and_key_bytes(address, key_bytes);

                if usable {
                    info!(baud_rate = result.baud_rate, "slow init succeeded");
                    self.set_status(ConnectionStatus::Connected);
                } else {
                    warn!(
                        key_byte_1 = format_args!("{:#04x}", key_bytes.first),
                        key_byte_2 = format_args!("{:#04x}", key_bytes.second),
                        "slow init returned key bytes that do not describe a KWP2000 session"
                    );
                }
                usable
            }
            None => {
                warn!("slow init failed");
                false
            }
        };

        if !connected {
            self.clear_message_buffers();
            self.line.purge()?;
        }

        Ok(connected)
    }

    fn connect_fast_init(&mut self) -> Result<bool, K::Error> {
        self.line.set_baud_rate(baud::DEFAULT)?;
        self.session_baud_rate = baud::DEFAULT;

        let message = Message {
            mode: self.settings.address_mode,
            source: TESTER_ADDRESS,
            target: self.connect_address,
            service: ServiceId::StartCommunication as u8,
            data: Vec::new(),
            max_retries: 0,
        };
        let bytes = message.to_bytes(self.key_bytes.first);
        self.send(message);

        info!(address = format_args!("{:#04x}", self.connect_address), "starting fast init");
        handshake::fast_init_pulse(&mut self.line, &self.settings.handshake)?;

        // the release of the wake up pulse leaves one byte behind
        let sent = self.transmit(&bytes, false, 1)?;
        if !sent {
            warn!("failed to send fast init StartCommunication request");
            self.clear_message_buffers();
            self.line.purge()?;
        }

        Ok(sent)
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }

        let was_connected =
            self.is_connection_open() && self.status != ConnectionStatus::ConnectionPending;
        self.status = status;
        info!("{status}");
        self.events.push_back(InterfaceEvent::Connection(status));

        let reset = match status {
            ConnectionStatus::ConnectionPending => true,
            ConnectionStatus::Connected => {
                self.connect_attempts_remaining = 0;
                if !self.p1.is_running() && !self.p2.is_running() && !self.p3.is_running() {
                    self.p2.start();
                    self.p3.start();
                }
                false
            }
            // never connected so nothing worth keeping for the next attempt
            ConnectionStatus::Disconnected => !was_connected,
            _ => false,
        };

        if reset {
            self.reset_communication();
        }
    }

    fn reset_communication(&mut self) {
        self.set_session(DiagnosticSession::InternalUndefined);
        self.session_baud_rate = baud::UNSPECIFIED;

        if let Err(e) = self
            .line
            .set_baud_rate(baud::DEFAULT)
            .and_then(|_| self.line.purge())
        {
            warn!(error = %e, "failed to reset transport");
        }

        self.set_timing_to_defaults();

        self.p1.reset();
        self.p2.reset();
        self.p3.reset();
        self.disconnect_timer.reset();
        self.flush = false;

        self.current.attempts = 0;
        self.unsolicited = 0;
        self.clear_message_buffers();
    }

    fn clear_message_buffers(&mut self) {
        self.pending.clear();
        self.events
            .retain(|event| matches!(event, InterfaceEvent::Connection(_)));
        self.receive.clear();
        self.echo.clear();
    }

    fn set_address_and_key_bytes(&mut self, address: u8, key_bytes: KeyBytes) {
        let mut key_bytes = key_bytes.masked();

        if key_bytes != self.key_bytes {
            if key_bytes.is_kwp1281() {
                info!("switching to KWP1281 session");
            } else if key_bytes.second == key_byte::KWP2000_KEY_BYTE_2 {
                info!("switching to KWP2000 session");
            } else {
                key_bytes.second = key_byte::KWP2000_KEY_BYTE_2;
                info!("unknown protocol, switching to KWP2000 session");
            }
        }

        if address != self.ecu_address || key_bytes != self.key_bytes {
            debug!(
                address = format_args!("{address:#04x}"),
                key_byte_1 = format_args!("{:#04x}", key_bytes.first),
                key_byte_2 = format_args!("{:#04x}", key_bytes.second),
                "setting address and key bytes"
            );
        }

        self.ecu_address = address;
        self.key_bytes = key_bytes;
    }

    fn apply_timing(&mut self, timing: TimingParameters) {
        if self.timing == timing {
            return;
        }

        let old_p2_max = self.timing.p2_max;
        self.timing = timing;

        if (self.p2_max_current == P2_CONNECT_ECU_RESPONSE_MAX || old_p2_max == self.p2_max_current)
            && old_p2_max != timing.p2_max
        {
            self.p2_max_current = timing.p2_max;
        }

        if timing == self.settings.default_timing {
            debug!("set timing parameters to defaults");
        } else {
            debug!(%timing, "set timing parameters to new values");
        }
    }

    fn set_timing_to_defaults(&mut self) {
        self.apply_timing(self.settings.default_timing);
        self.timing_mode = TimingMode::Unknown;
    }

    fn is_expecting_responses(&self) -> bool {
        self.current.sent_properly
            && !self.current.finished
            && !self.current.waited_for_all
            && !self.pending.is_empty()
            && self.status != ConnectionStatus::Disconnected
    }

    fn is_expected_response(&self, message: &Message) -> bool {
        self.is_expecting_responses()
            && self
                .pending
                .front()
                .is_some_and(|(_, request)| is_response_to(request.service, message))
    }

    fn should_wait_for_multiple_responses(&self) -> bool {
        self.is_expecting_responses()
            && self.pending.front().is_some_and(|(_, request)| {
                request.mode == AddressMode::Functional || uses_data_segmentation(request.service)
            })
    }

    /// Reads up to `count` bytes into the receive buffer, returning whether
    /// it grew once echo was removed.
    fn read_and_append(&mut self, count: usize) -> Result<bool, K::Error> {
        let before = self.receive.len();
        let count = count.min(self.receive.free_space());

        if count > 0 {
            let mut bytes = vec![0u8; count];
            let read = self.line.read_bytes(&mut bytes, READ_TIMEOUT)?;
            if read > 0 {
                trace!(bytes = ?&bytes[..read], "read data");
                self.receive.append(&bytes[..read]);
                self.echo.consume(&mut self.receive, self.settings.consume_echo);
            }
        } else {
            warn!("receive buffer is full");
        }

        let read_more = self.receive.len() > before;
        if read_more {
            self.p1.restart();
        }
        Ok(read_more)
    }

    /// Extracts frames from the receive buffer until a valid response is
    /// handled.
    ///
    /// Returns whether any frame was found along with the number of bytes
    /// still needed for the frame at the front.
    fn process_receive_buffer(&mut self, search_all_offsets: bool) -> (bool, usize) {
        let mut found_any = false;
        let mut needed = 0;
        let mut offset = 0;

        loop {
            match self.receive.take_frame(offset, self.ecu_address) {
                Ok(message) => {
                    found_any = true;
                    offset = 0;

                    let valid_mode = matches!(message.mode, AddressMode::Physical | AddressMode::None);
                    let to_tester = message.target == TESTER_ADDRESS;
                    if valid_mode && to_tester && message.is_response() {
                        self.p2_max_current = self.timing.p2_max;
                        self.handle_response(message);
                        break;
                    }

                    debug!(
                        mode = ?message.mode,
                        target = format_args!("{:#04x}", message.target),
                        service = %service_name(message.service),
                        "ignoring received message"
                    );
                    if self.receive.is_empty() {
                        break;
                    }
                }
                Err(FrameError::NotEnoughData { needed: more }) => {
                    needed = more;
                    if !search_all_offsets {
                        break;
                    }
                    offset += 1;
                    if self.receive.len() <= offset {
                        break;
                    }
                }
                Err(e) => {
                    if offset == 0 {
                        if let Some(first) = self.receive.as_slice().first() {
                            debug!(
                                error = %e,
                                removed = format_args!("{first:#04x}"),
                                "discarding first byte of receive buffer"
                            );
                        }
                        self.receive.remove_front(1, true);
                        if self.receive.is_empty() {
                            break;
                        }
                    } else {
                        if !search_all_offsets {
                            break;
                        }
                        offset += 1;
                        if self.receive.len() <= offset {
                            break;
                        }
                    }
                }
            }
        }

        self.receive.clear_dirty();
        (found_any, needed)
    }

    fn handle_response(&mut self, message: Message) {
        debug!(service = %service_name(message.service), "received message");
        trace!(data = ?message.data, "received data");

        if !self.is_expected_response(&message) {
            self.unsolicited += 1;
            match NegativeResponse::from_message(&message) {
                Some(negative) => debug!("ignoring unsolicited {negative}"),
                None => debug!(
                    service = %service_name(message.service),
                    "ignoring unsolicited message"
                ),
            }

            if self.unsolicited >= MAX_UNSOLICITED_RESPONSES
                && !matches!(
                    self.status,
                    ConnectionStatus::DisconnectionPending | ConnectionStatus::Disconnected
                )
            {
                warn!("too many consecutive unsolicited messages from ECU, disconnecting");
                self.disconnect();
            }
            return;
        }

        self.unsolicited = 0;
        let mut dispatch = true;
        let mut resend = false;
        let mut finish = true;

        match ServiceResponse::from_repr(message.service) {
            Some(ServiceResponse::StartCommunication) => {
                if self.status != ConnectionStatus::ConnectionPending {
                    debug!("received StartCommunication response while not connecting");
                }
                match message.data[..] {
                    [first, second] => {
                        let key_bytes = KeyBytes { first, second }.masked();
                        if key_bytes.is_valid_kwp2000(false) {
                            self.set_address_and_key_bytes(message.source, key_bytes);
                            self.set_status(ConnectionStatus::Connected);
                        } else {
                            debug!(?key_bytes, "invalid key bytes");
                        }
                    }
                    _ => debug!("invalid number of key bytes in StartCommunication response"),
                }
            }
            Some(ServiceResponse::StopCommunication) => {
                self.set_status(ConnectionStatus::Disconnected);
            }
            Some(ServiceResponse::TesterPresent) => dispatch = false,
            Some(ServiceResponse::NegativeResponse) => match NegativeResponse::from_message(&message) {
                Some(negative) if message.data.len() == 2 => {
                    debug!("received {negative}");
                    let code = negative.response_code();
                    if code == Some(ResponseCode::ResponsePending) {
                        if self.status == ConnectionStatus::Connected {
                            dispatch = false;
                            finish = false;
                            self.p2_max_current = self.timing.p3_max;
                            debug!(p2_max = self.p2_max_current, "waiting for another response");
                        }
                    } else if code == Some(ResponseCode::BusyRepeatRequest) {
                        debug!("ECU was too busy to receive message, resending");
                        dispatch = false;
                        resend = true;
                        finish = false;
                    } else if negative.is_for(ServiceId::StartCommunication)
                        || negative.is_for(ServiceId::TesterPresent)
                    {
                        dispatch = false;
                    } else if negative.is_for(ServiceId::StopCommunication) {
                        dispatch = false;
                        warn!("negative response to StopCommunication, disconnecting anyway");
                        self.set_status(ConnectionStatus::Disconnected);
                    }
                }
                _ => debug!("received invalid negative response"),
            },
            _ => {}
        }

        if resend {
            // the busy attempt does not count
            self.current.attempts = self.current.attempts.saturating_sub(1);
            self.current.waited_for_all = true;
        } else {
            self.current.received_any = true;
        }

        if dispatch {
            self.events.push_back(InterfaceEvent::Received(message));
        }

        if finish && !self.should_wait_for_multiple_responses() {
            self.finish_current_message();
        }

        if self.status == ConnectionStatus::ConnectionPending {
            self.set_status(ConnectionStatus::Connected);
        }
    }

    fn finish_current_message(&mut self) {
        if self.current.finished {
            return;
        }

        let current = self.current;
        let finished = self.pending.pop_front();

        if let Some((id, message)) = &finished {
            let needs_reply = matches!(
                message.service_id(),
                Some(
                    ServiceId::StartCommunication
                        | ServiceId::StopCommunication
                        | ServiceId::TesterPresent
                )
            );
            if needs_reply && !current.received_any {
                warn!(
                    service = %service_name(message.service),
                    "disconnecting because no response was received"
                );
                self.set_status(ConnectionStatus::Disconnected);
            }

            self.events
                .push_back(InterfaceEvent::Finished(ResponsesFinished {
                    id: *id,
                    service: message.service,
                    sent_properly: current.sent_properly,
                    received_any: current.received_any,
                    waited_for_all: current.waited_for_all,
                    retries: current.attempts.saturating_sub(1),
                }));
        }

        if current.received_any {
            self.unanswered = 0;
        } else {
            self.unanswered += 1;
            // baud rate detection sends StartDiagnosticSession requests that may go unanswered
            let probing = finished.as_ref().is_some_and(|(_, message)| {
                message.service == ServiceId::StartDiagnosticSession as u8
            });
            if self.unanswered >= MAX_UNANSWERED_MESSAGES
                && self.status != ConnectionStatus::Disconnected
                && !probing
            {
                warn!("disconnecting because too many consecutive messages had no response");
                self.set_status(ConnectionStatus::Disconnected);
            }
        }

        self.current = CurrentMessage {
            finished: true,
            ..CurrentMessage::default()
        };
    }

    fn transmit_head(&mut self) -> Result<bool, K::Error> {
        let Some((_, message)) = self.pending.front() else {
            return Ok(false);
        };
        let service = message.service;
        let bytes = message.to_bytes(self.key_bytes.first);

        let sent = self.transmit(&bytes, true, 0)?;
        if sent {
            debug!(service = %service_name(service), "sent message");
            trace!(?bytes, "sent data");
        } else {
            debug!(service = %service_name(service), "failed to send message");
        }
        Ok(sent)
    }

    /// Writes a serialized frame, honouring P4 between bytes.
    fn transmit(
        &mut self,
        bytes: &[u8],
        check_pending_receive: bool,
        preceding_bytes_to_ignore: usize,
    ) -> Result<bool, K::Error> {
        if self.echo.is_outstanding() {
            debug!("can't transmit message, waiting to read echo");
            return Ok(false);
        }

        self.current = CurrentMessage {
            attempts: self.current.attempts,
            ..CurrentMessage::default()
        };

        // half duplex, never talk over the ECU
        if check_pending_receive && self.line.bytes_available()? > 0 {
            return Ok(false);
        }

        let written = match self.write_with_p4(bytes) {
            Ok(written) => written,
            Err(e) => {
                self.current.attempts += 1;
                return Err(e);
            }
        };

        self.current.sent_properly = written == bytes.len();
        if self.current.sent_properly {
            self.p3.restart();
            self.p2_max_current = self.timing.p2_max;
            self.p2.restart();
        }

        if self.settings.consume_echo && written > 0 {
            self.echo.expect(preceding_bytes_to_ignore, &bytes[..written]);
        }

        self.current.attempts += 1;
        Ok(self.current.sent_properly)
    }

    fn write_with_p4(&mut self, bytes: &[u8]) -> Result<usize, K::Error> {
        let p4 = if self.status == ConnectionStatus::Connected {
            self.timing.p4_min
        } else {
            self.settings.p4_min_when_connecting_ms
        };

        if p4 == 0 {
            return self.line.write_bytes(bytes);
        }

        let p4 = Duration::from_millis(p4);
        let mut written = 0;
        for (index, byte) in bytes.iter().enumerate() {
            if index > 0 {
                spin_for(p4);
            }
            if !self.line.write_byte(*byte)? {
                break;
            }
            written += 1;
        }
        Ok(written)
    }
}

impl<K: KLine> Link for Interface<K> {
    fn status(&self) -> ConnectionStatus {
        self.status
    }

    fn send(&mut self, message: Message) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back((id, message));
        id
    }

    fn reject(&mut self, service: u8) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push_back(InterfaceEvent::Finished(ResponsesFinished {
            id,
            service,
            sent_properly: false,
            received_any: false,
            waited_for_all: true,
            retries: 0,
        }));
        id
    }

    fn ecu_address(&self) -> u8 {
        self.ecu_address
    }

    fn session(&self) -> DiagnosticSession {
        self.session
    }

    fn set_session(&mut self, session: DiagnosticSession) {
        if self.session != session {
            self.session = session;
            self.set_timing_to_defaults();
            debug!(%session, "changed diagnostic session");
        }
    }

    fn session_baud_rate(&self) -> u32 {
        self.session_baud_rate
    }

    fn set_session_baud_rate(&mut self, baud_rate: u32) {
        if self.is_connection_open() && baud_rate != baud::UNSPECIFIED {
            if let Err(e) = self.line.set_baud_rate(baud_rate) {
                warn!(error = %e, baud_rate, "failed to change transport baud rate");
            }
        }
        self.session_baud_rate = baud_rate;
    }

    fn timing_mode(&self) -> TimingMode {
        self.timing_mode
    }

    fn timing(&self) -> TimingParameters {
        self.timing
    }

    fn set_timing(&mut self, timing: TimingParameters, mode: TimingMode) {
        self.apply_timing(timing);
        self.timing_mode = mode;
    }

    fn default_timing(&self) -> TimingParameters {
        self.settings.default_timing
    }

    fn disconnect(&mut self) {
        if self.status == ConnectionStatus::Connected {
            self.set_status(ConnectionStatus::DisconnectionPending);
            self.request(ServiceId::StopCommunication, Vec::new());
            if !self.disconnect_timer.is_running() {
                self.disconnect_timer.restart();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::convert::Infallible;

    use super::*;
    use pretty_assertions::assert_eq;

    /// Echoes writes and answers whole requests from a script
    #[derive(Default)]
    struct ScriptedLine {
        low: bool,
        rx: VecDeque<u8>,
        written: Vec<u8>,
        replies: VecDeque<(Vec<u8>, Vec<u8>)>,
    }

    impl KLine for ScriptedLine {
        type Error = Infallible;

        fn set_baud_rate(&mut self, _: u32) -> Result<(), Infallible> {
            Ok(())
        }
        fn baud_rate(&self) -> Result<u32, Infallible> {
            Ok(baud::DEFAULT)
        }
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.low = true;
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Infallible> {
            // releasing a break reads back as a zero byte
            if std::mem::take(&mut self.low) {
                self.rx.push_back(0x00);
            }
            Ok(())
        }
        fn purge(&mut self) -> Result<(), Infallible> {
            self.rx.clear();
            Ok(())
        }
        fn bytes_available(&mut self) -> Result<usize, Infallible> {
            Ok(self.rx.len())
        }
        fn read_bytes(&mut self, buf: &mut [u8], _: Duration) -> Result<usize, Infallible> {
            let count = buf.len().min(self.rx.len());
            for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..count)) {
                *slot = byte;
            }
            Ok(count)
        }
        fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, Infallible> {
            self.rx.extend(bytes);
            self.written.extend(bytes);
            if self
                .replies
                .front()
                .is_some_and(|(trigger, _)| self.written.ends_with(trigger))
            {
                if let Some((_, reply)) = self.replies.pop_front() {
                    self.rx.extend(reply);
                }
            }
            Ok(bytes.len())
        }
    }

    fn fast_settings() -> InterfaceSettings {
        InterfaceSettings {
            connect_method: ConnectMethod::FastInit,
            connection_attempts: 1,
            verify_echo_on_open: false,
            p4_min_when_connecting_ms: 0,
            default_timing: TimingParameters {
                p1_max: 20,
                p2_min: 0,
                p2_max: 20,
                p3_min: 0,
                p3_max: 400,
                p4_min: 0,
            },
            handshake: HandshakeSettings {
                idle_before_init_ms: 0,
                fast_init_low_high_offset_ms: -24.0,
                ..HandshakeSettings::default()
            },
            ..InterfaceSettings::default()
        }
    }

    fn ecu_frame(service: u8, data: &[u8]) -> Vec<u8> {
        Message::new(AddressMode::Physical, 0x01, TESTER_ADDRESS, service, data.to_vec()).unwrap()
            .to_bytes(key_byte::DEFAULT_KEY_BYTE_1)
    }

    fn poll_until(
        interface: &mut Interface<ScriptedLine>,
        done: impl Fn(&[InterfaceEvent]) -> bool,
    ) -> Vec<InterfaceEvent> {
        let mut events = Vec::new();
        for _ in 0..500 {
            interface.poll();
            events.extend(interface.take_events());
            if done(&events) {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        events
    }

    fn connected(events: &[InterfaceEvent]) -> bool {
        events.contains(&InterfaceEvent::Connection(ConnectionStatus::Connected))
    }

    fn connect(line: ScriptedLine) -> Interface<ScriptedLine> {
        let mut interface = Interface::new(line, fast_settings());
        assert!(interface.open().unwrap());
        let events = poll_until(&mut interface, connected);
        assert!(connected(&events), "{events:?}");
        interface
    }

    fn start_communication_exchange() -> (Vec<u8>, Vec<u8>) {
        let request = Message::request(0x01, ServiceId::StartCommunication, vec![]).unwrap()
            .to_bytes(key_byte::DEFAULT_KEY_BYTE_1);
        (request, ecu_frame(0xC1, &[0xEF, 0x8F]))
    }

    #[test]
    fn fast_init_connects_with_key_bytes() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let interface = connect(line);

        assert_eq!(interface.status(), ConnectionStatus::Connected);
        assert_eq!(
            interface.key_bytes(),
            KeyBytes {
                first: 0x6F,
                second: 0x0F
            }
        );
        assert_eq!(interface.ecu_address(), 0x01);
    }

    #[test]
    fn response_is_dispatched_then_finished() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let request = Message::request(0x01, ServiceId::ReadECUIdentification, vec![0x9C]).unwrap()
            .to_bytes(0x6F);
        line.replies
            .push_back((request, ecu_frame(0x5A, &[0x9C, 0x01, 0x02, 0x03, 0x00])));
        let mut interface = connect(line);

        let id = interface.request(ServiceId::ReadECUIdentification, vec![0x9C]);
        let events = poll_until(&mut interface, |events| {
            events.iter().any(|e| matches!(e, InterfaceEvent::Finished(_)))
        });

        let received: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                InterfaceEvent::Received(message) => Some(message.service),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![0x5A]);
        assert!(events.contains(&InterfaceEvent::Finished(ResponsesFinished {
            id,
            service: 0x1A,
            sent_properly: true,
            received_any: true,
            waited_for_all: false,
            retries: 0,
        })));
    }

    #[test]
    fn response_pending_keeps_waiting() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let request =
            Message::request(0x01, ServiceId::RequestTransferExit, vec![]).unwrap().to_bytes(0x6F);
        let mut reply = ecu_frame(0x7F, &[0x37, 0x78]);
        reply.extend(ecu_frame(0x77, &[]));
        line.replies.push_back((request, reply));
        let mut interface = connect(line);

        interface.request(ServiceId::RequestTransferExit, vec![]);
        let events = poll_until(&mut interface, |events| {
            events.iter().any(|e| matches!(e, InterfaceEvent::Finished(_)))
        });

        let received: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                InterfaceEvent::Received(message) => Some(message.service),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![0x77]);
    }

    #[test]
    fn unanswered_start_communication_disconnects() {
        let mut interface = Interface::new(ScriptedLine::default(), fast_settings());
        assert!(interface.open().unwrap());
        let events = poll_until(&mut interface, |events| {
            events.contains(&InterfaceEvent::Connection(ConnectionStatus::CommunicationTerminated))
        });

        assert!(!connected(&events));
        assert_eq!(interface.status(), ConnectionStatus::CommunicationTerminated);
        assert!(!interface.poll());
    }

    #[test]
    fn session_change_resets_timing() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let mut interface = connect(line);

        let fast = TimingParameters {
            p2_max: 30,
            ..interface.timing()
        };
        interface.set_timing(fast, TimingMode::Limits);
        assert_eq!(interface.timing_mode(), TimingMode::Limits);

        interface.set_session(DiagnosticSession::Programming);
        assert_eq!(interface.timing(), interface.default_timing());
        assert_eq!(interface.timing_mode(), TimingMode::Unknown);
    }

    fn finished_count(events: &[InterfaceEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, InterfaceEvent::Finished(_)))
            .count()
    }

    #[test]
    fn silent_ecu_past_p3_max_disconnects_once() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let mut interface = connect(line);

        let mut disconnects = 0;
        let mut written_at_disconnect = None;
        for _ in 0..500 {
            interface.poll();
            for event in interface.take_events() {
                if event == InterfaceEvent::Connection(ConnectionStatus::Disconnected) {
                    disconnects += 1;
                    written_at_disconnect = Some(interface.line().written.len());
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        assert_eq!(disconnects, 1);
        assert_eq!(written_at_disconnect, Some(interface.line().written.len()));
        assert_eq!(interface.status(), ConnectionStatus::CommunicationTerminated);
    }

    #[test]
    fn busy_reply_resends_without_counting_a_retry() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let request = Message::request(0x01, ServiceId::ReadECUIdentification, vec![0x9C]).unwrap()
            .to_bytes(0x6F);
        line.replies
            .push_back((request.clone(), ecu_frame(0x7F, &[0x1A, 0x21])));
        line.replies
            .push_back((request, ecu_frame(0x5A, &[0x9C, 0x01])));
        let mut interface = connect(line);

        let id = interface.request(ServiceId::ReadECUIdentification, vec![0x9C]);
        let events = poll_until(&mut interface, |events| finished_count(events) > 0);

        let received: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                InterfaceEvent::Received(message) => Some(message.service),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![0x5A]);
        assert!(events.contains(&InterfaceEvent::Finished(ResponsesFinished {
            id,
            service: 0x1A,
            sent_properly: true,
            received_any: true,
            waited_for_all: false,
            retries: 0,
        })));
    }

    #[test]
    fn oversized_request_finishes_without_sending() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let mut interface = connect(line);
        let written = interface.line().written.len();

        let id = interface.request(ServiceId::TransferData, vec![0x00; MAX_DATA_LENGTH]);
        let events = interface.take_events();

        assert_eq!(
            events,
            vec![InterfaceEvent::Finished(ResponsesFinished {
                id,
                service: ServiceId::TransferData as u8,
                sent_properly: false,
                received_any: false,
                waited_for_all: true,
                retries: 0,
            })]
        );
        assert!(interface.pending.is_empty());
        assert_eq!(interface.line().written.len(), written);
        assert_eq!(interface.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn unsolicited_responses_disconnect() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let mut interface = connect(line);

        for _ in 0..5 {
            let frame = ecu_frame(0x61, &[0x01, 0x42]);
            interface.line_mut().rx.extend(frame);
        }
        let events = poll_until(&mut interface, |events| {
            events.contains(&InterfaceEvent::Connection(ConnectionStatus::DisconnectionPending))
        });

        assert!(!events.iter().any(|e| matches!(e, InterfaceEvent::Received(_))));
        assert!(events.contains(&InterfaceEvent::Connection(
            ConnectionStatus::DisconnectionPending
        )));
    }

    #[test]
    fn unanswered_messages_disconnect() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let mut interface = connect(line);

        for _ in 0..3 {
            interface.request(ServiceId::ReadDataByLocalIdentifier, vec![0x01]);
        }
        let events = poll_until(&mut interface, |events| {
            events.contains(&InterfaceEvent::Connection(ConnectionStatus::Disconnected))
        });

        assert_eq!(finished_count(&events), 3);
        assert!(events.iter().all(|e| !matches!(
            e,
            InterfaceEvent::Finished(finished) if finished.received_any
        )));
        assert!(events.contains(&InterfaceEvent::Connection(ConnectionStatus::Disconnected)));
    }

    #[test]
    fn unanswered_session_probes_stay_connected() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let mut interface = connect(line);

        for _ in 0..3 {
            interface.request(ServiceId::StartDiagnosticSession, vec![0x86]);
        }
        let events = poll_until(&mut interface, |events| finished_count(events) == 3);

        assert_eq!(finished_count(&events), 3);
        assert!(!events.contains(&InterfaceEvent::Connection(ConnectionStatus::Disconnected)));
        assert_eq!(interface.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let mut line = ScriptedLine::default();
        line.replies.push_back(start_communication_exchange());
        let request = Message::request(0x01, ServiceId::ReadDataByLocalIdentifier, vec![0x01]).unwrap()
            .to_bytes(0x6F);
        let mut reply = vec![0x13, 0x00];
        reply.extend(ecu_frame(0x61, &[0x01, 0x42]));
        line.replies.push_back((request, reply));
        let mut interface = connect(line);

        interface.request(ServiceId::ReadDataByLocalIdentifier, vec![0x01]);
        let events = poll_until(&mut interface, |events| {
            events.iter().any(|e| matches!(e, InterfaceEvent::Finished(_)))
        });

        assert!(events.iter().any(|e| matches!(
            e,
            InterfaceEvent::Received(message) if message.data == vec![0x01, 0x42]
        )));
    }
}
