//! Runs the interface loop on a background thread and drives operations
//! from it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    ConnectionStatus, Interface, InterfaceEvent, InterfaceSettings, Link, interface::POLL_INTERVAL,
};
use crate::{
    Error,
    k_line::KLine,
    operations::{
        Context, Operation, OperationEvent, OperationOutput, OperationRunner, RunnerState, UserPrompt,
    },
};

/// Times the interface is opened again for an operation waiting to reconnect
const MAX_REOPENS: u32 = 3;

/// What the background thread reports.
#[derive(Debug)]
pub enum ClientEvent {
    Connection(ConnectionStatus),
    Operation(OperationEvent),
    OperationFinished {
        name: &'static str,
        success: bool,
        output: OperationOutput,
    },
}

struct Shared<K: KLine> {
    interface: Mutex<Interface<K>>,
    stop: AtomicBool,
    busy: AtomicBool,
}

/// Handle to the background thread.
///
/// The interface sits behind a lock so the controlling thread can look at
/// it while the loop runs. Dropping the client stops the loop.
pub struct Client<K: KLine + Send + 'static> {
    shared: Arc<Shared<K>>,
    operations: Sender<OperationRunner>,
    thread: Option<JoinHandle<()>>,
}

impl<K> Client<K>
where
    K: KLine + Send + 'static,
    Error: From<K::Error>,
{
    /// Opens the interface and starts connecting in the background.
    pub fn spawn(
        line: K,
        settings: InterfaceSettings,
        prompt: impl UserPrompt + 'static,
    ) -> Result<(Self, Receiver<ClientEvent>), Error> {
        let mut interface = Interface::new(line, settings);
        if !interface.open()? {
            return Err(Error::OpenFailed);
        }

        let shared = Arc::new(Shared {
            interface: Mutex::new(interface),
            stop: AtomicBool::new(false),
            busy: AtomicBool::new(false),
        });
        let (operations, queued) = mpsc::channel();
        let (events, receiver) = mpsc::channel();
        let mut service = Service {
            shared: shared.clone(),
            queued,
            events,
            prompt: Box::new(prompt),
            runner: None,
            started: false,
            reopens: 0,
            unheard: false,
        };
        let thread = std::thread::Builder::new()
            .name("kwp2000".into())
            .spawn(move || service.run())?;

        Ok((
            Self {
                shared,
                operations,
                thread: Some(thread),
            },
            receiver,
        ))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.interface.lock().status()
    }

    /// Locks the interface for a quick look, the loop stalls meanwhile
    pub fn with_interface<T>(&self, f: impl FnOnce(&mut Interface<K>) -> T) -> T {
        f(&mut self.shared.interface.lock())
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Queues an operation, it starts once the ECU is connected.
    ///
    /// Returns the flag that aborts it.
    pub fn run(&self, operation: impl Operation + 'static) -> Result<Arc<AtomicBool>, Error> {
        if self.shared.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        let runner = OperationRunner::new(Box::new(operation));
        let abort = runner.abort_flag();
        if self.operations.send(runner).is_err() {
            self.shared.busy.store(false, Ordering::Release);
            return Err(Error::NotRunning);
        }
        Ok(abort)
    }

    /// Runs an operation and waits for its output, passing every other
    /// event to `on_event`.
    pub fn run_to_completion(
        &self,
        events: &Receiver<ClientEvent>,
        operation: impl Operation + 'static,
        mut on_event: impl FnMut(&ClientEvent),
    ) -> Result<OperationOutput, Error> {
        let name = operation.name();
        self.run(operation)?;
        loop {
            match events.recv() {
                Ok(ClientEvent::OperationFinished {
                    success: true,
                    output,
                    ..
                }) => return Ok(output),
                Ok(ClientEvent::OperationFinished { success: false, .. }) => {
                    return Err(Error::OperationFailed(name.to_string()));
                }
                Ok(event) => on_event(&event),
                Err(_) => return Err(Error::NotRunning),
            }
        }
    }

    /// Asks for a clean StopCommunication.
    pub fn disconnect(&self) {
        self.shared.interface.lock().disconnect();
    }

    /// Same as dropping the client.
    pub fn close(self) {}
}

impl<K: KLine + Send + 'static> Drop for Client<K> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("communication thread panicked");
            }
        }
        self.shared.interface.lock().close();
    }
}

/// State owned by the background thread
struct Service<K: KLine> {
    shared: Arc<Shared<K>>,
    queued: Receiver<OperationRunner>,
    events: Sender<ClientEvent>,
    prompt: Box<dyn UserPrompt>,
    runner: Option<OperationRunner>,
    started: bool,
    reopens: u32,
    /// Set once the receiving end of the events has been dropped
    unheard: bool,
}

impl<K: KLine> Service<K> {
    fn run(&mut self) {
        debug!("communication thread started");
        while !self.shared.stop.load(Ordering::Acquire) {
            self.tick();
            std::thread::sleep(POLL_INTERVAL);
        }
        if let Some(runner) = self.runner.take() {
            self.finish(runner, false);
        }
        debug!("communication thread stopped");
    }

    fn tick(&mut self) {
        let shared = self.shared.clone();
        let mut interface = shared.interface.lock();
        let alive = interface.poll();
        let interface_events = interface.take_events();

        if self.runner.is_none() {
            if let Ok(runner) = self.queued.try_recv() {
                self.runner = Some(runner);
                self.started = false;
                self.reopens = 0;
            }
        }

        let mut operation_events = Vec::new();
        let mut state = None;
        for event in &interface_events {
            if let InterfaceEvent::Connection(status) = event {
                self.report(ClientEvent::Connection(*status));
            }
            if let Some(runner) = self.runner.as_mut().filter(|_| self.started) {
                let mut cx = Context::new(&mut *interface, self.prompt.as_mut(), &mut operation_events);
                state = Some(runner.handle_event(&mut cx, event));
            }
        }

        if let Some(runner) = &mut self.runner {
            let mut cx = Context::new(&mut *interface, self.prompt.as_mut(), &mut operation_events);
            if self.started {
                state = Some(runner.advance(&mut cx));
            } else if cx.link.is_connected() {
                self.started = true;
                state = Some(runner.start(&mut cx));
            } else if !alive {
                warn!(operation = runner.name(), "connection failed before the operation started");
                state = Some(RunnerState::Finished(false));
            }
        }

        for event in operation_events {
            self.report(ClientEvent::Operation(event));
        }

        match state {
            Some(RunnerState::NeedsReconnect)
                if interface.status() == ConnectionStatus::CommunicationTerminated =>
            {
                self.reopen(&mut interface);
            }
            Some(RunnerState::Finished(success)) => {
                if let Some(runner) = self.runner.take() {
                    drop(interface);
                    self.finish(runner, success);
                }
            }
            _ => {}
        }
    }

    fn reopen(&mut self, interface: &mut Interface<K>) {
        if self.reopens >= MAX_REOPENS {
            warn!("giving up on reconnecting");
            if let Some(runner) = &self.runner {
                runner.abort_flag().store(true, Ordering::Release);
            }
            return;
        }
        self.reopens += 1;
        info!(attempt = self.reopens, "opening the interface again to reconnect");
        match interface.open() {
            Ok(true) => {}
            Ok(false) => warn!("interface could not be opened again"),
            Err(e) => warn!(error = %e, "interface could not be opened again"),
        }
        // give the ECU a moment before the next handshake
        std::thread::sleep(Duration::from_millis(100));
    }

    fn finish(&mut self, runner: OperationRunner, success: bool) {
        let name = runner.name();
        let output = runner.into_output();
        self.shared.busy.store(false, Ordering::Release);
        self.report(ClientEvent::OperationFinished {
            name,
            success,
            output,
        });
    }

    /// The loop keeps running without a listener, the client handle still
    /// owns its lifetime.
    fn report(&mut self, event: ClientEvent) {
        if self.events.send(event).is_err() && !self.unheard {
            self.unheard = true;
            debug!("event receiver dropped, events are no longer reported");
        }
    }
}
