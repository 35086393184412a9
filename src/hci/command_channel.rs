// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command send/receive multiplexing over a shared HCI transport.
//!
//! [`CommandChannel`] serializes outgoing commands, routes Command
//! Status / Command Complete back to the issuing caller, holds commands
//! whose completion event is already claimed by an in-flight command,
//! and enforces mutual exclusion between Inquiry and the commands that
//! may not interleave with it (notably Remote Name Request).
//!
//! [`CommandRunner`] layers a sequential batch on top: commands queued
//! with `wait = true` hold until everything queued before them has
//! completed, a failure aborts the remainder, and cancellation is
//! cooperative (the in-flight command finishes, its result is
//! discarded).

use bitflags::bitflags;
use log::{trace, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hci::command::CommandPacket;
use crate::hci::constants::{EventCode, Opcode};
use crate::hci::event::{CommandCompleteParams, CommandStatusParams, EventPacket};

/// The write half of the HCI transport. The embedder supplies this; the
/// command channel is its only user.
pub trait Transport {
    fn send_command(&self, packet: &[u8]);
}

bitflags! {
    /// Exclusivity groups. A command carrying a group bit will not be
    /// sent while another command carrying the same bit is in flight.
    pub struct Exclusions: u8 {
        /// Inquiry, and commands that may not interleave with an active
        /// Inquiry (Remote Name Request).
        const INQUIRY = 0b1;
    }
}

/// Completion callback for a single command. Receives the Command
/// Complete event or, for commands that complete asynchronously, the
/// registered completion event.
pub type CommandCallback = Box<dyn FnOnce(Result<EventPacket>) + 'static>;

/// Intermediate callback fired when an asynchronous command's Command
/// Status arrives, before its completion event.
pub type StatusCallback = Box<dyn FnOnce(Result<()>) + 'static>;

/// A handler for unsolicited events of a given code.
pub type EventHandler = Box<dyn FnMut(&EventPacket) + 'static>;

/// Identifies a registered event handler for removal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EventHandlerId(u64);

struct Transaction {
    opcode: Opcode,
    complete_event: EventCode,
    exclusions: Exclusions,
    status_callback: Option<StatusCallback>,
    callback: Option<CommandCallback>,
}

struct PendingSend {
    packet: CommandPacket,
    complete_event: EventCode,
    exclusions: Exclusions,
    status_callback: Option<StatusCallback>,
    callback: CommandCallback,
}

struct Inner {
    transport: Arc<dyn Transport>,
    pending: Vec<Transaction>,
    held: VecDeque<PendingSend>,
    // A handler slot is `None` while checked out for dispatch.
    handlers: HashMap<EventHandlerId, (EventCode, Option<EventHandler>)>,
    tombstones: HashSet<EventHandlerId>,
    next_handler_id: u64,
}

impl Inner {
    fn may_send(&self, complete_event: EventCode, exclusions: Exclusions) -> bool {
        let event_claimed = complete_event != EventCode::CommandComplete
            && complete_event != EventCode::CommandStatus
            && self.pending.iter().any(|t| t.complete_event == complete_event);
        let excluded = self.pending.iter().any(|t| t.exclusions.intersects(exclusions));
        !event_claimed && !excluded
    }

    fn transmit(
        &mut self,
        packet: CommandPacket,
        complete_event: EventCode,
        exclusions: Exclusions,
        status_callback: Option<StatusCallback>,
        callback: CommandCallback,
    ) {
        self.transport.send_command(&packet.bytes());
        self.pending.push(Transaction {
            opcode: packet.opcode(),
            complete_event,
            exclusions,
            status_callback,
            callback: Some(callback),
        });
    }

    /// Sends every held command that is no longer blocked.
    fn pump(&mut self) {
        let mut index = 0;
        while index < self.held.len() {
            let send = &self.held[index];
            if self.may_send(send.complete_event, send.exclusions) {
                let send = self.held.remove(index).expect("index in bounds");
                self.transmit(
                    send.packet,
                    send.complete_event,
                    send.exclusions,
                    send.status_callback,
                    send.callback,
                );
            } else {
                index += 1;
            }
        }
    }
}

/// Cloneable handle to the shared command channel.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<Mutex<Inner>>,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn Transport>) -> CommandChannel {
        CommandChannel {
            inner: Arc::new(Mutex::new(Inner {
                transport,
                pending: Vec::new(),
                held: VecDeque::new(),
                handlers: HashMap::new(),
                tombstones: HashSet::new(),
                next_handler_id: 0,
            })),
        }
    }

    /// Sends a command that completes with Command Complete.
    pub fn send_command(&self, packet: CommandPacket, callback: CommandCallback) {
        self.send_exclusive(packet, EventCode::CommandComplete, Exclusions::empty(), callback);
    }

    /// Sends a command whose terminal event is `complete_event`. Only
    /// one command per asynchronous completion event may be in flight;
    /// later ones hold until the first completes. Commands whose
    /// `exclusions` intersect an in-flight command's are held likewise.
    pub fn send_exclusive(
        &self,
        packet: CommandPacket,
        complete_event: EventCode,
        exclusions: Exclusions,
        callback: CommandCallback,
    ) {
        self.send_with_status(packet, complete_event, exclusions, None, callback);
    }

    /// Like [`send_exclusive`](Self::send_exclusive), with an
    /// additional callback fired when the command's intermediate
    /// Command Status arrives.
    pub fn send_with_status(
        &self,
        packet: CommandPacket,
        complete_event: EventCode,
        exclusions: Exclusions,
        status_callback: Option<StatusCallback>,
        callback: CommandCallback,
    ) {
        let mut inner = self.inner.lock();
        if inner.may_send(complete_event, exclusions) {
            inner.transmit(packet, complete_event, exclusions, status_callback, callback);
        } else {
            inner.held.push_back(PendingSend {
                packet,
                complete_event,
                exclusions,
                status_callback,
                callback,
            });
        }
    }

    /// Abandons the in-flight transaction for `opcode`, completing it
    /// with `Error::Canceled` and releasing its exclusivity. Used when
    /// a cancel command supersedes the completion event the transaction
    /// is waiting for (Inquiry Cancel produces no Inquiry Complete).
    pub fn abort_transaction(&self, opcode: Opcode) -> bool {
        let callback = {
            let mut inner = self.inner.lock();
            let position = inner.pending.iter().position(|t| t.opcode == opcode);
            match position {
                Some(index) => {
                    let mut transaction = inner.pending.remove(index);
                    inner.pump();
                    transaction.callback.take()
                }
                None => return false,
            }
        };
        if let Some(callback) = callback {
            callback(Err(Error::Canceled));
        }
        true
    }

    /// Registers a handler for unsolicited events of `code`. Events
    /// claimed as a command's completion are not delivered to handlers.
    pub fn add_event_handler(&self, code: EventCode, handler: EventHandler) -> EventHandlerId {
        let mut inner = self.inner.lock();
        let id = EventHandlerId(inner.next_handler_id);
        inner.next_handler_id += 1;
        inner.handlers.insert(id, (code, Some(handler)));
        id
    }

    /// Removes a registered handler. Idempotent.
    pub fn remove_event_handler(&self, id: EventHandlerId) {
        let mut inner = self.inner.lock();
        match inner.handlers.get(&id) {
            Some((_, Some(_))) => {
                inner.handlers.remove(&id);
            }
            Some((_, None)) => {
                // Checked out for dispatch right now; drop it on return.
                inner.tombstones.insert(id);
            }
            None => {}
        }
    }

    /// Routes one inbound event packet. Malformed packets are reported
    /// to the caller and otherwise ignored.
    pub fn handle_event(&self, bytes: &[u8]) -> Result<()> {
        let packet = EventPacket::parse(bytes)?;
        let code = match packet.code() {
            Some(code) => code,
            None => {
                trace!("CommandChannel: ignoring unknown event 0x{:02x}", packet.code_raw());
                return Ok(());
            }
        };

        let mut completions: Vec<(CommandCallback, Result<EventPacket>)> = Vec::new();
        let mut statuses: Vec<(StatusCallback, Result<()>)> = Vec::new();
        let mut dispatch_to_handlers = false;
        {
            let mut inner = self.inner.lock();
            match code {
                EventCode::CommandStatus => {
                    let params: CommandStatusParams = packet.decode()?;
                    let position =
                        inner.pending.iter().position(|t| t.opcode == params.opcode);
                    match position {
                        Some(index) => {
                            let status = Error::check_status(params.status);
                            if let Some(status_callback) =
                                inner.pending[index].status_callback.take()
                            {
                                statuses.push((status_callback, status.clone()));
                            }
                            let done = status.is_err()
                                || inner.pending[index].complete_event == EventCode::CommandStatus;
                            if done {
                                let mut transaction = inner.pending.remove(index);
                                let result = status.map(|_| packet.clone());
                                if let Some(callback) = transaction.callback.take() {
                                    completions.push((callback, result));
                                }
                                inner.pump();
                            }
                        }
                        None => trace!(
                            "CommandChannel: status for unknown opcode {:?}",
                            params.opcode
                        ),
                    }
                }
                EventCode::CommandComplete => {
                    let params: CommandCompleteParams = packet.decode()?;
                    let position =
                        inner.pending.iter().position(|t| t.opcode == params.opcode);
                    match position {
                        Some(index) => {
                            let mut transaction = inner.pending.remove(index);
                            // Every return block this crate consumes
                            // leads with a status byte; a failure there
                            // completes the command as an error.
                            let result = match params.status() {
                                Ok(status) => {
                                    Error::check_status(status).map(|_| packet.clone())
                                }
                                Err(_) => Ok(packet.clone()),
                            };
                            if let Some(callback) = transaction.callback.take() {
                                completions.push((callback, result));
                            }
                            inner.pump();
                        }
                        None => trace!(
                            "CommandChannel: complete for unknown opcode {:?}",
                            params.opcode
                        ),
                    }
                }
                code => {
                    let position = inner.pending.iter().position(|t| t.complete_event == code);
                    match position {
                        Some(index) => {
                            let mut transaction = inner.pending.remove(index);
                            if let Some(callback) = transaction.callback.take() {
                                completions.push((callback, Ok(packet.clone())));
                            }
                            inner.pump();
                        }
                        None => dispatch_to_handlers = true,
                    }
                }
            }
        }

        for (status_callback, result) in statuses {
            status_callback(result);
        }
        for (callback, result) in completions {
            callback(result);
        }
        if dispatch_to_handlers {
            self.dispatch(code, &packet);
        }
        Ok(())
    }

    fn dispatch(&self, code: EventCode, packet: &EventPacket) {
        let ids: Vec<EventHandlerId> = {
            let inner = self.inner.lock();
            inner
                .handlers
                .iter()
                .filter(|(_, (c, slot))| *c == code && slot.is_some())
                .map(|(&id, _)| id)
                .collect()
        };
        if ids.is_empty() {
            trace!("CommandChannel: no handler for event {:?}", code);
        }
        for id in ids {
            let handler = {
                let mut inner = self.inner.lock();
                inner.handlers.get_mut(&id).and_then(|(_, slot)| slot.take())
            };
            let mut handler = match handler {
                Some(handler) => handler,
                // Removed by an earlier handler in this dispatch round.
                None => continue,
            };
            handler(packet);
            let mut inner = self.inner.lock();
            if inner.tombstones.remove(&id) {
                inner.handlers.remove(&id);
            } else if let Some((_, slot)) = inner.handlers.get_mut(&id) {
                *slot = Some(handler);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for transaction in self.pending.iter_mut() {
            if let Some(callback) = transaction.callback.take() {
                callback(Err(Error::Canceled));
            }
        }
        for send in self.held.drain(..) {
            (send.callback)(Err(Error::Canceled));
        }
    }
}

/// Result handler for one command in a [`CommandRunner`] batch.
pub type CommandResultHandler = Box<dyn FnOnce(&EventPacket) + 'static>;

/// Completion callback for a whole [`CommandRunner`] batch.
pub type RunnerCompletion = Box<dyn FnOnce(Result<()>) + 'static>;

struct RunnerEntry {
    packet: CommandPacket,
    complete_event: EventCode,
    exclusions: Exclusions,
    wait: bool,
    handler: Option<CommandResultHandler>,
}

struct RunnerState {
    queue: VecDeque<RunnerEntry>,
    outstanding: usize,
    running: bool,
    canceled: bool,
    failed: bool,
    completion: Option<RunnerCompletion>,
    // Bumped on cancel so stale in-flight results are discarded.
    generation: u64,
}

/// Runs a batch of commands in queue order. Entries queued with
/// `wait = true` are not sent until every earlier entry has completed;
/// `wait = false` entries may overlap the previous command. The first
/// command error aborts the remainder of the batch.
#[derive(Clone)]
pub struct CommandRunner {
    channel: CommandChannel,
    state: Arc<Mutex<RunnerState>>,
}

impl CommandRunner {
    pub fn new(channel: CommandChannel) -> CommandRunner {
        CommandRunner {
            channel,
            state: Arc::new(Mutex::new(RunnerState {
                queue: VecDeque::new(),
                outstanding: 0,
                running: false,
                canceled: false,
                failed: false,
                completion: None,
                generation: 0,
            })),
        }
    }

    /// Appends a command to the batch. May be called from a result
    /// handler to extend a running batch.
    pub fn queue(
        &self,
        packet: CommandPacket,
        complete_event: EventCode,
        exclusions: Exclusions,
        wait: bool,
        handler: CommandResultHandler,
    ) {
        let mut state = self.state.lock();
        if state.canceled || state.failed {
            return;
        }
        state.queue.push_back(RunnerEntry {
            packet,
            complete_event,
            exclusions,
            wait,
            handler: Some(handler),
        });
        if state.running {
            drop(state);
            self.pump();
        }
    }

    /// Starts the batch. `completion` fires with `Ok(())` once every
    /// queued command has completed, or with the first error.
    pub fn run(&self, completion: RunnerCompletion) {
        {
            let mut state = self.state.lock();
            if state.running {
                warn!("CommandRunner: run requested while already running");
                completion(Err(Error::Failed("runner already running")));
                return;
            }
            state.running = true;
            state.canceled = false;
            state.failed = false;
            state.completion = Some(completion);
        }
        self.pump();
        self.maybe_complete();
    }

    /// Cooperative cancellation: nothing further is sent, the in-flight
    /// command's result is discarded, and the batch completion fires
    /// with `Error::Canceled` once the in-flight command returns.
    pub fn cancel(&self) {
        let completion = {
            let mut state = self.state.lock();
            if !state.running || state.canceled {
                return;
            }
            state.canceled = true;
            state.generation += 1;
            state.queue.clear();
            if state.outstanding == 0 {
                state.running = false;
                state.completion.take()
            } else {
                None
            }
        };
        if let Some(completion) = completion {
            completion(Err(Error::Canceled));
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn pump(&self) {
        loop {
            let entry = {
                let mut state = self.state.lock();
                if state.canceled || state.failed {
                    return;
                }
                let blocked = state
                    .queue
                    .front()
                    .map_or(true, |entry| entry.wait && state.outstanding > 0);
                if blocked {
                    return;
                }
                let entry = state.queue.pop_front().expect("front checked above");
                state.outstanding += 1;
                (entry, state.generation)
            };
            let (mut entry, generation) = entry;
            let runner = self.clone();
            let handler = entry.handler.take();
            self.channel.send_exclusive(
                entry.packet,
                entry.complete_event,
                entry.exclusions,
                Box::new(move |result| runner.on_command_done(generation, handler, result)),
            );
        }
    }

    fn on_command_done(
        &self,
        generation: u64,
        handler: Option<CommandResultHandler>,
        result: Result<EventPacket>,
    ) {
        enum Outcome {
            Stale,
            Failed(Error),
            Done(EventPacket),
        }
        let outcome = {
            let mut state = self.state.lock();
            state.outstanding -= 1;
            if generation != state.generation || state.failed {
                Outcome::Stale
            } else {
                match result {
                    Ok(packet) => Outcome::Done(packet),
                    Err(error) => {
                        state.failed = true;
                        state.queue.clear();
                        Outcome::Failed(error)
                    }
                }
            }
        };
        match outcome {
            Outcome::Stale => self.maybe_complete(),
            Outcome::Failed(error) => {
                let completion = {
                    let mut state = self.state.lock();
                    state.running = false;
                    state.completion.take()
                };
                if let Some(completion) = completion {
                    completion(Err(error));
                }
            }
            Outcome::Done(packet) => {
                if let Some(handler) = handler {
                    handler(&packet);
                }
                self.pump();
                self.maybe_complete();
            }
        }
    }

    fn maybe_complete(&self) {
        let (completion, result) = {
            let mut state = self.state.lock();
            if !state.running || state.outstanding > 0 {
                return;
            }
            if state.canceled {
                state.running = false;
                (state.completion.take(), Err(Error::Canceled))
            } else if state.queue.is_empty() && !state.failed {
                state.running = false;
                (state.completion.take(), Ok(()))
            } else {
                return;
            }
        };
        if let Some(completion) = completion {
            completion(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::command::{CommandPacket, HandleParams, RemoteNameRequestParams};
    use crate::test_utils::{
        command_complete, command_status, event_bytes, RecordingTransport,
    };
    use matches::assert_matches;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn setup() -> (CommandChannel, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        (CommandChannel::new(transport.clone()), transport)
    }

    fn nop_command(opcode: Opcode) -> CommandPacket {
        CommandPacket::new_empty(opcode)
    }

    #[test]
    fn command_complete_routes_to_sender() {
        let (channel, transport) = setup();
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        channel.send_command(
            nop_command(Opcode::READ_SCAN_ENABLE),
            Box::new(move |result| sink.borrow_mut().push(result)),
        );
        assert_eq!(transport.sent().len(), 1);

        channel
            .handle_event(&command_complete(Opcode::READ_SCAN_ENABLE, &[0x00, 0x03]))
            .expect("routes");
        let results = results.borrow();
        assert_matches!(&results[..], [Ok(_)]);
    }

    #[test]
    fn command_status_failure_completes_with_protocol_error() {
        let (channel, _transport) = setup();
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        channel.send_exclusive(
            nop_command(Opcode::CREATE_CONNECTION),
            EventCode::CommandStatus,
            Exclusions::empty(),
            Box::new(move |result| sink.borrow_mut().push(result)),
        );
        channel
            .handle_event(&command_status(
                Opcode::CREATE_CONNECTION,
                crate::hci::StatusCode::CommandDisallowed,
            ))
            .expect("routes");
        assert_matches!(
            &results.borrow()[..],
            [Err(Error::Protocol(crate::hci::StatusCode::CommandDisallowed))]
        );
    }

    #[test]
    fn async_completion_event_routes_to_transaction_not_handlers() {
        let (channel, _transport) = setup();
        let handler_called = Rc::new(RefCell::new(0));
        let counter = handler_called.clone();
        let _id = channel.add_event_handler(
            EventCode::RemoteNameRequestComplete,
            Box::new(move |_| *counter.borrow_mut() += 1),
        );

        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        channel.send_exclusive(
            CommandPacket::new(
                Opcode::REMOTE_NAME_REQUEST,
                &RemoteNameRequestParams {
                    bd_addr: [1; 6],
                    page_scan_repetition_mode: 0,
                    clock_offset: None,
                },
            ),
            EventCode::RemoteNameRequestComplete,
            Exclusions::INQUIRY,
            Box::new(move |result| sink.borrow_mut().push(result)),
        );

        // Intermediate status keeps the transaction alive.
        channel
            .handle_event(&command_status(
                Opcode::REMOTE_NAME_REQUEST,
                crate::hci::StatusCode::Success,
            ))
            .expect("routes");
        assert!(results.borrow().is_empty());

        let mut payload = vec![0x00];
        payload.extend_from_slice(&[1; 6]);
        payload.extend_from_slice(b"peer\0");
        channel
            .handle_event(&event_bytes(EventCode::RemoteNameRequestComplete, &payload))
            .expect("routes");
        assert_matches!(&results.borrow()[..], [Ok(_)]);
        assert_eq!(*handler_called.borrow(), 0);
    }

    #[test]
    fn inquiry_exclusion_holds_name_request_until_inquiry_completes() {
        let (channel, transport) = setup();
        channel.send_exclusive(
            nop_command(Opcode::INQUIRY),
            EventCode::InquiryComplete,
            Exclusions::INQUIRY,
            Box::new(|_| {}),
        );
        channel.send_exclusive(
            nop_command(Opcode::REMOTE_NAME_REQUEST),
            EventCode::RemoteNameRequestComplete,
            Exclusions::INQUIRY,
            Box::new(|_| {}),
        );
        // Only the inquiry goes out.
        assert_eq!(transport.sent_opcodes(), vec![Opcode::INQUIRY]);

        channel
            .handle_event(&event_bytes(EventCode::InquiryComplete, &[0x00]))
            .expect("routes");
        assert_eq!(
            transport.sent_opcodes(),
            vec![Opcode::INQUIRY, Opcode::REMOTE_NAME_REQUEST]
        );
    }

    #[test]
    fn unsolicited_event_goes_to_handlers_and_removal_is_idempotent() {
        let (channel, _transport) = setup();
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        let id = channel.add_event_handler(
            EventCode::ConnectionRequest,
            Box::new(move |_| *counter.borrow_mut() += 1),
        );

        let mut payload = vec![0u8; 10];
        payload[9] = 0x01;
        channel
            .handle_event(&event_bytes(EventCode::ConnectionRequest, &payload))
            .expect("routes");
        assert_eq!(*calls.borrow(), 1);

        channel.remove_event_handler(id);
        channel.remove_event_handler(id);
        channel
            .handle_event(&event_bytes(EventCode::ConnectionRequest, &payload))
            .expect("routes");
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn runner_waits_between_commands_and_reports_completion() {
        let (channel, transport) = setup();
        let runner = CommandRunner::new(channel.clone());
        runner.queue(
            nop_command(Opcode::READ_SCAN_ENABLE),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        runner.queue(
            nop_command(Opcode::WRITE_SCAN_ENABLE),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        let done = Rc::new(RefCell::new(None));
        let sink = done.clone();
        runner.run(Box::new(move |result| *sink.borrow_mut() = Some(result)));

        // Second command held until the first completes.
        assert_eq!(transport.sent_opcodes(), vec![Opcode::READ_SCAN_ENABLE]);
        channel
            .handle_event(&command_complete(Opcode::READ_SCAN_ENABLE, &[0x00, 0x00]))
            .expect("routes");
        assert_eq!(
            transport.sent_opcodes(),
            vec![Opcode::READ_SCAN_ENABLE, Opcode::WRITE_SCAN_ENABLE]
        );
        assert!(done.borrow().is_none());
        channel
            .handle_event(&command_complete(Opcode::WRITE_SCAN_ENABLE, &[0x00]))
            .expect("routes");
        assert_matches!(&*done.borrow(), Some(Ok(())));
    }

    #[test]
    fn runner_aborts_batch_on_first_error() {
        let (channel, transport) = setup();
        let runner = CommandRunner::new(channel.clone());
        runner.queue(
            CommandPacket::new(
                Opcode::READ_REMOTE_VERSION_INFORMATION,
                &HandleParams { handle: 1 },
            ),
            EventCode::ReadRemoteVersionInformationComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| panic!("handler must not run on failure")),
        );
        runner.queue(
            nop_command(Opcode::READ_SCAN_ENABLE),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        let done = Rc::new(RefCell::new(None));
        let sink = done.clone();
        runner.run(Box::new(move |result| *sink.borrow_mut() = Some(result)));

        channel
            .handle_event(&command_status(
                Opcode::READ_REMOTE_VERSION_INFORMATION,
                crate::hci::StatusCode::PageTimeout,
            ))
            .expect("routes");
        assert_matches!(
            &*done.borrow(),
            Some(Err(Error::Protocol(crate::hci::StatusCode::PageTimeout)))
        );
        // The second command was never sent.
        assert_eq!(transport.sent_opcodes(), vec![Opcode::READ_REMOTE_VERSION_INFORMATION]);
    }

    #[test]
    fn runner_cancel_is_cooperative() {
        let (channel, transport) = setup();
        let runner = CommandRunner::new(channel.clone());
        let handled = Rc::new(RefCell::new(false));
        let flag = handled.clone();
        runner.queue(
            CommandPacket::new(
                Opcode::READ_REMOTE_VERSION_INFORMATION,
                &HandleParams { handle: 1 },
            ),
            EventCode::ReadRemoteVersionInformationComplete,
            Exclusions::empty(),
            true,
            Box::new(move |_| *flag.borrow_mut() = true),
        );
        runner.queue(
            nop_command(Opcode::READ_SCAN_ENABLE),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        let done = Rc::new(RefCell::new(None));
        let sink = done.clone();
        runner.run(Box::new(move |result| *sink.borrow_mut() = Some(result)));
        runner.cancel();
        // In-flight command still completes on the wire; its result is
        // discarded and nothing further is sent.
        assert!(done.borrow().is_none());
        let mut payload = vec![0x00];
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&[9, 0x23, 0x01, 0x11, 0x22]);
        channel
            .handle_event(&event_bytes(
                EventCode::ReadRemoteVersionInformationComplete,
                &payload,
            ))
            .expect("routes");
        assert_matches!(&*done.borrow(), Some(Err(Error::Canceled)));
        assert!(!*handled.borrow());
        assert_eq!(transport.sent_opcodes(), vec![Opcode::READ_REMOTE_VERSION_INFORMATION]);
    }

    #[test]
    fn runner_handler_may_extend_the_batch() {
        let (channel, transport) = setup();
        let runner = CommandRunner::new(channel.clone());
        let extender = runner.clone();
        runner.queue(
            nop_command(Opcode::READ_SCAN_ENABLE),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(move |_| {
                extender.queue(
                    nop_command(Opcode::WRITE_SCAN_ENABLE),
                    EventCode::CommandComplete,
                    Exclusions::empty(),
                    true,
                    Box::new(|_| {}),
                );
            }),
        );
        let done = Rc::new(RefCell::new(None));
        let sink = done.clone();
        runner.run(Box::new(move |result| *sink.borrow_mut() = Some(result)));

        channel
            .handle_event(&command_complete(Opcode::READ_SCAN_ENABLE, &[0x00, 0x00]))
            .expect("routes");
        // The extension went out and the batch is still running.
        assert_eq!(
            transport.sent_opcodes(),
            vec![Opcode::READ_SCAN_ENABLE, Opcode::WRITE_SCAN_ENABLE]
        );
        assert!(done.borrow().is_none());
        channel
            .handle_event(&command_complete(Opcode::WRITE_SCAN_ENABLE, &[0x00]))
            .expect("routes");
        assert_matches!(&*done.borrow(), Some(Ok(())));
    }
}
