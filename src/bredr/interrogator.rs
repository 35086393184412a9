// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One-shot capability collection for a newly connected BR/EDR peer.
//!
//! Given a live ACL handle, the interrogator populates the peer's
//! remote name, version, and LMP feature pages. Fields already present
//! from a prior interrogation are skipped, so a reconnection runs the
//! short variant that only refreshes extended feature pages. The
//! first command error completes the interrogation with that error;
//! the connection manager decides what happens to the link.

use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::hci::command::{
    CommandPacket, HandleParams, ReadRemoteExtendedFeaturesParams, RemoteNameRequestParams,
};
use crate::hci::constants::{EventCode, Opcode};
use crate::hci::event::{
    ReadRemoteExtendedFeaturesCompleteParams, ReadRemoteSupportedFeaturesCompleteParams,
    ReadRemoteVersionInformationCompleteParams, RemoteNameRequestCompleteParams,
};
use crate::hci::{CommandChannel, CommandRunner, Exclusions};
use crate::peer::{NameSource, PeerCache, RemoteVersion};
use crate::types::{ConnectionHandle, PeerId};

/// Callback invoked when an interrogation reaches a terminal state.
pub type InterrogationCallback = Box<dyn FnOnce(Result<()>) + 'static>;

struct InterrogationContext {
    runner: CommandRunner,
}

/// Runs interrogation batches. One context exists per in-flight
/// connection handle; contexts are destroyed on completion or
/// cancellation.
#[derive(Clone)]
pub struct Interrogator {
    channel: CommandChannel,
    cache: PeerCache,
    contexts: Arc<Mutex<HashMap<ConnectionHandle, InterrogationContext>>>,
}

impl Interrogator {
    pub fn new(channel: CommandChannel, cache: PeerCache) -> Interrogator {
        Interrogator { channel, cache, contexts: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Begins interrogating the peer behind `handle`. `callback` fires
    /// once every requested field is populated or on the first error.
    pub fn start(&self, peer_id: PeerId, handle: ConnectionHandle, callback: InterrogationCallback) {
        let peer = match self.cache.find_by_id(peer_id) {
            Some(peer) => peer,
            None => {
                callback(Err(crate::Error::NotFound));
                return;
            }
        };
        info!("Interrogator: starting interrogation of {} (handle 0x{:04x})", peer_id, handle);

        let runner = CommandRunner::new(self.channel.clone());

        if peer.name().is_none() {
            let cache = self.cache.clone();
            let params = RemoteNameRequestParams {
                bd_addr: *peer
                    .bredr_address()
                    .unwrap_or_else(|| peer.addresses()[0])
                    .bytes(),
                page_scan_repetition_mode: peer.page_scan_repetition_mode().unwrap_or(0x02),
                clock_offset: peer.clock_offset(),
            };
            runner.queue(
                CommandPacket::new(Opcode::REMOTE_NAME_REQUEST, &params),
                EventCode::RemoteNameRequestComplete,
                Exclusions::INQUIRY,
                false,
                Box::new(move |packet| {
                    match packet.decode::<RemoteNameRequestCompleteParams>() {
                        Ok(params) => {
                            let name = String::from_utf8_lossy(params.name()).into_owned();
                            cache.update_peer(peer_id, |peer| {
                                peer.set_name(name, NameSource::NameDiscoveryProcedure)
                            });
                        }
                        Err(e) => warn!("Interrogator: bad name response: {}", e),
                    }
                }),
            );
        }

        if peer.version().is_none() {
            let cache = self.cache.clone();
            runner.queue(
                CommandPacket::new(
                    Opcode::READ_REMOTE_VERSION_INFORMATION,
                    &HandleParams { handle },
                ),
                EventCode::ReadRemoteVersionInformationComplete,
                Exclusions::empty(),
                false,
                Box::new(move |packet| {
                    match packet.decode::<ReadRemoteVersionInformationCompleteParams>() {
                        Ok(params) => {
                            cache.update_peer(peer_id, |peer| {
                                peer.set_version(RemoteVersion {
                                    version: params.version,
                                    manufacturer_name: params.manufacturer_name,
                                    subversion: params.subversion,
                                })
                            });
                        }
                        Err(e) => warn!("Interrogator: bad version response: {}", e),
                    }
                }),
            );
        }

        if peer.features().page(0).is_none() {
            let cache = self.cache.clone();
            let chain = self.clone();
            let chain_runner = runner.clone();
            runner.queue(
                CommandPacket::new(
                    Opcode::READ_REMOTE_SUPPORTED_FEATURES,
                    &HandleParams { handle },
                ),
                EventCode::ReadRemoteSupportedFeaturesComplete,
                Exclusions::empty(),
                false,
                Box::new(move |packet| {
                    match packet.decode::<ReadRemoteSupportedFeaturesCompleteParams>() {
                        Ok(params) => {
                            let extended = cache
                                .update_peer(peer_id, |peer| {
                                    peer.features_mut().set_page(0, params.features);
                                    peer.features().has_extended_features()
                                })
                                .unwrap_or(false);
                            if extended {
                                chain.queue_extended_page(&chain_runner, peer_id, handle, 1, 1);
                            } else {
                                cache.update_peer(peer_id, |peer| {
                                    peer.features_mut().set_last_page_number(0)
                                });
                            }
                        }
                        Err(e) => warn!("Interrogator: bad features response: {}", e),
                    }
                }),
            );
        } else if peer.features().has_extended_features() {
            // Short variant on reconnection: refresh the extended pages
            // only.
            self.queue_extended_page(&runner, peer_id, handle, 1, 1);
        }

        self.contexts.lock().insert(handle, InterrogationContext { runner: runner.clone() });

        let contexts = self.contexts.clone();
        runner.run(Box::new(move |result| {
            contexts.lock().remove(&handle);
            match &result {
                Ok(()) => info!("Interrogator: {} complete", peer_id),
                Err(e) => warn!("Interrogator: {} failed: {}", peer_id, e),
            }
            callback(result);
        }));
    }

    /// Cooperatively cancels the interrogation on `handle`, if one is
    /// running. The in-flight command finishes on the wire; its result
    /// is discarded and the completion callback fires with
    /// `Error::Canceled`. The connection itself is unaffected.
    pub fn cancel(&self, handle: ConnectionHandle) {
        let context = self.contexts.lock().remove(&handle);
        if let Some(context) = context {
            context.runner.cancel();
        }
    }

    /// Queues a Read Remote Extended Features command for `page`.
    /// `max_page` is the cap learned from the page-1 response (pages
    /// past it are never requested); for the page-1 request itself the
    /// cap is not yet known.
    fn queue_extended_page(
        &self,
        runner: &CommandRunner,
        peer_id: PeerId,
        handle: ConnectionHandle,
        page: u8,
        max_page: u8,
    ) {
        let cache = self.cache.clone();
        let chain = self.clone();
        let chain_runner = runner.clone();
        runner.queue(
            CommandPacket::new(
                Opcode::READ_REMOTE_EXTENDED_FEATURES,
                &ReadRemoteExtendedFeaturesParams { handle, page },
            ),
            EventCode::ReadRemoteExtendedFeaturesComplete,
            Exclusions::empty(),
            true,
            Box::new(move |packet| {
                let params = match packet.decode::<ReadRemoteExtendedFeaturesCompleteParams>() {
                    Ok(params) => params,
                    Err(e) => {
                        warn!("Interrogator: bad extended features response: {}", e);
                        return;
                    }
                };
                if params.page_number != page {
                    // Some controllers echo the wrong page instead of
                    // failing. Record what arrived, stop requesting
                    // pages, and pin the last page at 0.
                    warn!(
                        "Interrogator: requested features page {} but got {}; aborting",
                        page, params.page_number
                    );
                    cache.update_peer(peer_id, |peer| {
                        peer.features_mut().set_page(params.page_number, params.features);
                        peer.features_mut().set_last_page_number(0);
                    });
                    return;
                }
                // The page-1 response advertises the peer's maximum;
                // later responses cannot raise the cap.
                let cap = if page == 1 { params.max_page_number } else { max_page };
                cache.update_peer(peer_id, |peer| {
                    peer.features_mut().set_page(page, params.features);
                    peer.features_mut().set_last_page_number(cap);
                });
                if page < cap {
                    chain.queue_extended_page(&chain_runner, peer_id, handle, page + 1, cap);
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hci::constants::StatusCode;
    use crate::peer::FeaturePages;
    use crate::test_utils::{
        command_status, event_bytes, remote_name_request_complete, RecordingTransport,
    };
    use crate::types::Address;
    use matches::assert_matches;
    use std::cell::RefCell;
    use std::rc::Rc;

    const ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    const HANDLE: ConnectionHandle = 0x0BAA;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        channel: CommandChannel,
        cache: PeerCache,
        interrogator: Interrogator,
        peer_id: PeerId,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let channel = CommandChannel::new(transport.clone());
        let cache = PeerCache::new();
        let peer_id = cache.new_peer(Address::bredr(ADDR), true);
        let interrogator = Interrogator::new(channel.clone(), cache.clone());
        Fixture { transport, channel, cache, interrogator, peer_id }
    }

    fn version_complete(handle: ConnectionHandle) -> Vec<u8> {
        let mut payload = vec![StatusCode::Success.to_u8()];
        payload.extend_from_slice(&handle.to_le_bytes());
        payload.push(9); // version
        payload.extend_from_slice(&0x000Fu16.to_le_bytes());
        payload.extend_from_slice(&0x2222u16.to_le_bytes());
        event_bytes(EventCode::ReadRemoteVersionInformationComplete, &payload)
    }

    fn supported_features_complete(handle: ConnectionHandle, features: u64) -> Vec<u8> {
        let mut payload = vec![StatusCode::Success.to_u8()];
        payload.extend_from_slice(&handle.to_le_bytes());
        payload.extend_from_slice(&features.to_le_bytes());
        event_bytes(EventCode::ReadRemoteSupportedFeaturesComplete, &payload)
    }

    fn extended_features_complete(
        handle: ConnectionHandle,
        page: u8,
        max_page: u8,
        features: u64,
    ) -> Vec<u8> {
        let mut payload = vec![StatusCode::Success.to_u8()];
        payload.extend_from_slice(&handle.to_le_bytes());
        payload.push(page);
        payload.push(max_page);
        payload.extend_from_slice(&features.to_le_bytes());
        event_bytes(EventCode::ReadRemoteExtendedFeaturesComplete, &payload)
    }

    fn run_interrogation(f: &Fixture) -> Rc<RefCell<Option<Result<()>>>> {
        let done = Rc::new(RefCell::new(None));
        let sink = done.clone();
        f.interrogator.start(
            f.peer_id,
            HANDLE,
            Box::new(move |result| *sink.borrow_mut() = Some(result)),
        );
        done
    }

    #[test]
    fn full_interrogation_populates_peer() {
        let f = fixture();
        let done = run_interrogation(&f);

        // Name, version, and page 0 all go out without waiting on each
        // other.
        let opcodes = f.transport.sent_opcodes();
        assert!(opcodes.contains(&Opcode::REMOTE_NAME_REQUEST));
        assert!(opcodes.contains(&Opcode::READ_REMOTE_VERSION_INFORMATION));
        assert!(opcodes.contains(&Opcode::READ_REMOTE_SUPPORTED_FEATURES));

        f.channel
            .handle_event(&remote_name_request_complete(ADDR, b"Display"))
            .expect("routes");
        f.channel.handle_event(&version_complete(HANDLE)).expect("routes");
        f.channel
            .handle_event(&supported_features_complete(
                HANDLE,
                FeaturePages::EXTENDED_FEATURES_BIT,
            ))
            .expect("routes");

        // Page 0 advertised extended features, so page 1 was requested.
        assert_eq!(f.transport.count_sent(Opcode::READ_REMOTE_EXTENDED_FEATURES), 1);
        f.channel
            .handle_event(&extended_features_complete(HANDLE, 1, 2, 0x0001))
            .expect("routes");
        // Page 1 advertised a maximum of 2.
        assert_eq!(f.transport.count_sent(Opcode::READ_REMOTE_EXTENDED_FEATURES), 2);
        assert!(done.borrow().is_none());
        f.channel
            .handle_event(&extended_features_complete(HANDLE, 2, 2, 0x0002))
            .expect("routes");

        assert_matches!(&*done.borrow(), Some(Ok(())));
        let peer = f.cache.find_by_id(f.peer_id).unwrap();
        assert_eq!(peer.name(), Some("Display"));
        assert_eq!(peer.name_source(), Some(NameSource::NameDiscoveryProcedure));
        assert_eq!(peer.version().unwrap().version, 9);
        assert_eq!(peer.features().page(1), Some(0x0001));
        assert_eq!(peer.features().page(2), Some(0x0002));
        assert_eq!(peer.features().last_page_number(), Some(2));
    }

    #[test]
    fn page_number_mismatch_caps_last_page_at_zero() {
        let f = fixture();
        let done = run_interrogation(&f);

        f.channel
            .handle_event(&remote_name_request_complete(ADDR, b"peer"))
            .expect("routes");
        f.channel.handle_event(&version_complete(HANDLE)).expect("routes");
        f.channel
            .handle_event(&supported_features_complete(
                HANDLE,
                FeaturePages::EXTENDED_FEATURES_BIT,
            ))
            .expect("routes");

        // Requested page 1, controller echoes page 3.
        f.channel
            .handle_event(&extended_features_complete(HANDLE, 3, 5, 0xBEEF))
            .expect("routes");

        assert_matches!(&*done.borrow(), Some(Ok(())));
        let peer = f.cache.find_by_id(f.peer_id).unwrap();
        assert_eq!(peer.features().last_page_number(), Some(0));
        // The mismatched response is still recorded.
        assert_eq!(peer.features().page(3), Some(0xBEEF));
        // No further page requests.
        assert_eq!(f.transport.count_sent(Opcode::READ_REMOTE_EXTENDED_FEATURES), 1);
    }

    #[test]
    fn reinterrogation_is_short_variant() {
        let f = fixture();
        f.cache.update_peer(f.peer_id, |peer| {
            peer.set_name("known".to_string(), NameSource::NameDiscoveryProcedure);
            peer.set_version(RemoteVersion { version: 9, manufacturer_name: 2, subversion: 3 });
            peer.features_mut().set_page(0, FeaturePages::EXTENDED_FEATURES_BIT);
            peer.features_mut().set_page(1, 0x1);
            peer.features_mut().set_last_page_number(1);
        });

        let done = run_interrogation(&f);
        let opcodes = f.transport.sent_opcodes();
        assert!(!opcodes.contains(&Opcode::REMOTE_NAME_REQUEST));
        assert!(!opcodes.contains(&Opcode::READ_REMOTE_VERSION_INFORMATION));
        assert!(!opcodes.contains(&Opcode::READ_REMOTE_SUPPORTED_FEATURES));
        // Extended pages are refreshed.
        assert_eq!(f.transport.count_sent(Opcode::READ_REMOTE_EXTENDED_FEATURES), 1);
        f.channel
            .handle_event(&extended_features_complete(HANDLE, 1, 1, 0x2))
            .expect("routes");
        assert_matches!(&*done.borrow(), Some(Ok(())));
        let peer = f.cache.find_by_id(f.peer_id).unwrap();
        assert_eq!(peer.features().page(1), Some(0x2));
    }

    #[test]
    fn command_error_fails_interrogation() {
        let f = fixture();
        let done = run_interrogation(&f);
        f.channel
            .handle_event(&command_status(
                Opcode::READ_REMOTE_VERSION_INFORMATION,
                StatusCode::PageTimeout,
            ))
            .expect("routes");
        assert_matches!(
            &*done.borrow(),
            Some(Err(Error::Protocol(StatusCode::PageTimeout)))
        );
    }

    #[test]
    fn cancel_is_cooperative_and_leaves_connection_alone() {
        let f = fixture();
        let done = run_interrogation(&f);
        f.interrogator.cancel(HANDLE);
        // In-flight commands drain before the completion fires.
        assert!(done.borrow().is_none());
        f.channel
            .handle_event(&remote_name_request_complete(ADDR, b"late"))
            .expect("routes");
        f.channel.handle_event(&version_complete(HANDLE)).expect("routes");
        f.channel
            .handle_event(&supported_features_complete(HANDLE, 0))
            .expect("routes");
        assert_matches!(&*done.borrow(), Some(Err(Error::Canceled)));
        // The late name result was discarded.
        assert_eq!(f.cache.find_by_id(f.peer_id).unwrap().name(), None);
    }

    #[test]
    fn no_extended_features_means_no_page_requests() {
        let f = fixture();
        let done = run_interrogation(&f);
        f.channel
            .handle_event(&remote_name_request_complete(ADDR, b"basic"))
            .expect("routes");
        f.channel.handle_event(&version_complete(HANDLE)).expect("routes");
        f.channel.handle_event(&supported_features_complete(HANDLE, 0)).expect("routes");
        assert_matches!(&*done.borrow(), Some(Ok(())));
        assert_eq!(f.transport.count_sent(Opcode::READ_REMOTE_EXTENDED_FEATURES), 0);
        assert_eq!(
            f.cache.find_by_id(f.peer_id).unwrap().features().last_page_number(),
            Some(0)
        );
    }
}
