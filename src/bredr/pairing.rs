// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Secure Simple Pairing state carried per connection.
//!
//! The pairing procedure is event-driven: the connection manager feeds
//! controller events in and this module tracks where the procedure
//! stands, which callers are waiting on its outcome, and whether the
//! installed delegate can produce a key of the requested strength.

use crate::error::Result;
use crate::hci::constants::{AuthRequirements, IoCapability};
use crate::peer::BrEdrLinkKey;

/// Security a caller requires of a link before using it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SecurityRequirements {
    /// The link key must be MITM-protected.
    pub authentication: bool,
    /// The link key must come from a Secure Connections pairing.
    pub secure_connections: bool,
}

impl SecurityRequirements {
    /// True when `key` is at least as strong as required.
    pub fn satisfied_by(&self, key: &BrEdrLinkKey) -> bool {
        if self.authentication && !key.security.authenticated {
            return false;
        }
        if self.secure_connections && !key.security.secure_connections {
            return false;
        }
        true
    }

    /// Whether a delegate advertising `io` could possibly produce a key
    /// meeting these requirements. An authenticated key needs user
    /// interaction; a no-input-no-output delegate can only make
    /// unauthenticated keys.
    pub fn attainable_with(&self, io: IoCapability) -> bool {
        if self.authentication && io == IoCapability::NoInputNoOutput {
            return false;
        }
        true
    }
}

/// The authentication-requirements byte advertised for a local IO
/// capability: MITM protection is requested whenever the capability can
/// support it, always with general bonding.
pub fn auth_requirements_for(io: IoCapability) -> AuthRequirements {
    match io {
        IoCapability::NoInputNoOutput => AuthRequirements::GeneralBonding,
        _ => AuthRequirements::MitmGeneralBonding,
    }
}

/// Where an in-flight pairing procedure stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PairingPhase {
    /// Authentication Requested issued (initiator) or peer events
    /// observed (responder); key exchange not yet complete.
    Started,
    /// Link key delivered; waiting for Authentication Complete
    /// (initiator only).
    WaitingAuthComplete,
    /// Set Connection Encryption issued or peer encryption expected.
    WaitingEncryption,
}

/// Callback fired when a pairing procedure reaches a terminal state.
pub type PairingCallback = Box<dyn FnOnce(Result<()>) + 'static>;

/// Per-connection pairing procedure state.
pub(crate) struct PairingState {
    pub initiator: bool,
    pub phase: PairingPhase,
    /// The strongest requirements among the callers driving this round.
    pub requirements: SecurityRequirements,
    /// Callers whose callbacks fire on the terminal state.
    pub waiters: Vec<PairingCallback>,
    /// The local IO capability advertised for this round, recorded when
    /// the IO Capability Request is answered.
    pub local_io: Option<crate::hci::constants::IoCapability>,
}

impl PairingState {
    pub fn initiator(requirements: SecurityRequirements) -> PairingState {
        PairingState {
            initiator: true,
            phase: PairingPhase::Started,
            requirements,
            waiters: Vec::new(),
            local_io: None,
        }
    }

    pub fn responder() -> PairingState {
        PairingState {
            initiator: false,
            phase: PairingPhase::Started,
            requirements: SecurityRequirements::default(),
            waiters: Vec::new(),
            local_io: None,
        }
    }

    /// Folds another caller's requirements into this round.
    pub fn merge_requirements(&mut self, requirements: SecurityRequirements) {
        self.requirements.authentication |= requirements.authentication;
        self.requirements.secure_connections |= requirements.secure_connections;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::constants::LinkKeyType;

    fn key(key_type: LinkKeyType) -> BrEdrLinkKey {
        BrEdrLinkKey::new([0; 16], key_type, 16)
    }

    #[test]
    fn requirements_satisfied_by_key_classes() {
        let none = SecurityRequirements::default();
        let auth = SecurityRequirements { authentication: true, secure_connections: false };
        let sc = SecurityRequirements { authentication: true, secure_connections: true };

        let unauthenticated = key(LinkKeyType::UnauthenticatedCombination192);
        let authenticated = key(LinkKeyType::AuthenticatedCombination192);
        let authenticated_sc = key(LinkKeyType::AuthenticatedCombination256);

        assert!(none.satisfied_by(&unauthenticated));
        assert!(!auth.satisfied_by(&unauthenticated));
        assert!(auth.satisfied_by(&authenticated));
        assert!(!sc.satisfied_by(&authenticated));
        assert!(sc.satisfied_by(&authenticated_sc));
    }

    #[test]
    fn no_io_cannot_attain_authenticated_key() {
        let auth = SecurityRequirements { authentication: true, secure_connections: false };
        assert!(!auth.attainable_with(IoCapability::NoInputNoOutput));
        assert!(auth.attainable_with(IoCapability::DisplayYesNo));
        assert!(auth.attainable_with(IoCapability::KeyboardOnly));
        let none = SecurityRequirements::default();
        assert!(none.attainable_with(IoCapability::NoInputNoOutput));
    }

    #[test]
    fn auth_requirements_request_mitm_when_possible() {
        assert_eq!(
            auth_requirements_for(IoCapability::NoInputNoOutput),
            AuthRequirements::GeneralBonding
        );
        assert_eq!(
            auth_requirements_for(IoCapability::DisplayYesNo),
            AuthRequirements::MitmGeneralBonding
        );
        assert_eq!(
            auth_requirements_for(IoCapability::DisplayOnly),
            AuthRequirements::MitmGeneralBonding
        );
    }

    #[test]
    fn merged_requirements_take_the_stronger_of_each() {
        let mut state = PairingState::initiator(SecurityRequirements {
            authentication: true,
            secure_connections: false,
        });
        state.merge_requirements(SecurityRequirements {
            authentication: false,
            secure_connections: true,
        });
        assert!(state.requirements.authentication);
        assert!(state.requirements.secure_connections);
    }
}
