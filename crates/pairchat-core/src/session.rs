//! Session state machine for the primary (random-match) conversation.

use std::fmt;

use serde::{Deserialize, Serialize};

use pairchat_shared::types::{PeerAddress, PresenceStatus, Profile};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The partner sent a disconnect frame.
    Explicit,
    /// The link dropped underneath us.
    Network,
    /// We ended the session.
    LocalNetwork,
    /// Reserved for idle-session expiry.
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum SessionState {
    Idle,
    /// Looking for a partner. Published as `waiting`.
    Searching,
    Connected,
    Disconnected(DisconnectReason),
    /// The local transport is unusable. Only `reset` leaves this state.
    Error,
}

impl SessionState {
    /// Status label to publish in the presence directory.
    pub fn presence_status(&self) -> PresenceStatus {
        match self {
            Self::Searching => PresenceStatus::Waiting,
            Self::Connected => PresenceStatus::Paired,
            Self::Error => PresenceStatus::Busy,
            Self::Idle | Self::Disconnected(_) => PresenceStatus::Idle,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Searching => f.write_str("searching"),
            Self::Connected => f.write_str("connected"),
            Self::Disconnected(reason) => write!(f, "disconnected ({reason:?})"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// The single primary session. Partner fields are set only while Connected.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    partner: Option<PeerAddress>,
    partner_profile: Option<Profile>,
    local_vanish: bool,
    remote_vanish: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            partner: None,
            partner_profile: None,
            local_vanish: false,
            remote_vanish: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_searching(&self) -> bool {
        self.state == SessionState::Searching
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn partner(&self) -> Option<&PeerAddress> {
        self.partner.as_ref()
    }

    pub fn partner_profile(&self) -> Option<&Profile> {
        self.partner_profile.as_ref()
    }

    pub fn set_partner_profile(&mut self, profile: Profile) {
        self.partner_profile = Some(profile);
    }

    pub fn local_vanish(&self) -> bool {
        self.local_vanish
    }

    pub fn remote_vanish(&self) -> bool {
        self.remote_vanish
    }

    pub fn set_local_vanish(&mut self, enabled: bool) {
        self.local_vanish = enabled;
    }

    pub fn set_remote_vanish(&mut self, enabled: bool) {
        self.remote_vanish = enabled;
    }

    /// Either side turned vanish mode on.
    pub fn vanish_active(&self) -> bool {
        self.local_vanish || self.remote_vanish
    }

    fn invalid(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// Idle or Disconnected → Searching.
    pub fn begin_search(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle | SessionState::Disconnected(_) => {
                self.state = SessionState::Searching;
                Ok(())
            }
            _ => Err(self.invalid("connect")),
        }
    }

    /// Searching → Connected.
    pub fn pair(&mut self, partner: PeerAddress) -> Result<()> {
        if self.state != SessionState::Searching {
            return Err(self.invalid("pair"));
        }
        self.state = SessionState::Connected;
        self.partner = Some(partner);
        Ok(())
    }

    /// Connected → Disconnected. Clears the partner and vanish flags.
    pub fn end(&mut self, reason: DisconnectReason) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(self.invalid("disconnect"));
        }
        self.state = SessionState::Disconnected(reason);
        self.clear_partner();
        Ok(())
    }

    /// Searching → Idle.
    pub fn cancel(&mut self) -> Result<()> {
        if self.state != SessionState::Searching {
            return Err(self.invalid("cancel"));
        }
        self.state = SessionState::Idle;
        self.clear_partner();
        Ok(())
    }

    /// Disconnected or Error → Idle.
    pub fn reset(&mut self) -> Result<()> {
        match self.state {
            SessionState::Disconnected(_) | SessionState::Error => {
                self.state = SessionState::Idle;
                Ok(())
            }
            _ => Err(self.invalid("reset")),
        }
    }

    /// Any state → Error.
    pub fn fail(&mut self) {
        self.state = SessionState::Error;
        self.clear_partner();
    }

    fn clear_partner(&mut self) {
        self.partner = None;
        self.partner_profile = None;
        self.local_vanish = false;
        self.remote_vanish = false;
    }
}
