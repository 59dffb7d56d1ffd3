//! Inbound frame dispatch.
//!
//! Frames are interpreted according to the role of the connection they
//! arrived on. A frame that fails to decode its fields is returned as a
//! [`ProtocolError`] and dropped by the caller.

use tracing::{debug, trace, warn};

use pairchat_shared::error::ProtocolError;
use pairchat_shared::message::{Content, Message, Reaction, Sender};
use pairchat_shared::protocol::{Frame, FrameKind};
use pairchat_shared::types::{PeerAddress, Profile};

use crate::engine::Engine;
use crate::events::{ConversationKey, EngineEvent, Indicator};
use crate::session::DisconnectReason;

/// The connection a frame arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Link {
    Primary,
    Secondary(PeerAddress),
}

impl Link {
    fn conversation(&self) -> ConversationKey {
        match self {
            Self::Primary => ConversationKey::Primary,
            Self::Secondary(peer) => ConversationKey::Secondary(peer.clone()),
        }
    }
}

impl Engine {
    pub(crate) fn dispatch(&mut self, link: Link, frame: Frame) -> Result<(), ProtocolError> {
        let key = link.conversation();
        match frame.kind {
            FrameKind::Profile => self.on_profile(link, frame.payload_profile()?),
            FrameKind::Message => self.on_message(link, &frame)?,
            FrameKind::Typing => self.on_indicator(key, Indicator::Typing, frame.payload_bool()?),
            FrameKind::Recording => {
                self.on_indicator(key, Indicator::Recording, frame.payload_bool()?)
            }
            FrameKind::Reaction => self.on_reaction(key, frame.message_id()?, frame.payload_str()?),
            FrameKind::EditMessage => match link {
                Link::Primary => self.on_edit(frame.message_id()?, frame.payload_str()?),
                Link::Secondary(_) => debug!("Ignoring edit on a secondary link"),
            },
            FrameKind::VanishMode => match link {
                Link::Primary => self.on_remote_vanish(frame.payload_bool()?),
                Link::Secondary(_) => debug!("Ignoring vanish mode on a secondary link"),
            },
            FrameKind::FriendRequest => self.on_friend_request(link, frame.payload_profile()?)?,
            FrameKind::FriendAccept => self.on_friend_accept(link, frame.payload_profile()?)?,
            FrameKind::Seen => self.on_seen(key, frame.message_id()?),
            FrameKind::Disconnect => self.on_remote_disconnect(link),
            FrameKind::Unknown => trace!("Ignoring unknown frame type"),
        }
        Ok(())
    }

    fn link_peer(&self, link: &Link) -> Option<PeerAddress> {
        match link {
            Link::Primary => self.primary.as_ref().map(|l| l.peer.clone()),
            Link::Secondary(peer) => Some(peer.clone()),
        }
    }

    fn on_profile(&mut self, link: Link, profile: Profile) {
        match link {
            Link::Primary => {
                let Some(peer) = self.link_peer(&Link::Primary) else {
                    return;
                };
                let first = self.session.partner_profile().is_none();
                self.session.set_partner_profile(profile.clone());
                self.emit(EngineEvent::PartnerProfile(profile.clone()));
                if !first {
                    return;
                }

                let name = if profile.name.trim().is_empty() {
                    "a stranger".to_string()
                } else {
                    profile.name.clone()
                };
                let notice = Message::system(format!("You are now chatting with {name}"), self.now());
                if self.primary_conversation.insert(notice.clone()).is_ok() {
                    self.emit(EngineEvent::MessageReceived {
                        conversation: ConversationKey::Primary,
                        message: notice,
                        sender_profile: None,
                    });
                }

                let now = self.now();
                self.recent.record(peer, profile, now);
                let result = self.recent.save(self.store.as_mut());
                self.persist("recent peers", result);
            }
            Link::Secondary(peer) => {
                if let Some(link) = self.secondaries.get_mut(&peer) {
                    link.profile = Some(profile.clone());
                }
                debug!(peer = %peer.short(), name = %profile.name, "Secondary profile cached");
                self.emit(EngineEvent::SecondaryProfile { peer, profile });
            }
        }
    }

    fn on_message(&mut self, link: Link, frame: &Frame) -> Result<(), ProtocolError> {
        let id = frame.id.clone().ok_or(ProtocolError::MissingField("id"))?;
        let content = Content::from_data_type(frame.data_type.as_deref(), frame.payload_str()?.to_string());

        let mut message = Message::new(id.clone(), content, Sender::Stranger, self.now());
        message.reply_to = frame.reply_to.clone();
        message.is_vanish = frame.is_vanish.unwrap_or(false);
        if let Some(ms) = frame.expiry_duration {
            message = message.with_expiry(ms);
        }

        let key = link.conversation();
        if let Err(e) = self.insert_message(&key, message.clone()) {
            warn!(id = %id, error = %e, "Message dropped");
            return Ok(());
        }

        let sender_profile = match &link {
            Link::Primary => {
                if let Some(conn) = self.primary.as_ref().map(|l| l.conn) {
                    if let Err(e) = self.transport.send(conn, &Frame::seen(&id)) {
                        debug!(error = %e, "Could not send read receipt");
                    }
                }
                None
            }
            Link::Secondary(peer) => self.secondaries.get(peer).and_then(|l| l.profile.clone()),
        };
        self.emit(EngineEvent::MessageReceived {
            conversation: key,
            message,
            sender_profile,
        });
        Ok(())
    }

    fn on_indicator(&mut self, key: ConversationKey, indicator: Indicator, active: bool) {
        if self.conversation_mut(&key).set_indicator(indicator, active) {
            self.emit(EngineEvent::IndicatorChanged {
                conversation: key,
                indicator,
                active,
            });
        }
    }

    fn on_reaction(&mut self, key: ConversationKey, message_id: &str, emoji: &str) {
        let reaction = Reaction {
            emoji: emoji.to_string(),
            sender: Sender::Stranger,
        };
        match self.conversation_mut(&key).react(message_id, reaction).cloned() {
            Some(message) => self.emit(EngineEvent::MessageUpdated {
                conversation: key,
                message,
            }),
            None => debug!(id = %message_id, "Reaction to unknown message ignored"),
        }
    }

    fn on_edit(&mut self, message_id: &str, text: &str) {
        match self.primary_conversation.edit(message_id, Sender::Stranger, text).cloned() {
            Some(message) => self.emit(EngineEvent::MessageUpdated {
                conversation: ConversationKey::Primary,
                message,
            }),
            None => debug!(id = %message_id, "Edit of unknown or foreign message ignored"),
        }
    }

    fn on_remote_vanish(&mut self, enabled: bool) {
        self.session.set_remote_vanish(enabled);
        let (local, remote) = (self.session.local_vanish(), self.session.remote_vanish());
        self.emit(EngineEvent::VanishModeChanged { local, remote });
    }

    fn on_friend_request(&mut self, link: Link, profile: Profile) -> Result<(), ProtocolError> {
        let Some(peer) = self.link_peer(&link) else {
            return Ok(());
        };
        let now = self.now();
        if let Some(request) = self.friends.receive_request(peer, profile, now)? {
            debug!(key = %request.key, "Friend request received");
            self.emit(EngineEvent::FriendRequestReceived(request));
        }
        let result = self.friends.save(self.store.as_mut());
        self.persist("friend requests", result);
        Ok(())
    }

    fn on_friend_accept(&mut self, link: Link, profile: Profile) -> Result<(), ProtocolError> {
        if profile.name.trim().is_empty() {
            return Err(ProtocolError::EmptyProfileName);
        }
        let Some(peer) = self.link_peer(&link) else {
            return Ok(());
        };
        let now = self.now();
        if let Some(friend) = self.friends.add(peer, profile, now) {
            debug!(key = %friend.key, "Friend request accepted");
            self.emit(EngineEvent::FriendAccepted(friend));
        }
        let result = self.friends.save(self.store.as_mut());
        self.persist("friends", result);
        Ok(())
    }

    fn on_seen(&mut self, key: ConversationKey, message_id: &str) {
        if let Some(message) = self.conversation_mut(&key).mark_seen(message_id).cloned() {
            self.emit(EngineEvent::MessageUpdated {
                conversation: key,
                message,
            });
        }
    }

    fn on_remote_disconnect(&mut self, link: Link) {
        match link {
            Link::Primary => {
                debug!("Partner ended the session");
                self.close_primary(DisconnectReason::Explicit);
            }
            Link::Secondary(peer) => {
                debug!(peer = %peer.short(), "Peer closed the secondary link");
                self.close_secondary_link(&peer);
            }
        }
    }
}
