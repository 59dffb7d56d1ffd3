use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{PeerAddress, Profile};

/// A participant's identity: a durable client id that survives restarts,
/// the per-run transport address, and the self-asserted profile.
/// Nothing here is verified. Identities are taken at face value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub client_id: String,
    pub address: PeerAddress,
    pub profile: Profile,
}

impl Identity {
    /// Build an identity, stamping the durable id into the profile's stable id.
    pub fn new(client_id: impl Into<String>, address: PeerAddress, mut profile: Profile) -> Self {
        let client_id = client_id.into();
        if profile.stable_id.is_none() {
            profile.stable_id = Some(client_id.clone());
        }
        Self {
            client_id,
            address,
            profile,
        }
    }

    /// Generate a fresh durable client id.
    pub fn generate_client_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Generate a random per-run transport address.
    pub fn generate_address() -> PeerAddress {
        PeerAddress(Uuid::new_v4().simple().to_string())
    }
}
