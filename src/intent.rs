//! Gateway intents, a bitmask selecting which dispatch groups the remote sends.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Intent bitmask sent in identify payload
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Intents: u64 {
        /// guild create/update/delete, role and channel events
        const GUILDS = 1 << 0;
        /// member add/update/remove (privileged)
        const GUILD_MEMBERS = 1 << 1;
        /// ban add/remove
        const GUILD_BANS = 1 << 2;
        /// emoji updates
        const GUILD_EMOJIS = 1 << 3;
        /// integration updates
        const GUILD_INTEGRATIONS = 1 << 4;
        /// webhook updates
        const GUILD_WEBHOOKS = 1 << 5;
        /// invite create/delete
        const GUILD_INVITES = 1 << 6;
        /// voice state updates
        const GUILD_VOICE_STATES = 1 << 7;
        /// presence updates (privileged)
        const GUILD_PRESENCES = 1 << 8;
        /// guild message create/update/delete
        const GUILD_MESSAGES = 1 << 9;
        /// guild reaction events
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        /// guild typing start
        const GUILD_MESSAGE_TYPING = 1 << 11;
        /// direct message create/update/delete
        const DIRECT_MESSAGES = 1 << 12;
        /// direct message reaction events
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        /// direct message typing start
        const DIRECT_MESSAGE_TYPING = 1 << 14;
    }
}

impl Intents {
    /// Intents that need to be explicitly enabled for the application.
    pub fn privileged() -> Self {
        Self::GUILD_MEMBERS | Self::GUILD_PRESENCES
    }

    /// All intents except the privileged ones.
    pub fn unprivileged() -> Self {
        Self::all() - Self::privileged()
    }
}

impl Serialize for Intents {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // unknown bits are kept, the remote may know intents we don't
        Ok(Self::from_bits_retain(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_intents_raw_value() {
        let intents = Intents::GUILDS | Intents::GUILD_MESSAGES | Intents::DIRECT_MESSAGES;
        assert_eq!(intents.bits(), 1 + 512 + 4096);
        assert_eq!(serde_json::to_string(&intents).unwrap(), "4609");
    }

    #[test]
    fn test_unprivileged_excludes_members_and_presences() {
        let intents = Intents::unprivileged();
        assert!(!intents.contains(Intents::GUILD_MEMBERS));
        assert!(!intents.contains(Intents::GUILD_PRESENCES));
        assert!(intents.contains(Intents::GUILD_MESSAGES));
        assert_eq!(intents.bits(), 0x7fff - 0x102);
    }

    #[test]
    fn test_intents_keep_unknown_bits() {
        let intents: Intents = serde_json::from_str("32769").unwrap();
        assert!(intents.contains(Intents::GUILDS));
        assert_eq!(intents.bits(), 32769);
    }
}
