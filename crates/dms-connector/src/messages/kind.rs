//! Command kinds and their wire names.

use std::fmt;

/// The command kinds of the DMS JSON Data Exchange protocol.
///
/// The wire name is the key under which a list of commands (outbound) or a
/// list of responses (inbound) is carried in a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Get,
    Set,
    Rename,
    Delete,
    Subscribe,
    Unsubscribe,
    ChangelogGetGroups,
    ChangelogRead,
}

impl CommandKind {
    /// Every kind, in the order the DMS documents them.
    pub const ALL: [CommandKind; 8] = [
        CommandKind::Get,
        CommandKind::Set,
        CommandKind::Rename,
        CommandKind::Delete,
        CommandKind::Subscribe,
        CommandKind::Unsubscribe,
        CommandKind::ChangelogGetGroups,
        CommandKind::ChangelogRead,
    ];

    /// The key used for this kind on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Rename => "rename",
            Self::Delete => "delete",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::ChangelogGetGroups => "changelogGetGroups",
            Self::ChangelogRead => "changelogRead",
        }
    }

    /// Look up a kind by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }

    /// Whether each command of this kind carries its own `tag` field.
    ///
    /// `changelogGetGroups` is tagless; its tags travel in a frame-level
    /// list keyed by the kind name.
    pub fn has_command_tag(self) -> bool {
        !matches!(self, Self::ChangelogGetGroups)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
