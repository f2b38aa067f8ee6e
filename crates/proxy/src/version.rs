use serde::Deserialize;

/// The five wire-protocol generations the proxy can terminate. Each one has
/// its own header geometry, cipher family, and login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameVersion {
    Dc,
    Pc,
    Patch,
    Gc,
    Bb,
}

impl GameVersion {
    pub fn name(self) -> &'static str {
        match self {
            GameVersion::Dc => "dc",
            GameVersion::Pc => "pc",
            GameVersion::Patch => "patch",
            GameVersion::Gc => "gc",
            GameVersion::Bb => "bb",
        }
    }

    /// Bytes of header before the payload begins.
    pub fn header_size(self) -> usize {
        match self {
            GameVersion::Dc | GameVersion::Patch | GameVersion::Gc => 4,
            GameVersion::Pc | GameVersion::Bb => 8,
        }
    }

    /// Whole frames are zero-padded to this boundary before encryption.
    pub fn frame_alignment(self) -> usize {
        match self {
            GameVersion::Bb => 8,
            _ => 4,
        }
    }

    /// Multi-byte header fields are big-endian on the console generations
    /// that predate Bb.
    pub fn big_endian(self) -> bool {
        matches!(self, GameVersion::Dc | GameVersion::Gc)
    }

    /// Opcode of the server-init frame the proxy synthesizes on accept.
    pub fn server_init_opcode(self) -> u16 {
        match self {
            GameVersion::Bb => 0x03,
            _ => 0x02,
        }
    }

    /// Opcode of the login frame expected from an unlinked client.
    pub fn login_opcode(self) -> Option<u16> {
        match self {
            GameVersion::Dc | GameVersion::Pc => Some(0x9D),
            GameVersion::Gc => Some(0x9E),
            GameVersion::Bb => Some(0x93),
            // Patch clients are always direct-linked; they never log in to us.
            GameVersion::Patch => None,
        }
    }

    /// Reconnect opcode sent by the remote server in this generation.
    pub fn reconnect_opcode(self) -> u16 {
        match self {
            GameVersion::Patch => 0x14,
            _ => 0x19,
        }
    }

    /// Name of this generation's own login port in the port directory. Used
    /// when diverting a lobby/block change back to the proxy.
    pub fn login_port_name(self) -> &'static str {
        match self {
            GameVersion::Dc => "dc-login",
            GameVersion::Pc => "pc-login",
            GameVersion::Patch => "bb-patch",
            GameVersion::Gc => "gc-us3",
            GameVersion::Bb => "bb-login",
        }
    }
}

impl std::fmt::Display for GameVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
