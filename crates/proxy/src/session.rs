//! Session data model: the durable linked-session state that command
//! handlers mutate, the outbound queue protocol, and the effects handlers
//! hand back to the pumps.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;

use crate::cipher::detect::KeyDetector;
use crate::cipher::PacketCipher;
use crate::files::SavingFile;
use crate::frame::Frame;
use crate::services::License;
use crate::version::GameVersion;
use crate::wire::{ClientConfig, CLIENT_CONFIG_SIZE};

/// Both real sockets and in-process test transports flow through this.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type Transport = Box<dyn AsyncStream>;

/// Unlicensed session ids live in a reserved high range; the counter
/// restarts at the base when it wraps and is never zero.
pub const UNLICENSED_ID_BASE: u64 = 0xFF00_0000_0000_0001;

/// Idle windows after a disconnect before the session entry is destroyed.
pub const LICENSED_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const UNLICENSED_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub const LOBBY_ROSTER_SIZE: usize = 12;

/// One entry on a writer queue. `Arm` exists so that a frame that must go
/// out plaintext and the cipher that covers everything after it stay
/// ordered relative to each other.
pub enum Outbound {
    Frame(Frame),
    Arm(Box<dyn PacketCipher>),
}

/// What a command handler wants done, in order. No `Forward` in the list
/// means the inbound frame is dropped.
pub enum Action {
    /// Forward the (possibly mutated) inbound frame to the opposite end.
    Forward,
    SendToClient(Frame),
    SendToServer(Frame),
    ArmClientIn(Box<dyn PacketCipher>),
    ArmClientOut(Box<dyn PacketCipher>),
    ArmServerIn(Box<dyn PacketCipher>),
    ArmServerOut(Box<dyn PacketCipher>),
    /// Drop the server connection and dial `next_destination` again,
    /// without telling the client (patch-server redirects).
    ReconnectServer,
}

/// Feature toggles and overrides, read by handlers on every frame.
#[derive(Debug, Clone)]
pub struct SessionToggles {
    pub suppress_shell_commands: bool,
    pub enable_chat_filter: bool,
    pub enable_switch_assist: bool,
    pub infinite_hp: bool,
    pub infinite_tp: bool,
    pub save_files: bool,
    /// Negative means off; otherwise 0xB2 frames are answered locally with
    /// this value and never reach the client.
    pub function_call_return_value: i64,
    pub override_section_id: i32,
    pub override_lobby_event: i32,
    pub override_lobby_number: i32,
}

impl Default for SessionToggles {
    fn default() -> Self {
        Self {
            suppress_shell_commands: true,
            enable_chat_filter: true,
            enable_switch_assist: false,
            infinite_hp: false,
            infinite_tp: false,
            save_files: false,
            function_call_return_value: -1,
            override_section_id: -1,
            override_lobby_event: -1,
            override_lobby_number: -1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LobbyPlayer {
    pub guild_card_number: u32,
    pub name: String,
}

/// Everything a linked session knows. Mutated only under the session mutex,
/// one inbound frame at a time.
pub struct SessionState {
    pub version: GameVersion,
    pub local_port: u16,
    pub license: Option<Arc<License>>,
    pub sub_version: u32,
    pub character_name: String,

    /// Identity the remote server assigned; the client never sees it.
    pub remote_guild_card_number: u32,
    /// Snapshot of the last 0x04 config bytes the remote sent.
    pub remote_client_config_data: [u8; CLIENT_CONFIG_SIZE],
    /// This proxy's own config for the client, restored on lobby divert.
    pub config: ClientConfig,

    /// Bb only: the raw 0x93 payload, replayed on resume.
    pub login_blob: Vec<u8>,
    pub remote_ip_crc: u32,
    pub enable_remote_ip_crc_patch: bool,

    pub next_destination: Option<SocketAddrV4>,
    pub client_connected: bool,
    pub server_connected: bool,
    /// None while the client rides a virtual connection.
    pub client_local_addr: Option<SocketAddrV4>,

    pub lobby_players: Vec<LobbyPlayer>,
    pub lobby_client_id: u8,

    pub toggles: SessionToggles,
    /// Cached switch-activation subcommand payload for assist replay.
    pub last_switch_command: Option<Vec<u8>>,
    /// Sliding window over the server stream: the last 8 payload bytes seen,
    /// used to complete under-sized reconnect commands.
    pub prev_server_frame_tail: [u8; 8],

    pub saving_files: HashMap<String, SavingFile>,
    pub save_dir: PathBuf,

    pub detector: Option<Arc<KeyDetector>>,
}

impl SessionState {
    pub fn new(version: GameVersion, local_port: u16, save_dir: PathBuf) -> Self {
        Self {
            version,
            local_port,
            license: None,
            sub_version: 0,
            character_name: String::new(),
            remote_guild_card_number: 0,
            remote_client_config_data: [0; CLIENT_CONFIG_SIZE],
            config: ClientConfig::new([0; 4], 0),
            login_blob: Vec::new(),
            remote_ip_crc: 0,
            enable_remote_ip_crc_patch: false,
            next_destination: None,
            client_connected: false,
            server_connected: false,
            client_local_addr: None,
            lobby_players: vec![LobbyPlayer::default(); LOBBY_ROSTER_SIZE],
            lobby_client_id: 0,
            toggles: SessionToggles::default(),
            last_switch_command: None,
            prev_server_frame_tail: [0; 8],
            saving_files: HashMap::new(),
            save_dir,
            detector: None,
        }
    }

    /// Slides the previous-frame window over one more server payload.
    pub fn note_server_payload(&mut self, payload: &[u8]) {
        if payload.len() >= 8 {
            self.prev_server_frame_tail
                .copy_from_slice(&payload[payload.len() - 8..]);
        } else if !payload.is_empty() {
            self.prev_server_frame_tail.rotate_left(payload.len());
            let start = 8 - payload.len();
            self.prev_server_frame_tail[start..].copy_from_slice(payload);
        }
    }

    pub fn clear_roster(&mut self) {
        self.lobby_players = vec![LobbyPlayer::default(); LOBBY_ROSTER_SIZE];
    }
}
