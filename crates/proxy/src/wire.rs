//! Fixed-layout wire records and the byte-level helpers the command
//! handlers use to patch identity fields in place.
//!
//! Multi-byte fields in these records are little-endian regardless of the
//! header endianness of the generation that carries them, with the single
//! exception of the code-execution footer, which follows the header
//! endianness. Addresses travel in network byte order as raw 4-byte arrays.

use std::io::Cursor;

use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt, Endian};
use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ProxyError, Result};

/// Sentinel marking a client-config blob as written by this proxy.
pub const CLIENT_CONFIG_MAGIC: u64 = 0x8B5D_1F40_9E2C_A773;

/// Size of the Bb cipher seeds carried in the 0x03 server-init.
pub const BB_SEED_SIZE: usize = 0x30;

/// The first 8 on-wire bytes of every Bb client's login frame: the sentinel
/// the inbound key detector matches against.
pub const BB_FIRST_FRAME: [u8; 8] = [0xB4, 0x00, 0x93, 0x00, 0x00, 0x00, 0x00, 0x00];

pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xCBF2_9CE4_8422_2325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}

/// Text out of a NUL-padded fixed array.
pub fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// NUL-padded copy of `s` into a fixed array, truncating if needed.
pub fn put_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = s.len().min(N);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

pub fn read_u32_at(data: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&data[offset..offset + 4])
}

pub fn write_u32_at(data: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut data[offset..offset + 4], value);
}

fn need(data: &[u8], size: usize, what: &str) -> Result<()> {
    if data.len() < size {
        return Err(ProxyError::framing(format!(
            "{what}: {} bytes, need {size}",
            data.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Server init

const V2_COPYRIGHT: &str = "DreamCast Lobby Server. Copyright SEGA Enterprises. 1999";
const PATCH_COPYRIGHT: &str = "Patch Server. Copyright SonicTeam, LTD. 2001";
const BB_COPYRIGHT: &str =
    "Phantasy Star Online Blue Burst Game Server. Copyright 1999-2004 SONICTEAM.";

/// 0x02/0x17 payload: 0x40 bytes of copyright, then the two seeds. Most
/// servers append a message after the seeds; it is ignored.
pub fn build_server_init_v2(patch: bool, server_seed: u32, client_seed: u32) -> Vec<u8> {
    let mut out = vec![0u8; 0x48];
    let text = if patch { PATCH_COPYRIGHT } else { V2_COPYRIGHT };
    out[..text.len().min(0x40)].copy_from_slice(&text.as_bytes()[..text.len().min(0x40)]);
    write_u32_at(&mut out, 0x40, server_seed);
    write_u32_at(&mut out, 0x44, client_seed);
    out
}

pub fn parse_server_init_v2(payload: &[u8]) -> Result<(u32, u32)> {
    need(payload, 0x48, "server init")?;
    Ok((read_u32_at(payload, 0x40), read_u32_at(payload, 0x44)))
}

/// 0x03 payload: 0x60 bytes of copyright, then two 0x30-byte seeds.
pub fn build_server_init_bb(server_seed: &[u8], client_seed: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 0xC0];
    out[..BB_COPYRIGHT.len()].copy_from_slice(BB_COPYRIGHT.as_bytes());
    out[0x60..0x90].copy_from_slice(server_seed);
    out[0x90..0xC0].copy_from_slice(client_seed);
    out
}

pub fn parse_server_init_bb(payload: &[u8]) -> Result<([u8; BB_SEED_SIZE], [u8; BB_SEED_SIZE])> {
    need(payload, 0xC0, "bb server init")?;
    let mut server = [0u8; BB_SEED_SIZE];
    let mut client = [0u8; BB_SEED_SIZE];
    server.copy_from_slice(&payload[0x60..0x90]);
    client.copy_from_slice(&payload[0x90..0xC0]);
    Ok((server, client))
}

// ---------------------------------------------------------------------------
// Client config

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigFlags: u32 {
        const SAVE_ENABLED = 0x0000_0001;
        const NO_MESSAGE_BOX_CLOSE_CONFIRMATION = 0x0000_0002;
        const NO_MESSAGE_BOX_CLOSE_CONFIRMATION_AFTER_LOBBY_JOIN = 0x0000_0004;
    }
}

/// The 0x20-byte config record the server round-trips through the client in
/// 0x04 frames. When the magic matches, the destination fields tell the
/// proxy where the client was originally headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub magic: u64,
    pub flags: ConfigFlags,
    pub destination_address: [u8; 4],
    pub destination_port: u16,
}

pub const CLIENT_CONFIG_SIZE: usize = 0x20;

impl ClientConfig {
    pub fn new(destination_address: [u8; 4], destination_port: u16) -> Self {
        Self {
            magic: CLIENT_CONFIG_MAGIC,
            flags: ConfigFlags::default(),
            destination_address,
            destination_port,
        }
    }

    pub fn to_bytes(self) -> [u8; CLIENT_CONFIG_SIZE] {
        let mut out = [0u8; CLIENT_CONFIG_SIZE];
        LittleEndian::write_u64(&mut out[0..8], self.magic);
        LittleEndian::write_u32(&mut out[8..12], self.flags.bits());
        out[12..16].copy_from_slice(&self.destination_address);
        LittleEndian::write_u16(&mut out[16..18], self.destination_port);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, CLIENT_CONFIG_SIZE, "client config")?;
        let mut address = [0u8; 4];
        address.copy_from_slice(&data[12..16]);
        Ok(Self {
            magic: LittleEndian::read_u64(&data[0..8]),
            flags: ConfigFlags::from_bits_truncate(LittleEndian::read_u32(&data[8..12])),
            destination_address: address,
            destination_port: LittleEndian::read_u16(&data[16..18]),
        })
    }

    pub fn is_ours(&self) -> bool {
        self.magic == CLIENT_CONFIG_MAGIC
    }
}

// ---------------------------------------------------------------------------
// Logins

/// 0x9D login payload (Dc/Pc). The trailing unused space is optional on the
/// wire; the truncated form ends right after the character name.
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct LoginV2 {
    pub player_tag: u32,
    pub guild_card_number: u32,
    pub unused: u64,
    pub sub_version: u32,
    pub unused2: [u8; 4],
    pub serial_number: [u8; 0x10],
    pub access_key: [u8; 0x10],
    pub serial_number2: [u8; 0x10],
    pub access_key2: [u8; 0x10],
    pub name: [u8; 0x10],
}

pub const LOGIN_V2_SIZE: usize = 0x68;
pub const LOGIN_V2_PADDED_SIZE: usize = 0xCC;

/// 0x9E login payload (Gc): the 0x9D shape plus the client-config blob.
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct LoginConsole {
    pub base: LoginV2,
    pub client_config: [u8; CLIENT_CONFIG_SIZE],
}

pub const LOGIN_CONSOLE_SIZE: usize = 0x88;
pub const LOGIN_CONSOLE_PADDED_SIZE: usize = 0xEC;

/// 0xDB license verification payload (Gc).
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct VerifyLicense {
    pub serial_number: [u8; 0x10],
    pub access_key: [u8; 0x10],
    pub sub_version: u32,
    pub serial_number2: [u8; 0x10],
    pub access_key2: [u8; 0x10],
    pub password: [u8; 0x10],
}

/// Offsets inside the 0x93 Bb login payload.
pub const LOGIN_BB_USERNAME_OFFSET: usize = 0x14;
pub const LOGIN_BB_PASSWORD_OFFSET: usize = 0x24;
pub const LOGIN_BB_MIN_SIZE: usize = 0x34;
/// The resume patch overwrites these payload bytes with the address CRC.
pub const LOGIN_BB_CRC_OFFSET: usize = 0x94;
pub const LOGIN_BB_CRC_PATCH_MIN_SIZE: usize = 0x98;

pub fn parse_login_bb(payload: &[u8]) -> Result<(String, String)> {
    need(payload, LOGIN_BB_MIN_SIZE, "bb login")?;
    Ok((
        cstr(&payload[LOGIN_BB_USERNAME_OFFSET..LOGIN_BB_USERNAME_OFFSET + 0x10]),
        cstr(&payload[LOGIN_BB_PASSWORD_OFFSET..LOGIN_BB_PASSWORD_OFFSET + 0x10]),
    ))
}

// ---------------------------------------------------------------------------
// Reconnect

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct Reconnect {
    pub address: [u8; 4],
    pub port: u16,
    pub unused: u16,
}

pub const RECONNECT_SIZE: usize = 8;

impl Reconnect {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        need(payload, RECONNECT_SIZE, "reconnect")?;
        Ok(Cursor::new(payload)
            .read_le()
            .map_err(|e| ProxyError::framing(e.to_string()))?)
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let mut cur = Cursor::new(Vec::new());
        cur.write_le(&self).expect("infallible write");
        cur.into_inner()
    }
}

// ---------------------------------------------------------------------------
// File streams

#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct OpenFile {
    pub name: [u8; 0x20],
    pub unused: u16,
    pub flags: u16,
    pub filename: [u8; 0x10],
    pub file_size: u32,
}

#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct WriteFile {
    pub filename: [u8; 0x10],
    #[br(count = 0x400)]
    pub data: Vec<u8>,
    pub data_size: u32,
}

pub const FILE_CHUNK_MAX: usize = 0x400;

// ---------------------------------------------------------------------------
// Code execution

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct ExecuteCodeHeader {
    pub code_size: u32,
    pub checksum_start: u32,
    pub checksum_size: u32,
}

pub const EXECUTE_CODE_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct ExecuteCodeFooter {
    pub relocations_offset: u32,
    pub num_relocations: u32,
    pub unused: [u32; 2],
    pub entrypoint_addr_offset: u32,
}

pub const EXECUTE_CODE_FOOTER_SIZE: usize = 0x14;

impl ExecuteCodeHeader {
    pub fn parse(payload: &[u8], endian: Endian) -> Result<Self> {
        need(payload, EXECUTE_CODE_HEADER_SIZE, "code header")?;
        ExecuteCodeHeader::read_options(&mut Cursor::new(payload), endian, ())
            .map_err(|e| ProxyError::framing(e.to_string()))
    }
}

impl ExecuteCodeFooter {
    pub fn parse_at(code: &[u8], offset: usize, endian: Endian) -> Result<Self> {
        need(code, offset + EXECUTE_CODE_FOOTER_SIZE, "code footer")?;
        ExecuteCodeFooter::read_options(&mut Cursor::new(&code[offset..]), endian, ())
            .map_err(|e| ProxyError::framing(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct ExecuteCodeResult {
    pub return_value: u32,
    pub checksum: u32,
}

// ---------------------------------------------------------------------------
// Lobby membership

/// Common prefix of the 0x65/0x67/0x68 lobby-join payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct JoinLobbyHeader {
    pub client_id: u8,
    pub leader_id: u8,
    pub disable_udp: u8,
    pub lobby_number: u8,
    pub block_number: u16,
    pub event: u16,
    pub unused: u32,
}

pub const JOIN_LOBBY_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct LobbyData {
    pub player_tag: u32,
    pub guild_card_number: u32,
    pub client_id: u16,
    pub unused: u16,
}

pub const LOBBY_DATA_SIZE: usize = 12;

/// One roster entry in a lobby join: membership record, display name, then
/// an opaque appearance blob the proxy never touches.
pub const JOIN_LOBBY_ENTRY_SIZE: usize = LOBBY_DATA_SIZE + 0x10 + 0x34;
pub const JOIN_LOBBY_ENTRY_NAME_OFFSET: usize = LOBBY_DATA_SIZE;

/// 0x64 game-join payload geometry: four membership records, then the game
/// setup byte block, then (newer sub-versions only) four appearance blocks
/// whose first 0x10 bytes are the display name.
pub const JOIN_GAME_LOBBY_DATA_OFFSET: usize = 0;
pub const JOIN_GAME_CLIENT_ID_OFFSET: usize = 0x30;
pub const JOIN_GAME_LEADER_ID_OFFSET: usize = 0x31;
pub const JOIN_GAME_DIFFICULTY_OFFSET: usize = 0x33;
pub const JOIN_GAME_EVENT_OFFSET: usize = 0x35;
pub const JOIN_GAME_SECTION_ID_OFFSET: usize = 0x36;
pub const JOIN_GAME_BASE_SIZE: usize = 0x3C;
pub const JOIN_GAME_PLAYER_SIZE: usize = 0x30;
pub const JOIN_GAME_FULL_SIZE: usize = JOIN_GAME_BASE_SIZE + 4 * JOIN_GAME_PLAYER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct LeaveLobby {
    pub client_id: u8,
    pub leader_id: u8,
    pub unused: u16,
}

// ---------------------------------------------------------------------------
// Identity-bearing offsets patched in place

/// 0x04 client-config update: guild-card number offset in the payload.
pub const UPDATE_CONFIG_GUILD_CARD_OFFSET: usize = 4;
pub const UPDATE_CONFIG_CFG_OFFSET: usize = 8;
/// 0x06/0x11 text header: guild-card number offset.
pub const TEXT_GUILD_CARD_OFFSET: usize = 4;
pub const TEXT_BODY_OFFSET: usize = 8;
/// 0x40 search: searcher and target offsets.
pub const SEARCH_SEARCHER_OFFSET: usize = 4;
pub const SEARCH_TARGET_OFFSET: usize = 8;
/// 0x41 search result: searcher and result offsets.
pub const RESULT_SEARCHER_OFFSET: usize = 4;
pub const RESULT_RESULT_OFFSET: usize = 8;
/// 0x81 simple mail: sender and recipient offsets, then the text buffer.
pub const MAIL_FROM_OFFSET: usize = 4;
pub const MAIL_FROM_NAME_OFFSET: usize = 8;
pub const MAIL_TO_OFFSET: usize = 0x18;
pub const MAIL_TEXT_OFFSET: usize = 0x1C;
/// 0x88 arrow update: 12-byte entries, guild card at +4.
pub const ARROW_ENTRY_SIZE: usize = 12;
pub const ARROW_GUILD_CARD_OFFSET: usize = 4;
/// 0xC4 choice search result: 0x68-byte entries, guild card at +0.
pub const CHOICE_ENTRY_SIZE: usize = 0x68;
/// 0xE4 card lobby: four 0x18-byte entries, guild card at +4.
pub const CARD_LOBBY_ENTRY_SIZE: usize = 0x18;
pub const CARD_LOBBY_GUILD_CARD_OFFSET: usize = 4;
