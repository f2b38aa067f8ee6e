//! Per-opcode command interception. Two 256-entry tables per generation,
//! one for each direction; the default entry forwards the frame unchanged.
//! Handlers run under the session mutex, mutate the frame and session state,
//! and hand back an ordered action list for the pump to apply.

use std::net::Ipv4Addr;
use std::sync::OnceLock;

use binrw::Endian;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{info, warn};

use crate::cipher::console::ConsoleCipher;
use crate::cipher::detect::{DetectorCipher, ImitatorCipher, KeyDetector};
use crate::cipher::stream::StreamCipher;
use crate::cipher::PacketCipher;
use crate::error::{ProxyError, Result};
use crate::files::{sanitize_filename, save_dump, unix_ns, SavingFile};
use crate::frame::Frame;
use crate::services::Services;
use crate::session::{Action, SessionState};
use crate::subcommands::{
    build_stat_change, build_stat_change_burst, subcommand_is_implemented, StatChange,
    GUILD_CARD_NUMBER_OFFSET, SUB_CAST_TECHNIQUE, SUB_HIT_BY_MONSTER, SUB_HIT_BY_MONSTER_2,
    SUB_SEND_GUILD_CARD, SUB_SWITCH_CHANGED, SWITCH_ENABLED_OFFSET, SWITCH_ID_NONE,
    SWITCH_ID_OFFSET, SWITCH_PAYLOAD_SIZE,
};
use crate::version::GameVersion;
use crate::wire::{self, Reconnect};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Opaque mask applied to the address CRC during the Bb resume replay. Some
/// remote servers verify this as an anti-proxy measure.
const ADDRESS_CRC_MASK: u32 = 0x4DC8_BED2;

/// FNV-1a-64 fingerprint of the 0x2C-byte pre-init probe that marks servers
/// which verify the address CRC.
const CRC_PROBE_FINGERPRINT: u64 = 0x8AF8_3143_16A2_7994;
const CRC_PROBE_SIZE: usize = 0x2C;

pub type CmdHandler = fn(&Services, &mut SessionState, &mut Frame) -> Result<Vec<Action>>;

/// Runs the installed handler for one inbound frame and returns the actions
/// to apply, in order. No `Forward` action means the frame is dropped.
pub fn process_frame(
    services: &Services,
    st: &mut SessionState,
    from_server: bool,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    let handler = handler_for(st.version, from_server, (frame.opcode & 0xFF) as u8);
    handler(services, st, frame)
}

fn endian_of(version: GameVersion) -> Endian {
    if version.big_endian() {
        Endian::Big
    } else {
        Endian::Little
    }
}

/// Builds a 0x06/0x11-style text frame in the client's encoding.
fn text_frame(version: GameVersion, opcode: u16, message: &str) -> Frame {
    let mut payload = vec![0u8; wire::TEXT_BODY_OFFSET];
    match version {
        GameVersion::Pc | GameVersion::Bb => {
            for unit in message.encode_utf16() {
                payload.extend_from_slice(&unit.to_le_bytes());
            }
            payload.extend_from_slice(&[0, 0]);
        }
        _ => {
            payload.extend_from_slice(message.as_bytes());
            payload.push(0);
        }
    }
    while payload.len() % 4 != 0 {
        payload.push(0);
    }
    Frame::new(opcode, 0, payload)
}

fn require(payload: &[u8], size: usize, what: &str) -> Result<()> {
    if payload.len() < size {
        return Err(ProxyError::framing(format!(
            "{what}: {} bytes, need {size}",
            payload.len()
        )));
    }
    Ok(())
}

fn rewrite_if(payload: &mut [u8], offset: usize, from: u32, to: u32) {
    if wire::read_u32_at(payload, offset) == from {
        wire::write_u32_at(payload, offset, to);
    }
}

// ---------------------------------------------------------------------------
// Server -> client handlers

fn fwd(_sv: &Services, _st: &mut SessionState, _frame: &mut Frame) -> Result<Vec<Action>> {
    Ok(vec![Action::Forward])
}

/// 0x97: the remote is probing save-state behavior. Flag 0 makes the client
/// delete data, so always answer flag 1 locally and never forward.
fn srv_save_trap_97(_sv: &Services, st: &mut SessionState, _frame: &mut Frame) -> Result<Vec<Action>> {
    st.config.flags |= wire::ConfigFlags::SAVE_ENABLED;
    Ok(vec![Action::SendToClient(Frame::new(0x97, 0x01, vec![]))])
}

fn make_v2_cipher(version: GameVersion, seed: u32) -> Box<dyn PacketCipher> {
    match version {
        GameVersion::Gc => Box::new(ConsoleCipher::new(seed)),
        _ => Box::new(StreamCipher::new(seed)),
    }
}

fn build_login_v2(st: &SessionState) -> wire::LoginV2 {
    let license = st.license.as_ref().expect("licensed session");
    let serial = wire::put_str(&format!("{:08X}", license.serial_number));
    let access = wire::put_str(&license.access_key);
    let (player_tag, guild_card_number) = if st.remote_guild_card_number == 0 {
        (0xFFFF_0000, 0xFFFF_FFFF)
    } else {
        (0x0001_0000, st.remote_guild_card_number)
    };
    wire::LoginV2 {
        player_tag,
        guild_card_number,
        unused: 0xFFFF_FFFF_FFFF_0000,
        sub_version: st.sub_version,
        unused2: [0, 1, 0, 0],
        serial_number: serial,
        access_key: access,
        serial_number2: serial,
        access_key2: access,
        name: wire::put_str(&st.character_name),
    }
}

fn encode_le<T>(value: &T) -> Vec<u8>
where
    T: for<'a> binrw::BinWrite<Args<'a> = ()>,
{
    let mut cur = std::io::Cursor::new(Vec::new());
    binrw::BinWrite::write_options(value, &mut cur, Endian::Little, ()).expect("infallible write");
    cur.into_inner()
}

/// Synthesizes the console 0x9E login toward the server on the client's
/// behalf. With a known remote guild card the short record is enough;
/// otherwise the full padded record is sent.
fn console_relogin(st: &SessionState) -> Frame {
    let login = wire::LoginConsole {
        base: build_login_v2(st),
        client_config: st.remote_client_config_data,
    };
    let mut payload = encode_le(&login);
    if st.remote_guild_card_number == 0 {
        payload.resize(wire::LOGIN_CONSOLE_PADDED_SIZE, 0);
    }
    Frame::new(0x9E, 0x01, payload)
}

/// 0x9A: the remote wants the console client to log in again.
fn srv_relogin_prompt_9a(
    _sv: &Services,
    st: &mut SessionState,
    _frame: &mut Frame,
) -> Result<Vec<Action>> {
    if st.license.is_none() {
        return Ok(vec![Action::Forward]);
    }
    Ok(vec![Action::SendToServer(console_relogin(st))])
}

/// 0x02/0x17 server-init from the remote. Passthrough sessions forward the
/// plaintext frame and mirror the seeds on both sides; licensed sessions
/// keep the frame and impersonate the client toward the server.
fn srv_server_init_02_17(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if st.version == GameVersion::Patch && frame.opcode == 0x17 {
        return Err(ProxyError::HandshakeUnexpected {
            opcode: frame.opcode,
            state: "patch handshake",
        });
    }
    let (server_seed, client_seed) = wire::parse_server_init_v2(&frame.payload)?;

    if st.license.is_none() {
        // The frame must reach the client before its ciphers arm; queue
        // order takes care of that.
        return Ok(vec![
            Action::Forward,
            Action::ArmServerIn(make_v2_cipher(st.version, server_seed)),
            Action::ArmServerOut(make_v2_cipher(st.version, client_seed)),
            Action::ArmClientIn(make_v2_cipher(st.version, client_seed)),
            Action::ArmClientOut(make_v2_cipher(st.version, server_seed)),
        ]);
    }

    let mut actions = vec![
        Action::ArmServerIn(make_v2_cipher(st.version, server_seed)),
        Action::ArmServerOut(make_v2_cipher(st.version, client_seed)),
    ];
    match st.version {
        GameVersion::Patch => actions.push(Action::SendToServer(Frame::new(0x02, 0, vec![]))),
        GameVersion::Dc | GameVersion::Pc => {
            let payload = encode_le(&build_login_v2(st));
            actions.push(Action::SendToServer(Frame::new(0x9D, 0, payload)));
        }
        GameVersion::Gc => {
            if frame.opcode == 0x17 {
                let license = st.license.as_ref().expect("licensed session");
                let serial = wire::put_str(&format!("{:08X}", license.serial_number));
                let access = wire::put_str(&license.access_key);
                let cmd = wire::VerifyLicense {
                    serial_number: serial,
                    access_key: access,
                    sub_version: st.sub_version,
                    serial_number2: serial,
                    access_key2: access,
                    password: wire::put_str(&license.password),
                };
                actions.push(Action::SendToServer(Frame::new(0xDB, 0, encode_le(&cmd))));
            } else {
                actions.push(Action::SendToServer(console_relogin(st)));
            }
        }
        GameVersion::Bb => {
            return Err(ProxyError::HandshakeUnexpected {
                opcode: frame.opcode,
                state: "bb link",
            })
        }
    }
    Ok(actions)
}

/// Bb 0x03 server-init. Fresh links forward the plaintext frame and stand
/// up the detector; resumed links already spoke to the client, so only the
/// server-facing imitators are armed and the saved login is replayed.
fn srv_server_init_bb_03(
    sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    let (server_seed, client_seed) = wire::parse_server_init_bb(&frame.payload)?;

    if let Some(detector) = st.detector.clone() {
        if st.login_blob.is_empty() {
            return Err(ProxyError::HandshakeUnexpected {
                opcode: frame.opcode,
                state: "resumed bb link without saved login",
            });
        }
        if st.enable_remote_ip_crc_patch
            && st.login_blob.len() >= wire::LOGIN_BB_CRC_PATCH_MIN_SIZE
        {
            let patched = st.remote_ip_crc ^ ADDRESS_CRC_MASK;
            st.login_blob[wire::LOGIN_BB_CRC_OFFSET..wire::LOGIN_BB_CRC_OFFSET + 4]
                .copy_from_slice(&patched.to_le_bytes());
        }
        return Ok(vec![
            Action::ArmServerIn(Box::new(ImitatorCipher::new(detector.clone(), &server_seed))),
            Action::ArmServerOut(Box::new(ImitatorCipher::new(detector, &client_seed))),
            Action::SendToServer(Frame::new(0x93, 0, st.login_blob.clone())),
        ]);
    }

    let detector = KeyDetector::new(sv.keys.candidate_keys(), wire::BB_FIRST_FRAME.to_vec());
    st.detector = Some(detector.clone());
    Ok(vec![
        Action::Forward,
        Action::ArmClientIn(Box::new(DetectorCipher::new(detector.clone(), &client_seed))),
        Action::ArmClientOut(Box::new(ImitatorCipher::new(detector.clone(), &server_seed))),
        Action::ArmServerIn(Box::new(ImitatorCipher::new(detector.clone(), &server_seed))),
        Action::ArmServerOut(Box::new(ImitatorCipher::new(detector, &client_seed))),
    ])
}

/// Bb 0x22 pre-init probe: a particular 0x2C-byte frame marks servers that
/// later verify the address CRC during resume.
fn srv_probe_22(_sv: &Services, st: &mut SessionState, frame: &mut Frame) -> Result<Vec<Action>> {
    if frame.payload.len() == CRC_PROBE_SIZE
        && wire::fnv1a64(&frame.payload) == CRC_PROBE_FINGERPRINT
    {
        info!("proxy.session.crc_patch enabled=true");
        st.enable_remote_ip_crc_patch = true;
    }
    Ok(vec![Action::Forward])
}

const CONFIG_TAIL_AFTER_LOBBY: &[u8; 0x20] = b"t Lobby Server. Copyright SEGA E";
const CONFIG_TAIL_BEFORE_LOBBY: &[u8; 0x20] = b"t Port Map. Copyright SEGA Enter";

/// 0x04 client-config update: capture the remote's assigned identity, mask
/// it from the client, snapshot the config bytes, and fake the one-time
/// 0x96 checksum response the real client would send.
fn srv_config_update_04(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    require(&frame.payload, wire::UPDATE_CONFIG_CFG_OFFSET, "config update")?;
    let mut actions = Vec::new();

    let had_guild_card = st.remote_guild_card_number != 0;
    let assigned = wire::read_u32_at(&frame.payload, wire::UPDATE_CONFIG_GUILD_CARD_OFFSET);
    if st.remote_guild_card_number != assigned {
        st.remote_guild_card_number = assigned;
        info!("proxy.session.remote_guild_card number={assigned}");
        actions.push(Action::SendToClient(text_frame(
            st.version,
            0x11,
            &format!("The remote server\nhas assigned your\nGuild Card number as\n\tC6{assigned}"),
        )));
    }
    if let Some(license) = &st.license {
        wire::write_u32_at(
            &mut frame.payload,
            wire::UPDATE_CONFIG_GUILD_CARD_OFFSET,
            license.serial_number,
        );
    }

    // The client copies a fixed 0x20 bytes regardless of the declared
    // length, so a short 0x04 leaves older buffer contents in place; mirror
    // that with the text the tail would hold at this point in the session.
    st.remote_client_config_data.copy_from_slice(if had_guild_card {
        CONFIG_TAIL_AFTER_LOBBY
    } else {
        CONFIG_TAIL_BEFORE_LOBBY
    });
    let present = (frame.payload.len() - wire::UPDATE_CONFIG_CFG_OFFSET).min(wire::CLIENT_CONFIG_SIZE);
    st.remote_client_config_data[..present].copy_from_slice(
        &frame.payload[wire::UPDATE_CONFIG_CFG_OFFSET..wire::UPDATE_CONFIG_CFG_OFFSET + present],
    );

    if !had_guild_card {
        // The real client answers its first 0x04 with a checksum; no remote
        // server is known to validate the value.
        let checksum = rand::random::<u64>() & 0x0000_FFFF_FFFF_FFFF;
        actions.push(Action::SendToServer(Frame::new(
            0x96,
            0,
            checksum.to_le_bytes().to_vec(),
        )));
    }

    actions.push(Action::Forward);
    Ok(actions)
}

fn srv_text_06(_sv: &Services, st: &mut SessionState, frame: &mut Frame) -> Result<Vec<Action>> {
    if let Some(license) = &st.license {
        if frame.payload.len() >= wire::TEXT_BODY_OFFSET {
            rewrite_if(
                &mut frame.payload,
                wire::TEXT_GUILD_CARD_OFFSET,
                st.remote_guild_card_number,
                license.serial_number,
            );
        }
    }
    Ok(vec![Action::Forward])
}

fn srv_search_result_41(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if let Some(license) = &st.license {
        require(&frame.payload, 12, "search result")?;
        rewrite_if(
            &mut frame.payload,
            wire::RESULT_SEARCHER_OFFSET,
            st.remote_guild_card_number,
            license.serial_number,
        );
        rewrite_if(
            &mut frame.payload,
            wire::RESULT_RESULT_OFFSET,
            st.remote_guild_card_number,
            license.serial_number,
        );
    }
    Ok(vec![Action::Forward])
}

fn srv_mail_81(_sv: &Services, st: &mut SessionState, frame: &mut Frame) -> Result<Vec<Action>> {
    if let Some(license) = &st.license {
        require(&frame.payload, wire::MAIL_TEXT_OFFSET, "mail")?;
        rewrite_if(
            &mut frame.payload,
            wire::MAIL_FROM_OFFSET,
            st.remote_guild_card_number,
            license.serial_number,
        );
        rewrite_if(
            &mut frame.payload,
            wire::MAIL_TO_OFFSET,
            st.remote_guild_card_number,
            license.serial_number,
        );
    }
    Ok(vec![Action::Forward])
}

fn srv_arrows_88(_sv: &Services, st: &mut SessionState, frame: &mut Frame) -> Result<Vec<Action>> {
    if let Some(license) = &st.license {
        let expected = frame.flag as usize * wire::ARROW_ENTRY_SIZE;
        require(&frame.payload, expected, "arrow update")?;
        for x in 0..frame.flag as usize {
            rewrite_if(
                &mut frame.payload,
                x * wire::ARROW_ENTRY_SIZE + wire::ARROW_GUILD_CARD_OFFSET,
                st.remote_guild_card_number,
                license.serial_number,
            );
        }
    }
    Ok(vec![Action::Forward])
}

/// 0xC4: like 0x88, but some servers append garbage after the entries; the
/// client ignores it, so tolerate it here too.
fn srv_choice_result_c4(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if let Some(license) = &st.license {
        let expected = frame.flag as usize * wire::CHOICE_ENTRY_SIZE;
        require(&frame.payload, expected, "choice search result")?;
        for x in 0..frame.flag as usize {
            rewrite_if(
                &mut frame.payload,
                x * wire::CHOICE_ENTRY_SIZE,
                st.remote_guild_card_number,
                license.serial_number,
            );
        }
    }
    Ok(vec![Action::Forward])
}

fn srv_card_lobby_e4(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if let Some(license) = &st.license {
        require(&frame.payload, 4 * wire::CARD_LOBBY_ENTRY_SIZE, "card lobby")?;
        for x in 0..4 {
            rewrite_if(
                &mut frame.payload,
                x * wire::CARD_LOBBY_ENTRY_SIZE + wire::CARD_LOBBY_GUILD_CARD_OFFSET,
                st.remote_guild_card_number,
                license.serial_number,
            );
        }
    }
    Ok(vec![Action::Forward])
}

/// 0x65/0x67/0x68 lobby join: track the roster, rewrite the remote identity
/// in every entry, and apply the lobby overrides.
fn srv_join_lobby_65_67_68(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if frame.opcode == 0x67 {
        st.clear_roster();
        info!("proxy.session.roster cleared=true");
        // Joining a lobby can stop the client acking large message boxes;
        // remember that for the config we hand back on divert.
        if st
            .config
            .flags
            .contains(wire::ConfigFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION_AFTER_LOBBY_JOIN)
        {
            st.config.flags |= wire::ConfigFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION;
        }
    }

    let count = frame.flag as usize;
    let expected = wire::JOIN_LOBBY_HEADER_SIZE + count * wire::JOIN_LOBBY_ENTRY_SIZE;
    if frame.payload.len() != expected {
        return Err(ProxyError::framing(format!(
            "lobby join: {} bytes, expected {expected}",
            frame.payload.len()
        )));
    }

    st.lobby_client_id = frame.payload[0];
    for x in 0..count {
        let entry = wire::JOIN_LOBBY_HEADER_SIZE + x * wire::JOIN_LOBBY_ENTRY_SIZE;
        let slot = LittleEndian::read_u16(&frame.payload[entry + 8..entry + 10]) as usize;
        if slot >= st.lobby_players.len() {
            warn!("proxy.session.roster invalid_slot={slot} position={x}");
            continue;
        }
        if let Some(license) = &st.license {
            rewrite_if(
                &mut frame.payload,
                entry + 4,
                st.remote_guild_card_number,
                license.serial_number,
            );
        }
        let number = wire::read_u32_at(&frame.payload, entry + 4);
        let name = wire::cstr(
            &frame.payload
                [entry + wire::JOIN_LOBBY_ENTRY_NAME_OFFSET..entry + wire::JOIN_LOBBY_ENTRY_NAME_OFFSET + 0x10],
        );
        info!("proxy.session.roster slot={slot} number={number} name={name}");
        st.lobby_players[slot].guild_card_number = number;
        st.lobby_players[slot].name = name;
    }

    if st.toggles.override_lobby_event >= 0 {
        LittleEndian::write_u16(
            &mut frame.payload[6..8],
            st.toggles.override_lobby_event as u16,
        );
    }
    if st.toggles.override_lobby_number >= 0 {
        frame.payload[3] = st.toggles.override_lobby_number as u8;
    }
    Ok(vec![Action::Forward])
}

/// 0x64 game join: four fixed entries instead of twelve.
fn srv_join_game_64(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    let expected = if st.sub_version >= 0x40 {
        wire::JOIN_GAME_FULL_SIZE
    } else {
        wire::JOIN_GAME_BASE_SIZE
    };
    if frame.payload.len() != expected {
        return Err(ProxyError::framing(format!(
            "game join: {} bytes, expected {expected}",
            frame.payload.len()
        )));
    }

    st.lobby_players = vec![Default::default(); 4];
    st.lobby_client_id = frame.payload[wire::JOIN_GAME_CLIENT_ID_OFFSET];
    for x in 0..(frame.flag as usize).min(4) {
        let entry = x * wire::LOBBY_DATA_SIZE;
        if let Some(license) = &st.license {
            rewrite_if(
                &mut frame.payload,
                entry + 4,
                st.remote_guild_card_number,
                license.serial_number,
            );
        }
        st.lobby_players[x].guild_card_number = wire::read_u32_at(&frame.payload, entry + 4);
        st.lobby_players[x].name = if frame.payload.len() == wire::JOIN_GAME_FULL_SIZE {
            let name = wire::JOIN_GAME_BASE_SIZE + x * wire::JOIN_GAME_PLAYER_SIZE;
            wire::cstr(&frame.payload[name..name + 0x10])
        } else {
            String::new()
        };
    }

    if st.toggles.override_section_id >= 0 {
        frame.payload[wire::JOIN_GAME_SECTION_ID_OFFSET] = st.toggles.override_section_id as u8;
    }
    if st.toggles.override_lobby_event >= 0 {
        frame.payload[wire::JOIN_GAME_EVENT_OFFSET] = st.toggles.override_lobby_event as u8;
    }
    Ok(vec![Action::Forward])
}

fn srv_leave_lobby_66_69(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    require(&frame.payload, 4, "lobby leave")?;
    let slot = frame.payload[0] as usize;
    if slot >= st.lobby_players.len() {
        warn!("proxy.session.roster leave_missing_slot={slot}");
    } else {
        st.lobby_players[slot] = Default::default();
        info!("proxy.session.roster left_slot={slot}");
    }
    Ok(vec![Action::Forward])
}

/// 0x19 (in-game) / 0x14 (patch) reconnect. Records where the remote wants
/// the client to go, then either silently re-dials (patch) or rewrites the
/// target so the client comes back to us.
fn srv_reconnect_19_14(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    // Some servers intentionally under-size this command so that the tail
    // of the previous frame completes it inside the client's receive
    // buffer; replicate that completion here.
    if frame.payload.len() < wire::RECONNECT_SIZE {
        let start = frame.payload.len();
        let tail = st.prev_server_frame_tail;
        frame.payload.extend_from_slice(&tail[start..]);
    }

    if st.enable_remote_ip_crc_patch {
        st.remote_ip_crc = CRC32.checksum(&frame.payload[..4]);
    }

    let cmd = Reconnect::parse(&frame.payload)?;
    st.next_destination = Some(std::net::SocketAddrV4::new(
        Ipv4Addr::from(cmd.address),
        cmd.port,
    ));

    if !st.client_connected {
        warn!("proxy.session.reconnect no_client=true");
        return Ok(vec![]);
    }

    if frame.opcode == 0x14 {
        // Patch redirects are hidden from the client entirely; the new
        // server will start its own cipher setup from scratch.
        return Ok(vec![Action::ReconnectServer]);
    }

    match st.client_local_addr {
        Some(local) => {
            frame.payload[..4].copy_from_slice(&local.ip().octets());
            LittleEndian::write_u16(&mut frame.payload[4..6], local.port());
        }
        // Virtual connection: keep the address (it defeats same-network
        // checks) and steer only the port.
        None => LittleEndian::write_u16(&mut frame.payload[4..6], st.local_port),
    }
    Ok(vec![Action::Forward])
}

/// 0x1A/0xD5 large message box: clients configured to skip the close
/// confirmation never answer, so answer for them.
fn srv_message_box_1a_d5(
    _sv: &Services,
    st: &mut SessionState,
    _frame: &mut Frame,
) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    if st
        .config
        .flags
        .contains(wire::ConfigFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION)
    {
        actions.push(Action::SendToServer(Frame::new(0xD6, 0, vec![])));
    }
    actions.push(Action::Forward);
    Ok(actions)
}

fn disassembly_labels(
    code: &[u8],
    footer: &wire::ExecuteCodeFooter,
    footer_offset: usize,
    endian: Endian,
) -> std::collections::BTreeMap<u32, Vec<String>> {
    let mut labels: std::collections::BTreeMap<u32, Vec<String>> = Default::default();
    let mut push = |offset: u32, name: String| labels.entry(offset).or_default().push(name);

    let mut reloc_offset: u32 = 0;
    for x in 0..footer.num_relocations as usize {
        let at = footer.relocations_offset as usize + x * 2;
        if at + 2 > code.len() {
            break;
        }
        let word = match endian {
            Endian::Big => BigEndian::read_u16(&code[at..at + 2]),
            Endian::Little => LittleEndian::read_u16(&code[at..at + 2]),
        };
        reloc_offset += word as u32 * 4;
        push(reloc_offset, format!("reloc{x}"));
    }
    push(footer.entrypoint_addr_offset, "entry_ptr".into());
    push(footer_offset as u32, "footer".into());
    let entry = footer.entrypoint_addr_offset as usize;
    if entry + 4 <= code.len() {
        let start = match endian {
            Endian::Big => BigEndian::read_u32(&code[entry..entry + 4]),
            Endian::Little => LittleEndian::read_u32(&code[entry..entry + 4]),
        };
        push(start, "start".into());
    }
    labels
}

fn dump_code_listing(sv: &Services, st: &SessionState, payload: &[u8]) -> Result<()> {
    let Some(disassembler) = &sv.disassembler else {
        return Ok(());
    };
    let endian = endian_of(st.version);
    let header = wire::ExecuteCodeHeader::parse(payload, endian)?;

    let mut code = payload[wire::EXECUTE_CODE_HEADER_SIZE..].to_vec();
    if code.len() < header.code_size as usize {
        code.resize(header.code_size as usize, 0);
    }
    let footer_offset = (header.code_size as usize)
        .checked_sub(wire::EXECUTE_CODE_FOOTER_SIZE)
        .ok_or_else(|| ProxyError::framing("code smaller than its footer"))?;
    let footer = wire::ExecuteCodeFooter::parse_at(&code, footer_offset, endian)?;

    let labels = disassembly_labels(&code, &footer, footer_offset, endian);
    let listing = disassembler.disassemble(&code, &labels);

    let filename = format!("code.{}.txt", unix_ns());
    let mut text = format!(
        "// code_size = 0x{:X}\n// checksum_addr = 0x{:X}\n// checksum_size = 0x{:X}\n",
        header.code_size, header.checksum_start, header.checksum_size
    );
    text.push_str(&listing);
    let path = save_dump(&st.save_dir, &filename, text.as_bytes())?;
    info!("proxy.files.disassembly path={}", path.display());
    Ok(())
}

/// 0xB2 code execution. Optionally dumped (raw and disassembled); when a
/// pinned return value is configured, answer the server ourselves and keep
/// the code away from the client.
fn srv_code_b2(sv: &Services, st: &mut SessionState, frame: &mut Frame) -> Result<Vec<Action>> {
    if st.toggles.save_files {
        let filename = format!("code.{}.bin", unix_ns());
        let path = save_dump(&st.save_dir, &filename, &frame.payload)?;
        info!("proxy.files.code path={}", path.display());
        if let Err(e) = dump_code_listing(sv, st, &frame.payload) {
            info!("proxy.files.disassembly_failed error={e}");
        }
    }

    if st.toggles.function_call_return_value >= 0 {
        info!("proxy.session.code_blocked return_value={:#x}", st.toggles.function_call_return_value);
        let result = wire::ExecuteCodeResult {
            return_value: st.toggles.function_call_return_value as u32,
            checksum: 0,
        };
        return Ok(vec![Action::SendToServer(Frame::new(
            0xB3,
            frame.flag,
            encode_le(&result),
        ))]);
    }
    Ok(vec![Action::Forward])
}

/// Bb 0xE7 full player data.
fn srv_player_data_e7(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if st.toggles.save_files {
        let filename = format!("player.{}.bin", unix_ns());
        let path = save_dump(&st.save_dir, &filename, &frame.payload)?;
        info!("proxy.files.player path={}", path.display());
    }
    Ok(vec![Action::Forward])
}

fn srv_open_file_44_a6(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if st.toggles.save_files {
        require(&frame.payload, 0x38, "open file")?;
        let filename = wire::cstr(&frame.payload[0x24..0x34]);
        let kind = if frame.opcode == 0xA6 { "download" } else { "online" };
        let output = format!("{}.{}.{}", sanitize_filename(&filename), kind, unix_ns());
        let file_size = wire::read_u32_at(&frame.payload, 0x34);
        let sf = SavingFile::create(&st.save_dir, filename.clone(), &output, file_size)?;
        info!("proxy.files.open name={filename} output={output} size={file_size}");
        st.saving_files.insert(filename, sf);
    }
    Ok(vec![Action::Forward])
}

fn srv_write_file_13_a7(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if st.toggles.save_files {
        require(&frame.payload, 0x414, "file chunk")?;
        let filename = wire::cstr(&frame.payload[..0x10]);
        let declared = wire::read_u32_at(&frame.payload, 0x410) as usize;
        let Some(sf) = st.saving_files.get_mut(&filename) else {
            warn!("proxy.files.chunk_unopened name={filename}");
            return Ok(vec![Action::Forward]);
        };
        let take = if declared > wire::FILE_CHUNK_MAX {
            warn!("proxy.files.chunk_oversize name={filename} declared={declared}");
            wire::FILE_CHUNK_MAX
        } else {
            declared
        };
        let done = sf.write_chunk(&frame.payload[0x10..0x10 + take])?;
        if done {
            info!("proxy.files.complete output={}", sf.output_filename.display());
            st.saving_files.remove(&filename);
        }
    }
    Ok(vec![Action::Forward])
}

/// Gc 0xB8 card list update: a single dump whose first dword declares the
/// payload length.
fn srv_card_update_b8(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    if st.toggles.save_files {
        if frame.payload.len() < 4 {
            warn!("proxy.files.card_update short=true");
            return Ok(vec![Action::Forward]);
        }
        let size = wire::read_u32_at(&frame.payload, 0) as usize;
        if frame.payload.len() - 4 < size {
            warn!("proxy.files.card_update declared={size} available={}", frame.payload.len() - 4);
            return Ok(vec![Action::Forward]);
        }
        let filename = format!("cardupdate.{}.mnr", unix_ns());
        let path = save_dump(&st.save_dir, &filename, &frame.payload[4..4 + size])?;
        info!("proxy.files.card_update path={}", path.display());
    }
    Ok(vec![Action::Forward])
}

/// Server-side subcommand envelopes: warn on gaps in the local table, save
/// embedded map data, and pass through.
fn srv_subcommands(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    check_implemented_subcommand(&frame.payload);

    if st.toggles.save_files && st.version == GameVersion::Gc && frame.payload.len() >= 0x14 {
        let envelope = wire::read_u32_at(&frame.payload, 0);
        let subtype = wire::read_u32_at(&frame.payload, 8);
        if envelope == 0xB6 && subtype == 0x41 {
            let map_id = wire::read_u32_at(&frame.payload, 12);
            let filename = format!("map{map_id:08X}.{}.mnmd", unix_ns());
            let path = save_dump(&st.save_dir, &filename, &frame.payload[0x14..])?;
            info!("proxy.files.map path={}", path.display());
        }
    }
    Ok(vec![Action::Forward])
}

fn check_implemented_subcommand(payload: &[u8]) {
    if payload.len() < 4 {
        warn!("proxy.session.subcommand empty=true");
    } else if !subcommand_is_implemented(payload[0]) {
        warn!(
            "proxy.session.subcommand unimplemented={:02X}",
            payload[0]
        );
    }
}

// ---------------------------------------------------------------------------
// Client -> server handlers

/// Translates chat escape shorthand in place: same length, same encoding.
fn expand_color_escapes(text: &mut [u8]) {
    for b in text.iter_mut() {
        match *b {
            b'$' => *b = b'\t',
            b'#' => *b = b'\n',
            _ => {}
        }
    }
}

/// C->S 0x06 chat: drop anything that looks like a shell command for this
/// proxy, otherwise optionally expand color escapes.
fn cli_chat_06(_sv: &Services, st: &mut SessionState, frame: &mut Frame) -> Result<Vec<Action>> {
    if frame.payload.len() >= 12 {
        let p = &frame.payload;
        let looks_like_command = p[8] == b'$' || (p[8] == b'\t' && p[9] != b'C' && p[10] == b'$');
        if st.toggles.suppress_shell_commands && looks_like_command {
            warn!("proxy.session.chat suppressed_command=true");
            return Ok(vec![]);
        }
        if st.toggles.enable_chat_filter {
            expand_color_escapes(&mut frame.payload[wire::TEXT_BODY_OFFSET..]);
        }
    }
    Ok(vec![Action::Forward])
}

/// C->S 0x40 guild-card search: the client searches with the identities it
/// knows (its own), which must become the remote ones.
fn cli_search_40(_sv: &Services, st: &mut SessionState, frame: &mut Frame) -> Result<Vec<Action>> {
    if let Some(license) = &st.license {
        require(&frame.payload, 12, "guild card search")?;
        rewrite_if(
            &mut frame.payload,
            wire::SEARCH_SEARCHER_OFFSET,
            license.serial_number,
            st.remote_guild_card_number,
        );
        rewrite_if(
            &mut frame.payload,
            wire::SEARCH_TARGET_OFFSET,
            license.serial_number,
            st.remote_guild_card_number,
        );
    }
    Ok(vec![Action::Forward])
}

fn cli_mail_81(_sv: &Services, st: &mut SessionState, frame: &mut Frame) -> Result<Vec<Action>> {
    require(&frame.payload, wire::MAIL_TEXT_OFFSET, "mail")?;
    if let Some(license) = &st.license {
        rewrite_if(
            &mut frame.payload,
            wire::MAIL_FROM_OFFSET,
            license.serial_number,
            st.remote_guild_card_number,
        );
        rewrite_if(
            &mut frame.payload,
            wire::MAIL_TO_OFFSET,
            license.serial_number,
            st.remote_guild_card_number,
        );
    }
    // Clients send uninitialized memory after the text terminator; zero it.
    let text = &mut frame.payload[wire::MAIL_TEXT_OFFSET..];
    if let Some(nul) = text.iter().position(|&b| b == 0) {
        text[nul..].fill(0);
    }
    Ok(vec![Action::Forward])
}

/// C->S subcommand envelopes: identity rewrite in guild-card transfers,
/// cheat synthesis, and switch-assist replay.
fn cli_subcommands(
    _sv: &Services,
    st: &mut SessionState,
    frame: &mut Frame,
) -> Result<Vec<Action>> {
    let mut actions = Vec::new();

    if st.license.is_some() && !frame.payload.is_empty() {
        let license_serial = st.license.as_ref().unwrap().serial_number;
        match frame.payload[0] {
            SUB_SEND_GUILD_CARD
                if matches!(st.version, GameVersion::Gc | GameVersion::Bb)
                    && frame.payload.len() >= GUILD_CARD_NUMBER_OFFSET + 4 =>
            {
                rewrite_if(
                    &mut frame.payload,
                    GUILD_CARD_NUMBER_OFFSET,
                    license_serial,
                    st.remote_guild_card_number,
                );
            }
            SUB_HIT_BY_MONSTER | SUB_HIT_BY_MONSTER_2 if st.toggles.infinite_hp => {
                actions.push(Action::SendToClient(Frame::new(
                    0x60,
                    0,
                    build_stat_change_burst(st.lobby_client_id, StatChange::AddHp, 1020),
                )));
            }
            SUB_CAST_TECHNIQUE if st.toggles.infinite_tp => {
                actions.push(Action::SendToClient(Frame::new(
                    0x60,
                    0,
                    build_stat_change(st.lobby_client_id, StatChange::AddTp, 0xFF).to_vec(),
                )));
            }
            _ => {}
        }
    }

    check_implemented_subcommand(&frame.payload);

    if st.toggles.enable_switch_assist
        && frame.payload.len() >= SWITCH_PAYLOAD_SIZE
        && frame.payload[0] == SUB_SWITCH_CHANGED
    {
        let enabled = frame.payload[SWITCH_ENABLED_OFFSET] != 0;
        let switch_id =
            LittleEndian::read_u16(&frame.payload[SWITCH_ID_OFFSET..SWITCH_ID_OFFSET + 2]);
        if enabled && switch_id != SWITCH_ID_NONE {
            if let Some(previous) = st.last_switch_command.clone() {
                info!("proxy.session.switch_assist replay=true switch_id={switch_id}");
                actions.push(Action::SendToServer(Frame::new(0x60, 0, previous.clone())));
                actions.push(Action::SendToClient(Frame::new(0x60, 0, previous)));
            }
            st.last_switch_command = Some(frame.payload[..SWITCH_PAYLOAD_SIZE].to_vec());
        }
    }

    actions.push(Action::Forward);
    Ok(actions)
}

/// C->S 0xA0/0xA1 ship/block change. For licensed sessions the remote menu
/// is never reached: the lobby is emptied client-side, the proxy's config
/// is restored, and the client is reconnected to our own login port.
fn cli_lobby_change_a0_a1(
    sv: &Services,
    st: &mut SessionState,
    _frame: &mut Frame,
) -> Result<Vec<Action>> {
    let Some(license) = st.license.clone() else {
        return Ok(vec![Action::Forward]);
    };

    let port_name = st.version.login_port_name();
    let Some(port) = sv.ports.port_for(port_name) else {
        warn!("proxy.session.divert missing_port={port_name}");
        return Ok(vec![]);
    };

    let mut actions = Vec::new();
    for (slot, player) in st.lobby_players.iter().enumerate() {
        if player.guild_card_number == 0 || slot as u8 == st.lobby_client_id {
            continue;
        }
        let leave = wire::LeaveLobby {
            client_id: slot as u8,
            leader_id: st.lobby_client_id,
            unused: 0,
        };
        actions.push(Action::SendToClient(Frame::new(
            0x69,
            slot as u32,
            encode_le(&leave),
        )));
    }

    actions.push(Action::SendToClient(text_frame(
        st.version,
        0x11,
        &format!("You've returned to\n\tC6{}", sv.name),
    )));

    let mut restore = Vec::with_capacity(8 + wire::CLIENT_CONFIG_SIZE);
    restore.extend_from_slice(&0x0001_0000u32.to_le_bytes());
    restore.extend_from_slice(&license.serial_number.to_le_bytes());
    restore.extend_from_slice(&st.config.to_bytes());
    actions.push(Action::SendToClient(Frame::new(0x04, 0, restore)));

    let address = match st.client_local_addr {
        Some(local) => local.ip().octets(),
        None => st
            .next_destination
            .map(|d| d.ip().octets())
            .unwrap_or([0; 4]),
    };
    let reconnect = Reconnect {
        address,
        port,
        unused: 0,
    };
    actions.push(Action::SendToClient(Frame::new(
        0x19,
        0,
        reconnect.to_bytes(),
    )));
    info!("proxy.session.divert port_name={port_name} port={port}");
    Ok(actions)
}

// ---------------------------------------------------------------------------
// Tables

struct VersionTables {
    server: [CmdHandler; 0x100],
    client: [CmdHandler; 0x100],
}

static TABLES: OnceLock<[VersionTables; 5]> = OnceLock::new();

fn version_index(version: GameVersion) -> usize {
    match version {
        GameVersion::Dc => 0,
        GameVersion::Pc => 1,
        GameVersion::Patch => 2,
        GameVersion::Gc => 3,
        GameVersion::Bb => 4,
    }
}

pub fn handler_for(version: GameVersion, from_server: bool, opcode: u8) -> CmdHandler {
    let tables = &TABLES.get_or_init(build_tables)[version_index(version)];
    if from_server {
        tables.server[opcode as usize]
    } else {
        tables.client[opcode as usize]
    }
}

fn build_tables() -> [VersionTables; 5] {
    let mut dc = VersionTables {
        server: [fwd; 0x100],
        client: [fwd; 0x100],
    };
    dc.server[0x04] = srv_config_update_04;
    dc.server[0x06] = srv_text_06;
    dc.server[0x13] = srv_write_file_13_a7;
    dc.server[0x19] = srv_reconnect_19_14;
    dc.server[0x41] = srv_search_result_41;
    for op in [0x60, 0x62, 0x6C, 0x6D] {
        dc.server[op] = srv_subcommands;
    }
    dc.server[0x66] = srv_leave_lobby_66_69;
    dc.server[0x69] = srv_leave_lobby_66_69;
    dc.server[0x88] = srv_arrows_88;
    dc.server[0x97] = srv_save_trap_97;
    dc.server[0xA7] = srv_write_file_13_a7;
    dc.client[0x06] = cli_chat_06;
    dc.client[0x40] = cli_search_40;
    for op in [0x60, 0x62, 0x6C, 0x6D] {
        dc.client[op] = cli_subcommands;
    }
    dc.client[0xA0] = cli_lobby_change_a0_a1;
    dc.client[0xA1] = cli_lobby_change_a0_a1;

    let mut pc = VersionTables {
        server: [fwd; 0x100],
        client: [fwd; 0x100],
    };
    pc.server[0x02] = srv_server_init_02_17;
    pc.server[0x17] = srv_server_init_02_17;
    pc.server[0x04] = srv_config_update_04;
    pc.server[0x06] = srv_text_06;
    pc.server[0x13] = srv_write_file_13_a7;
    pc.server[0x19] = srv_reconnect_19_14;
    pc.server[0x41] = srv_search_result_41;
    pc.server[0x44] = srv_open_file_44_a6;
    for op in [0x60, 0x62, 0x6C, 0x6D] {
        pc.server[op] = srv_subcommands;
    }
    pc.server[0x64] = srv_join_game_64;
    for op in [0x65, 0x67, 0x68] {
        pc.server[op] = srv_join_lobby_65_67_68;
    }
    pc.server[0x66] = srv_leave_lobby_66_69;
    pc.server[0x69] = srv_leave_lobby_66_69;
    pc.server[0x88] = srv_arrows_88;
    pc.server[0x97] = srv_save_trap_97;
    pc.server[0xA6] = srv_open_file_44_a6;
    pc.server[0xA7] = srv_write_file_13_a7;
    pc.client[0x06] = cli_chat_06;
    pc.client[0x40] = cli_search_40;
    for op in [0x60, 0x62, 0x6C, 0x6D] {
        pc.client[op] = cli_subcommands;
    }
    pc.client[0xA0] = cli_lobby_change_a0_a1;
    pc.client[0xA1] = cli_lobby_change_a0_a1;

    let mut patch = VersionTables {
        server: [fwd; 0x100],
        client: [fwd; 0x100],
    };
    patch.server[0x02] = srv_server_init_02_17;
    patch.server[0x17] = srv_server_init_02_17;
    patch.server[0x14] = srv_reconnect_19_14;

    let mut gc = VersionTables {
        server: [fwd; 0x100],
        client: [fwd; 0x100],
    };
    gc.server[0x02] = srv_server_init_02_17;
    gc.server[0x17] = srv_server_init_02_17;
    gc.server[0x04] = srv_config_update_04;
    gc.server[0x06] = srv_text_06;
    gc.server[0x13] = srv_write_file_13_a7;
    gc.server[0x19] = srv_reconnect_19_14;
    gc.server[0x1A] = srv_message_box_1a_d5;
    gc.server[0xD5] = srv_message_box_1a_d5;
    gc.server[0x41] = srv_search_result_41;
    gc.server[0x44] = srv_open_file_44_a6;
    for op in [0x60, 0x62, 0x6C, 0x6D, 0xC9, 0xCB] {
        gc.server[op] = srv_subcommands;
    }
    gc.server[0x64] = srv_join_game_64;
    for op in [0x65, 0x67, 0x68] {
        gc.server[op] = srv_join_lobby_65_67_68;
    }
    gc.server[0x66] = srv_leave_lobby_66_69;
    gc.server[0x69] = srv_leave_lobby_66_69;
    gc.server[0x81] = srv_mail_81;
    gc.server[0x88] = srv_arrows_88;
    gc.server[0x97] = srv_save_trap_97;
    gc.server[0x9A] = srv_relogin_prompt_9a;
    gc.server[0xA6] = srv_open_file_44_a6;
    gc.server[0xA7] = srv_write_file_13_a7;
    gc.server[0xB2] = srv_code_b2;
    gc.server[0xB8] = srv_card_update_b8;
    gc.server[0xC4] = srv_choice_result_c4;
    gc.server[0xE4] = srv_card_lobby_e4;
    gc.client[0x06] = cli_chat_06;
    gc.client[0x40] = cli_search_40;
    for op in [0x60, 0x62, 0x6C, 0x6D] {
        gc.client[op] = cli_subcommands;
    }
    gc.client[0x81] = cli_mail_81;
    gc.client[0xA0] = cli_lobby_change_a0_a1;
    gc.client[0xA1] = cli_lobby_change_a0_a1;

    let mut bb = VersionTables {
        server: [fwd; 0x100],
        client: [fwd; 0x100],
    };
    bb.server[0x03] = srv_server_init_bb_03;
    bb.server[0x13] = srv_write_file_13_a7;
    bb.server[0x19] = srv_reconnect_19_14;
    bb.server[0x22] = srv_probe_22;
    bb.server[0x41] = srv_search_result_41;
    bb.server[0x44] = srv_open_file_44_a6;
    for op in [0x60, 0x62, 0x6C, 0x6D] {
        bb.server[op] = srv_subcommands;
    }
    bb.server[0x64] = srv_join_game_64;
    for op in [0x65, 0x67, 0x68] {
        bb.server[op] = srv_join_lobby_65_67_68;
    }
    bb.server[0x66] = srv_leave_lobby_66_69;
    bb.server[0x69] = srv_leave_lobby_66_69;
    bb.server[0x88] = srv_arrows_88;
    bb.server[0xA6] = srv_open_file_44_a6;
    bb.server[0xA7] = srv_write_file_13_a7;
    bb.server[0xB2] = srv_code_b2;
    bb.server[0xE7] = srv_player_data_e7;
    bb.client[0x06] = cli_chat_06;
    bb.client[0x40] = cli_search_40;
    for op in [0x60, 0x62, 0x6C, 0x6D] {
        bb.client[op] = cli_subcommands;
    }

    [dc, pc, patch, gc, bb]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::block::{BlockKey, SEED_SIZE};
    use crate::services::{
        License, PortDirectory, StaticKeyPalette, StaticLicenseAuthority,
    };
    use std::net::SocketAddrV4;
    use std::path::PathBuf;
    use std::sync::Arc;

    const SERIAL: u32 = 0x1234_5678;
    const REMOTE: u32 = 7_777_777;

    fn services() -> Services {
        let mut ports = PortDirectory::default();
        ports.insert("dc-login", 9200);
        ports.insert("pc-login", 9300);
        ports.insert("bb-patch", 11000);
        ports.insert("gc-us3", 9100);
        ports.insert("bb-login", 12000);
        Services {
            name: "Alembic".into(),
            licenses: Arc::new(StaticLicenseAuthority::new(vec![])),
            keys: Arc::new(StaticKeyPalette::new(vec![Arc::new(BlockKey::derive(
                "default",
                b"default-table",
            ))])),
            ports,
            save_dir: std::env::temp_dir(),
            disassembler: None,
        }
    }

    fn licensed_state(version: GameVersion) -> SessionState {
        let mut st = SessionState::new(version, 9100, PathBuf::from("."));
        st.license = Some(Arc::new(License {
            serial_number: SERIAL,
            access_key: "abcdefgh".into(),
            password: "pw".into(),
            username: "user".into(),
        }));
        st.remote_guild_card_number = REMOTE;
        st.client_connected = true;
        st.server_connected = true;
        st
    }

    fn forwards(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::Forward))
    }

    fn sent_frames(actions: &[Action]) -> (Vec<&Frame>, Vec<&Frame>) {
        let mut to_client = Vec::new();
        let mut to_server = Vec::new();
        for action in actions {
            match action {
                Action::SendToClient(f) => to_client.push(f),
                Action::SendToServer(f) => to_server.push(f),
                _ => {}
            }
        }
        (to_client, to_server)
    }

    #[test]
    fn config_update_masks_identity_and_fakes_checksum_once() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.remote_guild_card_number = 0;

        let mut payload = vec![0u8; 0x28];
        wire::write_u32_at(&mut payload, 4, REMOTE);
        payload[8..0x28].copy_from_slice(&[0x5A; 0x20]);
        let mut frame = Frame::new(0x04, 0, payload);

        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(forwards(&actions));
        // The client sees only its own serial.
        assert_eq!(wire::read_u32_at(&frame.payload, 4), SERIAL);
        assert_eq!(st.remote_guild_card_number, REMOTE);
        assert_eq!(st.remote_client_config_data, [0x5A; 0x20]);

        let (to_client, to_server) = sent_frames(&actions);
        // Announcement bubble plus the synthesized 0x96.
        assert_eq!(to_client.len(), 1);
        assert_eq!(to_client[0].opcode, 0x11);
        assert_eq!(to_server.len(), 1);
        assert_eq!(to_server[0].opcode, 0x96);
        assert_eq!(to_server[0].payload.len(), 8);
        assert_eq!(&to_server[0].payload[6..8], &[0, 0]); // 48-bit value

        // Second 0x04 with the same number: no bubble, no checksum.
        let mut payload = vec![0u8; 0x28];
        wire::write_u32_at(&mut payload, 4, REMOTE);
        let mut frame = Frame::new(0x04, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        let (to_client, to_server) = sent_frames(&actions);
        assert!(to_client.is_empty());
        assert!(to_server.is_empty());
    }

    #[test]
    fn short_config_update_keeps_canned_tail() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        // Short 0x04: only 8 bytes of config present.
        let mut payload = vec![0u8; 0x10];
        wire::write_u32_at(&mut payload, 4, REMOTE);
        payload[8..0x10].copy_from_slice(b"CFGBYTES");
        let mut frame = Frame::new(0x04, 0, payload);
        process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert_eq!(&st.remote_client_config_data[..8], b"CFGBYTES");
        assert_eq!(&st.remote_client_config_data[8..], &CONFIG_TAIL_AFTER_LOBBY[8..]);
    }

    #[test]
    fn identity_rewrites_touch_only_the_named_fields() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);

        // 0x41: both searcher and result.
        let mut payload = vec![0u8; 0x20];
        wire::write_u32_at(&mut payload, 4, REMOTE);
        wire::write_u32_at(&mut payload, 8, REMOTE);
        payload[12..].fill(0xEE);
        let pristine = payload.clone();
        let mut frame = Frame::new(0x41, 0, payload);
        process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert_eq!(wire::read_u32_at(&frame.payload, 4), SERIAL);
        assert_eq!(wire::read_u32_at(&frame.payload, 8), SERIAL);
        assert_eq!(&frame.payload[12..], &pristine[12..]);

        // 0x88: every entry in the flag-counted array.
        let mut payload = vec![0u8; 3 * 12];
        for x in 0..3 {
            wire::write_u32_at(&mut payload, x * 12 + 4, if x == 1 { 42 } else { REMOTE });
        }
        let mut frame = Frame::new(0x88, 3, payload);
        process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert_eq!(wire::read_u32_at(&frame.payload, 4), SERIAL);
        assert_eq!(wire::read_u32_at(&frame.payload, 16), 42);
        assert_eq!(wire::read_u32_at(&frame.payload, 28), SERIAL);

        // 0xC4 tolerates trailing garbage.
        let mut payload = vec![0u8; wire::CHOICE_ENTRY_SIZE + 5];
        wire::write_u32_at(&mut payload, 0, REMOTE);
        let mut frame = Frame::new(0xC4, 1, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(forwards(&actions));
        assert_eq!(wire::read_u32_at(&frame.payload, 0), SERIAL);
    }

    #[test]
    fn outbound_search_translates_back_to_remote_identity() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Pc);
        let mut payload = vec![0u8; 12];
        wire::write_u32_at(&mut payload, 4, SERIAL);
        wire::write_u32_at(&mut payload, 8, SERIAL);
        let mut frame = Frame::new(0x40, 0, payload);
        process_frame(&sv, &mut st, false, &mut frame).unwrap();
        assert_eq!(wire::read_u32_at(&frame.payload, 4), REMOTE);
        assert_eq!(wire::read_u32_at(&frame.payload, 8), REMOTE);
    }

    #[test]
    fn roster_join_then_leave_is_idempotent() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);

        // One entry joining slot 3 via 0x67.
        let mut payload = vec![0u8; wire::JOIN_LOBBY_HEADER_SIZE + wire::JOIN_LOBBY_ENTRY_SIZE];
        payload[0] = 1; // our client id
        let entry = wire::JOIN_LOBBY_HEADER_SIZE;
        wire::write_u32_at(&mut payload, entry + 4, REMOTE);
        LittleEndian::write_u16(&mut payload[entry + 8..entry + 10], 3);
        payload[entry + 12..entry + 12 + 4].copy_from_slice(b"Mio\0");
        let mut frame = Frame::new(0x67, 1, payload);
        process_frame(&sv, &mut st, true, &mut frame).unwrap();

        assert_eq!(st.lobby_client_id, 1);
        assert_eq!(st.lobby_players[3].guild_card_number, SERIAL); // rewritten
        assert_eq!(st.lobby_players[3].name, "Mio");
        // Frame the client sees carries the serial too.
        assert_eq!(wire::read_u32_at(&frame.payload, entry + 4), SERIAL);

        let others: Vec<_> = st
            .lobby_players
            .iter()
            .enumerate()
            .filter(|(i, p)| *i != 3 && p.guild_card_number != 0)
            .collect();
        assert!(others.is_empty());

        // Leave of the same slot clears exactly that slot.
        let leave = wire::LeaveLobby {
            client_id: 3,
            leader_id: 1,
            unused: 0,
        };
        let mut frame = Frame::new(0x69, 3, encode_le(&leave));
        process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert_eq!(st.lobby_players[3].guild_card_number, 0);
        assert!(st.lobby_players[3].name.is_empty());
    }

    #[test]
    fn lobby_overrides_apply_on_join() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.toggles.override_lobby_event = 9;
        st.toggles.override_lobby_number = 4;

        let mut payload = vec![0u8; wire::JOIN_LOBBY_HEADER_SIZE];
        payload[3] = 1;
        let mut frame = Frame::new(0x68, 0, payload);
        process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert_eq!(LittleEndian::read_u16(&frame.payload[6..8]), 9);
        assert_eq!(frame.payload[3], 4);
    }

    #[test]
    fn undersized_reconnect_completes_from_previous_frame_tail() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.client_local_addr = None; // virtual connection: port-only rewrite
        st.local_port = 9100;
        st.note_server_payload(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11]);

        let mut frame = Frame::new(0x19, 0, vec![0x22, 0x33, 0x44]);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(forwards(&actions));
        // Completed from the previous tail, then the port steered to us.
        assert_eq!(&frame.payload[..4], &[0x22, 0x33, 0x44, 0xDD]);
        assert_eq!(
            st.next_destination.unwrap(),
            SocketAddrV4::new(Ipv4Addr::new(0x22, 0x33, 0x44, 0xDD), 0xFFEE)
        );
        assert_eq!(LittleEndian::read_u16(&frame.payload[4..6]), 9100);
    }

    #[test]
    fn reconnect_on_real_socket_rewrites_address_to_listener() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.client_local_addr = Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 9100));
        st.note_server_payload(&[0; 8]);

        let mut payload = vec![0u8; 8];
        payload[..4].copy_from_slice(&[203, 0, 113, 50]);
        LittleEndian::write_u16(&mut payload[4..6], 12000);
        let mut frame = Frame::new(0x19, 0, payload);
        process_frame(&sv, &mut st, true, &mut frame).unwrap();

        // Recorded destination is the remote's real target...
        assert_eq!(
            st.next_destination.unwrap(),
            SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 50), 12000)
        );
        // ...while the client is pointed back at us.
        assert_eq!(&frame.payload[..4], &[10, 0, 0, 5]);
        assert_eq!(LittleEndian::read_u16(&frame.payload[4..6]), 9100);
    }

    #[test]
    fn patch_reconnect_redials_without_telling_the_client() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Patch);
        let mut payload = vec![0u8; 8];
        payload[..4].copy_from_slice(&[127, 0, 0, 1]);
        LittleEndian::write_u16(&mut payload[4..6], 11001);
        let mut frame = Frame::new(0x14, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(!forwards(&actions));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ReconnectServer)));
    }

    #[test]
    fn code_execution_blocked_when_return_value_pinned() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.toggles.function_call_return_value = 0x1234_5678;

        let mut frame = Frame::new(0xB2, 7, vec![0u8; 0x40]);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(!forwards(&actions));
        let (_, to_server) = sent_frames(&actions);
        assert_eq!(to_server.len(), 1);
        assert_eq!(to_server[0].opcode, 0xB3);
        assert_eq!(to_server[0].flag, 7);
        assert_eq!(wire::read_u32_at(&to_server[0].payload, 0), 0x1234_5678);
        assert_eq!(wire::read_u32_at(&to_server[0].payload, 4), 0);
    }

    #[test]
    fn save_trap_answers_flag_one_and_never_forwards() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        let mut frame = Frame::new(0x97, 0, vec![]);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(!forwards(&actions));
        let (to_client, _) = sent_frames(&actions);
        assert_eq!(to_client[0].opcode, 0x97);
        assert_eq!(to_client[0].flag, 1);
        assert!(st.config.flags.contains(wire::ConfigFlags::SAVE_ENABLED));
    }

    #[test]
    fn chat_suppression_and_color_expansion() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);

        let mut payload = vec![0u8; 8];
        payload.extend_from_slice(b"$warp 1 2\0\0\0");
        let mut frame = Frame::new(0x06, 0, payload);
        let actions = process_frame(&sv, &mut st, false, &mut frame).unwrap();
        assert!(actions.is_empty());

        // Tab-prefixed variant.
        let mut payload = vec![0u8; 8];
        payload.extend_from_slice(b"\tE$li\0\0\0");
        let mut frame = Frame::new(0x06, 0, payload);
        assert!(process_frame(&sv, &mut st, false, &mut frame)
            .unwrap()
            .is_empty());

        // Ordinary chat gets escapes expanded and goes through.
        let mut payload = vec![0u8; 8];
        payload.extend_from_slice(b"hi $ and #\0\0");
        let mut frame = Frame::new(0x06, 0, payload);
        let actions = process_frame(&sv, &mut st, false, &mut frame).unwrap();
        assert!(forwards(&actions));
        assert_eq!(&frame.payload[8..], b"hi \t and \n\0\0");

        // With suppression off the shell command survives.
        st.toggles.suppress_shell_commands = false;
        let mut payload = vec![0u8; 8];
        payload.extend_from_slice(b"$kill\0\0\0");
        let mut frame = Frame::new(0x06, 0, payload);
        assert!(forwards(
            &process_frame(&sv, &mut st, false, &mut frame).unwrap()
        ));
    }

    #[test]
    fn switch_assist_replays_cached_activation_before_the_new_one() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.toggles.enable_switch_assist = true;

        let mut first = vec![SUB_SWITCH_CHANGED, 0x03, 0, 0];
        first.extend_from_slice(&5u16.to_le_bytes());
        first.extend_from_slice(&[0, 0, 0, 0, 0, 1]); // enabled
        let mut frame = Frame::new(0x60, 0, first.clone());
        let actions = process_frame(&sv, &mut st, false, &mut frame).unwrap();
        // Nothing cached yet: just forwarded.
        assert_eq!(actions.len(), 1);
        assert!(forwards(&actions));
        assert_eq!(st.last_switch_command.as_deref(), Some(&first[..]));

        let mut second = first.clone();
        second[4..6].copy_from_slice(&6u16.to_le_bytes());
        let mut frame = Frame::new(0x60, 0, second.clone());
        let actions = process_frame(&sv, &mut st, false, &mut frame).unwrap();
        // Replay to both endpoints, then the new frame forwards.
        let (to_client, to_server) = sent_frames(&actions);
        assert_eq!(to_server.len(), 1);
        assert_eq!(to_client.len(), 1);
        assert_eq!(to_server[0].payload, first);
        assert_eq!(to_client[0].payload, first);
        assert!(matches!(actions.last(), Some(Action::Forward)));
        assert_eq!(st.last_switch_command.as_deref(), Some(&second[..]));

        // Disabled or sentinel switches are not cached.
        let mut off = first.clone();
        off[11] = 0;
        let mut frame = Frame::new(0x60, 0, off);
        process_frame(&sv, &mut st, false, &mut frame).unwrap();
        assert_eq!(st.last_switch_command.as_deref(), Some(&second[..]));
    }

    #[test]
    fn infinite_hp_and_tp_synthesize_stat_changes() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.toggles.infinite_hp = true;
        st.toggles.infinite_tp = true;
        st.lobby_client_id = 2;

        let mut frame = Frame::new(0x60, 0, vec![SUB_HIT_BY_MONSTER, 0x01, 2, 0]);
        let actions = process_frame(&sv, &mut st, false, &mut frame).unwrap();
        let (to_client, _) = sent_frames(&actions);
        assert_eq!(to_client.len(), 1);
        assert_eq!(to_client[0].payload.len(), 32); // 4 x 255 = 1020 HP
        assert!(forwards(&actions));

        let mut frame = Frame::new(0x60, 0, vec![SUB_CAST_TECHNIQUE, 0x01, 2, 0]);
        let actions = process_frame(&sv, &mut st, false, &mut frame).unwrap();
        let (to_client, _) = sent_frames(&actions);
        assert_eq!(to_client.len(), 1);
        assert_eq!(to_client[0].payload.len(), 8);
        assert_eq!(to_client[0].payload[6], StatChange::AddTp as u8);
    }

    #[test]
    fn guild_card_transfer_carries_remote_identity() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        let mut payload = vec![SUB_SEND_GUILD_CARD, 0x25, 0, 0];
        payload.extend_from_slice(&SERIAL.to_le_bytes());
        payload.resize(0x94, 0);
        let mut frame = Frame::new(0x62, 1, payload);
        process_frame(&sv, &mut st, false, &mut frame).unwrap();
        assert_eq!(wire::read_u32_at(&frame.payload, 4), REMOTE);
    }

    #[test]
    fn lobby_divert_sequences_leaves_config_bubble_and_reconnect() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.lobby_client_id = 1;
        st.lobby_players[1].guild_card_number = SERIAL;
        st.lobby_players[3].guild_card_number = 1111;
        st.lobby_players[7].guild_card_number = 2222;
        st.client_local_addr = Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 9100));
        st.config.flags |= wire::ConfigFlags::SAVE_ENABLED;

        let mut frame = Frame::new(0xA0, 0, vec![]);
        let actions = process_frame(&sv, &mut st, false, &mut frame).unwrap();
        assert!(!forwards(&actions));

        let (to_client, to_server) = sent_frames(&actions);
        assert!(to_server.is_empty());
        // One 0x69 per other occupied slot, then 0x04, 0x11, 0x19.
        let leaves: Vec<_> = to_client.iter().filter(|f| f.opcode == 0x69).collect();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].payload[0], 3);
        assert_eq!(leaves[1].payload[0], 7);
        assert!(to_client.iter().any(|f| f.opcode == 0x11));

        let restore = to_client.iter().find(|f| f.opcode == 0x04).unwrap();
        assert_eq!(wire::read_u32_at(&restore.payload, 4), SERIAL);
        let cfg = wire::ClientConfig::from_bytes(&restore.payload[8..]).unwrap();
        assert!(cfg.is_ours());
        assert!(cfg.flags.contains(wire::ConfigFlags::SAVE_ENABLED));

        let reconnect = to_client.iter().find(|f| f.opcode == 0x19).unwrap();
        assert_eq!(&reconnect.payload[..4], &[10, 0, 0, 5]);
        assert_eq!(LittleEndian::read_u16(&reconnect.payload[4..6]), 9100);

        // Unlicensed sessions go to the remote menu untouched.
        let mut st = SessionState::new(GameVersion::Gc, 9100, PathBuf::from("."));
        let mut frame = Frame::new(0xA0, 0, vec![]);
        assert!(forwards(
            &process_frame(&sv, &mut st, false, &mut frame).unwrap()
        ));
    }

    #[test]
    fn licensed_server_init_impersonates_the_client() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        st.remote_guild_card_number = 0;
        st.sub_version = 0x41;
        st.character_name = "Rico".into();

        let payload = wire::build_server_init_v2(false, 1, 2);
        let mut frame = Frame::new(0x02, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(!forwards(&actions));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ArmServerIn(_))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ArmServerOut(_))));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ArmClientIn(_) | Action::ArmClientOut(_))));

        let (_, to_server) = sent_frames(&actions);
        assert_eq!(to_server.len(), 1);
        assert_eq!(to_server[0].opcode, 0x9E);
        // No guild card yet: the full padded record.
        assert_eq!(to_server[0].payload.len(), wire::LOGIN_CONSOLE_PADDED_SIZE);
        assert_eq!(wire::read_u32_at(&to_server[0].payload, 0), 0xFFFF_0000);
        assert_eq!(wire::read_u32_at(&to_server[0].payload, 4), 0xFFFF_FFFF);

        // 0x17 instead asks for license verification.
        let payload = wire::build_server_init_v2(false, 1, 2);
        let mut frame = Frame::new(0x17, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        let (_, to_server) = sent_frames(&actions);
        assert_eq!(to_server[0].opcode, 0xDB);

        // Known guild card: truncated 0x9E.
        st.remote_guild_card_number = REMOTE;
        let payload = wire::build_server_init_v2(false, 1, 2);
        let mut frame = Frame::new(0x02, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        let (_, to_server) = sent_frames(&actions);
        assert_eq!(to_server[0].payload.len(), wire::LOGIN_CONSOLE_SIZE);
        assert_eq!(wire::read_u32_at(&to_server[0].payload, 4), REMOTE);
    }

    #[test]
    fn passthrough_server_init_forwards_then_arms_everything() {
        let sv = services();
        let mut st = SessionState::new(GameVersion::Pc, 9300, PathBuf::from("."));
        st.client_connected = true;
        let payload = wire::build_server_init_v2(false, 77, 88);
        let mut frame = Frame::new(0x02, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(matches!(actions[0], Action::Forward));
        assert_eq!(actions.len(), 5);
    }

    #[test]
    fn passthrough_ciphers_pair_up_across_the_proxy() {
        // After the hijack, client-out must mirror server-in and server-out
        // mirror client-in, or the two streams desynchronize.
        let sv = services();
        let mut st = SessionState::new(GameVersion::Gc, 9100, PathBuf::from("."));
        st.client_connected = true;
        let payload = wire::build_server_init_v2(false, 0x1111_2222, 0x3333_4444);
        let mut frame = Frame::new(0x02, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();

        let mut server_in = None;
        let mut server_out = None;
        let mut client_in = None;
        let mut client_out = None;
        for action in actions {
            match action {
                Action::ArmServerIn(c) => server_in = Some(c),
                Action::ArmServerOut(c) => server_out = Some(c),
                Action::ArmClientIn(c) => client_in = Some(c),
                Action::ArmClientOut(c) => client_out = Some(c),
                _ => {}
            }
        }

        let vector: Vec<u8> = (0u8..64).collect();
        let mut a = vector.clone();
        let mut b = vector.clone();
        client_out.unwrap().encrypt(&mut a).unwrap();
        server_in.unwrap().encrypt(&mut b).unwrap();
        assert_eq!(a, b);

        let mut c = vector.clone();
        let mut d = vector;
        server_out.unwrap().encrypt(&mut c).unwrap();
        client_in.unwrap().encrypt(&mut d).unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn bb_probe_latches_crc_patch_flag() {
        let sv = services();
        let mut st = SessionState::new(GameVersion::Bb, 12000, PathBuf::from("."));
        // Right size, wrong contents: the flag must stay off.
        let mut frame = Frame::new(0x22, 0, vec![0u8; CRC_PROBE_SIZE]);
        process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(!st.enable_remote_ip_crc_patch);
    }

    #[test]
    fn bb_resume_replays_patched_login() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Bb);
        let detector = KeyDetector::new(sv.keys.candidate_keys(), wire::BB_FIRST_FRAME.to_vec());
        st.detector = Some(detector);
        st.login_blob = vec![0u8; 0x98];
        st.enable_remote_ip_crc_patch = true;
        st.remote_ip_crc = 0xDEAD_BEEF;

        let payload = wire::build_server_init_bb(&[1; SEED_SIZE], &[2; SEED_SIZE]);
        let mut frame = Frame::new(0x03, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(!forwards(&actions));
        let (_, to_server) = sent_frames(&actions);
        assert_eq!(to_server.len(), 1);
        assert_eq!(to_server[0].opcode, 0x93);
        let expected = (0xDEAD_BEEFu32 ^ ADDRESS_CRC_MASK).to_le_bytes();
        assert_eq!(&to_server[0].payload[0x94..0x98], &expected);
        // Only the server-facing ciphers were armed.
        assert!(actions.iter().any(|a| matches!(a, Action::ArmServerIn(_))));
        assert!(!actions.iter().any(|a| matches!(a, Action::ArmClientIn(_))));
    }

    #[test]
    fn bb_fresh_link_forwards_init_and_builds_detector() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Bb);
        st.detector = None;
        let payload = wire::build_server_init_bb(&[1; SEED_SIZE], &[2; SEED_SIZE]);
        let mut frame = Frame::new(0x03, 0, payload);
        let actions = process_frame(&sv, &mut st, true, &mut frame).unwrap();
        assert!(matches!(actions[0], Action::Forward));
        assert!(st.detector.is_some());
        assert_eq!(actions.len(), 5);
    }

    #[test]
    fn outgoing_mail_is_scrubbed_after_terminator() {
        let sv = services();
        let mut st = licensed_state(GameVersion::Gc);
        let mut payload = vec![0u8; 0x40];
        wire::write_u32_at(&mut payload, wire::MAIL_FROM_OFFSET, SERIAL);
        payload[wire::MAIL_TEXT_OFFSET..wire::MAIL_TEXT_OFFSET + 6].copy_from_slice(b"hey\0AB");
        let mut frame = Frame::new(0x81, 0, payload);
        process_frame(&sv, &mut st, false, &mut frame).unwrap();
        assert_eq!(wire::read_u32_at(&frame.payload, wire::MAIL_FROM_OFFSET), REMOTE);
        assert_eq!(
            &frame.payload[wire::MAIL_TEXT_OFFSET..wire::MAIL_TEXT_OFFSET + 6],
            b"hey\0\0\0"
        );
    }
}
