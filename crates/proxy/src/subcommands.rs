//! The nested "game command" layer carried inside opcodes
//! 0x60/0x62/0x6C/0x6D/0xC9/0xCB. The first payload byte is the subcommand
//! opcode, the second its declared size in 4-byte units, the third usually
//! the sender's slot id. A fixed 256-entry table decides, per subcommand,
//! whether to forward (and under which guard) or to run a handler; on Bb
//! the item/experience subcommands are authoritative and mutate the lobby.

use std::sync::OnceLock;

use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};

use crate::frame::Frame;
use crate::lobby::{
    Enemy, InventoryItem, ItemData, Lobby, ENEMY_DEFEATED_FLAG, EQUIP_FLAG, MAX_MESETA,
    MESETA_ITEM_ID,
};
use crate::services::{CommonItemCreator, LevelTable, RareItemSet, sample_rare};
use crate::version::GameVersion;

// Subcommand opcodes the session layer also cares about.
pub const SUB_SWITCH_CHANGED: u8 = 0x05;
pub const SUB_SEND_GUILD_CARD: u8 = 0x06;
pub const SUB_HIT_BY_MONSTER: u8 = 0x2F;
pub const SUB_HIT_BY_MONSTER_2: u8 = 0x4C;
pub const SUB_CAST_TECHNIQUE: u8 = 0x48;
pub const SUB_STAT_CHANGE: u8 = 0x9A;

/// 6x05 switch-activation layout.
pub const SWITCH_PAYLOAD_SIZE: usize = 12;
pub const SWITCH_ID_OFFSET: usize = 4;
pub const SWITCH_ENABLED_OFFSET: usize = 11;
pub const SWITCH_ID_NONE: u16 = 0xFFFF;

/// 6x06 guild-card transfer: number offset within the subcommand payload.
pub const GUILD_CARD_NUMBER_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatChange {
    SubtractTp = 0,
    SubtractHp = 1,
    SubtractMeseta = 2,
    AddHp = 3,
    AddTp = 4,
}

/// One 6x9A stat change: two dwords.
pub fn build_stat_change(client_id: u8, kind: StatChange, amount: u8) -> [u8; 8] {
    [
        SUB_STAT_CHANGE,
        0x02,
        client_id,
        0x00,
        0x00,
        0x00,
        kind as u8,
        amount,
    ]
}

/// Stacked 6x9A changes restoring `total` in chunks of at most 255.
pub fn build_stat_change_burst(client_id: u8, kind: StatChange, total: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let chunk = remaining.min(0xFF) as u8;
        out.extend_from_slice(&build_stat_change(client_id, kind, chunk));
        remaining -= chunk as u32;
    }
    out
}

/// Game-side collaborators the authoritative handlers consult.
#[derive(Default, Clone, Copy)]
pub struct GameServices<'a> {
    pub items: Option<&'a dyn CommonItemCreator>,
    pub levels: Option<&'a dyn LevelTable>,
    pub rares: Option<&'a dyn RareItemSet>,
}

/// A frame the dispatcher wants delivered to one room member.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub client_id: u8,
    pub frame: Frame,
}

type SubHandler = fn(&GameServices, &mut Lobby, u8, u8, u8, &[u8], &mut Vec<Outgoing>);

/// Forwarding policy per subcommand opcode.
#[derive(Clone, Copy)]
enum Policy {
    /// Opcode zero and a couple of others are never valid on the wire.
    Invalid,
    /// Nothing installed; logged and forwarded as-is.
    Unimplemented,
    Forward,
    CheckSize,
    CheckGame,
    CheckGameLoading,
    CheckSizeClient,
    CheckSizeGame,
    CheckSizeEp3Lobby,
    Handler(SubHandler),
}

fn command_is_private(command: u8) -> bool {
    command == 0x62 || command == 0x6D
}

fn command_is_ep3(command: u8) -> bool {
    (command & 0xF0) == 0xC0
}

fn declared_size(payload: &[u8]) -> usize {
    payload[1] as usize
}

/// Routes one subcommand to its targets: private variants go to exactly the
/// slot named by the frame flag, public ones fan out to the room except the
/// sender; episode-3 subcommands only ever reach episode-3 members.
pub fn forward_subcommand(
    lobby: &Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    let ep3 = command_is_ep3(command);
    if ep3 && !lobby.client(sender).map(|c| c.episode_3).unwrap_or(false) {
        return;
    }

    let frame = Frame::new(command as u16, flag as u32, payload.to_vec());
    if command_is_private(command) {
        if flag as usize >= lobby.max_clients() {
            return;
        }
        let Some(target) = lobby.client(flag) else {
            return;
        };
        if ep3 && !target.episode_3 {
            return;
        }
        out.push(Outgoing {
            client_id: flag,
            frame,
        });
    } else {
        for client in lobby.clients.iter().flatten() {
            if client.lobby_client_id == sender {
                continue;
            }
            if ep3 && !client.episode_3 {
                continue;
            }
            out.push(Outgoing {
                client_id: client.lobby_client_id,
                frame: frame.clone(),
            });
        }
    }
}

fn broadcast(lobby: &Lobby, command: u8, payload: Vec<u8>, out: &mut Vec<Outgoing>) {
    let frame = Frame::new(command as u16, 0, payload);
    for client in lobby.clients.iter().flatten() {
        out.push(Outgoing {
            client_id: client.lobby_client_id,
            frame: frame.clone(),
        });
    }
}

pub fn subcommand_is_implemented(opcode: u8) -> bool {
    !matches!(table()[opcode as usize], Policy::Unimplemented)
}

/// Entry point: one subcommand frame from `sender`, already stripped to its
/// payload. Returns the frames to deliver to room members.
pub fn dispatch(
    services: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
) -> Vec<Outgoing> {
    let mut out = Vec::new();
    if payload.len() < 4 || payload.len() % 4 != 0 {
        warn!(
            "subs.malformed sender={} command={:02X} len={}",
            sender,
            command,
            payload.len()
        );
        return out;
    }
    let opcode = payload[0];
    let count = payload.len() / 4;

    match table()[opcode as usize] {
        Policy::Invalid => {
            warn!("subs.invalid opcode={opcode:02X} count={count}");
        }
        Policy::Unimplemented => {
            warn!("subs.unimplemented opcode={opcode:02X} count={count}");
            forward_subcommand(lobby, sender, command, flag, payload, &mut out);
        }
        Policy::Forward => forward_subcommand(lobby, sender, command, flag, payload, &mut out),
        Policy::CheckSize => {
            if declared_size(payload) == count {
                forward_subcommand(lobby, sender, command, flag, payload, &mut out);
            }
        }
        Policy::CheckGame => {
            if lobby.is_game {
                forward_subcommand(lobby, sender, command, flag, payload, &mut out);
            }
        }
        Policy::CheckGameLoading => {
            if lobby.is_game && lobby.any_client_loading {
                forward_subcommand(lobby, sender, command, flag, payload, &mut out);
            }
        }
        Policy::CheckSizeClient => {
            if declared_size(payload) == count && payload[2] == sender {
                forward_subcommand(lobby, sender, command, flag, payload, &mut out);
            }
        }
        Policy::CheckSizeGame => {
            if lobby.is_game && declared_size(payload) == count {
                forward_subcommand(lobby, sender, command, flag, payload, &mut out);
            }
        }
        Policy::CheckSizeEp3Lobby => {
            if lobby.episode_3 && !lobby.is_game && declared_size(payload) == count {
                forward_subcommand(lobby, sender, command, flag, payload, &mut out);
            }
        }
        Policy::Handler(handler) => {
            handler(services, lobby, sender, command, flag, payload, &mut out)
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Handlers

fn sub_send_guild_card(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    let count = payload.len() / 4;
    if count < 9
        || !command_is_private(command)
        || flag as usize >= lobby.max_clients()
        || lobby.client(flag).is_none()
        || declared_size(payload) != count
    {
        return;
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_symbol_chat(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    let count = payload.len() / 4;
    let can_chat = lobby.client(sender).map(|c| c.can_chat).unwrap_or(false);
    if !can_chat || declared_size(payload) != count || count < 2 || payload[4] != sender {
        return;
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_word_select(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    let count = payload.len() / 4;
    let can_chat = lobby.client(sender).map(|c| c.can_chat).unwrap_or(false);
    if !can_chat || declared_size(payload) != count || count < 8 || payload[2] != sender {
        return;
    }
    for x in 1..8 {
        let lo = LittleEndian::read_u16(&payload[x * 4..x * 4 + 2]);
        let hi = LittleEndian::read_u16(&payload[x * 4 + 2..x * 4 + 4]);
        for word in [lo, hi] {
            if word > 0x1863 && word != 0xFFFF {
                return;
            }
        }
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_change_area(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    let count = payload.len() / 4;
    if !lobby.is_game || declared_size(payload) != count || count < 2 {
        return;
    }
    let area = LittleEndian::read_u32(&payload[4..8]);
    if let Some(client) = lobby.client_mut(sender) {
        client.area = area;
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_hit_by_monster(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if !lobby.is_game || payload[2] != sender {
        return;
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_use_technique(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    let count = payload.len() / 4;
    if !lobby.is_game || declared_size(payload) != count || payload[2] != sender {
        return;
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_monster_hit(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version == GameVersion::Bb {
        if payload.len() < 12 || declared_size(payload) != payload.len() / 4 {
            return;
        }
        let enemy_id = LittleEndian::read_u16(&payload[4..6]) as usize;
        let Some(enemy) = lobby.enemies.get_mut(enemy_id) else {
            return;
        };
        if enemy.hit_flags & ENEMY_DEFEATED_FLAG != 0 {
            return;
        }
        enemy.hit_flags |= 1 << sender;
        enemy.last_hit = sender;
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_monster_killed(
    sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    forward_subcommand(lobby, sender, command, flag, payload, out);

    if lobby.version != GameVersion::Bb || !lobby.is_game {
        return;
    }
    if payload.len() < 12 || declared_size(payload) != 3 {
        return;
    }
    let enemy_id = LittleEndian::read_u16(&payload[4..6]) as usize;
    let Some(enemy) = lobby.enemies.get(enemy_id).copied() else {
        return;
    };
    if enemy.hit_flags & ENEMY_DEFEATED_FLAG != 0 {
        return;
    }
    if enemy.experience == 0xFFFF_FFFF {
        warn!("subs.kill.unknown_enemy enemy_id={enemy_id}");
        return;
    }
    lobby.enemies[enemy_id].hit_flags |= ENEMY_DEFEATED_FLAG;

    let Some(levels) = sv.levels else {
        return;
    };
    let ids: Vec<u8> = lobby
        .clients
        .iter()
        .flatten()
        .map(|c| c.lobby_client_id)
        .collect();
    for id in ids {
        if (enemy.hit_flags >> id) & 1 == 0 {
            continue;
        }
        let Some(client) = lobby.client_mut(id) else {
            continue;
        };
        if client.disp.level >= 199 {
            continue;
        }
        // Whoever landed the last hit gets full experience, helpers 77%.
        let exp = if enemy.last_hit == id {
            enemy.experience
        } else {
            enemy.experience * 77 / 100
        };
        client.disp.experience += exp;

        let mut give = vec![0xBF, 0x02, id, 0x00];
        give.extend_from_slice(&exp.to_le_bytes());
        let char_class = client.disp.char_class;

        let mut leveled_up = false;
        while client.disp.level < 199 {
            let next = levels.stats_for_level(char_class, client.disp.level + 1);
            if client.disp.experience < next.experience {
                break;
            }
            next.apply(&mut client.disp.stats);
            client.disp.level += 1;
            leveled_up = true;
        }
        let level = client.disp.level;
        broadcast(lobby, command, give, out);
        if leveled_up {
            broadcast(
                lobby,
                command,
                vec![0x30, 0x02, id, 0x00, level, 0x00, 0x00, 0x00],
                out,
            );
        }
    }
}

fn sub_drop_item(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version == GameVersion::Bb {
        if payload.len() != 24 || declared_size(payload) != 6 || payload[2] != sender {
            return;
        }
        let item_id = LittleEndian::read_u32(&payload[8..12]);
        let Some(item) = lobby
            .client_mut(sender)
            .and_then(|c| c.inventory.remove_item(item_id, 0))
        else {
            return;
        };
        lobby.add_floor_item(item);
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_drop_stacked_item(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb {
        forward_subcommand(lobby, sender, command, flag, payload, out);
        return;
    }
    if !lobby.is_game || payload.len() != 24 || declared_size(payload) != 6 || payload[2] != sender
    {
        return;
    }
    let area = LittleEndian::read_u16(&payload[4..6]);
    let x = &payload[8..12];
    let y = &payload[12..16];
    let item_id = LittleEndian::read_u32(&payload[16..20]);
    let amount = LittleEndian::read_u32(&payload[20..24]);

    let Some(mut item) = lobby
        .client_mut(sender)
        .and_then(|c| c.inventory.remove_item(item_id, amount))
    else {
        return;
    };
    // A split stack leaves the original item alive, so the severed part
    // needs a fresh id.
    if item.data.item_id == 0xFFFF_FFFF {
        item.data.item_id = lobby.generate_item_id();
    }
    lobby.add_floor_item(item);

    let mut drop = vec![0x5D, 0x09, 0x00, 0x00];
    drop.extend_from_slice(&area.to_le_bytes());
    drop.extend_from_slice(&[0, 0]);
    drop.extend_from_slice(x);
    drop.extend_from_slice(y);
    drop.extend_from_slice(&item.data.data1);
    drop.extend_from_slice(&item.data.item_id.to_le_bytes());
    drop.extend_from_slice(&item.data.data2);
    broadcast(lobby, 0x60, drop, out);
}

fn sub_pick_up_item(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb {
        forward_subcommand(lobby, sender, command, flag, payload, out);
        return;
    }
    if !lobby.is_game || payload.len() != 12 || declared_size(payload) != 3 || payload[2] != sender
    {
        return;
    }
    let item_id = LittleEndian::read_u32(&payload[4..8]);
    let area = payload[8];
    let Some(item) = lobby.take_floor_item(item_id) else {
        warn!("subs.pickup.missing_item item_id={item_id:08X}");
        return;
    };
    if let Some(client) = lobby.client_mut(sender) {
        client.inventory.add_item(item);
    }

    let mut pickup = vec![0x59, 0x03, sender, 0x00];
    pickup.extend_from_slice(&item.data.item_id.to_le_bytes());
    pickup.extend_from_slice(&[area, 0, 0, 0]);
    broadcast(lobby, 0x60, pickup, out);
}

fn sub_equip_unequip(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb {
        forward_subcommand(lobby, sender, command, flag, payload, out);
        return;
    }
    if payload.len() != 12 || declared_size(payload) != 3 || payload[2] != sender {
        return;
    }
    let opcode = payload[0];
    let item_id = LittleEndian::read_u32(&payload[4..8]);
    let Some(client) = lobby.client_mut(sender) else {
        return;
    };
    let Some(index) = client.inventory.find_item(item_id) else {
        return;
    };
    if opcode == 0x25 {
        client.inventory.items[index].game_flags |= EQUIP_FLAG;
    } else {
        client.inventory.items[index].game_flags &= !EQUIP_FLAG;
    }
}

fn sub_use_item(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version == GameVersion::Bb {
        if payload.len() < 8 || declared_size(payload) != 2 || payload[2] != sender {
            return;
        }
        let item_id = LittleEndian::read_u32(&payload[4..8]);
        if let Some(client) = lobby.client_mut(sender) {
            // Consume one from the stack, or the whole item.
            client.inventory.remove_item(item_id, 1);
        }
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_open_shop(
    sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.episode_3 {
        if payload.len() >= 8 {
            forward_subcommand(lobby, sender, command, flag, payload, out);
        }
        return;
    }
    if lobby.version != GameVersion::Bb || !lobby.is_game || payload.len() < 8 {
        return;
    }
    let shop_type = LittleEndian::read_u32(&payload[4..8]);
    let Some(items) = sv.items else {
        return;
    };
    let category = match shop_type {
        0 => 3, // tools
        1 => 0, // weapons
        2 => 1, // guards
        _ => return,
    };

    let difficulty = lobby.difficulty;
    let num_items = (rand::random::<u32>() % 4 + 9) as usize;
    let mut contents: Vec<ItemData> = Vec::new();
    while contents.len() < num_items {
        let Ok(mut item) = items.create_shop_item(difficulty, category) else {
            break;
        };
        item.item_id = lobby.generate_item_id();
        contents.push(item);
    }

    let mut body = vec![0xB6, 0x00, 0x00, 0x00];
    body.push(shop_type as u8);
    body.push(contents.len() as u8);
    body.extend_from_slice(&[0, 0]);
    for item in &contents {
        body.extend_from_slice(&item.data1);
        body.extend_from_slice(&item.item_id.to_le_bytes());
        body.extend_from_slice(&item.data2);
    }
    body[1] = (body.len() / 4) as u8;
    if let Some(client) = lobby.client_mut(sender) {
        client.shop_contents = contents;
    }
    out.push(Outgoing {
        client_id: sender,
        frame: Frame::new(0x60, 0, body),
    });
}

fn sub_open_bank(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    _command: u8,
    _flag: u8,
    _payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb || !lobby.is_game {
        return;
    }
    let Some(client) = lobby.client(sender) else {
        return;
    };
    let mut body = vec![0xBC, 0x00, 0x00, 0x00];
    body.extend_from_slice(&client.bank.meseta.to_le_bytes());
    body.extend_from_slice(&(client.bank.items.len() as u32).to_le_bytes());
    for item in &client.bank.items {
        body.extend_from_slice(&item.data.data1);
        body.extend_from_slice(&item.data.item_id.to_le_bytes());
        body.extend_from_slice(&item.data.data2);
    }
    body[1] = (body.len() / 4) as u8;
    out.push(Outgoing {
        client_id: sender,
        frame: Frame::new(0x60, 0, body),
    });
}

fn sub_bank_action(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    _command: u8,
    _flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb || !lobby.is_game {
        return;
    }
    if payload.len() != 16 || declared_size(payload) != 4 {
        return;
    }
    let item_id = LittleEndian::read_u32(&payload[4..8]);
    let meseta_amount = LittleEndian::read_u32(&payload[8..12]);
    let action = payload[12];
    let item_amount = payload[13] as u32;

    match action {
        // Deposit
        0 => {
            if item_id == MESETA_ITEM_ID {
                let Some(client) = lobby.client_mut(sender) else {
                    return;
                };
                if meseta_amount > client.disp.meseta
                    || client.bank.meseta + meseta_amount > MAX_MESETA
                {
                    return;
                }
                client.bank.meseta += meseta_amount;
                client.disp.meseta -= meseta_amount;
            } else {
                let Some(item) = lobby
                    .client_mut(sender)
                    .and_then(|c| c.inventory.remove_item(item_id, item_amount))
                else {
                    return;
                };
                if let Some(client) = lobby.client_mut(sender) {
                    client.bank.add_item(item);
                }
                let mut destroy = vec![0x29, 0x03, sender, 0x00];
                destroy.extend_from_slice(&item_id.to_le_bytes());
                destroy.extend_from_slice(&item_amount.to_le_bytes());
                broadcast(lobby, 0x60, destroy, out);
            }
        }
        // Take
        1 => {
            if item_id == MESETA_ITEM_ID {
                let Some(client) = lobby.client_mut(sender) else {
                    return;
                };
                if meseta_amount > client.bank.meseta
                    || client.disp.meseta + meseta_amount > MAX_MESETA
                {
                    return;
                }
                client.bank.meseta -= meseta_amount;
                client.disp.meseta += meseta_amount;
            } else {
                let Some(mut item) = lobby
                    .client_mut(sender)
                    .and_then(|c| c.bank.remove_item(item_id, item_amount))
                else {
                    return;
                };
                item.data.item_id = lobby.generate_item_id();
                if let Some(client) = lobby.client_mut(sender) {
                    client.inventory.add_item(item);
                }
                let mut create = vec![0xBE, 0x06, sender, 0x00];
                create.extend_from_slice(&item.data.data1);
                create.extend_from_slice(&item.data.item_id.to_le_bytes());
                create.extend_from_slice(&item.data.data2);
                broadcast(lobby, 0x60, create, out);
            }
        }
        _ => {}
    }
}

fn sub_sort_inventory(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    _command: u8,
    _flag: u8,
    payload: &[u8],
    _out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb {
        return;
    }
    if payload.len() != 124 || declared_size(payload) != 31 {
        return;
    }
    let Some(client) = lobby.client_mut(sender) else {
        return;
    };
    let mut sorted = Vec::with_capacity(client.inventory.items.len());
    for x in 0..30 {
        let id = LittleEndian::read_u32(&payload[4 + x * 4..8 + x * 4]);
        if id == 0xFFFF_FFFF {
            continue;
        }
        if let Some(index) = client.inventory.find_item(id) {
            sorted.push(client.inventory.items[index]);
        }
    }
    client.inventory.items = sorted;
}

fn roll_drop(
    sv: &GameServices,
    lobby: &mut Lobby,
    from_box: bool,
    area: u8,
    rare: Option<crate::services::RareSpec>,
) -> Option<InventoryItem> {
    if let Some(item) = lobby.next_drop_item.take() {
        return Some(item);
    }
    let mut item = InventoryItem::default();
    if let Some(spec) = rare {
        item.data.data1[..3].copy_from_slice(&spec.item_code);
        if item.data.data1[0] == 0 {
            // Rare weapons drop unidentified.
            item.data.data1[4] |= 0x80;
        }
    } else {
        let items = sv.items?;
        match items.create_drop_item(from_box, lobby.episode, lobby.difficulty, area, lobby.section_id)
        {
            Ok(data) => item.data = data,
            Err(_) => return None,
        }
    }
    Some(item)
}

fn push_drop(lobby: &Lobby, area: u8, request_id: u16, x: &[u8], y: &[u8], item: &InventoryItem, out: &mut Vec<Outgoing>) {
    let mut drop = vec![0x5F, 0x09, 0x00, 0x00];
    drop.push(area);
    drop.push(0);
    drop.extend_from_slice(&request_id.to_le_bytes());
    drop.extend_from_slice(x);
    drop.extend_from_slice(y);
    drop.extend_from_slice(&item.data.data1);
    drop.extend_from_slice(&item.data.item_id.to_le_bytes());
    drop.extend_from_slice(&item.data.data2);
    broadcast(lobby, 0x60, drop, out);
}

fn sub_enemy_drop_item(
    sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb {
        forward_subcommand(lobby, sender, command, flag, payload, out);
        return;
    }
    if !lobby.is_game || payload.len() != 24 || declared_size(payload) != 6 {
        return;
    }
    let area = payload[4];
    let monster_id = payload[5];
    let request_id = LittleEndian::read_u16(&payload[6..8]);

    let rare = sv
        .rares
        .filter(|_| monster_id <= 0x65)
        .and_then(|r| r.rare_for_enemy(monster_id))
        .filter(|spec| sample_rare(spec.probability));
    let Some(mut item) = roll_drop(sv, lobby, false, area, rare) else {
        return;
    };
    item.data.item_id = lobby.generate_item_id();
    lobby.add_floor_item(item);
    push_drop(lobby, area, request_id, &payload[8..12], &payload[12..16], &item, out);
}

fn sub_box_drop_item(
    sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb {
        forward_subcommand(lobby, sender, command, flag, payload, out);
        return;
    }
    if !lobby.is_game || payload.len() != 40 || declared_size(payload) != 10 {
        return;
    }
    let area = payload[4];
    let request_id = LittleEndian::read_u16(&payload[6..8]);

    let rare = sv.rares.and_then(|r| {
        r.rares_for_box(area)
            .into_iter()
            .find(|spec| sample_rare(spec.probability))
    });
    let Some(mut item) = roll_drop(sv, lobby, true, area, rare) else {
        return;
    };
    item.data.item_id = lobby.generate_item_id();
    lobby.add_floor_item(item);
    push_drop(lobby, area, request_id, &payload[8..12], &payload[12..16], &item, out);
}

fn sub_destroy_item(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version == GameVersion::Bb {
        if !lobby.is_game || payload.len() != 12 || declared_size(payload) != 3 {
            return;
        }
        let item_id = LittleEndian::read_u32(&payload[4..8]);
        lobby.take_floor_item(item_id);
    }
    forward_subcommand(lobby, sender, command, flag, payload, out);
}

fn sub_identify_item(
    _sv: &GameServices,
    lobby: &mut Lobby,
    sender: u8,
    command: u8,
    flag: u8,
    payload: &[u8],
    out: &mut Vec<Outgoing>,
) {
    if lobby.version != GameVersion::Bb {
        forward_subcommand(lobby, sender, command, flag, payload, out);
        return;
    }
    if !lobby.is_game || payload.len() != 12 || declared_size(payload) != 3 || payload[2] != sender
    {
        return;
    }
    let item_id = LittleEndian::read_u32(&payload[4..8]);
    let Some(client) = lobby.client_mut(sender) else {
        return;
    };
    let Some(index) = client.inventory.find_item(item_id) else {
        return;
    };
    if client.inventory.items[index].data.data1[0] != 0 {
        // Only weapons can be identified.
        return;
    }
    client.disp.meseta = client.disp.meseta.saturating_sub(100);
    let mut result = client.inventory.items[index];
    result.data.data1[4] &= 0x7F;
    client.identify_result = Some(result);

    let mut body = vec![0xB9, 0x06, sender, 0x00];
    body.extend_from_slice(&result.data.data1);
    body.extend_from_slice(&result.data.item_id.to_le_bytes());
    body.extend_from_slice(&result.data.data2);
    broadcast(lobby, 0x60, body, out);
}

// ---------------------------------------------------------------------------
// The table

static TABLE: OnceLock<[Policy; 0x100]> = OnceLock::new();

fn table() -> &'static [Policy; 0x100] {
    TABLE.get_or_init(build_table)
}

fn build_table() -> [Policy; 0x100] {
    use Policy::*;
    let mut t = [Unimplemented; 0x100];

    t[0x00] = Invalid;
    t[0x73] = Invalid;

    for op in [
        0x05, 0x0B, 0x0C, 0x0D, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1C, 0x24,
        0x28, 0x29, 0x2B, 0x30, 0x31, 0x32, 0x33, 0x37, 0x39, 0x3A, 0x53, 0x58, 0x59, 0x5D,
        0x5E, 0x5F, 0x61, 0x66, 0x67, 0x68, 0x69, 0x6A, 0x75, 0x76, 0x77, 0x7C, 0x7D, 0x80,
        0x83, 0x84, 0x85, 0x86, 0x88, 0x89, 0x91, 0x93, 0x94, 0x9A, 0x9C, 0x9F, 0xA0, 0xA3,
        0xA4, 0xA5, 0xA8, 0xA9, 0xAA, 0xAD, 0xCF,
    ] {
        t[op] = CheckSizeGame;
    }
    for op in [
        0x1F, 0x20, 0x2C, 0x2D, 0x3B, 0x3E, 0x3F, 0x40, 0x42, 0x52, 0x79, 0xA6,
    ] {
        t[op] = CheckSize;
    }
    for op in [
        0x22, 0x23, 0x43, 0x44, 0x45, 0x46, 0x47, 0x49, 0x4A, 0x4D, 0x4E, 0x4F, 0x50, 0x55,
        0x56, 0x57, 0x8D, 0xAB, 0xAE, 0xAF, 0xB0,
    ] {
        t[op] = CheckSizeClient;
    }
    t[0x36] = CheckGame;
    for op in [0x6B, 0x6C, 0x6D, 0x6E, 0x6F, 0x70, 0x71, 0x72] {
        t[op] = CheckGameLoading;
    }
    t[0xBF] = CheckSizeEp3Lobby;

    t[0x06] = Handler(sub_send_guild_card);
    t[0x07] = Handler(sub_symbol_chat);
    t[0x0A] = Handler(sub_monster_hit);
    t[0x21] = Handler(sub_change_area);
    t[0x25] = Handler(sub_equip_unequip);
    t[0x26] = Handler(sub_equip_unequip);
    t[0x27] = Handler(sub_use_item);
    t[0x2A] = Handler(sub_drop_item);
    t[0x2F] = Handler(sub_hit_by_monster);
    t[0x48] = Handler(sub_use_technique);
    t[0x4B] = Handler(sub_monster_hit);
    t[0x4C] = Handler(sub_monster_hit);
    t[0x5A] = Handler(sub_pick_up_item);
    t[0x60] = Handler(sub_enemy_drop_item);
    t[0x63] = Handler(sub_destroy_item);
    t[0x74] = Handler(sub_word_select);
    t[0xA2] = Handler(sub_box_drop_item);
    t[0xB5] = Handler(sub_open_shop);
    t[0xB8] = Handler(sub_identify_item);
    t[0xBB] = Handler(sub_open_bank);
    t[0xBD] = Handler(sub_bank_action);
    t[0xC3] = Handler(sub_drop_stacked_item);
    t[0xC4] = Handler(sub_sort_inventory);
    t[0xC8] = Handler(sub_monster_killed);
    // The accept-identified-item handler is written but its opcode has never
    // been observed; it stays out of the table until it is.

    t
}

/// Populates a lobby's enemy table from map data, used by the authoritative
/// kill/experience path.
pub fn install_enemies(lobby: &mut Lobby, enemies: Vec<Enemy>) {
    info!("subs.enemies.installed count={}", enemies.len());
    lobby.enemies = enemies;
}
