//! Lobby and game bookkeeping consumed by the subcommand dispatcher when a
//! Bb room is hosted authoritatively: member slots, player inventories,
//! floor items, and the enemy table used for experience awards.

use std::collections::HashMap;

use crate::version::GameVersion;

pub const MAX_LOBBY_CLIENTS: usize = 12;
pub const MAX_GAME_CLIENTS: usize = 4;
pub const INVENTORY_SLOTS: usize = 30;
pub const MESETA_ITEM_ID: u32 = 0xFFFF_FFFF;
pub const MAX_MESETA: u32 = 999_999;

/// One item as it travels on the wire: twelve bytes of primary data, the
/// per-room item id, and four bytes of secondary data. Stackable tools keep
/// their count in `data1[5]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemData {
    pub data1: [u8; 12],
    pub item_id: u32,
    pub data2: [u8; 4],
}

impl ItemData {
    pub fn is_stackable(&self) -> bool {
        self.data1[0] == 0x03
    }

    pub fn stack_size(&self) -> u32 {
        if self.is_stackable() {
            self.data1[5] as u32
        } else {
            1
        }
    }

    pub fn set_stack_size(&mut self, amount: u32) {
        self.data1[5] = amount as u8;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventoryItem {
    pub game_flags: u32,
    pub data: ItemData,
}

pub const EQUIP_FLAG: u32 = 0x0000_0008;

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub items: Vec<InventoryItem>,
    pub hp_materials_used: u8,
    pub tp_materials_used: u8,
}

impl Inventory {
    pub fn find_item(&self, item_id: u32) -> Option<usize> {
        self.items.iter().position(|i| i.data.item_id == item_id)
    }

    pub fn add_item(&mut self, item: InventoryItem) -> bool {
        if self.items.len() >= INVENTORY_SLOTS {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Removes `amount` of an item. `amount` of zero takes the whole item.
    /// When a stack is split, the returned item carries id
    /// [`MESETA_ITEM_ID`]-style sentinel `0xFFFFFFFF` so the caller knows to
    /// mint a fresh id for the severed part.
    pub fn remove_item(&mut self, item_id: u32, amount: u32) -> Option<InventoryItem> {
        let index = self.find_item(item_id)?;
        let stack = self.items[index].data.stack_size();
        if amount > 0 && self.items[index].data.is_stackable() && amount < stack {
            self.items[index].data.set_stack_size(stack - amount);
            let mut severed = self.items[index];
            severed.data.set_stack_size(amount);
            severed.data.item_id = 0xFFFF_FFFF;
            Some(severed)
        } else {
            Some(self.items.remove(index))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bank {
    pub meseta: u32,
    pub items: Vec<InventoryItem>,
}

impl Bank {
    pub fn add_item(&mut self, item: InventoryItem) {
        self.items.push(item);
    }

    pub fn remove_item(&mut self, item_id: u32, amount: u32) -> Option<InventoryItem> {
        let index = self.items.iter().position(|i| i.data.item_id == item_id)?;
        let stack = self.items[index].data.stack_size();
        if amount > 0 && self.items[index].data.is_stackable() && amount < stack {
            self.items[index].data.set_stack_size(stack - amount);
            let mut severed = self.items[index];
            severed.data.set_stack_size(amount);
            Some(severed)
        } else {
            Some(self.items.remove(index))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerDisp {
    pub level: u8,
    pub experience: u32,
    pub meseta: u32,
    pub char_class: u8,
    pub stats: crate::services::CharStats,
}

/// One connected room member as the dispatcher sees it.
#[derive(Debug, Clone, Default)]
pub struct LobbyClient {
    pub lobby_client_id: u8,
    pub guild_card_number: u32,
    pub name: String,
    pub episode_3: bool,
    pub can_chat: bool,
    pub infinite_hp: bool,
    pub infinite_tp: bool,
    pub area: u32,
    pub disp: PlayerDisp,
    pub inventory: Inventory,
    pub bank: Bank,
    pub shop_contents: Vec<ItemData>,
    pub identify_result: Option<InventoryItem>,
}

impl LobbyClient {
    pub fn new(lobby_client_id: u8) -> Self {
        Self {
            lobby_client_id,
            can_chat: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Enemy {
    pub hit_flags: u8,
    pub last_hit: u8,
    pub experience: u32,
    pub rt_index: u32,
}

pub const ENEMY_DEFEATED_FLAG: u8 = 0x80;

pub struct Lobby {
    pub version: GameVersion,
    pub is_game: bool,
    pub episode: u8,
    pub difficulty: u8,
    pub section_id: u8,
    pub episode_3: bool,
    pub cheats_enabled: bool,
    pub any_client_loading: bool,
    pub clients: Vec<Option<LobbyClient>>,
    pub floor_items: HashMap<u32, InventoryItem>,
    pub next_drop_item: Option<InventoryItem>,
    pub enemies: Vec<Enemy>,
    next_item_id: u32,
}

impl Lobby {
    pub fn new(version: GameVersion, is_game: bool) -> Self {
        let max = if is_game {
            MAX_GAME_CLIENTS
        } else {
            MAX_LOBBY_CLIENTS
        };
        Self {
            version,
            is_game,
            episode: 1,
            difficulty: 0,
            section_id: 0,
            episode_3: false,
            cheats_enabled: false,
            any_client_loading: false,
            clients: vec![None; max],
            floor_items: HashMap::new(),
            next_drop_item: None,
            enemies: Vec::new(),
            next_item_id: 0x0001_0000,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, id: u8) -> Option<&LobbyClient> {
        self.clients.get(id as usize).and_then(|c| c.as_ref())
    }

    pub fn client_mut(&mut self, id: u8) -> Option<&mut LobbyClient> {
        self.clients.get_mut(id as usize).and_then(|c| c.as_mut())
    }

    pub fn generate_item_id(&mut self) -> u32 {
        let id = self.next_item_id;
        self.next_item_id += 1;
        id
    }

    pub fn add_floor_item(&mut self, item: InventoryItem) {
        self.floor_items.insert(item.data.item_id, item);
    }

    pub fn take_floor_item(&mut self, item_id: u32) -> Option<InventoryItem> {
        self.floor_items.remove(&item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stacked_tool(item_id: u32, count: u8) -> InventoryItem {
        let mut item = InventoryItem::default();
        item.data.data1[0] = 0x03;
        item.data.data1[5] = count;
        item.data.item_id = item_id;
        item
    }

    #[test]
    fn stack_split_keeps_original_and_flags_severed_part() {
        let mut inv = Inventory::default();
        inv.add_item(stacked_tool(0x1000, 10));
        let severed = inv.remove_item(0x1000, 5).unwrap();
        assert_eq!(severed.data.item_id, 0xFFFF_FFFF);
        assert_eq!(severed.data.stack_size(), 5);
        let index = inv.find_item(0x1000).unwrap();
        assert_eq!(inv.items[index].data.stack_size(), 5);
    }

    #[test]
    fn removing_whole_stack_leaves_no_item() {
        let mut inv = Inventory::default();
        inv.add_item(stacked_tool(0x1000, 10));
        let taken = inv.remove_item(0x1000, 10).unwrap();
        assert_eq!(taken.data.item_id, 0x1000);
        assert!(inv.find_item(0x1000).is_none());
    }

    #[test]
    fn item_ids_are_unique_per_room() {
        let mut lobby = Lobby::new(GameVersion::Bb, true);
        let a = lobby.generate_item_id();
        let b = lobby.generate_item_id();
        assert_ne!(a, b);
    }
}
