//! Contracts for the collaborators the engine calls out to. The proxy core
//! never implements game policy itself: license lookup, cipher key tables,
//! the port map, item generation, level curves, and disassembly all arrive
//! through these interfaces.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cipher::block::BlockKey;
use crate::lobby::ItemData;

/// A verified account. Licensed sessions are indexed by `serial_number`.
#[derive(Debug, Clone)]
pub struct License {
    pub serial_number: u32,
    pub access_key: String,
    /// Console accounts carry an extra password used by 0xDB verification.
    pub password: String,
    pub username: String,
}

pub trait LicenseAuthority: Send + Sync {
    fn verify_desktop(&self, serial_number: u32, access_key: &str) -> Option<Arc<License>>;
    fn verify_console(&self, serial_number: u32, access_key: &str) -> Option<Arc<License>>;
    fn verify_online(&self, username: &str, password: &str) -> Option<Arc<License>>;
}

/// Candidate key tables for the Bb inbound detector.
pub trait KeyPaletteProvider: Send + Sync {
    fn candidate_keys(&self) -> Vec<Arc<BlockKey>>;
}

/// Listener port lookup by well-known name (`gc-us3`, `bb-login`, ...).
#[derive(Debug, Clone, Default)]
pub struct PortDirectory {
    ports: HashMap<String, u16>,
}

impl PortDirectory {
    pub fn new(ports: HashMap<String, u16>) -> Self {
        Self { ports }
    }

    pub fn insert(&mut self, name: impl Into<String>, port: u16) {
        self.ports.insert(name.into(), port);
    }

    pub fn port_for(&self, name: &str) -> Option<u16> {
        self.ports.get(name).copied()
    }
}

/// Signal from the item creator that no item should drop. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotWanted;

pub trait CommonItemCreator: Send + Sync {
    fn create_drop_item(
        &self,
        from_box: bool,
        episode: u8,
        difficulty: u8,
        area: u8,
        section_id: u8,
    ) -> Result<ItemData, NotWanted>;

    fn create_shop_item(&self, difficulty: u8, shop_type: u8) -> Result<ItemData, NotWanted>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharStats {
    pub atp: u16,
    pub mst: u16,
    pub evp: u16,
    pub hp: u16,
    pub dfp: u16,
    pub ata: u16,
    pub lck: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LevelStats {
    /// Total experience required to hold this level.
    pub experience: u32,
    pub boost: CharStats,
}

impl LevelStats {
    pub fn apply(&self, stats: &mut CharStats) {
        stats.atp += self.boost.atp;
        stats.mst += self.boost.mst;
        stats.evp += self.boost.evp;
        stats.hp += self.boost.hp;
        stats.dfp += self.boost.dfp;
        stats.ata += self.boost.ata;
        stats.lck += self.boost.lck;
    }
}

pub trait LevelTable: Send + Sync {
    fn stats_for_level(&self, char_class: u8, level: u8) -> LevelStats;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RareSpec {
    /// Fixed-point probability out of 2^32.
    pub probability: u32,
    pub item_code: [u8; 3],
}

pub trait RareItemSet: Send + Sync {
    fn rare_for_enemy(&self, enemy_type: u8) -> Option<RareSpec>;
    fn rares_for_box(&self, area: u8) -> Vec<RareSpec>;
}

pub fn sample_rare(probability: u32) -> bool {
    rand::random::<u32>() < probability
}

/// Optional disassembler for intercepted code blobs. Labels map offsets to
/// names (`relocN`, `entry_ptr`, `footer`, `start`).
pub trait Disassembler: Send + Sync {
    fn disassemble(&self, code: &[u8], labels: &std::collections::BTreeMap<u32, Vec<String>>)
        -> String;
}

/// Everything the session engine needs from the outside world.
pub struct Services {
    /// Server name shown in diagnostic chat bubbles.
    pub name: String,
    pub licenses: Arc<dyn LicenseAuthority>,
    pub keys: Arc<dyn KeyPaletteProvider>,
    pub ports: PortDirectory,
    pub save_dir: PathBuf,
    pub disassembler: Option<Arc<dyn Disassembler>>,
}

// ---------------------------------------------------------------------------
// Table-backed implementations used by the runner (and tests)

pub struct StaticLicenseAuthority {
    licenses: Vec<Arc<License>>,
}

impl StaticLicenseAuthority {
    pub fn new(licenses: Vec<License>) -> Self {
        Self {
            licenses: licenses.into_iter().map(Arc::new).collect(),
        }
    }
}

impl LicenseAuthority for StaticLicenseAuthority {
    fn verify_desktop(&self, serial_number: u32, access_key: &str) -> Option<Arc<License>> {
        self.licenses
            .iter()
            .find(|l| l.serial_number == serial_number && l.access_key == access_key)
            .cloned()
    }

    fn verify_console(&self, serial_number: u32, access_key: &str) -> Option<Arc<License>> {
        self.verify_desktop(serial_number, access_key)
    }

    fn verify_online(&self, username: &str, password: &str) -> Option<Arc<License>> {
        self.licenses
            .iter()
            .find(|l| l.username == username && l.password == password)
            .cloned()
    }
}

pub struct StaticKeyPalette {
    keys: Vec<Arc<BlockKey>>,
}

impl StaticKeyPalette {
    pub fn new(keys: Vec<Arc<BlockKey>>) -> Self {
        Self { keys }
    }
}

impl KeyPaletteProvider for StaticKeyPalette {
    fn candidate_keys(&self) -> Vec<Arc<BlockKey>> {
        self.keys.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_authority_matches_on_both_fields() {
        let auth = StaticLicenseAuthority::new(vec![License {
            serial_number: 0x1234_5678,
            access_key: "abcdefgh".into(),
            password: "pw".into(),
            username: "user".into(),
        }]);
        assert!(auth.verify_desktop(0x1234_5678, "abcdefgh").is_some());
        assert!(auth.verify_desktop(0x1234_5678, "wrong").is_none());
        assert!(auth.verify_console(0x9999_9999, "abcdefgh").is_none());
        assert!(auth.verify_online("user", "pw").is_some());
        assert!(auth.verify_online("user", "nope").is_none());
    }

    #[test]
    fn level_stats_apply_accumulates() {
        let level = LevelStats {
            experience: 100,
            boost: CharStats {
                atp: 2,
                hp: 5,
                ..Default::default()
            },
        };
        let mut stats = CharStats::default();
        level.apply(&mut stats);
        level.apply(&mut stats);
        assert_eq!(stats.atp, 4);
        assert_eq!(stats.hp, 10);
    }
}
