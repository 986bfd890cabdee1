//! Persistence binding and the fixed-layout configuration blob.
//!
//! The whole registry persists as one fixed-size block: the application
//! table, the gate table (pipe membership as a slot bitmask on disk),
//! the pipe table, and the admin/link/identity static-gate state. The
//! `NvStore` trait abstracts the asynchronous non-volatile storage that
//! actually holds the block.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::RwLock;
use tracing::warn;

use crate::errors::StoreError;
use crate::registry::{
    AppEntry, Gate, Pipe, Registry, MAX_APPS, MAX_APP_NAME_LEN, MAX_GATES, MAX_PIPES,
};
use crate::types::{AppHandle, PipeState, SESSION_ID_LEN};

/// Block id of the configuration blob.
pub const NV_BLOCK_CONFIG: u8 = 0x01;

/// Size of the configuration blob:
/// apps 5*(16+1) + gates 20*(1+1+4) + pipes 20*5 + admin 9 + link 2 +
/// identity bitmask 4.
pub const NV_CONFIG_SIZE: usize =
    MAX_APPS * (MAX_APP_NAME_LEN + 1) + MAX_GATES * 6 + MAX_PIPES * 5 + 9 + 2 + 4;

const OWNER_NONE: u8 = 0xFF;

// ============================================================================
// NvStore Trait
// ============================================================================

/// Asynchronous read/write of fixed-size configuration blocks.
#[async_trait]
pub trait NvStore: Send + Sync {
    /// Read a block. `Ok(None)` means the block was never written.
    async fn read(&self, block: u8, len: usize) -> Result<Option<Bytes>, StoreError>;

    /// Write a block, replacing any previous content.
    async fn write(&self, block: u8, data: Bytes) -> Result<(), StoreError>;
}

/// In-memory store for tests and first-boot defaults.
#[derive(Default)]
pub struct InMemoryNvStore {
    blocks: RwLock<HashMap<u8, Bytes>>,
}

impl InMemoryNvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a block, bypassing the trait (test setup).
    pub async fn seed(&self, block: u8, data: Bytes) {
        self.blocks.write().await.insert(block, data);
    }
}

#[async_trait]
impl NvStore for InMemoryNvStore {
    async fn read(&self, block: u8, len: usize) -> Result<Option<Bytes>, StoreError> {
        let blocks = self.blocks.read().await;
        Ok(blocks.get(&block).map(|b| {
            let take = b.len().min(len);
            b.slice(..take)
        }))
    }

    async fn write(&self, block: u8, data: Bytes) -> Result<(), StoreError> {
        self.blocks.write().await.insert(block, data);
        Ok(())
    }
}

// ============================================================================
// Blob codec
// ============================================================================

/// Serialize the registry into the fixed blob layout.
pub fn encode_config(reg: &Registry) -> Bytes {
    let mut buf = BytesMut::with_capacity(NV_CONFIG_SIZE);

    for slot in 0..MAX_APPS {
        match &reg.apps[slot] {
            Some(app) => {
                let mut name = [0u8; MAX_APP_NAME_LEN];
                name[..app.name.len()].copy_from_slice(app.name.as_bytes());
                buf.put_slice(&name);
                buf.put_u8(app.connectivity_events as u8);
            }
            None => {
                buf.put_bytes(0, MAX_APP_NAME_LEN);
                buf.put_u8(0);
            }
        }
    }

    for slot in 0..MAX_GATES {
        match &reg.gates[slot] {
            Some(gate) => {
                buf.put_u8(gate.id);
                buf.put_u8(gate.owner.map(|a| a.0).unwrap_or(OWNER_NONE));
                buf.put_u32_le(slot_mask(&gate.pipe_slots));
            }
            None => {
                buf.put_u8(0);
                buf.put_u8(OWNER_NONE);
                buf.put_u32_le(0);
            }
        }
    }

    for slot in 0..MAX_PIPES {
        match &reg.pipes[slot] {
            Some(pipe) => {
                buf.put_u8(pipe.id);
                buf.put_u8(pipe.state.to_byte());
                buf.put_u8(pipe.local_gate);
                buf.put_u8(pipe.dest_host);
                buf.put_u8(pipe.dest_gate);
            }
            None => buf.put_bytes(0, 5),
        }
    }

    buf.put_u8(reg.admin_pipe_state.to_byte());
    buf.put_slice(&reg.session_id);
    buf.put_u8(reg.link_pipe_state.to_byte());
    buf.put_u8(reg.link_rec_errors);
    buf.put_u32_le(slot_mask(&reg.identity_pipe_slots));

    debug_assert_eq!(buf.len(), NV_CONFIG_SIZE);
    buf.freeze()
}

/// Decode and validate a persisted blob.
///
/// Any inconsistency returns `None`: the caller treats the persisted
/// state as absent, regenerates the session identity, and starts from
/// empty tables (startup self-heal, never an application-visible
/// error).
pub fn decode_config(data: &[u8]) -> Option<Registry> {
    if data.len() != NV_CONFIG_SIZE {
        warn!(len = data.len(), "persisted config has wrong size");
        return None;
    }
    let mut buf = data;
    let mut reg = Registry::new();

    for slot in 0..MAX_APPS {
        let mut name = [0u8; MAX_APP_NAME_LEN];
        buf.copy_to_slice(&mut name);
        let flag = buf.get_u8();
        if flag > 1 {
            warn!(flag, "persisted app flag is not a boolean");
            return None;
        }
        let len = name.iter().position(|b| *b == 0).unwrap_or(MAX_APP_NAME_LEN);
        if len == 0 {
            continue;
        }
        let name = std::str::from_utf8(&name[..len]).ok()?;
        reg.apps[slot] = Some(AppEntry {
            name: name.to_string(),
            connectivity_events: flag == 1,
        });
    }

    let mut gate_masks = [0u32; MAX_GATES];
    for slot in 0..MAX_GATES {
        let id = buf.get_u8();
        let owner = buf.get_u8();
        let mask = buf.get_u32_le();
        if id == 0 {
            continue;
        }
        reg.gates[slot] = Some(Gate {
            id,
            owner: (owner != OWNER_NONE).then_some(AppHandle(owner)),
            pipe_slots: BTreeSet::new(),
        });
        gate_masks[slot] = mask;
    }

    for slot in 0..MAX_PIPES {
        let id = buf.get_u8();
        let state = buf.get_u8();
        let local_gate = buf.get_u8();
        let dest_host = buf.get_u8();
        let dest_gate = buf.get_u8();
        if id == 0 {
            continue;
        }
        let state = PipeState::from_byte(state)?;
        reg.pipes[slot] = Some(Pipe {
            id,
            state,
            local_gate,
            dest_host,
            dest_gate,
        });
    }

    let admin_state = PipeState::from_byte(buf.get_u8())?;
    let mut session = [0u8; SESSION_ID_LEN];
    buf.copy_to_slice(&mut session);
    let link_state = PipeState::from_byte(buf.get_u8())?;
    let rec_errors = buf.get_u8();
    let identity_mask = buf.get_u32_le();

    reg.admin_pipe_state = admin_state;
    reg.session_id = session;
    reg.link_pipe_state = link_state;
    reg.link_rec_errors = rec_errors;
    reg.identity_pipe_slots = mask_slots(identity_mask);
    for slot in 0..MAX_GATES {
        if let Some(gate) = reg.gates[slot].as_mut() {
            gate.pipe_slots = mask_slots(gate_masks[slot]);
        }
    }

    match reg.validate() {
        Ok(()) => Some(reg),
        Err(err) => {
            warn!(%err, "persisted config failed validation");
            None
        }
    }
}

fn slot_mask(slots: &BTreeSet<usize>) -> u32 {
    slots.iter().fold(0u32, |m, s| m | (1 << *s))
}

fn mask_slots(mask: u32) -> BTreeSet<usize> {
    (0..32).filter(|b| mask & (1 << b) != 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IDENTITY_GATE, SESSION_ID_UNSET};

    fn populated_registry() -> Registry {
        let mut reg = Registry::new();
        let app = reg.register_app("wallet", true).unwrap();
        reg.register_app("reader", false).unwrap();
        reg.allocate_gate(Some(app), 0xF5).unwrap();
        let slot = reg.allocate_pipe(0x20, 0xF5, 0x02, 0x41).unwrap();
        reg.add_pipe_to_gate(slot, 0xF5).unwrap();
        let slot = reg.allocate_pipe(0x21, IDENTITY_GATE, 0x02, 0x05).unwrap();
        reg.add_pipe_to_gate(slot, IDENTITY_GATE).unwrap();
        reg.set_session_id([1, 2, 3, 4, 5, 6, 7, 8]);
        reg
    }

    #[test]
    fn test_config_round_trip() {
        let reg = populated_registry();
        let blob = encode_config(&reg);
        assert_eq!(blob.len(), NV_CONFIG_SIZE);

        let decoded = decode_config(&blob).expect("blob decodes");
        assert_eq!(decoded.app_by_name("wallet"), reg.app_by_name("wallet"));
        assert_eq!(decoded.session_id(), reg.session_id());
        assert_eq!(
            decoded.find_pipe(0x20).unwrap(),
            reg.find_pipe(0x20).unwrap()
        );
        assert_eq!(decoded.count_pipes_on_gate(0xF5), 1);
        assert_eq!(decoded.count_pipes_on_gate(IDENTITY_GATE), 1);
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(decode_config(&[0u8; 10]).is_none());
        assert!(decode_config(&[0u8; NV_CONFIG_SIZE + 1]).is_none());
    }

    #[test]
    fn test_non_boolean_flag_rejected() {
        let reg = populated_registry();
        let mut blob = encode_config(&reg).to_vec();
        blob[MAX_APP_NAME_LEN] = 2; // first app's flag byte
        assert!(decode_config(&blob).is_none());
    }

    #[test]
    fn test_orphan_gate_owner_rejected() {
        let reg = populated_registry();
        let mut blob = encode_config(&reg).to_vec();
        // Point the first gate's owner at an empty app slot.
        let gate_base = MAX_APPS * (MAX_APP_NAME_LEN + 1);
        blob[gate_base + 1] = 4;
        assert!(decode_config(&blob).is_none());
    }

    #[test]
    fn test_empty_registry_round_trip() {
        let reg = Registry::new();
        let blob = encode_config(&reg);
        let decoded = decode_config(&blob).unwrap();
        assert_eq!(decoded.session_id(), &SESSION_ID_UNSET);
        assert!(decoded.app_handles().is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_config_round_trip(
            ids in proptest::collection::btree_set(0x02u8..=0x6F, 0..10usize),
        ) {
            let mut reg = Registry::new();
            let app = reg.register_app("prop", false).unwrap();
            reg.allocate_gate(Some(app), 0xF0).unwrap();
            for id in &ids {
                let slot = reg.allocate_pipe(*id, 0xF0, 0x02, 0x41).unwrap();
                reg.add_pipe_to_gate(slot, 0xF0).unwrap();
            }

            let decoded = decode_config(&encode_config(&reg)).expect("blob decodes");
            for id in &ids {
                proptest::prop_assert!(decoded.find_pipe(*id).is_some());
            }
            proptest::prop_assert_eq!(decoded.count_pipes_on_gate(0xF0), ids.len());
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryNvStore::new();
        assert!(store
            .read(NV_BLOCK_CONFIG, NV_CONFIG_SIZE)
            .await
            .unwrap()
            .is_none());

        let blob = encode_config(&populated_registry());
        store.write(NV_BLOCK_CONFIG, blob.clone()).await.unwrap();
        let read = store
            .read(NV_BLOCK_CONFIG, NV_CONFIG_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, blob);
    }
}
