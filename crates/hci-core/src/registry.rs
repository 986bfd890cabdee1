//! Resource registry: fixed-capacity tables of applications, gates, and
//! pipes, plus the static admin/link/identity gate bookkeeping.
//!
//! Tables are small and bounded, so lookups are linear scans. Every
//! mutation marks the registry dirty; the engine flushes dirty state to
//! the persistence binding while idle.

use std::collections::BTreeSet;

use tracing::debug;

use crate::errors::{RegistryError, ValidationError};
use crate::types::{
    is_allocatable_gate, is_dynamic_pipe, is_valid_gate, peer_host_slot, AppHandle, PipeState,
    CONNECTIVITY_GATE, FIRST_DYNAMIC_PIPE, FIRST_PROP_GATE, HOST_CONTROLLER, IDENTITY_GATE,
    LOOPBACK_GATE, SESSION_ID_LEN, SESSION_ID_UNSET, TERMINAL_HOST,
};

/// Maximum registered applications.
pub const MAX_APPS: usize = 5;
/// Maximum allocated gates.
pub const MAX_GATES: usize = 20;
/// Maximum allocated pipes.
pub const MAX_PIPES: usize = 20;
/// Maximum application name length in bytes.
pub const MAX_APP_NAME_LEN: usize = 16;

/// A registered application (persisted part; callbacks live in the
/// engine).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppEntry {
    pub name: String,
    /// Opt-in to connectivity-class broadcast events.
    pub connectivity_events: bool,
}

/// A local gate record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gate {
    pub id: u8,
    /// The connectivity gate has no single owner.
    pub owner: Option<AppHandle>,
    /// Pipe-slot indices attached to this gate.
    pub pipe_slots: BTreeSet<usize>,
}

/// A pipe record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipe {
    pub id: u8,
    pub state: PipeState,
    pub local_gate: u8,
    pub dest_host: u8,
    pub dest_gate: u8,
}

/// In-memory (persisted) resource tables.
#[derive(Clone, Debug)]
pub struct Registry {
    pub(crate) apps: [Option<AppEntry>; MAX_APPS],
    pub(crate) gates: [Option<Gate>; MAX_GATES],
    pub(crate) pipes: [Option<Pipe>; MAX_PIPES],
    /// Admin gate persisted state.
    pub(crate) admin_pipe_state: PipeState,
    pub(crate) session_id: [u8; SESSION_ID_LEN],
    /// Link-management gate persisted state.
    pub(crate) link_pipe_state: PipeState,
    pub(crate) link_rec_errors: u8,
    /// Pipe slots attached to the identity-management gate, which has
    /// no gate record of its own.
    pub(crate) identity_pipe_slots: BTreeSet<usize>,
    dirty: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            apps: std::array::from_fn(|_| None),
            gates: std::array::from_fn(|_| None),
            pipes: std::array::from_fn(|_| None),
            admin_pipe_state: PipeState::Closed,
            session_id: SESSION_ID_UNSET,
            link_pipe_state: PipeState::Closed,
            link_rec_errors: 0,
            identity_pipe_slots: BTreeSet::new(),
            dirty: false,
        }
    }

    // -------------------------------------------------------------------------
    // Dirty tracking
    // -------------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    // -------------------------------------------------------------------------
    // Applications
    // -------------------------------------------------------------------------

    /// Register an application. Names must be unique and bounded.
    pub fn register_app(
        &mut self,
        name: &str,
        connectivity_events: bool,
    ) -> Result<AppHandle, RegistryError> {
        if name.len() > MAX_APP_NAME_LEN || name.is_empty() {
            return Err(RegistryError::NameTooLong);
        }
        if self.app_by_name(name).is_some() {
            return Err(RegistryError::DuplicateName);
        }
        let slot = self
            .apps
            .iter()
            .position(|a| a.is_none())
            .ok_or(RegistryError::AppsFull)?;
        self.apps[slot] = Some(AppEntry {
            name: name.to_string(),
            connectivity_events,
        });
        self.dirty = true;
        debug!(name, slot, "registered application");
        Ok(AppHandle(slot as u8))
    }

    /// Remove an application entry. Gate ownership cleanup is the
    /// engine's job (deregistration cascade).
    pub fn remove_app(&mut self, app: AppHandle) -> Result<(), RegistryError> {
        let slot = self.app_slot(app)?;
        self.apps[slot] = None;
        self.dirty = true;
        Ok(())
    }

    pub fn app(&self, app: AppHandle) -> Option<&AppEntry> {
        self.apps.get(app.0 as usize).and_then(|a| a.as_ref())
    }

    pub fn app_by_name(&self, name: &str) -> Option<AppHandle> {
        self.apps.iter().enumerate().find_map(|(i, a)| {
            a.as_ref()
                .filter(|a| a.name == name)
                .map(|_| AppHandle(i as u8))
        })
    }

    /// Handles of all registered applications.
    pub fn app_handles(&self) -> Vec<AppHandle> {
        self.apps
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().map(|_| AppHandle(i as u8)))
            .collect()
    }

    /// Applications opted into connectivity-class events.
    pub fn connectivity_subscribers(&self) -> Vec<AppHandle> {
        self.apps
            .iter()
            .enumerate()
            .filter_map(|(i, a)| {
                a.as_ref()
                    .filter(|a| a.connectivity_events)
                    .map(|_| AppHandle(i as u8))
            })
            .collect()
    }

    fn app_slot(&self, app: AppHandle) -> Result<usize, RegistryError> {
        let slot = app.0 as usize;
        if slot < MAX_APPS && self.apps[slot].is_some() {
            Ok(slot)
        } else {
            Err(RegistryError::UnknownApp(app))
        }
    }

    // -------------------------------------------------------------------------
    // Gates
    // -------------------------------------------------------------------------

    /// Allocate a gate.
    ///
    /// `requested == 0` picks a free id from the proprietary range.
    /// Re-allocating an id already owned by the same application returns
    /// that id (idempotent); an id held by anyone else fails. The shared
    /// connectivity gate is the one gate allocatable without an owner.
    pub fn allocate_gate(
        &mut self,
        owner: Option<AppHandle>,
        requested: u8,
    ) -> Result<u8, RegistryError> {
        match owner {
            Some(app) => {
                self.app_slot(app)?;
            }
            None => {
                if requested != CONNECTIVITY_GATE {
                    return Err(RegistryError::InvalidGate(requested));
                }
            }
        }

        let id = if requested == 0 {
            (FIRST_PROP_GATE..=0xFE)
                .chain(std::iter::once(0xFF))
                .find(|id| self.find_gate(*id).is_none())
                .ok_or(RegistryError::NoFreeGate)?
        } else {
            if !is_allocatable_gate(requested) {
                return Err(RegistryError::InvalidGate(requested));
            }
            if let Some(gate) = self.find_gate(requested) {
                return if gate.owner == owner {
                    Ok(requested)
                } else {
                    Err(RegistryError::GateInUse(requested))
                };
            }
            requested
        };

        let slot = self
            .gates
            .iter()
            .position(|g| g.is_none())
            .ok_or(RegistryError::NoFreeGate)?;
        self.gates[slot] = Some(Gate {
            id,
            owner,
            pipe_slots: BTreeSet::new(),
        });
        self.dirty = true;
        debug!(gate = format_args!("{id:#04x}"), ?owner, "allocated gate");
        Ok(id)
    }

    /// Clear a gate record. Attached pipes must already be released.
    pub fn release_gate(&mut self, id: u8) -> Result<(), RegistryError> {
        let slot = self
            .gates
            .iter()
            .position(|g| g.as_ref().is_some_and(|g| g.id == id))
            .ok_or(RegistryError::UnknownGate(id))?;
        self.gates[slot] = None;
        self.dirty = true;
        Ok(())
    }

    pub fn find_gate(&self, id: u8) -> Option<&Gate> {
        self.gates
            .iter()
            .filter_map(|g| g.as_ref())
            .find(|g| g.id == id)
    }

    pub(crate) fn gate_mut(&mut self, id: u8) -> Option<&mut Gate> {
        self.gates
            .iter_mut()
            .filter_map(|g| g.as_mut())
            .find(|g| g.id == id)
    }

    /// Gate ids owned by an application.
    pub fn gates_owned_by(&self, app: AppHandle) -> Vec<u8> {
        self.gates
            .iter()
            .filter_map(|g| g.as_ref())
            .filter(|g| g.owner == Some(app))
            .map(|g| g.id)
            .collect()
    }

    /// All allocated gate ids.
    pub fn gate_ids(&self) -> Vec<u8> {
        self.gates
            .iter()
            .filter_map(|g| g.as_ref().map(|g| g.id))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Pipes
    // -------------------------------------------------------------------------

    /// Allocate a pipe record. A slot already holding the same static
    /// id is reused; otherwise the first free slot is taken.
    pub fn allocate_pipe(
        &mut self,
        id: u8,
        local_gate: u8,
        dest_host: u8,
        dest_gate: u8,
    ) -> Result<usize, RegistryError> {
        let slot = self
            .pipes
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.id == id))
            .or_else(|| self.pipes.iter().position(|p| p.is_none()))
            .ok_or(RegistryError::NoFreePipe)?;
        self.pipes[slot] = Some(Pipe {
            id,
            state: PipeState::Closed,
            local_gate,
            dest_host,
            dest_gate,
        });
        self.dirty = true;
        debug!(
            pipe = format_args!("{id:#04x}"),
            gate = format_args!("{local_gate:#04x}"),
            host = format_args!("{dest_host:#04x}"),
            "allocated pipe"
        );
        Ok(slot)
    }

    /// Bind an allocated pipe slot into its local gate's slot set.
    ///
    /// The identity-management gate keeps its own slot set; the loopback
    /// and connectivity gates materialize ownerless gate records on
    /// demand, bypassing per-app ownership checks.
    pub fn add_pipe_to_gate(&mut self, slot: usize, local_gate: u8) -> Result<(), RegistryError> {
        if local_gate == IDENTITY_GATE {
            self.identity_pipe_slots.insert(slot);
            self.dirty = true;
            return Ok(());
        }
        if self.find_gate(local_gate).is_none()
            && (local_gate == LOOPBACK_GATE || local_gate == CONNECTIVITY_GATE)
        {
            let free = self
                .gates
                .iter()
                .position(|g| g.is_none())
                .ok_or(RegistryError::NoFreeGate)?;
            self.gates[free] = Some(Gate {
                id: local_gate,
                owner: None,
                pipe_slots: BTreeSet::new(),
            });
        }
        let gate = self
            .gate_mut(local_gate)
            .ok_or(RegistryError::UnknownGate(local_gate))?;
        gate.pipe_slots.insert(slot);
        self.dirty = true;
        Ok(())
    }

    /// Clear a pipe slot and remove it from whichever slot set holds it.
    pub fn release_pipe(&mut self, id: u8) -> Result<(), RegistryError> {
        let slot = self
            .pipes
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.id == id))
            .ok_or(RegistryError::UnknownPipe(id))?;
        self.pipes[slot] = None;
        self.identity_pipe_slots.remove(&slot);
        for gate in self.gates.iter_mut().filter_map(|g| g.as_mut()) {
            gate.pipe_slots.remove(&slot);
        }
        self.dirty = true;
        Ok(())
    }

    pub fn find_pipe(&self, id: u8) -> Option<&Pipe> {
        self.pipes
            .iter()
            .filter_map(|p| p.as_ref())
            .find(|p| p.id == id)
    }

    pub(crate) fn pipe_mut(&mut self, id: u8) -> Option<&mut Pipe> {
        self.pipes
            .iter_mut()
            .filter_map(|p| p.as_mut())
            .find(|p| p.id == id)
    }

    /// The pipe connecting a (local gate, destination host, destination
    /// gate) triple, if one exists. At most one such pipe may exist.
    pub fn pipe_between(&self, local_gate: u8, dest_host: u8, dest_gate: u8) -> Option<&Pipe> {
        self.pipes.iter().filter_map(|p| p.as_ref()).find(|p| {
            p.local_gate == local_gate && p.dest_host == dest_host && p.dest_gate == dest_gate
        })
    }

    /// Pipe ids attached to a gate (identity gate included).
    pub fn pipes_on_gate(&self, gate: u8) -> Vec<u8> {
        let slots: Vec<usize> = if gate == IDENTITY_GATE {
            self.identity_pipe_slots.iter().copied().collect()
        } else {
            match self.find_gate(gate) {
                Some(g) => g.pipe_slots.iter().copied().collect(),
                None => return Vec::new(),
            }
        };
        slots
            .into_iter()
            .filter_map(|s| self.pipes.get(s).and_then(|p| p.as_ref()).map(|p| p.id))
            .collect()
    }

    pub fn count_pipes_on_gate(&self, gate: u8) -> usize {
        self.pipes_on_gate(gate).len()
    }

    pub fn count_open_pipes_on_gate(&self, gate: u8) -> usize {
        self.pipes_on_gate(gate)
            .into_iter()
            .filter_map(|id| self.find_pipe(id))
            .filter(|p| p.state == PipeState::Opened)
            .count()
    }

    /// Release every dynamic pipe whose destination is `host`.
    pub fn clear_pipes_to_host(&mut self, host: u8) -> Vec<u8> {
        let ids: Vec<u8> = self
            .pipes
            .iter()
            .filter_map(|p| p.as_ref())
            .filter(|p| p.dest_host == host && is_dynamic_pipe(p.id))
            .map(|p| p.id)
            .collect();
        for id in &ids {
            self.release_pipe(*id).ok();
        }
        ids
    }

    /// Release every dynamic pipe.
    pub fn clear_all_dynamic_pipes(&mut self) -> Vec<u8> {
        let ids: Vec<u8> = self
            .pipes
            .iter()
            .filter_map(|p| p.as_ref())
            .filter(|p| is_dynamic_pipe(p.id))
            .map(|p| p.id)
            .collect();
        for id in &ids {
            self.release_pipe(*id).ok();
        }
        ids
    }

    /// Wipe gates and pipes (applications survive; they re-create their
    /// resources). Used when the session identity no longer matches.
    pub fn reset_tables(&mut self) {
        self.gates = std::array::from_fn(|_| None);
        self.pipes = std::array::from_fn(|_| None);
        self.identity_pipe_slots.clear();
        self.admin_pipe_state = PipeState::Closed;
        self.link_pipe_state = PipeState::Closed;
        self.link_rec_errors = 0;
        self.dirty = true;
    }

    // -------------------------------------------------------------------------
    // Static gate state
    // -------------------------------------------------------------------------

    pub fn admin_pipe_state(&self) -> PipeState {
        self.admin_pipe_state
    }

    pub fn set_admin_pipe_state(&mut self, state: PipeState) {
        if self.admin_pipe_state != state {
            self.admin_pipe_state = state;
            self.dirty = true;
        }
    }

    pub fn link_pipe_state(&self) -> PipeState {
        self.link_pipe_state
    }

    pub fn set_link_pipe_state(&mut self, state: PipeState) {
        if self.link_pipe_state != state {
            self.link_pipe_state = state;
            self.dirty = true;
        }
    }

    pub fn link_rec_errors(&self) -> u8 {
        self.link_rec_errors
    }

    pub fn set_link_rec_errors(&mut self, value: u8) {
        if self.link_rec_errors != value {
            self.link_rec_errors = value;
            self.dirty = true;
        }
    }

    // -------------------------------------------------------------------------
    // Session identity
    // -------------------------------------------------------------------------

    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.session_id
    }

    pub fn set_session_id(&mut self, id: [u8; SESSION_ID_LEN]) {
        self.session_id = id;
        self.dirty = true;
    }

    // -------------------------------------------------------------------------
    // Validation of decoded persisted tables
    // -------------------------------------------------------------------------

    /// Full consistency walk over the tables. A failure means the
    /// persisted blob is stale or corrupted and must be regenerated.
    pub fn validate(&self) -> Result<(), ValidationError> {
        // App names: present entries unique and bounded.
        let mut names: Vec<&str> = Vec::new();
        for app in self.apps.iter().flatten() {
            if app.name.is_empty()
                || app.name.len() > MAX_APP_NAME_LEN
                || names.contains(&app.name.as_str())
            {
                return Err(ValidationError::BadAppTable);
            }
            names.push(&app.name);
        }

        // Gates: legal id, unique, owner resolves.
        let mut gate_ids: Vec<u8> = Vec::new();
        for gate in self.gates.iter().flatten() {
            if !is_allocatable_gate(gate.id) || gate_ids.contains(&gate.id) {
                return Err(ValidationError::BadGate(gate.id));
            }
            gate_ids.push(gate.id);
            match gate.owner {
                Some(app) => {
                    if self.app(app).is_none() {
                        return Err(ValidationError::BadGateOwner(gate.id));
                    }
                }
                None => {
                    if gate.id != CONNECTIVITY_GATE && gate.id != LOOPBACK_GATE {
                        return Err(ValidationError::BadGateOwner(gate.id));
                    }
                }
            }
            for slot in &gate.pipe_slots {
                let pipe = self
                    .pipes
                    .get(*slot)
                    .and_then(|p| p.as_ref())
                    .ok_or(ValidationError::BadPipeSlot)?;
                if pipe.local_gate != gate.id {
                    return Err(ValidationError::BadPipeSlot);
                }
            }
        }

        // Pipes: legal ids, endpoint gates, hosts; unique. Dynamic ids
        // and the proprietary static range above them are both legal.
        let mut pipe_ids: Vec<u8> = Vec::new();
        for pipe in self.pipes.iter().flatten() {
            if pipe_ids.contains(&pipe.id) || pipe.id < FIRST_DYNAMIC_PIPE || pipe.id > 0x7F {
                return Err(ValidationError::BadPipe(pipe.id));
            }
            pipe_ids.push(pipe.id);
            if !is_valid_gate(pipe.local_gate) || !is_valid_gate(pipe.dest_gate) {
                return Err(ValidationError::BadPipe(pipe.id));
            }
            if pipe.dest_host != HOST_CONTROLLER
                && pipe.dest_host != TERMINAL_HOST
                && peer_host_slot(pipe.dest_host).is_none()
            {
                return Err(ValidationError::BadPipe(pipe.id));
            }
        }

        // Identity gate set must exactly cover identity-gate pipes.
        for slot in &self.identity_pipe_slots {
            let pipe = self
                .pipes
                .get(*slot)
                .and_then(|p| p.as_ref())
                .ok_or(ValidationError::IdentitySetMismatch)?;
            if pipe.local_gate != IDENTITY_GATE {
                return Err(ValidationError::IdentitySetMismatch);
            }
        }
        for (slot, pipe) in self.pipes.iter().enumerate() {
            if let Some(pipe) = pipe {
                if pipe.local_gate == IDENTITY_GATE && !self.identity_pipe_slots.contains(&slot) {
                    return Err(ValidationError::IdentitySetMismatch);
                }
            }
        }

        Ok(())
    }
}
