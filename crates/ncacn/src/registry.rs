//! A registry of interface call tables.
//!
//! Tables are static descriptions generated or written alongside the typed
//! stubs; the registry is an owned collection so embedders can hold several
//! independent sets without global state.

use crate::error::{fault_string, Result, RpcError};
use crate::packet::{SyntaxId, Uuid};

/// One operation in a call table. The opnum is the slice index.
#[derive(Debug, Clone, Copy)]
pub struct CallDef {
    pub name: &'static str,
}

/// Static description of one RPC interface
#[derive(Debug)]
pub struct InterfaceTable {
    pub name: &'static str,
    pub syntax: SyntaxId,
    pub calls: &'static [CallDef],
    /// Interface-specific fault strings, consulted before the common set.
    pub faults: &'static [(u32, &'static str)],
}

impl InterfaceTable {
    pub fn num_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn call_name(&self, opnum: u16) -> Option<&'static str> {
        self.calls.get(opnum as usize).map(|c| c.name)
    }

    /// Human-readable fault name, preferring this interface's own codes.
    pub fn fault_name(&self, code: u32) -> &'static str {
        self.faults
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
            .unwrap_or_else(|| fault_string(code))
    }
}

/// An owned collection of interface tables
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    tables: Vec<&'static InterfaceTable>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table. A name or interface identifier collision is an error,
    /// never a silent replacement.
    pub fn register(&mut self, table: &'static InterfaceTable) -> Result<()> {
        let collides = self.tables.iter().any(|t| {
            t.name == table.name
                || (t.syntax.uuid == table.syntax.uuid && t.syntax.version == table.syntax.version)
        });
        if collides {
            return Err(RpcError::AlreadyRegistered(table.name));
        }
        self.tables.push(table);
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&'static InterfaceTable> {
        self.tables.iter().copied().find(|t| t.name == name)
    }

    /// Looks up by interface UUID and packed version, the same identity
    /// `register` enforces uniqueness on.
    pub fn find_by_uuid(&self, uuid: &Uuid, version: u32) -> Option<&'static InterfaceTable> {
        self.tables
            .iter()
            .copied()
            .find(|t| &t.syntax.uuid == uuid && t.syntax.version == version)
    }

    pub fn tables(&self) -> &[&'static InterfaceTable] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
