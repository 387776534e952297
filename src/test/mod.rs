//! Shared functionality which is used in unit- and integration-tests

use std::collections::HashMap;

use crate::disasm::{Disassembly, DisassemblyService, Insn};
use crate::{Error, Result};

/// In-memory program image scripted instruction by instruction.
///
/// Tests describe the code under analysis as a map from address to decoded
/// instruction plus literal pool words and section properties, then hand the
/// image to the engine as its disassembler.
#[derive(Default)]
pub struct ScriptedImage {
    insns: HashMap<u32, Insn>,
    words: HashMap<u32, u32>,
    readonly: Vec<(u32, u32)>,
    internal: Vec<(u32, u32)>,
    functions: HashMap<u32, (String, bool)>,
    thumb: bool,
}

impl ScriptedImage {
    pub fn new() -> ScriptedImage {
        ScriptedImage::default()
    }

    pub fn thumb() -> ScriptedImage {
        ScriptedImage {
            thumb: true,
            ..ScriptedImage::default()
        }
    }

    pub fn put(&mut self, insn: Insn) -> &mut ScriptedImage {
        self.insns.insert(insn.address, insn);
        self
    }

    pub fn word(&mut self, address: u32, value: u32) -> &mut ScriptedImage {
        self.words.insert(address, value);
        self
    }

    pub fn readonly(&mut self, start: u32, end: u32) -> &mut ScriptedImage {
        self.readonly.push((start, end));
        self
    }

    pub fn internal(&mut self, start: u32, end: u32) -> &mut ScriptedImage {
        self.internal.push((start, end));
        self
    }

    pub fn function(&mut self, start: u32, name: &str, returns: bool) -> &mut ScriptedImage {
        self.functions.insert(start, (name.to_string(), returns));
        self
    }

    pub fn into_disassembly(self) -> Disassembly {
        Disassembly::new(Box::new(self))
    }
}

impl DisassemblyService for ScriptedImage {
    fn decode(&self, address: u32) -> Result<Insn> {
        self.insns
            .get(&address)
            .cloned()
            .ok_or(Error::Decode(u64::from(address)))
    }

    fn read_word(&self, address: u32) -> Option<u32> {
        self.words.get(&address).copied()
    }

    fn is_read_only(&self, address: u32) -> bool {
        self.readonly
            .iter()
            .any(|(start, end)| address >= *start && address < *end)
    }

    fn is_internal(&self, address: u32) -> bool {
        self.internal
            .iter()
            .any(|(start, end)| address >= *start && address < *end)
    }

    fn is_thumb(&self, _address: u32) -> bool {
        self.thumb
    }

    fn function_start(&self, address: u32) -> Option<u32> {
        self.functions
            .keys()
            .filter(|start| **start <= address)
            .max()
            .copied()
    }

    fn function_returns(&self, address: u32) -> bool {
        self.functions
            .get(&(address & !1))
            .map_or(true, |(_, returns)| *returns)
    }

    fn function_name(&self, address: u32) -> String {
        self.functions
            .get(&(address & !1))
            .map_or_else(|| format!("sub_{address:x}"), |(name, _)| name.clone())
    }
}

// Helper for tests that need a disassembler but never consult it
pub fn empty_disassembly() -> Disassembly {
    ScriptedImage::new().into_disassembly()
}

// Helper for store-to-load tests reading one read-only word
pub fn disassembly_with_word(address: u32, value: u32) -> Disassembly {
    let mut image = ScriptedImage::new();
    image.word(address, value).readonly(address, address + 4);
    image.into_disassembly()
}
