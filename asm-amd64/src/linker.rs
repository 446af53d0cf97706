//! Section merging and reference resolution.

use std::collections::BTreeMap;

use crate::{Assembler, MemoryManager, Section, SymbolRegistry};

/// Links a set of named sections into one executable function.
///
/// The entry section is placed first so the returned pointer is the function
/// entry; all other sections follow in name order. References are resolved
/// against intra-function section offsets first and the [`SymbolRegistry`]
/// second. A linker produces exactly one function: `link` consumes it.
pub struct Linker {
    entry_point: String,
    sections: BTreeMap<String, Section>,
}

impl Linker {
    pub fn new(entry_point: &str) -> Self {
        Self { entry_point: entry_point.to_string(), sections: BTreeMap::new() }
    }

    /// Adds a single section.
    pub fn add_section(&mut self, section: Section) {
        self.sections.insert(section.name.clone(), section);
    }

    /// Adds every section of `assembler`.
    pub fn add(&mut self, assembler: &Assembler) {
        for (name, section) in assembler.sections() {
            self.sections.insert(name.clone(), section.clone());
        }
    }

    /// Merges, allocates, patches and returns the executable entry pointer.
    pub fn link(
        self,
        registry: &SymbolRegistry,
        memory: &mut MemoryManager,
    ) -> Result<*const u8, String> {
        let (main, offsets) = self.merge_sections()?;

        let mut patch_error = None;
        let entry = memory.add(&main.bytes, |data, base| {
            for reference in &main.references {
                // Base address for relative addressing.
                let rip = base + reference.base;

                let destination = if let Some(section_offset) = offsets.get(&reference.name) {
                    // Reference to another section of this function.
                    base + section_offset
                } else if let Some(symbol) = registry.get(&reference.name) {
                    if !symbol.is_pointer && reference.base > 0 {
                        patch_error = Some(format!(
                            "Symbol {} was referenced as pointer, but is not a pointer",
                            reference.name
                        ));
                        return;
                    }
                    symbol.value as usize
                } else {
                    patch_error = Some(format!("Can't resolve symbol: {}", reference.name));
                    return;
                };

                let value = if reference.base > 0 {
                    destination.wrapping_sub(rip) as u64
                } else {
                    destination as u64
                };

                write_reference(data, reference.offset, reference.size, value);
            }
        })?;

        if let Some(message) = patch_error {
            memory.remove(entry);
            return Err(message);
        }

        Ok(entry)
    }

    /// Merges all sections into one, entry first, and records each
    /// section's offset within the merged stream.
    fn merge_sections(self) -> Result<(Section, BTreeMap<String, usize>), String> {
        let mut offsets = BTreeMap::new();
        offsets.insert(self.entry_point.clone(), 0);

        let mut main = Section::new(&self.entry_point);

        let entry = self
            .sections
            .get(&self.entry_point)
            .ok_or_else(|| format!("Couldn't find entry-point section {}", self.entry_point))?;
        main.append_section(entry);

        for (name, section) in &self.sections {
            if *name != self.entry_point {
                offsets.insert(name.clone(), main.size());
                main.append_section(section);
            }
        }

        Ok((main, offsets))
    }
}

fn write_reference(data: &mut [u8], offset: usize, size: usize, value: u64) {
    match size {
        8 => data[offset..offset + 8].copy_from_slice(&value.to_le_bytes()),
        4 => data[offset..offset + 4].copy_from_slice(&(value as u32).to_le_bytes()),
        2 => data[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        1 => data[offset] = value as u8,
        _ => panic!("reference size must be 1, 2, 4 or 8 bytes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reference;

    fn read_u32(entry: *const u8, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        for (position, byte) in bytes.iter_mut().enumerate() {
            *byte = unsafe { *entry.add(offset + position) };
        }
        u32::from_le_bytes(bytes)
    }

    #[test]
    fn pc_relative_section_reference() {
        // `entry` is 4 bytes: a JMP rel32 opcode byte plus a 4-byte
        // displacement referencing `other` (offset 1, size 4, base 5 --
        // the reference field actually overlaps the section end by design
        // of the scenario). `other` follows at merged offset 4, so the
        // patched displacement is 4 - 5 = -1.
        let mut entry = Section::new("entry");
        entry.bytes = vec![0xE9, 0, 0, 0];
        entry.references.push(Reference {
            name: "other".to_string(),
            offset: 1,
            size: 4,
            base: 5,
        });

        let mut other = Section::new("other");
        other.bytes = vec![0x90, 0xC3];

        let mut linker = Linker::new("entry");
        linker.add_section(entry);
        linker.add_section(other);

        let registry = SymbolRegistry::new();
        let mut memory = MemoryManager::new();
        let pointer = linker.link(&registry, &mut memory).unwrap();

        assert_eq!(read_u32(pointer, 1), 0xFFFF_FFFF);
    }

    #[test]
    fn entry_section_is_placed_first() {
        let mut zzz = Section::new("aaa"); // Sorts before "entry".
        zzz.bytes = vec![0x11, 0x22];
        let mut entry = Section::new("entry");
        entry.bytes = vec![0x33];

        let mut linker = Linker::new("entry");
        linker.add_section(zzz);
        linker.add_section(entry);

        let registry = SymbolRegistry::new();
        let mut memory = MemoryManager::new();
        let pointer = linker.link(&registry, &mut memory).unwrap();

        assert_eq!(unsafe { *pointer }, 0x33);
        assert_eq!(unsafe { *pointer.add(1) }, 0x11);
    }

    #[test]
    fn pointer_symbols_resolve_absolutely() {
        let mut entry = Section::new("entry");
        entry.bytes = vec![0; 8];
        entry.references.push(Reference {
            name: "Ram".to_string(),
            offset: 0,
            size: 8,
            base: 0,
        });

        let mut linker = Linker::new("entry");
        linker.add_section(entry);

        let mut registry = SymbolRegistry::new();
        registry.add_pointer("Ram", 0x1122_3344 as *const ());
        let mut memory = MemoryManager::new();
        let pointer = linker.link(&registry, &mut memory).unwrap();

        let mut bytes = [0u8; 8];
        for (position, byte) in bytes.iter_mut().enumerate() {
            *byte = unsafe { *pointer.add(position) };
        }
        assert_eq!(u64::from_le_bytes(bytes), 0x1122_3344);
    }

    #[test]
    fn unresolved_symbols_fail() {
        let mut entry = Section::new("entry");
        entry.bytes = vec![0; 4];
        entry.references.push(Reference {
            name: "missing".to_string(),
            offset: 0,
            size: 4,
            base: 4,
        });

        let mut linker = Linker::new("entry");
        linker.add_section(entry);

        let registry = SymbolRegistry::new();
        let mut memory = MemoryManager::new();
        let error = linker.link(&registry, &mut memory).unwrap_err();
        assert!(error.contains("Can't resolve symbol: missing"));
    }

    #[test]
    fn value_symbol_used_relatively_fails() {
        let mut entry = Section::new("entry");
        entry.bytes = vec![0; 4];
        entry.references.push(Reference {
            name: "barrier".to_string(),
            offset: 0,
            size: 4,
            base: 4,
        });

        let mut linker = Linker::new("entry");
        linker.add_section(entry);

        let mut registry = SymbolRegistry::new();
        registry.add_value("barrier", 0x2000);
        let mut memory = MemoryManager::new();
        let error = linker.link(&registry, &mut memory).unwrap_err();
        assert!(error.contains("referenced as pointer"));
    }

    #[test]
    fn missing_entry_section_fails() {
        let linker = Linker::new("entry");
        let registry = SymbolRegistry::new();
        let mut memory = MemoryManager::new();
        let error = linker.link(&registry, &mut memory).unwrap_err();
        assert!(error.contains("entry-point"));
    }
}
