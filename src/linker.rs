//! Resolves `Reference`s against a per-load-session staging table and
//! commits the final symbol table into the `Mmu`.

use std::collections::HashMap;

use log::{debug, warn};

use crate::error::{VmError, VmResult};
use crate::mmu::Mmu;
use crate::reference::{Component, DirectReference, Reference, Section};
use crate::symbol::Symbol;
use crate::value::ValueType;

/// A symbol's write offset for each label-bearing section, tracked
/// across `add_symbols` calls so auto-placed labels land at "the
/// current end of that section".
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionOffsets {
    pub code: usize,
    pub data: usize,
}

pub struct Linker {
    staging: HashMap<u64, Vec<(String, Symbol)>>,
    session_open: bool,
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker {
    pub fn new() -> Self {
        Linker {
            staging: HashMap::new(),
            session_open: false,
        }
    }

    pub fn init_link_session(&mut self) {
        self.staging.clear();
        self.session_open = true;
    }

    /// Append a batch of `(name, Symbol)` records to the staging map,
    /// one bucket per hash, so a definition and any number of uses of
    /// the same name can arrive in either order across calls without
    /// clobbering each other; `finalize` does the collapse. A symbol
    /// carrying `Reference::needs_linker_placement` is auto-placed at
    /// the current write offset of its `global_section` if that section
    /// is a label section (`Code`/`Data`); placement on any other
    /// section is a hard error.
    pub fn add_symbols(
        &mut self,
        incoming: Vec<(String, Symbol)>,
        offsets: SectionOffsets,
    ) -> VmResult<()> {
        for (name, mut sym) in incoming {
            if let Some(reference) = sym.reference.as_mut() {
                if reference.needs_linker_placement {
                    let section = reference.global_section.ok_or_else(|| {
                        VmError::invalid_reference("auto-placed symbol has no global section")
                    })?;
                    if !section.is_label_section() {
                        return Err(VmError::invalid_reference(format!(
                            "needs_linker_placement set on non-label section {section:?}"
                        )));
                    }
                    let offset = match section {
                        Section::Code => offsets.code as i64,
                        Section::Data => offsets.data as i64,
                        _ => unreachable!("checked above"),
                    };
                    reference.needs_linker_placement = false;
                    reference.components = vec![Component::direct_in(section, offset)];
                }
            }
            self.staging.entry(sym.hash).or_default().push((name, sym));
        }
        Ok(())
    }

    /// Collapse the staging map into `mmu`'s symbol table.
    ///
    /// `uat = true` requests a unit-at-a-time link: the staging map is
    /// *not* cleared after this call, so a later `add_symbols` may
    /// overlay earlier references with matching definitions across
    /// several `finalize` calls in the same session. The caller ends
    /// the session with `finalize(false)` (or `finalize_session_end`).
    pub fn finalize(&mut self, mmu: &mut Mmu, uat: bool) -> VmResult<()> {
        let mut installed: HashMap<u64, (String, Symbol)> = HashMap::new();
        for (hash, records) in self.staging.iter() {
            let mut chosen: Option<&(String, Symbol)> = None;
            for record in records {
                let (name, incoming) = record;
                match chosen {
                    Some((existing_name, existing)) if existing.resolved && incoming.resolved => {
                        warn!("symbol redefinition: {name:?} (hash {hash:#x})");
                        return Err(VmError::SymbolRedefinition {
                            hash: *hash,
                            name: if existing_name == name {
                                name.clone()
                            } else {
                                format!("{existing_name} / {name}")
                            },
                        });
                    }
                    Some((_, existing)) if existing.resolved => {
                        // existing definition wins over this use.
                    }
                    _ => {
                        chosen = Some(record);
                    }
                }
            }
            if let Some((name, sym)) = chosen {
                installed.insert(*hash, (name.clone(), sym.clone()));
            }
        }
        debug!("finalize: installing {} symbol(s)", installed.len());
        mmu.read_symbol_image(installed)?;
        if !uat {
            self.staging.clear();
            self.session_open = false;
        }
        Ok(())
    }

    pub fn finalize_session_end(&mut self, mmu: &mut Mmu) -> VmResult<()> {
        self.finalize(mmu, false)
    }

    pub fn session_open(&self) -> bool {
        self.session_open
    }

    /// Resolve a `Reference` into a fully-concrete `DirectReference`.
    pub fn resolve(&self, mmu: &Mmu, reference: &Reference) -> VmResult<DirectReference> {
        let mut total_offset: i64 = 0;
        let mut contributed_section: Option<Section> = None;

        for component in &reference.components {
            let (mut section, offset) = self.resolve_component(mmu, component)?;

            if let Component::Indirect { .. } = component {
                // The indirect read already consumed the declared
                // section to find the base address; the component's
                // contribution to the final reference carries no
                // section of its own.
                section = None;
            }

            if let Some(s) = section {
                if contributed_section.is_some() {
                    return Err(VmError::invalid_reference(
                        "duplicate section contribution across components",
                    ));
                }
                contributed_section = Some(s);
            }
            total_offset += offset;
        }

        let final_section = reference
            .global_section
            .or(contributed_section)
            .ok_or_else(|| VmError::invalid_reference("reference resolves to no section"))?;

        Ok(DirectReference::new(final_section, total_offset))
    }

    /// Resolve one component to (declared section, address), following
    /// the recursive "base address" rule: a literal offset, or a
    /// symbol's own resolved reference looked up recursively.
    fn resolve_component(&self, mmu: &Mmu, component: &Component) -> VmResult<(Option<Section>, i64)> {
        match component {
            Component::Direct { section, offset } => Ok((*section, *offset)),
            Component::Symbol { section, hash } => {
                let sym = mmu.a_symbol(*hash)?;
                let def_ref = sym
                    .reference
                    .as_ref()
                    .ok_or(VmError::SymbolUnresolved { hash: *hash })?;
                let resolved = self.resolve(mmu, def_ref)?;
                let declared = section.or(Some(resolved.section));
                Ok((declared, resolved.offset))
            }
            Component::Indirect { section, inner } => {
                let (inner_section, base) = self.resolve_component(mmu, inner)?;
                let read_section = section.or(inner_section).ok_or_else(|| {
                    VmError::invalid_reference("indirect component has no section to dereference through")
                })?;
                let direct = DirectReference::new(read_section, base);
                mmu.verify_reference(direct)?;
                let v = self.read_integer_at(mmu, direct)?;
                Ok((None, v))
            }
        }
    }

    fn read_integer_at(&self, mmu: &Mmu, r: DirectReference) -> VmResult<i64> {
        // Indirect dereference always reads an address, i.e. an
        // integer; reading through Data/BytePool/Register/Frame follows
        // the same section rules `Logic::read` uses.
        match r.section {
            Section::Data => mmu
                .buffer(mmu.context().buffer)?
                .data
                .get(r.offset as usize)
                .ok_or(VmError::OutOfBounds {
                    section: r.section,
                    index: r.offset,
                    limit: 0,
                })?
                .expect(ValueType::Integer, false)
                .and_then(|v| v.get_into_int()),
            Section::Register => mmu
                .buffer(mmu.context().buffer)?
                .registers
                .get(r.offset as usize)
                .ok_or(VmError::OutOfBounds {
                    section: r.section,
                    index: r.offset,
                    limit: 0,
                })?
                .expect(ValueType::Integer, false)
                .and_then(|v| v.get_into_int()),
            other => Err(VmError::invalid_reference(format!(
                "cannot dereference indirect component through section {other:?}"
            ))),
        }
    }
}
