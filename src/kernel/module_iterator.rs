//! Kernel-module iterator (spec §4.4): one interface, two back ends.
//!
//! Live mode walks `/proc/modules`; crash mode walks the in-kernel
//! `modules` linked list of `struct module`, chasing fields through
//! the DWARF-typed memory accessor. Per spec §9, the duality is
//! modeled as a tagged enum rather than a trait object or
//! inheritance: each variant carries the state shape its back end
//! actually needs.

use std::io::BufRead;

use crate::error::{Error, Result};
use crate::kernel::{SymbolResolver, TypedMemoryAccessor};

/// How to reach this module's build ID and section addresses (spec
/// §4.5, §4.6): each sibling component branches on this handle.
#[derive(Debug, Clone, Copy)]
pub enum ModuleHandle {
    Live,
    Crash { module_addr: u64 },
}

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub handle: ModuleHandle,
}

enum State<'a> {
    Live {
        lines: Box<dyn Iterator<Item = std::io::Result<String>> + 'a>,
    },
    Crash {
        accessor: &'a dyn TypedMemoryAccessor,
        module_ty: crate::kernel::TypeHandle,
        head_addr: u64,
        head_ty: crate::kernel::TypeHandle,
        current: u64,
    },
}

pub struct ModuleIterator<'a> {
    state: State<'a>,
    done: bool,
}

impl<'a> ModuleIterator<'a> {
    /// Live mode: `reader` is the contents of `/proc/modules`.
    pub fn live(reader: impl BufRead + 'a) -> Self {
        Self {
            state: State::Live {
                lines: Box::new(reader.lines()),
            },
            done: false,
        }
    }

    /// Crash mode: chases the `modules` list head via `resolver`,
    /// then `struct module.list` via `accessor`.
    pub fn crash(
        resolver: &'a dyn SymbolResolver,
        accessor: &'a dyn TypedMemoryAccessor,
    ) -> Result<Self> {
        let (head_addr, head_ty) = resolver.find_variable("modules")?;
        let module_ty = accessor.type_of("module")?;
        Ok(Self {
            state: State::Crash {
                accessor,
                module_ty,
                head_addr,
                head_ty,
                current: head_addr,
            },
            done: false,
        })
    }

    /// Produces the next module, or `Ok(None)` on clean exhaustion
    /// (spec: "signals stop"). Once an error is returned, the
    /// iterator must not be advanced again.
    pub fn advance(&mut self) -> Result<Option<ModuleRecord>> {
        if self.done {
            return Ok(None);
        }
        let result = match &mut self.state {
            State::Live { lines } => advance_live(lines),
            State::Crash {
                accessor,
                module_ty,
                head_addr,
                head_ty,
                current,
            } => advance_crash(*accessor, *module_ty, *head_addr, *head_ty, current),
        };
        if result.is_err() {
            self.done = true;
        }
        if let Ok(None) = result {
            self.done = true;
        }
        result
    }
}

fn advance_live(
    lines: &mut Box<dyn Iterator<Item = std::io::Result<String>> + '_>,
) -> Result<Option<ModuleRecord>> {
    loop {
        let Some(line) = lines.next() else {
            return Ok(None);
        };
        let line = line.map_err(|e| Error::os("read", e, "/proc/modules"))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let name = fields
            .next()
            .ok_or_else(|| Error::Other(format!("malformed /proc/modules line: {line:?}")))?;
        let size: u64 = fields
            .next()
            .ok_or_else(|| Error::Other(format!("missing size in /proc/modules line: {line:?}")))?
            .parse()
            .map_err(|_| Error::Overflow(line.clone()))?;
        // refcount, deps, state are not used by this subsystem.
        let _refcount = fields.next();
        let _deps = fields.next();
        let _module_state = fields.next();
        let addr_str = fields.next().ok_or_else(|| {
            Error::Other(format!("missing load address in /proc/modules line: {line:?}"))
        })?;
        let start = u64::from_str_radix(addr_str.trim_start_matches("0x"), 16)
            .map_err(|_| Error::Overflow(line.clone()))?;
        return Ok(Some(ModuleRecord {
            name: name.to_string(),
            start,
            end: start + size,
            handle: ModuleHandle::Live,
        }));
    }
}

fn advance_crash(
    accessor: &dyn TypedMemoryAccessor,
    module_ty: crate::kernel::TypeHandle,
    head_addr: u64,
    head_ty: crate::kernel::TypeHandle,
    current: &mut u64,
) -> Result<Option<ModuleRecord>> {
    let next = accessor.read_member(*current, head_ty, "next")?;
    if next == head_addr {
        return Ok(None);
    }
    let module_addr = accessor.container_of(next, module_ty, "list")?;
    *current = next;

    let (start, size) = match accessor.read_member(module_addr, module_ty, "core_layout.base") {
        Ok(base) => {
            let size = accessor.read_member(module_addr, module_ty, "core_layout.size")?;
            (base, size)
        }
        Err(Error::Lookup(_)) => {
            let base = accessor.read_member(module_addr, module_ty, "module_core")?;
            let size = accessor.read_member(module_addr, module_ty, "core_size")?;
            (base, size)
        }
        Err(e) => return Err(e),
    };

    let name_addr = accessor.member_address(module_addr, module_ty, "name")?;
    let name_bytes = accessor.read_cstring(name_addr, 64)?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    Ok(Some(ModuleRecord {
        name,
        start,
        end: start + size,
        handle: ModuleHandle::Crash { module_addr },
    }))
}
