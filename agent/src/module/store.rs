use std::fs;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};

use protocol::{EntryPoint, PatchError};
use tempfile::NamedTempFile;
use tracing::debug;

use super::assembly::Assembly;
use super::{Instruction, MethodRef, Module};
use crate::entry_point;

const PE_MAGIC: [u8; 2] = *b"MZ";

/// How a module is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// A PE file carrying .NET metadata.
    Assembly,
    /// A serialized module image.
    Image,
}

#[derive(Debug)]
enum Backing {
    Image,
    Assembly(Box<Assembly>),
}

/// A module read from disk. Writable loads keep a scratch copy of the
/// original file beside it for as long as this value lives.
#[derive(Debug)]
pub struct LoadedModule {
    pub module: Module,
    path: PathBuf,
    // Dropped before the scratch file it may still be reading from.
    backing: Backing,
    scratch: Option<NamedTempFile>,
}

impl LoadedModule {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Format {
        match self.backing {
            Backing::Image => Format::Image,
            Backing::Assembly(_) => Format::Assembly,
        }
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(NamedTempFile::path)
    }

    /// Copies the untouched scratch copy back over the original path.
    pub fn restore_original(&self) -> Result<(), PatchError> {
        let Some(scratch) = self.scratch_path() else {
            return Ok(());
        };
        fs::copy(scratch, &self.path).map_err(|err| PatchError::io_at(&self.path, err))?;
        Ok(())
    }

    /// Inserts `[ldstr payload] call reference` at the start of the target
    /// method. An empty payload inserts the call alone.
    pub fn insert_call(&mut self, target: &EntryPoint, reference: MethodRef, payload: &str) -> Result<(), PatchError> {
        let location = entry_point::locate(&self.module, &target.type_name, &target.method_name)?;
        if let Backing::Assembly(assembly) = &mut self.backing {
            let version = self
                .module
                .references
                .iter()
                .find(|r| r.name == reference.module)
                .map(|r| r.version)
                .unwrap_or_default();
            assembly.insert_call(location, &reference, version, payload)?;
        }

        let mut prologue = Vec::with_capacity(2);
        if !payload.is_empty() {
            prologue.push(Instruction::ldstr(payload));
        }
        prologue.push(Instruction::call(reference));
        self.module.types[location.type_index].methods[location.method_index]
            .body
            .get_or_insert_with(Vec::new)
            .splice(0..0, prologue);
        Ok(())
    }

    /// Takes the instructions at `range` out of the target method and
    /// returns them.
    pub fn remove_instructions(
        &mut self,
        target: &EntryPoint,
        range: Range<usize>,
    ) -> Result<Vec<Instruction>, PatchError> {
        let location = entry_point::locate(&self.module, &target.type_name, &target.method_name)?;
        if let Backing::Assembly(assembly) = &mut self.backing {
            assembly.remove_instructions(location, range.clone())?;
        }

        let body = self.module.types[location.type_index].methods[location.method_index]
            .body
            .get_or_insert_with(Vec::new);
        let end = range.end.min(body.len());
        let start = range.start.min(end);
        Ok(body.drain(start..end).collect())
    }

    /// Writes the module back to the path it was loaded from.
    pub fn save(&mut self) -> Result<(), PatchError> {
        match &mut self.backing {
            Backing::Image => write(&self.module, &self.path),
            Backing::Assembly(assembly) => assembly.write(&self.path),
        }
    }
}

/// Tells the two on-disk formats apart by their leading bytes.
pub fn sniff(path: &Path) -> Result<Format, PatchError> {
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path).map_err(|err| PatchError::io_at(path, err))?;
    let read = file.read(&mut magic).map_err(|err| PatchError::io_at(path, err))?;
    if read >= PE_MAGIC.len() && magic[..PE_MAGIC.len()] == PE_MAGIC {
        Ok(Format::Assembly)
    } else {
        Ok(Format::Image)
    }
}

fn read_image(path: &Path) -> Result<Module, PatchError> {
    let bytes = fs::read(path).map_err(|err| PatchError::io_at(path, err))?;
    Module::decode(&bytes).map_err(|err| match err {
        PatchError::InvalidArgument(reason) => {
            PatchError::InvalidArgument(format!("{}: {reason}", path.display()))
        }
        other => other,
    })
}

fn open(path: &Path) -> Result<(Module, Backing), PatchError> {
    match sniff(path)? {
        Format::Assembly => {
            let (module, assembly) = Assembly::open(path)?;
            Ok((module, Backing::Assembly(Box::new(assembly))))
        }
        Format::Image => Ok((read_image(path)?, Backing::Image)),
    }
}

pub fn read_module(path: &Path) -> Result<Module, PatchError> {
    open(path).map(|(module, _)| module)
}

/// Attempts to load the module at `path`. Writable loads never read the
/// original file, they read a temporary copy placed in the same directory.
pub fn load(path: &Path, writable: bool) -> Result<LoadedModule, PatchError> {
    if !path.exists() {
        return Err(PatchError::missing_file(path));
    }

    if !writable {
        let (module, backing) = open(path)?;
        return Ok(LoadedModule {
            module,
            path: path.to_path_buf(),
            backing,
            scratch: None,
        });
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let scratch = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|err| PatchError::io_at(dir, err))?;
    fs::copy(path, scratch.path()).map_err(|err| PatchError::io_at(path, err))?;
    debug!(path = %path.display(), scratch = %scratch.path().display(), "loaded module through scratch copy");

    let (module, backing) = open(scratch.path()).map_err(|err| match err {
        PatchError::InvalidArgument(reason) => PatchError::InvalidArgument(
            reason.replace(&scratch.path().display().to_string(), &path.display().to_string()),
        ),
        other => other,
    })?;
    Ok(LoadedModule {
        module,
        path: path.to_path_buf(),
        backing,
        scratch: Some(scratch),
    })
}

/// Writes `module` as a module image.
pub fn write(module: &Module, path: &Path) -> Result<(), PatchError> {
    let bytes = module.encode()?;
    fs::write(path, bytes).map_err(|err| PatchError::io_at(path, err))
}
