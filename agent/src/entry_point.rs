use protocol::{EntryPoint, PatchError};

use crate::module::{MethodDef, Module};

/// Index of a method inside a module: (type, method).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodLocation {
    pub type_index: usize,
    pub method_index: usize,
}

/// Finds the concrete type by exact name and the first method with a body
/// carrying the requested name. Overloads are not told apart.
pub fn locate(module: &Module, type_name: &str, method_name: &str) -> Result<MethodLocation, PatchError> {
    let type_index = module
        .types
        .iter()
        .position(|ty| ty.full_name == type_name && ty.is_concrete())
        .ok_or_else(|| PatchError::InvalidEntryPoint("Invalid entry point type".to_string()))?;

    let method_index = module.types[type_index]
        .methods
        .iter()
        .position(|method| method.name == method_name)
        .filter(|&index| module.types[type_index].methods[index].has_body())
        .ok_or_else(|| PatchError::InvalidEntryPoint("Invalid entry point method".to_string()))?;

    Ok(MethodLocation {
        type_index,
        method_index,
    })
}

pub fn resolve<'m>(module: &'m Module, entry: &EntryPoint) -> Result<&'m MethodDef, PatchError> {
    let location = locate(module, &entry.type_name, &entry.method_name)?;
    Ok(&module.types[location.type_index].methods[location.method_index])
}

pub fn resolve_mut<'m>(module: &'m mut Module, entry: &EntryPoint) -> Result<&'m mut MethodDef, PatchError> {
    let location = locate(module, &entry.type_name, &entry.method_name)?;
    Ok(&mut module.types[location.type_index].methods[location.method_index])
}
