use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::path::Path;

use dotscope::metadata::signatures::{encode_method_signature, SignatureMethod, SignatureParameter, TypeSignature};
use dotscope::metadata::tables::{
    AssemblyRaw, AssemblyRefRaw, CodedIndex, CodedIndexType, MemberRefRaw, MethodDefRaw, MethodSpecRaw,
    NestedClassRaw, TableDataOwned, TableId, TypeDefRaw, TypeRefRaw, TypeSpecRaw,
};
use dotscope::prelude::{AssemblyRefBuilder, MemberRefBuilder, TypeRefBuilder};
use dotscope::{CilAssembly, CilAssemblyView};
use protocol::PatchError;
use tracing::{debug, warn};

use super::cil::{self, Body, RawInstruction, RawOperand, TypeToken, OP_CALL, OP_LDSTR};
use super::{Instruction, MethodDef, MethodRef, Module, ModuleRef, OpCode, Operand, TypeDef, TypeKind, Version};
use crate::entry_point::MethodLocation;

const TYPE_INTERFACE: u32 = 0x20;
const FIELD_SIG: u8 = 0x06;
const USER_STRING_TABLE: u32 = 0x70;
const METHOD_DEF_TABLE: u32 = 0x06;
const MEMBER_REF_TABLE: u32 = 0x0A;
const METHOD_SPEC_TABLE: u32 = 0x2B;
const NESTING_LIMIT: usize = 16;

fn unreadable(path: &Path, err: impl fmt::Display) -> PatchError {
    PatchError::InvalidArgument(format!("{}: not a readable .NET assembly: {err}", path.display()))
}

fn edit_failed(err: impl fmt::Display) -> PatchError {
    PatchError::Unknown(format!("Failed to edit assembly: {err}"))
}

fn token(table: u32, row: u32) -> u32 {
    (table << 24) | row
}

fn nth<T>(rows: &[T], rid: u32) -> Option<&T> {
    rows.get(rid.checked_sub(1)? as usize)
}

/// Where a coded index points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    AssemblyRef(u32),
    TypeRef(u32),
    TypeDef(u32),
    TypeSpec(u32),
    MethodDef(u32),
    MemberRef(u32),
    Local,
}

impl From<&CodedIndex> for Scope {
    fn from(index: &CodedIndex) -> Self {
        match index.tag {
            TableId::AssemblyRef => Scope::AssemblyRef(index.row),
            TableId::TypeRef => Scope::TypeRef(index.row),
            TableId::TypeDef => Scope::TypeDef(index.row),
            TableId::TypeSpec => Scope::TypeSpec(index.row),
            TableId::MethodDef => Scope::MethodDef(index.row),
            TableId::MemberRef => Scope::MemberRef(index.row),
            _ => Scope::Local,
        }
    }
}

#[derive(Debug, Clone)]
struct TypeRefRow {
    scope: Scope,
    name: String,
    namespace: String,
}

#[derive(Debug, Clone)]
struct TypeDefRow {
    flags: u32,
    name: String,
    namespace: String,
    method_list: u32,
}

#[derive(Debug, Clone)]
struct MethodRow {
    rid: u32,
    rva: u32,
    name: String,
    signature: Vec<u8>,
    body: Option<Body>,
}

#[derive(Debug, Clone)]
struct MemberRefRow {
    class: Scope,
    name: String,
    signature: Vec<u8>,
}

/// The metadata rows the injector works with, copied out of the assembly.
#[derive(Debug, Clone, Default)]
struct Tables {
    name: String,
    version: Version,
    assembly_refs: Vec<ModuleRef>,
    type_refs: Vec<TypeRefRow>,
    type_defs: Vec<TypeDefRow>,
    methods: Vec<MethodRow>,
    member_refs: Vec<MemberRefRow>,
    type_specs: Vec<Vec<u8>>,
    method_specs: Vec<Scope>,
    enclosing: HashMap<u32, u32>,
    user_strings: Vec<u8>,
}

impl Tables {
    fn read(view: &CilAssemblyView, path: &Path) -> Result<Self, PatchError> {
        let strings = view.strings().ok_or_else(|| unreadable(path, "no #Strings heap"))?;
        let tables = view.tables().ok_or_else(|| unreadable(path, "no metadata tables"))?;
        let text = |index: u32| strings.get(index as usize).map(str::to_string).unwrap_or_default();
        let blob = |index: u32| {
            view.blobs()
                .and_then(|heap| heap.get(index as usize).ok())
                .map(<[u8]>::to_vec)
                .unwrap_or_default()
        };
        let file = view.file();
        let body_at = |rva: u32| {
            let offset = file.rva_to_offset(rva as usize).ok()?;
            match Body::parse(file.data().get(offset..)?) {
                Ok(body) => Some(body),
                Err(err) => {
                    debug!(rva, "skipping unreadable method body: {err}");
                    None
                }
            }
        };

        let mut out = Tables {
            user_strings: view.userstrings().map(|heap| heap.data().to_vec()).unwrap_or_default(),
            ..Tables::default()
        };

        if let Some(row) = tables.table::<AssemblyRaw>().and_then(|t| t.iter().next()) {
            out.name = text(row.name);
            out.version = Version::new(
                row.major_version as u16,
                row.minor_version as u16,
                row.build_number as u16,
                row.revision_number as u16,
            );
        }
        if out.name.is_empty() {
            out.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }

        if let Some(table) = tables.table::<AssemblyRefRaw>() {
            out.assembly_refs = table
                .iter()
                .map(|row| ModuleRef {
                    name: text(row.name),
                    version: Version::new(
                        row.major_version as u16,
                        row.minor_version as u16,
                        row.build_number as u16,
                        row.revision_number as u16,
                    ),
                })
                .collect();
        }
        if let Some(table) = tables.table::<TypeRefRaw>() {
            out.type_refs = table
                .iter()
                .map(|row| TypeRefRow {
                    scope: Scope::from(&row.resolution_scope),
                    name: text(row.type_name),
                    namespace: text(row.type_namespace),
                })
                .collect();
        }
        if let Some(table) = tables.table::<TypeDefRaw>() {
            out.type_defs = table
                .iter()
                .map(|row| TypeDefRow {
                    flags: row.flags,
                    name: text(row.type_name),
                    namespace: text(row.type_namespace),
                    method_list: row.method_list,
                })
                .collect();
        }
        if let Some(table) = tables.table::<MethodDefRaw>() {
            out.methods = table
                .iter()
                .map(|row| MethodRow {
                    rid: row.rid,
                    rva: row.rva,
                    name: text(row.name),
                    signature: blob(row.signature),
                    body: if row.rva == 0 { None } else { body_at(row.rva) },
                })
                .collect();
        }
        if let Some(table) = tables.table::<MemberRefRaw>() {
            out.member_refs = table
                .iter()
                .map(|row| MemberRefRow {
                    class: Scope::from(&row.class),
                    name: text(row.name),
                    signature: blob(row.signature),
                })
                .collect();
        }
        if let Some(table) = tables.table::<TypeSpecRaw>() {
            out.type_specs = table.iter().map(|row| blob(row.signature)).collect();
        }
        if let Some(table) = tables.table::<MethodSpecRaw>() {
            out.method_specs = table.iter().map(|row| Scope::from(&row.method)).collect();
        }
        if let Some(table) = tables.table::<NestedClassRaw>() {
            out.enclosing = table
                .iter()
                .map(|row| (row.nested_class, row.enclosing_class))
                .collect();
        }
        Ok(out)
    }

    /// Zero-based method indices owned by the type at `index`.
    fn method_range(&self, index: usize) -> Range<usize> {
        let count = self.methods.len();
        let Some(row) = self.type_defs.get(index) else {
            return 0..0;
        };
        let start = (row.method_list as usize).saturating_sub(1).min(count);
        let end = self
            .type_defs
            .get(index + 1)
            .map_or(count, |next| (next.method_list as usize).saturating_sub(1))
            .clamp(start, count);
        start..end
    }

    fn method_owner(&self, method_rid: u32) -> Option<u32> {
        let index = method_rid.checked_sub(1)? as usize;
        (0..self.type_defs.len())
            .find(|&ty| self.method_range(ty).contains(&index))
            .map(|ty| ty as u32 + 1)
    }

    fn type_def_name(&self, rid: u32) -> String {
        let mut parts = Vec::new();
        let mut current = rid;
        while let Some(row) = nth(&self.type_defs, current) {
            match self.enclosing.get(&current) {
                Some(&outer) if parts.len() < NESTING_LIMIT => {
                    parts.push(row.name.clone());
                    current = outer;
                }
                _ => {
                    parts.push(qualified(&row.namespace, &row.name));
                    break;
                }
            }
        }
        parts.reverse();
        parts.join("/")
    }

    fn type_ref_name(&self, rid: u32) -> String {
        let mut parts = Vec::new();
        let mut current = rid;
        while let Some(row) = nth(&self.type_refs, current) {
            match row.scope {
                Scope::TypeRef(outer) if parts.len() < NESTING_LIMIT => {
                    parts.push(row.name.clone());
                    current = outer;
                }
                _ => {
                    parts.push(qualified(&row.namespace, &row.name));
                    break;
                }
            }
        }
        parts.reverse();
        parts.join("/")
    }

    fn type_ref_module(&self, rid: u32) -> String {
        let mut current = rid;
        for _ in 0..NESTING_LIMIT {
            match nth(&self.type_refs, current).map(|row| row.scope) {
                Some(Scope::AssemblyRef(assembly)) => {
                    if let Some(reference) = nth(&self.assembly_refs, assembly) {
                        return reference.name.clone();
                    }
                    break;
                }
                Some(Scope::TypeRef(outer)) => current = outer,
                _ => break,
            }
        }
        self.name.clone()
    }

    fn sig_type_name(&self, token: TypeToken) -> String {
        match token {
            TypeToken::Def(rid) => self.type_def_name(rid),
            TypeToken::Ref(rid) => self.type_ref_name(rid),
            TypeToken::Spec(_) => "?".to_string(),
        }
    }

    fn signature(&self, blob: &[u8]) -> Option<cil::MethodSig> {
        if blob.first().is_some_and(|conv| conv & 0x0F == FIELD_SIG) {
            return None;
        }
        cil::method_sig(blob, &|t| self.sig_type_name(t)).ok()
    }

    /// Declaring (module, type) of a member reference parent.
    fn declaring(&self, class: Scope) -> (String, String) {
        match class {
            Scope::TypeRef(rid) => (self.type_ref_module(rid), self.type_ref_name(rid)),
            Scope::TypeDef(rid) => (self.name.clone(), self.type_def_name(rid)),
            Scope::TypeSpec(rid) => {
                let name = nth(&self.type_specs, rid)
                    .and_then(|blob| cil::type_spec(blob, &|t| self.sig_type_name(t)).ok())
                    .unwrap_or_else(|| "?".to_string());
                (self.name.clone(), name)
            }
            Scope::MethodDef(rid) => {
                let owner = self.method_owner(rid).unwrap_or_default();
                (self.name.clone(), self.type_def_name(owner))
            }
            _ => (self.name.clone(), "<Module>".to_string()),
        }
    }

    fn method_ref(&self, value: u32) -> Option<MethodRef> {
        let row = value & 0x00FF_FFFF;
        match value >> 24 {
            METHOD_DEF_TABLE => {
                let method = nth(&self.methods, row)?;
                let sig = self.signature(&method.signature)?;
                Some(MethodRef {
                    module: self.name.clone(),
                    type_name: self.type_def_name(self.method_owner(row)?),
                    name: method.name.clone(),
                    return_type: sig.return_type,
                    parameters: sig.parameters,
                })
            }
            MEMBER_REF_TABLE => {
                let member = nth(&self.member_refs, row)?;
                let sig = self.signature(&member.signature)?;
                let (module, type_name) = self.declaring(member.class);
                Some(MethodRef {
                    module,
                    type_name,
                    name: member.name.clone(),
                    return_type: sig.return_type,
                    parameters: sig.parameters,
                })
            }
            METHOD_SPEC_TABLE => match nth(&self.method_specs, row)? {
                Scope::MethodDef(rid) => self.method_ref(token(METHOD_DEF_TABLE, *rid)),
                Scope::MemberRef(rid) => self.method_ref(token(MEMBER_REF_TABLE, *rid)),
                _ => None,
            },
            _ => None,
        }
    }

    fn instruction(&self, raw: &RawInstruction) -> Instruction {
        let opcode = match raw.opcode {
            0x00 => OpCode::Nop,
            0x72 => OpCode::Ldstr,
            0x02..=0x05 | 0x0E | 0xFE09 => OpCode::Ldarg,
            0x15..=0x20 => OpCode::LdcI4,
            0x28 => OpCode::Call,
            0x6F => OpCode::Callvirt,
            0x73 => OpCode::Newobj,
            0x7A => OpCode::Throw,
            0x26 => OpCode::Pop,
            0x2A => OpCode::Ret,
            other => OpCode::Other(other),
        };
        let operand = match (opcode, raw.operand) {
            (OpCode::Ldstr, RawOperand::Token(value)) if value >> 24 == USER_STRING_TABLE => {
                cil::user_string(&self.user_strings, (value & 0x00FF_FFFF) as usize)
                    .map_or(Operand::None, Operand::String)
            }
            (OpCode::Call | OpCode::Callvirt | OpCode::Newobj, RawOperand::Token(value)) => {
                self.method_ref(value).map_or(Operand::None, Operand::Method)
            }
            (_, RawOperand::Int(value)) => Operand::Int(value),
            _ => Operand::None,
        };
        Instruction::new(opcode, operand)
    }

    fn method_view(&self, method: &MethodRow) -> MethodDef {
        let sig = self.signature(&method.signature);
        let body = (method.rva != 0).then(|| {
            method
                .body
                .as_ref()
                .and_then(|body| cil::instructions(&body.code).ok())
                .map(|raw| raw.iter().map(|i| self.instruction(i)).collect::<Vec<_>>())
                .unwrap_or_default()
        });
        MethodDef {
            name: method.name.clone(),
            return_type: sig.as_ref().map_or_else(|| "?".to_string(), |s| s.return_type.clone()),
            parameters: sig.map(|s| s.parameters).unwrap_or_default(),
            body,
        }
    }

    fn to_module(&self) -> Module {
        let mut module = Module::new(&self.name, self.version);
        module.references = self.assembly_refs.clone();
        module.types = self
            .type_defs
            .iter()
            .enumerate()
            .map(|(index, row)| TypeDef {
                full_name: self.type_def_name(index as u32 + 1),
                kind: if row.flags & TYPE_INTERFACE != 0 {
                    TypeKind::Interface
                } else {
                    TypeKind::Class
                },
                methods: self.methods[self.method_range(index)]
                    .iter()
                    .map(|method| self.method_view(method))
                    .collect(),
            })
            .collect();
        module
    }

    fn method_index(&self, location: MethodLocation) -> Option<usize> {
        let range = self.method_range(location.type_index);
        let index = range.start + location.method_index;
        range.contains(&index).then_some(index)
    }

    fn find_method_def(&self, reference: &MethodRef) -> Option<u32> {
        (0..self.type_defs.len())
            .filter(|&ty| self.type_def_name(ty as u32 + 1) == reference.type_name)
            .flat_map(|ty| self.method_range(ty))
            .find(|&index| self.method_ref(token(METHOD_DEF_TABLE, index as u32 + 1)).as_ref() == Some(reference))
            .map(|index| token(METHOD_DEF_TABLE, index as u32 + 1))
    }

    fn find_member_ref(&self, reference: &MethodRef) -> Option<u32> {
        (1..=self.member_refs.len() as u32)
            .map(|rid| token(MEMBER_REF_TABLE, rid))
            .find(|&value| self.method_ref(value).as_ref() == Some(reference))
    }

    fn find_assembly_ref(&self, name: &str) -> Option<u32> {
        self.assembly_refs
            .iter()
            .position(|r| r.name == name)
            .map(|index| index as u32 + 1)
    }

    fn find_type_ref(&self, assembly: u32, type_name: &str) -> Option<u32> {
        (1..=self.type_refs.len() as u32).find(|&rid| {
            nth(&self.type_refs, rid).is_some_and(|row| row.scope == Scope::AssemblyRef(assembly))
                && self.type_ref_name(rid) == type_name
        })
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

fn type_signature(name: &str) -> Option<TypeSignature> {
    Some(match name {
        "System.Void" => TypeSignature::Void,
        "System.Boolean" => TypeSignature::Boolean,
        "System.Char" => TypeSignature::Char,
        "System.SByte" => TypeSignature::I1,
        "System.Byte" => TypeSignature::U1,
        "System.Int16" => TypeSignature::I2,
        "System.UInt16" => TypeSignature::U2,
        "System.Int32" => TypeSignature::I4,
        "System.UInt32" => TypeSignature::U4,
        "System.Int64" => TypeSignature::I8,
        "System.UInt64" => TypeSignature::U8,
        "System.Single" => TypeSignature::R4,
        "System.Double" => TypeSignature::R8,
        "System.String" => TypeSignature::String,
        "System.Object" => TypeSignature::Object,
        "System.IntPtr" => TypeSignature::I,
        "System.UIntPtr" => TypeSignature::U,
        _ => return None,
    })
}

fn parameter(name: &str) -> Result<SignatureParameter, PatchError> {
    let base = type_signature(name)
        .ok_or_else(|| PatchError::InvalidEntryPoint(format!("Unsupported entry point parameter type {name}")))?;
    Ok(SignatureParameter {
        modifiers: Vec::new(),
        by_ref: false,
        base,
    })
}

/// Blob for a static call to `reference`.
fn static_signature(reference: &MethodRef) -> Result<Vec<u8>, PatchError> {
    let params = reference
        .parameters
        .iter()
        .map(|name| parameter(name))
        .collect::<Result<Vec<_>, _>>()?;
    let signature = SignatureMethod {
        has_this: false,
        explicit_this: false,
        default: true,
        vararg: false,
        cdecl: false,
        stdcall: false,
        thiscall: false,
        fastcall: false,
        param_count_generic: 0,
        param_count: params.len() as u32,
        return_type: parameter(&reference.return_type)?,
        params,
        varargs: Vec::new(),
    };
    encode_method_signature(&signature).map_err(edit_failed)
}

/// A .NET assembly opened for reading and, optionally, editing.
pub struct Assembly {
    inner: Option<CilAssembly>,
    tables: Tables,
}

impl fmt::Debug for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assembly")
            .field("name", &self.tables.name)
            .field("methods", &self.tables.methods.len())
            .finish_non_exhaustive()
    }
}

impl Assembly {
    /// Opens the PE file at `path` and builds its module view.
    pub fn open(path: &Path) -> Result<(Module, Self), PatchError> {
        let view = CilAssemblyView::from_path(path).map_err(|err| unreadable(path, err))?;
        let tables = Tables::read(&view, path)?;
        let module = tables.to_module();
        debug!(path = %path.display(), types = module.types.len(), "read assembly");
        Ok((
            module,
            Self {
                inner: Some(CilAssembly::new(view)),
                tables,
            },
        ))
    }

    fn editable(&mut self) -> Result<&mut CilAssembly, PatchError> {
        self.inner
            .as_mut()
            .ok_or_else(|| PatchError::Unknown(format!("Assembly {} was already written", self.tables.name)))
    }

    fn body_of(&self, index: usize) -> Result<Body, PatchError> {
        self.tables.methods[index].body.clone().ok_or_else(|| {
            PatchError::InvalidEntryPoint(format!(
                "Method {} has no readable body",
                self.tables.methods[index].name
            ))
        })
    }

    fn located(&self, location: MethodLocation) -> Result<usize, PatchError> {
        self.tables
            .method_index(location)
            .ok_or_else(|| PatchError::InvalidEntryPoint("Invalid entry point method".to_string()))
    }

    /// Token usable from this assembly to call `reference`, adding the
    /// assembly, type and member references it needs.
    fn method_token(&mut self, reference: &MethodRef, version: Version) -> Result<u32, PatchError> {
        if reference.module == self.tables.name {
            return self.tables.find_method_def(reference).ok_or_else(|| {
                PatchError::InvalidEntryPoint(format!("Unable to find {reference} in {}", self.tables.name))
            });
        }
        if let Some(existing) = self.tables.find_member_ref(reference) {
            return Ok(existing);
        }

        let signature = static_signature(reference)?;
        let (namespace, name) = reference
            .type_name
            .rsplit_once('.')
            .unwrap_or(("", reference.type_name.as_str()));
        let existing_assembly = self.tables.find_assembly_ref(&reference.module);
        let existing_type = existing_assembly.and_then(|rid| self.tables.find_type_ref(rid, &reference.type_name));
        let assembly = self.editable()?;

        let scope = match existing_assembly {
            Some(rid) => rid,
            None => AssemblyRefBuilder::new()
                .name(&reference.module)
                .version(
                    version.major.into(),
                    version.minor.into(),
                    version.build.into(),
                    version.revision.into(),
                )
                .build(assembly)
                .map_err(edit_failed)?
                .placeholder(),
        };
        let type_ref = match existing_type {
            Some(rid) => rid,
            None => TypeRefBuilder::new()
                .name(name)
                .namespace(namespace)
                .resolution_scope(CodedIndex::new(TableId::AssemblyRef, scope, CodedIndexType::ResolutionScope))
                .build(assembly)
                .map_err(edit_failed)?
                .placeholder(),
        };
        let member = MemberRefBuilder::new()
            .name(&reference.name)
            .class(CodedIndex::new(TableId::TypeRef, type_ref, CodedIndexType::MemberRefParent))
            .signature(&signature)
            .build(assembly)
            .map_err(edit_failed)?;
        member
            .placeholder_token()
            .map(|t| t.value())
            .ok_or_else(|| edit_failed("member reference has no token"))
    }

    /// Stores `body` as the new body of the method at `index`.
    fn replace_body(&mut self, index: usize, body: Body) -> Result<(), PatchError> {
        let rid = self.tables.methods[index].rid;
        let assembly = self.editable()?;
        let mut row = assembly
            .view()
            .tables()
            .and_then(|tables| tables.table::<MethodDefRaw>())
            .and_then(|table| table.get(rid))
            .ok_or_else(|| edit_failed(format!("no MethodDef row {rid}")))?;
        row.rva = assembly.store_method_body(body.encode());
        assembly
            .table_row_update(TableId::MethodDef, rid, TableDataOwned::MethodDef(row))
            .map_err(edit_failed)?;
        self.tables.methods[index].body = Some(body);
        Ok(())
    }

    /// Puts `[ldstr payload] call reference` at the start of the method.
    pub fn insert_call(
        &mut self,
        location: MethodLocation,
        reference: &MethodRef,
        version: Version,
        payload: &str,
    ) -> Result<(), PatchError> {
        let index = self.located(location)?;
        let mut body = self.body_of(index)?;
        let call = self.method_token(reference, version)?;

        let mut prologue = Vec::with_capacity(10);
        if !payload.is_empty() {
            let string = self.editable()?.userstring_add(payload).map_err(edit_failed)?;
            prologue.extend_from_slice(&cil::with_token(OP_LDSTR, token(USER_STRING_TABLE, string.placeholder())));
        }
        prologue.extend_from_slice(&cil::with_token(OP_CALL, call));

        body.prepend(&prologue, reference.parameters.len().max(1) as u16);
        self.replace_body(index, body)
    }

    /// Takes instructions `range` (by position) out of the method.
    pub fn remove_instructions(&mut self, location: MethodLocation, range: Range<usize>) -> Result<(), PatchError> {
        let index = self.located(location)?;
        let mut body = self.body_of(index)?;
        let walked = cil::instructions(&body.code)?;
        let (Some(first), Some(last)) = (walked.get(range.start), range.end.checked_sub(1).and_then(|i| walked.get(i)))
        else {
            warn!(?range, "instruction range outside method body");
            return Ok(());
        };

        body.erase(first.offset..last.end());
        self.replace_body(index, body)
    }

    pub fn write(&mut self, path: &Path) -> Result<(), PatchError> {
        let mut assembly = self
            .inner
            .take()
            .ok_or_else(|| PatchError::Unknown(format!("Assembly {} was already written", self.tables.name)))?;
        assembly
            .to_file(path)
            .map_err(|err| PatchError::FileOperation(format!("{}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(name: &str, signature: Vec<u8>, code: Option<Vec<u8>>) -> MethodRow {
        let body = code.map(|code| {
            let mut bytes = vec![((code.len() as u8) << 2) | 0x2];
            bytes.extend_from_slice(&code);
            Body::parse(&bytes).expect("tiny body")
        });
        MethodRow {
            rid: 0,
            rva: if body.is_some() { 0x2050 } else { 0 },
            name: name.to_string(),
            signature,
            body,
        }
    }

    fn call(opcode: u16, value: u32) -> Vec<u8> {
        cil::with_token(opcode, value).to_vec()
    }

    /// A game assembly whose `Game.Boot::Main` calls into `Acme` and a corlib
    /// whose `AssemblyBuilder.DefineDynamicAssembly` throws.
    fn tables() -> Tables {
        let mut main = call(OP_LDSTR, token(USER_STRING_TABLE, 1));
        main.extend(call(OP_CALL, token(MEMBER_REF_TABLE, 1)));
        main.push(0x2A);

        let mut define = call(0x73, token(MEMBER_REF_TABLE, 2));
        define.push(0x7A);

        let mut tables = Tables {
            name: "Game".to_string(),
            version: Version::new(1, 2, 0, 0),
            assembly_refs: vec![ModuleRef {
                name: "Acme".to_string(),
                version: Version::new(1, 0, 0, 0),
            }],
            type_refs: vec![
                TypeRefRow {
                    scope: Scope::AssemblyRef(1),
                    name: "Loader".to_string(),
                    namespace: "Acme".to_string(),
                },
                TypeRefRow {
                    scope: Scope::AssemblyRef(1),
                    name: "PlatformNotSupportedException".to_string(),
                    namespace: "System".to_string(),
                },
            ],
            type_defs: vec![
                TypeDefRow {
                    flags: 0,
                    name: "<Module>".to_string(),
                    namespace: String::new(),
                    method_list: 1,
                },
                TypeDefRow {
                    flags: TYPE_INTERFACE,
                    name: "IBoot".to_string(),
                    namespace: "Game".to_string(),
                    method_list: 1,
                },
                TypeDefRow {
                    flags: 0,
                    name: "Boot".to_string(),
                    namespace: "Game".to_string(),
                    method_list: 2,
                },
                TypeDefRow {
                    flags: 0,
                    name: "Hidden".to_string(),
                    namespace: String::new(),
                    method_list: 4,
                },
                TypeDefRow {
                    flags: 0,
                    name: "AssemblyBuilder".to_string(),
                    namespace: "System.Reflection.Emit".to_string(),
                    method_list: 4,
                },
            ],
            methods: vec![
                method("Main", vec![0x20, 0x00, 0x01], None),
                method("Main", vec![0x00, 0x00, 0x01], Some(main)),
                method("Helper", vec![0x00, 0x01, 0x08, 0x0E], Some(vec![0x16, 0x2A])),
                method("DefineDynamicAssembly", vec![0x00, 0x02, 0x1C, 0x1C, 0x08], Some(define)),
            ],
            member_refs: vec![
                MemberRefRow {
                    class: Scope::TypeRef(1),
                    name: "Start".to_string(),
                    signature: vec![0x00, 0x01, 0x01, 0x0E],
                },
                MemberRefRow {
                    class: Scope::TypeRef(2),
                    name: ".ctor".to_string(),
                    signature: vec![0x20, 0x00, 0x01],
                },
            ],
            enclosing: HashMap::from([(4, 3)]),
            user_strings: vec![0x00, 0x07, b'm', 0, b'o', 0, b'd', 0, 0x00],
            ..Tables::default()
        };
        for (index, row) in tables.methods.iter_mut().enumerate() {
            row.rid = index as u32 + 1;
        }
        tables
    }

    #[test]
    fn builds_module_view_from_metadata_rows() {
        let module = tables().to_module();
        assert_eq!(module.name, "Game");
        assert_eq!(module.version, Version::new(1, 2, 0, 0));
        assert_eq!(module.references[0].name, "Acme");

        let names: Vec<&str> = module.types.iter().map(|t| t.full_name.as_str()).collect();
        assert_eq!(
            names,
            ["<Module>", "Game.IBoot", "Game.Boot", "Game.Boot/Hidden", "System.Reflection.Emit.AssemblyBuilder"]
        );
        assert!(!module.types[1].is_concrete());
        assert!(module.types[1].methods[0].body.is_none());

        let boot = &module.types[2];
        assert_eq!(boot.methods.len(), 2);
        assert_eq!(boot.methods[1].return_type, "System.Int32");
        assert_eq!(boot.methods[1].parameters, ["System.String"]);
    }

    #[test]
    fn resolves_call_operands_through_references() {
        let module = tables().to_module();
        let body = module.types[2].methods[0].instructions();
        assert_eq!(body[0], Instruction::ldstr("mod"));
        assert_eq!(body[1].to_string(), "call System.Void Acme.Loader::Start(System.String)");
        assert_eq!(body[1].method_operand().map(|m| m.module.as_str()), Some("Acme"));
        assert_eq!(body[2], Instruction::simple(OpCode::Ret));

        let helper = module.types[2].methods[1].instructions();
        assert_eq!(helper[0], Instruction::new(OpCode::LdcI4, Operand::Int(0)));
    }

    #[test]
    fn throwing_builder_is_visible_in_the_view() {
        let module = tables().to_module();
        let builder = module
            .find_type("System.Reflection.Emit.AssemblyBuilder")
            .expect("builder type");
        let define = &builder.methods[0];
        assert_eq!(define.parameters.len(), 2);
        assert!(define
            .instructions()
            .iter()
            .any(|i| i.to_string().contains("PlatformNotSupportedException")));
    }

    #[test]
    fn finds_existing_references_before_adding_new_ones() {
        let tables = tables();
        let start = tables.method_ref(token(MEMBER_REF_TABLE, 1)).expect("member ref");
        assert_eq!(tables.find_member_ref(&start), Some(token(MEMBER_REF_TABLE, 1)));
        assert_eq!(tables.find_assembly_ref("Acme"), Some(1));
        assert_eq!(tables.find_type_ref(1, "Acme.Loader"), Some(1));
        assert_eq!(tables.find_type_ref(1, "Acme.Other"), None);

        let helper = tables.method_ref(token(METHOD_DEF_TABLE, 3)).expect("method def");
        assert_eq!(helper.type_name, "Game.Boot");
        assert_eq!(tables.find_method_def(&helper), Some(token(METHOD_DEF_TABLE, 3)));
    }

    #[test]
    fn locations_map_onto_method_rows() {
        let tables = tables();
        let location = MethodLocation {
            type_index: 2,
            method_index: 1,
        };
        assert_eq!(tables.method_index(location), Some(2));
        assert_eq!(
            tables.method_index(MethodLocation {
                type_index: 3,
                method_index: 0,
            }),
            None
        );
    }

    #[test]
    fn static_signatures_cover_primitive_parameters() {
        let start = tables().method_ref(token(MEMBER_REF_TABLE, 1)).expect("member ref");
        assert!(static_signature(&start).is_ok());

        let unsupported = MethodRef {
            parameters: vec!["Acme.Options".to_string()],
            ..start
        };
        let err = static_signature(&unsupported).expect_err("class parameter");
        assert!(err.to_string().contains("Acme.Options"));
    }

    #[test]
    fn foreign_bytes_are_not_an_assembly() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("Fake.dll");
        let mut bytes = b"MZ".to_vec();
        bytes.resize(256, 0);
        std::fs::write(&path, bytes).expect("write fake");

        let err = Assembly::open(&path).expect_err("not a .NET assembly");
        assert_eq!(err.kind(), protocol::ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("Fake.dll"), "{err}");
    }
}
