use std::fmt;

use protocol::PatchError;
use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 4] = *b"EIMG";
pub const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub name: String,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    Class,
    Struct,
    Interface,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRef {
    pub module: String,
    pub type_name: String,
    pub name: String,
    pub return_type: String,
    pub parameters: Vec<String>,
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}::{}({})",
            self.return_type,
            self.type_name,
            self.name,
            self.parameters.join(",")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    Nop,
    Ldstr,
    Ldarg,
    LdcI4,
    Call,
    Callvirt,
    Newobj,
    Throw,
    Pop,
    Ret,
    /// Any other CIL opcode, kept by value.
    Other(u16),
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = match self {
            OpCode::Nop => "nop",
            OpCode::Ldstr => "ldstr",
            OpCode::Ldarg => "ldarg",
            OpCode::LdcI4 => "ldc.i4",
            OpCode::Call => "call",
            OpCode::Callvirt => "callvirt",
            OpCode::Newobj => "newobj",
            OpCode::Throw => "throw",
            OpCode::Pop => "pop",
            OpCode::Ret => "ret",
            OpCode::Other(code) => return write!(f, "op.{code:#04x}"),
        };
        f.write_str(mnemonic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    None,
    String(String),
    Int(i32),
    Method(MethodRef),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::String(s) => write!(f, "{s:?}"),
            Operand::Int(i) => write!(f, "{i}"),
            Operand::Method(method) => write!(f, "{method}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    pub fn simple(opcode: OpCode) -> Self {
        Self::new(opcode, Operand::None)
    }

    pub fn ldstr(value: impl Into<String>) -> Self {
        Self::new(OpCode::Ldstr, Operand::String(value.into()))
    }

    pub fn call(method: MethodRef) -> Self {
        Self::new(OpCode::Call, Operand::Method(method))
    }

    pub fn method_operand(&self) -> Option<&MethodRef> {
        match &self.operand {
            Operand::Method(method) => Some(method),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            _ => write!(f, "{} {}", self.opcode, self.operand),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub return_type: String,
    pub parameters: Vec<String>,
    pub body: Option<Vec<Instruction>>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            return_type: "System.Void".to_string(),
            parameters: Vec::new(),
            body: None,
        }
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_body(mut self, body: Vec<Instruction>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn instructions(&self) -> &[Instruction] {
        self.body.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub full_name: String,
    pub kind: TypeKind,
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    pub fn class(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            kind: TypeKind::Class,
            methods: Vec::new(),
        }
    }

    pub fn interface(full_name: impl Into<String>) -> Self {
        Self {
            kind: TypeKind::Interface,
            ..Self::class(full_name)
        }
    }

    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    pub fn is_concrete(&self) -> bool {
        self.kind != TypeKind::Interface
    }
}

/// In-memory view of a module. Module images serialize it directly; .NET
/// assemblies are decoded into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub version: Version,
    pub references: Vec<ModuleRef>,
    pub types: Vec<TypeDef>,
}

impl Module {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            references: Vec::new(),
            types: Vec::new(),
        }
    }

    pub fn with_reference(mut self, name: impl Into<String>, version: Version) -> Self {
        self.references.push(ModuleRef {
            name: name.into(),
            version,
        });
        self
    }

    pub fn with_type(mut self, ty: TypeDef) -> Self {
        self.types.push(ty);
        self
    }

    pub fn find_type(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|ty| ty.full_name == full_name)
    }

    pub fn find_type_mut(&mut self, full_name: &str) -> Option<&mut TypeDef> {
        self.types.iter_mut().find(|ty| ty.full_name == full_name)
    }

    /// Builds a reference usable from this module to `method` declared in
    /// `source`, registering `source` as a module reference when needed.
    pub fn import_method(&mut self, source: &Module, type_name: &str, method: &MethodDef) -> MethodRef {
        if source.name != self.name && !self.references.iter().any(|r| r.name == source.name) {
            self.references.push(ModuleRef {
                name: source.name.clone(),
                version: source.version,
            });
        }

        MethodRef {
            module: source.name.clone(),
            type_name: type_name.to_string(),
            name: method.name.clone(),
            return_type: method.return_type.clone(),
            parameters: method.parameters.clone(),
        }
    }

    /// Drops the reference to `name` if no instruction points into it anymore.
    pub fn prune_reference(&mut self, name: &str) -> bool {
        let in_use = self
            .types
            .iter()
            .flat_map(|ty| ty.methods.iter())
            .flat_map(|method| method.instructions())
            .filter_map(Instruction::method_operand)
            .any(|method| method.module == name);
        if in_use {
            return false;
        }

        let before = self.references.len();
        self.references.retain(|r| r.name != name);
        self.references.len() != before
    }

    pub fn encode(&self) -> Result<Vec<u8>, PatchError> {
        let body = postcard::to_stdvec(self)
            .map_err(|err| PatchError::Unknown(format!("Failed to encode module {}: {err}", self.name)))?;

        let mut bytes = Vec::with_capacity(MAGIC.len() + 2 + body.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PatchError> {
        let header = MAGIC.len() + 2;
        if bytes.len() < header || bytes[..MAGIC.len()] != MAGIC {
            return Err(PatchError::InvalidArgument("Not a module image".to_string()));
        }

        let version = u16::from_le_bytes([bytes[MAGIC.len()], bytes[MAGIC.len() + 1]]);
        if version != FORMAT_VERSION {
            return Err(PatchError::InvalidArgument(format!(
                "Unsupported module image version {version}"
            )));
        }

        postcard::from_bytes(&bytes[header..])
            .map_err(|err| PatchError::InvalidArgument(format!("Corrupt module image: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> Module {
        Module::new("Acme", Version::new(1, 0, 0, 0)).with_type(
            TypeDef::class("Acme.Loader").with_method(
                MethodDef::new("Start")
                    .with_parameters(["System.String"])
                    .with_body(vec![Instruction::simple(OpCode::Ret)]),
            ),
        )
    }

    #[test]
    fn encodes_with_header() {
        let module = loader();
        let bytes = module.encode().expect("encode");
        assert_eq!(&bytes[..4], b"EIMG");
        assert_eq!(Module::decode(&bytes).expect("decode"), module);
    }

    #[test]
    fn rejects_foreign_bytes() {
        let err = Module::decode(b"MZ\x90\x00\x03\x00").expect_err("not an image");
        assert!(matches!(err, PatchError::InvalidArgument(_)));
    }

    #[test]
    fn call_descriptor_contains_type_and_method() {
        let source = loader();
        let mut target = Module::new("Game", Version::new(1, 0, 0, 0));
        let method = &source.types[0].methods[0];
        let reference = target.import_method(&source, "Acme.Loader", method);

        let instruction = Instruction::call(reference);
        assert_eq!(
            instruction.to_string(),
            "call System.Void Acme.Loader::Start(System.String)"
        );
        assert_eq!(target.references.len(), 1);
        assert_eq!(Instruction::simple(OpCode::Other(0xFE0C)).to_string(), "op.0xfe0c");
    }

    #[test]
    fn prunes_only_unused_references() {
        let source = loader();
        let method = source.types[0].methods[0].clone();
        let mut target = Module::new("Game", Version::default())
            .with_type(TypeDef::class("Game.Boot").with_method(MethodDef::new("Main").with_body(vec![])));

        let reference = target.import_method(&source, "Acme.Loader", &method);
        target.types[0].methods[0].body = Some(vec![Instruction::call(reference)]);
        assert!(!target.prune_reference("Acme"));

        target.types[0].methods[0].body = Some(vec![]);
        assert!(target.prune_reference("Acme"));
        assert!(target.references.is_empty());
    }
}
