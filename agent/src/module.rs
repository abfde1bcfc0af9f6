pub mod assembly;
pub mod cil;
pub mod image;
pub mod resolver;
pub mod store;

pub use image::{
    Instruction, MethodDef, MethodRef, Module, ModuleRef, OpCode, Operand, TypeDef, TypeKind, Version,
};
pub use resolver::Resolver;
pub use store::{Format, LoadedModule};
