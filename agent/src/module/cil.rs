//! Byte-level CIL: method body headers, exception clauses, instruction
//! walking and method signature blobs (ECMA-335 II.23.2, II.25.4, III.1).

use protocol::PatchError;

const TINY_FORMAT: u8 = 0x2;
const FAT_FORMAT: u16 = 0x3;
const MORE_SECTS: u16 = 0x8;
const INIT_LOCALS: u16 = 0x10;
const FAT_HEADER_DWORDS: u16 = 3;
const TINY_MAX_CODE: usize = 64;
const TINY_MAX_STACK: u16 = 8;

const SECT_EH_TABLE: u8 = 0x1;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;
const CLAUSE_FILTER: u32 = 0x1;

pub const OP_NOP: u16 = 0x00;
pub const OP_CALL: u16 = 0x28;
pub const OP_LDSTR: u16 = 0x72;

fn malformed(what: &str) -> PatchError {
    PatchError::InvalidArgument(format!("Malformed method body: {what}"))
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, PatchError> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| malformed("truncated"))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, PatchError> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| malformed("truncated"))
}

fn byte(bytes: &[u8], at: usize) -> Result<u8, PatchError> {
    bytes.get(at).copied().ok_or_else(|| malformed("truncated"))
}

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clause {
    pub flags: u32,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    pub token_or_filter: u32,
}

impl Clause {
    fn shift(&mut self, delta: i64) {
        let moved = |offset: u32| (i64::from(offset) + delta).max(0) as u32;
        self.try_offset = moved(self.try_offset);
        self.handler_offset = moved(self.handler_offset);
        if self.flags & CLAUSE_FILTER != 0 {
            self.token_or_filter = moved(self.token_or_filter);
        }
    }

    fn fits_small(&self) -> bool {
        self.try_offset <= 0xFFFF
            && self.handler_offset <= 0xFFFF
            && self.try_length <= 0xFF
            && self.handler_length <= 0xFF
    }
}

/// A decoded method body. Re-encoding an untouched body gives back the
/// bytes it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub fat: bool,
    pub init_locals: bool,
    pub max_stack: u16,
    pub local_var_sig: u32,
    pub code: Vec<u8>,
    pub clauses: Vec<Clause>,
    fat_clauses: bool,
}

impl Body {
    pub fn parse(bytes: &[u8]) -> Result<Self, PatchError> {
        let first = byte(bytes, 0)?;
        if first & 0x3 == TINY_FORMAT {
            let size = usize::from(first >> 2);
            let code = bytes.get(1..1 + size).ok_or_else(|| malformed("code past end"))?;
            return Ok(Self {
                fat: false,
                init_locals: false,
                max_stack: TINY_MAX_STACK,
                local_var_sig: 0,
                code: code.to_vec(),
                clauses: Vec::new(),
                fat_clauses: false,
            });
        }

        let flags = read_u16(bytes, 0)?;
        if flags & 0x3 != FAT_FORMAT {
            return Err(malformed("unknown header format"));
        }
        let header = usize::from(flags >> 12) * 4;
        let max_stack = read_u16(bytes, 2)?;
        let size = read_u32(bytes, 4)? as usize;
        let local_var_sig = read_u32(bytes, 8)?;
        let code = bytes
            .get(header..header + size)
            .ok_or_else(|| malformed("code past end"))?
            .to_vec();

        let mut clauses = Vec::new();
        let mut fat_clauses = false;
        let mut more = flags & MORE_SECTS != 0;
        let mut at = align4(header + size);
        while more {
            let kind = byte(bytes, at)?;
            if kind & SECT_EH_TABLE == 0 {
                return Err(malformed("unsupported data section"));
            }
            let data_size = if kind & SECT_FAT_FORMAT != 0 {
                fat_clauses = true;
                let raw = read_u32(bytes, at)? >> 8;
                let count = raw.saturating_sub(4) as usize / 24;
                for index in 0..count {
                    let c = at + 4 + index * 24;
                    clauses.push(Clause {
                        flags: read_u32(bytes, c)?,
                        try_offset: read_u32(bytes, c + 4)?,
                        try_length: read_u32(bytes, c + 8)?,
                        handler_offset: read_u32(bytes, c + 12)?,
                        handler_length: read_u32(bytes, c + 16)?,
                        token_or_filter: read_u32(bytes, c + 20)?,
                    });
                }
                raw as usize
            } else {
                let raw = usize::from(byte(bytes, at + 1)?);
                let count = raw.saturating_sub(4) / 12;
                for index in 0..count {
                    let c = at + 4 + index * 12;
                    clauses.push(Clause {
                        flags: u32::from(read_u16(bytes, c)?),
                        try_offset: u32::from(read_u16(bytes, c + 2)?),
                        try_length: u32::from(byte(bytes, c + 4)?),
                        handler_offset: u32::from(read_u16(bytes, c + 5)?),
                        handler_length: u32::from(byte(bytes, c + 7)?),
                        token_or_filter: read_u32(bytes, c + 8)?,
                    });
                }
                raw
            };
            more = kind & SECT_MORE_SECTS != 0;
            at = align4(at + data_size.max(4));
        }

        Ok(Self {
            fat: true,
            init_locals: flags & INIT_LOCALS != 0,
            max_stack,
            local_var_sig,
            code,
            clauses,
            fat_clauses,
        })
    }

    fn fits_tiny(&self) -> bool {
        self.code.len() < TINY_MAX_CODE
            && self.max_stack <= TINY_MAX_STACK
            && self.local_var_sig == 0
            && self.clauses.is_empty()
            && !self.init_locals
    }

    pub fn encode(&self) -> Vec<u8> {
        if !self.fat && self.fits_tiny() {
            let mut bytes = Vec::with_capacity(1 + self.code.len());
            bytes.push(((self.code.len() as u8) << 2) | TINY_FORMAT);
            bytes.extend_from_slice(&self.code);
            return bytes;
        }

        let mut flags = FAT_FORMAT | (FAT_HEADER_DWORDS << 12);
        if self.init_locals {
            flags |= INIT_LOCALS;
        }
        if !self.clauses.is_empty() {
            flags |= MORE_SECTS;
        }

        let mut bytes = Vec::with_capacity(12 + self.code.len());
        bytes.extend_from_slice(&flags.to_le_bytes());
        bytes.extend_from_slice(&self.max_stack.to_le_bytes());
        bytes.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.local_var_sig.to_le_bytes());
        bytes.extend_from_slice(&self.code);
        if self.clauses.is_empty() {
            return bytes;
        }

        bytes.resize(align4(bytes.len()), 0);
        let small = !self.fat_clauses
            && self.clauses.len() * 12 + 4 <= 0xFF
            && self.clauses.iter().all(Clause::fits_small);
        if small {
            bytes.extend_from_slice(&[SECT_EH_TABLE, (self.clauses.len() * 12 + 4) as u8, 0, 0]);
            for clause in &self.clauses {
                bytes.extend_from_slice(&(clause.flags as u16).to_le_bytes());
                bytes.extend_from_slice(&(clause.try_offset as u16).to_le_bytes());
                bytes.push(clause.try_length as u8);
                bytes.extend_from_slice(&(clause.handler_offset as u16).to_le_bytes());
                bytes.push(clause.handler_length as u8);
                bytes.extend_from_slice(&clause.token_or_filter.to_le_bytes());
            }
        } else {
            let size = (self.clauses.len() * 24 + 4) as u32;
            bytes.extend_from_slice(&((size << 8) | u32::from(SECT_EH_TABLE | SECT_FAT_FORMAT)).to_le_bytes());
            for clause in &self.clauses {
                for field in [
                    clause.flags,
                    clause.try_offset,
                    clause.try_length,
                    clause.handler_offset,
                    clause.handler_length,
                    clause.token_or_filter,
                ] {
                    bytes.extend_from_slice(&field.to_le_bytes());
                }
            }
        }
        bytes
    }

    /// Puts `prefix` in front of the existing code. Branches are relative so
    /// only exception clause offsets move.
    pub fn prepend(&mut self, prefix: &[u8], stack: u16) {
        self.code.splice(0..0, prefix.iter().copied());
        for clause in &mut self.clauses {
            clause.shift(prefix.len() as i64);
        }
        self.max_stack = self.max_stack.max(stack);
    }

    /// Takes `range` out of the code. A range at the start is cut; anywhere
    /// else it is overwritten with `nop` so branch distances stay valid.
    pub fn erase(&mut self, range: std::ops::Range<usize>) {
        if range.start == 0 {
            let len = range.len();
            self.code.drain(range);
            for clause in &mut self.clauses {
                clause.shift(-(len as i64));
            }
        } else {
            self.code[range].fill(OP_NOP as u8);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOperand {
    None,
    Token(u32),
    Int(i32),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInstruction {
    pub offset: usize,
    pub len: usize,
    pub opcode: u16,
    pub operand: RawOperand,
}

impl RawInstruction {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

#[derive(Clone, Copy)]
enum Shape {
    None,
    U8,
    I8,
    U16,
    I32,
    Token,
    Eight,
    Switch,
}

fn shape(opcode: u16) -> Shape {
    match opcode {
        0x0E..=0x13 | 0x2B..=0x37 | 0xDE => Shape::U8,
        0x1F => Shape::I8,
        0x20 => Shape::I32,
        0x21 | 0x23 => Shape::Eight,
        0x22 | 0x38..=0x44 | 0xDD => Shape::Token,
        0x45 => Shape::Switch,
        0x27..=0x29
        | 0x6F..=0x75
        | 0x79
        | 0x7B..=0x81
        | 0x8C
        | 0x8D
        | 0x8F
        | 0xA3..=0xA5
        | 0xC2
        | 0xC6
        | 0xD0 => Shape::Token,
        0xFE06 | 0xFE07 | 0xFE15 | 0xFE16 | 0xFE1C => Shape::Token,
        0xFE09..=0xFE0E => Shape::U16,
        0xFE12 | 0xFE19 => Shape::U8,
        _ => Shape::None,
    }
}

fn is_token_operand(opcode: u16) -> bool {
    !matches!(opcode, 0x22 | 0x38..=0x44 | 0xDD)
}

/// Walks `code` into instructions with their offsets.
pub fn instructions(code: &[u8]) -> Result<Vec<RawInstruction>, PatchError> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < code.len() {
        let start = at;
        let mut opcode = u16::from(code[at]);
        at += 1;
        if opcode == 0xFE {
            opcode = 0xFE00 | u16::from(byte(code, at)?);
            at += 1;
        }

        let operand = match shape(opcode) {
            Shape::None => match opcode {
                0x15 => RawOperand::Int(-1),
                0x16..=0x1E => RawOperand::Int(i32::from(opcode) - 0x16),
                _ => RawOperand::None,
            },
            Shape::U8 => {
                at += 1;
                RawOperand::Other
            }
            Shape::I8 => {
                let value = byte(code, at)? as i8;
                at += 1;
                RawOperand::Int(i32::from(value))
            }
            Shape::U16 => {
                at += 2;
                RawOperand::Other
            }
            Shape::I32 => {
                let value = read_u32(code, at)? as i32;
                at += 4;
                RawOperand::Int(value)
            }
            Shape::Token => {
                let value = read_u32(code, at)?;
                at += 4;
                if is_token_operand(opcode) {
                    RawOperand::Token(value)
                } else {
                    RawOperand::Other
                }
            }
            Shape::Eight => {
                at += 8;
                RawOperand::Other
            }
            Shape::Switch => {
                let count = read_u32(code, at)? as usize;
                at += 4 + count * 4;
                RawOperand::Other
            }
        };
        if at > code.len() {
            return Err(malformed("operand past end"));
        }

        out.push(RawInstruction {
            offset: start,
            len: at - start,
            opcode,
            operand,
        });
    }
    Ok(out)
}

/// Encodes `opcode <token>` for the one-byte token opcodes.
pub fn with_token(opcode: u16, token: u32) -> [u8; 5] {
    let t = token.to_le_bytes();
    [opcode as u8, t[0], t[1], t[2], t[3]]
}

/// Reads the `#US` heap entry at `index` (ECMA-335 II.24.2.4).
pub fn user_string(heap: &[u8], index: usize) -> Option<String> {
    let mut reader = Reader::new(heap.get(index..)?);
    let len = reader.compressed().ok()? as usize;
    let data = reader.take(len).ok()?;
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

/// A `TypeDefOrRef` coded index found in a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeToken {
    Def(u32),
    Ref(u32),
    Spec(u32),
}

impl TypeToken {
    fn from_coded(value: u32) -> Self {
        let row = value >> 2;
        match value & 0x3 {
            0 => Self::Def(row),
            1 => Self::Ref(row),
            _ => Self::Spec(row),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    pub has_this: bool,
    pub return_type: String,
    pub parameters: Vec<String>,
}

const SIG_HAS_THIS: u8 = 0x20;
const SIG_GENERIC: u8 = 0x10;

const PRIMITIVES: [(u8, &str); 18] = [
    (0x01, "System.Void"),
    (0x02, "System.Boolean"),
    (0x03, "System.Char"),
    (0x04, "System.SByte"),
    (0x05, "System.Byte"),
    (0x06, "System.Int16"),
    (0x07, "System.UInt16"),
    (0x08, "System.Int32"),
    (0x09, "System.UInt32"),
    (0x0A, "System.Int64"),
    (0x0B, "System.UInt64"),
    (0x0C, "System.Single"),
    (0x0D, "System.Double"),
    (0x0E, "System.String"),
    (0x16, "System.TypedReference"),
    (0x18, "System.IntPtr"),
    (0x19, "System.UIntPtr"),
    (0x1C, "System.Object"),
];

/// Element type byte for a primitive type name.
pub fn primitive_element(name: &str) -> Option<u8> {
    PRIMITIVES.iter().find(|(_, n)| *n == name).map(|(e, _)| *e)
}

struct Reader<'b> {
    bytes: &'b [u8],
    at: usize,
}

impl<'b> Reader<'b> {
    fn new(bytes: &'b [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn byte(&mut self) -> Result<u8, PatchError> {
        let value = self.bytes.get(self.at).copied().ok_or_else(|| malformed("signature truncated"))?;
        self.at += 1;
        Ok(value)
    }

    fn take(&mut self, len: usize) -> Result<&'b [u8], PatchError> {
        let slice = self
            .bytes
            .get(self.at..self.at + len)
            .ok_or_else(|| malformed("signature truncated"))?;
        self.at += len;
        Ok(slice)
    }

    fn compressed(&mut self) -> Result<u32, PatchError> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(u32::from(first));
        }
        if first & 0xC0 == 0x80 {
            return Ok((u32::from(first & 0x3F) << 8) | u32::from(self.byte()?));
        }
        let rest = self.take(3)?;
        Ok((u32::from(first & 0x1F) << 24) | (u32::from(rest[0]) << 16) | (u32::from(rest[1]) << 8) | u32::from(rest[2]))
    }

    fn type_name(&mut self, names: &dyn Fn(TypeToken) -> String) -> Result<String, PatchError> {
        let element = self.byte()?;
        if let Some((_, name)) = PRIMITIVES.iter().find(|(e, _)| *e == element) {
            return Ok(name.to_string());
        }
        Ok(match element {
            0x0F => format!("{}*", self.type_name(names)?),
            0x10 => format!("{}&", self.type_name(names)?),
            0x11 | 0x12 => names(TypeToken::from_coded(self.compressed()?)),
            0x13 => format!("!{}", self.compressed()?),
            0x1E => format!("!!{}", self.compressed()?),
            0x1D => format!("{}[]", self.type_name(names)?),
            0x14 => {
                let inner = self.type_name(names)?;
                let rank = self.compressed()?;
                for _ in 0..self.compressed()? {
                    self.compressed()?;
                }
                for _ in 0..self.compressed()? {
                    self.compressed()?;
                }
                format!("{inner}[{}]", ",".repeat(rank.saturating_sub(1) as usize))
            }
            0x15 => {
                let _kind = self.byte()?;
                let generic = names(TypeToken::from_coded(self.compressed()?));
                let count = self.compressed()?;
                let args = (0..count)
                    .map(|_| self.type_name(names))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("{generic}<{}>", args.join(","))
            }
            0x1B => {
                self.method(names)?;
                "method".to_string()
            }
            0x1F | 0x20 => {
                self.compressed()?;
                self.type_name(names)?
            }
            0x45 => self.type_name(names)?,
            other => return Err(malformed(&format!("element type {other:#04x}"))),
        })
    }

    fn method(&mut self, names: &dyn Fn(TypeToken) -> String) -> Result<MethodSig, PatchError> {
        let convention = self.byte()?;
        if convention & SIG_GENERIC != 0 {
            self.compressed()?;
        }
        let count = self.compressed()?;
        let return_type = self.type_name(names)?;
        let mut parameters = Vec::with_capacity(count as usize);
        while parameters.len() < count as usize {
            if self.bytes.get(self.at) == Some(&0x41) {
                self.at += 1;
                continue;
            }
            parameters.push(self.type_name(names)?);
        }
        Ok(MethodSig {
            has_this: convention & SIG_HAS_THIS != 0,
            return_type,
            parameters,
        })
    }
}

/// Decodes a MethodDefSig/MethodRefSig blob into display type names.
pub fn method_sig(blob: &[u8], names: &dyn Fn(TypeToken) -> String) -> Result<MethodSig, PatchError> {
    Reader::new(blob).method(names)
}

/// Decodes a TypeSpec blob into a display name.
pub fn type_spec(blob: &[u8], names: &dyn Fn(TypeToken) -> String) -> Result<String, PatchError> {
    Reader::new(blob).type_name(names)
}
