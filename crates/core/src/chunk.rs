//! Bytecode chunk format (spec §3.5, §6.1): the compiler's output and the
//! runtime's input. A `Chunk` is the unit `gal-compiler` produces per
//! source file and `gal-runtime::load` consumes.

use crate::bytes::{ByteReader, ByteWriter, ReadError};
use thiserror::Error;

pub const CHUNK_VERSION: u8 = 1;

/// Index into a prototype's constant table.
pub type ConstantIndex = u32;
/// Index into a chunk's flat string table.
pub type StringIndex = u32;
/// Index into a chunk's flat prototype table.
pub type PrototypeIndex = u32;

/// A typed constant-table entry (spec §6.1).
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Null,
    Boolean(bool),
    Number(f64),
    String(StringIndex),
    /// `import a.b.c`: up to 3 dotted path segments, each a string ref.
    Import(Vec<StringIndex>),
    /// A table shape constant used by `NewTable` hints: field name refs.
    Table(Vec<StringIndex>),
    /// A nested function reference, resolved against this chunk's
    /// prototype table.
    Closure(PrototypeIndex),
}

impl Constant {
    fn tag(&self) -> u8 {
        match self {
            Constant::Null => 0,
            Constant::Boolean(_) => 1,
            Constant::Number(_) => 2,
            Constant::String(_) => 3,
            Constant::Import(_) => 4,
            Constant::Table(_) => 5,
            Constant::Closure(_) => 6,
        }
    }

    fn write(&self, w: &mut ByteWriter) {
        w.write_u8(self.tag());
        match self {
            Constant::Null => {}
            Constant::Boolean(b) => w.write_u8(*b as u8),
            Constant::Number(n) => w.write_f64le(*n),
            Constant::String(s) => w.write_varint(*s as u64),
            Constant::Import(parts) => {
                w.write_varint(parts.len() as u64);
                for p in parts {
                    w.write_varint(*p as u64);
                }
            }
            Constant::Table(fields) => {
                w.write_varint(fields.len() as u64);
                for f in fields {
                    w.write_varint(*f as u64);
                }
            }
            Constant::Closure(idx) => w.write_varint(*idx as u64),
        }
    }

    fn read(r: &mut ByteReader) -> Result<Constant, ChunkError> {
        Ok(match r.read_u8()? {
            0 => Constant::Null,
            1 => Constant::Boolean(r.read_u8()? != 0),
            2 => Constant::Number(r.read_f64le()?),
            3 => Constant::String(r.read_varint()? as u32),
            4 => {
                let n = r.read_varint()?;
                let mut parts = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    parts.push(r.read_varint()? as u32);
                }
                Constant::Import(parts)
            }
            5 => {
                let n = r.read_varint()?;
                let mut fields = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    fields.push(r.read_varint()? as u32);
                }
                Constant::Table(fields)
            }
            6 => Constant::Closure(r.read_varint()? as u32),
            tag => return Err(ChunkError::UnknownConstantTag(tag)),
        })
    }
}

/// Per-instruction source line, delta-encoded from a baseline re-stamped
/// every `1 << gap_log2` instructions (spec §3.5, §4.9).
#[derive(Debug, Clone, PartialEq)]
pub struct LineInfo {
    pub gap_log2: u8,
    pub absolute: Vec<i32>,
    pub deltas: Vec<i8>,
}

impl LineInfo {
    /// Build from a flat per-instruction line number list.
    pub fn build(lines: &[i32], gap_log2: u8) -> LineInfo {
        let gap = 1usize << gap_log2;
        let mut absolute = Vec::with_capacity(lines.len() / gap + 1);
        let mut deltas = Vec::with_capacity(lines.len());
        let mut baseline = 0i32;
        for (i, &line) in lines.iter().enumerate() {
            if i % gap == 0 {
                baseline = line;
                absolute.push(baseline);
                deltas.push(0);
            } else {
                let delta = line - baseline;
                debug_assert!((-128..=127).contains(&delta), "line delta overflowed i8");
                deltas.push(delta as i8);
            }
        }
        LineInfo { gap_log2, absolute, deltas }
    }

    pub fn line_at(&self, pc: usize) -> i32 {
        let gap = 1usize << self.gap_log2;
        let baseline = self.absolute[pc / gap];
        baseline + self.deltas[pc] as i32
    }
}

/// `(name, begin_pc, end_pc, register)` — a local variable's visible
/// lifetime (spec §3.5).
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVarInfo {
    pub name: StringIndex,
    pub begin_pc: u32,
    pub end_pc: u32,
    pub register: u8,
}

/// An immutable compiled function template (spec §3.5).
#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub max_stack_size: u8,
    pub num_params: u8,
    pub num_upvalues: u8,
    pub is_vararg: bool,
    pub code: Vec<u32>,
    pub constants: Vec<Constant>,
    pub children: Vec<PrototypeIndex>,
    pub line_info: LineInfo,
    pub debug_name: Option<StringIndex>,
    pub locals: Vec<LocalVarInfo>,
    pub upvalue_names: Vec<StringIndex>,
}

impl Prototype {
    fn write(&self, w: &mut ByteWriter) {
        w.write_u8(self.max_stack_size);
        w.write_u8(self.num_params);
        w.write_u8(self.num_upvalues);
        w.write_u8(self.is_vararg as u8);

        w.write_varint(self.code.len() as u64);
        for word in &self.code {
            w.write_u32le(*word);
        }

        w.write_varint(self.constants.len() as u64);
        for c in &self.constants {
            c.write(w);
        }

        w.write_varint(self.children.len() as u64);
        for c in &self.children {
            w.write_varint(*c as u64);
        }

        w.write_u8(self.line_info.gap_log2);
        w.write_varint(self.line_info.absolute.len() as u64);
        for a in &self.line_info.absolute {
            w.write_i32le(*a);
        }
        w.write_varint(self.line_info.deltas.len() as u64);
        for d in &self.line_info.deltas {
            w.write_i8(*d);
        }

        match self.debug_name {
            Some(idx) => {
                w.write_u8(1);
                w.write_varint(idx as u64);
            }
            None => w.write_u8(0),
        }

        w.write_varint(self.locals.len() as u64);
        for l in &self.locals {
            w.write_varint(l.name as u64);
            w.write_varint(l.begin_pc as u64);
            w.write_varint(l.end_pc as u64);
            w.write_u8(l.register);
        }

        w.write_varint(self.upvalue_names.len() as u64);
        for u in &self.upvalue_names {
            w.write_varint(*u as u64);
        }
    }

    fn read(r: &mut ByteReader) -> Result<Prototype, ChunkError> {
        let max_stack_size = r.read_u8()?;
        let num_params = r.read_u8()?;
        let num_upvalues = r.read_u8()?;
        let is_vararg = r.read_u8()? != 0;

        let code_len = r.read_varint()? as usize;
        let mut code = Vec::with_capacity(code_len);
        for _ in 0..code_len {
            code.push(r.read_u32le()?);
        }

        let const_len = r.read_varint()? as usize;
        let mut constants = Vec::with_capacity(const_len);
        for _ in 0..const_len {
            constants.push(Constant::read(r)?);
        }

        let child_len = r.read_varint()? as usize;
        let mut children = Vec::with_capacity(child_len);
        for _ in 0..child_len {
            children.push(r.read_varint()? as u32);
        }

        let gap_log2 = r.read_u8()?;
        let abs_len = r.read_varint()? as usize;
        let mut absolute = Vec::with_capacity(abs_len);
        for _ in 0..abs_len {
            absolute.push(r.read_i32le()?);
        }
        let delta_len = r.read_varint()? as usize;
        let mut deltas = Vec::with_capacity(delta_len);
        for _ in 0..delta_len {
            deltas.push(r.read_i8()?);
        }

        let debug_name = if r.read_u8()? != 0 {
            Some(r.read_varint()? as u32)
        } else {
            None
        };

        let locals_len = r.read_varint()? as usize;
        let mut locals = Vec::with_capacity(locals_len);
        for _ in 0..locals_len {
            locals.push(LocalVarInfo {
                name: r.read_varint()? as u32,
                begin_pc: r.read_varint()? as u32,
                end_pc: r.read_varint()? as u32,
                register: r.read_u8()?,
            });
        }

        let upvalue_len = r.read_varint()? as usize;
        let mut upvalue_names = Vec::with_capacity(upvalue_len);
        for _ in 0..upvalue_len {
            upvalue_names.push(r.read_varint()? as u32);
        }

        if code_len > 0 && max_stack_size == 0 {
            return Err(ChunkError::Malformed("non-empty code with zero max_stack_size"));
        }

        Ok(Prototype {
            max_stack_size,
            num_params,
            num_upvalues,
            is_vararg,
            code,
            constants,
            children,
            line_info: LineInfo { gap_log2, absolute, deltas },
            debug_name,
            locals,
            upvalue_names,
        })
    }
}

/// A fully-linked compiled program (spec §6.1): a flat string table plus
/// a flat prototype table, with an index identifying the top-level
/// (main) prototype.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub strings: Vec<String>,
    pub prototypes: Vec<Prototype>,
    pub main_prototype: PrototypeIndex,
}

#[derive(Debug, Error, PartialEq)]
pub enum ChunkError {
    #[error("unsupported chunk version {0}")]
    UnsupportedVersion(u8),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("unknown constant tag {0}")]
    UnknownConstantTag(u8),
    #[error("chunk references string index {0} past the string table end")]
    StringIndexOutOfRange(u32),
    #[error("chunk references prototype index {0} past the prototype table end")]
    PrototypeIndexOutOfRange(u32),
    #[error("malformed chunk: {0}")]
    Malformed(&'static str),
}

impl Chunk {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(CHUNK_VERSION);

        w.write_varint(self.strings.len() as u64);
        for s in &self.strings {
            w.write_string(s);
        }

        w.write_varint(self.prototypes.len() as u64);
        for p in &self.prototypes {
            p.write(&mut w);
        }

        w.write_varint(self.main_prototype as u64);
        w.into_bytes()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Chunk, ChunkError> {
        let mut r = ByteReader::new(bytes);
        let version = r.read_u8()?;
        if version != CHUNK_VERSION {
            return Err(ChunkError::UnsupportedVersion(version));
        }

        let string_len = r.read_varint()? as usize;
        let mut strings = Vec::with_capacity(string_len);
        for _ in 0..string_len {
            strings.push(r.read_string()?);
        }

        let proto_len = r.read_varint()? as usize;
        let mut prototypes = Vec::with_capacity(proto_len);
        for _ in 0..proto_len {
            prototypes.push(Prototype::read(&mut r)?);
        }

        let main_prototype = r.read_varint()? as u32;

        let chunk = Chunk { strings, prototypes, main_prototype };
        chunk.validate()?;
        Ok(chunk)
    }

    fn validate(&self) -> Result<(), ChunkError> {
        if self.main_prototype as usize >= self.prototypes.len() {
            return Err(ChunkError::PrototypeIndexOutOfRange(self.main_prototype));
        }
        for p in &self.prototypes {
            for child in &p.children {
                if *child as usize >= self.prototypes.len() {
                    return Err(ChunkError::PrototypeIndexOutOfRange(*child));
                }
            }
            for c in &p.constants {
                let check = |idx: u32| -> Result<(), ChunkError> {
                    if idx as usize >= self.strings.len() {
                        Err(ChunkError::StringIndexOutOfRange(idx))
                    } else {
                        Ok(())
                    }
                };
                match c {
                    Constant::String(s) => check(*s)?,
                    Constant::Import(parts) | Constant::Table(parts) => {
                        for p in parts {
                            check(*p)?;
                        }
                    }
                    Constant::Closure(idx) => {
                        if *idx as usize >= self.prototypes.len() {
                            return Err(ChunkError::PrototypeIndexOutOfRange(*idx));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prototype() -> Prototype {
        Prototype {
            max_stack_size: 2,
            num_params: 1,
            num_upvalues: 0,
            is_vararg: false,
            code: vec![0x01, 0x02, 0x03],
            constants: vec![
                Constant::Null,
                Constant::Boolean(true),
                Constant::Number(7.0),
                Constant::String(0),
                Constant::Import(vec![0, 1]),
            ],
            children: vec![],
            line_info: LineInfo::build(&[1, 1, 2], 4),
            debug_name: Some(0),
            locals: vec![LocalVarInfo { name: 1, begin_pc: 0, end_pc: 3, register: 0 }],
            upvalue_names: vec![],
        }
    }

    #[test]
    fn chunk_roundtrips() {
        let chunk = Chunk {
            strings: vec!["main".to_string(), "x".to_string()],
            prototypes: vec![sample_prototype()],
            main_prototype: 0,
        };
        let bytes = chunk.serialize();
        let back = Chunk::deserialize(&bytes).unwrap();
        assert_eq!(chunk, back);
    }

    #[test]
    fn rejects_bad_version() {
        let chunk = Chunk { strings: vec![], prototypes: vec![sample_prototype()], main_prototype: 0 };
        let mut bytes = chunk.serialize();
        bytes[0] = 99;
        assert_eq!(Chunk::deserialize(&bytes), Err(ChunkError::UnsupportedVersion(99)));
    }

    #[test]
    fn rejects_out_of_range_main_prototype() {
        let chunk = Chunk { strings: vec![], prototypes: vec![], main_prototype: 0 };
        let bytes = chunk.serialize();
        assert_eq!(
            Chunk::deserialize(&bytes),
            Err(ChunkError::PrototypeIndexOutOfRange(0))
        );
    }

    #[test]
    fn line_info_recovers_line_numbers() {
        let lines = [10, 10, 10, 11, 12, 12, 20];
        let info = LineInfo::build(&lines, 2); // gap = 4
        for (pc, &line) in lines.iter().enumerate() {
            assert_eq!(info.line_at(pc), line);
        }
    }
}
