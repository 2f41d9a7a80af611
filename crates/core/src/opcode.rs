//! The 32-bit instruction word and its opcode vocabulary (spec §4.9, §6.2).
//!
//! A word's low byte is always the opcode; the remaining three bytes hold
//! one of three operand shapes (`ABC`, `AD`, `E`). Decoding an operand
//! shape the opcode doesn't use is a caller bug, not something this module
//! guards against — the interpreter's dispatch table already knows which
//! shape each opcode expects.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every GAL opcode. Selection from spec §4.9's category list; the
/// compiler and interpreter share this single source of truth so the two
/// can never drift on encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Opcode {
    Nop = 0,

    // Loads
    LoadNull,
    LoadBoolean,
    LoadNumber,
    LoadKey,
    LoadKeyExtra,
    LoadImport,
    Move,
    LoadGlobal,
    SetGlobal,
    LoadUpvalue,
    SetUpvalue,
    CloseUpvalues,

    // Tables
    NewTable,
    CopyTable,
    LoadTable,
    SetTable,
    LoadTableStringKey,
    SetTableStringKey,
    LoadTableNumberKey,
    SetTableNumberKey,
    SetList,

    // Closures
    NewClosure,
    Capture,
    CopyClosure,

    // Calls
    Call,
    CallReturn,
    NamedCall,
    FastCall,
    FastCall1,
    FastCall2,
    FastCall2Key,

    // Control flow
    Jump,
    JumpBack,
    JumpIf,
    JumpIfNot,
    JumpIfEq,
    JumpIfLt,
    JumpIfLe,
    JumpIfNe,
    JumpIfNlt,
    JumpIfNle,
    JumpIfEqKey,
    JumpIfNeKey,
    JumpExtra,

    // Arithmetic / bitwise
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulus,
    Pow,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseLeftShift,
    BitwiseRightShift,
    PlusKey,
    MinusKey,
    MultiplyKey,
    DivideKey,
    ModulusKey,
    PowKey,
    BitwiseAndKey,
    BitwiseOrKey,
    BitwiseXorKey,
    BitwiseLeftShiftKey,
    BitwiseRightShiftKey,
    Unm,
    Len,

    // Logical
    LogicalAnd,
    LogicalOr,
    LogicalAndKey,
    LogicalOrKey,
    Not,

    // Loops
    ForNumericLoopPrepare,
    ForNumericLoop,
    ForGenericLoop,
    InextPrepare,
    Inext,
    NextPrepare,
    Next,

    // Misc
    LoadVarargs,
    PrepareVarargs,
    Coverage,
    DebuggerBreak,
    Return,
}

impl Opcode {
    /// Length in 32-bit words, excluding any trailing `Capture`/`AUX`
    /// words that some opcodes require (`NewClosure`'s captures, and the
    /// fixed two-word opcodes listed in spec §6.2).
    pub fn base_len(self) -> u8 {
        use Opcode::*;
        match self {
            LoadTableStringKey | SetTableStringKey | NamedCall | JumpIfEq | JumpIfLt | JumpIfLe
            | JumpIfNe | JumpIfNlt | JumpIfNle | CopyTable | SetList | ForGenericLoop
            | LoadKeyExtra | JumpIfEqKey | JumpIfNeKey | FastCall2Key => 2,
            _ => 1,
        }
    }
}

/// The three admissible 24-bit operand shapes for an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    /// Three unsigned 8-bit fields.
    Abc { a: u8, b: u8, c: u8 },
    /// One unsigned 8-bit field plus one signed 16-bit field.
    Ad { a: u8, d: i16 },
    /// A single signed 24-bit field.
    E { e: i32 },
}

/// A decoded/to-be-encoded 32-bit instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Operands,
}

impl Instruction {
    pub fn abc(opcode: Opcode, a: u8, b: u8, c: u8) -> Instruction {
        Instruction { opcode, operands: Operands::Abc { a, b, c } }
    }

    pub fn ad(opcode: Opcode, a: u8, d: i16) -> Instruction {
        Instruction { opcode, operands: Operands::Ad { a, d } }
    }

    pub fn e(opcode: Opcode, e: i32) -> Instruction {
        assert!((-(1 << 23)..(1 << 23)).contains(&e), "E operand out of 24-bit range");
        Instruction { opcode, operands: Operands::E { e } }
    }

    pub fn encode(self) -> u32 {
        let op = u8::from(self.opcode) as u32;
        match self.operands {
            Operands::Abc { a, b, c } => {
                op | (a as u32) << 8 | (b as u32) << 16 | (c as u32) << 24
            }
            Operands::Ad { a, d } => op | (a as u32) << 8 | ((d as u16 as u32) << 16),
            Operands::E { e } => op | ((e as u32) & 0x00FF_FFFF) << 8,
        }
    }

    /// Decode a word given the operand shape its opcode expects. The
    /// caller supplies the shape because the shape is a property of the
    /// opcode (see spec §6.2), not something recoverable from the bits
    /// alone.
    pub fn decode(word: u32, shape: OperandShape) -> Result<Instruction, DecodeError> {
        let opcode = Opcode::try_from((word & 0xFF) as u8)
            .map_err(|_| DecodeError::UnknownOpcode((word & 0xFF) as u8))?;
        let operands = match shape {
            OperandShape::Abc => Operands::Abc {
                a: ((word >> 8) & 0xFF) as u8,
                b: ((word >> 16) & 0xFF) as u8,
                c: ((word >> 24) & 0xFF) as u8,
            },
            OperandShape::Ad => Operands::Ad {
                a: ((word >> 8) & 0xFF) as u8,
                d: (word >> 16) as i16,
            },
            OperandShape::E => {
                let raw = (word >> 8) & 0x00FF_FFFF;
                // Sign-extend from 24 bits.
                let e = ((raw << 8) as i32) >> 8;
                Operands::E { e }
            }
        };
        Ok(Instruction { opcode, operands })
    }
}

/// Which operand shape a word should be decoded with. Opcodes that are
/// always one shape (the overwhelming majority) are looked up once by the
/// interpreter's dispatch table; this type exists so `decode` doesn't
/// need to hardcode that table itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    Abc,
    Ad,
    E,
}

impl Opcode {
    /// The operand shape this opcode is always emitted with.
    pub fn shape(self) -> OperandShape {
        use Opcode::*;
        match self {
            LoadNumber | LoadKey | LoadImport | Jump | JumpBack | JumpIf | JumpIfNot
            | NewClosure | LoadGlobal | SetGlobal | LoadUpvalue | SetUpvalue
            | PlusKey | MinusKey | MultiplyKey | DivideKey | ModulusKey | PowKey
            | BitwiseAndKey | BitwiseOrKey | BitwiseXorKey | BitwiseLeftShiftKey
            | BitwiseRightShiftKey | LogicalAndKey | LogicalOrKey | NewTable
            | JumpIfEqKey | JumpIfNeKey | ForNumericLoopPrepare | ForNumericLoop => OperandShape::Ad,
            JumpExtra => OperandShape::E,
            _ => OperandShape::Abc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode byte {0:#04x}")]
    UnknownOpcode(u8),
}

/// A `Capture` auxiliary word, one per upvalue, trailing a `NewClosure`
/// instruction (spec §6.2).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum CaptureKind {
    Value = 0,
    Reference = 1,
    Upvalue = 2,
}

/// The builtins a `FastCall`/`FastCall1`/`FastCall2`/`FastCall2Key` is
/// allowed to inline (spec §4.9's fastcall table). Shared between the
/// compiler, which decides when a call site is eligible, and the
/// interpreter, which maps the id back to a host function.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum FastcallBuiltin {
    Assert = 0,
    Typeof,
    RawGet,
    RawSet,
    RawEqual,
    Vector,
    MathAbs,
    MathFloor,
    MathCeil,
    MathSqrt,
    MathMin,
    MathMax,
    BitsBand,
    BitsBor,
    BitsBxor,
    BitsBnot,
    BitsLshift,
    BitsRshift,
    StringSub,
    TableInsert,
    TableUnpack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abc_roundtrip() {
        let ins = Instruction::abc(Opcode::Call, 3, 200, 1);
        let word = ins.encode();
        let decoded = Instruction::decode(word, OperandShape::Abc).unwrap();
        assert_eq!(decoded, ins);
    }

    #[test]
    fn ad_roundtrip_negative() {
        let ins = Instruction::ad(Opcode::Jump, 0, -12345);
        let word = ins.encode();
        let decoded = Instruction::decode(word, OperandShape::Ad).unwrap();
        assert_eq!(decoded, ins);
    }

    #[test]
    fn e_roundtrip_negative() {
        let ins = Instruction::e(Opcode::JumpExtra, -(1 << 20));
        let word = ins.encode();
        let decoded = Instruction::decode(word, OperandShape::E).unwrap();
        assert_eq!(decoded, ins);
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let word = 0xFFu32; // opcode byte 0xFF is never assigned
        assert!(Instruction::decode(word, OperandShape::Abc).is_err());
    }

    #[test]
    fn capture_kind_roundtrip() {
        for k in [CaptureKind::Value, CaptureKind::Reference, CaptureKind::Upvalue] {
            let byte: u8 = k.into();
            assert_eq!(CaptureKind::try_from(byte).unwrap(), k);
        }
    }

    #[test]
    fn fastcall_builtin_roundtrip() {
        for byte in 0..=20u8 {
            let b = FastcallBuiltin::try_from(byte).unwrap();
            assert_eq!(u8::from(b), byte);
        }
        assert!(FastcallBuiltin::try_from(21u8).is_err());
    }
}
