//! Opcode catalogue and the fixed-width instruction encoding.
//!
//! An instruction is one opcode byte followed by its operands. Operand widths
//! are fixed per opcode and published by [`Opcode::definition`]; two-byte
//! operands are big-endian. Addresses are absolute byte offsets into the
//! owning [`Instructions`] buffer.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Constant,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    True,
    False,
    Null,
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEquals,
    Not,
    Minus,
    Pop,
    Jump,
    JumpNotTruthy,
    SetGlobal,
    GetGlobal,
    SetLocal,
    GetLocal,
    GetFree,
    GetBuiltin,
    CurrentClosure,
    Array,
    Dict,
    ObjectCall,
    Closure,
    FunctionCall,
    Return,
}

/// Name and operand layout of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Definition {
    pub name: &'static str,
    pub operand_widths: &'static [usize],
}

impl Definition {
    /// Total number of operand bytes following the opcode byte.
    pub fn operand_width(&self) -> usize {
        self.operand_widths.iter().sum()
    }
}

impl Opcode {
    /// Every opcode, indexed by its byte value.
    pub const ALL: [Opcode; 31] = [
        Opcode::Constant,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Mod,
        Opcode::True,
        Opcode::False,
        Opcode::Null,
        Opcode::Equals,
        Opcode::NotEquals,
        Opcode::GreaterThan,
        Opcode::GreaterThanEquals,
        Opcode::Not,
        Opcode::Minus,
        Opcode::Pop,
        Opcode::Jump,
        Opcode::JumpNotTruthy,
        Opcode::SetGlobal,
        Opcode::GetGlobal,
        Opcode::SetLocal,
        Opcode::GetLocal,
        Opcode::GetFree,
        Opcode::GetBuiltin,
        Opcode::CurrentClosure,
        Opcode::Array,
        Opcode::Dict,
        Opcode::ObjectCall,
        Opcode::Closure,
        Opcode::FunctionCall,
        Opcode::Return,
    ];

    pub fn definition(self) -> Definition {
        let (name, operand_widths): (&'static str, &'static [usize]) = match self {
            Opcode::Constant => ("Constant", &[2]),
            Opcode::Add => ("Add", &[]),
            Opcode::Sub => ("Sub", &[]),
            Opcode::Mul => ("Mul", &[]),
            Opcode::Div => ("Div", &[]),
            Opcode::Mod => ("Mod", &[]),
            Opcode::True => ("True", &[]),
            Opcode::False => ("False", &[]),
            Opcode::Null => ("Null", &[]),
            Opcode::Equals => ("Equals", &[]),
            Opcode::NotEquals => ("NotEquals", &[]),
            Opcode::GreaterThan => ("GreaterThan", &[]),
            Opcode::GreaterThanEquals => ("GreaterThanEquals", &[]),
            Opcode::Not => ("Not", &[]),
            Opcode::Minus => ("Minus", &[]),
            Opcode::Pop => ("Pop", &[]),
            Opcode::Jump => ("Jump", &[2]),
            Opcode::JumpNotTruthy => ("JumpNotTruthy", &[2]),
            Opcode::SetGlobal => ("SetGlobal", &[2]),
            Opcode::GetGlobal => ("GetGlobal", &[2]),
            Opcode::SetLocal => ("SetLocal", &[1]),
            Opcode::GetLocal => ("GetLocal", &[1]),
            Opcode::GetFree => ("GetFree", &[1]),
            Opcode::GetBuiltin => ("GetBuiltin", &[1]),
            Opcode::CurrentClosure => ("CurrentClosure", &[]),
            Opcode::Array => ("Array", &[2]),
            Opcode::Dict => ("Dict", &[2]),
            Opcode::ObjectCall => ("ObjectCall", &[]),
            Opcode::Closure => ("Closure", &[2, 1]),
            Opcode::FunctionCall => ("FunctionCall", &[1]),
            Opcode::Return => ("Return", &[]),
        };
        Definition {
            name,
            operand_widths,
        }
    }

    pub fn name(self) -> &'static str {
        self.definition().name
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Opcode::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

/// Encode one instruction. Operands wider than their slot are truncated, so
/// callers range-check them first.
pub fn make(op: Opcode, operands: &[usize]) -> Vec<u8> {
    let definition = op.definition();
    let mut instruction = Vec::with_capacity(1 + definition.operand_width());
    instruction.push(op as u8);
    for (operand, width) in operands.iter().zip(definition.operand_widths) {
        match width {
            2 => instruction.extend_from_slice(&(*operand as u16).to_be_bytes()),
            1 => instruction.push(*operand as u8),
            _ => {}
        }
    }
    instruction
}

/// Decode the operands that follow an opcode byte. Returns the operands and
/// the number of bytes consumed.
pub fn read_operands(definition: &Definition, bytes: &[u8]) -> (Vec<usize>, usize) {
    let mut operands = Vec::with_capacity(definition.operand_widths.len());
    let mut offset = 0;
    for width in definition.operand_widths {
        match width {
            2 => operands.push(read_u16(bytes, offset) as usize),
            1 => operands.push(read_u8(bytes, offset) as usize),
            _ => {}
        }
        offset += width;
    }
    (operands, offset)
}

pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

pub fn read_u8(bytes: &[u8], offset: usize) -> u8 {
    bytes[offset]
}

/// Flat, append-only instruction buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructions(pub Vec<u8>);

impl Instructions {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, offset: usize) -> Option<u8> {
        self.0.get(offset).copied()
    }

    /// Append an encoded instruction, returning its start offset.
    pub fn push(&mut self, instruction: &[u8]) -> usize {
        let position = self.0.len();
        self.0.extend_from_slice(instruction);
        position
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    /// Overwrite the instruction at `position` with one of identical width.
    pub fn replace(&mut self, position: usize, instruction: &[u8]) {
        self.0[position..position + instruction.len()].copy_from_slice(instruction);
    }

    pub fn read_u16(&self, offset: usize) -> usize {
        read_u16(&self.0, offset) as usize
    }

    pub fn read_u8(&self, offset: usize) -> usize {
        read_u8(&self.0, offset) as usize
    }
}

impl From<Vec<Vec<u8>>> for Instructions {
    fn from(parts: Vec<Vec<u8>>) -> Self {
        Instructions(parts.concat())
    }
}

impl fmt::Display for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut offset = 0;
        while offset < self.0.len() {
            let byte = self.0[offset];
            let op = match Opcode::try_from(byte) {
                Ok(op) => op,
                Err(byte) => {
                    writeln!(f, "{offset:04} ERROR: unknown opcode {byte}")?;
                    offset += 1;
                    continue;
                }
            };
            let definition = op.definition();
            if offset + 1 + definition.operand_width() > self.0.len() {
                writeln!(f, "{offset:04} ERROR: truncated {}", definition.name)?;
                break;
            }
            let (operands, read) = read_operands(&definition, &self.0[offset + 1..]);
            write!(f, "{offset:04} {}", definition.name)?;
            for operand in operands {
                write!(f, " {operand}")?;
            }
            writeln!(f)?;
            offset += 1 + read;
        }
        Ok(())
    }
}
