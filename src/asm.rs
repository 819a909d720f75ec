//! # Relocatable x86-64 Code Assembler
//!
//! Emits the cave payload as raw machine code. Anything whose value depends
//! on where the fragment ends up (RIP-relative data loads, the re-issued call,
//! the jump back into the original code) is left as a zeroed 4-byte slot and
//! recorded in a placeholder table, much like a linker's relocation list.
//!
//! ## Fragment Layout
//!
//! ```text
//! +-----------------------------+
//! | push rax..r11               |  save caller state
//! | open(marker, flags, mode)   |  lea rdi,[rip+PATH]   <- placeholder
//! | write(fd, msg, len)         |  lea rsi,[rip+MSG]    <- placeholder
//! | close(fd)                   |
//! | pop r11..rax                |  restore
//! | <replayed entry bytes>      |
//! | call rel32 (optional)       |  <- placeholder (CallTarget)
//! | jmp rel32                   |  <- placeholder (ReturnSite)
//! +-----------------------------+  code_len
//! | "marker path\0"             |
//! | "message\0"                 |
//! +-----------------------------+  len
//! ```

use std::fmt;

use serde::Serialize;

use crate::config::LoaderConfig;
use crate::encoding::REL32_WIDTH;

/// Relative call opcode
pub const CALL_REL32: u8 = 0xE8;

/// Relative jump opcode
pub const JMP_REL32: u8 = 0xE9;

/// Size of the `jmp rel32` written over the entry
pub const HOOK_LEN: usize = 1 + REL32_WIDTH;

/// Size of a `call rel32`
pub const CALL_LEN: usize = 1 + REL32_WIDTH;

const SYSCALL: [u8; 2] = [0x0F, 0x05];

pub const SYS_WRITE: u32 = 1;
pub const SYS_OPEN: u32 = 2;
pub const SYS_CLOSE: u32 = 3;

/// General purpose registers the payload touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
}

impl Register {
    /// Hardware register number
    fn code(self) -> u8 {
        match self {
            Register::Rax => 0,
            Register::Rcx => 1,
            Register::Rdx => 2,
            Register::Rsi => 6,
            Register::Rdi => 7,
            Register::R8 => 8,
            Register::R9 => 9,
            Register::R10 => 10,
            Register::R11 => 11,
        }
    }

    fn is_extended(self) -> bool {
        self.code() >= 8
    }

    fn low_bits(self) -> u8 {
        self.code() & 0x7
    }
}

/// Registers clobbered by the payload (syscall itself trashes rcx and r11),
/// pushed in this order and popped in reverse
pub const SAVED_REGISTERS: [Register; 9] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
];

/// Literals appended after the code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataLabel {
    MarkerPath,
    Message,
}

/// What a placeholder's displacement points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaceholderKind {
    /// A literal in the fragment's data region
    Data(DataLabel),
    /// The function the displaced call invoked
    CallTarget,
    /// The first untouched instruction after the hook
    ReturnSite,
}

impl fmt::Display for PlaceholderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceholderKind::Data(DataLabel::MarkerPath) => write!(f, "data:path"),
            PlaceholderKind::Data(DataLabel::Message) => write!(f, "data:message"),
            PlaceholderKind::CallTarget => write!(f, "call-target"),
            PlaceholderKind::ReturnSite => write!(f, "return-site"),
        }
    }
}

/// Unresolved rel32 slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    /// Offset of the 4-byte field within the fragment
    pub position: usize,
    pub kind: PlaceholderKind,
}

/// Assembled but not yet resolved code
#[derive(Debug, Clone)]
pub struct CodeFragment {
    pub(crate) bytes: Vec<u8>,
    pub(crate) placeholders: Vec<Placeholder>,
    code_len: usize,
    data: Vec<(DataLabel, usize)>,
}

impl CodeFragment {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes of instructions, placeholder slots included
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Bytes of appended literals
    pub fn data_len(&self) -> usize {
        self.bytes.len() - self.code_len
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    /// Offset of a literal within the fragment
    pub fn data_offset(&self, label: DataLabel) -> Option<usize> {
        self.data
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, offset)| *offset)
    }
}

/// Byte-level instruction emitter
#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u8>,
    placeholders: Vec<Placeholder>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Copy raw bytes through unchanged
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn slot(&mut self, kind: PlaceholderKind) {
        self.placeholders.push(Placeholder {
            position: self.buf.len(),
            kind,
        });
        self.buf.extend_from_slice(&[0; REL32_WIDTH]);
    }

    pub fn push(&mut self, reg: Register) -> &mut Self {
        if reg.is_extended() {
            self.buf.push(0x41);
        }
        self.buf.push(0x50 + reg.low_bits());
        self
    }

    pub fn pop(&mut self, reg: Register) -> &mut Self {
        if reg.is_extended() {
            self.buf.push(0x41);
        }
        self.buf.push(0x58 + reg.low_bits());
        self
    }

    /// `mov reg, imm32` (REX.W C7 /0, sign-extended)
    pub fn mov_imm32(&mut self, reg: Register, imm: u32) -> &mut Self {
        let rex = 0x48 | u8::from(reg.is_extended());
        self.buf.extend_from_slice(&[rex, 0xC7, 0xC0 | reg.low_bits()]);
        self.buf.extend_from_slice(&imm.to_le_bytes());
        self
    }

    /// `mov dst, src` (REX.W 89 /r)
    pub fn mov_reg(&mut self, dst: Register, src: Register) -> &mut Self {
        let rex = 0x48 | (u8::from(src.is_extended()) << 2) | u8::from(dst.is_extended());
        let modrm = 0xC0 | (src.low_bits() << 3) | dst.low_bits();
        self.buf.extend_from_slice(&[rex, 0x89, modrm]);
        self
    }

    /// `lea reg, [rip + label]`
    pub fn lea_rip(&mut self, reg: Register, label: DataLabel) -> &mut Self {
        let rex = 0x48 | (u8::from(reg.is_extended()) << 2);
        let modrm = 0x05 | (reg.low_bits() << 3);
        self.buf.extend_from_slice(&[rex, 0x8D, modrm]);
        self.slot(PlaceholderKind::Data(label));
        self
    }

    pub fn syscall(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&SYSCALL);
        self
    }

    pub fn call_rel32(&mut self) -> &mut Self {
        self.buf.push(CALL_REL32);
        self.slot(PlaceholderKind::CallTarget);
        self
    }

    pub fn jmp_rel32(&mut self) -> &mut Self {
        self.buf.push(JMP_REL32);
        self.slot(PlaceholderKind::ReturnSite);
        self
    }

    /// Append the literals after the code and seal the fragment
    pub fn finish(self, data: &[(DataLabel, &[u8])]) -> CodeFragment {
        let Assembler {
            mut buf,
            placeholders,
        } = self;
        let code_len = buf.len();

        let mut offsets = Vec::with_capacity(data.len());
        for (label, bytes) in data {
            offsets.push((*label, buf.len()));
            buf.extend_from_slice(bytes);
        }

        CodeFragment {
            bytes: buf,
            placeholders,
            code_len,
            data: offsets,
        }
    }
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

/// Build the marker-file payload described by `config`.
///
/// The caller is expected to have run [`LoaderConfig::validate`].
pub fn assemble(config: &LoaderConfig) -> CodeFragment {
    let mut asm = Assembler::new();

    for reg in SAVED_REGISTERS {
        asm.push(reg);
    }

    // fd = open(marker_path, flags, mode)
    asm.lea_rip(Register::Rdi, DataLabel::MarkerPath)
        .mov_imm32(Register::Rsi, config.open_flags)
        .mov_imm32(Register::Rdx, config.open_mode)
        .mov_imm32(Register::Rax, SYS_OPEN)
        .syscall()
        .mov_reg(Register::R8, Register::Rax);

    // write(fd, message, len)
    asm.mov_reg(Register::Rdi, Register::R8)
        .lea_rip(Register::Rsi, DataLabel::Message)
        .mov_imm32(Register::Rdx, config.message.len() as u32)
        .mov_imm32(Register::Rax, SYS_WRITE)
        .syscall();

    // close(fd)
    asm.mov_reg(Register::Rdi, Register::R8)
        .mov_imm32(Register::Rax, SYS_CLOSE)
        .syscall();

    for reg in SAVED_REGISTERS.iter().rev() {
        asm.pop(*reg);
    }

    asm.raw(&config.replayed);
    if config.call_target.is_some() {
        asm.call_rel32();
    }
    asm.jmp_rel32();

    let path = nul_terminated(&config.marker_path);
    let message = nul_terminated(&config.message);
    asm.finish(&[
        (DataLabel::MarkerPath, path.as_slice()),
        (DataLabel::Message, message.as_slice()),
    ])
}
