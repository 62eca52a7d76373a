use thiserror::Error;

use crate::tcache::CodeAddr;

/// Rejected [`crate::JitConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one translation cache buffer is required")]
    NoBuffers,

    #[error("translation cache buffer {index}: {reason}")]
    Buffer { index: usize, reason: &'static str },

    #[error("code region {index}: {reason}")]
    Region { index: usize, reason: &'static str },

    #[error("invalid limit `{name}`: {reason}")]
    Limit {
        name: &'static str,
        reason: &'static str,
    },
}

/// Soft failure of a single translation attempt.
///
/// The runtime recovers from these by flushing the target buffer and retrying once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("translation cache buffer {tcache} has no room for the generated code")]
    CodeBufferFull { tcache: usize },

    #[error("translation cache buffer {tcache} has no free block descriptor or entry slot")]
    DescriptorTableFull { tcache: usize },

    #[error("no guest code mapped at pc {pc:#010x}")]
    InvalidPc { pc: u32 },
}

/// Malformed bytes in the host code arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HostDecodeError {
    #[error("invalid host opcode {opcode:#04x} at {at:#x}")]
    InvalidOpcode { at: CodeAddr, opcode: u8 },

    #[error("invalid host operand {value:#04x} at {at:#x}")]
    InvalidOperand { at: CodeAddr, value: u8 },

    #[error("host instruction at {at:#x} runs past the end of the code arena")]
    Truncated { at: CodeAddr },

    #[error("host call or save stack fault at {at:#x}")]
    StackFault { at: CodeAddr },
}

/// Errors surfaced from [`crate::Jit`].
///
/// Apart from [`JitError::NoCode`], every variant is fatal for the emulated CPU: the embedder is
/// expected to stop executing it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitError {
    #[error("failed to translate block at {pc:#010x} after flushing translation cache buffer {tcache}: {source}")]
    TranslationFailed {
        pc: u32,
        tcache: usize,
        #[source]
        source: TranslateError,
    },

    /// Nothing translatable at `pc`. [`crate::Jit::execute`] handles this by returning to the
    /// embedder with the guest PC left at `pc`.
    #[error("no translatable guest code at {pc:#010x}")]
    NoCode { pc: u32 },

    #[error("corrupt translated code: {0}")]
    CorruptCode(#[from] HostDecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = JitError> = std::result::Result<T, E>;
