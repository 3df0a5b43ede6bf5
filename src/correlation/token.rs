use std::fmt;

/// The correlation token attached to an operation and returned on its completion.
///
/// The low 32 bits address a slot in the [super::CorrelationTable], the high 32 bits carry the
/// sequence number the slot was registered under. A slot index is reused once its request is
/// removed, the sequence number is what tells a stale token apart from the current occupant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    pub(super) fn new(index: u32, sequence: u32) -> Token {
        Token(((sequence as u64) << 32) | index as u64)
    }

    /// Rebuild a token from the raw value a completion carried.
    pub fn from_raw(raw: u64) -> Token {
        Token(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(super) fn index(&self) -> usize {
        (self.0 & u32::MAX as u64) as usize
    }

    pub(super) fn sequence(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}#{})", self.index(), self.sequence())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<Token> for u64 {
    fn from(token: Token) -> u64 {
        token.0
    }
}
