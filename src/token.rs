//! Opaque per-fd registration key, handed out by the `EventLoop` and used
//! to index its internal channel/state tables. Plays the role the
//! original's raw `Channel*` back-pointer plays, without the raw pointer:
//! grounded on `mio`'s `Token` (`src/token.rs` in the modern layout),
//! generalized here to double as the loop's internal slot key.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl From<usize> for Token {
    fn from(v: usize) -> Self {
        Token(v)
    }
}

impl From<Token> for usize {
    fn from(t: Token) -> Self {
        t.0
    }
}

/// Reserved token for the loop's own wake-up fd.
pub const WAKEUP_TOKEN: Token = Token(usize::MAX);
