//! Registration phases of an interceptor chain.

use std::fmt;

/// Slot an interceptor is registered into.
///
/// Chains run `Pre`, then `Once`, then `Main` in registration order, then
/// `Post` in reverse registration order. `Once` entries are consumed by the
/// first emission that snapshots them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Pre,
    Once,
    Main,
    Post,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Pre, Phase::Once, Phase::Main, Phase::Post];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Once => "once",
            Phase::Main => "main",
            Phase::Post => "post",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
