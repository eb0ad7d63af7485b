/// A token identifier in the engine vocabulary.
pub type Token = i32;

/// A position in a sequence.
pub type Pos = i32;

/// A sequence identifier in the engine's running context.
pub type SeqId = i32;
