use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Symbolic variable with a bad range or name.
    #[snafu(display("invalid variable {name}[{min}-{max}]: {reason}"))]
    InvalidVariable {
        name: String,
        min: i64,
        max: i64,
        reason: String,
    },

    /// A movement op that can't be applied to the given shape.
    #[snafu(display("invalid {op} on shape {shape}: {reason}"))]
    InvalidMovement {
        op: String,
        shape: String,
        reason: String,
    },

    /// A symbolic variable was bound twice with different values.
    #[snafu(display("value conflicts for {name}, was {was}, set to {new}"))]
    VarValConflict { name: String, was: i64, new: i64 },

    #[snafu(display("buffer {id} is not in the graph"))]
    MissingBuffer { id: usize },

    /// Leaf buffer that is neither realized nor a constant when building buffer ops.
    #[snafu(display("not handled: {what}"))]
    UnknownOp { what: String },

    #[snafu(display("schedule error: {reason}"))]
    Schedule { reason: String },

    /// Post-execution check on a realized buffer failed.
    #[snafu(display("realize error on buffer {id}: {reason}"))]
    Realize { id: usize, reason: String },

    #[snafu(display("{device} backend error: {reason}"))]
    Backend { device: String, reason: String },

    #[snafu(display("dtype mismatch: expected {expected}, got {actual}"))]
    DTypeMismatch { expected: String, actual: String },

    #[snafu(display("bad config value {key}={value}"))]
    Config { key: String, value: String },
}
