mod build;
mod commands;
mod deploy;
mod state;

pub use build::{BuildOutcome, BuildPhase, BuildSession};
pub use commands::{BuildCommand, CommandParseError, DeployCommand};
pub use deploy::{DeployOutcome, DeployPhase, DeploySession};
pub use state::{
    InMemoryStore, InteractionEntry, JsonFileStore, SessionKind, SessionState, SessionStore,
    SESSION_STATE_VERSION,
};
