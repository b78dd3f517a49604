//! Finite command vocabularies for the interactive session states.
//!
//! The front end only ships raw lines over the review channel; parsing,
//! per-state vocabulary, and typo suggestions live here.

use serde::{Deserialize, Serialize};

/// Commands understood during build interactive review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildCommand {
    /// Freeze the stage list for deployment.
    Accept,
    /// Discard uncommitted output, keep the audit trail.
    Abort,
    /// Regenerate only the targeted stages with a feedback note.
    Regenerate { stages: Vec<usize>, note: String },
    Status,
}

pub const BUILD_VOCABULARY: &[&str] = &["accept", "abort", "regenerate", "status"];

/// Commands understood during the deploy interactive loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployCommand {
    /// Roll back then redeploy a single stage.
    Redeploy { stage: usize },
    /// Retry a failed stage.
    Retry { stage: usize },
    /// Roll back one stage.
    Rollback { stage: usize },
    RollbackAll,
    Cancel,
    Status,
    Done,
}

pub const DEPLOY_VOCABULARY: &[&str] = &[
    "redeploy",
    "retry",
    "rollback",
    "rollback-all",
    "cancel",
    "status",
    "done",
];

/// Why a raw line did not parse, with a nearest-command suggestion when
/// one is close enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    Empty,
    Unknown {
        word: String,
        suggestion: Option<String>,
    },
    BadArguments { command: String, usage: String },
}

impl std::fmt::Display for CommandParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command"),
            Self::Unknown { word, suggestion } => match suggestion {
                Some(candidate) => {
                    write!(f, "unknown command '{word}'; did you mean '{candidate}'?")
                }
                None => write!(f, "unknown command '{word}'"),
            },
            Self::BadArguments { command, usage } => {
                write!(f, "bad arguments for '{command}'; usage: {usage}")
            }
        }
    }
}

fn suggest(typo: &str, vocabulary: &[&str]) -> Option<String> {
    vocabulary
        .iter()
        .map(|cmd| (cmd, strsim::levenshtein(typo, cmd)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by_key(|(_, dist)| *dist)
        .map(|(cmd, _)| (*cmd).to_string())
}

fn parse_stage_list(words: &[&str]) -> Option<Vec<usize>> {
    let stages: Vec<usize> = words
        .iter()
        .take_while(|w| w.parse::<usize>().is_ok())
        .filter_map(|w| w.parse().ok())
        .collect();
    (!stages.is_empty()).then_some(stages)
}

impl BuildCommand {
    /// Parse one raw line from the review channel.
    ///
    /// # Errors
    ///
    /// `CommandParseError` with a levenshtein suggestion for near-misses.
    pub fn parse(line: &str) -> Result<Self, CommandParseError> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err(CommandParseError::Empty);
        };
        let rest: Vec<&str> = words.collect();

        match head {
            "accept" => Ok(Self::Accept),
            "abort" => Ok(Self::Abort),
            "status" => Ok(Self::Status),
            "regenerate" => {
                let Some(stages) = parse_stage_list(&rest) else {
                    return Err(CommandParseError::BadArguments {
                        command: "regenerate".to_string(),
                        usage: "regenerate <stage>... [note]".to_string(),
                    });
                };
                let note = rest[stages.len()..].join(" ");
                Ok(Self::Regenerate { stages, note })
            }
            other => Err(CommandParseError::Unknown {
                word: other.to_string(),
                suggestion: suggest(other, BUILD_VOCABULARY),
            }),
        }
    }
}

impl DeployCommand {
    /// Parse one raw line from the review channel.
    ///
    /// # Errors
    ///
    /// `CommandParseError` with a levenshtein suggestion for near-misses.
    pub fn parse(line: &str) -> Result<Self, CommandParseError> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err(CommandParseError::Empty);
        };
        let rest: Vec<&str> = words.collect();

        let stage_arg = |command: &str| -> Result<usize, CommandParseError> {
            rest.first()
                .and_then(|w| w.parse().ok())
                .ok_or_else(|| CommandParseError::BadArguments {
                    command: command.to_string(),
                    usage: format!("{command} <stage>"),
                })
        };

        match head {
            "redeploy" => Ok(Self::Redeploy {
                stage: stage_arg("redeploy")?,
            }),
            "retry" => Ok(Self::Retry {
                stage: stage_arg("retry")?,
            }),
            "rollback" => Ok(Self::Rollback {
                stage: stage_arg("rollback")?,
            }),
            "rollback-all" => Ok(Self::RollbackAll),
            "cancel" => Ok(Self::Cancel),
            "status" => Ok(Self::Status),
            "done" => Ok(Self::Done),
            other => Err(CommandParseError::Unknown {
                word: other.to_string(),
                suggestion: suggest(other, DEPLOY_VOCABULARY),
            }),
        }
    }
}
