use serde::Serialize;
use std::fmt;

/// Non-blocking, user-facing notification (toast). Never aborts the current action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    FileTooLarge { file_name: String, limit_mb: f64 },
    LimitReached { max: usize, rejected: Vec<String> },
    CompressionSkipped { file_name: String, reason: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::FileTooLarge { file_name, limit_mb } => {
                write!(f, "{file_name} is larger than {limit_mb} MB and was not added")
            }
            Notice::LimitReached { max, rejected } => write!(
                f,
                "You can add up to {max} additional photos; {} not added",
                rejected.join(", ")
            ),
            Notice::CompressionSkipped { file_name, .. } => {
                write!(f, "Could not compress {file_name}; uploading the original")
            }
        }
    }
}
