//! CLI error taxonomy mapped onto the exit codes spec §6.4 assigns:
//! 0 success, 1 general failure, 2 trust declined, 3 agent unreachable,
//! 4 command timed out.

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Codec(#[from] nc_codec::CodecError),
    #[error("operator declined to trust this agent")]
    TrustDeclined,
    #[error("agent unreachable: {0}")]
    Unreachable(String),
    #[error("command timed out waiting for the agent")]
    Timeout,
    #[error("agent returned an error: {0}")]
    AgentRejected(String),
    #[error("{0}")]
    Other(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::TrustDeclined => 2,
            CliError::Unreachable(_) => 3,
            CliError::Timeout => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_table() {
        assert_eq!(CliError::TrustDeclined.exit_code(), 2);
        assert_eq!(CliError::Unreachable("x".into()).exit_code(), 3);
        assert_eq!(CliError::Timeout.exit_code(), 4);
        assert_eq!(CliError::Other("whatever".into()).exit_code(), 1);
        assert_eq!(CliError::AgentRejected("403".into()).exit_code(), 1);
    }
}
