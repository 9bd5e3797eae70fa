use replay::ReplayError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Replay(#[from] ReplayError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
