#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("config error: {0}")]
    Config(String),

    #[error("client error: {0}")]
    Client(#[from] centrifuge_client::Error),

    #[error("connect failed: {0}")]
    Connect(String),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;
