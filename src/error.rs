use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    Config(toml::de::Error),
    InvalidConfig(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "io error: {}", e),
            ServerError::Config(e) => write!(f, "config parse error: {}", e),
            ServerError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> ServerError {
        ServerError::Io(err)
    }
}

impl From<toml::de::Error> for ServerError {
    fn from(err: toml::de::Error) -> ServerError {
        ServerError::Config(err)
    }
}
