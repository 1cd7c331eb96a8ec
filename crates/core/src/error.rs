use thiserror::Error;

#[derive(Error, Debug)]
pub enum CobaltError {
    #[error("malformed notification: {0}")]
    MalformedNotification(String),

    #[error("invalid config: {0}")]
    Config(String),
}
