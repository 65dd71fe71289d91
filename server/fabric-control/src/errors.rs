use thiserror::Error;

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown endpoint id: {0}")]
    UnknownEndpoint(String),

    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    #[error(transparent)]
    Routing(#[from] fabric_routing::RoutingError),

    #[error(transparent)]
    Wire(#[from] fabric_wire::WireError),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
