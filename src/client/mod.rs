pub mod connector;
pub mod hub;

pub use connector::{
    classify_reqwest_error, ConnectionTarget, Connector, ConnectorError, DeliveryOutcome,
    HttpTransport, ReqwestTransport, TransportError,
};
pub use hub::{HubClient, RelayMessage, StorageLimitPayload};
